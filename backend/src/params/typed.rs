//! Native typed-parameter layout

use std::borrow::Cow;
use std::ffi::CStr;
use std::fmt;
use std::os::raw::{c_char, c_double, c_int, c_longlong, c_uint, c_ulonglong};

use serde::{Deserialize, Serialize};

/// Size of the fixed field-name buffer, terminator included
pub const TYPED_PARAM_FIELD_LENGTH: usize = 80;

/// Kind tag of a typed parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypedParamKind {
    Int,
    UInt,
    LLong,
    ULLong,
    Double,
    Boolean,
    String,
}

impl TypedParamKind {
    pub const ALL: [TypedParamKind; 7] = [
        TypedParamKind::Int,
        TypedParamKind::UInt,
        TypedParamKind::LLong,
        TypedParamKind::ULLong,
        TypedParamKind::Double,
        TypedParamKind::Boolean,
        TypedParamKind::String,
    ];

    /// Native tag value
    pub fn code(self) -> c_int {
        match self {
            TypedParamKind::Int => 1,
            TypedParamKind::UInt => 2,
            TypedParamKind::LLong => 3,
            TypedParamKind::ULLong => 4,
            TypedParamKind::Double => 5,
            TypedParamKind::Boolean => 6,
            TypedParamKind::String => 7,
        }
    }

    pub fn from_code(code: c_int) -> Option<Self> {
        match code {
            1 => Some(TypedParamKind::Int),
            2 => Some(TypedParamKind::UInt),
            3 => Some(TypedParamKind::LLong),
            4 => Some(TypedParamKind::ULLong),
            5 => Some(TypedParamKind::Double),
            6 => Some(TypedParamKind::Boolean),
            7 => Some(TypedParamKind::String),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TypedParamKind::Int => "int",
            TypedParamKind::UInt => "uint",
            TypedParamKind::LLong => "llong",
            TypedParamKind::ULLong => "ullong",
            TypedParamKind::Double => "double",
            TypedParamKind::Boolean => "boolean",
            TypedParamKind::String => "string",
        }
    }
}

impl fmt::Display for TypedParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value storage; which member is live depends on the kind tag
#[repr(C)]
#[derive(Clone, Copy)]
pub union TypedParameterValue {
    pub i: c_int,
    pub ui: c_uint,
    pub l: c_longlong,
    pub ul: c_ulonglong,
    pub d: c_double,
    pub b: c_char,
    pub s: *mut c_char,
}

/// One native typed parameter
///
/// Plain data: it does not free its string payload. Ownership of payloads
/// lives with [`TypedParamSet`](crate::params::TypedParamSet).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TypedParameter {
    pub field: [c_char; TYPED_PARAM_FIELD_LENGTH],
    pub type_: c_int,
    pub value: TypedParameterValue,
}

/// Borrowed, kind-resolved view of a parameter's value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue<'a> {
    Int(i32),
    UInt(u32),
    LLong(i64),
    ULLong(u64),
    Double(f64),
    Boolean(bool),
    /// `None` for a null payload
    String(Option<&'a CStr>),
    /// Tag outside the known range
    Unknown(c_int),
}

impl TypedParameter {
    /// Empty slot for the native side to fill
    pub fn zeroed() -> Self {
        TypedParameter {
            field: [0; TYPED_PARAM_FIELD_LENGTH],
            type_: 0,
            value: TypedParameterValue { ul: 0 },
        }
    }

    /// Field-name bytes up to the terminator
    pub fn field_bytes(&self) -> &[u8] {
        // SAFETY: c_char and u8 have identical size and alignment
        let bytes: &[u8; TYPED_PARAM_FIELD_LENGTH] =
            unsafe { &*(&self.field as *const [c_char; TYPED_PARAM_FIELD_LENGTH]).cast() };
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        &bytes[..end]
    }

    pub fn field_name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.field_bytes())
    }

    pub fn kind(&self) -> Option<TypedParamKind> {
        TypedParamKind::from_code(self.type_)
    }

    /// Read the live union member selected by the tag
    pub fn value(&self) -> ParamValue<'_> {
        // SAFETY: the tag selects the member the producer wrote; string
        // payloads are null or NUL-terminated for the lifetime of `self`
        unsafe {
            match self.kind() {
                Some(TypedParamKind::Int) => ParamValue::Int(self.value.i),
                Some(TypedParamKind::UInt) => ParamValue::UInt(self.value.ui),
                Some(TypedParamKind::LLong) => ParamValue::LLong(self.value.l),
                Some(TypedParamKind::ULLong) => ParamValue::ULLong(self.value.ul),
                Some(TypedParamKind::Double) => ParamValue::Double(self.value.d),
                Some(TypedParamKind::Boolean) => ParamValue::Boolean(self.value.b != 0),
                Some(TypedParamKind::String) => {
                    let s = self.value.s;
                    ParamValue::String(if s.is_null() {
                        None
                    } else {
                        Some(CStr::from_ptr(s))
                    })
                }
                None => ParamValue::Unknown(self.type_),
            }
        }
    }

    /// Owned string payload, if any
    pub(crate) fn string_payload(&self) -> Option<*mut c_char> {
        if self.type_ == TypedParamKind::String.code() {
            // SAFETY: the tag says `s` is the live member
            let s = unsafe { self.value.s };
            (!s.is_null()).then_some(s)
        } else {
            None
        }
    }
}

impl fmt::Debug for TypedParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedParameter")
            .field("field", &self.field_name())
            .field("value", &self.value())
            .finish()
    }
}
