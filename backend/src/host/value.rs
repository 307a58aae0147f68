//! Dynamic host values
//!
//! Mirrors the value kinds the host interpreter exposes: none, booleans,
//! arbitrary-precision integers (bounded here to 128 bits), floats, strings,
//! byte strings, lists, tuples, string-keyed dicts, plus opaque handles the
//! bridge hands out (capsules, callables, host objects, native objects).

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::c_char;

use serde_json::Value as JsonValue;

use crate::events::Capsule;
use crate::host::callable::{HostFunction, HostObjectRef};
use crate::objects::OwnedObject;

/// String-keyed host dictionary
pub type HostDict = HashMap<String, HostValue>;

/// A value as seen by host code
#[derive(Debug, Clone)]
pub enum HostValue {
    None,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<HostValue>),
    Tuple(Vec<HostValue>),
    Dict(HostDict),
    Capsule(Capsule),
    Callable(HostFunction),
    Object(HostObjectRef),
    Native(OwnedObject),
}

impl HostValue {
    /// Host-visible type name, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::None => "NoneType",
            HostValue::Bool(_) => "bool",
            HostValue::Int(_) => "int",
            HostValue::Float(_) => "float",
            HostValue::Str(_) => "str",
            HostValue::Bytes(_) => "bytes",
            HostValue::List(_) => "list",
            HostValue::Tuple(_) => "tuple",
            HostValue::Dict(_) => "dict",
            HostValue::Capsule(_) => "PyCapsule",
            HostValue::Callable(_) => "function",
            HostValue::Object(_) => "object",
            HostValue::Native(_) => "native",
        }
    }

    /// Host truthiness
    pub fn is_truthy(&self) -> bool {
        match self {
            HostValue::None => false,
            HostValue::Bool(b) => *b,
            HostValue::Int(i) => *i != 0,
            HostValue::Float(f) => *f != 0.0,
            HostValue::Str(s) => !s.is_empty(),
            HostValue::Bytes(b) => !b.is_empty(),
            HostValue::List(items) | HostValue::Tuple(items) => !items.is_empty(),
            HostValue::Dict(d) => !d.is_empty(),
            HostValue::Capsule(_)
            | HostValue::Callable(_)
            | HostValue::Object(_)
            | HostValue::Native(_) => true,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, HostValue::None)
    }

    /// Integer view; booleans count as integers like in the host
    pub fn as_int(&self) -> Option<i128> {
        match self {
            HostValue::Int(i) => Some(*i),
            HostValue::Bool(b) => Some(i128::from(*b)),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_int().and_then(|i| i32::try_from(i).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&HostDict> {
        match self {
            HostValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Tuple elements; lists are not accepted
    pub fn as_tuple(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_capsule(&self) -> Option<&Capsule> {
        match self {
            HostValue::Capsule(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&HostFunction> {
        match self {
            HostValue::Callable(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostObjectRef> {
        match self {
            HostValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&OwnedObject> {
        match self {
            HostValue::Native(o) => Some(o),
            _ => None,
        }
    }

    /// Subscript with a string key. Works on dicts and on host objects that
    /// support item access.
    pub fn get_item(&self, key: &str) -> Option<HostValue> {
        match self {
            HostValue::Dict(d) => d.get(key).cloned(),
            HostValue::Object(o) => o.get_item(key),
            _ => None,
        }
    }

    /// Wrap a possibly-null native C string; null becomes `None`
    ///
    /// # Safety
    /// `ptr` must be null or point to a NUL-terminated string that stays
    /// valid for the duration of the call.
    pub unsafe fn from_c_str(ptr: *const c_char) -> HostValue {
        if ptr.is_null() {
            HostValue::None
        } else {
            HostValue::Str(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    }

    /// Plain-data view as JSON; handles and non-finite floats have no
    /// JSON form
    pub fn to_json(&self) -> Option<JsonValue> {
        Some(match self {
            HostValue::None => JsonValue::Null,
            HostValue::Bool(b) => JsonValue::Bool(*b),
            HostValue::Int(i) => {
                if let Ok(v) = i64::try_from(*i) {
                    JsonValue::from(v)
                } else {
                    JsonValue::from(u64::try_from(*i).ok()?)
                }
            }
            HostValue::Float(f) => JsonValue::from(serde_json::Number::from_f64(*f)?),
            HostValue::Str(s) => JsonValue::String(s.clone()),
            HostValue::Bytes(b) => JsonValue::Array(b.iter().map(|x| JsonValue::from(*x)).collect()),
            HostValue::List(items) | HostValue::Tuple(items) => {
                JsonValue::Array(items.iter().map(HostValue::to_json).collect::<Option<_>>()?)
            }
            HostValue::Dict(d) => JsonValue::Object(
                d.iter()
                    .map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                    .collect::<Option<_>>()?,
            ),
            HostValue::Capsule(_)
            | HostValue::Callable(_)
            | HostValue::Object(_)
            | HostValue::Native(_) => return None,
        })
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::None, HostValue::None) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Int(a), HostValue::Int(b)) => a == b,
            (HostValue::Float(a), HostValue::Float(b)) => a == b,
            (HostValue::Str(a), HostValue::Str(b)) => a == b,
            (HostValue::Bytes(a), HostValue::Bytes(b)) => a == b,
            (HostValue::List(a), HostValue::List(b)) => a == b,
            (HostValue::Tuple(a), HostValue::Tuple(b)) => a == b,
            (HostValue::Dict(a), HostValue::Dict(b)) => a == b,
            (HostValue::Capsule(a), HostValue::Capsule(b)) => a == b,
            (HostValue::Callable(a), HostValue::Callable(b)) => a.ptr_eq(b),
            (HostValue::Object(a), HostValue::Object(b)) => std::sync::Arc::ptr_eq(a, b),
            (HostValue::Native(a), HostValue::Native(b)) => a == b,
            _ => false,
        }
    }
}

impl From<JsonValue> for HostValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => HostValue::None,
            JsonValue::Bool(b) => HostValue::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    HostValue::Int(i.into())
                } else if let Some(u) = n.as_u64() {
                    HostValue::Int(u.into())
                } else {
                    HostValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => HostValue::Str(s),
            JsonValue::Array(items) => HostValue::List(items.into_iter().map(Into::into).collect()),
            JsonValue::Object(map) => {
                HostValue::Dict(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

macro_rules! int_into_host {
    ($($t:ty),*) => {
        $(impl From<$t> for HostValue {
            fn from(v: $t) -> Self {
                HostValue::Int(v.into())
            }
        })*
    };
}

int_into_host!(i8, i16, i32, i64, u8, u16, u32, u64, i128);

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Float(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::Str(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::Str(v)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(v: Vec<HostValue>) -> Self {
        HostValue::List(v)
    }
}

impl From<HostDict> for HostValue {
    fn from(v: HostDict) -> Self {
        HostValue::Dict(v)
    }
}

impl From<Capsule> for HostValue {
    fn from(v: Capsule) -> Self {
        HostValue::Capsule(v)
    }
}

impl From<HostFunction> for HostValue {
    fn from(v: HostFunction) -> Self {
        HostValue::Callable(v)
    }
}

impl From<OwnedObject> for HostValue {
    fn from(v: OwnedObject) -> Self {
        HostValue::Native(v)
    }
}
