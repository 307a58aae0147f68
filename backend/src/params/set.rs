//! Owned typed-parameter arrays

use std::ffi::CString;
use std::fmt;
use std::os::raw::{c_char, c_int};

use crate::error::{BridgeError, Result, SchemaViolation};
use crate::params::alloc;
use crate::params::typed::{
    ParamValue, TypedParamKind, TypedParameter, TypedParameterValue, TYPED_PARAM_FIELD_LENGTH,
};

/// Owned array of typed parameters
///
/// Owns every string payload it holds and releases them on [`free`] or
/// drop, whichever comes first. Payloads a native getter filled into
/// [`zeroed`] slots are released without counting against
/// [`live_payloads`](crate::params::live_payloads). Appending grows the backing storage
/// geometrically; allocation failure surfaces as
/// [`BridgeError::Allocation`] without touching existing entries.
///
/// [`free`]: TypedParamSet::free
/// [`zeroed`]: TypedParamSet::zeroed
///
/// # Example
/// ```
/// use virt_bridge_core_rs::{ParamValue, TypedParamSet};
///
/// let mut params = TypedParamSet::new();
/// params.add_uint("weight", 500).unwrap();
/// params.add_string("device", "/dev/vda").unwrap();
///
/// assert_eq!(params.len(), 2);
/// assert_eq!(params.get("weight"), Some(ParamValue::UInt(500)));
/// params.free();
/// assert!(params.is_empty());
/// ```
#[derive(Default)]
pub struct TypedParamSet {
    params: Vec<TypedParameter>,
    /// Leading entries whose payloads the native library allocated
    native_filled: usize,
}

// SAFETY: string payloads are exclusively owned by the set and live on the
// process-wide C heap
unsafe impl Send for TypedParamSet {}

impl TypedParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut params = Vec::new();
        params.try_reserve_exact(capacity)?;
        Ok(Self {
            params,
            native_filled: 0,
        })
    }

    /// `count` empty slots for a native getter to fill
    pub fn zeroed(count: usize) -> Result<Self> {
        let mut set = Self::with_capacity(count)?;
        set.params.extend((0..count).map(|_| TypedParameter::zeroed()));
        set.native_filled = count;
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn capacity(&self) -> usize {
        self.params.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn as_slice(&self) -> &[TypedParameter] {
        &self.params
    }

    pub fn as_mut_slice(&mut self) -> &mut [TypedParameter] {
        &mut self.params
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TypedParameter> {
        self.params.iter()
    }

    /// Native count of entries
    pub fn native_len(&self) -> Result<c_int> {
        c_int::try_from(self.params.len())
            .map_err(|_| BridgeError::InvalidArgument("too many typed parameters".to_string()))
    }

    /// Drop trailing slots beyond what a native getter reported filling
    pub fn truncate(&mut self, len: usize) {
        if len >= self.params.len() {
            return;
        }
        for index in len..self.params.len() {
            self.release_payload(index);
        }
        self.params.truncate(len);
        self.native_filled = self.native_filled.min(len);
    }

    /// First entry with the given name
    pub fn get(&self, name: &str) -> Option<ParamValue<'_>> {
        self.params
            .iter()
            .find(|p| p.field_bytes() == name.as_bytes())
            .map(TypedParameter::value)
    }

    /// Release every string payload and the array itself. Safe to call
    /// more than once.
    pub fn free(&mut self) {
        for index in 0..self.params.len() {
            self.release_payload(index);
        }
        self.params = Vec::new();
        self.native_filled = 0;
    }

    fn release_payload(&mut self, index: usize) {
        let native = index < self.native_filled;
        let param = &mut self.params[index];
        if let Some(s) = param.string_payload() {
            // SAFETY: payloads in the set are owned by it and released once
            unsafe {
                if native {
                    alloc::free_native(s);
                } else {
                    alloc::free(s);
                }
            }
            param.value.s = std::ptr::null_mut();
        }
    }

    pub fn add_int(&mut self, name: &str, value: i32) -> Result<()> {
        self.push(name, TypedParamKind::Int, TypedParameterValue { i: value })
    }

    pub fn add_uint(&mut self, name: &str, value: u32) -> Result<()> {
        self.push(name, TypedParamKind::UInt, TypedParameterValue { ui: value })
    }

    pub fn add_llong(&mut self, name: &str, value: i64) -> Result<()> {
        self.push(name, TypedParamKind::LLong, TypedParameterValue { l: value })
    }

    pub fn add_ullong(&mut self, name: &str, value: u64) -> Result<()> {
        self.push(name, TypedParamKind::ULLong, TypedParameterValue { ul: value })
    }

    pub fn add_double(&mut self, name: &str, value: f64) -> Result<()> {
        self.push(name, TypedParamKind::Double, TypedParameterValue { d: value })
    }

    pub fn add_boolean(&mut self, name: &str, value: bool) -> Result<()> {
        self.push(
            name,
            TypedParamKind::Boolean,
            TypedParameterValue {
                b: c_char::from(value),
            },
        )
    }

    pub fn add_string(&mut self, name: &str, value: &str) -> Result<()> {
        let field = encode_field(name)?;
        let owned = CString::new(value).map_err(|_| SchemaViolation::InteriorNul {
            field: name.to_string(),
        })?;
        self.params.try_reserve(1)?;
        let payload = alloc::strdup(&owned)?;
        self.params.push(TypedParameter {
            field,
            type_: TypedParamKind::String.code(),
            value: TypedParameterValue { s: payload },
        });
        Ok(())
    }

    fn push(&mut self, name: &str, kind: TypedParamKind, value: TypedParameterValue) -> Result<()> {
        let field = encode_field(name)?;
        self.params.try_reserve(1)?;
        self.params.push(TypedParameter {
            field,
            type_: kind.code(),
            value,
        });
        Ok(())
    }
}

fn encode_field(name: &str) -> Result<[c_char; TYPED_PARAM_FIELD_LENGTH]> {
    let bytes = name.as_bytes();
    if bytes.contains(&0) {
        return Err(SchemaViolation::InteriorNul {
            field: name.to_string(),
        }
        .into());
    }
    if bytes.len() >= TYPED_PARAM_FIELD_LENGTH {
        return Err(SchemaViolation::FieldNameTooLong {
            field: name.to_string(),
            limit: TYPED_PARAM_FIELD_LENGTH - 1,
        }
        .into());
    }
    let mut field = [0 as c_char; TYPED_PARAM_FIELD_LENGTH];
    for (dst, &src) in field.iter_mut().zip(bytes) {
        *dst = src as c_char;
    }
    Ok(field)
}

impl Drop for TypedParamSet {
    fn drop(&mut self) {
        self.free();
    }
}

impl fmt::Debug for TypedParamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.params.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a TypedParamSet {
    type Item = &'a TypedParameter;
    type IntoIter = std::slice::Iter<'a, TypedParameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}
