//! Typed-parameter array -> host dictionary

use std::os::raw::c_int;

use crate::error::{Result, SchemaViolation};
use crate::host::{HostDict, HostValue};
use crate::params::typed::{ParamValue, TypedParameter};

/// Decode a native array into a host dict
///
/// Each entry maps its name to a host value of the matching kind. Unknown
/// kind tags abort the whole decode and nothing partial is returned. When
/// the same name repeats, the last entry wins.
pub fn decode(params: &[TypedParameter]) -> Result<HostDict> {
    let mut info = HostDict::new();
    info.try_reserve(params.len())?;

    for param in params {
        let value = match param.value() {
            ParamValue::Int(v) => HostValue::from(v),
            ParamValue::UInt(v) => HostValue::from(v),
            ParamValue::LLong(v) => HostValue::from(v),
            ParamValue::ULLong(v) => HostValue::from(v),
            ParamValue::Double(v) => HostValue::Float(v),
            ParamValue::Boolean(v) => HostValue::Bool(v),
            ParamValue::String(s) => s
                .map(|s| HostValue::Str(s.to_string_lossy().into_owned()))
                .unwrap_or(HostValue::None),
            ParamValue::Unknown(code) => {
                return Err(SchemaViolation::UnrecognizedKind {
                    field: param.field_name().into_owned(),
                    code,
                }
                .into());
            }
        };
        info.insert(param.field_name().into_owned(), value);
    }

    Ok(info)
}

/// Decode an array owned by the native side
///
/// # Safety
/// `params` must be null (with `nparams <= 0`) or point to `nparams`
/// initialized entries that stay valid for the call.
pub unsafe fn decode_raw(params: *const TypedParameter, nparams: c_int) -> Result<HostDict> {
    if params.is_null() || nparams <= 0 {
        return Ok(HostDict::new());
    }
    decode(std::slice::from_raw_parts(params, nparams as usize))
}
