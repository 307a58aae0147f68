//! Typed-parameter codec
//!
//! Converts between the native typed-parameter array (fixed-width name,
//! kind tag, value union) and host dictionaries.
//!
//! # Components
//!
//! - **typed**: `#[repr(C)]` layout and the kind enumeration
//! - **alloc**: string payloads on the native heap
//! - **set**: owned, growable array that frees its payloads exactly once
//! - **decode**: array -> host dict
//! - **encode**: host dict -> array, against a native schema or by inference
//! - **family**: two-phase get/set protocol over native parameter families

pub mod alloc;
pub mod decode;
pub mod encode;
pub mod family;
pub mod set;
pub mod typed;

pub use alloc::live_payloads;
pub use decode::{decode, decode_raw};
pub use encode::{encode_inferred, encode_with_schema, infer_kind, SchemaHint};
pub use family::{get_parameters, set_parameters, ParameterFamily};
pub use set::TypedParamSet;
pub use typed::{
    ParamValue, TypedParamKind, TypedParameter, TypedParameterValue, TYPED_PARAM_FIELD_LENGTH,
};
