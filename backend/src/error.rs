//! Error taxonomy for the bridge
//!
//! Every failure the codec or the event bridge can produce maps onto one of
//! five categories:
//! - **Allocation**: out of memory while building native or host state
//! - **Schema**: unknown field, wrong host type, unrecognized native kind
//! - **EmptyInput**: empty mapping, or a native schema with nothing settable
//! - **Protocol**: a host event-loop primitive broke its contract
//! - **NativeCall**: the native entry point reported failure (pass-through)
//!
//! Host exceptions travel as [`HostError`] and keep the original exception
//! object as their `source` so the host can re-raise it unchanged.

use std::collections::TryReserveError;
use std::fmt;

use thiserror::Error;

use crate::params::TypedParamKind;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Host exception classes the bridge raises or receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostErrorKind {
    TypeError,
    LookupError,
    ValueError,
    OverflowError,
    MemoryError,
    AttributeError,
    RuntimeError,
}

impl HostErrorKind {
    /// Exception class name as the host spells it
    pub fn name(&self) -> &'static str {
        match self {
            HostErrorKind::TypeError => "TypeError",
            HostErrorKind::LookupError => "LookupError",
            HostErrorKind::ValueError => "ValueError",
            HostErrorKind::OverflowError => "OverflowError",
            HostErrorKind::MemoryError => "MemoryError",
            HostErrorKind::AttributeError => "AttributeError",
            HostErrorKind::RuntimeError => "RuntimeError",
        }
    }
}

impl fmt::Display for HostErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An exception raised by (or destined for) host code
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct HostError {
    pub kind: HostErrorKind,
    pub message: String,
    /// Host-specific exception object, when the error originated in the host
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HostError {
    pub fn new(kind: HostErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::TypeError, message)
    }

    pub fn lookup_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::LookupError, message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::AttributeError, message)
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::RuntimeError, message)
    }
}

/// A typed-parameter conversion that cannot be applied
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaViolation {
    #[error("Attribute name \"{field}\" could not be recognized")]
    UnknownField { field: String },

    #[error("Field \"{field}\" expects {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: TypedParamKind,
        found: &'static str,
    },

    #[error("Value of field \"{field}\" is out of range for {kind}")]
    Overflow { field: String, kind: TypedParamKind },

    #[error("Type value \"{code}\" of field \"{field}\" not recognized")]
    UnrecognizedKind { field: String, code: i32 },

    #[error("Unknown type of \"{field}\" field ({found})")]
    UnsupportedValue { field: String, found: &'static str },

    #[error("Field name \"{field}\" exceeds {limit} bytes")]
    FieldNameTooLong { field: String, limit: usize },

    #[error("Field \"{field}\" contains an interior NUL byte")]
    InteriorNul { field: String },
}

impl SchemaViolation {
    /// Name of the offending field
    pub fn field(&self) -> &str {
        match self {
            SchemaViolation::UnknownField { field }
            | SchemaViolation::TypeMismatch { field, .. }
            | SchemaViolation::Overflow { field, .. }
            | SchemaViolation::UnrecognizedKind { field, .. }
            | SchemaViolation::UnsupportedValue { field, .. }
            | SchemaViolation::FieldNameTooLong { field, .. }
            | SchemaViolation::InteriorNul { field } => field,
        }
    }

    pub fn host_error_kind(&self) -> HostErrorKind {
        match self {
            SchemaViolation::UnknownField { .. } | SchemaViolation::UnrecognizedKind { .. } => {
                HostErrorKind::LookupError
            }
            SchemaViolation::TypeMismatch { .. } | SchemaViolation::UnsupportedValue { .. } => {
                HostErrorKind::TypeError
            }
            SchemaViolation::Overflow { .. } => HostErrorKind::OverflowError,
            SchemaViolation::FieldNameTooLong { .. } | SchemaViolation::InteriorNul { .. } => {
                HostErrorKind::ValueError
            }
        }
    }
}

/// Empty input where at least one entry is required
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EmptyInput {
    /// Caller passed an empty mapping
    #[error("Need non-empty dictionary to set attributes")]
    MappingRequired,

    /// The native schema reports zero fields
    #[error("Object has no settable attributes")]
    NothingSettable,
}

/// Errors produced by the codec and the event bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Out of memory")]
    Allocation,

    #[error(transparent)]
    Schema(#[from] SchemaViolation),

    #[error(transparent)]
    EmptyInput(#[from] EmptyInput),

    #[error("{primitive}: {detail}")]
    Protocol { primitive: String, detail: String },

    #[error("{operation} failed with code {code}")]
    NativeCall { operation: &'static str, code: i32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Host(#[from] HostError),
}

impl BridgeError {
    pub fn native(operation: &'static str, code: i32) -> Self {
        BridgeError::NativeCall { operation, code }
    }

    pub fn protocol(primitive: impl Into<String>, detail: impl Into<String>) -> Self {
        BridgeError::Protocol {
            primitive: primitive.into(),
            detail: detail.into(),
        }
    }

    /// Host exception class this error surfaces as
    pub fn host_error_kind(&self) -> HostErrorKind {
        match self {
            BridgeError::Allocation => HostErrorKind::MemoryError,
            BridgeError::Schema(violation) => violation.host_error_kind(),
            BridgeError::EmptyInput(_) => HostErrorKind::LookupError,
            BridgeError::Protocol { .. } | BridgeError::NativeCall { .. } => {
                HostErrorKind::RuntimeError
            }
            BridgeError::InvalidArgument(_) => HostErrorKind::TypeError,
            BridgeError::Host(err) => err.kind,
        }
    }
}

impl From<TryReserveError> for BridgeError {
    fn from(_: TryReserveError) -> Self {
        BridgeError::Allocation
    }
}

impl From<BridgeError> for HostError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Host(host) => host,
            other => HostError::new(other.host_error_kind(), other.to_string()),
        }
    }
}
