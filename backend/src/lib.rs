//! Virt Bridge Core - Rust Engine
//!
//! Typed-parameter marshaling and event-dispatch bridge between a
//! dynamically-typed host interpreter and the native hypervisor library.
//!
//! # Architecture
//!
//! - **host**: Dynamic host values, callables, and interpreter access
//! - **params**: Typed-parameter codec (native array <-> host dict)
//! - **objects**: Reference-counted native object handles
//! - **events**: Event-loop binding, callback registration and dispatch
//! - **stream**: Stream send/receive over byte buffers
//! - **sys**: Native library entry points (feature `libvirt`)
//! - **ffi**: Python bindings (feature `pyo3`)
//!
//! # Critical Invariants
//!
//! 1. A typed-parameter array never leaves the call frame that allocated it
//! 2. Every native -> host crossing holds the interpreter for its whole duration
//! 3. Foreign-owned memory is released exactly once on every exit path

// Module declarations
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod objects;
pub mod params;
pub mod stream;

#[cfg(feature = "libvirt")]
pub mod sys;

// Re-exports for convenience
pub use config::BridgeConfig;
pub use error::{BridgeError, EmptyInput, HostError, HostErrorKind, Result, SchemaViolation};
pub use events::{
    Capsule, CapsuleKind, ConnectEvents, DomainEventId, EventBridge, EventImplTable,
    EventLoopBinding, EventLoopRegistrar, NetworkEventId, StreamEvents,
};
pub use host::{
    allow_threads, HostCallable, HostDict, HostFunction, HostNamespace, HostObject, HostValue,
    Interpreter, LocalInterpreter, MethodTable, StaticNamespace, ThreadState,
};
pub use objects::{BorrowedObject, ObjectKind, ObjectOps, OwnedObject};
pub use params::{
    decode, encode_inferred, encode_with_schema, get_parameters, set_parameters, ParamValue,
    ParameterFamily, SchemaHint, TypedParamKind, TypedParamSet, TypedParameter,
};
pub use stream::{stream_recv, stream_send, RecvOutcome, SendOutcome, StreamIo};

// FFI module (when feature enabled)
#[cfg(feature = "pyo3")]
pub mod ffi;

// PyO3 exports (when feature enabled)
#[cfg(feature = "pyo3")]
use pyo3::prelude::*;

#[cfg(feature = "pyo3")]
#[pymodule]
fn virt_bridge_core_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<ffi::types::PyNativeCapsule>()?;
    m.add_class::<ffi::types::PyNativeHandle>()?;
    m.add_class::<ffi::params::PyTypedParams>()?;
    m.add_function(wrap_pyfunction!(ffi::events::py_configure, m)?)?;
    m.add_function(wrap_pyfunction!(ffi::events::py_event_register_impl, m)?)?;
    m.add_function(wrap_pyfunction!(ffi::events::py_event_invoke_handle_callback, m)?)?;
    m.add_function(wrap_pyfunction!(ffi::events::py_event_invoke_timeout_callback, m)?)?;
    m.add_function(wrap_pyfunction!(ffi::events::py_event_add_handle, m)?)?;
    m.add_function(wrap_pyfunction!(ffi::events::py_event_add_timeout, m)?)?;
    m.add_function(wrap_pyfunction!(ffi::params::py_typed_params_decode, m)?)?;
    m.add_function(wrap_pyfunction!(ffi::params::py_typed_params_encode, m)?)?;
    m.add_function(wrap_pyfunction!(ffi::params::py_typed_params_infer, m)?)?;
    Ok(())
}
