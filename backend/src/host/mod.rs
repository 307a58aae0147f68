//! Host interpreter abstraction
//!
//! The bridge never talks to a concrete interpreter directly. It sees:
//! - [`HostValue`]: the dynamic value model exchanged with host code
//! - [`HostCallable`] / [`HostObject`] / [`HostNamespace`]: things it can call,
//!   look methods up on, or resolve helper functions from
//! - [`Interpreter`]: exclusive access to the interpreter (acquire, release,
//!   temporarily give up around blocking native calls)
//!
//! [`LocalInterpreter`] is an in-process implementation used when no real
//! interpreter is embedded; the `pyo3` feature supplies one backed by the GIL.

pub mod callable;
pub mod interpreter;
pub mod value;

pub use callable::{
    HostCallable, HostFunction, HostNamespace, HostObject, HostObjectRef, MethodTable,
    StaticNamespace,
};
pub use interpreter::{
    allow_threads, Interpreter, LocalInterpreter, SavedThreadState, ThreadState,
    ThreadStateToken,
};
pub use value::{HostDict, HostValue};
