//! Event bridge
//!
//! # Components
//!
//! - **native**: callback signatures, capsules, native collaborator traits
//! - **bridge**: host event-loop binding and the native -> host proxy
//! - **context**: per-registration state handed to the native side
//! - **dispatch**: `extern "C"` callbacks forwarding native events to host
//!   dispatch methods
//! - **registration**: domain/network/close/stream registration and
//!   cancellation
//!
//! # Dispatch choreography
//!
//! Every native -> host crossing:
//! 1. acquires the interpreter for the calling thread
//! 2. wraps lent native objects, taking a reference of its own
//! 3. resolves the dispatch target from the registration context
//! 4. looks up the named method; failure returns -1
//! 5. calls it with the event arguments and the context last; a raised
//!    exception is reported and 0 is returned
//! 6. drops temporaries and releases the interpreter

pub mod bridge;
pub(crate) mod context;
pub mod dispatch;
pub mod native;
pub mod registration;

use std::panic::{catch_unwind, AssertUnwindSafe};

pub use bridge::{global, global_or_init, install_global, native_event_impl, EventBridge, EventLoopBinding};
pub use native::{
    Capsule, CapsuleKind, ConnectEvents, DomainEventCallback, DomainEventId, EventHandleCallback,
    EventImplTable, EventLoopRegistrar, EventTimeoutCallback, FreeCallback, GraphicsAddress,
    GraphicsSubject, GraphicsSubjectIdentity, NetworkEventId, NetworkLifecycleCallback,
    StreamEvents,
};

/// Run `f` at an `extern "C"` boundary; a panic is logged and `fallback`
/// returned instead of unwinding into native code
pub(crate) fn ffi_guard<R>(what: &str, fallback: R, f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            log::error!("Panic in {what} callback");
            fallback
        }
    }
}
