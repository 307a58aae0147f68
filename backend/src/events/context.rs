//! Per-registration callback context
//!
//! The opaque pointer handed to the native side is a leaked `Arc` of the
//! context. The native library gives it back to [`release_context`]
//! exactly once; that drops its reference and, with it, the host data
//! when nothing else holds the context.

use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{BridgeError, HostError, Result};
use crate::events::bridge::BridgeShared;
use crate::host::{HostValue, ThreadState};
use crate::objects::{BorrowedObject, ObjectOps};

pub(crate) struct CallbackContext {
    pub(crate) bridge: Arc<BridgeShared>,
    pub(crate) data: HostValue,
    object_ops: Option<ObjectOps>,
    cancelled: AtomicBool,
}

impl CallbackContext {
    pub(crate) fn new(
        bridge: Arc<BridgeShared>,
        data: HostValue,
        object_ops: Option<ObjectOps>,
    ) -> Arc<Self> {
        Arc::new(CallbackContext {
            bridge,
            data,
            object_ops,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Hand one strong reference to the native side
    pub(crate) fn into_opaque(ctx: Arc<Self>) -> *mut c_void {
        Arc::into_raw(ctx) as *mut c_void
    }

    /// # Safety
    /// `opaque` must be null or come from [`into_opaque`](Self::into_opaque)
    /// and not have been reclaimed yet.
    pub(crate) unsafe fn borrow<'a>(opaque: *mut c_void) -> Option<&'a CallbackContext> {
        opaque.cast::<CallbackContext>().cast_const().as_ref()
    }

    /// # Safety
    /// As for [`borrow`](Self::borrow); afterwards `opaque` is dangling.
    pub(crate) unsafe fn reclaim(opaque: *mut c_void) -> Option<Arc<CallbackContext>> {
        (!opaque.is_null()).then(|| Arc::from_raw(opaque.cast::<CallbackContext>().cast_const()))
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wrap a lent native object for the host, taking a reference of our own
    pub(crate) fn wrap_object(&self, ptr: *mut c_void) -> Result<HostValue> {
        let ops = self
            .object_ops
            .ok_or_else(|| BridgeError::InvalidArgument("context has no object type".to_string()))?;
        // SAFETY: the native side lends `ptr` for the duration of the callback
        let borrowed = unsafe { BorrowedObject::from_raw(ptr, ops) }
            .ok_or_else(|| BridgeError::InvalidArgument("null native object".to_string()))?;
        borrowed.to_owned().map(HostValue::Native)
    }

    /// Report an exception nobody can propagate
    pub(crate) fn report(&self, err: &HostError) {
        self.bridge.interpreter.report(err);
    }
}

/// Native free callback for every opaque produced by
/// [`CallbackContext::into_opaque`]
pub(crate) unsafe extern "C" fn release_context(opaque: *mut c_void) {
    let released = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the native side calls this once per registration
        let Some(ctx) = (unsafe { CallbackContext::reclaim(opaque) }) else {
            return;
        };
        let bridge = Arc::clone(&ctx.bridge);
        let _state = ThreadState::ensure(bridge.interpreter.as_ref());
        drop(ctx);
    }));
    if released.is_err() {
        log::error!("Panic while releasing callback context");
    }
}
