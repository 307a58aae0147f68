//! String payloads on the native heap
//!
//! The native library frees typed-parameter strings with the C allocator,
//! so payloads are allocated with it too. A process-wide balance of
//! allocations minus releases makes leaks observable in tests.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicIsize, Ordering};

use crate::error::{BridgeError, Result};

static LIVE_PAYLOADS: AtomicIsize = AtomicIsize::new(0);

/// Net count of payloads allocated minus released through this module
pub fn live_payloads() -> isize {
    LIVE_PAYLOADS.load(Ordering::SeqCst)
}

/// Copy `s` onto the native heap
pub fn strdup(s: &CStr) -> Result<*mut c_char> {
    let bytes = s.to_bytes_with_nul();
    // SAFETY: malloc of a non-zero size; the copy stays within the allocation
    unsafe {
        let ptr = libc::malloc(bytes.len()).cast::<c_char>();
        if ptr.is_null() {
            return Err(BridgeError::Allocation);
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr().cast::<c_char>(), ptr, bytes.len());
        LIVE_PAYLOADS.fetch_add(1, Ordering::SeqCst);
        Ok(ptr)
    }
}

/// Release a payload obtained from [`strdup`]
///
/// # Safety
/// `ptr` must be null or a live allocation from [`strdup`] not freed
/// elsewhere.
pub unsafe fn free(ptr: *mut c_char) {
    if !ptr.is_null() {
        libc::free(ptr.cast());
        LIVE_PAYLOADS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Release a payload the native library allocated. It was never counted,
/// so the live balance is left alone.
///
/// # Safety
/// `ptr` must be null or a live C-heap allocation not freed elsewhere.
pub unsafe fn free_native(ptr: *mut c_char) {
    if !ptr.is_null() {
        libc::free(ptr.cast());
    }
}
