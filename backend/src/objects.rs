//! Reference-counted native objects
//!
//! Native callbacks hand the bridge objects (domains, networks, streams)
//! that the native side still owns. Wrapping one for the host takes an
//! extra reference first, so the host wrapper can outlive the callback;
//! the wrapper drops that reference when it goes away.

use std::fmt;
use std::marker::PhantomData;
use std::os::raw::{c_int, c_void};
use std::ptr::NonNull;

use crate::error::{BridgeError, Result};

/// Native add-reference / release entry point
pub type RefFn = unsafe extern "C" fn(*mut c_void) -> c_int;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Connect,
    Domain,
    Network,
    Stream,
}

/// Reference-count operations for one kind of native object
#[derive(Clone, Copy)]
pub struct ObjectOps {
    pub kind: ObjectKind,
    pub add_ref: RefFn,
    pub release: RefFn,
}

impl fmt::Debug for ObjectOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectOps").field("kind", &self.kind).finish()
    }
}

/// Object the native side lent for the duration of a callback
pub struct BorrowedObject<'a> {
    ptr: NonNull<c_void>,
    ops: ObjectOps,
    _callback: PhantomData<&'a c_void>,
}

impl<'a> BorrowedObject<'a> {
    /// # Safety
    /// `ptr` must be null or a live object of the kind `ops` manages,
    /// valid for `'a`.
    pub unsafe fn from_raw(ptr: *mut c_void, ops: ObjectOps) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| BorrowedObject {
            ptr,
            ops,
            _callback: PhantomData,
        })
    }

    /// Take a reference of our own
    pub fn to_owned(&self) -> Result<OwnedObject> {
        // SAFETY: the object is live for 'a per `from_raw`
        let rc = unsafe { (self.ops.add_ref)(self.ptr.as_ptr()) };
        if rc < 0 {
            return Err(BridgeError::native("add_ref", rc));
        }
        Ok(OwnedObject {
            ptr: self.ptr,
            ops: self.ops,
        })
    }
}

/// A native object holding one reference of its own
pub struct OwnedObject {
    ptr: NonNull<c_void>,
    ops: ObjectOps,
}

// SAFETY: native objects are internally synchronized and reference counted
unsafe impl Send for OwnedObject {}
unsafe impl Sync for OwnedObject {}

impl OwnedObject {
    /// Adopt a reference the caller already owns
    ///
    /// # Safety
    /// `ptr` must be null or a live object of the kind `ops` manages, and
    /// the caller must transfer one reference to the returned value.
    pub unsafe fn adopt(ptr: *mut c_void, ops: ObjectOps) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| OwnedObject { ptr, ops })
    }

    pub fn kind(&self) -> ObjectKind {
        self.ops.kind
    }

    /// Raw pointer for passing back to native entry points
    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }
}

impl Clone for OwnedObject {
    fn clone(&self) -> Self {
        // SAFETY: we hold a reference, so the object is live
        let rc = unsafe { (self.ops.add_ref)(self.ptr.as_ptr()) };
        if rc < 0 {
            log::warn!("Failed to add reference to {:?} object", self.ops.kind);
        }
        OwnedObject {
            ptr: self.ptr,
            ops: self.ops,
        }
    }
}

impl Drop for OwnedObject {
    fn drop(&mut self) {
        // SAFETY: releases the reference this value owns
        let rc = unsafe { (self.ops.release)(self.ptr.as_ptr()) };
        if rc < 0 {
            log::warn!("Failed to release {:?} object", self.ops.kind);
        }
    }
}

impl PartialEq for OwnedObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl fmt::Debug for OwnedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnedObject({:?})", self.ops.kind)
    }
}
