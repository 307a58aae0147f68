//! Native library entry points
//!
//! Raw declarations plus the implementations of the collaborator traits
//! ([`EventLoopRegistrar`], [`ConnectEvents`], [`StreamEvents`],
//! [`StreamIo`], [`ParameterFamily`]) over the linked library.

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::ptr;

use crate::error::{BridgeError, Result, SchemaViolation};
use crate::events::native::{
    ConnectCloseCallback, DomainEventCallback, DomainGenericCallback, DomainLifecycleCallback,
    EventHandleCallback,
    EventImplTable, EventLoopRegistrar, EventTimeoutCallback, FreeCallback,
    NetworkLifecycleCallback, StreamEventCallback, StreamEvents,
};
use crate::events::{
    native::{AddHandleFunc, AddTimeoutFunc, RemoveHandleFunc, RemoveTimeoutFunc},
    native::{UpdateHandleFunc, UpdateTimeoutFunc},
    ConnectEvents,
};
use crate::objects::{BorrowedObject, ObjectKind, ObjectOps, OwnedObject};
use crate::params::{ParameterFamily, TypedParameter};
use crate::stream::StreamIo;

type Ptr = *mut c_void;

#[link(name = "virt")]
extern "C" {
    fn virEventRegisterImpl(
        add_handle: AddHandleFunc,
        update_handle: UpdateHandleFunc,
        remove_handle: RemoveHandleFunc,
        add_timeout: AddTimeoutFunc,
        update_timeout: UpdateTimeoutFunc,
        remove_timeout: RemoveTimeoutFunc,
    );
    fn virEventAddHandle(
        fd: c_int,
        events: c_int,
        cb: EventHandleCallback,
        opaque: Ptr,
        ff: Option<FreeCallback>,
    ) -> c_int;
    fn virEventAddTimeout(
        timeout: c_int,
        cb: EventTimeoutCallback,
        opaque: Ptr,
        ff: Option<FreeCallback>,
    ) -> c_int;

    fn virConnectRef(conn: Ptr) -> c_int;
    fn virConnectClose(conn: Ptr) -> c_int;
    fn virDomainRef(dom: Ptr) -> c_int;
    fn virDomainFree(dom: Ptr) -> c_int;
    fn virNetworkRef(net: Ptr) -> c_int;
    fn virNetworkFree(net: Ptr) -> c_int;
    fn virStreamRef(st: Ptr) -> c_int;
    fn virStreamFree(st: Ptr) -> c_int;

    fn virConnectDomainEventRegister(
        conn: Ptr,
        cb: DomainLifecycleCallback,
        opaque: Ptr,
        freecb: Option<FreeCallback>,
    ) -> c_int;
    fn virConnectDomainEventDeregister(conn: Ptr, cb: DomainLifecycleCallback) -> c_int;
    fn virConnectDomainEventRegisterAny(
        conn: Ptr,
        dom: Ptr,
        event_id: c_int,
        cb: DomainGenericCallback,
        opaque: Ptr,
        freecb: Option<FreeCallback>,
    ) -> c_int;
    fn virConnectDomainEventDeregisterAny(conn: Ptr, callback_id: c_int) -> c_int;
    fn virConnectNetworkEventRegisterAny(
        conn: Ptr,
        net: Ptr,
        event_id: c_int,
        cb: NetworkLifecycleCallback,
        opaque: Ptr,
        freecb: Option<FreeCallback>,
    ) -> c_int;
    fn virConnectNetworkEventDeregisterAny(conn: Ptr, callback_id: c_int) -> c_int;
    fn virConnectRegisterCloseCallback(
        conn: Ptr,
        cb: ConnectCloseCallback,
        opaque: Ptr,
        freecb: Option<FreeCallback>,
    ) -> c_int;
    fn virConnectUnregisterCloseCallback(conn: Ptr, cb: ConnectCloseCallback) -> c_int;

    fn virStreamEventAddCallback(
        st: Ptr,
        events: c_int,
        cb: StreamEventCallback,
        opaque: Ptr,
        ff: Option<FreeCallback>,
    ) -> c_int;
    fn virStreamEventRemoveCallback(st: Ptr) -> c_int;
    fn virStreamSend(st: Ptr, data: *const c_char, nbytes: libc::size_t) -> c_int;
    fn virStreamRecv(st: Ptr, data: *mut c_char, nbytes: libc::size_t) -> c_int;

    fn virDomainGetSchedulerType(dom: Ptr, nparams: *mut c_int) -> *mut c_char;
    fn virDomainGetSchedulerParametersFlags(
        dom: Ptr,
        params: *mut TypedParameter,
        nparams: *mut c_int,
        flags: c_uint,
    ) -> c_int;
    fn virDomainSetSchedulerParametersFlags(
        dom: Ptr,
        params: *mut TypedParameter,
        nparams: c_int,
        flags: c_uint,
    ) -> c_int;
    fn virDomainGetBlkioParameters(
        dom: Ptr,
        params: *mut TypedParameter,
        nparams: *mut c_int,
        flags: c_uint,
    ) -> c_int;
    fn virDomainSetBlkioParameters(
        dom: Ptr,
        params: *mut TypedParameter,
        nparams: c_int,
        flags: c_uint,
    ) -> c_int;
    fn virDomainGetMemoryParameters(
        dom: Ptr,
        params: *mut TypedParameter,
        nparams: *mut c_int,
        flags: c_uint,
    ) -> c_int;
    fn virDomainSetMemoryParameters(
        dom: Ptr,
        params: *mut TypedParameter,
        nparams: c_int,
        flags: c_uint,
    ) -> c_int;
    fn virDomainGetNumaParameters(
        dom: Ptr,
        params: *mut TypedParameter,
        nparams: *mut c_int,
        flags: c_uint,
    ) -> c_int;
    fn virDomainSetNumaParameters(
        dom: Ptr,
        params: *mut TypedParameter,
        nparams: c_int,
        flags: c_uint,
    ) -> c_int;
    fn virDomainGetInterfaceParameters(
        dom: Ptr,
        device: *const c_char,
        params: *mut TypedParameter,
        nparams: *mut c_int,
        flags: c_uint,
    ) -> c_int;
    fn virDomainSetInterfaceParameters(
        dom: Ptr,
        device: *const c_char,
        params: *mut TypedParameter,
        nparams: c_int,
        flags: c_uint,
    ) -> c_int;
    fn virDomainGetBlockIoTune(
        dom: Ptr,
        disk: *const c_char,
        params: *mut TypedParameter,
        nparams: *mut c_int,
        flags: c_uint,
    ) -> c_int;
    fn virDomainSetBlockIoTune(
        dom: Ptr,
        disk: *const c_char,
        params: *mut TypedParameter,
        nparams: c_int,
        flags: c_uint,
    ) -> c_int;
    fn virNodeGetMemoryParameters(
        conn: Ptr,
        params: *mut TypedParameter,
        nparams: *mut c_int,
        flags: c_uint,
    ) -> c_int;
    fn virNodeSetMemoryParameters(
        conn: Ptr,
        params: *mut TypedParameter,
        nparams: c_int,
        flags: c_uint,
    ) -> c_int;
}

pub const CONNECT_OPS: ObjectOps = ObjectOps {
    kind: ObjectKind::Connect,
    add_ref: virConnectRef,
    release: virConnectClose,
};

pub const DOMAIN_OPS: ObjectOps = ObjectOps {
    kind: ObjectKind::Domain,
    add_ref: virDomainRef,
    release: virDomainFree,
};

pub const NETWORK_OPS: ObjectOps = ObjectOps {
    kind: ObjectKind::Network,
    add_ref: virNetworkRef,
    release: virNetworkFree,
};

pub const STREAM_OPS: ObjectOps = ObjectOps {
    kind: ObjectKind::Stream,
    add_ref: virStreamRef,
    release: virStreamFree,
};

/// Take a reference to a native object of the given kind
///
/// # Safety
/// `ptr` must be null or a live object of the kind `ops` manages.
unsafe fn retain(ptr: Ptr, ops: ObjectOps) -> Option<OwnedObject> {
    BorrowedObject::from_raw(ptr, ops)?.to_owned().ok()
}

fn slots(params: Option<&mut [TypedParameter]>) -> *mut TypedParameter {
    params.map_or(ptr::null_mut(), <[TypedParameter]>::as_mut_ptr)
}

fn native_count(params: &[TypedParameter]) -> Option<c_int> {
    c_int::try_from(params.len()).ok()
}

fn device_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| {
        BridgeError::from(SchemaViolation::InteriorNul {
            field: name.to_string(),
        })
    })
}

// ============================================================================
// Event loop
// ============================================================================

/// The library's process-wide event-loop entry points
#[derive(Debug, Default, Clone, Copy)]
pub struct Libvirt;

impl EventLoopRegistrar for Libvirt {
    fn register_impl(&self, table: EventImplTable) {
        // SAFETY: the trampolines stay valid for the life of the process
        unsafe {
            virEventRegisterImpl(
                table.add_handle,
                table.update_handle,
                table.remove_handle,
                table.add_timeout,
                table.update_timeout,
                table.remove_timeout,
            )
        }
    }

    fn add_handle(
        &self,
        fd: c_int,
        events: c_int,
        cb: EventHandleCallback,
        opaque: *mut c_void,
        ff: Option<FreeCallback>,
    ) -> c_int {
        // SAFETY: `opaque` ownership passes to the library until `ff`
        unsafe { virEventAddHandle(fd, events, cb, opaque, ff) }
    }

    fn add_timeout(
        &self,
        timeout: c_int,
        cb: EventTimeoutCallback,
        opaque: *mut c_void,
        ff: Option<FreeCallback>,
    ) -> c_int {
        // SAFETY: `opaque` ownership passes to the library until `ff`
        unsafe { virEventAddTimeout(timeout, cb, opaque, ff) }
    }
}

// ============================================================================
// Connections
// ============================================================================

pub struct Connection {
    conn: OwnedObject,
}

impl Connection {
    /// # Safety
    /// `ptr` must be null or a live connection.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        retain(ptr, CONNECT_OPS).map(|conn| Connection { conn })
    }

    pub fn as_object(&self) -> &OwnedObject {
        &self.conn
    }

    pub fn node_memory(&self) -> NodeMemoryParameters<'_> {
        NodeMemoryParameters { conn: self }
    }
}

fn object_ptr(obj: Option<&OwnedObject>) -> Ptr {
    obj.map_or(ptr::null_mut(), OwnedObject::as_ptr)
}

impl ConnectEvents for Connection {
    fn connection_id(&self) -> usize {
        self.conn.as_ptr() as usize
    }

    fn domain_ops(&self) -> ObjectOps {
        DOMAIN_OPS
    }

    fn network_ops(&self) -> ObjectOps {
        NETWORK_OPS
    }

    fn domain_event_register(
        &self,
        cb: DomainLifecycleCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int {
        // SAFETY: live connection; `opaque` ownership passes until `ff`
        unsafe { virConnectDomainEventRegister(self.conn.as_ptr(), cb, opaque, Some(ff)) }
    }

    fn domain_event_deregister(&self, cb: DomainLifecycleCallback) -> c_int {
        // SAFETY: live connection
        unsafe { virConnectDomainEventDeregister(self.conn.as_ptr(), cb) }
    }

    fn domain_event_register_any(
        &self,
        dom: Option<&OwnedObject>,
        event_id: c_int,
        cb: DomainEventCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int {
        // SAFETY: the library invokes `cb` with the signature of `event_id`
        unsafe {
            virConnectDomainEventRegisterAny(
                self.conn.as_ptr(),
                object_ptr(dom),
                event_id,
                cb.as_generic(),
                opaque,
                Some(ff),
            )
        }
    }

    fn domain_event_deregister_any(&self, callback_id: c_int) -> c_int {
        // SAFETY: live connection
        unsafe { virConnectDomainEventDeregisterAny(self.conn.as_ptr(), callback_id) }
    }

    fn network_event_register_any(
        &self,
        net: Option<&OwnedObject>,
        event_id: c_int,
        cb: NetworkLifecycleCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int {
        // SAFETY: live connection; `opaque` ownership passes until `ff`
        unsafe {
            virConnectNetworkEventRegisterAny(
                self.conn.as_ptr(),
                object_ptr(net),
                event_id,
                cb,
                opaque,
                Some(ff),
            )
        }
    }

    fn network_event_deregister_any(&self, callback_id: c_int) -> c_int {
        // SAFETY: live connection
        unsafe { virConnectNetworkEventDeregisterAny(self.conn.as_ptr(), callback_id) }
    }

    fn register_close_callback(
        &self,
        cb: ConnectCloseCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int {
        // SAFETY: live connection; `opaque` ownership passes until `ff`
        unsafe { virConnectRegisterCloseCallback(self.conn.as_ptr(), cb, opaque, Some(ff)) }
    }

    fn unregister_close_callback(&self, cb: ConnectCloseCallback) -> c_int {
        // SAFETY: live connection
        unsafe { virConnectUnregisterCloseCallback(self.conn.as_ptr(), cb) }
    }
}

// ============================================================================
// Streams
// ============================================================================

pub struct Stream {
    stream: OwnedObject,
}

impl Stream {
    /// # Safety
    /// `ptr` must be null or a live stream.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        retain(ptr, STREAM_OPS).map(|stream| Stream { stream })
    }
}

impl StreamEvents for Stream {
    fn stream_id(&self) -> usize {
        self.stream.as_ptr() as usize
    }

    fn event_add_callback(
        &self,
        events: c_int,
        cb: StreamEventCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int {
        // SAFETY: live stream; `opaque` ownership passes until `ff`
        unsafe { virStreamEventAddCallback(self.stream.as_ptr(), events, cb, opaque, Some(ff)) }
    }

    fn event_remove_callback(&self) -> c_int {
        // SAFETY: live stream
        unsafe { virStreamEventRemoveCallback(self.stream.as_ptr()) }
    }
}

impl StreamIo for Stream {
    fn send(&self, data: &[u8]) -> c_int {
        // SAFETY: `data` is valid for `data.len()` bytes
        unsafe { virStreamSend(self.stream.as_ptr(), data.as_ptr().cast(), data.len()) }
    }

    fn recv(&self, buf: &mut [u8]) -> c_int {
        // SAFETY: `buf` is writable for `buf.len()` bytes
        unsafe { virStreamRecv(self.stream.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) }
    }
}

// ============================================================================
// Parameter families
// ============================================================================

pub struct Domain {
    dom: OwnedObject,
}

impl Domain {
    /// # Safety
    /// `ptr` must be null or a live domain.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        retain(ptr, DOMAIN_OPS).map(|dom| Domain { dom })
    }

    pub fn as_object(&self) -> &OwnedObject {
        &self.dom
    }

    pub fn scheduler(&self) -> SchedulerParameters<'_> {
        SchedulerParameters { domain: self }
    }

    pub fn blkio(&self) -> BlkioParameters<'_> {
        BlkioParameters { domain: self }
    }

    pub fn memory(&self) -> MemoryParameters<'_> {
        MemoryParameters { domain: self }
    }

    pub fn numa(&self) -> NumaParameters<'_> {
        NumaParameters { domain: self }
    }

    pub fn interface(&self, device: &str) -> Result<InterfaceParameters<'_>> {
        Ok(InterfaceParameters {
            domain: self,
            device: device_name(device)?,
        })
    }

    pub fn block_io_tune(&self, disk: &str) -> Result<BlockIoTuneParameters<'_>> {
        Ok(BlockIoTuneParameters {
            domain: self,
            device: device_name(disk)?,
        })
    }
}

/// Scheduler parameters; the count comes from the scheduler type query
pub struct SchedulerParameters<'a> {
    domain: &'a Domain,
}

impl ParameterFamily for SchedulerParameters<'_> {
    fn get_operation(&self) -> &'static str {
        "virDomainGetSchedulerParametersFlags"
    }

    fn set_operation(&self) -> &'static str {
        "virDomainSetSchedulerParametersFlags"
    }

    fn count(&self, _flags: c_uint) -> Result<usize> {
        let mut nparams: c_int = 0;
        // SAFETY: live domain; the returned string is ours to free
        unsafe {
            let kind = virDomainGetSchedulerType(self.domain.dom.as_ptr(), &mut nparams);
            if kind.is_null() {
                return Err(BridgeError::native("virDomainGetSchedulerType", -1));
            }
            libc::free(kind.cast());
        }
        Ok(usize::try_from(nparams).unwrap_or(0))
    }

    fn get(
        &self,
        params: Option<&mut [TypedParameter]>,
        nparams: &mut c_int,
        flags: c_uint,
    ) -> c_int {
        // SAFETY: `params` holds at least `*nparams` slots when present
        unsafe {
            virDomainGetSchedulerParametersFlags(self.domain.dom.as_ptr(), slots(params), nparams, flags)
        }
    }

    fn set(&self, params: &[TypedParameter], flags: c_uint) -> c_int {
        let Some(nparams) = native_count(params) else {
            return -1;
        };
        // SAFETY: the library only reads `params`
        unsafe {
            virDomainSetSchedulerParametersFlags(
                self.domain.dom.as_ptr(),
                params.as_ptr().cast_mut(),
                nparams,
                flags,
            )
        }
    }
}

macro_rules! domain_family {
    ($(#[$doc:meta])* $name:ident, $get:ident, $set:ident) => {
        $(#[$doc])*
        pub struct $name<'a> {
            domain: &'a Domain,
        }

        impl ParameterFamily for $name<'_> {
            fn get_operation(&self) -> &'static str {
                stringify!($get)
            }

            fn set_operation(&self) -> &'static str {
                stringify!($set)
            }

            fn get(
                &self,
                params: Option<&mut [TypedParameter]>,
                nparams: &mut c_int,
                flags: c_uint,
            ) -> c_int {
                // SAFETY: `params` holds at least `*nparams` slots when present
                unsafe { $get(self.domain.dom.as_ptr(), slots(params), nparams, flags) }
            }

            fn set(&self, params: &[TypedParameter], flags: c_uint) -> c_int {
                let Some(nparams) = native_count(params) else {
                    return -1;
                };
                // SAFETY: the library only reads `params`
                unsafe { $set(self.domain.dom.as_ptr(), params.as_ptr().cast_mut(), nparams, flags) }
            }
        }
    };
}

macro_rules! device_family {
    ($(#[$doc:meta])* $name:ident, $get:ident, $set:ident) => {
        $(#[$doc])*
        pub struct $name<'a> {
            domain: &'a Domain,
            device: CString,
        }

        impl ParameterFamily for $name<'_> {
            fn get_operation(&self) -> &'static str {
                stringify!($get)
            }

            fn set_operation(&self) -> &'static str {
                stringify!($set)
            }

            fn get(
                &self,
                params: Option<&mut [TypedParameter]>,
                nparams: &mut c_int,
                flags: c_uint,
            ) -> c_int {
                // SAFETY: `params` holds at least `*nparams` slots when present
                unsafe {
                    $get(
                        self.domain.dom.as_ptr(),
                        self.device.as_ptr(),
                        slots(params),
                        nparams,
                        flags,
                    )
                }
            }

            fn set(&self, params: &[TypedParameter], flags: c_uint) -> c_int {
                let Some(nparams) = native_count(params) else {
                    return -1;
                };
                // SAFETY: the library only reads `params`
                unsafe {
                    $set(
                        self.domain.dom.as_ptr(),
                        self.device.as_ptr(),
                        params.as_ptr().cast_mut(),
                        nparams,
                        flags,
                    )
                }
            }
        }
    };
}

domain_family!(
    /// Block I/O weights
    BlkioParameters,
    virDomainGetBlkioParameters,
    virDomainSetBlkioParameters
);
domain_family!(
    /// Memory limits
    MemoryParameters,
    virDomainGetMemoryParameters,
    virDomainSetMemoryParameters
);
domain_family!(
    /// NUMA placement
    NumaParameters,
    virDomainGetNumaParameters,
    virDomainSetNumaParameters
);
device_family!(
    /// Per-interface bandwidth
    InterfaceParameters,
    virDomainGetInterfaceParameters,
    virDomainSetInterfaceParameters
);
device_family!(
    /// Per-disk I/O throttling
    BlockIoTuneParameters,
    virDomainGetBlockIoTune,
    virDomainSetBlockIoTune
);

/// Host memory tunables
pub struct NodeMemoryParameters<'a> {
    conn: &'a Connection,
}

impl ParameterFamily for NodeMemoryParameters<'_> {
    fn get_operation(&self) -> &'static str {
        "virNodeGetMemoryParameters"
    }

    fn set_operation(&self) -> &'static str {
        "virNodeSetMemoryParameters"
    }

    fn get(
        &self,
        params: Option<&mut [TypedParameter]>,
        nparams: &mut c_int,
        flags: c_uint,
    ) -> c_int {
        // SAFETY: `params` holds at least `*nparams` slots when present
        unsafe { virNodeGetMemoryParameters(self.conn.conn.as_ptr(), slots(params), nparams, flags) }
    }

    fn set(&self, params: &[TypedParameter], flags: c_uint) -> c_int {
        let Some(nparams) = native_count(params) else {
            return -1;
        };
        // SAFETY: the library only reads `params`
        unsafe {
            virNodeSetMemoryParameters(
                self.conn.conn.as_ptr(),
                params.as_ptr().cast_mut(),
                nparams,
                flags,
            )
        }
    }
}
