//! Native callback shapes, capsules, and the native collaborators
//!
//! Everything here mirrors what the native library defines or expects.
//! The collaborator traits ([`EventLoopRegistrar`], [`ConnectEvents`],
//! [`StreamEvents`]) are the seams the bridge calls through; the `libvirt`
//! feature implements them over the real library, tests implement them
//! with in-process fakes.

use std::fmt;
use std::os::raw::{c_char, c_int, c_longlong, c_ulonglong, c_void};

use crate::objects::{ObjectOps, OwnedObject};
use crate::params::TypedParameter;

// ============================================================================
// Event loop
// ============================================================================

pub type EventHandleCallback =
    unsafe extern "C" fn(watch: c_int, fd: c_int, events: c_int, opaque: *mut c_void);
pub type EventTimeoutCallback = unsafe extern "C" fn(timer: c_int, opaque: *mut c_void);
pub type FreeCallback = unsafe extern "C" fn(opaque: *mut c_void);

pub type AddHandleFunc = unsafe extern "C" fn(
    fd: c_int,
    event: c_int,
    cb: EventHandleCallback,
    opaque: *mut c_void,
    ff: Option<FreeCallback>,
) -> c_int;
pub type UpdateHandleFunc = unsafe extern "C" fn(watch: c_int, event: c_int);
pub type RemoveHandleFunc = unsafe extern "C" fn(watch: c_int) -> c_int;
pub type AddTimeoutFunc = unsafe extern "C" fn(
    timeout: c_int,
    cb: EventTimeoutCallback,
    opaque: *mut c_void,
    ff: Option<FreeCallback>,
) -> c_int;
pub type UpdateTimeoutFunc = unsafe extern "C" fn(timer: c_int, timeout: c_int);
pub type RemoveTimeoutFunc = unsafe extern "C" fn(timer: c_int) -> c_int;

/// The six primitives the native library drives its event loop through
#[derive(Clone, Copy)]
pub struct EventImplTable {
    pub add_handle: AddHandleFunc,
    pub update_handle: UpdateHandleFunc,
    pub remove_handle: RemoveHandleFunc,
    pub add_timeout: AddTimeoutFunc,
    pub update_timeout: UpdateTimeoutFunc,
    pub remove_timeout: RemoveTimeoutFunc,
}

impl fmt::Debug for EventImplTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventImplTable")
    }
}

/// Native event-loop entry points
pub trait EventLoopRegistrar: Send + Sync {
    /// Route the native event loop through `table`
    fn register_impl(&self, table: EventImplTable);

    /// Register a handle watch with whatever event loop is installed
    fn add_handle(
        &self,
        fd: c_int,
        events: c_int,
        cb: EventHandleCallback,
        opaque: *mut c_void,
        ff: Option<FreeCallback>,
    ) -> c_int;

    /// Register a timer with whatever event loop is installed
    fn add_timeout(
        &self,
        timeout: c_int,
        cb: EventTimeoutCallback,
        opaque: *mut c_void,
        ff: Option<FreeCallback>,
    ) -> c_int;
}

// ============================================================================
// Capsules
// ============================================================================

#[derive(Clone, Copy)]
enum CapsuleInner {
    HandleCallback(EventHandleCallback),
    TimeoutCallback(EventTimeoutCallback),
    FreeCallback(Option<FreeCallback>),
    Opaque(*mut c_void),
}

/// What a capsule carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapsuleKind {
    HandleCallback,
    TimeoutCallback,
    FreeCallback,
    Opaque,
}

/// Opaque host value carrying a native function pointer or opaque pointer
///
/// The address itself is never exposed; host code can only hand capsules
/// back to the bridge.
#[derive(Clone, Copy)]
pub struct Capsule(CapsuleInner);

// SAFETY: a capsule is an inert address; only the native side that
// produced it dereferences it
unsafe impl Send for Capsule {}
unsafe impl Sync for Capsule {}

impl Capsule {
    pub(crate) fn handle_callback(cb: EventHandleCallback) -> Self {
        Capsule(CapsuleInner::HandleCallback(cb))
    }

    pub(crate) fn timeout_callback(cb: EventTimeoutCallback) -> Self {
        Capsule(CapsuleInner::TimeoutCallback(cb))
    }

    pub(crate) fn free_callback(ff: Option<FreeCallback>) -> Self {
        Capsule(CapsuleInner::FreeCallback(ff))
    }

    pub(crate) fn opaque(ptr: *mut c_void) -> Self {
        Capsule(CapsuleInner::Opaque(ptr))
    }

    pub fn kind(&self) -> CapsuleKind {
        match self.0 {
            CapsuleInner::HandleCallback(_) => CapsuleKind::HandleCallback,
            CapsuleInner::TimeoutCallback(_) => CapsuleKind::TimeoutCallback,
            CapsuleInner::FreeCallback(_) => CapsuleKind::FreeCallback,
            CapsuleInner::Opaque(_) => CapsuleKind::Opaque,
        }
    }

    pub(crate) fn as_handle_callback(&self) -> Option<EventHandleCallback> {
        match self.0 {
            CapsuleInner::HandleCallback(cb) => Some(cb),
            _ => None,
        }
    }

    pub(crate) fn as_timeout_callback(&self) -> Option<EventTimeoutCallback> {
        match self.0 {
            CapsuleInner::TimeoutCallback(cb) => Some(cb),
            _ => None,
        }
    }

    pub(crate) fn as_opaque(&self) -> Option<*mut c_void> {
        match self.0 {
            CapsuleInner::Opaque(ptr) => Some(ptr),
            _ => None,
        }
    }

    fn address(&self) -> usize {
        match self.0 {
            CapsuleInner::HandleCallback(cb) => cb as usize,
            CapsuleInner::TimeoutCallback(cb) => cb as usize,
            CapsuleInner::FreeCallback(ff) => ff.map_or(0, |ff| ff as usize),
            CapsuleInner::Opaque(ptr) => ptr as usize,
        }
    }
}

impl PartialEq for Capsule {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.address() == other.address()
    }
}

impl Eq for Capsule {}

impl fmt::Debug for Capsule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capsule({:?})", self.kind())
    }
}

// ============================================================================
// Domain, network, connection and stream callbacks
// ============================================================================

type Conn = *mut c_void;
type Obj = *mut c_void;
type Opaque = *mut c_void;

pub type DomainLifecycleCallback =
    unsafe extern "C" fn(Conn, Obj, event: c_int, detail: c_int, Opaque) -> c_int;
pub type DomainGenericCallback = unsafe extern "C" fn(Conn, Obj, Opaque) -> c_int;
pub type DomainRtcChangeCallback =
    unsafe extern "C" fn(Conn, Obj, utcoffset: c_longlong, Opaque) -> c_int;
pub type DomainWatchdogCallback = unsafe extern "C" fn(Conn, Obj, action: c_int, Opaque) -> c_int;
pub type DomainIoErrorCallback = unsafe extern "C" fn(
    Conn,
    Obj,
    src_path: *const c_char,
    dev_alias: *const c_char,
    action: c_int,
    Opaque,
) -> c_int;
pub type DomainIoErrorReasonCallback = unsafe extern "C" fn(
    Conn,
    Obj,
    src_path: *const c_char,
    dev_alias: *const c_char,
    action: c_int,
    reason: *const c_char,
    Opaque,
) -> c_int;
pub type DomainGraphicsCallback = unsafe extern "C" fn(
    Conn,
    Obj,
    phase: c_int,
    local: *const GraphicsAddress,
    remote: *const GraphicsAddress,
    auth_scheme: *const c_char,
    subject: *const GraphicsSubject,
    Opaque,
) -> c_int;
pub type DomainBlockJobCallback = unsafe extern "C" fn(
    Conn,
    Obj,
    disk: *const c_char,
    kind: c_int,
    status: c_int,
    Opaque,
) -> c_int;
pub type DomainDiskChangeCallback = unsafe extern "C" fn(
    Conn,
    Obj,
    old_src_path: *const c_char,
    new_src_path: *const c_char,
    dev_alias: *const c_char,
    reason: c_int,
    Opaque,
) -> c_int;
pub type DomainTrayChangeCallback =
    unsafe extern "C" fn(Conn, Obj, dev_alias: *const c_char, reason: c_int, Opaque) -> c_int;
pub type DomainReasonCallback = unsafe extern "C" fn(Conn, Obj, reason: c_int, Opaque) -> c_int;
pub type DomainBalloonChangeCallback =
    unsafe extern "C" fn(Conn, Obj, actual: c_ulonglong, Opaque) -> c_int;
pub type DomainDeviceCallback =
    unsafe extern "C" fn(Conn, Obj, dev_alias: *const c_char, Opaque) -> c_int;
pub type DomainTunableCallback = unsafe extern "C" fn(
    Conn,
    Obj,
    params: *const TypedParameter,
    nparams: c_int,
    Opaque,
) -> c_int;
pub type DomainAgentLifecycleCallback =
    unsafe extern "C" fn(Conn, Obj, state: c_int, reason: c_int, Opaque) -> c_int;

pub type NetworkLifecycleCallback =
    unsafe extern "C" fn(Conn, Obj, event: c_int, detail: c_int, Opaque) -> c_int;
pub type ConnectCloseCallback = unsafe extern "C" fn(Conn, reason: c_int, Opaque);
pub type StreamEventCallback = unsafe extern "C" fn(Obj, events: c_int, Opaque);

/// Graphics endpoint address
#[repr(C)]
pub struct GraphicsAddress {
    pub family: c_int,
    pub node: *const c_char,
    pub service: *const c_char,
}

#[repr(C)]
pub struct GraphicsSubjectIdentity {
    pub kind: *const c_char,
    pub name: *const c_char,
}

#[repr(C)]
pub struct GraphicsSubject {
    pub nidentity: c_int,
    pub identities: *const GraphicsSubjectIdentity,
}

/// Domain event identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DomainEventId {
    Lifecycle = 0,
    Reboot = 1,
    RtcChange = 2,
    Watchdog = 3,
    IoError = 4,
    Graphics = 5,
    IoErrorReason = 6,
    ControlError = 7,
    BlockJob = 8,
    DiskChange = 9,
    TrayChange = 10,
    PmWakeup = 11,
    PmSuspend = 12,
    BalloonChange = 13,
    PmSuspendDisk = 14,
    DeviceRemoved = 15,
    BlockJob2 = 16,
    Tunable = 17,
    AgentLifecycle = 18,
    DeviceAdded = 19,
}

impl DomainEventId {
    pub const ALL: [DomainEventId; 20] = [
        DomainEventId::Lifecycle,
        DomainEventId::Reboot,
        DomainEventId::RtcChange,
        DomainEventId::Watchdog,
        DomainEventId::IoError,
        DomainEventId::Graphics,
        DomainEventId::IoErrorReason,
        DomainEventId::ControlError,
        DomainEventId::BlockJob,
        DomainEventId::DiskChange,
        DomainEventId::TrayChange,
        DomainEventId::PmWakeup,
        DomainEventId::PmSuspend,
        DomainEventId::BalloonChange,
        DomainEventId::PmSuspendDisk,
        DomainEventId::DeviceRemoved,
        DomainEventId::BlockJob2,
        DomainEventId::Tunable,
        DomainEventId::AgentLifecycle,
        DomainEventId::DeviceAdded,
    ];

    pub fn from_raw(id: c_int) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| *e as c_int == id)
    }

    pub fn raw(self) -> c_int {
        self as c_int
    }
}

/// Network event identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum NetworkEventId {
    Lifecycle = 0,
}

impl NetworkEventId {
    pub fn from_raw(id: c_int) -> Option<Self> {
        (id == 0).then_some(NetworkEventId::Lifecycle)
    }

    pub fn raw(self) -> c_int {
        self as c_int
    }
}

/// Domain callback with its concrete signature
#[derive(Clone, Copy)]
pub enum DomainEventCallback {
    Lifecycle(DomainLifecycleCallback),
    /// Reboot and control-error
    Generic(DomainGenericCallback),
    RtcChange(DomainRtcChangeCallback),
    Watchdog(DomainWatchdogCallback),
    IoError(DomainIoErrorCallback),
    IoErrorReason(DomainIoErrorReasonCallback),
    Graphics(DomainGraphicsCallback),
    /// Both block-job ids
    BlockJob(DomainBlockJobCallback),
    DiskChange(DomainDiskChangeCallback),
    TrayChange(DomainTrayChangeCallback),
    /// PM wakeup, suspend and suspend-to-disk
    Reason(DomainReasonCallback),
    BalloonChange(DomainBalloonChangeCallback),
    /// Device removed and added
    Device(DomainDeviceCallback),
    Tunable(DomainTunableCallback),
    AgentLifecycle(DomainAgentLifecycleCallback),
}

impl DomainEventCallback {
    /// Erase the signature for a registration call that takes the generic
    /// callback type
    ///
    /// # Safety
    /// The result must only be invoked by code that calls it back with the
    /// signature matching the registered event id.
    pub unsafe fn as_generic(self) -> DomainGenericCallback {
        use std::mem::transmute;
        match self {
            DomainEventCallback::Lifecycle(f) => transmute::<DomainLifecycleCallback, DomainGenericCallback>(f),
            DomainEventCallback::Generic(f) => f,
            DomainEventCallback::RtcChange(f) => transmute::<DomainRtcChangeCallback, DomainGenericCallback>(f),
            DomainEventCallback::Watchdog(f) => transmute::<DomainWatchdogCallback, DomainGenericCallback>(f),
            DomainEventCallback::IoError(f) => transmute::<DomainIoErrorCallback, DomainGenericCallback>(f),
            DomainEventCallback::IoErrorReason(f) => transmute::<DomainIoErrorReasonCallback, DomainGenericCallback>(f),
            DomainEventCallback::Graphics(f) => transmute::<DomainGraphicsCallback, DomainGenericCallback>(f),
            DomainEventCallback::BlockJob(f) => transmute::<DomainBlockJobCallback, DomainGenericCallback>(f),
            DomainEventCallback::DiskChange(f) => transmute::<DomainDiskChangeCallback, DomainGenericCallback>(f),
            DomainEventCallback::TrayChange(f) => transmute::<DomainTrayChangeCallback, DomainGenericCallback>(f),
            DomainEventCallback::Reason(f) => transmute::<DomainReasonCallback, DomainGenericCallback>(f),
            DomainEventCallback::BalloonChange(f) => transmute::<DomainBalloonChangeCallback, DomainGenericCallback>(f),
            DomainEventCallback::Device(f) => transmute::<DomainDeviceCallback, DomainGenericCallback>(f),
            DomainEventCallback::Tunable(f) => transmute::<DomainTunableCallback, DomainGenericCallback>(f),
            DomainEventCallback::AgentLifecycle(f) => transmute::<DomainAgentLifecycleCallback, DomainGenericCallback>(f),
        }
    }
}

impl fmt::Debug for DomainEventCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DomainEventCallback::Lifecycle(_) => "Lifecycle",
            DomainEventCallback::Generic(_) => "Generic",
            DomainEventCallback::RtcChange(_) => "RtcChange",
            DomainEventCallback::Watchdog(_) => "Watchdog",
            DomainEventCallback::IoError(_) => "IoError",
            DomainEventCallback::IoErrorReason(_) => "IoErrorReason",
            DomainEventCallback::Graphics(_) => "Graphics",
            DomainEventCallback::BlockJob(_) => "BlockJob",
            DomainEventCallback::DiskChange(_) => "DiskChange",
            DomainEventCallback::TrayChange(_) => "TrayChange",
            DomainEventCallback::Reason(_) => "Reason",
            DomainEventCallback::BalloonChange(_) => "BalloonChange",
            DomainEventCallback::Device(_) => "Device",
            DomainEventCallback::Tunable(_) => "Tunable",
            DomainEventCallback::AgentLifecycle(_) => "AgentLifecycle",
        };
        write!(f, "DomainEventCallback::{name}")
    }
}

/// Connection-level event registration
pub trait ConnectEvents: Send + Sync {
    /// Stable identity of the connection, used to key registrations
    fn connection_id(&self) -> usize;

    fn domain_ops(&self) -> ObjectOps;

    fn network_ops(&self) -> ObjectOps;

    /// Whole-connection lifecycle registration; at most one per callback
    fn domain_event_register(
        &self,
        cb: DomainLifecycleCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int;

    fn domain_event_deregister(&self, cb: DomainLifecycleCallback) -> c_int;

    fn domain_event_register_any(
        &self,
        dom: Option<&OwnedObject>,
        event_id: c_int,
        cb: DomainEventCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int;

    fn domain_event_deregister_any(&self, callback_id: c_int) -> c_int;

    fn network_event_register_any(
        &self,
        net: Option<&OwnedObject>,
        event_id: c_int,
        cb: NetworkLifecycleCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int;

    fn network_event_deregister_any(&self, callback_id: c_int) -> c_int;

    fn register_close_callback(
        &self,
        cb: ConnectCloseCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int;

    fn unregister_close_callback(&self, cb: ConnectCloseCallback) -> c_int;
}

/// Stream event registration
pub trait StreamEvents: Send + Sync {
    /// Stable identity of the stream, used to key registrations
    fn stream_id(&self) -> usize;

    fn event_add_callback(
        &self,
        events: c_int,
        cb: StreamEventCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int;

    fn event_remove_callback(&self) -> c_int;
}
