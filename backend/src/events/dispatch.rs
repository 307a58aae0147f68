//! Native callbacks forwarding events into host code
//!
//! Each `extern "C"` function here is registered with the native library
//! together with an opaque pointer to a [`CallbackContext`]. They convert
//! native arguments into host values and hand them to the dispatch method
//! on the registering connection (or stream) proxy.

use std::os::raw::{c_char, c_int, c_longlong, c_ulonglong, c_void};

use crate::error::{HostError, Result};
use crate::events::context::CallbackContext;
use crate::events::ffi_guard;
use crate::events::native::{
    DomainEventCallback, DomainEventId, GraphicsAddress, GraphicsSubject,
};
use crate::host::{HostDict, HostValue, ThreadState};
use crate::params::decode_raw;

pub const DOMAIN_LEGACY: &str = "_dispatchDomainEventCallbacks";
pub const DOMAIN_LIFECYCLE: &str = "_dispatchDomainEventLifecycleCallback";
pub const DOMAIN_GENERIC: &str = "_dispatchDomainEventGenericCallback";
pub const DOMAIN_RTC_CHANGE: &str = "_dispatchDomainEventRTCChangeCallback";
pub const DOMAIN_WATCHDOG: &str = "_dispatchDomainEventWatchdogCallback";
pub const DOMAIN_IO_ERROR: &str = "_dispatchDomainEventIOErrorCallback";
pub const DOMAIN_IO_ERROR_REASON: &str = "_dispatchDomainEventIOErrorReasonCallback";
pub const DOMAIN_GRAPHICS: &str = "_dispatchDomainEventGraphicsCallback";
pub const DOMAIN_BLOCK_JOB: &str = "_dispatchDomainEventBlockJobCallback";
pub const DOMAIN_DISK_CHANGE: &str = "_dispatchDomainEventDiskChangeCallback";
pub const DOMAIN_TRAY_CHANGE: &str = "_dispatchDomainEventTrayChangeCallback";
pub const DOMAIN_PM_WAKEUP: &str = "_dispatchDomainEventPMWakeupCallback";
pub const DOMAIN_PM_SUSPEND: &str = "_dispatchDomainEventPMSuspendCallback";
pub const DOMAIN_BALLOON_CHANGE: &str = "_dispatchDomainEventBalloonChangeCallback";
pub const DOMAIN_PM_SUSPEND_DISK: &str = "_dispatchDomainEventPMSuspendDiskCallback";
pub const DOMAIN_DEVICE_REMOVED: &str = "_dispatchDomainEventDeviceRemovedCallback";
pub const DOMAIN_TUNABLE: &str = "_dispatchDomainEventTunableCallback";
pub const DOMAIN_AGENT_LIFECYCLE: &str = "_dispatchDomainEventAgentLifecycleCallback";
pub const DOMAIN_DEVICE_ADDED: &str = "_dispatchDomainEventDeviceAddedCallback";
pub const NETWORK_LIFECYCLE: &str = "_dispatchNetworkEventLifecycleCallback";
pub const CLOSE: &str = "_dispatchCloseCallback";
pub const STREAM_EVENT: &str = "_dispatchStreamEventCallback";

/// Where a dispatch method is looked up
#[derive(Debug, Clone, Copy)]
pub(crate) enum DispatchTarget<'a> {
    /// The proxy stored under this key of the context data. The data is
    /// appended to the arguments and a raised exception still counts as
    /// delivered.
    Proxy(&'a str),
    /// The context data itself. A raised exception fails the event.
    Data,
}

impl CallbackContext {
    /// Call `method` on the proxy stored under `proxy_key`, appending the
    /// context data as the last argument
    pub(crate) fn dispatch_to_proxy(
        &self,
        proxy_key: &str,
        method: &str,
        args: impl FnOnce(&Self) -> Result<Vec<HostValue>>,
    ) -> c_int {
        self.dispatch(DispatchTarget::Proxy(proxy_key), method, args)
    }

    pub(crate) fn dispatch(
        &self,
        target: DispatchTarget<'_>,
        method: &str,
        args: impl FnOnce(&Self) -> Result<Vec<HostValue>>,
    ) -> c_int {
        let _state = ThreadState::ensure(self.bridge.interpreter.as_ref());
        if self.is_cancelled() {
            log::debug!("{method}: registration cancelled, event dropped");
            return 0;
        }

        let mut args = match args(self) {
            Ok(args) => args,
            Err(err) => {
                log::debug!("{method}: failed to build arguments: {err}");
                self.report(&HostError::from(err));
                return -1;
            }
        };

        let proxy = match target {
            DispatchTarget::Proxy(key) => match self.data.get_item(key) {
                Some(proxy) => proxy,
                None => {
                    log::debug!("{method}: no '{key}' in callback data");
                    return -1;
                }
            },
            DispatchTarget::Data => self.data.clone(),
        };
        let Some(callee) = proxy.as_object().and_then(|o| o.method(method)) else {
            log::debug!("{method}: dispatch target has no such method");
            self.report(&HostError::attribute_error(format!(
                "'{}' object has no attribute '{method}'",
                proxy.type_name()
            )));
            return -1;
        };

        if let DispatchTarget::Proxy(_) = target {
            args.push(self.data.clone());
        }
        match callee.call(args) {
            Ok(_) => 0,
            Err(err) => {
                log::debug!("{method}: host callback raised");
                self.report(&err);
                match target {
                    DispatchTarget::Proxy(_) => 0,
                    DispatchTarget::Data => -1,
                }
            }
        }
    }

    /// Call the namespace helper `name` with `args` and the context data
    pub(crate) fn dispatch_to_helper(&self, name: &str, mut args: Vec<HostValue>) {
        let _state = ThreadState::ensure(self.bridge.interpreter.as_ref());
        if self.is_cancelled() {
            return;
        }
        let Some(helper) = self.bridge.namespace.lookup(name) else {
            log::error!("Host helper {name} not found in {}", self.bridge.config.host_module);
            return;
        };
        args.push(self.data.clone());
        if let Err(err) = helper.call(args) {
            self.report(&err);
        }
    }

    fn connection_key(&self) -> &str {
        &self.bridge.config.connection_key
    }
}

/// Dispatch a domain event: `(dom, extra..., data)` on the connection proxy
///
/// # Safety
/// `opaque` must be a live context pointer and `dom` an object the native
/// side lends for the duration of the call.
unsafe fn domain_event(
    opaque: *mut c_void,
    dom: *mut c_void,
    method: &str,
    extra: impl FnOnce() -> Result<Vec<HostValue>>,
) -> c_int {
    ffi_guard(method, -1, || {
        // SAFETY: per the function contract
        let Some(ctx) = (unsafe { CallbackContext::borrow(opaque) }) else {
            return -1;
        };
        ctx.dispatch_to_proxy(ctx.connection_key(), method, |ctx| {
            let mut args = vec![ctx.wrap_object(dom)?];
            args.extend(extra()?);
            Ok(args)
        })
    })
}

unsafe fn c_str(ptr: *const c_char) -> HostValue {
    HostValue::from_c_str(ptr)
}

/// `{family, node, service}`; null becomes `None`
unsafe fn graphics_address(addr: *const GraphicsAddress) -> HostValue {
    let Some(addr) = addr.as_ref() else {
        return HostValue::None;
    };
    let mut dict = HostDict::new();
    dict.insert("family".to_string(), addr.family.into());
    dict.insert("node".to_string(), c_str(addr.node));
    dict.insert("service".to_string(), c_str(addr.service));
    HostValue::Dict(dict)
}

/// List of `(type, name)` tuples
unsafe fn graphics_subject(subject: *const GraphicsSubject) -> Result<HostValue> {
    let Some(subject) = subject.as_ref() else {
        return Ok(HostValue::List(Vec::new()));
    };
    let count = usize::try_from(subject.nidentity).unwrap_or(0);
    if count == 0 || subject.identities.is_null() {
        return Ok(HostValue::List(Vec::new()));
    }
    let mut identities = Vec::new();
    identities.try_reserve_exact(count)?;
    for identity in std::slice::from_raw_parts(subject.identities, count) {
        identities.push(HostValue::Tuple(vec![c_str(identity.kind), c_str(identity.name)]));
    }
    Ok(HostValue::List(identities))
}

pub(crate) unsafe extern "C" fn domain_lifecycle(
    _conn: *mut c_void,
    dom: *mut c_void,
    event: c_int,
    detail: c_int,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_LIFECYCLE, || {
        Ok(vec![event.into(), detail.into()])
    })
}

/// Whole-connection lifecycle callback: `(dom, event, detail)` on the
/// connection proxy that is itself the context data
pub(crate) unsafe extern "C" fn domain_legacy(
    _conn: *mut c_void,
    dom: *mut c_void,
    event: c_int,
    detail: c_int,
    opaque: *mut c_void,
) -> c_int {
    ffi_guard(DOMAIN_LEGACY, -1, || {
        // SAFETY: `opaque` is the context registered with this callback
        let Some(ctx) = (unsafe { CallbackContext::borrow(opaque) }) else {
            return -1;
        };
        ctx.dispatch(DispatchTarget::Data, DOMAIN_LEGACY, |ctx| {
            Ok(vec![ctx.wrap_object(dom)?, event.into(), detail.into()])
        })
    })
}

pub(crate) unsafe extern "C" fn domain_generic(
    _conn: *mut c_void,
    dom: *mut c_void,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_GENERIC, || Ok(Vec::new()))
}

pub(crate) unsafe extern "C" fn domain_rtc_change(
    _conn: *mut c_void,
    dom: *mut c_void,
    utcoffset: c_longlong,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_RTC_CHANGE, || Ok(vec![utcoffset.into()]))
}

pub(crate) unsafe extern "C" fn domain_watchdog(
    _conn: *mut c_void,
    dom: *mut c_void,
    action: c_int,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_WATCHDOG, || Ok(vec![action.into()]))
}

pub(crate) unsafe extern "C" fn domain_io_error(
    _conn: *mut c_void,
    dom: *mut c_void,
    src_path: *const c_char,
    dev_alias: *const c_char,
    action: c_int,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_IO_ERROR, || {
        Ok(vec![c_str(src_path), c_str(dev_alias), action.into()])
    })
}

pub(crate) unsafe extern "C" fn domain_io_error_reason(
    _conn: *mut c_void,
    dom: *mut c_void,
    src_path: *const c_char,
    dev_alias: *const c_char,
    action: c_int,
    reason: *const c_char,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_IO_ERROR_REASON, || {
        Ok(vec![
            c_str(src_path),
            c_str(dev_alias),
            action.into(),
            c_str(reason),
        ])
    })
}

#[allow(clippy::too_many_arguments)]
pub(crate) unsafe extern "C" fn domain_graphics(
    _conn: *mut c_void,
    dom: *mut c_void,
    phase: c_int,
    local: *const GraphicsAddress,
    remote: *const GraphicsAddress,
    auth_scheme: *const c_char,
    subject: *const GraphicsSubject,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_GRAPHICS, || {
        Ok(vec![
            phase.into(),
            graphics_address(local),
            graphics_address(remote),
            c_str(auth_scheme),
            graphics_subject(subject)?,
        ])
    })
}

pub(crate) unsafe extern "C" fn domain_block_job(
    _conn: *mut c_void,
    dom: *mut c_void,
    disk: *const c_char,
    kind: c_int,
    status: c_int,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_BLOCK_JOB, || {
        Ok(vec![c_str(disk), kind.into(), status.into()])
    })
}

pub(crate) unsafe extern "C" fn domain_disk_change(
    _conn: *mut c_void,
    dom: *mut c_void,
    old_src_path: *const c_char,
    new_src_path: *const c_char,
    dev_alias: *const c_char,
    reason: c_int,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_DISK_CHANGE, || {
        Ok(vec![
            c_str(old_src_path),
            c_str(new_src_path),
            c_str(dev_alias),
            reason.into(),
        ])
    })
}

pub(crate) unsafe extern "C" fn domain_tray_change(
    _conn: *mut c_void,
    dom: *mut c_void,
    dev_alias: *const c_char,
    reason: c_int,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_TRAY_CHANGE, || {
        Ok(vec![c_str(dev_alias), reason.into()])
    })
}

pub(crate) unsafe extern "C" fn domain_pm_wakeup(
    _conn: *mut c_void,
    dom: *mut c_void,
    reason: c_int,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_PM_WAKEUP, || Ok(vec![reason.into()]))
}

pub(crate) unsafe extern "C" fn domain_pm_suspend(
    _conn: *mut c_void,
    dom: *mut c_void,
    reason: c_int,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_PM_SUSPEND, || Ok(vec![reason.into()]))
}

pub(crate) unsafe extern "C" fn domain_pm_suspend_disk(
    _conn: *mut c_void,
    dom: *mut c_void,
    reason: c_int,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_PM_SUSPEND_DISK, || Ok(vec![reason.into()]))
}

pub(crate) unsafe extern "C" fn domain_balloon_change(
    _conn: *mut c_void,
    dom: *mut c_void,
    actual: c_ulonglong,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_BALLOON_CHANGE, || Ok(vec![actual.into()]))
}

pub(crate) unsafe extern "C" fn domain_device_removed(
    _conn: *mut c_void,
    dom: *mut c_void,
    dev_alias: *const c_char,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_DEVICE_REMOVED, || Ok(vec![c_str(dev_alias)]))
}

pub(crate) unsafe extern "C" fn domain_device_added(
    _conn: *mut c_void,
    dom: *mut c_void,
    dev_alias: *const c_char,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_DEVICE_ADDED, || Ok(vec![c_str(dev_alias)]))
}

pub(crate) unsafe extern "C" fn domain_tunable(
    _conn: *mut c_void,
    dom: *mut c_void,
    params: *const crate::params::TypedParameter,
    nparams: c_int,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_TUNABLE, || {
        Ok(vec![HostValue::Dict(decode_raw(params, nparams)?)])
    })
}

pub(crate) unsafe extern "C" fn domain_agent_lifecycle(
    _conn: *mut c_void,
    dom: *mut c_void,
    state: c_int,
    reason: c_int,
    opaque: *mut c_void,
) -> c_int {
    domain_event(opaque, dom, DOMAIN_AGENT_LIFECYCLE, || {
        Ok(vec![state.into(), reason.into()])
    })
}

/// Native callback for a domain event id
pub fn domain_callback_for(id: DomainEventId) -> DomainEventCallback {
    match id {
        DomainEventId::Lifecycle => DomainEventCallback::Lifecycle(domain_lifecycle),
        DomainEventId::Reboot | DomainEventId::ControlError => {
            DomainEventCallback::Generic(domain_generic)
        }
        DomainEventId::RtcChange => DomainEventCallback::RtcChange(domain_rtc_change),
        DomainEventId::Watchdog => DomainEventCallback::Watchdog(domain_watchdog),
        DomainEventId::IoError => DomainEventCallback::IoError(domain_io_error),
        DomainEventId::IoErrorReason => DomainEventCallback::IoErrorReason(domain_io_error_reason),
        DomainEventId::Graphics => DomainEventCallback::Graphics(domain_graphics),
        DomainEventId::BlockJob | DomainEventId::BlockJob2 => {
            DomainEventCallback::BlockJob(domain_block_job)
        }
        DomainEventId::DiskChange => DomainEventCallback::DiskChange(domain_disk_change),
        DomainEventId::TrayChange => DomainEventCallback::TrayChange(domain_tray_change),
        DomainEventId::PmWakeup => DomainEventCallback::Reason(domain_pm_wakeup),
        DomainEventId::PmSuspend => DomainEventCallback::Reason(domain_pm_suspend),
        DomainEventId::PmSuspendDisk => DomainEventCallback::Reason(domain_pm_suspend_disk),
        DomainEventId::BalloonChange => DomainEventCallback::BalloonChange(domain_balloon_change),
        DomainEventId::DeviceRemoved => DomainEventCallback::Device(domain_device_removed),
        DomainEventId::DeviceAdded => DomainEventCallback::Device(domain_device_added),
        DomainEventId::Tunable => DomainEventCallback::Tunable(domain_tunable),
        DomainEventId::AgentLifecycle => {
            DomainEventCallback::AgentLifecycle(domain_agent_lifecycle)
        }
    }
}

pub(crate) unsafe extern "C" fn network_lifecycle(
    _conn: *mut c_void,
    net: *mut c_void,
    event: c_int,
    detail: c_int,
    opaque: *mut c_void,
) -> c_int {
    ffi_guard(NETWORK_LIFECYCLE, -1, || {
        // SAFETY: `opaque` is the context registered with this callback
        let Some(ctx) = (unsafe { CallbackContext::borrow(opaque) }) else {
            return -1;
        };
        ctx.dispatch_to_proxy(ctx.connection_key(), NETWORK_LIFECYCLE, |ctx| {
            Ok(vec![ctx.wrap_object(net)?, event.into(), detail.into()])
        })
    })
}

pub(crate) unsafe extern "C" fn connection_closed(
    _conn: *mut c_void,
    reason: c_int,
    opaque: *mut c_void,
) {
    ffi_guard(CLOSE, (), || {
        // SAFETY: `opaque` is the context registered with this callback
        if let Some(ctx) = unsafe { CallbackContext::borrow(opaque) } {
            ctx.dispatch_to_proxy(ctx.connection_key(), CLOSE, |_| Ok(vec![reason.into()]));
        }
    })
}

pub(crate) unsafe extern "C" fn stream_event(
    _stream: *mut c_void,
    events: c_int,
    opaque: *mut c_void,
) {
    ffi_guard(STREAM_EVENT, (), || {
        // SAFETY: `opaque` is the context registered with this callback
        if let Some(ctx) = unsafe { CallbackContext::borrow(opaque) } {
            let key = ctx.bridge.config.stream_key.clone();
            ctx.dispatch_to_proxy(&key, STREAM_EVENT, |_| Ok(vec![events.into()]));
        }
    })
}

/// Handle watch registered by host code
pub(crate) unsafe extern "C" fn handle_event(
    watch: c_int,
    fd: c_int,
    events: c_int,
    opaque: *mut c_void,
) {
    ffi_guard("handle event", (), || {
        // SAFETY: `opaque` is the context registered with this callback
        if let Some(ctx) = unsafe { CallbackContext::borrow(opaque) } {
            let name = ctx.bridge.config.dispatch_handle_name.clone();
            ctx.dispatch_to_helper(&name, vec![watch.into(), fd.into(), events.into()]);
        }
    })
}

/// Timer registered by host code
pub(crate) unsafe extern "C" fn timeout_event(timer: c_int, opaque: *mut c_void) {
    ffi_guard("timeout event", (), || {
        // SAFETY: `opaque` is the context registered with this callback
        if let Some(ctx) = unsafe { CallbackContext::borrow(opaque) } {
            let name = ctx.bridge.config.dispatch_timeout_name.clone();
            ctx.dispatch_to_helper(&name, vec![timer.into()]);
        }
    })
}

