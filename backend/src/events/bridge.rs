//! The event bridge
//!
//! Holds the host event-loop binding (six host callables), forwards native
//! event-loop requests to it, and runs native callbacks on behalf of the
//! host. One process-wide instance backs the `extern "C"` trampolines the
//! native library is given; further instances are useful for embedding
//! and tests.
//!
//! # Release bookkeeping
//!
//! Every handle or timeout the native side adds through the binding is
//! recorded with its opaque pointer and free callback. When the host's
//! remove primitive succeeds, the recorded pair is released exactly once,
//! whatever capsules the primitive hands back.

use std::collections::HashMap;
use std::os::raw::{c_int, c_void};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, HostError, Result};
use crate::events::context::{release_context, CallbackContext};
use crate::events::dispatch;
use crate::events::ffi_guard;
use crate::events::native::{
    Capsule, EventHandleCallback, EventImplTable, EventLoopRegistrar, EventTimeoutCallback,
    FreeCallback,
};
use crate::events::registration::RegistrationKey;
use crate::host::{
    allow_threads, HostFunction, HostNamespace, HostValue, Interpreter, ThreadState,
};

/// The six host callables implementing the event loop
#[derive(Debug, Clone)]
pub struct EventLoopBinding {
    pub add_handle: HostFunction,
    pub update_handle: HostFunction,
    pub remove_handle: HostFunction,
    pub add_timeout: HostFunction,
    pub update_timeout: HostFunction,
    pub remove_timeout: HostFunction,
}

impl EventLoopBinding {
    /// Build from positional arguments in registration order; every one
    /// must be callable
    pub fn from_args(args: &[HostValue]) -> Result<Self> {
        let [add_handle, update_handle, remove_handle, add_timeout, update_timeout, remove_timeout] =
            args
        else {
            return Err(BridgeError::InvalidArgument(format!(
                "expected 6 event loop callables, got {}",
                args.len()
            )));
        };
        Ok(EventLoopBinding {
            add_handle: callable("addHandle", add_handle)?,
            update_handle: callable("updateHandle", update_handle)?,
            remove_handle: callable("removeHandle", remove_handle)?,
            add_timeout: callable("addTimeout", add_timeout)?,
            update_timeout: callable("updateTimeout", update_timeout)?,
            remove_timeout: callable("removeTimeout", remove_timeout)?,
        })
    }
}

fn callable(name: &str, value: &HostValue) -> Result<HostFunction> {
    value.as_callable().cloned().ok_or_else(|| {
        BridgeError::InvalidArgument(format!(
            "{name} must be callable, got {}",
            value.type_name()
        ))
    })
}

#[derive(Clone, Copy)]
struct PendingRelease {
    opaque: *mut c_void,
    ff: Option<FreeCallback>,
}

// SAFETY: the pair is only handed back to the native free callback
unsafe impl Send for PendingRelease {}

impl PendingRelease {
    fn release(self) {
        if let Some(ff) = self.ff {
            // SAFETY: the native side registered `ff` for `opaque`, and the
            // record was removed from its table before this call
            unsafe { ff(self.opaque) };
        }
    }

    fn matches(&self, returned: &[HostValue]) -> bool {
        returned.get(1).and_then(HostValue::as_capsule) == Some(&Capsule::opaque(self.opaque))
            && returned.get(2).and_then(HostValue::as_capsule)
                == Some(&Capsule::free_callback(self.ff))
    }
}

pub(crate) struct BridgeShared {
    pub(crate) interpreter: Arc<dyn Interpreter>,
    pub(crate) namespace: Arc<dyn HostNamespace>,
    pub(crate) registrar: Arc<dyn EventLoopRegistrar>,
    pub(crate) config: BridgeConfig,
    binding: RwLock<Option<Arc<EventLoopBinding>>>,
    pending_handles: Mutex<HashMap<c_int, PendingRelease>>,
    pending_timeouts: Mutex<HashMap<c_int, PendingRelease>>,
    registrations: Mutex<HashMap<RegistrationKey, Weak<CallbackContext>>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BridgeShared {
    pub(crate) fn track(&self, key: RegistrationKey, ctx: &Arc<CallbackContext>) {
        let mut registrations = lock(&self.registrations);
        registrations.retain(|_, ctx| ctx.strong_count() > 0);
        registrations.insert(key, Arc::downgrade(ctx));
    }

    /// Stop dispatching for `key`; in-flight invocations finish normally
    pub(crate) fn cancel(&self, key: RegistrationKey) {
        let ctx = lock(&self.registrations).remove(&key).and_then(|w| w.upgrade());
        if let Some(ctx) = ctx {
            ctx.cancel();
        }
    }

    fn live_registrations(&self) -> usize {
        lock(&self.registrations)
            .values()
            .filter(|ctx| ctx.strong_count() > 0)
            .count()
    }
}

/// Bridge between the native event machinery and host code
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use virt_bridge_core_rs::{EventBridge, HostValue, LocalInterpreter, StaticNamespace};
/// # fn registrar() -> Arc<dyn virt_bridge_core_rs::EventLoopRegistrar> { unimplemented!() }
/// # fn primitives() -> Vec<HostValue> { unimplemented!() }
///
/// let bridge = EventBridge::new(
///     Arc::new(LocalInterpreter::new()),
///     Arc::new(StaticNamespace::new()),
///     registrar(),
/// );
/// bridge.register_impl(&primitives()).unwrap();
/// assert!(bridge.binding().is_some());
/// ```
#[derive(Clone)]
pub struct EventBridge {
    pub(crate) shared: Arc<BridgeShared>,
}

impl EventBridge {
    pub fn new(
        interpreter: Arc<dyn Interpreter>,
        namespace: Arc<dyn HostNamespace>,
        registrar: Arc<dyn EventLoopRegistrar>,
    ) -> Self {
        Self::with_config(interpreter, namespace, registrar, BridgeConfig::default())
    }

    pub fn with_config(
        interpreter: Arc<dyn Interpreter>,
        namespace: Arc<dyn HostNamespace>,
        registrar: Arc<dyn EventLoopRegistrar>,
        config: BridgeConfig,
    ) -> Self {
        EventBridge {
            shared: Arc::new(BridgeShared {
                interpreter,
                namespace,
                registrar,
                config,
                binding: RwLock::new(None),
                pending_handles: Mutex::new(HashMap::new()),
                pending_timeouts: Mutex::new(HashMap::new()),
                registrations: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn interpreter(&self) -> &dyn Interpreter {
        self.shared.interpreter.as_ref()
    }

    /// Currently installed host event loop, if any
    pub fn binding(&self) -> Option<Arc<EventLoopBinding>> {
        self.shared
            .binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handles and timeouts added through the binding and not yet removed
    pub fn pending_releases(&self) -> usize {
        lock(&self.shared.pending_handles).len() + lock(&self.shared.pending_timeouts).len()
    }

    /// Registrations whose context is still alive
    pub fn live_registrations(&self) -> usize {
        self.shared.live_registrations()
    }

    // ========================================================================
    // Host -> native
    // ========================================================================

    /// Install the host event loop
    ///
    /// Expects six callables: add/update/remove handle, add/update/remove
    /// timeout. On any non-callable argument the previous binding stays in
    /// place. Afterwards the native library is pointed at the process-wide
    /// trampolines (see [`native_event_impl`]).
    pub fn register_impl(&self, args: &[HostValue]) -> Result<()> {
        let binding = Arc::new(EventLoopBinding::from_args(args)?);
        let previous = self
            .shared
            .binding
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(binding);
        drop(previous);
        log::debug!("Event loop binding installed");

        allow_threads(self.interpreter(), || {
            self.shared.registrar.register_impl(native_event_impl())
        });
        Ok(())
    }

    /// Run a native handle callback the host loop was given
    ///
    /// `cb` and `opaque` must be the capsules the add-handle primitive
    /// received. The callback runs with the interpreter released.
    pub fn invoke_handle_callback(
        &self,
        watch: c_int,
        fd: c_int,
        event: c_int,
        cb: &HostValue,
        opaque: &HostValue,
    ) -> Result<()> {
        let cb = cb
            .as_capsule()
            .and_then(Capsule::as_handle_callback)
            .ok_or_else(|| capsule_error("handle callback", cb))?;
        let opaque = opaque_capsule(opaque)?;
        // SAFETY: both capsules were minted from one native registration
        allow_threads(self.interpreter(), || unsafe { cb(watch, fd, event, opaque) });
        Ok(())
    }

    /// Run a native timeout callback the host loop was given
    pub fn invoke_timeout_callback(
        &self,
        timer: c_int,
        cb: &HostValue,
        opaque: &HostValue,
    ) -> Result<()> {
        let cb = cb
            .as_capsule()
            .and_then(Capsule::as_timeout_callback)
            .ok_or_else(|| capsule_error("timeout callback", cb))?;
        let opaque = opaque_capsule(opaque)?;
        // SAFETY: both capsules were minted from one native registration
        allow_threads(self.interpreter(), || unsafe { cb(timer, opaque) });
        Ok(())
    }

    /// Host helper unpacking `(watch, fd, event, (cb, opaque, ff))` and
    /// running the native callback, for use as the add-handle invoker
    pub fn handle_invoker(&self) -> HostFunction {
        let shared = Arc::downgrade(&self.shared);
        HostFunction::new("_eventInvokeHandleCallback", move |args| {
            let bridge = upgrade(&shared)?;
            let [watch, fd, event, opaque, ..] = args.as_slice() else {
                return Err(HostError::type_error("expected (watch, fd, event, opaque)"));
            };
            let (cb, opaque) = unpack_invoker_opaque(opaque)?;
            bridge.invoke_handle_callback(int_arg(watch)?, int_arg(fd)?, int_arg(event)?, cb, opaque)?;
            Ok(HostValue::None)
        })
    }

    /// Host helper unpacking `(timer, (cb, opaque, ff))`, for use as the
    /// add-timeout invoker
    pub fn timeout_invoker(&self) -> HostFunction {
        let shared = Arc::downgrade(&self.shared);
        HostFunction::new("_eventInvokeTimeoutCallback", move |args| {
            let bridge = upgrade(&shared)?;
            let [timer, opaque, ..] = args.as_slice() else {
                return Err(HostError::type_error("expected (timer, opaque)"));
            };
            let (cb, opaque) = unpack_invoker_opaque(opaque)?;
            bridge.invoke_timeout_callback(int_arg(timer)?, cb, opaque)?;
            Ok(HostValue::None)
        })
    }

    /// Register a handle watch from host code
    ///
    /// When the handle fires, the dispatch helper named in the config is
    /// called with `(watch, fd, events, data)`. `data` is released once
    /// the native side removes the watch.
    pub fn event_add_handle(&self, fd: c_int, events: c_int, data: HostValue) -> Result<c_int> {
        let ctx = CallbackContext::new(Arc::clone(&self.shared), data, None);
        let opaque = CallbackContext::into_opaque(ctx);
        let watch = allow_threads(self.interpreter(), || {
            self.shared.registrar.add_handle(
                fd,
                events,
                dispatch::handle_event,
                opaque,
                Some(release_context),
            )
        });
        if watch < 0 {
            // SAFETY: the native side refused the registration and kept no copy
            drop(unsafe { CallbackContext::reclaim(opaque) });
            return Err(BridgeError::native("virEventAddHandle", watch));
        }
        Ok(watch)
    }

    /// Register a timer from host code; see [`event_add_handle`](Self::event_add_handle)
    pub fn event_add_timeout(&self, timeout: c_int, data: HostValue) -> Result<c_int> {
        let ctx = CallbackContext::new(Arc::clone(&self.shared), data, None);
        let opaque = CallbackContext::into_opaque(ctx);
        let timer = allow_threads(self.interpreter(), || {
            self.shared.registrar.add_timeout(
                timeout,
                dispatch::timeout_event,
                opaque,
                Some(release_context),
            )
        });
        if timer < 0 {
            // SAFETY: the native side refused the registration and kept no copy
            drop(unsafe { CallbackContext::reclaim(opaque) });
            return Err(BridgeError::native("virEventAddTimeout", timer));
        }
        Ok(timer)
    }

    // ========================================================================
    // Native -> host event loop
    // ========================================================================

    /// Forward a native add-handle request to the host loop
    ///
    /// Returns the host's watch id, or -1 when there is no binding, the
    /// invoker helper is missing, the host raises, or the result is not an
    /// integer.
    ///
    /// # Safety
    /// `cb`, `opaque` and `ff` must form one native registration: `cb` may
    /// be called with `opaque` until `ff` is called with it.
    pub unsafe fn add_handle(
        &self,
        fd: c_int,
        event: c_int,
        cb: EventHandleCallback,
        opaque: *mut c_void,
        ff: Option<FreeCallback>,
    ) -> c_int {
        let _state = ThreadState::ensure(self.interpreter());
        let Some(binding) = self.binding() else {
            log::warn!("addHandle called before an event loop was registered");
            return -1;
        };
        let Some(invoker) = self.lookup_helper(&self.shared.config.invoke_handle_name) else {
            return -1;
        };
        let args = vec![
            fd.into(),
            event.into(),
            invoker.into(),
            capsule_triple(Capsule::handle_callback(cb), opaque, ff),
        ];
        let watch = self.call_for_id(&binding.add_handle, "addHandle", args);
        if watch >= 0 {
            record_pending("addHandle", &self.shared.pending_handles, watch, PendingRelease { opaque, ff });
        }
        watch
    }

    pub fn update_handle(&self, watch: c_int, event: c_int) {
        let _state = ThreadState::ensure(self.interpreter());
        if let Some(binding) = self.binding() {
            self.call_and_report(&binding.update_handle, vec![watch.into(), event.into()]);
        }
    }

    /// Forward a native remove-handle request; releases the recorded pair
    /// when the host confirms removal
    pub fn remove_handle(&self, watch: c_int) -> c_int {
        let _state = ThreadState::ensure(self.interpreter());
        let Some(binding) = self.binding() else {
            return -1;
        };
        let Some(result) = self.call_and_report(&binding.remove_handle, vec![watch.into()]) else {
            return -1;
        };
        self.finish_removal("removeHandle", &self.shared.pending_handles, watch, &result)
    }

    /// Forward a native add-timeout request to the host loop
    ///
    /// # Safety
    /// As for [`add_handle`](Self::add_handle).
    pub unsafe fn add_timeout(
        &self,
        timeout: c_int,
        cb: EventTimeoutCallback,
        opaque: *mut c_void,
        ff: Option<FreeCallback>,
    ) -> c_int {
        let _state = ThreadState::ensure(self.interpreter());
        let Some(binding) = self.binding() else {
            log::warn!("addTimeout called before an event loop was registered");
            return -1;
        };
        let Some(invoker) = self.lookup_helper(&self.shared.config.invoke_timeout_name) else {
            return -1;
        };
        let args = vec![
            timeout.into(),
            invoker.into(),
            capsule_triple(Capsule::timeout_callback(cb), opaque, ff),
        ];
        let timer = self.call_for_id(&binding.add_timeout, "addTimeout", args);
        if timer >= 0 {
            record_pending("addTimeout", &self.shared.pending_timeouts, timer, PendingRelease { opaque, ff });
        }
        timer
    }

    pub fn update_timeout(&self, timer: c_int, timeout: c_int) {
        let _state = ThreadState::ensure(self.interpreter());
        if let Some(binding) = self.binding() {
            self.call_and_report(&binding.update_timeout, vec![timer.into(), timeout.into()]);
        }
    }

    pub fn remove_timeout(&self, timer: c_int) -> c_int {
        let _state = ThreadState::ensure(self.interpreter());
        let Some(binding) = self.binding() else {
            return -1;
        };
        let Some(result) = self.call_and_report(&binding.remove_timeout, vec![timer.into()]) else {
            return -1;
        };
        self.finish_removal("removeTimeout", &self.shared.pending_timeouts, timer, &result)
    }

    fn lookup_helper(&self, name: &str) -> Option<HostFunction> {
        let helper = self.shared.namespace.lookup(name);
        if helper.is_none() {
            log::error!("Host helper {name} not found in {}", self.shared.config.host_module);
        }
        helper
    }

    fn call_and_report(&self, func: &HostFunction, args: Vec<HostValue>) -> Option<HostValue> {
        match func.call(args) {
            Ok(result) => Some(result),
            Err(err) => {
                self.interpreter().report(&err);
                None
            }
        }
    }

    fn call_for_id(&self, func: &HostFunction, primitive: &str, args: Vec<HostValue>) -> c_int {
        let Some(result) = self.call_and_report(func, args) else {
            return -1;
        };
        match result.as_i32() {
            Some(id) => id,
            None => {
                log::warn!(
                    "{}",
                    BridgeError::protocol(
                        primitive,
                        format!("expected an integer id, got {}", result.type_name())
                    )
                );
                -1
            }
        }
    }

    fn finish_removal(
        &self,
        primitive: &str,
        pending: &Mutex<HashMap<c_int, PendingRelease>>,
        id: c_int,
        result: &HostValue,
    ) -> c_int {
        let Some(returned) = result.as_tuple().filter(|t| t.len() == 3) else {
            log::warn!(
                "{}",
                BridgeError::protocol(
                    primitive,
                    format!("expected a 3-tuple, got {}", result.type_name())
                )
            );
            return -1;
        };

        let record = lock(pending).remove(&id);
        match record {
            Some(record) => {
                if self.shared.config.verify_removed_capsules && !record.matches(returned) {
                    log::warn!(
                        "{}",
                        BridgeError::protocol(
                            primitive,
                            format!("capsules returned for id {id} differ from the registered pair")
                        )
                    );
                }
                record.release();
            }
            None => log::warn!(
                "{}",
                BridgeError::protocol(primitive, format!("no registration recorded for id {id}"))
            ),
        }
        0
    }
}

/// Remember the pair behind a host-issued id. An id the host hands out
/// again while still recorded displaces the older pair, which is released.
fn record_pending(
    primitive: &str,
    pending: &Mutex<HashMap<c_int, PendingRelease>>,
    id: c_int,
    record: PendingRelease,
) {
    let displaced = lock(pending).insert(id, record);
    if let Some(displaced) = displaced {
        log::warn!(
            "{}",
            BridgeError::protocol(primitive, format!("id {id} reused while still registered"))
        );
        displaced.release();
    }
}

fn capsule_triple(cb: Capsule, opaque: *mut c_void, ff: Option<FreeCallback>) -> HostValue {
    HostValue::Tuple(vec![
        cb.into(),
        Capsule::opaque(opaque).into(),
        Capsule::free_callback(ff).into(),
    ])
}

fn capsule_error(expected: &str, got: &HostValue) -> BridgeError {
    BridgeError::InvalidArgument(format!(
        "expected a {expected} capsule, got {}",
        got.type_name()
    ))
}

fn opaque_capsule(value: &HostValue) -> Result<*mut c_void> {
    value
        .as_capsule()
        .and_then(Capsule::as_opaque)
        .ok_or_else(|| capsule_error("opaque", value))
}

fn unpack_invoker_opaque(value: &HostValue) -> std::result::Result<(&HostValue, &HostValue), HostError> {
    match value.as_tuple() {
        Some([cb, opaque, ..]) => Ok((cb, opaque)),
        _ => Err(HostError::type_error(format!(
            "expected (cb, opaque, ff) tuple, got {}",
            value.type_name()
        ))),
    }
}

fn int_arg(value: &HostValue) -> std::result::Result<c_int, HostError> {
    value
        .as_i32()
        .ok_or_else(|| HostError::type_error(format!("expected int, got {}", value.type_name())))
}

fn upgrade(shared: &Weak<BridgeShared>) -> std::result::Result<EventBridge, HostError> {
    shared
        .upgrade()
        .map(|shared| EventBridge { shared })
        .ok_or_else(|| HostError::runtime_error("event bridge has been dropped"))
}

// ============================================================================
// Process-wide instance and native trampolines
// ============================================================================

static GLOBAL_BRIDGE: OnceLock<EventBridge> = OnceLock::new();

/// Install the bridge the native trampolines route to
///
/// Fails if one is already installed; the argument is then dropped.
pub fn install_global(bridge: EventBridge) -> Result<&'static EventBridge> {
    let mut installed = false;
    let global = GLOBAL_BRIDGE.get_or_init(|| {
        installed = true;
        bridge
    });
    if installed {
        Ok(global)
    } else {
        Err(BridgeError::InvalidArgument(
            "an event bridge is already installed".to_string(),
        ))
    }
}

/// The process-wide bridge, installing one built by `init` if needed
pub fn global_or_init(init: impl FnOnce() -> EventBridge) -> &'static EventBridge {
    GLOBAL_BRIDGE.get_or_init(init)
}

pub fn global() -> Option<&'static EventBridge> {
    GLOBAL_BRIDGE.get()
}

/// Trampolines handed to the native library; they route to [`global`]
pub fn native_event_impl() -> EventImplTable {
    EventImplTable {
        add_handle: add_handle_trampoline,
        update_handle: update_handle_trampoline,
        remove_handle: remove_handle_trampoline,
        add_timeout: add_timeout_trampoline,
        update_timeout: update_timeout_trampoline,
        remove_timeout: remove_timeout_trampoline,
    }
}

unsafe extern "C" fn add_handle_trampoline(
    fd: c_int,
    event: c_int,
    cb: EventHandleCallback,
    opaque: *mut c_void,
    ff: Option<FreeCallback>,
) -> c_int {
    ffi_guard("addHandle", -1, || match global() {
        // SAFETY: the native library passes a matching registration
        Some(bridge) => unsafe { bridge.add_handle(fd, event, cb, opaque, ff) },
        None => -1,
    })
}

unsafe extern "C" fn update_handle_trampoline(watch: c_int, event: c_int) {
    ffi_guard("updateHandle", (), || {
        if let Some(bridge) = global() {
            bridge.update_handle(watch, event);
        }
    })
}

unsafe extern "C" fn remove_handle_trampoline(watch: c_int) -> c_int {
    ffi_guard("removeHandle", -1, || {
        global().map_or(-1, |bridge| bridge.remove_handle(watch))
    })
}

unsafe extern "C" fn add_timeout_trampoline(
    timeout: c_int,
    cb: EventTimeoutCallback,
    opaque: *mut c_void,
    ff: Option<FreeCallback>,
) -> c_int {
    ffi_guard("addTimeout", -1, || match global() {
        // SAFETY: the native library passes a matching registration
        Some(bridge) => unsafe { bridge.add_timeout(timeout, cb, opaque, ff) },
        None => -1,
    })
}

unsafe extern "C" fn update_timeout_trampoline(timer: c_int, timeout: c_int) {
    ffi_guard("updateTimeout", (), || {
        if let Some(bridge) = global() {
            bridge.update_timeout(timer, timeout);
        }
    })
}

unsafe extern "C" fn remove_timeout_trampoline(timer: c_int) -> c_int {
    ffi_guard("removeTimeout", -1, || {
        global().map_or(-1, |bridge| bridge.remove_timeout(timer))
    })
}
