//! Fake native collaborators and host doubles shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::os::raw::{c_int, c_uint, c_void};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use virt_bridge_core_rs::events::native::{
    ConnectCloseCallback, DomainLifecycleCallback, NetworkLifecycleCallback, StreamEventCallback,
};
use virt_bridge_core_rs::{
    ConnectEvents, EventBridge, EventImplTable, EventLoopRegistrar, HostDict, HostError,
    HostFunction, HostValue, Interpreter, LocalInterpreter, MethodTable, ObjectKind, ObjectOps,
    OwnedObject, ParameterFamily, StaticNamespace, StreamEvents, StreamIo, TypedParameter,
};
use virt_bridge_core_rs::events::{
    DomainEventCallback, EventHandleCallback, EventTimeoutCallback, FreeCallback,
};
use virt_bridge_core_rs::host::{SavedThreadState, ThreadStateToken};

// ============================================================================
// Native objects with reference counts
// ============================================================================

/// Stand-in for a native domain/network; starts with one reference held by
/// the fake native library
pub struct FakeObject {
    refs: AtomicI32,
}

impl FakeObject {
    pub fn new() -> &'static FakeObject {
        Box::leak(Box::new(FakeObject {
            refs: AtomicI32::new(1),
        }))
    }

    pub fn ptr(&'static self) -> *mut c_void {
        self as *const FakeObject as *mut c_void
    }

    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }
}

unsafe extern "C" fn fake_ref(ptr: *mut c_void) -> c_int {
    (*(ptr as *const FakeObject)).refs.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "C" fn fake_unref(ptr: *mut c_void) -> c_int {
    (*(ptr as *const FakeObject)).refs.fetch_sub(1, Ordering::SeqCst) - 1
}

pub const FAKE_DOMAIN_OPS: ObjectOps = ObjectOps {
    kind: ObjectKind::Domain,
    add_ref: fake_ref,
    release: fake_unref,
};

pub const FAKE_NETWORK_OPS: ObjectOps = ObjectOps {
    kind: ObjectKind::Network,
    add_ref: fake_ref,
    release: fake_unref,
};

// ============================================================================
// Native spy: a native callback target with a counting free function
// ============================================================================

/// What a native handle/timeout callback saw, and how often it was freed
#[derive(Default)]
pub struct NativeSpy {
    pub handle_calls: Mutex<Vec<(c_int, c_int, c_int)>>,
    pub timeout_calls: Mutex<Vec<c_int>>,
    pub frees: AtomicUsize,
}

impl NativeSpy {
    pub fn new() -> &'static NativeSpy {
        Box::leak(Box::default())
    }

    pub fn opaque(&'static self) -> *mut c_void {
        self as *const NativeSpy as *mut c_void
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

pub unsafe extern "C" fn spy_handle_cb(watch: c_int, fd: c_int, events: c_int, opaque: *mut c_void) {
    let spy = &*(opaque as *const NativeSpy);
    spy.handle_calls.lock().unwrap().push((watch, fd, events));
}

pub unsafe extern "C" fn spy_timeout_cb(timer: c_int, opaque: *mut c_void) {
    let spy = &*(opaque as *const NativeSpy);
    spy.timeout_calls.lock().unwrap().push(timer);
}

pub unsafe extern "C" fn spy_free(opaque: *mut c_void) {
    let spy = &*(opaque as *const NativeSpy);
    spy.frees.fetch_add(1, Ordering::SeqCst);
}

// ============================================================================
// Interpreter that records reported exceptions
// ============================================================================

#[derive(Default)]
pub struct RecordingInterpreter {
    inner: LocalInterpreter,
    pub reports: Mutex<Vec<HostError>>,
}

impl RecordingInterpreter {
    pub fn reported(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.to_string())
            .collect()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.inner.is_held_by_current_thread()
    }
}

impl Interpreter for RecordingInterpreter {
    fn ensure(&self) -> ThreadStateToken {
        self.inner.ensure()
    }

    fn release(&self, token: ThreadStateToken) {
        self.inner.release(token)
    }

    fn save(&self) -> SavedThreadState {
        self.inner.save()
    }

    fn restore(&self, saved: SavedThreadState) {
        self.inner.restore(saved)
    }

    fn report(&self, error: &HostError) {
        self.reports.lock().unwrap().push(HostError::new(error.kind, error.message.clone()));
    }
}

// ============================================================================
// Host-side doubles
// ============================================================================

/// Records every call made to the methods it hands out
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<(String, Vec<HostValue>)>>,
}

impl Recorder {
    pub fn new() -> Arc<Recorder> {
        Arc::new(Recorder::default())
    }

    /// A host function that records its arguments and returns `None`
    pub fn method(self: &Arc<Self>, name: &str) -> HostFunction {
        let recorder = Arc::clone(self);
        let label = name.to_string();
        HostFunction::new(name, move |args| {
            recorder.calls.lock().unwrap().push((label.clone(), args));
            Ok(HostValue::None)
        })
    }

    /// A host function that records its arguments and then raises
    pub fn raising_method(self: &Arc<Self>, name: &str) -> HostFunction {
        let recorder = Arc::clone(self);
        let label = name.to_string();
        HostFunction::new(name, move |args| {
            recorder.calls.lock().unwrap().push((label.clone(), args));
            Err(HostError::runtime_error(format!("{label} failed")))
        })
    }

    pub fn calls(&self) -> Vec<(String, Vec<HostValue>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Drop recorded arguments, releasing any native objects they hold
    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

/// Registration data `{key: proxy}` where the proxy records `methods`
pub fn proxy_data(key: &str, recorder: &Arc<Recorder>, methods: &[&str]) -> HostValue {
    let proxy = methods
        .iter()
        .fold(MethodTable::new("virConnect"), |table, name| {
            table.with_method(*name, recorder.method(name))
        });
    let mut data = HostDict::new();
    data.insert(key.to_string(), proxy.into_value());
    data.insert("opaque".to_string(), HostValue::Str("user data".to_string()));
    HostValue::Dict(data)
}

/// What the host loop was asked to watch
#[derive(Clone, Debug)]
pub struct HostWatch {
    pub fd: c_int,
    pub events: c_int,
    pub invoker: HostValue,
    pub opaque: HostValue,
}

#[derive(Clone, Debug)]
pub struct HostTimer {
    pub timeout: c_int,
    pub invoker: HostValue,
    pub opaque: HostValue,
}

/// A host event loop made of six host functions
#[derive(Default)]
pub struct HostLoop {
    pub handles: Mutex<HashMap<c_int, HostWatch>>,
    pub timers: Mutex<HashMap<c_int, HostTimer>>,
    pub updates: Mutex<Vec<(String, c_int, c_int)>>,
    next_id: AtomicI32,
    /// Hand back the capsules of a different watch on removal
    pub swap_on_remove: AtomicBool,
    /// Answer add requests with a string instead of an id
    pub malformed_ids: AtomicBool,
    /// Hand out the same id again instead of a fresh one
    pub reuse_ids: AtomicBool,
}

impl HostLoop {
    pub fn new() -> Arc<HostLoop> {
        Arc::new(HostLoop {
            next_id: AtomicI32::new(1),
            ..HostLoop::default()
        })
    }

    fn issue_id(&self) -> c_int {
        if self.reuse_ids.load(Ordering::SeqCst) {
            self.next_id.load(Ordering::SeqCst)
        } else {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }
    }

    pub fn primitives(self: &Arc<Self>) -> Vec<HostValue> {
        let add_handle = {
            let host = Arc::clone(self);
            HostFunction::new("addHandle", move |args| {
                let [fd, events, invoker, opaque] = args.as_slice() else {
                    return Err(HostError::type_error("addHandle takes 4 arguments"));
                };
                if host.malformed_ids.load(Ordering::SeqCst) {
                    return Ok(HostValue::Str("not an id".to_string()));
                }
                let id = host.issue_id();
                host.handles.lock().unwrap().insert(
                    id,
                    HostWatch {
                        fd: fd.as_i32().unwrap_or(-1),
                        events: events.as_i32().unwrap_or(-1),
                        invoker: invoker.clone(),
                        opaque: opaque.clone(),
                    },
                );
                Ok(HostValue::Int(i128::from(id)))
            })
        };
        let update_handle = {
            let host = Arc::clone(self);
            HostFunction::new("updateHandle", move |args| {
                let id = args[0].as_i32().unwrap_or(-1);
                let events = args[1].as_i32().unwrap_or(-1);
                host.updates.lock().unwrap().push(("handle".to_string(), id, events));
                if let Some(watch) = host.handles.lock().unwrap().get_mut(&id) {
                    watch.events = events;
                }
                Ok(HostValue::None)
            })
        };
        let remove_handle = {
            let host = Arc::clone(self);
            HostFunction::new("removeHandle", move |args| {
                let id = args[0].as_i32().unwrap_or(-1);
                let mut handles = host.handles.lock().unwrap();
                let Some(watch) = handles.remove(&id) else {
                    return Ok(HostValue::None);
                };
                if host.swap_on_remove.load(Ordering::SeqCst) {
                    if let Some(other) = handles.values().next() {
                        return Ok(other.opaque.clone());
                    }
                }
                Ok(watch.opaque)
            })
        };
        let add_timeout = {
            let host = Arc::clone(self);
            HostFunction::new("addTimeout", move |args| {
                let [timeout, invoker, opaque] = args.as_slice() else {
                    return Err(HostError::type_error("addTimeout takes 3 arguments"));
                };
                let id = host.issue_id();
                host.timers.lock().unwrap().insert(
                    id,
                    HostTimer {
                        timeout: timeout.as_i32().unwrap_or(-1),
                        invoker: invoker.clone(),
                        opaque: opaque.clone(),
                    },
                );
                Ok(HostValue::Int(i128::from(id)))
            })
        };
        let update_timeout = {
            let host = Arc::clone(self);
            HostFunction::new("updateTimeout", move |args| {
                let id = args[0].as_i32().unwrap_or(-1);
                let timeout = args[1].as_i32().unwrap_or(-1);
                host.updates.lock().unwrap().push(("timeout".to_string(), id, timeout));
                Ok(HostValue::None)
            })
        };
        let remove_timeout = {
            let host = Arc::clone(self);
            HostFunction::new("removeTimeout", move |args| {
                let id = args[0].as_i32().unwrap_or(-1);
                let timer = host.timers.lock().unwrap().remove(&id);
                Ok(timer.map_or(HostValue::None, |t| t.opaque))
            })
        };

        vec![
            add_handle.into(),
            update_handle.into(),
            remove_handle.into(),
            add_timeout.into(),
            update_timeout.into(),
            remove_timeout.into(),
        ]
    }

    /// Run a watch the way a host loop does: call its invoker with
    /// `(watch, fd, events, opaque)`
    pub fn fire_handle(&self, id: c_int, events: c_int) -> Result<HostValue, HostError> {
        let watch = self.handles.lock().unwrap().get(&id).cloned();
        let watch = watch.ok_or_else(|| HostError::lookup_error(format!("no watch {id}")))?;
        let invoker = watch.invoker.as_callable().cloned().ok_or_else(|| {
            HostError::type_error("invoker is not callable")
        })?;
        invoker.call(vec![id.into(), watch.fd.into(), events.into(), watch.opaque])
    }

    pub fn fire_timer(&self, id: c_int) -> Result<HostValue, HostError> {
        let timer = self.timers.lock().unwrap().get(&id).cloned();
        let timer = timer.ok_or_else(|| HostError::lookup_error(format!("no timer {id}")))?;
        let invoker = timer.invoker.as_callable().cloned().ok_or_else(|| {
            HostError::type_error("invoker is not callable")
        })?;
        invoker.call(vec![id.into(), timer.opaque])
    }
}

// ============================================================================
// Fake native event loop registrar
// ============================================================================

/// A watch or timer registered with the fake native default loop
#[derive(Clone, Copy)]
pub struct NativeEntry {
    pub handle_cb: Option<EventHandleCallback>,
    pub timeout_cb: Option<EventTimeoutCallback>,
    pub opaque: usize,
    pub ff: Option<FreeCallback>,
}

impl NativeEntry {
    pub unsafe fn fire_handle(&self, watch: c_int, fd: c_int, events: c_int) {
        if let Some(cb) = self.handle_cb {
            cb(watch, fd, events, self.opaque as *mut c_void);
        }
    }

    pub unsafe fn fire_timeout(&self, timer: c_int) {
        if let Some(cb) = self.timeout_cb {
            cb(timer, self.opaque as *mut c_void);
        }
    }

    pub unsafe fn free(&self) {
        if let Some(ff) = self.ff {
            ff(self.opaque as *mut c_void);
        }
    }
}

#[derive(Default)]
pub struct FakeRegistrar {
    pub tables: Mutex<Vec<EventImplTable>>,
    pub entries: Mutex<Vec<NativeEntry>>,
    pub refuse: AtomicBool,
}

impl FakeRegistrar {
    pub fn new() -> Arc<FakeRegistrar> {
        Arc::new(FakeRegistrar::default())
    }

    pub fn entry(&self, index: usize) -> NativeEntry {
        self.entries.lock().unwrap()[index]
    }
}

impl EventLoopRegistrar for FakeRegistrar {
    fn register_impl(&self, table: EventImplTable) {
        self.tables.lock().unwrap().push(table);
    }

    fn add_handle(
        &self,
        _fd: c_int,
        _events: c_int,
        cb: EventHandleCallback,
        opaque: *mut c_void,
        ff: Option<FreeCallback>,
    ) -> c_int {
        if self.refuse.load(Ordering::SeqCst) {
            return -1;
        }
        let mut entries = self.entries.lock().unwrap();
        entries.push(NativeEntry {
            handle_cb: Some(cb),
            timeout_cb: None,
            opaque: opaque as usize,
            ff,
        });
        entries.len() as c_int
    }

    fn add_timeout(
        &self,
        _timeout: c_int,
        cb: EventTimeoutCallback,
        opaque: *mut c_void,
        ff: Option<FreeCallback>,
    ) -> c_int {
        if self.refuse.load(Ordering::SeqCst) {
            return -1;
        }
        let mut entries = self.entries.lock().unwrap();
        entries.push(NativeEntry {
            handle_cb: None,
            timeout_cb: Some(cb),
            opaque: opaque as usize,
            ff,
        });
        entries.len() as c_int
    }
}

// ============================================================================
// Fake connection
// ============================================================================

#[derive(Clone, Copy)]
pub struct DomainRegistration {
    pub dom: usize,
    pub event_id: c_int,
    pub cb: DomainEventCallback,
    pub opaque: usize,
    pub ff: FreeCallback,
}

impl DomainRegistration {
    pub fn opaque(&self) -> *mut c_void {
        self.opaque as *mut c_void
    }

    pub unsafe fn free(&self) {
        (self.ff)(self.opaque());
    }
}

#[derive(Clone, Copy)]
pub struct NetworkRegistration {
    pub cb: NetworkLifecycleCallback,
    pub opaque: usize,
    pub ff: FreeCallback,
}

#[derive(Clone, Copy)]
pub struct LegacyRegistration {
    pub cb: DomainLifecycleCallback,
    pub opaque: usize,
    pub ff: FreeCallback,
}

#[derive(Clone, Copy)]
pub struct CloseRegistration {
    pub cb: ConnectCloseCallback,
    pub opaque: usize,
    pub ff: FreeCallback,
}

/// A connection whose registrations are kept for the test to fire; removed
/// registrations move to `retired` until the test frees them, like a
/// native library that frees asynchronously
#[derive(Default)]
pub struct FakeConnection {
    id: usize,
    pub domains: Mutex<HashMap<c_int, DomainRegistration>>,
    pub networks: Mutex<HashMap<c_int, NetworkRegistration>>,
    pub legacy: Mutex<Option<LegacyRegistration>>,
    pub close: Mutex<Option<CloseRegistration>>,
    pub retired: Mutex<Vec<(usize, FreeCallback)>>,
    next_id: AtomicI32,
    pub refuse: AtomicBool,
}

impl FakeConnection {
    pub fn new(id: usize) -> FakeConnection {
        FakeConnection {
            id,
            next_id: AtomicI32::new(1),
            ..FakeConnection::default()
        }
    }

    pub fn domain(&self, callback_id: c_int) -> DomainRegistration {
        self.domains.lock().unwrap()[&callback_id]
    }

    /// Run every pending free callback, as the native library eventually does
    pub fn release_retired(&self) -> usize {
        let retired: Vec<_> = self.retired.lock().unwrap().drain(..).collect();
        for (opaque, ff) in &retired {
            // SAFETY: each retired pair is freed once
            unsafe { ff(*opaque as *mut c_void) };
        }
        retired.len()
    }
}

impl ConnectEvents for FakeConnection {
    fn connection_id(&self) -> usize {
        self.id
    }

    fn domain_ops(&self) -> ObjectOps {
        FAKE_DOMAIN_OPS
    }

    fn network_ops(&self) -> ObjectOps {
        FAKE_NETWORK_OPS
    }

    fn domain_event_register(
        &self,
        cb: DomainLifecycleCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int {
        let mut legacy = self.legacy.lock().unwrap();
        if legacy.is_some() || self.refuse.load(Ordering::SeqCst) {
            return -1;
        }
        *legacy = Some(LegacyRegistration {
            cb,
            opaque: opaque as usize,
            ff,
        });
        0
    }

    fn domain_event_deregister(&self, cb: DomainLifecycleCallback) -> c_int {
        let mut legacy = self.legacy.lock().unwrap();
        match legacy.take() {
            Some(reg) if reg.cb as usize == cb as usize => {
                self.retired.lock().unwrap().push((reg.opaque, reg.ff));
                0
            }
            other => {
                *legacy = other;
                -1
            }
        }
    }

    fn domain_event_register_any(
        &self,
        dom: Option<&OwnedObject>,
        event_id: c_int,
        cb: DomainEventCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int {
        if self.refuse.load(Ordering::SeqCst) {
            return -1;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.domains.lock().unwrap().insert(
            id,
            DomainRegistration {
                dom: dom.map_or(0, |d| d.as_ptr() as usize),
                event_id,
                cb,
                opaque: opaque as usize,
                ff,
            },
        );
        id
    }

    fn domain_event_deregister_any(&self, callback_id: c_int) -> c_int {
        match self.domains.lock().unwrap().remove(&callback_id) {
            Some(reg) => {
                self.retired.lock().unwrap().push((reg.opaque, reg.ff));
                0
            }
            None => -1,
        }
    }

    fn network_event_register_any(
        &self,
        _net: Option<&OwnedObject>,
        _event_id: c_int,
        cb: NetworkLifecycleCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int {
        if self.refuse.load(Ordering::SeqCst) {
            return -1;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.networks.lock().unwrap().insert(
            id,
            NetworkRegistration {
                cb,
                opaque: opaque as usize,
                ff,
            },
        );
        id
    }

    fn network_event_deregister_any(&self, callback_id: c_int) -> c_int {
        match self.networks.lock().unwrap().remove(&callback_id) {
            Some(reg) => {
                self.retired.lock().unwrap().push((reg.opaque, reg.ff));
                0
            }
            None => -1,
        }
    }

    fn register_close_callback(
        &self,
        cb: ConnectCloseCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int {
        let mut close = self.close.lock().unwrap();
        if close.is_some() || self.refuse.load(Ordering::SeqCst) {
            return -1;
        }
        *close = Some(CloseRegistration {
            cb,
            opaque: opaque as usize,
            ff,
        });
        0
    }

    fn unregister_close_callback(&self, cb: ConnectCloseCallback) -> c_int {
        let mut close = self.close.lock().unwrap();
        match close.take() {
            Some(reg) if reg.cb as usize == cb as usize => {
                self.retired.lock().unwrap().push((reg.opaque, reg.ff));
                0
            }
            other => {
                *close = other;
                -1
            }
        }
    }
}

// ============================================================================
// Fake stream
// ============================================================================

#[derive(Default)]
pub struct FakeStream {
    id: usize,
    pub callback: Mutex<Option<(StreamEventCallback, usize, FreeCallback)>>,
    pub incoming: Mutex<Vec<u8>>,
    pub sent: Mutex<Vec<u8>>,
    pub would_block: AtomicBool,
    pub broken: AtomicBool,
    /// Most bytes a single send accepts
    pub send_window: AtomicUsize,
}

impl FakeStream {
    pub fn new(id: usize) -> FakeStream {
        FakeStream {
            id,
            send_window: AtomicUsize::new(usize::MAX),
            ..FakeStream::default()
        }
    }

    pub fn fire(&self, events: c_int) {
        let callback = *self.callback.lock().unwrap();
        if let Some((cb, opaque, _)) = callback {
            // SAFETY: the opaque is live until the free callback runs
            unsafe { cb(self.id as *mut c_void, events, opaque as *mut c_void) };
        }
    }
}

impl StreamEvents for FakeStream {
    fn stream_id(&self) -> usize {
        self.id
    }

    fn event_add_callback(
        &self,
        _events: c_int,
        cb: StreamEventCallback,
        opaque: *mut c_void,
        ff: FreeCallback,
    ) -> c_int {
        let mut callback = self.callback.lock().unwrap();
        if callback.is_some() {
            return -1;
        }
        *callback = Some((cb, opaque as usize, ff));
        0
    }

    fn event_remove_callback(&self) -> c_int {
        match self.callback.lock().unwrap().take() {
            Some((_, opaque, ff)) => {
                // SAFETY: registered pair, freed once
                unsafe { ff(opaque as *mut c_void) };
                0
            }
            None => -1,
        }
    }
}

impl StreamIo for FakeStream {
    fn send(&self, data: &[u8]) -> c_int {
        if self.broken.load(Ordering::SeqCst) {
            return -1;
        }
        if self.would_block.load(Ordering::SeqCst) {
            return -2;
        }
        let n = data.len().min(self.send_window.load(Ordering::SeqCst));
        self.sent.lock().unwrap().extend_from_slice(&data[..n]);
        n as c_int
    }

    fn recv(&self, buf: &mut [u8]) -> c_int {
        if self.broken.load(Ordering::SeqCst) {
            return -1;
        }
        if self.would_block.load(Ordering::SeqCst) {
            return -2;
        }
        let mut incoming = self.incoming.lock().unwrap();
        let n = buf.len().min(incoming.len());
        buf[..n].copy_from_slice(&incoming[..n]);
        incoming.drain(..n);
        n as c_int
    }
}

// ============================================================================
// Fake parameter family
// ============================================================================

/// A native getter/setter pair over an in-memory array
pub struct FakeFamily {
    pub current: Mutex<Vec<TypedParameter>>,
    pub applied: Mutex<Vec<HostDict>>,
    pub fail_get: AtomicBool,
    pub fail_set: AtomicBool,
    pub get_calls: AtomicUsize,
}

impl FakeFamily {
    /// `build` fills a scratch set; its entries are copied with freshly
    /// allocated string payloads owned by the family
    pub fn new(params: Vec<TypedParameter>) -> FakeFamily {
        FakeFamily {
            current: Mutex::new(params),
            applied: Mutex::new(Vec::new()),
            fail_get: AtomicBool::new(false),
            fail_set: AtomicBool::new(false),
            get_calls: AtomicUsize::new(0),
        }
    }
}

impl ParameterFamily for FakeFamily {
    fn get_operation(&self) -> &'static str {
        "fakeGetParameters"
    }

    fn set_operation(&self) -> &'static str {
        "fakeSetParameters"
    }

    fn get(
        &self,
        params: Option<&mut [TypedParameter]>,
        nparams: &mut c_int,
        _flags: c_uint,
    ) -> c_int {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_get.load(Ordering::SeqCst) {
            return -1;
        }
        let current = self.current.lock().unwrap();
        match params {
            None => {
                *nparams = current.len() as c_int;
                0
            }
            Some(slots) => {
                let n = slots.len().min(current.len()).min(*nparams as usize);
                for (slot, param) in slots.iter_mut().zip(current.iter()).take(n) {
                    *slot = duplicate(param);
                }
                *nparams = n as c_int;
                0
            }
        }
    }

    fn set(&self, params: &[TypedParameter], _flags: c_uint) -> c_int {
        if self.fail_set.load(Ordering::SeqCst) {
            return -1;
        }
        match virt_bridge_core_rs::decode(params) {
            Ok(dict) => {
                self.applied.lock().unwrap().push(dict);
                0
            }
            Err(_) => -1,
        }
    }
}

/// Copy a parameter, duplicating its string payload with the C library
/// the way a native getter fills caller-provided slots. These copies are
/// not counted by `live_payloads`.
pub fn duplicate(param: &TypedParameter) -> TypedParameter {
    use virt_bridge_core_rs::ParamValue;

    let mut copy = TypedParameter::zeroed();
    copy.field = param.field;
    copy.type_ = param.type_;
    copy.value = param.value;
    if let ParamValue::String(Some(s)) = param.value() {
        // SAFETY: `s` is a valid NUL-terminated string
        copy.value.s = unsafe { libc::strdup(s.as_ptr()) };
        // SAFETY: the `s` field was just written above
        assert!(!unsafe { copy.value.s }.is_null());
    }
    copy
}

/// Release a schema built by hand with [`duplicate`]d payloads
pub fn free_all(params: &mut Vec<TypedParameter>) {
    use virt_bridge_core_rs::TypedParamKind;

    for param in params.drain(..) {
        if param.kind() == Some(TypedParamKind::String) {
            // SAFETY: string payloads here come from `libc::strdup`
            unsafe { libc::free(param.value.s.cast()) };
        }
    }
}

// ============================================================================
// Bridge fixtures
// ============================================================================

pub struct Fixture {
    pub bridge: EventBridge,
    pub interpreter: Arc<RecordingInterpreter>,
    pub namespace: Arc<StaticNamespace>,
    pub registrar: Arc<FakeRegistrar>,
    pub host_loop: Arc<HostLoop>,
}

impl Fixture {
    /// A bridge with the host loop installed and the invoker helpers in
    /// the namespace
    pub fn new() -> Fixture {
        let interpreter = Arc::new(RecordingInterpreter::default());
        let namespace = Arc::new(StaticNamespace::new());
        let registrar = FakeRegistrar::new();
        let bridge = EventBridge::new(interpreter.clone(), namespace.clone(), registrar.clone());
        namespace.insert("_eventInvokeHandleCallback", bridge.handle_invoker());
        namespace.insert("_eventInvokeTimeoutCallback", bridge.timeout_invoker());

        let host_loop = HostLoop::new();
        bridge.register_impl(&host_loop.primitives()).unwrap();

        Fixture {
            bridge,
            interpreter,
            namespace,
            registrar,
            host_loop,
        }
    }
}
