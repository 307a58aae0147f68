//! Tests for domain/network/close/stream callback registration and the
//! native -> host dispatch choreography

mod common;

use std::ffi::CString;
use std::os::raw::c_void;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{proxy_data, FakeConnection, FakeObject, FakeStream, Fixture, Recorder};
use virt_bridge_core_rs::events::dispatch::{
    domain_callback_for, CLOSE, DOMAIN_BLOCK_JOB, DOMAIN_GRAPHICS, DOMAIN_IO_ERROR,
    DOMAIN_LEGACY, DOMAIN_LIFECYCLE, DOMAIN_TUNABLE, NETWORK_LIFECYCLE, STREAM_EVENT,
};
use virt_bridge_core_rs::events::{
    DomainEventCallback, GraphicsAddress, GraphicsSubject, GraphicsSubjectIdentity,
};
use virt_bridge_core_rs::{
    BridgeError, DomainEventId, HostDict, HostErrorKind, HostFunction, HostValue, MethodTable,
    TypedParamSet,
};

const CONN: *mut c_void = 0x1000 as *mut c_void;

fn lifecycle(cb: DomainEventCallback) -> virt_bridge_core_rs::events::native::DomainLifecycleCallback {
    match cb {
        DomainEventCallback::Lifecycle(f) => f,
        other => panic!("expected lifecycle callback, got {other:?}"),
    }
}

// ============================================================================
// Domain events
// ============================================================================

#[test]
fn test_lifecycle_event_reaches_proxy_with_data_last() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(1);
    let recorder = Recorder::new();
    let data = proxy_data("conn", &recorder, &[DOMAIN_LIFECYCLE]);
    let dom = FakeObject::new();

    let id = fx
        .bridge
        .register_domain_event(&conn, None, DomainEventId::Lifecycle.raw(), data.clone())
        .unwrap();
    assert_eq!(fx.bridge.live_registrations(), 1);

    let reg = conn.domain(id);
    // SAFETY: the registration is live; `dom` outlives the call
    let rc = unsafe { lifecycle(reg.cb)(CONN, dom.ptr(), 2, 1, reg.opaque()) };
    assert_eq!(rc, 0);

    let calls = recorder.calls();
    assert_eq!(calls.len(), 1);
    let (name, args) = &calls[0];
    assert_eq!(name, DOMAIN_LIFECYCLE);
    assert_eq!(args.len(), 4);
    assert_eq!(args[0].as_native().unwrap().as_ptr(), dom.ptr());
    assert_eq!(args[1], HostValue::Int(2));
    assert_eq!(args[2], HostValue::Int(1));
    assert_eq!(args[3].get_item("opaque"), data.get_item("opaque"));
}

#[test]
fn test_wrapped_object_holds_its_own_reference() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(2);
    let recorder = Recorder::new();
    let data = proxy_data("conn", &recorder, &[DOMAIN_LIFECYCLE]);
    let dom = FakeObject::new();

    let id = fx
        .bridge
        .register_domain_event(&conn, None, 0, data)
        .unwrap();
    let reg = conn.domain(id);

    // SAFETY: the registration is live; `dom` outlives the call
    unsafe { lifecycle(reg.cb)(CONN, dom.ptr(), 0, 0, reg.opaque()) };
    assert_eq!(dom.refs(), 2, "host wrapper keeps a reference");

    recorder.clear();
    assert_eq!(dom.refs(), 1, "dropping the wrapper releases it");
}

#[test]
fn test_missing_method_returns_error_and_reports() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(3);
    let recorder = Recorder::new();
    let data = proxy_data("conn", &recorder, &[]);
    let dom = FakeObject::new();

    let id = fx.bridge.register_domain_event(&conn, None, 0, data).unwrap();
    let reg = conn.domain(id);

    // SAFETY: the registration is live; `dom` outlives the call
    let rc = unsafe { lifecycle(reg.cb)(CONN, dom.ptr(), 0, 0, reg.opaque()) };
    assert_eq!(rc, -1);
    assert!(fx
        .interpreter
        .reported()
        .iter()
        .any(|r| r.starts_with("AttributeError") && r.contains(DOMAIN_LIFECYCLE)));
    assert_eq!(dom.refs(), 1);
}

#[test]
fn test_missing_proxy_returns_error() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(4);
    let recorder = Recorder::new();
    let data = proxy_data("not_conn", &recorder, &[DOMAIN_LIFECYCLE]);
    let dom = FakeObject::new();

    let id = fx.bridge.register_domain_event(&conn, None, 0, data).unwrap();
    let reg = conn.domain(id);

    // SAFETY: the registration is live; `dom` outlives the call
    let rc = unsafe { lifecycle(reg.cb)(CONN, dom.ptr(), 0, 0, reg.opaque()) };
    assert_eq!(rc, -1);
    assert!(recorder.calls().is_empty());
}

#[test]
fn test_host_exception_is_reported_and_swallowed() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(5);
    let recorder = Recorder::new();
    let proxy = MethodTable::new("virConnect")
        .with_method(DOMAIN_LIFECYCLE, recorder.raising_method(DOMAIN_LIFECYCLE));
    let mut data = HostDict::new();
    data.insert("conn".to_string(), proxy.into_value());
    let dom = FakeObject::new();

    let id = fx
        .bridge
        .register_domain_event(&conn, None, 0, HostValue::Dict(data))
        .unwrap();
    let reg = conn.domain(id);

    // SAFETY: the registration is live; `dom` outlives the call
    let rc = unsafe { lifecycle(reg.cb)(CONN, dom.ptr(), 0, 0, reg.opaque()) };
    assert_eq!(rc, 0);
    assert_eq!(recorder.calls().len(), 1);
    assert!(fx.interpreter.reported().iter().any(|r| r.contains("failed")));
}

#[test]
fn test_null_object_fails_argument_building() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(6);
    let recorder = Recorder::new();
    let data = proxy_data("conn", &recorder, &[DOMAIN_LIFECYCLE]);

    let id = fx.bridge.register_domain_event(&conn, None, 0, data).unwrap();
    let reg = conn.domain(id);

    // SAFETY: the registration is live
    let rc = unsafe { lifecycle(reg.cb)(CONN, ptr::null_mut(), 0, 0, reg.opaque()) };
    assert_eq!(rc, -1);
    assert!(recorder.calls().is_empty());
    assert_eq!(fx.interpreter.reported().len(), 1);
}

#[test]
fn test_io_error_null_strings_become_none() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(7);
    let recorder = Recorder::new();
    let data = proxy_data("conn", &recorder, &[DOMAIN_IO_ERROR]);
    let dom = FakeObject::new();

    let id = fx
        .bridge
        .register_domain_event(&conn, None, DomainEventId::IoError.raw(), data)
        .unwrap();
    let reg = conn.domain(id);
    let DomainEventCallback::IoError(cb) = reg.cb else {
        panic!("expected io-error callback");
    };

    let alias = CString::new("virtio-disk0").unwrap();
    // SAFETY: the registration is live; strings outlive the call
    let rc = unsafe { cb(CONN, dom.ptr(), ptr::null(), alias.as_ptr(), 1, reg.opaque()) };
    assert_eq!(rc, 0);

    let (_, args) = &recorder.calls()[0];
    assert_eq!(args[1], HostValue::None);
    assert_eq!(args[2], HostValue::Str("virtio-disk0".to_string()));
    assert_eq!(args[3], HostValue::Int(1));
}

#[test]
fn test_graphics_event_builds_addresses_and_subject() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(8);
    let recorder = Recorder::new();
    let data = proxy_data("conn", &recorder, &[DOMAIN_GRAPHICS]);
    let dom = FakeObject::new();

    let id = fx
        .bridge
        .register_domain_event(&conn, None, DomainEventId::Graphics.raw(), data)
        .unwrap();
    let reg = conn.domain(id);
    let DomainEventCallback::Graphics(cb) = reg.cb else {
        panic!("expected graphics callback");
    };

    let node = CString::new("127.0.0.1").unwrap();
    let service = CString::new("5900").unwrap();
    let scheme = CString::new("vnc").unwrap();
    let kind = CString::new("x509dname").unwrap();
    let name = CString::new("CN=client").unwrap();
    let local = GraphicsAddress {
        family: 0,
        node: node.as_ptr(),
        service: service.as_ptr(),
    };
    let identity = GraphicsSubjectIdentity {
        kind: kind.as_ptr(),
        name: name.as_ptr(),
    };
    let subject = GraphicsSubject {
        nidentity: 1,
        identities: &identity,
    };

    // SAFETY: the registration is live; all pointers outlive the call
    let rc = unsafe {
        cb(
            CONN,
            dom.ptr(),
            1,
            &local,
            ptr::null(),
            scheme.as_ptr(),
            &subject,
            reg.opaque(),
        )
    };
    assert_eq!(rc, 0);

    let (_, args) = &recorder.calls()[0];
    assert_eq!(args[1], HostValue::Int(1));
    let local = args[2].as_dict().unwrap();
    assert_eq!(local["node"], HostValue::Str("127.0.0.1".to_string()));
    assert_eq!(local["service"], HostValue::Str("5900".to_string()));
    assert_eq!(args[3], HostValue::None);
    assert_eq!(args[4], HostValue::Str("vnc".to_string()));
    assert_eq!(
        args[5],
        HostValue::List(vec![HostValue::Tuple(vec![
            HostValue::Str("x509dname".to_string()),
            HostValue::Str("CN=client".to_string()),
        ])])
    );
}

#[test]
fn test_tunable_event_decodes_parameters() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(9);
    let recorder = Recorder::new();
    let data = proxy_data("conn", &recorder, &[DOMAIN_TUNABLE]);
    let dom = FakeObject::new();

    let id = fx
        .bridge
        .register_domain_event(&conn, None, DomainEventId::Tunable.raw(), data)
        .unwrap();
    let reg = conn.domain(id);
    let DomainEventCallback::Tunable(cb) = reg.cb else {
        panic!("expected tunable callback");
    };

    let mut params = TypedParamSet::new();
    params.add_ullong("cputune.vcpu0.period", 100_000).unwrap();
    params.add_string("cputune.emulatorpin", "0-3").unwrap();

    // SAFETY: the registration is live; params outlive the call
    let rc = unsafe {
        cb(
            CONN,
            dom.ptr(),
            params.as_slice().as_ptr(),
            params.native_len().unwrap(),
            reg.opaque(),
        )
    };
    assert_eq!(rc, 0);

    let (_, args) = &recorder.calls()[0];
    let tuned = args[1].as_dict().unwrap();
    assert_eq!(tuned["cputune.vcpu0.period"], HostValue::Int(100_000));
    assert_eq!(tuned["cputune.emulatorpin"], HostValue::Str("0-3".to_string()));
}

#[test]
fn test_block_job_ids_share_one_callback() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(10);
    let recorder = Recorder::new();
    let data = proxy_data("conn", &recorder, &[DOMAIN_BLOCK_JOB]);
    let dom = FakeObject::new();

    let id = fx
        .bridge
        .register_domain_event(&conn, Some(&dom_owned(dom)), DomainEventId::BlockJob2.raw(), data)
        .unwrap();
    let reg = conn.domain(id);
    assert_eq!(reg.dom, dom.ptr() as usize);
    assert_eq!(reg.event_id, 16);
    let DomainEventCallback::BlockJob(cb) = reg.cb else {
        panic!("expected block-job callback");
    };

    let disk = CString::new("/var/lib/images/vm.qcow2").unwrap();
    // SAFETY: the registration is live; strings outlive the call
    unsafe { cb(CONN, dom.ptr(), disk.as_ptr(), 1, 0, reg.opaque()) };
    assert_eq!(recorder.names(), vec![DOMAIN_BLOCK_JOB.to_string()]);
}

fn dom_owned(dom: &'static FakeObject) -> virt_bridge_core_rs::OwnedObject {
    // SAFETY: `dom` is live; this takes one reference of its own
    unsafe { virt_bridge_core_rs::BorrowedObject::from_raw(dom.ptr(), common::FAKE_DOMAIN_OPS) }
        .unwrap()
        .to_owned()
        .unwrap()
}

#[test]
fn test_every_domain_event_id_has_a_callback() {
    for id in DomainEventId::ALL {
        let cb = domain_callback_for(id);
        let expected = match id {
            DomainEventId::Reboot | DomainEventId::ControlError => "Generic",
            DomainEventId::BlockJob | DomainEventId::BlockJob2 => "BlockJob",
            DomainEventId::PmWakeup | DomainEventId::PmSuspend | DomainEventId::PmSuspendDisk => {
                "Reason"
            }
            DomainEventId::DeviceAdded | DomainEventId::DeviceRemoved => "Device",
            _ => "",
        };
        if !expected.is_empty() {
            assert!(format!("{cb:?}").ends_with(expected), "{id:?} -> {cb:?}");
        }
        assert_eq!(DomainEventId::from_raw(id.raw()), Some(id));
    }
    assert_eq!(DomainEventId::from_raw(20), None);
}

#[test]
fn test_unknown_event_id_rejected_without_native_call() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(11);
    let err = fx
        .bridge
        .register_domain_event(&conn, None, 99, HostValue::None)
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument(_)));
    assert!(conn.domains.lock().unwrap().is_empty());

    let err = fx
        .bridge
        .register_network_event(&conn, None, 1, HostValue::None)
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument(_)));
}

#[test]
fn test_refused_registration_releases_context() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(12);
    conn.refuse.store(true, Ordering::SeqCst);
    let token = Arc::new(MethodTable::new("token"));

    let err = fx
        .bridge
        .register_domain_event(&conn, None, 0, HostValue::Object(token.clone()))
        .unwrap_err();
    assert!(matches!(err, BridgeError::NativeCall { code: -1, .. }));
    assert_eq!(err.host_error_kind(), HostErrorKind::RuntimeError);
    assert_eq!(Arc::strong_count(&token), 1);
    assert_eq!(fx.bridge.live_registrations(), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_deregistration_stops_dispatch_before_native_release() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(13);
    let recorder = Recorder::new();
    let data = proxy_data("conn", &recorder, &[DOMAIN_LIFECYCLE]);
    let dom = FakeObject::new();

    let id = fx.bridge.register_domain_event(&conn, None, 0, data).unwrap();
    let reg = conn.domain(id);

    fx.bridge.deregister_domain_event(&conn, id).unwrap();

    // the native side still holds the context and fires a late event
    // SAFETY: the context is alive until the retired free callback runs
    let rc = unsafe { lifecycle(reg.cb)(CONN, dom.ptr(), 0, 0, reg.opaque()) };
    assert_eq!(rc, 0);
    assert!(recorder.calls().is_empty());
    assert_eq!(dom.refs(), 1);

    assert_eq!(conn.release_retired(), 1);
    assert_eq!(fx.bridge.live_registrations(), 0);
}

#[test]
fn test_deregister_unknown_id_fails() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(14);
    let err = fx.bridge.deregister_domain_event(&conn, 42).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::NativeCall {
            operation: "virConnectDomainEventDeregisterAny",
            ..
        }
    ));
}

#[test]
fn test_release_drops_host_data() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(15);
    let token = Arc::new(MethodTable::new("token"));

    let id = fx
        .bridge
        .register_domain_event(&conn, None, 0, HostValue::Object(token.clone()))
        .unwrap();
    assert_eq!(Arc::strong_count(&token), 2);

    fx.bridge.deregister_domain_event(&conn, id).unwrap();
    assert_eq!(Arc::strong_count(&token), 2);
    conn.release_retired();
    assert_eq!(Arc::strong_count(&token), 1);
}

// ============================================================================
// Network, close and stream callbacks
// ============================================================================

#[test]
fn test_network_lifecycle_dispatch() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(16);
    let recorder = Recorder::new();
    let data = proxy_data("conn", &recorder, &[NETWORK_LIFECYCLE]);
    let net = FakeObject::new();

    let id = fx.bridge.register_network_event(&conn, None, 0, data).unwrap();
    let reg = conn.networks.lock().unwrap()[&id];

    // SAFETY: the registration is live; `net` outlives the call
    let rc = unsafe { (reg.cb)(CONN, net.ptr(), 2, 0, reg.opaque as *mut c_void) };
    assert_eq!(rc, 0);
    {
        let calls = recorder.calls();
        let (name, args) = &calls[0];
        assert_eq!(name, NETWORK_LIFECYCLE);
        assert_eq!(
            args[0].as_native().unwrap().kind(),
            virt_bridge_core_rs::ObjectKind::Network
        );
        assert_eq!(args.len(), 4);
    }

    recorder.clear();
    assert_eq!(net.refs(), 1);
    fx.bridge.deregister_network_event(&conn, id).unwrap();
    conn.release_retired();
    assert_eq!(fx.bridge.live_registrations(), 0);
}

#[test]
fn test_legacy_domain_callback_dispatches_on_connection_proxy() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(19);
    let recorder = Recorder::new();
    let proxy = MethodTable::new("virConnect")
        .with_method(DOMAIN_LEGACY, recorder.method(DOMAIN_LEGACY))
        .into_value();
    let dom = FakeObject::new();

    fx.bridge.register_domain_event_legacy(&conn, proxy.clone()).unwrap();
    assert!(matches!(
        fx.bridge.register_domain_event_legacy(&conn, proxy),
        Err(BridgeError::NativeCall {
            operation: "virConnectDomainEventRegister",
            ..
        })
    ));
    assert_eq!(fx.bridge.live_registrations(), 1);

    let reg = conn.legacy.lock().unwrap().unwrap();
    // SAFETY: the registration is live; `dom` outlives the call
    let rc = unsafe { (reg.cb)(CONN, dom.ptr(), 3, 1, reg.opaque as *mut c_void) };
    assert_eq!(rc, 0);
    {
        let calls = recorder.calls();
        let (name, args) = &calls[0];
        assert_eq!(name, DOMAIN_LEGACY);
        // no callback data is appended
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].as_native().unwrap().as_ptr(), dom.ptr());
        assert_eq!(args[1], HostValue::Int(3));
        assert_eq!(args[2], HostValue::Int(1));
    }
    recorder.clear();
    assert_eq!(dom.refs(), 1);

    fx.bridge.deregister_domain_event_legacy(&conn).unwrap();
    // SAFETY: the context lives until the retired free callback runs
    let rc = unsafe { (reg.cb)(CONN, dom.ptr(), 0, 0, reg.opaque as *mut c_void) };
    assert_eq!(rc, 0);
    assert!(recorder.calls().is_empty());
    assert!(fx.bridge.deregister_domain_event_legacy(&conn).is_err());

    assert_eq!(conn.release_retired(), 1);
    assert_eq!(fx.bridge.live_registrations(), 0);
}

#[test]
fn test_legacy_domain_callback_raise_fails_the_event() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(20);
    let recorder = Recorder::new();
    let proxy = MethodTable::new("virConnect")
        .with_method(DOMAIN_LEGACY, recorder.raising_method(DOMAIN_LEGACY))
        .into_value();
    let dom = FakeObject::new();

    fx.bridge.register_domain_event_legacy(&conn, proxy).unwrap();
    let reg = conn.legacy.lock().unwrap().unwrap();
    // SAFETY: the registration is live; `dom` outlives the call
    let rc = unsafe { (reg.cb)(CONN, dom.ptr(), 0, 0, reg.opaque as *mut c_void) };
    assert_eq!(rc, -1);
    assert_eq!(recorder.calls().len(), 1);
    assert!(fx
        .interpreter
        .reported()
        .iter()
        .any(|r| r.contains(&format!("{DOMAIN_LEGACY} failed"))));

    fx.bridge.deregister_domain_event_legacy(&conn).unwrap();
    conn.release_retired();
}

#[test]
fn test_close_callback_dispatch_and_unregister() {
    let fx = Fixture::new();
    let conn = FakeConnection::new(17);
    let recorder = Recorder::new();
    let data = proxy_data("conn", &recorder, &[CLOSE]);

    fx.bridge.register_close_callback(&conn, data.clone()).unwrap();
    // only one close callback per connection
    assert!(fx.bridge.register_close_callback(&conn, data).is_err());

    let reg = conn.close.lock().unwrap().unwrap();
    // SAFETY: the registration is live
    unsafe { (reg.cb)(CONN, 1, reg.opaque as *mut c_void) };
    let (name, args) = &recorder.calls()[0];
    assert_eq!(name, CLOSE);
    assert_eq!(args[0], HostValue::Int(1));

    fx.bridge.unregister_close_callback(&conn).unwrap();
    // SAFETY: the context lives until the retired free callback runs
    unsafe { (reg.cb)(CONN, 2, reg.opaque as *mut c_void) };
    assert_eq!(recorder.calls().len(), 1);
    conn.release_retired();
}

#[test]
fn test_stream_callback_dispatch_and_remove() {
    let fx = Fixture::new();
    let stream = FakeStream::new(0x2000);
    let recorder = Recorder::new();
    let data = proxy_data("stream", &recorder, &[STREAM_EVENT]);
    let token = Arc::new(MethodTable::new("token"));
    let data = match data {
        HostValue::Dict(mut d) => {
            d.insert("token".to_string(), HostValue::Object(token.clone()));
            HostValue::Dict(d)
        }
        other => other,
    };

    fx.bridge.add_stream_callback(&stream, 1, data).unwrap();
    stream.fire(1);
    stream.fire(8);
    assert_eq!(
        recorder
            .calls()
            .iter()
            .map(|(_, args)| args[0].clone())
            .collect::<Vec<_>>(),
        vec![HostValue::Int(1), HostValue::Int(8)]
    );
    recorder.clear();

    fx.bridge.remove_stream_callback(&stream).unwrap();
    assert_eq!(Arc::strong_count(&token), 1);
    assert!(fx.bridge.remove_stream_callback(&stream).is_err());
}

#[test]
fn test_dispatch_helpers_are_host_functions() {
    // dispatch targets may be arbitrary host callables, not only recorders
    let fx = Fixture::new();
    let conn = FakeConnection::new(18);
    let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let proxy = MethodTable::new("virConnect").with_method(
        DOMAIN_LIFECYCLE,
        HostFunction::new(DOMAIN_LIFECYCLE, move |args| {
            assert_eq!(args.len(), 4);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(HostValue::None)
        }),
    );
    let mut data = HostDict::new();
    data.insert("conn".to_string(), proxy.into_value());
    let dom = FakeObject::new();

    let id = fx
        .bridge
        .register_domain_event(&conn, None, 0, HostValue::Dict(data))
        .unwrap();
    let reg = conn.domain(id);
    for _ in 0..3 {
        // SAFETY: the registration is live; `dom` outlives the call
        unsafe { lifecycle(reg.cb)(CONN, dom.ptr(), 0, 0, reg.opaque()) };
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(dom.refs(), 1);
}
