//! Callback registration and cancellation
//!
//! Registering hands the native side a fresh context holding the host's
//! callback data; the native side owns that reference until it calls the
//! free callback. The bridge keeps a weak handle per registration so that
//! deregistering can stop dispatch immediately, even while the native side
//! still holds the context.

use std::os::raw::{c_int, c_void};
use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::events::bridge::EventBridge;
use crate::events::context::{release_context, CallbackContext};
use crate::events::dispatch;
use crate::events::native::{ConnectEvents, DomainEventId, NetworkEventId, StreamEvents};
use crate::host::{allow_threads, HostValue};
use crate::objects::{ObjectOps, OwnedObject};

/// Identity of a live registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum RegistrationKey {
    Domain { conn: usize, callback_id: c_int },
    DomainLegacy { conn: usize },
    Network { conn: usize, callback_id: c_int },
    Close { conn: usize },
    Stream { stream: usize },
}

impl EventBridge {
    /// Have `_dispatchDomainEventCallbacks(dom, event, detail)` called on
    /// `conn_proxy` for lifecycle events of every domain
    ///
    /// `conn_proxy` is the connection object itself, not a dict holding
    /// it, and nothing is appended to the dispatch arguments.
    pub fn register_domain_event_legacy(
        &self,
        conn: &dyn ConnectEvents,
        conn_proxy: HostValue,
    ) -> Result<()> {
        self.register_with(
            "virConnectDomainEventRegister",
            conn_proxy,
            Some(conn.domain_ops()),
            |_| RegistrationKey::DomainLegacy {
                conn: conn.connection_id(),
            },
            |opaque| conn.domain_event_register(dispatch::domain_legacy, opaque, release_context),
        )?;
        log::debug!("Registered whole-connection domain lifecycle callback");
        Ok(())
    }

    pub fn deregister_domain_event_legacy(&self, conn: &dyn ConnectEvents) -> Result<()> {
        let rc = allow_threads(self.interpreter(), || {
            conn.domain_event_deregister(dispatch::domain_legacy)
        });
        if rc < 0 {
            return Err(BridgeError::native("virConnectDomainEventDeregister", rc));
        }
        self.shared.cancel(RegistrationKey::DomainLegacy {
            conn: conn.connection_id(),
        });
        Ok(())
    }

    /// Subscribe the connection proxy in `data` to a domain event
    ///
    /// `data` must hold the connection proxy under the configured
    /// connection key. Returns the native callback id.
    pub fn register_domain_event(
        &self,
        conn: &dyn ConnectEvents,
        dom: Option<&OwnedObject>,
        event_id: c_int,
        data: HostValue,
    ) -> Result<c_int> {
        let id = DomainEventId::from_raw(event_id).ok_or_else(|| {
            BridgeError::InvalidArgument(format!("unsupported domain event id {event_id}"))
        })?;
        let callback = dispatch::domain_callback_for(id);

        let callback_id = self.register_with(
            "virConnectDomainEventRegisterAny",
            data,
            Some(conn.domain_ops()),
            |callback_id| RegistrationKey::Domain {
                conn: conn.connection_id(),
                callback_id,
            },
            |opaque| {
                conn.domain_event_register_any(dom, event_id, callback, opaque, release_context)
            },
        )?;
        log::debug!("Registered domain event {id:?} as callback {callback_id}");
        Ok(callback_id)
    }

    /// Cancel a domain event subscription
    pub fn deregister_domain_event(&self, conn: &dyn ConnectEvents, callback_id: c_int) -> Result<()> {
        let rc = allow_threads(self.interpreter(), || conn.domain_event_deregister_any(callback_id));
        if rc < 0 {
            return Err(BridgeError::native("virConnectDomainEventDeregisterAny", rc));
        }
        self.shared.cancel(RegistrationKey::Domain {
            conn: conn.connection_id(),
            callback_id,
        });
        Ok(())
    }

    /// Subscribe the connection proxy in `data` to a network event
    pub fn register_network_event(
        &self,
        conn: &dyn ConnectEvents,
        net: Option<&OwnedObject>,
        event_id: c_int,
        data: HostValue,
    ) -> Result<c_int> {
        if NetworkEventId::from_raw(event_id).is_none() {
            return Err(BridgeError::InvalidArgument(format!(
                "unsupported network event id {event_id}"
            )));
        }

        self.register_with(
            "virConnectNetworkEventRegisterAny",
            data,
            Some(conn.network_ops()),
            |callback_id| RegistrationKey::Network {
                conn: conn.connection_id(),
                callback_id,
            },
            |opaque| {
                conn.network_event_register_any(
                    net,
                    event_id,
                    dispatch::network_lifecycle,
                    opaque,
                    release_context,
                )
            },
        )
    }

    pub fn deregister_network_event(&self, conn: &dyn ConnectEvents, callback_id: c_int) -> Result<()> {
        let rc = allow_threads(self.interpreter(), || conn.network_event_deregister_any(callback_id));
        if rc < 0 {
            return Err(BridgeError::native("virConnectNetworkEventDeregisterAny", rc));
        }
        self.shared.cancel(RegistrationKey::Network {
            conn: conn.connection_id(),
            callback_id,
        });
        Ok(())
    }

    /// Have `_dispatchCloseCallback(reason, data)` called on the connection
    /// proxy when the connection closes
    pub fn register_close_callback(&self, conn: &dyn ConnectEvents, data: HostValue) -> Result<()> {
        self.register_with(
            "virConnectRegisterCloseCallback",
            data,
            None,
            |_| RegistrationKey::Close {
                conn: conn.connection_id(),
            },
            |opaque| {
                conn.register_close_callback(dispatch::connection_closed, opaque, release_context)
            },
        )?;
        Ok(())
    }

    pub fn unregister_close_callback(&self, conn: &dyn ConnectEvents) -> Result<()> {
        let rc = allow_threads(self.interpreter(), || {
            conn.unregister_close_callback(dispatch::connection_closed)
        });
        if rc < 0 {
            return Err(BridgeError::native("virConnectUnregisterCloseCallback", rc));
        }
        self.shared.cancel(RegistrationKey::Close {
            conn: conn.connection_id(),
        });
        Ok(())
    }

    /// Have `_dispatchStreamEventCallback(events, data)` called on the
    /// stream proxy in `data` whenever the stream is ready
    pub fn add_stream_callback(
        &self,
        stream: &dyn StreamEvents,
        events: c_int,
        data: HostValue,
    ) -> Result<()> {
        self.register_with(
            "virStreamEventAddCallback",
            data,
            None,
            |_| RegistrationKey::Stream {
                stream: stream.stream_id(),
            },
            |opaque| {
                stream.event_add_callback(events, dispatch::stream_event, opaque, release_context)
            },
        )?;
        Ok(())
    }

    pub fn remove_stream_callback(&self, stream: &dyn StreamEvents) -> Result<()> {
        let rc = allow_threads(self.interpreter(), || stream.event_remove_callback());
        if rc < 0 {
            return Err(BridgeError::native("virStreamEventRemoveCallback", rc));
        }
        self.shared.cancel(RegistrationKey::Stream {
            stream: stream.stream_id(),
        });
        Ok(())
    }

    fn register_with(
        &self,
        operation: &'static str,
        data: HostValue,
        object_ops: Option<ObjectOps>,
        key: impl FnOnce(c_int) -> RegistrationKey,
        register: impl FnOnce(*mut c_void) -> c_int,
    ) -> Result<c_int> {
        let ctx = CallbackContext::new(Arc::clone(&self.shared), data, object_ops);
        let opaque = CallbackContext::into_opaque(Arc::clone(&ctx));

        let rc = allow_threads(self.interpreter(), || register(opaque));
        if rc < 0 {
            // SAFETY: the native side refused the registration and kept no copy
            drop(unsafe { CallbackContext::reclaim(opaque) });
            return Err(BridgeError::native(operation, rc));
        }
        self.shared.track(key(rc), &ctx);
        Ok(rc)
    }
}
