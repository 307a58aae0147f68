//! Bridge configuration
//!
//! Names of the host-side helpers the bridge calls into and the keys it
//! reads from registration contexts. The defaults match the host module
//! shipped alongside the native library; embedders with a different host
//! layer override them.

use serde::{Deserialize, Serialize};

/// Host-side names and policy knobs
///
/// # Example
/// ```
/// use virt_bridge_core_rs::BridgeConfig;
///
/// let config = BridgeConfig::from_json(r#"{"connection_key": "connection"}"#).unwrap();
/// assert_eq!(config.connection_key, "connection");
/// assert_eq!(config.invoke_handle_name, "_eventInvokeHandleCallback");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Host module whose namespace provides the helper functions
    pub host_module: String,

    /// Helper handed to the add-handle primitive
    pub invoke_handle_name: String,

    /// Helper handed to the add-timeout primitive
    pub invoke_timeout_name: String,

    /// Helper called when a host-registered handle fires
    pub dispatch_handle_name: String,

    /// Helper called when a host-registered timeout fires
    pub dispatch_timeout_name: String,

    /// Context key holding the connection's dispatch proxy
    pub connection_key: String,

    /// Context key holding the stream's dispatch proxy
    pub stream_key: String,

    /// Compare capsules returned by the remove primitives with the pair
    /// recorded at add time
    pub verify_removed_capsules: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host_module: "libvirt".to_string(),
            invoke_handle_name: "_eventInvokeHandleCallback".to_string(),
            invoke_timeout_name: "_eventInvokeTimeoutCallback".to_string(),
            dispatch_handle_name: "_dispatchEventHandleCallback".to_string(),
            dispatch_timeout_name: "_dispatchEventTimeoutCallback".to_string(),
            connection_key: "conn".to_string(),
            stream_key: "stream".to_string(),
            verify_removed_capsules: true,
        }
    }
}

impl BridgeConfig {
    /// Every recognized field name
    pub const FIELDS: [&'static str; 8] = [
        "host_module",
        "invoke_handle_name",
        "invoke_timeout_name",
        "dispatch_handle_name",
        "dispatch_timeout_name",
        "connection_key",
        "stream_key",
        "verify_removed_capsules",
    ];

    /// Parse a configuration, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
