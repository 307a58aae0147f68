//! Event-loop functions exposed to Python
//!
//! All of them route to the process-wide bridge, created on first use with
//! the GIL-backed interpreter and the configured helper module.

use std::os::raw::c_int;
use std::sync::Arc;

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTuple};

use crate::config::BridgeConfig;
use crate::events::{global_or_init, install_global, EventBridge};
use crate::ffi::gil::{GilInterpreter, ModuleNamespace};
use crate::ffi::to_py_err;
use crate::ffi::types::{config_from_py, host_value, opaque_data, PyNativeCapsule};
use crate::host::HostValue;
use crate::sys::Libvirt;

fn new_bridge(config: BridgeConfig) -> EventBridge {
    EventBridge::with_config(
        Arc::new(GilInterpreter),
        Arc::new(ModuleNamespace::new(config.host_module.clone())),
        Arc::new(Libvirt),
        config,
    )
}

fn bridge() -> &'static EventBridge {
    global_or_init(|| new_bridge(BridgeConfig::default()))
}

/// Create the process-wide bridge with non-default helper names
///
/// Must run before any other event function; afterwards the bridge is
/// fixed for the life of the process.
#[pyfunction]
#[pyo3(name = "configure", signature = (config=None))]
pub fn py_configure(config: Option<&Bound<'_, PyDict>>) -> PyResult<()> {
    let config = match config {
        Some(dict) => config_from_py(dict)?,
        None => BridgeConfig::default(),
    };
    log::debug!("Configuring event bridge with helper module {}", config.host_module);
    install_global(new_bridge(config)).map(|_| ()).map_err(to_py_err)
}

fn capsule(capsule: &Bound<'_, PyNativeCapsule>) -> HostValue {
    HostValue::Capsule(capsule.get().capsule)
}

/// Install the Python event loop: six callables for add/update/remove
/// handle and add/update/remove timeout
#[pyfunction]
#[pyo3(name = "virEventRegisterImpl", signature = (*args))]
pub fn py_event_register_impl(args: &Bound<'_, PyTuple>) -> PyResult<()> {
    let args = args
        .iter()
        .map(|arg| host_value(&arg))
        .collect::<PyResult<Vec<_>>>()?;
    bridge().register_impl(&args).map_err(to_py_err)
}

/// Run a native handle callback from the Python loop
#[pyfunction]
#[pyo3(name = "virEventInvokeHandleCallback")]
pub fn py_event_invoke_handle_callback(
    watch: c_int,
    fd: c_int,
    event: c_int,
    cb: &Bound<'_, PyNativeCapsule>,
    opaque: &Bound<'_, PyNativeCapsule>,
) -> PyResult<()> {
    bridge()
        .invoke_handle_callback(watch, fd, event, &capsule(cb), &capsule(opaque))
        .map_err(to_py_err)
}

/// Run a native timeout callback from the Python loop
#[pyfunction]
#[pyo3(name = "virEventInvokeTimeoutCallback")]
pub fn py_event_invoke_timeout_callback(
    timer: c_int,
    cb: &Bound<'_, PyNativeCapsule>,
    opaque: &Bound<'_, PyNativeCapsule>,
) -> PyResult<()> {
    bridge()
        .invoke_timeout_callback(timer, &capsule(cb), &capsule(opaque))
        .map_err(to_py_err)
}

/// Watch `fd` on whatever event loop is installed; readiness is delivered
/// to the helper module's handle dispatcher with `opaque`
#[pyfunction]
#[pyo3(name = "virEventAddHandle")]
pub fn py_event_add_handle(fd: c_int, event: c_int, opaque: &Bound<'_, PyAny>) -> PyResult<c_int> {
    bridge()
        .event_add_handle(fd, event, opaque_data(opaque))
        .map_err(to_py_err)
}

/// Arm a timer on whatever event loop is installed
#[pyfunction]
#[pyo3(name = "virEventAddTimeout")]
pub fn py_event_add_timeout(timeout: c_int, opaque: &Bound<'_, PyAny>) -> PyResult<c_int> {
    bridge()
        .event_add_timeout(timeout, opaque_data(opaque))
        .map_err(to_py_err)
}
