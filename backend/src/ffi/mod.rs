//! Python bindings
//!
//! Exposes the event-loop primitives and the typed-parameter codec to
//! Python. The bridge below is the same one the pure-Rust API drives; this
//! layer only converts values and errors at the boundary.

pub mod events;
pub mod gil;
pub mod params;
pub mod types;

use pyo3::exceptions::{
    PyAttributeError, PyLookupError, PyMemoryError, PyOverflowError, PyRuntimeError, PyTypeError,
    PyValueError,
};
use pyo3::PyErr;

use crate::error::{BridgeError, HostError, HostErrorKind};

/// Raise a bridge error as the matching Python exception
pub(crate) fn to_py_err(err: BridgeError) -> PyErr {
    host_error_to_py(HostError::from(err))
}

pub(crate) fn host_error_to_py(err: HostError) -> PyErr {
    if let Some(original) = err.source.as_ref().and_then(|s| s.downcast_ref::<PyErr>()) {
        return pyo3::Python::with_gil(|py| original.clone_ref(py));
    }
    let message = err.message;
    match err.kind {
        HostErrorKind::TypeError => PyTypeError::new_err(message),
        HostErrorKind::LookupError => PyLookupError::new_err(message),
        HostErrorKind::ValueError => PyValueError::new_err(message),
        HostErrorKind::OverflowError => PyOverflowError::new_err(message),
        HostErrorKind::MemoryError => PyMemoryError::new_err(message),
        HostErrorKind::AttributeError => PyAttributeError::new_err(message),
        HostErrorKind::RuntimeError => PyRuntimeError::new_err(message),
    }
}

/// Capture a Python exception, keeping the original for re-raising and
/// traceback printing
pub(crate) fn py_err_to_host(py: pyo3::Python<'_>, err: PyErr) -> HostError {
    let kind = if err.is_instance_of::<PyTypeError>(py) {
        HostErrorKind::TypeError
    } else if err.is_instance_of::<PyAttributeError>(py) {
        HostErrorKind::AttributeError
    } else if err.is_instance_of::<PyLookupError>(py) {
        HostErrorKind::LookupError
    } else if err.is_instance_of::<PyOverflowError>(py) {
        HostErrorKind::OverflowError
    } else if err.is_instance_of::<PyValueError>(py) {
        HostErrorKind::ValueError
    } else if err.is_instance_of::<PyMemoryError>(py) {
        HostErrorKind::MemoryError
    } else {
        HostErrorKind::RuntimeError
    };
    HostError::new(kind, err.to_string()).with_source(err)
}
