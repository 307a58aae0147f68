//! Value conversion at the Python boundary
//!
//! Python objects become [`HostValue`]s on the way in and are rebuilt on
//! the way out. Objects with no plain-data form (proxies, callables) are
//! held by reference, so they come back out as the very same object.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use pyo3::prelude::*;
use pyo3::types::{PyBool, PyBytes, PyDict, PyFloat, PyList, PyLong, PyString, PyTuple};

use crate::config::BridgeConfig;
use crate::error::HostError;
use crate::events::Capsule;
use crate::ffi::py_err_to_host;
use crate::host::{HostCallable, HostDict, HostFunction, HostObject, HostValue};
use crate::objects::OwnedObject;

// ========================================================================
// Python classes
// ========================================================================

/// Opaque native pointer handed to the Python event loop
#[pyclass(name = "NativeCapsule", module = "virt_bridge_core_rs", frozen)]
pub struct PyNativeCapsule {
    pub(crate) capsule: Capsule,
}

#[pymethods]
impl PyNativeCapsule {
    #[getter]
    fn kind(&self) -> String {
        format!("{:?}", self.capsule.kind())
    }

    fn __eq__(&self, other: &Bound<'_, PyAny>) -> bool {
        other
            .downcast::<PyNativeCapsule>()
            .map(|other| other.get().capsule == self.capsule)
            .unwrap_or(false)
    }

    fn __repr__(&self) -> String {
        format!("<NativeCapsule {:?}>", self.capsule.kind())
    }
}

/// Native object lent to a Python callback, holding a reference of its own
#[pyclass(name = "NativeHandle", module = "virt_bridge_core_rs", frozen)]
pub struct PyNativeHandle {
    pub(crate) object: OwnedObject,
}

#[pymethods]
impl PyNativeHandle {
    #[getter]
    fn kind(&self) -> String {
        format!("{:?}", self.object.kind())
    }

    /// Address of the native object, for handing to other bindings
    fn address(&self) -> usize {
        self.object.as_ptr() as usize
    }

    fn __repr__(&self) -> String {
        format!("<NativeHandle {:?}>", self.object.kind())
    }
}

// ========================================================================
// Python -> host
// ========================================================================

/// Convert a Python object into a host value
pub fn host_value(obj: &Bound<'_, PyAny>) -> PyResult<HostValue> {
    if obj.is_none() {
        return Ok(HostValue::None);
    }
    if let Ok(b) = obj.downcast::<PyBool>() {
        return Ok(HostValue::Bool(b.is_true()));
    }
    if obj.is_instance_of::<PyLong>() {
        return Ok(HostValue::Int(obj.extract::<i128>()?));
    }
    if let Ok(f) = obj.downcast::<PyFloat>() {
        return Ok(HostValue::Float(f.value()));
    }
    if let Ok(s) = obj.downcast::<PyString>() {
        return Ok(HostValue::Str(s.to_str()?.to_owned()));
    }
    if let Ok(b) = obj.downcast::<PyBytes>() {
        return Ok(HostValue::Bytes(b.as_bytes().to_vec()));
    }
    if let Ok(t) = obj.downcast::<PyTuple>() {
        return Ok(HostValue::Tuple(
            t.iter().map(|item| host_value(&item)).collect::<PyResult<_>>()?,
        ));
    }
    if let Ok(l) = obj.downcast::<PyList>() {
        return Ok(HostValue::List(
            l.iter().map(|item| host_value(&item)).collect::<PyResult<_>>()?,
        ));
    }
    if let Ok(d) = obj.downcast::<PyDict>() {
        return Ok(HostValue::Dict(host_dict(d)?));
    }
    if let Ok(c) = obj.downcast::<PyNativeCapsule>() {
        return Ok(HostValue::Capsule(c.get().capsule));
    }
    if let Ok(h) = obj.downcast::<PyNativeHandle>() {
        return Ok(HostValue::Native(h.get().object.clone()));
    }
    if obj.is_callable() {
        return Ok(HostValue::Callable(PyCallable::function(obj)?));
    }
    Ok(HostValue::Object(Arc::new(PyProxy::new(obj))))
}

/// Convert a Python dict with string keys
pub fn host_dict(dict: &Bound<'_, PyDict>) -> PyResult<HostDict> {
    let mut out = HostDict::with_capacity(dict.len());
    for (key, value) in dict.iter() {
        let key: String = key.extract().map_err(|_| {
            pyo3::exceptions::PyTypeError::new_err(format!(
                "dictionary keys must be str, not {}",
                key.get_type()
            ))
        })?;
        out.insert(key, host_value(&value)?);
    }
    Ok(out)
}

// ========================================================================
// Host -> Python
// ========================================================================

/// Rebuild a Python object from a host value
pub fn to_py(py: Python<'_>, value: &HostValue) -> PyResult<PyObject> {
    Ok(match value {
        HostValue::None => py.None(),
        HostValue::Bool(b) => b.into_py(py),
        HostValue::Int(i) => i.into_py(py),
        HostValue::Float(f) => f.into_py(py),
        HostValue::Str(s) => s.into_py(py),
        HostValue::Bytes(b) => PyBytes::new_bound(py, b).into_any().unbind(),
        HostValue::List(items) => {
            let items = items.iter().map(|v| to_py(py, v)).collect::<PyResult<Vec<_>>>()?;
            PyList::new_bound(py, items).into_any().unbind()
        }
        HostValue::Tuple(items) => py_tuple(py, items)?.into_any().unbind(),
        HostValue::Dict(d) => {
            let dict = PyDict::new_bound(py);
            for (k, v) in d {
                dict.set_item(k, to_py(py, v)?)?;
            }
            dict.into_any().unbind()
        }
        HostValue::Capsule(capsule) => {
            Py::new(py, PyNativeCapsule { capsule: *capsule })?.into_any()
        }
        HostValue::Native(object) => Py::new(
            py,
            PyNativeHandle {
                object: object.clone(),
            },
        )?
        .into_any(),
        HostValue::Callable(func) => match func.downcast_ref::<PyCallable>() {
            Some(callable) => callable.func.clone_ref(py),
            None => {
                return Err(pyo3::exceptions::PyTypeError::new_err(format!(
                    "{} has no Python form",
                    func.describe()
                )))
            }
        },
        HostValue::Object(object) => match object.as_any().downcast_ref::<PyProxy>() {
            Some(proxy) => proxy.obj.clone_ref(py),
            None => {
                return Err(pyo3::exceptions::PyTypeError::new_err(
                    "host object has no Python form",
                ))
            }
        },
    })
}

pub(crate) fn py_tuple<'py>(py: Python<'py>, items: &[HostValue]) -> PyResult<Bound<'py, PyTuple>> {
    let items = items.iter().map(|v| to_py(py, v)).collect::<PyResult<Vec<_>>>()?;
    Ok(PyTuple::new_bound(py, items))
}

// ========================================================================
// Configuration parser
// ========================================================================

/// Extract an optional field from a Python dict, falling back to `default`
fn extract_with_default<T>(dict: &Bound<'_, PyDict>, key: &str, default: T) -> PyResult<T>
where
    T: for<'py> FromPyObject<'py>,
{
    match dict.get_item(key)? {
        Some(value) => value.extract(),
        None => Ok(default),
    }
}

/// Convert a Python dict to a [`BridgeConfig`]; missing keys keep their
/// defaults, unknown keys are rejected
pub fn config_from_py(dict: &Bound<'_, PyDict>) -> PyResult<BridgeConfig> {
    let defaults = BridgeConfig::default();
    for key in dict.keys() {
        let key: String = key.extract()?;
        if !BridgeConfig::FIELDS.contains(&key.as_str()) {
            return Err(pyo3::exceptions::PyValueError::new_err(format!(
                "Unknown configuration field '{key}'"
            )));
        }
    }

    Ok(BridgeConfig {
        host_module: extract_with_default(dict, "host_module", defaults.host_module)?,
        invoke_handle_name: extract_with_default(dict, "invoke_handle_name", defaults.invoke_handle_name)?,
        invoke_timeout_name: extract_with_default(dict, "invoke_timeout_name", defaults.invoke_timeout_name)?,
        dispatch_handle_name: extract_with_default(dict, "dispatch_handle_name", defaults.dispatch_handle_name)?,
        dispatch_timeout_name: extract_with_default(dict, "dispatch_timeout_name", defaults.dispatch_timeout_name)?,
        connection_key: extract_with_default(dict, "connection_key", defaults.connection_key)?,
        stream_key: extract_with_default(dict, "stream_key", defaults.stream_key)?,
        verify_removed_capsules: extract_with_default(
            dict,
            "verify_removed_capsules",
            defaults.verify_removed_capsules,
        )?,
    })
}

// ========================================================================
// Python objects as host callables and proxies
// ========================================================================

/// A Python callable
pub struct PyCallable {
    name: String,
    func: PyObject,
}

impl PyCallable {
    pub fn new(name: impl Into<String>, func: PyObject) -> Self {
        PyCallable {
            name: name.into(),
            func,
        }
    }

    pub fn function(obj: &Bound<'_, PyAny>) -> PyResult<HostFunction> {
        let name = obj
            .getattr("__qualname__")
            .and_then(|n| n.extract::<String>())
            .unwrap_or_else(|_| "<callable>".to_string());
        Ok(HostFunction::from_callable(Arc::new(PyCallable::new(
            name,
            obj.clone().unbind(),
        ))))
    }
}

impl HostCallable for PyCallable {
    fn call(&self, args: Vec<HostValue>) -> Result<HostValue, HostError> {
        Python::with_gil(|py| {
            let args = py_tuple(py, &args).map_err(|e| py_err_to_host(py, e))?;
            let result = self
                .func
                .call1(py, args)
                .map_err(|e| py_err_to_host(py, e))?;
            host_value(result.bind(py)).map_err(|e| py_err_to_host(py, e))
        })
    }

    fn describe(&self) -> String {
        self.name.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A Python object reached through attribute and item lookup
pub struct PyProxy {
    obj: PyObject,
}

impl PyProxy {
    pub fn new(obj: &Bound<'_, PyAny>) -> Self {
        PyProxy {
            obj: obj.clone().unbind(),
        }
    }
}

impl fmt::Debug for PyProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Python::with_gil(|py| write!(f, "PyProxy({})", self.obj.bind(py).get_type()))
    }
}

impl HostObject for PyProxy {
    fn method(&self, name: &str) -> Option<HostFunction> {
        Python::with_gil(|py| {
            let method = self.obj.bind(py).getattr(name).ok()?;
            method
                .is_callable()
                .then(|| HostFunction::from_callable(Arc::new(PyCallable::new(name, method.unbind()))))
        })
    }

    fn get_item(&self, key: &str) -> Option<HostValue> {
        Python::with_gil(|py| {
            let item = self.obj.bind(py).get_item(key).ok()?;
            host_value(&item).ok()
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Wrap registration data so the dispatch methods receive the caller's
/// object itself rather than a copy
pub fn opaque_data(obj: &Bound<'_, PyAny>) -> HostValue {
    HostValue::Object(Arc::new(PyProxy::new(obj)))
}
