//! Typed-parameter codec exposed to Python

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::ffi::to_py_err;
use crate::ffi::types::{host_dict, to_py};
use crate::host::HostValue;
use crate::params::{decode, encode_inferred, encode_with_schema, SchemaHint, TypedParamKind, TypedParamSet};

/// An owned typed-parameter array
#[pyclass(name = "TypedParams", module = "virt_bridge_core_rs")]
pub struct PyTypedParams {
    params: TypedParamSet,
}

#[pymethods]
impl PyTypedParams {
    #[new]
    fn new() -> Self {
        PyTypedParams {
            params: TypedParamSet::new(),
        }
    }

    fn add_int(&mut self, name: &str, value: i32) -> PyResult<()> {
        self.params.add_int(name, value).map_err(to_py_err)
    }

    fn add_uint(&mut self, name: &str, value: u32) -> PyResult<()> {
        self.params.add_uint(name, value).map_err(to_py_err)
    }

    fn add_llong(&mut self, name: &str, value: i64) -> PyResult<()> {
        self.params.add_llong(name, value).map_err(to_py_err)
    }

    fn add_ullong(&mut self, name: &str, value: u64) -> PyResult<()> {
        self.params.add_ullong(name, value).map_err(to_py_err)
    }

    fn add_double(&mut self, name: &str, value: f64) -> PyResult<()> {
        self.params.add_double(name, value).map_err(to_py_err)
    }

    fn add_boolean(&mut self, name: &str, value: bool) -> PyResult<()> {
        self.params.add_boolean(name, value).map_err(to_py_err)
    }

    fn add_string(&mut self, name: &str, value: &str) -> PyResult<()> {
        self.params.add_string(name, value).map_err(to_py_err)
    }

    /// Kind names in array order
    fn kinds(&self) -> Vec<String> {
        self.params
            .iter()
            .map(|p| p.kind().map_or_else(|| format!("unknown({})", p.type_), |k| k.name().to_string()))
            .collect()
    }

    /// Release every payload; safe to call more than once
    fn free(&mut self) {
        self.params.free();
    }

    fn __len__(&self) -> usize {
        self.params.len()
    }

    fn __repr__(&self) -> String {
        format!("<TypedParams len={}>", self.params.len())
    }
}

/// Decode a typed-parameter array into a dict
#[pyfunction]
#[pyo3(name = "typed_params_decode")]
pub fn py_typed_params_decode(py: Python<'_>, params: PyRef<'_, PyTypedParams>) -> PyResult<PyObject> {
    let dict = decode(params.params.as_slice()).map_err(to_py_err)?;
    to_py(py, &HostValue::Dict(dict))
}

/// Encode `info` against the kinds `schema` declares for each field
#[pyfunction]
#[pyo3(name = "typed_params_encode")]
pub fn py_typed_params_encode(
    info: &Bound<'_, PyDict>,
    schema: PyRef<'_, PyTypedParams>,
) -> PyResult<PyTypedParams> {
    let info = host_dict(info)?;
    let params = encode_with_schema(&info, schema.params.as_slice()).map_err(to_py_err)?;
    Ok(PyTypedParams { params })
}

/// Encode `info` with kinds taken from `hints` (field -> kind name) or
/// inferred from the values
#[pyfunction]
#[pyo3(name = "typed_params_infer", signature = (info, hints = None))]
pub fn py_typed_params_infer(
    info: &Bound<'_, PyDict>,
    hints: Option<&Bound<'_, PyDict>>,
) -> PyResult<PyTypedParams> {
    let info = host_dict(info)?;
    let hints = hints.map(parse_hints).transpose()?;
    let params = encode_inferred(&info, hints.as_ref()).map_err(to_py_err)?;
    Ok(PyTypedParams { params })
}

fn parse_hints(hints: &Bound<'_, PyDict>) -> PyResult<SchemaHint> {
    let mut out = SchemaHint::new();
    for (field, kind) in hints.iter() {
        let field: String = field.extract()?;
        let kind: String = kind.extract()?;
        let kind = TypedParamKind::ALL
            .into_iter()
            .find(|k| k.name() == kind)
            .ok_or_else(|| PyValueError::new_err(format!("unknown parameter kind '{kind}'")))?;
        out.insert(field, kind);
    }
    Ok(out)
}
