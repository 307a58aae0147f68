//! The Python interpreter as the bridge's [`Interpreter`]
//!
//! Native callbacks arrive on arbitrary threads, so acquisition goes
//! through the GIL state API rather than pyo3's scoped tokens.

use std::sync::Arc;

use pyo3::ffi;
use pyo3::prelude::*;

use crate::error::HostError;
use crate::ffi::host_error_to_py;
use crate::ffi::types::PyCallable;
use crate::host::{HostFunction, HostNamespace, Interpreter, SavedThreadState, ThreadStateToken};

#[derive(Debug, Default, Clone, Copy)]
pub struct GilInterpreter;

impl Interpreter for GilInterpreter {
    fn ensure(&self) -> ThreadStateToken {
        // SAFETY: callable from any thread once the interpreter is running
        let state = unsafe { ffi::PyGILState_Ensure() };
        ThreadStateToken::new(match state {
            ffi::PyGILState_STATE::PyGILState_LOCKED => 0,
            ffi::PyGILState_STATE::PyGILState_UNLOCKED => 1,
        })
    }

    fn release(&self, token: ThreadStateToken) {
        let state = match token.raw() {
            0 => ffi::PyGILState_STATE::PyGILState_LOCKED,
            _ => ffi::PyGILState_STATE::PyGILState_UNLOCKED,
        };
        // SAFETY: `token` came from the matching `ensure` on this thread
        unsafe { ffi::PyGILState_Release(state) }
    }

    fn save(&self) -> SavedThreadState {
        // SAFETY: the GIL state check has no preconditions
        if unsafe { ffi::PyGILState_Check() } == 0 {
            return SavedThreadState::new(None);
        }
        // SAFETY: this thread holds the GIL
        let tstate = unsafe { ffi::PyEval_SaveThread() };
        SavedThreadState::new(Some(tstate as usize))
    }

    fn restore(&self, saved: SavedThreadState) {
        if let Some(tstate) = saved.raw() {
            // SAFETY: `tstate` came from `PyEval_SaveThread` on this thread
            unsafe { ffi::PyEval_RestoreThread(tstate as *mut ffi::PyThreadState) }
        }
    }

    fn report(&self, error: &HostError) {
        log::debug!("Callback raised {error}");
        Python::with_gil(|py| {
            let err = host_error_to_py(HostError {
                kind: error.kind,
                message: error.message.clone(),
                source: None,
            });
            match error.source.as_ref().and_then(|s| s.downcast_ref::<PyErr>()) {
                Some(original) => original.clone_ref(py).print(py),
                None => err.print(py),
            }
        });
    }
}

/// Attribute lookup on an importable Python module
#[derive(Debug, Clone)]
pub struct ModuleNamespace {
    module: String,
}

impl ModuleNamespace {
    pub fn new(module: impl Into<String>) -> Self {
        ModuleNamespace {
            module: module.into(),
        }
    }
}

impl HostNamespace for ModuleNamespace {
    fn lookup(&self, name: &str) -> Option<HostFunction> {
        Python::with_gil(|py| {
            let module = match py.import_bound(self.module.as_str()) {
                Ok(module) => module,
                Err(err) => {
                    log::warn!("Cannot import {}: {err}", self.module);
                    return None;
                }
            };
            let attr = module.getattr(name).ok()?;
            attr.is_callable()
                .then(|| HostFunction::from_callable(Arc::new(PyCallable::new(name, attr.unbind()))))
        })
    }
}
