//! Two-phase get/set protocol over native parameter families
//!
//! A parameter family is a pair of native entry points (scheduler, blkio,
//! memory, NUMA, interface, block I/O tuning, node memory, ...) sharing
//! the same shape:
//!
//! 1. ask the native side how many parameters exist
//! 2. allocate that many slots and let the native side fill them
//! 3. decode (get) or encode the caller's overrides against them (set)
//!
//! Native calls run with the interpreter released. Every array allocated
//! here is released before returning, on success and on every error path.

use std::os::raw::{c_int, c_uint};

use crate::error::{BridgeError, EmptyInput, Result};
use crate::host::{allow_threads, HostDict, Interpreter};
use crate::params::decode::decode;
use crate::params::encode::encode_with_schema;
use crate::params::set::TypedParamSet;
use crate::params::typed::TypedParameter;

/// One native getter/setter pair
pub trait ParameterFamily {
    /// Name of the native getter, for error reporting
    fn get_operation(&self) -> &'static str;

    /// Name of the native setter, for error reporting
    fn set_operation(&self) -> &'static str;

    /// Native getter. With `params == None` it reports the number of
    /// parameters in `nparams`; otherwise it fills up to `*nparams` slots
    /// and stores the number filled.
    fn get(&self, params: Option<&mut [TypedParameter]>, nparams: &mut c_int, flags: c_uint)
        -> c_int;

    /// Native setter
    fn set(&self, params: &[TypedParameter], flags: c_uint) -> c_int;

    /// Number of parameters the getter will report
    fn count(&self, flags: c_uint) -> Result<usize> {
        let mut nparams: c_int = 0;
        let rc = self.get(None, &mut nparams, flags);
        if rc < 0 {
            return Err(BridgeError::native(self.get_operation(), rc));
        }
        Ok(usize::try_from(nparams).unwrap_or(0))
    }
}

/// Fetch all parameters of a family as a host dict
///
/// A family reporting zero parameters yields an empty dict.
pub fn get_parameters(
    family: &dyn ParameterFamily,
    flags: c_uint,
    interpreter: &dyn Interpreter,
) -> Result<HostDict> {
    let count = allow_threads(interpreter, || family.count(flags))?;
    if count == 0 {
        return Ok(HostDict::new());
    }
    let params = fetch(family, count, flags, interpreter)?;
    decode(params.as_slice())
}

/// Apply `overrides` to a family
///
/// Only the overridden entries are passed to the native setter, each with
/// the kind the native getter reports for it.
pub fn set_parameters(
    family: &dyn ParameterFamily,
    overrides: &HostDict,
    flags: c_uint,
    interpreter: &dyn Interpreter,
) -> Result<()> {
    if overrides.is_empty() {
        return Err(EmptyInput::MappingRequired.into());
    }
    let count = allow_threads(interpreter, || family.count(flags))?;
    if count == 0 {
        return Err(EmptyInput::NothingSettable.into());
    }

    let current = fetch(family, count, flags, interpreter)?;
    let changes = encode_with_schema(overrides, current.as_slice())?;

    let rc = allow_threads(interpreter, || family.set(changes.as_slice(), flags));
    if rc < 0 {
        return Err(BridgeError::native(family.set_operation(), rc));
    }
    Ok(())
}

fn fetch(
    family: &dyn ParameterFamily,
    count: usize,
    flags: c_uint,
    interpreter: &dyn Interpreter,
) -> Result<TypedParamSet> {
    let mut params = TypedParamSet::zeroed(count)?;
    let mut nparams = params.native_len()?;

    let rc = allow_threads(interpreter, || {
        family.get(Some(params.as_mut_slice()), &mut nparams, flags)
    });
    if rc < 0 {
        return Err(BridgeError::native(family.get_operation(), rc));
    }
    params.truncate(usize::try_from(nparams).unwrap_or(0));
    Ok(params)
}
