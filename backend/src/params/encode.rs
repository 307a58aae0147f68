//! Host dictionary -> typed-parameter array
//!
//! Two entry points:
//! - [`encode_with_schema`]: each key must exist in a reference array the
//!   native side produced, and takes that entry's kind
//! - [`encode_inferred`]: kinds come from optional hints, otherwise from the
//!   host value's own type; list values expand into repeated entries

use std::collections::HashMap;

use crate::error::{BridgeError, EmptyInput, Result, SchemaViolation};
use crate::host::{HostDict, HostValue};
use crate::params::set::TypedParamSet;
use crate::params::typed::{TypedParamKind, TypedParameter};

/// Per-name kind overrides for [`encode_inferred`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaHint {
    kinds: HashMap<String, TypedParamKind>,
}

impl SchemaHint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, kind: TypedParamKind) -> Self {
        self.kinds.insert(name.into(), kind);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, kind: TypedParamKind) {
        self.kinds.insert(name.into(), kind);
    }

    pub fn get(&self, name: &str) -> Option<TypedParamKind> {
        self.kinds.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl FromIterator<(String, TypedParamKind)> for SchemaHint {
    fn from_iter<I: IntoIterator<Item = (String, TypedParamKind)>>(iter: I) -> Self {
        SchemaHint {
            kinds: iter.into_iter().collect(),
        }
    }
}

/// Encode `info` against the entries of a native reference array
///
/// An empty `schema` fails with [`EmptyInput::NothingSettable`], an empty
/// `info` with [`EmptyInput::MappingRequired`]. Keys missing from the
/// schema fail with [`SchemaViolation::UnknownField`]. On any error every
/// payload built so far is released.
pub fn encode_with_schema(info: &HostDict, schema: &[TypedParameter]) -> Result<TypedParamSet> {
    if schema.is_empty() {
        return Err(EmptyInput::NothingSettable.into());
    }
    if info.is_empty() {
        return Err(EmptyInput::MappingRequired.into());
    }

    let mut out = TypedParamSet::with_capacity(info.len())?;
    for (key, value) in info {
        let entry = schema
            .iter()
            .find(|p| p.field_bytes() == key.as_bytes())
            .ok_or_else(|| SchemaViolation::UnknownField { field: key.clone() })?;
        let kind = entry.kind().ok_or_else(|| SchemaViolation::UnrecognizedKind {
            field: key.clone(),
            code: entry.type_,
        })?;
        push_value(&mut out, key, kind, value)?;
    }
    Ok(out)
}

/// Encode `info` without a native reference array
///
/// Kind precedence: hint for the name, then string, boolean, integer
/// (`LLong` when negative, `ULLong` otherwise), float. Any other value
/// fails with [`SchemaViolation::UnsupportedValue`]. An empty dict encodes
/// to an empty set.
pub fn encode_inferred(info: &HostDict, hints: Option<&SchemaHint>) -> Result<TypedParamSet> {
    let mut out = TypedParamSet::new();
    for (key, value) in info {
        match value {
            HostValue::List(items) | HostValue::Tuple(items) => {
                for item in items {
                    push_inferred(&mut out, key, item, hints)?;
                }
            }
            other => push_inferred(&mut out, key, other, hints)?,
        }
    }
    Ok(out)
}

/// Kind a value encodes as when no hint applies
pub fn infer_kind(value: &HostValue) -> Option<TypedParamKind> {
    match value {
        HostValue::Str(_) => Some(TypedParamKind::String),
        HostValue::Bool(_) => Some(TypedParamKind::Boolean),
        HostValue::Int(i) if *i < 0 => Some(TypedParamKind::LLong),
        HostValue::Int(_) => Some(TypedParamKind::ULLong),
        HostValue::Float(_) => Some(TypedParamKind::Double),
        _ => None,
    }
}

fn push_inferred(
    out: &mut TypedParamSet,
    key: &str,
    value: &HostValue,
    hints: Option<&SchemaHint>,
) -> Result<()> {
    let kind = hints
        .and_then(|h| h.get(key))
        .or_else(|| infer_kind(value))
        .ok_or_else(|| SchemaViolation::UnsupportedValue {
            field: key.to_string(),
            found: value.type_name(),
        })?;
    push_value(out, key, kind, value)
}

fn push_value(
    out: &mut TypedParamSet,
    key: &str,
    kind: TypedParamKind,
    value: &HostValue,
) -> Result<()> {
    match kind {
        TypedParamKind::Int => out.add_int(key, unwrap_int(key, kind, value)?),
        TypedParamKind::UInt => out.add_uint(key, unwrap_int(key, kind, value)?),
        TypedParamKind::LLong => out.add_llong(key, unwrap_int(key, kind, value)?),
        TypedParamKind::ULLong => out.add_ullong(key, unwrap_int(key, kind, value)?),
        TypedParamKind::Double => out.add_double(key, unwrap_double(key, value)?),
        TypedParamKind::Boolean => out.add_boolean(key, value.is_truthy()),
        TypedParamKind::String => match value {
            HostValue::Str(s) => out.add_string(key, s),
            other => Err(mismatch(key, kind, other)),
        },
    }
}

fn unwrap_int<T: TryFrom<i128>>(key: &str, kind: TypedParamKind, value: &HostValue) -> Result<T> {
    let wide = value.as_int().ok_or_else(|| mismatch(key, kind, value))?;
    T::try_from(wide).map_err(|_| {
        SchemaViolation::Overflow {
            field: key.to_string(),
            kind,
        }
        .into()
    })
}

fn unwrap_double(key: &str, value: &HostValue) -> Result<f64> {
    match value {
        HostValue::Float(f) => Ok(*f),
        HostValue::Int(i) => Ok(*i as f64),
        other => Err(mismatch(key, TypedParamKind::Double, other)),
    }
}

fn mismatch(key: &str, expected: TypedParamKind, found: &HostValue) -> BridgeError {
    SchemaViolation::TypeMismatch {
        field: key.to_string(),
        expected,
        found: found.type_name(),
    }
    .into()
}
