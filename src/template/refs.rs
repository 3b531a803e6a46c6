// src/template/refs.rs

//! Intrinsic references inside property values.
//!
//! A reference is a single-key object:
//! - `{ "get_param": "name" }` is substituted at resolve time.
//! - `{ "get_resource": "R" }` becomes R's physical id when the node runs.
//! - `{ "get_attr": ["R", "attr", ...] }` becomes an attribute of R.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::dag::node::InputData;

pub const GET_PARAM: &str = "get_param";
pub const GET_RESOURCE: &str = "get_resource";
pub const GET_ATTR: &str = "get_attr";

/// Failure while evaluating a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefError {
    UnknownParameter(String),
    /// Referenced resource data is not available in the node's inputs.
    MissingInput(String),
    /// Referenced resource has no physical id yet.
    NoPhysicalId(String),
    MissingAttribute { resource: String, path: String },
    Malformed(String),
}

impl std::fmt::Display for RefError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefError::UnknownParameter(p) => write!(f, "unknown parameter '{p}'"),
            RefError::MissingInput(r) => write!(f, "no input data for resource '{r}'"),
            RefError::NoPhysicalId(r) => write!(f, "resource '{r}' has no physical id"),
            RefError::MissingAttribute { resource, path } => {
                write!(f, "resource '{resource}' has no attribute '{path}'")
            }
            RefError::Malformed(msg) => write!(f, "malformed reference: {msg}"),
        }
    }
}

fn single_key(map: &serde_json::Map<String, Value>) -> Option<(&str, &Value)> {
    if map.len() != 1 {
        return None;
    }
    map.iter().next().map(|(k, v)| (k.as_str(), v))
}

/// Collect every logical resource name referenced by `get_resource` or
/// `get_attr` anywhere inside `value`.
pub fn collect_references(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            match single_key(map) {
                Some((GET_RESOURCE, Value::String(target))) => {
                    out.insert(target.clone());
                    return;
                }
                Some((GET_ATTR, Value::Array(args))) => {
                    if let Some(Value::String(target)) = args.first() {
                        out.insert(target.clone());
                    }
                    return;
                }
                _ => {}
            }
            for v in map.values() {
                collect_references(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_references(v, out);
            }
        }
        _ => {}
    }
}

/// Replace every `get_param` with its value.
pub fn substitute_params(
    value: &Value,
    params: &BTreeMap<String, Value>,
) -> Result<Value, RefError> {
    match value {
        Value::Object(map) => {
            if let Some((GET_PARAM, arg)) = single_key(map) {
                let name = arg
                    .as_str()
                    .ok_or_else(|| RefError::Malformed("get_param expects a string".into()))?;
                return params
                    .get(name)
                    .cloned()
                    .ok_or_else(|| RefError::UnknownParameter(name.to_string()));
            }
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute_params(v, params)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| substitute_params(v, params))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Replace every `get_resource` / `get_attr` with data from `inputs`.
pub fn resolve_references(value: &Value, inputs: &InputData) -> Result<Value, RefError> {
    match value {
        Value::Object(map) => {
            match single_key(map) {
                Some((GET_RESOURCE, Value::String(target))) => {
                    let data = inputs
                        .get(target)
                        .ok_or_else(|| RefError::MissingInput(target.clone()))?;
                    return data
                        .physical_id
                        .clone()
                        .map(Value::String)
                        .ok_or_else(|| RefError::NoPhysicalId(target.clone()));
                }
                Some((GET_ATTR, Value::Array(args))) => return resolve_attr(args, inputs),
                _ => {}
            }
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_references(v, inputs)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_references(v, inputs))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn resolve_attr(args: &[Value], inputs: &InputData) -> Result<Value, RefError> {
    let (target, path) = match args.split_first() {
        Some((Value::String(t), rest)) if !rest.is_empty() => (t, rest),
        _ => {
            return Err(RefError::Malformed(
                "get_attr expects [resource, attribute, ...]".into(),
            ));
        }
    };
    let data = inputs
        .get(target)
        .ok_or_else(|| RefError::MissingInput(target.clone()))?;

    let mut current = &data.attributes;
    let mut walked = Vec::new();
    for segment in path {
        let next = match segment {
            Value::String(key) => current.get(key.as_str()),
            Value::Number(n) => n.as_u64().and_then(|i| current.get(i as usize)),
            _ => None,
        };
        walked.push(segment.to_string().trim_matches('"').to_string());
        current = next.ok_or_else(|| RefError::MissingAttribute {
            resource: target.clone(),
            path: walked.join("."),
        })?;
    }
    Ok(current.clone())
}
