// src/template/model.rs

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::ReplacementPolicy;

/// Declarative stack template as read from TOML.
///
/// ```toml
/// [parameters.size]
/// default = "small"
///
/// [resources.net]
/// type = "Convergent::None"
///
/// [resources.server]
/// type = "Convergent::Test"
/// depends_on = ["net"]
/// properties = { value = { get_param = "size" }, net = { get_resource = "net" } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterDefinition>,

    /// Keys are the logical resource names.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceDefinition>,
}

impl Template {
    /// Template with no resources; converging to it deletes everything.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// `[parameters.<name>]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// `[resources.<name>]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default)]
    pub properties: Map<String, Value>,

    /// Explicit ordering on top of the references found in `properties`.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Overrides the type's replacement policy for this resource only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_policy: Option<ReplacementPolicy>,
}

impl ResourceDefinition {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties: Map::new(),
            depends_on: Vec::new(),
            replacement_policy: None,
        }
    }
}

/// Environment applied on top of a template: parameter values and type
/// aliases (`resource_registry`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,

    /// Alias type name -> registered type name (or another alias).
    #[serde(default)]
    pub resource_registry: BTreeMap<String, String>,
}

/// Template plus environment, as stored for the last known-good state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateSnapshot {
    pub template: Template,
    pub environment: Environment,
}

/// One resource after parameter substitution and alias resolution.
///
/// `properties` may still contain `get_resource` / `get_attr` references;
/// those are resolved when the node runs, from its predecessors' data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResource {
    pub name: String,
    pub resource_type: String,
    pub properties: Value,
    /// Logical names this resource must wait for.
    pub requires: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_policy: Option<ReplacementPolicy>,
}

/// Output of the template resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTemplate {
    pub resources: BTreeMap<String, ResolvedResource>,
}
