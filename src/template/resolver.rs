// src/template/resolver.rs

//! The template resolver collaborator.
//!
//! Template syntax is owned by whoever produces a [`Template`]; the engine only
//! needs resolved resource specs plus dependency hints, which is what a
//! [`TemplateResolver`] returns.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, ValidationError};
use crate::template::model::{
    Environment, ResolvedResource, ResolvedTemplate, ResourceDefinition, Template,
};
use crate::template::refs::{collect_references, substitute_params, RefError};

pub trait TemplateResolver: Send + Sync {
    /// Produce resolved resource specs for `template` under `environment`,
    /// with `parameters` taking precedence over environment parameters.
    fn resolve(
        &self,
        template: &Template,
        environment: &Environment,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<ResolvedTemplate>;
}

/// Default resolver: parameter substitution, `resource_registry` aliases,
/// and dependency discovery through `depends_on` and property references.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardResolver;

impl TemplateResolver for StandardResolver {
    fn resolve(
        &self,
        template: &Template,
        environment: &Environment,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<ResolvedTemplate> {
        let params = effective_parameters(template, environment, parameters)?;

        let mut resources = BTreeMap::new();
        for (name, def) in template.resources.iter() {
            let resolved = resolve_resource(name, def, template, environment, &params)?;
            resources.insert(name.clone(), resolved);
        }

        debug!(resources = resources.len(), "template resolved");
        Ok(ResolvedTemplate { resources })
    }
}

fn effective_parameters(
    template: &Template,
    environment: &Environment,
    overrides: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>> {
    let mut params = BTreeMap::new();
    for (name, def) in template.parameters.iter() {
        let value = overrides
            .get(name)
            .or_else(|| environment.parameters.get(name))
            .or(def.default.as_ref())
            .cloned()
            .ok_or_else(|| ValidationError::MissingParameter {
                parameter: name.clone(),
            })?;
        params.insert(name.clone(), value);
    }
    Ok(params)
}

fn resolve_resource(
    name: &str,
    def: &ResourceDefinition,
    template: &Template,
    environment: &Environment,
    params: &BTreeMap<String, Value>,
) -> Result<ResolvedResource> {
    if name.trim().is_empty() {
        return Err(ValidationError::Invalid("resource names must be non-empty".into()).into());
    }

    let resource_type = resolve_type_alias(&def.resource_type, environment)?;

    let properties = substitute_params(&Value::Object(def.properties.clone()), params)
        .map_err(|e| match e {
            RefError::UnknownParameter(parameter) => ValidationError::UnknownParameter {
                resource: name.to_string(),
                parameter,
            },
            other => ValidationError::Invalid(format!("resource '{name}': {other}")),
        })?;

    let mut requires: BTreeSet<String> = def.depends_on.iter().cloned().collect();
    collect_references(&properties, &mut requires);

    for target in requires.iter() {
        if target == name {
            return Err(ValidationError::SelfReference {
                resource: name.to_string(),
            }
            .into());
        }
        if !template.resources.contains_key(target) {
            return Err(ValidationError::UnknownReference {
                resource: name.to_string(),
                target: target.clone(),
            }
            .into());
        }
    }

    Ok(ResolvedResource {
        name: name.to_string(),
        resource_type,
        properties,
        requires,
        replacement_policy: def.replacement_policy,
    })
}

/// Follow `resource_registry` aliases until a name with no alias is reached.
fn resolve_type_alias(type_name: &str, environment: &Environment) -> Result<String> {
    let mut current = type_name.to_string();
    let mut seen = HashSet::new();
    while let Some(target) = environment.resource_registry.get(&current) {
        if !seen.insert(current.clone()) {
            return Err(ValidationError::AliasLoop {
                alias: type_name.to_string(),
            }
            .into());
        }
        current = target.clone();
    }
    Ok(current)
}
