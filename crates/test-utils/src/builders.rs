#![allow(dead_code)]

use serde_json::{json, Value};

use convergent::template::{ParameterDefinition, ResourceDefinition, Template};
use convergent::types::ReplacementPolicy;

/// Builder for `Template` to simplify test setup.
#[derive(Debug, Clone, Default)]
pub struct TemplateBuilder {
    template: Template,
}

impl TemplateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn description(mut self, text: &str) -> Self {
        self.template.description = Some(text.to_string());
        self
    }

    pub fn parameter(mut self, name: &str, default: Option<Value>) -> Self {
        self.template.parameters.insert(
            name.to_string(),
            ParameterDefinition {
                default,
                description: None,
            },
        );
        self
    }

    pub fn resource(mut self, name: &str, resource: ResourceBuilder) -> Self {
        self.template
            .resources
            .insert(name.to_string(), resource.build());
        self
    }

    pub fn build(self) -> Template {
        self.template
    }
}

/// Builder for `ResourceDefinition`.
#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    resource: ResourceDefinition,
}

impl ResourceBuilder {
    pub fn new(resource_type: &str) -> Self {
        Self {
            resource: ResourceDefinition::new(resource_type),
        }
    }

    pub fn property(mut self, key: &str, value: Value) -> Self {
        self.resource.properties.insert(key.to_string(), value);
        self
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.resource.depends_on.push(name.to_string());
        self
    }

    pub fn replacement_policy(mut self, policy: ReplacementPolicy) -> Self {
        self.resource.replacement_policy = Some(policy);
        self
    }

    pub fn build(self) -> ResourceDefinition {
        self.resource
    }
}

/// `{ "get_resource": name }`
pub fn get_resource(name: &str) -> Value {
    json!({ "get_resource": name })
}

/// `{ "get_attr": [name, attr] }`
pub fn get_attr(name: &str, attr: &str) -> Value {
    json!({ "get_attr": [name, attr] })
}

/// `{ "get_param": name }`
pub fn get_param(name: &str) -> Value {
    json!({ "get_param": name })
}
