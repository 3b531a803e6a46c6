// src/plugin/registry.rs

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{EngineConfig, RetryPolicy, TypeOverride};
use crate::errors::{ConvergeError, Result};
use crate::plugin::builtin::{NoneResource, TestResource};
use crate::plugin::ResourcePlugin;
use crate::types::ReplacementPolicy;

/// Effective per-type policy after config overrides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TypePolicy {
    pub replacement: ReplacementPolicy,
    pub retry: RetryPolicy,
    pub node_timeout: Duration,
}

/// Resource type name -> implementation.
///
/// New types register here; nothing else in the engine needs to change.
#[derive(Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn ResourcePlugin>>,
    overrides: BTreeMap<String, TypeOverride>,
    default_retry: RetryPolicy,
    default_node_timeout: Duration,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("types", &self.plugins.keys().collect::<Vec<_>>())
            .field("overrides", &self.overrides)
            .finish()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            plugins: BTreeMap::new(),
            overrides: BTreeMap::new(),
            default_retry: defaults.retry,
            default_node_timeout: defaults.node_timeout,
        }
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `Convergent::None` and `Convergent::Test`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NoneResource));
        registry.register(Arc::new(TestResource::default()));
        registry
    }

    /// Register (or replace) the implementation of a type.
    pub fn register(&mut self, plugin: Arc<dyn ResourcePlugin>) -> &mut Self {
        let name = plugin.type_name().to_string();
        debug!(resource_type = %name, "registered resource type");
        self.plugins.insert(name, plugin);
        self
    }

    /// Apply engine-wide defaults and `[resource_type."..."]` overrides.
    pub fn configure(&mut self, config: &EngineConfig) -> &mut Self {
        self.default_retry = config.retry;
        self.default_node_timeout = config.node_timeout;
        self.overrides = config.type_overrides.clone();
        self
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.plugins.contains_key(resource_type)
    }

    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn ResourcePlugin>> {
        self.plugins.get(resource_type).cloned()
    }

    pub fn require(&self, resource_type: &str) -> Result<Arc<dyn ResourcePlugin>> {
        self.get(resource_type).ok_or_else(|| {
            ConvergeError::PermanentResource(format!(
                "no plugin registered for resource type '{resource_type}'"
            ))
        })
    }

    /// Effective policy for a type.
    ///
    /// Replacement ordering: per-resource template override, then config
    /// override, then the plugin's own choice.
    pub fn policy(
        &self,
        resource_type: &str,
        resource_override: Option<ReplacementPolicy>,
    ) -> TypePolicy {
        let plugin = self.plugins.get(resource_type);
        let type_override = self.overrides.get(resource_type);

        let replacement = resource_override
            .or_else(|| type_override.and_then(|o| o.replacement_policy))
            .or_else(|| plugin.map(|p| p.replacement_policy()))
            .unwrap_or_default();

        let mut retry = plugin
            .and_then(|p| p.retry_policy())
            .unwrap_or(self.default_retry);
        if let Some(max_attempts) = type_override.and_then(|o| o.max_attempts) {
            retry.max_attempts = max_attempts;
        }

        let node_timeout = type_override
            .and_then(|o| o.node_timeout)
            .unwrap_or(self.default_node_timeout);

        TypePolicy {
            replacement,
            retry,
            node_timeout,
        }
    }
}
