// src/plugin/builtin.rs

//! Built-in resource types that need no external system.
//!
//! `Convergent::None` accepts anything and does nothing. `Convergent::Test`
//! is driven by its own properties, which makes it useful for exercising the
//! engine from a template:
//!
//! | property             | effect                                                  |
//! |----------------------|---------------------------------------------------------|
//! | `value`              | exposed as the `output` attribute                       |
//! | `fail`               | create/update fail permanently                          |
//! | `fail_delete`        | delete fails permanently                                |
//! | `transient_failures` | the first N attempts fail with a transient error        |
//! | `wait_polls`         | create/update/delete report in-progress N times         |
//! | `replace_on`         | property names whose change forces a replacement        |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::dag::ResourceData;
use crate::plugin::base::{decode_token, encode_token};
use crate::plugin::{OpOutcome, OpResult, OperationContext, PluginError, ResourcePlugin};
use crate::types::ReplacementPolicy;

pub const NONE_TYPE: &str = "Convergent::None";
pub const TEST_TYPE: &str = "Convergent::Test";

/// Property names that force replacement when `replace_on` is not given.
const DEFAULT_REPLACE_ON: &[&str] = &["replace_key"];

fn new_physical_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

/// Placeholder resource: physical id only, properties echoed back.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneResource;

#[async_trait]
impl ResourcePlugin for NoneResource {
    fn type_name(&self) -> &str {
        NONE_TYPE
    }

    async fn create(&self, _ctx: &OperationContext, properties: &Value) -> OpResult {
        Ok(OpOutcome::done(new_physical_id("none"), properties.clone()))
    }

    async fn update(
        &self,
        _ctx: &OperationContext,
        physical_id: &str,
        _old: &Value,
        new: &Value,
    ) -> OpResult {
        Ok(OpOutcome::done(physical_id, new.clone()))
    }

    async fn delete(
        &self,
        _ctx: &OperationContext,
        _physical_id: &str,
        _properties: &Value,
    ) -> OpResult {
        Ok(OpOutcome::Done(ResourceData::default()))
    }
}

/// Property-driven test resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestResource {
    policy: ReplacementPolicy,
}

/// Continuation state of a `Convergent::Test` operation.
#[derive(Debug, Serialize, Deserialize)]
struct TestToken {
    physical_id: Option<String>,
    remaining: u64,
    attributes: Value,
}

impl TestResource {
    pub fn new(policy: ReplacementPolicy) -> Self {
        Self { policy }
    }

    fn check_failures(
        ctx: &OperationContext,
        properties: &Value,
        fail_key: &str,
    ) -> Result<(), PluginError> {
        let transient = properties
            .get("transient_failures")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if u64::from(ctx.attempt) <= transient {
            return Err(PluginError::Transient(format!(
                "simulated transient failure {} of {transient}",
                ctx.attempt
            )));
        }
        if properties.get(fail_key).and_then(Value::as_bool).unwrap_or(false) {
            return Err(PluginError::Permanent(format!(
                "test resource '{}' failing as requested",
                ctx.resource_name
            )));
        }
        Ok(())
    }

    fn attributes(ctx: &OperationContext, properties: &Value) -> Value {
        json!({
            "name": ctx.resource_name,
            "output": properties.get("value").cloned().unwrap_or(Value::Null),
        })
    }

    /// Finish now, or hand out a token when `wait_polls` asks for polling.
    fn finish(physical_id: Option<String>, properties: &Value, attributes: Value) -> OpResult {
        let wait = properties
            .get("wait_polls")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if wait == 0 {
            return Ok(OpOutcome::Done(ResourceData {
                physical_id,
                attributes,
            }));
        }
        let token = encode_token(&TestToken {
            physical_id: physical_id.clone(),
            remaining: wait,
            attributes,
        })?;
        Ok(OpOutcome::InProgress { physical_id, token })
    }

    fn poll(token: &str) -> OpResult {
        let mut state: TestToken = decode_token(token)?;
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            return Ok(OpOutcome::Done(ResourceData {
                physical_id: state.physical_id,
                attributes: state.attributes,
            }));
        }
        Ok(OpOutcome::InProgress {
            physical_id: state.physical_id.clone(),
            token: encode_token(&state)?,
        })
    }
}

#[async_trait]
impl ResourcePlugin for TestResource {
    fn type_name(&self) -> &str {
        TEST_TYPE
    }

    fn replacement_policy(&self) -> ReplacementPolicy {
        self.policy
    }

    fn needs_replacement(&self, old: &Value, new: &Value) -> bool {
        let keys: Vec<String> = match new.get("replace_on").and_then(Value::as_array) {
            Some(list) => list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            None => DEFAULT_REPLACE_ON.iter().map(|s| s.to_string()).collect(),
        };
        keys.iter().any(|k| old.get(k) != new.get(k))
    }

    async fn create(&self, ctx: &OperationContext, properties: &Value) -> OpResult {
        Self::check_failures(ctx, properties, "fail")?;
        let physical_id = Some(new_physical_id("test"));
        Self::finish(physical_id, properties, Self::attributes(ctx, properties))
    }

    async fn check_create(&self, _ctx: &OperationContext, token: &str) -> OpResult {
        Self::poll(token)
    }

    async fn update(
        &self,
        ctx: &OperationContext,
        physical_id: &str,
        _old: &Value,
        new: &Value,
    ) -> OpResult {
        Self::check_failures(ctx, new, "fail")?;
        Self::finish(
            Some(physical_id.to_string()),
            new,
            Self::attributes(ctx, new),
        )
    }

    async fn check_update(
        &self,
        _ctx: &OperationContext,
        _physical_id: &str,
        token: &str,
    ) -> OpResult {
        Self::poll(token)
    }

    async fn delete(
        &self,
        ctx: &OperationContext,
        _physical_id: &str,
        properties: &Value,
    ) -> OpResult {
        if properties
            .get("fail_delete")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(PluginError::Permanent(format!(
                "test resource '{}' refusing deletion as requested",
                ctx.resource_name
            )));
        }
        Self::finish(None, properties, Value::Null)
    }

    async fn check_delete(
        &self,
        _ctx: &OperationContext,
        _physical_id: &str,
        token: &str,
    ) -> OpResult {
        Self::poll(token)
    }
}
