use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use convergent::dag::ResourceData;
use convergent::plugin::{
    decode_token, encode_token, OpOutcome, OpResult, OperationContext, PluginError,
    ResourcePlugin,
};
use convergent::types::ReplacementPolicy;

pub const SCRIPTED_TYPE: &str = "Test::Scripted";

/// One call made into the plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    pub resource: String,
    pub physical_id: Option<String>,
    pub attempt: u32,
    pub properties: Value,
}

/// Scripted behaviour of one logical resource.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub fail_create: bool,
    pub fail_update: bool,
    pub fail_delete: bool,
    /// Attempts `1..=transient` fail with a transient error.
    pub transient: u32,
    /// Number of in-progress checks before create/update/delete finish.
    pub polls: u32,
    /// When set, create/update block until [`ScriptedPlugin::release`].
    pub gated: bool,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Progress {
    physical_id: String,
    remaining: u32,
    attributes: Value,
}

/// A fake resource plugin that:
/// - records every call
/// - behaves per resource name as scripted
/// - tracks which physical resources currently exist.
pub struct ScriptedPlugin {
    type_name: String,
    policy: ReplacementPolicy,
    replace_on: BTreeSet<String>,
    scripts: Mutex<BTreeMap<String, Script>>,
    calls: Mutex<Vec<Call>>,
    live: Mutex<BTreeSet<String>>,
    gates: Mutex<BTreeMap<String, Arc<Semaphore>>>,
    next_id: AtomicU64,
}

impl ScriptedPlugin {
    pub fn new() -> Self {
        Self::named(SCRIPTED_TYPE)
    }

    pub fn named(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            policy: ReplacementPolicy::CreateBeforeDelete,
            replace_on: ["replace_key".to_string()].into_iter().collect(),
            scripts: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            live: Mutex::new(BTreeSet::new()),
            gates: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_policy(mut self, policy: ReplacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn script(&self, resource: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(resource.to_string(), script);
    }

    /// Let one gated create/update of `resource` proceed.
    pub fn release(&self, resource: &str) {
        self.gate(resource).add_permits(1);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// `"op:resource"` strings in call order.
    pub fn call_log(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| format!("{}:{}", c.op, c.resource))
            .collect()
    }

    pub fn count(&self, op: &str, resource: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.op == op && c.resource == resource)
            .count()
    }

    /// Position of the first `op` call on `resource`.
    pub fn position(&self, op: &str, resource: &str) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| c.op == op && c.resource == resource)
    }

    /// Physical ids created and not deleted.
    pub fn live(&self) -> BTreeSet<String> {
        self.live.lock().unwrap().clone()
    }

    /// Wait until `op` was called on `resource` at least `n` times.
    pub async fn wait_for(&self, op: &str, resource: &str, n: usize) {
        while self.count(op, resource) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn script_for(&self, resource: &str) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    fn gate(&self, resource: &str) -> Arc<Semaphore> {
        self.gates
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    fn record(&self, op: &'static str, ctx: &OperationContext, pid: Option<&str>, props: &Value) {
        self.calls.lock().unwrap().push(Call {
            op,
            resource: ctx.resource_name.clone(),
            physical_id: pid.map(str::to_string),
            attempt: ctx.attempt,
            properties: props.clone(),
        });
    }

    async fn before(&self, ctx: &OperationContext, script: &Script) -> Result<(), PluginError> {
        if script.gated {
            let gate = self.gate(&ctx.resource_name);
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if ctx.attempt <= script.transient {
            return Err(PluginError::Transient(format!(
                "{} throttled (attempt {})",
                ctx.resource_name, ctx.attempt
            )));
        }
        Ok(())
    }

    fn finish(&self, physical_id: String, attributes: Value, polls: u32) -> OpResult {
        if polls == 0 {
            return Ok(OpOutcome::done(physical_id, attributes));
        }
        let token = encode_token(&Progress {
            physical_id: physical_id.clone(),
            remaining: polls,
            attributes,
        })?;
        Ok(OpOutcome::InProgress {
            physical_id: Some(physical_id),
            token,
        })
    }

    fn check(&self, op: &'static str, ctx: &OperationContext, token: &str) -> OpResult {
        let mut progress: Progress = decode_token(token)?;
        self.record(op, ctx, Some(&progress.physical_id), &Value::Null);
        progress.remaining = progress.remaining.saturating_sub(1);
        if progress.remaining > 0 {
            return Ok(OpOutcome::InProgress {
                physical_id: Some(progress.physical_id.clone()),
                token: encode_token(&progress)?,
            });
        }
        if op == "check_delete" {
            self.live.lock().unwrap().remove(&progress.physical_id);
            return Ok(OpOutcome::Done(ResourceData::default()));
        }
        Ok(OpOutcome::done(progress.physical_id, progress.attributes))
    }
}

impl Default for ScriptedPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn attributes(resource: &str, physical_id: &str, properties: &Value) -> Value {
    json!({
        "name": resource,
        "id": physical_id,
        "properties": properties,
    })
}

#[async_trait]
impl ResourcePlugin for ScriptedPlugin {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn replacement_policy(&self) -> ReplacementPolicy {
        self.policy
    }

    fn needs_replacement(&self, old: &Value, new: &Value) -> bool {
        self.replace_on
            .iter()
            .any(|key| old.get(key) != new.get(key))
    }

    async fn create(&self, ctx: &OperationContext, properties: &Value) -> OpResult {
        self.record("create", ctx, None, properties);
        let script = self.script_for(&ctx.resource_name);
        self.before(ctx, &script).await?;
        if script.fail_create {
            return Err(PluginError::Permanent(format!(
                "{} create failed",
                ctx.resource_name
            )));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let physical_id = format!("{}-{n}", ctx.resource_name);
        self.live.lock().unwrap().insert(physical_id.clone());
        let attrs = attributes(&ctx.resource_name, &physical_id, properties);
        self.finish(physical_id, attrs, script.polls)
    }

    async fn check_create(&self, ctx: &OperationContext, token: &str) -> OpResult {
        self.check("check_create", ctx, token)
    }

    async fn update(
        &self,
        ctx: &OperationContext,
        physical_id: &str,
        _old: &Value,
        new: &Value,
    ) -> OpResult {
        self.record("update", ctx, Some(physical_id), new);
        let script = self.script_for(&ctx.resource_name);
        self.before(ctx, &script).await?;
        if script.fail_update {
            return Err(PluginError::Permanent(format!(
                "{} update failed",
                ctx.resource_name
            )));
        }
        let attrs = attributes(&ctx.resource_name, physical_id, new);
        self.finish(physical_id.to_string(), attrs, script.polls)
    }

    async fn check_update(
        &self,
        ctx: &OperationContext,
        _physical_id: &str,
        token: &str,
    ) -> OpResult {
        self.check("check_update", ctx, token)
    }

    async fn delete(
        &self,
        ctx: &OperationContext,
        physical_id: &str,
        properties: &Value,
    ) -> OpResult {
        self.record("delete", ctx, Some(physical_id), properties);
        let script = self.script_for(&ctx.resource_name);
        if script.fail_delete {
            return Err(PluginError::Permanent(format!(
                "{} delete failed",
                ctx.resource_name
            )));
        }
        if script.polls > 0 {
            return self.finish(physical_id.to_string(), Value::Null, script.polls);
        }
        self.live.lock().unwrap().remove(physical_id);
        Ok(OpOutcome::Done(ResourceData::default()))
    }

    async fn check_delete(
        &self,
        ctx: &OperationContext,
        _physical_id: &str,
        token: &str,
    ) -> OpResult {
        self.check("check_delete", ctx, token)
    }
}
