// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{
    parse_duration, EngineConfig, RawEngineConfig, RetryPolicy, TypeOverride,
};
use crate::errors::{ConvergeError, Result};

impl TryFrom<RawEngineConfig> for EngineConfig {
    type Error = ConvergeError;

    fn try_from(raw: RawEngineConfig) -> std::result::Result<Self, Self::Error> {
        validate_config(&raw)
    }
}

/// Parse durations and check the cross-field invariants of a raw config.
pub fn validate_config(raw: &RawEngineConfig) -> Result<EngineConfig> {
    let engine = &raw.engine;

    let lock_lease = duration_field("engine.lock_lease", &engine.lock_lease)?;
    let heartbeat_interval =
        duration_field("engine.heartbeat_interval", &engine.heartbeat_interval)?;
    let engine_liveness_timeout = duration_field(
        "engine.engine_liveness_timeout",
        &engine.engine_liveness_timeout,
    )?;
    let poll_interval = duration_field("engine.poll_interval", &engine.poll_interval)?;
    let max_poll_interval =
        duration_field("engine.max_poll_interval", &engine.max_poll_interval)?;
    let node_timeout = duration_field("engine.node_timeout", &engine.node_timeout)?;
    let stack_timeout = engine
        .stack_timeout
        .as_deref()
        .map(|s| duration_field("engine.stack_timeout", s))
        .transpose()?;

    if engine.queue_length == 0 {
        return Err(ConvergeError::Config(
            "[engine].queue_length must be >= 1 (got 0)".to_string(),
        ));
    }
    if heartbeat_interval >= lock_lease {
        return Err(ConvergeError::Config(format!(
            "[engine].heartbeat_interval ({heartbeat_interval:?}) must be shorter than lock_lease ({lock_lease:?})"
        )));
    }
    if max_poll_interval < poll_interval {
        return Err(ConvergeError::Config(
            "[engine].max_poll_interval must be >= poll_interval".to_string(),
        ));
    }
    if poll_interval.is_zero() {
        return Err(ConvergeError::Config(
            "[engine].poll_interval must be non-zero".to_string(),
        ));
    }

    let retry = validate_retry(raw)?;

    let mut type_overrides = std::collections::BTreeMap::new();
    for (type_name, section) in raw.resource_type.iter() {
        if section.max_attempts == Some(0) {
            return Err(ConvergeError::Config(format!(
                "[resource_type.\"{type_name}\"].max_attempts must be >= 1"
            )));
        }
        let node_timeout = section
            .node_timeout
            .as_deref()
            .map(|s| duration_field(&format!("resource_type.\"{type_name}\".node_timeout"), s))
            .transpose()?;
        type_overrides.insert(
            type_name.clone(),
            TypeOverride {
                replacement_policy: section.replacement_policy,
                max_attempts: section.max_attempts,
                node_timeout,
            },
        );
    }

    let engine_id = match engine.engine_id.as_deref().map(str::trim) {
        Some("") => {
            return Err(ConvergeError::Config(
                "[engine].engine_id must not be empty".to_string(),
            ));
        }
        Some(id) => id.to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    };

    Ok(EngineConfig {
        engine_id,
        lock_lease,
        heartbeat_interval,
        engine_liveness_timeout,
        poll_interval,
        max_poll_interval,
        node_timeout,
        stack_timeout,
        queue_length: engine.queue_length,
        retry,
        type_overrides,
    })
}

fn validate_retry(raw: &RawEngineConfig) -> Result<RetryPolicy> {
    let retry = &raw.retry;
    if retry.max_attempts == 0 {
        return Err(ConvergeError::Config(
            "[retry].max_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    if !(retry.backoff_multiplier >= 1.0) {
        return Err(ConvergeError::Config(format!(
            "[retry].backoff_multiplier must be >= 1.0 (got {})",
            retry.backoff_multiplier
        )));
    }
    let base_delay = duration_field("retry.base_delay", &retry.base_delay)?;
    let max_delay = duration_field("retry.max_delay", &retry.max_delay)?;
    if max_delay < base_delay {
        return Err(ConvergeError::Config(
            "[retry].max_delay must be >= base_delay".to_string(),
        ));
    }

    Ok(RetryPolicy {
        max_attempts: retry.max_attempts,
        base_delay,
        max_delay,
        backoff_multiplier: retry.backoff_multiplier,
    })
}

fn duration_field(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| ConvergeError::Config(format!("{field}: {e}")))
}
