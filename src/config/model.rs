// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::types::ReplacementPolicy;

/// Engine configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// engine_id = "engine-a"
/// lock_lease = "30s"
/// poll_interval = "200ms"
///
/// [retry]
/// max_attempts = 3
/// base_delay = "100ms"
///
/// [resource_type."Convergent::Test"]
/// replacement_policy = "delete_before_create"
/// ```
///
/// All sections are optional and have reasonable defaults. Durations are kept
/// as strings here; [`EngineConfig`] holds the parsed, validated form.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawEngineConfig {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub retry: RetrySection,

    /// Per resource-type overrides, keyed by registered type name.
    #[serde(default)]
    pub resource_type: BTreeMap<String, TypeSection>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Identity of this engine instance; a random uuid when absent.
    #[serde(default)]
    pub engine_id: Option<String>,

    #[serde(default = "default_lock_lease")]
    pub lock_lease: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    /// Age of an engine's last heartbeat after which it is considered dead.
    #[serde(default = "default_engine_liveness_timeout")]
    pub engine_liveness_timeout: String,

    /// Delay before the first check of an asynchronous operation.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Upper bound for the check backoff.
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval: String,

    #[serde(default = "default_node_timeout")]
    pub node_timeout: String,

    #[serde(default)]
    pub stack_timeout: Option<String>,

    /// Capacity of the in-process message bus.
    #[serde(default = "default_queue_length")]
    pub queue_length: usize,
}

fn default_lock_lease() -> String {
    "30s".to_string()
}

fn default_heartbeat_interval() -> String {
    "10s".to_string()
}

fn default_engine_liveness_timeout() -> String {
    "30s".to_string()
}

fn default_poll_interval() -> String {
    "200ms".to_string()
}

fn default_max_poll_interval() -> String {
    "5s".to_string()
}

fn default_node_timeout() -> String {
    "1h".to_string()
}

fn default_queue_length() -> usize {
    256
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            engine_id: None,
            lock_lease: default_lock_lease(),
            heartbeat_interval: default_heartbeat_interval(),
            engine_liveness_timeout: default_engine_liveness_timeout(),
            poll_interval: default_poll_interval(),
            max_poll_interval: default_max_poll_interval(),
            node_timeout: default_node_timeout(),
            stack_timeout: None,
            queue_length: default_queue_length(),
        }
    }
}

/// `[retry]` section: default policy for transient resource errors.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> String {
    "100ms".to_string()
}

fn default_max_delay() -> String {
    "5s".to_string()
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// `[resource_type."<name>"]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TypeSection {
    #[serde(default)]
    pub replacement_policy: Option<ReplacementPolicy>,

    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub node_timeout: Option<String>,
}

/// Bounded exponential backoff for transient resource errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Delay to wait before attempt number `attempt + 1` (attempts count
    /// from 1).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exp);
        let capped = ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Per-type overrides applied on top of a plugin's own policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeOverride {
    pub replacement_policy: Option<ReplacementPolicy>,
    pub max_attempts: Option<u32>,
    pub node_timeout: Option<Duration>,
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub engine_id: String,
    pub lock_lease: Duration,
    pub heartbeat_interval: Duration,
    pub engine_liveness_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub node_timeout: Duration,
    pub stack_timeout: Option<Duration>,
    pub queue_length: usize,
    pub retry: RetryPolicy,
    pub type_overrides: BTreeMap<String, TypeOverride>,
}

impl EngineConfig {
    /// Delay before the `poll`-th check of an asynchronous operation
    /// (polls count from 0): doubles from `poll_interval` up to
    /// `max_poll_interval`.
    pub fn poll_delay(&self, poll: u32) -> Duration {
        let factor = 2u32.saturating_pow(poll.min(16));
        self.poll_interval
            .saturating_mul(factor)
            .min(self.max_poll_interval)
    }

    /// Builder-style helper used by tests and embedders.
    pub fn with_engine_id(mut self, engine_id: impl Into<String>) -> Self {
        self.engine_id = engine_id.into();
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: uuid::Uuid::new_v4().to_string(),
            lock_lease: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            engine_liveness_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
            max_poll_interval: Duration::from_secs(5),
            node_timeout: Duration::from_secs(60 * 60),
            stack_timeout: None,
            queue_length: 256,
            retry: RetryPolicy::default(),
            type_overrides: BTreeMap::new(),
        }
    }
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' missing unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
