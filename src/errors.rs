// src/errors.rs

//! Crate-wide error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Template or graph problems caught before any node is scheduled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("resource '{resource}' references undefined resource '{target}'")]
    UnknownReference { resource: String, target: String },

    #[error("resource '{resource}' cannot depend on itself")]
    SelfReference { resource: String },

    #[error("resource '{resource}' references undefined parameter '{parameter}'")]
    UnknownParameter { resource: String, parameter: String },

    #[error("parameter '{parameter}' has no value and no default")]
    MissingParameter { parameter: String },

    #[error("resource '{resource}' has unknown type '{resource_type}'")]
    UnknownResourceType {
        resource: String,
        resource_type: String,
    },

    #[error("resource registry alias loop involving '{alias}'")]
    AliasLoop { alias: String },

    #[error("dependency cycle between resources: {}", resources.join(", "))]
    Cycle { resources: Vec<String> },

    #[error("invalid template: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum ConvergeError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("transient resource error: {0}")]
    TransientResource(String),

    #[error("resource error: {0}")]
    PermanentResource(String),

    #[error("concurrent update conflict on {0}")]
    ConcurrencyConflict(String),

    #[error("stack '{stack}' is busy: locked by live engine '{owner}'")]
    StackBusy { stack: String, owner: String },

    #[error("{what} timed out after {elapsed:?}")]
    Timeout { what: String, elapsed: Duration },

    #[error("stack not found: {0}")]
    StackNotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConvergeError {
    pub fn storage(msg: impl Into<String>) -> Self {
        ConvergeError::Other(anyhow::anyhow!("storage: {}", msg.into()))
    }

    /// Whether this error should be retried by the worker's local policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConvergeError::TransientResource(_))
    }
}

pub type Result<T> = std::result::Result<T, ConvergeError>;
