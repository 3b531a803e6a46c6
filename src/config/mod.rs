// src/config/mod.rs

//! Engine configuration loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Parse durations and validate invariants (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_or_default};
pub use model::{
    parse_duration, EngineConfig, EngineSection, RawEngineConfig, RetryPolicy, RetrySection,
    TypeOverride, TypeSection,
};
pub use validate::validate_config;
