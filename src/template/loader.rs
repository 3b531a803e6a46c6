// src/template/loader.rs

use std::fs;
use std::path::Path;

use crate::errors::Result;
use crate::template::model::{Environment, Template};

/// Read and deserialize a template file (TOML).
pub fn load_template(path: impl AsRef<Path>) -> Result<Template> {
    let contents = fs::read_to_string(path.as_ref())?;
    parse_template(&contents)
}

pub fn parse_template(contents: &str) -> Result<Template> {
    Ok(toml::from_str(contents)?)
}

/// Read and deserialize an environment file (TOML).
pub fn load_environment(path: impl AsRef<Path>) -> Result<Environment> {
    let contents = fs::read_to_string(path.as_ref())?;
    Ok(toml::from_str(&contents)?)
}
