// src/template/mod.rs

//! Templates, environments and the resolver that turns them into resource
//! specs with dependency hints.

pub mod loader;
pub mod model;
pub mod refs;
pub mod resolver;

pub use loader::{load_environment, load_template, parse_template};
pub use model::{
    Environment, ParameterDefinition, ResolvedResource, ResolvedTemplate, ResourceDefinition,
    Template, TemplateSnapshot,
};
pub use resolver::{StandardResolver, TemplateResolver};
