// src/dag/mod.rs

//! Convergence graph representation and construction.
//!
//! - [`node`] defines node identity and the data passed between nodes.
//! - [`graph`] holds the dependency graph of one traversal.
//! - [`builder`] derives that graph from a resolved template plus the
//!   persisted resource rows.
//! - [`diff`] classifies the new graph against what is deployed.
//! - [`digest`] fingerprints resource inputs.

pub mod builder;
pub mod diff;
pub mod digest;
pub mod graph;
pub mod node;

pub use builder::{BuiltGraph, GraphBuilder};
pub use diff::{DeployedGraph, GraphDiff};
pub use graph::{CleanupPlan, ConvergenceGraph, NodeChange, NodePlan, UpdatePlan};
pub use node::{InputData, NodeKey, NodeKind, ResourceData};
