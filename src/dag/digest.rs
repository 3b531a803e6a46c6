// src/dag/digest.rs

//! Stable digests of node inputs, used to decide whether a node has work.

use blake3::Hasher;

use crate::template::ResolvedResource;

/// Digest of everything that defines an update node's desired state: type,
/// (unresolved) properties and dependencies.
///
/// `serde_json` objects are ordered maps, so equal inputs always hash equal.
pub fn input_digest(spec: &ResolvedResource) -> String {
    let mut hasher = Hasher::new();
    hasher.update(spec.resource_type.as_bytes());
    hasher.update(&[0]);
    hasher.update(spec.properties.to_string().as_bytes());
    for dep in spec.requires.iter() {
        hasher.update(&[0]);
        hasher.update(dep.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
