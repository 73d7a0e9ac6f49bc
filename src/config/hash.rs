//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of resource declarations and
//! JSON documents. The declaration hash is recorded on the state snapshot
//! after a fully successful apply, so an unchanged configuration can be
//! recognised without diffing.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::spec::ResourceDeclaration;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of a whole set of resource declarations.
    ///
    /// Keys are visited in lexical order, so insertion order never matters.
    #[must_use]
    pub fn hash_declarations(&self, resources: &BTreeMap<String, ResourceDeclaration>) -> String {
        let mut hasher = Sha256::new();

        for (name, declaration) in resources {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(self.hash_resource(declaration).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource declaration.
    #[must_use]
    pub fn hash_resource(&self, declaration: &ResourceDeclaration) -> String {
        let mut hasher = Sha256::new();

        hasher.update(declaration.resource_type.as_bytes());
        hasher.update([0u8]);

        // Attribute maps are BTreeMaps, so serialization is ordered
        for (key, value) in &declaration.attributes {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }

        // Dependencies (sorted for determinism)
        let mut deps: Vec<&String> = declaration.depends_on.iter().collect();
        deps.sort();
        deps.dedup();
        for dep in deps {
            hasher.update(dep.as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of an arbitrary JSON document.
    #[must_use]
    pub fn hash_value(&self, value: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declarations() -> BTreeMap<String, ResourceDeclaration> {
        let mut resources = BTreeMap::new();
        resources.insert(
            String::from("network"),
            ResourceDeclaration::new("vpc").with_attribute("cidr", "10.0.0.0/16"),
        );
        resources.insert(
            String::from("server"),
            ResourceDeclaration::new("instance")
                .with_attribute("subnet", "ref(network.id)")
                .depends_on("network"),
        );
        resources
    }

    #[test]
    fn test_declaration_hash_deterministic() {
        let hasher = ConfigHasher::new();
        assert_eq!(
            hasher.hash_declarations(&declarations()),
            hasher.hash_declarations(&declarations())
        );
    }

    #[test]
    fn test_attribute_change_changes_hash() {
        let hasher = ConfigHasher::new();
        let before = hasher.hash_declarations(&declarations());

        let mut changed = declarations();
        if let Some(network) = changed.get_mut("network") {
            network.attributes.insert(String::from("cidr"), json!("10.1.0.0/16"));
        }

        assert_ne!(before, hasher.hash_declarations(&changed));
    }

    #[test]
    fn test_dependency_order_ignored() {
        let hasher = ConfigHasher::new();
        let a = ResourceDeclaration::new("lb").depends_on("x").depends_on("y");
        let b = ResourceDeclaration::new("lb").depends_on("y").depends_on("x");
        assert_eq!(hasher.hash_resource(&a), hasher.hash_resource(&b));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let full_hash = "abcdef1234567890abcdef1234567890";
        let short = hasher.short_hash(full_hash);

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }
}
