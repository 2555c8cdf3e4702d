//! Declaration hashing for change detection.
//!
//! Deterministic hashing of the declaration enables idempotent applies:
//! an instance whose recorded hash matches the declaration needs no
//! work. All map and list iteration is sorted before hashing.

use sha2::{Digest, Sha256};

use super::spec::{DeployConfig, InstanceConfig};

/// Hasher for computing declaration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new declaration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire declaration.
    ///
    /// This hash changes when any part of the declaration changes,
    /// including ingress rules and declared outputs.
    #[must_use]
    pub fn hash_config(&self, config: &DeployConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());
        hasher.update(config.project.region.as_bytes());

        hasher.update(self.hash_instance(&config.instance).as_bytes());

        for spec in config.instance.ingress_specs() {
            hasher.update(spec.as_bytes());
        }

        let mut outputs = config.outputs.clone();
        outputs.sort_unstable();
        for output in outputs {
            hasher.update(output.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of the instance declaration alone.
    ///
    /// Covers exactly the attributes whose change forces a recreate;
    /// ingress rules are excluded because they are reconciled in place
    /// on the security group.
    #[must_use]
    pub fn hash_instance(&self, instance: &InstanceConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(instance.name.as_bytes());
        hasher.update(instance.ami.as_bytes());
        hasher.update(instance.instance_type.as_bytes());
        hasher.update(instance.key_name.as_bytes());

        if let Some(size) = instance.root_volume_gb {
            hasher.update(size.to_be_bytes());
        }

        let mut tags: Vec<_> = instance.tags.iter().collect();
        tags.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in tags {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes for equality.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{IngressProtocol, IngressRule};
    use std::collections::HashMap;

    fn create_test_instance(name: &str) -> InstanceConfig {
        InstanceConfig {
            name: name.to_string(),
            ami: String::from("ami-0953476d60561c955"),
            instance_type: String::from("t2.micro"),
            key_name: String::from("testkey"),
            ingress: vec![IngressRule::new(22, IngressProtocol::Tcp)],
            root_volume_gb: None,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn test_instance_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let instance = create_test_instance("web");

        assert_eq!(hasher.hash_instance(&instance), hasher.hash_instance(&instance));
    }

    #[test]
    fn test_tag_order_does_not_change_hash() {
        let hasher = ConfigHasher::new();

        let mut a = create_test_instance("web");
        a.tags.insert(String::from("team"), String::from("platform"));
        a.tags.insert(String::from("tier"), String::from("edge"));

        let mut b = create_test_instance("web");
        b.tags.insert(String::from("tier"), String::from("edge"));
        b.tags.insert(String::from("team"), String::from("platform"));

        assert_eq!(hasher.hash_instance(&a), hasher.hash_instance(&b));
    }

    #[test]
    fn test_ami_change_changes_hash() {
        let hasher = ConfigHasher::new();
        let a = create_test_instance("web");
        let mut b = create_test_instance("web");
        b.ami = String::from("ami-0e86e2d8cd5d2ab12");

        assert_ne!(hasher.hash_instance(&a), hasher.hash_instance(&b));
    }

    #[test]
    fn test_ingress_excluded_from_instance_hash() {
        let hasher = ConfigHasher::new();
        let a = create_test_instance("web");
        let mut b = create_test_instance("web");
        b.ingress.push(IngressRule::new(80, IngressProtocol::Tcp));

        assert_eq!(hasher.hash_instance(&a), hasher.hash_instance(&b));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
