//! Output publication.
//!
//! After a successful apply, the declared output names are resolved
//! against applied state into a stable name-to-value mapping for
//! downstream automation. A declared output with no value is an error,
//! never an empty string.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GangwayError, OutputError, Result};
use crate::state::AppliedState;

/// Output name for the instance public address.
pub const OUTPUT_PUBLIC_IP: &str = "ec2_public_ip";

/// Output name for the instance ID.
pub const OUTPUT_INSTANCE_ID: &str = "ec2_instance_id";

/// Output name for the instance private address.
pub const OUTPUT_PRIVATE_IP: &str = "ec2_private_ip";

/// Output name for the security group ID.
pub const OUTPUT_SECURITY_GROUP_ID: &str = "security_group_id";

/// All output names that can be declared.
pub const KNOWN_OUTPUTS: &[&str] = &[
    OUTPUT_PUBLIC_IP,
    OUTPUT_INSTANCE_ID,
    OUTPUT_PRIVATE_IP,
    OUTPUT_SECURITY_GROUP_ID,
];

/// A published set of named outputs.
///
/// Names are stable across applies; callers bind by name. The mapping
/// is ordered so repeated publications render identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputSet {
    /// Name-to-value mapping.
    values: BTreeMap<String, String>,
}

impl OutputSet {
    /// Creates an empty output set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Gets an output value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Inserts an output value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Iterates over name/value pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no outputs are published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Display for OutputSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, value) in &self.values {
            writeln!(f, "{name} = {value}")?;
        }
        Ok(())
    }
}

/// Publisher deriving outputs from applied state.
#[derive(Debug, Default)]
pub struct OutputPublisher;

impl OutputPublisher {
    /// Creates a new output publisher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Publishes the declared outputs from applied state.
    ///
    /// # Errors
    ///
    /// Returns `OutputError::MissingOutput` if any declared name has no
    /// corresponding value.
    pub fn publish(&self, declared: &[String], state: &AppliedState) -> Result<OutputSet> {
        let mut outputs = OutputSet::new();

        for name in declared {
            let value = Self::resolve(name, state)?;
            debug!("Publishing output {name}");
            outputs.insert(name.clone(), value);
        }

        Ok(outputs)
    }

    /// Resolves a single output name against applied state.
    fn resolve(name: &str, state: &AppliedState) -> Result<String> {
        let value = match name {
            OUTPUT_PUBLIC_IP => state
                .instance
                .as_ref()
                .and_then(|i| i.public_ip.clone())
                .ok_or_else(|| {
                    missing(name, "instance has no public address assigned")
                })?,
            OUTPUT_PRIVATE_IP => state
                .instance
                .as_ref()
                .and_then(|i| i.private_ip.clone())
                .ok_or_else(|| {
                    missing(name, "instance has no private address assigned")
                })?,
            OUTPUT_INSTANCE_ID => state
                .instance
                .as_ref()
                .map(|i| i.instance_id.clone())
                .ok_or_else(|| missing(name, "no instance in applied state"))?,
            OUTPUT_SECURITY_GROUP_ID => state
                .security_group
                .as_ref()
                .map(|g| g.group_id.clone())
                .ok_or_else(|| missing(name, "no security group in applied state"))?,
            other => {
                return Err(missing(
                    other,
                    "output name is not produced by any managed resource",
                ));
            }
        };

        if value.is_empty() {
            return Err(missing(name, "resolved value is empty"));
        }

        Ok(value)
    }
}

/// Builds a missing-output error.
fn missing(name: &str, reason: &str) -> GangwayError {
    GangwayError::Output(OutputError::missing(name, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InstanceState, SecurityGroupState};
    use chrono::Utc;

    fn state_with_instance(public_ip: Option<&str>) -> AppliedState {
        let mut state = AppliedState::new("demo-api", "prod");
        let mut instance = InstanceState::new("web", "i-0abc1234567890def", "hash");
        instance.public_ip = public_ip.map(String::from);
        instance.private_ip = Some(String::from("10.0.1.17"));
        state.set_instance(instance);
        state.set_security_group(SecurityGroupState {
            name: String::from("demo-api-prod-sg"),
            group_id: String::from("sg-0fedcba987654321"),
            ingress: vec![String::from("22/tcp@0.0.0.0/0")],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        state
    }

    #[test]
    fn test_publish_all_known_outputs() {
        let state = state_with_instance(Some("54.210.1.2"));
        let declared: Vec<String> = KNOWN_OUTPUTS.iter().map(|s| (*s).to_string()).collect();

        let outputs = OutputPublisher::new()
            .publish(&declared, &state)
            .expect("all outputs should resolve");

        assert_eq!(outputs.get(OUTPUT_PUBLIC_IP), Some("54.210.1.2"));
        assert_eq!(outputs.get(OUTPUT_INSTANCE_ID), Some("i-0abc1234567890def"));
        assert_eq!(outputs.get(OUTPUT_PRIVATE_IP), Some("10.0.1.17"));
        assert_eq!(
            outputs.get(OUTPUT_SECURITY_GROUP_ID),
            Some("sg-0fedcba987654321")
        );
    }

    #[test]
    fn test_missing_public_ip_is_an_error() {
        let state = state_with_instance(None);
        let declared = vec![String::from(OUTPUT_PUBLIC_IP)];

        let result = OutputPublisher::new().publish(&declared, &state);
        assert!(matches!(
            result,
            Err(GangwayError::Output(OutputError::MissingOutput { .. }))
        ));
    }

    #[test]
    fn test_unknown_output_is_an_error() {
        let state = state_with_instance(Some("54.210.1.2"));
        let declared = vec![String::from("elastic_ip")];

        let result = OutputPublisher::new().publish(&declared, &state);
        assert!(result.is_err());
    }

    #[test]
    fn test_publication_is_stable() {
        let state = state_with_instance(Some("54.210.1.2"));
        let declared = vec![
            String::from(OUTPUT_PUBLIC_IP),
            String::from(OUTPUT_INSTANCE_ID),
        ];

        let publisher = OutputPublisher::new();
        let first = publisher.publish(&declared, &state).expect("should publish");
        let second = publisher.publish(&declared, &state).expect("should publish");

        assert_eq!(first, second);
    }

    #[test]
    fn test_public_ip_parses_as_ipv4() {
        let state = state_with_instance(Some("54.210.1.2"));
        let declared = vec![String::from(OUTPUT_PUBLIC_IP)];

        let outputs = OutputPublisher::new()
            .publish(&declared, &state)
            .expect("should publish");

        let ip = outputs.get(OUTPUT_PUBLIC_IP).expect("output present");
        assert!(ip.parse::<std::net::Ipv4Addr>().is_ok());
    }
}
