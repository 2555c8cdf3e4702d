//! EC2 provider types.
//!
//! Specs describe what to create; observed types describe what exists.
//! Both sides are independent of the SDK wire types so the planner and
//! executor can be tested without a live provider.

use std::collections::HashMap;

use crate::config::IngressRule;
use crate::state::InstanceRunState;

/// Tag key for project identification.
pub const TAG_PROJECT: &str = "gangway_project";

/// Tag key for environment identification.
pub const TAG_ENV: &str = "gangway_env";

/// Tag key for the logical resource name.
pub const TAG_NAME: &str = "gangway_name";

/// Tag key for the declaration hash.
pub const TAG_SPEC_HASH: &str = "gangway_spec_hash";

/// The standard `Name` tag shown in the EC2 console.
pub const TAG_DISPLAY_NAME: &str = "Name";

/// Specification for launching an instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Full instance name (project-environment-name).
    pub name: String,
    /// Machine image identifier.
    pub ami: String,
    /// Instance class.
    pub instance_type: String,
    /// Key-pair reference.
    pub key_name: String,
    /// Security group the instance joins; resolved at execution time
    /// when the group is created by an earlier action in the same plan.
    pub security_group_id: Option<String>,
    /// Root volume size override in GB.
    pub root_volume_gb: Option<u32>,
    /// Tags to apply.
    pub tags: HashMap<String, String>,
}

/// Specification for creating a security group.
#[derive(Debug, Clone)]
pub struct SecurityGroupSpec {
    /// Security group name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Ingress rules to authorize.
    pub ingress: Vec<IngressRule>,
    /// Tags to apply.
    pub tags: HashMap<String, String>,
}

/// An instance as observed from the provider.
#[derive(Debug, Clone)]
pub struct ObservedInstance {
    /// Provider-assigned instance ID.
    pub instance_id: String,
    /// Logical name (from tags).
    pub name: Option<String>,
    /// Project name (from tags).
    pub project: Option<String>,
    /// Environment (from tags).
    pub environment: Option<String>,
    /// Declaration hash (from tags).
    pub spec_hash: Option<String>,
    /// Current run state.
    pub status: InstanceRunState,
    /// Machine image the instance runs.
    pub ami: String,
    /// Instance class.
    pub instance_type: String,
    /// Key-pair reference.
    pub key_name: Option<String>,
    /// Public address, when assigned.
    pub public_ip: Option<String>,
    /// Private address.
    pub private_ip: Option<String>,
    /// Security group IDs the instance belongs to.
    pub security_group_ids: Vec<String>,
    /// All tags.
    pub tags: HashMap<String, String>,
}

/// A security group as observed from the provider.
#[derive(Debug, Clone)]
pub struct ObservedSecurityGroup {
    /// Provider-assigned group ID.
    pub group_id: String,
    /// Group name.
    pub name: String,
    /// Canonical ingress rule specs ("PORT/PROTOCOL@CIDR"), sorted.
    pub ingress: Vec<String>,
    /// All tags.
    pub tags: HashMap<String, String>,
}

/// Everything observed for one project/environment key.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentView {
    /// The managed instance, if one exists.
    pub instance: Option<ObservedInstance>,
    /// The managed security group, if one exists.
    pub security_group: Option<ObservedSecurityGroup>,
}

impl ObservedInstance {
    /// Returns true if this instance is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.status, InstanceRunState::Running)
    }

    /// Returns true if this instance is gone or on its way out.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        matches!(
            self.status,
            InstanceRunState::Terminated | InstanceRunState::ShuttingDown
        )
    }

    /// Returns true if this instance is managed by Gangway.
    #[must_use]
    pub const fn is_managed(&self) -> bool {
        self.project.is_some() && self.environment.is_some()
    }
}

impl EnvironmentView {
    /// Returns true if nothing is observed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.instance.is_none() && self.security_group.is_none()
    }
}

/// Parses the EC2 instance state name into a run state.
#[must_use]
pub fn parse_run_state(name: &str) -> InstanceRunState {
    match name {
        "pending" => InstanceRunState::Pending,
        "running" => InstanceRunState::Running,
        "shutting-down" => InstanceRunState::ShuttingDown,
        "terminated" => InstanceRunState::Terminated,
        "stopping" => InstanceRunState::Stopping,
        "stopped" => InstanceRunState::Stopped,
        _ => InstanceRunState::Unknown,
    }
}

/// Builds the system tags for a managed resource.
#[must_use]
pub fn system_tags(
    project: &str,
    environment: &str,
    name: &str,
    spec_hash: &str,
) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    tags.insert(TAG_PROJECT.to_string(), project.to_string());
    tags.insert(TAG_ENV.to_string(), environment.to_string());
    tags.insert(TAG_NAME.to_string(), name.to_string());
    tags.insert(TAG_SPEC_HASH.to_string(), spec_hash.to_string());
    tags.insert(
        TAG_DISPLAY_NAME.to_string(),
        format!("{project}-{environment}-{name}"),
    );
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_state() {
        assert_eq!(parse_run_state("running"), InstanceRunState::Running);
        assert_eq!(
            parse_run_state("shutting-down"),
            InstanceRunState::ShuttingDown
        );
        assert_eq!(parse_run_state("weird"), InstanceRunState::Unknown);
    }

    #[test]
    fn test_system_tags() {
        let tags = system_tags("demo-api", "prod", "web", "abc123");
        assert_eq!(tags.get(TAG_PROJECT).map(String::as_str), Some("demo-api"));
        assert_eq!(
            tags.get(TAG_DISPLAY_NAME).map(String::as_str),
            Some("demo-api-prod-web")
        );
    }
}
