//! Applied-state types.
//!
//! These types record the provider-confirmed state of previously created
//! resources. They are the source of truth for idempotent applies and
//! for output publication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum apply-history entries retained in state.
const MAX_HISTORY: usize = 50;

/// The complete applied state for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last fully applied declaration.
    pub config_hash: String,
    /// Monotonic counter incremented on every save.
    #[serde(default)]
    pub serial: u64,
    /// State of the compute instance, if one exists.
    pub instance: Option<InstanceState>,
    /// State of the security group, if one exists.
    pub security_group: Option<SecurityGroupState>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent apply history.
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
}

/// Recorded state of the compute instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    /// Logical instance name (from the declaration).
    pub name: String,
    /// Provider-assigned instance ID.
    pub instance_id: String,
    /// Hash of the instance declaration when applied.
    pub config_hash: String,
    /// Last observed run state.
    pub status: InstanceRunState,
    /// Machine image the instance was launched from.
    pub ami: String,
    /// Instance class.
    pub instance_type: String,
    /// Key-pair reference.
    pub key_name: String,
    /// Provider-assigned public address, when available.
    pub public_ip: Option<String>,
    /// Provider-assigned private address.
    pub private_ip: Option<String>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When this record was last updated.
    pub updated_at: DateTime<Utc>,
    /// Tags applied to the instance.
    pub tags: HashMap<String, String>,
}

/// Recorded state of the security group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityGroupState {
    /// Security group name.
    pub name: String,
    /// Provider-assigned group ID.
    pub group_id: String,
    /// Canonical ingress rule specs ("PORT/PROTOCOL@CIDR"), sorted.
    pub ingress: Vec<String>,
    /// When the group was created.
    pub created_at: DateTime<Utc>,
    /// When this record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Instance run state as recorded from the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceRunState {
    /// Instance is starting up.
    Pending,
    /// Instance is running.
    Running,
    /// Instance is shutting down prior to termination.
    ShuttingDown,
    /// Instance has been terminated.
    Terminated,
    /// Instance is stopping.
    Stopping,
    /// Instance is stopped.
    Stopped,
    /// Status is unknown.
    Unknown,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyHistoryEntry {
    /// When the apply occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: ApplyOperation,
    /// Declaration hash at time of apply.
    pub config_hash: String,
    /// Resources affected.
    pub resources: Vec<String>,
    /// Whether the apply succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of apply operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOperation {
    /// Initial provisioning.
    Create,
    /// Declaration change.
    Update,
    /// Drift reconciliation.
    Reconcile,
    /// Teardown.
    Destroy,
}

impl AppliedState {
    /// Creates a new empty applied state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            serial: 0,
            instance: None,
            security_group: None,
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Records the instance state.
    pub fn set_instance(&mut self, instance: InstanceState) {
        self.instance = Some(instance);
        self.last_updated = Utc::now();
    }

    /// Removes the instance record, returning it if present.
    pub fn clear_instance(&mut self) -> Option<InstanceState> {
        let removed = self.instance.take();
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Records the security group state.
    pub fn set_security_group(&mut self, group: SecurityGroupState) {
        self.security_group = Some(group);
        self.last_updated = Utc::now();
    }

    /// Removes the security group record, returning it if present.
    pub fn clear_security_group(&mut self) -> Option<SecurityGroupState> {
        let removed = self.security_group.take();
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Returns true if any resource is recorded.
    #[must_use]
    pub const fn has_resources(&self) -> bool {
        self.instance.is_some() || self.security_group.is_some()
    }

    /// Adds a history entry, keeping a bounded window.
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl InstanceState {
    /// Creates a new instance state record.
    #[must_use]
    pub fn new(name: &str, instance_id: &str, config_hash: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            instance_id: instance_id.to_string(),
            config_hash: config_hash.to_string(),
            status: InstanceRunState::Pending,
            ami: String::new(),
            instance_type: String::new(),
            key_name: String::new(),
            public_ip: None,
            private_ip: None,
            created_at: now,
            updated_at: now,
            tags: HashMap::new(),
        }
    }

    /// Updates the run state.
    pub fn set_status(&mut self, status: InstanceRunState) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Records the provider-assigned addresses.
    pub fn set_addresses(&mut self, public_ip: Option<String>, private_ip: Option<String>) {
        self.public_ip = public_ip;
        self.private_ip = private_ip;
        self.updated_at = Utc::now();
    }

    /// Returns true if the instance is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.status, InstanceRunState::Running)
    }
}

impl ApplyHistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: ApplyOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: ApplyOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for InstanceRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for ApplyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Reconcile => "reconcile",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_empty() {
        let state = AppliedState::new("demo-api", "prod");
        assert!(!state.has_resources());
        assert_eq!(state.serial, 0);
        assert_eq!(state.version, STATE_VERSION);
    }

    #[test]
    fn test_set_and_clear_instance() {
        let mut state = AppliedState::new("demo-api", "prod");
        state.set_instance(InstanceState::new("web", "i-0abc123", "hash"));
        assert!(state.has_resources());

        let removed = state.clear_instance().expect("instance should be present");
        assert_eq!(removed.instance_id, "i-0abc123");
        assert!(!state.has_resources());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = AppliedState::new("demo-api", "prod");
        for i in 0..60 {
            state.add_history(ApplyHistoryEntry::new(
                ApplyOperation::Update,
                &format!("hash-{i}"),
                vec![],
            ));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        // Oldest entries are dropped first
        assert_eq!(state.history[0].config_hash, "hash-10");
    }
}
