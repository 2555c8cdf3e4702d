//! Compute provider capability trait.
//!
//! The planner and executor depend on this trait rather than the EC2
//! client directly, so plans can be exercised against an in-memory
//! fake in tests.

use async_trait::async_trait;

use crate::config::IngressRule;
use crate::error::Result;

use super::types::{EnvironmentView, InstanceSpec, ObservedInstance, SecurityGroupSpec};

/// Capability trait for the compute provider.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Observes everything managed for a project/environment key.
    async fn observe(&self, project: &str, environment: &str) -> Result<EnvironmentView>;

    /// Creates a security group with its ingress rules.
    ///
    /// Returns the provider-assigned group ID.
    async fn create_security_group(&self, spec: &SecurityGroupSpec) -> Result<String>;

    /// Reconciles ingress rules in place: revokes then authorizes.
    async fn update_ingress(
        &self,
        group_id: &str,
        revoke: &[IngressRule],
        authorize: &[IngressRule],
    ) -> Result<()>;

    /// Deletes a security group.
    async fn delete_security_group(&self, group_id: &str) -> Result<()>;

    /// Launches an instance and returns its initial observation.
    async fn run_instance(&self, spec: &InstanceSpec) -> Result<ObservedInstance>;

    /// Terminates an instance.
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    /// Waits until an instance reports running, bounded by a timeout.
    async fn wait_until_running(
        &self,
        instance_id: &str,
        timeout_secs: u64,
    ) -> Result<ObservedInstance>;

    /// Gets the provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}
