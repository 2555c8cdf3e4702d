//! EC2 provisioner.
//!
//! Implements the compute provider capability on top of the EC2
//! client: tag-scoped observation, security group lifecycle, instance
//! launch and the run-state wait loop.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::IngressRule;
use crate::error::{GangwayError, ProviderError, Result};
use crate::state::InstanceRunState;

use super::client::Ec2Client;
use super::provider::ComputeProvider;
use super::types::{EnvironmentView, InstanceSpec, ObservedInstance, SecurityGroupSpec};

/// Polling interval while waiting for an instance state.
const WAIT_POLL_INTERVAL_SECS: u64 = 5;

/// EC2-backed compute provider.
#[derive(Debug, Clone)]
pub struct Ec2Provisioner {
    /// EC2 API client.
    client: Ec2Client,
}

impl Ec2Provisioner {
    /// Creates a new provisioner.
    #[must_use]
    pub const fn new(client: Ec2Client) -> Self {
        Self { client }
    }

    /// Gets the underlying client reference.
    #[must_use]
    pub const fn client(&self) -> &Ec2Client {
        &self.client
    }
}

#[async_trait]
impl ComputeProvider for Ec2Provisioner {
    async fn observe(&self, project: &str, environment: &str) -> Result<EnvironmentView> {
        let instances = self
            .client
            .describe_tagged_instances(project, environment)
            .await?;

        if instances.len() > 1 {
            warn!(
                "Observed {} instances for {project}/{environment}; expected at most one managed instance",
                instances.len()
            );
        }

        let security_group = self
            .client
            .describe_tagged_security_group(project, environment)
            .await?;

        let instance = instances.into_iter().find(|i| !i.is_terminated());

        debug!(
            "Observed environment {project}/{environment}: instance={}, security_group={}",
            instance.as_ref().map_or("none", |i| i.instance_id.as_str()),
            security_group
                .as_ref()
                .map_or("none", |g| g.group_id.as_str()),
        );

        Ok(EnvironmentView {
            instance,
            security_group,
        })
    }

    async fn create_security_group(&self, spec: &SecurityGroupSpec) -> Result<String> {
        let group_id = self.client.create_security_group(spec).await?;
        info!("Created security group: {} (ID: {group_id})", spec.name);
        Ok(group_id)
    }

    async fn update_ingress(
        &self,
        group_id: &str,
        revoke: &[IngressRule],
        authorize: &[IngressRule],
    ) -> Result<()> {
        if !revoke.is_empty() {
            self.client.revoke_ingress(group_id, revoke).await?;
        }
        if !authorize.is_empty() {
            self.client.authorize_ingress(group_id, authorize).await?;
        }
        info!(
            "Reconciled ingress on {group_id}: -{} +{}",
            revoke.len(),
            authorize.len()
        );
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        self.client.delete_security_group(group_id).await?;
        info!("Deleted security group: {group_id}");
        Ok(())
    }

    async fn run_instance(&self, spec: &InstanceSpec) -> Result<ObservedInstance> {
        let instance = self.client.run_instance(spec).await?;
        info!(
            "Launched instance: {} (ID: {})",
            spec.name, instance.instance_id
        );
        Ok(instance)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.client.terminate_instance(instance_id).await?;
        info!("Terminated instance: {instance_id}");
        Ok(())
    }

    async fn wait_until_running(
        &self,
        instance_id: &str,
        timeout_secs: u64,
    ) -> Result<ObservedInstance> {
        let start = std::time::Instant::now();
        let timeout = std::time::Duration::from_secs(timeout_secs);

        loop {
            let observed = self.client.describe_instance(instance_id).await?;

            if let Some(instance) = observed {
                match instance.status {
                    InstanceRunState::Running => return Ok(instance),
                    InstanceRunState::Terminated | InstanceRunState::ShuttingDown => {
                        return Err(GangwayError::Provider(ProviderError::api(
                            "DescribeInstances",
                            format!("instance {instance_id} terminated while waiting for running"),
                        )));
                    }
                    _ => {
                        debug!(
                            "Instance {instance_id} is {}, waiting for running",
                            instance.status
                        );
                    }
                }
            }

            if start.elapsed() > timeout {
                return Err(GangwayError::Provider(ProviderError::Timeout {
                    resource: instance_id.to_string(),
                    expected_state: String::from("running"),
                }));
            }

            tokio::time::sleep(std::time::Duration::from_secs(WAIT_POLL_INTERVAL_SECS)).await;
        }
    }

    fn provider_name(&self) -> &'static str {
        "aws-ec2"
    }
}
