//! EC2 API client.
//!
//! Thin adapter over the AWS SDK: builds requests from specs, converts
//! wire types into observed types, and maps SDK failures onto the
//! provider error kinds (rejected, throttled, not-found, network).

use std::collections::HashMap;

use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, InstanceType, IpPermission, IpRange, ResourceType,
    Tag, TagSpecification,
};
use aws_sdk_ec2::Client;
use tracing::{debug, info};

use crate::config::IngressRule;
use crate::error::{GangwayError, ProviderError, Result};

use super::types::{
    parse_run_state, InstanceSpec, ObservedInstance, ObservedSecurityGroup, SecurityGroupSpec,
    TAG_ENV, TAG_PROJECT,
};

/// Instance states that still count as existing.
const LIVE_STATES: &[&str] = &["pending", "running", "stopping", "stopped"];

/// EC2 API client.
#[derive(Debug, Clone)]
pub struct Ec2Client {
    /// Underlying SDK client.
    client: Client,
}

impl Ec2Client {
    /// Creates a new EC2 client for the given region.
    pub async fn new(region: &str) -> Self {
        let config = aws_config::from_env()
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;

        Self {
            client: Client::new(&config),
        }
    }

    /// Creates a client from an existing SDK client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Launches a single instance from the given spec.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Rejected` when the provider refuses the
    /// parameters, or another provider error on API failure.
    pub async fn run_instance(&self, spec: &InstanceSpec) -> Result<ObservedInstance> {
        info!("Launching instance: {} ({})", spec.name, spec.ami);

        let mut request = self
            .client
            .run_instances()
            .image_id(&spec.ami)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .key_name(&spec.key_name)
            .min_count(1)
            .max_count(1)
            .tag_specifications(tag_specification(ResourceType::Instance, &spec.tags));

        if let Some(group_id) = &spec.security_group_id {
            request = request.security_group_ids(group_id);
        }

        if let Some(size) = spec.root_volume_gb {
            request = request.block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name("/dev/xvda")
                    .ebs(
                        EbsBlockDevice::builder()
                            .volume_size(i32::try_from(size).unwrap_or(i32::MAX))
                            .build(),
                    )
                    .build(),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_sdk_error("RunInstances", &spec.name, &e))?;

        let instance = response.instances().first().ok_or_else(|| {
            GangwayError::Provider(ProviderError::api(
                "RunInstances",
                "response contained no instances",
            ))
        })?;

        Ok(to_observed_instance(instance))
    }

    /// Describes a single instance by ID, `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn describe_instance(&self, instance_id: &str) -> Result<Option<ObservedInstance>> {
        debug!("Describing instance: {instance_id}");

        let result = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if e.meta().code().is_some_and(|c| c.ends_with(".NotFound")) {
                    return Ok(None);
                }
                return Err(map_sdk_error("DescribeInstances", instance_id, &e));
            }
        };

        Ok(response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .map(to_observed_instance))
    }

    /// Lists live instances tagged with the given project/environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn describe_tagged_instances(
        &self,
        project: &str,
        environment: &str,
    ) -> Result<Vec<ObservedInstance>> {
        debug!("Listing instances for {project}/{environment}");

        let mut state_filter = Filter::builder().name("instance-state-name");
        for state in LIVE_STATES {
            state_filter = state_filter.values(*state);
        }

        let response = self
            .client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name(format!("tag:{TAG_PROJECT}"))
                    .values(project)
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name(format!("tag:{TAG_ENV}"))
                    .values(environment)
                    .build(),
            )
            .filters(state_filter.build())
            .send()
            .await
            .map_err(|e| map_sdk_error("DescribeInstances", project, &e))?;

        Ok(response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(to_observed_instance)
            .collect())
    }

    /// Terminates an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        info!("Terminating instance: {instance_id}");

        self.client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("TerminateInstances", instance_id, &e))?;

        Ok(())
    }

    /// Creates a security group and authorizes its ingress rules.
    ///
    /// # Errors
    ///
    /// Returns an error if creation or authorization fails. When
    /// authorization fails the group already exists; the caller's
    /// state must record it so a re-apply can converge.
    pub async fn create_security_group(&self, spec: &SecurityGroupSpec) -> Result<String> {
        info!("Creating security group: {}", spec.name);

        let response = self
            .client
            .create_security_group()
            .group_name(&spec.name)
            .description(&spec.description)
            .tag_specifications(tag_specification(ResourceType::SecurityGroup, &spec.tags))
            .send()
            .await
            .map_err(|e| map_sdk_error("CreateSecurityGroup", &spec.name, &e))?;

        let group_id = response
            .group_id()
            .ok_or_else(|| {
                GangwayError::Provider(ProviderError::api(
                    "CreateSecurityGroup",
                    "response contained no group ID",
                ))
            })?
            .to_string();

        if !spec.ingress.is_empty() {
            self.authorize_ingress(&group_id, &spec.ingress).await?;
        }

        Ok(group_id)
    }

    /// Authorizes ingress rules on a security group.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()> {
        debug!("Authorizing {} ingress rules on {group_id}", rules.len());

        let mut request = self
            .client
            .authorize_security_group_ingress()
            .group_id(group_id);

        for rule in rules {
            request = request.ip_permissions(to_ip_permission(rule));
        }

        request
            .send()
            .await
            .map_err(|e| map_sdk_error("AuthorizeSecurityGroupIngress", group_id, &e))?;

        Ok(())
    }

    /// Revokes ingress rules on a security group.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn revoke_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()> {
        debug!("Revoking {} ingress rules on {group_id}", rules.len());

        let mut request = self
            .client
            .revoke_security_group_ingress()
            .group_id(group_id);

        for rule in rules {
            request = request.ip_permissions(to_ip_permission(rule));
        }

        request
            .send()
            .await
            .map_err(|e| map_sdk_error("RevokeSecurityGroupIngress", group_id, &e))?;

        Ok(())
    }

    /// Finds the managed security group for a project/environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn describe_tagged_security_group(
        &self,
        project: &str,
        environment: &str,
    ) -> Result<Option<ObservedSecurityGroup>> {
        debug!("Looking up security group for {project}/{environment}");

        let response = self
            .client
            .describe_security_groups()
            .filters(
                Filter::builder()
                    .name(format!("tag:{TAG_PROJECT}"))
                    .values(project)
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name(format!("tag:{TAG_ENV}"))
                    .values(environment)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error("DescribeSecurityGroups", project, &e))?;

        Ok(response
            .security_groups()
            .first()
            .map(to_observed_security_group))
    }

    /// Deletes a security group.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        info!("Deleting security group: {group_id}");

        self.client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("DeleteSecurityGroup", group_id, &e))?;

        Ok(())
    }
}

/// Builds a tag specification for a resource type.
fn tag_specification(
    resource_type: ResourceType,
    tags: &HashMap<String, String>,
) -> TagSpecification {
    let mut builder = TagSpecification::builder().resource_type(resource_type);

    let mut sorted: Vec<_> = tags.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in sorted {
        builder = builder.tags(Tag::builder().key(key).value(value).build());
    }

    builder.build()
}

/// Converts an ingress rule into an SDK IP permission.
fn to_ip_permission(rule: &IngressRule) -> IpPermission {
    IpPermission::builder()
        .ip_protocol(rule.protocol.to_string())
        .from_port(i32::from(rule.port))
        .to_port(i32::from(rule.port))
        .ip_ranges(IpRange::builder().cidr_ip(&rule.cidr).build())
        .build()
}

/// Converts an SDK instance into an observed instance.
fn to_observed_instance(instance: &aws_sdk_ec2::types::Instance) -> ObservedInstance {
    let tags: HashMap<String, String> = instance
        .tags()
        .iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
        .collect();

    let status = instance
        .state()
        .and_then(|s| s.name())
        .map_or(crate::state::InstanceRunState::Unknown, |n| {
            parse_run_state(n.as_str())
        });

    ObservedInstance {
        instance_id: instance.instance_id().unwrap_or_default().to_string(),
        name: tags.get(super::types::TAG_NAME).cloned(),
        project: tags.get(TAG_PROJECT).cloned(),
        environment: tags.get(TAG_ENV).cloned(),
        spec_hash: tags.get(super::types::TAG_SPEC_HASH).cloned(),
        status,
        ami: instance.image_id().unwrap_or_default().to_string(),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        key_name: instance.key_name().map(ToString::to_string),
        public_ip: instance.public_ip_address().map(ToString::to_string),
        private_ip: instance.private_ip_address().map(ToString::to_string),
        security_group_ids: instance
            .security_groups()
            .iter()
            .filter_map(|g| g.group_id().map(ToString::to_string))
            .collect(),
        tags,
    }
}

/// Converts an SDK security group into an observed group.
fn to_observed_security_group(
    group: &aws_sdk_ec2::types::SecurityGroup,
) -> ObservedSecurityGroup {
    let tags: HashMap<String, String> = group
        .tags()
        .iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
        .collect();

    let mut ingress: Vec<String> = group
        .ip_permissions()
        .iter()
        .flat_map(|permission| {
            let protocol = permission.ip_protocol().unwrap_or("tcp").to_string();
            let from = permission.from_port().unwrap_or_default();
            let to = permission.to_port().unwrap_or(from);
            permission.ip_ranges().iter().filter_map(move |range| {
                let cidr = range.cidr_ip()?;
                if from == to {
                    Some(format!("{from}/{protocol}@{cidr}"))
                } else {
                    Some(format!("{from}-{to}/{protocol}@{cidr}"))
                }
            })
        })
        .collect();
    ingress.sort_unstable();

    ObservedSecurityGroup {
        group_id: group.group_id().unwrap_or_default().to_string(),
        name: group.group_name().unwrap_or_default().to_string(),
        ingress,
        tags,
    }
}

/// Maps an SDK error onto the provider error kinds.
fn map_sdk_error<E>(operation: &str, resource: &str, err: &SdkError<E>) -> GangwayError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code = err.meta().code().unwrap_or_default().to_string();
    let message = err
        .meta()
        .message()
        .map_or_else(|| err.to_string(), ToString::to_string);

    if code == "RequestLimitExceeded" || code.contains("Throttl") {
        return GangwayError::Provider(ProviderError::Throttled {
            retry_after_secs: 5,
        });
    }

    if code.ends_with(".NotFound") {
        return GangwayError::Provider(ProviderError::NotFound {
            resource: resource.to_string(),
        });
    }

    if code.starts_with("Invalid")
        || code.starts_with("Missing")
        || code.starts_with("Unsupported")
    {
        return GangwayError::Provider(ProviderError::rejected(
            resource,
            format!("{code}: {message}"),
        ));
    }

    if matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)) {
        return GangwayError::Provider(ProviderError::Network { message });
    }

    GangwayError::Provider(ProviderError::api(operation, message))
}
