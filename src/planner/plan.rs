//! Change plan types and construction.
//!
//! A change plan is the ordered sequence of provider operations that
//! reconciles the declaration with reality. Ordering is explicit: the
//! security group exists before any instance that references it, and
//! teardown runs in reverse.

use chrono::{DateTime, Utc};

use crate::aws::{system_tags, EnvironmentView, InstanceSpec, SecurityGroupSpec};
use crate::config::{DeployConfig, IngressRule};
use crate::state::AppliedState;

use super::diff::{DiffResult, DiffType};

/// A complete change plan.
#[derive(Debug)]
pub struct ChangePlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Declaration hash this plan is based on.
    pub config_hash: String,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
}

/// A single planned action.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    /// Action type.
    pub action_type: ActionType,
    /// Resource name.
    pub resource_name: String,
    /// Instance spec (for launch actions).
    pub instance_spec: Option<InstanceSpec>,
    /// Security group spec (for group creation).
    pub group_spec: Option<SecurityGroupSpec>,
    /// Ingress change (for in-place reconciliation).
    pub ingress_change: Option<IngressChange>,
    /// Provider-assigned ID of the target (for destroy actions).
    pub resource_id: Option<String>,
    /// Reason for this action.
    pub reason: String,
    /// New declaration hash (if applicable).
    pub new_hash: Option<String>,
    /// Dependencies (action indices that must complete first).
    pub dependencies: Vec<usize>,
}

/// Rules to revoke and authorize during an in-place ingress update.
#[derive(Debug, Clone)]
pub struct IngressChange {
    /// Rules to authorize.
    pub authorize: Vec<IngressRule>,
    /// Rules to revoke.
    pub revoke: Vec<IngressRule>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    /// Create the security group.
    CreateSecurityGroup,
    /// Reconcile ingress rules in place.
    UpdateIngress,
    /// Delete the security group.
    DeleteSecurityGroup,
    /// Launch the instance.
    RunInstance,
    /// Terminate the instance.
    TerminateInstance,
    /// No operation (for tracking).
    Noop,
}

impl ChangePlan {
    /// Creates a plan from a diff result.
    ///
    /// Dependency ordering: the security group action (if any) comes
    /// first; an instance replace terminates before launching; the
    /// launch depends on both.
    #[must_use]
    pub fn from_diff(
        diff: &DiffResult,
        config: &DeployConfig,
        observed: &EnvironmentView,
        config_hash: &str,
    ) -> Self {
        let mut actions = Vec::new();
        let mut group_action_idx = None;

        if let Some(group_diff) = diff.security_group_diff() {
            match group_diff.diff_type {
                DiffType::Create => {
                    group_action_idx = Some(actions.len());
                    actions.push(PlannedAction {
                        action_type: ActionType::CreateSecurityGroup,
                        resource_name: group_diff.name.clone(),
                        instance_spec: None,
                        group_spec: Some(build_group_spec(config)),
                        ingress_change: None,
                        resource_id: None,
                        reason: String::from("Security group declared but not observed"),
                        new_hash: None,
                        dependencies: vec![],
                    });
                }
                DiffType::Update => {
                    let change = build_ingress_change(config, observed);
                    group_action_idx = Some(actions.len());
                    actions.push(PlannedAction {
                        action_type: ActionType::UpdateIngress,
                        resource_name: group_diff.name.clone(),
                        instance_spec: None,
                        group_spec: None,
                        ingress_change: Some(change),
                        resource_id: observed
                            .security_group
                            .as_ref()
                            .map(|g| g.group_id.clone()),
                        reason: String::from("Ingress rules drifted from declaration"),
                        new_hash: None,
                        dependencies: vec![],
                    });
                }
                _ => {}
            }
        }

        if let Some(instance_diff) = diff.instance_diff() {
            match instance_diff.diff_type {
                DiffType::Create => {
                    actions.push(PlannedAction {
                        action_type: ActionType::RunInstance,
                        resource_name: instance_diff.name.clone(),
                        instance_spec: Some(build_instance_spec(
                            config,
                            observed,
                            instance_diff.new_hash.as_deref().unwrap_or(""),
                        )),
                        group_spec: None,
                        ingress_change: None,
                        resource_id: None,
                        reason: String::from("Instance declared but not observed"),
                        new_hash: instance_diff.new_hash.clone(),
                        dependencies: group_action_idx.into_iter().collect(),
                    });
                }
                DiffType::Recreate => {
                    let terminate_idx = actions.len();
                    actions.push(PlannedAction {
                        action_type: ActionType::TerminateInstance,
                        resource_name: instance_diff.name.clone(),
                        instance_spec: None,
                        group_spec: None,
                        ingress_change: None,
                        resource_id: observed
                            .instance
                            .as_ref()
                            .map(|i| i.instance_id.clone()),
                        reason: format!(
                            "Replacing instance: {}",
                            summarize_details(instance_diff)
                        ),
                        new_hash: None,
                        dependencies: vec![],
                    });

                    let mut deps: Vec<usize> = group_action_idx.into_iter().collect();
                    deps.push(terminate_idx);
                    actions.push(PlannedAction {
                        action_type: ActionType::RunInstance,
                        resource_name: instance_diff.name.clone(),
                        instance_spec: Some(build_instance_spec(
                            config,
                            observed,
                            instance_diff.new_hash.as_deref().unwrap_or(""),
                        )),
                        group_spec: None,
                        ingress_change: None,
                        resource_id: None,
                        reason: format!(
                            "Replacing instance: {}",
                            summarize_details(instance_diff)
                        ),
                        new_hash: instance_diff.new_hash.clone(),
                        dependencies: deps,
                    });
                }
                _ => {}
            }
        }

        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions,
        }
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty(config_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions: vec![],
        }
    }

    /// Creates a teardown plan from recorded and observed resources.
    ///
    /// Terminates the instance first; the security group can only be
    /// deleted once nothing references it.
    #[must_use]
    pub fn teardown(
        config: &DeployConfig,
        state: Option<&AppliedState>,
        observed: &EnvironmentView,
    ) -> Self {
        let mut actions = Vec::new();

        let instance_id = observed
            .instance
            .as_ref()
            .map(|i| i.instance_id.clone())
            .or_else(|| {
                state
                    .and_then(|s| s.instance.as_ref())
                    .map(|i| i.instance_id.clone())
            });

        let group_id = observed
            .security_group
            .as_ref()
            .map(|g| g.group_id.clone())
            .or_else(|| {
                state
                    .and_then(|s| s.security_group.as_ref())
                    .map(|g| g.group_id.clone())
            });

        let mut terminate_idx = None;
        if let Some(id) = instance_id {
            terminate_idx = Some(actions.len());
            actions.push(PlannedAction {
                action_type: ActionType::TerminateInstance,
                resource_name: config.instance.full_name(&config.project),
                instance_spec: None,
                group_spec: None,
                ingress_change: None,
                resource_id: Some(id),
                reason: String::from("Environment teardown"),
                new_hash: None,
                dependencies: vec![],
            });
        }

        if let Some(id) = group_id {
            actions.push(PlannedAction {
                action_type: ActionType::DeleteSecurityGroup,
                resource_name: config.security_group_name(),
                instance_spec: None,
                group_spec: None,
                ingress_change: None,
                resource_id: Some(id),
                reason: String::from("Environment teardown"),
                new_hash: None,
                dependencies: terminate_idx.into_iter().collect(),
            });
        }

        Self {
            created_at: Utc::now(),
            config_hash: String::new(),
            actions,
        }
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }
}

/// Builds the security group spec from the declaration.
fn build_group_spec(config: &DeployConfig) -> SecurityGroupSpec {
    SecurityGroupSpec {
        name: config.security_group_name(),
        description: format!(
            "Managed by gangway for {}",
            config.qualified_name()
        ),
        ingress: config.instance.ingress.clone(),
        tags: system_tags(
            &config.project.name,
            &config.project.environment,
            "sg",
            "",
        ),
    }
}

/// Builds the instance spec from the declaration.
fn build_instance_spec(
    config: &DeployConfig,
    observed: &EnvironmentView,
    spec_hash: &str,
) -> InstanceSpec {
    let mut tags = config.instance.tags.clone();
    tags.extend(system_tags(
        &config.project.name,
        &config.project.environment,
        &config.instance.name,
        spec_hash,
    ));

    InstanceSpec {
        name: config.instance.full_name(&config.project),
        ami: config.instance.ami.clone(),
        instance_type: config.instance.instance_type.clone(),
        key_name: config.instance.key_name.clone(),
        security_group_id: observed
            .security_group
            .as_ref()
            .map(|g| g.group_id.clone()),
        root_volume_gb: config.instance.root_volume_gb,
        tags,
    }
}

/// Computes the rule sets to authorize and revoke.
fn build_ingress_change(config: &DeployConfig, observed: &EnvironmentView) -> IngressChange {
    let desired = config.instance.ingress_specs();
    let current: Vec<String> = observed
        .security_group
        .as_ref()
        .map(|g| g.ingress.clone())
        .unwrap_or_default();

    let authorize: Vec<IngressRule> = config
        .instance
        .ingress
        .iter()
        .filter(|r| !current.contains(&r.spec_string()))
        .cloned()
        .collect();

    // Observed rules that cannot be parsed back (e.g. port ranges added
    // out of band) are left alone rather than guessed at
    let revoke: Vec<IngressRule> = current
        .iter()
        .filter(|spec| !desired.contains(spec))
        .filter_map(|spec| IngressRule::parse(spec).ok())
        .collect();

    IngressChange { authorize, revoke }
}

/// Produces a compact field summary for a diff's reason string.
fn summarize_details(diff: &super::diff::ResourceDiff) -> String {
    if diff.details.is_empty() {
        return String::from("declaration changed");
    }

    diff.details
        .iter()
        .map(|d| d.field.clone())
        .collect::<Vec<_>>()
        .join(", ")
}

impl PlannedAction {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action_type {
            ActionType::CreateSecurityGroup => {
                format!("Create security group '{}'", self.resource_name)
            }
            ActionType::UpdateIngress => {
                format!("Update ingress on '{}'", self.resource_name)
            }
            ActionType::DeleteSecurityGroup => {
                format!("Delete security group '{}'", self.resource_name)
            }
            ActionType::RunInstance => format!("Launch instance '{}'", self.resource_name),
            ActionType::TerminateInstance => {
                format!("Terminate instance '{}'", self.resource_name)
            }
            ActionType::Noop => format!("No change for '{}'", self.resource_name),
        }
    }
}

/// Marker ensuring plan ordering invariants hold.
///
/// Used by tests and the executor: every dependency index must point
/// at an earlier action.
#[must_use]
pub fn plan_is_well_ordered(plan: &ChangePlan) -> bool {
    plan.actions
        .iter()
        .enumerate()
        .all(|(idx, action)| action.dependencies.iter().all(|dep| *dep < idx))
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CreateSecurityGroup => "create-sg",
            Self::UpdateIngress => "update-ingress",
            Self::DeleteSecurityGroup => "delete-sg",
            Self::RunInstance => "run-instance",
            Self::TerminateInstance => "terminate-instance",
            Self::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action_type, self.resource_name)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ChangePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.actions.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Change plan ({} actions):", self.actions.len())?;
        for (i, action) in self.actions.iter().enumerate() {
            writeln!(f, "  {i}. {action}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{ObservedInstance, ObservedSecurityGroup};
    use crate::config::{
        ConfigHasher, IngressProtocol, InstanceConfig, ProjectConfig, ReadinessConfig,
        StateBackend, StateConfig,
    };
    use crate::planner::DiffEngine;
    use crate::state::InstanceRunState;
    use std::collections::HashMap;

    fn test_config() -> DeployConfig {
        DeployConfig {
            project: ProjectConfig {
                name: String::from("demo-api"),
                environment: String::from("prod"),
                region: String::from("us-east-1"),
            },
            state: StateConfig {
                backend: StateBackend::Local,
                bucket: None,
                prefix: None,
                region: None,
                path: None,
            },
            instance: InstanceConfig {
                name: String::from("web"),
                ami: String::from("ami-0953476d60561c955"),
                instance_type: String::from("t2.micro"),
                key_name: String::from("testkey"),
                ingress: vec![IngressRule::new(22, IngressProtocol::Tcp)],
                root_volume_gb: None,
                tags: HashMap::new(),
            },
            outputs: vec![String::from("ec2_public_ip")],
            readiness: ReadinessConfig::default(),
            deploy: None,
        }
    }

    fn observed_with_group_and_instance(config: &DeployConfig) -> EnvironmentView {
        let hasher = ConfigHasher::new();
        EnvironmentView {
            instance: Some(ObservedInstance {
                instance_id: String::from("i-0abc1234567890def"),
                name: Some(String::from("web")),
                project: Some(String::from("demo-api")),
                environment: Some(String::from("prod")),
                spec_hash: Some(hasher.hash_instance(&config.instance)),
                status: InstanceRunState::Running,
                ami: config.instance.ami.clone(),
                instance_type: config.instance.instance_type.clone(),
                key_name: Some(config.instance.key_name.clone()),
                public_ip: Some(String::from("54.210.1.2")),
                private_ip: None,
                security_group_ids: vec![String::from("sg-0fedcba987654321")],
                tags: HashMap::new(),
            }),
            security_group: Some(ObservedSecurityGroup {
                group_id: String::from("sg-0fedcba987654321"),
                name: String::from("demo-api-prod-sg"),
                ingress: config.instance.ingress_specs(),
                tags: HashMap::new(),
            }),
        }
    }

    #[test]
    fn test_create_plan_orders_group_before_instance() {
        let config = test_config();
        let engine = DiffEngine::new();
        let observed = EnvironmentView::default();

        let diff = engine.compute_diff(&config, None, &observed);
        let plan = ChangePlan::from_diff(&diff, &config, &observed, "hash");

        assert_eq!(plan.action_count(), 2);
        assert_eq!(plan.actions[0].action_type, ActionType::CreateSecurityGroup);
        assert_eq!(plan.actions[1].action_type, ActionType::RunInstance);
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert!(plan_is_well_ordered(&plan));
    }

    #[test]
    fn test_recreate_plan_terminates_before_launching() {
        let mut config = test_config();
        let engine = DiffEngine::new();
        let observed = observed_with_group_and_instance(&config);

        config.instance.instance_type = String::from("t3.small");
        let diff = engine.compute_diff(&config, None, &observed);
        let plan = ChangePlan::from_diff(&diff, &config, &observed, "hash");

        assert_eq!(plan.action_count(), 2);
        assert_eq!(plan.actions[0].action_type, ActionType::TerminateInstance);
        assert_eq!(
            plan.actions[0].resource_id.as_deref(),
            Some("i-0abc1234567890def")
        );
        assert_eq!(plan.actions[1].action_type, ActionType::RunInstance);
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert!(plan_is_well_ordered(&plan));
    }

    #[test]
    fn test_ingress_update_plan_carries_deltas() {
        let mut config = test_config();
        let engine = DiffEngine::new();
        let observed = observed_with_group_and_instance(&config);

        config
            .instance
            .ingress
            .push(IngressRule::new(80, IngressProtocol::Tcp));
        let diff = engine.compute_diff(&config, None, &observed);
        let plan = ChangePlan::from_diff(&diff, &config, &observed, "hash");

        assert_eq!(plan.action_count(), 1);
        let action = &plan.actions[0];
        assert_eq!(action.action_type, ActionType::UpdateIngress);

        let change = action.ingress_change.as_ref().expect("ingress change");
        assert_eq!(change.authorize.len(), 1);
        assert_eq!(change.authorize[0].port, 80);
        assert!(change.revoke.is_empty());
    }

    #[test]
    fn test_instance_spec_carries_existing_group() {
        let config = test_config();
        let engine = DiffEngine::new();

        let mut observed = observed_with_group_and_instance(&config);
        observed.instance = None;

        let diff = engine.compute_diff(&config, None, &observed);
        let plan = ChangePlan::from_diff(&diff, &config, &observed, "hash");

        let run = plan
            .actions
            .iter()
            .find(|a| a.action_type == ActionType::RunInstance)
            .expect("run action");
        let spec = run.instance_spec.as_ref().expect("instance spec");
        assert_eq!(
            spec.security_group_id.as_deref(),
            Some("sg-0fedcba987654321")
        );
    }

    #[test]
    fn test_teardown_deletes_group_after_instance() {
        let config = test_config();
        let observed = observed_with_group_and_instance(&config);

        let plan = ChangePlan::teardown(&config, None, &observed);

        assert_eq!(plan.action_count(), 2);
        assert_eq!(plan.actions[0].action_type, ActionType::TerminateInstance);
        assert_eq!(plan.actions[1].action_type, ActionType::DeleteSecurityGroup);
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert!(plan_is_well_ordered(&plan));
    }

    #[test]
    fn test_teardown_of_nothing_is_empty() {
        let config = test_config();
        let plan = ChangePlan::teardown(&config, None, &EnvironmentView::default());
        assert!(plan.is_empty());
    }
}
