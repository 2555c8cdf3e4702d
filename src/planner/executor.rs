//! Plan executor.
//!
//! Applies a change plan against the compute provider in dependency
//! order. Convergence is at-least-once: a partial failure leaves the
//! already-applied subset recorded in state, and a re-apply picks up
//! from reality rather than rolling back.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::aws::{ComputeProvider, ObservedInstance};
use crate::error::{GangwayError, ProviderError, Result};
use crate::state::{
    AppliedState, ApplyHistoryEntry, ApplyOperation, InstanceState, SecurityGroupState,
};

use super::plan::{ActionType, ChangePlan, PlannedAction};

/// How long to wait for a launched instance to report running.
const RUN_WAIT_TIMEOUT_SECS: u64 = 300;

/// Executor for change plans.
#[derive(Debug)]
pub struct PlanExecutor<'a, P: ComputeProvider> {
    /// Compute provider.
    provider: &'a P,
    /// Whether to continue past failed actions.
    continue_on_error: bool,
}

/// Result of executing a single action.
#[derive(Debug)]
pub struct ActionResult {
    /// Action index within the plan.
    pub index: usize,
    /// Action that was executed.
    pub action: PlannedAction,
    /// Whether the action succeeded.
    pub success: bool,
    /// Whether the action was skipped due to a failed dependency.
    pub skipped: bool,
    /// Provider-assigned resource ID (if any).
    pub resource_id: Option<String>,
    /// Error message (if failed).
    pub error: Option<String>,
}

/// Result of executing the entire plan.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Individual action results.
    pub results: Vec<ActionResult>,
    /// Total actions executed.
    pub total_executed: usize,
    /// Number of successful actions.
    pub successful: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Number of skipped actions.
    pub skipped: usize,
    /// Whether the entire plan succeeded.
    pub success: bool,
}

impl<'a, P: ComputeProvider> PlanExecutor<'a, P> {
    /// Creates a new plan executor.
    #[must_use]
    pub const fn new(provider: &'a P) -> Self {
        Self {
            provider,
            continue_on_error: false,
        }
    }

    /// Sets whether to continue on errors.
    #[must_use]
    pub const fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Executes a change plan, recording progress into `state`.
    ///
    /// # Errors
    ///
    /// Returns an error only on invariant violations; per-action
    /// failures are reported in the execution result so the recorded
    /// state still reflects what actually happened.
    pub async fn execute(
        &self,
        plan: &ChangePlan,
        operation: ApplyOperation,
        state: &mut AppliedState,
    ) -> Result<ExecutionResult> {
        info!("Executing change plan with {} actions", plan.actions.len());

        if plan.actions.is_empty() {
            return Ok(ExecutionResult {
                results: vec![],
                total_executed: 0,
                successful: 0,
                failed: 0,
                skipped: 0,
                success: true,
            });
        }

        let mut results = Vec::new();
        let mut failed_indices: HashSet<usize> = HashSet::new();

        for (idx, action) in plan.actions.iter().enumerate() {
            let deps_failed = action
                .dependencies
                .iter()
                .any(|dep| failed_indices.contains(dep));

            if deps_failed {
                warn!("Skipping action {idx} due to failed dependencies");
                results.push(ActionResult {
                    index: idx,
                    action: action.clone(),
                    success: false,
                    skipped: true,
                    resource_id: None,
                    error: Some(String::from("Skipped due to dependency failure")),
                });
                failed_indices.insert(idx);
                continue;
            }

            let result = self.execute_action(idx, action, state).await;

            if !result.success {
                failed_indices.insert(idx);

                if !self.continue_on_error {
                    results.push(result);
                    break;
                }
            }

            results.push(result);
        }

        let successful = results.iter().filter(|r| r.success).count();
        let skipped = results.iter().filter(|r| r.skipped).count();
        let failed = results.iter().filter(|r| !r.success && !r.skipped).count();

        let execution_result = ExecutionResult {
            total_executed: results.len(),
            successful,
            failed,
            skipped,
            success: failed == 0 && skipped == 0,
            results,
        };

        let resources: Vec<String> = plan
            .actions
            .iter()
            .map(|a| a.resource_name.clone())
            .collect();

        if execution_result.success {
            state.add_history(ApplyHistoryEntry::new(
                operation,
                &plan.config_hash,
                resources,
            ));
            state.config_hash.clone_from(&plan.config_hash);
        } else {
            state.add_history(ApplyHistoryEntry::failed(
                operation,
                &plan.config_hash,
                resources,
                &format!("{} actions failed", execution_result.failed),
            ));
        }

        Ok(execution_result)
    }

    /// Executes a single action.
    async fn execute_action(
        &self,
        index: usize,
        action: &PlannedAction,
        state: &mut AppliedState,
    ) -> ActionResult {
        info!("Executing action {index}: {}", action.description());

        match action.action_type {
            ActionType::CreateSecurityGroup => {
                self.execute_create_group(index, action, state).await
            }
            ActionType::UpdateIngress => self.execute_update_ingress(index, action, state).await,
            ActionType::DeleteSecurityGroup => {
                self.execute_delete_group(index, action, state).await
            }
            ActionType::RunInstance => self.execute_run(index, action, state).await,
            ActionType::TerminateInstance => self.execute_terminate(index, action, state).await,
            ActionType::Noop => ActionResult {
                index,
                action: action.clone(),
                success: true,
                skipped: false,
                resource_id: None,
                error: None,
            },
        }
    }

    /// Creates the security group.
    async fn execute_create_group(
        &self,
        index: usize,
        action: &PlannedAction,
        state: &mut AppliedState,
    ) -> ActionResult {
        let Some(spec) = &action.group_spec else {
            return Self::invalid_action(index, action, "Missing security group spec");
        };

        match self.provider.create_security_group(spec).await {
            Ok(group_id) => {
                let mut specs: Vec<String> = spec
                    .ingress
                    .iter()
                    .map(crate::config::IngressRule::spec_string)
                    .collect();
                specs.sort_unstable();

                let now = Utc::now();
                state.set_security_group(SecurityGroupState {
                    name: spec.name.clone(),
                    group_id: group_id.clone(),
                    ingress: specs,
                    created_at: now,
                    updated_at: now,
                });

                ActionResult {
                    index,
                    action: action.clone(),
                    success: true,
                    skipped: false,
                    resource_id: Some(group_id),
                    error: None,
                }
            }
            Err(e) => {
                error!("Failed to create security group {}: {e}", spec.name);
                ActionResult {
                    index,
                    action: action.clone(),
                    success: false,
                    skipped: false,
                    resource_id: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Reconciles ingress rules in place.
    async fn execute_update_ingress(
        &self,
        index: usize,
        action: &PlannedAction,
        state: &mut AppliedState,
    ) -> ActionResult {
        let Some(change) = &action.ingress_change else {
            return Self::invalid_action(index, action, "Missing ingress change");
        };

        let group_id = action.resource_id.clone().or_else(|| {
            state
                .security_group
                .as_ref()
                .map(|g| g.group_id.clone())
        });

        let Some(group_id) = group_id else {
            return Self::invalid_action(index, action, "No security group ID available");
        };

        match self
            .provider
            .update_ingress(&group_id, &change.revoke, &change.authorize)
            .await
        {
            Ok(()) => {
                if let Some(group) = state.security_group.as_mut() {
                    let mut specs: Vec<String> = group
                        .ingress
                        .iter()
                        .filter(|s| {
                            !change
                                .revoke
                                .iter()
                                .any(|r| r.spec_string() == **s)
                        })
                        .cloned()
                        .collect();
                    specs.extend(change.authorize.iter().map(|r| r.spec_string()));
                    specs.sort_unstable();
                    specs.dedup();
                    group.ingress = specs;
                    group.updated_at = Utc::now();
                }

                ActionResult {
                    index,
                    action: action.clone(),
                    success: true,
                    skipped: false,
                    resource_id: Some(group_id),
                    error: None,
                }
            }
            Err(e) => {
                error!("Failed to update ingress on {group_id}: {e}");
                ActionResult {
                    index,
                    action: action.clone(),
                    success: false,
                    skipped: false,
                    resource_id: Some(group_id),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Deletes the security group.
    async fn execute_delete_group(
        &self,
        index: usize,
        action: &PlannedAction,
        state: &mut AppliedState,
    ) -> ActionResult {
        let group_id = action.resource_id.clone().or_else(|| {
            state
                .security_group
                .as_ref()
                .map(|g| g.group_id.clone())
        });

        let Some(group_id) = group_id else {
            debug!("No security group recorded, delete considered done");
            state.clear_security_group();
            return ActionResult {
                index,
                action: action.clone(),
                success: true,
                skipped: false,
                resource_id: None,
                error: None,
            };
        };

        match self.provider.delete_security_group(&group_id).await {
            Ok(()) => {
                state.clear_security_group();
                ActionResult {
                    index,
                    action: action.clone(),
                    success: true,
                    skipped: false,
                    resource_id: Some(group_id),
                    error: None,
                }
            }
            Err(e) => {
                if is_not_found(&e) {
                    state.clear_security_group();
                    info!("Security group {group_id} was already gone");
                    return ActionResult {
                        index,
                        action: action.clone(),
                        success: true,
                        skipped: false,
                        resource_id: Some(group_id),
                        error: None,
                    };
                }

                error!("Failed to delete security group {group_id}: {e}");
                ActionResult {
                    index,
                    action: action.clone(),
                    success: false,
                    skipped: false,
                    resource_id: Some(group_id),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Launches the instance and waits for it to run.
    async fn execute_run(
        &self,
        index: usize,
        action: &PlannedAction,
        state: &mut AppliedState,
    ) -> ActionResult {
        let Some(spec) = &action.instance_spec else {
            return Self::invalid_action(index, action, "Missing instance spec");
        };

        // The group may have been created earlier in this same plan
        let mut spec = spec.clone();
        if spec.security_group_id.is_none() {
            spec.security_group_id = state.security_group.as_ref().map(|g| g.group_id.clone());
        }

        if spec.security_group_id.is_none() {
            return Self::invalid_action(index, action, "No security group available for launch");
        }

        let launched = match self.provider.run_instance(&spec).await {
            Ok(instance) => instance,
            Err(e) => {
                error!("Failed to launch instance {}: {e}", spec.name);
                return ActionResult {
                    index,
                    action: action.clone(),
                    success: false,
                    skipped: false,
                    resource_id: None,
                    error: Some(e.to_string()),
                };
            }
        };

        // Record the launch before waiting so a wait failure still
        // leaves the instance in state for the next converge
        let spec_hash = action.new_hash.as_deref().unwrap_or("");
        state.set_instance(build_instance_state(&spec, &launched, spec_hash));

        match self
            .provider
            .wait_until_running(&launched.instance_id, RUN_WAIT_TIMEOUT_SECS)
            .await
        {
            Ok(running) => {
                state.set_instance(build_instance_state(&spec, &running, spec_hash));
                info!(
                    "Instance {} running at {}",
                    running.instance_id,
                    running.public_ip.as_deref().unwrap_or("<no public ip>")
                );

                ActionResult {
                    index,
                    action: action.clone(),
                    success: true,
                    skipped: false,
                    resource_id: Some(running.instance_id),
                    error: None,
                }
            }
            Err(e) => {
                error!(
                    "Instance {} launched but did not reach running: {e}",
                    launched.instance_id
                );
                ActionResult {
                    index,
                    action: action.clone(),
                    success: false,
                    skipped: false,
                    resource_id: Some(launched.instance_id),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Terminates the instance.
    async fn execute_terminate(
        &self,
        index: usize,
        action: &PlannedAction,
        state: &mut AppliedState,
    ) -> ActionResult {
        let instance_id = action.resource_id.clone().or_else(|| {
            state.instance.as_ref().map(|i| i.instance_id.clone())
        });

        let Some(instance_id) = instance_id else {
            debug!("No instance recorded, terminate considered done");
            state.clear_instance();
            return ActionResult {
                index,
                action: action.clone(),
                success: true,
                skipped: false,
                resource_id: None,
                error: None,
            };
        };

        match self.provider.terminate_instance(&instance_id).await {
            Ok(()) => {
                state.clear_instance();
                ActionResult {
                    index,
                    action: action.clone(),
                    success: true,
                    skipped: false,
                    resource_id: Some(instance_id),
                    error: None,
                }
            }
            Err(e) => {
                if is_not_found(&e) {
                    state.clear_instance();
                    info!("Instance {instance_id} was already terminated");
                    return ActionResult {
                        index,
                        action: action.clone(),
                        success: true,
                        skipped: false,
                        resource_id: Some(instance_id),
                        error: None,
                    };
                }

                error!("Failed to terminate instance {instance_id}: {e}");
                ActionResult {
                    index,
                    action: action.clone(),
                    success: false,
                    skipped: false,
                    resource_id: Some(instance_id),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Builds a failure result for a malformed action.
    fn invalid_action(index: usize, action: &PlannedAction, message: &str) -> ActionResult {
        ActionResult {
            index,
            action: action.clone(),
            success: false,
            skipped: false,
            resource_id: None,
            error: Some(message.to_string()),
        }
    }
}

/// Builds an instance state record from a spec and observation.
fn build_instance_state(
    spec: &crate::aws::InstanceSpec,
    observed: &ObservedInstance,
    spec_hash: &str,
) -> InstanceState {
    let mut instance =
        InstanceState::new(&spec.name, &observed.instance_id, spec_hash);
    instance.status = observed.status;
    instance.ami.clone_from(&spec.ami);
    instance.instance_type.clone_from(&spec.instance_type);
    instance.key_name.clone_from(&spec.key_name);
    instance.public_ip.clone_from(&observed.public_ip);
    instance.private_ip.clone_from(&observed.private_ip);
    instance.tags.clone_from(&spec.tags);
    instance
}

/// Returns true for not-found provider errors.
const fn is_not_found(err: &GangwayError) -> bool {
    matches!(err, GangwayError::Provider(ProviderError::NotFound { .. }))
}

impl ExecutionResult {
    /// Returns true if all actions succeeded.
    #[must_use]
    pub const fn all_successful(&self) -> bool {
        self.success && self.failed == 0 && self.skipped == 0
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} actions: {} successful, {} failed, {} skipped",
            self.total_executed, self.successful, self.failed, self.skipped
        )
    }
}
