//! Reconciler for converging declared and applied state.
//!
//! Owns the lock discipline around every read and write of applied
//! state: acquire with bounded backoff, do the work, always release.
//! Planning is a pure read; apply executes the plan and records
//! whatever actually happened, converged or not.

use tracing::{debug, info, warn};

use crate::aws::ComputeProvider;
use crate::config::{ConfigHasher, DeployConfig};
use crate::error::Result;
use crate::planner::{ChangePlan, DiffEngine, DiffResult, PlanExecutor};
use crate::state::{AppliedState, ApplyOperation, LockInfo, StateStore};

/// Default bounded attempts for lock acquisition.
const DEFAULT_LOCK_ATTEMPTS: u32 = 5;

/// Base backoff between lock attempts in milliseconds.
const DEFAULT_LOCK_BACKOFF_MS: u64 = 500;

/// Reconciler for one environment.
pub struct Reconciler<'a, S: StateStore, P: ComputeProvider> {
    /// Declaration.
    config: &'a DeployConfig,
    /// State store.
    state_store: &'a S,
    /// Compute provider.
    provider: &'a P,
    /// Declaration hasher.
    hasher: ConfigHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Bounded lock acquisition attempts.
    lock_attempts: u32,
    /// Base lock backoff in milliseconds.
    lock_backoff_ms: u64,
    /// Whether apply continues past failed actions.
    continue_on_error: bool,
}

/// Report of an apply or destroy run.
#[derive(Debug)]
pub struct ApplyReport {
    /// Whether the run fully converged.
    pub success: bool,
    /// Number of resources created.
    pub created: usize,
    /// Number of resources updated in place.
    pub updated: usize,
    /// Number of resources replaced.
    pub recreated: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
    /// Errors encountered.
    pub errors: Vec<String>,
    /// Applied state after the run.
    pub state: AppliedState,
}

impl<'a, S: StateStore, P: ComputeProvider> Reconciler<'a, S, P> {
    /// Creates a new reconciler.
    #[must_use]
    pub const fn new(config: &'a DeployConfig, state_store: &'a S, provider: &'a P) -> Self {
        Self {
            config,
            state_store,
            provider,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
            lock_attempts: DEFAULT_LOCK_ATTEMPTS,
            lock_backoff_ms: DEFAULT_LOCK_BACKOFF_MS,
            continue_on_error: false,
        }
    }

    /// Sets the bounded lock acquisition attempts.
    #[must_use]
    pub const fn with_lock_attempts(mut self, attempts: u32) -> Self {
        self.lock_attempts = attempts;
        self
    }

    /// Sets the base lock backoff in milliseconds.
    #[must_use]
    pub const fn with_lock_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.lock_backoff_ms = backoff_ms;
        self
    }

    /// Sets whether apply continues past failed actions.
    #[must_use]
    pub const fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Computes the change plan without side effects.
    ///
    /// The state read happens under the lock; the lock is released
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns a conflict error when the lock cannot be acquired
    /// within the bounded attempts.
    pub async fn plan(&self) -> Result<(DiffResult, ChangePlan)> {
        let lock = self.acquire_lock("plan").await?;
        let result = self.plan_locked().await;
        self.release_lock(&lock).await;
        result
    }

    /// Applies the declaration, converging reality toward it.
    ///
    /// Partial failures are recorded: the already-applied subset stays
    /// in state and a later apply picks up from there.
    ///
    /// # Errors
    ///
    /// Returns a conflict error when the lock cannot be acquired, or
    /// an error when observation itself fails.
    pub async fn apply(&self) -> Result<ApplyReport> {
        let lock = self.acquire_lock("apply").await?;
        let result = self.apply_locked().await;
        self.release_lock(&lock).await;
        result
    }

    /// Tears down every managed resource and deletes the state.
    ///
    /// # Errors
    ///
    /// Returns a conflict error when the lock cannot be acquired, or
    /// an error when teardown fails partway.
    pub async fn destroy(&self) -> Result<ApplyReport> {
        let lock = self.acquire_lock("destroy").await?;
        let result = self.destroy_locked().await;
        self.release_lock(&lock).await;
        result
    }

    /// Plan body, runs under the lock.
    async fn plan_locked(&self) -> Result<(DiffResult, ChangePlan)> {
        let state = self.state_store.load().await?;
        let observed = self
            .provider
            .observe(&self.config.project.name, &self.config.project.environment)
            .await?;

        let diff = self
            .diff_engine
            .compute_diff(self.config, state.as_ref(), &observed);

        let config_hash = self.hasher.hash_config(self.config);
        let plan = if diff.has_changes() {
            ChangePlan::from_diff(&diff, self.config, &observed, &config_hash)
        } else {
            ChangePlan::empty(&config_hash)
        };

        info!(
            "Plan for {}: {} creates, {} updates, {} replacements, {} unchanged",
            self.config.qualified_name(),
            diff.creates,
            diff.updates,
            diff.recreates,
            diff.unchanged
        );

        Ok((diff, plan))
    }

    /// Apply body, runs under the lock.
    async fn apply_locked(&self) -> Result<ApplyReport> {
        let mut state = self.state_store.load().await?.unwrap_or_else(|| {
            AppliedState::new(&self.config.project.name, &self.config.project.environment)
        });

        let observed = self
            .provider
            .observe(&self.config.project.name, &self.config.project.environment)
            .await?;

        let diff = self
            .diff_engine
            .compute_diff(self.config, Some(&state), &observed);

        if !diff.has_changes() {
            info!("No changes required - state is converged");
            return Ok(ApplyReport {
                success: true,
                created: 0,
                updated: 0,
                recreated: 0,
                unchanged: diff.unchanged,
                errors: vec![],
                state,
            });
        }

        let config_hash = self.hasher.hash_config(self.config);
        let plan = ChangePlan::from_diff(&diff, self.config, &observed, &config_hash);

        debug!("{plan}");

        let operation = if state.config_hash.is_empty() {
            ApplyOperation::Create
        } else {
            ApplyOperation::Update
        };

        let executor =
            PlanExecutor::new(self.provider).with_continue_on_error(self.continue_on_error);
        let execution = executor.execute(&plan, operation, &mut state).await?;

        // Save whatever happened; partial applies stay recorded
        state.serial += 1;
        self.state_store.save(&state).await?;

        let errors: Vec<String> = execution
            .results
            .iter()
            .filter(|r| !r.success)
            .filter_map(|r| r.error.clone())
            .collect();

        if !execution.success {
            warn!(
                "Apply did not fully converge: {} of {} actions failed",
                execution.failed, execution.total_executed
            );
        }

        Ok(ApplyReport {
            success: execution.success,
            created: diff.creates,
            updated: diff.updates,
            recreated: diff.recreates,
            unchanged: diff.unchanged,
            errors,
            state,
        })
    }

    /// Destroy body, runs under the lock.
    async fn destroy_locked(&self) -> Result<ApplyReport> {
        let mut state = self.state_store.load().await?.unwrap_or_else(|| {
            AppliedState::new(&self.config.project.name, &self.config.project.environment)
        });

        let observed = self
            .provider
            .observe(&self.config.project.name, &self.config.project.environment)
            .await?;

        let plan = ChangePlan::teardown(self.config, Some(&state), &observed);

        if plan.is_empty() {
            info!("Nothing to destroy");
            self.state_store.delete().await?;
            return Ok(ApplyReport {
                success: true,
                created: 0,
                updated: 0,
                recreated: 0,
                unchanged: 0,
                errors: vec![],
                state,
            });
        }

        let executor =
            PlanExecutor::new(self.provider).with_continue_on_error(self.continue_on_error);
        let execution = executor
            .execute(&plan, ApplyOperation::Destroy, &mut state)
            .await?;

        let errors: Vec<String> = execution
            .results
            .iter()
            .filter(|r| !r.success)
            .filter_map(|r| r.error.clone())
            .collect();

        if execution.success {
            // Only an explicit teardown removes the state object
            self.state_store.delete().await?;
        } else {
            state.serial += 1;
            self.state_store.save(&state).await?;
            warn!(
                "Destroy did not complete: {} of {} actions failed",
                execution.failed, execution.total_executed
            );
        }

        Ok(ApplyReport {
            success: execution.success,
            created: 0,
            updated: 0,
            recreated: 0,
            unchanged: 0,
            errors,
            state,
        })
    }

    /// Acquires the state lock with bounded, backed-off retries.
    async fn acquire_lock(&self, operation: &str) -> Result<LockInfo> {
        let mut last_err = None;

        for attempt in 1..=self.lock_attempts {
            match self.state_store.acquire_lock("", operation).await {
                Ok(lock) => return Ok(lock),
                Err(e) if e.is_state_conflict() && attempt < self.lock_attempts => {
                    let backoff = self.lock_backoff_ms * u64::from(attempt);
                    debug!(
                        "Lock attempt {attempt}/{} conflicted, backing off {backoff}ms",
                        self.lock_attempts
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            crate::error::GangwayError::internal("lock acquisition exhausted without an error")
        }))
    }

    /// Releases the lock, logging rather than masking the original
    /// result on failure.
    async fn release_lock(&self, lock: &LockInfo) {
        if let Err(e) = self.state_store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "converged" } else { "incomplete" };
        writeln!(f, "Apply {status}:")?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Replaced: {}", self.recreated)?;
        writeln!(f, "  Unchanged: {}", self.unchanged)?;

        if !self.errors.is_empty() {
            writeln!(f, "  Errors:")?;
            for error in &self.errors {
                writeln!(f, "    - {error}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{
        EnvironmentView, InstanceSpec, ObservedInstance, ObservedSecurityGroup,
        SecurityGroupSpec, TAG_SPEC_HASH,
    };
    use crate::config::{
        DeployTargetConfig, IngressProtocol, IngressRule, InstanceConfig, ProjectConfig,
        ReadinessConfig, StateBackend, StateConfig,
    };
    use crate::error::{GangwayError, ProviderError};
    use crate::handoff::{CommandOutput, HandoffNotifier, MockNotifier, MockRemoteExecutor};
    use crate::outputs::{OutputPublisher, OUTPUT_PUBLIC_IP};
    use crate::readiness::ReadinessGate;
    use crate::state::{InstanceRunState, LocalStateStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory provider double tracking one instance and one group.
    struct FakeProvider {
        cloud: Mutex<FakeCloud>,
    }

    struct FakeCloud {
        instance: Option<ObservedInstance>,
        group: Option<ObservedSecurityGroup>,
        next_id: u32,
        public_ip: String,
        fail_run: bool,
    }

    impl FakeProvider {
        fn new(public_ip: &str) -> Self {
            Self {
                cloud: Mutex::new(FakeCloud {
                    instance: None,
                    group: None,
                    next_id: 1,
                    public_ip: public_ip.to_string(),
                    fail_run: false,
                }),
            }
        }

        fn set_fail_run(&self, fail: bool) {
            self.cloud.lock().expect("lock").fail_run = fail;
        }
    }

    #[async_trait]
    impl ComputeProvider for FakeProvider {
        async fn observe(&self, _project: &str, _environment: &str) -> Result<EnvironmentView> {
            let cloud = self.cloud.lock().expect("lock");
            Ok(EnvironmentView {
                instance: cloud.instance.clone(),
                security_group: cloud.group.clone(),
            })
        }

        async fn create_security_group(&self, spec: &SecurityGroupSpec) -> Result<String> {
            let mut cloud = self.cloud.lock().expect("lock");
            let group_id = format!("sg-fake{:08}", cloud.next_id);
            cloud.next_id += 1;

            let mut ingress: Vec<String> =
                spec.ingress.iter().map(IngressRule::spec_string).collect();
            ingress.sort_unstable();

            cloud.group = Some(ObservedSecurityGroup {
                group_id: group_id.clone(),
                name: spec.name.clone(),
                ingress,
                tags: spec.tags.clone(),
            });

            Ok(group_id)
        }

        async fn update_ingress(
            &self,
            _group_id: &str,
            revoke: &[IngressRule],
            authorize: &[IngressRule],
        ) -> Result<()> {
            let mut cloud = self.cloud.lock().expect("lock");
            if let Some(group) = cloud.group.as_mut() {
                group.ingress.retain(|spec| {
                    !revoke.iter().any(|r| r.spec_string() == *spec)
                });
                group
                    .ingress
                    .extend(authorize.iter().map(IngressRule::spec_string));
                group.ingress.sort_unstable();
            }
            Ok(())
        }

        async fn delete_security_group(&self, _group_id: &str) -> Result<()> {
            self.cloud.lock().expect("lock").group = None;
            Ok(())
        }

        async fn run_instance(&self, spec: &InstanceSpec) -> Result<ObservedInstance> {
            let mut cloud = self.cloud.lock().expect("lock");

            if cloud.fail_run {
                return Err(GangwayError::Provider(ProviderError::rejected(
                    spec.name.clone(),
                    "InvalidAMIID.NotAvailable: fake rejection",
                )));
            }

            let instance_id = format!("i-fake{:012}", cloud.next_id);
            cloud.next_id += 1;

            let instance = ObservedInstance {
                instance_id,
                name: Some(spec.name.clone()),
                project: None,
                environment: None,
                spec_hash: spec.tags.get(TAG_SPEC_HASH).cloned(),
                status: InstanceRunState::Running,
                ami: spec.ami.clone(),
                instance_type: spec.instance_type.clone(),
                key_name: Some(spec.key_name.clone()),
                public_ip: Some(cloud.public_ip.clone()),
                private_ip: Some(String::from("10.0.1.17")),
                security_group_ids: spec.security_group_id.iter().cloned().collect(),
                tags: spec.tags.clone(),
            };

            cloud.instance = Some(instance.clone());
            Ok(instance)
        }

        async fn terminate_instance(&self, _instance_id: &str) -> Result<()> {
            self.cloud.lock().expect("lock").instance = None;
            Ok(())
        }

        async fn wait_until_running(
            &self,
            instance_id: &str,
            _timeout_secs: u64,
        ) -> Result<ObservedInstance> {
            let cloud = self.cloud.lock().expect("lock");
            cloud
                .instance
                .clone()
                .filter(|i| i.instance_id == instance_id)
                .ok_or_else(|| {
                    GangwayError::Provider(ProviderError::NotFound {
                        resource: instance_id.to_string(),
                    })
                })
        }

        fn provider_name(&self) -> &'static str {
            "fake"
        }
    }

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
            outputs: vec![String::from(OUTPUT_PUBLIC_IP)],
            readiness: ReadinessConfig::default(),
            deploy: None,
        }
    }

    fn test_store() -> (LocalStateStore, TempDir) {
        let temp = TempDir::new().expect("temp dir");
        (LocalStateStore::with_base_dir(temp.path()), temp)
    }

    #[tokio::test]
    async fn test_first_apply_creates_everything() {
        let config = test_config();
        let (store, _temp) = test_store();
        let provider = FakeProvider::new("54.210.1.2");

        let reconciler = Reconciler::new(&config, &store, &provider);
        let report = reconciler.apply().await.expect("apply should run");

        assert!(report.success);
        assert_eq!(report.created, 2); // group + instance
        assert!(report.state.instance.is_some());
        assert!(report.state.security_group.is_some());
        assert_eq!(report.state.serial, 1);
    }

    #[tokio::test]
    async fn test_second_apply_yields_empty_plan() {
        let config = test_config();
        let (store, _temp) = test_store();
        let provider = FakeProvider::new("54.210.1.2");

        let reconciler = Reconciler::new(&config, &store, &provider);
        reconciler.apply().await.expect("first apply");

        let (diff, plan) = reconciler.plan().await.expect("plan should run");
        assert!(!diff.has_changes());
        assert!(plan.is_empty());

        let report = reconciler.apply().await.expect("second apply");
        assert!(report.success);
        assert_eq!(report.created, 0);
        assert_eq!(report.unchanged, 2);
    }

    #[tokio::test]
    async fn test_output_set_is_stable_across_applies() {
        let config = test_config();
        let (store, _temp) = test_store();
        let provider = FakeProvider::new("54.210.1.2");
        let publisher = OutputPublisher::new();

        let reconciler = Reconciler::new(&config, &store, &provider);
        let first = reconciler.apply().await.expect("first apply");
        let first_outputs = publisher
            .publish(&config.outputs, &first.state)
            .expect("outputs");

        let second = reconciler.apply().await.expect("second apply");
        let second_outputs = publisher
            .publish(&config.outputs, &second.state)
            .expect("outputs");

        assert_eq!(first_outputs, second_outputs);
        assert_eq!(first_outputs.get(OUTPUT_PUBLIC_IP), Some("54.210.1.2"));
    }

    #[tokio::test]
    async fn test_concurrent_apply_observes_conflict() {
        let config = test_config();
        let (store, _temp) = test_store();
        let provider = FakeProvider::new("54.210.1.2");

        // Another writer holds the lock
        let foreign_lock = store
            .acquire_lock("other-host-999", "apply")
            .await
            .expect("foreign lock");

        let reconciler = Reconciler::new(&config, &store, &provider)
            .with_lock_attempts(2)
            .with_lock_backoff_ms(10);

        let result = reconciler.apply().await;
        assert!(result.is_err_and(|e| e.is_state_conflict()));

        // The holder proceeds unimpeded
        store
            .release_lock(&foreign_lock.lock_id)
            .await
            .expect("release");
        let report = reconciler.apply().await.expect("apply after release");
        assert!(report.success);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_applied_subset() {
        let config = test_config();
        let (store, _temp) = test_store();
        let provider = FakeProvider::new("54.210.1.2");
        provider.set_fail_run(true);

        let reconciler = Reconciler::new(&config, &store, &provider);
        let report = reconciler.apply().await.expect("apply should run");

        // The group landed and stays recorded; the launch failed
        assert!(!report.success);
        assert!(report.state.security_group.is_some());
        assert!(report.state.instance.is_none());
        assert!(!report.errors.is_empty());

        // Re-invoking apply converges without recreating the group
        provider.set_fail_run(false);
        let report = reconciler.apply().await.expect("second apply");
        assert!(report.success);
        assert!(report.state.instance.is_some());

        let group_count = {
            let cloud = provider.cloud.lock().expect("lock");
            usize::from(cloud.group.is_some())
        };
        assert_eq!(group_count, 1);
    }

    #[tokio::test]
    async fn test_recreate_on_ami_change() {
        let mut config = test_config();
        let (store, _temp) = test_store();
        let provider = FakeProvider::new("54.210.1.2");

        let reconciler = Reconciler::new(&config, &store, &provider);
        let first = reconciler.apply().await.expect("first apply");
        let first_id = first
            .state
            .instance
            .as_ref()
            .expect("instance")
            .instance_id
            .clone();

        config.instance.ami = String::from("ami-0e86e2d8cd5d2ab12");
        let reconciler = Reconciler::new(&config, &store, &provider);
        let second = reconciler.apply().await.expect("second apply");

        assert!(second.success);
        assert_eq!(second.recreated, 1);
        let second_id = &second.state.instance.as_ref().expect("instance").instance_id;
        assert_ne!(&first_id, second_id);
    }

    #[tokio::test]
    async fn test_destroy_removes_everything_and_state() {
        let config = test_config();
        let (store, _temp) = test_store();
        let provider = FakeProvider::new("54.210.1.2");

        let reconciler = Reconciler::new(&config, &store, &provider);
        reconciler.apply().await.expect("apply");

        let report = reconciler.destroy().await.expect("destroy");
        assert!(report.success);
        assert!(!store.exists().await.expect("exists"));

        let view = provider.observe("demo-api", "prod").await.expect("observe");
        assert!(view.is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_apply_ready_handoff() {
        // Instance "comes up" on loopback so the readiness gate has a
        // real endpoint to accept its connection
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let mut config = test_config();
        config.readiness.port = port;
        config.deploy = Some(DeployTargetConfig {
            user: String::from("ubuntu"),
            image: String::from("ghcr.io/acme/demo-api:latest"),
            container_name: String::from("demo-api"),
            ports: vec![],
            env: HashMap::new(),
            registry: None,
        });

        let (store, _temp) = test_store();
        let provider = FakeProvider::new("127.0.0.1");

        // Apply
        let reconciler = Reconciler::new(&config, &store, &provider);
        let report = reconciler.apply().await.expect("apply");
        assert!(report.success);

        // Publish
        let outputs = OutputPublisher::new()
            .publish(&config.outputs, &report.state)
            .expect("outputs");
        let ip = outputs.get(OUTPUT_PUBLIC_IP).expect("public ip");
        assert!(ip.parse::<std::net::Ipv4Addr>().is_ok());

        // Readiness
        let gate = ReadinessGate::from_config(&config.readiness);
        gate.wait_for_tcp(ip).await.expect("gate should pass");

        // Handoff receives exactly the published address
        let mut executor = MockRemoteExecutor::new();
        executor
            .expect_execute()
            .withf(|host, _, _| host == "127.0.0.1")
            .times(1)
            .returning(|_, _, _| {
                Ok(CommandOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            });
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(1).returning(|_, _| Ok(()));

        let handoff = HandoffNotifier::new(executor, notifier);
        let deploy = config.deploy.as_ref().expect("deploy target");
        let handoff_report = handoff
            .handoff(&outputs, deploy, None)
            .await
            .expect("handoff");

        assert_eq!(handoff_report.host, "127.0.0.1");
        drop(listener);
    }
}
