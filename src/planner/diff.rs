//! Diff engine for comparing declaration against reality.
//!
//! Computes the difference between the declared resources and what is
//! observed at the provider, informed by the recorded applied state.
//! Planning is a pure read; nothing here touches the provider.

use tracing::debug;

use crate::aws::EnvironmentView;
use crate::config::{ConfigHasher, DeployConfig};
use crate::state::AppliedState;

/// Engine for computing declaration/observation diffs.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Declaration hasher.
    hasher: ConfigHasher,
}

/// Which resource a diff refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// The security group.
    SecurityGroup,
    /// The compute instance.
    Instance,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource is reconciled in place.
    Update,
    /// Resource must be replaced (immutable attribute changed).
    Recreate,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Which resource this is about.
    pub kind: ResourceKind,
    /// Resource name.
    pub name: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Details about the difference.
    pub details: Vec<DiffDetail>,
    /// Previous hash (if applicable).
    pub old_hash: Option<String>,
    /// New hash (if applicable).
    pub new_hash: Option<String>,
}

/// Detail about a specific difference.
#[derive(Debug, Clone)]
pub struct DiffDetail {
    /// Field that differs.
    pub field: String,
    /// Old value.
    pub old_value: Option<String>,
    /// New value.
    pub new_value: Option<String>,
}

/// Complete diff result.
#[derive(Debug)]
pub struct DiffResult {
    /// All resource diffs.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources updated in place.
    pub updates: usize,
    /// Number of resources to replace.
    pub recreates: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between the declaration and the observation.
    #[must_use]
    pub fn compute_diff(
        &self,
        config: &DeployConfig,
        state: Option<&AppliedState>,
        observed: &EnvironmentView,
    ) -> DiffResult {
        let mut diffs = Vec::new();

        diffs.push(Self::compute_security_group_diff(config, observed));
        diffs.push(self.compute_instance_diff(config, state, observed));

        let creates = diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Create)
            .count();
        let updates = diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Update)
            .count();
        let recreates = diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Recreate)
            .count();
        let unchanged = diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::NoChange)
            .count();

        DiffResult {
            diffs,
            creates,
            updates,
            recreates,
            unchanged,
        }
    }

    /// Computes the diff for the security group.
    fn compute_security_group_diff(
        config: &DeployConfig,
        observed: &EnvironmentView,
    ) -> ResourceDiff {
        let name = config.security_group_name();
        let desired = config.instance.ingress_specs();

        let Some(group) = &observed.security_group else {
            debug!("Security group {name} needs to be created");
            return ResourceDiff {
                kind: ResourceKind::SecurityGroup,
                name,
                diff_type: DiffType::Create,
                details: desired
                    .iter()
                    .map(|spec| DiffDetail {
                        field: String::from("ingress"),
                        old_value: None,
                        new_value: Some(spec.clone()),
                    })
                    .collect(),
                old_hash: None,
                new_hash: None,
            };
        };

        if group.ingress == desired {
            debug!("Security group {name} is up to date");
            return ResourceDiff {
                kind: ResourceKind::SecurityGroup,
                name,
                diff_type: DiffType::NoChange,
                details: vec![],
                old_hash: None,
                new_hash: None,
            };
        }

        let mut details = Vec::new();
        for spec in &desired {
            if !group.ingress.contains(spec) {
                details.push(DiffDetail {
                    field: String::from("ingress"),
                    old_value: None,
                    new_value: Some(spec.clone()),
                });
            }
        }
        for spec in &group.ingress {
            if !desired.contains(spec) {
                details.push(DiffDetail {
                    field: String::from("ingress"),
                    old_value: Some(spec.clone()),
                    new_value: None,
                });
            }
        }

        debug!(
            "Security group {name} has {} ingress rule changes",
            details.len()
        );

        ResourceDiff {
            kind: ResourceKind::SecurityGroup,
            name,
            diff_type: DiffType::Update,
            details,
            old_hash: None,
            new_hash: None,
        }
    }

    /// Computes the diff for the compute instance.
    fn compute_instance_diff(
        &self,
        config: &DeployConfig,
        state: Option<&AppliedState>,
        observed: &EnvironmentView,
    ) -> ResourceDiff {
        let name = config.instance.full_name(&config.project);
        let new_hash = self.hasher.hash_instance(&config.instance);
        let state_instance = state.and_then(|s| s.instance.as_ref());

        match (&observed.instance, state_instance) {
            // Nothing exists - create
            (None, None) => {
                debug!("Instance {name} needs to be created");
                ResourceDiff {
                    kind: ResourceKind::Instance,
                    name: name.clone(),
                    diff_type: DiffType::Create,
                    details: vec![DiffDetail {
                        field: String::from("instance"),
                        old_value: None,
                        new_value: Some(name),
                    }],
                    old_hash: None,
                    new_hash: Some(new_hash),
                }
            }

            // Instance exists at the provider
            (Some(obs), _) => {
                let old_hash = obs.spec_hash.as_deref();

                if old_hash == Some(new_hash.as_str()) {
                    debug!("Instance {name} is up to date");
                    ResourceDiff {
                        kind: ResourceKind::Instance,
                        name,
                        diff_type: DiffType::NoChange,
                        details: vec![],
                        old_hash: old_hash.map(String::from),
                        new_hash: Some(new_hash),
                    }
                } else {
                    // Launch parameters are immutable: any declaration
                    // change means replace
                    let details = Self::attribute_details(config, obs);
                    debug!("Instance {name} needs to be replaced");
                    ResourceDiff {
                        kind: ResourceKind::Instance,
                        name,
                        diff_type: DiffType::Recreate,
                        details,
                        old_hash: old_hash.map(String::from),
                        new_hash: Some(new_hash),
                    }
                }
            }

            // Recorded in state but gone at the provider - recreate
            (None, Some(st)) => {
                debug!("Instance {name} in state but not observed, recreating");
                ResourceDiff {
                    kind: ResourceKind::Instance,
                    name: name.clone(),
                    diff_type: DiffType::Create,
                    details: vec![DiffDetail {
                        field: String::from("instance"),
                        old_value: Some(format!("missing (was {})", st.instance_id)),
                        new_value: Some(name),
                    }],
                    old_hash: Some(st.config_hash.clone()),
                    new_hash: Some(new_hash),
                }
            }
        }
    }

    /// Collects attribute-level differences for display.
    fn attribute_details(
        config: &DeployConfig,
        observed: &crate::aws::ObservedInstance,
    ) -> Vec<DiffDetail> {
        let mut details = Vec::new();

        if config.instance.ami != observed.ami {
            details.push(DiffDetail {
                field: String::from("ami"),
                old_value: Some(observed.ami.clone()),
                new_value: Some(config.instance.ami.clone()),
            });
        }

        if config.instance.instance_type != observed.instance_type {
            details.push(DiffDetail {
                field: String::from("instance_type"),
                old_value: Some(observed.instance_type.clone()),
                new_value: Some(config.instance.instance_type.clone()),
            });
        }

        if observed.key_name.as_deref() != Some(config.instance.key_name.as_str()) {
            details.push(DiffDetail {
                field: String::from("key_name"),
                old_value: observed.key_name.clone(),
                new_value: Some(config.instance.key_name.clone()),
            });
        }

        details
    }
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.recreates > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.recreates
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }

    /// Returns the instance diff.
    #[must_use]
    pub fn instance_diff(&self) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.kind == ResourceKind::Instance)
    }

    /// Returns the security group diff.
    #[must_use]
    pub fn security_group_diff(&self) -> Option<&ResourceDiff> {
        self.diffs
            .iter()
            .find(|d| d.kind == ResourceKind::SecurityGroup)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Recreate => "recreate",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SecurityGroup => write!(f, "security group"),
            Self::Instance => write!(f, "instance"),
        }
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.name, self.diff_type)?;
        if !self.details.is_empty() {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.field)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{ObservedInstance, ObservedSecurityGroup};
    use crate::config::{
        IngressProtocol, IngressRule, InstanceConfig, ProjectConfig, ReadinessConfig,
        StateBackend, StateConfig,
    };
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

    fn observed_matching(config: &DeployConfig) -> EnvironmentView {
        let hasher = crate::config::ConfigHasher::new();
        let hash = hasher.hash_instance(&config.instance);

        EnvironmentView {
            instance: Some(ObservedInstance {
                instance_id: String::from("i-0abc1234567890def"),
                name: Some(String::from("web")),
                project: Some(String::from("demo-api")),
                environment: Some(String::from("prod")),
                spec_hash: Some(hash),
                status: InstanceRunState::Running,
                ami: config.instance.ami.clone(),
                instance_type: config.instance.instance_type.clone(),
                key_name: Some(config.instance.key_name.clone()),
                public_ip: Some(String::from("54.210.1.2")),
                private_ip: Some(String::from("10.0.1.17")),
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
    fn test_empty_observation_plans_creates() {
        let config = test_config();
        let engine = DiffEngine::new();

        let diff = engine.compute_diff(&config, None, &EnvironmentView::default());

        assert_eq!(diff.creates, 2);
        assert!(diff.has_changes());
    }

    #[test]
    fn test_matching_observation_is_converged() {
        let config = test_config();
        let engine = DiffEngine::new();
        let observed = observed_matching(&config);

        let diff = engine.compute_diff(&config, None, &observed);

        assert!(!diff.has_changes());
        assert_eq!(diff.unchanged, 2);
    }

    #[test]
    fn test_ami_change_is_a_recreate() {
        let mut config = test_config();
        let engine = DiffEngine::new();
        let observed = observed_matching(&config);

        config.instance.ami = String::from("ami-0e86e2d8cd5d2ab12");
        let diff = engine.compute_diff(&config, None, &observed);

        assert_eq!(diff.recreates, 1);
        let instance_diff = diff.instance_diff().expect("instance diff");
        assert_eq!(instance_diff.diff_type, DiffType::Recreate);
        assert!(instance_diff.details.iter().any(|d| d.field == "ami"));
    }

    #[test]
    fn test_ingress_drift_is_an_update() {
        let mut config = test_config();
        let engine = DiffEngine::new();
        let observed = observed_matching(&config);

        config
            .instance
            .ingress
            .push(IngressRule::new(80, IngressProtocol::Tcp));
        let diff = engine.compute_diff(&config, None, &observed);

        assert_eq!(diff.updates, 1);
        // Ingress is reconciled in place; the instance is untouched
        let instance_diff = diff.instance_diff().expect("instance diff");
        assert_eq!(instance_diff.diff_type, DiffType::NoChange);
    }

    #[test]
    fn test_instance_in_state_but_gone_is_a_create() {
        let config = test_config();
        let engine = DiffEngine::new();

        let mut state =
            crate::state::AppliedState::new("demo-api", "prod");
        state.set_instance(crate::state::InstanceState::new(
            "web",
            "i-0dead000000000000",
            "stale-hash",
        ));

        let mut observed = observed_matching(&config);
        observed.instance = None;

        let diff = engine.compute_diff(&config, Some(&state), &observed);
        let instance_diff = diff.instance_diff().expect("instance diff");

        assert_eq!(instance_diff.diff_type, DiffType::Create);
        assert!(instance_diff.details[0]
            .old_value
            .as_deref()
            .is_some_and(|v| v.contains("i-0dead000000000000")));
    }
}
