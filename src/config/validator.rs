//! Declaration validation.
//!
//! Checks the parsed declaration for problems the provider would only
//! reject at apply time: malformed identifiers, unknown instance
//! classes, invalid CIDR blocks, undeclarable outputs.

use crate::error::{ConfigError, GangwayError, Result};
use std::collections::HashSet;
use tracing::debug;

use crate::outputs::KNOWN_OUTPUTS;

use super::spec::{DeployConfig, InstanceConfig, StateBackend};

/// Validator for deployment declarations.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Known valid instance types.
    known_instance_types: HashSet<String>,
}

/// Instance classes accepted without a warning.
///
/// Not exhaustive; unknown classes produce a warning rather than an
/// error since AWS adds families faster than this list is updated.
const KNOWN_INSTANCE_TYPES: &[&str] = &[
    "t2.nano",
    "t2.micro",
    "t2.small",
    "t2.medium",
    "t2.large",
    "t3.nano",
    "t3.micro",
    "t3.small",
    "t3.medium",
    "t3.large",
    "t3.xlarge",
    "m5.large",
    "m5.xlarge",
    "m5.2xlarge",
    "c5.large",
    "c5.xlarge",
    "r5.large",
    "r5.xlarge",
];

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ValidationResult {
    /// Returns true if no errors were found.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl ConfigValidator {
    /// Creates a new validator with default known instance types.
    #[must_use]
    pub fn new() -> Self {
        Self {
            known_instance_types: KNOWN_INSTANCE_TYPES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Adds a custom instance type to the known list.
    pub fn add_instance_type(&mut self, instance_type: impl Into<String>) {
        self.known_instance_types.insert(instance_type.into());
    }

    /// Validates a deployment declaration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        self.validate_instance(&config.instance, &mut result);
        Self::validate_outputs(&config.outputs, &mut result);
        Self::validate_readiness(config, &mut result);
        Self::validate_deploy(config, &mut result);

        if result.errors.is_empty() {
            debug!("Declaration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(GangwayError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Validates project configuration.
    fn validate_project(project: &super::spec::ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }

        if project.region.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.region"),
                message: String::from("Region cannot be empty"),
            });
        }
    }

    /// Validates state backend configuration.
    fn validate_state(state: &super::spec::StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from(
                            "S3 bucket name is required when using the s3 backend",
                        ),
                    });
                }
            }
            StateBackend::Local => {
                // Always valid; state lands in .gangway/ by default
            }
        }
    }

    /// Validates the instance declaration.
    fn validate_instance(&self, instance: &InstanceConfig, result: &mut ValidationResult) {
        if !is_valid_name(&instance.name) {
            result.errors.push(ValidationError {
                field: String::from("instance.name"),
                message: format!(
                    "Instance name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    instance.name
                ),
            });
        }

        if !is_valid_ami(&instance.ami) {
            result.errors.push(ValidationError {
                field: String::from("instance.ami"),
                message: format!(
                    "AMI '{}' is invalid. Expected format: ami-<hex id>",
                    instance.ami
                ),
            });
        }

        if instance.key_name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("instance.key_name"),
                message: String::from("Key-pair name cannot be empty"),
            });
        }

        if !self.known_instance_types.contains(&instance.instance_type) {
            result.warnings.push(format!(
                "Instance type '{}' is not in the known list; the provider will decide whether it exists",
                instance.instance_type
            ));
        }

        if instance.root_volume_gb == Some(0) {
            result.errors.push(ValidationError {
                field: String::from("instance.root_volume_gb"),
                message: String::from("Root volume size must be greater than zero"),
            });
        }

        Self::validate_ingress(instance, result);
    }

    /// Validates ingress rules.
    fn validate_ingress(instance: &InstanceConfig, result: &mut ValidationResult) {
        if instance.ingress.is_empty() {
            result.warnings.push(String::from(
                "No ingress rules declared; the readiness gate and handoff will not be able to reach the host",
            ));
        }

        let mut seen = HashSet::new();
        for (i, rule) in instance.ingress.iter().enumerate() {
            let prefix = format!("instance.ingress[{i}]");

            if !seen.insert(rule.spec_string()) {
                result.errors.push(ValidationError {
                    field: prefix.clone(),
                    message: format!("Duplicate ingress rule: {}", rule.spec_string()),
                });
            }

            if !is_valid_cidr(&rule.cidr) {
                result.errors.push(ValidationError {
                    field: prefix,
                    message: format!("Invalid CIDR block: {}", rule.cidr),
                });
            }
        }
    }

    /// Validates declared outputs.
    fn validate_outputs(outputs: &[String], result: &mut ValidationResult) {
        if outputs.is_empty() {
            result.warnings.push(String::from(
                "No outputs declared; downstream automation will have nothing to bind to",
            ));
        }

        let mut seen = HashSet::new();
        for name in outputs {
            if !seen.insert(name.as_str()) {
                result.errors.push(ValidationError {
                    field: String::from("outputs"),
                    message: format!("Duplicate output name: {name}"),
                });
            }

            if !KNOWN_OUTPUTS.contains(&name.as_str()) {
                result.errors.push(ValidationError {
                    field: String::from("outputs"),
                    message: format!(
                        "Unknown output '{name}'. Known outputs: {}",
                        KNOWN_OUTPUTS.join(", ")
                    ),
                });
            }
        }
    }

    /// Validates readiness configuration against the declaration.
    fn validate_readiness(config: &DeployConfig, result: &mut ValidationResult) {
        if config.readiness.timeout_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("readiness.timeout_secs"),
                message: String::from("Readiness timeout must be greater than zero"),
            });
        }

        if config.readiness.interval_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("readiness.interval_secs"),
                message: String::from("Readiness interval must be greater than zero"),
            });
        }

        let gate_port = config.readiness.port;
        let port_open = config.instance.ingress.iter().any(|r| r.port == gate_port);
        if !port_open {
            result.warnings.push(format!(
                "Readiness gate probes port {gate_port} but no ingress rule opens it"
            ));
        }
    }

    /// Validates the deployment target.
    fn validate_deploy(config: &DeployConfig, result: &mut ValidationResult) {
        let Some(deploy) = &config.deploy else {
            return;
        };

        if deploy.image.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("deploy.image"),
                message: String::from("Deployment image cannot be empty"),
            });
        }

        if !is_valid_name(&deploy.container_name) {
            result.errors.push(ValidationError {
                field: String::from("deploy.container_name"),
                message: format!(
                    "Container name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    deploy.container_name
                ),
            });
        }

        for (i, publication) in deploy.ports.iter().enumerate() {
            if !is_valid_port_publication(publication) {
                result.errors.push(ValidationError {
                    field: format!("deploy.ports[{i}]"),
                    message: format!(
                        "Invalid port publication '{publication}'. Expected format: HOST:CONTAINER"
                    ),
                });
            }
        }

        if !config
            .outputs
            .iter()
            .any(|o| o == crate::outputs::OUTPUT_PUBLIC_IP)
        {
            result.errors.push(ValidationError {
                field: String::from("outputs"),
                message: String::from(
                    "A deploy target requires the ec2_public_ip output to be declared",
                ),
            });
        }
    }
}

/// Checks if a name is lowercase alphanumeric with hyphens.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Checks the `ami-<hex>` identifier format.
fn is_valid_ami(ami: &str) -> bool {
    ami.strip_prefix("ami-").is_some_and(|id| {
        (id.len() == 8 || id.len() == 17) && id.chars().all(|c| c.is_ascii_hexdigit())
    })
}

/// Checks a dotted-quad CIDR block like "10.0.0.0/8".
fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };

    let prefix_ok = prefix.parse::<u8>().is_ok_and(|p| p <= 32);
    let addr_ok = addr.parse::<std::net::Ipv4Addr>().is_ok();

    prefix_ok && addr_ok
}

/// Checks a "HOST:CONTAINER" port publication.
fn is_valid_port_publication(publication: &str) -> bool {
    let Some((host, container)) = publication.split_once(':') else {
        return false;
    };

    host.parse::<u16>().is_ok() && container.parse::<u16>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{
        DeployTargetConfig, IngressProtocol, IngressRule, ProjectConfig, ReadinessConfig,
        StateConfig,
    };
    use std::collections::HashMap;

    fn valid_config() -> DeployConfig {
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
                root_volume_gb: Some(8),
                tags: HashMap::new(),
            },
            outputs: vec![String::from("ec2_public_ip")],
            readiness: ReadinessConfig::default(),
            deploy: None,
        }
    }

    #[test]
    fn test_valid_declaration() {
        let validator = ConfigValidator::new();
        let result = validator.validate(&valid_config()).expect("should be valid");
        assert!(result.is_valid());
    }

    #[test]
    fn test_invalid_ami() {
        let mut config = valid_config();
        config.instance.ami = String::from("ami-xyz");

        let validator = ConfigValidator::new();
        assert!(validator.validate(&config).is_err());
    }

    #[test]
    fn test_unknown_instance_type_warns() {
        let mut config = valid_config();
        config.instance.instance_type = String::from("x99.hypothetical");

        let validator = ConfigValidator::new();
        let result = validator.validate(&config).expect("warning, not error");
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn test_invalid_cidr() {
        let mut config = valid_config();
        config.instance.ingress = vec![IngressRule {
            port: 22,
            protocol: IngressProtocol::Tcp,
            cidr: String::from("999.0.0.0/0"),
        }];

        let validator = ConfigValidator::new();
        assert!(validator.validate(&config).is_err());
    }

    #[test]
    fn test_unknown_output_rejected() {
        let mut config = valid_config();
        config.outputs.push(String::from("elastic_ip"));

        let validator = ConfigValidator::new();
        assert!(validator.validate(&config).is_err());
    }

    #[test]
    fn test_deploy_requires_public_ip_output() {
        let mut config = valid_config();
        config.outputs = vec![String::from("ec2_instance_id")];
        config.deploy = Some(DeployTargetConfig {
            user: String::from("ubuntu"),
            image: String::from("ghcr.io/acme/demo:latest"),
            container_name: String::from("demo"),
            ports: vec![],
            env: HashMap::new(),
            registry: None,
        });

        let validator = ConfigValidator::new();
        assert!(validator.validate(&config).is_err());
    }

    #[test]
    fn test_readiness_port_not_open_warns() {
        let mut config = valid_config();
        config.readiness.port = 8022;

        let validator = ConfigValidator::new();
        let result = validator.validate(&config).expect("warning, not error");
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("8022")));
    }
}
