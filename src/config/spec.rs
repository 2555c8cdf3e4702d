//! Declaration types for the provisioning system.
//!
//! This module defines the structs that map to the `gangway.deploy.yaml`
//! file. Together they form the desired-state declaration: one compute
//! instance, its network access rules, the outputs to publish, and the
//! downstream deployment target.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The root declaration structure for a Gangway environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    pub state: StateConfig,
    /// The compute instance declaration.
    pub instance: InstanceConfig,
    /// Output names to publish after a successful apply.
    #[serde(default = "default_outputs")]
    pub outputs: Vec<String>,
    /// Readiness gate configuration.
    #[serde(default)]
    pub readiness: ReadinessConfig,
    /// Optional deployment handoff target.
    #[serde(default)]
    pub deploy: Option<DeployTargetConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// AWS region the instance lives in.
    #[serde(default = "default_region")]
    pub region: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix, usually `<project>/<environment>`.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (defaults to the project region).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for the local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Declaration of the single compute instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Logical name of the instance within the project.
    #[serde(default = "default_instance_name")]
    pub name: String,
    /// Machine image identifier (AMI).
    pub ami: String,
    /// Instance class.
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    /// Key-pair reference for SSH access.
    pub key_name: String,
    /// Ingress rules for the associated security group.
    #[serde(default = "default_ingress")]
    pub ingress: Vec<IngressRule>,
    /// Root volume size in GB (provider default when absent).
    #[serde(default)]
    pub root_volume_gb: Option<u32>,
    /// Instance-specific tags (merged with system tags).
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// A single security-group ingress rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct IngressRule {
    /// Port number.
    pub port: u16,
    /// Protocol.
    pub protocol: IngressProtocol,
    /// Source CIDR block.
    pub cidr: String,
}

/// Ingress protocol types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngressProtocol {
    /// TCP protocol.
    #[default]
    Tcp,
    /// UDP protocol.
    Udp,
}

/// Readiness gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// TCP port to probe on the provisioned host.
    #[serde(default = "default_readiness_port")]
    pub port: u16,
    /// Overall deadline in seconds.
    #[serde(default = "default_readiness_timeout")]
    pub timeout_secs: u64,
    /// Interval between probes in seconds.
    #[serde(default = "default_readiness_interval")]
    pub interval_secs: u64,
    /// Optional HTTP application probe, checked after handoff.
    #[serde(default)]
    pub http: Option<HttpProbeConfig>,
}

/// HTTP application probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpProbeConfig {
    /// Path to request (e.g., "/health").
    pub path: String,
    /// Port the application listens on.
    pub port: u16,
    /// Timeout for each request in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

/// Deployment handoff target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployTargetConfig {
    /// Remote user to execute as.
    #[serde(default = "default_deploy_user")]
    pub user: String,
    /// Container image to deploy.
    pub image: String,
    /// Name for the running container.
    pub container_name: String,
    /// Host:container port publications (e.g., "80:8080").
    #[serde(default)]
    pub ports: Vec<String>,
    /// Environment variables passed to the container.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Optional registry to log in to before pulling.
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
}

/// Container registry configuration.
///
/// Credentials themselves are never stored in the declaration; only the
/// names of the environment variables that carry them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Registry server (e.g., "ghcr.io").
    pub server: String,
    /// Environment variable holding the username.
    pub username_env: String,
    /// Environment variable holding the password or token.
    pub password_env: String,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

fn default_region() -> String {
    String::from("us-east-1")
}

fn default_instance_name() -> String {
    String::from("app")
}

fn default_instance_type() -> String {
    String::from("t2.micro")
}

fn default_ingress() -> Vec<IngressRule> {
    vec![IngressRule::new(22, IngressProtocol::Tcp)]
}

fn default_outputs() -> Vec<String> {
    vec![String::from(crate::outputs::OUTPUT_PUBLIC_IP)]
}

const fn default_readiness_port() -> u16 {
    22
}

const fn default_readiness_timeout() -> u64 {
    30
}

const fn default_readiness_interval() -> u64 {
    2
}

const fn default_http_timeout() -> u64 {
    5
}

fn default_deploy_user() -> String {
    String::from("ubuntu")
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            port: default_readiness_port(),
            timeout_secs: default_readiness_timeout(),
            interval_secs: default_readiness_interval(),
            http: None,
        }
    }
}

// Ingress rule string conversion

impl TryFrom<String> for IngressRule {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<IngressRule> for String {
    fn from(rule: IngressRule) -> Self {
        rule.spec_string()
    }
}

impl IngressRule {
    /// Creates a new rule open to the world.
    #[must_use]
    pub fn new(port: u16, protocol: IngressProtocol) -> Self {
        Self {
            port,
            protocol,
            cidr: String::from("0.0.0.0/0"),
        }
    }

    /// Parses a rule from "PORT/PROTOCOL" or "PORT/PROTOCOL@CIDR".
    ///
    /// # Errors
    ///
    /// Returns an error if the rule format is invalid.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (spec, cidr) = s
            .split_once('@')
            .map_or((s, "0.0.0.0/0"), |(spec, cidr)| (spec, cidr));

        let Some((port_str, proto_str)) = spec.split_once('/') else {
            return Err(format!(
                "Invalid ingress rule: {s}. Expected format: PORT/PROTOCOL[@CIDR]"
            ));
        };

        let port = port_str
            .parse::<u16>()
            .map_err(|_| format!("Invalid port number: {port_str}"))?;

        let protocol = match proto_str.to_lowercase().as_str() {
            "tcp" => IngressProtocol::Tcp,
            "udp" => IngressProtocol::Udp,
            other => return Err(format!("Invalid protocol: {other}. Expected: tcp or udp")),
        };

        Ok(Self {
            port,
            protocol,
            cidr: cidr.to_string(),
        })
    }

    /// Returns the canonical "PORT/PROTOCOL@CIDR" form of this rule.
    ///
    /// Used for hashing and drift comparison; two rules are equivalent
    /// exactly when their spec strings are equal.
    #[must_use]
    pub fn spec_string(&self) -> String {
        format!("{}/{}@{}", self.port, self.protocol, self.cidr)
    }
}

impl std::fmt::Display for IngressProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

impl DeployConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the security group name for this environment.
    #[must_use]
    pub fn security_group_name(&self) -> String {
        format!("{}-sg", self.qualified_name())
    }
}

impl InstanceConfig {
    /// Returns the full instance name including project context.
    #[must_use]
    pub fn full_name(&self, project: &ProjectConfig) -> String {
        format!("{}-{}-{}", project.name, project.environment, self.name)
    }

    /// Returns the canonical spec strings of all ingress rules, sorted.
    #[must_use]
    pub fn ingress_specs(&self) -> Vec<String> {
        let mut specs: Vec<String> = self.ingress.iter().map(IngressRule::spec_string).collect();
        specs.sort_unstable();
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingress_rule_parse() {
        let rule = IngressRule::parse("22/tcp").expect("rule should parse");
        assert_eq!(rule.port, 22);
        assert_eq!(rule.protocol, IngressProtocol::Tcp);
        assert_eq!(rule.cidr, "0.0.0.0/0");
    }

    #[test]
    fn test_ingress_rule_parse_with_cidr() {
        let rule = IngressRule::parse("8080/tcp@10.0.0.0/8").expect("rule should parse");
        assert_eq!(rule.port, 8080);
        assert_eq!(rule.cidr, "10.0.0.0/8");
        assert_eq!(rule.spec_string(), "8080/tcp@10.0.0.0/8");
    }

    #[test]
    fn test_ingress_rule_invalid() {
        assert!(IngressRule::parse("not-a-rule").is_err());
        assert!(IngressRule::parse("99999/tcp").is_err());
        assert!(IngressRule::parse("22/icmp").is_err());
    }

    #[test]
    fn test_ingress_specs_sorted() {
        let instance = InstanceConfig {
            name: String::from("app"),
            ami: String::from("ami-0953476d60561c955"),
            instance_type: String::from("t2.micro"),
            key_name: String::from("testkey"),
            ingress: vec![
                IngressRule::new(8080, IngressProtocol::Tcp),
                IngressRule::new(22, IngressProtocol::Tcp),
            ],
            root_volume_gb: None,
            tags: HashMap::new(),
        };

        let specs = instance.ingress_specs();
        assert_eq!(specs, vec!["22/tcp@0.0.0.0/0", "8080/tcp@0.0.0.0/0"]);
    }
}
