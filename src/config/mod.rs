//! Configuration module for the Gangway provisioning system.
//!
//! Handles everything declaration-related:
//! - Parsing and deserializing `gangway.deploy.yaml`
//! - Validation of declaration values
//! - Computing declaration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    DeployConfig, DeployTargetConfig, HttpProbeConfig, IngressProtocol, IngressRule,
    InstanceConfig, ProjectConfig, ReadinessConfig, RegistryConfig, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, find_config_file};
pub use validator::{ConfigValidator, ValidationResult};
pub use hash::ConfigHasher;
