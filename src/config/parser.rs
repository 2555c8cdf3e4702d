//! Declaration parser for loading configuration files.
//!
//! Handles loading the declaration from YAML, layering environment
//! variable overrides on top, with proper precedence and error context.

use crate::error::{ConfigError, GangwayError, Result};
use std::path::Path;
use tracing::{debug, info};

use super::spec::DeployConfig;

/// Parser for loading the deployment declaration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads the declaration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading declaration from: {}", path.display());

        if !path.exists() {
            return Err(GangwayError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            GangwayError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a declaration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML declaration");

        let config: DeployConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            GangwayError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed declaration for project: {}",
            config.project.name
        );
        Ok(config)
    }

    /// Loads the declaration with environment variable overrides.
    ///
    /// Overrides use the format `GANGWAY_<SECTION>_<KEY>`
    /// (e.g., `GANGWAY_PROJECT_ENVIRONMENT`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Applies environment variable overrides to the declaration.
    fn apply_env_overrides(config: &mut DeployConfig) {
        if let Ok(name) = std::env::var("GANGWAY_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("GANGWAY_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(region) = std::env::var("GANGWAY_PROJECT_REGION") {
            debug!("Overriding project.region from environment");
            config.project.region = region;
        }

        if let Ok(bucket) = std::env::var("GANGWAY_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("GANGWAY_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(ami) = std::env::var("GANGWAY_INSTANCE_AMI") {
            debug!("Overriding instance.ami from environment");
            config.instance.ami = ami;
        }

        if let Ok(key_name) = std::env::var("GANGWAY_INSTANCE_KEY_NAME") {
            debug!("Overriding instance.key_name from environment");
            config.instance.key_name = key_name;
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                GangwayError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads a required environment variable.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set.
    pub fn require_env(name: &str) -> Result<String> {
        std::env::var(name).map_err(|_| {
            GangwayError::Config(ConfigError::MissingEnvVar {
                name: name.to_string(),
            })
        })
    }
}

/// Default declaration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "gangway.deploy.yaml",
    "gangway.deploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Finds the declaration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no declaration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found declaration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(GangwayError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_declaration() {
        let yaml = r"
project:
  name: demo-api
state:
  backend: local
instance:
  ami: ami-0953476d60561c955
  key_name: testkey
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("should parse");

        assert_eq!(config.project.name, "demo-api");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.project.region, "us-east-1");
        assert_eq!(config.instance.instance_type, "t2.micro");
        // ssh is reachable by default so readiness and handoff can work
        assert_eq!(config.instance.ingress_specs(), vec!["22/tcp@0.0.0.0/0"]);
        assert_eq!(config.outputs, vec!["ec2_public_ip"]);
    }

    #[test]
    fn test_parse_full_declaration() {
        let yaml = r#"
project:
  name: demo-api
  environment: prod
  region: us-east-1

state:
  backend: s3
  bucket: demo-api-tfstate
  prefix: demo-api/prod

instance:
  name: web
  ami: ami-0953476d60561c955
  instance_type: t2.micro
  key_name: testkey
  ingress:
    - "22/tcp"
    - "80/tcp"
  root_volume_gb: 8
  tags:
    team: platform

outputs:
  - ec2_public_ip
  - ec2_instance_id

readiness:
  port: 22
  timeout_secs: 30
  interval_secs: 2

deploy:
  user: ubuntu
  image: ghcr.io/acme/demo-api:latest
  container_name: demo-api
  ports:
    - "80:8080"
  registry:
    server: ghcr.io
    username_env: REGISTRY_USER
    password_env: REGISTRY_TOKEN
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("should parse");

        assert_eq!(config.qualified_name(), "demo-api-prod");
        assert_eq!(config.instance.ingress.len(), 2);
        assert_eq!(config.outputs.len(), 2);
        assert_eq!(config.readiness.timeout_secs, 30);

        let deploy = config.deploy.expect("deploy target should be present");
        assert_eq!(deploy.container_name, "demo-api");
        assert_eq!(
            deploy.registry.expect("registry should be present").server,
            "ghcr.io"
        );
    }

    #[test]
    fn test_missing_file() {
        let parser = ConfigParser::new();
        let result = parser.load_file("/nonexistent/gangway.deploy.yaml");
        assert!(matches!(
            result,
            Err(GangwayError::Config(ConfigError::FileNotFound { .. }))
        ));
    }
}
