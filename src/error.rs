//! Error types for the Gangway provisioning system.
//!
//! This module provides the error hierarchy for every stage of the
//! provision-to-handoff lifecycle: configuration, state management, the
//! EC2 provider, planning, output publication, readiness and handoff.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Gangway provisioning system.
#[derive(Debug, Error)]
pub enum GangwayError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// EC2 provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Output publication errors.
    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    /// Readiness gate errors.
    #[error("Readiness error: {0}")]
    Readiness(#[from] ReadinessError),

    /// Deployment handoff errors.
    #[error("Handoff error: {0}")]
    Handoff(#[from] HandoffError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Invalid ingress rule specification.
    #[error("Invalid ingress rule: {spec}")]
    InvalidIngressRule {
        /// The invalid rule specification.
        spec: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed for an operational reason.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// The state lock is held by another writer.
    ///
    /// Exactly one writer may mutate the state of an environment at a
    /// time; everyone else observes this conflict.
    #[error("State is locked by another process (holder: {holder}, since: {since})")]
    Conflict {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Backend (S3 or filesystem) error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// EC2 provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider rejected the declaration as invalid.
    ///
    /// Fatal: retrying the same declaration cannot succeed.
    #[error("Provider rejected {resource}: {reason}")]
    Rejected {
        /// Resource the provider rejected.
        resource: String,
        /// Reason reported by the provider.
        reason: String,
    },

    /// An API call failed.
    #[error("EC2 API call '{operation}' failed: {message}")]
    Api {
        /// Operation that was attempted.
        operation: String,
        /// Error message from the API.
        message: String,
    },

    /// The provider throttled the request.
    #[error("EC2 API throttled, retry after {retry_after_secs} seconds")]
    Throttled {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// A resource was not found.
    #[error("Resource not found: {resource}")]
    NotFound {
        /// Identifier of the missing resource.
        resource: String,
    },

    /// Network error talking to the provider.
    #[error("Network error communicating with EC2: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// Timeout waiting for a resource to reach a state.
    #[error("Timeout waiting for {resource} to reach state {expected_state}")]
    Timeout {
        /// Identifier of the resource.
        resource: String,
        /// Expected state that was not reached.
        expected_state: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Conflicting operations in plan.
    #[error("Conflicting operations in plan: {message}")]
    ConflictingOperations {
        /// Description of the conflict.
        message: String,
    },

    /// A planned action is missing a required dependency.
    #[error("Plan dependency missing for {resource}: {message}")]
    MissingDependency {
        /// Resource whose dependency is absent.
        resource: String,
        /// Description of what is missing.
        message: String,
    },
}

/// Output publication errors.
#[derive(Debug, Error)]
pub enum OutputError {
    /// A declared output has no corresponding value in applied state.
    ///
    /// Fatal: indicates a declaration/output mismatch, never papered
    /// over with an empty value.
    #[error("Declared output '{name}' has no value in applied state: {reason}")]
    MissingOutput {
        /// Name of the declared output.
        name: String,
        /// Why the value is absent.
        reason: String,
    },
}

/// Readiness gate errors.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// The endpoint did not accept a connection within the deadline.
    #[error("Endpoint {endpoint} not ready within {timeout_secs}s ({attempts} attempts)")]
    Timeout {
        /// Endpoint that was probed.
        endpoint: String,
        /// Overall deadline in seconds.
        timeout_secs: u64,
        /// Number of probe attempts made.
        attempts: u32,
    },

    /// A probe could not be constructed or dispatched.
    #[error("Readiness probe failed: {message}")]
    Probe {
        /// Description of the probe failure.
        message: String,
    },
}

/// Deployment handoff errors.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The remote deployment command failed.
    #[error("Remote deployment on {host} failed with exit code {exit_code}: {stderr}")]
    RemoteFailed {
        /// Host the command ran on.
        host: String,
        /// Exit code of the remote command.
        exit_code: i32,
        /// Captured stderr.
        stderr: String,
    },

    /// The remote executor could not be launched.
    #[error("Failed to launch remote executor: {message}")]
    Launch {
        /// Description of the launch failure.
        message: String,
    },

    /// The downstream notification failed.
    #[error("Handoff notification failed: {message}")]
    NotifyFailed {
        /// Description of the notification failure.
        message: String,
    },
}

/// Result type alias for Gangway operations.
pub type Result<T> = std::result::Result<T, GangwayError>;

impl GangwayError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Throttled { .. } | ProviderError::Network { .. })
                | Self::State(StateError::LockFailed { .. } | StateError::Conflict { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::Throttled { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            Self::Provider(ProviderError::Network { .. }) => Some(5),
            Self::State(StateError::LockFailed { .. } | StateError::Conflict { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true if this error is a state lock conflict.
    #[must_use]
    pub const fn is_state_conflict(&self) -> bool {
        matches!(self, Self::State(StateError::Conflict { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an API error for a specific operation.
    #[must_use]
    pub fn api(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a rejection error for a specific resource.
    #[must_use]
    pub fn rejected(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}

impl OutputError {
    /// Creates a missing-output error.
    #[must_use]
    pub fn missing(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MissingOutput {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retryable() {
        let err = GangwayError::State(StateError::Conflict {
            holder: String::from("other-host-123"),
            since: String::from("2025-01-01T00:00:00Z"),
        });
        assert!(err.is_retryable());
        assert!(err.is_state_conflict());
        assert_eq!(err.retry_delay_secs(), Some(2));
    }

    #[test]
    fn test_rejection_is_fatal() {
        let err = GangwayError::Provider(ProviderError::rejected(
            "instance 'app'",
            "InvalidAMIID.Malformed",
        ));
        assert!(!err.is_retryable());
        assert_eq!(err.retry_delay_secs(), None);
    }

    #[test]
    fn test_missing_output_message() {
        let err = GangwayError::Output(OutputError::missing(
            "ec2_public_ip",
            "instance has no public address",
        ));
        assert!(err.to_string().contains("ec2_public_ip"));
    }
}
