//! Error types for the Halldyll infrastructure engine.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation pass: configuration, graph construction, state storage,
//! provider calls, planning, and execution.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Halldyll infrastructure engine.
#[derive(Debug, Error)]
pub enum InfraError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider adapter errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Execution errors.
    #[error("Execution error: {0}")]
    Execute(#[from] ExecuteError),

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
}

/// Errors raised while building or validating the resource graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Full cycle path; the first node is repeated at the end.
        path: Vec<String>,
    },

    /// A reference or explicit dependency names a resource that does not exist.
    #[error("Resource '{from}' references unknown resource '{to}'")]
    UnknownReference {
        /// Resource holding the reference.
        from: String,
        /// Missing target name.
        to: String,
    },

    /// A logical name is not usable.
    #[error("Invalid resource name '{name}': {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A resource declaration has no type tag.
    #[error("Resource '{name}' has an empty type")]
    EmptyType {
        /// Resource name.
        name: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted or fails schema validation.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State schema version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: u32,
        /// Found state version.
        found: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Local filesystem error.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Errors returned by a provider adapter for a single call.
///
/// Classification into transient and terminal drives the executor's retry
/// policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The remote API throttled the request.
    #[error("Rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The remote API did not answer in time.
    #[error("Request timed out: {message}")]
    Timeout {
        /// Description of the timeout.
        message: String,
    },

    /// Transport-level failure.
    #[error("Network error: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// The remote API rejected the request.
    #[error("API request failed: {status} - {message}")]
    Api {
        /// HTTP-like status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// Credentials were rejected.
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Description of the auth failure.
        message: String,
    },

    /// The remote resource does not exist.
    #[error("Resource not found: {external_id}")]
    NotFound {
        /// Provider-assigned identifier.
        external_id: String,
    },

    /// No adapter handles the type tag.
    #[error("No provider registered for resource type '{resource_type}'")]
    Unsupported {
        /// The unhandled type tag.
        resource_type: String,
    },

    /// The provider answered with something unusable.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The ordering constraints cannot all be satisfied.
    #[error("Unresolvable plan for '{resource}': {reason}")]
    Unresolvable {
        /// Resource at the center of the contradiction.
        resource: String,
        /// Description of the contradiction.
        reason: String,
    },

    /// A planned step targets a type no adapter handles.
    #[error("No provider registered for resource type '{resource_type}' (needed by '{resource}')")]
    MissingProvider {
        /// Resource that needs the provider.
        resource: String,
        /// The unhandled type tag.
        resource_type: String,
    },

    /// The plan computed under the lock is not the one that was confirmed.
    #[error("Plan changed since it was reviewed (reviewed {expected}, now {actual}); plan again")]
    Stale {
        /// Fingerprint of the reviewed plan.
        expected: String,
        /// Fingerprint of the plan about to run.
        actual: String,
    },
}

/// Execution errors that abort the pass.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecuteError {
    /// A step referenced a predecessor that had not succeeded.
    #[error("Step '{step}' references '{target}' which has not succeeded")]
    DependencyOrder {
        /// Step being resolved.
        step: String,
        /// Referenced resource.
        target: String,
    },

    /// Execution was aborted.
    #[error("Execution aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for Halldyll operations.
pub type Result<T> = std::result::Result<T, InfraError>;

impl InfraError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error means the persisted state cannot be trusted.
    #[must_use]
    pub const fn is_state_corrupt(&self) -> bool {
        matches!(
            self,
            Self::State(StateError::Corrupted { .. } | StateError::VersionMismatch { .. })
        )
    }

    /// Returns true if this error was raised before any side effect.
    #[must_use]
    pub const fn is_pre_execution(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_) | Self::Plan(_))
            || self.is_state_corrupt()
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
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a local storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an API error.
    #[must_use]
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Returns true if the call is expected to succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Api { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Returns the delay the provider asked for, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = GraphError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(ProviderError::network("reset").is_transient());
        assert!(ProviderError::api(503, "unavailable").is_transient());
        assert!(!ProviderError::api(400, "bad request").is_transient());
        assert!(
            !ProviderError::Authentication {
                message: String::from("nope")
            }
            .is_transient()
        );
        assert_eq!(
            ProviderError::RateLimited { retry_after_secs: 7 }.retry_after_secs(),
            Some(7)
        );
    }

    #[test]
    fn test_state_corrupt_is_pre_execution() {
        let err = InfraError::State(StateError::corrupted("bad json"));
        assert!(err.is_state_corrupt());
        assert!(err.is_pre_execution());

        let lock = InfraError::State(StateError::LockFailed {
            message: String::from("busy"),
        });
        assert!(!lock.is_state_corrupt());
    }
}
