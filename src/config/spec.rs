//! Configuration specification types for the infrastructure engine.
//!
//! This module defines all the structs that map to the `halldyll.infra.yaml`
//! file. The `resources` section is the desired state and `outputs` names
//! values read back from it after an apply. `variables` parameterize both.
//! The other sections configure where state lives, how the executor behaves,
//! which provider adapters serve which resource types, and which attributes
//! are immutable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The root configuration structure for a Halldyll infrastructure project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfraConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Executor tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Provider adapters, selected by resource type.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Per-type attribute mutability table.
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaConfig>,
    /// Variable defaults for `var(<name>)`; `~` means no default.
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Desired resources keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceDeclaration>,
    /// Stack outputs, `ref(...)` expressions resolved against state.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
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

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries for transient provider errors (attempts = retries + 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// A provider adapter declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Adapter implementation.
    pub kind: ProviderKind,
    /// Base URL (required for http adapters).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    /// Resource types served; empty makes this the default adapter.
    #[serde(default)]
    pub types: Vec<String>,
}

/// Provider adapter implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Generic REST/JSON adapter.
    #[default]
    Http,
    /// In-process simulated cloud.
    Memory,
}

/// Mutability table entry for one resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaConfig {
    /// Attributes that force replacement when changed.
    #[serde(default)]
    pub immutable: Vec<String>,
}

/// Declaration of a single desired resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDeclaration {
    /// Resource type tag.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Desired attributes; strings may embed `ref(<name>.<attr>)`.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Explicit dependencies.
    #[serde(default, rename = "dependsOn", alias = "depends_on")]
    pub depends_on: Vec<String>,
    /// Condition; a resource that evaluates to `false` is not declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<serde_json::Value>,
}

impl InfraConfig {
    /// Returns the number of declared resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

impl ResourceDeclaration {
    /// Creates a declaration with no attributes or dependencies.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
            enabled: None,
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_provider_timeout() -> u64 {
    30
}
