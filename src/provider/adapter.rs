//! The provider adapter contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProviderError;

/// Attribute mapping passed to and returned by providers.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// What a provider returns after creating a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateOutcome {
    /// Provider-assigned identifier.
    pub external_id: String,
    /// Attributes the provider computed.
    #[serde(default)]
    pub outputs: Attributes,
}

/// The three side-effecting operations a provider supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderOperation {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
}

/// Adapter that performs side effects for one or more resource types.
///
/// Calls receive fully resolved attributes; references never reach a
/// provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Short adapter name used in logs.
    fn name(&self) -> &'static str;

    /// Returns true if dropping an in-flight call is safe.
    ///
    /// The executor only aborts calls on cancellation when this holds.
    fn supports_abort(&self) -> bool {
        false
    }

    /// Creates a resource.
    async fn create(&self, resource_type: &str, attributes: &Attributes) -> ProviderResult<CreateOutcome>;

    /// Updates a resource in place and returns its new outputs.
    ///
    /// `attributes` is the complete desired mapping; `changed` lists the
    /// keys that differ from the last applied values.
    async fn update(
        &self,
        resource_type: &str,
        external_id: &str,
        attributes: &Attributes,
        changed: &[String],
    ) -> ProviderResult<Attributes>;

    /// Deletes a resource.
    async fn delete(&self, resource_type: &str, external_id: &str) -> ProviderResult<()>;
}

impl std::fmt::Display for ProviderOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{op}")
    }
}
