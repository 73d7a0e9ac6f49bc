//! Selects a provider adapter by resource type.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ConfigParser, ProviderConfig, ProviderKind};
use crate::error::{ConfigError, InfraError, ProviderError, Result};

use super::adapter::ResourceProvider;
use super::http::HttpProvider;
use super::memory::MemoryProvider;

/// Maps type tags to provider adapters.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    by_type: HashMap<String, Arc<dyn ResourceProvider>>,
    default: Option<Arc<dyn ResourceProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.by_type.keys().collect();
        types.sort();
        f.debug_struct("ProviderRegistry")
            .field("types", &types)
            .field("default", &self.default.as_ref().map(|p| p.name()))
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that sends every type to one adapter.
    #[must_use]
    pub fn single(provider: Arc<dyn ResourceProvider>) -> Self {
        Self::new().with_default(provider)
    }

    /// Sets the adapter used for types with no explicit registration.
    #[must_use]
    pub fn with_default(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.default = Some(provider);
        self
    }

    /// Registers an adapter for a resource type.
    #[must_use]
    pub fn with_type(mut self, resource_type: &str, provider: Arc<dyn ResourceProvider>) -> Self {
        self.by_type.insert(resource_type.to_string(), provider);
        self
    }

    /// Returns the adapter for a type, if any.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.by_type
            .get(resource_type)
            .or(self.default.as_ref())
            .cloned()
    }

    /// Returns true if some adapter serves the type.
    #[must_use]
    pub fn supports(&self, resource_type: &str) -> bool {
        self.by_type.contains_key(resource_type) || self.default.is_some()
    }

    /// Returns the adapter for a type.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` if no adapter serves the type.
    pub fn resolve(&self, resource_type: &str) -> std::result::Result<Arc<dyn ResourceProvider>, ProviderError> {
        self.get(resource_type).ok_or_else(|| ProviderError::Unsupported {
            resource_type: resource_type.to_string(),
        })
    }

    /// Builds adapters from the `providers:` configuration section.
    ///
    /// With no providers configured, every type goes to a fresh
    /// [`MemoryProvider`].
    ///
    /// # Errors
    ///
    /// Returns an error if a token variable is missing or an HTTP client
    /// cannot be created.
    pub fn from_config(providers: &[ProviderConfig]) -> Result<Self> {
        if providers.is_empty() {
            info!("No providers configured, using the in-memory provider");
            return Ok(Self::single(Arc::new(MemoryProvider::new())));
        }

        let mut registry = Self::new();

        for config in providers {
            let provider: Arc<dyn ResourceProvider> = match config.kind {
                ProviderKind::Memory => Arc::new(MemoryProvider::new()),
                ProviderKind::Http => {
                    let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                        InfraError::Config(ConfigError::validation(
                            "HTTP providers require an endpoint",
                            "providers.endpoint",
                        ))
                    })?;
                    let token = config
                        .token_env
                        .as_deref()
                        .map(ConfigParser::required_env)
                        .transpose()?;
                    Arc::new(HttpProvider::with_timeout(endpoint, token, config.timeout_secs)?)
                }
            };

            debug!("Registered {} provider for {:?}", provider.name(), config.types);

            if config.types.is_empty() {
                registry.default = Some(provider);
            } else {
                for resource_type in &config.types {
                    registry.by_type.insert(resource_type.clone(), Arc::clone(&provider));
                }
            }
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_registration_beats_default() {
        let registry = ProviderRegistry::new()
            .with_default(Arc::new(MemoryProvider::new()))
            .with_type("dns_record", Arc::new(MemoryProvider::new().with_abort_support(false)));

        assert!(registry.get("vpc").is_some_and(|p| p.supports_abort()));
        assert!(registry.get("dns_record").is_some_and(|p| !p.supports_abort()));
    }

    #[test]
    fn test_unsupported_type() {
        let registry = ProviderRegistry::new().with_type("vpc", Arc::new(MemoryProvider::new()));

        assert!(registry.supports("vpc"));
        assert!(!registry.supports("bucket"));
        assert_eq!(
            registry.resolve("bucket").err(),
            Some(ProviderError::Unsupported {
                resource_type: String::from("bucket")
            })
        );
    }

    #[test]
    fn test_from_empty_config_uses_memory() {
        let registry = ProviderRegistry::from_config(&[]).expect("registry");
        assert_eq!(registry.resolve("anything").map(|p| p.name()), Ok("memory"));
    }

    #[test]
    fn test_from_config_requires_token_variable() {
        let config = ProviderConfig {
            kind: ProviderKind::Http,
            endpoint: Some(String::from("https://infra.example.com")),
            token_env: Some(String::from("HALLDYLL_INFRA_TEST_TOKEN_THAT_IS_NEVER_SET")),
            timeout_secs: 5,
            types: vec![],
        };
        let err = ProviderRegistry::from_config(&[config]).expect_err("missing token");
        assert!(matches!(err, InfraError::Config(ConfigError::MissingEnvVar { .. })));
    }

    #[test]
    fn test_from_config_routes_types() {
        let configs = [
            ProviderConfig {
                kind: ProviderKind::Http,
                endpoint: Some(String::from("https://infra.example.com")),
                token_env: None,
                timeout_secs: 5,
                types: vec![],
            },
            ProviderConfig {
                kind: ProviderKind::Memory,
                endpoint: None,
                token_env: None,
                timeout_secs: 5,
                types: vec![String::from("dns_record")],
            },
        ];
        let registry = ProviderRegistry::from_config(&configs).expect("registry");

        assert_eq!(registry.resolve("vpc").map(|p| p.name()), Ok("http"));
        assert_eq!(registry.resolve("dns_record").map(|p| p.name()), Ok("memory"));
    }
}
