//! Configuration validation for infrastructure declarations.
//!
//! This module checks the settings sections of a configuration before any
//! state is touched, and that outputs only read declared resources.
//! Resource names, type tags, and references between resources are checked
//! by the graph builder, which owns those rules.

use crate::error::{ConfigError, InfraError, Result};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use crate::graph::extract_references;

use super::spec::{ExecutionConfig, InfraConfig, ProviderConfig, ProviderKind, StateBackend};
use super::variables::is_valid_variable_name;

/// Upper bound for the executor's concurrency limit.
const MAX_CONCURRENCY: usize = 256;

/// Validator for infrastructure configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

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

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an infrastructure configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &InfraConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(InfraError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &InfraConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_providers(&config.providers, &mut result);
        Self::validate_schemas(config, &mut result);
        Self::validate_variables(config, &mut result);
        Self::validate_outputs(config, &mut result);

        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources declared; apply will destroy everything in state"));
        }

        result
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
    }

    /// Validates state configuration.
    fn validate_state(state: &super::spec::StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    /// Validates executor tuning.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.concurrency == 0 {
            result.errors.push(ValidationError {
                field: String::from("execution.concurrency"),
                message: String::from("Concurrency must be at least 1"),
            });
        } else if execution.concurrency > MAX_CONCURRENCY {
            result.errors.push(ValidationError {
                field: String::from("execution.concurrency"),
                message: format!("Concurrency cannot exceed {MAX_CONCURRENCY}"),
            });
        }

        if execution.initial_backoff_ms > execution.max_backoff_ms {
            result.errors.push(ValidationError {
                field: String::from("execution.initial_backoff_ms"),
                message: format!(
                    "Initial backoff ({}ms) exceeds max backoff ({}ms)",
                    execution.initial_backoff_ms, execution.max_backoff_ms
                ),
            });
        }

        if execution.max_retries > 10 {
            result.warnings.push(format!(
                "execution.max_retries: {} retries with exponential backoff can take a long time",
                execution.max_retries
            ));
        }
    }

    /// Validates provider adapter declarations.
    fn validate_providers(providers: &[ProviderConfig], result: &mut ValidationResult) {
        let mut defaults = 0usize;
        let mut claimed: HashSet<&str> = HashSet::new();

        for (i, provider) in providers.iter().enumerate() {
            let prefix = format!("providers[{i}]");

            if provider.types.is_empty() {
                defaults += 1;
            }

            for resource_type in &provider.types {
                if !claimed.insert(resource_type.as_str()) {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.types"),
                        message: format!("Resource type '{resource_type}' is served by more than one provider"),
                    });
                }
            }

            if provider.kind == ProviderKind::Http {
                match provider.endpoint.as_deref() {
                    None | Some("") => result.errors.push(ValidationError {
                        field: format!("{prefix}.endpoint"),
                        message: String::from("HTTP providers require an endpoint"),
                    }),
                    Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                        result.errors.push(ValidationError {
                            field: format!("{prefix}.endpoint"),
                            message: format!("Endpoint '{endpoint}' must be an http(s) URL"),
                        });
                    }
                    Some(_) => {}
                }
            }

            if provider.timeout_secs == 0 {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.timeout_secs"),
                    message: String::from("Timeout must be at least 1 second"),
                });
            }
        }

        if defaults > 1 {
            result.errors.push(ValidationError {
                field: String::from("providers"),
                message: format!("{defaults} providers have no types; only one default provider is allowed"),
            });
        }
    }

    /// Validates the mutability table against declared resources.
    fn validate_schemas(config: &InfraConfig, result: &mut ValidationResult) {
        let used: BTreeSet<&str> = config
            .resources
            .values()
            .map(|r| r.resource_type.as_str())
            .collect();

        for resource_type in config.schemas.keys() {
            if resource_type.is_empty() {
                result.errors.push(ValidationError {
                    field: String::from("schemas"),
                    message: String::from("Schema type name cannot be empty"),
                });
            } else if !used.contains(resource_type.as_str()) {
                result.warnings.push(format!(
                    "schemas.{resource_type}: no declared resource uses this type"
                ));
            }
        }
    }
}

impl ConfigValidator {
    /// Variable names must map onto `HALLDYLL_INFRA_VAR_<NAME>`.
    fn validate_variables(config: &InfraConfig, result: &mut ValidationResult) {
        for name in config.variables.keys() {
            if !is_valid_variable_name(name) {
                result.errors.push(ValidationError {
                    field: format!("variables.{name}"),
                    message: format!(
                        "Variable name '{name}' is invalid. Must be lowercase alphanumeric with underscores."
                    ),
                });
            }
        }
    }

    /// Outputs may only read resources that are declared.
    fn validate_outputs(config: &InfraConfig, result: &mut ValidationResult) {
        for (name, expression) in &config.outputs {
            let references = extract_references(expression);
            if references.is_empty() {
                result.warnings.push(format!("outputs.{name}: no ref(...), the value is a constant"));
            }

            for reference in references {
                if !config.resources.contains_key(&reference.target) {
                    result.errors.push(ValidationError {
                        field: format!("outputs.{name}"),
                        message: format!("Output reads undeclared resource '{}'", reference.target),
                    });
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> InfraConfig {
        ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("test config should parse")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("web-stack"));
        assert!(is_valid_name("stack-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Web-Stack"));
        assert!(!is_valid_name("123-stack"));
        assert!(!is_valid_name("web_stack"));
        assert!(!is_valid_name("stack-"));
        assert!(!is_valid_name("web--stack"));
    }

    #[test]
    fn test_valid_config_passes() {
        let config = parse(
            r"
project: {name: web-stack}
providers:
  - kind: http
    endpoint: https://infra.example.com
resources:
  network: {type: vpc}
",
        );
        let result = ConfigValidator::new().validate(&config).expect("should validate");
        assert!(result.is_valid());
    }

    #[test]
    fn test_s3_requires_bucket() {
        let config = parse(
            r"
project: {name: web-stack}
state: {backend: s3}
",
        );
        let err = ConfigValidator::new().validate(&config).expect_err("bucket missing");
        assert!(err.to_string().contains("S3 bucket"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = parse(
            r"
project: {name: web-stack}
execution: {concurrency: 0}
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "execution.concurrency"));
    }

    #[test]
    fn test_provider_rules() {
        let config = parse(
            r"
project: {name: web-stack}
providers:
  - kind: http
  - kind: memory
  - kind: memory
    types: [vpc]
  - kind: memory
    types: [vpc]
",
        );
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"providers[0].endpoint"));
        assert!(fields.contains(&"providers"));
        assert!(fields.contains(&"providers[3].types"));
    }

    #[test]
    fn test_outputs_must_read_declared_resources() {
        let config = parse(
            r#"
project: {name: web-stack}
variables:
  Bad-Name: 1
resources:
  web_lb: {type: load_balancer}
outputs:
  dns: "ref(web_lb.dns_name)"
  url: "https://ref(certificate.domain_name)/"
  region: eu-west-1
"#,
        );
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert_eq!(fields, vec!["variables.Bad-Name", "outputs.url"]);
        assert!(result.warnings.iter().any(|w| w.contains("outputs.region")));
    }

    #[test]
    fn test_unused_schema_warns() {
        let config = parse(
            r"
project: {name: web-stack}
schemas:
  database: {immutable: [engine]}
resources:
  network: {type: vpc}
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("schemas.database")));
    }
}
