//! Configuration module for the Halldyll infrastructure engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `halldyll.infra.yaml`
//! - Expanding `var(...)` and dropping disabled resources
//! - Validation of configuration values
//! - Computing declaration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;
mod variables;

pub use spec::{
    ExecutionConfig, InfraConfig, ProjectConfig, ProviderConfig, ProviderKind,
    ResourceDeclaration, SchemaConfig, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
pub use variables::{VARIABLE_ENV_PREFIX, is_valid_variable_name};
