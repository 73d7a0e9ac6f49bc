//! Reading declaration files.
//!
//! A declaration is decoded from YAML (JSON is a YAML subset), then
//! `HALLDYLL_INFRA_*` overrides are laid over it, then `var(...)` is expanded
//! and disabled resources are dropped. Overrides come before expansion so
//! an environment value reaches every place its variable is used.

use crate::error::{ConfigError, InfraError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::InfraConfig;
use super::variables;

/// Turns declaration files into [`InfraConfig`] values.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Directory searched for `.env`; the working directory when unset.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// A parser that reads `.env` from the working directory.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Looks for `.env` in `path` instead of the working directory.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Reads and expands a declaration file, ignoring the environment.
    ///
    /// # Errors
    ///
    /// `ConfigError::FileNotFound` for a missing file, `ParseError` for an
    /// unreadable or malformed one, `ValidationError` for a bad variable.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let path = path.as_ref();
        let content = Self::read(path)?;
        self.parse_yaml(&content, Some(path))
    }

    /// Decodes and expands a declaration held in memory.
    ///
    /// `source` only labels parse errors.
    ///
    /// # Errors
    ///
    /// Same as [`ConfigParser::load_file`], minus the file errors.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<InfraConfig> {
        let mut config = Self::decode(content, source)?;
        variables::expand(&mut config)?;
        Ok(config)
    }

    /// Reads a declaration file with `HALLDYLL_INFRA_*` overrides applied.
    ///
    /// Recognized keys are `PROJECT_NAME`, `ENVIRONMENT`, `STATE_BUCKET`,
    /// `STATE_PREFIX`, `CONCURRENCY` and `VAR_<NAME>` for each declared
    /// variable.
    ///
    /// # Errors
    ///
    /// Same as [`ConfigParser::load_file`], plus a validation error for an
    /// override that does not fit its field.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let path = path.as_ref();
        let content = Self::read(path)?;

        let mut config = Self::decode(&content, Some(path))?;
        Self::apply_env_overrides(&mut config)?;
        variables::expand(&mut config)?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<String> {
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(InfraError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        std::fs::read_to_string(path).map_err(|e| {
            InfraError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })
    }

    fn decode(content: &str, source: Option<&Path>) -> Result<InfraConfig> {
        let config: InfraConfig = serde_yaml::from_str(content).map_err(|e| {
            InfraError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Decoded {} with {} resources, {} variables, {} outputs",
            config.project.name,
            config.resources.len(),
            config.variables.len(),
            config.outputs.len()
        );
        Ok(config)
    }

    fn apply_env_overrides(config: &mut InfraConfig) -> Result<()> {
        if let Ok(name) = std::env::var("HALLDYLL_INFRA_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("HALLDYLL_INFRA_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(bucket) = std::env::var("HALLDYLL_INFRA_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("HALLDYLL_INFRA_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(raw) = std::env::var("HALLDYLL_INFRA_CONCURRENCY") {
            debug!("Overriding execution.concurrency from environment");
            config.execution.concurrency = raw.parse().map_err(|_| {
                InfraError::Config(ConfigError::validation(
                    format!("HALLDYLL_INFRA_CONCURRENCY must be a positive integer, got '{raw}'"),
                    "execution.concurrency",
                ))
            })?;
        }

        variables::apply_variable_overrides(config, std::env::vars());
        Ok(())
    }

    /// Exports the `.env` beside the declaration, if there is one.
    ///
    /// Values already in the environment win.
    ///
    /// # Errors
    ///
    /// A `.env` that exists but does not parse.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                InfraError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads an environment variable a provider cannot work without.
    ///
    /// # Errors
    ///
    /// `ConfigError::MissingEnvVar` naming the variable.
    pub fn required_env(name: &str) -> Result<String> {
        std::env::var(name).map_err(|_| {
            InfraError::Config(ConfigError::MissingEnvVar {
                name: name.to_string(),
            })
        })
    }
}

/// Declaration file names, in lookup order.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "halldyll.infra.yaml",
    "halldyll.infra.yml",
    "halldyll.infra.json",
    "infra.yaml",
    "infra.yml",
];

/// Walks from `start_dir` up to the filesystem root looking for one of
/// [`DEFAULT_CONFIG_FILES`].
///
/// # Errors
///
/// `ConfigError::FileNotFound` naming the first candidate in `start_dir`.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(InfraError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, StateBackend};

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
resources: {}
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("minimal config should parse");

        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.execution.concurrency, 4);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: web-stack
  environment: prod

state:
  backend: s3
  bucket: infra-state
  prefix: web-stack/prod

execution:
  concurrency: 8
  max_retries: 5

providers:
  - kind: http
    endpoint: https://infra.example.com/api
    token_env: INFRA_API_TOKEN
  - kind: memory
    types: [dns_record]

schemas:
  instance:
    immutable: [subnet, image]

resources:
  network:
    type: vpc
    attributes:
      cidr: 10.0.0.0/16
  server:
    type: instance
    attributes:
      subnet: "ref(network.id)"
      tags:
        Name: web
    dependsOn: [network]
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("full config should parse");

        assert_eq!(config.project.environment, "prod");
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.execution.concurrency, 8);
        assert_eq!(config.execution.max_retries, 5);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[1].kind, ProviderKind::Memory);
        assert_eq!(config.schemas["instance"].immutable, vec!["subnet", "image"]);

        let server = &config.resources["server"];
        assert_eq!(server.resource_type, "instance");
        assert_eq!(server.depends_on, vec!["network"]);
        assert_eq!(server.attributes["subnet"], serde_json::json!("ref(network.id)"));
    }

    #[test]
    fn test_parse_json_declaration() {
        let json = r#"{
            "project": {"name": "json-stack"},
            "resources": {
                "bucket": {"type": "bucket", "attributes": {"versioning": true}, "depends_on": []}
            }
        }"#;
        let config = ConfigParser::new()
            .parse_yaml(json, None)
            .expect("json should parse");
        assert_eq!(config.resources["bucket"].attributes["versioning"], serde_json::json!(true));
    }

    #[test]
    fn test_parse_error_reports_location() {
        let err = ConfigParser::new()
            .parse_yaml("project: [", Some(Path::new("broken.yaml")))
            .expect_err("invalid yaml must fail");
        match err {
            InfraError::Config(ConfigError::ParseError { location, .. }) => {
                assert_eq!(location.as_deref(), Some("broken.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_outputs_and_variables_decode() {
        let yaml = r#"
project: {name: web-stack}
variables:
  cidr: 10.0.0.0/16
resources:
  network:
    type: vpc
    attributes: {cidr: "var(cidr)"}
outputs:
  network_arn: "ref(network.arn)"
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parses");

        assert_eq!(config.variables["cidr"], serde_json::json!("10.0.0.0/16"));
        assert_eq!(config.resources["network"].attributes["cidr"], serde_json::json!("10.0.0.0/16"));
        assert_eq!(config.outputs["network_arn"], serde_json::json!("ref(network.arn)"));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("create nested");
        std::fs::write(temp.path().join("halldyll.infra.yaml"), "project: {name: x}")
            .expect("write config");

        let found = find_config_file(&nested).expect("config should be found");
        assert_eq!(found, temp.path().join("halldyll.infra.yaml"));
    }
}
