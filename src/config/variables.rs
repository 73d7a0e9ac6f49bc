//! Declaration variables and conditional resources.
//!
//! The `variables` section maps names to default values. Attribute strings,
//! output expressions and `enabled` conditions may use `var(<name>)`; a
//! whole-string `var(...)` keeps the value's JSON type, an embedded one is
//! interpolated as text. A variable declared as `~` has no default and must
//! be supplied through `HALLDYLL_INFRA_VAR_<NAME>`.

use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::debug;

use crate::error::{ConfigError, InfraError, Result};

use super::spec::InfraConfig;

/// Prefix of environment variables that override declared variables.
pub const VARIABLE_ENV_PREFIX: &str = "HALLDYLL_INFRA_VAR_";

static VARIABLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"var\(([a-z_][a-z0-9_]*)\)").expect("Invalid variable regex"));

/// True if `name` can be declared and overridden from the environment.
#[must_use]
pub fn is_valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Replaces declared variable defaults with `HALLDYLL_INFRA_VAR_<NAME>` values.
///
/// Values are read as YAML scalars, so `true` and `3` keep their types.
pub fn apply_variable_overrides<I>(config: &mut InfraConfig, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, raw) in vars {
        let Some(name) = key.strip_prefix(VARIABLE_ENV_PREFIX).map(str::to_ascii_lowercase) else {
            continue;
        };
        let Some(slot) = config.variables.get_mut(&name) else {
            debug!("Ignoring {key}: no variable '{name}' is declared");
            continue;
        };

        debug!("Overriding variables.{name} from environment");
        *slot = serde_yaml::from_str::<Value>(&raw)
            .ok()
            .filter(|v| !v.is_null())
            .unwrap_or(Value::String(raw));
    }
}

/// Substitutes variables and drops resources whose condition is false.
///
/// # Errors
///
/// Returns a validation error for an undeclared or unset variable, or for
/// an `enabled` condition that is not a boolean.
pub fn expand(config: &mut InfraConfig) -> Result<()> {
    let variables = config.variables.clone();

    let mut disabled = Vec::new();
    for (name, declaration) in &mut config.resources {
        // Conditions first: a disabled resource may use unset variables.
        if let Some(condition) = &declaration.enabled {
            let field = format!("resources.{name}.enabled");
            match expand_value(condition, &variables, &field)? {
                Value::Bool(true) => declaration.enabled = Some(Value::Bool(true)),
                Value::Bool(false) => {
                    disabled.push(name.clone());
                    continue;
                }
                other => {
                    return Err(invalid(format!("condition must be a boolean, got {other}"), field));
                }
            }
        }

        for (key, value) in &mut declaration.attributes {
            *value = expand_value(value, &variables, &format!("resources.{name}.attributes.{key}"))?;
        }
    }

    for name in disabled {
        debug!("Resource {name} is disabled");
        config.resources.remove(&name);
    }

    for (name, value) in &mut config.outputs {
        *value = expand_value(value, &variables, &format!("outputs.{name}"))?;
    }

    Ok(())
}

fn invalid(message: String, field: String) -> InfraError {
    InfraError::Config(ConfigError::validation(message, field))
}

fn lookup(caps: &Captures<'_>, variables: &BTreeMap<String, Value>, field: &str) -> Result<Value> {
    let name = &caps[1];
    match variables.get(name) {
        Some(Value::Null) => Err(invalid(
            format!(
                "variable '{name}' has no default; set {VARIABLE_ENV_PREFIX}{}",
                name.to_ascii_uppercase()
            ),
            field.to_owned(),
        )),
        Some(value) => Ok(value.clone()),
        None => Err(invalid(format!("unknown variable '{name}'"), field.to_owned())),
    }
}

fn expand_value(value: &Value, variables: &BTreeMap<String, Value>, field: &str) -> Result<Value> {
    match value {
        Value::String(s) => expand_str(s, variables, field),
        Value::Array(items) => items
            .iter()
            .map(|item| expand_value(item, variables, field))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), expand_value(item, variables, field)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn expand_str(s: &str, variables: &BTreeMap<String, Value>, field: &str) -> Result<Value> {
    if let Some(caps) = VARIABLE_REGEX.captures(s) {
        if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) {
            return lookup(&caps, variables, field);
        }
    } else {
        return Ok(Value::String(s.to_owned()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in VARIABLE_REGEX.captures_iter(s) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&s[last..m.start()]);
        match lookup(&caps, variables, field)? {
            Value::String(text) => out.push_str(&text),
            other => out.push_str(&other.to_string()),
        }
        last = m.end();
    }
    out.push_str(&s[last..]);

    Ok(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use serde_json::json;

    const STACK: &str = r#"
project: {name: web-stack}
variables:
  app_name: shop
  instance_type: t2.micro
  desired: 2
  https_enabled: false
  domain_name: ~
resources:
  group:
    type: autoscaling_group
    attributes:
      name: "var(app_name)-asg"
      desired_capacity: "var(desired)"
      sizes: ["var(instance_type)"]
  certificate:
    type: certificate
    enabled: "var(https_enabled)"
    attributes:
      domain_name: "var(domain_name)"
outputs:
  group_name: "ref(group.name)"
"#;

    fn decode(yaml: &str) -> InfraConfig {
        serde_yaml::from_str(yaml).expect("decodes")
    }

    #[test]
    fn test_variables_are_typed_or_interpolated() {
        let config = ConfigParser::new().parse_yaml(STACK, None).expect("expands");
        let group = &config.resources["group"].attributes;

        assert_eq!(group["name"], json!("shop-asg"));
        assert_eq!(group["desired_capacity"], json!(2));
        assert_eq!(group["sizes"], json!(["t2.micro"]));
    }

    #[test]
    fn test_false_condition_drops_the_resource() {
        let config = ConfigParser::new().parse_yaml(STACK, None).expect("expands");

        assert!(!config.resources.contains_key("certificate"));
        assert_eq!(config.outputs["group_name"], json!("ref(group.name)"));
    }

    #[test]
    fn test_enabled_block_needs_its_required_variable() {
        let mut config = decode(STACK);
        apply_variable_overrides(
            &mut config,
            [(String::from("HALLDYLL_INFRA_VAR_HTTPS_ENABLED"), String::from("true"))],
        );

        let err = expand(&mut config).expect_err("domain has no default");
        assert!(err.to_string().contains("HALLDYLL_INFRA_VAR_DOMAIN_NAME"));

        let mut config = decode(STACK);
        apply_variable_overrides(
            &mut config,
            [
                (String::from("HALLDYLL_INFRA_VAR_HTTPS_ENABLED"), String::from("true")),
                (String::from("HALLDYLL_INFRA_VAR_DOMAIN_NAME"), String::from("shop.example.com")),
                (String::from("HALLDYLL_INFRA_VAR_UNDECLARED"), String::from("x")),
                (String::from("PATH"), String::from("/usr/bin")),
            ],
        );
        expand(&mut config).expect("expands");

        let certificate = &config.resources["certificate"];
        assert_eq!(certificate.attributes["domain_name"], json!("shop.example.com"));
        assert_eq!(certificate.enabled, Some(json!(true)));
        assert!(!config.variables.contains_key("undeclared"));
    }

    #[test]
    fn test_unknown_variable_is_rejected() {
        let yaml = r#"
project: {name: web-stack}
resources:
  bucket:
    type: bucket
    attributes: {name: "var(bucket_name)"}
"#;
        let err = ConfigParser::new().parse_yaml(yaml, None).expect_err("undeclared");
        assert!(matches!(
            err,
            InfraError::Config(ConfigError::ValidationError { ref field, .. })
                if field.as_deref() == Some("resources.bucket.attributes.name")
        ));
    }

    #[test]
    fn test_condition_must_be_boolean() {
        let yaml = r#"
project: {name: web-stack}
variables: {flag: "yes please"}
resources:
  bucket: {type: bucket, enabled: "var(flag)"}
"#;
        let err = ConfigParser::new().parse_yaml(yaml, None).expect_err("not a bool");
        assert!(err.to_string().contains("boolean"));
    }

    #[test]
    fn test_variable_names() {
        assert!(is_valid_variable_name("https_enabled"));
        assert!(is_valid_variable_name("_private2"));
        assert!(!is_valid_variable_name("HttpsEnabled"));
        assert!(!is_valid_variable_name("2fast"));
        assert!(!is_valid_variable_name("app-name"));
        assert!(!is_valid_variable_name(""));
    }
}
