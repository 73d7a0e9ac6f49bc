//! Symbolic attribute references.
//!
//! A reference is written `ref(<name>.<attribute>)` inside any string of an
//! attribute value. A string that is exactly one reference is replaced by
//! the referenced JSON value; references embedded in longer text are
//! rendered into the text.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static REFERENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ref\(([A-Za-z0-9_\-]+)\.([A-Za-z0-9_\-]+)\)").expect("Invalid reference regex")
});

/// Attribute name that resolves to a resource's external identifier.
pub const ID_ATTRIBUTE: &str = "id";

/// A `ref(<name>.<attribute>)` occurrence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Referenced resource name.
    pub target: String,
    /// Referenced output attribute.
    pub attribute: String,
}

impl Reference {
    /// Creates a reference.
    #[must_use]
    pub fn new(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: attribute.into(),
        }
    }

    fn from_captures(caps: &Captures<'_>) -> Self {
        Self::new(&caps[1], &caps[2])
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref({}.{})", self.target, self.attribute)
    }
}

/// Collects every reference in a value, in document order.
#[must_use]
pub fn extract_references(value: &serde_json::Value) -> Vec<Reference> {
    let mut refs = Vec::new();
    collect(value, &mut refs);
    refs
}

fn collect(value: &serde_json::Value, refs: &mut Vec<Reference>) {
    match value {
        serde_json::Value::String(s) => {
            refs.extend(REFERENCE_REGEX.captures_iter(s).map(|c| Reference::from_captures(&c)));
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect(item, refs);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect(item, refs);
            }
        }
        _ => {}
    }
}

/// Returns true if the value contains at least one reference.
#[must_use]
pub fn has_references(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => REFERENCE_REGEX.is_match(s),
        serde_json::Value::Array(items) => items.iter().any(has_references),
        serde_json::Value::Object(map) => map.values().any(has_references),
        _ => false,
    }
}

/// Replaces every reference in a value using `lookup`.
///
/// The first lookup error aborts the substitution.
///
/// # Errors
///
/// Returns whatever error `lookup` returns.
pub fn substitute<E, F>(value: &serde_json::Value, lookup: &mut F) -> Result<serde_json::Value, E>
where
    F: FnMut(&Reference) -> Result<serde_json::Value, E>,
{
    match value {
        serde_json::Value::String(s) => substitute_str(s, lookup),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, lookup))
            .collect::<Result<Vec<_>, E>>()
            .map(serde_json::Value::Array),
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), substitute(item, lookup)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_str<E, F>(s: &str, lookup: &mut F) -> Result<serde_json::Value, E>
where
    F: FnMut(&Reference) -> Result<serde_json::Value, E>,
{
    // Whole-string reference keeps the target's JSON type
    if let Some(caps) = REFERENCE_REGEX.captures(s) {
        if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) {
            return lookup(&Reference::from_captures(&caps));
        }
    } else {
        return Ok(serde_json::Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in REFERENCE_REGEX.captures_iter(s) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&s[last..m.start()]);
        match lookup(&Reference::from_captures(&caps))? {
            serde_json::Value::String(text) => out.push_str(&text),
            other => out.push_str(&other.to_string()),
        }
        last = m.end();
    }
    out.push_str(&s[last..]);

    Ok(serde_json::Value::String(out))
}
