//! State types for tracking applied resources.
//!
//! These types represent the recorded state of the infrastructure, used as
//! the "before" side of every diff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::{InfraError, Result, StateError};
use crate::graph::ID_ATTRIBUTE;

/// Current version of the state format.
pub const STATE_VERSION: u32 = 1;

/// Number of history entries kept on a snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete persisted state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    /// State format version.
    pub version: u32,
    /// Incremented every time the snapshot is committed.
    pub serial: u64,
    /// Identifier assigned when the state was first created.
    pub lineage: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last fully applied declarations.
    #[serde(default)]
    pub config_hash: String,
    /// Records keyed by resource name.
    #[serde(default)]
    pub records: BTreeMap<String, ResourceRecord>,
    /// Stack outputs resolved after the last apply.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Reconciliation history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// The recorded state of one applied resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    /// Logical resource name.
    pub name: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Provider-assigned identifier.
    pub external_id: String,
    /// Last-applied, fully resolved attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Attributes returned by the provider.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Resources this one depended on when it was applied.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// When the last successful operation finished.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the reconciliation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the pass finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: Operation,
    /// Declaration hash at the time of the pass.
    pub config_hash: String,
    /// Resources touched by succeeded steps.
    pub resources: Vec<String>,
    /// Whether every step succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of reconciliation passes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Converge toward the declarations.
    Apply,
    /// Converge toward an empty declaration set.
    Destroy,
}

impl StateSnapshot {
    /// Creates a new empty snapshot with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: Uuid::new_v4().to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            records: BTreeMap::new(),
            outputs: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Parses and validates a persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns `VersionMismatch` for an unknown format version and
    /// `Corrupted` for anything else that does not match the schema.
    pub fn from_json(content: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;

        let Some(object) = raw.as_object() else {
            return Err(StateError::corrupted("State document is not a JSON object").into());
        };

        match object.get("version") {
            Some(serde_json::Value::Number(n)) if n.as_u64() == Some(u64::from(STATE_VERSION)) => {}
            Some(other) => {
                return Err(InfraError::State(StateError::VersionMismatch {
                    expected: STATE_VERSION,
                    found: other.to_string(),
                }));
            }
            None => return Err(StateError::corrupted("State document has no version field").into()),
        }

        let snapshot: Self = serde_json::from_value(raw)
            .map_err(|e| StateError::corrupted(format!("State does not match schema: {e}")))?;
        snapshot.check_records()?;

        Ok(snapshot)
    }

    /// Serializes the snapshot as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")).into())
    }

    fn check_records(&self) -> Result<()> {
        for (key, record) in &self.records {
            if key != &record.name {
                return Err(StateError::corrupted(format!(
                    "Record key '{key}' does not match record name '{}'",
                    record.name
                ))
                .into());
            }
            if record.external_id.is_empty() {
                return Err(StateError::corrupted(format!("Record '{key}' has an empty external id")).into());
            }
            if record.resource_type.is_empty() {
                return Err(StateError::corrupted(format!("Record '{key}' has an empty type")).into());
            }
        }
        Ok(())
    }

    /// Gets a record by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceRecord> {
        self.records.get(name)
    }

    /// Adds or replaces a record.
    pub fn upsert(&mut self, record: ResourceRecord) {
        self.records.insert(record.name.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by name.
    pub fn remove(&mut self, name: &str) -> Option<ResourceRecord> {
        let result = self.records.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Marks the snapshot as committed.
    pub fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all record names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }
}

impl ResourceRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(name: &str, resource_type: &str, external_id: &str) -> Self {
        Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            external_id: external_id.to_string(),
            attributes: BTreeMap::new(),
            outputs: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// Looks up an attribute for reference resolution.
    ///
    /// `id` is the external id; other names are searched in the provider
    /// outputs first, then in the applied attributes.
    #[must_use]
    pub fn output(&self, attribute: &str) -> Option<serde_json::Value> {
        if attribute == ID_ATTRIBUTE {
            return Some(serde_json::Value::String(self.external_id.clone()));
        }
        self.outputs
            .get(attribute)
            .or_else(|| self.attributes.get(attribute))
            .cloned()
    }
}

impl HistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: Operation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(operation: Operation, config_hash: &str, resources: Vec<String>, error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot_with_network() -> StateSnapshot {
        let mut state = StateSnapshot::new("web-stack", "dev");
        let mut record = ResourceRecord::new("network", "vpc", "vpc-123");
        record.attributes.insert(String::from("cidr"), json!("10.0.0.0/16"));
        record.outputs.insert(String::from("arn"), json!("arn:vpc/123"));
        state.upsert(record);
        state
    }

    #[test]
    fn test_round_trip_through_json() {
        let state = snapshot_with_network();
        let content = state.to_json().expect("serialize");
        let loaded = StateSnapshot::from_json(&content).expect("parse");
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_record_output_lookup() {
        let state = snapshot_with_network();
        let record = state.get("network").expect("record");

        assert_eq!(record.output("id"), Some(json!("vpc-123")));
        assert_eq!(record.output("arn"), Some(json!("arn:vpc/123")));
        assert_eq!(record.output("cidr"), Some(json!("10.0.0.0/16")));
        assert_eq!(record.output("missing"), None);
    }

    #[test]
    fn test_version_mismatch() {
        let err = StateSnapshot::from_json(r#"{"version": 7}"#).expect_err("wrong version");
        assert!(matches!(
            err,
            InfraError::State(StateError::VersionMismatch { expected: 1, ref found }) if found == "7"
        ));
    }

    #[test]
    fn test_corrupted_documents() {
        for content in [
            "not json",
            "[1, 2]",
            r#"{"serial": 1}"#,
            r#"{"version": 1, "serial": "x"}"#,
        ] {
            let err = StateSnapshot::from_json(content).expect_err("corrupt");
            assert!(err.is_state_corrupt(), "{content} should be corrupt, got {err}");
        }
    }

    #[test]
    fn test_record_key_must_match_name() {
        let mut state = snapshot_with_network();
        if let Some(record) = state.records.remove("network") {
            state.records.insert(String::from("other"), record);
        }
        let content = state.to_json().expect("serialize");

        let err = StateSnapshot::from_json(&content).expect_err("mismatched key");
        assert!(err.to_string().contains("does not match record name"));
    }

    #[test]
    fn test_empty_external_id_rejected() {
        let mut state = StateSnapshot::new("web-stack", "dev");
        state.upsert(ResourceRecord::new("network", "vpc", ""));
        let content = state.to_json().expect("serialize");

        assert!(StateSnapshot::from_json(&content).is_err());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = StateSnapshot::new("web-stack", "dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(HistoryEntry::new(Operation::Apply, &i.to_string(), vec![]));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].config_hash, "5");
    }

    #[test]
    fn test_touch_increments_serial() {
        let mut state = StateSnapshot::new("web-stack", "dev");
        state.touch();
        state.touch();
        assert_eq!(state.serial, 2);
    }
}
