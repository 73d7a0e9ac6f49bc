//! Diff engine for comparing desired and recorded state.
//!
//! Every name in the graph or the state gets exactly one classification.
//! References are resolved against recorded state; a reference to a
//! resource that is about to be (re)created, or to an attribute an update
//! may change, resolves to "known after apply" and always counts as a
//! change.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::config::SchemaConfig;
use crate::error::GraphError;
use crate::graph::{ID_ATTRIBUTE, Reference, ResourceGraph, ResourceNode, substitute};
use crate::state::{ResourceRecord, StateSnapshot};

/// Per-type table of attributes that cannot change in place.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    immutable: HashMap<String, BTreeSet<String>>,
}

impl SchemaRegistry {
    /// Creates an empty registry; every attribute is mutable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry from the `schemas:` configuration section.
    #[must_use]
    pub fn from_config(schemas: &BTreeMap<String, SchemaConfig>) -> Self {
        Self {
            immutable: schemas
                .iter()
                .map(|(t, s)| (t.clone(), s.immutable.iter().cloned().collect()))
                .collect(),
        }
    }

    /// Marks attributes of a type as immutable.
    #[must_use]
    pub fn with_immutable(mut self, resource_type: &str, attributes: &[&str]) -> Self {
        self.immutable
            .entry(resource_type.to_string())
            .or_default()
            .extend(attributes.iter().map(|a| (*a).to_string()));
        self
    }

    /// Returns true if changing `attribute` forces replacement.
    #[must_use]
    pub fn is_immutable(&self, resource_type: &str, attribute: &str) -> bool {
        self.immutable
            .get(resource_type)
            .is_some_and(|attrs| attrs.contains(attribute))
    }
}

/// Classification of a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Declared but not recorded.
    Create,
    /// Recorded, declared, and changed in mutable attributes only.
    Update,
    /// Recorded but no longer declared.
    Delete,
    /// Changed in an immutable attribute or in its type.
    Replace,
    /// Nothing to do.
    NoOp,
}

/// A desired attribute value at plan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum PlannedValue {
    /// Fully resolved value.
    Known(serde_json::Value),
    /// Depends on a value that is only known after apply.
    Unknown,
}

/// One attribute that differs between state and declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub key: String,
    /// Last applied value, if any.
    pub old: Option<serde_json::Value>,
    /// Desired value; `None` when the attribute was removed.
    pub new: Option<PlannedValue>,
    /// Whether this change alone forces replacement.
    pub forces_replacement: bool,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDiff {
    /// Resource name.
    pub name: String,
    /// Resource type tag (desired type when declared).
    pub resource_type: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Attribute-level changes, sorted by key.
    pub changes: Vec<AttributeChange>,
    /// Whether the resource must be destroyed and recreated.
    pub requires_replacement: bool,
    /// Recorded external id, if any.
    pub external_id: Option<String>,
    /// Recorded type when it differs from the desired one.
    pub previous_type: Option<String>,
}

/// Complete diff result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffResult {
    /// All resource diffs, sorted by name.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update in place.
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

/// Marker for a reference that cannot be resolved yet.
struct NotYetKnown;

/// What dependents may assume about an already classified resource.
struct Classified {
    kind: DiffType,
    /// Attributes that keep their recorded value through the pass.
    stable: BTreeSet<String>,
}

impl Classified {
    /// True if the recorded value of `attribute` survives the pass.
    ///
    /// For an update only the id and declared attributes outside the
    /// change set qualify; other provider outputs may move.
    fn keeps(&self, attribute: &str) -> bool {
        match self.kind {
            DiffType::Create | DiffType::Replace | DiffType::Delete => false,
            DiffType::NoOp => true,
            DiffType::Update => attribute == ID_ATTRIBUTE || self.stable.contains(attribute),
        }
    }
}

/// Engine for computing diffs between desired and recorded state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    schemas: SchemaRegistry,
}

impl DiffEngine {
    /// Creates a diff engine with the given mutability table.
    #[must_use]
    pub const fn new(schemas: SchemaRegistry) -> Self {
        Self { schemas }
    }

    /// Computes one diff per name in the graph or the state.
    ///
    /// # Errors
    ///
    /// Returns a graph error if the graph was never validated and turns out
    /// to be cyclic or to have dangling edges.
    pub fn compute(&self, graph: &ResourceGraph, state: Option<&StateSnapshot>) -> Result<DiffResult, GraphError> {
        let records = state.map(|s| &s.records);

        let mut kinds: HashMap<String, Classified> = HashMap::new();
        let mut diffs = Vec::with_capacity(graph.len());

        // Dependencies first, so a target's classification is known before
        // its dependents resolve references to it
        for name in graph.topological_order()? {
            let Some(node) = graph.get(&name) else { continue };
            let diff = match records.and_then(|r| r.get(&name)) {
                None => self.create_diff(node, &kinds, records),
                Some(existing) => self.compare(node, existing, &kinds, records),
            };
            let stable = node
                .attributes
                .keys()
                .filter(|key| !diff.changes.iter().any(|c| &c.key == *key))
                .cloned()
                .collect();
            kinds.insert(name, Classified { kind: diff.diff_type, stable });
            diffs.push(diff);
        }

        if let Some(records) = records {
            for (name, existing) in records {
                if !graph.contains(name) {
                    debug!("Resource {name} is no longer declared");
                    diffs.push(ResourceDiff {
                        name: name.clone(),
                        resource_type: existing.resource_type.clone(),
                        diff_type: DiffType::Delete,
                        changes: Vec::new(),
                        requires_replacement: false,
                        external_id: Some(existing.external_id.clone()),
                        previous_type: None,
                    });
                }
            }
        }

        diffs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(DiffResult::from_diffs(diffs))
    }

    fn create_diff(
        &self,
        node: &ResourceNode,
        kinds: &HashMap<String, Classified>,
        records: Option<&BTreeMap<String, ResourceRecord>>,
    ) -> ResourceDiff {
        let changes = node
            .attributes
            .iter()
            .map(|(key, value)| AttributeChange {
                key: key.clone(),
                old: None,
                new: Some(resolve(value, kinds, records)),
                forces_replacement: false,
            })
            .collect();

        ResourceDiff {
            name: node.name.clone(),
            resource_type: node.resource_type.clone(),
            diff_type: DiffType::Create,
            changes,
            requires_replacement: false,
            external_id: None,
            previous_type: None,
        }
    }

    fn compare(
        &self,
        node: &ResourceNode,
        existing: &ResourceRecord,
        kinds: &HashMap<String, Classified>,
        records: Option<&BTreeMap<String, ResourceRecord>>,
    ) -> ResourceDiff {
        let keys: BTreeSet<&String> = node.attributes.keys().chain(existing.attributes.keys()).collect();
        let mut changes = Vec::new();

        for key in keys {
            let old = existing.attributes.get(key);
            let new = node.attributes.get(key).map(|v| resolve(v, kinds, records));

            let changed = match (&new, old) {
                (Some(PlannedValue::Known(n)), Some(o)) => n != o,
                (None, None) => false,
                _ => true,
            };

            if changed {
                changes.push(AttributeChange {
                    key: key.clone(),
                    old: old.cloned(),
                    new,
                    forces_replacement: self.schemas.is_immutable(&node.resource_type, key),
                });
            }
        }

        let type_changed = existing.resource_type != node.resource_type;
        let requires_replacement = type_changed || changes.iter().any(|c| c.forces_replacement);

        let diff_type = if requires_replacement {
            DiffType::Replace
        } else if changes.is_empty() {
            DiffType::NoOp
        } else {
            DiffType::Update
        };

        ResourceDiff {
            name: node.name.clone(),
            resource_type: node.resource_type.clone(),
            diff_type,
            changes,
            requires_replacement,
            external_id: Some(existing.external_id.clone()),
            previous_type: type_changed.then(|| existing.resource_type.clone()),
        }
    }
}

/// Resolves references against recorded state.
///
/// A reference whose target value may change during the pass resolves to
/// [`PlannedValue::Unknown`].
fn resolve(
    value: &serde_json::Value,
    kinds: &HashMap<String, Classified>,
    records: Option<&BTreeMap<String, ResourceRecord>>,
) -> PlannedValue {
    let mut lookup = |r: &Reference| -> Result<serde_json::Value, NotYetKnown> {
        if kinds.get(&r.target).is_some_and(|c| !c.keeps(&r.attribute)) {
            return Err(NotYetKnown);
        }
        records
            .and_then(|recs| recs.get(&r.target))
            .and_then(|rec| rec.output(&r.attribute))
            .ok_or(NotYetKnown)
    };

    match substitute(value, &mut lookup) {
        Ok(resolved) => PlannedValue::Known(resolved),
        Err(NotYetKnown) => PlannedValue::Unknown,
    }
}

impl DiffResult {
    /// Builds the result and its counters.
    #[must_use]
    pub fn from_diffs(diffs: Vec<ResourceDiff>) -> Self {
        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();

        Self {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            deletes: count(DiffType::Delete),
            replaces: count(DiffType::Replace),
            unchanged: count(DiffType::NoOp),
            diffs,
        }
    }

    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.deletes > 0 || self.replaces > 0
    }

    /// Gets the diff for a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.name == name)
    }

    /// Returns the classification of every resource.
    #[must_use]
    pub fn classifications(&self) -> BTreeMap<String, DiffType> {
        self.diffs.iter().map(|d| (d.name.clone(), d.diff_type)).collect()
    }

    /// Returns a summary string.
    #[must_use]
    pub fn summary(&self) -> String {
        if !self.has_changes() {
            return String::from("No changes");
        }

        let mut parts = Vec::new();
        if self.creates > 0 {
            parts.push(format!("{} to create", self.creates));
        }
        if self.updates > 0 {
            parts.push(format!("{} to update", self.updates));
        }
        if self.replaces > 0 {
            parts.push(format!("{} to replace", self.replaces));
        }
        if self.deletes > 0 {
            parts.push(format!("{} to delete", self.deletes));
        }
        parts.join(", ")
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}
