//! Execution plan types and construction.
//!
//! The planner turns a diff set into a totally ordered list of provider
//! steps. Ordering follows the dependency graph: dependencies are created
//! and updated before their dependents, and dependents are deleted before
//! their dependencies. Recorded dependencies order the teardown of
//! resources that are no longer declared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::{PlanError, Result};
use crate::graph::ResourceGraph;
use crate::state::StateSnapshot;

use super::diff::{AttributeChange, DiffResult, DiffType};

/// Types of provider steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Create a resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
}

/// A single planned step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Action type.
    pub action: ActionType,
    /// Resource name.
    pub name: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Desired attributes with references still symbolic (create and update).
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Attribute changes (update only).
    pub changes: Vec<AttributeChange>,
    /// Recorded id of the resource (update and delete).
    pub external_id: Option<String>,
    /// Whether this step is half of a replacement.
    pub replacement: bool,
    /// Resources the created or updated resource depends on.
    pub depends_on: BTreeSet<String>,
    /// Indices of steps that must succeed first.
    pub dependencies: Vec<usize>,
}

/// A complete execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
    /// Hash of the ordered steps.
    pub fingerprint: String,
}

/// Builds execution plans from diffs.
#[derive(Debug, Default)]
pub struct Planner {
    hasher: ConfigHasher,
}

/// Step identity before ordering.
type StepKey = (String, ActionType);

impl Planner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Orders the steps needed to apply a diff.
    ///
    /// # Errors
    ///
    /// Returns a graph error if `graph` is cyclic, and
    /// `PlanError::Unresolvable` if the ordering constraints cannot all
    /// hold, including replacing a resource that a kept resource depends on.
    pub fn plan(
        &self,
        diffs: &DiffResult,
        graph: &ResourceGraph,
        state: Option<&StateSnapshot>,
    ) -> Result<ExecutionPlan> {
        graph.validate()?;
        Self::check_replacements(diffs, graph)?;

        let steps = Self::expand(diffs, graph);
        let index: HashMap<StepKey, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| ((s.name.clone(), s.action), i))
            .collect();

        let edges = Self::constraints(&steps, &index, graph, state);
        let order = Self::order(&steps, &edges)?;

        let position: HashMap<usize, usize> = order.iter().enumerate().map(|(pos, &i)| (i, pos)).collect();
        let mut predecessors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); steps.len()];
        for (&from, targets) in &edges {
            for &to in targets {
                predecessors[to].insert(position[&from]);
            }
        }

        let mut ordered = Vec::with_capacity(steps.len());
        let mut slots: Vec<Option<PlanStep>> = steps.into_iter().map(Some).collect();
        for &i in &order {
            if let Some(mut step) = slots[i].take() {
                step.dependencies = predecessors[i].iter().copied().collect();
                ordered.push(step);
            }
        }

        let plan = ExecutionPlan::new(ordered, &self.hasher);
        debug!("Planned {} steps (fingerprint {})", plan.steps.len(), self.hasher.short_hash(&plan.fingerprint));
        Ok(plan)
    }

    /// Rejects replacing a resource while something that depends on it stays.
    fn check_replacements(diffs: &DiffResult, graph: &ResourceGraph) -> Result<()> {
        let kinds = diffs.classifications();

        for diff in diffs.diffs.iter().filter(|d| d.diff_type == DiffType::Replace) {
            for dependent in graph.dependents(&diff.name) {
                if matches!(kinds.get(&dependent), Some(DiffType::NoOp | DiffType::Update)) {
                    return Err(PlanError::Unresolvable {
                        resource: diff.name.clone(),
                        reason: format!(
                            "replacement requires deleting it while '{dependent}', which depends on it, is kept in place"
                        ),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Expands diffs into unordered steps.
    fn expand(diffs: &DiffResult, graph: &ResourceGraph) -> Vec<PlanStep> {
        let mut steps = Vec::new();

        for diff in &diffs.diffs {
            let node = graph.get(&diff.name);
            let step = |action: ActionType, replacement: bool| PlanStep {
                action,
                name: diff.name.clone(),
                resource_type: diff.resource_type.clone(),
                attributes: match (action, node) {
                    (ActionType::Delete, _) | (_, None) => BTreeMap::new(),
                    (_, Some(n)) => n.attributes.clone(),
                },
                changes: if action == ActionType::Update {
                    diff.changes.clone()
                } else {
                    Vec::new()
                },
                external_id: match action {
                    ActionType::Create => None,
                    _ => diff.external_id.clone(),
                },
                replacement,
                depends_on: match (action, node) {
                    (ActionType::Delete, _) | (_, None) => BTreeSet::new(),
                    (_, Some(n)) => n.dependencies(),
                },
                dependencies: Vec::new(),
            };

            match diff.diff_type {
                DiffType::Create => steps.push(step(ActionType::Create, false)),
                DiffType::Update => steps.push(step(ActionType::Update, false)),
                DiffType::Delete => steps.push(step(ActionType::Delete, false)),
                DiffType::Replace => {
                    let mut delete = step(ActionType::Delete, true);
                    if let Some(previous) = &diff.previous_type {
                        delete.resource_type.clone_from(previous);
                    }
                    steps.push(delete);
                    steps.push(step(ActionType::Create, true));
                }
                DiffType::NoOp => {}
            }
        }

        steps
    }

    /// Collects `before -> after` constraints between step indices.
    fn constraints(
        steps: &[PlanStep],
        index: &HashMap<StepKey, usize>,
        graph: &ResourceGraph,
        state: Option<&StateSnapshot>,
    ) -> BTreeMap<usize, BTreeSet<usize>> {
        let mut edges: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        let mut add = |from: usize, to: usize| {
            if from != to {
                edges.entry(from).or_default().insert(to);
            }
        };
        let provisioning = |name: &str| {
            index
                .get(&(name.to_string(), ActionType::Create))
                .or_else(|| index.get(&(name.to_string(), ActionType::Update)))
                .copied()
        };
        let deleting = |name: &str| index.get(&(name.to_string(), ActionType::Delete)).copied();

        for (i, step) in steps.iter().enumerate() {
            match step.action {
                ActionType::Create | ActionType::Update => {
                    // Dependencies are provisioned first
                    for dep in &step.depends_on {
                        if let Some(before) = provisioning(dep) {
                            add(before, i);
                        }
                    }

                    if step.action == ActionType::Create {
                        if let Some(before) = deleting(&step.name) {
                            add(before, i);
                        }
                    }

                    // Moving off a dependency happens before that dependency is deleted
                    if step.action == ActionType::Update {
                        let recorded = state
                            .and_then(|s| s.get(&step.name))
                            .map(|r| r.dependencies.clone())
                            .unwrap_or_default();
                        for dep in recorded.difference(&step.depends_on) {
                            if let Some(after) = deleting(dep) {
                                add(i, after);
                            }
                        }
                    }
                }
                ActionType::Delete => {
                    // Dependents are deleted before their dependencies
                    let mut deps: BTreeSet<String> = state
                        .and_then(|s| s.get(&step.name))
                        .map(|r| r.dependencies.clone())
                        .unwrap_or_default();
                    if let Some(node) = graph.get(&step.name) {
                        deps.extend(node.dependencies());
                    }
                    for dep in &deps {
                        if let Some(after) = deleting(dep) {
                            add(i, after);
                        }
                    }
                }
            }
        }

        edges
    }

    /// Kahn's algorithm with deterministic tie-breaking.
    ///
    /// The smallest ready `(name, action)` goes first, except that a
    /// replacement create follows its delete immediately when it is ready.
    fn order(steps: &[PlanStep], edges: &BTreeMap<usize, BTreeSet<usize>>) -> Result<Vec<usize>> {
        let mut in_degree = vec![0usize; steps.len()];
        for targets in edges.values() {
            for &to in targets {
                in_degree[to] += 1;
            }
        }

        let key = |i: usize| (steps[i].name.clone(), steps[i].action, i);
        let mut ready: BTreeSet<(String, ActionType, usize)> =
            (0..steps.len()).filter(|&i| in_degree[i] == 0).map(key).collect();
        let mut order = Vec::with_capacity(steps.len());
        let mut preferred: Option<usize> = None;

        loop {
            let next = match preferred.take() {
                Some(i) if ready.remove(&key(i)) => i,
                _ => match ready.pop_first() {
                    Some((_, _, i)) => i,
                    None => break,
                },
            };
            order.push(next);

            if let Some(targets) = edges.get(&next) {
                for &to in targets {
                    in_degree[to] -= 1;
                    if in_degree[to] == 0 {
                        ready.insert(key(to));
                    }
                }
            }

            let step = &steps[next];
            if step.replacement && step.action == ActionType::Delete {
                preferred = steps
                    .iter()
                    .position(|s| s.replacement && s.action == ActionType::Create && s.name == step.name);
            }
        }

        if order.len() < steps.len() {
            let stuck: BTreeSet<&str> = (0..steps.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| steps[i].name.as_str())
                .collect();
            let resource = stuck.iter().next().map_or_else(String::new, |s| (*s).to_string());
            return Err(PlanError::Unresolvable {
                resource,
                reason: format!(
                    "ordering constraints form a cycle among: {}",
                    stuck.into_iter().collect::<Vec<_>>().join(", ")
                ),
            }
            .into());
        }

        Ok(order)
    }
}

impl ExecutionPlan {
    /// Creates a plan from ordered steps.
    #[must_use]
    pub fn new(steps: Vec<PlanStep>, hasher: &ConfigHasher) -> Self {
        let canonical: Vec<serde_json::Value> = steps
            .iter()
            .map(|s| {
                json!({
                    "action": s.action,
                    "name": s.name,
                    "type": s.resource_type,
                    "attributes": s.attributes,
                    "external_id": s.external_id,
                    "replacement": s.replacement,
                    "dependencies": s.dependencies,
                })
            })
            .collect();
        let fingerprint = hasher.hash_value(&serde_json::Value::Array(canonical));

        Self {
            created_at: Utc::now(),
            steps,
            fingerprint,
        }
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new(), &ConfigHasher::new())
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of steps.
    #[must_use]
    pub const fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns the number of steps of one action type.
    #[must_use]
    pub fn count(&self, action: ActionType) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    /// Returns the number of replaced resources.
    #[must_use]
    pub fn replacement_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.replacement && s.action == ActionType::Create)
            .count()
    }

    /// Returns the `(action, name)` sequence.
    #[must_use]
    pub fn sequence(&self) -> Vec<(ActionType, &str)> {
        self.steps.iter().map(|s| (s.action, s.name.as_str())).collect()
    }

    /// Returns steps that can start immediately (no dependencies).
    #[must_use]
    pub fn ready_steps(&self) -> Vec<usize> {
        (0..self.steps.len())
            .filter(|&i| self.steps[i].dependencies.is_empty())
            .collect()
    }

    /// Gets the indices of steps that depend directly on `step_idx`.
    #[must_use]
    pub fn dependents(&self, step_idx: usize) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.dependencies.contains(&step_idx))
            .map(|(i, _)| i)
            .collect()
    }
}

impl PlanStep {
    /// Returns a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> String {
        let verb = match (self.action, self.replacement) {
            (ActionType::Create, false) => "Create",
            (ActionType::Create, true) => "Recreate",
            (ActionType::Update, _) => "Update",
            (ActionType::Delete, false) => "Delete",
            (ActionType::Delete, true) => "Delete (replace)",
        };
        format!("{verb} {}.{}", self.resource_type, self.name)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())?;
        if let Some(id) = &self.external_id {
            write!(f, " ({id})")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Execution Plan ({} steps):", self.steps.len())?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {i}. {step}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDeclaration;
    use crate::error::{GraphError, InfraError};
    use crate::graph::{GraphBuilder, ResourceNode};
    use crate::planner::diff::{DiffEngine, SchemaRegistry};
    use crate::state::ResourceRecord;
    use serde_json::json;

    fn graph(items: Vec<(&str, ResourceDeclaration)>) -> ResourceGraph {
        let decls = items.into_iter().map(|(n, d)| (n.to_string(), d)).collect();
        GraphBuilder::new().build(&decls).expect("valid graph")
    }

    fn plan_for(graph: &ResourceGraph, state: Option<&StateSnapshot>, schemas: SchemaRegistry) -> Result<ExecutionPlan> {
        let diffs = DiffEngine::new(schemas).compute(graph, state).expect("diff");
        Planner::new().plan(&diffs, graph, state)
    }

    fn record(state: &mut StateSnapshot, name: &str, resource_type: &str, deps: &[&str]) {
        let mut r = ResourceRecord::new(name, resource_type, &format!("{name}-id"));
        r.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
        state.upsert(r);
    }

    #[test]
    fn test_network_then_server() {
        let g = graph(vec![
            ("network", ResourceDeclaration::new("vpc").with_attribute("cidr", "10.0.0.0/16")),
            (
                "server",
                ResourceDeclaration::new("instance").with_attribute("subnet", "ref(network.id)"),
            ),
        ]);
        let plan = plan_for(&g, None, SchemaRegistry::new()).expect("plan");

        assert_eq!(
            plan.sequence(),
            vec![(ActionType::Create, "network"), (ActionType::Create, "server")]
        );
        assert_eq!(plan.steps[1].dependencies, vec![0]);
        assert_eq!(plan.steps[1].attributes["subnet"], json!("ref(network.id)"));
    }

    #[test]
    fn test_removed_server_is_deleted_alone() {
        let g = graph(vec![("network", ResourceDeclaration::new("vpc"))]);
        let mut state = StateSnapshot::new("p", "dev");
        record(&mut state, "network", "vpc", &[]);
        record(&mut state, "server", "instance", &["network"]);

        let plan = plan_for(&g, Some(&state), SchemaRegistry::new()).expect("plan");
        assert_eq!(plan.sequence(), vec![(ActionType::Delete, "server")]);
        assert_eq!(plan.steps[0].external_id.as_deref(), Some("server-id"));
    }

    #[test]
    fn test_teardown_deletes_dependents_first() {
        let g = ResourceGraph::empty();
        let mut state = StateSnapshot::new("p", "dev");
        record(&mut state, "app", "instance", &["db", "network"]);
        record(&mut state, "db", "database", &["network"]);
        record(&mut state, "network", "vpc", &[]);
        record(&mut state, "zone", "dns", &[]);

        let plan = plan_for(&g, Some(&state), SchemaRegistry::new()).expect("plan");
        assert_eq!(
            plan.sequence(),
            vec![
                (ActionType::Delete, "app"),
                (ActionType::Delete, "db"),
                (ActionType::Delete, "network"),
                (ActionType::Delete, "zone"),
            ]
        );
    }

    #[test]
    fn test_replace_expands_to_adjacent_delete_create() {
        let g = graph(vec![
            ("alpha", ResourceDeclaration::new("bucket")),
            ("network", ResourceDeclaration::new("vpc").with_attribute("cidr", "10.9.0.0/16")),
        ]);
        let mut state = StateSnapshot::new("p", "dev");
        let mut network = ResourceRecord::new("network", "vpc", "vpc-1");
        network.attributes.insert(String::from("cidr"), json!("10.0.0.0/16"));
        state.upsert(network);

        let schemas = SchemaRegistry::new().with_immutable("vpc", &["cidr"]);
        let plan = plan_for(&g, Some(&state), schemas).expect("plan");

        assert_eq!(
            plan.sequence(),
            vec![
                (ActionType::Create, "alpha"),
                (ActionType::Delete, "network"),
                (ActionType::Create, "network"),
            ]
        );
        assert!(plan.steps[1].replacement && plan.steps[2].replacement);
        assert_eq!(plan.steps[2].dependencies, vec![1]);
        assert_eq!(plan.replacement_count(), 1);
    }

    #[test]
    fn test_replace_chain_orders_teardown_and_rebuild() {
        let g = graph(vec![
            ("network", ResourceDeclaration::new("vpc").with_attribute("cidr", "10.9.0.0/16")),
            (
                "server",
                ResourceDeclaration::new("instance").with_attribute("subnet", "ref(network.id)"),
            ),
        ]);
        let mut state = StateSnapshot::new("p", "dev");
        let mut network = ResourceRecord::new("network", "vpc", "vpc-1");
        network.attributes.insert(String::from("cidr"), json!("10.0.0.0/16"));
        state.upsert(network);
        let mut server = ResourceRecord::new("server", "instance", "i-1");
        server.attributes.insert(String::from("subnet"), json!("vpc-1"));
        server.dependencies.insert(String::from("network"));
        state.upsert(server);

        let schemas = SchemaRegistry::new()
            .with_immutable("vpc", &["cidr"])
            .with_immutable("instance", &["subnet"]);
        let plan = plan_for(&g, Some(&state), schemas).expect("plan");

        assert_eq!(
            plan.sequence(),
            vec![
                (ActionType::Delete, "server"),
                (ActionType::Delete, "network"),
                (ActionType::Create, "network"),
                (ActionType::Create, "server"),
            ]
        );
    }

    #[test]
    fn test_replace_under_kept_dependent_is_unresolvable() {
        let g = graph(vec![
            ("network", ResourceDeclaration::new("vpc").with_attribute("cidr", "10.9.0.0/16")),
            (
                "server",
                ResourceDeclaration::new("instance").with_attribute("subnet", "ref(network.id)"),
            ),
        ]);
        let mut state = StateSnapshot::new("p", "dev");
        let mut network = ResourceRecord::new("network", "vpc", "vpc-1");
        network.attributes.insert(String::from("cidr"), json!("10.0.0.0/16"));
        state.upsert(network);
        let mut server = ResourceRecord::new("server", "instance", "i-1");
        server.attributes.insert(String::from("subnet"), json!("vpc-1"));
        state.upsert(server);

        // subnet is mutable, so server would be updated in place
        let schemas = SchemaRegistry::new().with_immutable("vpc", &["cidr"]);
        let err = plan_for(&g, Some(&state), schemas).expect_err("contradiction");

        assert!(matches!(
            err,
            InfraError::Plan(PlanError::Unresolvable { ref resource, .. }) if resource == "network"
        ));
    }

    #[test]
    fn test_reversed_recorded_edges_are_unresolvable() {
        let g = graph(vec![
            ("a", ResourceDeclaration::new("thing").depends_on("b")),
            ("b", ResourceDeclaration::new("other")),
        ]);
        let mut state = StateSnapshot::new("p", "dev");
        record(&mut state, "a", "old", &[]);
        record(&mut state, "b", "older", &["a"]);

        let err = plan_for(&g, Some(&state), SchemaRegistry::new()).expect_err("cycle among steps");
        assert!(err.to_string().contains("ordering constraints form a cycle"));
    }

    #[test]
    fn test_update_moves_off_before_old_dependency_is_deleted() {
        let g = graph(vec![
            ("new_subnet", ResourceDeclaration::new("subnet")),
            (
                "server",
                ResourceDeclaration::new("instance").with_attribute("subnet", "ref(new_subnet.id)"),
            ),
        ]);
        let mut state = StateSnapshot::new("p", "dev");
        record(&mut state, "new_subnet", "subnet", &[]);
        let mut server = ResourceRecord::new("server", "instance", "i-1");
        server.attributes.insert(String::from("subnet"), json!("old_subnet-id"));
        server.dependencies.insert(String::from("old_subnet"));
        state.upsert(server);
        record(&mut state, "old_subnet", "subnet", &[]);

        let plan = plan_for(&g, Some(&state), SchemaRegistry::new()).expect("plan");
        assert_eq!(
            plan.sequence(),
            vec![(ActionType::Update, "server"), (ActionType::Delete, "old_subnet")]
        );
    }

    #[test]
    fn test_unvalidated_cycle_resurfaces() {
        let g = ResourceGraph::from_nodes([
            ResourceNode::new("a", "t", BTreeMap::new(), BTreeSet::from([String::from("b")])),
            ResourceNode::new("b", "t", BTreeMap::new(), BTreeSet::from([String::from("a")])),
        ]);
        let err = Planner::new()
            .plan(&DiffResult::default(), &g, None)
            .expect_err("cycle");
        assert!(matches!(err, InfraError::Graph(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let g = graph(vec![
            ("c", ResourceDeclaration::new("t")),
            ("a", ResourceDeclaration::new("t")),
            ("b", ResourceDeclaration::new("t").depends_on("c")),
        ]);
        let first = plan_for(&g, None, SchemaRegistry::new()).expect("plan");
        let second = plan_for(&g, None, SchemaRegistry::new()).expect("plan");

        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(
            first.sequence(),
            vec![
                (ActionType::Create, "a"),
                (ActionType::Create, "c"),
                (ActionType::Create, "b"),
            ]
        );
    }
}
