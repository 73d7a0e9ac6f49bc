//! Resource graph types.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::GraphError;

use super::reference::{Reference, extract_references};

/// A desired resource with its dependency edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Unique logical name.
    pub name: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Desired attributes, references still symbolic.
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Dependencies declared with `dependsOn`.
    pub explicit_dependencies: BTreeSet<String>,
    /// Dependencies inferred from attribute references.
    pub inferred_dependencies: BTreeSet<String>,
}

impl ResourceNode {
    /// Creates a node and infers its dependencies from its attributes.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        resource_type: impl Into<String>,
        attributes: BTreeMap<String, serde_json::Value>,
        explicit_dependencies: BTreeSet<String>,
    ) -> Self {
        let inferred_dependencies = attributes
            .values()
            .flat_map(extract_references)
            .map(|r| r.target)
            .collect();

        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            attributes,
            explicit_dependencies,
            inferred_dependencies,
        }
    }

    /// Returns `type.name`, the address used in plan output.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }

    /// Returns explicit and inferred dependencies combined.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.explicit_dependencies
            .union(&self.inferred_dependencies)
            .cloned()
            .collect()
    }

    /// Returns every reference in the node's attributes.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        self.attributes.values().flat_map(extract_references).collect()
    }
}

/// A set of desired resources keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceGraph {
    nodes: BTreeMap<String, ResourceNode>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl ResourceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a graph from nodes without checking edges.
    ///
    /// Use [`ResourceGraph::validate`] or the graph builder before relying
    /// on the graph being acyclic.
    #[must_use]
    pub fn from_nodes(nodes: impl IntoIterator<Item = ResourceNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
        }
    }

    /// Returns a node by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceNode> {
        self.nodes.get(name)
    }

    /// Returns true if a node exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Iterates nodes in lexical order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Iterates node names in lexical order.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the names of nodes that depend directly on `name`.
    #[must_use]
    pub fn dependents(&self, name: &str) -> BTreeSet<String> {
        self.nodes
            .values()
            .filter(|n| n.explicit_dependencies.contains(name) || n.inferred_dependencies.contains(name))
            .map(|n| n.name.clone())
            .collect()
    }

    /// Checks that every edge targets a node and that there are no cycles.
    ///
    /// # Errors
    ///
    /// Returns `UnknownReference` for a dangling edge, or `Cycle` with the
    /// full cycle path.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            for dep in node.dependencies() {
                if !self.nodes.contains_key(&dep) {
                    return Err(GraphError::UnknownReference {
                        from: node.name.clone(),
                        to: dep,
                    });
                }
            }
        }

        match self.find_cycle() {
            Some(path) => Err(GraphError::Cycle { path }),
            None => Ok(()),
        }
    }

    /// Returns node names with every dependency before its dependents.
    ///
    /// Among nodes that are ready at the same time the lexically smallest
    /// comes first.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`ResourceGraph::validate`].
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        self.validate()?;

        let mut waiting_on: BTreeMap<&str, usize> = BTreeMap::new();
        let mut unblocks: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for node in self.nodes.values() {
            let deps = node.dependencies();
            waiting_on.insert(node.name.as_str(), deps.len());
            for dep in deps {
                unblocks.entry(dep).or_default().push(node.name.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = waiting_on
            .iter()
            .filter(|(_, waiting)| **waiting == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(next) = ready.pop_first() {
            for &dependent in unblocks.get(next).into_iter().flatten() {
                if let Some(waiting) = waiting_on.get_mut(dependent) {
                    *waiting -= 1;
                    if *waiting == 0 {
                        ready.insert(dependent);
                    }
                }
            }
            order.push(next.to_string());
        }

        Ok(order)
    }

    /// Depth-first search with a recursion-stack marker.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        let mut stack: Vec<&str> = Vec::new();

        for name in self.nodes.keys() {
            if !marks.contains_key(name.as_str()) {
                if let Some(path) = self.visit(name, &mut marks, &mut stack) {
                    return Some(path);
                }
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        let node = self.nodes.get(name)?;
        marks.insert(name, Mark::Visiting);
        stack.push(name);

        let deps = node.explicit_dependencies.union(&node.inferred_dependencies);
        for dep in deps {
            let Some((key, _)) = self.nodes.get_key_value(dep.as_str()) else {
                continue;
            };
            match marks.get(key.as_str()) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == key.as_str()).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..].iter().map(|n| (*n).to_string()).collect();
                    path.push(key.clone());
                    return Some(path);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(path) = self.visit(key, marks, stack) {
                        return Some(path);
                    }
                }
            }
        }

        stack.pop();
        marks.insert(name, Mark::Done);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(name: &str, deps: &[&str]) -> ResourceNode {
        ResourceNode::new(
            name,
            "thing",
            BTreeMap::new(),
            deps.iter().map(|d| (*d).to_string()).collect(),
        )
    }

    #[test]
    fn test_inferred_dependencies() {
        let mut attrs = BTreeMap::new();
        attrs.insert(String::from("subnet"), json!("ref(network.id)"));
        attrs.insert(String::from("sg"), json!(["ref(firewall.id)"]));
        let n = ResourceNode::new("server", "instance", attrs, BTreeSet::new());

        assert_eq!(
            n.inferred_dependencies,
            BTreeSet::from([String::from("firewall"), String::from("network")])
        );
        assert_eq!(n.address(), "instance.server");
    }

    #[test]
    fn test_topological_order_dependencies_first() {
        let graph = ResourceGraph::from_nodes([
            node("app", &["db", "network"]),
            node("db", &["network"]),
            node("network", &[]),
            node("dns", &[]),
        ]);
        let order = graph.topological_order().expect("acyclic");
        assert_eq!(order, vec!["dns", "network", "db", "app"]);
    }

    #[test]
    fn test_topological_order_of_large_graph() {
        // Chain named against lexical order, plus a fan hanging off its end.
        let chain: Vec<String> = (0..2000).map(|i| format!("c{:04}", 1999 - i)).collect();
        let mut nodes: Vec<ResourceNode> = chain
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let deps: Vec<&str> = if i == 0 { Vec::new() } else { vec![chain[i - 1].as_str()] };
                node(name, &deps)
            })
            .collect();
        let tail = chain[chain.len() - 1].as_str();
        nodes.extend((0..2000).map(|i| node(&format!("f{i:04}"), &[tail])));
        let graph = ResourceGraph::from_nodes(nodes);

        let order = graph.topological_order().expect("acyclic");

        assert_eq!(order.len(), 4000);
        assert_eq!(order[..2000], chain[..]);
        assert_eq!(order[2000], "f0000");
        assert_eq!(order[3999], "f1999");
    }

    #[test]
    fn test_cycle_path_repeats_first_node() {
        let graph = ResourceGraph::from_nodes([node("a", &["b"]), node("b", &["a"])]);
        let err = graph.validate().expect_err("cyclic");
        assert_eq!(
            err,
            GraphError::Cycle {
                path: vec!["a".into(), "b".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_cycle_path_skips_acyclic_prefix() {
        let graph = ResourceGraph::from_nodes([
            node("a", &["b"]),
            node("b", &["c"]),
            node("c", &["d"]),
            node("d", &["b"]),
        ]);
        match graph.topological_order() {
            Err(GraphError::Cycle { path }) => assert_eq!(path, vec!["b", "c", "d", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let graph = ResourceGraph::from_nodes([node("a", &["a"])]);
        assert!(matches!(graph.validate(), Err(GraphError::Cycle { path }) if path == vec!["a", "a"]));
    }

    #[test]
    fn test_dangling_edge() {
        let graph = ResourceGraph::from_nodes([node("a", &["ghost"])]);
        assert_eq!(
            graph.validate(),
            Err(GraphError::UnknownReference {
                from: "a".into(),
                to: "ghost".into()
            })
        );
    }

    #[test]
    fn test_dependents() {
        let graph = ResourceGraph::from_nodes([
            node("network", &[]),
            node("server", &["network"]),
            node("lb", &["network", "server"]),
        ]);
        assert_eq!(
            graph.dependents("network"),
            BTreeSet::from([String::from("lb"), String::from("server")])
        );
        assert!(graph.dependents("lb").is_empty());
    }
}
