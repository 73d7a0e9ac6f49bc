//! Builds a validated resource graph from declarations.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::ResourceDeclaration;
use crate::error::GraphError;

use super::types::{ResourceGraph, ResourceNode};

/// Turns declarations into a validated [`ResourceGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds and validates the graph.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` or `EmptyType` for a malformed declaration,
    /// `UnknownReference` when a reference or `dependsOn` entry names an
    /// absent resource, and `Cycle` when the dependencies loop.
    pub fn build(
        &self,
        declarations: &BTreeMap<String, ResourceDeclaration>,
    ) -> Result<ResourceGraph, GraphError> {
        let mut nodes = Vec::with_capacity(declarations.len());

        for (name, declaration) in declarations {
            validate_name(name)?;

            if declaration.resource_type.trim().is_empty() {
                return Err(GraphError::EmptyType { name: name.clone() });
            }

            let explicit: BTreeSet<String> = declaration.depends_on.iter().cloned().collect();
            let node = ResourceNode::new(
                name.clone(),
                declaration.resource_type.clone(),
                declaration.attributes.clone(),
                explicit,
            );

            // Report the first dangling edge in lexical order
            if let Some(missing) = node
                .dependencies()
                .into_iter()
                .find(|dep| !declarations.contains_key(dep))
            {
                return Err(GraphError::UnknownReference {
                    from: name.clone(),
                    to: missing,
                });
            }

            nodes.push(node);
        }

        let graph = ResourceGraph::from_nodes(nodes);
        graph.validate()?;

        debug!("Built resource graph with {} nodes", graph.len());
        Ok(graph)
    }
}

/// Names must start with a letter and contain only letters, digits, `_`, `-`.
fn validate_name(name: &str) -> Result<(), GraphError> {
    let reason = match name.chars().next() {
        None => Some("name cannot be empty"),
        Some(c) if !c.is_ascii_alphabetic() => Some("name must start with a letter"),
        Some(_) if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') => {
            Some("only letters, digits, '_' and '-' are allowed")
        }
        Some(_) => None,
    };

    match reason {
        Some(reason) => Err(GraphError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}
