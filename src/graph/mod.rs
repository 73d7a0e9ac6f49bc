//! Resource graph module.
//!
//! This module turns resource declarations into a validated dependency
//! graph:
//! - Symbolic `ref(<name>.<attribute>)` references and their substitution
//! - Inferred and explicit dependency edges
//! - Cycle detection and deterministic topological ordering

mod builder;
mod reference;
mod types;

pub use builder::GraphBuilder;
pub use reference::{ID_ATTRIBUTE, Reference, extract_references, has_references, substitute};
pub use types::{ResourceGraph, ResourceNode};
