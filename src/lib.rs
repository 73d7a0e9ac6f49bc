// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Infra
//!
//! A declarative, idempotent infrastructure reconciliation engine.
//!
//! ## Overview
//!
//! Resources are declared in `halldyll.infra.yaml` with a type tag and
//! attributes. Attributes may reference other resources' outputs with
//! `ref(<name>.<attribute>)`; every reference is also a dependency edge.
//! Each pass turns the declarations into provider side effects and records
//! enough state to compute the next pass.
//!
//! ## Architecture
//!
//! 1. **Graph**: declarations become a validated, acyclic resource graph
//! 2. **State**: the last applied snapshot, loaded under a single-writer lock
//! 3. **Diff**: each resource is classified as create, update, replace,
//!    delete, or no-op
//! 4. **Plan**: steps ordered dependencies-first for creation and
//!    dependents-first for deletion
//! 5. **Execute**: steps dispatched concurrently as their predecessors
//!    succeed, with retries and partial-failure isolation
//!
//! ## Modules
//!
//! - [`config`]: Declaration parsing and validation
//! - [`graph`]: Resource graph construction and reference handling
//! - [`state`]: State storage backends (local, S3)
//! - [`planner`]: Diff computation, planning, and execution
//! - [`provider`]: Provider adapter trait and shipped adapters
//! - [`reconciler`]: One locked reconciliation pass
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: prod
//!
//! schemas:
//!   instance:
//!     immutable: [image]
//!
//! resources:
//!   network:
//!     type: vpc
//!     attributes:
//!       cidr: 10.0.0.0/16
//!   server:
//!     type: instance
//!     attributes:
//!       subnet: ref(network.id)
//!       image: ubuntu-24.04
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, InfraConfig};
pub use error::{InfraError, Result};
pub use graph::{GraphBuilder, ResourceGraph, ResourceNode};
pub use planner::{DiffEngine, ExecutionPlan, PlanExecutor, Planner};
pub use provider::{HttpProvider, MemoryProvider, ProviderRegistry, ResourceProvider};
pub use reconciler::{ReconciliationResult, Reconciler};
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
