// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![warn(missing_docs)]                // All public items should be documented

// Clippy lints (warnings only)
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::redundant_clone)]     // Useless clones warning

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Lattice
//!
//! A dependency-graph planning and apply engine for declarative
//! infrastructure.
//!
//! ## Overview
//!
//! Lattice takes a desired configuration (modules, resources, data
//! sources, variables, outputs) and a record of what was previously
//! created, and drives the two-round cycle familiar from
//! infrastructure-as-code tools:
//!
//! - **Plan**: refresh prior objects through their providers, expand
//!   `count`/`for_each` repetition into concrete instances, and diff
//!   desired against actual into a set of proposed changes
//! - **Apply**: carry those changes out in dependency order, resolving
//!   values that were unknown at plan time
//!
//! Work whose shape cannot be decided yet (an unknown instance count,
//! an unconfigured provider) is *deferred* to a later round instead of
//! failing, so partially-known configurations still converge.
//!
//! ## Architecture
//!
//! Every round is a walk over a dependency graph:
//!
//! 1. **Transform**: a pipeline of graph transforms turns the
//!    configuration and state into nodes and edges
//! 2. **Walk**: nodes are visited concurrently once their dependencies
//!    finish; resource nodes expand into per-instance subgraphs at
//!    walk time, when repetition values are known
//! 3. **Evaluate**: expressions resolve against planned changes first,
//!    then state, propagating unknown and sensitive marks
//!
//! ## Modules
//!
//! - [`addrs`]: typed addresses for modules, resources, and instances
//! - [`config`]: the static configuration tree and expression AST
//! - [`defer`]: tracking of work postponed to a later round
//! - [`engine`]: the plan/apply entry points
//! - [`error`]: error types and user-facing diagnostics
//! - [`eval`]: expression evaluation against live walk data
//! - [`expand`]: repetition expansion into instance keys
//! - [`graph`]: the graph structure, transforms, and parallel walker
//! - [`plan`]: the plan model: changes, checks, deferrals
//! - [`provider`]: the provider trait and an in-memory mock
//! - [`state`]: the record of created objects and its async wrapper
//! - [`value`]: the dynamic value model with marks and refinements

// ============================================================================
// Modules
// ============================================================================

pub mod addrs;
pub mod config;
pub mod defer;
pub mod engine;
pub mod error;
pub mod eval;
pub mod expand;
pub mod graph;
pub mod plan;
pub mod provider;
pub mod state;
pub mod value;

// ============================================================================
// Re-exports
// ============================================================================

pub use addrs::{
    AbsResource, AbsResourceInstance, ConfigResource, InstanceKey, ModuleInstance, ModulePath,
    Reference, Resource, ResourceMode, Target,
};
pub use config::{Config, Expr, Module, Repetition, ResourceConfig};
pub use defer::DeferredReason;
pub use engine::{ApplyOpts, Lattice, PlanOpts};
pub use error::{Diagnostic, Diagnostics, LatticeError, Result};
pub use graph::{signal_channel, WalkSignal};
pub use plan::{Action, Plan, PlanMode, ResourceInstanceChange};
pub use provider::{MockProvider, Provider};
pub use state::{State, SyncState};
pub use value::Value;
