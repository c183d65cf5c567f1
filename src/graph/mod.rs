//! Dependency graph construction and execution.

mod graph;
mod node;
mod transform;
mod walk;

pub use graph::{Graph, NodeId};
pub use node::{GraphNode, OrphanReason};
pub use transform::{
    build_graph, default_provider_for, removed_without_destroy, GraphPurpose, GraphTransform,
    TransformContext,
};
pub use walk::{
    signal_channel, walk, NodeStatus, NodeVisitor, Subgraph, VisitResult, WalkOptions, WalkReport,
    WalkSignal,
};
