//! Graph node roles.
//!
//! The node set is a closed enum: every behavior the walk can dispatch
//! on is a variant here, not an open trait hierarchy, so the transform
//! passes and the visitors can match exhaustively.

use crate::addrs::{AbsResourceInstance, ConfigResource, ModulePath, PartialExpandedResource};

/// One vertex of the dependency graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    /// The single sink every other node ultimately feeds.
    Root,
    /// Resolves the repetition of the module call ending `path`,
    /// registering the expansion for every instance of the parent.
    ModuleExpand { path: ModulePath },
    /// Evaluates an input variable for every instance of its module.
    Variable { module: ModulePath, name: String },
    /// Evaluates a local value for every instance of its module.
    Local { module: ModulePath, name: String },
    /// Evaluates an output value for every instance of its module.
    Output { module: ModulePath, name: String },
    /// Evaluates one provider configuration.
    Provider { name: String },
    /// Resolves a resource's repetition and expands, at walk time, into
    /// per-instance subgraph nodes.
    ResourceExpand { addr: ConfigResource },
    /// Plans one concrete resource instance that is desired by
    /// configuration.
    ResourceInstance {
        addr: AbsResourceInstance,
        /// Set for instances whose membership is undecidable this round
        /// (a maybe-orphan): refresh it, but never plan an action.
        refresh_only: bool,
    },
    /// Plans the removal of an instance present in state but no longer
    /// desired.
    OrphanInstance {
        addr: AbsResourceInstance,
        /// Discard from state instead of destroying.
        forget: bool,
        reason: OrphanReason,
    },
    /// Records a placeholder deferred change for a whole unexpanded
    /// address prefix.
    PartialExpanded {
        addr: PartialExpandedResource,
        config: ConfigResource,
    },
}

/// Why an instance in state is no longer desired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanReason {
    /// The whole resource block is gone from configuration.
    NoResourceConfig,
    /// The containing module instance no longer exists.
    NoModule,
    /// The instance key is outside the current count/for_each.
    WrongRepetition,
}

impl GraphNode {
    /// A stable display name for logs and cycle reports.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Root => String::from("root"),
            Self::ModuleExpand { path } => format!("{path} (expand)"),
            Self::Variable { module, name } => scoped(module, &format!("var.{name}")),
            Self::Local { module, name } => scoped(module, &format!("local.{name}")),
            Self::Output { module, name } => scoped(module, &format!("output.{name}")),
            Self::Provider { name } => format!("provider.{name}"),
            Self::ResourceExpand { addr } => format!("{addr} (expand)"),
            Self::ResourceInstance { addr, refresh_only } => {
                if *refresh_only {
                    format!("{addr} (refresh only)")
                } else {
                    addr.to_string()
                }
            }
            Self::OrphanInstance { addr, forget, .. } => {
                if *forget {
                    format!("{addr} (forget)")
                } else {
                    format!("{addr} (orphan)")
                }
            }
            Self::PartialExpanded { addr, .. } => format!("{addr} (deferred)"),
        }
    }

    /// The static module path whose expansion this node needs resolved
    /// before it can run, if any.
    #[must_use]
    pub fn module_scope(&self) -> Option<ModulePath> {
        match self {
            Self::ModuleExpand { path } => path.parent(),
            Self::Variable { module, .. }
            | Self::Local { module, .. }
            | Self::Output { module, .. } => Some(module.clone()),
            Self::ResourceExpand { addr } => Some(addr.module.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Display for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn scoped(module: &ModulePath, leaf: &str) -> String {
    if module.is_root() {
        leaf.to_string()
    } else {
        format!("{module}.{leaf}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{ModulePath, Resource};

    #[test]
    fn test_node_names() {
        let module = ModulePath::root().child("net");
        let node = GraphNode::Variable {
            module: module.clone(),
            name: String::from("cidr"),
        };
        assert_eq!(node.name(), "module.net.var.cidr");

        let expand = GraphNode::ResourceExpand {
            addr: Resource::managed("test_thing", "a").in_module(ModulePath::root()),
        };
        assert_eq!(expand.name(), "test_thing.a (expand)");
    }

    #[test]
    fn test_module_scope() {
        let node = GraphNode::ModuleExpand {
            path: ModulePath::root().child("net"),
        };
        assert_eq!(node.module_scope(), Some(ModulePath::root()));
        assert_eq!(GraphNode::Root.module_scope(), None);
    }
}
