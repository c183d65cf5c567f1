//! Graph construction as an ordered pipeline of transform passes.
//!
//! Each pass takes the graph so far plus the build context and adds
//! nodes or edges (or prunes, for targeting). The pipeline differs by
//! purpose: a validate graph needs no state-derived nodes, and an apply
//! graph is built elsewhere from the plan's change set.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::addrs::{ConfigResource, ModulePath, Reference, Target};
use crate::config::Config;
use crate::error::{ConfigError, Diagnostic, Diagnostics, LatticeError};
use crate::plan::PlanMode;
use crate::state::State;

use super::graph::{Graph, NodeId};
use super::node::{GraphNode, OrphanReason};

/// What the graph being built is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphPurpose {
    Plan,
    /// Like plan, but state-derived nodes are omitted.
    Validate,
}

/// Inputs shared by every pass.
pub struct TransformContext<'a> {
    pub config: &'a Config,
    pub state: &'a State,
    pub purpose: GraphPurpose,
    /// The planning mode; destroy mode changes both edge direction and
    /// targeting semantics.
    pub mode: PlanMode,
    pub targets: &'a [Target],
}

/// One pass of the construction pipeline.
pub trait GraphTransform {
    fn name(&self) -> &'static str;

    /// Applies this pass, appending any problems to `diags`. Passes run
    /// in order; a pass does not run if an earlier one produced errors.
    fn transform(&self, graph: &mut Graph, ctx: &TransformContext<'_>, diags: &mut Diagnostics);
}

/// Builds a graph for the given purpose, running the standard pipeline.
/// Warnings accumulate in `diags` either way; `None` means a pass
/// produced errors and the graph is unusable.
pub fn build_graph(ctx: &TransformContext<'_>, diags: &mut Diagnostics) -> Option<Graph> {
    let passes: Vec<Box<dyn GraphTransform>> = vec![
        Box::new(ConfigTransform),
        Box::new(OrphanTransform),
        Box::new(ReferenceTransform),
        Box::new(TargetTransform),
        Box::new(DestroyEdgeTransform),
        Box::new(RootTransform),
        Box::new(AcyclicityCheck),
    ];

    let mut graph = Graph::new();
    for pass in passes {
        pass.transform(&mut graph, ctx, diags);
        debug!(pass = pass.name(), nodes = graph.len(), "graph transform applied");
        if diags.has_errors() {
            return None;
        }
    }
    Some(graph)
}

/// Adds one node per configuration declaration: module expansions,
/// named values, providers, and resource expand nodes.
struct ConfigTransform;

impl GraphTransform for ConfigTransform {
    fn name(&self) -> &'static str {
        "config"
    }

    fn transform(&self, graph: &mut Graph, ctx: &TransformContext<'_>, _diags: &mut Diagnostics) {
        ctx.config.walk_modules(|path, module| {
            if !path.is_root() {
                graph.add_node(GraphNode::ModuleExpand { path: path.clone() });
            }
            for name in module.variables.keys() {
                graph.add_node(GraphNode::Variable {
                    module: path.clone(),
                    name: name.clone(),
                });
            }
            for name in module.locals.keys() {
                graph.add_node(GraphNode::Local {
                    module: path.clone(),
                    name: name.clone(),
                });
            }
            for name in module.outputs.keys() {
                graph.add_node(GraphNode::Output {
                    module: path.clone(),
                    name: name.clone(),
                });
            }
            if path.is_root() {
                for name in module.providers.keys() {
                    graph.add_node(GraphNode::Provider { name: name.clone() });
                }
            }
            for rc in module.resources.values() {
                graph.add_node(GraphNode::ResourceExpand {
                    addr: rc.resource.in_module(path.clone()),
                });
            }
        });
    }
}

/// Adds orphan nodes for state instances whose configuration block is
/// gone entirely. Instances whose block still exists are handled by the
/// block's own expand node, which can see its current repetition.
struct OrphanTransform;

impl GraphTransform for OrphanTransform {
    fn name(&self) -> &'static str {
        "orphans"
    }

    fn transform(&self, graph: &mut Graph, ctx: &TransformContext<'_>, _diags: &mut Diagnostics) {
        if ctx.purpose == GraphPurpose::Validate {
            return;
        }
        for addr in ctx.state.all_instance_addrs() {
            let config_addr = addr.config_resource();
            if ctx.config.resource(&config_addr).is_some() {
                continue;
            }
            let module_exists = ctx.config.module_at(&config_addr.module).is_some();
            let reason = if module_exists {
                OrphanReason::NoResourceConfig
            } else {
                OrphanReason::NoModule
            };
            let forget = removed_without_destroy(ctx.config, &config_addr);
            graph.add_node(GraphNode::OrphanInstance {
                addr,
                forget,
                reason,
            });
        }
    }
}

/// Returns true if a removed block covers the resource and asks for its
/// state to be discarded rather than the object destroyed.
pub fn removed_without_destroy(config: &Config, addr: &ConfigResource) -> bool {
    config
        .module_at(&addr.module)
        .and_then(|m| m.removed_block(&addr.resource))
        .is_some_and(|block| !block.destroy)
}

/// Connects nodes along the references their expressions make, plus the
/// structural edges: module expansion before module contents, provider
/// before resource.
struct ReferenceTransform;

/// Index of reference providers: which node satisfies which reference
/// key in which module scope, plus the output nodes of each module for
/// wiring `module.call` references.
struct ReferenceIndex {
    by_key: BTreeMap<(ModulePath, String), NodeId>,
    outputs_by_module: BTreeMap<ModulePath, Vec<NodeId>>,
}

impl ReferenceTransform {
    fn build_index(graph: &Graph) -> ReferenceIndex {
        let mut by_key = BTreeMap::new();
        let mut outputs_by_module: BTreeMap<ModulePath, Vec<NodeId>> = BTreeMap::new();
        for id in graph.node_ids() {
            let entry = match graph.node(id) {
                GraphNode::Variable { module, name } => {
                    Some((module.clone(), format!("var.{name}")))
                }
                GraphNode::Local { module, name } => {
                    Some((module.clone(), format!("local.{name}")))
                }
                GraphNode::ModuleExpand { path } => path
                    .parent()
                    .and_then(|parent| {
                        path.steps()
                            .last()
                            .map(|call| (parent, format!("module.{call}")))
                    }),
                GraphNode::Provider { name } => {
                    Some((ModulePath::root(), format!("provider.{name}")))
                }
                GraphNode::ResourceExpand { addr } => {
                    Some((addr.module.clone(), addr.resource.to_string()))
                }
                GraphNode::Output { module, .. } => {
                    outputs_by_module.entry(module.clone()).or_default().push(id);
                    None
                }
                _ => None,
            };
            if let Some(key) = entry {
                by_key.insert(key, id);
            }
        }
        ReferenceIndex {
            by_key,
            outputs_by_module,
        }
    }

    fn reference_key(reference: &Reference) -> Option<String> {
        match reference {
            Reference::Resource(r) | Reference::ResourceInstance(r, _) => Some(r.to_string()),
            Reference::InputVariable(name) => Some(format!("var.{name}")),
            Reference::LocalValue(name) => Some(format!("local.{name}")),
            Reference::ModuleCall(name) => Some(format!("module.{name}")),
            // Builtins and repetition symbols resolve within the node
            // itself and need no edge.
            _ => None,
        }
    }

    fn connect(
        graph: &mut Graph,
        index: &ReferenceIndex,
        node: NodeId,
        module: &ModulePath,
        references: &[Reference],
        diags: &mut Diagnostics,
    ) {
        for reference in references {
            let Some(key) = Self::reference_key(reference) else {
                continue;
            };
            match index.by_key.get(&(module.clone(), key)) {
                Some(&target) => {
                    graph.add_dependency(node, target);
                    // Referencing a module call means consuming its
                    // outputs, so the referrer waits on those too.
                    if let Reference::ModuleCall(call) = reference {
                        let child = module.child(call.clone());
                        if let Some(outputs) = index.outputs_by_module.get(&child) {
                            for &output in outputs {
                                graph.add_dependency(node, output);
                            }
                        }
                    }
                }
                None => diags.push_error(&LatticeError::Config(
                    ConfigError::UndeclaredReference {
                        reference: reference.to_string(),
                        module: module.to_string(),
                    },
                )),
            }
        }
    }
}

impl GraphTransform for ReferenceTransform {
    fn name(&self) -> &'static str {
        "references"
    }

    fn transform(&self, graph: &mut Graph, ctx: &TransformContext<'_>, diags: &mut Diagnostics) {
        let index = Self::build_index(graph);

        // Structural edges and reference edges per node.
        for id in graph.node_ids().collect::<Vec<_>>() {
            let node = graph.node(id).clone();

            // Everything scoped to a non-root module runs after that
            // module's expansion is known.
            if let Some(scope) = node.module_scope() {
                let mut path = scope.clone();
                while !path.is_root() {
                    if let Some(&expand) = index
                        .by_key
                        .get(&(path.parent().unwrap_or_default(), format!(
                            "module.{}",
                            path.steps().last().cloned().unwrap_or_default()
                        )))
                    {
                        graph.add_dependency(id, expand);
                    }
                    match path.parent() {
                        Some(parent) => path = parent,
                        None => break,
                    }
                }
            }

            match &node {
                GraphNode::ModuleExpand { path } => {
                    let Some(parent) = path.parent() else { continue };
                    let Some(call_name) = path.steps().last() else { continue };
                    let Some(parent_module) = ctx.config.module_at(&parent) else { continue };
                    let Some(call) = parent_module.module_calls.get(call_name) else { continue };
                    Self::connect(graph, &index, id, &parent, &call.references(), diags);
                }
                GraphNode::Variable { module, name } => {
                    // A child variable's value comes from the call input
                    // expression in the parent scope.
                    let Some(parent) = module.parent() else { continue };
                    let Some(call_name) = module.steps().last() else { continue };
                    let Some(parent_module) = ctx.config.module_at(&parent) else { continue };
                    let Some(call) = parent_module.module_calls.get(call_name) else { continue };
                    if let Some(input) = call.inputs.get(name) {
                        Self::connect(graph, &index, id, &parent, &input.references(), diags);
                    }
                }
                GraphNode::Local { module, name } => {
                    let Some(m) = ctx.config.module_at(module) else { continue };
                    if let Some(expr) = m.locals.get(name) {
                        Self::connect(graph, &index, id, module, &expr.references(), diags);
                    }
                }
                GraphNode::Output { module, name } => {
                    let Some(m) = ctx.config.module_at(module) else { continue };
                    if let Some(output) = m.outputs.get(name) {
                        Self::connect(graph, &index, id, module, &output.value.references(), diags);
                    }
                }
                GraphNode::Provider { name } => {
                    if let Some(pc) = ctx.config.root.providers.get(name) {
                        Self::connect(
                            graph,
                            &index,
                            id,
                            &ModulePath::root(),
                            &pc.config.references(),
                            diags,
                        );
                    }
                }
                GraphNode::ResourceExpand { addr } => {
                    let Some(rc) = ctx.config.resource(addr) else { continue };
                    Self::connect(graph, &index, id, &addr.module, &rc.references(), diags);
                    if let Some(&provider) = index
                        .by_key
                        .get(&(ModulePath::root(), format!("provider.{}", rc.provider)))
                    {
                        graph.add_dependency(id, provider);
                    }
                }
                GraphNode::OrphanInstance { addr, .. } => {
                    // Orphan deletes still need their provider, named by
                    // the type prefix since the block is gone.
                    let provider = default_provider_for(&addr.resource.resource.r#type);
                    if let Some(&node) = index
                        .by_key
                        .get(&(ModulePath::root(), format!("provider.{provider}")))
                    {
                        graph.add_dependency(id, node);
                    }
                }
                _ => {}
            }
        }
    }
}

/// The implied provider name for a resource type: the portion before
/// the first underscore (`test_thing` implies provider `test`).
#[must_use]
pub fn default_provider_for(type_name: &str) -> &str {
    type_name.split('_').next().unwrap_or(type_name)
}

/// Prunes the graph to the targeted resources plus everything they
/// depend on.
struct TargetTransform;

impl GraphTransform for TargetTransform {
    fn name(&self) -> &'static str {
        "targeting"
    }

    fn transform(&self, graph: &mut Graph, ctx: &TransformContext<'_>, diags: &mut Diagnostics) {
        if ctx.targets.is_empty() {
            return;
        }

        let mut matched: BTreeSet<usize> = BTreeSet::new();
        let mut seeds: Vec<NodeId> = Vec::new();
        for id in graph.node_ids() {
            let selected = match graph.node(id) {
                GraphNode::ResourceExpand { addr } => {
                    ctx.targets.iter().enumerate().any(|(i, target)| {
                        let hit = target_covers_config(target, addr);
                        if hit {
                            matched.insert(i);
                        }
                        hit
                    })
                }
                GraphNode::OrphanInstance { addr, .. } => {
                    ctx.targets.iter().enumerate().any(|(i, target)| {
                        let hit = target.matches_instance(addr);
                        if hit {
                            matched.insert(i);
                        }
                        hit
                    })
                }
                _ => false,
            };
            if selected {
                seeds.push(id);
            }
        }

        for (i, target) in ctx.targets.iter().enumerate() {
            if !matched.contains(&i) {
                warn!(target = %target, "target matches nothing in the current configuration or state");
                let err = LatticeError::Config(ConfigError::UnknownTarget {
                    target: target.clone(),
                });
                diags.push(Diagnostic::warning("Target matches nothing", err.to_string()));
            }
        }

        // Destroying a target must also destroy whatever depends on it,
        // so destroy mode keeps dependents where normal mode keeps
        // dependencies. Non-resource supports of the kept set come along
        // in both cases.
        let keep = if ctx.mode == PlanMode::Destroy {
            let mut keep = graph.descendants_of(&seeds);
            let kept: Vec<NodeId> = keep.iter().copied().collect();
            for id in graph.ancestors_of(&kept) {
                if !matches!(
                    graph.node(id),
                    GraphNode::ResourceExpand { .. } | GraphNode::OrphanInstance { .. }
                ) {
                    keep.insert(id);
                }
            }
            keep
        } else {
            graph.ancestors_of(&seeds)
        };
        debug!(targets = ctx.targets.len(), kept = keep.len(), total = graph.len(), "applied resource targeting");
        graph.retain(&keep);
    }
}

/// Returns true if a target could select instances of the given
/// configuration-level resource. Keys in the target are ignored at this
/// stage; instance-level filtering happens at expansion.
fn target_covers_config(target: &Target, addr: &ConfigResource) -> bool {
    match target {
        Target::Module(module) => {
            let path = module.module_path();
            path.steps().len() <= addr.module.steps().len()
                && addr.module.steps()[..path.steps().len()] == *path.steps()
        }
        Target::Resource(resource) => addr.matches(resource),
        Target::ResourceInstance(instance) => addr.matches(&instance.resource),
    }
}

/// Inverts resource ordering for destroy rounds: an object must be
/// destroyed before anything it depends on. Destroy never evaluates
/// resource bodies, so the value edges feeding them are dropped rather
/// than inverted; repetition edges stay forward, since expansion still
/// runs.
struct DestroyEdgeTransform;

impl GraphTransform for DestroyEdgeTransform {
    fn name(&self) -> &'static str {
        "destroy_edges"
    }

    fn transform(&self, graph: &mut Graph, ctx: &TransformContext<'_>, _diags: &mut Diagnostics) {
        if ctx.mode != PlanMode::Destroy {
            return;
        }
        let index = ReferenceTransform::build_index(graph);
        let mut drops: Vec<(NodeId, NodeId)> = Vec::new();
        let mut inversions: Vec<(NodeId, NodeId)> = Vec::new();

        for id in graph.node_ids().collect::<Vec<_>>() {
            match graph.node(id).clone() {
                GraphNode::ResourceExpand { addr } => {
                    let Some(rc) = ctx.config.resource(&addr) else {
                        continue;
                    };
                    let repetition: BTreeSet<String> = rc
                        .repetition
                        .references()
                        .iter()
                        .filter_map(ReferenceTransform::reference_key)
                        .collect();
                    for reference in rc.references() {
                        let Some(key) = ReferenceTransform::reference_key(&reference) else {
                            continue;
                        };
                        if repetition.contains(&key) {
                            continue;
                        }
                        let Some(&target) = index.by_key.get(&(addr.module.clone(), key)) else {
                            continue;
                        };
                        drops.push((id, target));
                        if matches!(graph.node(target), GraphNode::ResourceExpand { .. }) {
                            inversions.push((target, id));
                        }
                        if let Reference::ModuleCall(call) = &reference {
                            let child = addr.module.child(call.clone());
                            if let Some(outputs) = index.outputs_by_module.get(&child) {
                                for &output in outputs {
                                    drops.push((id, output));
                                }
                            }
                        }
                    }
                }
                GraphNode::OrphanInstance { addr, .. } => {
                    // Ordering against state-only objects comes from the
                    // dependencies recorded when they were created.
                    let recorded = ctx
                        .state
                        .instance(&addr)
                        .map(|o| o.dependencies.clone())
                        .unwrap_or_default();
                    for dep in recorded {
                        let key = (dep.module.clone(), dep.resource.to_string());
                        if let Some(&target) = index.by_key.get(&key) {
                            inversions.push((target, id));
                        }
                    }
                }
                _ => {}
            }
        }

        for (node, dep) in drops {
            graph.remove_dependency(node, dep);
        }
        for (node, dep) in inversions {
            graph.add_dependency(node, dep);
        }
        debug!("inverted resource edges for destroy ordering");
    }
}

/// Adds the single root node, depending on every sink.
struct RootTransform;

impl GraphTransform for RootTransform {
    fn name(&self) -> &'static str {
        "root"
    }

    fn transform(&self, graph: &mut Graph, _ctx: &TransformContext<'_>, _diags: &mut Diagnostics) {
        let sinks = graph.sinkless();
        let root = graph.add_node(GraphNode::Root);
        for sink in sinks {
            graph.add_dependency(root, sink);
        }
    }
}

/// Rejects graphs with dependency cycles.
struct AcyclicityCheck;

impl GraphTransform for AcyclicityCheck {
    fn name(&self) -> &'static str {
        "acyclicity"
    }

    fn transform(&self, graph: &mut Graph, _ctx: &TransformContext<'_>, diags: &mut Diagnostics) {
        if let Some(cycle) = graph.find_cycle() {
            let names: Vec<String> = cycle.iter().map(|&id| graph.node(id).name()).collect();
            diags.push_error(&LatticeError::Config(ConfigError::CircularDependency {
                cycle: names.join(" -> "),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{ModuleInstance, Reference, Resource};
    use crate::config::{Expr, Module, ResourceConfig};

    fn two_resource_config() -> Config {
        let mut root = Module::new();
        root.add_resource(ResourceConfig::managed("test_thing", "a"));
        root.add_resource(ResourceConfig::managed("test_thing", "b").with_config(
            Expr::Object(
                [(
                    String::from("from_a"),
                    Expr::attr(
                        Expr::reference(Reference::Resource(Resource::managed(
                            "test_thing",
                            "a",
                        ))),
                        "id",
                    ),
                )]
                .into(),
            ),
        ));
        Config::new(root)
    }

    fn build(config: &Config, state: &State, targets: &[Target]) -> Result<Graph, Diagnostics> {
        build_for(config, state, targets, PlanMode::Normal)
    }

    fn build_for(
        config: &Config,
        state: &State,
        targets: &[Target],
        mode: PlanMode,
    ) -> Result<Graph, Diagnostics> {
        let mut diags = Diagnostics::new();
        let graph = build_graph(
            &TransformContext {
                config,
                state,
                purpose: GraphPurpose::Plan,
                mode,
                targets,
            },
            &mut diags,
        );
        match graph {
            Some(graph) => Ok(graph),
            None => Err(diags),
        }
    }

    #[test]
    fn test_reference_edges_and_single_root() {
        let config = two_resource_config();
        let graph = build(&config, &State::new(), &[]).unwrap();

        let mut a = None;
        let mut b = None;
        let mut root = None;
        for id in graph.node_ids() {
            match graph.node(id) {
                GraphNode::ResourceExpand { addr } if addr.resource.name == "a" => a = Some(id),
                GraphNode::ResourceExpand { addr } if addr.resource.name == "b" => b = Some(id),
                GraphNode::Root => root = Some(id),
                _ => {}
            }
        }
        let (a, b, root) = (a.unwrap(), b.unwrap(), root.unwrap());
        assert!(graph.dependencies(b).any(|d| d == a));
        assert_eq!(graph.dependency_count(a), 0);
        assert!(graph.dependents(root).next().is_none());
    }

    #[test]
    fn test_undeclared_reference_is_an_error() {
        let mut root = Module::new();
        root.add_resource(ResourceConfig::managed("test_thing", "a").with_config(
            Expr::Object(
                [(
                    String::from("v"),
                    Expr::reference(Reference::InputVariable(String::from("missing"))),
                )]
                .into(),
            ),
        ));
        let config = Config::new(root);
        let err = build(&config, &State::new(), &[]).unwrap_err();
        assert!(err.has_errors());
    }

    #[test]
    fn test_cycle_is_an_error() {
        let mut root = Module::new();
        root.add_resource(ResourceConfig::managed("test_thing", "a").with_config(
            Expr::Object(
                [(
                    String::from("v"),
                    Expr::reference(Reference::Resource(Resource::managed("test_thing", "b"))),
                )]
                .into(),
            ),
        ));
        root.add_resource(ResourceConfig::managed("test_thing", "b").with_config(
            Expr::Object(
                [(
                    String::from("v"),
                    Expr::reference(Reference::Resource(Resource::managed("test_thing", "a"))),
                )]
                .into(),
            ),
        ));
        let config = Config::new(root);
        let err = build(&config, &State::new(), &[]).unwrap_err();
        assert!(err.errors().iter().any(|d| d.summary.contains("circular")
            || d.detail.contains("test_thing.a")));
    }

    #[test]
    fn test_targeting_prunes_and_warns_on_miss() {
        let config = two_resource_config();

        // Targeting b keeps a (its dependency); targeting a drops b.
        let target_a = Target::Resource(
            Resource::managed("test_thing", "a").absolute(ModuleInstance::root()),
        );
        let graph = build(&config, &State::new(), &[target_a]).unwrap();
        let names: Vec<String> = graph.node_ids().map(|id| graph.node(id).name()).collect();
        assert!(names.iter().any(|n| n.starts_with("test_thing.a")));
        assert!(!names.iter().any(|n| n.starts_with("test_thing.b")));

        let miss = Target::Resource(
            Resource::managed("test_thing", "nope").absolute(ModuleInstance::root()),
        );
        let graph = build(&config, &State::new(), &[miss]);
        // A miss is a warning, not an error, and everything else is
        // pruned.
        let graph = graph.unwrap();
        assert_eq!(
            graph
                .node_ids()
                .filter(|&id| !matches!(graph.node(id), GraphNode::Root))
                .count(),
            0
        );
    }

    #[test]
    fn test_destroy_mode_inverts_resource_edges() {
        let config = two_resource_config();
        let graph = build_for(&config, &State::new(), &[], PlanMode::Destroy).unwrap();

        let mut a = None;
        let mut b = None;
        for id in graph.node_ids() {
            match graph.node(id) {
                GraphNode::ResourceExpand { addr } if addr.resource.name == "a" => a = Some(id),
                GraphNode::ResourceExpand { addr } if addr.resource.name == "b" => b = Some(id),
                _ => {}
            }
        }
        let (a, b) = (a.unwrap(), b.unwrap());
        // b references a, so destroying runs b before a.
        assert!(graph.dependencies(a).any(|d| d == b));
        assert!(!graph.dependencies(b).any(|d| d == a));
    }

    #[test]
    fn test_destroy_targeting_keeps_dependents() {
        let config = two_resource_config();
        let target_a = Target::Resource(
            Resource::managed("test_thing", "a").absolute(ModuleInstance::root()),
        );
        let graph =
            build_for(&config, &State::new(), &[target_a], PlanMode::Destroy).unwrap();
        let names: Vec<String> = graph.node_ids().map(|id| graph.node(id).name()).collect();
        // b depends on a, so destroying a must take b down too.
        assert!(names.iter().any(|n| n.starts_with("test_thing.a")));
        assert!(names.iter().any(|n| n.starts_with("test_thing.b")));
    }

    #[test]
    fn test_destroy_orders_state_orphans_by_recorded_dependencies() {
        use crate::state::ResourceInstanceObject;
        use crate::value::Value;

        // An object whose config is gone recorded a dependency on a at
        // creation time; a's expand must wait for its destruction.
        let mut state = State::new();
        let gone = Resource::managed("test_thing", "gone")
            .absolute(ModuleInstance::root())
            .instance(crate::addrs::InstanceKey::NoKey);
        let mut object = ResourceInstanceObject::ready(Value::null());
        object.dependencies =
            vec![Resource::managed("test_thing", "a").in_module(ModulePath::root())];
        state.set_instance(gone.clone(), object);

        let mut root = Module::new();
        root.add_resource(ResourceConfig::managed("test_thing", "a"));
        let config = Config::new(root);
        let graph = build_for(&config, &state, &[], PlanMode::Destroy).unwrap();

        let mut a = None;
        let mut orphan = None;
        for id in graph.node_ids() {
            match graph.node(id) {
                GraphNode::ResourceExpand { addr } if addr.resource.name == "a" => a = Some(id),
                GraphNode::OrphanInstance { addr, .. } if *addr == gone => orphan = Some(id),
                _ => {}
            }
        }
        let (a, orphan) = (a.unwrap(), orphan.unwrap());
        assert!(graph.dependencies(a).any(|d| d == orphan));
    }

    #[test]
    fn test_orphans_for_vanished_config() {
        use crate::state::ResourceInstanceObject;
        use crate::value::Value;

        let mut state = State::new();
        let gone = Resource::managed("test_thing", "gone")
            .absolute(ModuleInstance::root())
            .instance(crate::addrs::InstanceKey::NoKey);
        state.set_instance(gone.clone(), ResourceInstanceObject::ready(Value::null()));

        let config = Config::new(Module::new());
        let graph = build(&config, &state, &[]).unwrap();
        assert!(graph.node_ids().any(|id| matches!(
            graph.node(id),
            GraphNode::OrphanInstance { addr, reason: OrphanReason::NoResourceConfig, .. } if *addr == gone
        )));
    }
}
