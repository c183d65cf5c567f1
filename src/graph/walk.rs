//! The bounded-parallel graph walker.
//!
//! A single owner task holds the graph and its bookkeeping; visits run
//! as spawned tasks gated by a semaphore, reporting back over a
//! channel. Because only the owner mutates the graph, walk-time
//! expansion (a visit returning new nodes) needs no locking: the owner
//! splices the subgraph in between completions.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, trace, warn};

use async_trait::async_trait;

use crate::error::Diagnostics;

use super::graph::{Graph, NodeId};
use super::node::GraphNode;

/// External control signal for a running walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkSignal {
    /// Normal operation.
    Run,
    /// Stop scheduling new nodes, let in-flight visits finish.
    Stop,
    /// Abandon the walk immediately.
    Cancel,
}

/// Creates the control channel for a walk, starting in the running
/// state.
#[must_use]
pub fn signal_channel() -> (watch::Sender<WalkSignal>, watch::Receiver<WalkSignal>) {
    watch::channel(WalkSignal::Run)
}

/// Tuning and control inputs for one walk.
pub struct WalkOptions {
    /// Maximum concurrent node visits.
    pub parallelism: usize,
    /// When true, a failed node does not skip its dependents; used for
    /// refresh-style walks where partial results are still useful.
    pub error_tolerant: bool,
    /// External control signal, or `None` for uninterruptible walks.
    pub signal: Option<watch::Receiver<WalkSignal>>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            parallelism: 10,
            error_tolerant: false,
            signal: None,
        }
    }
}

/// Terminal status of one node after the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Succeeded,
    Failed,
    /// Never visited: an ancestor failed, or the walk was stopped.
    Skipped,
}

/// A subgraph produced by a visit, spliced into the walk. Every new
/// node implicitly depends on the node that produced it; `edges` add
/// ordering between the new nodes themselves, `(a, b)` meaning node
/// index `a` depends on node index `b` within `nodes`.
#[derive(Debug, Default)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<(usize, usize)>,
}

impl Subgraph {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// What a visit produced. A visit with error diagnostics marks the
/// node failed and (unless the walk is error-tolerant) skips its
/// dependents.
#[derive(Debug, Default)]
pub struct VisitResult {
    pub diagnostics: Diagnostics,
    pub expansion: Option<Subgraph>,
}

impl VisitResult {
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_diagnostics(diagnostics: Diagnostics) -> Self {
        Self {
            diagnostics,
            expansion: None,
        }
    }

    #[must_use]
    pub fn with_expansion(expansion: Subgraph) -> Self {
        Self {
            diagnostics: Diagnostics::new(),
            expansion: Some(expansion),
        }
    }
}

/// The per-node behavior of a walk.
#[async_trait]
pub trait NodeVisitor: Send + Sync {
    async fn visit(&self, node: GraphNode) -> VisitResult;
}

/// Outcome of a whole walk.
#[derive(Debug)]
pub struct WalkReport {
    pub diagnostics: Diagnostics,
    /// Terminal status per node, keyed by node name.
    pub statuses: BTreeMap<String, NodeStatus>,
    /// False when the walk was stopped or cancelled before visiting
    /// everything.
    pub completed: bool,
}

impl WalkReport {
    /// Returns true if every visited node succeeded and the walk ran to
    /// the end.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.completed && !self.diagnostics.has_errors()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Pending,
    Running,
    Done(NodeStatus),
}

/// Walks the graph, visiting each node after all of its dependencies,
/// with at most `parallelism` visits in flight.
pub async fn walk(graph: Graph, visitor: Arc<dyn NodeVisitor>, opts: WalkOptions) -> WalkReport {
    let mut graph = graph;
    let mut marks: Vec<Mark> = vec![Mark::Pending; graph.len()];
    let mut remaining_deps: Vec<usize> =
        graph.node_ids().map(|id| graph.dependency_count(id)).collect();

    let semaphore = Arc::new(Semaphore::new(opts.parallelism.max(1)));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(NodeId, VisitResult)>();

    let mut signal = opts.signal;
    let mut diagnostics = Diagnostics::new();
    let mut in_flight = 0usize;
    let mut stopping = false;

    debug!(nodes = graph.len(), parallelism = opts.parallelism, "starting graph walk");

    loop {
        // Launch everything whose dependencies are satisfied.
        if !stopping {
            for id in graph.node_ids().collect::<Vec<_>>() {
                if marks[id.index()] == Mark::Pending && remaining_deps[id.index()] == 0 {
                    marks[id.index()] = Mark::Running;
                    in_flight += 1;
                    spawn_visit(
                        id,
                        graph.node(id).clone(),
                        Arc::clone(&visitor),
                        Arc::clone(&semaphore),
                        done_tx.clone(),
                    );
                }
            }
        }

        if in_flight == 0 {
            break;
        }

        // Wait for a completion or a control signal change.
        let completion = if let Some(rx) = signal.as_mut() {
            tokio::select! {
                completion = done_rx.recv() => completion,
                changed = rx.changed() => {
                    match changed {
                        Ok(()) => match *rx.borrow() {
                            WalkSignal::Run => {}
                            WalkSignal::Stop => {
                                if !stopping {
                                    info!("walk stopping; letting in-flight operations finish");
                                }
                                stopping = true;
                            }
                            WalkSignal::Cancel => {
                                warn!("walk cancelled; abandoning in-flight operations");
                                diagnostics.push_error(&crate::error::LatticeError::Cancelled(
                                    String::from(
                                        "the walk was abandoned before all in-flight work finished; state may be incomplete",
                                    ),
                                ));
                                return finish(graph, marks, diagnostics, false);
                            }
                        },
                        // Controller dropped; keep walking uninterrupted.
                        Err(_) => signal = None,
                    }
                    continue;
                }
            }
        } else {
            done_rx.recv().await
        };

        let Some((id, result)) = completion else {
            break;
        };
        in_flight -= 1;

        let failed = result.diagnostics.has_errors();
        diagnostics.extend(result.diagnostics);
        if failed {
            marks[id.index()] = Mark::Done(NodeStatus::Failed);
            if !opts.error_tolerant {
                skip_dependents(&graph, id, &mut marks);
            } else {
                release_dependents(&graph, id, &mut remaining_deps);
            }
            continue;
        }

        marks[id.index()] = Mark::Done(NodeStatus::Succeeded);

        if let Some(expansion) = result.expansion {
            if !expansion.is_empty() {
                trace!(node = %graph.node(id), added = expansion.nodes.len(), "splicing subgraph");
                splice(&mut graph, id, expansion, &mut marks, &mut remaining_deps);
            }
        }
        release_dependents(&graph, id, &mut remaining_deps);
    }

    // A node still pending with unsatisfied dependencies can only mean
    // a cycle the static check missed: failures mark their dependents
    // skipped, and a stopped walk is exempted.
    let stuck: Vec<String> = graph
        .node_ids()
        .filter(|id| marks[id.index()] == Mark::Pending && remaining_deps[id.index()] > 0)
        .map(|id| graph.node(id).name())
        .collect();
    if !stopping && !stuck.is_empty() {
        diagnostics.push_error(&crate::error::LatticeError::Graph(
            crate::error::GraphError::WalkTimeCycle {
                cycle: stuck.join(", "),
            },
        ));
    }

    let completed = !stopping
        && graph
            .node_ids()
            .all(|id| matches!(marks[id.index()], Mark::Done(_)));
    finish(graph, marks, diagnostics, completed)
}

fn spawn_visit(
    id: NodeId,
    node: GraphNode,
    visitor: Arc<dyn NodeVisitor>,
    semaphore: Arc<Semaphore>,
    done_tx: mpsc::UnboundedSender<(NodeId, VisitResult)>,
) {
    tokio::spawn(async move {
        // The semaphore bounds how many visits do real work at once.
        let Ok(_permit) = semaphore.acquire().await else {
            return;
        };
        trace!(node = %node, "visiting");
        let result = visitor.visit(node).await;
        let _ = done_tx.send((id, result));
    });
}

/// Marks every transitive dependent of a failed node as skipped.
fn skip_dependents(graph: &Graph, failed: NodeId, marks: &mut [Mark]) {
    let mut stack: Vec<NodeId> = graph.dependents(failed).collect();
    while let Some(id) = stack.pop() {
        if marks[id.index()] == Mark::Pending {
            marks[id.index()] = Mark::Done(NodeStatus::Skipped);
            stack.extend(graph.dependents(id));
        }
    }
}

/// Decrements the dependency counters of a finished node's dependents.
fn release_dependents(graph: &Graph, finished: NodeId, remaining_deps: &mut [usize]) {
    for dependent in graph.dependents(finished) {
        remaining_deps[dependent.index()] =
            remaining_deps[dependent.index()].saturating_sub(1);
    }
}

/// Adds the nodes of `expansion` to the graph. Each new node depends on
/// the already-finished producer plus any internal edges. Anything that
/// was waiting on the producer must also wait for everything it expanded
/// into, since the expansion stands in for the producer's work.
fn splice(
    graph: &mut Graph,
    producer: NodeId,
    expansion: Subgraph,
    marks: &mut Vec<Mark>,
    remaining_deps: &mut Vec<usize>,
) {
    // Capture downstream nodes before adding anything: the new nodes
    // themselves become dependents of the producer.
    let downstream: Vec<NodeId> = graph
        .dependents(producer)
        .filter(|id| marks[id.index()] == Mark::Pending)
        .collect();

    let mut ids = Vec::with_capacity(expansion.nodes.len());
    for node in expansion.nodes {
        let id = graph.add_node(node);
        graph.add_dependency(id, producer);
        ids.push(id);
        marks.push(Mark::Pending);
        // One pending count for the producer edge just added; the
        // caller's release of the producer balances it.
        remaining_deps.push(1);
    }
    for (a, b) in expansion.edges {
        graph.add_dependency(ids[a], ids[b]);
        remaining_deps[ids[a].index()] += 1;
    }
    for &dependent in &downstream {
        for &id in &ids {
            graph.add_dependency(dependent, id);
            remaining_deps[dependent.index()] += 1;
        }
    }
}

fn finish(
    graph: Graph,
    marks: Vec<Mark>,
    diagnostics: Diagnostics,
    completed: bool,
) -> WalkReport {
    let statuses = graph
        .node_ids()
        .map(|id| {
            let status = match marks[id.index()] {
                Mark::Done(status) => status,
                Mark::Pending | Mark::Running => NodeStatus::Skipped,
            };
            (graph.node(id).name(), status)
        })
        .collect();
    WalkReport {
        diagnostics,
        statuses,
        completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::error::Diagnostic;

    struct RecordingVisitor {
        order: Mutex<Vec<String>>,
        fail: Option<String>,
        expand_from: Option<(String, usize)>,
        expand_edges: Vec<(usize, usize)>,
    }

    impl RecordingVisitor {
        fn new() -> Self {
            Self {
                order: Mutex::new(Vec::new()),
                fail: None,
                expand_from: None,
                expand_edges: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl NodeVisitor for RecordingVisitor {
        async fn visit(&self, node: GraphNode) -> VisitResult {
            // A small sleep widens the race window for ordering bugs.
            tokio::time::sleep(Duration::from_millis(2)).await;
            let name = node.name();
            self.order.lock().unwrap().push(name.clone());
            if self.fail.as_deref() == Some(name.as_str()) {
                return VisitResult::with_diagnostics(
                    Diagnostic::error("visit failed", name).into(),
                );
            }
            if let Some((from, n)) = &self.expand_from {
                if *from == name {
                    let nodes = (0..*n)
                        .map(|i| GraphNode::Provider {
                            name: format!("spliced{i}"),
                        })
                        .collect();
                    return VisitResult::with_expansion(Subgraph {
                        nodes,
                        edges: self.expand_edges.clone(),
                    });
                }
            }
            VisitResult::ok()
        }
    }

    fn provider(name: &str) -> GraphNode {
        GraphNode::Provider {
            name: name.to_string(),
        }
    }

    fn chain_graph(names: &[&str]) -> Graph {
        let mut g = Graph::new();
        let mut prev = None;
        for name in names {
            let id = g.add_node(provider(name));
            if let Some(p) = prev {
                g.add_dependency(id, p);
            }
            prev = Some(id);
        }
        g
    }

    #[tokio::test]
    async fn test_dependencies_run_first() {
        for parallelism in [1, 2, 8] {
            let mut g = Graph::new();
            let a = g.add_node(provider("a"));
            let b = g.add_node(provider("b"));
            let c = g.add_node(provider("c"));
            let d = g.add_node(provider("d"));
            g.add_dependency(b, a);
            g.add_dependency(c, a);
            g.add_dependency(d, b);
            g.add_dependency(d, c);

            let visitor = Arc::new(RecordingVisitor::new());
            let report = walk(
                g,
                Arc::clone(&visitor) as Arc<dyn NodeVisitor>,
                WalkOptions {
                    parallelism,
                    ..WalkOptions::default()
                },
            )
            .await;
            assert!(report.succeeded());

            let order = visitor.order.lock().unwrap().clone();
            let pos = |n: &str| order.iter().position(|x| x == &format!("provider.{n}")).unwrap();
            assert!(pos("a") < pos("b"));
            assert!(pos("a") < pos("c"));
            assert!(pos("b") < pos("d"));
            assert!(pos("c") < pos("d"));
        }
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() {
        let g = chain_graph(&["a", "b", "c"]);
        let visitor = Arc::new(RecordingVisitor {
            fail: Some("provider.b".to_string()),
            ..RecordingVisitor::new()
        });
        let report = walk(
            g,
            Arc::clone(&visitor) as Arc<dyn NodeVisitor>,
            WalkOptions::default(),
        )
        .await;

        assert!(report.diagnostics.has_errors());
        assert_eq!(report.statuses["provider.a"], NodeStatus::Succeeded);
        assert_eq!(report.statuses["provider.b"], NodeStatus::Failed);
        assert_eq!(report.statuses["provider.c"], NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_error_tolerant_walk_continues() {
        let g = chain_graph(&["a", "b", "c"]);
        let visitor = Arc::new(RecordingVisitor {
            fail: Some("provider.b".to_string()),
            ..RecordingVisitor::new()
        });
        let report = walk(
            g,
            Arc::clone(&visitor) as Arc<dyn NodeVisitor>,
            WalkOptions {
                error_tolerant: true,
                ..WalkOptions::default()
            },
        )
        .await;

        assert!(report.diagnostics.has_errors());
        assert_eq!(report.statuses["provider.c"], NodeStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_walk_time_expansion() {
        let g = chain_graph(&["a"]);
        let visitor = Arc::new(RecordingVisitor {
            expand_from: Some(("provider.a".to_string(), 3)),
            ..RecordingVisitor::new()
        });
        let report = walk(
            g,
            Arc::clone(&visitor) as Arc<dyn NodeVisitor>,
            WalkOptions::default(),
        )
        .await;

        assert!(report.succeeded());
        assert_eq!(report.statuses.len(), 4);
        let order = visitor.order.lock().unwrap().clone();
        assert_eq!(order[0], "provider.a");
        assert_eq!(order.len(), 4);
    }

    #[tokio::test]
    async fn test_expansion_internal_edges_are_ordered() {
        // Spliced node 0 depends on spliced node 1; no amount of free
        // capacity may schedule 0 first.
        for parallelism in [1, 4] {
            let g = chain_graph(&["a"]);
            let visitor = Arc::new(RecordingVisitor {
                expand_from: Some(("provider.a".to_string(), 2)),
                expand_edges: vec![(0, 1)],
                ..RecordingVisitor::new()
            });
            let report = walk(
                g,
                Arc::clone(&visitor) as Arc<dyn NodeVisitor>,
                WalkOptions {
                    parallelism,
                    ..WalkOptions::default()
                },
            )
            .await;

            assert!(report.succeeded());
            let order = visitor.order.lock().unwrap().clone();
            let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
            assert!(pos("provider.a") < pos("provider.spliced1"));
            assert!(pos("provider.spliced1") < pos("provider.spliced0"));
        }
    }

    #[tokio::test]
    async fn test_expansion_gates_downstream_nodes() {
        let mut g = Graph::new();
        let a = g.add_node(provider("a"));
        let b = g.add_node(provider("b"));
        g.add_dependency(b, a);

        let visitor = Arc::new(RecordingVisitor {
            expand_from: Some(("provider.a".to_string(), 2)),
            ..RecordingVisitor::new()
        });
        let report = walk(
            g,
            Arc::clone(&visitor) as Arc<dyn NodeVisitor>,
            WalkOptions::default(),
        )
        .await;

        assert!(report.succeeded());
        let order = visitor.order.lock().unwrap().clone();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("provider.spliced0") < pos("provider.b"));
        assert!(pos("provider.spliced1") < pos("provider.b"));
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let g = chain_graph(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        let (tx, rx) = signal_channel();
        let visitor = Arc::new(RecordingVisitor::new());
        let handle = tokio::spawn(walk(
            g,
            Arc::clone(&visitor) as Arc<dyn NodeVisitor>,
            WalkOptions {
                parallelism: 1,
                error_tolerant: false,
                signal: Some(rx),
            },
        ));
        tokio::time::sleep(Duration::from_millis(3)).await;
        tx.send(WalkSignal::Stop).unwrap();
        let report = handle.await.unwrap();

        assert!(!report.completed);
        // Whatever ran before the stop still succeeded.
        assert!(report
            .statuses
            .values()
            .any(|s| *s == NodeStatus::Succeeded));
        assert!(report.statuses.values().any(|s| *s == NodeStatus::Skipped));
    }

    #[tokio::test]
    async fn test_cancel_abandons_walk() {
        let g = chain_graph(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        let (tx, rx) = signal_channel();
        let visitor = Arc::new(RecordingVisitor::new());
        let handle = tokio::spawn(walk(
            g,
            Arc::clone(&visitor) as Arc<dyn NodeVisitor>,
            WalkOptions {
                parallelism: 1,
                error_tolerant: false,
                signal: Some(rx),
            },
        ));
        tokio::time::sleep(Duration::from_millis(3)).await;
        tx.send(WalkSignal::Cancel).unwrap();
        let report = handle.await.unwrap();

        assert!(!report.completed);
        assert!(report.diagnostics.has_errors());
        assert!(report
            .diagnostics
            .errors()
            .iter()
            .any(|d| d.detail.contains("cancelled")));
    }
}
