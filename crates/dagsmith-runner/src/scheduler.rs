//! Bounded, dependency-ordered execution
//!
//! The scheduler walks a (sub)graph with at most `threads` nodes executing
//! at once:
//!
//! 1. Nodes with no unfinished parents are ready; among ready nodes the
//!    lowest topological index is dispatched first.
//! 2. When a node finishes, each child's pending-parent count drops; a child
//!    becomes ready once every parent has a terminal result.
//! 3. When a node fails or errors, every not-yet-finished descendant is
//!    marked skipped at once and never dispatched.
//!
//! Parents outside the graph count as satisfied. Ephemeral nodes finish
//! instantly without touching the backend.

use dagsmith_core::{InternalError, Node, NodeId, RunReport, RunResult};
use dagsmith_graph::{DependencyGraph, Manifest};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::materialization::NodeExecutor;
use crate::observer::{RunObserver, RunStart};

/// Bookkeeping for one run
struct RunState<'g> {
    graph: &'g DependencyGraph,

    /// Unfinished parents per node
    pending: HashMap<NodeId, usize>,

    /// Ready to dispatch, ordered by topological index
    ready: BTreeSet<(usize, NodeId)>,

    /// Nodes with a terminal result
    finished: HashSet<NodeId>,

    results: Vec<RunResult>,
}

impl<'g> RunState<'g> {
    fn new(graph: &'g DependencyGraph) -> Self {
        let mut pending = HashMap::with_capacity(graph.len());
        let mut ready = BTreeSet::new();

        for (index, id) in graph.topological_order().iter().enumerate() {
            let parents = graph.parents(id).len();
            if parents == 0 {
                ready.insert((index, id.clone()));
            }
            pending.insert(id.clone(), parents);
        }

        Self {
            graph,
            pending,
            ready,
            finished: HashSet::with_capacity(graph.len()),
            results: Vec::with_capacity(graph.len()),
        }
    }

    fn is_finished(&self, id: &str) -> bool {
        self.finished.contains(id)
    }

    /// Record a terminal result and release or skip its descendants
    fn complete(&mut self, result: RunResult, manifest: &Manifest, observer: &dyn RunObserver) {
        if !self.finished.insert(result.unique_id.clone()) {
            tracing::error!(unique_id = %result.unique_id, "duplicate result discarded");
            return;
        }

        let id = result.unique_id.clone();
        let blocks = result.status.blocks_dependents();
        observer.on_node_complete(&result);
        self.results.push(result);

        if blocks {
            self.skip_descendants(&id, manifest, observer);
        } else {
            self.release(&id);
        }
    }

    /// Finish a source without a result; sources only satisfy dependencies
    fn satisfy(&mut self, id: &str) {
        if self.finished.insert(id.to_string()) {
            self.release(id);
        }
    }

    fn release(&mut self, id: &str) {
        let graph = self.graph;
        for child in graph.children(id) {
            if self.finished.contains(child) {
                continue;
            }
            if let Some(count) = self.pending.get_mut(child) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    let index = graph.topo_index(child).unwrap_or(usize::MAX);
                    self.ready.insert((index, child.clone()));
                }
            }
        }
    }

    /// Skip every unfinished descendant of `cause`
    fn skip_descendants(&mut self, cause: &str, manifest: &Manifest, observer: &dyn RunObserver) {
        let mut queue: VecDeque<NodeId> = self.graph.children(cause).iter().cloned().collect();

        while let Some(id) = queue.pop_front() {
            if self.finished.contains(&id) {
                continue;
            }
            let Some(node) = manifest.get(&id) else {
                continue;
            };

            self.ready.retain(|(_, ready_id)| ready_id != &id);
            self.finished.insert(id.clone());

            let result = RunResult::skipped(node, cause);
            observer.on_node_complete(&result);
            self.results.push(result);

            queue.extend(self.graph.children(&id).iter().cloned());
        }
    }
}

/// Walks a graph with a bounded number of concurrent node executions
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    threads: usize,
}

impl Scheduler {
    /// A scheduler running at most `threads` nodes at once (minimum 1)
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Execute every node of `graph` and aggregate the results
    ///
    /// Every node in `graph` must be present in `manifest`. The report holds
    /// exactly one result per node, in completion order.
    pub async fn run(
        &self,
        graph: &DependencyGraph,
        manifest: Arc<Manifest>,
        executor: &NodeExecutor,
        observer: &dyn RunObserver,
    ) -> Result<RunReport, InternalError> {
        if let Some(missing) = graph.nodes().iter().find(|id| !manifest.contains(id)) {
            return Err(InternalError::UnknownNode(missing.clone()));
        }

        let started = Instant::now();
        observer.on_run_start(&RunStart {
            nodes: graph.len(),
            threads: self.threads,
        });

        let mut state = RunState::new(graph);
        let mut running: JoinSet<RunResult> = JoinSet::new();

        loop {
            while running.len() < self.threads {
                let Some((_, id)) = state.ready.pop_first() else {
                    break;
                };
                let Some(node) = manifest.get(&id) else {
                    continue;
                };

                if !node.resource_type.is_runnable() {
                    state.satisfy(&id);
                    continue;
                }

                if node.is_ephemeral() {
                    let result = executor.execute(node).await;
                    state.complete(result, &manifest, observer);
                    continue;
                }

                tracing::debug!(unique_id = %id, "dispatching node");
                running.spawn(execute_isolated(executor.clone(), node.clone()));
            }

            let Some(joined) = running.join_next().await else {
                break;
            };

            match joined {
                Ok(result) => state.complete(result, &manifest, observer),
                Err(error) => tracing::error!(%error, "node task did not complete"),
            }
        }

        // A lost task leaves its node without a result
        for id in graph.topological_order() {
            if state.is_finished(id) {
                continue;
            }
            if let Some(node) = manifest.get(id).filter(|n| n.resource_type.is_runnable()) {
                let result = if graph.parents(id).iter().any(|p| !state.is_finished(p)) {
                    RunResult::errored(node, "Node was never scheduled", Duration::ZERO)
                } else {
                    RunResult::errored(node, "Node execution did not complete", Duration::ZERO)
                };
                state.complete(result, &manifest, observer);
            }
        }

        let report = RunReport::aggregate(state.results, started.elapsed());
        observer.on_run_end(&report);
        Ok(report)
    }
}

/// Run a node on its own task so a panic becomes an error result
async fn execute_isolated(executor: NodeExecutor, node: Node) -> RunResult {
    let started = Instant::now();
    let task_node = node.clone();
    let handle = tokio::spawn(async move { executor.execute(&task_node).await });

    match handle.await {
        Ok(result) => result,
        Err(error) => {
            tracing::error!(unique_id = %node.unique_id, %error, "node execution panicked");
            RunResult::errored(&node, format!("Node execution panicked: {}", error), started.elapsed())
        }
    }
}
