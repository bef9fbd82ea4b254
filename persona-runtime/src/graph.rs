//! Workflow Graph
//!
//! A static node table keyed by [`Stage`]:
//! - Built once by [`GraphBuilder`], validated up front, then immutable
//! - Run any number of times, concurrently, each run with its own state
//! - A node fanning out hands every target a fork of the shared state; the
//!   forks are merged back in declaration order at the barrier
//! - Once the shared error field is set, routing jumps to the terminal node,
//!   which therefore runs exactly once per run

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use persona_core::{PipelineState, ProgressEvent, RunStatus, Stage};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Where a node sends the state next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Next(Stage),
    /// Run every target concurrently, then join
    FanOut(Vec<Stage>),
    /// Finish; a non-terminal node finishes through the terminal node
    End,
}

/// How a node finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Completed,
    /// Finished with a recoverable failure (placeholder output)
    Degraded,
}

/// Failure at a node boundary
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{stage} failed: {message}")]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Graph construction and routing errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("No entry node set")]
    MissingEntry,

    #[error("Node {0} is not declared")]
    UnknownNode(Stage),

    #[error("Node {0} declared twice")]
    DuplicateNode(Stage),

    #[error("Edge {from} -> {to} references an undeclared node")]
    UndeclaredEdge { from: Stage, to: Stage },

    #[error("Self-loop on {0}")]
    SelfLoop(Stage),

    #[error("Cycle through {0}")]
    Cycle(Stage),

    #[error("Node {0} is unreachable from the entry")]
    Unreachable(Stage),

    #[error("No terminal node")]
    NoTerminal,

    #[error("More than one terminal node: {0:?}")]
    MultipleTerminals(Vec<Stage>),

    #[error("Node {from} routed to {to}, which is not a declared edge")]
    UndeclaredRoute { from: Stage, to: Stage },

    #[error("Branches fanned out from {0} join at different nodes")]
    DivergentJoin(Stage),

    #[error("Branch {0} fanned out again before the join")]
    NestedFanOut(Stage),
}

/// A workflow node
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> Stage;

    /// Do the node's work on `state`
    async fn run(&self, state: &mut PipelineState) -> Result<NodeOutcome, StageError>;

    /// Pick the next node(s) once `run` returned
    fn route(&self, state: &PipelineState) -> Route;
}

pub type SharedNode = Arc<dyn Node>;

/// Receives progress events as the run advances
pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Observer discarding every event
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
    fn on_event(&self, _event: ProgressEvent) {}
}

/// Result of one run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub state: PipelineState,
    /// Nodes in execution order (fan-out members in declaration order)
    pub visited: Vec<Stage>,
    pub successful_branches: Vec<Stage>,
    /// Failed, degraded or skipped branches
    pub failed_branches: Vec<Stage>,
    pub status: RunStatus,
}

impl ExecutionReport {
    /// How many times `stage` ran
    pub fn runs_of(&self, stage: Stage) -> usize {
        self.visited.iter().filter(|s| **s == stage).count()
    }

    pub fn into_event(self) -> ProgressEvent {
        ProgressEvent::FinalResult {
            state: Box::new(self.state),
            successful_branches: self.successful_branches,
            failed_branches: self.failed_branches,
            status: self.status,
        }
    }
}

/// Graph declaration
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<SharedNode>,
    edges: Vec<(Stage, Stage)>,
    entry: Option<Stage>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: impl Node + 'static) -> Self {
        self.nodes.push(Arc::new(node));
        self
    }

    pub fn shared_node(mut self, node: SharedNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, from: Stage, to: Stage) -> Self {
        self.edges.push((from, to));
        self
    }

    pub fn entry(mut self, stage: Stage) -> Self {
        self.entry = Some(stage);
        self
    }

    /// Validate the declaration
    pub fn build(self) -> Result<Graph, GraphError> {
        let entry = self.entry.ok_or(GraphError::MissingEntry)?;

        let mut nodes = BTreeMap::new();
        for node in self.nodes {
            let id = node.id();
            if nodes.insert(id, node).is_some() {
                return Err(GraphError::DuplicateNode(id));
            }
        }
        if !nodes.contains_key(&entry) {
            return Err(GraphError::UnknownNode(entry));
        }

        let mut edges: BTreeMap<Stage, Vec<Stage>> = nodes.keys().map(|id| (*id, Vec::new())).collect();
        for (from, to) in self.edges {
            if from == to {
                return Err(GraphError::SelfLoop(from));
            }
            if !nodes.contains_key(&from) || !nodes.contains_key(&to) {
                return Err(GraphError::UndeclaredEdge { from, to });
            }
            let targets = edges.entry(from).or_default();
            if !targets.contains(&to) {
                targets.push(to);
            }
        }

        // Reachability from the entry
        let mut reached = BTreeSet::from([entry]);
        let mut queue = VecDeque::from([entry]);
        while let Some(stage) = queue.pop_front() {
            for next in edges.get(&stage).into_iter().flatten() {
                if reached.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }
        if let Some(orphan) = nodes.keys().find(|id| !reached.contains(*id)) {
            return Err(GraphError::Unreachable(*orphan));
        }

        if let Some(stage) = find_cycle(&edges) {
            return Err(GraphError::Cycle(stage));
        }

        let terminals: Vec<Stage> = edges
            .iter()
            .filter(|(_, targets)| targets.is_empty())
            .map(|(id, _)| *id)
            .collect();
        let terminal = match terminals.as_slice() {
            [] => return Err(GraphError::NoTerminal),
            [terminal] => *terminal,
            _ => return Err(GraphError::MultipleTerminals(terminals)),
        };

        // Branches are the targets of nodes with more than one successor
        let mut branches: Vec<Stage> = Vec::new();
        for targets in edges.values().filter(|t| t.len() > 1) {
            for target in targets {
                if !branches.contains(target) {
                    branches.push(*target);
                }
            }
        }

        debug!(
            "Built graph: {} nodes, entry {}, terminal {}, branches {:?}",
            nodes.len(),
            entry,
            terminal,
            branches
        );

        Ok(Graph {
            nodes,
            edges,
            entry,
            terminal,
            branches,
        })
    }
}

/// A node on a cycle, if any (edges are complete over all nodes)
fn find_cycle(edges: &BTreeMap<Stage, Vec<Stage>>) -> Option<Stage> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(stage: Stage, edges: &BTreeMap<Stage, Vec<Stage>>, marks: &mut BTreeMap<Stage, Mark>) -> Option<Stage> {
        match marks.get(&stage) {
            Some(Mark::Visiting) => return Some(stage),
            Some(Mark::Done) => return None,
            None => {}
        }
        marks.insert(stage, Mark::Visiting);
        for next in edges.get(&stage).into_iter().flatten() {
            if let Some(found) = visit(*next, edges, marks) {
                return Some(found);
            }
        }
        marks.insert(stage, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    edges.keys().find_map(|stage| visit(*stage, edges, &mut marks))
}

/// Resolved routing decision
enum Step {
    Next(Stage),
    FanOut(Vec<Stage>),
}

/// Validated, immutable workflow graph
pub struct Graph {
    nodes: BTreeMap<Stage, SharedNode>,
    edges: BTreeMap<Stage, Vec<Stage>>,
    entry: Stage,
    terminal: Stage,
    branches: Vec<Stage>,
}

impl Graph {
    pub fn entry(&self) -> Stage {
        self.entry
    }

    pub fn terminal(&self) -> Stage {
        self.terminal
    }

    /// Fan-out members, in declaration order
    pub fn branches(&self) -> &[Stage] {
        &self.branches
    }

    /// Declared successors of every node
    pub fn edges(&self) -> impl Iterator<Item = (Stage, &[Stage])> {
        self.edges.iter().map(|(from, to)| (*from, to.as_slice()))
    }

    fn node(&self, stage: Stage) -> Result<&SharedNode, GraphError> {
        self.nodes.get(&stage).ok_or(GraphError::UnknownNode(stage))
    }

    /// Run the graph from the entry to the terminal node
    pub async fn execute(
        &self,
        initial: PipelineState,
        observer: &dyn ExecutionObserver,
    ) -> Result<ExecutionReport, GraphError> {
        let mut state = initial;
        let mut current = self.entry;
        let mut visited = Vec::new();
        let mut successful = Vec::new();
        let mut failed = Vec::new();
        let started = Instant::now();

        info!("Run {} starting at {}", state.run_id, current);

        loop {
            let node = self.node(current)?;
            run_node(node.as_ref(), &mut state, observer).await;
            visited.push(current);

            if current == self.terminal {
                break;
            }

            current = match self.resolve(node.as_ref(), &state)? {
                Step::Next(next) => next,
                Step::FanOut(targets) => {
                    state.next_stages = targets.clone();
                    let join = self
                        .fan_out(current, &targets, &mut state, observer, &mut successful, &mut failed)
                        .await?;
                    state.next_stages.clear();
                    visited.extend(targets);
                    join
                }
            };
        }

        for branch in &self.branches {
            if !successful.contains(branch) && !failed.contains(branch) {
                debug!("Branch {} was skipped", branch);
                failed.push(*branch);
            }
        }
        let status = RunStatus::from_counts(successful.len(), self.branches.len());

        info!(
            "Run {} finished in {}ms: {:?} ({} succeeded, {} failed)",
            state.run_id,
            started.elapsed().as_millis(),
            status,
            successful.len(),
            failed.len()
        );

        Ok(ExecutionReport {
            state,
            visited,
            successful_branches: successful,
            failed_branches: failed,
            status,
        })
    }

    /// Evaluate a router, applying the error short-circuit
    fn resolve(&self, node: &dyn Node, state: &PipelineState) -> Result<Step, GraphError> {
        let from = node.id();
        if state.has_error() {
            debug!("Error recorded, routing {} straight to {}", from, self.terminal);
            return Ok(Step::Next(self.terminal));
        }

        match node.route(state) {
            Route::End => Ok(Step::Next(self.terminal)),
            Route::Next(to) => {
                self.check_edge(from, to)?;
                Ok(Step::Next(to))
            }
            Route::FanOut(targets) => {
                let mut unique: Vec<Stage> = Vec::with_capacity(targets.len());
                for to in targets {
                    self.check_edge(from, to)?;
                    if !unique.contains(&to) {
                        unique.push(to);
                    }
                }
                Ok(match unique.as_slice() {
                    [] => Step::Next(self.terminal),
                    [only] => Step::Next(*only),
                    _ => Step::FanOut(unique),
                })
            }
        }
    }

    fn check_edge(&self, from: Stage, to: Stage) -> Result<(), GraphError> {
        let declared = self.edges.get(&from).is_some_and(|targets| targets.contains(&to));
        if declared {
            Ok(())
        } else {
            Err(GraphError::UndeclaredRoute { from, to })
        }
    }

    /// Run `targets` concurrently on forks, merge at the barrier, return the join node
    async fn fan_out(
        &self,
        from: Stage,
        targets: &[Stage],
        state: &mut PipelineState,
        observer: &dyn ExecutionObserver,
        successful: &mut Vec<Stage>,
        failed: &mut Vec<Stage>,
    ) -> Result<Stage, GraphError> {
        info!("Fan-out from {} to {:?}", from, targets);

        let mut branches = Vec::with_capacity(targets.len());
        for target in targets {
            branches.push((self.node(*target)?, state.fork()));
        }

        let results = join_all(branches.into_iter().map(|(node, mut branch)| async move {
            let outcome = run_node(node.as_ref(), &mut branch, observer).await;
            (node, branch, outcome)
        }))
        .await;

        let mut joins = Vec::with_capacity(results.len());
        for (node, branch, outcome) in results {
            let id = node.id();
            match outcome {
                Some(NodeOutcome::Completed) => successful.push(id),
                _ => failed.push(id),
            }

            match self.resolve(node.as_ref(), &branch)? {
                Step::Next(join) => joins.push(join),
                Step::FanOut(_) => return Err(GraphError::NestedFanOut(id)),
            }
            state.merge(branch);
        }

        if joins.contains(&self.terminal) {
            return Ok(self.terminal);
        }
        match joins.split_first() {
            Some((first, rest)) if rest.iter().all(|j| j == first) => Ok(*first),
            Some(_) => Err(GraphError::DivergentJoin(from)),
            None => Ok(self.terminal),
        }
    }
}

/// Run one node, reporting progress; `None` when it failed at its boundary
async fn run_node(node: &dyn Node, state: &mut PipelineState, observer: &dyn ExecutionObserver) -> Option<NodeOutcome> {
    let id = node.id();
    observer.on_event(ProgressEvent::node_start(id));

    let before = state.clone();
    let started = Instant::now();
    let result = node.run(state).await;

    let fields = state.newly_available(&before);
    if !fields.is_empty() {
        observer.on_event(ProgressEvent::PartialResult { node: id, fields });
    }

    match result {
        Ok(outcome) => {
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            debug!("Node {} finished in {}ms ({:?})", id, duration_ms, outcome);
            observer.on_event(ProgressEvent::NodeComplete {
                node: id,
                duration_ms,
                degraded: outcome == NodeOutcome::Degraded,
            });
            Some(outcome)
        }
        Err(e) => {
            warn!("{}", e);
            state.record_error(e.to_string());
            observer.on_event(ProgressEvent::NodeError {
                node: id,
                error: e.to_string(),
            });
            None
        }
    }
}
