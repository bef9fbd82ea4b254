//! Progress Streamer
//!
//! Runs the graph in a background task and forwards its events over a
//! channel, ending with exactly one `final_result`. When the receiving side
//! goes away the events stop but the run continues to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use persona_core::{EnrichRequest, PipelineState, ProgressEvent, RunStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{ExecutionObserver, ExecutionReport, Graph, GraphError};

/// Observer forwarding events to a channel until the receiver is dropped
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    disconnected: AtomicBool,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            tx,
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn send(&self, event: ProgressEvent) {
        if self.is_disconnected() {
            return;
        }
        if self.tx.send(event).is_err() && !self.disconnected.swap(true, Ordering::SeqCst) {
            info!("Progress receiver closed, run continues without streaming");
        }
    }
}

impl ExecutionObserver for ChannelObserver {
    fn on_event(&self, event: ProgressEvent) {
        self.send(event);
    }
}

/// A run in progress
pub struct ProgressStream {
    pub events: mpsc::UnboundedReceiver<ProgressEvent>,
    /// Resolves once the run finished, whether or not anyone listened
    pub handle: JoinHandle<Result<ExecutionReport, GraphError>>,
}

/// Starts streamed runs of a shared graph
#[derive(Clone)]
pub struct ProgressStreamer {
    graph: Arc<Graph>,
}

impl ProgressStreamer {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Start a run for an inbound request
    pub fn start(&self, request: EnrichRequest, source: &str) -> ProgressStream {
        self.start_with_state(request.into_state(source))
    }

    /// Start a run from a prepared state
    pub fn start_with_state(&self, state: PipelineState) -> ProgressStream {
        let (tx, events) = mpsc::unbounded_channel();
        let graph = Arc::clone(&self.graph);

        let handle = tokio::spawn(async move {
            let observer = ChannelObserver::new(tx);
            let initial = state.clone();
            let result = graph.execute(state, &observer).await;

            match &result {
                Ok(report) => observer.send(report.clone().into_event()),
                Err(e) => {
                    error!("Run aborted by a routing error: {}", e);
                    observer.send(aborted_event(&graph, initial, e));
                }
            }
            if observer.is_disconnected() {
                debug!("Nobody was listening, result discarded");
            }
            result
        });

        ProgressStream { events, handle }
    }
}

/// Terminal event for a run the graph could not finish
fn aborted_event(graph: &Graph, mut state: PipelineState, error: &GraphError) -> ProgressEvent {
    state.record_error(format!("Run aborted: {}", error));
    ProgressEvent::FinalResult {
        state: Box::new(state),
        successful_branches: Vec::new(),
        failed_branches: graph.branches().to_vec(),
        status: RunStatus::CompleteFailure,
    }
}
