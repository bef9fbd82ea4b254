//! Pipeline Nodes
//!
//! Graph adapters for the research agents and the aggregator, and the
//! assembly of the enrichment pipeline:
//!
//! ```text
//! background ──┬── leadership ──┐
//!              ├── reputation ──┼── aggregator
//!              └── strategy ────┘
//! ```

use async_trait::async_trait;
use persona_agents::{
    extract_structured, AgentStage, PersonaRegistry, ResultAggregator, SharedBackend, StageToolkit,
    SubjectName,
};
use persona_core::{AgentRunState, PipelineState, Provenance, Stage};
use tracing::{debug, info, warn};

use crate::{Graph, GraphBuilder, Node, NodeOutcome, Route, StageError};

/// Agents that run concurrently after the background stage
pub const FAN_OUT: [Stage; 3] = [Stage::Leadership, Stage::Reputation, Stage::Strategy];

/// A research agent in the graph
pub struct ResearchNode {
    agent: AgentStage,
    route: Route,
    /// Set on the entry node, which resolves the subject before researching
    resolver: Option<SharedBackend>,
}

impl ResearchNode {
    /// Entry node: resolves the subject, then fans out to `targets`
    pub fn entry(agent: AgentStage, backend: SharedBackend, targets: Vec<Stage>) -> Self {
        Self {
            agent,
            route: Route::FanOut(targets),
            resolver: Some(backend),
        }
    }

    /// Fan-out member joining at `join`
    pub fn branch(agent: AgentStage, join: Stage) -> Self {
        Self {
            agent,
            route: Route::Next(join),
            resolver: None,
        }
    }

    fn is_entry(&self) -> bool {
        self.resolver.is_some()
    }

    /// Fill a missing name from the summary; the placeholder covers failure
    async fn resolve_name(&self, backend: &SharedBackend, state: &mut PipelineState) {
        if state.name.as_deref().is_some_and(|n| !n.trim().is_empty()) {
            return;
        }
        let Some(summary) = state.subject_input.clone().filter(|s| !s.trim().is_empty()) else {
            return;
        };

        match extract_structured::<SubjectName>(backend.as_ref(), &summary, SubjectName::SHAPE).await {
            Ok(SubjectName { name: Some(name) }) if !name.trim().is_empty() => {
                info!("Resolved subject name: {}", name.trim());
                state.set_name(Some(name.trim().to_string()));
            }
            Ok(_) => debug!("No name in the summary, using '{}'", state.subject_name()),
            Err(e) => warn!("Name extraction failed, using '{}': {}", state.subject_name(), e),
        }
    }

    /// Description handed to the agent
    fn description(&self, state: &PipelineState) -> String {
        let summary = state
            .subject_input
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| state.subject_name())
            .to_string();

        if self.is_entry() {
            return summary;
        }

        match state.background.as_deref().filter(|b| !b.trim().is_empty()) {
            Some(background) => format!("{}\n\nBackground Report:\n{}", summary, background),
            None => summary,
        }
    }

    /// Write the agent's output into the shared state
    fn record_run(&self, state: &mut PipelineState, run: AgentRunState) -> NodeOutcome {
        let stage = self.agent.stage();

        let (info, references) = if run.degraded {
            let reason = run.error.as_deref().unwrap_or("no report");
            (format!("{} degraded: {}", stage.label(), reason), Vec::new())
        } else {
            let references = run.references();
            (
                format!("{} compiled from {} sources", stage.label(), references.len()),
                references,
            )
        };

        if let Some(report) = run.report {
            state.set_report(stage, report);
        }
        state.record(Provenance::Stage {
            stage,
            info,
            references,
        });

        // The entry's step failures stay in provenance; anything in the
        // error field would skip the fan-out.
        if let Some(error) = run.error {
            if self.is_entry() {
                warn!("[{}] Recovered from: {}", stage, error);
            } else {
                state.record_error(error);
            }
        }

        if run.degraded {
            NodeOutcome::Degraded
        } else {
            NodeOutcome::Completed
        }
    }
}

#[async_trait]
impl Node for ResearchNode {
    fn id(&self) -> Stage {
        self.agent.stage()
    }

    async fn run(&self, state: &mut PipelineState) -> Result<NodeOutcome, StageError> {
        if let Some(backend) = &self.resolver {
            if !state.has_subject() {
                return Err(StageError::new(
                    self.id(),
                    "no usable subject input: a name or a summary is required",
                ));
            }
            self.resolve_name(backend, state).await;
        }

        let name = state.subject_name().to_string();
        let description = self.description(state);
        let run = self.agent.run(&name, &description).await;

        Ok(self.record_run(state, run))
    }

    fn route(&self, _state: &PipelineState) -> Route {
        self.route.clone()
    }
}

/// The terminal node
pub struct AggregatorNode {
    aggregator: ResultAggregator,
}

impl AggregatorNode {
    pub fn new(aggregator: ResultAggregator) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl Node for AggregatorNode {
    fn id(&self) -> Stage {
        Stage::Aggregator
    }

    async fn run(&self, state: &mut PipelineState) -> Result<NodeOutcome, StageError> {
        let outcome = self.aggregator.aggregate(state).await;
        Ok(if outcome.is_degraded() {
            NodeOutcome::Degraded
        } else {
            NodeOutcome::Completed
        })
    }

    fn route(&self, _state: &PipelineState) -> Route {
        Route::End
    }
}

/// Assemble the enrichment pipeline from the personas and collaborators
pub fn build_pipeline(registry: &PersonaRegistry, toolkit: StageToolkit) -> anyhow::Result<Graph> {
    let backend = toolkit.backend.clone();
    let background = AgentStage::from_registry(Stage::Background, registry, toolkit.clone())?;

    let mut builder = GraphBuilder::new()
        .entry(Stage::Background)
        .node(ResearchNode::entry(background, backend.clone(), FAN_OUT.to_vec()))
        .node(AggregatorNode::new(ResultAggregator::from_registry(backend, registry)?));

    for stage in FAN_OUT {
        let agent = AgentStage::from_registry(stage, registry, toolkit.clone())?;
        builder = builder
            .node(ResearchNode::branch(agent, Stage::Aggregator))
            .edge(Stage::Background, stage)
            .edge(stage, Stage::Aggregator);
    }

    let graph = builder.build()?;
    info!("Pipeline ready: {} -> {:?} -> {}", graph.entry(), graph.branches(), graph.terminal());
    Ok(graph)
}
