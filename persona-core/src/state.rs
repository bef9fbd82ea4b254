//! Pipeline state - the record that flows through every workflow node
//!
//! Parallel branches each receive a [`PipelineState::fork`] of the shared
//! state and are folded back with [`PipelineState::merge`] at the single
//! fan-in point. Every field has exactly one merge policy:
//!
//! | Field | Policy |
//! |---|---|
//! | `name`, `subject_input` | first non-empty wins |
//! | `background`, `leadership`, `reputation`, `strategy` | single writer, first non-empty wins |
//! | `aggregated_profile` | first non-empty wins |
//! | `error` | first non-empty wins |
//! | `provenance` | append |
//! | `next_stages` | owned by the orchestrator, never merged |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{Candidate, CoreError};

/// Workflow node identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Background,
    Leadership,
    Reputation,
    Strategy,
    Aggregator,
}

impl Stage {
    /// The four research agents, in declaration order
    pub const AGENTS: [Stage; 4] = [
        Stage::Background,
        Stage::Leadership,
        Stage::Reputation,
        Stage::Strategy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Background => "background",
            Stage::Leadership => "leadership",
            Stage::Reputation => "reputation",
            Stage::Strategy => "strategy",
            Stage::Aggregator => "aggregator",
        }
    }

    /// Human-readable section label
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Background => "Background Information",
            Stage::Leadership => "Leadership Analysis",
            Stage::Reputation => "Reputation Assessment",
            Stage::Strategy => "Strategic Analysis",
            Stage::Aggregator => "Aggregated Profile",
        }
    }

    pub fn is_agent(&self) -> bool {
        !matches!(self, Stage::Aggregator)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "background" => Ok(Stage::Background),
            "leadership" => Ok(Stage::Leadership),
            "reputation" => Ok(Stage::Reputation),
            "strategy" => Ok(Stage::Strategy),
            "aggregator" => Ok(Stage::Aggregator),
            other => Err(CoreError::UnknownStage(other.to_string())),
        }
    }
}

/// Provenance/audit trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// The request that created the state
    Request {
        source: String,
        subject_name: Option<String>,
    },

    /// A stage produced data
    Stage {
        stage: Stage,
        info: String,
        /// URLs the stage's output was compiled from
        references: Vec<String>,
    },

    /// The aggregator's flattened reference list
    Aggregate {
        all_references: Vec<String>,
        aggregation_completed: bool,
    },
}

/// Cross-agent shared record for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub run_id: Uuid,
    pub name: Option<String>,
    pub subject_input: Option<String>,
    pub background: Option<String>,
    pub leadership: Option<String>,
    pub reputation: Option<String>,
    pub strategy: Option<String>,
    pub aggregated_profile: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub provenance: Vec<Provenance>,
    /// Routing directive; empty means "none"
    #[serde(default)]
    pub next_stages: Vec<Stage>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            name: None,
            subject_input: None,
            background: None,
            leadership: None,
            reputation: None,
            strategy: None,
            aggregated_profile: None,
            error: None,
            provenance: Vec::new(),
            next_stages: Vec::new(),
        }
    }
}

/// Scalar policy: keep the current value once it is non-empty
fn first_non_empty(current: &mut Option<String>, incoming: Option<String>) {
    let occupied = current.as_deref().is_some_and(|v| !v.trim().is_empty());
    if occupied {
        return;
    }
    if let Some(value) = incoming {
        if !value.trim().is_empty() {
            *current = Some(value);
        }
    }
}

impl PipelineState {
    /// Create a state for a new request
    pub fn for_subject(name: Option<String>, summary: Option<String>, source: &str) -> Self {
        let mut state = Self::default();
        state.set_name(name.clone());
        state.set_subject_input(summary);
        state.record(Provenance::Request {
            source: source.to_string(),
            subject_name: name,
        });
        state
    }

    pub fn set_name(&mut self, name: Option<String>) {
        first_non_empty(&mut self.name, name);
    }

    pub fn set_subject_input(&mut self, input: Option<String>) {
        first_non_empty(&mut self.subject_input, input);
    }

    /// Record an error; the earliest error is preserved
    pub fn record_error(&mut self, error: impl Into<String>) {
        first_non_empty(&mut self.error, Some(error.into()));
    }

    pub fn has_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    /// Append a provenance entry
    pub fn record(&mut self, entry: Provenance) {
        self.provenance.push(entry);
    }

    /// Whether there is any usable subject input to research
    pub fn has_subject(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.name) || present(&self.subject_input)
    }

    /// Subject name, or a neutral placeholder
    pub fn subject_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("the individual")
    }

    /// Report written by an agent stage
    pub fn report(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Background => self.background.as_deref(),
            Stage::Leadership => self.leadership.as_deref(),
            Stage::Reputation => self.reputation.as_deref(),
            Stage::Strategy => self.strategy.as_deref(),
            Stage::Aggregator => self.aggregated_profile.as_deref(),
        }
    }

    fn report_slot(&mut self, stage: Stage) -> &mut Option<String> {
        match stage {
            Stage::Background => &mut self.background,
            Stage::Leadership => &mut self.leadership,
            Stage::Reputation => &mut self.reputation,
            Stage::Strategy => &mut self.strategy,
            Stage::Aggregator => &mut self.aggregated_profile,
        }
    }

    /// Write a stage's report; a stage owns exactly one field
    pub fn set_report(&mut self, stage: Stage, report: impl Into<String>) {
        first_non_empty(self.report_slot(stage), Some(report.into()));
    }

    /// Replace the aggregated profile (the aggregator may be re-run)
    pub fn replace_aggregated_profile(&mut self, profile: String) {
        self.aggregated_profile = Some(profile);
    }

    /// Branch view handed to a parallel node: all fields, no provenance.
    ///
    /// The branch's own provenance entries are then exactly what it appended,
    /// so [`merge`](Self::merge) can concatenate without duplicating history.
    pub fn fork(&self) -> Self {
        Self {
            provenance: Vec::new(),
            next_stages: Vec::new(),
            ..self.clone()
        }
    }

    /// Fold a forked branch back into the shared state
    pub fn merge(&mut self, branch: PipelineState) {
        let PipelineState {
            run_id: _,
            name,
            subject_input,
            background,
            leadership,
            reputation,
            strategy,
            aggregated_profile,
            error,
            provenance,
            next_stages: _,
        } = branch;

        first_non_empty(&mut self.name, name);
        first_non_empty(&mut self.subject_input, subject_input);
        first_non_empty(&mut self.background, background);
        first_non_empty(&mut self.leadership, leadership);
        first_non_empty(&mut self.reputation, reputation);
        first_non_empty(&mut self.strategy, strategy);
        first_non_empty(&mut self.aggregated_profile, aggregated_profile);
        first_non_empty(&mut self.error, error);
        self.provenance.extend(provenance);
    }

    /// Fields that became available between `before` and `self`, as JSON.
    ///
    /// Used for best-effort `partial_result` events.
    pub fn newly_available(&self, before: &PipelineState) -> Map<String, Value> {
        let mut fields = Map::new();
        let pairs = [
            ("name", &before.name, &self.name),
            ("background_report", &before.background, &self.background),
            ("leadership_report", &before.leadership, &self.leadership),
            ("reputation_report", &before.reputation, &self.reputation),
            ("strategy_report", &before.strategy, &self.strategy),
            ("aggregated_profile", &before.aggregated_profile, &self.aggregated_profile),
            ("error", &before.error, &self.error),
        ];

        for (key, old, new) in pairs {
            if let Some(value) = new {
                if old.as_ref() != Some(value) {
                    fields.insert(key.to_string(), Value::String(value.clone()));
                }
            }
        }

        fields
    }

    /// Every stage reference in provenance order, without duplicates
    pub fn stage_references(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.provenance
            .iter()
            .filter_map(|entry| match entry {
                Provenance::Stage { references, .. } => Some(references),
                _ => None,
            })
            .flatten()
            .filter(|url| seen.insert(url.as_str().to_string()))
            .cloned()
            .collect()
    }
}

/// Per-agent scratch data, owned by a single agent execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRunState {
    /// Subject name used in prompts
    pub subject_name: String,
    /// Subject description (summary, possibly enriched with earlier reports)
    pub subject_description: String,
    pub queries: Vec<String>,
    pub candidates: Vec<Candidate>,
    pub report: Option<String>,
    /// Whether the report is a degraded placeholder
    pub degraded: bool,
    /// First step failure, if any
    pub error: Option<String>,
}

impl AgentRunState {
    pub fn new(subject_name: impl Into<String>, subject_description: impl Into<String>) -> Self {
        Self {
            subject_name: subject_name.into(),
            subject_description: subject_description.into(),
            ..Default::default()
        }
    }

    /// Record a step failure; the first one is kept
    pub fn record_error(&mut self, error: impl Into<String>) {
        first_non_empty(&mut self.error, Some(error.into()));
    }

    /// URLs of the candidates that fed the report
    pub fn references(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.url.clone()).collect()
    }
}
