//! Profile Aggregator
//!
//! Composes whichever agent reports are present into one profile and
//! flattens the stage references into a single list. It always produces
//! some text: with no reports, or when the model fails, the profile is a
//! placeholder stating that enrichment failed.

use persona_core::{PipelineState, Provenance, Stage};
use tracing::{info, warn};

use crate::{render_template, AgentError, AgentProfile, PersonaRegistry, SharedBackend};

/// How the profile was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOutcome {
    /// The model composed the profile
    Composed,
    /// No report was available; the model was not called
    NoReports,
    /// The model failed; a placeholder was written
    Failed,
}

impl AggregateOutcome {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, AggregateOutcome::Composed)
    }
}

/// Result aggregator
pub struct ResultAggregator {
    backend: SharedBackend,
    profile: AgentProfile,
}

impl ResultAggregator {
    pub fn new(backend: SharedBackend, profile: AgentProfile) -> Self {
        Self { backend, profile }
    }

    pub fn from_registry(backend: SharedBackend, registry: &PersonaRegistry) -> Result<Self, AgentError> {
        Ok(Self::new(backend, registry.for_stage(Stage::Aggregator)?.clone()))
    }

    /// Write the aggregated profile and reference list into `state`.
    ///
    /// Re-running replaces the previous profile and aggregate entry.
    pub async fn aggregate(&self, state: &mut PipelineState) -> AggregateOutcome {
        let sections = combined_sections(state);
        let subject = state.subject_name().to_string();

        let outcome = if sections.is_empty() {
            warn!("No agent reports available for {}", subject);
            state.replace_aggregated_profile(self.placeholder(&subject, "no research stage produced a report"));
            AggregateOutcome::NoReports
        } else {
            let vars = [("name", subject.as_str()), ("context", sections.as_str())];
            let system = render_template(&self.profile.prompt.report_system, &vars);
            let user = render_template(&self.profile.prompt.report_user, &vars);

            match self.backend.generate(&system, &user).await {
                Ok(profile) if !profile.trim().is_empty() => {
                    state.replace_aggregated_profile(profile.trim().to_string());
                    AggregateOutcome::Composed
                }
                Ok(_) => {
                    state.record_error("aggregation returned no text");
                    state.replace_aggregated_profile(self.placeholder(&subject, "the profile could not be composed"));
                    AggregateOutcome::Failed
                }
                Err(e) => {
                    warn!("Aggregation failed: {}", e);
                    state.record_error(format!("aggregation failed: {}", e));
                    state.replace_aggregated_profile(self.placeholder(&subject, "the profile could not be composed"));
                    AggregateOutcome::Failed
                }
            }
        };

        let all_references = state.stage_references();
        state
            .provenance
            .retain(|entry| !matches!(entry, Provenance::Aggregate { .. }));
        state.record(Provenance::Aggregate {
            all_references,
            aggregation_completed: true,
        });

        info!("Aggregated profile for {} ({:?})", subject, outcome);
        outcome
    }

    fn placeholder(&self, subject: &str, reason: &str) -> String {
        format!(
            "{} Enrichment failed for {}: {}.",
            self.profile.degraded_report(),
            subject,
            reason
        )
    }
}

/// Labeled sections for every present report; absent ones are omitted
fn combined_sections(state: &PipelineState) -> String {
    Stage::AGENTS
        .iter()
        .filter_map(|stage| {
            state
                .report(*stage)
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(|report| format!("{}:\n{}\n", stage.label(), report))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
