//! PersonaGraph Core - Domain types for multi-agent profile enrichment
//!
//! This crate provides the foundational primitives:
//! - Search/scrape candidates and transient scrape attempts
//! - The shared pipeline state with explicit per-field merge policies
//! - Per-agent scratch state
//! - Progress events streamed to interactive callers
//! - The blocked-domain registry used by the relevance filter

pub mod candidate;
pub mod blocklist;
pub mod state;
pub mod events;

pub use candidate::*;
pub use blocklist::*;
pub use state::*;
pub use events::*;

use thiserror::Error;

/// Minimum content length (chars) for a scrape to count as adequate
pub const MIN_CONTENT_LENGTH: usize = 100;

/// Default number of results requested per search query
pub const DEFAULT_MAX_RESULTS: usize = 3;

/// Length of the snippet back-filled from scraped content
pub const SNIPPET_PREVIEW_LENGTH: usize = 250;

/// Errors raised by core domain operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
