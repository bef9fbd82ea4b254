//! Search candidates under evaluation
//!
//! A candidate is produced by a search provider, judged by the relevance
//! filter and filled with page text by the scraper chain. Once an agent's
//! compile step has read it, it is no longer mutated.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{CoreError, SNIPPET_PREVIEW_LENGTH};

/// Tri-state relevance verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relevance {
    #[default]
    Unknown,
    Relevant,
    Irrelevant,
}

/// One search/scrape result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Result URL
    pub url: String,
    /// Result title
    pub title: String,
    /// Short description from the search provider
    pub snippet: Option<String>,
    /// Page text, filled by scraping (or pre-filled by some providers)
    pub content: Option<String>,
    /// Search provider that produced this result
    pub source_provider: String,
    /// Relevance verdict
    #[serde(default)]
    pub relevant: Relevance,
}

impl Candidate {
    pub fn new(url: impl Into<String>, title: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            snippet: None,
            content: None,
            source_provider: provider.into(),
            relevant: Relevance::Unknown,
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Host part of the URL, lowercased
    pub fn host(&self) -> Result<String, CoreError> {
        let parsed = Url::parse(&self.url).map_err(|e| CoreError::InvalidUrl(format!("{}: {}", self.url, e)))?;
        parsed
            .host_str()
            .map(|h| h.to_lowercase())
            .ok_or_else(|| CoreError::InvalidUrl(format!("{}: no host", self.url)))
    }

    /// Whether the candidate already carries at least `min_length` chars of content
    pub fn has_adequate_content(&self, min_length: usize) -> bool {
        self.content
            .as_deref()
            .is_some_and(|c| c.chars().count() >= min_length)
    }

    /// Store scraped text, back-filling the snippet when the provider gave none
    pub fn apply_scraped(&mut self, text: String) {
        if self.snippet.as_deref().map_or(true, str::is_empty) {
            let preview: String = text.chars().take(SNIPPET_PREVIEW_LENGTH).collect();
            self.snippet = Some(format!("{}...", preview));
        }
        self.content = Some(text);
    }
}

/// Outcome of a single scraper strategy for a single URL.
///
/// Transient: only used to decide whether the fallback chain continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeAttempt {
    /// Strategy name
    pub strategy: String,
    /// Whether the strategy produced adequate content
    pub success: bool,
    /// Extracted text, if any
    pub text: Option<String>,
    /// Length of the extracted text in chars
    pub length: usize,
}

impl ScrapeAttempt {
    pub fn new(strategy: &str, text: Option<String>, min_length: usize) -> Self {
        let length = text.as_deref().map_or(0, |t| t.chars().count());
        Self {
            strategy: strategy.to_string(),
            success: text.is_some() && length >= min_length,
            text,
            length,
        }
    }

    pub fn failed(strategy: &str) -> Self {
        Self::new(strategy, None, 0)
    }
}
