//! Scraper Chain
//!
//! Fills candidate content by trying scrape strategies strictly in order.
//! The first strategy producing adequate text wins and ends the chain; an
//! error or a short result moves on to the next strategy.

use async_trait::async_trait;
use persona_core::{Candidate, ScrapeAttempt};
use persona_web::{fetch_html, truncate_chars, ScrapeStrategy, SharedScraper, WebError};
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::SharedBackend;

/// Result of running the chain for one URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeOutcome {
    /// Adequate text, if any strategy produced it
    pub text: Option<String>,
    /// Strategy that produced the text
    pub strategy: Option<String>,
    /// Every attempt made, in order
    pub attempts: Vec<ScrapeAttempt>,
}

/// Ordered fallback chain of scrape strategies
pub struct ScraperChain {
    strategies: Vec<SharedScraper>,
    min_length: usize,
}

impl ScraperChain {
    pub fn new(strategies: Vec<SharedScraper>, min_length: usize) -> Self {
        Self { strategies, min_length }
    }

    /// Adequacy threshold in characters
    pub fn min_length(&self) -> usize {
        self.min_length
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Try each strategy once, in order, until one yields adequate text
    pub async fn scrape(&self, url: &str) -> ScrapeOutcome {
        let mut outcome = ScrapeOutcome::default();

        for strategy in &self.strategies {
            let attempt = match strategy.scrape(url).await {
                Ok(text) => ScrapeAttempt::new(strategy.name(), text, self.min_length),
                Err(e) => {
                    debug!("Strategy {} failed for {}: {}", strategy.name(), url, e);
                    ScrapeAttempt::failed(strategy.name())
                }
            };

            let success = attempt.success;
            if success {
                outcome.text = attempt.text.clone();
                outcome.strategy = Some(attempt.strategy.clone());
            } else if attempt.length > 0 {
                debug!(
                    "Strategy {} returned {} chars for {} (below {})",
                    strategy.name(),
                    attempt.length,
                    url,
                    self.min_length
                );
            }
            outcome.attempts.push(attempt);

            if success {
                break;
            }
        }

        outcome
    }

    /// Scrape a candidate unless it already carries adequate content.
    ///
    /// Returns the name of the strategy that filled it.
    pub async fn enrich_candidate(&self, candidate: &mut Candidate) -> Option<String> {
        if candidate.has_adequate_content(self.min_length) {
            debug!("Content already present for {}, skipping scrape", candidate.url);
            return None;
        }

        let outcome = self.scrape(&candidate.url).await;
        match (outcome.text, outcome.strategy) {
            (Some(text), Some(strategy)) => {
                info!("Scraped {} using {}", candidate.url, strategy);
                candidate.apply_scraped(text);
                Some(strategy)
            }
            _ => {
                warn!("All scrapers failed for {}", candidate.url);
                None
            }
        }
    }

    /// Enrich every candidate, one at a time, preserving order
    pub async fn enrich_all(&self, candidates: &mut [Candidate]) -> usize {
        let mut scraped = 0;
        for candidate in candidates.iter_mut() {
            if self.enrich_candidate(candidate).await.is_some() {
                scraped += 1;
            }
        }
        scraped
    }
}

/// Marker the extraction prompt uses for pages without main content
pub const NO_MAIN_CONTENT: &str = "NO_MAIN_CONTENT_FOUND";

const LLM_EXTRACT_SYSTEM_PROMPT: &str = r#"
You are an expert web content extraction assistant. Extract the main textual content (article body,
main information) from the provided HTML, stripping navigation menus, headers, footers,
advertisements and sidebars. Present readable, coherent text only.

If the HTML is non-textual (an image page, an error page with no clear article), respond with
exactly: NO_MAIN_CONTENT_FOUND
"#;

/// Main-content extraction from raw HTML by the model
pub struct LlmScraper {
    client: Client,
    backend: SharedBackend,
    html_limit: usize,
}

impl LlmScraper {
    pub fn new(client: Client, backend: SharedBackend) -> Self {
        Self {
            client,
            backend,
            html_limit: 8000,
        }
    }

    pub fn with_html_limit(mut self, html_limit: usize) -> Self {
        self.html_limit = html_limit;
        self
    }

    /// Extract main content from already-fetched HTML
    pub async fn extract(&self, url: &str, html: &str) -> Result<Option<String>, WebError> {
        let html = truncate_chars(html, self.html_limit);
        let user = format!(
            "Source URL: {}\n\nHTML Content:\n{}\n\nExtract the main textual content from the HTML above.",
            url, html
        );

        let response = self
            .backend
            .generate(LLM_EXTRACT_SYSTEM_PROMPT, &user)
            .await
            .map_err(|e| WebError::InvalidResponse(format!("llm extraction: {}", e)))?;

        if response.contains(NO_MAIN_CONTENT) {
            debug!("No main content found in {}", url);
            return Ok(None);
        }

        let text = response.trim();
        Ok(if text.is_empty() { None } else { Some(text.to_string()) })
    }
}

#[async_trait]
impl ScrapeStrategy for LlmScraper {
    fn name(&self) -> &str {
        "llm"
    }

    async fn scrape(&self, url: &str) -> Result<Option<String>, WebError> {
        match fetch_html(&self.client, url).await? {
            Some(html) => self.extract(url, &html).await,
            None => Ok(None),
        }
    }
}
