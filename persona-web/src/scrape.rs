//! Page scrape strategies
//!
//! Fetches pages and extracts readable text. A strategy returns `Ok(None)`
//! when it reached the page but found nothing usable; transport problems are
//! errors. The fallback chain treats both the same way.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use scraper::Html;
use tracing::{debug, warn};

use crate::search::selector;
use crate::{truncate_chars, WebError};

/// Strategy for turning a URL into page text
#[async_trait]
pub trait ScrapeStrategy: Send + Sync {
    /// Strategy name used in logs and scrape attempts
    fn name(&self) -> &str;

    /// Fetch the page and extract its text
    async fn scrape(&self, url: &str) -> Result<Option<String>, WebError>;
}

/// Shared strategy handle
pub type SharedScraper = Arc<dyn ScrapeStrategy>;

/// Scraped content from a page
#[derive(Debug, Clone)]
pub struct ScrapedPage {
    /// Original URL
    pub url: String,
    /// Page title (if found)
    pub title: Option<String>,
    /// Extracted text content
    pub text: String,
    /// Character count
    pub char_count: usize,
    /// Whether content was truncated
    pub truncated: bool,
}

impl ScrapedPage {
    fn from_html(url: &str, html: &str, max_chars: usize) -> Result<Self, WebError> {
        let (title, text) = extract_content(html)?;

        let char_count = text.chars().count();
        let truncated = char_count > max_chars;
        let text = if truncated {
            format!("{}...(truncated)", truncate_chars(&text, max_chars))
        } else {
            text
        };

        Ok(Self {
            url: url.to_string(),
            title,
            char_count: text.chars().count(),
            text,
            truncated,
        })
    }

    /// Page text, or `None` when nothing was extracted
    pub fn into_text(self) -> Option<String> {
        if self.text.is_empty() {
            None
        } else {
            Some(self.text)
        }
    }
}

/// Default maximum characters kept per page
pub const MAX_CONTENT_LENGTH: usize = 20_000;

/// Fetch raw HTML. Non-success statuses yield `Ok(None)`.
pub async fn fetch_html(client: &Client, url: &str) -> Result<Option<String>, WebError> {
    debug!("Fetching: {}", url);

    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        warn!("Fetch of {} returned status: {}", url, response.status());
        return Ok(None);
    }

    Ok(Some(response.text().await?))
}

/// Plain HTTP fetch followed by text extraction
pub struct HttpScraper {
    client: Client,
    max_chars: usize,
}

impl HttpScraper {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            max_chars: MAX_CONTENT_LENGTH,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    /// Fetch and extract a page
    pub async fn scrape_page(&self, url: &str) -> Result<Option<ScrapedPage>, WebError> {
        let Some(html) = fetch_html(&self.client, url).await? else {
            return Ok(None);
        };
        ScrapedPage::from_html(url, &html, self.max_chars).map(Some)
    }
}

#[async_trait]
impl ScrapeStrategy for HttpScraper {
    fn name(&self) -> &str {
        "http"
    }

    async fn scrape(&self, url: &str) -> Result<Option<String>, WebError> {
        Ok(self.scrape_page(url).await?.and_then(ScrapedPage::into_text))
    }
}

/// Fetch through a headless-browser render service.
///
/// The service receives `{"url": ...}` and answers with the rendered HTML,
/// which covers pages that only produce content after scripts run.
pub struct RenderedScraper {
    client: Client,
    endpoint: String,
    max_chars: usize,
}

impl RenderedScraper {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            max_chars: MAX_CONTENT_LENGTH,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

#[async_trait]
impl ScrapeStrategy for RenderedScraper {
    fn name(&self) -> &str {
        "rendered"
    }

    async fn scrape(&self, url: &str) -> Result<Option<String>, WebError> {
        debug!("Rendering {} via {}", url, self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(WebError::Status {
                status: response.status().as_u16(),
                url: self.endpoint.clone(),
            });
        }

        let html = response.text().await?;
        Ok(ScrapedPage::from_html(url, &html, self.max_chars)?.into_text())
    }
}

/// Extract title and text content from HTML
pub fn extract_content(html: &str) -> Result<(Option<String>, String), WebError> {
    use scraper::node::Node;

    let document = Html::parse_document(html);

    let title_selector = selector("title")?;
    let title = document
        .select(&title_selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let body_selector = selector("body")?;
    let Some(body) = document.select(&body_selector).next() else {
        return Ok((title, String::new()));
    };

    let mut text_parts = Vec::new();

    for node_ref in body.descendants() {
        if let Node::Text(text_node) = node_ref.value() {
            let in_excluded = node_ref.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .map(|el| matches!(el.name(), "script" | "style" | "noscript" | "template"))
                    .unwrap_or(false)
            });

            if !in_excluded {
                let trimmed = text_node.trim();
                if !trimmed.is_empty() {
                    text_parts.push(trimmed.to_string());
                }
            }
        }
    }

    Ok((title, normalize_whitespace(&text_parts.join(" "))))
}

/// Normalize whitespace in text
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
