//! Web search providers
//!
//! Each provider turns a query into a list of [`Candidate`]s. Providers are
//! interchangeable behind [`SearchProvider`]; the agent stage does not care
//! which one produced a result.

use std::sync::Arc;

use async_trait::async_trait;
use persona_core::{Candidate, SNIPPET_PREVIEW_LENGTH};
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{truncate_chars, WebError};

/// Web search collaborator
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Provider name, recorded on every candidate it produces
    fn name(&self) -> &str;

    /// Run one query, returning at most `max_results` candidates
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Candidate>, WebError>;
}

/// Shared provider handle
pub type SharedSearch = Arc<dyn SearchProvider>;

pub(crate) fn selector(css: &str) -> Result<Selector, WebError> {
    Selector::parse(css).map_err(|e| WebError::InvalidResponse(format!("selector {}: {:?}", css, e)))
}

// ---------------------------------------------------------------------------
// DuckDuckGo (HTML endpoint, no key)
// ---------------------------------------------------------------------------

const DUCKDUCKGO_BASE_URL: &str = "https://html.duckduckgo.com";

/// DuckDuckGo HTML search
pub struct DuckDuckGoSearch {
    client: Client,
    base_url: String,
}

impl DuckDuckGoSearch {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: DUCKDUCKGO_BASE_URL.to_string(),
        }
    }

    /// Point the provider at another host (used by tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Candidate>, WebError> {
        let url = format!("{}/html/?q={}", self.base_url, urlencoding::encode(query));
        debug!("DuckDuckGo query: {}", query);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(WebError::Status {
                status: response.status().as_u16(),
                url,
            });
        }

        let html = response.text().await?;
        let mut results = parse_duckduckgo_results(&html, self.name())?;
        results.truncate(max_results);

        debug!("DuckDuckGo returned {} results", results.len());
        Ok(results)
    }
}

/// Parse result blocks from a DuckDuckGo HTML page
fn parse_duckduckgo_results(html: &str, provider: &str) -> Result<Vec<Candidate>, WebError> {
    let document = Html::parse_document(html);
    let result_selector = selector(".result")?;
    let link_selector = selector("a.result__a")?;
    let snippet_selector = selector(".result__snippet")?;

    let mut results = Vec::new();

    for block in document.select(&result_selector) {
        let Some(link) = block.select(&link_selector).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(url) = resolve_duckduckgo_href(href) else {
            continue;
        };

        let title = link.text().collect::<String>().trim().to_string();
        let snippet = block
            .select(&snippet_selector)
            .next()
            .map(|s| s.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|s| !s.is_empty());

        let mut candidate = Candidate::new(url, title, provider);
        candidate.snippet = snippet;
        results.push(candidate);
    }

    Ok(results)
}

/// DuckDuckGo wraps result links in a redirect carrying the target in `uddg`
fn resolve_duckduckgo_href(href: &str) -> Option<String> {
    let absolute = href.starts_with("http://") || href.starts_with("https://");
    if absolute && !href.contains("duckduckgo.com/l/") {
        return Some(href.to_string());
    }

    let query = href.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "uddg")
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|decoded| decoded.into_owned())
}

// ---------------------------------------------------------------------------
// Brave Web Search API
// ---------------------------------------------------------------------------

const BRAVE_BASE_URL: &str = "https://api.search.brave.com";

/// Brave Web Search
pub struct BraveSearch {
    client: Client,
    api_key: String,
    base_url: String,
}

impl BraveSearch {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: BRAVE_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

// Brave Search API response types
#[derive(Debug, Deserialize)]
struct BraveSearchResponse {
    #[serde(default)]
    web: Option<BraveWebResults>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResults {
    #[serde(default)]
    results: Vec<BraveWebResult>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait]
impl SearchProvider for BraveSearch {
    fn name(&self) -> &str {
        "brave"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Candidate>, WebError> {
        if self.api_key.is_empty() {
            return Err(WebError::MissingApiKey("brave".into()));
        }

        let url = format!(
            "{}/res/v1/web/search?q={}&count={}",
            self.base_url,
            urlencoding::encode(query),
            max_results
        );

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(WebError::Status {
                status: response.status().as_u16(),
                url,
            });
        }

        let body: BraveSearchResponse = response
            .json()
            .await
            .map_err(|e| WebError::InvalidResponse(format!("brave: {}", e)))?;

        let results: Vec<Candidate> = body
            .web
            .map(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .take(max_results)
            .map(|r| {
                let mut candidate = Candidate::new(r.url, r.title, "brave");
                candidate.snippet = r.description.filter(|d| !d.is_empty());
                candidate
            })
            .collect();

        debug!("Brave returned {} results", results.len());
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// SerpApi (Google organic results)
// ---------------------------------------------------------------------------

const SERPAPI_BASE_URL: &str = "https://serpapi.com";

/// SerpApi search over the Google engine
pub struct SerpApiSearch {
    client: Client,
    api_key: String,
    base_url: String,
}

impl SerpApiSearch {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: SERPAPI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct SerpApiResponse {
    #[serde(default)]
    organic_results: Vec<SerpApiResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SerpApiResult {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
}

#[async_trait]
impl SearchProvider for SerpApiSearch {
    fn name(&self) -> &str {
        "serpapi"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Candidate>, WebError> {
        if self.api_key.is_empty() {
            return Err(WebError::MissingApiKey("serpapi".into()));
        }

        let url = format!("{}/search.json", self.base_url);
        let count = max_results.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("engine", "google"),
                ("q", query),
                ("num", count.as_str()),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(WebError::Status {
                status: response.status().as_u16(),
                url,
            });
        }

        let body: SerpApiResponse = response
            .json()
            .await
            .map_err(|e| WebError::InvalidResponse(format!("serpapi: {}", e)))?;
        if let Some(error) = body.error {
            return Err(WebError::InvalidResponse(format!("serpapi: {}", error)));
        }

        let results: Vec<Candidate> = body
            .organic_results
            .into_iter()
            .filter_map(|r| {
                let Some(link) = r.link.filter(|l| !l.is_empty()) else {
                    warn!("SerpApi result without a link: {:?}", r.title);
                    return None;
                };
                let title = r.title.unwrap_or_else(|| "No Title Provided".to_string());
                let mut candidate = Candidate::new(link, title, "serpapi");
                candidate.snippet = r.snippet.filter(|s| !s.is_empty());
                Some(candidate)
            })
            .take(max_results)
            .collect();

        debug!("SerpApi returned {} results", results.len());
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Tavily API (returns page content alongside each result)
// ---------------------------------------------------------------------------

const TAVILY_BASE_URL: &str = "https://api.tavily.com";

/// Tavily search
pub struct TavilySearch {
    client: Client,
    api_key: String,
    base_url: String,
}

impl TavilySearch {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: TAVILY_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl SearchProvider for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Candidate>, WebError> {
        if self.api_key.is_empty() {
            return Err(WebError::MissingApiKey("tavily".into()));
        }

        let url = format!("{}/search", self.base_url);
        let payload = serde_json::json!({
            "query": query,
            "search_depth": "basic",
            "max_results": max_results,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(WebError::Status {
                status: response.status().as_u16(),
                url,
            });
        }

        let body: TavilyResponse = response
            .json()
            .await
            .map_err(|e| WebError::InvalidResponse(format!("tavily: {}", e)))?;

        let mut results = Vec::new();
        for item in body.results.into_iter().take(max_results) {
            let Some(link) = item.url.filter(|u| !u.is_empty()) else {
                warn!("Tavily result without url skipped");
                continue;
            };

            let title = item.title.unwrap_or_else(|| "No Title Provided".to_string());
            let mut candidate = Candidate::new(link, title, "tavily");
            if let Some(content) = item.content.filter(|c| !c.is_empty()) {
                candidate.snippet = Some(format!(
                    "{}...",
                    truncate_chars(&content, SNIPPET_PREVIEW_LENGTH)
                ));
                candidate.content = Some(content);
            }
            results.push(candidate);
        }

        debug!("Tavily returned {} results", results.len());
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DDG_PAGE: &str = r#"
        <html><body>
          <div class="result">
            <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fjane-doe&amp;rut=abc">Jane Doe - ExampleCorp</a>
            <a class="result__snippet">Jane Doe is the   CEO of ExampleCorp.</a>
          </div>
          <div class="result">
            <a class="result__a" href="https://news.example.org/profile">Profile</a>
          </div>
          <div class="result">
            <span>no link here</span>
          </div>
        </body></html>
    "#;

    #[test]
    fn test_parse_duckduckgo_results() {
        let results = parse_duckduckgo_results(DDG_PAGE, "duckduckgo").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://example.com/jane-doe");
        assert_eq!(results[0].title, "Jane Doe - ExampleCorp");
        assert_eq!(
            results[0].snippet.as_deref(),
            Some("Jane Doe is the CEO of ExampleCorp.")
        );
        assert_eq!(results[1].url, "https://news.example.org/profile");
        assert!(results[1].snippet.is_none());
        assert!(results.iter().all(|r| r.source_provider == "duckduckgo"));
    }

    #[test]
    fn test_resolve_duckduckgo_href() {
        assert_eq!(
            resolve_duckduckgo_href("https://example.com/a").as_deref(),
            Some("https://example.com/a")
        );
        assert!(resolve_duckduckgo_href("/relative/path").is_none());
    }

    #[tokio::test]
    async fn test_duckduckgo_search_respects_max_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/html/"))
            .and(query_param("q", "Jane Doe"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DDG_PAGE))
            .mount(&server)
            .await;

        let provider = DuckDuckGoSearch::new(Client::new()).with_base_url(server.uri());
        let results = provider.search("Jane Doe", 1).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_duckduckgo_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = DuckDuckGoSearch::new(Client::new()).with_base_url(server.uri());
        let err = provider.search("anything", 3).await.unwrap_err();
        assert!(matches!(err, WebError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_brave_search() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/res/v1/web/search"))
            .and(header("X-Subscription-Token", "key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "web": { "results": [
                    { "title": "Jane Doe", "url": "https://example.com/jd", "description": "CEO" },
                    { "title": "Other", "url": "https://example.com/other", "description": "" }
                ]}
            })))
            .mount(&server)
            .await;

        let provider = BraveSearch::new(Client::new(), "key").with_base_url(server.uri());
        let results = provider.search("Jane Doe", 5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].snippet.as_deref(), Some("CEO"));
        assert!(results[1].snippet.is_none());
        assert_eq!(results[0].source_provider, "brave");
    }

    #[tokio::test]
    async fn test_brave_without_key() {
        let provider = BraveSearch::new(Client::new(), "");
        let err = provider.search("q", 3).await.unwrap_err();
        assert!(matches!(err, WebError::MissingApiKey(_)));
    }

    #[tokio::test]
    async fn test_serpapi_search() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search.json"))
            .and(query_param("engine", "google"))
            .and(query_param("q", "Jane Doe"))
            .and(query_param("api_key", "key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "organic_results": [
                    { "title": "Jane Doe - ExampleCorp", "link": "https://example.com/jd", "snippet": "CEO" },
                    { "title": "Missing link" },
                    { "link": "https://example.com/untitled" },
                    { "title": "Over the limit", "link": "https://example.com/extra" }
                ]
            })))
            .mount(&server)
            .await;

        let provider = SerpApiSearch::new(Client::new(), "key").with_base_url(server.uri());
        let results = provider.search("Jane Doe", 2).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://example.com/jd");
        assert_eq!(results[0].snippet.as_deref(), Some("CEO"));
        assert_eq!(results[1].title, "No Title Provided");
        assert_eq!(results[1].source_provider, "serpapi");
    }

    #[tokio::test]
    async fn test_serpapi_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "Invalid API key."
            })))
            .mount(&server)
            .await;

        let provider = SerpApiSearch::new(Client::new(), "bad").with_base_url(server.uri());
        let err = provider.search("Jane Doe", 3).await.unwrap_err();
        assert!(matches!(err, WebError::InvalidResponse(_)));

        let keyless = SerpApiSearch::new(Client::new(), "");
        assert!(matches!(keyless.search("q", 3).await, Err(WebError::MissingApiKey(_))));
    }

    #[tokio::test]
    async fn test_tavily_prefills_content() {
        let server = MockServer::start().await;
        let long = "Jane Doe leads ExampleCorp. ".repeat(20);
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    { "title": "Jane", "url": "https://example.com/jane", "content": long },
                    { "title": "No url", "content": "ignored" }
                ]
            })))
            .mount(&server)
            .await;

        let provider = TavilySearch::new(Client::new(), "key").with_base_url(server.uri());
        let results = provider.search("Jane Doe", 3).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].has_adequate_content(100));
        let snippet = results[0].snippet.as_deref().unwrap();
        assert_eq!(snippet.chars().count(), SNIPPET_PREVIEW_LENGTH + 3);
    }
}
