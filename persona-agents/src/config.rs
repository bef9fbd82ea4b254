//! Enrichment configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! [scraping]
//! min_content_length = 100
//! strategies = ["http", "rendered", "llm"]
//! render_endpoint = "http://localhost:3000/content"
//!
//! [filter]
//! blocked_domains = ["facebook.com", "tiktok.com"]
//!
//! [search]
//! provider = "tavily"
//! max_results_per_query = 3
//!
//! [report]
//! context_chars_per_source = 1500
//!
//! [http]
//! timeout_secs = 20
//! ```

use std::path::Path;
use std::sync::Arc;

use persona_core::{DomainBlocklist, DEFAULT_BLOCKED_DOMAINS, DEFAULT_MAX_RESULTS, MIN_CONTENT_LENGTH};
use persona_web::{
    BraveSearch, DuckDuckGoSearch, HttpScraper, RenderedScraper, SerpApiSearch, SharedScraper,
    SharedSearch, TavilySearch, WebConfig,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{AgentError, LlmScraper, ScraperChain, SharedBackend};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichConfig {
    pub scraping: ScrapingConfig,
    pub filter: FilterConfig,
    pub search: SearchConfig,
    pub report: ReportConfig,
    pub http: WebConfig,
}

/// Scrape strategy identifiers, in the order they appear in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Http,
    Rendered,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    /// Adequacy threshold in characters
    pub min_content_length: usize,
    /// Strategy order
    pub strategies: Vec<StrategyKind>,
    /// Headless-browser render service, required by the `rendered` strategy
    pub render_endpoint: Option<String>,
    /// Raw HTML characters handed to the LLM extractor
    pub llm_html_limit: usize,
    /// Maximum characters kept per scraped page
    pub max_page_chars: usize,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            min_content_length: MIN_CONTENT_LENGTH,
            strategies: vec![StrategyKind::Http, StrategyKind::Rendered, StrategyKind::Llm],
            render_endpoint: None,
            llm_html_limit: 8000,
            max_page_chars: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub blocked_domains: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocked_domains: DEFAULT_BLOCKED_DOMAINS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Search provider identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProviderKind {
    #[default]
    DuckDuckGo,
    Brave,
    SerpApi,
    Tavily,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub provider: SearchProviderKind,
    pub max_results_per_query: usize,
    /// Queries requested from the model, as a range hint ("3-5")
    pub query_count: String,
    pub brave_api_key: Option<String>,
    pub serpapi_api_key: Option<String>,
    pub tavily_api_key: Option<String>,
    pub brave_api_key_env: String,
    pub serpapi_api_key_env: String,
    pub tavily_api_key_env: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: SearchProviderKind::default(),
            max_results_per_query: DEFAULT_MAX_RESULTS,
            query_count: "3-5".to_string(),
            brave_api_key: None,
            serpapi_api_key: None,
            tavily_api_key: None,
            brave_api_key_env: "BRAVE_API_KEY".to_string(),
            serpapi_api_key_env: "SERPAPI_API_KEY".to_string(),
            tavily_api_key_env: "TAVILY_API_KEY".to_string(),
        }
    }
}

impl SearchConfig {
    fn resolve_key(explicit: &Option<String>, env_var: &str) -> Option<String> {
        explicit
            .clone()
            .or_else(|| std::env::var(env_var).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Overrides the persona's report length bound when set
    pub max_chars: Option<usize>,
    /// Characters of each source's content given to the compile step
    pub context_chars_per_source: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            max_chars: None,
            context_chars_per_source: 1500,
        }
    }
}

impl EnrichConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, AgentError> {
        toml::from_str(content).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AgentError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn blocklist(&self) -> DomainBlocklist {
        DomainBlocklist::new(self.filter.blocked_domains.iter().cloned())
    }

    /// Build the configured search provider
    pub fn search_provider(&self, client: &Client) -> Result<SharedSearch, AgentError> {
        let search = &self.search;
        let provider: SharedSearch = match search.provider {
            SearchProviderKind::DuckDuckGo => Arc::new(DuckDuckGoSearch::new(client.clone())),
            SearchProviderKind::Brave => {
                let key = SearchConfig::resolve_key(&search.brave_api_key, &search.brave_api_key_env)
                    .ok_or_else(|| AgentError::Config(format!("{} is not set", search.brave_api_key_env)))?;
                Arc::new(BraveSearch::new(client.clone(), key))
            }
            SearchProviderKind::SerpApi => {
                let key = SearchConfig::resolve_key(&search.serpapi_api_key, &search.serpapi_api_key_env)
                    .ok_or_else(|| AgentError::Config(format!("{} is not set", search.serpapi_api_key_env)))?;
                Arc::new(SerpApiSearch::new(client.clone(), key))
            }
            SearchProviderKind::Tavily => {
                let key = SearchConfig::resolve_key(&search.tavily_api_key, &search.tavily_api_key_env)
                    .ok_or_else(|| AgentError::Config(format!("{} is not set", search.tavily_api_key_env)))?;
                Arc::new(TavilySearch::new(client.clone(), key))
            }
        };
        Ok(provider)
    }

    /// Build the scraper chain in configured order
    pub fn scraper_chain(&self, client: &Client, backend: SharedBackend) -> ScraperChain {
        let scraping = &self.scraping;
        let mut strategies: Vec<SharedScraper> = Vec::new();

        for kind in &scraping.strategies {
            match kind {
                StrategyKind::Http => strategies.push(Arc::new(
                    HttpScraper::new(client.clone()).with_max_chars(scraping.max_page_chars),
                )),
                StrategyKind::Rendered => match &scraping.render_endpoint {
                    Some(endpoint) => strategies.push(Arc::new(
                        RenderedScraper::new(client.clone(), endpoint.clone())
                            .with_max_chars(scraping.max_page_chars),
                    )),
                    None => warn!("Rendered scraping enabled without render_endpoint; skipping"),
                },
                StrategyKind::Llm => strategies.push(Arc::new(
                    LlmScraper::new(client.clone(), backend.clone()).with_html_limit(scraping.llm_html_limit),
                )),
            }
        }

        ScraperChain::new(strategies, scraping.min_content_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmBackend, LlmError};
    use async_trait::async_trait;

    struct MockBackend;

    #[async_trait]
    impl LlmBackend for MockBackend {
        async fn generate(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            Ok(String::new())
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EnrichConfig::from_toml_str("").unwrap();
        assert_eq!(config.scraping.min_content_length, 100);
        assert_eq!(config.search.max_results_per_query, 3);
        assert_eq!(config.search.provider, SearchProviderKind::DuckDuckGo);
        assert_eq!(config.report.context_chars_per_source, 1500);
        assert!(config.blocklist().is_blocked("https://facebook.com/x"));
    }

    #[test]
    fn test_partial_sections() {
        let config = EnrichConfig::from_toml_str(
            r#"
            [scraping]
            min_content_length = 250
            strategies = ["llm", "http"]

            [filter]
            blocked_domains = ["example.org"]

            [search]
            provider = "tavily"
            tavily_api_key = "tvly-test"

            [http]
            timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.scraping.min_content_length, 250);
        assert_eq!(config.scraping.strategies, vec![StrategyKind::Llm, StrategyKind::Http]);
        assert_eq!(config.scraping.llm_html_limit, 8000);
        assert!(config.blocklist().is_blocked("https://www.example.org/a"));
        assert!(!config.blocklist().is_blocked("https://facebook.com/a"));
        assert_eq!(config.http.timeout_secs, 5);

        let provider = config.search_provider(&Client::new()).unwrap();
        assert_eq!(provider.name(), "tavily");
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            EnrichConfig::from_toml_str("[scraping]\nmin_content_length = \"many\""),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_brave_requires_key() {
        let mut config = EnrichConfig::default();
        config.search.provider = SearchProviderKind::Brave;
        config.search.brave_api_key_env = "PERSONA_TEST_UNSET_BRAVE_KEY".into();
        assert!(config.search_provider(&Client::new()).is_err());
    }

    #[test]
    fn test_serpapi_provider_from_toml() {
        let config = EnrichConfig::from_toml_str(
            r#"
            [search]
            provider = "serpapi"
            serpapi_api_key = "serp-test"
            "#,
        )
        .unwrap();
        assert_eq!(config.search.provider, SearchProviderKind::SerpApi);
        let provider = config.search_provider(&Client::new()).unwrap();
        assert_eq!(provider.name(), "serpapi");
    }

    #[test]
    fn test_chain_skips_rendered_without_endpoint() {
        let config = EnrichConfig::default();
        let chain = config.scraper_chain(&Client::new(), Arc::new(MockBackend));
        assert_eq!(chain.strategy_names(), vec!["http", "llm"]);

        let mut config = EnrichConfig::default();
        config.scraping.render_endpoint = Some("http://localhost:3000/content".into());
        let chain = config.scraper_chain(&Client::new(), Arc::new(MockBackend));
        assert_eq!(chain.strategy_names(), vec!["http", "rendered", "llm"]);
    }
}
