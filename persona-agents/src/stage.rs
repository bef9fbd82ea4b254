//! Agent Stage
//!
//! The single research template every agent runs:
//! generate queries → search → filter → scrape → compile.
//!
//! A stage never fails past its own boundary. Step failures are recorded on
//! the [`AgentRunState`] (first failure wins) and later steps still run; a
//! compile failure yields the persona's labeled degraded report.

use std::sync::Arc;

use persona_core::{AgentRunState, Stage};
use persona_web::{create_client, SharedSearch};
use tracing::{debug, info, warn};

use crate::{
    render_template, AgentError, AgentProfile, EnrichConfig, LlmRelevanceJudge, PersonaRegistry,
    QueryRefiner, RelevanceFilter, ScraperChain, SharedBackend,
};

/// Context text used when no candidate survived
const NO_RESULTS_CONTEXT: &str = "No relevant search results found.";

/// Tunables shared by all stages
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub max_results_per_query: usize,
    pub context_chars_per_source: usize,
    /// Overrides each persona's report bound when set
    pub report_max_chars: Option<usize>,
    pub query_count: String,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self::from_config(&EnrichConfig::default())
    }
}

impl StageSettings {
    pub fn from_config(config: &EnrichConfig) -> Self {
        Self {
            max_results_per_query: config.search.max_results_per_query,
            context_chars_per_source: config.report.context_chars_per_source,
            report_max_chars: config.report.max_chars,
            query_count: config.search.query_count.clone(),
        }
    }
}

/// Collaborators shared by every stage of a pipeline
#[derive(Clone)]
pub struct StageToolkit {
    pub backend: SharedBackend,
    pub search: SharedSearch,
    pub filter: Arc<RelevanceFilter>,
    pub scraper: Arc<ScraperChain>,
    pub settings: StageSettings,
}

impl StageToolkit {
    /// Wire the production collaborators from configuration
    pub fn from_config(config: &EnrichConfig, backend: SharedBackend) -> Result<Self, AgentError> {
        let client = create_client(&config.http)?;
        let judge = Arc::new(LlmRelevanceJudge::new(backend.clone()));

        Ok(Self {
            search: config.search_provider(&client)?,
            filter: Arc::new(RelevanceFilter::new(judge, config.blocklist())),
            scraper: Arc::new(config.scraper_chain(&client, backend.clone())),
            settings: StageSettings::from_config(config),
            backend,
        })
    }
}

/// One research agent
pub struct AgentStage {
    stage: Stage,
    profile: AgentProfile,
    refiner: QueryRefiner,
    toolkit: StageToolkit,
}

impl AgentStage {
    pub fn new(stage: Stage, profile: AgentProfile, toolkit: StageToolkit) -> Self {
        let refiner = QueryRefiner::new(toolkit.backend.clone()).with_query_count(&toolkit.settings.query_count);
        Self {
            stage,
            profile,
            refiner,
            toolkit,
        }
    }

    /// Build the stage from the registry's persona for `stage`
    pub fn from_registry(stage: Stage, registry: &PersonaRegistry, toolkit: StageToolkit) -> Result<Self, AgentError> {
        let profile = registry.for_stage(stage)?.clone();
        Ok(Self::new(stage, profile, toolkit))
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    /// Run all five steps
    pub async fn run(&self, subject_name: &str, subject_description: &str) -> AgentRunState {
        let mut run = AgentRunState::new(subject_name, subject_description);
        info!("[{}] Researching {}", self.stage, subject_name);

        self.generate_queries(&mut run).await;
        self.search(&mut run).await;
        self.filter(&mut run).await;
        self.scrape(&mut run).await;
        self.compile(&mut run).await;

        run
    }

    async fn generate_queries(&self, run: &mut AgentRunState) {
        let generated = self
            .refiner
            .generate(&self.profile, &run.subject_name, &run.subject_description)
            .await;
        if generated.fallback {
            debug!("[{}] Using fallback queries", self.stage);
        }
        run.queries = generated.queries;
    }

    async fn search(&self, run: &mut AgentRunState) {
        let max_results = self.toolkit.settings.max_results_per_query;

        for query in run.queries.clone() {
            match self.toolkit.search.search(&query, max_results).await {
                Ok(results) => {
                    debug!("[{}] '{}' returned {} results", self.stage, query, results.len());
                    run.candidates.extend(results);
                }
                Err(e) => {
                    warn!("[{}] Search failed for '{}': {}", self.stage, query, e);
                    run.record_error(format!("{} search failed for '{}': {}", self.stage, query, e));
                }
            }
        }

        info!("[{}] {} candidates from {} queries", self.stage, run.candidates.len(), run.queries.len());
    }

    async fn filter(&self, run: &mut AgentRunState) {
        let subject = format!("Name: {}\nProfile: {}", run.subject_name, run.subject_description);
        let candidates = std::mem::take(&mut run.candidates);
        run.candidates = self
            .toolkit
            .filter
            .filter(&subject, self.profile.focus(), candidates)
            .await;
    }

    async fn scrape(&self, run: &mut AgentRunState) {
        let scraped = self.toolkit.scraper.enrich_all(&mut run.candidates).await;
        debug!("[{}] Scraped {} of {} candidates", self.stage, scraped, run.candidates.len());
    }

    async fn compile(&self, run: &mut AgentRunState) {
        let context = self.build_context(run);
        let vars = [
            ("name", run.subject_name.as_str()),
            ("description", run.subject_description.as_str()),
            ("context", context.as_str()),
        ];
        let system = render_template(&self.profile.prompt.report_system, &vars);
        let user = render_template(&self.profile.prompt.report_user, &vars);

        let max_chars = self
            .toolkit
            .settings
            .report_max_chars
            .unwrap_or(self.profile.output.max_chars);

        match self.toolkit.backend.generate(&system, &user).await {
            Ok(report) if !report.trim().is_empty() => {
                run.report = Some(truncate_content(report.trim(), max_chars).to_string());
            }
            Ok(_) => {
                warn!("[{}] Empty report, using degraded text", self.stage);
                run.record_error(format!("{} report generation returned no text", self.stage));
                self.degrade(run);
            }
            Err(e) => {
                warn!("[{}] Report generation failed: {}", self.stage, e);
                run.record_error(format!("{} report generation failed: {}", self.stage, e));
                self.degrade(run);
            }
        }
    }

    fn degrade(&self, run: &mut AgentRunState) {
        run.report = Some(self.profile.degraded_report());
        run.degraded = true;
    }

    /// `(title, content)` context of the surviving candidates
    fn build_context(&self, run: &AgentRunState) -> String {
        let per_source = self.toolkit.settings.context_chars_per_source;

        let chunks: Vec<String> = run
            .candidates
            .iter()
            .filter_map(|c| {
                let content = c.content.as_deref().or(c.snippet.as_deref()).unwrap_or("");
                if c.title.is_empty() && content.is_empty() {
                    return None;
                }
                Some(format!(
                    "Title: {}\nSource: {}\nContent: {}\n",
                    c.title,
                    c.url,
                    truncate_content(content, per_source)
                ))
            })
            .collect();

        if chunks.is_empty() {
            NO_RESULTS_CONTEXT.to_string()
        } else {
            chunks.join("\n---\n")
        }
    }
}

/// Truncate content to a char bound, preferring a whitespace break
pub fn truncate_content(content: &str, max_chars: usize) -> &str {
    let Some((cut, _)) = content.char_indices().nth(max_chars) else {
        return content;
    };

    let truncated = &content[..cut];
    truncated
        .rfind(char::is_whitespace)
        .map(|pos| &content[..pos])
        .unwrap_or(truncated)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{LlmBackend, LlmError, RelevanceJudge};
    use async_trait::async_trait;
    use persona_core::{Candidate, DomainBlocklist};
    use persona_web::{ScrapeStrategy, SearchProvider, SharedScraper, WebError};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted LLM: fails or answers per prompt kind, counts calls
    pub(crate) struct MockBackend {
        pub fail_reports: bool,
        pub report: String,
        pub calls: AtomicUsize,
    }

    impl MockBackend {
        pub fn answering(report: &str) -> Arc<Self> {
            Arc::new(Self {
                fail_reports: false,
                report: report.to_string(),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail_reports: true,
                report: String::new(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmBackend for MockBackend {
        async fn generate(&self, system: &str, _user: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_reports {
                return Err(LlmError::Api("service unavailable".into()));
            }
            if system.contains("data extraction") {
                return Ok(r#"{"queries": ["Jane Doe ExampleCorp"]}"#.to_string());
            }
            Ok(self.report.clone())
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    /// Search returning canned candidates per query
    pub(crate) struct MockSearch {
        pub results: HashMap<String, Vec<Candidate>>,
        pub fail: bool,
        pub queries: Mutex<Vec<String>>,
    }

    impl MockSearch {
        pub fn returning(results: Vec<Candidate>) -> Arc<Self> {
            Arc::new(Self {
                results: HashMap::from([("*".to_string(), results)]),
                fail: false,
                queries: Mutex::new(Vec::new()),
            })
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                results: HashMap::new(),
                fail: true,
                queries: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SearchProvider for MockSearch {
        fn name(&self) -> &str {
            "mock"
        }

        async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Candidate>, WebError> {
            self.queries.lock().unwrap().push(query.to_string());
            if self.fail {
                return Err(WebError::InvalidResponse("search down".into()));
            }
            let results = self
                .results
                .get(query)
                .or_else(|| self.results.get("*"))
                .cloned()
                .unwrap_or_default();
            Ok(results.into_iter().take(max_results).collect())
        }
    }

    /// Judge accepting everything and counting calls
    pub(crate) struct AcceptAll(pub AtomicUsize);

    #[async_trait]
    impl RelevanceJudge for AcceptAll {
        async fn judge(&self, _subject: &str, _focus: &str, _candidate: &Candidate) -> Result<bool, AgentError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    pub(crate) struct CountingScraper {
        pub name: &'static str,
        pub text: Option<String>,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl ScrapeStrategy for CountingScraper {
        fn name(&self) -> &str {
            self.name
        }

        async fn scrape(&self, _url: &str) -> Result<Option<String>, WebError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.text.clone())
        }
    }

    pub(crate) fn toolkit(
        backend: SharedBackend,
        search: SharedSearch,
        judge: Arc<dyn RelevanceJudge>,
        strategies: Vec<SharedScraper>,
    ) -> StageToolkit {
        StageToolkit {
            backend,
            search,
            filter: Arc::new(RelevanceFilter::new(judge, DomainBlocklist::default())),
            scraper: Arc::new(ScraperChain::new(strategies, 100)),
            settings: StageSettings::default(),
        }
    }

    fn leadership(toolkit: StageToolkit) -> AgentStage {
        AgentStage::from_registry(Stage::Leadership, &PersonaRegistry::load_embedded(), toolkit).unwrap()
    }

    #[tokio::test]
    async fn test_jane_doe_scenario() {
        let search = MockSearch::returning(vec![
            Candidate::new("https://www.facebook.com/janedoe", "Jane on Facebook", "mock"),
            Candidate::new("https://example.com/jane-doe", "Jane Doe, CEO", "mock"),
        ]);
        let judge = Arc::new(AcceptAll(AtomicUsize::new(0)));
        let a = Arc::new(CountingScraper {
            name: "a",
            text: Some("Jane Doe has led ExampleCorp since 2015. ".repeat(5)),
            calls: AtomicUsize::new(0),
        });
        let b = Arc::new(CountingScraper {
            name: "b",
            text: Some("unused".repeat(50)),
            calls: AtomicUsize::new(0),
        });

        let stage = leadership(toolkit(
            MockBackend::answering("Jane Doe leads by example."),
            search.clone(),
            judge.clone(),
            vec![a.clone() as SharedScraper, b.clone() as SharedScraper],
        ));
        let run = stage.run("Jane Doe", "CEO of ExampleCorp").await;

        assert_eq!(run.queries, vec!["Jane Doe ExampleCorp"]);
        assert_eq!(run.candidates.len(), 1);
        assert_eq!(run.candidates[0].url, "https://example.com/jane-doe");
        assert!(run.candidates[0].has_adequate_content(100));
        assert_eq!(judge.0.load(Ordering::SeqCst), 1);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
        assert_eq!(run.report.as_deref(), Some("Jane Doe leads by example."));
        assert!(!run.degraded);
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_llm_failure_degrades_without_failing() {
        let search = MockSearch::returning(vec![Candidate::new("https://example.com/a", "A", "mock")]);
        let judge = Arc::new(AcceptAll(AtomicUsize::new(0)));

        let stage = leadership(toolkit(MockBackend::failing(), search.clone(), judge, Vec::new()));
        let run = stage.run("Jane Doe", "CEO").await;

        // fallback queries were searched
        assert_eq!(search.queries.lock().unwrap().len(), 3);
        assert!(run.degraded);
        assert_eq!(run.report.as_deref(), Some(stage.profile().degraded_report().as_str()));
        assert!(run.error.as_deref().unwrap().contains("report generation failed"));
    }

    #[tokio::test]
    async fn test_search_failure_is_recorded_and_compile_still_runs() {
        let judge = Arc::new(AcceptAll(AtomicUsize::new(0)));
        let stage = leadership(toolkit(
            MockBackend::answering("Nothing verifiable was found."),
            MockSearch::failing(),
            judge.clone(),
            Vec::new(),
        ));
        let run = stage.run("Jane Doe", "CEO").await;

        assert!(run.candidates.is_empty());
        assert_eq!(judge.0.load(Ordering::SeqCst), 0);
        assert!(run.error.as_deref().unwrap().contains("search failed"));
        assert_eq!(run.report.as_deref(), Some("Nothing verifiable was found."));
        assert!(!run.degraded);
    }

    #[tokio::test]
    async fn test_report_is_bounded() {
        let search = MockSearch::returning(Vec::new());
        let mut tk = toolkit(
            MockBackend::answering(&"word ".repeat(100)),
            search,
            Arc::new(AcceptAll(AtomicUsize::new(0))),
            Vec::new(),
        );
        tk.settings.report_max_chars = Some(42);

        let run = leadership(tk).run("Jane Doe", "CEO").await;
        assert!(run.report.unwrap().chars().count() <= 42);
    }

    #[test]
    fn test_truncate_content() {
        assert_eq!(truncate_content("short", 10), "short");
        assert_eq!(truncate_content("hello brave new world", 13), "hello brave");
        assert_eq!(truncate_content("abcdefghij", 4), "abcd");
        assert_eq!(truncate_content("héllo wörld", 8), "héllo");
    }
}
