//! Relevance Filter
//!
//! Two phases: candidates on blocked hosts are dropped without spending a
//! judgment, then every survivor is judged concurrently. The kept subset
//! preserves the original relative order regardless of completion order.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use persona_core::{Candidate, DomainBlocklist, Relevance};
use tracing::{debug, info, warn};

use crate::{AgentError, RelevanceJudge, SharedBackend};

/// System prompt for relevance judgment
const JUDGE_SYSTEM_PROMPT: &str = r#"
You are a meticulous researcher and fact-checker specializing in identity disambiguation.
Determine with high confidence whether an article is about a specific person of interest or about
someone else with the same name. Avoid false positives.

Process:
1. Identify the person's key identifiers (company, role, location, field) from their details
2. Extract the identifying details of the article
3. Look for matching details and for conflicting ones (same name, different background)
4. If the article is too generic to decide confidently, it is not relevant

Answer on a single line: Relevance: YES or Relevance: NO
"#;

/// Whether a model answer is a "yes" verdict
pub fn parse_verdict(response: &str) -> bool {
    response
        .split(|c: char| !c.is_ascii_alphabetic())
        .any(|word| word.eq_ignore_ascii_case("yes"))
}

/// Relevance judge backed by the LLM
pub struct LlmRelevanceJudge {
    backend: SharedBackend,
}

impl LlmRelevanceJudge {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl RelevanceJudge for LlmRelevanceJudge {
    async fn judge(&self, subject: &str, focus: &str, candidate: &Candidate) -> Result<bool, AgentError> {
        let user = format!(
            "[PERSON OF INTEREST]\n{}\n\n[CONTEXT OF SEARCH]\n{}\n\n[ARTICLE]\nTitle: {}\nSnippet: {}\nLink: {}",
            subject,
            focus,
            candidate.title,
            candidate.snippet.as_deref().unwrap_or(""),
            candidate.url
        );

        let response = self.backend.generate(JUDGE_SYSTEM_PROMPT, &user).await?;
        Ok(parse_verdict(&response))
    }
}

/// Blocklist plus concurrent relevance judgment
pub struct RelevanceFilter {
    judge: Arc<dyn RelevanceJudge>,
    blocklist: DomainBlocklist,
}

impl RelevanceFilter {
    pub fn new(judge: Arc<dyn RelevanceJudge>, blocklist: DomainBlocklist) -> Self {
        Self { judge, blocklist }
    }

    pub fn blocklist(&self) -> &DomainBlocklist {
        &self.blocklist
    }

    /// Keep the candidates judged relevant, in their original order
    pub async fn filter(&self, subject: &str, focus: &str, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let total = candidates.len();

        // Phase 1: blocked hosts
        let survivors: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| {
                let blocked = self.blocklist.is_blocked(&c.url);
                if blocked {
                    debug!("Filtering out blocked domain: {}", c.url);
                }
                !blocked
            })
            .collect();

        if survivors.is_empty() {
            info!("Filter: 0 of {} candidates survived the blocklist", total);
            return survivors;
        }

        // Phase 2: one judgment per survivor, all in flight at once
        let judgments = join_all(
            survivors
                .iter()
                .map(|candidate| self.judge.judge(subject, focus, candidate)),
        )
        .await;

        let kept: Vec<Candidate> = survivors
            .into_iter()
            .zip(judgments)
            .filter_map(|(mut candidate, verdict)| {
                let relevant = match verdict {
                    Ok(relevant) => relevant,
                    Err(e) => {
                        warn!("Relevance judgment failed for {}: {}", candidate.url, e);
                        false
                    }
                };

                if relevant {
                    candidate.relevant = Relevance::Relevant;
                    Some(candidate)
                } else {
                    debug!("Not relevant: {}", candidate.url);
                    None
                }
            })
            .collect();

        info!("Filter kept {} of {} candidates", kept.len(), total);
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Judge that answers by URL, sleeping to scramble completion order
    struct ScriptedJudge {
        judged: Mutex<Vec<String>>,
    }

    impl ScriptedJudge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                judged: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RelevanceJudge for ScriptedJudge {
        async fn judge(&self, _subject: &str, _focus: &str, candidate: &Candidate) -> Result<bool, AgentError> {
            self.judged.lock().unwrap().push(candidate.url.clone());

            // Later candidates finish first
            let delay: u64 = candidate.title.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(50 - delay * 10)).await;

            if candidate.url.contains("error") {
                return Err(AgentError::Parse("judge exploded".into()));
            }
            Ok(candidate.url.contains("yes"))
        }
    }

    fn candidate(url: &str, idx: u64) -> Candidate {
        Candidate::new(url, idx.to_string(), "test")
    }

    #[tokio::test]
    async fn test_blocked_hosts_are_never_judged() {
        let judge = ScriptedJudge::new();
        let filter = RelevanceFilter::new(judge.clone(), DomainBlocklist::default());

        let kept = filter
            .filter(
                "Jane Doe",
                "leadership",
                vec![
                    candidate("https://www.facebook.com/yes", 0),
                    candidate("https://example.com/yes", 1),
                ],
            )
            .await;

        assert_eq!(kept.len(), 1);
        assert_eq!(*judge.judged.lock().unwrap(), vec!["https://example.com/yes".to_string()]);
    }

    #[tokio::test]
    async fn test_order_preserved_under_shuffled_completion() {
        let judge = ScriptedJudge::new();
        let filter = RelevanceFilter::new(judge, DomainBlocklist::default());

        let input = vec![
            candidate("https://a.example/yes", 0),
            candidate("https://b.example/no", 1),
            candidate("https://c.example/yes", 2),
            candidate("https://d.example/yes", 3),
        ];
        let kept = filter.filter("Jane Doe", "focus", input).await;

        let urls: Vec<_> = kept.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://a.example/yes", "https://c.example/yes", "https://d.example/yes"]
        );
        assert!(kept.iter().all(|c| c.relevant == Relevance::Relevant));
    }

    #[tokio::test]
    async fn test_failed_judgment_is_no_and_isolated() {
        let judge = ScriptedJudge::new();
        let filter = RelevanceFilter::new(judge.clone(), DomainBlocklist::default());

        let kept = filter
            .filter(
                "Jane Doe",
                "focus",
                vec![
                    candidate("https://error.example/yes", 0),
                    candidate("https://ok.example/yes", 1),
                ],
            )
            .await;

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].url, "https://ok.example/yes");
        assert_eq!(judge.judged.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_urls_fail_open() {
        let judge = ScriptedJudge::new();
        let filter = RelevanceFilter::new(judge.clone(), DomainBlocklist::default());

        let kept = filter
            .filter("Jane Doe", "focus", vec![candidate("not-a-url-yes", 0)])
            .await;
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let filter = RelevanceFilter::new(ScriptedJudge::new(), DomainBlocklist::default());
        assert!(filter.filter("Jane", "focus", Vec::new()).await.is_empty());
    }

    #[test]
    fn test_parse_verdict() {
        assert!(parse_verdict("Relevance: YES"));
        assert!(parse_verdict("yes, this is the same person"));
        assert!(!parse_verdict("Relevance: NO"));
        assert!(!parse_verdict("The EYES of the board"));
    }
}
