//! Blocked-domain registry
//!
//! Social-media and video hosts rarely carry citable profile material, so
//! results from them are dropped before any relevance judgment is spent.

use serde::{Deserialize, Serialize};
use url::Url;

/// Default list of blocked domain substrings
pub static DEFAULT_BLOCKED_DOMAINS: &[&str] = &[
    "facebook.com",
    "fb.com",
    "twitter.com",
    "t.co",
    "instagram.com",
    "tiktok.com",
    "pinterest.com",
    "reddit.com",
    "dailymotion.com",
    "vimeo.com",
];

/// Host-substring blocklist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainBlocklist {
    domains: Vec<String>,
}

impl Default for DomainBlocklist {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_DOMAINS.iter().map(|d| d.to_string()))
    }
}

impl DomainBlocklist {
    pub fn new(domains: impl IntoIterator<Item = String>) -> Self {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// An empty blocklist (nothing is blocked)
    pub fn empty() -> Self {
        Self { domains: Vec::new() }
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Whether the URL's host matches a blocked substring.
    ///
    /// URLs that cannot be parsed, or have no host, are not blocked.
    pub fn is_blocked(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.to_lowercase();
        self.domains.iter().any(|blocked| host.contains(blocked.as_str()))
    }
}
