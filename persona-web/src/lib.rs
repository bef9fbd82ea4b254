//! PersonaGraph Web Layer
//!
//! Provides the network-bound collaborators of the research agents:
//! - HTTP client construction (timeouts, optional proxy, user-agent rotation)
//! - Web search providers (DuckDuckGo HTML, Brave, SerpApi, Tavily)
//! - Page scrape strategies (plain HTTP fetch, rendered-page service)
//!
//! Every collaborator carries its own timeout through the shared client; a
//! timeout surfaces as an ordinary [`WebError`].

pub mod client;
pub mod search;
pub mod scrape;

pub use client::*;
pub use search::*;
pub use scrape::*;
