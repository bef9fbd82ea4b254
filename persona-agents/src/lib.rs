//! PersonaGraph Agents
//!
//! Research agents that build a profile of a named subject:
//! - **Refiner**: Generates search queries for an agent's focus
//! - **Filter**: Drops blocked hosts, then judges relevance concurrently
//! - **Scraper**: Fills candidate content through an ordered fallback chain
//! - **Stage**: The generate/search/filter/scrape/compile template every agent runs
//! - **Aggregator**: Composes the agent reports into one profile
//!
//! ## Modular Personas
//!
//! Agent prompts, focus descriptions and fallback queries are defined via TOML
//! persona files in `prompts/`. See [`persona::PersonaRegistry`].

pub mod backend;
pub mod config;
pub mod persona;
pub mod structured;
pub mod refiner;
pub mod filter;
pub mod scraper;
pub mod stage;
pub mod aggregator;
pub mod traits;

pub use backend::*;
pub use config::*;
pub use persona::*;
pub use structured::*;
pub use refiner::*;
pub use filter::*;
pub use scraper::*;
pub use stage::*;
pub use aggregator::*;
pub use traits::*;
