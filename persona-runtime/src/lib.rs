//! PersonaGraph Runtime - workflow execution
//!
//! - A validated, immutable node graph with fan-out and a single fan-in
//! - Pipeline nodes wrapping the research agents and the aggregator
//! - A progress streamer turning a run into a sequence of events

pub mod graph;
pub mod nodes;
pub mod stream;

pub use graph::*;
pub use nodes::*;
pub use stream::*;
