//! Built-in nodes of the commute planning graph.

pub mod classifier;
pub mod reasoner;
pub mod tool_fetch;

pub use classifier::ClassifierNode;
pub use reasoner::ReasonerNode;
pub use tool_fetch::ToolFetchNode;
