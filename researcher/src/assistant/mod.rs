pub mod agents;
pub mod configuration;
pub mod error;
pub mod graph;
pub mod llm;
pub mod prompts;
pub mod retry;
pub mod search;
pub mod state;
pub mod utils;
