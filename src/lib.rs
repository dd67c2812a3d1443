//! Autonomous browsing agent.
//!
//! An [`agent::Executor`] drives a browser toward a natural-language goal.
//! Every step it tags the page's interactive elements, asks a decision
//! oracle for exactly one directive, and either performs it or extracts
//! structured data from the page once it looks final.

pub mod agent;
pub mod backend;
pub mod brain;
pub mod config;
pub mod dom;
pub mod error;
pub mod hands;
pub mod memory;
pub mod normalizer;
pub mod session;
pub mod types;

pub use agent::{Executor, FailureReason, SessionOutcome, SessionStatus};
pub use backend::ResilientClient;
pub use brain::{BackendOracle, Brain, DecisionOracle, OpenAiOracle};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use hands::{BrowserDriver, ChromeSession};
pub use normalizer::ExtractionResult;
pub use types::ActionDirective;
