use thiserror::Error;

use crate::types::ElementId;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("All {attempts} endpoints failed, last error: {last_error}")]
    EndpointsExhausted { attempts: usize, last_error: String },

    #[error("Oracle protocol error: {0}")]
    OracleProtocol(String),

    #[error("Element {id} is not present on the current page")]
    StaleElement { id: ElementId },

    #[error("Navigation did not complete within {0:?}")]
    NavigationTimeout(std::time::Duration),

    #[error("Extraction schema error: {0}")]
    ExtractionSchema(String),

    #[error("Browser session lost: {0}")]
    SessionLost(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Recoverable errors cost one step and the loop goes on deciding.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::StaleElement { .. }
                | AgentError::NavigationTimeout(_)
                | AgentError::Browser(_)
                | AgentError::OracleProtocol(_)
                | AgentError::ExtractionSchema(_)
        )
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
