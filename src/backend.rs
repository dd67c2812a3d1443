use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::types::ElementCatalog;

/// Operations exposed by a backend endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Navigate,
    Scrape,
    ScrapeChapter,
    SuggestAction,
    ChainScrape,
}

impl Operation {
    pub fn path(self) -> &'static str {
        match self {
            Operation::Navigate => "navigate",
            Operation::Scrape => "scrape",
            Operation::ScrapeChapter => "scrape_chapter",
            Operation::SuggestAction => "suggest_action",
            Operation::ChainScrape => "chain-scrape",
        }
    }

    /// Multi-step operations get the longer timeout.
    pub fn is_compound(self) -> bool {
        matches!(self, Operation::ChainScrape)
    }
}

/// `{status: success|error, data|message}` reply envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope {
    Success {
        #[serde(default)]
        data: Value,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

impl Envelope {
    pub fn success(data: impl Serialize) -> Self {
        Envelope::Success {
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigateRequest {
    pub url: String,
}

/// What `/navigate` reports about the opened page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSummary {
    pub current_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub elements: ElementCatalog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainScrapeRequest {
    pub url: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
}

/// Issues backend requests against an ordered endpoint list, failing over
/// sequentially on transport errors and 5xx replies.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    endpoints: Vec<String>,
    client: Client,
    timeout: Duration,
    compound_timeout: Duration,
}

impl ResilientClient {
    pub fn new(endpoints: Vec<String>, timeout: Duration, compound_timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(AgentError::Config(
                "at least one backend endpoint is required".into(),
            ));
        }
        Ok(Self {
            endpoints,
            client: Client::new(),
            timeout,
            compound_timeout,
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Self::new(
            config.endpoints.clone(),
            config.request_timeout,
            config.compound_timeout,
        )
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Posts `payload` to `operation` on each endpoint in order until one
    /// answers, returning the envelope's `data`.
    pub async fn call<P: Serialize + ?Sized>(&self, operation: Operation, payload: &P) -> Result<Value> {
        let timeout = if operation.is_compound() {
            self.compound_timeout
        } else {
            self.timeout
        };
        let mut last_error = String::from("no endpoint attempted");

        for (attempt, endpoint) in self.endpoints.iter().enumerate() {
            let url = format!("{}/{}", endpoint.trim_end_matches('/'), operation.path());
            tracing::debug!(attempt = attempt + 1, url = %url, "backend request");

            let response = match self
                .client
                .post(&url)
                .timeout(timeout)
                .json(payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "endpoint unreachable, trying next");
                    last_error = format!("{url}: {e}");
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                tracing::warn!(endpoint = %endpoint, status = status.as_u16(), "endpoint failed, trying next");
                last_error = format!("{url}: HTTP {}", status.as_u16());
                continue;
            }

            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "reply body lost, trying next");
                    last_error = format!("{url}: {e}");
                    continue;
                }
            };

            if !status.is_success() {
                return Err(AgentError::Backend {
                    status: status.as_u16(),
                    message: error_message(&body),
                });
            }

            return match serde_json::from_str::<Envelope>(&body) {
                Ok(Envelope::Success { data }) => Ok(data),
                Ok(Envelope::Error { message }) => Err(AgentError::Backend {
                    status: status.as_u16(),
                    message,
                }),
                Err(e) => Err(AgentError::Backend {
                    status: status.as_u16(),
                    message: format!("malformed reply from {url}: {e}"),
                }),
            };
        }

        tracing::error!(attempts = self.endpoints.len(), "all backend endpoints failed");
        Err(AgentError::EndpointsExhausted {
            attempts: self.endpoints.len(),
            last_error,
        })
    }

    async fn call_typed<P, T>(&self, operation: Operation, payload: &P) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let data = self.call(operation, payload).await?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn navigate(&self, url: &str) -> Result<PageSummary> {
        self.call_typed(Operation::Navigate, &NavigateRequest { url: url.to_string() })
            .await
    }

    pub async fn chain_scrape(&self, request: &ChainScrapeRequest) -> Result<Value> {
        self.call(Operation::ChainScrape, request).await
    }
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<Envelope>(body) {
        Ok(Envelope::Error { message }) => message,
        _ => body.chars().take(200).collect(),
    }
}
