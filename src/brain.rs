use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Operation, ResilientClient};
use crate::error::{AgentError, Result};
use crate::memory::ConversationTurn;
use crate::normalizer::{ExtractionResult, bracketed_span, normalize, strip_fences};
use crate::types::{ActionDirective, ElementCatalog, ElementId, ExtractionKind, PaginationDirection};

pub const INVALID_RESPONSE: &str = "invalid oracle response";
pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// What the oracle is told about the current page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHint {
    pub looks_like_listing: bool,
    pub extraction_allowed: bool,
}

/// Everything the oracle sees when choosing the next action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub goal: String,
    pub current_url: String,
    pub elements: ElementCatalog,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub page: PageHint,
}

impl DecisionRequest {
    pub fn new(
        goal: &str,
        current_url: &str,
        elements: ElementCatalog,
        history: Vec<ConversationTurn>,
        page: PageHint,
    ) -> Self {
        Self {
            goal: goal.to_string(),
            current_url: current_url.to_string(),
            elements,
            history,
            rules: policy_rules(page),
            page,
        }
    }
}

/// Content-first extraction request, separate from navigation decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRequest {
    #[serde(alias = "html_content")]
    pub content: String,
    pub goal: String,
    #[serde(default = "default_kind")]
    pub kind: ExtractionKind,
}

fn default_kind() -> ExtractionKind {
    ExtractionKind::Detail
}

impl ExtractionRequest {
    /// Builds a request, cutting `content` to at most `limit` characters.
    pub fn new(content: &str, goal: &str, kind: ExtractionKind, limit: usize) -> Self {
        let content = match content.char_indices().nth(limit) {
            Some((cut, _)) => content[..cut].to_string(),
            None => content.to_string(),
        };
        Self {
            content,
            goal: goal.to_string(),
            kind,
        }
    }
}

/// Policy rules sent along with every decision request.
pub fn policy_rules(page: PageHint) -> Vec<String> {
    let mut rules = vec![
        "Answer with exactly one JSON object and nothing else.".to_string(),
        "Only use element ids that appear in `elements`.".to_string(),
        "While the page looks like a list of search results, prefer `click` on the most relevant result over any extraction.".to_string(),
        "Use `scrape` or `extract_structured` only on a page you believe is the final destination for the goal.".to_string(),
        "Use `type` to fill a search box; the text is submitted automatically.".to_string(),
        "Use `fail` with a reason when the goal cannot be reached from here.".to_string(),
    ];
    if page.looks_like_listing {
        rules.push("This page looks like a results listing.".to_string());
    }
    if !page.extraction_allowed {
        rules.push("Extraction is not allowed on this page; navigate further first.".to_string());
    }
    rules
}

/// Element id as the oracle may send it: a string or a bare number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireId {
    Number(u64),
    Text(String),
}

impl WireId {
    fn into_id(self) -> ElementId {
        match self {
            WireId::Number(n) => ElementId::from_index(n),
            WireId::Text(s) => ElementId::parse(&s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum WireDirective {
    Click {
        id: WireId,
    },
    #[serde(alias = "type_and_submit")]
    Type {
        id: WireId,
        text: String,
    },
    Navigate {
        url: String,
    },
    #[serde(alias = "extract")]
    Scrape,
    #[serde(alias = "scrape_list")]
    ExtractStructured,
    #[serde(alias = "done")]
    Respond {
        #[serde(alias = "summary")]
        text: String,
    },
    Fail {
        #[serde(default)]
        reason: String,
    },
    Paginate {
        id: WireId,
        direction: PaginationDirection,
    },
    Return {
        target: String,
    },
}

impl From<WireDirective> for ActionDirective {
    fn from(wire: WireDirective) -> Self {
        match wire {
            WireDirective::Click { id } => ActionDirective::Click { id: id.into_id() },
            WireDirective::Type { id, text } => ActionDirective::TypeAndSubmit {
                id: id.into_id(),
                text,
            },
            WireDirective::Navigate { url } => ActionDirective::Navigate { url },
            WireDirective::Scrape => ActionDirective::Extract,
            WireDirective::ExtractStructured => ActionDirective::ExtractStructured,
            WireDirective::Respond { text } => ActionDirective::Respond { text },
            WireDirective::Fail { reason } => ActionDirective::Fail {
                reason: if reason.trim().is_empty() {
                    "oracle gave up".to_string()
                } else {
                    reason
                },
            },
            WireDirective::Paginate { id, direction } => ActionDirective::Paginate {
                id: id.into_id(),
                direction,
            },
            WireDirective::Return { target } => ActionDirective::Return { target },
        }
    }
}

impl From<&ActionDirective> for WireDirective {
    fn from(directive: &ActionDirective) -> Self {
        let id = |id: &ElementId| WireId::Text(id.to_string());
        match directive {
            ActionDirective::Click { id: target } => WireDirective::Click { id: id(target) },
            ActionDirective::TypeAndSubmit { id: target, text } => WireDirective::Type {
                id: id(target),
                text: text.clone(),
            },
            ActionDirective::Navigate { url } => WireDirective::Navigate { url: url.clone() },
            ActionDirective::Extract => WireDirective::Scrape,
            ActionDirective::ExtractStructured => WireDirective::ExtractStructured,
            ActionDirective::Respond { text } => WireDirective::Respond { text: text.clone() },
            ActionDirective::Fail { reason } => WireDirective::Fail {
                reason: reason.clone(),
            },
            ActionDirective::Paginate { id: target, direction } => WireDirective::Paginate {
                id: id(target),
                direction: *direction,
            },
            ActionDirective::Return { target } => WireDirective::Return {
                target: target.clone(),
            },
        }
    }
}

/// JSON wire form of a directive.
pub fn directive_to_wire(directive: &ActionDirective) -> Value {
    serde_json::to_value(WireDirective::from(directive)).unwrap_or(Value::Null)
}

/// Parses an oracle reply into a directive. Anything that does not fit
/// the protocol becomes `Fail` with [`INVALID_RESPONSE`].
pub fn parse_directive(raw: &str) -> ActionDirective {
    let trimmed = raw.trim();
    let parsed = serde_json::from_str::<WireDirective>(trimmed).or_else(|_| {
        let body = strip_fences(trimmed);
        serde_json::from_str::<WireDirective>(body).or_else(|first| {
            bracketed_span(body, '{', '}')
                .ok_or(first)
                .and_then(serde_json::from_str::<WireDirective>)
        })
    });
    match parsed {
        Ok(wire) => wire.into(),
        Err(e) => {
            tracing::warn!(error = %e, reply = %trimmed.chars().take(200).collect::<String>(), "unparseable oracle reply");
            ActionDirective::Fail {
                reason: INVALID_RESPONSE.to_string(),
            }
        }
    }
}

/// Parses a directive from an already decoded JSON value.
pub fn directive_from_value(value: Value) -> ActionDirective {
    match value {
        Value::String(raw) => parse_directive(&raw),
        other => serde_json::from_value::<WireDirective>(other)
            .map(Into::into)
            .unwrap_or_else(|_| ActionDirective::Fail {
                reason: INVALID_RESPONSE.to_string(),
            }),
    }
}

/// The external decision service. Implementations return the oracle's raw
/// reply; interpretation happens in [`Brain`].
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn suggest(&self, request: &DecisionRequest) -> Result<String>;

    async fn extract(&self, request: &ExtractionRequest) -> Result<String>;
}

/// Turns raw oracle replies into typed directives and extraction results.
#[derive(Clone)]
pub struct Brain {
    oracle: Arc<dyn DecisionOracle>,
}

impl Brain {
    pub fn new(oracle: Arc<dyn DecisionOracle>) -> Self {
        Self { oracle }
    }

    /// Asks for the next action. Only transport failures are errors; a
    /// bad reply is a `Fail` directive.
    pub async fn decide(&self, request: &DecisionRequest) -> Result<ActionDirective> {
        match self.oracle.suggest(request).await {
            Ok(raw) => {
                let directive = parse_directive(&raw);
                tracing::debug!(action = directive.name(), "oracle decided");
                Ok(directive)
            }
            Err(AgentError::Backend { message, .. }) | Err(AgentError::OracleProtocol(message)) => {
                tracing::warn!(error = %message, "oracle rejected the request");
                Ok(ActionDirective::Fail {
                    reason: format!("{INVALID_RESPONSE}: {message}"),
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractionResult> {
        match self.oracle.extract(request).await {
            Ok(raw) => Ok(normalize(&raw, request.kind)),
            Err(AgentError::Backend { message, .. })
            | Err(AgentError::ExtractionSchema(message))
            | Err(AgentError::OracleProtocol(message)) => Ok(ExtractionResult::error(message)),
            Err(e) => Err(e),
        }
    }
}

/// Oracle reached through the backend's `/suggest_action` and `/scrape`
/// operations.
pub struct BackendOracle {
    client: ResilientClient,
}

impl BackendOracle {
    pub fn new(client: ResilientClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DecisionOracle for BackendOracle {
    async fn suggest(&self, request: &DecisionRequest) -> Result<String> {
        let data = self.client.call(Operation::SuggestAction, request).await?;
        Ok(match data {
            Value::String(raw) => raw,
            other => other.to_string(),
        })
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<String> {
        let operation = match request.kind {
            ExtractionKind::Detail => Operation::Scrape,
            ExtractionKind::List => Operation::ScrapeChapter,
        };
        let data = self.client.call(operation, request).await?;
        Ok(match data {
            Value::String(raw) => raw,
            other => other.to_string(),
        })
    }
}

const SYSTEM_PROMPT: &str = r#"You are a browsing agent. You control a real browser by choosing ONE action at a time as JSON.

Available actions:
- {"action":"click","id":"ai-id-3"}
- {"action":"type","id":"ai-id-5","text":"search query"}
- {"action":"navigate","url":"https://..."}
- {"action":"paginate","id":"ai-id-40","direction":"next"}
- {"action":"return","target":"results"}
- {"action":"scrape"}
- {"action":"extract_structured"}
- {"action":"respond","text":"answer for the user"}
- {"action":"fail","reason":"why the goal cannot be reached"}

You receive the goal, the current URL, the interactive elements of the page, recent history and the rules to follow.
Return ONLY a single JSON object per response. No markdown, no explanation."#;

const EXTRACTION_PROMPT: &str = r#"You are a meticulous scraper. Extract every piece of information relevant to the goal from the page content into VALID JSON.

Rules:
1. For a detail extraction return one object with at least a "title" field, e.g.
   {"title": "...", "author": "...", "genre": ["..."], "status": "...", "synopsis": "...", "chapters": [{"chapter_title": "...", "release_date": "...", "url": "..."}]}
2. For a list extraction return a JSON array of objects, one per item.
3. Use null for information that cannot be found.
4. If the page does not contain what the goal asks for, return {"error": "reason"}.
5. Return ONLY JSON."#;

/// Oracle backed directly by an OpenAI-compatible chat completions API.
pub struct OpenAiOracle {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
    timeout: Duration,
}

impl OpenAiOracle {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Self {
        Self::with_url(api_key, model, timeout, DEFAULT_API_URL.to_string())
    }

    /// For OpenAI-compatible APIs at another address.
    pub fn with_url(api_key: String, model: String, timeout: Duration, api_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            api_url,
            model,
            timeout,
        }
    }

    async fn complete(&self, system: &str, user: String) -> Result<String> {
        let response = self
            .client
            .post(&self.api_url)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "temperature": 0.2,
            }))
            .send()
            .await?;

        let status = response.status();
        let json_resp: Value = response.json().await?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            tracing::error!(status = status.as_u16(), error = %err_msg, "LLM API error");
            return if status.is_server_error() {
                Err(AgentError::Network(format!("LLM API error ({status}): {err_msg}")))
            } else {
                Err(AgentError::Backend {
                    status: status.as_u16(),
                    message: err_msg,
                })
            };
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AgentError::OracleProtocol("no content in LLM response".into()))?;
        tracing::debug!(reply = %content, "LLM replied");
        Ok(content.to_string())
    }
}

#[async_trait]
impl DecisionOracle for OpenAiOracle {
    async fn suggest(&self, request: &DecisionRequest) -> Result<String> {
        let user = serde_json::to_string_pretty(request)?;
        self.complete(SYSTEM_PROMPT, user).await
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<String> {
        let kind = match request.kind {
            ExtractionKind::Detail => "detail",
            ExtractionKind::List => "list",
        };
        let user = format!(
            "Goal: \"{}\"\nExtraction kind: {kind}\n\nPage content:\n---\n{}\n---",
            request.goal, request.content
        );
        self.complete(EXTRACTION_PROMPT, user).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail_reason(d: &ActionDirective) -> &str {
        match d {
            ActionDirective::Fail { reason } => reason,
            other => panic!("expected fail, got {other:?}"),
        }
    }

    #[test]
    fn parses_every_action() {
        assert_eq!(
            parse_directive(r#"{"action":"click","id":"ai-id-4"}"#),
            ActionDirective::Click {
                id: ElementId::from_index(4)
            }
        );
        assert_eq!(
            parse_directive(r#"{"action":"type","id":2,"text":"solo leveling"}"#),
            ActionDirective::TypeAndSubmit {
                id: ElementId::from_index(2),
                text: "solo leveling".into()
            }
        );
        assert_eq!(
            parse_directive(r#"{"action":"navigate","url":"https://a.example/"}"#),
            ActionDirective::Navigate {
                url: "https://a.example/".into()
            }
        );
        assert_eq!(parse_directive(r#"{"action":"scrape"}"#), ActionDirective::Extract);
        assert_eq!(
            parse_directive(r#"{"action":"extract_structured"}"#),
            ActionDirective::ExtractStructured
        );
        assert_eq!(
            parse_directive(r#"{"action":"respond","text":"hi"}"#),
            ActionDirective::Respond { text: "hi".into() }
        );
        assert_eq!(
            parse_directive(r#"{"action":"fail","reason":"stuck"}"#),
            ActionDirective::Fail {
                reason: "stuck".into()
            }
        );
        assert_eq!(
            parse_directive(r#"{"action":"paginate","id":"ai-id-9","direction":"previous"}"#),
            ActionDirective::Paginate {
                id: ElementId::from_index(9),
                direction: PaginationDirection::Previous
            }
        );
        assert_eq!(
            parse_directive(r#"{"action":"return","target":"results"}"#),
            ActionDirective::Return {
                target: "results".into()
            }
        );
    }

    #[test]
    fn aliases_are_accepted() {
        assert_eq!(parse_directive(r#"{"action":"extract"}"#), ActionDirective::Extract);
        assert_eq!(
            parse_directive(r#"{"action":"scrape_list"}"#),
            ActionDirective::ExtractStructured
        );
        assert_eq!(
            parse_directive(r#"{"action":"type_and_submit","id":"1","text":"x"}"#),
            ActionDirective::TypeAndSubmit {
                id: ElementId::from_index(1),
                text: "x".into()
            }
        );
    }

    #[test]
    fn fenced_and_chatty_replies() {
        assert_eq!(
            parse_directive("```json\n{\"action\":\"scrape\"}\n```"),
            ActionDirective::Extract
        );
        assert_eq!(
            parse_directive("Sure! {\"action\":\"click\",\"id\":\"ai-id-1\"} is my pick."),
            ActionDirective::Click {
                id: ElementId::from_index(1)
            }
        );
    }

    #[test]
    fn backticks_in_typed_text_are_kept() {
        let typed = ActionDirective::TypeAndSubmit {
            id: ElementId::from_index(1),
            text: "```".into(),
        };
        let plain = r#"{"action":"type","id":"ai-id-1","text":"```"}"#;
        assert_eq!(parse_directive(plain), typed);
        assert_eq!(parse_directive(&format!("```json\n{plain}\n```")), typed);
        assert_eq!(
            parse_directive(r#"{"action":"type","id":"ai-id-1","text":"a ```b``` c"}"#),
            ActionDirective::TypeAndSubmit {
                id: ElementId::from_index(1),
                text: "a ```b``` c".into(),
            }
        );
    }

    #[test]
    fn malformed_replies_become_fail() {
        for raw in [
            "",
            "click the first link",
            r#"{"id":"ai-id-1"}"#,
            r#"{"action":"dance"}"#,
            r#"{"action":"click"}"#,
            r#"{"action":"navigate","url":42}"#,
            "[1,2,3]",
        ] {
            assert_eq!(fail_reason(&parse_directive(raw)), INVALID_RESPONSE, "{raw}");
        }
    }

    #[test]
    fn empty_fail_reason_is_filled() {
        assert_eq!(
            fail_reason(&parse_directive(r#"{"action":"fail"}"#)),
            "oracle gave up"
        );
    }

    #[test]
    fn wire_form_round_trips() {
        let directive = ActionDirective::TypeAndSubmit {
            id: ElementId::from_index(3),
            text: "q".into(),
        };
        let wire = directive_to_wire(&directive);
        assert_eq!(wire, json!({"action": "type", "id": "ai-id-3", "text": "q"}));
        assert_eq!(directive_from_value(wire), directive);
        assert_eq!(
            fail_reason(&directive_from_value(json!({"nope": true}))),
            INVALID_RESPONSE
        );
    }

    #[test]
    fn rules_reflect_page_hint() {
        let listing = policy_rules(PageHint {
            looks_like_listing: true,
            extraction_allowed: false,
        });
        assert!(listing.iter().any(|r| r.contains("results listing")));
        assert!(listing.iter().any(|r| r.contains("not allowed")));
        let detail = policy_rules(PageHint {
            looks_like_listing: false,
            extraction_allowed: true,
        });
        assert!(!detail.iter().any(|r| r.contains("not allowed")));
    }

    #[test]
    fn extraction_request_truncates_on_char_boundary() {
        let request = ExtractionRequest::new("ééééé", "g", ExtractionKind::Detail, 3);
        assert_eq!(request.content, "ééé");
        let short = ExtractionRequest::new("abc", "g", ExtractionKind::List, 10);
        assert_eq!(short.content, "abc");
    }

    #[test]
    fn extraction_request_accepts_html_content_field() {
        let request: ExtractionRequest =
            serde_json::from_str(r#"{"html_content":"<p>x</p>","goal":"g"}"#).unwrap();
        assert_eq!(request.content, "<p>x</p>");
        assert_eq!(request.kind, ExtractionKind::Detail);
    }
}
