//! Backend service exposing navigation, extraction and decision operations
//! over HTTP for agent hosts.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use web_scout::AgentError;
use web_scout::agent::Executor;
use web_scout::backend::{ChainScrapeRequest, Envelope, NavigateRequest, PageSummary};
use web_scout::brain::{Brain, DecisionRequest, ExtractionRequest, OpenAiOracle, directive_to_wire};
use web_scout::config::AgentConfig;
use web_scout::dom::CatalogBuilder;
use web_scout::hands::{BrowserDriver, ChromeSession};
use web_scout::normalizer::ExtractionResult;
use web_scout::types::ExtractionKind;

const DEFAULT_BIND: &str = "127.0.0.1:8000";

#[derive(Clone)]
struct AppState {
    config: AgentConfig,
    brain: Brain,
}

type Reply = (StatusCode, Json<Envelope>);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = AgentConfig::from_env()?;
    let api_key = config
        .openai_api_key
        .clone()
        .context("OPENAI_API_KEY not set in environment")?;
    let oracle = OpenAiOracle::new(api_key, config.model.clone(), config.request_timeout);
    let state = Arc::new(AppState {
        config,
        brain: Brain::new(Arc::new(oracle)),
    });

    let bind = std::env::var("SCOUT_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("could not bind {bind}"))?;
    tracing::info!("backend listening on http://{bind}/api");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/navigate", post(navigate_handler))
        .route("/scrape", post(scrape_handler))
        .route("/scrape_chapter", post(scrape_chapter_handler))
        .route("/suggest_action", post(suggest_action_handler))
        .route("/chain-scrape", post(chain_scrape_handler))
        .route("/health", get(|| async { Json(serde_json::json!({"status": "ok"})) }))
        .with_state(state);
    Router::new().nest("/api", api)
}

/// Upstream outages answer 503 so hosts fail over to another endpoint;
/// everything else is an ordinary error envelope.
fn failure(err: &AgentError) -> Reply {
    let status = match err {
        AgentError::Network(_) | AgentError::EndpointsExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    tracing::warn!(error = %err, "request failed");
    (status, Json(Envelope::error(err.to_string())))
}

fn success(data: impl serde::Serialize) -> Reply {
    (StatusCode::OK, Json(Envelope::success(data)))
}

async fn navigate_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NavigateRequest>,
) -> Reply {
    tracing::info!(url = %payload.url, "POST /navigate");
    let session = match ChromeSession::launch(true).await {
        Ok(session) => session,
        Err(e) => return failure(&e),
    };
    let summary = summarize(&session, &payload.url, state.config.catalog_limit).await;
    if let Err(e) = session.release().await {
        tracing::warn!(error = %e, "browser release failed");
    }
    match summary {
        Ok(summary) => success(summary),
        Err(e) => failure(&e),
    }
}

async fn summarize(session: &ChromeSession, url: &str, limit: usize) -> web_scout::Result<PageSummary> {
    session.navigate(url).await?;
    let snapshot = CatalogBuilder::new(limit).build(session).await?;
    let title = session.title().await.unwrap_or_default();
    Ok(PageSummary {
        current_url: snapshot.url,
        title: if title.is_empty() { "No Title".to_string() } else { title },
        elements: snapshot.catalog,
    })
}

async fn extract(state: &AppState, request: ExtractionRequest, kind: ExtractionKind) -> Reply {
    let request = ExtractionRequest::new(&request.content, &request.goal, kind, state.config.content_limit);
    match state.brain.extract(&request).await {
        Ok(ExtractionResult::Error(record)) => (StatusCode::OK, Json(Envelope::error(record.message))),
        Ok(result) => success(result),
        Err(e) => failure(&e),
    }
}

async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExtractionRequest>,
) -> Reply {
    tracing::info!(goal = %payload.goal, "POST /scrape");
    extract(&state, payload, ExtractionKind::Detail).await
}

async fn scrape_chapter_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExtractionRequest>,
) -> Reply {
    tracing::info!(goal = %payload.goal, "POST /scrape_chapter");
    extract(&state, payload, ExtractionKind::List).await
}

async fn suggest_action_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DecisionRequest>,
) -> Reply {
    tracing::info!(url = %payload.current_url, elements = payload.elements.len(), "POST /suggest_action");
    match state.brain.decide(&payload).await {
        Ok(directive) => success(directive_to_wire(&directive)),
        Err(e) => failure(&e),
    }
}

async fn chain_scrape_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChainScrapeRequest>,
) -> Reply {
    tracing::info!(url = %payload.url, goal = %payload.goal, "POST /chain-scrape");
    let mut config = state.config.clone();
    if let Some(max_steps) = payload.max_steps.filter(|n| *n > 0) {
        config.max_steps = max_steps;
    }
    let session = match ChromeSession::launch(true).await {
        Ok(session) => session,
        Err(e) => return failure(&e),
    };
    let mut executor = Executor::new(
        config,
        state.brain.clone(),
        Arc::new(session),
        &payload.goal,
        &payload.url,
    );
    let outcome = executor.run(&CancellationToken::new()).await;
    success(outcome)
}
