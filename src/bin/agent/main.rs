mod output;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use web_scout::backend::ChainScrapeRequest;
use web_scout::memory::ConversationHistory;
use web_scout::{
    AgentConfig, BackendOracle, Brain, ChromeSession, DecisionOracle, Executor, OpenAiOracle,
    ResilientClient,
};

/// Drive a browser toward a goal and extract what it finds.
#[derive(Debug, Parser)]
#[command(name = "agent", version)]
struct Cli {
    /// Page to start from.
    #[arg(long)]
    url: String,

    /// What to find, in plain language.
    #[arg(long)]
    goal: String,

    /// Backend endpoint, in failover order. Repeatable.
    #[arg(long = "endpoint", env = "SCOUT_ENDPOINTS", value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Talk to the LLM API directly instead of a backend.
    #[arg(long)]
    direct: bool,

    /// Run the whole session on the first reachable backend.
    #[arg(long, conflicts_with = "direct")]
    remote: bool,

    #[arg(long)]
    max_steps: Option<u32>,

    /// Keep conversation memory between runs.
    #[arg(long)]
    remember: bool,

    /// Where memory is kept; implies --remember.
    #[arg(long)]
    memory: Option<PathBuf>,

    /// Write a successful extraction to this file.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write a successful extraction to `<title>.json`.
    #[arg(long)]
    save: bool,

    /// Show the browser window.
    #[arg(long)]
    headful: bool,
}

fn default_memory_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("web-scout").join("memory.json"))
}

fn build_oracle(cli: &Cli, config: &AgentConfig) -> Result<Arc<dyn DecisionOracle>> {
    if cli.direct {
        let api_key = config
            .openai_api_key
            .clone()
            .context("OPENAI_API_KEY not set in environment")?;
        return Ok(Arc::new(OpenAiOracle::new(
            api_key,
            config.model.clone(),
            config.request_timeout,
        )));
    }
    if config.endpoints.is_empty() {
        bail!("no backend endpoint given; pass --endpoint or use --direct");
    }
    let client = ResilientClient::from_config(config)?;
    tracing::info!(endpoints = ?client.endpoints(), "using backend oracle");
    Ok(Arc::new(BackendOracle::new(client)))
}

async fn run_remote(cli: &Cli, config: &AgentConfig) -> Result<ExitCode> {
    let client = ResilientClient::from_config(config)?;
    let request = ChainScrapeRequest {
        url: cli.url.clone(),
        goal: cli.goal.clone(),
        max_steps: Some(config.max_steps),
    };
    let outcome = client.chain_scrape(&request).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome["status"] == "success" {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AgentConfig::from_env()?;
    if !cli.endpoints.is_empty() {
        config.endpoints = cli.endpoints.clone();
    }
    if let Some(max_steps) = cli.max_steps {
        config.max_steps = max_steps;
    }
    config.validate()?;

    if cli.remote {
        return run_remote(&cli, &config).await;
    }

    let brain = Brain::new(build_oracle(&cli, &config)?);

    let memory_path = match (&cli.memory, cli.remember) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => default_memory_path(),
        (None, false) => None,
    };

    let session = ChromeSession::launch(!cli.headful).await?;
    let mut executor = Executor::new(config.clone(), brain, Arc::new(session), &cli.goal, &cli.url);
    if let Some(path) = &memory_path {
        match ConversationHistory::load(path, config.history_bound) {
            Ok(history) => executor = executor.with_history(history),
            Err(e) => tracing::warn!(error = %e, "could not load memory, starting fresh"),
        }
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current step");
            on_interrupt.cancel();
        }
    });

    let outcome = executor.run(&cancel).await;

    if let Some(path) = &memory_path {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        executor.session().history.save(path)?;
    }

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if let Some(result) = outcome.extraction.as_ref().filter(|r| !r.is_error()) {
        let target = match (&cli.output, cli.save) {
            (Some(path), _) => Some(path.clone()),
            (None, true) => output::default_file_name(result),
            (None, false) => None,
        };
        if let Some(path) = target {
            output::save_result(&path, result)?;
            tracing::info!(path = %path.display(), "saved extraction");
        }
    }

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
