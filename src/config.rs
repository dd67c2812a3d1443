use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::dom::{ListingHeuristic, PageKind};
use crate::error::{AgentError, Result};
use crate::types::{
    DEFAULT_CATALOG_LIMIT, DEFAULT_CONTENT_LIMIT, DEFAULT_HISTORY_BOUND, DEFAULT_MAX_STEPS,
    ExtractionKind,
};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1500);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPOUND_TIMEOUT: Duration = Duration::from_secs(180);

type EligibilityFn = dyn Fn(&str, PageKind, ExtractionKind) -> bool + Send + Sync;

/// Decides whether the current page may be the subject of an extraction.
#[derive(Clone, Default)]
pub enum ExtractionEligibility {
    /// Only non-listing pages may be extracted; listings require a click-through.
    #[default]
    DetailPagesOnly,
    /// Listings may be extracted as a list; detail extraction still needs a detail page.
    ListingsAllowList,
    /// Caller-supplied predicate over `(url, page kind, extraction kind)`.
    Custom(Arc<EligibilityFn>),
}

impl ExtractionEligibility {
    pub fn allows(&self, url: &str, page: PageKind, kind: ExtractionKind) -> bool {
        match self {
            ExtractionEligibility::DetailPagesOnly => page != PageKind::Listing,
            ExtractionEligibility::ListingsAllowList => {
                page != PageKind::Listing || kind == ExtractionKind::List
            }
            ExtractionEligibility::Custom(f) => f(url, page, kind),
        }
    }
}

impl fmt::Debug for ExtractionEligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionEligibility::DetailPagesOnly => f.write_str("DetailPagesOnly"),
            ExtractionEligibility::ListingsAllowList => f.write_str("ListingsAllowList"),
            ExtractionEligibility::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Everything a session needs, passed in explicitly.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Backend endpoints in failover order.
    pub endpoints: Vec<String>,
    pub openai_api_key: Option<String>,
    pub model: String,
    pub max_steps: u32,
    pub history_bound: usize,
    pub catalog_limit: usize,
    pub content_limit: usize,
    pub navigation_timeout: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub request_timeout: Duration,
    pub compound_timeout: Duration,
    pub listing: ListingHeuristic,
    pub eligibility: ExtractionEligibility,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            openai_api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            history_bound: DEFAULT_HISTORY_BOUND,
            catalog_limit: DEFAULT_CATALOG_LIMIT,
            content_limit: DEFAULT_CONTENT_LIMIT,
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            compound_timeout: DEFAULT_COMPOUND_TIMEOUT,
            listing: ListingHeuristic::default(),
            eligibility: ExtractionEligibility::default(),
        }
    }
}

impl AgentConfig {
    /// Reads `SCOUT_*` and `OPENAI_API_KEY` from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("SCOUT_ENDPOINTS") {
            config.endpoints = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        config.openai_api_key = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty());
        if let Some(model) = lookup("SCOUT_MODEL") {
            config.model = model;
        }
        if let Some(v) = parse_var(&lookup, "SCOUT_MAX_STEPS")? {
            config.max_steps = v;
        }
        if let Some(v) = parse_var(&lookup, "SCOUT_HISTORY_BOUND")? {
            config.history_bound = v;
        }
        if let Some(v) = parse_var(&lookup, "SCOUT_CATALOG_LIMIT")? {
            config.catalog_limit = v;
        }
        if let Some(ms) = parse_var(&lookup, "SCOUT_NAV_TIMEOUT_MS")? {
            config.navigation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "SCOUT_SETTLE_MS")? {
            config.settle_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(AgentError::Config("max_steps must be at least 1".into()));
        }
        if self.history_bound == 0 {
            return Err(AgentError::Config("history_bound must be at least 1".into()));
        }
        if self.catalog_limit == 0 {
            return Err(AgentError::Config("catalog_limit must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AgentError::Config(format!("{key} has an invalid value: {raw:?}"))),
    }
}
