//! The decide/execute loop driving one browsing session.
//!
//! Each iteration builds a fresh element catalog, asks the oracle for one
//! directive and performs at most one browser mutation before deciding
//! again. Extraction, `respond` and `fail` end the session; so do a lost
//! browser, exhausted backends, interruption and the step budget.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::brain::{Brain, DecisionRequest, ExtractionRequest, PageHint, directive_to_wire};
use crate::config::AgentConfig;
use crate::dom::{CatalogBuilder, CatalogSnapshot, PageKind};
use crate::error::{AgentError, Result};
use crate::hands::{BrowserDriver, RootHandle};
use crate::memory::{ConversationHistory, ConversationTurn};
use crate::normalizer::ExtractionResult;
use crate::session::{DETAIL_LABEL, RESULTS_LABEL, SessionState, result_set_key};
use crate::types::{ActionDirective, ElementId, ExtractionKind, PaginationDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Deciding,
    Executing,
    AwaitingNavigation,
    Extracting,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The oracle answered `fail`, or its reply was unusable.
    OracleFail(String),
    StepBudgetExhausted { max_steps: u32 },
    SessionLost(String),
    Backend(String),
    /// Extraction ran but produced an error record.
    Extraction(String),
    Interrupted,
    Fatal(String),
}

impl From<AgentError> for FailureReason {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::SessionLost(message) => FailureReason::SessionLost(message),
            AgentError::Interrupted => FailureReason::Interrupted,
            e @ (AgentError::EndpointsExhausted { .. }
            | AgentError::Network(_)
            | AgentError::Backend { .. }) => FailureReason::Backend(e.to_string()),
            other => FailureReason::Fatal(other.to_string()),
        }
    }
}

/// How a single iteration ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The document root was replaced.
    Navigated,
    /// No navigation within the timeout; the page may have changed in place.
    NoNavigation,
    /// Recoverable failure; the loop went on.
    Failed(String),
    /// The directive was not allowed on this page.
    Refused(String),
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: u32,
    pub url: String,
    pub action: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub steps: u32,
    pub final_url: String,
    pub trace: Vec<StepRecord>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.status == SessionStatus::Success
    }
}

enum Termination {
    Extracted(ExtractionResult),
    Responded(String),
    Failed(FailureReason, Option<ExtractionResult>),
}

/// Runs `fut` unless `cancel` fires first.
async fn interruptible<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Interrupted),
        result = fut => result,
    }
}

/// Action executor and navigation state machine for one session.
pub struct Executor {
    config: AgentConfig,
    brain: Brain,
    driver: Arc<dyn BrowserDriver>,
    builder: CatalogBuilder,
    session: SessionState,
    state: AgentState,
    last_page: Option<PageKind>,
    trace: Vec<StepRecord>,
    goal_rx: Option<mpsc::UnboundedReceiver<String>>,
    finished: bool,
}

impl Executor {
    pub fn new(
        config: AgentConfig,
        brain: Brain,
        driver: Arc<dyn BrowserDriver>,
        goal: &str,
        start_url: &str,
    ) -> Self {
        let session = SessionState::new(goal, start_url, config.history_bound);
        Self {
            builder: CatalogBuilder::new(config.catalog_limit),
            config,
            brain,
            driver,
            session,
            state: AgentState::Deciding,
            last_page: None,
            trace: Vec::new(),
            goal_rx: None,
            finished: false,
        }
    }

    /// Seeds the session with turns remembered from earlier runs.
    pub fn with_history(mut self, history: ConversationHistory) -> Self {
        self.session = self.session.with_history(history);
        self
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn resupply_goal(&mut self, goal: &str) {
        tracing::info!(goal, "goal updated");
        self.session.set_goal(goal);
    }

    /// Channel for replacing the goal while the session runs. New goals
    /// take effect at the next decision.
    pub fn goal_sender(&mut self) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.goal_rx = Some(rx);
        tx
    }

    /// Runs the session to completion and releases the browser, whatever
    /// the exit path.
    pub async fn run(&mut self, cancel: &CancellationToken) -> SessionOutcome {
        if self.finished {
            return self.outcome(Termination::Failed(
                FailureReason::Fatal("session already finished".into()),
                None,
            ));
        }

        let termination = self.drive(cancel).await;
        self.finished = true;
        self.state = AgentState::Terminated;

        if let Err(e) = self.driver.release().await {
            tracing::warn!(error = %e, "browser release failed");
        }

        let outcome = self.outcome(termination);
        match &outcome.reason {
            None => tracing::info!(steps = outcome.steps, "session succeeded"),
            Some(reason) => tracing::warn!(steps = outcome.steps, reason = ?reason, "session failed"),
        }
        outcome
    }

    fn outcome(&self, termination: Termination) -> SessionOutcome {
        let (status, reason, extraction, response) = match termination {
            Termination::Extracted(result) => (SessionStatus::Success, None, Some(result), None),
            Termination::Responded(text) => (SessionStatus::Success, None, None, Some(text)),
            Termination::Failed(reason, extraction) => {
                (SessionStatus::Failure, Some(reason), extraction, None)
            }
        };
        SessionOutcome {
            status,
            reason,
            extraction,
            response,
            steps: self.session.step_count(),
            final_url: self.session.current_url.clone(),
            trace: self.trace.clone(),
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Termination {
        let start = self.session.current_url.clone();
        tracing::info!(url = %start, goal = %self.session.goal, "starting session");
        if let Err(e) = interruptible(cancel, self.driver.navigate(&start)).await {
            return Termination::Failed(e.into(), None);
        }

        loop {
            if cancel.is_cancelled() {
                return Termination::Failed(FailureReason::Interrupted, None);
            }
            if self.session.step_count() >= self.config.max_steps {
                tracing::warn!(max_steps = self.config.max_steps, "step limit reached");
                return Termination::Failed(
                    FailureReason::StepBudgetExhausted {
                        max_steps: self.config.max_steps,
                    },
                    None,
                );
            }

            let step = self.session.begin_step();
            match self.iterate(step, cancel).await {
                Ok(Some(termination)) => return termination,
                Ok(None) => {}
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(step, error = %e, "step failed, reassessing");
                    self.note_failure(step, "decide", StepOutcome::Failed(e.to_string()));
                }
                Err(e) => return Termination::Failed(e.into(), None),
            }
        }
    }

    fn drain_goal_updates(&mut self) {
        let mut latest = None;
        if let Some(rx) = self.goal_rx.as_mut() {
            while let Ok(goal) = rx.try_recv() {
                latest = Some(goal);
            }
        }
        if let Some(goal) = latest {
            self.resupply_goal(&goal);
        }
    }

    /// One `Deciding -> ...` pass. `Ok(None)` loops back to deciding.
    async fn iterate(&mut self, step: u32, cancel: &CancellationToken) -> Result<Option<Termination>> {
        self.state = AgentState::Deciding;
        self.drain_goal_updates();

        let driver = self.driver.clone();
        let snapshot = interruptible(cancel, self.builder.build(driver.as_ref())).await?;
        self.session.current_url = snapshot.url.clone();
        let page = self.config.listing.classify(&snapshot.url, &snapshot.catalog);
        self.checkpoint(&snapshot.url, page);

        let hint = PageHint {
            looks_like_listing: page == PageKind::Listing,
            extraction_allowed: self.extraction_allowed(&snapshot.url, page, ExtractionKind::Detail)
                || self.extraction_allowed(&snapshot.url, page, ExtractionKind::List),
        };
        let request = DecisionRequest::new(
            &self.session.goal,
            &snapshot.url,
            snapshot.catalog.clone(),
            self.session.history.to_vec(),
            hint,
        );

        let directive = interruptible(cancel, self.brain.decide(&request)).await?;
        tracing::info!(step, action = directive.name(), url = %snapshot.url, "executing directive");
        self.session
            .record(ConversationTurn::agent(directive_to_wire(&directive).to_string()));

        self.execute(step, directive, &snapshot, page, cancel).await
    }

    async fn execute(
        &mut self,
        step: u32,
        directive: ActionDirective,
        snapshot: &CatalogSnapshot,
        page: PageKind,
        cancel: &CancellationToken,
    ) -> Result<Option<Termination>> {
        let action = directive.name();
        match directive {
            ActionDirective::Fail { reason } => {
                self.push_trace(step, action, StepOutcome::Terminal);
                Ok(Some(Termination::Failed(FailureReason::OracleFail(reason), None)))
            }
            ActionDirective::Respond { text } => {
                self.push_trace(step, action, StepOutcome::Terminal);
                Ok(Some(Termination::Responded(text)))
            }
            ActionDirective::Extract | ActionDirective::ExtractStructured => {
                let kind = directive.extraction_kind().unwrap_or(ExtractionKind::Detail);
                if !self.extraction_allowed(&snapshot.url, page, kind) {
                    let why = format!(
                        "extraction refused: {} does not look like a final page, open a result first",
                        snapshot.url
                    );
                    tracing::info!(step, url = %snapshot.url, "extraction refused on listing page");
                    self.note_failure(step, action, StepOutcome::Refused(why));
                    return Ok(None);
                }
                self.extract(step, kind, cancel).await.map(Some)
            }
            ActionDirective::Click { id } => {
                self.interact(step, action, &id, snapshot, cancel, |driver, id| {
                    Box::pin(async move { driver.click(&id).await })
                })
                .await
            }
            ActionDirective::TypeAndSubmit { id, text } => {
                self.interact(step, action, &id, snapshot, cancel, move |driver, id| {
                    Box::pin(async move { driver.type_and_submit(&id, &text).await })
                })
                .await
            }
            ActionDirective::Paginate { id, direction } => {
                let result = self
                    .interact(step, action, &id, snapshot, cancel, |driver, id| {
                        Box::pin(async move { driver.click(&id).await })
                    })
                    .await?;
                if self.performed(step) {
                    match direction {
                        PaginationDirection::Next => self.session.pagination.advance(),
                        PaginationDirection::Previous => self.session.pagination.retreat(),
                    }
                    tracing::debug!(page = self.session.pagination.page(), "pagination cursor moved");
                }
                Ok(result)
            }
            ActionDirective::Navigate { url } => {
                self.navigate_to(step, action, &url, cancel).await
            }
            ActionDirective::Return { target } => match self.session.return_to(&target) {
                Some(point) => self.navigate_to(step, action, &point.url, cancel).await,
                None => {
                    self.note_failure(
                        step,
                        action,
                        StepOutcome::Failed(format!("no return point named {target:?}")),
                    );
                    Ok(None)
                }
            },
        }
    }

    fn extraction_allowed(&self, url: &str, page: PageKind, kind: ExtractionKind) -> bool {
        self.config.eligibility.allows(url, page, kind)
    }

    /// Resolves `id`, performs one interaction and waits for navigation.
    async fn interact<F>(
        &mut self,
        step: u32,
        action: &'static str,
        id: &ElementId,
        snapshot: &CatalogSnapshot,
        cancel: &CancellationToken,
        perform: F,
    ) -> Result<Option<Termination>>
    where
        F: FnOnce(
            Arc<dyn BrowserDriver>,
            ElementId,
        ) -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send>>,
    {
        if !snapshot.catalog.contains(id) {
            let err = AgentError::StaleElement { id: id.clone() };
            tracing::warn!(step, id = %id, "directive names an unknown element");
            self.note_failure(step, action, StepOutcome::Failed(err.to_string()));
            return Ok(None);
        }

        self.state = AgentState::Executing;
        let root = interruptible(cancel, self.driver.root()).await?;
        match interruptible(cancel, perform(self.driver.clone(), id.clone())).await {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                tracing::warn!(step, id = %id, error = %e, "interaction failed");
                self.note_failure(step, action, StepOutcome::Failed(e.to_string()));
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        self.await_navigation(step, action, &root, cancel).await?;
        Ok(None)
    }

    async fn navigate_to(
        &mut self,
        step: u32,
        action: &'static str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Termination>> {
        self.state = AgentState::Executing;
        let root = interruptible(cancel, self.driver.root()).await?;
        match interruptible(cancel, self.driver.navigate(url)).await {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                self.note_failure(step, action, StepOutcome::Failed(e.to_string()));
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        self.await_navigation(step, action, &root, cancel).await?;
        Ok(None)
    }

    async fn await_navigation(
        &mut self,
        step: u32,
        action: &'static str,
        root: &RootHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.state = AgentState::AwaitingNavigation;
        let navigated = interruptible(cancel, self.wait_for_root_replacement(root)).await?;
        interruptible(cancel, async {
            tokio::time::sleep(self.config.settle_delay).await;
            Ok(())
        })
        .await?;

        if navigated {
            self.push_trace(step, action, StepOutcome::Navigated);
        } else {
            let err = AgentError::NavigationTimeout(self.config.navigation_timeout);
            tracing::info!(step, "{err}; reassessing the page");
            self.session.record(ConversationTurn::human(format!(
                "Step {step}: the page did not navigate after {action}; it may have updated in place."
            )));
            self.push_trace(step, action, StepOutcome::NoNavigation);
        }
        Ok(())
    }

    /// Polls until `root` goes stale. `Ok(false)` on timeout.
    async fn wait_for_root_replacement(&self, root: &RootHandle) -> Result<bool> {
        let poll = async {
            loop {
                match self.driver.is_stale(root).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {}
                    Err(e @ AgentError::SessionLost(_)) => return Err(e),
                    // The old document can vanish mid-query while navigating.
                    Err(e) => tracing::debug!(error = %e, "staleness probe failed"),
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };
        match tokio::time::timeout(self.config.navigation_timeout, poll).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    async fn extract(
        &mut self,
        step: u32,
        kind: ExtractionKind,
        cancel: &CancellationToken,
    ) -> Result<Termination> {
        self.state = AgentState::Extracting;
        let content = interruptible(cancel, self.driver.page_content()).await?;
        let request = ExtractionRequest::new(
            &content,
            &self.session.goal,
            kind,
            self.config.content_limit,
        );
        tracing::info!(step, kind = ?kind, chars = request.content.chars().count(), "extracting page content");
        let result = interruptible(cancel, self.brain.extract(&request)).await?;
        let action = match kind {
            ExtractionKind::Detail => "scrape",
            ExtractionKind::List => "extract_structured",
        };
        self.push_trace(step, action, StepOutcome::Terminal);

        Ok(match result {
            ExtractionResult::Error(record) => Termination::Failed(
                FailureReason::Extraction(record.message.clone()),
                Some(ExtractionResult::Error(record)),
            ),
            ok => Termination::Extracted(ok),
        })
    }

    /// Maintains return points and the pagination cursor for the page now shown.
    fn checkpoint(&mut self, url: &str, page: PageKind) {
        match page {
            PageKind::Listing => {
                self.session.push_return_point(RESULTS_LABEL, url);
                if self.session.pagination.observe_result_set(&result_set_key(url)) {
                    tracing::debug!(url, "new result set, pagination reset");
                }
            }
            PageKind::Other => {
                if self.last_page == Some(PageKind::Listing) {
                    self.session.push_return_point(DETAIL_LABEL, url);
                }
            }
        }
        self.last_page = Some(page);
    }

    fn note_failure(&mut self, step: u32, action: &str, outcome: StepOutcome) {
        let message = match &outcome {
            StepOutcome::Failed(m) | StepOutcome::Refused(m) => m.clone(),
            other => format!("{other:?}"),
        };
        self.session
            .record(ConversationTurn::human(format!("Step {step} failed: {message}")));
        self.push_trace(step, action, outcome);
    }

    fn push_trace(&mut self, step: u32, action: &str, outcome: StepOutcome) {
        self.trace.push(StepRecord {
            step,
            url: self.session.current_url.clone(),
            action: action.to_string(),
            outcome,
        });
    }

    /// Whether `step` got as far as performing its interaction.
    fn performed(&self, step: u32) -> bool {
        self.trace.last().is_some_and(|r| {
            r.step == step && matches!(r.outcome, StepOutcome::Navigated | StepOutcome::NoNavigation)
        })
    }
}
