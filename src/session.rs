use serde::Serialize;
use url::Url;

use crate::memory::{ConversationHistory, ConversationTurn};

pub const START_LABEL: &str = "start";
pub const RESULTS_LABEL: &str = "results";
pub const DETAIL_LABEL: &str = "detail";

/// A named place the session can return to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReturnPoint {
    pub label: String,
    pub url: String,
}

/// Page position within the active result set. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaginationCursor {
    result_set: Option<String>,
    page: u32,
}

impl Default for PaginationCursor {
    fn default() -> Self {
        Self {
            result_set: None,
            page: 1,
        }
    }
}

impl PaginationCursor {
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Records the active result set. Returns true when it changed, in
    /// which case the cursor is back on page 1.
    pub fn observe_result_set(&mut self, key: &str) -> bool {
        if self.result_set.as_deref() == Some(key) {
            return false;
        }
        self.result_set = Some(key.to_string());
        self.page = 1;
        true
    }

    pub fn advance(&mut self) {
        self.page = self.page.saturating_add(1);
    }

    pub fn retreat(&mut self) {
        self.page = self.page.saturating_sub(1).max(1);
    }
}

/// Identifies a result set independently of which page of it is shown:
/// `/page/<n>` path segments and `page`/`paged` query pairs are dropped.
pub fn result_set_key(raw_url: &str) -> String {
    let Ok(mut url) = Url::parse(raw_url) else {
        return raw_url.to_string();
    };

    let segments: Vec<String> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).map(String::from).collect())
        .unwrap_or_default();
    let mut kept = Vec::with_capacity(segments.len());
    let mut i = 0;
    while i < segments.len() {
        let is_page_marker = segments[i] == "page"
            && segments
                .get(i + 1)
                .is_some_and(|n| n.chars().all(|c| c.is_ascii_digit()));
        if is_page_marker {
            i += 2;
            continue;
        }
        kept.push(segments[i].clone());
        i += 1;
    }
    url.set_path(&format!("/{}", kept.join("/")));

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "page" && k != "paged")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.set_fragment(None);
    url.to_string()
}

/// State of one browsing session, owned by the executor loop.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub current_url: String,
    pub goal: String,
    pub history: ConversationHistory,
    pub return_points: Vec<ReturnPoint>,
    pub pagination: PaginationCursor,
    step_count: u32,
}

impl SessionState {
    pub fn new(goal: impl Into<String>, start_url: impl Into<String>, history_bound: usize) -> Self {
        let goal = goal.into();
        let current_url = start_url.into();
        let mut history = ConversationHistory::new(history_bound);
        history.push(ConversationTurn::human(format!("Goal: {goal}")));
        let mut state = Self {
            current_url,
            goal,
            history,
            return_points: Vec::new(),
            pagination: PaginationCursor::default(),
            step_count: 0,
        };
        let url = state.current_url.clone();
        state.push_return_point(START_LABEL, &url);
        state
    }

    /// Continue with a history carried over from an earlier session.
    pub fn with_history(mut self, history: ConversationHistory) -> Self {
        let goal_turn = ConversationTurn::human(format!("Goal: {}", self.goal));
        self.history = history;
        self.history.push(goal_turn);
        self
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    /// Counts one loop iteration and returns the new count.
    pub fn begin_step(&mut self) -> u32 {
        self.step_count += 1;
        self.step_count
    }

    pub fn set_goal(&mut self, goal: impl Into<String>) {
        self.goal = goal.into();
        self.history
            .push(ConversationTurn::human(format!("New goal: {}", self.goal)));
    }

    pub fn record(&mut self, turn: ConversationTurn) {
        self.history.push(turn);
    }

    /// Pushes a return point unless the top of the stack is identical.
    pub fn push_return_point(&mut self, label: &str, url: &str) {
        let point = ReturnPoint {
            label: label.to_string(),
            url: url.to_string(),
        };
        if self.return_points.last() != Some(&point) {
            self.return_points.push(point);
        }
    }

    /// Finds the newest return point with `label`, discarding everything
    /// pushed after it. The point itself stays so it can be reused.
    pub fn return_to(&mut self, label: &str) -> Option<ReturnPoint> {
        let pos = self.return_points.iter().rposition(|p| p.label == label)?;
        self.return_points.truncate(pos + 1);
        self.return_points.last().cloned()
    }

    pub fn return_labels(&self) -> Vec<&str> {
        self.return_points.iter().map(|p| p.label.as_str()).collect()
    }
}
