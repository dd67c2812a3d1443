use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dom::{RawElement, staleness_script, tagging_script};
use crate::error::{AgentError, Result};
use crate::types::ElementId;

/// Reference to one document root. Two handles are equal only when they
/// point at the same, unreplaced root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootHandle(String);

impl RootHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RootHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of tagging the live document.
#[derive(Debug, Clone, Deserialize)]
pub struct TaggedPage {
    #[serde(deserialize_with = "root_from_str")]
    pub root: RootHandle,
    /// First identifier not yet handed out.
    #[serde(rename = "next")]
    pub next_id: u64,
    #[serde(default)]
    pub elements: Vec<RawElement>,
}

fn root_from_str<'de, D>(d: D) -> std::result::Result<RootHandle, D::Error>
where
    D: serde::Deserializer<'de>,
{
    String::deserialize(d).map(RootHandle)
}

/// The headless-browser operations the agent relies on.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// Handle to the live document root, stamping it if needed.
    async fn root(&self) -> Result<RootHandle>;

    /// True once `root` no longer is the live document root.
    async fn is_stale(&self, root: &RootHandle) -> Result<bool>;

    /// Tags untagged interactive nodes starting at `next_id`.
    async fn tag_interactive(&self, next_id: u64) -> Result<TaggedPage>;

    async fn click(&self, id: &ElementId) -> Result<()>;

    async fn type_and_submit(&self, id: &ElementId, text: &str) -> Result<()>;

    /// Full markup of the current page.
    async fn page_content(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    /// Closes the browser. Further calls fail with `SessionLost`.
    async fn release(&self) -> Result<()>;
}

struct ChromeInner {
    _browser: Browser,
    tab: Arc<Tab>,
}

/// `BrowserDriver` backed by a headless Chrome launched for one session.
pub struct ChromeSession {
    inner: Mutex<Option<ChromeInner>>,
    root_counter: AtomicU64,
}

impl ChromeSession {
    pub async fn launch(headless: bool) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::launch_blocking(headless))
            .await
            .map_err(|e| AgentError::Browser(format!("Browser launch panicked: {e}")))?
    }

    fn launch_blocking(headless: bool) -> Result<Self> {
        let options = LaunchOptions {
            headless,
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
                std::ffi::OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        };

        tracing::info!(headless, "starting Chrome");
        let browser = Browser::new(options)
            .map_err(|e| AgentError::Browser(format!("Browser launch failed: {e}")))?;
        let tab = browser
            .new_tab()
            .map_err(|e| AgentError::Browser(format!("Could not open tab: {e}")))?;
        tracing::info!("Chrome ready");

        Ok(Self {
            inner: Mutex::new(Some(ChromeInner {
                _browser: browser,
                tab,
            })),
            root_counter: AtomicU64::new(0),
        })
    }

    fn tab(&self) -> Result<Arc<Tab>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| AgentError::SessionLost("browser state poisoned".into()))?;
        guard
            .as_ref()
            .map(|inner| inner.tab.clone())
            .ok_or_else(|| AgentError::SessionLost("browser already released".into()))
    }

    /// Runs blocking tab work off the async runtime.
    async fn with_tab<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        let tab = self.tab()?;
        tokio::task::spawn_blocking(move || work(&tab))
            .await
            .map_err(|e| AgentError::SessionLost(format!("browser task panicked: {e}")))?
    }

    fn next_root_token(&self) -> String {
        format!("snap-{}", self.root_counter.fetch_add(1, Ordering::Relaxed))
    }
}

fn evaluate_string(tab: &Tab, script: &str) -> Result<String> {
    let result = tab.evaluate(script, false).map_err(browser_error)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}

/// Connection-level failures mean the session is gone; anything else is
/// a failed interaction.
fn browser_error(err: anyhow::Error) -> AgentError {
    let message = format!("{err:#}");
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("connection closed")
        || lowered.contains("no target")
        || lowered.contains("target closed")
        || lowered.contains("channel")
    {
        AgentError::SessionLost(message)
    } else {
        AgentError::Browser(message)
    }
}

fn find_tagged<'a>(
    tab: &'a Tab,
    id: &ElementId,
) -> Result<headless_chrome::Element<'a>> {
    tab.find_element(&id.selector())
        .map_err(|_| AgentError::StaleElement { id: id.clone() })
}

#[async_trait]
impl BrowserDriver for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.navigate_to(&url).map_err(browser_error)?;
            tab.wait_until_navigated().map_err(browser_error)?;
            Ok(())
        })
        .await
    }

    async fn current_url(&self) -> Result<String> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }

    async fn root(&self) -> Result<RootHandle> {
        let token = serde_json::to_string(&self.next_root_token())?;
        let script = format!(
            "(() => {{ const r = document.documentElement; if (!r.dataset.aiRoot) r.dataset.aiRoot = {token}; return r.dataset.aiRoot; }})()"
        );
        self.with_tab(move |tab| evaluate_string(tab, &script).map(RootHandle))
            .await
    }

    async fn is_stale(&self, root: &RootHandle) -> Result<bool> {
        let script = staleness_script(root);
        self.with_tab(move |tab| {
            let result = tab.evaluate(&script, false).map_err(browser_error)?;
            Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(true))
        })
        .await
    }

    async fn tag_interactive(&self, next_id: u64) -> Result<TaggedPage> {
        let script = tagging_script(next_id, &self.next_root_token());
        self.with_tab(move |tab| {
            let raw = evaluate_string(tab, &script)?;
            serde_json::from_str(&raw).map_err(|e| {
                AgentError::Browser(format!("Unreadable element tagging result: {e}"))
            })
        })
        .await
    }

    async fn click(&self, id: &ElementId) -> Result<()> {
        let id = id.clone();
        self.with_tab(move |tab| {
            let element = find_tagged(tab, &id)?;
            element.click().map_err(browser_error)?;
            Ok(())
        })
        .await
    }

    async fn type_and_submit(&self, id: &ElementId, text: &str) -> Result<()> {
        let id = id.clone();
        let text = text.to_string();
        self.with_tab(move |tab| {
            let element = find_tagged(tab, &id)?;
            element.click().map_err(browser_error)?;
            let clear = format!(
                "(() => {{ const el = document.querySelector({}); if (el) el.value = ''; }})()",
                serde_json::to_string(&id.selector())?
            );
            tab.evaluate(&clear, false).map_err(browser_error)?;
            tab.type_str(&text).map_err(browser_error)?;
            tab.press_key("Enter").map_err(browser_error)?;
            Ok(())
        })
        .await
    }

    async fn page_content(&self) -> Result<String> {
        self.with_tab(|tab| tab.get_content().map_err(browser_error))
            .await
    }

    async fn title(&self) -> Result<String> {
        self.with_tab(|tab| evaluate_string(tab, "document.title"))
            .await
    }

    async fn release(&self) -> Result<()> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| AgentError::SessionLost("browser state poisoned".into()))?
            .take();
        match inner {
            Some(inner) => {
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = inner.tab.close(true) {
                        tracing::debug!(error = %e, "tab close failed during release");
                    }
                    drop(inner);
                })
                .await
                .map_err(|e| AgentError::Browser(format!("browser shutdown panicked: {e}")))?;
                tracing::info!("browser released");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
