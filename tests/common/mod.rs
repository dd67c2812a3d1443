#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use web_scout::AgentConfig;
use web_scout::brain::{Brain, DecisionOracle, DecisionRequest, ExtractionRequest};
use web_scout::dom::RawElement;
use web_scout::error::{AgentError, Result};
use web_scout::hands::{BrowserDriver, RootHandle, TaggedPage};
use web_scout::types::ElementId;

#[derive(Debug, Clone, Default)]
pub struct FakeElement {
    pub tag: String,
    pub text: Option<String>,
    pub href: Option<String>,
    /// Where clicking leads; `None` leaves the page as it is.
    pub leads_to: Option<String>,
    /// Where submitting typed text leads; `{q}` is replaced by the text.
    pub submits_to: Option<String>,
}

impl FakeElement {
    pub fn link(text: &str, href: &str) -> Self {
        Self {
            tag: "a".into(),
            text: Some(text.into()),
            href: Some(href.into()),
            leads_to: Some(absolute(href)),
            submits_to: None,
        }
    }

    pub fn button(text: &str) -> Self {
        Self {
            tag: "button".into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn search_box(submits_to: &str) -> Self {
        Self {
            tag: "input".into(),
            submits_to: Some(submits_to.into()),
            ..Default::default()
        }
    }
}

/// Site-relative hrefs resolve against [`SITE`].
fn absolute(href: &str) -> String {
    if href.starts_with('/') {
        format!("{SITE}{href}")
    } else {
        href.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakePage {
    pub elements: Vec<FakeElement>,
    pub content: String,
}

#[derive(Default)]
struct BrowserState {
    pages: HashMap<String, FakePage>,
    current: String,
    root_seq: u64,
    root: String,
    tags: Vec<Option<u64>>,
    navigations: Vec<String>,
    clicks: Vec<String>,
    typed: Vec<String>,
    released: u32,
    crash_on_click: bool,
    lost: bool,
}

/// In-memory browser: a map of URL to page, where every navigation
/// replaces the document root.
#[derive(Clone, Default)]
pub struct FakeBrowser {
    state: Arc<Mutex<BrowserState>>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, page: FakePage) -> Self {
        self.state.lock().unwrap().pages.insert(url.to_string(), page);
        self
    }

    pub fn crash_on_click(self) -> Self {
        self.state.lock().unwrap().crash_on_click = true;
        self
    }

    pub fn released(&self) -> u32 {
        self.state.lock().unwrap().released
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().unwrap().navigations.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().unwrap().clicks.clone()
    }

    pub fn typed(&self) -> Vec<String> {
        self.state.lock().unwrap().typed.clone()
    }

    pub fn current(&self) -> String {
        self.state.lock().unwrap().current.clone()
    }

    /// Simulates a page replacing its document without changing URL.
    pub fn reload(&self) {
        let mut state = self.state.lock().unwrap();
        let url = state.current.clone();
        go(&mut state, &url);
    }
}

fn go(state: &mut BrowserState, url: &str) {
    state.current = url.to_string();
    state.root_seq += 1;
    state.root = format!("root-{}", state.root_seq);
    let count = state.pages.get(url).map(|p| p.elements.len()).unwrap_or(0);
    state.tags = vec![None; count];
    state.navigations.push(url.to_string());
}

fn check_alive(state: &BrowserState) -> Result<()> {
    if state.lost {
        return Err(AgentError::SessionLost("browser is gone".into()));
    }
    Ok(())
}

fn find(state: &BrowserState, id: &ElementId) -> Result<FakeElement> {
    let index = id.index();
    let position = state
        .tags
        .iter()
        .position(|t| t.is_some() && *t == index)
        .ok_or_else(|| AgentError::StaleElement { id: id.clone() })?;
    Ok(state.pages[&state.current].elements[position].clone())
}

#[async_trait]
impl BrowserDriver for FakeBrowser {
    async fn navigate(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        check_alive(&state)?;
        go(&mut state, url);
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let state = self.state.lock().unwrap();
        check_alive(&state)?;
        Ok(state.current.clone())
    }

    async fn root(&self) -> Result<RootHandle> {
        let state = self.state.lock().unwrap();
        check_alive(&state)?;
        Ok(RootHandle::new(state.root.clone()))
    }

    async fn is_stale(&self, root: &RootHandle) -> Result<bool> {
        let state = self.state.lock().unwrap();
        check_alive(&state)?;
        Ok(root.as_str() != state.root)
    }

    async fn tag_interactive(&self, next_id: u64) -> Result<TaggedPage> {
        let mut state = self.state.lock().unwrap();
        check_alive(&state)?;
        let mut next = next_id;
        for tag in state.tags.iter_mut() {
            if tag.is_none() {
                *tag = Some(next);
                next += 1;
            }
        }
        let page = state.pages.get(&state.current).cloned().unwrap_or_default();
        let elements = page
            .elements
            .iter()
            .zip(state.tags.iter())
            .map(|(el, tag)| RawElement {
                id: tag.map(|n| ElementId::from_index(n).to_string()),
                tag: Some(el.tag.clone()),
                text: el.text.clone(),
                href: el.href.clone(),
                placeholder: None,
            })
            .collect();
        Ok(TaggedPage {
            root: RootHandle::new(state.root.clone()),
            next_id: next,
            elements,
        })
    }

    async fn click(&self, id: &ElementId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        check_alive(&state)?;
        if state.crash_on_click {
            state.lost = true;
            return Err(AgentError::SessionLost("renderer crashed".into()));
        }
        let element = find(&state, id)?;
        state.clicks.push(id.to_string());
        if let Some(target) = element.leads_to {
            go(&mut state, &target);
        }
        Ok(())
    }

    async fn type_and_submit(&self, id: &ElementId, text: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        check_alive(&state)?;
        let element = find(&state, id)?;
        state.typed.push(text.to_string());
        if let Some(target) = element.submits_to {
            let url = target.replace("{q}", &text.replace(' ', "+"));
            go(&mut state, &url);
        }
        Ok(())
    }

    async fn page_content(&self) -> Result<String> {
        let state = self.state.lock().unwrap();
        check_alive(&state)?;
        Ok(state
            .pages
            .get(&state.current)
            .map(|p| p.content.clone())
            .unwrap_or_default())
    }

    async fn title(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn release(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.released += 1;
        state.lost = true;
        Ok(())
    }
}

type DecideFn = dyn Fn(&DecisionRequest) -> String + Send + Sync;

/// Deterministic oracle answering from a closure.
#[derive(Clone)]
pub struct ScriptedOracle {
    decide: Arc<DecideFn>,
    extraction_reply: Arc<Mutex<String>>,
    decisions: Arc<Mutex<Vec<DecisionRequest>>>,
    extractions: Arc<Mutex<Vec<ExtractionRequest>>>,
}

impl ScriptedOracle {
    pub fn always(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::from_fn(move |_| reply.clone())
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&DecisionRequest) -> String + Send + Sync + 'static,
    {
        Self {
            decide: Arc::new(f),
            extraction_reply: Arc::new(Mutex::new(r#"{"error":"nothing scripted"}"#.into())),
            decisions: Arc::new(Mutex::new(Vec::new())),
            extractions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_extraction(self, reply: &str) -> Self {
        *self.extraction_reply.lock().unwrap() = reply.to_string();
        self
    }

    pub fn decisions(&self) -> Vec<DecisionRequest> {
        self.decisions.lock().unwrap().clone()
    }

    pub fn extractions(&self) -> Vec<ExtractionRequest> {
        self.extractions.lock().unwrap().clone()
    }

    pub fn brain(&self) -> Brain {
        Brain::new(Arc::new(self.clone()))
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn suggest(&self, request: &DecisionRequest) -> Result<String> {
        self.decisions.lock().unwrap().push(request.clone());
        Ok((self.decide)(request))
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<String> {
        self.extractions.lock().unwrap().push(request.clone());
        Ok(self.extraction_reply.lock().unwrap().clone())
    }
}

/// Config with waits short enough for tests.
pub fn fast_config() -> AgentConfig {
    AgentConfig {
        navigation_timeout: Duration::from_millis(60),
        poll_interval: Duration::from_millis(5),
        settle_delay: Duration::ZERO,
        ..AgentConfig::default()
    }
}

/// Id of the first catalog entry whose href contains `needle`.
pub fn id_with_href(request: &DecisionRequest, needle: &str) -> Option<String> {
    request
        .elements
        .entries()
        .iter()
        .find(|e| e.href.as_deref().is_some_and(|h| h.contains(needle)))
        .map(|e| e.id.to_string())
}

pub fn id_with_tag(request: &DecisionRequest, tag: &str) -> Option<String> {
    request
        .elements
        .entries()
        .iter()
        .find(|e| e.tag == tag)
        .map(|e| e.id.to_string())
}

pub const SITE: &str = "https://comics.example";
pub const HOME: &str = "https://comics.example/";
pub const LISTING: &str = "https://comics.example/?s=solo+leveling";
pub const LISTING_PAGE_2: &str = "https://comics.example/page/2/?s=solo+leveling";
pub const DETAIL: &str = "https://comics.example/comic/solo-leveling/";

/// Home page with a search box, a results listing and a detail page.
pub fn comic_site() -> FakeBrowser {
    let mut results: Vec<FakeElement> = vec![FakeElement::link("Home", "/")];
    results.push(FakeElement::link("Solo Leveling", "/comic/solo-leveling/"));
    for i in 0..5 {
        results.push(FakeElement::link(
            &format!("Solo Leveling: Ragnarok {i}"),
            &format!("/comic/solo-leveling-ragnarok-{i}/"),
        ));
    }
    results.push(FakeElement::link("Next", "/page/2/?s=solo+leveling"));

    let mut page_two = results.clone();
    page_two.pop();

    FakeBrowser::new()
        .page(
            HOME,
            FakePage {
                elements: vec![
                    FakeElement::link("Home", "/"),
                    FakeElement::search_box("https://comics.example/?s={q}"),
                    FakeElement::button("Menu"),
                ],
                content: "<html><body>Welcome</body></html>".into(),
            },
        )
        .page(
            LISTING,
            FakePage {
                elements: results,
                content: "<html><body>Search results</body></html>".into(),
            },
        )
        .page(
            LISTING_PAGE_2,
            FakePage {
                elements: page_two,
                content: "<html><body>More results</body></html>".into(),
            },
        )
        .page(
            DETAIL,
            FakePage {
                elements: vec![
                    FakeElement::link("Home", "/"),
                    FakeElement::link("Chapter 1", "/solo-leveling-chapter-1/"),
                    FakeElement::link("Chapter 2", "/solo-leveling-chapter-2/"),
                    FakeElement::button("Bookmark"),
                ],
                content: "<html><h1>Solo Leveling</h1><p>Synopsis</p></html>".into(),
            },
        )
}
