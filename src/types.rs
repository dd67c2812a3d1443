use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_MAX_STEPS: u32 = 10;
pub const DEFAULT_HISTORY_BOUND: usize = 10;
pub const DEFAULT_CATALOG_LIMIT: usize = 350;
pub const DEFAULT_CONTENT_LIMIT: usize = 50_000;

/// Attribute written onto every tagged interactive node.
pub const ELEMENT_ID_ATTR: &str = "data-ai-id";
const ELEMENT_ID_PREFIX: &str = "ai-id-";

/// Synthetic identifier of an interactive node, e.g. `ai-id-12`.
///
/// Only meaningful within the document snapshot that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn from_index(index: u64) -> Self {
        Self(format!("{ELEMENT_ID_PREFIX}{index}"))
    }

    /// Accepts `ai-id-7`, `7` or `[7]`; anything else is kept verbatim so
    /// that it simply fails to resolve against the catalog.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<u64>() {
            Ok(n) => Self::from_index(n),
            Err(_) => Self(trimmed.to_string()),
        }
    }

    pub fn index(&self) -> Option<u64> {
        self.0.strip_prefix(ELEMENT_ID_PREFIX)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// CSS selector addressing the tagged node.
    pub fn selector(&self) -> String {
        format!("[{ELEMENT_ID_ATTR}=\"{}\"]", self.0)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One addressable entry of the element catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    pub id: ElementId,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

/// Ordered, size-bounded list of interactive elements of one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementCatalog {
    entries: Vec<ElementDescriptor>,
}

impl ElementCatalog {
    pub fn new(mut entries: Vec<ElementDescriptor>, limit: usize) -> Self {
        entries.truncate(limit);
        Self { entries }
    }

    pub fn entries(&self) -> &[ElementDescriptor] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &ElementId) -> Option<&ElementDescriptor> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ElementId> {
        self.entries.iter().map(|e| &e.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionKind {
    /// A single record describing the current page's subject.
    Detail,
    /// An array of structured items, e.g. every entry of a listing.
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationDirection {
    Next,
    Previous,
}

/// The single action chosen by the oracle for one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionDirective {
    Click { id: ElementId },
    TypeAndSubmit { id: ElementId, text: String },
    Navigate { url: String },
    Extract,
    ExtractStructured,
    Respond { text: String },
    Fail { reason: String },
    Paginate { id: ElementId, direction: PaginationDirection },
    Return { target: String },
}

impl ActionDirective {
    /// Short wire name, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ActionDirective::Click { .. } => "click",
            ActionDirective::TypeAndSubmit { .. } => "type",
            ActionDirective::Navigate { .. } => "navigate",
            ActionDirective::Extract => "scrape",
            ActionDirective::ExtractStructured => "extract_structured",
            ActionDirective::Respond { .. } => "respond",
            ActionDirective::Fail { .. } => "fail",
            ActionDirective::Paginate { .. } => "paginate",
            ActionDirective::Return { .. } => "return",
        }
    }

    pub fn extraction_kind(&self) -> Option<ExtractionKind> {
        match self {
            ActionDirective::Extract => Some(ExtractionKind::Detail),
            ActionDirective::ExtractStructured => Some(ExtractionKind::List),
            _ => None,
        }
    }
}
