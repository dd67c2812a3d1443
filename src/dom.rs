use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use url::Url;

use crate::error::Result;
use crate::hands::{BrowserDriver, RootHandle};
use crate::types::{ELEMENT_ID_ATTR, ElementCatalog, ElementDescriptor, ElementId};

/// Nodes considered interactive.
pub const INTERACTIVE_SELECTOR: &str = "a, button, input[type=\"submit\"], input[type=\"text\"], input[type=\"search\"], input:not([type])";

const MAX_TEXT_CHARS: usize = 80;

/// JavaScript injected into the page to tag interactive elements.
///
/// The script:
///   1. Stamps the document root with `rootToken` unless it already carries one.
///   2. Gives every untagged interactive node the next `ai-id-N` identifier.
///   3. Returns `{root, next, elements}` as a JSON string, elements in document order.
pub fn tagging_script(next_id: u64, root_token: &str) -> String {
    let token = serde_json::to_string(root_token).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"
(() => {{
  const root = document.documentElement;
  if (!root.dataset.aiRoot) root.dataset.aiRoot = {token};
  let next = {next_id};
  const elements = [];
  for (const el of document.querySelectorAll('{selector}')) {{
    if (!el.getAttribute('{attr}')) el.setAttribute('{attr}', 'ai-id-' + (next++));
    const info = {{ id: el.getAttribute('{attr}'), tag: el.tagName.toLowerCase() }};
    const text = (el.innerText || el.value || '').trim();
    if (text) info.text = text;
    const href = el.getAttribute('href');
    if (href) info.href = href;
    const placeholder = el.getAttribute('placeholder');
    if (placeholder) info.placeholder = placeholder;
    elements.push(info);
  }}
  return JSON.stringify({{ root: root.dataset.aiRoot, next: next, elements: elements }});
}})()
"#,
        selector = INTERACTIVE_SELECTOR.replace('\'', "\\'"),
        attr = ELEMENT_ID_ATTR,
    )
}

/// Script returning true once the tagged root has been replaced.
pub fn staleness_script(root: &RootHandle) -> String {
    let token = serde_json::to_string(root.as_str()).unwrap_or_else(|_| "\"\"".to_string());
    format!("document.documentElement.dataset.aiRoot !== {token}")
}

/// Element as reported by the page, before any cleanup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawElement {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
}

/// Turns raw page elements into catalog entries.
///
/// Missing attributes are simply left out; entries without an id are
/// skipped. Link targets are made absolute against `base_url`, and a link
/// repeating an earlier entry's text and target is dropped.
pub fn describe_elements(raw: Vec<RawElement>, base_url: &str, limit: usize) -> ElementCatalog {
    let base = Url::parse(base_url).ok();
    let mut seen_links = HashSet::new();
    let mut entries = Vec::new();

    for el in raw {
        let Some(id) = el.id.as_deref().map(ElementId::parse) else {
            continue;
        };
        let tag = el
            .tag
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let text = el.text.as_deref().and_then(clean_text);
        let href = el
            .href
            .as_deref()
            .and_then(|h| absolutize(base.as_ref(), h));
        let placeholder = el.placeholder.as_deref().and_then(clean_text);

        if let Some(ref target) = href {
            if !seen_links.insert((target.clone(), text.clone())) {
                continue;
            }
        }

        entries.push(ElementDescriptor {
            id,
            tag,
            text,
            href,
            placeholder,
        });
    }

    ElementCatalog::new(entries, limit)
}

fn clean_text(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(MAX_TEXT_CHARS).collect())
}

fn absolutize(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.to_ascii_lowercase().starts_with("javascript:") {
        return None;
    }
    match base {
        Some(base) => base.join(href).ok().map(|u| u.to_string()),
        None => Some(href.to_string()),
    }
}

/// The interactive surface of one document snapshot.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub root: RootHandle,
    pub url: String,
    pub catalog: ElementCatalog,
}

/// Builds catalogs with identifiers that are never reused across snapshots.
#[derive(Debug)]
pub struct CatalogBuilder {
    next_id: u64,
    limit: usize,
    last_root: Option<RootHandle>,
}

impl CatalogBuilder {
    pub fn new(limit: usize) -> Self {
        Self {
            next_id: 0,
            limit,
            last_root: None,
        }
    }

    pub async fn build(&mut self, driver: &dyn BrowserDriver) -> Result<CatalogSnapshot> {
        let url = driver.current_url().await?;
        let start = self.next_id;
        let tagged = driver.tag_interactive(start).await?;

        let new_root = self.last_root.as_ref() != Some(&tagged.root);
        let mut elements = tagged.elements;
        if new_root {
            // A fresh root can only carry identifiers issued just now.
            let before = elements.len();
            elements.retain(|el| {
                el.id
                    .as_deref()
                    .and_then(|id| ElementId::parse(id).index())
                    .is_some_and(|n| n >= start)
            });
            if elements.len() != before {
                tracing::warn!(
                    dropped = before - elements.len(),
                    "discarded elements carrying identifiers from an earlier snapshot"
                );
            }
        }

        self.next_id = self.next_id.max(tagged.next_id);
        self.last_root = Some(tagged.root.clone());

        let catalog = describe_elements(elements, &url, self.limit);
        tracing::debug!(
            url = %url,
            root = %tagged.root,
            elements = catalog.len(),
            "built element catalog"
        );
        Ok(CatalogSnapshot {
            root: tagged.root,
            url,
            catalog,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    /// A page of search results or a similar index.
    Listing,
    Other,
}

/// Guesses whether a page is a results listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingHeuristic {
    /// Query keys that carry a search term, such as `s` in `?s=solo`.
    pub query_keys: Vec<String>,
    /// Whole path segments that name a search page, such as `/search/`.
    pub path_segments: Vec<String>,
    /// Number of distinct entries sharing one structural shape that marks a listing.
    pub repeat_threshold: usize,
}

impl Default for ListingHeuristic {
    fn default() -> Self {
        Self {
            query_keys: ["s", "q", "search", "query", "keyword"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            path_segments: vec!["search".to_string()],
            repeat_threshold: 12,
        }
    }
}

impl ListingHeuristic {
    pub fn classify(&self, url: &str, catalog: &ElementCatalog) -> PageKind {
        if self.has_search_marker(url) {
            return PageKind::Listing;
        }
        if self.repeat_threshold > 0 && largest_repeated_shape(catalog) >= self.repeat_threshold {
            return PageKind::Listing;
        }
        PageKind::Other
    }

    fn has_search_marker(&self, url: &str) -> bool {
        let Ok(url) = Url::parse(url) else {
            return false;
        };
        let by_query = url
            .query_pairs()
            .any(|(key, _)| self.query_keys.iter().any(|k| k.eq_ignore_ascii_case(&key)));
        if by_query {
            return true;
        }
        url.path_segments().into_iter().flatten().any(|segment| {
            // `search.php` counts, `research-lab` does not.
            let stem = segment.split('.').next().unwrap_or(segment);
            self.path_segments.iter().any(|s| s.eq_ignore_ascii_case(stem))
        })
    }
}

/// Size of the biggest group of links with the same host, leading path
/// segment and path depth, counting a numbered run such as
/// `solo-leveling-chapter-1 .. -40` as one entry.
fn largest_repeated_shape(catalog: &ElementCatalog) -> usize {
    let mut shapes: HashMap<(String, String, usize), HashSet<String>> = HashMap::new();
    for entry in catalog.entries() {
        let Some(href) = entry.href.as_deref() else {
            continue;
        };
        let Ok(url) = Url::parse(href) else {
            continue;
        };
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
            continue;
        };
        let key = (
            url.host_str().unwrap_or_default().to_string(),
            first.to_string(),
            segments.len(),
        );
        shapes.entry(key).or_default().insert(sequence_stem(last));
    }
    shapes.values().map(HashSet::len).max().unwrap_or(0)
}

/// Path segment with any trailing number removed: `title-chapter-12` and
/// `title-chapter-13` share the stem `title-chapter`.
fn sequence_stem(segment: &str) -> String {
    let lowered = segment.to_ascii_lowercase();
    let without_number = lowered.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
    if without_number.len() == lowered.len() {
        return lowered;
    }
    without_number.trim_end_matches(['-', '_']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, tag: &str, text: Option<&str>, href: Option<&str>) -> RawElement {
        RawElement {
            id: Some(id.to_string()),
            tag: Some(tag.to_string()),
            text: text.map(String::from),
            href: href.map(String::from),
            placeholder: None,
        }
    }

    #[test]
    fn tolerates_missing_attributes() {
        let catalog = describe_elements(
            vec![
                RawElement {
                    id: Some("ai-id-0".into()),
                    ..Default::default()
                },
                RawElement::default(),
                raw("ai-id-1", "BUTTON", Some("   "), None),
            ],
            "https://a.example/",
            350,
        );
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.entries()[0].tag, "unknown");
        assert_eq!(catalog.entries()[1].tag, "button");
        assert!(catalog.entries()[1].text.is_none());
    }

    #[test]
    fn hrefs_are_absolutized_and_filtered() {
        let catalog = describe_elements(
            vec![
                raw("ai-id-0", "a", Some("Solo"), Some("/comic/solo/")),
                raw("ai-id-1", "a", Some("Top"), Some("#top")),
                raw("ai-id-2", "a", Some("Menu"), Some("javascript:void(0)")),
            ],
            "https://a.example/list/",
            350,
        );
        let hrefs: Vec<_> = catalog.entries().iter().map(|e| e.href.clone()).collect();
        assert_eq!(
            hrefs,
            vec![Some("https://a.example/comic/solo/".to_string()), None, None]
        );
    }

    #[test]
    fn duplicate_links_are_dropped() {
        let catalog = describe_elements(
            vec![
                raw("ai-id-0", "a", Some("Solo"), Some("/comic/solo/")),
                raw("ai-id-1", "a", Some("Solo"), Some("/comic/solo/")),
                raw("ai-id-2", "a", None, Some("/comic/solo/")),
            ],
            "https://a.example/",
            350,
        );
        let ids: Vec<_> = catalog.ids().map(|i| i.as_str().to_string()).collect();
        assert_eq!(ids, vec!["ai-id-0", "ai-id-2"]);
    }

    #[test]
    fn text_is_collapsed_and_clipped() {
        let long = format!("  Chapter\n\n {}", "x".repeat(200));
        let catalog = describe_elements(vec![raw("ai-id-0", "a", Some(&long), None)], "", 350);
        let text = catalog.entries()[0].text.clone().unwrap();
        assert!(text.starts_with("Chapter x"));
        assert_eq!(text.chars().count(), MAX_TEXT_CHARS);
    }

    #[test]
    fn catalog_bounded_prefix() {
        let raws = (0..400)
            .map(|i| raw(&format!("ai-id-{i}"), "button", Some(&format!("b{i}")), None))
            .collect();
        let catalog = describe_elements(raws, "https://a.example/", 350);
        assert_eq!(catalog.len(), 350);
        assert_eq!(catalog.entries()[349].id, ElementId::from_index(349));
    }

    fn links(paths: &[String]) -> ElementCatalog {
        let raws = paths
            .iter()
            .enumerate()
            .map(|(i, p)| raw(&format!("ai-id-{i}"), "a", Some(&format!("item {i}")), Some(p)))
            .collect();
        describe_elements(raws, "https://a.example/", 350)
    }

    #[test]
    fn search_marker_means_listing() {
        let heuristic = ListingHeuristic::default();
        let catalog = links(&["/about/".to_string()]);
        assert_eq!(
            heuristic.classify("https://a.example/?s=solo+leveling", &catalog),
            PageKind::Listing
        );
        assert_eq!(
            heuristic.classify("https://a.example/comic/solo/", &catalog),
            PageKind::Other
        );
    }

    const TITLES: &[&str] = &[
        "solo-leveling",
        "one-piece",
        "naruto",
        "bleach",
        "berserk",
        "vagabond",
        "monster",
        "blue-lock",
        "kingdom",
        "dandadan",
        "sakamoto-days",
        "chainsaw-man",
        "spy-x-family",
        "frieren",
        "haikyuu",
    ];

    #[test]
    fn repeated_shapes_mean_listing() {
        let heuristic = ListingHeuristic::default();
        let paths: Vec<String> = TITLES.iter().map(|t| format!("/comic/{t}/")).collect();
        assert_eq!(
            heuristic.classify("https://a.example/daftar-komik/", &links(&paths)),
            PageKind::Listing
        );
        let few: Vec<String> = TITLES[..4].iter().map(|t| format!("/comic/{t}/")).collect();
        assert_eq!(
            heuristic.classify("https://a.example/daftar-komik/", &links(&few)),
            PageKind::Other
        );
    }

    #[test]
    fn chapter_list_is_not_a_listing() {
        let heuristic = ListingHeuristic::default();
        let mut paths: Vec<String> = (1..=40)
            .map(|n| format!("/chapter/solo-leveling-chapter-{n}/"))
            .collect();
        paths.push("/chapter/solo-leveling-chapter-110.5/".to_string());
        paths.extend(TITLES[..3].iter().map(|t| format!("/comic/{t}/")));
        assert_eq!(
            heuristic.classify("https://a.example/komik/solo-leveling/", &links(&paths)),
            PageKind::Other
        );
    }

    #[test]
    fn sequence_stems_collapse_numbered_runs() {
        assert_eq!(sequence_stem("solo-leveling-chapter-12"), "solo-leveling-chapter");
        assert_eq!(sequence_stem("Solo-Leveling-Chapter-12.5"), "solo-leveling-chapter");
        assert_eq!(sequence_stem("ch_7"), "ch");
        assert_eq!(sequence_stem("naruto"), "naruto");
    }

    #[test]
    fn search_words_inside_slugs_are_not_markers() {
        let heuristic = ListingHeuristic::default();
        let empty = ElementCatalog::default();
        for url in [
            "https://comics.example/komik/research-lab/",
            "https://comics.example/searchlight/",
            "https://comics.example/komik/solo/?ref=search",
            "https://comics.example/comic/questioning/?page=2",
        ] {
            assert_eq!(heuristic.classify(url, &empty), PageKind::Other, "{url}");
        }
        for url in [
            "https://comics.example/?s=solo",
            "https://comics.example/page/2/?s=solo",
            "https://comics.example/search?q=x",
            "https://comics.example/search/solo/",
            "https://comics.example/search.php?id=1",
            "https://comics.example/list/?Keyword=solo",
        ] {
            assert_eq!(heuristic.classify(url, &empty), PageKind::Listing, "{url}");
        }
        assert_eq!(heuristic.classify("not a url", &empty), PageKind::Other);
    }

    #[test]
    fn tagging_script_embeds_parameters() {
        let script = tagging_script(42, "snap-3");
        assert!(script.contains("let next = 42;"));
        assert!(script.contains("\"snap-3\""));
        assert!(script.contains(ELEMENT_ID_ATTR));
        assert!(staleness_script(&RootHandle::new("snap-3")).contains("\"snap-3\""));
    }
}
