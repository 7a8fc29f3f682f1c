//! A recorded DOM as a [`PageContext`].
//!
//! Runners attach a snapshot to a heal request so the worker can run the chain
//! without a live browser. The selector evaluator here understands exactly the
//! forms the strategies produce plus plain compound selectors: tag, `#id`,
//! `.class`, `[attr]`, `[attr="v"]`, `[attr*="v" i]`, `:nth-child(n)`,
//! `:has-text("t")`, `text="t"`, `text*="t"`, and comma lists. Combinators are
//! rejected as invalid.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::page::{ElementInfo, PageContext, PageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotElement {
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub text: Option<String>,
    /// Index of the parent element in the snapshot; `None` for top-level nodes.
    #[serde(default)]
    pub parent: Option<usize>,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

impl SnapshotElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            text: None,
            parent: None,
            visible: true,
        }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn child_of(mut self, parent: usize) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    fn info(&self) -> ElementInfo {
        ElementInfo {
            tag: self.tag.clone(),
            attributes: self.attributes.clone(),
            text: self.text.clone(),
        }
    }
}

/// An action performed against the snapshot, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interaction {
    pub action: &'static str,
    pub selector: String,
    pub value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomSnapshot {
    #[serde(default)]
    pub url: Option<String>,
    pub elements: Vec<SnapshotElement>,
    #[serde(skip)]
    interactions: Mutex<Vec<Interaction>>,
}

impl Clone for DomSnapshot {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            elements: self.elements.clone(),
            interactions: Mutex::new(Vec::new()),
        }
    }
}

impl PartialEq for DomSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.elements == other.elements
    }
}

impl DomSnapshot {
    pub fn new(elements: Vec<SnapshotElement>) -> Self {
        Self {
            url: None,
            elements,
            interactions: Mutex::new(Vec::new()),
        }
    }

    /// Load a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read DOM snapshot: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse DOM snapshot: {}", path.display()))
    }

    pub fn interactions(&self) -> Vec<Interaction> {
        self.interactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Indices of elements matching `selector`, in document order.
    pub fn select(&self, selector: &str) -> Result<Vec<usize>, PageError> {
        let queries = parse_selector(selector)?;
        Ok((0..self.elements.len())
            .filter(|&idx| queries.iter().any(|q| self.matches(idx, q)))
            .collect())
    }

    fn first(&self, selector: &str) -> Result<&SnapshotElement, PageError> {
        self.select(selector)?
            .first()
            .map(|&idx| &self.elements[idx])
            .ok_or_else(|| PageError::ElementNotFound {
                selector: selector.to_string(),
            })
    }

    fn record(&self, action: &'static str, selector: &str, value: Option<&str>) {
        self.interactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Interaction {
                action,
                selector: selector.to_string(),
                value: value.map(str::to_string),
            });
    }

    fn matches(&self, idx: usize, query: &Query) -> bool {
        let el = &self.elements[idx];
        let text = el.text.as_deref().unwrap_or("");
        match query {
            Query::TextExact(t) => text.trim() == t,
            Query::TextContains(t) => contains(text, t, true),
            Query::Compound(conds) => conds.iter().all(|c| self.matches_cond(idx, c)),
        }
    }

    fn matches_cond(&self, idx: usize, cond: &Cond) -> bool {
        let el = &self.elements[idx];
        match cond {
            Cond::Tag(tag) => el.tag.eq_ignore_ascii_case(tag),
            Cond::Id(id) => el.attributes.get("id") == Some(id),
            Cond::Class(class) => el
                .attributes
                .get("class")
                .is_some_and(|c| c.split_whitespace().any(|x| x == class)),
            Cond::Attr {
                name,
                op,
                value,
                case_insensitive,
            } => match el.attributes.get(name) {
                None => false,
                Some(actual) => match op {
                    AttrOp::Exists => true,
                    AttrOp::Equals if *case_insensitive => actual.eq_ignore_ascii_case(value),
                    AttrOp::Equals => actual == value,
                    AttrOp::Contains => contains(actual, value, *case_insensitive),
                },
            },
            Cond::NthChild(n) => self.sibling_position(idx) == *n,
            Cond::HasText(t) => contains(el.text.as_deref().unwrap_or(""), t, true),
        }
    }

    /// 1-based position among elements sharing the same parent.
    fn sibling_position(&self, idx: usize) -> usize {
        let parent = self.elements[idx].parent;
        self.elements[..=idx]
            .iter()
            .filter(|e| e.parent == parent)
            .count()
    }
}

fn contains(haystack: &str, needle: &str, case_insensitive: bool) -> bool {
    if case_insensitive {
        haystack.to_lowercase().contains(&needle.to_lowercase())
    } else {
        haystack.contains(needle)
    }
}

#[async_trait]
impl PageContext for DomSnapshot {
    async fn count(&self, selector: &str) -> Result<usize, PageError> {
        Ok(self.select(selector)?.len())
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<ElementInfo>, PageError> {
        Ok(self
            .select(selector)?
            .into_iter()
            .map(|idx| self.elements[idx].info())
            .collect())
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let el = self.first(selector)?;
        if !el.visible {
            return Err(PageError::NotInteractable {
                selector: selector.to_string(),
                reason: "element is hidden".to_string(),
            });
        }
        self.record("click", selector, None);
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError> {
        let el = self.first(selector)?;
        let editable = matches!(el.tag.as_str(), "input" | "textarea" | "select")
            || el.attributes.contains_key("contenteditable");
        if !editable {
            return Err(PageError::NotInteractable {
                selector: selector.to_string(),
                reason: format!("<{}> is not editable", el.tag),
            });
        }
        self.record("fill", selector, Some(value));
        Ok(())
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, PageError> {
        Ok(self.first(selector)?.visible)
    }

    async fn text_content(&self, selector: &str) -> Result<Option<String>, PageError> {
        Ok(self.first(selector)?.text.clone())
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), PageError> {
        // A static snapshot never changes, so the element is either there or not.
        if self.select(selector)?.is_empty() {
            return Err(PageError::Timeout {
                selector: selector.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Selector evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Query {
    TextExact(String),
    TextContains(String),
    Compound(Vec<Cond>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cond {
    Tag(String),
    Id(String),
    Class(String),
    Attr {
        name: String,
        op: AttrOp,
        value: String,
        case_insensitive: bool,
    },
    NthChild(usize),
    HasText(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrOp {
    Exists,
    Equals,
    Contains,
}

fn invalid(selector: &str, reason: impl Into<String>) -> PageError {
    PageError::InvalidSelector {
        selector: selector.to_string(),
        reason: reason.into(),
    }
}

fn parse_selector(selector: &str) -> Result<Vec<Query>, PageError> {
    split_top_level(selector)
        .into_iter()
        .map(|part| parse_query(selector, part.trim()))
        .collect()
}

/// Split on commas outside quotes, brackets and parentheses.
fn split_top_level(selector: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '[') | (None, '(') => depth += 1,
            (None, ']') | (None, ')') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&selector[start..]);
    parts
}

fn unquote(raw: &str) -> String {
    let s = raw.trim();
    let mut chars = s.chars();
    match (chars.next(), chars.next_back()) {
        (Some(a), Some(b)) if a == b && (a == '"' || a == '\'') => s[1..s.len() - 1].to_string(),
        _ => s.to_string(),
    }
}

fn parse_query(selector: &str, part: &str) -> Result<Query, PageError> {
    if part.is_empty() {
        return Err(invalid(selector, "empty selector"));
    }
    if let Some(rest) = part.strip_prefix("text*=") {
        return Ok(Query::TextContains(unquote(rest)));
    }
    if let Some(rest) = part.strip_prefix("text=") {
        return Ok(Query::TextExact(unquote(rest)));
    }

    let chars: Vec<char> = part.chars().collect();
    let mut conds = Vec::new();
    let mut i = 0;

    if chars[0] == '*' {
        i = 1;
    } else if chars[0].is_ascii_alphabetic() {
        let (tag, next) = read_ident(&chars, 0);
        conds.push(Cond::Tag(tag.to_ascii_lowercase()));
        i = next;
    }

    while i < chars.len() {
        match chars[i] {
            '#' | '.' => {
                let (ident, next) = read_ident(&chars, i + 1);
                if ident.is_empty() {
                    return Err(invalid(selector, format!("dangling '{}'", chars[i])));
                }
                conds.push(if chars[i] == '#' {
                    Cond::Id(ident)
                } else {
                    Cond::Class(ident)
                });
                i = next;
            }
            '[' => {
                let close = find_close(&chars, i, '[', ']')
                    .ok_or_else(|| invalid(selector, "unbalanced '['"))?;
                let inner: String = chars[i + 1..close].iter().collect();
                conds.push(parse_attr(selector, &inner)?);
                i = close + 1;
            }
            ':' => {
                let (name, next) = read_ident(&chars, i + 1);
                let (arg, next) = if chars.get(next) == Some(&'(') {
                    let close = find_close(&chars, next, '(', ')')
                        .ok_or_else(|| invalid(selector, "unbalanced '('"))?;
                    (chars[next + 1..close].iter().collect::<String>(), close + 1)
                } else {
                    (String::new(), next)
                };
                conds.push(match name.as_str() {
                    "nth-child" => Cond::NthChild(
                        arg.trim()
                            .parse()
                            .map_err(|_| invalid(selector, format!("bad nth-child index {arg:?}")))?,
                    ),
                    "has-text" => Cond::HasText(unquote(&arg)),
                    other => return Err(invalid(selector, format!("unsupported pseudo-class :{other}"))),
                });
                i = next;
            }
            c if c.is_whitespace() || matches!(c, '>' | '+' | '~') => {
                return Err(invalid(selector, "combinators are not supported"));
            }
            c => return Err(invalid(selector, format!("unexpected character {c:?}"))),
        }
    }

    Ok(Query::Compound(conds))
}

fn read_ident(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '-' || chars[end] == '_') {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

/// Index of the bracket closing the one at `open_at`, skipping quoted text.
fn find_close(chars: &[char], open_at: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    for (i, &c) in chars.iter().enumerate().skip(open_at) {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == open => depth += 1,
            None if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            None => {}
        }
    }
    None
}

fn parse_attr(selector: &str, inner: &str) -> Result<Cond, PageError> {
    let chars: Vec<char> = inner.trim().chars().collect();
    let (name, next) = read_ident(&chars, 0);
    if name.is_empty() {
        return Err(invalid(selector, "attribute selector without a name"));
    }
    let rest: String = chars[next..].iter().collect();
    let rest = rest.trim();

    let (op, value_part) = if rest.is_empty() {
        return Ok(Cond::Attr {
            name,
            op: AttrOp::Exists,
            value: String::new(),
            case_insensitive: false,
        });
    } else if let Some(v) = rest.strip_prefix("*=") {
        (AttrOp::Contains, v.trim())
    } else if let Some(v) = rest.strip_prefix('=') {
        (AttrOp::Equals, v.trim())
    } else {
        return Err(invalid(selector, format!("unsupported attribute operator in [{inner}]")));
    };

    let (value, flags) = match value_part.chars().next() {
        Some(q @ ('"' | '\'')) => {
            let body = &value_part[1..];
            let end = body
                .find(q)
                .ok_or_else(|| invalid(selector, "unterminated attribute value"))?;
            (body[..end].to_string(), body[end + 1..].trim())
        }
        _ => {
            let mut parts = value_part.splitn(2, char::is_whitespace);
            let value = parts.next().unwrap_or("").to_string();
            (value, parts.next().unwrap_or("").trim())
        }
    };

    let case_insensitive = match flags {
        "" => false,
        "i" | "I" => true,
        other => return Err(invalid(selector, format!("unknown attribute flag {other:?}"))),
    };

    Ok(Cond::Attr {
        name,
        op,
        value,
        case_insensitive,
    })
}
