//! Live page capability the healing chain and healable locators run against.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("no element matches selector {selector}")]
    ElementNotFound { selector: String },

    #[error("timed out after {timeout_ms}ms waiting for {selector}")]
    Timeout { selector: String, timeout_ms: u64 },

    #[error("invalid selector {selector}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("element for {selector} is not interactable: {reason}")]
    NotInteractable { selector: String, reason: String },

    #[error("page error: {0}")]
    Other(String),
}

impl PageError {
    /// Errors that mean "the selector no longer finds the element", which is
    /// what healing can repair. A wait that times out counts.
    pub fn is_missing_element(&self) -> bool {
        matches!(
            self,
            PageError::ElementNotFound { .. } | PageError::Timeout { .. }
        )
    }
}

/// Element data exposed to strategies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInfo {
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl ElementInfo {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Non-empty `id`.
    pub fn id(&self) -> Option<&str> {
        self.attr("id").filter(|v| !v.is_empty())
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_whitespace()
    }
}

/// A queryable rendered page.
///
/// Every action against a selector that matches nothing fails with
/// [`PageError::ElementNotFound`] (or [`PageError::Timeout`] for waits), so a
/// caller can tell a broken selector apart from other failures.
#[async_trait]
pub trait PageContext: Send + Sync {
    /// Number of elements currently matching `selector`.
    async fn count(&self, selector: &str) -> Result<usize, PageError>;

    /// All elements matching `selector`, in document order.
    async fn query_all(&self, selector: &str) -> Result<Vec<ElementInfo>, PageError>;

    async fn click(&self, selector: &str) -> Result<(), PageError>;

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError>;

    async fn is_visible(&self, selector: &str) -> Result<bool, PageError>;

    async fn text_content(&self, selector: &str) -> Result<Option<String>, PageError>;

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), PageError>;
}
