//! The healing strategies, highest priority first.
//!
//! A strategy only proposes a candidate. The chain verifies it.

use async_trait::async_trait;

use super::page::{PageContext, PageError};
use super::parse;
use crate::config::DataTestForm;

#[async_trait]
pub trait HealingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> i32;

    /// Propose a replacement for `original`, or `None` when this strategy has
    /// nothing to offer.
    async fn heal(
        &self,
        page: &dyn PageContext,
        original: &str,
    ) -> Result<Option<String>, PageError>;
}

/// The five built-in strategies.
pub fn default_strategies(form: DataTestForm) -> Vec<Box<dyn HealingStrategy>> {
    vec![
        Box::new(DataTestAttribute { form }),
        Box::new(AriaLabel),
        Box::new(TextContent),
        Box::new(SimilarElement),
        Box::new(Positional),
    ]
}

const TEST_ATTRIBUTES: [&str; 3] = ["data-test", "data-testid", "data-cy"];

/// Matches the original selector's words against test-hook attribute values.
pub struct DataTestAttribute {
    pub form: DataTestForm,
}

#[async_trait]
impl HealingStrategy for DataTestAttribute {
    fn name(&self) -> &'static str {
        "data-test-attribute"
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn heal(
        &self,
        page: &dyn PageContext,
        original: &str,
    ) -> Result<Option<String>, PageError> {
        let elements = page
            .query_all("[data-test], [data-testid], [data-cy]")
            .await?;

        for element in &elements {
            let hook = TEST_ATTRIBUTES.iter().find_map(|attr| {
                element
                    .attr(attr)
                    .filter(|v| !v.is_empty())
                    .map(|v| (*attr, v))
            });
            let Some((attr, value)) = hook else { continue };

            if parse::tokens_overlap(original, value) {
                let attr = match self.form {
                    DataTestForm::Matched => attr,
                    DataTestForm::Canonical => "data-test",
                };
                return Ok(Some(format!("[{attr}=\"{value}\"]")));
            }
        }
        Ok(None)
    }
}

/// Looks the expected text up in `aria-label`, then `aria-labelledby`.
pub struct AriaLabel;

#[async_trait]
impl HealingStrategy for AriaLabel {
    fn name(&self) -> &'static str {
        "aria-label"
    }

    fn priority(&self) -> i32 {
        8
    }

    async fn heal(
        &self,
        page: &dyn PageContext,
        original: &str,
    ) -> Result<Option<String>, PageError> {
        let Some(text) = parse::expected_text(original) else {
            return Ok(None);
        };
        first_present(
            page,
            [
                format!("[aria-label*=\"{text}\" i]"),
                format!("[aria-labelledby*=\"{text}\" i]"),
            ],
        )
        .await
    }
}

/// Exact visible text, then substring.
pub struct TextContent;

#[async_trait]
impl HealingStrategy for TextContent {
    fn name(&self) -> &'static str {
        "text-content"
    }

    fn priority(&self) -> i32 {
        6
    }

    async fn heal(
        &self,
        page: &dyn PageContext,
        original: &str,
    ) -> Result<Option<String>, PageError> {
        let Some(text) = parse::expected_text(original) else {
            return Ok(None);
        };
        first_present(
            page,
            [format!("text=\"{text}\""), format!("text*=\"{text}\"")],
        )
        .await
    }
}

/// Another element with the same tag, addressed by id or first class.
pub struct SimilarElement;

#[async_trait]
impl HealingStrategy for SimilarElement {
    fn name(&self) -> &'static str {
        "similar-element"
    }

    fn priority(&self) -> i32 {
        4
    }

    async fn heal(
        &self,
        page: &dyn PageContext,
        original: &str,
    ) -> Result<Option<String>, PageError> {
        let Some(tag) = parse::tag_name(original) else {
            return Ok(None);
        };
        let elements = page.query_all(&tag).await?;
        for element in &elements {
            if let Some(id) = element.id() {
                return Ok(Some(format!("#{id}")));
            }
            if let Some(class) = element.classes().next() {
                return Ok(Some(format!(".{class}")));
            }
        }
        Ok(None)
    }
}

/// Last resort: the first-child element of the original tag.
pub struct Positional;

#[async_trait]
impl HealingStrategy for Positional {
    fn name(&self) -> &'static str {
        "positional"
    }

    fn priority(&self) -> i32 {
        2
    }

    async fn heal(
        &self,
        page: &dyn PageContext,
        original: &str,
    ) -> Result<Option<String>, PageError> {
        let Some(tag) = parse::tag_name(original) else {
            return Ok(None);
        };
        if page.count(&tag).await? > 0 {
            Ok(Some(format!("{tag}:nth-child(1)")))
        } else {
            Ok(None)
        }
    }
}

async fn first_present<const N: usize>(
    page: &dyn PageContext,
    candidates: [String; N],
) -> Result<Option<String>, PageError> {
    for candidate in candidates {
        if page.count(&candidate).await? > 0 {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}
