//! Self-healing locator over a [`PageContext`].

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::page::{PageContext, PageError};
use super::{HealingAttempt, SelectorHealer};
use crate::collector::{DispatchHandle, HealingEvent};

/// The test a locator acts on behalf of, carried into every healing event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocatorContext {
    pub run_id: String,
    pub tenant_id: String,
    pub test_file: String,
    pub test_name: String,
}

/// A selector bound to a page that repairs itself when it stops matching.
///
/// Each action tries the current selector first. Only an element-not-found
/// failure triggers healing; the action is then retried once with the healed
/// selector, which is kept for later actions. When healing comes up empty the
/// original error is returned unchanged.
pub struct HealableLocator {
    page: Arc<dyn PageContext>,
    healer: Arc<SelectorHealer>,
    original: String,
    current: Mutex<String>,
    context: LocatorContext,
    events: Option<DispatchHandle>,
    attempts: Mutex<Vec<HealingAttempt>>,
}

impl HealableLocator {
    pub fn new(
        page: Arc<dyn PageContext>,
        healer: Arc<SelectorHealer>,
        selector: &str,
        context: LocatorContext,
    ) -> Self {
        Self {
            page,
            healer,
            original: selector.to_string(),
            current: Mutex::new(selector.to_string()),
            context,
            events: None,
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Persist every healing attempt through `events`.
    pub fn with_events(mut self, events: DispatchHandle) -> Self {
        self.events = Some(events);
        self
    }

    /// The selector the next action will use.
    pub fn selector(&self) -> String {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn original_selector(&self) -> &str {
        &self.original
    }

    pub fn attempts(&self) -> Vec<HealingAttempt> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn click(&self) -> Result<(), PageError> {
        let page = self.page.clone();
        self.perform(move |sel| {
            let page = page.clone();
            async move { page.click(&sel).await }
        })
        .await
    }

    pub async fn fill(&self, value: &str) -> Result<(), PageError> {
        let page = self.page.clone();
        let value = value.to_string();
        self.perform(move |sel| {
            let page = page.clone();
            let value = value.clone();
            async move { page.fill(&sel, &value).await }
        })
        .await
    }

    pub async fn is_visible(&self) -> Result<bool, PageError> {
        let page = self.page.clone();
        self.perform(move |sel| {
            let page = page.clone();
            async move { page.is_visible(&sel).await }
        })
        .await
    }

    pub async fn text_content(&self) -> Result<Option<String>, PageError> {
        let page = self.page.clone();
        self.perform(move |sel| {
            let page = page.clone();
            async move { page.text_content(&sel).await }
        })
        .await
    }

    pub async fn wait_for(&self, timeout: Duration) -> Result<(), PageError> {
        let page = self.page.clone();
        self.perform(move |sel| {
            let page = page.clone();
            async move { page.wait_for(&sel, timeout).await }
        })
        .await
    }

    async fn perform<T, F, Fut>(&self, action: F) -> Result<T, PageError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, PageError>>,
    {
        let err = match action(self.selector()).await {
            Err(e) if e.is_missing_element() && self.healer.is_enabled() => e,
            other => return other,
        };

        let started = Instant::now();
        match self.healer.heal(self.page.as_ref(), &self.original).await {
            Some(healed) => {
                info!(
                    test = %self.context.test_name,
                    selector = %self.original,
                    healed = %healed.selector,
                    strategy = %healed.strategy,
                    "retrying action with healed selector"
                );
                self.record(HealingAttempt::healed(
                    &self.context.test_file,
                    &self.context.test_name,
                    &self.original,
                    &healed,
                    started.elapsed(),
                ));
                *self.current.lock().unwrap_or_else(|e| e.into_inner()) = healed.selector.clone();
                action(healed.selector).await
            }
            None => {
                warn!(
                    test = %self.context.test_name,
                    selector = %self.original,
                    error = %err,
                    "selector could not be healed"
                );
                self.record(HealingAttempt::unresolved(
                    &self.context.test_file,
                    &self.context.test_name,
                    &self.original,
                    err.to_string(),
                    started.elapsed(),
                ));
                Err(err)
            }
        }
    }

    fn record(&self, attempt: HealingAttempt) {
        if let Some(events) = &self.events {
            events.healing_event(HealingEvent {
                run_id: self.context.run_id.clone(),
                tenant_id: self.context.tenant_id.clone(),
                attempt: attempt.clone(),
            });
        }
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(attempt);
    }
}
