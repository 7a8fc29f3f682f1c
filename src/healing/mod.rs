//! Selector healing: a priority-ordered chain of heuristic strategies that
//! proposes a working replacement for a broken selector.

pub mod confidence;
pub mod locator;
pub mod page;
pub mod parse;
pub mod snapshot;
pub mod strategy;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HealingConfig;

pub use self::locator::{HealableLocator, LocatorContext};
pub use self::page::{ElementInfo, PageContext, PageError};
pub use self::snapshot::{DomSnapshot, SnapshotElement};
pub use self::strategy::{default_strategies, HealingStrategy};

/// Record of one healing attempt, as persisted to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingAttempt {
    pub test_file: String,
    pub test_name: String,
    pub original_selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healed_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealingAttempt {
    pub fn healed(
        test_file: &str,
        test_name: &str,
        original: &str,
        healed: &HealedSelector,
        elapsed: Duration,
    ) -> Self {
        Self {
            test_file: test_file.to_string(),
            test_name: test_name.to_string(),
            original_selector: original.to_string(),
            healed_selector: Some(healed.selector.clone()),
            confidence: Some(healed.confidence),
            success: true,
            strategy: Some(healed.strategy.clone()),
            execution_time_ms: elapsed.as_millis() as u64,
            error: None,
        }
    }

    pub fn unresolved(
        test_file: &str,
        test_name: &str,
        original: &str,
        error: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            test_file: test_file.to_string(),
            test_name: test_name.to_string(),
            original_selector: original.to_string(),
            healed_selector: None,
            confidence: None,
            success: false,
            strategy: None,
            execution_time_ms: elapsed.as_millis() as u64,
            error: Some(error.into()),
        }
    }
}

/// A verified replacement selector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealedSelector {
    pub selector: String,
    pub strategy: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
}

#[derive(Default)]
struct HealerState {
    cache: HashMap<String, HealedSelector>,
    stats: HealingStats,
}

/// The healing chain for one session.
///
/// Strategies are built once and kept sorted by descending priority. A
/// candidate is accepted only after it resolves to at least one element.
pub struct SelectorHealer {
    strategies: Vec<Box<dyn HealingStrategy>>,
    enabled: bool,
    cache_enabled: bool,
    state: Mutex<HealerState>,
}

impl SelectorHealer {
    pub fn new(config: &HealingConfig) -> Self {
        Self::with_strategies(config, default_strategies(config.data_test_form))
    }

    pub fn with_strategies(
        config: &HealingConfig,
        mut strategies: Vec<Box<dyn HealingStrategy>>,
    ) -> Self {
        strategies.sort_by_key(|s| Reverse(s.priority()));
        Self {
            strategies,
            enabled: config.enabled,
            cache_enabled: config.cache,
            state: Mutex::new(HealerState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn stats(&self) -> HealingStats {
        self.lock().stats
    }

    pub fn clear_cache(&self) {
        self.lock().cache.clear();
    }

    /// Find a replacement for `original`, or `None` when every strategy comes
    /// up empty (or healing is disabled).
    pub async fn heal(&self, page: &dyn PageContext, original: &str) -> Option<HealedSelector> {
        if !self.enabled {
            return None;
        }
        self.lock().stats.attempts += 1;

        if let Some(cached) = self.cached(original) {
            if resolves(page, &cached.selector).await {
                let mut state = self.lock();
                state.stats.cache_hits += 1;
                state.stats.successes += 1;
                debug!(selector = %original, healed = %cached.selector, "healing cache hit");
                return Some(cached);
            }
            debug!(selector = %original, stale = %cached.selector, "evicting stale healed selector");
            self.lock().cache.remove(original);
        }

        let started = Instant::now();
        for strategy in &self.strategies {
            let candidate = match strategy.heal(page, original).await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => continue,
                Err(e) => {
                    debug!(strategy = strategy.name(), selector = %original, error = %e, "strategy failed, skipping");
                    continue;
                }
            };
            if !resolves(page, &candidate).await {
                debug!(strategy = strategy.name(), candidate = %candidate, "candidate did not verify");
                continue;
            }

            let healed = HealedSelector {
                confidence: confidence::selector_confidence(&candidate),
                selector: candidate,
                strategy: strategy.name().to_string(),
            };
            info!(
                selector = %original,
                healed = %healed.selector,
                strategy = %healed.strategy,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "selector healed"
            );
            let mut state = self.lock();
            state.stats.successes += 1;
            if self.cache_enabled {
                state.cache.insert(original.to_string(), healed.clone());
            }
            return Some(healed);
        }

        self.lock().stats.failures += 1;
        warn!(selector = %original, strategies = self.strategies.len(), "all healing strategies exhausted");
        None
    }

    fn cached(&self, original: &str) -> Option<HealedSelector> {
        if !self.cache_enabled {
            return None;
        }
        self.lock().cache.get(original).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HealerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn resolves(page: &dyn PageContext, selector: &str) -> bool {
    matches!(page.count(selector).await, Ok(n) if n > 0)
}
