//! Background dispatch for best-effort collector calls.
//!
//! Callers enqueue and move on. A single task drains the queue in FIFO order,
//! so a shard's `running` update is always sent before its terminal one.
//! Delivery results are logged and counted, never returned to the caller.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Collector, HealingEvent};
use crate::shard::ShardStatus;

enum Dispatch {
    ShardStatus(ShardStatus),
    HealingEvent(Box<HealingEvent>),
    Drain(oneshot::Sender<DispatchStats>),
}

/// Delivery counters, reported when the dispatcher drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
}

/// Cheap, cloneable enqueue side of the dispatcher.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl DispatchHandle {
    pub fn shard_status(&self, status: ShardStatus) {
        self.enqueue(Dispatch::ShardStatus(status));
    }

    pub fn healing_event(&self, event: HealingEvent) {
        self.enqueue(Dispatch::HealingEvent(Box::new(event)));
    }

    fn enqueue(&self, item: Dispatch) {
        if self.tx.send(item).is_err() {
            debug!("collector dispatcher already drained, dropping update");
        }
    }
}

pub struct Dispatcher {
    handle: DispatchHandle,
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub fn spawn(collector: Arc<dyn Collector>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(collector, rx));
        Self {
            handle: DispatchHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Deliver everything queued so far, then stop the background task.
    pub async fn drain(self) -> DispatchStats {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.handle.tx.send(Dispatch::Drain(reply_tx)).is_err() {
            return DispatchStats::default();
        }
        let stats = reply_rx.await.unwrap_or_default();
        if let Err(e) = self.task.await {
            warn!(error = %e, "collector dispatcher task ended abnormally");
        }
        stats
    }
}

async fn run(collector: Arc<dyn Collector>, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    let mut stats = DispatchStats::default();
    while let Some(item) = rx.recv().await {
        let result = match item {
            Dispatch::ShardStatus(status) => collector
                .update_shard_status(&status)
                .await
                .map_err(|e| (format!("shard {} {}", status.shard_index, status.status), e)),
            Dispatch::HealingEvent(event) => collector
                .record_healing_event(&event)
                .await
                .map_err(|e| ("healing event".to_string(), e)),
            Dispatch::Drain(reply) => {
                rx.close();
                let _ = reply.send(stats);
                return;
            }
        };
        match result {
            Ok(()) => stats.delivered += 1,
            Err((what, e)) => {
                stats.failed += 1;
                warn!(update = %what, error = %e, "collector update dropped");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::collector::CollectorError;

    /// Records every call; optionally fails all of them.
    #[derive(Default)]
    pub struct RecordingCollector {
        pub statuses: Mutex<Vec<ShardStatus>>,
        pub events: Mutex<Vec<HealingEvent>>,
        pub fail: bool,
    }

    impl RecordingCollector {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn outcome(&self) -> Result<(), CollectorError> {
            if self.fail {
                Err(CollectorError::Status {
                    endpoint: "test".to_string(),
                    status: 503,
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Collector for RecordingCollector {
        async fn update_shard_status(&self, status: &ShardStatus) -> Result<(), CollectorError> {
            self.statuses.lock().unwrap().push(status.clone());
            self.outcome()
        }

        async fn record_healing_event(&self, event: &HealingEvent) -> Result<(), CollectorError> {
            self.events.lock().unwrap().push(event.clone());
            self.outcome()
        }
    }
}
