//! ReaperLoop - return rows stuck in `processing` to `pending`.
//!
//! Rows are left in `processing` when a drain dies mid-delivery or is
//! stopped while handlers are running; the claim query never looks at them
//! again. The sweep is opt-in (`DrainConfig::reap`) and does not count an
//! attempt for the requeued rows.

use std::sync::Arc;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::config::ReapConfig;
use crate::ports::OutboxStore;

pub struct ReaperLoop {
    store: Arc<dyn OutboxStore>,
    config: ReapConfig,
}

impl ReaperLoop {
    pub fn new(store: Arc<dyn OutboxStore>, config: ReapConfig) -> Self {
        Self { store, config }
    }

    /// Sweep every `interval` (first sweep immediately) until cancelled.
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One sweep. Returns how many rows were requeued; failures are logged.
    pub async fn sweep(&self) -> usize {
        match self.store.requeue_stale(self.config.stale_after).await {
            Ok(ids) => {
                if !ids.is_empty() {
                    info!(
                        count = ids.len(),
                        ids = ?ids,
                        stale_after_s = self.config.stale_after.as_secs_f64(),
                        "requeued stale processing rows"
                    );
                }
                ids.len()
            }
            Err(e) => {
                warn!(error = %e, "stale processing sweep failed");
                0
            }
        }
    }
}
