//! OutboxDrain - the poll loop and its lifecycle.
//!
//! # Flow
//! 1. claim up to `batch_size` due rows
//! 2. nothing claimed: sleep `poll_sleep`
//! 3. otherwise spawn one delivery task per row and wait for the whole batch
//! 4. repeat until stopped
//!
//! A slow row holds back the next claim, never its batch-mates. Completion
//! order inside a batch is not claim order.

use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::config::DrainConfig;
use crate::app::dispatch::{Dispatcher, RowOutcome};
use crate::app::reaper::ReaperLoop;
use crate::app::router::Router;
use crate::error::{DrainError, DrainResult};
use crate::ports::OutboxStore;

/// Tally of one claim/dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub orphaned: usize,
    pub superseded: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Delivered => self.delivered += 1,
            RowOutcome::Retried { .. } => self.retried += 1,
            RowOutcome::DeadLettered => self.dead_lettered += 1,
            RowOutcome::Orphaned => self.orphaned += 1,
            RowOutcome::Superseded => self.superseded += 1,
        }
    }
}

pub struct OutboxDrain {
    store: Arc<dyn OutboxStore>,
    dispatcher: Dispatcher,
    config: DrainConfig,
}

impl OutboxDrain {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        router: Arc<Router>,
        config: DrainConfig,
    ) -> DrainResult<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            router,
            config.retry_policy(),
            config.max_concurrency,
        );
        Ok(Self {
            store,
            dispatcher,
            config,
        })
    }

    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    /// One poll cycle: claim a batch, deliver every row concurrently, wait
    /// for all of them.
    ///
    /// Dropping the returned future aborts the in-flight deliveries; their
    /// rows stay `processing`.
    pub async fn run_cycle(&self) -> DrainResult<CycleReport> {
        let rows = self
            .store
            .claim_batch(self.config.batch_size)
            .await
            .map_err(DrainError::Claim)?;

        let mut report = CycleReport {
            claimed: rows.len(),
            ..CycleReport::default()
        };
        if rows.is_empty() {
            return Ok(report);
        }
        debug!(claimed = rows.len(), "claimed outbox batch");

        let mut tasks = JoinSet::new();
        for row in rows {
            let dispatcher = self.dispatcher.clone();
            tasks.spawn(async move { dispatcher.dispatch(row).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(outcome),
                Ok(Err(fatal)) => return Err(fatal),
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    return Err(DrainError::LoopFatal(format!("delivery task failed: {e}")));
                }
            }
        }
        Ok(report)
    }

    /// Launch the loop (and the reaper, if configured) on the current tokio
    /// runtime. Consuming `self` makes a second start impossible.
    pub fn start(self) -> DrainHandle {
        info!(
            batch = self.config.batch_size,
            conc = self.config.max_concurrency,
            "outbox drain starting"
        );

        let token = CancellationToken::new();
        let reaper = self.config.reap.map(|reap| {
            let reaper = ReaperLoop::new(Arc::clone(&self.store), reap);
            tokio::spawn(reaper.run(token.child_token()))
        });
        let task = tokio::spawn(self.run(token.clone()));

        DrainHandle {
            token,
            task: Some(task),
            reaper,
        }
    }

    async fn run(self, token: CancellationToken) -> DrainResult<()> {
        loop {
            let cycle = tokio::select! {
                _ = token.cancelled() => break,
                cycle = self.run_cycle() => cycle,
            };

            match cycle {
                Ok(report) if report.is_idle() => {}
                Ok(report) => {
                    debug!(
                        claimed = report.claimed,
                        delivered = report.delivered,
                        retried = report.retried,
                        dead = report.dead_lettered,
                        orphaned = report.orphaned,
                        superseded = report.superseded,
                        "outbox batch finished"
                    );
                    continue;
                }
                Err(DrainError::Claim(e)) => {
                    warn!(error = %e, "outbox claim failed, retrying after poll sleep");
                }
                Err(e) => {
                    error!(error = %e, "drain loop crashed");
                    return Err(e);
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_sleep) => {}
            }
        }

        info!("outbox drain loop cancelled");
        Ok(())
    }
}

/// Owner of a running drain.
///
/// Dropping the handle cancels the loop; call [`DrainHandle::stop`] to also
/// wait for it.
pub struct DrainHandle {
    token: CancellationToken,
    task: Option<JoinHandle<DrainResult<()>>>,
    reaper: Option<JoinHandle<()>>,
}

impl DrainHandle {
    /// Signal the loop to stop without waiting.
    pub fn request_shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Resolve when the loop exits on its own. A fatal loop error surfaces
    /// here so the host can restart. Cancel-safe.
    pub async fn finished(&mut self) -> DrainResult<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        flatten(joined)
    }

    /// Best-effort shutdown: cancel the loop and the in-flight deliveries,
    /// then wait for the task. Cancellation itself is not an error.
    ///
    /// Rows whose delivery was cut short stay `processing`.
    pub async fn stop(mut self) -> DrainResult<()> {
        self.token.cancel();

        if let Some(reaper) = self.reaper.take()
            && let Err(e) = reaper.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "reaper task failed");
        }

        let result = match self.task.take() {
            Some(task) => flatten(task.await),
            None => Ok(()),
        };
        info!("outbox drain stopped");
        result
    }
}

impl Drop for DrainHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Errors returned by the loop were logged there; a panic was not.
fn flatten(joined: Result<DrainResult<()>, JoinError>) -> DrainResult<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => {
            let fatal = DrainError::LoopFatal(format!("drain task panicked: {e}"));
            error!(error = %fatal, "drain loop crashed");
            Err(fatal)
        }
    }
}
