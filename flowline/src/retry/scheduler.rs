//! Periodic re-injection of due retry records.

use crate::core::FlowData;
use crate::errors::{FlowError, FlowResult};
use crate::persistence::RetryRepo;
use crate::pipeline::FlowEngine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Polls the retry store and hands due batches back to the engine.
pub struct RetryScheduler<T: FlowData> {
    engine: Arc<FlowEngine<T>>,
    retries: Arc<dyn RetryRepo>,
    interval: Duration,
    batch: usize,
}

impl<T: FlowData> RetryScheduler<T> {
    /// Creates a scheduler using the engine's retry store and configuration.
    #[must_use]
    pub fn new(engine: Arc<FlowEngine<T>>) -> Self {
        let services = engine.services();
        let retries = services.retries.clone();
        let interval = services.config.scheduler_interval();
        let batch = services.config.scheduler_batch;
        Self {
            engine,
            retries,
            interval,
            batch,
        }
    }

    /// Overrides the polling interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Re-injects every record due now, up to the batch limit.
    ///
    /// Failures of individual records are logged and skipped; the record
    /// stays in the store and is picked up again on a later tick.
    ///
    /// # Errors
    ///
    /// Returns an error only if the due records cannot be listed.
    pub async fn run_once(&self) -> FlowResult<usize> {
        let due = self.retries.due(Utc::now(), self.batch).await?;
        let mut reinjected = 0;
        for record in &due {
            match self.engine.retry(record).await {
                Ok(outcome) => {
                    debug!(
                        stream_id = %record.stream_id,
                        position = %record.position,
                        to_batch = %record.batch_id,
                        retry_count = record.retry_count,
                        ?outcome,
                        "Retry attempted"
                    );
                    reinjected += 1;
                }
                Err(e) => warn!(
                    stream_id = %record.stream_id,
                    position = %record.position,
                    to_batch = %record.batch_id,
                    error = %e,
                    "Retry failed"
                ),
            }
        }
        Ok(reinjected)
    }

    /// Runs [`RetryScheduler::run_once`] on every tick until shut down.
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);
            info!(interval_ms, "Retry scheduler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "Retry scan failed");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Retry scheduler stopped");
        });
        SchedulerHandle { shutdown, join }
    }
}

impl<T: FlowData> std::fmt::Debug for RetryScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("interval", &self.interval)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

/// Handle to a running scheduler task.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the scheduler and waits for its current tick to finish.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Internal`] if the scheduler task panicked.
    pub async fn shutdown(self) -> FlowResult<()> {
        let _ = self.shutdown.send(true);
        self.join
            .await
            .map_err(|e| FlowError::Internal(format!("retry scheduler task failed: {e}")))
    }
}
