//! Worker loop: claim items, run a handler, keep the lease alive, retire.
//!
//! While a handler runs, a heartbeat ticker renews the item's lease. If a
//! renewal comes back empty, another worker has taken the item over; the
//! handler future is dropped on the spot so its side effects stop.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span, error, info, warn};

use crate::error::{Error, Result};
use crate::model::WorkItem;
use crate::scheduler::Scheduler;
use crate::store::ItemStore;
use crate::telemetry::item::{record_outcome, start_process_span};
use crate::telemetry::metrics;

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to wait before claiming again after finding nothing.
    pub poll_interval: Duration,
    /// How often to renew the lease on an item being processed. Must be
    /// well under the scheduler's heartbeat expiration.
    pub heartbeat_interval: Duration,
    /// Maximum items processed at once.
    pub max_concurrent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(60),
            max_concurrent: 4,
        }
    }
}

/// How a worker finished with one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handler succeeded and the item was deleted.
    Completed,
    /// Handler failed. The item stays leased and is claimed again once its
    /// lease expires.
    Failed(String),
    /// Another worker took the item over; the handler was cancelled.
    LeaseLost,
}

impl ProcessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Completed => "completed",
            ProcessOutcome::Failed(_) => "failed",
            ProcessOutcome::LeaseLost => "lease_lost",
        }
    }
}

/// Claims and processes items from one scheduler until shut down.
pub struct Worker<S> {
    scheduler: Arc<Scheduler<S>>,
    config: WorkerConfig,
    stopping: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl<S> Clone for Worker<S> {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
            config: self.config.clone(),
            stopping: Arc::clone(&self.stopping),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<S: ItemStore + 'static> Worker<S> {
    /// # Errors
    ///
    /// `Error::Config` for a zero heartbeat interval or a zero concurrency
    /// limit.
    pub fn new(scheduler: Arc<Scheduler<S>>, config: WorkerConfig) -> Result<Self> {
        if config.heartbeat_interval.is_zero() {
            return Err(Error::Config(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if config.max_concurrent == 0 {
            return Err(Error::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }

        let expiration = scheduler.heartbeat_expiration();
        if chrono::Duration::from_std(config.heartbeat_interval).is_ok_and(|hb| hb >= expiration) {
            warn!(
                heartbeat_interval = ?config.heartbeat_interval,
                expiration = %expiration,
                "heartbeat interval is not shorter than the lease, items will be stolen mid-flight"
            );
        }
        Ok(Self {
            scheduler,
            config,
            stopping: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Ask `run` to stop claiming. Items already in flight are finished.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    /// Run the claim loop until [`shutdown`](Self::shutdown).
    pub async fn run<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(WorkItem) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut in_flight = JoinSet::new();
        info!(
            collection = self.scheduler.collection(),
            max_concurrent = self.config.max_concurrent,
            "worker started"
        );

        while !self.stopping.load(Ordering::SeqCst) {
            while let Some(joined) = in_flight.try_join_next() {
                log_joined(joined);
            }

            if in_flight.len() < self.config.max_concurrent {
                match self.scheduler.peek().await {
                    Ok(Some(item)) => {
                        let scheduler = Arc::clone(&self.scheduler);
                        let handler = handler.clone();
                        let interval = self.config.heartbeat_interval;
                        in_flight.spawn(async move {
                            process(&scheduler, item, handler, interval).await
                        });
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "claim failed"),
                }
            }

            tokio::select! {
                _ = self.shutdown.notified() => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => log_joined(joined),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(in_flight = in_flight.len(), "worker shutting down");
        while let Some(joined) = in_flight.join_next().await {
            log_joined(joined);
        }
        Ok(())
    }

    /// Claim and process a single item on the current task.
    ///
    /// `Ok(None)` when there was nothing to claim.
    pub async fn process_one<F, Fut>(&self, handler: F) -> Result<Option<ProcessOutcome>>
    where
        F: Fn(WorkItem) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let Some(item) = self.scheduler.peek().await? else {
            return Ok(None);
        };
        process(&self.scheduler, item, handler, self.config.heartbeat_interval)
            .await
            .map(Some)
    }
}

async fn process<S, F, Fut>(
    scheduler: &Scheduler<S>,
    item: WorkItem,
    handler: F,
    heartbeat_interval: Duration,
) -> Result<ProcessOutcome>
where
    S: ItemStore,
    F: Fn(WorkItem) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let id = item.id;
    let span = start_process_span(scheduler.collection(), id);

    async {
        let outcome = tokio::select! {
            result = handler(item.clone()) => match result {
                Ok(()) => ProcessOutcome::Completed,
                Err(e) => ProcessOutcome::Failed(format!("{e:#}")),
            },
            () = keep_alive(scheduler, item, heartbeat_interval) => ProcessOutcome::LeaseLost,
        };

        let retired = match &outcome {
            ProcessOutcome::Completed => match scheduler.delete_by_id(id).await {
                Ok(0) => {
                    warn!("item was gone before it could be retired");
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            },
            ProcessOutcome::Failed(error) => {
                warn!(%error, "handler failed, item will be retried after its lease expires");
                Ok(())
            }
            ProcessOutcome::LeaseLost => {
                warn!("lease lost, handler cancelled");
                Ok(())
            }
        };

        record_outcome(&Span::current(), outcome.as_str());
        metrics::worker_outcomes().add(
            1,
            &[
                KeyValue::new("collection", scheduler.collection().to_string()),
                KeyValue::new("outcome", outcome.as_str()),
            ],
        );
        retired.map(|()| outcome)
    }
    .instrument(span)
    .await
}

/// Renew the lease every `every` until it is lost. Only returns then.
async fn keep_alive<S: ItemStore>(scheduler: &Scheduler<S>, mut item: WorkItem, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the claim itself is fresh.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match scheduler.heartbeat(&item).await {
            Ok(Some(renewed)) => item = renewed,
            Ok(None) => return,
            Err(e) if e.is_transport() => {
                warn!(error = %e, "heartbeat failed, retrying on next tick");
            }
            Err(e) => {
                error!(error = %e, "heartbeat rejected, giving the item up");
                return;
            }
        }
    }
}

fn log_joined(joined: std::result::Result<Result<ProcessOutcome>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(error = %e, "processing failed"),
        Err(e) => error!(error = %e, "processing task panicked"),
    }
}
