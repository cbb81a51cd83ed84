//! The claim engine. Public API for scheduling, claiming and renewing work.
//!
//! The scheduler holds no item state and takes no locks. Every operation is
//! one round trip to the store, and the store's atomic find-and-update is
//! what keeps two workers from owning the same item:
//!
//! - `peek` claims one eligible item (pending and due, or leased with an
//!   expired heartbeat), setting `PROCESSING` and a fresh heartbeat.
//! - `heartbeat` renews a lease only if the stored heartbeat still equals
//!   the one the caller last saw. `Ok(None)` means another worker took the
//!   item over and the caller must stop.
//! - `poll` is `peek` followed by a delete of the claimed item.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::mapper;
use crate::model::{ItemId, NewWorkItem, Status, WorkItem};
use crate::query::{self, Update};
use crate::store::ItemStore;
use crate::telemetry::item::{record_item, start_operation_span};
use crate::telemetry::metrics;

/// How long a claimed item stays leased without a heartbeat.
pub const DEFAULT_HEARTBEAT_EXPIRATION: Duration = Duration::from_secs(5 * 60);

/// What a scheduler needs to know at construction.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Collection (queue) the scheduler operates on.
    pub collection: String,
    /// Lease length. A processing item whose heartbeat is older than this
    /// is presumed abandoned and may be claimed again.
    pub heartbeat_expiration: Duration,
}

impl SchedulerConfig {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            heartbeat_expiration: DEFAULT_HEARTBEAT_EXPIRATION,
        }
    }

    pub fn heartbeat_expiration(mut self, expiration: Duration) -> Self {
        self.heartbeat_expiration = expiration;
        self
    }
}

/// Lease-based work scheduler over an [`ItemStore`].
pub struct Scheduler<S> {
    store: S,
    clock: Arc<dyn Clock>,
    collection: String,
    expiration: chrono::Duration,
    span: Span,
}

impl<S: ItemStore> Scheduler<S> {
    /// Create a scheduler on the system clock.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an empty collection name or a zero or
    /// out-of-range expiration.
    pub fn new(store: S, config: SchedulerConfig) -> Result<Self> {
        if config.collection.is_empty() {
            return Err(Error::Config("collection name must not be empty".to_string()));
        }
        if config.heartbeat_expiration.is_zero() {
            return Err(Error::Config(
                "heartbeat expiration must be positive".to_string(),
            ));
        }
        let expiration = chrono::Duration::from_std(config.heartbeat_expiration)
            .map_err(|e| Error::Config(format!("heartbeat expiration out of range: {e}")))?;

        let span = tracing::info_span!("okra.scheduler", "okra.collection" = %config.collection);
        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
            collection: config.collection,
            expiration,
            span,
        })
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Parent span for every operation's span. Diagnostics from this
    /// scheduler nest under it.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn heartbeat_expiration(&self) -> chrono::Duration {
        self.expiration
    }

    /// Claim one eligible item.
    ///
    /// Returns `Ok(None)` when nothing is eligible. Store failures are
    /// returned as-is and never retried here. Which item wins when several
    /// are eligible is up to the store; there is no FIFO promise.
    pub async fn peek(&self) -> Result<Option<WorkItem>> {
        let span = start_operation_span(&self.span, "peek", &self.collection);
        async {
            let now = self.clock.now();
            let filter = query::claim_filter(self.expiration, now);
            let update = query::claim_update(now);

            let started = Instant::now();
            let found = self
                .store
                .find_one_and_update(&self.collection, &filter, &update)
                .await;
            self.observe("find_one_and_update", started);

            let doc = match found {
                Ok(Some(doc)) => doc,
                Ok(None) => {
                    self.count_claim("empty");
                    debug!("no eligible item");
                    return Ok(None);
                }
                Err(e) => {
                    self.count_claim("error");
                    warn!(error = %e, "claim failed");
                    return Err(e);
                }
            };

            let item = mapper::from_document(doc)?;
            record_item(&Span::current(), item.id);
            self.count_claim("claimed");
            debug!(run_date = %item.run_date, "item claimed");
            Ok(Some(item))
        }
        .instrument(span)
        .await
    }

    /// Claim one eligible item and acknowledge it by deleting it.
    ///
    /// The item is returned whether or not the delete lands. If it does not
    /// (store failure, or the process dies first), the item stays
    /// `PROCESSING` and is claimable again once its lease expires: delivery
    /// is at-least-once.
    pub async fn poll(&self) -> Result<Option<WorkItem>> {
        let Some(item) = self.peek().await? else {
            return Ok(None);
        };

        match self.delete_by_id(item.id).await {
            Ok(0) => warn!(item_id = %item.id, "claimed item was gone before acknowledgement"),
            Ok(_) => {}
            Err(e) => warn!(
                item_id = %item.id,
                error = %e,
                "acknowledgement failed, item stays leased until its heartbeat expires"
            ),
        }
        Ok(Some(item))
    }

    /// Renew the lease on `item`, which must be the item as last returned
    /// by `peek` or `heartbeat`.
    ///
    /// `Ok(None)` means the stored heartbeat no longer matches: the lease
    /// expired and someone else claimed the item, or it was deleted. Stop
    /// processing it.
    ///
    /// # Errors
    ///
    /// `Error::InvalidItem` if `item` is not `PROCESSING` or was never
    /// claimed; such an item holds no lease.
    pub async fn heartbeat(&self, item: &WorkItem) -> Result<Option<WorkItem>> {
        if item.status != Status::Processing {
            return Err(Error::InvalidItem(format!(
                "item {} is {}, only PROCESSING items hold a lease",
                item.id, item.status
            )));
        }
        if item.heartbeat.is_none() {
            return Err(Error::InvalidItem(format!(
                "item {} has no heartbeat to renew",
                item.id
            )));
        }

        let span = start_operation_span(&self.span, "heartbeat", &self.collection);
        record_item(&span, item.id);
        async {
            let filter = query::heartbeat_filter(item);
            let update = Update {
                status: None,
                heartbeat: Some(self.clock.now()),
            };

            let started = Instant::now();
            let found = self
                .store
                .find_one_and_update(&self.collection, &filter, &update)
                .await;
            self.observe("find_one_and_update", started);

            match found {
                Ok(Some(doc)) => {
                    self.count_heartbeat("renewed");
                    mapper::from_document(doc).map(Some)
                }
                Ok(None) => {
                    self.count_heartbeat("lost");
                    info!("lease lost");
                    Ok(None)
                }
                Err(e) => {
                    self.count_heartbeat("error");
                    warn!(error = %e, "heartbeat failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Enqueue a new item as `PENDING`. Returns the id the store assigned.
    pub async fn schedule(&self, item: NewWorkItem) -> Result<ItemId> {
        let span = start_operation_span(&self.span, "schedule", &self.collection);
        async {
            let started = Instant::now();
            let inserted = self
                .store
                .insert(&self.collection, mapper::new_document(&item))
                .await;
            self.observe("insert", started);

            let labels = [
                KeyValue::new("collection", self.collection.clone()),
                KeyValue::new("result", if inserted.is_ok() { "ok" } else { "error" }),
            ];
            metrics::items_scheduled().add(1, &labels);

            inserted.inspect(|id| {
                record_item(&Span::current(), *id);
                debug!(run_date = %item.run_date, "item scheduled");
            })
        }
        .instrument(span)
        .await
    }

    /// Delete `item`. Returns how many documents were removed; 0 for an
    /// item that no longer exists.
    pub async fn delete(&self, item: &WorkItem) -> Result<u64> {
        self.delete_by_id(item.id).await
    }

    pub async fn delete_by_id(&self, id: ItemId) -> Result<u64> {
        let span = start_operation_span(&self.span, "delete", &self.collection);
        record_item(&span, id);
        async {
            let started = Instant::now();
            let deleted = self
                .store
                .delete_one(&self.collection, &query::id_filter(id))
                .await;
            self.observe("delete_one", started);

            let result = match deleted {
                Ok(0) => "missing",
                Ok(_) => "deleted",
                Err(_) => "error",
            };
            metrics::deletes().add(
                1,
                &[
                    KeyValue::new("collection", self.collection.clone()),
                    KeyValue::new("result", result),
                ],
            );
            deleted
        }
        .instrument(span)
        .await
    }

    /// Return a claimed item to the schedulable pool.
    ///
    /// Not implemented: there is no agreed retry or backoff policy to apply.
    /// Always fails with `Error::NotImplemented`. A failed item becomes
    /// claimable again when its lease expires.
    pub async fn reschedule(&self, item: &WorkItem) -> Result<Option<WorkItem>> {
        warn!(item_id = %item.id, "reschedule requested but not implemented");
        Err(Error::NotImplemented("reschedule"))
    }

    /// Number of items currently in `status`.
    pub async fn count_by_status(&self, status: Status) -> Result<u64> {
        let started = Instant::now();
        let count = self
            .store
            .count(&self.collection, &query::status_filter(status))
            .await;
        self.observe("count", started);
        count
    }

    /// Number of items whose run date has passed, whatever their status.
    pub async fn count_delayed(&self) -> Result<u64> {
        let started = Instant::now();
        let count = self
            .store
            .count(&self.collection, &query::delayed_filter(self.clock.now()))
            .await;
        self.observe("count", started);
        count
    }

    fn observe(&self, operation: &'static str, started: Instant) {
        metrics::store_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", operation)],
        );
    }

    fn count_claim(&self, result: &'static str) {
        metrics::claims().add(
            1,
            &[
                KeyValue::new("collection", self.collection.clone()),
                KeyValue::new("result", result),
            ],
        );
    }

    fn count_heartbeat(&self, result: &'static str) {
        metrics::heartbeats().add(
            1,
            &[
                KeyValue::new("collection", self.collection.clone()),
                KeyValue::new("result", result),
            ],
        );
    }
}
