//! Integration tests for the claim protocol, run against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use okra_rs::clock::{Clock, ManualClock};
use okra_rs::error::Error;
use okra_rs::model::{ItemId, NewWorkItem, Status, WorkItem};
use okra_rs::scheduler::{Scheduler, SchedulerConfig};
use okra_rs::store::MemoryStore;
use serde_json::json;
use tracing::Subscriber;
use tracing::span::{Attributes, Id};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;

const LEASE_SECS: u64 = 300;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

fn scheduler(store: &MemoryStore, clock: &ManualClock) -> Scheduler<MemoryStore> {
    let config =
        SchedulerConfig::new("jobs").heartbeat_expiration(Duration::from_secs(LEASE_SECS));
    Scheduler::new(store.clone(), config)
        .unwrap()
        .with_clock(clock.clone())
}

fn setup() -> (MemoryStore, ManualClock, Scheduler<MemoryStore>) {
    let store = MemoryStore::new();
    let clock = ManualClock::new(start());
    let scheduler = scheduler(&store, &clock);
    (store, clock, scheduler)
}

async fn schedule_due(scheduler: &Scheduler<MemoryStore>, clock: &ManualClock) -> ItemId {
    scheduler
        .schedule(NewWorkItem::at(clock.now() - chrono::Duration::minutes(5)))
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Schedule / peek
// ---------------------------------------------------------------------------

#[tokio::test]
async fn due_item_is_claimed_with_fresh_lease() {
    let (_store, clock, scheduler) = setup();
    let run_date = clock.now() - chrono::Duration::minutes(5);
    let id = scheduler
        .schedule(NewWorkItem::at(run_date).payload(json!({"report": "daily"})))
        .await
        .unwrap();

    let item = scheduler.peek().await.unwrap().expect("should claim item");
    assert_eq!(item.id, id);
    assert_eq!(item.status, Status::Processing);
    assert_eq!(item.heartbeat, Some(clock.now()));
    assert_eq!(item.run_date, run_date);
    assert_eq!(item.payload, json!({"report": "daily"}));

    assert!(scheduler.peek().await.unwrap().is_none(), "item is leased");
}

#[tokio::test]
async fn future_item_is_claimable_only_once_due() {
    let (_store, clock, scheduler) = setup();
    let id = scheduler
        .schedule(NewWorkItem::at(clock.now() + chrono::Duration::minutes(1)))
        .await
        .unwrap();

    assert!(scheduler.peek().await.unwrap().is_none());

    clock.advance(chrono::Duration::seconds(59));
    assert!(scheduler.peek().await.unwrap().is_none());

    clock.advance(chrono::Duration::seconds(1));
    let item = scheduler.peek().await.unwrap().expect("due now");
    assert_eq!(item.id, id);
}

#[tokio::test]
async fn peek_on_empty_collection_is_not_an_error() {
    let (_store, _clock, scheduler) = setup();
    assert!(scheduler.peek().await.unwrap().is_none());
    assert!(scheduler.poll().await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Mutual exclusion
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_peeks_claim_single_item_once() {
    let (_store, clock, scheduler) = setup();
    let id = schedule_due(&scheduler, &clock).await;
    let scheduler = Arc::new(scheduler);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..32 {
        let scheduler = Arc::clone(&scheduler);
        tasks.spawn(async move { scheduler.peek().await.unwrap() });
    }

    let mut claimed = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Some(item) = result.unwrap() {
            claimed.push(item.id);
        }
    }
    assert_eq!(claimed, vec![id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimants_never_share_items() {
    let (_store, clock, scheduler) = setup();
    for _ in 0..10 {
        schedule_due(&scheduler, &clock).await;
    }
    let scheduler = Arc::new(scheduler);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..25 {
        let scheduler = Arc::clone(&scheduler);
        tasks.spawn(async move { scheduler.peek().await.unwrap() });
    }

    let mut claimed = std::collections::HashSet::new();
    let mut empty = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Some(item) => assert!(claimed.insert(item.id), "item {} claimed twice", item.id),
            None => empty += 1,
        }
    }
    assert_eq!(claimed.len(), 10);
    assert_eq!(empty, 15);
}

#[tokio::test]
async fn collections_do_not_see_each_other() {
    let (store, clock, jobs) = setup();
    let mail = Scheduler::new(store.clone(), SchedulerConfig::new("mail"))
        .unwrap()
        .with_clock(clock.clone());

    schedule_due(&jobs, &clock).await;
    assert!(mail.peek().await.unwrap().is_none());
    assert!(jobs.peek().await.unwrap().is_some());
}

// ---------------------------------------------------------------------------
// Lease expiry and heartbeat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abandoned_item_is_reclaimed_only_after_lease_expires() {
    let (_store, clock, scheduler) = setup();
    let id = schedule_due(&scheduler, &clock).await;
    let first = scheduler.peek().await.unwrap().unwrap();

    clock.advance(chrono::Duration::seconds(LEASE_SECS as i64));
    assert!(
        scheduler.peek().await.unwrap().is_none(),
        "lease still valid at exactly the expiration"
    );

    clock.advance(chrono::Duration::milliseconds(1));
    let second = scheduler.peek().await.unwrap().expect("lease expired");
    assert_eq!(second.id, id);
    assert!(second.heartbeat > first.heartbeat);
}

#[tokio::test]
async fn heartbeat_keeps_lease_alive() {
    let (store, clock, scheduler) = setup();
    schedule_due(&scheduler, &clock).await;
    let item = scheduler.peek().await.unwrap().unwrap();

    clock.advance(chrono::Duration::seconds(200));
    let renewed = scheduler
        .heartbeat(&item)
        .await
        .unwrap()
        .expect("lease is still ours");
    assert_eq!(renewed.heartbeat, Some(clock.now()));
    assert_eq!(renewed.status, Status::Processing);

    let stored = store.get("jobs", item.id).unwrap().expect("still stored");
    assert_eq!(stored.heartbeat, renewed.heartbeat);
    assert_eq!(stored.status, "PROCESSING");

    // Past the original lease, within the renewed one.
    clock.advance(chrono::Duration::seconds(200));
    assert!(scheduler.peek().await.unwrap().is_none());

    // Renewing again needs the latest heartbeat.
    assert!(scheduler.heartbeat(&renewed).await.unwrap().is_some());
}

#[tokio::test]
async fn stale_heartbeat_after_reclaim_reports_lease_lost() {
    let (store, clock, first_worker) = setup();
    let second_worker = scheduler(&store, &clock);
    schedule_due(&first_worker, &clock).await;

    let mine = first_worker.peek().await.unwrap().unwrap();
    clock.advance(chrono::Duration::seconds(LEASE_SECS as i64 + 1));
    let theirs = second_worker.peek().await.unwrap().expect("reclaimed");
    assert_eq!(theirs.id, mine.id);

    assert!(first_worker.heartbeat(&mine).await.unwrap().is_none());

    clock.advance(chrono::Duration::seconds(1));
    let renewed = second_worker.heartbeat(&theirs).await.unwrap();
    assert!(renewed.is_some(), "new owner keeps its lease");
}

#[tokio::test]
async fn heartbeat_on_deleted_item_reports_lease_lost() {
    let (_store, clock, scheduler) = setup();
    schedule_due(&scheduler, &clock).await;
    let item = scheduler.peek().await.unwrap().unwrap();

    assert_eq!(scheduler.delete(&item).await.unwrap(), 1);
    assert!(scheduler.heartbeat(&item).await.unwrap().is_none());
}

#[tokio::test]
async fn heartbeat_rejects_items_without_a_lease() {
    let (_store, clock, scheduler) = setup();
    let pending = WorkItem {
        id: ItemId::new(),
        status: Status::Pending,
        run_date: clock.now(),
        heartbeat: None,
        payload: serde_json::Value::Null,
    };
    let err = scheduler.heartbeat(&pending).await.unwrap_err();
    assert!(matches!(err, Error::InvalidItem(_)));

    let never_claimed = WorkItem {
        status: Status::Processing,
        ..pending
    };
    let err = scheduler.heartbeat(&never_claimed).await.unwrap_err();
    assert!(matches!(err, Error::InvalidItem(_)));
}

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poll_acknowledges_claimed_item() {
    let (_store, clock, scheduler) = setup();
    let id = schedule_due(&scheduler, &clock).await;

    let item = scheduler.poll().await.unwrap().expect("should poll item");
    assert_eq!(item.id, id);
    assert_eq!(item.status, Status::Processing);

    assert_eq!(scheduler.count_by_status(Status::Pending).await.unwrap(), 0);
    assert_eq!(scheduler.count_by_status(Status::Processing).await.unwrap(), 0);

    // Not even after the lease would have expired.
    clock.advance(chrono::Duration::hours(1));
    assert!(scheduler.poll().await.unwrap().is_none());
}

#[tokio::test]
async fn poll_returns_item_even_when_acknowledgement_fails() {
    let (store, clock, scheduler) = setup();
    let id = schedule_due(&scheduler, &clock).await;

    store.fail_deletes(true).unwrap();
    let item = scheduler.poll().await.unwrap().expect("claim succeeded");
    assert_eq!(item.id, id);
    store.fail_deletes(false).unwrap();

    // The unacknowledged item stays leased, then comes back.
    assert_eq!(scheduler.count_by_status(Status::Processing).await.unwrap(), 1);
    assert!(scheduler.peek().await.unwrap().is_none());
    clock.advance(chrono::Duration::seconds(LEASE_SECS as i64 + 1));
    assert_eq!(scheduler.peek().await.unwrap().map(|i| i.id), Some(id));
}

#[tokio::test]
async fn store_failure_propagates_without_retry() {
    let (store, clock, scheduler) = setup();
    schedule_due(&scheduler, &clock).await;

    store.set_offline(true).unwrap();
    assert!(scheduler.peek().await.unwrap_err().is_transport());
    assert!(scheduler.poll().await.unwrap_err().is_transport());
    assert!(scheduler.count_delayed().await.unwrap_err().is_transport());

    store.set_offline(false).unwrap();
    assert_eq!(scheduler.count_by_status(Status::Pending).await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Delete, counts, reschedule
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deleting_missing_item_returns_zero() {
    let (_store, clock, scheduler) = setup();
    assert_eq!(scheduler.delete_by_id(ItemId::new()).await.unwrap(), 0);

    let id = schedule_due(&scheduler, &clock).await;
    assert_eq!(scheduler.delete_by_id(id).await.unwrap(), 1);
    assert_eq!(scheduler.delete_by_id(id).await.unwrap(), 0);
}

#[tokio::test]
async fn delayed_count_covers_past_run_dates_in_any_status() {
    let (_store, clock, scheduler) = setup();
    schedule_due(&scheduler, &clock).await;
    scheduler
        .schedule(NewWorkItem::at(clock.now() + chrono::Duration::minutes(5)))
        .await
        .unwrap();

    assert_eq!(scheduler.count_delayed().await.unwrap(), 1);

    scheduler.peek().await.unwrap().expect("past item claimed");
    assert_eq!(scheduler.count_delayed().await.unwrap(), 1);
    assert_eq!(scheduler.count_by_status(Status::Pending).await.unwrap(), 1);
    assert_eq!(scheduler.count_by_status(Status::Processing).await.unwrap(), 1);
}

#[tokio::test]
async fn reschedule_fails_loudly() {
    let (_store, clock, scheduler) = setup();
    schedule_due(&scheduler, &clock).await;
    let item = scheduler.peek().await.unwrap().unwrap();

    let err = scheduler.reschedule(&item).await.unwrap_err();
    assert!(matches!(err, Error::NotImplemented("reschedule")));
    assert_eq!(scheduler.count_by_status(Status::Processing).await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Records every new span's name with its parent's name.
#[derive(Clone, Default)]
struct SpanTree(Arc<std::sync::Mutex<Vec<(&'static str, Option<&'static str>)>>>);

impl<S> Layer<S> for SpanTree
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, _attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let parent = span.parent().map(|p| p.name());
            self.0.lock().unwrap().push((span.name(), parent));
        }
    }
}

#[tokio::test]
async fn operation_spans_nest_under_the_supplied_span() {
    let spans = SpanTree::default();
    let _default =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(spans.clone()));

    let (_store, clock, scheduler) = setup();
    let scheduler = scheduler.with_span(tracing::info_span!("billing"));

    schedule_due(&scheduler, &clock).await;
    let item = scheduler.peek().await.unwrap().expect("due item");
    scheduler.heartbeat(&item).await.unwrap();
    scheduler.delete(&item).await.unwrap();

    let spans = spans.0.lock().unwrap();
    let operations: Vec<_> = spans
        .iter()
        .filter(|(name, _)| *name == "okra.operation")
        .collect();
    assert_eq!(operations.len(), 4);
    assert!(
        operations.iter().all(|(_, parent)| *parent == Some("billing")),
        "operation spans: {operations:?}"
    );
}

#[test]
fn invalid_configuration_is_rejected() {
    let store = MemoryStore::new();
    assert!(matches!(
        Scheduler::new(store.clone(), SchedulerConfig::new("")),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        Scheduler::new(
            store,
            SchedulerConfig::new("jobs").heartbeat_expiration(Duration::ZERO)
        ),
        Err(Error::Config(_))
    ));
}
