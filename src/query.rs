//! Lease query builder.
//!
//! Builds the predicates the scheduler hands to the store. The claim filter
//! is the single predicate that decides which items are visible to
//! claimants; the store evaluates it atomically with the claiming update.

use chrono::{DateTime, Utc};

use crate::model::{ItemId, Status, WorkItem};
use crate::store::Document;

/// A predicate over stored documents.
///
/// Adapters either evaluate it in process ([`Filter::matches`]) or
/// translate it to their own query language.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    IdEq(ItemId),
    StatusEq(Status),
    /// `run_date < t`
    RunDateBefore(DateTime<Utc>),
    /// `run_date <= t`
    RunDateAtOrBefore(DateTime<Utc>),
    /// `heartbeat < t`. A missing heartbeat never matches.
    HeartbeatBefore(DateTime<Utc>),
    /// `heartbeat = t`, or `heartbeat IS NULL` for `None`.
    HeartbeatEq(Option<DateTime<Utc>>),
    /// All must match. Empty matches everything.
    And(Vec<Filter>),
    /// Any must match. Empty matches nothing.
    Or(Vec<Filter>),
}

impl Filter {
    /// Evaluate against a stored document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::IdEq(id) => doc.id == Some(*id),
            Filter::StatusEq(status) => doc.status == status.as_str(),
            Filter::RunDateBefore(t) => doc.run_date < *t,
            Filter::RunDateAtOrBefore(t) => doc.run_date <= *t,
            Filter::HeartbeatBefore(t) => doc.heartbeat.is_some_and(|hb| hb < *t),
            Filter::HeartbeatEq(expected) => doc.heartbeat == *expected,
            Filter::And(all) => all.iter().all(|f| f.matches(doc)),
            Filter::Or(any) => any.iter().any(|f| f.matches(doc)),
        }
    }

    /// The id this filter pins, if every match must carry it.
    pub fn pinned_id(&self) -> Option<ItemId> {
        match self {
            Filter::IdEq(id) => Some(*id),
            Filter::And(all) => all.iter().find_map(Filter::pinned_id),
            _ => None,
        }
    }
}

/// Fields set by a conditional update. `None` leaves the field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub status: Option<Status>,
    pub heartbeat: Option<DateTime<Utc>>,
}

impl Update {
    /// Apply to a document in place.
    pub fn apply(&self, doc: &mut Document) {
        if let Some(status) = self.status {
            doc.status = status.as_str().to_string();
        }
        if let Some(heartbeat) = self.heartbeat {
            doc.heartbeat = Some(heartbeat);
        }
    }
}

/// Items a worker may claim right now: pending and due, or processing with
/// a heartbeat older than `expiration`.
pub fn claim_filter(expiration: chrono::Duration, now: DateTime<Utc>) -> Filter {
    Filter::Or(vec![
        Filter::And(vec![
            Filter::StatusEq(Status::Pending),
            Filter::RunDateAtOrBefore(now),
        ]),
        Filter::And(vec![
            Filter::StatusEq(Status::Processing),
            Filter::HeartbeatBefore(now - expiration),
        ]),
    ])
}

/// The update applied to a claimed item.
pub fn claim_update(now: DateTime<Utc>) -> Update {
    Update {
        status: Some(Status::Processing),
        heartbeat: Some(now),
    }
}

/// Items whose run date has passed, whatever their status.
pub fn delayed_filter(now: DateTime<Utc>) -> Filter {
    Filter::RunDateBefore(now)
}

/// Matches `item` only while the caller's lease on it is still current.
pub fn heartbeat_filter(item: &WorkItem) -> Filter {
    Filter::And(vec![
        Filter::IdEq(item.id),
        Filter::StatusEq(Status::Processing),
        Filter::HeartbeatEq(item.heartbeat),
    ])
}

pub fn status_filter(status: Status) -> Filter {
    Filter::StatusEq(status)
}

pub fn id_filter(id: ItemId) -> Filter {
    Filter::IdEq(id)
}
