//! Core data model.
//!
//! A work item is something scheduled to run at or after its `run_date`.
//! It is either waiting (`Pending`) or leased to one worker (`Processing`);
//! the lease lives as long as the worker keeps its `heartbeat` fresh.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of schedulable work, as last observed in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Assigned by the store on insert.
    pub id: ItemId,

    /// Current lifecycle state.
    pub status: Status,

    /// The item becomes eligible for claim once this has passed.
    pub run_date: DateTime<Utc>,

    /// Last claim or renewal time. `None` until first claimed.
    ///
    /// Heartbeat renewal compares this value against the stored one, so
    /// always renew with the item returned by the previous peek/heartbeat.
    pub heartbeat: Option<DateTime<Utc>>,

    /// Producer data. The scheduler never interprets it.
    pub payload: serde_json::Value,
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
///
/// There is no terminal state: a finished item is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Waiting for its run date, or due and unclaimed.
    Pending,
    /// Leased to a worker. Claimable again once the lease expires.
    Processing,
}

impl Status {
    /// Stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Processing => "PROCESSING",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Status::Pending),
            "PROCESSING" => Ok(Status::Processing),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new work items. What producers hand to `Scheduler::schedule`.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub(crate) run_date: DateTime<Utc>,
    pub(crate) payload: serde_json::Value,
}

impl NewWorkItem {
    /// An item that becomes eligible at `run_date`.
    pub fn at(run_date: DateTime<Utc>) -> Self {
        Self {
            run_date,
            payload: serde_json::Value::Null,
        }
    }

    /// An item that becomes eligible `delay_secs` after `now`. Negative
    /// delays are allowed and make the item due at once.
    ///
    /// # Errors
    ///
    /// `Error::InvalidItem` when the resulting run date is not representable.
    pub fn delayed(now: DateTime<Utc>, delay_secs: i64) -> Result<Self> {
        TimeDelta::try_seconds(delay_secs)
            .and_then(|delay| now.checked_add_signed(delay))
            .map(Self::at)
            .ok_or_else(|| Error::InvalidItem(format!("delay of {delay_secs}s is out of range")))
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn run_date(&self) -> DateTime<Utc> {
        self.run_date
    }
}
