//! Item store adapters.
//!
//! The scheduler needs four primitives from its backing store, and all
//! mutual exclusion rests on the first one: `find_one_and_update` must find
//! a single matching document and update it atomically, so two concurrent
//! callers can never both see the same document match.

pub mod memory;

pub use memory::MemoryStore;

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::ItemId;
use crate::query::{Filter, Update};

/// Stored form of a work item.
///
/// `status` stays text here: the store does not promise it holds a known
/// value, and the mapper is where that gets checked.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// `None` until the store assigns one on insert.
    pub id: Option<ItemId>,
    pub status: String,
    pub run_date: DateTime<Utc>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

/// Storage primitives consumed by the scheduler.
///
/// Every method is a single round trip. "Nothing matched" is reported as
/// `Ok(None)` or `Ok(0)`; `Err` is reserved for communication failures.
/// Among several matching documents the store may pick any one.
pub trait ItemStore: Send + Sync {
    /// Atomically find one document in `collection` matching `filter`,
    /// apply `update`, and return the updated document.
    fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> impl Future<Output = Result<Option<Document>>> + Send;

    /// Insert a document and return the id the store assigned it.
    fn insert(
        &self,
        collection: &str,
        document: Document,
    ) -> impl Future<Output = Result<ItemId>> + Send;

    /// Delete at most one matching document. Returns the number deleted.
    fn delete_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Count matching documents.
    fn count(&self, collection: &str, filter: &Filter) -> impl Future<Output = Result<u64>> + Send;
}
