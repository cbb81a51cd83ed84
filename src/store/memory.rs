//! In-process item store.
//!
//! One mutex guards every collection, which makes each primitive atomic the
//! same way a document database makes a single find-and-modify atomic.
//! Handles are cheap to clone and share the same data.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::model::ItemId;
use crate::query::{Filter, Update};

use super::{Document, ItemStore};

#[derive(Debug, Default)]
struct Inner {
    collections: HashMap<String, Vec<Document>>,
    offline: bool,
    fail_deletes: bool,
}

/// Item store held in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails with `Error::Unavailable`.
    pub fn set_offline(&self, offline: bool) -> Result<()> {
        self.lock()?.offline = offline;
        Ok(())
    }

    /// Make only deletes fail, leaving claims working.
    pub fn fail_deletes(&self, fail: bool) -> Result<()> {
        self.lock()?.fail_deletes = fail;
        Ok(())
    }

    /// Look a document up by id without touching it.
    pub fn get(&self, collection: &str, id: ItemId) -> Result<Option<Document>> {
        let inner = self.lock()?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == Some(id)))
            .cloned())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }

    fn online(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock()?;
        if inner.offline {
            return Err(Error::Unavailable("memory store is offline".to_string()));
        }
        Ok(inner)
    }
}

impl ItemStore for MemoryStore {
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<Option<Document>> {
        let mut inner = self.online()?;
        let Some(docs) = inner.collections.get_mut(collection) else {
            return Ok(None);
        };
        Ok(docs.iter_mut().find(|d| filter.matches(d)).map(|doc| {
            update.apply(doc);
            doc.clone()
        }))
    }

    async fn insert(&self, collection: &str, mut document: Document) -> Result<ItemId> {
        let mut inner = self.online()?;
        let id = ItemId::new();
        document.id = Some(id);
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
        Ok(id)
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut inner = self.online()?;
        if inner.fail_deletes {
            return Err(Error::Unavailable("delete rejected".to_string()));
        }
        let Some(docs) = inner.collections.get_mut(collection) else {
            return Ok(0);
        };
        match docs.iter().position(|d| filter.matches(d)) {
            Some(index) => {
                docs.remove(index);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let inner = self.online()?;
        Ok(inner
            .collections
            .get(collection)
            .map_or(0, |docs| docs.iter().filter(|d| filter.matches(d)).count() as u64))
    }
}
