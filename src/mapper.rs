//! Conversion between stored documents and work items.

use crate::error::{Error, Result};
use crate::model::{NewWorkItem, Status, WorkItem};
use crate::store::Document;

/// The document inserted for a freshly scheduled item.
pub fn new_document(item: &NewWorkItem) -> Document {
    Document {
        id: None,
        status: Status::Pending.as_str().to_string(),
        run_date: item.run_date,
        heartbeat: None,
        payload: item.payload.clone(),
    }
}

pub fn to_document(item: &WorkItem) -> Document {
    Document {
        id: Some(item.id),
        status: item.status.as_str().to_string(),
        run_date: item.run_date,
        heartbeat: item.heartbeat,
        payload: item.payload.clone(),
    }
}

/// Rebuild a work item from its stored form.
///
/// A document without an id or with an unknown status is malformed. That is
/// reported as an error rather than passed off as "no item".
pub fn from_document(doc: Document) -> Result<WorkItem> {
    let id = doc
        .id
        .ok_or_else(|| Error::Other("stored document has no id".to_string()))?;
    let status = doc.status.parse::<Status>().map_err(|reason| {
        tracing::error!(item_id = %id, %reason, "malformed stored item");
        Error::Mapping { id, reason }
    })?;

    Ok(WorkItem {
        id,
        status,
        run_date: doc.run_date,
        heartbeat: doc.heartbeat,
        payload: doc.payload,
    })
}
