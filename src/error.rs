//! Error types for okra-rs.
//!
//! "Nothing matched" is never an error: peek, heartbeat and delete report it
//! as `Ok(None)` / `Ok(0)`. Everything here is a real failure.

use thiserror::Error;

use crate::model::ItemId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// The store could not be reached or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored document could not be turned back into a work item.
    #[error("malformed stored item {id}: {reason}")]
    Mapping { id: ItemId, reason: String },

    /// The caller handed in an item the operation cannot act on.
    #[error("invalid item: {0}")]
    InvalidItem(String),

    #[error("operation not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this is a store communication failure, as opposed to a
    /// caller or data problem. Retry policy belongs to the caller.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
