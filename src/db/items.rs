//! `ItemStore` over the `okra_items` table.
//!
//! Filters are rendered to SQL with bound parameters. A claim (a filter not
//! pinned to one id) picks its row with `FOR UPDATE SKIP LOCKED`, so racing
//! claimants move on to other rows instead of queueing behind each other.
//! An id-pinned update is a plain conditional `UPDATE`, which Postgres
//! already applies atomically to the single row.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::Result;
use crate::model::ItemId;
use crate::query::{Filter, Update};
use crate::store::{Document, ItemStore};

const RETURNING: &str = " RETURNING id, status, run_date, heartbeat, payload";

impl ItemStore for super::Db {
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<Option<Document>> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE okra_items SET ");
        push_update(&mut qb, update);

        if filter.pinned_id().is_some() {
            qb.push(" WHERE ");
            push_scoped(&mut qb, collection, filter);
        } else {
            qb.push(" WHERE id = (SELECT id FROM okra_items WHERE ");
            push_scoped(&mut qb, collection, filter);
            qb.push(" LIMIT 1 FOR UPDATE SKIP LOCKED)");
        }
        qb.push(RETURNING);

        let row = qb
            .build_query_as::<DocumentRow>()
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Document::from))
    }

    async fn insert(&self, collection: &str, document: Document) -> Result<ItemId> {
        let row: (Uuid,) = sqlx::query_as(
            "INSERT INTO okra_items (collection, status, run_date, heartbeat, payload)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(collection)
        .bind(&document.status)
        .bind(document.run_date)
        .bind(document.heartbeat)
        .bind(&document.payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(ItemId(row.0))
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "DELETE FROM okra_items WHERE id = (SELECT id FROM okra_items WHERE ",
        );
        push_scoped(&mut qb, collection, filter);
        qb.push(" LIMIT 1)");

        let done = qb.build().execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM okra_items WHERE ");
        push_scoped(&mut qb, collection, filter);

        let n = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(n as u64)
    }
}

/// `collection = $n AND (<filter>)`
fn push_scoped(qb: &mut QueryBuilder<'_, Postgres>, collection: &str, filter: &Filter) {
    qb.push("collection = ")
        .push_bind(collection.to_string())
        .push(" AND (");
    push_filter(qb, filter);
    qb.push(")");
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::IdEq(id) => {
            qb.push("id = ").push_bind(id.0);
        }
        Filter::StatusEq(status) => {
            qb.push("status = ").push_bind(status.as_str());
        }
        Filter::RunDateBefore(t) => {
            qb.push("run_date < ").push_bind(*t);
        }
        Filter::RunDateAtOrBefore(t) => {
            qb.push("run_date <= ").push_bind(*t);
        }
        Filter::HeartbeatBefore(t) => {
            qb.push("heartbeat < ").push_bind(*t);
        }
        Filter::HeartbeatEq(Some(t)) => {
            qb.push("heartbeat = ").push_bind(*t);
        }
        Filter::HeartbeatEq(None) => {
            qb.push("heartbeat IS NULL");
        }
        Filter::And(all) => push_joined(qb, all, " AND ", "TRUE"),
        Filter::Or(any) => push_joined(qb, any, " OR ", "FALSE"),
    }
}

fn push_joined(
    qb: &mut QueryBuilder<'_, Postgres>,
    filters: &[Filter],
    separator: &str,
    empty: &str,
) {
    if filters.is_empty() {
        qb.push(empty);
        return;
    }
    for (i, filter) in filters.iter().enumerate() {
        qb.push(if i == 0 { "(" } else { separator });
        if i > 0 {
            qb.push("(");
        }
        push_filter(qb, filter);
        qb.push(")");
    }
}

fn push_update(qb: &mut QueryBuilder<'_, Postgres>, update: &Update) {
    let mut sets = qb.separated(", ");
    if let Some(status) = update.status {
        sets.push("status = ").push_bind_unseparated(status.as_str());
    }
    if let Some(heartbeat) = update.heartbeat {
        sets.push("heartbeat = ").push_bind_unseparated(heartbeat);
    }
    if update.status.is_none() && update.heartbeat.is_none() {
        sets.push("status = status");
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: Uuid,
    status: String,
    run_date: DateTime<Utc>,
    heartbeat: Option<DateTime<Utc>>,
    payload: serde_json::Value,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            id: Some(ItemId(row.id)),
            status: row.status,
            run_date: row.run_date,
            heartbeat: row.heartbeat,
            payload: row.payload,
        }
    }
}
