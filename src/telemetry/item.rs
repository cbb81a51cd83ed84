//! Span helpers for scheduler operations.

use tracing::Span;

use crate::model::ItemId;

/// Start a span for one scheduler operation against `collection`.
///
/// `okra.item_id` is declared empty; fill it with [`record_item`] once the
/// item is known (after a claim, for instance).
pub fn start_operation_span(parent: &Span, operation: &'static str, collection: &str) -> Span {
    tracing::info_span!(
        parent: parent,
        "okra.operation",
        "okra.operation" = operation,
        "okra.collection" = collection,
        "okra.item_id" = tracing::field::Empty,
    )
}

/// Attach the item this operation acted on.
pub fn record_item(span: &Span, id: ItemId) {
    span.record("okra.item_id", tracing::field::display(id));
}

/// Start a span covering a worker's whole handling of one item.
pub fn start_process_span(collection: &str, id: ItemId) -> Span {
    tracing::info_span!(
        "okra.process",
        "okra.collection" = collection,
        "okra.item_id" = %id,
        "okra.outcome" = tracing::field::Empty,
    )
}

/// Record how a worker finished with an item.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("okra.outcome", outcome);
    span.in_scope(|| {
        tracing::info!(outcome, "item processed");
    });
}
