//! Span helpers for engine operations on a record pool.

use tracing::Span;

use crate::model::{DatabaseId, RequestId};

/// Start a span for an operation scoped to one database's record pool.
///
/// `pool.request_id` is declared empty and can be filled once a request
/// exists via [`record_request`].
pub fn start_pool_span(operation: &'static str, database_id: Option<DatabaseId>) -> Span {
    let span = tracing::info_span!(
        "pool.operation",
        "pool.operation" = operation,
        "pool.database_id" = tracing::field::Empty,
        "pool.request_id" = tracing::field::Empty,
    );
    if let Some(id) = database_id {
        span.record("pool.database_id", tracing::field::display(id));
    }
    span
}

/// Attach the request an operation created or acted on.
pub fn record_request(span: &Span, request_id: RequestId) {
    span.record("pool.request_id", tracing::field::display(request_id));
}

/// Record a request state transition as an event on the span.
pub fn record_request_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "request_transition");
    });
}
