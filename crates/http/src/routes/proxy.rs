//! Catch-all proxy handler

use crate::forward::Forwarder;
use axum::extract::{Request, State};
use axum::response::Response;
use std::sync::Arc;

/// Dispatch any request to the family's forwarder
pub async fn forward_handler(
    State(forwarder): State<Arc<Forwarder>>,
    req: Request,
) -> Response {
    forwarder.handle(req).await
}
