use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};

use super::AppState;
use crate::error::IngestError;

/// Handler for POST /webhooks/payments/{provider}
///
/// 202 once the delivery is verified and stored; processing happens on the
/// webhook worker. 422 on a bad signature, 404 for an unknown provider.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, IngestError> {
    state.ingestor.ingest(&provider, &headers, &body).await?;
    Ok(StatusCode::ACCEPTED)
}
