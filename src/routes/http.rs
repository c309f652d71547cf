//! HTTP endpoint handlers. Sessions run over the WebSocket; HTTP only serves health
//! and the oracle's exercise history.

use std::sync::Arc;
use axum::{extract::{Path, State}, http::StatusCode, Json, response::IntoResponse};
use tracing::{info, instrument, warn};

use crate::protocol::{ErrorOut, HealthOut};
use crate::state::AppState;

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse { Json(HealthOut { ok: true }) }

#[instrument(level = "info", skip(state), fields(%concept_id))]
pub async fn http_get_history(
  State(state): State<Arc<AppState>>,
  Path(concept_id): Path<String>,
) -> impl IntoResponse {
  match state.oracle.history(&concept_id).await {
    Ok(records) => {
      info!(target: "mastery_backend", %concept_id, count = records.len(), "HTTP history served");
      (StatusCode::OK, Json(records)).into_response()
    }
    Err(e) => {
      warn!(target: "mastery_backend", %concept_id, error = %e, "HTTP history failed");
      (StatusCode::BAD_GATEWAY, Json(ErrorOut { error: e.to_string() })).into_response()
    }
  }
}
