use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use tracing::error;

use simbridge_types::{ContinueSignal, NotificationBatch};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/account", post(account))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Notification batches from the engine. Answers `{"continue": bool}` when
/// the batch carried an error report and `null` otherwise.
async fn account(
    State(state): State<AppState>,
    Json(batch): Json<NotificationBatch>,
) -> Result<Json<Option<ContinueSignal>>, (StatusCode, String)> {
    state.bridge.handle_notifications(batch).await.map(Json).map_err(|e| {
        error!(error = %e, "failed to handle notification batch");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}
