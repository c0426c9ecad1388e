use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::admin::AdminState;
use crate::pipeline::checkpoint::CheckpointTracker;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Current checkpoint as JSON; 404 until the first one is written.
pub async fn progress(State(st): State<AdminState>) -> Response {
    match CheckpointTracker::read(&st.batch_dir).await {
        Ok(Some(checkpoint)) => (StatusCode::OK, Json(checkpoint)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "no checkpoint yet".into(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: format!("internal error: {e}"),
            }),
        )
            .into_response(),
    }
}
