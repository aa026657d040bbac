use crate::server::SharedState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
pub struct Status {
    pub status: String,
    pub upload_folder_ready: bool,
}

/// Reports `Degraded` when uploads could not be written to the temp folder.
pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    let upload_folder_ready = tokio::fs::metadata(state.intake.file_store().temp_folder())
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    let (code, status) = if upload_folder_ready {
        (StatusCode::OK, "Available")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Degraded")
    };

    (
        code,
        Json(Status {
            status: status.into(),
            upload_folder_ready,
        }),
    )
}
