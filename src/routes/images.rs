use crate::{
    correlation::CorrelationId,
    file_store::FileStoreError,
    intake::{IntakeError, IntakeResponse},
    routes::IMAGES_ROUTE,
    server::SharedState,
};
use axum::{
    extract::{multipart::MultipartError, Extension, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum UploadImagesError {
    #[error("Could not read multipart request: {0}")]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Intake(#[from] IntakeError),
}

impl UploadImagesError {
    fn status(&self) -> StatusCode {
        match self {
            UploadImagesError::Multipart(err) => err.status(),
            UploadImagesError::Intake(err) => match err {
                IntakeError::NoFiles => StatusCode::BAD_REQUEST,
                // the body limit can trip while a field is being streamed to disk
                IntakeError::FileStore(FileStoreError::Upload(source)) => source
                    .downcast_ref::<MultipartError>()
                    .map_or(StatusCode::BAD_REQUEST, MultipartError::status),
                IntakeError::FileStore(FileStoreError::Io(_)) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                IntakeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                IntakeError::Prediction(_) | IntakeError::Mismatch { .. } => {
                    StatusCode::BAD_GATEWAY
                }
            },
        }
    }
}

impl IntoResponse for UploadImagesError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Image intake failed: {}", self);
        } else {
            tracing::warn!("Image intake rejected: {}", self);
        }
        (status, format!("Something went wrong: {}", self)).into_response()
    }
}

/// Every multipart part that carries a file name is treated as an image.
#[instrument(skip(state, correlation_id, multipart))]
pub async fn upload_images(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    mut multipart: Multipart,
) -> Result<Json<IntakeResponse>, UploadImagesError> {
    state.metrics.record_request(IMAGES_ROUTE);
    let timer = Instant::now();

    let mut session = state.intake.begin(correlation_id).await?;

    while let Some(field) = multipart.next_field().await? {
        let file_name = match field.file_name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                tracing::debug!("Skipping non-file part {:?}", field.name());
                continue;
            }
        };
        session.add_file(&file_name, field).await?;
    }

    let image_count = session.image_count() as u64;
    let response = session.complete().await?;

    state.metrics.record_images(image_count, IMAGES_ROUTE);
    state
        .metrics
        .record_intake_duration(timer.elapsed().as_millis() as u64, IMAGES_ROUTE);
    tracing::info!(
        "Processed {} images in {} ms",
        image_count,
        timer.elapsed().as_millis()
    );

    Ok(Json(response))
}
