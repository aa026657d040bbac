mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::metadata::ImageMetadata;

pub const OVERALL_METRIC: &str = "OVERALL";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WebRequest {
    pub web_request_id: i64,
    pub correlation_id: Uuid,
    pub requested: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ImageDefinition {
    pub web_request_id: i64,
    pub file_name: String,
    pub original_file_name: String,
    pub size: i64,
    pub metadata: ImageMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictionRequest {
    pub prediction_request_id: i64,
    pub web_request_id: i64,
    pub image_definition_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub prediction_request_id: i64,
    pub image_definition_id: i64,
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct Metric {
    pub web_request_id: i64,
    pub metric_code: String,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
}

/// Persistence of everything one intake round produces.
#[async_trait]
pub trait IntakeStore: Send + Sync + 'static {
    async fn register_request(&self, correlation_id: Uuid) -> Result<WebRequest, StoreError>;

    /// Returns the id of the new `image_definition` row.
    async fn register_image_definition(
        &self,
        image_definition: ImageDefinition,
    ) -> Result<i64, StoreError>;

    async fn register_prediction_request(
        &self,
        web_request_id: i64,
        image_definition_id: i64,
    ) -> Result<PredictionRequest, StoreError>;

    async fn register_prediction_results(
        &self,
        results: Vec<PredictionResult>,
    ) -> Result<(), StoreError>;

    async fn register_metric(&self, metric: Metric) -> Result<i64, StoreError>;
}
