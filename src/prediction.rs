use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::instrument;

use crate::config::PredictionServiceConfig;

/// Label → score for a single image.
pub type ImagePredictions = BTreeMap<String, f64>;

#[derive(Error, Debug)]
pub enum PredictionServiceError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(reqwest::Error),
    #[error("Request to prediction service failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Prediction service at {url} answered with status {status}")]
    BadStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("Response from {0} does not contain any data")]
    MissingData(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PredictionRequestBody {
    pub images: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PredictionResponseBody {
    #[serde(default)]
    pub data: Option<Vec<ImagePredictions>>,
}

impl PredictionResponseBody {
    pub fn into_predictions(
        self,
        url: &str,
    ) -> Result<Vec<ImagePredictions>, PredictionServiceError> {
        self.data
            .ok_or_else(|| PredictionServiceError::MissingData(url.to_string()))
    }
}

#[async_trait]
pub trait PredictionClient: Send + Sync + 'static {
    /// One entry per input path, in the same order.
    async fn predict(
        &self,
        file_paths: Vec<String>,
    ) -> Result<Vec<ImagePredictions>, PredictionServiceError>;
}

pub struct HttpPredictionClient {
    client: reqwest::Client,
    url: String,
}

impl HttpPredictionClient {
    pub fn new(config: &PredictionServiceConfig) -> Result<Self, PredictionServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.get_timeout())
            .build()
            .map_err(PredictionServiceError::ClientBuild)?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl PredictionClient for HttpPredictionClient {
    #[instrument(skip(self, file_paths), fields(url = %self.url, images = file_paths.len()))]
    async fn predict(
        &self,
        file_paths: Vec<String>,
    ) -> Result<Vec<ImagePredictions>, PredictionServiceError> {
        tracing::debug!("Sending request for predictions to \"{}\"", self.url);

        let response = self
            .client
            .post(&self.url)
            .json(&PredictionRequestBody { images: file_paths })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PredictionServiceError::BadStatus {
                url: self.url.clone(),
                status,
            });
        }

        let body: PredictionResponseBody = response.json().await?;
        body.into_predictions(&self.url)
    }
}
