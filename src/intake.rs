//! One intake round: register the request, persist every upload with its EXIF
//! data, ask the prediction service about all of them at once and fan the
//! scores back out to the originating files.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, error::Error as StdError, path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::instrument;

use crate::{
    correlation::CorrelationId,
    file_store::{FileStore, FileStoreError},
    metadata::ImageMetadata,
    prediction::{ImagePredictions, PredictionClient, PredictionServiceError},
    store::{
        ImageDefinition, IntakeStore, Metric, PredictionRequest, PredictionResult, StoreError,
        WebRequest, OVERALL_METRIC,
    },
};

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("No files were uploaded")]
    NoFiles,
    #[error("Failed to save upload: {0}")]
    FileStore(#[from] FileStoreError),
    #[error("Database error: {0}")]
    Store(#[from] StoreError),
    #[error("Prediction service error: {0}")]
    Prediction(#[from] PredictionServiceError),
    #[error("Prediction service returned {returned} results for {expected} images")]
    Mismatch { expected: usize, returned: usize },
}

/// Original file name → label → score.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct IntakeResponse {
    pub data: BTreeMap<String, ImagePredictions>,
}

pub struct ImageIntake {
    store: Arc<dyn IntakeStore>,
    predictor: Arc<dyn PredictionClient>,
    file_store: FileStore,
}

impl ImageIntake {
    pub fn new(
        store: Arc<dyn IntakeStore>,
        predictor: Arc<dyn PredictionClient>,
        file_store: FileStore,
    ) -> Self {
        Self {
            store,
            predictor,
            file_store,
        }
    }

    pub fn file_store(&self) -> &FileStore {
        &self.file_store
    }

    /// Registers the request record and starts the clock for the overall metric.
    #[instrument(skip(self))]
    pub async fn begin(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<IntakeSession<'_>, IntakeError> {
        let started = Utc::now();
        let web_request = self.store.register_request(correlation_id.as_uuid()).await?;
        tracing::debug!(
            web_request_id = web_request.web_request_id,
            requested = %web_request.requested,
            "Registered web request {}",
            web_request.correlation_id
        );

        Ok(IntakeSession {
            intake: self,
            correlation_id,
            web_request,
            started,
            images: Vec::new(),
        })
    }
}

#[derive(Debug)]
struct RegisteredImage {
    original_name: String,
    path: PathBuf,
    prediction_request: PredictionRequest,
}

pub struct IntakeSession<'a> {
    intake: &'a ImageIntake,
    correlation_id: CorrelationId,
    web_request: WebRequest,
    started: DateTime<Utc>,
    images: Vec<RegisteredImage>,
}

impl<'a> IntakeSession<'a> {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Saves one upload, extracts its EXIF data and registers its
    /// `image_definition` and `prediction_request` rows.
    #[instrument(skip(self, content), fields(correlation_id = %self.correlation_id))]
    pub async fn add_file<S, E>(
        &mut self,
        original_name: &str,
        content: S,
    ) -> Result<(), IntakeError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let store = &self.intake.store;
        let saved = self.intake.file_store.save(original_name, content).await?;

        tracing::debug!("Extracting EXIF data from {}", original_name);
        let metadata = read_metadata(saved.path.clone(), original_name).await;

        let image_definition = ImageDefinition {
            web_request_id: self.web_request.web_request_id,
            file_name: saved.path_string(),
            original_file_name: original_name.to_string(),
            size: i64::try_from(saved.size).unwrap_or(i64::MAX),
            metadata,
        };

        tracing::debug!(
            "Registering ImageDefinition of {} file to Database",
            original_name
        );
        let image_definition_id = store.register_image_definition(image_definition).await?;
        let prediction_request = store
            .register_prediction_request(self.web_request.web_request_id, image_definition_id)
            .await?;
        tracing::debug!(
            prediction_request_id = prediction_request.prediction_request_id,
            web_request_id = prediction_request.web_request_id,
            "Registered PredictionRequest of {}",
            original_name
        );

        self.images.push(RegisteredImage {
            original_name: original_name.to_string(),
            path: saved.path,
            prediction_request,
        });

        Ok(())
    }

    /// Sends every saved file to the prediction service in one call, persists
    /// the per-label results and the overall metric.
    #[instrument(skip(self), fields(correlation_id = %self.correlation_id, images = self.images.len()))]
    pub async fn complete(self) -> Result<IntakeResponse, IntakeError> {
        if self.images.is_empty() {
            return Err(IntakeError::NoFiles);
        }

        tracing::debug!("Getting predictions for {} images", self.images.len());

        let file_paths = self
            .images
            .iter()
            .map(|image| image.path.to_string_lossy().into_owned())
            .collect();

        let predictions = match self.intake.predictor.predict(file_paths).await {
            Ok(predictions) => predictions,
            Err(e) => {
                tracing::error!("Predictions were not returned: {}", e);
                return Err(e.into());
            }
        };

        if predictions.len() != self.images.len() {
            tracing::error!(
                "Prediction count {} does not match image count {}",
                predictions.len(),
                self.images.len()
            );
            return Err(IntakeError::Mismatch {
                expected: self.images.len(),
                returned: predictions.len(),
            });
        }

        let results = collect_results(&self.images, &predictions);
        tracing::debug!("Saving {} prediction results", results.len());
        self.intake.store.register_prediction_results(results).await?;

        self.intake
            .store
            .register_metric(Metric {
                web_request_id: self.web_request.web_request_id,
                metric_code: OVERALL_METRIC.to_string(),
                started: self.started,
                ended: Utc::now(),
            })
            .await?;

        Ok(map_response(&self.images, predictions))
    }
}

async fn read_metadata(path: PathBuf, original_name: &str) -> ImageMetadata {
    match tokio::task::spawn_blocking(move || ImageMetadata::read_from_path(&path)).await {
        Ok(Ok(metadata)) => metadata,
        Ok(Err(e)) => {
            tracing::error!(
                "Error occurred while reading EXIF data from {}: {}",
                original_name,
                e
            );
            ImageMetadata::default()
        }
        Err(e) => {
            tracing::error!("EXIF extraction task for {} failed: {}", original_name, e);
            ImageMetadata::default()
        }
    }
}

/// The i-th prediction entry belongs to the i-th registered image.
fn collect_results(
    images: &[RegisteredImage],
    predictions: &[ImagePredictions],
) -> Vec<PredictionResult> {
    images
        .iter()
        .zip(predictions)
        .flat_map(|(image, scores)| {
            scores.iter().map(move |(label, score)| PredictionResult {
                prediction_request_id: image.prediction_request.prediction_request_id,
                image_definition_id: image.prediction_request.image_definition_id,
                label: label.clone(),
                score: *score,
            })
        })
        .collect()
}

fn map_response(images: &[RegisteredImage], predictions: Vec<ImagePredictions>) -> IntakeResponse {
    let mut data = BTreeMap::new();
    for (image, scores) in images.iter().zip(predictions) {
        if data.insert(image.original_name.clone(), scores).is_some() {
            tracing::warn!(
                "Duplicate file name {} in one request, keeping the last upload",
                image.original_name
            );
        }
    }
    IntakeResponse { data }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Mutex;

    /// Scores every image with `oak` = 1 / (position + 1) and `birch` = the rest.
    struct MockPredictionClient {
        seen: Mutex<Vec<String>>,
        drop_last: bool,
    }

    impl MockPredictionClient {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                drop_last: false,
            }
        }
    }

    #[async_trait]
    impl PredictionClient for MockPredictionClient {
        async fn predict(
            &self,
            file_paths: Vec<String>,
        ) -> Result<Vec<ImagePredictions>, PredictionServiceError> {
            self.seen.lock().unwrap().extend(file_paths.iter().cloned());
            let mut data: Vec<ImagePredictions> = (0..file_paths.len())
                .map(|i| {
                    let oak = 1.0 / (i as f64 + 1.0);
                    ImagePredictions::from([
                        ("oak".to_string(), oak),
                        ("birch".to_string(), 1.0 - oak),
                    ])
                })
                .collect();
            if self.drop_last {
                data.pop();
            }
            Ok(data)
        }
    }

    struct MissingDataClient;

    #[async_trait]
    impl PredictionClient for MissingDataClient {
        async fn predict(
            &self,
            _file_paths: Vec<String>,
        ) -> Result<Vec<ImagePredictions>, PredictionServiceError> {
            Err(PredictionServiceError::MissingData("http://mock".into()))
        }
    }

    fn upload(content: &'static [u8]) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        stream::iter(vec![Ok(Bytes::from_static(content))])
    }

    fn temp_file_store() -> FileStore {
        FileStore::new(std::env::temp_dir().join(format!("intake-{}", uuid::Uuid::new_v4())))
    }

    async fn count(store: &SqliteStore, sql: &'static str) -> i64 {
        store
            .run(move |conn| Ok(conn.query_row(sql, [], |row| row.get(0))?))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_round_maps_predictions_to_original_names(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(SqliteStore::in_memory()?);
        let predictor = Arc::new(MockPredictionClient::new());
        let file_store = temp_file_store();
        file_store.ensure_folder().await?;
        let intake = ImageIntake::new(store.clone(), predictor.clone(), file_store.clone());

        let mut session = intake.begin(CorrelationId::new()).await?;
        session.add_file("first.jpg", upload(b"not really a jpeg")).await?;
        session.add_file("second.png", upload(b"nor a png")).await?;
        assert_eq!(session.image_count(), 2);
        let response = session.complete().await?;

        assert_eq!(response.data.len(), 2);
        assert_eq!(response.data["first.jpg"]["oak"], 1.0);
        assert_eq!(response.data["second.png"]["oak"], 0.5);

        let seen = predictor.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].ends_with(".jpg"));
        assert!(seen[1].ends_with(".png"));

        assert_eq!(count(&store, "SELECT COUNT(*) FROM image_definition").await, 2);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM prediction_request").await, 2);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM prediction_result").await, 4);
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM metric WHERE metric_code = 'OVERALL'").await,
            1
        );

        let second_oak: f64 = store
            .run(|conn| {
                Ok(conn.query_row(
                    "SELECT r.score FROM prediction_result r
                     JOIN image_definition i USING (image_definition_id)
                     WHERE i.original_file_name = 'second.png' AND r.label = 'oak'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await?;
        assert_eq!(second_oak, 0.5);

        tokio::fs::remove_dir_all(file_store.temp_folder()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_exif_failure_does_not_fail_the_round() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(SqliteStore::in_memory()?);
        let file_store = temp_file_store();
        file_store.ensure_folder().await?;
        let intake = ImageIntake::new(
            store.clone(),
            Arc::new(MockPredictionClient::new()),
            file_store.clone(),
        );

        let mut session = intake.begin(CorrelationId::new()).await?;
        session.add_file("garbage.jpg", upload(b"\x00\x01\x02")).await?;
        session.complete().await?;

        let size_and_vendor: (i64, Option<String>) = store
            .run(|conn| {
                Ok(conn.query_row(
                    "SELECT size, camera_vendor FROM image_definition",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .await?;
        assert_eq!(size_and_vendor, (3, None));

        tokio::fs::remove_dir_all(file_store.temp_folder()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_data_persists_no_results() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(SqliteStore::in_memory()?);
        let file_store = temp_file_store();
        file_store.ensure_folder().await?;
        let intake = ImageIntake::new(
            store.clone(),
            Arc::new(MissingDataClient),
            file_store.clone(),
        );

        let mut session = intake.begin(CorrelationId::new()).await?;
        session.add_file("oak.jpg", upload(b"bytes")).await?;
        let result = session.complete().await;

        assert!(matches!(
            result,
            Err(IntakeError::Prediction(PredictionServiceError::MissingData(_)))
        ));
        assert_eq!(count(&store, "SELECT COUNT(*) FROM image_definition").await, 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM prediction_result").await, 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM metric").await, 0);

        tokio::fs::remove_dir_all(file_store.temp_folder()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_count_mismatch_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(SqliteStore::in_memory()?);
        let file_store = temp_file_store();
        file_store.ensure_folder().await?;
        let predictor = Arc::new(MockPredictionClient {
            seen: Mutex::new(Vec::new()),
            drop_last: true,
        });
        let intake = ImageIntake::new(store.clone(), predictor, file_store.clone());

        let mut session = intake.begin(CorrelationId::new()).await?;
        session.add_file("a.jpg", upload(b"a")).await?;
        session.add_file("b.jpg", upload(b"b")).await?;
        let result = session.complete().await;

        assert!(matches!(
            result,
            Err(IntakeError::Mismatch {
                expected: 2,
                returned: 1
            })
        ));
        assert_eq!(count(&store, "SELECT COUNT(*) FROM prediction_result").await, 0);

        tokio::fs::remove_dir_all(file_store.temp_folder()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_no_files_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(SqliteStore::in_memory()?);
        let intake = ImageIntake::new(
            store.clone(),
            Arc::new(MockPredictionClient::new()),
            temp_file_store(),
        );

        let session = intake.begin(CorrelationId::new()).await?;
        let result = session.complete().await;

        assert!(matches!(result, Err(IntakeError::NoFiles)));
        assert_eq!(count(&store, "SELECT COUNT(*) FROM web_request").await, 1);
        Ok(())
    }

    #[test]
    fn test_duplicate_names_keep_last_upload() {
        let images: Vec<RegisteredImage> = (0..2)
            .map(|i| RegisteredImage {
                original_name: "same.jpg".into(),
                path: PathBuf::from(format!("/tmp/{}.jpg", i)),
                prediction_request: PredictionRequest {
                    prediction_request_id: i + 1,
                    web_request_id: 1,
                    image_definition_id: i + 1,
                },
            })
            .collect();
        let predictions = vec![
            ImagePredictions::from([("oak".to_string(), 0.2)]),
            ImagePredictions::from([("oak".to_string(), 0.8)]),
        ];

        let results = collect_results(&images, &predictions);
        let response = map_response(&images, predictions);

        assert_eq!(results.len(), 2);
        assert_eq!(results[1].prediction_request_id, 2);
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data["same.jpg"]["oak"], 0.8);
    }
}
