use async_trait::async_trait;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use std::path::Path;
use uuid::Uuid;

use super::{
    ImageDefinition, IntakeStore, Metric, PredictionRequest, PredictionResult, StoreError,
    WebRequest, OVERALL_METRIC,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS web_request (
        web_request_id INTEGER PRIMARY KEY AUTOINCREMENT,
        correlation_id TEXT NOT NULL,
        requested TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS image_definition (
        image_definition_id INTEGER PRIMARY KEY AUTOINCREMENT,
        web_request_id INTEGER NOT NULL REFERENCES web_request(web_request_id),
        file_name TEXT NOT NULL,
        original_file_name TEXT NOT NULL,
        size INTEGER NOT NULL,
        camera_vendor TEXT,
        camera_model TEXT,
        taken TIMESTAMP,
        compression TEXT,
        x_resolution REAL,
        y_resolution REAL,
        resolution_unit INTEGER,
        exposure_time REAL,
        exposure_program INTEGER,
        exif_version BLOB,
        component_configuration BLOB,
        exposure_bias REAL,
        max_aperture_value REAL,
        aperture_value REAL,
        flash INTEGER,
        color_space INTEGER,
        width INTEGER,
        height INTEGER,
        orientation TEXT
    );

    CREATE TABLE IF NOT EXISTS prediction_request (
        prediction_request_id INTEGER PRIMARY KEY AUTOINCREMENT,
        web_request_id INTEGER NOT NULL REFERENCES web_request(web_request_id),
        image_definition_id INTEGER NOT NULL REFERENCES image_definition(image_definition_id)
    );

    CREATE TABLE IF NOT EXISTS prediction_result (
        prediction_result_id INTEGER PRIMARY KEY AUTOINCREMENT,
        prediction_request_id INTEGER NOT NULL REFERENCES prediction_request(prediction_request_id),
        image_definition_id INTEGER NOT NULL REFERENCES image_definition(image_definition_id),
        label TEXT NOT NULL,
        score REAL NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metric_type (
        code TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metric (
        metric_id INTEGER PRIMARY KEY AUTOINCREMENT,
        web_request_id INTEGER NOT NULL REFERENCES web_request(web_request_id),
        metric_code TEXT NOT NULL REFERENCES metric_type(code),
        started TIMESTAMP NOT NULL,
        ended TIMESTAMP NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_prediction_result_request
        ON prediction_result(prediction_request_id);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.execute_batch(
                "PRAGMA busy_timeout = 5000;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder().build(manager)?;

        Self::from_pool(pool)
    }

    /// Single connection so every checkout sees the same in-memory database.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;

        Self::from_pool(pool)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> Result<Self, StoreError> {
        let conn = pool.get()?;
        migrate(&conn)?;
        drop(conn);

        Ok(Self { pool })
    }

    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO metric_type (code, value) VALUES (?1, ?2)",
        params![OVERALL_METRIC, "Overall processing time"],
    )?;
    Ok(())
}

#[async_trait]
impl IntakeStore for SqliteStore {
    async fn register_request(&self, correlation_id: Uuid) -> Result<WebRequest, StoreError> {
        let requested = Utc::now();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO web_request (correlation_id, requested) VALUES (?1, ?2)",
                params![correlation_id.to_string(), requested],
            )?;
            Ok(WebRequest {
                web_request_id: conn.last_insert_rowid(),
                correlation_id,
                requested,
            })
        })
        .await
    }

    async fn register_image_definition(
        &self,
        image_definition: ImageDefinition,
    ) -> Result<i64, StoreError> {
        self.run(move |conn| {
            let m = &image_definition.metadata;
            conn.execute(
                "INSERT INTO image_definition (
                    web_request_id, file_name, original_file_name, size,
                    camera_vendor, camera_model, taken, compression,
                    x_resolution, y_resolution, resolution_unit,
                    exposure_time, exposure_program, exif_version, component_configuration,
                    exposure_bias, max_aperture_value, aperture_value,
                    flash, color_space, width, height, orientation
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                params![
                    image_definition.web_request_id,
                    image_definition.file_name,
                    image_definition.original_file_name,
                    image_definition.size,
                    m.camera_vendor,
                    m.camera_model,
                    m.taken,
                    m.compression,
                    m.x_resolution,
                    m.y_resolution,
                    m.resolution_unit,
                    m.exposure_time,
                    m.exposure_program,
                    m.exif_version,
                    m.component_configuration,
                    m.exposure_bias,
                    m.max_aperture_value,
                    m.aperture_value,
                    m.flash,
                    m.color_space,
                    m.width,
                    m.height,
                    m.orientation,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn register_prediction_request(
        &self,
        web_request_id: i64,
        image_definition_id: i64,
    ) -> Result<PredictionRequest, StoreError> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO prediction_request (web_request_id, image_definition_id) VALUES (?1, ?2)",
                params![web_request_id, image_definition_id],
            )?;
            Ok(PredictionRequest {
                prediction_request_id: conn.last_insert_rowid(),
                web_request_id,
                image_definition_id,
            })
        })
        .await
    }

    async fn register_prediction_results(
        &self,
        results: Vec<PredictionResult>,
    ) -> Result<(), StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO prediction_result (prediction_request_id, image_definition_id, label, score)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for result in &results {
                    stmt.execute(params![
                        result.prediction_request_id,
                        result.image_definition_id,
                        result.label,
                        result.score,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn register_metric(&self, metric: Metric) -> Result<i64, StoreError> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO metric (web_request_id, metric_code, started, ended) VALUES (?1, ?2, ?3, ?4)",
                params![
                    metric.web_request_id,
                    metric.metric_code,
                    metric.started,
                    metric.ended
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }
}
