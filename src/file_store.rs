use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::{
    error::Error as StdError,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("I/O error while saving upload: {0}")]
    Io(#[from] std::io::Error),
    #[error("Upload stream failed: {0}")]
    Upload(Box<dyn StdError + Send + Sync>),
}

#[derive(Debug, Clone)]
pub struct SavedFile {
    pub path: PathBuf,
    pub size: u64,
}

impl SavedFile {
    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Writes uploads into a temp folder under freshly generated names.
#[derive(Debug, Clone)]
pub struct FileStore {
    temp_folder: PathBuf,
}

impl FileStore {
    pub fn new(temp_folder: impl Into<PathBuf>) -> Self {
        Self {
            temp_folder: temp_folder.into(),
        }
    }

    pub fn temp_folder(&self) -> &Path {
        &self.temp_folder
    }

    pub async fn ensure_folder(&self) -> Result<(), FileStoreError> {
        fs::create_dir_all(&self.temp_folder).await?;
        Ok(())
    }

    /// `{temp_folder}/{uuid}{.ext}`, keeping the extension of the uploaded name.
    pub fn new_file_path(&self, original_name: &str) -> PathBuf {
        let file_name = match Path::new(original_name)
            .extension()
            .and_then(|ext| ext.to_str())
        {
            Some(ext) if !ext.is_empty() => format!("{}.{}", Uuid::new_v4(), ext),
            _ => Uuid::new_v4().to_string(),
        };
        self.temp_folder.join(file_name)
    }

    pub async fn save<S, E>(
        &self,
        original_name: &str,
        content: S,
    ) -> Result<SavedFile, FileStoreError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let path = self.new_file_path(original_name);
        tracing::debug!(
            "file \"{}\" is being saved to \"{}\" under \"{}\"",
            original_name,
            self.temp_folder.display(),
            path.display()
        );

        let mut content = std::pin::pin!(content);
        let mut target = fs::File::create(&path).await?;
        let mut size: u64 = 0;

        let written: Result<(), FileStoreError> = async {
            while let Some(chunk) = content.next().await {
                let chunk = chunk.map_err(|e| FileStoreError::Upload(e.into()))?;
                target.write_all(&chunk).await?;
                size += chunk.len() as u64;
            }
            target.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = written {
            drop(target);
            if let Err(remove_err) = fs::remove_file(&path).await {
                tracing::warn!(
                    "Failed to remove partial upload {}: {}",
                    path.display(),
                    remove_err
                );
            }
            return Err(e);
        }

        Ok(SavedFile { path, size })
    }
}
