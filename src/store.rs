//! Directory-backed persistence for uploaded payroll datasets.
//!
//! Persistence is composed explicitly on top of ingestion: [`ingest_and_save`] runs the ingestor
//! and then saves its rows. Nothing here hooks into the ingestion path itself.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::ingest::{IngestReport, StreamingCsvIngestor};
use crate::io::IngestionSource;
use crate::IngestError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid file name: {0}")]
    InvalidName(String),
    #[error("payload is not an array of records")]
    NotAnArray,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedUpload {
    pub file_name: String,
    pub record_count: usize,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub file_name: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

static SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    /// Open (creating if needed) the upload directory.
    pub async fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `records` (a JSON array) as pretty JSON. The file is named after the stem of
    /// `original_name` with a millisecond timestamp appended, always gets a `.json` extension,
    /// and never replaces an existing file.
    pub async fn save(
        &self,
        original_name: Option<&str>,
        records: &Value,
    ) -> StoreResult<SavedUpload> {
        let count = records.as_array().ok_or(StoreError::NotAnArray)?.len();
        let body = serde_json::to_vec_pretty(records)?;
        let saved_at = Utc::now();
        let millis = saved_at.timestamp_millis();

        let stem = match original_name.map(Path::new) {
            Some(path) => {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .filter(|s| !s.is_empty())
                    .unwrap_or("payroll");
                format!("{stem}_{millis}")
            }
            None => format!("payroll_{millis}_{:09}", SEQ.fetch_add(1, Ordering::Relaxed)),
        };

        let mut attempt = 0u32;
        loop {
            let file_name = if attempt == 0 {
                format!("{stem}.json")
            } else {
                format!("{stem}-{attempt}.json")
            };
            let path = self.dir.join(&file_name);
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(&body).await?;
                    file.flush().await?;
                    tracing::info!(file = %file_name, records = count, "upload saved");
                    return Ok(SavedUpload {
                        file_name,
                        record_count: count,
                        saved_at,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Stored `.json` files, newest first.
    pub async fn list(&self) -> StoreResult<Vec<StoredFile>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if !file_name.ends_with(".json") {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            files.push(StoredFile {
                file_name,
                size: meta.len(),
                uploaded_at: meta.modified().map(DateTime::<Utc>::from)?,
            });
        }
        files.sort_by(|a, b| {
            b.uploaded_at
                .cmp(&a.uploaded_at)
                .then_with(|| b.file_name.cmp(&a.file_name))
        });
        Ok(files)
    }

    /// Remove a stored file. Returns `false` when it did not exist.
    pub async fn delete(&self, file_name: &str) -> StoreResult<bool> {
        let path = self.resolve(file_name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load(&self, file_name: &str) -> StoreResult<Value> {
        let path = self.resolve(file_name)?;
        let bytes = fs::read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn resolve(&self, file_name: &str) -> StoreResult<PathBuf> {
        let invalid = file_name.is_empty()
            || file_name == "."
            || file_name == ".."
            || file_name.contains(['/', '\\', '\0']);
        if invalid {
            return Err(StoreError::InvalidName(file_name.to_string()));
        }
        Ok(self.dir.join(file_name))
    }
}

#[derive(Debug, Error)]
pub enum IngestSaveError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ingest `source`, then persist its preview rows under the source's name.
pub async fn ingest_and_save<S>(
    ingestor: &StreamingCsvIngestor,
    source: &S,
    config: &IngestConfig,
    cancel: &CancellationToken,
    store: &UploadStore,
) -> Result<(IngestReport, SavedUpload), IngestSaveError>
where
    S: IngestionSource + ?Sized,
{
    let report = ingestor.ingest(source, config, cancel).await?;
    let records = serde_json::to_value(&report.rows).map_err(StoreError::from)?;
    let name = Path::new(source.name())
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|stem| format!("{stem}.json"));
    let saved = store.save(name.as_deref(), &records).await?;
    Ok((report, saved))
}
