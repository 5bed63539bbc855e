//! Chunked ingestion of payroll CSV exports.
//!
//! - Single-pass path: sources at or below the configured threshold are decoded in one read.
//! - Chunked path: larger sources are read window by window, carrying partial lines across
//!   window boundaries, with progress reporting, cooperative cancellation and a memory-pressure
//!   monitor active for the duration of the run.
//! - Fast local path: feature `fast_local`, memory-mapped local files.
//!
//! Data shape:
//! - `IngestReport { rows, headers, total_lines, .. }`
//! - `Row`: header-ordered `name -> value` cells, serialized as a JSON object
#![cfg_attr(docsrs, feature(doc_cfg))]
//
mod codec;
pub mod config;
#[cfg(feature = "fast_local")]
mod fast;
pub mod ingest;
mod io;
pub mod monitor;
pub mod progress;
pub mod store;
pub mod tokenizer;
pub mod upload;

pub use crate::codec::TextDecoder;
pub use crate::config::IngestConfig;
#[cfg(feature = "fast_local")]
pub use crate::fast::MmapSource;
pub use crate::ingest::{IngestReport, Row, Strategy, StreamingCsvIngestor};
pub use crate::io::{
    read_text, source_from_path, BytesSource, ChunkReader, FileSource, IngestionSource,
    ScratchBuffer,
};
pub use crate::monitor::{
    MemoryPressureMonitor, MemoryProbe, MemorySample, MemoryStats, MonitorConfig, MonitorLease,
    PressureLevel,
};
pub use crate::progress::StatusSink;
pub use crate::store::{ingest_and_save, SavedUpload, StoreError, UploadStore};
pub use crate::tokenizer::tokenize_line;
pub use crate::upload::{handle_api, ApiRequest, ApiResponse};
pub use tokio_util::sync::CancellationToken;

use thiserror::Error;

/// A source slice could not be accessed or decoded.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid {encoding} byte sequence at offset {offset}")]
    Decode {
        offset: u64,
        encoding: &'static str,
    },
    #[error("unknown character encoding: {0}")]
    UnknownEncoding(String),
}

/// Error returned by an ingestion run. A run either yields a complete report or exactly one of these.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read source: {0}")]
    Read(#[from] ReadError),
    #[error("ingestion cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled)
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
