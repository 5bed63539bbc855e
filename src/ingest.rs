//! Streaming CSV ingestion.
//!
//! Small sources are decoded in one read. Larger ones are read chunk by chunk: each chunk is
//! appended to the partial line carried over from the previous one, every complete line is
//! folded into the run state, and the trailing fragment waits for the next chunk. Output is
//! therefore independent of where chunk boundaries fall.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use memchr::{memchr_iter, memrchr};
use serde::ser::{Serialize, SerializeMap, Serializer};
use tokio_util::sync::CancellationToken;

use crate::codec::TextDecoder;
use crate::config::IngestConfig;
use crate::io::{read_text, ChunkReader, IngestionSource, ScratchBuffer};
use crate::monitor::{CleanupId, MemoryPressureMonitor, MonitorLease};
use crate::progress::{format_bytes, format_duration, ProgressTracker, StatusSink};
use crate::tokenizer::tokenize_line;
use crate::{IngestError, IngestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SinglePass,
    Chunked,
}

/// One data line zipped against the header. Cells iterate in header order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    headers: Arc<[String]>,
    values: Vec<String>,
}

impl Row {
    /// Missing trailing cells become empty strings; cells beyond the header are dropped.
    fn zip(headers: &Arc<[String]>, mut values: Vec<String>) -> Self {
        values.resize(headers.len(), String::new());
        Self {
            headers: Arc::clone(headers),
            values,
        }
    }

    /// First cell whose header is `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .position(|h| h == name)
            .map(|idx| self.values[idx].as_str())
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct IngestReport {
    /// Preview rows, at most `max_preview_rows`.
    pub rows: Vec<Row>,
    /// `None` when the source held no non-blank line.
    pub headers: Option<Vec<String>>,
    /// Every non-blank data line seen, materialized or not.
    pub total_lines: u64,
    pub total_chunks: usize,
    pub strategy: Strategy,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl IngestReport {
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// What `max_preview_rows` limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreviewBound {
    /// Materialized rows. Skipped short rows do not use up the budget.
    Rows,
    /// Data lines considered, whether or not they became rows.
    Lines,
}

/// Per-run state. Owned by exactly one `ingest` call.
struct IngestionState {
    offset: u64,
    carry: String,
    headers: Option<Arc<[String]>>,
    total_lines: u64,
    rows: Vec<Row>,
    max_rows: usize,
    bound: PreviewBound,
    slack: usize,
}

impl IngestionState {
    fn new(max_rows: usize, bound: PreviewBound, slack: usize) -> Self {
        Self {
            offset: 0,
            carry: String::new(),
            headers: None,
            total_lines: 0,
            rows: Vec::new(),
            max_rows,
            bound,
            slack,
        }
    }

    fn preview_full(&self) -> bool {
        match self.bound {
            PreviewBound::Rows => self.rows.len() >= self.max_rows,
            PreviewBound::Lines => self.total_lines > self.max_rows as u64,
        }
    }

    /// Append decoded text and fold every line it completes. The fragment after the last
    /// newline stays in `carry`.
    fn fold_text(&mut self, chunk: &str) {
        let Some(pos) = memrchr(b'\n', chunk.as_bytes()) else {
            self.carry.push_str(chunk);
            return;
        };

        let mut text = mem::take(&mut self.carry);
        let last = text.len() + pos;
        text.push_str(chunk);

        let mut start = 0;
        for nl in memchr_iter(b'\n', &text.as_bytes()[..=last]) {
            self.accept_line(&text[start..nl]);
            start = nl + 1;
        }

        text.drain(..=last);
        self.carry = text;
    }

    /// Fold the unterminated final line, if any.
    fn finish(&mut self) {
        let rest = mem::take(&mut self.carry);
        self.accept_line(&rest);
    }

    fn accept_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let Some(headers) = &self.headers else {
            self.headers = Some(tokenize_line(line).into());
            return;
        };

        self.total_lines += 1;
        if self.preview_full() {
            return;
        }
        let values = tokenize_line(line);
        // short rows within the slack are padded, shorter ones are skipped
        if values.len() + self.slack >= headers.len() {
            let row = Row::zip(headers, values);
            self.rows.push(row);
        }
    }

    fn into_report(
        self,
        strategy: Strategy,
        total_chunks: usize,
        bytes: u64,
        elapsed: Duration,
    ) -> IngestReport {
        IngestReport {
            rows: self.rows,
            headers: self.headers.map(|h| h.to_vec()),
            total_lines: self.total_lines,
            total_chunks,
            strategy,
            bytes,
            elapsed,
        }
    }
}

/// Ties the monitor and a cleanup callback to one chunked run.
struct MonitorSession {
    monitor: MemoryPressureMonitor,
    cleanup: CleanupId,
    _lease: MonitorLease,
}

impl MonitorSession {
    fn begin(monitor: &MemoryPressureMonitor, scratch: &ScratchBuffer, grace: Duration) -> Self {
        let lease = monitor.acquire(grace);
        let scratch = scratch.clone();
        let cleanup = monitor.register_cleanup_callback(move || {
            scratch.release();
            Ok(())
        });
        Self {
            monitor: monitor.clone(),
            cleanup,
            _lease: lease,
        }
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        self.monitor.unregister_cleanup_callback(self.cleanup);
    }
}

/// Orchestrates chunk reads, line reconstruction and row building.
pub struct StreamingCsvIngestor {
    monitor: MemoryPressureMonitor,
    sink: Option<Arc<dyn StatusSink>>,
    scratch: ScratchBuffer,
}

impl Default for StreamingCsvIngestor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingCsvIngestor {
    pub fn new() -> Self {
        Self {
            monitor: MemoryPressureMonitor::default(),
            sink: None,
            scratch: ScratchBuffer::new(),
        }
    }

    pub fn with_monitor(mut self, monitor: MemoryPressureMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_status_sink<S>(mut self, sink: S) -> Self
    where
        S: StatusSink + 'static,
    {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn monitor(&self) -> &MemoryPressureMonitor {
        &self.monitor
    }

    /// Raw read buffer released by the memory-pressure cleanup.
    pub fn scratch(&self) -> &ScratchBuffer {
        &self.scratch
    }

    fn emit(&self, message: &str, percent: u8) {
        if let Some(sink) = &self.sink {
            sink.update(message, percent);
        }
    }

    /// Ingest `source`. Resolves to a complete report, or fails with a read error or
    /// [`IngestError::Cancelled`]; no partial rows escape a failed run.
    ///
    /// `cancel` is polled before every chunk, so an in-flight chunk always finishes first.
    pub async fn ingest<S>(
        &self,
        source: &S,
        config: &IngestConfig,
        cancel: &CancellationToken,
    ) -> IngestResult<IngestReport>
    where
        S: IngestionSource + ?Sized,
    {
        let size = source.size();
        let strategy = if size > config.large_file_threshold {
            Strategy::Chunked
        } else {
            Strategy::SinglePass
        };
        tracing::info!(
            source = source.name(),
            size = %format_bytes(size),
            ?strategy,
            "ingestion started"
        );

        let report = match strategy {
            Strategy::SinglePass => self.ingest_single_pass(source, config, cancel).await,
            Strategy::Chunked => self.ingest_chunked(source, config, cancel).await,
        };

        match &report {
            Ok(report) => tracing::info!(
                source = source.name(),
                total_lines = report.total_lines,
                rows = report.rows.len(),
                elapsed = %format_duration(report.elapsed),
                "ingestion finished"
            ),
            Err(IngestError::Cancelled) => {
                tracing::info!(source = source.name(), "ingestion cancelled")
            }
            Err(e) => tracing::warn!(source = source.name(), error = %e, "ingestion failed"),
        }
        report
    }

    async fn ingest_single_pass<S>(
        &self,
        source: &S,
        config: &IngestConfig,
        cancel: &CancellationToken,
    ) -> IngestResult<IngestReport>
    where
        S: IngestionSource + ?Sized,
    {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let tracker = ProgressTracker::start(1);
        let size = source.size();
        let text = read_text(
            source,
            0,
            size as usize,
            &config.charset,
            config.lossy_decoding,
        )
        .await?;

        let mut state = IngestionState::new(
            config.max_preview_rows,
            PreviewBound::Lines,
            config.single_pass_row_slack,
        );
        state.fold_text(&text);
        state.finish();
        state.offset = size;

        let report = state.into_report(Strategy::SinglePass, 1, size, tracker.elapsed());
        self.emit(&completion_message(&report), 100);
        Ok(report)
    }

    async fn ingest_chunked<S>(
        &self,
        source: &S,
        config: &IngestConfig,
        cancel: &CancellationToken,
    ) -> IngestResult<IngestReport>
    where
        S: IngestionSource + ?Sized,
    {
        let size = source.size();
        let chunk_size = config.effective_chunk_size();
        let total_chunks = size.div_ceil(chunk_size as u64) as usize;
        let decoder = TextDecoder::for_label(&config.charset, config.lossy_decoding)?;

        let _session = MonitorSession::begin(&self.monitor, &self.scratch, config.monitor_grace);
        tracing::debug!(total_chunks, chunk_size, "chunked ingestion");

        let mut reader = ChunkReader::new(decoder, self.scratch.clone());
        let tracker = ProgressTracker::start(total_chunks);
        let mut state = IngestionState::new(
            config.max_preview_rows,
            PreviewBound::Rows,
            config.chunked_row_slack,
        );

        for chunk_index in 0..total_chunks {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            let text = reader.read_chunk(source, state.offset, chunk_size).await?;
            let had_header = state.headers.is_some();
            state.fold_text(&text);
            if let (false, Some(headers)) = (had_header, &state.headers) {
                tracing::debug!(fields = headers.len(), first = ?headers.iter().take(5).collect::<Vec<_>>(), "header detected");
                self.emit(
                    &format!("header detected ({} fields)", headers.len()),
                    tracker.percent(chunk_index),
                );
            }

            state.offset = state.offset.saturating_add(chunk_size as u64).min(size);

            let update = tracker.update(chunk_index, state.offset);
            let message = update.message(size);
            tracing::debug!(percent = update.percent, "{message}");
            self.emit(&message, update.percent);

            if config.yield_every > 0 && chunk_index % config.yield_every == 0 {
                if config.yield_pause.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(config.yield_pause).await;
                }
                self.emit(
                    &format!("{} rows extracted", state.rows.len()),
                    update.percent,
                );
            }
        }

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        state.finish();

        if let Some(stats) = self.monitor.get_memory_stats() {
            tracing::debug!(memory = %stats, "memory after ingestion");
        }

        let report = state.into_report(Strategy::Chunked, total_chunks, size, tracker.elapsed());
        self.emit(&completion_message(&report), 100);
        Ok(report)
    }
}

fn completion_message(report: &IngestReport) -> String {
    format!(
        "done: {} lines scanned, {} rows extracted ({})",
        report.total_lines,
        report.rows.len(),
        format_duration(report.elapsed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold_all(parts: &[&str]) -> IngestionState {
        let mut state = IngestionState::new(100, PreviewBound::Rows, 3);
        for part in parts {
            state.fold_text(part);
            assert!(!state.carry.contains('\n'));
        }
        state.finish();
        state
    }

    #[test]
    fn carry_holds_fragment_after_last_newline() {
        let mut state = IngestionState::new(100, PreviewBound::Rows, 3);
        state.fold_text("id,name\n1,A");
        assert_eq!(state.carry, "1,A");
        state.fold_text("da\n2,");
        assert_eq!(state.carry, "2,");
        assert_eq!(state.rows.len(), 1);
        assert_eq!(state.rows[0].get("name"), Some("Ada"));
    }

    #[test]
    fn fragment_without_newline_only_extends_carry() {
        let state = fold_all(&["id,na", "me", "\n1,x"]);
        assert_eq!(
            state.headers.as_deref(),
            Some(&["id".to_string(), "name".to_string()][..])
        );
        assert_eq!(state.total_lines, 1);
        assert_eq!(state.rows[0].values(), ["1", "x"]);
    }

    #[test]
    fn leading_blank_lines_are_not_the_header() {
        let state = fold_all(&["\n  \r\nid,name\n\n1,x\n"]);
        assert_eq!(state.headers.as_ref().map(|h| h.len()), Some(2));
        assert_eq!(state.total_lines, 1);
    }

    #[test]
    fn row_serializes_in_header_order() {
        let headers: Arc<[String]> = vec!["z".to_string(), "a".to_string()].into();
        let row = Row::zip(&headers, vec!["1".to_string()]);
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"{"z":"1","a":""}"#);
    }
}
