//! Progress reporting for chunked runs.
//!
//! Reporting is a side channel: a run behaves identically with or without a sink attached.

use std::time::Duration;

use tokio::time::Instant;

/// Receives `(message, percent)` status updates. Percent is within `[5, 95]` while chunks are
/// processed and exactly 100 on completion.
pub trait StatusSink: Send + Sync {
    fn update(&self, message: &str, percent: u8);
}

impl<F> StatusSink for F
where
    F: Fn(&str, u8) + Send + Sync,
{
    fn update(&self, message: &str, percent: u8) {
        self(message, percent)
    }
}

/// Snapshot emitted after each chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub offset: u64,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub elapsed: Duration,
    /// Bytes per second since the run started.
    pub throughput: f64,
    pub eta: Duration,
    pub percent: u8,
}

impl ProgressUpdate {
    pub fn message(&self, total_size: u64) -> String {
        let eta = if self.eta.is_zero() {
            "done".to_string()
        } else {
            format_duration(self.eta)
        };
        format!(
            "chunk {}/{} | {}/{} | {}/s | ETA: {}",
            self.chunk_index + 1,
            self.total_chunks,
            format_bytes(self.offset),
            format_bytes(total_size),
            format_bytes(self.throughput as u64),
            eta
        )
    }
}

/// Derives percent, throughput and ETA for a chunked run.
#[derive(Debug)]
pub struct ProgressTracker {
    total_chunks: usize,
    started: Instant,
}

impl ProgressTracker {
    pub fn start(total_chunks: usize) -> Self {
        Self {
            total_chunks,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn percent(&self, chunk_index: usize) -> u8 {
        chunk_percent(chunk_index, self.total_chunks)
    }

    pub fn update(&self, chunk_index: usize, offset: u64) -> ProgressUpdate {
        let elapsed = self.elapsed();
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 { offset as f64 / secs } else { 0.0 };
        let done = chunk_index as f64 + 1.0;
        let remaining = self.total_chunks.saturating_sub(chunk_index + 1);
        ProgressUpdate {
            offset,
            chunk_index,
            total_chunks: self.total_chunks,
            elapsed,
            throughput,
            eta: Duration::try_from_secs_f64(secs / done * remaining as f64)
                .unwrap_or(Duration::MAX),
            percent: self.percent(chunk_index),
        }
    }
}

/// `round(chunk_index / total_chunks * 90) + 5`
pub fn chunk_percent(chunk_index: usize, total_chunks: usize) -> u8 {
    if total_chunks == 0 {
        return 5;
    }
    let ratio = (chunk_index as f64 / total_chunks as f64).clamp(0.0, 1.0);
    (ratio * 90.0).round() as u8 + 5
}

/// `1536` -> `"1.5 KB"`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", rounded, UNITS[unit])
    }
}

/// `Nms` under a second, `N.Ns` under a minute, `Nm Ns` beyond.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_stays_within_processing_band() {
        assert_eq!(chunk_percent(0, 10), 5);
        assert_eq!(chunk_percent(5, 10), 50);
        assert_eq!(chunk_percent(9, 10), 86);
        assert_eq!(chunk_percent(0, 1), 5);
        assert_eq!(chunk_percent(0, 0), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn eta_is_projected_from_the_average_chunk_time() {
        let tracker = ProgressTracker::start(10);
        tokio::time::advance(Duration::from_secs(4)).await;
        let update = tracker.update(1, 2048);
        assert_eq!(update.eta, Duration::from_secs(16));
        assert_eq!(update.throughput, 512.0);
    }

    #[cfg(target_pointer_width = "64")]
    #[tokio::test(start_paused = true)]
    async fn eta_survives_chunk_counts_beyond_u32() {
        let half = u32::MAX as usize * 2;
        let tracker = ProgressTracker::start(half * 2);
        tokio::time::advance(Duration::from_secs(10)).await;
        let eta = tracker.update(half - 1, 0).eta.as_secs_f64();
        assert!((eta - 10.0).abs() < 0.01, "eta {eta}");
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3 GB");
    }

    #[test]
    fn durations_are_humanized() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1_500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    }
}
