use std::time::Duration;

use serde::Deserialize;

/// Tunables for one ingestion run. Passed explicitly to every call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Sources larger than this many bytes take the chunked path (default: 10 MiB).
    pub large_file_threshold: u64,
    /// Width of one chunk in bytes (default: 1 MiB).
    pub chunk_size: usize,
    /// Upper bound on materialized rows (default: 5000).
    pub max_preview_rows: usize,
    /// Missing trailing fields tolerated on the chunked path.
    pub chunked_row_slack: usize,
    /// Missing trailing fields tolerated on the single-pass path.
    pub single_pass_row_slack: usize,
    /// Yield to the runtime every this many chunks (0 disables).
    pub yield_every: usize,
    #[serde(with = "millis")]
    pub yield_pause: Duration,
    /// Delay before the memory monitor is stopped after a chunked run.
    #[serde(with = "millis")]
    pub monitor_grace: Duration,
    /// WHATWG encoding label of the source bytes.
    pub charset: String,
    /// Replace malformed byte sequences with U+FFFD instead of failing the read.
    pub lossy_decoding: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            large_file_threshold: 10 * 1024 * 1024, // 10 MiB
            chunk_size: 1024 * 1024,                // 1 MiB
            max_preview_rows: 5_000,
            chunked_row_slack: 3,
            single_pass_row_slack: 2,
            yield_every: 5,
            yield_pause: Duration::from_millis(20),
            monitor_grace: Duration::from_secs(3),
            charset: "utf-8".to_string(),
            lossy_decoding: false,
        }
    }
}

impl IngestConfig {
    pub fn large_file_threshold(mut self, bytes: u64) -> Self {
        self.large_file_threshold = bytes;
        self
    }

    /// Sets the chunk width; values below one byte are raised to one.
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn max_preview_rows(mut self, rows: usize) -> Self {
        self.max_preview_rows = rows;
        self
    }

    pub fn yield_pause(mut self, pause: Duration) -> Self {
        self.yield_pause = pause;
        self
    }

    pub fn monitor_grace(mut self, grace: Duration) -> Self {
        self.monitor_grace = grace;
        self
    }

    pub fn charset(mut self, label: impl Into<String>) -> Self {
        self.charset = label.into();
        self
    }

    pub fn lossy_decoding(mut self, lossy: bool) -> Self {
        self.lossy_decoding = lossy;
        self
    }

    /// Load from a JSON document; absent keys keep their defaults.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub(crate) fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_overrides_only_given_keys() {
        let config =
            IngestConfig::from_json(r#"{"chunk_size": 4096, "yield_pause": 0, "charset": "euc-kr"}"#)
                .unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.yield_pause, Duration::ZERO);
        assert_eq!(config.charset, "euc-kr");
        assert_eq!(config.max_preview_rows, 5_000);
        assert_eq!(config.large_file_threshold, 10 * 1024 * 1024);
    }
}
