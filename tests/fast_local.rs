#![cfg(feature = "fast_local")]

use payroll_ingest::{
    BytesSource, CancellationToken, IngestConfig, IngestReport, IngestionSource, MmapSource,
    StreamingCsvIngestor,
};
use std::time::Duration;

const SAMPLE: &str = "사번,성명,부서,기본급\n\
E001,김민수,\"Sales, East\",3000000\n\
E002,이영희,Finance,3200000\n\
\n\
E003,박지훈,\"R&D, \"\"Lab\"\"\",2900000";

fn chunked(width: usize) -> IngestConfig {
    IngestConfig::default()
        .large_file_threshold(0)
        .chunk_size(width)
        .yield_pause(Duration::ZERO)
        .monitor_grace(Duration::ZERO)
}

async fn run<S: IngestionSource>(source: &S, config: &IngestConfig) -> anyhow::Result<IngestReport> {
    Ok(StreamingCsvIngestor::new()
        .ingest(source, config, &CancellationToken::new())
        .await?)
}

fn cells(report: &IngestReport) -> Vec<Vec<String>> {
    report.rows.iter().map(|r| r.values().to_vec()).collect()
}

#[tokio::test]
async fn mapped_file_matches_in_memory_source_at_every_width() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("급여.csv");
    std::fs::write(&path, SAMPLE)?;

    let mapped = MmapSource::open(&path)?;
    let memory = BytesSource::new("급여.csv", SAMPLE.as_bytes().to_vec());
    assert_eq!(mapped.size(), memory.size());
    assert_eq!(mapped.name(), "급여.csv");

    for width in 1..=SAMPLE.len() + 1 {
        let config = chunked(width);
        let from_map = run(&mapped, &config).await?;
        let from_memory = run(&memory, &config).await?;
        assert_eq!(cells(&from_map), cells(&from_memory), "width {width}");
        assert_eq!(from_map.total_lines, 3);
        assert_eq!(from_map.headers, from_memory.headers);
    }
    Ok(())
}

#[tokio::test]
async fn empty_mapped_file_yields_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("empty.csv");
    std::fs::write(&path, "")?;

    let mapped = MmapSource::open(&path)?;
    assert_eq!(mapped.size(), 0);
    for config in [IngestConfig::default(), chunked(4)] {
        let report = run(&mapped, &config).await?;
        assert!(report.rows.is_empty());
        assert_eq!(report.headers, None);
    }
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = MmapSource::open(&dir.path().join("absent.csv")).err().unwrap();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}
