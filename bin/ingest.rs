use clap::{Arg, ArgAction, Command};
use crc32fast::Hasher as Crc32;
use payroll_ingest::{
    ingest_and_save, source_from_path, CancellationToken, IngestConfig, IngestionSource,
    StreamingCsvIngestor, UploadStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let matches = Command::new("ingest")
        .about("Ingest a payroll CSV and print a summary")
        .arg(Arg::new("path").long("path").required(true).value_parser(clap::value_parser!(PathBuf)))
        .arg(Arg::new("config").long("config").help("JSON file with ingestion settings").value_parser(clap::value_parser!(PathBuf)))
        .arg(Arg::new("threshold").long("threshold").help("Bytes above which the chunked path is used").value_parser(clap::value_parser!(u64)))
        .arg(Arg::new("chunk-size").long("chunk-size").value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("max-rows").long("max-rows").help("Maximum preview rows to materialize").value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("charset").long("charset").help("Source encoding label, e.g. utf-8 or euc-kr"))
        .arg(Arg::new("lossy").long("lossy").help("Replace malformed bytes instead of failing").action(ArgAction::SetTrue))
        .arg(Arg::new("save-dir").long("save-dir").help("Persist extracted rows as JSON into this directory").value_parser(clap::value_parser!(PathBuf)))
        .arg(Arg::new("fast-local").long("fast-local").help("Memory-map the file instead of reading it (feature: fast_local)").action(ArgAction::SetTrue))
        .arg(Arg::new("crc").long("crc").help("Print a CRC32 over the extracted rows").action(ArgAction::SetTrue))
        .get_matches();

    let path = matches.get_one::<PathBuf>("path").unwrap();
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(p) => IngestConfig::from_json(&tokio::fs::read_to_string(p).await?)?,
        None => IngestConfig::default(),
    };
    if let Some(&t) = matches.get_one::<u64>("threshold") {
        config = config.large_file_threshold(t);
    }
    if let Some(&c) = matches.get_one::<usize>("chunk-size") {
        config = config.chunk_size(c);
    }
    if let Some(&m) = matches.get_one::<usize>("max-rows") {
        config = config.max_preview_rows(m);
    }
    if let Some(label) = matches.get_one::<String>("charset") {
        config = config.charset(label.clone());
    }
    if matches.get_flag("lossy") {
        config = config.lossy_decoding(true);
    }

    let source = open_source(path, matches.get_flag("fast-local")).await?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("cancellation requested");
                cancel.cancel();
            }
        });
    }

    let last_percent = Arc::new(std::sync::atomic::AtomicU8::new(0));
    let ingestor = StreamingCsvIngestor::new().with_status_sink(move |message: &str, percent: u8| {
        let prev = last_percent.swap(percent, std::sync::atomic::Ordering::Relaxed);
        if percent != prev || percent == 100 {
            eprintln!("[{percent:>3}%] {message}");
        }
    });

    let report = match matches.get_one::<PathBuf>("save-dir") {
        Some(dir) => {
            let store = UploadStore::open(dir.clone()).await?;
            let (report, saved) = ingest_and_save(&ingestor, &*source, &config, &cancel, &store).await?;
            println!("saved={} records={}", saved.file_name, saved.record_count);
            report
        }
        None => ingestor.ingest(&*source, &config, &cancel).await?,
    };

    let elapsed = report.elapsed.as_secs_f64();
    let lps = if elapsed > 0.0 { report.total_lines as f64 / elapsed } else { 0.0 };
    println!(
        "source={} strategy={:?} chunks={} lines={} rows={} headers={:?}\nelapsed={:.1}s lines/sec={:.0}",
        source.name(),
        report.strategy,
        report.total_chunks,
        report.total_lines,
        report.rows.len(),
        report.headers.as_deref().unwrap_or_default(),
        elapsed,
        lps
    );

    if matches.get_flag("crc") {
        // CRC32 over all cells, fields separated by '\x1f' and rows by '\x1e'
        let mut crc = Crc32::new();
        for row in &report.rows {
            for (fi, value) in row.values().iter().enumerate() {
                if fi > 0 {
                    crc.update(&[0x1f]);
                }
                crc.update(value.as_bytes());
            }
            crc.update(&[0x1e]);
        }
        println!("crc=0x{:08x}", crc.finalize());
    }
    Ok(())
}

async fn open_source(path: &Path, fast_local: bool) -> anyhow::Result<Box<dyn IngestionSource>> {
    #[cfg(feature = "fast_local")]
    if fast_local {
        return Ok(Box::new(payroll_ingest::MmapSource::open(path)?));
    }
    #[cfg(not(feature = "fast_local"))]
    if fast_local {
        anyhow::bail!("--fast-local requires building with the fast_local feature");
    }
    Ok(Box::new(source_from_path(path).await?))
}
