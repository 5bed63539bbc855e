use clap::{Arg, Command};
use csv_async::AsyncWriterBuilder;

const DEPARTMENTS: [&str; 5] = [
    "Finance",
    "Sales, East",
    "Sales, West",
    "R&D \"Lab\"",
    "Operations",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write a synthetic payroll CSV to stdout")
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("no_header")
                .long("no-header")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("extra_cols")
                .long("extra-cols")
                .value_parser(clap::value_parser!(usize))
                .default_value("0"),
        )
        .get_matches();

    let rows: u64 = *matches.get_one("rows").unwrap();
    let with_header = !matches.get_flag("no_header");
    let extra_cols: usize = *matches.get_one("extra_cols").unwrap();

    let mut out = AsyncWriterBuilder::new()
        .has_headers(false)
        .create_writer(tokio::io::stdout());

    if with_header {
        let mut header: Vec<String> = ["사번", "성명", "부서", "직급", "기본급", "수당", "지급일"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        header.extend((1..=extra_cols).map(|i| format!("항목{i}")));
        out.write_record(&header).await?;
    }

    // Deterministic data: employee id, name, department (some quoted), grade, pay fields
    for i in 0..rows {
        let base = 2_800_000 + (i % 40) * 50_000;
        let mut record = vec![
            format!("E{:08}", i),
            format!("Employee {i}"),
            DEPARTMENTS[(i % DEPARTMENTS.len() as u64) as usize].to_string(),
            format!("G{}", i % 7 + 1),
            base.to_string(),
            (base / 10).to_string(),
            format!("2024-{:02}-25", i % 12 + 1),
        ];
        record.extend((1..=extra_cols).map(|c| format!("v{c}_{i}")));
        out.write_record(&record).await?;
        if i % 10_000 == 0 {
            out.flush().await?;
        } // keep buffers moving on huge runs
    }

    out.flush().await?;
    Ok(())
}
