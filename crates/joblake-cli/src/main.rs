use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use joblake_fetch::{ApiConfig, JobSearchClient};
use joblake_ingest::{IngestConfig, IngestPipeline};
use joblake_storage::LocalObjectStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "joblake")]
#[command(about = "Ingest job postings into partitioned parquet tables")]
struct Cli {
    /// Maximum number of API pages to fetch (pagination may stop earlier).
    #[arg(long, default_value_t = 2)]
    pages: u32,

    /// Records requested per page.
    #[arg(long = "per_page", default_value_t = 50)]
    per_page: u32,

    /// Object-store root; overrides JOBLAKE_DATA_DIR.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let api = ApiConfig::from_env()?;
    let mut config = IngestConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let client = JobSearchClient::new(api)?;
    let store = LocalObjectStore::new(config.data_dir.clone());
    let pipeline =
        IngestPipeline::new(Box::new(client), Box::new(store)).with_archive_raw(config.archive_raw);

    let summary = pipeline.run_ingestion(cli.pages, cli.per_page).await?;
    println!(
        "ingest complete: run_id={} pages={} records={} partitions={}",
        summary.run_id,
        summary.pages_fetched,
        summary.records_ingested,
        summary
            .partitions
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );
    for (table, rows) in &summary.persisted_rows {
        println!("  {table}: {rows} rows");
    }

    Ok(())
}
