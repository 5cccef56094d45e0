use nyc_sales_ingest::config::PipelineConfig;
use nyc_sales_ingest::ingestion::{
    CheckpointStore, FileCheckpointStore, FixtureSource, PageSource, Pipeline, RawSink, RunOptions,
    RunStatus, SocrataSource,
};
use nyc_sales_ingest::store::{export_records, query, ExportFormat};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nyc-sales-ingest")]
#[command(about = "Ingest and normalize NYC rolling property sales")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, clean and load the dataset, resuming from the last checkpoint
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Read records from a CSV file instead of the remote API
        #[arg(long)]
        fixture: Option<PathBuf>,

        /// Rebuild the table from landed raw pages without fetching
        #[arg(long)]
        replay_only: bool,

        /// Stop after fetching this many pages (resume later)
        #[arg(long)]
        max_pages: Option<u64>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget fetch progress and delete landed raw pages
    ResetCheckpoint {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Show checkpoint, landed pages and the live generation
    Status {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Per-borough statistics over the live table
    Stats {
        #[command(flatten)]
        config: ConfigArgs,

        #[arg(long)]
        json: bool,
    },
    /// Export the live table to CSV or Parquet
    Export {
        /// Output file
        output: PathBuf,

        /// csv or parquet (default: from the file extension)
        #[arg(long)]
        format: Option<String>,

        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Show remote dataset metadata
    Info {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(ClapArgs, Debug, Default)]
struct ConfigArgs {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for checkpoint, raw pages and the store (default: ./data)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Socrata dataset id
    #[arg(long)]
    dataset_id: Option<String>,

    /// Socrata app token (or set SOCRATA_APP_TOKEN)
    #[arg(long)]
    app_token: Option<String>,

    /// Records per page
    #[arg(long)]
    page_size: Option<usize>,

    /// Minimum gap between requests in milliseconds
    #[arg(long)]
    min_interval_ms: Option<u64>,

    #[arg(long)]
    max_attempts: Option<u32>,

    /// Outlier fence width in IQRs
    #[arg(long)]
    outlier_iqr_multiple: Option<f64>,

    /// Only sales on or after this date (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Only sales on or before this date (YYYY-MM-DD)
    #[arg(long)]
    end_date: Option<NaiveDate>,

    /// Only sales from the last N days
    #[arg(long, conflicts_with = "start_date")]
    days: Option<u32>,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<PipelineConfig> {
        let config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        let mut config = config.with_env()?;

        if let Some(v) = &self.data_dir {
            config.data_dir = v.clone();
        }
        if let Some(v) = &self.dataset_id {
            config.dataset_id = v.clone();
        }
        if let Some(v) = &self.app_token {
            config.app_token = Some(v.clone());
        }
        if let Some(v) = self.page_size {
            config.page_size = v;
        }
        if let Some(v) = self.min_interval_ms {
            config.min_request_interval_ms = v;
        }
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        if let Some(v) = self.outlier_iqr_multiple {
            config.outlier_iqr_multiple = v;
        }
        if let Some(v) = self.start_date {
            config.start_date = Some(v);
        }
        if let Some(v) = self.end_date {
            config.end_date = Some(v);
        }
        if let Some(days) = self.days {
            config = config.with_last_days(days, Utc::now().date_naive())?;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run { config, fixture, replay_only, max_pages, json } => {
            run(config.resolve()?, fixture, RunOptions { replay_only, max_pages }, json).await
        }
        Commands::ResetCheckpoint { config } => reset_checkpoint(config.resolve()?),
        Commands::Status { config } => status(config.resolve()?),
        Commands::Stats { config, json } => stats(config.resolve()?, json),
        Commands::Export { output, format, config } => export(config.resolve()?, output, format),
        Commands::Info { config } => dataset_info(config.resolve()?).await,
    }
}

async fn run(config: PipelineConfig, fixture: Option<PathBuf>, options: RunOptions, json: bool) -> Result<()> {
    let source: Box<dyn PageSource> = match &fixture {
        Some(path) => {
            info!(fixture = %path.display(), "Reading records from fixture");
            Box::new(FixtureSource::from_csv_file(path)?)
        }
        None => Box::new(SocrataSource::new(&config)?),
    };

    let mut pipeline = Pipeline::from_config(&config, source).context("Failed to set up pipeline")?;

    let stop = pipeline.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current page");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let summary = pipeline.run(&options).await.context("Ingestion run failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("\n{}", "=".repeat(60));
        println!("{}", summary);
        println!("{}", "=".repeat(60));
        if summary.status == RunStatus::Interrupted {
            println!("Run stopped early. Rerun to resume from the checkpoint.");
        }
    }
    Ok(())
}

fn reset_checkpoint(config: PipelineConfig) -> Result<()> {
    FileCheckpointStore::new(config.checkpoint_path()).reset()?;
    let removed = RawSink::open(config.raw_dir())?.clear()?;
    println!("Checkpoint cleared, {} raw page(s) removed.", removed);
    Ok(())
}

fn status(config: PipelineConfig) -> Result<()> {
    let checkpoint = FileCheckpointStore::new(config.checkpoint_path()).load()?;
    let landed = RawSink::open(config.raw_dir())?.sequences()?;

    println!("Data directory: {}", config.data_dir.display());
    match checkpoint {
        Some(cp) => {
            println!("Checkpoint:");
            println!("  offset:       {}", cp.offset);
            println!("  records:      {}", cp.total_fetched);
            println!("  pages:        {}", cp.pages_fetched);
            println!("  last success: {}", cp.last_success_time.to_rfc3339());
        }
        None => println!("Checkpoint: none (next run starts at the beginning)"),
    }
    println!("Landed raw pages: {}", landed.len());

    if !config.store_path().exists() {
        println!("Store: not created yet");
        return Ok(());
    }
    let conn = query::open_reader(config.store_path())?;
    match query::current_generation(&conn)? {
        Some(generation) => println!(
            "Live generation {} from run {} at {}: {} rows, {} outliers",
            generation.generation,
            generation.run_id,
            generation.committed_at,
            generation.row_count,
            generation.outlier_count
        ),
        None => println!("Store: no generation committed yet"),
    }
    Ok(())
}

fn stats(config: PipelineConfig, json: bool) -> Result<()> {
    if !config.store_path().exists() {
        println!("Store not found at {}; run the pipeline first.", config.store_path().display());
        return Ok(());
    }
    let conn = query::open_reader(config.store_path())?;
    let stats = query::borough_stats(&conn)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!(
        "{:<15} {:>12} {:>9} {:>16} {:>12}",
        "Borough", "Sales", "Outliers", "Avg price", "Avg $/sqft"
    );
    println!("{}", "-".repeat(68));
    for s in &stats {
        println!(
            "{:<15} {:>12} {:>9} {:>16.0} {:>12}",
            s.borough.as_str(),
            s.transactions,
            s.outliers,
            s.avg_sale_price,
            s.avg_price_per_sqft
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!("{}", "-".repeat(68));
    println!("Total rows: {}", query::row_count(&conn)?);
    Ok(())
}

fn export(config: PipelineConfig, output: PathBuf, format: Option<String>) -> Result<()> {
    let format = match format {
        Some(f) => f.parse::<ExportFormat>()?,
        None => ExportFormat::from_path(&output),
    };
    let conn = query::open_reader(config.store_path())
        .with_context(|| format!("Failed to open store {}", config.store_path().display()))?;
    let records = query::all_records(&conn)?;
    let rows = export_records(&records, &output, format)?;
    println!("Exported {} row(s) to {}", rows, output.display());
    Ok(())
}

async fn dataset_info(config: PipelineConfig) -> Result<()> {
    let source = SocrataSource::new(&config)?;
    let info = source
        .dataset_info()
        .await
        .context("Failed to fetch dataset metadata")?;

    println!("Dataset:  {}", config.dataset_id);
    println!("Name:     {}", info.name.as_deref().unwrap_or("-"));
    if let Some(updated) = info
        .rows_updated_at
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    {
        println!("Updated:  {}", updated.to_rfc3339());
    }
    if let Some(description) = &info.description {
        println!("About:    {}", description.lines().next().unwrap_or(""));
    }
    println!("Columns ({}):", info.columns.len());
    for column in &info.columns {
        println!(
            "  {:<40} {:<30} {}",
            column.name,
            column.field_name.as_deref().unwrap_or("-"),
            column.data_type_name.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
