// src/main.rs
//! chain-anomaly command line entry point
//! Converts raw ledger dumps, enriches transactions and runs detection.
use anyhow::{Context, Result};
use chain_anomaly::anomaly_detection::{
    ingest, storage, AnomalyDetectionConfig, AnomalyPipeline, FeatureExtractor, FeatureSchema,
    FileExporter, LoggingSubscriber, ReportExporter, TransactionRecord,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "chain-anomaly")]
#[command(about = "Transaction anomaly detection with feature attribution")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert raw ledger blocks or transactions into records
    Convert(ConvertArgs),
    /// Enrich records with derived features
    Enrich(EnrichArgs),
    /// Run the full detection pipeline and export results
    Detect(DetectArgs),
}

#[derive(ClapArgs)]
struct ConvertArgs {
    /// Raw JSON: a block, a list of blocks, or a list of transactions
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    /// Transactions kept from each block
    #[arg(long, default_value_t = ingest::DEFAULT_TX_PER_BLOCK)]
    limit_per_block: usize,
}

#[derive(ClapArgs)]
struct EnrichArgs {
    /// JSON array of transaction records
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
}

#[derive(ClapArgs)]
struct DetectArgs {
    /// JSON array of transaction records
    #[arg(long)]
    input: PathBuf,
    /// Directory for result.json, variable.json and result.csv
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Configuration file (.json or .toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Expected share of anomalies, in (0, 0.5]
    #[arg(long)]
    contamination: Option<f64>,
    /// Number of isolation trees
    #[arg(long)]
    trees: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// Comma-separated feature names
    #[arg(long)]
    features: Option<String>,
    /// Treat the input as a raw ledger payload
    #[arg(long)]
    raw: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging()?;

    match args.command {
        Commands::Convert(convert) => run_convert(convert),
        Commands::Enrich(enrich) => run_enrich(enrich),
        Commands::Detect(detect) => run_detect(detect),
    }
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn run_convert(args: ConvertArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let records = ingest::records_from_json(&raw, args.limit_per_block)
        .with_context(|| format!("parsing {}", args.input.display()))?;
    storage::write_json(&args.output, &records)?;
    info!(records = records.len(), output = %args.output.display(), "converted");
    Ok(())
}

fn run_enrich(args: EnrichArgs) -> Result<()> {
    let records: Vec<TransactionRecord> = storage::read_json(&args.input)
        .with_context(|| format!("reading records from {}", args.input.display()))?;
    let enriched = FeatureExtractor::new().enrich_batch(&records);
    storage::write_json(&args.output, &enriched)?;
    info!(records = enriched.len(), output = %args.output.display(), "enriched");
    Ok(())
}

fn load_config(args: &DetectArgs) -> Result<AnomalyDetectionConfig> {
    let mut config = match &args.config {
        Some(path) => AnomalyDetectionConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AnomalyDetectionConfig::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;

    if let Some(contamination) = args.contamination {
        config.model.contamination = contamination;
    }
    if let Some(trees) = args.trees {
        config.model.n_estimators = trees;
    }
    if let Some(seed) = args.seed {
        config.model.seed = Some(seed);
        config.attribution.seed = Some(seed);
    }
    if let Some(features) = &args.features {
        config.features.schema = FeatureSchema::parse_list(features)?;
    }
    if let Some(out_dir) = &args.out_dir {
        config.output.out_dir = out_dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run_detect(args: DetectArgs) -> Result<()> {
    let config = load_config(&args)?;

    let records: Vec<TransactionRecord> = if args.raw {
        let raw = std::fs::read_to_string(&args.input)
            .with_context(|| format!("reading {}", args.input.display()))?;
        ingest::records_from_json(&raw, config.features.limit_per_block)?
    } else {
        storage::read_json(&args.input)
            .with_context(|| format!("reading records from {}", args.input.display()))?
    };

    let mut pipeline = AnomalyPipeline::with_config(config.clone())?;
    pipeline
        .event_bus()
        .subscribe(Arc::new(LoggingSubscriber::new("cli")));

    let report = pipeline.run(&records).context("detection failed")?;
    let written = FileExporter::new(config.output.clone()).export(&report)?;

    println!("{}", report.summary);
    for importance in report.attribution.ranked() {
        println!("  {:<18} {:.6}", importance.variable.name(), importance.value);
    }
    for path in written {
        println!("wrote {}", path.display());
    }
    Ok(())
}
