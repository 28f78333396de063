use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use redload::config::{self, IngestConfig};
use redload::dispatch::{self, ArchiveKind, DirectoryReport};
use redload::pipeline::{self, FileReport};
use redload::reader::LineReader;
use redload::stats::IngestionStats;
use redload::store::SqliteStore;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Abandoned records listed per archive in the summary
const MAX_LISTED_ABANDONED: usize = 10;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "redload")]
#[command(about = "Load compressed Reddit archive dumps into SQLite")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the post and comment tables
    Init(DatabaseArgs),
    /// Ingest every submissions/comments archive in a directory
    Ingest(IngestDirArgs),
    /// Ingest a single archive
    IngestFile(IngestFileArgs),
    /// Print compressed size and record count of an archive
    Overview(InputArgs),
    /// Print the first records of an archive
    Inspect(InspectArgs),
}

#[derive(Args)]
struct DatabaseArgs {
    /// SQLite database path or sqlite:/// URL
    #[arg(long, env = "DATABASE_URL")]
    database: String,
}

#[derive(Args)]
struct IngestOptions {
    #[command(flatten)]
    db: DatabaseArgs,

    /// Records per transaction
    #[arg(long, default_value_t = config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Decompressed bytes read per chunk
    #[arg(long, default_value_t = config::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Insert attempts per record before it is abandoned
    #[arg(long, default_value_t = config::MAX_INSERT_ATTEMPTS)]
    max_attempts: u32,

    /// Directory for per-archive checkpoints (disabled when omitted)
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Checkpoint interval in committed batches
    #[arg(long, default_value_t = config::CHECKPOINT_INTERVAL)]
    checkpoint_interval: u32,

    /// Resume from last checkpoint if available
    #[arg(long)]
    resume: bool,

    /// Hide progress spinners
    #[arg(long)]
    no_progress: bool,

    /// Skip schema creation
    #[arg(long)]
    no_init: bool,
}

impl IngestOptions {
    fn to_config(&self, jobs: usize) -> IngestConfig {
        IngestConfig {
            batch_size: self.batch_size,
            chunk_size: self.chunk_size,
            max_attempts: self.max_attempts,
            jobs,
            checkpoint_dir: self.checkpoint_dir.clone(),
            checkpoint_interval: self.checkpoint_interval,
            resume: self.resume,
            show_progress: !self.no_progress,
        }
    }
}

#[derive(Args)]
struct IngestDirArgs {
    /// Directory containing *submissions* and *comments* archives
    #[arg(short, long)]
    dir: PathBuf,

    /// Archives processed in parallel
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    #[command(flatten)]
    opts: IngestOptions,
}

#[derive(Args)]
struct IngestFileArgs {
    /// Path to the archive (.zst, .bz2 or plain NDJSON)
    #[arg(short, long)]
    input: PathBuf,

    /// Record type stored in the archive
    #[arg(long, value_enum)]
    kind: ArchiveKind,

    #[command(flatten)]
    opts: IngestOptions,
}

#[derive(Args)]
struct InputArgs {
    /// Path to the archive
    #[arg(short, long)]
    input: PathBuf,

    /// Decompressed bytes read per chunk
    #[arg(long, default_value_t = config::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

#[derive(Args)]
struct InspectArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Number of lines to show
    #[arg(short = 'n', long, default_value_t = 5)]
    lines: usize,
}

fn open_store(database: &str) -> Result<SqliteStore> {
    SqliteStore::open(config::database_path(database))
}

fn prepare_database(opts: &IngestOptions) -> Result<()> {
    if !opts.no_init {
        open_store(&opts.db.database)?.init_schema()?;
    }
    Ok(())
}

fn run_init(args: DatabaseArgs) -> Result<()> {
    open_store(&args.database)?.init_schema()?;
    println!("Schema ready in {}", config::database_path(&args.database).display());
    Ok(())
}

fn run_ingest(args: IngestDirArgs) -> Result<bool> {
    prepare_database(&args.opts)?;
    let config = args.opts.to_config(args.jobs.max(1));
    let database = args.opts.db.database.clone();

    let start = Instant::now();
    let report = dispatch::ingest_directory(&args.dir, &config, || open_store(&database))?;
    let elapsed = start.elapsed();

    print_directory_report(&report);
    print_totals(&report.totals(), elapsed.as_secs_f64());

    Ok(report.failed() == 0)
}

fn run_ingest_file(args: IngestFileArgs) -> Result<bool> {
    prepare_database(&args.opts)?;
    let config = args.opts.to_config(1);
    let mut store = open_store(&args.opts.db.database)?;

    let start = Instant::now();
    let report = dispatch::ingest_archive(&args.input, args.kind, &config, &mut store)?;
    let elapsed = start.elapsed();

    print_file_report(&args.input, &report);
    print_totals(&report.stats, elapsed.as_secs_f64());

    Ok(report.completed())
}

fn run_overview(args: InputArgs) -> Result<()> {
    let mut reader = LineReader::open_with_chunk_size(&args.input, args.chunk_size)
        .with_context(|| format!("Failed to open archive: {}", args.input.display()))?;
    let overview = reader.overview()?;
    let header = reader.header()?;
    reader.close();

    println!("=== Overview ===");
    println!("File:               {}", args.input.display());
    println!("Codec:              {:?}", reader.codec());
    println!("Compressed size:    {} bytes", overview.file_size_bytes);
    println!("Records:            {}", overview.line_count);
    if let Some(header) = header {
        let keys: Vec<&str> = header.keys().map(String::as_str).collect();
        println!("Fields:             {}", keys.join(", "));
    }
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let path = &args.input.input;
    let mut reader = LineReader::open_with_chunk_size(path, args.input.chunk_size)
        .with_context(|| format!("Failed to open archive: {}", path.display()))?;
    let lines = reader.head(args.lines)?;
    reader.close();

    for (i, line) in lines.iter().enumerate() {
        println!("--- line {} ---", i + 1);
        match pipeline::parse_line(line) {
            Ok(raw) => println!("{}", serde_json::to_string_pretty(&raw)?),
            Err(reason) => println!("[malformed: {reason}] {line}"),
        }
    }
    Ok(())
}

fn print_file_report(path: &Path, report: &FileReport) {
    let status = match &report.aborted {
        None => "ok".to_string(),
        Some(e) => format!("aborted ({e})"),
    };
    println!(
        "{:<40} {:>10} committed {:>8} malformed {:>6} abandoned  {}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        report.stats.records_committed,
        report.stats.malformed_lines,
        report.stats.records_abandoned,
        status
    );
    for err in report.abandoned.iter().take(MAX_LISTED_ABANDONED) {
        println!("    {err}");
    }
    if report.abandoned.len() > MAX_LISTED_ABANDONED {
        println!("    ... {} more", report.abandoned.len() - MAX_LISTED_ABANDONED);
    }
}

fn print_directory_report(report: &DirectoryReport) {
    println!();
    println!("=== Files ===");
    for file in &report.files {
        match &file.result {
            Ok(r) => print_file_report(&file.path, r),
            Err(e) => println!("{:<40} failed: {:#}", file.path.display(), e),
        }
    }
    for path in &report.skipped {
        println!("{:<40} skipped", path.display());
    }
}

fn print_totals(stats: &IngestionStats, secs: f64) {
    println!();
    println!("=== Summary ===");
    println!("Total time:         {:.2}s", secs);
    println!("Lines read:         {}", stats.lines_read);
    println!("Lines skipped:      {}", stats.lines_skipped);
    println!("Malformed lines:    {}", stats.malformed_lines);
    println!("Records parsed:     {}", stats.records_parsed);
    println!("Records committed:  {}", stats.records_committed);
    println!("Collisions:         {}", stats.collisions);
    println!("Records renamed:    {}", stats.records_renamed);
    println!("Records abandoned:  {}", stats.records_abandoned);
    println!("Rows rolled back:   {}", stats.rows_rolled_back);
    println!(
        "Batches:            {} committed, {} failed",
        stats.batches_committed, stats.batches_failed
    );
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let result = match cli.command {
        Commands::Init(args) => run_init(args).map(|()| true),
        Commands::Ingest(args) => run_ingest(args),
        Commands::IngestFile(args) => run_ingest_file(args),
        Commands::Overview(args) => run_overview(args).map(|()| true),
        Commands::Inspect(args) => run_inspect(args).map(|()| true),
    };

    match result {
        Ok(true) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            error!("Completed with failed archives");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
