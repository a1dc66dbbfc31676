//! # Backstop CLI
//!
//! Command-line front end for the Backstop integrity and backup engine.
//!
//! ## Usage
//! ```bash
//! # Hash files
//! backstop checksum src/app.css src/theme.css --algorithm sha512
//!
//! # Back up before rewriting, restore afterwards
//! backstop backup src/app.css
//! backstop restore src/app.css            # latest backup
//!
//! # Backup strategies
//! backstop incremental src/app.css
//! backstop differential src/app.css
//!
//! # Whole project
//! backstop batch checksum src/
//! ```

use anyhow::{bail, Context};
use backstop::batch::BatchOptions;
use backstop::utils::{collect_files, format_bytes};
use backstop::{
    Backstop, BackstopConfig, BackstopError, BatchOperation, BatchStrategy, ErrorAction,
    HashAlgorithm, ItemOutcome,
};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Backstop CLI - checksums, verified backups and rollback for project files
#[derive(Parser)]
#[command(name = "backstop")]
#[command(version)]
#[command(about = "Verified backups and rollback for files about to be rewritten")]
#[command(long_about = None)]
struct Cli {
    /// Project root (defaults to current directory)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// JSON configuration file (defaults to <root>/backstop.json when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute checksums
    #[command(alias = "sum")]
    Checksum {
        /// Files to hash
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Hash algorithm (defaults to the configured one)
        #[arg(short, long, value_enum)]
        algorithm: Option<AlgorithmArg>,
    },

    /// Check a file against an expected hex digest
    Validate {
        /// File to check
        file: PathBuf,

        /// Expected hex digest
        expected: String,
    },

    /// Compare two files by content
    Compare {
        /// First file
        left: PathBuf,

        /// Second file
        right: PathBuf,
    },

    /// Create verified backups
    Backup {
        /// Files to back up
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Restore a file from a backup
    #[command(alias = "rs")]
    Restore {
        /// File to restore
        target: PathBuf,

        /// Backup artifact (defaults to the newest backup of the file)
        artifact: Option<PathBuf>,
    },

    /// Delete backups older than the retention period
    Cleanup,

    /// List backups
    #[command(alias = "ls")]
    List {
        /// Only backups of this file
        file: Option<PathBuf>,

        /// Limit results
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Store files in the deduplication store, linking duplicates
    Dedup {
        /// Files to deduplicate
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Incremental backups (skipped when unchanged)
    Incremental {
        /// Files to back up
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Differential backups against the latest full backup
    Differential {
        /// Files to back up
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Run an operation over every file below a directory
    Batch {
        /// Operation to run
        #[arg(value_enum)]
        operation: OperationArg,

        /// Directory or file
        path: PathBuf,

        /// Scheduling strategy
        #[arg(short, long, value_enum)]
        strategy: Option<StrategyArg>,

        /// JSON object mapping paths to expected digests (validate)
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Stop at the first failure
        #[arg(long)]
        fail_fast: bool,
    },

    /// Show engine statistics
    Stats,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum AlgorithmArg {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl From<AlgorithmArg> for HashAlgorithm {
    fn from(value: AlgorithmArg) -> Self {
        match value {
            AlgorithmArg::Md5 => HashAlgorithm::Md5,
            AlgorithmArg::Sha1 => HashAlgorithm::Sha1,
            AlgorithmArg::Sha256 => HashAlgorithm::Sha256,
            AlgorithmArg::Sha512 => HashAlgorithm::Sha512,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum OperationArg {
    Checksum,
    Backup,
    Validate,
}

impl From<OperationArg> for BatchOperation {
    fn from(value: OperationArg) -> Self {
        match value {
            OperationArg::Checksum => BatchOperation::Checksum,
            OperationArg::Backup => BatchOperation::Backup,
            OperationArg::Validate => BatchOperation::Validate,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum StrategyArg {
    Sequential,
    Parallel,
    Adaptive,
}

impl From<StrategyArg> for BatchStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Sequential => BatchStrategy::Sequential,
            StrategyArg::Parallel => BatchStrategy::Parallel,
            StrategyArg::Adaptive => BatchStrategy::Adaptive,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("backstop=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        let message = match e.downcast_ref::<BackstopError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

/// Main command runner
async fn run(cli: Cli) -> anyhow::Result<()> {
    let root = cli.root.clone().unwrap_or_else(|| PathBuf::from("."));
    let mut config = load_config(&root, cli.config.as_deref())?;

    // Commands that need an optional component switch it on
    match &cli.command {
        Commands::Dedup { .. } => config.deduplication.enabled = true,
        Commands::Incremental { .. } => config.incremental.enabled = true,
        Commands::Differential { .. } => config.differential.enabled = true,
        Commands::Restore { .. } | Commands::Cleanup => {
            // Deduplicated artifacts need the store to be read or released
            config.deduplication.enabled |= config.deduplication_directory().is_dir();
        }
        Commands::Stats => {
            // Report on components that have state on disk
            config.deduplication.enabled |= config.deduplication_directory().is_dir();
            config.incremental.enabled |= config.incremental_directory().is_dir();
            config.differential.enabled |= config.differential_directory().is_dir();
        }
        _ => {}
    }

    let backstop = Backstop::new(config).await?;
    let json = cli.json;

    match cli.command {
        Commands::Checksum { files, algorithm } => cmd_checksum(&backstop, files, algorithm, json).await,
        Commands::Validate { file, expected } => cmd_validate(&backstop, &file, expected, json).await,
        Commands::Compare { left, right } => cmd_compare(&backstop, &left, &right, json).await,
        Commands::Backup { files } => cmd_backup(&backstop, files, json).await,
        Commands::Restore { target, artifact } => cmd_restore(&backstop, &target, artifact, json).await,
        Commands::Cleanup => cmd_cleanup(&backstop, json).await,
        Commands::List { file, limit } => cmd_list(&backstop, file, limit, json).await,
        Commands::Dedup { files } => cmd_dedup(&backstop, files, json).await,
        Commands::Incremental { files } => cmd_incremental(&backstop, files, json).await,
        Commands::Differential { files } => cmd_differential(&backstop, files, json).await,
        Commands::Batch {
            operation,
            path,
            strategy,
            manifest,
            fail_fast,
        } => cmd_batch(&backstop, operation, &path, strategy, manifest, fail_fast, json).await,
        Commands::Stats => cmd_stats(&backstop, json).await,
    }
}

fn load_config(root: &Path, explicit: Option<&Path>) -> anyhow::Result<BackstopConfig> {
    let default_path = root.join("backstop.json");
    let mut config = match explicit {
        Some(path) => BackstopConfig::from_json_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None if default_path.is_file() => BackstopConfig::from_json_file(&default_path)
            .with_context(|| format!("loading configuration {}", default_path.display()))?,
        None => BackstopConfig::default(),
    };
    config.root = root.to_path_buf();
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn spinner(message: &str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

async fn cmd_checksum(
    backstop: &Backstop,
    files: Vec<PathBuf>,
    algorithm: Option<AlgorithmArg>,
    json: bool,
) -> anyhow::Result<()> {
    let algorithm = algorithm
        .map(HashAlgorithm::from)
        .unwrap_or(backstop.config().checksum.algorithm);
    let mut records = Vec::with_capacity(files.len());
    for file in &files {
        records.push(backstop.calculate_checksum_with(file, algorithm).await?);
    }

    if json {
        return print_json(&records);
    }
    for record in &records {
        println!("{}  {}", record.hex().yellow(), record.file_path.display());
    }
    Ok(())
}

async fn cmd_validate(backstop: &Backstop, file: &Path, expected: String, json: bool) -> anyhow::Result<()> {
    let outcome = backstop.validate_file(file, expected).await;
    if json {
        return print_json(&outcome);
    }

    if outcome.is_valid {
        println!("{} {} ({})", "✓".green().bold(), file.display(), outcome.algorithm);
    } else {
        println!("{} {} ({})", "✗".red().bold(), file.display(), outcome.algorithm);
        println!("  Expected: {}", outcome.expected.yellow());
        match (&outcome.observed, &outcome.error) {
            (Some(observed), _) => println!("  Observed: {}", observed.red()),
            (None, Some(error)) => println!("  Error: {}", error.red()),
            (None, None) => {}
        }
        std::process::exit(2);
    }
    Ok(())
}

async fn cmd_compare(backstop: &Backstop, left: &Path, right: &Path, json: bool) -> anyhow::Result<()> {
    let comparison = backstop.compare_files(left, right).await?;
    if json {
        return print_json(&comparison);
    }

    if comparison.identical {
        println!("{} Files are identical", "✓".green().bold());
    } else {
        println!("{} Files differ", "✗".yellow().bold());
    }
    println!("  {}  {}", comparison.left.hex().dimmed(), left.display());
    println!("  {}  {}", comparison.right.hex().dimmed(), right.display());
    Ok(())
}

async fn cmd_backup(backstop: &Backstop, files: Vec<PathBuf>, json: bool) -> anyhow::Result<()> {
    let mut records = Vec::with_capacity(files.len());
    for file in &files {
        records.push(backstop.create_backup(file).await?);
    }

    if json {
        return print_json(&records);
    }
    for record in &records {
        println!(
            "{} {} {} {}",
            "✓".green().bold(),
            record.original_path.display(),
            "→".dimmed(),
            record.backup_path.display().to_string().cyan()
        );
        let mut detail = format!(
            "  {} · {} → {}",
            record.kind,
            format_bytes(record.original_size),
            format_bytes(record.stored_size)
        );
        if let Some(ratio) = record.compression_ratio {
            detail.push_str(&format!(" ({:.2}x)", ratio));
        }
        if let Some(count) = record.dedup_reference_count {
            detail.push_str(&format!(" ({} references)", count));
        }
        println!("{}", detail.dimmed());
    }
    Ok(())
}

async fn cmd_restore(
    backstop: &Backstop,
    target: &Path,
    artifact: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let artifact = match artifact {
        Some(artifact) => artifact,
        None => match backstop.list_backups(Some(target)).await?.into_iter().next() {
            Some(latest) => latest.path,
            None => bail!("no backups of {} found", target.display()),
        },
    };

    let pb = (!json).then(|| spinner("Restoring...")).transpose()?;
    let result = backstop.restore_from_backup(target, &artifact).await;
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let result = result?;

    if json {
        return print_json(&result);
    }
    println!("{} Restored {}", "✓".green().bold(), target.display());
    println!("  From: {}", artifact.display().to_string().cyan());
    println!("  Bytes written: {}", format_bytes(result.bytes_written).cyan());
    println!(
        "  Verified: {}",
        if result.integrity_verified { "yes".green() } else { "no".yellow() }
    );
    if let Some(safety) = &result.safety_backup_path {
        println!("  Safety backup: {}", safety.display().to_string().dimmed());
    }
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(result.duration_ms)).to_string().cyan()
    );
    if !result.warnings.is_empty() {
        println!("\n{}", "Warnings:".yellow().bold());
        for warning in &result.warnings {
            println!("  - {}", warning.yellow());
        }
    }
    Ok(())
}

async fn cmd_cleanup(backstop: &Backstop, json: bool) -> anyhow::Result<()> {
    let stats = backstop.cleanup_backups().await?;
    if json {
        return print_json(&stats);
    }

    println!("{} Cleanup complete", "✓".green().bold());
    println!("  Deleted: {}", stats.deleted.to_string().yellow());
    println!("  Kept: {}", stats.kept.to_string().cyan());
    println!("  Skipped: {}", stats.skipped.to_string().dimmed());
    println!("  Reclaimed: {}", format_bytes(stats.bytes_reclaimed).cyan());
    for error in &stats.errors {
        println!("  {} {}", "!".red(), error);
    }
    Ok(())
}

async fn cmd_list(
    backstop: &Backstop,
    file: Option<PathBuf>,
    limit: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let mut artifacts = backstop.list_backups(file.as_deref()).await?;
    if let Some(limit) = limit {
        artifacts.truncate(limit);
    }
    if json {
        return print_json(&artifacts);
    }

    if artifacts.is_empty() {
        println!("{}", "No backups found".dimmed());
        return Ok(());
    }
    for artifact in &artifacts {
        println!(
            "{}  {:<12} {:>10}  {}",
            artifact.created_at.format("%Y-%m-%d %H:%M:%S").to_string().yellow(),
            artifact.kind.to_string(),
            format_bytes(artifact.size),
            artifact.path.display()
        );
    }
    Ok(())
}

async fn cmd_dedup(backstop: &Backstop, files: Vec<PathBuf>, json: bool) -> anyhow::Result<()> {
    let mut results = Vec::with_capacity(files.len());
    for file in &files {
        results.push(backstop.deduplicate_file(file).await?);
    }
    if json {
        return print_json(&results);
    }

    for result in &results {
        let status = if result.is_new_entry { "stored".cyan() } else { "linked".green() };
        println!(
            "{} {} {} (refs: {}, saved: {})",
            status,
            result.file_path.display(),
            result.content_hash[..12.min(result.content_hash.len())].dimmed(),
            result.reference_count,
            format_bytes(result.space_saved)
        );
    }
    Ok(())
}

async fn cmd_incremental(backstop: &Backstop, files: Vec<PathBuf>, json: bool) -> anyhow::Result<()> {
    let mut results = Vec::with_capacity(files.len());
    for file in &files {
        results.push((file.clone(), backstop.create_incremental_backup(file).await?));
    }
    if json {
        return print_json(&results.iter().map(|(_, r)| r).collect::<Vec<_>>());
    }

    for (file, result) in &results {
        println!(
            "{:<12} {} (chain {}, {})",
            format!("{:?}", result.backup_type).to_lowercase().cyan(),
            file.display(),
            result.chain_length,
            result.reason.dimmed()
        );
    }
    Ok(())
}

async fn cmd_differential(backstop: &Backstop, files: Vec<PathBuf>, json: bool) -> anyhow::Result<()> {
    let mut results = Vec::with_capacity(files.len());
    for file in &files {
        results.push((file.clone(), backstop.create_differential_backup(file).await?));
    }
    if json {
        return print_json(&results.iter().map(|(_, r)| r).collect::<Vec<_>>());
    }

    for (file, result) in &results {
        println!(
            "{:<12} {} (cumulative {})",
            format!("{:?}", result.backup_type).to_lowercase().cyan(),
            file.display(),
            format_bytes(result.cumulative_size)
        );
        if let Some(reason) = &result.recommendation_reason {
            println!("  {} full backup recommended: {}", "!".yellow().bold(), reason);
        }
    }
    Ok(())
}

async fn cmd_batch(
    backstop: &Backstop,
    operation: OperationArg,
    path: &Path,
    strategy: Option<StrategyArg>,
    manifest: Option<PathBuf>,
    fail_fast: bool,
    json: bool,
) -> anyhow::Result<()> {
    let operation = BatchOperation::from(operation);
    let files = collect_files(path);

    let mut options = BatchOptions::default();
    if let Some(strategy) = strategy {
        options = options.with_strategy(strategy.into());
    }
    if fail_fast {
        options = options.on_error(|_, _| ErrorAction::Abort);
    }
    if let Some(manifest) = manifest {
        let content = std::fs::read_to_string(&manifest)
            .with_context(|| format!("reading manifest {}", manifest.display()))?;
        let expected: HashMap<PathBuf, String> = serde_json::from_str(&content)
            .with_context(|| format!("parsing manifest {}", manifest.display()))?;
        options.expected_checksums = expected;
    } else if operation == BatchOperation::Validate {
        bail!("batch validate needs --manifest");
    }

    let pb = if json {
        None
    } else {
        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, {eta})")?
                .progress_chars("=> "),
        );
        Some(pb)
    };
    let listener = pb.clone().map(|pb| {
        backstop.on_progress(move |info| pb.set_position(info.processed as u64))
    });

    let started = Instant::now();
    let result = backstop.process_large_project(files, operation, options).await;
    if let Some(id) = listener {
        backstop.off_progress(id);
    }
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let result = result?;

    if json {
        return print_json(&result);
    }

    for item in &result.items {
        match &item.outcome {
            ItemOutcome::Failed { message, .. } => {
                println!("  {} {}: {}", "✗".red(), item.path.display(), message)
            }
            ItemOutcome::Validation(outcome) if !outcome.is_valid => {
                println!("  {} {}", "✗".yellow(), item.path.display())
            }
            _ => {}
        }
    }

    let mark = if result.failed == 0 && result.invalid == 0 {
        "✓".green().bold()
    } else {
        "!".yellow().bold()
    };
    println!("{} Batch {} of {} files", mark, operation, result.total);
    println!("  Succeeded: {}", result.succeeded.to_string().green());
    if operation == BatchOperation::Validate {
        println!("  Invalid: {}", result.invalid.to_string().yellow());
    }
    println!("  Failed: {}", result.failed.to_string().red());
    if result.skipped > 0 {
        println!("  Skipped: {}", result.skipped.to_string().dimmed());
    }
    println!("  Batches: {}", result.batches.len());
    println!("  Throughput: {:.1} files/s", result.throughput);
    if let Some(peak) = result.peak_memory_bytes {
        println!("  Peak memory: {}", format_bytes(peak));
    }
    println!("  Time: {}", format_duration(started.elapsed()).to_string().cyan());
    Ok(())
}

async fn cmd_stats(backstop: &Backstop, json: bool) -> anyhow::Result<()> {
    let cache = backstop.get_cache_stats();
    let compression = backstop.get_compression_stats();
    let dedup = backstop.get_deduplication_stats().await;
    let incremental = backstop.get_incremental_stats().await;
    let differential = backstop.get_differential_stats().await;
    let backups = backstop.list_backups(None).await?;

    if json {
        return print_json(&serde_json::json!({
            "cache": cache,
            "compression": compression,
            "deduplication": dedup,
            "incremental": incremental,
            "differential": differential,
            "backups": backups.len(),
        }));
    }

    let total: u64 = backups.iter().map(|b| b.size).sum();
    println!("{}", "Backups".bold());
    println!("  Directory: {}", backstop.config().backup_directory().display());
    println!("  Artifacts: {} ({})", backups.len().to_string().cyan(), format_bytes(total));

    println!("{}", "Checksum cache".bold());
    println!("  Entries: {}/{}", cache.entries, cache.capacity);
    println!("  Hit rate: {:.1}%", cache.hit_rate() * 100.0);
    println!("  Compressed this session: {}", compression.files_compressed);

    if let Some(dedup) = dedup {
        println!("{}", "Deduplication".bold());
        println!("  Unique contents: {}", dedup.unique_contents);
        println!("  References: {}", dedup.total_references);
        println!("  Stored: {}", format_bytes(dedup.bytes_stored));
        println!("  Saved: {}", format_bytes(dedup.bytes_saved).green());
    }
    if let Some(incremental) = incremental {
        println!("{}", "Incremental".bold());
        println!("  Tracked files: {}", incremental.tracked_files);
        println!(
            "  Full/incremental/skipped: {}/{}/{}",
            incremental.full_backups, incremental.incremental_backups, incremental.skipped_backups
        );
    }
    if let Some(differential) = differential {
        println!("{}", "Differential".bold());
        println!("  Tracked files: {}", differential.tracked_roots);
        println!("  Pending full backups: {}", differential.pending_recommendations);
    }
    Ok(())
}
