//! Starling main entry point
//!
//! This is the command-line interface for the Starling repository census crawler.

use clap::Parser;
use starling::config::{load_config, load_config_with_hash, Config};
use starling::crawler::{crawl, CrawlSummary};
use starling::storage::open_storage;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Starling: a quota-aware GitHub repository census crawler
///
/// Starling walks GitHub's repository search one star-range partition at a
/// time, waits out rate limits, and upserts what it finds into SQLite with
/// resumable cursor checkpoints.
#[derive(Parser, Debug)]
#[command(name = "starling")]
#[command(version)]
#[command(about = "A quota-aware GitHub repository census crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Discard partition checkpoints and crawl from the first page
    #[arg(long)]
    fresh: bool,

    /// Validate config and show the partitions without crawling
    #[arg(long, conflicts_with_all = ["stats", "export_csv", "init_db"])]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "export_csv", "init_db"])]
    stats: bool,

    /// Export all repositories as CSV and exit (defaults to `output.export-path`)
    #[arg(long, value_name = "PATH", num_args = 0..=1, conflicts_with_all = ["dry_run", "stats", "init_db"])]
    export_csv: Option<Option<PathBuf>>,

    /// Create the database schema and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats", "export_csv"])]
    init_db: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());

    // Only the crawl needs the config hash
    if cli.dry_run {
        return handle_dry_run(&load(&cli.config)?);
    } else if cli.stats {
        return handle_stats(&load(&cli.config)?);
    } else if let Some(path) = &cli.export_csv {
        return handle_export_csv(&load(&cli.config)?, path.as_deref());
    } else if cli.init_db {
        return handle_init_db(&load(&cli.config)?);
    }

    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    handle_crawl(config, &config_hash, cli.fresh).await
}

fn load(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    load_config(path).map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e.into()
    })
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("starling=info,warn"),
            1 => EnvFilter::new("starling=debug,info"),
            2 => EnvFilter::new("starling=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: validates config and shows what would be crawled
fn handle_dry_run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Starling Dry Run ===\n");

    println!("GitHub:");
    println!("  Endpoint: {}", config.github.api_url);
    println!("  Page size: {}", config.github.page_size);
    println!("  Credentials: {}", config.credentials.len());

    println!("\nCrawl:");
    println!("  Batch size: {}", config.crawl.batch_size);
    println!(
        "  Max concurrent partitions: {}",
        config.crawl.max_concurrent_partitions
    );
    let budget = config.crawl.budget();
    if let Some(pages) = budget.max_pages {
        println!("  Max pages per partition: {}", pages);
    }
    if let Some(records) = budget.max_records {
        println!("  Max records per partition: {}", records);
    }
    if let Some(runtime) = budget.max_runtime {
        println!("  Max runtime per partition: {:?}", runtime);
    }

    println!("\nRetry:");
    println!("  Max attempts: {}", config.retry.max_attempts);
    println!(
        "  Delay: {}ms doubling to {}ms",
        config.retry.base_delay_ms, config.retry.max_delay_ms
    );
    println!("  Quota reserve: {}", config.retry.reserve_threshold);

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);
    if let Some(export) = &config.output.export_path {
        println!("  CSV export: {}", export);
    }

    let partitions = config.partition_specs();
    println!("\nPartitions ({}):", partitions.len());
    for spec in &partitions {
        println!("  - {}: {}", spec.id, spec.search_query());
    }

    println!("\n✓ Configuration is valid");
    if config.credentials.is_empty() {
        println!(
            "! No token resolved; set github.token or {} before crawling",
            config.github.token_env
        );
    }

    Ok(())
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    use starling::output::{load_statistics, print_statistics};

    println!("Database: {}\n", config.output.database_path);

    let storage = open_storage(Path::new(&config.output.database_path))?;
    let stats = load_statistics(&storage)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --export-csv mode
fn handle_export_csv(
    config: &Config,
    path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    use starling::output::export_csv;

    let output = match (path, &config.output.export_path) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(configured)) => PathBuf::from(configured),
        (None, None) => {
            return Err("no export path given and output.export-path is not set".into());
        }
    };

    println!("=== Exporting Repositories ===\n");
    println!("Database: {}", config.output.database_path);
    println!("Output: {}", output.display());
    println!();

    let storage = open_storage(Path::new(&config.output.database_path))?;
    let count = export_csv(&storage, &output)?;

    println!("✓ Exported {} repositories to: {}", count, output.display());

    Ok(())
}

/// Handles the --init-db mode: creates the schema and exits
fn handle_init_db(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_storage(Path::new(&config.output.database_path))?;
    println!(
        "✓ Database ready at: {} (schema version {})",
        config.output.database_path,
        storage.schema_version()?
    );
    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(
    config: Config,
    config_hash: &str,
    fresh: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if fresh {
        tracing::info!("Starting fresh crawl (discarding checkpoints)");
    } else {
        tracing::info!("Starting crawl (partitions resume from their checkpoints)");
    }

    tracing::info!(
        "Partitions: {}, credentials: {}",
        config.partition_specs().len(),
        config.credentials.len()
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping after the current pages");
            shutdown.cancel();
        }
    });

    match crawl(config, config_hash, fresh, cancel).await {
        Ok(summary) => {
            print_summary(&summary);
            if summary.failures().next().is_some() {
                return Err("one or more partitions failed".into());
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}

fn print_summary(summary: &CrawlSummary) {
    println!("\n=== Crawl Run {} ===\n", summary.run_id);
    println!("Status: {}", summary.run_status().to_db_string());
    println!("Elapsed: {:.1}s", summary.elapsed.as_secs_f64());
    println!("Pages fetched: {}", summary.pages_fetched());
    println!("Records written: {}", summary.records_written());
    println!();

    for report in &summary.reports {
        println!(
            "  {}: {} ({} pages, {} written, {} rejected)",
            report.partition_id,
            report.state,
            report.pages_fetched,
            report.records_written,
            report.records_rejected
        );
        if let Some(failure) = &report.failure {
            println!("      {}", failure);
        }
    }
}
