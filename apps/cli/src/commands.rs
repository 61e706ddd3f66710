//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use ditta_engine::{JobQueue, Orchestrator, QueueConfig, run_workers};
use ditta_governor::{FailureClassifier, GovernorConfig, RateGovernor};
use ditta_resolver::EntityRegistry;
use ditta_shared::{
    AppConfig, CompanyRecord, CorrelationId, init_config, load_config,
};
use ditta_storage::Storage;
use ditta_waterfall::{
    DisabledOracle, HttpFetcher, HttpRegistryProvider, OpenRouterOracle, Oracle, ResolveContext,
    SearchApiProvider, VerificationCache, financial_waterfall, website_waterfall,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ditta — enrich business records with websites, VAT ids, and financials.
#[derive(Parser)]
#[command(
    name = "ditta",
    version,
    about = "Resolve websites, VAT numbers, and financial data for business records.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Enqueue a batch of records and run the worker pool until drained.
    Run {
        /// Path to a JSON file containing an array of company records.
        #[arg(short, long)]
        input: PathBuf,

        /// Number of parallel workers (defaults to config).
        #[arg(short, long)]
        workers: Option<u32>,

        /// Correlation id for this batch (defaults to a fresh UUID v7).
        #[arg(long)]
        correlation_id: Option<String>,

        /// Path to the database (defaults to config).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Inspect dead-lettered jobs from previous runs.
    DeadLetters {
        /// Path to the database (defaults to config).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "warn,ditta=info,ditta_engine=info,ditta_waterfall=info,ditta_governor=info",
        1 => "info,ditta=debug,ditta_engine=debug,ditta_waterfall=debug,ditta_governor=debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            input,
            workers,
            correlation_id,
            db,
        } => run_batch(&input, workers, correlation_id, db).await,
        Command::DeadLetters { db } => show_dead_letters(db).await,
        Command::Config { action } => match action {
            ConfigAction::Init => {
                let path = init_config()?;
                println!("created {}", path.display());
                Ok(())
            }
            ConfigAction::Show => {
                let config = load_config()?;
                let rendered =
                    toml::to_string_pretty(&config).map_err(|e| eyre!("serialize config: {e}"))?;
                println!("{rendered}");
                Ok(())
            }
        },
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_path(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    match s.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        None => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn run_batch(
    input: &Path,
    workers: Option<u32>,
    correlation_id: Option<String>,
    db: Option<PathBuf>,
) -> Result<()> {
    let config = load_config()?;

    let records = load_records(input)?;
    if records.is_empty() {
        return Err(eyre!("no records found in {}", input.display()));
    }

    let correlation_id = match correlation_id {
        Some(raw) => raw
            .parse::<CorrelationId>()
            .map_err(|e| eyre!("invalid correlation id: {e}"))?,
        None => CorrelationId::new(),
    };

    let db_path = db.unwrap_or_else(|| expand_path(Path::new(&config.defaults.db_path)));
    // Unreachable storage is an unrecoverable startup failure: exit non-zero.
    let storage = Arc::new(Storage::open(&db_path).await?);

    let (orchestrator, oracle) = build_orchestrator(&config, storage.clone())?;
    let orchestrator = Arc::new(orchestrator);

    let queue = Arc::new(JobQueue::new(
        QueueConfig::from(&config.defaults),
        correlation_id.clone(),
    ));
    for record in records {
        queue.enqueue(record);
    }
    let total = queue.stats().queued;

    info!(
        records = total,
        correlation_id = %correlation_id,
        db = %db_path.display(),
        "batch scheduled"
    );

    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
            .expect("valid template"),
    );

    // Progress follows terminal-state counts while the pool drains the queue.
    let bar_task = {
        let queue = queue.clone();
        let bar = bar.clone();
        tokio::spawn(async move {
            loop {
                let stats = queue.stats();
                bar.set_position((stats.succeeded + stats.dead_lettered) as u64);
                if stats.queued + stats.active + stats.retrying == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
    };

    let worker_count = workers.unwrap_or(config.defaults.workers);
    let summary = run_workers(queue.clone(), orchestrator, worker_count).await?;
    let _ = bar_task.await;
    bar.finish_and_clear();

    println!(
        "resolved {} record(s), {} dead-lettered in {:.1}s ({} oracle tokens)",
        summary.succeeded,
        summary.dead_lettered,
        summary.elapsed.as_secs_f64(),
        oracle.tokens_spent(),
    );

    let dead = queue.dead_letters();
    if !dead.is_empty() {
        println!("\ndead letters:");
        for letter in &dead {
            println!(
                "  {}  {}  ({}, {} attempt(s))",
                letter.job.id, letter.job.record.name, letter.reason, letter.job.history.len()
            );
        }
    }

    Ok(())
}

fn load_records(input: &Path) -> Result<Vec<CompanyRecord>> {
    let content = std::fs::read_to_string(input)
        .map_err(|e| eyre!("cannot read {}: {e}", input.display()))?;
    let records: Vec<CompanyRecord> = serde_json::from_str(&content)
        .map_err(|e| eyre!("invalid records file {}: {e}", input.display()))?;
    Ok(records)
}

/// Wire up providers, waterfalls, and shared state from the config.
fn build_orchestrator(
    config: &AppConfig,
    storage: Arc<Storage>,
) -> Result<(Orchestrator, Arc<dyn Oracle>)> {
    let search_key = std::env::var(&config.search.api_key_env).ok().filter(|k| !k.is_empty());
    if search_key.is_none() {
        warn!(
            env = %config.search.api_key_env,
            "search API key not set, search strategy will be unauthenticated"
        );
    }

    let oracle: Arc<dyn Oracle> = match std::env::var(&config.openrouter.api_key_env) {
        Ok(key) if !key.is_empty() => Arc::new(OpenRouterOracle::new(
            key,
            config.openrouter.default_model.clone(),
        )?),
        _ => {
            warn!(
                env = %config.openrouter.api_key_env,
                "oracle API key not set, last-resort strategies disabled"
            );
            Arc::new(DisabledOracle)
        }
    };

    let cx = ResolveContext {
        governor: Arc::new(RateGovernor::new(GovernorConfig::from(&config.rate))),
        classifier: Arc::new(FailureClassifier::new(config.waterfall.hot_threshold)),
        cache: Arc::new(VerificationCache::new(
            config.waterfall.cache_capacity,
            Duration::from_secs(config.waterfall.cache_ttl_secs),
        )),
        fetcher: Arc::new(HttpFetcher::new()?),
        search: Arc::new(SearchApiProvider::new(
            config.search.endpoint.clone(),
            search_key,
        )?),
        registry: Arc::new(HttpRegistryProvider::new(
            config.registry.primary_endpoint.clone(),
            "registry-primary",
        )?),
        vat_service: Arc::new(HttpRegistryProvider::new(
            config.registry.secondary_endpoint.clone(),
            "registry-secondary",
        )?),
        oracle: oracle.clone(),
    };

    let orchestrator = Orchestrator::new(
        cx,
        website_waterfall(&config.waterfall),
        financial_waterfall(&config.waterfall),
        Arc::new(EntityRegistry::new()),
        storage,
    );
    Ok((orchestrator, oracle))
}

// ---------------------------------------------------------------------------
// dead-letters
// ---------------------------------------------------------------------------

async fn show_dead_letters(db: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let db_path = db.unwrap_or_else(|| expand_path(Path::new(&config.defaults.db_path)));

    let storage = Storage::open_readonly(&db_path).await?;
    let letters = storage.list_dead_letters().await?;

    if letters.is_empty() {
        println!("no dead letters");
        return Ok(());
    }

    for letter in &letters {
        println!(
            "{}  {}  {}  {}",
            letter.dead_at, letter.job_id, letter.record.name, letter.reason_code
        );
        for attempt in &letter.history {
            println!("    attempt {}: {}", attempt.attempt, attempt.error);
        }
    }
    Ok(())
}
