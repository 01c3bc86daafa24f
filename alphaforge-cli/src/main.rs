//! AlphaForge CLI: candidate generation, batch simulation and sync commands.
//!
//! Commands:
//! - `generate --level N`: expand templates into PENDING candidates
//! - `simulate`: submit PENDING candidates in context-grouped sub-batches
//! - `requeue`: put SIMULATING candidates that never got a verdict back to PENDING
//! - `sync`: merge simulated records from the service into the store
//! - `pnl`: fetch P&L for simulated candidates that lack it
//! - `operators`, `fields`: refresh the local catalog
//! - `infer-templates`: derive templates from a data-field CSV export
//! - `status`: candidate counts per level and state

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use alphaforge_core::domain::{BatchNo, Level};
use alphaforge_core::lifecycle::CandidateState;
use alphaforge_runner::catalog_sync::{sync_data_fields, sync_operators};
use alphaforge_runner::infer::infer_templates;
use alphaforge_runner::ingestion::result_window;
use alphaforge_runner::service::{FieldScope, SimulationService};
use alphaforge_runner::{
    requeue_stale, CandidateRepository, Credentials, FileRepository, Filter, HttpSimulationClient, InMemoryCatalog,
    Ingestor, LevelPipeline, Orchestrator, PipelineConfig, RateLimiter,
};

#[derive(Parser)]
#[command(name = "alphaforge", about = "AlphaForge: alpha candidate generation and simulation pipeline")]
struct Cli {
    /// Pipeline config (TOML). A missing file means all defaults.
    #[arg(long, global = true, default_value = "alphaforge.toml")]
    config: PathBuf,

    /// Candidate store (JSON).
    #[arg(long, global = true, default_value = "data/candidates.json")]
    store: PathBuf,

    /// Reference catalog of templates, data fields and operators (JSON).
    #[arg(long, global = true, default_value = "data/catalog.json")]
    catalog: PathBuf,

    /// Service username. Falls back to the variable named in `service.username_env`.
    #[arg(long, global = true, env = "ALPHAFORGE_USERNAME", hide_env_values = true)]
    username: Option<String>,

    /// Service password. Falls back to the variable named in `service.password_env`.
    #[arg(long, global = true, env = "ALPHAFORGE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand the level's templates into PENDING candidates.
    Generate {
        /// Level to generate: 1 (data fields), 2 or 3 (promoted parents).
        #[arg(long)]
        level: u8,

        /// Batch number. Defaults to `<timestamp>_<level>`.
        #[arg(long)]
        batch_no: Option<String>,

        /// Narrow the parent selection, e.g. `--where batch_no=...` (levels 2 and 3).
        #[arg(long = "where")]
        filters: Vec<String>,

        /// Master seed; overrides `generation.seed`.
        #[arg(long)]
        seed: Option<u64>,

        /// Do not contact the service; level 1 uses every catalog field.
        #[arg(long, default_value_t = false)]
        offline: bool,
    },
    /// Submit PENDING candidates for simulation.
    Simulate {
        /// Candidate selector, e.g. `--where batch_no=...` or `--where level=2`.
        #[arg(long = "where")]
        filters: Vec<String>,

        /// Sub-batches in flight. Defaults to `batch.concurrency`.
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Return SIMULATING candidates without an external id to PENDING.
    Requeue {
        #[arg(long = "where")]
        filters: Vec<String>,
    },
    /// Merge simulated records from the service into the store.
    Sync {
        /// Created on or after this date (YYYY-MM-DD). Defaults to yesterday.
        #[arg(long)]
        from: Option<String>,

        /// Created before this date (YYYY-MM-DD). Defaults to tomorrow.
        #[arg(long)]
        to: Option<String>,

        /// Only records with this service status (e.g. UNSUBMITTED, ACTIVE).
        #[arg(long)]
        status: Option<String>,
    },
    /// Fetch P&L record sets for simulated candidates that lack one.
    Pnl {
        /// Fetch at most this many.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Refresh the operator list from the service.
    Operators,
    /// Refresh data fields for one region/delay/universe.
    Fields {
        #[arg(long, default_value = "USA")]
        region: String,

        #[arg(long, default_value_t = 1)]
        delay: i64,

        #[arg(long, default_value = "TOP3000")]
        universe: String,

        /// Restrict to one dataset id.
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Derive templates from a data-field CSV (`name`, `description`, `category`).
    InferTemplates {
        csv: PathBuf,

        /// Grouping fields for the second-order group templates (repeatable).
        #[arg(long = "group")]
        groups: Vec<String>,
    },
    /// Candidate counts per level and lifecycle state.
    Status {
        #[arg(long = "where")]
        filters: Vec<String>,

        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    match &cli.command {
        Commands::Generate {
            level,
            batch_no,
            filters,
            seed,
            offline,
        } => run_generate(&cli, config, *level, batch_no.clone(), filters, *seed, *offline),
        Commands::Simulate { filters, concurrency } => run_simulate(&cli, &config, filters, *concurrency),
        Commands::Requeue { filters } => run_requeue(&cli, filters),
        Commands::Sync { from, to, status } => {
            run_sync(&cli, &config, from.as_deref(), to.as_deref(), status.clone())
        }
        Commands::Pnl { limit } => run_pnl(&cli, &config, *limit),
        Commands::Operators => run_operators(&cli, &config),
        Commands::Fields {
            region,
            delay,
            universe,
            dataset,
        } => {
            let scope = FieldScope {
                region: region.clone(),
                delay: *delay,
                universe: universe.clone(),
                dataset: dataset.clone(),
            };
            run_fields(&cli, &config, &scope)
        }
        Commands::InferTemplates { csv, groups } => run_infer(&cli, csv, groups),
        Commands::Status { filters, json } => run_status(&cli, filters, *json),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("alphaforge=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ─── Wiring ──────────────────────────────────────────────────────────

fn open_store(path: &Path) -> Result<Arc<FileRepository>> {
    let repo = FileRepository::open(path).with_context(|| format!("opening store {}", path.display()))?;
    Ok(Arc::new(repo))
}

fn open_catalog(path: &Path) -> Result<Arc<InMemoryCatalog>> {
    let catalog = InMemoryCatalog::load(path).with_context(|| format!("loading catalog {}", path.display()))?;
    Ok(Arc::new(catalog))
}

fn save_catalog(catalog: &InMemoryCatalog, path: &Path) -> Result<()> {
    catalog
        .save(path)
        .with_context(|| format!("saving catalog {}", path.display()))
}

fn limiter(config: &PipelineConfig) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(config.rate_limit.burst, config.rate_limit.refill_every()))
}

/// Signed-in client sharing `limiter` with every other call site.
fn connect(cli: &Cli, config: &PipelineConfig, limiter: Arc<RateLimiter>) -> Result<Arc<HttpSimulationClient>> {
    let credentials = match (&cli.username, &cli.password) {
        (Some(user), Some(pass)) => Credentials::new(user.clone(), pass.clone()),
        _ => Credentials::from_env(&config.service.username_env, &config.service.password_env)
            .context("no credentials: pass --username/--password or set the configured variables")?,
    };
    let client = HttpSimulationClient::new(&config.service, credentials, limiter)?;
    client
        .reauthenticate()
        .with_context(|| format!("signing in to {}", config.service.base_url))?;
    Ok(Arc::new(client))
}

fn selector(filters: &[String]) -> Result<Filter> {
    Filter::parse_pairs(filters.iter().map(String::as_str)).context("invalid --where filter")
}

fn parse_day(raw: &str) -> Result<chrono::DateTime<Utc>> {
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("invalid date '{raw}'"))?;
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("invalid date '{raw}'"))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

// ─── Commands ────────────────────────────────────────────────────────

fn run_generate(
    cli: &Cli,
    mut config: PipelineConfig,
    level: u8,
    batch_no: Option<String>,
    filters: &[String],
    seed: Option<u64>,
    offline: bool,
) -> Result<()> {
    let level = Level::try_from(level).map_err(|e| anyhow!(e))?;
    if seed.is_some() {
        config.generation.seed = seed;
    }
    let parent_scope = selector(filters)?;
    let repo = open_store(&cli.store)?;
    let catalog = open_catalog(&cli.catalog)?;

    let service = if level == Level::First && !offline {
        Some(connect(cli, &config, limiter(&config))?)
    } else {
        None
    };
    let mut pipeline = LevelPipeline::new(repo, catalog, config);
    if let Some(service) = service {
        pipeline = pipeline.with_service(service);
    }

    let report = pipeline.generate(level, batch_no.map(BatchNo::new), &parent_scope)?;
    println!();
    println!("=== Generation ===");
    println!("Batch:          {}", report.batch_no);
    println!("Level:          {}", report.level);
    println!("Templates:      {} ({} skipped)", report.templates, report.skipped_templates);
    println!("Inputs:         {}", report.inputs);
    println!("Generated:      {}", report.generated);
    println!("Inserted:       {}", report.inserted);
    println!("Duplicates:     {}", report.deduplicated);
    println!("Rejected:       {}", report.rejected);
    Ok(())
}

fn run_simulate(cli: &Cli, config: &PipelineConfig, filters: &[String], concurrency: Option<usize>) -> Result<()> {
    let selector = selector(filters)?;
    let repo = open_store(&cli.store)?;
    let limiter = limiter(config);
    let service = connect(cli, config, Arc::clone(&limiter))?;
    let orchestrator = Orchestrator::new(repo, service, limiter, config);

    let concurrency = concurrency.unwrap_or(config.batch.concurrency);
    let summary = orchestrator.run_batch(&selector, concurrency)?;
    println!();
    println!("=== Simulation ===");
    println!("Selected:       {} in {} context(s)", summary.selected, summary.groups);
    println!("Sub-batches:    {} ({} dispatched)", summary.sub_batches, summary.dispatched);
    println!("Simulated:      {}", summary.completed);
    println!("Failed:         {}", summary.failed);
    println!("Unresolved:     {}", summary.unresolved);
    if summary.skipped > 0 {
        println!("Skipped:        {} (no longer PENDING)", summary.skipped);
    }
    if summary.errored > 0 {
        println!();
        println!(
            "WARNING: {} sub-batch(es) errored; their candidates stay SIMULATING until `sync` or `requeue`",
            summary.errored
        );
    }
    Ok(())
}

fn run_requeue(cli: &Cli, filters: &[String]) -> Result<()> {
    let selector = selector(filters)?;
    let repo = open_store(&cli.store)?;
    let n = requeue_stale(repo.as_ref(), &selector)?;
    println!("Requeued {n} candidate(s).");
    Ok(())
}

fn run_sync(
    cli: &Cli,
    config: &PipelineConfig,
    from: Option<&str>,
    to: Option<&str>,
    status: Option<String>,
) -> Result<()> {
    let mut query = result_window(Utc::now(), config.service.utc_offset_hours);
    if let Some(from) = from {
        query.created_from = Some(parse_day(from)?);
    }
    if let Some(to) = to {
        query.created_to = Some(parse_day(to)?);
    }
    query.status = status;

    let repo = open_store(&cli.store)?;
    let limiter = limiter(config);
    let service = connect(cli, config, Arc::clone(&limiter))?;
    info!(from = ?query.created_from, to = ?query.created_to, "syncing results");
    let report = Ingestor::new(repo, service, limiter, config).sync_results(&query)?;
    println!();
    println!("=== Result Sync ===");
    println!("Fetched:        {}", report.fetched);
    println!("Linked by id:   {}", report.linked);
    println!("Matched (hash): {}", report.matched_by_hash);
    println!("Created:        {}", report.created);
    println!("Updated:        {}", report.updated);
    println!("Unchanged:      {}", report.unchanged);
    println!("Skipped:        {}", report.skipped);
    if report.errors > 0 {
        println!();
        println!("WARNING: results paging stopped early after repeated failures; rerun `sync` to continue");
    }
    Ok(())
}

fn run_pnl(cli: &Cli, config: &PipelineConfig, limit: Option<usize>) -> Result<()> {
    let repo = open_store(&cli.store)?;
    let limiter = limiter(config);
    let service = connect(cli, config, Arc::clone(&limiter))?;
    let report = Ingestor::new(repo, service, limiter, config).fetch_pnl(limit)?;
    println!(
        "P&L: {} attempted, {} stored, {} failed.",
        report.attempted, report.stored, report.failed
    );
    Ok(())
}

fn run_operators(cli: &Cli, config: &PipelineConfig) -> Result<()> {
    let catalog = open_catalog(&cli.catalog)?;
    let service = connect(cli, config, limiter(config))?;
    let report = sync_operators(service.as_ref(), catalog.as_ref())?;
    save_catalog(&catalog, &cli.catalog)?;
    println!("Operators: {} fetched, {} removed.", report.fetched, report.removed);
    Ok(())
}

fn run_fields(cli: &Cli, config: &PipelineConfig, scope: &FieldScope) -> Result<()> {
    let catalog = open_catalog(&cli.catalog)?;
    let service = connect(cli, config, limiter(config))?;
    let report = sync_data_fields(service.as_ref(), catalog.as_ref(), scope)?;
    save_catalog(&catalog, &cli.catalog)?;
    println!(
        "Data fields ({}/D{}/{}): {} upserted.",
        scope.region, scope.delay, scope.universe, report.upserted
    );
    Ok(())
}

fn run_infer(cli: &Cli, csv: &Path, groups: &[String]) -> Result<()> {
    let catalog = open_catalog(&cli.catalog)?;
    let file = File::open(csv).with_context(|| format!("opening {}", csv.display()))?;
    let report = infer_templates(file, catalog.as_ref(), groups)?;
    save_catalog(&catalog, &cli.catalog)?;

    println!("Fields read:    {}", report.fields);
    println!("Level 1:        {} template(s)", report.first_order.len());
    println!("Level 2 group:  {} template(s)", report.group.len());
    println!();
    for (pattern, fields) in &report.mapping {
        println!("{:<20} {}", pattern, fields.len());
    }
    Ok(())
}

fn run_status(cli: &Cli, filters: &[String], json: bool) -> Result<()> {
    let filter = selector(filters)?;
    let candidates = open_store(&cli.store)?.search(&filter)?;

    let mut counts: BTreeMap<(u8, u8), usize> = BTreeMap::new();
    for c in &candidates {
        *counts.entry((u8::from(c.level), c.state.ordinal())).or_default() += 1;
    }

    if json {
        let rows: Vec<serde_json::Value> = counts
            .iter()
            .filter_map(|((level, state), n)| {
                let state = CandidateState::from_ordinal(*state).ok()?;
                Some(serde_json::json!({"level": level, "state": state.name(), "count": n}))
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if candidates.is_empty() {
        println!("No candidates in {}", cli.store.display());
        return Ok(());
    }
    println!("Store: {}", cli.store.display());
    println!("Candidates: {}", candidates.len());
    println!();
    println!("{:<8} {:<16} {:>8}", "Level", "State", "Count");
    println!("{}", "-".repeat(34));
    for ((level, state), n) in &counts {
        let state = CandidateState::from_ordinal(*state).map_or("?", CandidateState::name);
        println!("{:<8} {:<16} {:>8}", level, state, n);
    }
    Ok(())
}
