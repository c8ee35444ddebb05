use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ptm_core::{RunLedgerEntry, RunStatus};
use ptm_storage::PgStore;
use ptm_sync::{maybe_build_scheduler, Phase, Pipeline, PipelineConfig, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "ptm_cli=info,ptm_sync=info,ptm_adapters=info,ptm_storage=info";

#[derive(Debug, Parser)]
#[command(name = "ptm-cli")]
#[command(about = "Public tender matcher: scrape, enrich, classify, match and notify")]
struct Cli {
    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    /// Pipeline tunables (YAML). Takes precedence over PTM_PIPELINE_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// The whole pipeline under one run ledger.
    Run,
    Scrape,
    Enrich(EnrichArgs),
    Classify(ClassifyArgs),
    Match(MatchArgs),
    Notify,
    Migrate,
    /// Run the pipeline on PTM_SYNC_CRON until interrupted.
    Schedule,
}

#[derive(Debug, Args)]
struct EnrichArgs {
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    delay_ms: Option<u64>,
    #[arg(long)]
    max_pages: Option<usize>,
}

#[derive(Debug, Args)]
struct ClassifyArgs {
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    delay_ms: Option<u64>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct MatchArgs {
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    delay_ms: Option<u64>,
}

impl EnrichArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        let e = &mut config.enrichment;
        if let Some(v) = self.page_size {
            e.page_size = v;
        }
        if let Some(v) = self.workers {
            e.workers = v;
        }
        if let Some(v) = self.delay_ms {
            e.request_delay_ms = v;
        }
        if self.max_pages.is_some() {
            e.max_pages = self.max_pages;
        }
    }
}

impl ClassifyArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        let c = &mut config.classification;
        if let Some(v) = self.batch_size {
            c.batch_size = v;
        }
        if let Some(v) = self.delay_ms {
            c.delay_ms = v;
        }
        if let Some(v) = self.limit {
            c.limit = v;
        }
    }
}

impl MatchArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        let m = &mut config.matching;
        if let Some(v) = self.batch_size {
            m.batch_size = v;
        }
        if let Some(v) = self.delay_ms {
            m.delay_ms = v;
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match execute(cli).await {
        Ok(Some(entry)) if entry.status == RunStatus::Failed => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<Option<RunLedgerEntry>> {
    let sync = SyncConfig::from_env();
    let config_path = cli.config.or_else(|| sync.pipeline_config.clone());
    let mut config = PipelineConfig::load(config_path.as_deref())?;

    let phases: &[Phase] = match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => {
            migrate(&sync).await?;
            return Ok(None);
        }
        Commands::Schedule => {
            schedule(&sync, config).await?;
            return Ok(None);
        }
        Commands::Run => &Phase::ALL,
        Commands::Scrape => &[Phase::Scrape],
        Commands::Enrich(args) => {
            args.apply(&mut config);
            &[Phase::Enrich]
        }
        Commands::Classify(args) => {
            args.apply(&mut config);
            &[Phase::Classify]
        }
        Commands::Match(args) => {
            args.apply(&mut config);
            &[Phase::Match]
        }
        Commands::Notify => &[Phase::Notify],
    };

    let pipeline = Pipeline::from_env(&sync, config).await?;
    let entry = pipeline.run_phases(phases).await?;
    print_summary(&entry);
    Ok(Some(entry))
}

fn print_summary(entry: &RunLedgerEntry) {
    let c = &entry.counters;
    println!(
        "run {} {}: sources={} failed_sources={} saved={} enriched={} classified={} matches={} notified={} errors={}",
        entry.id,
        entry.status.as_str(),
        c.sources_scraped,
        c.sources_failed,
        c.opportunities_saved,
        c.records_enriched,
        c.records_classified,
        c.matches_created,
        c.notifications_sent,
        c.errors_count
    );
}

async fn migrate(sync: &SyncConfig) -> Result<()> {
    let store = PgStore::connect(
        sync.require_database_url()?,
        Duration::from_secs(sync.http_timeout_secs),
    )
    .await
    .context("connecting to database")?;
    store.migrate().await.context("applying migrations")?;
    println!("migrations applied");
    Ok(())
}

async fn schedule(sync: &SyncConfig, config: PipelineConfig) -> Result<()> {
    let pipeline = Arc::new(Pipeline::from_env(sync, config).await?);
    let Some(mut sched) = maybe_build_scheduler(pipeline, sync).await? else {
        bail!("scheduler is disabled; set PTM_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %sync.sync_cron, "scheduler running");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
