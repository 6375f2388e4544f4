//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use licitai_core::admin;
use licitai_core::analyzer::Analyzer;
use licitai_core::classify::GeminiClassifier;
use licitai_core::collector::{self, CollectProgress, CollectReport, RecordCollector};
use licitai_core::enricher::Enricher;
use licitai_core::generator;
use licitai_core::monitor::ResultsMonitor;
use licitai_core::reporter;
use licitai_core::search::SerperSearch;
use licitai_core::worker::{StageProcessor, StageSpec, StageWorker, WorkerConfig};
use licitai_pncp::{ContratacoesApi, PncpClient};
use licitai_shared::{
    AppConfig, LicitaiError, RetryPolicy, Stage, Task, expand_home, init_config, load_config,
    load_config_from,
};
use licitai_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Licitai: turn public procurement notices into qualified sales leads.
#[derive(Parser)]
#[command(
    name = "licitai",
    version,
    about = "Collect PNCP procurement notices, qualify them, and export sales leads.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.licitai/licitai.toml).
    #[arg(long, global = true, env = "LICITAI_CONFIG")]
    pub config: Option<PathBuf>,

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

/// Pipeline stage selector for admin commands.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum StageArg {
    Analysis,
    Enrichment,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Analysis => Stage::Analysis,
            StageArg::Enrichment => Stage::Enrichment,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Collect procurement notices from PNCP into the local store.
    Collect {
        /// First publication date (YYYY-MM-DD).
        #[arg(long)]
        start_date: Option<String>,

        /// Last publication date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end_date: Option<String>,

        /// Look back this many months from today. Ignored with --start-date.
        #[arg(long)]
        months_back: Option<u32>,

        /// Collect notices still open for proposals on the end date instead.
        #[arg(long)]
        open_proposals: bool,
    },

    /// Create tasks for records matching active search definitions.
    Generate,

    /// Run the analysis worker until interrupted.
    Analyze,

    /// Run the enrichment worker until interrupted.
    Enrich,

    /// Export finished tasks as a CSV lead report.
    Report {
        /// Output directory (defaults to [reporter].output_dir).
        #[arg(short, long)]
        out: Option<String>,
    },

    /// Print tasks as they finish a stage, until interrupted.
    Monitor {
        /// Seconds between polls.
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },

    /// Fetch a single notice from PNCP and print it as JSON.
    Lookup {
        /// Organization CNPJ (punctuation allowed).
        #[arg(long)]
        cnpj: String,

        /// Purchase year.
        #[arg(long)]
        year: i32,

        /// Purchase sequence number.
        #[arg(long)]
        sequence: u32,
    },

    /// Queue maintenance and diagnostics.
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Admin subcommands.
#[derive(Subcommand)]
pub(crate) enum AdminAction {
    /// Delete every task from the queue.
    PurgeQueue {
        /// Skip the confirmation guard.
        #[arg(long)]
        yes: bool,
    },
    /// Create the default search definition if missing.
    EnsureSearch,
    /// Print counts, status distribution and frequent AI keywords.
    Diagnose,
    /// Print the number of pending tasks.
    CheckQueue,
    /// Send a stage's failed tasks back to its input status.
    Requeue {
        #[arg(long, value_enum)]
        stage: StageArg,
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
        0 => "licitai=info",
        1 => "licitai=debug",
        _ => "licitai=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
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
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Collect {
            start_date,
            end_date,
            months_back,
            open_proposals,
        } => {
            cmd_collect(
                config_path,
                start_date.as_deref(),
                end_date.as_deref(),
                months_back,
                open_proposals,
            )
            .await
        }
        Command::Generate => cmd_generate(config_path).await,
        Command::Analyze => cmd_analyze(config_path).await,
        Command::Enrich => cmd_enrich(config_path).await,
        Command::Report { out } => cmd_report(config_path, out.as_deref()).await,
        Command::Monitor { interval_secs } => cmd_monitor(config_path, interval_secs).await,
        Command::Lookup {
            cnpj,
            year,
            sequence,
        } => cmd_lookup(config_path, &cnpj, year, sequence).await,
        Command::Admin { action } => match action {
            AdminAction::PurgeQueue { yes } => cmd_purge_queue(config_path, yes).await,
            AdminAction::EnsureSearch => cmd_ensure_search(config_path).await,
            AdminAction::Diagnose => cmd_diagnose(config_path).await,
            AdminAction::CheckQueue => cmd_check_queue(config_path).await,
            AdminAction::Requeue { stage } => cmd_requeue(config_path, stage.into()).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    })
}

async fn open_store(config: &AppConfig) -> Result<Storage> {
    let path = expand_home(&config.store.path)?;
    Ok(Storage::open(&path).await?)
}

async fn open_store_readonly(config: &AppConfig) -> Result<Storage> {
    let path = expand_home(&config.store.path)?;
    Ok(Storage::open_readonly(&path).await?)
}

fn contratacoes_api(config: &AppConfig) -> Result<ContratacoesApi> {
    let client = PncpClient::new(&config.pncp, RetryPolicy::from(&config.retry))?;
    Ok(ContratacoesApi::new(client))
}

/// Exit code for a run stopped by a second interrupt.
const FORCED_EXIT_CODE: i32 = 130;

/// Cancel `token` on the first Ctrl-C and exit the process on the second.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if let Some(code) = watch_interrupts(tokio::signal::ctrl_c, token).await {
            std::process::exit(code);
        }
    });
}

/// Wait on `next_interrupt` repeatedly. The first interrupt cancels
/// `token`; the second returns the exit code to force. Returns `None` when
/// the signal can no longer be listened for.
async fn watch_interrupts<F, Fut>(mut next_interrupt: F, token: CancellationToken) -> Option<i32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    loop {
        if let Err(e) = next_interrupt().await {
            warn!(error = %e, "could not listen for Ctrl-C");
            return None;
        }
        if token.is_cancelled() {
            warn!("second interrupt, exiting without waiting for in-flight tasks");
            return Some(FORCED_EXIT_CODE);
        }
        info!("interrupt received, stopping after the current cycle (Ctrl-C again to force)");
        token.cancel();
    }
}

async fn run_worker<P: StageProcessor>(
    storage: Storage,
    processor: P,
    spec: StageSpec,
    config: &AppConfig,
) -> Result<()> {
    let stage = spec.stage;
    let worker = StageWorker::new(
        Arc::new(storage),
        processor,
        spec,
        WorkerConfig::from(&config.workers),
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    info!(%stage, "worker started, press Ctrl-C to stop");
    worker.run(cancel).await?;
    info!(%stage, "worker stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Pipeline commands
// ---------------------------------------------------------------------------

async fn cmd_collect(
    config_path: Option<&Path>,
    start_date: Option<&str>,
    end_date: Option<&str>,
    months_back: Option<u32>,
    open_proposals: bool,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let today = chrono::Local::now().date_naive();
    let window = collector::resolve_window(start_date, end_date, months_back, today)?;

    let storage = Arc::new(open_store(&config).await?);
    let collector = RecordCollector::new(contratacoes_api(&config)?, storage, &config.collector);

    let progress = CliProgress::new();
    let report = if open_proposals {
        info!(end = %window.end, "collecting notices open for proposals");
        collector.collect_open(window.end, &progress).await?
    } else {
        info!(%window, "collecting published notices");
        collector.collect(window, &progress).await?
    };

    println!();
    println!("  Collection finished");
    println!(
        "  Partitions: {} ({} failed)",
        report.partitions, report.failed_partitions
    );
    println!("  Fetched:    {}", report.fetched);
    println!("  New:        {}", report.inserted);
    println!("  Existing:   {}", report.skipped_existing);
    println!();
    Ok(())
}

async fn cmd_generate(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_store(&config).await?;

    let report = generator::generate_tasks(&storage, config.generator.max_batch).await?;

    println!();
    println!("  Task generation finished");
    println!("  Records:     {}", report.records_scanned);
    println!("  Searches:    {}", report.definitions);
    println!("  New tasks:   {}", report.created);
    println!("  Batches:     {}", report.batches);
    println!();
    Ok(())
}

async fn cmd_analyze(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let classifier = GeminiClassifier::from_config(&config.classifier)?;
    let storage = open_store(&config).await?;

    run_worker(storage, Analyzer::new(classifier), StageSpec::ANALYSIS, &config).await
}

async fn cmd_enrich(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let search = SerperSearch::from_config(&config.search)?;
    let storage = open_store(&config).await?;

    run_worker(storage, Enricher::new(search), StageSpec::ENRICHMENT, &config).await
}

async fn cmd_report(config_path: Option<&Path>, out: Option<&str>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_store_readonly(&config).await?;
    let output_dir = PathBuf::from(out.unwrap_or(&config.reporter.output_dir));

    let (path, rows) = reporter::export(&storage, &output_dir).await?;
    if rows == 0 {
        warn!("no finished tasks yet, the report only has a header");
    }

    println!();
    println!("  Lead report written");
    println!("  Rows: {rows}");
    println!("  Path: {}", path.display());
    println!();
    Ok(())
}

async fn cmd_monitor(config_path: Option<&Path>, interval_secs: u64) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = Arc::new(open_store_readonly(&config).await?);
    let mut monitor = ResultsMonitor::new(storage, Duration::from_secs(interval_secs.max(1)));

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    info!("watching for finished tasks, press Ctrl-C to stop");
    monitor
        .run(cancel, |task| println!("{}", describe_task(task)))
        .await?;
    Ok(())
}

/// Multi-line summary of a settled task for the monitor.
fn describe_task(task: &Task) -> String {
    let mut lines = vec![
        "--- task updated ---".to_string(),
        format!("PNCP:    {}", task.record_id),
        format!("Status:  {}", task.status),
    ];
    if let Some(result) = &task.result {
        lines.push(format!("Trigger: {}", result.sales_trigger));
        lines.push(format!("Keywords: {}", result.keywords.join(", ")));
    }
    if !task.contacts.is_empty() {
        lines.push("Contacts:".to_string());
        for (i, contact) in task.contacts.iter().enumerate() {
            lines.push(format!("  {}: {} ({})", i + 1, contact.email, contact.source_url));
        }
    }
    if let Some(error) = &task.error_log {
        lines.push(format!("Error:   {error}"));
    }
    lines.join("\n")
}

async fn cmd_lookup(config_path: Option<&Path>, cnpj: &str, year: i32, sequence: u32) -> Result<()> {
    let config = resolve_config(config_path)?;
    let api = contratacoes_api(&config)?;

    match api.by_id(cnpj, year, sequence).await? {
        Some(item) => println!("{}", serde_json::to_string_pretty(&item)?),
        None => return Err(eyre!("no notice found for {cnpj} {year}/{sequence}")),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Admin commands
// ---------------------------------------------------------------------------

async fn cmd_purge_queue(config_path: Option<&Path>, yes: bool) -> Result<()> {
    if !yes {
        return Err(eyre!(
            "purge-queue deletes every task; re-run with --yes to confirm"
        ));
    }
    let config = resolve_config(config_path)?;
    let storage = open_store(&config).await?;

    let removed = admin::purge_tasks(&storage).await?;
    println!("Removed {removed} tasks.");
    Ok(())
}

async fn cmd_ensure_search(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_store(&config).await?;

    if admin::ensure_default_search(&storage).await? {
        println!("Created search definition '{}'.", admin::DEFAULT_SEARCH_NAME);
    } else {
        println!("Search definition '{}' already exists.", admin::DEFAULT_SEARCH_NAME);
    }
    Ok(())
}

async fn cmd_diagnose(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_store_readonly(&config).await?;
    let diagnosis = admin::diagnose(&storage).await?;

    println!();
    println!("  Records: {}", diagnosis.records);
    println!("  Tasks:   {}", diagnosis.tasks);
    println!();
    println!("  Status distribution");
    for row in &diagnosis.by_status {
        println!("    {:<20} {}", row.status, row.count);
    }
    if !diagnosis.top_terms.is_empty() {
        println!();
        println!("  Top {} AI keywords", diagnosis.top_terms.len());
        for (term, count) in &diagnosis.top_terms {
            println!("    {term:<30} {count}");
        }
    }
    println!();
    Ok(())
}

async fn cmd_check_queue(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_store_readonly(&config).await?;

    let pending = admin::pending_count(&storage).await?;
    println!("Pending tasks: {pending}");
    Ok(())
}

async fn cmd_requeue(config_path: Option<&Path>, stage: Stage) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_store(&config).await?;

    let moved = admin::requeue_failed(&storage, stage).await?;
    println!("Requeued {moved} {stage} tasks.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Collection progress on an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl CollectProgress for CliProgress {
    fn partition_started(&self, region: &str, modality: u32, current: usize, total: usize) {
        self.spinner.set_message(format!(
            "Collecting [{current}/{total}] {region} modality {modality}"
        ));
    }

    fn partition_finished(&self, region: &str, modality: u32, inserted: u64) {
        if inserted > 0 {
            self.spinner
                .println(format!("  {region} / {modality}: {inserted} new"));
        }
    }

    fn partition_failed(&self, region: &str, modality: u32, error: &LicitaiError) {
        self.spinner
            .println(format!("  {region} / {modality}: failed ({error})"));
    }

    fn done(&self, _report: &CollectReport) {
        self.spinner.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use licitai_shared::{AnalysisResult, Contact, SearchDefinition, TaskStatus};

    #[tokio::test]
    async fn first_interrupt_cancels_second_forces_exit() {
        let token = CancellationToken::new();
        let code = watch_interrupts(|| async { Ok(()) }, token.clone()).await;
        assert!(token.is_cancelled());
        assert_eq!(code, Some(FORCED_EXIT_CODE));
    }

    #[tokio::test]
    async fn listener_failure_after_first_interrupt_keeps_cancellation() {
        let token = CancellationToken::new();
        let mut calls = 0;
        let code = watch_interrupts(
            || {
                calls += 1;
                let result = if calls == 1 {
                    Ok(())
                } else {
                    Err(std::io::Error::other("signal driver gone"))
                };
                async move { result }
            },
            token.clone(),
        )
        .await;
        assert!(token.is_cancelled());
        assert_eq!(code, None);
    }

    #[test]
    fn describe_task_lists_result_and_contacts() {
        let def = SearchDefinition::new("TI", "owner-1", &["servidor"]);
        let mut task = Task::pending("00394460000141-1-000123-2024", &def);
        task.status = TaskStatus::EnrichmentDone;
        task.result = Some(AnalysisResult {
            keywords: vec!["servidor".into(), "rack".into()],
            sales_trigger: "Compra de Hardware".into(),
        });
        task.contacts = vec![Contact {
            email: "ti@campinas.sp.gov.br".into(),
            source_url: "https://campinas.sp.gov.br/ti".into(),
            snippet: String::new(),
        }];

        let text = describe_task(&task);
        assert!(text.contains("00394460000141-1-000123-2024"));
        assert!(text.contains("enrichment-done"));
        assert!(text.contains("servidor, rack"));
        assert!(text.contains("1: ti@campinas.sp.gov.br"));
        assert!(!text.contains("Error:"));
    }
}
