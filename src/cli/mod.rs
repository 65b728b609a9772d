//! Command-line interface for mulch.
//!
//! `run` drives the scheduler until SIGINT/SIGTERM; the other commands read
//! or nudge the work journal and the heavy-model slot.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;

use crate::adapters::{
    CompositeRuntime, ModelKind, ModelRuntime, OllamaRuntime, TesseractRuntime, WhisperRuntime,
};
use crate::config::{config, Settings};
use crate::core::{Scheduler, WorkJournal};
use crate::domain::{WorkItem, WorkStatus};
use crate::resources::{AcquireMode, ResourceManager};

/// Delay between the stability polls of `mulch once`
const ONCE_SETTLE: Duration = Duration::from_secs(2);

/// mulch - drop folder to knowledge vault, one heavy model at a time
#[derive(Parser, Debug)]
#[command(name = "mulch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduling loop until interrupted
    Run,

    /// Run a single scheduling pass and exit
    Once,

    /// Show journal counts per status and recent items
    Status {
        /// Number of recent items to show
        #[arg(short, long, default_value = "10")]
        recent: usize,
    },

    /// List work items
    Items {
        /// Only items in this status
        #[arg(short, long, value_enum)]
        status: Option<StatusFilter>,

        /// Maximum number of items to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Re-queue a failed item as a new work item
    Retry {
        /// Work item id or unique prefix
        id: String,
    },

    /// Acquire and immediately release a model lease
    Lease {
        #[arg(value_enum)]
        kind: LeaseKind,

        /// Fail instead of waiting when the slot is taken
        #[arg(long)]
        no_wait: bool,
    },

    /// Show resolved configuration
    Config,

    /// Check tools and the model runtime
    Check,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusFilter {
    Pending,
    Ingesting,
    Staged,
    Refining,
    Categorizing,
    Writing,
    Done,
    Failed,
}

impl From<StatusFilter> for WorkStatus {
    fn from(s: StatusFilter) -> Self {
        match s {
            StatusFilter::Pending => WorkStatus::Pending,
            StatusFilter::Ingesting => WorkStatus::Ingesting,
            StatusFilter::Staged => WorkStatus::Staged,
            StatusFilter::Refining => WorkStatus::Refining,
            StatusFilter::Categorizing => WorkStatus::Categorizing,
            StatusFilter::Writing => WorkStatus::Writing,
            StatusFilter::Done => WorkStatus::Done,
            StatusFilter::Failed => WorkStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LeaseKind {
    Transcription,
    Ocr,
    Generation,
    Embedding,
    Classification,
}

impl From<LeaseKind> for ModelKind {
    fn from(k: LeaseKind) -> Self {
        match k {
            LeaseKind::Transcription => ModelKind::Transcription,
            LeaseKind::Ocr => ModelKind::Ocr,
            LeaseKind::Generation => ModelKind::Generation,
            LeaseKind::Embedding => ModelKind::Embedding,
            LeaseKind::Classification => ModelKind::Classification,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run => run().await,
            Commands::Once => once().await,
            Commands::Status { recent } => show_status(recent).await,
            Commands::Items { status, limit } => list_items(status.map(Into::into), limit).await,
            Commands::Retry { id } => retry(&id).await,
            Commands::Lease { kind, no_wait } => lease(kind.into(), no_wait).await,
            Commands::Config => show_config(),
            Commands::Check => check().await,
        }
    }
}

/// Route transcription and OCR to their subprocess runtimes, the rest over HTTP
pub fn build_runtime(settings: &Settings) -> Result<Arc<dyn ModelRuntime>> {
    let timeout = settings.limits.step_timeout();
    let http = OllamaRuntime::new(settings.models.runtime_url.clone(), timeout)
        .context("Failed to create model runtime client")?;

    let runtime = CompositeRuntime::new(Arc::new(http))
        .route(
            ModelKind::Transcription,
            Arc::new(WhisperRuntime::new(settings.tools.whisper.clone(), timeout)),
        )
        .route(
            ModelKind::Ocr,
            Arc::new(TesseractRuntime::new(settings.tools.tesseract.clone(), timeout)),
        );
    Ok(Arc::new(runtime))
}

async fn scheduler() -> Result<Scheduler> {
    let settings = config()?.clone();
    settings.ensure_dirs().await?;
    let runtime = build_runtime(&settings)?;
    let scheduler = Scheduler::new(settings, runtime)?;
    scheduler.preflight().await?;
    Ok(scheduler)
}

fn journal() -> Result<WorkJournal> {
    Ok(WorkJournal::new(config()?.journal_path()))
}

/// Flip the returned receiver to true on SIGINT or SIGTERM
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested, finishing current stage");
        let _ = tx.send(true);
        // Keep the sender alive so the loop sees the flag, not a closed channel
        std::future::pending::<()>().await;
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}

async fn run() -> Result<()> {
    let mut scheduler = scheduler().await?;
    let shutdown = shutdown_signal();

    println!("🌱 Watching: {}", scheduler.settings().drop.display());
    println!("    Vault:   {}", scheduler.settings().vault.display());
    println!("    Press Ctrl+C to stop");
    println!();

    scheduler.run(shutdown).await
}

async fn once() -> Result<()> {
    let mut scheduler = scheduler().await?;
    let shutdown = shutdown_signal();

    let report = scheduler.run_once(ONCE_SETTLE, &shutdown).await?;

    println!();
    println!("Discovered:  {}", report.discovered);
    println!("Links:       {}", report.links_claimed);
    println!("Completed:   {}", report.completed);
    println!("Failed:      {}", report.failed);
    if report.interrupted {
        println!("⚠️  Interrupted, remaining items resume on the next run");
    }
    Ok(())
}

async fn show_status(recent: usize) -> Result<()> {
    let journal = journal()?;
    let counts = journal.status_counts().await?;
    let items = journal.items().await?;

    println!();
    println!("mulch status");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    println!("Journal: {}", journal.path().display());
    println!();
    for (status, count) in &counts {
        println!("  {:<13} {}", format!("{}:", status), count);
    }
    println!("  {:<13} {}", "total:", items.len());

    if !items.is_empty() && recent > 0 {
        println!();
        println!("Recent:");
        for item in items.iter().rev().take(recent) {
            println!(
                "  [{}] {} ({})",
                status_tag(item.status),
                item.identity.display_name(),
                item.short_id()
            );
            if let Some(error) = &item.error {
                println!("         {}", error);
            }
        }
    }
    println!();
    Ok(())
}

async fn list_items(status: Option<WorkStatus>, limit: usize) -> Result<()> {
    let mut items: Vec<WorkItem> = journal()?
        .items()
        .await?
        .into_iter()
        .filter(|i| status.map(|s| i.status == s).unwrap_or(true))
        .collect();
    items.sort_by(|a, b| b.discovered_at.cmp(&a.discovered_at));

    if items.is_empty() {
        println!("No work items");
        if let Some(status) = status {
            println!("  (filtered by status: {})", status);
        }
        return Ok(());
    }

    println!();
    println!(
        "{:<10} {:<13} {:<9} {:<36} {:<20}",
        "ID", "STATUS", "KIND", "SOURCE", "DISCOVERED"
    );
    println!("{}", "-".repeat(90));

    for item in items.iter().take(limit) {
        let source = item.identity.display_name();
        let source = if source.chars().count() > 34 {
            format!("{}...", source.chars().take(31).collect::<String>())
        } else {
            source
        };
        println!(
            "{:<10} {:<13} {:<9} {:<36} {:<20}",
            item.short_id(),
            item.status,
            item.kind,
            source,
            item.discovered_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    if items.len() > limit {
        println!();
        println!("... and {} more (use --limit to show more)", items.len() - limit);
    }
    Ok(())
}

async fn retry(id: &str) -> Result<()> {
    let fresh = journal()?
        .requeue(id)
        .await
        .with_context(|| format!("Failed to re-queue '{}'", id))?;

    println!(
        "🔁 Re-queued {} as {}",
        fresh.identity.display_name(),
        fresh.short_id()
    );
    println!("   It will be picked up on the next scheduling pass.");
    Ok(())
}

async fn lease(kind: ModelKind, no_wait: bool) -> Result<()> {
    let settings = config()?;
    let runtime = build_runtime(settings)?;
    let resources = ResourceManager::new(runtime, settings.models.clone())
        .with_lock_file(settings.slot_lock_path());
    let mode = if no_wait {
        AcquireMode::FailFast
    } else {
        AcquireMode::Wait
    };

    let lease = resources
        .acquire(kind, mode)
        .await
        .with_context(|| format!("Failed to acquire {} lease", kind))?;

    println!("Kind:      {}", lease.kind());
    println!("Model:     {}", lease.model());
    println!("Heavy:     {}", lease.is_heavy());
    println!("Degraded:  {}", lease.is_degraded());
    println!("Waited:    {} ms", lease.waited().as_millis());

    resources.release(lease).await?;
    println!("✓ Released");
    Ok(())
}

fn show_config() -> Result<()> {
    let settings = config()?;

    println!();
    println!("mulch configuration");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    match &settings.config_file {
        Some(path) => println!("Config file:   {}", path.display()),
        None => println!("Config file:   (none, using defaults)"),
    }
    println!("Home:          {}", settings.home.display());
    println!("Drop folder:   {}", settings.drop.display());
    println!("Archive:       {}", settings.archive.display());
    println!("Vault:         {}", settings.vault.display());
    println!("Assets:        {}", settings.assets_path().display());
    println!("Daily log:     {}", if settings.daily_log { "on" } else { "off" });
    println!("Index:         {}", if settings.index.enabled { "on" } else { "off" });
    println!();
    println!("Poll interval: {}s", settings.watch.poll_interval_secs);
    println!("Stable polls:  {}", settings.watch.stable_polls);
    println!("Queue files:   {:?}", settings.watch.queue_files);
    println!();
    println!("Runtime:       {}", settings.models.runtime_url);
    for kind in [
        ModelKind::Transcription,
        ModelKind::Ocr,
        ModelKind::Generation,
        ModelKind::Embedding,
        ModelKind::Classification,
    ] {
        let spec = settings.models.spec(kind);
        println!(
            "  {:<15} {}{}",
            format!("{}:", kind),
            spec.id,
            spec.fallback
                .as_deref()
                .map(|f| format!(" (fallback {})", f))
                .unwrap_or_default()
        );
    }
    println!();
    println!("Categories:    default {}", settings.categories.default_folder);
    for rule in &settings.categories.rules {
        println!("  {:<15} {} keywords", rule.label(), rule.keywords.len());
    }
    Ok(())
}

async fn check() -> Result<()> {
    let settings = config()?.clone();
    let runtime = build_runtime(&settings)?;
    let scheduler = Scheduler::new(settings, runtime)?;
    let report = scheduler.preflight().await?;

    println!("✓ Required tools present");
    for tool in &report.missing_optional {
        println!("⚠️  Optional tool missing: {}", tool);
    }
    println!("✓ Model runtime reachable");
    Ok(())
}

fn status_tag(status: WorkStatus) -> &'static str {
    match status {
        WorkStatus::Pending => "PEND",
        WorkStatus::Ingesting => "INGS",
        WorkStatus::Staged => "STGD",
        WorkStatus::Refining => "REFN",
        WorkStatus::Categorizing => "CATG",
        WorkStatus::Writing => "WRIT",
        WorkStatus::Done => "DONE",
        WorkStatus::Failed => "FAIL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_items_filter() {
        let cli = Cli::try_parse_from(["mulch", "items", "--status", "failed", "--limit", "5"])
            .unwrap();
        match cli.command {
            Commands::Items { status, limit } => {
                assert_eq!(status.map(WorkStatus::from), Some(WorkStatus::Failed));
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_lease_kind() {
        let cli = Cli::try_parse_from(["mulch", "lease", "generation", "--no-wait"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Lease {
                kind: LeaseKind::Generation,
                no_wait: true
            }
        ));
    }
}
