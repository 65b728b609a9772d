//! The scheduling loop.
//!
//! One pass: poll the drop folder, turn stable files and claimed queue
//! links into work items, then drive every unfinished item through
//!
//! ```text
//! Ingest ──► Refinery ──► Gardener ──► Note Writer ──► Archive / ledger ──► Done
//! ```
//!
//! Each stage checkpoints its output, so a restarted process resumes an item
//! from its draft, then its staged artifact, then its original source.
//! Failures stay with the item; the loop itself only stops on shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::checkpoint::CheckpointStore;
use super::ingest::IngestStage;
use super::journal::{JournalSnapshot, WorkJournal};
use super::refinery::Refinery;
use super::stage::{with_retries, StageError};
use crate::adapters::extract::{tool_available, Extractors};
use crate::adapters::{ModelKind, ModelRequest, ModelRuntime};
use crate::config::Settings;
use crate::domain::{
    CategoryDecision, Identity, NoteDraft, StagedArtifact, WorkItem, WorkStatus,
};
use crate::fsutil::compute_file_hash;
use crate::garden::Gardener;
use crate::ingest::{Admission, ClaimedLink, DropWatcher, QueueLedger, QueueStatus};
use crate::resources::{AcquireMode, ResourceManager};
use crate::vault::{
    ArchiveError, ArchiveManager, DailyLog, FileIndex, NoteWriter, RecoverReport, VectorIndex,
    WrittenNote,
};

/// What one scheduling pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// New work items recorded in the journal
    pub discovered: usize,
    /// Links claimed from queue files
    pub links_claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Shutdown was requested before every item was handled
    pub interrupted: bool,
}

/// Result of the startup checks
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    /// Optional tools that were not found
    pub missing_optional: Vec<String>,
}

enum Progress {
    Done,
    Interrupted,
}

pub struct Scheduler {
    settings: Settings,
    journal: WorkJournal,
    checkpoints: CheckpointStore,
    watcher: DropWatcher,
    ingest: IngestStage,
    refinery: Refinery,
    gardener: Gardener,
    writer: NoteWriter,
    archive: ArchiveManager,
    daily: Option<DailyLog>,
    index: Option<Arc<dyn VectorIndex>>,
    resources: ResourceManager,
}

impl Scheduler {
    /// Wire every stage from `settings` around one shared Resource Manager
    pub fn new(settings: Settings, runtime: Arc<dyn ModelRuntime>) -> Result<Self> {
        let resources = ResourceManager::new(runtime, settings.models.clone())
            .with_lock_file(settings.slot_lock_path());
        let checkpoints = CheckpointStore::new(settings.staged_dir(), settings.drafts_dir());

        let watcher = DropWatcher::new(
            settings.drop.clone(),
            &settings.watch,
            settings.limits.clone(),
        )
        .context("Invalid watch settings")?;
        let extractors = Extractors::new(settings.tools.clone(), settings.limits.step_timeout())
            .context("Failed to set up extraction tools")?;
        let gardener = Gardener::new(
            settings.categories.clone(),
            settings.vault.clone(),
            Some(resources.clone()),
        )
        .context("Invalid category rules")?;

        let index: Option<Arc<dyn VectorIndex>> = if settings.index.enabled {
            Some(Arc::new(FileIndex::new(settings.index_path())))
        } else {
            None
        };

        Ok(Self {
            journal: WorkJournal::new(settings.journal_path()),
            ingest: IngestStage::new(
                resources.clone(),
                extractors,
                checkpoints.clone(),
                settings.models.language.clone(),
            ),
            refinery: Refinery::new(resources.clone(), settings.limits.clone()),
            writer: NoteWriter::new(settings.vault.clone(), settings.assets_dir.clone()),
            archive: ArchiveManager::new(settings.drop.clone(), settings.archive.clone()),
            daily: settings
                .daily_log
                .then(|| DailyLog::new(settings.daily_path())),
            checkpoints,
            watcher,
            gardener,
            index,
            resources,
            settings,
        })
    }

    /// Replace the vector index
    pub fn with_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn journal(&self) -> &WorkJournal {
        &self.journal
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// Required tools and the model runtime must be usable
    pub async fn preflight(&self) -> Result<PreflightReport> {
        let tools = &self.settings.tools;
        for (name, binary) in [("whisper", &tools.whisper), ("pdftotext", &tools.pdftotext)] {
            if !tool_available(binary) {
                anyhow::bail!("Required tool '{}' not found (looked for '{}')", name, binary);
            }
        }

        let mut report = PreflightReport::default();
        for (name, binary) in [
            ("tesseract", &tools.tesseract),
            ("pdfimages", &tools.pdfimages),
            ("pdftoppm", &tools.pdftoppm),
            ("yt-dlp", &tools.yt_dlp),
        ] {
            if !tool_available(binary) {
                warn!(tool = name, binary = %binary, "Optional tool not found, related inputs will fail");
                report.missing_optional.push(name.to_string());
            }
        }

        self.resources
            .runtime()
            .health_check()
            .await
            .with_context(|| {
                format!(
                    "Model runtime '{}' is not reachable",
                    self.resources.runtime().name()
                )
            })?;

        Ok(report)
    }

    /// Clean up after a crash mid-archive
    pub async fn recover(&self) -> Result<RecoverReport> {
        let completed: Vec<(PathBuf, String)> = self
            .journal
            .items()
            .await?
            .into_iter()
            .filter(|i| i.status == WorkStatus::Done)
            .filter_map(|i| Some((i.identity.as_path()?.to_path_buf(), i.content_hash?)))
            .collect();

        let report = self.archive.recover(&completed).await?;
        if report != RecoverReport::default() {
            info!(
                partials = report.partials_removed,
                sources = report.sources_removed,
                "Recovered archive state"
            );
        }
        Ok(report)
    }

    /// Run passes every `poll_interval_secs` until `shutdown` turns true
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.recover().await?;
        let interval = self.settings.watch.poll_interval();
        info!(
            drop = %self.settings.drop.display(),
            vault = %self.settings.vault.display(),
            interval_secs = interval.as_secs(),
            "Scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_pass(&shutdown).await {
                Ok(report) if report != PassReport::default() => info!(
                    discovered = report.discovered,
                    links = report.links_claimed,
                    completed = report.completed,
                    failed = report.failed,
                    interrupted = report.interrupted,
                    "Pass finished"
                ),
                Ok(_) => debug!("Idle pass"),
                Err(e) => error!(error = %format!("{:#}", e), "Pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Poll `stable_polls` times, `settle` apart, then process everything once
    pub async fn run_once(
        &mut self,
        settle: Duration,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<PassReport> {
        self.recover().await?;
        let mut report = PassReport::default();
        for poll in 0..self.settings.watch.stable_polls.max(1) {
            if poll > 0 {
                tokio::time::sleep(settle).await;
            }
            self.discover(&mut report).await?;
        }
        self.process_unfinished(&mut report, shutdown).await?;
        Ok(report)
    }

    /// One poll followed by processing of every unfinished item
    pub async fn run_pass(&mut self, shutdown: &watch::Receiver<bool>) -> Result<PassReport> {
        let mut report = PassReport::default();
        self.discover(&mut report).await?;
        self.process_unfinished(&mut report, shutdown).await?;
        Ok(report)
    }

    async fn discover(&mut self, report: &mut PassReport) -> Result<()> {
        let poll = self.watcher.poll().await?;
        if poll.admissions.is_empty() {
            return Ok(());
        }
        let mut known = self.journal.snapshot().await?;

        for admission in poll.admissions {
            match admission {
                Admission::Item { path, kind, .. } => {
                    let hash = match compute_file_hash(&path).await {
                        Ok(hash) => hash,
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Could not hash admitted file");
                            self.watcher.forget(&path);
                            continue;
                        }
                    };
                    if known.knows_file(&path, &hash) {
                        debug!(path = %path.display(), "File already journaled");
                        continue;
                    }

                    let item = WorkItem::from_file(path, kind, hash);
                    self.journal.record_discovered(&item).await?;
                    info!(item = %item.short_id(), %kind, source = %item.identity, "New work item");
                    known.insert(item);
                    report.discovered += 1;
                }
                Admission::QueueFile(path) => {
                    let claim = match QueueLedger::new(&path).claim_pending().await {
                        Ok(claim) => claim,
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Could not claim queue entries");
                            self.watcher.forget(&path);
                            continue;
                        }
                    };

                    for link in claim.claimed {
                        report.links_claimed += 1;
                        self.record_link(link, &mut known, report).await?;
                    }
                    for link in claim.in_flight {
                        self.settle_in_flight(link, &mut known, report).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn record_link(
        &self,
        link: ClaimedLink,
        known: &mut JournalSnapshot,
        report: &mut PassReport,
    ) -> Result<()> {
        let item = WorkItem::from_link(link.url, link.queue_file, link.line);
        self.journal.record_discovered(&item).await?;
        info!(item = %item.short_id(), source = %item.identity, line = link.line, "New link item");
        known.insert(item);
        report.discovered += 1;
        Ok(())
    }

    /// An in-progress queue entry left behind by an earlier run: adopt it if
    /// no item was ever journaled for it, or write back the final status of
    /// the item that finished without updating the file
    async fn settle_in_flight(
        &self,
        link: ClaimedLink,
        known: &mut JournalSnapshot,
        report: &mut PassReport,
    ) -> Result<()> {
        let status = match known.claimed(&link.queue_file, link.line, &link.url) {
            None => {
                warn!(url = %link.url, line = link.line, "Re-claiming queue entry with no work item");
                report.links_claimed += 1;
                return self.record_link(link, known, report).await;
            }
            Some(item) if !item.status.is_terminal() => return Ok(()),
            Some(item) if item.status == WorkStatus::Done => QueueStatus::Done,
            Some(item) => QueueStatus::Error {
                reason: item.error.clone().unwrap_or_else(|| "failed".to_string()),
            },
        };

        debug!(url = %link.url, line = link.line, "Writing back final status of queue entry");
        if let Err(e) = QueueLedger::new(&link.queue_file)
            .mark(&link.url, Some(link.line), status)
            .await
        {
            warn!(queue = %link.queue_file.display(), error = %e, "Could not settle queue entry");
        }
        Ok(())
    }

    async fn process_unfinished(
        &self,
        report: &mut PassReport,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        for mut item in self.journal.unfinished().await? {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }

            match self.process(&mut item, shutdown).await {
                Ok(Progress::Done) => report.completed += 1,
                Ok(Progress::Interrupted) => {
                    info!(item = %item.short_id(), status = %item.status, "Stopping after current stage");
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    self.fail(&mut item, &e).await?;
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Drive one item as far as it goes
    #[instrument(skip_all, fields(item = %item.short_id(), kind = %item.kind))]
    async fn process(
        &self,
        item: &mut WorkItem,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Progress, StageError> {
        let started = Instant::now();
        let policy = &self.settings.retry;

        if let Some(from) = item.requeued_from {
            if item.status == WorkStatus::Pending && self.checkpoints.adopt(from, item.id).await? {
                info!(from = %from, "Adopted checkpoints of the failed item");
            }
        }

        let artifact = match self.checkpoints.load_artifact(item.id).await? {
            Some(artifact) => {
                debug!(status = %item.status, "Resuming from staged artifact");
                artifact
            }
            None => {
                self.advance(item, WorkStatus::Ingesting, None).await?;
                let stage_started = Instant::now();
                let current = &*item;
                let artifact = with_retries(policy, &self.journal, current, "ingest", |_| {
                    self.ingest.run(current)
                })
                .await?;
                self.advance(item, WorkStatus::Staged, Some(elapsed_ms(stage_started)))
                    .await?;
                artifact
            }
        };
        self.advance(item, WorkStatus::Staged, None).await?;
        if stop_requested(shutdown) {
            return Ok(Progress::Interrupted);
        }

        let mut draft = match self.checkpoints.load_draft(item.id).await? {
            Some(draft) => {
                debug!("Resuming from draft");
                draft
            }
            None => {
                self.advance(item, WorkStatus::Refining, None).await?;
                let stage_started = Instant::now();
                let current = &*item;
                let draft = with_retries(policy, &self.journal, current, "refine", |_| {
                    self.refinery.run(&artifact)
                })
                .await?;
                self.checkpoints.save_draft(item.id, &draft).await?;
                self.advance(item, WorkStatus::Categorizing, Some(elapsed_ms(stage_started)))
                    .await?;
                draft
            }
        };
        self.advance(item, WorkStatus::Categorizing, None).await?;
        if stop_requested(shutdown) {
            return Ok(Progress::Interrupted);
        }

        let decision = match self.checkpoints.load_decision(item.id).await? {
            Some(decision) => decision,
            None => {
                let decision = self.gardener.tend(&mut draft).await;
                self.checkpoints.save_draft(item.id, &draft).await?;
                self.checkpoints.save_decision(item.id, &decision).await?;
                decision
            }
        };
        self.advance(item, WorkStatus::Writing, None).await?;
        if stop_requested(shutdown) {
            return Ok(Progress::Interrupted);
        }

        let current = &*item;
        let note = with_retries(policy, &self.journal, current, "write", |_| {
            self.commit(current, &artifact, &draft, &decision)
        })
        .await?;
        self.update_index(current, &note, &draft, &decision).await;

        self.advance(item, WorkStatus::Done, Some(elapsed_ms(started)))
            .await?;
        if let Err(e) = self.checkpoints.remove(item.id).await {
            warn!(error = %e, "Could not remove checkpoints of a finished item");
        }

        info!(
            note = %note.path.display(),
            folder = %decision.folder,
            review = decision.needs_review,
            elapsed_ms = elapsed_ms(started),
            "Item done"
        );
        Ok(Progress::Done)
    }

    /// Walk the item forward to `target`; statuses at or past it are left alone
    async fn advance(
        &self,
        item: &mut WorkItem,
        target: WorkStatus,
        duration_ms: Option<u64>,
    ) -> Result<(), StageError> {
        while rank(item.status) < rank(target) {
            let Some(next) = item.status.next() else {
                break;
            };
            let duration = if next == target { duration_ms } else { None };
            self.journal.record_transition(item, next, duration).await?;
        }
        Ok(())
    }

    /// Note, daily log, archive and ledger. Every step tolerates a repeat.
    async fn commit(
        &self,
        item: &WorkItem,
        artifact: &StagedArtifact,
        draft: &NoteDraft,
        decision: &CategoryDecision,
    ) -> Result<WrittenNote, StageError> {
        let note = self
            .writer
            .write(item, Some(artifact), draft, decision)
            .await?;

        if let Some(daily) = &self.daily {
            if let Err(e) = daily.append(Local::now(), &note.link_name(), draft).await {
                warn!(dir = %daily.dir().display(), error = %e, "Could not update daily log");
            }
        }

        match &item.identity {
            Identity::Path(source) => match self.archive.archive(source).await {
                Ok(_) => {}
                Err(ArchiveError::SourceMissing(path)) => {
                    debug!(path = %path.display(), "Source already gone from drop folder");
                }
                Err(e) => return Err(e.into()),
            },
            Identity::Url(url) => {
                if let Some(queue) = &item.origin {
                    QueueLedger::new(queue)
                        .mark(url, item.origin_line, QueueStatus::Done)
                        .await?;
                }
            }
        }

        Ok(note)
    }

    /// Embed the committed note, log its nearest neighbours, then upsert it
    async fn update_index(
        &self,
        item: &WorkItem,
        note: &WrittenNote,
        draft: &NoteDraft,
        decision: &CategoryDecision,
    ) {
        let Some(index) = &self.index else {
            return;
        };

        let text = draft.full_text();
        let embedding = self
            .resources
            .scoped(ModelKind::Embedding, AcquireMode::Wait, move |lease| {
                Box::pin(async move {
                    let response = lease.invoke(ModelRequest::Embed { text }).await?;
                    Ok::<_, StageError>(response.into_embedding()?)
                })
            })
            .await;
        let embedding = match embedding {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Could not embed note, index not updated");
                return;
            }
        };

        let id = item.id.to_string();
        match index.query(&embedding, self.settings.index.related + 1).await {
            Ok(hits) => {
                let related: Vec<String> = hits
                    .into_iter()
                    .filter(|h| h.id != id)
                    .take(self.settings.index.related)
                    .filter_map(|h| h.metadata.get("note").and_then(|n| n.as_str()).map(str::to_string))
                    .collect();
                if !related.is_empty() {
                    info!(?related, "Related notes");
                }
            }
            Err(e) => warn!(error = %e, "Index query failed"),
        }

        let metadata = json!({
            "title": draft.title,
            "note": note.link_name(),
            "path": note.path.display().to_string(),
            "folder": decision.folder,
            "tags": decision.tags,
        });
        if let Err(e) = index.upsert(&id, embedding, metadata).await {
            warn!(error = %e, "Index upsert failed");
        }
    }

    /// Record a terminal failure in the journal and, for links, in the queue file
    async fn fail(&self, item: &mut WorkItem, error: &StageError) -> Result<()> {
        let reason = error.to_string();
        self.journal.record_failure(item, &reason).await?;
        error!(item = %item.short_id(), source = %item.identity, reason = %reason, "Item failed");

        if let (Identity::Url(url), Some(queue)) = (&item.identity, &item.origin) {
            if let Err(e) = QueueLedger::new(queue)
                .mark(url, item.origin_line, QueueStatus::Error { reason })
                .await
            {
                warn!(queue = %queue.display(), error = %e, "Could not mark queue entry failed");
            }
        }
        Ok(())
    }
}

fn rank(status: WorkStatus) -> usize {
    WorkStatus::ALL
        .iter()
        .position(|s| *s == status)
        .unwrap_or(0)
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
