//! Export worker: runs one job through its phases.
//!
//! ```text
//! GETTING_NOTES -> UPDATING_PARENTS -> CREATING_CONTENT -> PROCESSING_IMAGES
//!   -> REWRITING_LINKS -> CREATING_ARCHIVE -> CLEANING_UP -> DONE
//! ```
//!
//! The cancellation flag is checked between phases and after every note.
//! A cancelled job drops its staging directory, removes any archive, ends in
//! `CANCELLED` and removes itself from the registry. A job that hits a fatal
//! error ends in `FAILED` and stays registered until disposed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use notes_core::defaults::{EXPORT_DOCUMENT_PREFIX, EXPORT_UPLOAD_DATE_FORMAT};
use notes_core::{BookType, Error, ExportId, ExportMode, ExportPhase, ExportStatus, Result};

use crate::archive::{ArchiveWriter, ExportDocument};
use crate::config::ExportConfig;
use crate::graph::{ContentGraphBuilder, ExportForest};
use crate::job::{ExportJob, Outcome};
use crate::rewrite::LinkRewriter;
use crate::services::Services;
use crate::staging::{reserve_archive, ExportStaging};

/// Live jobs by id, shared between the registry and its workers.
pub(crate) type JobTable = Arc<DashMap<ExportId, Arc<ExportJob>>>;

/// Event emitted while export jobs run.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportEvent {
    /// A job was accepted by the registry.
    JobStarted { job_id: ExportId },
    /// A job entered a new phase.
    PhaseChanged { job_id: ExportId, phase: ExportPhase },
    /// A job's archive is ready to fetch.
    ArchiveCreated { job_id: ExportId, entries: usize },
    /// A job was cancelled and cleaned up.
    JobCancelled { job_id: ExportId },
    /// A job failed.
    JobFailed { job_id: ExportId, error: String },
}

/// Files one run of a job created on disk. Cleanup only ever touches these,
/// never a path derived from the job id alone.
#[derive(Debug, Default)]
struct JobFiles {
    staging: Option<ExportStaging>,
    archive: Option<PathBuf>,
}

impl JobFiles {
    async fn remove(self) {
        drop(self.staging);
        if let Some(path) = self.archive {
            remove_archive(&path).await;
        }
    }
}

/// Executes a single export job. Consumed by [`ExportWorker::run`].
pub struct ExportWorker {
    job: Arc<ExportJob>,
    services: Services,
    config: ExportConfig,
    jobs: JobTable,
    event_tx: broadcast::Sender<ExportEvent>,
}

impl ExportWorker {
    pub(crate) fn new(
        job: Arc<ExportJob>,
        services: Services,
        config: ExportConfig,
        jobs: JobTable,
        event_tx: broadcast::Sender<ExportEvent>,
    ) -> Self {
        Self {
            job,
            services,
            config,
            jobs,
            event_tx,
        }
    }

    /// Run the job to completion, cancellation or failure.
    #[instrument(skip(self), fields(job_id = self.job.id(), user_id = %self.job.requester().user_id))]
    pub async fn run(self) {
        let start = Instant::now();
        let mut files = JobFiles::default();

        let result = self.execute(&mut files).await;

        match result {
            Ok(Outcome::Completed(entries)) => {
                if self.job.is_cancelled() {
                    // Cancelled after the archive was published; the caller saw
                    // a running job, so it is discarded here.
                    self.discard_finished().await;
                    return;
                }
                info!(
                    processed = self.job.processed_count(),
                    entry_count = entries,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Export archive created"
                );
                let _ = self.event_tx.send(ExportEvent::ArchiveCreated {
                    job_id: self.job.id(),
                    entries,
                });
            }
            Ok(Outcome::Cancelled) | Err(Error::Cancelled) => {
                self.finish_cancelled(files).await;
                info!(
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Export cancelled"
                );
            }
            Err(e) => {
                self.finish_failed(files, e, start).await;
            }
        }
    }

    async fn execute(&self, files: &mut JobFiles) -> Result<Outcome<usize>> {
        let job = &self.job;
        if !job.advance_status(ExportStatus::InProgress) {
            return Ok(Outcome::Cancelled);
        }

        // GETTING_NOTES, UPDATING_PARENTS
        if !self.enter_phase(ExportPhase::GettingNotes) {
            return Ok(Outcome::Cancelled);
        }
        let builder = ContentGraphBuilder::new(&self.services);
        let mut forest = match builder.build(job).await? {
            Outcome::Completed(forest) => forest,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };
        if job.mode() == ExportMode::Selection {
            self.announce_phase(ExportPhase::UpdatingParents);
        }

        // CREATING_CONTENT
        if !self.enter_phase(ExportPhase::CreatingContent) {
            return Ok(Outcome::Cancelled);
        }
        tokio::fs::create_dir_all(&self.config.export_dir).await?;
        let staging = files
            .staging
            .insert(ExportStaging::create_in(&self.config.export_dir, job.id())?);
        let rewriter = LinkRewriter::new(&self.services, &self.config.attachment_url_prefix)?;
        let order = forest.preorder();
        debug!(notes = order.len(), staging = %staging.path().display(), "Export content prepared");

        // PROCESSING_IMAGES
        if !self.enter_phase(ExportPhase::ProcessingImages) {
            return Ok(Outcome::Cancelled);
        }
        for &index in &order {
            let note = &forest.node(index).note;
            let content = rewriter.extract_media(note, staging, job).await?;
            let featured = rewriter.stage_featured_image(note, staging, job).await?;
            let note = &mut forest.node_mut(index).note;
            note.content = content;
            if let Some(file_name) = featured {
                // The archive names the image by its staged file.
                if let Some(image) = note
                    .properties
                    .as_mut()
                    .and_then(|properties| properties.featured_image.as_mut())
                {
                    image.id = file_name;
                }
            }
            if job.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
        }

        // REWRITING_LINKS
        if !self.enter_phase(ExportPhase::RewritingLinks) {
            return Ok(Outcome::Cancelled);
        }
        for &index in &order {
            let content = rewriter.rewrite_links(&forest.node(index).note, job).await?;
            forest.node_mut(index).note.content = content;
            if job.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
        }

        // CREATING_ARCHIVE
        if !self.enter_phase(ExportPhase::CreatingArchive) {
            return Ok(Outcome::Cancelled);
        }
        let document = ExportDocument::from_forest(&forest, Utc::now());
        let archive_path = reserve_archive(&self.config.export_dir, job.id())?;
        files.archive = Some(archive_path.clone());
        let entries = {
            let path = archive_path.clone();
            let media = staging.media_files();
            let featured = staging.featured_files();
            let watched_job = self.job.clone();
            tokio::task::spawn_blocking(move || {
                ArchiveWriter::write(&path, &document, &media, &featured, || {
                    watched_job.is_cancelled()
                })
            })
            .await
            .map_err(|e| Error::Internal(format!("archive writer task failed: {}", e)))??
        };
        if self.config.upload_archives {
            self.upload(&forest, &archive_path).await?;
        }

        // CLEANING_UP
        if !self.enter_phase(ExportPhase::CleaningUp) {
            return Ok(Outcome::Cancelled);
        }
        if let Some(staging) = files.staging.take() {
            if let Err(e) = staging.close() {
                warn!(error = %e, "Failed to remove export staging directory");
            }
        }

        job.set_archive_path(archive_path);
        job.set_phase(ExportPhase::Done);
        if !job.advance_status(ExportStatus::ZipCreated) {
            return Ok(Outcome::Cancelled);
        }
        Ok(Outcome::Completed(entries))
    }

    /// Enter `phase` unless the job was cancelled.
    fn enter_phase(&self, phase: ExportPhase) -> bool {
        if self.job.is_cancelled() {
            return false;
        }
        self.job.set_phase(phase);
        self.announce_phase(phase);
        true
    }

    fn announce_phase(&self, phase: ExportPhase) {
        debug!(phase = %phase, processed = self.job.processed_count(), "Export phase");
        let _ = self.event_tx.send(ExportEvent::PhaseChanged {
            job_id: self.job.id(),
            phase,
        });
    }

    /// Copy the archive into the owner's documents for group and user books.
    async fn upload(&self, forest: &ExportForest, archive_path: &Path) -> Result<()> {
        let Some(&first) = forest.roots().first() else {
            return Ok(());
        };
        let book = forest.node(first).note.book();
        if book.book_type == BookType::Portal {
            return Ok(());
        }
        let file_name = format!(
            "{}{}.zip",
            EXPORT_DOCUMENT_PREFIX,
            Utc::now().format(EXPORT_UPLOAD_DATE_FORMAT)
        );
        self.services
            .documents
            .upload(&book, &self.config.upload_folder, &file_name, archive_path)
            .await?;
        info!(
            book_type = %book.book_type,
            book_owner = %book.owner,
            file = %file_name,
            "Export archive uploaded"
        );
        Ok(())
    }

    async fn finish_cancelled(&self, files: JobFiles) {
        files.remove().await;
        self.job.take_archive_path();
        self.job.advance_status(ExportStatus::Cancelled);
        // A job cancelled while queued was already removed and announced.
        if self.unregister() {
            let _ = self.event_tx.send(ExportEvent::JobCancelled {
                job_id: self.job.id(),
            });
        }
    }

    async fn finish_failed(&self, files: JobFiles, e: Error, start: Instant) {
        files.remove().await;
        self.job.take_archive_path();
        let message = e.to_string();
        if self.job.fail(message.clone()) {
            error!(
                error = %message,
                phase = %self.job.phase(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Export failed"
            );
            let _ = self.event_tx.send(ExportEvent::JobFailed {
                job_id: self.job.id(),
                error: message,
            });
        }
    }

    /// Drop a job whose archive was created after a cancel request raced in.
    async fn discard_finished(&self) {
        if let Some(path) = self.job.take_archive_path() {
            remove_archive(&path).await;
        }
        // The registry may have discarded it first.
        if self.unregister() {
            info!("Export cancelled after archive creation, archive discarded");
            let _ = self.event_tx.send(ExportEvent::JobCancelled {
                job_id: self.job.id(),
            });
        }
    }

    fn unregister(&self) -> bool {
        let job = &self.job;
        self.jobs
            .remove_if(&job.id(), |_, registered| Arc::ptr_eq(registered, job))
            .is_some()
    }
}

/// Remove an archive file, ignoring a missing one.
pub(crate) async fn remove_archive(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove export archive");
        }
    }
}
