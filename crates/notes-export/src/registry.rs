//! Registry of export jobs.
//!
//! Callers start, poll, cancel, fetch and dispose jobs by [`ExportId`]. Jobs
//! run on the tokio runtime, at most `max_concurrent_exports` at a time; the
//! rest wait on a semaphore in `STARTED`. Each run writes its archive to a
//! file of its own, so a job id can be reused as soon as it is removed.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info};

use notes_core::defaults::EXPORT_EVENT_CAPACITY;
use notes_core::{Error, ExportId, ExportStatus, ExportStatusSnapshot, Result};

use crate::config::ExportConfig;
use crate::job::{ExportJob, ExportRequest};
use crate::services::Services;
use crate::worker::{remove_archive, ExportEvent, ExportWorker, JobTable};

/// Handle to the set of live export jobs. Cheap to clone.
#[derive(Clone)]
pub struct ExportJobRegistry {
    jobs: JobTable,
    services: Services,
    config: ExportConfig,
    permits: Arc<Semaphore>,
    event_tx: broadcast::Sender<ExportEvent>,
}

impl ExportJobRegistry {
    pub fn new(services: Services, config: ExportConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EXPORT_EVENT_CAPACITY);
        Self {
            jobs: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_exports.max(1))),
            services,
            config,
            event_tx,
        }
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Register a job and schedule it. Must be called within a tokio runtime.
    ///
    /// Fails with [`Error::Conflict`] when a job with the same id is live.
    pub fn start(&self, request: ExportRequest) -> Result<()> {
        if self.permits.is_closed() {
            return Err(Error::InvalidInput(
                "export registry is shut down".to_string(),
            ));
        }

        let job_id = request.job_id;
        let job = Arc::new(ExportJob::new(request));
        match self.jobs.entry(job_id) {
            Entry::Occupied(_) => {
                return Err(Error::Conflict(format!("export job {} already exists", job_id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
            }
        }

        info!(
            job_id,
            user_id = %job.requester().user_id,
            notes = job.requested_ids().len(),
            mode = ?job.mode(),
            "Export job started"
        );
        let _ = self.event_tx.send(ExportEvent::JobStarted { job_id });

        let worker = ExportWorker::new(
            job.clone(),
            self.services.clone(),
            self.config.clone(),
            self.jobs.clone(),
            self.event_tx.clone(),
        );
        let permits = self.permits.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            match permits.acquire_owned().await {
                Ok(_permit) => worker.run().await,
                Err(_) => {
                    // Registry shut down while queued.
                    debug!(job_id, "Export job dropped before running");
                    job.cancel();
                    job.advance_status(ExportStatus::Cancelled);
                    jobs.remove_if(&job_id, |_, registered| Arc::ptr_eq(registered, &job));
                }
            }
        });
        Ok(())
    }

    /// Request cancellation.
    ///
    /// A queued job is cancelled and removed at once. A running job stops at
    /// its next checkpoint and cleans up after itself. A job whose archive is
    /// already built, or that failed, is disposed immediately; only the former
    /// reports [`ExportEvent::JobCancelled`]. Returns `false` for unknown ids.
    pub async fn cancel(&self, job_id: ExportId) -> bool {
        let Some(job) = self.job(job_id) else {
            return false;
        };
        if job.cancel_queued() {
            info!(job_id, "Queued export cancelled");
            if self.discard(&job).await {
                let _ = self.event_tx.send(ExportEvent::JobCancelled { job_id });
            }
            return true;
        }
        info!(job_id, status = %job.status(), "Export cancellation requested");

        match job.status() {
            ExportStatus::ZipCreated => {
                if self.discard(&job).await {
                    let _ = self.event_tx.send(ExportEvent::JobCancelled { job_id });
                }
            }
            ExportStatus::Failed | ExportStatus::Done => {
                self.discard(&job).await;
            }
            _ => {}
        }
        true
    }

    /// Current state of a job. `None` when the id is unknown or was removed.
    pub fn status(&self, job_id: ExportId) -> Option<ExportStatusSnapshot> {
        self.job(job_id).map(|job| job.snapshot())
    }

    /// Take the finished archive of a job.
    ///
    /// Only valid in `ZIP_CREATED`. Returns the archive bytes, deletes the
    /// archive, marks the job `DONE` and removes it from the registry.
    pub async fn fetch(&self, job_id: ExportId) -> Result<Vec<u8>> {
        let job = self
            .job(job_id)
            .ok_or_else(|| Error::NotFound(format!("export job {}", job_id)))?;

        let status = job.status();
        if status != ExportStatus::ZipCreated {
            return Err(Error::InvalidInput(format!(
                "export job {} is {}, archive not available",
                job_id, status
            )));
        }
        let path = job
            .archive_path()
            .ok_or_else(|| Error::Internal(format!("export job {} has no archive", job_id)))?;

        let bytes = tokio::fs::read(&path).await?;
        if !job.advance_status(ExportStatus::Done) {
            return Err(Error::NotFound(format!("export job {} already fetched", job_id)));
        }
        self.discard(&job).await;
        info!(job_id, size = bytes.len(), "Export archive fetched");
        Ok(bytes)
    }

    /// Forget a job and delete its archive. Running jobs are cancelled first.
    ///
    /// Returns `false` for unknown ids.
    pub async fn dispose(&self, job_id: ExportId) -> bool {
        let Some(job) = self.job(job_id) else {
            return false;
        };
        if !job.status().is_terminal() {
            job.cancel();
        }
        self.discard(&job).await;
        debug!(job_id, "Export job disposed");
        true
    }

    /// Stop accepting jobs and cancel every live one.
    pub fn shutdown(&self) {
        self.permits.close();
        let mut cancelled = 0;
        for entry in self.jobs.iter() {
            entry.value().cancel();
            cancelled += 1;
        }
        info!(cancelled, "Export registry shut down");
    }

    /// Receiver for job events.
    pub fn events(&self) -> broadcast::Receiver<ExportEvent> {
        self.event_tx.subscribe()
    }

    /// Ids of live jobs, sorted.
    pub fn job_ids(&self) -> Vec<ExportId> {
        let mut ids: Vec<ExportId> = self.jobs.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn job(&self, job_id: ExportId) -> Option<Arc<ExportJob>> {
        self.jobs.get(&job_id).map(|entry| entry.value().clone())
    }

    /// Remove `job` from the table and delete whatever archive it owns.
    ///
    /// Returns whether this call removed it.
    async fn discard(&self, job: &Arc<ExportJob>) -> bool {
        let removed = self
            .jobs
            .remove_if(&job.id(), |_, registered| Arc::ptr_eq(registered, job))
            .is_some();
        if let Some(path) = job.take_archive_path() {
            remove_archive(&path).await;
        }
        removed
    }
}

impl std::fmt::Debug for ExportJobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportJobRegistry")
            .field("jobs", &self.jobs.len())
            .field("config", &self.config)
            .finish()
    }
}
