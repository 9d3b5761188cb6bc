//! Export job state shared between the registry, its worker and pollers.
//!
//! The hot path (`is_cancelled`, `status`, `phase`) is lock-free. Status moves
//! through a compare-and-swap loop so a job never regresses, whichever side
//! (worker or caller) touches it first.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use notes_core::{ExportId, ExportMode, ExportPhase, ExportStatus, ExportStatusSnapshot, Identity};

/// A request to export notes on behalf of a user.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    /// Caller-chosen job identifier.
    pub job_id: ExportId,
    /// Requested note ids. Order is kept; duplicates are ignored.
    pub note_ids: Vec<String>,
    /// `true` exports every requested note with its descendants.
    pub export_all: bool,
    pub requester: Identity,
}

impl ExportRequest {
    pub fn new(job_id: ExportId, note_ids: Vec<String>, requester: Identity) -> Self {
        Self {
            job_id,
            note_ids,
            export_all: false,
            requester,
        }
    }

    pub fn with_export_all(mut self, export_all: bool) -> Self {
        self.export_all = export_all;
        self
    }
}

/// Result of a cancellable step.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

fn status_to_u8(status: ExportStatus) -> u8 {
    match status {
        ExportStatus::Started => 0,
        ExportStatus::InProgress => 1,
        ExportStatus::Cancelled => 2,
        ExportStatus::ZipCreated => 3,
        ExportStatus::Failed => 4,
        ExportStatus::Done => 5,
    }
}

fn status_from_u8(value: u8) -> ExportStatus {
    match value {
        0 => ExportStatus::Started,
        1 => ExportStatus::InProgress,
        2 => ExportStatus::Cancelled,
        3 => ExportStatus::ZipCreated,
        4 => ExportStatus::Failed,
        _ => ExportStatus::Done,
    }
}

/// One export job.
///
/// Shared as `Arc<ExportJob>` between the registry and the worker task.
#[derive(Debug)]
pub struct ExportJob {
    id: ExportId,
    requested_ids: Vec<String>,
    mode: ExportMode,
    requester: Identity,
    cancelled: AtomicBool,
    status: AtomicU8,
    phase: AtomicU8,
    processed: AtomicUsize,
    errors: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
    archive_path: Mutex<Option<PathBuf>>,
}

impl ExportJob {
    pub fn new(request: ExportRequest) -> Self {
        let mut seen = std::collections::HashSet::new();
        let requested_ids = request
            .note_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        Self {
            id: request.job_id,
            requested_ids,
            mode: ExportMode::from_export_all(request.export_all),
            requester: request.requester,
            cancelled: AtomicBool::new(false),
            status: AtomicU8::new(status_to_u8(ExportStatus::Started)),
            phase: AtomicU8::new(ExportPhase::GettingNotes.as_u8()),
            processed: AtomicUsize::new(0),
            errors: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            archive_path: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ExportId {
        self.id
    }

    /// Requested ids, deduplicated, in request order.
    pub fn requested_ids(&self) -> &[String] {
        &self.requested_ids
    }

    pub fn mode(&self) -> ExportMode {
        self.mode
    }

    pub fn requester(&self) -> &Identity {
        &self.requester
    }

    /// Raise the cancellation flag. The worker observes it at its next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel a job still waiting for a worker slot: `STARTED -> CANCELLED`.
    ///
    /// Returns `false` once the worker has taken the job.
    pub(crate) fn cancel_queued(&self) -> bool {
        self.cancel();
        self.status
            .compare_exchange(
                status_to_u8(ExportStatus::Started),
                status_to_u8(ExportStatus::Cancelled),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn status(&self) -> ExportStatus {
        status_from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Move to `next` if that is a legal transition. Returns whether it moved.
    pub fn advance_status(&self, next: ExportStatus) -> bool {
        self.status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                status_from_u8(current)
                    .can_advance_to(next)
                    .then(|| status_to_u8(next))
            })
            .is_ok()
    }

    pub fn phase(&self) -> ExportPhase {
        ExportPhase::from_u8(self.phase.load(Ordering::SeqCst)).unwrap_or(ExportPhase::Done)
    }

    pub fn set_phase(&self, phase: ExportPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    pub fn processed_count(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn note_processed(&self) -> usize {
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record a per-note problem. The job carries on.
    pub fn record_error(&self, message: impl Into<String>) {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message.into());
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Mark the job failed with `message`. Returns `false` if it already ended.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        if !self.advance_status(ExportStatus::Failed) {
            return false;
        }
        *self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message.into());
        true
    }

    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Path of the finished archive, set once the archive exists.
    pub fn archive_path(&self) -> Option<PathBuf> {
        self.archive_path
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_archive_path(&self, path: PathBuf) {
        *self
            .archive_path
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(path);
    }

    pub(crate) fn take_archive_path(&self) -> Option<PathBuf> {
        self.archive_path
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub fn snapshot(&self) -> ExportStatusSnapshot {
        ExportStatusSnapshot {
            status: self.status(),
            phase: self.phase(),
            processed_count: self.processed_count(),
            errors: self.errors(),
            failure: self.failure(),
        }
    }
}
