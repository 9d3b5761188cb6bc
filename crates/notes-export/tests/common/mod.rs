//! Shared fixtures for notes-export integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use notes_export::{
    AttachmentStore, Blob, BookRef, BookType, DocumentStore, Error, ExportConfig, ExportId,
    ExportJobRegistry, ExportStatus, ExportStatusSnapshot, Identity, InMemoryAttachmentStore,
    InMemoryDocumentStore, InMemoryNoteStore, InMemoryPermissions, NewNote, NoteRef, NoteStore,
    Result, Services,
};

pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
pub const PREFIX: &str = "/portal/rest/wiki/attachments/";

pub fn user() -> Identity {
    Identity::new("john")
}

pub fn space() -> BookRef {
    BookRef::new(BookType::Group, "/spaces/eng")
}

/// In-memory collaborators plus a private export directory.
pub struct Fixture {
    pub notes: Arc<InMemoryNoteStore>,
    pub attachments: Arc<InMemoryAttachmentStore>,
    pub permissions: Arc<InMemoryPermissions>,
    pub documents: Arc<InMemoryDocumentStore>,
    pub export_dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            notes: Arc::new(InMemoryNoteStore::new()),
            attachments: Arc::new(InMemoryAttachmentStore::new()),
            permissions: Arc::new(InMemoryPermissions::allow_all()),
            documents: Arc::new(InMemoryDocumentStore::new()),
            export_dir: tempfile::tempdir().expect("export dir"),
        }
    }

    pub fn services(&self) -> Services {
        Services::new(
            self.notes.clone(),
            self.attachments.clone(),
            self.permissions.clone(),
            self.documents.clone(),
        )
    }

    pub fn config(&self) -> ExportConfig {
        ExportConfig::default().with_export_dir(self.export_dir.path())
    }

    pub fn registry(&self) -> ExportJobRegistry {
        ExportJobRegistry::new(self.services(), self.config())
    }

    /// Registry reading attachments from `attachments` instead of the fixture store.
    pub fn registry_with(
        &self,
        attachments: Arc<dyn AttachmentStore>,
        config: ExportConfig,
    ) -> ExportJobRegistry {
        let services = Services::new(
            self.notes.clone(),
            attachments,
            self.permissions.clone(),
            self.documents.clone(),
        );
        ExportJobRegistry::new(services, config)
    }

    pub async fn book(&self, book: BookRef) -> NoteRef {
        self.notes.create_book(book, "john").await.expect("create book")
    }

    pub async fn note(&self, parent_id: &str, name: &str, content: &str) -> NoteRef {
        self.notes
            .create(
                parent_id,
                NewNote::new(name, name.replace('_', " "), content).with_author("john"),
            )
            .await
            .expect("create note")
    }

    /// Names of the files left in the export directory.
    pub fn export_dir_entries(&self) -> Vec<String> {
        dir_entries(self.export_dir.path())
    }
}

/// Poll until the export directory holds exactly `count` entries.
pub async fn wait_for_export_dir_len(fx: &Fixture, count: usize) {
    for _ in 0..500 {
        if fx.export_dir_entries().len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "export dir never held {} entries: {:?}",
        count,
        fx.export_dir_entries()
    );
}

/// Events already delivered to `events`, without waiting for more.
pub fn drain_events(
    events: &mut tokio::sync::broadcast::Receiver<notes_export::ExportEvent>,
) -> Vec<notes_export::ExportEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read export dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn media_html(file_id: &str) -> String {
    format!(r#"<p><img src="{}{}"/></p>"#, PREFIX, file_id)
}

pub fn link_html(target_id: &str, label: &str) -> String {
    format!(r#"<a class="noteLink" href="{}">{}</a>"#, target_id, label)
}

/// Poll until the job reaches `status`.
pub async fn wait_for_status(
    registry: &ExportJobRegistry,
    job_id: ExportId,
    status: ExportStatus,
) -> ExportStatusSnapshot {
    for _ in 0..500 {
        if let Some(snapshot) = registry.status(job_id) {
            if snapshot.status == status {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "job {} never reached {}, last seen {:?}",
        job_id,
        status,
        registry.status(job_id)
    );
}

/// Poll until the job is no longer registered.
pub async fn wait_until_gone(registry: &ExportJobRegistry, job_id: ExportId) {
    for _ in 0..500 {
        if registry.status(job_id).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} still registered: {:?}", job_id, registry.status(job_id));
}

/// Poll until the job is in `phase` or beyond.
pub async fn wait_for_phase(
    registry: &ExportJobRegistry,
    job_id: ExportId,
    phase: notes_export::ExportPhase,
) {
    for _ in 0..500 {
        if let Some(snapshot) = registry.status(job_id) {
            if snapshot.phase >= phase {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached phase {}", job_id, phase);
}

pub fn write_archive(dir: &Path, bytes: &[u8]) -> PathBuf {
    let path = dir.join("incoming.zip");
    std::fs::write(&path, bytes).expect("write archive");
    path
}

/// Attachment store whose reads block until the gate is opened.
pub struct GatedAttachments {
    pub inner: InMemoryAttachmentStore,
    gate: Semaphore,
}

impl GatedAttachments {
    pub fn new() -> Self {
        Self {
            inner: InMemoryAttachmentStore::new(),
            gate: Semaphore::new(0),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl AttachmentStore for GatedAttachments {
    async fn get(&self, file_id: &str) -> Result<Option<Blob>> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        self.inner.get(file_id).await
    }

    async fn put(&self, book: &BookRef, file_name: &str, blob: Blob) -> Result<String> {
        self.inner.put(book, file_name, blob).await
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        self.inner.delete(file_id).await
    }
}

/// Document store that rejects every upload.
pub struct RejectingDocuments;

#[async_trait]
impl DocumentStore for RejectingDocuments {
    async fn upload(&self, _: &BookRef, _: &str, _: &str, _: &Path) -> Result<()> {
        Err(Error::Store("quota exceeded".to_string()))
    }
}
