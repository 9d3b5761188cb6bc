//! Collaborator traits consumed by the export/import engine.
//!
//! The engine never talks to a database, blob backend or permission system
//! directly. Concrete services implement these traits; [`crate::memory`]
//! provides in-memory implementations.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// NOTE STORE
// =============================================================================

/// Persistent note tree, one tree per book.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Fetch a note by store id. `Ok(None)` when it does not exist.
    async fn get(&self, id: &str) -> Result<Option<NoteRef>>;

    /// Fetch a note by its name within a book.
    async fn get_by_name(&self, book: &BookRef, name: &str) -> Result<Option<NoteRef>>;

    /// Root note of a book.
    async fn book_home(&self, book: &BookRef) -> Result<Option<NoteRef>>;

    /// Live children of a note, in display order.
    async fn list_children(&self, id: &str) -> Result<Vec<NoteRef>>;

    /// Ids of every ancestor of a note, ordered root first, immediate parent last.
    async fn list_ancestors(&self, id: &str) -> Result<Vec<String>>;

    /// Create a note under `parent_id`, in the parent's book.
    ///
    /// Fails with [`crate::Error::Conflict`] when the name is already taken.
    async fn create(&self, parent_id: &str, note: NewNote) -> Result<NoteRef>;

    /// Persist title, content and properties of an existing note.
    async fn update(&self, note: &NoteRef) -> Result<NoteRef>;

    /// Delete a note and its whole subtree.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Record the current state of a note as a new version.
    async fn create_version(&self, id: &str, author: &str) -> Result<()>;
}

// =============================================================================
// ATTACHMENT STORE
// =============================================================================

/// Blob storage backing inline images and featured images.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Fetch a blob. `Ok(None)` when it does not exist.
    async fn get(&self, file_id: &str) -> Result<Option<Blob>>;

    /// Store a blob in a book and return its new id.
    async fn put(&self, book: &BookRef, file_name: &str, blob: Blob) -> Result<String>;

    /// Delete a blob. Deleting a missing blob is not an error.
    async fn delete(&self, file_id: &str) -> Result<()>;
}

// =============================================================================
// PERMISSIONS
// =============================================================================

/// Access control over notes.
#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn check_access(&self, identity: &Identity, note: &NoteRef, access: Access)
        -> Result<bool>;
}

// =============================================================================
// DOCUMENT STORE
// =============================================================================

/// Document space receiving finished export archives.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Copy the file at `path` into `folder` of the book owner's documents.
    async fn upload(&self, book: &BookRef, folder: &str, file_name: &str, path: &Path)
        -> Result<()>;
}
