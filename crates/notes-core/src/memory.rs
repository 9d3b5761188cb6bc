//! In-memory collaborator implementations.
//!
//! Backed by `tokio::sync::RwLock`-guarded maps. Used by the test suites and
//! by embedders that want to run the engine without a persistent backend.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::defaults::HOME_NOTE_NAME;
use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::{AttachmentStore, DocumentStore, NoteStore, PermissionService};

// =============================================================================
// NOTE STORE
// =============================================================================

#[derive(Debug, Clone)]
struct StoredNote {
    note: NoteRef,
    parent_id: Option<String>,
    children: Vec<String>,
}

#[derive(Debug, Default)]
struct NoteTable {
    notes: HashMap<String, StoredNote>,
    versions: HashMap<String, Vec<NoteRef>>,
    next_id: u64,
}

impl NoteTable {
    fn find_by_name(&self, book: &BookRef, name: &str) -> Option<&StoredNote> {
        self.notes.values().find(|s| {
            s.note.book_type == book.book_type && s.note.book_owner == book.owner && s.note.name == name
        })
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn remove_subtree(&mut self, id: &str) -> usize {
        let mut removed = 0;
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(stored) = self.notes.remove(&current) {
                stack.extend(stored.children);
                self.versions.remove(&current);
                removed += 1;
            }
        }
        removed
    }
}

/// Note store holding every book in memory. Ids are decimal counters.
#[derive(Debug, Default)]
pub struct InMemoryNoteStore {
    table: RwLock<NoteTable>,
}

impl InMemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a book and return its home note.
    pub async fn create_book(&self, book: BookRef, owner: &str) -> Result<NoteRef> {
        let mut table = self.table.write().await;
        if table.find_by_name(&book, HOME_NOTE_NAME).is_some() {
            return Err(Error::Conflict(format!(
                "book {}:{} already exists",
                book.book_type, book.owner
            )));
        }
        let id = table.allocate_id();
        let home = NoteRef {
            id: id.clone(),
            name: HOME_NOTE_NAME.to_string(),
            title: "Home".to_string(),
            owner: owner.to_string(),
            author: owner.to_string(),
            content: String::new(),
            syntax: None,
            book_type: book.book_type,
            book_owner: book.owner.clone(),
            comment: None,
            properties: None,
        };
        table.notes.insert(
            id,
            StoredNote {
                note: home.clone(),
                parent_id: None,
                children: Vec::new(),
            },
        );
        Ok(home)
    }

    /// Versions recorded for a note, oldest first.
    pub async fn versions(&self, id: &str) -> Vec<NoteRef> {
        self.table
            .read()
            .await
            .versions
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of notes across all books.
    pub async fn len(&self) -> usize {
        self.table.read().await.notes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every note of a book, in no particular order.
    pub async fn notes_in(&self, book: &BookRef) -> Vec<NoteRef> {
        self.table
            .read()
            .await
            .notes
            .values()
            .filter(|s| s.note.book_type == book.book_type && s.note.book_owner == book.owner)
            .map(|s| s.note.clone())
            .collect()
    }

    /// Parent id of a note, `None` for book roots and unknown ids.
    pub async fn parent_of(&self, id: &str) -> Option<String> {
        self.table
            .read()
            .await
            .notes
            .get(id)
            .and_then(|s| s.parent_id.clone())
    }
}

#[async_trait]
impl NoteStore for InMemoryNoteStore {
    async fn get(&self, id: &str) -> Result<Option<NoteRef>> {
        Ok(self.table.read().await.notes.get(id).map(|s| s.note.clone()))
    }

    async fn get_by_name(&self, book: &BookRef, name: &str) -> Result<Option<NoteRef>> {
        Ok(self
            .table
            .read()
            .await
            .find_by_name(book, name)
            .map(|s| s.note.clone()))
    }

    async fn book_home(&self, book: &BookRef) -> Result<Option<NoteRef>> {
        self.get_by_name(book, HOME_NOTE_NAME).await
    }

    async fn list_children(&self, id: &str) -> Result<Vec<NoteRef>> {
        let table = self.table.read().await;
        let stored = table
            .notes
            .get(id)
            .ok_or_else(|| Error::NoteNotFound(id.to_string()))?;
        Ok(stored
            .children
            .iter()
            .filter_map(|child| table.notes.get(child))
            .map(|s| s.note.clone())
            .collect())
    }

    async fn list_ancestors(&self, id: &str) -> Result<Vec<String>> {
        let table = self.table.read().await;
        let mut current = table
            .notes
            .get(id)
            .ok_or_else(|| Error::NoteNotFound(id.to_string()))?
            .parent_id
            .clone();
        let mut ancestors = Vec::new();
        while let Some(parent_id) = current {
            current = table.notes.get(&parent_id).and_then(|s| s.parent_id.clone());
            ancestors.push(parent_id);
        }
        ancestors.reverse();
        Ok(ancestors)
    }

    async fn create(&self, parent_id: &str, note: NewNote) -> Result<NoteRef> {
        let mut table = self.table.write().await;
        let parent = table
            .notes
            .get(parent_id)
            .ok_or_else(|| Error::NoteNotFound(parent_id.to_string()))?
            .note
            .clone();
        if note.name.is_empty() {
            return Err(Error::InvalidInput("note name must not be empty".to_string()));
        }
        if table.find_by_name(&parent.book(), &note.name).is_some() {
            return Err(Error::Conflict(format!(
                "note '{}' already exists in {}:{}",
                note.name, parent.book_type, parent.book_owner
            )));
        }
        let id = table.allocate_id();
        let created = NoteRef {
            id: id.clone(),
            name: note.name,
            title: note.title,
            owner: note.author.clone(),
            author: note.author,
            content: note.content,
            syntax: note.syntax,
            book_type: parent.book_type,
            book_owner: parent.book_owner.clone(),
            comment: note.comment,
            properties: note.properties,
        };
        table.notes.insert(
            id.clone(),
            StoredNote {
                note: created.clone(),
                parent_id: Some(parent_id.to_string()),
                children: Vec::new(),
            },
        );
        if let Some(parent) = table.notes.get_mut(parent_id) {
            parent.children.push(id);
        }
        debug!(note_id = %created.id, note_name = %created.name, "memory store: created note");
        Ok(created)
    }

    async fn update(&self, note: &NoteRef) -> Result<NoteRef> {
        let mut table = self.table.write().await;
        let book = note.book();
        if let Some(other) = table.find_by_name(&book, &note.name) {
            if other.note.id != note.id {
                return Err(Error::Conflict(format!("note '{}' already exists", note.name)));
            }
        }
        let stored = table
            .notes
            .get_mut(&note.id)
            .ok_or_else(|| Error::NoteNotFound(note.id.clone()))?;
        stored.note.name = note.name.clone();
        stored.note.title = note.title.clone();
        stored.note.content = note.content.clone();
        stored.note.syntax = note.syntax.clone();
        stored.note.comment = note.comment.clone();
        stored.note.properties = note.properties.clone();
        Ok(stored.note.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut table = self.table.write().await;
        let parent_id = table
            .notes
            .get(id)
            .ok_or_else(|| Error::NoteNotFound(id.to_string()))?
            .parent_id
            .clone();
        if let Some(parent) = parent_id.and_then(|p| table.notes.get_mut(&p)) {
            parent.children.retain(|c| c != id);
        }
        let removed = table.remove_subtree(id);
        debug!(note_id = %id, removed, "memory store: deleted subtree");
        Ok(())
    }

    async fn create_version(&self, id: &str, _author: &str) -> Result<()> {
        let mut table = self.table.write().await;
        let snapshot = table
            .notes
            .get(id)
            .ok_or_else(|| Error::NoteNotFound(id.to_string()))?
            .note
            .clone();
        table.versions.entry(id.to_string()).or_default().push(snapshot);
        Ok(())
    }
}

// =============================================================================
// ATTACHMENT STORE
// =============================================================================

#[derive(Debug, Default)]
struct BlobTable {
    blobs: HashMap<String, Blob>,
    next_id: u64,
}

/// Attachment store keeping blobs in a map keyed by file id.
#[derive(Debug, Default)]
pub struct InMemoryAttachmentStore {
    table: RwLock<BlobTable>,
}

impl InMemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob under a caller-chosen id.
    pub async fn insert(&self, file_id: impl Into<String>, blob: Blob) {
        self.table.write().await.blobs.insert(file_id.into(), blob);
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.blobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AttachmentStore for InMemoryAttachmentStore {
    async fn get(&self, file_id: &str) -> Result<Option<Blob>> {
        Ok(self.table.read().await.blobs.get(file_id).cloned())
    }

    async fn put(&self, _book: &BookRef, _file_name: &str, blob: Blob) -> Result<String> {
        let mut table = self.table.write().await;
        table.next_id += 1;
        let id = format!("blob-{}", table.next_id);
        table.blobs.insert(id.clone(), blob);
        Ok(id)
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        self.table.write().await.blobs.remove(file_id);
        Ok(())
    }
}

// =============================================================================
// PERMISSIONS
// =============================================================================

/// Permission service allowing everything except explicitly denied notes.
#[derive(Debug, Default)]
pub struct InMemoryPermissions {
    denied: RwLock<HashSet<(String, Access)>>,
}

impl InMemoryPermissions {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Deny `access` on the note with `note_id` for every identity.
    pub async fn deny(&self, note_id: impl Into<String>, access: Access) {
        self.denied.write().await.insert((note_id.into(), access));
    }
}

#[async_trait]
impl PermissionService for InMemoryPermissions {
    async fn check_access(
        &self,
        _identity: &Identity,
        note: &NoteRef,
        access: Access,
    ) -> Result<bool> {
        Ok(!self.denied.read().await.contains(&(note.id.clone(), access)))
    }
}

// =============================================================================
// DOCUMENT STORE
// =============================================================================

/// Record of one archive handed to the document store.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedDocument {
    pub book: BookRef,
    pub folder: String,
    pub file_name: String,
    pub size: u64,
}

/// Document store that only records what it was given.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    uploads: RwLock<Vec<UploadedDocument>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn uploads(&self) -> Vec<UploadedDocument> {
        self.uploads.read().await.clone()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn upload(
        &self,
        book: &BookRef,
        folder: &str,
        file_name: &str,
        path: &Path,
    ) -> Result<()> {
        let size = tokio::fs::metadata(path).await?.len();
        self.uploads.write().await.push(UploadedDocument {
            book: book.clone(),
            folder: folder.to_string(),
            file_name: file_name.to_string(),
            size,
        });
        Ok(())
    }
}
