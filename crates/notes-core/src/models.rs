//! Domain models shared by the export/import engine and its collaborators.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::defaults::HOME_NOTE_NAME;

// =============================================================================
// NOTES AND BOOKS
// =============================================================================

/// Namespace kind a note belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookType {
    /// Portal-wide book.
    Portal,
    /// Group (space) book.
    Group,
    /// Per-user book.
    User,
}

impl BookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookType::Portal => "portal",
            BookType::Group => "group",
            BookType::User => "user",
        }
    }
}

impl fmt::Display for BookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "portal" => Ok(BookType::Portal),
            "group" => Ok(BookType::Group),
            "user" => Ok(BookType::User),
            other => Err(format!("unknown book type: {}", other)),
        }
    }
}

/// A book: the `(type, owner)` namespace holding a tree of notes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRef {
    pub book_type: BookType,
    pub owner: String,
}

impl BookRef {
    pub fn new(book_type: BookType, owner: impl Into<String>) -> Self {
        Self {
            book_type,
            owner: owner.into(),
        }
    }
}

/// Illustration attached to a note through its properties rather than inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturedImage {
    /// Blob id in the attachment store.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
}

/// Structured note properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub featured_image: Option<FeaturedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// A single note as seen by the export/import engine.
///
/// `id` is store-local. `(book_type, book_owner, name)` is unique within the
/// store and survives an export/import boundary, see [`PortableRef`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRef {
    pub id: String,
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub syntax: Option<String>,
    pub book_type: BookType,
    pub book_owner: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub properties: Option<NoteProperties>,
}

impl NoteRef {
    pub fn book(&self) -> BookRef {
        BookRef::new(self.book_type, self.book_owner.clone())
    }

    pub fn portable_ref(&self) -> PortableRef {
        PortableRef {
            book_type: self.book_type,
            book_owner: self.book_owner.clone(),
            name: self.name.clone(),
        }
    }

    /// Whether this is the root note of its book.
    pub fn is_home(&self) -> bool {
        self.name == HOME_NOTE_NAME
    }

    pub fn featured_image(&self) -> Option<&FeaturedImage> {
        self.properties
            .as_ref()
            .and_then(|p| p.featured_image.as_ref())
    }
}

/// Portable identity of a note: stable across stores, unlike `NoteRef::id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortableRef {
    pub book_type: BookType,
    pub book_owner: String,
    pub name: String,
}

impl PortableRef {
    pub fn book(&self) -> BookRef {
        BookRef::new(self.book_type, self.book_owner.clone())
    }
}

/// Payload for creating a note through the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNote {
    pub name: String,
    pub title: String,
    pub content: String,
    pub syntax: Option<String>,
    pub comment: Option<String>,
    pub properties: Option<NoteProperties>,
    /// User recorded as owner and author of the created note.
    pub author: String,
}

impl NewNote {
    pub fn new(name: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            content: content.into(),
            syntax: None,
            comment: None,
            properties: None,
            author: String::new(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_properties(mut self, properties: NoteProperties) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Build a creation payload from an archived note, authored by `author`.
    pub fn from_note(note: &NoteRef, author: impl Into<String>) -> Self {
        Self {
            name: note.name.clone(),
            title: note.title.clone(),
            content: note.content.clone(),
            syntax: note.syntax.clone(),
            comment: note.comment.clone(),
            properties: note.properties.clone(),
            author: author.into(),
        }
    }
}

/// Derive a note name from its title.
///
/// Whitespace runs become `_`; characters other than alphanumerics, `_`, `-`
/// and `.` are dropped.
pub fn derive_note_name(title: &str) -> String {
    let mut name = String::with_capacity(title.len());
    let mut pending_sep = false;
    for c in title.trim().chars() {
        if c.is_whitespace() {
            pending_sep = true;
            continue;
        }
        if !(c.is_alphanumeric() || matches!(c, '_' | '-' | '.')) {
            continue;
        }
        if pending_sep && !name.is_empty() {
            name.push('_');
        }
        pending_sep = false;
        name.push(c);
    }
    name
}

// =============================================================================
// IDENTITY AND ACCESS
// =============================================================================

/// The user on whose behalf an export or import runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }
}

/// Access level checked against the permission service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    View,
    Edit,
}

/// Binary content held by the attachment store.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub data: Vec<u8>,
    pub mime_type: Option<String>,
}

impl Blob {
    pub fn new(data: Vec<u8>, mime_type: Option<String>) -> Self {
        Self { data, mime_type }
    }
}

// =============================================================================
// EXPORT STATUS
// =============================================================================

/// Identifier of an export job, chosen by the caller.
pub type ExportId = u64;

/// Lifecycle status of an export job.
///
/// Variants are ordered: a job only ever moves to a higher rank.
/// `Cancelled`, `ZipCreated` and `Failed` share a rank, so a job that reached
/// one of them cannot switch to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportStatus {
    Started,
    InProgress,
    Cancelled,
    ZipCreated,
    Failed,
    Done,
}

impl ExportStatus {
    pub fn rank(&self) -> u8 {
        match self {
            ExportStatus::Started => 0,
            ExportStatus::InProgress => 1,
            ExportStatus::Cancelled | ExportStatus::ZipCreated | ExportStatus::Failed => 2,
            ExportStatus::Done => 3,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: ExportStatus) -> bool {
        match self {
            ExportStatus::Done => false,
            ExportStatus::Cancelled | ExportStatus::Failed => false,
            ExportStatus::ZipCreated => next == ExportStatus::Done,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() >= 2
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportStatus::Started => "STARTED",
            ExportStatus::InProgress => "IN_PROGRESS",
            ExportStatus::Cancelled => "CANCELLED",
            ExportStatus::ZipCreated => "ZIP_CREATED",
            ExportStatus::Failed => "FAILED",
            ExportStatus::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// Pipeline phase of a running export job, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportPhase {
    GettingNotes,
    UpdatingParents,
    CreatingContent,
    ProcessingImages,
    RewritingLinks,
    CreatingArchive,
    CleaningUp,
    Done,
}

impl ExportPhase {
    pub const ALL: [ExportPhase; 8] = [
        ExportPhase::GettingNotes,
        ExportPhase::UpdatingParents,
        ExportPhase::CreatingContent,
        ExportPhase::ProcessingImages,
        ExportPhase::RewritingLinks,
        ExportPhase::CreatingArchive,
        ExportPhase::CleaningUp,
        ExportPhase::Done,
    ];

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportPhase::GettingNotes => "GETTING_NOTES",
            ExportPhase::UpdatingParents => "UPDATING_PARENTS",
            ExportPhase::CreatingContent => "CREATING_CONTENT",
            ExportPhase::ProcessingImages => "PROCESSING_IMAGES",
            ExportPhase::RewritingLinks => "REWRITING_LINKS",
            ExportPhase::CreatingArchive => "CREATING_ARCHIVE",
            ExportPhase::CleaningUp => "CLEANING_UP",
            ExportPhase::Done => "DONE",
        }
    }
}

impl fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of an export job, as returned to polling callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatusSnapshot {
    pub status: ExportStatus,
    pub phase: ExportPhase,
    pub processed_count: usize,
    /// Per-note problems that were skipped (missing, forbidden, unreadable).
    pub errors: Vec<String>,
    /// Set when the job ended in [`ExportStatus::Failed`].
    pub failure: Option<String>,
}

/// How the note set of an export request is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    /// Each requested note together with all of its descendants.
    Subtree,
    /// Exactly the requested notes, re-parented under their nearest selected ancestor.
    Selection,
}

impl ExportMode {
    pub fn from_export_all(export_all: bool) -> Self {
        if export_all {
            ExportMode::Subtree
        } else {
            ExportMode::Selection
        }
    }
}

// =============================================================================
// IMPORT
// =============================================================================

/// Strategy applied when an imported note's name already exists in the target book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Delete the existing note and create it again from the archive.
    #[serde(rename = "overwrite")]
    Overwrite,
    /// Create a copy with a `_N` suffixed title.
    #[serde(rename = "duplicate")]
    Duplicate,
    /// Update title and content in place, recording a version.
    #[serde(rename = "update")]
    Update,
    /// Empty the target first, then behave like `Overwrite`.
    #[serde(rename = "replaceAll")]
    ReplaceAll,
    /// Keep the existing note.
    #[default]
    #[serde(rename = "none")]
    None,
}

impl ConflictPolicy {
    /// Parse a policy name. Unknown or empty values fall back to [`ConflictPolicy::None`].
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("overwrite") => ConflictPolicy::Overwrite,
            Some("duplicate") => ConflictPolicy::Duplicate,
            Some("update") => ConflictPolicy::Update,
            Some("replaceAll") => ConflictPolicy::ReplaceAll,
            _ => ConflictPolicy::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Overwrite => "overwrite",
            ConflictPolicy::Duplicate => "duplicate",
            ConflictPolicy::Update => "update",
            ConflictPolicy::ReplaceAll => "replaceAll",
            ConflictPolicy::None => "none",
        }
    }

    /// Whether the existing note is deleted and recreated on conflict.
    pub fn recreates(&self) -> bool {
        matches!(self, ConflictPolicy::Overwrite | ConflictPolicy::ReplaceAll)
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
