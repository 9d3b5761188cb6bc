//! Centralized default constants for the notes export engine.
//!
//! All crates reference these constants instead of defining their own magic
//! values. Organized by domain area.

// =============================================================================
// BOOKS
// =============================================================================

/// Name of the root note every book carries. Never recreated on import.
pub const HOME_NOTE_NAME: &str = "WikiHome";

// =============================================================================
// CONTENT REWRITING
// =============================================================================

/// URL prefix under which the portal serves note attachments.
pub const ATTACHMENT_URL_PREFIX: &str = "/portal/rest/wiki/attachments/";

/// CSS class marking an anchor as a link to another note.
pub const NOTE_LINK_CLASS: &str = "noteLink";

// =============================================================================
// ARCHIVE LAYOUT
// =============================================================================

/// File name prefix of the JSON document inside an export archive.
pub const EXPORT_DOCUMENT_PREFIX: &str = "notesExport_";

/// Directory holding featured images inside an export archive.
pub const FEATURED_IMAGES_DIR: &str = "featuredImages";

/// File name prefix of export archives on disk.
pub const EXPORT_ARCHIVE_PREFIX: &str = "exportzip";

/// Prefix of per-job temporary directories.
pub const EXPORT_TEMP_PREFIX: &str = "notesExport_";

// =============================================================================
// EXPORT JOBS
// =============================================================================

/// Default maximum number of exports running concurrently.
pub const EXPORT_MAX_CONCURRENT: usize = 4;

/// Default broadcast channel capacity for export events.
pub const EXPORT_EVENT_CAPACITY: usize = 256;

/// Folder of the requester's document space receiving finished archives.
pub const EXPORT_UPLOAD_FOLDER: &str = "Documents/Notes/exports";

/// Date format of uploaded archive names (`notesExport_19_10_2026.zip`).
pub const EXPORT_UPLOAD_DATE_FORMAT: &str = "%d_%m_%Y";

// =============================================================================
// IMPORT
// =============================================================================

/// Upper bound on `_N` suffixes tried by the duplicate conflict policy.
pub const IMPORT_DUPLICATE_MAX_ATTEMPTS: u32 = 10_000;
