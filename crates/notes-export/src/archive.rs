//! Export archive format.
//!
//! A zip archive with:
//!
//! - `notesExport_<millis>.json`: the [`ExportDocument`], a tree of notes;
//! - `<file>`: one entry per inline media file, at the root;
//! - `featuredImages/<file>`: featured images.
//!
//! Writing is blocking and runs on the blocking pool. The writer checks a
//! cancellation predicate before every entry and removes the partial file on
//! any error.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use notes_core::defaults::{EXPORT_DOCUMENT_PREFIX, FEATURED_IMAGES_DIR};
use notes_core::{Error, NoteRef, Result};

use crate::graph::{ExportForest, NodeIndex};
use crate::staging::safe_file_name;

/// A note as stored in the archive, with its exported children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveNode {
    #[serde(flatten)]
    pub note: NoteRef,
    #[serde(default)]
    pub children: Vec<ArchiveNode>,
}

/// Unit replayed by the importer: an archived note and its subtree.
pub type ImportUnit = ArchiveNode;

impl ArchiveNode {
    pub fn new(note: NoteRef) -> Self {
        Self {
            note,
            children: Vec::new(),
        }
    }

    /// Number of notes in this subtree, including `self`.
    pub fn count(&self) -> usize {
        let mut total = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            total += 1;
            stack.extend(node.children.iter());
        }
        total
    }
}

/// The JSON document at the heart of an export archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub exported_at: DateTime<Utc>,
    pub notes: Vec<ArchiveNode>,
}

impl ExportDocument {
    pub fn new(exported_at: DateTime<Utc>, notes: Vec<ArchiveNode>) -> Self {
        Self { exported_at, notes }
    }

    /// Build the document tree from a forest, keeping sibling order.
    pub fn from_forest(forest: &ExportForest, exported_at: DateTime<Utc>) -> Self {
        let notes = forest
            .roots()
            .iter()
            .map(|&root| archive_subtree(forest, root))
            .collect();
        Self { exported_at, notes }
    }

    /// Archive entry name of the document.
    pub fn entry_name(&self) -> String {
        format!(
            "{}{}.json",
            EXPORT_DOCUMENT_PREFIX,
            self.exported_at.timestamp_millis()
        )
    }

    pub fn note_count(&self) -> usize {
        self.notes.iter().map(ArchiveNode::count).sum()
    }
}

fn archive_subtree(forest: &ExportForest, index: NodeIndex) -> ArchiveNode {
    let node = forest.node(index);
    ArchiveNode {
        note: node.note.clone(),
        children: node
            .children
            .iter()
            .map(|&child| archive_subtree(forest, child))
            .collect(),
    }
}

/// Writes export archives.
pub struct ArchiveWriter;

impl ArchiveWriter {
    /// Write `document`, `media` and `featured` into a new archive at `path`.
    ///
    /// Returns the number of entries written. `is_cancelled` is checked before
    /// each entry; a positive check aborts with [`Error::Cancelled`]. On any
    /// error the partial archive is removed.
    pub fn write<F>(
        path: &Path,
        document: &ExportDocument,
        media: &[PathBuf],
        featured: &[PathBuf],
        is_cancelled: F,
    ) -> Result<usize>
    where
        F: Fn() -> bool,
    {
        let result = Self::write_entries(path, document, media, featured, &is_cancelled);
        if let Err(ref e) = result {
            if let Err(remove_err) = std::fs::remove_file(path) {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %remove_err, "Failed to remove partial archive");
                }
            }
            debug!(path = %path.display(), error = %e, "Archive write aborted");
        }
        result
    }

    fn write_entries(
        path: &Path,
        document: &ExportDocument,
        media: &[PathBuf],
        featured: &[PathBuf],
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<usize> {
        let checkpoint = || {
            if is_cancelled() {
                Err(Error::Cancelled)
            } else {
                Ok(())
            }
        };

        checkpoint()?;
        let mut zip = ZipWriter::new(File::create(path)?);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut entries = 0;

        zip.start_file(document.entry_name(), options)?;
        serde_json::to_writer(&mut zip, document)?;
        entries += 1;

        for file in media {
            checkpoint()?;
            zip.start_file(entry_file_name(file)?, options)?;
            io::copy(&mut File::open(file)?, &mut zip)?;
            entries += 1;
        }

        checkpoint()?;
        zip.add_directory(format!("{}/", FEATURED_IMAGES_DIR), options)?;
        for file in featured {
            checkpoint()?;
            zip.start_file(
                format!("{}/{}", FEATURED_IMAGES_DIR, entry_file_name(file)?),
                options,
            )?;
            io::copy(&mut File::open(file)?, &mut zip)?;
            entries += 1;
        }

        checkpoint()?;
        zip.finish()?;
        Ok(entries)
    }
}

fn entry_file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Archive(format!("unusable media path {}", path.display())))
}

/// Everything the importer needs from an archive, read up front.
#[derive(Debug, Clone)]
pub struct ArchiveContents {
    pub document: ExportDocument,
    /// Inline media by file name.
    pub media: HashMap<String, Vec<u8>>,
    /// Featured images by file name (without the directory prefix).
    pub featured: HashMap<String, Vec<u8>>,
}

impl ArchiveContents {
    /// Featured image recorded as `id`, as `(file name, data)`.
    ///
    /// `id` is the staged file name; a bare attachment id falls back to the
    /// file named after it.
    pub fn featured_image(&self, id: &str) -> Option<(&str, &[u8])> {
        if let Some((name, data)) = self.featured.get_key_value(id) {
            return Some((name.as_str(), data.as_slice()));
        }
        let base = safe_file_name(id);
        let prefix = format!("{}.", base);
        self.featured
            .iter()
            .find(|(name, _)| **name == base || name.starts_with(&prefix))
            .map(|(name, data)| (name.as_str(), data.as_slice()))
    }
}

/// Reads export archives.
pub struct ArchiveReader;

impl ArchiveReader {
    /// Read the document and every file entry of the archive at `path`.
    pub fn read(path: &Path) -> Result<ArchiveContents> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        let mut document = None;
        let mut media = HashMap::new();
        let mut featured = HashMap::new();

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            // The declared size is untrusted; let the buffer grow with the data.
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;

            if let Some(file) = name.strip_prefix(&format!("{}/", FEATURED_IMAGES_DIR)) {
                featured.insert(file.to_string(), data);
            } else if name.starts_with(EXPORT_DOCUMENT_PREFIX) && name.ends_with(".json") {
                if document.is_some() {
                    return Err(Error::Archive(format!(
                        "{} holds more than one export document",
                        path.display()
                    )));
                }
                document = Some(serde_json::from_slice::<ExportDocument>(&data)?);
            } else {
                media.insert(name, data);
            }
        }

        let document = document.ok_or_else(|| {
            Error::Archive(format!("{} holds no export document", path.display()))
        })?;
        debug!(
            path = %path.display(),
            notes = document.note_count(),
            media = media.len(),
            featured = featured.len(),
            "Archive read"
        );
        Ok(ArchiveContents {
            document,
            media,
            featured,
        })
    }

    /// [`ArchiveReader::read`] on the blocking pool.
    pub async fn load(path: &Path) -> Result<ArchiveContents> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::read(&path))
            .await
            .map_err(|e| Error::Internal(format!("archive reader task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use notes_core::BookType;

    fn note(id: &str, name: &str) -> NoteRef {
        NoteRef {
            id: id.to_string(),
            name: name.to_string(),
            title: name.to_string(),
            owner: "mary".to_string(),
            author: "mary".to_string(),
            content: format!("<p>{}</p>", name),
            syntax: None,
            book_type: BookType::Group,
            book_owner: "/spaces/ops".to_string(),
            comment: None,
            properties: None,
        }
    }

    fn sample_document() -> ExportDocument {
        let mut parent = ArchiveNode::new(note("1", "Parent"));
        parent.children.push(ArchiveNode::new(note("2", "Child")));
        ExportDocument::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            vec![parent, ArchiveNode::new(note("3", "Other"))],
        )
    }

    #[test]
    fn test_document_entry_name_and_count() {
        let doc = sample_document();
        assert_eq!(doc.entry_name(), "notesExport_1772366400000.json");
        assert_eq!(doc.note_count(), 3);
    }

    #[test]
    fn test_archive_node_json_is_flat() {
        let json = serde_json::to_value(ArchiveNode::new(note("1", "Flat"))).unwrap();
        assert_eq!(json["name"], "Flat");
        assert_eq!(json["bookType"], "group");
        assert!(json["children"].as_array().unwrap().is_empty());
        assert!(json.get("note").is_none());
    }

    #[test]
    fn test_from_forest_keeps_hierarchy() {
        let mut forest = ExportForest::new();
        let a = forest.push(note("1", "A"), vec![], None);
        forest.push(note("2", "B"), vec![], Some(a));
        forest.push(note("3", "C"), vec![], None);

        let doc = ExportDocument::from_forest(&forest, Utc::now());
        assert_eq!(doc.notes.len(), 2);
        assert_eq!(doc.notes[0].note.name, "A");
        assert_eq!(doc.notes[0].children[0].note.name, "B");
        assert_eq!(doc.notes[1].note.name, "C");
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("12.png");
        std::fs::write(&media, b"png-bytes").unwrap();
        std::fs::create_dir(dir.path().join("featured")).unwrap();
        let featured = dir.path().join("featured").join("40.jpeg");
        std::fs::write(&featured, b"jpeg-bytes").unwrap();
        let path = dir.path().join("exportzip1.zip");

        let doc = sample_document();
        let entries = ArchiveWriter::write(
            &path,
            &doc,
            &[media],
            &[featured],
            || false,
        )
        .unwrap();
        assert_eq!(entries, 3);

        let contents = ArchiveReader::read(&path).unwrap();
        assert_eq!(contents.document, doc);
        assert_eq!(contents.media.get("12.png").unwrap(), b"png-bytes");
        assert_eq!(contents.featured_image("40"), Some(("40.jpeg", &b"jpeg-bytes"[..])));
        assert!(contents.featured_image("41").is_none());
    }

    #[test]
    fn test_cancelled_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("1.gif");
        std::fs::write(&media, b"gif").unwrap();
        let path = dir.path().join("exportzip2.zip");

        let checks = std::cell::Cell::new(0);
        let result = ArchiveWriter::write(&path, &sample_document(), &[media], &[], || {
            checks.set(checks.get() + 1);
            checks.get() > 1
        });

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!path.exists());
    }

    #[test]
    fn test_featured_image_by_staged_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("featured")).unwrap();
        let spaced = dir.path().join("featured").join("a_b.png");
        let plain = dir.path().join("featured").join("a_b_1.png");
        std::fs::write(&spaced, b"spaced").unwrap();
        std::fs::write(&plain, b"plain").unwrap();
        let path = dir.path().join("exportzip3.zip");
        ArchiveWriter::write(&path, &sample_document(), &[], &[spaced, plain], || false).unwrap();

        let contents = ArchiveReader::read(&path).unwrap();
        assert_eq!(contents.featured_image("a_b_1.png"), Some(("a_b_1.png", &b"plain"[..])));
        assert_eq!(contents.featured_image("a_b.png"), Some(("a_b.png", &b"spaced"[..])));
    }

    #[test]
    fn test_read_ignores_declared_entry_size() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inflated.zip");
        let doc = sample_document();
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file("big.png", stored).unwrap();
        zip.write_all(b"tiny").unwrap();
        zip.start_file(doc.entry_name(), stored).unwrap();
        zip.write_all(&serde_json::to_vec(&doc).unwrap()).unwrap();
        zip.finish().unwrap();

        // Claim ~4 GiB for the first entry in both headers.
        let mut bytes = std::fs::read(&path).unwrap();
        let huge = 0xFFFF_FFF0u32.to_le_bytes();
        let local = bytes.windows(4).position(|w| w == b"PK\x03\x04").unwrap();
        bytes[local + 22..local + 26].copy_from_slice(&huge);
        let central = bytes.windows(4).position(|w| w == b"PK\x01\x02").unwrap();
        bytes[central + 24..central + 28].copy_from_slice(&huge);
        std::fs::write(&path, &bytes).unwrap();

        match ArchiveReader::read(&path) {
            Ok(contents) => assert_eq!(contents.media.get("big.png").unwrap(), b"tiny"),
            Err(e) => assert!(matches!(e, Error::Archive(_) | Error::Io(_)), "{}", e),
        }
    }

    #[test]
    fn test_read_rejects_archive_without_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.zip");
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        zip.start_file("readme.txt", SimpleFileOptions::default()).unwrap();
        zip.finish().unwrap();

        assert!(matches!(ArchiveReader::read(&path), Err(Error::Archive(_))));
    }
}
