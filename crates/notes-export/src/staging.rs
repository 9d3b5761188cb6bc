//! Per-job staging directory for extracted media.
//!
//! The directory is a [`tempfile::TempDir`]: dropping the staging area removes
//! it, so a cancelled or failed job cannot leak files.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use notes_core::defaults::{EXPORT_ARCHIVE_PREFIX, EXPORT_TEMP_PREFIX};
use notes_core::{Error, ExportId, Result};

/// Files staged in one directory, one name per source id.
#[derive(Debug, Default)]
struct StagedFiles {
    by_name: BTreeMap<String, PathBuf>,
    by_source: HashMap<String, String>,
}

impl StagedFiles {
    /// `file_name`, or `<stem>_<n>.<ext>` when another source already holds it.
    fn free_name(&self, file_name: &str) -> String {
        if !self.by_name.contains_key(file_name) {
            return file_name.to_string();
        }
        let path = Path::new(file_name);
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name);
        let extension = path.extension().and_then(|e| e.to_str());
        (1u64..)
            .map(|n| match extension {
                Some(ext) => format!("{}_{}.{}", stem, n, ext),
                None => format!("{}_{}", stem, n),
            })
            .find(|candidate| !self.by_name.contains_key(candidate))
            .unwrap_or_else(|| file_name.to_string())
    }

    async fn stage(
        &mut self,
        dir: &Path,
        source_id: &str,
        file_name: &str,
        data: &[u8],
    ) -> Result<String> {
        if let Some(name) = self.by_source.get(source_id) {
            return Ok(name.clone());
        }
        let name = self.free_name(file_name);
        let path = dir.join(&name);
        tokio::fs::write(&path, data).await?;
        self.by_name.insert(name.clone(), path);
        self.by_source.insert(source_id.to_string(), name.clone());
        Ok(name)
    }

    fn paths(&self) -> Vec<PathBuf> {
        self.by_name.values().cloned().collect()
    }
}

/// Media and featured images written for one export job.
#[derive(Debug)]
pub struct ExportStaging {
    dir: TempDir,
    media: StagedFiles,
    featured: StagedFiles,
}

impl ExportStaging {
    /// Create a fresh staging directory inside `parent`.
    pub fn create_in(parent: &Path, job_id: ExportId) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}{}_", EXPORT_TEMP_PREFIX, job_id))
            .tempdir_in(parent)?;
        Ok(Self {
            dir,
            media: StagedFiles::default(),
            featured: StagedFiles::default(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// File name the media of `source_id` was staged under, if any.
    pub fn staged_media(&self, source_id: &str) -> Option<&str> {
        self.media.by_source.get(source_id).map(String::as_str)
    }

    /// Write the inline media of `source_id` and return its staged file name.
    ///
    /// Staging the same source twice keeps the first write. Two sources
    /// asking for the same name get distinct files.
    pub async fn add_media(
        &mut self,
        source_id: &str,
        file_name: &str,
        data: &[u8],
    ) -> Result<String> {
        let dir = self.dir.path().to_path_buf();
        self.media.stage(&dir, source_id, file_name, data).await
    }

    /// Write a featured image, kept apart from inline media.
    pub async fn add_featured(
        &mut self,
        source_id: &str,
        file_name: &str,
        data: &[u8],
    ) -> Result<String> {
        let dir = self.dir.path().join("featured");
        tokio::fs::create_dir_all(&dir).await?;
        self.featured.stage(&dir, source_id, file_name, data).await
    }

    pub fn media_files(&self) -> Vec<PathBuf> {
        self.media.paths()
    }

    pub fn featured_files(&self) -> Vec<PathBuf> {
        self.featured.paths()
    }

    /// Remove the directory, reporting failures instead of ignoring them.
    pub fn close(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }
}

/// Reserve a fresh archive file for one run of job `job_id` in `dir`.
///
/// Every run gets its own `exportzip<id>_<random>.zip`, so a job id reused
/// after a dispose never shares a file with the run it replaced.
pub fn reserve_archive(dir: &Path, job_id: ExportId) -> Result<PathBuf> {
    tempfile::Builder::new()
        .prefix(&format!("{}{}_", EXPORT_ARCHIVE_PREFIX, job_id))
        .suffix(".zip")
        .tempfile_in(dir)?
        .into_temp_path()
        .keep()
        .map_err(|e| Error::Io(e.error))
}

/// Reduce an attachment id to a safe file name.
///
/// Keeps ASCII alphanumerics, `.`, `_` and `-`; everything else becomes `_`.
/// Leading dots are stripped so the result can never name a parent directory.
pub fn safe_file_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}
