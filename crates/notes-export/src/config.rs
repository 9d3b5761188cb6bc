//! Export engine configuration.

use std::path::PathBuf;

use notes_core::defaults::{ATTACHMENT_URL_PREFIX, EXPORT_MAX_CONCURRENT, EXPORT_UPLOAD_FOLDER};

/// Configuration for the export registry, workers and import reconciler.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Directory receiving per-job temporary directories and finished archives.
    pub export_dir: PathBuf,
    /// Maximum number of exports running at the same time.
    pub max_concurrent_exports: usize,
    /// URL prefix of attachment links found in note content.
    pub attachment_url_prefix: String,
    /// Document folder finished archives are uploaded to.
    pub upload_folder: String,
    /// Whether finished archives are uploaded to the document store.
    pub upload_archives: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            export_dir: std::env::temp_dir(),
            max_concurrent_exports: EXPORT_MAX_CONCURRENT,
            attachment_url_prefix: ATTACHMENT_URL_PREFIX.to_string(),
            upload_folder: EXPORT_UPLOAD_FOLDER.to_string(),
            upload_archives: true,
        }
    }
}

impl ExportConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `NOTES_EXPORT_DIR` | system temp dir | Temp files and archives |
    /// | `NOTES_EXPORT_MAX_CONCURRENT` | `4` | Max concurrent exports |
    /// | `NOTES_ATTACHMENT_URL_PREFIX` | `/portal/rest/wiki/attachments/` | Attachment URL prefix |
    /// | `NOTES_EXPORT_UPLOAD_FOLDER` | `Documents/Notes/exports` | Upload folder |
    /// | `NOTES_EXPORT_UPLOAD` | `true` | Upload finished archives |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let export_dir = std::env::var("NOTES_EXPORT_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.export_dir);

        let max_concurrent_exports = std::env::var("NOTES_EXPORT_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(EXPORT_MAX_CONCURRENT)
            .max(1);

        let attachment_url_prefix = std::env::var("NOTES_ATTACHMENT_URL_PREFIX")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.attachment_url_prefix);

        let upload_folder = std::env::var("NOTES_EXPORT_UPLOAD_FOLDER")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.upload_folder);

        let upload_archives = std::env::var("NOTES_EXPORT_UPLOAD")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Self {
            export_dir,
            max_concurrent_exports,
            attachment_url_prefix,
            upload_folder,
            upload_archives,
        }
    }

    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = dir.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_exports = max.max(1);
        self
    }

    pub fn with_attachment_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.attachment_url_prefix = prefix.into();
        self
    }

    pub fn with_upload_folder(mut self, folder: impl Into<String>) -> Self {
        self.upload_folder = folder.into();
        self
    }

    pub fn with_upload_archives(mut self, enabled: bool) -> Self {
        self.upload_archives = enabled;
        self
    }
}
