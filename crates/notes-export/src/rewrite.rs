//! Content rewriting for export.
//!
//! Two passes turn store-local references into portable tokens:
//!
//! 1. Inline attachment URLs (`<prefix><path>/<fileId>`) are extracted into the
//!    job's staging directory and replaced by `//-media:<file>-//`.
//! 2. Internal note links (`class="noteLink" href="..."`) are resolved to a
//!    [`PortableRef`] and replaced by `//-link:...-//`.
//!
//! Both passes skip existing tokens, so rewriting already rewritten content is
//! a no-op.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, trace, warn};

use notes_core::defaults::NOTE_LINK_CLASS;
use notes_core::{
    Access, AttachmentStore, Blob, Error, NoteRef, NoteStore, PermissionService, PortableRef,
    Result,
};

use crate::job::ExportJob;
use crate::services::Services;
use crate::staging::{safe_file_name, ExportStaging};
use crate::token::{is_token, PlaceholderToken};

static NOTE_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"(class="{}"\s+href=")([^"]*)(")"#,
        NOTE_LINK_CLASS
    ))
    .expect("note link regex is valid")
});

/// An attachment URL found in note content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaReference {
    /// The URL exactly as it appears in the content.
    pub url: String,
    /// Attachment id: last path segment of the URL.
    pub file_id: String,
}

/// Rewrites note content between store-local and portable form.
pub struct LinkRewriter {
    notes: Arc<dyn NoteStore>,
    attachments: Arc<dyn AttachmentStore>,
    permissions: Arc<dyn PermissionService>,
    attachment_prefix: String,
    media_re: Regex,
}

impl LinkRewriter {
    pub fn new(services: &Services, attachment_url_prefix: &str) -> Result<Self> {
        let pattern = format!(r#"{}[^"'\s<>()]*"#, regex::escape(attachment_url_prefix));
        let media_re = Regex::new(&pattern).map_err(|e| {
            Error::InvalidInput(format!(
                "attachment prefix {:?} unusable: {}",
                attachment_url_prefix, e
            ))
        })?;
        Ok(Self {
            notes: services.notes.clone(),
            attachments: services.attachments.clone(),
            permissions: services.permissions.clone(),
            attachment_prefix: attachment_url_prefix.to_string(),
            media_re,
        })
    }

    /// URL under which an attachment is served.
    pub fn attachment_url(&self, file_id: &str) -> String {
        format!("{}{}", self.attachment_prefix, file_id)
    }

    /// Distinct attachment URLs in `content`, in order of appearance.
    pub fn media_references(&self, content: &str) -> Vec<MediaReference> {
        let mut seen = std::collections::HashSet::new();
        self.media_re
            .find_iter(content)
            .filter_map(|m| {
                let url = m.as_str();
                let file_id = last_segment(&url[self.attachment_prefix.len()..])?;
                seen.insert(url.to_string()).then(|| MediaReference {
                    url: url.to_string(),
                    file_id: file_id.to_string(),
                })
            })
            .collect()
    }

    /// Replace attachment URLs with media tokens.
    ///
    /// `file_names` maps a URL to the file name it was staged under. URLs
    /// without an entry are left untouched.
    pub fn rewrite_media_urls(&self, content: &str, file_names: &HashMap<String, String>) -> String {
        self.media_re
            .replace_all(content, |caps: &Captures| {
                let url = &caps[0];
                match file_names.get(url) {
                    Some(name) => PlaceholderToken::media(name.as_str()).to_string(),
                    None => url.to_string(),
                }
            })
            .into_owned()
    }

    /// Distinct `href` values of internal note links that are not tokens yet.
    pub fn note_link_targets(content: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for caps in NOTE_LINK_RE.captures_iter(content) {
            let href = &caps[2];
            if href.is_empty() || is_token(href) || targets.iter().any(|t| t == href) {
                continue;
            }
            targets.push(href.to_string());
        }
        targets
    }

    /// Replace resolved link targets with link tokens.
    pub fn rewrite_note_links(content: &str, resolved: &HashMap<String, PortableRef>) -> String {
        NOTE_LINK_RE
            .replace_all(content, |caps: &Captures| match resolved.get(&caps[2]) {
                Some(target) => format!(
                    "{}{}{}",
                    &caps[1],
                    PlaceholderToken::link(target.clone()),
                    &caps[3]
                ),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Stage every inline attachment of `note` and return the tokenized content.
    ///
    /// Missing blobs are recorded on the job and their URLs kept as they are.
    pub async fn extract_media(
        &self,
        note: &NoteRef,
        staging: &mut ExportStaging,
        job: &ExportJob,
    ) -> Result<String> {
        let references = self.media_references(&note.content);
        if references.is_empty() {
            return Ok(note.content.clone());
        }

        let mut file_names = HashMap::new();
        for reference in references {
            if let Some(staged) = staging.staged_media(&reference.file_id) {
                file_names.insert(reference.url, staged.to_string());
                continue;
            }
            let blob = match self.attachments.get(&reference.file_id).await {
                Ok(Some(blob)) => blob,
                Ok(None) => {
                    let message = format!(
                        "attachment {} of note {} not found",
                        reference.file_id, note.id
                    );
                    warn!(job_id = job.id(), note_id = %note.id, file_id = %reference.file_id, "Attachment missing, URL kept");
                    job.record_error(message);
                    continue;
                }
                Err(e) => {
                    warn!(job_id = job.id(), note_id = %note.id, error = %e, "Attachment unreadable, URL kept");
                    job.record_error(format!(
                        "attachment {} of note {} unreadable: {}",
                        reference.file_id, note.id, e
                    ));
                    continue;
                }
            };
            let file_name = media_file_name(&reference.file_id, &blob, None);
            let file_name = staging
                .add_media(&reference.file_id, &file_name, &blob.data)
                .await?;
            trace!(note_id = %note.id, url = %reference.url, file = %file_name, "Media staged");
            file_names.insert(reference.url, file_name);
        }

        Ok(self.rewrite_media_urls(&note.content, &file_names))
    }

    /// Stage the featured image of `note`, if it has one.
    ///
    /// Returns the staged file name, which may carry a suffix when another
    /// attachment already claimed the name.
    pub async fn stage_featured_image(
        &self,
        note: &NoteRef,
        staging: &mut ExportStaging,
        job: &ExportJob,
    ) -> Result<Option<String>> {
        let Some(image) = note.featured_image() else {
            return Ok(None);
        };
        match self.attachments.get(&image.id).await {
            Ok(Some(blob)) => {
                let file_name = media_file_name(&image.id, &blob, image.mime_type.as_deref());
                let file_name = staging.add_featured(&image.id, &file_name, &blob.data).await?;
                Ok(Some(file_name))
            }
            Ok(None) => {
                warn!(job_id = job.id(), note_id = %note.id, "Featured image missing");
                job.record_error(format!(
                    "featured image {} of note {} not found",
                    image.id, note.id
                ));
                Ok(None)
            }
            Err(e) => {
                job.record_error(format!(
                    "featured image {} of note {} unreadable: {}",
                    image.id, note.id, e
                ));
                Ok(None)
            }
        }
    }

    /// Replace internal links of `note` with link tokens.
    ///
    /// A target resolves by store id first, then by name within the note's
    /// book. Unresolvable links, and links to notes the requester cannot
    /// view, are left untouched.
    pub async fn rewrite_links(&self, note: &NoteRef, job: &ExportJob) -> Result<String> {
        let targets = Self::note_link_targets(&note.content);
        if targets.is_empty() {
            return Ok(note.content.clone());
        }

        let book = note.book();
        let mut resolved = HashMap::new();
        for href in targets {
            let Some(key) = last_segment(&href) else {
                continue;
            };
            let target = match self.notes.get(key).await {
                Ok(Some(found)) => Some(found),
                Ok(None) => self.notes.get_by_name(&book, key).await.unwrap_or_else(|e| {
                    warn!(job_id = job.id(), note_id = %note.id, error = %e, "Link lookup failed");
                    None
                }),
                Err(e) => {
                    warn!(job_id = job.id(), note_id = %note.id, error = %e, "Link lookup failed");
                    None
                }
            };
            let target = match target {
                Some(target) => {
                    if self.can_view(job, &target).await {
                        Some(target)
                    } else {
                        debug!(job_id = job.id(), note_id = %note.id, target_id = %target.id, "Link target not viewable, left as is");
                        None
                    }
                }
                None => None,
            };
            match target {
                Some(target) => {
                    trace!(note_id = %note.id, href = %href, target = %target.name, "Link resolved");
                    resolved.insert(href, target.portable_ref());
                }
                None => trace!(note_id = %note.id, href = %href, "Link left as is"),
            }
        }

        Ok(Self::rewrite_note_links(&note.content, &resolved))
    }

    async fn can_view(&self, job: &ExportJob, target: &NoteRef) -> bool {
        match self
            .permissions
            .check_access(job.requester(), target, Access::View)
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(job_id = job.id(), target_id = %target.id, error = %e, "Link access check failed");
                false
            }
        }
    }
}

/// Last non-empty path segment, without query or fragment.
fn last_segment(path: &str) -> Option<&str> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    path.split('/').filter(|s| !s.is_empty()).last()
}

/// File name for a staged blob: the sanitized id plus an inferred extension.
///
/// The extension comes from the id itself, then the content's magic bytes,
/// then the declared MIME type.
pub fn media_file_name(file_id: &str, blob: &Blob, declared_mime: Option<&str>) -> String {
    let base = safe_file_name(file_id);
    if Path::new(&base).extension().is_some() {
        return base;
    }
    let extension = infer::get(&blob.data)
        .map(|kind| kind.extension().to_string())
        .or_else(|| declared_mime.and_then(mime_extension))
        .or_else(|| blob.mime_type.as_deref().and_then(mime_extension));
    match extension {
        Some(ext) => format!("{}.{}", base, ext),
        None => base,
    }
}

fn mime_extension(mime: &str) -> Option<String> {
    let subtype = mime.split(';').next()?.split('/').nth(1)?;
    let subtype = subtype.split('+').next()?.trim();
    if subtype.is_empty() || !subtype.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(subtype.to_ascii_lowercase())
}
