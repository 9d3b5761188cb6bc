//! Import of export archives into a target note.
//!
//! Notes are replayed parent-first under the target. When an imported note's
//! name already exists in the target book, the request's [`ConflictPolicy`]
//! decides what happens. Media tokens are restored into fresh attachments as
//! each note is written. Link tokens are resolved in a second pass, once every
//! imported note has its final id.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};

use notes_core::defaults::{HOME_NOTE_NAME, IMPORT_DUPLICATE_MAX_ATTEMPTS};
use notes_core::{
    derive_note_name, Access, Blob, BookRef, ConflictPolicy, Error, Identity, NewNote,
    NoteProperties, NoteRef, PortableRef, Result,
};

use crate::archive::{ArchiveContents, ArchiveReader, ImportUnit};
use crate::config::ExportConfig;
use crate::services::Services;
use crate::token::{find_tokens, replace_tokens, PlaceholderToken};

/// A request to import an archive under an existing note.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub archive_path: PathBuf,
    /// Note receiving the archive's top-level notes.
    pub target_parent_id: String,
    pub conflict: ConflictPolicy,
    pub requester: Identity,
}

impl ImportRequest {
    pub fn new(
        archive_path: impl Into<PathBuf>,
        target_parent_id: impl Into<String>,
        requester: Identity,
    ) -> Self {
        Self {
            archive_path: archive_path.into(),
            target_parent_id: target_parent_id.into(),
            conflict: ConflictPolicy::default(),
            requester,
        }
    }

    pub fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = conflict;
        self
    }
}

/// What an import did, note by note.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    /// New notes without a name conflict.
    pub created: usize,
    /// Existing notes updated in place.
    pub updated: usize,
    /// Existing notes deleted and recreated.
    pub replaced: usize,
    /// Conflicting notes created under a suffixed title.
    pub duplicated: usize,
    /// Conflicting notes left as they were.
    pub skipped: usize,
    /// Link tokens resolved to an imported note.
    pub links_resolved: usize,
    /// Link tokens replaced by the bare target name.
    pub links_unresolved: usize,
}

impl ImportReport {
    /// Notes written by the import.
    pub fn written(&self) -> usize {
        self.created + self.updated + self.replaced + self.duplicated
    }
}

/// An archived note in replay order, with the position of its parent.
struct FlatUnit<'a> {
    note: &'a NoteRef,
    parent: Option<usize>,
}

/// Archive notes in depth-first pre-order, parents before children.
fn flatten(units: &[ImportUnit]) -> Vec<FlatUnit<'_>> {
    let mut flat = Vec::new();
    let mut stack: Vec<(&ImportUnit, Option<usize>)> =
        units.iter().rev().map(|u| (u, None)).collect();
    while let Some((unit, parent)) = stack.pop() {
        let index = flat.len();
        flat.push(FlatUnit {
            note: &unit.note,
            parent,
        });
        stack.extend(unit.children.iter().rev().map(|c| (c, Some(index))));
    }
    flat
}

/// First suffix tried for a duplicate of `title`: one past a trailing `_<n>`, else 1.
fn duplicate_start(title: &str) -> u64 {
    title
        .rsplit_once('_')
        .and_then(|(_, suffix)| suffix.parse::<u64>().ok())
        .map(|n| n.saturating_add(1))
        .unwrap_or(1)
}

/// Replays export archives into a note store.
pub struct ImportReconciler {
    services: Services,
    attachment_prefix: String,
}

impl ImportReconciler {
    pub fn new(services: Services, config: &ExportConfig) -> Self {
        Self {
            services,
            attachment_prefix: config.attachment_url_prefix.clone(),
        }
    }

    /// Import the archive at `request.archive_path`.
    #[instrument(
        skip(self, request),
        fields(
            target = %request.target_parent_id,
            conflict = %request.conflict,
            user_id = %request.requester.user_id
        )
    )]
    pub async fn import(&self, request: ImportRequest) -> Result<ImportReport> {
        let contents = ArchiveReader::load(&request.archive_path).await?;
        self.import_contents(
            &contents,
            &request.target_parent_id,
            request.conflict,
            &request.requester,
        )
        .await
    }

    /// Import already-read archive contents.
    ///
    /// The requester needs edit access on the target. Failures while
    /// replaying a note are returned as [`Error::Import`] naming the note;
    /// notes written before the failure stay written.
    pub async fn import_contents(
        &self,
        contents: &ArchiveContents,
        target_parent_id: &str,
        conflict: ConflictPolicy,
        requester: &Identity,
    ) -> Result<ImportReport> {
        let start = Instant::now();
        let target = self
            .services
            .notes
            .get(target_parent_id)
            .await?
            .ok_or_else(|| Error::NoteNotFound(target_parent_id.to_string()))?;
        if !self
            .services
            .permissions
            .check_access(requester, &target, Access::Edit)
            .await?
        {
            return Err(Error::Forbidden(format!(
                "user {} cannot import into note {}",
                requester.user_id, target.id
            )));
        }

        let units = flatten(&contents.document.notes);
        let mut session = ImportSession {
            services: &self.services,
            attachment_prefix: &self.attachment_prefix,
            contents,
            archived: units.iter().map(|unit| unit.note.portable_ref()).collect(),
            book: target.book(),
            requester,
            conflict,
            report: ImportReport::default(),
            restored_media: HashMap::new(),
        };

        if conflict == ConflictPolicy::ReplaceAll {
            session.clear_target(&target).await?;
        }

        let mut final_ids: Vec<String> = Vec::with_capacity(units.len());
        for unit in &units {
            let parent_id = match unit.parent {
                Some(p) => final_ids[p].as_str(),
                None => target.id.as_str(),
            };
            let id = session
                .replay(unit.note, parent_id)
                .await
                .map_err(|e| Error::import(unit.note.name.clone(), e))?;
            final_ids.push(id);
        }

        let by_portable: HashMap<PortableRef, String> = units
            .iter()
            .zip(final_ids.iter())
            .map(|(unit, id)| (unit.note.portable_ref(), id.clone()))
            .collect();
        for (unit, id) in units.iter().zip(final_ids.iter()) {
            session
                .resolve_links(id, &by_portable)
                .await
                .map_err(|e| Error::import(unit.note.name.clone(), e))?;
        }

        let report = session.report;
        info!(
            created = report.created,
            updated = report.updated,
            replaced = report.replaced,
            duplicated = report.duplicated,
            skipped = report.skipped,
            links_resolved = report.links_resolved,
            links_unresolved = report.links_unresolved,
            duration_ms = start.elapsed().as_millis() as u64,
            "Import finished"
        );
        Ok(report)
    }
}

/// State of one running import.
struct ImportSession<'a> {
    services: &'a Services,
    attachment_prefix: &'a str,
    contents: &'a ArchiveContents,
    /// Every note of the archive, as link tokens name them.
    archived: HashSet<PortableRef>,
    book: BookRef,
    requester: &'a Identity,
    conflict: ConflictPolicy,
    report: ImportReport,
    /// Archive media file name to new attachment id.
    restored_media: HashMap<String, String>,
}

impl ImportSession<'_> {
    /// Delete every note under `target` except the book home.
    async fn clear_target(&mut self, target: &NoteRef) -> Result<()> {
        let children = self.services.notes.list_children(&target.id).await?;
        let mut removed = 0;
        for child in children.into_iter().filter(|c| !c.is_home()) {
            self.services.notes.delete(&child.id).await?;
            removed += 1;
        }
        debug!(target = %target.id, removed, "Import target cleared");
        Ok(())
    }

    /// Write one archived note under `parent_id` and return its final id.
    async fn replay(&mut self, unit: &NoteRef, parent_id: &str) -> Result<String> {
        if unit.is_home() {
            return self.replay_home(unit).await;
        }

        let existing = self
            .services
            .notes
            .get_by_name(&self.book, &unit.name)
            .await?;
        let Some(existing) = existing else {
            let created = self.create(parent_id, unit, None).await?;
            trace!(note_name = %unit.name, id = %created.id, "Note created");
            self.report.created += 1;
            return Ok(created.id);
        };

        debug!(note_name = %unit.name, conflict = %self.conflict, "Name conflict");
        match self.conflict {
            ConflictPolicy::Overwrite | ConflictPolicy::ReplaceAll => {
                if self.is_on_path(&existing.id, parent_id).await? {
                    // Deleting it would take the destination with it.
                    return self.update_existing(existing, unit).await;
                }
                self.remove_featured_image(&existing).await;
                self.services.notes.delete(&existing.id).await?;
                let created = self.create(parent_id, unit, None).await?;
                self.report.replaced += 1;
                Ok(created.id)
            }
            ConflictPolicy::Duplicate => {
                let (name, title) = self.free_duplicate_name(unit).await?;
                let created = self.create(parent_id, unit, Some((name, title))).await?;
                self.report.duplicated += 1;
                Ok(created.id)
            }
            ConflictPolicy::Update => self.update_existing(existing, unit).await,
            ConflictPolicy::None => {
                self.report.skipped += 1;
                Ok(existing.id)
            }
        }
    }

    /// The archive's book home maps onto the target book's home.
    async fn replay_home(&mut self, unit: &NoteRef) -> Result<String> {
        let home = self
            .services
            .notes
            .book_home(&self.book)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "home of book {}:{}",
                    self.book.book_type, self.book.owner
                ))
            })?;

        let refreshes = self.conflict == ConflictPolicy::Update || self.conflict.recreates();
        if !refreshes || self.content_matches(&home.content, &unit.content).await? {
            self.report.skipped += 1;
            return Ok(home.id);
        }

        let mut updated = home.clone();
        updated.content = self.restore_media(&unit.content).await?;
        self.services.notes.update(&updated).await?;
        self.services
            .notes
            .create_version(&home.id, &self.requester.user_id)
            .await?;
        self.report.updated += 1;
        Ok(home.id)
    }

    async fn update_existing(&mut self, existing: NoteRef, unit: &NoteRef) -> Result<String> {
        if existing.title == unit.title
            && self.content_matches(&existing.content, &unit.content).await?
        {
            self.report.skipped += 1;
            return Ok(existing.id);
        }
        let mut updated = existing;
        updated.title = unit.title.clone();
        updated.content = self.restore_media(&unit.content).await?;
        if unit.featured_image().is_some() {
            updated.properties = self.restore_properties(unit).await?;
        }
        self.services.notes.update(&updated).await?;
        self.services
            .notes
            .create_version(&updated.id, &self.requester.user_id)
            .await?;
        self.report.updated += 1;
        Ok(updated.id)
    }

    /// Whether `existing` already reads as `archived` would once imported.
    ///
    /// Literal text must match exactly. A link token matches the id the link
    /// pass would write. A media token matches an attachment URL whose blob
    /// holds the same bytes as the archived file. Nothing is uploaded.
    async fn content_matches(&self, existing: &str, archived: &str) -> Result<bool> {
        let mut cursor = 0;
        let mut last = 0;
        let mut media: Vec<(String, &str)> = Vec::new();
        for (range, token) in find_tokens(archived) {
            let literal = &archived[last..range.start];
            if !existing[cursor..].starts_with(literal) {
                return Ok(false);
            }
            cursor += literal.len();
            let raw = &archived[range.clone()];
            last = range.end;

            match token {
                PlaceholderToken::Link(target) => {
                    let Some(expected) = self.expected_link(&target).await? else {
                        return Ok(false);
                    };
                    if !existing[cursor..].starts_with(expected.as_str()) {
                        return Ok(false);
                    }
                    cursor += expected.len();
                }
                PlaceholderToken::Media { file_name }
                    if self.contents.media.contains_key(&file_name) =>
                {
                    let Some(rest) = existing[cursor..].strip_prefix(self.attachment_prefix)
                    else {
                        return Ok(false);
                    };
                    let end = rest
                        .find(|c: char| {
                            c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>' | '(' | ')')
                        })
                        .unwrap_or(rest.len());
                    let url_tail = &rest[..end];
                    let file_id = url_tail.rsplit('/').next().unwrap_or(url_tail);
                    media.push((file_name, file_id));
                    cursor += self.attachment_prefix.len() + end;
                }
                // Restoring keeps tokens of files the archive lacks.
                PlaceholderToken::Media { .. } => {
                    if !existing[cursor..].starts_with(raw) {
                        return Ok(false);
                    }
                    cursor += raw.len();
                }
            }
        }
        if existing[cursor..] != archived[last..] {
            return Ok(false);
        }

        for (file_name, file_id) in media {
            let Some(data) = self.contents.media.get(&file_name) else {
                return Ok(false);
            };
            match self.services.attachments.get(file_id).await? {
                Some(blob) if blob.data == *data => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Id the link pass would write for `target`, if it is known yet.
    async fn expected_link(&self, target: &PortableRef) -> Result<Option<String>> {
        if !self.archived.contains(target) {
            return Ok(Some(target.name.clone()));
        }
        let existing = if target.name == HOME_NOTE_NAME {
            self.services.notes.book_home(&self.book).await?
        } else {
            self.services.notes.get_by_name(&self.book, &target.name).await?
        };
        Ok(existing.map(|note| note.id))
    }

    async fn create(
        &mut self,
        parent_id: &str,
        unit: &NoteRef,
        rename: Option<(String, String)>,
    ) -> Result<NoteRef> {
        let mut new_note = NewNote::from_note(unit, self.requester.user_id.clone());
        if let Some((name, title)) = rename {
            new_note.name = name;
            new_note.title = title;
        }
        new_note.content = self.restore_media(&unit.content).await?;
        new_note.properties = self.restore_properties(unit).await?;
        self.services.notes.create(parent_id, new_note).await
    }

    /// Whether `note_id` is `parent_id` or one of its ancestors.
    async fn is_on_path(&self, note_id: &str, parent_id: &str) -> Result<bool> {
        if note_id == parent_id {
            return Ok(true);
        }
        let ancestors = self.services.notes.list_ancestors(parent_id).await?;
        Ok(ancestors.iter().any(|a| a == note_id))
    }

    /// First `<title>_<n>` whose title and derived name are both free.
    async fn free_duplicate_name(&self, unit: &NoteRef) -> Result<(String, String)> {
        let start = duplicate_start(&unit.title);
        let end = start.saturating_add(u64::from(IMPORT_DUPLICATE_MAX_ATTEMPTS));
        for i in start..end {
            let title = format!("{}_{}", unit.title, i);
            let mut name = derive_note_name(&title);
            if name.is_empty() {
                name = format!("{}_{}", unit.name, i);
            }
            let notes = &self.services.notes;
            if notes.get_by_name(&self.book, &title).await?.is_none()
                && notes.get_by_name(&self.book, &name).await?.is_none()
            {
                return Ok((name, title));
            }
        }
        Err(Error::Conflict(format!(
            "no free duplicate name for '{}'",
            unit.title
        )))
    }

    /// Replace media tokens with URLs of freshly stored attachments.
    ///
    /// Tokens naming files missing from the archive are kept.
    async fn restore_media(&mut self, content: &str) -> Result<String> {
        for (_, token) in find_tokens(content) {
            let PlaceholderToken::Media { file_name } = token else {
                continue;
            };
            if self.restored_media.contains_key(&file_name) {
                continue;
            }
            let Some(data) = self.contents.media.get(&file_name) else {
                warn!(file = %file_name, "Media file missing from archive, token kept");
                continue;
            };
            let mime_type = infer::get(data).map(|kind| kind.mime_type().to_string());
            let id = self
                .services
                .attachments
                .put(&self.book, &file_name, Blob::new(data.clone(), mime_type))
                .await?;
            trace!(file = %file_name, id = %id, "Media restored");
            self.restored_media.insert(file_name, id);
        }

        let prefix = self.attachment_prefix;
        let restored = &self.restored_media;
        Ok(replace_tokens(content, |token| match token {
            PlaceholderToken::Media { file_name } => restored
                .get(file_name)
                .map(|id| format!("{}{}", prefix, id)),
            PlaceholderToken::Link(_) => None,
        }))
    }

    /// Archived properties, with the featured image re-uploaded.
    ///
    /// A featured image missing from the archive is dropped.
    async fn restore_properties(&mut self, unit: &NoteRef) -> Result<Option<NoteProperties>> {
        let Some(mut properties) = unit.properties.clone() else {
            return Ok(None);
        };
        let Some(mut image) = properties.featured_image.take() else {
            return Ok(Some(properties));
        };
        match self.contents.featured_image(&image.id) {
            Some((file_name, data)) => {
                let mime_type = image
                    .mime_type
                    .clone()
                    .or_else(|| infer::get(data).map(|kind| kind.mime_type().to_string()));
                image.id = self
                    .services
                    .attachments
                    .put(&self.book, file_name, Blob::new(data.to_vec(), mime_type))
                    .await?;
                properties.featured_image = Some(image);
            }
            None => {
                warn!(note_name = %unit.name, image = %image.id, "Featured image missing from archive, dropped");
            }
        }
        Ok(Some(properties))
    }

    async fn remove_featured_image(&self, note: &NoteRef) {
        if let Some(image) = note.featured_image() {
            if let Err(e) = self.services.attachments.delete(&image.id).await {
                warn!(note_id = %note.id, error = %e, "Failed to delete replaced featured image");
            }
        }
    }

    /// Replace link tokens in the note `id` with store ids.
    ///
    /// A token naming an imported note becomes that note's id; any other
    /// token becomes the bare target name.
    async fn resolve_links(
        &mut self,
        id: &str,
        by_portable: &HashMap<PortableRef, String>,
    ) -> Result<()> {
        let Some(mut note) = self.services.notes.get(id).await? else {
            return Ok(());
        };
        let mut resolved = 0;
        let mut unresolved = 0;
        let content = replace_tokens(&note.content, |token| match token {
            PlaceholderToken::Link(target) => match by_portable.get(target) {
                Some(new_id) => {
                    resolved += 1;
                    Some(new_id.clone())
                }
                None => {
                    unresolved += 1;
                    Some(target.name.clone())
                }
            },
            PlaceholderToken::Media { .. } => None,
        });
        if resolved == 0 && unresolved == 0 {
            return Ok(());
        }
        note.content = content;
        self.services.notes.update(&note).await?;
        self.report.links_resolved += resolved;
        self.report.links_unresolved += unresolved;
        trace!(note_id = %id, resolved, unresolved, "Links resolved");
        Ok(())
    }
}
