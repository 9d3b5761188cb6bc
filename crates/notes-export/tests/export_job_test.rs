//! Integration tests for export jobs: registry lifecycle, archive contents,
//! cancellation cleanup and failure handling.

mod common;

use std::sync::Arc;

use common::*;
use notes_export::{
    Access, ArchiveReader, AttachmentStore, Blob, BookRef, BookType, ConflictPolicy, Error,
    ExportEvent, ExportId, ExportJobRegistry, ExportPhase, ExportRequest, ExportStatus,
    FeaturedImage, ImportReconciler, ImportRequest, NewNote, NoteProperties, NoteRef, NoteStore,
    PlaceholderToken, Services,
};
use tokio::sync::broadcast;

fn request(job_id: u64, ids: &[&str]) -> ExportRequest {
    ExportRequest::new(job_id, ids.iter().map(|s| s.to_string()).collect(), user())
}

/// Read fetched archive bytes back through the archive reader.
fn read_fetched(bytes: &[u8]) -> notes_export::ArchiveContents {
    let dir = tempfile::tempdir().unwrap();
    let path = write_archive(dir.path(), bytes);
    ArchiveReader::read(&path).unwrap()
}

/// Phases announced for `job_id` until its archive is created.
async fn phases_until_archive(
    events: &mut broadcast::Receiver<ExportEvent>,
    job_id: ExportId,
) -> Vec<ExportPhase> {
    assert_eq!(events.recv().await.unwrap(), ExportEvent::JobStarted { job_id });
    let mut phases = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            ExportEvent::PhaseChanged { phase, .. } => phases.push(phase),
            ExportEvent::ArchiveCreated { job_id: created, entries } => {
                assert_eq!(created, job_id);
                assert_eq!(entries, 1);
                return phases;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

async fn with_featured_image(fx: &Fixture, parent_id: &str, name: &str, image_id: &str) -> NoteRef {
    fx.notes
        .create(
            parent_id,
            NewNote::new(name, name, "").with_properties(NoteProperties {
                featured_image: Some(FeaturedImage {
                    id: image_id.to_string(),
                    mime_type: None,
                    alt_text: None,
                }),
                summary: None,
            }),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_selection_export_lifecycle() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let a = fx.note(&home.id, "A", "<p>alpha</p>").await;
    let b = fx.note(&a.id, "B", "<p>beta</p>").await;
    fx.attachments
        .insert("img-1", Blob::new(PNG.to_vec(), Some("image/png".into())))
        .await;
    let c = fx.note(&b.id, "C", &media_html("img-1")).await;
    let d = fx.note(&home.id, "D", &link_html(&a.id, "see A")).await;

    let registry = fx.registry();
    registry.start(request(1, &[&a.id, &c.id, &d.id])).unwrap();

    let snapshot = wait_for_status(&registry, 1, ExportStatus::ZipCreated).await;
    assert_eq!(snapshot.phase, ExportPhase::Done);
    assert_eq!(snapshot.processed_count, 3);
    assert!(snapshot.errors.is_empty());
    let entries = fx.export_dir_entries();
    assert_eq!(entries.len(), 1);
    assert!(
        entries[0].starts_with("exportzip1_") && entries[0].ends_with(".zip"),
        "{:?}",
        entries
    );

    let bytes = registry.fetch(1).await.unwrap();
    assert!(registry.status(1).is_none());
    assert!(fx.export_dir_entries().is_empty());

    let contents = read_fetched(&bytes);
    let roots = &contents.document.notes;
    assert_eq!(roots.len(), 2);
    assert_eq!(roots[0].note.name, "A");
    assert_eq!(roots[0].children.len(), 1);
    assert_eq!(roots[0].children[0].note.name, "C");
    assert_eq!(roots[1].note.name, "D");
    assert!(roots[1].children.is_empty());

    // Media extracted and tokenized.
    let c_content = &roots[0].children[0].note.content;
    assert!(c_content.contains("//-media:img-1.png-//"), "{}", c_content);
    assert!(!c_content.contains(PREFIX));
    assert_eq!(contents.media.get("img-1.png").map(Vec::as_slice), Some(PNG));

    // Link rewritten to a portable token.
    let expected = PlaceholderToken::link(a.portable_ref()).to_string();
    assert!(roots[1].note.content.contains(&expected));
}

#[tokio::test]
async fn test_export_all_walks_descendants() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let a = fx.note(&home.id, "A", "").await;
    let b = fx.note(&a.id, "B", "").await;
    fx.note(&b.id, "C", "").await;
    fx.note(&a.id, "E", "").await;
    fx.note(&home.id, "D", "").await;

    let registry = fx.registry();
    registry
        .start(request(2, &[&a.id, &b.id]).with_export_all(true))
        .unwrap();

    let snapshot = wait_for_status(&registry, 2, ExportStatus::ZipCreated).await;
    assert_eq!(snapshot.processed_count, 4);

    let contents = read_fetched(&registry.fetch(2).await.unwrap());
    let roots = &contents.document.notes;
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].note.name, "A");
    let children: Vec<_> = roots[0].children.iter().map(|c| c.note.name.as_str()).collect();
    assert_eq!(children, vec!["B", "E"]);
    assert_eq!(roots[0].children[0].children[0].note.name, "C");
    assert_eq!(contents.document.note_count(), 4);
}

#[tokio::test]
async fn test_missing_and_forbidden_notes_are_skipped() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let a = fx.note(&home.id, "A", "").await;
    let secret = fx.note(&home.id, "Secret", "").await;
    fx.permissions.deny(secret.id.clone(), Access::View).await;

    let registry = fx.registry();
    registry
        .start(request(3, &[&a.id, "9999", &secret.id]))
        .unwrap();

    let snapshot = wait_for_status(&registry, 3, ExportStatus::ZipCreated).await;
    assert_eq!(snapshot.processed_count, 1);
    assert_eq!(snapshot.errors.len(), 2);
    assert!(snapshot.errors.iter().any(|e| e.contains("9999")));

    let contents = read_fetched(&registry.fetch(3).await.unwrap());
    let names: Vec<_> = contents.document.notes.iter().map(|n| n.note.name.as_str()).collect();
    assert_eq!(names, vec!["A"]);
}

#[tokio::test]
async fn test_featured_image_exported() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    fx.attachments
        .insert("cover", Blob::new(b"jpeg-data".to_vec(), None))
        .await;
    let a = fx
        .notes
        .create(
            &home.id,
            NewNote::new("A", "A", "").with_properties(NoteProperties {
                featured_image: Some(FeaturedImage {
                    id: "cover".to_string(),
                    mime_type: Some("image/jpeg".to_string()),
                    alt_text: None,
                }),
                summary: None,
            }),
        )
        .await
        .unwrap();

    let registry = fx.registry();
    registry.start(request(4, &[&a.id])).unwrap();
    wait_for_status(&registry, 4, ExportStatus::ZipCreated).await;

    let contents = read_fetched(&registry.fetch(4).await.unwrap());
    let image = contents.document.notes[0].note.featured_image().unwrap();
    assert_eq!(image.id, "cover.jpeg");
    assert_eq!(image.mime_type.as_deref(), Some("image/jpeg"));
    assert_eq!(
        contents.featured_image(&image.id),
        Some(("cover.jpeg", &b"jpeg-data"[..]))
    );
    assert_eq!(
        contents.featured_image("cover"),
        Some(("cover.jpeg", &b"jpeg-data"[..]))
    );
}

#[tokio::test]
async fn test_colliding_file_names_stay_apart() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let spaced = [PNG, b"spaced"].concat();
    let plain = [PNG, b"plain"].concat();
    fx.attachments.insert("a+b", Blob::new(spaced.clone(), None)).await;
    fx.attachments.insert("a_b", Blob::new(plain.clone(), None)).await;
    let x = with_featured_image(&fx, &home.id, "X", "a+b").await;
    let y = with_featured_image(&fx, &home.id, "Y", "a_b").await;
    let m = fx
        .note(&home.id, "M", &format!("{}{}", media_html("a+b"), media_html("a_b")))
        .await;

    let registry = fx.registry();
    registry.start(request(13, &[&x.id, &y.id, &m.id])).unwrap();
    wait_for_status(&registry, 13, ExportStatus::ZipCreated).await;
    let bytes = registry.fetch(13).await.unwrap();
    let contents = read_fetched(&bytes);

    // Inline media: both sanitize to a_b.png, each keeps its own bytes.
    assert_eq!(contents.media.len(), 2);
    assert_eq!(contents.media.get("a_b.png"), Some(&spaced));
    assert_eq!(contents.media.get("a_b_1.png"), Some(&plain));
    let m_content = &contents.document.notes[2].note.content;
    assert!(m_content.contains("//-media:a_b.png-//"), "{}", m_content);
    assert!(m_content.contains("//-media:a_b_1.png-//"), "{}", m_content);

    // Featured images: each note names its own staged file.
    assert_eq!(contents.featured.len(), 2);
    let x_image = contents.document.notes[0].note.featured_image().unwrap().id.clone();
    let y_image = contents.document.notes[1].note.featured_image().unwrap().id.clone();
    assert_ne!(x_image, y_image);
    assert_eq!(contents.featured_image(&x_image).unwrap().1, spaced.as_slice());
    assert_eq!(contents.featured_image(&y_image).unwrap().1, plain.as_slice());

    // Importing restores the right bytes for each note.
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), &bytes);
    let target = fx.book(BookRef::new(BookType::User, "john")).await;
    ImportReconciler::new(fx.services(), &fx.config())
        .import(ImportRequest::new(archive, target.id.clone(), user()).with_conflict(ConflictPolicy::None))
        .await
        .unwrap();
    for (name, expected) in [("X", &spaced), ("Y", &plain)] {
        let note = fx
            .notes
            .get_by_name(&BookRef::new(BookType::User, "john"), name)
            .await
            .unwrap()
            .unwrap();
        let image = note.featured_image().unwrap();
        let blob = fx.attachments.get(&image.id).await.unwrap().unwrap();
        assert_eq!(&blob.data, expected, "featured image of {}", name);
    }
}

#[tokio::test]
async fn test_links_to_unviewable_notes_left_as_is() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let a = fx.note(&home.id, "A", "").await;
    let secret = fx.note(&home.id, "Secret", "").await;
    fx.permissions.deny(secret.id.clone(), Access::View).await;
    let content = format!("{}{}", link_html(&a.id, "open"), link_html(&secret.id, "hidden"));
    let d = fx.note(&home.id, "D", &content).await;

    let registry = fx.registry();
    registry.start(request(14, &[&d.id])).unwrap();
    let snapshot = wait_for_status(&registry, 14, ExportStatus::ZipCreated).await;
    assert!(snapshot.errors.is_empty());

    let contents = read_fetched(&registry.fetch(14).await.unwrap());
    let exported = &contents.document.notes[0].note.content;
    assert!(exported.contains(&PlaceholderToken::link(a.portable_ref()).to_string()));
    assert!(exported.contains(&link_html(&secret.id, "hidden")), "{}", exported);
    assert!(!exported.contains(&PlaceholderToken::link(secret.portable_ref()).to_string()));
}

#[tokio::test]
async fn test_archive_uploaded_for_group_book_only() {
    let fx = Fixture::new();
    let space_home = fx.book(space()).await;
    let portal_home = fx.book(BookRef::new(BookType::Portal, "global")).await;
    let a = fx.note(&space_home.id, "A", "").await;
    let p = fx.note(&portal_home.id, "P", "").await;

    let registry = fx.registry();
    registry.start(request(5, &[&a.id])).unwrap();
    registry.start(request(6, &[&p.id])).unwrap();
    wait_for_status(&registry, 5, ExportStatus::ZipCreated).await;
    wait_for_status(&registry, 6, ExportStatus::ZipCreated).await;

    let uploads = fx.documents.uploads().await;
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].book, space());
    assert_eq!(uploads[0].folder, "Documents/Notes/exports");
    assert!(uploads[0].file_name.starts_with("notesExport_"));
    assert!(uploads[0].file_name.ends_with(".zip"));
    assert!(uploads[0].size > 0);
}

#[tokio::test]
async fn test_cancel_while_processing_images_cleans_up() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let gated = Arc::new(GatedAttachments::new());
    gated
        .inner
        .insert("img-9", Blob::new(PNG.to_vec(), None))
        .await;
    let a = fx.note(&home.id, "A", &media_html("img-9")).await;

    let services = Services::new(
        fx.notes.clone(),
        gated.clone(),
        fx.permissions.clone(),
        fx.documents.clone(),
    );
    let registry = ExportJobRegistry::new(services, fx.config());
    registry.start(request(7, &[&a.id])).unwrap();

    wait_for_phase(&registry, 7, ExportPhase::ProcessingImages).await;
    // The staging directory exists while the worker waits on the blob.
    assert_eq!(fx.export_dir_entries().len(), 1);

    let err = registry.fetch(7).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    assert!(registry.cancel(7).await);
    gated.open();

    wait_until_gone(&registry, 7).await;
    assert!(fx.export_dir_entries().is_empty());
    assert!(matches!(registry.fetch(7).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_cancel_queued_job_removes_it_at_once() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let gated = Arc::new(GatedAttachments::new());
    gated.inner.insert("img-1", Blob::new(PNG.to_vec(), None)).await;
    let slow = fx.note(&home.id, "Slow", &media_html("img-1")).await;
    let quick = fx.note(&home.id, "Quick", "").await;

    let registry = fx.registry_with(gated.clone(), fx.config().with_max_concurrent(1));
    let mut events = registry.events();
    registry.start(request(1, &[&slow.id])).unwrap();
    wait_for_phase(&registry, 1, ExportPhase::ProcessingImages).await;
    registry.start(request(2, &[&quick.id])).unwrap();
    assert_eq!(registry.status(2).unwrap().status, ExportStatus::Started);

    assert!(registry.cancel(2).await);
    assert!(registry.status(2).is_none());
    assert_eq!(registry.job_ids(), vec![1]);

    gated.open();
    wait_for_status(&registry, 1, ExportStatus::ZipCreated).await;
    // The id is reusable; the cancelled run held the slot first and is done by now.
    registry.start(request(2, &[&quick.id])).unwrap();
    wait_for_status(&registry, 2, ExportStatus::ZipCreated).await;

    let cancelled = drain_events(&mut events)
        .into_iter()
        .filter(|e| *e == ExportEvent::JobCancelled { job_id: 2 })
        .count();
    assert_eq!(cancelled, 1);
}

#[tokio::test]
async fn test_reused_id_keeps_new_archive() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let gated = Arc::new(GatedAttachments::new());
    gated.inner.insert("img-5", Blob::new(PNG.to_vec(), None)).await;
    let slow = fx.note(&home.id, "Slow", &media_html("img-5")).await;
    let quick = fx.note(&home.id, "Quick", "<p>quick</p>").await;

    let registry = fx.registry_with(gated.clone(), fx.config());
    registry.start(request(5, &[&slow.id])).unwrap();
    wait_for_phase(&registry, 5, ExportPhase::ProcessingImages).await;
    assert!(registry.dispose(5).await);
    assert!(registry.status(5).is_none());

    registry.start(request(5, &[&quick.id])).unwrap();
    wait_for_status(&registry, 5, ExportStatus::ZipCreated).await;

    // Let the disposed run observe its cancellation and clean up.
    gated.open();
    wait_for_export_dir_len(&fx, 1).await;
    assert_eq!(registry.status(5).unwrap().status, ExportStatus::ZipCreated);

    let contents = read_fetched(&registry.fetch(5).await.unwrap());
    let names: Vec<_> = contents.document.notes.iter().map(|n| n.note.name.as_str()).collect();
    assert_eq!(names, vec!["Quick"]);
    assert!(fx.export_dir_entries().is_empty());
}

#[tokio::test]
async fn test_cancel_after_archive_created_discards_it() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let a = fx.note(&home.id, "A", "").await;

    let registry = fx.registry();
    registry.start(request(8, &[&a.id])).unwrap();
    wait_for_status(&registry, 8, ExportStatus::ZipCreated).await;

    assert!(registry.cancel(8).await);
    assert!(registry.status(8).is_none());
    assert!(fx.export_dir_entries().is_empty());
}

#[tokio::test]
async fn test_failed_upload_fails_job_until_disposed() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let a = fx.note(&home.id, "A", "").await;

    let services = Services::new(
        fx.notes.clone(),
        fx.attachments.clone(),
        fx.permissions.clone(),
        Arc::new(RejectingDocuments),
    );
    let registry = ExportJobRegistry::new(services, fx.config());
    registry.start(request(9, &[&a.id])).unwrap();

    let snapshot = wait_for_status(&registry, 9, ExportStatus::Failed).await;
    assert!(snapshot
        .failure
        .as_deref()
        .is_some_and(|f| f.contains("quota exceeded")));
    assert!(fx.export_dir_entries().is_empty());
    assert!(matches!(registry.fetch(9).await, Err(Error::InvalidInput(_))));

    assert!(registry.dispose(9).await);
    assert!(registry.status(9).is_none());
}

#[tokio::test]
async fn test_cancel_failed_job_removes_it_quietly() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let a = fx.note(&home.id, "A", "").await;

    let services = Services::new(
        fx.notes.clone(),
        fx.attachments.clone(),
        fx.permissions.clone(),
        Arc::new(RejectingDocuments),
    );
    let registry = ExportJobRegistry::new(services, fx.config());
    let mut events = registry.events();
    registry.start(request(9, &[&a.id])).unwrap();
    wait_for_status(&registry, 9, ExportStatus::Failed).await;

    assert!(registry.cancel(9).await);
    assert!(registry.status(9).is_none());
    assert!(fx.export_dir_entries().is_empty());

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .all(|e| !matches!(e, ExportEvent::JobCancelled { .. })), "{:?}", events);
}

#[tokio::test]
async fn test_unknown_job_ids() {
    let fx = Fixture::new();
    let registry = fx.registry();

    assert!(registry.status(42).is_none());
    assert!(!registry.cancel(42).await);
    assert!(!registry.dispose(42).await);
    assert!(matches!(registry.fetch(42).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_duplicate_job_id_rejected() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let a = fx.note(&home.id, "A", "").await;

    let registry = fx.registry();
    registry.start(request(10, &[&a.id])).unwrap();
    let err = registry.start(request(10, &[&a.id])).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    wait_for_status(&registry, 10, ExportStatus::ZipCreated).await;
    registry.fetch(10).await.unwrap();

    // The id is free again once the job is gone.
    registry.start(request(10, &[&a.id])).unwrap();
    wait_for_status(&registry, 10, ExportStatus::ZipCreated).await;
}

#[tokio::test]
async fn test_events_report_lifecycle() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let a = fx.note(&home.id, "A", "").await;

    let registry = fx.registry();
    let mut events = registry.events();
    registry.start(request(11, &[&a.id])).unwrap();

    let phases = phases_until_archive(&mut events, 11).await;
    assert_eq!(
        phases,
        vec![
            ExportPhase::GettingNotes,
            ExportPhase::UpdatingParents,
            ExportPhase::CreatingContent,
            ExportPhase::ProcessingImages,
            ExportPhase::RewritingLinks,
            ExportPhase::CreatingArchive,
            ExportPhase::CleaningUp,
        ]
    );
}

#[tokio::test]
async fn test_export_all_events_skip_updating_parents() {
    let fx = Fixture::new();
    let home = fx.book(space()).await;
    let a = fx.note(&home.id, "A", "").await;

    let registry = fx.registry();
    let mut events = registry.events();
    registry
        .start(request(15, &[&a.id]).with_export_all(true))
        .unwrap();

    let phases = phases_until_archive(&mut events, 15).await;
    assert_eq!(
        phases,
        vec![
            ExportPhase::GettingNotes,
            ExportPhase::CreatingContent,
            ExportPhase::ProcessingImages,
            ExportPhase::RewritingLinks,
            ExportPhase::CreatingArchive,
            ExportPhase::CleaningUp,
        ]
    );
}

#[tokio::test]
async fn test_shutdown_rejects_new_jobs() {
    let fx = Fixture::new();
    let registry = fx.registry();
    registry.shutdown();
    let err = registry.start(request(12, &["1"])).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(registry.is_empty());
}
