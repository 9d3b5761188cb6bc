//! Collaborator handles shared by exports and imports.

use std::sync::Arc;

use notes_core::{AttachmentStore, DocumentStore, NoteStore, PermissionService};

/// Collaborators the engine runs against.
///
/// Cheap to clone; every spawned export task gets its own copy.
#[derive(Clone)]
pub struct Services {
    pub notes: Arc<dyn NoteStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub permissions: Arc<dyn PermissionService>,
    pub documents: Arc<dyn DocumentStore>,
}

impl Services {
    pub fn new(
        notes: Arc<dyn NoteStore>,
        attachments: Arc<dyn AttachmentStore>,
        permissions: Arc<dyn PermissionService>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            notes,
            attachments,
            permissions,
            documents,
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
