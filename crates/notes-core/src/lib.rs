//! # notes-core
//!
//! Core types, traits, and abstractions for the notes export engine.
//!
//! This crate provides the note and job data structures, the error type, and
//! the collaborator traits (note store, attachment store, permissions,
//! document store) that the engine in `notes-export` is written against.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod memory;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use memory::{
    InMemoryAttachmentStore, InMemoryDocumentStore, InMemoryNoteStore, InMemoryPermissions,
    UploadedDocument,
};
pub use models::*;
pub use traits::*;
