//! # notes-export
//!
//! Asynchronous export and import of hierarchical notes.
//!
//! This crate provides:
//! - Cancellable export jobs, tracked by a registry and polled by id
//! - Subtree and selection export of note trees
//! - Portable placeholder tokens for media and note links
//! - Zip archives with a JSON document, media and featured images
//! - Import with conflict policies and link re-resolution
//!
//! ## Example
//!
//! ```ignore
//! use notes_export::{ExportConfig, ExportJobRegistry, ExportRequest, Identity, Services};
//!
//! let registry = ExportJobRegistry::new(services, ExportConfig::from_env());
//! registry.start(ExportRequest::new(1, vec!["42".into()], Identity::new("john")))?;
//!
//! let mut events = registry.events();
//! while let Ok(event) = events.recv().await {
//!     if let ExportEvent::ArchiveCreated { job_id, .. } = event {
//!         let bytes = registry.fetch(job_id).await?;
//!         break;
//!     }
//! }
//! ```

pub mod archive;
pub mod config;
pub mod graph;
pub mod import;
pub mod job;
pub mod registry;
pub mod rewrite;
pub mod services;
pub mod staging;
pub mod token;
pub mod worker;

// Re-export core types
pub use notes_core::*;

pub use archive::{
    ArchiveContents, ArchiveNode, ArchiveReader, ArchiveWriter, ExportDocument, ImportUnit,
};
pub use config::ExportConfig;
pub use graph::{ContentGraphBuilder, ExportForest, ExportNode, NodeIndex};
pub use import::{ImportReconciler, ImportReport, ImportRequest};
pub use job::{ExportJob, ExportRequest, Outcome};
pub use registry::ExportJobRegistry;
pub use rewrite::{LinkRewriter, MediaReference};
pub use services::Services;
pub use staging::ExportStaging;
pub use token::PlaceholderToken;
pub use worker::{ExportEvent, ExportWorker};
