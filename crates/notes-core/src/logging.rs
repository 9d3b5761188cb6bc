//! Structured logging schema and subscriber setup.
//!
//! Every crate logs with `tracing` using the field names below, so log
//! aggregation can query export and import events uniformly.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Job failed, requires attention |
//! | WARN  | Note skipped, blob missing, best-effort step failed |
//! | INFO  | Job lifecycle (started, archive created, cancelled), import summary |
//! | DEBUG | Phase transitions, per-note decisions |
//! | TRACE | Per-token rewriting |

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ─── Identity fields ───────────────────────────────────────────────────────

/// Export job id.
pub const JOB_ID: &str = "job_id";

/// Store id of the note being processed.
pub const NOTE_ID: &str = "note_id";

/// Portable name of the note being processed.
pub const NOTE_NAME: &str = "note_name";

/// Requesting user.
pub const USER_ID: &str = "user_id";

// ─── Progress fields ───────────────────────────────────────────────────────

/// Current export phase.
pub const PHASE: &str = "phase";

/// Notes processed so far.
pub const PROCESSED: &str = "processed";

/// Conflict policy applied on import.
pub const CONFLICT: &str = "conflict";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of entries written to or read from an archive.
pub const ENTRY_COUNT: &str = "entry_count";

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "notes_export=debug,notes_core=info";

/// Install a global `tracing` subscriber.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `RUST_LOG` | [`DEFAULT_FILTER`] | Standard env filter |
/// | `LOG_FORMAT` | `text` | `json` or `text` |
/// | `LOG_ANSI` | auto | `true`/`false` override ANSI colors |
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        let mut layer = tracing_subscriber::fmt::layer();
        if let Some(ansi) = log_ansi {
            layer = layer.with_ansi(ansi);
        }
        registry.with(layer).try_init()
    };
    installed.is_ok()
}
