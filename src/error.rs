//! Error types for the edgequake-docserve library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`DocServeError`] — **Fatal**: the service cannot start or cannot
//!   accept requests at all (bad configuration, pdfium not loadable, model
//!   provider not configured, port already bound). These are startup
//!   preconditions and are reported before any request is served.
//!
//! * [`FileError`] — **Per-file**: one uploaded file failed somewhere between
//!   workspace creation and artifact export. It is caught at the file
//!   boundary and recorded in [`crate::output::BatchOutcome`]; the other
//!   files of the same request are unaffected.
//!
//! * [`ModelError`] — returned by [`crate::model::PageModel`] and
//!   [`crate::model::LanguageDetector`] implementations. The engine folds it
//!   into [`FileError::Model`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-docserve library.
#[derive(Debug, Error)]
pub enum DocServeError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The `--device` string could not be parsed.
    #[error("Unknown device '{0}'\nExpected one of: cpu, cuda, cuda:N, npu, npu:N")]
    InvalidDevice(String),

    // ── Startup preconditions ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use a specific copy, or install\n\
libpdfium somewhere the system loader can find it.\n"
    )]
    PdfiumBindingFailed(String),

    /// The configured model provider is not initialised (missing API key etc.).
    #[error("Model provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The output root could not be created.
    #[error("Failed to prepare output root '{path}': {source}")]
    OutputRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Server errors ─────────────────────────────────────────────────────
    /// The HTTP listener could not be bound or crashed.
    #[error("HTTP server error on {addr}: {source}")]
    Server {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A per-file failure.
///
/// Stored in [`crate::output::FileFailure`] so callers can report exactly
/// why each file failed while the rest of the batch succeeds.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileError {
    /// File extension is not one of the supported document types.
    ///
    /// Only produced when [`crate::config::UnsupportedPolicy::Fail`] is set;
    /// the default policy skips such files silently.
    #[error("'{file}': unsupported file type")]
    Unsupported { file: String },

    /// Workspace or temp-input I/O failed.
    #[error("I/O error on '{path}': {detail}")]
    Io { path: PathBuf, detail: String },

    /// Office-to-PDF conversion failed.
    #[error("Conversion of '{file}' failed: {detail}")]
    Conversion { file: String, detail: String },

    /// The PDF could not be opened or rasterised.
    #[error("Could not load document '{file}': {detail}")]
    Dataset { file: String, detail: String },

    /// Batch inference returned a different number of results than images submitted.
    #[error("Inference inconsistency: submitted {submitted} page images, model returned {returned} results")]
    InferenceMismatch { submitted: usize, returned: usize },

    /// The model itself reported an error.
    #[error("Model '{model}' failed on page {page:?}: {detail}")]
    Model {
        model: String,
        page: Option<usize>,
        detail: String,
    },

    /// Writing one of the exported artifacts failed.
    #[error("Failed to export artifact '{path}': {detail}")]
    Export { path: PathBuf, detail: String },

    /// A blocking worker panicked or was cancelled.
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl FileError {
    /// Build an [`FileError::Io`] from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        FileError::Io {
            path: path.into(),
            detail: err.to_string(),
        }
    }
}

/// An error raised by a model collaborator.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// The backend call failed (network, runtime, out of memory, …).
    #[error("backend call failed: {0}")]
    Backend(String),

    /// The backend answered but the answer could not be parsed.
    #[error("unparseable model output: {0}")]
    Parse(String),
}
