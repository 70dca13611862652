//! Progress-callback trait for per-file processing events.
//!
//! Inject an [`Arc<dyn ProcessingProgressCallback>`] via
//! [`crate::config::ServeConfigBuilder::progress_callback`] to observe a
//! request as the orchestrator works through its files. Callers can forward
//! events to a terminal progress bar, a log, or a channel without the
//! library knowing how the host application communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docserve::{ProcessingProgressCallback, ServeConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl ProcessingProgressCallback for CountingCallback {
//!     fn on_file_complete(&self, file_name: &str, artifact_count: usize) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{n}: {file_name} ({artifact_count} artifacts)");
//!     }
//! }
//!
//! let config = ServeConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the orchestrator as it processes each uploaded file.
///
/// With `file_concurrency > 1` the per-file methods may be called
/// concurrently from different tasks. All methods default to no-ops.
pub trait ProcessingProgressCallback: Send + Sync {
    /// Called once before any file is processed.
    fn on_batch_start(&self, total_files: usize) {
        let _ = total_files;
    }

    /// Called when a file enters the pipeline.
    fn on_file_start(&self, file_name: &str) {
        let _ = file_name;
    }

    /// Called after a file's artifacts were exported and kept.
    fn on_file_complete(&self, file_name: &str, artifact_count: usize) {
        let _ = (file_name, artifact_count);
    }

    /// Called when a file failed; its workspace has been discarded.
    fn on_file_error(&self, file_name: &str, error: &str) {
        let _ = (file_name, error);
    }

    /// Called when a file was skipped as an unsupported type.
    fn on_file_skipped(&self, file_name: &str) {
        let _ = file_name;
    }

    /// Called once after every file reached a terminal state.
    fn on_batch_complete(&self, succeeded: usize, failed: usize, skipped: usize) {
        let _ = (succeeded, failed, skipped);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl ProcessingProgressCallback for NoopProgressCallback {}

/// The type stored in [`crate::config::ServeConfig`].
pub type ProgressCallback = Arc<dyn ProcessingProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ProcessingProgressCallback for Recorder {
        fn on_file_start(&self, file_name: &str) {
            self.0.lock().unwrap().push(format!("start {file_name}"));
        }

        fn on_file_error(&self, file_name: &str, _error: &str) {
            self.0.lock().unwrap().push(format!("error {file_name}"));
        }
    }

    #[test]
    fn defaults_are_noops() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(3);
        cb.on_file_start("a.pdf");
        cb.on_file_complete("a.pdf", 4);
        cb.on_file_error("b.pdf", "boom");
        cb.on_file_skipped("c.txt");
        cb.on_batch_complete(1, 1, 1);
    }

    #[test]
    fn overridden_methods_are_called() {
        let rec = Recorder::default();
        rec.on_file_start("a.pdf");
        rec.on_file_complete("a.pdf", 2);
        rec.on_file_error("b.pdf", "boom");
        assert_eq!(*rec.0.lock().unwrap(), vec!["start a.pdf", "error b.pdf"]);
    }
}
