//! Streaming API: emit per-file outcomes as they complete.
//!
//! [`crate::Orchestrator::process_batch`] returns only after every file
//! finished. [`process_stream`] yields each [`FileOutcome`] as soon as its
//! file reaches a terminal state, so callers can report progress or start
//! downstream work early. With `file_concurrency > 1` outcomes arrive in
//! completion order, not upload order.

use crate::error::DocServeError;
use crate::orchestrator::Orchestrator;
use crate::output::FileOutcome;
use crate::pipeline::input::UploadedFile;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of per-file outcomes.
pub type OutcomeStream = Pin<Box<dyn Stream<Item = FileOutcome> + Send>>;

/// Process `uploads`, yielding outcomes in completion order.
///
/// The scratch directory for uploaded bytes lives as long as the stream.
///
/// # Example
/// ```rust,no_run
/// use edgequake_docserve::{process_stream, Orchestrator, UploadedFile};
/// use futures::StreamExt;
/// use std::sync::Arc;
///
/// # async fn run(orchestrator: Arc<Orchestrator>) -> Result<(), Box<dyn std::error::Error>> {
/// let uploads = vec![UploadedFile::new("report.pdf", std::fs::read("report.pdf")?)];
/// let mut outcomes = process_stream(orchestrator, uploads)?;
/// while let Some(outcome) = outcomes.next().await {
///     println!("{}: {:?}", outcome.file_name, outcome.status);
/// }
/// # Ok(())
/// # }
/// ```
pub fn process_stream(
    orchestrator: Arc<Orchestrator>,
    uploads: Vec<UploadedFile>,
) -> Result<OutcomeStream, DocServeError> {
    let scratch = Arc::new(
        tempfile::TempDir::new()
            .map_err(|e| DocServeError::Internal(format!("scratch directory: {e}")))?,
    );
    let concurrency = orchestrator.config().file_concurrency.max(1);
    info!("Streaming {} uploaded files ({} at a time)", uploads.len(), concurrency);

    let s = stream::iter(uploads.into_iter().map(move |upload| {
        let orchestrator = Arc::clone(&orchestrator);
        let scratch = Arc::clone(&scratch);
        async move { orchestrator.process_file(upload, scratch.path()).await }
    }))
    .buffer_unordered(concurrency);

    Ok(Box::pin(s))
}
