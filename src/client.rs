//! Client-side fan-out: upload many documents to a running server.
//!
//! Each file goes up in its own `POST /parsing` request, with at most
//! `workers` requests in flight. A failed upload is logged and returned
//! alongside the others; it never aborts the rest.

use crate::server::{ParsingResponse, FILES_FIELD};
use futures::stream::{self, StreamExt};
use reqwest::multipart::{Form, Part};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Default number of concurrent uploads for `n` files: `n` clamped to 1..=4.
pub fn default_workers(n: usize) -> usize {
    n.clamp(1, 4)
}

/// Why one upload failed.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// Outcome of uploading one file.
#[derive(Debug)]
pub struct SubmitResult {
    pub path: PathBuf,
    pub outcome: Result<ParsingResponse, ClientError>,
}

/// Build the HTTP client used for uploads.
pub fn http_client(timeout_secs: u64) -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Upload one file and decode the server's answer.
pub async fn submit_file(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
) -> Result<ParsingResponse, ClientError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| ClientError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());

    let form = Form::new().part(FILES_FIELD, Part::bytes(bytes).file_name(file_name));
    let response = client.post(url).multipart(form).send().await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<ParsingResponse>().await?)
}

/// Upload `paths` with at most `workers` requests in flight.
///
/// Results come back in the order of `paths`.
pub async fn submit_files(
    client: &reqwest::Client,
    url: &str,
    paths: Vec<PathBuf>,
    workers: Option<usize>,
) -> Vec<SubmitResult> {
    let workers = workers.unwrap_or_else(|| default_workers(paths.len())).max(1);
    info!("Submitting {} files to {} with {} workers", paths.len(), url, workers);

    stream::iter(paths)
        .map(|path| async move {
            let outcome = submit_file(client, url, &path).await;
            if let Err(e) = &outcome {
                error!("File: {} - Info: {}", path.display(), e);
            }
            SubmitResult { path, outcome }
        })
        .buffered(workers)
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_are_clamped() {
        assert_eq!(default_workers(0), 1);
        assert_eq!(default_workers(1), 1);
        assert_eq!(default_workers(3), 3);
        assert_eq!(default_workers(40), 4);
    }

    #[tokio::test]
    async fn unreadable_file_fails_alone() {
        let client = http_client(1).unwrap();
        let results = submit_files(
            &client,
            "http://127.0.0.1:9/parsing",
            vec![PathBuf::from("/definitely/not/here.pdf")],
            None,
        )
        .await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].outcome, Err(ClientError::Read { .. })));
    }
}
