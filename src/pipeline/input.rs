//! Input resolution: turn a local path or a URL into an [`UploadedFile`].
//!
//! The HTTP boundary builds `UploadedFile`s straight from multipart parts;
//! the CLI `parse` command goes through [`resolve_input`] so local files and
//! URLs reach the orchestrator in the same shape.

use crate::error::FileError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One uploaded document: its client-side name and raw bytes.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a local path or URL into an [`UploadedFile`].
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<UploadedFile, FileError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(Path::new(input)).await
    }
}

/// Read a local file, keeping its file name.
pub async fn read_local(path: &Path) -> Result<UploadedFile, FileError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| FileError::io(path, e))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    debug!("Read {} ({} bytes)", path.display(), bytes.len());
    Ok(UploadedFile::new(file_name, bytes))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<UploadedFile, FileError> {
    info!("Downloading document from: {}", url);
    let fail = |detail: String| FileError::Io {
        path: PathBuf::from(url),
        detail,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| fail(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            fail(format!("download timed out after {timeout_secs}s"))
        } else {
            fail(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(fail(format!("HTTP {}", response.status())));
    }

    let file_name = filename_from_url(url);
    let bytes = response.bytes().await.map_err(|e| fail(e.to_string()))?;
    info!("Downloaded {} ({} bytes)", file_name, bytes.len());
    Ok(UploadedFile::new(file_name, bytes.to_vec()))
}

/// Last path segment of the URL when it looks like a file name.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded.pdf".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
    }

    #[test]
    fn url_file_names() {
        assert_eq!(filename_from_url("https://x.org/papers/a.pdf?dl=1"), "a.pdf");
        assert_eq!(filename_from_url("https://x.org/papers/"), "downloaded.pdf");
        assert_eq!(filename_from_url("https://x.org/view"), "downloaded.pdf");
    }

    #[tokio::test]
    async fn local_files_keep_their_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slides.pptx");
        std::fs::write(&path, b"pk").unwrap();
        let up = resolve_input(path.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(up.file_name, "slides.pptx");
        assert_eq!(up.bytes, b"pk");
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let err = resolve_input("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(matches!(err, FileError::Io { .. }));
    }
}
