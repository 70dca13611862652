//! Per-file workspaces with guaranteed cleanup.
//!
//! Each uploaded file gets two scoped resources:
//!
//! * a [`TempInput`] holding the uploaded bytes (and any converted PDF) in a
//!   private scratch directory, removed when the guard drops, on success and
//!   on failure alike;
//! * a [`Workspace`] holding the output and image directories. It is
//!   removed on drop unless [`Workspace::commit`] was called after the
//!   artifacts were exported, so a failure at any stage leaves nothing
//!   behind.

use crate::error::FileError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Reduce an uploaded file name to a safe single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// File stem used for workspace and artifact names.
pub fn file_stem(name: &str) -> String {
    let safe = sanitize_file_name(name);
    Path::new(&safe)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or(safe)
}

/// Output and image directories for one file.
///
/// The directory is a [`TempDir`] until [`Workspace::commit`] keeps it, so
/// every early return removes the partial output.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    image_dir: PathBuf,
    stem: String,
}

impl Workspace {
    /// Create `<output_root>/<stem>-<random>/` and its `images/` subdirectory.
    pub async fn create(output_root: &Path, file_name: &str) -> Result<Self, FileError> {
        let stem = file_stem(file_name);
        let dir = tempfile::Builder::new()
            .prefix(&format!("{stem}-"))
            .tempdir_in(output_root)
            .map_err(|e| FileError::io(output_root, e))?;
        let image_dir = dir.path().join("images");
        tokio::fs::create_dir(&image_dir)
            .await
            .map_err(|e| FileError::io(&image_dir, e))?;
        debug!("Created workspace {}", dir.path().display());
        Ok(Self {
            dir,
            image_dir,
            stem,
        })
    }

    /// Directory holding Markdown, JSON and visualisation artifacts.
    pub fn output_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Keep the workspace on disk and return its root.
    pub fn commit(self) -> PathBuf {
        self.dir.keep()
    }
}

/// The uploaded bytes of one file, in a private scratch directory.
///
/// Removed on drop, on success and on failure alike.
#[derive(Debug)]
pub struct TempInput {
    path: PathBuf,
    // Kept alive until processing completes.
    dir: TempDir,
}

impl TempInput {
    /// Write `bytes` to `<parent>/<random>/<sanitized name>`.
    pub async fn write(parent: &Path, file_name: &str, bytes: &[u8]) -> Result<Self, FileError> {
        let dir = TempDir::new_in(parent).map_err(|e| FileError::io(parent, e))?;
        let path = dir.path().join(sanitize_file_name(file_name));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| FileError::io(&path, e))?;
        Ok(Self { path, dir })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scratch space for intermediate files (e.g. a converted PDF).
    pub fn scratch_dir(&self) -> &Path {
        self.dir.path()
    }
}
