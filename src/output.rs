//! Output types: per-page inference results and per-file request outcomes.

use crate::error::FileError;
use crate::model::LayoutDet;
use crate::pipeline::dataset::Dataset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Page number and rendered dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page_no: usize,
    pub width: u32,
    pub height: u32,
}

/// The model output for one page.
///
/// Pages outside the inferred range are zeroed placeholders: width and
/// height 0, no detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub layout_dets: Vec<LayoutDet>,
    pub page_info: PageInfo,
}

impl PageResult {
    pub fn inferred(page_no: usize, width: u32, height: u32, layout_dets: Vec<LayoutDet>) -> Self {
        Self {
            layout_dets,
            page_info: PageInfo {
                page_no,
                width,
                height,
            },
        }
    }

    pub fn placeholder(page_no: usize) -> Self {
        Self::inferred(page_no, 0, 0, Vec::new())
    }

    pub fn page_no(&self) -> usize {
        self.page_info.page_no
    }

    pub fn is_placeholder(&self) -> bool {
        self.page_info.width == 0 && self.page_info.height == 0 && self.layout_dets.is_empty()
    }
}

/// Timing and batching figures for one engine run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceStats {
    pub total_pages: usize,
    pub inferred_pages: usize,
    pub batched: bool,
    pub batch_ratio: usize,
    pub elapsed_ms: u64,
    pub reclaim_ms: u64,
    pub pages_per_second: f64,
}

/// Page-ordered model output for one document.
///
/// Holds a shared handle to the source dataset so the exporter can crop
/// regions from the rendered pages. Consumed once by
/// [`crate::pipeline::export::ArtifactRenderer::render`].
pub struct InferenceResult {
    pub pages: Vec<PageResult>,
    pub dataset: Arc<dyn Dataset>,
    pub stats: InferenceStats,
}

impl fmt::Debug for InferenceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceResult")
            .field("pages", &self.pages.len())
            .field("dataset", &"<dyn Dataset>")
            .field("stats", &self.stats)
            .finish()
    }
}

impl InferenceResult {
    /// The raw per-page model output, as written to `<stem>_model.json`.
    pub fn model_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.pages).unwrap_or(serde_json::Value::Null)
    }
}

/// Artifacts produced for one successful file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileArtifacts {
    /// Exported documents (Markdown, JSON, visualisations).
    pub files: Vec<PathBuf>,
    /// Images written to the file's image directory.
    pub images: Vec<PathBuf>,
}

/// A file that failed, and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFailure {
    pub file_name: String,
    pub error: FileError,
}

/// Terminal state of one uploaded file.
#[derive(Debug, Clone)]
pub enum FileStatus {
    Succeeded(FileArtifacts),
    Failed(FileError),
    Skipped,
}

/// Outcome of one uploaded file.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub file_name: String,
    pub status: FileStatus,
}

/// Aggregated outcome of a multi-file request.
///
/// A file absent from both `results` and `failures` was skipped as an
/// unsupported type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub results: BTreeMap<String, FileArtifacts>,
    pub failures: Vec<FileFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

impl BatchOutcome {
    pub fn record(&mut self, outcome: FileOutcome) {
        match outcome.status {
            FileStatus::Succeeded(artifacts) => {
                self.results.insert(outcome.file_name, artifacts);
            }
            FileStatus::Failed(error) => self.failures.push(FileFailure {
                file_name: outcome.file_name,
                error,
            }),
            FileStatus::Skipped => self.skipped.push(outcome.file_name),
        }
    }

    /// Names of failed files, in processing order.
    pub fn fails(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.file_name.as_str()).collect()
    }
}

impl FromIterator<FileOutcome> for BatchOutcome {
    fn from_iter<I: IntoIterator<Item = FileOutcome>>(iter: I) -> Self {
        let mut out = BatchOutcome::default();
        for o in iter {
            out.record(o);
        }
        out
    }
}
