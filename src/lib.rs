//! # edgequake-docserve
//!
//! Serve PDF and Office documents through a shared layout/OCR model and
//! export per-file Markdown, JSON and visualisation artifacts.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload(s)
//!  │
//!  ├─ 1. Workspace  isolated output + image dir per file (removed on failure)
//!  ├─ 2. Classify   .pdf │ .doc/.docx/.ppt/.pptx │ unsupported
//!  ├─ 3. Convert    Office → PDF via LibreOffice
//!  ├─ 4. Render     rasterise pages via pdfium (spawn_blocking)
//!  ├─ 5. Language   optional pre-pass on low-resolution samples
//!  ├─ 6. Infer      single-page or batched, sized by accelerator memory
//!  └─ 7. Export     Markdown, content list, middle/model JSON, PNG overlays
//! ```
//!
//! The batch plan is decided once at startup: the [`ResourceProbe`] reads
//! `VIRTUAL_VRAM_SIZE` or queries the device, and [`planner::plan`] maps the
//! capacity to a batch ratio (≥ 8 GB → 2, ≥ 10 GB → 4, ≥ 16 GB → 8).
//!
//! Each file of a request fails on its own: the response lists successful
//! files with their artifacts and failed files by name.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docserve::{model::vlm, LanguageDetector, Orchestrator, ServeConfig, UploadedFile};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServeConfig::builder().output_root("output").build()?;
//!     let (provider, label) = vlm::resolve_provider(None, None)?;
//!     let runtime = tokio::runtime::Handle::current();
//!     let model = Arc::new(vlm::VlmLayoutModel::new(provider.clone(), label, runtime.clone()));
//!     let detector: Arc<dyn LanguageDetector> =
//!         Arc::new(vlm::VlmLanguageDetector::new(provider, runtime));
//!
//!     let orchestrator = Orchestrator::standard(config, model, Some(detector));
//!     let outcome = orchestrator
//!         .process_batch(vec![UploadedFile::new("paper.pdf", std::fs::read("paper.pdf")?)])
//!         .await;
//!     println!("{} ok, failed: {:?}", outcome.results.len(), outcome.fails());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docserve` binary (clap + indicatif + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod prompts;
pub mod server;
pub mod stream;
pub mod workspace;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{BatchThresholds, PageRange, ServeConfig, ServeConfigBuilder, UnsupportedPolicy};
pub use device::{Device, DeviceCapability, MemoryQuery, ResourceProbe};
pub use error::{DocServeError, FileError, ModelError};
pub use model::{LanguageDetector, LayoutCategory, LayoutDet, PageModel};
pub use orchestrator::{FileKind, FileStage, FileTask, Orchestrator};
pub use output::{
    BatchOutcome, FileArtifacts, FileFailure, FileOutcome, FileStatus, InferenceResult, PageInfo,
    PageResult,
};
pub use pipeline::dataset::{Dataset, DatasetLoader, MemoryDataset, PageUnit};
pub use pipeline::engine::InferenceEngine;
pub use pipeline::export::{ArtifactRenderer, ExportTarget, Overlay, OverlayWriter, StandardRenderer};
pub use pipeline::render::PdfiumOverlayWriter;
pub use pipeline::input::UploadedFile;
pub use pipeline::office::DocumentConverter;
pub use planner::BatchPlan;
pub use progress::{NoopProgressCallback, ProcessingProgressCallback, ProgressCallback};
pub use stream::process_stream;
