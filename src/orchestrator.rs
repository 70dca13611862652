//! Multi-file request orchestration.
//!
//! Every uploaded file runs through its own [`FileTask`]:
//!
//! ```text
//! Received → WorkspaceCreated → Classified → DatasetBuilt → Inferred
//!          → ArtifactsExported → Succeeded
//!                 └──────────── any error ────────────→ Failed
//! ```
//!
//! A file owns its [`Workspace`] and its [`TempInput`]; nothing else is
//! shared between files except the read-only engine, loader, converter and
//! renderer. An error at any stage is caught at the file boundary, the
//! workspace guard removes the partial output, and the remaining files carry
//! on. The uploaded temp input is removed on every exit path.
//!
//! Blocking stages (conversion, rasterisation, inference, export) run on
//! `spawn_blocking` workers. Files of one request are processed
//! `file_concurrency` at a time; the default of 1 processes them in order.

use crate::config::{ServeConfig, UnsupportedPolicy};
use crate::device::{DeviceCapability, ResourceProbe};
use crate::error::FileError;
use crate::model::{LanguageDetector, PageModel};
use crate::output::{BatchOutcome, FileArtifacts, FileOutcome, FileStatus};
use crate::pipeline::dataset::DatasetLoader;
use crate::pipeline::engine::InferenceEngine;
use crate::pipeline::export::{ArtifactRenderer, ExportTarget, StandardRenderer};
use crate::pipeline::input::UploadedFile;
use crate::pipeline::lang::{LanguagePrepass, AUTO_LANG};
use crate::pipeline::office::{DocumentConverter, SofficeConverter};
use crate::pipeline::render::{PdfiumLoader, PdfiumOverlayWriter};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::workspace::{TempInput, Workspace};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Processing path chosen from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Office,
    Unsupported,
}

impl FileKind {
    pub fn classify(file_name: &str) -> Self {
        let ext = Path::new(file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => FileKind::Pdf,
            "ppt" | "pptx" | "doc" | "docx" => FileKind::Office,
            _ => FileKind::Unsupported,
        }
    }
}

/// Lifecycle of one uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStage {
    Received,
    WorkspaceCreated,
    Classified,
    DatasetBuilt,
    Inferred,
    ArtifactsExported,
    Succeeded,
    Failed,
}

/// One uploaded file moving through the pipeline.
#[derive(Debug)]
pub struct FileTask {
    file_name: String,
    stage: FileStage,
    kind: Option<FileKind>,
}

impl FileTask {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            stage: FileStage::Received,
            kind: None,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn stage(&self) -> FileStage {
        self.stage
    }

    pub fn kind(&self) -> Option<FileKind> {
        self.kind
    }

    fn advance(&mut self, next: FileStage) {
        debug!("{}: {:?} → {:?}", self.file_name, self.stage, next);
        self.stage = next;
    }
}

/// Run a blocking closure on the blocking pool, folding join errors into [`FileError::Worker`].
async fn blocking<T, F>(f: F) -> Result<T, FileError>
where
    F: FnOnce() -> Result<T, FileError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FileError::Worker(e.to_string()))?
}

/// Drives uploaded files through conversion, inference and export.
pub struct Orchestrator {
    config: Arc<ServeConfig>,
    engine: Arc<InferenceEngine>,
    loader: Arc<dyn DatasetLoader>,
    converter: Arc<dyn DocumentConverter>,
    renderer: Arc<dyn ArtifactRenderer>,
    prepass: Option<Arc<LanguagePrepass>>,
}

impl Orchestrator {
    pub fn new(
        config: ServeConfig,
        engine: Arc<InferenceEngine>,
        loader: Arc<dyn DatasetLoader>,
        converter: Arc<dyn DocumentConverter>,
        renderer: Arc<dyn ArtifactRenderer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            loader,
            converter,
            renderer,
            prepass: None,
        }
    }

    /// Production wiring: probe the device once, then pdfium, soffice and
    /// the standard renderer around `model`.
    ///
    /// The probe may shell out to `nvidia-smi`; call this during startup.
    pub fn standard(
        config: ServeConfig,
        model: Arc<dyn PageModel>,
        detector: Option<Arc<dyn LanguageDetector>>,
    ) -> Self {
        let probe = ResourceProbe::from_env(
            DeviceCapability::resolve(config.device),
            config.vram_override_gb,
        );
        let engine = InferenceEngine::from_probe(Arc::clone(&model), &probe, &config.thresholds);
        let plan = engine.plan();
        info!(
            "device: {}, capacity: {} GB, batch: {}, batch_ratio: {}",
            config.device,
            probe.capacity(),
            plan.eligible,
            plan.ratio
        );

        let loader = Arc::new(PdfiumLoader::new(&config));
        let renderer = StandardRenderer::new(Arc::new(PdfiumOverlayWriter::new(config.dpi)));
        let converter = Arc::new(SofficeConverter::new(
            config.soffice_bin.clone(),
            config.conversion_timeout_secs,
        ));
        let min_region = config.min_text_region;
        let detects = config.detects_language();

        let orchestrator = Self::new(
            config,
            Arc::new(engine),
            loader,
            converter,
            Arc::new(renderer),
        );
        match detector {
            Some(d) if detects => {
                orchestrator.with_language_prepass(LanguagePrepass::new(model, d, min_region))
            }
            _ => orchestrator,
        }
    }

    pub fn with_language_prepass(mut self, prepass: LanguagePrepass) -> Self {
        self.prepass = Some(Arc::new(prepass));
        self
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<InferenceEngine> {
        &self.engine
    }

    fn progress(&self) -> ProgressCallback {
        self.config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback))
    }

    /// Process every upload and aggregate the outcomes.
    ///
    /// Never fails as a whole: every error is recorded against its file.
    pub async fn process_batch(&self, uploads: Vec<UploadedFile>) -> BatchOutcome {
        let start = Instant::now();
        let cb = self.progress();
        let total = uploads.len();
        info!("Processing {} uploaded files", total);
        cb.on_batch_start(total);

        let outcome: BatchOutcome = match tempfile::TempDir::new() {
            Ok(scratch) => {
                let outcomes: Vec<FileOutcome> = stream::iter(uploads)
                    .map(|upload| self.process_file(upload, scratch.path()))
                    .buffered(self.config.file_concurrency.max(1))
                    .collect()
                    .await;
                outcomes.into_iter().collect()
            }
            Err(e) => {
                error!("Failed to create scratch directory: {}", e);
                let detail = e.to_string();
                uploads
                    .into_iter()
                    .map(|u| FileOutcome {
                        file_name: u.file_name,
                        status: FileStatus::Failed(FileError::Io {
                            path: std::env::temp_dir(),
                            detail: detail.clone(),
                        }),
                    })
                    .collect()
            }
        };

        cb.on_batch_complete(outcome.results.len(), outcome.failures.len(), outcome.skipped.len());
        info!(
            "Request finished in {:.2}s: {} succeeded, {} failed, {} skipped",
            start.elapsed().as_secs_f64(),
            outcome.results.len(),
            outcome.failures.len(),
            outcome.skipped.len()
        );
        outcome
    }

    /// Process one upload, writing its temp input under `scratch`.
    pub async fn process_file(&self, upload: UploadedFile, scratch: &Path) -> FileOutcome {
        let cb = self.progress();
        let mut task = FileTask::new(upload.file_name.clone());
        cb.on_file_start(task.file_name());

        let status = match self.run_file(&mut task, upload, scratch).await {
            Ok(Some(artifacts)) => {
                info!(
                    "{}: {} files, {} images",
                    task.file_name(),
                    artifacts.files.len(),
                    artifacts.images.len()
                );
                cb.on_file_complete(task.file_name(), artifacts.files.len());
                FileStatus::Succeeded(artifacts)
            }
            Ok(None) => {
                cb.on_file_skipped(task.file_name());
                FileStatus::Skipped
            }
            Err(e) => {
                error!(
                    "Failed to process file {} (after {:?}): {}",
                    task.file_name(),
                    task.stage(),
                    e
                );
                task.advance(FileStage::Failed);
                cb.on_file_error(task.file_name(), &e.to_string());
                FileStatus::Failed(e)
            }
        };

        FileOutcome {
            file_name: task.file_name,
            status,
        }
    }

    /// `Ok(None)` means the file was skipped as unsupported.
    async fn run_file(
        &self,
        task: &mut FileTask,
        upload: UploadedFile,
        scratch: &Path,
    ) -> Result<Option<FileArtifacts>, FileError> {
        let input = TempInput::write(scratch, &upload.file_name, &upload.bytes).await?;
        drop(upload);

        let workspace = Workspace::create(&self.config.output_root, task.file_name()).await?;
        task.advance(FileStage::WorkspaceCreated);

        let kind = FileKind::classify(task.file_name());
        task.kind = Some(kind);
        task.advance(FileStage::Classified);

        let pdf_path: PathBuf = match kind {
            FileKind::Pdf => input.path().to_path_buf(),
            FileKind::Office => {
                let converter = Arc::clone(&self.converter);
                let src = input.path().to_path_buf();
                let out_dir = input.scratch_dir().to_path_buf();
                blocking(move || converter.convert_to_pdf(&src, &out_dir)).await?
            }
            FileKind::Unsupported => match self.config.unsupported_policy {
                UnsupportedPolicy::Skip => {
                    warn!("Skipping {}: unsupported file type", task.file_name());
                    return Ok(None);
                }
                UnsupportedPolicy::Fail => {
                    return Err(FileError::Unsupported {
                        file: task.file_name().to_string(),
                    })
                }
            },
        };

        let lang = self.document_lang(kind, &pdf_path).await;

        let loader = Arc::clone(&self.loader);
        let dataset = blocking(move || loader.load_pdf(&pdf_path, lang)).await?;
        task.advance(FileStage::DatasetBuilt);

        let engine = Arc::clone(&self.engine);
        let range = self.config.page_range;
        let result = blocking(move || engine.run(dataset, range)).await?;
        task.advance(FileStage::Inferred);

        let renderer = Arc::clone(&self.renderer);
        let stem = workspace.stem().to_string();
        let output_dir = workspace.output_dir().to_path_buf();
        let image_dir = workspace.image_dir().to_path_buf();
        let artifacts = blocking(move || {
            renderer.render(
                result,
                ExportTarget {
                    stem: &stem,
                    output_dir: &output_dir,
                    image_dir: &image_dir,
                },
            )
        })
        .await?;
        task.advance(FileStage::ArtifactsExported);

        let kept = workspace.commit();
        debug!("Kept workspace {}", kept.display());
        task.advance(FileStage::Succeeded);
        Ok(Some(artifacts))
    }

    /// Configured language, or the pre-pass result for PDFs when set to auto.
    async fn document_lang(&self, kind: FileKind, pdf_path: &Path) -> Option<String> {
        if !self.config.detects_language() {
            return Some(self.config.lang.clone());
        }
        let prepass = match (&self.prepass, kind) {
            (Some(p), FileKind::Pdf) => Arc::clone(p),
            _ => return None,
        };

        let loader = Arc::clone(&self.loader);
        let engine = Arc::clone(&self.engine);
        let path = pdf_path.to_path_buf();
        let max_pages = self.config.lang_sample_pages;
        let detected = blocking(move || {
            let samples = loader.sample_pages(&path, max_pages)?;
            Ok(engine.exclusive(|| prepass.detect(&samples)))
        })
        .await;

        match detected {
            Ok(lang) => Some(lang),
            Err(e) => {
                warn!("Language pre-pass failed, using {}: {}", AUTO_LANG, e);
                Some(AUTO_LANG.to_string())
            }
        }
    }
}
