//! Page inference: schedule a document's pages through the model.
//!
//! The engine produces exactly one [`PageResult`] per page of the dataset,
//! ordered by page number, whatever sub-range was actually inferred. Pages
//! outside the requested range are zeroed placeholders, so a page-limited
//! preview still hands downstream consumers a full-length document.
//!
//! ## Single vs. batch mode
//!
//! The [`BatchPlan`] is computed once at startup from the probed device
//! memory. Without batching, pages go through [`PageModel::infer`] one at a
//! time. With batching, every page in range is submitted in one ordered
//! call to [`PageModel::infer_batch`], and the returned detection lists are
//! zipped back onto the submitted pages by position. A count mismatch is an
//! inference inconsistency and fails the file.
//!
//! ## Reclamation
//!
//! After each run the model's cache-reclaim hook runs once. Inference and
//! reclamation share one gate, so reclamation never overlaps an in-flight
//! inference when several files are processed in parallel.

use crate::config::PageRange;
use crate::device::ResourceProbe;
use crate::error::{FileError, ModelError};
use crate::model::PageModel;
use crate::output::{InferenceResult, InferenceStats, PageResult};
use crate::pipeline::dataset::{Dataset, PageUnit};
use crate::planner::{self, BatchPlan, BatchThresholds};
use image::DynamicImage;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info};

/// Runs page images through a shared model.
pub struct InferenceEngine {
    model: Arc<dyn PageModel>,
    plan: BatchPlan,
    gate: Mutex<()>,
}

impl InferenceEngine {
    pub fn new(model: Arc<dyn PageModel>, plan: BatchPlan) -> Self {
        Self {
            model,
            plan,
            gate: Mutex::new(()),
        }
    }

    /// Build an engine whose plan comes from the probed device capacity.
    pub fn from_probe(
        model: Arc<dyn PageModel>,
        probe: &ResourceProbe,
        thresholds: &BatchThresholds,
    ) -> Self {
        let plan = planner::plan(
            probe.capacity(),
            probe.capability().has_accelerator,
            thresholds,
        );
        Self::new(model, plan)
    }

    pub fn plan(&self) -> BatchPlan {
        self.plan
    }

    pub fn model(&self) -> &Arc<dyn PageModel> {
        &self.model
    }

    /// Infer `range` of `dataset` with the startup plan.
    pub fn run(
        &self,
        dataset: Arc<dyn Dataset>,
        range: PageRange,
    ) -> Result<InferenceResult, FileError> {
        self.run_with_plan(dataset, range, self.plan)
    }

    /// Infer `range` of `dataset` with an explicit plan. Blocks.
    pub fn run_with_plan(
        &self,
        dataset: Arc<dyn Dataset>,
        range: PageRange,
        plan: BatchPlan,
    ) -> Result<InferenceResult, FileError> {
        let start = Instant::now();
        let total = dataset.page_count();
        let span = range.resolve(total);
        let inferred_pages = span.map(|(s, e)| e + 1 - s).unwrap_or(0);

        let gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);

        let pages = match span {
            None => Ok((0..total).map(PageResult::placeholder).collect()),
            Some((s, e)) if plan.eligible => self.batch_infer(dataset.as_ref(), s, e, plan.ratio),
            Some((s, e)) => self.single_infer(dataset.as_ref(), s, e),
        };

        let reclaim_start = Instant::now();
        self.model.reclaim();
        let reclaim_ms = reclaim_start.elapsed().as_millis() as u64;
        drop(gate);
        info!("gc time: {:.2}s", reclaim_ms as f64 / 1000.0);

        let pages = pages?;

        let elapsed = start.elapsed();
        let secs = elapsed.as_secs_f64();
        let pages_per_second = if secs > 0.0 {
            inferred_pages as f64 / secs
        } else {
            0.0
        };
        info!(
            "doc analyze time: {:.2}s, speed: {:.2} pages/second ({} of {} pages, batch_ratio {})",
            secs,
            pages_per_second,
            inferred_pages,
            total,
            if plan.eligible { plan.ratio } else { 1 }
        );

        Ok(InferenceResult {
            pages,
            dataset,
            stats: InferenceStats {
                total_pages: total,
                inferred_pages,
                batched: plan.eligible,
                batch_ratio: plan.ratio,
                elapsed_ms: elapsed.as_millis() as u64,
                reclaim_ms,
                pages_per_second,
            },
        })
    }

    /// Run the reclaim hook outside of a document run, e.g. at shutdown.
    pub fn reclaim(&self) {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.model.reclaim();
    }

    /// Run other work on the shared model under the inference gate.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    fn single_infer(
        &self,
        dataset: &dyn Dataset,
        start: usize,
        end: usize,
    ) -> Result<Vec<PageResult>, FileError> {
        let total = dataset.page_count();
        let mut out = Vec::with_capacity(total);

        for index in 0..total {
            if index < start || index > end {
                out.push(PageResult::placeholder(index));
                continue;
            }
            let unit = dataset.page(index)?;
            let page_start = Instant::now();
            let dets = self
                .model
                .infer(&unit.image)
                .map_err(|e| self.model_error(Some(index), e))?;
            debug!(
                "page_id: {}, page total time: {:.2}s",
                index,
                page_start.elapsed().as_secs_f64()
            );
            out.push(PageResult::inferred(index, unit.width, unit.height, dets));
        }

        Ok(out)
    }

    fn batch_infer(
        &self,
        dataset: &dyn Dataset,
        start: usize,
        end: usize,
        ratio: usize,
    ) -> Result<Vec<PageResult>, FileError> {
        let total = dataset.page_count();
        let units = (start..=end)
            .map(|i| dataset.page(i))
            .collect::<Result<Vec<PageUnit>, _>>()?;
        let images: Vec<&DynamicImage> = units.iter().map(|u| u.image.as_ref()).collect();

        debug!("Submitting {} pages in one batch (ratio {})", images.len(), ratio);
        let detections = self
            .model
            .infer_batch(&images, ratio)
            .map_err(|e| self.model_error(None, e))?;

        if detections.len() != units.len() {
            return Err(FileError::InferenceMismatch {
                submitted: units.len(),
                returned: detections.len(),
            });
        }

        let mut out: Vec<PageResult> = (0..total).map(PageResult::placeholder).collect();
        for (unit, dets) in units.into_iter().zip(detections) {
            out[unit.index] = PageResult::inferred(unit.index, unit.width, unit.height, dets);
        }
        Ok(out)
    }

    fn model_error(&self, page: Option<usize>, err: ModelError) -> FileError {
        FileError::Model {
            model: self.model.name().to_string(),
            page,
            detail: err.to_string(),
        }
    }
}
