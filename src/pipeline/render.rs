//! PDF rasterisation via pdfium: the production [`DatasetLoader`], plus the
//! [`OverlayWriter`] that turns annotated page images back into a PDF.
//!
//! ## Blocking
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which keeps
//! thread-local state and is not async-safe. Every function here blocks and
//! is called from `tokio::task::spawn_blocking` by the orchestrator.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Page sizes vary wildly: an A0 poster at 200 DPI would produce a
//! 6,600 × 9,400 px image. `max_rendered_pixels` caps the longest edge
//! regardless of physical size, keeping memory per page bounded.

use crate::config::ServeConfig;
use crate::error::{DocServeError, FileError};
use crate::pipeline::dataset::{sample_indices, Dataset, DatasetLoader, MemoryDataset};
use crate::pipeline::export::OverlayWriter;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Environment variable naming an explicit libpdfium to bind.
pub const PDFIUM_LIB_ENV: &str = "PDFIUM_LIB_PATH";

/// Bind pdfium from `PDFIUM_LIB_PATH`, or from the system library path.
fn bind_pdfium() -> Result<Pdfium, String> {
    let bindings = match std::env::var(PDFIUM_LIB_ENV) {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(&path)
            .map_err(|e| format!("{path}: {e:?}"))?,
        _ => Pdfium::bind_to_system_library().map_err(|e| format!("{e:?}"))?,
    };
    Ok(Pdfium::new(bindings))
}

/// Verify that pdfium can be bound. Run once at startup.
pub fn check_pdfium() -> Result<(), DocServeError> {
    bind_pdfium()
        .map(|_| ())
        .map_err(DocServeError::PdfiumBindingFailed)
}

/// Loads PDFs by rasterising their pages with pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumLoader {
    dpi: u32,
    sample_dpi: u32,
    max_pixels: u32,
}

impl PdfiumLoader {
    pub fn new(config: &ServeConfig) -> Self {
        Self {
            dpi: config.dpi,
            sample_dpi: config.sample_dpi,
            max_pixels: config.max_rendered_pixels,
        }
    }
}

impl DatasetLoader for PdfiumLoader {
    fn load_pdf(&self, path: &Path, lang: Option<String>) -> Result<Arc<dyn Dataset>, FileError> {
        let images = render_pages_blocking(path, self.dpi, self.max_pixels, None)?;
        info!("Rendered {} pages of {} at {} DPI", images.len(), path.display(), self.dpi);
        let name = file_label(path);
        Ok(Arc::new(MemoryDataset::new(name, images).with_lang(lang)))
    }

    fn sample_pages(&self, path: &Path, max_pages: usize) -> Result<Vec<DynamicImage>, FileError> {
        render_pages_blocking(path, self.sample_dpi, self.max_pixels, Some(max_pages))
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Rasterise pages of a PDF. `sample` limits rendering to evenly spread pages.
fn render_pages_blocking(
    pdf_path: &Path,
    dpi: u32,
    max_pixels: u32,
    sample: Option<usize>,
) -> Result<Vec<DynamicImage>, FileError> {
    let file = file_label(pdf_path);
    let dataset_err = |detail: String| FileError::Dataset {
        file: file.clone(),
        detail,
    };

    let pdfium = bind_pdfium().map_err(|e| dataset_err(format!("pdfium unavailable: {e}")))?;

    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| dataset_err(format!("{e:?}")))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    debug!("PDF loaded: {} pages", total_pages);

    let indices: Vec<usize> = match sample {
        Some(max) => sample_indices(total_pages, max),
        None => (0..total_pages).collect(),
    };

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(indices.len());
    for idx in indices {
        let page = pages
            .get(idx as u16)
            .map_err(|e| dataset_err(format!("page {}: {e:?}", idx + 1)))?;

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| dataset_err(format!("rasterising page {}: {e:?}", idx + 1)))?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        results.push(image);
    }

    Ok(results)
}

/// Writes annotated pages as an image-only PDF, one page per image.
#[derive(Debug, Clone)]
pub struct PdfiumOverlayWriter {
    dpi: u32,
}

impl PdfiumOverlayWriter {
    /// `dpi` is the resolution the page images were rendered at.
    pub fn new(dpi: u32) -> Self {
        Self { dpi: dpi.max(1) }
    }

    /// Page extent in points for an image `px` pixels wide or tall.
    fn points(&self, px: u32) -> PdfPoints {
        PdfPoints::new(px as f32 * 72.0 / self.dpi as f32)
    }
}

impl OverlayWriter for PdfiumOverlayWriter {
    fn write_pdf(&self, path: &Path, pages: &[DynamicImage]) -> Result<(), FileError> {
        let export_err = |detail: String| FileError::Export {
            path: path.to_path_buf(),
            detail,
        };

        let pdfium = bind_pdfium().map_err(|e| export_err(format!("pdfium unavailable: {e}")))?;
        let mut document = pdfium
            .create_new_pdf()
            .map_err(|e| export_err(format!("{e:?}")))?;

        for (i, image) in pages.iter().enumerate() {
            let (width, height) = (self.points(image.width()), self.points(image.height()));
            let mut page = document
                .pages_mut()
                .create_page_at_end(PdfPagePaperSize::from_points(width, height))
                .map_err(|e| export_err(format!("page {}: {e:?}", i + 1)))?;
            page.objects_mut()
                .create_image_object(PdfPoints::ZERO, PdfPoints::ZERO, image, Some(width), Some(height))
                .map_err(|e| export_err(format!("page {}: {e:?}", i + 1)))?;
        }

        document
            .save_to_file(path)
            .map_err(|e| export_err(format!("{e:?}")))?;
        debug!("Wrote {} annotated pages to {}", pages.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_follows_render_dpi() {
        let writer = PdfiumOverlayWriter::new(144);
        assert_eq!(writer.points(288).value, 144.0);
        assert_eq!(PdfiumOverlayWriter::new(0).points(1).value, 72.0);
    }
}
