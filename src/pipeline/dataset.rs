//! Page-addressable documents.
//!
//! A [`Dataset`] exposes a page count and, per 0-based index, a rendered page
//! image with its dimensions. The engine only ever reads from it, so a
//! dataset is shared as `Arc<dyn Dataset>` between the engine, the
//! [`crate::output::InferenceResult`] and the exporter.

use crate::error::FileError;
use image::DynamicImage;
use std::path::Path;
use std::sync::Arc;

/// One rendered page.
#[derive(Debug, Clone)]
pub struct PageUnit {
    pub index: usize,
    pub image: Arc<DynamicImage>,
    pub width: u32,
    pub height: u32,
}

impl PageUnit {
    pub fn new(index: usize, image: Arc<DynamicImage>) -> Self {
        let (width, height) = (image.width(), image.height());
        Self {
            index,
            image,
            width,
            height,
        }
    }
}

/// A document whose pages can be fetched by index.
pub trait Dataset: Send + Sync {
    fn page_count(&self) -> usize;

    /// Fetch page `index`; `index` must be `< page_count()`.
    fn page(&self, index: usize) -> Result<PageUnit, FileError>;

    /// Detected or configured document language, if any.
    fn lang(&self) -> Option<&str> {
        None
    }
}

/// A dataset backed by images already in memory.
///
/// Used for rasterised PDFs and directly by library callers and tests.
pub struct MemoryDataset {
    name: String,
    pages: Vec<Arc<DynamicImage>>,
    lang: Option<String>,
}

impl MemoryDataset {
    pub fn new(name: impl Into<String>, pages: Vec<DynamicImage>) -> Self {
        Self {
            name: name.into(),
            pages: pages.into_iter().map(Arc::new).collect(),
            lang: None,
        }
    }

    pub fn with_lang(mut self, lang: Option<String>) -> Self {
        self.lang = lang;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Dataset for MemoryDataset {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page(&self, index: usize) -> Result<PageUnit, FileError> {
        self.pages
            .get(index)
            .map(|img| PageUnit::new(index, Arc::clone(img)))
            .ok_or_else(|| FileError::Dataset {
                file: self.name.clone(),
                detail: format!(
                    "page {} out of range (document has {} pages)",
                    index,
                    self.pages.len()
                ),
            })
    }

    fn lang(&self) -> Option<&str> {
        self.lang.as_deref()
    }
}

/// Builds datasets from PDF files. Both methods block.
pub trait DatasetLoader: Send + Sync {
    /// Rasterise every page of `path` for inference.
    fn load_pdf(&self, path: &Path, lang: Option<String>) -> Result<Arc<dyn Dataset>, FileError>;

    /// Rasterise at most `max_pages` evenly spread pages at low resolution.
    fn sample_pages(&self, path: &Path, max_pages: usize) -> Result<Vec<DynamicImage>, FileError>;
}

/// Pick at most `max` page indices spread evenly across `page_count` pages.
pub fn sample_indices(page_count: usize, max: usize) -> Vec<usize> {
    if page_count == 0 || max == 0 {
        return Vec::new();
    }
    if page_count <= max {
        return (0..page_count).collect();
    }
    let mut out: Vec<usize> = (0..max).map(|i| i * page_count / max).collect();
    out.dedup();
    out
}
