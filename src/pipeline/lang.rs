//! Language-detection pre-pass for PDF uploads.
//!
//! A handful of low-resolution page samples run through the shared layout
//! model. Text regions are cropped out and handed to a
//! [`LanguageDetector`]. Regions whose width and height are both below
//! `min_region` pixels are mostly page numbers and stray marks, so they are
//! dropped before detection.
//!
//! Nothing here can fail a file: any model error degrades to
//! [`AUTO_LANG`].

use crate::model::{LanguageDetector, LayoutCategory, LayoutDet, PageModel};
use image::DynamicImage;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Language tag used when nothing was detected.
pub const AUTO_LANG: &str = "auto";

/// Runs layout on page samples and detects the document language.
pub struct LanguagePrepass {
    layout: Arc<dyn PageModel>,
    detector: Arc<dyn LanguageDetector>,
    min_region: u32,
}

impl LanguagePrepass {
    pub fn new(
        layout: Arc<dyn PageModel>,
        detector: Arc<dyn LanguageDetector>,
        min_region: u32,
    ) -> Self {
        Self {
            layout,
            detector,
            min_region,
        }
    }

    /// Crop every sufficiently large text region out of the samples.
    pub fn text_crops(&self, samples: &[DynamicImage]) -> Vec<DynamicImage> {
        let mut crops = Vec::new();
        for (i, sample) in samples.iter().enumerate() {
            let dets = match self.layout.infer(sample) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Language pre-pass: layout failed on sample {}: {}", i, e);
                    continue;
                }
            };
            crops.extend(
                dets.iter()
                    .filter(|d| d.category() == LayoutCategory::Text)
                    .filter(|d| keep_region(d, self.min_region))
                    .filter_map(|d| crop_region(sample, d)),
            );
        }
        debug!("Language pre-pass: {} text crops from {} samples", crops.len(), samples.len());
        crops
    }

    /// Detect the language of the sampled pages, or [`AUTO_LANG`].
    pub fn detect(&self, samples: &[DynamicImage]) -> String {
        let crops = self.text_crops(samples);
        if crops.is_empty() {
            return AUTO_LANG.to_string();
        }
        match self.detector.detect(&crops) {
            Ok(Some(lang)) => {
                info!("Detected document language: {}", lang);
                lang
            }
            Ok(None) => AUTO_LANG.to_string(),
            Err(e) => {
                warn!("Language detection failed, falling back to auto: {}", e);
                AUTO_LANG.to_string()
            }
        }
    }
}

/// A region is discarded only when BOTH sides are below `min`.
pub fn keep_region(det: &LayoutDet, min: u32) -> bool {
    let min = min as f32;
    !(det.width() < min && det.height() < min)
}

/// Crop a detection out of an image, clamped to its bounds.
fn crop_region(image: &DynamicImage, det: &LayoutDet) -> Option<DynamicImage> {
    let (x1, y1, x2, y2) = det.bbox();
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x1 = x1.clamp(0.0, w);
    let y1 = y1.clamp(0.0, h);
    let x2 = x2.clamp(0.0, w);
    let y2 = y2.clamp(0.0, h);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(image.crop_imm(
        x1 as u32,
        y1 as u32,
        (x2 - x1) as u32,
        (y2 - y1) as u32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use image::{Rgb, RgbImage};
    use std::sync::Mutex;

    struct FixedLayout(Vec<LayoutDet>);

    impl PageModel for FixedLayout {
        fn name(&self) -> &str {
            "fixed"
        }

        fn infer(&self, _image: &DynamicImage) -> Result<Vec<LayoutDet>, ModelError> {
            Ok(self.0.clone())
        }
    }

    struct RecordingDetector {
        seen: Mutex<Vec<(u32, u32)>>,
        answer: Option<String>,
    }

    impl LanguageDetector for RecordingDetector {
        fn detect(&self, crops: &[DynamicImage]) -> Result<Option<String>, ModelError> {
            let mut seen = self.seen.lock().unwrap();
            seen.extend(crops.iter().map(|c| (c.width(), c.height())));
            Ok(self.answer.clone())
        }
    }

    fn page() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(600, 800, Rgb([255, 255, 255])))
    }

    #[test]
    fn small_regions_are_discarded_only_when_both_sides_are_small() {
        assert!(!keep_region(&LayoutDet::from_bbox(1, [0.0, 0.0, 99.0, 99.0], 1.0), 100));
        assert!(keep_region(&LayoutDet::from_bbox(1, [0.0, 0.0, 300.0, 20.0], 1.0), 100));
        assert!(keep_region(&LayoutDet::from_bbox(1, [0.0, 0.0, 20.0, 300.0], 1.0), 100));
        assert!(keep_region(&LayoutDet::from_bbox(1, [0.0, 0.0, 100.0, 100.0], 1.0), 100));
    }

    #[test]
    fn only_text_regions_reach_the_detector() {
        let layout = Arc::new(FixedLayout(vec![
            LayoutDet::from_bbox(1, [0.0, 0.0, 400.0, 50.0], 0.9),
            LayoutDet::from_bbox(1, [0.0, 0.0, 50.0, 50.0], 0.9),
            LayoutDet::from_bbox(3, [0.0, 0.0, 400.0, 400.0], 0.9),
            LayoutDet::from_bbox(1, [500.0, 700.0, 900.0, 1000.0], 0.9),
        ]));
        let detector = Arc::new(RecordingDetector {
            seen: Mutex::new(Vec::new()),
            answer: Some("en".into()),
        });
        let prepass = LanguagePrepass::new(layout, detector.clone(), 100);

        assert_eq!(prepass.detect(&[page()]), "en");
        // The last region is clamped to the page.
        assert_eq!(*detector.seen.lock().unwrap(), vec![(400, 50), (100, 100)]);
    }

    #[test]
    fn no_crops_means_auto() {
        let layout = Arc::new(FixedLayout(vec![]));
        let detector = Arc::new(RecordingDetector {
            seen: Mutex::new(Vec::new()),
            answer: Some("fr".into()),
        });
        let prepass = LanguagePrepass::new(layout, detector.clone(), 100);
        assert_eq!(prepass.detect(&[page()]), AUTO_LANG);
        assert!(detector.seen.lock().unwrap().is_empty());
    }
}
