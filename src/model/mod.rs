//! Model collaborators: layout/OCR inference and language detection.
//!
//! The pipeline never looks inside a model. It only needs:
//!
//! * [`PageModel`] — one page image in, a list of [`LayoutDet`] out; or an
//!   ordered batch of images in, one detection list per image out, in the
//!   same order.
//! * [`LanguageDetector`] — text-region crops in, a language code out.
//!
//! Both are constructed once at startup and shared read-only behind `Arc`.
//! [`vlm`] provides implementations backed by a vision LLM.

pub mod vlm;

use crate::error::ModelError;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// One detected region on a page.
///
/// `poly` holds the four corners clockwise from top-left:
/// `[x1, y1, x2, y1, x2, y2, x1, y2]`, in rendered-image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutDet {
    pub category_id: u32,
    pub poly: [f32; 8],
    #[serde(default)]
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latex: Option<String>,
}

impl LayoutDet {
    /// Build a detection from an axis-aligned box.
    pub fn from_bbox(category_id: u32, bbox: [f32; 4], score: f32) -> Self {
        let [x1, y1, x2, y2] = bbox;
        Self {
            category_id,
            poly: [x1, y1, x2, y1, x2, y2, x1, y2],
            score,
            text: None,
            latex: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// `(x1, y1, x2, y2)` taken from the top-left and bottom-right corners.
    pub fn bbox(&self) -> (f32, f32, f32, f32) {
        (self.poly[0], self.poly[1], self.poly[4], self.poly[5])
    }

    pub fn width(&self) -> f32 {
        let (x1, _, x2, _) = self.bbox();
        x2 - x1
    }

    pub fn height(&self) -> f32 {
        let (_, y1, _, y2) = self.bbox();
        y2 - y1
    }

    pub fn category(&self) -> LayoutCategory {
        LayoutCategory::from_id(self.category_id)
    }
}

/// Layout classes understood by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutCategory {
    Title,
    Text,
    Abandon,
    Figure,
    FigureCaption,
    Table,
    TableCaption,
    TableFootnote,
    IsolatedFormula,
    FormulaCaption,
    InlineFormula,
    OcrText,
    Other(u32),
}

impl LayoutCategory {
    pub fn from_id(id: u32) -> Self {
        match id {
            0 => LayoutCategory::Title,
            1 => LayoutCategory::Text,
            2 => LayoutCategory::Abandon,
            3 => LayoutCategory::Figure,
            4 => LayoutCategory::FigureCaption,
            5 => LayoutCategory::Table,
            6 => LayoutCategory::TableCaption,
            7 => LayoutCategory::TableFootnote,
            8 | 14 => LayoutCategory::IsolatedFormula,
            9 => LayoutCategory::FormulaCaption,
            13 => LayoutCategory::InlineFormula,
            15 => LayoutCategory::OcrText,
            other => LayoutCategory::Other(other),
        }
    }

    /// Regions exported as image crops rather than text.
    pub fn is_visual(&self) -> bool {
        matches!(self, LayoutCategory::Figure | LayoutCategory::Table)
    }

    pub fn label(&self) -> &'static str {
        match self {
            LayoutCategory::Title => "title",
            LayoutCategory::Text => "text",
            LayoutCategory::Abandon => "abandon",
            LayoutCategory::Figure => "image",
            LayoutCategory::FigureCaption => "image_caption",
            LayoutCategory::Table => "table",
            LayoutCategory::TableCaption => "table_caption",
            LayoutCategory::TableFootnote => "table_footnote",
            LayoutCategory::IsolatedFormula => "equation",
            LayoutCategory::FormulaCaption => "equation_caption",
            LayoutCategory::InlineFormula => "inline_equation",
            LayoutCategory::OcrText => "ocr_text",
            LayoutCategory::Other(_) => "other",
        }
    }
}

/// A layout / OCR model.
///
/// Implementations must be `Send + Sync`: one instance is shared by every
/// request for the lifetime of the process and is never mutated.
pub trait PageModel: Send + Sync {
    /// Human-readable name for logs and failure records.
    fn name(&self) -> &str;

    /// Run the model on a single page image.
    fn infer(&self, image: &DynamicImage) -> Result<Vec<LayoutDet>, ModelError>;

    /// Run the model on an ordered batch of page images.
    ///
    /// Must return exactly one detection list per submitted image, in
    /// submission order. `batch_ratio` is a hint for how many images the
    /// backend may process per forward pass. The default walks the batch in
    /// `batch_ratio`-sized chunks through [`PageModel::infer`].
    fn infer_batch(
        &self,
        images: &[&DynamicImage],
        batch_ratio: usize,
    ) -> Result<Vec<Vec<LayoutDet>>, ModelError> {
        let mut out = Vec::with_capacity(images.len());
        for chunk in images.chunks(batch_ratio.max(1)) {
            for image in chunk {
                out.push(self.infer(image)?);
            }
        }
        Ok(out)
    }

    /// Release cached accelerator memory. Called once per engine run, never
    /// concurrently with an in-flight inference.
    fn reclaim(&self) {}
}

/// Detects the dominant language of a set of text crops.
pub trait LanguageDetector: Send + Sync {
    /// Returns `None` when the crops carry no usable signal.
    fn detect(&self, crops: &[DynamicImage]) -> Result<Option<String>, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SizeModel {
        calls: AtomicUsize,
    }

    impl PageModel for SizeModel {
        fn name(&self) -> &str {
            "size"
        }

        fn infer(&self, image: &DynamicImage) -> Result<Vec<LayoutDet>, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![LayoutDet::from_bbox(
                1,
                [0.0, 0.0, image.width() as f32, image.height() as f32],
                1.0,
            )])
        }
    }

    #[test]
    fn bbox_round_trip() {
        let d = LayoutDet::from_bbox(3, [10.0, 20.0, 110.0, 70.0], 0.9);
        assert_eq!(d.bbox(), (10.0, 20.0, 110.0, 70.0));
        assert_eq!(d.width(), 100.0);
        assert_eq!(d.height(), 50.0);
        assert_eq!(d.category(), LayoutCategory::Figure);
        assert!(d.category().is_visual());
    }

    #[test]
    fn default_batch_preserves_order_and_count() {
        let model = SizeModel {
            calls: AtomicUsize::new(0),
        };
        let images: Vec<DynamicImage> = (1..=5)
            .map(|w| DynamicImage::ImageRgb8(RgbImage::from_pixel(w, 1, Rgb([0, 0, 0]))))
            .collect();
        let refs: Vec<&DynamicImage> = images.iter().collect();
        let out = model.infer_batch(&refs, 2).unwrap();
        assert_eq!(out.len(), 5);
        for (i, dets) in out.iter().enumerate() {
            assert_eq!(dets[0].width(), (i + 1) as f32);
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn det_deserialises_without_optional_fields() {
        let d: LayoutDet =
            serde_json::from_str(r#"{"category_id":1,"poly":[0,0,1,0,1,1,0,1]}"#).unwrap();
        assert_eq!(d.score, 0.0);
        assert!(d.text.is_none());
    }

    #[test]
    fn unknown_category_maps_to_other() {
        assert_eq!(LayoutCategory::from_id(42), LayoutCategory::Other(42));
        assert_eq!(LayoutCategory::from_id(14), LayoutCategory::IsolatedFormula);
    }
}
