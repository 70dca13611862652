//! Artifact export: turn an [`InferenceResult`] into files on disk.
//!
//! [`StandardRenderer`] writes, into the file's workspace:
//!
//! | File | Content |
//! |------|---------|
//! | `<stem>.md` | Markdown in reading order |
//! | `<stem>_content_list.json` | flat list of typed blocks |
//! | `<stem>_middle.json` | per-page blocks with geometry, plus `_lang` |
//! | `<stem>_model.json` | raw per-page model output |
//! | `<stem>_model.pdf` | pages with every raw detection outlined |
//! | `<stem>_layout.pdf` | pages with kept blocks outlined by category |
//! | `<stem>_spans.pdf` | pages with text-bearing regions outlined |
//!
//! Figure and table regions are cropped into the image directory and
//! referenced from Markdown as `images/<file>`. Placeholder pages (outside
//! the inferred range) contribute nothing.
//!
//! The annotated PDFs are drawn as images first and then handed to an
//! [`OverlayWriter`]; production uses pdfium (`PdfiumOverlayWriter`).

use crate::error::FileError;
use crate::model::{LayoutCategory, LayoutDet};
use crate::output::{FileArtifacts, InferenceResult, PageResult};
use crate::pipeline::encode::png_bytes;
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Where one file's artifacts go.
#[derive(Debug, Clone, Copy)]
pub struct ExportTarget<'a> {
    pub stem: &'a str,
    pub output_dir: &'a Path,
    pub image_dir: &'a Path,
}

/// Renders an inference result into named artifacts. Blocks.
pub trait ArtifactRenderer: Send + Sync {
    fn render(&self, result: InferenceResult, target: ExportTarget<'_>) -> Result<FileArtifacts, FileError>;
}

/// Writes annotated page images as one PDF. Blocks.
pub trait OverlayWriter: Send + Sync {
    fn write_pdf(&self, path: &Path, pages: &[DynamicImage]) -> Result<(), FileError>;
}

/// The three annotated views of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlay {
    /// Every raw detection, abandoned regions included.
    Model,
    /// Kept blocks, coloured by category.
    Layout,
    /// Text-bearing regions only.
    Spans,
}

impl Overlay {
    pub const ALL: [Overlay; 3] = [Overlay::Model, Overlay::Layout, Overlay::Spans];

    pub fn file_name(self, stem: &str) -> String {
        match self {
            Overlay::Model => format!("{stem}_model.pdf"),
            Overlay::Layout => format!("{stem}_layout.pdf"),
            Overlay::Spans => format!("{stem}_spans.pdf"),
        }
    }

    /// Draw this view over one page image.
    pub fn draw(self, image: &DynamicImage, dets: &[LayoutDet]) -> DynamicImage {
        match self {
            Overlay::Model => outline(image, dets, |_| Rgb([255, 0, 0])),
            Overlay::Layout => {
                let kept: Vec<LayoutDet> = dets
                    .iter()
                    .filter(|d| d.category() != LayoutCategory::Abandon)
                    .cloned()
                    .collect();
                outline(image, &kept, category_color)
            }
            Overlay::Spans => {
                let text: Vec<LayoutDet> = dets.iter().filter(|d| is_span(d.category())).cloned().collect();
                outline(image, &text, |_| Rgb([220, 40, 40]))
            }
        }
    }
}

/// Writes Markdown, JSON and the annotated PDFs.
#[derive(Clone)]
pub struct StandardRenderer {
    overlays: Option<Arc<dyn OverlayWriter>>,
}

impl StandardRenderer {
    pub fn new(overlays: Arc<dyn OverlayWriter>) -> Self {
        Self {
            overlays: Some(overlays),
        }
    }

    /// Markdown and JSON only.
    pub fn text_only() -> Self {
        Self { overlays: None }
    }
}

impl fmt::Debug for StandardRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardRenderer")
            .field("visualize", &self.overlays.is_some())
            .finish()
    }
}

/// One block of the content list.
#[derive(Debug, Clone, PartialEq)]
enum Block {
    Title(String),
    Text(String),
    Equation(String),
    Image {
        path: String,
        caption: Vec<String>,
    },
    Table {
        path: String,
        body: Option<String>,
        caption: Vec<String>,
        footnote: Vec<String>,
    },
}

impl Block {
    fn to_json(&self, page_idx: usize) -> Value {
        match self {
            Block::Title(t) => json!({"type": "text", "text": t, "text_level": 1, "page_idx": page_idx}),
            Block::Text(t) => json!({"type": "text", "text": t, "page_idx": page_idx}),
            Block::Equation(t) => json!({
                "type": "equation",
                "text": format!("$$\n{t}\n$$"),
                "text_format": "latex",
                "page_idx": page_idx,
            }),
            Block::Image { path, caption } => json!({
                "type": "image",
                "img_path": path,
                "img_caption": caption,
                "page_idx": page_idx,
            }),
            Block::Table {
                path,
                body,
                caption,
                footnote,
            } => json!({
                "type": "table",
                "img_path": path,
                "table_body": body,
                "table_caption": caption,
                "table_footnote": footnote,
                "page_idx": page_idx,
            }),
        }
    }

    fn to_markdown(&self) -> String {
        match self {
            Block::Title(t) => format!("# {t}"),
            Block::Text(t) => t.clone(),
            Block::Equation(t) => format!("$$\n{t}\n$$"),
            Block::Image { path, caption } => {
                let mut md = format!("![]({path})");
                for c in caption {
                    md.push('\n');
                    md.push_str(c);
                }
                md
            }
            Block::Table {
                path,
                body,
                caption,
                footnote,
            } => {
                let mut parts: Vec<String> = caption.clone();
                match body {
                    Some(b) => parts.push(b.clone()),
                    None => parts.push(format!("![]({path})")),
                }
                parts.extend(footnote.iter().cloned());
                parts.join("\n\n")
            }
        }
    }
}

impl ArtifactRenderer for StandardRenderer {
    fn render(&self, result: InferenceResult, target: ExportTarget<'_>) -> Result<FileArtifacts, FileError> {
        let stem = target.stem;
        let mut artifacts = FileArtifacts::default();
        let mut content_list: Vec<Value> = Vec::new();
        let mut markdown: Vec<String> = Vec::new();
        let mut pdf_info: Vec<Value> = Vec::new();
        let mut overlay_pages: Vec<Vec<DynamicImage>> = vec![Vec::new(); Overlay::ALL.len()];

        for page in result.pages.iter().filter(|p| !p.is_placeholder()) {
            let page_no = page.page_no();
            let image = result.dataset.page(page_no)?.image;

            let blocks = page_blocks(page, &image, target.image_dir, &mut artifacts.images)?;
            for block in &blocks {
                content_list.push(block.to_json(page_no));
                markdown.push(block.to_markdown());
            }
            pdf_info.push(middle_page(page));

            if self.overlays.is_some() {
                for (pages, overlay) in overlay_pages.iter_mut().zip(Overlay::ALL) {
                    pages.push(overlay.draw(&image, &page.layout_dets));
                }
            }
        }

        let md_path = target.output_dir.join(format!("{stem}.md"));
        write_file(&md_path, markdown.join("\n\n").as_bytes())?;

        let content_path = target.output_dir.join(format!("{stem}_content_list.json"));
        write_json(&content_path, &Value::Array(content_list))?;

        let middle_path = target.output_dir.join(format!("{stem}_middle.json"));
        let middle = json!({
            "pdf_info": pdf_info,
            "_backend": "layout",
            "_lang": result.dataset.lang(),
            "_stats": result.stats,
        });
        write_json(&middle_path, &middle)?;

        let model_path = target.output_dir.join(format!("{stem}_model.json"));
        write_json(&model_path, &result.model_json())?;

        artifacts.files = vec![md_path, content_path, middle_path, model_path];

        if let Some(writer) = &self.overlays {
            for (pages, overlay) in overlay_pages.iter().zip(Overlay::ALL) {
                let path = target.output_dir.join(overlay.file_name(stem));
                writer.write_pdf(&path, pages)?;
                artifacts.files.push(path);
            }
        }

        info!(
            "Exported {} files and {} images for {}",
            artifacts.files.len(),
            artifacts.images.len(),
            stem
        );
        Ok(artifacts)
    }
}

/// Regions drawn on the span visualisation.
fn is_span(cat: LayoutCategory) -> bool {
    matches!(
        cat,
        LayoutCategory::Title
            | LayoutCategory::Text
            | LayoutCategory::OcrText
            | LayoutCategory::InlineFormula
            | LayoutCategory::IsolatedFormula
    )
}

fn det_text(det: &LayoutDet) -> String {
    det.text
        .as_deref()
        .or(det.latex.as_deref())
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn center(det: &LayoutDet) -> (f32, f32) {
    let (x1, y1, x2, y2) = det.bbox();
    ((x1 + x2) / 2.0, (y1 + y2) / 2.0)
}

/// Texts of `kind` regions whose centre is nearest to `anchor`.
fn nearest_texts(anchor: &LayoutDet, dets: &[LayoutDet], kind: LayoutCategory) -> Vec<String> {
    let (ax, ay) = center(anchor);
    dets.iter()
        .filter(|d| d.category() == kind)
        .min_by(|a, b| {
            let da = dist2(center(a), (ax, ay));
            let db = dist2(center(b), (ax, ay));
            da.total_cmp(&db)
        })
        .map(det_text)
        .filter(|t| !t.is_empty())
        .into_iter()
        .collect()
}

fn dist2(a: (f32, f32), b: (f32, f32)) -> f32 {
    (a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)
}

/// Build the content blocks of one page, cropping visual regions to disk.
fn page_blocks(
    page: &PageResult,
    image: &DynamicImage,
    image_dir: &Path,
    images: &mut Vec<PathBuf>,
) -> Result<Vec<Block>, FileError> {
    let dets = &page.layout_dets;
    let mut blocks = Vec::new();

    for (k, det) in dets.iter().enumerate() {
        let cat = det.category();
        match cat {
            LayoutCategory::Title => push_text(&mut blocks, det, Block::Title),
            LayoutCategory::Text | LayoutCategory::OcrText | LayoutCategory::InlineFormula => {
                push_text(&mut blocks, det, Block::Text)
            }
            LayoutCategory::IsolatedFormula => push_text(&mut blocks, det, Block::Equation),
            cat if cat.is_visual() => {
                let name = format!("p{}_r{}_{}.png", page.page_no() + 1, k, cat.label());
                let Some(rel) = save_crop(image, det, image_dir, &name, images)? else {
                    continue;
                };
                if cat == LayoutCategory::Figure {
                    blocks.push(Block::Image {
                        path: rel,
                        caption: nearest_texts(det, dets, LayoutCategory::FigureCaption),
                    });
                } else {
                    blocks.push(Block::Table {
                        path: rel,
                        body: det.text.clone().filter(|t| !t.trim().is_empty()),
                        caption: nearest_texts(det, dets, LayoutCategory::TableCaption),
                        footnote: nearest_texts(det, dets, LayoutCategory::TableFootnote),
                    });
                }
            }
            // Captions are attached to their figure or table; abandon is dropped.
            _ => {}
        }
    }
    Ok(blocks)
}

fn push_text(blocks: &mut Vec<Block>, det: &LayoutDet, make: fn(String) -> Block) {
    let text = det_text(det);
    if !text.is_empty() {
        blocks.push(make(text));
    }
}

/// Crop `det` out of the page into `image_dir/name`; returns `images/<name>`.
fn save_crop(
    image: &DynamicImage,
    det: &LayoutDet,
    image_dir: &Path,
    name: &str,
    images: &mut Vec<PathBuf>,
) -> Result<Option<String>, FileError> {
    let (x1, y1, x2, y2) = det.bbox();
    let (w, h) = (image.width() as f32, image.height() as f32);
    let (x1, y1) = (x1.clamp(0.0, w), y1.clamp(0.0, h));
    let (x2, y2) = (x2.clamp(0.0, w), y2.clamp(0.0, h));
    if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
        debug!("Skipping empty crop {}", name);
        return Ok(None);
    }
    let crop = image.crop_imm(x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32);
    let path = image_dir.join(name);
    write_png(&path, &crop)?;
    images.push(path);
    Ok(Some(format!("images/{name}")))
}

fn middle_page(page: &PageResult) -> Value {
    let block = |d: &LayoutDet| {
        let (x1, y1, x2, y2) = d.bbox();
        json!({
            "type": d.category().label(),
            "bbox": [x1, y1, x2, y2],
            "score": d.score,
            "text": det_text(d),
        })
    };
    let (discarded, kept): (Vec<&LayoutDet>, Vec<&LayoutDet>) = page
        .layout_dets
        .iter()
        .partition(|d| d.category() == LayoutCategory::Abandon);
    json!({
        "page_idx": page.page_no(),
        "page_size": [page.page_info.width, page.page_info.height],
        "para_blocks": kept.into_iter().map(block).collect::<Vec<_>>(),
        "discarded_blocks": discarded.into_iter().map(block).collect::<Vec<_>>(),
    })
}

fn category_color(cat: LayoutCategory) -> Rgb<u8> {
    match cat {
        LayoutCategory::Title => Rgb([102, 102, 255]),
        LayoutCategory::Text | LayoutCategory::OcrText => Rgb([153, 0, 76]),
        LayoutCategory::Figure => Rgb([153, 255, 51]),
        LayoutCategory::Table => Rgb([204, 204, 0]),
        LayoutCategory::FigureCaption | LayoutCategory::TableCaption | LayoutCategory::FormulaCaption => {
            Rgb([255, 178, 102])
        }
        LayoutCategory::TableFootnote => Rgb([229, 255, 204]),
        LayoutCategory::IsolatedFormula | LayoutCategory::InlineFormula => Rgb([0, 255, 0]),
        LayoutCategory::Abandon => Rgb([158, 158, 158]),
        LayoutCategory::Other(_) => Rgb([0, 0, 0]),
    }
}

/// Copy of `image` with a 2 px outline around each detection.
fn outline(image: &DynamicImage, dets: &[LayoutDet], color: impl Fn(LayoutCategory) -> Rgb<u8>) -> DynamicImage {
    let mut canvas: RgbImage = image.to_rgb8();
    let (w, h) = canvas.dimensions();
    if w == 0 || h == 0 {
        return DynamicImage::ImageRgb8(canvas);
    }
    for det in dets {
        let (x1, y1, x2, y2) = det.bbox();
        let x1 = (x1.max(0.0) as u32).min(w - 1);
        let y1 = (y1.max(0.0) as u32).min(h - 1);
        let x2 = (x2.max(0.0) as u32).min(w - 1);
        let y2 = (y2.max(0.0) as u32).min(h - 1);
        let c = color(det.category());
        for t in 0..2u32 {
            for x in x1..=x2 {
                canvas.put_pixel(x, (y1 + t).min(h - 1), c);
                canvas.put_pixel(x, y2.saturating_sub(t), c);
            }
            for y in y1..=y2 {
                canvas.put_pixel((x1 + t).min(w - 1), y, c);
                canvas.put_pixel(x2.saturating_sub(t), y, c);
            }
        }
    }
    DynamicImage::ImageRgb8(canvas)
}

fn export_err(path: &Path, detail: impl ToString) -> FileError {
    FileError::Export {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), FileError> {
    std::fs::write(path, bytes).map_err(|e| export_err(path, e))
}

fn write_json(path: &Path, value: &Value) -> Result<(), FileError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| export_err(path, e))?;
    write_file(path, &bytes)
}

fn write_png(path: &Path, image: &DynamicImage) -> Result<(), FileError> {
    let bytes = png_bytes(image).map_err(|e| export_err(path, e))?;
    write_file(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::InferenceStats;
    use crate::pipeline::dataset::{Dataset, MemoryDataset};
    use std::sync::Mutex;

    /// Records what would have gone into each PDF.
    #[derive(Default)]
    struct RecordingWriter {
        written: Mutex<Vec<(PathBuf, Vec<DynamicImage>)>>,
    }

    impl OverlayWriter for RecordingWriter {
        fn write_pdf(&self, path: &Path, pages: &[DynamicImage]) -> Result<(), FileError> {
            std::fs::write(path, b"%PDF-1.7").map_err(|e| export_err(path, e))?;
            self.written
                .lock()
                .unwrap()
                .push((path.to_path_buf(), pages.to_vec()));
            Ok(())
        }
    }

    struct FailingWriter;

    impl OverlayWriter for FailingWriter {
        fn write_pdf(&self, path: &Path, _pages: &[DynamicImage]) -> Result<(), FileError> {
            Err(export_err(path, "no pdf backend"))
        }
    }

    fn result() -> InferenceResult {
        let pages = (0..2)
            .map(|_| DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 300, Rgb([255, 255, 255]))))
            .collect();
        let dataset: Arc<dyn Dataset> =
            Arc::new(MemoryDataset::new("doc.pdf", pages).with_lang(Some("en".into())));
        InferenceResult {
            pages: vec![
                PageResult::placeholder(0),
                PageResult::inferred(
                    1,
                    200,
                    300,
                    vec![
                        LayoutDet::from_bbox(0, [10.0, 10.0, 190.0, 30.0], 0.9).with_text("Results"),
                        LayoutDet::from_bbox(1, [10.0, 40.0, 190.0, 80.0], 0.9).with_text("Body text."),
                        LayoutDet::from_bbox(3, [20.0, 100.0, 180.0, 200.0], 0.8),
                        LayoutDet::from_bbox(4, [20.0, 205.0, 180.0, 220.0], 0.8).with_text("Figure 1. A plot"),
                        LayoutDet::from_bbox(2, [90.0, 280.0, 110.0, 295.0], 0.5).with_text("2"),
                    ],
                ),
            ],
            dataset,
            stats: InferenceStats::default(),
        }
    }

    #[test]
    fn writes_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("images");
        std::fs::create_dir_all(&image_dir).unwrap();

        let writer = Arc::new(RecordingWriter::default());
        let artifacts = StandardRenderer::new(writer.clone())
            .render(
                result(),
                ExportTarget {
                    stem: "doc",
                    output_dir: dir.path(),
                    image_dir: &image_dir,
                },
            )
            .unwrap();

        let names: Vec<String> = artifacts
            .files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "doc.md",
                "doc_content_list.json",
                "doc_middle.json",
                "doc_model.json",
                "doc_model.pdf",
                "doc_layout.pdf",
                "doc_spans.pdf",
            ]
        );
        assert!(artifacts.files.iter().all(|p| p.exists()));
        assert_eq!(artifacts.images.len(), 1);
        assert!(artifacts.images[0].starts_with(&image_dir));

        let md = std::fs::read_to_string(dir.path().join("doc.md")).unwrap();
        assert!(md.starts_with("# Results"));
        assert!(md.contains("Body text."));
        assert!(md.contains("![](images/p2_r2_image.png)\nFigure 1. A plot"));
        assert!(!md.contains("\n2\n"), "abandoned regions must not reach Markdown");

        let middle: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("doc_middle.json")).unwrap()).unwrap();
        assert_eq!(middle["_lang"], "en");
        assert_eq!(middle["pdf_info"][0]["discarded_blocks"].as_array().unwrap().len(), 1);

        let model: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("doc_model.json")).unwrap()).unwrap();
        assert_eq!(model.as_array().unwrap().len(), 2);

        // One annotated page per inferred page; the placeholder is skipped.
        let written = writer.written.lock().unwrap();
        assert_eq!(written.len(), 3);
        assert!(written.iter().all(|(_, pages)| pages.len() == 1));
    }

    #[test]
    fn overlays_select_their_regions() {
        let r = result();
        let image = r.dataset.page(1).unwrap().image;
        let dets = &r.pages[1].layout_dets;
        // The abandoned page number sits at (90..110, 280..295).
        let edge = (90, 285);

        let model = Overlay::Model.draw(&image, dets).to_rgb8();
        assert_eq!(model.get_pixel(edge.0, edge.1), &Rgb([255, 0, 0]));

        let layout = Overlay::Layout.draw(&image, dets).to_rgb8();
        assert_eq!(layout.get_pixel(edge.0, edge.1), &Rgb([255, 255, 255]));
        assert_eq!(layout.get_pixel(20, 150), &category_color(LayoutCategory::Figure));

        let spans = Overlay::Spans.draw(&image, dets).to_rgb8();
        assert_eq!(spans.get_pixel(20, 150), &Rgb([255, 255, 255]));
        assert_eq!(spans.get_pixel(10, 20), &Rgb([220, 40, 40]));
    }

    #[test]
    fn overlay_failure_fails_the_export() {
        let dir = tempfile::tempdir().unwrap();
        let err = StandardRenderer::new(Arc::new(FailingWriter))
            .render(
                result(),
                ExportTarget {
                    stem: "doc",
                    output_dir: dir.path(),
                    image_dir: dir.path(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, FileError::Export { .. }));
    }

    #[test]
    fn content_list_types() {
        let dir = tempfile::tempdir().unwrap();
        StandardRenderer::text_only()
            .render(
                result(),
                ExportTarget {
                    stem: "doc",
                    output_dir: dir.path(),
                    image_dir: dir.path(),
                },
            )
            .unwrap();
        let list: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("doc_content_list.json")).unwrap()).unwrap();
        let types: Vec<&str> = list
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["text", "text", "image"]);
        assert_eq!(list[0]["text_level"], 1);
        assert_eq!(list[2]["img_caption"][0], "Figure 1. A plot");
        assert_eq!(list[2]["page_idx"], 1);
    }

    #[test]
    fn outline_stays_inside_the_image() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([255, 255, 255])));
        let out = outline(
            &img,
            &[LayoutDet::from_bbox(1, [-5.0, -5.0, 50.0, 50.0], 1.0)],
            category_color,
        );
        assert_eq!(out.to_rgb8().get_pixel(0, 0), &category_color(LayoutCategory::Text));
        assert_eq!(out.to_rgb8().get_pixel(5, 5), &Rgb([255, 255, 255]));
    }
}
