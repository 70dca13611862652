//! Pipeline stages for one uploaded document.
//!
//! Each submodule implements one step, so any of them can be swapped (a
//! different rasteriser, converter or exporter) without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ office ──▶ render ──▶ lang ──▶ engine ──▶ export
//! (bytes)   (→ PDF)    (pdfium)   (pre-pass) (model)   (md/json/pdf)
//! ```
//!
//! 1. [`input`]   — local path, URL or multipart part → [`input::UploadedFile`]
//! 2. [`office`]  — `.doc/.docx/.ppt/.pptx` → PDF through LibreOffice
//! 3. [`render`]  — rasterise pages into a [`dataset::Dataset`]; blocking
//! 4. [`lang`]    — detect the document language from low-resolution samples
//! 5. [`engine`]  — schedule pages through the model, single or batched
//! 6. [`export`]  — write Markdown, JSON and visualisations into the workspace
//!
//! [`encode`] turns images into VLM request attachments for
//! [`crate::model::vlm`].

pub mod dataset;
pub mod encode;
pub mod engine;
pub mod export;
pub mod input;
pub mod lang;
pub mod office;
pub mod render;
