//! Prompts for the VLM-backed layout model and language detector.
//!
//! Keeping every prompt here means a wording change never touches the retry
//! or parsing logic in [`crate::model::vlm`], and unit tests can inspect the
//! prompts without a live provider.

/// System prompt for page layout analysis.
///
/// The reply is parsed by [`crate::model::vlm::parse_layout_reply`], so the
/// JSON shape described here is a contract.
pub const LAYOUT_SYSTEM_PROMPT: &str = r#"You are a document layout analyser. You receive one rendered page image and return every layout region on it.

Classify each region with exactly one category_id:
  0 title            1 plain text         2 abandon (headers, footers, page numbers)
  3 figure           4 figure caption     5 table
  6 table caption    7 table footnote     8 isolated formula
  9 formula caption

For each region output an object:
  {"category_id": <int>, "bbox": [x1, y1, x2, y2], "score": <0..1>, "text": "<content>"}

Rules:
- Coordinates are integer pixels in the image you were given, origin top-left.
- List regions in reading order.
- "text" holds the transcribed text for text-like regions, LaTeX for formulas,
  and an empty string for figures.
- Tables: "text" holds the table as GitHub-flavoured Markdown.

Output ONLY a JSON array of region objects. No commentary, no code fences."#;

/// The user turn accompanying each page image.
pub fn layout_user_prompt(width: u32, height: u32) -> String {
    format!("Page image size: {width}x{height} pixels. Return the layout regions.")
}

/// System prompt for language identification of a single text crop.
pub const LANGUAGE_SYSTEM_PROMPT: &str = r#"You identify the language of the text in an image.

Reply with ONLY the ISO 639-1 code of the dominant language (for example: en, fr, de, zh, ja, ko, ar).
If the image contains no readable text, reply with: none"#;
