//! Layout model and language detector backed by a vision LLM.
//!
//! Both collaborators are synchronous ([`PageModel`] and
//! [`LanguageDetector`] are called from `spawn_blocking` workers), while
//! edgequake-llm providers are async. Each wrapper therefore keeps a handle
//! to the runtime it was built on and drives its requests with
//! [`Handle::block_on`]. That is only valid off the async worker threads,
//! which is exactly where the orchestrator calls them.
//!
//! ## Retry strategy
//!
//! HTTP 429 / 503 answers are transient under concurrent load. Each request
//! is retried with exponential backoff (`retry_backoff_ms * 2^attempt`);
//! with 500 ms base and 3 retries the waits are 500 ms → 1 s → 2 s.
//!
//! ## Batching
//!
//! [`PageModel::infer_batch`] sends `batch_ratio` pages concurrently and
//! waits for the whole group before starting the next one. Results are
//! collected per group in submission order, so the returned list lines up
//! with the submitted images position by position.

use crate::error::{DocServeError, ModelError};
use crate::model::{LanguageDetector, LayoutCategory, LayoutDet, PageModel};
use crate::pipeline::encode;
use crate::prompts::{layout_user_prompt, LANGUAGE_SYSTEM_PROMPT, LAYOUT_SYSTEM_PROMPT};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use futures::future::join_all;
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Request tuning shared by both VLM collaborators.
#[derive(Debug, Clone)]
pub struct VlmOptions {
    pub temperature: f32,
    pub max_tokens: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Upper bound on crops sent for language detection.
    pub max_language_crops: usize,
}

impl Default for VlmOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            max_language_crops: 8,
        }
    }
}

impl VlmOptions {
    fn completion(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

/// Resolve the LLM provider used by the VLM collaborators.
///
/// Resolution order:
///
/// 1. An explicit provider name (with `model`, or [`DEFAULT_MODEL`]).
/// 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set.
/// 3. OpenAI whenever `OPENAI_API_KEY` is present.
/// 4. Full auto-detection via [`ProviderFactory::from_env`].
///
/// Returns the provider and a `provider/model` label for logs and errors.
pub fn resolve_provider(
    provider_name: Option<&str>,
    model: Option<&str>,
) -> Result<(Arc<dyn LLMProvider>, String), DocServeError> {
    if let Some(name) = provider_name.filter(|n| !n.is_empty()) {
        let model = model.unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("openai", model.unwrap_or(DEFAULT_MODEL));
    }

    let (llm, _embedding) =
        ProviderFactory::from_env().map_err(|e| DocServeError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                 Set OPENAI_API_KEY, ANTHROPIC_API_KEY or GEMINI_API_KEY, or pass --provider.\n\
                 ({e})"
            ),
        })?;
    Ok((llm, "auto".to_string()))
}

fn create_provider(
    provider: &str,
    model: &str,
) -> Result<(Arc<dyn LLMProvider>, String), DocServeError> {
    let llm = ProviderFactory::create_llm_provider(provider, model).map_err(|e| {
        DocServeError::ProviderNotConfigured {
            provider: provider.to_string(),
            hint: format!("{e}"),
        }
    })?;
    info!("Using model provider {}/{}", provider, model);
    Ok((llm, format!("{provider}/{model}")))
}

/// Send `messages`, retrying transient failures. Returns the reply text.
async fn chat_with_retry(
    provider: &Arc<dyn LLMProvider>,
    messages: &[ChatMessage],
    options: &VlmOptions,
    what: &str,
) -> Result<String, ModelError> {
    let start = Instant::now();
    let completion = options.completion();
    let mut last_err: Option<String> = None;

    for attempt in 0..=options.max_retries {
        if attempt > 0 {
            let backoff = options.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(
                "{}: retry {}/{} after {}ms",
                what, attempt, options.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match provider.chat(messages, Some(&completion)).await {
            Ok(response) => {
                debug!(
                    "{}: {} input tokens, {} output tokens, {:?}",
                    what,
                    response.prompt_tokens,
                    response.completion_tokens,
                    start.elapsed()
                );
                return Ok(response.content);
            }
            Err(e) => {
                warn!("{}: attempt {} failed: {}", what, attempt + 1, e);
                last_err = Some(e.to_string());
            }
        }
    }

    Err(ModelError::Backend(format!(
        "{} failed after {} retries: {}",
        what,
        options.max_retries,
        last_err.unwrap_or_else(|| "unknown error".to_string())
    )))
}

/// Page layout analysis through a vision LLM.
pub struct VlmLayoutModel {
    provider: Arc<dyn LLMProvider>,
    label: String,
    runtime: Handle,
    options: VlmOptions,
}

impl VlmLayoutModel {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>, runtime: Handle) -> Self {
        Self {
            provider,
            label: label.into(),
            runtime,
            options: VlmOptions::default(),
        }
    }

    pub fn with_options(mut self, options: VlmOptions) -> Self {
        self.options = options;
        self
    }

    async fn analyse(&self, image: ImageData, width: u32, height: u32) -> Result<Vec<LayoutDet>, ModelError> {
        let prompt = layout_user_prompt(width, height);
        let messages = vec![
            ChatMessage::system(LAYOUT_SYSTEM_PROMPT),
            ChatMessage::user_with_images(prompt.as_str(), vec![image]),
        ];
        let reply = chat_with_retry(&self.provider, &messages, &self.options, "layout").await?;
        parse_layout_reply(&reply, width, height)
    }
}

fn encode_for_layout(image: &DynamicImage) -> Result<ImageData, ModelError> {
    encode::encode_page(image).map_err(|e| ModelError::Backend(format!("encoding page: {e}")))
}

impl PageModel for VlmLayoutModel {
    fn name(&self) -> &str {
        &self.label
    }

    fn infer(&self, image: &DynamicImage) -> Result<Vec<LayoutDet>, ModelError> {
        let data = encode_for_layout(image)?;
        self.runtime
            .block_on(self.analyse(data, image.width(), image.height()))
    }

    fn infer_batch(
        &self,
        images: &[&DynamicImage],
        batch_ratio: usize,
    ) -> Result<Vec<Vec<LayoutDet>>, ModelError> {
        let mut out = Vec::with_capacity(images.len());
        for group in images.chunks(batch_ratio.max(1)) {
            let requests = group
                .iter()
                .map(|img| -> Result<(ImageData, u32, u32), ModelError> {
                    Ok((encode_for_layout(img)?, img.width(), img.height()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let replies = self.runtime.block_on(join_all(
                requests
                    .into_iter()
                    .map(|(data, w, h)| self.analyse(data, w, h)),
            ));
            for reply in replies {
                out.push(reply?);
            }
        }
        Ok(out)
    }
}

/// Language identification through a vision LLM.
///
/// Each crop is classified on its own; the most frequent answer wins, ties
/// going to the answer seen first.
pub struct VlmLanguageDetector {
    provider: Arc<dyn LLMProvider>,
    runtime: Handle,
    options: VlmOptions,
}

impl VlmLanguageDetector {
    pub fn new(provider: Arc<dyn LLMProvider>, runtime: Handle) -> Self {
        Self {
            provider,
            runtime,
            options: VlmOptions::default(),
        }
    }

    pub fn with_options(mut self, options: VlmOptions) -> Self {
        self.options = options;
        self
    }

    async fn classify(&self, crop: ImageData) -> Result<Option<String>, ModelError> {
        let messages = vec![
            ChatMessage::system(LANGUAGE_SYSTEM_PROMPT),
            ChatMessage::user_with_images("", vec![crop]),
        ];
        let reply = chat_with_retry(&self.provider, &messages, &self.options, "language").await?;
        Ok(normalize_language(&reply))
    }
}

impl LanguageDetector for VlmLanguageDetector {
    fn detect(&self, crops: &[DynamicImage]) -> Result<Option<String>, ModelError> {
        let encoded = crops
            .iter()
            .take(self.options.max_language_crops.max(1))
            .map(|c| encode::encode_crop(c).map_err(|e| ModelError::Backend(format!("encoding crop: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;

        let answers = self
            .runtime
            .block_on(join_all(encoded.into_iter().map(|c| self.classify(c))));

        let mut votes = Vec::new();
        let mut last_err = None;
        for answer in answers {
            match answer {
                Ok(Some(lang)) => votes.push(lang),
                Ok(None) => {}
                Err(e) => last_err = Some(e),
            }
        }
        match (majority(&votes), last_err) {
            (None, Some(e)) => Err(e),
            (winner, _) => Ok(winner),
        }
    }
}

/// Most frequent entry; ties go to the entry seen first.
pub fn majority(votes: &[String]) -> Option<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (i, v) in votes.iter().enumerate() {
        counts.entry(v.as_str()).or_insert((0, i)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)))
        .map(|(lang, _)| lang.to_string())
}

/// Reduce a free-form reply to a lowercase ISO 639-1 code.
pub fn normalize_language(reply: &str) -> Option<String> {
    let token = reply
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | ';' | ':'))
        .map(|t| t.trim_matches(|c: char| !c.is_ascii_alphabetic()))
        .find(|t| !t.is_empty())?
        .to_ascii_lowercase();
    if token == "none" || !(2..=3).contains(&token.len()) {
        return None;
    }
    Some(token)
}

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap());

#[derive(Debug, Deserialize)]
struct RawRegion {
    category_id: u32,
    bbox: [f32; 4],
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    text: Option<String>,
}

/// Parse a layout reply into detections clamped to the page.
///
/// Accepts a bare JSON array, an array inside a code fence, or an array
/// embedded in surrounding prose.
pub fn parse_layout_reply(reply: &str, width: u32, height: u32) -> Result<Vec<LayoutDet>, ModelError> {
    let body = CODE_FENCE
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(reply);

    let json = match (body.find('['), body.rfind(']')) {
        (Some(s), Some(e)) if e > s => &body[s..=e],
        _ if body.trim().is_empty() => return Ok(Vec::new()),
        _ => {
            return Err(ModelError::Parse(format!(
                "no JSON array in reply: {}",
                truncate(reply, 120)
            )))
        }
    };

    let raw: Vec<RawRegion> =
        serde_json::from_str(json).map_err(|e| ModelError::Parse(format!("{e}: {}", truncate(json, 120))))?;

    let (w, h) = (width as f32, height as f32);
    Ok(raw
        .into_iter()
        .filter_map(|r| {
            let [a, b, c, d] = r.bbox;
            let (x1, x2) = (a.min(c).clamp(0.0, w), a.max(c).clamp(0.0, w));
            let (y1, y2) = (b.min(d).clamp(0.0, h), b.max(d).clamp(0.0, h));
            if x2 <= x1 || y2 <= y1 {
                return None;
            }
            let mut det = LayoutDet::from_bbox(r.category_id, [x1, y1, x2, y2], r.score.unwrap_or(1.0));
            let text = r.text.filter(|t| !t.trim().is_empty());
            if det.category() == LayoutCategory::IsolatedFormula {
                det.latex = text;
            } else {
                det.text = text;
            }
            Some(det)
        })
        .collect())
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}…", &s[..i]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_array() {
        let reply = r#"[{"category_id": 0, "bbox": [10, 10, 200, 40], "score": 0.9, "text": "Intro"},
                        {"category_id": 3, "bbox": [10, 50, 300, 400], "text": ""}]"#;
        let dets = parse_layout_reply(reply, 600, 800).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].text.as_deref(), Some("Intro"));
        assert_eq!(dets[0].bbox(), (10.0, 10.0, 200.0, 40.0));
        assert_eq!(dets[1].text, None);
        assert_eq!(dets[1].score, 1.0);
    }

    #[test]
    fn parses_fenced_array_and_clamps() {
        let reply = "Here you go:\n```json\n[{\"category_id\": 1, \"bbox\": [500, 700, 900, 1000], \"text\": \"x\"}]\n```";
        let dets = parse_layout_reply(reply, 600, 800).unwrap();
        assert_eq!(dets[0].bbox(), (500.0, 700.0, 600.0, 800.0));
    }

    #[test]
    fn formulas_carry_latex() {
        let reply = r#"[{"category_id": 8, "bbox": [0, 0, 100, 20], "text": "E = mc^2"}]"#;
        let dets = parse_layout_reply(reply, 200, 200).unwrap();
        assert_eq!(dets[0].latex.as_deref(), Some("E = mc^2"));
        assert_eq!(dets[0].text, None);
    }

    #[test]
    fn swapped_and_degenerate_boxes() {
        let reply = r#"[{"category_id": 1, "bbox": [100, 100, 10, 10]},
                        {"category_id": 1, "bbox": [5, 5, 5, 50]}]"#;
        let dets = parse_layout_reply(reply, 200, 200).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox(), (10.0, 10.0, 100.0, 100.0));
    }

    #[test]
    fn empty_reply_means_no_regions() {
        assert!(parse_layout_reply("  ", 10, 10).unwrap().is_empty());
    }

    #[test]
    fn prose_without_array_is_a_parse_error() {
        let err = parse_layout_reply("I cannot see the page.", 10, 10).unwrap_err();
        assert!(matches!(err, ModelError::Parse(_)));
    }

    #[test]
    fn language_replies_are_normalised() {
        assert_eq!(normalize_language("en"), Some("en".into()));
        assert_eq!(normalize_language(" FR.\n"), Some("fr".into()));
        assert_eq!(normalize_language("\"zh\""), Some("zh".into()));
        assert_eq!(normalize_language("none"), None);
        assert_eq!(normalize_language(""), None);
        assert_eq!(normalize_language("English"), None);
    }

    #[test]
    fn majority_prefers_first_seen_on_ties() {
        let v = |s: &[&str]| s.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(majority(&v(&["en", "fr", "fr"])), Some("fr".into()));
        assert_eq!(majority(&v(&["de", "en"])), Some("de".into()));
        assert_eq!(majority(&[]), None);
    }

    #[test]
    fn default_options() {
        let opts = VlmOptions::default().completion();
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(4096));
    }
}
