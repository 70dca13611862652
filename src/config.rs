//! Configuration types for document serving.
//!
//! All request-processing behaviour is controlled through [`ServeConfig`],
//! built via its [`ServeConfigBuilder`]. The config is constructed once at
//! startup and shared read-only by every request.

use crate::device::Device;
use crate::error::DocServeError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub use crate::planner::BatchThresholds;

/// Configuration for the serving pipeline.
///
/// Built via [`ServeConfig::builder()`] or using [`ServeConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_docserve::{Device, ServeConfig};
///
/// let config = ServeConfig::builder()
///     .device(Device::Cuda(0))
///     .dpi(200)
///     .file_concurrency(2)
///     .output_root("/tmp/docserve")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ServeConfig {
    /// Compute device the model runs on. Default: CPU.
    pub device: Device,

    /// Accelerator memory override in GB. The `VIRTUAL_VRAM_SIZE`
    /// environment variable takes precedence when set.
    pub vram_override_gb: Option<u32>,

    /// Capacity floors for the batch tiers. Default: 8 / 10 / 16 GB.
    pub thresholds: BatchThresholds,

    /// DPI used to rasterise pages for inference. Range: 72–400. Default: 200.
    pub dpi: u32,

    /// Longest-edge cap for rendered pages, in pixels. Default: 4000.
    ///
    /// Keeps an A0 poster at 200 DPI from allocating a 16 000 px bitmap.
    pub max_rendered_pixels: u32,

    /// DPI for the low-resolution samples fed to the language pre-pass. Default: 72.
    pub sample_dpi: u32,

    /// Maximum number of pages sampled for language detection. Default: 10.
    pub lang_sample_pages: usize,

    /// Text regions whose width AND height are both below this many pixels
    /// are dropped before language detection. Default: 100.
    pub min_text_region: u32,

    /// Document language. `"auto"` (default) enables the detection pre-pass;
    /// any other value is used as-is.
    pub lang: String,

    /// Directory under which per-file workspaces are created.
    pub output_root: PathBuf,

    /// Number of files processed concurrently within one request. Default: 1.
    pub file_concurrency: usize,

    /// What to do with files whose extension is not supported. Default: skip.
    pub unsupported_policy: UnsupportedPolicy,

    /// Sub-range of pages sent to the model. Default: whole document.
    pub page_range: PageRange,

    /// LibreOffice executable used for Office → PDF conversion.
    pub soffice_bin: String,

    /// Timeout for a single Office conversion, in seconds. Default: 120.
    pub conversion_timeout_secs: u64,

    /// Optional progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            vram_override_gb: None,
            thresholds: BatchThresholds::default(),
            dpi: 200,
            max_rendered_pixels: 4000,
            sample_dpi: 72,
            lang_sample_pages: 10,
            min_text_region: 100,
            lang: "auto".to_string(),
            output_root: PathBuf::from("output"),
            file_concurrency: 1,
            unsupported_policy: UnsupportedPolicy::default(),
            page_range: PageRange::default(),
            soffice_bin: "soffice".to_string(),
            conversion_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ServeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeConfig")
            .field("device", &self.device)
            .field("vram_override_gb", &self.vram_override_gb)
            .field("thresholds", &self.thresholds)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("sample_dpi", &self.sample_dpi)
            .field("lang_sample_pages", &self.lang_sample_pages)
            .field("min_text_region", &self.min_text_region)
            .field("lang", &self.lang)
            .field("output_root", &self.output_root)
            .field("file_concurrency", &self.file_concurrency)
            .field("unsupported_policy", &self.unsupported_policy)
            .field("page_range", &self.page_range)
            .field("soffice_bin", &self.soffice_bin)
            .field("conversion_timeout_secs", &self.conversion_timeout_secs)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ProcessingProgressCallback>"),
            )
            .finish()
    }
}

impl ServeConfig {
    /// Create a new builder for `ServeConfig`.
    pub fn builder() -> ServeConfigBuilder {
        ServeConfigBuilder {
            config: Self::default(),
        }
    }

    /// `true` when the language pre-pass should run.
    pub fn detects_language(&self) -> bool {
        self.lang.eq_ignore_ascii_case("auto")
    }
}

/// Builder for [`ServeConfig`].
#[derive(Debug)]
pub struct ServeConfigBuilder {
    config: ServeConfig,
}

impl ServeConfigBuilder {
    pub fn device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    pub fn vram_override_gb(mut self, gb: Option<u32>) -> Self {
        self.config.vram_override_gb = gb;
        self
    }

    pub fn thresholds(mut self, thresholds: BatchThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn sample_dpi(mut self, dpi: u32) -> Self {
        self.config.sample_dpi = dpi.clamp(36, 400);
        self
    }

    pub fn lang_sample_pages(mut self, n: usize) -> Self {
        self.config.lang_sample_pages = n;
        self
    }

    pub fn min_text_region(mut self, px: u32) -> Self {
        self.config.min_text_region = px;
        self
    }

    pub fn lang(mut self, lang: impl Into<String>) -> Self {
        self.config.lang = lang.into();
        self
    }

    pub fn output_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_root = dir.into();
        self
    }

    pub fn file_concurrency(mut self, n: usize) -> Self {
        self.config.file_concurrency = n.max(1);
        self
    }

    pub fn unsupported_policy(mut self, policy: UnsupportedPolicy) -> Self {
        self.config.unsupported_policy = policy;
        self
    }

    pub fn page_range(mut self, range: PageRange) -> Self {
        self.config.page_range = range;
        self
    }

    pub fn soffice_bin(mut self, bin: impl Into<String>) -> Self {
        self.config.soffice_bin = bin.into();
        self
    }

    pub fn conversion_timeout_secs(mut self, secs: u64) -> Self {
        self.config.conversion_timeout_secs = secs.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServeConfig, DocServeError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(DocServeError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.file_concurrency == 0 {
            return Err(DocServeError::InvalidConfig(
                "File concurrency must be ≥ 1".into(),
            ));
        }
        if !c.thresholds.is_monotonic() {
            return Err(DocServeError::InvalidConfig(format!(
                "Batch thresholds must be strictly increasing, got {}/{}/{} GB",
                c.thresholds.min_gb, c.thresholds.mid_gb, c.thresholds.high_gb
            )));
        }
        if c.lang.trim().is_empty() {
            return Err(DocServeError::InvalidConfig(
                "Language must be \"auto\" or a language code".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Policy for uploaded files whose extension is not recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedPolicy {
    /// Leave the file out of both the results and the failures. (default)
    #[default]
    Skip,
    /// Report the file in the failures list.
    Fail,
}

/// Inclusive, 0-based sub-range of pages sent to the model.
///
/// Pages outside the range still appear in the output as zeroed
/// placeholders, so downstream consumers always see the full page count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    /// `None` or a negative value means "through the last page".
    pub end: Option<i64>,
}

impl PageRange {
    pub fn new(start: usize, end: Option<i64>) -> Self {
        Self { start, end }
    }

    /// The whole document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Resolve against a page count.
    ///
    /// Returns `None` when nothing is to be inferred: an empty document, or
    /// `start > end` after resolution.
    pub fn resolve(&self, page_count: usize) -> Option<(usize, usize)> {
        if page_count == 0 {
            return None;
        }
        let last = page_count - 1;
        let end = match self.end {
            Some(e) if e >= 0 => (e as usize).min(last),
            _ => last,
        };
        if self.start > end {
            None
        } else {
            Some((self.start, end))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_lists_every_setting() {
        let config = ServeConfig::builder()
            .soffice_bin("/opt/lo/soffice")
            .build()
            .unwrap();
        let out = format!("{config:?}");
        for field in ["soffice_bin", "conversion_timeout_secs: 120", "page_range", "progress_callback: None"] {
            assert!(out.contains(field), "{field} missing from {out}");
        }
    }

    #[test]
    fn defaults_build() {
        let c = ServeConfig::builder().build().unwrap();
        assert_eq!(c.dpi, 200);
        assert_eq!(c.file_concurrency, 1);
        assert_eq!(c.unsupported_policy, UnsupportedPolicy::Skip);
        assert!(c.detects_language());
    }

    #[test]
    fn setters_clamp() {
        let c = ServeConfig::builder()
            .dpi(1000)
            .file_concurrency(0)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 400);
        assert_eq!(c.file_concurrency, 1);
    }

    #[test]
    fn non_monotonic_thresholds_rejected() {
        let err = ServeConfig::builder()
            .thresholds(BatchThresholds {
                min_gb: 10,
                mid_gb: 8,
                high_gb: 16,
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn explicit_lang_disables_detection() {
        let c = ServeConfig::builder().lang("en").build().unwrap();
        assert!(!c.detects_language());
    }

    #[test]
    fn page_range_defaults_to_whole_document() {
        assert_eq!(PageRange::all().resolve(10), Some((0, 9)));
        assert_eq!(PageRange::new(0, Some(-1)).resolve(10), Some((0, 9)));
        assert_eq!(PageRange::new(0, Some(9)).resolve(10), Some((0, 9)));
    }

    #[test]
    fn page_range_edge_cases() {
        assert_eq!(PageRange::all().resolve(0), None);
        assert_eq!(PageRange::new(5, Some(2)).resolve(10), None);
        assert_eq!(PageRange::new(12, None).resolve(10), None);
        assert_eq!(PageRange::new(2, Some(50)).resolve(10), Some((2, 9)));
        assert_eq!(PageRange::new(3, Some(3)).resolve(10), Some((3, 3)));
    }
}
