//! Office → PDF conversion.
//!
//! `.doc`, `.docx`, `.ppt` and `.pptx` uploads are converted to PDF first and
//! then follow the PDF path. The converted file always lands at
//! `<out_dir>/<stem>.pdf`. Any converter failure is that file's failure.

use crate::error::FileError;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Converts an Office document into a PDF.
pub trait DocumentConverter: Send + Sync {
    /// Convert `input` into `out_dir`, returning the produced PDF path. Blocks.
    fn convert_to_pdf(&self, input: &Path, out_dir: &Path) -> Result<PathBuf, FileError>;
}

/// The PDF path a converter must produce for `input`.
pub fn derived_pdf_path(input: &Path, out_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    out_dir.join(format!("{stem}.pdf"))
}

/// Headless LibreOffice converter.
#[derive(Debug, Clone)]
pub struct SofficeConverter {
    bin: String,
    timeout: Duration,
}

impl SofficeConverter {
    pub fn new(bin: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            bin: bin.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl DocumentConverter for SofficeConverter {
    fn convert_to_pdf(&self, input: &Path, out_dir: &Path) -> Result<PathBuf, FileError> {
        let file = input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let fail = |detail: String| FileError::Conversion {
            file: file.clone(),
            detail,
        };

        // A private profile per conversion lets several soffice processes run at once.
        let profile = out_dir.join(".soffice-profile");
        let profile_arg = format!("-env:UserInstallation=file://{}", profile.display());

        // stderr goes to a file: an undrained pipe would stall a chatty converter.
        let log_path = out_dir.join(".soffice-stderr.log");
        let log = File::create(&log_path)
            .map_err(|e| fail(format!("creating {}: {e}", log_path.display())))?;

        let start = Instant::now();
        let mut child = Command::new(&self.bin)
            .arg(profile_arg)
            .args(["--headless", "--convert-to", "pdf", "--outdir"])
            .arg(out_dir)
            .arg(input)
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|e| fail(format!("could not start {}: {e}", self.bin)))?;

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if start.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(fail(format!(
                        "timed out after {}s",
                        self.timeout.as_secs()
                    )));
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(e) => return Err(fail(format!("waiting for {}: {e}", self.bin))),
            }
        };

        if !status.success() {
            let stderr = stderr_tail(&log_path);
            return Err(fail(format!("{} exited with {}: {}", self.bin, status, stderr.trim())));
        }

        let pdf = derived_pdf_path(input, out_dir);
        if !pdf.exists() {
            return Err(fail(format!("expected output {} was not produced", pdf.display())));
        }

        debug!("soffice finished in {:?}", start.elapsed());
        info!("Converted {} → {}", input.display(), pdf.display());
        Ok(pdf)
    }
}

/// Last few KiB of the converter's stderr log.
fn stderr_tail(path: &Path) -> String {
    const TAIL: usize = 2048;
    let bytes = std::fs::read(path).unwrap_or_default();
    let start = bytes.len().saturating_sub(TAIL);
    String::from_utf8_lossy(&bytes[start..]).to_string()
}
