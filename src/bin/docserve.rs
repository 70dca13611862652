//! CLI binary for edgequake-docserve.
//!
//! A thin shim over the library crate: maps flags to `ServeConfig`, checks
//! the startup preconditions, then serves, parses locally, submits to a
//! running server, or probes the device.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_docserve::client::{self, SubmitResult};
use edgequake_docserve::device::{DeviceCapability, ResourceProbe};
use edgequake_docserve::model::vlm::{self, VlmLanguageDetector, VlmLayoutModel};
use edgequake_docserve::pipeline::{input, render};
use edgequake_docserve::server::{self, ParsingResponse};
use edgequake_docserve::{
    planner, Device, DocServeError, LanguageDetector, Orchestrator, PageModel, PageRange,
    ProcessingProgressCallback, ProgressCallback, ServeConfig, UnsupportedPolicy,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress bar over the files of one `parse` run.
struct CliProgressCallback {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} files  \
                 ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        bar.set_prefix("Parsing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            failed: AtomicUsize::new(0),
        })
    }
}

impl ProcessingProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_files} files…"))
        ));
    }

    fn on_file_start(&self, file_name: &str) {
        self.bar.set_message(file_name.to_string());
    }

    fn on_file_complete(&self, file_name: &str, artifact_count: usize) {
        self.bar.println(format!(
            "  {} {:<40}  {}",
            green("✓"),
            file_name,
            dim(&format!("{artifact_count} artifacts")),
        ));
        self.bar.inc(1);
    }

    fn on_file_error(&self, file_name: &str, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} {:<40}  {}", red("✗"), file_name, red(&msg)));
        self.bar.inc(1);
    }

    fn on_file_skipped(&self, file_name: &str) {
        self.bar
            .println(format!("  {} {:<40}  {}", dim("–"), file_name, dim("unsupported, skipped")));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize, skipped: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} parsed, {} failed, {} skipped",
            if failed == 0 { green("✔") } else { cyan("⚠") },
            bold(&succeeded.to_string()),
            if failed == 0 {
                failed.to_string()
            } else {
                red(&failed.to_string())
            },
            skipped,
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve on the default address
  docserve serve

  # Serve on a GPU with a memory override and two files in parallel
  VIRTUAL_VRAM_SIZE=16 docserve serve --device cuda:0 --file-concurrency 2

  # Parse local files without a server
  docserve parse report.pdf slides.pptx --output-root out/

  # Upload files to a running server, four at a time
  docserve submit *.pdf --url http://127.0.0.1:8000/parsing

  # Show the batch plan this machine would use
  docserve probe --device cuda

ENVIRONMENT VARIABLES:
  VIRTUAL_VRAM_SIZE       Accelerator memory in GB, overrides the device query
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to a specific libpdfium
  RUST_LOG                Log filter, overrides --verbose / --quiet
"#;

/// Serve PDF and Office documents through page-batched layout inference.
#[derive(Parser, Debug)]
#[command(
    name = "docserve",
    version,
    about = "Serve PDF and Office documents through page-batched layout inference",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCSERVE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCSERVE_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (POST /parsing, GET /health).
    Serve {
        /// Address to bind.
        #[arg(long, env = "DOCSERVE_ADDR", default_value = "127.0.0.1:8000")]
        addr: String,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Parse local files or URLs without a server.
    Parse {
        /// Local files or HTTP/HTTPS URLs.
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Print the response body as JSON on stdout.
        #[arg(long, env = "DOCSERVE_JSON")]
        json: bool,

        /// Disable the progress bar.
        #[arg(long, env = "DOCSERVE_NO_PROGRESS")]
        no_progress: bool,

        /// HTTP download timeout in seconds for URL inputs.
        #[arg(long, env = "DOCSERVE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
        download_timeout: u64,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Upload files to a running server, one request per file.
    Submit {
        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Parsing endpoint of the server.
        #[arg(long, env = "DOCSERVE_URL", default_value = "http://127.0.0.1:8000/parsing")]
        url: String,

        /// Concurrent uploads. Default: number of files, at most 4.
        #[arg(short, long, env = "DOCSERVE_WORKERS")]
        workers: Option<usize>,

        /// Per-request timeout in seconds.
        #[arg(long, env = "DOCSERVE_REQUEST_TIMEOUT", default_value_t = 3600)]
        timeout: u64,
    },

    /// Print the device, its memory capacity and the resulting batch plan.
    Probe {
        /// Compute device: cpu, cuda, cuda:N, npu, npu:N.
        #[arg(long, env = "DOCSERVE_DEVICE", default_value = "cpu")]
        device: Device,

        /// Accelerator memory override in GB (VIRTUAL_VRAM_SIZE wins).
        #[arg(long, env = "DOCSERVE_VRAM_GB")]
        vram_gb: Option<u32>,
    },
}

/// Flags shared by `serve` and `parse`.
#[derive(Args, Debug)]
struct EngineArgs {
    /// Compute device: cpu, cuda, cuda:N, npu, npu:N.
    #[arg(long, env = "DOCSERVE_DEVICE", default_value = "cpu")]
    device: Device,

    /// Accelerator memory override in GB (VIRTUAL_VRAM_SIZE wins).
    #[arg(long, env = "DOCSERVE_VRAM_GB")]
    vram_gb: Option<u32>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "DOCSERVE_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Document language, or "auto" to detect it from page samples.
    #[arg(long, env = "DOCSERVE_LANG", default_value = "auto")]
    lang: String,

    /// Directory under which per-file workspaces are created.
    #[arg(long, env = "DOCSERVE_OUTPUT_ROOT", default_value = "output")]
    output_root: PathBuf,

    /// Files processed concurrently within one request.
    #[arg(long, env = "DOCSERVE_FILE_CONCURRENCY", default_value_t = 1)]
    file_concurrency: usize,

    /// Report unsupported file types as failures instead of skipping them.
    #[arg(long, env = "DOCSERVE_FAIL_UNSUPPORTED")]
    fail_unsupported: bool,

    /// First page (0-based) sent to the model.
    #[arg(long, env = "DOCSERVE_START_PAGE", default_value_t = 0)]
    start_page: usize,

    /// Last page (0-based, inclusive) sent to the model; negative = last page.
    #[arg(long, env = "DOCSERVE_END_PAGE", allow_hyphen_values = true)]
    end_page: Option<i64>,

    /// LibreOffice executable for Office → PDF conversion.
    #[arg(long, env = "DOCSERVE_SOFFICE", default_value = "soffice")]
    soffice: String,

    /// Timeout for one Office conversion, in seconds.
    #[arg(long, env = "DOCSERVE_CONVERSION_TIMEOUT", default_value_t = 120)]
    conversion_timeout: u64,

    /// LLM model ID for the layout model (e.g. gpt-4.1-nano, gpt-4.1).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,
}

impl EngineArgs {
    fn config(&self, progress: Option<ProgressCallback>) -> Result<ServeConfig> {
        let mut builder = ServeConfig::builder()
            .device(self.device)
            .vram_override_gb(self.vram_gb)
            .dpi(self.dpi)
            .lang(self.lang.clone())
            .output_root(self.output_root.clone())
            .file_concurrency(self.file_concurrency)
            .unsupported_policy(if self.fail_unsupported {
                UnsupportedPolicy::Fail
            } else {
                UnsupportedPolicy::Skip
            })
            .page_range(PageRange::new(self.start_page, self.end_page))
            .soffice_bin(self.soffice.clone())
            .conversion_timeout_secs(self.conversion_timeout);
        if let Some(cb) = progress {
            builder = builder.progress_callback(cb);
        }
        builder.build().context("Invalid configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // With the progress bar active, library INFO logs would interleave
    // with it; the bar carries the per-file feedback instead.
    let show_progress = matches!(
        &cli.command,
        Command::Parse { json: false, no_progress: false, .. }
    ) && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info,tower_http=debug"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Serve { addr, engine } => {
            let config = engine.config(None)?;
            let orchestrator = startup(config, &engine).await?;
            server::serve(&addr, orchestrator)
                .await
                .context("Server failed")?;
        }

        Command::Parse {
            inputs,
            json,
            download_timeout,
            engine,
            ..
        } => {
            let progress: Option<ProgressCallback> = if show_progress {
                Some(CliProgressCallback::new() as Arc<dyn ProcessingProgressCallback>)
            } else {
                None
            };
            let config = engine.config(progress)?;
            let orchestrator = startup(config, &engine).await?;

            let mut uploads = Vec::with_capacity(inputs.len());
            for item in &inputs {
                let upload = input::resolve_input(item, download_timeout)
                    .await
                    .with_context(|| format!("Failed to read input '{item}'"))?;
                uploads.push(upload);
            }

            let outcome = orchestrator.process_batch(uploads).await;
            let engine_handle = Arc::clone(orchestrator.engine());
            tokio::task::spawn_blocking(move || engine_handle.reclaim())
                .await
                .context("Reclaim failed")?;

            let response = ParsingResponse::from(outcome);
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&response).context("Failed to serialise response")?
                );
            } else if !cli.quiet && !show_progress {
                print_response(&response);
            }
            if !response.fails.is_empty() {
                std::process::exit(2);
            }
        }

        Command::Submit {
            files,
            url,
            workers,
            timeout,
        } => {
            let http = client::http_client(timeout).context("Failed to build HTTP client")?;
            let results = client::submit_files(&http, &url, files, workers).await;
            let failed = print_submit_results(&results, cli.quiet);
            if failed > 0 {
                std::process::exit(2);
            }
        }

        Command::Probe { device, vram_gb } => {
            let probe = ResourceProbe::from_env(DeviceCapability::resolve(device), vram_gb);
            let capacity = tokio::task::block_in_place(|| probe.capacity());
            let thresholds = ServeConfig::default().thresholds;
            let plan = planner::plan(capacity, probe.capability().has_accelerator, &thresholds);
            println!("Device:       {}", device);
            println!("Accelerator:  {}", probe.capability().has_accelerator);
            println!("Capacity:     {} GB", capacity);
            println!("Batch:        {}", plan.eligible);
            println!("Batch ratio:  {}", plan.ratio);
        }
    }

    Ok(())
}

/// Check the startup preconditions and wire the orchestrator.
///
/// pdfium must bind, the model provider must be configured and the output
/// root must be creatable; any failure aborts before a request is accepted.
async fn startup(config: ServeConfig, engine: &EngineArgs) -> Result<Arc<Orchestrator>> {
    tokio::task::spawn_blocking(render::check_pdfium)
        .await
        .context("pdfium check panicked")??;

    let (provider, label) = vlm::resolve_provider(engine.provider.as_deref(), engine.model.as_deref())?;

    tokio::fs::create_dir_all(&config.output_root)
        .await
        .map_err(|source| DocServeError::OutputRoot {
            path: config.output_root.clone(),
            source,
        })?;

    let runtime = tokio::runtime::Handle::current();
    let model: Arc<dyn PageModel> = Arc::new(VlmLayoutModel::new(
        Arc::clone(&provider),
        label,
        runtime.clone(),
    ));
    let detector: Arc<dyn LanguageDetector> = Arc::new(VlmLanguageDetector::new(provider, runtime));

    // The resource probe may shell out to nvidia-smi.
    let orchestrator =
        tokio::task::block_in_place(|| Orchestrator::standard(config, model, Some(detector)));
    Ok(Arc::new(orchestrator))
}

fn print_response(response: &ParsingResponse) {
    for (name, artifacts) in &response.data {
        eprintln!(
            "{} {}  {}",
            green("✓"),
            bold(name),
            dim(&format!(
                "{} files, {} images",
                artifacts.files.len(),
                artifacts.images.len()
            ))
        );
        for f in &artifacts.files {
            eprintln!("    {}", dim(&f.display().to_string()));
        }
    }
    for name in &response.fails {
        let reason = response.errors.get(name).map(String::as_str).unwrap_or("");
        eprintln!("{} {}  {}", red("✗"), bold(name), red(reason));
    }
}

/// Print one line per uploaded file; returns the number of failures.
fn print_submit_results(results: &[SubmitResult], quiet: bool) -> usize {
    let mut failed = 0;
    for r in results {
        match &r.outcome {
            Ok(resp) => {
                failed += resp.fails.len();
                if !quiet {
                    let status = if resp.fails.is_empty() {
                        green("✓")
                    } else {
                        red("✗")
                    };
                    eprintln!(
                        "{} {}  {}",
                        status,
                        r.path.display(),
                        dim(&format!("{} parsed, {} failed", resp.data.len(), resp.fails.len()))
                    );
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("{} {}  {}", red("✗"), r.path.display(), red(&e.to_string()));
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn provider_flag_reads_the_documented_env_var() {
        let cli = Cli::command();
        for sub in ["serve", "parse"] {
            let env = cli
                .find_subcommand(sub)
                .and_then(|c| c.get_arguments().find(|a| a.get_id() == "provider"))
                .and_then(|a| a.get_env())
                .map(|e| e.to_string_lossy().to_string());
            assert_eq!(env.as_deref(), Some("EDGEQUAKE_LLM_PROVIDER"), "{sub}");
        }
        assert!(AFTER_HELP.contains("EDGEQUAKE_LLM_PROVIDER"));
    }
}
