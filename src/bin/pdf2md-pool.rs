//! CLI binary for pdf2md-pool.
//!
//! Feeds the input PDFs to one executor, at most one per worker in flight,
//! and lets the pool's gates decide what actually runs in parallel. A file is
//! read only when its turn comes.

use anyhow::{Context, Result};
use clap::Parser;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use pdf2md_pool::{
    Executor, FailureKind, HealthCheck, HealthProbe, HttpHealthCheck, PageRange, PageSeparator,
    PdfiumRasteriser, PoolConfig, ProgressCallback, RasterConfig, StaticHealth, VlmBackend,
    VlmConfig, WorkOutcome, WorkProgressCallback, WorkResult,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Largest accepted upload.
const MAX_INPUT_BYTES: u64 = 200 * 1024 * 1024;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar for the whole batch; one log line per finished document.
struct CliProgressCallback {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new(total: usize) -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} documents  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new(total as u64);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            failed: AtomicUsize::new(0),
        })
    }
}

impl WorkProgressCallback for CliProgressCallback {
    fn on_work_start(&self, worker: usize, display_name: &str) {
        self.bar.set_message(format!("worker {worker}: {display_name}"));
    }

    fn on_attempt_failed(&self, display_name: &str, attempt: u32, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {}  attempt {}  {}",
            yellow("↻"),
            display_name,
            attempt,
            dim(&msg)
        ));
    }

    fn on_work_complete(&self, display_name: &str, result: &WorkResult) {
        let secs = format!("{:.1}s", result.elapsed_ms as f64 / 1000.0);
        match result.output() {
            Some(out) => self.bar.println(format!(
                "  {} {}  {}  {}",
                green("✓"),
                display_name,
                dim(&format!("{} pages", out.units)),
                dim(&secs)
            )),
            None => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                self.bar.println(format!(
                    "  {} {}  {}  {}",
                    red("✗"),
                    display_name,
                    red(result.error().unwrap_or("failed")),
                    dim(&secs)
                ));
            }
        }
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert three files, two backend calls at a time
  pdf2md-pool a.pdf b.pdf c.pdf --backend-concurrency 2 -o out/

  # Probe the backend only
  pdf2md-pool --check-health --health-url http://gpu-box:8080

  # JSON results (one object per input)
  pdf2md-pool --json report.pdf > results.json

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Directory containing libpdfium
  RUST_LOG                Log filter, overrides -v / -q
"#;

/// Convert PDFs to Markdown through an admission-controlled worker pool.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2md-pool",
    version,
    about = "Convert PDFs to Markdown through an admission-controlled worker pool",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF files to convert.
    #[arg(required_unless_present = "check_health")]
    inputs: Vec<PathBuf>,

    /// Write `<stem>.md` files here instead of printing to stdout.
    #[arg(short, long, env = "PDF2MD_POOL_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Number of parallel workers.
    #[arg(short, long, env = "PDF2MD_POOL_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Maximum in-flight backend calls.
    #[arg(long, env = "PDF2MD_POOL_BACKEND_CONCURRENCY", default_value_t = 2)]
    backend_concurrency: usize,

    /// Retries after the first attempt.
    #[arg(long, env = "PDF2MD_POOL_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Delay between attempts in milliseconds.
    #[arg(long, env = "PDF2MD_POOL_RETRY_BACKOFF_MS", default_value_t = 2000)]
    retry_backoff_ms: u64,

    /// Longest wait for an unhealthy backend to recover, in seconds.
    #[arg(long, env = "PDF2MD_POOL_HEALTH_WAIT", default_value_t = 60)]
    health_wait: u64,

    /// Backend base URL; `/health` is appended.
    #[arg(long, env = "PDF2MD_POOL_HEALTH_URL", default_value = "http://localhost:80")]
    health_url: String,

    /// Treat the backend as always healthy (hosted APIs without /health).
    #[arg(long, env = "PDF2MD_POOL_NO_HEALTH_CHECK")]
    no_health_check: bool,

    /// LLM model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Longest rendered page edge in pixels.
    #[arg(long, env = "PDF2MD_POOL_MAX_PIXELS", default_value_t = 2000)]
    max_pixels: u32,

    /// PDF user password, applied to every input.
    #[arg(long, env = "PDF2MD_POOL_PASSWORD")]
    password: Option<String>,

    /// Page separator: none, hr, comment.
    #[arg(long, env = "PDF2MD_POOL_SEPARATOR", default_value = "none")]
    separator: String,

    /// Print results as JSON instead of Markdown.
    #[arg(long, env = "PDF2MD_POOL_JSON")]
    json: bool,

    /// Probe the backend, print the report, and exit.
    #[arg(long)]
    check_health: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2MD_POOL_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2MD_POOL_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2MD_POOL_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.check_health;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let health: Arc<dyn HealthCheck> = if cli.no_health_check {
        Arc::new(StaticHealth(true))
    } else {
        Arc::new(
            HttpHealthCheck::new(&cli.health_url, Duration::from_secs(5))
                .context("Failed to build health client")?,
        )
    };

    // ── Health-only mode ─────────────────────────────────────────────────
    if cli.check_health {
        let probe = HealthProbe::new(health, Duration::from_secs(5), Duration::from_secs(2));
        let report = probe.report().await;
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
        if report.backend != "available" {
            std::process::exit(1);
        }
        return Ok(());
    }

    // ── Validate inputs before anything is queued ────────────────────────
    for path in &cli.inputs {
        check_input(path).await?;
    }

    let progress = if show_progress {
        Some(CliProgressCallback::new(cli.inputs.len()))
    } else {
        None
    };

    let mut builder = PoolConfig::builder()
        .pool_size(cli.workers)
        .backend_concurrency(cli.backend_concurrency)
        .max_retries(cli.max_retries)
        .retry_backoff_ms(cli.retry_backoff_ms)
        .health_wait_secs(cli.health_wait);
    if let Some(ref cb) = progress {
        builder = builder.progress_callback(Arc::clone(cb) as ProgressCallback);
    }
    let config = builder.build().context("Invalid configuration")?;

    let rasteriser = PdfiumRasteriser::new(RasterConfig {
        max_rendered_pixels: cli.max_pixels,
        password: cli.password.clone(),
        pages: PageRange::default(),
    });
    let backend = VlmBackend::from_config(VlmConfig {
        model: cli.model.clone(),
        provider_name: cli.provider.clone(),
        page_separator: parse_separator(&cli.separator)?,
        ..Default::default()
    })?;

    let executor = Executor::start(config, rasteriser, backend, health)?;

    // ── One payload per worker in memory; results keep input order ───────
    let pool = &executor;
    let progress_ref = progress.as_ref();
    let results: Vec<WorkResult> = stream::iter(&cli.inputs)
        .map(|path| async move {
            let name = display_name(path);
            match tokio::fs::read(path).await {
                Ok(bytes) => pool.submit_bytes(bytes, &name).await,
                Err(e) => {
                    let result = unreadable(name, path, e);
                    if let Some(cb) = progress_ref {
                        cb.on_work_complete(&result.display_name, &result);
                    }
                    result
                }
            }
        })
        .buffered(cli.workers.max(1))
        .collect()
        .await;
    executor.shutdown().await;

    if let Some(ref cb) = progress {
        cb.bar.finish_and_clear();
    }

    // ── Emit ─────────────────────────────────────────────────────────────
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&results).context("Failed to serialise results")?
        );
    } else {
        for (path, result) in cli.inputs.iter().zip(&results) {
            let Some(out) = result.output() else { continue };
            match cli.output_dir {
                Some(ref dir) => {
                    tokio::fs::create_dir_all(dir)
                        .await
                        .with_context(|| format!("Failed to create {}", dir.display()))?;
                    let target = dir.join(markdown_name(path));
                    tokio::fs::write(&target, &out.content)
                        .await
                        .with_context(|| format!("Failed to write {}", target.display()))?;
                }
                None => {
                    let stdout = io::stdout();
                    let mut handle = stdout.lock();
                    handle
                        .write_all(out.content.as_bytes())
                        .context("Failed to write to stdout")?;
                }
            }
        }
    }

    let failed = results.iter().filter(|r| !r.is_success()).count();
    if !cli.quiet && !cli.json {
        let tokens_in: u64 = results.iter().filter_map(|r| r.output()).map(|o| o.input_tokens).sum();
        let tokens_out: u64 = results.iter().filter_map(|r| r.output()).map(|o| o.output_tokens).sum();
        eprintln!(
            "{}  {}/{} documents  {}",
            if failed == 0 { green("✔") } else { red("✘") },
            results.len() - failed,
            results.len(),
            dim(&format!("{tokens_in} tokens in / {tokens_out} tokens out")),
        );
        if !show_progress {
            for r in results.iter().filter(|r| !r.is_success()) {
                eprintln!(
                    "  {} {} after {} attempts: {}",
                    red("✗"),
                    r.display_name,
                    r.attempts,
                    r.error().unwrap_or("failed")
                );
            }
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Reject what the pool would only fail on later: wrong extension, empty
/// file, oversized upload. Looks at metadata only.
async fn check_input(path: &Path) -> Result<()> {
    let is_pdf = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    if !is_pdf {
        anyhow::bail!("{}: only .pdf files are accepted", path.display());
    }

    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Cannot read {}", path.display()))?;
    if meta.len() == 0 {
        anyhow::bail!("{}: file is empty", path.display());
    }
    if meta.len() > MAX_INPUT_BYTES {
        anyhow::bail!(
            "{}: {} bytes exceeds the {} MB limit",
            path.display(),
            meta.len(),
            MAX_INPUT_BYTES / (1024 * 1024)
        );
    }
    Ok(())
}

/// A file that passed [`check_input`] but vanished or became unreadable
/// before its turn.
fn unreadable(name: String, path: &Path, error: io::Error) -> WorkResult {
    WorkResult {
        request_id: uuid::Uuid::new_v4(),
        display_name: name,
        outcome: WorkOutcome::Failure {
            kind: FailureKind::ResourceError,
            message: format!("cannot read {}: {error}", path.display()),
        },
        attempts: 0,
        elapsed_ms: 0,
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn markdown_name(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    PathBuf::from(format!("{stem}.md"))
}

fn parse_separator(s: &str) -> Result<PageSeparator> {
    match s.to_lowercase().as_str() {
        "none" => Ok(PageSeparator::None),
        "hr" | "---" => Ok(PageSeparator::HorizontalRule),
        "comment" => Ok(PageSeparator::Comment),
        other => anyhow::bail!("Unknown separator '{other}' (expected none, hr, comment)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_input_uses_metadata_only() {
        let dir = tempfile::tempdir().unwrap();

        let ok = dir.path().join("a.pdf");
        std::fs::write(&ok, b"%PDF-1.7").unwrap();
        assert!(check_input(&ok).await.is_ok());

        // Sparse: rejected from its length without reading 200 MB.
        let huge = dir.path().join("huge.pdf");
        std::fs::File::create(&huge)
            .unwrap()
            .set_len(MAX_INPUT_BYTES + 1)
            .unwrap();
        let err = check_input(&huge).await.unwrap_err().to_string();
        assert!(err.contains("limit"), "got: {err}");

        let empty = dir.path().join("empty.pdf");
        std::fs::write(&empty, b"").unwrap();
        assert!(check_input(&empty).await.is_err());

        let text = dir.path().join("notes.txt");
        std::fs::write(&text, b"hello").unwrap();
        assert!(check_input(&text).await.is_err());
    }

    #[tokio::test]
    async fn input_removed_after_validation_is_a_resource_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();
        check_input(&path).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let e = tokio::fs::read(&path).await.unwrap_err();
        let result = unreadable(display_name(&path), &path, e);
        assert_eq!(result.display_name, "gone.pdf");
        assert_eq!(result.failure_kind(), Some(FailureKind::ResourceError));
        assert_eq!(result.attempts, 0);
        assert!(result.error().unwrap().contains("gone.pdf"));
    }
}
