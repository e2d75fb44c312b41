//! CLI binary for img-rehost.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `RehostConfig` and prints results.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use img_rehost::pipeline::extract::parse_url_list;
use img_rehost::pipeline::mapping::URL_LIST_FILE;
use img_rehost::{
    download_urls, extract_source, load_mapping, reconcile_state, replace_source, restore_source,
    run, upload_artifacts, DocumentReport, InMemoryStore, MappingStage, MappingStore,
    ProgressCallback, RehostConfig, RehostProgressCallback, RunReport, Stage, UploadMode,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
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

/// Terminal progress callback: one bar per network stage, with a log line per
/// item. Items complete out of order, so lines carry the URL or file name.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Scanning");
        bar.set_message("Looking for image URLs…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, stage: Stage, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.set_style(style);
        self.bar.set_prefix(match stage {
            Stage::Fetch => "Downloading",
            Stage::Upload => "Uploading",
            _ => "Working",
        });
        self.bar.reset_eta();
    }
}

impl Drop for CliProgressCallback {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}

/// Shorten long URLs and messages to keep lines on one row.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

impl RehostProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage, total: usize) {
        self.activate_bar(stage, total);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{stage}: {total} item(s)…"))
        ));
    }

    fn on_item_complete(&self, _stage: Stage, item: &str) {
        self.bar
            .println(format!("  {} {}", green("✓"), dim(&truncate(item, 90))));
        self.bar.inc(1);
    }

    fn on_item_error(&self, _stage: Stage, item: &str, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {}  {}",
            red("✗"),
            truncate(item, 60),
            red(&truncate(error, 80)),
        ));
        self.bar.inc(1);
    }

    fn on_stage_complete(&self, stage: Stage, total: usize, success_count: usize) {
        let failed = total.saturating_sub(success_count);
        let mark = if failed == 0 {
            green("✔")
        } else if failed == total {
            red("✘")
        } else {
            cyan("⚠")
        };
        self.bar.println(format!(
            "{mark} {stage}: {}/{total} ok{}",
            bold(&success_count.to_string()),
            if failed > 0 {
                format!("  ({} failed)", red(&failed.to_string()))
            } else {
                String::new()
            }
        ));
        if stage == Stage::Upload {
            self.bar.finish_and_clear();
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Rehost every image in an article (writes article.md.backup)
  img-rehost run article.md

  # A whole directory of documents, into a separate output tree
  img-rehost run docs/ --output rehosted/

  # Try it without touching WeChat (state and output under ./dry-run/)
  img-rehost run article.md --dry-run --report json > report.json

  # Stage by stage
  img-rehost extract article.md
  img-rehost download
  img-rehost upload
  img-rehost replace article.md

  # Apply a hand-edited mapping
  img-rehost replace article.md --mapping my_mapping.json

  # Undo a rewrite
  img-rehost restore article.md

STATE FILES (in --state-dir):
  extracted_urls.txt      URLs found by `extract`
  download_mapping.json   original URL → local file
  upload_mapping.json     local file → remote URL
  url_mapping.json        original URL → remote URL

ENVIRONMENT VARIABLES:
  WECHAT_APPID            WeChat Official Account app id
  WECHAT_SECRET           WeChat Official Account app secret
  IMG_REHOST_WORKERS      Concurrent transfers
  IMG_REHOST_STATE_DIR    Where mapping files are kept
  IMG_REHOST_DOWNLOAD_DIR Where downloaded images are kept
  IMG_REHOST_RUN_TIMEOUT  Seconds before a run stops starting new transfers
  RUST_LOG                Override the log filter
"#;

/// Move hot-linked images onto your own media store and rewrite documents.
#[derive(Parser, Debug)]
#[command(
    name = "img-rehost",
    version,
    about = "Rehost images referenced by Markdown, HTML and text documents",
    long_about = "Find image URLs in documents, download them, upload them to a WeChat \
Official Account media library and rewrite every reference to the new URL. Each document \
is backed up before it is rewritten.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage: extract, download, upload, map, rewrite.
    Run {
        /// Document or directory of documents.
        source: PathBuf,
    },
    /// List the image URLs found in a document or directory.
    Extract {
        source: PathBuf,
    },
    /// Download the URLs in a list file (default: the last `extract` output).
    Download {
        #[arg(long)]
        urls: Option<PathBuf>,
    },
    /// Upload every downloaded image and rebuild the final mapping.
    Upload,
    /// Rewrite documents with a mapping (default: the last final mapping).
    Replace {
        source: PathBuf,
        #[arg(long)]
        mapping: Option<PathBuf>,
    },
    /// Restore documents from their `.backup` copies.
    Restore {
        source: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// WeChat app id.
    #[arg(long, global = true, env = "WECHAT_APPID", hide_env_values = true)]
    appid: Option<String>,

    /// WeChat app secret.
    #[arg(long, global = true, env = "WECHAT_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Upload as temporary media (expires after three days).
    #[arg(long, global = true, env = "IMG_REHOST_TEMPORARY")]
    temporary: bool,

    /// Do not write `.backup` copies before rewriting.
    #[arg(long, global = true, env = "IMG_REHOST_NO_BACKUP")]
    no_backup: bool,

    /// Ignore saved state and redo every download and upload.
    #[arg(long, global = true, env = "IMG_REHOST_NO_RESUME")]
    no_resume: bool,

    /// Concurrent downloads / uploads.
    #[arg(short, long, global = true, env = "IMG_REHOST_WORKERS", default_value_t = 5)]
    workers: usize,

    /// Attempts per download / upload.
    #[arg(long, global = true, env = "IMG_REHOST_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Write rewritten documents here instead of in place.
    #[arg(short, long, global = true, env = "IMG_REHOST_OUTPUT")]
    output: Option<PathBuf>,

    /// Directory holding the URL list and mapping files.
    #[arg(long, global = true, env = "IMG_REHOST_STATE_DIR", default_value = ".")]
    state_dir: PathBuf,

    /// Directory receiving downloaded images.
    #[arg(long, global = true, env = "IMG_REHOST_DOWNLOAD_DIR", default_value = "downloads")]
    download_dir: PathBuf,

    /// Per-download timeout in seconds.
    #[arg(long, global = true, env = "IMG_REHOST_FETCH_TIMEOUT", default_value_t = 30)]
    fetch_timeout: u64,

    /// Per-upload timeout in seconds.
    #[arg(long, global = true, env = "IMG_REHOST_UPLOAD_TIMEOUT", default_value_t = 60)]
    upload_timeout: u64,

    /// Stop starting new downloads and uploads after this many seconds.
    #[arg(long, global = true, env = "IMG_REHOST_RUN_TIMEOUT")]
    run_timeout: Option<u64>,

    /// Upload to an in-memory store instead of WeChat. State goes to
    /// `<state-dir>/dry-run`, and documents are written there unless
    /// `--output` is given.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print the run report to stdout in this format.
    #[arg(long, global = true, value_enum)]
    report: Option<ReportFormat>,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true, env = "IMG_REHOST_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Disable the progress bar.
    #[arg(long, global = true, env = "IMG_REHOST_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "IMG_REHOST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "IMG_REHOST_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ReportFormat {
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let args = &cli.common;

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !args.quiet
        && !args.no_progress
        && args.report.is_none()
        && matches!(cli.command, Command::Run { .. } | Command::Download { .. } | Command::Upload);
    let filter = if args.verbose {
        "debug"
    } else if args.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if let Some(ref path) = args.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn RehostProgressCallback>)
    } else {
        None
    };
    let source = match cli.command {
        Command::Run { ref source } | Command::Replace { ref source, .. } => Some(source.as_path()),
        _ => None,
    };
    let config = build_config(args, source, progress_cb)?;

    match cli.command {
        Command::Run { ref source } => cmd_run(source, &config, args).await,
        Command::Extract { ref source } => cmd_extract(source, &config, args).await,
        Command::Download { ref urls } => cmd_download(urls.as_deref(), &config, args).await,
        Command::Upload => cmd_upload(&config, args).await,
        Command::Replace {
            ref source,
            ref mapping,
        } => cmd_replace(source, mapping.as_deref(), &config, args).await,
        Command::Restore { ref source } => {
            let restored = restore_source(source, &config)
                .await
                .context("Restore failed")?;
            if !args.quiet {
                for p in &restored {
                    eprintln!("{} restored {}", green("✔"), bold(&p.display().to_string()));
                }
                if restored.is_empty() {
                    eprintln!("{} no backups found", cyan("⚠"));
                }
            }
            Ok(())
        }
    }
}

async fn cmd_run(source: &Path, config: &RehostConfig, args: &CommonArgs) -> Result<()> {
    let output = run(source, config).await.context("Rehost run failed")?;
    let report = &output.report;

    if args.report == Some(ReportFormat::Json) {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("Failed to serialise report")?
        );
    } else if !args.quiet {
        print_summary(report);
    }

    if report.found > 0 && report.mapped == 0 {
        bail!("None of the {} image URL(s) could be rehosted", report.found);
    }
    Ok(())
}

async fn cmd_extract(source: &Path, config: &RehostConfig, args: &CommonArgs) -> Result<()> {
    let extraction = extract_source(source, config)
        .await
        .context("Extraction failed")?;

    if args.report == Some(ReportFormat::Json) {
        let urls: Vec<&str> = extraction
            .records
            .iter()
            .map(|r| r.original_url.as_str())
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&urls).context("Failed to serialise URL list")?
        );
    } else {
        for r in &extraction.records {
            println!("{}", r.original_url);
        }
    }
    if !args.quiet {
        eprintln!(
            "{} {} URL(s) in {} document(s)",
            green("✔"),
            bold(&extraction.records.len().to_string()),
            extraction.documents.len()
        );
        for f in &extraction.failures {
            eprintln!("  {} {}  {}", red("✗"), f.url, dim(&f.detail));
        }
    }
    Ok(())
}

async fn cmd_download(urls: Option<&Path>, config: &RehostConfig, args: &CommonArgs) -> Result<()> {
    let list_path = urls
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.state_dir.join(URL_LIST_FILE));
    let text = tokio::fs::read_to_string(&list_path)
        .await
        .with_context(|| {
            format!(
                "Failed to read URL list {} (run `img-rehost extract` first)",
                list_path.display()
            )
        })?;
    let records = parse_url_list(&text);

    let downloaded = download_urls(&records, config)
        .await
        .context("Download failed")?;
    let ok = downloaded.results.iter().filter(|r| r.is_ok()).count();

    if args.report == Some(ReportFormat::Json) {
        println!(
            "{}",
            serde_json::to_string_pretty(&downloaded.results)
                .context("Failed to serialise results")?
        );
    } else if !args.quiet {
        eprintln!(
            "{} {}/{} downloaded into {}",
            if ok == records.len() { green("✔") } else { cyan("⚠") },
            bold(&ok.to_string()),
            records.len(),
            config.download_dir.display()
        );
    }
    Ok(())
}

async fn cmd_upload(config: &RehostConfig, args: &CommonArgs) -> Result<()> {
    let local = MappingStore::new(&config.state_dir)
        .load(MappingStage::Local)
        .await
        .context("Failed to load download mapping")?;
    let mut paths: Vec<PathBuf> = Vec::new();
    for (_, p) in local.iter() {
        let p = PathBuf::from(p);
        if !paths.contains(&p) {
            paths.push(p);
        }
    }
    if paths.is_empty() {
        bail!("Nothing to upload (run `img-rehost download` first)");
    }

    let uploaded = upload_artifacts(&paths, config)
        .await
        .context("Upload failed")?;
    let reconciled = reconcile_state(config)
        .await
        .context("Failed to rebuild URL mapping")?;
    let ok = uploaded.results.iter().filter(|r| r.is_ok()).count();

    if args.report == Some(ReportFormat::Json) {
        println!(
            "{}",
            serde_json::to_string_pretty(&uploaded.results)
                .context("Failed to serialise results")?
        );
    } else if !args.quiet {
        eprintln!(
            "{} {}/{} uploaded, {} URL(s) mapped",
            if ok == paths.len() { green("✔") } else { cyan("⚠") },
            bold(&ok.to_string()),
            paths.len(),
            reconciled.mapping.len()
        );
        for u in &reconciled.unmapped {
            eprintln!("  {} {}  {}", red("✗"), u.url, dim(&u.reason));
        }
    }
    Ok(())
}

async fn cmd_replace(
    source: &Path,
    mapping: Option<&Path>,
    config: &RehostConfig,
    args: &CommonArgs,
) -> Result<()> {
    let mapping_path = mapping
        .map(Path::to_path_buf)
        .unwrap_or_else(|| MappingStore::new(&config.state_dir).path(MappingStage::Final));
    let map = load_mapping(&mapping_path)
        .await
        .with_context(|| format!("Failed to load mapping {}", mapping_path.display()))?;

    let reports = replace_source(source, &map, config)
        .await
        .context("Replace failed")?;

    if args.report == Some(ReportFormat::Json) {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("Failed to serialise report")?
        );
    } else if !args.quiet {
        for d in &reports {
            print_document(d);
        }
    }
    Ok(())
}

fn print_document(d: &DocumentReport) {
    let target = d.output_path.as_ref().unwrap_or(&d.path);
    eprintln!(
        "  {} {}  {} replacement(s){}",
        if d.unresolved.is_empty() {
            green("✓")
        } else {
            cyan("⚠")
        },
        bold(&target.display().to_string()),
        d.replacements,
        if d.unresolved.is_empty() {
            String::new()
        } else {
            dim(&format!("  {} unresolved", d.unresolved.len()))
        }
    );
    if let Some(ref b) = d.backup_path {
        eprintln!("    {}", dim(&format!("backup: {}", b.display())));
    }
}

fn print_summary(report: &RunReport) {
    for d in &report.documents {
        print_document(d);
    }
    if !report.failures.is_empty() {
        eprintln!("{}", bold("Failures:"));
        for f in &report.failures {
            eprintln!(
                "  {} {:<7} {:<20} {}  {}",
                red("✗"),
                f.stage.to_string(),
                f.error_kind.to_string(),
                truncate(&f.url, 60),
                dim(&truncate(&f.detail, 60))
            );
        }
    }
    eprintln!(
        "{}  {} found  /  {} fetched  /  {} uploaded  /  {} replaced  —  {}ms",
        if report.is_complete() {
            green("✔")
        } else if report.mapped == 0 && report.found > 0 {
            red("✘")
        } else {
            cyan("⚠")
        },
        bold(&report.found.to_string()),
        report.fetched,
        report.uploaded,
        report.replaced,
        report.duration_ms,
    );
}

/// Where a dry run writes rewritten documents when `--output` is not given.
fn dry_run_output(dry_run_dir: &Path, source: &Path) -> PathBuf {
    let out = dry_run_dir.join("output");
    match source.file_name() {
        Some(name) if !source.is_dir() => out.join(name),
        _ => out,
    }
}

/// Map CLI args to `RehostConfig`.
///
/// `--dry-run` keeps its state apart from real runs and never rewrites the
/// source documents in place.
fn build_config(
    args: &CommonArgs,
    source: Option<&Path>,
    progress: Option<ProgressCallback>,
) -> Result<RehostConfig> {
    let state_dir = if args.dry_run {
        args.state_dir.join("dry-run")
    } else {
        args.state_dir.clone()
    };
    let mut builder = RehostConfig::builder()
        .concurrency(args.workers)
        .max_attempts(args.max_attempts)
        .fetch_timeout_secs(args.fetch_timeout)
        .upload_timeout_secs(args.upload_timeout)
        .download_dir(&args.download_dir)
        .state_dir(&state_dir)
        .upload_mode(if args.temporary {
            UploadMode::Temporary
        } else {
            UploadMode::Permanent
        })
        .backup(!args.no_backup)
        .resume(!args.no_resume);

    if let Some(t) = args.run_timeout {
        builder = builder.run_timeout_secs(t);
    }
    match (&args.output, source) {
        (Some(out), _) => builder = builder.output(out),
        (None, Some(src)) if args.dry_run => {
            builder = builder.output(dry_run_output(&state_dir, src)).backup(false);
        }
        _ => {}
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    if args.dry_run {
        builder = builder.store(Arc::new(InMemoryStore::new()));
    } else {
        // Only stages that talk to the store need credentials.
        if let (Some(id), Some(secret)) = (&args.appid, &args.secret) {
            builder = builder.credentials(id, secret);
        }
    }

    builder.build().context("Invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_timeout_flag_reaches_config() {
        let cli = Cli::try_parse_from(["img-rehost", "run", "a.md", "--run-timeout", "90"]).unwrap();
        let config = build_config(&cli.common, None, None).unwrap();
        assert_eq!(config.run_timeout_secs, Some(90));
    }

    #[test]
    fn dry_run_uses_its_own_state_and_output() {
        let cli = Cli::try_parse_from(["img-rehost", "run", "post.md", "--dry-run", "--state-dir", "st"])
            .unwrap();
        let config = build_config(&cli.common, Some(Path::new("post.md")), None).unwrap();
        assert_eq!(config.state_dir, Path::new("st/dry-run"));
        assert_eq!(config.output.as_deref(), Some(Path::new("st/dry-run/output/post.md")));
        assert!(!config.backup);
    }
}
