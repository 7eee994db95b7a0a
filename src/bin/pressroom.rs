//! CLI binary for pressroom.
//!
//! A thin shim over the library crate: maps CLI flags to `SchedulerConfig`
//! and a `BuildRequest` per input, submits them all, waits, and writes the
//! PDFs.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pressroom::{
    list_templates, load_manuscript, parse_template_descriptor, Artifact, ArtifactStore, BuildError,
    BuildKind, BuildRequest, CommandRenderer, Handle, JobId, JobScheduler, SchedulerConfig,
    SchedulerObserver, TemplateSelection,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
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

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Prints scheduler events above a progress bar counting finished inputs.
struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    fn new(total: usize) -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} builds  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new(total as u64);
        bar.set_style(style);
        bar.set_prefix("Building");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl SchedulerObserver for CliObserver {
    fn on_cache_hit(&self, fingerprint: &pressroom::Fingerprint, artifact: &pressroom::ArtifactRef) {
        self.bar.println(format!(
            "  {} {}  {}",
            cyan("●"),
            fingerprint.short(),
            dim(&format!("cached → {}", artifact.short()))
        ));
    }

    fn on_joined(&self, job: &JobId, waiters: usize) {
        self.bar.println(format!(
            "  {} {}  {}",
            cyan("⇢"),
            job,
            dim(&format!("identical build in flight ({waiters} waiting)"))
        ));
    }

    fn on_started(&self, job: &JobId, attempt: u32) {
        self.bar.set_message(format!("{job} (attempt {})", attempt + 1));
    }

    fn on_retry(&self, job: &JobId, successor: &JobId, error: &str) {
        self.bar.println(format!(
            "  {} {}  {}",
            cyan("↻"),
            job,
            dim(&format!("retrying as {successor}: {}", truncate(error, 80)))
        ));
    }

    fn on_finished(&self, job: &JobId, outcome: Result<&Artifact, &BuildError>) {
        match outcome {
            Ok(artifact) => self.bar.println(format!(
                "  {} {}  {}",
                green("✓"),
                job,
                dim(&format!("{} bytes", artifact.size_bytes))
            )),
            Err(e) => self.bar.println(format!(
                "  {} {}  {}",
                red("✗"),
                job,
                red(&truncate(&e.to_string(), 80))
            )),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or_default();
    if line.chars().count() > max {
        let cut: String = line.chars().take(max - 1).collect();
        format!("{cut}\u{2026}")
    } else {
        line.to_string()
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Interior PDF from a manuscript
  pressroom --template classic book.md -o out/

  # Several manuscripts, four renders at a time
  pressroom --template classic --workers 4 ch1.md ch2.md ch3.md

  # Cover for an existing interior, 0.12 mm paper
  pressroom --kind cover --template matte --paper-thickness 0.12 out/book.pdf

  # Template switches and metadata
  pressroom --template classic -O draft=true -M title="Night Train" book.md

  # Keep artifacts between runs (identical rebuilds are served from disk)
  pressroom --template classic --artifacts .pressroom book.md

  # List templates and their options
  pressroom --list-templates --templates-dir templates/

TEMPLATE DIRECTORY LAYOUT:
  templates/layouts/<name>.tex   used by --kind convert
  templates/covers/<name>.tex    used by --kind cover
  templates/impose/<name>.tex    used by --kind impose

ENVIRONMENT VARIABLES:
  PRESSROOM_TEMPLATES      Template directory
  PRESSROOM_PANDOC         Pandoc binary (default: pandoc)
  PRESSROOM_LATEX_ENGINE   LaTeX engine (default: xelatex)
  RUST_LOG                 Log filter, overrides -v / -q
"#;

/// Build print-ready PDFs from Markdown manuscripts.
#[derive(Parser, Debug)]
#[command(
    name = "pressroom",
    version,
    about = "Build print-ready PDFs from Markdown manuscripts",
    long_about = "Build interiors, covers and imposed sheets from Markdown manuscripts with Pandoc \
and LaTeX. Identical builds render once, concurrent renders are bounded, and results are cached.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Manuscript files or HTTP/HTTPS URLs (interior PDFs for cover / impose).
    inputs: Vec<String>,

    /// What to build.
    #[arg(short, long, env = "PRESSROOM_KIND", value_enum, default_value = "convert")]
    kind: KindArg,

    /// Template name (file stem below the kind's template directory).
    #[arg(short, long, env = "PRESSROOM_TEMPLATE")]
    template: Option<String>,

    /// Template directory.
    #[arg(long, env = "PRESSROOM_TEMPLATES", default_value = "templates")]
    templates_dir: PathBuf,

    /// Directory the PDFs are written to.
    #[arg(short, long, env = "PRESSROOM_OUT_DIR", default_value = "out")]
    out_dir: PathBuf,

    /// Persistent artifact directory. In-memory when unset.
    #[arg(long, env = "PRESSROOM_ARTIFACTS")]
    artifacts: Option<PathBuf>,

    /// Template switch, `key=true|false`. Repeatable.
    #[arg(short = 'O', long = "option", value_parser = parse_option)]
    options: Vec<(String, bool)>,

    /// Metadata field, `key=value`. Repeatable.
    #[arg(short = 'M', long = "meta", value_parser = parse_meta)]
    metadata: Vec<(String, String)>,

    /// Paper thickness per sheet in millimetres (cover spine width).
    #[arg(long, env = "PRESSROOM_PAPER_THICKNESS")]
    paper_thickness: Option<f64>,

    /// Renders that may run at once. Default: CPU count.
    #[arg(short, long, env = "PRESSROOM_WORKERS")]
    workers: Option<usize>,

    /// Queued builds allowed before submissions are refused.
    #[arg(long, env = "PRESSROOM_QUEUE_LENGTH", default_value_t = 64)]
    queue_length: usize,

    /// Extra attempts after a transient render failure.
    #[arg(long, env = "PRESSROOM_MAX_RETRIES", default_value_t = 1)]
    max_retries: u32,

    /// Hard limit for one render attempt, in seconds. 0 disables it.
    #[arg(long, env = "PRESSROOM_RENDER_TIMEOUT", default_value_t = 300)]
    render_timeout: u64,

    /// Pandoc binary.
    #[arg(long, env = "PRESSROOM_PANDOC", default_value = "pandoc")]
    pandoc: String,

    /// LaTeX engine binary.
    #[arg(long, env = "PRESSROOM_LATEX_ENGINE", default_value = "xelatex")]
    latex_engine: String,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PRESSROOM_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print templates and their options, then exit.
    #[arg(long)]
    list_templates: bool,

    /// Print the parsed header of one template file, then exit.
    #[arg(long, value_name = "FILE")]
    inspect_template: Option<PathBuf>,

    /// Output structured JSON instead of a summary.
    #[arg(long, env = "PRESSROOM_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PRESSROOM_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PRESSROOM_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PRESSROOM_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Convert,
    Cover,
    Impose,
}

impl From<KindArg> for BuildKind {
    fn from(v: KindArg) -> Self {
        match v {
            KindArg::Convert => BuildKind::Convert,
            KindArg::Cover => BuildKind::CompileCover,
            KindArg::Impose => BuildKind::Impose,
        }
    }
}

fn parse_option(s: &str) -> std::result::Result<(String, bool), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=true|false, got '{s}'"))?;
    let value = match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => true,
        "false" | "no" | "off" | "0" => false,
        other => return Err(format!("'{other}' is not a boolean")),
    };
    Ok((key.trim().to_string(), value))
}

fn parse_meta(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    Ok((key.trim().to_string(), value.to_string()))
}

/// Per-input outcome for `--json`.
#[derive(Debug, Serialize)]
struct BuildReport {
    input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    handle: Option<Handle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
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

    // ── Template inspection modes ────────────────────────────────────────
    if let Some(ref path) = cli.inspect_template {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let descriptor = parse_template_descriptor(&bytes)
            .with_context(|| format!("Invalid template header in {}", path.display()))?;
        println!(
            "{}",
            serde_json::to_string_pretty(&descriptor).context("Failed to serialise descriptor")?
        );
        return Ok(());
    }

    if cli.list_templates {
        let entries = list_templates(&cli.templates_dir)
            .with_context(|| format!("Failed to list {}", cli.templates_dir.display()))?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&entries).context("Failed to serialise templates")?
            );
        } else {
            for entry in &entries {
                println!(
                    "{:<7} {:<20} {}",
                    entry.kind.to_string(),
                    bold(&entry.name),
                    entry.descriptor.description.as_deref().unwrap_or_default()
                );
                for option in &entry.descriptor.options {
                    println!(
                        "        {} {}",
                        dim(&format!("-O {}={}", option.key, option.default)),
                        option.label
                    );
                }
            }
        }
        return Ok(());
    }

    if cli.inputs.is_empty() {
        bail!("No inputs given");
    }
    let Some(ref template) = cli.template else {
        bail!("--template is required to build");
    };

    // ── Load inputs ──────────────────────────────────────────────────────
    let download_timeout = Duration::from_secs(cli.download_timeout);
    let mut manuscripts = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        let bytes = load_manuscript(input, download_timeout)
            .await
            .with_context(|| format!("Failed to load {input}"))?;
        manuscripts.push((input.clone(), bytes));
    }

    // ── Start the scheduler ──────────────────────────────────────────────
    let observer = show_progress.then(|| CliObserver::new(manuscripts.len()));
    let config = build_config(&cli, observer.clone())?;

    let store = match cli.artifacts {
        Some(ref dir) => ArtifactStore::open(dir)
            .with_context(|| format!("Failed to open artifact directory {}", dir.display()))?,
        None => ArtifactStore::in_memory(),
    };
    let renderer = CommandRenderer::builder(&cli.templates_dir)
        .pandoc(&cli.pandoc)
        .latex_engine(&cli.latex_engine)
        .build();
    let scheduler = Arc::new(
        JobScheduler::start(config, Arc::new(renderer), store).context("Failed to start scheduler")?,
    );

    // ── Submit everything, then wait ─────────────────────────────────────
    let selection = build_selection(&cli, template);
    let kind = BuildKind::from(cli.kind);
    let wait = Duration::from_secs(if cli.render_timeout == 0 {
        24 * 3600
    } else {
        (cli.render_timeout + 5) * u64::from(cli.max_retries + 1)
    });

    let builds = manuscripts.into_iter().map(|(input, bytes)| {
        let scheduler = Arc::clone(&scheduler);
        let selection = selection.clone();
        let out_dir = cli.out_dir.clone();
        let bar = observer.as_ref().map(|o| o.bar.clone());
        async move {
            let report = build_one(&scheduler, kind, input, bytes, selection, &out_dir, wait).await;
            if let Some(bar) = bar {
                bar.inc(1);
            }
            report
        }
    });
    let reports = futures::future::join_all(builds).await;

    if let Some(ref observer) = observer {
        observer.bar.finish_and_clear();
    }
    scheduler.shutdown().await;

    // ── Report ───────────────────────────────────────────────────────────
    let failed = reports.iter().filter(|r| r.error.is_some()).count();
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("Failed to serialise output")?
        );
    } else if !cli.quiet {
        for report in &reports {
            match (&report.output, &report.error) {
                (Some(path), _) => eprintln!(
                    "{} {}  →  {}",
                    green("✔"),
                    report.input,
                    bold(&path.display().to_string())
                ),
                (None, Some(e)) => eprintln!("{} {}  {}", red("✘"), report.input, red(e)),
                (None, None) => {}
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} builds failed", reports.len());
    }
    Ok(())
}

async fn build_one(
    scheduler: &JobScheduler,
    kind: BuildKind,
    input: String,
    bytes: Vec<u8>,
    selection: TemplateSelection,
    out_dir: &Path,
    wait: Duration,
) -> BuildReport {
    let mut report = BuildReport {
        input,
        handle: None,
        artifact: None,
        output: None,
        error: None,
    };
    let request = BuildRequest::new(kind, bytes, selection).with_requester("cli");

    let outcome = async {
        let handle = scheduler.submit(request)?;
        report.handle = Some(handle.clone());
        let artifact = scheduler.await_result(&handle, wait).await?;
        let pdf = scheduler.store().retrieve(&artifact.reference)?;
        report.artifact = Some(artifact);
        Ok::<_, BuildError>(pdf)
    }
    .await;

    match outcome {
        Ok(pdf) => {
            let path = out_dir.join(output_name(&report.input, kind));
            let written = std::fs::create_dir_all(out_dir).and_then(|()| std::fs::write(&path, &pdf));
            match written {
                Ok(()) => report.output = Some(path),
                Err(e) => report.error = Some(format!("Failed to write {}: {e}", path.display())),
            }
        }
        Err(e) => report.error = Some(e.to_string()),
    }
    report
}

/// `chapters/one.md` → `one.pdf`, `one-cover.pdf`, `one-imposed.pdf`.
fn output_name(input: &str, kind: BuildKind) -> String {
    let last = input
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(input);
    let stem = Path::new(last)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("build");
    match kind {
        BuildKind::Convert => format!("{stem}.pdf"),
        BuildKind::CompileCover => format!("{stem}-cover.pdf"),
        BuildKind::Impose => format!("{stem}-imposed.pdf"),
    }
}

fn build_selection(cli: &Cli, template: &str) -> TemplateSelection {
    let mut selection = match cli.kind {
        KindArg::Convert => TemplateSelection::layout(template),
        KindArg::Cover => TemplateSelection::cover(template),
        KindArg::Impose => TemplateSelection::impose(template),
    };
    selection.boolean_options = cli.options.iter().cloned().collect::<BTreeMap<_, _>>();
    selection.metadata = cli.metadata.iter().cloned().collect::<BTreeMap<_, _>>();
    selection.paper_thickness = cli.paper_thickness;
    selection
}

/// Map CLI args to `SchedulerConfig`.
fn build_config(cli: &Cli, observer: Option<Arc<CliObserver>>) -> Result<SchedulerConfig> {
    let mut builder = SchedulerConfig::builder()
        .max_queue_length(cli.queue_length)
        .max_retries(cli.max_retries)
        .render_timeout((cli.render_timeout > 0).then(|| Duration::from_secs(cli.render_timeout)));

    if let Some(workers) = cli.workers {
        builder = builder.max_concurrent_renders(workers);
    }
    if let Some(observer) = observer {
        builder = builder.observer(observer);
    }

    builder.build().context("Invalid configuration")
}
