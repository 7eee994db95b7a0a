//! Pandoc / LaTeX renderer.
//!
//! Drives the external toolchain for the three build kinds:
//!
//! | Kind | Input written to the work dir | Command |
//! |------|-------------------------------|---------|
//! | Convert | `manuscript.md` | `pandoc manuscript.md -o interior.pdf --pdf-engine=<engine> --template=<layout>` |
//! | CompileCover | `interior.pdf`, filled `cover.tex` | `<engine> -interaction=nonstopmode -halt-on-error cover.tex` |
//! | Impose | `interior.pdf`, filled `impose.tex` | `<engine> -interaction=nonstopmode -halt-on-error impose.tex` |
//!
//! ## Failure classification
//!
//! Tool output goes to a log file in the work dir (a pipe could fill up
//! while the child is polled). When a tool fails, the log is matched against
//! known resource-exhaustion messages; those are `Transient`, anything else
//! (LaTeX errors, missing files, bad templates) is `Permanent`. A child that
//! dies from a signal is `Transient`.
//!
//! ## Cancellation
//!
//! The child is polled every `poll_interval`. A raised cancel flag kills it
//! and yields `Canceled`; a passed deadline kills it and yields a
//! `Transient` timeout.

use super::templates::{fill_template, load_template, LoadedTemplate};
use super::{RenderContext, Renderer};
use crate::error::RenderError;
use crate::request::{BuildKind, BuildRequest};
use once_cell::sync::Lazy;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use template_descriptor::{SelectionError, TemplateKind};
use tracing::{debug, info, warn};

/// Paper thickness used for spine width when the request gives none (mm).
pub const DEFAULT_PAPER_THICKNESS_MM: f64 = 0.1;

const MANUSCRIPT_FILE: &str = "manuscript.md";
const INTERIOR_FILE: &str = "interior.pdf";

/// Lines of tool output kept in error messages.
const LOG_TAIL_LINES: usize = 12;

static RE_TRANSIENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(TeX capacity exceeded|out of memory|cannot allocate memory|resource temporarily unavailable|no space left on device|too many open files)",
    )
    .unwrap()
});

/// Page objects: `/Type /Page` but not `/Type /Pages`.
static RE_PAGE_OBJECT: Lazy<BytesRegex> =
    Lazy::new(|| BytesRegex::new(r"(?-u)/Type\s*/Page\b").unwrap());

/// Page tree size: `/Count 42`.
static RE_PAGE_COUNT: Lazy<BytesRegex> =
    Lazy::new(|| BytesRegex::new(r"(?-u)/Count\s+(\d+)").unwrap());

/// Renderer that shells out to Pandoc and a LaTeX engine.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    templates_dir: PathBuf,
    pandoc: PathBuf,
    latex_engine: PathBuf,
    poll_interval: Duration,
}

impl CommandRenderer {
    /// Renderer using `pandoc` and `xelatex` from `PATH`.
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        Self::builder(templates_dir).build()
    }

    pub fn builder(templates_dir: impl Into<PathBuf>) -> CommandRendererBuilder {
        CommandRendererBuilder {
            renderer: CommandRenderer {
                templates_dir: templates_dir.into(),
                pandoc: PathBuf::from("pandoc"),
                latex_engine: PathBuf::from("xelatex"),
                poll_interval: Duration::from_millis(50),
            },
        }
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }

    fn convert(&self, request: &BuildRequest, ctx: &RenderContext<'_>) -> Result<Vec<u8>, RenderError> {
        let sel = &request.template;
        let template = load_template(&self.templates_dir, TemplateKind::Layout, &sel.layout)?;
        let options = effective_options(&template, &sel.boolean_options)?;
        template
            .descriptor
            .check_metadata(&sel.metadata)
            .map_err(selection_error)?;

        write_input(ctx.work_dir, MANUSCRIPT_FILE, &request.source_content)?;
        // The tool runs inside the work dir.
        let template_path =
            std::path::absolute(&template.path).unwrap_or_else(|_| template.path.clone());

        let mut cmd = Command::new(&self.pandoc);
        cmd.arg(MANUSCRIPT_FILE)
            .arg("-o")
            .arg(INTERIOR_FILE)
            .arg(format!("--pdf-engine={}", self.latex_engine.display()))
            .arg(format!("--template={}", template_path.display()));
        for (key, value) in &options {
            cmd.arg("-V").arg(format!("{key}={value}"));
        }
        for (key, value) in &sel.metadata {
            cmd.arg("-M").arg(format!("{key}={value}"));
        }

        self.run(cmd, "pandoc", ctx)?;
        read_output(ctx.work_dir, INTERIOR_FILE)
    }

    fn compile_cover(&self, request: &BuildRequest, ctx: &RenderContext<'_>) -> Result<Vec<u8>, RenderError> {
        let sel = &request.template;
        let template = load_template(&self.templates_dir, TemplateKind::Cover, &sel.cover)?;
        let options = effective_options(&template, &sel.boolean_options)?;
        template
            .descriptor
            .check_metadata(&sel.metadata)
            .map_err(selection_error)?;

        let pages = count_pages(&request.source_content).ok_or_else(|| {
            RenderError::permanent("cannot determine the page count of the interior PDF")
        })?;
        let thickness = sel.paper_thickness.unwrap_or(DEFAULT_PAPER_THICKNESS_MM);
        let spine = spine_width_mm(pages, thickness);
        debug!(
            "Job {}: {} pages at {}mm per sheet, spine {:.2}mm",
            ctx.job_id, pages, thickness, spine
        );

        let mut vars = template_vars(&options, &sel.metadata);
        vars.insert("pages".into(), pages.to_string());
        vars.insert("paper_thickness".into(), format!("{thickness}"));
        vars.insert("spine_width".into(), format!("{spine:.2}"));
        vars.insert("source".into(), INTERIOR_FILE.into());

        self.compile_filled(request, &template, &vars, "cover", ctx)
    }

    fn impose(&self, request: &BuildRequest, ctx: &RenderContext<'_>) -> Result<Vec<u8>, RenderError> {
        let sel = &request.template;
        let template = load_template(&self.templates_dir, TemplateKind::Impose, &sel.impose)?;
        let options = effective_options(&template, &sel.boolean_options)?;
        template
            .descriptor
            .check_metadata(&sel.metadata)
            .map_err(selection_error)?;

        let pages = count_pages(&request.source_content).ok_or_else(|| {
            RenderError::permanent("cannot determine the page count of the interior PDF")
        })?;

        let mut vars = template_vars(&options, &sel.metadata);
        vars.insert("pages".into(), pages.to_string());
        vars.insert("source".into(), INTERIOR_FILE.into());

        self.compile_filled(request, &template, &vars, "impose", ctx)
    }

    /// Write the interior and the filled template, then run the engine.
    fn compile_filled(
        &self,
        request: &BuildRequest,
        template: &LoadedTemplate,
        vars: &BTreeMap<String, String>,
        stem: &str,
        ctx: &RenderContext<'_>,
    ) -> Result<Vec<u8>, RenderError> {
        write_input(ctx.work_dir, INTERIOR_FILE, &request.source_content)?;
        let tex_file = format!("{stem}.tex");
        let filled = fill_template(&template.source, vars);
        write_input(ctx.work_dir, &tex_file, filled.as_bytes())?;

        let mut cmd = Command::new(&self.latex_engine);
        cmd.arg("-interaction=nonstopmode")
            .arg("-halt-on-error")
            .arg(&tex_file);

        let engine = self.engine_name();
        self.run(cmd, &engine, ctx)?;
        read_output(ctx.work_dir, &format!("{stem}.pdf"))
    }

    fn engine_name(&self) -> String {
        self.latex_engine
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "latex".to_string())
    }

    /// Spawn `cmd` in the work dir and poll it until it exits, is canceled
    /// or runs past the deadline.
    fn run(&self, mut cmd: Command, tool: &str, ctx: &RenderContext<'_>) -> Result<(), RenderError> {
        let log_path = ctx.work_dir.join(format!("{tool}.log"));
        let log = File::create(&log_path)
            .map_err(|e| RenderError::transient(format!("cannot create {}: {e}", log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(|e| RenderError::transient(format!("cannot duplicate log handle: {e}")))?;

        cmd.current_dir(ctx.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        let started_at = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            warn!("Job {}: failed to spawn {}: {}", ctx.job_id, tool, e);
            match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    RenderError::permanent(format!("{tool} is not available: {e}"))
                }
                _ => RenderError::transient(format!("cannot start {tool}: {e}")),
            }
        })?;

        let status = loop {
            if ctx.is_canceled() {
                kill(&mut child, tool);
                info!("Job {}: render canceled, {} killed", ctx.job_id, tool);
                return Err(RenderError::Canceled);
            }
            if ctx.past_deadline() {
                kill(&mut child, tool);
                warn!("Job {}: render timed out, {} killed", ctx.job_id, tool);
                return Err(RenderError::transient(format!(
                    "{tool} timed out after {:.1}s",
                    started_at.elapsed().as_secs_f64()
                )));
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(self.poll_interval),
                Err(e) => {
                    kill(&mut child, tool);
                    return Err(RenderError::transient(format!("cannot wait for {tool}: {e}")));
                }
            }
        };

        debug!(
            "Job {}: {} finished in {:.2}s ({})",
            ctx.job_id,
            tool,
            started_at.elapsed().as_secs_f64(),
            status
        );

        if status.success() {
            return Ok(());
        }
        let output = std::fs::read(&log_path)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        Err(classify_failure(tool, status, &output))
    }
}

impl Renderer for CommandRenderer {
    fn render(&self, request: &BuildRequest, ctx: &RenderContext<'_>) -> Result<Vec<u8>, RenderError> {
        match request.kind {
            BuildKind::Convert => self.convert(request, ctx),
            BuildKind::CompileCover => self.compile_cover(request, ctx),
            BuildKind::Impose => self.impose(request, ctx),
        }
    }

    fn supports_cancellation(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// Builder for [`CommandRenderer`].
#[derive(Debug)]
pub struct CommandRendererBuilder {
    renderer: CommandRenderer,
}

impl CommandRendererBuilder {
    pub fn pandoc(mut self, path: impl Into<PathBuf>) -> Self {
        self.renderer.pandoc = path.into();
        self
    }

    pub fn latex_engine(mut self, path: impl Into<PathBuf>) -> Self {
        self.renderer.latex_engine = path.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.renderer.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn build(self) -> CommandRenderer {
        self.renderer
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn selection_error(e: SelectionError) -> RenderError {
    RenderError::permanent(e.to_string())
}

fn effective_options(
    template: &LoadedTemplate,
    requested: &BTreeMap<String, bool>,
) -> Result<BTreeMap<String, bool>, RenderError> {
    template
        .descriptor
        .effective_options(requested)
        .map_err(selection_error)
}

/// Variables for self-filled templates: options as `"true"`/`"false"`,
/// then metadata.
fn template_vars(
    options: &BTreeMap<String, bool>,
    metadata: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut vars: BTreeMap<String, String> = options
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect();
    vars.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars
}

fn write_input(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), RenderError> {
    std::fs::write(dir.join(name), bytes)
        .map_err(|e| RenderError::transient(format!("cannot write {name}: {e}")))
}

fn read_output(dir: &Path, name: &str) -> Result<Vec<u8>, RenderError> {
    std::fs::read(dir.join(name))
        .map_err(|e| RenderError::permanent(format!("tool reported success but {name} is missing: {e}")))
}

fn kill(child: &mut std::process::Child, tool: &str) {
    if let Err(e) = child.kill() {
        debug!("Kill of {} failed (already exited?): {}", tool, e);
    }
    let _ = child.wait();
}

/// Number of pages in a PDF, from its page objects or its page tree.
pub fn count_pages(pdf: &[u8]) -> Option<u32> {
    let objects = RE_PAGE_OBJECT.find_iter(pdf).count() as u32;
    if objects > 0 {
        return Some(objects);
    }
    RE_PAGE_COUNT
        .captures_iter(pdf)
        .filter_map(|c| std::str::from_utf8(&c[1]).ok()?.parse::<u32>().ok())
        .max()
        .filter(|&n| n > 0)
}

/// Spine width in millimetres: one sheet per two pages.
pub fn spine_width_mm(pages: u32, paper_thickness_mm: f64) -> f64 {
    f64::from(pages.div_ceil(2)) * paper_thickness_mm
}

fn classify_failure(tool: &str, status: ExitStatus, output: &str) -> RenderError {
    let detail = failure_detail(output);
    let Some(code) = status.code() else {
        return RenderError::transient(format!("{tool} was killed by a signal: {detail}"));
    };
    if RE_TRANSIENT.is_match(output) {
        RenderError::transient(format!("{tool} ran out of resources (exit {code}): {detail}"))
    } else {
        RenderError::permanent(format!("{tool} failed (exit {code}): {detail}"))
    }
}

/// LaTeX error lines (`! …`) when present, else the tail of the log.
fn failure_detail(output: &str) -> String {
    let errors: Vec<&str> = output
        .lines()
        .filter(|l| l.starts_with("! "))
        .take(LOG_TAIL_LINES)
        .collect();
    if !errors.is_empty() {
        return errors.join("\n");
    }
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        "no output".to_string()
    } else {
        tail
    }
}
