//! CommandRenderer tests with shell-script stand-ins for pandoc and xelatex.
#![cfg(unix)]

use pressroom::{
    ArtifactStore, BuildKind, BuildRequest, CancelFlag, CommandRenderer, JobId, JobScheduler, RenderContext,
    RenderError, Renderer, SchedulerConfig, TemplateSelection,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ── Fixtures ─────────────────────────────────────────────────────────────────

const FAKE_PANDOC: &str = r#"#!/bin/sh
echo "$@" > "@ARGS@"
out=""
while [ "$#" -gt 0 ]; do
  case "$1" in
    -o) shift; out="$1" ;;
  esac
  shift
done
if [ ! -f manuscript.md ]; then
  echo "manuscript.md missing" >&2
  exit 3
fi
printf '%%PDF-1.5\n' > "$out"
cat manuscript.md >> "$out"
"#;

/// Writes `<stem>.pdf` holding a PDF header followed by the filled template.
const FAKE_ENGINE: &str = r#"#!/bin/sh
for last in "$@"; do :; done
stem="${last%.tex}"
printf '%%PDF-1.5\n' > "$stem.pdf"
cat "$last" >> "$stem.pdf"
"#;

struct Toolbox {
    dir: TempDir,
}

impl Toolbox {
    fn new() -> Self {
        let toolbox = Self {
            dir: TempDir::new().expect("temp dir"),
        };
        toolbox.template(
            "layouts/classic.tex",
            "%% @name: Classic\n%% @kind: layout\n%% @option draft: Draft watermark\n%% @meta title: Title [required]\n\\title{$title$}\n",
        );
        toolbox.template(
            "covers/matte.tex",
            "%% @name: Matte\n%% @kind: cover\n%% @meta title: Title [required]\nspine=$spine_width$mm pages=$pages$ title=$title$ src=$source$\n",
        );
        toolbox.template(
            "impose/saddle.tex",
            "%% @name: Saddle stitch\n%% @kind: impose\n%% @option creep: Creep compensation [default: true]\nsheets for $pages$ pages$if(creep)$ with creep$endif$\n",
        );
        toolbox
    }

    fn templates(&self) -> PathBuf {
        self.dir.path().join("templates")
    }

    fn template(&self, rel: &str, body: &str) {
        let path = self.templates().join(rel);
        fs::create_dir_all(path.parent().unwrap()).expect("template dir");
        fs::write(path, body).expect("write template");
    }

    fn args_log(&self) -> PathBuf {
        self.dir.path().join("pandoc-args.log")
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, body).expect("write script");
        make_executable(&path);
        path
    }

    fn renderer_with_engine(&self, engine_body: &str) -> CommandRenderer {
        let pandoc = self.script(
            "fake-pandoc",
            &FAKE_PANDOC.replace("@ARGS@", &self.args_log().display().to_string()),
        );
        let engine = self.script("fake-xelatex", engine_body);
        CommandRenderer::builder(self.templates())
            .pandoc(pandoc)
            .latex_engine(engine)
            .poll_interval(Duration::from_millis(10))
            .build()
    }

    fn renderer(&self) -> CommandRenderer {
        self.renderer_with_engine(FAKE_ENGINE)
    }
}

fn make_executable(path: &Path) {
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("set perms");
}

fn job_id() -> JobId {
    "0123456789abcdef-1".parse().expect("job id")
}

fn render_with(
    renderer: &CommandRenderer,
    request: &BuildRequest,
    cancel: &CancelFlag,
    deadline: Option<Instant>,
) -> Result<Vec<u8>, RenderError> {
    let work = TempDir::new().expect("work dir");
    let id = job_id();
    let ctx = RenderContext {
        job_id: &id,
        attempt: 0,
        work_dir: work.path(),
        cancel,
        deadline,
    };
    renderer.render(request, &ctx)
}

fn render(renderer: &CommandRenderer, request: &BuildRequest) -> Result<Vec<u8>, RenderError> {
    render_with(renderer, request, &CancelFlag::new(), None)
}

fn interior(pages: usize) -> Vec<u8> {
    let mut pdf = b"%PDF-1.7\n1 0 obj <</Type /Pages /Count 0>>\n".to_vec();
    for n in 0..pages {
        pdf.extend_from_slice(format!("{} 0 obj <</Type /Page /Parent 1 0 R>>\n", n + 2).as_bytes());
    }
    pdf
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

// ── Convert ──────────────────────────────────────────────────────────────────

#[test]
fn convert_passes_template_options_and_metadata() {
    let tools = Toolbox::new();
    let renderer = tools.renderer();
    let request = BuildRequest::new(
        BuildKind::Convert,
        "# Night Train\n",
        TemplateSelection::layout("classic")
            .with_option("draft", true)
            .with_metadata("title", "Night Train"),
    );

    let pdf = render(&renderer, &request).expect("pdf rendered");
    assert_eq!(text(&pdf), "%PDF-1.5\n# Night Train\n");

    let args = fs::read_to_string(tools.args_log()).expect("read args");
    assert!(args.starts_with("manuscript.md -o interior.pdf"), "args: {args}");
    assert!(args.contains("--pdf-engine="), "args: {args}");
    assert!(args.contains("layouts/classic.tex"), "args: {args}");
    assert!(args.contains("-V draft=true"), "args: {args}");
    assert!(args.contains("-M title=Night Train"), "args: {args}");
}

#[test]
fn unknown_option_and_missing_metadata_are_permanent() {
    let tools = Toolbox::new();
    let renderer = tools.renderer();

    let unknown = BuildRequest::new(
        BuildKind::Convert,
        "# x",
        TemplateSelection::layout("classic")
            .with_option("sparkles", true)
            .with_metadata("title", "X"),
    );
    let err = render(&renderer, &unknown).expect_err("unknown option");
    assert!(matches!(err, RenderError::Permanent(_)), "got {err:?}");
    assert!(err.to_string().contains("sparkles"), "got {err}");

    let missing = BuildRequest::convert("# x", "classic");
    let err = render(&renderer, &missing).expect_err("missing title");
    assert!(matches!(err, RenderError::Permanent(_)), "got {err:?}");
    assert!(err.to_string().contains("title"), "got {err}");
}

#[test]
fn missing_template_or_tool_is_permanent() {
    let tools = Toolbox::new();
    let renderer = tools.renderer();
    let absent = BuildRequest::new(
        BuildKind::Convert,
        "# x",
        TemplateSelection::layout("nope").with_metadata("title", "X"),
    );
    assert!(matches!(render(&renderer, &absent), Err(RenderError::Permanent(_))));

    let no_pandoc = CommandRenderer::builder(tools.templates())
        .pandoc("/nonexistent/pandoc")
        .build();
    let request = BuildRequest::new(
        BuildKind::Convert,
        "# x",
        TemplateSelection::layout("classic").with_metadata("title", "X"),
    );
    let err = render(&no_pandoc, &request).expect_err("no pandoc");
    assert!(matches!(err, RenderError::Permanent(_)), "got {err:?}");
    assert!(err.to_string().contains("not available"), "got {err}");
}

// ── Cover & impose ───────────────────────────────────────────────────────────

#[test]
fn cover_gets_spine_width_from_page_count() {
    let tools = Toolbox::new();
    let renderer = tools.renderer();

    let request = BuildRequest::new(
        BuildKind::CompileCover,
        interior(20),
        TemplateSelection::cover("matte").with_metadata("title", "Night"),
    );
    let pdf = text(&render(&renderer, &request).expect("cover"));
    assert!(
        pdf.contains("spine=1.00mm pages=20 title=Night src=interior.pdf"),
        "got {pdf}"
    );

    let thick = BuildRequest::new(
        BuildKind::CompileCover,
        interior(21),
        TemplateSelection::cover("matte")
            .with_metadata("title", "Night")
            .with_paper_thickness(0.12),
    );
    let pdf = text(&render(&renderer, &thick).expect("cover"));
    assert!(pdf.contains("spine=1.32mm pages=21"), "got {pdf}");
}

#[test]
fn cover_needs_a_page_count() {
    let tools = Toolbox::new();
    let request = BuildRequest::new(
        BuildKind::CompileCover,
        b"%PDF-1.7 no pages here".to_vec(),
        TemplateSelection::cover("matte").with_metadata("title", "Night"),
    );
    let err = render(&tools.renderer(), &request).expect_err("no page count");
    assert!(matches!(err, RenderError::Permanent(_)), "got {err:?}");
}

#[test]
fn impose_fills_conditionals_from_option_defaults() {
    let tools = Toolbox::new();
    let renderer = tools.renderer();

    let request = BuildRequest::new(BuildKind::Impose, interior(4), TemplateSelection::impose("saddle"));
    let pdf = text(&render(&renderer, &request).expect("imposed"));
    assert!(pdf.contains("sheets for 4 pages with creep"), "got {pdf}");

    let flat = BuildRequest::new(
        BuildKind::Impose,
        interior(4),
        TemplateSelection::impose("saddle").with_option("creep", false),
    );
    let pdf = text(&render(&renderer, &flat).expect("imposed"));
    assert!(pdf.contains("sheets for 4 pages\n"), "got {pdf}");
}

// ── Failure classification ───────────────────────────────────────────────────

fn cover_request() -> BuildRequest {
    BuildRequest::new(
        BuildKind::CompileCover,
        interior(8),
        TemplateSelection::cover("matte").with_metadata("title", "Night"),
    )
}

#[test]
fn tex_capacity_exceeded_is_transient() {
    let tools = Toolbox::new();
    let renderer = tools.renderer_with_engine(
        "#!/bin/sh\necho 'This is XeTeX'\necho '! TeX capacity exceeded, sorry [main memory size=5000000].'\nexit 1\n",
    );
    let err = render(&renderer, &cover_request()).expect_err("capacity");
    assert!(err.is_transient(), "got {err:?}");
}

#[test]
fn latex_errors_are_permanent_and_reported() {
    let tools = Toolbox::new();
    let renderer = tools.renderer_with_engine(
        "#!/bin/sh\necho 'This is XeTeX'\necho '! Undefined control sequence.'\necho 'l.3 \\foo'\nexit 1\n",
    );
    let err = render(&renderer, &cover_request()).expect_err("latex error");
    assert!(matches!(err, RenderError::Permanent(_)), "got {err:?}");
    assert!(err.to_string().contains("! Undefined control sequence."), "got {err}");
}

#[test]
fn passed_deadline_kills_the_tool_as_transient() {
    let tools = Toolbox::new();
    let renderer = tools.renderer_with_engine("#!/bin/sh\nexec sleep 10\n");
    let started = Instant::now();
    let err = render_with(
        &renderer,
        &cover_request(),
        &CancelFlag::new(),
        Some(Instant::now() + Duration::from_millis(100)),
    )
    .expect_err("deadline");
    assert!(err.is_transient(), "got {err:?}");
    assert!(err.to_string().contains("timed out"), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn cancel_flag_kills_the_tool() {
    let tools = Toolbox::new();
    let renderer = tools.renderer_with_engine("#!/bin/sh\nexec sleep 10\n");
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        trigger.cancel();
    });

    let started = Instant::now();
    let err = render_with(&renderer, &cover_request(), &cancel, None).expect_err("canceled");
    canceller.join().unwrap();
    assert_eq!(err, RenderError::Canceled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ── Through the scheduler ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_builds_with_the_command_renderer() {
    let tools = Toolbox::new();
    let store_dir = tools.dir.path().join("artifacts");
    let config = SchedulerConfig::builder()
        .max_concurrent_renders(1)
        .scratch_root(tools.dir.path().join("scratch"))
        .build()
        .unwrap();
    let scheduler = JobScheduler::start(
        config,
        Arc::new(tools.renderer()),
        ArtifactStore::open(&store_dir).unwrap(),
    )
    .unwrap();

    let request = BuildRequest::new(
        BuildKind::Convert,
        "# Through the queue\n",
        TemplateSelection::layout("classic").with_metadata("title", "Queue"),
    );
    let handle = scheduler.submit(request).unwrap();
    let artifact = scheduler
        .await_result(&handle, Duration::from_secs(30))
        .await
        .unwrap();

    let pdf = scheduler.store().retrieve(&artifact.reference).unwrap();
    assert_eq!(text(&pdf), "%PDF-1.5\n# Through the queue\n");
    assert_eq!(artifact.size_bytes, pdf.len() as u64);
    scheduler.shutdown().await;

    // A reopened store still serves the artifact.
    let reopened = ArtifactStore::open(&store_dir).unwrap();
    assert!(reopened.contains(&artifact.reference));
}
