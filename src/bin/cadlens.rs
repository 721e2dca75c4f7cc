//! CLI binary for edgequake-cad.
//!
//! A thin shim over the library crate: flags map to `PipelineConfig` and
//! `AnalysisConfig`, results go to stdout, diagnostics to stderr.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_cad::{
    analyze, ingest, AnalysisConfig, AnalysisMode, AnalysisProgressCallback, AnalysisResult, IngestOutput,
    ModelRegistry, ModelSelection, NoOcr, OcrEngine, PipelineConfig, StageKind, TesseractOcr,
    Upload,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
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

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Renders a stage bar and one log line per stage event.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<StageKind, Instant>>,
    failovers: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Selecting models…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            failovers: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>1}/{len} stages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Analysing");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, stage: StageKind) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut times| times.remove(&stage))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl AnalysisProgressCallback for CliProgressCallback {
    fn on_analysis_start(&self, file_id: &str, total_stages: usize) {
        self.activate_bar(total_stages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Analysing {file_id} in {total_stages} stage(s)…"))
        ));
    }

    fn on_stage_start(&self, stage: StageKind) {
        if let Ok(mut times) = self.start_times.lock() {
            times.insert(stage, Instant::now());
        }
        self.bar.set_message(stage.title().to_string());
    }

    fn on_stage_complete(&self, stage: StageKind, model_id: &str, text_len: usize) {
        let secs = self.elapsed_secs(stage);
        self.bar.println(format!(
            "  {} {:<26} {:<40} {}  {}",
            green("✓"),
            stage.title(),
            dim(model_id),
            dim(&format!("{text_len:>6} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_failover(&self, stage: StageKind, from_model: &str, reason: &str) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
        self.bar.println(format!(
            "  {} {:<26} {} {}",
            cyan("↪"),
            stage.title(),
            dim(from_model),
            dim(reason),
        ));
    }

    fn on_degraded(&self, stage: StageKind, reason: &str) {
        let _ = self.elapsed_secs(stage);
        self.bar.println(format!("  {} {:<26} {}", red("✗"), stage.title(), red(reason)));
        self.bar.inc(1);
    }

    fn on_analysis_complete(&self, completed_stages: usize, degraded: bool) {
        self.bar.finish_and_clear();
        let failovers = self.failovers.load(Ordering::Relaxed);
        if degraded {
            eprintln!(
                "{} {} stage(s) served, result is degraded  ({} failover(s))",
                cyan("⚠"),
                bold(&completed_stages.to_string()),
                failovers
            );
        } else {
            eprintln!(
                "{} {} stage(s) served  ({} failover(s))",
                green("✔"),
                bold(&completed_stages.to_string()),
                failovers
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Manifest JSON for a DXF (no API key needed)
  cadlens ingest bracket.dxf > bracket.json

  # DWG input, keep the SVG render and print the text view
  cadlens ingest --svg bracket.svg --text housing.dwg

  # Five-stage vision analysis with automatic model selection
  cadlens analyze bracket.dxf

  # Single-call hybrid analysis pinned to one model
  cadlens analyze --mode hybrid --model deepseek/deepseek-r1 --no-fallback bracket.dxf

  # List the model registry
  cadlens models
  cadlens models --registry models.toml

DWG CONVERSION:
  DWG files are converted with the ODA File Converter or LibreDWG's dwg2dxf.
  Both are looked up on PATH unless --dwg-converter points at one of them.
  Supported DWG versions: AC1014 (R14) through AC1032 (2018+).

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY           Google Gemini API key (gemini-direct models)
  OPENROUTER_API_KEY       OpenRouter API key (openrouter models)
  CADLENS_REGISTRY         TOML model registry replacing the built-in table
  CADLENS_DWG_CONVERTER    Path to ODAFileConverter or dwg2dxf
  CADLENS_RENDER_DIR       Directory for stored SVG renders
  RUST_LOG                 Overrides the log filter chosen by -v / -q
"#;

/// Ingest and analyse DXF/DWG engineering drawings.
#[derive(Parser, Debug)]
#[command(
    name = "cadlens",
    version,
    about = "Ingest and analyse DXF/DWG engineering drawings",
    long_about = "Turn DXF and DWG drawings into a canonical entity manifest, an SVG render and \
deterministic image features, then analyse them with a failover-tolerant set of vision and \
text models.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "CADLENS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "CADLENS_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the manifest for a drawing and print it as JSON.
    Ingest {
        #[command(flatten)]
        input: InputArgs,

        /// Write the SVG render to this file.
        #[arg(long)]
        svg: Option<PathBuf>,

        /// Print the text-extraction view instead of the manifest.
        #[arg(long)]
        text: bool,

        /// Include the CV feature set and validation report in the JSON.
        #[arg(long)]
        features: bool,
    },

    /// Ingest a drawing, then run a model analysis on it.
    Analyze {
        #[command(flatten)]
        input: InputArgs,

        /// Analysis mode.
        #[arg(long, env = "CADLENS_MODE", value_enum, default_value = "multi-stage")]
        mode: ModeArg,

        /// Registry id of the model to try first.
        #[arg(long, env = "CADLENS_MODEL")]
        model: Option<String>,

        /// Use only --model; never fall back to the priority list.
        #[arg(long, requires = "model")]
        no_fallback: bool,

        /// TOML model registry replacing the built-in table.
        #[arg(long, env = "CADLENS_REGISTRY")]
        registry: Option<PathBuf>,

        /// Output the full AnalysisResult as JSON.
        #[arg(long, env = "CADLENS_JSON")]
        json: bool,

        /// Disable the progress bar.
        #[arg(long, env = "CADLENS_NO_PROGRESS")]
        no_progress: bool,

        /// Retries per model on transient failures.
        #[arg(long, env = "CADLENS_MAX_RETRIES", default_value_t = 2)]
        max_retries: u32,

        /// Per-call model timeout in seconds.
        #[arg(long, env = "CADLENS_API_TIMEOUT", default_value_t = 30)]
        api_timeout: u64,
    },

    /// Print the model registry in priority order.
    Models {
        /// TOML model registry replacing the built-in table.
        #[arg(long, env = "CADLENS_REGISTRY")]
        registry: Option<PathBuf>,

        /// Print the registry as TOML instead of a table.
        #[arg(long)]
        toml: bool,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// DXF or DWG file.
    file: PathBuf,

    /// Identifier recorded in the manifest. Default: the file stem.
    #[arg(long)]
    file_id: Option<String>,

    /// Sheet identifier recorded in the manifest.
    #[arg(long, default_value = "Model")]
    sheet_id: String,

    /// Path to ODAFileConverter or dwg2dxf.
    #[arg(long, env = "CADLENS_DWG_CONVERTER")]
    dwg_converter: Option<PathBuf>,

    /// Store the SVG render under this directory.
    #[arg(long, env = "CADLENS_RENDER_DIR")]
    render_dir: Option<PathBuf>,

    /// Skip OCR (features still run on the raster).
    #[arg(long, env = "CADLENS_NO_OCR")]
    no_ocr: bool,

    /// Skip deterministic feature extraction entirely.
    #[arg(long)]
    skip_features: bool,

    /// Longer raster side in pixels.
    #[arg(long, env = "CADLENS_RASTER_PIXELS", default_value_t = 1600,
          value_parser = clap::value_parser!(u32).range(64..=8192))]
    raster_pixels: u32,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    MultiStage,
    Hybrid,
}

impl From<ModeArg> for AnalysisMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::MultiStage => AnalysisMode::MultiStage,
            ModeArg::Hybrid => AnalysisMode::Hybrid,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs during analysis.
    let shows_bar = matches!(
        &cli.command,
        Command::Analyze { json: false, no_progress: false, .. }
    );
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || shows_bar {
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

    match &cli.command {
        Command::Ingest { input, svg, text, features } => {
            let output = run_ingest(input).await?;
            report_ingest(&cli, &output);

            if let Some(path) = svg {
                let render = output
                    .render
                    .as_ref()
                    .context("Drawing could not be rendered; no SVG written")?;
                std::fs::write(path, &render.svg)
                    .with_context(|| format!("Failed to write SVG to {}", path.display()))?;
            }

            if *text {
                print_stdout(&output.text.text)?;
            } else if *features {
                let json = serde_json::json!({
                    "manifest": output.manifest,
                    "features": output.features,
                    "validation": output.validation,
                    "render_error": output.render_error,
                });
                print_stdout(&serde_json::to_string_pretty(&json).context("Failed to serialise output")?)?;
            } else {
                let json =
                    serde_json::to_string_pretty(&output.manifest).context("Failed to serialise manifest")?;
                print_stdout(&json)?;
            }
        }

        Command::Analyze {
            input,
            mode,
            model,
            no_fallback,
            registry,
            json,
            no_progress,
            max_retries,
            api_timeout,
        } => {
            let registry = load_registry(registry.as_deref())?;
            let output = run_ingest(input).await?;
            report_ingest(&cli, &output);

            let mut builder = AnalysisConfig::builder()
                .max_retries(*max_retries)
                .api_timeout_secs(*api_timeout);
            if let Some(model) = model {
                builder = builder.selection(if *no_fallback {
                    ModelSelection::only(model)
                } else {
                    ModelSelection::explicit(model)
                });
            }
            if !cli.quiet && !*json && !*no_progress {
                builder = builder.progress_callback(CliProgressCallback::new());
            }
            let config = builder.build().context("Invalid analysis configuration")?;

            let result = analyze(&output, &registry, (*mode).into(), &config)
                .await
                .context("Analysis failed")?;

            if *json {
                let json = serde_json::to_string_pretty(&result).context("Failed to serialise result")?;
                print_stdout(&json)?;
            } else {
                print_stdout(&render_report(&result))?;
            }
            if !cli.quiet && !*json {
                eprintln!(
                    "   {} stage(s)  {}ms total",
                    dim(&result.completed_stages().to_string()),
                    result.duration_ms
                );
            }
        }

        Command::Models { registry, toml } => {
            let registry = load_registry(registry.as_deref())?;
            if *toml {
                print_stdout(&registry.to_toml_string().context("Failed to serialise registry")?)?;
            } else {
                print_stdout(&models_table(&registry))?;
            }
        }
    }

    Ok(())
}

/// Map input flags to `PipelineConfig` and run ingestion.
async fn run_ingest(input: &InputArgs) -> Result<IngestOutput> {
    if !input.file.is_file() {
        bail!("File not found: {}", input.file.display());
    }
    let ocr: Arc<dyn OcrEngine> = if input.no_ocr {
        Arc::new(NoOcr)
    } else {
        Arc::new(TesseractOcr::default())
    };
    let mut builder = PipelineConfig::builder()
        .sheet_id(input.sheet_id.clone())
        .raster_max_pixels(input.raster_pixels)
        .skip_features(input.skip_features)
        .ocr(ocr);
    if let Some(path) = &input.dwg_converter {
        builder = builder.dwg_converter(path);
    }
    if let Some(dir) = &input.render_dir {
        builder = builder.render_dir(dir);
    }
    let config = builder.build().context("Invalid pipeline configuration")?;

    let file_id = input.file_id.clone().unwrap_or_else(|| {
        input
            .file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "drawing".to_string())
    });
    Ok(ingest(&Upload::path(&input.file), &file_id, &config).await)
}

fn load_registry(path: Option<&Path>) -> Result<ModelRegistry> {
    match path {
        Some(path) => ModelRegistry::from_file(path)
            .with_context(|| format!("Failed to load model registry from {}", path.display())),
        None => Ok(ModelRegistry::builtin()),
    }
}

fn report_ingest(cli: &Cli, output: &IngestOutput) {
    if cli.quiet {
        return;
    }
    let manifest = &output.manifest;
    if let Some(message) = &manifest.error_message {
        eprintln!("{} {} {}", red("✘"), bold(&manifest.file_id), red(message));
        return;
    }
    let stored = output
        .render
        .as_ref()
        .and_then(|r| r.path.as_ref())
        .map(|p| format!("  →  {}", p.display()))
        .unwrap_or_default();
    eprintln!(
        "{} {}  {} entities  {} layers  {}{}",
        green("✔"),
        bold(&manifest.file_id),
        manifest.entities.len(),
        manifest.layers.len(),
        dim(&format!("{} {}", manifest.dxf_version, manifest.units)),
        stored,
    );
    if let Some(e) = &output.render_error {
        eprintln!("  {} render: {}", cyan("⚠"), e);
    }
    if let Some(report) = &output.validation {
        for d in &report.discrepancies {
            eprintln!(
                "  {} {}: parsed {}, detected {}",
                cyan("⚠"),
                d.metric,
                d.parsed,
                d.detected
            );
        }
    }
}

fn render_report(result: &AnalysisResult) -> String {
    let mut out = String::new();
    for stage in result.stages.iter().filter(|s| s.stage != StageKind::Synthesis) {
        out.push_str(&format!(
            "## {} ({})\n\n{}\n\n",
            stage.stage.title(),
            stage.model_used,
            stage.text.trim()
        ));
    }
    let heading = match result.model_for(StageKind::Synthesis) {
        Some(model) => format!("## Synthesis ({model})\n\n"),
        None if result.degraded => "## Synthesis (degraded)\n\n".to_string(),
        None => "## Synthesis\n\n".to_string(),
    };
    out.push_str(&heading);
    out.push_str(result.synthesis.trim());
    out.push('\n');
    out
}

fn models_table(registry: &ModelRegistry) -> String {
    let mut models: Vec<_> = registry.models().iter().collect();
    models.sort_by_key(|m| m.priority);
    let mut out = format!(
        "{:>4}  {:<42} {:<14} {:<6} {}\n",
        "PRIO", "MODEL", "PROVIDER", "COST", "CAPABILITIES"
    );
    for m in models {
        let caps: Vec<String> = m.capabilities.iter().map(|c| format!("{c:?}").to_lowercase()).collect();
        out.push_str(&format!(
            "{:>4}  {:<42} {:<14} {:<6} {}\n",
            m.priority,
            m.id,
            m.provider.factory_name(),
            format!("{:?}", m.cost_tier).to_lowercase(),
            caps.join(",")
        ));
    }
    out
}

fn print_stdout(text: &str) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle
        .write_all(text.as_bytes())
        .context("Failed to write to stdout")?;
    if !text.ends_with('\n') {
        handle.write_all(b"\n").ok();
    }
    Ok(())
}
