//! Configuration for ingestion and analysis.
//!
//! Ingestion knobs live in [`PipelineConfig`], analysis knobs in
//! [`AnalysisConfig`]. Both are built through a validating builder and have
//! documented defaults, so callers only set what they care about.
//!
//! # Example
//! ```rust
//! use edgequake_cad::{AnalysisConfig, ModelSelection, PipelineConfig};
//!
//! let pipeline = PipelineConfig::builder()
//!     .max_svg_bytes(2 * 1024 * 1024)
//!     .concurrency(8)
//!     .build()
//!     .unwrap();
//!
//! let analysis = AnalysisConfig::builder()
//!     .selection(ModelSelection::explicit("gemini-2.5-flash"))
//!     .max_retries(1)
//!     .build()
//!     .unwrap();
//! # let _ = (pipeline, analysis);
//! ```

use crate::error::CadError;
use crate::pipeline::llm::{Cancellation, ClientFactory, LlmClientFactory};
use crate::pipeline::ocr::{OcrEngine, TesseractOcr};
use crate::progress::{AnalysisProgressCallback, NoopProgressCallback};
use crate::registry::ProviderHealth;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ── Ingestion ────────────────────────────────────────────────────────────

/// Upper bound on [`PipelineConfig::render_grid_cells`].
pub const MAX_RENDER_GRID_CELLS: usize = 1024;

/// Configuration for [`crate::ingest()`].
#[derive(Clone)]
pub struct PipelineConfig {
    /// Scratch directory for staged uploads and converter output.
    /// `None` uses the system temp dir.
    pub work_dir: Option<PathBuf>,

    /// Where rendered SVGs are stored. `None` keeps renders in memory only.
    pub render_dir: Option<PathBuf>,

    /// Explicit DWG → DXF converter executable. `None` auto-detects ODA File
    /// Converter, then LibreDWG `dwg2dxf` on `PATH`.
    pub dwg_converter: Option<PathBuf>,

    /// Wall-clock limit for one converter run. Default: 60.
    pub converter_timeout_secs: u64,

    /// Longest side of the greyscale raster handed to vision models and the
    /// feature extractor. Default: 1600.
    pub raster_max_pixels: u32,

    /// Above this entity count the renderer simplifies. Default: 50 000.
    pub max_render_entities: usize,

    /// Byte ceiling of one SVG document. Default: 4 MiB.
    pub max_svg_bytes: usize,

    /// Simplification grid resolution per axis, at most
    /// [`MAX_RENDER_GRID_CELLS`]. Default: 64.
    pub render_grid_cells: usize,

    /// Entities kept per grid cell when simplifying. Default: 64.
    pub max_entities_per_cell: usize,

    /// Uploads processed concurrently by [`crate::ingest_many`]. Default: 4.
    pub concurrency: usize,

    /// Sheet id recorded in manifests. Default: `"Model"`.
    pub sheet_id: String,

    /// Skip raster rendering and feature extraction. Default: false.
    pub skip_features: bool,

    /// OCR backend for the feature extractor.
    pub ocr: Arc<dyn OcrEngine>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            render_dir: None,
            dwg_converter: None,
            converter_timeout_secs: 60,
            raster_max_pixels: 1600,
            max_render_entities: 50_000,
            max_svg_bytes: 4 * 1024 * 1024,
            render_grid_cells: 64,
            max_entities_per_cell: 64,
            concurrency: 4,
            sheet_id: "Model".to_string(),
            skip_features: false,
            ocr: Arc::new(TesseractOcr::default()),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("work_dir", &self.work_dir)
            .field("render_dir", &self.render_dir)
            .field("dwg_converter", &self.dwg_converter)
            .field("converter_timeout_secs", &self.converter_timeout_secs)
            .field("raster_max_pixels", &self.raster_max_pixels)
            .field("max_render_entities", &self.max_render_entities)
            .field("max_svg_bytes", &self.max_svg_bytes)
            .field("concurrency", &self.concurrency)
            .field("sheet_id", &self.sheet_id)
            .field("skip_features", &self.skip_features)
            .field("ocr", &self.ocr.name())
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = Some(dir.into());
        self
    }

    pub fn render_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.render_dir = Some(dir.into());
        self
    }

    pub fn dwg_converter(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dwg_converter = Some(path.into());
        self
    }

    pub fn converter_timeout_secs(mut self, secs: u64) -> Self {
        self.config.converter_timeout_secs = secs;
        self
    }

    pub fn raster_max_pixels(mut self, px: u32) -> Self {
        self.config.raster_max_pixels = px.max(64);
        self
    }

    pub fn max_render_entities(mut self, n: usize) -> Self {
        self.config.max_render_entities = n;
        self
    }

    pub fn max_svg_bytes(mut self, bytes: usize) -> Self {
        self.config.max_svg_bytes = bytes;
        self
    }

    pub fn render_grid_cells(mut self, cells: usize) -> Self {
        self.config.render_grid_cells = cells;
        self
    }

    pub fn max_entities_per_cell(mut self, n: usize) -> Self {
        self.config.max_entities_per_cell = n;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn sheet_id(mut self, id: impl Into<String>) -> Self {
        self.config.sheet_id = id.into();
        self
    }

    pub fn skip_features(mut self, v: bool) -> Self {
        self.config.skip_features = v;
        self
    }

    pub fn ocr(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.config.ocr = engine;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, CadError> {
        let c = &self.config;
        if c.converter_timeout_secs == 0 {
            return Err(CadError::InvalidConfig(
                "converter timeout must be ≥ 1 second".into(),
            ));
        }
        if c.max_svg_bytes < 1024 {
            return Err(CadError::InvalidConfig(format!(
                "max_svg_bytes must be ≥ 1024, got {}",
                c.max_svg_bytes
            )));
        }
        if c.render_grid_cells == 0 || c.max_entities_per_cell == 0 {
            return Err(CadError::InvalidConfig(
                "render grid cells and entities per cell must be ≥ 1".into(),
            ));
        }
        // The thinning pass allocates cells² counters.
        if c.render_grid_cells > MAX_RENDER_GRID_CELLS {
            return Err(CadError::InvalidConfig(format!(
                "render_grid_cells must be ≤ {MAX_RENDER_GRID_CELLS}, got {}",
                c.render_grid_cells
            )));
        }
        if c.sheet_id.trim().is_empty() {
            return Err(CadError::InvalidConfig("sheet_id must not be empty".into()));
        }
        Ok(self.config)
    }
}

// ── Analysis ─────────────────────────────────────────────────────────────

/// How models are chosen for an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ModelSelection {
    /// Walk the registry priority list for the needed capability.
    #[default]
    Automatic,
    /// Try `model_id` first. With `allow_fallback` the automatic list follows.
    Explicit {
        model_id: String,
        allow_fallback: bool,
    },
}

impl ModelSelection {
    /// Explicit selection with fallback enabled.
    pub fn explicit(model_id: impl Into<String>) -> Self {
        ModelSelection::Explicit {
            model_id: model_id.into(),
            allow_fallback: true,
        }
    }

    /// Explicit selection restricted to the named model.
    pub fn only(model_id: impl Into<String>) -> Self {
        ModelSelection::Explicit {
            model_id: model_id.into(),
            allow_fallback: false,
        }
    }
}

/// Configuration for multi-stage and hybrid analysis.
#[derive(Clone)]
pub struct AnalysisConfig {
    pub selection: ModelSelection,

    /// Retries on the same model after a transient, timeout or invalid-response
    /// failure. Default: 2.
    pub max_retries: u32,

    /// First retry delay; doubles per retry. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call timeout. Default: 30.
    pub api_timeout_secs: u64,

    /// Default: 0.2.
    pub temperature: f32,

    /// Default: 2048.
    pub max_tokens: usize,

    /// How long a model that returned a quota error sorts last. Default: 60.
    pub quota_cooldown_secs: u64,

    /// Builds model clients. Default: the `edgequake-llm` provider factory.
    pub client_factory: Arc<dyn ClientFactory>,

    /// Quota cooldown table. Default: the process-wide one.
    pub health: Arc<ProviderHealth>,

    pub progress_callback: Arc<dyn AnalysisProgressCallback>,

    pub cancellation: Cancellation,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            selection: ModelSelection::Automatic,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 30,
            temperature: 0.2,
            max_tokens: 2048,
            quota_cooldown_secs: 60,
            client_factory: Arc::new(LlmClientFactory),
            health: ProviderHealth::shared(),
            progress_callback: Arc::new(NoopProgressCallback),
            cancellation: Cancellation::new(),
        }
    }
}

impl fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("selection", &self.selection)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("quota_cooldown_secs", &self.quota_cooldown_secs)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

impl AnalysisConfig {
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Back-off before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Builder for [`AnalysisConfig`].
pub struct AnalysisConfigBuilder {
    config: AnalysisConfig,
}

impl fmt::Debug for AnalysisConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.config.fmt(f)
    }
}

impl AnalysisConfigBuilder {
    pub fn selection(mut self, selection: ModelSelection) -> Self {
        self.config.selection = selection;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn quota_cooldown_secs(mut self, secs: u64) -> Self {
        self.config.quota_cooldown_secs = secs;
        self
    }

    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.config.client_factory = factory;
        self
    }

    pub fn health(mut self, health: Arc<ProviderHealth>) -> Self {
        self.config.health = health;
        self
    }

    pub fn progress_callback(mut self, cb: Arc<dyn AnalysisProgressCallback>) -> Self {
        self.config.progress_callback = cb;
        self
    }

    pub fn cancellation(mut self, token: Cancellation) -> Self {
        self.config.cancellation = token;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<AnalysisConfig, CadError> {
        let c = &self.config;
        if c.api_timeout_secs == 0 {
            return Err(CadError::InvalidConfig("api timeout must be ≥ 1 second".into()));
        }
        if c.max_tokens == 0 {
            return Err(CadError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if let ModelSelection::Explicit { model_id, .. } = &c.selection {
            if model_id.trim().is_empty() {
                return Err(CadError::InvalidConfig(
                    "explicit model id must not be empty".into(),
                ));
            }
        }
        Ok(self.config)
    }
}
