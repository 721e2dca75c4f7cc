//! # edgequake-cad
//!
//! Ingest CAD drawings (DXF, or DWG through an external converter) into a
//! canonical entity manifest, render them, and analyse them with a
//! failover-tolerant set of model providers.
//!
//! ## Pipeline Overview
//!
//! ```text
//! DXF / DWG upload
//!  │
//!  ├─ 1. Normalise  DWG → DXF via ODA File Converter / LibreDWG (fail-open)
//!  ├─ 2. Manifest   entities, bboxes, layers, statistics (fail-open)
//!  ├─ 3. Render     per-layer SVG with a size cap, plus a greyscale raster
//!  ├─ 4. Features   deterministic CV + OCR features, manifest validation
//!  │
//!  ├─ 5a. Multi-stage  five sequential vision stages with per-stage failover
//!  └─ 5b. Hybrid       one text-model call over the deterministic evidence
//! ```
//!
//! Steps 1–4 never fail: a corrupt upload still yields a well-formed,
//! entity-empty manifest with `conversion_status = conversion_failed`.
//! Analysis returns a full result, a `degraded` result with the stages that
//! completed, or [`AnalysisError::Unavailable`] when no provider could be
//! reached at all.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_cad::{analyze_multi_stage, ingest, AnalysisConfig, ModelRegistry, PipelineConfig, Upload};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let output = ingest(&Upload::path("bracket.dxf"), "bracket-01", &PipelineConfig::default()).await;
//!     println!("{}", serde_json::to_string_pretty(&output.manifest)?);
//!
//!     // Provider keys come from GEMINI_API_KEY / OPENROUTER_API_KEY / …
//!     let registry = ModelRegistry::builtin();
//!     let analysis = analyze_multi_stage(&output, &registry, &AnalysisConfig::default()).await?;
//!     println!("degraded: {}\n{}", analysis.degraded, analysis.synthesis);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `cadlens` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-cad = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod hybrid;
pub mod ingest;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod registry;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{AnalysisConfig, AnalysisConfigBuilder, ModelSelection, PipelineConfig, PipelineConfigBuilder};
pub use error::{
    AnalysisError, CadError, ConversionError, FusionError, ModelProviderError, OcrError, ParseError, RenderError,
};
pub use hybrid::analyze_hybrid;
pub use ingest::{index_analysis, index_text, ingest, ingest_many, TextIndexer};
pub use orchestrator::{analyze, analyze_multi_stage, AnalysisState};
pub use output::{
    AnalysisMode, AnalysisResult, AttemptFailure, ConversionStatus, Entity, EntityType, Extents, IngestOutput,
    Manifest, StageKind, StageOutput, Statistics,
};
pub use pipeline::features::{CvFeatureSet, ValidationReport};
pub use pipeline::input::Upload;
pub use pipeline::llm::{Cancellation, ClientFactory, ModelClient, ModelReply, ModelRequest};
pub use pipeline::manifest::{extract_text, TextExtract};
pub use pipeline::ocr::{NoOcr, OcrEngine, OcrItem, TesseractOcr};
pub use pipeline::render::{RenderHandle, RenderStore};
pub use progress::{AnalysisProgressCallback, NoopProgressCallback, ProgressCallback};
pub use registry::{Capability, CostTier, ModelDescriptor, ModelRegistry, Provider, ProviderHealth};
