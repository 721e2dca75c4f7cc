//! Data model handed to callers: manifests, ingestion output, analysis results.
//!
//! Everything here is plain owned data with `serde` derives. Map-valued fields
//! use `BTreeMap` so that serialising the same manifest twice produces the
//! same bytes.

use crate::error::RenderError;
use crate::pipeline::features::{CvFeatureSet, ValidationReport};
use crate::pipeline::manifest::TextExtract;
use crate::pipeline::render::RenderHandle;
use crate::registry::Provider;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Manifest ─────────────────────────────────────────────────────────────

/// Outcome of the format-normalisation step, carried into the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    /// A foreign-format drawing was converted to DXF.
    Success,
    /// The upload was already DXF.
    AlreadyNative,
    /// Conversion or parsing failed; the manifest is entity-empty.
    ConversionFailed,
}

/// Fixed entity categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    Text,
    Mtext,
    Dimension,
    Line,
    Circle,
    Arc,
    Ellipse,
    Other,
}

impl EntityType {
    /// Whether entities of this type carry `raw_text`.
    pub fn is_textual(self) -> bool {
        matches!(self, EntityType::Text | EntityType::Mtext | EntityType::Dimension)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Text => "TEXT",
            EntityType::Mtext => "MTEXT",
            EntityType::Dimension => "DIMENSION",
            EntityType::Line => "LINE",
            EntityType::Circle => "CIRCLE",
            EntityType::Arc => "ARC",
            EntityType::Ellipse => "ELLIPSE",
            EntityType::Other => "OTHER",
        }
    }
}

/// World-space bounding box of the whole sheet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extents {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

impl Extents {
    /// The sentinel used for empty and failed manifests.
    pub const ZERO: Extents = Extents {
        min: [0.0, 0.0],
        max: [0.0, 0.0],
    };

    pub fn width(&self) -> f64 {
        self.max[0] - self.min[0]
    }

    pub fn height(&self) -> f64 {
        self.max[1] - self.min[1]
    }

    /// `true` when the box contains (or touches) `bbox`.
    pub fn contains(&self, bbox: &[f64; 4]) -> bool {
        bbox[0] >= self.min[0]
            && bbox[1] >= self.min[1]
            && bbox[2] <= self.max[0]
            && bbox[3] <= self.max[1]
    }
}

impl Default for Extents {
    fn default() -> Self {
        Extents::ZERO
    }
}

/// One geometric or text primitive of the drawing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// `ent_000001`, assigned in parse order.
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    pub layer: String,
    /// `[x1, y1, x2, y2]` in drawing units.
    pub bbox_world: [f64; 4],
    /// `bbox_world` rescaled into the extents, each component in `[0, 1]`.
    pub bbox_norm: [f64; 4],
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Per-type and per-layer counters.
///
/// Always derived in the same traversal that produces the entity list, so
/// `total_entities == entities.len()` holds for every manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_entities: usize,
    pub text_entities: usize,
    pub mtext_entities: usize,
    pub dimension_entities: usize,
    pub line_entities: usize,
    pub circle_entities: usize,
    pub arc_entities: usize,
    pub ellipse_entities: usize,
    pub other_entities: usize,
    #[serde(default)]
    pub entities_per_layer: BTreeMap<String, usize>,
}

impl Statistics {
    /// Count one entity.
    pub fn record(&mut self, entity_type: EntityType, layer: &str) {
        self.total_entities += 1;
        *self.counter_mut(entity_type) += 1;
        *self
            .entities_per_layer
            .entry(layer.to_string())
            .or_insert(0) += 1;
    }

    pub fn count_for(&self, entity_type: EntityType) -> usize {
        match entity_type {
            EntityType::Text => self.text_entities,
            EntityType::Mtext => self.mtext_entities,
            EntityType::Dimension => self.dimension_entities,
            EntityType::Line => self.line_entities,
            EntityType::Circle => self.circle_entities,
            EntityType::Arc => self.arc_entities,
            EntityType::Ellipse => self.ellipse_entities,
            EntityType::Other => self.other_entities,
        }
    }

    fn counter_mut(&mut self, entity_type: EntityType) -> &mut usize {
        match entity_type {
            EntityType::Text => &mut self.text_entities,
            EntityType::Mtext => &mut self.mtext_entities,
            EntityType::Dimension => &mut self.dimension_entities,
            EntityType::Line => &mut self.line_entities,
            EntityType::Circle => &mut self.circle_entities,
            EntityType::Arc => &mut self.arc_entities,
            EntityType::Ellipse => &mut self.ellipse_entities,
            EntityType::Other => &mut self.other_entities,
        }
    }
}

/// Canonical description of one drawing sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub file_id: String,
    pub sheet_id: String,
    pub source_file: String,
    pub conversion_status: ConversionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub units: String,
    pub scale: f64,
    pub dxf_version: String,
    pub extents: Extents,
    pub entities: Vec<Entity>,
    pub layers: Vec<String>,
    pub statistics: Statistics,
}

impl Manifest {
    /// Entity-empty manifest for a drawing that could not be converted or parsed.
    pub fn failed(
        file_id: impl Into<String>,
        sheet_id: impl Into<String>,
        source_file: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "drawing could not be processed".to_string();
        }
        Self {
            file_id: file_id.into(),
            sheet_id: sheet_id.into(),
            source_file: source_file.into(),
            conversion_status: ConversionStatus::ConversionFailed,
            error_message: Some(message),
            units: "unknown".to_string(),
            scale: 1.0,
            dxf_version: "unknown".to_string(),
            extents: Extents::ZERO,
            entities: Vec::new(),
            layers: Vec::new(),
            statistics: Statistics::default(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.conversion_status == ConversionStatus::ConversionFailed
    }

    /// Number of entities carrying text (TEXT + MTEXT + DIMENSION).
    pub fn text_entity_count(&self) -> usize {
        self.statistics.text_entities
            + self.statistics.mtext_entities
            + self.statistics.dimension_entities
    }

    /// List every broken data-model invariant; empty for a well-formed manifest.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let stats = &self.statistics;

        if stats.total_entities != self.entities.len() {
            problems.push(format!(
                "total_entities {} != entities.len() {}",
                stats.total_entities,
                self.entities.len()
            ));
        }
        for ty in [
            EntityType::Text,
            EntityType::Mtext,
            EntityType::Dimension,
            EntityType::Line,
            EntityType::Circle,
            EntityType::Arc,
            EntityType::Ellipse,
            EntityType::Other,
        ] {
            let actual = self.entities.iter().filter(|e| e.entity_type == ty).count();
            if stats.count_for(ty) != actual {
                problems.push(format!(
                    "{} counter {} != {} entities",
                    ty.as_str(),
                    stats.count_for(ty),
                    actual
                ));
            }
        }
        if self.is_failed() {
            if !self.entities.is_empty() {
                problems.push("conversion_failed manifest has entities".to_string());
            }
            if self.error_message.as_deref().map_or(true, str::is_empty) {
                problems.push("conversion_failed manifest lacks error_message".to_string());
            }
        }
        if self.extents.min[0] > self.extents.max[0] || self.extents.min[1] > self.extents.max[1] {
            problems.push("extents.min exceeds extents.max".to_string());
        }
        for entity in &self.entities {
            if !self.extents.contains(&entity.bbox_world) {
                problems.push(format!("{} bbox_world outside extents", entity.id));
            }
            if entity
                .bbox_norm
                .iter()
                .any(|v| !v.is_finite() || *v < 0.0 || *v > 1.0)
            {
                problems.push(format!("{} bbox_norm outside [0,1]", entity.id));
            }
        }
        problems
    }
}

// ── Ingestion output ─────────────────────────────────────────────────────

/// Everything one upload produces.
///
/// `manifest` is always present, even for corrupt files. The render and the
/// feature set are optional: a render failure leaves the manifest valid and
/// records the reason in `render_error`.
#[derive(Debug, Clone)]
pub struct IngestOutput {
    pub manifest: Manifest,
    pub render: Option<RenderHandle>,
    pub render_error: Option<RenderError>,
    /// Greyscale raster of the drawing, attached to vision prompts.
    pub raster: Option<GrayImage>,
    pub features: Option<CvFeatureSet>,
    pub validation: Option<ValidationReport>,
    pub text: TextExtract,
}

// ── Analysis ─────────────────────────────────────────────────────────────

/// Which analysis produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Five-stage vision walkthrough.
    MultiStage,
    /// Single-call deterministic-features + text-model analysis.
    Hybrid,
}

/// Named analysis stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Overview,
    ComponentIdentification,
    MeasurementExtraction,
    CrossReferencing,
    Synthesis,
    /// The single stage of the hybrid path.
    Fusion,
}

impl StageKind {
    /// The four analysis stages that precede synthesis, in order.
    pub const ANALYSIS: [StageKind; 4] = [
        StageKind::Overview,
        StageKind::ComponentIdentification,
        StageKind::MeasurementExtraction,
        StageKind::CrossReferencing,
    ];

    pub fn title(self) -> &'static str {
        match self {
            StageKind::Overview => "Overview",
            StageKind::ComponentIdentification => "Component identification",
            StageKind::MeasurementExtraction => "Measurement extraction",
            StageKind::CrossReferencing => "Cross-referencing",
            StageKind::Synthesis => "Synthesis",
            StageKind::Fusion => "Hybrid fusion",
        }
    }

    /// Stages 1–4 attach the drawing image; synthesis and fusion are text-only.
    pub fn wants_image(self) -> bool {
        !matches!(self, StageKind::Synthesis | StageKind::Fusion)
    }
}

/// Output of one completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage: StageKind,
    /// Registry id of the model that served this stage.
    pub model_used: String,
    pub provider: Provider,
    pub text: String,
    /// Calls issued for this stage across all models, including the successful one.
    pub attempts: u32,
    pub duration_ms: u64,
}

/// One failed provider call, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub stage: StageKind,
    pub model_id: String,
    pub kind: String,
    pub detail: String,
}

/// Result of a multi-stage or hybrid analysis.
///
/// Not persisted by the core; the caller owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub file_id: String,
    pub mode: AnalysisMode,
    /// Completed stages, in execution order.
    pub stages: Vec<StageOutput>,
    /// `true` when at least one stage could not be served.
    pub degraded: bool,
    pub synthesis: String,
    #[serde(default)]
    pub failures: Vec<AttemptFailure>,
    pub duration_ms: u64,
}

impl AnalysisResult {
    /// Model that served `stage`, if it completed.
    pub fn model_for(&self, stage: StageKind) -> Option<&str> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.model_used.as_str())
    }

    pub fn completed_stages(&self) -> usize {
        self.stages.len()
    }

    /// Plain-text rendition for the text indexer.
    pub fn format_for_index(&self) -> String {
        let mut out = String::new();
        let mode = match self.mode {
            AnalysisMode::MultiStage => "multi-stage",
            AnalysisMode::Hybrid => "hybrid",
        };
        out.push_str(&format!("CAD ANALYSIS ({mode}) for {}", self.file_id));
        if self.degraded {
            out.push_str(" [DEGRADED: some stages unavailable]");
        }
        out.push_str("\n\n");
        if !self.synthesis.is_empty() {
            out.push_str(&format!("SUMMARY: {}\n\n", self.synthesis.trim()));
        }
        for stage in &self.stages {
            if stage.stage == StageKind::Synthesis {
                continue;
            }
            out.push_str(&format!(
                "{} (via {}): {}\n\n",
                stage.stage.title().to_uppercase(),
                stage.model_used,
                stage.text.trim()
            ));
        }
        out.trim_end().to_string()
    }
}
