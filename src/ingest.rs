//! Ingestion entry points: upload → manifest, render, features.
//!
//! Ingestion never fails. A drawing that cannot be converted or parsed
//! yields an entity-empty `conversion_failed` manifest; a drawing that
//! cannot be rendered keeps its manifest and records `render_error`.
//!
//! Parsing, rendering and feature extraction are CPU-bound and run on the
//! blocking pool, so concurrent ingestions and analyses on the async
//! runtime are not starved.

use crate::config::PipelineConfig;
use crate::error::RenderError;
use crate::output::{AnalysisResult, IngestOutput, Manifest};
use crate::pipeline::features::{extract_features, validate_manifest};
use crate::pipeline::input::{normalize_input, NormalizedInput, Upload};
use crate::pipeline::manifest::{build_manifest, extract_text};
use crate::pipeline::ocr::OcrEngine;
use crate::pipeline::raster::rasterize;
use crate::pipeline::render::{render_svg, RenderLimits, RenderStore};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Sink for extracted text, e.g. a search index.
#[async_trait]
pub trait TextIndexer: Send + Sync {
    async fn index(&self, file_id: &str, text: &str, metadata: &BTreeMap<String, serde_json::Value>);
}

/// Ingest one upload.
pub async fn ingest(upload: &Upload, file_id: &str, config: &PipelineConfig) -> IngestOutput {
    let start = Instant::now();
    info!(file_id, file = %upload.file_name(), "ingesting drawing");

    let normalized = normalize_input(upload, config).await;
    let job = BlockingJob {
        file_id: file_id.to_string(),
        sheet_id: config.sheet_id.clone(),
        limits: RenderLimits::from(config),
        raster_max_pixels: config.raster_max_pixels,
        render_dir: config.render_dir.clone(),
        skip_features: config.skip_features,
        ocr: Arc::clone(&config.ocr),
    };
    let source_file = normalized.source_file.clone();

    let output = match tokio::task::spawn_blocking(move || job.run(normalized)).await {
        Ok(output) => output,
        Err(e) => {
            error!(file_id, "ingestion task failed: {e}");
            let manifest = Manifest::failed(
                file_id,
                &config.sheet_id,
                source_file,
                format!("internal error while processing the drawing: {e}"),
            );
            IngestOutput {
                text: extract_text(&manifest, true),
                manifest,
                render: None,
                render_error: None,
                raster: None,
                features: None,
                validation: None,
            }
        }
    };

    info!(
        file_id,
        status = ?output.manifest.conversion_status,
        entities = output.manifest.entities.len(),
        rendered = output.render.is_some(),
        duration_ms = start.elapsed().as_millis() as u64,
        "ingestion finished"
    );
    output
}

/// Ingest several uploads concurrently, at most `config.concurrency` at a
/// time. Output order matches input order.
pub async fn ingest_many(uploads: &[(Upload, String)], config: &PipelineConfig) -> Vec<IngestOutput> {
    let mut results: Vec<(usize, IngestOutput)> = stream::iter(uploads.iter().enumerate().map(
        |(idx, (upload, file_id))| async move { (idx, ingest(upload, file_id, config).await) },
    ))
    .buffer_unordered(config.concurrency.max(1))
    .collect()
    .await;
    results.sort_by_key(|(idx, _)| *idx);
    results.into_iter().map(|(_, output)| output).collect()
}

/// Hand a drawing's text view to an indexer. Empty text is not indexed.
pub async fn index_text(output: &IngestOutput, indexer: &dyn TextIndexer) {
    if output.text.text.is_empty() {
        debug!(file_id = %output.manifest.file_id, "no drawing text to index");
        return;
    }
    indexer
        .index(&output.manifest.file_id, &output.text.text, &output.text.metadata)
        .await;
}

/// Hand an analysis to an indexer as plain text.
pub async fn index_analysis(result: &AnalysisResult, indexer: &dyn TextIndexer) {
    let mut metadata = BTreeMap::new();
    metadata.insert("kind".to_string(), serde_json::json!("cad_analysis"));
    metadata.insert("mode".to_string(), serde_json::to_value(result.mode).unwrap_or_default());
    metadata.insert("degraded".to_string(), serde_json::json!(result.degraded));
    indexer
        .index(&result.file_id, &result.format_for_index(), &metadata)
        .await;
}

/// Everything the blocking half of ingestion needs, owned.
struct BlockingJob {
    file_id: String,
    sheet_id: String,
    limits: RenderLimits,
    raster_max_pixels: u32,
    render_dir: Option<PathBuf>,
    skip_features: bool,
    ocr: Arc<dyn OcrEngine>,
}

impl BlockingJob {
    fn run(self, normalized: NormalizedInput) -> IngestOutput {
        let (manifest, drawing) = build_manifest(&normalized, &self.file_id, &self.sheet_id);
        // Staged files are no longer needed once parsed.
        drop(normalized);

        let text = extract_text(&manifest, true);
        let mut output = IngestOutput {
            manifest,
            render: None,
            render_error: None,
            raster: None,
            features: None,
            validation: None,
            text,
        };
        let Some(drawing) = drawing else {
            return output;
        };

        match render_svg(&self.file_id, &drawing, &output.manifest.extents, &self.limits) {
            Ok(mut handle) => {
                if let Some(dir) = &self.render_dir {
                    if let Err(e) = RenderStore::new(dir).save(&mut handle) {
                        warn!(file_id = %self.file_id, "could not store render: {e}");
                        output.render_error = Some(RenderError::Backend {
                            detail: e.to_string(),
                        });
                    }
                }
                output.render = Some(handle);
            }
            Err(e) => {
                warn!(file_id = %self.file_id, "render failed: {e}");
                output.render_error = Some(e);
            }
        }

        match rasterize(&drawing, &output.manifest.extents, self.raster_max_pixels) {
            Ok(raster) => {
                if !self.skip_features {
                    let features = extract_features(&raster, self.ocr.as_ref());
                    output.validation = Some(validate_manifest(&output.manifest, &features));
                    output.features = Some(features);
                }
                output.raster = Some(raster);
            }
            Err(e) => debug!(file_id = %self.file_id, "no raster: {e}"),
        }
        output
    }
}
