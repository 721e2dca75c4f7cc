//! Hybrid analysis: deterministic evidence plus one text-model call.
//!
//! The evidence block combines the parsed-drawing facts, the statistics as
//! JSON, the CV feature report, the validation outcome and the drawing
//! text. One call walks the reasoning-model priority list under the same
//! retry/failover policy as the multi-stage path.

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, FusionError};
use crate::orchestrator::{next_state, select_candidates, stage_output, AnalysisState};
use crate::output::{AnalysisMode, AnalysisResult, IngestOutput, StageKind};
use crate::pipeline::features::format_for_prompt;
use crate::pipeline::llm::{call_with_failover, CallOutcome, ModelRequest};
use crate::prompts::{fusion_prompt, manifest_brief, truncate_chars, SYSTEM_PROMPT};
use crate::registry::{Capability, ModelRegistry};
use std::time::Instant;
use tracing::{info, warn};

const DRAWING_TEXT_CHARS: usize = 4000;

/// Serialise everything deterministic about a drawing into prompt text.
pub fn build_evidence(ingest: &IngestOutput) -> Result<String, FusionError> {
    let manifest = &ingest.manifest;
    let has_features = ingest.features.as_ref().is_some_and(|f| {
        !f.text_items.is_empty() || f.lines.total > 0 || f.circles > 0 || f.arcs > 0
    });
    if manifest.entities.is_empty() && !has_features && ingest.text.text.trim().is_empty() {
        return Err(FusionError::NoEvidence {
            file_id: manifest.file_id.clone(),
            detail: manifest
                .error_message
                .clone()
                .unwrap_or_else(|| "drawing has no entities and no detected features".to_string()),
        });
    }

    let stats = serde_json::to_string_pretty(&manifest.statistics)
        .map_err(|e| FusionError::Serialisation(e.to_string()))?;

    let mut out = manifest_brief(manifest);
    out.push_str("\n\nSTATISTICS (JSON)\n");
    out.push_str(&stats);

    if let Some(features) = &ingest.features {
        out.push_str("\n\n");
        out.push_str(&format_for_prompt(features));
    }

    if let Some(report) = &ingest.validation {
        out.push_str("\nVALIDATION\n");
        if report.discrepancies.is_empty() {
            out.push_str("- Parsed counts agree with the image analysis.\n");
        }
        for d in &report.discrepancies {
            out.push_str(&format!(
                "- {}: parsed {}, detected {}\n",
                d.metric, d.parsed, d.detected
            ));
        }
        if let Some(agreement) = report.text_agreement {
            out.push_str(&format!(
                "- OCR read {:.0}% of the parsed text.\n",
                agreement * 100.0
            ));
        }
    }

    if !ingest.text.text.trim().is_empty() {
        out.push_str("\nDRAWING TEXT (parsed)\n");
        out.push_str(&truncate_chars(ingest.text.text.trim(), DRAWING_TEXT_CHARS));
    }
    Ok(out)
}

/// Run the single-call hybrid analysis.
pub async fn analyze_hybrid(
    ingest: &IngestOutput,
    registry: &ModelRegistry,
    config: &AnalysisConfig,
) -> Result<AnalysisResult, AnalysisError> {
    let start = Instant::now();
    let file_id = ingest.manifest.file_id.clone();
    let evidence = build_evidence(ingest)?;
    // Any model can read text, so explicit selection is not capability-checked.
    let candidates = select_candidates(registry, config, Capability::Reasoning, false)?;
    let callback = &config.progress_callback;

    info!(
        file_id = %file_id,
        evidence_chars = evidence.len(),
        candidates = candidates.len(),
        "starting hybrid analysis"
    );
    callback.on_analysis_start(&file_id, 1);
    if config.cancellation.is_cancelled() {
        return Err(AnalysisError::Cancelled { completed_stages: 0 });
    }
    callback.on_stage_start(StageKind::Fusion);

    let request = ModelRequest::new(SYSTEM_PROMPT, fusion_prompt(&evidence), config);
    let mut failures = Vec::new();
    let outcome = call_with_failover(StageKind::Fusion, &candidates, &request, config, &mut failures).await;

    let (stages, synthesis, state) = match outcome {
        CallOutcome::Served(served) => {
            callback.on_stage_complete(StageKind::Fusion, &served.model.id, served.text.len());
            let text = served.text.clone();
            (
                vec![stage_output(StageKind::Fusion, served)],
                text,
                next_state(StageKind::Fusion, true, false),
            )
        }
        CallOutcome::Exhausted { reached: false, .. } => {
            return Err(AnalysisError::Unavailable {
                reason: format!("none of the {} candidate model(s) could be reached", candidates.len()),
            })
        }
        CallOutcome::Exhausted { attempts, .. } => {
            let reason = format!("all {} candidate model(s) failed after {attempts} attempt(s)", candidates.len());
            warn!(file_id = %file_id, "{reason}");
            callback.on_degraded(StageKind::Fusion, &reason);
            let synthesis = format!(
                "Model analysis unavailable ({reason}). Deterministic evidence follows.\n\n{evidence}"
            );
            (Vec::new(), synthesis, next_state(StageKind::Fusion, false, true))
        }
        CallOutcome::Cancelled => return Err(AnalysisError::Cancelled { completed_stages: 0 }),
    };

    let result = AnalysisResult {
        file_id,
        mode: AnalysisMode::Hybrid,
        stages,
        degraded: state == AnalysisState::Degraded,
        synthesis,
        failures,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    info!(file_id = %result.file_id, degraded = result.degraded, "hybrid analysis finished");
    callback.on_analysis_complete(result.completed_stages(), result.degraded);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Manifest;
    use crate::pipeline::manifest::TextExtract;

    fn ingest(manifest: Manifest, text: &str) -> IngestOutput {
        IngestOutput {
            manifest,
            render: None,
            render_error: None,
            raster: None,
            features: None,
            validation: None,
            text: TextExtract {
                text: text.to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn failed_manifest_without_features_has_no_evidence() {
        let out = ingest(Manifest::failed("f1", "Model", "x.dwg", "source version AC1009 unsupported"), "");
        match build_evidence(&out) {
            Err(FusionError::NoEvidence { file_id, detail }) => {
                assert_eq!(file_id, "f1");
                assert!(detail.contains("AC1009"));
            }
            other => panic!("expected NoEvidence, got {other:?}"),
        }
    }

    #[test]
    fn evidence_includes_statistics_and_text() {
        let out = ingest(Manifest::failed("f1", "Model", "x.dxf", "bad"), "[TEXT] GEAR HOUSING");
        let evidence = build_evidence(&out).unwrap();
        assert!(evidence.contains("\"total_entities\": 0"));
        assert!(evidence.contains("GEAR HOUSING"));
    }
}
