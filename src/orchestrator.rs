//! Five-stage vision analysis.
//!
//! The run is an explicit state machine:
//!
//! ```text
//! Overview ─▶ ComponentIdentification ─▶ MeasurementExtraction ─▶ CrossReferencing ─▶ Synthesis ─▶ Done
//!     │                 │                          │                      │               │
//!     └──── exhausted ──┴──────────────────────────┴──────────────────────┘               │
//!                         (skip to Synthesis, degraded)                                    ▼
//!                                                                         exhausted ─▶ Degraded
//! ```
//!
//! Each stage walks the same candidate list through
//! [`call_with_failover`], so retry and failover behave identically at every
//! stage. Stages run strictly in order because each prompt embeds the
//! earlier findings.

use crate::config::{AnalysisConfig, ModelSelection};
use crate::error::AnalysisError;
use crate::output::{AnalysisMode, AnalysisResult, IngestOutput, Manifest, StageKind, StageOutput};
use crate::pipeline::encode::encode_drawing;
use crate::pipeline::llm::{call_with_failover, CallOutcome, ModelRequest, Served};
use crate::prompts::{manifest_brief, stage_prompt, SYSTEM_PROMPT};
use crate::registry::{Capability, ModelDescriptor, ModelRegistry};
use std::time::Instant;
use tracing::{info, warn};

/// States of one multi-stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisState {
    Stage(StageKind),
    /// Every stage was served.
    Done,
    /// At least one stage was not served; the result carries `degraded`.
    Degraded,
}

impl AnalysisState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AnalysisState::Done | AnalysisState::Degraded)
    }
}

/// Transition after `stage` finished, served or exhausted.
///
/// An exhausted analysis stage skips straight to Synthesis; Synthesis ends
/// in `Degraded` whenever anything before it (or itself) was not served.
pub fn next_state(stage: StageKind, served: bool, degraded_so_far: bool) -> AnalysisState {
    match (stage, served) {
        (StageKind::Synthesis, true) if !degraded_so_far => AnalysisState::Done,
        (StageKind::Synthesis, _) => AnalysisState::Degraded,
        (StageKind::Fusion, true) => AnalysisState::Done,
        (StageKind::Fusion, false) => AnalysisState::Degraded,
        (_, false) => AnalysisState::Stage(StageKind::Synthesis),
        (stage, true) => {
            let position = StageKind::ANALYSIS.iter().position(|s| *s == stage);
            match position.and_then(|i| StageKind::ANALYSIS.get(i + 1)) {
                Some(next) => AnalysisState::Stage(*next),
                None => AnalysisState::Stage(StageKind::Synthesis),
            }
        }
    }
}

/// Build the ordered candidate list for a run.
///
/// Explicit selection puts the named model first (it must exist, and must
/// support `capability` when `enforce_capability` is set); with fallback
/// enabled the automatic priority list follows. Automatic selection is the
/// registry's priority list for `capability`.
pub fn select_candidates(
    registry: &ModelRegistry,
    config: &AnalysisConfig,
    capability: Capability,
    enforce_capability: bool,
) -> Result<Vec<ModelDescriptor>, AnalysisError> {
    let automatic = || -> Vec<ModelDescriptor> {
        registry
            .priority_list(capability, &config.health)
            .into_iter()
            .cloned()
            .collect()
    };

    let candidates = match &config.selection {
        ModelSelection::Automatic => automatic(),
        ModelSelection::Explicit {
            model_id,
            allow_fallback,
        } => {
            let chosen = registry
                .get(model_id)
                .ok_or_else(|| AnalysisError::UnknownModel {
                    model_id: model_id.clone(),
                })?;
            if enforce_capability && !chosen.supports(capability) {
                return Err(AnalysisError::ModelLacksCapability {
                    model_id: model_id.clone(),
                    capability: capability.to_string(),
                });
            }
            let mut list = vec![chosen.clone()];
            if *allow_fallback {
                list.extend(automatic().into_iter().filter(|m| m.id != chosen.id));
            }
            list
        }
    };

    if candidates.is_empty() {
        return Err(AnalysisError::Unavailable {
            reason: format!("no registered model supports {capability}"),
        });
    }
    Ok(candidates)
}

/// Run the five-stage vision analysis over an ingested drawing.
///
/// Provider exhaustion never fails the call: the result comes back with
/// `degraded = true` and whatever stages completed. Errors are reserved
/// for bad selections, a run where no provider could be reached at all,
/// and cancellation.
pub async fn analyze_multi_stage(
    ingest: &IngestOutput,
    registry: &ModelRegistry,
    config: &AnalysisConfig,
) -> Result<AnalysisResult, AnalysisError> {
    let start = Instant::now();
    let manifest = &ingest.manifest;
    let candidates = select_candidates(registry, config, Capability::Vision, true)?;
    let callback = &config.progress_callback;

    info!(
        file_id = %manifest.file_id,
        candidates = ?candidates.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        "starting multi-stage analysis"
    );
    callback.on_analysis_start(&manifest.file_id, StageKind::ANALYSIS.len() + 1);

    let image = match &ingest.raster {
        Some(raster) => match encode_drawing(raster) {
            Ok(img) => Some(img),
            Err(e) => {
                warn!(file_id = %manifest.file_id, "drawing image unavailable, stages run text-only: {e}");
                None
            }
        },
        None => None,
    };

    let mut state = AnalysisState::Stage(StageKind::Overview);
    let mut stages: Vec<StageOutput> = Vec::new();
    let mut failures = Vec::new();
    let mut degraded = false;
    let mut reached_any = false;
    let mut synthesis: Option<String> = None;

    while let AnalysisState::Stage(stage) = state {
        if config.cancellation.is_cancelled() {
            return Err(cancelled(&stages));
        }
        callback.on_stage_start(stage);

        let prompt = stage_prompt(stage, manifest, &ingest.text.text, &stages);
        let request = ModelRequest::new(SYSTEM_PROMPT, prompt, config)
            .with_image(if stage.wants_image() { image.clone() } else { None });

        match call_with_failover(stage, &candidates, &request, config, &mut failures).await {
            CallOutcome::Served(served) => {
                reached_any = true;
                callback.on_stage_complete(stage, &served.model.id, served.text.len());
                if stage == StageKind::Synthesis {
                    synthesis = Some(served.text.clone());
                }
                stages.push(stage_output(stage, served));
                state = next_state(stage, true, degraded);
            }
            CallOutcome::Exhausted { attempts, reached } => {
                reached_any |= reached;
                if !reached_any {
                    return Err(AnalysisError::Unavailable {
                        reason: format!(
                            "none of the {} candidate model(s) could be reached",
                            candidates.len()
                        ),
                    });
                }
                degraded = true;
                let reason = format!("all {} candidate model(s) failed after {attempts} attempt(s)", candidates.len());
                warn!(file_id = %manifest.file_id, stage = ?stage, "{reason}");
                callback.on_degraded(stage, &reason);
                state = next_state(stage, false, degraded);
            }
            CallOutcome::Cancelled => return Err(cancelled(&stages)),
        }
    }

    let synthesis = synthesis.unwrap_or_else(|| local_synthesis(manifest, &stages));
    let result = AnalysisResult {
        file_id: manifest.file_id.clone(),
        mode: AnalysisMode::MultiStage,
        degraded: state == AnalysisState::Degraded,
        stages,
        synthesis,
        failures,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    info!(
        file_id = %result.file_id,
        completed = result.completed_stages(),
        degraded = result.degraded,
        duration_ms = result.duration_ms,
        "multi-stage analysis finished"
    );
    callback.on_analysis_complete(result.completed_stages(), result.degraded);
    Ok(result)
}

/// Run the analysis `mode` selects.
pub async fn analyze(
    ingest: &IngestOutput,
    registry: &ModelRegistry,
    mode: AnalysisMode,
    config: &AnalysisConfig,
) -> Result<AnalysisResult, AnalysisError> {
    match mode {
        AnalysisMode::MultiStage => analyze_multi_stage(ingest, registry, config).await,
        AnalysisMode::Hybrid => crate::hybrid::analyze_hybrid(ingest, registry, config).await,
    }
}

pub(crate) fn stage_output(stage: StageKind, served: Served) -> StageOutput {
    StageOutput {
        stage,
        model_used: served.model.id,
        provider: served.model.provider,
        text: served.text,
        attempts: served.attempts,
        duration_ms: served.duration_ms,
    }
}

fn cancelled(stages: &[StageOutput]) -> AnalysisError {
    info!(completed = stages.len(), "analysis cancelled");
    AnalysisError::Cancelled {
        completed_stages: stages.len(),
    }
}

/// Synthesis assembled without a model, used when Synthesis itself could
/// not be served.
fn local_synthesis(manifest: &Manifest, stages: &[StageOutput]) -> String {
    if stages.is_empty() {
        return format!(
            "No analysis stage could be completed; only the parsed drawing facts are available.\n\n{}",
            manifest_brief(manifest)
        );
    }
    let mut out = format!(
        "Partial analysis: {} of {} stages completed.",
        stages.len(),
        StageKind::ANALYSIS.len() + 1
    );
    for s in stages {
        out.push_str(&format!("\n\n{}:\n{}", s.stage.title(), s.text.trim()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CostTier, Provider, ProviderHealth};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn model(id: &str, caps: &[Capability], priority: u32) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            name: id.into(),
            provider: Provider::OpenRouter,
            api_model: None,
            capabilities: caps.iter().copied().collect::<BTreeSet<_>>(),
            context_tokens: 32_768,
            cost_tier: CostTier::Free,
            priority,
        }
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::new(vec![
            model("vis-a", &[Capability::Vision], 10),
            model("vis-b", &[Capability::Vision], 20),
            model("txt", &[Capability::Reasoning], 30),
        ])
        .unwrap()
    }

    fn config(selection: ModelSelection) -> AnalysisConfig {
        AnalysisConfig::builder()
            .selection(selection)
            .health(Arc::new(ProviderHealth::default()))
            .build()
            .unwrap()
    }

    #[test]
    fn happy_path_walks_all_stages() {
        let mut state = AnalysisState::Stage(StageKind::Overview);
        let mut seen = Vec::new();
        while let AnalysisState::Stage(s) = state {
            seen.push(s);
            state = next_state(s, true, false);
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[4], StageKind::Synthesis);
        assert_eq!(state, AnalysisState::Done);
    }

    #[test]
    fn exhaustion_skips_to_synthesis_and_stays_degraded() {
        assert_eq!(
            next_state(StageKind::ComponentIdentification, false, true),
            AnalysisState::Stage(StageKind::Synthesis)
        );
        assert_eq!(next_state(StageKind::Synthesis, true, true), AnalysisState::Degraded);
        assert_eq!(next_state(StageKind::Synthesis, false, false), AnalysisState::Degraded);
        assert!(AnalysisState::Degraded.is_terminal());
    }

    #[test]
    fn automatic_selection_filters_by_capability() {
        let ids: Vec<String> = select_candidates(&registry(), &config(ModelSelection::Automatic), Capability::Vision, true)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["vis-a", "vis-b"]);
    }

    #[test]
    fn explicit_selection_goes_first_then_falls_back() {
        let ids: Vec<String> = select_candidates(
            &registry(),
            &config(ModelSelection::explicit("vis-b")),
            Capability::Vision,
            true,
        )
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
        assert_eq!(ids, ["vis-b", "vis-a"]);

        let only = select_candidates(&registry(), &config(ModelSelection::only("vis-b")), Capability::Vision, true).unwrap();
        assert_eq!(only.len(), 1);
    }

    #[test]
    fn explicit_selection_errors() {
        let unknown = select_candidates(&registry(), &config(ModelSelection::explicit("nope")), Capability::Vision, true);
        assert!(matches!(unknown, Err(AnalysisError::UnknownModel { .. })));

        let lacking = select_candidates(&registry(), &config(ModelSelection::explicit("txt")), Capability::Vision, true);
        assert!(matches!(lacking, Err(AnalysisError::ModelLacksCapability { .. })));

        // Text models may still serve capability-agnostic callers.
        assert!(select_candidates(&registry(), &config(ModelSelection::explicit("txt")), Capability::Vision, false).is_ok());
    }

    #[test]
    fn empty_priority_list_is_unavailable() {
        let reg = ModelRegistry::new(vec![model("txt", &[Capability::Reasoning], 1)]).unwrap();
        let r = select_candidates(&reg, &config(ModelSelection::Automatic), Capability::Vision, true);
        assert!(matches!(r, Err(AnalysisError::Unavailable { .. })));
    }

    #[test]
    fn local_synthesis_mentions_partial_progress() {
        let m = Manifest::failed("f", "Model", "a.dxf", "bad");
        assert!(local_synthesis(&m, &[]).contains("No analysis stage"));
        let s = StageOutput {
            stage: StageKind::Overview,
            model_used: "vis-a".into(),
            provider: Provider::OpenRouter,
            text: "A bracket.".into(),
            attempts: 1,
            duration_ms: 5,
        };
        let text = local_synthesis(&m, &[s]);
        assert!(text.contains("1 of 5"));
        assert!(text.contains("A bracket."));
    }
}
