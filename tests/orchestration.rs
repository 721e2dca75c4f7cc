//! Integration tests for multi-stage and hybrid analysis.
//!
//! Model providers are replaced by a scripted [`ClientFactory`]: each model
//! id maps to a behaviour, so failover, retry, degradation and cancellation
//! run exactly as they would against live endpoints, without network I/O.

use async_trait::async_trait;
use edgequake_cad::{
    analyze, analyze_hybrid, analyze_multi_stage, ingest, AnalysisConfig, AnalysisError, AnalysisMode,
    AnalysisProgressCallback, Cancellation, Capability, ClientFactory, CostTier, FusionError, IngestOutput,
    ModelClient, ModelDescriptor, ModelProviderError, ModelRegistry, ModelReply, ModelRequest, ModelSelection,
    NoOcr, PipelineConfig, Provider, ProviderHealth, StageKind, Upload,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Scripted providers ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
enum Behaviour {
    Ok,
    Quota,
    Auth,
    TimeoutError,
    /// Sleeps past the per-call timeout.
    Hang,
    /// Fails `n` times with a transient error, then answers.
    FlakyThenOk(usize),
    Empty,
    /// Answers only requests that carry no image.
    TextOnly,
}

struct ScriptedClient {
    id: String,
    behaviour: Behaviour,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, ModelProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let model = self.id.clone();
        let ok = || {
            Ok(ModelReply {
                text: format!("{} answer {}", self.id, call + 1),
                prompt_tokens: request.prompt.len() / 4,
                completion_tokens: 8,
            })
        };
        match self.behaviour {
            Behaviour::Ok => ok(),
            Behaviour::Quota => Err(ModelProviderError::QuotaExceeded {
                model,
                detail: "429 free tier exhausted".into(),
            }),
            Behaviour::Auth => Err(ModelProviderError::Auth {
                model,
                detail: "401 invalid api key".into(),
            }),
            Behaviour::TimeoutError => Err(ModelProviderError::Timeout { model, secs: 1 }),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                ok()
            }
            Behaviour::FlakyThenOk(n) if call < n => Err(ModelProviderError::Transient {
                model,
                detail: "503 overloaded".into(),
            }),
            Behaviour::FlakyThenOk(_) => ok(),
            Behaviour::Empty => Ok(ModelReply::default()),
            Behaviour::TextOnly if request.image.is_none() => ok(),
            Behaviour::TextOnly => Err(ModelProviderError::InvalidResponse {
                model,
                detail: "cannot read images".into(),
            }),
        }
    }
}

/// Maps model ids to behaviours and counts calls per id.
#[derive(Default)]
struct ScriptedFactory {
    script: HashMap<String, Behaviour>,
    calls: Mutex<HashMap<String, Arc<AtomicUsize>>>,
    /// When set, no client can be created at all.
    unreachable: bool,
}

impl ScriptedFactory {
    fn new(script: &[(&str, Behaviour)]) -> Arc<Self> {
        Arc::new(Self {
            script: script.iter().map(|(id, b)| (id.to_string(), *b)).collect(),
            ..Default::default()
        })
    }

    fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            unreachable: true,
            ..Default::default()
        })
    }

    fn calls(&self, id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl ClientFactory for ScriptedFactory {
    fn create(&self, model: &ModelDescriptor) -> Result<Arc<dyn ModelClient>, ModelProviderError> {
        if self.unreachable {
            return Err(ModelProviderError::Auth {
                model: model.id.clone(),
                detail: "no API key configured".into(),
            });
        }
        let behaviour = self.script.get(&model.id).copied().unwrap_or(Behaviour::Ok);
        let calls = Arc::clone(
            self.calls
                .lock()
                .unwrap()
                .entry(model.id.clone())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0))),
        );
        Ok(Arc::new(ScriptedClient {
            id: model.id.clone(),
            behaviour,
            calls,
        }))
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn model(id: &str, caps: &[Capability], priority: u32) -> ModelDescriptor {
    ModelDescriptor {
        id: id.into(),
        name: id.to_uppercase(),
        provider: Provider::OpenRouter,
        api_model: None,
        capabilities: caps.iter().copied().collect::<BTreeSet<_>>(),
        context_tokens: 32_768,
        cost_tier: CostTier::Free,
        priority,
    }
}

fn registry(ids: &[&str]) -> ModelRegistry {
    ModelRegistry::new(
        ids.iter()
            .enumerate()
            .map(|(i, id)| model(id, &[Capability::Vision, Capability::Reasoning], (i as u32 + 1) * 10))
            .collect(),
    )
    .unwrap()
}

fn config(factory: Arc<ScriptedFactory>) -> AnalysisConfig {
    AnalysisConfig::builder()
        .client_factory(factory)
        .health(Arc::new(ProviderHealth::default()))
        .max_retries(2)
        .retry_backoff_ms(1)
        .api_timeout_secs(1)
        .build()
        .unwrap()
}

const PART: &str = "0\nSECTION\n2\nENTITIES\n\
0\nLINE\n8\nOUTLINE\n10\n0\n20\n0\n11\n100\n21\n0\n\
0\nLINE\n8\nOUTLINE\n10\n100\n20\n0\n11\n100\n21\n50\n\
0\nCIRCLE\n8\nHOLES\n10\n50\n20\n25\n40\n10\n\
0\nTEXT\n8\nNOTES\n10\n5\n20\n55\n40\n4\n1\nMOUNTING BRACKET\n\
0\nENDSEC\n0\nEOF\n";

async fn ingested() -> IngestOutput {
    let config = PipelineConfig::builder().ocr(Arc::new(NoOcr)).build().unwrap();
    ingest(&Upload::bytes("bracket.dxf", PART), "bracket", &config).await
}

async fn failed_ingest() -> IngestOutput {
    let config = PipelineConfig::builder().ocr(Arc::new(NoOcr)).build().unwrap();
    ingest(&Upload::bytes("old.dwg", b"AC1009\0\0\0\0".to_vec()), "old", &config).await
}

// ── Multi-stage ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn all_stages_served_by_first_model() {
    let factory = ScriptedFactory::new(&[]);
    let out = ingested().await;
    let result = analyze_multi_stage(&out, &registry(&["a", "b"]), &config(factory.clone()))
        .await
        .unwrap();

    assert!(!result.degraded);
    assert_eq!(result.mode, AnalysisMode::MultiStage);
    assert_eq!(result.completed_stages(), 5);
    let order: Vec<StageKind> = result.stages.iter().map(|s| s.stage).collect();
    assert_eq!(
        order,
        [
            StageKind::Overview,
            StageKind::ComponentIdentification,
            StageKind::MeasurementExtraction,
            StageKind::CrossReferencing,
            StageKind::Synthesis,
        ]
    );
    assert!(result.stages.iter().all(|s| s.model_used == "a"));
    assert_eq!(result.synthesis, "a answer 5");
    assert_eq!(factory.calls("b"), 0);
}

#[tokio::test]
async fn quota_then_timeout_fails_over_to_third_model() {
    let factory = ScriptedFactory::new(&[("a", Behaviour::Quota), ("b", Behaviour::TimeoutError)]);
    let out = ingested().await;
    let result = analyze_multi_stage(&out, &registry(&["a", "b", "c"]), &config(factory.clone()))
        .await
        .unwrap();

    assert!(!result.degraded);
    assert_eq!(result.model_for(StageKind::Overview), Some("c"));
    assert_eq!(result.model_for(StageKind::Synthesis), Some("c"));

    // Quota fails over at once; timeouts spend the retry budget first.
    assert_eq!(factory.calls("a"), 5);
    assert_eq!(factory.calls("b"), 5 * 3);
    let overview = &result.stages[0];
    assert_eq!(overview.attempts, 1 + 3 + 1);

    let kinds: Vec<&str> = result
        .failures
        .iter()
        .filter(|f| f.stage == StageKind::Overview)
        .map(|f| f.kind.as_str())
        .collect();
    assert_eq!(kinds, ["quota_exceeded", "timeout", "timeout", "timeout"]);
}

#[tokio::test]
async fn transient_errors_are_retried_on_the_same_model() {
    let factory = ScriptedFactory::new(&[("a", Behaviour::FlakyThenOk(2))]);
    let out = ingested().await;
    let result = analyze_multi_stage(&out, &registry(&["a", "b"]), &config(factory.clone()))
        .await
        .unwrap();

    assert_eq!(result.model_for(StageKind::Overview), Some("a"));
    assert_eq!(result.stages[0].attempts, 3);
    assert_eq!(factory.calls("b"), 0);
}

#[tokio::test]
async fn exhausted_single_model_degrades_with_zero_stages() {
    let factory = ScriptedFactory::new(&[("a", Behaviour::Empty)]);
    let out = ingested().await;
    let result = analyze_multi_stage(&out, &registry(&["a"]), &config(factory))
        .await
        .unwrap();

    assert!(result.degraded);
    assert_eq!(result.completed_stages(), 0);
    assert!(result.synthesis.contains("No analysis stage"));
    assert!(result.failures.iter().all(|f| f.kind == "invalid_response"));
}

#[tokio::test]
async fn partial_progress_is_kept_when_later_stages_fail() {
    // Only text-only calls succeed, so stages 1-4 fail and synthesis is served.
    let factory = ScriptedFactory::new(&[("a", Behaviour::TextOnly)]);
    let out = ingested().await;
    assert!(out.raster.is_some());
    let result = analyze_multi_stage(&out, &registry(&["a"]), &config(factory))
        .await
        .unwrap();

    assert!(result.degraded);
    assert_eq!(result.completed_stages(), 1);
    assert_eq!(result.model_for(StageKind::Synthesis), Some("a"));
}

#[tokio::test]
async fn no_reachable_provider_is_unavailable() {
    let out = ingested().await;
    let err = analyze_multi_stage(&out, &registry(&["a", "b"]), &config(ScriptedFactory::unreachable()))
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Unavailable { .. }), "{err:?}");
}

#[tokio::test]
async fn auth_failure_on_every_model_still_counts_as_reached() {
    let factory = ScriptedFactory::new(&[("a", Behaviour::Auth), ("b", Behaviour::Auth)]);
    let out = ingested().await;
    let result = analyze_multi_stage(&out, &registry(&["a", "b"]), &config(factory))
        .await
        .unwrap();
    assert!(result.degraded);
    assert_eq!(result.completed_stages(), 0);
}

#[tokio::test]
async fn explicit_model_is_tried_first() {
    let factory = ScriptedFactory::new(&[]);
    let out = ingested().await;
    let config = AnalysisConfig::builder()
        .client_factory(factory)
        .health(Arc::new(ProviderHealth::default()))
        .selection(ModelSelection::explicit("b"))
        .build()
        .unwrap();
    let result = analyze_multi_stage(&out, &registry(&["a", "b"]), &config).await.unwrap();
    assert_eq!(result.model_for(StageKind::Overview), Some("b"));

    let unknown = AnalysisConfig::builder()
        .selection(ModelSelection::only("zzz"))
        .build()
        .unwrap();
    let err = analyze_multi_stage(&out, &registry(&["a"]), &unknown).await.unwrap_err();
    assert!(matches!(err, AnalysisError::UnknownModel { .. }));
}

/// Cancels the run as soon as the second stage starts.
struct CancelOnSecondStage {
    token: Cancellation,
    started: AtomicUsize,
}

impl AnalysisProgressCallback for CancelOnSecondStage {
    fn on_stage_start(&self, _stage: StageKind) {
        if self.started.fetch_add(1, Ordering::SeqCst) == 1 {
            self.token.cancel();
        }
    }
}

#[tokio::test]
async fn cancellation_stops_between_stages() {
    let token = Cancellation::new();
    let config = AnalysisConfig::builder()
        .client_factory(ScriptedFactory::new(&[]))
        .health(Arc::new(ProviderHealth::default()))
        .cancellation(token.clone())
        .progress_callback(Arc::new(CancelOnSecondStage {
            token,
            started: AtomicUsize::new(0),
        }))
        .build()
        .unwrap();
    let out = ingested().await;
    let err = analyze_multi_stage(&out, &registry(&["a"]), &config).await.unwrap_err();
    match err {
        AnalysisError::Cancelled { completed_stages } => assert_eq!(completed_stages, 1),
        other => panic!("expected Cancelled, got {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_interrupts_an_in_flight_call() {
    let token = Cancellation::new();
    let config = AnalysisConfig::builder()
        .client_factory(ScriptedFactory::new(&[("a", Behaviour::Hang)]))
        .health(Arc::new(ProviderHealth::default()))
        .api_timeout_secs(30)
        .cancellation(token.clone())
        .build()
        .unwrap();
    let out = ingested().await;
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        analyze_multi_stage(&out, &registry(&["a"]), &config),
    )
    .await
    .expect("cancellation should end the call promptly")
    .unwrap_err();
    canceller.await.unwrap();
    assert!(matches!(err, AnalysisError::Cancelled { completed_stages: 0 }));
}

// ── Hybrid ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn hybrid_makes_one_call() {
    let factory = ScriptedFactory::new(&[]);
    let out = ingested().await;
    let result = analyze(&out, &registry(&["a", "b"]), AnalysisMode::Hybrid, &config(factory.clone()))
        .await
        .unwrap();

    assert_eq!(result.mode, AnalysisMode::Hybrid);
    assert!(!result.degraded);
    assert_eq!(result.completed_stages(), 1);
    assert_eq!(result.stages[0].stage, StageKind::Fusion);
    assert_eq!(result.synthesis, "a answer 1");
    assert_eq!(factory.calls("a"), 1);
}

#[tokio::test]
async fn hybrid_times_out_and_fails_over() {
    let factory = ScriptedFactory::new(&[("a", Behaviour::Hang)]);
    let out = ingested().await;
    let config = AnalysisConfig::builder()
        .client_factory(factory.clone())
        .health(Arc::new(ProviderHealth::default()))
        .max_retries(0)
        .api_timeout_secs(1)
        .build()
        .unwrap();
    let result = analyze_hybrid(&out, &registry(&["a", "b"]), &config).await.unwrap();

    assert_eq!(result.model_for(StageKind::Fusion), Some("b"));
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].kind, "timeout");
}

#[tokio::test]
async fn hybrid_exhaustion_returns_evidence() {
    let factory = ScriptedFactory::new(&[("a", Behaviour::Quota)]);
    let out = ingested().await;
    let result = analyze_hybrid(&out, &registry(&["a"]), &config(factory)).await.unwrap();
    assert!(result.degraded);
    assert!(result.stages.is_empty());
    assert!(result.synthesis.contains("MOUNTING BRACKET"));
}

#[tokio::test]
async fn hybrid_without_evidence_is_a_fusion_error() {
    let out = failed_ingest().await;
    let err = analyze_hybrid(&out, &registry(&["a"]), &config(ScriptedFactory::new(&[])))
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Fusion(FusionError::NoEvidence { .. })), "{err:?}");
}
