//! Progress-callback trait for per-stage analysis events.
//!
//! Inject an [`Arc<dyn AnalysisProgressCallback>`] via
//! [`crate::config::AnalysisConfigBuilder::progress_callback`] to receive
//! events as the orchestrator walks its stages.
//!
//! # Example
//!
//! ```rust
//! use edgequake_cad::{AnalysisConfig, AnalysisProgressCallback, StageKind};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl AnalysisProgressCallback for CountingCallback {
//!     fn on_stage_complete(&self, stage: StageKind, model_id: &str, text_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{} done via {model_id} ({text_len} bytes)", stage.title());
//!     }
//! }
//!
//! let config = AnalysisConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! # let _ = config;
//! ```

use crate::output::StageKind;
use std::sync::Arc;

/// Called by the orchestrator and the fusion engine.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Calls come from the task driving the analysis.
pub trait AnalysisProgressCallback: Send + Sync {
    /// Called once before the first stage.
    fn on_analysis_start(&self, file_id: &str, total_stages: usize) {
        let _ = (file_id, total_stages);
    }

    /// Called when a stage begins.
    fn on_stage_start(&self, stage: StageKind) {
        let _ = stage;
    }

    /// Called when a stage has been served.
    fn on_stage_complete(&self, stage: StageKind, model_id: &str, text_len: usize) {
        let _ = (stage, model_id, text_len);
    }

    /// Called when a model is abandoned for the next candidate.
    fn on_failover(&self, stage: StageKind, from_model: &str, reason: &str) {
        let _ = (stage, from_model, reason);
    }

    /// Called when every candidate failed for `stage`.
    fn on_degraded(&self, stage: StageKind, reason: &str) {
        let _ = (stage, reason);
    }

    /// Called once at the end with the number of stages served.
    fn on_analysis_complete(&self, completed_stages: usize, degraded: bool) {
        let _ = (completed_stages, degraded);
    }
}

/// A no-op implementation, the default when no callback is configured.
pub struct NoopProgressCallback;

impl AnalysisProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::AnalysisConfig`].
pub type ProgressCallback = Arc<dyn AnalysisProgressCallback>;
