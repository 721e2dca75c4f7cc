//! Error types for the edgequake-cad library.
//!
//! Errors fall into three groups that follow the pipeline's propagation rules:
//!
//! * **Stage-local, fail-open**: [`ConversionError`], [`ParseError`] and
//!   [`RenderError`]. These are caught where they happen and folded into a
//!   degraded data object (an entity-empty manifest, or a manifest without a
//!   render). They never escape the ingestion entry points.
//!
//! * **Per-attempt provider failures**: [`ModelProviderError`]. Each variant
//!   carries its retry class; the single policy in
//!   [`crate::pipeline::llm::decide`] turns them into retry / failover steps.
//!
//! * **Caller-visible**: [`CadError`] for library-surface failures (render
//!   store I/O, bad configuration, registry files) and [`AnalysisError`] for
//!   the rare analysis outcomes that cannot even produce a degraded result.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors returned by the library surface.
#[derive(Debug, Error)]
pub enum CadError {
    // ── Render store ──────────────────────────────────────────────────────
    /// Could not write or read a rendered document.
    #[error("render store I/O failed for '{path}': {source}")]
    RenderStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No rendered document is stored under the requested file id.
    #[error("no render stored for file id '{file_id}'")]
    RenderNotFound { file_id: String },

    // ── Registry ──────────────────────────────────────────────────────────
    /// The model registry file could not be read or parsed.
    #[error("invalid model registry: {0}")]
    Registry(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A foreign-format drawing could not be turned into DXF.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    /// The DWG version string is outside the range the converters accept.
    #[error("source version {version} unsupported; re-export the drawing as DXF or as DWG 2000–2018")]
    UnsupportedVersion { version: String },

    /// The file is neither DXF nor a recognisable DWG.
    #[error("unrecognised drawing format '{extension}'; upload a DXF or DWG file")]
    UnknownFormat { extension: String },

    /// Binary DXF is recognised but not parsed.
    #[error("binary DXF is not supported; re-export the drawing as ASCII DXF")]
    BinaryDxf,

    /// No DWG → DXF converter is installed.
    #[error("no DWG converter available (install ODA File Converter or LibreDWG); re-export the drawing as DXF")]
    ConverterUnavailable,

    /// The converter ran but failed or produced no output.
    #[error("DWG conversion failed: {detail}")]
    ConverterFailed { detail: String },

    /// The upload could not be read.
    #[error("could not read upload: {detail}")]
    Unreadable { detail: String },
}

/// Malformed or corrupt DXF content.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("DXF parse error at line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// The vector renderer could not produce a document.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RenderError {
    /// The drawing contains no renderable entity.
    #[error("nothing to render: {detail}")]
    Empty { detail: String },

    /// The rendered document exceeded the configured byte ceiling even after
    /// simplification.
    #[error("rendered SVG is {bytes} bytes, above the {limit}-byte ceiling")]
    SizeLimitExceeded { bytes: usize, limit: usize },

    /// Raster encoding or another backend-level failure.
    #[error("render backend failed: {detail}")]
    Backend { detail: String },
}

/// The OCR engine could not read a raster.
///
/// Recorded on the feature set; OCR failure never fails extraction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OcrError {
    /// No engine executable was found or configured.
    #[error("{engine} not found on PATH")]
    NotInstalled { engine: String },

    /// The raster could not be staged for the engine.
    #[error("cannot stage OCR input: {detail}")]
    Staging { detail: String },

    /// The engine could not be started or exited unsuccessfully.
    #[error("{engine} failed: {detail}")]
    EngineFailed { engine: String, detail: String },

    /// The engine ran past its deadline and was killed.
    #[error("{engine} timed out after {secs}s")]
    Timeout { engine: String, secs: u64 },
}

/// One failed attempt against a model provider.
///
/// The variant decides the retry class:
/// `Auth` and `QuotaExceeded` fail over immediately, everything else is
/// retried on the same model up to the configured bound.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelProviderError {
    /// Missing/invalid API key or a provider that cannot be instantiated.
    #[error("authorization failed for '{model}': {detail}")]
    Auth { model: String, detail: String },

    /// HTTP 429 / exhausted free-tier quota.
    #[error("quota exceeded for '{model}': {detail}")]
    QuotaExceeded { model: String, detail: String },

    /// No answer within the per-call timeout.
    #[error("'{model}' timed out after {secs}s")]
    Timeout { model: String, secs: u64 },

    /// Network blip, 5xx, overloaded backend.
    #[error("transient failure from '{model}': {detail}")]
    Transient { model: String, detail: String },

    /// The provider answered but the payload was empty or malformed.
    #[error("invalid response from '{model}': {detail}")]
    InvalidResponse { model: String, detail: String },

    /// The request was cancelled while the call was in flight.
    #[error("call to '{model}' cancelled")]
    Cancelled { model: String },
}

impl ModelProviderError {
    /// Quota and authorization failures never improve on retry.
    pub fn is_failover_immediately(&self) -> bool {
        matches!(
            self,
            ModelProviderError::Auth { .. } | ModelProviderError::QuotaExceeded { .. }
        )
    }

    /// Short machine-readable kind, used in logs and attempt records.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelProviderError::Auth { .. } => "auth",
            ModelProviderError::QuotaExceeded { .. } => "quota_exceeded",
            ModelProviderError::Timeout { .. } => "timeout",
            ModelProviderError::Transient { .. } => "transient",
            ModelProviderError::InvalidResponse { .. } => "invalid_response",
            ModelProviderError::Cancelled { .. } => "cancelled",
        }
    }
}

/// The hybrid fusion engine could not assemble its evidence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FusionError {
    /// Neither the manifest nor the feature set carries anything to analyse.
    #[error("no evidence to analyse for '{file_id}': {detail}")]
    NoEvidence { file_id: String, detail: String },

    /// Evidence could not be serialised into the prompt.
    #[error("failed to serialise fusion evidence: {0}")]
    Serialisation(String),
}

/// Analysis failures visible to the caller.
///
/// Provider exhaustion mid-run is *not* an error: it yields a degraded
/// [`crate::output::AnalysisResult`].
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// No provider in the candidate list could be reached at all.
    #[error("analysis unavailable: {reason}")]
    Unavailable { reason: String },

    /// The caller named a model the registry does not know.
    #[error("unknown model '{model_id}'")]
    UnknownModel { model_id: String },

    /// The caller named a model lacking a capability the analysis needs.
    #[error("model '{model_id}' does not support {capability}")]
    ModelLacksCapability { model_id: String, capability: String },

    /// The hybrid engine had nothing to analyse.
    #[error(transparent)]
    Fusion(#[from] FusionError),

    /// The initiating request was aborted.
    #[error("analysis cancelled after {completed_stages} completed stage(s)")]
    Cancelled { completed_stages: usize },
}
