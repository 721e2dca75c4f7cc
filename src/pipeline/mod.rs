//! Pipeline stages for CAD ingestion and analysis.
//!
//! Each submodule implements one step. Stages never call each other
//! sideways; [`crate::ingest`] and the analysis entry points wire them.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ dxf ──▶ manifest ──▶ render ──▶ raster ──▶ features
//! (DWG→DXF)  (parse)  (entities)   (SVG)      (PNG)     (CV + OCR)
//!                                                │
//!                         encode ──▶ llm ──▶ postprocess
//!                         (base64)   (failover)  (cleanup)
//! ```
//!
//! 1. [`input`]    normalise an upload to a DXF on disk; fail-open
//! 2. [`dxf`]      group-code reader producing 2D geometry
//! 3. [`manifest`] canonical entity manifest and the text-extraction view
//! 4. [`render`]   per-layer SVG with a size cap, plus the render store
//! 5. [`raster`]   greyscale raster for OCR, CV and vision prompts
//! 6. [`features`] deterministic features and manifest validation; [`ocr`]
//!    is the engine seam
//! 7. [`encode`]   PNG → base64 `ImageData`
//! 8. [`llm`]      model client seam and the single retry/failover policy;
//!    the only stage with network I/O
//! 9. [`postprocess`] deterministic cleanup of model text

pub mod dxf;
pub mod encode;
pub mod features;
pub mod input;
pub mod llm;
pub mod manifest;
pub mod ocr;
pub mod postprocess;
pub mod raster;
pub mod render;
