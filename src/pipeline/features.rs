//! Deterministic feature extraction from the drawing raster.
//!
//! Nothing here calls a model: identical rasters give identical feature
//! sets. Structure detection works on the ink mask in three passes:
//!
//! 1. connected components that fit a circle are counted as circles (full
//!    angular coverage) or arcs (partial coverage) and removed;
//! 2. long horizontal and vertical pixel runs are counted as lines and
//!    removed (runs continuing from the previous row/column are one line);
//! 3. remaining components are classified again, thin elongated ones as
//!    lines by the angle of their principal axis.
//!
//! The feature set validates the manifest ([`validate_manifest`]) and is the
//! evidence the hybrid engine sends to a text model ([`format_for_prompt`]).

use crate::output::{EntityType, Manifest};
use crate::pipeline::ocr::{OcrEngine, OcrItem};
use image::GrayImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use tracing::{info, warn};

/// Shortest pixel run counted as a line.
pub const MIN_LINE_PX: usize = 20;
/// Smallest radius counted as a circle or arc.
pub const MIN_CIRCLE_RADIUS_PX: f64 = 5.0;

const INK_THRESHOLD: u8 = 128;
const EDGE_THRESHOLD: f64 = 100.0;
const FULL_CIRCLE_COVERAGE: f64 = 0.9;
const MIN_ARC_COVERAGE: f64 = 0.1;
const ANGLE_BINS: usize = 36;

const TECHNICAL_TERMS: [&str; 15] = [
    "ISO", "DIN", "ANSI", "ASTM", "SCALE", "SECTION", "VIEW", "DETAIL", "ASSEMBLY", "PART", "REV",
    "MATERIAL", "FINISH", "TOLERANCE", "THREAD",
];

static DIMENSION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\d+\.?\d*\s*mm",
        r"(?i)\d+\.?\d*\s*cm",
        r"(?i)\d+\.?\d*\s*m\b",
        r"\d+\.?\d*\s*°",
        r"(?i)R\d+\.?\d*",
        r"[Ø⌀]\d+\.?\d*",
        r"(?i)\d+\.?\d*\s*x\s*\d+\.?\d*",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static TOKEN_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}]+").expect("static regex"));

// ── Types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCounts {
    pub total: usize,
    pub horizontal: usize,
    pub vertical: usize,
    pub diagonal: usize,
}

impl LineCounts {
    /// Angle in degrees, `[0, 180)`.
    fn record(&mut self, angle: f64) {
        self.total += 1;
        if !(10.0..=170.0).contains(&angle) {
            self.horizontal += 1;
        } else if angle > 80.0 && angle < 100.0 {
            self.vertical += 1;
        } else {
            self.diagonal += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    VerySimple,
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl ComplexityLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 2.0 {
            Self::VerySimple
        } else if score < 4.0 {
            Self::Simple
        } else if score < 6.0 {
            Self::Moderate
        } else if score < 8.0 {
            Self::Complex
        } else {
            Self::VeryComplex
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerySimple => "very_simple",
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
            Self::VeryComplex => "very_complex",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Complexity {
    /// Fraction of pixels on a strong gradient.
    pub edge_density: f64,
    /// Mean Sobel gradient magnitude.
    pub avg_gradient: f64,
    /// `min(10, edge_density × 100 + avg_gradient / 10)`, two decimals.
    pub score: f64,
    pub level: ComplexityLevel,
}

/// Everything the extractor derives from one raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvFeatureSet {
    pub image_width: u32,
    pub image_height: u32,
    pub text_items: Vec<OcrItem>,
    /// OCR words joined by single spaces.
    pub all_text: String,
    /// Unique dimension-like strings found in the OCR text, sorted.
    pub dimension_patterns: Vec<String>,
    pub technical_terms: Vec<String>,
    pub lines: LineCounts,
    pub circles: usize,
    pub arcs: usize,
    /// Rough count of dimension lines (one per ten detected lines).
    pub dimension_markers: usize,
    pub complexity: Complexity,
    /// Why OCR produced nothing, when it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_error: Option<String>,
}

impl CvFeatureSet {
    pub fn has_dimensions(&self) -> bool {
        !self.dimension_patterns.is_empty() || self.dimension_markers > 0
    }
}

/// A parsed count that disagrees with what the raster shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub metric: String,
    pub parsed: usize,
    pub detected: usize,
}

/// Cross-check of a manifest against the features of its raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub discrepancies: Vec<Discrepancy>,
    /// Share of manifest text tokens that OCR also read; `None` when either
    /// side has no text.
    pub text_agreement: Option<f64>,
    pub consistent: bool,
}

// ── Extraction ───────────────────────────────────────────────────────────

/// Extract the feature set of a raster. OCR failure is logged and leaves
/// the text fields empty.
pub fn extract_features(image: &GrayImage, ocr: &dyn OcrEngine) -> CvFeatureSet {
    let (text_items, ocr_error) = match ocr.recognize(image) {
        Ok(items) => (items, None),
        Err(e) => {
            warn!(engine = ocr.name(), "OCR failed: {e}");
            (Vec::new(), Some(e.to_string()))
        }
    };
    let all_text = text_items
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let mut mask = InkMask::from_image(image);
    let (circles, arcs, _) = classify_components(&mut mask, false);
    let mut lines = take_runs(&mut mask);
    let (more_circles, more_arcs, diagonal_pass) = classify_components(&mut mask, true);
    for angle in diagonal_pass {
        lines.record(angle);
    }

    let features = CvFeatureSet {
        image_width: image.width(),
        image_height: image.height(),
        dimension_patterns: dimension_patterns(&all_text),
        technical_terms: technical_terms(&all_text),
        text_items,
        all_text,
        dimension_markers: lines.total / 10,
        lines,
        circles: circles + more_circles,
        arcs: arcs + more_arcs,
        complexity: complexity(image),
        ocr_error,
    };
    info!(
        text_items = features.text_items.len(),
        lines = features.lines.total,
        circles = features.circles,
        arcs = features.arcs,
        complexity = features.complexity.score,
        "CV features extracted"
    );
    features
}

/// Dimension-like substrings, unique and sorted.
pub fn dimension_patterns(text: &str) -> Vec<String> {
    let found: BTreeSet<String> = DIMENSION_PATTERNS
        .iter()
        .flat_map(|re| re.find_iter(text).map(|m| m.as_str().trim().to_string()))
        .collect();
    found.into_iter().collect()
}

/// Standards and drawing-sheet keywords present in the text.
pub fn technical_terms(text: &str) -> Vec<String> {
    let upper = text.to_uppercase();
    TECHNICAL_TERMS
        .iter()
        .filter(|term| upper.contains(*term))
        .map(|term| term.to_string())
        .collect()
}

fn complexity(image: &GrayImage) -> Complexity {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let total = (w * h).max(1) as f64;
    let px = |x: usize, y: usize| f64::from(image.get_pixel(x as u32, y as u32).0[0]);

    let mut sum = 0.0;
    let mut edges = 0usize;
    if w >= 3 && h >= 3 {
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let gx = px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1)
                    - px(x - 1, y - 1)
                    - 2.0 * px(x - 1, y)
                    - px(x - 1, y + 1);
                let gy = px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1)
                    - px(x - 1, y - 1)
                    - 2.0 * px(x, y - 1)
                    - px(x + 1, y - 1);
                let mag = (gx * gx + gy * gy).sqrt();
                sum += mag;
                if mag >= EDGE_THRESHOLD {
                    edges += 1;
                }
            }
        }
    }
    let edge_density = edges as f64 / total;
    let avg_gradient = sum / total;
    let score = ((edge_density * 100.0 + avg_gradient / 10.0).min(10.0) * 100.0).round() / 100.0;
    Complexity {
        edge_density,
        avg_gradient,
        score,
        level: ComplexityLevel::from_score(score),
    }
}

// ── Structure detection ──────────────────────────────────────────────────

struct InkMask {
    w: usize,
    h: usize,
    ink: Vec<bool>,
}

impl InkMask {
    fn from_image(image: &GrayImage) -> Self {
        Self {
            w: image.width() as usize,
            h: image.height() as usize,
            ink: image.pixels().map(|p| p.0[0] < INK_THRESHOLD).collect(),
        }
    }

    fn at(&self, x: usize, y: usize) -> bool {
        self.ink[y * self.w + x]
    }

    fn clear(&mut self, x: usize, y: usize) {
        self.ink[y * self.w + x] = false;
    }
}

/// Count and remove long horizontal and vertical runs.
fn take_runs(mask: &mut InkMask) -> LineCounts {
    let mut counts = LineCounts::default();
    let mut cleared: Vec<(usize, usize)> = Vec::new();

    // Rows, then columns; both scans see the same mask so crossings don't
    // split lines.
    for horizontal in [true, false] {
        let (outer, inner) = if horizontal { (mask.h, mask.w) } else { (mask.w, mask.h) };
        let xy = |o: usize, i: usize| if horizontal { (i, o) } else { (o, i) };
        let mut previous: Vec<(usize, usize)> = Vec::new();
        for o in 0..outer {
            let mut runs = Vec::new();
            let mut i = 0;
            while i < inner {
                let (x, y) = xy(o, i);
                if !mask.at(x, y) {
                    i += 1;
                    continue;
                }
                let start = i;
                while i < inner && {
                    let (x, y) = xy(o, i);
                    mask.at(x, y)
                } {
                    i += 1;
                }
                if i - start >= MIN_LINE_PX {
                    runs.push((start, i));
                }
            }
            for &(s, e) in &runs {
                let continues = previous.iter().any(|&(ps, pe)| {
                    let overlap = e.min(pe).saturating_sub(s.max(ps));
                    overlap * 2 >= (e - s).min(pe - ps)
                });
                if !continues {
                    counts.record(if horizontal { 0.0 } else { 90.0 });
                }
                cleared.extend((s..e).map(|i| xy(o, i)));
            }
            previous = runs;
        }
    }

    for (x, y) in cleared {
        mask.clear(x, y);
    }
    counts
}

enum Shape {
    Line(f64),
    Circle,
    Arc,
    Other,
}

/// Classify 8-connected components. Circles and arcs are always removed;
/// lines are only reported (and removed) when `lines` is set.
fn classify_components(mask: &mut InkMask, lines: bool) -> (usize, usize, Vec<f64>) {
    let mut seen = vec![false; mask.ink.len()];
    let mut circles = 0;
    let mut arcs = 0;
    let mut angles = Vec::new();
    let max_radius = ((mask.w * mask.w + mask.h * mask.h) as f64).sqrt();

    for start in 0..mask.ink.len() {
        if !mask.ink[start] || seen[start] {
            continue;
        }
        let component = flood(mask, &mut seen, start);
        let remove = match classify(&component, max_radius) {
            Shape::Circle => {
                circles += 1;
                true
            }
            Shape::Arc => {
                arcs += 1;
                true
            }
            Shape::Line(angle) if lines => {
                angles.push(angle);
                true
            }
            _ => false,
        };
        if remove {
            for &(x, y) in &component {
                mask.clear(x, y);
            }
        }
    }
    (circles, arcs, angles)
}

fn flood(mask: &InkMask, seen: &mut [bool], start: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([start]);
    seen[start] = true;
    while let Some(idx) = queue.pop_front() {
        let (x, y) = (idx % mask.w, idx / mask.w);
        out.push((x, y));
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let nx = x as i64 + dx;
                let ny = y as i64 + dy;
                if nx < 0 || ny < 0 || nx >= mask.w as i64 || ny >= mask.h as i64 {
                    continue;
                }
                let n = ny as usize * mask.w + nx as usize;
                if mask.ink[n] && !seen[n] {
                    seen[n] = true;
                    queue.push_back(n);
                }
            }
        }
    }
    out
}

fn classify(pixels: &[(usize, usize)], max_radius: f64) -> Shape {
    if pixels.len() < MIN_LINE_PX / 2 {
        return Shape::Other;
    }
    let n = pixels.len() as f64;
    let mx = pixels.iter().map(|p| p.0 as f64).sum::<f64>() / n;
    let my = pixels.iter().map(|p| p.1 as f64).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for &(x, y) in pixels {
        let (dx, dy) = (x as f64 - mx, y as f64 - my);
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let (a, b, c) = (sxx / n, sxy / n, syy / n);
    let half_trace = (a + c) / 2.0;
    let spread = (((a - c) / 2.0).powi(2) + b * b).sqrt();
    let (l1, l2) = (half_trace + spread, half_trace - spread);

    let length = (12.0 * l1).sqrt();
    if l1 > 0.0 && l2 <= 0.01 * l1 && length >= MIN_LINE_PX as f64 {
        let (vx, vy) = if b.abs() > 1e-12 {
            (b, l1 - a)
        } else if a >= c {
            (1.0, 0.0)
        } else {
            (0.0, 1.0)
        };
        return Shape::Line(vy.atan2(vx).to_degrees().rem_euclid(180.0));
    }

    let Some((cx, cy, r)) = fit_circle(pixels, mx, my) else {
        return Shape::Other;
    };
    if !(MIN_CIRCLE_RADIUS_PX..=max_radius).contains(&r) {
        return Shape::Other;
    }
    let residual = pixels
        .iter()
        .map(|&(x, y)| ((x as f64 - cx).hypot(y as f64 - cy) - r).abs())
        .sum::<f64>()
        / n;
    if residual > (0.02 * r).max(1.0) {
        return Shape::Other;
    }
    let mut bins = [false; ANGLE_BINS];
    for &(x, y) in pixels {
        let angle = (y as f64 - cy).atan2(x as f64 - cx).rem_euclid(std::f64::consts::TAU);
        let bin = ((angle / std::f64::consts::TAU) * ANGLE_BINS as f64) as usize;
        bins[bin.min(ANGLE_BINS - 1)] = true;
    }
    let coverage = bins.iter().filter(|b| **b).count() as f64 / ANGLE_BINS as f64;
    if coverage >= FULL_CIRCLE_COVERAGE {
        Shape::Circle
    } else if coverage >= MIN_ARC_COVERAGE {
        Shape::Arc
    } else {
        Shape::Other
    }
}

/// Algebraic least-squares circle fit on coordinates centred at the mean.
fn fit_circle(pixels: &[(usize, usize)], mx: f64, my: f64) -> Option<(f64, f64, f64)> {
    let (mut sxx, mut syy, mut sxy, mut sx, mut sy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let (mut sxz, mut syz, mut sz) = (0.0, 0.0, 0.0);
    for &(x, y) in pixels {
        let (x, y) = (x as f64 - mx, y as f64 - my);
        let z = x * x + y * y;
        sxx += x * x;
        syy += y * y;
        sxy += x * y;
        sx += x;
        sy += y;
        sxz += x * z;
        syz += y * z;
        sz += z;
    }
    let n = pixels.len() as f64;
    // Solve [sxx sxy sx; sxy syy sy; sx sy n] [d e f] = -[sxz syz sz].
    let m = [[sxx, sxy, sx], [sxy, syy, sy], [sx, sy, n]];
    let rhs = [-sxz, -syz, -sz];
    let det = det3(&m);
    if det.abs() < 1e-9 * (sxx * syy * n).abs().max(1.0) {
        return None;
    }
    let solve = |col: usize| {
        let mut mc = m;
        for (row, value) in mc.iter_mut().zip(rhs) {
            row[col] = value;
        }
        det3(&mc) / det
    };
    let (d, e, f) = (solve(0), solve(1), solve(2));
    let r2 = d * d / 4.0 + e * e / 4.0 - f;
    if !r2.is_finite() || r2 <= 0.0 {
        return None;
    }
    Some((mx - d / 2.0, my - e / 2.0, r2.sqrt()))
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

// ── Validation ───────────────────────────────────────────────────────────

/// Agreement below this marks the manifest text as suspect.
pub const MIN_TEXT_AGREEMENT: f64 = 0.3;

/// Compare parsed counts against detected structures.
///
/// A count is flagged when parsed and detected values differ by more than
/// half of the larger one and by more than five.
pub fn validate_manifest(manifest: &Manifest, features: &CvFeatureSet) -> ValidationReport {
    let stats = &manifest.statistics;
    let checks = [
        ("lines", stats.line_entities, features.lines.total),
        ("circles", stats.circle_entities, features.circles),
        ("arcs", stats.arc_entities, features.arcs),
    ];
    let discrepancies: Vec<Discrepancy> = checks
        .into_iter()
        .filter(|&(_, parsed, detected)| {
            let diff = parsed.abs_diff(detected);
            diff > 5 && diff * 2 > parsed.max(detected)
        })
        .map(|(metric, parsed, detected)| Discrepancy {
            metric: metric.to_string(),
            parsed,
            detected,
        })
        .collect();

    let text_agreement = text_agreement(manifest, features);
    for d in &discrepancies {
        warn!(
            file_id = %manifest.file_id,
            metric = %d.metric,
            parsed = d.parsed,
            detected = d.detected,
            "manifest count disagrees with raster"
        );
    }
    let consistent =
        discrepancies.is_empty() && text_agreement.map_or(true, |a| a >= MIN_TEXT_AGREEMENT);
    ValidationReport {
        discrepancies,
        text_agreement,
        consistent,
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    TOKEN_SPLIT
        .split(text)
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_uppercase)
}

fn text_agreement(manifest: &Manifest, features: &CvFeatureSet) -> Option<f64> {
    if features.text_items.is_empty() {
        return None;
    }
    let expected: BTreeSet<String> = manifest
        .entities
        .iter()
        .filter(|e| e.entity_type.is_textual() && e.entity_type != EntityType::Dimension)
        .filter_map(|e| e.raw_text.as_deref())
        .flat_map(tokens)
        .collect();
    if expected.is_empty() {
        return None;
    }
    let read: HashSet<String> = tokens(&features.all_text).collect();
    let hits = expected.iter().filter(|t| read.contains(*t)).count();
    Some(hits as f64 / expected.len() as f64)
}

// ── Prompt rendering ─────────────────────────────────────────────────────

/// Render a feature set as the plain-text evidence block of a prompt.
pub fn format_for_prompt(f: &CvFeatureSet) -> String {
    let text = if f.all_text.is_empty() {
        "No text detected".to_string()
    } else {
        crate::prompts::truncate_chars(&f.all_text, 1000)
    };
    let or_none = |items: &[String], none: &str| {
        if items.is_empty() {
            none.to_string()
        } else {
            items.join(", ")
        }
    };
    format!(
        "CAD DRAWING ANALYSIS (computer vision extraction)\n\n\
         IMAGE PROPERTIES:\n\
         - Size: {}x{} pixels\n\
         - Complexity: {} ({:.2}/10)\n\n\
         DETECTED SHAPES:\n\
         - Circles: {}\n\
         - Arcs: {}\n\
         - Total lines: {} (H:{}, V:{}, D:{})\n\n\
         EXTRACTED TEXT ({} items):\n{}\n\n\
         DIMENSIONS FOUND:\n{}\n\n\
         TECHNICAL TERMS:\n{}\n\n\
         DRAWING CHARACTERISTICS:\n\
         - Has dimension markers: {}\n",
        f.image_width,
        f.image_height,
        f.complexity.level.as_str().to_uppercase(),
        f.complexity.score,
        f.circles,
        f.arcs,
        f.lines.total,
        f.lines.horizontal,
        f.lines.vertical,
        f.lines.diagonal,
        f.text_items.len(),
        text,
        or_none(&f.dimension_patterns, "No dimensions detected"),
        or_none(&f.technical_terms, "No technical terms detected"),
        if f.has_dimensions() { "Yes" } else { "No" },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ConversionStatus;
    use crate::pipeline::dxf::parse_dxf;
    use crate::pipeline::manifest::manifest_from_drawing;
    use crate::error::OcrError;
    use crate::pipeline::ocr::NoOcr;
    use crate::pipeline::raster::rasterize;

    struct FixedOcr(Vec<&'static str>);

    impl OcrEngine for FixedOcr {
        fn name(&self) -> &str {
            "fixed"
        }

        fn recognize(&self, _image: &GrayImage) -> Result<Vec<OcrItem>, OcrError> {
            Ok(self
                .0
                .iter()
                .map(|w| OcrItem {
                    text: w.to_string(),
                    confidence: 90.0,
                    left: 0,
                    top: 0,
                    width: 10,
                    height: 10,
                })
                .collect())
        }
    }

    fn manifest_and_raster(body: &str) -> (Manifest, GrayImage) {
        let d = parse_dxf(&format!("0\nSECTION\n2\nENTITIES\n{body}0\nENDSEC\n0\nEOF\n")).unwrap();
        let m = manifest_from_drawing(&d, "f", "Model", "t.dxf", ConversionStatus::AlreadyNative);
        let img = rasterize(&d, &m.extents, 800).unwrap();
        (m, img)
    }

    const SHAPES: &str = "0\nLINE\n10\n0\n20\n0\n11\n100\n21\n0\n\
0\nLINE\n10\n120\n20\n0\n11\n120\n21\n80\n\
0\nLINE\n10\n10\n20\n20\n11\n60\n21\n60\n\
0\nCIRCLE\n10\n80\n20\n50\n40\n10\n\
0\nARC\n10\n40\n20\n90\n40\n12\n50\n0\n51\n180\n";

    #[test]
    fn detects_lines_circles_and_arcs() {
        let (_, img) = manifest_and_raster(SHAPES);
        let f = extract_features(&img, &NoOcr);
        assert_eq!(f.lines.horizontal, 1, "{:?}", f.lines);
        assert_eq!(f.lines.vertical, 1, "{:?}", f.lines);
        assert_eq!(f.lines.diagonal, 1, "{:?}", f.lines);
        assert_eq!(f.circles, 1);
        assert_eq!(f.arcs, 1);
    }

    #[test]
    fn extraction_is_deterministic() {
        let (_, img) = manifest_and_raster(SHAPES);
        assert_eq!(extract_features(&img, &NoOcr), extract_features(&img, &NoOcr));
    }

    #[test]
    fn blank_image_is_very_simple() {
        let img = GrayImage::from_pixel(64, 64, image::Luma([255]));
        let f = extract_features(&img, &NoOcr);
        assert_eq!(f.lines, LineCounts::default());
        assert_eq!(f.complexity.score, 0.0);
        assert_eq!(f.complexity.level, ComplexityLevel::VerySimple);
    }

    #[test]
    fn complexity_levels() {
        assert_eq!(ComplexityLevel::from_score(1.99), ComplexityLevel::VerySimple);
        assert_eq!(ComplexityLevel::from_score(2.0), ComplexityLevel::Simple);
        assert_eq!(ComplexityLevel::from_score(5.5), ComplexityLevel::Moderate);
        assert_eq!(ComplexityLevel::from_score(7.9), ComplexityLevel::Complex);
        assert_eq!(ComplexityLevel::from_score(10.0), ComplexityLevel::VeryComplex);
    }

    #[test]
    fn dimension_patterns_found() {
        let found = dimension_patterns("Ø25 bore, R15 fillet, 150mm long, 30° chamfer, plate 150 x 75");
        for expected in ["Ø25", "R15", "150mm", "30°", "150 x 75"] {
            assert!(found.iter().any(|f| f == expected), "missing {expected}: {found:?}");
        }
    }

    #[test]
    fn technical_terms_in_keyword_order() {
        assert_eq!(
            technical_terms("section A-A, scale 1:2, iso 2768"),
            ["ISO", "SCALE", "SECTION"]
        );
    }

    #[test]
    fn ocr_failure_is_recorded_not_fatal() {
        struct Broken;
        impl OcrEngine for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn recognize(&self, _: &GrayImage) -> Result<Vec<OcrItem>, OcrError> {
                Err(OcrError::Timeout {
                    engine: "broken".into(),
                    secs: 60,
                })
            }
        }
        let img = GrayImage::from_pixel(8, 8, image::Luma([255]));
        let f = extract_features(&img, &Broken);
        assert_eq!(f.ocr_error.as_deref(), Some("broken timed out after 60s"));
        assert!(f.text_items.is_empty());
    }

    #[test]
    fn validation_flags_large_count_gap() {
        let (m, img) = manifest_and_raster(SHAPES);
        let mut f = extract_features(&img, &NoOcr);
        assert!(validate_manifest(&m, &f).discrepancies.is_empty());

        f.circles = 40;
        let report = validate_manifest(&m, &f);
        assert_eq!(report.discrepancies.len(), 1);
        assert_eq!(report.discrepancies[0].metric, "circles");
        assert!(!report.consistent);
    }

    #[test]
    fn text_agreement_ratio() {
        let (m, img) = manifest_and_raster("0\nTEXT\n10\n0\n20\n0\n40\n5\n1\nGEAR HOUSING\n0\nLINE\n10\n0\n20\n-5\n11\n50\n21\n-5\n");
        let f = extract_features(&img, &FixedOcr(vec!["GEAR", "HOUSNG"]));
        let report = validate_manifest(&m, &f);
        assert_eq!(report.text_agreement, Some(0.5));

        let none = extract_features(&img, &NoOcr);
        assert_eq!(validate_manifest(&m, &none).text_agreement, None);
    }

    #[test]
    fn prompt_block_lists_counts() {
        let (_, img) = manifest_and_raster(SHAPES);
        let f = extract_features(&img, &FixedOcr(vec!["Ø25", "ISO"]));
        let s = format_for_prompt(&f);
        assert!(s.contains("Circles: 1"));
        assert!(s.contains("Ø25"));
        assert!(s.contains("TECHNICAL TERMS:\nISO"));
    }
}
