//! Vector rendering: parsed drawing → self-contained SVG document.
//!
//! Every layer becomes one `<g>` with its own stroke colour (the layer's ACI
//! colour when the table defines one, otherwise a colour hashed from the
//! layer name). World Y points up and SVG Y points down, so coordinates are
//! flipped against the drawing extents.
//!
//! ## Size cap
//!
//! Above `max_render_entities`, or when a document exceeds `max_svg_bytes`,
//! entities are bucketed into a `grid × grid` raster over the extents and
//! only the first `per_cell` of each bucket are drawn. `per_cell` halves
//! until the document fits; if even one entity per cell is too large the
//! render fails with [`RenderError::SizeLimitExceeded`].

use crate::config::PipelineConfig;
use crate::error::{CadError, RenderError};
use crate::output::{EntityType, Extents};
use crate::pipeline::dxf::{Drawing, DrawingEntity, Geometry, Point2};
use crate::pipeline::manifest::{attachment_offset, geometry_bbox};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Render limits, taken from [`PipelineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderLimits {
    pub max_entities: usize,
    pub max_bytes: usize,
    pub grid_cells: usize,
    pub per_cell: usize,
}

impl From<&PipelineConfig> for RenderLimits {
    fn from(c: &PipelineConfig) -> Self {
        Self {
            max_entities: c.max_render_entities,
            max_bytes: c.max_svg_bytes,
            grid_cells: c.render_grid_cells.max(1),
            per_cell: c.max_entities_per_cell.max(1),
        }
    }
}

/// A rendered document and how it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderHandle {
    pub file_id: String,
    /// Where the document was stored, if a render store is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip)]
    pub svg: String,
    pub bytes: usize,
    pub entities_drawn: usize,
    pub entities_skipped: usize,
    /// `true` when dense regions were thinned to respect the size cap.
    pub simplified: bool,
}

/// Render `drawing` to SVG within `limits`.
pub fn render_svg(
    file_id: &str,
    drawing: &Drawing,
    extents: &Extents,
    limits: &RenderLimits,
) -> Result<RenderHandle, RenderError> {
    let boxes: Vec<Option<[f64; 4]>> = drawing
        .entities
        .iter()
        .map(|e| geometry_bbox(&e.geometry))
        .collect();
    let drawable = drawing
        .entities
        .iter()
        .filter(|e| is_drawable(e))
        .count();
    if drawable == 0 {
        return Err(RenderError::Empty {
            detail: format!("no drawable entity among {}", drawing.entities.len()),
        });
    }

    let mut per_cell = if drawable > limits.max_entities {
        Some(limits.per_cell)
    } else {
        None
    };

    loop {
        let keep = match per_cell {
            Some(n) => thin_by_grid(drawing, &boxes, extents, limits.grid_cells, n),
            None => vec![true; drawing.entities.len()],
        };
        let (svg, drawn, skipped) = write_svg(drawing, extents, &keep);

        if svg.len() <= limits.max_bytes {
            if skipped > 0 {
                warn!(file_id, skipped, "skipped unsupported or thinned entities while rendering");
            }
            info!(file_id, bytes = svg.len(), drawn, simplified = per_cell.is_some(), "SVG rendered");
            return Ok(RenderHandle {
                file_id: file_id.to_string(),
                path: None,
                bytes: svg.len(),
                svg,
                entities_drawn: drawn,
                entities_skipped: skipped,
                simplified: per_cell.is_some(),
            });
        }

        per_cell = match per_cell {
            None => Some(limits.per_cell),
            Some(1) => {
                return Err(RenderError::SizeLimitExceeded {
                    bytes: svg.len(),
                    limit: limits.max_bytes,
                })
            }
            Some(n) => Some(n / 2),
        };
        debug!(file_id, bytes = svg.len(), per_cell = ?per_cell, "SVG over size cap, thinning");
    }
}

/// Entities whose geometry has no finite box are left out of the frame and
/// are never drawn.
fn is_drawable(e: &DrawingEntity) -> bool {
    if geometry_bbox(&e.geometry).is_none() {
        return false;
    }
    match &e.geometry {
        Geometry::Empty => false,
        Geometry::Points(points) => e.entity_type == EntityType::Dimension || points.len() >= 2,
        Geometry::Label { .. } => e.text.as_deref().is_some_and(|t| !t.trim().is_empty()),
        _ => true,
    }
}

/// Keep the first `per_cell` entities whose box centre falls in each cell.
fn thin_by_grid(
    drawing: &Drawing,
    boxes: &[Option<[f64; 4]>],
    extents: &Extents,
    cells: usize,
    per_cell: usize,
) -> Vec<bool> {
    let mut counts = vec![0usize; cells * cells];
    let w = extents.width();
    let h = extents.height();
    let cell_of = |v: f64, min: f64, span: f64| -> usize {
        if span <= 0.0 {
            0
        } else {
            (((v - min) / span) * cells as f64).floor().clamp(0.0, (cells - 1) as f64) as usize
        }
    };

    drawing
        .entities
        .iter()
        .zip(boxes)
        .map(|(_, bbox)| match bbox {
            Some(b) => {
                let cx = cell_of((b[0] + b[2]) / 2.0, extents.min[0], w);
                let cy = cell_of((b[1] + b[3]) / 2.0, extents.min[1], h);
                let slot = &mut counts[cy * cells + cx];
                *slot += 1;
                *slot <= per_cell
            }
            None => false,
        })
        .collect()
}

// ── SVG writing ──────────────────────────────────────────────────────────

const MARGIN_FRACTION: f64 = 0.02;

struct Frame {
    min_x: f64,
    max_y: f64,
    margin: f64,
}

impl Frame {
    fn x(&self, x: f64) -> f64 {
        x - self.min_x + self.margin
    }

    fn y(&self, y: f64) -> f64 {
        self.max_y - y + self.margin
    }
}

fn write_svg(drawing: &Drawing, extents: &Extents, keep: &[bool]) -> (String, usize, usize) {
    let w = extents.width().max(1e-9);
    let h = extents.height().max(1e-9);
    let margin = w.max(h) * MARGIN_FRACTION + 1.0;
    let frame = Frame {
        min_x: extents.min[0],
        max_y: extents.max[1],
        margin,
    };
    let view_w = w + 2.0 * margin;
    let view_h = h + 2.0 * margin;

    // Layers in first-seen order.
    let mut layer_order: Vec<&str> = Vec::new();
    for e in &drawing.entities {
        if !layer_order.contains(&e.layer.as_str()) {
            layer_order.push(&e.layer);
        }
    }

    let mut out = String::with_capacity(1024 + drawing.entities.len() * 64);
    let _ = write!(
        out,
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {} {}" width="{}" height="{}">"#,
        num(view_w),
        num(view_h),
        num(view_w),
        num(view_h)
    );
    out.push_str("\n<rect width=\"100%\" height=\"100%\" fill=\"#ffffff\"/>\n");

    let mut drawn = 0;
    let mut skipped = 0;
    for layer in layer_order {
        let color = layer_color(layer, drawing.layer_color(layer));
        let _ = writeln!(
            out,
            r#"<g id="layer-{}" stroke="{color}" fill="none" stroke-width="1">"#,
            xml_escape(layer)
        );
        for (entity, keep) in drawing.entities.iter().zip(keep) {
            if entity.layer != layer {
                continue;
            }
            if !keep || !is_drawable(entity) {
                skipped += 1;
                continue;
            }
            if write_entity(&mut out, entity, &frame, &color) {
                drawn += 1;
            } else {
                debug!(dxf_type = %entity.dxf_type, "entity not renderable");
                skipped += 1;
            }
        }
        out.push_str("</g>\n");
    }
    out.push_str("</svg>\n");
    (out, drawn, skipped)
}

fn write_entity(out: &mut String, entity: &DrawingEntity, f: &Frame, color: &str) -> bool {
    match &entity.geometry {
        Geometry::Segment { start, end } => {
            let _ = writeln!(
                out,
                r#"<line x1="{}" y1="{}" x2="{}" y2="{}"/>"#,
                num(f.x(start.x)),
                num(f.y(start.y)),
                num(f.x(end.x)),
                num(f.y(end.y))
            );
            true
        }
        Geometry::Polyline { points, closed } => {
            if points.len() < 2 {
                return false;
            }
            let tag = if *closed { "polygon" } else { "polyline" };
            let _ = writeln!(out, r#"<{tag} points="{}"/>"#, point_list(points, f));
            true
        }
        Geometry::Circle { center, radius } => {
            let _ = writeln!(
                out,
                r#"<circle cx="{}" cy="{}" r="{}"/>"#,
                num(f.x(center.x)),
                num(f.y(center.y)),
                num(*radius)
            );
            true
        }
        Geometry::Arc {
            center,
            radius,
            start_angle,
            end_angle,
        } => {
            let sweep = (end_angle - start_angle).rem_euclid(360.0);
            if sweep == 0.0 {
                let _ = writeln!(
                    out,
                    r#"<circle cx="{}" cy="{}" r="{}"/>"#,
                    num(f.x(center.x)),
                    num(f.y(center.y)),
                    num(*radius)
                );
                return true;
            }
            let (s_sin, s_cos) = start_angle.to_radians().sin_cos();
            let (e_sin, e_cos) = end_angle.to_radians().sin_cos();
            let large = if sweep > 180.0 { 1 } else { 0 };
            // CCW in world space is clockwise once Y is flipped: sweep-flag 0.
            let _ = writeln!(
                out,
                r#"<path d="M {} {} A {r} {r} 0 {large} 0 {} {}"/>"#,
                num(f.x(center.x + radius * s_cos)),
                num(f.y(center.y + radius * s_sin)),
                num(f.x(center.x + radius * e_cos)),
                num(f.y(center.y + radius * e_sin)),
                r = num(*radius),
            );
            true
        }
        Geometry::Ellipse {
            center,
            major_axis,
            ratio,
            start_param,
            end_param,
        } => {
            let points = ellipse_points(*center, *major_axis, *ratio, *start_param, *end_param);
            let _ = writeln!(out, r#"<polyline points="{}"/>"#, point_list(&points, f));
            true
        }
        Geometry::Label {
            insert,
            width,
            height,
            rotation,
            attachment,
        } => {
            let Some(text) = entity.text.as_deref() else {
                return false;
            };
            let (at, glyph) = label_origin(text, *insert, *width, *height, *rotation, *attachment);
            write_text(out, text, at, glyph, *rotation, f, color);
            true
        }
        Geometry::Points(points) => {
            if points.len() >= 2 {
                let _ = writeln!(out, r#"<polyline points="{}"/>"#, point_list(points, f));
            }
            if entity.entity_type == EntityType::Dimension {
                if let (Some(text), Some(bbox)) = (entity.text.as_deref(), geometry_bbox(&entity.geometry)) {
                    let mid = Point2::new((bbox[0] + bbox[2]) / 2.0, (bbox[1] + bbox[3]) / 2.0);
                    let size = ((bbox[2] - bbox[0]).max(bbox[3] - bbox[1]) / 20.0).max(1.0);
                    write_text(out, text, mid, size, 0.0, f, color);
                }
            }
            true
        }
        Geometry::Empty => false,
    }
}

/// Baseline-left point of a label's first line and its glyph height.
///
/// TEXT anchors at its baseline. An MTEXT box is `lines × 1.5` glyphs tall
/// and hangs from one of nine attachment points.
pub(crate) fn label_origin(
    text: &str,
    insert: Point2,
    width: f64,
    height: f64,
    rotation: f64,
    attachment: Option<i16>,
) -> (Point2, f64) {
    if !matches!(attachment, Some(1..=9)) {
        return (insert, height);
    }
    let lines = text.lines().count().max(1) as f64;
    let glyph = height / (lines * 1.5);
    let (dx, dy) = attachment_offset(width, height, attachment);
    let (lx, ly) = (dx, dy + height - glyph);
    let (sin, cos) = rotation.to_radians().sin_cos();
    (
        Point2::new(insert.x + lx * cos - ly * sin, insert.y + lx * sin + ly * cos),
        glyph,
    )
}

fn write_text(out: &mut String, text: &str, at: Point2, height: f64, rotation: f64, f: &Frame, color: &str) {
    let x = f.x(at.x);
    let y = f.y(at.y);
    let transform = if rotation != 0.0 {
        format!(r#" transform="rotate({} {} {})""#, num(-rotation), num(x), num(y))
    } else {
        String::new()
    };
    let _ = write!(
        out,
        r#"<text x="{}" y="{}" font-size="{}" font-family="monospace" fill="{color}" stroke="none"{transform}>"#,
        num(x),
        num(y),
        num(height)
    );
    for (i, line) in text.lines().enumerate() {
        if i == 0 {
            out.push_str(&xml_escape(line));
        } else {
            let _ = write!(
                out,
                r#"<tspan x="{}" dy="{}">{}</tspan>"#,
                num(x),
                num(height * 1.5),
                xml_escape(line)
            );
        }
    }
    out.push_str("</text>\n");
}

/// Sample an ellipse (or elliptical arc) as a polyline.
pub(crate) fn ellipse_points(center: Point2, major: Point2, ratio: f64, start: f64, end: f64) -> Vec<Point2> {
    let minor = Point2::new(-major.y * ratio, major.x * ratio);
    let mut sweep = (end - start).rem_euclid(std::f64::consts::TAU);
    if sweep == 0.0 {
        sweep = std::f64::consts::TAU;
    }
    const SAMPLES: usize = 72;
    (0..=SAMPLES)
        .map(|i| {
            let t = start + sweep * i as f64 / SAMPLES as f64;
            Point2::new(
                center.x + major.x * t.cos() + minor.x * t.sin(),
                center.y + major.y * t.cos() + minor.y * t.sin(),
            )
        })
        .collect()
}

fn point_list(points: &[Point2], f: &Frame) -> String {
    let mut s = String::with_capacity(points.len() * 16);
    for (i, p) in points.iter().enumerate() {
        if i > 0 {
            s.push(' ');
        }
        let _ = write!(s, "{},{}", num(f.x(p.x)), num(f.y(p.y)));
    }
    s
}

/// Compact decimal: three places, trailing zeros dropped.
fn num(v: f64) -> String {
    let s = format!("{v:.3}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if (c as u32) < 0x20 && c != '\t' => {}
            c => out.push(c),
        }
    }
    out
}

// ── Layer colours ────────────────────────────────────────────────────────

/// Stroke colour of a layer.
///
/// ACI 1–6 map to their standard colours and 7 (white/black) to black,
/// which is what a white background needs. Other indices, and layers
/// without a table entry, pick from a fixed palette by hash so the same
/// layer always gets the same colour.
pub fn layer_color(layer: &str, aci: Option<i16>) -> String {
    const PALETTE: [&str; 12] = [
        "#1f77b4", "#d62728", "#2ca02c", "#9467bd", "#8c564b", "#e377c2",
        "#17becf", "#bcbd22", "#ff7f0e", "#7f7f7f", "#393b79", "#637939",
    ];
    match aci.map(i16::unsigned_abs) {
        Some(1) => "#ff0000".to_string(),
        Some(2) => "#c8b400".to_string(),
        Some(3) => "#00a000".to_string(),
        Some(4) => "#00a0a0".to_string(),
        Some(5) => "#0000ff".to_string(),
        Some(6) => "#c000c0".to_string(),
        Some(7) | Some(0) => "#000000".to_string(),
        Some(8) => "#808080".to_string(),
        Some(9) => "#a0a0a0".to_string(),
        Some(n) => PALETTE[n as usize % PALETTE.len()].to_string(),
        None => PALETTE[(fnv1a(layer) % PALETTE.len() as u64) as usize].to_string(),
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ── Store ────────────────────────────────────────────────────────────────

/// Directory of rendered documents keyed by file id.
#[derive(Debug, Clone)]
pub struct RenderStore {
    dir: PathBuf,
}

impl RenderStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for `file_id`.
    ///
    /// ASCII letters, digits, `-` and `.` are kept; every other byte is
    /// written as `_XX` hex, so distinct ids never share a file.
    pub fn path_for(&self, file_id: &str) -> PathBuf {
        let mut name = String::with_capacity(file_id.len() + 4);
        for b in file_id.bytes() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' {
                name.push(char::from(b));
            } else {
                let _ = write!(name, "_{b:02X}");
            }
        }
        if name.trim_matches('.').is_empty() {
            // "", "." and ".." would name the directory itself or nothing.
            name.insert(0, '_');
        }
        self.dir.join(format!("{name}.svg"))
    }

    /// Write the handle's document and record its path.
    pub fn save(&self, handle: &mut RenderHandle) -> Result<PathBuf, CadError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| CadError::RenderStore {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(&handle.file_id);
        std::fs::write(&path, handle.svg.as_bytes()).map_err(|source| CadError::RenderStore {
            path: path.clone(),
            source,
        })?;
        handle.path = Some(path.clone());
        Ok(path)
    }

    /// Load the document stored for `file_id`.
    pub fn load(&self, file_id: &str) -> Result<String, CadError> {
        let path = self.path_for(file_id);
        match std::fs::read_to_string(&path) {
            Ok(svg) => Ok(svg),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CadError::RenderNotFound {
                file_id: file_id.to_string(),
            }),
            Err(source) => Err(CadError::RenderStore { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::dxf::parse_dxf;

    fn drawing(body: &str) -> Drawing {
        parse_dxf(&format!("0\nSECTION\n2\nENTITIES\n{body}0\nENDSEC\n0\nEOF\n")).unwrap()
    }

    fn extents_of(d: &Drawing) -> Extents {
        let m = crate::pipeline::manifest::manifest_from_drawing(
            d,
            "f",
            "Model",
            "t.dxf",
            crate::output::ConversionStatus::AlreadyNative,
        );
        m.extents
    }

    fn limits() -> RenderLimits {
        RenderLimits {
            max_entities: 50_000,
            max_bytes: 4 * 1024 * 1024,
            grid_cells: 64,
            per_cell: 64,
        }
    }

    #[test]
    fn renders_each_layer_with_its_own_stroke() {
        let d = drawing("0\nLINE\n8\nWALLS\n10\n0\n20\n0\n11\n10\n21\n0\n0\nCIRCLE\n8\nHOLES\n10\n5\n20\n5\n40\n2\n");
        let h = render_svg("f", &d, &extents_of(&d), &limits()).unwrap();
        assert!(h.svg.starts_with("<svg"));
        assert!(h.svg.contains(r#"id="layer-WALLS""#));
        assert!(h.svg.contains(r#"id="layer-HOLES""#));
        assert_ne!(layer_color("WALLS", None), layer_color("HOLES", None));
        assert_eq!(h.entities_drawn, 2);
        assert!(!h.simplified);
    }

    #[test]
    fn unsupported_entities_are_skipped_not_fatal() {
        let d = drawing("0\nLINE\n10\n0\n20\n0\n11\n1\n21\n1\n0\nXRECORD\n8\n0\n");
        let h = render_svg("f", &d, &extents_of(&d), &limits()).unwrap();
        assert_eq!(h.entities_drawn, 1);
        assert_eq!(h.entities_skipped, 1);
    }

    #[test]
    fn empty_drawing_is_render_error() {
        let d = drawing("");
        assert!(matches!(
            render_svg("f", &d, &Extents::ZERO, &limits()),
            Err(RenderError::Empty { .. })
        ));
    }

    #[test]
    fn dense_drawing_is_thinned_to_fit() {
        let mut body = String::new();
        for i in 0..2000 {
            let _ = write!(body, "0\nLINE\n10\n{i}\n20\n0\n11\n{i}\n21\n1\n");
        }
        let d = drawing(&body);
        let l = RenderLimits {
            max_entities: 100,
            max_bytes: 64 * 1024,
            grid_cells: 8,
            per_cell: 8,
        };
        let h = render_svg("f", &d, &extents_of(&d), &l).unwrap();
        assert!(h.simplified);
        assert!(h.bytes <= l.max_bytes);
        assert!(h.entities_drawn <= 64);
    }

    #[test]
    fn impossible_cap_is_size_error() {
        let mut body = String::new();
        for i in 0..200 {
            let _ = write!(body, "0\nTEXT\n10\n{i}\n20\n{i}\n40\n1\n1\n{}\n", "X".repeat(200));
        }
        let d = drawing(&body);
        let l = RenderLimits {
            max_entities: 50_000,
            max_bytes: 1024,
            grid_cells: 1,
            per_cell: 4,
        };
        assert!(matches!(
            render_svg("f", &d, &extents_of(&d), &l),
            Err(RenderError::SizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn text_is_escaped() {
        let d = drawing("0\nTEXT\n10\n0\n20\n0\n40\n1\n1\nA<B & C\n");
        let h = render_svg("f", &d, &extents_of(&d), &limits()).unwrap();
        assert!(h.svg.contains("A&lt;B &amp; C"));
    }

    #[test]
    fn aci_colours() {
        assert_eq!(layer_color("x", Some(1)), "#ff0000");
        assert_eq!(layer_color("x", Some(-5)), "#0000ff");
        assert_eq!(layer_color("x", Some(7)), "#000000");
    }

    #[test]
    fn store_round_trip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = RenderStore::new(dir.path());
        let d = drawing("0\nLINE\n10\n0\n20\n0\n11\n1\n21\n1\n");
        let mut h = render_svg("plan/01", &d, &extents_of(&d), &limits()).unwrap();
        let path = store.save(&mut h).unwrap();
        assert!(path.ends_with("plan_2F01.svg"));
        assert_eq!(store.load("plan/01").unwrap(), h.svg);
        assert!(matches!(store.load("nope"), Err(CadError::RenderNotFound { .. })));
    }

    #[test]
    fn ids_that_look_alike_get_their_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = RenderStore::new(dir.path());
        let ids = ["plan/01", "plan_01", "plan 01", "plan_2F01", "", ".", "..", "_", "plan/01/"];
        let paths: std::collections::HashSet<PathBuf> = ids.iter().map(|id| store.path_for(id)).collect();
        assert_eq!(paths.len(), ids.len());
        for p in &paths {
            assert_eq!(p.parent(), Some(dir.path()));
        }

        let line = drawing("0\nLINE\n10\n0\n20\n0\n11\n1\n21\n1\n");
        let circle = drawing("0\nCIRCLE\n10\n0\n20\n0\n40\n3\n");
        let mut a = render_svg("plan/01", &line, &extents_of(&line), &limits()).unwrap();
        let mut b = render_svg("plan_01", &circle, &extents_of(&circle), &limits()).unwrap();
        store.save(&mut a).unwrap();
        store.save(&mut b).unwrap();
        assert!(store.load("plan/01").unwrap().contains("<line"));
        assert!(store.load("plan_01").unwrap().contains("<circle"));
    }

    #[test]
    fn non_finite_entity_is_skipped() {
        let d = drawing("0\nLINE\n10\n0\n20\n0\n11\n10\n21\n0\n0\nCIRCLE\n10\n1e308\n20\n0\n40\n1e308\n");
        let h = render_svg("f", &d, &extents_of(&d), &limits()).unwrap();
        assert_eq!(h.entities_drawn, 1);
        assert_eq!(h.entities_skipped, 1);
        assert!(!h.svg.contains("inf"));
        assert!(!h.svg.contains("NaN"));
    }

    #[test]
    fn stroke_attributes_sit_on_the_layer_group_only() {
        let d = drawing("0\nLINE\n10\n0\n20\n0\n11\n10\n21\n0\n");
        let h = render_svg("f", &d, &extents_of(&d), &limits()).unwrap();
        assert!(!h.svg.contains("vector-effect"));
    }

    fn text_y(svg: &str) -> f64 {
        let at = svg.find("<text ").unwrap();
        let rest = &svg[at..];
        let y = rest.find(" y=\"").unwrap() + 4;
        let end = rest[y..].find('"').unwrap();
        rest[y..y + end].parse().unwrap()
    }

    #[test]
    fn mtext_hangs_from_its_attachment_point() {
        let with_attachment = |a: u8| {
            drawing(&format!(
                "0\nLINE\n10\n0\n20\n-100\n11\n100\n21\n100\n0\nMTEXT\n10\n50\n20\n0\n40\n10\n71\n{a}\n1\nNOTE\n"
            ))
        };
        let top_left = with_attachment(1);
        let bottom_left = with_attachment(7);
        let y_top = text_y(&render_svg("f", &top_left, &extents_of(&top_left), &limits()).unwrap().svg);
        let y_bottom = text_y(&render_svg("f", &bottom_left, &extents_of(&bottom_left), &limits()).unwrap().svg);
        // SVG y grows downwards: top-left text sits 15 units lower.
        assert!((y_top - y_bottom - 15.0).abs() < 1e-2, "{y_top} vs {y_bottom}");
    }
}
