//! Manifest building: parsed drawing → [`Manifest`], plus the read-only
//! text-extraction view used for indexing.
//!
//! One traversal classifies every entity, assigns its id, computes its world
//! box, and updates statistics, layer list, and extents. Normalised boxes need
//! the final extents, so they are filled in afterwards.

use crate::error::ParseError;
use crate::output::{ConversionStatus, Entity, Extents, Manifest, Statistics};
use crate::pipeline::dxf::{self, Drawing, Geometry, Point2};
use crate::pipeline::input::NormalizedInput;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use tracing::{debug, warn};

/// Build the manifest for a normalised input.
///
/// Never fails: a failed normalisation or a [`ParseError`] yields an
/// entity-empty `conversion_failed` manifest. The parsed drawing is returned
/// alongside for the renderer.
pub fn build_manifest(
    input: &NormalizedInput,
    file_id: &str,
    sheet_id: &str,
) -> (Manifest, Option<Drawing>) {
    let Some(path) = input.path.as_deref() else {
        let message = input
            .error_message()
            .unwrap_or_else(|| "drawing could not be normalised".to_string());
        return (
            Manifest::failed(file_id, sheet_id, &input.source_file, message),
            None,
        );
    };

    match dxf::read_dxf(path) {
        Ok(drawing) => {
            let manifest =
                manifest_from_drawing(&drawing, file_id, sheet_id, &input.source_file, input.status);
            (manifest, Some(drawing))
        }
        Err(e) => (parse_failure(file_id, sheet_id, &input.source_file, &e), None),
    }
}

/// Degraded manifest for a parse failure.
pub fn parse_failure(file_id: &str, sheet_id: &str, source_file: &str, err: &ParseError) -> Manifest {
    warn!(file_id, file = source_file, "DXF parse failed: {err}");
    Manifest::failed(file_id, sheet_id, source_file, err.to_string())
}

/// Build a manifest from an already-parsed drawing.
pub fn manifest_from_drawing(
    drawing: &Drawing,
    file_id: &str,
    sheet_id: &str,
    source_file: &str,
    status: ConversionStatus,
) -> Manifest {
    let units = dxf::units_name(drawing.header.insunits).to_string();
    let mut statistics = Statistics::default();
    let mut layers: Vec<String> = drawing.layers.iter().map(|l| l.name.clone()).collect();
    let mut entities = Vec::with_capacity(drawing.entities.len());
    let mut boxes: Vec<Option<[f64; 4]>> = Vec::with_capacity(drawing.entities.len());
    let mut extents: Option<[f64; 4]> = None;

    for (index, source) in drawing.entities.iter().enumerate() {
        let bbox = geometry_bbox(&source.geometry);
        if let Some(b) = bbox {
            extents = Some(match extents {
                Some(e) => union(e, b),
                None => b,
            });
        }
        statistics.record(source.entity_type, &source.layer);
        if !layers.iter().any(|l| *l == source.layer) {
            layers.push(source.layer.clone());
        }

        let mut extra = source.extra.clone();
        if bbox.is_none() {
            extra.insert("has_geometry".into(), serde_json::json!(false));
        }
        if source.entity_type == crate::output::EntityType::Dimension {
            extra.insert("unit".into(), serde_json::json!(units));
        }

        entities.push(Entity {
            id: format!("ent_{:06}", index + 1),
            entity_type: source.entity_type,
            raw_text: if source.entity_type.is_textual() {
                Some(source.text.clone().unwrap_or_default())
            } else {
                None
            },
            layer: source.layer.clone(),
            bbox_world: [0.0; 4],
            bbox_norm: [0.0; 4],
            extra,
        });
        boxes.push(bbox);
    }

    let extents = match extents {
        Some([x1, y1, x2, y2]) => Extents {
            min: [x1, y1],
            max: [x2, y2],
        },
        None => Extents::ZERO,
    };

    for (entity, bbox) in entities.iter_mut().zip(boxes) {
        let world = bbox.unwrap_or([
            extents.min[0],
            extents.min[1],
            extents.min[0],
            extents.min[1],
        ]);
        entity.bbox_world = world;
        entity.bbox_norm = normalise_bbox(&world, &extents);
    }

    let scale = drawing
        .header
        .dimscale
        .filter(|s| *s > 0.0 && s.is_finite())
        .unwrap_or(1.0);

    debug!(
        file_id,
        entities = entities.len(),
        layers = layers.len(),
        "manifest built"
    );

    Manifest {
        file_id: file_id.to_string(),
        sheet_id: sheet_id.to_string(),
        source_file: source_file.to_string(),
        conversion_status: status,
        error_message: None,
        units,
        scale,
        dxf_version: drawing
            .header
            .acad_version
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        extents,
        entities,
        layers,
        statistics,
    }
}

/// Rescale a world box into `[0, 1]` against `extents`.
///
/// An axis with zero span maps every coordinate to `0.5`.
pub fn normalise_bbox(bbox: &[f64; 4], extents: &Extents) -> [f64; 4] {
    let axis = |v: f64, min: f64, max: f64| {
        let span = max - min;
        if span <= 0.0 || !span.is_finite() {
            0.5
        } else {
            ((v - min) / span).clamp(0.0, 1.0)
        }
    };
    [
        axis(bbox[0], extents.min[0], extents.max[0]),
        axis(bbox[1], extents.min[1], extents.max[1]),
        axis(bbox[2], extents.min[0], extents.max[0]),
        axis(bbox[3], extents.min[1], extents.max[1]),
    ]
}

// ── Bounding boxes ───────────────────────────────────────────────────────

fn union(a: [f64; 4], b: [f64; 4]) -> [f64; 4] {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].max(b[2]), a[3].max(b[3])]
}

fn bbox_of_points(points: &[Point2]) -> Option<[f64; 4]> {
    let first = points.first()?;
    let init = [first.x, first.y, first.x, first.y];
    Some(
        points
            .iter()
            .fold(init, |b, p| [b[0].min(p.x), b[1].min(p.y), b[2].max(p.x), b[3].max(p.y)]),
    )
}

/// 2D world box of a geometry; `None` when it has no position.
pub fn geometry_bbox(geometry: &Geometry) -> Option<[f64; 4]> {
    let bbox = match geometry {
        Geometry::Segment { start, end } => bbox_of_points(&[*start, *end]),
        Geometry::Polyline { points, .. } => bbox_of_points(points),
        Geometry::Points(points) => bbox_of_points(points),
        Geometry::Circle { center, radius } => Some([
            center.x - radius,
            center.y - radius,
            center.x + radius,
            center.y + radius,
        ]),
        Geometry::Arc {
            center,
            radius,
            start_angle,
            end_angle,
        } => Some(arc_bbox(*center, *radius, *start_angle, *end_angle)),
        Geometry::Ellipse {
            center,
            major_axis,
            ratio,
            start_param,
            end_param,
        } => Some(ellipse_bbox(*center, *major_axis, *ratio, *start_param, *end_param)),
        Geometry::Label {
            insert,
            width,
            height,
            rotation,
            attachment,
        } => Some(label_bbox(*insert, *width, *height, *rotation, *attachment)),
        Geometry::Empty => None,
    }?;
    bbox.iter().all(|v| v.is_finite()).then_some(bbox)
}

/// Exact arc box: endpoints plus every axis crossing inside the sweep.
fn arc_bbox(center: Point2, radius: f64, start_deg: f64, end_deg: f64) -> [f64; 4] {
    let start = start_deg.to_radians().rem_euclid(TAU);
    let mut sweep = (end_deg.to_radians().rem_euclid(TAU) - start).rem_euclid(TAU);
    if sweep == 0.0 {
        sweep = TAU;
    }
    let at = |a: f64| Point2::new(center.x + radius * a.cos(), center.y + radius * a.sin());

    let mut points = vec![at(start), at(start + sweep)];
    for k in 0..4 {
        let axis = k as f64 * TAU / 4.0;
        let offset = (axis - start).rem_euclid(TAU);
        if offset <= sweep {
            points.push(at(axis));
        }
    }
    bbox_of_points(&points).unwrap_or([center.x, center.y, center.x, center.y])
}

fn ellipse_bbox(center: Point2, major: Point2, ratio: f64, start: f64, end: f64) -> [f64; 4] {
    // Minor axis is the major axis turned 90° CCW, scaled by `ratio`.
    let minor = Point2::new(-major.y * ratio, major.x * ratio);
    let mut sweep = (end - start).rem_euclid(TAU);
    if sweep == 0.0 && (end - start).abs() > 0.0 {
        sweep = TAU;
    }
    if sweep >= TAU - 1e-9 || (end - start).abs() >= TAU - 1e-9 {
        let half_w = (major.x * major.x + minor.x * minor.x).sqrt();
        let half_h = (major.y * major.y + minor.y * minor.y).sqrt();
        return [center.x - half_w, center.y - half_h, center.x + half_w, center.y + half_h];
    }
    const SAMPLES: usize = 64;
    let points: Vec<Point2> = (0..=SAMPLES)
        .map(|i| {
            let t = start + sweep * i as f64 / SAMPLES as f64;
            Point2::new(
                center.x + major.x * t.cos() + minor.x * t.sin(),
                center.y + major.y * t.cos() + minor.y * t.sin(),
            )
        })
        .collect();
    bbox_of_points(&points).unwrap_or([center.x, center.y, center.x, center.y])
}

/// Lower-left corner of a text box relative to its insertion point, before
/// rotation.
pub(crate) fn attachment_offset(width: f64, height: f64, attachment: Option<i16>) -> (f64, f64) {
    match attachment {
        Some(a @ 1..=9) => {
            let col = f64::from((a - 1) % 3);
            let dy = match (a - 1) / 3 {
                0 => -height,
                1 => -height / 2.0,
                _ => 0.0,
            };
            (-width * col / 2.0, dy)
        }
        _ => (0.0, 0.0),
    }
}

/// Text box from its insertion point.
///
/// `attachment` follows the MTEXT 1–9 grid (top-left … bottom-right); `None`
/// is a TEXT baseline-left anchor.
fn label_bbox(insert: Point2, width: f64, height: f64, rotation_deg: f64, attachment: Option<i16>) -> [f64; 4] {
    let (dx, dy) = attachment_offset(width, height, attachment);
    let (sin, cos) = rotation_deg.to_radians().sin_cos();
    let corners = [
        (dx, dy),
        (dx + width, dy),
        (dx + width, dy + height),
        (dx, dy + height),
    ]
    .map(|(x, y)| Point2::new(insert.x + x * cos - y * sin, insert.y + x * sin + y * cos));
    bbox_of_points(&corners).unwrap_or([insert.x, insert.y, insert.x, insert.y])
}

// ── Text extraction view ─────────────────────────────────────────────────

/// Plain text of a manifest for the indexer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextExtract {
    /// Empty (never absent) when the manifest carries no text.
    pub text: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Concatenate all TEXT / MTEXT / DIMENSION strings, optionally grouped by
/// layer, behind a short header.
pub fn extract_text(manifest: &Manifest, group_by_layer: bool) -> TextExtract {
    let mut metadata = BTreeMap::new();
    metadata.insert("file_id".to_string(), serde_json::json!(manifest.file_id));
    metadata.insert("source_file".to_string(), serde_json::json!(manifest.source_file));
    metadata.insert("sheet_id".to_string(), serde_json::json!(manifest.sheet_id));
    metadata.insert("units".to_string(), serde_json::json!(manifest.units));
    metadata.insert(
        "total_entities".to_string(),
        serde_json::json!(manifest.statistics.total_entities),
    );
    metadata.insert(
        "text_entities".to_string(),
        serde_json::json!(manifest.text_entity_count()),
    );
    metadata.insert(
        "conversion_status".to_string(),
        serde_json::json!(manifest.conversion_status),
    );

    let lines: Vec<(&str, String)> = manifest
        .entities
        .iter()
        .filter_map(|e| {
            let text = e.raw_text.as_deref()?.trim();
            (!text.is_empty()).then(|| (e.layer.as_str(), format!("[{}] {}", e.entity_type.as_str(), text)))
        })
        .collect();

    if lines.is_empty() {
        return TextExtract {
            text: String::new(),
            metadata,
        };
    }

    let mut text = format!(
        "CAD drawing: {}\nUnits: {}\nEntities: {} total, {} with text\nLayers: {}\n",
        manifest.source_file,
        manifest.units,
        manifest.statistics.total_entities,
        lines.len(),
        manifest.layers.join(", ")
    );

    if group_by_layer {
        let mut by_layer: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (layer, line) in &lines {
            by_layer.entry(*layer).or_default().push(line.as_str());
        }
        for (layer, layer_lines) in by_layer {
            text.push_str(&format!("\n=== Layer: {layer} ===\n"));
            for line in layer_lines {
                text.push_str(line);
                text.push('\n');
            }
        }
    } else {
        text.push('\n');
        for (_, line) in &lines {
            text.push_str(line);
            text.push('\n');
        }
    }

    TextExtract { text, metadata }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::EntityType;
    use crate::pipeline::dxf::parse_dxf;

    fn manifest(body: &str) -> Manifest {
        let src = format!("0\nSECTION\n2\nENTITIES\n{body}0\nENDSEC\n0\nEOF\n");
        let drawing = parse_dxf(&src).unwrap();
        manifest_from_drawing(&drawing, "f1", "Model", "t.dxf", ConversionStatus::AlreadyNative)
    }

    fn close(a: [f64; 4], b: [f64; 4]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn empty_drawing_gives_zero_box() {
        let m = manifest("");
        assert!(m.entities.is_empty());
        assert_eq!(m.extents, Extents::ZERO);
        assert_eq!(m.statistics, Statistics::default());
        assert_eq!(m.conversion_status, ConversionStatus::AlreadyNative);
    }

    #[test]
    fn ids_are_sequential_and_padded() {
        let m = manifest("0\nLINE\n10\n0\n20\n0\n11\n1\n21\n1\n0\nCIRCLE\n10\n5\n20\n5\n40\n1\n");
        assert_eq!(m.entities[0].id, "ent_000001");
        assert_eq!(m.entities[1].id, "ent_000002");
        assert!(m.invariant_violations().is_empty(), "{:?}", m.invariant_violations());
    }

    #[test]
    fn extents_union_and_normalisation() {
        let m = manifest("0\nLINE\n10\n0\n20\n0\n11\n10\n21\n0\n0\nCIRCLE\n10\n5\n20\n5\n40\n5\n");
        assert_eq!(m.extents.min, [0.0, 0.0]);
        assert_eq!(m.extents.max, [10.0, 10.0]);
        assert!(close(m.entities[0].bbox_norm, [0.0, 0.0, 1.0, 0.0]));
        assert!(close(m.entities[1].bbox_norm, [0.0, 0.0, 1.0, 1.0]));
    }

    #[test]
    fn degenerate_axis_maps_to_half() {
        // Horizontal line only: y span is zero.
        let m = manifest("0\nLINE\n10\n0\n20\n3\n11\n8\n21\n3\n");
        let n = m.entities[0].bbox_norm;
        assert_eq!(n[1], 0.5);
        assert_eq!(n[3], 0.5);
        assert_eq!(n[0], 0.0);
        assert_eq!(n[2], 1.0);
    }

    #[test]
    fn single_point_is_degenerate_on_both_axes() {
        let m = manifest("0\nPOINT\n10\n4\n20\n4\n");
        assert_eq!(m.entities[0].bbox_norm, [0.5; 4]);
        assert_eq!(m.entities[0].entity_type, EntityType::Other);
    }

    #[test]
    fn entity_without_geometry_sits_at_extents_min() {
        let m = manifest("0\nLINE\n10\n2\n20\n2\n11\n4\n21\n6\n0\nXRECORD\n8\nMETA\n");
        let e = &m.entities[1];
        assert_eq!(e.bbox_world, [2.0, 2.0, 2.0, 2.0]);
        assert_eq!(e.extra["has_geometry"], serde_json::json!(false));
        assert!(m.invariant_violations().is_empty());
    }

    #[test]
    fn quarter_arc_box_is_exact() {
        let b = arc_bbox(Point2::new(0.0, 0.0), 1.0, 0.0, 90.0);
        assert!(close(b, [0.0, 0.0, 1.0, 1.0]), "{b:?}");
        let b = arc_bbox(Point2::new(0.0, 0.0), 1.0, 45.0, 135.0);
        let s = std::f64::consts::FRAC_1_SQRT_2;
        assert!(close(b, [-s, s, s, 1.0]), "{b:?}");
    }

    #[test]
    fn arc_crossing_zero_degrees() {
        let b = arc_bbox(Point2::new(0.0, 0.0), 2.0, 270.0, 90.0);
        assert!(close(b, [0.0, -2.0, 2.0, 2.0]), "{b:?}");
    }

    #[test]
    fn full_ellipse_box() {
        let b = ellipse_bbox(Point2::new(0.0, 0.0), Point2::new(4.0, 0.0), 0.5, 0.0, TAU);
        assert!(close(b, [-4.0, -2.0, 4.0, 2.0]), "{b:?}");
    }

    #[test]
    fn rotated_text_box() {
        let b = label_bbox(Point2::new(0.0, 0.0), 6.0, 1.0, 90.0, None);
        assert!(close(b, [-1.0, 0.0, 0.0, 6.0]), "{b:?}");
    }

    #[test]
    fn mtext_top_left_attachment_hangs_below_insert() {
        let b = label_bbox(Point2::new(0.0, 10.0), 4.0, 2.0, 0.0, Some(1));
        assert!(close(b, [0.0, 8.0, 4.0, 10.0]), "{b:?}");
    }

    #[test]
    fn text_width_heuristic() {
        let m = manifest("0\nTEXT\n8\nNOTES\n10\n0\n20\n0\n40\n2\n1\nABCDE\n");
        // 5 chars × 2 × 0.6 = 6 wide, 2 high.
        assert!(close(m.entities[0].bbox_world, [0.0, 0.0, 6.0, 2.0]));
        assert_eq!(m.entities[0].raw_text.as_deref(), Some("ABCDE"));
    }

    #[test]
    fn z_is_ignored() {
        let a = manifest("0\nLINE\n10\n0\n20\n0\n30\n0\n11\n1\n21\n1\n31\n0\n");
        let b = manifest("0\nLINE\n10\n0\n20\n0\n30\n500\n11\n1\n21\n1\n31\n-900\n");
        assert_eq!(a.entities[0].bbox_world, b.entities[0].bbox_world);
    }

    #[test]
    fn dimension_gets_unit() {
        let src = "0\nSECTION\n2\nHEADER\n9\n$INSUNITS\n70\n4\n0\nENDSEC\n0\nSECTION\n2\nENTITIES\n0\nDIMENSION\n10\n0\n20\n0\n42\n25\n0\nENDSEC\n0\nEOF\n";
        let d = parse_dxf(src).unwrap();
        let m = manifest_from_drawing(&d, "f", "Model", "d.dxf", ConversionStatus::AlreadyNative);
        assert_eq!(m.units, "millimeters");
        assert_eq!(m.entities[0].extra["unit"], serde_json::json!("millimeters"));
        assert_eq!(m.entities[0].raw_text.as_deref(), Some("25"));
    }

    #[test]
    fn layers_unique_first_seen() {
        let m = manifest("0\nLINE\n8\nB\n0\nLINE\n8\nA\n0\nLINE\n8\nB\n");
        assert_eq!(m.layers, vec!["B".to_string(), "A".to_string()]);
        assert_eq!(m.statistics.entities_per_layer["B"], 2);
    }

    #[test]
    fn text_view_empty_for_textless_manifest() {
        let m = manifest("0\nLINE\n10\n0\n20\n0\n11\n1\n21\n1\n");
        let view = extract_text(&m, true);
        assert_eq!(view.text, "");
        assert_eq!(view.metadata["total_entities"], serde_json::json!(1));
    }

    #[test]
    fn text_view_groups_by_layer() {
        let m = manifest(
            "0\nTEXT\n8\nTITLE\n10\n0\n20\n0\n1\nBRACKET\n0\nTEXT\n8\nNOTES\n10\n0\n20\n5\n1\nDEBURR ALL EDGES\n",
        );
        let grouped = extract_text(&m, true);
        assert!(grouped.text.contains("=== Layer: NOTES ===\n[TEXT] DEBURR ALL EDGES"));
        assert!(grouped.text.starts_with("CAD drawing: t.dxf"));
        let flat = extract_text(&m, false);
        assert!(!flat.text.contains("=== Layer"));
        assert!(flat.text.contains("[TEXT] BRACKET\n[TEXT] DEBURR ALL EDGES"));
    }

    #[test]
    fn failed_manifest_from_failed_input() {
        let n = crate::pipeline::input::normalize_blocking(
            &crate::pipeline::input::Upload::bytes("x.bin", vec![1, 2, 3]),
            None,
            std::time::Duration::from_secs(1),
            None,
        );
        let (m, drawing) = build_manifest(&n, "f9", "Model");
        assert!(drawing.is_none());
        assert!(m.is_failed());
        assert!(m.invariant_violations().is_empty());
    }
}
