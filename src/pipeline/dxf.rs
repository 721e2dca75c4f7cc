//! ASCII DXF reader: group-code pairs → 2D drawing geometry.
//!
//! DXF is a flat stream of `(group code, value)` line pairs. Code `0` starts a
//! new record, codes `10/20` carry the primary point, `11/21` the secondary
//! point and so on. We read the `HEADER` variables we need, the `LAYER` table
//! and the `ENTITIES` section; every other section is skipped.
//!
//! Z coordinates (codes 30–38) are never read: all geometry is treated as 2D.
//! Numeric values that fail to parse are a [`ParseError`]; missing optional
//! groups take their DXF defaults (0 for coordinates).

use crate::error::ParseError;
use crate::output::EntityType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::TAU;

/// 2D point in drawing units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// The header variables the manifest needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawingHeader {
    /// `$ACADVER`, e.g. `AC1027`.
    pub acad_version: Option<String>,
    /// `$INSUNITS` code.
    pub insunits: Option<i32>,
    /// `$DIMSCALE`.
    pub dimscale: Option<f64>,
}

/// An entry of the `LAYER` table.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDef {
    pub name: String,
    /// AutoCAD Color Index; negative means the layer is off.
    pub color: Option<i16>,
}

/// Geometry of one entity, already projected onto the XY plane.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Segment {
        start: Point2,
        end: Point2,
    },
    Polyline {
        points: Vec<Point2>,
        closed: bool,
    },
    Circle {
        center: Point2,
        radius: f64,
    },
    /// Angles in degrees, counter-clockwise from +X.
    Arc {
        center: Point2,
        radius: f64,
        start_angle: f64,
        end_angle: f64,
    },
    /// `major_axis` is relative to `center`; params in radians.
    Ellipse {
        center: Point2,
        major_axis: Point2,
        ratio: f64,
        start_param: f64,
        end_param: f64,
    },
    /// A text box anchored at `insert`.
    Label {
        insert: Point2,
        width: f64,
        height: f64,
        rotation: f64,
        /// MTEXT attachment point 1–9; `None` means baseline-left (TEXT).
        attachment: Option<i16>,
    },
    /// Loose definition points (dimensions, inserts, unknown entities).
    Points(Vec<Point2>),
    /// Nothing with a position.
    Empty,
}

/// One classified entity.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawingEntity {
    /// Raw DXF entity name, e.g. `LWPOLYLINE`.
    pub dxf_type: String,
    pub entity_type: EntityType,
    pub layer: String,
    pub geometry: Geometry,
    /// Literal text for TEXT / MTEXT / DIMENSION.
    pub text: Option<String>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A parsed DXF file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Drawing {
    pub header: DrawingHeader,
    pub layers: Vec<LayerDef>,
    pub entities: Vec<DrawingEntity>,
}

impl Drawing {
    /// ACI colour of `layer`, if the layer table defines one.
    pub fn layer_color(&self, layer: &str) -> Option<i16> {
        self.layers
            .iter()
            .find(|l| l.name == layer)
            .and_then(|l| l.color)
    }
}

/// Parse DXF text into a [`Drawing`].
pub fn parse_dxf(source: &str) -> Result<Drawing, ParseError> {
    DxfParser::new(source).parse()
}

/// Read and parse a DXF file, tolerating non-UTF-8 bytes (legacy code pages).
pub fn read_dxf(path: &std::path::Path) -> Result<Drawing, ParseError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ParseError::new(0, format!("cannot read {}: {e}", path.display())))?;
    let text = String::from_utf8_lossy(&bytes);
    parse_dxf(&text)
}

/// Decode `$INSUNITS` into a unit name.
pub fn units_name(insunits: Option<i32>) -> &'static str {
    match insunits {
        None | Some(0) => "unitless",
        Some(1) => "inches",
        Some(2) => "feet",
        Some(3) => "miles",
        Some(4) => "millimeters",
        Some(5) => "centimeters",
        Some(6) => "meters",
        Some(7) => "kilometers",
        Some(8) => "microinches",
        Some(9) => "mils",
        Some(10) => "yards",
        Some(11) => "angstroms",
        Some(12) => "nanometers",
        Some(13) => "microns",
        Some(14) => "decimeters",
        Some(15) => "decameters",
        Some(16) => "hectometers",
        Some(17) => "gigameters",
        Some(18) => "astronomical units",
        Some(19) => "light years",
        Some(20) => "parsecs",
        Some(_) => "unknown",
    }
}

// ── Reader ───────────────────────────────────────────────────────────────

const COMMENT_CODE: i32 = 999;

struct DxfReader<'a> {
    lines: std::str::Lines<'a>,
    buffer: Option<(i32, String)>,
    line_number: usize,
}

impl<'a> DxfReader<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            lines: source.trim_start_matches('\u{feff}').lines(),
            buffer: None,
            line_number: 0,
        }
    }

    /// Next group pair, with `999` comments dropped wherever they appear.
    fn next_pair(&mut self) -> Result<Option<(i32, String)>, ParseError> {
        if let Some(pair) = self.buffer.take() {
            return Ok(Some(pair));
        }
        loop {
            match self.read_pair()? {
                Some((COMMENT_CODE, _)) => continue,
                other => return Ok(other),
            }
        }
    }

    fn read_pair(&mut self) -> Result<Option<(i32, String)>, ParseError> {
        // Blank trailing lines after EOF are common; skip them.
        let code_line = loop {
            match self.lines.next() {
                Some(line) => {
                    self.line_number += 1;
                    if !line.trim().is_empty() {
                        break line;
                    }
                }
                None => return Ok(None),
            }
        };

        let value_line = match self.lines.next() {
            Some(line) => {
                self.line_number += 1;
                line
            }
            None => {
                return Err(ParseError::new(
                    self.line_number,
                    "file ends after a group code without its value line",
                ));
            }
        };

        let code = code_line.trim().parse::<i32>().map_err(|_| {
            ParseError::new(
                self.line_number - 1,
                format!("group code \"{}\" is not an integer", code_line.trim()),
            )
        })?;
        let value = value_line.trim_end_matches('\r').to_string();
        Ok(Some((code, value)))
    }

    fn put_back(&mut self, pair: (i32, String)) {
        debug_assert!(self.buffer.is_none(), "put_back called twice");
        self.buffer = Some(pair);
    }
}

// ── Parser ───────────────────────────────────────────────────────────────

/// The group codes of one record, in file order.
struct RawRecord {
    kind: String,
    line: usize,
    codes: Vec<(i32, String)>,
}

impl RawRecord {
    fn first(&self, code: i32) -> Option<&str> {
        self.codes
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }

    fn f64(&self, code: i32) -> Result<Option<f64>, ParseError> {
        self.first(code)
            .map(|raw| parse_f64(raw, code, self.line))
            .transpose()
    }

    fn f64_or(&self, code: i32, default: f64) -> Result<f64, ParseError> {
        Ok(self.f64(code)?.unwrap_or(default))
    }

    fn i32(&self, code: i32) -> Result<Option<i32>, ParseError> {
        self.first(code)
            .map(|raw| parse_i32(raw, code, self.line))
            .transpose()
    }

    /// Point stored under `x_code` / `x_code + 10`.
    fn point(&self, x_code: i32) -> Result<Option<Point2>, ParseError> {
        let x = self.f64(x_code)?;
        let y = self.f64(x_code + 10)?;
        Ok(match (x, y) {
            (None, None) => None,
            (x, y) => Some(Point2::new(x.unwrap_or(0.0), y.unwrap_or(0.0))),
        })
    }

    fn point_or_origin(&self, x_code: i32) -> Result<Point2, ParseError> {
        Ok(self.point(x_code)?.unwrap_or_default())
    }

    /// Every point under codes 10–18, in code order.
    fn all_points(&self) -> Result<Vec<Point2>, ParseError> {
        let mut points = Vec::new();
        for x_code in 10..=18 {
            if let Some(p) = self.point(x_code)? {
                points.push(p);
            }
        }
        Ok(points)
    }

    /// Repeated `10/20` vertex pairs (LWPOLYLINE).
    fn vertex_list(&self) -> Result<Vec<Point2>, ParseError> {
        let mut points: Vec<Point2> = Vec::new();
        for (code, raw) in &self.codes {
            match code {
                10 => points.push(Point2::new(parse_f64(raw, 10, self.line)?, 0.0)),
                20 => {
                    if let Some(last) = points.last_mut() {
                        last.y = parse_f64(raw, 20, self.line)?;
                    }
                }
                _ => {}
            }
        }
        Ok(points)
    }

    fn layer(&self) -> String {
        match self.first(8).map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => "0".to_string(),
        }
    }
}

struct DxfParser<'a> {
    reader: DxfReader<'a>,
}

impl<'a> DxfParser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            reader: DxfReader::new(source),
        }
    }

    fn parse(mut self) -> Result<Drawing, ParseError> {
        let mut drawing = Drawing::default();
        let mut saw_structure = false;

        while let Some((code, value)) = self.reader.next_pair()? {
            if code != 0 {
                return Err(ParseError::new(
                    self.reader.line_number,
                    format!("unexpected group code {code} (expected 0 SECTION/EOF)"),
                ));
            }
            match value.trim() {
                "SECTION" => {
                    saw_structure = true;
                    let (name_code, name) = self.reader.next_pair()?.ok_or_else(|| {
                        ParseError::new(self.reader.line_number, "SECTION without a name")
                    })?;
                    if name_code != 2 {
                        return Err(ParseError::new(
                            self.reader.line_number,
                            format!("SECTION name uses group code {name_code} (expected 2)"),
                        ));
                    }
                    match name.trim() {
                        "HEADER" => self.parse_header(&mut drawing.header)?,
                        "TABLES" => self.parse_tables(&mut drawing.layers)?,
                        "ENTITIES" => self.parse_entities(&mut drawing.entities)?,
                        _ => self.skip_section()?,
                    }
                }
                "EOF" => {
                    saw_structure = true;
                    break;
                }
                unexpected => {
                    return Err(ParseError::new(
                        self.reader.line_number,
                        format!("unexpected marker {unexpected}, expected SECTION or EOF"),
                    ));
                }
            }
        }

        if !saw_structure {
            return Err(ParseError::new(0, "no DXF sections found"));
        }
        Ok(drawing)
    }

    fn skip_section(&mut self) -> Result<(), ParseError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) if value.trim() == "ENDSEC" => return Ok(()),
                Some(_) => continue,
                None => {
                    return Err(ParseError::new(
                        self.reader.line_number,
                        "SECTION is missing its ENDSEC",
                    ))
                }
            }
        }
    }

    fn parse_header(&mut self, header: &mut DrawingHeader) -> Result<(), ParseError> {
        let mut current: Option<String> = None;
        loop {
            let (code, value) = self.reader.next_pair()?.ok_or_else(|| {
                ParseError::new(self.reader.line_number, "HEADER section ended early")
            })?;
            match code {
                0 if value.trim() == "ENDSEC" => return Ok(()),
                9 => current = Some(value.trim().to_string()),
                _ => {
                    let line = self.reader.line_number;
                    match (current.as_deref(), code) {
                        (Some("$ACADVER"), 1) => header.acad_version = Some(value.trim().to_string()),
                        (Some("$INSUNITS"), 70) => header.insunits = Some(parse_i32(&value, code, line)?),
                        (Some("$DIMSCALE"), 40) => header.dimscale = Some(parse_f64(&value, code, line)?),
                        _ => {}
                    }
                }
            }
        }
    }

    fn parse_tables(&mut self, layers: &mut Vec<LayerDef>) -> Result<(), ParseError> {
        loop {
            let (code, value) = self.reader.next_pair()?.ok_or_else(|| {
                ParseError::new(self.reader.line_number, "TABLES section ended early")
            })?;
            if code != 0 {
                continue;
            }
            match value.trim() {
                "ENDSEC" => return Ok(()),
                "LAYER" => {
                    let record = self.read_record("LAYER")?;
                    // The TABLE header for layers is also "0 TABLE / 2 LAYER"; only
                    // real LAYER records reach here.
                    if let Some(name) = record.first(2).map(str::trim).filter(|n| !n.is_empty()) {
                        let color = record
                            .i32(62)?
                            .and_then(|c| i16::try_from(c).ok());
                        if !layers.iter().any(|l| l.name == name) {
                            layers.push(LayerDef {
                                name: name.to_string(),
                                color,
                            });
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn parse_entities(&mut self, out: &mut Vec<DrawingEntity>) -> Result<(), ParseError> {
        loop {
            let (code, value) = self.reader.next_pair()?.ok_or_else(|| {
                ParseError::new(self.reader.line_number, "ENTITIES section ended early")
            })?;
            if code != 0 {
                return Err(ParseError::new(
                    self.reader.line_number,
                    format!("group code {code} where an entity start (0) was expected"),
                ));
            }
            let kind = value.trim().to_string();
            match kind.as_str() {
                "ENDSEC" => return Ok(()),
                "SEQEND" | "VERTEX" => {
                    self.read_record(&kind)?;
                }
                "POLYLINE" => {
                    let record = self.read_record(&kind)?;
                    let vertices = self.read_polyline_vertices()?;
                    out.push(classify_polyline(&record, vertices)?);
                }
                _ => {
                    let record = self.read_record(&kind)?;
                    out.push(classify(&record)?);
                }
            }
        }
    }

    /// Collect pairs up to (not including) the next code-0 marker.
    fn read_record(&mut self, kind: &str) -> Result<RawRecord, ParseError> {
        let line = self.reader.line_number;
        let mut codes = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some(pair) => codes.push(pair),
                None => break,
            }
        }
        Ok(RawRecord {
            kind: kind.to_string(),
            line,
            codes,
        })
    }

    /// Old-style POLYLINE: VERTEX records until SEQEND.
    fn read_polyline_vertices(&mut self) -> Result<Vec<Point2>, ParseError> {
        let mut vertices = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) if value.trim() == "VERTEX" => {
                    let record = self.read_record("VERTEX")?;
                    vertices.push(record.point_or_origin(10)?);
                }
                Some((0, value)) if value.trim() == "SEQEND" => {
                    self.read_record("SEQEND")?;
                    return Ok(vertices);
                }
                Some(pair) => {
                    // A POLYLINE without SEQEND: stop at the next entity.
                    self.reader.put_back(pair);
                    return Ok(vertices);
                }
                None => return Ok(vertices),
            }
        }
    }
}

// ── Classification ───────────────────────────────────────────────────────

fn classify(record: &RawRecord) -> Result<DrawingEntity, ParseError> {
    let mut extra = BTreeMap::new();
    let mut text = None;

    let (entity_type, geometry) = match record.kind.as_str() {
        "LINE" => (
            EntityType::Line,
            Geometry::Segment {
                start: record.point_or_origin(10)?,
                end: record.point_or_origin(11)?,
            },
        ),
        "LWPOLYLINE" => {
            let closed = record.i32(70)?.unwrap_or(0) & 1 == 1;
            (
                EntityType::Line,
                Geometry::Polyline {
                    points: record.vertex_list()?,
                    closed,
                },
            )
        }
        "CIRCLE" => (
            EntityType::Circle,
            Geometry::Circle {
                center: record.point_or_origin(10)?,
                radius: record.f64_or(40, 0.0)?.abs(),
            },
        ),
        "ARC" => (
            EntityType::Arc,
            Geometry::Arc {
                center: record.point_or_origin(10)?,
                radius: record.f64_or(40, 0.0)?.abs(),
                start_angle: record.f64_or(50, 0.0)?,
                end_angle: record.f64_or(51, 360.0)?,
            },
        ),
        "ELLIPSE" => {
            let ratio = record.f64_or(40, 1.0)?;
            (
                EntityType::Ellipse,
                Geometry::Ellipse {
                    center: record.point_or_origin(10)?,
                    major_axis: record.point_or_origin(11)?,
                    ratio: if ratio > 0.0 { ratio } else { 1.0 },
                    start_param: record.f64_or(41, 0.0)?,
                    end_param: record.f64_or(42, TAU)?,
                },
            )
        }
        "TEXT" | "ATTRIB" => {
            let content = decode_inline_text(record.first(1).unwrap_or_default());
            let height = positive_or(record.f64(40)?, 1.0);
            let rotation = record.f64_or(50, 0.0)?;
            extra.insert("height".into(), serde_json::json!(height));
            extra.insert("rotation".into(), serde_json::json!(rotation));
            extra.insert(
                "style".into(),
                serde_json::json!(record.first(7).map(str::trim).unwrap_or("Standard")),
            );
            let width = text_width(&content, height);
            text = Some(content);
            (
                EntityType::Text,
                Geometry::Label {
                    insert: record.point_or_origin(10)?,
                    width,
                    height,
                    rotation,
                    attachment: None,
                },
            )
        }
        "MTEXT" => {
            let mut raw = String::new();
            for (code, value) in &record.codes {
                if *code == 3 {
                    raw.push_str(value);
                }
            }
            raw.push_str(record.first(1).unwrap_or_default());
            let content = decode_mtext_content(&raw);
            let char_height = positive_or(record.f64(40)?, 1.0);
            let line_count = content.lines().count().max(1);
            let longest = content.lines().map(|l| l.chars().count()).max().unwrap_or(0);
            extra.insert("char_height".into(), serde_json::json!(char_height));
            extra.insert("line_count".into(), serde_json::json!(line_count));
            // Group 71 defaults to 1 (top-left).
            let attachment = Some(record.i32(71)?.and_then(|a| i16::try_from(a).ok()).unwrap_or(1));
            text = Some(content);
            (
                EntityType::Mtext,
                Geometry::Label {
                    insert: record.point_or_origin(10)?,
                    width: longest as f64 * char_height * 0.6,
                    height: line_count as f64 * char_height * 1.5,
                    rotation: record.f64_or(50, 0.0)?,
                    attachment,
                },
            )
        }
        "DIMENSION" => {
            let measurement = record.f64(42)?;
            let flags = record.i32(70)?.unwrap_or(0);
            extra.insert("dim_type".into(), serde_json::json!(dimension_kind(flags)));
            if let Some(m) = measurement {
                extra.insert("measurement".into(), serde_json::json!(m));
            }
            text = Some(dimension_text(record.first(1), measurement));
            let mut points = Vec::new();
            for code in [10, 11, 13, 14, 15, 16] {
                if let Some(p) = record.point(code)? {
                    points.push(p);
                }
            }
            (EntityType::Dimension, Geometry::Points(points))
        }
        _ => {
            let points = record.all_points()?;
            let geometry = if points.is_empty() {
                Geometry::Empty
            } else {
                Geometry::Points(points)
            };
            (EntityType::Other, geometry)
        }
    };

    extra.insert("dxf_type".into(), serde_json::json!(record.kind));
    Ok(DrawingEntity {
        dxf_type: record.kind.clone(),
        entity_type,
        layer: record.layer(),
        geometry,
        text,
        extra,
    })
}

fn classify_polyline(record: &RawRecord, vertices: Vec<Point2>) -> Result<DrawingEntity, ParseError> {
    let closed = record.i32(70)?.unwrap_or(0) & 1 == 1;
    let mut extra = BTreeMap::new();
    extra.insert("dxf_type".into(), serde_json::json!("POLYLINE"));
    Ok(DrawingEntity {
        dxf_type: "POLYLINE".to_string(),
        entity_type: EntityType::Line,
        layer: record.layer(),
        geometry: Geometry::Polyline {
            points: vertices,
            closed,
        },
        text: None,
        extra,
    })
}

fn dimension_kind(flags: i32) -> &'static str {
    match flags & 0x0F {
        0 => "linear",
        1 => "aligned",
        2 => "angular",
        3 => "diameter",
        4 => "radius",
        5 => "angular_3point",
        6 => "ordinate",
        _ => "unknown",
    }
}

/// Dimension display text: `<>` stands for the measured value.
fn dimension_text(override_text: Option<&str>, measurement: Option<f64>) -> String {
    let measured = measurement.map(format_measurement).unwrap_or_default();
    match override_text.map(str::trim) {
        None | Some("") => measured,
        Some(t) if t.contains("<>") => decode_inline_text(&t.replace("<>", &measured)),
        Some(t) => decode_inline_text(t),
    }
}

fn format_measurement(value: f64) -> String {
    let s = format!("{value:.4}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

fn text_width(content: &str, height: f64) -> f64 {
    content.chars().count() as f64 * height * 0.6
}

fn positive_or(value: Option<f64>, default: f64) -> f64 {
    match value {
        Some(v) if v > 0.0 && v.is_finite() => v,
        _ => default,
    }
}

fn parse_f64(raw: &str, code: i32, line: usize) -> Result<f64, ParseError> {
    let v = raw.trim().parse::<f64>().map_err(|_| {
        ParseError::new(line, format!("group {code}: \"{}\" is not a number", raw.trim()))
    })?;
    if !v.is_finite() {
        return Err(ParseError::new(line, format!("group {code}: non-finite value")));
    }
    Ok(v)
}

fn parse_i32(raw: &str, code: i32, line: usize) -> Result<i32, ParseError> {
    raw.trim().parse::<i32>().map_err(|_| {
        ParseError::new(line, format!("group {code}: \"{}\" is not an integer", raw.trim()))
    })
}

/// TEXT control codes: `%%c` Ø, `%%d` °, `%%p` ±, `%%u`/`%%o` toggles dropped.
fn decode_inline_text(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '%' && chars.peek() == Some(&'%') {
            chars.next();
            match chars.next() {
                Some('c') | Some('C') => result.push('Ø'),
                Some('d') | Some('D') => result.push('°'),
                Some('p') | Some('P') => result.push('±'),
                Some('%') => result.push('%'),
                Some('u') | Some('U') | Some('o') | Some('O') => {}
                Some(other) => {
                    result.push_str("%%");
                    result.push(other);
                }
                None => result.push_str("%%"),
            }
        } else if ch == '\\' {
            match chars.next() {
                Some('P') | Some('p') => result.push('\n'),
                Some('~') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(ch);
        }
    }
    result
}

/// Strip MTEXT inline formatting, keeping the visible characters.
fn decode_mtext_content(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' | '}' => {}
            '\\' => match chars.next() {
                Some('P') | Some('p') => result.push('\n'),
                Some('~') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('{') => result.push('{'),
                Some('}') => result.push('}'),
                // Parameterised codes run to the next ';'.
                Some('f') | Some('F') | Some('H') | Some('h') | Some('C') | Some('c')
                | Some('T') | Some('t') | Some('Q') | Some('q') | Some('W') | Some('w')
                | Some('A') | Some('a') => {
                    for next in chars.by_ref() {
                        if next == ';' {
                            break;
                        }
                    }
                }
                // Stacked fraction \Sa^b; → a/b
                Some('S') | Some('s') => {
                    let mut stacked = String::new();
                    for next in chars.by_ref() {
                        if next == ';' {
                            break;
                        }
                        stacked.push(match next {
                            '^' | '#' => '/',
                            other => other,
                        });
                    }
                    result.push_str(stacked.trim());
                }
                Some('L') | Some('l') | Some('O') | Some('o') | Some('K') | Some('k') => {}
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            },
            other => result.push(other),
        }
    }
    decode_inline_text(&result)
}
