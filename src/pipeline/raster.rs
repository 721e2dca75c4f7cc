//! Greyscale rasterisation of a parsed drawing.
//!
//! The raster feeds two consumers: the deterministic feature extractor
//! (line/circle detection, OCR) and vision-capable models. Geometry is drawn
//! black on white with one-pixel strokes; labels are drawn with a 5×7
//! bitmap font scaled to the text height so OCR has something to read.

use crate::error::RenderError;
use crate::output::Extents;
use crate::pipeline::dxf::{Drawing, Geometry, Point2};
use crate::pipeline::manifest::geometry_bbox;
use crate::pipeline::render::{ellipse_points, label_origin};
use image::{GrayImage, Luma};
use tracing::debug;

const INK: Luma<u8> = Luma([0]);
const PAPER: Luma<u8> = Luma([255]);
const MARGIN_PX: u32 = 16;

/// Raster the drawing so that its longer side is `max_pixels` wide.
pub fn rasterize(drawing: &Drawing, extents: &Extents, max_pixels: u32) -> Result<GrayImage, RenderError> {
    let w = extents.width();
    let h = extents.height();
    if drawing.entities.is_empty() || (w <= 0.0 && h <= 0.0) {
        return Err(RenderError::Empty {
            detail: "drawing has no spatial extent".to_string(),
        });
    }
    let usable = max_pixels.saturating_sub(2 * MARGIN_PX).max(16) as f64;
    let scale = usable / w.max(h);
    let img_w = (w * scale).ceil() as u32 + 2 * MARGIN_PX;
    let img_h = (h * scale).ceil() as u32 + 2 * MARGIN_PX;

    let mut canvas = Canvas {
        img: GrayImage::from_pixel(img_w.max(1), img_h.max(1), PAPER),
        min_x: extents.min[0],
        max_y: extents.max[1],
        scale,
        reach: 4.0 * f64::from(img_w.max(img_h)),
    };

    let mut skipped = 0usize;
    for entity in &drawing.entities {
        if geometry_bbox(&entity.geometry).is_none() {
            skipped += 1;
            continue;
        }
        match &entity.geometry {
            Geometry::Segment { start, end } => canvas.segment(*start, *end),
            Geometry::Polyline { points, closed } => {
                canvas.polyline(points);
                if *closed && points.len() > 2 {
                    canvas.segment(points[points.len() - 1], points[0]);
                }
            }
            Geometry::Circle { center, radius } => canvas.arc(*center, *radius, 0.0, 360.0),
            Geometry::Arc {
                center,
                radius,
                start_angle,
                end_angle,
            } => {
                let mut sweep = (end_angle - start_angle).rem_euclid(360.0);
                if sweep == 0.0 {
                    sweep = 360.0;
                }
                canvas.arc(*center, *radius, *start_angle, sweep);
            }
            Geometry::Ellipse {
                center,
                major_axis,
                ratio,
                start_param,
                end_param,
            } => canvas.polyline(&ellipse_points(*center, *major_axis, *ratio, *start_param, *end_param)),
            Geometry::Label {
                insert,
                width,
                height,
                rotation,
                attachment,
            } => {
                if let Some(text) = entity.text.as_deref() {
                    let (at, glyph) = label_origin(text, *insert, *width, *height, *rotation, *attachment);
                    canvas.text(text, at, glyph, *rotation);
                }
            }
            Geometry::Points(points) => {
                if entity.entity_type == crate::output::EntityType::Dimension && points.len() >= 2 {
                    canvas.polyline(points);
                }
            }
            Geometry::Empty => {}
        }
    }

    debug!(width = img_w, height = img_h, scale, skipped, "drawing rasterised");
    Ok(canvas.img)
}

struct Canvas {
    img: GrayImage,
    min_x: f64,
    max_y: f64,
    scale: f64,
    /// Pixel offsets are clamped to `±reach` so far-off points stay cheap to
    /// walk and never overflow.
    reach: f64,
}

impl Canvas {
    fn px(&self, p: Point2) -> (i64, i64) {
        let clamp = |v: f64| v.round().clamp(-self.reach, self.reach) as i64 + i64::from(MARGIN_PX);
        (
            clamp((p.x - self.min_x) * self.scale),
            clamp((self.max_y - p.y) * self.scale),
        )
    }

    fn put(&mut self, x: i64, y: i64) {
        if x >= 0 && y >= 0 && (x as u32) < self.img.width() && (y as u32) < self.img.height() {
            self.img.put_pixel(x as u32, y as u32, INK);
        }
    }

    fn segment(&mut self, a: Point2, b: Point2) {
        let (x0, y0) = self.px(a);
        let (x1, y1) = self.px(b);
        self.line_px(x0, y0, x1, y1);
    }

    /// Bresenham.
    fn line_px(&mut self, mut x0: i64, mut y0: i64, x1: i64, y1: i64) {
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.put(x0, y0);
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    fn polyline(&mut self, points: &[Point2]) {
        for pair in points.windows(2) {
            self.segment(pair[0], pair[1]);
        }
    }

    /// Arc from `start` degrees sweeping `sweep` degrees counter-clockwise.
    fn arc(&mut self, center: Point2, radius: f64, start: f64, sweep: f64) {
        let radius_px = radius * self.scale;
        let steps = ((radius_px * sweep.to_radians()).ceil() as usize).clamp(8, 4096);
        let mut prev: Option<Point2> = None;
        for i in 0..=steps {
            let t = (start + sweep * i as f64 / steps as f64).to_radians();
            let p = Point2::new(center.x + radius * t.cos(), center.y + radius * t.sin());
            if let Some(q) = prev {
                self.segment(q, p);
            }
            prev = Some(p);
        }
    }

    fn text(&mut self, text: &str, insert: Point2, height: f64, rotation: f64) {
        let side = f64::from(self.img.width().max(self.img.height()));
        let cell = (height * self.scale / 7.0).round().min(side) as i64;
        if cell < 1 {
            return;
        }
        let (ox, oy) = self.px(insert);
        let (sin, cos) = (-rotation.to_radians()).sin_cos();
        for (line_no, line) in text.lines().enumerate() {
            let base_row = line_no as i64 * 11;
            for (col_no, ch) in line.chars().enumerate() {
                let Some(columns) = glyph(ch) else { continue };
                for (gx, bits) in columns.iter().enumerate() {
                    for gy in 0..7 {
                        if (bits >> gy) & 1 == 0 {
                            continue;
                        }
                        // Glyph cell offsets, baseline at row 7.
                        let lx = (col_no as i64 * 6 + gx as i64) * cell;
                        let ly = (base_row + gy as i64 - 7) * cell;
                        for dy in 0..cell {
                            for dx in 0..cell {
                                let x = (lx + dx) as f64;
                                let y = (ly + dy) as f64;
                                let rx = ox + (x * cos - y * sin).round() as i64;
                                let ry = oy + (x * sin + y * cos).round() as i64;
                                self.put(rx, ry);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// 5×7 glyph columns, least significant bit at the top.
fn glyph(ch: char) -> Option<[u8; 5]> {
    let g = match ch.to_ascii_uppercase() {
        '0' => [0x3E, 0x51, 0x49, 0x45, 0x3E],
        '1' => [0x00, 0x42, 0x7F, 0x40, 0x00],
        '2' => [0x42, 0x61, 0x51, 0x49, 0x46],
        '3' => [0x21, 0x41, 0x45, 0x4B, 0x31],
        '4' => [0x18, 0x14, 0x12, 0x7F, 0x10],
        '5' => [0x27, 0x45, 0x45, 0x45, 0x39],
        '6' => [0x3C, 0x4A, 0x49, 0x49, 0x30],
        '7' => [0x01, 0x71, 0x09, 0x05, 0x03],
        '8' => [0x36, 0x49, 0x49, 0x49, 0x36],
        '9' => [0x06, 0x49, 0x49, 0x29, 0x1E],
        'A' => [0x7E, 0x11, 0x11, 0x11, 0x7E],
        'B' => [0x7F, 0x49, 0x49, 0x49, 0x36],
        'C' => [0x3E, 0x41, 0x41, 0x41, 0x22],
        'D' => [0x7F, 0x41, 0x41, 0x22, 0x1C],
        'E' => [0x7F, 0x49, 0x49, 0x49, 0x41],
        'F' => [0x7F, 0x09, 0x09, 0x09, 0x01],
        'G' => [0x3E, 0x41, 0x49, 0x49, 0x7A],
        'H' => [0x7F, 0x08, 0x08, 0x08, 0x7F],
        'I' => [0x00, 0x41, 0x7F, 0x41, 0x00],
        'J' => [0x20, 0x40, 0x41, 0x3F, 0x01],
        'K' => [0x7F, 0x08, 0x14, 0x22, 0x41],
        'L' => [0x7F, 0x40, 0x40, 0x40, 0x40],
        'M' => [0x7F, 0x02, 0x0C, 0x02, 0x7F],
        'N' => [0x7F, 0x04, 0x08, 0x10, 0x7F],
        'O' => [0x3E, 0x41, 0x41, 0x41, 0x3E],
        'P' => [0x7F, 0x09, 0x09, 0x09, 0x06],
        'Q' => [0x3E, 0x41, 0x51, 0x21, 0x5E],
        'R' => [0x7F, 0x09, 0x19, 0x29, 0x46],
        'S' => [0x46, 0x49, 0x49, 0x49, 0x31],
        'T' => [0x01, 0x01, 0x7F, 0x01, 0x01],
        'U' => [0x3F, 0x40, 0x40, 0x40, 0x3F],
        'V' => [0x1F, 0x20, 0x40, 0x20, 0x1F],
        'W' => [0x3F, 0x40, 0x38, 0x40, 0x3F],
        'X' => [0x63, 0x14, 0x08, 0x14, 0x63],
        'Y' => [0x07, 0x08, 0x70, 0x08, 0x07],
        'Z' => [0x61, 0x51, 0x49, 0x45, 0x43],
        '.' => [0x00, 0x60, 0x60, 0x00, 0x00],
        ',' => [0x00, 0x50, 0x30, 0x00, 0x00],
        '-' => [0x08, 0x08, 0x08, 0x08, 0x08],
        '/' => [0x20, 0x10, 0x08, 0x04, 0x02],
        ':' => [0x00, 0x36, 0x36, 0x00, 0x00],
        '(' => [0x00, 0x1C, 0x22, 0x41, 0x00],
        ')' => [0x00, 0x41, 0x22, 0x1C, 0x00],
        '+' => [0x08, 0x08, 0x3E, 0x08, 0x08],
        '=' => [0x14, 0x14, 0x14, 0x14, 0x14],
        '%' => [0x23, 0x13, 0x08, 0x64, 0x62],
        '°' => [0x00, 0x06, 0x09, 0x09, 0x06],
        'Ø' | 'ø' => [0x5E, 0x31, 0x49, 0x46, 0x3D],
        _ => return None,
    };
    Some(g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::dxf::parse_dxf;

    fn drawing(body: &str) -> Drawing {
        parse_dxf(&format!("0\nSECTION\n2\nENTITIES\n{body}0\nENDSEC\n0\nEOF\n")).unwrap()
    }

    fn ink(img: &GrayImage) -> usize {
        img.pixels().filter(|p| p.0[0] == 0).count()
    }

    #[test]
    fn longer_side_matches_pixel_budget() {
        let d = drawing("0\nLINE\n10\n0\n20\n0\n11\n200\n21\n100\n");
        let extents = Extents {
            min: [0.0, 0.0],
            max: [200.0, 100.0],
        };
        let img = rasterize(&d, &extents, 800).unwrap();
        assert_eq!(img.width(), 800);
        assert!(img.height() < img.width());
        assert!(ink(&img) > 700);
    }

    #[test]
    fn empty_drawing_is_an_error() {
        let d = drawing("");
        assert!(rasterize(&d, &Extents::ZERO, 800).is_err());
    }

    #[test]
    fn text_leaves_ink() {
        let d = drawing("0\nTEXT\n10\n0\n20\n0\n40\n10\n1\nM10\n0\nLINE\n10\n0\n20\n0\n11\n100\n21\n0\n");
        let extents = Extents {
            min: [0.0, -20.0],
            max: [100.0, 20.0],
        };
        let img = rasterize(&d, &extents, 600).unwrap();
        let line_only = rasterize(
            &drawing("0\nLINE\n10\n0\n20\n0\n11\n100\n21\n0\n"),
            &extents,
            600,
        )
        .unwrap();
        assert!(ink(&img) > ink(&line_only));
    }

    fn ink_rows(img: &GrayImage) -> (u32, u32) {
        let rows: Vec<u32> = img.enumerate_pixels().filter(|(_, _, p)| p.0[0] == 0).map(|(_, y, _)| y).collect();
        (*rows.iter().min().unwrap(), *rows.iter().max().unwrap())
    }

    #[test]
    fn non_finite_entity_is_skipped() {
        let line = "0\nLINE\n10\n0\n20\n0\n11\n100\n21\n0\n";
        let extents = Extents {
            min: [0.0, -10.0],
            max: [100.0, 10.0],
        };
        let with_circle = drawing(&format!("{line}0\nCIRCLE\n10\n1e308\n20\n0\n40\n1e308\n"));
        let img = rasterize(&with_circle, &extents, 400).unwrap();
        let plain = rasterize(&drawing(line), &extents, 400).unwrap();
        assert_eq!(img, plain);
    }

    #[test]
    fn far_off_points_are_clamped_to_the_canvas() {
        let d = drawing("0\nLINE\n10\n0\n20\n0\n11\n1e300\n21\n-1e300\n");
        let extents = Extents {
            min: [0.0, 0.0],
            max: [100.0, 100.0],
        };
        let img = rasterize(&d, &extents, 300).unwrap();
        assert!(ink(&img) > 0);
    }

    #[test]
    fn mtext_hangs_from_its_attachment_point() {
        // Insert at y=50 of a 0..100 frame: row 300 at 600 px.
        let frame = "0\nLINE\n10\n0\n20\n0\n11\n0\n21\n100\n0\nLINE\n10\n100\n20\n0\n11\n100\n21\n100\n";
        let extents = Extents {
            min: [0.0, 0.0],
            max: [100.0, 100.0],
        };
        let text_only = |attachment: u8| {
            let with_text = drawing(&format!(
                "{frame}0\nMTEXT\n10\n30\n20\n50\n40\n10\n71\n{attachment}\n1\nMM\n"
            ));
            let mut img = rasterize(&with_text, &extents, 600).unwrap();
            let bare = rasterize(&drawing(frame), &extents, 600).unwrap();
            for (p, q) in img.pixels_mut().zip(bare.pixels()) {
                if q.0[0] == 0 {
                    *p = PAPER;
                }
            }
            img
        };
        let (top, _) = ink_rows(&text_only(1));
        assert!(top >= 298, "top-left text starts at row {top}");
        let (_, bottom) = ink_rows(&text_only(7));
        assert!(bottom < 300, "bottom-left text ends at row {bottom}");
    }
}
