//! Image encoding: drawing raster → base64 PNG wrapped in `ImageData`.
//!
//! Vision APIs accept images as base64 data embedded in the request body.
//! PNG keeps thin drawing lines and small annotation text crisp; JPEG
//! artefacts around one-pixel strokes confuse vision models.

use crate::error::RenderError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{DynamicImage, GrayImage};
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised drawing as PNG bytes.
pub fn encode_png(img: &GrayImage) -> Result<Vec<u8>, RenderError> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(img.clone())
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| RenderError::Backend {
            detail: format!("PNG encoding failed: {e}"),
        })?;
    Ok(buf)
}

/// Encode a rasterised drawing as a base64 PNG ready for a vision model.
///
/// `detail: "high"` lets tiling providers read small dimension text.
pub fn encode_drawing(img: &GrayImage) -> Result<ImageData, RenderError> {
    let png = encode_png(img)?;
    let b64 = STANDARD.encode(&png);
    debug!("Encoded drawing → {} bytes base64", b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn encode_small_image() {
        let img = GrayImage::from_pixel(10, 10, Luma([255]));
        let data = encode_drawing(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }
}
