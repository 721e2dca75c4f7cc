//! OCR engine seam.
//!
//! The feature extractor only needs words, confidences and pixel boxes, so
//! the engine is a small trait. [`TesseractOcr`] shells out to the
//! `tesseract` CLI in TSV mode; [`NoOcr`] reports nothing, for hosts
//! without an OCR install and for tests.

use crate::error::OcrError;
use crate::pipeline::encode::encode_png;
use crate::pipeline::input::{run_with_deadline, search_path};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

/// Words below this confidence (0–100) are dropped.
pub const MIN_CONFIDENCE: f32 = 30.0;

/// One recognised word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrItem {
    pub text: String,
    pub confidence: f32,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Recognises words in a greyscale raster.
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Words with confidence above [`MIN_CONFIDENCE`], in reading order.
    fn recognize(&self, image: &image::GrayImage) -> Result<Vec<OcrItem>, OcrError>;
}

/// Reports no text.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOcr;

impl OcrEngine for NoOcr {
    fn name(&self) -> &str {
        "none"
    }

    fn recognize(&self, _image: &image::GrayImage) -> Result<Vec<OcrItem>, OcrError> {
        Ok(Vec::new())
    }
}

/// The `tesseract` command-line engine.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    /// Executable; `None` searches `PATH`.
    pub executable: Option<PathBuf>,
    pub language: String,
    /// The engine is killed after this long.
    pub timeout_secs: u64,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            executable: None,
            language: "eng".to_string(),
            timeout_secs: 60,
        }
    }
}

impl OcrEngine for TesseractOcr {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn recognize(&self, image: &image::GrayImage) -> Result<Vec<OcrItem>, OcrError> {
        let engine = self.name().to_string();
        let exe = match &self.executable {
            Some(p) => p.clone(),
            None => search_path("tesseract").ok_or_else(|| OcrError::NotInstalled { engine: engine.clone() })?,
        };

        let staging = |detail: String| OcrError::Staging { detail };
        let png = encode_png(image).map_err(|e| staging(e.to_string()))?;
        let dir = tempfile::tempdir().map_err(|e| staging(format!("cannot create scratch dir: {e}")))?;
        let input = dir.path().join("drawing.png");
        std::fs::write(&input, png).map_err(|e| staging(e.to_string()))?;
        let stderr_path = dir.path().join("stderr.log");
        let stderr = std::fs::File::create(&stderr_path).map_err(|e| staging(e.to_string()))?;

        // Writes <base>.tsv next to the input.
        let base = dir.path().join("words");
        let mut command = Command::new(&exe);
        command
            .arg(&input)
            .arg(&base)
            .args(["-l", &self.language, "--psm", "11", "tsv"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr));

        let timeout = Duration::from_secs(self.timeout_secs);
        let status = match run_with_deadline(command, timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                return Err(OcrError::Timeout {
                    engine,
                    secs: self.timeout_secs,
                })
            }
            Err(e) => {
                return Err(OcrError::EngineFailed {
                    engine,
                    detail: format!("cannot run {}: {e}", exe.display()),
                })
            }
        };
        if !status.success() {
            let log = std::fs::read_to_string(&stderr_path).unwrap_or_default();
            return Err(OcrError::EngineFailed {
                engine,
                detail: format!("exited with {status}: {}", log.trim()),
            });
        }

        let tsv = std::fs::read_to_string(base.with_extension("tsv")).map_err(|e| OcrError::EngineFailed {
            engine,
            detail: format!("no TSV output: {e}"),
        })?;
        let items = parse_tsv(&tsv);
        debug!(words = items.len(), "tesseract finished");
        Ok(items)
    }
}

/// Parse tesseract TSV output, keeping confident non-empty words.
///
/// Columns: level page block par line word left top width height conf text.
pub fn parse_tsv(tsv: &str) -> Vec<OcrItem> {
    tsv.lines()
        .skip(1)
        .filter_map(|row| {
            let cols: Vec<&str> = row.split('\t').collect();
            if cols.len() < 12 {
                return None;
            }
            let confidence: f32 = cols[10].trim().parse().ok()?;
            let text = cols[11].trim();
            if confidence <= MIN_CONFIDENCE || text.is_empty() {
                return None;
            }
            Some(OcrItem {
                text: text.to_string(),
                confidence,
                left: cols[6].parse().ok()?,
                top: cols[7].parse().ok()?,
                width: cols[8].parse().ok()?,
                height: cols[9].parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t
5\t1\t1\t1\t1\t1\t10\t20\t40\t12\t91.5\t150mm
5\t1\t1\t1\t1\t2\t60\t20\t30\t12\t12.0\tx#
5\t1\t1\t1\t1\t3\t100\t20\t30\t12\t88\tISO
5\t1\t1\t1\t1\t4\t140\t20\t30\t12\t95\t
";

    #[test]
    fn tsv_keeps_confident_words_only() {
        let items = parse_tsv(TSV);
        let words: Vec<&str> = items.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(words, ["150mm", "ISO"]);
        assert_eq!(items[0].left, 10);
        assert_eq!(items[0].height, 12);
    }

    #[test]
    fn missing_executable_is_an_error_not_a_panic() {
        let ocr = TesseractOcr {
            executable: Some(PathBuf::from("/nonexistent/tesseract")),
            ..Default::default()
        };
        let img = image::GrayImage::from_pixel(4, 4, image::Luma([255]));
        assert!(matches!(ocr.recognize(&img), Err(OcrError::EngineFailed { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn hung_engine_is_killed_at_the_deadline() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tesseract");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let ocr = TesseractOcr {
            executable: Some(script),
            timeout_secs: 1,
            ..Default::default()
        };
        let img = image::GrayImage::from_pixel(4, 4, image::Luma([255]));

        let started = std::time::Instant::now();
        let err = ocr.recognize(&img).unwrap_err();
        assert!(matches!(err, OcrError::Timeout { secs: 1, .. }), "got {err:?}");
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn engine_output_file_is_parsed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tesseract");
        // Mimics `tesseract <in> <base> ... tsv`, which writes <base>.tsv.
        let body = format!("#!/bin/sh\ncat > \"$2.tsv\" <<'EOF'\n{TSV}EOF\n");
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let ocr = TesseractOcr {
            executable: Some(script),
            ..Default::default()
        };
        let img = image::GrayImage::from_pixel(4, 4, image::Luma([255]));
        let words: Vec<String> = ocr.recognize(&img).unwrap().into_iter().map(|i| i.text).collect();
        assert_eq!(words, ["150mm", "ISO"]);
    }

    #[test]
    fn no_ocr_is_empty() {
        let img = image::GrayImage::from_pixel(4, 4, image::Luma([255]));
        assert!(NoOcr.recognize(&img).unwrap().is_empty());
    }
}
