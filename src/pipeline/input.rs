//! Format normalisation: turn an upload into a parseable ASCII DXF file.
//!
//! DXF passes through untouched. DWG is converted by an external tool (ODA
//! File Converter or LibreDWG `dwg2dxf`) into a `TempDir` that lives as long
//! as the returned [`NormalizedInput`]. Nothing here returns an error: every
//! failure becomes a `conversion_failed` status with a message the user can
//! act on.

use crate::config::PipelineConfig;
use crate::error::ConversionError;
use crate::output::ConversionStatus;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Oldest DWG release the converters handle (R14).
const MIN_DWG_VERSION: u32 = 1014;
/// Newest DWG release the converters handle (2018).
const MAX_DWG_VERSION: u32 = 1032;

const ODA_LOCATIONS: &[&str] = &[
    "/usr/bin/ODAFileConverter",
    "/usr/local/bin/ODAFileConverter",
    "/opt/ODAFileConverter/ODAFileConverter",
];

/// What the caller hands the pipeline.
#[derive(Debug, Clone)]
pub enum Upload {
    /// A file on disk.
    Path(PathBuf),
    /// Raw bytes plus the declared file name (its extension matters).
    Bytes { name: String, bytes: Vec<u8> },
}

impl Upload {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Upload::Path(path.into())
    }

    pub fn bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Upload::Bytes {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// File name recorded as the manifest's `source_file`.
    pub fn file_name(&self) -> String {
        match self {
            Upload::Path(p) => p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.display().to_string()),
            Upload::Bytes { name, .. } => name.clone(),
        }
    }

    /// Lower-case extension without the dot.
    pub fn extension(&self) -> String {
        let name = self.file_name();
        Path::new(&name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// Detected container format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawingFormat {
    AsciiDxf,
    BinaryDxf,
    /// DWG with its `AC10xx` version string.
    Dwg { version: String },
    Unknown,
}

/// Sniff the format from the first bytes, falling back to the extension.
pub fn sniff_format(head: &[u8], extension: &str) -> DrawingFormat {
    if head.starts_with(b"AutoCAD Binary DXF") {
        return DrawingFormat::BinaryDxf;
    }
    if head.len() >= 6 && head.starts_with(b"AC") && head[2..6].iter().all(u8::is_ascii_digit) {
        return DrawingFormat::Dwg {
            version: String::from_utf8_lossy(&head[..6]).into_owned(),
        };
    }
    if extension == "dxf" || looks_like_ascii_dxf(head) {
        return DrawingFormat::AsciiDxf;
    }
    if extension == "dwg" {
        // Pre-R13 files start with "AC1.x" / "MC0.0"; keep the tag for the message.
        let tag = String::from_utf8_lossy(&head[..head.len().min(6)]).into_owned();
        return DrawingFormat::Dwg { version: tag };
    }
    DrawingFormat::Unknown
}

fn looks_like_ascii_dxf(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    let mut lines = text
        .trim_start_matches('\u{feff}')
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty());
    matches!(
        (lines.next(), lines.next()),
        (Some("0"), Some("SECTION")) | (Some("999"), Some(_))
    )
}

/// Whether `version` (e.g. `AC1027`) is in the convertible range.
pub fn dwg_version_supported(version: &str) -> bool {
    version
        .strip_prefix("AC")
        .and_then(|digits| digits.parse::<u32>().ok())
        .is_some_and(|n| (MIN_DWG_VERSION..=MAX_DWG_VERSION).contains(&n))
}

/// Result of normalisation. Holds the temp directory alive while the
/// normalised file is in use.
#[derive(Debug)]
pub struct NormalizedInput {
    /// The DXF to parse; `None` when normalisation failed.
    pub path: Option<PathBuf>,
    pub source_file: String,
    pub status: ConversionStatus,
    pub error: Option<ConversionError>,
    _temp: Option<TempDir>,
}

impl NormalizedInput {
    fn native(path: PathBuf, source_file: String, temp: Option<TempDir>) -> Self {
        Self {
            path: Some(path),
            source_file,
            status: ConversionStatus::AlreadyNative,
            error: None,
            _temp: temp,
        }
    }

    fn converted(path: PathBuf, source_file: String, temp: TempDir) -> Self {
        Self {
            path: Some(path),
            source_file,
            status: ConversionStatus::Success,
            error: None,
            _temp: Some(temp),
        }
    }

    fn failed(source_file: String, error: ConversionError) -> Self {
        warn!(file = %source_file, "normalisation failed: {error}");
        Self {
            path: None,
            source_file,
            status: ConversionStatus::ConversionFailed,
            error: Some(error),
            _temp: None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// A DWG → DXF converter on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DwgConverter {
    Oda(PathBuf),
    LibreDwg(PathBuf),
}

/// Find a converter: the explicit path, then ODA install locations, then
/// `ODAFileConverter` / `dwg2dxf` on `PATH`.
pub fn find_converter(explicit: Option<&Path>) -> Option<DwgConverter> {
    if let Some(path) = explicit {
        if !path.is_file() {
            warn!(path = %path.display(), "configured DWG converter does not exist");
            return None;
        }
        let is_libredwg = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().contains("dwg2dxf"));
        return Some(if is_libredwg {
            DwgConverter::LibreDwg(path.to_path_buf())
        } else {
            DwgConverter::Oda(path.to_path_buf())
        });
    }
    if let Some(oda) = ODA_LOCATIONS.iter().map(PathBuf::from).find(|p| p.is_file()) {
        return Some(DwgConverter::Oda(oda));
    }
    if let Some(oda) = search_path("ODAFileConverter") {
        return Some(DwgConverter::Oda(oda));
    }
    search_path("dwg2dxf").map(DwgConverter::LibreDwg)
}

pub(crate) fn search_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Normalise an upload. Runs the blocking work on the blocking pool.
pub async fn normalize_input(upload: &Upload, config: &PipelineConfig) -> NormalizedInput {
    let upload = upload.clone();
    let source_file = upload.file_name();
    let converter = config.dwg_converter.clone();
    let timeout = Duration::from_secs(config.converter_timeout_secs);
    let work_dir = config.work_dir.clone();

    tokio::task::spawn_blocking(move || {
        normalize_blocking(&upload, converter.as_deref(), timeout, work_dir.as_deref())
    })
    .await
    .unwrap_or_else(|e| {
        NormalizedInput::failed(
            source_file,
            ConversionError::Unreadable {
                detail: format!("normalisation task panicked: {e}"),
            },
        )
    })
}

/// Blocking implementation of [`normalize_input`].
pub fn normalize_blocking(
    upload: &Upload,
    converter: Option<&Path>,
    timeout: Duration,
    work_dir: Option<&Path>,
) -> NormalizedInput {
    let source_file = upload.file_name();
    let extension = upload.extension();

    let head = match read_head(upload) {
        Ok(head) => head,
        Err(e) => return NormalizedInput::failed(source_file, e),
    };

    match sniff_format(&head, &extension) {
        DrawingFormat::AsciiDxf => match upload {
            Upload::Path(p) => {
                debug!(file = %source_file, "already DXF");
                NormalizedInput::native(p.clone(), source_file, None)
            }
            Upload::Bytes { bytes, .. } => match stage_bytes(bytes, "upload.dxf", work_dir) {
                Ok((temp, path)) => NormalizedInput::native(path, source_file, Some(temp)),
                Err(e) => NormalizedInput::failed(source_file, e),
            },
        },
        DrawingFormat::BinaryDxf => NormalizedInput::failed(source_file, ConversionError::BinaryDxf),
        DrawingFormat::Unknown => NormalizedInput::failed(
            source_file,
            ConversionError::UnknownFormat {
                extension: if extension.is_empty() {
                    "(none)".to_string()
                } else {
                    extension
                },
            },
        ),
        DrawingFormat::Dwg { version } => {
            if !dwg_version_supported(&version) {
                return NormalizedInput::failed(
                    source_file,
                    ConversionError::UnsupportedVersion { version },
                );
            }
            let Some(tool) = find_converter(converter) else {
                return NormalizedInput::failed(source_file, ConversionError::ConverterUnavailable);
            };
            match convert_dwg(upload, &tool, timeout, work_dir) {
                Ok((temp, path)) => {
                    info!(file = %source_file, version = %version, "converted DWG to DXF");
                    NormalizedInput::converted(path, source_file, temp)
                }
                Err(e) => NormalizedInput::failed(source_file, e),
            }
        }
    }
}

fn read_head(upload: &Upload) -> Result<Vec<u8>, ConversionError> {
    const HEAD: usize = 256;
    match upload {
        Upload::Path(p) => {
            use std::io::Read;
            let mut file = File::open(p).map_err(|e| ConversionError::Unreadable {
                detail: format!("{}: {e}", p.display()),
            })?;
            let mut head = vec![0u8; HEAD];
            let mut filled = 0;
            while filled < HEAD {
                match file.read(&mut head[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        return Err(ConversionError::Unreadable {
                            detail: format!("{}: {e}", p.display()),
                        })
                    }
                }
            }
            head.truncate(filled);
            Ok(head)
        }
        Upload::Bytes { bytes, .. } => Ok(bytes[..bytes.len().min(HEAD)].to_vec()),
    }
}

fn scratch_dir(work_dir: Option<&Path>) -> Result<TempDir, ConversionError> {
    let builder = {
        let mut b = tempfile::Builder::new();
        b.prefix("cadlens-");
        b
    };
    let result = match work_dir {
        Some(dir) => builder.tempdir_in(dir),
        None => builder.tempdir(),
    };
    result.map_err(|e| ConversionError::Unreadable {
        detail: format!("cannot create scratch directory: {e}"),
    })
}

fn stage_bytes(
    bytes: &[u8],
    file_name: &str,
    work_dir: Option<&Path>,
) -> Result<(TempDir, PathBuf), ConversionError> {
    let temp = scratch_dir(work_dir)?;
    let path = temp.path().join(file_name);
    std::fs::write(&path, bytes).map_err(|e| ConversionError::Unreadable {
        detail: format!("cannot stage upload: {e}"),
    })?;
    Ok((temp, path))
}

fn convert_dwg(
    upload: &Upload,
    tool: &DwgConverter,
    timeout: Duration,
    work_dir: Option<&Path>,
) -> Result<(TempDir, PathBuf), ConversionError> {
    let temp = scratch_dir(work_dir)?;
    let in_dir = temp.path().join("in");
    let out_dir = temp.path().join("out");
    for dir in [&in_dir, &out_dir] {
        std::fs::create_dir_all(dir).map_err(|e| ConversionError::ConverterFailed {
            detail: format!("cannot create {}: {e}", dir.display()),
        })?;
    }

    // The converter sees a directory holding only this drawing.
    let staged = in_dir.join("drawing.dwg");
    let copied = match upload {
        Upload::Path(p) => std::fs::copy(p, &staged).map(|_| ()),
        Upload::Bytes { bytes, .. } => std::fs::write(&staged, bytes),
    };
    copied.map_err(|e| ConversionError::Unreadable {
        detail: format!("cannot stage DWG: {e}"),
    })?;

    let expected = out_dir.join("drawing.dxf");
    let mut command = match tool {
        DwgConverter::Oda(exe) => {
            let mut c = Command::new(exe);
            c.arg(&in_dir)
                .arg(&out_dir)
                .args(["ACAD2018", "DXF", "0", "1", "*.DWG"]);
            c
        }
        DwgConverter::LibreDwg(exe) => {
            let mut c = Command::new(exe);
            c.arg("-y").arg("-o").arg(&expected).arg(&staged);
            c
        }
    };

    let log_path = temp.path().join("converter.log");
    let log = File::create(&log_path).map_err(|e| ConversionError::ConverterFailed {
        detail: format!("cannot create converter log: {e}"),
    })?;
    let log_err = log.try_clone().map_err(|e| ConversionError::ConverterFailed {
        detail: format!("cannot create converter log: {e}"),
    })?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    debug!(?command, "running DWG converter");
    let status = run_with_timeout(command, timeout)?;
    let log_tail = read_log_tail(&log_path);

    if !status.success() {
        return Err(ConversionError::ConverterFailed {
            detail: format!("converter exited with {status}: {log_tail}"),
        });
    }

    // ODA keeps the input stem but may change the extension's case.
    let output = [expected.clone(), out_dir.join("drawing.DXF")]
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| ConversionError::ConverterFailed {
            detail: format!("converter produced no DXF output. {log_tail}"),
        })?;
    Ok((temp, output))
}

fn run_with_timeout(command: Command, timeout: Duration) -> Result<std::process::ExitStatus, ConversionError> {
    match run_with_deadline(command, timeout) {
        Ok(Some(status)) => Ok(status),
        Ok(None) => Err(ConversionError::ConverterFailed {
            detail: format!("converter timed out after {}s", timeout.as_secs()),
        }),
        Err(e) => Err(ConversionError::ConverterFailed {
            detail: format!("cannot run converter: {e}"),
        }),
    }
}

/// Spawn `command` and wait for it, killing it once `timeout` passes.
///
/// `Ok(None)` means the deadline hit and the child was killed. Output the
/// caller needs must go to files, not pipes.
pub(crate) fn run_with_deadline(
    mut command: Command,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    let mut child = command.spawn()?;
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

fn read_log_tail(path: &Path) -> String {
    let text = std::fs::read_to_string(path).unwrap_or_default();
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(299)
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}
