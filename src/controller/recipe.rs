//! Fixed transcoding recipes
//!
//! Builds the argument lists for the preview and snapshot jobs. Arguments are
//! relative to the engine's scratch directory.

use std::path::Path;

use super::{PreviewParams, SnapshotParams};
use crate::engine::EngineError;

const CRF_RANGE: (u8, u8) = (18, 35);
const JPEG_QUALITY_RANGE: (u8, u8) = (2, 31);
const AUDIO_BITRATE: &str = "128k";

/// A ready-to-run engine invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    pub input: String,
    pub output: String,
    pub mime_type: &'static str,
    pub args: Vec<String>,
}

/// Build a scale filter expression
///
/// A missing dimension is derived from the other to preserve the aspect
/// ratio. `-2` keeps the derived side even, which yuv420p output requires.
///
/// # Returns
/// `None` when neither dimension is given
pub fn scale_filter(width: Option<u32>, height: Option<u32>) -> Option<String> {
    match (width, height) {
        (Some(w), Some(h)) => Some(format!("scale={}:{}", w, h)),
        (Some(w), None) => Some(format!("scale={}:-2", w)),
        (None, Some(h)) => Some(format!("scale=-2:{}", h)),
        (None, None) => None,
    }
}

/// Trimmed preview recipe
pub fn preview(params: &PreviewParams) -> Result<Recipe, EngineError> {
    let start = non_negative("start", params.start)?;
    let duration = params.duration;
    if !duration.is_finite() || duration <= 0.0 {
        return Err(EngineError::InvalidParams(format!(
            "duration must be positive, got {}",
            duration
        )));
    }

    let (output, mime_type) = if params.to_mp4 {
        ("output.mp4", "video/mp4")
    } else {
        ("output.webm", "video/webm")
    };
    let input = input_name(params.name.as_deref(), &params.buffer, output);

    let mut args = vec![
        "-ss".to_string(),
        start.to_string(),
        "-i".to_string(),
        input.clone(),
        "-t".to_string(),
        duration.to_string(),
    ];

    if params.to_mp4 {
        if let Some(filter) = scale_filter(params.scale_width, params.scale_height) {
            args.push("-vf".into());
            args.push(filter);
        }
        let crf = params.crf.clamp(CRF_RANGE.0, CRF_RANGE.1).to_string();
        args.extend(
            [
                "-c:v",
                "libx264",
                "-preset",
                params.preset.as_str(),
                "-crf",
                crf.as_str(),
                "-pix_fmt",
                "yuv420p",
                "-c:a",
                "aac",
                "-b:a",
                AUDIO_BITRATE,
                "-movflags",
                "+faststart",
            ]
            .map(String::from),
        );
    } else {
        // Stream copy cannot filter, so scaling is ignored here
        args.extend(["-c", "copy"].map(String::from));
    }
    args.push(output.to_string());

    Ok(Recipe {
        input,
        output: output.to_string(),
        mime_type,
        args,
    })
}

/// Single JPEG frame recipe
pub fn snapshot(params: &SnapshotParams) -> Result<Recipe, EngineError> {
    let timestamp = non_negative("timestamp", params.timestamp)?;
    let output = "snapshot.jpg";
    let input = input_name(params.name.as_deref(), &params.buffer, output);
    let quality = params
        .quality
        .clamp(JPEG_QUALITY_RANGE.0, JPEG_QUALITY_RANGE.1);

    let mut args = vec![
        "-ss".to_string(),
        timestamp.to_string(),
        "-i".to_string(),
        input.clone(),
        "-frames:v".to_string(),
        "1".to_string(),
    ];
    if let Some(filter) = scale_filter(params.scale_width, params.scale_height) {
        args.push("-vf".into());
        args.push(filter);
    }
    args.extend(["-q:v".to_string(), quality.to_string(), output.to_string()]);

    Ok(Recipe {
        input,
        output: output.to_string(),
        mime_type: "image/jpeg",
        args,
    })
}

fn non_negative(field: &str, value: f64) -> Result<f64, EngineError> {
    if !value.is_finite() {
        return Err(EngineError::InvalidParams(format!(
            "{} must be a finite number",
            field
        )));
    }
    Ok(value.max(0.0))
}

/// Pick the scratch file name for the input buffer.
///
/// Hints are reduced to their final path component. Without a usable hint the
/// container is sniffed from the leading bytes.
fn input_name(hint: Option<&str>, buffer: &[u8], output: &str) -> String {
    let hinted = hint
        .and_then(|h| Path::new(h).file_name())
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string);

    let name = hinted.unwrap_or_else(|| format!("input.{}", sniff_extension(buffer)));
    if name == output {
        format!("input-{}", name)
    } else {
        name
    }
}

fn sniff_extension(buffer: &[u8]) -> &'static str {
    if buffer.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
        "webm"
    } else if buffer.len() >= 8 && &buffer[4..8] == b"ftyp" {
        "mp4"
    } else {
        "webm"
    }
}
