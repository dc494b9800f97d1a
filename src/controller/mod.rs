//! Processing engine controller
//!
//! Owns one transcoding engine inside the background worker, accepts one job
//! at a time and streams progress, log and result events back. The types in
//! this module are the message protocol between the foreground and the worker.

mod engine_loop;
pub mod recipe;

pub use engine_loop::{Controller, ControllerSettings};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

use crate::objects::ObjectUrl;

/// Error message used to reject a job while another is in flight
pub const BUSY: &str = "busy";

/// Binary payload moved across the worker boundary.
///
/// Ownership of the bytes moves with the message; nothing is copied.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Idle,
    Loading,
    Ready,
    Working,
    Canceled,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Idle => "idle",
            Status::Loading => "loading",
            Status::Ready => "ready",
            Status::Working => "working",
            Status::Canceled => "canceled",
            Status::Error => "error",
        };
        f.write_str(name)
    }
}

/// Job kinds the controller can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Preview,
    Snapshot,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Preview => f.write_str("preview"),
            JobKind::Snapshot => f.write_str("snapshot"),
        }
    }
}

/// x264 speed/efficiency presets, fastest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Ultrafast,
    Superfast,
    #[default]
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Ultrafast => "ultrafast",
            Preset::Superfast => "superfast",
            Preset::Veryfast => "veryfast",
            Preset::Faster => "faster",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
            Preset::Slower => "slower",
            Preset::Veryslow => "veryslow",
        }
    }
}

/// Explicit engine asset references for `load`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRefs {
    pub script_ref: Option<ObjectUrl>,
    pub binary_ref: Option<ObjectUrl>,
}

impl AssetRefs {
    pub fn new(script_ref: ObjectUrl, binary_ref: ObjectUrl) -> Self {
        Self {
            script_ref: Some(script_ref),
            binary_ref: Some(binary_ref),
        }
    }

    /// Both references, or nothing. A lone reference is never used so the
    /// engine cannot pair a script with a binary from another version.
    pub fn pair(&self) -> Option<(ObjectUrl, ObjectUrl)> {
        match (&self.script_ref, &self.binary_ref) {
            (Some(script), Some(binary)) => Some((script.clone(), binary.clone())),
            _ => None,
        }
    }
}

/// Trim/rescale preview parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewParams {
    pub buffer: Payload,
    #[serde(default)]
    pub name: Option<String>,
    /// Trim start in seconds
    #[serde(default)]
    pub start: f64,
    /// Trim length in seconds
    #[serde(default = "default_duration")]
    pub duration: f64,
    #[serde(default)]
    pub scale_height: Option<u32>,
    #[serde(default)]
    pub scale_width: Option<u32>,
    /// Re-encode to H.264/AAC MP4; otherwise stream-copy into WebM
    #[serde(default = "default_true")]
    pub to_mp4: bool,
    /// Constant rate factor, 18-35, lower is better
    #[serde(default = "default_crf")]
    pub crf: u8,
    #[serde(default)]
    pub preset: Preset,
}

impl PreviewParams {
    pub fn new(buffer: impl Into<Payload>) -> Self {
        Self {
            buffer: buffer.into(),
            name: None,
            start: 0.0,
            duration: default_duration(),
            scale_height: None,
            scale_width: None,
            to_mp4: true,
            crf: default_crf(),
            preset: Preset::default(),
        }
    }
}

/// Single-frame snapshot parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotParams {
    pub buffer: Payload,
    #[serde(default)]
    pub name: Option<String>,
    /// Seek position in seconds
    #[serde(default = "default_timestamp")]
    pub timestamp: f64,
    #[serde(default)]
    pub scale_width: Option<u32>,
    #[serde(default)]
    pub scale_height: Option<u32>,
    /// JPEG quality scale, 2-31, lower is better
    #[serde(default = "default_quality")]
    pub quality: u8,
}

impl SnapshotParams {
    pub fn new(buffer: impl Into<Payload>) -> Self {
        Self {
            buffer: buffer.into(),
            name: None,
            timestamp: default_timestamp(),
            scale_width: None,
            scale_height: None,
            quality: default_quality(),
        }
    }
}

fn default_duration() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_crf() -> u8 {
    28
}

fn default_timestamp() -> f64 {
    1.0
}

fn default_quality() -> u8 {
    2
}

/// Commands sent from the foreground to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Command {
    /// Create and load the engine, optionally from cached asset references
    Load(Option<AssetRefs>),
    /// Trim/rescale the input into a preview clip
    Preview(PreviewParams),
    /// Extract one JPEG frame
    Snapshot(SnapshotParams),
    /// Tear the engine down, aborting any job
    Cancel,
    /// Tear the engine down and stop the worker
    Terminate,
}

/// Events streamed from the controller to the foreground
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Loaded,
    Progress {
        ratio: f64,
        #[serde(rename = "elapsedSeconds", default, skip_serializing_if = "Option::is_none")]
        elapsed_seconds: Option<f64>,
    },
    Log {
        message: String,
    },
    Result {
        kind: JobKind,
        name: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        buffer: Payload,
    },
    Error {
        message: String,
    },
    Canceled,
    Terminated,
}

impl Event {
    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            message: message.into(),
        }
    }
}
