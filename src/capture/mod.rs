//! Device capture
//!
//! A [`CaptureSession`] owns one device stream and one recorder bound to it.
//! Recordings accumulate as timesliced chunks and are published as a single
//! local object reference when the recorder finalizes.

mod loopback;
mod recorder;
mod session;

pub use loopback::LoopbackDevices;
pub use recorder::{negotiate_mime_type, MediaDevices, MediaRecorder, MediaStream, RecorderEvent};
pub use session::CaptureSession;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::objects::{Blob, ObjectUrl};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Camera access requires a secure context (HTTPS or localhost)")]
    InsecureContext,

    #[error("Media devices are not available in this environment")]
    Unsupported,

    /// Device access was refused; carries the platform's message
    #[error("{0}")]
    Permission(String),

    #[error("{0}")]
    Device(String),

    #[error("Recorder error: {0}")]
    Recorder(String),
}

/// Which tracks to request from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    #[default]
    Idle,
    Ready,
    Recording,
    Stopped,
    Error,
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureStatus::Idle => "idle",
            CaptureStatus::Ready => "ready",
            CaptureStatus::Recording => "recording",
            CaptureStatus::Stopped => "stopped",
            CaptureStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// A finished recording and the reference that addresses it
#[derive(Debug, Clone)]
pub struct Recording {
    pub url: ObjectUrl,
    pub blob: Blob,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureState {
    pub status: CaptureStatus,
    /// Negotiated recording type, set once the recorder exists
    pub mime_type: Option<String>,
    pub recording: Option<Recording>,
    pub error: Option<String>,
}

/// HTTPS, or plain HTTP on a loopback host
pub fn is_secure_origin(origin: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(origin) else {
        return false;
    };
    match url.scheme() {
        "https" => true,
        "http" => matches!(
            url.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("[::1]")
        ),
        _ => false,
    }
}
