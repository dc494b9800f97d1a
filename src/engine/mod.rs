//! Transcoding engine seam
//!
//! The controller drives an engine through this trait: stage files in the
//! engine's private scratch space, run a command pipeline, read the output
//! back. Progress and log lines flow out through [`EngineEvents`].

mod ffmpeg;

pub use ffmpeg::FfmpegFactory;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::assets::AssetError;
use crate::objects::ObjectUrl;

/// Errors raised by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine is not loaded")]
    NotLoaded,

    #[error("Invalid file name for engine scratch space: {0:?}")]
    InvalidName(String),

    #[error("Engine asset {0} is not available")]
    AssetMissing(String),

    #[error("Invalid engine asset: {0}")]
    InvalidAsset(String),

    #[error("Transcoder {program} is unavailable: {reason}")]
    ProgramUnavailable { program: String, reason: String },

    #[error("Engine command failed (exit code {code:?}): {message}")]
    ExecFailed { code: Option<i32>, message: String },

    #[error("Engine was terminated")]
    Terminated,

    #[error("Invalid job parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Assets(#[from] AssetError),

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved local references to the engine runtime and binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineAssets {
    pub script: ObjectUrl,
    pub binary: ObjectUrl,
}

/// Out-of-band engine output
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Progress {
        ratio: f64,
        elapsed_seconds: Option<f64>,
    },
    Log(String),
}

/// Sink the engine reports progress and log lines into
#[derive(Clone)]
pub struct EngineEvents(Arc<dyn Fn(EngineEvent) + Send + Sync>);

impl EngineEvents {
    pub fn new(sink: impl Fn(EngineEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(sink))
    }

    /// A sink that drops everything
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn progress(&self, ratio: f64, elapsed_seconds: Option<f64>) {
        (self.0)(EngineEvent::Progress {
            ratio,
            elapsed_seconds,
        });
    }

    pub fn log(&self, message: impl Into<String>) {
        (self.0)(EngineEvent::Log(message.into()));
    }
}

impl fmt::Debug for EngineEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EngineEvents")
    }
}

/// A transcoding engine instance
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Load the runtime and binary. Must succeed before any other operation.
    async fn load(&self, assets: &EngineAssets) -> Result<(), EngineError>;

    /// Stage a file in the scratch space
    async fn write_file(&self, name: &str, data: Vec<u8>) -> Result<(), EngineError>;

    /// Read a file back from the scratch space
    async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError>;

    async fn delete_file(&self, name: &str) -> Result<(), EngineError>;

    /// Run one command pipeline to completion
    async fn exec(&self, args: &[String]) -> Result<(), EngineError>;

    /// Forcibly stop any running command and release all engine resources.
    /// The instance is unusable afterwards.
    fn terminate(&self);
}

/// Creates engine instances bound to an event sink
pub trait EngineFactory: Send + Sync {
    fn create(&self, events: EngineEvents) -> Arc<dyn MediaEngine>;
}

/// Reject anything that is not a plain file name
pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(EngineError::InvalidName(name.to_string()));
    }
    Ok(())
}
