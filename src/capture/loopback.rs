//! Replays a media file as if it were a live device
//!
//! The recorder emits the file's bytes unchanged, so the only type it can
//! record is the file's own container.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CaptureError, Constraints, MediaDevices, MediaRecorder, MediaStream, RecorderEvent};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

fn sniff_container(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
        "video/webm"
    } else if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
        "video/mp4"
    } else {
        "video/webm"
    }
}

fn base_type(mime_type: &str) -> &str {
    mime_type.split(';').next().unwrap_or(mime_type).trim()
}

#[derive(Clone)]
pub struct LoopbackDevices {
    bytes: Arc<[u8]>,
    container: &'static str,
    chunk_size: usize,
    denial: Option<String>,
}

impl LoopbackDevices {
    pub fn new(bytes: Vec<u8>) -> Self {
        let container = sniff_container(&bytes);
        Self {
            bytes: bytes.into(),
            container,
            chunk_size: DEFAULT_CHUNK_SIZE,
            denial: None,
        }
    }

    pub async fn from_file(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        info!(
            "Loopback device replaying {:?} ({} bytes)",
            path,
            bytes.len()
        );
        Ok(Self::new(bytes))
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Refuse every access request with `message`
    pub fn deny_permission(mut self, message: impl Into<String>) -> Self {
        self.denial = Some(message.into());
        self
    }

    pub fn container(&self) -> &'static str {
        self.container
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn get_user_media(
        &self,
        constraints: &Constraints,
    ) -> Result<Box<dyn MediaStream>, CaptureError> {
        if let Some(message) = &self.denial {
            return Err(CaptureError::Permission(message.clone()));
        }
        if !constraints.video && !constraints.audio {
            return Err(CaptureError::Device(
                "At least one of audio and video must be requested".into(),
            ));
        }
        Ok(Box::new(LoopbackStream {
            bytes: self.bytes.clone(),
            container: self.container,
            chunk_size: self.chunk_size,
            active: Arc::new(AtomicBool::new(true)),
        }))
    }

    fn is_type_supported(&self, mime_type: &str) -> bool {
        base_type(mime_type) == self.container
    }
}

struct LoopbackStream {
    bytes: Arc<[u8]>,
    container: &'static str,
    chunk_size: usize,
    active: Arc<AtomicBool>,
}

impl MediaStream for LoopbackStream {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn stop_tracks(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!("Loopback tracks stopped");
        }
    }

    fn create_recorder(
        &self,
        mime_type: Option<&str>,
    ) -> Result<Box<dyn MediaRecorder>, CaptureError> {
        let mime_type = match mime_type {
            Some(mime) if base_type(mime) != self.container => {
                return Err(CaptureError::Recorder(format!(
                    "{} is not supported by this device",
                    mime
                )));
            }
            Some(mime) => mime.to_string(),
            None => self.container.to_string(),
        };
        Ok(Box::new(LoopbackRecorder {
            bytes: self.bytes.clone(),
            chunk_size: self.chunk_size,
            mime_type,
            active: self.active.clone(),
            stop: None,
        }))
    }
}

struct LoopbackRecorder {
    bytes: Arc<[u8]>,
    chunk_size: usize,
    mime_type: String,
    active: Arc<AtomicBool>,
    stop: Option<CancellationToken>,
}

impl MediaRecorder for LoopbackRecorder {
    fn mime_type(&self) -> String {
        self.mime_type.clone()
    }

    fn start(
        &mut self,
        timeslice: Duration,
        events: mpsc::UnboundedSender<RecorderEvent>,
    ) -> Result<(), CaptureError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(CaptureError::Recorder("The stream is no longer active".into()));
        }
        if self.stop.is_some() {
            return Err(CaptureError::Recorder("Recorder is already running".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CaptureError::Recorder("No async runtime to drive the recorder".into()))?;

        let stop = CancellationToken::new();
        self.stop = Some(stop.clone());

        let bytes = self.bytes.clone();
        let chunk_size = self.chunk_size;
        let timeslice = timeslice.max(Duration::from_millis(1));
        runtime.spawn(async move {
            let mut offset = 0;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(timeslice) => {
                        // Nobody is listening any more
                        if events.is_closed() {
                            return;
                        }
                        if offset < bytes.len() {
                            let end = (offset + chunk_size).min(bytes.len());
                            let _ = events.send(RecorderEvent::Data(bytes[offset..end].to_vec()));
                            offset = end;
                        }
                    }
                }
            }
            if offset < bytes.len() {
                let _ = events.send(RecorderEvent::Data(bytes[offset..].to_vec()));
            }
            let _ = events.send(RecorderEvent::Stopped);
        });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
    }
}

impl Drop for LoopbackRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}
