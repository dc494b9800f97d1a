use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    is_secure_origin, negotiate_mime_type, CaptureError, CaptureState, CaptureStatus, Constraints,
    MediaDevices, MediaRecorder, MediaStream, RecorderEvent, Recording,
};
use crate::config::CaptureConfig;
use crate::objects::{Blob, ObjectStore};

#[derive(Default)]
struct SessionInner {
    stream: Option<Box<dyn MediaStream>>,
    recorder: Option<Box<dyn MediaRecorder>>,
    chunks: Vec<Vec<u8>>,
    /// Bumped on every start/reset/teardown so a stale recorder pump
    /// cannot touch the current recording
    take: u64,
    pump: Option<JoinHandle<()>>,
}

/// One device stream plus its recorder
pub struct CaptureSession {
    origin: String,
    devices: Option<Arc<dyn MediaDevices>>,
    timeslice: Duration,
    store: ObjectStore,
    inner: Arc<Mutex<SessionInner>>,
    state: Arc<watch::Sender<CaptureState>>,
}

fn lock(inner: &Mutex<SessionInner>) -> MutexGuard<'_, SessionInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CaptureSession {
    /// `devices` is `None` where the platform has no capture API
    pub fn new(
        origin: impl Into<String>,
        devices: Option<Arc<dyn MediaDevices>>,
        store: ObjectStore,
    ) -> Self {
        let (state, _) = watch::channel(CaptureState::default());
        Self {
            origin: origin.into(),
            devices,
            timeslice: Duration::from_millis(1000),
            store,
            inner: Arc::new(Mutex::new(SessionInner::default())),
            state: Arc::new(state),
        }
    }

    pub fn from_config(
        config: &CaptureConfig,
        devices: Option<Arc<dyn MediaDevices>>,
        store: ObjectStore,
    ) -> Self {
        Self::new(config.origin.clone(), devices, store)
            .with_timeslice(Duration::from_millis(config.chunk_interval_ms))
    }

    pub fn with_timeslice(mut self, timeslice: Duration) -> Self {
        self.timeslice = timeslice;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    /// Resolve once the session reaches `status` (or fails)
    pub async fn wait_for(&self, status: CaptureStatus) -> CaptureState {
        let mut rx = self.state.subscribe();
        let result = rx
            .wait_for(|s| s.status == status || s.status == CaptureStatus::Error)
            .await
            .map(|s| s.clone());
        result.unwrap_or_else(|_| self.state())
    }

    fn fail(&self, err: CaptureError) -> CaptureError {
        error!("Capture failed: {}", err);
        let message = err.to_string();
        self.state.send_modify(|state| {
            state.status = CaptureStatus::Error;
            state.error = Some(message);
        });
        err
    }

    /// Request device access and prepare a recorder
    pub async fn init(&self, constraints: Option<Constraints>) -> Result<(), CaptureError> {
        if !is_secure_origin(&self.origin) {
            return Err(self.fail(CaptureError::InsecureContext));
        }
        let Some(devices) = self.devices.clone() else {
            return Err(self.fail(CaptureError::Unsupported));
        };

        let constraints = constraints.unwrap_or_default();
        info!(
            "Requesting devices (video: {}, audio: {})",
            constraints.video, constraints.audio
        );
        let stream = devices
            .get_user_media(&constraints)
            .await
            .map_err(|e| self.fail(e))?;

        let preferred = negotiate_mime_type(devices.as_ref());
        if preferred.is_none() {
            warn!("No preferred recording type supported, using recorder default");
        }
        let recorder = match stream.create_recorder(preferred) {
            Ok(recorder) => recorder,
            Err(e) => {
                stream.stop_tracks();
                return Err(self.fail(e));
            }
        };
        let mime_type = recorder.mime_type();
        info!("Recorder ready ({})", mime_type);

        let (previous, previous_recorder) = {
            let mut inner = lock(&self.inner);
            inner.take += 1;
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            inner.chunks.clear();
            let previous_recorder = inner.recorder.replace(recorder);
            (inner.stream.replace(stream), previous_recorder)
        };
        if let Some(mut recorder) = previous_recorder {
            recorder.stop();
        }
        if let Some(previous) = previous {
            debug!("Replacing previous device stream");
            previous.stop_tracks();
        }

        self.state.send_modify(|state| {
            state.status = CaptureStatus::Ready;
            state.mime_type = Some(mime_type);
            state.error = None;
        });
        Ok(())
    }

    /// Begin a new recording. Only acts from `ready` or `stopped`.
    pub fn start(&self) -> Result<(), CaptureError> {
        let status = self.state.borrow().status;
        if !matches!(status, CaptureStatus::Ready | CaptureStatus::Stopped) {
            debug!("Ignoring start while {}", status);
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|_| {
            self.fail(CaptureError::Recorder(
                "No async runtime to collect recorded data".into(),
            ))
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let take = {
            let mut inner = lock(&self.inner);
            let Some(recorder) = inner.recorder.as_mut() else {
                drop(inner);
                return Err(self.fail(CaptureError::Recorder("Recorder is not initialized".into())));
            };
            if let Err(e) = recorder.start(self.timeslice, events_tx) {
                drop(inner);
                return Err(self.fail(e));
            }
            inner.take += 1;
            inner.chunks.clear();
            let take = inner.take;
            inner.pump = Some(runtime.spawn(pump_recorder(
                events_rx,
                take,
                self.inner.clone(),
                self.state.clone(),
                self.store.clone(),
            )));
            take
        };

        info!("Recording started (take {})", take);
        self.state.send_modify(|state| {
            state.status = CaptureStatus::Recording;
            state.error = None;
        });
        Ok(())
    }

    /// Ask the recorder to finalize. The recording is published asynchronously.
    pub fn stop(&self) {
        if self.state.borrow().status != CaptureStatus::Recording {
            return;
        }
        if let Some(recorder) = lock(&self.inner).recorder.as_mut() {
            info!("Stopping recording");
            recorder.stop();
        }
    }

    /// Drop the current recording but keep the device stream
    pub fn reset(&self) {
        let active = {
            let mut inner = lock(&self.inner);
            inner.take += 1;
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            if let Some(recorder) = inner.recorder.as_mut() {
                recorder.stop();
            }
            inner.chunks.clear();
            inner.stream.as_ref().is_some_and(|s| s.is_active())
        };

        let store = self.store.clone();
        self.state.send_modify(|state| {
            if let Some(recording) = state.recording.take() {
                store.revoke(&recording.url);
            }
            state.status = if active {
                CaptureStatus::Ready
            } else {
                CaptureStatus::Idle
            };
            state.error = None;
        });
    }

    /// Release the devices and everything recorded
    pub fn teardown(&self) {
        let (stream, recorder) = {
            let mut inner = lock(&self.inner);
            inner.take += 1;
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            inner.chunks.clear();
            (inner.stream.take(), inner.recorder.take())
        };
        if let Some(stream) = stream {
            stream.stop_tracks();
        }
        if let Some(mut recorder) = recorder {
            recorder.stop();
        }

        let store = self.store.clone();
        self.state.send_modify(|state| {
            if let Some(recording) = state.recording.take() {
                store.revoke(&recording.url);
            }
            *state = CaptureState::default();
        });
        debug!("Capture session torn down");
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Collect one take's chunks and publish the result when the recorder stops
async fn pump_recorder(
    mut events_rx: mpsc::UnboundedReceiver<RecorderEvent>,
    take: u64,
    inner: Arc<Mutex<SessionInner>>,
    state: Arc<watch::Sender<CaptureState>>,
    store: ObjectStore,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            RecorderEvent::Data(chunk) => {
                let mut inner = lock(&inner);
                if inner.take != take {
                    return;
                }
                if !chunk.is_empty() {
                    inner.chunks.push(chunk);
                }
            }
            RecorderEvent::Stopped => {
                let chunks = {
                    let mut inner = lock(&inner);
                    if inner.take != take {
                        return;
                    }
                    inner.pump = None;
                    std::mem::take(&mut inner.chunks)
                };
                state.send_modify(|state| {
                    let mime_type = state.mime_type.clone().unwrap_or_else(|| "video/webm".into());
                    let blob = Blob::from_parts(&chunks, mime_type);
                    if let Some(previous) = state.recording.take() {
                        store.revoke(&previous.url);
                    }
                    info!("Recording finished ({} bytes in {} chunks)", blob.len(), chunks.len());
                    let url = store.create(blob.clone());
                    state.recording = Some(Recording { url, blob });
                    state.status = CaptureStatus::Stopped;
                });
                return;
            }
            RecorderEvent::Error(message) => {
                if lock(&inner).take != take {
                    return;
                }
                error!("Recorder error: {}", message);
                state.send_modify(|state| {
                    state.status = CaptureStatus::Error;
                    state.error = Some(CaptureError::Recorder(message).to_string());
                });
                return;
            }
        }
    }
}
