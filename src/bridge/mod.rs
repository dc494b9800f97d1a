//! Foreground proxy for the background controller
//!
//! The bridge starts the worker on first use, forwards commands to it, and
//! folds every event the worker streams back into one observable
//! [`ControllerState`]. Results become local object references owned by the
//! bridge; the previous reference of the same kind is revoked first.

mod worker;

pub use worker::{Worker, WorkerHandle};

use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::{
    AssetRefs, Command, ControllerSettings, Event, JobKind, PreviewParams, SnapshotParams, Status,
    BUSY,
};
use crate::objects::{Blob, ObjectStore, ObjectUrl};

/// Log lines kept in the observable state
const LOG_CAPACITY: usize = 500;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("busy")]
    Busy,

    #[error("No async runtime available to drive the background worker")]
    NoRuntime,

    #[error("Failed to start background worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Background worker has stopped")]
    Closed,
}

/// A processed result, addressable through its local object reference
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRef {
    pub url: ObjectUrl,
    pub name: String,
    pub mime_type: String,
    pub size: usize,
}

/// Everything the foreground can observe about the controller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerState {
    pub status: Status,
    /// Always within [0, 1]
    pub progress: f64,
    pub elapsed_seconds: Option<f64>,
    pub log: Vec<String>,
    pub error: Option<String>,
    pub preview: Option<ResultRef>,
    pub snapshot: Option<ResultRef>,
    pub engine_loaded: bool,
}

impl ControllerState {
    pub fn result(&self, kind: JobKind) -> Option<&ResultRef> {
        match kind {
            JobKind::Preview => self.preview.as_ref(),
            JobKind::Snapshot => self.snapshot.as_ref(),
        }
    }

    fn result_slot(&mut self, kind: JobKind) -> &mut Option<ResultRef> {
        match kind {
            JobKind::Preview => &mut self.preview,
            JobKind::Snapshot => &mut self.snapshot,
        }
    }
}

fn clamp_ratio(ratio: f64) -> f64 {
    if ratio.is_nan() {
        0.0
    } else {
        ratio.clamp(0.0, 1.0)
    }
}

/// Fold one controller event into the observable state
pub fn apply_event(state: &mut ControllerState, store: &ObjectStore, event: Event) {
    match event {
        Event::Loaded => {
            state.engine_loaded = true;
            if state.status != Status::Working {
                state.status = Status::Ready;
                state.error = None;
            }
        }
        Event::Progress {
            ratio,
            elapsed_seconds,
        } => {
            state.progress = clamp_ratio(ratio);
            state.elapsed_seconds = elapsed_seconds;
        }
        Event::Log { message } => {
            if state.log.len() >= LOG_CAPACITY {
                state.log.remove(0);
            }
            state.log.push(message);
        }
        Event::Result {
            kind,
            name,
            mime_type,
            buffer,
        } => {
            let slot = state.result_slot(kind);
            if let Some(previous) = slot.take() {
                store.revoke(&previous.url);
            }
            let size = buffer.len();
            let url = store.create(Blob::new(buffer.into_vec(), mime_type.clone()));
            debug!("{} result {} available at {}", kind, name, url);
            *slot = Some(ResultRef {
                url,
                name,
                mime_type,
                size,
            });
            state.status = Status::Ready;
            state.progress = 1.0;
        }
        Event::Error { message } => {
            // A busy rejection leaves the running job's status alone
            if message != BUSY {
                state.status = Status::Error;
            }
            state.error = Some(message);
        }
        Event::Canceled => {
            state.status = Status::Canceled;
            state.progress = 0.0;
            state.elapsed_seconds = None;
            state.engine_loaded = false;
        }
        Event::Terminated => {
            state.status = Status::Idle;
            state.progress = 0.0;
            state.elapsed_seconds = None;
            state.engine_loaded = false;
        }
    }
}

struct WorkerLink {
    cmd_tx: mpsc::UnboundedSender<Command>,
    thread: std::thread::JoinHandle<()>,
    /// Folds this worker's events into the state; aborted when the worker is dropped
    pump: JoinHandle<()>,
}

type SharedLink = Arc<Mutex<Option<WorkerLink>>>;

fn lock(link: &SharedLink) -> MutexGuard<'_, Option<WorkerLink>> {
    link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Send `cmd` to the live worker, if there is one
fn send_if_running(link: &SharedLink, cmd: Command) -> bool {
    match lock(link).as_ref() {
        Some(worker) => worker.cmd_tx.send(cmd).is_ok(),
        None => false,
    }
}

/// Cheap handle that can cancel the current job from anywhere (signal handlers)
#[derive(Clone)]
pub struct CancelHandle {
    link: SharedLink,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if !send_if_running(&self.link, Command::Cancel) {
            debug!("Cancel ignored, no worker running");
        }
    }
}

/// Session-scoped proxy for one background controller
pub struct Bridge {
    settings: ControllerSettings,
    state: Arc<watch::Sender<ControllerState>>,
    link: SharedLink,
}

impl Bridge {
    pub fn new(settings: ControllerSettings) -> Self {
        let (state, _) = watch::channel(ControllerState::default());
        Self {
            settings,
            state: Arc::new(state),
            link: Arc::new(Mutex::new(None)),
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.settings.store
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ControllerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Resolve once `done` holds for the state
    pub async fn wait_for(&self, done: impl FnMut(&ControllerState) -> bool) -> ControllerState {
        let mut rx = self.state.subscribe();
        let result = rx.wait_for(done).await.map(|state| state.clone());
        // The sender lives as long as self
        result.unwrap_or_else(|_| self.state())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            link: self.link.clone(),
        }
    }

    /// Return the live worker's command sender, starting a worker if needed
    fn ensure_worker(&self) -> Result<mpsc::UnboundedSender<Command>, BridgeError> {
        let mut link = lock(&self.link);
        if let Some(worker) = link.as_ref() {
            if !worker.cmd_tx.is_closed() {
                return Ok(worker.cmd_tx.clone());
            }
            debug!("Worker channel closed, replacing worker");
        }
        if let Some(stale) = link.take() {
            stale.pump.abort();
        }

        let runtime = Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        let WorkerHandle {
            cmd_tx,
            events_rx,
            thread,
        } = Worker::spawn(self.settings.clone())?;

        let pump = runtime.spawn(pump_events(
            events_rx,
            self.state.clone(),
            self.settings.store.clone(),
        ));

        *link = Some(WorkerLink {
            cmd_tx: cmd_tx.clone(),
            thread,
            pump,
        });
        Ok(cmd_tx)
    }

    fn send(&self, cmd: Command) -> Result<(), BridgeError> {
        let cmd_tx = self.ensure_worker()?;
        cmd_tx.send(cmd).map_err(|_| BridgeError::Closed)
    }

    /// Load the engine, optionally from cached asset references
    pub fn load(&self, refs: Option<AssetRefs>) -> Result<(), BridgeError> {
        self.send(Command::Load(refs))?;
        self.state.send_if_modified(|state| {
            if state.engine_loaded || state.status == Status::Working {
                return false;
            }
            state.status = Status::Loading;
            state.error = None;
            true
        });
        Ok(())
    }

    pub fn preview(&self, params: PreviewParams) -> Result<(), BridgeError> {
        self.submit(Command::Preview(params))
    }

    pub fn snapshot(&self, params: SnapshotParams) -> Result<(), BridgeError> {
        self.submit(Command::Snapshot(params))
    }

    fn submit(&self, cmd: Command) -> Result<(), BridgeError> {
        let mut busy = false;
        self.state.send_if_modified(|state| {
            if state.status == Status::Working {
                busy = true;
                return false;
            }
            state.status = Status::Working;
            state.progress = 0.0;
            state.elapsed_seconds = None;
            state.error = None;
            true
        });
        if busy {
            warn!("Rejecting job, another job is in flight");
            return Err(BridgeError::Busy);
        }

        self.send(cmd).inspect_err(|e| {
            let message = e.to_string();
            self.state.send_modify(|state| {
                state.status = Status::Error;
                state.error = Some(message);
            });
        })
    }

    /// Abort whatever the worker is doing. A no-op when no worker exists.
    pub fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    /// Stop the worker. The next command starts a fresh one.
    ///
    /// The old worker's event stream is cut here, so nothing it still emits
    /// can reach the state a later worker owns.
    pub fn terminate(&self) {
        let Some(worker) = lock(&self.link).take() else {
            return;
        };
        info!("Terminating background worker");
        let _ = worker.cmd_tx.send(Command::Terminate);
        worker.pump.abort();
        let store = self.settings.store.clone();
        self.state
            .send_modify(|state| apply_event(state, &store, Event::Terminated));
        // Detached; the thread exits once the controller has torn down
        drop(worker.thread);
    }

    /// Release both result references and stop the worker without draining
    pub fn shutdown(&self) {
        let store = self.settings.store.clone();
        self.state.send_modify(|state| {
            for slot in [&mut state.preview, &mut state.snapshot] {
                if let Some(result) = slot.take() {
                    store.revoke(&result.url);
                }
            }
        });
        self.terminate();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn pump_events(
    mut events_rx: mpsc::UnboundedReceiver<Event>,
    state: Arc<watch::Sender<ControllerState>>,
    store: ObjectStore,
) {
    while let Some(event) = events_rx.recv().await {
        state.send_modify(|state| apply_event(state, &store, event));
    }
    debug!("Worker event stream ended");
}
