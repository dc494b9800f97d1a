//! Controller event loop
//!
//! Runs on the worker thread. Commands arrive in order on one channel; engine
//! loads and jobs run as spawned tasks that report back on an internal
//! channel, so `cancel` and busy rejection stay responsive while a job runs.
//!
//! Every engine instance gets a generation number. Completions and engine
//! events from a generation that has since been torn down are dropped.

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::recipe::{self, Recipe};
use super::{AssetRefs, Command, Event, JobKind, PreviewParams, SnapshotParams, Status, BUSY};
use crate::assets::{fetch_remote_refs, AssetUrls};
use crate::engine::{EngineAssets, EngineError, EngineEvent, EngineEvents, EngineFactory, MediaEngine};
use crate::objects::ObjectStore;

type LoadFuture = Shared<BoxFuture<'static, Result<(), String>>>;

/// Everything the controller needs to build and load engines
#[derive(Clone)]
pub struct ControllerSettings {
    pub factory: Arc<dyn EngineFactory>,
    pub urls: AssetUrls,
    pub store: ObjectStore,
    pub client: Client,
}

enum Job {
    Preview(PreviewParams),
    Snapshot(SnapshotParams),
}

impl Job {
    fn kind(&self) -> JobKind {
        match self {
            Job::Preview(_) => JobKind::Preview,
            Job::Snapshot(_) => JobKind::Snapshot,
        }
    }
}

struct JobOutput {
    kind: JobKind,
    name: String,
    mime_type: String,
    buffer: Vec<u8>,
}

enum JobOutcome {
    Done(JobOutput),
    Failed(String),
    /// The load this job waited on failed; the load reports the error
    LoadFailed,
}

enum Internal {
    Engine {
        generation: u64,
        event: EngineEvent,
    },
    LoadFinished {
        generation: u64,
        result: Result<(), String>,
    },
    JobFinished {
        job: u64,
        outcome: JobOutcome,
    },
}

struct EngineSlot {
    generation: u64,
    engine: Arc<dyn MediaEngine>,
    ready: LoadFuture,
    loaded: bool,
    load_task: JoinHandle<()>,
}

struct InFlightJob {
    id: u64,
    kind: JobKind,
    handle: JoinHandle<()>,
}

/// Owns at most one engine and runs at most one job on it
pub struct Controller {
    settings: ControllerSettings,
    events_tx: mpsc::UnboundedSender<Event>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    /// Internal receiver (taken once when run() starts)
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
    status: Status,
    engine: Option<EngineSlot>,
    job: Option<InFlightJob>,
    next_generation: u64,
    next_job: u64,
}

impl Controller {
    pub fn new(settings: ControllerSettings, events_tx: mpsc::UnboundedSender<Event>) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            events_tx,
            internal_tx,
            internal_rx: Some(internal_rx),
            status: Status::Idle,
            engine: None,
            job: None,
            next_generation: 0,
            next_job: 0,
        }
    }

    /// Process commands until `terminate` or until the command channel closes
    pub async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let Some(mut internal_rx) = self.internal_rx.take() else {
            error!("Controller already ran");
            return;
        };
        info!("Controller started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Terminate) => {
                        self.terminate();
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("Command channel closed");
                        self.teardown();
                        break;
                    }
                },
                Some(msg) = internal_rx.recv() => self.handle_internal(msg),
            }
        }

        info!("Controller stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Load(refs) => self.load(refs),
            Command::Preview(params) => self.submit(Job::Preview(params)),
            Command::Snapshot(params) => self.submit(Job::Snapshot(params)),
            Command::Cancel => self.cancel(),
            Command::Terminate => self.terminate(),
        }
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Engine { generation, event } => {
                if self.current_generation() != Some(generation) {
                    return;
                }
                match event {
                    EngineEvent::Progress {
                        ratio,
                        elapsed_seconds,
                    } => self.emit(Event::Progress {
                        ratio,
                        elapsed_seconds,
                    }),
                    EngineEvent::Log(message) => {
                        debug!(target: "clipcast::engine", "{}", message);
                        self.emit(Event::Log { message });
                    }
                }
            }
            Internal::LoadFinished { generation, result } => {
                self.load_finished(generation, result)
            }
            Internal::JobFinished { job, outcome } => self.job_finished(job, outcome),
        }
    }

    fn emit(&self, event: Event) {
        if self.events_tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn set_status(&mut self, status: Status) {
        if self.status != status {
            debug!("Controller status {} -> {}", self.status, status);
            self.status = status;
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.engine.as_ref().map(|slot| slot.generation)
    }

    fn load(&mut self, refs: Option<AssetRefs>) {
        match &self.engine {
            Some(slot) if !slot.loaded => {
                debug!("Engine load already in flight");
            }
            Some(_) if self.status == Status::Error => {
                // The failed job left the engine usable
                info!("Engine already loaded, recovering from error");
                self.set_status(Status::Ready);
                self.emit(Event::Loaded);
            }
            Some(_) => {
                debug!("Engine already loaded");
            }
            None => {
                let slot = self.spawn_engine(refs);
                self.engine = Some(slot);
                if self.status != Status::Working {
                    self.set_status(Status::Loading);
                }
            }
        }
    }

    /// Create a fresh engine and start loading it
    fn spawn_engine(&mut self, refs: Option<AssetRefs>) -> EngineSlot {
        self.next_generation += 1;
        let generation = self.next_generation;

        let internal_tx = self.internal_tx.clone();
        let events = EngineEvents::new(move |event| {
            let _ = internal_tx.send(Internal::Engine { generation, event });
        });
        let engine = self.settings.factory.create(events);
        info!("Created engine instance (generation {})", generation);

        let load = load_engine(engine.clone(), refs, self.settings.clone());
        let ready = async move { load.await.map_err(|e| e.to_string()) }
            .boxed()
            .shared();

        let watcher = ready.clone();
        let internal_tx = self.internal_tx.clone();
        let load_task = tokio::spawn(async move {
            let result = watcher.await;
            let _ = internal_tx.send(Internal::LoadFinished { generation, result });
        });

        EngineSlot {
            generation,
            engine,
            ready,
            loaded: false,
            load_task,
        }
    }

    fn load_finished(&mut self, generation: u64, result: Result<(), String>) {
        if self.current_generation() != Some(generation) {
            debug!("Dropping load result of stale engine generation {}", generation);
            return;
        }

        match result {
            Ok(()) => {
                if let Some(slot) = self.engine.as_mut() {
                    slot.loaded = true;
                }
                info!("Engine loaded (generation {})", generation);
                if self.status != Status::Working {
                    self.set_status(Status::Ready);
                }
                self.emit(Event::Loaded);
            }
            Err(message) => {
                error!("Engine load failed: {}", message);
                if let Some(job) = self.job.take() {
                    job.handle.abort();
                }
                if let Some(slot) = self.engine.take() {
                    slot.engine.terminate();
                }
                self.set_status(Status::Error);
                self.emit(Event::error(message));
            }
        }
    }

    fn submit(&mut self, job: Job) {
        let kind = job.kind();
        if self.status == Status::Working {
            let running = self.job.as_ref().map(|j| j.kind);
            warn!("Rejecting {} job: {:?} job in flight", kind, running);
            self.emit(Event::error(BUSY));
            return;
        }

        let slot = match self.engine.take() {
            Some(slot) => slot,
            None => self.spawn_engine(None),
        };
        let engine = slot.engine.clone();
        let ready = slot.ready.clone();
        self.engine = Some(slot);

        self.next_job += 1;
        let id = self.next_job;
        let internal_tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            let outcome = match ready.await {
                Err(_) => JobOutcome::LoadFailed,
                Ok(()) => match run_job(engine.as_ref(), job).await {
                    Ok(output) => JobOutcome::Done(output),
                    Err(e) => JobOutcome::Failed(e.to_string()),
                },
            };
            let _ = internal_tx.send(Internal::JobFinished { job: id, outcome });
        });

        info!("Started {} job {}", kind, id);
        self.job = Some(InFlightJob { id, kind, handle });
        self.set_status(Status::Working);
    }

    fn job_finished(&mut self, id: u64, outcome: JobOutcome) {
        if self.job.as_ref().map(|j| j.id) != Some(id) {
            debug!("Dropping result of orphaned job {}", id);
            return;
        }
        self.job = None;

        let loaded = self.engine.as_ref().is_some_and(|slot| slot.loaded);
        match outcome {
            JobOutcome::Done(output) => {
                info!(
                    "{} job {} produced {} ({} bytes)",
                    output.kind,
                    id,
                    output.name,
                    output.buffer.len()
                );
                self.set_status(Status::Ready);
                self.emit(Event::Result {
                    kind: output.kind,
                    name: output.name,
                    mime_type: output.mime_type,
                    buffer: output.buffer.into(),
                });
            }
            JobOutcome::Failed(message) => {
                error!("Job {} failed: {}", id, message);
                self.set_status(Status::Error);
                self.emit(Event::error(message));
            }
            JobOutcome::LoadFailed => {
                let status = if loaded { Status::Ready } else { Status::Error };
                self.set_status(status);
            }
        }
    }

    /// Unconditional teardown. Safe with no engine or job.
    fn teardown(&mut self) {
        if let Some(job) = self.job.take() {
            info!("Aborting {} job {}", job.kind, job.id);
            job.handle.abort();
        }
        if let Some(slot) = self.engine.take() {
            info!("Tearing down engine generation {}", slot.generation);
            slot.load_task.abort();
            slot.engine.terminate();
        }
    }

    fn cancel(&mut self) {
        self.teardown();
        self.set_status(Status::Canceled);
        self.emit(Event::Canceled);
    }

    fn terminate(&mut self) {
        self.teardown();
        self.set_status(Status::Idle);
        self.emit(Event::Terminated);
    }
}

/// Resolve asset references and load the engine
async fn load_engine(
    engine: Arc<dyn MediaEngine>,
    refs: Option<AssetRefs>,
    settings: ControllerSettings,
) -> Result<(), EngineError> {
    let supplied = refs.as_ref().and_then(AssetRefs::pair);

    let (assets, minted) = match supplied {
        Some((script, binary)) => (EngineAssets { script, binary }, false),
        None => {
            info!("No cached engine assets supplied, fetching from origin");
            let refs =
                fetch_remote_refs(&settings.client, &settings.urls, &settings.store).await?;
            (
                EngineAssets {
                    script: refs.script_ref,
                    binary: refs.binary_ref,
                },
                true,
            )
        }
    };

    let result = engine.load(&assets).await;

    // References minted here only live for the duration of the load
    if minted {
        settings.store.revoke(&assets.script);
        settings.store.revoke(&assets.binary);
    }
    result
}

/// Stage the input, run the recipe, read the output back.
///
/// Scratch files are removed whether the run succeeded or not.
async fn run_job(engine: &dyn MediaEngine, job: Job) -> Result<JobOutput, EngineError> {
    let kind = job.kind();
    let (recipe, input): (Recipe, Vec<u8>) = match job {
        Job::Preview(params) => (recipe::preview(&params)?, params.buffer.into_vec()),
        Job::Snapshot(params) => (recipe::snapshot(&params)?, params.buffer.into_vec()),
    };

    let result = async {
        engine.write_file(&recipe.input, input).await?;
        engine.exec(&recipe.args).await?;
        engine.read_file(&recipe.output).await
    }
    .await;

    for name in [&recipe.input, &recipe.output] {
        if let Err(e) = engine.delete_file(name).await {
            debug!("Cleanup of {} skipped: {}", name, e);
        }
    }

    let buffer = result?;
    Ok(JobOutput {
        kind,
        name: recipe.output,
        mime_type: recipe.mime_type.to_string(),
        buffer,
    })
}
