//! Background worker thread
//!
//! The controller runs on its own OS thread with a private current-thread
//! runtime. The only way in or out is the command/event channel pair.

use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::controller::{Command, Controller, ControllerSettings, Event};

/// Handle to a running worker thread
pub struct WorkerHandle {
    pub cmd_tx: mpsc::UnboundedSender<Command>,
    pub events_rx: mpsc::UnboundedReceiver<Event>,
    pub thread: JoinHandle<()>,
}

pub struct Worker;

impl Worker {
    /// Start the worker thread and its controller
    pub fn spawn(settings: ControllerSettings) -> std::io::Result<WorkerHandle> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("clipcast-worker")
            .build()?;

        let thread = std::thread::Builder::new()
            .name("clipcast-worker".into())
            .spawn(move || {
                debug!("Worker thread started");
                let controller = Controller::new(settings, events_tx);
                runtime.block_on(controller.run(cmd_rx));
                // Dropping the runtime aborts any task the controller left behind
                drop(runtime);
                debug!("Worker thread exiting");
            })?;

        info!("Spawned background worker");
        Ok(WorkerHandle {
            cmd_tx,
            events_rx,
            thread,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetUrls;
    use crate::controller::{AssetRefs, JobKind, PreviewParams};
    use crate::objects::{Blob, ObjectStore};
    use crate::testutil::{Script, ScriptedFactory};
    use std::sync::Arc;

    fn settings(factory: &ScriptedFactory, store: &ObjectStore) -> ControllerSettings {
        ControllerSettings {
            factory: Arc::new(factory.clone()),
            urls: AssetUrls {
                script: "http://127.0.0.1:9/core.js".into(),
                binary: "http://127.0.0.1:9/core.wasm".into(),
            },
            store: store.clone(),
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn test_worker_runs_job_off_thread() {
        let factory = ScriptedFactory::new(Script::default());
        let store = ObjectStore::new();
        let mut handle = Worker::spawn(settings(&factory, &store)).unwrap();
        assert_eq!(handle.thread.thread().name(), Some("clipcast-worker"));

        let refs = AssetRefs::new(
            store.create(Blob::new(b"js".to_vec(), "text/javascript")),
            store.create(Blob::new(b"\0asm".to_vec(), "application/wasm")),
        );
        handle.cmd_tx.send(Command::Load(Some(refs))).unwrap();
        handle
            .cmd_tx
            .send(Command::Preview(PreviewParams::new(vec![1u8, 2, 3])))
            .unwrap();

        let kind = loop {
            match handle.events_rx.blocking_recv() {
                Some(Event::Result { kind, .. }) => break kind,
                Some(Event::Error { message }) => panic!("job failed: {}", message),
                Some(_) => continue,
                None => panic!("worker exited early"),
            }
        };
        assert_eq!(kind, JobKind::Preview);

        handle.cmd_tx.send(Command::Terminate).unwrap();
        while let Some(event) = handle.events_rx.blocking_recv() {
            if matches!(event, Event::Terminated) {
                break;
            }
        }
        handle.thread.join().unwrap();
    }
}
