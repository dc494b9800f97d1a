//! Shared test fixtures: a throwaway asset server and a scripted engine

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineAssets, EngineError, EngineEvents, EngineFactory, MediaEngine};

pub const SCRIPT_BODY: &[u8] = b"export default function createFFmpegCore() {}";
pub const WASM_BODY: &[u8] = b"\0asm\x01\0\0\0fake-engine";

pub fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("clipcast-{}-{}", label, uuid::Uuid::new_v4()))
}

/// Serve `/core.js` and `/core.wasm` on an ephemeral loopback port.
/// Anything else is a 404.
pub async fn serve_assets() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let request = String::from_utf8_lossy(&request);
                let path = request.split_whitespace().nth(1).unwrap_or("/");
                let (status, body): (&str, &[u8]) = match path {
                    "/core.js" => ("200 OK", SCRIPT_BODY),
                    "/core.wasm" => ("200 OK", WASM_BODY),
                    _ => ("404 Not Found", b"not found"),
                };
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

/// Knobs for [`ScriptedEngine`]
#[derive(Debug, Clone)]
pub struct Script {
    pub load_delay: Duration,
    pub fail_load: bool,
    pub steps: u32,
    pub step_delay: Duration,
    pub fail_exec: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            load_delay: Duration::from_millis(5),
            fail_load: false,
            steps: 4,
            step_delay: Duration::from_millis(5),
            fail_exec: false,
        }
    }
}

/// In-memory engine that fakes a transcode by echoing its input
pub struct ScriptedEngine {
    script: Script,
    events: EngineEvents,
    files: Mutex<HashMap<String, Vec<u8>>>,
    execs: Mutex<Vec<Vec<String>>>,
    cancel: CancellationToken,
}

impl ScriptedEngine {
    pub fn files(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn execs(&self) -> Vec<Vec<String>> {
        self.execs.lock().unwrap().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
impl MediaEngine for ScriptedEngine {
    async fn load(&self, _assets: &EngineAssets) -> Result<(), EngineError> {
        tokio::time::sleep(self.script.load_delay).await;
        if self.script.fail_load {
            return Err(EngineError::InvalidAsset("scripted load failure".into()));
        }
        self.events.log("scripted engine loaded");
        Ok(())
    }

    async fn write_file(&self, name: &str, data: Vec<u8>) -> Result<(), EngineError> {
        self.files.lock().unwrap().insert(name.to_string(), data);
        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Io(std::io::ErrorKind::NotFound.into()))
    }

    async fn delete_file(&self, name: &str) -> Result<(), EngineError> {
        self.files
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::Io(std::io::ErrorKind::NotFound.into()))
    }

    async fn exec(&self, args: &[String]) -> Result<(), EngineError> {
        self.execs.lock().unwrap().push(args.to_vec());

        for step in 1..=self.script.steps {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::Terminated),
                _ = tokio::time::sleep(self.script.step_delay) => {}
            }
            let ratio = step as f64 / self.script.steps as f64;
            self.events.progress(ratio, Some(ratio * 10.0));
            self.events.log(format!("step {}", step));
        }

        if self.script.fail_exec {
            return Err(EngineError::ExecFailed {
                code: Some(1),
                message: "Invalid data found when processing input".into(),
            });
        }

        let input = args
            .iter()
            .position(|a| a == "-i")
            .and_then(|i| args.get(i + 1))
            .cloned()
            .unwrap_or_default();
        let output = args.last().cloned().unwrap_or_default();
        let mut bytes = b"out:".to_vec();
        bytes.extend(self.files.lock().unwrap().get(&input).cloned().unwrap_or_default());
        self.files.lock().unwrap().insert(output, bytes);
        Ok(())
    }

    fn terminate(&self) {
        self.cancel.cancel();
        self.files.lock().unwrap().clear();
    }
}

/// Factory that remembers every engine it created
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    pub script: Script,
    pub created: Arc<Mutex<Vec<Arc<ScriptedEngine>>>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            created: Arc::default(),
        }
    }

    pub fn engines(&self) -> Vec<Arc<ScriptedEngine>> {
        self.created.lock().unwrap().clone()
    }
}

impl EngineFactory for ScriptedFactory {
    fn create(&self, events: EngineEvents) -> Arc<dyn MediaEngine> {
        let engine = Arc::new(ScriptedEngine {
            script: self.script.clone(),
            events,
            files: Mutex::default(),
            execs: Mutex::default(),
            cancel: CancellationToken::new(),
        });
        self.created.lock().unwrap().push(engine.clone());
        engine
    }
}
