//! Engine backed by the host `ffmpeg` program
//!
//! Each instance owns a private scratch directory that stands in for the
//! engine's virtual filesystem. Commands run with that directory as their
//! working directory, so recipes only ever name plain files.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    validate_name, EngineAssets, EngineError, EngineEvents, EngineFactory, MediaEngine,
};
use crate::config::EngineConfig;
use crate::objects::ObjectStore;

const WASM_MAGIC: &[u8] = b"\0asm";

/// Creates [`FfmpegEngine`] instances
#[derive(Clone)]
pub struct FfmpegFactory {
    program: PathBuf,
    scratch_root: PathBuf,
    store: ObjectStore,
}

impl FfmpegFactory {
    pub fn new(config: &EngineConfig, store: ObjectStore) -> Self {
        Self {
            program: config.program.clone(),
            scratch_root: config
                .scratch_root
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            store,
        }
    }
}

impl EngineFactory for FfmpegFactory {
    fn create(&self, events: EngineEvents) -> Arc<dyn MediaEngine> {
        Arc::new(FfmpegEngine::new(
            self.program.clone(),
            self.scratch_root.clone(),
            self.store.clone(),
            events,
        ))
    }
}

/// One engine instance: a scratch directory plus at most one running process
pub struct FfmpegEngine {
    program: PathBuf,
    scratch_root: PathBuf,
    store: ObjectStore,
    events: EngineEvents,
    workdir: Mutex<Option<PathBuf>>,
    cancel: CancellationToken,
}

impl FfmpegEngine {
    pub fn new(
        program: PathBuf,
        scratch_root: PathBuf,
        store: ObjectStore,
        events: EngineEvents,
    ) -> Self {
        Self {
            program,
            scratch_root,
            store,
            events,
            workdir: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn workdir(&self) -> Result<PathBuf, EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Terminated);
        }
        self.workdir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(EngineError::NotLoaded)
    }

    fn path(&self, name: &str) -> Result<PathBuf, EngineError> {
        validate_name(name)?;
        Ok(self.workdir()?.join(name))
    }

    fn unavailable(&self, reason: impl Into<String>) -> EngineError {
        EngineError::ProgramUnavailable {
            program: self.program.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Check the host program runs at all
    async fn probe(&self) -> Result<(), EngineError> {
        let output = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(self.unavailable(format!("-version exited with {}", output.status)));
        }

        let banner = String::from_utf8_lossy(&output.stdout);
        if let Some(first) = banner.lines().next() {
            self.events.log(first.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    async fn load(&self, assets: &EngineAssets) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Terminated);
        }

        let script = self
            .store
            .resolve(&assets.script)
            .ok_or_else(|| EngineError::AssetMissing(assets.script.to_string()))?;
        let binary = self
            .store
            .resolve(&assets.binary)
            .ok_or_else(|| EngineError::AssetMissing(assets.binary.to_string()))?;

        if script.is_empty() {
            return Err(EngineError::InvalidAsset("engine runtime script is empty".into()));
        }
        if !binary.bytes().starts_with(WASM_MAGIC) {
            return Err(EngineError::InvalidAsset(
                "engine binary is not a WebAssembly module".into(),
            ));
        }

        self.probe().await?;

        let dir = self
            .scratch_root
            .join(format!("clipcast-vfs-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        debug!("Engine scratch directory: {:?}", dir);
        *self
            .workdir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(dir);

        info!(
            "Engine loaded (runtime {} bytes, binary {} bytes)",
            script.len(),
            binary.len()
        );
        Ok(())
    }

    async fn write_file(&self, name: &str, data: Vec<u8>) -> Result<(), EngineError> {
        let path = self.path(name)?;
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.path(name)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn delete_file(&self, name: &str) -> Result<(), EngineError> {
        let path = self.path(name)?;
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    async fn exec(&self, args: &[String]) -> Result<(), EngineError> {
        let dir = self.workdir()?;
        debug!("Running {:?} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(["-hide_banner", "-nostdin", "-y"])
            .args(args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.unavailable(e.to_string()))?;

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.unavailable("failed to open stderr"))?;

        let mut tracker = ProgressTracker::new(args);
        let mut splitter = LineSplitter::default();
        let mut last_line = String::new();
        let mut buf = [0u8; 4096];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => None,
                read = stderr.read(&mut buf) => Some(read),
            };
            let Some(read) = read else {
                let _ = child.kill().await;
                return Err(EngineError::Terminated);
            };
            let n = read?;
            if n == 0 {
                break;
            }
            for line in splitter.push(&buf[..n]) {
                self.handle_line(&line, &mut tracker);
                last_line = line;
            }
        }
        if let Some(line) = splitter.finish() {
            self.handle_line(&line, &mut tracker);
            last_line = line;
        }

        let status = tokio::select! {
            _ = self.cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = status else {
            let _ = child.kill().await;
            return Err(EngineError::Terminated);
        };
        let status = status?;

        if !status.success() {
            return Err(EngineError::ExecFailed {
                code: status.code(),
                message: if last_line.is_empty() {
                    "no output".to_string()
                } else {
                    last_line
                },
            });
        }

        self.events.progress(1.0, tracker.elapsed);
        Ok(())
    }

    fn terminate(&self) {
        self.cancel.cancel();
        let dir = self
            .workdir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dir) = dir {
            remove_scratch(&dir);
        }
    }
}

impl FfmpegEngine {
    fn handle_line(&self, line: &str, tracker: &mut ProgressTracker) {
        if let Some((ratio, elapsed)) = tracker.observe(line) {
            self.events.progress(ratio, Some(elapsed));
        }
        self.events.log(line.to_string());
    }
}

impl Drop for FfmpegEngine {
    fn drop(&mut self) {
        let dir = self
            .workdir
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dir) = dir {
            remove_scratch(&dir);
        }
    }
}

fn remove_scratch(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!("Removed engine scratch directory {:?}", dir),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove engine scratch directory {:?}: {}", dir, e),
    }
}

/// Splits a byte stream into lines on `\n` or `\r`.
///
/// ffmpeg rewrites its status line in place with carriage returns, so both
/// count as terminators.
#[derive(Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).trim_end().to_string());
                    self.pending.clear();
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).trim_end().to_string();
        self.pending.clear();
        Some(line)
    }
}

/// Derives a completion ratio from ffmpeg's log output
struct ProgressTracker {
    /// `-t` limit from the arguments
    limit: Option<f64>,
    /// `Duration:` of the first input
    input_duration: Option<f64>,
    /// `-ss` seek from the arguments
    seek: f64,
    elapsed: Option<f64>,
}

impl ProgressTracker {
    fn new(args: &[String]) -> Self {
        let value_after = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .and_then(|v| v.parse::<f64>().ok())
        };
        Self {
            limit: value_after("-t"),
            input_duration: None,
            seek: value_after("-ss").unwrap_or(0.0),
            elapsed: None,
        }
    }

    /// Expected output length in seconds
    fn total(&self) -> Option<f64> {
        let remaining = self.input_duration.map(|d| (d - self.seek).max(0.0));
        match (self.limit, remaining) {
            (Some(limit), Some(remaining)) => Some(limit.min(remaining)),
            (Some(limit), None) => Some(limit),
            (None, remaining) => remaining,
        }
    }

    /// Returns `(ratio, elapsed_seconds)` when the line reports encode time
    fn observe(&mut self, line: &str) -> Option<(f64, f64)> {
        if self.input_duration.is_none() {
            if let Some(rest) = line.trim_start().strip_prefix("Duration:") {
                let value = rest.split(',').next().unwrap_or("").trim();
                self.input_duration = parse_timestamp(value);
                return None;
            }
        }

        let time = line
            .split_whitespace()
            .find_map(|field| field.strip_prefix("time="))
            .and_then(parse_timestamp)?;
        self.elapsed = Some(time);

        let ratio = match self.total() {
            Some(total) if total > 0.0 => time / total,
            _ => 0.0,
        };
        Some((ratio, time))
    }
}

/// Parse `HH:MM:SS.ff`. Negative times, which ffmpeg prints before the
/// first frame, are rejected.
fn parse_timestamp(value: &str) -> Option<f64> {
    if value.trim_start().starts_with('-') {
        return None;
    }
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{recipe, PreviewParams, SnapshotParams};
    use crate::engine::EngineEvent;
    use crate::objects::Blob;
    use std::time::Duration;

    fn scratch_root() -> PathBuf {
        std::env::temp_dir().join(format!("clipcast-engine-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:00:30.00"), Some(30.0));
        assert_eq!(parse_timestamp("01:02:03.50"), Some(3723.5));
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp("00:30"), None);
        assert_eq!(parse_timestamp("-00:00:00.02"), None);
        assert_eq!(parse_timestamp("-01:00:00.00"), None);
    }

    #[test]
    fn test_line_splitter_handles_carriage_returns() {
        let mut splitter = LineSplitter::default();
        let mut lines = splitter.push(b"frame=1 time=00:00:01.00\rframe=2 ti");
        lines.extend(splitter.push(b"me=00:00:02.00\r\nDone"));

        assert_eq!(lines, vec!["frame=1 time=00:00:01.00", "frame=2 time=00:00:02.00"]);
        assert_eq!(splitter.finish().as_deref(), Some("Done"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_progress_uses_trim_limit() {
        let args: Vec<String> = ["-ss", "0", "-i", "input.webm", "-t", "10", "output.mp4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut tracker = ProgressTracker::new(&args);

        assert!(tracker
            .observe("  Duration: 00:00:30.00, start: 0.000000, bitrate: 100 kb/s")
            .is_none());
        let (ratio, elapsed) = tracker
            .observe("frame=  120 fps=60 q=28.0 size=256kB time=00:00:05.00 bitrate=1.0kbits/s")
            .unwrap();
        assert_eq!(elapsed, 5.0);
        assert!((ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_progress_short_input_after_seek() {
        let args: Vec<String> = ["-ss", "25", "-i", "in.webm", "-t", "10", "out.mp4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut tracker = ProgressTracker::new(&args);
        tracker.observe("Duration: 00:00:30.00, start: 0.0");

        let (ratio, _) = tracker.observe("size=1kB time=00:00:02.50 speed=1x").unwrap();
        assert!((ratio - 0.5).abs() < 1e-9);
        assert!(tracker.observe("time=N/A").is_none());
    }

    #[tokio::test]
    async fn test_scratch_files_require_load() {
        let engine = FfmpegEngine::new(
            PathBuf::from("ffmpeg"),
            scratch_root(),
            ObjectStore::new(),
            EngineEvents::discard(),
        );
        let err = engine.write_file("input.webm", vec![1]).await.unwrap_err();
        assert!(matches!(err, EngineError::NotLoaded));
    }

    #[tokio::test]
    async fn test_load_rejects_missing_and_invalid_assets() {
        let store = ObjectStore::new();
        let engine = FfmpegEngine::new(
            PathBuf::from("ffmpeg"),
            scratch_root(),
            store.clone(),
            EngineEvents::discard(),
        );

        let missing = EngineAssets {
            script: "blob:clipcast/missing".into(),
            binary: "blob:clipcast/missing-too".into(),
        };
        assert!(matches!(
            engine.load(&missing).await,
            Err(EngineError::AssetMissing(_))
        ));

        let not_wasm = EngineAssets {
            script: store.create(Blob::new(b"export default 1".to_vec(), "text/javascript")),
            binary: store.create(Blob::new(b"<html>404</html>".to_vec(), "application/wasm")),
        };
        assert!(matches!(
            engine.load(&not_wasm).await,
            Err(EngineError::InvalidAsset(_))
        ));
    }

    #[tokio::test]
    async fn test_load_reports_missing_program() {
        let store = ObjectStore::new();
        let engine = FfmpegEngine::new(
            PathBuf::from("/nonexistent/clipcast-ffmpeg"),
            scratch_root(),
            store.clone(),
            EngineEvents::discard(),
        );
        let assets = EngineAssets {
            script: store.create(Blob::new(b"export default 1".to_vec(), "text/javascript")),
            binary: store.create(Blob::new(b"\0asm\x01\0\0\0".to_vec(), "application/wasm")),
        };

        assert!(matches!(
            engine.load(&assets).await,
            Err(EngineError::ProgramUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminated_engine_rejects_work() {
        let engine = FfmpegEngine::new(
            PathBuf::from("ffmpeg"),
            scratch_root(),
            ObjectStore::new(),
            EngineEvents::discard(),
        );
        engine.terminate();
        assert!(matches!(
            engine.exec(&["-version".to_string()]).await,
            Err(EngineError::Terminated)
        ));
    }

    fn ffmpeg_tools_available() -> bool {
        let runs = |program: &str| {
            std::process::Command::new(program)
                .arg("-version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        };
        runs("ffmpeg") && runs("ffprobe")
    }

    /// A 30 s H.264/AAC test clip
    fn synth_clip(root: &Path) -> Vec<u8> {
        std::fs::create_dir_all(root).unwrap();
        let path = root.join("clip.mp4");
        let status = std::process::Command::new("ffmpeg")
            .args([
                "-v",
                "error",
                "-y",
                "-f",
                "lavfi",
                "-i",
                "testsrc=size=320x240:rate=15",
                "-f",
                "lavfi",
                "-i",
                "sine=frequency=440:sample_rate=48000",
                "-t",
                "30",
                "-pix_fmt",
                "yuv420p",
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-c:a",
                "aac",
            ])
            .arg(&path)
            .status()
            .unwrap();
        assert!(status.success(), "ffmpeg failed creating clip.mp4");
        std::fs::read(&path).unwrap()
    }

    fn probe_duration(path: &Path) -> f64 {
        let output = std::process::Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().parse().unwrap()
    }

    /// Load a real engine whose events are collected in the returned list
    async fn loaded_engine(root: &Path) -> (Arc<FfmpegEngine>, Arc<Mutex<Vec<EngineEvent>>>) {
        let store = ObjectStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let engine = FfmpegEngine::new(
            PathBuf::from("ffmpeg"),
            root.to_path_buf(),
            store.clone(),
            EngineEvents::new(move |event| sink.lock().unwrap().push(event)),
        );
        let assets = EngineAssets {
            script: store.create(Blob::new(b"export default 1".to_vec(), "text/javascript")),
            binary: store.create(Blob::new(b"\0asm\x01\0\0\0".to_vec(), "application/wasm")),
        };
        engine.load(&assets).await.unwrap();
        (Arc::new(engine), seen)
    }

    #[tokio::test]
    async fn test_real_preview_and_snapshot() {
        if !ffmpeg_tools_available() {
            eprintln!("skipping: ffmpeg/ffprobe not available");
            return;
        }
        let root = scratch_root();
        let clip = synth_clip(&root);
        let (engine, seen) = loaded_engine(&root).await;

        let preview = recipe::preview(&PreviewParams::new(clip.clone())).unwrap();
        assert_eq!(preview.mime_type, "video/mp4");
        engine.write_file(&preview.input, clip.clone()).await.unwrap();
        engine.exec(&preview.args).await.unwrap();
        engine.delete_file(&preview.input).await.unwrap();
        let output = engine.read_file(&preview.output).await.unwrap();
        assert!(!output.is_empty());
        assert_eq!(&output[4..8], b"ftyp");

        let written = root.join("preview.mp4");
        std::fs::write(&written, &output).unwrap();
        let duration = probe_duration(&written);
        assert!((duration - 10.0).abs() < 0.5, "preview lasts {}s", duration);

        {
            let events = seen.lock().unwrap();
            assert!(events.iter().any(|e| matches!(e, EngineEvent::Log(_))));
            let ratios: Vec<f64> = events
                .iter()
                .filter_map(|e| match e {
                    EngineEvent::Progress { ratio, .. } => Some(*ratio),
                    _ => None,
                })
                .collect();
            assert_eq!(ratios.last(), Some(&1.0));
        }

        let snapshot = recipe::snapshot(&SnapshotParams {
            scale_width: Some(1280),
            ..SnapshotParams::new(clip.clone())
        })
        .unwrap();
        engine.write_file(&snapshot.input, clip).await.unwrap();
        engine.exec(&snapshot.args).await.unwrap();
        let jpeg = engine.read_file(&snapshot.output).await.unwrap();
        assert_eq!(snapshot.mime_type, "image/jpeg");
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);

        engine.terminate();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_real_exec_failure_reports_last_line() {
        if !ffmpeg_tools_available() {
            eprintln!("skipping: ffmpeg/ffprobe not available");
            return;
        }
        let root = scratch_root();
        let (engine, _seen) = loaded_engine(&root).await;

        let args: Vec<String> = ["-i", "missing.webm", "output.mp4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        match engine.exec(&args).await {
            Err(EngineError::ExecFailed { code, message }) => {
                assert_ne!(code, Some(0));
                assert!(message.contains("missing.webm"), "message: {}", message);
            }
            other => panic!("expected exec failure, got {:?}", other),
        }

        engine.terminate();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_real_exec_is_killed_on_terminate() {
        if !ffmpeg_tools_available() {
            eprintln!("skipping: ffmpeg/ffprobe not available");
            return;
        }
        let root = scratch_root();
        let (engine, seen) = loaded_engine(&root).await;
        let workdir = engine.workdir().unwrap();

        // Ten minutes of synthetic input, far longer than the test waits
        let args: Vec<String> = [
            "-re",
            "-f",
            "lavfi",
            "-i",
            "testsrc=size=320x240:rate=15:duration=600",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "output.mp4",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let runner = engine.clone();
        let exec = tokio::spawn(async move { runner.exec(&args).await });

        tokio::time::timeout(Duration::from_secs(10), async {
            while !seen
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, EngineEvent::Progress { .. }))
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("no progress from ffmpeg");

        engine.terminate();
        let result = tokio::time::timeout(Duration::from_secs(5), exec)
            .await
            .expect("exec did not return after terminate")
            .unwrap();
        assert!(matches!(result, Err(EngineError::Terminated)));

        // The child was reaped, so nothing writes into the scratch directory again
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!workdir.exists());

        let _ = std::fs::remove_dir_all(root);
    }
}
