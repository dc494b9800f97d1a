//! Configuration management for clipcast

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::capture::Constraints;
use crate::controller::{Preset, PreviewParams, SnapshotParams};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Engine asset locations and cache bucket
    #[serde(default)]
    pub assets: AssetsConfig,

    /// Transcoding engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Capture session configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Default preview recipe
    #[serde(default)]
    pub preview: PreviewDefaults,

    /// Default snapshot recipe
    #[serde(default)]
    pub snapshot: SnapshotDefaults,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetsConfig {
    /// Engine runtime script URL
    #[serde(default = "default_script_url")]
    pub script_url: String,

    /// Engine WebAssembly binary URL
    #[serde(default = "default_binary_url")]
    pub binary_url: String,

    /// Name of the durable cache bucket
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Override for the directory holding cache buckets
    #[serde(default)]
    pub cache_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Host transcoder program
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Directory for per-engine scratch space (system temp dir when unset)
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Origin the capture session runs under
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Recorder timeslice in milliseconds
    #[serde(default = "default_chunk_interval")]
    pub chunk_interval_ms: u64,

    /// Request a video track
    #[serde(default = "default_true")]
    pub video: bool,

    /// Request an audio track
    #[serde(default = "default_true")]
    pub audio: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewDefaults {
    #[serde(default = "default_duration")]
    pub duration: f64,
    #[serde(default = "default_true")]
    pub to_mp4: bool,
    #[serde(default = "default_crf")]
    pub crf: u8,
    #[serde(default)]
    pub preset: Preset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDefaults {
    #[serde(default = "default_timestamp")]
    pub timestamp: f64,
    #[serde(default = "default_quality")]
    pub quality: u8,
}

// Default value functions
fn default_script_url() -> String {
    "https://unpkg.com/@ffmpeg/core@0.12.6/dist/esm/ffmpeg-core.js".to_string()
}

fn default_binary_url() -> String {
    "https://unpkg.com/@ffmpeg/core@0.12.6/dist/esm/ffmpeg-core.wasm".to_string()
}

fn default_bucket() -> String {
    "ffmpeg-core-v0.12.6".to_string()
}

fn default_program() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_origin() -> String {
    "http://localhost".to_string()
}

fn default_chunk_interval() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_duration() -> f64 {
    10.0
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

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            script_url: default_script_url(),
            binary_url: default_binary_url(),
            bucket: default_bucket(),
            cache_root: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            scratch_root: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            chunk_interval_ms: default_chunk_interval(),
            video: true,
            audio: true,
        }
    }
}

impl Default for PreviewDefaults {
    fn default() -> Self {
        Self {
            duration: default_duration(),
            to_mp4: true,
            crf: default_crf(),
            preset: Preset::default(),
        }
    }
}

impl Default for SnapshotDefaults {
    fn default() -> Self {
        Self {
            timestamp: default_timestamp(),
            quality: default_quality(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assets: AssetsConfig::default(),
            engine: EngineConfig::default(),
            capture: CaptureConfig::default(),
            preview: PreviewDefaults::default(),
            snapshot: SnapshotDefaults::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from(config_path)
    }

    /// Load configuration from an explicit path, creating it if missing
    pub fn load_from(config_path: PathBuf) -> Result<Self> {
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else {
            let config = Config {
                config_path: Some(config_path),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "clipcast", "clipcast")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Directory holding cache buckets, if the platform provides one
    pub fn cache_root(&self) -> Option<PathBuf> {
        if let Some(root) = &self.assets.cache_root {
            return Some(root.clone());
        }
        directories::ProjectDirs::from("dev", "clipcast", "clipcast")
            .map(|dirs| dirs.cache_dir().join("buckets"))
    }

    /// Preview parameters seeded from the configured defaults
    pub fn preview_params(&self, buffer: Vec<u8>) -> PreviewParams {
        PreviewParams {
            duration: self.preview.duration,
            to_mp4: self.preview.to_mp4,
            crf: self.preview.crf,
            preset: self.preview.preset,
            ..PreviewParams::new(buffer)
        }
    }

    /// Device constraints for capture sessions
    pub fn constraints(&self) -> Constraints {
        Constraints {
            video: self.capture.video,
            audio: self.capture.audio,
        }
    }

    /// Snapshot parameters seeded from the configured defaults
    pub fn snapshot_params(&self, buffer: Vec<u8>) -> SnapshotParams {
        SnapshotParams {
            timestamp: self.snapshot.timestamp,
            quality: self.snapshot.quality,
            ..SnapshotParams::new(buffer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            program = "/opt/ffmpeg/bin/ffmpeg"

            [preview]
            crf = 23
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.program, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(config.preview.crf, 23);
        assert_eq!(config.preview.duration, 10.0);
        assert!(config.preview.to_mp4);
        assert_eq!(config.snapshot.quality, 2);
        assert_eq!(config.assets.bucket, "ffmpeg-core-v0.12.6");
        assert_eq!(config.capture.chunk_interval_ms, 1000);
    }

    #[test]
    fn test_load_from_creates_default_file() {
        let dir = std::env::temp_dir().join(format!("clipcast-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let config = Config::load_from(path.clone()).unwrap();
        assert!(path.exists());
        assert_eq!(config.config_path().unwrap(), path);

        let reloaded = Config::load_from(path).unwrap();
        assert_eq!(reloaded.assets.script_url, config.assets.script_url);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_preview_params_use_configured_defaults() {
        let mut config = Config::default();
        config.preview.duration = 4.0;
        config.preview.preset = Preset::Slow;

        let params = config.preview_params(vec![1, 2, 3]);
        assert_eq!(params.duration, 4.0);
        assert_eq!(params.preset, Preset::Slow);
        assert_eq!(params.start, 0.0);
        assert_eq!(params.buffer.len(), 3);
    }
}
