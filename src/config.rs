//! Runtime configuration for composition and the compose queue.
//!
//! Loaded from `filmeto.yml` (see [`crate::paths::config_file`]); every field
//! has a default so a partial or missing file is fine. Environment overrides
//! (`FILMETO_FFMPEG`, `FILMETO_FFPROBE`) are applied last.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Read(PathBuf, std::io::Error),
    Parse(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(path, e) => write!(f, "Cannot read config {}: {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Malformed config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilmetoConfig {
    /// ffmpeg executable (name on PATH or absolute path)
    pub ffmpeg_path: PathBuf,
    /// ffprobe executable
    pub ffprobe_path: PathBuf,
    /// Placeholder / fallback canvas width
    pub default_width: u32,
    /// Placeholder / fallback canvas height
    pub default_height: u32,
    /// Frame rate of still clips and placeholder videos
    pub clip_fps: u32,
    /// Duration of still clips and placeholder videos
    pub clip_seconds: u32,
    /// Submit a composition after every layer mutation
    pub auto_compose: bool,
    /// Pause between a worker finishing and the next task starting
    pub cleanup_delay_ms: u64,
    /// Retry delay when a worker is unexpectedly still active
    pub retry_delay_ms: u64,
    /// Bounded wait for a worker thread to stop
    pub join_timeout_ms: u64,
}

impl Default for FilmetoConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            default_width: 720,
            default_height: 1280,
            clip_fps: 8,
            clip_seconds: 1,
            auto_compose: true,
            cleanup_delay_ms: 100,
            retry_delay_ms: 50,
            join_timeout_ms: 5000,
        }
    }
}

impl FilmetoConfig {
    /// Load from YAML file. Missing file → defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config = Self::from_yaml(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Apply FILMETO_FFMPEG / FILMETO_FFPROBE overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var("FILMETO_FFMPEG").ok(),
            std::env::var("FILMETO_FFPROBE").ok(),
        )
    }

    fn with_overrides(mut self, ffmpeg: Option<String>, ffprobe: Option<String>) -> Self {
        if let Some(p) = ffmpeg.filter(|s| !s.is_empty()) {
            self.ffmpeg_path = PathBuf::from(p);
        }
        if let Some(p) = ffprobe.filter(|s| !s.is_empty()) {
            self.ffprobe_path = PathBuf::from(p);
        }
        self
    }

    /// Fallback canvas (width, height)
    pub fn default_size(&self) -> (u32, u32) {
        (self.default_width.max(1), self.default_height.max(1))
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Frame count of a still clip / placeholder video
    pub fn clip_frames(&self) -> u32 {
        (self.clip_fps * self.clip_seconds).max(1)
    }
}
