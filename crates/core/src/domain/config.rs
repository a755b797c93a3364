//! Stream preferences with TOML persistence.
//!
//! This module provides:
//! - [`AudioPreferences`]: the caller's desired devices, format order,
//!   sample rate and buffer size
//! - TOML load/save with validation
//! - [`AudioPreferences::resolve`]: apply the preference resolver against a
//!   device's capability set to produce a concrete [`StreamConfig`]

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use super::audio::SampleFormat;
use super::device::AvailableConfigs;
use super::stream::StreamConfig;

pub type Result<T> = std::result::Result<T, PrefsError>;

/// Errors that can occur during preference load/save
#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid preferences: {0}")]
    Invalid(String),
}

/// Desired stream parameters. Never trusted directly: they go through the
/// preference resolver against a real device's capability set, so an
/// out-of-date file can only degrade the pick, not break the open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioPreferences {
    /// Output device name (empty = use the host default)
    #[serde(default)]
    pub output_device: String,

    /// Input device name (empty = use the host default)
    #[serde(default)]
    pub input_device: String,

    /// Sample formats in preference order; the first supported one wins.
    pub preferred_formats: Vec<SampleFormat>,

    /// Desired sample rate; resolved to the closest supported rate.
    pub sample_rate: u32,

    /// Desired buffer size in frames (None = let the device choose)
    #[serde(default)]
    pub buffer_size: Option<u32>,
}

impl Default for AudioPreferences {
    fn default() -> Self {
        Self {
            output_device: String::new(),
            input_device: String::new(),
            preferred_formats: vec![SampleFormat::F32, SampleFormat::I16],
            sample_rate: 48000,
            buffer_size: Some(512),
        }
    }
}

impl AudioPreferences {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PrefsError::Invalid("sample_rate must be positive".into()));
        }
        if self.buffer_size == Some(0) {
            return Err(PrefsError::Invalid("buffer_size must be positive".into()));
        }
        Ok(())
    }

    /// Load preferences from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading audio preferences from {}", path.display());

        let content = fs::read_to_string(path).await?;
        let prefs: AudioPreferences = toml::from_str(&content)?;
        prefs.validate()?;

        info!("loaded audio preferences from {}", path.display());
        Ok(prefs)
    }

    /// Save preferences to a TOML file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate()?;

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;

        info!("saved audio preferences to {}", path.display());
        Ok(())
    }

    /// Run the full preference resolver against one device direction. The
    /// result is guaranteed openable on that direction.
    pub fn resolve(&self, configs: &AvailableConfigs) -> StreamConfig {
        StreamConfig {
            format: configs.preferred_format(&self.preferred_formats),
            sample_rate: configs.preferred_sample_rate(self.sample_rate),
            buffer_size: self
                .buffer_size
                .and_then(|frames| configs.preferred_buffer_size(frames)),
        }
    }
}
