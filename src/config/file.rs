//! TOML configuration file loading
//!
//! Supports `~/.config/kaeva/voice.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Wake word configuration
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Silence detection configuration
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Barge-in configuration
    #[serde(default)]
    pub barge_in: BargeInFileConfig,

    /// Agent audio playback configuration
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Session log configuration
    #[serde(default)]
    pub log: LogFileConfig,

    /// Data store configuration
    #[serde(default)]
    pub data: DataFileConfig,
}

/// Wake word detection
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Candidate phrases (e.g. "hey kaeva")
    pub keywords: Option<Vec<String>>,
    /// Similarity threshold in [0, 1]
    pub threshold: Option<f32>,
    pub enabled: Option<bool>,
    pub debounce_ms: Option<u64>,
    pub restart_delay_ms: Option<u64>,
    /// Require whole-word matches on the substring fast path
    pub word_boundary: Option<bool>,
}

/// Voice activity / silence detection
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub silence_threshold_db: Option<f32>,
    pub silence_window_ms: Option<u64>,
    pub sample_rate: Option<u32>,
    pub fft_size: Option<usize>,
    pub frame_interval_ms: Option<u64>,
}

/// Barge-in detection
#[derive(Debug, Default, Deserialize)]
pub struct BargeInFileConfig {
    /// Mean bin level (0-255) that counts as interrupting speech
    pub amplitude_threshold: Option<u8>,
}

/// Playback
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    pub volume: Option<f32>,
    pub default_sample_rate: Option<u32>,
}

/// Session log
#[derive(Debug, Default, Deserialize)]
pub struct LogFileConfig {
    pub capacity: Option<usize>,
    pub debug: Option<bool>,
}

/// Data store
#[derive(Debug, Default, Deserialize)]
pub struct DataFileConfig {
    pub db_path: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceConfigFile {
    config_file_path().map_or_else(VoiceConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> VoiceConfigFile {
    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/kaeva/voice.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("kaeva").join("voice.toml"))
}
