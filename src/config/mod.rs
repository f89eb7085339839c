//! Configuration management for the voice engine
//!
//! Values resolve with priority env > TOML file > defaults.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::logger::{DEFAULT_CAPACITY, DebugFlag};
use crate::voice::{MonitorConfig, PlaybackConfig, WakeWordConfig};
use crate::{Error, Result};

use file::VoiceConfigFile;

/// Default mean-bin level above which the user is considered to be barging in
pub const DEFAULT_BARGE_IN_THRESHOLD: u8 = 30;

/// Voice engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Wake word detection
    pub wake: WakeWordConfig,

    /// Silence detection for normal turn-taking
    pub monitor: MonitorConfig,

    /// Mean-bin level (0-255) that counts as an interruption
    pub barge_in_threshold: u8,

    /// Agent audio playback
    pub playback: PlaybackConfig,

    /// Session log ring capacity
    pub log_capacity: usize,

    /// Shared debug switch for session logging
    pub debug: DebugFlag,

    /// Path to the `SQLite` data store
    pub db_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wake: WakeWordConfig::default(),
            monitor: MonitorConfig::default(),
            barge_in_threshold: DEFAULT_BARGE_IN_THRESHOLD,
            playback: PlaybackConfig::default(),
            log_capacity: DEFAULT_CAPACITY,
            debug: DebugFlag::default(),
            db_path: default_db_path(),
        }
    }
}

impl Config {
    /// Load configuration from the standard TOML file and the environment
    ///
    /// # Errors
    ///
    /// Returns error if a resolved value is out of range
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, &|key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a resolved value is out of range
    pub fn from_sources(fc: VoiceConfigFile, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let keywords = env("KAEVA_WAKE_WORDS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|w| !w.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .or(fc.wake.keywords)
            .unwrap_or(defaults.wake.keywords);

        let threshold = env("KAEVA_WAKE_THRESHOLD")
            .and_then(|s| s.parse::<f32>().ok())
            .or(fc.wake.threshold)
            .unwrap_or(defaults.wake.threshold);

        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::Config(format!(
                "wake threshold must be within [0, 1], got {threshold}"
            )));
        }

        let wake = WakeWordConfig {
            keywords,
            threshold,
            enabled: fc.wake.enabled.unwrap_or(defaults.wake.enabled),
            debounce: fc
                .wake
                .debounce_ms
                .map_or(defaults.wake.debounce, Duration::from_millis),
            restart_delay: fc
                .wake
                .restart_delay_ms
                .map_or(defaults.wake.restart_delay, Duration::from_millis),
            word_boundary: fc.wake.word_boundary.unwrap_or(defaults.wake.word_boundary),
        };

        let fft_size = fc.vad.fft_size.unwrap_or(defaults.monitor.fft_size);
        if !fft_size.is_power_of_two() || fft_size < 32 {
            return Err(Error::Config(format!(
                "fft_size must be a power of two >= 32, got {fft_size}"
            )));
        }

        let monitor = MonitorConfig {
            silence_threshold_db: fc
                .vad
                .silence_threshold_db
                .unwrap_or(defaults.monitor.silence_threshold_db),
            silence_window: fc
                .vad
                .silence_window_ms
                .map_or(defaults.monitor.silence_window, Duration::from_millis),
            sample_rate: fc.vad.sample_rate.unwrap_or(defaults.monitor.sample_rate),
            fft_size,
            frame_interval: fc
                .vad
                .frame_interval_ms
                .map_or(defaults.monitor.frame_interval, Duration::from_millis),
        };

        let volume = env("KAEVA_VOLUME")
            .and_then(|s| s.parse::<f32>().ok())
            .or(fc.playback.volume)
            .unwrap_or(defaults.playback.volume);

        let playback = PlaybackConfig {
            volume: volume.clamp(0.0, 1.0),
            default_sample_rate: fc
                .playback
                .default_sample_rate
                .unwrap_or(defaults.playback.default_sample_rate),
        };

        let debug_enabled = env("KAEVA_DEBUG")
            .map(|s| matches!(s.as_str(), "1" | "true" | "yes" | "on"))
            .or(fc.log.debug)
            .unwrap_or(false);

        let db_path = env("KAEVA_DB_PATH")
            .or(fc.data.db_path)
            .map_or(defaults.db_path, PathBuf::from);

        Ok(Self {
            wake,
            monitor,
            barge_in_threshold: fc
                .barge_in
                .amplitude_threshold
                .unwrap_or(DEFAULT_BARGE_IN_THRESHOLD),
            playback,
            log_capacity: fc.log.capacity.unwrap_or(DEFAULT_CAPACITY),
            debug: DebugFlag::new(debug_enabled),
            db_path,
        })
    }
}

/// Default data store location: `<data_dir>/kaeva/kaeva.db`
fn default_db_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("kaeva.db"),
        |d| d.data_dir().join("kaeva").join("kaeva.db"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::from_sources(VoiceConfigFile::default(), &env_of(&[])).unwrap();
        assert_eq!(config.wake.keywords, vec!["hey kaeva", "kaeva"]);
        assert!((config.wake.threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.monitor.silence_window, Duration::from_millis(2000));
        assert_eq!(config.barge_in_threshold, 30);
        assert_eq!(config.playback.default_sample_rate, 24000);
        assert!(!config.debug.is_enabled());
    }

    #[test]
    fn env_overrides_file() {
        let mut fc = VoiceConfigFile::default();
        fc.wake.keywords = Some(vec!["from file".to_string()]);
        fc.log.debug = Some(false);

        let env = env_of(&[("KAEVA_WAKE_WORDS", "hey kaeva, ok kaeva"), ("KAEVA_DEBUG", "1")]);
        let config = Config::from_sources(fc, &env).unwrap();

        assert_eq!(config.wake.keywords, vec!["hey kaeva", "ok kaeva"]);
        assert!(config.debug.is_enabled());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let env = env_of(&[("KAEVA_WAKE_THRESHOLD", "1.5")]);
        let err = Config::from_sources(VoiceConfigFile::default(), &env).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn clamps_volume() {
        let env = env_of(&[("KAEVA_VOLUME", "3.0")]);
        let config = Config::from_sources(VoiceConfigFile::default(), &env).unwrap();
        assert!((config.playback.volume - 1.0).abs() < f32::EPSILON);
    }
}
