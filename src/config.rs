//! Configuration management for screening policy constants
//!
//! This module provides runtime configuration loading from JSON files so the
//! protocol levels, calibration rules and tone shaping can be adjusted without
//! recompilation. Every value has a default matching the current protocol.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub tone: ToneConfig,
}

/// Threshold-seeking staircase parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Level of the first presentation for each pair; also the ceiling
    pub start_level_db: i32,
    /// Step applied on every level change
    pub step_db: i32,
    /// Descending run stops stepping down at this level
    pub descent_floor_db: i32,
    /// Thresholds at or below this level pass
    pub pass_threshold_db: i32,
    /// Threshold recorded when there is no response at the ceiling
    pub no_response_threshold_db: i32,
    /// Pause between a response and the next stimulus
    pub inter_trial_pause_ms: u64,
    /// Length of each presented tone
    pub tone_duration_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            start_level_db: 50,
            step_db: 10,
            descent_floor_db: 20,
            pass_threshold_db: 30,
            no_response_threshold_db: 60,
            inter_trial_pause_ms: 3000,
            tone_duration_ms: 1500,
        }
    }
}

impl ProtocolConfig {
    /// Check that the staircase can always resolve a pair
    ///
    /// The step must be positive, the descent floor must sit below the start
    /// level and be reachable from it in whole steps, and tones must have a
    /// length.
    pub fn validate(&self) -> Result<(), String> {
        if self.step_db <= 0 {
            return Err(format!("step_db must be positive, got {}", self.step_db));
        }
        if self.descent_floor_db >= self.start_level_db {
            return Err(format!(
                "descent_floor_db ({}) must be below start_level_db ({})",
                self.descent_floor_db, self.start_level_db
            ));
        }
        if (self.start_level_db - self.descent_floor_db) % self.step_db != 0 {
            return Err(format!(
                "descent_floor_db ({}) is not reachable from start_level_db ({}) in {} dB steps",
                self.descent_floor_db, self.start_level_db, self.step_db
            ));
        }
        if self.tone_duration_ms == 0 {
            return Err("tone_duration_ms must be non-zero".to_string());
        }
        Ok(())
    }

    pub fn inter_trial_pause(&self) -> Duration {
        Duration::from_millis(self.inter_trial_pause_ms)
    }

    pub fn tone_duration(&self) -> Duration {
        Duration::from_millis(self.tone_duration_ms)
    }
}

/// Personal calibration rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// "Just audible" target the reference levels are measured against
    pub reference_floor_db: i32,
    /// Number of most recent references kept per frequency
    pub history_capacity: usize,
    /// Upper end of the sane operator input range (values above are logged)
    pub max_reference_db: i32,
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.history_capacity == 0 {
            return Err("history_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            reference_floor_db: 15,
            history_capacity: 3,
            max_reference_db: 80,
        }
    }
}

/// Tone shaping and level mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    /// Level that maps to full-scale amplitude 1.0
    pub full_scale_reference_db: f32,
    /// Linear fade-in and fade-out length
    pub ramp_ms: u64,
    /// Sample rate for offline rendering
    pub render_sample_rate: u32,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            full_scale_reference_db: 100.0,
            ramp_ms: 50,
            render_sample_rate: 48_000,
        }
    }
}

impl ToneConfig {
    pub fn ramp(&self) -> Duration {
        Duration::from_millis(self.ramp_ms)
    }
}

impl AppConfig {
    /// Check every section
    pub fn validate(&self) -> Result<(), String> {
        self.protocol
            .validate()
            .map_err(|err| format!("protocol: {}", err))?;
        self.calibration
            .validate()
            .map_err(|err| format!("calibration: {}", err))?;
        if self.tone.render_sample_rate == 0 {
            return Err("tone: render_sample_rate must be non-zero".to_string());
        }
        Ok(())
    }

    /// Load configuration from JSON file
    ///
    /// # Arguments
    /// * `path` - Path to JSON config file
    ///
    /// # Returns
    /// The loaded configuration, or defaults if the file is missing, cannot
    /// be parsed or holds values that fail [`AppConfig::validate`]
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
                Ok(config) => match config.validate() {
                    Ok(()) => {
                        log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                        config
                    }
                    Err(err) => {
                        log::warn!(
                            "[Config] Invalid values in {:?}: {}. Using defaults.",
                            path.as_ref(),
                            err
                        );
                        Self::default()
                    }
                },
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Load configuration from the default asset location
    pub fn load() -> Self {
        Self::load_from_file("assets/screening_config.json")
    }
}
