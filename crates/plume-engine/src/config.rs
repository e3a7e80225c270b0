//! Engine configuration.
//!
//! Feature opt-ins, debug toggles, and scheduling limits shared by every
//! scene of a context. The configuration is loaded once, wrapped in an
//! `Arc`, and handed to the context; changing it means handing over a new
//! snapshot.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use plume_common::ConfigError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Configuration file name.
const CONFIG_FILE: &str = "plume.toml";

/// Environment variable overriding the configuration path.
const CONFIG_ENV: &str = "PLUME_CONFIG";

/// Engine configuration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // === Device Topology ===
    /// Multi-GPU level: 0 off, 1 per-grid opt-in, 2 or more forces it for every grid
    pub multi_gpu: u32,
    /// Async compute level: 0 off, 1 per-grid opt-in, 2 forces it where
    /// multi-GPU is not used, 3 or more also overrides multi-GPU when greater
    /// than `multi_gpu`
    pub async_compute: u32,
    /// Re-probe devices on the next frame, deactivating every scene once
    pub multi_gpu_reset_request: bool,

    // === Scheduling ===
    /// Submitted but incomplete frames a dedicated queue may hold before
    /// substeps are skipped
    pub max_frames_in_flight: u32,
    /// Steps an idle block survives before it is released
    pub release_hysteresis_frames: u32,

    // === Simulation Clock ===
    /// Fixed substep size in seconds
    pub substep_size: f32,
    /// Substeps scheduled per frame at most
    pub max_substeps: u32,

    // === Depth ===
    /// Depth level: 0 off, 1 per-grid opt-in, 2 or more forces depth for
    /// every grid with the thresholds below
    pub depth: u32,
    /// Alpha threshold used when depth is forced
    pub depth_alpha_threshold: f32,
    /// Intensity threshold used when depth is forced
    pub depth_intensity_threshold: f32,
    /// Visualize the depth estimate
    pub depth_debug_draw: bool,

    // === Debug ===
    /// Draw the shadow volume over the scene
    pub debug_draw_shadow: bool,
    /// Collect per-grid block counts every frame
    pub debug_info: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // Device topology
            multi_gpu: 1,
            async_compute: 1,
            multi_gpu_reset_request: false,

            // Scheduling
            max_frames_in_flight: 3,
            release_hysteresis_frames: 8,

            // Simulation clock
            substep_size: 1.0 / 60.0,
            max_substeps: 4,

            // Depth
            depth: 1,
            depth_alpha_threshold: 0.9,
            depth_intensity_threshold: 4.0,
            depth_debug_draw: false,

            // Debug
            debug_draw_shadow: false,
            debug_info: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default file location.
    /// Returns default config if the file doesn't exist.
    pub fn load() -> Self {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from a specific path.
    /// Returns default config if the file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found, using defaults");
            return Self::default();
        }

        match Self::read(path) {
            Ok(mut config) => {
                config.validate();
                info!("Loaded config from {}", path.display());
                config
            },
            Err(e) => {
                warn!("{e}, using defaults");
                Self::default()
            },
        }
    }

    /// Read and parse a config file without falling back.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to the default file location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::config_path())
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let contents = toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        let mut file = fs::File::create(path).map_err(io_error)?;
        file.write_all(contents.as_bytes()).map_err(io_error)?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Get the configuration file path: `$PLUME_CONFIG` or `plume.toml` in
    /// the working directory.
    fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV).map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from)
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        // Scheduling
        self.max_frames_in_flight = self.max_frames_in_flight.clamp(1, 16);
        self.release_hysteresis_frames = self.release_hysteresis_frames.clamp(1, 600);

        // Clock
        self.substep_size = self.substep_size.clamp(1.0 / 1000.0, 0.25);
        self.max_substeps = self.max_substeps.clamp(1, 16);

        // Depth
        self.depth_alpha_threshold = self.depth_alpha_threshold.clamp(0.0, 1.0);
        self.depth_intensity_threshold = self.depth_intensity_threshold.max(0.0);
    }

    /// Whether any multi-GPU use is allowed.
    #[must_use]
    pub const fn multi_gpu_allowed(&self) -> bool {
        self.multi_gpu > 0
    }

    /// Whether any async compute use is allowed.
    #[must_use]
    pub const fn async_compute_allowed(&self) -> bool {
        self.async_compute > 0
    }
}
