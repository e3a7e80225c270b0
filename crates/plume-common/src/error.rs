//! Error types for Plume.
//!
//! None of these cross the per-frame path: device and queue failures are
//! turned into topology fallbacks where they occur, and resource exhaustion
//! is counted rather than reported.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for Plume operations.
#[derive(Debug, Error)]
pub enum PlumeError {
    /// Device or queue errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Grid construction errors
    #[error("Grid error: {0}")]
    Grid(#[from] GridError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Device, adapter, and queue errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No adapter matched the request
    #[error("No suitable adapter: {0}")]
    AdapterUnavailable(String),

    /// Device creation failed
    #[error("Device creation failed: {0}")]
    DeviceCreation(String),

    /// Queue creation failed
    #[error("Queue creation failed: {0}")]
    QueueCreation(String),

    /// The requested queue type is not exposed by this device
    #[error("Queue type {0} not supported by this device")]
    UnsupportedQueue(&'static str),
}

/// Grid descriptor and handle errors.
#[derive(Debug, Error)]
pub enum GridError {
    /// The grid descriptor cannot describe a valid grid
    #[error("Invalid grid descriptor: {0}")]
    InvalidDesc(String),

    /// A material handle no longer refers to a live material
    #[error("Stale or unknown material handle")]
    UnknownMaterial,

    /// Distance field data does not match its declared dimensions
    #[error("Distance field has {actual} samples, expected {expected}")]
    SdfSizeMismatch {
        /// Samples implied by the dimensions
        expected: usize,
        /// Samples supplied
        actual: usize,
    },

    /// Color map data does not match the pool's color map resolution
    #[error("Color map has {actual} entries, expected {expected}")]
    ColorMapSizeMismatch {
        /// Pool resolution
        expected: usize,
        /// Entries supplied
        actual: usize,
    },

    /// A render material handle no longer refers to a live material
    #[error("Stale or unknown render material handle")]
    UnknownRenderMaterial,
}

/// Configuration loading and saving errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the config file failed
    #[error("Failed to access {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The file is not valid TOML for the config schema
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// The config could not be encoded
    #[error("Failed to serialize config: {0}")]
    Serialize(String),
}

/// Result type alias for Plume operations.
pub type PlumeResult<T> = Result<T, PlumeError>;
