//! Version watermarks for configuration snapshots.

use serde::{Deserialize, Serialize};

/// Monotonic watermark over externally supplied snapshot versions.
///
/// A snapshot is processed only if its version is strictly newer than the
/// last processed one. Older or repeated versions are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionWatermark {
    latest: u64,
}

impl VersionWatermark {
    /// Creates a watermark that accepts any version above zero.
    #[must_use]
    pub const fn new() -> Self {
        Self { latest: 0 }
    }

    /// Highest version processed so far.
    #[must_use]
    pub const fn latest(&self) -> u64 {
        self.latest
    }

    /// Returns true if `version` has not been processed yet.
    #[must_use]
    pub const fn is_newer(&self, version: u64) -> bool {
        version > self.latest
    }

    /// Advances to `version` if it is newer, returning whether it was.
    pub fn advance(&mut self, version: u64) -> bool {
        if self.is_newer(version) {
            self.latest = version;
            true
        } else {
            false
        }
    }
}
