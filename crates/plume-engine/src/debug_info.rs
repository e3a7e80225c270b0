//! Per-frame debug lines.
//!
//! Scenes submit text lines while the context updates grid views. Lines
//! become visible to readers only when the frame finishes, so an overlay on
//! another thread always sees one complete frame.

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct DebugInfoState {
    /// Collecting for the current frame
    collecting: bool,
    /// Lines of the frame being built
    pending: Vec<String>,
    /// Lines of the last finished frame
    published: Vec<String>,
    /// Frames published
    frames: u64,
}

/// Double-buffered debug text shared with overlays.
#[derive(Debug, Default)]
pub struct DebugInfoQueue {
    state: Mutex<DebugInfoState>,
}

impl DebugInfoQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a frame. With `enabled` false nothing is collected and the
    /// published lines are cleared.
    pub fn start_submit_info(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.collecting = enabled;
        state.pending.clear();
        if !enabled {
            state.published.clear();
        }
    }

    /// Whether lines submitted now will be kept.
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.state.lock().collecting
    }

    /// Adds a line to the open frame.
    pub fn submit_info(&self, line: impl Into<String>) {
        let mut state = self.state.lock();
        if state.collecting {
            state.pending.push(line.into());
        }
    }

    /// Publishes the open frame.
    pub fn finish_submit_info(&self) {
        let mut state = self.state.lock();
        if !state.collecting {
            return;
        }
        state.published = std::mem::take(&mut state.pending);
        state.collecting = false;
        state.frames += 1;
    }

    /// Lines of the last finished frame.
    #[must_use]
    pub fn latest(&self) -> Vec<String> {
        self.state.lock().published.clone()
    }

    /// Frames published so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.state.lock().frames
    }
}
