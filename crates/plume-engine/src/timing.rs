//! Substep scheduling.
//!
//! Frames arrive at whatever rate the host renders; the simulation advances
//! in fixed substeps. The clock accumulates real time and reports how many
//! substeps fit into it.

/// Substeps scheduled for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubstepSchedule {
    /// Fixed step size in seconds
    pub substep_size: f32,
    /// Substeps to run this frame
    pub num_substeps: u32,
}

/// Fixed-timestep accumulator.
#[derive(Debug, Clone)]
pub struct SubstepClock {
    /// Fixed step size in seconds
    substep_size: f32,
    /// Most substeps returned for one frame
    max_substeps: u32,
    /// Unconsumed time
    accumulator: f32,
    /// Substeps scheduled so far
    scheduled: u64,
}

impl SubstepClock {
    /// Create a clock with the given step size and per-frame cap.
    #[must_use]
    pub fn new(substep_size: f32, max_substeps: u32) -> Self {
        Self {
            substep_size: substep_size.max(0.001),
            max_substeps: max_substeps.max(1),
            accumulator: 0.0,
            scheduled: 0,
        }
    }

    /// Step size in seconds.
    #[must_use]
    pub fn substep_size(&self) -> f32 {
        self.substep_size
    }

    /// Accumulate `dt` seconds and return the substeps to run.
    pub fn advance(&mut self, dt: f32) -> SubstepSchedule {
        self.accumulator += dt.max(0.0);
        let mut count = 0;

        while self.accumulator >= self.substep_size && count < self.max_substeps {
            self.accumulator -= self.substep_size;
            count += 1;
        }

        // Too far behind to catch up: drop the backlog.
        if self.accumulator > self.substep_size * 2.0 {
            self.accumulator = 0.0;
        }

        self.scheduled += u64::from(count);
        SubstepSchedule {
            substep_size: self.substep_size,
            num_substeps: count,
        }
    }

    /// Substeps scheduled since creation.
    #[must_use]
    pub fn scheduled(&self) -> u64 {
        self.scheduled
    }

    /// Drop accumulated time (after a pause or a reset).
    pub fn reset(&mut self) {
        self.accumulator = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substeps_accumulate() {
        let mut clock = SubstepClock::new(0.01, 4);
        assert_eq!(clock.advance(0.005).num_substeps, 0);
        assert_eq!(clock.advance(0.006).num_substeps, 1);
        assert_eq!(clock.advance(0.02).num_substeps, 2);
        assert_eq!(clock.scheduled(), 3);
    }

    #[test]
    fn test_backlog_is_capped_and_dropped() {
        let mut clock = SubstepClock::new(0.01, 4);
        let schedule = clock.advance(1.0);
        assert_eq!(schedule.num_substeps, 4);
        assert_eq!(clock.advance(0.0).num_substeps, 0);
    }
}
