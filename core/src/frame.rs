//! Per-frame timing stamp.

use std::time::{Duration, Instant};

/// Identifies one application frame.
///
/// Created by the application loop and advanced once per frame; recorders
/// and transfer tasks receive it so they can tag work with the frame it
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStamp {
    /// Monotonically increasing frame number, starting at 0.
    pub frame_count: u64,
    /// Wall-clock time the frame started.
    pub time: Instant,
    /// Simulation time in seconds since the first frame.
    pub simulation_time: f64,
}

impl FrameStamp {
    /// Stamp for the first frame.
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            time: Instant::now(),
            simulation_time: 0.0,
        }
    }

    /// Stamp for a specific frame number, timed now.
    pub fn with_frame_count(frame_count: u64) -> Self {
        Self {
            frame_count,
            ..Self::new()
        }
    }

    /// Produce the stamp for the next frame, measured against `now`.
    pub fn next_at(&self, now: Instant, start: Instant) -> Self {
        Self {
            frame_count: self.frame_count + 1,
            time: now,
            simulation_time: now.saturating_duration_since(start).as_secs_f64(),
        }
    }

    /// Time elapsed between this stamp and a later one.
    pub fn delta(&self, later: &FrameStamp) -> Duration {
        later.time.saturating_duration_since(self.time)
    }
}

impl Default for FrameStamp {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_increments_frame_count() {
        let start = Instant::now();
        let first = FrameStamp::new();
        let later = start + Duration::from_millis(16);
        let second = first.next_at(later, start);
        assert_eq!(second.frame_count, 1);
        assert!((second.simulation_time - 0.016).abs() < 1e-9);
    }

    #[test]
    fn test_delta_never_negative() {
        let a = FrameStamp::new();
        let b = FrameStamp { time: a.time, ..a };
        assert_eq!(b.delta(&a), Duration::ZERO);
    }
}
