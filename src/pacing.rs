//! Frame pacing for the capture loop.
//!
//! The loop sleeps `budget - processing - overhead` after every produced frame so the
//! observed interval between callbacks settles on `1000 / fps` milliseconds. Cycles that
//! produce nothing sleep the whole budget. No sleep is ever shorter than [`MIN_SLEEP`].
use std::time::{Duration, Instant};

/// Shortest sleep the loop will ever request.
pub const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Computes per-cycle sleep times for a target frame rate.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct FramePacer {
    budget: Duration,
    overhead: Duration,
}

impl FramePacer {
    /// Creates a pacer for `target_fps` frames per second.
    ///
    /// The budget is `1000 / target_fps` whole milliseconds. A `target_fps` of zero is
    /// treated as one.
    #[inline]
    #[must_use]
    pub const fn new(target_fps: u32, overhead: Duration) -> Self {
        let fps = if target_fps == 0 { 1 } else { target_fps };
        Self { budget: Duration::from_millis(1000 / fps as u64), overhead }
    }

    /// Time allotted to one full cycle.
    #[inline]
    #[must_use]
    pub const fn budget(&self) -> Duration {
        self.budget
    }

    /// Fixed scheduling latency credited against each sleep.
    #[inline]
    #[must_use]
    pub const fn overhead(&self) -> Duration {
        self.overhead
    }

    /// Sleep after a cycle that delivered a frame and took `elapsed` to do so.
    #[inline]
    #[must_use]
    pub fn sleep_after_frame(&self, elapsed: Duration) -> Duration {
        self.budget.saturating_sub(elapsed).saturating_sub(self.overhead).max(MIN_SLEEP)
    }

    /// Sleep after a cycle that produced no frame.
    #[inline]
    #[must_use]
    pub fn sleep_after_idle(&self) -> Duration {
        self.budget.max(MIN_SLEEP)
    }
}

/// Counts delivered frames and reports the achieved rate once per second.
#[derive(Debug)]
pub struct FpsCounter {
    window_start: Instant,
    frames: u32,
}

impl FpsCounter {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self { window_start: Instant::now(), frames: 0 }
    }

    /// Records one cycle. Returns the number of frames counted over the last second once a
    /// full second has elapsed, then starts a new window.
    #[inline]
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        self.frames += 1;

        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            let frames = self.frames;
            self.frames = 0;
            self.window_start = now;
            return Some(frames);
        }

        None
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}
