//! Throughput measurement and frame pacing.
//!
//! `FpsTracker` computes an instantaneous rate over a sliding window of event
//! timestamps. `Pacer` sleeps against an accumulating schedule so a fast decoder
//! is held to the source's native rate without cumulative drift.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default number of events kept in the sliding window.
pub const DEFAULT_FPS_WINDOW: usize = 60;

/// Sliding-window event rate.
#[derive(Clone, Debug)]
pub struct FpsTracker {
    window: usize,
    stamps: VecDeque<f64>,
    origin: Instant,
}

impl FpsTracker {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            stamps: VecDeque::with_capacity(window),
            origin: Instant::now(),
        }
    }

    /// Record an event at `timestamp` (seconds, any monotonic origin).
    pub fn record(&mut self, timestamp: f64) {
        while self.stamps.len() >= self.window {
            self.stamps.pop_front();
        }
        self.stamps.push_back(timestamp);
    }

    /// Record an event now, using the tracker's own monotonic clock.
    pub fn tick(&mut self) {
        let now = self.origin.elapsed().as_secs_f64();
        self.record(now);
    }

    /// Events per second over the window; 0 with fewer than two samples.
    pub fn rate(&self) -> f64 {
        if self.stamps.len() < 2 {
            return 0.0;
        }
        let (Some(oldest), Some(newest)) = (self.stamps.front(), self.stamps.back()) else {
            return 0.0;
        };
        let elapsed = newest - oldest;
        if elapsed <= 0.0 {
            return 0.0;
        }
        (self.stamps.len() - 1) as f64 / elapsed
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

impl Default for FpsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FPS_WINDOW)
    }
}

/// Fixed-rate schedule (`next_tick += interval`).
///
/// When the caller falls behind, the schedule resets to now instead of
/// bursting to catch up.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    next_tick: Instant,
}

impl Pacer {
    pub fn new(fps: f64) -> Self {
        let interval = if fps.is_finite() && fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next_tick: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Advance the schedule by one interval and sleep until it, if ahead.
    /// Returns the time slept.
    pub fn wait(&mut self) -> Duration {
        if self.interval.is_zero() {
            return Duration::ZERO;
        }
        self.next_tick += self.interval;
        let now = Instant::now();
        if self.next_tick > now {
            let sleep = self.next_tick - now;
            std::thread::sleep(sleep);
            sleep
        } else {
            self.next_tick = now;
            Duration::ZERO
        }
    }

    pub fn reset(&mut self) {
        self.next_tick = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_over_three_evenly_spaced_events() {
        let mut fps = FpsTracker::default();
        fps.record(0.0);
        fps.record(1.0);
        fps.record(2.0);
        assert_eq!(fps.rate(), 1.0);
    }

    #[test]
    fn rate_is_zero_below_two_samples() {
        let mut fps = FpsTracker::default();
        assert_eq!(fps.rate(), 0.0);
        fps.record(5.0);
        assert_eq!(fps.rate(), 0.0);
    }

    #[test]
    fn window_keeps_only_recent_events() {
        let mut fps = FpsTracker::new(3);
        // Slow start, then a fast burst; only the burst should count.
        fps.record(0.0);
        fps.record(10.0);
        fps.record(10.5);
        fps.record(11.0);
        assert_eq!(fps.len(), 3);
        assert_eq!(fps.rate(), 2.0);
    }

    #[test]
    fn pacer_holds_rate_and_resets_when_behind() {
        let mut pacer = Pacer::new(100.0);
        let start = Instant::now();
        for _ in 0..5 {
            pacer.wait();
        }
        assert!(start.elapsed() >= Duration::from_millis(45));

        std::thread::sleep(Duration::from_millis(50));
        // Behind schedule: no sleep, schedule snaps to now.
        assert_eq!(pacer.wait(), Duration::ZERO);
    }

    #[test]
    fn pacer_without_rate_never_sleeps() {
        let mut pacer = Pacer::new(0.0);
        assert_eq!(pacer.wait(), Duration::ZERO);
    }
}
