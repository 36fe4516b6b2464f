// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker clock.
//!
//! Broker time is Unix seconds, optionally accelerated by a time-warp factor
//! for playback and simulation. Warped time advances `warp` times faster than
//! wall clock starting from the instant the clock was created.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic, warpable broker clock.
#[derive(Debug, Clone)]
pub struct Clock {
    origin_unix: f64,
    origin: Instant,
    warp: f64,
}

impl Clock {
    /// Create a clock anchored at the current wall-clock time.
    pub fn new(warp: f64) -> Self {
        Self {
            origin_unix: unix_now(),
            origin: Instant::now(),
            warp: if warp > 0.0 { warp } else { 1.0 },
        }
    }

    /// Current broker time in seconds.
    pub fn now(&self) -> f64 {
        self.origin_unix + self.origin.elapsed().as_secs_f64() * self.warp
    }

    /// Time-warp factor.
    pub fn warp(&self) -> f64 {
        self.warp
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Wall-clock Unix time in seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clock_tracks_wall_time() {
        let clock = Clock::new(1.0);
        let diff = (clock.now() - unix_now()).abs();
        assert!(diff < 1.0);
    }

    #[test]
    fn test_clock_warp() {
        let clock = Clock::new(10.0);
        let start = clock.now();
        std::thread::sleep(Duration::from_millis(50));
        let elapsed = clock.now() - start;
        assert!(elapsed >= 0.45, "warped elapsed {}", elapsed);
    }

    #[test]
    fn test_invalid_warp_defaults() {
        assert_eq!(Clock::new(0.0).warp(), 1.0);
        assert_eq!(Clock::new(-2.0).warp(), 1.0);
    }
}
