//! Warn-log throttling.

use std::time::{Duration, Instant};

/// A fixed-window event budget: up to `burst` admissions per `window`.
///
/// Keeps warn-level logging on a failing connection from flooding; a
/// stream of undecodable input would otherwise log once per read.
#[derive(Debug)]
pub(crate) struct Throttle {
    burst: u32,
    window: Duration,
    left: u32,
    resets_at: Instant,
}

impl Throttle {
    pub(crate) fn new(burst: u32, window: Duration) -> Throttle {
        Throttle {
            burst,
            window,
            left: burst,
            resets_at: Instant::now() + window,
        }
    }

    /// True if the caller may log this event.
    pub(crate) fn admit(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.resets_at {
            self.left = self.burst;
            self.resets_at = now + self.window;
        }
        if self.left == 0 {
            false
        } else {
            self.left -= 1;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_burst_then_refuses() {
        let mut throttle = Throttle::new(3, Duration::from_secs(60));
        assert!(throttle.admit());
        assert!(throttle.admit());
        assert!(throttle.admit());
        assert!(!throttle.admit());
        assert!(!throttle.admit());
    }

    #[test]
    fn budget_refills_after_the_window() {
        let mut throttle = Throttle::new(1, Duration::from_millis(5));
        assert!(throttle.admit());
        assert!(!throttle.admit());
        std::thread::sleep(Duration::from_millis(10));
        assert!(throttle.admit());
    }
}
