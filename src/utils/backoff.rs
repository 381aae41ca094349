use std::hint::spin_loop;
use std::thread;
use std::time::Duration;

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 256;

/// Escalating idle wait for polling loops: busy-spin first, then yield, then
/// short sleeps once the loop has been idle for a while.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    idle: u32,
    max_sleep: Duration,
}

impl IdleBackoff {
    pub fn new(max_sleep: Duration) -> Self {
        Self { idle: 0, max_sleep }
    }

    /// Work was done; the next idle cycle starts spinning again.
    #[inline]
    pub fn reset(&mut self) {
        self.idle = 0;
    }

    /// Wait a little, longer the longer the loop has been idle.
    #[inline]
    pub fn snooze(&mut self) {
        self.idle = self.idle.saturating_add(1);
        if self.idle < SPIN_LIMIT {
            spin_loop();
        } else if self.idle < YIELD_LIMIT || self.max_sleep.is_zero() {
            thread::yield_now();
        } else {
            // ramp up to max_sleep over the following idle cycles
            let steps = (self.idle - YIELD_LIMIT + 1).min(64);
            thread::sleep((self.max_sleep * steps / 64).max(Duration::from_micros(1)));
        }
    }

    #[inline]
    pub fn is_sleeping(&self) -> bool {
        self.idle >= YIELD_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn escalates_and_resets() {
        let mut backoff = IdleBackoff::new(Duration::from_micros(100));
        for _ in 0..YIELD_LIMIT {
            backoff.snooze();
        }
        assert!(backoff.is_sleeping());
        backoff.reset();
        assert!(!backoff.is_sleeping());
    }

    #[test]
    fn sleep_never_exceeds_cap_by_much() {
        let mut backoff = IdleBackoff::new(Duration::from_micros(200));
        for _ in 0..YIELD_LIMIT + 100 {
            backoff.snooze();
        }
        let start = Instant::now();
        backoff.snooze();
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
