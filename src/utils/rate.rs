use std::thread;
use std::time::{Duration, Instant};

/// Fixed-cadence pacer.
///
/// When a caller falls behind, `next_time` jumps forward by whole periods
/// until it is back in the future: missed ticks are skipped rather than
/// replayed, and callers that run slightly late each cycle do not drift.
#[derive(Debug, Clone)]
pub struct Rate {
    period: Duration,
    next_time: Instant,
}

/// Longest supported period; longer requests are clamped so schedule
/// arithmetic on `Instant` cannot overflow.
pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const MIN_PERIOD: Duration = Duration::from_nanos(1);

impl Rate {
    /// The period is clamped to `[1ns, MAX_PERIOD]`; a zero period would make
    /// catch-up spin forever.
    pub fn new(period: Duration) -> Self {
        let period = period.clamp(MIN_PERIOD, MAX_PERIOD);
        Self {
            period,
            next_time: Instant::now() + period,
        }
    }

    /// Non-positive or NaN rates run as fast as possible; rates too small to
    /// express run at [`MAX_PERIOD`].
    pub fn from_hz(hz: f64) -> Self {
        let period = if hz > 0.0 {
            Duration::try_from_secs_f64(hz.recip()).unwrap_or(MAX_PERIOD)
        } else {
            MIN_PERIOD
        };
        Self::new(period)
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    #[inline]
    pub fn next_time(&self) -> Instant {
        self.next_time
    }

    /// Restart the schedule one period from now.
    pub fn reset(&mut self) {
        self.next_time = Instant::now() + self.period;
    }

    /// Time left until the next tick, zero if it is already due.
    #[inline]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_time.saturating_duration_since(now)
    }

    /// Block until the next tick.
    pub fn sleep(&mut self) {
        let now = Instant::now();
        if now >= self.next_time {
            self.catch_up(now);
        }
        let wait = self.next_time.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }

    /// Non-blocking form of [`Rate::sleep`]: returns true once per due tick.
    ///
    /// The schedule is advanced past `now`, so several missed periods still
    /// produce a single `true`.
    pub fn try_tick(&mut self, now: Instant) -> bool {
        if now < self.next_time {
            return false;
        }
        self.catch_up(now);
        true
    }

    fn catch_up(&mut self, now: Instant) {
        let behind = now.duration_since(self.next_time).as_nanos();
        let period = self.period.as_nanos();
        let periods = behind / period + 1;
        let step = period.saturating_mul(periods).min(u64::MAX as u128) as u64;
        self.next_time += Duration::from_nanos(step);
    }
}
