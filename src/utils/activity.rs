use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared "someone is running this" flag (node spinning, executor running).
///
/// The flag is raised by entering and lowered when the returned guard drops,
/// so a panicking spin loop never leaves it stuck up.
#[derive(Clone, Default)]
pub struct ActivityFlag(Arc<CachePadded<AtomicBool>>);

impl ActivityFlag {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Raise the flag unconditionally.
    pub fn enter(&self) -> ActiveGuard {
        self.0.store(true, Ordering::Release);
        ActiveGuard(self.clone())
    }

    /// Raise the flag only if it is down.
    pub fn try_enter(&self) -> Option<ActiveGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ActiveGuard(self.clone()))
    }
}

impl fmt::Debug for ActivityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ActivityFlag").field(&self.is_active()).finish()
    }
}

/// Lowers its [`ActivityFlag`] on drop.
#[must_use = "the flag drops back down as soon as the guard is dropped"]
pub struct ActiveGuard(ActivityFlag);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        (self.0).0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_lowers_flag_and_blocks_second_entry() {
        let flag = ActivityFlag::new();
        let guard = flag.try_enter().unwrap();
        assert!(flag.is_active());
        assert!(flag.try_enter().is_none());
        drop(guard);
        assert!(!flag.is_active());
        assert!(flag.try_enter().is_some());
    }

    #[test]
    fn flag_drops_when_holder_panics() {
        let flag = ActivityFlag::new();
        let held = flag.clone();
        let _ = std::thread::spawn(move || {
            let _active = held.enter();
            panic!("spin loop died");
        })
        .join();
        assert!(!flag.is_active());
    }
}
