//! The clock is an external collaborator: the gateway never reads
//! `SystemTime::now()` directly outside this module, so tests can supply a
//! deterministic clock when exercising freshness windows.

use crate::types::Timespec;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timespec;

    /// Milliseconds elapsed between `earlier` and `self.now()`. Saturates at
    /// zero if `earlier` is in the future.
    fn elapsed_ms(&self, earlier: Timespec) -> u64 {
        let now = self.now();
        let now_ms = now.sec.saturating_mul(1000) + i64::from(now.nsec) / 1_000_000;
        let then_ms = earlier.sec.saturating_mul(1000) + i64::from(earlier.nsec) / 1_000_000;
        now_ms.saturating_sub(then_ms).max(0) as u64
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timespec {
        Timespec::now()
    }
}

/// Deterministic clock for tests: advances only when told to.
#[cfg(test)]
pub struct FakeClock(parking_lot::Mutex<Timespec>);

#[cfg(test)]
impl FakeClock {
    #[must_use]
    pub fn new(start: Timespec) -> Self {
        Self(parking_lot::Mutex::new(start))
    }

    pub fn advance_ms(&self, ms: i64) {
        let mut t = self.0.lock();
        let total_ns = t.sec * 1_000_000_000 + i64::from(t.nsec) + ms * 1_000_000;
        t.sec = total_ns.div_euclid(1_000_000_000);
        t.nsec = total_ns.rem_euclid(1_000_000_000) as i32;
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now(&self) -> Timespec {
        *self.0.lock()
    }
}
