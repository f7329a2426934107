use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Source of epoch-second timestamps for slot rotation and audit rows.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Clock that advances by one second on every reading.
#[derive(Debug)]
pub struct SteppingClock {
    next: AtomicI64,
}

impl SteppingClock {
    pub fn starting_at(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepping_clock_is_strictly_increasing() {
        let clock = SteppingClock::starting_at(1_700_000_000);
        let first = clock.now();
        let second = clock.now();
        assert_eq!(first, 1_700_000_000);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn system_clock_reports_epoch_seconds() {
        assert!(SystemClock.now() > 1_600_000_000);
    }
}
