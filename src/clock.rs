use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Trait for providing the current time.
/// Decouples bus/worker logic from `Utc::now()` so approval windows and
/// TTL boundaries can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    fn now_epoch(&self) -> i64;
    fn now_utc(&self) -> DateTime<Utc>;

    /// ISO-8601 UTC string used for `app_state.updated_at`.
    fn iso_utc(&self) -> String {
        self.now_utc().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    pub fn new(start_epoch: i64) -> Self {
        Self {
            current: AtomicI64::new(start_epoch),
        }
    }

    pub fn set(&self, epoch: i64) {
        self.current.store(epoch, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.current.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.now_epoch(), 0).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_epoch(), 1_000);
        clock.advance(90);
        assert_eq!(clock.now_epoch(), 1_090);
        clock.set(500);
        assert_eq!(clock.now_epoch(), 500);
    }

    #[test]
    fn iso_format_is_utc() {
        let clock = ManualClock::new(0);
        assert_eq!(clock.iso_utc(), "1970-01-01T00:00:00Z");
    }
}
