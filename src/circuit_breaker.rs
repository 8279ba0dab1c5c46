//! Sliding-window circuit breaker state.
//!
//! The worker counts unexpected handler failures in a time window; when the
//! threshold is reached it stops executing commands until an explicit
//! `state.resume`. Policy rejections and known-business errors never count.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Ok,
    Tripped,
    Killswitch,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Tripped => "tripped",
            Self::Killswitch => "killswitch",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BreakerState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "tripped" => Ok(Self::Tripped),
            "killswitch" => Ok(Self::Killswitch),
            _ => Err(()),
        }
    }
}

/// Timestamped error descriptions within a sliding window.
pub struct ErrorWindow {
    entries: VecDeque<(i64, String)>,
    threshold: usize,
    window_sec: i64,
}

impl ErrorWindow {
    pub fn new(threshold: usize, window_sec: i64) -> Self {
        Self {
            entries: VecDeque::new(),
            threshold: threshold.max(1),
            window_sec: window_sec.max(1),
        }
    }

    /// Record one error at `now`. Returns true when the pruned window has
    /// reached the threshold.
    pub fn record(&mut self, now: i64, description: &str) -> bool {
        self.entries.push_back((now, description.to_string()));
        self.prune(now);
        self.entries.len() >= self.threshold
    }

    fn prune(&mut self, now: i64) {
        let floor = now - self.window_sec;
        while self
            .entries
            .front()
            .map(|(ts, _)| *ts < floor)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
    }

    pub fn recent(&self) -> Vec<String> {
        self.entries.iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_reached_within_window() {
        let mut window = ErrorWindow::new(3, 60);
        assert!(!window.record(100, "a"));
        assert!(!window.record(110, "b"));
        assert!(window.record(120, "c"));
        assert_eq!(window.recent(), vec!["a", "b", "c"]);
    }

    #[test]
    fn old_errors_fall_out_of_window() {
        let mut window = ErrorWindow::new(3, 60);
        window.record(100, "a");
        window.record(110, "b");
        // 100 and 110 are both older than 200 - 60
        assert!(!window.record(200, "c"));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn clear_resets_the_counter() {
        let mut window = ErrorWindow::new(2, 60);
        window.record(100, "a");
        window.clear();
        assert!(!window.record(101, "b"));
    }

    #[test]
    fn breaker_state_round_trips_app_state_strings() {
        for state in [BreakerState::Ok, BreakerState::Tripped, BreakerState::Killswitch] {
            assert_eq!(state.as_str().parse::<BreakerState>().unwrap(), state);
        }
    }
}
