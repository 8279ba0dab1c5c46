//! Channel-level authentication for the chat ingress: user allowlist,
//! per-user sliding rate limit and short-lived PIN sessions.

use std::collections::{HashMap, HashSet, VecDeque};

/// Seconds a `/pin` session stays valid.
pub const PIN_SESSION_TTL: i64 = 60;

const RATE_WINDOW_SEC: i64 = 60;
const THROTTLE_EVENT_EVERY_SEC: i64 = 60;

#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    users: HashSet<i64>,
}

impl Allowlist {
    pub fn new(users: impl IntoIterator<Item = i64>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }

    /// An empty allowlist places no restriction.
    pub fn permits(&self, user: Option<i64>) -> bool {
        if self.users.is_empty() {
            return true;
        }
        user.map(|u| self.users.contains(&u)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Sliding-window limiter, one window per user.
pub struct RateLimiter {
    limit: usize,
    buckets: HashMap<i64, VecDeque<i64>>,
    last_throttle_event: HashMap<i64, i64>,
}

impl RateLimiter {
    pub fn new(limit_per_min: usize) -> Self {
        Self {
            limit: limit_per_min,
            buckets: HashMap::new(),
            last_throttle_event: HashMap::new(),
        }
    }

    pub fn allow(&mut self, user: i64, now: i64) -> bool {
        if self.limit == 0 {
            return true;
        }
        let bucket = self.buckets.entry(user).or_default();
        while bucket
            .front()
            .map(|ts| now - ts >= RATE_WINDOW_SEC)
            .unwrap_or(false)
        {
            bucket.pop_front();
        }
        if bucket.len() >= self.limit {
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// The `rate.limited` event is throttled to one per minute per user.
    pub fn should_emit_throttle(&mut self, user: i64, now: i64) -> bool {
        match self.last_throttle_event.get(&user) {
            Some(last) if now - last < THROTTLE_EVENT_EVERY_SEC => false,
            _ => {
                self.last_throttle_event.insert(user, now);
                true
            }
        }
    }
}

/// Short-lived authenticated sessions opened by `/pin <secret>`.
pub struct PinSessions {
    sessions: HashMap<i64, i64>,
}

impl PinSessions {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    pub fn grant(&mut self, user: i64, now: i64) {
        self.sessions.insert(user, now + PIN_SESSION_TTL);
    }

    pub fn is_valid(&mut self, user: i64, now: i64) -> bool {
        match self.sessions.get(&user) {
            Some(expiry) if now <= *expiry => true,
            Some(_) => {
                self.sessions.remove(&user);
                false
            }
            None => false,
        }
    }
}

impl Default for PinSessions {
    fn default() -> Self {
        Self::new()
    }
}
