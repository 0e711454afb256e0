//! Process-local sliding-window rate limiter.
//!
//! Best-effort only: each process instance counts independently, so a
//! multi-instance deployment under-throttles. Entries expire lazily as their
//! keys are touched; a full sweep runs when the map grows past a bound.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SWEEP_THRESHOLD: usize = 1024;

pub struct RateLimiter {
    window: Duration,
    max_attempts: u32,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_attempts: u32) -> Self {
        Self {
            window,
            max_attempts,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt for `key`. Returns false when the window is full;
    /// rejected attempts are not recorded.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap();

        if hits.len() > SWEEP_THRESHOLD {
            let window = self.window;
            hits.retain(|_, v| {
                while v.front().is_some_and(|t| now.duration_since(*t) > window) {
                    v.pop_front();
                }
                !v.is_empty()
            });
        }

        let entry = hits.entry(key.to_string()).or_default();
        while entry
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            entry.pop_front();
        }

        if entry.len() >= self.max_attempts as usize {
            return false;
        }
        entry.push_back(now);
        true
    }
}
