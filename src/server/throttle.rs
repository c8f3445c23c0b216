//! Per-origin throttling of failed handshakes.
//!
//! Uses a sliding window counter so a scanner hammering the open hop ports
//! is cut off without the server keeping per-connection history.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Counts handshake failures per origin over a sliding window.
pub struct FailureThrottle {
    /// Per-IP failure counts
    counters: RwLock<HashMap<IpAddr, WindowCounter>>,
    /// Failures allowed per window; zero disables throttling
    max_failures: u32,
    /// Window duration
    window: Duration,
    /// Last cleanup time
    last_cleanup: RwLock<Instant>,
}

/// Sliding window counter for a single IP.
struct WindowCounter {
    current: u32,
    previous: u32,
    window_start: Instant,
}

impl WindowCounter {
    fn new(now: Instant) -> Self {
        Self {
            current: 0,
            previous: 0,
            window_start: now,
        }
    }

    /// Move the window forward if it has elapsed.
    fn slide(&mut self, now: Instant, window: Duration) {
        let elapsed = now.duration_since(self.window_start);
        if elapsed >= window * 2 {
            self.current = 0;
            self.previous = 0;
            self.window_start = now;
        } else if elapsed >= window {
            self.previous = self.current;
            self.current = 0;
            self.window_start = now;
        }
    }

    /// Weighted estimate of failures within the last window.
    fn estimate(&mut self, now: Instant, window: Duration) -> u32 {
        self.slide(now, window);

        let elapsed = now.duration_since(self.window_start);
        let weight = (elapsed.as_secs_f64() / window.as_secs_f64()).min(1.0);
        let estimate = (self.previous as f64 * (1.0 - weight)) + self.current as f64;

        estimate.ceil() as u32
    }

    fn record(&mut self, now: Instant, window: Duration) {
        self.slide(now, window);
        self.current = self.current.saturating_add(1);
    }
}

impl FailureThrottle {
    /// Create a new throttle.
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            max_failures,
            window,
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Check if this origin has used up its failure budget.
    pub fn is_throttled(&self, ip: &IpAddr) -> bool {
        if self.max_failures == 0 {
            return false;
        }

        let now = Instant::now();
        let mut counters = self.counters.write();
        match counters.get_mut(ip) {
            Some(counter) => counter.estimate(now, self.window) >= self.max_failures,
            None => false,
        }
    }

    /// Record a failed handshake from this origin.
    pub fn record_failure(&self, ip: &IpAddr) {
        if self.max_failures == 0 {
            return;
        }

        let now = Instant::now();
        let mut counters = self.counters.write();
        self.maybe_cleanup(&mut counters, now);

        counters
            .entry(*ip)
            .or_insert_with(|| WindowCounter::new(now))
            .record(now, self.window);
    }

    /// Forget an origin, e.g. after it completed a valid handshake.
    pub fn reset(&self, ip: &IpAddr) {
        self.counters.write().remove(ip);
    }

    /// Get number of tracked IPs.
    pub fn tracked_count(&self) -> usize {
        self.counters.read().len()
    }

    fn maybe_cleanup(&self, counters: &mut HashMap<IpAddr, WindowCounter>, now: Instant) {
        let mut last_cleanup = self.last_cleanup.write();

        if now.duration_since(*last_cleanup) > self.window * 2 {
            counters.retain(|_, counter| now.duration_since(counter.window_start) < self.window * 3);
            *last_cleanup = now;
        }
    }
}
