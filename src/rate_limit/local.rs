use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// In-process fixed-window counters, used whenever the shared store is
/// unavailable. Memory is bounded: the map is capped at `max_keys` entries
/// and expired windows are pruned every `sweep_every` calls.
pub struct LocalStore {
    buckets: Mutex<Buckets>,
    max_keys: usize,
    sweep_every: u64,
}

#[derive(Default)]
struct Buckets {
    windows: HashMap<String, Window>,
    calls: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    reset_at: i64,
}

impl LocalStore {
    pub fn new(max_keys: usize, sweep_every: u64) -> Self {
        Self {
            buckets: Mutex::default(),
            max_keys: max_keys.max(1),
            sweep_every: sweep_every.max(1),
        }
    }

    /// Count one hit on `key` at unix time `now`.
    /// Returns the count within the current window and when that window ends.
    pub fn increment(&self, key: &str, window_seconds: u64, now: i64) -> (u64, i64) {
        let window_seconds = i64::try_from(window_seconds).unwrap_or(i64::MAX);
        // A poisoned lock only means another thread panicked mid-update;
        // the counters themselves are still usable.
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        buckets.calls = buckets.calls.wrapping_add(1);
        if buckets.calls % self.sweep_every == 0 {
            buckets.windows.retain(|_, window| window.reset_at > now);
        }

        let window = buckets
            .windows
            .entry(key.to_string())
            .and_modify(|window| {
                if window.reset_at <= now {
                    window.count = 1;
                    window.reset_at = now.saturating_add(window_seconds);
                } else {
                    window.count = window.count.saturating_add(1);
                }
            })
            .or_insert(Window {
                count: 1,
                reset_at: now.saturating_add(window_seconds),
            });
        let result = (window.count, window.reset_at);

        if buckets.windows.len() > self.max_keys {
            let excess = buckets.windows.len() - self.max_keys;
            let victims: Vec<String> = buckets
                .windows
                .keys()
                .filter(|k| k.as_str() != key)
                .take(excess)
                .cloned()
                .collect();
            for victim in victims {
                buckets.windows.remove(&victim);
            }
        }

        result
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .windows
            .len()
    }
}
