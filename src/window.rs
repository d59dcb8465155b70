//! Sliding-window occurrence counting.
//!
//! A [`SignalLog`] is one key's append-only list of millisecond timestamps. Entries that
//! fall out of the window are compacted away on the next [`SignalLog::record`]; nothing
//! ages out proactively. [`SlidingWindowCounter`] keys logs by origin for callers that
//! want a standalone counter.

use std::borrow::Borrow;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use crate::clock::duration_to_millis;

/// Timestamps of one key's recent occurrences of one signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalLog {
    stamps: VecDeque<u64>,
}

impl SignalLog {
    /// Append `now_ms`, drop every entry older than `now_ms - window_ms`, and return how
    /// many entries remain. An entry exactly one window old still counts.
    pub fn record(&mut self, now_ms: u64, window_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(window_ms);
        self.stamps.push_back(now_ms);
        while self.stamps.front().is_some_and(|&t| t < cutoff) {
            self.stamps.pop_front();
        }
        self.stamps.len()
    }

    /// In-window entries as of `now_ms`, without compacting.
    pub fn count(&self, now_ms: u64, window_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(window_ms);
        self.stamps.iter().filter(|&&t| t >= cutoff).count()
    }

    /// True when no entry is left inside the window, so dropping the log changes nothing.
    pub fn is_stale(&self, now_ms: u64, window_ms: u64) -> bool {
        let cutoff = now_ms.saturating_sub(window_ms);
        !self.stamps.back().is_some_and(|&t| t >= cutoff)
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.stamps.clear();
    }

    /// Stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

/// Per-key rolling count of recent events.
///
/// This is a plain data structure: mutation takes `&mut self`.
#[derive(Debug, Clone)]
pub struct SlidingWindowCounter<K> {
    window_ms: u64,
    entries: HashMap<K, SignalLog>,
}

impl<K> SlidingWindowCounter<K>
where
    K: Hash + Eq,
{
    /// Create a counter over a fixed `window`.
    pub fn new(window: Duration) -> Self {
        Self { window_ms: duration_to_millis(window), entries: HashMap::new() }
    }

    /// The configured window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Record an occurrence for `key` and return its in-window count.
    pub fn record(&mut self, key: K, now_ms: u64) -> usize {
        self.entries.entry(key).or_default().record(now_ms, self.window_ms)
    }

    /// Forget everything recorded for `key`.
    pub fn reset<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key);
    }

    /// In-window entries for `key` as of `now_ms`, without compacting.
    pub fn count<Q>(&self, key: &Q, now_ms: u64) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map_or(0, |log| log.count(now_ms, self.window_ms))
    }

    /// Drop keys whose newest entry has aged out. Returns the number of keys dropped.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let window_ms = self.window_ms;
        let before = self.entries.len();
        self.entries.retain(|_, log| !log.is_stale(now_ms, window_ms));
        before - self.entries.len()
    }

    /// Number of keys with a log, including logs that have aged out but not been touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
