//! Per-key "blocked until" deadlines with lazy expiry.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use crate::clock::duration_to_millis;

/// A blocked-until instant in clock milliseconds. A key is blocked strictly before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(u64);

impl Deadline {
    /// Deadline `duration` after `now_ms`, saturating.
    pub fn after(now_ms: u64, duration: Duration) -> Self {
        Self(now_ms.saturating_add(duration_to_millis(duration)))
    }

    /// Clock milliseconds at which the block lifts.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// True once `now_ms` has reached the deadline.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.0 <= now_ms
    }

    /// Time left before the block lifts, `None` once expired.
    pub fn remaining(&self, now_ms: u64) -> Option<Duration> {
        (self.0 > now_ms).then(|| Duration::from_millis(self.0 - now_ms))
    }
}

/// Blocked-until table.
///
/// A key whose deadline has passed is treated exactly like an absent key. Expired entries
/// are removed when they are next looked at through [`BlockRegistry::is_blocked`], or in
/// bulk by [`BlockRegistry::sweep`].
#[derive(Debug, Clone)]
pub struct BlockRegistry<K> {
    deadlines: HashMap<K, Deadline>,
}

impl<K> Default for BlockRegistry<K> {
    fn default() -> Self {
        Self { deadlines: HashMap::new() }
    }
}

impl<K> BlockRegistry<K>
where
    K: Hash + Eq,
{
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `key` until `now_ms + duration`, replacing any existing deadline.
    /// Blocks never stack: a second trip restarts the timer. Returns the new deadline.
    pub fn block(&mut self, key: K, now_ms: u64, duration: Duration) -> Deadline {
        let until = Deadline::after(now_ms, duration);
        self.deadlines.insert(key, until);
        until
    }

    /// True iff `key` has a deadline strictly after `now_ms`. An expired deadline is
    /// removed and reported as not blocked.
    pub fn is_blocked<Q>(&mut self, key: &Q, now_ms: u64) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.deadlines.get(key) {
            Some(until) if !until.is_expired(now_ms) => true,
            Some(_) => {
                self.deadlines.remove(key);
                false
            }
            None => false,
        }
    }

    /// Remaining block time for `key`, without touching the table.
    pub fn remaining<Q>(&self, key: &Q, now_ms: u64) -> Option<Duration>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.deadlines.get(key).and_then(|until| until.remaining(now_ms))
    }

    /// Lift a block. Returns true if an active block was removed.
    pub fn unblock<Q>(&mut self, key: &Q, now_ms: u64) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.deadlines.remove(key).is_some_and(|until| !until.is_expired(now_ms))
    }

    /// Number of keys still blocked at `now_ms`.
    pub fn active(&self, now_ms: u64) -> usize {
        self.deadlines.values().filter(|until| !until.is_expired(now_ms)).count()
    }

    /// Number of stored deadlines, expired ones included.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl<K> BlockRegistry<K>
where
    K: Hash + Eq + Clone,
{
    /// Remove every expired deadline and return the released keys.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<K> {
        let expired: Vec<K> = self
            .deadlines
            .iter()
            .filter(|(_, until)| until.is_expired(now_ms))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.deadlines.remove(key);
        }
        expired
    }
}
