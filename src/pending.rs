// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Cookie to continuation tables, one per operation family.

use std::collections::HashMap;

use log::warn;

/// Maps an in-flight request cookie to the continuation waiting for its
/// response. One instance per operation family (connect, pread, pwrite,
/// fstat); keeping the tables separate keeps the continuation types honest.
pub struct PendingCalls<C> {
    calls: HashMap<i64, C>,
}

impl<C> PendingCalls<C> {
    pub fn new() -> Self {
        PendingCalls {
            calls: HashMap::new(),
        }
    }

    pub fn insert(&mut self, cookie: i64, continuation: C) {
        if self.calls.insert(cookie, continuation).is_some() {
            // Cookies are unique among pending calls by construction.
            warn!("proxy: replaced a pending call for cookie {cookie}");
        }
    }

    /// Removes and returns the continuation for `cookie`, if any. A response
    /// with no matching entry returns `None` and the caller decides whether
    /// that is a protocol error.
    pub fn take(&mut self, cookie: i64) -> Option<C> {
        self.calls.remove(&cookie)
    }

    /// Removes every remaining continuation, for failing them at shutdown.
    pub fn drain(&mut self) -> Vec<C> {
        self.calls.drain().map(|(_, c)| c).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl<C> Default for PendingCalls<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_take() {
        let mut pending: PendingCalls<&str> = PendingCalls::new();
        pending.insert(1, "a");
        pending.insert(-2, "b");
        assert_eq!(pending.take(-2), Some("b"));
        assert_eq!(pending.take(-2), None);
        assert_eq!(pending.take(1), Some("a"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_drain_returns_everything_once() {
        let mut pending: PendingCalls<i32> = PendingCalls::new();
        pending.insert(1, 10);
        pending.insert(2, 20);
        let mut drained = pending.drain();
        drained.sort();
        assert_eq!(drained, vec![10, 20]);
        assert!(pending.drain().is_empty());
    }
}
