//! Request tracker.
//!
//! Allocates a timestamp per outstanding request and counts responses
//! against a per-timestamp target. Empty shards are pre-credited so a push
//! that touches only some servers still completes. [`RequestTracker::wait`]
//! blocks the caller until the target is reached. Entries for completed
//! timestamps are retained, so a late `wait` returns immediately.

use parking_lot::{Condvar, Mutex};

use dgt_core::{DgtError, Result};

#[derive(Debug, Clone, Copy)]
struct Entry {
    expected: usize,
    received: usize,
}

impl Entry {
    fn satisfied(&self) -> bool {
        self.received >= self.expected
    }
}

/// Timestamp allocation and response accounting for one worker.
#[derive(Debug, Default)]
pub struct RequestTracker {
    entries: Mutex<Vec<Entry>>,
    satisfied: Condvar,
}

impl RequestTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh timestamp expecting `expected` responses.
    pub fn new_request(&self, expected: usize) -> i32 {
        let mut entries = self.entries.lock();
        let ts = entries.len() as i32;
        entries.push(Entry {
            expected,
            received: 0,
        });
        ts
    }

    /// Credits `n` responses to `ts`.
    ///
    /// Returns true exactly when this call crosses the response target, so
    /// the caller fires the completion callback at most once.
    pub fn add_response(&self, ts: i32, n: usize) -> Result<bool> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(ts as usize)
            .ok_or(DgtError::UnknownTimestamp { timestamp: ts })?;
        let was_satisfied = entry.satisfied();
        entry.received += n;
        let crossed = !was_satisfied && entry.satisfied();
        if crossed {
            self.satisfied.notify_all();
        }
        Ok(crossed)
    }

    /// Credits one response to `ts`; see [`Self::add_response`].
    pub fn record_response(&self, ts: i32) -> Result<bool> {
        self.add_response(ts, 1)
    }

    /// Number of responses received for `ts`.
    pub fn num_response(&self, ts: i32) -> Result<usize> {
        let entries = self.entries.lock();
        entries
            .get(ts as usize)
            .map(|e| e.received)
            .ok_or(DgtError::UnknownTimestamp { timestamp: ts })
    }

    /// Blocks until `ts` has received its expected responses.
    pub fn wait(&self, ts: i32) -> Result<()> {
        let mut entries = self.entries.lock();
        loop {
            let entry = entries
                .get(ts as usize)
                .ok_or(DgtError::UnknownTimestamp { timestamp: ts })?;
            if entry.satisfied() {
                return Ok(());
            }
            self.satisfied.wait(&mut entries);
        }
    }
}
