// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for instrumenting runtime subsystems
//!
//! This contains an implementation of a bounded ring recorder designed to
//! instrument arbitrary contexts. While there is nothing to prevent these
//! recorders from being left in production code, the design center is
//! primarily around debugging in development: the recorder is cheap enough
//! to stay on, and its contents can be inspected from tests or a debugger
//! after the fact.
//!
//! ## Constraints
//!
//! The entry type must implement [`Copy`]. Consecutive identical entries are
//! de-duplicated into a repeat count, so the entry type must also implement
//! [`PartialEq`].
//!
//! ## Retention
//!
//! A recorder keeps the last `N` entries, where `N` is fixed at
//! construction. When a very large number of entries has been recorded,
//! historical data may have fallen off the end; the recorder therefore also
//! keeps a total count of everything ever recorded, so it is possible to
//! tell that activity occurred even after the entries describing it have
//! been overwritten.

/// One stored entry: the payload plus how many consecutive times it was
/// recorded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingEntry<E> {
    pub payload: E,
    pub count: u32,
}

/// Bounded recorder of `Copy` entries with last-write de-duplication.
#[derive(Debug)]
pub struct RingLog<E> {
    entries: Vec<RingEntry<E>>,
    /// Index of the most recently written slot, or `None` before the first
    /// record.
    last: Option<usize>,
    capacity: usize,
    /// Total number of `record` calls ever, including de-duplicated and
    /// overwritten ones.
    total: u64,
}

impl<E: Copy + PartialEq> RingLog<E> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            entries: Vec::with_capacity(capacity),
            last: None,
            capacity,
            total: 0,
        }
    }

    /// Records an entry. If it equals the most recent entry, its repeat
    /// count is bumped instead of consuming a slot.
    pub fn record(&mut self, payload: E) {
        self.total += 1;

        if let Some(last) = self.last {
            let e = &mut self.entries[last];
            if e.payload == payload {
                e.count = e.count.saturating_add(1);
                return;
            }
        }

        let ndx = match self.last {
            None => 0,
            Some(last) if last + 1 >= self.capacity => 0,
            Some(last) => last + 1,
        };

        let entry = RingEntry { payload, count: 1 };
        if ndx < self.entries.len() {
            self.entries[ndx] = entry;
        } else {
            self.entries.push(entry);
        }
        self.last = Some(ndx);
    }

    /// Total number of entries ever recorded (not just retained).
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    /// Iterates over retained entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RingEntry<E>> {
        let split = match self.last {
            // Entries are in order unless we have wrapped, in which case the
            // oldest entry is just after the last written slot.
            Some(last) if self.entries.len() == self.capacity => {
                (last + 1) % self.capacity
            }
            _ => 0,
        };
        let (older, newer) = self.entries.split_at(split);
        newer.iter().chain(older.iter())
    }

    /// Counts retained occurrences satisfying `pred`, honoring repeat
    /// counts.
    pub fn count_matching(&self, mut pred: impl FnMut(&E) -> bool) -> u64 {
        self.iter()
            .filter(|e| pred(&e.payload))
            .map(|e| u64::from(e.count))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Ev {
        Send(u16),
        Recv(u16),
    }

    #[test]
    fn records_in_order() {
        let mut uut = RingLog::new(4);
        uut.record(Ev::Send(1));
        uut.record(Ev::Recv(1));
        let got: Vec<_> = uut.iter().map(|e| e.payload).collect();
        assert_eq!(got, [Ev::Send(1), Ev::Recv(1)]);
    }

    #[test]
    fn dedups_consecutive_entries() {
        let mut uut = RingLog::new(4);
        uut.record(Ev::Send(1));
        uut.record(Ev::Send(1));
        uut.record(Ev::Send(1));
        let got: Vec<_> = uut.iter().copied().collect();
        assert_eq!(
            got,
            [RingEntry {
                payload: Ev::Send(1),
                count: 3
            }]
        );
        assert_eq!(uut.total_recorded(), 3);
    }

    #[test]
    fn wraps_and_keeps_newest() {
        let mut uut = RingLog::new(3);
        for i in 0..5 {
            uut.record(Ev::Send(i));
        }
        let got: Vec<_> = uut.iter().map(|e| e.payload).collect();
        assert_eq!(got, [Ev::Send(2), Ev::Send(3), Ev::Send(4)]);
        assert_eq!(uut.total_recorded(), 5);
    }

    #[test]
    fn count_matching_honors_repeats() {
        let mut uut = RingLog::new(8);
        uut.record(Ev::Send(1));
        uut.record(Ev::Send(1));
        uut.record(Ev::Recv(1));
        assert_eq!(uut.count_matching(|e| matches!(e, Ev::Send(_))), 2);
    }
}
