// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler loop: single-threaded, cooperative, non-blocking.
//!
//! One [`Runtime::poll`] iteration probes for at most one incoming
//! message, polls a bounded batch of outstanding events, drains one unit
//! of deferred work, and gives the termination detector a chance to run a
//! wave. Nothing blocks; handlers and sequencer closures run to
//! completion, and the only suspension points are explicit waits.

use crate::event::Action;
use crate::Runtime;
use abi::{Priority, SYS_DEFAULT_PRIORITY, SYS_MIN_PRIORITY};
use std::collections::VecDeque;

#[derive(Default)]
pub struct RunQueue {
    work: VecDeque<Action>,
    /// Minimum-priority band; drained only when `work` is empty. The
    /// termination protocol parks its deferred steps here so waves never
    /// starve user work.
    low: VecDeque<Action>,
}

impl Runtime {
    /// Defers `action` to a later scheduler iteration at default
    /// priority.
    pub(crate) fn sched_enqueue(&mut self, action: Action) {
        self.sched_enqueue_prio(SYS_DEFAULT_PRIORITY, action);
    }

    /// Defers `action` at an explicit priority. Anything more important
    /// than [`SYS_MIN_PRIORITY`] shares the default band.
    pub(crate) fn sched_enqueue_prio(&mut self, prio: Priority, action: Action) {
        if prio.is_more_important_than(SYS_MIN_PRIORITY) {
            self.sched.work.push_back(action);
        } else {
            self.sched.low.push_back(action);
        }
    }

    fn run_one_queued(&mut self) -> bool {
        let next = self
            .sched
            .work
            .pop_front()
            .or_else(|| self.sched.low.pop_front());
        match next {
            Some(w) => {
                w(self);
                true
            }
            None => false,
        }
    }

    /// One scheduler iteration. Returns true if any progress was made.
    pub fn poll(&mut self) -> bool {
        let mut progress = self.try_process_incoming_message();
        progress |= self.perform_triggered_actions(self.cfg.event_poll_batch);
        progress |= self.run_one_queued();
        self.maybe_propagate();
        progress
    }

    /// Runs `n` scheduler iterations.
    pub fn run(&mut self, n: usize) {
        for _ in 0..n {
            self.poll();
        }
    }

    /// Polls until the global termination detector fires.
    pub fn run_until_terminated(&mut self) {
        while !self.is_terminated() {
            self.poll();
        }
    }
}
