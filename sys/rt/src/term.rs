// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Distributed termination detection: the four-counter method over a
//! spanning tree, per epoch.
//!
//! Every rank keeps, per epoch plus one distinguished any-epoch state,
//! cumulative local produce/consume counters and two generations of global
//! sums. A *wave* ascends the tree: once a rank has folded in reports from
//! all of its children (plus its own, hence `num_children + 1`), it adds
//! its local counters into the first-generation sums and reports to its
//! parent. At the root, termination is declared iff
//!
//! ```text
//! g_prod1 == g_cons1  &&  g_prod2 == g_cons2  &&  g_prod1 == g_prod2
//! ```
//!
//! i.e. two consecutive waves balanced with equal totals. Otherwise the
//! root rotates generation one into generation two and broadcasts a
//! continue, which re-arms `propagate` everywhere and starts the next
//! wave. All protocol traffic is `IS_TERM`-flagged and thus invisible to
//! the counters it is summing.
//!
//! The any-epoch state observes *all* non-termination traffic; its
//! detection is global quiescence and fires the global termination
//! actions.
//!
//! Epochs must exist on every rank before waves for them can complete,
//! which is what the new-epoch protocol is for: a presence reduction up
//! the tree followed by a `ReadyEpoch` broadcast that allocates state
//! everywhere and advances the resolved-epoch window.

use crate::event::Action;
use crate::message::Message;
use crate::trace::RtEvent;
use crate::Runtime;
use abi::{Epoch, NodeId, ANY_EPOCH, FIRST_EPOCH, NO_EPOCH};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub(crate) type TermCounter = i64;

/// Per-epoch detector state.
#[derive(Debug)]
pub(crate) struct TermState {
    pub l_prod: TermCounter,
    pub l_cons: TermCounter,

    pub g_prod1: TermCounter,
    pub g_cons1: TermCounter,
    pub g_prod2: TermCounter,
    pub g_cons2: TermCounter,

    /// Wave fold-in count; the wave fires at `num_children + 1` (children
    /// reports plus our own, which is always pending, hence starting at
    /// one).
    pub recv_event_count: i32,

    /// Whether this state participates in the current wave.
    pub propagate: bool,
}

impl Default for TermState {
    fn default() -> Self {
        Self {
            l_prod: 0,
            l_cons: 0,
            g_prod1: 0,
            g_cons1: 0,
            g_prod2: 0,
            g_cons2: 0,
            recv_event_count: 1,
            propagate: true,
        }
    }
}

/// Spanning-tree position of this rank (k=2, rooted at rank 0).
#[derive(Copy, Clone, Debug)]
pub(crate) struct TermTree {
    pub parent: NodeId,
    pub num_children: i32,
    pub is_root: bool,
}

impl TermTree {
    pub fn for_rank(node: NodeId, num_nodes: NodeId) -> Self {
        let c1 = node * 2 + 1;
        let c2 = node * 2 + 2;
        let num_children =
            (c1 < num_nodes) as i32 + (c2 < num_nodes) as i32;
        Self {
            parent: if node == 0 { 0 } else { (node - 1) / 2 },
            num_children,
            is_root: node == 0,
        }
    }
}

pub struct Termination {
    pub(crate) tree: TermTree,
    any_epoch: TermState,
    epochs: HashMap<Epoch, TermState>,

    epoch_actions: HashMap<Epoch, Vec<Action>>,
    global_actions: Vec<Action>,

    /// Epochs whose `epoch_finished` already ran here (at-most-once).
    finished: HashSet<Epoch>,

    /// Presence counts for the new-epoch reduction.
    ready_reports: HashMap<Epoch, i32>,

    cur_epoch: Epoch,
    first_resolved: Epoch,
    last_resolved: Epoch,

    /// Set when the any-epoch state terminates.
    pub(crate) terminated: bool,
}

impl Termination {
    pub(crate) fn new(node: NodeId, num_nodes: NodeId) -> Self {
        Self {
            tree: TermTree::for_rank(node, num_nodes),
            any_epoch: TermState::default(),
            epochs: HashMap::new(),
            epoch_actions: HashMap::new(),
            global_actions: Vec::new(),
            finished: HashSet::new(),
            ready_reports: HashMap::new(),
            cur_epoch: FIRST_EPOCH,
            first_resolved: NO_EPOCH,
            last_resolved: NO_EPOCH,
            terminated: false,
        }
    }

    fn state_for(&mut self, epoch: Epoch) -> &mut TermState {
        if epoch == ANY_EPOCH {
            &mut self.any_epoch
        } else {
            self.epochs.entry(epoch).or_default()
        }
    }

    /// Balanced-counter check for tests and teardown: local production
    /// and consumption for `epoch`.
    pub fn local_counters(&self, epoch: Epoch) -> (i64, i64) {
        if epoch == ANY_EPOCH {
            (self.any_epoch.l_prod, self.any_epoch.l_cons)
        } else {
            self.epochs
                .get(&epoch)
                .map(|s| (s.l_prod, s.l_cons))
                .unwrap_or((0, 0))
        }
    }

    /// The window of epochs known resolved on this rank.
    pub fn resolved_window(&self) -> (Epoch, Epoch) {
        (self.first_resolved, self.last_resolved)
    }
}

impl Runtime {
    /// Accounts one unit of production against `epoch` (and always against
    /// the any-epoch state).
    pub fn produce(&mut self, epoch: Epoch) {
        self.produce_units(epoch, 1);
    }

    pub fn consume(&mut self, epoch: Epoch) {
        self.consume_units(epoch, 1);
    }

    pub(crate) fn produce_units(&mut self, epoch: Epoch, units: i64) {
        self.term.any_epoch.l_prod += units;
        if epoch != NO_EPOCH && epoch != ANY_EPOCH {
            self.term.state_for(epoch).l_prod += units;
        }
    }

    pub(crate) fn consume_units(&mut self, epoch: Epoch, units: i64) {
        self.term.any_epoch.l_cons += units;
        if epoch != NO_EPOCH && epoch != ANY_EPOCH {
            self.term.state_for(epoch).l_cons += units;
        }
    }

    /// True once the any-epoch detector has declared global termination.
    pub fn is_terminated(&self) -> bool {
        self.term.terminated
    }

    /// Local `(produced, consumed)` for `epoch` (pass [`ANY_EPOCH`] for
    /// the global state). Diagnostics and tests.
    pub fn term_counters(&self, epoch: Epoch) -> (i64, i64) {
        self.term.local_counters(epoch)
    }

    /// The `[first_resolved, last_resolved]` epoch window on this rank.
    pub fn resolved_epoch_window(&self) -> (Epoch, Epoch) {
        self.term.resolved_window()
    }

    /// Registers `action` to fire at global termination.
    pub fn attach_global_term_action(&mut self, action: Action) {
        self.term.global_actions.push(action);
    }

    /// Registers `action` to fire when `epoch` is detected terminated.
    /// Epoch actions fire exactly once and are then erased.
    pub fn attach_epoch_term_action(&mut self, epoch: Epoch, action: Action) {
        self.term.epoch_actions.entry(epoch).or_default().push(action);
    }

    /// Opens a new epoch. Collective: every rank must call this in the
    /// same order, so that the presence reduction can complete and state
    /// is allocated everywhere before counters reference it.
    pub fn new_epoch(&mut self) -> Epoch {
        let epoch = self.term.cur_epoch;
        self.term.cur_epoch += 1;
        self.propagate_new_epoch(epoch);
        epoch
    }

    fn propagate_new_epoch(&mut self, epoch: Epoch) {
        // Allocate state now so produce/consume can reference it.
        let _ = self.term.state_for(epoch);

        let tree = self.term.tree;
        let reports = {
            let r = self.term.ready_reports.entry(epoch).or_insert(0);
            *r += 1;
            *r
        };
        if reports < tree.num_children + 1 {
            return;
        }
        self.term.ready_reports.remove(&epoch);

        let han_up = self.sys.term_new_epoch;
        let han_ready = self.sys.term_ready_epoch;
        if !tree.is_root {
            self.send_term_record(tree.parent, han_up, &TermMsg { epoch });
        } else {
            self.broadcast_term_record(han_ready, &TermMsg { epoch });
            self.ready_new_epoch(epoch);
        }
    }

    fn ready_new_epoch(&mut self, epoch: Epoch) {
        let _ = self.term.state_for(epoch);
        if self.term.first_resolved == NO_EPOCH {
            self.term.first_resolved = epoch;
            self.term.last_resolved = epoch;
        } else {
            self.term.last_resolved = self.term.last_resolved.max(epoch);
        }
    }

    /// Runs a wave step for every state armed to propagate. Called from
    /// the scheduler loop.
    pub(crate) fn maybe_propagate(&mut self) {
        if self.term.any_epoch.propagate {
            self.propagate_epoch(ANY_EPOCH);
        }
        let armed: Vec<Epoch> = self
            .term
            .epochs
            .iter()
            .filter(|(_, s)| s.propagate)
            .map(|(e, _)| *e)
            .collect();
        for epoch in armed {
            self.propagate_epoch(epoch);
        }
    }

    fn propagate_epoch(&mut self, epoch: Epoch) -> bool {
        let tree = self.term.tree;
        let st = self.term.state_for(epoch);
        if !st.propagate {
            return false;
        }
        let is_ready = st.recv_event_count == tree.num_children + 1;
        if !is_ready {
            return false;
        }

        st.g_prod1 += st.l_prod;
        st.g_cons1 += st.l_cons;

        if !tree.is_root {
            let (prod, cons) = (st.g_prod1, st.g_cons1);
            st.g_prod1 = 0;
            st.g_cons1 = 0;
            st.recv_event_count = 1;
            st.propagate = false;

            let han = self.sys.term_counter;
            self.send_term_record(
                tree.parent,
                han,
                &TermCounterMsg { epoch, prod, cons },
            );
            self.trace.record(RtEvent::WaveUp { epoch });
        } else {
            let detected = st.g_prod1 == st.g_cons1
                && st.g_prod2 == st.g_cons2
                && st.g_prod1 == st.g_prod2;

            if detected {
                st.g_prod1 = 0;
                st.g_cons1 = 0;
                st.recv_event_count = 1;
                st.propagate = false;

                let han = self.sys.term_epoch_finished;
                self.broadcast_term_record(han, &TermMsg { epoch });
                self.epoch_finished(epoch);
            } else {
                st.g_prod2 = st.g_prod1;
                st.g_cons2 = st.g_cons1;
                st.g_prod1 = 0;
                st.g_cons1 = 0;
                st.recv_event_count = 1;
                st.propagate = true;

                let han = self.sys.term_epoch_continue;
                self.broadcast_term_record(han, &TermMsg { epoch });
                self.trace.record(RtEvent::EpochContinued { epoch });
            }
        }
        true
    }

    /// Folds a child's wave report into our first-generation sums.
    fn propagate_epoch_external(
        &mut self,
        epoch: Epoch,
        prod: TermCounter,
        cons: TermCounter,
    ) {
        let armed = {
            let st = self.term.state_for(epoch);
            st.g_prod1 += prod;
            st.g_cons1 += cons;
            st.recv_event_count += 1;
            st.propagate
        };
        if armed {
            self.propagate_epoch(epoch);
        }
    }

    fn epoch_continue(&mut self, epoch: Epoch) {
        self.term.state_for(epoch).propagate = true;
        // Re-armed wave steps run at minimum priority, behind user work.
        self.sched_enqueue_prio(
            abi::SYS_MIN_PRIORITY,
            Box::new(|rt| rt.maybe_propagate()),
        );
    }

    pub(crate) fn epoch_finished(&mut self, epoch: Epoch) {
        if !self.term.finished.insert(epoch) {
            // Detection is at-most-once per epoch.
            return;
        }
        self.trace.record(RtEvent::EpochFinished { epoch });

        if epoch == ANY_EPOCH {
            // Global quiescence: every named epoch is also done.
            let named: Vec<Epoch> =
                self.term.epoch_actions.keys().copied().collect();
            for e in named {
                self.trigger_epoch_actions(e);
            }
            let actions = std::mem::take(&mut self.term.global_actions);
            for action in actions {
                action(self);
            }
            self.term.terminated = true;
        } else {
            self.trigger_epoch_actions(epoch);
            if self.term.first_resolved == epoch {
                // Close the epoch window from below.
                self.term.first_resolved += 1;
                while self.term.finished.contains(&self.term.first_resolved) {
                    self.term.first_resolved += 1;
                }
            }
        }
    }

    fn trigger_epoch_actions(&mut self, epoch: Epoch) {
        if let Some(actions) = self.term.epoch_actions.remove(&epoch) {
            for action in actions {
                action(self);
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
pub(crate) struct TermMsg {
    pub epoch: Epoch,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct TermCounterMsg {
    pub epoch: Epoch,
    pub prod: TermCounter,
    pub cons: TermCounter,
}

pub(crate) fn term_counter_handler(rt: &mut Runtime, msg: Message) {
    let m: TermCounterMsg = msg.decode();
    rt.propagate_epoch_external(m.epoch, m.prod, m.cons);
}

pub(crate) fn new_epoch_handler(rt: &mut Runtime, msg: Message) {
    let m: TermMsg = msg.decode();
    rt.propagate_new_epoch(m.epoch);
}

pub(crate) fn ready_epoch_handler(rt: &mut Runtime, msg: Message) {
    let m: TermMsg = msg.decode();
    rt.ready_new_epoch(m.epoch);
}

pub(crate) fn epoch_finished_handler(rt: &mut Runtime, msg: Message) {
    let m: TermMsg = msg.decode();
    rt.epoch_finished(m.epoch);
}

pub(crate) fn epoch_continue_handler(rt: &mut Runtime, msg: Message) {
    let m: TermMsg = msg.decode();
    rt.epoch_continue(m.epoch);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_shape_five_ranks() {
        let t0 = TermTree::for_rank(0, 5);
        assert!(t0.is_root);
        assert_eq!(t0.num_children, 2);

        let t1 = TermTree::for_rank(1, 5);
        assert_eq!(t1.parent, 0);
        assert_eq!(t1.num_children, 2); // 3 and 4

        let t2 = TermTree::for_rank(2, 5);
        assert_eq!(t2.parent, 0);
        assert_eq!(t2.num_children, 0); // 5 and 6 out of range

        let t4 = TermTree::for_rank(4, 5);
        assert_eq!(t4.parent, 1);
        assert_eq!(t4.num_children, 0);
    }

    #[test]
    fn tree_single_rank_is_lone_root() {
        let t = TermTree::for_rank(0, 1);
        assert!(t.is_root);
        assert_eq!(t.num_children, 0);
    }
}
