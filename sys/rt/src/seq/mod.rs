// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequencer: orders user tasks as a tree of sequenced and parallel
//! closures with wait/trigger matching on message patterns.
//!
//! One sequencer instance owns the whole sequence-id space. Sequences are
//! built with [`Runtime::sequenced`] (append a step), [`Runtime::seq_wait`]
//! (block the current step until a matching message arrives), and
//! [`Runtime::seq_parallel`] (fork branches joined by a counter).
//!
//! This is the fibers-disabled execution model: a waiting step simply
//! returns with its node marked blocked, and progress resumes when a
//! matching arrival drives [`node::activate`]. Waits therefore belong in
//! sequenced closures, not inside wait triggers.

pub(crate) mod matcher;
pub(crate) mod node;

use crate::message::Message;
use crate::trace::RtEvent;
use crate::Runtime;
use abi::{HandlerId, SeqId, Tag, ANY_EPOCH};
use matcher::{MatchState, SeqAction};
use node::{NodeRef, SeqNode};
use std::collections::HashMap;
use std::rc::Rc;

pub struct Sequencer {
    next_seq_id: SeqId,
    roots: HashMap<SeqId, NodeRef>,
    /// Stack of `(seq, node)` execution contexts.
    pub(crate) context: Vec<(SeqId, NodeRef)>,
    /// Most recent node seen per sequence, for re-entry.
    pub(crate) node_lookup: HashMap<SeqId, NodeRef>,
    pub(crate) matchers: HashMap<u16, MatchState>,
}

impl Sequencer {
    pub(crate) fn new() -> Self {
        Self {
            next_seq_id: 0,
            roots: HashMap::new(),
            context: Vec::new(),
            node_lookup: HashMap::new(),
            matchers: HashMap::new(),
        }
    }
}

impl Runtime {
    /// Registers a trigger slot: a handler id that feeds arrivals into
    /// the sequencer's matcher. Collective, like any registration.
    pub fn register_seq_trigger(&mut self) -> HandlerId {
        self.register_handler(sequence_msg_handler)
    }

    /// Creates a new, empty sequence.
    pub fn next_seq(&mut self) -> SeqId {
        let id = self.seq.next_seq_id;
        self.seq.next_seq_id += 1;
        self.seq.roots.insert(id, SeqNode::new_parent(id));
        id
    }

    /// Appends a step to `seq_id`. From inside the sequence's own
    /// context this nests under the current node; from outside it
    /// appends a new top-level step and schedules expansion.
    pub fn sequenced(
        &mut self,
        seq_id: SeqId,
        f: impl FnOnce(&mut Runtime) + 'static,
    ) {
        if let Some((ctx_id, ctx_node)) = self.seq.context.last() {
            if *ctx_id == seq_id {
                let ctx_node = Rc::clone(ctx_node);
                ctx_node.borrow_mut().closures.push_back(Box::new(f));
                if !ctx_node.borrow().blocked {
                    node::execute_closures_until_blocked(self, &ctx_node);
                }
                return;
            }
        }

        let root = self.seq_root(seq_id);
        let leaf = SeqNode::new_leaf(seq_id, Box::new(f));
        node::add_child(&root, leaf);
        self.enqueue_seq_expansion(seq_id);
    }

    /// Forks `branches` as a parallel step of `seq_id`: each branch runs
    /// as a deferred unit, and the step completes when all have joined.
    pub fn seq_parallel(
        &mut self,
        seq_id: SeqId,
        branches: Vec<Box<dyn FnOnce(&mut Runtime)>>,
    ) {
        let par = SeqNode::new_parallel(seq_id, branches);

        if let Some((ctx_id, ctx_node)) = self.seq.context.last() {
            if *ctx_id == seq_id {
                let ctx_node = Rc::clone(ctx_node);
                par.borrow_mut().parent = Some(Rc::downgrade(&ctx_node));
                ctx_node.borrow_mut().closures.push_back(Box::new(
                    move |rt| {
                        if node::expand_next(rt, &par)
                            == node::ExpandResult::Waiting
                        {
                            if let Some(parent) = par
                                .borrow()
                                .parent
                                .as_ref()
                                .and_then(|w| w.upgrade())
                            {
                                parent.borrow_mut().blocked = true;
                            }
                        }
                    },
                ));
                if !ctx_node.borrow().blocked {
                    node::execute_closures_until_blocked(self, &ctx_node);
                }
                return;
            }
        }

        let root = self.seq_root(seq_id);
        node::add_child(&root, par);
        self.enqueue_seq_expansion(seq_id);
    }

    /// Blocks the current sequence step until a message for `han`
    /// matching `tag` arrives, then runs `trigger` with it. Must be
    /// called from within a sequence context.
    pub fn seq_wait(
        &mut self,
        han: HandlerId,
        tag: Tag,
        trigger: impl FnOnce(&mut Runtime, Message) + 'static,
    ) {
        let Some((seq_id, node)) = self.seq.context.last().cloned() else {
            crate::fail::die("wait outside of any sequence context");
        };

        // Keep the epoch open across the wait window.
        self.produce(ANY_EPOCH);

        let deferred = make_deferred_wait(
            seq_id,
            Rc::clone(&node),
            han,
            tag,
            Box::new(trigger),
        );

        if !node.borrow().blocked {
            deferred(self);
        } else {
            node.borrow_mut().closures.push_back(deferred);
        }
    }

    /// True when `seq_id` has nothing queued, nothing blocked, and no
    /// outstanding waits: no more expansions are possible.
    pub fn seq_done(&self, seq_id: SeqId) -> bool {
        let Some(root) = self.seq.roots.get(&seq_id) else {
            return false;
        };
        let root = root.borrow();
        let root_idle = !root.blocked && root.closures.is_empty();
        let no_children = match &root.kind {
            node::NodeKind::Parent { children } => children.is_empty(),
            _ => false,
        };
        let no_waits = !self
            .seq
            .matchers
            .values()
            .any(|m| m.has_action_for_seq(seq_id));
        let leaf_idle = self
            .seq
            .node_lookup
            .get(&seq_id)
            .map(|n| !n.borrow().blocked)
            .unwrap_or(true);
        root_idle && no_children && no_waits && leaf_idle
    }

    fn seq_root(&mut self, seq_id: SeqId) -> NodeRef {
        match self.seq.roots.get(&seq_id) {
            Some(r) => Rc::clone(r),
            None => crate::fail::die(format_args!(
                "unknown sequence id {seq_id}"
            )),
        }
    }

    fn enqueue_seq_expansion(&mut self, seq_id: SeqId) {
        self.sched_enqueue(Box::new(move |rt| {
            let root = rt.seq.roots.get(&seq_id).map(Rc::clone);
            if let Some(root) = root {
                if !root.borrow().blocked {
                    node::expand_next(rt, &root);
                }
            }
        }));
    }
}

fn make_deferred_wait(
    seq_id: SeqId,
    node: NodeRef,
    han: HandlerId,
    tag: Tag,
    trigger: Box<dyn FnOnce(&mut Runtime, Message)>,
) -> node::SeqClosure {
    Box::new(move |rt| {
        let buffered = rt
            .seq
            .matchers
            .entry(han.0)
            .or_default()
            .take_msg(tag);

        match buffered {
            Some(bytes) => {
                // The message got here first; the wait runs immediately.
                rt.trace.record(RtEvent::SeqMatched { tag });
                let msg = Message::from_wire(bytes);
                trigger(rt, msg);
                rt.consume(ANY_EPOCH);
                node.borrow_mut().blocked = false;
            }
            None => {
                rt.trace.record(RtEvent::SeqWaitBuffered { tag });
                node.borrow_mut().blocked = true;
                rt.seq.matchers.entry(han.0).or_default().buffer_action(
                    tag,
                    SeqAction {
                        seq_id,
                        node: Rc::clone(&node),
                        trigger,
                    },
                );
            }
        }
    })
}

/// Active handler behind every trigger slot: pairs the arrival with a
/// buffered wait, or buffers the arrival.
pub(crate) fn sequence_msg_handler(rt: &mut Runtime, msg: Message) {
    let env = msg.envelope();
    let han = env.handler_id();
    let tag = env.tag;

    let action = rt
        .seq
        .matchers
        .entry(han.0)
        .or_default()
        .take_action(tag);

    match action {
        Some(a) => {
            rt.trace.record(RtEvent::SeqMatched { tag });
            let bytes = msg.as_bytes().to_vec();
            rt.sched_enqueue(Box::new(move |rt| {
                let m = Message::from_wire(bytes);
                let SeqAction { node, trigger, .. } = a;
                node::execute_in_node(
                    rt,
                    &node,
                    Box::new(move |rt| trigger(rt, m)),
                );
                rt.consume(ANY_EPOCH);
                node.borrow_mut().blocked = false;
                node::activate(rt, &node);
            }));
        }
        None => {
            rt.trace.record(RtEvent::SeqWaitBuffered { tag });
            rt.seq
                .matchers
                .entry(han.0)
                .or_default()
                .buffer_msg(tag, msg.as_bytes().to_vec());
        }
    }
}
