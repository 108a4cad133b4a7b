// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequence nodes: positions in an ordered execution tree.
//!
//! A node is a *leaf* (ordered closures), a *parent* (ordered children),
//! or a *parallel* (branches with a join counter). A node is blocked iff
//! it has an unsatisfied wait; a parent only advances to its next child
//! when the current child reports no more expansions or is waiting.
//! Expansion never runs past a block: progress resumes through
//! [`activate`] when a matching message unblocks the node.

use crate::Runtime;
use abi::{SeqId, ANY_EPOCH};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

pub(crate) type NodeRef = Rc<RefCell<SeqNode>>;
pub(crate) type SeqClosure = Box<dyn FnOnce(&mut Runtime)>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ExpandResult {
    KeepExpanding,
    Waiting,
}

pub(crate) enum NodeKind {
    Leaf {
        funcs: VecDeque<SeqClosure>,
    },
    Parent {
        children: VecDeque<NodeRef>,
    },
    Parallel {
        branches: Vec<SeqClosure>,
        total: u32,
        joined: u32,
        launched: bool,
    },
}

pub(crate) struct SeqNode {
    pub seq_id: SeqId,
    pub kind: NodeKind,
    /// Closures deferred onto this node while it was executing or
    /// blocked (waits queued behind waits).
    pub closures: VecDeque<SeqClosure>,
    pub blocked: bool,
    pub parent: Option<Weak<RefCell<SeqNode>>>,
}

impl SeqNode {
    pub fn new_parent(seq_id: SeqId) -> NodeRef {
        Rc::new(RefCell::new(SeqNode {
            seq_id,
            kind: NodeKind::Parent {
                children: VecDeque::new(),
            },
            closures: VecDeque::new(),
            blocked: false,
            parent: None,
        }))
    }

    pub fn new_leaf(seq_id: SeqId, f: SeqClosure) -> NodeRef {
        let mut funcs = VecDeque::new();
        funcs.push_back(f);
        Rc::new(RefCell::new(SeqNode {
            seq_id,
            kind: NodeKind::Leaf { funcs },
            closures: VecDeque::new(),
            blocked: false,
            parent: None,
        }))
    }

    pub fn new_parallel(seq_id: SeqId, branches: Vec<SeqClosure>) -> NodeRef {
        let total = branches.len() as u32;
        Rc::new(RefCell::new(SeqNode {
            seq_id,
            kind: NodeKind::Parallel {
                branches,
                total,
                joined: 0,
                launched: false,
            },
            closures: VecDeque::new(),
            blocked: false,
            parent: None,
        }))
    }

    fn has_unexpanded(&self) -> bool {
        match &self.kind {
            NodeKind::Leaf { funcs } => !funcs.is_empty(),
            NodeKind::Parent { children } => !children.is_empty(),
            NodeKind::Parallel { launched, .. } => !launched,
        }
    }
}

/// Links `child` under `parent` and appends it to the child list.
pub(crate) fn add_child(parent: &NodeRef, child: NodeRef) {
    child.borrow_mut().parent = Some(Rc::downgrade(parent));
    match &mut parent.borrow_mut().kind {
        NodeKind::Parent { children } => children.push_back(child),
        _ => crate::fail::die("adding a child to a non-parent sequence node"),
    }
}

/// Runs `f` with `(seq_id, node)` as the current sequence context.
/// Returns whether the node ended blocked.
pub(crate) fn execute_in_node(
    rt: &mut Runtime,
    node: &NodeRef,
    f: SeqClosure,
) -> bool {
    let seq_id = node.borrow().seq_id;
    rt.seq.context.push((seq_id, Rc::clone(node)));
    rt.seq.node_lookup.insert(seq_id, Rc::clone(node));
    f(rt);
    rt.seq.context.pop();
    node.borrow().blocked
}

/// Walks the node one step: leaves pop-and-execute closures until one
/// blocks or the queue is empty; parents expand the current child until
/// it yields; parallels launch their branches as deferred units and
/// block on the join.
pub(crate) fn expand_next(rt: &mut Runtime, node: &NodeRef) -> ExpandResult {
    enum Tag {
        Leaf,
        Parent,
        Parallel,
    }
    let tag = match &node.borrow().kind {
        NodeKind::Leaf { .. } => Tag::Leaf,
        NodeKind::Parent { .. } => Tag::Parent,
        NodeKind::Parallel { .. } => Tag::Parallel,
    };
    match tag {
        Tag::Leaf => expand_leaf(rt, node),
        Tag::Parent => expand_parent(rt, node),
        Tag::Parallel => expand_parallel(rt, node),
    }
}

fn expand_leaf(rt: &mut Runtime, node: &NodeRef) -> ExpandResult {
    loop {
        let func = {
            let mut n = node.borrow_mut();
            if n.blocked {
                return ExpandResult::Waiting;
            }
            match &mut n.kind {
                NodeKind::Leaf { funcs } => funcs.pop_front(),
                _ => unreachable!(),
            }
        };
        let Some(f) = func else {
            return ExpandResult::KeepExpanding;
        };
        if execute_in_node(rt, node, f) {
            return ExpandResult::Waiting;
        }
    }
}

fn expand_parent(rt: &mut Runtime, node: &NodeRef) -> ExpandResult {
    loop {
        let child = {
            let mut n = node.borrow_mut();
            match &mut n.kind {
                NodeKind::Parent { children } => children.pop_front(),
                _ => unreachable!(),
            }
        };
        let Some(child) = child else {
            return ExpandResult::KeepExpanding;
        };
        if expand_next(rt, &child) == ExpandResult::Waiting {
            // Do not advance past a waiting child; the child's completion
            // re-activates us.
            node.borrow_mut().blocked = true;
            return ExpandResult::Waiting;
        }
    }
}

fn expand_parallel(rt: &mut Runtime, node: &NodeRef) -> ExpandResult {
    let branches = {
        let mut n = node.borrow_mut();
        match &mut n.kind {
            NodeKind::Parallel {
                branches, launched, ..
            } => {
                *launched = true;
                std::mem::take(branches)
            }
            _ => unreachable!(),
        }
    };

    // Account each deferred branch so termination cannot fire between
    // launch and join.
    rt.produce_units(ANY_EPOCH, branches.len() as i64);
    node.borrow_mut().blocked = true;

    for f in branches {
        let node = Rc::clone(node);
        rt.sched_enqueue(Box::new(move |rt| {
            execute_in_node(rt, &node, f);
            parallel_join(rt, &node);
        }));
    }
    ExpandResult::Waiting
}

/// One branch of a parallel node finished.
pub(crate) fn parallel_join(rt: &mut Runtime, node: &NodeRef) {
    rt.consume_units(ANY_EPOCH, 1);
    let done = {
        let mut n = node.borrow_mut();
        match &mut n.kind {
            NodeKind::Parallel { joined, total, .. } => {
                *joined += 1;
                *joined >= *total
            }
            _ => crate::fail::die("join on a non-parallel sequence node"),
        }
    };
    if done {
        node.borrow_mut().blocked = false;
        activate(rt, node);
    }
}

/// Resumes a node that just became unblocked: drains deferred closures,
/// keeps expanding, and on completion bubbles up to the parent.
pub(crate) fn activate(rt: &mut Runtime, node: &NodeRef) {
    require!(
        !node.borrow().blocked,
        "activating a blocked sequence node",
    );

    loop {
        if node.borrow().blocked {
            return;
        }
        if !node.borrow().closures.is_empty() {
            execute_closures_until_blocked(rt, node);
            continue;
        }
        if node.borrow().has_unexpanded() {
            if expand_next(rt, node) == ExpandResult::Waiting {
                return;
            }
            continue;
        }
        break;
    }

    // Finished; the parent may have more siblings to run.
    let parent = {
        let n = node.borrow();
        n.parent.as_ref().and_then(|w| w.upgrade())
    };
    if let Some(parent) = parent {
        parent.borrow_mut().blocked = false;
        activate(rt, &parent);
    }
}

pub(crate) fn execute_closures_until_blocked(rt: &mut Runtime, node: &NodeRef) {
    loop {
        let c = {
            let mut n = node.borrow_mut();
            if n.blocked {
                return;
            }
            n.closures.pop_front()
        };
        let Some(c) = c else { return };
        c(rt);
        if node.borrow().blocked {
            return;
        }
    }
}
