// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pipes and callbacks.
//!
//! A *pipe* is a process-addressable sink: a closure registered on its
//! owning rank under a [`PipeId`]. A *callback* is a small value type
//! describing where a trigger should land -- a pipe, a handler on a rank,
//! a broadcast, an entity, or an objgroup member. Callbacks carry only
//! ids and destination hints, so they serialize and ship across ranks;
//! triggering a deserialized callback reaches the same sink.
//!
//! Pipes come in one-shot and persistent flavors. A one-shot pipe is
//! deregistered before its closure runs; triggering it again is a
//! contract violation on the owning rank.

use crate::message::Message;
use crate::trace::RtEvent;
use crate::Runtime;
use abi::{
    EntityId, Envelope, EnvelopeFlags, HandlerId, NodeId, PipeId, NO_TAG,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;

/// Where a callback trigger lands.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Callback {
    /// An anonymous closure registered on the pipe's owning rank.
    Anon { pipe: PipeId },
    /// Invoke `han` on `dest`.
    Send { han: HandlerId, dest: NodeId },
    /// Invoke `han` on every rank.
    Bcast { han: HandlerId },
    /// Route to a migratable entity, delivered through `han`.
    EntitySend {
        id: EntityId,
        home: NodeId,
        han: HandlerId,
    },
    /// Invoke the objgroup dispatcher `han` on its member at `dest`.
    ObjGroupSend { han: HandlerId, dest: NodeId },
    /// Invoke the objgroup dispatcher `han` on every member.
    ObjGroupBcast { han: HandlerId },
}

struct PipeEntry {
    action: Rc<dyn Fn(&mut Runtime, &[u8])>,
    persistent: bool,
}

pub struct PipeManager {
    next_seq: u64,
    local: HashMap<PipeId, PipeEntry>,
}

impl PipeManager {
    pub(crate) fn new() -> Self {
        Self {
            next_seq: 0,
            local: HashMap::new(),
        }
    }

    /// Number of live local pipes (teardown/test visibility).
    pub fn live_pipes(&self) -> usize {
        self.local.len()
    }
}

impl Runtime {
    /// Registers an anonymous callback. One-shot unless `persistent`.
    pub fn make_callback_anon(
        &mut self,
        persistent: bool,
        action: impl Fn(&mut Runtime, &[u8]) + 'static,
    ) -> Callback {
        let pipe = PipeId::for_node_and_seq(self.node(), self.pipes.next_seq);
        self.pipes.next_seq += 1;
        self.pipes.local.insert(
            pipe,
            PipeEntry {
                action: Rc::new(action),
                persistent,
            },
        );
        Callback::Anon { pipe }
    }

    pub fn make_callback_send(&self, han: HandlerId, dest: NodeId) -> Callback {
        Callback::Send { han, dest }
    }

    pub fn make_callback_bcast(&self, han: HandlerId) -> Callback {
        Callback::Bcast { han }
    }

    /// Fires `cb` with `payload`. Serializes the appropriate
    /// active-message invocation for remote sinks.
    pub fn trigger_callback(&mut self, cb: Callback, payload: &[u8]) {
        match cb {
            Callback::Anon { pipe } => {
                if pipe.owning_node() == self.node() {
                    self.run_local_pipe(pipe, payload);
                } else {
                    let mut env = Envelope::new(
                        pipe.owning_node(),
                        self.sys.pipe_trigger,
                        self.current_epoch(),
                        NO_TAG,
                    );
                    env.set_flag(EnvelopeFlags::IS_PIPE);
                    env.group = pipe.0;
                    let msg = Message::from_parts(env, payload, &mut self.pool);
                    self.post(msg);
                    self.trace.record(RtEvent::PipeTriggered { local: false });
                }
            }
            Callback::Send { han, dest }
            | Callback::ObjGroupSend { han, dest } => {
                self.send_bytes(dest, han, payload);
            }
            Callback::Bcast { han } | Callback::ObjGroupBcast { han } => {
                self.broadcast_bytes(han, payload);
            }
            Callback::EntitySend { id, home, han } => {
                self.route_msg_to_handler(id, home, han, payload);
            }
        }
    }

    /// Fires `cb` with no payload.
    pub fn trigger_callback_void(&mut self, cb: Callback) {
        self.trigger_callback(cb, &[]);
    }

    fn run_local_pipe(&mut self, pipe: PipeId, payload: &[u8]) {
        let (action, persistent) = match self.pipes.local.get(&pipe) {
            Some(e) => (Rc::clone(&e.action), e.persistent),
            None => crate::fail::die(format_args!(
                "trigger on dead pipe {pipe:?} (one-shot already fired?)"
            )),
        };
        if !persistent {
            self.pipes.local.remove(&pipe);
        }
        self.trace.record(RtEvent::PipeTriggered { local: true });
        action(self, payload);
    }
}

pub(crate) fn pipe_trigger_handler(rt: &mut Runtime, msg: Message) {
    let env = msg.envelope();
    require!(env.is_pipe(), "pipe handler on a non-pipe message");
    let pipe = env.pipe_id();
    require!(
        pipe.owning_node() == rt.node(),
        "pipe message routed to non-owner",
        pipe = pipe,
    );
    rt.run_local_pipe(pipe, msg.payload());
}
