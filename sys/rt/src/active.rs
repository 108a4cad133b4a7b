// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Active messenger: envelope setup, direct send, spanning-tree broadcast,
//! receive probe, and dispatch.
//!
//! Every send stamps the envelope with the current epoch (the top of the
//! epoch stack) and accounts one `produce` at the detector; every
//! non-termination receive accounts one `consume`. Termination-protocol
//! messages are flagged `IS_TERM` and bypass both the detector and the
//! epoch stack.
//!
//! Broadcasts use a k=2 spanning tree in origin-relative rank space: with
//! root `r`, rank `n` forwards to relative children `rel*2+1` and
//! `rel*2+2` (where `rel = (n - r) mod size`), mapped back to absolute
//! ranks mod `size`. Each forwarded copy is accounted at the detector
//! exactly once; the returned event is a parent over the per-link
//! transport events, or `EventId::NONE` when both children are out of
//! range.

use crate::event::Action;
use crate::message::Message;
use crate::trace::RtEvent;
use crate::Runtime;
use abi::{
    Envelope, EnvelopeFlags, Epoch, EventId, HandlerId, NodeId, Tag, NO_EPOCH,
    NO_NODE, NO_TAG,
};
use serde::Serialize;
use std::rc::Rc;

impl Runtime {
    /// Epoch that sends are currently stamped with.
    pub fn current_epoch(&self) -> Epoch {
        self.epoch_stack.last().copied().unwrap_or(NO_EPOCH)
    }

    /// Pushes an epoch scope; sends made until the matching pop carry it.
    pub fn push_epoch(&mut self, epoch: Epoch) {
        self.epoch_stack.push(epoch);
    }

    pub fn pop_epoch(&mut self, epoch: Epoch) {
        let top = self.epoch_stack.pop();
        require!(
            top == Some(epoch),
            "unbalanced epoch stack",
            expected = epoch,
            found = top,
        );
    }

    /// Runs `f` with sends stamped to `epoch`.
    pub fn with_epoch<R>(
        &mut self,
        epoch: Epoch,
        f: impl FnOnce(&mut Runtime) -> R,
    ) -> R {
        self.push_epoch(epoch);
        let r = f(self);
        self.pop_epoch(epoch);
        r
    }

    fn make_envelope(&self, dest: NodeId, han: HandlerId, tag: Tag) -> Envelope {
        Envelope::new(dest, han, self.current_epoch(), tag)
    }

    /// Core transmission: accounts the detector, hands the buffer to the
    /// transport, and wraps the request in a transport event.
    pub(crate) fn post(&mut self, msg: Message) -> EventId {
        let env = msg.envelope();
        let dest = env.dest;
        let num_nodes = self.num_nodes();
        require!(
            dest >= 0 && dest < num_nodes,
            "send destination out of range",
            dest = dest,
            num_nodes = num_nodes,
        );

        if !env.is_term() {
            self.produce(env.epoch);
        }

        let req = crate::fail::transport_ok(
            self.transport.isend(dest, 0, msg.as_bytes()),
            "isend",
        );
        // The transport may still be reading the buffer; the event keeps it
        // alive until the request tests complete.
        let payload: Rc<[u8]> = msg.as_bytes().into();
        let event = self.events.create_transport_event(req, Some(payload));

        self.trace.record(RtEvent::MsgSent {
            dest,
            handler: env.handler_id().0,
        });
        event
    }

    /// Sends raw payload bytes to `han` on `dest`. Returns an event that
    /// becomes ready at local completion of this transmission.
    pub fn send_bytes(
        &mut self,
        dest: NodeId,
        han: HandlerId,
        payload: &[u8],
    ) -> EventId {
        let env = self.make_envelope(dest, han, NO_TAG);
        let msg = Message::from_parts(env, payload, &mut self.pool);
        self.post(msg)
    }

    /// Sends raw payload bytes with a logical tag.
    pub fn send_bytes_tagged(
        &mut self,
        dest: NodeId,
        han: HandlerId,
        tag: Tag,
        payload: &[u8],
    ) -> EventId {
        let env = self.make_envelope(dest, han, tag);
        let msg = Message::from_parts(env, payload, &mut self.pool);
        self.post(msg)
    }

    /// Sends an encoded record.
    pub fn send_record<T: Serialize>(
        &mut self,
        dest: NodeId,
        han: HandlerId,
        record: &T,
    ) -> EventId {
        let env = self.make_envelope(dest, han, NO_TAG);
        let msg = Message::from_record(env, record, &[], &mut self.pool);
        self.post(msg)
    }

    /// Sends an encoded record followed by raw trailing bytes.
    pub fn send_record_with_bytes<T: Serialize>(
        &mut self,
        dest: NodeId,
        han: HandlerId,
        record: &T,
        trailing: &[u8],
    ) -> EventId {
        let env = self.make_envelope(dest, han, NO_TAG);
        let msg = Message::from_record(env, record, trailing, &mut self.pool);
        self.post(msg)
    }

    /// Sends an encoded record and runs `next` once the transmission
    /// locally completes.
    pub fn send_record_then<T: Serialize>(
        &mut self,
        dest: NodeId,
        han: HandlerId,
        record: &T,
        next: Action,
    ) -> EventId {
        let event = self.send_record(dest, han, record);
        self.attach_event_action(event, next);
        event
    }

    /// Termination-protocol send: flagged `IS_TERM`, no epoch, no detector
    /// accounting.
    pub(crate) fn send_term_record<T: Serialize>(
        &mut self,
        dest: NodeId,
        han: HandlerId,
        record: &T,
    ) -> EventId {
        let mut env = Envelope::new(dest, han, NO_EPOCH, NO_TAG);
        env.set_flag(EnvelopeFlags::IS_TERM);
        let msg = Message::from_record(env, record, &[], &mut self.pool);
        self.post(msg)
    }

    /// Broadcasts raw payload bytes to every rank. The handler runs once on
    /// every rank, including this one (self-delivery). The returned event
    /// aggregates the per-link transmissions of the first hop.
    pub fn broadcast_bytes(&mut self, han: HandlerId, payload: &[u8]) -> EventId {
        let mut env = self.make_envelope(NO_NODE, han, NO_TAG);
        env.set_flag(EnvelopeFlags::IS_BCAST);
        env.set_flag(EnvelopeFlags::DELIVER_TO_SENDER);
        env.broadcast_root = self.node();
        let msg = Message::from_parts(env, payload, &mut self.pool);
        self.broadcast_msg(msg)
    }

    /// Broadcasts an encoded record; see [`Runtime::broadcast_bytes`].
    pub fn broadcast_record<T: Serialize>(
        &mut self,
        han: HandlerId,
        record: &T,
    ) -> EventId {
        let mut env = self.make_envelope(NO_NODE, han, NO_TAG);
        env.set_flag(EnvelopeFlags::IS_BCAST);
        env.set_flag(EnvelopeFlags::DELIVER_TO_SENDER);
        env.broadcast_root = self.node();
        let msg = Message::from_record(env, record, &[], &mut self.pool);
        self.broadcast_msg(msg)
    }

    /// Termination-protocol broadcast: reaches every *other* rank (the
    /// caller acts directly rather than through self-delivery).
    pub(crate) fn broadcast_term_record<T: Serialize>(
        &mut self,
        han: HandlerId,
        record: &T,
    ) -> EventId {
        let mut env = Envelope::new(NO_NODE, han, NO_EPOCH, NO_TAG);
        env.set_flag(EnvelopeFlags::IS_BCAST);
        env.set_flag(EnvelopeFlags::IS_TERM);
        env.broadcast_root = self.node();
        let msg = Message::from_record(env, record, &[], &mut self.pool);
        self.broadcast_msg(msg)
    }

    fn broadcast_msg(&mut self, msg: Message) -> EventId {
        let env = msg.envelope();
        let event = self.forward_broadcast(&msg);

        if env.get_flags().contains(EnvelopeFlags::DELIVER_TO_SENDER) {
            self.dispatch(msg, false);
        } else {
            msg.release(&mut self.pool);
        }
        event
    }

    /// Sends `msg` to this rank's children in the broadcast tree rooted at
    /// `msg.broadcast_root`. Returns a parent event over the per-link
    /// sends, or `EventId::NONE` if both children are out of range.
    fn forward_broadcast(&mut self, msg: &Message) -> EventId {
        let env = msg.envelope();
        let root = env.broadcast_root;
        require!(
            root != NO_NODE,
            "broadcast without a root",
            handler = env.handler_id(),
        );

        let size = self.num_nodes();
        let rel = (self.node() - root).rem_euclid(size);
        let mut targets = [None, None];
        for (i, child) in [rel * 2 + 1, rel * 2 + 2].into_iter().enumerate() {
            if child < size {
                targets[i] = Some((child + root).rem_euclid(size));
            }
        }

        if targets == [None, None] {
            return EventId::NONE;
        }

        let parent = self.events.create_parent_event();
        let mut n = 0u8;
        for dest in targets.into_iter().flatten() {
            let mut env = env;
            env.dest = dest;
            let link =
                Message::from_parts(env, msg.payload(), &mut self.pool);
            let link_event = self.post(link);
            self.events.add_child(parent, link_event);
            n += 1;
        }
        self.trace.record(RtEvent::BcastForwarded { children: n });
        parent
    }

    /// Probes for one incoming message and dispatches it. Returns true if
    /// a message was processed.
    pub fn try_process_incoming_message(&mut self) -> bool {
        let probe = crate::fail::transport_ok(self.transport.iprobe(), "iprobe");
        let Some(probe) = probe else { return false };

        // Allocate exactly the probed length. The count is a usize end to
        // end; message size is not limited by a narrow count type.
        let mut buf = vec![0u8; probe.bytes];
        crate::fail::transport_ok(
            self.transport.recv(probe.source, probe.tag, &mut buf),
            "recv",
        );

        self.dispatch(Message::from_wire(buf), true);
        true
    }

    /// Invokes the registered handler for `msg`, forwarding broadcast
    /// copies and accounting the detector.
    ///
    /// `consume` is false for local self-delivery, which never traversed
    /// the transport and so was never produced.
    fn dispatch(&mut self, msg: Message, consume: bool) {
        let env = msg.envelope();
        let han = env.handler_id();
        let is_term = env.is_term();
        let epoch = env.epoch;

        // Unknown handler id is fatal inside.
        let f = self.registry.get(han);

        // Forwarding does not depend on the handler, and the handler
        // consumes the message, so grow the tree first.
        if env.is_bcast() && consume {
            self.forward_broadcast(&msg);
        }

        self.trace.record(RtEvent::MsgDelivered {
            handler: han.0,
            is_term,
        });

        if is_term {
            // Fast path: no epoch stack, no detector.
            f(self, msg);
            return;
        }

        self.push_epoch(epoch);
        f(self, msg);
        self.pop_epoch(epoch);

        if consume {
            self.consume(epoch);
        }
    }
}
