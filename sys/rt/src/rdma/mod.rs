// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-sided data plane: handle manager, get/put request path, and
//! channels.
//!
//! A registered handle names a byte region on its owning rank (see
//! [`abi::RdmaHandle`] for the packed layout). Remote gets and puts travel
//! as messages: the target resolves the best-matching user function for
//! the request's tag (exact tag, then any-tag, then the default copy
//! handler if the registration enabled it) and ships the bytes back. A
//! request whose tag has no resolution yet is parked and replayed when
//! [`Runtime::process_pending_get`] / [`Runtime::process_pending_put`]
//! fire after a function is associated.
//!
//! Channels bypass the message path entirely with transport-level
//! one-sided transfers; see [`channel`].

pub mod channel;
pub mod group;
pub mod state;

use crate::message::Message;
use crate::trace::RtEvent;
use crate::transport::SharedRegion;
use crate::Runtime;
use abi::{EventId, NodeId, RdmaHandle, RdmaIdentifier, RdmaOp, Tag};
use channel::Channel;
use serde::{Deserialize, Serialize};
use state::{
    GetFn, PendingGet, PendingPut, PutFn, RdmaState, Resolution,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Identifies one channel endpoint on a rank: handle identity, direction,
/// and the peer on the far side.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChannelKey {
    pub ident: RdmaIdentifier,
    pub op: RdmaOp,
    pub peer: NodeId,
}

enum OpCont {
    Get(Box<dyn FnOnce(&mut Runtime, Vec<u8>)>),
    Put(Box<dyn FnOnce(&mut Runtime)>),
}

pub struct RdmaManager {
    next_identifier: RdmaIdentifier,
    next_channel_tag: Tag,
    states: HashMap<RdmaIdentifier, RdmaState>,
    channels: HashMap<ChannelKey, Channel>,
    /// Outstanding remote requests, keyed by their completion event.
    pending_ops: HashMap<EventId, OpCont>,
}

impl RdmaManager {
    pub(crate) fn new() -> Self {
        Self {
            next_identifier: 1,
            next_channel_tag: 1,
            states: HashMap::new(),
            channels: HashMap::new(),
            pending_ops: HashMap::new(),
        }
    }

    fn state(&mut self, handle: RdmaHandle) -> &mut RdmaState {
        let ident = handle.identifier();
        match self.states.get_mut(&ident) {
            Some(s) => s,
            None => crate::fail::die(format_args!(
                "rdma request against unknown handle {handle:?}"
            )),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct GetRequestMsg {
    handle: RdmaHandle,
    tag: Tag,
    num_bytes: u64,
    offset: u64,
    event_back: EventId,
    requesting: NodeId,
}

/// Reply header; the data rides as trailing bytes with a distinct handler,
/// which keeps the data path apart from the request path.
#[derive(Serialize, Deserialize)]
struct GetBackMsg {
    event_back: EventId,
}

#[derive(Serialize, Deserialize)]
struct PutRequestMsg {
    handle: RdmaHandle,
    tag: Tag,
    offset: u64,
    event_back: EventId,
    requesting: NodeId,
}

#[derive(Serialize, Deserialize)]
struct PutBackMsg {
    event_back: EventId,
}

impl Runtime {
    /// Registers a byte region for one-sided access, returning its packed
    /// handle. With `use_default`, requests with no associated function
    /// are satisfied by copying against the region.
    pub fn register_new_rdma_handler(
        &mut self,
        buffer: Vec<u8>,
        use_default: bool,
        collective: bool,
    ) -> RdmaHandle {
        let ident = self.rdma.next_identifier;
        self.rdma.next_identifier += 1;
        let num_bytes = buffer.len();
        let handle = RdmaHandle::for_node_and_identifier(
            self.node(),
            ident,
            num_bytes != 0,
            collective,
        );
        let region: SharedRegion = Arc::new(Mutex::new(buffer));
        self.rdma.states.insert(
            ident,
            RdmaState::new(handle, region, num_bytes, use_default),
        );
        handle
    }

    /// The registered region for a local handle (tests, local access).
    pub fn rdma_region(&mut self, handle: RdmaHandle) -> SharedRegion {
        Arc::clone(&self.rdma.state(handle).region)
    }

    /// Binds `f` to answer gets on `handle` for `tag` (`None` = any tag).
    pub fn associate_get_function(
        &mut self,
        mut handle: RdmaHandle,
        tag: Option<Tag>,
        f: impl Fn(&mut Runtime, usize, usize, Tag) -> Vec<u8> + 'static,
    ) -> RdmaHandle {
        require!(
            handle.node() == self.node(),
            "associating a function on a non-local handle",
            handle = handle,
        );
        let f: GetFn = std::rc::Rc::new(f);
        self.rdma.state(handle).set_get_fn(tag, f);
        handle.set_is_handler(true);
        handle.set_op_type(RdmaOp::Get);
        handle
    }

    /// Binds `f` to apply puts on `handle` for `tag` (`None` = any tag).
    pub fn associate_put_function(
        &mut self,
        mut handle: RdmaHandle,
        tag: Option<Tag>,
        f: impl Fn(&mut Runtime, &[u8], usize, Tag) + 'static,
    ) -> RdmaHandle {
        require!(
            handle.node() == self.node(),
            "associating a function on a non-local handle",
            handle = handle,
        );
        let f: PutFn = std::rc::Rc::new(f);
        self.rdma.state(handle).set_put_fn(tag, f);
        handle.set_is_handler(true);
        handle.set_op_type(RdmaOp::Put);
        handle
    }

    /// Drops function bindings for `op`/`tag`; dropping the untagged
    /// binding also drops the default handler.
    pub fn unregister_rdma_handler(
        &mut self,
        handle: RdmaHandle,
        op: RdmaOp,
        tag: Option<Tag>,
    ) {
        self.rdma.state(handle).unregister(op, tag);
    }

    /// Fetches `num_bytes` at `offset` from `handle`'s region (resolved
    /// through its get functions), invoking `done` with the bytes. A zero
    /// `num_bytes` means "whatever the handler yields" (the whole region
    /// for the default handler).
    pub fn rdma_get(
        &mut self,
        handle: RdmaHandle,
        tag: Tag,
        num_bytes: usize,
        offset: usize,
        done: impl FnOnce(&mut Runtime, Vec<u8>) + 'static,
    ) {
        let target = handle.node();
        if target == self.node() {
            match self.serve_get(handle.identifier(), tag, num_bytes, offset) {
                Some(bytes) => done(self, bytes),
                None => crate::fail::die(format_args!(
                    "local rdma get parked with no remote to replay it; \
                     associate a function for tag {tag} first"
                )),
            }
            return;
        }

        let event_back = self.events.create_normal_event();
        self.rdma
            .pending_ops
            .insert(event_back, OpCont::Get(Box::new(done)));
        let han = self.sys.rdma_get_request;
        let this_node = self.node();
        self.send_record(
            target,
            han,
            &GetRequestMsg {
                handle,
                tag,
                num_bytes: num_bytes as u64,
                offset: offset as u64,
                event_back,
                requesting: this_node,
            },
        );
    }

    /// Stores `data` at `offset` into `handle`'s region (resolved through
    /// its put functions), invoking `done` when the target has applied it.
    pub fn rdma_put(
        &mut self,
        handle: RdmaHandle,
        tag: Tag,
        data: Vec<u8>,
        offset: usize,
        done: impl FnOnce(&mut Runtime) + 'static,
    ) {
        let target = handle.node();
        if target == self.node() {
            let applied = self.serve_put(
                handle.identifier(),
                tag,
                &data,
                offset,
            );
            require!(
                applied,
                "local rdma put parked with no remote to replay it",
                tag = tag,
            );
            done(self);
            return;
        }

        let event_back = self.events.create_normal_event();
        self.rdma
            .pending_ops
            .insert(event_back, OpCont::Put(Box::new(done)));
        let han = self.sys.rdma_put_request;
        let this_node = self.node();
        self.send_record_with_bytes(
            target,
            han,
            &PutRequestMsg {
                handle,
                tag,
                offset: offset as u64,
                event_back,
                requesting: this_node,
            },
            &data,
        );
    }

    /// Target-side get resolution. `None` means the request must park.
    fn serve_get(
        &mut self,
        ident: RdmaIdentifier,
        tag: Tag,
        num_bytes: usize,
        offset: usize,
    ) -> Option<Vec<u8>> {
        let st = match self.rdma.states.get(&ident) {
            Some(s) => s,
            None => crate::fail::die(format_args!(
                "rdma get against unknown identifier {ident}"
            )),
        };
        match st.resolve_get(tag) {
            Resolution::Func(f) => Some(f(self, num_bytes, offset, tag)),
            Resolution::Default => {
                Some(self.rdma.states[&ident].default_get(num_bytes, offset))
            }
            Resolution::Park => None,
        }
    }

    fn serve_put(
        &mut self,
        ident: RdmaIdentifier,
        tag: Tag,
        data: &[u8],
        offset: usize,
    ) -> bool {
        let st = match self.rdma.states.get(&ident) {
            Some(s) => s,
            None => crate::fail::die(format_args!(
                "rdma put against unknown identifier {ident}"
            )),
        };
        match st.resolve_put(tag) {
            Resolution::Func(f) => {
                f(self, data, offset, tag);
                true
            }
            Resolution::Default => {
                self.rdma.states[&ident].default_put(data, offset);
                true
            }
            Resolution::Park => false,
        }
    }

    /// Replays gets parked on `tag` now that a function can serve them.
    pub fn process_pending_get(&mut self, handle: RdmaHandle, tag: Tag) {
        let ident = handle.identifier();
        let parked = self
            .rdma
            .state(handle)
            .pending_tag_gets
            .remove(&tag)
            .unwrap_or_default();
        for req in parked {
            match self.serve_get(ident, req.tag, req.num_bytes, req.offset) {
                Some(bytes) => self.send_get_back(req.requester, req.event_back, &bytes),
                None => {
                    // Still nothing for this tag; park again.
                    self.rdma
                        .state(handle)
                        .pending_tag_gets
                        .entry(tag)
                        .or_default()
                        .push(req);
                }
            }
        }
    }

    /// Replays puts parked on `tag`.
    pub fn process_pending_put(&mut self, handle: RdmaHandle, tag: Tag) {
        let ident = handle.identifier();
        let parked = self
            .rdma
            .state(handle)
            .pending_tag_puts
            .remove(&tag)
            .unwrap_or_default();
        for req in parked {
            if self.serve_put(ident, req.tag, &req.data, req.offset) {
                let han = self.sys.rdma_put_back;
                self.send_record(
                    req.requester,
                    han,
                    &PutBackMsg {
                        event_back: req.event_back,
                    },
                );
            } else {
                self.rdma
                    .state(handle)
                    .pending_tag_puts
                    .entry(tag)
                    .or_default()
                    .push(req);
            }
        }
    }

    fn send_get_back(&mut self, dest: NodeId, event_back: EventId, bytes: &[u8]) {
        let han = self.sys.rdma_get_back;
        self.send_record_with_bytes(dest, han, &GetBackMsg { event_back }, bytes);
    }

    /// Allocates a channel tag nobody else on this rank is using.
    pub fn next_channel_tag(&mut self) -> Tag {
        let tag = self.rdma.next_channel_tag;
        self.rdma.next_channel_tag += 1;
        tag
    }

    /// Collectively creates a channel endpoint; both the target and the
    /// non-target must call with the same arguments. See
    /// [`channel::Channel::create`].
    pub fn setup_channel(
        &mut self,
        handle: RdmaHandle,
        op: RdmaOp,
        non_target: NodeId,
        tag: Tag,
    ) {
        let is_target = handle.node() == self.node();
        let (region, num_bytes) = if is_target {
            let st = self.rdma.state(handle);
            (Some(Arc::clone(&st.region)), st.num_bytes)
        } else {
            (None, 0)
        };
        let chan = Channel::create(
            &mut *self.transport,
            handle,
            op,
            non_target,
            tag,
            region,
            num_bytes,
        );
        let peer = if is_target { non_target } else { handle.node() };
        let key = ChannelKey {
            ident: handle.identifier(),
            op,
            peer,
        };
        require!(
            !self.rdma.channels.contains_key(&key),
            "channel already exists",
            ident = key.ident,
            peer = key.peer,
        );
        self.rdma.channels.insert(key, chan);
    }

    /// Non-target put into the channel's region.
    pub fn channel_write(
        &mut self,
        handle: RdmaHandle,
        data: &[u8],
        offset: usize,
    ) {
        let transport = &mut *self.transport;
        let key = ChannelKey {
            ident: handle.identifier(),
            op: RdmaOp::Put,
            peer: handle.node(),
        };
        let chan = match self.rdma.channels.get_mut(&key) {
            Some(c) => c,
            None => crate::fail::die(format_args!(
                "no put channel for handle {handle:?}"
            )),
        };
        chan.write_data(transport, data, offset);
        self.trace.record(RtEvent::ChannelOp {
            target: handle.node(),
            bytes: data.len() as u32,
        });
    }

    /// Non-target read out of the channel's region.
    pub fn channel_read(
        &mut self,
        handle: RdmaHandle,
        buf: &mut [u8],
        offset: usize,
    ) {
        let transport = &mut *self.transport;
        let key = ChannelKey {
            ident: handle.identifier(),
            op: RdmaOp::Get,
            peer: handle.node(),
        };
        let chan = match self.rdma.channels.get_mut(&key) {
            Some(c) => c,
            None => crate::fail::die(format_args!(
                "no get channel for handle {handle:?}"
            )),
        };
        chan.read_data(transport, buf, offset);
        self.trace.record(RtEvent::ChannelOp {
            target: handle.node(),
            bytes: buf.len() as u32,
        });
    }

    pub fn sync_channel_local(&mut self, handle: RdmaHandle, op: RdmaOp) {
        let transport = &mut *self.transport;
        let key = ChannelKey {
            ident: handle.identifier(),
            op,
            peer: handle.node(),
        };
        match self.rdma.channels.get_mut(&key) {
            Some(c) => c.sync_local(transport),
            None => crate::fail::die(format_args!(
                "sync on a channel that does not exist: {handle:?}"
            )),
        }
    }

    pub fn sync_channel_global(&mut self, handle: RdmaHandle, op: RdmaOp) {
        let transport = &mut *self.transport;
        let key = ChannelKey {
            ident: handle.identifier(),
            op,
            peer: handle.node(),
        };
        match self.rdma.channels.get_mut(&key) {
            Some(c) => c.sync_global(transport),
            None => crate::fail::die(format_args!(
                "sync on a channel that does not exist: {handle:?}"
            )),
        }
    }

    /// Tears down every channel endpoint this rank holds.
    pub(crate) fn teardown_channels(&mut self) {
        let transport = &mut *self.transport;
        for chan in self.rdma.channels.values_mut() {
            chan.teardown(transport);
        }
        self.rdma.channels.clear();
    }
}

pub(crate) fn get_request_handler(rt: &mut Runtime, msg: Message) {
    let m: GetRequestMsg = msg.decode();
    let ident = m.handle.identifier();
    require!(
        m.handle.node() == rt.node(),
        "rdma get routed to non-owner",
        handle = m.handle,
    );
    match rt.serve_get(ident, m.tag, m.num_bytes as usize, m.offset as usize) {
        Some(bytes) => rt.send_get_back(m.requesting, m.event_back, &bytes),
        None => {
            rt.rdma.state(m.handle).pending_tag_gets.entry(m.tag).or_default().push(
                PendingGet {
                    requester: m.requesting,
                    event_back: m.event_back,
                    num_bytes: m.num_bytes as usize,
                    offset: m.offset as usize,
                    tag: m.tag,
                },
            );
        }
    }
}

pub(crate) fn get_back_handler(rt: &mut Runtime, msg: Message) {
    let (m, data) = msg.decode_prefix::<GetBackMsg>();
    let cont = rt.rdma.pending_ops.remove(&m.event_back);
    match cont {
        Some(OpCont::Get(done)) => {
            done(rt, data.to_vec());
            if rt.events.exists(m.event_back) {
                rt.complete_normal_event(m.event_back);
            }
        }
        _ => crate::fail::die(format_args!(
            "rdma data reply without a pending get (event {:?})",
            m.event_back
        )),
    }
}

pub(crate) fn put_request_handler(rt: &mut Runtime, msg: Message) {
    let (m, data) = msg.decode_prefix::<PutRequestMsg>();
    let ident = m.handle.identifier();
    require!(
        m.handle.node() == rt.node(),
        "rdma put routed to non-owner",
        handle = m.handle,
    );
    if rt.serve_put(ident, m.tag, data, m.offset as usize) {
        let han = rt.sys.rdma_put_back;
        rt.send_record(
            m.requesting,
            han,
            &PutBackMsg {
                event_back: m.event_back,
            },
        );
    } else {
        let data = data.to_vec();
        rt.rdma.state(m.handle).pending_tag_puts.entry(m.tag).or_default().push(
            PendingPut {
                requester: m.requesting,
                event_back: m.event_back,
                data,
                offset: m.offset as usize,
                tag: m.tag,
            },
        );
    }
}

pub(crate) fn put_back_handler(rt: &mut Runtime, msg: Message) {
    let m: PutBackMsg = msg.decode();
    let cont = rt.rdma.pending_ops.remove(&m.event_back);
    match cont {
        Some(OpCont::Put(done)) => {
            done(rt);
            if rt.events.exists(m.event_back) {
                rt.complete_normal_event(m.event_back);
            }
        }
        _ => crate::fail::die(format_args!(
            "rdma put acknowledgment without a pending put (event {:?})",
            m.event_back
        )),
    }
}
