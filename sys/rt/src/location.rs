// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Location coordination for migratable entities.
//!
//! Every entity has a *home* rank fixed at creation; home is authoritative
//! and immutable. Wherever the entity actually lives, the home can always
//! be asked. Routing works by home-node forwarding with eager caching:
//!
//! - The **eager** protocol ships the payload in the first routing message,
//!   hopping via local knowledge (registration, then cache, then home)
//!   until a rank can deliver. Small, byte-copyable payloads go eager.
//! - The **non-eager** protocol first resolves the location
//!   ([`Runtime::get_location`]) and then sends directly. Serialized
//!   payloads always go non-eager.
//!
//! Every routed message carries the last hop as `ask_node`. A rank that
//! cannot deliver records the asker before forwarding; the rank that
//! finally delivers sends an eager update back along the recorded askers,
//! which collapses forwarding chains to length two under stationary load.
//!
//! Messages for ids nobody here has registered are buffered in
//! `pending_lookups` until registration occurs; each buffered message
//! holds a `produce` on its epoch so termination cannot fire around it.
//! No deadlock detection is attempted.

use crate::message::Message;
use crate::trace::RtEvent;
use crate::Runtime;
use abi::{
    EntityId, Envelope, EventId, HandlerId, NodeId, NO_NODE, NO_TAG,
};
use lrumap::LruMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Delivery action registered with an entity: runs with the routed payload
/// when a message for the entity lands here.
pub type EntityAction = Rc<dyn Fn(&mut Runtime, &[u8])>;

/// Continuation taking a resolved node.
pub type NodeAction = Box<dyn FnOnce(&mut Runtime, NodeId)>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum LocState {
    Local,
    Remote,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct LocRecord {
    pub state: LocState,
    pub node: NodeId,
}

pub struct LocationCoord {
    local_registered: HashSet<EntityId>,
    registered_actions: HashMap<EntityId, EntityAction>,
    recs: LruMap<EntityId, LocRecord>,
    /// In-flight remote location queries, keyed by the answer event.
    pending_actions: HashMap<EventId, NodeAction>,
    /// Work waiting on a local registration (or a forwarding answer).
    pending_lookups: HashMap<EntityId, Vec<NodeAction>>,
    /// Ranks that asked us about an id and are owed an eager update.
    loc_asks: HashMap<EntityId, HashSet<NodeId>>,
}

impl LocationCoord {
    pub(crate) fn new(cache_capacity: usize) -> Self {
        Self {
            local_registered: HashSet::new(),
            registered_actions: HashMap::new(),
            recs: LruMap::new(cache_capacity),
            pending_actions: HashMap::new(),
            pending_lookups: HashMap::new(),
            loc_asks: HashMap::new(),
        }
    }

    /// True when the coordinator holds no registrations and no pending
    /// work (round-trip pre-state, for tests).
    pub fn is_pristine(&self) -> bool {
        self.local_registered.is_empty()
            && self.registered_actions.is_empty()
            && self.recs.is_empty()
            && self.pending_actions.is_empty()
            && self.pending_lookups.is_empty()
    }
}

/// Routed-message header; the user payload follows as trailing bytes.
#[derive(Copy, Clone, Serialize, Deserialize)]
pub(crate) struct RoutedHeader {
    id: EntityId,
    home: NodeId,
    /// Last hop that forwarded this message; `NO_NODE` at the origin.
    ask_node: NodeId,
    from: NodeId,
    hops: u32,
    /// Wire form of the explicit delivery handler, or `HandlerId::NONE`.
    user_handler: u16,
    serialized: u8,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct UpdateLocationMsg {
    id: EntityId,
    /// Query this answers, or `EventId::NONE` for unsolicited updates
    /// (registration announcements).
    event_back: EventId,
    resolved: NodeId,
    home: NodeId,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct GetLocationMsg {
    id: EntityId,
    event_back: EventId,
    ask_node: NodeId,
    home: NodeId,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct EagerUpdateMsg {
    id: EntityId,
    home: NodeId,
    deliver_node: NodeId,
}

impl Runtime {
    /// Registers `id` here with its authoritative `home`, with no delivery
    /// action: routed messages must name an explicit handler.
    pub fn register_entity(&mut self, id: EntityId, home: NodeId) {
        self.register_entity_inner(id, home, None);
    }

    /// Registers `id` here with a delivery action for routed messages that
    /// carry no explicit handler.
    pub fn register_entity_with(
        &mut self,
        id: EntityId,
        home: NodeId,
        action: impl Fn(&mut Runtime, &[u8]) + 'static,
    ) {
        self.register_entity_inner(id, home, Some(Rc::new(action)));
    }

    fn register_entity_inner(
        &mut self,
        id: EntityId,
        home: NodeId,
        action: Option<EntityAction>,
    ) {
        let this_node = self.node();
        require!(
            !self.loc.local_registered.contains(&id),
            "entity already registered here",
            id = id,
        );
        require!(
            home >= 0 && home < self.num_nodes(),
            "entity home must be a live rank",
            id = id,
            home = home,
        );

        self.loc.local_registered.insert(id);
        self.loc.recs.insert_pinned(
            id,
            LocRecord {
                state: LocState::Local,
                node: this_node,
            },
        );
        if let Some(action) = action {
            self.loc.registered_actions.insert(id, action);
        }

        // Anything that arrived before we existed can now run.
        if let Some(pending) = self.loc.pending_lookups.remove(&id) {
            for action in pending {
                action(self, this_node);
            }
        }

        // Registered away from home (construction off-home, or a
        // migration landing): tell home so it can forward.
        if home != this_node {
            let han = self.sys.loc_update;
            self.send_record(
                home,
                han,
                &UpdateLocationMsg {
                    id,
                    event_back: EventId::NONE,
                    resolved: this_node,
                    home,
                },
            );
        }
    }

    /// Home-side registration on behalf of a remote creation: installs a
    /// `Remote → create_node` record without registering locally.
    pub fn register_entity_remote(
        &mut self,
        id: EntityId,
        home: NodeId,
        create_node: NodeId,
    ) {
        require!(
            home == self.node(),
            "remote registration must run on the home node",
            id = id,
            home = home,
        );
        require!(
            !self.loc.local_registered.contains(&id),
            "entity already registered here",
            id = id,
        );
        self.update_pending_request(id, create_node, home, EventId::NONE);
    }

    /// Returns the coordinator to its pre-registration state for `id`.
    pub fn unregister_entity(&mut self, id: EntityId) {
        require!(
            self.loc.local_registered.remove(&id),
            "unregistering an entity that is not registered",
            id = id,
        );
        self.loc.recs.remove(id);
        self.loc.registered_actions.remove(&id);
    }

    /// The entity has left this rank for `new_node`.
    pub fn entity_emigrated(&mut self, id: EntityId, new_node: NodeId) {
        self.loc.local_registered.remove(&id);
        self.loc.registered_actions.remove(&id);
        self.loc.recs.remove(id);
        self.loc.recs.insert(
            id,
            LocRecord {
                state: LocState::Remote,
                node: new_node,
            },
        );
    }

    /// The entity has arrived here from `_from`. Home does not change.
    pub fn entity_immigrated(
        &mut self,
        id: EntityId,
        home: NodeId,
        _from: NodeId,
        action: impl Fn(&mut Runtime, &[u8]) + 'static,
    ) {
        self.register_entity_inner(id, home, Some(Rc::new(action)));
    }

    /// Whether a location record for `id` is held here.
    pub fn is_cached(&self, id: EntityId) -> bool {
        self.loc.recs.peek(id).is_some()
    }

    /// Where the cache currently places `id`, if anywhere.
    pub fn cached_location(&self, id: EntityId) -> Option<NodeId> {
        self.loc.recs.peek(id).map(|r| r.node)
    }

    /// Drops every non-authoritative (remote) record.
    pub fn clear_cache(&mut self) {
        self.loc.recs.retain(|_, r| r.state == LocState::Local);
    }

    pub fn location_coord(&self) -> &LocationCoord {
        &self.loc
    }

    /// Routes `payload` to entity `id`, delivered through its registered
    /// action.
    pub fn route_msg_bytes(&mut self, id: EntityId, home: NodeId, payload: &[u8]) {
        self.route_from_origin(id, home, HandlerId::NONE, payload, false);
    }

    /// Routes `payload` to entity `id`, delivered by invoking `han` on the
    /// entity's current rank.
    pub fn route_msg_to_handler(
        &mut self,
        id: EntityId,
        home: NodeId,
        han: HandlerId,
        payload: &[u8],
    ) {
        self.route_from_origin(id, home, han, payload, false);
    }

    /// Routes a serializer-produced payload: always non-eager.
    pub fn route_msg_serialized(
        &mut self,
        id: EntityId,
        home: NodeId,
        han: HandlerId,
        payload: &[u8],
    ) {
        self.route_from_origin(id, home, han, payload, true);
    }

    fn route_from_origin(
        &mut self,
        id: EntityId,
        home: NodeId,
        han: HandlerId,
        payload: &[u8],
        serialized: bool,
    ) {
        let hdr = RoutedHeader {
            id,
            home,
            ask_node: NO_NODE,
            from: self.node(),
            hops: 0,
            user_handler: han.0,
            serialized: serialized as u8,
        };
        self.route_prepared(hdr, payload.to_vec());
    }

    /// Protocol selection: eager ships the payload now; non-eager resolves
    /// the location first.
    fn route_prepared(&mut self, hdr: RoutedHeader, payload: Vec<u8>) {
        let eager = hdr.serialized == 0
            && payload.len() < self.cfg.eager_msg_threshold;

        if eager {
            let to = self.eager_hop(&hdr);
            self.route_to_node(hdr, payload, to);
        } else {
            let epoch = self.current_epoch();
            self.produce(epoch);
            self.get_location(
                hdr.id,
                hdr.home,
                Box::new(move |rt, node| {
                    rt.push_epoch(epoch);
                    rt.route_to_node(hdr, payload, node);
                    rt.pop_epoch(epoch);
                    rt.consume(epoch);
                }),
            );
        }
    }

    /// Best next hop from local knowledge: self if registered, the cached
    /// rank if cached, otherwise home.
    fn eager_hop(&mut self, hdr: &RoutedHeader) -> NodeId {
        let this_node = self.node();
        if self.loc.local_registered.contains(&hdr.id) {
            return this_node;
        }
        if let Some(rec) = self.loc.recs.get(hdr.id).copied() {
            return match rec.state {
                LocState::Local => this_node,
                LocState::Remote => rec.node,
            };
        }
        if hdr.home != this_node {
            hdr.home
        } else {
            this_node
        }
    }

    fn route_to_node(
        &mut self,
        mut hdr: RoutedHeader,
        payload: Vec<u8>,
        to: NodeId,
    ) {
        let this_node = self.node();
        if to != this_node {
            // We could not deliver; remember who asked us, then become the
            // asker for the next hop.
            if hdr.ask_node != NO_NODE {
                self.loc
                    .loc_asks
                    .entry(hdr.id)
                    .or_default()
                    .insert(hdr.ask_node);
            }
            hdr.ask_node = this_node;

            let mut env =
                Envelope::new(to, self.sys.loc_routed, self.current_epoch(), NO_TAG);
            env.set_flag(abi::EnvelopeFlags::IS_LOCATION);
            if hdr.serialized != 0 {
                env.set_flag(abi::EnvelopeFlags::HAS_BEEN_SERIALIZED);
            }
            let msg = Message::from_record(env, &hdr, &payload, &mut self.pool);
            self.post(msg);
            self.trace.record(RtEvent::LocationRouted { hop: to });
            return;
        }

        if self.loc.local_registered.contains(&hdr.id) {
            self.deliver_routed(hdr, &payload);
        } else {
            // Arrived before registration: buffer until the entity shows
            // up, keeping its epoch open meanwhile.
            let epoch = self.current_epoch();
            self.produce(epoch);
            self.loc.pending_lookups.entry(hdr.id).or_default().push(
                Box::new(move |rt, resolved| {
                    rt.push_epoch(epoch);
                    if resolved == rt.node() {
                        rt.deliver_routed(hdr, &payload);
                    } else {
                        rt.route_to_node(hdr, payload, resolved);
                    }
                    rt.pop_epoch(epoch);
                    rt.consume(epoch);
                }),
            );
            self.trace.record(RtEvent::LocationDelivered { buffered: true });
        }
    }

    fn deliver_routed(&mut self, hdr: RoutedHeader, payload: &[u8]) {
        let this_node = self.node();
        let han = HandlerId(hdr.user_handler);
        if han != HandlerId::NONE {
            let f = self.registry.get(han);
            let env =
                Envelope::new(this_node, han, self.current_epoch(), NO_TAG);
            let msg = Message::from_parts(env, payload, &mut self.pool);
            f(self, msg);
        } else {
            let action = self.loc.registered_actions.get(&hdr.id).cloned();
            let Some(action) = action else {
                crate::fail::die(format_args!(
                    "routed message for entity {} has no delivery handler",
                    hdr.id
                ));
            };
            action(self, payload);
        }
        self.trace.record(RtEvent::LocationDelivered { buffered: false });

        if hdr.ask_node != NO_NODE && hdr.ask_node != this_node {
            self.send_eager_update(hdr.id, hdr.ask_node, hdr.home, this_node);
        }
    }

    /// Resolves `id` to a rank and runs `action` with the answer.
    pub fn get_location(
        &mut self,
        id: EntityId,
        home: NodeId,
        action: NodeAction,
    ) {
        let this_node = self.node();
        if self.loc.local_registered.contains(&id) {
            action(self, this_node);
            return;
        }
        if let Some(rec) = self.loc.recs.get(id).copied() {
            let node = match rec.state {
                LocState::Local => this_node,
                LocState::Remote => rec.node,
            };
            action(self, node);
            return;
        }
        if home == this_node {
            // We are authoritative and know nothing yet: the entity has
            // not registered anywhere. Park until it does.
            self.loc.pending_lookups.entry(id).or_default().push(action);
            return;
        }

        let event_back = self.events.create_normal_event();
        self.loc.pending_actions.insert(event_back, action);
        let han = self.sys.loc_get;
        self.send_record(
            home,
            han,
            &GetLocationMsg {
                id,
                event_back,
                ask_node: this_node,
                home,
            },
        );
    }

    fn update_pending_request(
        &mut self,
        id: EntityId,
        resolved: NodeId,
        _home: NodeId,
        event_back: EventId,
    ) {
        if resolved != self.node() {
            self.loc.recs.insert(
                id,
                LocRecord {
                    state: LocState::Remote,
                    node: resolved,
                },
            );
        }
        self.trace.record(RtEvent::LocationUpdated { node: resolved });

        if !event_back.is_none() {
            if let Some(action) = self.loc.pending_actions.remove(&event_back) {
                action(self, resolved);
            }
            if self.events.exists(event_back) {
                self.complete_normal_event(event_back);
            }
        }
        if let Some(pending) = self.loc.pending_lookups.remove(&id) {
            for action in pending {
                action(self, resolved);
            }
        }
    }

    fn handle_eager_update(
        &mut self,
        id: EntityId,
        home: NodeId,
        deliver_node: NodeId,
    ) {
        require!(
            self.node() != deliver_node,
            "eager update delivered to the delivering rank",
            id = id,
            deliver_node = deliver_node,
        );
        self.loc.recs.insert(
            id,
            LocRecord {
                state: LocState::Remote,
                node: deliver_node,
            },
        );
        self.trace.record(RtEvent::LocationUpdated { node: deliver_node });

        // Collapse the rest of the chain behind us.
        if let Some(asks) = self.loc.loc_asks.remove(&id) {
            for ask in asks {
                self.send_eager_update(id, ask, home, deliver_node);
            }
        }
    }

    fn send_eager_update(
        &mut self,
        id: EntityId,
        ask_node: NodeId,
        home: NodeId,
        deliver_node: NodeId,
    ) {
        if ask_node == self.node() {
            return;
        }
        let han = self.sys.loc_eager_update;
        self.send_record(
            ask_node,
            han,
            &EagerUpdateMsg {
                id,
                home,
                deliver_node,
            },
        );
    }

}

pub(crate) fn routed_handler(rt: &mut Runtime, msg: Message) {
    let (mut hdr, trailing) = msg.decode_prefix::<RoutedHeader>();
    hdr.hops += 1;
    let payload = trailing.to_vec();
    rt.route_prepared(hdr, payload);
}

pub(crate) fn get_location_handler(rt: &mut Runtime, msg: Message) {
    let m: GetLocationMsg = msg.decode();
    let reply_to = m.ask_node;
    let id = m.id;
    let home = m.home;
    let event_back = m.event_back;
    rt.get_location(
        id,
        home,
        Box::new(move |rt, node| {
            let han = rt.sys.loc_update;
            rt.send_record(
                reply_to,
                han,
                &UpdateLocationMsg {
                    id,
                    event_back,
                    resolved: node,
                    home,
                },
            );
        }),
    );
}

pub(crate) fn update_location_handler(rt: &mut Runtime, msg: Message) {
    let m: UpdateLocationMsg = msg.decode();
    rt.update_pending_request(m.id, m.resolved, m.home, m.event_back);
}

pub(crate) fn eager_update_handler(rt: &mut Runtime, msg: Message) {
    let m: EagerUpdateMsg = msg.decode();
    rt.handle_eager_update(m.id, m.home, m.deliver_node);
}
