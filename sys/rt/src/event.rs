// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event system: tracks outstanding transfers and composite completions.
//!
//! Three kinds of event record live in the store:
//!
//! - **Transport** events wrap a non-blocking send request. They become
//!   ready when the transport reports local completion, at which point the
//!   reference they hold on the message buffer is dropped (exactly once).
//! - **Normal** events are set ready imperatively by handlers.
//! - **Parent** events aggregate children; a parent is ready iff every
//!   child is ready.
//!
//! Ready-once: the `Waiting → Ready` transition is monotonic. Firing an
//! event runs its attached actions in FIFO attachment order and erases the
//! event from the store before the actions run, so completed actions can
//! never observe the event. An event id that is absent from the store but
//! owned by this rank is therefore Ready.
//!
//! Event ids embed their owning rank (see [`abi::EventId`]), so actions can
//! be attached to *remote* events: the attach creates a local proxy event
//! and asks the owner to report completion (`CheckEventFinishedMsg` /
//! `EventFinishedMsg`).

use crate::message::Message;
use crate::trace::RtEvent;
use crate::transport::ReqId;
use crate::Runtime;
use abi::{EventId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Deferred work that runs on the comm thread with the runtime.
pub type Action = Box<dyn FnOnce(&mut Runtime)>;

/// Observable state of an event id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventState {
    Ready,
    Waiting,
    /// Owned by another rank; completion must be queried remotely.
    Remote,
}

enum EventRecord {
    Transport {
        req: ReqId,
        done: bool,
        /// Keeps the outbound buffer alive until the transport is done
        /// with it.
        payload: Option<Rc<[u8]>>,
    },
    Normal {
        complete: bool,
    },
    Parent {
        children: Vec<EventId>,
    },
}

struct EventHolder {
    record: EventRecord,
    actions: Vec<Action>,
}

/// Per-rank event container.
pub struct EventStore {
    node: NodeId,
    next_seq: u64,
    container: HashMap<EventId, EventHolder>,
    /// Events the scheduler polls for completion (transport and parent
    /// kinds; normal events complete imperatively).
    polled: VecDeque<EventId>,
}

impl EventStore {
    pub(crate) fn new(node: NodeId) -> Self {
        Self {
            node,
            next_seq: 0,
            container: HashMap::new(),
            polled: VecDeque::new(),
        }
    }

    fn fresh_id(&mut self) -> EventId {
        let id = EventId::for_node_and_seq(self.node, self.next_seq);
        self.next_seq += 1;
        id
    }

    pub(crate) fn create_transport_event(
        &mut self,
        req: ReqId,
        payload: Option<Rc<[u8]>>,
    ) -> EventId {
        let id = self.fresh_id();
        self.container.insert(
            id,
            EventHolder {
                record: EventRecord::Transport {
                    req,
                    done: false,
                    payload,
                },
                actions: Vec::new(),
            },
        );
        self.polled.push_back(id);
        id
    }

    pub(crate) fn create_normal_event(&mut self) -> EventId {
        let id = self.fresh_id();
        self.container.insert(
            id,
            EventHolder {
                record: EventRecord::Normal { complete: false },
                actions: Vec::new(),
            },
        );
        id
    }

    pub(crate) fn create_parent_event(&mut self) -> EventId {
        let id = self.fresh_id();
        self.container.insert(
            id,
            EventHolder {
                record: EventRecord::Parent {
                    children: Vec::new(),
                },
                actions: Vec::new(),
            },
        );
        self.polled.push_back(id);
        id
    }

    pub(crate) fn add_child(&mut self, parent: EventId, child: EventId) {
        let holder = self.container.get_mut(&parent);
        match holder.map(|h| &mut h.record) {
            Some(EventRecord::Parent { children }) => children.push(child),
            _ => crate::fail::die(format_args!(
                "add_child on non-parent event {parent:?}"
            )),
        }
    }

    pub(crate) fn exists(&self, event: EventId) -> bool {
        self.container.contains_key(&event)
    }

    /// Number of live (unfired) events, for teardown checks.
    pub fn live_events(&self) -> usize {
        self.container.len()
    }
}

impl Runtime {
    /// Creates an event that is set ready imperatively (see
    /// [`Runtime::complete_normal_event`]).
    pub fn create_normal_event(&mut self) -> EventId {
        self.events.create_normal_event()
    }

    /// Creates a composite event that becomes ready when every child is.
    pub fn create_parent_event(&mut self) -> EventId {
        self.events.create_parent_event()
    }

    /// Adds a child under a parent event.
    pub fn add_event_child(&mut self, parent: EventId, child: EventId) {
        self.events.add_child(parent, child);
    }

    /// Tests an event for completion without blocking.
    pub fn test_event_complete(&mut self, event: EventId) -> EventState {
        if !self.events.exists(event) {
            return if event.owning_node() == self.node() {
                EventState::Ready
            } else {
                EventState::Remote
            };
        }

        require!(
            event.owning_node() == self.node(),
            "live event owned by another node",
            event = event,
            owner = event.owning_node(),
        );

        if self.test_ready(event) {
            EventState::Ready
        } else {
            EventState::Waiting
        }
    }

    /// Tests the stored record. Does not fire actions.
    fn test_ready(&mut self, event: EventId) -> bool {
        // Parent children are tested recursively; copy the list out first
        // so the container isn't borrowed across the recursion.
        let children = {
            let holder = self.events.container.get_mut(&event).unwrap();
            match &mut holder.record {
                EventRecord::Transport { req, done, payload } => {
                    if !*done {
                        let complete = crate::fail::transport_ok(
                            self.transport.test(*req),
                            "request test",
                        );
                        if complete {
                            *done = true;
                            // Drop the buffer reference exactly once.
                            *payload = None;
                        }
                    }
                    return *done;
                }
                EventRecord::Normal { complete } => return *complete,
                EventRecord::Parent { children } => children.clone(),
            }
        };

        let mut ready = true;
        for child in children {
            ready &= self.test_event_complete(child) == EventState::Ready;
        }
        if ready {
            // Children fired and erased; drop the list so later tests
            // don't re-walk it.
            if let Some(h) = self.events.container.get_mut(&event) {
                h.record = EventRecord::Parent {
                    children: Vec::new(),
                };
            }
        }
        ready
    }

    /// Fires `event`: erases it from the store, then runs its actions in
    /// attachment order.
    fn fire_event(&mut self, event: EventId) {
        let holder = self.events.container.remove(&event);
        let Some(holder) = holder else { return };
        self.trace.record(RtEvent::EventReady { event });
        for action in holder.actions {
            action(self);
        }
    }

    /// Marks a normal event ready and fires it.
    pub fn complete_normal_event(&mut self, event: EventId) {
        require!(
            self.events.exists(event),
            "completing an event that does not exist",
            event = event,
        );
        {
            let holder = self.events.container.get_mut(&event).unwrap();
            match &mut holder.record {
                EventRecord::Normal { complete } => *complete = true,
                _ => crate::fail::die(format_args!(
                    "complete_normal_event on non-normal event {event:?}"
                )),
            }
        }
        self.fire_event(event);
    }

    /// Attaches `action` to fire when `event` becomes ready.
    ///
    /// For a local event this either runs the action immediately (already
    /// ready; returns `EventId::NONE`) or buffers it on the event. For a
    /// remote event, a local proxy event is created and the owner is asked
    /// to report completion; the returned proxy id can itself be tested or
    /// attached to.
    pub fn attach_event_action(
        &mut self,
        event: EventId,
        action: Action,
    ) -> EventId {
        match self.test_event_complete(event) {
            EventState::Ready => {
                action(self);
                EventId::NONE
            }
            EventState::Waiting => {
                self.events
                    .container
                    .get_mut(&event)
                    .unwrap()
                    .actions
                    .push(action);
                event
            }
            EventState::Remote => {
                let proxy = self.events.create_normal_event();
                self.events
                    .container
                    .get_mut(&proxy)
                    .unwrap()
                    .actions
                    .push(action);
                let owner = event.owning_node();
                let this_node = self.node();
                let han = self.sys.event_check_finished;
                self.send_record(
                    owner,
                    han,
                    &CheckEventFinishedMsg {
                        event,
                        sent_from: this_node,
                        event_back: proxy,
                    },
                );
                proxy
            }
        }
    }

    /// Polls up to `batch` outstanding events, firing any that are ready.
    /// Returns true if anything fired.
    pub(crate) fn perform_triggered_actions(&mut self, batch: usize) -> bool {
        let mut fired = false;
        for _ in 0..batch.min(self.events.polled.len()) {
            let Some(event) = self.events.polled.pop_front() else {
                break;
            };
            if !self.events.exists(event) {
                // Fired through another path; drop from the poll list.
                continue;
            }
            if self.test_ready(event) {
                self.fire_event(event);
                fired = true;
            } else {
                self.events.polled.push_back(event);
            }
        }
        fired
    }
}

/// Query: "is `event` finished on its owner?" Sent to the owner.
#[derive(Serialize, Deserialize)]
pub(crate) struct CheckEventFinishedMsg {
    pub event: EventId,
    pub sent_from: NodeId,
    pub event_back: EventId,
}

/// Answer: `event` has finished; fire the asker's proxy `event_back`.
#[derive(Serialize, Deserialize)]
pub(crate) struct EventFinishedMsg {
    pub event: EventId,
    pub event_back: EventId,
}

pub(crate) fn check_event_finished_handler(rt: &mut Runtime, msg: Message) {
    let m: CheckEventFinishedMsg = msg.decode();
    require!(
        m.event.owning_node() == rt.node(),
        "completion query routed to non-owner",
        event = m.event,
        node = rt.node(),
    );

    let send_back = m.event_back.owning_node();
    require!(
        send_back == m.sent_from,
        "proxy event not owned by the asking node",
        proxy = m.event_back,
        asker = m.sent_from,
    );

    let han = rt.sys.event_finished;
    let reply = EventFinishedMsg {
        event: m.event,
        event_back: m.event_back,
    };
    match rt.test_event_complete(m.event) {
        EventState::Ready => {
            rt.send_record(send_back, han, &reply);
        }
        EventState::Waiting => {
            rt.attach_event_action(
                m.event,
                Box::new(move |rt| {
                    rt.send_record(send_back, han, &reply);
                }),
            );
        }
        EventState::Remote => crate::fail::die(format_args!(
            "owner sees its own event {:?} as remote",
            m.event
        )),
    }
}

pub(crate) fn event_finished_handler(rt: &mut Runtime, msg: Message) {
    let m: EventFinishedMsg = msg.decode();
    require!(
        rt.test_event_complete(m.event_back) == EventState::Waiting,
        "proxy event fired before its remote answer arrived",
        event = m.event,
        proxy = m.event_back,
    );
    rt.complete_normal_event(m.event_back);
}
