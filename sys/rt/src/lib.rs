// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous task runtime over an MPI-style message-passing substrate.
//!
//! The runtime dispatches arriving byte buffers to pre-registered handler
//! functions, tracks outstanding transfers and composite completions as
//! events, detects distributed termination over user-defined epochs with
//! the four-counter method, routes messages to migratable entities by
//! home-node forwarding with eager caching, exposes a one-sided RDMA data
//! plane, and orders user tasks with a sequencer built on wait/trigger
//! matching.
//!
//! All process-wide state lives in one [`Runtime`] value passed by
//! reference to every operation; there are no global singletons. The
//! comm thread owns the runtime: handlers, actions, and sequencer
//! closures all run on it, to completion, between scheduler iterations.
//!
//! A typical life cycle:
//!
//! ```ignore
//! let mut rt = Runtime::initialize(transport, Config::default());
//! let han = rt.register_handler(my_handler); // collective
//! rt.send_record(1, han, &MyMsg { seq: 1 });
//! rt.run_until_terminated();
//! rt.finalize();
//! ```

#[macro_use]
pub mod fail;

pub mod active;
pub mod context;
pub mod event;
pub mod location;
pub mod message;
pub mod pipe;
pub mod rdma;
pub mod registry;
pub mod sched;
pub mod seq;
pub mod term;
pub mod trace;
pub mod transport;

use abi::{Epoch, HandlerId, NodeId};
use context::Context;
use event::EventStore;
use location::LocationCoord;
use message::MsgPool;
use pipe::PipeManager;
use rdma::RdmaManager;
use registry::{ActiveFn, Registry};
use ringlog::RingLog;
use sched::RunQueue;
use seq::Sequencer;
use term::Termination;
use trace::RtEvent;
use transport::Transport;

pub use registry::ActiveFn as Handler;

/// Runtime tunables. `Default` gives the standard configuration.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Payloads below this many bytes route eagerly through the location
    /// coordinator; larger (or serialized) payloads resolve first.
    pub eager_msg_threshold: usize,
    /// Bound on cached location records per rank.
    pub location_cache_capacity: usize,
    /// Block size of the send-side message pool.
    pub pool_block_size: usize,
    /// Blocks retained by the pool between sends.
    pub pool_max_free: usize,
    /// Outstanding events tested per scheduler iteration.
    pub event_poll_batch: usize,
    /// Entries retained by the runtime trace recorder.
    pub trace_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eager_msg_threshold: 512,
            location_cache_capacity: 128,
            pool_block_size: 1024,
            pool_max_free: 64,
            event_poll_batch: 4,
            trace_capacity: 256,
        }
    }
}

/// Handler ids of the runtime's own protocol handlers. Registered first,
/// in a fixed order, so they agree on every rank.
pub(crate) struct SysHandlers {
    pub term_counter: HandlerId,
    pub term_new_epoch: HandlerId,
    pub term_ready_epoch: HandlerId,
    pub term_epoch_finished: HandlerId,
    pub term_epoch_continue: HandlerId,
    pub event_check_finished: HandlerId,
    pub event_finished: HandlerId,
    pub loc_routed: HandlerId,
    pub loc_get: HandlerId,
    pub loc_update: HandlerId,
    pub loc_eager_update: HandlerId,
    pub rdma_get_request: HandlerId,
    pub rdma_get_back: HandlerId,
    pub rdma_put_request: HandlerId,
    pub rdma_put_back: HandlerId,
    pub pipe_trigger: HandlerId,
}

impl SysHandlers {
    /// Placeholder until bootstrap registration fills the real slots in.
    const UNREGISTERED: Self = Self {
        term_counter: HandlerId::NONE,
        term_new_epoch: HandlerId::NONE,
        term_ready_epoch: HandlerId::NONE,
        term_epoch_finished: HandlerId::NONE,
        term_epoch_continue: HandlerId::NONE,
        event_check_finished: HandlerId::NONE,
        event_finished: HandlerId::NONE,
        loc_routed: HandlerId::NONE,
        loc_get: HandlerId::NONE,
        loc_update: HandlerId::NONE,
        loc_eager_update: HandlerId::NONE,
        rdma_get_request: HandlerId::NONE,
        rdma_get_back: HandlerId::NONE,
        rdma_put_request: HandlerId::NONE,
        rdma_put_back: HandlerId::NONE,
        pipe_trigger: HandlerId::NONE,
    };
}

/// The process-wide runtime. One per rank.
pub struct Runtime {
    pub(crate) cfg: Config,
    ctx: Context,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) registry: Registry,
    pub(crate) events: EventStore,
    pub(crate) term: Termination,
    pub(crate) loc: LocationCoord,
    pub(crate) rdma: RdmaManager,
    pub(crate) pipes: PipeManager,
    pub(crate) seq: Sequencer,
    pub(crate) sched: RunQueue,
    pub(crate) pool: MsgPool,
    pub(crate) trace: RingLog<RtEvent>,
    pub(crate) epoch_stack: Vec<Epoch>,
    pub(crate) sys: SysHandlers,
    user: Option<Box<dyn std::any::Any>>,
}

impl Runtime {
    /// Brings the runtime up over `transport`. Collective: every rank
    /// initializes with the same configuration before any messaging.
    pub fn initialize(transport: Box<dyn Transport>, cfg: Config) -> Runtime {
        let node = transport.rank();
        let num_nodes = transport.size();
        require!(
            num_nodes > 0 && node >= 0 && node < num_nodes,
            "transport reports a nonsense identity",
            node = node,
            num_nodes = num_nodes,
        );

        let mut rt = Runtime {
            cfg,
            ctx: Context::new(node, num_nodes),
            transport,
            registry: Registry::default(),
            events: EventStore::new(node),
            term: Termination::new(node, num_nodes),
            loc: LocationCoord::new(cfg.location_cache_capacity),
            rdma: RdmaManager::new(),
            pipes: PipeManager::new(),
            seq: Sequencer::new(),
            sched: RunQueue::default(),
            pool: MsgPool::new(cfg.pool_block_size, cfg.pool_max_free),
            trace: RingLog::new(cfg.trace_capacity),
            epoch_stack: Vec::new(),
            sys: SysHandlers::UNREGISTERED,
            user: None,
        };

        // System handlers claim the first slots, in this fixed order, on
        // every rank. Each registration barriers individually, like any
        // other registration.
        rt.sys = SysHandlers {
            term_counter: rt.register_handler(term::term_counter_handler),
            term_new_epoch: rt.register_handler(term::new_epoch_handler),
            term_ready_epoch: rt.register_handler(term::ready_epoch_handler),
            term_epoch_finished: rt
                .register_handler(term::epoch_finished_handler),
            term_epoch_continue: rt
                .register_handler(term::epoch_continue_handler),
            event_check_finished: rt
                .register_handler(event::check_event_finished_handler),
            event_finished: rt.register_handler(event::event_finished_handler),
            loc_routed: rt.register_handler(location::routed_handler),
            loc_get: rt.register_handler(location::get_location_handler),
            loc_update: rt.register_handler(location::update_location_handler),
            loc_eager_update: rt
                .register_handler(location::eager_update_handler),
            rdma_get_request: rt.register_handler(rdma::get_request_handler),
            rdma_get_back: rt.register_handler(rdma::get_back_handler),
            rdma_put_request: rt.register_handler(rdma::put_request_handler),
            rdma_put_back: rt.register_handler(rdma::put_back_handler),
            pipe_trigger: rt.register_handler(pipe::pipe_trigger_handler),
        };
        fail::transport_ok(rt.transport.barrier(), "initialization barrier");
        rt
    }

    /// This rank.
    pub fn node(&self) -> NodeId {
        self.ctx.node()
    }

    /// Ranks in the job.
    pub fn num_nodes(&self) -> NodeId {
        self.ctx.num_nodes()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Registers an active-message handler. Collective and ordered: every
    /// rank must register the same handlers in the same order during
    /// bootstrap. A barrier follows each registration; the table is
    /// read-only afterwards.
    pub fn register_handler(&mut self, f: ActiveFn) -> HandlerId {
        let han = self.registry.register(f);
        fail::transport_ok(self.transport.barrier(), "registration barrier");
        han
    }

    /// Collective barrier over all ranks.
    pub fn barrier(&mut self) {
        fail::transport_ok(self.transport.barrier(), "barrier");
    }

    /// Installs rank-local application state reachable from handlers.
    pub fn set_user_state<T: 'static>(&mut self, state: T) {
        self.user = Some(Box::new(state));
    }

    /// Runs `f` with the installed user state and the runtime. Does not
    /// nest.
    pub fn with_user_state<T: 'static, R>(
        &mut self,
        f: impl FnOnce(&mut Runtime, &mut T) -> R,
    ) -> R {
        let mut boxed = match self.user.take() {
            Some(b) => b,
            None => fail::die("no user state installed (or nested access)"),
        };
        let state = match boxed.downcast_mut::<T>() {
            Some(s) => s,
            None => fail::die("user state type mismatch"),
        };
        let r = f(self, state);
        self.user = Some(boxed);
        r
    }

    /// Read-only peek at the installed user state.
    pub fn with_user_state_ref<T: 'static, R>(
        &self,
        f: impl FnOnce(&T) -> R,
    ) -> R {
        let boxed = match self.user.as_ref() {
            Some(b) => b,
            None => fail::die("no user state installed (or nested access)"),
        };
        let state = match boxed.downcast_ref::<T>() {
            Some(s) => s,
            None => fail::die("user state type mismatch"),
        };
        f(state)
    }

    /// The runtime trace recorder (diagnostics and tests).
    pub fn trace_log(&self) -> &RingLog<RtEvent> {
        &self.trace
    }

    /// Tears the runtime down. Collective. All state is in-memory and
    /// dies here; there is nothing persistent to flush.
    pub fn finalize(mut self) {
        self.teardown_channels();
        fail::transport_ok(self.transport.barrier(), "finalize barrier");
    }
}
