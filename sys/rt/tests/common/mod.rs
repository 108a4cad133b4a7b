// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-rank test harness: all ranks in one thread, stepped round-robin
//! over the loopback transport. Deterministic, and per-link FIFO holds by
//! construction.

// Not every suite uses every helper.
#![allow(dead_code)]

use abi::HandlerId;
use rt::registry::ActiveFn;
use rt::transport::loopback;
use rt::{Config, Runtime};

pub struct Cluster {
    pub ranks: Vec<Runtime>,
}

impl Cluster {
    pub fn new(n: usize) -> Self {
        Self::with_config(n, Config::default())
    }

    pub fn with_config(n: usize, cfg: Config) -> Self {
        let ranks = loopback::local_cluster(n)
            .into_iter()
            .map(|t| Runtime::initialize(Box::new(t), cfg))
            .collect();
        Self { ranks }
    }

    /// Collective registration; returns the (identical) handler id.
    pub fn register(&mut self, f: ActiveFn) -> HandlerId {
        let mut han = HandlerId::NONE;
        for rt in &mut self.ranks {
            let h = rt.register_handler(f);
            if han != HandlerId::NONE {
                assert_eq!(h, han, "ranks disagree on handler id");
            }
            han = h;
        }
        han
    }

    /// Collective sequencer trigger-slot registration.
    pub fn register_seq_trigger(&mut self) -> HandlerId {
        let mut han = HandlerId::NONE;
        for rt in &mut self.ranks {
            let h = rt.register_seq_trigger();
            if han != HandlerId::NONE {
                assert_eq!(h, han, "ranks disagree on trigger id");
            }
            han = h;
        }
        han
    }

    /// One round-robin step over all ranks.
    pub fn step(&mut self) -> bool {
        let mut progress = false;
        for rt in &mut self.ranks {
            progress |= rt.poll();
        }
        progress
    }

    pub fn run(&mut self, iters: usize) {
        for _ in 0..iters {
            self.step();
        }
    }

    /// Steps until every rank's global detector has fired.
    pub fn run_until_terminated(&mut self) {
        for _ in 0..10_000 {
            if self.ranks.iter().all(|rt| rt.is_terminated()) {
                return;
            }
            self.step();
        }
        panic!("cluster did not reach global termination");
    }

    /// Steps until `pred` holds on the cluster.
    pub fn run_until(&mut self, mut pred: impl FnMut(&Cluster) -> bool) {
        for _ in 0..10_000 {
            if pred(self) {
                return;
            }
            self.step();
        }
        panic!("condition not reached");
    }
}
