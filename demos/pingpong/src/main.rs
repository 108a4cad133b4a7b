// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Two ranks bouncing a counter back and forth over the in-process
//! transport, until the termination detector notices they've stopped.

use abi::ANY_EPOCH;
use rt::transport::loopback;
use rt::{Config, Runtime};
use serde::{Deserialize, Serialize};

const ROUNDS: u64 = 1000;

#[derive(Serialize, Deserialize)]
struct Ping {
    seq: u64,
}

struct State {
    han: abi::HandlerId,
    bounces: u64,
}

fn bounce(rt: &mut Runtime, msg: rt::message::Message) {
    let ping: Ping = msg.decode();
    let peer = 1 - rt.node();
    rt.with_user_state::<State, _>(|rt, s| {
        s.bounces += 1;
        if ping.seq < ROUNDS {
            rt.send_record(peer, s.han, &Ping { seq: ping.seq + 1 });
        }
    });
}

fn main() {
    let mut ranks: Vec<Runtime> = loopback::local_cluster(2)
        .into_iter()
        .map(|t| Runtime::initialize(Box::new(t), Config::default()))
        .collect();

    let mut han = abi::HandlerId::NONE;
    for rt in &mut ranks {
        han = rt.register_handler(bounce);
    }
    for rt in &mut ranks {
        rt.set_user_state(State { han, bounces: 0 });
        rt.attach_global_term_action(Box::new(|rt| {
            let (prod, cons) = rt.term_counters(ANY_EPOCH);
            println!(
                "rank {}: terminated (produced {prod}, consumed {cons})",
                rt.node()
            );
        }));
    }

    ranks[0].send_record(1, han, &Ping { seq: 1 });

    while ranks.iter().any(|rt| !rt.is_terminated()) {
        for rt in &mut ranks {
            rt.poll();
        }
    }

    for rt in &mut ranks {
        rt.with_user_state::<State, _>(|rt, s| {
            println!("rank {}: handled {} messages", rt.node(), s.bounces);
        });
    }

    for rt in ranks {
        rt.finalize();
    }
}
