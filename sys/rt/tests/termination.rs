// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Epoch termination with forwarded work: a chain of sends inside one
//! epoch, detected finished after two matching waves, with actions firing
//! exactly once.

mod common;

use abi::{Epoch, HandlerId, ANY_EPOCH};
use common::Cluster;
use rt::message::Message;
use rt::Runtime;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Hop {
    forward_to: abi::NodeId,
    han: HandlerId,
}

#[derive(Default)]
struct State {
    handled: u32,
    epoch_fired: u32,
}

/// Forwards once more if asked, otherwise just consumes.
fn hop_handler(rt: &mut Runtime, msg: Message) {
    let hop: Hop = msg.decode();
    rt.with_user_state::<State, _>(|_, s| s.handled += 1);
    if hop.forward_to >= 0 {
        rt.send_record(
            hop.forward_to,
            hop.han,
            &Hop {
                forward_to: -1,
                han: hop.han,
            },
        );
    }
}

fn open_epoch_everywhere(c: &mut Cluster) -> Epoch {
    let mut epoch = None;
    for rt in &mut c.ranks {
        let e = rt.new_epoch();
        if let Some(prev) = epoch {
            assert_eq!(e, prev, "ranks disagree on the new epoch");
        }
        epoch = Some(e);
    }
    epoch.unwrap()
}

#[test]
fn forwarded_work_epoch_finishes_exactly_once() {
    let mut c = Cluster::new(3);
    let han = c.register(hop_handler);
    for rt in &mut c.ranks {
        rt.set_user_state(State::default());
    }

    let epoch = open_epoch_everywhere(&mut c);
    assert_eq!(epoch, abi::FIRST_EPOCH);

    for rt in &mut c.ranks {
        rt.attach_epoch_term_action(
            epoch,
            Box::new(|rt| {
                rt.with_user_state::<State, _>(|_, s| s.epoch_fired += 1);
            }),
        );
    }

    // Rank 0 sends to 1 inside the epoch; 1's handler forwards to 2.
    c.ranks[0].with_epoch(epoch, |rt| {
        rt.send_record(
            1,
            han,
            &Hop {
                forward_to: 2,
                han,
            },
        );
    });

    c.run_until(|c| {
        c.ranks
            .iter()
            .all(|rt| rt.with_user_state_ref(|s: &State| s.epoch_fired == 1))
    });

    // Balanced counters for the epoch across the job.
    let (prod, cons) = c
        .ranks
        .iter()
        .map(|rt| rt.term_counters(epoch))
        .fold((0i64, 0i64), |(p, co), (lp, lc)| (p + lp, co + lc));
    assert_eq!(prod, 2); // two sends carried the epoch
    assert_eq!(prod, cons);

    // At-most-once: further waves must not re-fire the action.
    c.run(50);
    for rt in &c.ranks {
        rt.with_user_state_ref(|s: &State| assert_eq!(s.epoch_fired, 1));
    }

    // Handlers ran on ranks 1 and 2.
    assert_eq!(
        c.ranks[1].with_user_state_ref(|s: &State| s.handled),
        1
    );
    assert_eq!(
        c.ranks[2].with_user_state_ref(|s: &State| s.handled),
        1
    );
}

#[test]
fn resolved_window_tracks_new_epochs() {
    let mut c = Cluster::new(2);
    for rt in &mut c.ranks {
        rt.set_user_state(State::default());
    }

    let e1 = open_epoch_everywhere(&mut c);
    c.run_until(|c| {
        c.ranks
            .iter()
            .all(|rt| rt.resolved_epoch_window().0 != abi::NO_EPOCH)
    });
    let e2 = open_epoch_everywhere(&mut c);
    c.run_until(|c| {
        c.ranks.iter().all(|rt| rt.resolved_epoch_window().1 >= e2)
    });

    for rt in &c.ranks {
        let (first, last) = rt.resolved_epoch_window();
        assert!(first <= e1);
        assert_eq!(last, e2);
    }
}

#[test]
fn quiet_job_reaches_global_termination() {
    let mut c = Cluster::new(4);
    for rt in &mut c.ranks {
        rt.set_user_state(State::default());
    }
    c.run_until_terminated();
    for rt in &c.ranks {
        assert_eq!(rt.term_counters(ANY_EPOCH), (0, 0));
    }
}

#[test]
fn global_actions_fire_after_named_epoch_actions() {
    let mut c = Cluster::new(2);
    let han = c.register(hop_handler);
    for rt in &mut c.ranks {
        rt.set_user_state(State::default());
    }
    let epoch = open_epoch_everywhere(&mut c);

    c.ranks[0].attach_epoch_term_action(
        epoch,
        Box::new(|rt| {
            rt.with_user_state::<State, _>(|_, s| s.epoch_fired += 1);
        }),
    );
    c.ranks[0].attach_global_term_action(Box::new(|rt| {
        rt.with_user_state::<State, _>(|_, s| {
            // The named epoch finished first.
            assert_eq!(s.epoch_fired, 1);
            s.handled += 100;
        });
    }));

    c.ranks[0].with_epoch(epoch, |rt| {
        rt.send_record(
            1,
            han,
            &Hop {
                forward_to: -1,
                han,
            },
        );
    });

    c.run_until_terminated();
    assert_eq!(
        c.ranks[0].with_user_state_ref(|s: &State| s.handled),
        100
    );
}
