// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pipes and callbacks: local and remote anonymous sinks, one-shot
//! semantics, and callback value types surviving serialization.

mod common;

use common::Cluster;
use rt::message::Message;
use rt::pipe::Callback;
use rt::Runtime;

#[derive(Default)]
struct State {
    fired: Vec<Vec<u8>>,
}

fn record_handler(rt: &mut Runtime, msg: Message) {
    let bytes = msg.payload().to_vec();
    rt.with_user_state::<State, _>(|_, s| s.fired.push(bytes));
}

fn fired(c: &Cluster, rank: usize) -> Vec<Vec<u8>> {
    c.ranks[rank].with_user_state_ref(|s: &State| s.fired.clone())
}

fn setup(n: usize) -> Cluster {
    let mut c = Cluster::new(n);
    for rt in &mut c.ranks {
        rt.set_user_state(State::default());
    }
    c
}

#[test]
fn anon_callback_fires_locally() {
    let mut c = setup(1);
    let cb = c.ranks[0].make_callback_anon(false, |rt, payload| {
        let bytes = payload.to_vec();
        rt.with_user_state::<State, _>(|_, s| s.fired.push(bytes));
    });
    c.ranks[0].trigger_callback(cb, b"hello");
    assert_eq!(fired(&c, 0), [b"hello".to_vec()]);
}

#[test]
#[should_panic(expected = "dead pipe")]
fn one_shot_pipe_cannot_fire_twice() {
    let mut c = setup(1);
    let cb = c.ranks[0].make_callback_anon(false, |_, _| {});
    c.ranks[0].trigger_callback_void(cb);
    c.ranks[0].trigger_callback_void(cb);
}

#[test]
fn persistent_pipe_fires_repeatedly() {
    let mut c = setup(1);
    let cb = c.ranks[0].make_callback_anon(true, |rt, payload| {
        let bytes = payload.to_vec();
        rt.with_user_state::<State, _>(|_, s| s.fired.push(bytes));
    });
    c.ranks[0].trigger_callback(cb, b"a");
    c.ranks[0].trigger_callback(cb, b"b");
    assert_eq!(fired(&c, 0), [b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn serialized_callback_triggers_the_same_sink() {
    let mut c = setup(2);

    // Rank 1 owns the sink; the callback value ships to rank 0.
    let cb = c.ranks[1].make_callback_anon(false, |rt, payload| {
        let bytes = payload.to_vec();
        rt.with_user_state::<State, _>(|_, s| s.fired.push(bytes));
    });

    let mut wire = [0u8; 64];
    let n = ssmarshal::serialize(&mut wire, &cb).unwrap();
    let (shipped, _): (Callback, usize) =
        ssmarshal::deserialize(&wire[..n]).unwrap();
    assert_eq!(shipped, cb);

    c.ranks[0].trigger_callback(shipped, b"from afar");
    c.run_until(|c| !fired(c, 1).is_empty());
    assert_eq!(fired(&c, 1), [b"from afar".to_vec()]);
}

#[test]
fn send_callback_reaches_handler_on_dest() {
    let mut c = setup(2);
    let han = c.register(record_handler);

    let cb = c.ranks[0].make_callback_send(han, 1);
    c.ranks[0].trigger_callback(cb, b"direct");
    c.run_until(|c| !fired(c, 1).is_empty());
    assert_eq!(fired(&c, 1), [b"direct".to_vec()]);
}

#[test]
fn bcast_callback_reaches_every_rank() {
    let mut c = setup(3);
    let han = c.register(record_handler);

    let cb = c.ranks[2].make_callback_bcast(han);
    c.ranks[2].trigger_callback(cb, b"all");
    c.run_until(|c| (0..3).all(|r| fired(c, r) == [b"all".to_vec()]));
}

#[test]
fn entity_callback_routes_through_location() {
    let mut c = setup(3);
    let han = c.register(record_handler);

    c.ranks[2].register_entity(42, 2);
    let cb = Callback::EntitySend {
        id: 42,
        home: 2,
        han,
    };
    c.ranks[0].trigger_callback(cb, b"ent");
    c.run_until(|c| !fired(c, 2).is_empty());
    assert_eq!(fired(&c, 2), [b"ent".to_vec()]);
}

#[test]
fn void_trigger_carries_empty_payload() {
    let mut c = setup(2);
    let han = c.register(record_handler);
    let cb = c.ranks[0].make_callback_send(han, 1);
    c.ranks[0].trigger_callback_void(cb);
    c.run_until(|c| !fired(c, 1).is_empty());
    assert_eq!(fired(&c, 1), [Vec::<u8>::new()]);
}
