// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-sided data plane: channel transfers, the message-based get/put
//! request path, and parked requests replayed after late function
//! association.

mod common;

use abi::RdmaOp;
use common::Cluster;

#[derive(Default)]
struct State {
    got: Option<Vec<u8>>,
    put_done: bool,
}

fn setup(n: usize) -> Cluster {
    let mut c = Cluster::new(n);
    for rt in &mut c.ranks {
        rt.set_user_state(State::default());
    }
    c
}

#[test]
fn channel_get_reads_target_region() {
    let mut c = setup(2);

    // Target rank 1 exposes 8192 bytes of 0xAB.
    let handle =
        c.ranks[1].register_new_rdma_handler(vec![0xAB; 8192], true, false);

    // Pre-agreed tag; both endpoints construct the channel.
    let tag = 7;
    c.ranks[1].setup_channel(handle, RdmaOp::Get, 0, tag);
    c.ranks[0].setup_channel(handle, RdmaOp::Get, 0, tag);

    let mut local = vec![0u8; 1024];
    c.ranks[0].channel_read(handle, &mut local, 2048);
    c.ranks[0].sync_channel_local(handle, RdmaOp::Get);

    assert!(local.iter().all(|b| *b == 0xAB));
}

#[test]
fn channel_put_writes_target_region() {
    let mut c = setup(2);
    let handle =
        c.ranks[1].register_new_rdma_handler(vec![0u8; 4096], true, false);

    let tag = 11;
    c.ranks[1].setup_channel(handle, RdmaOp::Put, 0, tag);
    c.ranks[0].setup_channel(handle, RdmaOp::Put, 0, tag);

    c.ranks[0].channel_write(handle, &[0x5A; 128], 256);
    c.ranks[0].sync_channel_local(handle, RdmaOp::Put);

    let region = c.ranks[1].rdma_region(handle);
    let mem = region.lock().unwrap();
    assert!(mem[256..384].iter().all(|b| *b == 0x5A));
    assert_eq!(mem[255], 0);
    assert_eq!(mem[384], 0);
}

#[test]
fn message_get_uses_default_handler() {
    let mut c = setup(2);
    let handle =
        c.ranks[1].register_new_rdma_handler(vec![0xCD; 64], true, false);

    c.ranks[0].rdma_get(handle, abi::NO_TAG, 16, 8, |rt, bytes| {
        rt.with_user_state::<State, _>(|_, s| s.got = Some(bytes));
    });

    c.run_until(|c| {
        c.ranks[0].with_user_state_ref(|s: &State| s.got.is_some())
    });
    let got = c.ranks[0].with_user_state_ref(|s: &State| s.got.clone());
    assert_eq!(got.unwrap(), vec![0xCD; 16]);
}

#[test]
fn message_put_round_trips_with_ack() {
    let mut c = setup(2);
    let handle =
        c.ranks[1].register_new_rdma_handler(vec![0u8; 64], true, false);

    c.ranks[0].rdma_put(handle, abi::NO_TAG, vec![9, 9, 9], 4, |rt| {
        rt.with_user_state::<State, _>(|_, s| s.put_done = true);
    });

    c.run_until(|c| {
        c.ranks[0].with_user_state_ref(|s: &State| s.put_done)
    });
    let region = c.ranks[1].rdma_region(handle);
    assert_eq!(&region.lock().unwrap()[4..7], &[9, 9, 9]);
}

#[test]
fn tagged_get_parks_until_function_arrives() {
    let mut c = setup(2);
    // No default handler: a tagged get has nothing to match.
    let handle =
        c.ranks[1].register_new_rdma_handler(vec![0u8; 32], false, false);

    let tag = 9;
    c.ranks[0].rdma_get(handle, tag, 0, 0, |rt, bytes| {
        rt.with_user_state::<State, _>(|_, s| s.got = Some(bytes));
    });

    // The request reaches rank 1 and parks.
    c.run(30);
    assert!(c.ranks[0].with_user_state_ref(|s: &State| s.got.is_none()));

    // Late association plus explicit replay completes it with the
    // function's bytes.
    c.ranks[1].associate_get_function(handle, Some(tag), |_, _, _, _| {
        vec![1, 2, 3]
    });
    c.ranks[1].process_pending_get(handle, tag);

    c.run_until(|c| {
        c.ranks[0].with_user_state_ref(|s: &State| s.got.is_some())
    });
    let got = c.ranks[0].with_user_state_ref(|s: &State| s.got.clone());
    assert_eq!(got.unwrap(), vec![1, 2, 3]);
}

#[test]
fn tagged_function_beats_any_tag_function() {
    let mut c = setup(2);
    let handle =
        c.ranks[1].register_new_rdma_handler(vec![0u8; 32], false, false);
    c.ranks[1].associate_get_function(handle, None, |_, _, _, _| vec![0xFF]);
    c.ranks[1]
        .associate_get_function(handle, Some(4), |_, _, _, _| vec![0x44]);

    c.ranks[0].rdma_get(handle, 4, 0, 0, |rt, bytes| {
        rt.with_user_state::<State, _>(|_, s| s.got = Some(bytes));
    });
    c.run_until(|c| {
        c.ranks[0].with_user_state_ref(|s: &State| s.got.is_some())
    });
    assert_eq!(
        c.ranks[0].with_user_state_ref(|s: &State| s.got.clone()),
        Some(vec![0x44])
    );
}

#[test]
fn local_get_resolves_without_messaging() {
    let mut c = setup(1);
    let handle =
        c.ranks[0].register_new_rdma_handler(vec![7u8; 16], true, false);
    c.ranks[0].rdma_get(handle, abi::NO_TAG, 0, 0, |rt, bytes| {
        rt.with_user_state::<State, _>(|_, s| s.got = Some(bytes));
    });
    assert_eq!(
        c.ranks[0].with_user_state_ref(|s: &State| s.got.clone()),
        Some(vec![7u8; 16])
    );
}
