// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RDMA channels: a bound two-rank one-sided endpoint over a fixed byte
//! region.
//!
//! A channel pairs the *target* (the rank owning the registered region)
//! with one *non-target* peer, over a dedicated two-rank communicator and
//! window. The op type fixes the allowed direction: data operations are
//! issued by the non-target only, under a shared lock for gets and an
//! exclusive lock for puts. `sync_local`/`sync_global` flush outstanding
//! transfers and, for puts, release the lock.

use crate::transport::{LockKind, SharedRegion, Transport, WinId};
use abi::{NodeId, RdmaHandle, RdmaOp, Tag, NO_NODE};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Uninit,
    Created,
    Locked,
    Unlocked,
}

pub struct Channel {
    pub handle: RdmaHandle,
    pub op: RdmaOp,
    pub target: NodeId,
    pub non_target: NodeId,
    is_target: bool,
    pub tag: Tag,
    win: WinId,
    state: ChannelState,
    locked: bool,
    pub num_bytes: usize,
}

impl Channel {
    /// Collectively builds the channel: both endpoints must call with the
    /// same handle, op, peer pair, and pre-agreed tag. The target passes
    /// its region; the non-target passes `None`.
    pub(crate) fn create(
        transport: &mut dyn Transport,
        handle: RdmaHandle,
        op: RdmaOp,
        non_target: NodeId,
        tag: Tag,
        region: Option<SharedRegion>,
        num_bytes: usize,
    ) -> Self {
        let target = handle.node();
        let my_node = transport.rank();
        let is_target = my_node == target;
        require!(
            is_target || my_node == non_target,
            "channel endpoint is neither target nor non-target",
            target = target,
            non_target = non_target,
            my_node = my_node,
        );
        require!(
            non_target != NO_NODE && non_target != target,
            "channel requires two distinct endpoints",
            target = target,
            non_target = non_target,
        );
        require!(
            matches!(op, RdmaOp::Get | RdmaOp::Put),
            "channel op type must be get or put",
            op = op,
        );

        let group = crate::fail::transport_ok(
            transport.group_from_ranks(&[target, non_target]),
            "channel group",
        );
        let comm = crate::fail::transport_ok(
            transport.comm_create_group(group, tag),
            "channel comm",
        );
        let win = crate::fail::transport_ok(
            transport.win_create(comm, if is_target { region } else { None }),
            "channel window",
        );

        Self {
            handle,
            op,
            target,
            non_target,
            is_target,
            tag,
            win,
            state: ChannelState::Created,
            locked: false,
            num_bytes,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    fn lock_for_op(&mut self, transport: &mut dyn Transport) {
        require!(
            self.state != ChannelState::Uninit,
            "channel used before initialization",
        );
        require!(
            !self.is_target,
            "the target cannot drive this channel",
            target = self.target,
        );
        if self.locked {
            return;
        }
        let kind = match self.op {
            RdmaOp::Put => LockKind::Exclusive,
            _ => LockKind::Shared,
        };
        crate::fail::transport_ok(
            transport.win_lock(self.win, self.target, kind),
            "channel lock",
        );
        self.locked = true;
        self.state = ChannelState::Locked;
    }

    fn unlock_for_op(&mut self, transport: &mut dyn Transport) {
        if !self.locked {
            return;
        }
        crate::fail::transport_ok(
            transport.win_unlock(self.win, self.target),
            "channel unlock",
        );
        self.locked = false;
        self.state = ChannelState::Unlocked;
    }

    /// One-sided put of `data` into the target region at `offset`. Put
    /// channels only.
    pub(crate) fn write_data(
        &mut self,
        transport: &mut dyn Transport,
        data: &[u8],
        offset: usize,
    ) {
        require!(
            self.op == RdmaOp::Put,
            "write on a non-put channel",
            op = self.op,
        );
        self.lock_for_op(transport);
        crate::fail::transport_ok(
            transport.put(self.win, self.target, offset, data),
            "channel put",
        );
    }

    /// One-sided read from the target region at `offset` into `buf`. Get
    /// channels only.
    pub(crate) fn read_data(
        &mut self,
        transport: &mut dyn Transport,
        buf: &mut [u8],
        offset: usize,
    ) {
        require!(
            self.op == RdmaOp::Get,
            "read on a non-get channel",
            op = self.op,
        );
        self.lock_for_op(transport);
        crate::fail::transport_ok(
            transport.get(self.win, self.target, offset, buf),
            "channel get",
        );
    }

    /// Completes outstanding transfers at the origin. Releases the lock
    /// for put channels.
    pub(crate) fn sync_local(&mut self, transport: &mut dyn Transport) {
        if !self.locked {
            self.lock_for_op(transport);
        }
        crate::fail::transport_ok(
            transport.win_flush_local(self.win, self.target),
            "channel flush local",
        );
        if self.op == RdmaOp::Put {
            self.unlock_for_op(transport);
        }
    }

    /// Completes outstanding transfers at both ends. Releases the lock for
    /// put channels.
    pub(crate) fn sync_global(&mut self, transport: &mut dyn Transport) {
        crate::fail::transport_ok(
            transport.win_flush(self.win, self.target),
            "channel flush",
        );
        if self.op == RdmaOp::Put {
            self.unlock_for_op(transport);
        }
    }

    /// Unlocks (if held); window/group/communicator teardown follows on
    /// the transport side.
    pub(crate) fn teardown(&mut self, transport: &mut dyn Transport) {
        if self.locked {
            self.unlock_for_op(transport);
        }
        self.state = ChannelState::Uninit;
    }
}
