// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transport seam.
//!
//! The runtime consumes a minimal message-passing substrate through the
//! [`Transport`] trait: non-blocking byte sends, probe/receive of
//! arbitrary-size buffers, request testing, barrier, rank/size discovery,
//! and the one-sided window operations used by the RDMA channels. Anything
//! satisfying this trait can back the runtime; an MPI binding maps each
//! method onto the obvious MPI call, and [`loopback`] provides an
//! in-process implementation used by the demos and the test suite.
//!
//! All ranks in the trait are *global* ranks, including the target rank of
//! window operations; implementations backed by subcommunicators are
//! responsible for translating.

use abi::{NodeId, Tag};
use std::sync::{Arc, Mutex};

pub mod loopback;

/// Identifies an outstanding non-blocking send.
pub type ReqId = u64;

/// Identifies a rank group built with [`Transport::group_from_ranks`].
pub type GroupId = u64;

/// Identifies a communicator built with [`Transport::comm_create_group`].
pub type CommId = u64;

/// Identifies a one-sided window built with [`Transport::win_create`].
pub type WinId = u64;

/// Memory exposed through a one-sided window. Shared so the transport can
/// service remote puts/gets while the owner retains access between syncs.
pub type SharedRegion = Arc<Mutex<Vec<u8>>>;

/// Result of a successful probe: a message is waiting.
#[derive(Copy, Clone, Debug)]
pub struct Probe {
    pub source: NodeId,
    pub tag: Tag,
    pub bytes: usize,
}

/// Window lock flavor, mirroring the shared/exclusive passive-target modes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

#[derive(Clone, Debug)]
pub enum TransportError {
    /// A rank argument did not name a live rank.
    BadRank(NodeId),
    /// A request, group, communicator, or window id was not live.
    BadHandle(u64),
    /// A window operation violated the lock protocol.
    LockProtocol(&'static str),
    /// A window access fell outside the exposed region.
    OutOfRegion { offset: usize, len: usize, region: usize },
    /// Receive posted with a buffer that does not match the probed message.
    RecvMismatch,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRank(r) => write!(f, "bad rank {r}"),
            Self::BadHandle(h) => write!(f, "bad handle {h}"),
            Self::LockProtocol(m) => write!(f, "lock protocol: {m}"),
            Self::OutOfRegion { offset, len, region } => write!(
                f,
                "window access [{offset}, +{len}) outside region of {region} \
                 bytes"
            ),
            Self::RecvMismatch => write!(f, "recv does not match probe"),
        }
    }
}

/// The substrate the runtime runs on.
pub trait Transport {
    /// This process's rank.
    fn rank(&self) -> NodeId;

    /// Number of ranks in the job.
    fn size(&self) -> NodeId;

    /// Collective barrier over all ranks.
    fn barrier(&mut self) -> Result<(), TransportError>;

    /// Starts a non-blocking send of `buf` to `dest`. The returned request
    /// completes (per [`Transport::test`]) once `buf` may be reused.
    fn isend(
        &mut self,
        dest: NodeId,
        tag: Tag,
        buf: &[u8],
    ) -> Result<ReqId, TransportError>;

    /// Probes for a message from any source with any tag, without
    /// receiving it. The reported byte count is exact.
    fn iprobe(&mut self) -> Result<Option<Probe>, TransportError>;

    /// Receives the probed message into `buf`, which must be exactly the
    /// probed length.
    fn recv(
        &mut self,
        source: NodeId,
        tag: Tag,
        buf: &mut [u8],
    ) -> Result<(), TransportError>;

    /// Tests a send request for completion. Once a request has completed it
    /// stays completed.
    fn test(&mut self, req: ReqId) -> Result<bool, TransportError>;

    /// Builds a group from an ordered rank list.
    fn group_from_ranks(
        &mut self,
        ranks: &[NodeId],
    ) -> Result<GroupId, TransportError>;

    /// Collectively creates a communicator over `group`, disambiguated by
    /// `tag`. Every member rank must make this call with the same
    /// arguments.
    fn comm_create_group(
        &mut self,
        group: GroupId,
        tag: Tag,
    ) -> Result<CommId, TransportError>;

    /// Collectively creates a one-sided window over `comm`. Ranks exposing
    /// memory pass their region; ranks that only access remotely pass
    /// `None`.
    fn win_create(
        &mut self,
        comm: CommId,
        region: Option<SharedRegion>,
    ) -> Result<WinId, TransportError>;

    fn win_lock(
        &mut self,
        win: WinId,
        target: NodeId,
        kind: LockKind,
    ) -> Result<(), TransportError>;

    fn win_unlock(
        &mut self,
        win: WinId,
        target: NodeId,
    ) -> Result<(), TransportError>;

    /// Completes outstanding operations on `target` at both origin and
    /// target.
    fn win_flush(
        &mut self,
        win: WinId,
        target: NodeId,
    ) -> Result<(), TransportError>;

    /// Completes outstanding operations locally at the origin.
    fn win_flush_local(
        &mut self,
        win: WinId,
        target: NodeId,
    ) -> Result<(), TransportError>;

    /// One-sided write of `data` into `target`'s window at `offset`.
    /// Requires the window to be locked at `target`.
    fn put(
        &mut self,
        win: WinId,
        target: NodeId,
        offset: usize,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// One-sided read from `target`'s window at `offset` into `data`.
    /// Requires the window to be locked at `target`.
    fn get(
        &mut self,
        win: WinId,
        target: NodeId,
        offset: usize,
        data: &mut [u8],
    ) -> Result<(), TransportError>;
}
