// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process transport: every rank lives in one process and messages move
//! through shared mailboxes.
//!
//! This exists for the demos and the test suite. All ranks are stepped from
//! a single thread, round-robin, which keeps every interleaving
//! deterministic while still exercising the real wire path (envelope
//! encoding, probe/receive, spanning-tree forwarding, window transfers).
//!
//! Semantics relative to a real MPI backing:
//!
//! - Sends complete immediately: the bytes are copied into the destination
//!   mailbox at `isend` time, so every request tests complete.
//! - Per-link FIFO holds because each mailbox is a queue.
//! - `barrier` is a no-op; the single-threaded driver makes collective
//!   calls in lockstep by construction.
//! - Window locks are tracked and *checked* rather than waited on: a lock
//!   acquisition that would block a real transport is reported as a lock
//!   protocol error, which the runtime treats as fatal. This turns
//!   would-be deadlocks into loud test failures.

use super::{
    CommId, GroupId, LockKind, Probe, ReqId, SharedRegion, Transport,
    TransportError, WinId,
};
use abi::{NodeId, Tag};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

struct Packet {
    source: NodeId,
    tag: Tag,
    data: Vec<u8>,
}

struct Comm {
    group_ranks: Vec<NodeId>,
    tag: Tag,
    joined: Vec<NodeId>,
}

#[derive(Default)]
struct Window {
    regions: HashMap<NodeId, SharedRegion>,
    /// Lock state per target rank: flavor plus current holders.
    locks: HashMap<NodeId, (LockKind, Vec<NodeId>)>,
}

struct Hub {
    n: NodeId,
    mailboxes: Vec<VecDeque<Packet>>,
    next_req: ReqId,
    groups: Vec<Vec<NodeId>>,
    comms: Vec<Comm>,
    windows: HashMap<WinId, Window>,
}

/// One rank's endpoint into the in-process cluster.
pub struct Loopback {
    rank: NodeId,
    hub: Arc<Mutex<Hub>>,
}

/// Builds `n` connected [`Loopback`] endpoints, one per rank.
pub fn local_cluster(n: usize) -> Vec<Loopback> {
    let hub = Arc::new(Mutex::new(Hub {
        n: n as NodeId,
        mailboxes: (0..n).map(|_| VecDeque::new()).collect(),
        next_req: 0,
        groups: Vec::new(),
        comms: Vec::new(),
        windows: HashMap::new(),
    }));
    (0..n)
        .map(|r| Loopback {
            rank: r as NodeId,
            hub: Arc::clone(&hub),
        })
        .collect()
}

impl Loopback {
    fn check_rank(&self, hub: &Hub, rank: NodeId) -> Result<(), TransportError> {
        if rank < 0 || rank >= hub.n {
            return Err(TransportError::BadRank(rank));
        }
        Ok(())
    }
}

impl Transport for Loopback {
    fn rank(&self) -> NodeId {
        self.rank
    }

    fn size(&self) -> NodeId {
        self.hub.lock().unwrap().n
    }

    fn barrier(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn isend(
        &mut self,
        dest: NodeId,
        tag: Tag,
        buf: &[u8],
    ) -> Result<ReqId, TransportError> {
        let mut hub = self.hub.lock().unwrap();
        self.check_rank(&hub, dest)?;
        let source = self.rank;
        hub.mailboxes[dest as usize].push_back(Packet {
            source,
            tag,
            data: buf.to_vec(),
        });
        let req = hub.next_req;
        hub.next_req += 1;
        Ok(req)
    }

    fn iprobe(&mut self) -> Result<Option<Probe>, TransportError> {
        let hub = self.hub.lock().unwrap();
        Ok(hub.mailboxes[self.rank as usize].front().map(|p| Probe {
            source: p.source,
            tag: p.tag,
            bytes: p.data.len(),
        }))
    }

    fn recv(
        &mut self,
        source: NodeId,
        tag: Tag,
        buf: &mut [u8],
    ) -> Result<(), TransportError> {
        let mut hub = self.hub.lock().unwrap();
        let p = hub.mailboxes[self.rank as usize]
            .pop_front()
            .ok_or(TransportError::RecvMismatch)?;
        if p.source != source || p.tag != tag || p.data.len() != buf.len() {
            return Err(TransportError::RecvMismatch);
        }
        buf.copy_from_slice(&p.data);
        Ok(())
    }

    fn test(&mut self, _req: ReqId) -> Result<bool, TransportError> {
        // Sends copy at isend time; every request is complete.
        Ok(true)
    }

    fn group_from_ranks(
        &mut self,
        ranks: &[NodeId],
    ) -> Result<GroupId, TransportError> {
        let mut hub = self.hub.lock().unwrap();
        for &r in ranks {
            self.check_rank(&hub, r)?;
        }
        hub.groups.push(ranks.to_vec());
        Ok((hub.groups.len() - 1) as GroupId)
    }

    fn comm_create_group(
        &mut self,
        group: GroupId,
        tag: Tag,
    ) -> Result<CommId, TransportError> {
        let mut hub = self.hub.lock().unwrap();
        let ranks = hub
            .groups
            .get(group as usize)
            .ok_or(TransportError::BadHandle(group))?
            .clone();

        // Collective: every member calls with an identically-populated
        // group and the same tag. The first caller creates the comm; later
        // callers join it. Matching is by (member ranks, tag) among comms
        // this rank has not yet joined.
        let me = self.rank;
        for (i, c) in hub.comms.iter_mut().enumerate() {
            if c.group_ranks == ranks
                && c.tag == tag
                && !c.joined.contains(&me)
            {
                c.joined.push(me);
                return Ok(i as CommId);
            }
        }
        hub.comms.push(Comm {
            group_ranks: ranks,
            tag,
            joined: vec![me],
        });
        Ok((hub.comms.len() - 1) as CommId)
    }

    fn win_create(
        &mut self,
        comm: CommId,
        region: Option<SharedRegion>,
    ) -> Result<WinId, TransportError> {
        let mut hub = self.hub.lock().unwrap();
        if comm as usize >= hub.comms.len() {
            return Err(TransportError::BadHandle(comm));
        }
        // One window per communicator; the window id is the comm id so all
        // members agree without extra coordination.
        let win = hub.windows.entry(comm).or_default();
        if let Some(region) = region {
            win.regions.insert(self.rank, region);
        }
        Ok(comm)
    }

    fn win_lock(
        &mut self,
        win: WinId,
        target: NodeId,
        kind: LockKind,
    ) -> Result<(), TransportError> {
        let me = self.rank;
        let mut hub = self.hub.lock().unwrap();
        let w = hub
            .windows
            .get_mut(&win)
            .ok_or(TransportError::BadHandle(win))?;
        match w.locks.get_mut(&target) {
            None => {
                w.locks.insert(target, (kind, vec![me]));
                Ok(())
            }
            Some((LockKind::Shared, holders)) if kind == LockKind::Shared => {
                holders.push(me);
                Ok(())
            }
            Some(_) => Err(TransportError::LockProtocol(
                "lock acquisition would block",
            )),
        }
    }

    fn win_unlock(
        &mut self,
        win: WinId,
        target: NodeId,
    ) -> Result<(), TransportError> {
        let me = self.rank;
        let mut hub = self.hub.lock().unwrap();
        let w = hub
            .windows
            .get_mut(&win)
            .ok_or(TransportError::BadHandle(win))?;
        let (_, holders) = w
            .locks
            .get_mut(&target)
            .ok_or(TransportError::LockProtocol("unlock while unlocked"))?;
        let before = holders.len();
        holders.retain(|h| *h != me);
        if holders.len() == before {
            return Err(TransportError::LockProtocol("unlock by non-holder"));
        }
        if holders.is_empty() {
            w.locks.remove(&target);
        }
        Ok(())
    }

    fn win_flush(
        &mut self,
        win: WinId,
        target: NodeId,
    ) -> Result<(), TransportError> {
        self.win_flush_local(win, target)
    }

    fn win_flush_local(
        &mut self,
        win: WinId,
        _target: NodeId,
    ) -> Result<(), TransportError> {
        let hub = self.hub.lock().unwrap();
        if !hub.windows.contains_key(&win) {
            return Err(TransportError::BadHandle(win));
        }
        // Transfers are synchronous here; flush has nothing left to do.
        Ok(())
    }

    fn put(
        &mut self,
        win: WinId,
        target: NodeId,
        offset: usize,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let me = self.rank;
        let hub = self.hub.lock().unwrap();
        let w = hub.windows.get(&win).ok_or(TransportError::BadHandle(win))?;
        let holds = w
            .locks
            .get(&target)
            .map(|(_, h)| h.contains(&me))
            .unwrap_or(false);
        if !holds {
            return Err(TransportError::LockProtocol("put without lock"));
        }
        let region = w
            .regions
            .get(&target)
            .ok_or(TransportError::BadRank(target))?;
        let mut mem = region.lock().unwrap();
        if offset + data.len() > mem.len() {
            return Err(TransportError::OutOfRegion {
                offset,
                len: data.len(),
                region: mem.len(),
            });
        }
        mem[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn get(
        &mut self,
        win: WinId,
        target: NodeId,
        offset: usize,
        data: &mut [u8],
    ) -> Result<(), TransportError> {
        let me = self.rank;
        let hub = self.hub.lock().unwrap();
        let w = hub.windows.get(&win).ok_or(TransportError::BadHandle(win))?;
        let holds = w
            .locks
            .get(&target)
            .map(|(_, h)| h.contains(&me))
            .unwrap_or(false);
        if !holds {
            return Err(TransportError::LockProtocol("get without lock"));
        }
        let region = w
            .regions
            .get(&target)
            .ok_or(TransportError::BadRank(target))?;
        let mem = region.lock().unwrap();
        if offset + data.len() > mem.len() {
            return Err(TransportError::OutOfRegion {
                offset,
                len: data.len(),
                region: mem.len(),
            });
        }
        data.copy_from_slice(&mem[offset..offset + data.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sends_are_fifo_per_link() {
        let mut cluster = local_cluster(2);
        let mut b = cluster.pop().unwrap();
        let mut a = cluster.pop().unwrap();

        a.isend(1, 0, b"first").unwrap();
        a.isend(1, 0, b"second").unwrap();

        let p = b.iprobe().unwrap().unwrap();
        assert_eq!((p.source, p.tag, p.bytes), (0, 0, 5));
        let mut buf = [0; 5];
        b.recv(0, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"first");

        let p = b.iprobe().unwrap().unwrap();
        assert_eq!(p.bytes, 6);
        let mut buf = [0; 6];
        b.recv(0, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"second");

        assert!(b.iprobe().unwrap().is_none());
    }

    #[test]
    fn window_put_get_round_trip() {
        let mut cluster = local_cluster(2);
        let mut t1 = cluster.pop().unwrap(); // rank 1, exposes memory
        let mut t0 = cluster.pop().unwrap(); // rank 0, accesses it

        let g0 = t0.group_from_ranks(&[1, 0]).unwrap();
        let g1 = t1.group_from_ranks(&[1, 0]).unwrap();
        let c0 = t0.comm_create_group(g0, 7).unwrap();
        let c1 = t1.comm_create_group(g1, 7).unwrap();
        assert_eq!(c0, c1);

        let region: SharedRegion = Arc::new(Mutex::new(vec![0xAB; 64]));
        let w1 = t1.win_create(c1, Some(Arc::clone(&region))).unwrap();
        let w0 = t0.win_create(c0, None).unwrap();
        assert_eq!(w0, w1);

        t0.win_lock(w0, 1, LockKind::Shared).unwrap();
        let mut buf = [0u8; 16];
        t0.get(w0, 1, 8, &mut buf).unwrap();
        assert_eq!(buf, [0xAB; 16]);
        t0.win_unlock(w0, 1).unwrap();

        t0.win_lock(w0, 1, LockKind::Exclusive).unwrap();
        t0.put(w0, 1, 0, &[1, 2, 3]).unwrap();
        t0.win_flush_local(w0, 1).unwrap();
        t0.win_unlock(w0, 1).unwrap();
        assert_eq!(&region.lock().unwrap()[..3], &[1, 2, 3]);
    }

    #[test]
    fn ops_without_lock_are_rejected() {
        let mut cluster = local_cluster(2);
        let mut t1 = cluster.pop().unwrap();
        let mut t0 = cluster.pop().unwrap();

        let g = t0.group_from_ranks(&[1, 0]).unwrap();
        let c = t0.comm_create_group(g, 3).unwrap();
        let g1 = t1.group_from_ranks(&[1, 0]).unwrap();
        let c1 = t1.comm_create_group(g1, 3).unwrap();
        t1.win_create(c1, Some(Arc::new(Mutex::new(vec![0; 8])))).unwrap();
        let w = t0.win_create(c, None).unwrap();

        assert!(matches!(
            t0.put(w, 1, 0, &[1]),
            Err(TransportError::LockProtocol(_))
        ));
    }
}
