// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runtime trace entries, recorded into a `ringlog::RingLog`.
//!
//! The recorder is always on and bounded; tests and debuggers read it after
//! the fact. Entries are deliberately small `Copy` values.

use abi::{Epoch, EventId, NodeId, Tag};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RtEvent {
    MsgSent { dest: NodeId, handler: u16 },
    MsgDelivered { handler: u16, is_term: bool },
    BcastForwarded { children: u8 },
    EventReady { event: EventId },
    WaveUp { epoch: Epoch },
    EpochContinued { epoch: Epoch },
    EpochFinished { epoch: Epoch },
    LocationRouted { hop: NodeId },
    LocationDelivered { buffered: bool },
    LocationUpdated { node: NodeId },
    ChannelOp { target: NodeId, bytes: u32 },
    PipeTriggered { local: bool },
    SeqWaitBuffered { tag: Tag },
    SeqMatched { tag: Tag },
}
