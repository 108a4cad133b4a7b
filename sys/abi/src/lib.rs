// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire ABI definitions, shared between every rank of the runtime.
//!
//! Everything in this crate is either a value that crosses the transport
//! verbatim (the [`Envelope`], the bit-packed identifiers) or a sentinel that
//! both sides of a conversation must agree on. The layouts here are load
//! bearing: an [`Envelope`] is reinterpreted in place from the front of every
//! received buffer, and the packed identifiers are routed between ranks, so
//! changing a field width here is an ABI break with every peer.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Identifies a rank. Small signed integer so that `-1` can serve as the
/// "no node" sentinel, matching the wire representation in the envelope.
pub type NodeId = i16;

/// Sentinel for an unset destination / unknown node.
pub const NO_NODE: NodeId = -1;

/// Logical scope over which termination is detected independently.
pub type Epoch = i32;

/// Sentinel: message or operation not associated with any epoch.
pub const NO_EPOCH: Epoch = -1;

/// Distinguished epoch naming the process-wide detector state that every
/// produce/consume also feeds, regardless of the epoch it names.
pub const ANY_EPOCH: Epoch = -2;

/// First epoch handed out by `new_epoch`.
pub const FIRST_EPOCH: Epoch = 1;

/// Message tag. `-1` means untagged.
pub type Tag = i32;

/// Sentinel for an untagged message or wait.
pub const NO_TAG: Tag = -1;

/// Identifies a migratable entity managed by the location coordinator.
pub type EntityId = u64;

/// Identifies one sequence owned by the sequencer.
pub type SeqId = u32;

/// Names a registered active-message handler.
///
/// A `HandlerId` combines two fields: a handler index (the slot in the
/// registry, which is identical on every rank because registration is
/// collective and ordered) and a node slot used by per-node registrations.
/// Collective registrations carry the all-ones node slot, so they are
/// routable on any rank.
///
/// The index is in the lower `HandlerId::INDEX_BITS` bits, the node slot in
/// the remaining top bits. The whole value must fit the 16-bit handler field
/// of the [`Envelope`].
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub struct HandlerId(pub u16);

impl HandlerId {
    /// The all-ones `HandlerId` is reserved to mean "no handler."
    pub const NONE: Self = Self(!0);

    /// Number of bits used for the registry index. The rest is the node
    /// slot.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Node slot value used by collective registrations.
    pub const COLLECTIVE_NODE: u16 = (1 << (16 - Self::INDEX_BITS)) - 1;

    /// Fabricates a `HandlerId` for a collectively-registered slot.
    pub const fn for_index(index: usize) -> Self {
        Self::for_node_and_index(Self::COLLECTIVE_NODE, index)
    }

    /// Fabricates a `HandlerId` with an explicit node slot.
    pub const fn for_node_and_index(node: u16, index: usize) -> Self {
        HandlerId(
            (index as u16 & Self::INDEX_MASK) | (node << Self::INDEX_BITS),
        )
    }

    /// Extracts the registry index of this id.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the node slot of this id.
    pub fn node_slot(&self) -> u16 {
        self.0 >> Self::INDEX_BITS
    }

    /// On-wire form, for stuffing into the envelope's `handler` field.
    pub fn to_wire(self) -> i16 {
        self.0 as i16
    }

    /// Reconstructs from the envelope's `handler` field.
    pub fn from_wire(raw: i16) -> Self {
        HandlerId(raw as u16)
    }
}

/// Names an event. Globally routable: the high `EventId::NODE_BITS` bits
/// carry the owning rank, the low bits a per-rank monotonic counter, so any
/// rank can tell at a glance whether an event is local.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub struct EventId(pub u64);

impl EventId {
    /// Sentinel returned by operations that completed without creating an
    /// event (for example, a broadcast with no children in range). Its
    /// owning-node field decodes to `NO_NODE`.
    pub const NONE: Self = Self(!0);

    /// Number of bits carrying the owning rank.
    pub const NODE_BITS: u32 = 16;

    const COUNTER_BITS: u32 = 64 - Self::NODE_BITS;

    /// Fabricates an `EventId` from an owning rank and a local counter
    /// value.
    pub const fn for_node_and_seq(node: NodeId, seq: u64) -> Self {
        EventId(
            ((node as u16 as u64) << Self::COUNTER_BITS)
                | (seq & ((1 << Self::COUNTER_BITS) - 1)),
        )
    }

    /// Extracts the owning rank.
    pub fn owning_node(&self) -> NodeId {
        (self.0 >> Self::COUNTER_BITS) as u16 as i16
    }

    /// Extracts the per-rank counter portion.
    pub fn seq(&self) -> u64 {
        self.0 & ((1 << Self::COUNTER_BITS) - 1)
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

/// Names a pipe: a process-addressable sink for callback triggers. Same
/// owning-node encoding as [`EventId`].
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub struct PipeId(pub u64);

impl PipeId {
    pub const NONE: Self = Self(!0);

    pub const NODE_BITS: u32 = 16;

    const COUNTER_BITS: u32 = 64 - Self::NODE_BITS;

    pub const fn for_node_and_seq(node: NodeId, seq: u64) -> Self {
        PipeId(
            ((node as u16 as u64) << Self::COUNTER_BITS)
                | (seq & ((1 << Self::COUNTER_BITS) - 1)),
        )
    }

    pub fn owning_node(&self) -> NodeId {
        (self.0 >> Self::COUNTER_BITS) as u16 as i16
    }
}

/// Indicates priority of a runnable piece of work.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important. Termination-protocol work runs at
/// [`SYS_MIN_PRIORITY`] so it can never starve user work.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Least important priority in the system.
pub const SYS_MIN_PRIORITY: Priority = Priority(u8::MAX);

/// Default priority for user work.
pub const SYS_DEFAULT_PRIORITY: Priority = Priority(127);

bitflags::bitflags! {
    /// Flag bits carried in the envelope's 16-bit `flags` field.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct EnvelopeFlags: u16 {
        /// Termination-protocol message: excluded from detector accounting.
        const IS_TERM = 1 << 0;
        /// In flight as part of a spanning-tree broadcast.
        const IS_BCAST = 1 << 1;
        /// Payload was produced by a serializer rather than a byte copy.
        const HAS_BEEN_SERIALIZED = 1 << 2;
        /// Routed through the location coordinator.
        const IS_LOCATION = 1 << 3;
        /// Addressed to a pipe; the `group` field carries the pipe id.
        const IS_PIPE = 1 << 4;
        /// Broadcast also delivers on the originating rank.
        const DELIVER_TO_SENDER = 1 << 5;
    }
}

/// Fixed header at the front of every byte buffer on the wire.
///
/// Exactly 24 bytes, packed, little-endian on the platforms we run on. The
/// receive path reinterprets the prefix of the probed buffer as this struct,
/// so field order and widths are frozen (see the crate docs).
///
/// Fields are accessed by value only; the struct is packed, so references to
/// fields would be unaligned.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C, packed)]
pub struct Envelope {
    /// Destination rank, or `NO_NODE` for a spanning-tree broadcast.
    pub dest: i16,
    /// Wire form of the [`HandlerId`] to invoke on delivery.
    pub handler: i16,
    /// Epoch this message is accounted against, or `NO_EPOCH`.
    pub epoch: Epoch,
    /// Message tag, or `NO_TAG`.
    pub tag: Tag,
    /// Bit union of [`EnvelopeFlags`].
    pub flags: u16,
    /// Originating rank of a tree broadcast; `NO_NODE` until set.
    pub broadcast_root: i16,
    /// Group/pipe discriminator. Carries the [`PipeId`] when `IS_PIPE` is
    /// set; zero otherwise.
    pub group: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Envelope>(), 24);

/// Number of bytes of envelope prefixed to every message.
pub const ENVELOPE_SIZE: usize = core::mem::size_of::<Envelope>();

impl Envelope {
    /// Makes a fresh envelope for a direct send. Flags start empty and the
    /// broadcast root unset.
    pub fn new(dest: NodeId, handler: HandlerId, epoch: Epoch, tag: Tag) -> Self {
        Self {
            dest,
            handler: handler.to_wire(),
            epoch,
            tag,
            flags: EnvelopeFlags::empty().bits(),
            broadcast_root: NO_NODE,
            group: 0,
        }
    }

    pub fn handler_id(&self) -> HandlerId {
        HandlerId::from_wire(self.handler)
    }

    pub fn get_flags(&self) -> EnvelopeFlags {
        EnvelopeFlags::from_bits_truncate(self.flags)
    }

    pub fn set_flag(&mut self, flag: EnvelopeFlags) {
        self.flags |= flag.bits();
    }

    pub fn clear_flag(&mut self, flag: EnvelopeFlags) {
        self.flags &= !flag.bits();
    }

    pub fn is_term(&self) -> bool {
        self.get_flags().contains(EnvelopeFlags::IS_TERM)
    }

    pub fn is_bcast(&self) -> bool {
        self.get_flags().contains(EnvelopeFlags::IS_BCAST)
    }

    pub fn is_pipe(&self) -> bool {
        self.get_flags().contains(EnvelopeFlags::IS_PIPE)
    }

    pub fn pipe_id(&self) -> PipeId {
        PipeId(self.group)
    }
}

/// One-sided data-plane operation direction, stored in the 4-bit op-type
/// field of an [`RdmaHandle`].
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum RdmaOp {
    Uninitialized = 0,
    Get = 1,
    Put = 2,
    GetOrPut = 3,
}

impl RdmaOp {
    fn from_bits(bits: u64) -> Self {
        match bits {
            1 => RdmaOp::Get,
            2 => RdmaOp::Put,
            3 => RdmaOp::GetOrPut,
            _ => RdmaOp::Uninitialized,
        }
    }
}

/// Identifier allocated per registered RDMA region on its owning rank.
pub type RdmaIdentifier = u32;

/// Bit-packed universal id for an RDMA-registered region.
///
/// Layout, LSB upward: `sized:1, collective:1, is_handler:1, op_type:4,
/// identifier:32, node:16, reserved:9`. The home node and identifier fields
/// are immutable once the handle is fabricated; the flag bits describe the
/// registration and travel with the handle.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub struct RdmaHandle(pub u64);

impl RdmaHandle {
    pub const NONE: Self = Self(!0);

    const SIZED_BIT: u32 = 0;
    const COLLECTIVE_BIT: u32 = 1;
    const HANDLER_BIT: u32 = 2;
    const OP_SHIFT: u32 = 3;
    const OP_BITS: u32 = 4;
    const IDENT_SHIFT: u32 = Self::OP_SHIFT + Self::OP_BITS;
    const IDENT_BITS: u32 = 32;
    const NODE_SHIFT: u32 = Self::IDENT_SHIFT + Self::IDENT_BITS;
    const NODE_BITS: u32 = 16;

    /// Fabricates a handle. This is the only way to set the node and
    /// identifier fields.
    pub fn for_node_and_identifier(
        node: NodeId,
        identifier: RdmaIdentifier,
        sized: bool,
        collective: bool,
    ) -> Self {
        let mut bits = 0u64;
        bits |= (sized as u64) << Self::SIZED_BIT;
        bits |= (collective as u64) << Self::COLLECTIVE_BIT;
        bits |= (identifier as u64) << Self::IDENT_SHIFT;
        bits |= (node as u16 as u64) << Self::NODE_SHIFT;
        RdmaHandle(bits)
    }

    pub fn node(&self) -> NodeId {
        ((self.0 >> Self::NODE_SHIFT) & ((1 << Self::NODE_BITS) - 1)) as u16
            as i16
    }

    pub fn identifier(&self) -> RdmaIdentifier {
        ((self.0 >> Self::IDENT_SHIFT) & ((1 << Self::IDENT_BITS) - 1)) as u32
    }

    pub fn is_sized(&self) -> bool {
        (self.0 >> Self::SIZED_BIT) & 1 == 1
    }

    pub fn is_collective(&self) -> bool {
        (self.0 >> Self::COLLECTIVE_BIT) & 1 == 1
    }

    pub fn is_handler(&self) -> bool {
        (self.0 >> Self::HANDLER_BIT) & 1 == 1
    }

    pub fn set_is_handler(&mut self, v: bool) {
        self.0 = (self.0 & !(1 << Self::HANDLER_BIT))
            | ((v as u64) << Self::HANDLER_BIT);
    }

    pub fn op_type(&self) -> RdmaOp {
        RdmaOp::from_bits((self.0 >> Self::OP_SHIFT) & ((1 << Self::OP_BITS) - 1))
    }

    pub fn set_op_type(&mut self, op: RdmaOp) {
        let mask = ((1u64 << Self::OP_BITS) - 1) << Self::OP_SHIFT;
        self.0 = (self.0 & !mask) | ((op as u64) << Self::OP_SHIFT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use zerocopy::{FromBytes, IntoBytes};

    #[test]
    fn envelope_layout_is_frozen() {
        let mut env = Envelope::new(3, HandlerId::for_index(7), 1, 42);
        env.set_flag(EnvelopeFlags::IS_BCAST);
        env.broadcast_root = 2;

        let bytes = env.as_bytes();
        assert_eq!(bytes.len(), 24);
        // dest, little-endian
        assert_eq!(&bytes[0..2], &3i16.to_le_bytes());
        // tag at offset 8
        assert_eq!(&bytes[8..12], &42i32.to_le_bytes());
        // broadcast_root at offset 14
        assert_eq!(&bytes[14..16], &2i16.to_le_bytes());

        let back = Envelope::read_from_bytes(bytes).unwrap();
        let dest = back.dest;
        assert_eq!(dest, 3);
        assert_eq!(back.handler_id(), HandlerId::for_index(7));
        assert!(back.is_bcast());
        assert!(!back.is_term());
    }

    #[test]
    fn handler_id_round_trips_through_wire_form() {
        let han = HandlerId::for_index(19);
        assert_eq!(han.index(), 19);
        assert_eq!(han.node_slot(), HandlerId::COLLECTIVE_NODE);
        assert_eq!(HandlerId::from_wire(han.to_wire()), han);

        let per_node = HandlerId::for_node_and_index(5, 19);
        assert_eq!(per_node.index(), 19);
        assert_eq!(per_node.node_slot(), 5);
    }

    #[test]
    fn event_id_none_is_owned_by_no_node() {
        assert_eq!(EventId::NONE.owning_node(), NO_NODE);
        assert!(EventId::NONE.is_none());
    }

    proptest! {
        #[test]
        fn event_id_fields_round_trip(node in 0i16..1024, seq in 0u64..(1 << 40)) {
            let id = EventId::for_node_and_seq(node, seq);
            prop_assert_eq!(id.owning_node(), node);
            prop_assert_eq!(id.seq(), seq);
        }

        #[test]
        fn rdma_handle_fields_round_trip(
            node in 0i16..1024,
            ident in any::<u32>(),
            sized in any::<bool>(),
            collective in any::<bool>(),
        ) {
            let mut h = RdmaHandle::for_node_and_identifier(
                node, ident, sized, collective,
            );
            h.set_op_type(RdmaOp::Get);
            h.set_is_handler(true);
            prop_assert_eq!(h.node(), node);
            prop_assert_eq!(h.identifier(), ident);
            prop_assert_eq!(h.is_sized(), sized);
            prop_assert_eq!(h.is_collective(), collective);
            prop_assert_eq!(h.op_type(), RdmaOp::Get);
            prop_assert!(h.is_handler());

            // op type is mutable without disturbing identity
            h.set_op_type(RdmaOp::Put);
            prop_assert_eq!(h.node(), node);
            prop_assert_eq!(h.identifier(), ident);
        }
    }
}
