// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message buffers and the send-side allocation pool.
//!
//! A message is one contiguous byte buffer: a fixed 24-byte [`Envelope`]
//! followed by the payload. The receive path allocates a buffer of exactly
//! the probed length (the probe count is a `usize`; messages are not
//! limited to what a narrow count type can express) and reinterprets the
//! prefix in place. The send path draws fixed-size blocks from a small
//! pool; payloads that don't fit a block fall back to exact-size heap
//! allocation.
//!
//! Structured payloads are encoded with `ssmarshal`, which only handles
//! types of statically-bounded size; anything variable-length travels as a
//! fixed header followed by raw trailing bytes, the same shape as the
//! envelope itself. A payload that fails to encode or decode is a fatal
//! contract violation: senders must declare byte-copyable or
//! fully-serializable intent, and a mismatch is a bug, not an input error.

use crate::fail;
use abi::{Envelope, ENVELOPE_SIZE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use zerocopy::{FromBytes, IntoBytes};

/// Scratch ceiling for one `ssmarshal`-encoded record. Protocol records are
/// small fixed-size structs; anything bigger must use the header+bytes
/// shape.
pub const MAX_RECORD_SIZE: usize = 512;

/// An owned message: envelope plus payload in one buffer.
pub struct Message {
    buf: Vec<u8>,
}

impl Message {
    /// Builds a message from an envelope and raw payload bytes.
    pub fn from_parts(env: Envelope, payload: &[u8], pool: &mut MsgPool) -> Self {
        let mut buf = pool.alloc(ENVELOPE_SIZE + payload.len());
        buf[..ENVELOPE_SIZE].copy_from_slice(env.as_bytes());
        buf[ENVELOPE_SIZE..].copy_from_slice(payload);
        Self { buf }
    }

    /// Builds a message whose payload is an encoded record followed by raw
    /// trailing bytes (possibly empty).
    pub fn from_record<T: Serialize>(
        env: Envelope,
        record: &T,
        trailing: &[u8],
        pool: &mut MsgPool,
    ) -> Self {
        let mut scratch = [0u8; MAX_RECORD_SIZE];
        let n = match ssmarshal::serialize(&mut scratch, record) {
            Ok(n) => n,
            Err(e) => fail::die(format_args!("message encode failed: {e}")),
        };
        let mut buf = pool.alloc(ENVELOPE_SIZE + n + trailing.len());
        buf[..ENVELOPE_SIZE].copy_from_slice(env.as_bytes());
        buf[ENVELOPE_SIZE..ENVELOPE_SIZE + n].copy_from_slice(&scratch[..n]);
        buf[ENVELOPE_SIZE + n..].copy_from_slice(trailing);
        Self { buf }
    }

    /// Adopts a buffer received off the wire. The buffer must at least hold
    /// an envelope.
    pub fn from_wire(buf: Vec<u8>) -> Self {
        require!(
            buf.len() >= ENVELOPE_SIZE,
            "received runt message",
            bytes = buf.len(),
        );
        Self { buf }
    }

    /// Copies the envelope out of the buffer prefix.
    pub fn envelope(&self) -> Envelope {
        // Infallible: length was checked at construction.
        let (env, _) = Envelope::read_from_prefix(&self.buf).unwrap();
        env
    }

    /// Rewrites the envelope prefix in place.
    pub fn set_envelope(&mut self, env: Envelope) {
        self.buf[..ENVELOPE_SIZE].copy_from_slice(env.as_bytes());
    }

    /// The payload after the envelope.
    pub fn payload(&self) -> &[u8] {
        &self.buf[ENVELOPE_SIZE..]
    }

    /// Decodes the payload as one record with no trailing bytes.
    pub fn decode<T: DeserializeOwned>(&self) -> T {
        self.decode_prefix::<T>().0
    }

    /// Decodes a leading record, returning it with the trailing bytes.
    pub fn decode_prefix<T: DeserializeOwned>(&self) -> (T, &[u8]) {
        match ssmarshal::deserialize(self.payload()) {
            Ok((v, used)) => (v, &self.payload()[used..]),
            Err(e) => fail::die(format_args!("message decode failed: {e}")),
        }
    }

    /// The whole wire image (envelope + payload).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Releases the buffer back to the pool.
    pub fn release(self, pool: &mut MsgPool) {
        pool.release(self.buf);
    }
}

/// Fixed-block send-side allocation pool.
///
/// Blocks are all `block_size` bytes; at most `max_free` are retained
/// between uses. Requests larger than a block are served by the heap
/// directly.
pub struct MsgPool {
    free: Vec<Vec<u8>>,
    block_size: usize,
    max_free: usize,
}

impl MsgPool {
    pub fn new(block_size: usize, max_free: usize) -> Self {
        Self {
            free: Vec::new(),
            block_size,
            max_free,
        }
    }

    /// Returns a zero-filled buffer of exactly `len` bytes.
    pub fn alloc(&mut self, len: usize) -> Vec<u8> {
        if len <= self.block_size {
            if let Some(mut b) = self.free.pop() {
                b.clear();
                b.resize(len, 0);
                return b;
            }
            let mut b = Vec::with_capacity(self.block_size);
            b.resize(len, 0);
            return b;
        }
        vec![0; len]
    }

    pub fn release(&mut self, buf: Vec<u8>) {
        if buf.capacity() >= self.block_size && self.free.len() < self.max_free {
            self.free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{EnvelopeFlags, HandlerId, NO_TAG};
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping {
        seq: u64,
    }

    fn pool() -> MsgPool {
        MsgPool::new(256, 4)
    }

    #[test]
    fn record_round_trips_with_trailing_bytes() {
        let mut pool = pool();
        let env = Envelope::new(1, HandlerId::for_index(0), -1, NO_TAG);
        let msg =
            Message::from_record(env, &Ping { seq: 7 }, b"extra", &mut pool);

        let rx = Message::from_wire(msg.as_bytes().to_vec());
        let dest = rx.envelope().dest;
        assert_eq!(dest, 1);
        let (ping, rest) = rx.decode_prefix::<Ping>();
        assert_eq!(ping, Ping { seq: 7 });
        assert_eq!(rest, b"extra");
    }

    #[test]
    fn envelope_rewrite_in_place() {
        let mut pool = pool();
        let env = Envelope::new(0, HandlerId::for_index(0), -1, NO_TAG);
        let mut msg = Message::from_parts(env, &[], &mut pool);

        let mut env = msg.envelope();
        env.set_flag(EnvelopeFlags::IS_BCAST);
        env.broadcast_root = 3;
        msg.set_envelope(env);

        assert!(msg.envelope().is_bcast());
        let broadcast_root = msg.envelope().broadcast_root;
        assert_eq!(broadcast_root, 3);
    }

    #[test]
    #[should_panic(expected = "received runt message")]
    fn runt_wire_buffer_is_fatal() {
        Message::from_wire(vec![0; 10]);
    }

    #[test]
    fn pool_reuses_blocks() {
        let mut pool = pool();
        let a = pool.alloc(100);
        let ptr = a.as_ptr() as usize;
        pool.release(a);
        let b = pool.alloc(50);
        assert_eq!(b.len(), 50);
        assert_eq!(b.as_ptr() as usize, ptr);

        // Oversize requests bypass the pool.
        let big = pool.alloc(10_000);
        assert_eq!(big.len(), 10_000);
    }
}
