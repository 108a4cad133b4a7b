// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-handle RDMA state: the registered region, the get/put functions
//! keyed by tag, and requests parked waiting for a function.

use crate::transport::SharedRegion;
use crate::Runtime;
use abi::{EventId, NodeId, RdmaHandle, RdmaOp, Tag};
use std::collections::HashMap;
use std::rc::Rc;

/// User get function: produces the bytes answering a get request.
pub type GetFn = Rc<dyn Fn(&mut Runtime, usize, usize, Tag) -> Vec<u8>>;

/// User put function: applies the bytes of a put request.
pub type PutFn = Rc<dyn Fn(&mut Runtime, &[u8], usize, Tag)>;

pub(crate) struct PendingGet {
    pub requester: NodeId,
    pub event_back: EventId,
    pub num_bytes: usize,
    pub offset: usize,
    pub tag: Tag,
}

pub(crate) struct PendingPut {
    pub requester: NodeId,
    pub event_back: EventId,
    pub data: Vec<u8>,
    pub offset: usize,
    pub tag: Tag,
}

/// How a get/put request resolves against this state.
pub(crate) enum Resolution<F> {
    /// Run this user function.
    Func(F),
    /// Serve by copying against the registered region.
    Default,
    /// Nothing can serve this tag yet; park the request.
    Park,
}

pub struct RdmaState {
    pub handle: RdmaHandle,
    pub region: SharedRegion,
    pub num_bytes: usize,

    /// Serve requests with no matching function by copying from/into the
    /// region.
    use_default: bool,

    get_any: Option<GetFn>,
    get_tags: HashMap<Tag, GetFn>,
    put_any: Option<PutFn>,
    put_tags: HashMap<Tag, PutFn>,

    pub(crate) pending_tag_gets: HashMap<Tag, Vec<PendingGet>>,
    pub(crate) pending_tag_puts: HashMap<Tag, Vec<PendingPut>>,
}

impl RdmaState {
    pub(crate) fn new(
        handle: RdmaHandle,
        region: SharedRegion,
        num_bytes: usize,
        use_default: bool,
    ) -> Self {
        if use_default {
            require!(
                num_bytes > 0,
                "default RDMA handlers require a sized region",
                handle = handle,
            );
        }
        Self {
            handle,
            region,
            num_bytes,
            use_default,
            get_any: None,
            get_tags: HashMap::new(),
            put_any: None,
            put_tags: HashMap::new(),
            pending_tag_gets: HashMap::new(),
            pending_tag_puts: HashMap::new(),
        }
    }

    pub(crate) fn set_get_fn(&mut self, tag: Option<Tag>, f: GetFn) {
        match tag {
            None => self.get_any = Some(f),
            Some(t) => {
                self.get_tags.insert(t, f);
            }
        }
    }

    pub(crate) fn set_put_fn(&mut self, tag: Option<Tag>, f: PutFn) {
        match tag {
            None => self.put_any = Some(f),
            Some(t) => {
                self.put_tags.insert(t, f);
            }
        }
    }

    pub(crate) fn unregister(&mut self, op: RdmaOp, tag: Option<Tag>) {
        if matches!(op, RdmaOp::Get | RdmaOp::GetOrPut) {
            match tag {
                None => {
                    self.get_any = None;
                    self.use_default = false;
                }
                Some(t) => {
                    self.get_tags.remove(&t);
                }
            }
        }
        if matches!(op, RdmaOp::Put | RdmaOp::GetOrPut) {
            match tag {
                None => {
                    self.put_any = None;
                    self.use_default = false;
                }
                Some(t) => {
                    self.put_tags.remove(&t);
                }
            }
        }
    }

    /// Best-matching get resolution: exact tag, then any-tag, then the
    /// default copy handler.
    pub(crate) fn resolve_get(&self, tag: Tag) -> Resolution<GetFn> {
        if let Some(f) = self.get_tags.get(&tag) {
            return Resolution::Func(Rc::clone(f));
        }
        if let Some(f) = &self.get_any {
            return Resolution::Func(Rc::clone(f));
        }
        if self.use_default {
            return Resolution::Default;
        }
        Resolution::Park
    }

    pub(crate) fn resolve_put(&self, tag: Tag) -> Resolution<PutFn> {
        if let Some(f) = self.put_tags.get(&tag) {
            return Resolution::Func(Rc::clone(f));
        }
        if let Some(f) = &self.put_any {
            return Resolution::Func(Rc::clone(f));
        }
        if self.use_default {
            return Resolution::Default;
        }
        Resolution::Park
    }

    /// Default get: copy out of the registered region.
    pub(crate) fn default_get(&self, num_bytes: usize, offset: usize) -> Vec<u8> {
        let mem = self.region.lock().unwrap();
        let n = if num_bytes == 0 { self.num_bytes } else { num_bytes };
        require!(
            offset + n <= mem.len(),
            "rdma get outside registered region",
            offset = offset,
            bytes = n,
            region = mem.len(),
        );
        mem[offset..offset + n].to_vec()
    }

    /// Default put: copy into the registered region.
    pub(crate) fn default_put(&self, data: &[u8], offset: usize) {
        let mut mem = self.region.lock().unwrap();
        require!(
            offset + data.len() <= mem.len(),
            "rdma put outside registered region",
            offset = offset,
            bytes = data.len(),
            region = mem.len(),
        );
        mem[offset..offset + data.len()].copy_from_slice(data);
    }
}
