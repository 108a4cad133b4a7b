// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Region walking for collectively-registered handles.
//!
//! The placement policy lives outside the runtime: the group only consumes
//! a [`RegionMap`] exposing block → node and element → (block, lo, hi).
//! Walking a span of elements yields one visit per contiguous per-block
//! subspan, which the manager turns into per-node transfers.

use abi::{NodeId, RdmaHandle};

/// Placement policy supplied by the collection layer.
pub trait RegionMap {
    /// Rank holding `block`.
    fn block_node(&self, block: usize) -> NodeId;

    /// Block containing `elm`, with the block's element range `[lo, hi)`.
    fn element_block(&self, elm: usize) -> (usize, usize, usize);
}

pub struct RdmaGroup {
    pub handle: RdmaHandle,
    pub num_blocks: usize,
    pub elm_size: usize,
    map: Box<dyn RegionMap>,
}

impl RdmaGroup {
    pub fn new(
        handle: RdmaHandle,
        num_blocks: usize,
        elm_size: usize,
        map: Box<dyn RegionMap>,
    ) -> Self {
        require!(
            handle.is_collective(),
            "rdma group over a non-collective handle",
            handle = handle,
        );
        Self {
            handle,
            num_blocks,
            elm_size,
            map,
        }
    }

    /// Visits each contiguous per-block subspan of `[lo, hi)`, in element
    /// order, as `(node, block, span_lo, span_hi)`.
    pub fn walk_region(
        &self,
        lo: usize,
        hi: usize,
        mut visit: impl FnMut(NodeId, usize, usize, usize),
    ) {
        require!(lo <= hi, "inverted region walk", lo = lo, hi = hi);
        let mut cur = lo;
        while cur < hi {
            let (block, blk_lo, blk_hi) = self.map.element_block(cur);
            require!(
                blk_lo <= cur && cur < blk_hi,
                "region map returned a block not containing the element",
                elm = cur,
                blk_lo = blk_lo,
                blk_hi = blk_hi,
            );
            let span_hi = hi.min(blk_hi);
            visit(self.map.block_node(block), block, cur, span_hi);
            cur = span_hi;
        }
    }
}

/// Contiguous equal-size blocks dealt round-robin over ranks. Handy for
/// tests and as a reference policy.
pub struct UniformMap {
    pub num_elems: usize,
    pub block_size: usize,
    pub num_nodes: NodeId,
}

impl RegionMap for UniformMap {
    fn block_node(&self, block: usize) -> NodeId {
        (block % self.num_nodes as usize) as NodeId
    }

    fn element_block(&self, elm: usize) -> (usize, usize, usize) {
        let block = elm / self.block_size;
        let lo = block * self.block_size;
        let hi = (lo + self.block_size).min(self.num_elems);
        (block, lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> RdmaGroup {
        let handle = RdmaHandle::for_node_and_identifier(0, 1, true, true);
        RdmaGroup::new(
            handle,
            4,
            8,
            Box::new(UniformMap {
                num_elems: 40,
                block_size: 10,
                num_nodes: 2,
            }),
        )
    }

    #[test]
    fn walk_splits_on_block_boundaries() {
        let g = group();
        let mut visits = Vec::new();
        g.walk_region(5, 25, |node, block, lo, hi| {
            visits.push((node, block, lo, hi));
        });
        assert_eq!(visits, [(0, 0, 5, 10), (1, 1, 10, 20), (0, 2, 20, 25)]);
    }

    #[test]
    fn walk_within_one_block_is_one_visit() {
        let g = group();
        let mut visits = Vec::new();
        g.walk_region(11, 14, |node, block, lo, hi| {
            visits.push((node, block, lo, hi));
        });
        assert_eq!(visits, [(1, 1, 11, 14)]);
    }

    #[test]
    fn empty_walk_visits_nothing() {
        let g = group();
        g.walk_region(7, 7, |_, _, _, _| panic!("no visits expected"));
    }
}
