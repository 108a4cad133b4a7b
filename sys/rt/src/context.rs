// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process identity: who we are and how many of us there are.

use abi::NodeId;

/// Identity of this rank within the job, fixed at initialization.
#[derive(Copy, Clone, Debug)]
pub struct Context {
    node: NodeId,
    num_nodes: NodeId,
}

impl Context {
    pub(crate) fn new(node: NodeId, num_nodes: NodeId) -> Self {
        Self { node, num_nodes }
    }

    /// This rank.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Total number of ranks in the job.
    pub fn num_nodes(&self) -> NodeId {
        self.num_nodes
    }
}
