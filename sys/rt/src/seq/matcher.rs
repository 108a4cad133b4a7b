// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wait/trigger matching.
//!
//! Per trigger slot (handler id), two pairs of containers: buffered
//! unmatched messages and buffered unmatched actions, each split into an
//! untagged queue and tagged queues. Waits and arrivals are symmetric:
//! each first looks for a match in the other's container and buffers
//! itself otherwise. Matching within a queue is FIFO, so concurrent waits
//! pair with arrivals in registration order. Tagged entries never match
//! untagged ones.

use super::node::NodeRef;
use crate::message::Message;
use crate::Runtime;
use abi::{SeqId, Tag, NO_TAG};
use std::collections::{HashMap, VecDeque};

/// A buffered wait: where to resume and what to run on the match.
pub(crate) struct SeqAction {
    pub seq_id: SeqId,
    pub node: NodeRef,
    pub trigger: Box<dyn FnOnce(&mut Runtime, Message)>,
}

#[derive(Default)]
pub(crate) struct MatchState {
    msgs: VecDeque<Vec<u8>>,
    msgs_tagged: HashMap<Tag, VecDeque<Vec<u8>>>,
    actions: VecDeque<SeqAction>,
    actions_tagged: HashMap<Tag, VecDeque<SeqAction>>,
}

impl MatchState {
    pub fn take_msg(&mut self, tag: Tag) -> Option<Vec<u8>> {
        if tag == NO_TAG {
            self.msgs.pop_front()
        } else {
            let q = self.msgs_tagged.get_mut(&tag)?;
            let m = q.pop_front();
            if q.is_empty() {
                self.msgs_tagged.remove(&tag);
            }
            m
        }
    }

    pub fn buffer_msg(&mut self, tag: Tag, bytes: Vec<u8>) {
        if tag == NO_TAG {
            self.msgs.push_back(bytes);
        } else {
            self.msgs_tagged.entry(tag).or_default().push_back(bytes);
        }
    }

    pub fn take_action(&mut self, tag: Tag) -> Option<SeqAction> {
        if tag == NO_TAG {
            self.actions.pop_front()
        } else {
            let q = self.actions_tagged.get_mut(&tag)?;
            let a = q.pop_front();
            if q.is_empty() {
                self.actions_tagged.remove(&tag);
            }
            a
        }
    }

    pub fn buffer_action(&mut self, tag: Tag, action: SeqAction) {
        if tag == NO_TAG {
            self.actions.push_back(action);
        } else {
            self.actions_tagged.entry(tag).or_default().push_back(action);
        }
    }

    pub fn has_action_for_seq(&self, seq_id: SeqId) -> bool {
        self.actions.iter().any(|a| a.seq_id == seq_id)
            || self
                .actions_tagged
                .values()
                .any(|q| q.iter().any(|a| a.seq_id == seq_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_and_untagged_do_not_mix() {
        let mut m = MatchState::default();
        m.buffer_msg(NO_TAG, vec![1]);
        assert!(m.take_msg(5).is_none());
        assert_eq!(m.take_msg(NO_TAG), Some(vec![1]));
    }

    #[test]
    fn matching_is_fifo_within_a_tag() {
        let mut m = MatchState::default();
        m.buffer_msg(5, vec![1]);
        m.buffer_msg(5, vec![2]);
        assert_eq!(m.take_msg(5), Some(vec![1]));
        assert_eq!(m.take_msg(5), Some(vec![2]));
        assert!(m.take_msg(5).is_none());
    }
}
