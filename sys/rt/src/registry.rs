// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handler registry: maps handler ids to callables.
//!
//! Registration is collective and ordered -- every rank registers the same
//! handlers in the same order during bootstrap, with a barrier after each
//! call -- so a slot index names the same function everywhere and the table
//! is read-only once the program starts messaging. Handlers are plain
//! function pointers: nothing about a handler's identity may depend on
//! rank-local state.

use crate::message::Message;
use crate::Runtime;
use abi::HandlerId;

/// An active-message handler. Invoked with the runtime and the received
/// message on the rank the envelope names.
pub type ActiveFn = fn(&mut Runtime, Message);

#[derive(Default)]
pub struct Registry {
    registered: Vec<ActiveFn>,
}

impl Registry {
    /// Appends `fn` to the table, returning its id. The caller is
    /// responsible for the collective-order discipline (see module docs).
    pub(crate) fn register(&mut self, f: ActiveFn) -> HandlerId {
        let index = self.registered.len();
        self.registered.push(f);
        HandlerId::for_index(index)
    }

    /// Looks up a handler. An unknown id is a contract violation: it means
    /// the ranks disagree about bootstrap order, and nothing good can
    /// follow.
    pub(crate) fn get(&self, han: HandlerId) -> ActiveFn {
        let index = han.index();
        require!(
            index < self.registered.len(),
            "unknown handler id",
            handler = han,
            registered = self.registered.len(),
        );
        self.registered[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: &mut Runtime, _: Message) {}
    fn nop2(_: &mut Runtime, _: Message) {}

    #[test]
    fn slots_are_dense_and_ordered() {
        let mut reg = Registry::default();
        let a = reg.register(nop);
        let b = reg.register(nop2);
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(reg.get(a) as usize, nop as usize);
        assert_eq!(reg.get(b) as usize, nop2 as usize);
    }

    #[test]
    #[should_panic(expected = "unknown handler id")]
    fn unknown_handler_is_fatal() {
        let reg = Registry::default();
        reg.get(HandlerId::for_index(3));
    }
}
