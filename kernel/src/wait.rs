//! Fan-out sleep/wake queues. Grounded on `kernel/wait.c`: `wait_for` adds
//! the caller, clears its ready bit, and invokes the scheduler; `awaken`
//! marks every waiter ready and empties the list in one step. No FIFO
//! ordering is preserved or required -- the scheduler decides who actually
//! runs next among the now-ready processes.
//!
//! A `WaitList` stores non-owning indices into the process arena rather than
//! the C version's intrusive `hlist` of stack-allocated `struct waiter`s: the
//! arena is the one owner of every `Process`, so a wait list only ever needs
//! to name a slot, never hold or free anything (see DESIGN.md's "cyclic
//! graphs" note).

use arrayvec::ArrayVec;

use crate::kwarn;
use crate::param::NPROC;
use crate::proc::ProcIdx;

#[derive(Default)]
pub struct WaitList {
    waiters: ArrayVec<ProcIdx, NPROC>,
}

impl WaitList {
    pub const fn new() -> Self {
        Self { waiters: ArrayVec::new_const() }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Adds `idx` to this list. Does not touch its ready bit or invoke the
    /// scheduler; callers that want the full blocking contract use
    /// `crate::proc::wait_for` instead, which calls this and then blocks.
    pub fn add_waiter(&mut self, idx: ProcIdx) {
        // A process description invariant: appears on at most one wait list
        // at a time. Pushing a duplicate would make `awaken` touch it twice,
        // harmlessly, but still signals a caller bug.
        debug_assert!(!self.waiters.contains(&idx), "process already on this wait list");
        if self.waiters.try_push(idx).is_err() {
            kwarn!("waitlist full ({} waiters), dropping a waiter", NPROC);
        }
    }

    /// Marks every waiter ready and empties the list.
    pub fn awaken(&mut self) {
        for idx in self.waiters.drain(..) {
            crate::proc::set_ready(idx, true);
        }
    }
}

impl Drop for WaitList {
    fn drop(&mut self) {
        if !self.waiters.is_empty() {
            kwarn!("waitlist destroyed with {} waiter(s) still queued", self.waiters.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_list_is_empty() {
        let list = WaitList::new();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn add_waiter_grows_the_list() {
        let mut list = WaitList::new();
        list.add_waiter(3);
        list.add_waiter(7);
        assert_eq!(list.len(), 2);
        assert!(!list.is_empty());
    }

    // spec.md §4.4: `awaken` is fan-out, not FIFO handoff -- every waiter
    // leaves in one step, not one at a time.
    #[test]
    fn awaken_empties_the_list_in_one_step() {
        let mut list = WaitList::new();
        list.add_waiter(1);
        list.add_waiter(2);
        list.add_waiter(3);
        list.awaken();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn awaken_on_an_empty_list_is_a_no_op() {
        let mut list = WaitList::new();
        list.awaken();
        assert!(list.is_empty());
    }

}
