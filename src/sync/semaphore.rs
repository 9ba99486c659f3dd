//! Counting semaphore with a priority-ordered waiter list. Grounded on
//! Pintos' `sema_init`/`sema_down`/`sema_try_down`/`sema_up`
//! (`examples/original_source/threads/synch.c`).

use crate::hal::{Guarded, IntrGuard};
use crate::list::{Adapter, List};
use crate::thread::{self, scheduler, QueueAdapter};

struct State {
    count: u64,
    waiters: List<QueueAdapter>,
}

pub struct Semaphore {
    state: Guarded<State>,
}

unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn new(count: u64) -> Self {
        let state = Guarded::new();
        state.init(State { count, waiters: List::new() });
        Semaphore { state }
    }

    /// Blocks until `count` is positive, then consumes one unit. Requires
    /// `count` waiters to be woken in priority order, highest first (ties
    /// FIFO) — the insert below keeps that order without needing a sort
    /// at wakeup time.
    pub fn down(&self) {
        assert!(!crate::hal::in_intr_context(), "sema_down called from interrupt context");
        let guard = IntrGuard::acquire();
        loop {
            let state = self.state.get(&guard);
            if state.count > 0 {
                state.count -= 1;
                return;
            }
            let cur = thread::current();
            state.waiters.insert_desc_by_key(cur, |t| t.effective_priority());
            thread::block();
        }
    }

    /// Non-blocking `down`: consumes a unit and returns `true` only if one
    /// was immediately available.
    pub fn try_down(&self) -> bool {
        let guard = IntrGuard::acquire();
        let state = self.state.get(&guard);
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    /// Effective priority of the thread at the front of this semaphore's
    /// waiter list, if any. Lets [`super::condvar::Condvar`] re-rank its
    /// own waiters by the current priority of the thread parked behind
    /// each one's private wakeup semaphore (spec.md §4.6 — priority can
    /// change via donation while parked on a condvar, so ranking must be
    /// read fresh at signal time, not captured at wait time).
    pub(crate) fn front_waiter_priority(&self) -> Option<u8> {
        let guard = IntrGuard::acquire();
        let state = self.state.get(&guard);
        state.waiters.front().map(|t| unsafe { t.as_ref().effective_priority() })
    }

    /// Wakes the highest-priority waiter (if any) and increments `count`.
    /// Waiters were inserted in priority order at `down` time, but a
    /// waiter's priority can rise afterward via donation (spec.md §4.4) —
    /// so rather than trusting the insertion order, this re-scans for the
    /// current maximum and removes exactly that one. Yields immediately
    /// afterward if the newly woken thread now outranks the caller,
    /// matching the immediate-preemption behavior `thread::create`/
    /// `set_priority` give on the same condition.
    pub fn up(&self) {
        let guard = IntrGuard::acquire();
        let state = self.state.get(&guard);
        let woken = state.waiters.max_by_key(|t| t.effective_priority()).map(|t| {
            let link = unsafe { QueueAdapter::link_of(t) };
            state.waiters.remove(link);
            t
        });
        state.count += 1;
        drop(guard);
        if let Some(t) = woken {
            thread::unblock(t);
        }
        scheduler::preempt_if_needed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_down_fails_when_empty() {
        let sem = Semaphore::new(0);
        assert!(!sem.try_down());
    }

    #[test]
    fn try_down_succeeds_when_available() {
        let sem = Semaphore::new(1);
        assert!(sem.try_down());
        assert!(!sem.try_down());
    }
}
