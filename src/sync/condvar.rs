//! Mesa-style condition variable layered on [`Semaphore`]. Grounded on
//! Pintos' `cond_init`/`cond_wait`/`cond_signal`/`cond_broadcast`
//! (`examples/original_source/threads/synch.c`).
//!
//! Each waiter parks on a private one-shot semaphore rather than directly
//! on the condvar's own waiter list, and the list is re-ranked by current
//! priority at signal time rather than kept sorted at insertion time —
//! donation can raise a waiter's priority after it started waiting, and
//! only a re-rank at wakeup sees that.

use core::ptr::NonNull;

use crate::hal::{Guarded, IntrGuard};
use crate::list::{Adapter, Link, List};

use super::lock::Lock;
use super::semaphore::Semaphore;

#[repr(C)]
struct Waiter {
    sema: Semaphore,
    link: Link,
}

crate::list_adapter!(WaiterAdapter = Waiter: link);

pub struct Condvar {
    waiters: Guarded<List<WaiterAdapter>>,
}

unsafe impl Sync for Condvar {}

impl Condvar {
    pub fn new() -> Self {
        let waiters = Guarded::new();
        waiters.init(List::new());
        Condvar { waiters }
    }

    /// Atomically releases `lock` and blocks on a private semaphore,
    /// reacquiring `lock` before returning. `lock` must be held by the
    /// caller. Like Pintos, does not itself re-check any predicate —
    /// callers must loop: `while !predicate { cv.wait(&mut lock) }`
    /// (spec.md §4.6, Mesa semantics: a woken waiter only gets another
    /// chance to check the condition, not a guarantee it still holds).
    pub fn wait(&self, lock: &Lock) {
        assert!(lock.is_held_by_current_thread());
        let waiter = Waiter { sema: Semaphore::new(0), link: Link::new() };
        let waiter_ptr = NonNull::from(&waiter);

        {
            let guard = IntrGuard::acquire();
            self.waiters.get(&guard).push_back(waiter_ptr);
        }

        lock.release();
        waiter.sema.down();
        lock.acquire();
    }

    /// Wakes exactly one waiter, the one whose parked thread currently
    /// has the highest effective priority (re-ranked now, not at the
    /// time it called `wait`). `lock` must be held by the caller, matching
    /// Pintos' contract even though this implementation doesn't touch the
    /// lock's state directly — it documents that signalling outside the
    /// associated critical section is a caller bug, not something this
    /// type can or should detect on its own.
    pub fn signal(&self, lock: &Lock) {
        assert!(lock.is_held_by_current_thread());
        let guard = IntrGuard::acquire();
        let list = self.waiters.get(&guard);
        let Some(best) = list.max_by_key(|w| w.sema.front_waiter_priority().unwrap_or(0)) else {
            return;
        };
        let link = unsafe { WaiterAdapter::link_of(best) };
        list.remove(link);
        drop(guard);
        unsafe { best.as_ref().sema.up() };
    }

    /// Wakes every current waiter, highest priority first.
    pub fn broadcast(&self, lock: &Lock) {
        while self.has_waiters() {
            self.signal(lock);
        }
    }

    fn has_waiters(&self) -> bool {
        let guard = IntrGuard::acquire();
        !self.waiters.get(&guard).is_empty()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
