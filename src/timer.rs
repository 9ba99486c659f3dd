//! Tick counter and sleep queue (spec.md §4.3). Grounded on Pintos'
//! `devices/timer.c` (`timer_ticks`/`timer_sleep`) and `threads/thread.c`'s
//! `thread_sleep`/`thread_wakeup`/`next_tick_to_awake`
//! (`examples/original_source`), re-expressed against this crate's
//! intrusive `list` and `hal::IntrGuard` instead of Pintos' own list and
//! `intr_disable`/`intr_set_level` pairs.
//!
//! The tick counter itself is advanced from `hal`'s timer trampoline, which
//! calls [`on_tick`] once per PIT interrupt before asking the scheduler
//! whether the slice expired. Everything in this module assumes it runs
//! with interrupts already disabled (true for both `on_tick`, called from
//! the ISR, and `sleep`, which disables them itself).

use core::sync::atomic::{AtomicU64, Ordering};

use crate::hal::{Guarded, IntrGuard};
use crate::list::{Adapter, List};
use crate::thread::{self, QueueAdapter};

static TICKS: AtomicU64 = AtomicU64::new(0);

static SLEEP_QUEUE: Guarded<List<QueueAdapter>> = Guarded::new();

/// Conservative lower bound on the earliest pending `wakeup_tick`, updated
/// by [`sleep`] but never reset when a sleeper leaves the queue early via
/// some other path — spec.md §9 documents this as the one open question in
/// the source behavior and mandates treating the hint as a lower bound
/// only, never a promise. [`on_tick`] below honors that: it only uses the
/// hint to skip the sweep entirely, and always does a full linear scan
/// when it doesn't skip, so a stale hint can make the sweep run one or
/// more ticks too early but never causes a missed wakeup.
static NEXT_TICK_TO_AWAKE: AtomicU64 = AtomicU64::new(u64::MAX);

pub(crate) fn init() {
    SLEEP_QUEUE.init(List::new());
}

fn sleep_queue<'a>(guard: &'a IntrGuard) -> &'a mut List<QueueAdapter> {
    SLEEP_QUEUE.get(guard)
}

/// Current tick count. Never decreases; wraps only after 2^64 ticks, which
/// spec.md §7 class 4 treats as not happening in practice.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called once per timer interrupt, before the scheduler's own
/// slice-expiry check (`hal::hal_timer_entry`). Advances the tick counter,
/// then sweeps the sleep queue for anyone due.
pub fn on_tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    sweep(now);
}

/// Unblocks every sleeper whose `wakeup_tick <= now` (spec.md §4.3 (iii),
/// P6). Short-circuits on the hint when it proves nothing can be due yet,
/// but otherwise always does a full scan rather than trusting the sleep
/// queue to be sorted — spec.md §3 allows either representation, and a
/// linear scan is correct for both.
fn sweep(now: u64) {
    if now < NEXT_TICK_TO_AWAKE.load(Ordering::Relaxed) {
        return;
    }
    let guard = IntrGuard::acquire();
    let mut next_min = u64::MAX;
    let mut cursor = sleep_queue(&guard).link_of_front();
    while let Some(link) = cursor {
        let t = unsafe { QueueAdapter::value_of(link) };
        let wakeup = unsafe { t.as_ref().wakeup_tick };
        if wakeup <= now {
            cursor = sleep_queue(&guard).remove(link);
            thread::unblock(t);
        } else {
            next_min = next_min.min(wakeup);
            cursor = unsafe { link.as_ref().next_link() };
        }
    }
    NEXT_TICK_TO_AWAKE.store(next_min, Ordering::Relaxed);
}

/// Blocks the calling thread until at least `current_tick() + n` (spec.md
/// §4.3 `sleep`). `n <= 0` is a no-op. Must be called with interrupts
/// enabled (the facility disables them internally, matching Pintos'
/// `ASSERT(intr_get_level() == INTR_ON)` in `timer_sleep`); always takes
/// the blocking path — sub-tick busy-waits are a caller-level concern
/// (spec.md §4.3, "sub-tick sleeps use a calibrated busy-wait loop"), not
/// something this facility does, since it only ever deals in whole ticks.
pub fn sleep(n: i64) {
    if n <= 0 {
        return;
    }
    debug_assert!(crate::hal::intr_get_level().is_enabled(), "timer::sleep called with interrupts already disabled");
    let guard = IntrGuard::acquire();
    let now = ticks();
    let wakeup = now + n as u64;
    let mut cur = thread::current();
    unsafe { cur.as_mut().wakeup_tick = wakeup };
    sleep_queue(&guard).push_back(cur);
    let prior_hint = NEXT_TICK_TO_AWAKE.load(Ordering::Relaxed);
    if wakeup < prior_hint {
        NEXT_TICK_TO_AWAKE.store(wakeup, Ordering::Relaxed);
    }
    // `block()` requires interrupts already disabled (mod.rs), so the guard
    // must still be alive here — dropping it first would let a tick preempt
    // this thread while it's Running but already on the sleep queue,
    // double-linking `queue_link` into both the sleep and ready queues
    // (spec.md §3 invariant 2) the same way `semaphore::down`/`yield_now`
    // keep their guard held across `block()`.
    thread::block();
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_or_zero_sleep_is_noop() {
        // `sleep` must return immediately without touching any global
        // state reachable only via a running scheduler; exercised here by
        // simply confirming it doesn't panic or block forever on ticks.
        sleep(0);
        sleep(-5);
    }
}
