//! Ready-queue mechanics: the idle thread, the pick-next-thread policy,
//! preemption, and the two entry points `hal`'s interrupt trampoline calls
//! into (`on_tick_return` from the real timer, `schedule_from_interrupt`
//! from the software reschedule trap). Grounded on Pintos'
//! `next_thread_to_run`/`schedule`/`thread_tick`/`thread_start`
//! (`examples/original_source/threads/thread.c`), adapted onto `hal`'s
//! single context-switch trampoline instead of Pintos' own `thread_launch`.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config;
use crate::hal::{self, Guarded, InterruptFrame, IntrGuard};
use crate::list::{Adapter, List};

use super::{QueueAdapter, Status, Tcb};

static READY_QUEUE: Guarded<List<QueueAdapter>> = Guarded::new();
static DESTRUCTION_QUEUE: Guarded<List<QueueAdapter>> = Guarded::new();

static mut IDLE_THREAD: Option<NonNull<Tcb>> = None;
static mut INITIAL_THREAD: Option<NonNull<Tcb>> = None;

/// Ticks the current thread has run since its last time it was switched
/// in. Reset to 0 in `schedule_core` whenever a new thread is switched in;
/// compared against `config::TIME_SLICE` in `on_tick_return`.
static THREAD_TICKS: AtomicU64 = AtomicU64::new(0);

pub(crate) fn init(initial: NonNull<Tcb>) {
    READY_QUEUE.init(List::new());
    DESTRUCTION_QUEUE.init(List::new());
    unsafe { INITIAL_THREAD = Some(initial) };
}

fn ready_queue<'a>(guard: &'a IntrGuard) -> &'a mut List<QueueAdapter> {
    READY_QUEUE.get(guard)
}

fn destruction_queue<'a>(guard: &'a IntrGuard) -> &'a mut List<QueueAdapter> {
    DESTRUCTION_QUEUE.get(guard)
}

pub(crate) fn is_idle(t: NonNull<Tcb>) -> bool {
    unsafe { IDLE_THREAD == Some(t) }
}

/// Inserts `t` into the ready queue ordered by descending effective
/// priority, ties FIFO (spec.md §4.1 "ready queue ... ordered"). Requires
/// the caller already holds an `IntrGuard`.
pub(crate) fn ready_queue_insert(t: NonNull<Tcb>) {
    let guard = IntrGuard::acquire();
    ready_queue(&guard).insert_desc_by_key(t, |tcb| tcb.effective_priority());
}

/// Requests an immediate reschedule via the software trap (spec.md §4.2
/// `block`/`yield_now`/`exit` all funnel here). Not callable from
/// interrupt context — the timer path reschedules by returning a
/// different frame from `on_tick_return` directly, it never re-enters via
/// `int 0x81`.
pub(crate) fn request_schedule() {
    hal::request_switch();
}

/// Picks the highest *current* effective priority among ready threads,
/// falling back to the idle thread when the ready queue is empty
/// (spec.md §4.1, "idle thread ... runs whenever the ready queue is
/// empty"). A re-scan rather than a plain `pop_front()`: a thread already
/// sitting in the ready queue can be donated to (its lock's holder was
/// preempted mid-hold, not blocked), which changes its effective priority
/// without moving it in the list — the same staleness `semaphore::up`
/// has to re-scan for on its waiter list.
fn next_thread_to_run(guard: &IntrGuard) -> NonNull<Tcb> {
    let queue = ready_queue(guard);
    match queue.max_by_key(|tcb| tcb.effective_priority()) {
        Some(t) => {
            let link = unsafe { QueueAdapter::link_of(t) };
            queue.remove(link);
            t
        }
        None => unsafe { IDLE_THREAD.expect("idle thread not started") },
    }
}

/// The mechanics shared by both trampoline entry points: pick the next
/// thread, mark it RUNNING, reset the slice counter, reap any thread
/// queued for destruction by a *previous* switch (never the one being
/// switched away from right now — it is still on this stack), and return
/// the frame to resume into.
///
/// `outgoing` is `None` only when called for the very first switch away
/// from nothing (never actually happens here: `thread::start` always
/// switches away from the initial thread, which is a real thread).
fn schedule_core(outgoing: NonNull<Tcb>, frame: *mut InterruptFrame) -> *mut InterruptFrame {
    let guard = IntrGuard::acquire();

    reap_destroyed(&guard);

    let outgoing_status = unsafe { outgoing.as_ref().status };
    unsafe { outgoing.as_mut().saved_context = frame };
    match outgoing_status {
        Status::Dying => destruction_queue(&guard).push_back(outgoing),
        Status::Running => {
            unsafe { outgoing.as_mut().status = Status::Ready };
            if !is_idle(outgoing) {
                ready_queue(&guard).insert_desc_by_key(outgoing, |tcb| tcb.effective_priority());
            }
        }
        // Already moved to Blocked/Ready by the caller (block()/yield_now())
        // before requesting the switch.
        _ => {}
    }

    let mut incoming = next_thread_to_run(&guard);
    unsafe { incoming.as_mut().status = Status::Running };
    THREAD_TICKS.store(0, Ordering::Relaxed);

    unsafe { incoming.as_ref().saved_context }
}

/// Frees the page of any thread a *prior* schedule pass parked on the
/// destruction queue. Deferred this way because a thread can never free
/// the stack it is still running on (spec.md §3 "Termination").
fn reap_destroyed(guard: &IntrGuard) {
    while let Some(dead) = destruction_queue(guard).pop_front() {
        let page = unsafe { dead.as_ref().page };
        unsafe { hal::free_page(page) };
    }
}

/// Entry point for the real timer interrupt (via `hal::hal_timer_entry`).
/// Only reschedules once the current thread's slice has expired and some
/// ready thread exists to hand off to — otherwise returns the same frame
/// unchanged, which is the common case on every tick that isn't a
/// preemption point (spec.md §4.2 "TIME_SLICE (4 ticks)").
pub fn on_tick_return(frame: *mut InterruptFrame) -> *mut InterruptFrame {
    let ticks = THREAD_TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    let current = super::current();
    if ticks < config::TIME_SLICE {
        return frame;
    }
    let guard = IntrGuard::acquire();
    if ready_queue(&guard).is_empty() && is_idle(current) {
        return frame;
    }
    drop(guard);
    schedule_core(current, frame)
}

/// Entry point for the voluntary reschedule trap. Unlike the timer path,
/// this always switches (the caller has already decided a switch is
/// necessary: blocked, yielded, or exiting).
pub fn schedule_from_interrupt(frame: *mut InterruptFrame) -> *mut InterruptFrame {
    let current = super::current();
    schedule_core(current, frame)
}

/// Yields immediately if some ready thread now outranks the running
/// thread (spec.md §4.2, the "test_max_priority" check in `create` and
/// `set_priority`). A no-op from interrupt context — the timer path
/// already re-evaluates priority order on every tick via `on_tick_return`.
pub fn preempt_if_needed() {
    if hal::in_intr_context() {
        return;
    }
    let guard = IntrGuard::acquire();
    let current = super::current();
    let current_priority = unsafe { current.as_ref().effective_priority() };
    let should_yield = ready_queue(&guard)
        .front()
        .map(|front| unsafe { front.as_ref().effective_priority() } > current_priority)
        .unwrap_or(false);
    drop(guard);
    if should_yield {
        super::yield_now();
    }
}

/// Body of the idle thread (spec.md §4.1): signals `idle_started`, then
/// repeatedly halts until the next interrupt, yielding immediately after
/// each wake so a newly-ready thread is picked up without waiting out a
/// full slice.
pub(crate) fn idle_main(idle_started_ptr: u64) {
    let idle_started = unsafe {
        &*(idle_started_ptr as *const crate::sync::semaphore::Semaphore)
    };
    unsafe { IDLE_THREAD = Some(super::current()) };
    idle_started.up();
    loop {
        x86_64::instructions::interrupts::disable();
        super::yield_now();
        unsafe { x86_64::instructions::interrupts::enable_and_hlt() };
    }
}
