//! Thread control blocks and the lifecycle operations built on top of them
//! (spec.md §4.2): `create`, `block`, `unblock`, `yield_now`, `exit`,
//! `current`, `set_priority`/`get_priority`.
//!
//! The scheduling mechanics proper — the ready queue, `schedule()`,
//! preemption, the idle thread — live in [`scheduler`]; this module owns
//! the `Tcb` representation and the operations that are really about a
//! single thread's identity and state transitions. Grounded throughout on
//! Pintos' `threads/thread.c` (see `examples/original_source`), the source
//! spec.md's contract was distilled from, re-expressed against this
//! crate's intrusive `list` and `hal` abstractions instead of Pintos' own
//! hand-rolled list and raw inline asm.

extern crate alloc;

pub mod scheduler;

use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config;
use crate::hal;
use crate::list::{Link, List};
use crate::sync::lock::Lock;

pub const NAME_MAX: usize = 16;

/// Sentinel written at a fixed offset in every `Tcb` and checked by
/// `current()` on every call — the lazy stack-overflow detector spec.md
/// §4.7 class 3 calls for. A blown kernel stack smashes downward into the
/// `Tcb` at the base of the page and corrupts this first.
const MAGIC: u32 = 0x5441_4c4c; // "TALL", arbitrary but recognizable in a hex dump

pub type Tid = u64;
pub const TID_ERROR: Tid = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Ready,
    Blocked,
    Dying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    OutOfMemory,
}

/// Thread control block, co-located at the base of a page-sized,
/// page-aligned allocation shared with its kernel stack (spec.md §3).
/// `#[repr(C)]` so `current_stack_base()`'s cast to `*mut Tcb` and the
/// `magic` sentinel sit at predictable offsets.
#[repr(C)]
pub struct Tcb {
    magic: u32,
    tid: Tid,
    name: [u8; NAME_MAX],
    name_len: u8,
    pub(crate) status: Status,
    base_priority: u8,
    effective_priority: u8,
    /// Linkage for exactly one of: the ready queue, a semaphore/condvar
    /// waiter list, or the sleep queue. Never more than one at a time —
    /// enforced by `status` determining which, never checked at runtime
    /// (spec.md §3 invariant 2).
    pub(crate) queue_link: Link,
    pub(crate) wait_on_lock: Option<NonNull<Lock>>,
    /// Threads currently donating their priority to this one, linked via
    /// their own `donor_link` (distinct from `queue_link` so a donor can
    /// sit in a waiter list and a donors list simultaneously).
    pub(crate) donors: List<DonorAdapter>,
    pub(crate) donor_link: Link,
    /// Meaningful only while this thread sits on the sleep queue.
    pub(crate) wakeup_tick: u64,
    entry: Option<Box<dyn FnOnce() + Send + 'static>>,
    saved_context: *mut hal::InterruptFrame,
    page: NonNull<u8>,
}

unsafe impl Send for Tcb {}

crate::list_adapter!(QueueAdapter = Tcb: queue_link);
crate::list_adapter!(DonorAdapter = Tcb: donor_link);

impl Tcb {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        let len = self.name_len as usize;
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn base_priority(&self) -> u8 {
        self.base_priority
    }

    pub fn effective_priority(&self) -> u8 {
        self.effective_priority
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_MAX);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name_len = len as u8;
    }

    /// Raises `effective_priority` to at least `at_least`, never lowers it.
    /// Used by donation propagation (spec.md §4.5); refresh (below) is the
    /// only path allowed to lower it back down.
    pub(crate) fn raise_effective_priority(&mut self, at_least: u8) {
        if at_least > self.effective_priority {
            self.effective_priority = at_least;
        }
    }

    /// Recomputes `effective_priority` from scratch: `base_priority`,
    /// raised to the highest `effective_priority` among current donors if
    /// that exceeds base (spec.md §4.5 "Priority refresh", P4). Correct
    /// even when multiple locks contributed donations and only one was
    /// just released, because it ignores history and looks only at who is
    /// still donating.
    pub(crate) fn refresh_priority(&mut self) {
        self.effective_priority = self.base_priority;
        if let Some(top) = self.donors.max_by_key(|d| d.effective_priority) {
            let top_priority = unsafe { top.as_ref().effective_priority };
            if top_priority > self.effective_priority {
                self.effective_priority = top_priority;
            }
        }
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// The initial/main thread's `Tcb`, set once by [`init`]. Unlike every
/// other thread, the initial thread keeps running on the bootloader-
/// provided kernel stack (hundreds of KiB, per `main.rs`'s
/// `BootloaderConfig::kernel_stack_size`), not on a single `PAGE_SIZE`
/// page the way `create()` hands out — so its `Tcb` cannot be co-located
/// at the base of the stack it runs on the way `current()` ordinarily
/// recovers one. `current()` special-cases it by address range instead
/// of by masking `rsp` (see there).
static mut INITIAL_TCB: Option<NonNull<Tcb>> = None;

/// Allocates a tid "under a lock" (spec.md §3): on a uniprocessor with a
/// single interrupt source, disabling interrupts around the increment
/// *is* the lock — no separate spinlock buys anything here (spec.md §5).
fn allocate_tid() -> Tid {
    let _guard = hal::IntrGuard::acquire();
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

/// Recovers the running thread's `Tcb` from the current stack pointer,
/// the one isolated unsafe identity-recovery primitive (design notes
/// §9) — with one exception. Masking `rsp` to its page base only finds a
/// real `Tcb` for threads whose entire stack *is* that one page, which is
/// true for every thread `create()` spawns (`alloc_page` hands out pages
/// from the heap) but not for the initial thread, which runs on the much
/// larger bootloader-provided boot stack. So: if the masked page falls
/// inside the heap's address range, it's a `create()`d thread's page and
/// the usual magic-sentinel check applies (spec.md §4.7 class 3 — panics
/// on a mismatch, the only sanctioned response to a detected stack
/// overflow). Otherwise `rsp` belongs to the boot stack, and the answer is
/// the `Tcb` [`init`] set aside for it.
pub fn current() -> NonNull<Tcb> {
    let base = hal::current_stack_base();
    let addr = base.as_ptr() as usize;
    let heap_start = crate::allocator::HEAP_START;
    let heap_end = heap_start + crate::allocator::HEAP_SIZE;
    if addr >= heap_start && addr < heap_end {
        let tcb = base.cast::<Tcb>();
        let magic = unsafe { tcb.as_ref().magic };
        if magic != MAGIC {
            panic!("thread: stack overflow detected (magic mismatch on current())");
        }
        return tcb;
    }
    unsafe { INITIAL_TCB.expect("thread::init not called") }
}

pub fn tid() -> Tid {
    unsafe { current().as_ref().tid() }
}

pub fn get_priority() -> u8 {
    unsafe { current().as_ref().effective_priority() }
}

/// Sets `base_priority`, refreshes `effective_priority` (P4), then yields
/// if some ready thread now outranks the caller (spec.md §4.2). Calling
/// `set_priority(p)` twice in a row is a no-op the second time — refresh
/// recomputes the same value and nothing ready outranks an unchanged
/// running thread.
pub fn set_priority(p: u8) {
    assert!(p >= config::PRIORITY_MIN && p <= config::PRIORITY_MAX, "priority out of range");
    let _guard = hal::IntrGuard::acquire();
    let mut cur = current();
    unsafe {
        cur.as_mut().base_priority = p;
        cur.as_mut().refresh_priority();
    }
    scheduler::preempt_if_needed();
}

/// Initializes a freshly allocated `Tcb` in place as BLOCKED (spec.md
/// §3 "Creation: ... initialize TCB with BLOCKED status"). Shared by
/// `create()`, the idle thread, and `init()`'s transformation of the
/// booting stack into the main thread.
unsafe fn init_thread_in_place(
    tcb: NonNull<Tcb>,
    page: NonNull<u8>,
    name: &str,
    priority: u8,
    entry: Option<Box<dyn FnOnce() + Send + 'static>>,
) {
    unsafe {
        core::ptr::write(
            tcb.as_ptr(),
            Tcb {
                magic: MAGIC,
                tid: TID_ERROR,
                name: [0; NAME_MAX],
                name_len: 0,
                status: Status::Blocked,
                base_priority: priority,
                effective_priority: priority,
                queue_link: Link::new(),
                wait_on_lock: None,
                donors: List::new(),
                donor_link: Link::new(),
                wakeup_tick: 0,
                entry,
                saved_context: core::ptr::null_mut(),
                page,
            },
        );
        tcb.as_ptr().as_mut().unwrap().set_name(name);
    }
}

/// Entry point every newly created thread's synthetic register frame
/// resumes into (via the `hal` trampoline's `iretq`). Enables interrupts
/// — threads always start with them on, matching "the scheduler runs with
/// interrupts off" only across the switch itself — then runs the boxed
/// closure, then exits.
///
/// # Safety
/// `entry_ptr` must be a `Box<Box<dyn FnOnce() + Send>>` raw pointer
/// produced by `create()`, not yet freed. Double-boxing gives a thin
/// pointer that fits in a single register, unlike a bare
/// `Box<dyn FnOnce()>` (a fat pointer).
unsafe extern "C" fn thread_trampoline(entry_ptr: u64) -> ! {
    x86_64::instructions::interrupts::enable();
    let boxed: Box<Box<dyn FnOnce() + Send + 'static>> =
        unsafe { Box::from_raw(entry_ptr as *mut Box<dyn FnOnce() + Send + 'static>) };
    (*boxed)();
    exit();
}

fn prime_frame(page: NonNull<u8>, entry: Box<dyn FnOnce() + Send + 'static>) -> *mut hal::InterruptFrame {
    let double_boxed: Box<Box<dyn FnOnce() + Send + 'static>> = Box::new(entry);
    let entry_ptr = Box::into_raw(double_boxed) as u64;

    let stack_top = unsafe { page.as_ptr().add(hal::PAGE_SIZE) } as *mut hal::InterruptFrame;
    let frame_ptr = unsafe { stack_top.sub(1) };
    unsafe {
        core::ptr::write(
            frame_ptr,
            hal::InterruptFrame {
                r15: 0, r14: 0, r13: 0, r12: 0, r11: 0, r10: 0, r9: 0, r8: 0,
                rbp: 0,
                rdi: entry_ptr,
                rsi: 0, rdx: 0, rcx: 0, rbx: 0, rax: 0,
                rip: thread_trampoline as usize as u64,
                cs: crate::gdt::kernel_code_selector() as u64,
                rflags: 0x202,
                rsp: stack_top as u64,
                ss: 0,
            },
        );
    }
    frame_ptr
}

/// Allocates a page, initializes the TCB, primes its first resume to
/// enter [`thread_trampoline`] with `entry` boxed up, and makes it READY.
/// Yields if the new thread outranks the caller (spec.md §4.2). Returns
/// `SpawnError::OutOfMemory` if no page is available (spec.md §7 class 1,
/// the one error surfaced as a value rather than an assertion).
pub fn create(
    name: &str,
    priority: u8,
    entry: impl FnOnce() + Send + 'static,
) -> Result<Tid, SpawnError> {
    assert!(priority >= config::PRIORITY_MIN && priority <= config::PRIORITY_MAX);
    let page = hal::alloc_page().ok_or(SpawnError::OutOfMemory)?;
    let tcb = page.cast::<Tcb>();

    let _guard = hal::IntrGuard::acquire();
    unsafe { init_thread_in_place(tcb, page, name, priority, None) };
    let tid = allocate_tid();
    unsafe { tcb.as_ptr().as_mut().unwrap().tid = tid };

    let frame = prime_frame(page, Box::new(entry));
    unsafe { tcb.as_ptr().as_mut().unwrap().saved_context = frame };

    unblock(tcb);
    scheduler::preempt_if_needed();
    Ok(tid)
}

/// Requires interrupts already disabled by the caller and not running in
/// interrupt context (spec.md §4.2). Does not enqueue the thread anywhere
/// — the caller (semaphore, sleep queue, …) must have placed it on its
/// specific wait list first.
pub fn block() {
    assert!(!hal::in_intr_context(), "thread::block called from interrupt context");
    debug_assert!(!hal::intr_get_level().is_enabled(), "thread::block called with interrupts enabled");
    let mut cur = current();
    unsafe { cur.as_mut().status = Status::Blocked };
    scheduler::request_schedule();
}

/// Requires `t` is BLOCKED. Inserts `t` into the ready queue in
/// effective-priority-descending order (ties FIFO) and marks it READY.
/// Never preempts itself — the caller decides whether a yield is
/// warranted (spec.md §4.2), since many callers (e.g. `sema_up` deep
/// inside another operation) want to finish their own bookkeeping first.
pub fn unblock(mut t: NonNull<Tcb>) {
    let _guard = hal::IntrGuard::acquire();
    assert_eq!(unsafe { t.as_ref().status }, Status::Blocked, "unblock: thread not blocked");
    scheduler::ready_queue_insert(t);
    unsafe { t.as_mut().status = Status::Ready };
}

/// Reinserts the current thread into the ready queue (unless it is the
/// idle thread, which is never enqueued) and asks the scheduler to pick
/// someone to run. The current thread is not put to sleep — it may be
/// scheduled again immediately (spec.md §4.2).
pub fn yield_now() {
    let _guard = hal::IntrGuard::acquire();
    let mut cur = current();
    if !scheduler::is_idle(cur) {
        scheduler::ready_queue_insert(cur);
    }
    unsafe { cur.as_mut().status = Status::Ready };
    scheduler::request_schedule();
}

/// Transitions to DYING via a scheduler pass and never returns. The page
/// is not freed here — the thread is still running on its own stack; the
/// next scheduling pass enqueues it on the destruction queue and frees it
/// once some other thread is running (spec.md §3 "Termination").
pub fn exit() -> ! {
    let _guard = hal::IntrGuard::acquire();
    let mut cur = current();
    unsafe { cur.as_mut().status = Status::Dying };
    scheduler::request_schedule();
    unreachable!("exited thread was rescheduled")
}

/// Transforms the currently executing stack into the "main" thread
/// (spec.md §4.2 `init`). Must run before any synchronization primitive
/// is used, and before interrupts are enabled.
///
/// Unlike Pintos, where `loader.S` puts the bottom of the boot stack at a
/// page boundary and `thread_init` co-locates the main thread's struct
/// there, this kernel's boot stack is a bootloader-sized region (hundreds
/// of KiB, to give paging/heap/console bring-up room to run before any
/// thread exists) that isn't itself a single `PAGE_SIZE` page. So the
/// main thread's `Tcb` gets its own dedicated page instead of one carved
/// out of the stack it actually runs on; [`current`] knows to return it
/// by address range rather than by masking `rsp`.
pub fn init() {
    let page = hal::alloc_page().expect("failed to allocate initial thread TCB");
    let tcb = page.cast::<Tcb>();
    unsafe {
        init_thread_in_place(tcb, page, "main", config::PRIORITY_DEFAULT, None);
        tcb.as_ptr().as_mut().unwrap().status = Status::Running;
        tcb.as_ptr().as_mut().unwrap().tid = allocate_tid();
    }
    unsafe { INITIAL_TCB = Some(tcb) };
    scheduler::init(tcb);
    crate::timer::init();
}

/// Creates the idle thread, enables interrupts, and blocks until the
/// idle thread has signalled (via a semaphore) that it has recorded
/// itself as `idle_thread` (spec.md §4.2 `start`).
pub fn start() {
    let idle_started = crate::sync::semaphore::Semaphore::new(0);
    let idle_started_ptr = &idle_started as *const crate::sync::semaphore::Semaphore as u64;
    create("idle", config::PRIORITY_MIN, move || scheduler::idle_main(idle_started_ptr))
        .expect("failed to create idle thread");
    unsafe { x86_64::instructions::interrupts::enable() };
    idle_started.down();
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a standalone `Tcb` on the caller's stack — not through
    /// `create()`/`current_stack_base()`, both of which assume a real
    /// kernel stack this host test doesn't have. Donation bookkeeping
    /// (`raise_effective_priority`/`refresh_priority`/`donors`) is plain
    /// logic over `Tcb` values and doesn't otherwise touch `hal`, so it's
    /// exercised directly here instead of only end-to-end under `lock`
    /// (spec.md §8 scenarios S3/S4/S5, the `donate_priority` family in
    /// `examples/original_source/threads/synch.c`).
    fn make_tcb(name: &str, priority: u8) -> Tcb {
        let mut tcb = core::mem::MaybeUninit::<Tcb>::uninit();
        unsafe {
            init_thread_in_place(
                NonNull::new(tcb.as_mut_ptr()).unwrap(),
                NonNull::dangling(),
                name,
                priority,
                None,
            );
            tcb.assume_init()
        }
    }

    /// S3 — simple donation: two donors raise a holder's effective
    /// priority to the higher of the two, and releasing the higher one
    /// drops it back to the lower donor's priority, not all the way to
    /// base.
    #[test]
    fn donation_raises_to_highest_donor_and_refresh_recomputes() {
        let mut low = make_tcb("low", 10);
        let med = make_tcb("med", 20);
        let high = make_tcb("high", 30);

        let med_ptr = NonNull::from(&med);
        let high_ptr = NonNull::from(&high);

        low.donors.insert_desc_by_key(med_ptr, |d| d.effective_priority());
        low.raise_effective_priority(med.effective_priority());
        assert_eq!(low.effective_priority(), 20);

        low.donors.insert_desc_by_key(high_ptr, |d| d.effective_priority());
        low.raise_effective_priority(high.effective_priority());
        assert_eq!(low.effective_priority(), 30);

        // high releases: its link leaves the donor list, effective
        // priority is recomputed from scratch rather than just lowered by
        // high's contribution, so it lands on med's 20 (P4).
        let high_link = unsafe { DonorAdapter::link_of(high_ptr) };
        low.donors.remove(high_link);
        low.refresh_priority();
        assert_eq!(low.effective_priority(), 20);

        let med_link = unsafe { DonorAdapter::link_of(med_ptr) };
        low.donors.remove(med_link);
        low.refresh_priority();
        assert_eq!(low.effective_priority(), low.base_priority());
    }

    /// S5 — multiple donors to the same holder: refresh always picks the
    /// current maximum among whoever is still donating, regardless of the
    /// order donors arrived or left in.
    #[test]
    fn refresh_tracks_max_of_remaining_donors_regardless_of_order() {
        let mut holder = make_tcb("holder", 15);
        let a = make_tcb("a", 22);
        let b = make_tcb("b", 18);
        let c = make_tcb("c", 27);

        for d in [NonNull::from(&a), NonNull::from(&b), NonNull::from(&c)] {
            holder.donors.insert_desc_by_key(d, |d| d.effective_priority());
            holder.raise_effective_priority(unsafe { d.as_ref().effective_priority() });
        }
        assert_eq!(holder.effective_priority(), 27);

        // The max-priority donor (c, 27) leaves first; the next highest
        // remaining (a, 22) becomes the new floor.
        holder.donors.remove(unsafe { DonorAdapter::link_of(NonNull::from(&c)) });
        holder.refresh_priority();
        assert_eq!(holder.effective_priority(), 22);

        holder.donors.remove(unsafe { DonorAdapter::link_of(NonNull::from(&a)) });
        holder.refresh_priority();
        assert_eq!(holder.effective_priority(), 18);

        holder.donors.remove(unsafe { DonorAdapter::link_of(NonNull::from(&b)) });
        holder.refresh_priority();
        assert_eq!(holder.effective_priority(), holder.base_priority());
    }

    /// `raise_effective_priority` only ever raises; a donation below the
    /// current effective priority is a no-op.
    #[test]
    fn raise_never_lowers_effective_priority() {
        let mut t = make_tcb("t", 20);
        t.raise_effective_priority(10);
        assert_eq!(t.effective_priority(), 20);
        t.raise_effective_priority(25);
        assert_eq!(t.effective_priority(), 25);
    }
}
