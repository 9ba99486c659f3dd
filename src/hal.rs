//! Hardware collaborators the scheduler core assumes but does not implement:
//! interrupt disable/enable, the context-switch mechanism, page allocation
//! for thread control blocks, and recovery of the running thread's stack
//! base. Everything above this module is pure logic; everything in this
//! module talks to the CPU.
//!
//! Grounded on the teacher's `task/context.rs` (the timer ISR trampoline
//! and `InterruptFrame` layout) and its `x86_64`/interrupt-disable calls
//! scattered through `serial.rs`/`console.rs`. The difference from the
//! teacher: the teacher only ever re-enters the scheduler from the real
//! timer interrupt. A thread that blocks voluntarily (semaphore down, lock
//! acquire, sleep) needs to invoke the scheduler *immediately*, not wait for
//! the next tick — so this module adds a second, software-triggered
//! interrupt (`int 0x81`) that funnels into the exact same save/restore
//! trampoline the timer uses. One mechanism, two triggers.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};

pub const PAGE_SIZE: usize = 4096;

/// CPU state saved/restored across a context switch. Field order matches
/// the push/pop order in the assembly trampoline below.
#[repr(C)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // Pushed by the CPU on interrupt entry.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Vector used for the software reschedule trap. Chosen well clear of the
/// PIC's remapped 32-47 range and the CPU exception range 0-31.
pub const RESCHED_VECTOR: u8 = 0x81;

pub fn timer_isr_addr() -> u64 {
    extern "C" {
        fn timer_isr();
    }
    timer_isr as *const () as u64
}

pub fn resched_isr_addr() -> u64 {
    extern "C" {
        fn resched_isr();
    }
    resched_isr as *const () as u64
}

// 1 while executing inside either trampoline below, 0 otherwise. Single CPU,
// so a plain byte flag (not even atomic in the hardware sense) suffices;
// kept as an AtomicU8 for the documented access pattern.
static IN_INTERRUPT: AtomicU8 = AtomicU8::new(0);

pub fn in_intr_context() -> bool {
    IN_INTERRUPT.load(Ordering::Relaxed) != 0
}

macro_rules! isr_trampoline {
    ($label:literal, $handler:literal) => {
        core::arch::global_asm!(
            concat!(".global ", $label),
            concat!($label, ":"),
            "push rax",
            "push rbx",
            "push rcx",
            "push rdx",
            "push rsi",
            "push rdi",
            "push rbp",
            "push r8",
            "push r9",
            "push r10",
            "push r11",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov rdi, rsp",
            "cld",
            "mov byte ptr [rip + IN_INTERRUPT], 1",
            concat!("call ", $handler),
            "mov byte ptr [rip + IN_INTERRUPT], 0",
            "mov rsp, rax",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rbp",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "pop rbx",
            "pop rax",
            "iretq",
        );
    };
}

isr_trampoline!("timer_isr", "hal_timer_entry");
isr_trampoline!("resched_isr", "hal_resched_entry");

/// Called from the raw timer ISR. Ticks the timer facility, sweeps the
/// sleep queue, and asks the scheduler whether the slice expired.
#[no_mangle]
extern "C" fn hal_timer_entry(frame: *mut InterruptFrame) -> *mut InterruptFrame {
    crate::interrupts::on_timer_irq();
    crate::timer::on_tick();
    crate::thread::scheduler::on_tick_return(frame)
}

/// Called from the software reschedule trap. Always asks the scheduler to
/// pick a thread to run, unconditionally.
#[no_mangle]
extern "C" fn hal_resched_entry(frame: *mut InterruptFrame) -> *mut InterruptFrame {
    crate::thread::scheduler::schedule_from_interrupt(frame)
}

/// Triggers an immediate reschedule. This is the concrete form of the
/// required `context_switch` collaborator: the core never picks an
/// explicit (out, in) pair itself, it asks the CPU to re-enter the same
/// trampoline the timer uses, and `schedule()` (running inside that
/// trampoline, interrupts already disabled by hardware) does the picking.
#[inline]
pub fn request_switch() {
    unsafe {
        core::arch::asm!("int {vec}", vec = const RESCHED_VECTOR, options(nostack));
    }
}

/// Opaque prior interrupt level, as required by `intr_restore`.
#[derive(Clone, Copy)]
pub struct IntrLevel(bool);

impl IntrLevel {
    pub fn is_enabled(&self) -> bool {
        self.0
    }
}

pub fn intr_get_level() -> IntrLevel {
    IntrLevel(x86_64::instructions::interrupts::are_enabled())
}

/// Disables interrupts, returning the level to later restore.
pub fn intr_disable() -> IntrLevel {
    let level = intr_get_level();
    x86_64::instructions::interrupts::disable();
    level
}

pub fn intr_restore(level: IntrLevel) {
    if level.0 {
        x86_64::instructions::interrupts::enable();
    }
}

/// RAII guard: disables interrupts on construction, restores the prior
/// level on drop. The "guard object" of the design notes — scheduler
/// globals should only be touched while one of these is alive.
pub struct IntrGuard(IntrLevel);

impl IntrGuard {
    pub fn acquire() -> Self {
        IntrGuard(intr_disable())
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        intr_restore(self.0);
    }
}

/// A cell reachable only while the caller holds an `IntrGuard`. This is the
/// "all scheduler globals reachable only through functions that take such a
/// guard by reference" design note made concrete: no locking, because the
/// only contender on a single CPU is an interrupt handler, and interrupts
/// are off for the guard's whole lifetime.
pub struct Guarded<T> {
    inner: core::cell::UnsafeCell<Option<T>>,
}

unsafe impl<T> Sync for Guarded<T> {}

impl<T> Guarded<T> {
    pub const fn new() -> Self {
        Guarded { inner: core::cell::UnsafeCell::new(None) }
    }

    pub fn init(&self, value: T) {
        unsafe { *self.inner.get() = Some(value) };
    }

    /// Borrowing requires proof (the guard reference) that interrupts are
    /// disabled for as long as the borrow lives.
    pub fn get<'a>(&'a self, _guard: &'a IntrGuard) -> &'a mut T {
        unsafe { (*self.inner.get()).as_mut().expect("Guarded<T> used before init") }
    }
}

/// Allocates a zeroed, page-aligned page for a TCB + kernel stack.
pub fn alloc_page() -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
    let ptr = unsafe { alloc_zeroed(layout) };
    NonNull::new(ptr)
}

/// # Safety
/// `page` must have come from `alloc_page` and must not still be in use as
/// a running thread's stack.
pub unsafe fn free_page(page: NonNull<u8>) {
    let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
    dealloc(page.as_ptr(), layout);
}

/// Recovers the page-aligned base of the page `rsp` currently points into.
/// For a thread running on a single `PAGE_SIZE` stack (everything
/// `thread::create` spawns), that's where its TCB lives; `thread::current`
/// is the one place that interprets the result, including the one thread
/// that isn't stack-and-TCB-co-located this way. The single isolated
/// unsafe primitive for identity recovery the design notes call for —
/// everything above this calls `thread::current()`, never this directly.
#[inline]
pub fn current_stack_base() -> NonNull<u8> {
    let rsp: u64;
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags));
    }
    let base = rsp & !((PAGE_SIZE as u64) - 1);
    unsafe { NonNull::new_unchecked(base as *mut u8) }
}
