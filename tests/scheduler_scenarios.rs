/// Integration test: end-to-end scheduler scenarios that need a real
/// running thread and real timer ticks (spec.md §8 S1/S2/S6) — the things
/// the module-level unit tests under `src/` can't reach without `hal`'s
/// x86_64 backend actually driving interrupts and context switches.
#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::sync::Arc;
use bootloader_api::{entry_point, BootInfo, BootloaderConfig};
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use kernel::sync::lock::Lock;
use kernel::{allocator, memory, thread, timer};

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(bootloader_api::config::Mapping::Dynamic);
    config
};

entry_point!(main, config = &BOOTLOADER_CONFIG);

fn main(boot_info: &'static mut BootInfo) -> ! {
    kernel::init();

    let phys_mem_offset = x86_64::VirtAddr::new(
        boot_info
            .physical_memory_offset
            .into_option()
            .expect("physical_memory_offset not available"),
    );
    let mut mapper = unsafe { memory::init(phys_mem_offset) };
    let mut frame_allocator =
        unsafe { memory::BootInfoFrameAllocator::init(&boot_info.memory_regions) };
    allocator::init_heap(&mut mapper, &mut frame_allocator).expect("heap initialization failed");

    thread::init();
    thread::start();

    test_main();
    kernel::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kernel::test_panic_handler(info)
}

/// S1 — strict preemption on unblock: a freshly created higher-priority
/// thread runs (and in this case, exits) before `thread::create` returns
/// control to its lower-priority creator.
#[test_case]
fn strict_preemption_on_create() {
    static RAN: AtomicBool = AtomicBool::new(false);

    let before = thread::get_priority();
    thread::create("s1-high", before + 9, || {
        RAN.store(true, Ordering::SeqCst);
    })
    .expect("spawn s1-high");

    // `create` only returns here after the higher-priority thread has run
    // to completion (it never blocks, so the first and only scheduling
    // pass it causes runs it through to `exit`).
    assert!(RAN.load(Ordering::SeqCst), "higher-priority thread did not run before create() returned");
}

/// S2 — FIFO within a priority level: three equal-priority threads created
/// in order, then the creator yields. Expected run order is creation
/// order, before the creator runs again.
#[test_case]
fn fifo_within_equal_priority() {
    static SEQ: [AtomicU32; 3] = [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)];
    static NEXT: AtomicU32 = AtomicU32::new(1);

    let mine = thread::get_priority();
    for slot in 0..3 {
        thread::create("s2-peer", mine, move || {
            let order = NEXT.fetch_add(1, Ordering::SeqCst);
            SEQ[slot].store(order, Ordering::SeqCst);
        })
        .expect("spawn s2 peer");
    }

    // Equal priority: none of the three preempts the creator at spawn
    // time. Yielding hands the CPU to the front of the ready queue, which
    // is the first thread created (ties are FIFO, spec.md §4.2).
    thread::yield_now();

    let order: alloc::vec::Vec<u32> = SEQ.iter().map(|s| s.load(Ordering::SeqCst)).collect();
    assert_eq!(order, alloc::vec![1, 2, 3], "equal-priority threads did not run in creation order");
}

/// S6 — sleep does not busy-wait: a thread sleeping for N ticks is off the
/// ready queue for the whole interval, demonstrated by a lower-priority
/// thread's counter advancing while the sleeper is parked, and the
/// sleeper waking no earlier than its deadline.
///
/// The test thread itself also sleeps (for longer than the sleeper under
/// test) rather than busy-yielding to wait for it: a busy-yield loop at
/// this thread's own priority would starve the lower-priority counter
/// thread outright (strict fixed-priority scheduling has no aging,
/// spec.md §1 non-goals), which would make this test measure starvation
/// instead of the sleep facility.
#[test_case]
fn sleep_does_not_busy_wait() {
    const SLEEP_TICKS: i64 = 20;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    static START_TICK: AtomicU64 = AtomicU64::new(0);
    static WAKE_TICK: AtomicU64 = AtomicU64::new(0);
    static STOP: AtomicBool = AtomicBool::new(false);

    let mine = thread::get_priority();

    thread::create("s6-counter", mine.saturating_sub(5), || {
        while !STOP.load(Ordering::Relaxed) {
            COUNTER.fetch_add(1, Ordering::Relaxed);
            thread::yield_now();
        }
    })
    .expect("spawn s6 counter thread");

    thread::create("s6-sleeper", mine, || {
        START_TICK.store(timer::ticks(), Ordering::SeqCst);
        timer::sleep(SLEEP_TICKS);
        WAKE_TICK.store(timer::ticks(), Ordering::SeqCst);
        STOP.store(true, Ordering::SeqCst);
    })
    .expect("spawn s6 sleeper thread");

    timer::sleep(SLEEP_TICKS + 50);

    let start = START_TICK.load(Ordering::SeqCst);
    let wake = WAKE_TICK.load(Ordering::SeqCst);
    assert!(start > 0, "sleeper thread never ran");
    assert!(wake >= start + SLEEP_TICKS as u64, "sleeper woke before its deadline");
    // Generous upper bound: under no real load this should wake within a
    // handful of ticks of the deadline, not hundreds.
    assert!(wake < start + SLEEP_TICKS as u64 + 200, "sleeper woke unreasonably late");
    assert!(COUNTER.load(Ordering::Relaxed) > 0, "lower-priority thread never ran while sleeper was parked");
}

/// S3 — simple donation: a low-priority thread holds a lock, a
/// higher-priority thread blocks on it and donates, the holder's
/// effective priority rises for as long as it holds the lock, and drops
/// back to its base the moment it releases.
///
/// Sequencing is by sleep deadline rather than a shared flag the holder
/// polls: `donate()` stamps the donated-to thread's priority directly
/// regardless of which list it currently sits on (ready, sleep, or a
/// semaphore's waiter list), so a holder parked in `timer::sleep` sees
/// the donation exactly the same as a holder sitting in the ready queue
/// would — and parking it removes any need for it to poll anything at a
/// priority that could race with, or starve, the donor.
#[test_case]
fn simple_donation_raises_and_restores_priority() {
    static HOLDER_PRIORITY_WHILE_DONATED: AtomicU32 = AtomicU32::new(0);
    static HOLDER_PRIORITY_AFTER_RELEASE: AtomicU32 = AtomicU32::new(0);

    let mine = thread::get_priority();
    let low_priority = mine.saturating_sub(10);
    let high_priority = mine.saturating_add(10).min(63);
    let lock = Arc::new(Lock::new());

    let holder_lock = lock.clone();
    thread::create("s3-holder", low_priority, move || {
        holder_lock.acquire();
        // Long enough for the driver to wake, create the waiter, and for
        // the waiter's donation to land while this thread is parked.
        timer::sleep(8);
        HOLDER_PRIORITY_WHILE_DONATED.store(thread::get_priority() as u32, Ordering::SeqCst);
        holder_lock.release();
        HOLDER_PRIORITY_AFTER_RELEASE.store(thread::get_priority() as u32, Ordering::SeqCst);
    })
    .expect("spawn s3 holder");

    // Let the holder actually acquire the lock (and start its sleep)
    // before the higher-priority waiter exists to contend for it.
    timer::sleep(3);

    let waiter_lock = lock.clone();
    thread::create("s3-waiter", high_priority, move || {
        waiter_lock.acquire();
        waiter_lock.release();
    })
    .expect("spawn s3 waiter");

    // Covers the holder's remaining sleep plus enough margin to record
    // and release.
    timer::sleep(15);

    assert_eq!(
        HOLDER_PRIORITY_WHILE_DONATED.load(Ordering::SeqCst),
        high_priority as u32,
        "holder did not receive the waiter's donated priority"
    );
    assert_eq!(
        HOLDER_PRIORITY_AFTER_RELEASE.load(Ordering::SeqCst),
        low_priority as u32,
        "holder's priority was not restored after releasing the lock"
    );
}

/// S4 — nested donation: L holds lock A, M holds lock B and blocks on A
/// (donating to L), H blocks on B (donating to M, which propagates
/// through to L since M itself is blocked waiting on L). L should see
/// H's priority, two links away, not just M's.
#[test_case]
fn nested_donation_propagates_through_two_locks() {
    static L_PRIORITY_AT_PEAK: AtomicU32 = AtomicU32::new(0);

    let mine = thread::get_priority();
    let low_priority = mine.saturating_sub(15);
    let med_priority = mine;
    let high_priority = mine.saturating_add(15).min(63);

    let lock_a = Arc::new(Lock::new());
    let lock_b = Arc::new(Lock::new());

    let l_lock_a = lock_a.clone();
    thread::create("s4-low", low_priority, move || {
        l_lock_a.acquire();
        // Long enough to still be parked when H's donation cascades
        // through M to here.
        timer::sleep(14);
        L_PRIORITY_AT_PEAK.store(thread::get_priority() as u32, Ordering::SeqCst);
        l_lock_a.release();
    })
    .expect("spawn s4 low");

    // Let L acquire lock A before M exists to contend for it.
    timer::sleep(3);

    let m_lock_a = lock_a.clone();
    let m_lock_b = lock_b.clone();
    thread::create("s4-med", med_priority, move || {
        m_lock_b.acquire();
        m_lock_a.acquire(); // blocks on L, donates med_priority directly
        m_lock_a.release();
        m_lock_b.release();
    })
    .expect("spawn s4 med");

    // Let M acquire lock B and block on lock A before H exists to
    // contend for B. Equal to the driver's own priority, so it never
    // preempts on creation, but it's the only other non-idle ready
    // thread once the driver sleeps and runs to its blocking point well
    // within the window (no sleeps on its own path).
    timer::sleep(3);

    let h_lock_b = lock_b.clone();
    thread::create("s4-high", high_priority, move || {
        h_lock_b.acquire(); // blocks on M, donates high_priority; the
                             // chain walk inside `donate` follows M's
                             // `wait_on_lock` to A and raises L too
        h_lock_b.release();
    })
    .expect("spawn s4 high");

    // Covers L's remaining sleep plus margin to record and release.
    timer::sleep(15);

    assert_eq!(
        L_PRIORITY_AT_PEAK.load(Ordering::SeqCst),
        high_priority as u32,
        "donation did not propagate through the nested lock chain to the root holder"
    );
}
