//! Scheduler and synchronization core for a small preemptive kernel.
//!
//! Everything below `hal` is pure logic: intrusive queues, priority math,
//! donation, the semaphore/lock/condvar contracts. `hal` is the one module
//! that talks to the CPU (interrupt masking, context switch, page
//! allocation). That split is what lets `list`, `thread`, `timer`, and
//! `sync` carry `#[cfg(test)]` unit tests that run under host `cargo test`
//! (where this crate compiles against `std`), while the crate as a whole
//! stays `no_std` for the real x86_64 target used by `main.rs` and the
//! `tests/*.rs` QEMU integration binaries.
#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod allocator;
pub mod config;
pub mod console;
pub mod font;
pub mod framebuffer;
pub mod gdt;
pub mod hal;
pub mod interrupts;
pub mod list;
pub mod memory;
pub mod serial;
pub mod sync;
pub mod thread;
pub mod timer;
pub mod vga_buffer;

#[cfg(not(test))]
use core::panic::PanicInfo;

/// Bring up the pieces every entry point (the kernel binary and the
/// integration tests in `tests/`) needs before anything else can run:
/// GDT/TSS, IDT + PIC + PIT. Does not touch the scheduler or enable
/// interrupts — that is `thread::init`/`thread::start`, called separately
/// so tests that only need interrupt plumbing don't pay for it.
pub fn init() {
    gdt::init();
    interrupts::init_idt();
    interrupts::init_pic();
    interrupts::init_pit(config::BootConfig::get().pit_hz);
}

pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(::core::format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", ::core::format_args!($($arg)*)));
}

// --- QEMU integration test harness ---
//
// `tests/*.rs` are each their own `#![no_std] #![no_main]` binary with their
// own `#[test_case]`s, custom test-framework attributes, and panic handler
// that forwards to `test_panic_handler` below. This module just supplies the
// shared plumbing (the `Testable` wrapper, the runner, and the QEMU exit
// port) so every integration binary doesn't reimplement it.

#[cfg(not(test))]
pub trait Testable {
    fn run(&self);
}

#[cfg(not(test))]
impl<T: Fn()> Testable for T {
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

#[cfg(not(test))]
pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

#[cfg(not(test))]
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed);
    hlt_loop()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;
    unsafe {
        let mut port = Port::new(0xf4);
        port.write(exit_code as u32);
    }
}
