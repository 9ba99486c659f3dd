//! Interrupt Descriptor Table (IDT), PIC remapping, and PIT programming.
//!
//! The IDT tells the CPU which function to call for each interrupt:
//!   - 0-31: CPU exceptions (divide by zero, page fault, double fault, etc.)
//!   - 32-47: Hardware interrupts (remapped from PIC: timer, keyboard, etc.)
//!   - 0x81: the software reschedule trap `hal::request_switch` raises.
//!
//! The PIC 8259 manages hardware interrupts. We remap IRQs 0-7 from
//! IDT entries 8-15 to 32-47 to avoid colliding with CPU exceptions.
//!
//! The timer and reschedule vectors don't point at ordinary
//! `extern "x86-interrupt"` functions — they point at `hal`'s raw
//! assembly trampolines (`hal::timer_isr_addr`/`hal::resched_isr_addr`),
//! which save the full register file and call back into `hal`'s Rust
//! entry points. That split exists because those two vectors are the ones
//! that can resume a *different* thread's stack than the one they
//! interrupted; every other vector here returns to where it was raised
//! and can use the ordinary `x86-interrupt` ABI.

use crate::gdt;
use crate::hal;
use crate::hlt_loop;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::VirtAddr;

const PIT_OSCILLATOR_HZ: u32 = 1_193_182;
const PIT_COMMAND_PORT: u16 = 0x43;
const PIT_CHANNEL0_PORT: u16 = 0x40;

/// Configures the 8254 PIT to fire at `hz`, the tick rate the rest of the
/// core treats as the unit of time (spec.md §4.3, GLOSSARY "Tick").
pub fn init_pit(hz: u32) {
    let divisor: u16 = (PIT_OSCILLATOR_HZ / hz) as u16;
    unsafe {
        Port::new(PIT_COMMAND_PORT).write(0x36u8);
        Port::new(PIT_CHANNEL0_PORT).write((divisor & 0xFF) as u8);
        Port::new(PIT_CHANNEL0_PORT).write((divisor >> 8) as u8);
    }
}

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
}

static IDT: spin::Once<InterruptDescriptorTable> = spin::Once::new();

pub fn init_idt() {
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt[InterruptIndex::Timer as u8].set_handler_addr(VirtAddr::new(hal::timer_isr_addr()));
            idt[hal::RESCHED_VECTOR].set_handler_addr(VirtAddr::new(hal::resched_isr_addr()));
        }
        idt
    });
    idt.load();
}

/// Enables the PIC's timer line. Separated from `init_idt`/`init_pit` so
/// callers can finish all other bring-up (heap, scheduler globals) before
/// the first tick can possibly arrive.
pub fn init_pic() {
    unsafe { PICS.lock().initialize() };
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    crate::println!("EXCEPTION: PAGE FAULT");
    crate::println!("Accessed Address: {:?}", Cr2::read());
    crate::println!("Error Code: {:?}", error_code);
    crate::println!("{:#?}", stack_frame);
    hlt_loop();
}

/// Sends end-of-interrupt for the timer line. Called from `hal`'s timer
/// trampoline (`hal::hal_timer_entry`) before it hands off to
/// `timer::on_tick`/the scheduler, matching the order the PIC-based
/// teacher code used (EOI, then the rest of the handler).
pub fn on_timer_irq() {
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::Timer as u8);
    }
}
