#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]

extern crate alloc;

use alloc::sync::Arc;
use bootloader_api::info::PixelFormat;
use bootloader_api::{entry_point, BootInfo, BootloaderConfig};
use core::panic::PanicInfo;

use kernel::sync::lock::Lock;
use kernel::{println, serial_println, thread};

#[allow(deprecated)]
pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(bootloader_api::config::Mapping::Dynamic);
    config.kernel_stack_size = 512 * 1024; // 512 KiB (default 80 KiB is too small)
    config.frame_buffer.minimum_framebuffer_height = Some(720);
    config.frame_buffer.minimum_framebuffer_width = Some(1280);
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    kernel::serial::init();
    serial_println!("Serial initialized");

    if let Some(fb) = boot_info.framebuffer.as_mut() {
        let info = fb.info();
        let fb_info = kernel::framebuffer::FramebufferInfo {
            width: info.width,
            height: info.height,
            stride: info.stride,
            bytes_per_pixel: info.bytes_per_pixel,
            is_bgr: matches!(info.pixel_format, PixelFormat::Bgr),
        };
        let (w, h) = (info.width, info.height);
        kernel::framebuffer::init(fb.buffer_mut(), fb_info);
        kernel::console::init(w, h);
        serial_println!("Framebuffer console initialized ({w}x{h})");
    } else {
        serial_println!("WARNING: no framebuffer available, falling back to serial only");
    }

    println!("Booting corekernel...");

    // GDT/TSS, IDT, PIC remap, PIT — everything short of enabling
    // interrupts and starting the scheduler (kernel::init() deliberately
    // stops there so tests that only need interrupt plumbing don't pay for
    // the rest).
    kernel::init();
    serial_println!("GDT, IDT, PIC, PIT initialized");

    let phys_mem_offset = x86_64::VirtAddr::new(
        boot_info
            .physical_memory_offset
            .into_option()
            .expect("physical_memory_offset not available"),
    );
    let mut mapper = unsafe { kernel::memory::init(phys_mem_offset) };
    let mut frame_allocator =
        unsafe { kernel::memory::BootInfoFrameAllocator::init(&boot_info.memory_regions) };
    kernel::allocator::init_heap(&mut mapper, &mut frame_allocator)
        .expect("heap initialization failed");
    serial_println!("Heap initialized");

    // Transform this boot stack into the main thread. Must happen before
    // any synchronization primitive is touched and before interrupts are
    // enabled (spec.md §4.2 `init`).
    thread::init();
    serial_println!("Scheduler core initialized");

    spawn_demo_workload();

    // Creates the idle thread and enables interrupts; blocks here until
    // the idle thread has recorded itself (spec.md §4.2 `start`). From
    // this point on the timer tick can preempt and the demo threads
    // spawned above actually run.
    thread::start();

    kernel::hlt_loop();
}

/// A small demonstration of priority donation (spec.md §8 scenario S3):
/// a low-priority thread grabs a lock, a medium- and a high-priority
/// thread each block trying to acquire it, and the low-priority thread's
/// effective priority gets boosted to the highest waiter's until it
/// releases. Exists to give the scheduler something to do on boot; not
/// itself part of the core being demonstrated.
fn spawn_demo_workload() {
    let lock = Arc::new(Lock::new());

    let lock_low = lock.clone();
    thread::create("low", 10, move || {
        lock_low.acquire();
        println!("[low]  acquired lock at priority {}", thread::get_priority());
        for _ in 0..3 {
            kernel::timer::sleep(2);
        }
        println!("[low]  releasing lock at priority {}", thread::get_priority());
        lock_low.release();
    })
    .expect("failed to spawn demo thread 'low'");

    let lock_med = lock.clone();
    thread::create("medium", 20, move || {
        kernel::timer::sleep(1);
        lock_med.acquire();
        println!("[med]  acquired lock at priority {}", thread::get_priority());
        lock_med.release();
    })
    .expect("failed to spawn demo thread 'medium'");

    let lock_high = lock.clone();
    thread::create("high", 30, move || {
        kernel::timer::sleep(1);
        lock_high.acquire();
        println!("[high] acquired lock at priority {}", thread::get_priority());
        lock_high.release();
    })
    .expect("failed to spawn demo thread 'high'");
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    serial_println!("{}", info);
    kernel::hlt_loop()
}
