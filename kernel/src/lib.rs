//! osmium — a teaching-grade multicore RISC-V kernel.
//!
//! The crate builds two ways:
//!
//! * `riscv64gc-unknown-none-elf` (`target_os = "none"`): the real kernel,
//!   booted by qemu's `-machine virt` via `asm/entry.S`.
//! * hosted targets: the architecture layer, scheduler, MMU helpers, disk
//!   and filesystem are replaced by in-process simulations so the core
//!   (allocator, locks, buffer cache, log, exec, pipes) runs under the
//!   ordinary `cargo test` harness.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod printf;

pub mod bio;
pub mod buf;
pub mod elf;
pub mod exec;
pub mod file;
pub mod fs;
pub mod kalloc;
pub mod log;
pub mod memlayout;
pub mod param;
pub mod pipe;
pub mod proc;
pub mod riscv;
pub mod sleeplock;
pub mod spinlock;
pub mod trap;
pub mod vm;

#[cfg(target_os = "none")]
mod asm;
#[cfg(target_os = "none")]
pub mod console;
#[cfg(target_os = "none")]
pub mod plic;
#[cfg(target_os = "none")]
pub mod start;
#[cfg(target_os = "none")]
pub mod syscall;
#[cfg(target_os = "none")]
pub mod uart;
#[cfg(target_os = "none")]
pub mod virtio;

#[cfg(target_os = "none")]
use core::sync::atomic::{fence, AtomicBool, Ordering};

#[cfg(target_os = "none")]
static STARTED: AtomicBool = AtomicBool::new(false);

/// start() jumps here in supervisor mode on all CPUs.
#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    if proc::cpuid() == 0 {
        console::consoleinit();
        printf::loginit();
        printf!("\nosmium kernel is booting\n\n");

        kalloc::kinit(); // physical frame allocator
        vm::kvminit(); // create kernel page table
        vm::kvminithart(); // turn on paging
        proc::procinit(); // process table
        trap::trapinit(); // trap vectors
        trap::trapinithart(); // install kernel trap vector
        plic::plicinit(); // set up interrupt controller
        plic::plicinithart(); // ask PLIC for device interrupts
        bio::binit(); // buffer cache
        file::fileinit(); // file table
        virtio::virtio_disk::virtio_disk_init(); // emulated hard disk
        proc::userinit(); // first user process
        ::log::info!("boot sequence complete on hart 0");

        fence(Ordering::SeqCst);
        STARTED.store(true, Ordering::Relaxed);
    } else {
        while !STARTED.load(Ordering::Relaxed) {}

        fence(Ordering::SeqCst);
        ::log::info!("hart {} starting", proc::cpuid());
        vm::kvminithart(); // turn on paging
        trap::trapinithart(); // install kernel trap vector
        plic::plicinithart(); // ask PLIC for device interrupts
    }

    proc::scheduler();
}
