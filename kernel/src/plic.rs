//! The riscv Platform Level Interrupt Controller (PLIC).

use crate::memlayout::{plic_sclaim, plic_senable, plic_spriority, PLIC, UART0_IRQ, VIRTIO0_IRQ};
use crate::proc::cpuid;

pub fn plicinit() {
    // set desired IRQ priorities non-zero (otherwise disabled).
    unsafe {
        ((PLIC + UART0_IRQ as usize * 4) as *mut u32).write_volatile(1);
        ((PLIC + VIRTIO0_IRQ as usize * 4) as *mut u32).write_volatile(1);
    }
}

pub fn plicinithart() {
    let hart = cpuid();
    unsafe {
        // set enable bits for this hart's S-mode
        // for the uart and virtio disk.
        (plic_senable(hart) as *mut u32).write_volatile((1 << UART0_IRQ) | (1 << VIRTIO0_IRQ));

        // set this hart's S-mode priority threshold to 0.
        (plic_spriority(hart) as *mut u32).write_volatile(0);
    }
}

/// Ask the PLIC what interrupt we should serve.
pub fn plic_claim() -> u32 {
    let hart = cpuid();
    unsafe { (plic_sclaim(hart) as *const u32).read_volatile() }
}

/// Tell the PLIC we've served this IRQ.
pub fn plic_complete(irq: u32) {
    let hart = cpuid();
    unsafe { (plic_sclaim(hart) as *mut u32).write_volatile(irq) }
}
