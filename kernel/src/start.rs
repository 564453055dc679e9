//! Machine-mode boot: entry.S sets up a per-hart stack and calls start(),
//! which drops to supervisor mode and lands in kmain().

use core::arch::asm;
use core::ptr::addr_of_mut;

use crate::kmain;
use crate::memlayout::{clint_mtimecmp, CLINT_MTIME};
use crate::param::NCPU;
use crate::riscv::{
    r_mhartid, r_mie, r_mstatus, r_sie, w_medeleg, w_mepc, w_mideleg, w_mie, w_mscratch,
    w_mstatus, w_mtvec, w_pmpaddr0, w_pmpcfg0, w_satp, w_sie, w_tp, MIE_MTIE, MSTATUS_MIE,
    MSTATUS_MPP_MASK, MSTATUS_MPP_S, SIE_SEIE, SIE_SSIE, SIE_STIE,
};

/// entry.S needs one stack per CPU.
#[repr(C, align(16))]
struct Stack0([u8; 4096 * NCPU]);

#[allow(non_upper_case_globals)]
#[no_mangle]
static mut stack0: Stack0 = Stack0([0; 4096 * NCPU]);

/// A scratch area per CPU for machine-mode timer interrupts.
static mut TIMER_SCRATCH: [[u64; 5]; NCPU] = [[0; 5]; NCPU];

extern "C" {
    // kernelvec.S
    fn timervec();
}

/// entry.S jumps here in machine mode on stack0.
#[no_mangle]
extern "C" fn start() -> ! {
    // set M Previous Privilege mode to Supervisor, for mret.
    let mut x = r_mstatus();
    x &= !MSTATUS_MPP_MASK;
    x |= MSTATUS_MPP_S;
    w_mstatus(x);

    // set M Exception Program Counter to main, for mret.
    w_mepc(kmain as usize);

    // disable paging for now.
    w_satp(0);

    // delegate all interrupts and exceptions to supervisor mode.
    w_medeleg(0xffff);
    w_mideleg(0xffff);
    w_sie(r_sie() | SIE_SEIE | SIE_STIE | SIE_SSIE);

    // configure Physical Memory Protection to give supervisor mode
    // access to all of physical memory.
    w_pmpaddr0(0x3fffffffffffff);
    w_pmpcfg0(0xf);

    // ask for clock interrupts.
    timerinit();

    // keep each CPU's hartid in its tp register, for cpuid().
    let id = r_mhartid();
    w_tp(id);

    // switch to supervisor mode and jump to kmain().
    unsafe { asm!("mret", options(noreturn)) }
}

/// Arrange to receive timer interrupts. They arrive in machine mode at
/// timervec in kernelvec.S, which turns them into software interrupts for
/// devintr() in trap.rs.
fn timerinit() {
    // each CPU has a separate source of timer interrupts.
    let id = r_mhartid() as usize;

    // ask the CLINT for a timer interrupt.
    let interval = 1_000_000u64; // cycles; about 1/10th second in qemu.
    unsafe {
        let mtime = (CLINT_MTIME as *const u64).read_volatile();
        (clint_mtimecmp(id) as *mut u64).write_volatile(mtime + interval);
    }

    // prepare information in scratch[] for timervec.
    // scratch[0..2] : space for timervec to save registers.
    // scratch[3] : address of CLINT MTIMECMP register.
    // scratch[4] : desired interval (in cycles) between timer interrupts.
    unsafe {
        let scratch = &mut (*addr_of_mut!(TIMER_SCRATCH))[id];
        scratch[3] = clint_mtimecmp(id) as u64;
        scratch[4] = interval;
        w_mscratch(scratch.as_ptr() as usize);
    }

    // set the machine-mode trap handler.
    w_mtvec(timervec as usize);

    // enable machine-mode interrupts.
    w_mstatus(r_mstatus() | MSTATUS_MIE);

    // enable machine-mode timer interrupts.
    w_mie(r_mie() | MIE_MTIE);
}
