//! Trap handling: user and supervisor entry points, device-interrupt
//! classification, and the timer tick counter.

use core::cell::Cell;

use crate::proc::{sleep, wakeup, Chan};
use crate::spinlock::Spinlock;

struct Ticks {
    lock: Spinlock,
    count: Cell<u64>,
}

// `count` is only touched under `lock`.
unsafe impl Sync for Ticks {}

static TICKS: Ticks = Ticks {
    lock: Spinlock::new("time"),
    count: Cell::new(0),
};

pub fn trapinit() {
    // the tick lock is statically initialized; the call marks the boot step.
}

pub fn ticks() -> u64 {
    TICKS.lock.acquire();
    let t = TICKS.count.get();
    TICKS.lock.release();
    t
}

/// The timer tick handler: bump the counter and wake anyone waiting on it.
pub fn clockintr() {
    TICKS.lock.acquire();
    TICKS.count.set(TICKS.count.get() + 1);
    wakeup(Chan::of(&TICKS.count));
    TICKS.lock.release();
}

/// Park the caller until the tick counter has advanced by n.
pub fn ticks_sleep(n: u64) {
    TICKS.lock.acquire();
    let start = TICKS.count.get();
    while TICKS.count.get() - start < n {
        sleep(Chan::of(&TICKS.count), &TICKS.lock);
    }
    TICKS.lock.release();
}

/// What devintr decided a trap was.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DevIntr {
    NotRecognized,
    Device,
    Timer,
}

#[cfg(target_os = "none")]
mod vectors {
    use super::*;
    use crate::memlayout::{TRAMPOLINE, UART0_IRQ, VIRTIO0_IRQ};
    use crate::plic::{plic_claim, plic_complete};
    use crate::printf;
    use crate::proc::{
        current, cpuid, exit, killed, myproc, setkilled, yield_proc, ProcState,
    };
    use crate::riscv::{
        intr_get, intr_off, intr_on, make_satp, r_satp, r_scause, r_sepc, r_sip, r_sstatus,
        r_stval, r_tp, trapped_from_supervisor, w_sepc, w_sip, w_sstatus, w_stvec, PGSIZE,
        SSTATUS_SPIE, SSTATUS_SPP,
    };
    use crate::syscall::syscall;
    use crate::uart::uartintr;
    use crate::virtio::virtio_disk::virtio_disk_intr;
    use crate::vm::PageTable;

    extern "C" {
        // kernelvec.S, calls kerneltrap().
        fn kernelvec();
        // trampoline.S
        static trampoline: u8;
        static uservec: u8;
        static userret: u8;
    }

    /// Set up to take exceptions and traps while in the kernel.
    pub fn trapinithart() {
        w_stvec(kernelvec as usize);
    }

    /// Handle an interrupt, exception, or system call from user space.
    /// Called from trampoline.S.
    #[no_mangle]
    pub extern "C" fn usertrap() {
        if trapped_from_supervisor() {
            panic!("usertrap: not from user mode");
        }

        // send interrupts and exceptions to kerneltrap(),
        // since we're now in the kernel.
        w_stvec(kernelvec as usize);

        let p = myproc();

        // save user program counter.
        p.trapframe().epc = r_sepc() as u64;

        let mut which_dev = DevIntr::NotRecognized;
        if r_scause() == 8 {
            // system call

            if killed(p) {
                exit(-1);
            }

            // sepc points to the ecall instruction,
            // but we want to return to the next instruction.
            p.trapframe().epc += 4;

            // an interrupt will change sepc, scause, and sstatus,
            // so enable only now that we're done with those registers.
            intr_on();

            syscall();
        } else {
            which_dev = devintr();
            if which_dev == DevIntr::NotRecognized {
                log::warn!(
                    "usertrap(): unexpected scause {:#x} pid={}",
                    r_scause(),
                    p.pid()
                );
                printf!("            sepc={:#x} stval={:#x}\n", r_sepc(), r_stval());
                setkilled(p);
            }
        }

        if killed(p) {
            exit(-1);
        }

        // give up the CPU if this is a timer interrupt.
        if which_dev == DevIntr::Timer {
            yield_proc();
        }

        usertrapret();
    }

    /// Return to user space.
    pub fn usertrapret() {
        let p = myproc();

        // we're about to switch the destination of traps from
        // kerneltrap() to usertrap(), so turn off interrupts until
        // we're back in user space, where usertrap() is correct.
        intr_off();

        // send syscalls, interrupts, and exceptions to uservec in
        // trampoline.S
        let trampoline_addr = unsafe { &trampoline as *const u8 as usize };
        let uservec_addr = unsafe { &uservec as *const u8 as usize };
        w_stvec(TRAMPOLINE + (uservec_addr - trampoline_addr));

        // set up trapframe values that uservec will need when
        // the process next traps into the kernel.
        let tf = p.trapframe();
        tf.kernel_satp = r_satp() as u64; // kernel page table
        tf.kernel_sp = (p.kstack.get() + PGSIZE) as u64; // process's kernel stack
        tf.kernel_trap = usertrap as usize as u64;
        tf.kernel_hartid = r_tp(); // hartid for cpuid()

        // set up the registers that trampoline.S's sret will use
        // to get to user space.

        // set S Previous Privilege mode to User.
        let mut x = r_sstatus();
        x &= !SSTATUS_SPP; // clear SPP to 0 for user mode
        x |= SSTATUS_SPIE; // enable interrupts in user mode
        w_sstatus(x);

        // set S Exception Program Counter to the saved user pc.
        w_sepc(tf.epc as usize);

        // tell trampoline.S the user page table to switch to.
        let satp = make_satp(p.pagetable() as *const PageTable as usize);

        // jump to userret in trampoline.S at the top of memory, which
        // switches to the user page table, restores user registers,
        // and switches to user mode with sret.
        let userret_addr = unsafe { &userret as *const u8 as usize };
        let trampoline_userret = TRAMPOLINE + (userret_addr - trampoline_addr);
        let userret_fn: extern "C" fn(usize) =
            unsafe { core::mem::transmute(trampoline_userret) };
        userret_fn(satp);
    }

    /// Interrupts and exceptions from kernel code come here via kernelvec,
    /// on whatever the current kernel stack is.
    #[no_mangle]
    pub extern "C" fn kerneltrap() {
        let sepc = r_sepc();
        let sstatus = r_sstatus();
        let scause = r_scause();

        if !trapped_from_supervisor() {
            panic!("kerneltrap: not from supervisor mode");
        }
        if intr_get() {
            panic!("kerneltrap: interrupts enabled");
        }

        let which_dev = devintr();
        if which_dev == DevIntr::NotRecognized {
            printf!(
                "scause={:#x} sepc={:#x} stval={:#x}\n",
                scause,
                r_sepc(),
                r_stval()
            );
            panic!("kerneltrap");
        }

        // give up the CPU if this is a timer interrupt.
        if which_dev == DevIntr::Timer {
            if let Some(p) = current() {
                if p.state.get() == ProcState::Running {
                    yield_proc();
                }
            }
        }

        // the yield() may have caused some traps to occur,
        // so restore trap registers for use by kernelvec.S's sepc
        // instruction.
        w_sepc(sepc);
        w_sstatus(sstatus);
    }

    /// Check if it's an external interrupt or software interrupt,
    /// and handle it.
    pub fn devintr() -> DevIntr {
        let scause = r_scause();

        if scause & 0x8000_0000_0000_0000 != 0 && scause & 0xff == 9 {
            // this is a supervisor external interrupt, via PLIC.

            // irq indicates which device interrupted.
            let irq = plic_claim();

            if irq == UART0_IRQ {
                uartintr();
            } else if irq == VIRTIO0_IRQ {
                virtio_disk_intr();
            } else if irq != 0 {
                log::warn!("unexpected interrupt irq={}", irq);
            }

            // the PLIC allows each device to raise at most one
            // interrupt at a time; tell the PLIC the device is
            // now allowed to interrupt again.
            if irq != 0 {
                plic_complete(irq);
            }

            DevIntr::Device
        } else if scause == 0x8000_0000_0000_0001 {
            // software interrupt from a machine-mode timer interrupt,
            // forwarded by timervec in kernelvec.S.

            if cpuid() == 0 {
                clockintr();
            }

            // acknowledge the software interrupt by clearing
            // the SSIP bit in sip.
            w_sip(r_sip() & !2);

            DevIntr::Timer
        } else {
            DevIntr::NotRecognized
        }
    }
}

#[cfg(target_os = "none")]
pub use vectors::{devintr, kerneltrap, trapinithart, usertrap, usertrapret};

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn clockintr_advances_the_counter_and_wakes_sleepers() {
        let before = ticks();

        let waiter = thread::spawn(|| ticks_sleep(1));

        // tick until the waiter has observed an advance. more than one tick
        // may be needed if the waiter parks late.
        for _ in 0..10_000 {
            clockintr();
            if waiter.is_finished() {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(1));
        }
        waiter.join().unwrap();

        assert!(ticks() > before);
    }
}
