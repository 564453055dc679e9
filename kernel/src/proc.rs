//! Processes, CPUs and the scheduling primitives the rest of the kernel
//! leans on: `sleep`/`wakeup` wait channels, voluntary yield, and the
//! per-process trap frame / context records.

use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::riscv::r_tp;
use crate::spinlock::{pop_off, push_off, Spinlock};
use crate::vm::PageTable;

#[cfg(target_os = "none")]
use crate::file::File;
#[cfg(target_os = "none")]
use crate::param::NOFILE;

/// Saved registers for kernel context switches.
#[repr(C)]
pub struct Context {
    pub ra: u64,
    pub sp: u64,

    // callee-saved
    pub s0: u64,
    pub s1: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
}

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

/// Per-process data for the trap handling code in trampoline.S.
/// Sits in a page by itself just under the trampoline page in the
/// user page table. Not specially mapped in the kernel page table.
/// uservec in trampoline.S saves user registers in the trapframe,
/// then initializes registers from the trapframe's
/// kernel_sp, kernel_hartid, kernel_satp, and jumps to kernel_trap.
/// usertrapret() and userret in trampoline.S set up
/// the trapframe's kernel_*, restore user registers from the
/// trapframe, switch to the user page table, and enter user space.
/// The trapframe includes callee-saved user registers like s0-s11 because
/// the return-to-user path via usertrapret() doesn't return through
/// the entire kernel call stack.
///
/// The field offsets are part of the ABI with trampoline.S, which indexes
/// this struct by byte offset: do not reorder.
#[repr(C)]
pub struct TrapFrame {
    /*   0 */ pub kernel_satp: u64, // kernel page table
    /*   8 */ pub kernel_sp: u64, // top of process's kernel stack
    /*  16 */ pub kernel_trap: u64, // usertrap()
    /*  24 */ pub epc: u64, // saved user program counter
    /*  32 */ pub kernel_hartid: u64, // saved kernel tp
    /*  40 */ pub ra: u64,
    /*  48 */ pub sp: u64,
    /*  56 */ pub gp: u64,
    /*  64 */ pub tp: u64,
    /*  72 */ pub t0: u64,
    /*  80 */ pub t1: u64,
    /*  88 */ pub t2: u64,
    /*  96 */ pub s0: u64,
    /* 104 */ pub s1: u64,
    /* 112 */ pub a0: u64,
    /* 120 */ pub a1: u64,
    /* 128 */ pub a2: u64,
    /* 136 */ pub a3: u64,
    /* 144 */ pub a4: u64,
    /* 152 */ pub a5: u64,
    /* 160 */ pub a6: u64,
    /* 168 */ pub a7: u64,
    /* 176 */ pub s2: u64,
    /* 184 */ pub s3: u64,
    /* 192 */ pub s4: u64,
    /* 200 */ pub s5: u64,
    /* 208 */ pub s6: u64,
    /* 216 */ pub s7: u64,
    /* 224 */ pub s8: u64,
    /* 232 */ pub s9: u64,
    /* 240 */ pub s10: u64,
    /* 248 */ pub s11: u64,
    /* 256 */ pub t3: u64,
    /* 264 */ pub t4: u64,
    /* 272 */ pub t5: u64,
    /* 280 */ pub t6: u64,
}

impl TrapFrame {
    pub fn zeroed() -> Self {
        // all fields are plain machine words; the all-zero pattern is valid.
        unsafe { core::mem::zeroed() }
    }
}

/// Per-CPU state.
pub struct Cpu {
    // The process running on this cpu, or none.
    pub(crate) proc: Cell<Option<NonNull<Proc>>>,
    // swtch() here to enter scheduler().
    pub(crate) context: UnsafeCell<Context>,
    // Depth of push_off() nesting.
    pub noff: Cell<i32>,
    // Were interrupts enabled before push_off()?
    pub intena: Cell<bool>,
}

// Each CPU structure is only ever touched by its own hart, with interrupts
// disabled while `proc`/`noff`/`intena` are read or written.
unsafe impl Sync for Cpu {}

impl Cpu {
    pub const fn new() -> Self {
        Cpu {
            proc: Cell::new(None),
            context: UnsafeCell::new(Context::zeroed()),
            noff: Cell::new(0),
            intena: Cell::new(false),
        }
    }
}

/// A wait channel: an opaque token identifying one sleep/wakeup queue.
/// Built from a stable kernel address, so unrelated queues can never alias.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Chan(pub(crate) usize);

impl Chan {
    pub fn of<T>(r: &T) -> Chan {
        Chan(r as *const T as usize)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Per-process state.
pub struct Proc {
    pub lock: Spinlock,

    // lock must be held when using these:
    pub(crate) state: Cell<ProcState>,
    pub(crate) chan: Cell<Option<Chan>>, // if some, sleeping on chan
    pub(crate) killed: Cell<bool>,
    pub(crate) xstate: Cell<i32>, // exit status
    pub(crate) pid: Cell<u32>,

    // these are private to the process, so lock need not be held:
    pub(crate) kstack: Cell<usize>, // virtual address of kernel stack
    pub(crate) sz: Cell<usize>,     // size of process memory (bytes)
    pub(crate) pagetable: Cell<Option<NonNull<PageTable>>>,
    pub(crate) trapframe: Cell<Option<NonNull<TrapFrame>>>,
    pub(crate) context: UnsafeCell<Context>, // swtch() here to run process
    #[cfg(target_os = "none")]
    pub(crate) ofile: UnsafeCell<[Option<&'static File>; NOFILE]>, // open files
    pub(crate) name: UnsafeCell<[u8; 16]>, // process name (debugging)
}

// The `Cell` fields above are either guarded by `lock` or private to the
// process that owns the slot; cross-hart access goes through the lock.
unsafe impl Sync for Proc {}

impl Proc {
    pub const fn new() -> Self {
        Proc {
            lock: Spinlock::new("proc"),
            state: Cell::new(ProcState::Unused),
            chan: Cell::new(None),
            killed: Cell::new(false),
            xstate: Cell::new(0),
            pid: Cell::new(0),
            kstack: Cell::new(0),
            sz: Cell::new(0),
            pagetable: Cell::new(None),
            trapframe: Cell::new(None),
            context: UnsafeCell::new(Context::zeroed()),
            #[cfg(target_os = "none")]
            ofile: UnsafeCell::new([None; NOFILE]),
            name: UnsafeCell::new([0; 16]),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.get()
    }

    pub fn sz(&self) -> usize {
        self.sz.get()
    }

    pub(crate) fn set_sz(&self, sz: usize) {
        self.sz.set(sz);
    }

    /// The process's trap frame. Valid once the process is allocated.
    pub fn trapframe(&self) -> &mut TrapFrame {
        match self.trapframe.get() {
            Some(tf) => unsafe { &mut *tf.as_ptr() },
            None => panic!("proc has no trapframe"),
        }
    }

    /// The process's user page table. Valid once the process is allocated.
    pub fn pagetable(&self) -> &'static mut PageTable {
        match self.pagetable.get() {
            Some(pt) => unsafe { &mut *pt.as_ptr() },
            None => panic!("proc has no pagetable"),
        }
    }

    pub(crate) fn set_name(&self, name: &str) {
        let dst = unsafe { &mut *self.name.get() };
        *dst = [0; 16];
        for (d, s) in dst.iter_mut().zip(name.bytes()) {
            *d = s;
        }
    }
}

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

fn allocpid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Must be called with interrupts disabled, to prevent a race with the
/// process being moved to a different CPU.
pub fn cpuid() -> usize {
    r_tp() as usize
}

/// The current process, if any.
pub fn current() -> Option<&'static Proc> {
    push_off();
    let p = mycpu().proc.get();
    pop_off();
    p.map(|p| unsafe { &*p.as_ptr() })
}

/// The current process; panics when called outside process context.
pub fn myproc() -> &'static Proc {
    match current() {
        Some(p) => p,
        None => panic!("myproc: no process"),
    }
}

pub fn killed(p: &Proc) -> bool {
    p.lock.acquire();
    let k = p.killed.get();
    p.lock.release();
    k
}

pub fn setkilled(p: &Proc) {
    p.lock.acquire();
    p.killed.set(true);
    p.lock.release();
}

/// Copy to either a user address, or a kernel address,
/// depending on usr_dst.
pub fn either_copyout(user_dst: bool, dst: usize, src: *const u8, len: usize) -> Result<(), ()> {
    if user_dst {
        crate::vm::copyout(myproc().pagetable(), dst, src, len)
    } else {
        unsafe { core::ptr::copy(src, dst as *mut u8, len) };
        Ok(())
    }
}

/// Copy from either a user address, or a kernel address,
/// depending on usr_src.
pub fn either_copyin(user_src: bool, dst: *mut u8, src: usize, len: usize) -> Result<(), ()> {
    if user_src {
        crate::vm::copyin(myproc().pagetable(), dst, src, len)
    } else {
        unsafe { core::ptr::copy(src as *const u8, dst, len) };
        Ok(())
    }
}

#[cfg(target_os = "none")]
mod sched {
    use core::arch::asm;
    use core::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::kalloc;
    use crate::memlayout::{kstack, TRAMPOLINE, TRAPFRAME};
    use crate::param::{NCPU, NPROC, ROOTDEV};
    use crate::riscv::{intr_get, intr_on, PteFlags, PGSIZE};
    use crate::trap::usertrapret;
    use crate::vm;

    extern "C" {
        // swtch.S: save the current registers in old, load from new.
        fn swtch(old: *mut Context, new: *mut Context);
        // trampoline.S
        static trampoline: u8;
    }

    static CPUS: [Cpu; NCPU] = [const { Cpu::new() }; NCPU];
    static PROCS: [Proc; NPROC] = [const { Proc::new() }; NPROC];

    /// Return this CPU's cpu struct.
    /// Interrupts must be disabled.
    pub fn mycpu() -> &'static Cpu {
        &CPUS[cpuid()]
    }

    /// Allocate a page for each process's kernel stack.
    /// Map it high in memory, followed by an invalid guard page.
    pub fn proc_mapstacks(kpgtbl: &mut PageTable) {
        for i in 0..NPROC {
            let pa = kalloc::kalloc();
            if pa.is_null() {
                panic!("proc_mapstacks: kalloc");
            }
            vm::kvmmap(
                kpgtbl,
                kstack(i),
                pa as usize,
                PGSIZE,
                PteFlags::R | PteFlags::W,
            );
        }
    }

    /// Initialize the process table.
    pub fn procinit() {
        for (i, p) in PROCS.iter().enumerate() {
            p.kstack.set(kstack(i));
        }
    }

    /// Look in the process table for an UNUSED proc.
    /// If found, initialize state required to run in the kernel,
    /// and return with the proc's lock held.
    /// If there are no free procs, or a memory allocation fails, return None.
    fn allocproc() -> Option<&'static Proc> {
        for p in PROCS.iter() {
            p.lock.acquire();
            if p.state.get() != ProcState::Unused {
                p.lock.release();
                continue;
            }

            p.pid.set(allocpid());
            p.state.set(ProcState::Used);

            // Allocate a trapframe page.
            let tf = kalloc::kalloc();
            if tf.is_null() {
                freeproc(p);
                p.lock.release();
                return None;
            }
            p.trapframe.set(NonNull::new(tf as *mut TrapFrame));

            // An empty user page table.
            match proc_pagetable(p) {
                Some(pt) => p.pagetable.set(Some(NonNull::from(pt))),
                None => {
                    freeproc(p);
                    p.lock.release();
                    return None;
                }
            }

            // Set up new context to start executing at forkret,
            // which returns to user space.
            let ctx = unsafe { &mut *p.context.get() };
            *ctx = Context::zeroed();
            ctx.ra = forkret as usize as u64;
            ctx.sp = (p.kstack.get() + PGSIZE) as u64;

            return Some(p);
        }
        None
    }

    /// Free a proc structure and the data hanging from it,
    /// including user pages. The proc's lock must be held.
    fn freeproc(p: &Proc) {
        if let Some(tf) = p.trapframe.get() {
            kalloc::kfree(tf.as_ptr() as *mut u8);
        }
        p.trapframe.set(None);
        if let Some(pt) = p.pagetable.get() {
            proc_freepagetable(unsafe { &mut *pt.as_ptr() }, p.sz.get());
        }
        p.pagetable.set(None);
        p.sz.set(0);
        p.pid.set(0);
        p.chan.set(None);
        p.killed.set(false);
        p.xstate.set(0);
        p.set_name("");
        p.state.set(ProcState::Unused);
    }

    /// Create a user page table for a given process, with no user memory,
    /// but with trampoline and trapframe pages.
    pub fn proc_pagetable(p: &Proc) -> Option<&'static mut PageTable> {
        // An empty page table.
        let pagetable = vm::uvmcreate()?;

        // map the trampoline code (for system call return)
        // at the highest user virtual address.
        // only the supervisor uses it, on the way
        // to/from user space, so not PTE_U.
        let trampoline_pa = unsafe { &trampoline as *const u8 as usize };
        if vm::mappages(
            pagetable,
            TRAMPOLINE,
            trampoline_pa,
            PGSIZE,
            PteFlags::R | PteFlags::X,
        )
        .is_err()
        {
            vm::uvmfree(pagetable, 0);
            return None;
        }

        // map the trapframe page just below the trampoline page, for
        // trampoline.S.
        let trapframe_pa = p.trapframe() as *const TrapFrame as usize;
        if vm::mappages(
            pagetable,
            TRAPFRAME,
            trapframe_pa,
            PGSIZE,
            PteFlags::R | PteFlags::W,
        )
        .is_err()
        {
            vm::uvmunmap(pagetable, TRAMPOLINE, 1, false);
            vm::uvmfree(pagetable, 0);
            return None;
        }

        Some(pagetable)
    }

    /// Free a process's page table, and free the
    /// physical memory it refers to.
    pub fn proc_freepagetable(pagetable: &mut PageTable, sz: usize) {
        vm::uvmunmap(pagetable, TRAMPOLINE, 1, false);
        vm::uvmunmap(pagetable, TRAPFRAME, 1, false);
        vm::uvmfree(pagetable, sz);
    }

    /// A user program that calls exec("/init").
    /// Assembled from user/initcode.S; od -t xC initcode
    const INITCODE: [u8; 52] = [
        0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35,
        0x02, 0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00,
        0x00, 0x00, 0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    /// Set up the first user process.
    pub fn userinit() {
        let p = match allocproc() {
            Some(p) => p,
            None => panic!("userinit: no procs"),
        };

        // allocate one user page and copy initcode's
        // instructions and data into it.
        vm::uvmfirst(p.pagetable(), INITCODE.as_ptr(), INITCODE.len());
        p.sz.set(PGSIZE);

        // stdin/stdout/stderr on the console device. the disk is mounted
        // read-only, so the kernel wires these up instead of a user-level
        // mknod + open.
        let console = match crate::file::filealloc() {
            Some(f) => f,
            None => panic!("userinit: no file"),
        };
        console.init_device(crate::file::CONSOLE as i16, true, true);
        let ofile = unsafe { &mut *p.ofile.get() };
        ofile[0] = Some(console);
        ofile[1] = Some(crate::file::filedup(console));
        ofile[2] = Some(crate::file::filedup(console));

        // prepare for the very first "return" from kernel to user.
        let tf = p.trapframe();
        tf.epc = 0; // user program counter
        tf.sp = PGSIZE as u64; // user stack pointer

        p.set_name("initcode");
        p.state.set(ProcState::Runnable);

        p.lock.release();
    }

    /// Per-CPU process scheduler.
    /// Each CPU calls scheduler() after setting itself up.
    /// Scheduler never returns. It loops, doing:
    ///  - choose a process to run.
    ///  - swtch to start running that process.
    ///  - eventually that process transfers control
    ///    via swtch back to the scheduler.
    pub fn scheduler() -> ! {
        let c = mycpu();
        c.proc.set(None);
        loop {
            // The most recent process to run may have had interrupts
            // turned off; enable them to avoid a deadlock if all
            // processes are waiting. Then check if any work is pending.
            intr_on();

            let mut found = false;
            for p in PROCS.iter() {
                p.lock.acquire();
                if p.state.get() == ProcState::Runnable {
                    // Switch to chosen process. It is the process's job
                    // to release its lock and then reacquire it
                    // before jumping back to us.
                    p.state.set(ProcState::Running);
                    c.proc.set(Some(NonNull::from(p)));
                    unsafe { swtch(c.context.get(), p.context.get()) };

                    // Process is done running for now.
                    // It should have changed its p->state before coming back.
                    c.proc.set(None);
                    found = true;
                }
                p.lock.release();
            }
            if !found {
                // nothing to run; stop running on this core until an
                // interrupt.
                unsafe { asm!("wfi") };
            }
        }
    }

    /// Switch to scheduler. Must hold only p->lock and have changed
    /// proc->state. Saves and restores intena because intena is a property
    /// of this kernel thread, not this CPU. It should be proc->intena and
    /// proc->noff, but that would break in the few places where a lock is
    /// held but there's no process.
    fn sched() {
        let p = myproc();
        let c = mycpu();

        if !p.lock.holding() {
            panic!("sched p->lock");
        }
        if c.noff.get() != 1 {
            panic!("sched locks");
        }
        if p.state.get() == ProcState::Running {
            panic!("sched running");
        }
        if intr_get() {
            panic!("sched interruptible");
        }

        let intena = c.intena.get();
        unsafe { swtch(p.context.get(), c.context.get()) };
        mycpu().intena.set(intena);
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_proc() {
        let p = myproc();
        p.lock.acquire();
        p.state.set(ProcState::Runnable);
        sched();
        p.lock.release();
    }

    static FIRST: AtomicBool = AtomicBool::new(true);

    /// A newly allocated process's very first scheduling by scheduler()
    /// will swtch to forkret.
    fn forkret() {
        // Still holding p->lock from scheduler.
        myproc().lock.release();

        if FIRST.swap(false, Ordering::AcqRel) {
            // File system initialization must be run in the context of a
            // regular process (e.g., because it calls sleep), and thus
            // cannot be run from main().
            crate::fs::fsinit(ROOTDEV);
        }

        usertrapret();
    }

    /// Atomically release lock and sleep on chan.
    /// Reacquires lock when awakened.
    pub fn sleep(chan: Chan, lk: &Spinlock) {
        let p = myproc();

        // Must acquire p->lock in order to change p->state and then call
        // sched. Once we hold p->lock, we can be guaranteed that we won't
        // miss any wakeup (wakeup locks p->lock), so it's okay to release lk.
        p.lock.acquire();
        lk.release();

        // Go to sleep.
        p.chan.set(Some(chan));
        p.state.set(ProcState::Sleeping);

        sched();

        // Tidy up.
        p.chan.set(None);

        // Reacquire original lock.
        p.lock.release();
        lk.acquire();
    }

    /// Wake up all processes sleeping on chan.
    /// Must be called without any p->lock.
    pub fn wakeup(chan: Chan) {
        let me = {
            push_off();
            let p = mycpu().proc.get();
            pop_off();
            p
        };
        for p in PROCS.iter() {
            if Some(NonNull::from(p)) == me {
                continue;
            }
            p.lock.acquire();
            if p.state.get() == ProcState::Sleeping && p.chan.get() == Some(chan) {
                p.state.set(ProcState::Runnable);
            }
            p.lock.release();
        }
    }

    /// Exit the current process. Does not return.
    /// The process stays in the zombie state until its slot is reaped.
    pub fn exit(status: i32) -> ! {
        let p = myproc();

        // Close all open files.
        let ofile = unsafe { &mut *p.ofile.get() };
        for f in ofile.iter_mut() {
            if let Some(file) = f.take() {
                crate::file::fileclose(file);
            }
        }

        p.lock.acquire();
        p.xstate.set(status);
        p.state.set(ProcState::Zombie);

        // Jump into the scheduler, never to return.
        sched();
        panic!("zombie exit");
    }
}

#[cfg(target_os = "none")]
pub use sched::{
    exit, mycpu, proc_freepagetable, proc_mapstacks, proc_pagetable, procinit, scheduler, sleep,
    userinit, wakeup, yield_proc,
};

/// Hosted stand-ins: every test thread is a process of its own, and
/// sleep/wakeup ride a generation counter per channel so no wakeup is lost
/// between the condition re-check and the park.
#[cfg(not(target_os = "none"))]
mod sched {
    use std::collections::HashMap;
    use std::sync::{Condvar, Mutex, OnceLock};

    use super::*;
    use crate::vm;

    std::thread_local! {
        static CPU: &'static Cpu = init_cpu();
    }

    fn init_cpu() -> &'static Cpu {
        let cpu: &'static Cpu = Box::leak(Box::new(Cpu::new()));
        let p: &'static Proc = Box::leak(Box::new(Proc::new()));
        p.pid.set(allocpid());
        p.state.set(ProcState::Running);
        p.trapframe
            .set(NonNull::new(Box::leak(Box::new(TrapFrame::zeroed()))));
        p.pagetable
            .set(vm::uvmcreate().map(|pt| NonNull::from(pt)));
        p.set_name("host");
        cpu.proc.set(Some(NonNull::from(p)));
        cpu
    }

    pub fn mycpu() -> &'static Cpu {
        CPU.with(|c| *c)
    }

    pub fn proc_pagetable(_p: &Proc) -> Option<&'static mut PageTable> {
        vm::uvmcreate()
    }

    pub fn proc_freepagetable(pagetable: &mut PageTable, sz: usize) {
        vm::uvmfree(pagetable, sz);
    }

    struct WaitRegistry {
        gens: Mutex<HashMap<usize, u64>>,
        cv: Condvar,
    }

    fn registry() -> &'static WaitRegistry {
        static REGISTRY: OnceLock<WaitRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| WaitRegistry {
            gens: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        })
    }

    /// Atomically release lock and sleep on chan.
    /// Reacquires lock when awakened.
    pub fn sleep(chan: Chan, lk: &Spinlock) {
        let reg = registry();
        // Holding the registry lock across the spinlock release closes the
        // window: a wakeup must take the registry lock to bump the
        // generation, so it cannot fire between the caller's condition
        // check and the park.
        let mut gens = reg.gens.lock().unwrap();
        let start = gens.get(&chan.0).copied().unwrap_or(0);
        lk.release();
        while gens.get(&chan.0).copied().unwrap_or(0) == start {
            gens = reg.cv.wait(gens).unwrap();
        }
        drop(gens);
        lk.acquire();
    }

    /// Wake up all processes sleeping on chan.
    pub fn wakeup(chan: Chan) {
        let reg = registry();
        let mut gens = reg.gens.lock().unwrap();
        *gens.entry(chan.0).or_insert(0) += 1;
        reg.cv.notify_all();
    }

    pub fn yield_proc() {
        std::thread::yield_now();
    }

    pub fn exit(status: i32) -> ! {
        panic!("process exited with status {}", status);
    }
}

#[cfg(not(target_os = "none"))]
pub use sched::{exit, mycpu, proc_freepagetable, proc_pagetable, sleep, wakeup, yield_proc};

#[cfg(test)]
mod tests {
    use core::mem::{offset_of, size_of};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    /// trampoline.S indexes the trap frame by byte offset; the layout is ABI.
    #[test]
    fn trapframe_layout_matches_trampoline_abi() {
        assert_eq!(0, offset_of!(TrapFrame, kernel_satp));
        assert_eq!(8, offset_of!(TrapFrame, kernel_sp));
        assert_eq!(16, offset_of!(TrapFrame, kernel_trap));
        assert_eq!(24, offset_of!(TrapFrame, epc));
        assert_eq!(32, offset_of!(TrapFrame, kernel_hartid));
        assert_eq!(40, offset_of!(TrapFrame, ra));
        assert_eq!(48, offset_of!(TrapFrame, sp));
        assert_eq!(56, offset_of!(TrapFrame, gp));
        assert_eq!(64, offset_of!(TrapFrame, tp));
        assert_eq!(72, offset_of!(TrapFrame, t0));
        assert_eq!(80, offset_of!(TrapFrame, t1));
        assert_eq!(88, offset_of!(TrapFrame, t2));
        assert_eq!(96, offset_of!(TrapFrame, s0));
        assert_eq!(104, offset_of!(TrapFrame, s1));
        assert_eq!(112, offset_of!(TrapFrame, a0));
        assert_eq!(120, offset_of!(TrapFrame, a1));
        assert_eq!(128, offset_of!(TrapFrame, a2));
        assert_eq!(136, offset_of!(TrapFrame, a3));
        assert_eq!(144, offset_of!(TrapFrame, a4));
        assert_eq!(152, offset_of!(TrapFrame, a5));
        assert_eq!(160, offset_of!(TrapFrame, a6));
        assert_eq!(168, offset_of!(TrapFrame, a7));
        assert_eq!(176, offset_of!(TrapFrame, s2));
        assert_eq!(248, offset_of!(TrapFrame, s11));
        assert_eq!(256, offset_of!(TrapFrame, t3));
        assert_eq!(280, offset_of!(TrapFrame, t6));
        assert_eq!(288, size_of::<TrapFrame>());
    }

    #[test]
    fn context_holds_callee_saved_registers_only() {
        assert_eq!(14 * 8, size_of::<Context>());
        assert_eq!(0, offset_of!(Context, ra));
        assert_eq!(8, offset_of!(Context, sp));
    }

    #[test]
    fn chan_tokens_alias_only_on_identical_addresses() {
        let a = 0u64;
        let b = 0u64;
        assert_ne!(Chan::of(&a), Chan::of(&b));
        assert_eq!(Chan::of(&a), Chan::of(&a));
    }

    #[test]
    fn each_thread_is_its_own_process() {
        let pid = myproc().pid();
        assert_eq!(pid, myproc().pid());
        let other = thread::spawn(|| myproc().pid()).join().unwrap();
        assert_ne!(pid, other);
    }

    #[test]
    fn setkilled_is_visible_through_killed() {
        let p = myproc();
        assert!(!killed(p));
        setkilled(p);
        assert!(killed(p));
    }

    struct Flag {
        lock: Spinlock,
        ready: AtomicBool,
    }

    #[test]
    fn wakeup_releases_a_sleeper() {
        let flag = Arc::new(Flag {
            lock: Spinlock::new("flag"),
            ready: AtomicBool::new(false),
        });
        let chan = Chan::of(&flag.ready);

        let sleeper = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                flag.lock.acquire();
                while !flag.ready.load(Ordering::Relaxed) {
                    sleep(Chan::of(&flag.ready), &flag.lock);
                }
                flag.lock.release();
            })
        };

        // The sleeper re-checks its condition after every wakeup, so a
        // spurious wakeup ahead of the flag flip must not release it.
        wakeup(chan);
        flag.lock.acquire();
        flag.ready.store(true, Ordering::Relaxed);
        flag.lock.release();
        wakeup(chan);

        sleeper.join().unwrap();
    }
}
