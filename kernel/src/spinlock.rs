//! Mutual exclusion spin locks.

use core::hint;
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use crate::proc::{cpuid, mycpu};
use crate::riscv::{intr_get, intr_off, intr_on};

// owner value meaning "held by nobody".
const NOCPU: usize = usize::MAX;

pub struct Spinlock {
    locked: AtomicBool, // Is the lock held?

    // For debugging:
    name: &'static str, // Name of lock.
    cpu: AtomicUsize,   // The cpu holding the lock.
}

impl Spinlock {
    pub const fn new(name: &'static str) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            name,
            cpu: AtomicUsize::new(NOCPU),
        }
    }

    /// Acquire the lock.
    /// Loops (spins) until the lock is acquired.
    pub fn acquire(&self) {
        push_off(); // disable interrupts to avoid deadlock.
        if self.holding() {
            panic!("acquire {}", self.name);
        }

        // On RISC-V, this compiles down to an atomic swap:
        //   a5 = 1
        //   s1 = &lk->locked
        //   amoswap.w.aq a5, a5, (s1)
        while self.locked.swap(true, Ordering::Acquire) {
            hint::spin_loop();
        }

        // Tell the compiler and the processor to not move loads or stores
        // past this point, to ensure that the critical section's memory
        // references happen strictly after the lock is acquired.
        // On RISC-V, this emits a fence instruction.
        fence(Ordering::SeqCst);

        // Record info about lock acquisition for holding() and debugging.
        self.cpu.store(cpuid(), Ordering::Relaxed);
    }

    /// Release the lock.
    pub fn release(&self) {
        if !self.holding() {
            panic!("release {}", self.name);
        }

        self.cpu.store(NOCPU, Ordering::Relaxed);

        // Tell the compiler and the CPU to not move loads or stores
        // past this point, to ensure that all the stores in the critical
        // section are visible to other CPUs before the lock is released,
        // and that loads in the critical section occur strictly before
        // the lock is released.
        // On RISC-V, this emits a fence instruction.
        fence(Ordering::SeqCst);

        // Release the lock, equivalent to lk->locked = 0.
        // On RISC-V, this compiles down to an atomic swap:
        //   s1 = &lk->locked
        //   amoswap.w zero, zero, (s1)
        self.locked.store(false, Ordering::Release);

        pop_off();
    }

    /// Check whether this cpu is holding the lock.
    /// Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == cpuid()
    }
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
pub fn push_off() {
    let old = intr_get();

    intr_off();
    let cpu = mycpu();
    if cpu.noff.get() == 0 {
        cpu.intena.set(old);
    }
    cpu.noff.set(cpu.noff.get() + 1);
}

pub fn pop_off() {
    let cpu = mycpu();
    if intr_get() {
        panic!("pop_off - interruptible");
    }
    if cpu.noff.get() < 1 {
        panic!("pop_off");
    }
    cpu.noff.set(cpu.noff.get() - 1);
    if cpu.noff.get() == 0 && cpu.intena.get() {
        intr_on();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use core::cell::UnsafeCell;

    #[test]
    fn nested_acquire_restores_interrupts_at_outermost_release() {
        let a = Spinlock::new("a");
        let b = Spinlock::new("b");

        intr_on();
        assert!(intr_get());

        a.acquire();
        assert!(!intr_get());
        b.acquire();
        b.release();
        // still inside a's critical section; interrupts stay off.
        assert!(!intr_get());
        a.release();
        assert!(intr_get());

        intr_off();
    }

    #[test]
    fn push_off_remembers_disabled_interrupts() {
        intr_off();
        let l = Spinlock::new("l");
        l.acquire();
        l.release();
        // interrupts were off at the outermost push_off; they stay off.
        assert!(!intr_get());
    }

    #[test]
    fn holding_tracks_owner() {
        let l = Spinlock::new("l");
        assert!(!l.holding());
        l.acquire();
        assert!(l.holding());
        l.release();
        assert!(!l.holding());
    }

    #[test]
    fn noff_is_balanced_over_a_lock_sequence() {
        let l = Spinlock::new("l");
        let noff_before = mycpu().noff.get();
        for _ in 0..100 {
            l.acquire();
            l.release();
        }
        assert_eq!(noff_before, mycpu().noff.get());
    }

    #[test]
    #[should_panic(expected = "acquire")]
    fn reacquiring_a_held_lock_is_fatal() {
        let l = Spinlock::new("l");
        l.acquire();
        l.acquire();
    }

    #[test]
    #[should_panic(expected = "release")]
    fn releasing_an_unheld_lock_is_fatal() {
        let l = Spinlock::new("l");
        l.release();
    }

    struct Counter {
        lock: Spinlock,
        val: UnsafeCell<u64>,
    }
    unsafe impl Sync for Counter {}

    #[test]
    fn contended_increments_do_not_interleave() {
        let counter = Arc::new(Counter {
            lock: Spinlock::new("counter"),
            val: UnsafeCell::new(0),
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    c.lock.acquire();
                    unsafe { *c.val.get() += 1 };
                    c.lock.release();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        counter.lock.acquire();
        assert_eq!(40_000, unsafe { *counter.val.get() });
        counter.lock.release();
    }
}
