//! Long-term locks for processes. The wait path parks the caller in the
//! scheduler instead of spinning, so these are only usable from process
//! context — never from interrupt handlers.

use core::cell::Cell;

use crate::proc::{myproc, sleep, wakeup, Chan};
use crate::spinlock::Spinlock;

pub struct Sleeplock {
    lk: Spinlock,        // spinlock protecting this sleep lock
    locked: Cell<bool>,  // is the lock held?
    pid: Cell<u32>,      // process holding lock
    name: &'static str,  // name of lock, for debugging
}

// `locked` and `pid` are only touched while `lk` is held.
unsafe impl Sync for Sleeplock {}

impl Sleeplock {
    pub const fn new(name: &'static str) -> Self {
        Sleeplock {
            lk: Spinlock::new("sleep lock"),
            locked: Cell::new(false),
            pid: Cell::new(0),
            name,
        }
    }

    pub fn acquire_sleep(&self) {
        self.lk.acquire();
        while self.locked.get() {
            // the scheduler's sleep releases lk atomically with the park,
            // so a release_sleep between the check and the park cannot be
            // missed.
            sleep(Chan::of(self), &self.lk);
        }
        self.locked.set(true);
        self.pid.set(myproc().pid());
        self.lk.release();
    }

    pub fn release_sleep(&self) {
        self.lk.acquire();
        self.locked.set(false);
        self.pid.set(0);
        wakeup(Chan::of(self));
        self.lk.release();
    }

    pub fn holding_sleep(&self) -> bool {
        self.lk.acquire();
        let r = self.locked.get() && self.pid.get() == myproc().pid();
        self.lk.release();
        r
    }

    #[allow(dead_code)]
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use core::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let l = Sleeplock::new("t");
        assert!(!l.holding_sleep());
        l.acquire_sleep();
        assert!(l.holding_sleep());
        l.release_sleep();
        assert!(!l.holding_sleep());
    }

    #[test]
    fn holder_identity_is_per_process() {
        let l = Arc::new(Sleeplock::new("t"));
        l.acquire_sleep();

        let l2 = Arc::clone(&l);
        // a different process observes the lock as held, but not by itself.
        let held_elsewhere = thread::spawn(move || l2.holding_sleep()).join().unwrap();
        assert!(!held_elsewhere);
        assert!(l.holding_sleep());
        l.release_sleep();
    }

    struct Shared {
        lock: Sleeplock,
        val: UnsafeCell<u64>,
    }
    unsafe impl Sync for Shared {}

    #[test]
    fn blocked_acquirers_serialize() {
        let s = Arc::new(Shared {
            lock: Sleeplock::new("shared"),
            val: UnsafeCell::new(0),
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&s);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    s.lock.acquire_sleep();
                    unsafe { *s.val.get() += 1 };
                    s.lock.release_sleep();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(2000, unsafe { *s.val.get() });
    }
}
