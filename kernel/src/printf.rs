//! Formatted console output, and the `log` facade wired to it.

#[macro_export]
macro_rules! printf {
    ($($arg:tt)*) => {
        $crate::printf::print_args(core::format_args!($($arg)*))
    };
}

#[cfg(target_os = "none")]
mod sink {
    use core::cell::Cell;
    use core::fmt::{self, Write};
    use core::sync::atomic::{AtomicBool, Ordering};

    use crate::console::Console;
    use crate::spinlock::Spinlock;

    /// Lock to avoid interleaving concurrent printf's.
    struct Printer {
        lock: Spinlock,
        locking: Cell<bool>,
    }

    unsafe impl Sync for Printer {}

    static PR: Printer = Printer {
        lock: Spinlock::new("pr"),
        locking: Cell::new(true),
    };

    static PANICKED: AtomicBool = AtomicBool::new(false);

    /// Called by the panic handler so a wedged printf lock cannot swallow
    /// the report.
    pub fn panicked() {
        PANICKED.store(true, Ordering::Relaxed);
        PR.locking.set(false);
    }

    pub fn print_args(args: fmt::Arguments<'_>) {
        let locking = PR.locking.get() && !PANICKED.load(Ordering::Relaxed);
        if locking {
            PR.lock.acquire();
        }
        let _ = Console.write_fmt(args);
        if locking {
            PR.lock.release();
        }
    }
}

#[cfg(not(target_os = "none"))]
mod sink {
    use core::fmt;

    pub fn print_args(args: fmt::Arguments<'_>) {
        print!("{}", args);
    }
}

pub use sink::*;

struct KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            print_args(format_args!(
                "[{}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static KERNEL_LOG: KernelLog = KernelLog;

/// Route the `log` facade into the console. Safe to call more than once;
/// only the first installation sticks.
pub fn loginit() {
    if log::set_logger(&KERNEL_LOG).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}
