//! Console input and output, to the UART.
//!
//! Implements a simple line discipline for input: erase with backspace,
//! kill line with ctrl-u, end of file with ctrl-d. Input becomes readable
//! a whole line at a time.

use core::cell::Cell;
use core::fmt;

use crate::file::{register_dev, Devsw, CONSOLE};
use crate::proc::{either_copyin, either_copyout, killed, myproc, sleep, wakeup, Chan};
use crate::spinlock::Spinlock;
use crate::uart::{uartinit, uartputc_sync};

const BACKSPACE: u8 = 0x08;
const CTRL_D: u8 = 4;
const CTRL_U: u8 = 0x15;

const INPUT_BUF_SIZE: usize = 128;

struct Cons {
    lock: Spinlock,
    buf: core::cell::UnsafeCell<[u8; INPUT_BUF_SIZE]>,
    r: Cell<usize>, // read index
    w: Cell<usize>, // write index
    e: Cell<usize>, // edit index
}

// indices and buffer are only touched under `lock`.
unsafe impl Sync for Cons {}

static CONS: Cons = Cons {
    lock: Spinlock::new("cons"),
    buf: core::cell::UnsafeCell::new([0; INPUT_BUF_SIZE]),
    r: Cell::new(0),
    w: Cell::new(0),
    e: Cell::new(0),
};

/// Send one character to the uart; called by printf and to echo input.
pub fn consputc(c: u8) {
    if c == BACKSPACE {
        // overwrite the previous character with a space.
        uartputc_sync(0x08);
        uartputc_sync(b' ');
        uartputc_sync(0x08);
    } else {
        uartputc_sync(c);
    }
}

/// The printf sink.
pub struct Console;

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.bytes() {
            consputc(c);
        }
        Ok(())
    }
}

/// User write()s to the console go here.
fn consolewrite(user_src: bool, src: usize, n: usize) -> i32 {
    let mut i = 0;
    while i < n {
        let mut c = 0u8;
        if either_copyin(user_src, &mut c, src + i, 1).is_err() {
            break;
        }
        uartputc_sync(c);
        i += 1;
    }
    i as i32
}

/// User read()s from the console go here: copy up to a whole input line.
fn consoleread(user_dst: bool, dst: usize, n: usize) -> i32 {
    let target = n;
    let mut n = n;
    let mut dst = dst;

    CONS.lock.acquire();
    while n > 0 {
        // wait until interrupt handler has put some input into the buffer.
        while CONS.r.get() == CONS.w.get() {
            if killed(myproc()) {
                CONS.lock.release();
                return -1;
            }
            sleep(Chan::of(&CONS.r), &CONS.lock);
        }

        let c = unsafe { (*CONS.buf.get())[CONS.r.get() % INPUT_BUF_SIZE] };
        CONS.r.set(CONS.r.get() + 1);

        if c == CTRL_D {
            if n < target {
                // save ctrl-d for next time, to make sure the caller gets
                // a 0-byte result.
                CONS.r.set(CONS.r.get() - 1);
            }
            break;
        }

        if either_copyout(user_dst, dst, &c, 1).is_err() {
            break;
        }
        dst += 1;
        n -= 1;

        if c == b'\n' {
            // a whole line has arrived; return to the user-level read().
            break;
        }
    }
    CONS.lock.release();

    (target - n) as i32
}

/// The console input interrupt handler: uartintr() calls this for each
/// input character.
pub fn consoleintr(c: u8) {
    CONS.lock.acquire();

    match c {
        CTRL_U => {
            // kill line.
            while CONS.e.get() != CONS.w.get()
                && unsafe { (*CONS.buf.get())[(CONS.e.get() - 1) % INPUT_BUF_SIZE] } != b'\n'
            {
                CONS.e.set(CONS.e.get() - 1);
                consputc(BACKSPACE);
            }
        }
        BACKSPACE | 0x7f => {
            if CONS.e.get() != CONS.w.get() {
                CONS.e.set(CONS.e.get() - 1);
                consputc(BACKSPACE);
            }
        }
        _ => {
            if c != 0 && CONS.e.get() - CONS.r.get() < INPUT_BUF_SIZE {
                let c = if c == b'\r' { b'\n' } else { c };

                // echo back to the user.
                consputc(c);

                // store for consumption by consoleread().
                unsafe { (*CONS.buf.get())[CONS.e.get() % INPUT_BUF_SIZE] = c };
                CONS.e.set(CONS.e.get() + 1);

                if c == b'\n' || c == CTRL_D || CONS.e.get() - CONS.r.get() == INPUT_BUF_SIZE {
                    // wake up consoleread() if a whole line (or EOF) has
                    // arrived.
                    CONS.w.set(CONS.e.get());
                    wakeup(Chan::of(&CONS.r));
                }
            }
        }
    }

    CONS.lock.release();
}

pub fn consoleinit() {
    uartinit();

    // connect read and write system calls to consoleread and consolewrite.
    register_dev(
        CONSOLE,
        Devsw {
            read: consoleread,
            write: consolewrite,
        },
    );
}
