//! Pipes: a bounded in-kernel byte channel with blocking producer/consumer
//! ends. The pipe object and its ring live together in a single allocator
//! frame, reclaimed when both ends have been closed.

use core::cell::{Cell, UnsafeCell};
use core::mem::size_of;
use core::ptr;

use crate::file::{filealloc, fileclose, File};
use crate::kalloc;
use crate::proc::{killed, myproc, sleep, wakeup, Chan};
use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;
use crate::vm::{copyin, copyout};

pub const PIPESIZE: usize = 512;

pub struct Pipe {
    lock: Spinlock,
    data: UnsafeCell<[u8; PIPESIZE]>,
    nread: Cell<u32>,      // number of bytes read
    nwrite: Cell<u32>,     // number of bytes written
    readopen: Cell<bool>,  // read fd is still open
    writeopen: Cell<bool>, // write fd is still open
}

// the ring and both counters are only touched under `lock`.
unsafe impl Sync for Pipe {}

// one frame must fit the whole pipe.
const _: () = assert!(size_of::<Pipe>() <= PGSIZE);

impl Pipe {
    fn new() -> Self {
        Pipe {
            lock: Spinlock::new("pipe"),
            data: UnsafeCell::new([0; PIPESIZE]),
            nread: Cell::new(0),
            nwrite: Cell::new(0),
            readopen: Cell::new(true),
            writeopen: Cell::new(true),
        }
    }

    /// readers park on the nread counter's address, writers on nwrite's.
    fn read_chan(&self) -> Chan {
        Chan::of(&self.nread)
    }

    fn write_chan(&self) -> Chan {
        Chan::of(&self.nwrite)
    }

    fn full(&self) -> bool {
        self.nwrite.get() == self.nread.get().wrapping_add(PIPESIZE as u32)
    }

    fn empty(&self) -> bool {
        self.nread.get() == self.nwrite.get()
    }

    /// Copy up to n bytes from the user address into the ring, blocking
    /// while it is full. Returns the bytes moved, or -1 when the reader is
    /// gone or the caller was killed before anything was transferred.
    pub fn write(&self, addr: usize, n: usize) -> i32 {
        let pr = myproc();
        let mut i = 0;

        self.lock.acquire();
        while i < n {
            if !self.readopen.get() || killed(pr) {
                wakeup(self.read_chan());
                self.lock.release();
                return if i > 0 { i as i32 } else { -1 };
            }
            if self.full() {
                wakeup(self.read_chan());
                sleep(self.write_chan(), &self.lock);
            } else {
                let mut ch = 0u8;
                if copyin(pr.pagetable(), &mut ch, addr + i, 1).is_err() {
                    break;
                }
                let slot = self.nwrite.get() as usize % PIPESIZE;
                unsafe { (*self.data.get())[slot] = ch };
                self.nwrite.set(self.nwrite.get().wrapping_add(1));
                i += 1;
            }
        }
        wakeup(self.read_chan());
        self.lock.release();
        i as i32
    }

    /// Copy up to n available bytes out to the user address, blocking while
    /// the ring is empty and a writer remains. Returns the bytes moved;
    /// 0 once the ring is drained and every writer is gone; -1 if killed
    /// while waiting.
    pub fn read(&self, addr: usize, n: usize) -> i32 {
        let pr = myproc();

        self.lock.acquire();
        while self.empty() && self.writeopen.get() {
            if killed(pr) {
                self.lock.release();
                return -1;
            }
            sleep(self.read_chan(), &self.lock);
        }

        let mut i = 0;
        while i < n {
            if self.empty() {
                break;
            }
            let slot = self.nread.get() as usize % PIPESIZE;
            let ch = unsafe { (*self.data.get())[slot] };
            self.nread.set(self.nread.get().wrapping_add(1));
            if copyout(pr.pagetable(), addr + i, &ch, 1).is_err() {
                break;
            }
            i += 1;
        }
        wakeup(self.write_chan());
        self.lock.release();
        i as i32
    }

    /// Close one end. The frame is freed when the second end goes.
    pub fn close(&self, writable: bool) {
        self.lock.acquire();
        if writable {
            self.writeopen.set(false);
            wakeup(self.read_chan());
        } else {
            self.readopen.set(false);
            wakeup(self.write_chan());
        }
        if !self.readopen.get() && !self.writeopen.get() {
            self.lock.release();
            kalloc::kfree(self as *const Pipe as *mut u8);
        } else {
            self.lock.release();
        }
    }
}

/// Allocate a pipe and an open file for each end: (read end, write end).
pub fn pipealloc() -> Result<(&'static File, &'static File), ()> {
    let f0 = filealloc();
    let f1 = filealloc();
    let frame = kalloc::kalloc();

    if f0.is_none() || f1.is_none() || frame.is_null() {
        if !frame.is_null() {
            kalloc::kfree(frame);
        }
        if let Some(f) = f0 {
            fileclose(f);
        }
        if let Some(f) = f1 {
            fileclose(f);
        }
        return Err(());
    }

    let pi = frame as *mut Pipe;
    unsafe { ptr::write(pi, Pipe::new()) };
    let pi = unsafe { &*pi };

    let f0 = f0.ok_or(())?;
    let f1 = f1.ok_or(())?;
    f0.init_pipe(pi, true, false);
    f1.init_pipe(pi, false, true);
    Ok((f0, f1))
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::file::{fileclose, fileread, filewrite};
    use crate::proc::setkilled;

    /// A pipe parked in a leaked frame, without the file layer. Never run
    /// close() on both ends of one of these from two racing threads in a
    /// test: the backing store is plain leaked memory.
    fn raw_pipe() -> &'static Pipe {
        let frame = kalloc::kalloc();
        assert!(!frame.is_null());
        let pi = frame as *mut Pipe;
        unsafe {
            ptr::write(pi, Pipe::new());
            &*pi
        }
    }

    #[test]
    fn hello_crosses_the_pipe() {
        let (rf, wf) = pipealloc().unwrap();

        let msg = *b"hello";
        assert_eq!(5, filewrite(wf, msg.as_ptr() as usize, 5));

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 5];
            let n = fileread(rf, buf.as_mut_ptr() as usize, 5);
            (n, buf)
        });
        let (n, buf) = reader.join().unwrap();
        assert_eq!(5, n);
        assert_eq!(*b"hello", buf);

        // with the write end closed and the ring drained, read reports EOF.
        fileclose(wf);
        let mut buf = [0u8; 1];
        assert_eq!(0, fileread(rf, buf.as_mut_ptr() as usize, 1));
        fileclose(rf);
    }

    #[test]
    fn writer_blocks_on_a_full_ring_and_no_byte_is_lost() {
        let pi = raw_pipe();
        const TOTAL: usize = 4 * PIPESIZE + 37;

        let writer = thread::spawn(move || {
            let data: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
            let mut sent = 0;
            while sent < TOTAL {
                let n = pi.write(data[sent..].as_ptr() as usize, TOTAL - sent);
                assert!(n > 0);
                sent += n as usize;
            }
            pi.close(true);
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 100];
        loop {
            let n = pi.read(buf.as_mut_ptr() as usize, buf.len());
            assert!(n >= 0);
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n as usize]);
        }
        writer.join().unwrap();

        // the stream arrives intact and in order: backpressure blocks,
        // never drops.
        assert_eq!(TOTAL, received.len());
        for (i, &b) in received.iter().enumerate() {
            assert_eq!((i % 251) as u8, b);
        }
        pi.close(false);
    }

    #[test]
    fn write_to_a_pipe_with_no_reader_fails() {
        let pi = raw_pipe();
        pi.close(false);

        let byte = 9u8;
        assert_eq!(-1, pi.write(&byte as *const u8 as usize, 1));
        pi.close(true);
    }

    #[test]
    fn killed_reader_returns_failure_instead_of_sleeping_forever() {
        let pi = raw_pipe();
        let (tx, rx) = mpsc::channel();

        let reader = thread::spawn(move || {
            tx.send(myproc()).unwrap();
            let mut buf = [0u8; 1];
            pi.read(buf.as_mut_ptr() as usize, 1)
        });

        let proc = rx.recv().unwrap();
        setkilled(proc);
        // a kill is only noticed on wakeup; prod the channel until the
        // reader has bailed out.
        while !reader.is_finished() {
            wakeup(pi.read_chan());
            thread::sleep(std::time::Duration::from_millis(1));
        }

        assert_eq!(-1, reader.join().unwrap());
        pi.close(false);
        pi.close(true);
    }

    #[test]
    fn close_of_the_write_end_wakes_a_waiting_reader() {
        let pi = raw_pipe();

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 8];
            pi.read(buf.as_mut_ptr() as usize, 8)
        });

        thread::sleep(std::time::Duration::from_millis(50));
        pi.close(true);

        // EOF, not a hang.
        assert_eq!(0, reader.join().unwrap());
        pi.close(false);
    }
}
