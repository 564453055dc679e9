//! The system-wide table of open files.

use super::{File, FileType};
use crate::param::NFILE;
use crate::spinlock::Spinlock;

#[cfg(target_os = "none")]
use super::Devsw;
#[cfg(target_os = "none")]
use crate::param::NDEV;

struct Ftable {
    lock: Spinlock,
    file: [File; NFILE],
}

static FTABLE: Ftable = Ftable {
    lock: Spinlock::new("ftable"),
    file: [const { File::new() }; NFILE],
};

#[cfg(target_os = "none")]
pub(crate) struct DevswTable(pub core::cell::UnsafeCell<[Option<Devsw>; NDEV]>);
#[cfg(target_os = "none")]
unsafe impl Sync for DevswTable {}
// entries are installed during single-threaded boot, read-only afterwards.
#[cfg(target_os = "none")]
pub(crate) static DEVSW: DevswTable = DevswTable(core::cell::UnsafeCell::new([None; NDEV]));

#[cfg(target_os = "none")]
pub(crate) fn register_dev(major: usize, dev: Devsw) {
    unsafe { (*DEVSW.0.get())[major] = Some(dev) };
}

pub fn fileinit() {
    // the table is statically initialized; the call marks the boot step.
}

/// Allocate a file structure.
pub fn filealloc() -> Option<&'static File> {
    FTABLE.lock.acquire();
    for f in FTABLE.file.iter() {
        if f.refcnt.get() == 0 {
            f.refcnt.set(1);
            FTABLE.lock.release();
            return Some(f);
        }
    }
    FTABLE.lock.release();
    None
}

/// Increment ref count for file f.
pub fn filedup(f: &'static File) -> &'static File {
    FTABLE.lock.acquire();
    if f.refcnt.get() < 1 {
        panic!("filedup");
    }
    f.refcnt.set(f.refcnt.get() + 1);
    FTABLE.lock.release();
    f
}

/// Close file f: decrement ref count, release the object when it hits zero.
pub fn fileclose(f: &'static File) {
    FTABLE.lock.acquire();
    if f.refcnt.get() < 1 {
        panic!("fileclose");
    }
    f.refcnt.set(f.refcnt.get() - 1);
    if f.refcnt.get() > 0 {
        FTABLE.lock.release();
        return;
    }

    let typ = f.typ.get();
    let pipe = f.pipe.get();
    let writable = f.writable.get();
    let ip = f.ip.get();

    f.typ.set(FileType::None);
    f.pipe.set(None);
    f.ip.set(None);
    f.off.set(0);
    FTABLE.lock.release();

    match typ {
        FileType::Pipe => {
            if let Some(pi) = pipe {
                unsafe { pi.as_ref() }.close(writable);
            }
        }
        FileType::Inode | FileType::Device => {
            if let Some(ip) = ip {
                crate::log::begin_op();
                ip.iput();
                crate::log::end_op();
            }
        }
        FileType::None => {}
    }
}

/// Read from file f into the caller's memory at addr.
pub fn fileread(f: &'static File, addr: usize, n: usize) -> i32 {
    if !f.readable.get() {
        return -1;
    }

    match f.typ.get() {
        FileType::Pipe => match f.pipe.get() {
            Some(pi) => unsafe { pi.as_ref() }.read(addr, n),
            None => -1,
        },
        FileType::Inode => match f.ip.get() {
            Some(ip) => {
                ip.ilock();
                let r = ip.readi(true, addr, f.off.get(), n);
                f.off.set(f.off.get() + r as u32);
                ip.iunlock();
                r as i32
            }
            None => -1,
        },
        #[cfg(target_os = "none")]
        FileType::Device => {
            let major = f.major.get() as usize;
            match unsafe { &*DEVSW.0.get() }.get(major).and_then(|d| d.as_ref()) {
                Some(dev) => (dev.read)(true, addr, n),
                None => -1,
            }
        }
        #[cfg(not(target_os = "none"))]
        FileType::Device => -1,
        FileType::None => panic!("fileread"),
    }
}

/// Write to file f from the caller's memory at addr.
pub fn filewrite(f: &'static File, addr: usize, n: usize) -> i32 {
    if !f.writable.get() {
        return -1;
    }

    match f.typ.get() {
        FileType::Pipe => match f.pipe.get() {
            Some(pi) => unsafe { pi.as_ref() }.write(addr, n),
            None => -1,
        },
        // the disk is mounted read-only: inode files cannot be written.
        FileType::Inode => -1,
        #[cfg(target_os = "none")]
        FileType::Device => {
            let major = f.major.get() as usize;
            match unsafe { &*DEVSW.0.get() }.get(major).and_then(|d| d.as_ref()) {
                Some(dev) => (dev.write)(true, addr, n),
                None => -1,
            }
        }
        #[cfg(not(target_os = "none"))]
        FileType::Device => -1,
        FileType::None => panic!("filewrite"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_recycle_through_the_table() {
        let f = filealloc().expect("table full");
        assert_eq!(1, f.refcnt.get());

        filedup(f);
        assert_eq!(2, f.refcnt.get());

        fileclose(f);
        assert_eq!(1, f.refcnt.get());
        fileclose(f);
        assert_eq!(0, f.refcnt.get());
        assert_eq!(FileType::None, f.typ.get());
    }

    #[test]
    fn reading_a_write_only_file_fails() {
        let (rf, wf) = crate::pipe::pipealloc().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(-1, fileread(wf, buf.as_mut_ptr() as usize, 4));
        assert_eq!(-1, filewrite(rf, buf.as_ptr() as usize, 4));
        fileclose(rf);
        fileclose(wf);
    }
}
