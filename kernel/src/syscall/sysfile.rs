//! File-descriptor system calls.

use core::mem::size_of;

use super::{argaddr, argint, argstr, fetchaddr, fetchstr};
use crate::exec::exec;
use crate::file::{fileclose, filedup, fileread, filewrite, File};
use crate::kalloc;
use crate::param::{MAXARG, MAXPATH, NOFILE};
use crate::pipe::pipealloc;
use crate::proc::myproc;
use crate::riscv::PGSIZE;
use crate::vm::copyout;

/// Fetch the nth word-sized system call argument as a file descriptor
/// and return the corresponding file.
fn argfd(n: usize) -> Result<(usize, &'static File), ()> {
    let fd = argint(n);
    if fd < 0 || fd as usize >= NOFILE {
        return Err(());
    }
    let fd = fd as usize;
    let ofile = unsafe { &*myproc().ofile.get() };
    match ofile[fd] {
        Some(f) => Ok((fd, f)),
        None => Err(()),
    }
}

/// Allocate a file descriptor for the given file.
fn fdalloc(f: &'static File) -> Result<usize, ()> {
    let ofile = unsafe { &mut *myproc().ofile.get() };
    for (fd, slot) in ofile.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(f);
            return Ok(fd);
        }
    }
    Err(())
}

pub fn sys_dup() -> i64 {
    let Ok((_, f)) = argfd(0) else { return -1 };
    let Ok(fd) = fdalloc(f) else { return -1 };
    filedup(f);
    fd as i64
}

pub fn sys_read() -> i64 {
    let Ok((_, f)) = argfd(0) else { return -1 };
    let addr = argaddr(1);
    let n = argint(2);
    if n < 0 {
        return -1;
    }
    fileread(f, addr, n as usize) as i64
}

pub fn sys_write() -> i64 {
    let Ok((_, f)) = argfd(0) else { return -1 };
    let addr = argaddr(1);
    let n = argint(2);
    if n < 0 {
        return -1;
    }
    filewrite(f, addr, n as usize) as i64
}

pub fn sys_close() -> i64 {
    let Ok((fd, f)) = argfd(0) else { return -1 };
    let ofile = unsafe { &mut *myproc().ofile.get() };
    ofile[fd] = None;
    fileclose(f);
    0
}

pub fn sys_pipe() -> i64 {
    let fdarray = argaddr(0); // user pointer to array of two ints
    let p = myproc();

    let Ok((rf, wf)) = pipealloc() else { return -1 };
    let Ok(fd0) = fdalloc(rf) else {
        fileclose(rf);
        fileclose(wf);
        return -1;
    };
    let Ok(fd1) = fdalloc(wf) else {
        let ofile = unsafe { &mut *p.ofile.get() };
        ofile[fd0] = None;
        fileclose(rf);
        fileclose(wf);
        return -1;
    };

    let fds = [fd0 as i32, fd1 as i32];
    if copyout(
        p.pagetable(),
        fdarray,
        fds.as_ptr() as *const u8,
        2 * size_of::<i32>(),
    )
    .is_err()
    {
        let ofile = unsafe { &mut *p.ofile.get() };
        ofile[fd0] = None;
        ofile[fd1] = None;
        fileclose(rf);
        fileclose(wf);
        return -1;
    }
    0
}

pub fn sys_exec() -> i64 {
    let mut path = [0u8; MAXPATH];
    let Ok(path_len) = argstr(0, &mut path) else {
        return -1;
    };
    let uargv = argaddr(1);

    // copy each argv string into its own kernel page.
    let mut pages: [Option<*mut u8>; MAXARG] = [None; MAXARG];
    let mut lens = [0usize; MAXARG];
    let mut argc = 0;
    let mut failed = false;

    loop {
        if argc >= MAXARG {
            failed = true;
            break;
        }
        let uarg = match fetchaddr(uargv + size_of::<usize>() * argc) {
            Ok(a) => a,
            Err(()) => {
                failed = true;
                break;
            }
        };
        if uarg == 0 {
            break;
        }
        let page = kalloc::kalloc();
        if page.is_null() {
            failed = true;
            break;
        }
        pages[argc] = Some(page);
        let buf = unsafe { core::slice::from_raw_parts_mut(page, PGSIZE) };
        match fetchstr(uarg, buf) {
            Ok(len) => lens[argc] = len,
            Err(()) => {
                failed = true;
                break;
            }
        }
        argc += 1;
    }

    let ret = if failed {
        -1
    } else {
        let mut args: [&[u8]; MAXARG] = [&[]; MAXARG];
        for i in 0..argc {
            let page = pages[i].unwrap_or(core::ptr::null_mut());
            args[i] = unsafe { core::slice::from_raw_parts(page, lens[i]) };
        }
        match core::str::from_utf8(&path[..path_len]) {
            Ok(path) => exec(path, &args[..argc]) as i64,
            Err(_) => -1,
        }
    };

    for page in pages.iter().flatten() {
        kalloc::kfree(*page);
    }
    ret
}
