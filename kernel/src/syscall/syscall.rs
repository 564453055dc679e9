//! Fetching system call arguments from user space, and the dispatcher.

use core::mem::size_of;

use super::*;
use crate::printf;
use crate::proc::myproc;
use crate::vm::{copyin, copyinstr};

fn argraw(n: usize) -> u64 {
    let tf = myproc().trapframe();
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("argraw"),
    }
}

/// Fetch the nth 32-bit system call argument.
pub fn argint(n: usize) -> i32 {
    argraw(n) as i32
}

/// Retrieve an argument as a pointer. Doesn't check for legality, since
/// copyin/copyout will do that.
pub fn argaddr(n: usize) -> usize {
    argraw(n) as usize
}

/// Fetch the nth word-sized system call argument as a null-terminated
/// string, copied into buf. Returns the string length, excluding nul.
pub fn argstr(n: usize, buf: &mut [u8]) -> Result<usize, ()> {
    fetchstr(argaddr(n), buf)
}

/// Fetch the usize at addr from the current process.
pub fn fetchaddr(addr: usize) -> Result<usize, ()> {
    let p = myproc();
    // both tests needed, in case of overflow.
    if addr >= p.sz() || addr + size_of::<usize>() > p.sz() {
        return Err(());
    }
    let mut val = 0usize;
    copyin(
        p.pagetable(),
        &mut val as *mut usize as *mut u8,
        addr,
        size_of::<usize>(),
    )?;
    Ok(val)
}

/// Fetch the nul-terminated string at addr from the current process.
/// Returns the length of the string, not including nul.
pub fn fetchstr(addr: usize, buf: &mut [u8]) -> Result<usize, ()> {
    let max = buf.len();
    copyinstr(myproc().pagetable(), buf, addr, max)
}

pub fn syscall() {
    let p = myproc();
    let num = p.trapframe().a7 as usize;

    let ret: i64 = match num {
        SYS_EXIT => sysproc::sys_exit(),
        SYS_PIPE => sysfile::sys_pipe(),
        SYS_READ => sysfile::sys_read(),
        SYS_EXEC => sysfile::sys_exec(),
        SYS_DUP => sysfile::sys_dup(),
        SYS_SLEEP => sysproc::sys_sleep(),
        SYS_UPTIME => sysproc::sys_uptime(),
        SYS_WRITE => sysfile::sys_write(),
        SYS_CLOSE => sysfile::sys_close(),
        _ => {
            let name = unsafe { &*p.name.get() };
            let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            printf!(
                "{} {}: unknown sys call {}\n",
                p.pid(),
                core::str::from_utf8(&name[..len]).unwrap_or("?"),
                num
            );
            -1
        }
    };
    p.trapframe().a0 = ret as u64;
}
