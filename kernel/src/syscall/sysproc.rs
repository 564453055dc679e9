//! Process-related system calls.

use super::argint;
use crate::proc::exit;
use crate::trap::{ticks, ticks_sleep};

pub fn sys_exit() -> i64 {
    let status = argint(0);
    exit(status)
}

pub fn sys_sleep() -> i64 {
    let n = argint(0);
    if n < 0 {
        return -1;
    }
    ticks_sleep(n as u64);
    0
}

pub fn sys_uptime() -> i64 {
    ticks() as i64
}
