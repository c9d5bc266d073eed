//! Syscall-shaped wrappers for the embedder's trap dispatcher. Argument
//! decoding and user-pointer checking happen out there; here every error
//! collapses to -1, matching the traditional calling convention.

use crate::{proc, scheduler};

pub fn sys_fork() -> i32 {
    proc::fork().unwrap_or(-1)
}

pub fn sys_exit() -> ! {
    proc::exit()
}

pub fn sys_wait() -> i32 {
    proc::wait().unwrap_or(-1)
}

pub fn sys_waitx(wtime: &mut i32, rtime: &mut i32) -> i32 {
    proc::waitx(wtime, rtime).unwrap_or(-1)
}

pub fn sys_kill(pid: i32) -> i32 {
    match proc::kill(pid) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

pub fn sys_getpid() -> i32 {
    proc::getpid().unwrap_or(-1)
}

pub fn sys_sbrk(n: i32) -> i32 {
    match proc::growproc(n) {
        Ok(addr) => addr as i32,
        Err(_) => -1,
    }
}

pub fn sys_set_priority(new_priority: i32, pid: i32) -> i32 {
    scheduler::set_priority(new_priority, pid).unwrap_or(-1)
}

pub fn sys_ps() -> i32 {
    proc::ps();
    0
}
