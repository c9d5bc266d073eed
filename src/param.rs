use static_assertions::const_assert;

pub const NPROC: usize = 64; // maximum number of processes
pub const NCPU: usize = 8; // maximum number of CPUs
pub const NOFILE: usize = 16; // open files per process
pub const KSTACKSIZE: usize = 4096; // size of per-process kernel stack
pub const PGSIZE: usize = 4096; // bytes per page

pub const NQUE: usize = 5; // number of MLFQ priority queues
pub const AGE_THRESH: u64 = 25; // ticks a runnable process may wait before aging

pub const DEFAULT_PRIORITY: u32 = 60; // assigned at allocation; lower is better
pub const MAX_PRIORITY: u32 = 100; // priorities range over [0, MAX_PRIORITY]

// cticks quanta are computed as 1 << queue.
const_assert!(NQUE as u32 <= u64::BITS);
const_assert!(DEFAULT_PRIORITY <= MAX_PRIORITY);

/// The scheduling policies a kernel can be built with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedPolicy {
    RoundRobin,
    Fcfs,
    Pbs,
    Mlfq,
}

cfg_if::cfg_if! {
    if #[cfg(feature = "mlfq")] {
        pub const SCHEDULER: SchedPolicy = SchedPolicy::Mlfq;
    } else if #[cfg(feature = "pbs")] {
        pub const SCHEDULER: SchedPolicy = SchedPolicy::Pbs;
    } else if #[cfg(feature = "fcfs")] {
        pub const SCHEDULER: SchedPolicy = SchedPolicy::Fcfs;
    } else {
        pub const SCHEDULER: SchedPolicy = SchedPolicy::RoundRobin;
    }
}
