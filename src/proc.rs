//! Processes and the process table.
//!
//! Every process occupies one fixed slot of `PTABLE`. The whole table —
//! slots, the pid counter, the tick counter and the MLFQ run queues —
//! sits behind one spinlock, and that lock is the linearization point for
//! every state transition. Parent/child links are slot indices, never
//! pointers.

use arrayvec::ArrayString;
use lazy_static::lazy_static;

use core::fmt;

use crate::{
    cpu::{myproc, Context},
    error::{KernelError, Result},
    hal::{platform, FileRef, InodeRef, KStack, PageDir},
    param::{DEFAULT_PRIORITY, NOFILE, NPROC, NQUE, PGSIZE, SchedPolicy, SCHEDULER},
    print, println,
    queue::Queues,
    scheduler::{forkret, sched},
    spinlock::{SpinMutex, SpinMutexGuard},
};

lazy_static! {
    pub static ref PTABLE: SpinMutex<ProcTable> =
        SpinMutex::new("ptable", ProcTable::new(SCHEDULER));
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleeping",
            ProcState::Runnable => "runable",
            ProcState::Running => "running",
            ProcState::Zombie => "zombie",
        }
    }
}

// Per-process data for the trap handling code. The trap entry/exit path
// itself lives outside this crate; the scheduler only ever copies a frame
// on fork and clears a0 so the child sees a zero return value.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    pub kernel_satp: usize,   // kernel page table
    pub kernel_sp: usize,     // top of process's kernel stack
    pub kernel_trap: usize,   // trap handler entry
    pub epc: usize,           // saved user program counter
    pub kernel_hartid: usize, // saved kernel tp
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
}

impl TrapFrame {
    pub fn zero() -> TrapFrame {
        // SAFETY: TrapFrame is repr(C) and made only of usize fields.
        unsafe { core::mem::zeroed() }
    }
}

// Per-process state.
pub struct Proc {
    // Identity.
    pub pid: i32,                // Process ID
    pub name: ArrayString<16>,   // Process name (debugging)
    pub parent: Option<usize>,   // Slot of the parent process

    pub state: ProcState,

    // Execution.
    pub kstack: Option<KStack>,  // Exclusively owned kernel stack
    pub sz: usize,               // Size of process memory (bytes)
    pub pgdir: Option<PageDir>,  // User page directory
    pub tf: TrapFrame,           // Trap frame for the current syscall
    pub context: Context,        // swtch() here to run process
    pub chan: Option<usize>,     // If Some, sleeping on chan
    pub killed: bool,            // Has the process been killed?

    // Open files and working directory, opaque to the scheduler.
    pub ofile: [Option<FileRef>; NOFILE],
    pub cwd: Option<InodeRef>,

    // Accounting, in ticks.
    pub ctime: u64,    // creation time
    pub etime: u64,    // exit time
    pub rtime: u64,    // ticks observed Running
    pub iotime: u64,   // ticks observed Sleeping
    pub ps_wtime: u64, // ticks observed Runnable since last dispatch
    pub n_run: u32,    // times picked by the scheduler

    // Policy state.
    pub priority: u32,         // PBS priority; lower is better
    pub timeslices: u32,       // PBS dispatch count
    pub queue: usize,          // current MLFQ queue
    pub cticks: u64,           // ticks consumed in this queue since dispatch
    pub got_queue: bool,       // linked into a run queue?
    pub talloc: u64,           // tick of the current queue admission
    pub q_ticks: [u64; NQUE],  // lifetime ticks accumulated per queue
}

impl Proc {
    fn new() -> Proc {
        Proc {
            pid: 0,
            name: ArrayString::new(),
            parent: None,
            state: ProcState::Unused,
            kstack: None,
            sz: 0,
            pgdir: None,
            tf: TrapFrame::zero(),
            context: Context::new(),
            chan: None,
            killed: false,
            ofile: [None; NOFILE],
            cwd: None,
            ctime: 0,
            etime: 0,
            rtime: 0,
            iotime: 0,
            ps_wtime: 0,
            n_run: 0,
            priority: DEFAULT_PRIORITY,
            timeslices: 0,
            queue: 0,
            cticks: 0,
            got_queue: false,
            talloc: 0,
            q_ticks: [0; NQUE],
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        for c in name.chars() {
            if self.name.try_push(c).is_err() {
                break;
            }
        }
    }
}

pub struct ProcTable {
    pub procs: [Proc; NPROC],
    pub(crate) policy: SchedPolicy,
    pub(crate) ticks: u64,
    pub(crate) queues: Queues,
    pub(crate) initproc: Option<usize>,
    nextpid: i32,
}

impl ProcTable {
    fn new(policy: SchedPolicy) -> ProcTable {
        ProcTable {
            procs: core::array::from_fn(|_| Proc::new()),
            policy,
            ticks: 0,
            queues: Queues::new(),
            initproc: None,
            nextpid: 1,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(policy: SchedPolicy) -> ProcTable {
        ProcTable::new(policy)
    }

    /// Look in the process table for an Unused slot. If found, change
    /// state to Embryo, assign a fresh pid, and reset the accounting and
    /// policy state. Otherwise return None.
    pub(crate) fn alloc_slot(&mut self) -> Option<usize> {
        let i = self.procs.iter().position(|p| p.state == ProcState::Unused)?;

        let pid = self.nextpid;
        self.nextpid += 1;
        let now = self.ticks;

        let p = &mut self.procs[i];
        p.state = ProcState::Embryo;
        p.pid = pid;

        p.ctime = now;
        p.etime = 0;
        p.rtime = 0;
        p.iotime = 0;

        p.priority = DEFAULT_PRIORITY;
        p.timeslices = 0;

        p.got_queue = false;
        p.cticks = 0;
        p.queue = 0;
        p.talloc = 0;

        p.n_run = 0;
        p.ps_wtime = 0;
        p.q_ticks = [0; NQUE];

        Some(i)
    }

    /// Reset a slot to Unused. The kernel stack and page directory must
    /// already have been handed back to the platform.
    pub(crate) fn free_slot(&mut self, i: usize) {
        let p = &mut self.procs[i];
        p.pid = 0;
        p.parent = None;
        p.name.clear();
        p.killed = false;
        p.chan = None;
        p.kstack = None;
        p.pgdir = None;
        p.sz = 0;
        p.state = ProcState::Unused;
    }

    /// Copy the fork-visible parent state into a freshly allocated child:
    /// memory size, trap frame, name, and the parent link.
    pub(crate) fn clone_into(&mut self, parent: usize, child: usize) {
        let (sz, tf, name) = {
            let p = &self.procs[parent];
            (p.sz, p.tf, p.name)
        };

        let c = &mut self.procs[child];
        c.sz = sz;
        c.tf = tf;
        // Clear a0 so that fork returns 0 in the child.
        c.tf.a0 = 0;
        c.name = name;
        c.parent = Some(parent);
    }

    /// One timer tick of accounting over the whole table, under a single
    /// lock acquisition.
    pub(crate) fn update_times(&mut self) {
        for p in self.procs.iter_mut() {
            match p.state {
                ProcState::Running => {
                    p.rtime += 1;
                    if self.policy == SchedPolicy::Mlfq {
                        p.q_ticks[p.queue] += 1;
                        p.cticks += 1;
                    }
                }
                ProcState::Sleeping => p.iotime += 1,
                ProcState::Runnable => p.ps_wtime += 1,
                _ => {}
            }
        }
    }

    /// Admit a runnable process to the tail of its current queue. No-op
    /// when it is already linked in.
    pub(crate) fn push_process(&mut self, i: usize) {
        if !self.procs[i].got_queue {
            self.procs[i].got_queue = true;
            self.procs[i].cticks = 0;
            self.procs[i].talloc = self.ticks;
            self.procs[i].ps_wtime = 0;
            let q = self.procs[i].queue;
            self.queues.push(q, i);
        }
    }

    // Wake up all processes sleeping on chan.
    // The table lock must be held.
    pub(crate) fn wakeup1(&mut self, chan: usize) {
        for i in 0..NPROC {
            if self.procs[i].state == ProcState::Sleeping && self.procs[i].chan == Some(chan) {
                self.procs[i].chan = None;
                self.procs[i].state = ProcState::Runnable;
                if self.policy == SchedPolicy::Mlfq {
                    // A sleeper keeps its queue level across the block.
                    self.push_process(i);
                }
            }
        }
    }

    /// Mark the process with the given pid killed, forcing a sleeper back
    /// onto the run queue. Returns false when no such process exists.
    pub(crate) fn kill_pid(&mut self, pid: i32) -> bool {
        for i in 0..NPROC {
            if self.procs[i].state != ProcState::Unused && self.procs[i].pid == pid {
                self.procs[i].killed = true;
                // Wake process from sleep if necessary.
                if self.procs[i].state == ProcState::Sleeping {
                    self.procs[i].chan = None;
                    self.procs[i].state = ProcState::Runnable;
                    if self.policy == SchedPolicy::Mlfq {
                        self.push_process(i);
                    }
                }
                return true;
            }
        }
        false
    }

    /// Scan for children of `parent`: whether any exist, and the slot of
    /// a zombie one if present.
    pub(crate) fn zombie_child_of(&self, parent: usize) -> (bool, Option<usize>) {
        let mut havekids = false;
        for (i, p) in self.procs.iter().enumerate() {
            if p.parent != Some(parent) {
                continue;
            }
            havekids = true;
            if p.state == ProcState::Zombie {
                return (true, Some(i));
            }
        }
        (havekids, None)
    }

    /// Accounting reported by waitx for a zombie: (run time, time spent
    /// waiting on a run queue). `wtime` is everything between creation
    /// and exit that was neither running nor sleeping.
    pub(crate) fn exit_times(&self, i: usize) -> (u64, u64) {
        let p = &self.procs[i];
        let wtime = p.etime - p.ctime - p.rtime - p.iotime;
        (p.rtime, wtime)
    }

    /// Wait channel identifying a slot; exit() wakes the parent through
    /// this.
    pub(crate) fn proc_chan(&self, i: usize) -> usize {
        &self.procs[i] as *const Proc as usize
    }

    pub(crate) fn ps_report<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        writeln!(
            w,
            "PID\tPriority\tState\tr_time\tw_time\tn_run\tcur_q\tq0\tq1\tq2\tq3\tq4"
        )?;
        for p in self.procs.iter() {
            if p.state == ProcState::Unused {
                continue;
            }
            writeln!(
                w,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                p.pid,
                p.priority,
                p.state.as_str(),
                p.rtime,
                p.ps_wtime,
                p.n_run,
                p.queue,
                p.q_ticks[0],
                p.q_ticks[1],
                p.q_ticks[2],
                p.q_ticks[3],
                p.q_ticks[4]
            )?;
        }
        Ok(())
    }
}

/// Look in the process table for an Unused slot and initialize the state
/// required to run in the kernel: a fresh kernel stack and a context that
/// resumes in forkret(). On stack exhaustion the slot rolls back to
/// Unused.
pub(crate) fn allocproc() -> Option<usize> {
    let i = PTABLE.lock().alloc_slot()?;

    // Allocate kernel stack.
    let kstack = match platform().kstack_alloc() {
        Some(ks) => ks,
        None => {
            PTABLE.lock().free_slot(i);
            return None;
        }
    };

    let mut table = PTABLE.lock();
    let p = &mut table.procs[i];
    p.kstack = Some(kstack);

    // Set up new context to start executing at forkret,
    // which returns to user space.
    p.context = Context::new();
    p.context.ra = forkret as usize;
    p.context.sp = kstack.top();

    Some(i)
}

/// Set up the first user process.
pub fn userinit() {
    let i = allocproc().expect("userinit: out of processes");

    let pgdir = platform().setupkvm().expect("userinit: out of memory?");
    platform().inituvm(pgdir);

    let mut table = PTABLE.lock();
    table.initproc = Some(i);

    let p = &mut table.procs[i];
    p.pgdir = Some(pgdir);
    p.sz = PGSIZE;
    p.tf = TrapFrame::zero();
    p.tf.sp = PGSIZE;
    p.tf.epc = 0; // beginning of initcode
    p.set_name("initcode");
    p.cwd = Some(platform().root_inode());

    // This assignment to state lets other cores run this process; the
    // table lock forces the writes above to be visible first.
    p.state = ProcState::Runnable;
    if table.policy == SchedPolicy::Mlfq {
        table.push_process(i);
    }
}

/// Grow the current process's memory by n bytes (shrink when negative).
/// Returns the old break.
pub fn growproc(n: i32) -> Result<usize> {
    let cur = myproc().ok_or(KernelError::NoProcess)?;

    let (pgdir, kstack, sz) = {
        let table = PTABLE.lock();
        let p = &table.procs[cur];
        (
            p.pgdir.expect("growproc: no page directory"),
            p.kstack.expect("growproc: no kernel stack"),
            p.sz,
        )
    };

    let newsz = if n > 0 {
        platform()
            .allocuvm(pgdir, sz, sz + n as usize)
            .ok_or(KernelError::OutOfMemory)?
    } else if n < 0 {
        platform()
            .deallocuvm(pgdir, sz, sz.saturating_sub(n.unsigned_abs() as usize))
            .ok_or(KernelError::OutOfMemory)?
    } else {
        sz
    };

    PTABLE.lock().procs[cur].sz = newsz;
    platform().switchuvm(pgdir, kstack);
    Ok(sz)
}

/// Create a new process copying the caller as the parent.
/// Sets up the child to return as if from a system call, with pid 0.
pub fn fork() -> Result<i32> {
    let cur = myproc().ok_or(KernelError::NoProcess)?;

    // Allocate process.
    let child = match allocproc() {
        Some(i) => i,
        None => return Err(KernelError::OutOfProcs),
    };

    let (parent_pgdir, parent_sz, parent_ofile, parent_cwd) = {
        let table = PTABLE.lock();
        let p = &table.procs[cur];
        (
            p.pgdir.expect("fork: no page directory"),
            p.sz,
            p.ofile,
            p.cwd,
        )
    };

    // Copy process state from the parent.
    let pgdir = match platform().copyuvm(parent_pgdir, parent_sz) {
        Some(pd) => pd,
        None => {
            let mut table = PTABLE.lock();
            if let Some(ks) = table.procs[child].kstack.take() {
                platform().kstack_free(ks);
            }
            table.free_slot(child);
            return Err(KernelError::OutOfMemory);
        }
    };

    let mut ofile = [None; NOFILE];
    for (fd, f) in parent_ofile.iter().enumerate() {
        if let Some(f) = f {
            ofile[fd] = Some(platform().file_dup(*f));
        }
    }
    let cwd = parent_cwd.map(|i| platform().inode_dup(i));

    let mut table = PTABLE.lock();
    table.clone_into(cur, child);

    let p = &mut table.procs[child];
    p.pgdir = Some(pgdir);
    p.ofile = ofile;
    p.cwd = cwd;
    let pid = p.pid;

    p.state = ProcState::Runnable;
    if table.policy == SchedPolicy::Mlfq {
        table.push_process(child);
    }

    Ok(pid)
}

/// Exit the current process.  Does not return.
/// An exited process remains in the zombie state
/// until its parent calls wait() to find out it exited.
pub fn exit() -> ! {
    let cur = myproc().expect("exit: no process");

    // Close all open files. Closing may sleep, so it happens outside the
    // table lock.
    let (ofile, cwd) = {
        let mut table = PTABLE.lock();
        if table.initproc == Some(cur) {
            panic!("init exiting");
        }
        let p = &mut table.procs[cur];
        (core::mem::replace(&mut p.ofile, [None; NOFILE]), p.cwd.take())
    };
    for f in ofile.into_iter().flatten() {
        platform().file_close(f);
    }
    if let Some(cwd) = cwd {
        platform().inode_put(cwd);
    }

    let mut table = PTABLE.lock();
    let now = table.ticks;
    table.procs[cur].etime = now;

    // Parent might be sleeping in wait().
    if let Some(parent) = table.procs[cur].parent {
        let chan = table.proc_chan(parent);
        table.wakeup1(chan);
    }

    // Pass abandoned children to init.
    let initproc = table.initproc.expect("exit: no init process");
    for i in 0..NPROC {
        if table.procs[i].parent == Some(cur) {
            table.procs[i].parent = Some(initproc);
            if table.procs[i].state == ProcState::Zombie {
                let chan = table.proc_chan(initproc);
                table.wakeup1(chan);
            }
        }
    }

    // Jump into the scheduler, never to return.
    table.procs[cur].state = ProcState::Zombie;
    sched(&mut table);
    panic!("zombie exit");
}

/// Wait for a child process to exit and return its pid.
pub fn wait() -> Result<i32> {
    wait_inner(None)
}

/// Wait for a child process to exit and return its pid, storing the
/// child's waiting and running times in wtime and rtime.
pub fn waitx(wtime: &mut i32, rtime: &mut i32) -> Result<i32> {
    wait_inner(Some((wtime, rtime)))
}

fn wait_inner(mut times: Option<(&mut i32, &mut i32)>) -> Result<i32> {
    let cur = myproc().ok_or(KernelError::NoProcess)?;

    let mut table = PTABLE.lock();
    loop {
        // Scan through the table looking for exited children.
        let (havekids, zombie) = table.zombie_child_of(cur);
        if let Some(i) = zombie {
            // Found one.
            let pid = table.procs[i].pid;
            if let Some((wtime, rtime)) = times.as_mut() {
                let (r, w) = table.exit_times(i);
                **rtime = r as i32;
                **wtime = w as i32;
            }
            if let Some(ks) = table.procs[i].kstack.take() {
                platform().kstack_free(ks);
            }
            if let Some(pgdir) = table.procs[i].pgdir.take() {
                platform().freevm(pgdir);
            }
            table.free_slot(i);
            return Ok(pid);
        }

        // No point waiting if we don't have any children.
        if !havekids {
            return Err(KernelError::NoChildren);
        }
        if table.procs[cur].killed {
            return Err(KernelError::Killed);
        }

        // Wait for children to exit.  (See the wakeup1 call in exit.)
        let chan = table.proc_chan(cur);
        table.procs[cur].chan = Some(chan);
        table.procs[cur].state = ProcState::Sleeping;
        sched(&mut table);
        table.procs[cur].chan = None;
    }
}

/// Atomically release the caller's lock and sleep on chan.
/// Reacquires the lock when awakened, handing back the new guard.
pub fn sleep<T>(chan: usize, lk: SpinMutexGuard<'_, T>) -> SpinMutexGuard<'_, T> {
    let p = myproc().expect("sleep: no process");

    // Must take the table lock in order to change the process state and
    // then call sched. Once it is held no wakeup can be missed (wakeup
    // runs with the table lock held), so it is okay to release lk.
    let mutex = SpinMutexGuard::source(&lk);
    let mut table = PTABLE.lock();
    drop(lk);

    // Go to sleep.
    table.procs[p].chan = Some(chan);
    table.procs[p].state = ProcState::Sleeping;

    sched(&mut table);

    // Tidy up.
    table.procs[p].chan = None;
    drop(table);

    // Reacquire original lock.
    mutex.lock()
}

// Wake up all processes sleeping on chan.
pub fn wakeup(chan: usize) {
    PTABLE.lock().wakeup1(chan);
}

/// Kill the process with the given pid. The victim won't exit until it
/// next returns to user space (enforced by the trap code).
pub fn kill(pid: i32) -> Result<()> {
    if PTABLE.lock().kill_pid(pid) {
        Ok(())
    } else {
        Err(KernelError::NoSuchProc)
    }
}

pub fn getpid() -> Result<i32> {
    let cur = myproc().ok_or(KernelError::NoProcess)?;
    Ok(PTABLE.lock().procs[cur].pid)
}

/// Timer-interrupt accounting hook: advances the tick counter and sweeps
/// the table once per tick.
pub fn clock_tick() {
    let mut table = PTABLE.lock();
    table.ticks += 1;
    table.update_times();
}

/// Print one line per live process: pid, priority, state, accounting,
/// and the per-queue tick histogram.
pub fn ps() {
    // Render outside the console lock.
    let mut report = alloc::string::String::new();
    {
        let table = PTABLE.lock();
        let _ = table.ps_report(&mut report);
    }
    print!("{}", report);
}

/// Print a process listing to the console.  For debugging.
/// Runs when the user types ^P on the console.
pub fn procdump() {
    let table = PTABLE.lock();
    for p in table.procs.iter() {
        if p.state == ProcState::Unused {
            continue;
        }
        println!("{} {:8} {}", p.pid, p.state.as_str(), p.name);
    }
}
