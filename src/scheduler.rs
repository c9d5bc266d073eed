//! The per-CPU scheduler loop, the four scheduling policies, and the
//! entry points through which a process gives the CPU back: yield_cpu(),
//! sleep()/wait() via sched(), and exit().
//!
//! Which policy drives dispatch is fixed when the kernel is built
//! (`param::SCHEDULER`); the policies observe the same table state and
//! differ only in how they pick and how they react to the timer.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    cpu::mycpu,
    cpu::myproc,
    error::{KernelError, Result},
    hal::platform,
    param::{AGE_THRESH, MAX_PRIORITY, NPROC, NQUE, SchedPolicy, SCHEDULER},
    proc::{ProcState, ProcTable, PTABLE},
    spinlock::SpinMutexGuard,
};

impl ProcTable {
    /// Pick the earliest-created runnable process; ties go to the lowest
    /// slot scanned first.
    pub(crate) fn pick_fcfs(&self) -> Option<usize> {
        let mut selected: Option<usize> = None;
        let mut earliest = 0;
        for (i, p) in self.procs.iter().enumerate() {
            if p.state != ProcState::Runnable {
                continue;
            }
            if selected.is_none() || p.ctime < earliest {
                earliest = p.ctime;
                selected = Some(i);
            }
        }
        selected
    }

    /// Pick the runnable process with the best (numerically lowest)
    /// priority, breaking ties by fewest timeslices.
    pub(crate) fn pick_pbs(&self) -> Option<usize> {
        let mut selected: Option<usize> = None;
        let mut best = (MAX_PRIORITY + 1, u32::MAX);
        for (i, p) in self.procs.iter().enumerate() {
            if p.state != ProcState::Runnable {
                continue;
            }
            if (p.priority, p.timeslices) < best {
                best = (p.priority, p.timeslices);
                selected = Some(i);
            }
        }
        selected
    }

    /// Admit unqueued runnable processes, and age the queued ones: a
    /// process that has sat runnable in queue > 0 for AGE_THRESH ticks
    /// moves up one queue.
    pub(crate) fn mlfq_admit_and_age(&mut self) {
        for i in 0..NPROC {
            if self.procs[i].state != ProcState::Runnable {
                continue;
            }
            if !self.procs[i].got_queue {
                self.push_process(i);
            } else if self.procs[i].queue > 0
                && self.ticks - self.procs[i].talloc >= AGE_THRESH
            {
                let q = self.procs[i].queue;
                self.queues.remove(q, i);
                self.procs[i].got_queue = false;
                self.procs[i].queue = q - 1;
                self.push_process(i);
            }
        }
    }

    /// Detach and return the head of the first non-empty queue.
    pub(crate) fn mlfq_select(&mut self) -> Option<usize> {
        for q in 0..NQUE {
            if let Some(i) = self.queues.pop(q) {
                self.procs[i].got_queue = false;
                self.procs[i].cticks = 0;
                return Some(i);
            }
        }
        None
    }

    /// Re-admit a process that came back from dispatch still runnable,
    /// demoting it one level when it consumed its whole quantum.
    pub(crate) fn mlfq_requeue(&mut self, i: usize) {
        if self.procs[i].state != ProcState::Runnable {
            return;
        }
        if self.procs[i].cticks >= (1u64 << self.procs[i].queue)
            && self.procs[i].queue != NQUE - 1
        {
            self.procs[i].queue += 1;
        }
        self.push_process(i);
    }

    /// Apply a new PBS priority to the process with the given pid.
    /// Returns the old priority and whether the new one is strictly
    /// better (which obliges the caller to yield).
    pub(crate) fn reprioritize(&mut self, new_priority: u32, pid: i32) -> Option<(u32, bool)> {
        for p in self.procs.iter_mut() {
            if p.state != ProcState::Unused && p.pid == pid {
                let old = p.priority;
                p.priority = new_priority;
                if new_priority != old {
                    p.timeslices = 0;
                }
                return Some((old, new_priority < old));
            }
        }
        None
    }

    /// Should the process running on this CPU be pre-empted at this tick
    /// boundary? RR always pre-empts; FCFS never does; PBS pre-empts for
    /// a strictly better-priority candidate; MLFQ pre-empts on a consumed
    /// quantum or when a higher queue has become non-empty.
    pub(crate) fn preempt_decision(&self, i: usize) -> bool {
        if self.procs[i].state != ProcState::Running {
            return false;
        }
        match self.policy {
            SchedPolicy::RoundRobin => true,
            SchedPolicy::Fcfs => false,
            SchedPolicy::Pbs => {
                let cur = self.procs[i].priority;
                self.procs
                    .iter()
                    .any(|p| p.state == ProcState::Runnable && p.priority < cur)
            }
            SchedPolicy::Mlfq => {
                let p = &self.procs[i];
                p.cticks >= (1u64 << p.queue) || self.queues.higher_nonempty(p.queue)
            }
        }
    }
}

/// Per-CPU process scheduler.
/// Each CPU calls scheduler() after setting itself up.
/// Scheduler never returns.  It loops, doing:
///  - choose a runnable process under the active policy
///  - swtch to start running that process
///  - eventually that process transfers control
///    via swtch back to the scheduler.
pub fn scheduler() -> ! {
    // SAFETY: interrupts are still disabled from boot.
    unsafe {
        (*mycpu()).proc = None;
    }

    loop {
        // Enable interrupts on this processor.
        platform().intr_on();

        let mut table = PTABLE.lock();
        match SCHEDULER {
            SchedPolicy::RoundRobin => {
                // Run every runnable process in table order, one pass per
                // lock acquisition.
                for i in 0..NPROC {
                    if table.procs[i].state != ProcState::Runnable {
                        continue;
                    }
                    run_proc(&mut table, i);
                }
            }
            SchedPolicy::Fcfs => {
                if let Some(i) = table.pick_fcfs() {
                    run_proc(&mut table, i);
                }
            }
            SchedPolicy::Pbs => {
                if let Some(i) = table.pick_pbs() {
                    table.procs[i].timeslices += 1;
                    run_proc(&mut table, i);
                }
            }
            SchedPolicy::Mlfq => {
                table.mlfq_admit_and_age();
                if let Some(i) = table.mlfq_select() {
                    run_proc(&mut table, i);
                    table.mlfq_requeue(i);
                }
            }
        }
        drop(table);
    }
}

/// Dispatch one process: the path shared by every policy. It is the
/// process's job to release the table lock and then reacquire it before
/// jumping back to us.
fn run_proc(table: &mut SpinMutexGuard<'_, ProcTable>, i: usize) {
    table.procs[i].n_run += 1;
    table.procs[i].ps_wtime = 0;

    let pgdir = table.procs[i].pgdir.expect("scheduler: runnable process has no pgdir");
    let kstack = table.procs[i].kstack.expect("scheduler: runnable process has no kstack");

    // SAFETY: interrupts are disabled while the table lock is held.
    let c = unsafe { &mut *mycpu() };
    c.proc = Some(i);
    platform().switchuvm(pgdir, kstack);
    table.procs[i].state = ProcState::Running;

    unsafe {
        platform().swtch(&mut c.scheduler, &mut table.procs[i].context);
    }
    platform().switchkvm();

    // Process is done running for now.
    // It should have changed its state before coming back.
    let c = unsafe { &mut *mycpu() };
    c.proc = None;
}

/// Enter the scheduler. The held table-lock guard witnesses that the
/// caller owns the table and has already changed the process state.
/// Saves and restores intena because intena is a property of this kernel
/// thread, not this CPU.
pub(crate) fn sched(table: &mut SpinMutexGuard<'_, ProcTable>) {
    let p = myproc().expect("sched: no process");

    // SAFETY: the table lock is held, so interrupts are disabled.
    let c = unsafe { &mut *mycpu() };
    if c.ncli != 1 {
        panic!("sched locks");
    }
    if table.procs[p].state == ProcState::Running {
        panic!("sched running");
    }
    if platform().intr_get() {
        panic!("sched interruptible");
    }

    let intena = c.intena;
    unsafe {
        platform().swtch(&mut table.procs[p].context, &mut c.scheduler);
    }

    // This thread may have been resumed on a different CPU.
    let c = unsafe { &mut *mycpu() };
    c.intena = intena;
}

/// Give up the CPU for one scheduling round.
pub fn yield_cpu() {
    let p = myproc().expect("yield: no process");
    let mut table = PTABLE.lock();
    table.procs[p].state = ProcState::Runnable;
    sched(&mut table);
}

/// A fork child's very first scheduling by scheduler() will swtch here.
/// "Return" to user space.
pub fn forkret() -> ! {
    static FIRST: AtomicBool = AtomicBool::new(true);

    // Still holding the table lock from scheduler.
    unsafe {
        PTABLE.force_unlock();
    }

    if FIRST.swap(false, Ordering::AcqRel) {
        // Some initialization must run in the context of a regular
        // process (it may sleep), and so cannot run from main().
        platform().fs_init();
    }

    platform().trap_return();
}

/// Change a process's priority, returning the previous one. When the new
/// priority is strictly better than the old, the caller yields at once so
/// the scheduler can reconsider.
pub fn set_priority(new_priority: i32, pid: i32) -> Result<i32> {
    if new_priority < 0 || new_priority > MAX_PRIORITY as i32 {
        return Err(KernelError::BadPriority);
    }

    let (old, lowered) = {
        let mut table = PTABLE.lock();
        match table.reprioritize(new_priority as u32, pid) {
            Some(r) => r,
            None => return Err(KernelError::NoSuchProc),
        }
    };

    if lowered {
        yield_cpu();
    }
    Ok(old as i32)
}

/// Pre-emption decision for the timer trap: after clock_tick() has
/// accounted the tick, a `true` here tells the trap handler to call
/// yield_cpu() before returning to user space.
pub fn should_yield() -> bool {
    let p = match myproc() {
        Some(p) => p,
        None => return false,
    };
    PTABLE.lock().preempt_decision(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::DEFAULT_PRIORITY;

    fn table(policy: SchedPolicy) -> ProcTable {
        ProcTable::new_for_test(policy)
    }

    fn spawn_runnable(t: &mut ProcTable, ctime: u64) -> usize {
        t.ticks = ctime;
        let i = t.alloc_slot().unwrap();
        t.procs[i].state = ProcState::Runnable;
        i
    }

    mod fcfs {
        use super::*;

        #[test]
        fn picks_minimum_ctime() {
            let mut t = table(SchedPolicy::Fcfs);
            let _late = spawn_runnable(&mut t, 30);
            let early = spawn_runnable(&mut t, 10);
            let _mid = spawn_runnable(&mut t, 20);

            assert_eq!(t.pick_fcfs(), Some(early));
        }

        #[test]
        fn ties_go_to_first_found() {
            let mut t = table(SchedPolicy::Fcfs);
            let a = spawn_runnable(&mut t, 10);
            let _b = spawn_runnable(&mut t, 10);

            assert_eq!(t.pick_fcfs(), Some(a));
        }

        #[test]
        fn runs_children_in_arrival_order() {
            let mut t = table(SchedPolicy::Fcfs);
            let c1 = spawn_runnable(&mut t, 10);
            let c2 = spawn_runnable(&mut t, 20);
            let c3 = spawn_runnable(&mut t, 30);

            // Each child runs to completion before the next is picked.
            for expected in [c1, c2, c3] {
                let picked = t.pick_fcfs().unwrap();
                assert_eq!(picked, expected);
                t.procs[picked].state = ProcState::Zombie;
            }
            assert_eq!(t.pick_fcfs(), None);
        }

        #[test]
        fn never_preempts() {
            let mut t = table(SchedPolicy::Fcfs);
            let cur = spawn_runnable(&mut t, 50);
            t.procs[cur].state = ProcState::Running;
            let _better = spawn_runnable(&mut t, 1);

            assert!(!t.preempt_decision(cur));
        }
    }

    mod pbs {
        use super::*;

        #[test]
        fn picks_lowest_priority_value() {
            let mut t = table(SchedPolicy::Pbs);
            let a = spawn_runnable(&mut t, 0);
            let b = spawn_runnable(&mut t, 0);
            t.procs[a].priority = 70;
            t.procs[b].priority = 20;

            assert_eq!(t.pick_pbs(), Some(b));
        }

        #[test]
        fn breaks_priority_ties_by_timeslices() {
            let mut t = table(SchedPolicy::Pbs);
            let a = spawn_runnable(&mut t, 0);
            let b = spawn_runnable(&mut t, 0);
            t.procs[a].timeslices = 4;
            t.procs[b].timeslices = 1;

            assert_eq!(t.pick_pbs(), Some(b));

            // Equal on both counts: first found wins.
            t.procs[b].timeslices = 4;
            assert_eq!(t.pick_pbs(), Some(a));
        }

        #[test]
        fn reprioritize_returns_old_and_resets_timeslices() {
            let mut t = table(SchedPolicy::Pbs);
            let i = spawn_runnable(&mut t, 0);
            t.procs[i].timeslices = 9;
            let pid = t.procs[i].pid;

            let (old, lowered) = t.reprioritize(20, pid).unwrap();
            assert_eq!(old, DEFAULT_PRIORITY);
            assert!(lowered);
            assert_eq!(t.procs[i].priority, 20);
            assert_eq!(t.procs[i].timeslices, 0);

            // Same priority again: no reset, no yield obligation.
            t.procs[i].timeslices = 5;
            let (old, lowered) = t.reprioritize(20, pid).unwrap();
            assert_eq!(old, 20);
            assert!(!lowered);
            assert_eq!(t.procs[i].timeslices, 5);
        }

        #[test]
        fn reprioritize_unknown_pid_is_none() {
            let mut t = table(SchedPolicy::Pbs);
            assert_eq!(t.reprioritize(10, 424242), None);
        }

        #[test]
        fn preempts_only_for_strictly_better_candidate() {
            let mut t = table(SchedPolicy::Pbs);
            let cur = spawn_runnable(&mut t, 0);
            t.procs[cur].state = ProcState::Running;
            t.procs[cur].priority = 50;

            let other = spawn_runnable(&mut t, 0);
            t.procs[other].priority = 50;
            assert!(!t.preempt_decision(cur));

            t.procs[other].priority = 49;
            assert!(t.preempt_decision(cur));
        }

        #[test]
        fn lowered_priority_candidate_runs_next() {
            let mut t = table(SchedPolicy::Pbs);
            let a = spawn_runnable(&mut t, 0);
            let b = spawn_runnable(&mut t, 0);
            t.procs[a].state = ProcState::Running;

            // Parent lowers B below A while B is runnable; after the
            // forced yield B must win the next pick.
            let (_, lowered) = t.reprioritize(20, t.procs[b].pid).unwrap();
            assert!(lowered);
            t.procs[a].state = ProcState::Runnable;
            assert_eq!(t.pick_pbs(), Some(b));
        }
    }

    mod mlfq {
        use super::*;

        #[test]
        fn admission_starts_in_queue_zero_and_stamps_talloc() {
            let mut t = table(SchedPolicy::Mlfq);
            t.ticks = 7;
            let i = t.alloc_slot().unwrap();
            t.procs[i].state = ProcState::Runnable;

            t.mlfq_admit_and_age();

            assert!(t.procs[i].got_queue);
            assert_eq!(t.procs[i].queue, 0);
            assert_eq!(t.procs[i].talloc, 7);
            assert_eq!(t.queues.head(0), Some(i));
        }

        #[test]
        fn select_takes_head_of_highest_nonempty_queue() {
            let mut t = table(SchedPolicy::Mlfq);
            let lo = spawn_runnable(&mut t, 0);
            let hi = spawn_runnable(&mut t, 0);
            t.procs[lo].queue = 3;
            t.mlfq_admit_and_age();

            // hi sits in queue 0, lo in queue 3.
            assert_eq!(t.mlfq_select(), Some(hi));
            assert!(!t.procs[hi].got_queue);
            assert_eq!(t.procs[hi].cticks, 0);

            assert_eq!(t.mlfq_select(), Some(lo));
            assert_eq!(t.mlfq_select(), None);
        }

        #[test]
        fn aging_promotes_after_age_thresh() {
            let mut t = table(SchedPolicy::Mlfq);
            let i = spawn_runnable(&mut t, 0);
            t.procs[i].queue = 4;
            t.mlfq_admit_and_age();
            assert_eq!(t.procs[i].talloc, 0);

            // One tick short: stays put.
            t.ticks = AGE_THRESH - 1;
            t.mlfq_admit_and_age();
            assert_eq!(t.procs[i].queue, 4);

            t.ticks = AGE_THRESH;
            t.mlfq_admit_and_age();
            assert_eq!(t.procs[i].queue, 3);
            assert!(t.procs[i].got_queue);
            assert_eq!(t.queues.head(3), Some(i));
            // talloc restarts for the new level.
            assert_eq!(t.procs[i].talloc, AGE_THRESH);
        }

        #[test]
        fn aging_moves_the_aged_process_not_the_queue_head() {
            let mut t = table(SchedPolicy::Mlfq);
            let front = spawn_runnable(&mut t, 0);
            t.procs[front].queue = 2;
            t.mlfq_admit_and_age();

            t.ticks = 10;
            let back = spawn_runnable(&mut t, 10);
            t.procs[back].queue = 2;
            t.mlfq_admit_and_age();

            // Only `front` has aged past the threshold.
            t.ticks = AGE_THRESH;
            t.mlfq_admit_and_age();

            assert_eq!(t.procs[front].queue, 1);
            assert_eq!(t.procs[back].queue, 2);
            assert_eq!(t.queues.head(2), Some(back));
            assert_eq!(t.queues.head(1), Some(front));
        }

        #[test]
        fn never_promotes_out_of_queue_zero() {
            let mut t = table(SchedPolicy::Mlfq);
            let i = spawn_runnable(&mut t, 0);
            t.mlfq_admit_and_age();

            t.ticks = 10 * AGE_THRESH;
            t.mlfq_admit_and_age();
            assert_eq!(t.procs[i].queue, 0);
        }

        #[test]
        fn quantum_consumed_demotes_one_level() {
            let mut t = table(SchedPolicy::Mlfq);
            let i = spawn_runnable(&mut t, 0);
            t.procs[i].queue = 1;
            t.procs[i].cticks = 2; // 2^1 consumed

            t.mlfq_requeue(i);

            assert_eq!(t.procs[i].queue, 2);
            assert!(t.procs[i].got_queue);
            assert_eq!(t.queues.head(2), Some(i));
        }

        #[test]
        fn early_yield_keeps_level() {
            let mut t = table(SchedPolicy::Mlfq);
            let i = spawn_runnable(&mut t, 0);
            t.procs[i].queue = 2;
            t.procs[i].cticks = 3; // quantum is 4

            t.mlfq_requeue(i);

            assert_eq!(t.procs[i].queue, 2);
            assert!(t.procs[i].got_queue);
        }

        #[test]
        fn bottom_queue_never_demotes_further() {
            let mut t = table(SchedPolicy::Mlfq);
            let i = spawn_runnable(&mut t, 0);
            t.procs[i].queue = NQUE - 1;
            t.procs[i].cticks = 1 << (NQUE - 1);

            t.mlfq_requeue(i);
            assert_eq!(t.procs[i].queue, NQUE - 1);
        }

        #[test]
        fn sleeping_process_is_not_requeued() {
            let mut t = table(SchedPolicy::Mlfq);
            let i = t.alloc_slot().unwrap();
            t.procs[i].state = ProcState::Sleeping;
            t.procs[i].chan = Some(1);

            t.mlfq_requeue(i);
            assert!(!t.procs[i].got_queue);
        }

        #[test]
        fn cpu_bound_process_descends_the_ladder() {
            let mut t = table(SchedPolicy::Mlfq);
            let i = spawn_runnable(&mut t, 0);

            // Walk one full dispatch/quantum cycle per level.
            for level in 0..NQUE - 1 {
                t.mlfq_admit_and_age();
                let picked = t.mlfq_select().unwrap();
                assert_eq!(picked, i);
                assert_eq!(t.procs[i].queue, level);

                t.procs[i].state = ProcState::Running;
                let quantum = 1u64 << level;
                let before = t.procs[i].q_ticks[level];
                for _ in 0..quantum {
                    t.ticks += 1;
                    t.update_times();
                }
                assert!(t.procs[i].q_ticks[level] - before >= quantum);

                t.procs[i].state = ProcState::Runnable;
                t.mlfq_requeue(i);
                assert_eq!(t.procs[i].queue, level + 1);
            }
        }

        #[test]
        fn preempts_on_quantum_or_higher_arrival() {
            let mut t = table(SchedPolicy::Mlfq);
            let cur = spawn_runnable(&mut t, 0);
            t.procs[cur].state = ProcState::Running;
            t.procs[cur].queue = 2;
            t.procs[cur].cticks = 0;
            assert!(!t.preempt_decision(cur));

            // Quantum consumed.
            t.procs[cur].cticks = 4;
            assert!(t.preempt_decision(cur));

            // Higher-priority arrival, quantum untouched.
            t.procs[cur].cticks = 0;
            let newcomer = spawn_runnable(&mut t, 0);
            t.mlfq_admit_and_age();
            assert_eq!(t.procs[newcomer].queue, 0);
            assert!(t.preempt_decision(cur));
        }
    }

    mod rr {
        use super::*;

        #[test]
        fn preempts_every_tick_while_running() {
            let mut t = table(SchedPolicy::RoundRobin);
            let i = spawn_runnable(&mut t, 0);
            assert!(!t.preempt_decision(i)); // not running yet

            t.procs[i].state = ProcState::Running;
            assert!(t.preempt_decision(i));
        }
    }
}
