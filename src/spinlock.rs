//! Spin locks with interrupt-disable semantics.
//!
//! A CPU that spins on a lock an interrupt handler on the same CPU also
//! wants would deadlock, so every acquisition turns interrupts off first
//! and they stay off until this CPU drops its last lock. The per-CPU
//! depth counter (`ncli`) and the pre-disable state (`intena`) live in
//! the CPU descriptor and are maintained by [`push_off`]/[`pop_off`].
//!
//! The lock word records which CPU holds the lock, which is what makes
//! re-entrant acquisition detectable and every release auditable.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    cpu::{cpuid, mycpu},
    hal::platform,
};

// Sentinel owner; real CPU indices are < NCPU.
const NO_OWNER: usize = usize::MAX;

pub struct SpinMutex<T: ?Sized> {
    name: &'static str,  // reported in misuse panics
    owner: AtomicUsize,  // index of the holding CPU, or NO_OWNER
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(name: &'static str, data: T) -> SpinMutex<T> {
        SpinMutex {
            name,
            owner: AtomicUsize::new(NO_OWNER),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinMutex<T> {
    /// Spin until this CPU owns the lock. Interrupts are off from the
    /// moment of the attempt until the matching release.
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        push_off();

        let me = cpuid();
        if self.owner.load(Ordering::Relaxed) == me {
            panic!("acquire {}: cpu {} already holds it", self.name, me);
        }

        while self
            .owner
            .compare_exchange_weak(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        SpinMutexGuard { lock: self }
    }

    /// Does this CPU hold the lock? Callers have interrupts off, or the
    /// answer could describe a CPU we have been moved away from.
    pub fn holding(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == cpuid()
    }

    // Every unlock funnels through here, guard drop and handoff alike.
    fn release(&self) {
        if !self.holding() {
            panic!("release {}: not held by this cpu", self.name);
        }
        self.owner.store(NO_OWNER, Ordering::Release);
        pop_off();
    }

    /// Release a lock this CPU holds without going through a guard.
    ///
    /// # Safety
    ///
    /// The one legitimate caller is the scheduler handoff: a thread
    /// resumed by swtch() inherits a lock that was acquired on the other
    /// side of the switch and owns no guard for it. Anywhere else this
    /// breaks the guard discipline.
    pub unsafe fn force_unlock(&self) {
        self.release();
    }
}

pub struct SpinMutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinMutex<T>,
}

impl<'a, T: ?Sized> SpinMutexGuard<'a, T> {
    /// The mutex a guard was taken from, so sleep() can reacquire it
    /// after waking. An associated function rather than a method, to
    /// stay clear of names on `T` reachable through Deref.
    pub fn source(guard: &Self) -> &'a SpinMutex<T> {
        guard.lock
    }
}

impl<T: ?Sized> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Turn interrupts off and bump this CPU's disable depth. The state the
/// interrupts had before the outermost push is kept in `intena` so the
/// final pop_off() can restore it.
pub fn push_off() {
    let was_on = platform().intr_get();
    platform().intr_off();

    // SAFETY: interrupts just went off; nothing can migrate us.
    let cpu = unsafe { &mut *mycpu() };
    if cpu.ncli == 0 {
        cpu.intena = was_on;
    }
    cpu.ncli += 1;
}

/// Undo one push_off(). Interrupts come back only when the depth reaches
/// zero and they had been on before the outermost push.
pub fn pop_off() {
    if platform().intr_get() {
        panic!("pop_off: interrupts on");
    }

    // SAFETY: interrupts are verified off above.
    let cpu = unsafe { &mut *mycpu() };
    if cpu.ncli < 1 {
        panic!("pop_off: depth underflow");
    }

    cpu.ncli -= 1;
    if cpu.ncli == 0 && cpu.intena {
        platform().intr_on();
    }
}
