use core::cell::UnsafeCell;

use crate::{
    hal::platform,
    param::NCPU,
    spinlock::{pop_off, push_off},
};

pub static CPUS: Cpus = {
    const CPU: UnsafeCell<Cpu> = UnsafeCell::new(Cpu::new());
    Cpus([CPU; NCPU])
};

pub struct Cpus([UnsafeCell<Cpu>; NCPU]);
unsafe impl Sync for Cpus {}

/// Saved registers for kernel context switches.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // callee-saved registers
    pub s0: usize,
    pub s1: usize,
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
}

impl Context {
    pub const fn new() -> Context {
        Context {
            ra: 0,
            sp: 0,

            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

// Per-CPU state.
pub struct Cpu {
    pub proc: Option<usize>, // Slot of the process running on this cpu, or None.
    pub scheduler: Context,  // swtch() here to enter scheduler().
    pub ncli: i32,           // Depth of push_off() nesting.
    pub intena: bool,        // Were interrupts enabled before push_off()?
}

impl Cpu {
    const fn new() -> Cpu {
        Cpu {
            proc: None,
            scheduler: Context::new(),
            ncli: 0,
            intena: false,
        }
    }
}

// Must be called with interrupts disabled,
// to prevent race with process being moved
// to a different CPU.
pub(crate) fn cpuid() -> usize {
    platform().cpu_id()
}

/// Return this CPU's cpu struct.
///
/// # Safety
///
/// Interrupts must be disabled when calling this function, so that only
/// one CPU can reach its own `CPUS` element at a time.
pub unsafe fn mycpu() -> *mut Cpu {
    if platform().intr_get() {
        panic!("mycpu called with interrupts enabled");
    }
    let id = cpuid();
    CPUS.0[id].get()
}

/// Return the slot index of the process running on this CPU, or None.
pub fn myproc() -> Option<usize> {
    push_off();
    // SAFETY: push_off() disabled interrupts.
    let p = unsafe { (*mycpu()).proc };
    pop_off();
    p
}
