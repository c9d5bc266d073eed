use core::fmt;

/// Errors surfaced to callers as negative syscall returns. Invariant
/// violations never take this path; they panic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// No free slot in the process table.
    OutOfProcs,
    /// Kernel stack or user memory allocation failed.
    OutOfMemory,
    /// wait()/waitx() caller has no children.
    NoChildren,
    /// The calling process has been killed.
    Killed,
    /// set_priority() with a priority outside [0, MAX_PRIORITY].
    BadPriority,
    /// No live process with the given pid.
    NoSuchProc,
    /// Syscall issued with no process on this CPU.
    NoProcess,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl KernelError {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelError::OutOfProcs => "process table full",
            KernelError::OutOfMemory => "out of memory",
            KernelError::NoChildren => "no children",
            KernelError::Killed => "killed",
            KernelError::BadPriority => "priority out of range",
            KernelError::NoSuchProc => "no such process",
            KernelError::NoProcess => "no current process",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
