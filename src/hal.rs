//! The narrow contracts the scheduling core consumes from the rest of the
//! kernel: interrupt control, CPU identity, the context-switch primitive,
//! kernel-stack pages, the VM layer, opaque file-table handles, and the
//! console. The embedder implements [`Platform`] for its architecture and
//! installs it once at boot, before the first process is created.

use alloc::boxed::Box;

use once_cell::race::OnceBox;

use crate::{cpu::Context, param::KSTACKSIZE};

/// An exclusively owned kernel-stack region, identified by its base address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KStack(pub usize);

impl KStack {
    /// Address one past the end of the stack; stacks grow down from here.
    pub fn top(&self) -> usize {
        self.0 + KSTACKSIZE
    }
}

/// Opaque handle to a process page directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageDir(pub usize);

/// Opaque handle to an open-file-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileRef(pub usize);

/// Opaque handle to an in-core inode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeRef(pub usize);

pub trait Platform: Sync {
    // Interrupt control on the current CPU.
    fn intr_get(&self) -> bool;
    fn intr_on(&self);
    fn intr_off(&self);

    /// Index of the executing CPU, in [0, NCPU). Only meaningful while
    /// interrupts are disabled.
    fn cpu_id(&self) -> usize;

    /// Save the current kernel context into `old` and resume `new`.
    /// Interrupts stay disabled across the call; any lock the caller holds
    /// is still held by whichever thread resumes on the other side.
    ///
    /// # Safety
    ///
    /// Both pointers must reference live, correctly initialized contexts.
    unsafe fn swtch(&self, old: *mut Context, new: *mut Context);

    // Kernel stacks.
    fn kstack_alloc(&self) -> Option<KStack>;
    fn kstack_free(&self, ks: KStack);

    // Virtual memory.
    fn setupkvm(&self) -> Option<PageDir>;
    fn inituvm(&self, pgdir: PageDir);
    fn copyuvm(&self, pgdir: PageDir, sz: usize) -> Option<PageDir>;
    fn allocuvm(&self, pgdir: PageDir, oldsz: usize, newsz: usize) -> Option<usize>;
    fn deallocuvm(&self, pgdir: PageDir, oldsz: usize, newsz: usize) -> Option<usize>;
    fn freevm(&self, pgdir: PageDir);
    fn switchuvm(&self, pgdir: PageDir, kstack: KStack);
    fn switchkvm(&self);

    // Open files and working directories, opaque to the scheduler.
    fn file_dup(&self, f: FileRef) -> FileRef;
    fn file_close(&self, f: FileRef);
    fn inode_dup(&self, i: InodeRef) -> InodeRef;
    fn inode_put(&self, i: InodeRef);
    fn root_inode(&self) -> InodeRef;

    /// Filesystem initialization that must run in process context; called
    /// exactly once, from the first forkret().
    fn fs_init(&self);

    /// Console byte output for print!/println! and ps().
    fn console_putc(&self, c: u8);

    /// Return to user space through the trap frame. The synthesized context
    /// built by allocproc() lands in forkret(), which ends up here.
    fn trap_return(&self) -> !;
}

static PLATFORM: OnceBox<&'static dyn Platform> = OnceBox::new();

/// Install the embedder's platform. Must happen once, before any process
/// or lock is touched.
pub fn install(p: &'static dyn Platform) {
    if PLATFORM.set(Box::new(p)).is_err() {
        panic!("platform already installed");
    }
}

pub(crate) fn platform() -> &'static dyn Platform {
    *PLATFORM.get().expect("platform not installed")
}
