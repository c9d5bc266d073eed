//! A host-side [`Platform`] for unit tests: interrupts are a thread-local
//! flag, each test thread acts as its own CPU, swtch() records the call
//! and returns immediately (the "switched-to" side is simply the caller
//! resuming), and the resource hooks hand out counted tokens.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread::ThreadId;

use crate::cpu::{mycpu, Context};
use crate::hal::{self, FileRef, InodeRef, KStack, PageDir, Platform};
use crate::param::{KSTACKSIZE, NCPU, SCHEDULER};
use crate::proc::{ProcTable, PTABLE};

thread_local! {
    static INTR_ON: Cell<bool> = const { Cell::new(false) };
}

pub struct TestPlatform {
    cpu_ids: Mutex<HashMap<ThreadId, usize>>,
    next_kstack: AtomicUsize,
    next_pgdir: AtomicUsize,
    pub fail_kstack: AtomicBool,
    pub swtch_count: AtomicUsize,
    pub kstack_frees: AtomicUsize,
    pub vm_frees: AtomicUsize,
    pub file_dups: AtomicUsize,
    pub file_closes: AtomicUsize,
    pub console: Mutex<Vec<u8>>,
}

impl TestPlatform {
    fn new() -> TestPlatform {
        TestPlatform {
            cpu_ids: Mutex::new(HashMap::new()),
            next_kstack: AtomicUsize::new(0),
            next_pgdir: AtomicUsize::new(1),
            fail_kstack: AtomicBool::new(false),
            swtch_count: AtomicUsize::new(0),
            kstack_frees: AtomicUsize::new(0),
            vm_frees: AtomicUsize::new(0),
            file_dups: AtomicUsize::new(0),
            file_closes: AtomicUsize::new(0),
            console: Mutex::new(Vec::new()),
        }
    }

    pub fn console_text(&self) -> String {
        String::from_utf8_lossy(&self.console.lock().unwrap()).into_owned()
    }
}

impl Platform for TestPlatform {
    fn intr_get(&self) -> bool {
        INTR_ON.with(|c| c.get())
    }

    fn intr_on(&self) {
        INTR_ON.with(|c| c.set(true));
    }

    fn intr_off(&self) {
        INTR_ON.with(|c| c.set(false));
    }

    fn cpu_id(&self) -> usize {
        let id = std::thread::current().id();
        let mut map = self.cpu_ids.lock().unwrap();
        let n = map.len();
        *map.entry(id).or_insert(n % NCPU)
    }

    unsafe fn swtch(&self, _old: *mut Context, _new: *mut Context) {
        self.swtch_count.fetch_add(1, Ordering::Relaxed);
    }

    fn kstack_alloc(&self) -> Option<KStack> {
        if self.fail_kstack.swap(false, Ordering::Relaxed) {
            return None;
        }
        let n = self.next_kstack.fetch_add(1, Ordering::Relaxed);
        Some(KStack(0x8000_0000 + n * KSTACKSIZE))
    }

    fn kstack_free(&self, _ks: KStack) {
        self.kstack_frees.fetch_add(1, Ordering::Relaxed);
    }

    fn setupkvm(&self) -> Option<PageDir> {
        Some(PageDir(self.next_pgdir.fetch_add(1, Ordering::Relaxed)))
    }

    fn inituvm(&self, _pgdir: PageDir) {}

    fn copyuvm(&self, _pgdir: PageDir, _sz: usize) -> Option<PageDir> {
        Some(PageDir(self.next_pgdir.fetch_add(1, Ordering::Relaxed)))
    }

    fn allocuvm(&self, _pgdir: PageDir, _oldsz: usize, newsz: usize) -> Option<usize> {
        Some(newsz)
    }

    fn deallocuvm(&self, _pgdir: PageDir, _oldsz: usize, newsz: usize) -> Option<usize> {
        Some(newsz)
    }

    fn freevm(&self, _pgdir: PageDir) {
        self.vm_frees.fetch_add(1, Ordering::Relaxed);
    }

    fn switchuvm(&self, _pgdir: PageDir, _kstack: KStack) {}

    fn switchkvm(&self) {}

    fn file_dup(&self, f: FileRef) -> FileRef {
        self.file_dups.fetch_add(1, Ordering::Relaxed);
        f
    }

    fn file_close(&self, _f: FileRef) {
        self.file_closes.fetch_add(1, Ordering::Relaxed);
    }

    fn inode_dup(&self, i: InodeRef) -> InodeRef {
        i
    }

    fn inode_put(&self, _i: InodeRef) {}

    fn root_inode(&self) -> InodeRef {
        InodeRef(1)
    }

    fn fs_init(&self) {}

    fn console_putc(&self, c: u8) {
        self.console.lock().unwrap().push(c);
    }

    fn trap_return(&self) -> ! {
        panic!("trap_return reached in a test");
    }
}

/// The process-wide platform, installed into the hal on first use.
pub fn test_platform() -> &'static TestPlatform {
    static PLAT: OnceLock<&'static TestPlatform> = OnceLock::new();
    PLAT.get_or_init(|| {
        let p: &'static TestPlatform = Box::leak(Box::new(TestPlatform::new()));
        hal::install(p);
        p
    })
}

/// Tests that touch the global table, the per-CPU state, or any spinlock
/// run one at a time under this lock; pure ProcTable tests don't need it.
pub fn serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Acquire the serial lock and start from a clean slate: platform ready,
/// this thread's CPU descriptor zeroed, the process table empty.
pub fn setup() -> MutexGuard<'static, ()> {
    let guard = serial();
    test_platform();
    unsafe {
        let c = &mut *mycpu();
        c.proc = None;
        c.ncli = 0;
        c.intena = false;
    }
    *PTABLE.lock() = ProcTable::new_for_test(SCHEDULER);
    guard
}

/// Point this thread's CPU at a slot, as if the scheduler had dispatched
/// it.
pub fn set_current(i: Option<usize>) {
    unsafe {
        (*mycpu()).proc = i;
    }
}

/// Build a slot that looks like a dispatched user process and make it
/// current on this thread's CPU.
pub fn install_running(name: &str) -> usize {
    let mut table = PTABLE.lock();
    let i = table.alloc_slot().unwrap();
    let p = &mut table.procs[i];
    p.state = crate::proc::ProcState::Running;
    p.pgdir = Some(PageDir(7000));
    p.kstack = Some(KStack(0x1000));
    p.sz = 4096;
    p.set_name(name);
    drop(table);
    set_current(Some(i));
    i
}
