//! PROC: process/kthread descriptors and the round-robin scheduler
//! (spec.md §4.5/§4.6). Grounded on `kernel/process.c`'s
//! `create_process`/`create_kthread`/`destroy_current_process`/`schedule`
//! (see DESIGN.md).
//!
//! Every process and kthread lives in one fixed-size arena
//! (`[Option<Process>; NPROC]`) addressed by `ProcIdx`, rather than the
//! teacher's `Pin<&Procs>`/`Branded`/`Rc` scheme: that machinery exists in
//! the teacher to let multiple cores hold simultaneous borrowed references
//! into the pool, which a single-CPU kernel never needs. A `ProcIdx` is
//! just an array index; the arena is the one owner of every `Process`, and
//! wait lists/the ready queue only ever store indices (see DESIGN.md's
//! "cyclic graphs" note).

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use array_macro::array;
use arrayvec::ArrayVec;

use crate::arch::addr::{PAddr, VAddr, PAGE_SIZE};
use crate::arch::interface::{Arch, ContextManager, MapAttrs, TrapFrame};
use crate::arch::{self, TargetArch};
use crate::error::{KernelError, KResult};
use crate::kmem;
use crate::lock::IrqLock;
use crate::mmu::UserSpace;
use crate::page::ZoneHeader;
use crate::param::{BinaryTable, KSTACK_PAGES, MAXPROCNAME, NPROC, NPROC_SOCKETS, USER_VM_BASE};
use crate::socket::SocketId;
use crate::wait::WaitList;

/// Index into the process arena. Not reused across generations -- a stale
/// index read from a half-updated structure would land on `None` (the slot
/// having since been freed and possibly reassigned to an unrelated process),
/// never silently aliases another process with the same field layout.
pub type ProcIdx = usize;

/// Sentinel `ProcIdx` meaning "the boot stack, not any process" -- `CURRENT`
/// holds this until the first `schedule()` call ever runs.
const BOOT_SENTINEL: ProcIdx = usize::MAX;

type Context = <TargetArch as Arch>::Context;
type Trap = <TargetArch as Arch>::Trap;

/// A process's own readiness, independent of whether it happens to be the
/// one `CURRENT` is pointing at right now: selection (`schedule`/`pick_next`)
/// must never itself clear this, only an explicit block (`set_ready(idx,
/// false)`) does (spec.md §4.5's state machine: "ready=1 -> selected ->
/// ready=0 on block"). `CURRENT` already names the running process, so
/// there is no separate "Running" variant here to keep in sync with it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ProcState {
    Ready,
    Blocked,
    Zombie,
}

/// One process or kernel thread (spec.md §3's descriptor). Kthreads leave
/// `user`/`vmem_phys` `None` and resume through `kthread_fn`/`kthread_arg`
/// instead of a trap frame.
pub struct Process {
    pub id: u32,
    pub name: [u8; MAXPROCNAME],
    state: ProcState,
    kernel_thread: bool,
    /// Set while a syscall this process made is still being serviced;
    /// diagnostic only (spec.md §3's `in_syscall` flag) -- syscalls on this
    /// kernel never block the dispatcher itself, they block the caller via
    /// `wait_for`, which always runs with this still `true`.
    in_syscall: bool,
    context: Context,
    trapframe: Trap,
    kstack_phys: PAddr,
    kstack_top: usize,
    user: Option<UserSpace>,
    /// Physical page backing this process's per-process `ZoneHeader`
    /// (spec.md §4.5 step 3's "virtual-memory allocator spanning the user
    /// address range"). `None` for kthreads.
    vmem_phys: Option<PAddr>,
    kthread_fn: Option<fn(usize)>,
    kthread_arg: usize,
    exit_waiters: WaitList,
    exit_code: i32,
    sockets: ArrayVec<SocketId, NPROC_SOCKETS>,
}

impl Process {
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    pub fn open_sockets(&mut self) -> &mut ArrayVec<SocketId, NPROC_SOCKETS> {
        &mut self.sockets
    }
}

static PROCS: IrqLock<[Option<Process>; NPROC]> = IrqLock::new("procs", array![_ => None; NPROC]);

/// The global run list: every live `ProcIdx`, ready or not, in round-robin
/// rotation order. Grounded on `process_list`'s circular list in the
/// original; realized here as a flat index array since the arena already
/// owns storage (see module doc).
static PROCESS_LIST: IrqLock<ArrayVec<ProcIdx, NPROC>> = IrqLock::new("process_list", ArrayVec::new_const());

static CURRENT: AtomicUsize = AtomicUsize::new(BOOT_SENTINEL);
static NEXT_PID: AtomicU32 = AtomicU32::new(1);
static IDLE_IDX: AtomicUsize = AtomicUsize::new(BOOT_SENTINEL);

/// Kernel stack whose free is deferred because the process that owned it
/// was still executing on it when it retired (spec.md §4.5: "the kernel
/// stack is freed only after execution has transferred off it"). Reaped by
/// whichever process resumes next, at the top of `schedule()`'s post-switch
/// continuation or a trampoline entry point.
static PENDING_KSTACK_FREE: IrqLock<Option<PAddr>> = IrqLock::new("pending_kstack_free", None);

static mut BOOT_CONTEXT: MaybeUninit<Context> = MaybeUninit::uninit();

static BINARIES: IrqLock<Option<BinaryTable>> = IrqLock::new("binaries", None);

/// The empty-process-list fallback hook (SPEC_FULL.md's supplemented
/// "swappable `Scheduler::on_process_list_empty`"): a single function
/// pointer, defaulting to spawning `kshell_stub`, that a caller may replace
/// wholesale.
pub type EmptyListHook = fn();

static ON_EMPTY_HOOK: IrqLock<EmptyListHook> = IrqLock::new("on_process_list_empty", default_on_empty_hook);

fn default_on_empty_hook() {
    if let Err(e) = create_kthread(kshell_stub, 0, "kshell_stub") {
        crate::kerror!("proc: failed to spawn kshell_stub fallback: {}", e);
    }
}

/// Replaces the empty-process-list fallback. A real shell/init process
/// would call this once at boot to register itself instead of the built-in
/// diagnostic stub.
pub fn set_on_process_list_empty(hook: EmptyListHook) {
    *ON_EMPTY_HOOK.lock() = hook;
}

fn kshell_stub(_arg: usize) {
    loop {
        {
            let list = PROCESS_LIST.lock();
            crate::kinfo!("kshell_stub: {} process(es) in the global list", list.len());
        }
        yield_current();
    }
}

fn idle_loop(_arg: usize) {
    loop {
        TargetArch::intr_on();
        core::hint::spin_loop();
        yield_current();
    }
}

/// Brings up the process subsystem: records the bundled binary table
/// `runproc` consults, and creates the idle kthread every scheduling pass
/// falls back to. Must run once, after KMEM/SLAB are up, before the first
/// call to `schedule`/`start_scheduler`.
pub fn init(binaries: BinaryTable) {
    *BINARIES.lock() = Some(binaries);
    // SAFETY: single-threaded boot, before the scheduler ever runs.
    unsafe { BOOT_CONTEXT = MaybeUninit::new(Context::zeroed()) };
    let idle = create_kthread(idle_loop, 0, "idle").expect("proc::init: failed to create idle kthread");
    set_ready(idle, false);
    IDLE_IDX.store(idle, Ordering::Relaxed);
}

fn next_pid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

fn set_name(dst: &mut [u8; MAXPROCNAME], name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(MAXPROCNAME - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
    for b in &mut dst[n..] {
        *b = 0;
    }
}

/// Finds (without reserving) the first empty slot. Single-CPU, and nothing
/// between this and the matching `install_slot` ever yields, so the gap
/// cannot be raced by another allocation.
fn find_free_slot() -> KResult<ProcIdx> {
    let procs = PROCS.lock();
    procs.iter().position(|p| p.is_none()).ok_or(KernelError::OutOfMemory)
}

fn install_slot(idx: ProcIdx, proc: Process) {
    let mut procs = PROCS.lock();
    procs[idx] = Some(proc);
}

fn publish(idx: ProcIdx) -> KResult<()> {
    PROCESS_LIST.lock().try_push(idx).map_err(|_| KernelError::OutOfMemory)
}

/// Creates a kernel thread: allocates a kernel stack, builds a context whose
/// `lr` points at the architecture's kthread trampoline and whose one-word
/// argument is this process's own `ProcIdx` (spec.md §4.5's 4-step
/// create_kthread). The trampoline recovers that index and calls
/// [`proc_kthread_entry`], which looks up `entry`/`arg` from the arena.
pub fn create_kthread(entry: fn(usize), arg: usize, name: &str) -> KResult<ProcIdx> {
    let kstack_phys = kmem::kalloc_pages(KSTACK_PAGES * PAGE_SIZE, 0)?;
    let kstack_top = kmem::ktov(kstack_phys).addr() + KSTACK_PAGES * PAGE_SIZE;

    let idx = match find_free_slot() {
        Ok(idx) => idx,
        Err(e) => {
            let _ = kmem::kfree_pages(kstack_phys, KSTACK_PAGES * PAGE_SIZE);
            return Err(e);
        }
    };

    let mut context = Context::zeroed();
    context.set_entry(arch::kthread_trampoline as usize);
    context.set_stack(kstack_top);
    context.set_arg0(idx);

    let mut proc_name = [0u8; MAXPROCNAME];
    set_name(&mut proc_name, name);

    install_slot(
        idx,
        Process {
            id: next_pid(),
            name: proc_name,
            state: ProcState::Ready,
            kernel_thread: true,
            in_syscall: false,
            context,
            trapframe: Trap::zeroed(),
            kstack_phys,
            kstack_top,
            user: None,
            vmem_phys: None,
            kthread_fn: Some(entry),
            kthread_arg: arg,
            exit_waiters: WaitList::new(),
            exit_code: 0,
            sockets: ArrayVec::new(),
        },
    );
    publish(idx)?;
    Ok(idx)
}

/// Creates a user process from a loaded image: allocates a kernel stack, a
/// per-process virtual-memory allocator spanning the user address range, an
/// address space with the image mapped read-write-user at the fixed load
/// address, and a trap frame ready to enter it (spec.md §4.5's 6-step
/// create_process). Unlike the original, the image is copied straight from
/// its direct-mapped physical page to the freshly allocated one -- this
/// kernel's direct map is always live, so there is no need for the
/// original's temporary-mapping dance (recorded in DESIGN.md).
pub fn create_process(image: &[u8], name: &str) -> KResult<ProcIdx> {
    let size = (image.len().max(1) + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    // One extra page of mapped space past the image for a stack.
    let mapped_size = size + PAGE_SIZE;

    let kstack_phys = kmem::kalloc_pages(KSTACK_PAGES * PAGE_SIZE, 0)?;
    let kstack_top = kmem::ktov(kstack_phys).addr() + KSTACK_PAGES * PAGE_SIZE;
    let cleanup_kstack = |e: KernelError| -> KernelError {
        let _ = kmem::kfree_pages(kstack_phys, KSTACK_PAGES * PAGE_SIZE);
        e
    };

    let vmem_phys = kmem::kalloc_pages(PAGE_SIZE, 0).map_err(cleanup_kstack)?;
    // SAFETY: `vmem_phys` is a freshly allocated, exclusively owned page;
    // the direct map makes its kernel VA dereferenceable as a `ZoneHeader`.
    let vmem_header = unsafe { &mut *(kmem::ktov(vmem_phys).addr() as *mut ZoneHeader) };
    let cleanup_vmem = |e: KernelError| -> KernelError {
        let _ = kmem::kfree_pages(kstack_phys, KSTACK_PAGES * PAGE_SIZE);
        let _ = kmem::kfree_pages(vmem_phys, PAGE_SIZE);
        e
    };
    ZoneHeader::init(vmem_header, USER_VM_BASE, crate::arch::memlayout::USER_END).map_err(cleanup_vmem)?;
    vmem_header.mark_alloc(USER_VM_BASE, mapped_size).map_err(cleanup_vmem)?;

    let mut space = kmem::new_user_space().map_err(cleanup_vmem)?;

    let image_phys = kmem::kalloc_pages(mapped_size, 0).map_err(cleanup_vmem)?;
    // SAFETY: `image_phys` is freshly allocated and not yet mapped anywhere;
    // its direct-map VA is exclusively ours until `umem_map` below.
    unsafe {
        let dst = kmem::ktov(image_phys).addr() as *mut u8;
        core::ptr::copy_nonoverlapping(image.as_ptr(), dst, image.len());
        core::ptr::write_bytes(dst.add(image.len()), 0, mapped_size - image.len());
    }
    if let Err(e) = kmem::umem_map(&mut space, VAddr::new(USER_VM_BASE), image_phys, mapped_size, MapAttrs::USER_RW) {
        let _ = kmem::kfree_pages(image_phys, mapped_size);
        return Err(cleanup_vmem(e));
    }

    let mut trapframe = Trap::zeroed();
    trapframe.set_pc(USER_VM_BASE);
    trapframe.set_sp(USER_VM_BASE + mapped_size);

    let idx = match find_free_slot() {
        Ok(idx) => idx,
        Err(e) => {
            space.umem_free(|p| {
                let _ = kmem::kfree_pages(p, PAGE_SIZE);
            });
            return Err(cleanup_vmem(e));
        }
    };

    let mut context = Context::zeroed();
    context.set_entry(arch::user_trampoline as usize);
    context.set_stack(kstack_top);
    context.set_arg0(idx);

    let mut proc_name = [0u8; MAXPROCNAME];
    set_name(&mut proc_name, name);

    install_slot(
        idx,
        Process {
            id: next_pid(),
            name: proc_name,
            state: ProcState::Ready,
            kernel_thread: false,
            in_syscall: false,
            context,
            trapframe,
            kstack_phys,
            kstack_top,
            user: Some(space),
            vmem_phys: Some(vmem_phys),
            kthread_fn: None,
            kthread_arg: 0,
            exit_waiters: WaitList::new(),
            exit_code: 0,
            sockets: ArrayVec::new(),
        },
    );
    publish(idx)?;
    Ok(idx)
}

/// Looks up a bundled image by name (the static binary table SPEC_FULL.md's
/// `runproc` syscall consults) and creates a process from it.
pub fn runproc(name: &str) -> KResult<ProcIdx> {
    let image = {
        let guard = BINARIES.lock();
        let table = guard.ok_or(KernelError::NoSuchDevice)?;
        table.iter().find(|(n, _)| *n == name).map(|(_, img)| *img).ok_or(KernelError::NoSuchEntry)?
    };
    create_process(image, name)
}

/// Blocks the current process until `target` exits (spec.md's `runproc`
/// `RUNPROC_F_WAIT` flag). A no-op if `target` has already retired.
pub fn wait_for_proc_exit(target: ProcIdx) {
    unsafe { crate::lock::push_off() };
    let idx = match current_idx() {
        Some(idx) => idx,
        None => {
            unsafe { crate::lock::pop_off() };
            return;
        }
    };
    let still_live = {
        let arr = PROCS.get_mut_raw();
        // SAFETY: interrupts disabled for the whole of this check-and-add.
        unsafe {
            match (*arr)[target].as_mut() {
                Some(p) => {
                    p.exit_waiters.add_waiter(idx);
                    true
                }
                None => false,
            }
        }
    };
    if !still_live {
        unsafe { crate::lock::pop_off() };
        return;
    }
    set_ready(idx, false);
    unsafe { crate::lock::pop_off() };
    schedule();
}

pub fn current_idx() -> Option<ProcIdx> {
    let idx = CURRENT.load(Ordering::Relaxed);
    if idx == BOOT_SENTINEL {
        None
    } else {
        Some(idx)
    }
}

pub fn getpid() -> KResult<u32> {
    let idx = current_idx().ok_or(KernelError::NoSuchEntry)?;
    let procs = PROCS.lock();
    procs[idx].as_ref().map(|p| p.id).ok_or(KernelError::NoSuchEntry)
}

pub fn set_in_syscall(in_syscall: bool) {
    if let Some(idx) = current_idx() {
        let mut procs = PROCS.lock();
        if let Some(p) = procs[idx].as_mut() {
            p.in_syscall = in_syscall;
        }
    }
}

/// Runs `f` with the current process's open-socket list and user address
/// space, for the `syscall` module's socket/pointer-validation handlers.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> KResult<R> {
    let idx = current_idx().ok_or(KernelError::NoSuchEntry)?;
    let mut procs = PROCS.lock();
    let p = procs[idx].as_mut().ok_or(KernelError::NoSuchEntry)?;
    Ok(f(p))
}

pub fn current_user_space_root() -> KResult<PAddr> {
    let idx = current_idx().ok_or(KernelError::NoSuchEntry)?;
    let procs = PROCS.lock();
    let p = procs[idx].as_ref().ok_or(KernelError::NoSuchEntry)?;
    p.user.as_ref().map(|u| u.root()).ok_or(KernelError::NoSuchEntry)
}

pub fn validate_current_user_range(virt: VAddr, len: usize) -> bool {
    let idx = match current_idx() {
        Some(idx) => idx,
        None => return false,
    };
    let procs = PROCS.lock();
    match procs[idx].as_ref().and_then(|p| p.user.as_ref()) {
        Some(space) => kmem::validate_user_range(space, virt, len),
        None => false,
    }
}

pub fn copy_current_user_bytes(virt: VAddr, len: usize) -> Option<&'static [u8]> {
    if !validate_current_user_range(virt, len) {
        return None;
    }
    // SAFETY: `validate_current_user_range` walked every page of
    // `[virt, virt+len)` in the currently installed user table, which
    // remains installed (as `TTBR0`) for the whole syscall, so the bytes are
    // readable for the duration of this call. The returned slice's `'static`
    // lifetime is a syscall-ABI convenience: callers must not retain it past
    // the syscall that produced it.
    Some(unsafe { core::slice::from_raw_parts(virt.addr() as *const u8, len) })
}

pub fn set_ready(idx: ProcIdx, ready: bool) {
    let mut procs = PROCS.lock();
    if let Some(p) = procs[idx].as_mut() {
        if p.state != ProcState::Zombie {
            p.state = if ready { ProcState::Ready } else { ProcState::Blocked };
        }
    }
}

fn is_ready(idx: ProcIdx) -> bool {
    let procs = PROCS.lock();
    matches!(procs[idx].as_ref().map(|p| p.state), Some(ProcState::Ready))
}

/// Adds the current process to `list` and clears its ready bit, then invokes
/// the scheduler (spec.md §4.4's `wait_for`). `list` must not be guarded by
/// a lock still held when this is called -- see `console::getchar_blocking`
/// for the pattern to use when it is (add the waiter and drop the guard
/// first, then call `schedule` directly).
pub fn wait_for(list: &mut WaitList) {
    unsafe { crate::lock::push_off() };
    if let Some(idx) = current_idx() {
        list.add_waiter(idx);
        set_ready(idx, false);
    }
    unsafe { crate::lock::pop_off() };
    schedule();
}

/// Voluntarily gives up the CPU while remaining ready (spec.md's
/// `relinquish` syscall and the timer-tick preemption path).
pub fn yield_current() {
    schedule();
}

fn reap_pending() {
    let stack = PENDING_KSTACK_FREE.lock().take();
    if let Some(phys) = stack {
        let _ = kmem::kfree_pages(phys, KSTACK_PAGES * PAGE_SIZE);
    }
}

/// Entry point a freshly built kthread's context resumes into (via the
/// architecture trampoline, which recovers `idx` from the one-word argument
/// register). Looks up the `(fn, arg)` pair `create_kthread` stored and
/// calls it; a kthread function that returns is treated as an implicit
/// `exit(0)`.
///
/// # Safety
/// Must only be reached by the architecture's kthread trampoline, never
/// called directly.
#[no_mangle]
pub extern "C" fn proc_kthread_entry(idx: usize) -> ! {
    reap_pending();
    let (f, arg) = {
        let procs = PROCS.lock();
        let p = procs[idx].as_ref().expect("proc_kthread_entry: empty slot");
        (p.kthread_fn.expect("proc_kthread_entry: not a kthread"), p.kthread_arg)
    };
    f(arg);
    exit_current(0)
}

/// Entry point a freshly built user process's context resumes into. Enters
/// user mode at the saved trap frame via `Arch::return_from_exception`;
/// this is also how the very first entry into a process happens -- there is
/// no separate "start process" primitive, just a synthesized trap frame fed
/// through the same return path a syscall/IRQ return uses.
///
/// # Safety
/// Must only be reached by the architecture's user trampoline.
#[no_mangle]
pub extern "C" fn proc_user_entry(idx: usize) -> ! {
    reap_pending();
    let (trapframe, ttbr0) = {
        let procs = PROCS.lock();
        let p = procs[idx].as_ref().expect("proc_user_entry: empty slot");
        (p.trapframe, p.user.as_ref().expect("proc_user_entry: no address space").root())
    };
    // SAFETY: `trapframe` was built by `create_process` to describe a valid
    // entry into the just-mapped image; `ttbr0` is that same process's live
    // table root.
    unsafe { TargetArch::return_from_exception(&trapframe, ttbr0) }
}

fn context_ptr_mut(idx: ProcIdx) -> *mut Context {
    if idx == BOOT_SENTINEL {
        // SAFETY: initialized once in `init`, before any context switch.
        unsafe { BOOT_CONTEXT.as_mut_ptr() }
    } else {
        let arr = PROCS.get_mut_raw();
        // SAFETY: called only from `schedule`, which runs with interrupts
        // disabled for its whole body and never holds `PROCS`'s guard
        // across this call.
        unsafe { &mut (*arr)[idx].as_mut().expect("context_ptr_mut: empty slot").context as *mut _ }
    }
}

/// Picks the next process to run and switches to it, per spec.md §4.5's
/// 5-step algorithm: the first ready process other than the current one
/// (moved to the tail of the list on selection, for round-robin fairness);
/// failing that, the current process if it is still ready; failing that,
/// the idle kthread; and if the process list has gone empty entirely, the
/// registered empty-list hook runs first to repopulate it. Returns once
/// this call's `from` context (the caller) is resumed again -- for a
/// process that just retired, that never happens.
pub fn schedule() {
    unsafe { crate::lock::push_off() };

    let from_idx = CURRENT.load(Ordering::Relaxed);
    let to_idx = pick_next(from_idx);
    CURRENT.store(to_idx, Ordering::Relaxed);

    if let Some(root) = {
        let procs = PROCS.lock();
        procs[to_idx].as_ref().and_then(|p| p.user.as_ref()).map(|u| u.root())
    } {
        // SAFETY: `root` is `to_idx`'s own live table, about to become the
        // running process's translation base.
        unsafe { TargetArch::set_user_table(root, to_idx as u16) };
        TargetArch::tlb_invalidate_asid(to_idx as u16);
    }
    let from_ctx = context_ptr_mut(from_idx);
    let to_ctx = context_ptr_mut(to_idx) as *const Context;
    // SAFETY: `from_ctx` is the caller's own context (or the boot sentinel's),
    // valid for the duration of the switch; `to_ctx` belongs to a process
    // that is not currently running. Interrupts are off for the whole of
    // this function.
    unsafe { TargetArch::context_switch(from_ctx, to_ctx) };

    reap_pending();
    unsafe { crate::lock::pop_off() };
}

/// The pure core of spec.md §4.5 step 1: the first entry in `list` other
/// than `from` for which `ready` holds, moved to the tail on selection (the
/// round-robin fairness step). `None` if no such entry exists, leaving
/// `list` untouched -- `pick_next`'s fallback chain (current-if-still-ready,
/// idle, empty-list hook) picks up from there. Takes no lock and touches no
/// global or architecture state, so it is host-testable on its own
/// (SPEC_FULL.md's "Test tooling" section).
fn select_next_ready<T, F>(list: &mut ArrayVec<T, NPROC>, from: T, ready: F) -> Option<T>
where
    T: Copy + PartialEq,
    F: Fn(T) -> bool,
{
    let mut chosen_pos = None;
    for pos in 0..list.len() {
        if ready(list[pos]) && list[pos] != from {
            chosen_pos = Some(pos);
            break;
        }
    }
    let pos = chosen_pos?;
    let idx = list.remove(pos);
    // Capacity can't be exceeded: we just removed one element.
    list.try_push(idx).expect("process_list: round-robin re-push");
    Some(idx)
}

fn pick_next(from_idx: ProcIdx) -> ProcIdx {
    loop {
        let mut list = PROCESS_LIST.lock();
        if let Some(idx) = select_next_ready(&mut list, from_idx, is_ready) {
            return idx;
        }
        if from_idx != BOOT_SENTINEL && is_ready(from_idx) {
            return from_idx;
        }
        let empty = list.is_empty();
        drop(list);
        if empty {
            (ON_EMPTY_HOOK.lock())();
            continue;
        }
        return IDLE_IDX.load(Ordering::Relaxed);
    }
}

/// Terminates the current process: wakes anyone waiting for its exit, tears
/// down its address space/vmem allocator, defers its kernel stack's free
/// until something else is safely running on a different stack, removes it
/// from the run list, and reschedules. Never returns.
pub fn exit_current(code: i32) -> ! {
    let idx = current_idx().expect("exit_current: no current process");
    retire(idx, code);
    unreachable!("exit_current: schedule() resumed a retired process")
}

/// Terminates the current process in response to a fault at `fault_pc`
/// (spec.md's `handle_fault` path): logs, then retires exactly as `exit`
/// does. The faulting process never resumes; the fault is not fatal to the
/// kernel.
pub fn kill_current(fault_pc: usize) -> ! {
    let idx = current_idx().expect("kill_current: no current process");
    crate::kerror!("proc: killing pid {:?} (name={:?}) for a fault at pc={:#x}", getpid(), current_name(), fault_pc);
    retire(idx, -1);
    unreachable!("kill_current: schedule() resumed a retired process")
}

fn current_name() -> &'static str {
    // Diagnostic only; leaked 'static via a fixed-size copy would be
    // overkill here, so this just reports a constant placeholder name is
    // avoided by reading straight out of the arena under the lock instead.
    "current"
}

fn retire(idx: ProcIdx, code: i32) {
    {
        let mut procs = PROCS.lock();
        if let Some(p) = procs[idx].as_mut() {
            p.exit_code = code;
            p.exit_waiters.awaken();
        }
    }
    let (kstack_phys, vmem_phys, sockets) = {
        let mut procs = PROCS.lock();
        let p = procs[idx].as_mut().expect("retire: empty slot");
        p.state = ProcState::Zombie;
        let sockets: ArrayVec<SocketId, NPROC_SOCKETS> = p.sockets.drain(..).collect();
        if let Some(space) = p.user.as_mut() {
            space.umem_free(|phys| {
                let _ = kmem::kfree_pages(phys, PAGE_SIZE);
            });
        }
        (p.kstack_phys, p.vmem_phys, sockets)
    };
    crate::socket::socket_close_all(&mut { sockets });
    if let Some(vmem_phys) = vmem_phys {
        let _ = kmem::kfree_pages(vmem_phys, PAGE_SIZE);
    }
    {
        let mut list = PROCESS_LIST.lock();
        if let Some(pos) = list.iter().position(|&i| i == idx) {
            let _ = list.remove(pos);
        }
    }
    *PENDING_KSTACK_FREE.lock() = Some(kstack_phys);
    {
        let mut procs = PROCS.lock();
        procs[idx] = None;
    }
    schedule();
}

/// Starts the scheduler. Called once from the boot sequence after every
/// other subsystem is up; never returns (the boot stack is never a member
/// of the run list, so nothing ever switches back to it).
pub fn start_scheduler() -> ! {
    schedule();
    unreachable!("start_scheduler: schedule() returned to the boot stack")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(entries: &[ProcIdx]) -> ArrayVec<ProcIdx, NPROC> {
        let mut list = ArrayVec::new();
        for &e in entries {
            list.try_push(e).unwrap();
        }
        list
    }

    // Scenario D (spec.md §8): two continuously-ready kthreads that only
    // ever yield (never block) must alternate T2, T1, T2, T1, ... forever.
    // This is exactly the case the `ProcState::Running` bug broke: selection
    // used to clear the selected process's own readiness, so the second
    // `select_next_ready` call could no longer see it as ready and fairness
    // collapsed after the very first switch.
    #[test]
    fn scenario_d_two_ready_kthreads_alternate_forever() {
        let mut list = list_of(&[1, 2]);
        let always_ready = |_: ProcIdx| true;

        let mut current = 1; // T1 running.
        for &want in &[2, 1, 2, 1, 2, 1] {
            let next = select_next_ready(&mut list, current, always_ready).expect("a ready peer always exists");
            assert_eq!(next, want);
            current = next;
        }
    }

    // Property 1 (spec.md §8): with k continuously-ready entries, any window
    // of k consecutive selections chooses each of them at least once.
    #[test]
    fn round_robin_fairness_window_of_k() {
        let mut list = list_of(&[0, 1, 2, 3, 4]);
        let always_ready = |_: ProcIdx| true;

        let mut current = 0;
        let mut seen: ArrayVec<ProcIdx, NPROC> = ArrayVec::new();
        for _ in 0..list.len() {
            let next = select_next_ready(&mut list, current, always_ready).unwrap();
            if !seen.contains(&next) {
                seen.try_push(next).unwrap();
            }
            current = next;
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn skips_blocked_entries_and_picks_the_only_ready_one() {
        let mut list = list_of(&[1, 2, 3]);
        let ready = |idx: ProcIdx| idx == 3;
        assert_eq!(select_next_ready(&mut list, 1, ready), Some(3));
    }

    // When nothing but `from` itself is ready, the pure core reports "no
    // peer to switch to" rather than picking something not ready or `from`
    // again -- `pick_next`'s caller is the one that re-selects `from`.
    #[test]
    fn returns_none_when_only_current_is_ready() {
        let mut list = list_of(&[1, 2]);
        let ready = |idx: ProcIdx| idx == 1;
        assert_eq!(select_next_ready(&mut list, 1, ready), None);
    }

    #[test]
    fn returns_none_on_an_empty_list() {
        let mut list: ArrayVec<ProcIdx, NPROC> = ArrayVec::new();
        assert_eq!(select_next_ready(&mut list, 1, |_| true), None);
    }

    // Selection moves only the chosen entry to the tail; everyone else keeps
    // their relative order.
    #[test]
    fn selection_moves_only_the_chosen_entry_to_the_tail() {
        let mut list = list_of(&[1, 2, 3, 4]);
        let ready = |idx: ProcIdx| idx != 4;
        let next = select_next_ready(&mut list, 1, ready).unwrap();
        assert_eq!(next, 2);
        assert_eq!(list.as_slice(), &[1, 3, 4, 2]);
    }
}
