//! Kernel threads
//!
//! The context-switch primitive, the fresh-thread trampoline, and the
//! round-robin surface the rest of the kernel schedules through. Two
//! suspension mechanisms coexist and interoperate:
//!
//! - `switch_context` (voluntary): the caller's callee-saved state goes
//!   into its `CpuContext`; it resumes at the instruction after the call.
//! - switch-on-return (preemptive): the timer handler retargets the live
//!   `TrapFrame`'s rsp slot at a suspended thread's stored frame, and the
//!   gate epilogue restores that thread instead. The preempted thread keeps
//!   its frame token *and* gets a `CpuContext` synthesized to land in the
//!   shared epilogue, so either mechanism can resume it later.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::string::String;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use lazy_static::lazy_static;
use spin::{Mutex, RwLock};

use crate::interrupts::{trap_frame_resume, TrapFrame};

/// Thread ID type
pub type Tid = u64;

/// Invalid thread ID
pub const TID_INVALID: Tid = 0;

/// Thread ID counter (0 is reserved for the BSP idle thread)
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Kernel stack size per thread
const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Ticks a thread runs before the timer path preempts it
const TICKS_PER_SLICE: u64 = 5;

/// Scheduler capacity for per-CPU slots
const MAX_CPUS: usize = 64;

// ============================================================================
// CpuContext and the switch primitive
// ============================================================================

/// Saved state of a suspended kernel thread, 72 bytes.
///
/// Callee-saved registers only: anything else a suspending thread cares
/// about is already in caller-saved spill slots by the time `switch` runs,
/// per the procedure-call ABI. Offsets are shared with the assembly below.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CpuContext {
    pub r15: u64,    // 0x00
    pub r14: u64,    // 0x08
    pub r13: u64,    // 0x10
    pub r12: u64,    // 0x18
    pub rbp: u64,    // 0x20
    pub rbx: u64,    // 0x28
    /// Thread stack pointer
    pub rsp: u64,    // 0x30
    /// Resume instruction
    pub rip: u64,    // 0x38
    /// Interrupt-enable state and condition codes at suspension
    pub rflags: u64, // 0x40
}

impl CpuContext {
    pub const fn new() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbp: 0,
            rbx: 0,
            rsp: 0,
            rip: 0,
            rflags: 0x0002, // reserved bit only; IF stays clear until the thread says otherwise
        }
    }

    /// Build a fresh context that will enter `entry(arg)` on the given
    /// stack the first time it is switched to.
    ///
    /// The trampoline convention: the two qwords at the initial stack top
    /// are the entry argument, then the entry pointer. The trampoline pops
    /// both, enables interrupts, squares the stack to 16 bytes and calls
    /// the entry; if the entry ever returns it falls into `exit_current`.
    pub fn fresh(stack_ptr: *mut u8, stack_len: usize, entry: extern "C" fn(u64), arg: u64) -> Self {
        let top = ((stack_ptr as usize + stack_len) & !0xF) as u64;
        let init_rsp = (top - 16) as *mut u64;
        unsafe {
            core::ptr::write(init_rsp.add(0), arg);
            core::ptr::write(init_rsp.add(1), entry as u64);
        }

        Self {
            rip: kthread_trampoline as u64,
            rsp: init_rsp as u64,
            ..Self::new()
        }
    }

    /// Synthesize a context that resumes a preemption-suspended thread by
    /// running the gate epilogue over its still-intact `TrapFrame`.
    fn resuming_frame(frame_base: u64) -> Self {
        Self {
            rip: trap_frame_resume as u64,
            rsp: frame_base,
            ..Self::new()
        }
    }
}

/// Transfer this CPU from the running thread to a suspended one.
///
/// # Safety
///
/// - Interrupts must be disabled around the call.
/// - `prev` must describe the running thread; `next` must be suspended with
///   a valid stack. Violations fault at the transfer and are kernel bugs.
pub unsafe fn switch(prev: *mut CpuContext, next: *const CpuContext) {
    switch_context(prev, next);
}

/// Low-level switch. Saves the outgoing thread so that resuming it returns
/// from this call. Restore order is callee-saved registers, then rsp, then
/// rflags, then the jump: rsi carries `next` and is never restored, so it
/// stays a valid base until the last instruction.
#[unsafe(naked)]
extern "C" fn switch_context(prev: *mut CpuContext, next: *const CpuContext) {
    core::arch::naked_asm!(
        // RDI = prev, RSI = next
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], rbp",
        "mov [rdi + 0x28], rbx",
        "mov [rdi + 0x30], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x40], rax",
        // --- switch point ---
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov rbp, [rsi + 0x20]",
        "mov rbx, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "push qword ptr [rsi + 0x40]",
        "popfq",
        "jmp [rsi + 0x38]",
        // resume point for the saved context
        "2:",
        "ret",
    );
}

/// First-entry prologue for fresh threads.
/// Stack on entry: [rsp] = entry argument, [rsp+8] = entry pointer.
#[unsafe(naked)]
extern "C" fn kthread_trampoline() {
    core::arch::naked_asm!(
        "pop rdi",      // argument
        "pop rax",      // entry point
        "sti",          // fresh threads start preemptible
        "and rsp, -16", // procedure-call boundary before the call
        "call rax",
        // entry returned; retire the thread
        "jmp {exit}",
        exit = sym exit_trampoline,
    );
}

/// `jmp` target for threads whose entry function returned.
extern "C" fn exit_trampoline() -> ! {
    exit_current()
}

// ============================================================================
// Thread table
// ============================================================================

/// Thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Dead,
}

/// Thread Control Block
pub struct Thread {
    pub tid: Tid,
    /// Thread name (for debugging)
    pub name: String,
    pub state: ThreadState,
    /// Saved context while suspended
    pub ctx: CpuContext,
    /// Hardware-frame token from the thread's last preemption, 0 if none.
    /// Valid only while the thread stays suspended.
    frame_token: u64,
    /// Backing kernel stack; `None` for bootstrap/idle threads that run on
    /// a stack the core did not allocate. Held only so the allocation lives
    /// as long as the thread.
    #[allow(dead_code)]
    kernel_stack: Option<Box<[u8; KERNEL_STACK_SIZE]>>,
    /// CPU ticks consumed
    pub cpu_time: u64,
}

lazy_static! {
    /// Global thread table
    static ref THREADS: RwLock<BTreeMap<Tid, Thread>> = RwLock::new(BTreeMap::new());

    /// Ready queue (idle threads are never enqueued)
    static ref READY_QUEUE: Mutex<VecDeque<Tid>> = Mutex::new(VecDeque::new());
}

/// Per-CPU current thread
static CURRENT_TIDS: [AtomicU64; MAX_CPUS] = {
    const INIT: AtomicU64 = AtomicU64::new(TID_INVALID);
    [INIT; MAX_CPUS]
};

/// Set once the embedder wants timer preemption to act
static SCHED_STARTED: AtomicBool = AtomicBool::new(false);

/// Idle thread TID base for APs (the BSP idle thread is TID 0)
const IDLE_TID_AP_BASE: Tid = 0x8000_0000_0000_0000;

fn idle_tid_for(cpu_id: usize) -> Tid {
    if cpu_id == 0 { 0 } else { IDLE_TID_AP_BASE + cpu_id as u64 }
}

fn is_idle_tid(tid: Tid) -> bool {
    tid == 0 || tid >= IDLE_TID_AP_BASE
}

#[inline]
fn sched_cpu_id() -> usize {
    (crate::smp::current_cpu_id() as usize).min(MAX_CPUS - 1)
}

/// Get the current thread ID on this CPU
pub fn current_tid() -> Tid {
    CURRENT_TIDS[sched_cpu_id()].load(Ordering::Relaxed)
}

fn set_current_tid(tid: Tid) {
    CURRENT_TIDS[sched_cpu_id()].store(tid, Ordering::SeqCst);
}

fn make_idle_thread(tid: Tid, name: &str) -> Thread {
    Thread {
        tid,
        name: String::from(name),
        state: ThreadState::Running,
        ctx: CpuContext::new(),
        frame_token: 0,
        kernel_stack: None,
        cpu_time: 0,
    }
}

/// Initialize the thread subsystem on the BSP. The currently executing
/// control flow becomes the BSP idle thread (TID 0); its context is filled
/// in the first time it switches away.
pub fn init() {
    THREADS.write().insert(0, make_idle_thread(0, "idle"));
    CURRENT_TIDS[0].store(0, Ordering::SeqCst);
    crate::log!("thread subsystem ready");
}

/// Register an idle thread for an Application Processor so it has a valid
/// current thread before it enters its idle loop.
pub fn init_ap(cpu_id: u32) {
    let idle = idle_tid_for(cpu_id as usize);
    THREADS.write().insert(idle, make_idle_thread(idle, "idle-ap"));
    CURRENT_TIDS[cpu_id as usize].store(idle, Ordering::SeqCst);
}

/// Let the timer path start preempting.
pub fn start_scheduling() {
    SCHED_STARTED.store(true, Ordering::SeqCst);
}

/// Create a kernel thread that starts at `entry(arg)` on a fresh stack.
pub fn spawn(name: &str, entry: extern "C" fn(u64), arg: u64) -> Tid {
    let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);

    let mut kernel_stack = Box::new([0u8; KERNEL_STACK_SIZE]);
    let ctx = CpuContext::fresh(kernel_stack.as_mut_ptr(), KERNEL_STACK_SIZE, entry, arg);

    let thread = Thread {
        tid,
        name: String::from(name),
        state: ThreadState::Ready,
        ctx,
        frame_token: 0,
        kernel_stack: Some(kernel_stack),
        cpu_time: 0,
    };

    crate::arch::without_interrupts(|| {
        THREADS.write().insert(tid, thread);
        READY_QUEUE.lock().push_back(tid);
    });

    // Kick halted cores so the new thread does not wait out a full tick
    crate::apic::send_ipi_all_others(crate::interrupts::RESCHED_VECTOR);

    crate::log_debug!("spawned kernel thread {} '{}'", tid, name);
    tid
}

/// Wake a blocked thread.
pub fn wake(tid: Tid) {
    crate::arch::without_interrupts(|| {
        let mut threads = THREADS.write();
        if let Some(thread) = threads.get_mut(&tid) {
            if thread.state == ThreadState::Blocked {
                thread.state = ThreadState::Ready;
                drop(threads);
                READY_QUEUE.lock().push_back(tid);
            }
        }
    });
}

// ============================================================================
// Scheduling core
// ============================================================================

/// Pop the next runnable, non-idle thread off the queue.
fn pick_next(queue: &mut VecDeque<Tid>, threads: &BTreeMap<Tid, Thread>) -> Option<Tid> {
    while let Some(tid) = queue.pop_front() {
        if let Some(thread) = threads.get(&tid) {
            if thread.state == ThreadState::Ready {
                return Some(tid);
            }
        }
        // not runnable anymore; drop it from the queue
    }
    None
}

/// A resumed thread's stale frame token must die with the resumption: the
/// frame it names is released the moment the thread runs again.
fn clear_own_token() {
    let tid = current_tid();
    if let Some(thread) = THREADS.write().get_mut(&tid) {
        thread.frame_token = 0;
    }
}

/// Voluntarily give up the CPU. Returns when the scheduler picks this
/// thread again.
pub fn yield_now() {
    crate::arch::without_interrupts(|| {
        let cur = current_tid();

        let (prev_ptr, next_ptr) = {
            let mut threads = THREADS.write();
            let mut queue = READY_QUEUE.lock();

            let Some(next) = pick_next(&mut queue, &threads) else {
                return;
            };

            let prev_ptr = match threads.get_mut(&cur) {
                Some(t) => {
                    if !is_idle_tid(cur) && t.state == ThreadState::Running {
                        t.state = ThreadState::Ready;
                        queue.push_back(cur);
                    }
                    core::ptr::addr_of_mut!(t.ctx)
                }
                None => {
                    queue.push_front(next);
                    return;
                }
            };
            let next_thread = threads.get_mut(&next).unwrap();
            next_thread.state = ThreadState::Running;
            next_thread.frame_token = 0;
            let next_ptr = core::ptr::addr_of!(next_thread.ctx);

            set_current_tid(next);
            (prev_ptr, next_ptr)
        };

        // BTreeMap nodes are stable while the table is untouched; the
        // pointers outlive the dropped guards.
        unsafe {
            switch(prev_ptr, next_ptr);
        }
        clear_own_token();
    });
}

/// Block the current thread and switch away. Something must `wake` it.
pub fn block_current() {
    crate::arch::without_interrupts(|| {
        let cur = current_tid();
        if let Some(t) = THREADS.write().get_mut(&cur) {
            t.state = ThreadState::Blocked;
        }
    });
    schedule_away();
}

/// Retire the current thread. Never returns.
pub fn exit_current() -> ! {
    let cur = current_tid();

    crate::arch::without_interrupts(|| {
        if let Some(t) = THREADS.write().get_mut(&cur) {
            t.state = ThreadState::Dead;
        }
    });
    crate::log_debug!("thread {} exited", cur);

    schedule_away();

    // A dead thread was switched back to, or exit ran with no scheduler.
    crate::arch::cpu::halt_loop();
}

/// Switch to whatever is runnable, falling back to this CPU's idle thread.
fn schedule_away() {
    crate::arch::without_interrupts(|| {
        let cur = current_tid();
        let idle = idle_tid_for(sched_cpu_id());

        let (prev_ptr, next_ptr) = {
            let mut threads = THREADS.write();
            let mut queue = READY_QUEUE.lock();

            let next = pick_next(&mut queue, &threads).unwrap_or(idle);
            if next == cur {
                return;
            }

            let prev_ptr = match threads.get_mut(&cur) {
                Some(t) => core::ptr::addr_of_mut!(t.ctx),
                None => {
                    if next != idle {
                        queue.push_front(next);
                    }
                    return;
                }
            };
            let next_thread = match threads.get_mut(&next) {
                Some(t) => t,
                None => return,
            };
            next_thread.state = ThreadState::Running;
            next_thread.frame_token = 0;
            let next_ptr = core::ptr::addr_of!(next_thread.ctx);

            set_current_tid(next);
            (prev_ptr, next_ptr)
        };

        unsafe {
            switch(prev_ptr, next_ptr);
        }
        clear_own_token();
    });
}

// ============================================================================
// Timer preemption (switch-on-return)
// ============================================================================

/// Timer-tick entry, called by the timer trap handler with the live frame.
///
/// Every `TICKS_PER_SLICE` ticks, pick the next ready thread and resume it.
/// If it was itself preemption-suspended its whole register file still sits
/// in the `TrapFrame` its gate built, and retargeting the live frame's rsp
/// slot is the entire switch; the epilogue does the rest. Otherwise it was
/// switch-suspended and an explicit `switch` from inside the handler covers
/// it; the interrupted thread then resumes through the rest of this
/// handler and out the gate as usual.
pub fn timer_tick(tf: &mut TrapFrame) {
    if !SCHED_STARTED.load(Ordering::Relaxed) {
        return;
    }

    let cur = current_tid();
    {
        let mut threads = THREADS.write();
        if let Some(t) = threads.get_mut(&cur) {
            t.cpu_time += 1;
            if !is_idle_tid(cur) && t.cpu_time % TICKS_PER_SLICE != 0 {
                return;
            }
        }
    }

    preempt(tf);
}

/// Preempt the interrupted thread in favor of the next ready one.
fn preempt(tf: &mut TrapFrame) {
    let cur = current_tid();

    enum Resume {
        Frame(u64),
        Switch(*mut CpuContext, *const CpuContext),
    }

    let action = {
        let mut threads = THREADS.write();
        let mut queue = READY_QUEUE.lock();

        let Some(next) = pick_next(&mut queue, &threads) else {
            return;
        };

        // Suspend the interrupted thread under both representations: the
        // frame token for switch-on-return, and a context that replays the
        // gate epilogue for explicit switch.
        let prev_ptr = match threads.get_mut(&cur) {
            Some(t) => {
                if t.state == ThreadState::Running {
                    t.state = ThreadState::Ready;
                    if !is_idle_tid(cur) {
                        queue.push_back(cur);
                    }
                }
                t.frame_token = tf.hw_frame_base();
                t.ctx = CpuContext::resuming_frame(tf as *const TrapFrame as u64);
                core::ptr::addr_of_mut!(t.ctx)
            }
            None => {
                queue.push_front(next);
                return;
            }
        };

        let next_thread = threads.get_mut(&next).unwrap();
        next_thread.state = ThreadState::Running;
        let token = core::mem::replace(&mut next_thread.frame_token, 0);

        set_current_tid(next);

        if token != 0 {
            Resume::Frame(token)
        } else {
            let next_ptr = core::ptr::addr_of!(next_thread.ctx);
            Resume::Switch(prev_ptr, next_ptr)
        }
    };

    match action {
        Resume::Frame(token) => {
            // The gate epilogue consumes this after we return.
            tf.resume_other(token);
        }
        Resume::Switch(prev, next) => {
            unsafe {
                switch(prev, next);
            }
            // Back from suspension: this thread owns the CPU again and its
            // old frame token is dead.
            clear_own_token();
        }
    }
}

/// Threads visible to diagnostics: (tid, state, cpu_time, name).
pub fn list_threads() -> alloc::vec::Vec<(Tid, ThreadState, u64, String)> {
    crate::arch::without_interrupts(|| {
        let threads = THREADS.read();
        let mut out = alloc::vec::Vec::new();
        for (tid, t) in threads.iter() {
            out.push((*tid, t.state, t.cpu_time, t.name.clone()));
        }
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn context_is_72_bytes_with_prescribed_offsets() {
        assert_eq!(size_of::<CpuContext>(), 72);
        assert_eq!(offset_of!(CpuContext, r15), 0x00);
        assert_eq!(offset_of!(CpuContext, r14), 0x08);
        assert_eq!(offset_of!(CpuContext, r13), 0x10);
        assert_eq!(offset_of!(CpuContext, r12), 0x18);
        assert_eq!(offset_of!(CpuContext, rbp), 0x20);
        assert_eq!(offset_of!(CpuContext, rbx), 0x28);
        assert_eq!(offset_of!(CpuContext, rsp), 0x30);
        assert_eq!(offset_of!(CpuContext, rip), 0x38);
        assert_eq!(offset_of!(CpuContext, rflags), 0x40);
    }

    extern "C" fn dummy_entry(_arg: u64) {}

    #[test]
    fn fresh_context_seeds_arg_then_entry_at_the_top() {
        let mut stack = alloc::vec![0u8; 4096];
        let ctx = CpuContext::fresh(stack.as_mut_ptr(), stack.len(), dummy_entry, 0x1234);

        let top = ((stack.as_ptr() as usize + stack.len()) & !0xF) as u64;
        assert_eq!(ctx.rsp, top - 16);
        assert_eq!(ctx.rip, kthread_trampoline as u64);

        unsafe {
            let slots = ctx.rsp as *const u64;
            assert_eq!(*slots.add(0), 0x1234);
            assert_eq!(*slots.add(1), dummy_entry as u64);
        }
    }

    #[test]
    fn fresh_context_stack_is_sixteen_aligned_for_the_trampoline() {
        let mut stack = alloc::vec![0u8; 4096 + 8];
        // deliberately misaligned base
        let ctx = CpuContext::fresh(unsafe { stack.as_mut_ptr().add(3) }, 4096, dummy_entry, 0);
        // two pops later the trampoline stack must sit on 16 bytes
        assert_eq!((ctx.rsp + 16) % 16, 0);
    }

    #[test]
    fn fresh_context_starts_with_interrupts_masked() {
        let mut stack = alloc::vec![0u8; 4096];
        let ctx = CpuContext::fresh(stack.as_mut_ptr(), stack.len(), dummy_entry, 0);
        assert_eq!(ctx.rflags & (1 << 9), 0);
    }

    #[test]
    fn synthesized_context_replays_the_gate_epilogue() {
        let ctx = CpuContext::resuming_frame(0xFFFF_8000_1234_0000);
        assert_eq!(ctx.rip, trap_frame_resume as u64);
        assert_eq!(ctx.rsp, 0xFFFF_8000_1234_0000);
        assert_eq!(ctx.rflags & (1 << 9), 0);
    }

    #[test]
    fn idle_tids_are_reserved_per_cpu() {
        assert_eq!(idle_tid_for(0), 0);
        assert!(is_idle_tid(idle_tid_for(0)));
        assert!(is_idle_tid(idle_tid_for(5)));
        assert_ne!(idle_tid_for(1), idle_tid_for(2));
        assert!(!is_idle_tid(1));
    }

    #[test]
    fn pick_next_skips_stale_queue_entries() {
        let mut threads = BTreeMap::new();
        threads.insert(7, make_idle_thread(7, "t7"));
        threads.get_mut(&7).unwrap().state = ThreadState::Ready;
        threads.insert(8, make_idle_thread(8, "t8"));
        threads.get_mut(&8).unwrap().state = ThreadState::Dead;

        let mut queue: VecDeque<Tid> = VecDeque::new();
        queue.push_back(99); // vanished thread
        queue.push_back(8);  // dead thread
        queue.push_back(7);  // runnable

        assert_eq!(pick_next(&mut queue, &threads), Some(7));
        assert!(queue.is_empty());
    }
}
