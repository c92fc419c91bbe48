//! Debug-trap hook
//!
//! #BP and #DB frames are offered to a registered debug handler before the
//! stock logging path sees them. A kernel debugger (a gdb remote stub on
//! the serial line, an in-kernel breakpoint manager) plugs in here: it gets
//! the full `TrapFrame`, may edit it, and answers with what should happen
//! to the stopped thread. The wire protocol and breakpoint bookkeeping live
//! with that service, not in the core; this hook is the whole interface it
//! consumes.

use spin::RwLock;

use super::frame::TrapFrame;

/// RFLAGS trap flag. Set in a resumed frame, it raises #DB after exactly
/// one instruction.
pub const TRAP_FLAG: u64 = 1 << 8;

/// What the debug handler wants done with the stopped thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Resume normally; any pending single-step is cancelled
    Continue,
    /// Execute one instruction, then trap again
    SingleStep,
    /// Retire the stopped thread
    KillThread,
}

/// Handler a debugger registers. Runs in trap context with interrupts
/// disabled; it may mutate the frame (rip adjustment over an `int3`,
/// register edits) before choosing an outcome.
pub type DebugHandler = fn(&mut TrapFrame) -> Outcome;

static HANDLER: RwLock<Option<DebugHandler>> = RwLock::new(None);

/// Install (or replace) the debug-trap handler.
pub fn set_handler(handler: DebugHandler) {
    *HANDLER.write() = Some(handler);
}

/// Remove the handler; #BP/#DB fall back to the logging path.
pub fn clear_handler() {
    *HANDLER.write() = None;
}

/// Offer a #BP/#DB frame to the registered handler, if any.
pub fn dispatch(tf: &mut TrapFrame) -> Option<Outcome> {
    let handler = *HANDLER.read();
    handler.map(|h| h(tf))
}

/// Fold a flow-control outcome into the frame. `KillThread` is not handled
/// here: retiring the thread never returns, so the trap handler owns it.
pub fn apply_flow(outcome: Outcome, tf: &mut TrapFrame) {
    match outcome {
        Outcome::Continue => tf.rflags &= !TRAP_FLAG,
        Outcome::SingleStep => tf.rflags |= TRAP_FLAG,
        Outcome::KillThread => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_frame() -> TrapFrame {
        TrapFrame {
            r15: 0, r14: 0, r13: 0, r12: 0, r11: 0, r10: 0, r9: 0, r8: 0,
            rsi: 0, rdi: 0, rbp: 0, rdx: 0, rcx: 0, rbx: 0, rax: 0,
            vector: 3, error: 0, rip: 0x1000, cs: 0x08, rflags: 0x202,
            rsp: 0, ss: 0x10,
        }
    }

    fn step_back_over_int3(tf: &mut TrapFrame) -> Outcome {
        tf.rip -= 1;
        Outcome::Continue
    }

    // one test owns the handler slot; the runner is multi-threaded and the
    // slot is global
    #[test]
    fn handler_lifecycle() {
        clear_handler();
        let mut tf = blank_frame();
        assert_eq!(dispatch(&mut tf), None);
        assert_eq!(tf.rip, 0x1000);

        set_handler(step_back_over_int3);
        assert_eq!(dispatch(&mut tf), Some(Outcome::Continue));
        assert_eq!(tf.rip, 0x0FFF);

        clear_handler();
        assert_eq!(dispatch(&mut tf), None);
        assert_eq!(tf.rip, 0x0FFF);
    }

    #[test]
    fn single_step_sets_the_trap_flag() {
        let mut tf = blank_frame();
        apply_flow(Outcome::SingleStep, &mut tf);
        assert_ne!(tf.rflags & TRAP_FLAG, 0);
    }

    #[test]
    fn continue_cancels_a_pending_single_step() {
        let mut tf = blank_frame();
        tf.rflags |= TRAP_FLAG;
        apply_flow(Outcome::Continue, &mut tf);
        assert_eq!(tf.rflags & TRAP_FLAG, 0);
        // the rest of rflags is untouched
        assert_eq!(tf.rflags, 0x202);
    }

    #[test]
    fn kill_leaves_the_frame_alone() {
        let mut tf = blank_frame();
        apply_flow(Outcome::KillThread, &mut tf);
        assert_eq!(tf.rflags, 0x202);
    }
}
