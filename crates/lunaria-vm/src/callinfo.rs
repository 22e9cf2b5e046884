use lunaria_core::heap::{GcIdx, LuaClosure};
use lunaria_core::value::Value;

/// Extra bookkeeping on a frame beyond the normal call protocol.
#[derive(Clone, Debug)]
pub enum CallStatus {
    Normal,
    /// This frame is the body of a pcall/xpcall that a yield unwound through.
    /// When the frame eventually returns or errors after being resumed, the
    /// protected-call results go to `result_base` instead of the usual return
    /// placement, prefixed with the success flag.
    ProtectedYield {
        result_base: usize,
        want: i32,
        handler: Option<Value>,
    },
    /// This frame is a handler pushed mid-instruction (metamethod or
    /// generic-for iterator). Its results finish the interrupted operation.
    Finish(FinishOp),
}

/// What to do with a handler frame's results when it returns. Recording
/// this on the frame lets the operation complete after a yield suspended
/// the thread inside the handler.
#[derive(Clone, Copy, Debug)]
pub enum FinishOp {
    /// Copy the results to an absolute stack slot: all of them when `want`
    /// is negative, otherwise exactly `want` padded with nils.
    Place { dst: usize, want: i32 },
    /// The result decides a conditional skip of the caller's next
    /// instruction, for comparison metamethods. `negate` flips the
    /// handler's answer (the swapped-operand `__lt` fallback for `<=`).
    CompareSkip { expect: bool, negate: bool },
    /// One step of a concatenation fold: the result becomes the right
    /// operand of the pair at `next - 1`. `lo` is the lowest operand slot
    /// and `dst` the destination register once the fold reaches it.
    ConcatStep { dst: usize, lo: usize, next: usize },
}

/// One activation record on a thread's call stack.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// First register of this frame's window.
    pub base: usize,
    /// Next instruction to execute.
    pub pc: usize,
    /// Results expected by the caller; -1 means "all of them".
    pub num_results: i32,
    /// Index into the VM's flattened prototype list.
    pub proto_idx: usize,
    /// The closure being executed, if any (the main chunk has one too; only
    /// synthetic frames lack it).
    pub closure_idx: Option<GcIdx<LuaClosure>>,
    /// Stack slot holding the function value itself, right below `base`.
    pub func_stack_idx: usize,
    /// For vararg functions, where the raw incoming arguments start.
    pub vararg_base: Option<usize>,
    /// Consecutive tail calls that reused this frame, for tracebacks.
    pub tail_calls: u32,
    pub status: CallStatus,
}

impl CallInfo {
    pub fn new(base: usize, proto_idx: usize, func_stack_idx: usize) -> CallInfo {
        CallInfo {
            base,
            pc: 0,
            num_results: -1,
            proto_idx,
            closure_idx: None,
            func_stack_idx,
            vararg_base: None,
            tail_calls: 0,
            status: CallStatus::Normal,
        }
    }
}
