//! The bytecode dispatch loop.
//!
//! `execute_from` drives the live thread until the frame at `entry_depth`
//! returns. Lua-function metamethods and generic-for iterators run as
//! handler frames on the same flat stack, tagged `CallStatus::Finish` with
//! the step that completes the interrupted instruction when they return.
//! Only hooks and natives that re-enter the VM (pairs handlers, tostring,
//! print) use a nested `call_function`.
//!
//! Yields ride the error path as `LuaError::Yield` so the suspended frames
//! survive: everything between the coroutine's bottom frame and the yield
//! point stays on the thread's call stack, and `resume` continues it with a
//! single flat loop. Because handler frames are flat too, a yield may cross
//! a metamethod or iterator invocation; the recorded `FinishOp` completes
//! the operation after resumption. A yield may also pass through
//! pcall/xpcall bodies, whose frames are tagged `ProtectedYield` so the
//! protected call's result placement survives the flattening. Nested
//! `call_function` boundaries stay unyieldable and report the classic
//! C-call boundary error.

use crate::arith::{self, ArithOp, ArithResult};
use crate::callinfo::{CallInfo, CallStatus, FinishOp};
use crate::coerce;
use crate::compare::{self, CompareResult};
use crate::error::LuaError;
use crate::metamethod;
use crate::vm::{
    self, CoroutineStatus, LuaThread, ResumePoint, Vm, MAIN_THREAD, MASK_CALL, MASK_COUNT,
    MASK_LINE, MASK_RETURN,
};
use lunaria_compiler::opcode::{self, OpCode};
use lunaria_compiler::proto::Constant;
use lunaria_core::heap::{GcIdx, NativeContext, NativeError, NativeFunction};
use lunaria_core::object::lua_type_name;
use lunaria_core::value::Value;

/// Per-lookup bound on `__index`/`__newindex` chains.
const MAX_INDEX_CHAIN: u32 = 100;

/// Run the live thread until the frame at `entry_depth` returns, recovering
/// from errors that land in a yielded-through protected call.
pub fn execute_from(vm: &mut Vm, entry_depth: usize) -> Result<Vec<Value>, LuaError> {
    loop {
        match run_loop(vm, entry_depth) {
            Err(e) if e.is_catchable() => {
                if !recover_protected(vm, entry_depth, &e)? {
                    return Err(e);
                }
            }
            other => return other,
        }
    }
}

/// After an error, find the innermost frame a yield tagged as a protected
/// call body, unwind to it, and deliver `false, err` at its recorded call
/// site. Returns false when no such frame exists at this depth.
fn recover_protected(
    vm: &mut Vm,
    entry_depth: usize,
    err: &LuaError,
) -> Result<bool, LuaError> {
    let found = vm
        .call_stack
        .iter()
        .enumerate()
        .skip(entry_depth)
        .rev()
        .find_map(|(i, ci)| match ci.status {
            CallStatus::ProtectedYield { result_base, want, handler } => {
                Some((i, result_base, want, handler))
            }
            CallStatus::Normal | CallStatus::Finish(_) => None,
        });
    let Some((idx, result_base, want, handler)) = found else {
        return Ok(false);
    };
    let mut err_val = err.to_value(&mut vm.strings);
    if let Some(h) = handler {
        match call_function(vm, h, &[err_val]) {
            Ok(r) => err_val = r.first().copied().unwrap_or_else(Value::nil),
            Err(he) if he.is_catchable() => err_val = he.to_value(&mut vm.strings),
            Err(he) => return Err(he),
        }
    }
    let level = vm.call_stack[idx].func_stack_idx;
    vm.close_upvalues(level);
    vm.call_stack.truncate(idx);
    place_results_with_flag(vm, result_base, want, false, &[err_val]);
    Ok(true)
}

fn run_loop(vm: &mut Vm, entry_depth: usize) -> Result<Vec<Value>, LuaError> {
    loop {
        let ci_idx = vm.call_stack.len() - 1;
        let base = vm.call_stack[ci_idx].base;
        let pc = vm.call_stack[ci_idx].pc;
        let proto_idx = vm.call_stack[ci_idx].proto_idx;

        if vm.hook_mask != 0 && !vm.in_hook {
            if vm.hook_mask & MASK_COUNT != 0 && vm.hook_count > 0 {
                vm.hook_counter = vm.hook_counter.saturating_sub(1);
                if vm.hook_counter == 0 {
                    vm.hook_counter = vm.hook_count;
                    fire_hook(vm, "count", None)?;
                }
            }
            if vm.hook_mask & MASK_LINE != 0 {
                let line = vm.protos[proto_idx].get_line(pc);
                if line != vm.hook_last_line {
                    vm.hook_last_line = line;
                    fire_hook(vm, "line", Some(line))?;
                }
            }
        }

        let inst = vm.protos[proto_idx].code[pc];
        vm.call_stack[ci_idx].pc = pc + 1;
        let a = inst.a() as usize;

        match inst.opcode() {
            OpCode::Move => {
                vm.stack[base + a] = vm.stack[base + inst.b() as usize];
            }
            OpCode::LoadK => {
                vm.stack[base + a] = k_value(vm, proto_idx, inst.bx() as usize);
            }
            OpCode::LoadKX => {
                let ax = vm.protos[proto_idx].code[pc + 1].ax_field() as usize;
                vm.call_stack[ci_idx].pc = pc + 2;
                vm.stack[base + a] = k_value(vm, proto_idx, ax);
            }
            OpCode::LoadBool => {
                vm.stack[base + a] = Value::from_bool(inst.b() != 0);
                if inst.c() != 0 {
                    vm.call_stack[ci_idx].pc = pc + 2;
                }
            }
            OpCode::LoadNil => {
                let b = inst.b() as usize;
                for i in 0..=b {
                    vm.stack[base + a + i] = Value::nil();
                }
            }
            OpCode::GetUpval => {
                let uv = frame_upval(vm, ci_idx, inst.b() as usize)?;
                vm.stack[base + a] = vm.get_upval_value(uv);
            }
            OpCode::SetUpval => {
                let uv = frame_upval(vm, ci_idx, inst.b() as usize)?;
                let val = vm.stack[base + a];
                vm.set_upval_value(uv, val);
            }
            OpCode::GetTabUp => {
                let uv = frame_upval(vm, ci_idx, inst.b() as usize)?;
                let obj = vm.get_upval_value(uv);
                let key = rk_value(vm, proto_idx, base, inst.c());
                table_index(vm, obj, key, base + a)?;
            }
            OpCode::SetTabUp => {
                let uv = frame_upval(vm, ci_idx, a)?;
                let obj = vm.get_upval_value(uv);
                let key = rk_value(vm, proto_idx, base, inst.b());
                let val = rk_value(vm, proto_idx, base, inst.c());
                table_newindex(vm, obj, key, val)?;
            }
            OpCode::GetTable => {
                let obj = vm.stack[base + inst.b() as usize];
                let key = rk_value(vm, proto_idx, base, inst.c());
                table_index(vm, obj, key, base + a)?;
            }
            OpCode::SetTable => {
                let obj = vm.stack[base + a];
                let key = rk_value(vm, proto_idx, base, inst.b());
                let val = rk_value(vm, proto_idx, base, inst.c());
                table_newindex(vm, obj, key, val)?;
            }
            OpCode::NewTable => {
                let t = vm.heap.alloc_table(inst.b() as usize, inst.c() as usize);
                vm.stack[base + a] = Value::from_table(t);
            }
            OpCode::Self_ => {
                let obj = vm.stack[base + inst.b() as usize];
                let key = rk_value(vm, proto_idx, base, inst.c());
                vm.stack[base + a + 1] = obj;
                table_index(vm, obj, key, base + a)?;
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                let op = match inst.opcode() {
                    OpCode::Add => ArithOp::Add,
                    OpCode::Sub => ArithOp::Sub,
                    OpCode::Mul => ArithOp::Mul,
                    OpCode::Div => ArithOp::Div,
                    OpCode::Mod => ArithOp::Mod,
                    _ => ArithOp::Pow,
                };
                let vb = rk_value(vm, proto_idx, base, inst.b());
                let vc = rk_value(vm, proto_idx, base, inst.c());
                match arith::arith_op(op, vb, vc, &vm.strings) {
                    ArithResult::Done(v) => vm.stack[base + a] = v,
                    ArithResult::NeedMetamethod => {
                        arith_metamethod(vm, op, vb, vc, base + a)?;
                    }
                }
            }
            OpCode::Unm => {
                let v = vm.stack[base + inst.b() as usize];
                match arith::arith_unm(v, &vm.strings) {
                    ArithResult::Done(r) => vm.stack[base + a] = r,
                    ArithResult::NeedMetamethod => {
                        match metamethod::get_metamethod(v, vm.mm_names.unm, &vm.heap) {
                            Some(handler) => {
                                call_handler_place(vm, handler, &[v, v], base + a)?;
                            }
                            None => {
                                return Err(LuaError::Runtime(format!(
                                    "attempt to perform arithmetic on a {} value",
                                    lua_type_name(v)
                                )))
                            }
                        }
                    }
                }
            }
            OpCode::Not => {
                let v = vm.stack[base + inst.b() as usize];
                vm.stack[base + a] = Value::from_bool(v.is_falsy());
            }
            OpCode::Len => {
                let v = vm.stack[base + inst.b() as usize];
                if let Some(sid) = v.as_string_id() {
                    vm.stack[base + a] =
                        Value::from_number(vm.strings.get_bytes(sid).len() as f64);
                } else if let Some(handler) =
                    metamethod::get_metamethod(v, vm.mm_names.len, &vm.heap)
                {
                    call_handler_place(vm, handler, &[v], base + a)?;
                } else if let Some(t) = v.as_table_idx() {
                    vm.stack[base + a] =
                        Value::from_number(vm.heap.get_table(t).length() as f64);
                } else {
                    return Err(LuaError::Runtime(format!(
                        "attempt to get length of a {} value",
                        lua_type_name(v)
                    )));
                }
            }
            OpCode::Concat => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                // Fold right to left so `__concat` associates the way
                // chained `..` does.
                let acc = vm.stack[base + c];
                concat_fold(vm, base + a, base + b, base + c - 1, acc)?;
            }
            OpCode::Jmp => {
                let ja = inst.a();
                let sbx = inst.sbx();
                if ja > 0 {
                    if vm.cancel.is_cancelled() {
                        return Err(LuaError::Cancelled);
                    }
                    vm.close_upvalues(base + ja as usize - 1);
                }
                if sbx < 0 && vm.cancel.is_cancelled() {
                    return Err(LuaError::Cancelled);
                }
                offset_pc(vm, ci_idx, sbx);
            }
            OpCode::Eq => {
                let vb = rk_value(vm, proto_idx, base, inst.b());
                let vc = rk_value(vm, proto_idx, base, inst.c());
                let (eq, needs_mm) = compare::lua_eq(vb, vc, &vm.strings);
                if !eq && needs_mm {
                    let handler = metamethod::get_metamethod(vb, vm.mm_names.eq, &vm.heap)
                        .or_else(|| metamethod::get_metamethod(vc, vm.mm_names.eq, &vm.heap));
                    if let Some(h) = handler {
                        compare_with_handler(vm, h, vb, vc, a != 0, false, ci_idx)?;
                        continue;
                    }
                }
                if eq != (a != 0) {
                    vm.call_stack[ci_idx].pc = pc + 2;
                }
            }
            OpCode::Lt => {
                let vb = rk_value(vm, proto_idx, base, inst.b());
                let vc = rk_value(vm, proto_idx, base, inst.c());
                let result = match compare::lua_lt(vb, vc, &vm.strings) {
                    CompareResult::Done(r) => r,
                    CompareResult::NeedMetamethod => {
                        let handler = metamethod::get_metamethod(vb, vm.mm_names.lt, &vm.heap)
                            .or_else(|| metamethod::get_metamethod(vc, vm.mm_names.lt, &vm.heap));
                        match handler {
                            Some(h) => {
                                compare_with_handler(vm, h, vb, vc, a != 0, false, ci_idx)?;
                                continue;
                            }
                            None => return Err(compare_type_error(vb, vc)),
                        }
                    }
                };
                if result != (a != 0) {
                    vm.call_stack[ci_idx].pc = pc + 2;
                }
            }
            OpCode::Le => {
                let vb = rk_value(vm, proto_idx, base, inst.b());
                let vc = rk_value(vm, proto_idx, base, inst.c());
                let result = match compare::lua_le(vb, vc, &vm.strings) {
                    CompareResult::Done(r) => r,
                    CompareResult::NeedMetamethod => {
                        let le = metamethod::get_metamethod(vb, vm.mm_names.le, &vm.heap)
                            .or_else(|| metamethod::get_metamethod(vc, vm.mm_names.le, &vm.heap));
                        if let Some(h) = le {
                            compare_with_handler(vm, h, vb, vc, a != 0, false, ci_idx)?;
                            continue;
                        }
                        // 5.2 compatibility: a <= b falls back to
                        // not (b < a).
                        let lt = metamethod::get_metamethod(vc, vm.mm_names.lt, &vm.heap)
                            .or_else(|| {
                                metamethod::get_metamethod(vb, vm.mm_names.lt, &vm.heap)
                            });
                        match lt {
                            Some(h) => {
                                compare_with_handler(vm, h, vc, vb, a != 0, true, ci_idx)?;
                                continue;
                            }
                            None => return Err(compare_type_error(vb, vc)),
                        }
                    }
                };
                if result != (a != 0) {
                    vm.call_stack[ci_idx].pc = pc + 2;
                }
            }
            OpCode::Test => {
                let v = vm.stack[base + a];
                if v.is_truthy() != (inst.c() != 0) {
                    vm.call_stack[ci_idx].pc = pc + 2;
                }
            }
            OpCode::TestSet => {
                let v = vm.stack[base + inst.b() as usize];
                if v.is_truthy() == (inst.c() != 0) {
                    vm.stack[base + a] = v;
                } else {
                    vm.call_stack[ci_idx].pc = pc + 2;
                }
            }
            OpCode::Call => {
                if vm.cancel.is_cancelled() {
                    return Err(LuaError::Cancelled);
                }
                let b = inst.b() as usize;
                let func_idx = base + a;
                let num_args = if b == 0 {
                    vm.stack_top - func_idx - 1
                } else {
                    b - 1
                };
                let num_results = inst.c() as i32 - 1;
                let num_args = resolve_call_target(vm, func_idx, num_args)?;
                let func = vm.stack[func_idx];

                if let Some(closure_idx) = func.as_closure_idx() {
                    push_lua_frame(vm, closure_idx, func_idx, num_args, num_results)?;
                    if vm.hook_mask & MASK_CALL != 0 && !vm.in_hook {
                        fire_hook(vm, "call", None)?;
                    }
                } else {
                    let native_idx = func.as_native_idx().expect("resolved call target");
                    let args: Vec<Value> =
                        (0..num_args).map(|i| vm.stack[func_idx + 1 + i]).collect();
                    call_native_at(vm, native_idx, &args, func_idx, num_results)?;
                }
            }
            OpCode::TailCall => {
                if vm.cancel.is_cancelled() {
                    return Err(LuaError::Cancelled);
                }
                let b = inst.b() as usize;
                let func_idx = base + a;
                let num_args = if b == 0 {
                    vm.stack_top - func_idx - 1
                } else {
                    b - 1
                };
                let num_args = resolve_call_target(vm, func_idx, num_args)?;
                let func = vm.stack[func_idx];

                if let Some(closure_idx) = func.as_closure_idx() {
                    tail_replace_frame(vm, ci_idx, closure_idx, func_idx, num_args)?;
                    if vm.hook_mask & MASK_CALL != 0 && !vm.in_hook {
                        fire_hook(vm, "tail call", None)?;
                    }
                } else {
                    // Results land where the paired Return expects them.
                    let native_idx = func.as_native_idx().expect("resolved call target");
                    let args: Vec<Value> =
                        (0..num_args).map(|i| vm.stack[func_idx + 1 + i]).collect();
                    call_native_at(vm, native_idx, &args, func_idx, -1)?;
                }
            }
            OpCode::Return => {
                let b = inst.b() as usize;
                let results: Vec<Value> = if b == 0 {
                    vm.stack[base + a..vm.stack_top].to_vec()
                } else {
                    vm.stack[base + a..base + a + b - 1].to_vec()
                };
                vm.close_upvalues(base);
                if vm.call_stack.len() == entry_depth {
                    if vm.hook_mask & MASK_RETURN != 0 && !vm.in_hook {
                        fire_hook(vm, "return", None)?;
                    }
                    if vm.cancel.is_cancelled() {
                        return Err(LuaError::Cancelled);
                    }
                    if let Some(ci) = vm.call_stack.pop() {
                        vm.stack_top = ci.func_stack_idx;
                    }
                    return Ok(results);
                }
                return_from_call(vm, &results)?;
            }
            OpCode::ForLoop => {
                let (Some(idx), Some(limit), Some(step)) = (
                    vm.stack[base + a].as_number(),
                    vm.stack[base + a + 1].as_number(),
                    vm.stack[base + a + 2].as_number(),
                ) else {
                    return Err(LuaError::Runtime("'for' loop state corrupted".to_string()));
                };
                let next = idx + step;
                let keep_going = if step > 0.0 { next <= limit } else { limit <= next };
                if keep_going {
                    if vm.cancel.is_cancelled() {
                        return Err(LuaError::Cancelled);
                    }
                    offset_pc(vm, ci_idx, inst.sbx());
                    vm.stack[base + a] = Value::from_number(next);
                    vm.stack[base + a + 3] = Value::from_number(next);
                }
            }
            OpCode::ForPrep => {
                let init = coerce::to_number(vm.stack[base + a], &vm.strings).ok_or_else(|| {
                    LuaError::Runtime("'for' initial value must be a number".to_string())
                })?;
                let limit =
                    coerce::to_number(vm.stack[base + a + 1], &vm.strings).ok_or_else(|| {
                        LuaError::Runtime("'for' limit must be a number".to_string())
                    })?;
                let step =
                    coerce::to_number(vm.stack[base + a + 2], &vm.strings).ok_or_else(|| {
                        LuaError::Runtime("'for' step must be a number".to_string())
                    })?;
                if step == 0.0 {
                    return Err(LuaError::Runtime("'for' step is zero".to_string()));
                }
                vm.stack[base + a] = Value::from_number(init - step);
                vm.stack[base + a + 1] = Value::from_number(limit);
                vm.stack[base + a + 2] = Value::from_number(step);
                offset_pc(vm, ci_idx, inst.sbx());
            }
            OpCode::TForCall => {
                let c = inst.c() as usize;
                let func = vm.stack[base + a];
                let iter_args = [vm.stack[base + a + 1], vm.stack[base + a + 2]];
                if let Some(closure_idx) = func.as_closure_idx() {
                    // A Lua iterator runs as its own frame so it can yield.
                    push_finish_frame(
                        vm,
                        closure_idx,
                        &iter_args,
                        FinishOp::Place { dst: base + a + 3, want: c as i32 },
                    )?;
                } else {
                    let results = call_function(vm, func, &iter_args)?;
                    for i in 0..c {
                        vm.stack[base + a + 3 + i] =
                            results.get(i).copied().unwrap_or_else(Value::nil);
                    }
                }
            }
            OpCode::TForLoop => {
                let ctrl = vm.stack[base + a + 1];
                if !ctrl.is_nil() {
                    if vm.cancel.is_cancelled() {
                        return Err(LuaError::Cancelled);
                    }
                    vm.stack[base + a] = ctrl;
                    offset_pc(vm, ci_idx, inst.sbx());
                }
            }
            OpCode::SetList => {
                let b = inst.b() as usize;
                let mut block = inst.c() as usize;
                if block == 0 {
                    block = vm.protos[proto_idx].code[pc + 1].ax_field() as usize;
                    vm.call_stack[ci_idx].pc = pc + 2;
                }
                let count = if b == 0 {
                    vm.stack_top - (base + a + 1)
                } else {
                    b
                };
                let offset = (block - 1) * 50;
                let Some(tidx) = vm.stack[base + a].as_table_idx() else {
                    return Err(LuaError::Runtime(
                        "list assignment target is not a table".to_string(),
                    ));
                };
                for i in 1..=count {
                    let v = vm.stack[base + a + i];
                    vm.heap
                        .get_table_mut(tidx)
                        .raw_set_int((offset + i) as i64, v);
                }
            }
            OpCode::Closure => {
                let bx = inst.bx() as usize;
                let child = vm.proto_children[proto_idx][bx];
                let descs = vm.protos[child].upvalues.clone();
                let mut ups = Vec::with_capacity(descs.len());
                for d in &descs {
                    if d.in_stack {
                        ups.push(vm.find_or_create_open_upval(base + d.index as usize));
                    } else {
                        let parent = frame_closure(vm, ci_idx)?;
                        ups.push(vm.heap.get_closure(parent).upvalues[d.index as usize]);
                    }
                }
                let cl = vm.heap.alloc_closure(child, ups);
                vm.stack[base + a] = Value::from_closure(cl);
            }
            OpCode::VarArg => {
                let b = inst.b() as usize;
                let (vararg_start, vararg_count) = match vm.call_stack[ci_idx].vararg_base {
                    Some(vb) => {
                        let start = vb + vm.protos[proto_idx].num_params as usize;
                        (start, base - start)
                    }
                    None => (0, 0),
                };
                if b == 0 {
                    vm.ensure_stack(base + a + vararg_count);
                    for i in 0..vararg_count {
                        vm.stack[base + a + i] = vm.stack[vararg_start + i];
                    }
                    vm.stack_top = base + a + vararg_count;
                } else {
                    for i in 0..b - 1 {
                        vm.stack[base + a + i] = if i < vararg_count {
                            vm.stack[vararg_start + i]
                        } else {
                            Value::nil()
                        };
                    }
                }
            }
            OpCode::ExtraArg => {
                // Payload for the preceding instruction; never executed on
                // its own.
            }
        }
    }
}

// --- Frame plumbing ---

fn offset_pc(vm: &mut Vm, ci_idx: usize, sbx: i32) {
    let ci = &mut vm.call_stack[ci_idx];
    ci.pc = (ci.pc as i64 + sbx as i64) as usize;
}

fn frame_closure(vm: &Vm, ci_idx: usize) -> Result<GcIdx<lunaria_core::heap::LuaClosure>, LuaError> {
    vm.call_stack[ci_idx]
        .closure_idx
        .ok_or_else(|| LuaError::Runtime("frame has no closure".to_string()))
}

fn frame_upval(vm: &Vm, ci_idx: usize, index: usize) -> Result<GcIdx<lunaria_core::heap::UpVal>, LuaError> {
    let closure = frame_closure(vm, ci_idx)?;
    vm.heap
        .get_closure(closure)
        .upvalues
        .get(index)
        .copied()
        .ok_or_else(|| LuaError::Runtime("upvalue index out of range".to_string()))
}

fn k_value(vm: &Vm, proto_idx: usize, index: usize) -> Value {
    constant_to_value(&vm.protos[proto_idx].constants[index])
}

fn constant_to_value(k: &Constant) -> Value {
    match k {
        Constant::Nil => Value::nil(),
        Constant::Boolean(b) => Value::from_bool(*b),
        Constant::Number(n) => Value::from_number(*n),
        Constant::String(sid) => Value::from_string_id(*sid),
    }
}

/// Decode an RK operand: constant when the bias bit is set, register
/// otherwise.
fn rk_value(vm: &Vm, proto_idx: usize, base: usize, field: u32) -> Value {
    if opcode::is_rk_const(field) {
        k_value(vm, proto_idx, opcode::rk_index(field) as usize)
    } else {
        vm.stack[base + field as usize]
    }
}

/// Push a frame for a closure whose function value sits at `func_idx` with
/// `num_args` arguments right above it.
fn push_lua_frame(
    vm: &mut Vm,
    closure_idx: GcIdx<lunaria_core::heap::LuaClosure>,
    func_idx: usize,
    num_args: usize,
    num_results: i32,
) -> Result<(), LuaError> {
    if vm.call_stack.len() >= vm.max_call_depth {
        return Err(LuaError::StackOverflow);
    }
    let proto_idx = vm.heap.get_closure(closure_idx).proto_idx;
    let (num_params, is_vararg, max_stack) = {
        let p = &vm.protos[proto_idx];
        (p.num_params as usize, p.is_vararg, p.max_stack_size as usize)
    };
    let new_base = func_idx + 1;
    let (frame_base, vararg_base) = if is_vararg {
        // Parameters are copied above the varargs so the frame window is
        // contiguous; the raw arguments stay behind for VarArg.
        let actual = new_base + num_args;
        vm.ensure_stack(actual + max_stack);
        for i in 0..num_params {
            vm.stack[actual + i] = if i < num_args {
                vm.stack[new_base + i]
            } else {
                Value::nil()
            };
        }
        (actual, Some(new_base))
    } else {
        vm.ensure_stack(new_base + max_stack);
        for i in num_args..num_params {
            vm.stack[new_base + i] = Value::nil();
        }
        (new_base, None)
    };
    vm.stack_top = frame_base + max_stack;
    let mut ci = CallInfo::new(frame_base, proto_idx, func_idx);
    ci.closure_idx = Some(closure_idx);
    ci.num_results = num_results;
    ci.vararg_base = vararg_base;
    vm.call_stack.push(ci);
    Ok(())
}

/// First stack slot safely above every live register, for staging a
/// handler call. `stack_top` alone is not enough: a fixed-result call
/// lowers it below the frame's register window.
fn scratch_base(vm: &Vm) -> usize {
    match vm.call_stack.last() {
        Some(ci) => {
            let frame_end = ci.base + vm.protos[ci.proto_idx].max_stack_size as usize;
            vm.stack_top.max(frame_end)
        }
        None => vm.stack_top,
    }
}

/// Push a frame for a handler invoked mid-instruction. The frame carries a
/// `FinishOp` so the interrupted operation completes when it returns, even
/// if the thread yields and is resumed in between.
fn push_finish_frame(
    vm: &mut Vm,
    closure_idx: GcIdx<lunaria_core::heap::LuaClosure>,
    args: &[Value],
    finish: FinishOp,
) -> Result<(), LuaError> {
    let func_idx = scratch_base(vm);
    vm.ensure_stack(func_idx + 1 + args.len());
    vm.stack[func_idx] = Value::from_closure(closure_idx);
    for (i, &v) in args.iter().enumerate() {
        vm.stack[func_idx + 1 + i] = v;
    }
    push_lua_frame(vm, closure_idx, func_idx, args.len(), -1)?;
    let top = vm.call_stack.len() - 1;
    vm.call_stack[top].status = CallStatus::Finish(finish);
    if vm.hook_mask & MASK_CALL != 0 && !vm.in_hook {
        fire_hook(vm, "call", None)?;
    }
    Ok(())
}

/// Invoke a handler whose single result lands in `dst`. A Lua handler runs
/// as a new frame on the flat call stack so a yield inside it suspends the
/// whole thread; anything else is called directly.
fn call_handler_place(
    vm: &mut Vm,
    handler: Value,
    args: &[Value],
    dst: usize,
) -> Result<(), LuaError> {
    if let Some(closure_idx) = handler.as_closure_idx() {
        push_finish_frame(vm, closure_idx, args, FinishOp::Place { dst, want: 1 })
    } else {
        let r = call_function(vm, handler, args)?;
        vm.stack[dst] = r.first().copied().unwrap_or_else(Value::nil);
        Ok(())
    }
}

/// Invoke a comparison handler. The truthiness of its result (flipped by
/// `negate`) is matched against `expect` to decide whether the caller's
/// conditional jump is skipped.
fn compare_with_handler(
    vm: &mut Vm,
    handler: Value,
    left: Value,
    right: Value,
    expect: bool,
    negate: bool,
    ci_idx: usize,
) -> Result<(), LuaError> {
    if let Some(closure_idx) = handler.as_closure_idx() {
        return push_finish_frame(
            vm,
            closure_idx,
            &[left, right],
            FinishOp::CompareSkip { expect, negate },
        );
    }
    let r = call_function(vm, handler, &[left, right])?;
    let mut res = r.first().copied().unwrap_or_else(Value::nil).is_truthy();
    if negate {
        res = !res;
    }
    if res != expect {
        vm.call_stack[ci_idx].pc += 1;
    }
    Ok(())
}

/// Resolve `__call` for a callee that is not a function: shift the
/// arguments up one slot and put the handler in the function slot, so the
/// handler runs as an ordinary call with the original callee as its first
/// argument. Returns the new argument count.
fn resolve_call_target(
    vm: &mut Vm,
    func_idx: usize,
    mut num_args: usize,
) -> Result<usize, LuaError> {
    let mut depth = 0;
    while !vm.stack[func_idx].is_function() {
        let func = vm.stack[func_idx];
        let handler = metamethod::get_metamethod(func, vm.mm_names.call, &vm.heap)
            .ok_or_else(|| {
                LuaError::Runtime(format!(
                    "attempt to call a {} value",
                    lua_type_name(func)
                ))
            })?;
        vm.ensure_stack(func_idx + 2 + num_args);
        for i in (0..=num_args).rev() {
            vm.stack[func_idx + 1 + i] = vm.stack[func_idx + i];
        }
        vm.stack[func_idx] = handler;
        num_args += 1;
        depth += 1;
        if depth >= MAX_INDEX_CHAIN {
            return Err(LuaError::Runtime(format!(
                "attempt to call a {} value",
                lua_type_name(handler)
            )));
        }
    }
    Ok(num_args)
}

/// Reuse the current frame for a call in tail position: move the callee and
/// its arguments down into the frame's function slot, then re-point the
/// frame at the callee.
fn tail_replace_frame(
    vm: &mut Vm,
    ci_idx: usize,
    closure_idx: GcIdx<lunaria_core::heap::LuaClosure>,
    func_idx: usize,
    num_args: usize,
) -> Result<(), LuaError> {
    let old_base = vm.call_stack[ci_idx].base;
    let dest = vm.call_stack[ci_idx].func_stack_idx;
    vm.close_upvalues(old_base);
    for i in 0..=num_args {
        vm.stack[dest + i] = vm.stack[func_idx + i];
    }

    let proto_idx = vm.heap.get_closure(closure_idx).proto_idx;
    let (num_params, is_vararg, max_stack) = {
        let p = &vm.protos[proto_idx];
        (p.num_params as usize, p.is_vararg, p.max_stack_size as usize)
    };
    let new_base = dest + 1;
    let (frame_base, vararg_base) = if is_vararg {
        let actual = new_base + num_args;
        vm.ensure_stack(actual + max_stack);
        for i in 0..num_params {
            vm.stack[actual + i] = if i < num_args {
                vm.stack[new_base + i]
            } else {
                Value::nil()
            };
        }
        (actual, Some(new_base))
    } else {
        vm.ensure_stack(new_base + max_stack);
        for i in num_args..num_params {
            vm.stack[new_base + i] = Value::nil();
        }
        (new_base, None)
    };
    vm.stack_top = frame_base + max_stack;
    let ci = &mut vm.call_stack[ci_idx];
    ci.base = frame_base;
    ci.pc = 0;
    ci.proto_idx = proto_idx;
    ci.closure_idx = Some(closure_idx);
    ci.vararg_base = vararg_base;
    ci.tail_calls = ci.tail_calls.saturating_add(1);
    Ok(())
}

/// Pop the returning frame and place its results for the caller.
fn return_from_call(vm: &mut Vm, results: &[Value]) -> Result<(), LuaError> {
    if vm.cancel.is_cancelled() {
        return Err(LuaError::Cancelled);
    }
    if vm.hook_mask & MASK_RETURN != 0 && !vm.in_hook {
        fire_hook(vm, "return", None)?;
    }
    let ci = match vm.call_stack.pop() {
        Some(ci) => ci,
        None => return Err(LuaError::Runtime("call stack underflow".to_string())),
    };
    match ci.status {
        CallStatus::ProtectedYield { result_base, want, .. } => {
            // The pcall body finished after being resumed; deliver the
            // success flag plus results at the protected call site.
            place_results_with_flag(vm, result_base, want, true, results);
        }
        CallStatus::Finish(op) => finish_op(vm, op, results)?,
        CallStatus::Normal => {
            place_call_results(vm, ci.func_stack_idx, ci.num_results, results);
        }
    }
    Ok(())
}

/// Complete the operation a handler frame was pushed for.
fn finish_op(vm: &mut Vm, op: FinishOp, results: &[Value]) -> Result<(), LuaError> {
    match op {
        FinishOp::Place { dst, want } => {
            place_call_results(vm, dst, want, results);
        }
        FinishOp::CompareSkip { expect, negate } => {
            let mut res = results.first().copied().unwrap_or_else(Value::nil).is_truthy();
            if negate {
                res = !res;
            }
            if res != expect {
                // The caller's pc already points past the comparison, so
                // one more step skips its conditional jump.
                let top = vm.call_stack.len() - 1;
                vm.call_stack[top].pc += 1;
            }
        }
        FinishOp::ConcatStep { dst, lo, next } => {
            let acc = results.first().copied().unwrap_or_else(Value::nil);
            if next == lo {
                vm.stack[dst] = acc;
            } else {
                concat_fold(vm, dst, lo, next - 1, acc)?;
            }
        }
    }
    Ok(())
}

fn place_call_results(vm: &mut Vm, dest: usize, want: i32, results: &[Value]) {
    if want < 0 {
        vm.ensure_stack(dest + results.len());
        for (i, &v) in results.iter().enumerate() {
            vm.stack[dest + i] = v;
        }
        vm.stack_top = dest + results.len();
    } else {
        let n = want as usize;
        vm.ensure_stack(dest + n);
        for i in 0..n {
            vm.stack[dest + i] = results.get(i).copied().unwrap_or_else(Value::nil);
        }
    }
}

/// Like `place_call_results` but with a leading boolean, for protected call
/// sites.
fn place_results_with_flag(vm: &mut Vm, dest: usize, want: i32, ok: bool, results: &[Value]) {
    let total = results.len() + 1;
    let count = if want < 0 { total } else { want as usize };
    vm.ensure_stack(dest + count);
    for i in 0..count {
        vm.stack[dest + i] = if i == 0 {
            Value::from_bool(ok)
        } else {
            results.get(i - 1).copied().unwrap_or_else(Value::nil)
        };
    }
    if want < 0 {
        vm.stack_top = dest + total;
    }
}

// --- Calling from Rust ---

/// Call a Lua value with arguments from host code: metamethods, iterators,
/// hooks, resume. The callee runs in a nested dispatch loop; yields cannot
/// cross this boundary.
pub fn call_function(vm: &mut Vm, func: Value, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    call_function_ext(vm, func, args, true)
}

/// `c_boundary` marks the nested execution as unyieldable. Protected-call
/// bodies and coroutine entry points pass false: their continuations are
/// representable, so yields may pass through.
pub(crate) fn call_function_ext(
    vm: &mut Vm,
    func: Value,
    args: &[Value],
    c_boundary: bool,
) -> Result<Vec<Value>, LuaError> {
    if vm.cancel.is_cancelled() {
        return Err(LuaError::Cancelled);
    }
    if let Some(closure_idx) = func.as_closure_idx() {
        let saved_top = vm.stack_top;
        let func_idx = scratch_base(vm);
        vm.ensure_stack(func_idx + 1 + args.len());
        vm.stack[func_idx] = func;
        for (i, &v) in args.iter().enumerate() {
            vm.stack[func_idx + 1 + i] = v;
        }
        push_lua_frame(vm, closure_idx, func_idx, args.len(), -1)?;
        if vm.hook_mask & MASK_CALL != 0 && !vm.in_hook {
            if let Err(e) = fire_hook(vm, "call", None) {
                vm.call_stack.pop();
                vm.stack_top = saved_top;
                return Err(e);
            }
        }
        let entry = vm.call_stack.len();
        if c_boundary {
            vm.unyieldable += 1;
        }
        let result = execute_from(vm, entry);
        if c_boundary {
            vm.unyieldable -= 1;
        }
        match result {
            Ok(values) => {
                vm.stack_top = saved_top;
                Ok(values)
            }
            Err(LuaError::Yield(values)) => Err(LuaError::Yield(values)),
            Err(e) => {
                // Unwind everything this call created before rethrowing.
                while vm.call_stack.len() >= entry {
                    let fi = vm.call_stack[vm.call_stack.len() - 1].func_stack_idx;
                    vm.close_upvalues(fi);
                    vm.call_stack.pop();
                }
                vm.stack_top = saved_top;
                Err(e)
            }
        }
    } else if let Some(native_idx) = func.as_native_idx() {
        let sp = special_fns(vm);
        if native_idx == sp.co_yield {
            if vm.running_thread == MAIN_THREAD {
                Err(LuaError::Runtime(
                    "attempt to yield from outside a coroutine".to_string(),
                ))
            } else {
                Err(LuaError::Runtime(
                    "attempt to yield across a C-call boundary".to_string(),
                ))
            }
        } else if native_idx == sp.pcall {
            if args.is_empty() {
                return Err(LuaError::Runtime(
                    "bad argument #1 to 'pcall' (value expected)".to_string(),
                ));
            }
            match call_function_ext(vm, args[0], &args[1..], true) {
                Ok(mut r) => {
                    r.insert(0, Value::from_bool(true));
                    Ok(r)
                }
                Err(e) if e.is_catchable() => {
                    let ev = e.to_value(&mut vm.strings);
                    Ok(vec![Value::from_bool(false), ev])
                }
                Err(e) => Err(e),
            }
        } else if native_idx == sp.xpcall {
            if args.len() < 2 {
                return Err(LuaError::Runtime(
                    "bad argument #2 to 'xpcall' (value expected)".to_string(),
                ));
            }
            let handler = args[1];
            match call_function_ext(vm, args[0], &args[2..], true) {
                Ok(mut r) => {
                    r.insert(0, Value::from_bool(true));
                    Ok(r)
                }
                Err(e) if e.is_catchable() => {
                    let ev = e.to_value(&mut vm.strings);
                    let handled = run_error_handler(vm, handler, ev)?;
                    Ok(vec![Value::from_bool(false), handled])
                }
                Err(e) => Err(e),
            }
        } else if sp.is_vm_routed(native_idx) {
            call_special(vm, native_idx, args)
        } else {
            run_plain_native(vm, native_idx, args)
        }
    } else {
        match metamethod::get_metamethod(func, vm.mm_names.call, &vm.heap) {
            Some(handler) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(func);
                full.extend_from_slice(args);
                call_function(vm, handler, &full)
            }
            None => Err(LuaError::Runtime(format!(
                "attempt to call a {} value",
                lua_type_name(func)
            ))),
        }
    }
}

fn special_fns(vm: &Vm) -> vm::SpecialFns {
    *vm.special.as_ref().expect("builtins registered before execution")
}

fn run_plain_native(
    vm: &mut Vm,
    native_idx: GcIdx<NativeFunction>,
    args: &[Value],
) -> Result<Vec<Value>, LuaError> {
    let f = vm.heap.get_native(native_idx).func;
    let mut ctx = NativeContext {
        args,
        heap: &mut vm.heap,
        strings: &mut vm.strings,
        cancel: &vm.cancel,
    };
    f(&mut ctx).map_err(map_native_error)
}

fn map_native_error(e: NativeError) -> LuaError {
    match e {
        NativeError::Message(m) => LuaError::Runtime(m),
        NativeError::Value(v) => LuaError::Value(v),
    }
}

fn run_error_handler(vm: &mut Vm, handler: Value, err_val: Value) -> Result<Value, LuaError> {
    match call_function(vm, handler, &[err_val]) {
        Ok(r) => Ok(r.first().copied().unwrap_or_else(Value::nil)),
        Err(he) if he.is_catchable() => Ok(he.to_value(&mut vm.strings)),
        Err(he) => Err(he),
    }
}

/// Invoke a native called by a Call/TailCall opcode, placing results at
/// `result_base`. Specials that re-enter the VM are handled inline so their
/// result placement (and any yield continuation) refers back to the real
/// call site.
fn call_native_at(
    vm: &mut Vm,
    native_idx: GcIdx<NativeFunction>,
    args: &[Value],
    result_base: usize,
    want: i32,
) -> Result<(), LuaError> {
    let sp = special_fns(vm);

    if native_idx == sp.co_yield {
        if vm.running_thread == MAIN_THREAD {
            return Err(LuaError::Runtime(
                "attempt to yield from outside a coroutine".to_string(),
            ));
        }
        if vm.unyieldable > 0 {
            return Err(LuaError::Runtime(
                "attempt to yield across a C-call boundary".to_string(),
            ));
        }
        vm.resume_point = Some(ResumePoint { slot: result_base, want });
        return Err(LuaError::Yield(args.to_vec()));
    }

    if native_idx == sp.pcall {
        if args.is_empty() {
            return Err(LuaError::Runtime(
                "bad argument #1 to 'pcall' (value expected)".to_string(),
            ));
        }
        let depth = vm.call_stack.len();
        match call_function_ext(vm, args[0], &args[1..], false) {
            Ok(results) => {
                place_results_with_flag(vm, result_base, want, true, &results);
            }
            Err(e) if !e.is_catchable() => {
                if matches!(e, LuaError::Yield(_)) && vm.call_stack.len() > depth {
                    vm.call_stack[depth].status =
                        CallStatus::ProtectedYield { result_base, want, handler: None };
                }
                return Err(e);
            }
            Err(e) => {
                let ev = e.to_value(&mut vm.strings);
                place_results_with_flag(vm, result_base, want, false, &[ev]);
            }
        }
        return Ok(());
    }

    if native_idx == sp.xpcall {
        if args.len() < 2 {
            return Err(LuaError::Runtime(
                "bad argument #2 to 'xpcall' (value expected)".to_string(),
            ));
        }
        let handler = args[1];
        let depth = vm.call_stack.len();
        match call_function_ext(vm, args[0], &args[2..], false) {
            Ok(results) => {
                place_results_with_flag(vm, result_base, want, true, &results);
            }
            Err(e) if !e.is_catchable() => {
                if matches!(e, LuaError::Yield(_)) && vm.call_stack.len() > depth {
                    vm.call_stack[depth].status = CallStatus::ProtectedYield {
                        result_base,
                        want,
                        handler: Some(handler),
                    };
                }
                return Err(e);
            }
            Err(e) => {
                let ev = e.to_value(&mut vm.strings);
                let handled = run_error_handler(vm, handler, ev)?;
                place_results_with_flag(vm, result_base, want, false, &[handled]);
            }
        }
        return Ok(());
    }

    if sp.is_vm_routed(native_idx) {
        let results = call_special(vm, native_idx, args)?;
        place_call_results(vm, result_base, want, &results);
        return Ok(());
    }

    let results = run_plain_native(vm, native_idx, args)?;
    place_call_results(vm, result_base, want, &results);
    Ok(())
}

/// Natives that need VM state: the coroutine family, pairs/ipairs, string
/// conversion, printing, hooks.
fn call_special(
    vm: &mut Vm,
    native_idx: GcIdx<NativeFunction>,
    args: &[Value],
) -> Result<Vec<Value>, LuaError> {
    let sp = special_fns(vm);
    let rest = args.get(1..).unwrap_or(&[]);
    if native_idx == sp.co_create {
        do_create(vm, args)
    } else if native_idx == sp.co_resume {
        let co = args.first().copied().unwrap_or_else(Value::nil);
        do_resume(vm, co, rest)
    } else if native_idx == sp.co_status {
        do_status(vm, args)
    } else if native_idx == sp.co_wrap {
        do_wrap(vm, args)
    } else if native_idx == sp.co_wrap_resume {
        do_wrap_resume(vm, args)
    } else if native_idx == sp.co_isyieldable {
        Ok(vec![Value::from_bool(
            vm.running_thread != MAIN_THREAD && vm.unyieldable == 0,
        )])
    } else if native_idx == sp.co_running {
        Ok(vec![
            Value::from_thread(vm.running_thread),
            Value::from_bool(vm.running_thread == MAIN_THREAD),
        ])
    } else if native_idx == sp.pairs_fn {
        do_pairs(vm, args)
    } else if native_idx == sp.ipairs_fn {
        do_ipairs(vm, args)
    } else if native_idx == sp.tostring_fn {
        if args.is_empty() {
            return Err(LuaError::Runtime(
                "bad argument #1 to 'tostring' (value expected)".to_string(),
            ));
        }
        Ok(vec![tostring_value(vm, args[0])?])
    } else if native_idx == sp.print_fn {
        do_print(vm, args)
    } else if native_idx == sp.sethook {
        do_sethook(vm, args)
    } else if native_idx == sp.gethook {
        do_gethook(vm)
    } else {
        Err(LuaError::Runtime("unrecognized builtin".to_string()))
    }
}

// --- Coroutines ---

fn do_create(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let f = args.first().copied().unwrap_or_else(Value::nil);
    if !f.is_function() {
        return Err(LuaError::Runtime(
            "bad argument #1 to 'create' (function expected)".to_string(),
        ));
    }
    let id = vm.threads.len() as u32;
    let mut thread = LuaThread::empty(CoroutineStatus::Suspended);
    thread.stack.push(f);
    thread.stack_top = 1;
    vm.threads.push(thread);
    Ok(vec![Value::from_thread(id)])
}

fn do_status(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let co = args.first().copied().unwrap_or_else(Value::nil);
    let Some(id) = co.as_thread_idx() else {
        return Err(LuaError::Runtime(
            "bad argument #1 to 'status' (coroutine expected)".to_string(),
        ));
    };
    let name: &[u8] = if id == vm.running_thread {
        b"running"
    } else {
        match vm.threads.get(id as usize).map(|t| t.status) {
            Some(CoroutineStatus::Suspended) => b"suspended",
            Some(CoroutineStatus::Running) => b"running",
            Some(CoroutineStatus::Normal) => b"normal",
            Some(CoroutineStatus::Dead) | None => b"dead",
        }
    };
    Ok(vec![Value::from_string_id(vm.strings.intern(name))])
}

fn do_resume(vm: &mut Vm, co: Value, resume_args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let Some(id) = co.as_thread_idx() else {
        return Err(LuaError::Runtime(
            "bad argument #1 to 'resume' (coroutine expected)".to_string(),
        ));
    };
    let tid = id as usize;
    if tid >= vm.threads.len() {
        return Err(LuaError::Runtime(
            "bad argument #1 to 'resume' (coroutine expected)".to_string(),
        ));
    }
    let status = if id == vm.running_thread {
        CoroutineStatus::Running
    } else {
        vm.threads[tid].status
    };
    match status {
        CoroutineStatus::Suspended => {}
        CoroutineStatus::Dead => {
            let msg = vm.strings.intern(b"cannot resume dead coroutine");
            return Ok(vec![Value::from_bool(false), Value::from_string_id(msg)]);
        }
        _ => {
            let msg = vm.strings.intern(b"cannot resume non-suspended coroutine");
            return Ok(vec![Value::from_bool(false), Value::from_string_id(msg)]);
        }
    }

    let caller = vm.running_thread;
    vm.suspend_running();
    vm.activate_thread(id);

    let outcome = if vm.call_stack.is_empty() {
        // First resume: call the body with the resume arguments.
        let body = vm.stack.first().copied().unwrap_or_else(Value::nil);
        call_function_ext(vm, body, resume_args, false)
    } else {
        // Later resumes: the arguments become the results of the call that
        // yielded, then the saved frames continue flat.
        if let Some(rp) = vm.resume_point.take() {
            if rp.want < 0 {
                vm.ensure_stack(rp.slot + resume_args.len());
                for (i, &v) in resume_args.iter().enumerate() {
                    vm.stack[rp.slot + i] = v;
                }
                vm.stack_top = rp.slot + resume_args.len();
            } else {
                let n = rp.want as usize;
                vm.ensure_stack(rp.slot + n);
                for i in 0..n {
                    vm.stack[rp.slot + i] =
                        resume_args.get(i).copied().unwrap_or_else(Value::nil);
                }
            }
        }
        execute_from(vm, 1)
    };

    let (final_status, reply) = match outcome {
        Ok(values) => (CoroutineStatus::Dead, Ok((true, values))),
        Err(LuaError::Yield(values)) => (CoroutineStatus::Suspended, Ok((true, values))),
        Err(e) if e.is_catchable() => {
            let ev = e.to_value(&mut vm.strings);
            (CoroutineStatus::Dead, Ok((false, vec![ev])))
        }
        Err(e) => (CoroutineStatus::Dead, Err(e)),
    };

    vm.suspend_running();
    vm.threads[tid].status = final_status;
    vm.activate_thread(caller);
    vm.threads[caller as usize].status = CoroutineStatus::Running;

    match reply {
        Ok((ok, values)) => {
            let mut out = Vec::with_capacity(values.len() + 1);
            out.push(Value::from_bool(ok));
            out.extend(values);
            Ok(out)
        }
        Err(e) => Err(e),
    }
}

fn do_wrap(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let created = do_create(vm, args)?;
    let handle = created[0];
    let sp = special_fns(vm);
    let wrapper = vm.heap.alloc_table(1, 0);
    vm.heap.get_table_mut(wrapper).raw_set_int(1, handle);
    let mt = vm.heap.alloc_table(0, 1);
    let call_sid = vm.mm_names.call;
    vm.heap
        .get_table_mut(mt)
        .raw_set_str(call_sid, Value::from_native(sp.co_wrap_resume));
    vm.heap.get_table_mut(wrapper).metatable = Some(mt);
    Ok(vec![Value::from_table(wrapper)])
}

/// `__call` target of wrapped coroutines: args[0] is the wrapper table.
fn do_wrap_resume(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let wrapper = args.first().copied().unwrap_or_else(Value::nil);
    let Some(tidx) = wrapper.as_table_idx() else {
        return Err(LuaError::Runtime("corrupt coroutine wrapper".to_string()));
    };
    let handle = vm.heap.get_table(tidx).raw_get_int(1);
    let mut results = do_resume(vm, handle, args.get(1..).unwrap_or(&[]))?;
    let ok = results.first().map(|v| v.is_truthy()).unwrap_or(false);
    if ok {
        results.remove(0);
        Ok(results)
    } else {
        let err = results.get(1).copied().unwrap_or_else(Value::nil);
        Err(LuaError::Value(err))
    }
}

// --- Iteration, printing, hooks ---

fn do_pairs(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let t = args.first().copied().unwrap_or_else(Value::nil);
    if let Some(handler) = metamethod::get_metamethod(t, vm.mm_names.pairs, &vm.heap) {
        let mut r = call_function(vm, handler, &[t])?;
        r.resize(3, Value::nil());
        return Ok(r);
    }
    if t.as_table_idx().is_none() {
        return Err(LuaError::Runtime(format!(
            "bad argument #1 to 'pairs' (table expected, got {})",
            lua_type_name(t)
        )));
    }
    let sp = special_fns(vm);
    Ok(vec![sp.next_val, t, Value::nil()])
}

fn do_ipairs(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let t = args.first().copied().unwrap_or_else(Value::nil);
    if let Some(handler) = metamethod::get_metamethod(t, vm.mm_names.ipairs, &vm.heap) {
        let mut r = call_function(vm, handler, &[t])?;
        r.resize(3, Value::nil());
        return Ok(r);
    }
    if t.as_table_idx().is_none() {
        return Err(LuaError::Runtime(format!(
            "bad argument #1 to 'ipairs' (table expected, got {})",
            lua_type_name(t)
        )));
    }
    let sp = special_fns(vm);
    Ok(vec![sp.ipairs_iter_val, t, Value::from_number(0.0)])
}

/// `tostring` semantics: `__tostring` wins, and must return a string.
pub fn tostring_value(vm: &mut Vm, v: Value) -> Result<Value, LuaError> {
    if let Some(handler) = metamethod::get_metamethod(v, vm.mm_names.tostring, &vm.heap) {
        let r = call_function(vm, handler, &[v])?;
        let out = r.first().copied().unwrap_or_else(Value::nil);
        if out.as_string_id().is_none() {
            return Err(LuaError::Runtime(
                "'__tostring' must return a string".to_string(),
            ));
        }
        return Ok(out);
    }
    let rendered = vm::format_value(v, &vm.strings);
    Ok(Value::from_string_id(vm.strings.intern(rendered.as_bytes())))
}

fn do_print(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let mut line = String::new();
    for (i, &v) in args.iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        let s = tostring_value(vm, v)?;
        if let Some(sid) = s.as_string_id() {
            line.push_str(&vm.strings.get_display(sid));
        }
    }
    println!("{line}");
    Ok(Vec::new())
}

fn do_sethook(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, LuaError> {
    let f = args.first().copied().unwrap_or_else(Value::nil);
    if f.is_nil() {
        vm.hook_func = Value::nil();
        vm.hook_mask = 0;
        vm.hook_count = 0;
        vm.hook_counter = 0;
        vm.hook_last_line = 0;
        return Ok(Vec::new());
    }
    if !f.is_function() {
        return Err(LuaError::Runtime(
            "bad argument #1 to 'sethook' (function expected)".to_string(),
        ));
    }
    let mask_bytes = args
        .get(1)
        .and_then(|v| v.as_string_id())
        .map(|sid| vm.strings.get_bytes(sid).to_vec())
        .unwrap_or_default();
    let mut mask = 0u32;
    for b in &mask_bytes {
        match b {
            b'c' => mask |= MASK_CALL,
            b'r' => mask |= MASK_RETURN,
            b'l' => mask |= MASK_LINE,
            _ => {}
        }
    }
    let count = args.get(2).and_then(|v| v.as_number()).unwrap_or(0.0);
    let count = if count > 0.0 { count as u32 } else { 0 };
    if count > 0 {
        mask |= MASK_COUNT;
    }
    if mask == 0 {
        vm.hook_func = Value::nil();
        vm.hook_mask = 0;
        vm.hook_count = 0;
        vm.hook_counter = 0;
        vm.hook_last_line = 0;
        return Ok(Vec::new());
    }
    vm.hook_func = f;
    vm.hook_mask = mask;
    vm.hook_count = count;
    vm.hook_counter = count;
    vm.hook_last_line = 0;
    Ok(Vec::new())
}

fn do_gethook(vm: &mut Vm) -> Result<Vec<Value>, LuaError> {
    if vm.hook_func.is_nil() {
        return Ok(vec![Value::nil()]);
    }
    let mut mask = Vec::new();
    if vm.hook_mask & MASK_CALL != 0 {
        mask.push(b'c');
    }
    if vm.hook_mask & MASK_RETURN != 0 {
        mask.push(b'r');
    }
    if vm.hook_mask & MASK_LINE != 0 {
        mask.push(b'l');
    }
    let mask_val = Value::from_string_id(vm.strings.intern(&mask));
    Ok(vec![
        vm.hook_func,
        mask_val,
        Value::from_number(vm.hook_count as f64),
    ])
}

/// Invoke the debug hook, suppressing re-entry while it runs.
fn fire_hook(vm: &mut Vm, event: &str, line: Option<u32>) -> Result<(), LuaError> {
    if vm.hook_func.is_nil() {
        return Ok(());
    }
    vm.in_hook = true;
    let ev = Value::from_string_id(vm.strings.intern(event.as_bytes()));
    let line_val = match line {
        Some(l) => Value::from_number(l as f64),
        None => Value::nil(),
    };
    let hook = vm.hook_func;
    let result = call_function(vm, hook, &[ev, line_val]);
    vm.in_hook = false;
    result.map(|_| ())
}

// --- Indexing and operators ---

/// `obj[key]` with the `__index` chain: raw hit wins, a function handler is
/// called, a table handler re-indexes. The result lands in stack slot
/// `dst`, possibly only after a handler frame returns.
pub fn table_index(vm: &mut Vm, obj: Value, key: Value, dst: usize) -> Result<(), LuaError> {
    let name = vm.mm_names.index;
    let mut current = obj;
    for _ in 0..MAX_INDEX_CHAIN {
        if let Some(tidx) = current.as_table_idx() {
            let raw = vm.heap.get_table(tidx).raw_get(key);
            if !raw.is_nil() {
                vm.stack[dst] = raw;
                return Ok(());
            }
            match metamethod::get_metamethod(current, name, &vm.heap) {
                None => {
                    vm.stack[dst] = Value::nil();
                    return Ok(());
                }
                Some(handler) => {
                    if handler.is_function() {
                        return call_handler_place(vm, handler, &[current, key], dst);
                    }
                    current = handler;
                }
            }
        } else {
            match metamethod::get_metamethod(current, name, &vm.heap) {
                None => {
                    return Err(LuaError::Runtime(format!(
                        "attempt to index a {} value",
                        lua_type_name(current)
                    )))
                }
                Some(handler) => {
                    if handler.is_function() {
                        return call_handler_place(vm, handler, &[current, key], dst);
                    }
                    current = handler;
                }
            }
        }
    }
    Err(LuaError::Runtime("loop in gettable".to_string()))
}

/// `obj[key] = val` with the `__newindex` chain.
pub fn table_newindex(vm: &mut Vm, obj: Value, key: Value, val: Value) -> Result<(), LuaError> {
    let name = vm.mm_names.newindex;
    let mut current = obj;
    for _ in 0..MAX_INDEX_CHAIN {
        if let Some(tidx) = current.as_table_idx() {
            let existing = vm.heap.get_table(tidx).raw_get(key);
            if !existing.is_nil() {
                return vm
                    .heap
                    .get_table_mut(tidx)
                    .raw_set(key, val)
                    .map_err(|m| LuaError::Runtime(m.to_string()));
            }
            match metamethod::get_metamethod(current, name, &vm.heap) {
                None => {
                    return vm
                        .heap
                        .get_table_mut(tidx)
                        .raw_set(key, val)
                        .map_err(|m| LuaError::Runtime(m.to_string()));
                }
                Some(handler) => {
                    if handler.is_function() {
                        return call_newindex_handler(vm, handler, current, key, val);
                    }
                    current = handler;
                }
            }
        } else {
            match metamethod::get_metamethod(current, name, &vm.heap) {
                None => {
                    return Err(LuaError::Runtime(format!(
                        "attempt to index a {} value",
                        lua_type_name(current)
                    )))
                }
                Some(handler) => {
                    if handler.is_function() {
                        return call_newindex_handler(vm, handler, current, key, val);
                    }
                    current = handler;
                }
            }
        }
    }
    Err(LuaError::Runtime("loop in settable".to_string()))
}

fn call_newindex_handler(
    vm: &mut Vm,
    handler: Value,
    obj: Value,
    key: Value,
    val: Value,
) -> Result<(), LuaError> {
    if let Some(closure_idx) = handler.as_closure_idx() {
        push_finish_frame(
            vm,
            closure_idx,
            &[obj, key, val],
            FinishOp::Place { dst: 0, want: 0 },
        )
    } else {
        call_function(vm, handler, &[obj, key, val])?;
        Ok(())
    }
}

fn arith_metamethod(
    vm: &mut Vm,
    op: ArithOp,
    vb: Value,
    vc: Value,
    dst: usize,
) -> Result<(), LuaError> {
    let name = match op {
        ArithOp::Add => vm.mm_names.add,
        ArithOp::Sub => vm.mm_names.sub,
        ArithOp::Mul => vm.mm_names.mul,
        ArithOp::Div => vm.mm_names.div,
        ArithOp::Mod => vm.mm_names.modulo,
        ArithOp::Pow => vm.mm_names.pow,
    };
    let handler = metamethod::get_metamethod(vb, name, &vm.heap)
        .or_else(|| metamethod::get_metamethod(vc, name, &vm.heap));
    match handler {
        Some(h) => call_handler_place(vm, h, &[vb, vc], dst),
        None => {
            let bad = if coerce::to_number(vb, &vm.strings).is_none() {
                vb
            } else {
                vc
            };
            Err(LuaError::Runtime(format!(
                "attempt to perform arithmetic on a {} value ({} operation)",
                lua_type_name(bad),
                op.name()
            )))
        }
    }
}

/// Fold the concatenation operands at `lo..=next` into `acc`, right to
/// left, storing the final value in `dst`. A Lua `__concat` handler runs as
/// a handler frame whose `ConcatStep` picks the fold back up.
fn concat_fold(
    vm: &mut Vm,
    dst: usize,
    lo: usize,
    mut next: usize,
    mut acc: Value,
) -> Result<(), LuaError> {
    loop {
        let left = vm.stack[next];
        let lb = arith::concat_bytes(left, &vm.strings);
        let rb = arith::concat_bytes(acc, &vm.strings);
        if let (Some(mut lb), Some(rb)) = (lb, rb) {
            lb.extend_from_slice(&rb);
            acc = Value::from_string_id(vm.strings.intern(&lb));
        } else {
            let handler = metamethod::get_metamethod(left, vm.mm_names.concat, &vm.heap)
                .or_else(|| metamethod::get_metamethod(acc, vm.mm_names.concat, &vm.heap));
            match handler {
                Some(h) => {
                    if let Some(closure_idx) = h.as_closure_idx() {
                        return push_finish_frame(
                            vm,
                            closure_idx,
                            &[left, acc],
                            FinishOp::ConcatStep { dst, lo, next },
                        );
                    }
                    let r = call_function(vm, h, &[left, acc])?;
                    acc = r.first().copied().unwrap_or_else(Value::nil);
                }
                None => {
                    let bad = if arith::concat_bytes(left, &vm.strings).is_none() {
                        left
                    } else {
                        acc
                    };
                    return Err(LuaError::Runtime(format!(
                        "attempt to concatenate a {} value",
                        lua_type_name(bad)
                    )));
                }
            }
        }
        if next == lo {
            vm.stack[dst] = acc;
            return Ok(());
        }
        next -= 1;
    }
}

fn compare_type_error(a: Value, b: Value) -> LuaError {
    let ta = lua_type_name(a);
    let tb = lua_type_name(b);
    if ta == tb {
        LuaError::Runtime(format!("attempt to compare two {ta} values"))
    } else {
        LuaError::Runtime(format!("attempt to compare {ta} with {tb}"))
    }
}
