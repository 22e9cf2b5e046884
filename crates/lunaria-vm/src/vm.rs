//! The virtual machine: execution state, threads, and builtin registration.
//!
//! A `Vm` owns one main execution stack plus a saved `LuaThread` per
//! coroutine. Exactly one thread is "live" at a time; `resume` swaps the
//! live state out into its slot and swaps the target's in. Open upvalues are
//! retagged on every swap so a closure captured in one thread still reads
//! the right slot after that thread suspends.

use crate::callinfo::CallInfo;
use crate::coerce;
use crate::dispatch;
use crate::error::LuaError;
use crate::metamethod::MetamethodNames;
use lunaria_compiler::proto::Proto;
use lunaria_core::cancel::CancelToken;
use lunaria_core::heap::{
    GcIdx, Heap, NativeContext, NativeError, NativeFunction, UpVal, UpValLocation,
};
use lunaria_core::object::lua_type_name;
use lunaria_core::string::StringInterner;
use lunaria_core::table::Table;
use lunaria_core::value::Value;

/// Nesting limit for call frames. Tail calls do not count against it.
pub const MAX_CALL_DEPTH: usize = 200;

/// Thread slot of the main coroutine.
pub const MAIN_THREAD: u32 = 0;

/// Debug hook event masks.
pub const MASK_CALL: u32 = 1 << 0;
pub const MASK_RETURN: u32 = 1 << 1;
pub const MASK_LINE: u32 = 1 << 2;
pub const MASK_COUNT: u32 = 1 << 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineStatus {
    Suspended,
    Running,
    /// Resumed another coroutine and is waiting for it.
    Normal,
    Dead,
}

/// Where `resume` places its arguments when a suspended thread restarts:
/// the stack slot of the call that yielded, and how many results that call
/// site expects (-1 for "all").
#[derive(Clone, Copy, Debug)]
pub struct ResumePoint {
    pub slot: usize,
    pub want: i32,
}

/// Saved execution state of a coroutine, or of a caller while another
/// thread runs.
#[derive(Debug)]
pub struct LuaThread {
    pub stack: Vec<Value>,
    pub stack_top: usize,
    pub call_stack: Vec<CallInfo>,
    pub open_upvals: Vec<GcIdx<UpVal>>,
    pub status: CoroutineStatus,
    pub resume_point: Option<ResumePoint>,
    pub unyieldable: u32,
}

impl LuaThread {
    pub fn empty(status: CoroutineStatus) -> LuaThread {
        LuaThread {
            stack: Vec::new(),
            stack_top: 0,
            call_stack: Vec::new(),
            open_upvals: Vec::new(),
            status,
            resume_point: None,
            unyieldable: 0,
        }
    }
}

/// Handles to the builtins the dispatch loop must intercept because they
/// re-enter the interpreter (pcall, resume) or need VM state natives are
/// not given (threads, hooks, the globals table).
#[derive(Clone, Copy, Debug)]
pub struct SpecialFns {
    pub pcall: GcIdx<NativeFunction>,
    pub xpcall: GcIdx<NativeFunction>,
    pub pairs_fn: GcIdx<NativeFunction>,
    pub ipairs_fn: GcIdx<NativeFunction>,
    pub tostring_fn: GcIdx<NativeFunction>,
    pub print_fn: GcIdx<NativeFunction>,
    pub co_create: GcIdx<NativeFunction>,
    pub co_resume: GcIdx<NativeFunction>,
    pub co_yield: GcIdx<NativeFunction>,
    pub co_status: GcIdx<NativeFunction>,
    pub co_wrap: GcIdx<NativeFunction>,
    pub co_wrap_resume: GcIdx<NativeFunction>,
    pub co_isyieldable: GcIdx<NativeFunction>,
    pub co_running: GcIdx<NativeFunction>,
    pub sethook: GcIdx<NativeFunction>,
    pub gethook: GcIdx<NativeFunction>,
    /// `next` and the ipairs iterator as callable values, handed out by
    /// pairs/ipairs.
    pub next_val: Value,
    pub ipairs_iter_val: Value,
}

impl SpecialFns {
    /// True for natives that must run inside the dispatch loop rather than
    /// through the plain native calling convention.
    pub fn is_vm_routed(&self, idx: GcIdx<NativeFunction>) -> bool {
        idx == self.co_create
            || idx == self.co_resume
            || idx == self.co_status
            || idx == self.co_wrap
            || idx == self.co_wrap_resume
            || idx == self.co_isyieldable
            || idx == self.co_running
            || idx == self.pairs_fn
            || idx == self.ipairs_fn
            || idx == self.tostring_fn
            || idx == self.print_fn
            || idx == self.sethook
            || idx == self.gethook
    }
}

pub struct Vm {
    /// Register stack of the live thread.
    pub stack: Vec<Value>,
    /// One past the last live slot; only meaningful around multi-value
    /// operations.
    pub stack_top: usize,
    pub call_stack: Vec<CallInfo>,
    /// Open upvalues of the live thread, sorted by slot, highest first.
    pub open_upvals: Vec<GcIdx<UpVal>>,
    /// Flattened prototype store; index 0 is the main chunk.
    pub protos: Vec<Proto>,
    /// Child proto indices per flattened proto, parallel to `protos`.
    pub proto_children: Vec<Vec<usize>>,
    pub heap: Heap,
    pub strings: StringInterner,
    pub globals: Option<GcIdx<Table>>,
    pub threads: Vec<LuaThread>,
    pub running_thread: u32,
    pub resume_point: Option<ResumePoint>,
    /// Non-zero while execution is nested under a host-side call boundary
    /// (metamethod, iterator, hook) that a yield could not be resumed
    /// across.
    pub unyieldable: u32,
    pub max_call_depth: usize,
    pub mm_names: MetamethodNames,
    pub special: Option<SpecialFns>,
    pub cancel: CancelToken,
    // Debug hook state. Hooks are VM-wide, not per-thread.
    pub hook_func: Value,
    pub hook_mask: u32,
    pub hook_count: u32,
    pub hook_counter: u32,
    pub hook_last_line: u32,
    pub in_hook: bool,
}

impl Vm {
    pub fn new() -> Vm {
        let mut strings = StringInterner::new();
        let mm_names = MetamethodNames::intern(&mut strings);
        Vm {
            stack: Vec::new(),
            stack_top: 0,
            call_stack: Vec::new(),
            open_upvals: Vec::new(),
            protos: Vec::new(),
            proto_children: Vec::new(),
            heap: Heap::new(),
            strings,
            globals: None,
            threads: Vec::new(),
            running_thread: MAIN_THREAD,
            resume_point: None,
            unyieldable: 0,
            max_call_depth: MAX_CALL_DEPTH,
            mm_names,
            special: None,
            cancel: CancelToken::new(),
            hook_func: Value::nil(),
            hook_mask: 0,
            hook_count: 0,
            hook_counter: 0,
            hook_last_line: 0,
            in_hook: false,
        }
    }

    /// A handle the host can trigger from another thread to stop execution.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run a compiled chunk to completion. The interner must be the one the
    /// chunk was compiled (or undumped) against. Returns the chunk's return
    /// values.
    pub fn execute(
        &mut self,
        proto: &Proto,
        strings: StringInterner,
    ) -> Result<Vec<Value>, LuaError> {
        self.strings = strings;
        self.heap = Heap::new();
        self.mm_names = MetamethodNames::intern(&mut self.strings);
        self.protos = Vec::new();
        self.proto_children = Vec::new();
        flatten_protos(&mut self.protos, &mut self.proto_children, proto);

        self.stack.clear();
        self.stack_top = 0;
        self.call_stack.clear();
        self.open_upvals.clear();
        self.threads = vec![LuaThread::empty(CoroutineStatus::Running)];
        self.running_thread = MAIN_THREAD;
        self.resume_point = None;
        self.unyieldable = 0;
        self.hook_func = Value::nil();
        self.hook_mask = 0;
        self.hook_count = 0;
        self.hook_counter = 0;
        self.hook_last_line = 0;
        self.in_hook = false;

        let env = self.heap.alloc_table(0, 32);
        self.globals = Some(env);
        let special = self.register_builtins(env);
        self.special = Some(special);

        // The main closure's sole upvalue is _ENV, pre-closed over globals.
        let upvals = if self.protos[0].upvalues.is_empty() {
            Vec::new()
        } else {
            let env_upval = self
                .heap
                .alloc_upval(UpValLocation::Closed(Value::from_table(env)));
            vec![env_upval]
        };
        let closure = self.heap.alloc_closure(0, upvals);

        let max_stack = self.protos[0].max_stack_size as usize;
        self.ensure_stack(1 + max_stack);
        self.stack[0] = Value::from_closure(closure);
        let mut ci = CallInfo::new(1, 0, 0);
        ci.closure_idx = Some(closure);
        if self.protos[0].is_vararg {
            ci.vararg_base = Some(1);
        }
        self.stack_top = 1 + max_stack;
        self.call_stack.push(ci);

        match dispatch::execute_from(self, 1) {
            Err(LuaError::Yield(_)) => Err(LuaError::Runtime(
                "attempt to yield from outside a coroutine".to_string(),
            )),
            other => other,
        }
    }

    /// Grow the stack so slots below `top` are addressable.
    pub fn ensure_stack(&mut self, top: usize) {
        if self.stack.len() < top {
            self.stack.resize(top, Value::nil());
        }
    }

    pub fn get_upval_value(&self, uv: GcIdx<UpVal>) -> Value {
        match self.heap.get_upval(uv).location {
            UpValLocation::Open(slot) => self.stack[slot],
            UpValLocation::OpenInThread { thread, slot } => {
                self.threads[thread as usize].stack[slot]
            }
            UpValLocation::Closed(v) => v,
        }
    }

    pub fn set_upval_value(&mut self, uv: GcIdx<UpVal>, val: Value) {
        match self.heap.get_upval(uv).location {
            UpValLocation::Open(slot) => self.stack[slot] = val,
            UpValLocation::OpenInThread { thread, slot } => {
                self.threads[thread as usize].stack[slot] = val;
            }
            UpValLocation::Closed(_) => {
                self.heap.get_upval_mut(uv).location = UpValLocation::Closed(val);
            }
        }
    }

    /// Find the open upvalue cell for a stack slot, creating one if no
    /// closure has captured that slot yet.
    pub fn find_or_create_open_upval(&mut self, slot: usize) -> GcIdx<UpVal> {
        let mut insert_at = self.open_upvals.len();
        for (i, &uv) in self.open_upvals.iter().enumerate() {
            if let UpValLocation::Open(s) = self.heap.get_upval(uv).location {
                if s == slot {
                    return uv;
                }
                if s < slot {
                    insert_at = i;
                    break;
                }
            }
        }
        let uv = self.heap.alloc_upval(UpValLocation::Open(slot));
        self.open_upvals.insert(insert_at, uv);
        uv
    }

    /// Close every open upvalue at or above `level`: copy the stack value
    /// into the cell so closures outlive the frame.
    pub fn close_upvalues(&mut self, level: usize) {
        while let Some(&uv) = self.open_upvals.first() {
            let slot = match self.heap.get_upval(uv).location {
                UpValLocation::Open(s) if s >= level => s,
                _ => break,
            };
            let value = self.stack[slot];
            self.heap.get_upval_mut(uv).location = UpValLocation::Closed(value);
            self.open_upvals.remove(0);
        }
    }

    /// Park the live thread's state in its slot. Open upvalues are retagged
    /// so other threads' closures can still reach them.
    pub fn suspend_running(&mut self) {
        let id = self.running_thread;
        let open_upvals = std::mem::take(&mut self.open_upvals);
        for &uv in &open_upvals {
            let loc = &mut self.heap.get_upval_mut(uv).location;
            if let UpValLocation::Open(slot) = *loc {
                *loc = UpValLocation::OpenInThread { thread: id, slot };
            }
        }
        let parked = LuaThread {
            stack: std::mem::take(&mut self.stack),
            stack_top: self.stack_top,
            call_stack: std::mem::take(&mut self.call_stack),
            open_upvals,
            status: CoroutineStatus::Normal,
            resume_point: self.resume_point.take(),
            unyieldable: self.unyieldable,
        };
        self.threads[id as usize] = parked;
        self.stack_top = 0;
        self.unyieldable = 0;
    }

    /// Make a parked thread live. Its slot keeps a placeholder marked
    /// `Running` so status queries on the live thread still answer.
    pub fn activate_thread(&mut self, id: u32) {
        let parked = std::mem::replace(
            &mut self.threads[id as usize],
            LuaThread::empty(CoroutineStatus::Running),
        );
        self.stack = parked.stack;
        self.stack_top = parked.stack_top;
        self.call_stack = parked.call_stack;
        self.resume_point = parked.resume_point;
        self.unyieldable = parked.unyieldable;
        let open_upvals = parked.open_upvals;
        for &uv in &open_upvals {
            let loc = &mut self.heap.get_upval_mut(uv).location;
            if let UpValLocation::OpenInThread { thread, slot } = *loc {
                if thread == id {
                    *loc = UpValLocation::Open(slot);
                }
            }
        }
        self.open_upvals = open_upvals;
        self.running_thread = id;
    }

    /// A human-readable dump of the live call stack, innermost frame first.
    pub fn traceback(&self) -> String {
        let mut out = String::from("stack traceback:");
        for (depth, ci) in self.call_stack.iter().enumerate().rev() {
            let proto = &self.protos[ci.proto_idx];
            let src = proto
                .source
                .map(|sid| format_source_name(self.strings.get_bytes(sid)))
                .unwrap_or_else(|| "?".to_string());
            let line = proto.get_line(ci.pc.saturating_sub(1));
            if depth == 0 || proto.line_defined == 0 {
                out.push_str(&format!("\n\t{src}:{line}: in main chunk"));
            } else {
                out.push_str(&format!(
                    "\n\t{src}:{line}: in function <{src}:{}>",
                    proto.line_defined
                ));
            }
            if ci.tail_calls > 0 {
                out.push_str("\n\t(...tail calls...)");
            }
        }
        out
    }

    fn register(
        &mut self,
        table: GcIdx<Table>,
        name: &'static str,
        func: fn(&mut NativeContext) -> Result<Vec<Value>, NativeError>,
    ) -> GcIdx<NativeFunction> {
        let idx = self.heap.alloc_native(func, name);
        let sid = self.strings.intern(name.as_bytes());
        self.heap
            .get_table_mut(table)
            .raw_set_str(sid, Value::from_native(idx));
        idx
    }

    fn register_builtins(&mut self, env: GcIdx<Table>) -> SpecialFns {
        self.register(env, "type", native_type);
        self.register(env, "tonumber", native_tonumber);
        self.register(env, "error", native_error);
        self.register(env, "assert", native_assert);
        self.register(env, "select", native_select);
        self.register(env, "rawget", native_rawget);
        self.register(env, "rawset", native_rawset);
        self.register(env, "rawequal", native_rawequal);
        self.register(env, "rawlen", native_rawlen);
        self.register(env, "setmetatable", native_setmetatable);
        self.register(env, "getmetatable", native_getmetatable);
        let next_idx = self.register(env, "next", native_next);
        let ipairs_iter = self.heap.alloc_native(native_ipairs_iter, "ipairs_iter");

        let pcall = self.register(env, "pcall", special_stub);
        let xpcall = self.register(env, "xpcall", special_stub);
        let pairs_fn = self.register(env, "pairs", special_stub);
        let ipairs_fn = self.register(env, "ipairs", special_stub);
        let tostring_fn = self.register(env, "tostring", special_stub);
        let print_fn = self.register(env, "print", special_stub);

        let co = self.heap.alloc_table(0, 8);
        let co_create = self.register(co, "create", special_stub);
        let co_resume = self.register(co, "resume", special_stub);
        let co_yield = self.register(co, "yield", special_stub);
        let co_status = self.register(co, "status", special_stub);
        let co_wrap = self.register(co, "wrap", special_stub);
        let co_isyieldable = self.register(co, "isyieldable", special_stub);
        let co_running = self.register(co, "running", special_stub);
        let co_wrap_resume = self.heap.alloc_native(special_stub, "wrap_resume");
        let co_sid = self.strings.intern(b"coroutine");
        self.heap
            .get_table_mut(env)
            .raw_set_str(co_sid, Value::from_table(co));

        let dbg = self.heap.alloc_table(0, 2);
        let sethook = self.register(dbg, "sethook", special_stub);
        let gethook = self.register(dbg, "gethook", special_stub);
        let dbg_sid = self.strings.intern(b"debug");
        self.heap
            .get_table_mut(env)
            .raw_set_str(dbg_sid, Value::from_table(dbg));

        let g_sid = self.strings.intern(b"_G");
        self.heap
            .get_table_mut(env)
            .raw_set_str(g_sid, Value::from_table(env));
        let ver_sid = self.strings.intern(b"_VERSION");
        let ver_val = Value::from_string_id(self.strings.intern(b"Lua 5.2"));
        self.heap.get_table_mut(env).raw_set_str(ver_sid, ver_val);

        SpecialFns {
            pcall,
            xpcall,
            pairs_fn,
            ipairs_fn,
            tostring_fn,
            print_fn,
            co_create,
            co_resume,
            co_yield,
            co_status,
            co_wrap,
            co_wrap_resume,
            co_isyieldable,
            co_running,
            sethook,
            gethook,
            next_val: Value::from_native(next_idx),
            ipairs_iter_val: Value::from_native(ipairs_iter),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

/// Flatten a prototype tree into the VM's linear store, recording each
/// proto's child indices so `Closure` can resolve Bx without cloning.
fn flatten_protos(protos: &mut Vec<Proto>, children: &mut Vec<Vec<usize>>, p: &Proto) -> usize {
    let idx = protos.len();
    protos.push(p.clone());
    children.push(Vec::new());
    let kid_idxs: Vec<usize> = p
        .protos
        .iter()
        .map(|child| flatten_protos(protos, children, child))
        .collect();
    children[idx] = kid_idxs;
    idx
}

/// Default rendering of a value, as `tostring` without metamethods.
pub fn format_value(v: Value, strings: &StringInterner) -> String {
    if v.is_nil() {
        "nil".to_string()
    } else if let Some(b) = v.as_bool() {
        b.to_string()
    } else if let Some(n) = v.as_number() {
        coerce::format_number(n)
    } else if let Some(sid) = v.as_string_id() {
        strings.get_display(sid)
    } else if let Some(t) = v.as_table_idx() {
        format!("table: 0x{:08x}", t.index())
    } else if let Some(c) = v.as_closure_idx() {
        format!("function: 0x{:08x}", c.index())
    } else if let Some(n) = v.as_native_idx() {
        format!("function: builtin: 0x{:08x}", n.index())
    } else if let Some(t) = v.as_thread_idx() {
        format!("thread: 0x{t:08x}")
    } else if let Some(u) = v.as_userdata_idx() {
        format!("userdata: 0x{:08x}", u.index())
    } else {
        "unknown".to_string()
    }
}

/// Render a chunk name the way error messages expect: `=name` strips the
/// marker, `@file` strips to the file name, anything else is quoted source
/// text.
pub fn format_source_name(source: &[u8]) -> String {
    match source.first() {
        Some(b'=') | Some(b'@') => String::from_utf8_lossy(&source[1..]).into_owned(),
        _ => {
            let text = String::from_utf8_lossy(source);
            let first_line = text.lines().next().unwrap_or("");
            let truncated = first_line.chars().count() > 45 || text.lines().count() > 1;
            let mut snippet: String = first_line.chars().take(45).collect();
            if truncated {
                snippet.push_str("...");
            }
            format!("[string \"{snippet}\"]")
        }
    }
}

// --- Plain natives ---
//
// These run outside the dispatch loop and only see heap, strings, and args.
// Builtins that need more (pcall, the coroutine family, hooks) are
// registered with `special_stub` and intercepted by dispatch.

fn special_stub(_ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    Err(NativeError::from("builtin must be called from Lua code"))
}

fn arg(ctx: &NativeContext, i: usize) -> Value {
    ctx.args.get(i).copied().unwrap_or_else(Value::nil)
}

fn native_type(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    if ctx.args.is_empty() {
        return Err(NativeError::from("bad argument #1 to 'type' (value expected)"));
    }
    let name = lua_type_name(ctx.args[0]);
    Ok(vec![Value::from_string_id(ctx.strings.intern(name.as_bytes()))])
}

fn native_tonumber(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let v = arg(ctx, 0);
    let base_arg = arg(ctx, 1);
    if base_arg.is_nil() {
        let result = match coerce::to_number(v, ctx.strings) {
            Some(n) => Value::from_number(n),
            None => Value::nil(),
        };
        return Ok(vec![result]);
    }
    let base = base_arg
        .as_number()
        .ok_or_else(|| NativeError::from("bad argument #2 to 'tonumber' (number expected)"))?;
    if base.trunc() != base || !(2.0..=36.0).contains(&base) {
        return Err(NativeError::from(
            "bad argument #2 to 'tonumber' (base out of range)",
        ));
    }
    let base = base as u32;
    let sid = v
        .as_string_id()
        .ok_or_else(|| NativeError::from("bad argument #1 to 'tonumber' (string expected)"))?;
    let text = ctx.strings.get_bytes(sid).to_vec();
    let text = match std::str::from_utf8(&text) {
        Ok(t) => t.trim_matches(|c: char| c.is_ascii_whitespace()),
        Err(_) => return Ok(vec![Value::nil()]),
    };
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    if digits.is_empty() {
        return Ok(vec![Value::nil()]);
    }
    let mut value = 0.0f64;
    for c in digits.chars() {
        match c.to_digit(base) {
            Some(d) => value = value * base as f64 + d as f64,
            None => return Ok(vec![Value::nil()]),
        }
    }
    if negative {
        value = -value;
    }
    Ok(vec![Value::from_number(value)])
}

fn native_error(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    Err(NativeError::Value(arg(ctx, 0)))
}

fn native_assert(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    if arg(ctx, 0).is_truthy() {
        return Ok(ctx.args.to_vec());
    }
    match ctx.args.get(1) {
        Some(&msg) => Err(NativeError::Value(msg)),
        None => Err(NativeError::from("assertion failed!")),
    }
}

fn native_select(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let selector = arg(ctx, 0);
    let rest = ctx.args.get(1..).unwrap_or(&[]);
    if let Some(sid) = selector.as_string_id() {
        if ctx.strings.get_bytes(sid) == b"#" {
            return Ok(vec![Value::from_number(rest.len() as f64)]);
        }
    }
    let n = selector
        .as_number()
        .ok_or_else(|| NativeError::from("bad argument #1 to 'select' (number expected)"))?;
    if n.trunc() != n || n == 0.0 {
        return Err(NativeError::from(
            "bad argument #1 to 'select' (index out of range)",
        ));
    }
    let start = if n > 0.0 {
        n as usize
    } else {
        let back = (-n) as usize;
        if back > rest.len() {
            return Err(NativeError::from(
                "bad argument #1 to 'select' (index out of range)",
            ));
        }
        rest.len() - back + 1
    };
    if start > rest.len() {
        return Ok(Vec::new());
    }
    Ok(rest[start - 1..].to_vec())
}

fn native_rawget(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let t = arg(ctx, 0)
        .as_table_idx()
        .ok_or_else(|| NativeError::from("bad argument #1 to 'rawget' (table expected)"))?;
    Ok(vec![ctx.heap.get_table(t).raw_get(arg(ctx, 1))])
}

fn native_rawset(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let tv = arg(ctx, 0);
    let t = tv
        .as_table_idx()
        .ok_or_else(|| NativeError::from("bad argument #1 to 'rawset' (table expected)"))?;
    let key = arg(ctx, 1);
    let val = arg(ctx, 2);
    ctx.heap
        .get_table_mut(t)
        .raw_set(key, val)
        .map_err(NativeError::from)?;
    Ok(vec![tv])
}

fn native_rawequal(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let (eq, _) = crate::compare::lua_eq(arg(ctx, 0), arg(ctx, 1), ctx.strings);
    Ok(vec![Value::from_bool(eq)])
}

fn native_rawlen(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let v = arg(ctx, 0);
    if let Some(t) = v.as_table_idx() {
        return Ok(vec![Value::from_number(ctx.heap.get_table(t).length() as f64)]);
    }
    if let Some(sid) = v.as_string_id() {
        return Ok(vec![Value::from_number(ctx.strings.get_bytes(sid).len() as f64)]);
    }
    Err(NativeError::from("table or string expected"))
}

fn native_setmetatable(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let tv = arg(ctx, 0);
    let t = tv
        .as_table_idx()
        .ok_or_else(|| NativeError::from("bad argument #1 to 'setmetatable' (table expected)"))?;
    let mt_val = arg(ctx, 1);
    let new_mt = if mt_val.is_nil() {
        None
    } else {
        Some(mt_val.as_table_idx().ok_or_else(|| {
            NativeError::from("bad argument #2 to 'setmetatable' (nil or table expected)")
        })?)
    };
    let protected = ctx.strings.intern(b"__metatable");
    if let Some(cur) = ctx.heap.get_table(t).metatable {
        if !ctx.heap.get_table(cur).raw_get_str(protected).is_nil() {
            return Err(NativeError::from("cannot change a protected metatable"));
        }
    }
    ctx.heap.get_table_mut(t).metatable = new_mt;
    Ok(vec![tv])
}

fn native_getmetatable(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let v = arg(ctx, 0);
    let mt = crate::metamethod::get_metatable(v, ctx.heap);
    match mt {
        None => Ok(vec![Value::nil()]),
        Some(mt) => {
            let protected = ctx.strings.intern(b"__metatable");
            let guard = ctx.heap.get_table(mt).raw_get_str(protected);
            if guard.is_nil() {
                Ok(vec![Value::from_table(mt)])
            } else {
                Ok(vec![guard])
            }
        }
    }
}

fn native_next(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let t = arg(ctx, 0)
        .as_table_idx()
        .ok_or_else(|| NativeError::from("bad argument #1 to 'next' (table expected)"))?;
    match ctx.heap.get_table(t).next(arg(ctx, 1)) {
        Ok(Some((k, v))) => Ok(vec![k, v]),
        Ok(None) => Ok(vec![Value::nil()]),
        Err(()) => Err(NativeError::from("invalid key to 'next'")),
    }
}

fn native_ipairs_iter(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let t = arg(ctx, 0)
        .as_table_idx()
        .ok_or_else(|| NativeError::from("bad argument #1 to 'ipairs' (table expected)"))?;
    let i = arg(ctx, 1).as_number().unwrap_or(0.0) as i64 + 1;
    let v = ctx.heap.get_table(t).raw_get_int(i);
    if v.is_nil() {
        Ok(vec![Value::nil()])
    } else {
        Ok(vec![Value::from_number(i as f64), v])
    }
}
