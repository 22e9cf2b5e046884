use super::helpers::*;
use lunaria_compiler::opcode::OpCode;
use lunaria_compiler::proto::Constant;
use proptest::prelude::*;

#[test]
fn e2e_fibonacci() {
    let src = r#"
local function fib(n)
    if n <= 1 then
        return n
    end
    return fib(n - 1) + fib(n - 2)
end
return fib(10)
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::Closure));
    assert_eq!(proto.protos.len(), 1);
    let fib = &proto.protos[0];
    assert!(has_opcode(fib, OpCode::Le) || has_opcode(fib, OpCode::Lt));
    assert!(has_opcode(fib, OpCode::Call));
}

#[test]
fn e2e_factorial() {
    let src = r#"
local function fact(n)
    if n <= 1 then return 1 end
    return n * fact(n - 1)
end
return fact(10)
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::Closure));
    assert!(has_opcode(&proto, OpCode::TailCall));
    assert!(has_opcode(&proto.protos[0], OpCode::Mul));
}

#[test]
fn e2e_counter_closure() {
    let src = r#"
local function make_counter()
    local count = 0
    return function()
        count = count + 1
        return count
    end
end
local c = make_counter()
return c()
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::Closure));
    // The inner function reads and writes the captured count
    let inner = &proto.protos[0].protos[0];
    assert!(has_opcode(inner, OpCode::GetUpval));
    assert!(has_opcode(inner, OpCode::SetUpval));
}

#[test]
fn e2e_nested_loops() {
    let src = r#"
for i = 1, 10 do
    for j = 1, 10 do
        local x = i
    end
end
"#;
    let (proto, _) = compile_str(src);
    assert_eq!(count_opcode(&proto, OpCode::ForPrep), 2);
    assert_eq!(count_opcode(&proto, OpCode::ForLoop), 2);
}

#[test]
fn e2e_table_operations() {
    let src = r#"
local t = {1, 2, 3}
t[4] = 4
local x = t[1]
t.name = "test"
local y = t.name
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::NewTable));
    assert!(has_opcode(&proto, OpCode::SetTable));
    assert!(has_opcode(&proto, OpCode::GetTable));
}

#[test]
fn e2e_control_flow() {
    let src = r#"
local x = 10
if x then
    x = 1
else
    x = 0
end
while x do
    x = nil
end
repeat
    x = true
until x
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::Test));
    assert!(has_opcode(&proto, OpCode::Jmp));
}

#[test]
fn e2e_all_return_forms() {
    let src = r#"
function f1() return end
function f2() return 1 end
function f3() return 1, 2, 3 end
"#;
    let (proto, _) = compile_str(src);
    assert_eq!(proto.protos.len(), 3);
    assert!(proto.protos[1]
        .code
        .iter()
        .any(|i| i.opcode() == OpCode::Return && i.b() == 2));
    assert!(proto.protos[2]
        .code
        .iter()
        .any(|i| i.opcode() == OpCode::Return && i.b() == 4));
}

#[test]
fn e2e_oop_style_tables() {
    let src = r#"
local Point = {}
function Point:magnitude()
    return self.x * self.x + self.y * self.y
end
local p = {x = 3, y = 4}
return Point.magnitude(p)
"#;
    let (proto, _) = compile_str(src);
    // Method definition takes an implicit self parameter
    assert_eq!(proto.protos[0].num_params, 1);
    assert!(has_opcode(&proto.protos[0], OpCode::GetTable));
}

#[test]
fn e2e_method_call() {
    let src = r#"
local obj = {}
function obj:get() return 1 end
return obj:get()
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::Self_));
}

#[test]
fn e2e_string_operations() {
    let src = r#"
local a = "hello"
local b = "world"
local c = a .. " " .. b
return c
"#;
    let (proto, _) = compile_str(src);
    assert_eq!(count_opcode(&proto, OpCode::Concat), 1);
}

#[test]
fn e2e_varargs_program() {
    let src = r#"
local function vfunc(...)
    return ...
end
return vfunc(1, 2, 3)
"#;
    let (proto, _) = compile_str(src);
    assert!(proto.protos[0].is_vararg);
    assert!(has_opcode(&proto.protos[0], OpCode::VarArg));
}

#[test]
fn e2e_goto_state_machine() {
    let src = r#"
local state = 1
::start::
if state then
    state = nil
    goto start
end
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::Jmp));
}

#[test]
fn e2e_break_nested() {
    let src = r#"
for i = 1, 10 do
    for j = 1, 10 do
        if j then
            break
        end
    end
end
"#;
    let (proto, _) = compile_str(src);
    assert_eq!(count_opcode(&proto, OpCode::ForPrep), 2);
    assert_eq!(count_opcode(&proto, OpCode::ForLoop), 2);
}

#[test]
fn e2e_generic_for_iteration() {
    let src = r#"
local sum = 0
for k, v in pairs({a = 1, b = 2}) do
    sum = sum + v
end
return sum
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::TForCall));
    assert!(has_opcode(&proto, OpCode::TForLoop));
}

#[test]
fn e2e_deeply_nested_functions() {
    let src = r#"
local a = 1
local function outer()
    local function middle()
        local function inner()
            return a
        end
        return inner
    end
    return middle
end
return outer
"#;
    let (proto, _) = compile_str(src);
    // Each level threads the capture of a through its upvalue list
    let inner = &proto.protos[0].protos[0].protos[0];
    assert!(has_opcode(inner, OpCode::GetUpval));
}

#[test]
fn e2e_every_proto_ends_with_return() {
    let src = r#"
local function f() end
local function g() return 1 end
for i = 1, 3 do local x = i end
"#;
    let (proto, _) = compile_str(src);
    all_protos(&proto, &mut |p| {
        let last = p.code.last().unwrap();
        assert_eq!(last.opcode(), OpCode::Return);
    });
}

proptest! {
    #[test]
    fn prop_locals_tracked_in_debug_info(n in 1usize..=50) {
        let mut src = String::new();
        for i in 0..n {
            src.push_str(&format!("local v{i} = {i}\n"));
        }
        let (proto, _) = compile_str(&src);
        prop_assert_eq!(proto.local_vars.len(), n);
    }

    #[test]
    fn prop_number_literal_roundtrip(v in 0.0f64..1e9) {
        let src = format!("return {v:?}");
        let (proto, _) = compile_str(&src);
        let found = proto
            .constants
            .iter()
            .any(|c| matches!(c, Constant::Number(n) if *n == v));
        prop_assert!(found);
    }

    #[test]
    fn prop_compile_never_panics_on_junk(src in "[a-z0-9 =(){}\\[\\].,;+\\-*/\"']{0,80}") {
        let _ = lunaria_compiler::compiler::compile(src.as_bytes(), "fuzz");
    }
}
