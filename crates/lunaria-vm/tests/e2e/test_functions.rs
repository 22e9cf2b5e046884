use super::helpers::*;

// ---- calls and returns ----

#[test]
fn test_multiple_returns() {
    run_check_nums(
        r#"
        local function f() return 1, 2, 3 end
        local a, b = f()
        return a, b
        "#,
        &[1.0, 2.0],
    );
}

#[test]
fn test_extra_targets_get_nil() {
    let r = run_lua(
        r#"
        local function f() return 1 end
        local a, b, c = f()
        return a, b, c
        "#,
    );
    assert_num(&r, 0, 1.0);
    assert_nil(&r, 1);
    assert_nil(&r, 2);
}

#[test]
fn test_call_in_middle_truncates_to_one() {
    // The call is truncated to one value; c stays nil.
    let r = run_lua(
        r#"
        local function f() return 1, 2, 3 end
        local a, b, c = f(), 10
        return a, b, c
        "#,
    );
    assert_eq!(r.len(), 3);
    assert_num(&r, 0, 1.0);
    assert_num(&r, 1, 10.0);
    assert_nil(&r, 2);
}

#[test]
fn test_call_at_end_expands() {
    run_check_nums(
        r#"
        local function f() return 2, 3 end
        return 1, f()
        "#,
        &[1.0, 2.0, 3.0],
    );
}

#[test]
fn test_parenthesized_call_truncates() {
    run_check_nums(
        r#"
        local function f() return 1, 2, 3 end
        return (f())
        "#,
        &[1.0],
    );
}

#[test]
fn test_missing_arguments_are_nil() {
    let r = run_lua(
        r#"
        local function f(a, b) return a, b end
        return f(7)
        "#,
    );
    assert_num(&r, 0, 7.0);
    assert_nil(&r, 1);
}

#[test]
fn test_extra_arguments_dropped() {
    run_check_nums(
        r#"
        local function f(a) return a end
        return f(1, 2, 3)
        "#,
        &[1.0],
    );
}

#[test]
fn test_recursion() {
    run_check_nums(
        r#"
        local function fib(n)
            if n < 2 then return n end
            return fib(n - 1) + fib(n - 2)
        end
        return fib(15)
        "#,
        &[610.0],
    );
}

#[test]
fn test_method_call_sugar() {
    run_check_nums(
        r#"
        local obj = {x = 5}
        function obj:get() return self.x end
        return obj:get()
        "#,
        &[5.0],
    );
}

#[test]
fn test_call_non_function_errors() {
    let err = run_lua_err("local x = 5 x()");
    assert!(err.contains("call"), "got: {err}");
    assert!(err.contains("number"), "got: {err}");
}

// ---- varargs ----

#[test]
fn test_vararg_forwarding() {
    run_check_nums(
        r#"
        local function f(...) return ... end
        return f(1, 2, 3)
        "#,
        &[1.0, 2.0, 3.0],
    );
}

#[test]
fn test_vararg_after_fixed_params() {
    run_check_nums(
        r#"
        local function f(a, ...) return a, ... end
        return f(10, 20, 30)
        "#,
        &[10.0, 20.0, 30.0],
    );
}

#[test]
fn test_select_count() {
    run_check_nums(
        r##"
        local function f(...) return select("#", ...) end
        return f(), f(1), f(1, nil, 3)
        "##,
        &[0.0, 1.0, 3.0],
    );
}

#[test]
fn test_select_from_index() {
    run_check_nums("return select(2, 10, 20, 30)", &[20.0, 30.0]);
}

#[test]
fn test_select_negative_index() {
    run_check_nums("return select(-1, 10, 20, 30)", &[30.0]);
}

#[test]
fn test_vararg_in_table_constructor() {
    run_check_nums(
        r#"
        local function f(...) return {...} end
        local t = f(5, 6, 7)
        return #t, t[2]
        "#,
        &[3.0, 6.0],
    );
}

// ---- tail calls ----

#[test]
fn test_tail_call_returns_callee_results() {
    run_check_nums(
        r#"
        local function inner() return 1, 2 end
        local function outer() return inner() end
        return outer()
        "#,
        &[1.0, 2.0],
    );
}

#[test]
fn test_tail_call_depth_is_bounded() {
    // A self tail call must reuse its frame, so a million iterations run in
    // constant stack.
    run_check_strings(
        r#"
        local function loop(n)
            if n == 0 then return "done" end
            return loop(n - 1)
        end
        return loop(1000000)
        "#,
        &["done"],
    );
}

#[test]
fn test_mutual_tail_recursion() {
    run_check_bools(
        r#"
        local is_even, is_odd
        is_even = function(n) if n == 0 then return true end return is_odd(n - 1) end
        is_odd = function(n) if n == 0 then return false end return is_even(n - 1) end
        return is_even(100000), is_odd(100001)
        "#,
        &[true, true],
    );
}

#[test]
fn test_non_tail_recursion_overflows() {
    let err = run_lua_err(
        r#"
        local function f(n) return 1 + f(n + 1) end
        return f(0)
        "#,
    );
    assert!(err.contains("stack overflow"), "got: {err}");
}
