use super::helpers::*;

#[test]
fn test_counter_closure() {
    run_check_nums(
        r#"
        local function counter()
            local n = 0
            return function() n = n + 1 return n end
        end
        local c = counter()
        return c(), c(), c()
        "#,
        &[1.0, 2.0, 3.0],
    );
}

#[test]
fn test_independent_counters() {
    run_check_nums(
        r#"
        local function counter()
            local n = 0
            return function() n = n + 1 return n end
        end
        local a, b = counter(), counter()
        a() a()
        return a(), b()
        "#,
        &[3.0, 1.0],
    );
}

#[test]
fn test_two_closures_share_one_upvalue() {
    // Both closures capture the same variable, not copies of it.
    run_check_nums(
        r#"
        local function make()
            local x = 0
            local function inc() x = x + 1 end
            local function get() return x end
            return inc, get
        end
        local inc, get = make()
        inc() inc() inc()
        return get()
        "#,
        &[3.0],
    );
}

#[test]
fn test_upvalue_closes_when_scope_exits() {
    run_check_nums(
        r#"
        local fns = {}
        for i = 1, 3 do
            fns[i] = function() return i end
        end
        return fns[1](), fns[2](), fns[3]()
        "#,
        &[1.0, 2.0, 3.0],
    );
}

#[test]
fn test_write_through_closed_upvalue() {
    run_check_nums(
        r#"
        local function make()
            local x = 10
            return function(v) x = v end, function() return x end
        end
        local set, get = make()
        set(42)
        return get()
        "#,
        &[42.0],
    );
}

#[test]
fn test_nested_closures_reach_outer_locals() {
    run_check_nums(
        r#"
        local function outer()
            local a = 1
            return function()
                local b = 2
                return function() return a + b end
            end
        end
        return outer()()()
        "#,
        &[3.0],
    );
}

#[test]
fn test_upvalue_visible_across_coroutine() {
    run_check_nums(
        r#"
        local x = 0
        local co = coroutine.create(function() x = x + 5 end)
        coroutine.resume(co)
        return x
        "#,
        &[5.0],
    );
}
