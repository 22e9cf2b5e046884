use super::helpers::*;

#[test]
fn test_yield_twice_then_return() {
    run_check_bools(
        r#"
        local co = coroutine.create(function()
            coroutine.yield(1)
            coroutine.yield(2)
            return 3
        end)
        local ok1, v1 = coroutine.resume(co)
        local ok2, v2 = coroutine.resume(co)
        local ok3, v3 = coroutine.resume(co)
        local ok4, err = coroutine.resume(co)
        return ok1 and v1 == 1, ok2 and v2 == 2, ok3 and v3 == 3,
               not ok4 and err == "cannot resume dead coroutine"
        "#,
        &[true, true, true, true],
    );
}

#[test]
fn test_immediate_return() {
    run_check_nums(
        r#"
        local co = coroutine.create(function() return 42 end)
        local ok, v = coroutine.resume(co)
        return v
        "#,
        &[42.0],
    );
}

#[test]
fn test_resume_args_become_body_args() {
    run_check_nums(
        r#"
        local co = coroutine.create(function(a, b) return a + b end)
        local ok, v = coroutine.resume(co, 3, 4)
        return v
        "#,
        &[7.0],
    );
}

#[test]
fn test_resume_args_become_yield_results() {
    run_check_nums(
        r#"
        local co = coroutine.create(function()
            local got = coroutine.yield(1)
            return got * 2
        end)
        coroutine.resume(co)
        local ok, v = coroutine.resume(co, 21)
        return v
        "#,
        &[42.0],
    );
}

#[test]
fn test_yield_multiple_values() {
    run_check_nums(
        r#"
        local co = coroutine.create(function() coroutine.yield(1, 2, 3) end)
        local ok, a, b, c = coroutine.resume(co)
        return a, b, c
        "#,
        &[1.0, 2.0, 3.0],
    );
}

#[test]
fn test_status_transitions() {
    run_check_strings(
        r#"
        local st = {}
        local co
        co = coroutine.create(function()
            st[#st + 1] = coroutine.status(co)
            coroutine.yield()
        end)
        st[#st + 1] = coroutine.status(co)
        coroutine.resume(co)
        st[#st + 1] = coroutine.status(co)
        coroutine.resume(co)
        st[#st + 1] = coroutine.status(co)
        return st[1], st[2], st[3], st[4]
        "#,
        &["suspended", "running", "suspended", "dead"],
    );
}

#[test]
fn test_status_normal_for_resumer() {
    run_check_strings(
        r#"
        local outer
        local inner = coroutine.create(function()
            return coroutine.status(outer)
        end)
        outer = coroutine.create(function()
            local ok, st = coroutine.resume(inner)
            return st
        end)
        local ok, st = coroutine.resume(outer)
        return st
        "#,
        &["normal"],
    );
}

#[test]
fn test_error_inside_coroutine_kills_it() {
    run_check_bools(
        r#"
        local co = coroutine.create(function() error("inside") end)
        local ok, msg = coroutine.resume(co)
        return not ok, msg == "inside", coroutine.status(co) == "dead"
        "#,
        &[true, true, true],
    );
}

#[test]
fn test_resume_running_coroutine_fails() {
    run_check_strings(
        r#"
        local co
        co = coroutine.create(function()
            local ok, err = coroutine.resume(co)
            return err
        end)
        local ok, err = coroutine.resume(co)
        return err
        "#,
        &["cannot resume non-suspended coroutine"],
    );
}

#[test]
fn test_producer_consumer() {
    run_check_nums(
        r#"
        local producer = coroutine.create(function()
            for i = 1, 5 do coroutine.yield(i) end
        end)
        local total = 0
        while true do
            local ok, v = coroutine.resume(producer)
            if not v then break end
            total = total + v
        end
        return total
        "#,
        &[15.0],
    );
}

#[test]
fn test_yield_from_nested_function() {
    // Yield propagates through plain Lua frames inside the coroutine.
    run_check_nums(
        r#"
        local function helper() coroutine.yield(9) end
        local co = coroutine.create(function() helper() return 10 end)
        local ok1, a = coroutine.resume(co)
        local ok2, b = coroutine.resume(co)
        return a, b
        "#,
        &[9.0, 10.0],
    );
}

#[test]
fn test_yield_across_pcall() {
    run_check_bools(
        r#"
        local co = coroutine.create(function()
            local ok, err = pcall(function()
                coroutine.yield(1)
                error("late")
            end)
            return ok, err
        end)
        local ok1, v = coroutine.resume(co)
        local ok2, bodyok, bodyerr = coroutine.resume(co)
        return ok1 and v == 1, ok2, bodyok == false, bodyerr == "late"
        "#,
        &[true, true, true, true],
    );
}

#[test]
fn test_yield_from_main_errors() {
    let err = run_lua_err("coroutine.yield(1)");
    assert!(err.contains("outside a coroutine"), "got: {err}");
}

#[test]
fn test_wrap_returns_values_directly() {
    run_check_nums(
        r#"
        local gen = coroutine.wrap(function()
            coroutine.yield(1)
            coroutine.yield(2)
            return 3
        end)
        return gen(), gen(), gen()
        "#,
        &[1.0, 2.0, 3.0],
    );
}

#[test]
fn test_wrap_propagates_errors() {
    run_check_bools(
        r#"
        local f = coroutine.wrap(function() error("wrapped") end)
        local ok, msg = pcall(f)
        return ok, msg == "wrapped"
        "#,
        &[false, true],
    );
}

#[test]
fn test_wrap_dead_call_errors() {
    run_check_bools(
        r#"
        local f = coroutine.wrap(function() end)
        f()
        local ok, msg = pcall(f)
        return ok, msg == "cannot resume dead coroutine"
        "#,
        &[false, true],
    );
}

#[test]
fn test_isyieldable() {
    run_check_bools(
        r#"
        local inner
        local co = coroutine.create(function() inner = coroutine.isyieldable() end)
        coroutine.resume(co)
        return coroutine.isyieldable(), inner
        "#,
        &[false, true],
    );
}

#[test]
fn test_running_reports_main_flag() {
    run_check_bools(
        r#"
        local _, main_here = coroutine.running()
        local inside
        local co = coroutine.create(function()
            local _, m = coroutine.running()
            inside = m
        end)
        coroutine.resume(co)
        return main_here, inside
        "#,
        &[true, false],
    );
}

#[test]
fn test_running_identifies_current_coroutine() {
    run_check_bools(
        r#"
        local co
        co = coroutine.create(function()
            return coroutine.running() == co
        end)
        local ok, same = coroutine.resume(co)
        return same
        "#,
        &[true],
    );
}

#[test]
fn test_nested_coroutines() {
    run_check_nums(
        r#"
        local inner = coroutine.create(function()
            coroutine.yield(100)
        end)
        local outer = coroutine.create(function()
            local ok, v = coroutine.resume(inner)
            coroutine.yield(v + 1)
        end)
        local ok, v = coroutine.resume(outer)
        return v
        "#,
        &[101.0],
    );
}

#[test]
fn test_yield_inside_index_metamethod() {
    run_check_bools(
        r#"
        local t = setmetatable({}, { __index = function(_, k)
            coroutine.yield("asked", k)
            return k .. "!"
        end })
        local co = coroutine.create(function() return t.x end)
        local ok1, ev, key = coroutine.resume(co)
        local ok2, v = coroutine.resume(co)
        return ok1 and ev == "asked" and key == "x", ok2 and v == "x!"
        "#,
        &[true, true],
    );
}

#[test]
fn test_yield_inside_generic_for_iterator() {
    run_check_nums(
        r#"
        local function iter(t, i)
            i = i + 1
            if t[i] then
                coroutine.yield()
                return i, t[i]
            end
        end
        local co = coroutine.create(function()
            local sum = 0
            for _, v in iter, {10, 20}, 0 do sum = sum + v end
            return sum
        end)
        coroutine.resume(co)
        coroutine.resume(co)
        local ok, sum = coroutine.resume(co)
        return sum
        "#,
        &[30.0],
    );
}

#[test]
fn test_yield_inside_add_metamethod() {
    // The resume argument feeds back into the suspended handler, and its
    // result still lands in the destination register.
    run_check_nums(
        r#"
        local mt = { __add = function(x, y)
            local extra = coroutine.yield(x.v + y.v)
            return x.v + y.v + extra
        end }
        local a = setmetatable({ v = 3 }, mt)
        local b = setmetatable({ v = 4 }, mt)
        local co = coroutine.create(function() return a + b end)
        local ok1, partial = coroutine.resume(co)
        local ok2, total = coroutine.resume(co, 10)
        return partial, total
        "#,
        &[7.0, 17.0],
    );
}

#[test]
fn test_yield_inside_call_metamethod() {
    run_check_nums(
        r#"
        local callable = setmetatable({}, { __call = function(self, n)
            coroutine.yield(n)
            return n * 2
        end })
        local co = coroutine.create(function() return callable(5) end)
        local ok1, first = coroutine.resume(co)
        local ok2, second = coroutine.resume(co)
        return first, second
        "#,
        &[5.0, 10.0],
    );
}

#[test]
fn test_yield_inside_lt_metamethod() {
    run_check_bools(
        r#"
        local mt = { __lt = function(x, y)
            coroutine.yield()
            return x.v < y.v
        end }
        local a = setmetatable({ v = 1 }, mt)
        local b = setmetatable({ v = 2 }, mt)
        local co = coroutine.create(function() return a < b, b < a end)
        coroutine.resume(co)
        coroutine.resume(co)
        local ok, lt1, lt2 = coroutine.resume(co)
        return lt1, lt2
        "#,
        &[true, false],
    );
}

#[test]
fn test_yield_inside_concat_metamethod() {
    run_check_strings(
        r#"
        local mt = { __concat = function(x, y)
            coroutine.yield()
            if type(x) == "table" then x = x.s end
            if type(y) == "table" then y = y.s end
            return x .. y
        end }
        local w = setmetatable({ s = "mid" }, mt)
        local co = coroutine.create(function() return "a" .. w .. "z" end)
        coroutine.resume(co)
        local ok, s = coroutine.resume(co)
        return s
        "#,
        &["amidz"],
    );
}

#[test]
fn test_resume_non_coroutine_errors() {
    run_check_bools(
        r#"
        local ok = pcall(coroutine.resume, 42)
        return ok
        "#,
        &[false],
    );
}
