use super::helpers::*;

#[test]
fn test_call_hook_counts_lua_calls() {
    run_check_nums(
        r#"
        local calls = 0
        debug.sethook(function(ev) if ev == "call" then calls = calls + 1 end end, "c")
        local function a() end
        local function b() end
        a() b() a()
        debug.sethook()
        return calls
        "#,
        &[3.0],
    );
}

#[test]
fn test_return_hook_fires() {
    run_check_nums(
        r#"
        local returns = 0
        debug.sethook(function(ev) if ev == "return" then returns = returns + 1 end end, "r")
        local function f() end
        f() f()
        debug.sethook()
        return returns
        "#,
        &[2.0],
    );
}

#[test]
fn test_line_hook_sees_line_numbers() {
    run_check_bools(
        r#"
        local lines = 0
        local last = 0
        debug.sethook(function(ev, l)
            if ev == "line" then lines = lines + 1 last = l end
        end, "l")
        local x = 1
        local y = 2
        local z = x + y
        debug.sethook()
        return lines >= 3, last > 0
        "#,
        &[true, true],
    );
}

#[test]
fn test_count_hook_fires_during_loop() {
    run_check_bools(
        r#"
        local ticks = 0
        debug.sethook(function(ev) if ev == "count" then ticks = ticks + 1 end end, "", 10)
        for i = 1, 200 do end
        debug.sethook()
        return ticks > 0
        "#,
        &[true],
    );
}

#[test]
fn test_hook_does_not_reenter_itself() {
    // The hook body makes calls of its own; those must not fire the hook.
    run_check_nums(
        r#"
        local calls = 0
        local function noise() end
        debug.sethook(function(ev)
            if ev == "call" then calls = calls + 1 noise() end
        end, "c")
        local function f() end
        f()
        debug.sethook()
        return calls
        "#,
        &[1.0],
    );
}

#[test]
fn test_gethook_reports_settings() {
    run_check_bools(
        r#"
        local f = function() end
        debug.sethook(f, "cr")
        local hf, mask, count = debug.gethook()
        debug.sethook()
        local cleared = debug.gethook()
        return hf == f, mask == "cr", count == 0, cleared == nil
        "#,
        &[true, true, true, true],
    );
}

#[test]
fn test_clearing_hook_stops_events() {
    run_check_nums(
        r#"
        local calls = 0
        debug.sethook(function(ev) if ev == "call" then calls = calls + 1 end end, "c")
        local function f() end
        f()
        debug.sethook()
        f() f()
        return calls
        "#,
        &[1.0],
    );
}

#[test]
fn test_error_in_hook_propagates() {
    let err = run_lua_err(
        r#"
        debug.sethook(function() error("hook blew up") end, "c")
        local function f() end
        f()
        "#,
    );
    assert!(err.contains("hook blew up") || err.contains("error object"), "got: {err}");
}
