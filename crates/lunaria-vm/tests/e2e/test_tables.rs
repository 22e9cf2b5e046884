use super::helpers::*;

#[test]
fn test_fill_and_read() {
    run_check_nums(
        r#"
        local t = {}
        for i = 1, 5 do t[i] = i * i end
        return t[3]
        "#,
        &[9.0],
    );
}

#[test]
fn test_constructor_forms() {
    run_check_nums(
        r#"
        local t = {10, 20, x = 30, ["y"] = 40, [99] = 50}
        return t[1], t[2], t.x, t.y, t[99]
        "#,
        &[10.0, 20.0, 30.0, 40.0, 50.0],
    );
}

#[test]
fn test_missing_key_is_nil() {
    let r = run_lua("local t = {} return t.missing, t[12]");
    assert_nil(&r, 0);
    assert_nil(&r, 1);
}

#[test]
fn test_assignment_to_nil_removes_key() {
    run_check_nums(
        r#"
        local t = {x = 1}
        t.x = nil
        local n = 0
        for k in pairs(t) do n = n + 1 end
        return n
        "#,
        &[0.0],
    );
}

#[test]
fn test_float_key_normalizes_to_integer() {
    run_check_nums("local t = {} t[2.0] = 7 return t[2]", &[7.0]);
}

#[test]
fn test_nil_key_errors() {
    let err = run_lua_err("local t = {} t[nil] = 1");
    assert!(err.contains("nil"), "got: {err}");
}

#[test]
fn test_nan_key_errors() {
    let err = run_lua_err("local t = {} t[0/0] = 1");
    assert!(err.to_lowercase().contains("nan"), "got: {err}");
}

#[test]
fn test_length_after_appends() {
    run_check_nums(
        r#"
        local t = {}
        for i = 1, 4 do t[#t + 1] = i end
        return #t
        "#,
        &[4.0],
    );
}

#[test]
fn test_next_walks_every_pair() {
    run_check_nums(
        r#"
        local t = {a = 1, b = 2, c = 3}
        local sum = 0
        local k, v = next(t)
        while k do
            sum = sum + v
            k, v = next(t, k)
        end
        return sum
        "#,
        &[6.0],
    );
}

#[test]
fn test_next_on_empty_table() {
    let r = run_lua("return next({})");
    assert_nil(&r, 0);
}

// ---- raw access ----

#[test]
fn test_rawget_skips_index_metamethod() {
    let r = run_lua(
        r#"
        local t = setmetatable({}, {__index = function() return 99 end})
        return t.x, rawget(t, "x")
        "#,
    );
    assert_num(&r, 0, 99.0);
    assert_nil(&r, 1);
}

#[test]
fn test_rawset_skips_newindex_metamethod() {
    run_check_nums(
        r#"
        local log = 0
        local t = setmetatable({}, {__newindex = function() log = log + 1 end})
        rawset(t, "x", 5)
        return t.x, log
        "#,
        &[5.0, 0.0],
    );
}

#[test]
fn test_rawequal_ignores_eq_metamethod() {
    run_check_bools(
        r#"
        local mt = {__eq = function() return true end}
        local a = setmetatable({}, mt)
        local b = setmetatable({}, mt)
        return a == b, rawequal(a, b), rawequal(a, a)
        "#,
        &[true, false, true],
    );
}

#[test]
fn test_rawlen() {
    run_check_nums(
        r#"
        local t = setmetatable({1, 2}, {__len = function() return 100 end})
        return #t, rawlen(t), rawlen("abc")
        "#,
        &[100.0, 2.0, 3.0],
    );
}

// ---- metatable management ----

#[test]
fn test_setmetatable_returns_table() {
    run_check_nums(
        r#"
        local t = setmetatable({}, {__index = {x = 3}})
        return t.x
        "#,
        &[3.0],
    );
}

#[test]
fn test_getmetatable_roundtrip() {
    run_check_bools(
        r#"
        local mt = {}
        local t = setmetatable({}, mt)
        return getmetatable(t) == mt, getmetatable({}) == nil
        "#,
        &[true, true],
    );
}

#[test]
fn test_metatable_field_shields_metatable() {
    run_check_strings(
        r#"
        local t = setmetatable({}, {__metatable = "locked"})
        return getmetatable(t)
        "#,
        &["locked"],
    );
}

#[test]
fn test_protected_metatable_cannot_change() {
    let err = run_lua_err(
        r#"
        local t = setmetatable({}, {__metatable = "locked"})
        setmetatable(t, {})
        "#,
    );
    assert!(err.contains("protected metatable"), "got: {err}");
}

#[test]
fn test_clear_metatable_with_nil() {
    run_check_bools(
        r#"
        local t = setmetatable({}, {})
        setmetatable(t, nil)
        return getmetatable(t) == nil
        "#,
        &[true],
    );
}
