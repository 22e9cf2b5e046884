use super::helpers::*;

// ---- __index ----

#[test]
fn test_index_table_fallback() {
    run_check_nums(
        r#"
        local base = {x = 1}
        local t = setmetatable({}, {__index = base})
        return t.x
        "#,
        &[1.0],
    );
}

#[test]
fn test_index_function_receives_table_and_key() {
    run_check_strings(
        r#"
        local t = setmetatable({}, {__index = function(tbl, k) return "got:" .. k end})
        return t.foo
        "#,
        &["got:foo"],
    );
}

#[test]
fn test_index_chain() {
    run_check_nums(
        r#"
        local grandparent = {x = 7}
        local parent = setmetatable({}, {__index = grandparent})
        local child = setmetatable({}, {__index = parent})
        return child.x
        "#,
        &[7.0],
    );
}

#[test]
fn test_raw_hit_wins_over_index() {
    run_check_nums(
        r#"
        local t = setmetatable({x = 1}, {__index = function() return 99 end})
        return t.x
        "#,
        &[1.0],
    );
}

#[test]
fn test_index_on_non_table_via_metamethod_absence() {
    let err = run_lua_err("local b = true return b.field");
    assert!(err.contains("index"), "got: {err}");
    assert!(err.contains("boolean"), "got: {err}");
}

// ---- __newindex ----

#[test]
fn test_newindex_function_intercepts_new_keys() {
    run_check_nums(
        r#"
        local log = {}
        local t = setmetatable({}, {__newindex = function(tbl, k, v) log[k] = v end})
        t.a = 5
        return log.a, rawget(t, "a") == nil and 1 or 0
        "#,
        &[5.0, 1.0],
    );
}

#[test]
fn test_newindex_skipped_for_existing_keys() {
    run_check_nums(
        r#"
        local hits = 0
        local t = setmetatable({a = 1}, {__newindex = function() hits = hits + 1 end})
        t.a = 2
        return t.a, hits
        "#,
        &[2.0, 0.0],
    );
}

#[test]
fn test_newindex_table_redirects_store() {
    run_check_nums(
        r#"
        local store = {}
        local t = setmetatable({}, {__newindex = store})
        t.x = 9
        return store.x
        "#,
        &[9.0],
    );
}

// ---- arithmetic metamethods ----

#[test]
fn test_add_receives_both_operands() {
    run_check_nums(
        r#"
        local mt = {__add = function(a, b) return a.v + b.v end}
        local x = setmetatable({v = 3}, mt)
        local y = setmetatable({v = 4}, mt)
        return x + y
        "#,
        &[7.0],
    );
}

#[test]
fn test_add_with_plain_number_operand() {
    run_check_nums(
        r#"
        local mt = {__add = function(a, b)
            if type(a) == "number" then return a + b.v end
            return a.v + b
        end}
        local x = setmetatable({v = 10}, mt)
        return x + 5, 5 + x
        "#,
        &[15.0, 15.0],
    );
}

#[test]
fn test_sub_mul_div_mod_pow_unm() {
    run_check_nums(
        r#"
        local mt = {
            __sub = function(a, b) return 1 end,
            __mul = function(a, b) return 2 end,
            __div = function(a, b) return 3 end,
            __mod = function(a, b) return 4 end,
            __pow = function(a, b) return 5 end,
            __unm = function(a) return 6 end,
        }
        local x = setmetatable({}, mt)
        return x - 1, x * 1, x / 1, x % 1, x ^ 1, -x
        "#,
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
    );
}

// ---- comparison metamethods ----

#[test]
fn test_eq_only_for_same_type_pairs() {
    run_check_bools(
        r#"
        local mt = {__eq = function() return true end}
        local a = setmetatable({}, mt)
        local b = setmetatable({}, mt)
        return a == b, a == 1
        "#,
        &[true, false],
    );
}

#[test]
fn test_lt_metamethod() {
    run_check_bools(
        r#"
        local mt = {__lt = function(a, b) return a.v < b.v end}
        local x = setmetatable({v = 1}, mt)
        local y = setmetatable({v = 2}, mt)
        return x < y, y < x
        "#,
        &[true, false],
    );
}

#[test]
fn test_le_falls_back_to_swapped_lt() {
    // No __le defined: a <= b must evaluate as not (b < a).
    run_check_bools(
        r#"
        local mt = {__lt = function(a, b) return a.v < b.v end}
        local x = setmetatable({v = 1}, mt)
        local y = setmetatable({v = 2}, mt)
        return x <= y, y <= x, x <= x
        "#,
        &[true, false, true],
    );
}

// ---- __call / __concat / __len / __tostring ----

#[test]
fn test_call_metamethod_prepends_callee() {
    run_check_nums(
        r#"
        local t = setmetatable({base = 100}, {
            __call = function(self, a, b) return self.base + a + b end,
        })
        return t(1, 2)
        "#,
        &[103.0],
    );
}

#[test]
fn test_concat_metamethod() {
    run_check_strings(
        r#"
        local mt = {__concat = function(a, b) return "glued" end}
        local t = setmetatable({}, mt)
        return t .. "x", "x" .. t
        "#,
        &["glued", "glued"],
    );
}

#[test]
fn test_len_metamethod() {
    run_check_nums(
        r#"
        local t = setmetatable({1, 2, 3}, {__len = function() return 42 end})
        return #t
        "#,
        &[42.0],
    );
}

#[test]
fn test_tostring_metamethod() {
    run_check_strings(
        r#"
        local t = setmetatable({}, {__tostring = function() return "custom" end})
        return tostring(t)
        "#,
        &["custom"],
    );
}

#[test]
fn test_tostring_must_return_string() {
    let err = run_lua_err(
        r#"
        local t = setmetatable({}, {__tostring = function() return {} end})
        return tostring(t)
        "#,
    );
    assert!(err.contains("__tostring"), "got: {err}");
}

// ---- __pairs / __ipairs ----

#[test]
fn test_pairs_metamethod_overrides_iteration() {
    run_check_nums(
        r#"
        local t = setmetatable({}, {__pairs = function(self)
            local i = 0
            return function()
                i = i + 1
                if i <= 3 then return i, i * 10 end
            end, self, nil
        end})
        local sum = 0
        for k, v in pairs(t) do sum = sum + v end
        return sum
        "#,
        &[60.0],
    );
}

#[test]
fn test_ipairs_metamethod_overrides_iteration() {
    run_check_nums(
        r#"
        local t = setmetatable({}, {__ipairs = function(self)
            local n = 0
            return function()
                n = n + 1
                if n <= 2 then return n, n end
            end, self, 0
        end})
        local sum = 0
        for i, v in ipairs(t) do sum = sum + v end
        return sum
        "#,
        &[3.0],
    );
}
