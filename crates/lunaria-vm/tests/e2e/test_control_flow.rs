use super::helpers::*;

// ---- if / elseif / else ----

#[test]
fn test_if_branches() {
    run_check_nums(
        r#"
        local function pick(n)
            if n < 0 then return -1
            elseif n == 0 then return 0
            else return 1 end
        end
        return pick(-5), pick(0), pick(9)
        "#,
        &[-1.0, 0.0, 1.0],
    );
}

#[test]
fn test_and_or_short_circuit() {
    run_check_nums("return 1 and 2, nil and 2 or 3, false or 4", &[2.0, 3.0, 4.0]);
}

#[test]
fn test_not() {
    run_check_bools("return not nil, not false, not 0, not ''", &[true, true, false, false]);
}

// ---- while / repeat ----

#[test]
fn test_while_loop() {
    run_check_nums(
        r#"
        local i, sum = 1, 0
        while i <= 10 do sum = sum + i i = i + 1 end
        return sum
        "#,
        &[55.0],
    );
}

#[test]
fn test_while_break() {
    run_check_nums(
        r#"
        local i = 0
        while true do
            i = i + 1
            if i == 7 then break end
        end
        return i
        "#,
        &[7.0],
    );
}

#[test]
fn test_repeat_until() {
    run_check_nums(
        r#"
        local i = 0
        repeat i = i + 1 until i >= 5
        return i
        "#,
        &[5.0],
    );
}

#[test]
fn test_repeat_sees_block_locals() {
    // The until condition is inside the loop body's scope.
    run_check_nums(
        r#"
        local n = 0
        repeat
            local done = n >= 3
            n = n + 1
        until done
        return n
        "#,
        &[4.0],
    );
}

// ---- numeric for ----

#[test]
fn test_numeric_for_sum() {
    run_check_nums("local s = 0 for i = 1, 100 do s = s + i end return s", &[5050.0]);
}

#[test]
fn test_numeric_for_step() {
    run_check_nums("local s = 0 for i = 0, 10, 2 do s = s + i end return s", &[30.0]);
}

#[test]
fn test_numeric_for_negative_step() {
    run_check_nums(
        "local t = {} for i = 3, 1, -1 do t[#t + 1] = i end return t[1], t[2], t[3]",
        &[3.0, 2.0, 1.0],
    );
}

#[test]
fn test_numeric_for_fractional_step() {
    run_check_nums("local n = 0 for i = 0, 1, 0.25 do n = n + 1 end return n", &[5.0]);
}

#[test]
fn test_numeric_for_zero_iterations() {
    run_check_nums("local n = 0 for i = 5, 1 do n = n + 1 end return n", &[0.0]);
}

#[test]
fn test_numeric_for_string_bounds_coerce() {
    run_check_nums(r#"local s = 0 for i = "1", "3" do s = s + i end return s"#, &[6.0]);
}

#[test]
fn test_numeric_for_zero_step_errors() {
    let err = run_lua_err("for i = 1, 10, 0 do end");
    assert!(err.contains("'for' step"), "got: {err}");
}

#[test]
fn test_numeric_for_bad_limit_errors() {
    let err = run_lua_err("for i = 1, {} do end");
    assert!(err.contains("'for' limit"), "got: {err}");
}

#[test]
fn test_nested_loops_with_break() {
    run_check_nums(
        r#"
        local hits = 0
        for i = 1, 3 do
            for j = 1, 3 do
                if j == 2 then break end
                hits = hits + 1
            end
        end
        return hits
        "#,
        &[3.0],
    );
}

// ---- generic for ----

#[test]
fn test_generic_for_ipairs() {
    run_check_nums(
        r#"
        local s = 0
        for i, v in ipairs({2, 4, 6}) do s = s + i * v end
        return s
        "#,
        &[28.0],
    );
}

#[test]
fn test_generic_for_pairs_counts_all_keys() {
    run_check_nums(
        r#"
        local t = {x = 1, y = 2, [1] = 3}
        local n = 0
        for k, v in pairs(t) do n = n + 1 end
        return n
        "#,
        &[3.0],
    );
}

#[test]
fn test_ipairs_stops_at_hole() {
    run_check_nums(
        r#"
        local t = {1, 2, nil, 4}
        local n = 0
        for i in ipairs(t) do n = i end
        return n
        "#,
        &[2.0],
    );
}

#[test]
fn test_generic_for_custom_iterator() {
    run_check_nums(
        r#"
        local function range(n)
            local i = 0
            return function()
                i = i + 1
                if i <= n then return i end
            end
        end
        local s = 0
        for v in range(4) do s = s + v end
        return s
        "#,
        &[10.0],
    );
}
