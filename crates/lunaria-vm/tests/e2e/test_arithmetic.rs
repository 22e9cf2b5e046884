use super::helpers::*;

// ---- operators and precedence ----

#[test]
fn test_precedence() {
    run_check_nums("return 1 + 2 * 3", &[7.0]);
}

#[test]
fn test_parentheses() {
    run_check_nums("return (1 + 2) * 3", &[9.0]);
}

#[test]
fn test_subtraction_division() {
    run_check_nums("return 10 - 4, 7 / 2", &[6.0, 3.5]);
}

#[test]
fn test_power_right_associative() {
    run_check_nums("return 2 ^ 3 ^ 2", &[512.0]);
}

#[test]
fn test_unary_minus() {
    run_check_nums("return -5, -(-3), - - 2", &[-5.0, 3.0, 2.0]);
}

#[test]
fn test_modulo_follows_divisor_sign() {
    run_check_nums("return 5 % 3, -5 % 3, 5 % -3", &[2.0, 1.0, -1.0]);
}

#[test]
fn test_float_division() {
    run_check_nums("return 1 / 2, 3 / 4 + 0.25", &[0.5, 1.0]);
}

// ---- string coercion ----

#[test]
fn test_string_coerces_in_arithmetic() {
    run_check_nums(r#"return 1 + "2""#, &[3.0]);
}

#[test]
fn test_string_coercion_both_sides() {
    run_check_nums(r#"return "10" * "4""#, &[40.0]);
}

#[test]
fn test_hex_string_coercion() {
    run_check_nums(r#"return "0x10" + 0"#, &[16.0]);
}

#[test]
fn test_whitespace_in_coerced_string() {
    run_check_nums(r#"return " 3 " + 1"#, &[4.0]);
}

#[test]
fn test_bad_string_does_not_coerce() {
    let err = run_lua_err(r#"return "abc" + 1"#);
    assert!(err.contains("arithmetic"), "got: {err}");
}

#[test]
fn test_table_arithmetic_errors() {
    let err = run_lua_err("return {} + 1");
    assert!(err.contains("arithmetic"), "got: {err}");
    assert!(err.contains("table"), "got: {err}");
}

#[test]
fn test_nil_arithmetic_errors() {
    let err = run_lua_err("return nil + 1");
    assert!(err.contains("arithmetic"), "got: {err}");
}

// ---- concatenation ----

#[test]
fn test_concat_strings() {
    run_check_strings(r#"return "foo" .. "bar""#, &["foobar"]);
}

#[test]
fn test_concat_numbers() {
    run_check_strings(r#"return 1 .. 2, "n=" .. 42"#, &["12", "n=42"]);
}

#[test]
fn test_concat_chain() {
    run_check_strings(r#"return "a" .. "b" .. "c" .. "d""#, &["abcd"]);
}

#[test]
fn test_concat_nil_errors() {
    let err = run_lua_err(r#"return "x" .. nil"#);
    assert!(err.contains("concatenate"), "got: {err}");
    assert!(err.contains("nil"), "got: {err}");
}

// ---- length ----

#[test]
fn test_string_length() {
    run_check_nums(r#"return #"hello", #"""#, &[5.0, 0.0]);
}

#[test]
fn test_table_length() {
    run_check_nums("return #{10, 20, 30}", &[3.0]);
}

#[test]
fn test_length_of_number_errors() {
    let err = run_lua_err("return #42");
    assert!(err.contains("length"), "got: {err}");
}

// ---- comparison ----

#[test]
fn test_number_comparison() {
    run_check_bools("return 1 < 2, 2 <= 2, 3 > 4, 5 >= 5", &[true, true, false, true]);
}

#[test]
fn test_string_comparison_bytewise() {
    run_check_bools(
        r#"return "apple" < "banana", "abc" <= "abc", "b" < "ab""#,
        &[true, true, false],
    );
}

#[test]
fn test_equality_no_coercion() {
    run_check_bools(r#"return 1 == "1", nil == false, "a" == "a""#, &[false, false, true]);
}

#[test]
fn test_nan_inequality() {
    run_check_bools("local nan = 0/0 return nan == nan, nan ~= nan", &[false, true]);
}

#[test]
fn test_cross_type_comparison_errors() {
    let err = run_lua_err(r#"return 1 < "2""#);
    assert!(err.contains("compare"), "got: {err}");
}

// ---- tostring / tonumber formatting ----

#[test]
fn test_tostring_integral() {
    run_check_strings("return tostring(42), tostring(-7), tostring(0)", &["42", "-7", "0"]);
}

#[test]
fn test_tostring_fractional() {
    run_check_strings("return tostring(1.5), tostring(0.25)", &["1.5", "0.25"]);
}

#[test]
fn test_tostring_specials() {
    run_check_strings(
        "return tostring(1/0), tostring(-1/0), tostring(0/0)",
        &["inf", "-inf", "nan"],
    );
}

#[test]
fn test_tonumber() {
    run_check_nums(r#"return tonumber("42"), tonumber("1.5"), tonumber("0x1F")"#, &[42.0, 1.5, 31.0]);
}

#[test]
fn test_tonumber_failure_is_nil() {
    let r = run_lua(r#"return tonumber("zap"), tonumber({})"#);
    assert_nil(&r, 0);
    assert_nil(&r, 1);
}

#[test]
fn test_tonumber_with_base() {
    run_check_nums(r#"return tonumber("ff", 16), tonumber("101", 2), tonumber("z", 36)"#, &[255.0, 5.0, 35.0]);
}
