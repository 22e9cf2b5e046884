use super::helpers::*;

#[test]
fn e2e_error_unfinished_string() {
    let err = compile_str_err("local x = \"hello");
    assert!(err.contains("unfinished string"));
}

#[test]
fn e2e_error_unfinished_long_string() {
    let err = compile_str_err("local x = [[hello");
    assert!(err.contains("unfinished long string"));
}

#[test]
fn e2e_error_break_outside_loop() {
    let err = compile_str_err("break");
    assert!(err.contains("break") || err.contains("outside"));
}

#[test]
fn e2e_error_duplicate_label() {
    let err = compile_str_err("::x:: ::x::");
    assert!(err.contains("label 'x' already defined"));
}

#[test]
fn e2e_error_undefined_goto() {
    let err = compile_str_err("goto nowhere");
    assert!(err.contains("no visible label 'nowhere'"));
}

#[test]
fn e2e_error_goto_into_nested_block() {
    // A label in a nested block is not visible to an outer goto.
    let err = compile_str_err("goto inside\ndo local v = 1 ::inside:: end");
    assert!(err.contains("no visible label 'inside'"));
}

#[test]
fn e2e_error_goto_into_scope() {
    let err = compile_str_err("do goto l local v = 1 ::l:: print(v) end");
    assert!(err.contains("jumps into the scope of local 'v'"));
}

#[test]
fn e2e_error_unexpected_symbol() {
    let err = compile_str_err("return )");
    assert!(err.contains("unexpected symbol") || err.contains("expected"));
}

#[test]
fn e2e_error_malformed_number() {
    let err = compile_str_err("local x = 1e");
    assert!(err.contains("malformed number") || err.contains("expected"));
}

#[test]
fn e2e_error_invalid_escape() {
    let err = compile_str_err("local x = \"\\q\"");
    assert!(err.contains("invalid escape"));
}

#[test]
fn e2e_error_expected_end() {
    let err = compile_str_err("if true then");
    assert!(err.contains("expected") || err.contains("end"));
}

#[test]
fn e2e_error_expected_then() {
    let err = compile_str_err("if true do end");
    assert!(err.contains("'then' expected") || err.contains("expected"));
}

#[test]
fn e2e_error_for_missing_eq_or_in() {
    let err = compile_str_err("for i do end");
    assert!(err.contains("'=' or 'in' expected"));
}

#[test]
fn e2e_error_vararg_outside() {
    let err = compile_str_err("function f() return ... end");
    assert!(err.contains("vararg") || err.contains("..."));
}

#[test]
fn e2e_error_expression_not_statement() {
    let err = compile_str_err("42");
    assert!(err.contains("syntax error") || err.contains("unexpected"));
}

#[test]
fn e2e_error_name_expected() {
    let err = compile_str_err("local 5 = 1");
    assert!(err.contains("name expected"));
}

#[test]
fn e2e_error_deep_nesting() {
    let mut src = String::from("return ");
    for _ in 0..300 {
        src.push('(');
    }
    src.push('1');
    for _ in 0..300 {
        src.push(')');
    }
    let err = compile_str_err(&src);
    assert!(err.contains("syntax levels"));
}

#[test]
fn e2e_error_reports_line_number() {
    let src = "local a = 1\nlocal b = 2\nlocal c = (";
    match lunaria_compiler::compiler::compile(src.as_bytes(), "test") {
        Err(e) => assert_eq!(e.line, 3),
        Ok(_) => panic!("expected compile error"),
    }
}
