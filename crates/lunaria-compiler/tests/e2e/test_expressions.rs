use super::helpers::*;
use lunaria_compiler::opcode::OpCode;
use lunaria_compiler::proto::Constant;

#[test]
fn e2e_return_nil() {
    let (proto, _) = compile_str("return nil");
    assert!(has_opcode(&proto, OpCode::LoadNil));
}

#[test]
fn e2e_return_true() {
    let (proto, _) = compile_str("return true");
    let pc = find_opcode(&proto, OpCode::LoadBool).unwrap();
    assert_eq!(proto.code[pc].b(), 1);
}

#[test]
fn e2e_return_false() {
    let (proto, _) = compile_str("return false");
    let pc = find_opcode(&proto, OpCode::LoadBool).unwrap();
    assert_eq!(proto.code[pc].b(), 0);
}

#[test]
fn e2e_return_number() {
    let (proto, _) = compile_str("return 42");
    assert!(has_opcode(&proto, OpCode::LoadK));
    assert!(proto
        .constants
        .iter()
        .any(|c| matches!(c, Constant::Number(n) if *n == 42.0)));
}

#[test]
fn e2e_return_float() {
    let (proto, _) = compile_str("return 3.14");
    assert!(has_opcode(&proto, OpCode::LoadK));
    assert_eq!(get_number_constant(&proto, 0), 3.14);
}

#[test]
fn e2e_return_string() {
    let (proto, strings) = compile_str("return \"hello world\"");
    assert!(has_opcode(&proto, OpCode::LoadK));
    let s = get_string_constant(&proto, 0, &strings);
    assert_eq!(s, "hello world");
}

#[test]
fn e2e_constant_folding_neg() {
    let (proto, _) = compile_str("return -42");
    // Folded into a single constant, no runtime negation
    assert!(!has_opcode(&proto, OpCode::Unm));
    assert_eq!(get_number_constant(&proto, 0), -42.0);
}

#[test]
fn e2e_constant_folding_not() {
    let (proto, _) = compile_str("return not nil");
    assert!(!has_opcode(&proto, OpCode::Not));
    let pc = find_opcode(&proto, OpCode::LoadBool).unwrap();
    assert_eq!(proto.code[pc].b(), 1);
}

#[test]
fn e2e_constant_folding_arith() {
    let (proto, _) = compile_str("return 6 * 7");
    assert!(!has_opcode(&proto, OpCode::Mul));
    assert_eq!(get_number_constant(&proto, 0), 42.0);
}

#[test]
fn e2e_division_by_zero_not_folded() {
    let (proto, _) = compile_str("return 1 / 0");
    assert!(has_opcode(&proto, OpCode::Div));
}

#[test]
fn e2e_arithmetic_ops() {
    let (proto, _) = compile_str("local a = 1\nlocal b = 2\nreturn a + b");
    assert!(has_opcode(&proto, OpCode::Add));
}

#[test]
fn e2e_arithmetic_constant_operand() {
    // RK encoding lets the constant ride in the C operand
    let (proto, _) = compile_str("local a = 1\nreturn a + 10");
    let pc = find_opcode(&proto, OpCode::Add).unwrap();
    assert!(proto.code[pc].c() >= 256);
}

#[test]
fn e2e_comparison_ops() {
    let (proto, _) = compile_str("local a = 1\nlocal b = 2\nif a < b then end");
    let pc = find_opcode(&proto, OpCode::Lt).unwrap();
    assert_eq!(proto.code[pc].a(), 0);
}

#[test]
fn e2e_comparison_as_value() {
    // Materialized through a LoadBool pair
    let (proto, _) = compile_str("local a, b\nreturn a < b");
    assert!(has_opcode(&proto, OpCode::Lt));
    assert_eq!(count_opcode(&proto, OpCode::LoadBool), 2);
}

#[test]
fn e2e_not_equal() {
    let (proto, _) = compile_str("local a, b\nif a ~= b then end");
    let pc = find_opcode(&proto, OpCode::Eq).unwrap();
    assert_eq!(proto.code[pc].a(), 1);
}

#[test]
fn e2e_greater_than_swaps_operands() {
    let (proto, _) = compile_str("local a, b\nif a > b then end");
    let pc = find_opcode(&proto, OpCode::Lt).unwrap();
    assert_eq!(proto.code[pc].b(), 1);
    assert_eq!(proto.code[pc].c(), 0);
}

#[test]
fn e2e_and_short_circuit() {
    let (proto, _) = compile_str("local a\nreturn a and 42");
    let pc = find_opcode(&proto, OpCode::TestSet).unwrap();
    assert_eq!(proto.code[pc].c(), 0);
    assert!(has_opcode(&proto, OpCode::Jmp));
}

#[test]
fn e2e_or_short_circuit() {
    let (proto, _) = compile_str("local a\nreturn a or 42");
    let pc = find_opcode(&proto, OpCode::TestSet).unwrap();
    assert_eq!(proto.code[pc].c(), 1);
}

#[test]
fn e2e_power_right_associative() {
    let (proto, _) = compile_str("return 2 ^ 3 ^ 2");
    // 2 ^ (3 ^ 2) = 512
    assert_eq!(get_number_constant(&proto, 0), 512.0);
}

#[test]
fn e2e_table_constructor_empty() {
    let (proto, _) = compile_str("return {}");
    assert!(has_opcode(&proto, OpCode::NewTable));
}

#[test]
fn e2e_table_constructor_array() {
    let (proto, _) = compile_str("return {1, 2, 3}");
    assert!(has_opcode(&proto, OpCode::NewTable));
    let pc = find_opcode(&proto, OpCode::SetList).unwrap();
    assert_eq!(proto.code[pc].b(), 3);
}

#[test]
fn e2e_table_constructor_hash() {
    let (proto, _) = compile_str("return {x = 1, y = 2}");
    assert!(has_opcode(&proto, OpCode::NewTable));
    assert_eq!(count_opcode(&proto, OpCode::SetTable), 2);
}

#[test]
fn e2e_table_constructor_mixed() {
    let (proto, _) = compile_str("return {1, x = 2, 3}");
    assert!(has_opcode(&proto, OpCode::SetTable));
    assert!(has_opcode(&proto, OpCode::SetList));
}

#[test]
fn e2e_table_bracket_key() {
    let (proto, _) = compile_str("return {[1] = \"a\", [2] = \"b\"}");
    assert!(has_opcode(&proto, OpCode::NewTable));
    assert_eq!(count_opcode(&proto, OpCode::SetTable), 2);
}

#[test]
fn e2e_table_trailing_call_expands() {
    let (proto, _) = compile_str("local f\nreturn {1, f()}");
    let pc = find_opcode(&proto, OpCode::SetList).unwrap();
    assert_eq!(proto.code[pc].b(), 0);
}

#[test]
fn e2e_concat() {
    let (proto, _) = compile_str("local a = \"x\"\nlocal b = \"y\"\nreturn a .. b");
    assert!(has_opcode(&proto, OpCode::Concat));
}

#[test]
fn e2e_concat_chain_single_instruction() {
    let (proto, _) = compile_str("local a, b, c\nreturn a .. b .. c");
    assert_eq!(count_opcode(&proto, OpCode::Concat), 1);
}

#[test]
fn e2e_len_operator() {
    let (proto, _) = compile_str("local t = {}\nreturn #t");
    assert!(has_opcode(&proto, OpCode::Len));
}

#[test]
fn e2e_index_read() {
    let (proto, _) = compile_str("local t\nreturn t.field");
    assert!(has_opcode(&proto, OpCode::GetTable));
}

#[test]
fn e2e_vararg_spread() {
    let (proto, _) = compile_str("return ...");
    let pc = find_opcode(&proto, OpCode::VarArg).unwrap();
    assert_eq!(proto.code[pc].b(), 0);
}

#[test]
fn e2e_vararg_truncated_by_parens() {
    let (proto, _) = compile_str("return (...)");
    let pc = find_opcode(&proto, OpCode::VarArg).unwrap();
    assert_eq!(proto.code[pc].b(), 2);
}

#[test]
fn e2e_multiple_return_values() {
    let (proto, _) = compile_str("return 1, 2, 3");
    assert!(proto
        .code
        .iter()
        .any(|i| i.opcode() == OpCode::Return && i.b() == 4));
}
