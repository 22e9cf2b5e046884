use lunaria_core::value::Value;
use lunaria_vm::vm::Vm;

/// Compile and execute Lua source, returning the chunk's results.
pub fn run_lua(source: &str) -> Vec<Value> {
    run_lua_vm(source).0
}

/// Like `run_lua`, but also hands back the VM so string results can be
/// resolved through its interner.
pub fn run_lua_vm(source: &str) -> (Vec<Value>, Vm) {
    let (proto, strings) = lunaria_compiler::compiler::compile(source.as_bytes(), "=test")
        .unwrap_or_else(|e| panic!("compile error: {} at line {}", e.message, e.line));

    let mut vm = Vm::new();
    let results = vm
        .execute(&proto, strings)
        .unwrap_or_else(|e| panic!("runtime error: {e}"));
    (results, vm)
}

/// Compile and execute Lua source, expecting a runtime error.
pub fn run_lua_err(source: &str) -> String {
    let (proto, strings) = lunaria_compiler::compiler::compile(source.as_bytes(), "=test")
        .unwrap_or_else(|e| panic!("compile error: {} at line {}", e.message, e.line));

    let mut vm = Vm::new();
    match vm.execute(&proto, strings) {
        Err(e) => format!("{e}"),
        Ok(vals) => panic!("expected error, got {} results: {:?}", vals.len(), vals),
    }
}

/// Check that results[idx] is a number with the expected value.
pub fn assert_num(results: &[Value], idx: usize, expected: f64) {
    let val = results[idx];
    let got = val
        .as_number()
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected number {expected}", val));
    assert!(
        (got - expected).abs() < 1e-9,
        "result[{idx}] = {got}, expected {expected}"
    );
}

/// Check that results[idx] is a boolean with the expected value.
pub fn assert_bool(results: &[Value], idx: usize, expected: bool) {
    let val = results[idx];
    let got = val
        .as_bool()
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected bool {expected}", val));
    assert_eq!(got, expected, "result[{idx}] = {got}, expected {expected}");
}

/// Check that results[idx] is nil.
pub fn assert_nil(results: &[Value], idx: usize) {
    let val = results[idx];
    assert!(val.is_nil(), "result[{idx}] = {:?}, expected nil", val);
}

/// Check that results[idx] is a string with the expected value.
pub fn assert_str(results: &[Value], idx: usize, expected: &str, vm: &Vm) {
    let val = results[idx];
    let sid = val
        .as_string_id()
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected string \"{expected}\"", val));
    let got = String::from_utf8_lossy(vm.strings.get_bytes(sid)).into_owned();
    assert_eq!(
        got, expected,
        "result[{idx}] = \"{got}\", expected \"{expected}\""
    );
}

/// Run Lua source and check results against expected numbers.
pub fn run_check_nums(source: &str, expected: &[f64]) {
    let results = run_lua(source);
    assert_eq!(
        results.len(),
        expected.len(),
        "expected {} results, got {}",
        expected.len(),
        results.len()
    );
    for (i, &exp) in expected.iter().enumerate() {
        assert_num(&results, i, exp);
    }
}

/// Run Lua source and check results against expected strings.
pub fn run_check_strings(source: &str, expected: &[&str]) {
    let (results, vm) = run_lua_vm(source);
    assert_eq!(
        results.len(),
        expected.len(),
        "expected {} results, got {}",
        expected.len(),
        results.len()
    );
    for (i, exp) in expected.iter().enumerate() {
        assert_str(&results, i, exp, &vm);
    }
}

/// Run Lua source and check results against expected booleans.
pub fn run_check_bools(source: &str, expected: &[bool]) {
    let results = run_lua(source);
    assert_eq!(
        results.len(),
        expected.len(),
        "expected {} results, got {}",
        expected.len(),
        results.len()
    );
    for (i, &exp) in expected.iter().enumerate() {
        assert_bool(&results, i, exp);
    }
}
