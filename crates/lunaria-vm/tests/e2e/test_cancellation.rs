use lunaria_vm::error::LuaError;
use lunaria_vm::vm::Vm;

fn compile(source: &str) -> (lunaria_compiler::proto::Proto, lunaria_core::string::StringInterner) {
    lunaria_compiler::compiler::compile(source.as_bytes(), "=test").expect("compile")
}

#[test]
fn test_precancelled_token_stops_immediately() {
    let (proto, strings) = compile("while true do end");
    let mut vm = Vm::new();
    vm.cancel_token().cancel();
    match vm.execute(&proto, strings) {
        Err(LuaError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
}

#[test]
fn test_cancel_from_another_thread_interrupts_loop() {
    let (proto, strings) = compile("while true do end");
    let mut vm = Vm::new();
    let token = vm.cancel_token();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        token.cancel();
    });
    let result = vm.execute(&proto, strings);
    canceller.join().unwrap();
    assert!(matches!(result, Err(LuaError::Cancelled)));
}

#[test]
fn test_pcall_does_not_catch_cancellation() {
    let (proto, strings) = compile(
        r#"
        local ok, err = pcall(function() while true do end end)
        return ok, err
        "#,
    );
    let mut vm = Vm::new();
    let token = vm.cancel_token();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        token.cancel();
    });
    let result = vm.execute(&proto, strings);
    canceller.join().unwrap();
    assert!(matches!(result, Err(LuaError::Cancelled)));
}

#[test]
fn test_cancel_interrupts_numeric_for() {
    let (proto, strings) = compile("for i = 1, 1e18 do end return 1");
    let mut vm = Vm::new();
    let token = vm.cancel_token();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        token.cancel();
    });
    let result = vm.execute(&proto, strings);
    canceller.join().unwrap();
    assert!(matches!(result, Err(LuaError::Cancelled)));
}

#[test]
fn test_cancel_interrupts_tail_recursion() {
    let (proto, strings) = compile(
        r#"
        local function spin() return spin() end
        return spin()
        "#,
    );
    let mut vm = Vm::new();
    let token = vm.cancel_token();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        token.cancel();
    });
    let result = vm.execute(&proto, strings);
    canceller.join().unwrap();
    assert!(matches!(result, Err(LuaError::Cancelled)));
}

#[test]
fn test_completed_run_unaffected_by_later_cancel() {
    let (proto, strings) = compile("return 5");
    let mut vm = Vm::new();
    let token = vm.cancel_token();
    let results = vm.execute(&proto, strings).expect("runs to completion");
    assert_eq!(results[0].as_number(), Some(5.0));
    token.cancel();
}
