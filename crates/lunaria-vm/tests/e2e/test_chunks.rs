use lunaria_core::string::StringInterner;
use lunaria_vm::chunk::{dump, undump, Endianness};
use lunaria_vm::vm::Vm;
use lunaria_vm::load_chunk;

fn compile(source: &str) -> (lunaria_compiler::proto::Proto, StringInterner) {
    lunaria_compiler::compiler::compile(source.as_bytes(), "=test").expect("compile")
}

fn run(proto: &lunaria_compiler::proto::Proto, strings: StringInterner) -> Vec<f64> {
    let mut vm = Vm::new();
    vm.execute(proto, strings)
        .expect("execute")
        .iter()
        .map(|v| v.as_number().expect("number result"))
        .collect()
}

const SAMPLE: &str = r#"
    local t = {}
    for i = 1, 5 do t[i] = i * i end
    local function sum(...)
        local s = 0
        for _, v in ipairs({...}) do s = s + v end
        return s
    end
    return t[3], sum(1, 2, 3)
"#;

#[test]
fn test_undumped_chunk_runs_identically() {
    let (proto, strings) = compile(SAMPLE);
    let direct = run(&proto, strings.clone());

    let (proto, strings) = compile(SAMPLE);
    let bytes = dump(&proto, &strings, Endianness::host());
    let mut strings2 = StringInterner::new();
    let proto2 = undump(&bytes, &mut strings2).expect("undump");
    let loaded = run(&proto2, strings2);

    assert_eq!(direct, loaded);
    assert_eq!(direct, vec![9.0, 6.0]);
}

#[test]
fn test_redump_is_byte_identical() {
    let (proto, strings) = compile(SAMPLE);
    let bytes = dump(&proto, &strings, Endianness::host());
    let mut strings2 = StringInterner::new();
    let proto2 = undump(&bytes, &mut strings2).expect("undump");
    let bytes2 = dump(&proto2, &strings2, Endianness::host());
    assert_eq!(bytes, bytes2);
}

#[test]
fn test_foreign_endianness_chunk_loads() {
    let other = match Endianness::host() {
        Endianness::Little => Endianness::Big,
        Endianness::Big => Endianness::Little,
    };
    let (proto, strings) = compile(SAMPLE);
    let bytes = dump(&proto, &strings, other);
    let mut strings2 = StringInterner::new();
    let proto2 = undump(&bytes, &mut strings2).expect("undump foreign endianness");
    assert_eq!(run(&proto2, strings2), vec![9.0, 6.0]);
}

#[test]
fn test_both_endian_dumps_differ_but_agree() {
    let (proto, strings) = compile("return 1 + 2 * 3");
    let little = dump(&proto, &strings, Endianness::Little);
    let big = dump(&proto, &strings, Endianness::Big);
    assert_ne!(little, big);

    let mut sl = StringInterner::new();
    let pl = undump(&little, &mut sl).expect("little");
    let mut sb = StringInterner::new();
    let pb = undump(&big, &mut sb).expect("big");
    assert_eq!(run(&pl, sl), vec![7.0]);
    assert_eq!(run(&pb, sb), vec![7.0]);
}

#[test]
fn test_load_chunk_sniffs_binary() {
    let (proto, strings) = compile("return 11");
    let bytes = dump(&proto, &strings, Endianness::host());
    let (proto2, strings2) = load_chunk(&bytes, "binary").expect("load binary");
    assert_eq!(run(&proto2, strings2), vec![11.0]);
}

#[test]
fn test_load_chunk_compiles_source() {
    let (proto, strings) = load_chunk(b"return 4 * 4", "=test").expect("load source");
    assert_eq!(run(&proto, strings), vec![16.0]);
}

#[test]
fn test_load_chunk_rejects_garbage_after_signature() {
    let mut bytes = lunaria_vm::chunk::SIGNATURE.to_vec();
    bytes.extend_from_slice(b"\xff\xff");
    assert!(load_chunk(&bytes, "bad").is_err());
}

#[test]
fn test_closures_survive_roundtrip() {
    let src = r#"
        local function counter()
            local n = 0
            return function() n = n + 1 return n end
        end
        local c = counter()
        c()
        return c()
    "#;
    let (proto, strings) = compile(src);
    let bytes = dump(&proto, &strings, Endianness::host());
    let mut strings2 = StringInterner::new();
    let proto2 = undump(&bytes, &mut strings2).expect("undump");
    assert_eq!(run(&proto2, strings2), vec![2.0]);
}
