use std::io::Read;

use lunaria_compiler::disasm;
use lunaria_vm::chunk;
use lunaria_vm::error::LuaError;
use lunaria_vm::vm::{format_value, Vm};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut script_file: Option<String> = None;
    let mut exec_statements: Vec<String> = Vec::new();
    let mut show_version = false;
    let mut list_only = false;
    let mut dump_target: Option<String> = None;

    // Parse arguments
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-v" => {
                show_version = true;
                i += 1;
            }
            "--list" => {
                list_only = true;
                i += 1;
            }
            "--dump" => {
                if i + 1 >= args.len() {
                    eprintln!("lunaria: '--dump' needs an output file");
                    std::process::exit(1);
                }
                dump_target = Some(args[i + 1].clone());
                i += 2;
            }
            "-e" => {
                if i + 1 >= args.len() {
                    eprintln!("lunaria: '-e' needs argument");
                    std::process::exit(1);
                }
                exec_statements.push(args[i + 1].clone());
                i += 2;
            }
            _ => {
                if args[i].starts_with('-') && args[i] != "-" {
                    // Combined form like -e"code"
                    if args[i].starts_with("-e") && args[i].len() > 2 {
                        exec_statements.push(args[i][2..].to_string());
                        i += 1;
                    } else {
                        eprintln!("lunaria: unrecognized option '{}'", args[i]);
                        std::process::exit(1);
                    }
                } else {
                    script_file = Some(args[i].clone());
                    break;
                }
            }
        }
    }

    if show_version {
        println!("Lunaria 0.1.0 -- Lua 5.2 (compatible)");
    }

    if exec_statements.is_empty() && script_file.is_none() {
        if show_version {
            return;
        }
        // Piped input with no script argument.
        let mut buf = Vec::new();
        if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
            eprintln!("lunaria: cannot read stdin: {e}");
            std::process::exit(1);
        }
        run_chunk(&buf, "=stdin", list_only, dump_target.as_deref());
        return;
    }

    for stat in &exec_statements {
        run_chunk(
            stat.as_bytes(),
            "=(command line)",
            list_only,
            dump_target.as_deref(),
        );
    }

    if let Some(ref path) = script_file {
        if path == "-" {
            let mut buf = Vec::new();
            if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
                eprintln!("lunaria: cannot read stdin: {e}");
                std::process::exit(1);
            }
            run_chunk(&buf, "=stdin", list_only, dump_target.as_deref());
        } else {
            let source = match std::fs::read(path) {
                Ok(data) => data,
                Err(e) => {
                    eprintln!("lunaria: cannot open {path}: {e}");
                    std::process::exit(1);
                }
            };
            let source = strip_shebang(&source);
            run_chunk(source, &format!("@{path}"), list_only, dump_target.as_deref());
        }
    }
}

/// Load a chunk (source or precompiled) and run it, or, with `--list` /
/// `--dump`, disassemble or serialize it instead. Exits the process on
/// failure.
fn run_chunk(bytes: &[u8], name: &str, list_only: bool, dump_target: Option<&str>) {
    let (proto, strings) = match lunaria_vm::load_chunk(bytes, name) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("lunaria: {e}");
            std::process::exit(1);
        }
    };

    if list_only {
        print!("{}", disasm::disassemble(&proto, &strings));
        return;
    }

    if let Some(path) = dump_target {
        let out = chunk::dump(&proto, &strings, chunk::Endianness::host());
        if let Err(e) = std::fs::write(path, out) {
            eprintln!("lunaria: cannot write {path}: {e}");
            std::process::exit(1);
        }
        return;
    }

    let mut vm = Vm::new();
    if let Err(e) = vm.execute(&proto, strings) {
        let message = match &e {
            // The error value needs the interner to render.
            LuaError::Value(v) => format_value(*v, &vm.strings),
            other => other.to_string(),
        };
        eprintln!("lunaria: {message}");
        eprintln!("{}", vm.traceback());
        std::process::exit(1);
    }
}

fn strip_shebang(source: &[u8]) -> &[u8] {
    if source.starts_with(b"#") {
        match source.iter().position(|&b| b == b'\n') {
            Some(pos) => &source[pos + 1..],
            None => b"",
        }
    } else {
        source
    }
}
