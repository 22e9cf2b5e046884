/// Bytecode disassembler (luac -l style output).
use crate::opcode::{self, Instruction, InstructionFormat, OpCode};
use crate::proto::{Constant, Proto};
use lunaria_core::string::StringInterner;
use std::fmt::Write;

/// Disassemble a complete Proto into a human-readable string.
pub fn disassemble(proto: &Proto, strings: &StringInterner) -> String {
    let mut out = String::new();
    disassemble_proto(&mut out, proto, strings, 0);
    out
}

fn disassemble_proto(out: &mut String, proto: &Proto, strings: &StringInterner, level: usize) {
    let indent = "  ".repeat(level);

    // Header
    let vararg = if proto.is_vararg { "+" } else { "" };
    writeln!(
        out,
        "{indent}function ({}{vararg} params, {} slots, {} upvalues, {} constants, {} functions)",
        proto.num_params,
        proto.max_stack_size,
        proto.upvalues.len(),
        proto.constants.len(),
        proto.protos.len(),
    )
    .unwrap();

    // Instructions
    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.get_line(pc);
        let line_str = if line > 0 {
            format!("[{line}]")
        } else {
            "[-]".to_string()
        };
        write!(out, "{indent}\t{}\t{:>5}\t", pc + 1, line_str).unwrap();
        disasm_instruction(out, inst, pc, proto, strings);
        writeln!(out).unwrap();
    }

    // Constants
    if !proto.constants.is_empty() {
        writeln!(out, "{indent}constants ({}):", proto.constants.len()).unwrap();
        for (i, k) in proto.constants.iter().enumerate() {
            write!(out, "{indent}\t{}\t", i).unwrap();
            format_constant(out, k, strings);
            writeln!(out).unwrap();
        }
    }

    // Upvalues
    if !proto.upvalues.is_empty() {
        writeln!(out, "{indent}upvalues ({}):", proto.upvalues.len()).unwrap();
        for (i, up) in proto.upvalues.iter().enumerate() {
            let name = up
                .name
                .map(|id| {
                    std::str::from_utf8(strings.get_bytes(id))
                        .unwrap_or("?")
                        .to_string()
                })
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                out,
                "{indent}\t{}\t{}\t{}\t{}",
                i,
                name,
                if up.in_stack { 1 } else { 0 },
                up.index
            )
            .unwrap();
        }
    }

    // Nested protos
    for (i, p) in proto.protos.iter().enumerate() {
        writeln!(out, "{indent}function [{i}]:").unwrap();
        disassemble_proto(out, p, strings, level + 1);
    }
}

/// Disassemble a single instruction into the output string.
pub fn disasm_instruction(
    out: &mut String,
    inst: &Instruction,
    pc: usize,
    proto: &Proto,
    strings: &StringInterner,
) {
    let op = inst.opcode();
    write!(out, "{:<12}", op.name()).unwrap();

    match op.format() {
        InstructionFormat::IABC => {
            write!(out, "{} {} {}", inst.a(), inst.b(), inst.c()).unwrap();
            // Annotate RK operands that reference constants
            let mut annotated = false;
            for rk in [inst.b(), inst.c()] {
                if uses_rk_operands(op) && opcode::is_rk_const(rk) {
                    let idx = opcode::rk_index(rk) as usize;
                    if idx < proto.constants.len() {
                        if !annotated {
                            write!(out, "\t; ").unwrap();
                            annotated = true;
                        } else {
                            write!(out, " ").unwrap();
                        }
                        format_constant(out, &proto.constants[idx], strings);
                    }
                }
            }
        }
        InstructionFormat::IABx => {
            write!(out, "{} {}", inst.a(), inst.bx()).unwrap();
            if op == OpCode::LoadK {
                let idx = inst.bx() as usize;
                if idx < proto.constants.len() {
                    write!(out, "\t; ").unwrap();
                    format_constant(out, &proto.constants[idx], strings);
                }
            } else if op == OpCode::Closure {
                write!(out, "\t; function [{}]", inst.bx()).unwrap();
            }
        }
        InstructionFormat::IAsBx => {
            write!(out, "{} {}", inst.a(), inst.sbx()).unwrap();
            // Jump target as a 1-based pc, matching the listing
            let target = pc as i64 + 1 + inst.sbx() as i64 + 1;
            write!(out, "\t; to {target}").unwrap();
        }
        InstructionFormat::IAx => {
            write!(out, "{}", inst.ax_field()).unwrap();
        }
    }
}

/// True for opcodes whose B/C fields are RK operands.
fn uses_rk_operands(op: OpCode) -> bool {
    use OpCode::*;
    matches!(
        op,
        GetTabUp
            | GetTable
            | SetTabUp
            | SetTable
            | Self_
            | Add
            | Sub
            | Mul
            | Div
            | Mod
            | Pow
            | Eq
            | Lt
            | Le
    )
}

fn format_constant(out: &mut String, k: &Constant, strings: &StringInterner) {
    match k {
        Constant::Nil => write!(out, "nil").unwrap(),
        Constant::Boolean(b) => write!(out, "{b}").unwrap(),
        Constant::Number(n) => write!(out, "{n}").unwrap(),
        Constant::String(id) => {
            let bytes = strings.get_bytes(*id);
            if let Ok(s) = std::str::from_utf8(bytes) {
                write!(out, "\"{s}\"").unwrap();
            } else {
                write!(out, "<binary string>").unwrap();
            }
        }
    }
}
