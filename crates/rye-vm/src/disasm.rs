use std::fmt::Write;

use rye_core::{Kind, Value};

use crate::code::{CodeObject, FunctionObject, DOTS_ARG_IDX, MISSING_ARG_IDX};
use crate::opcodes::Op;
use crate::runtime::Runtime;

fn read_u32(code: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(code[offset..offset + 4].try_into().unwrap())
}

fn read_i32(code: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(code[offset..offset + 4].try_into().unwrap())
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::Push => "PUSH",
        Op::LdFun => "LDFUN",
        Op::LdVar => "LDVAR",
        Op::LdDdVar => "LDDDVAR",
        Op::PushCode => "PUSH_CODE",
        Op::MkProm => "MK_PROM",
        Op::Force => "FORCE",
        Op::Call => "CALL",
        Op::CallStack => "CALL_STACK",
        Op::Dispatch => "DISPATCH",
        Op::Br => "BR",
        Op::BrTrue => "BR_TRUE",
        Op::BrFalse => "BR_FALSE",
        Op::BrObj => "BR_OBJ",
        Op::BeginLoop => "BEGIN_LOOP",
        Op::EndContext => "END_CONTEXT",
        Op::Ret => "RET",
        Op::Pop => "POP",
        Op::Dup => "DUP",
        Op::Dup2 => "DUP2",
        Op::Swap => "SWAP",
        Op::Pick => "PICK",
        Op::Put => "PUT",
        Op::AsBool => "AS_BOOL",
        Op::AsLogical => "AS_LOGICAL",
        Op::LglAnd => "LGL_AND",
        Op::LglOr => "LGL_OR",
        Op::Is => "IS",
        Op::StVar => "ST_VAR",
        Op::Lt => "LT",
        Op::Add => "ADD",
        Op::Sub => "SUB",
        Op::Inc => "INC",
        Op::TestBounds => "TEST_BOUNDS",
        Op::Extract1 => "EXTRACT1",
        Op::Subset1 => "SUBSET1",
        Op::Invisible => "INVISIBLE",
        Op::Uniq => "UNIQ",
        Op::AsAst => "AS_AST",
        Op::IsFun => "IS_FUN",
        Op::GuardFun => "GUARD_FUN",
    }
}

/// Produce a human-readable disassembly of one code body.
pub fn disassemble(rt: &Runtime, code: &CodeObject, name: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(name) = name {
        let _ = writeln!(out, "== {} == (stack depth {})", name, code.stack_depth);
    }
    let ops = &code.ops;
    let mut pc = 0usize;
    while pc < ops.len() {
        let Some(op) = Op::from_u8(ops[pc]) else {
            let _ = writeln!(out, "{pc:04}  ??? {:#04x}", ops[pc]);
            break;
        };
        let _ = write!(out, "{pc:04}  {:<12}", op_name(op));
        let imm = pc + 1;
        match op {
            Op::Push | Op::LdFun | Op::LdVar | Op::LdDdVar | Op::StVar => {
                let k = read_u32(ops, imm);
                let _ = write!(out, " {k} ; {}", rt.const_at(k).deparse());
            }
            Op::PushCode | Op::MkProm => {
                let _ = write!(out, " body {}", read_u32(ops, imm));
            }
            Op::Call => {
                let args = rt.const_at(read_u32(ops, imm));
                let _ = write!(out, " args [{}]", format_indices(&args));
            }
            Op::CallStack => {
                let _ = write!(out, " nargs {}", read_u32(ops, imm));
            }
            Op::Dispatch => {
                let args = rt.const_at(read_u32(ops, imm));
                let selector = rt.const_at(read_u32(ops, imm + 8));
                let _ = write!(
                    out,
                    " `{}` args [{}]",
                    selector.deparse(),
                    format_indices(&args)
                );
            }
            Op::Br | Op::BrTrue | Op::BrFalse | Op::BrObj | Op::BeginLoop => {
                let off = read_i32(ops, imm);
                let target = (imm + 4) as i64 + off as i64;
                let _ = write!(out, " -> {target:04}");
            }
            Op::GuardFun => {
                let k = read_u32(ops, imm);
                let off = read_i32(ops, imm + 4);
                let target = (imm + 8) as i64 + off as i64;
                let _ = write!(
                    out,
                    " `{}` slow -> {target:04}",
                    rt.const_at(k).deparse()
                );
            }
            Op::Pick | Op::Put | Op::Is => {
                let _ = write!(out, " {}", read_u32(ops, imm));
            }
            _ => {}
        }
        if let Some(key) = code.src_at_exact(pc as u32) {
            let _ = write!(out, "   # {}", rt.src_at(key).deparse());
        }
        let _ = writeln!(out);
        pc += 1 + op.imm_len();
    }
    out
}

/// Disassemble every body of a function object, the entry first.
pub fn disassemble_function(rt: &Runtime, fun: &FunctionObject) -> String {
    let mut out = String::new();
    for (i, code) in fun.codes.iter().enumerate() {
        let label = if i == 0 {
            "entry".to_string()
        } else {
            format!("promise {i}")
        };
        out.push_str(&disassemble(rt, code, Some(&label)));
    }
    out
}

fn format_indices(packed: &Value) -> String {
    match &*packed.kind() {
        Kind::Int(v) => v
            .iter()
            .map(|&i| match i as u32 {
                MISSING_ARG_IDX => "_".to_string(),
                DOTS_ARG_IDX => "...".to_string(),
                idx => idx.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}
