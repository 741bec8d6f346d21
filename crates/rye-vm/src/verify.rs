//! Structural checks over compiled code, run after compilation in debug
//! builds: every byte decodes, jumps and code indices stay in bounds, every
//! body terminates in `ret`, and the recorded stack depth bounds the
//! abstract peak.

use rye_core::RyeError;

use crate::code::{CodeObject, FunctionObject, DOTS_ARG_IDX, MISSING_ARG_IDX};
use crate::codestream::compute_stack_depth;
use crate::opcodes::Op;

pub fn verify_function(fun: &FunctionObject) -> Result<(), RyeError> {
    if fun.is_empty() {
        return Err(RyeError::internal("function object with no code bodies"));
    }
    for (i, code) in fun.codes.iter().enumerate() {
        verify_code(code, fun.len()).map_err(|e| {
            RyeError::internal(format!("code body {i}: {e}"))
        })?;
    }
    Ok(())
}

pub fn verify_code(code: &CodeObject, n_codes: usize) -> Result<(), RyeError> {
    let ops = &code.ops;
    if ops.is_empty() {
        return Err(RyeError::internal("empty instruction stream"));
    }

    // Instruction boundaries, for jump-target validation.
    let mut starts = Vec::new();
    let mut pc = 0usize;
    let mut saw_ret = false;
    while pc < ops.len() {
        starts.push(pc);
        let op = Op::from_u8(ops[pc])
            .ok_or_else(|| RyeError::internal(format!("undecodable opcode at {pc}")))?;
        let imm_start = pc + 1;
        let next = imm_start + op.imm_len();
        if next > ops.len() {
            return Err(RyeError::internal(format!(
                "truncated {op:?} at {pc}"
            )));
        }
        match op {
            Op::Br | Op::BrTrue | Op::BrFalse | Op::BrObj | Op::BeginLoop | Op::GuardFun => {
                let off = i32::from_le_bytes(ops[next - 4..next].try_into().unwrap());
                let target = next as i64 + off as i64;
                if target < 0 || target > ops.len() as i64 {
                    return Err(RyeError::internal(format!(
                        "jump target {target} out of bounds at {pc}"
                    )));
                }
            }
            Op::PushCode | Op::MkProm => {
                let idx = u32::from_le_bytes(ops[imm_start..imm_start + 4].try_into().unwrap());
                if idx != MISSING_ARG_IDX && idx != DOTS_ARG_IDX && idx as usize >= n_codes {
                    return Err(RyeError::internal(format!(
                        "code index {idx} out of range at {pc}"
                    )));
                }
            }
            Op::Ret => saw_ret = true,
            _ => {}
        }
        pc = next;
    }
    if !saw_ret {
        return Err(RyeError::internal("code body does not return"));
    }

    // Jump targets must land on instruction starts (or one past the end).
    let mut pc = 0usize;
    while pc < ops.len() {
        let op = Op::from_u8(ops[pc]).unwrap();
        let next = pc + 1 + op.imm_len();
        if matches!(
            op,
            Op::Br | Op::BrTrue | Op::BrFalse | Op::BrObj | Op::BeginLoop | Op::GuardFun
        ) {
            let off = i32::from_le_bytes(ops[next - 4..next].try_into().unwrap());
            let target = (next as i64 + off as i64) as usize;
            if target != ops.len() && starts.binary_search(&target).is_err() {
                return Err(RyeError::internal(format!(
                    "jump target {target} splits an instruction at {pc}"
                )));
            }
        }
        pc = next;
    }

    let peak = compute_stack_depth(ops)?;
    if peak > code.stack_depth {
        return Err(RyeError::internal(format!(
            "abstract stack peak {peak} exceeds recorded depth {}",
            code.stack_depth
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::op;

    fn code(ops: Vec<u8>, stack_depth: u32) -> CodeObject {
        CodeObject {
            ops,
            srcs: vec![],
            src: 0,
            stack_depth,
        }
    }

    #[test]
    fn test_missing_ret_rejected() {
        let mut ops = vec![op::PUSH];
        ops.extend_from_slice(&0u32.to_le_bytes());
        assert!(verify_code(&code(ops, 1), 1).is_err());
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let ops = vec![op::PUSH, 0, 0];
        assert!(verify_code(&code(ops, 1), 1).is_err());
    }

    #[test]
    fn test_jump_out_of_bounds_rejected() {
        let mut ops = vec![op::BR];
        ops.extend_from_slice(&100i32.to_le_bytes());
        ops.push(op::RET);
        assert!(verify_code(&code(ops, 1), 1).is_err());
    }

    #[test]
    fn test_understated_stack_depth_rejected() {
        let mut ops = vec![op::PUSH];
        ops.extend_from_slice(&0u32.to_le_bytes());
        ops.push(op::DUP);
        ops.push(op::POP);
        ops.push(op::RET);
        assert!(verify_code(&code(ops.clone(), 1), 1).is_err());
        assert!(verify_code(&code(ops, 2), 1).is_ok());
    }

    #[test]
    fn test_bad_code_index_rejected() {
        let mut ops = vec![op::MK_PROM];
        ops.extend_from_slice(&5u32.to_le_bytes());
        ops.push(op::POP);
        ops.push(op::RET);
        // only 2 code bodies exist
        let mut c = code(ops, 1);
        c.stack_depth = 1;
        assert!(verify_code(&c, 2).is_err());
    }
}
