use rye_core::{RyeError, Spur, Value};

use crate::code::CodeObject;
use crate::opcodes::Op;
use crate::runtime::Runtime;

/// A forward reference into the instruction stream. Branches to a label may
/// be emitted before the label is bound; `finalize` resolves them.
#[derive(Debug, Clone, Copy)]
pub struct Label(usize);

/// Streaming builder for one code body: interleaves encoded instructions
/// with their source-pool keys and resolves labels on `finalize`.
pub struct CodeStream<'rt> {
    rt: &'rt Runtime,
    ops: Vec<u8>,
    srcs: Vec<(u32, u32)>,
    src: u32,
    labels: Vec<Option<u32>>,
    patches: Vec<(u32, usize)>,
    last_instr_start: u32,
}

impl<'rt> CodeStream<'rt> {
    pub fn new(rt: &'rt Runtime, ast: &Value) -> CodeStream<'rt> {
        let src = rt.spool.borrow_mut().insert(ast.clone());
        CodeStream {
            rt,
            ops: Vec::new(),
            srcs: Vec::new(),
            src,
            labels: Vec::new(),
            patches: Vec::new(),
            last_instr_start: 0,
        }
    }

    pub fn pc(&self) -> u32 {
        self.ops.len() as u32
    }

    pub fn emit(&mut self, op: Op) {
        self.last_instr_start = self.pc();
        self.ops.push(op as u8);
    }

    pub fn emit_u32(&mut self, val: u32) {
        self.ops.extend_from_slice(&val.to_le_bytes());
    }

    pub fn emit_i32(&mut self, val: i32) {
        self.ops.extend_from_slice(&val.to_le_bytes());
    }

    /// Opcode with a single u32 immediate.
    pub fn op1(&mut self, op: Op, imm: u32) {
        self.emit(op);
        self.emit_u32(imm);
    }

    /// Opcode with two u32 immediates.
    pub fn op2(&mut self, op: Op, a: u32, b: u32) {
        self.emit(op);
        self.emit_u32(a);
        self.emit_u32(b);
    }

    /// Opcode with three u32 immediates.
    pub fn op3(&mut self, op: Op, a: u32, b: u32, c: u32) {
        self.emit(op);
        self.emit_u32(a);
        self.emit_u32(b);
        self.emit_u32(c);
    }

    /// Intern a constant, marking it shared so user code can never mutate
    /// pool storage in place.
    pub fn const_idx(&mut self, v: Value) -> u32 {
        v.mark_shared();
        self.rt.cpool.borrow_mut().insert(v)
    }

    pub fn sym_idx(&mut self, sym: Spur) -> u32 {
        self.const_idx(Value::symbol(sym))
    }

    /// `Push` of an interned constant.
    pub fn push_const(&mut self, v: Value) {
        let idx = self.const_idx(v);
        self.op1(Op::Push, idx);
    }

    /// Attach a source reference to the most recently emitted instruction.
    pub fn add_src(&mut self, ast: &Value) {
        let key = self.rt.spool.borrow_mut().insert(ast.clone());
        if let Some(last) = self.srcs.last_mut() {
            if last.0 == self.last_instr_start {
                last.1 = key;
                return;
            }
        }
        self.srcs.push((self.last_instr_start, key));
    }

    pub fn mk_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.pc());
    }

    /// Emit a branching instruction whose (final) immediate is the offset to
    /// `label`, recorded as a patch point.
    pub fn branch(&mut self, op: Op, label: Label) {
        debug_assert!(matches!(
            op,
            Op::Br | Op::BrTrue | Op::BrFalse | Op::BrObj | Op::BeginLoop
        ));
        self.emit(op);
        self.patches.push((self.pc(), label.0));
        self.emit_i32(0);
    }

    /// `GuardFun sym, label`: side-exit to `label` when `sym` no longer
    /// resolves to its base definition.
    pub fn guard(&mut self, sym: Spur, label: Label) {
        let idx = self.sym_idx(sym);
        self.emit(Op::GuardFun);
        self.emit_u32(idx);
        self.patches.push((self.pc(), label.0));
        self.emit_i32(0);
    }

    /// Resolve all patch points and produce the finished `CodeObject`,
    /// computing its conservative stack depth.
    pub fn finalize(self) -> Result<CodeObject, RyeError> {
        let CodeStream {
            mut ops,
            srcs,
            src,
            labels,
            patches,
            ..
        } = self;
        for (pos, label) in patches {
            let target = labels[label]
                .ok_or_else(|| RyeError::internal("unbound label in code stream"))?;
            // Offsets are relative to the byte after the instruction; the
            // patched i32 is always the final immediate.
            let offset = target as i64 - (pos as i64 + 4);
            ops[pos as usize..pos as usize + 4]
                .copy_from_slice(&(offset as i32).to_le_bytes());
        }
        let stack_depth = compute_stack_depth(&ops)?;
        Ok(CodeObject {
            ops,
            srcs,
            src,
            stack_depth,
        })
    }
}

fn read_u32_at(ops: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([ops[pos], ops[pos + 1], ops[pos + 2], ops[pos + 3]])
}

fn read_i32_at(ops: &[u8], pos: usize) -> i32 {
    i32::from_le_bytes([ops[pos], ops[pos + 1], ops[pos + 2], ops[pos + 3]])
}

/// Conservative peak stack height by abstract interpretation: every opcode
/// has a static pop/push signature (`CallStack` decodes its count from the
/// immediate); branches explore both successors and the peak is the max
/// over all reachable states.
pub fn compute_stack_depth(ops: &[u8]) -> Result<u32, RyeError> {
    let mut seen: Vec<Option<u32>> = vec![None; ops.len()];
    let mut work: Vec<(usize, u32)> = vec![(0, 0)];
    let mut peak = 0u32;

    while let Some((pc, depth)) = work.pop() {
        if pc >= ops.len() {
            continue;
        }
        if let Some(prev) = seen[pc] {
            if prev >= depth {
                continue;
            }
        }
        seen[pc] = Some(depth);

        let op = Op::from_u8(ops[pc])
            .ok_or_else(|| RyeError::internal(format!("undecodable opcode at {}", pc)))?;
        let imm_start = pc + 1;
        let next = imm_start + op.imm_len();
        if next > ops.len() {
            return Err(RyeError::internal("truncated instruction stream"));
        }

        let (pops, pushes) = match op.stack_effect() {
            Some(sig) => sig,
            None => {
                // CallStack: nargs plus the callee beneath them.
                let nargs = read_u32_at(ops, imm_start);
                (nargs + 1, 1)
            }
        };
        if depth < pops {
            return Err(RyeError::internal(format!(
                "stack underflow at pc {} ({:?})",
                pc, op
            )));
        }
        let out = depth - pops + pushes;
        peak = peak.max(depth).max(out);

        match op {
            Op::Ret => {}
            Op::Br => {
                let off = read_i32_at(ops, imm_start);
                work.push(((next as i64 + off as i64) as usize, out));
            }
            Op::BrTrue | Op::BrFalse | Op::BrObj | Op::BeginLoop | Op::GuardFun => {
                // The offset is the final immediate.
                let off = read_i32_at(ops, next - 4);
                work.push(((next as i64 + off as i64) as usize, out));
                work.push((next, out));
            }
            _ => work.push((next, out)),
        }
    }
    Ok(peak)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::op;

    fn rt() -> Runtime {
        Runtime::new()
    }

    #[test]
    fn test_emit_const() {
        let rt = rt();
        let mut cs = CodeStream::new(&rt, &Value::null());
        cs.push_const(Value::real(42.0));
        cs.emit(Op::Ret);
        let code = cs.finalize().unwrap();
        assert_eq!(code.ops[0], op::PUSH);
        let idx = u32::from_le_bytes(code.ops[1..5].try_into().unwrap());
        assert_eq!(rt.const_at(idx).as_real_scalar(), Some(42.0));
        assert_eq!(code.ops[5], op::RET);
        assert_eq!(code.stack_depth, 1);
    }

    #[test]
    fn test_constants_are_marked_shared() {
        let rt = rt();
        let mut cs = CodeStream::new(&rt, &Value::null());
        let idx = cs.const_idx(Value::real(1.0));
        assert!(rt.const_at(idx).maybe_shared());
    }

    #[test]
    fn test_forward_branch_patching() {
        let rt = rt();
        let mut cs = CodeStream::new(&rt, &Value::null());
        cs.push_const(Value::lgl(true)); // 5 bytes
        let done = cs.mk_label();
        cs.branch(Op::BrFalse, done); // 5 bytes, offset at 6..10
        cs.push_const(Value::real(1.0)); // 5 bytes
        cs.bind(done);
        cs.emit(Op::Ret);
        let code = cs.finalize().unwrap();
        let offset = i32::from_le_bytes(code.ops[6..10].try_into().unwrap());
        // target 15, byte after offset 10
        assert_eq!(offset, 5);
    }

    #[test]
    fn test_backward_branch() {
        let rt = rt();
        let mut cs = CodeStream::new(&rt, &Value::null());
        let top = cs.mk_label();
        cs.bind(top);
        cs.push_const(Value::lgl(true)); // 0..5
        cs.branch(Op::BrTrue, top); // 5..10, offset at 6..10
        cs.push_const(Value::null());
        cs.emit(Op::Ret);
        let code = cs.finalize().unwrap();
        let offset = i32::from_le_bytes(code.ops[6..10].try_into().unwrap());
        assert_eq!(offset, -10);
    }

    #[test]
    fn test_add_src_attaches_to_last_instruction() {
        let rt = rt();
        let mut cs = CodeStream::new(&rt, &Value::null());
        cs.push_const(Value::real(1.0));
        cs.push_const(Value::real(2.0));
        let ast = Value::sym("here");
        cs.add_src(&ast);
        cs.emit(Op::Ret);
        let code = cs.finalize().unwrap();
        assert_eq!(code.srcs.len(), 1);
        assert_eq!(code.srcs[0].0, 5); // second Push starts at byte 5
        assert_eq!(rt.src_at(code.srcs[0].1).as_symbol(), ast.as_symbol());
        assert_eq!(code.src_at(5), code.srcs[0].1);
        assert_eq!(code.src_at(0), code.src);
    }

    #[test]
    fn test_depth_takes_branch_max() {
        let rt = rt();
        let mut cs = CodeStream::new(&rt, &Value::null());
        cs.push_const(Value::lgl(true));
        let alt = cs.mk_label();
        let done = cs.mk_label();
        cs.branch(Op::BrFalse, alt);
        cs.push_const(Value::real(1.0));
        cs.push_const(Value::real(2.0));
        cs.push_const(Value::real(3.0));
        cs.emit(Op::Pop);
        cs.emit(Op::Pop);
        cs.branch(Op::Br, done);
        cs.bind(alt);
        cs.push_const(Value::real(9.0));
        cs.bind(done);
        cs.emit(Op::Ret);
        let code = cs.finalize().unwrap();
        assert_eq!(code.stack_depth, 3);
    }

    #[test]
    fn test_depth_underflow_is_an_error() {
        let ops = vec![op::POP, op::RET];
        assert!(compute_stack_depth(&ops).is_err());
    }

    #[test]
    fn test_numeric_constants_dedup_across_streams() {
        let rt = rt();
        let mut a = CodeStream::new(&rt, &Value::null());
        let ia = a.const_idx(Value::real(3.5));
        let mut b = CodeStream::new(&rt, &Value::null());
        let ib = b.const_idx(Value::real(3.5));
        assert_eq!(ia, ib);
    }
}
