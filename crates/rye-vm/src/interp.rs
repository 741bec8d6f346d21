use std::any::Any;
use std::rc::Rc;

use rye_core::{
    as_logical_scalar, condition_to_bool, intern, lgl_and, lgl_or, match_args, resolve, sym,
    Arg, Binding, BuiltinDef, ClosureData, Env, Eval, Kind, RyeError, Spur, Unwind, Value,
    Visibility, COND_LENGTH_WARNING,
};

use crate::code::{CodeObject, CompiledBody, FunctionObject, PromiseCode, DOTS_ARG_IDX,
    MISSING_ARG_IDX};
use crate::compiler;
use crate::frame::{Frame, FrameKind};
use crate::opcodes::{op, type_tag, Op};
use crate::runtime::Runtime;
use crate::stack::OStack;

/// Bound on interpreter re-entrancy (closure calls, promise forcing,
/// builtin callbacks), standing in for the host's C-stack check.
const MAX_EVAL_DEPTH: usize = 1024;

/// The bytecode interpreter: dispatch loop, value stack, and frame stack.
/// One instance per runtime; re-entered synchronously whenever a builtin or
/// special evaluates code.
pub struct Interp<'rt> {
    rt: &'rt Runtime,
    stack: OStack,
    frames: Vec<Frame>,
    depth: usize,
}

impl<'rt> Interp<'rt> {
    pub fn new(rt: &'rt Runtime) -> Interp<'rt> {
        Interp {
            rt,
            stack: OStack::new(),
            frames: Vec::new(),
            depth: 0,
        }
    }

    pub fn runtime(&self) -> &'rt Runtime {
        self.rt
    }

    /// Value-stack length; exposed for balance assertions.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Frame-stack length; exposed for balance assertions.
    pub fn frame_len(&self) -> usize {
        self.frames.len()
    }

    // ── Entry points ──────────────────────────────────────────────

    /// Evaluate a compiled function's entry body in `env`.
    pub fn eval_function(
        &mut self,
        fun: &Rc<FunctionObject>,
        env: &Env,
    ) -> Result<Value, RyeError> {
        self.frames.push(Frame {
            kind: FrameKind::Toplevel,
            stack_top: self.stack.len(),
            call: Value::null(),
            env: env.clone(),
        });
        let result = self.eval_code(&fun.entry().clone(), fun, env);
        self.frames.pop();
        result.map(escape).map_err(unwind_to_error)
    }

    /// Compile and evaluate, short-circuiting self-evaluating expressions.
    pub fn eval_expr(&mut self, ast: &Value, env: &Env) -> Result<Value, RyeError> {
        self.eval_any(ast, env).map_err(unwind_to_error)
    }

    /// Force a promise value from the outside.
    pub fn eval_promise(&mut self, promise: &Value) -> Result<Value, RyeError> {
        self.force_value(promise).map_err(unwind_to_error)
    }

    /// The host evaluator: handles self-evaluating values with minimal
    /// overhead, compiles language objects on the fly.
    fn eval_any(&mut self, e: &Value, env: &Env) -> Eval<Value> {
        self.rt.visible.set(true);
        if e.is_lang() {
            let fun = compiler::compile(self.rt, e).map_err(Unwind::Error)?;
            let entry = fun.entry().clone();
            return self.eval_code(&entry, &fun, env).map(escape);
        }
        if let Some(name) = e.as_symbol() {
            if name == sym::dots() {
                return Err(Unwind::Error(RyeError::eval(
                    "'...' used in an incorrect context",
                )));
            }
            if let Some(n) = rye_core::ddval(name) {
                return self.dd_lookup(n, name, env);
            }
            return self.get_var(name, env);
        }
        if e.is_promise() {
            return self.force_value(e);
        }
        if let Some(code) = e.as_code() {
            let pc: Rc<PromiseCode> = downcast_code(&code.handle)?;
            let body = pc
                .fun
                .code_at(pc.idx)
                .ok_or_else(|| internal("stale code reference"))?
                .clone();
            return self.eval_code(&body, &pc.fun.clone(), env).map(escape);
        }
        if e.is_dots() {
            return Err(Unwind::Error(RyeError::eval(
                "'...' used in an incorrect context",
            )));
        }
        // Constants in expressions must act immutable wherever they leak.
        e.mark_shared();
        Ok(e.clone())
    }

    // ── The dispatch loop ─────────────────────────────────────────

    fn eval_code(
        &mut self,
        code: &Rc<CodeObject>,
        fun: &Rc<FunctionObject>,
        env: &Env,
    ) -> Eval<Value> {
        self.depth += 1;
        if self.depth > MAX_EVAL_DEPTH {
            self.depth -= 1;
            return Err(Unwind::Error(RyeError::eval(
                "evaluation nested too deeply: infinite recursion?",
            )));
        }
        let result = self.run(code, fun, env);
        self.depth -= 1;
        result
    }

    fn run(&mut self, code: &Rc<CodeObject>, fun: &Rc<FunctionObject>, env: &Env) -> Eval<Value> {
        let code = code.clone();
        let fun = fun.clone();
        // Slack of 5 so call instructions can park intermediates.
        self.stack.reserve(code.stack_depth as usize + 5);
        let frame_floor = self.frames.len();
        let entry_sp = self.stack.len();

        let ops: &[u8] = &code.ops;
        let mut pc: usize = 0;
        self.rt.visible.set(true);

        macro_rules! imm_u32 {
            () => {{
                let v = u32::from_le_bytes(ops[pc..pc + 4].try_into().unwrap());
                pc += 4;
                v
            }};
        }
        macro_rules! imm_i32 {
            () => {{
                let v = i32::from_le_bytes(ops[pc..pc + 4].try_into().unwrap());
                pc += 4;
                v
            }};
        }

        loop {
            let instr_pc = pc as u32;
            debug_assert!(pc < ops.len(), "pc {pc} out of bounds");
            let byte = ops[pc];
            pc += 1;

            let step: Eval<()> = match byte {
                op::PUSH => {
                    let k = imm_u32!();
                    self.rt.visible.set(true);
                    self.stack.push(self.rt.const_at(k));
                    Ok(())
                }
                op::LDFUN => {
                    let k = imm_u32!();
                    let name = self.const_symbol(k)?;
                    match self.find_fun(name, env) {
                        Ok(f) => {
                            self.stack.push(f);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                op::LDVAR => {
                    let k = imm_u32!();
                    let name = self.const_symbol(k)?;
                    self.rt.visible.set(true);
                    match self.get_var(name, env) {
                        Ok(v) => {
                            self.stack.push(v);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                op::LDDDVAR => {
                    let k = imm_u32!();
                    let name = self.const_symbol(k)?;
                    self.rt.visible.set(true);
                    let n = rye_core::ddval(name)
                        .ok_or_else(|| internal("ldddvar on a non-positional symbol"))?;
                    match self.dd_lookup(n, name, env) {
                        Ok(v) => {
                            self.stack.push(v);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                op::PUSH_CODE => {
                    let idx = imm_u32!();
                    let body = self.code_at(&fun, idx)?;
                    let ast = self.rt.src_at(body.src);
                    self.stack.push(Value::code(
                        Rc::new(PromiseCode {
                            fun: fun.clone(),
                            idx,
                        }),
                        ast,
                    ));
                    Ok(())
                }
                op::MK_PROM => {
                    let idx = imm_u32!();
                    let p = self.make_arg_promise(&fun, idx, env)?;
                    self.stack.push(p);
                    Ok(())
                }
                op::FORCE => {
                    let p = self.stack.pop();
                    match self.force_value(&p) {
                        Ok(v) => {
                            self.stack.push(v);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                op::CALL => {
                    let args_k = imm_u32!();
                    let names_k = imm_u32!();
                    let callee = self.stack.pop();
                    let call = self.call_src(&code, instr_pc)?;
                    let idxs = self.const_indices(args_k)?;
                    let names = self.rt.const_at(names_k);
                    match self.do_call(&fun, &call, callee, &idxs, &names, env) {
                        Ok(v) => {
                            self.stack.push(v);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                op::CALL_STACK => {
                    let nargs = imm_u32!() as usize;
                    let names_k = imm_u32!();
                    let call = self.call_src(&code, instr_pc)?;
                    let names = self.rt.const_at(names_k);
                    match self.do_call_stack(&call, nargs, &names, env) {
                        Ok(v) => {
                            self.stack.push(v);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                op::DISPATCH => {
                    let args_k = imm_u32!();
                    let names_k = imm_u32!();
                    let sel_k = imm_u32!();
                    let selector = self.const_symbol(sel_k)?;
                    let obj = self.stack.pop();
                    let call = self.call_src(&code, instr_pc)?;
                    let idxs = self.const_indices(args_k)?;
                    let names = self.rt.const_at(names_k);
                    match self.do_dispatch(&fun, &call, selector, obj, &idxs, &names, env) {
                        Ok(v) => {
                            self.stack.push(v);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                op::BR => {
                    let off = imm_i32!();
                    pc = offset_pc(pc, off);
                    Ok(())
                }
                op::BR_TRUE => {
                    let off = imm_i32!();
                    if self.stack.pop().as_lgl_scalar() == Some(Some(true)) {
                        pc = offset_pc(pc, off);
                    }
                    Ok(())
                }
                op::BR_FALSE => {
                    let off = imm_i32!();
                    if self.stack.pop().as_lgl_scalar() == Some(Some(false)) {
                        pc = offset_pc(pc, off);
                    }
                    Ok(())
                }
                op::BR_OBJ => {
                    let off = imm_i32!();
                    if self.stack.top().is_object() {
                        pc = offset_pc(pc, off);
                    }
                    Ok(())
                }
                op::BEGIN_LOOP => {
                    let off = imm_i32!();
                    self.frames.push(Frame {
                        kind: FrameKind::Loop {
                            resume_pc: pc,
                            break_pc: offset_pc(pc, off),
                        },
                        stack_top: self.stack.len(),
                        call: Value::null(),
                        env: env.clone(),
                    });
                    Ok(())
                }
                op::END_CONTEXT => {
                    debug_assert!(self.frames.len() > frame_floor, "frame stack botched");
                    self.frames.pop();
                    Ok(())
                }
                op::RET => {
                    let result = self.stack.pop();
                    debug_assert_eq!(self.stack.len(), entry_sp, "stack not balanced at ret");
                    debug_assert_eq!(self.frames.len(), frame_floor, "frames not balanced at ret");
                    return Ok(result);
                }
                op::POP => {
                    self.stack.pop();
                    Ok(())
                }
                op::DUP => {
                    let v = self.stack.top().clone();
                    self.stack.push(v);
                    Ok(())
                }
                op::DUP2 => {
                    let a = self.stack.at(1).clone();
                    let b = self.stack.at(0).clone();
                    self.stack.push(a);
                    self.stack.push(b);
                    Ok(())
                }
                op::SWAP => {
                    self.stack.swap();
                    Ok(())
                }
                op::PICK => {
                    let n = imm_u32!() as usize;
                    self.stack.pick(n);
                    Ok(())
                }
                op::PUT => {
                    let n = imm_u32!() as usize;
                    self.stack.put(n);
                    Ok(())
                }
                op::AS_BOOL => self.ins_asbool(),
                op::AS_LOGICAL => {
                    let v = self.stack.pop();
                    self.stack.push(Value::logical(vec![as_logical_scalar(&v)]));
                    Ok(())
                }
                op::LGL_AND => self.ins_lgl(true),
                op::LGL_OR => self.ins_lgl(false),
                op::IS => {
                    let tag = imm_u32!();
                    let v = self.stack.pop();
                    match type_test(&v, tag) {
                        Some(res) => {
                            self.stack.push(Value::lgl(res));
                            Ok(())
                        }
                        None => Err(internal("unknown type tag").into()),
                    }
                }
                op::ST_VAR => {
                    let k = imm_u32!();
                    let name = self.const_symbol(k)?;
                    let v = escape(self.stack.pop());
                    v.bump_named();
                    env.define(name, v);
                    Ok(())
                }
                op::LT => self.ins_arith(Op::Lt, &code, instr_pc, env),
                op::ADD => self.ins_arith(Op::Add, &code, instr_pc, env),
                op::SUB => self.ins_arith(Op::Sub, &code, instr_pc, env),
                op::INC => self.ins_inc(),
                op::TEST_BOUNDS => {
                    let vec = self.stack.at(1);
                    let idx = self.stack.at(0);
                    let i = idx
                        .as_int_scalar()
                        .map(i64::from)
                        .or_else(|| idx.as_real_scalar().map(|x| x as i64));
                    let len = vec.length() as i64;
                    let ok = matches!(i, Some(i) if i > 0 && i <= len);
                    self.stack.push(Value::lgl(ok));
                    Ok(())
                }
                op::EXTRACT1 => self.ins_extract(true, &code, instr_pc, env),
                op::SUBSET1 => self.ins_extract(false, &code, instr_pc, env),
                op::INVISIBLE => {
                    self.rt.visible.set(false);
                    Ok(())
                }
                op::UNIQ => {
                    if self.stack.top().maybe_shared() {
                        let dup = self.stack.top().shallow_duplicate();
                        self.stack.set_at(0, dup);
                    }
                    self.stack.top().bump_named();
                    Ok(())
                }
                op::AS_AST => {
                    let v = self.stack.pop();
                    if let Some(p) = v.as_promise() {
                        self.stack.push(p.expr.clone());
                        Ok(())
                    } else if let Some(c) = v.as_code() {
                        self.stack.push(c.ast.clone());
                        Ok(())
                    } else {
                        Err(internal("asast on a non-promise").into())
                    }
                }
                op::IS_FUN => {
                    let v = self.stack.top().clone();
                    if let Some(data) = v.as_closure() {
                        self.jit(&data).map(|_| ())
                    } else if v.as_builtin().is_some() {
                        Ok(())
                    } else {
                        Err(Unwind::Error(RyeError::NonFunction))
                    }
                }
                op::GUARD_FUN => {
                    let k = imm_u32!();
                    let off = imm_i32!();
                    let name = self.const_symbol(k)?;
                    if !self.guard_holds(name, env) {
                        pc = offset_pc(pc, off);
                    }
                    Ok(())
                }
                other => Err(internal(format!("wrong or unimplemented opcode {other}")).into()),
            };

            if let Err(unwind) = step {
                let is_break = matches!(unwind, Unwind::Break);
                let is_loop_jump = is_break || matches!(unwind, Unwind::Next);
                // `break`/`next` land on the innermost loop frame installed
                // by this invocation; the frame's stack snapshot is restored
                // and the frame itself stays for the landing `endcontext`.
                if is_loop_jump {
                    let caught = (frame_floor..self.frames.len())
                        .rev()
                        .find(|&i| self.frames[i].is_loop());
                    if let Some(fi) = caught {
                        let (resume_pc, break_pc, snap) = match &self.frames[fi] {
                            Frame {
                                kind: FrameKind::Loop { resume_pc, break_pc },
                                stack_top,
                                ..
                            } => (*resume_pc, *break_pc, *stack_top),
                            _ => unreachable!(),
                        };
                        self.frames.truncate(fi + 1);
                        self.stack.truncate(snap);
                        pc = if is_break { break_pc } else { resume_pc };
                        continue;
                    }
                }
                // Anything else unwinds past this invocation after the frame
                // and stack discipline has been re-established.
                self.frames.truncate(frame_floor);
                self.stack.truncate(entry_sp);
                return Err(unwind);
            }
        }
    }

    // ── Instruction helpers ───────────────────────────────────────

    fn ins_asbool(&mut self) -> Eval<()> {
        let v = self.stack.pop();
        match condition_to_bool(&v) {
            Ok((b, warn)) => {
                if warn {
                    self.rt.warn(COND_LENGTH_WARNING.to_string());
                }
                self.stack.push(Value::lgl(b));
                Ok(())
            }
            Err(msg) => Err(Unwind::Error(RyeError::Condition(msg))),
        }
    }

    fn ins_lgl(&mut self, and: bool) -> Eval<()> {
        let y = self.stack.pop();
        let x = self.stack.pop();
        let (a, b) = match (x.as_lgl_scalar(), y.as_lgl_scalar()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(internal("logical op on non-scalar operands").into()),
        };
        let res = if and { lgl_and(a, b) } else { lgl_or(a, b) };
        self.stack.push(Value::logical(vec![res]));
        Ok(())
    }

    /// Scalar-real fast path for `+`, `-`, `<`; anything else goes through
    /// the base builtin.
    fn ins_arith(&mut self, op: Op, code: &Rc<CodeObject>, instr_pc: u32, env: &Env) -> Eval<()> {
        let rhs = self.stack.pop();
        let lhs = self.stack.pop();
        if let (Some(a), Some(b)) = (lhs.as_real_scalar(), rhs.as_real_scalar()) {
            let out = match op {
                Op::Add => {
                    let v = Value::real(a + b);
                    v.set_named(1);
                    v
                }
                Op::Sub => {
                    let v = Value::real(a - b);
                    v.set_named(1);
                    v
                }
                Op::Lt => Value::lgl(a < b),
                _ => unreachable!(),
            };
            self.stack.push(out);
            return Ok(());
        }
        let name = match op {
            Op::Add => sym::add(),
            Op::Sub => sym::sub(),
            Op::Lt => sym::lt(),
            _ => unreachable!(),
        };
        let def = self
            .rt
            .base_builtin(name)
            .ok_or_else(|| internal("missing base arithmetic builtin"))?;
        let call = self.rt.src_at(code.src_at(instr_pc));
        let args = vec![Arg::pos(lhs), Arg::pos(rhs)];
        let res = self.apply_builtin_def(&def, &call, args, env)?;
        self.stack.push(res);
        Ok(())
    }

    fn ins_inc(&mut self) -> Eval<()> {
        let n = self.stack.top().clone();
        let i = n
            .as_int_scalar()
            .ok_or_else(|| internal("inc on a non-integer counter"))?;
        if n.maybe_shared() {
            self.stack.pop();
            self.stack.push(Value::int(i + 1));
        } else {
            let mut kind = n.kind_mut();
            if let Kind::Int(v) = &mut *kind {
                v[0] = i + 1;
            }
        }
        Ok(())
    }

    /// Attribute-free scalar fast path for `[[`/`[`, falling back to the
    /// base builtin (whose failures, including out-of-bounds, are ordinary
    /// conditions).
    fn ins_extract(
        &mut self,
        exact: bool,
        code: &Rc<CodeObject>,
        instr_pc: u32,
        env: &Env,
    ) -> Eval<()> {
        let idx = self.stack.pop();
        let val = self.stack.pop();

        if !val.has_attrs() && !idx.has_attrs() {
            let i = idx
                .as_int_scalar()
                .map(i64::from)
                .or_else(|| idx.as_real_scalar().map(|x| x as i64))
                .or_else(|| idx.as_lgl_scalar().flatten().map(|b| b as i64));
            if let Some(i) = i {
                if i >= 1 {
                    let pos = (i - 1) as usize;
                    let elem = match &*val.kind() {
                        Kind::Real(v) => v.get(pos).map(|&x| Value::real(x)),
                        Kind::Int(v) => v.get(pos).map(|&x| Value::int(x)),
                        Kind::Logical(v) => v.get(pos).map(|&x| Value::logical(vec![x])),
                        _ => None,
                    };
                    if let Some(elem) = elem {
                        self.rt.visible.set(true);
                        self.stack.push(elem);
                        return Ok(());
                    }
                }
            }
        }

        let name = if exact {
            sym::double_bracket()
        } else {
            sym::bracket()
        };
        let def = self
            .rt
            .base_builtin(name)
            .ok_or_else(|| internal("missing base subset builtin"))?;
        let call = self.rt.src_at(code.src_at(instr_pc));
        let args = vec![Arg::pos(val), Arg::pos(idx)];
        let res = self.apply_builtin_def(&def, &call, args, env)?;
        self.rt.visible.set(true);
        self.stack.push(res);
        Ok(())
    }

    // ── Variable lookup ───────────────────────────────────────────

    fn get_var(&mut self, name: Spur, env: &Env) -> Eval<Value> {
        match env.get(name) {
            None => Err(Unwind::Error(RyeError::Unbound(resolve(name)))),
            Some(v) if v.is_missing() => {
                Err(Unwind::Error(RyeError::MissingArg(resolve(name))))
            }
            Some(v) => {
                let v = if v.is_promise() {
                    self.force_value(&v)?
                } else {
                    v
                };
                if v.named() == 0 && !v.is_null() {
                    v.set_named(1);
                }
                Ok(v)
            }
        }
    }

    /// `..N` lookup: index into the `...` binding.
    fn dd_lookup(&mut self, n: usize, name: Spur, env: &Env) -> Eval<Value> {
        let dots = env
            .get(sym::dots())
            .ok_or_else(|| Unwind::Error(RyeError::Unbound(resolve(name))))?;
        let items = dots
            .as_dots()
            .ok_or_else(|| Unwind::Error(RyeError::Unbound(resolve(name))))?;
        match items.get(n - 1) {
            None => Err(Unwind::Error(RyeError::MissingArg(resolve(name)))),
            Some(arg) if arg.value.is_missing() => {
                Err(Unwind::Error(RyeError::MissingArg(resolve(name))))
            }
            Some(arg) => {
                let v = if arg.value.is_promise() {
                    self.force_value(&arg.value)?
                } else {
                    arg.value.clone()
                };
                if v.named() == 0 && !v.is_null() {
                    v.set_named(1);
                }
                Ok(v)
            }
        }
    }

    /// `findFun`: walk the chain skipping non-function bindings, forcing
    /// promises encountered along the way, compiling closures on demand.
    fn find_fun(&mut self, name: Spur, env: &Env) -> Eval<Value> {
        match self.try_find_fun(name, env)? {
            Some(f) => Ok(f),
            None => Err(Unwind::Error(RyeError::UnboundFunction(resolve(name)))),
        }
    }

    fn try_find_fun(&mut self, name: Spur, env: &Env) -> Eval<Option<Value>> {
        let mut cursor = Some(env.clone());
        while let Some(e) = cursor {
            if let Some(binding) = e.get_local(name) {
                let v = if binding.is_promise() {
                    self.force_value(&binding)?
                } else {
                    binding
                };
                if v.is_function() {
                    if let Some(data) = v.as_closure() {
                        self.jit(&data)?;
                    }
                    return Ok(Some(v));
                }
            }
            cursor = e.parent();
        }
        Ok(None)
    }

    /// Does `name` still resolve to its base definition? Used by the guard
    /// side-exits of inlined special forms. Promises and closures count as
    /// shadowing (the slow path re-resolves them properly).
    fn guard_holds(&self, name: Spur, env: &Env) -> bool {
        let Some(base) = self.rt.base_builtin(name) else {
            return false;
        };
        let mut cursor = Some(env.clone());
        while let Some(e) = cursor {
            if let Some(binding) = e.get_local(name) {
                if let Some(def) = binding.as_builtin() {
                    return Rc::ptr_eq(&def, &base);
                }
                if binding.is_closure() || binding.is_promise() {
                    return false;
                }
                // Plain variables do not shadow functions.
            }
            cursor = e.parent();
        }
        false
    }

    // ── Promises ──────────────────────────────────────────────────

    fn make_arg_promise(
        &self,
        fun: &Rc<FunctionObject>,
        idx: u32,
        env: &Env,
    ) -> Eval<Value> {
        let body = self.code_at(fun, idx)?;
        let expr = self.rt.src_at(body.src);
        let p = Value::promise(expr, env.clone());
        let data = p.as_promise().unwrap();
        *data.code.borrow_mut() = Some(Rc::new(PromiseCode {
            fun: fun.clone(),
            idx,
        }) as Rc<dyn Any>);
        Ok(p)
    }

    /// Force a promise. Once forced, the stored value is locked against
    /// in-place mutation and returned on every further force.
    fn force_value(&mut self, promise: &Value) -> Eval<Value> {
        let data = promise
            .as_promise()
            .ok_or_else(|| internal("force on a non-promise"))?;
        if let Some(v) = data.value.borrow().clone() {
            v.mark_shared();
            return Ok(v);
        }
        let code = data.code.borrow().clone();
        let result = match code {
            Some(handle) => {
                let pc: Rc<PromiseCode> = downcast_code(&handle)?;
                let body = pc
                    .fun
                    .code_at(pc.idx)
                    .ok_or_else(|| internal("stale promise code index"))?
                    .clone();
                self.eval_code(&body, &pc.fun.clone(), &data.env)?
            }
            None => self.eval_any(&data.expr, &data.env)?,
        };
        let result = escape(result);
        result.mark_shared();
        *data.value.borrow_mut() = Some(result.clone());
        Ok(result)
    }

    /// Compile a closure body on demand, caching the result on the closure.
    fn jit(&self, data: &ClosureData) -> Eval<Rc<CompiledBody>> {
        if let Some(cached) = data.compiled.borrow().as_ref() {
            return cached
                .clone()
                .downcast::<CompiledBody>()
                .map_err(|_| internal("foreign compiled body on closure").into());
        }
        let compiled = compiler::compile_closure(self.rt, data).map_err(Unwind::Error)?;
        *data.compiled.borrow_mut() = Some(compiled.clone() as Rc<dyn Any>);
        Ok(compiled)
    }

    // ── Argument lists ────────────────────────────────────────────

    /// Build the argument list for a call instruction from promise-body
    /// indices. Eager mode evaluates each body immediately (builtins);
    /// otherwise arguments become unforced promises (closures, dispatch).
    fn create_args_list(
        &mut self,
        fun: &Rc<FunctionObject>,
        idxs: &[u32],
        names: &Value,
        call: &Value,
        env: &Env,
        eager: bool,
    ) -> Eval<Vec<Arg>> {
        let tags = unpack_names(names, idxs.len());
        let mut out = Vec::with_capacity(idxs.len());
        for (i, &idx) in idxs.iter().enumerate() {
            match idx {
                DOTS_ARG_IDX => self.expand_dots(&mut out, env, eager)?,
                MISSING_ARG_IDX => {
                    if eager {
                        return Err(Unwind::Error(RyeError::eval(format!(
                            "argument {} is empty ({})",
                            i + 1,
                            call.deparse()
                        ))));
                    }
                    out.push(Arg::pos(Value::missing()));
                }
                _ => {
                    let value = if eager {
                        let body = self.code_at(fun, idx)?;
                        escape(self.eval_code(&body, fun, env)?)
                    } else {
                        self.make_arg_promise(fun, idx, env)?
                    };
                    out.push(Arg {
                        tag: tags[i],
                        value,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Inline the `...` binding into an argument list, keeping tags.
    fn expand_dots(&mut self, out: &mut Vec<Arg>, env: &Env, eager: bool) -> Eval<()> {
        let Some(dots) = env.get(sym::dots()) else {
            return Ok(());
        };
        let Some(items) = dots.as_dots() else {
            return Ok(());
        };
        for item in items {
            let value = if eager && item.value.is_promise() {
                self.force_value(&item.value)?
            } else {
                item.value.clone()
            };
            out.push(Arg {
                tag: item.tag,
                value,
            });
        }
        Ok(())
    }

    /// Argument list for `call_stack`: the values are already on the stack.
    /// `quote_values` wraps symbols and calls in `quote(..)` so a special
    /// callee will not re-evaluate them.
    fn collect_stack_args(
        &mut self,
        nargs: usize,
        names: &Value,
        env: &Env,
        eager: bool,
        quote_values: bool,
    ) -> Eval<Vec<Arg>> {
        let tags = unpack_names(names, nargs);
        let mut out = Vec::with_capacity(nargs);
        for i in 0..nargs {
            let v = self.stack.at(nargs - 1 - i).clone();
            if v.is_dots_symbol() {
                self.expand_dots(&mut out, env, eager)?;
                continue;
            }
            if v.is_missing() {
                out.push(Arg {
                    tag: tags[i],
                    value: v,
                });
                continue;
            }
            let mut value = if eager && v.is_promise() {
                self.force_value(&v)?
            } else {
                v
            };
            value = escape(value);
            if quote_values && (value.is_lang() || value.is_symbol()) {
                value = Value::quoted(value);
            }
            out.push(Arg {
                tag: tags[i],
                value,
            });
        }
        Ok(out)
    }

    // ── The call protocol ─────────────────────────────────────────

    fn do_call(
        &mut self,
        fun: &Rc<FunctionObject>,
        call: &Value,
        callee: Value,
        idxs: &[u32],
        names: &Value,
        env: &Env,
    ) -> Eval<Value> {
        if let Some(def) = callee.as_builtin() {
            if def.is_special() {
                let args = call.as_lang().map(|c| c.args).unwrap_or_default();
                return self.apply_builtin_def(&def, call, args, env);
            }
            let args = self.create_args_list(fun, idxs, names, call, env, true)?;
            return self.apply_builtin_def(&def, call, args, env);
        }
        if callee.is_closure() {
            let actuals = self.create_args_list(fun, idxs, names, call, env, false)?;
            return self.call_closure(call, &callee, actuals);
        }
        Err(Unwind::Error(RyeError::NonFunction))
    }

    fn do_call_stack(
        &mut self,
        call: &Value,
        nargs: usize,
        names: &Value,
        env: &Env,
    ) -> Eval<Value> {
        let callee = self.stack.at(nargs).clone();
        let result = if let Some(def) = callee.as_builtin() {
            if def.is_special() {
                let args = self.collect_stack_args(nargs, names, env, false, true)?;
                self.drop_call_operands(nargs);
                self.apply_builtin_def(&def, call, args, env)
            } else {
                let args = self.collect_stack_args(nargs, names, env, true, false)?;
                self.drop_call_operands(nargs);
                self.apply_builtin_def(&def, call, args, env)
            }
        } else if callee.is_closure() {
            let actuals = self.collect_stack_args(nargs, names, env, false, false)?;
            self.drop_call_operands(nargs);
            self.call_closure(call, &callee, actuals)
        } else {
            Err(Unwind::Error(RyeError::NonFunction))
        };
        result
    }

    fn drop_call_operands(&mut self, nargs: usize) {
        let keep = self.stack.len() - nargs - 1;
        self.stack.truncate(keep);
    }

    /// Invoke a builtin or special with a ready argument list, handling the
    /// visibility contract and the stack snapshot discipline.
    fn apply_builtin_def(
        &mut self,
        def: &Rc<BuiltinDef>,
        call: &Value,
        args: Vec<Arg>,
        env: &Env,
    ) -> Eval<Value> {
        let sp = self.stack.len();
        self.apply_visibility(def);
        let result = (def.func)(self, call, &args, env);
        // Restore the stack on every path; non-local entries land on a
        // frame whose snapshot sits at or below this point.
        self.stack.truncate(sp);
        if result.is_ok() {
            self.apply_visibility(def);
        }
        result
    }

    fn apply_visibility(&self, def: &BuiltinDef) {
        match def.visibility {
            Visibility::On => self.rt.visible.set(true),
            Visibility::Off => self.rt.visible.set(false),
            Visibility::Keep => {}
        }
    }

    /// Call a compiled closure: match actuals to formals in a fresh child of
    /// the defining environment, install the return frame, and run the
    /// entry body under the restart trampoline.
    fn call_closure(&mut self, call: &Value, callee: &Value, actuals: Vec<Arg>) -> Eval<Value> {
        let data = callee
            .as_closure()
            .ok_or_else(|| internal("closure call on a non-closure"))?;
        let compiled = self.jit(&data)?;
        let new_env = data.env.child();

        let bindings = match_args(&data.formals, &actuals).map_err(Unwind::Error)?;
        for (i, (name, binding)) in bindings.into_iter().enumerate() {
            match binding {
                Binding::Supplied(v) => new_env.define(name, v),
                Binding::Dots(rest) => new_env.define(name, Value::dots(rest)),
                Binding::Missing => match compiled.formal_codes.get(i) {
                    Some(&idx) if idx != MISSING_ARG_IDX => {
                        let default = self.make_arg_promise(&compiled.fun, idx, &new_env)?;
                        new_env.define(name, default);
                    }
                    _ => new_env.define(name, Value::missing()),
                },
            }
        }

        self.frames.push(Frame {
            kind: FrameKind::FunctionReturn,
            stack_top: self.stack.len(),
            call: call.clone(),
            env: new_env.clone(),
        });
        let fi = self.frames.len() - 1;

        let entry = compiled.fun.entry().clone();
        let result = loop {
            match self.eval_code(&entry, &compiled.fun, &new_env) {
                Ok(v) => break Ok(v),
                Err(Unwind::Return(v)) => {
                    self.stack.truncate(self.frames[fi].stack_top);
                    break Ok(v);
                }
                Err(Unwind::Restart) => {
                    // A restart token re-enters the same body.
                    self.stack.truncate(self.frames[fi].stack_top);
                    continue;
                }
                Err(e) => break Err(e),
            }
        };
        self.frames.truncate(fi);
        result.map(escape)
    }

    /// Apply any callable to already-evaluated (or promised) arguments.
    fn apply_value(
        &mut self,
        call: &Value,
        callee: &Value,
        args: Vec<Arg>,
        env: &Env,
    ) -> Eval<Value> {
        if let Some(def) = callee.as_builtin() {
            let args = if def.is_special() {
                args
            } else {
                // Builtins are eager; force any promises in the list.
                let mut forced = Vec::with_capacity(args.len());
                for a in args {
                    let value = if a.value.is_promise() {
                        self.force_value(&a.value)?
                    } else {
                        a.value
                    };
                    forced.push(Arg { tag: a.tag, value });
                }
                forced
            };
            return self.apply_builtin_def(&def, call, args, env);
        }
        if callee.is_closure() {
            return self.call_closure(call, callee, args);
        }
        Err(Unwind::Error(RyeError::NonFunction))
    }

    // ── Dispatch ──────────────────────────────────────────────────

    /// Formal (multi-argument) dispatch, then single dispatch, then an
    /// ordinary call of the selector. Each arm re-establishes the stack
    /// snapshot so non-local exits stay consistent.
    fn do_dispatch(
        &mut self,
        fun: &Rc<FunctionObject>,
        call: &Value,
        selector: Spur,
        obj: Value,
        idxs: &[u32],
        names: &Value,
        env: &Env,
    ) -> Eval<Value> {
        let actuals = self.create_args_list(fun, idxs, names, call, env, false)?;
        // The receiver is already evaluated: pre-fill its promise.
        if let Some(first) = actuals.first() {
            if let Some(p) = first.value.as_promise() {
                *p.value.borrow_mut() = Some(obj.clone());
            }
        }
        let sp = self.stack.len();

        if obj.is_s4() && self.rt.has_s4_methods(selector) {
            for class in obj.class_names() {
                if let Some(method) = self.rt.s4_method(selector, intern(&class)) {
                    let res = self.apply_value(call, &method, actuals.clone(), env);
                    self.stack.truncate(sp);
                    return res;
                }
            }
        }

        let generic = resolve(selector);
        if let Some(res) = self.s3_dispatch_inner(&generic, &obj, call, actuals.clone(), env)? {
            self.stack.truncate(sp);
            return Ok(res);
        }

        let callee = self.find_fun(selector, env)?;
        let res = self.apply_value(call, &callee, actuals, env);
        self.stack.truncate(sp);
        res
    }

    /// `usemethod`: try `generic.class` for each class, then
    /// `generic.default`.
    fn s3_dispatch_inner(
        &mut self,
        generic: &str,
        obj: &Value,
        call: &Value,
        args: Vec<Arg>,
        env: &Env,
    ) -> Eval<Option<Value>> {
        let mut classes: Vec<String> =
            obj.class_names().iter().map(|c| c.to_string()).collect();
        classes.push("default".to_string());
        for class in classes {
            let method_name = intern(&format!("{generic}.{class}"));
            if let Some(method) = self.try_find_fun(method_name, env)? {
                return self.apply_value(call, &method, args.clone(), env).map(Some);
            }
        }
        Ok(None)
    }

    // ── Small shared readers ──────────────────────────────────────

    fn const_symbol(&self, k: u32) -> Eval<Spur> {
        self.rt
            .const_at(k)
            .as_symbol()
            .ok_or_else(|| internal("pool entry is not a symbol").into())
    }

    fn const_indices(&self, k: u32) -> Eval<Vec<u32>> {
        match &*self.rt.const_at(k).kind() {
            Kind::Int(v) => Ok(v.iter().map(|&i| i as u32).collect()),
            _ => Err(internal("argument index pool entry is not an integer vector").into()),
        }
    }

    fn code_at(&self, fun: &Rc<FunctionObject>, idx: u32) -> Eval<Rc<CodeObject>> {
        fun.code_at(idx)
            .cloned()
            .ok_or_else(|| internal("code index out of range").into())
    }

    /// The source expression of the call instruction at `instr_pc`; call
    /// instructions always carry one.
    fn call_src(&self, code: &CodeObject, instr_pc: u32) -> Eval<Value> {
        let key = code
            .src_at_exact(instr_pc)
            .ok_or_else(|| internal("call instruction without a source record"))?;
        Ok(self.rt.src_at(key))
    }
}

fn offset_pc(pc: usize, off: i32) -> usize {
    (pc as i64 + off as i64) as usize
}

fn type_test(v: &Value, tag: u32) -> Option<bool> {
    Some(match tag {
        type_tag::NULL => v.is_null(),
        type_tag::LOGICAL => matches!(&*v.kind(), Kind::Logical(_)),
        type_tag::REAL => matches!(&*v.kind(), Kind::Real(_)),
        type_tag::LIST => v.is_list() || v.is_pairlist(),
        type_tag::PAIRLIST => v.is_pairlist() || v.is_null(),
        _ => return None,
    })
}

/// Code objects must never leak to user code; convert them back to their
/// source expression at every boundary.
fn escape(v: Value) -> Value {
    match v.as_code() {
        Some(c) => c.ast,
        None => v,
    }
}

fn internal(msg: impl Into<String>) -> RyeError {
    RyeError::Internal(msg.into())
}

fn downcast_code(handle: &Rc<dyn Any>) -> Eval<Rc<PromiseCode>> {
    handle
        .clone()
        .downcast::<PromiseCode>()
        .map_err(|_| internal("foreign code handle").into())
}

fn unwind_to_error(u: Unwind) -> RyeError {
    match u {
        Unwind::Error(e) => e,
        Unwind::Return(_) => RyeError::eval("no function to return from, jumping to top level"),
        Unwind::Break | Unwind::Next => {
            RyeError::eval("no loop for break/next, jumping to top level")
        }
        Unwind::Restart => internal("restart token escaped to top level"),
    }
}

fn unpack_names(names: &Value, n: usize) -> Vec<Option<Spur>> {
    match &*names.kind() {
        Kind::List(items) => {
            let mut out: Vec<Option<Spur>> = items.iter().map(|v| v.as_symbol()).collect();
            out.resize(n, None);
            out
        }
        _ => vec![None; n],
    }
}

impl rye_core::Evaluator for Interp<'_> {
    fn eval(&mut self, expr: &Value, env: &Env) -> Eval<Value> {
        self.eval_any(expr, env)
    }

    fn force(&mut self, promise: &Value) -> Eval<Value> {
        self.force_value(promise)
    }

    fn apply(&mut self, call: &Value, callee: &Value, args: Vec<Arg>, env: &Env) -> Eval<Value> {
        self.apply_value(call, callee, args, env)
    }

    fn find_function(&mut self, name: Spur, env: &Env) -> Eval<Value> {
        self.find_fun(name, env)
    }

    fn dispatch_s3(
        &mut self,
        generic: &str,
        obj: &Value,
        call: &Value,
        args: Vec<Arg>,
        env: &Env,
    ) -> Eval<Option<Value>> {
        self.s3_dispatch_inner(generic, obj, call, args, env)
    }

    fn register_s4_method(&mut self, selector: Spur, class: Spur, method: Value) {
        self.rt.register_s4_method(selector, class, method);
    }

    fn warn(&mut self, msg: String) {
        self.rt.warn(msg);
    }

    fn print_line(&mut self, line: String) {
        self.rt.print_line(line);
    }

    fn set_visible(&mut self, visible: bool) {
        self.rt.visible.set(visible);
    }
}
