use std::rc::Rc;

use rye_core::{ddval, intern, sym, Arg, Call, ClosureData, RyeError, Spur, Value};

use crate::code::{CodeObject, CompiledBody, FunctionObject, DOTS_ARG_IDX, MISSING_ARG_IDX};
use crate::codestream::CodeStream;
use crate::opcodes::{type_tag, Op};
use crate::runtime::Runtime;
use crate::verify;

/// Maximum recursion depth for the compiler, preventing native stack
/// overflow on deeply nested expressions.
const MAX_COMPILE_DEPTH: usize = 256;

/// Compile an expression into a function object: entry body at index 0,
/// promise bodies after it.
pub fn compile(rt: &Runtime, ast: &Value) -> Result<Rc<FunctionObject>, RyeError> {
    let mut c = Compiler::new(rt);
    let entry = c.compile_body(ast)?;
    let fun = c.finish(entry);
    if cfg!(debug_assertions) {
        verify::verify_function(&fun)?;
    }
    Ok(fun)
}

/// Compile a closure: default expressions of the formals become promise
/// bodies referenced by index, then the body becomes the entry.
pub fn compile_closure(rt: &Runtime, closure: &ClosureData) -> Result<Rc<CompiledBody>, RyeError> {
    let mut c = Compiler::new(rt);
    let mut formal_codes = Vec::with_capacity(closure.formals.len());
    for formal in &closure.formals {
        match &formal.default {
            Some(default) => formal_codes.push(c.compile_promise(default)?),
            None => formal_codes.push(MISSING_ARG_IDX),
        }
    }
    let entry = c.compile_body(&closure.body)?;
    let fun = c.finish(entry);
    if cfg!(debug_assertions) {
        verify::verify_function(&fun)?;
    }
    Ok(Rc::new(CompiledBody { fun, formal_codes }))
}

struct LoopLabels {
    cont: crate::codestream::Label,
    brk: crate::codestream::Label,
}

struct CodeCtx<'rt> {
    cs: CodeStream<'rt>,
    loops: Vec<LoopLabels>,
}

impl<'rt> CodeCtx<'rt> {
    fn new(rt: &'rt Runtime, ast: &Value) -> CodeCtx<'rt> {
        CodeCtx {
            cs: CodeStream::new(rt, ast),
            loops: Vec::new(),
        }
    }
}

struct Compiler<'rt> {
    rt: &'rt Runtime,
    /// Slot 0 is reserved for the entry body; promise bodies follow.
    codes: Vec<Option<Rc<CodeObject>>>,
    depth: usize,
}

impl<'rt> Compiler<'rt> {
    fn new(rt: &'rt Runtime) -> Compiler<'rt> {
        Compiler {
            rt,
            codes: vec![None],
            depth: 0,
        }
    }

    fn finish(mut self, entry: CodeObject) -> Rc<FunctionObject> {
        self.codes[0] = Some(Rc::new(entry));
        Rc::new(FunctionObject {
            codes: self.codes.into_iter().map(|c| c.unwrap()).collect(),
        })
    }

    fn compile_body(&mut self, ast: &Value) -> Result<CodeObject, RyeError> {
        let mut cx = CodeCtx::new(self.rt, ast);
        self.compile_expr(&mut cx, ast)?;
        cx.cs.emit(Op::Ret);
        cx.cs.finalize()
    }

    /// A nested code body ending in `Ret`, returned by local index.
    fn compile_promise(&mut self, ast: &Value) -> Result<u32, RyeError> {
        let code = self.compile_body(ast)?;
        self.codes.push(Some(Rc::new(code)));
        Ok(self.codes.len() as u32 - 1)
    }

    fn compile_expr(&mut self, cx: &mut CodeCtx<'rt>, ast: &Value) -> Result<(), RyeError> {
        self.depth += 1;
        if self.depth > MAX_COMPILE_DEPTH {
            self.depth -= 1;
            return Err(RyeError::eval("maximum compilation depth exceeded"));
        }
        let result = self.compile_expr_inner(cx, ast);
        self.depth -= 1;
        result
    }

    fn compile_expr_inner(&mut self, cx: &mut CodeCtx<'rt>, ast: &Value) -> Result<(), RyeError> {
        if let Some(call) = ast.as_lang() {
            return self.compile_call(cx, ast, &call);
        }
        if let Some(name) = ast.as_symbol() {
            self.compile_getvar(cx, name);
            return Ok(());
        }
        if let Some(promise) = ast.as_promise() {
            // Pre-evaluated promises occasionally appear inside source
            // (e.g. a right-hand side carried with its expression); emit
            // the forced value as a constant.
            let forced = promise.value.borrow().clone();
            match forced {
                Some(v) => {
                    self.compile_const(cx, &v);
                    cx.cs.add_src(&promise.expr);
                    return Ok(());
                }
                None => {
                    return Err(RyeError::eval(
                        "cannot compile an unevaluated promise in source",
                    ))
                }
            }
        }
        self.compile_const(cx, ast);
        Ok(())
    }

    fn compile_const(&mut self, cx: &mut CodeCtx<'rt>, v: &Value) {
        cx.cs.push_const(v.clone());
    }

    fn compile_getvar(&mut self, cx: &mut CodeCtx<'rt>, name: Spur) {
        let idx = cx.cs.sym_idx(name);
        if ddval(name).is_some() {
            cx.cs.op1(Op::LdDdVar, idx);
        } else {
            cx.cs.op1(Op::LdVar, idx);
        }
    }

    // ── Calls ─────────────────────────────────────────────────────

    fn compile_call(
        &mut self,
        cx: &mut CodeCtx<'rt>,
        ast: &Value,
        call: &Call,
    ) -> Result<(), RyeError> {
        match call.fun.as_symbol() {
            Some(name) => {
                if self.compile_special(cx, ast, name, &call.args)? {
                    return Ok(());
                }
                let idx = cx.cs.sym_idx(name);
                cx.cs.op1(Op::LdFun, idx);
            }
            None => {
                self.compile_expr(cx, &call.fun)?;
                cx.cs.emit(Op::IsFun);
            }
        }
        self.compile_call_args(cx, ast, &call.args)
    }

    /// Promise-wrap each argument and emit the call instruction. `...` and
    /// syntactically missing arguments become index sentinels expanded by
    /// the interpreter.
    fn compile_call_args(
        &mut self,
        cx: &mut CodeCtx<'rt>,
        ast: &Value,
        args: &[Arg],
    ) -> Result<(), RyeError> {
        let mut idxs: Vec<u32> = Vec::with_capacity(args.len());
        let mut names: Vec<Option<Spur>> = Vec::with_capacity(args.len());
        for arg in args {
            if arg.value.is_dots_symbol() {
                idxs.push(DOTS_ARG_IDX);
                names.push(None);
                continue;
            }
            if arg.value.is_missing() {
                idxs.push(MISSING_ARG_IDX);
                names.push(None);
                continue;
            }
            idxs.push(self.compile_promise(&arg.value)?);
            names.push(arg.tag);
        }
        let args_idx = cx.cs.const_idx(pack_indices(&idxs));
        let names_idx = cx.cs.const_idx(pack_names(&names));
        cx.cs.op2(Op::Call, args_idx, names_idx);
        cx.cs.add_src(ast);
        Ok(())
    }

    /// The generic lowering of a symbol-headed call; also the slow path
    /// behind every guard side-exit.
    fn compile_call_generic(
        &mut self,
        cx: &mut CodeCtx<'rt>,
        ast: &Value,
        fun: Spur,
        args: &[Arg],
    ) -> Result<(), RyeError> {
        let idx = cx.cs.sym_idx(fun);
        cx.cs.op1(Op::LdFun, idx);
        self.compile_call_args(cx, ast, args)
    }

    /// Method dispatch on the object sitting on top of the stack.
    fn compile_dispatch(
        &mut self,
        cx: &mut CodeCtx<'rt>,
        selector: Spur,
        ast: &Value,
        args: &[Arg],
    ) -> Result<(), RyeError> {
        let mut idxs: Vec<u32> = Vec::with_capacity(args.len());
        let mut names: Vec<Option<Spur>> = Vec::with_capacity(args.len());
        for arg in args {
            if arg.value.is_dots_symbol() {
                idxs.push(DOTS_ARG_IDX);
                names.push(None);
                continue;
            }
            if arg.value.is_missing() {
                idxs.push(MISSING_ARG_IDX);
                names.push(None);
                continue;
            }
            idxs.push(self.compile_promise(&arg.value)?);
            names.push(arg.tag);
        }
        let args_idx = cx.cs.const_idx(pack_indices(&idxs));
        let names_idx = cx.cs.const_idx(pack_names(&names));
        let selector_idx = cx.cs.sym_idx(selector);
        cx.cs.op3(Op::Dispatch, args_idx, names_idx, selector_idx);
        cx.cs.add_src(ast);
        Ok(())
    }

    // ── Inlined special forms ─────────────────────────────────────

    /// Inline the well-known special forms. Every inlined form opens with a
    /// guard that side-exits to the generic call when the binding has been
    /// shadowed. Returns false when the call shape is not eligible and must
    /// take the generic path.
    fn compile_special(
        &mut self,
        cx: &mut CodeCtx<'rt>,
        ast: &Value,
        fun: Spur,
        args: &[Arg],
    ) -> Result<bool, RyeError> {
        let tagged = args.iter().any(|a| a.tag.is_some());

        if (fun == sym::and() || fun == sym::or()) && args.len() == 2 && !tagged {
            let slow = cx.cs.mk_label();
            let done = cx.cs.mk_label();
            let short = cx.cs.mk_label();
            cx.cs.guard(fun, slow);
            self.compile_expr(cx, &args[0].value)?;
            cx.cs.emit(Op::AsLogical);
            cx.cs.add_src(&args[0].value);
            cx.cs.emit(Op::Dup);
            if fun == sym::and() {
                cx.cs.branch(Op::BrFalse, short);
            } else {
                cx.cs.branch(Op::BrTrue, short);
            }
            self.compile_expr(cx, &args[1].value)?;
            cx.cs.emit(Op::AsLogical);
            cx.cs.add_src(&args[1].value);
            cx.cs.emit(if fun == sym::and() {
                Op::LglAnd
            } else {
                Op::LglOr
            });
            cx.cs.bind(short);
            cx.cs.branch(Op::Br, done);
            cx.cs.bind(slow);
            self.compile_call_generic(cx, ast, fun, args)?;
            cx.cs.bind(done);
            return Ok(true);
        }

        if fun == sym::quote() && args.len() == 1 && !tagged {
            let slow = cx.cs.mk_label();
            let done = cx.cs.mk_label();
            cx.cs.guard(fun, slow);
            let body = self.compile_promise(&args[0].value)?;
            cx.cs.op1(Op::PushCode, body);
            cx.cs.branch(Op::Br, done);
            cx.cs.bind(slow);
            self.compile_call_generic(cx, ast, fun, args)?;
            cx.cs.bind(done);
            return Ok(true);
        }

        if (fun == sym::assign() || fun == intern("=")) && args.len() == 2 && !tagged {
            return self.compile_assign(cx, ast, fun, args);
        }

        if fun == sym::is_null() || fun == sym::is_list() || fun == sym::is_pairlist() {
            if args.len() != 1 || tagged {
                return Ok(false);
            }
            let tag = if fun == sym::is_null() {
                type_tag::NULL
            } else if fun == sym::is_list() {
                type_tag::LIST
            } else {
                type_tag::PAIRLIST
            };
            let slow = cx.cs.mk_label();
            let done = cx.cs.mk_label();
            cx.cs.guard(fun, slow);
            self.compile_expr(cx, &args[0].value)?;
            cx.cs.op1(Op::Is, tag);
            cx.cs.branch(Op::Br, done);
            cx.cs.bind(slow);
            self.compile_call_generic(cx, ast, fun, args)?;
            cx.cs.bind(done);
            return Ok(true);
        }

        if (fun == sym::double_bracket() || fun == sym::bracket()) && args.len() == 2 {
            let idx = &args[1].value;
            if idx.is_dots_symbol() || idx.is_missing() || args[1].tag.is_some() {
                return Ok(false);
            }
            let slow = cx.cs.mk_label();
            let done = cx.cs.mk_label();
            let obj = cx.cs.mk_label();
            cx.cs.guard(fun, slow);
            self.compile_expr(cx, &args[0].value)?;
            cx.cs.branch(Op::BrObj, obj);
            self.compile_expr(cx, idx)?;
            cx.cs.emit(if fun == sym::double_bracket() {
                Op::Extract1
            } else {
                Op::Subset1
            });
            cx.cs.add_src(ast);
            cx.cs.branch(Op::Br, done);
            cx.cs.bind(obj);
            self.compile_dispatch(cx, fun, ast, args)?;
            cx.cs.branch(Op::Br, done);
            cx.cs.bind(slow);
            self.compile_call_generic(cx, ast, fun, args)?;
            cx.cs.bind(done);
            return Ok(true);
        }

        if fun == sym::dollar() && args.len() == 2 && !tagged {
            let name = match element_name(&args[1].value) {
                Some(n) => n,
                None => return Ok(false),
            };
            let slow = cx.cs.mk_label();
            let done = cx.cs.mk_label();
            let obj = cx.cs.mk_label();
            cx.cs.guard(fun, slow);
            self.compile_expr(cx, &args[0].value)?;
            cx.cs.branch(Op::BrObj, obj);
            cx.cs.push_const(Value::str(&name));
            cx.cs.emit(Op::Extract1);
            cx.cs.add_src(ast);
            cx.cs.branch(Op::Br, done);
            cx.cs.bind(obj);
            let dispatch_args = vec![
                args[0].clone(),
                Arg {
                    tag: args[1].tag,
                    value: Value::str(&name),
                },
            ];
            self.compile_dispatch(cx, fun, ast, &dispatch_args)?;
            cx.cs.branch(Op::Br, done);
            cx.cs.bind(slow);
            self.compile_call_generic(cx, ast, fun, args)?;
            cx.cs.bind(done);
            return Ok(true);
        }

        if fun == sym::while_() && args.len() == 2 && !tagged {
            let slow = cx.cs.mk_label();
            let done = cx.cs.mk_label();
            cx.cs.guard(fun, slow);

            let cont = cx.cs.mk_label();
            let brk = cx.cs.mk_label();
            cx.loops.push(LoopLabels { cont, brk });
            cx.cs.branch(Op::BeginLoop, brk);
            cx.cs.bind(cont);
            self.compile_expr(cx, &args[0].value)?;
            cx.cs.emit(Op::AsBool);
            cx.cs.branch(Op::BrFalse, brk);
            self.compile_expr(cx, &args[1].value)?;
            cx.cs.emit(Op::Pop);
            cx.cs.branch(Op::Br, cont);
            cx.cs.bind(brk);
            cx.cs.emit(Op::EndContext);
            cx.cs.push_const(Value::null());
            cx.cs.emit(Op::Invisible);
            cx.loops.pop();

            cx.cs.branch(Op::Br, done);
            cx.cs.bind(slow);
            self.compile_call_generic(cx, ast, fun, args)?;
            cx.cs.bind(done);
            return Ok(true);
        }

        if fun == sym::repeat_() && args.len() == 1 && !tagged {
            let slow = cx.cs.mk_label();
            let done = cx.cs.mk_label();
            cx.cs.guard(fun, slow);

            let cont = cx.cs.mk_label();
            let brk = cx.cs.mk_label();
            cx.loops.push(LoopLabels { cont, brk });
            cx.cs.branch(Op::BeginLoop, brk);
            cx.cs.bind(cont);
            self.compile_expr(cx, &args[0].value)?;
            cx.cs.emit(Op::Pop);
            cx.cs.branch(Op::Br, cont);
            cx.cs.bind(brk);
            cx.cs.emit(Op::EndContext);
            cx.cs.push_const(Value::null());
            cx.cs.emit(Op::Invisible);
            cx.loops.pop();

            cx.cs.branch(Op::Br, done);
            cx.cs.bind(slow);
            self.compile_call_generic(cx, ast, fun, args)?;
            cx.cs.bind(done);
            return Ok(true);
        }

        if fun == sym::for_() && args.len() == 3 {
            let var = match args[0].value.as_symbol() {
                Some(s) => s,
                None => return Ok(false),
            };
            let slow = cx.cs.mk_label();
            let done = cx.cs.mk_label();
            cx.cs.guard(fun, slow);

            // The sequence and the counter live on the value stack, below
            // the loop frame's snapshot, so non-local entries find them
            // intact and the increment never collides with frame storage.
            self.compile_expr(cx, &args[1].value)?;
            cx.cs.emit(Op::Uniq);
            cx.cs.push_const(Value::int(0));

            let cont = cx.cs.mk_label();
            let brk = cx.cs.mk_label();
            cx.loops.push(LoopLabels { cont, brk });
            cx.cs.branch(Op::BeginLoop, brk);
            cx.cs.bind(cont);
            cx.cs.emit(Op::Inc);
            cx.cs.emit(Op::TestBounds);
            cx.cs.branch(Op::BrFalse, brk);
            cx.cs.emit(Op::Dup2);
            cx.cs.emit(Op::Extract1);
            cx.cs.add_src(&Value::null());
            let var_idx = cx.cs.sym_idx(var);
            cx.cs.op1(Op::StVar, var_idx);
            self.compile_expr(cx, &args[2].value)?;
            cx.cs.emit(Op::Pop);
            cx.cs.branch(Op::Br, cont);
            cx.cs.bind(brk);
            cx.cs.emit(Op::EndContext);
            cx.cs.emit(Op::Pop);
            cx.cs.emit(Op::Pop);
            cx.cs.push_const(Value::null());
            cx.cs.emit(Op::Invisible);
            cx.loops.pop();

            cx.cs.branch(Op::Br, done);
            cx.cs.bind(slow);
            self.compile_call_generic(cx, ast, fun, args)?;
            cx.cs.bind(done);
            return Ok(true);
        }

        if fun == sym::next_() && args.is_empty() {
            if let Some(lp) = cx.loops.last() {
                let cont = lp.cont;
                let slow = cx.cs.mk_label();
                let done = cx.cs.mk_label();
                cx.cs.guard(fun, slow);
                cx.cs.branch(Op::Br, cont);
                cx.cs.bind(slow);
                self.compile_call_generic(cx, ast, fun, args)?;
                cx.cs.bind(done);
                return Ok(true);
            }
            return Ok(false);
        }

        if fun == sym::break_() && args.is_empty() {
            if let Some(lp) = cx.loops.last() {
                let brk = lp.brk;
                let slow = cx.cs.mk_label();
                let done = cx.cs.mk_label();
                cx.cs.guard(fun, slow);
                cx.cs.branch(Op::Br, brk);
                cx.cs.bind(slow);
                self.compile_call_generic(cx, ast, fun, args)?;
                cx.cs.bind(done);
                return Ok(true);
            }
            return Ok(false);
        }

        if (fun == sym::add() || fun == sym::sub() || fun == sym::lt())
            && args.len() == 2
            && !tagged
            && !args.iter().any(|a| a.value.is_dots_symbol() || a.value.is_missing())
        {
            let slow = cx.cs.mk_label();
            let done = cx.cs.mk_label();
            cx.cs.guard(fun, slow);
            self.compile_expr(cx, &args[0].value)?;
            self.compile_expr(cx, &args[1].value)?;
            cx.cs.emit(if fun == sym::add() {
                Op::Add
            } else if fun == sym::sub() {
                Op::Sub
            } else {
                Op::Lt
            });
            cx.cs.add_src(ast);
            cx.cs.branch(Op::Br, done);
            cx.cs.bind(slow);
            self.compile_call_generic(cx, ast, fun, args)?;
            cx.cs.bind(done);
            return Ok(true);
        }

        if fun == sym::block() && !tagged {
            let slow = cx.cs.mk_label();
            let done = cx.cs.mk_label();
            cx.cs.guard(fun, slow);
            if args.is_empty() {
                cx.cs.push_const(Value::null());
            } else {
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        cx.cs.emit(Op::Pop);
                    }
                    self.compile_expr(cx, &arg.value)?;
                }
            }
            cx.cs.branch(Op::Br, done);
            cx.cs.bind(slow);
            self.compile_call_generic(cx, ast, fun, args)?;
            cx.cs.bind(done);
            return Ok(true);
        }

        Ok(false)
    }

    // ── Assignment ────────────────────────────────────────────────

    /// `<-` with three statically rewritable shapes: symbol target, string
    /// target, and a nested accessor chain. Anything else (or a chain with
    /// a non-symbol callee) falls back to the dynamic special.
    fn compile_assign(
        &mut self,
        cx: &mut CodeCtx<'rt>,
        ast: &Value,
        fun: Spur,
        args: &[Arg],
    ) -> Result<bool, RyeError> {
        let lhs = &args[0].value;
        let rhs = &args[1].value;

        // Reject shapes we cannot rewrite statically.
        let mut probe = lhs.clone();
        loop {
            if let Some(call) = probe.as_lang() {
                if call.fun.as_symbol().is_none() || call.args.is_empty() {
                    return Ok(false);
                }
                probe = call.args[0].value.clone();
            } else if probe.is_symbol() || probe.as_str_scalar().is_some() {
                break;
            } else {
                return Ok(false);
            }
        }

        let slow = cx.cs.mk_label();
        let done = cx.cs.mk_label();
        cx.cs.guard(fun, slow);

        let target_sym = lhs
            .as_symbol()
            .or_else(|| lhs.as_str_scalar().map(|s| intern(&s)));
        if let Some(name) = target_sym {
            self.compile_expr(cx, rhs)?;
            cx.cs.emit(Op::Dup);
            let idx = cx.cs.sym_idx(name);
            cx.cs.op1(Op::StVar, idx);
            cx.cs.emit(Op::Invisible);
            cx.cs.branch(Op::Br, done);
            cx.cs.bind(slow);
            self.compile_call_generic(cx, ast, fun, args)?;
            cx.cs.bind(done);
            return Ok(true);
        }

        self.compile_expr(cx, rhs)?;
        cx.cs.emit(Op::Dup);

        // Decompose the accessor chain, outermost call first, terminating
        // in the target symbol.
        let mut parts: Vec<Value> = Vec::new();
        let mut probe = lhs.clone();
        let target = loop {
            if let Some(call) = probe.as_lang() {
                parts.push(probe.clone());
                probe = call.args[0].value.clone();
            } else if let Some(s) = probe.as_symbol() {
                parts.push(probe.clone());
                break s;
            } else {
                let s = intern(&probe.as_str_scalar().unwrap());
                parts.push(Value::symbol(s));
                break s;
            }
        };

        // Evaluate the getter chain; each getter call consumes the current
        // target from the stack as its (untagged) first argument.
        for i in (1..parts.len()).rev() {
            let part = parts[i].clone();
            if let Some(s) = part.as_symbol() {
                let idx = cx.cs.sym_idx(s);
                cx.cs.op1(Op::LdVar, idx);
            } else {
                let call = part.as_lang().unwrap();
                let head = call.fun.as_symbol().unwrap();
                let head_idx = cx.cs.sym_idx(head);
                cx.cs.op1(Op::LdFun, head_idx);
                cx.cs.emit(Op::Swap);
                let mut names: Vec<Option<Spur>> = vec![None];
                for a in &call.args[1..] {
                    names.push(a.tag);
                    self.compile_stack_arg(cx, head, a)?;
                }
                let names_idx = cx.cs.const_idx(pack_names(&names));
                cx.cs.op2(Op::CallStack, names.len() as u32, names_idx);
                cx.cs.add_src(&rewrite_getter(&call));
            }
            if i > 1 {
                cx.cs.emit(Op::Dup);
            }
            // Setter internals may modify their target in place.
            cx.cs.emit(Op::Uniq);
            if i > 1 {
                cx.cs.emit(Op::Swap);
            }
        }

        // Pull the right-hand side down past the intermediate targets.
        cx.cs.op1(Op::Pick, parts.len() as u32 - 1);

        // Run the setters, outermost accessor first. The replacement value
        // arrives as the last stack argument under the reserved `value` tag.
        for part in &parts[..parts.len() - 1] {
            let call = part.as_lang().unwrap();
            let head = call.fun.as_symbol().unwrap();
            let setter = sym::setter_for(head);
            let setter_idx = cx.cs.sym_idx(setter);
            cx.cs.op1(Op::LdFun, setter_idx);
            cx.cs.op1(Op::Put, 2);
            let mut names: Vec<Option<Spur>> = vec![None];
            let mut extra = 0u32;
            for a in &call.args[1..] {
                extra += 1;
                names.push(a.tag);
                self.compile_stack_arg(cx, head, a)?;
            }
            names.push(Some(sym::value()));
            if extra > 0 {
                cx.cs.op1(Op::Pick, extra);
            }
            let names_idx = cx.cs.const_idx(pack_names(&names));
            cx.cs.op2(Op::CallStack, names.len() as u32, names_idx);
            cx.cs.add_src(&rewrite_setter(&call, setter));
            cx.cs.emit(Op::Uniq);
        }

        let target_idx = cx.cs.sym_idx(target);
        cx.cs.op1(Op::StVar, target_idx);
        cx.cs.emit(Op::Invisible);

        cx.cs.branch(Op::Br, done);
        cx.cs.bind(slow);
        self.compile_call_generic(cx, ast, fun, args)?;
        cx.cs.bind(done);
        Ok(true)
    }

    /// One non-target argument of a getter/setter call, evaluated onto the
    /// stack: `...`/missing are pushed literally, `$` element names become
    /// string constants, symbols and calls are promise-wrapped, everything
    /// else is evaluated inline.
    fn compile_stack_arg(
        &mut self,
        cx: &mut CodeCtx<'rt>,
        head: Spur,
        arg: &Arg,
    ) -> Result<(), RyeError> {
        let v = &arg.value;
        if v.is_dots_symbol() || v.is_missing() {
            cx.cs.push_const(v.clone());
            return Ok(());
        }
        if head == sym::dollar() {
            if let Some(name) = element_name(v) {
                cx.cs.push_const(Value::str(&name));
                return Ok(());
            }
        }
        if v.is_symbol() || v.is_lang() {
            let body = self.compile_promise(v)?;
            cx.cs.op1(Op::MkProm, body);
        } else {
            self.compile_expr(cx, v)?;
        }
        Ok(())
    }
}

/// Argument code indices packed into an integer vector for the pool.
fn pack_indices(idxs: &[u32]) -> Value {
    Value::ints(idxs.iter().map(|&i| i as i32).collect())
}

/// Argument names as a generic vector of symbols (null when none is tagged).
fn pack_names(names: &[Option<Spur>]) -> Value {
    if names.iter().all(|n| n.is_none()) {
        return Value::null();
    }
    Value::list(
        names
            .iter()
            .map(|n| match n {
                Some(s) => Value::symbol(*s),
                None => Value::null(),
            })
            .collect(),
    )
}

fn element_name(v: &Value) -> Option<String> {
    if let Some(s) = v.as_symbol() {
        return Some(rye_core::resolve(s));
    }
    v.as_str_scalar().map(|s| s.to_string())
}

/// Diagnostic source for a getter invocation: the original call with its
/// target slot holding the placeholder symbol. Never consulted for
/// evaluation; the live target travels on the stack.
fn rewrite_getter(call: &Call) -> Value {
    let mut args = call.args.clone();
    args[0] = Arg {
        tag: args[0].tag,
        value: Value::symbol(sym::getter_placeholder()),
    };
    Value::lang(call.fun.clone(), args)
}

/// Diagnostic source for a setter invocation: `name<-` with placeholder
/// target and a placeholder `value` argument appended.
fn rewrite_setter(call: &Call, setter: Spur) -> Value {
    let mut args = call.args.clone();
    args[0] = Arg {
        tag: args[0].tag,
        value: Value::symbol(sym::setter_placeholder()),
    };
    args.push(Arg::named(
        sym::value(),
        Value::symbol(sym::setter_placeholder()),
    ));
    Value::lang(Value::symbol(setter), args)
}
