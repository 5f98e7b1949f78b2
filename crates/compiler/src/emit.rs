//! Bytecode Emitter: nodes → chunks
//!
//! One `FnCompiler` per function prototype; arities share a code vector and
//! constant pool. Arithmetic/comparison core calls and the collection
//! constructors compile to direct opcodes (no runtime intrinsic dispatch),
//! variadic arithmetic left-folds binary ops, and a bounded set of fused
//! superinstructions is emitted structurally when the adjacent pattern is
//! visible at compile time.
//!
//! `case` compiles to a hashed jump table when a collision-free (shift,
//! mask) pair exists for the precomputed clause hashes, and to a sequential
//! equality chain otherwise.

use std::sync::Arc;

use crate::CompilerError;
use lyra_runtime::ast::{CaptureSource, FnNode, LetBinding, Node};
use lyra_runtime::chunk::{
    CaseSlot, CaseStrategy, CaseTable, Chunk, FnProto, HandlerDesc, Instr, LoopInfo, Op, VarSite,
    WIDE_OPERAND,
};
use lyra_runtime::env::{CORE_NS, Env};
use lyra_runtime::error::Phase;
use lyra_runtime::heap::{ObjStr, ObjVector, Var};
use lyra_runtime::{ErrorKind, HeapTag, Loc, Value};

fn err(loc: Loc, msg: impl Into<String>) -> CompilerError {
    CompilerError::new(ErrorKind::Compile, Phase::Compile, loc, msg)
}

/// Compile a top-level node into a chunk whose entry prototype takes no
/// arguments.
pub fn compile_top(env: &Env, node: &Node, local_count: u16) -> Result<Chunk, CompilerError> {
    let mut fc = FnCompiler::new(env);
    fc.push_implicit_loop(0, 0);
    fc.compile(node, true)?;
    fc.pop_loop();
    fc.emit(Op::Return, 0, node.loc());
    let proto = fc.finish(
        Some("top-level".into()),
        vec![lyra_runtime::chunk::ArityEntry {
            params: 0,
            is_variadic: false,
            local_count,
            entry_pc: 0,
        }],
        Vec::new(),
    );
    Ok(Chunk { top: Arc::new(proto), file: None })
}

/// Compile a function node to a prototype (used for `fn` expressions and for
/// recompiling bootstrap definitions to bytecode).
pub fn compile_fn_node(env: &Env, fn_node: &FnNode) -> Result<Arc<FnProto>, CompilerError> {
    let mut fc = FnCompiler::new(env);
    let mut arities = Vec::with_capacity(fn_node.arities.len());
    for arity in &fn_node.arities {
        let entry_pc = fc.code.len() as u32;
        let recur_count = arity.params + arity.is_variadic as u16;
        fc.push_implicit_loop(entry_pc, recur_count);
        fc.compile_body(&arity.body, true, fn_node.loc)?;
        fc.pop_loop();
        fc.emit(Op::Return, 0, fn_node.loc);
        arities.push(lyra_runtime::chunk::ArityEntry {
            params: arity.params,
            is_variadic: arity.is_variadic,
            local_count: arity.local_count,
            entry_pc,
        });
    }
    Ok(Arc::new(fc.finish(
        fn_node.name.clone(),
        arities,
        fn_node.captures.clone(),
    )))
}

struct FnCompiler<'e> {
    env: &'e Env,
    code: Vec<Instr>,
    consts: Vec<Value>,
    protos: Vec<Arc<FnProto>>,
    var_sites: Vec<VarSite>,
    loops: Vec<LoopInfo>,
    handlers: Vec<HandlerDesc>,
    cases: Vec<CaseTable>,
    lines: Vec<(u32, u32)>,
    loop_stack: Vec<usize>,
    try_depth: usize,
}

impl<'e> FnCompiler<'e> {
    fn new(env: &'e Env) -> FnCompiler<'e> {
        FnCompiler {
            env,
            code: Vec::new(),
            consts: Vec::new(),
            protos: Vec::new(),
            var_sites: Vec::new(),
            loops: Vec::new(),
            handlers: Vec::new(),
            cases: Vec::new(),
            lines: Vec::new(),
            loop_stack: Vec::new(),
            try_depth: 0,
        }
    }

    fn finish(
        self,
        name: Option<Box<str>>,
        arities: Vec<lyra_runtime::chunk::ArityEntry>,
        capture_sources: Vec<CaptureSource>,
    ) -> FnProto {
        FnProto {
            name,
            arities,
            code: self.code,
            consts: self.consts,
            protos: self.protos,
            var_sites: self.var_sites,
            loops: self.loops,
            handlers: self.handlers,
            cases: self.cases,
            capture_sources,
            lines: self.lines,
        }
    }

    // =========================================================================
    // Emission primitives
    // =========================================================================

    fn note_line(&mut self, loc: Loc) {
        let pc = self.code.len() as u32;
        if loc.line != 0 && self.lines.last().map(|(_, l)| *l) != Some(loc.line) {
            self.lines.push((pc, loc.line));
        }
    }

    fn emit(&mut self, op: Op, a: usize, loc: Loc) {
        self.note_line(loc);
        if a >= WIDE_OPERAND as usize {
            self.code.push(Instr::new(op, WIDE_OPERAND));
            self.code.push(Instr::new(Op::Ext, ((a >> 16) & 0xFFFF) as u16));
            self.code.push(Instr::new(Op::Ext, (a & 0xFFFF) as u16));
        } else {
            self.code.push(Instr::new(op, a as u16));
        }
    }

    /// Emit a branch with a to-be-patched target; returns the patch site.
    fn emit_jump(&mut self, op: Op, loc: Loc) -> usize {
        self.note_line(loc);
        self.code.push(Instr::new(op, 0));
        self.code.len() - 1
    }

    fn patch_here(&mut self, site: usize, loc: Loc) -> Result<(), CompilerError> {
        let target = self.code.len();
        if target >= WIDE_OPERAND as usize {
            return Err(err(loc, "function body exceeds jump range"));
        }
        self.code[site].a = target as u16;
        Ok(())
    }

    fn const_idx(&mut self, v: Value) -> usize {
        if let Some(i) = self.consts.iter().position(|c| c.identical(v)) {
            return i;
        }
        self.consts.push(v);
        self.consts.len() - 1
    }

    fn var_site(&mut self, var: &'static Var) -> usize {
        if let Some(i) = self.var_sites.iter().position(|s| std::ptr::eq(s.var, var)) {
            return i;
        }
        self.var_sites.push(VarSite::new(var));
        self.var_sites.len() - 1
    }

    fn push_implicit_loop(&mut self, start_pc: u32, count: u16) {
        self.loops.push(LoopInfo { start_pc, base_slot: 0, count });
        self.loop_stack.push(self.loops.len() - 1);
    }

    fn pop_loop(&mut self) {
        self.loop_stack.pop();
    }

    fn core_builtin_var(&mut self, name: &str, loc: Loc) -> Result<usize, CompilerError> {
        let var = self
            .env
            .resolve_var(Some(CORE_NS), name)
            .ok_or_else(|| err(loc, format!("core function {name} missing")))?;
        Ok(self.var_site(var))
    }

    // =========================================================================
    // Node compilation
    // =========================================================================

    fn compile_body(&mut self, body: &[Node], tail: bool, loc: Loc) -> Result<(), CompilerError> {
        if body.is_empty() {
            self.emit(Op::Nil, 0, loc);
            return Ok(());
        }
        for node in &body[..body.len() - 1] {
            self.compile(node, false)?;
            self.emit(Op::Pop, 0, node.loc());
        }
        self.compile(&body[body.len() - 1], tail)
    }

    #[allow(clippy::too_many_lines)]
    fn compile(&mut self, node: &Node, tail: bool) -> Result<(), CompilerError> {
        let loc = node.loc();
        match node {
            Node::Const { value, .. } => self.compile_const(*value, loc),
            Node::Local { slot, .. } => self.emit(Op::LoadLocal, *slot as usize, loc),
            Node::Captured { idx, .. } => self.emit(Op::LoadCaptured, *idx as usize, loc),
            Node::VarRef { var, .. } => {
                let site = self.var_site(var);
                self.emit(Op::VarLoad, site, loc);
            }
            Node::TheVar { var, .. } => {
                let v = Value::heap(HeapTag::VarRef, *var as *const _ as *const u8);
                let idx = self.const_idx(v);
                self.emit(Op::Const, idx, loc);
            }
            Node::Do { body, .. } => self.compile_body(body, tail, loc)?,
            Node::If { test, then, els, .. } => {
                let else_site = self.compile_branch_test(test)?;
                self.compile(then, tail)?;
                let end_site = self.emit_jump(Op::Jump, loc);
                self.patch_here(else_site, loc)?;
                match els {
                    Some(e) => self.compile(e, tail)?,
                    None => self.emit(Op::Nil, 0, loc),
                }
                self.patch_here(end_site, loc)?;
            }
            Node::Let { bindings, body, .. } => {
                self.compile_bindings(bindings)?;
                self.compile_body(body, tail, loc)?;
            }
            Node::Loop { bindings, body, .. } => {
                self.compile_bindings(bindings)?;
                let base_slot = bindings.first().map(|b| b.slot).unwrap_or(0);
                self.loops.push(LoopInfo {
                    start_pc: self.code.len() as u32,
                    base_slot,
                    count: bindings.len() as u16,
                });
                self.loop_stack.push(self.loops.len() - 1);
                self.compile_body(body, tail, loc)?;
                self.loop_stack.pop();
            }
            Node::Recur { args, .. } => {
                let loop_idx = *self
                    .loop_stack
                    .last()
                    .ok_or_else(|| err(loc, "recur outside loop"))?;
                // Fused: a single local argument folds into one instruction.
                if let [Node::Local { slot, .. }] = args.as_slice()
                    && *slot < 256
                    && loop_idx < 256
                {
                    self.emit(Op::RecurLocal1, ((*slot as usize) << 8) | loop_idx, loc);
                    return Ok(());
                }
                for arg in args {
                    self.compile(arg, false)?;
                }
                self.emit(Op::Recur, loop_idx, loc);
            }
            Node::Fn(fn_node) => {
                let proto = compile_fn_node(self.env, fn_node)?;
                self.protos.push(proto);
                self.emit(Op::MakeClosure, self.protos.len() - 1, loc);
            }
            Node::Def { var, init, dynamic, .. } => {
                match init {
                    Some(init) => {
                        self.compile(init, false)?;
                        let site = self.var_site(var);
                        let op = if *dynamic { Op::DefDynamic } else { Op::Def };
                        self.emit(op, site, loc);
                    }
                    None => {
                        let v = Value::heap(HeapTag::VarRef, *var as *const _ as *const u8);
                        let idx = self.const_idx(v);
                        self.emit(Op::Const, idx, loc);
                    }
                }
            }
            Node::Binding { pairs, body, .. } => {
                for (var, init) in pairs {
                    let v = Value::heap(HeapTag::VarRef, *var as *const _ as *const u8);
                    let idx = self.const_idx(v);
                    self.emit(Op::Const, idx, loc);
                    self.compile(init, false)?;
                }
                self.emit(Op::BindingPush, pairs.len(), loc);
                // Pop paired with push through try/finally.
                let handler_idx = self.handlers.len();
                self.handlers.push(HandlerDesc { pc_begin: 0, pc_end: 0, pc_handler: 0 });
                self.emit(Op::TryStart, handler_idx, loc);
                let begin = self.code.len() as u32;
                self.try_depth += 1;
                self.compile_body(body, false, loc)?;
                self.try_depth -= 1;
                let end = self.code.len() as u32;
                self.emit(Op::TryEnd, 0, loc);
                self.emit(Op::BindingPop, 0, loc);
                let done = self.emit_jump(Op::Jump, loc);
                let handler_pc = self.code.len() as u32;
                self.emit(Op::BindingPop, 0, loc);
                self.emit(Op::Throw, 0, loc);
                self.handlers[handler_idx] =
                    HandlerDesc { pc_begin: begin, pc_end: end, pc_handler: handler_pc };
                self.patch_here(done, loc)?;
            }
            Node::Try { body, catches, finally, .. } => {
                self.compile_try(body, catches, finally.as_deref(), loc)?;
            }
            Node::Throw { exc, .. } => {
                self.compile(exc, false)?;
                self.emit(Op::Throw, 0, loc);
                // Unreachable, but the expression contract wants a slot.
                self.emit(Op::Nil, 0, loc);
            }
            Node::Invoke { f, args, .. } => self.compile_invoke(f, args, tail, loc)?,
            Node::VectorLit { items, .. } => {
                for item in items {
                    self.compile(item, false)?;
                }
                self.emit(Op::VecNew, items.len(), loc);
            }
            Node::MapLit { pairs, .. } => {
                for (k, v) in pairs {
                    self.compile(k, false)?;
                    self.compile(v, false)?;
                }
                self.emit(Op::MapNew, pairs.len(), loc);
            }
            Node::SetLit { items, .. } => {
                for item in items {
                    self.compile(item, false)?;
                }
                self.emit(Op::SetNew, items.len(), loc);
            }
            Node::Case { expr, clauses, default, .. } => {
                self.compile_case(expr, clauses, default.as_deref(), tail, loc)?;
            }
            Node::DefProtocol { var, name, methods, .. } => {
                let site = self.core_builtin_var("defprotocol*", loc)?;
                self.emit(Op::VarLoad, site, loc);
                let var_ref = Value::heap(HeapTag::VarRef, *var as *const _ as *const u8);
                let idx = self.const_idx(var_ref);
                self.emit(Op::Const, idx, loc);
                let name_idx = self.const_idx(*name);
                self.emit(Op::Const, name_idx, loc);
                let methods_vec =
                    self.env.interned.alloc_permanent(ObjVector::new(methods.clone()));
                let m_idx = self.const_idx(methods_vec);
                self.emit(Op::Const, m_idx, loc);
                self.emit(Op::Call, 3, loc);
            }
            Node::ExtendType { protocol, type_key, methods, .. } => {
                let site = self.core_builtin_var("extend-type*", loc)?;
                self.emit(Op::VarLoad, site, loc);
                self.compile(protocol, false)?;
                self.emit(Op::Int, *type_key as u32 as usize, loc);
                for method in methods {
                    let name_v =
                        self.env.interned.alloc_permanent(ObjStr::new(method.name.clone()));
                    let n_idx = self.const_idx(name_v);
                    self.emit(Op::Const, n_idx, loc);
                    let proto = compile_fn_node(self.env, &method.fun)?;
                    self.protos.push(proto);
                    self.emit(Op::MakeClosure, self.protos.len() - 1, loc);
                }
                self.emit(Op::Call, 2 + methods.len() * 2, loc);
            }
            Node::DefMulti { var, name, dispatch, .. } => {
                let site = self.core_builtin_var("defmulti*", loc)?;
                self.emit(Op::VarLoad, site, loc);
                let var_ref = Value::heap(HeapTag::VarRef, *var as *const _ as *const u8);
                let idx = self.const_idx(var_ref);
                self.emit(Op::Const, idx, loc);
                let name_idx = self.const_idx(*name);
                self.emit(Op::Const, name_idx, loc);
                self.compile(dispatch, false)?;
                self.emit(Op::Call, 3, loc);
            }
            Node::DefMethod { multi, dispatch_val, fun, .. } => {
                let site = self.core_builtin_var("defmethod*", loc)?;
                self.emit(Op::VarLoad, site, loc);
                self.compile(multi, false)?;
                self.compile(dispatch_val, false)?;
                let proto = compile_fn_node(self.env, fun)?;
                self.protos.push(proto);
                self.emit(Op::MakeClosure, self.protos.len() - 1, loc);
                self.emit(Op::Call, 3, loc);
            }
        }
        Ok(())
    }

    fn compile_const(&mut self, v: Value, loc: Loc) {
        match v.tag() {
            lyra_runtime::Tag::Nil => self.emit(Op::Nil, 0, loc),
            lyra_runtime::Tag::True => self.emit(Op::True, 0, loc),
            lyra_runtime::Tag::False => self.emit(Op::False, 0, loc),
            lyra_runtime::Tag::Int
                if (i16::MIN as i64..=i16::MAX as i64).contains(&v.as_i64()) =>
            {
                self.emit(Op::Int, v.as_i64() as i16 as u16 as usize, loc);
            }
            _ => {
                let idx = self.const_idx(v);
                self.emit(Op::Const, idx, loc);
            }
        }
    }

    fn compile_bindings(&mut self, bindings: &[LetBinding]) -> Result<(), CompilerError> {
        for binding in bindings {
            self.compile(&binding.init, false)?;
            self.emit(Op::StoreLocal, binding.slot as usize, binding.init.loc());
        }
        Ok(())
    }

    /// Compile a branch test, returning the patch site that jumps to the
    /// else arm. Fuses `(= a b)` and `(< a b)` tests into compare-and-branch
    /// superinstructions.
    fn compile_branch_test(&mut self, test: &Node) -> Result<usize, CompilerError> {
        let loc = test.loc();
        if let Node::Invoke { f, args, .. } = test
            && let Some(name) = self.core_name(f)
            && args.len() == 2
        {
            match name {
                "=" => {
                    self.compile(&args[0], false)?;
                    self.compile(&args[1], false)?;
                    return Ok(self.emit_jump(Op::BranchIfNeq, loc));
                }
                "<" => {
                    self.compile(&args[0], false)?;
                    self.compile(&args[1], false)?;
                    return Ok(self.emit_jump(Op::BranchIfNotLt, loc));
                }
                _ => {}
            }
        }
        self.compile(test, false)?;
        Ok(self.emit_jump(Op::BranchIfFalse, loc))
    }

    fn core_name(&self, node: &Node) -> Option<&'static str> {
        if let Node::VarRef { var, .. } = node
            && var.ns_name.as_ref() == CORE_NS
        {
            // Leak-free: var names live in the infrastructure arena.
            let name: &str = &var.name;
            // Safety of lifetime: vars are permanent for the env lifetime.
            return Some(unsafe { std::mem::transmute::<&str, &'static str>(name) });
        }
        None
    }

    fn compile_invoke(
        &mut self,
        f: &Node,
        args: &[Node],
        tail: bool,
        loc: Loc,
    ) -> Result<(), CompilerError> {
        if let Some(name) = self.core_name(f) {
            match (name, args.len()) {
                // Arithmetic identities and variadic expansion.
                ("+", 0) => {
                    self.emit(Op::Int, 0, loc);
                    return Ok(());
                }
                ("*", 0) => {
                    self.emit(Op::Int, 1, loc);
                    return Ok(());
                }
                ("+" | "*" | "-" | "/" | "mod" | "rem", n) if n >= 2 => {
                    let op = match name {
                        "+" => Op::Add,
                        "*" => Op::Mul,
                        "-" => Op::Sub,
                        "/" => Op::Div,
                        "mod" => Op::Mod,
                        _ => Op::Rem,
                    };
                    self.compile_arith_fold(op, args, loc)?;
                    return Ok(());
                }
                ("-", 1) => {
                    self.compile(&args[0], false)?;
                    self.emit(Op::Neg, 0, loc);
                    return Ok(());
                }
                ("inc", 1) => {
                    self.compile(&args[0], false)?;
                    self.emit(Op::Int, 1, loc);
                    self.emit(Op::Add, 0, loc);
                    return Ok(());
                }
                ("dec", 1) => {
                    self.compile(&args[0], false)?;
                    self.emit(Op::Int, 1, loc);
                    self.emit(Op::Sub, 0, loc);
                    return Ok(());
                }
                ("not", 1) => {
                    self.compile(&args[0], false)?;
                    self.emit(Op::Not, 0, loc);
                    return Ok(());
                }
                ("=" | "not=" | "<" | "<=" | ">" | ">=", 2) => {
                    self.compile(&args[0], false)?;
                    self.compile(&args[1], false)?;
                    let op = match name {
                        "=" => Op::Eq,
                        "not=" => Op::Neq,
                        "<" => Op::Lt,
                        "<=" => Op::Le,
                        ">" => Op::Gt,
                        _ => Op::Ge,
                    };
                    self.emit(op, 0, loc);
                    return Ok(());
                }
                ("vector", n) => {
                    for arg in args {
                        self.compile(arg, false)?;
                    }
                    self.emit(Op::VecNew, n, loc);
                    return Ok(());
                }
                ("list", n) => {
                    for arg in args {
                        self.compile(arg, false)?;
                    }
                    self.emit(Op::ListNew, n, loc);
                    return Ok(());
                }
                ("apply", n) if n >= 2 => {
                    for arg in args {
                        self.compile(arg, false)?;
                    }
                    self.emit(Op::Apply, n - 1, loc);
                    return Ok(());
                }
                _ => {}
            }
        }
        // General call.
        self.compile(f, false)?;
        for arg in args {
            self.compile(arg, false)?;
        }
        let op = if tail && self.try_depth == 0 { Op::TailCall } else { Op::Call };
        self.emit(op, args.len(), loc);
        Ok(())
    }

    /// Left-fold a binary arithmetic op. The first pair fuses to
    /// `AddLocalConst` when it is literally `(+ local small-const ...)`.
    fn compile_arith_fold(
        &mut self,
        op: Op,
        args: &[Node],
        loc: Loc,
    ) -> Result<(), CompilerError> {
        let first = &args[0];
        let second = &args[1];

        let fused = op == Op::Add
            && matches!(first, Node::Local { slot, .. } if *slot < 256)
            && matches!(second, Node::Const { value, .. } if value.is_int());
        if fused {
            let Node::Local { slot, .. } = first else { unreachable!() };
            let Node::Const { value, .. } = second else { unreachable!() };
            let cidx = self.const_idx(*value);
            if cidx < 256 {
                self.emit(Op::AddLocalConst, ((*slot as usize) << 8) | cidx, loc);
            } else {
                self.compile(first, false)?;
                self.compile(second, false)?;
                self.emit(Op::Add, 0, loc);
            }
        } else {
            self.compile(first, false)?;
            self.compile(second, false)?;
            self.emit(op, 0, loc);
        }
        for arg in &args[2..] {
            self.compile(arg, false)?;
            self.emit(op, 0, loc);
        }
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &[Node],
        catches: &[lyra_runtime::ast::CatchClause],
        finally: Option<&[Node]>,
        loc: Loc,
    ) -> Result<(), CompilerError> {
        let handler_idx = self.handlers.len();
        self.handlers.push(HandlerDesc { pc_begin: 0, pc_end: 0, pc_handler: 0 });
        self.emit(Op::TryStart, handler_idx, loc);
        let begin = self.code.len() as u32;
        self.try_depth += 1;
        self.compile_body(body, false, loc)?;
        self.try_depth -= 1;
        let end = self.code.len() as u32;
        self.emit(Op::TryEnd, 0, loc);
        // Normal exit: run finally (discarding its value), keep the body's.
        if let Some(finally_body) = finally {
            self.compile_body(finally_body, false, loc)?;
            self.emit(Op::Pop, 0, loc);
        }
        let mut exits = vec![self.emit_jump(Op::Jump, loc)];

        // Handler: exception on top of stack.
        let handler_pc = self.code.len() as u32;
        self.handlers[handler_idx] =
            HandlerDesc { pc_begin: begin, pc_end: end, pc_handler: handler_pc };
        for clause in catches {
            let kind_idx = self.const_idx(clause.kind);
            self.emit(Op::CatchMatch, kind_idx, loc);
            let next = self.emit_jump(Op::BranchIfFalse, loc);
            self.emit(Op::StoreLocal, clause.slot as usize, loc);
            self.compile_body(&clause.body, false, loc)?;
            if let Some(finally_body) = finally {
                self.compile_body(finally_body, false, loc)?;
                self.emit(Op::Pop, 0, loc);
            }
            exits.push(self.emit_jump(Op::Jump, loc));
            self.patch_here(next, loc)?;
        }
        // No clause matched: run finally, rethrow.
        if let Some(finally_body) = finally {
            self.compile_body(finally_body, false, loc)?;
            self.emit(Op::Pop, 0, loc);
        }
        self.emit(Op::Throw, 0, loc);
        for site in exits {
            self.patch_here(site, loc)?;
        }
        Ok(())
    }

    fn compile_case(
        &mut self,
        expr: &Node,
        clauses: &[lyra_runtime::ast::CaseClause],
        default: Option<&Node>,
        tail: bool,
        loc: Loc,
    ) -> Result<(), CompilerError> {
        self.compile(expr, false)?;
        let table_idx = self.cases.len();
        self.cases.push(CaseTable {
            strategy: CaseStrategy::Seq { clauses: Vec::new() },
            default_target: 0,
        });
        self.emit(Op::CaseDispatch, table_idx, loc);

        let mut targets = Vec::with_capacity(clauses.len());
        let mut exits = Vec::with_capacity(clauses.len() + 1);
        for clause in clauses {
            targets.push(self.code.len() as u32);
            self.compile(&clause.body, tail)?;
            exits.push(self.emit_jump(Op::Jump, loc));
        }
        let default_target = self.code.len() as u32;
        match default {
            Some(d) => self.compile(d, tail)?,
            None => {
                // No matching clause: value error built from the scrutinee.
                // The scrutinee was already consumed; report generically.
                let site = self.core_builtin_var("ex-info", loc)?;
                self.emit(Op::VarLoad, site, loc);
                let msg = self.env.interned.alloc_permanent(ObjStr::new("no matching clause"));
                let m_idx = self.const_idx(msg);
                self.emit(Op::Const, m_idx, loc);
                self.emit(Op::MapNew, 0, loc);
                self.emit(Op::Call, 2, loc);
                self.emit(Op::Throw, 0, loc);
                self.emit(Op::Nil, 0, loc);
            }
        }
        for site in exits {
            self.patch_here(site, loc)?;
        }

        self.cases[table_idx] = build_case_table(clauses, &targets, default_target);
        Ok(())
    }
}

/// Choose the dispatch strategy: a hashed jump table when some (shift, mask)
/// separates every clause hash, else the sequential chain.
fn build_case_table(
    clauses: &[lyra_runtime::ast::CaseClause],
    targets: &[u32],
    default_target: u32,
) -> CaseTable {
    let n = clauses.len();
    if n >= 2 {
        let mut size = (n * 2).next_power_of_two().max(4);
        while size <= 1024 {
            let mask = (size - 1) as u32;
            for shift in 0..28u32 {
                let mut slots: Vec<Option<CaseSlot>> = vec![None; size];
                let mut ok = true;
                for (clause, target) in clauses.iter().zip(targets) {
                    let idx = ((clause.hash >> shift) & mask) as usize;
                    if slots[idx].is_some() {
                        ok = false;
                        break;
                    }
                    slots[idx] = Some(CaseSlot { head: clause.head, target: *target });
                }
                if ok {
                    return CaseTable {
                        strategy: CaseStrategy::Hash { shift, mask, slots },
                        default_target,
                    };
                }
            }
            size *= 2;
        }
    }
    CaseTable {
        strategy: CaseStrategy::Seq {
            clauses: clauses
                .iter()
                .zip(targets)
                .map(|(c, t)| CaseSlot { head: c.head, target: *t })
                .collect(),
        },
        default_target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze_top;
    use crate::reader::read_all;

    fn env() -> std::sync::Arc<Env> {
        crate::bootstrap::new_env()
    }

    fn compile_src(env: &Env, src: &str) -> Chunk {
        let forms = read_all(src).unwrap();
        let (node, locals) = analyze_top(env, &forms[0]).unwrap();
        compile_top(env, node, locals).unwrap()
    }

    fn ops(chunk: &Chunk) -> Vec<Op> {
        chunk.top.code.iter().map(|i| i.op).collect()
    }

    #[test]
    fn arithmetic_compiles_to_direct_opcodes() {
        let env = env();
        let _m = env.gc.register_mutator();
        let chunk = compile_src(&env, "(+ 1 2)");
        let ops = ops(&chunk);
        assert!(ops.contains(&Op::Add), "intrinsic add, no var call: {ops:?}");
        assert!(!ops.contains(&Op::Call));
    }

    #[test]
    fn variadic_plus_left_folds() {
        let env = env();
        let _m = env.gc.register_mutator();
        let chunk = compile_src(&env, "(+ 1 2 3 4)");
        let adds = chunk.top.code.iter().filter(|i| i.op == Op::Add).count();
        assert_eq!(adds, 3, "left fold of binary adds");
    }

    #[test]
    fn zero_arg_identities() {
        let env = env();
        let _m = env.gc.register_mutator();
        let chunk = compile_src(&env, "(+)");
        assert_eq!(chunk.top.code[0].op, Op::Int);
        assert_eq!(chunk.top.code[0].a, 0);
        let chunk = compile_src(&env, "(*)");
        assert_eq!(chunk.top.code[0].a, 1);
    }

    #[test]
    fn fused_compare_branch() {
        let env = env();
        let _m = env.gc.register_mutator();
        let chunk = compile_src(&env, "(if (= 1 2) :a :b)");
        let ops = ops(&chunk);
        assert!(ops.contains(&Op::BranchIfNeq));
        assert!(!ops.contains(&Op::Eq), "eq is folded into the branch");
    }

    #[test]
    fn collection_constructors_inline() {
        let env = env();
        let _m = env.gc.register_mutator();
        let ops1 = ops(&compile_src(&env, "(vector 1 2 3)"));
        assert!(ops1.contains(&Op::VecNew));
        let ops2 = ops(&compile_src(&env, "[1 2 3]"));
        assert!(ops2.contains(&Op::VecNew));
    }

    #[test]
    fn tail_call_emitted_in_tail_position() {
        let env = env();
        let _m = env.gc.register_mutator();
        let chunk = compile_src(&env, "(defn f [x] (f x))");
        // The nested proto for f should tail-call itself.
        let f_proto = &chunk.top.protos[0];
        assert!(f_proto.code.iter().any(|i| i.op == Op::TailCall), "{:?}", f_proto.code);
    }

    #[test]
    fn case_builds_hash_table_for_distinct_heads() {
        let env = env();
        let _m = env.gc.register_mutator();
        let chunk = compile_src(&env, "(case 2 1 :one 2 :two 3 :three :other)");
        let table = &chunk.top.cases[0];
        assert!(
            matches!(table.strategy, CaseStrategy::Hash { .. }),
            "distinct literal heads should hash-dispatch"
        );
    }

    #[test]
    fn try_emits_handler_descriptor() {
        let env = env();
        let _m = env.gc.register_mutator();
        let chunk = compile_src(&env, "(try 1 (catch :default e 2))");
        assert_eq!(chunk.top.handlers.len(), 1);
        let h = chunk.top.handlers[0];
        assert!(h.pc_begin <= h.pc_end && h.pc_end < h.pc_handler);
    }
}
