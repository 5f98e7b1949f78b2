//! Bytecode Virtual Machine
//!
//! Stack machine with a heap-allocated operand stack (deep language
//! recursion must not consume native stack), a call-frame stack, and a
//! runtime handler stack. The dispatch loop polls the GC every
//! [`SAFEPOINT_INTERVAL`] instructions and at call/return boundaries.
//!
//! Reentrancy: builtins that call back into language code go through the
//! call bridge, which re-enters the innermost active VM on this thread via a
//! raw pointer. The loop never holds Rust references into the VM across a
//! builtin call, so the aliasing is confined to the stack arrays the callee
//! is allowed to touch.
//!
//! Exception scope isolation: `run_until` executes frames above a barrier;
//! handlers installed at or below the barrier belong to an outer context
//! (possibly the other engine) and are never selected from inside it.

use std::sync::Arc;

use crate::bridge;
use crate::chunk::{CaseStrategy, FnProto, Instr, Op, WIDE_OPERAND};
use crate::env::{Env, RootProvider};
use crate::error::{self, ErrorKind};
use crate::heap::{ClosureBody, ObjClosure, ObjHeader};
use crate::seq;
use crate::value::{HeapTag, Tag, Value};

/// Operand stack slots (8 bytes each). Sized so 100k-deep non-tail language
/// recursion fits.
pub const STACK_SIZE: usize = 1 << 20;

/// Instructions between GC polls.
const SAFEPOINT_INTERVAL: u32 = 256;

struct CallFrame {
    proto: Arc<FnProto>,
    ip: usize,
    /// First local slot.
    base: usize,
    /// Where the return value lands (the callee slot).
    ret_slot: usize,
    /// The closure being executed; nil for a top-level chunk.
    closure: Value,
    saved_ns: Box<str>,
}

struct HandlerRec {
    /// Index into the owning proto's handler table.
    desc: usize,
    /// `frames.len()` at install time.
    frame_count: usize,
    saved_sp: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    sp: usize,
    frames: Vec<CallFrame>,
    handlers: Vec<HandlerRec>,
    poll_counter: u32,
}

impl RootProvider for Vm {
    fn push_roots(&self, work: &mut Vec<Value>) {
        work.extend_from_slice(&self.stack[..self.sp]);
        for frame in &self.frames {
            work.push(frame.closure);
        }
    }
}

/// Execute a top-level prototype: reuse the innermost active VM on this
/// thread, or create one for the duration of the call.
pub fn execute_proto(env: &Env, proto: Arc<FnProto>) -> Result<Value, Value> {
    if let Some(ptr) = env.current_vm() {
        // Safety: the pointer targets the VM currently running below us on
        // this thread; see module doc on reentrancy.
        let vm = unsafe { &mut *(ptr as *mut Vm) };
        return vm.call_proto(env, proto);
    }
    let mut vm = Vm::new();
    let vm_ptr: *const dyn RootProvider = &*vm;
    let _roots = env.register_provider(vm_ptr);
    env.push_active_vm(&mut *vm as *mut Vm as usize);
    let out = vm.call_proto(env, proto);
    env.pop_active_vm();
    out
}

/// Bridge entry: call a bytecode closure on the innermost active VM, or a
/// fresh one.
pub fn execute_closure(env: &Env, closure: Value, args: &[Value]) -> Result<Value, Value> {
    if let Some(ptr) = env.current_vm() {
        let vm = unsafe { &mut *(ptr as *mut Vm) };
        return vm.call_closure(env, closure, args);
    }
    let mut vm = Vm::new();
    let vm_ptr: *const dyn RootProvider = &*vm;
    let _roots = env.register_provider(vm_ptr);
    env.push_active_vm(&mut *vm as *mut Vm as usize);
    let out = vm.call_closure(env, closure, args);
    env.pop_active_vm();
    out
}

impl Vm {
    /// The VM struct is boxed: a megaslot stack must not live on the native
    /// stack.
    pub fn new() -> Box<Vm> {
        Box::new(Vm {
            stack: vec![Value::NIL; STACK_SIZE],
            sp: 0,
            frames: Vec::with_capacity(64),
            handlers: Vec::with_capacity(8),
            poll_counter: SAFEPOINT_INTERVAL,
        })
    }

    #[inline]
    fn push(&mut self, env: &Env, v: Value) -> Result<(), Value> {
        if self.sp >= self.stack.len() {
            return Err(error::raise(env, ErrorKind::Internal, "operand stack overflow"));
        }
        self.stack[self.sp] = v;
        self.sp += 1;
        Ok(())
    }

    #[inline]
    fn pop(&mut self) -> Value {
        debug_assert!(self.sp > 0, "operand stack underflow");
        self.sp -= 1;
        self.stack[self.sp]
    }

    #[inline]
    fn peek(&self, depth: usize) -> Value {
        self.stack[self.sp - 1 - depth]
    }

    /// Run a top-level prototype (zero-argument entry).
    pub fn call_proto(&mut self, env: &Env, proto: Arc<FnProto>) -> Result<Value, Value> {
        let barrier = self.frames.len();
        let entry_sp = self.sp;
        let ret_slot = self.sp;
        self.push(env, Value::NIL)?; // callee slot placeholder
        if let Err(exc) = self.enter_proto(env, proto, Value::NIL, ret_slot, 0) {
            self.sp = entry_sp;
            return Err(exc);
        }
        let out = self.run_until(env, barrier);
        self.sp = entry_sp;
        out
    }

    /// Re-entrant closure call used by the bridge and by `Apply`.
    pub fn call_closure(&mut self, env: &Env, closure: Value, args: &[Value]) -> Result<Value, Value> {
        let barrier = self.frames.len();
        let entry_sp = self.sp;
        let ret_slot = self.sp;
        self.push(env, closure)?;
        for a in args {
            self.push(env, *a)?;
        }
        if let Err(exc) = self.begin_call(env, args.len()) {
            self.sp = entry_sp;
            return Err(exc);
        }
        // A builtin-or-bridge callee may already have completed the call.
        if self.frames.len() == barrier {
            let out = self.stack[ret_slot];
            self.sp = entry_sp;
            return Ok(out);
        }
        let out = self.run_until(env, barrier);
        self.sp = entry_sp;
        out
    }

    /// Arity-dispatch into a bytecode prototype. The stack already holds
    /// `[callee a0 .. an-1]` with `ret_slot` at the callee.
    fn enter_proto(
        &mut self,
        env: &Env,
        proto: Arc<FnProto>,
        closure: Value,
        ret_slot: usize,
        argc: usize,
    ) -> Result<(), Value> {
        let Some(arity) = proto.arity_for(argc) else {
            return Err(error::arity_error(env, proto.describe_name(), argc));
        };
        let arity = *arity;
        let base = ret_slot + 1;

        if arity.is_variadic {
            let fixed = arity.params as usize;
            let rest = seq::list_from(env, &self.stack[base + fixed..base + argc])?;
            self.stack[base + fixed] = rest;
            self.sp = base + fixed + 1;
        }
        // Zero the remaining local slots.
        let locals_end = base + arity.local_count as usize;
        if locals_end > self.stack.len() {
            return Err(error::raise(env, ErrorKind::Internal, "operand stack overflow"));
        }
        while self.sp < locals_end {
            self.stack[self.sp] = Value::NIL;
            self.sp += 1;
        }

        let saved_ns = env.current_ns();
        if closure.heap_tag() == Some(HeapTag::Closure) {
            let obj = ObjClosure::of(closure);
            if obj.ns.heap_tag() == Some(HeapTag::Symbol) {
                env.set_current_ns(&crate::heap::ObjSymbol::of(obj.ns).name);
            }
        }
        self.frames.push(CallFrame {
            proto,
            ip: arity.entry_pc as usize,
            base,
            ret_slot,
            closure,
            saved_ns,
        });
        Ok(())
    }

    /// Route a `Call n`: the callee is `n+1` deep on the stack.
    fn begin_call(&mut self, env: &Env, argc: usize) -> Result<(), Value> {
        let callee_slot = self.sp - argc - 1;
        let callee = self.stack[callee_slot];
        match callee.tag() {
            Tag::Builtin => {
                let def = callee.as_builtin();
                let mut buf = [Value::NIL; 8];
                let result = if argc <= buf.len() {
                    buf[..argc].copy_from_slice(&self.stack[callee_slot + 1..self.sp]);
                    (def.func)(env, &buf[..argc])?
                } else {
                    let args: Vec<Value> = self.stack[callee_slot + 1..self.sp].to_vec();
                    (def.func)(env, &args)?
                };
                self.sp = callee_slot;
                self.push(env, result)
            }
            Tag::Heap(HeapTag::Closure) => {
                let obj = ObjClosure::of(callee);
                match &obj.body {
                    ClosureBody::Bytecode(proto) => {
                        self.enter_proto(env, proto.clone(), callee, callee_slot, argc)
                    }
                    ClosureBody::Tree(_) => {
                        let args: Vec<Value> = self.stack[callee_slot + 1..self.sp].to_vec();
                        let result = crate::treewalk::call_closure(env, callee, &args)?;
                        self.sp = callee_slot;
                        self.push(env, result)
                    }
                    ClosureBody::Partial { f, args: pre } => {
                        let mut full = pre.to_vec();
                        full.extend_from_slice(&self.stack[callee_slot + 1..self.sp]);
                        let f = *f;
                        let result = bridge::call_fn(env, f, &full)?;
                        self.sp = callee_slot;
                        self.push(env, result)
                    }
                }
            }
            _ => {
                // Keywords, maps, vectors, sets, var-refs, multimethods,
                // protocol methods: one unified dispatch point.
                let args: Vec<Value> = self.stack[callee_slot + 1..self.sp].to_vec();
                let result = bridge::call_fn(env, callee, &args)?;
                self.sp = callee_slot;
                self.push(env, result)
            }
        }
    }

    /// Dispatch an exception against the runtime handler stack. Handlers at
    /// or below `barrier` frames belong to an outer context and are skipped.
    /// Returns the exception when no handler in range matches.
    fn unwind(&mut self, env: &Env, exc: Value, barrier: usize) -> Result<(), Value> {
        while let Some(handler) = self.handlers.last() {
            if handler.frame_count <= barrier {
                break;
            }
            let handler = self.handlers.pop().expect("handler stack");
            if handler.frame_count > self.frames.len() {
                continue; // belonged to an already-unwound frame
            }
            let frame = &self.frames[handler.frame_count - 1];
            let desc = frame.proto.handlers[handler.desc];
            // The pc to test: the active ip in that frame (for the top frame
            // the instruction that threw, for outer frames their call site).
            let pc = frame.ip.saturating_sub(1) as u32;
            if pc < desc.pc_begin || pc >= desc.pc_end {
                continue;
            }
            // Restore: frames above the handler's frame, the operand stack,
            // then jump to the handler with the exception pushed.
            while self.frames.len() > handler.frame_count {
                let dead = self.frames.pop().expect("frame stack");
                env.set_current_ns(&dead.saved_ns);
            }
            self.sp = handler.saved_sp;
            self.push(env, exc)?;
            let frame = self.frames.last_mut().expect("handler frame");
            frame.ip = desc.pc_handler as usize;
            return Ok(());
        }
        // No handler inside this execution segment: restore to the barrier
        // and let the caller propagate.
        while self.frames.len() > barrier {
            let dead = self.frames.pop().expect("frame stack");
            env.set_current_ns(&dead.saved_ns);
        }
        while self.handlers.last().map(|h| h.frame_count > barrier).unwrap_or(false) {
            self.handlers.pop();
        }
        Err(exc)
    }

    /// Read a possibly-wide operand; advances the frame ip past extension
    /// words.
    fn operand(&mut self, instr: Instr) -> usize {
        if instr.a != WIDE_OPERAND {
            return instr.a as usize;
        }
        let frame = self.frames.last_mut().expect("frame");
        let hi = frame.proto.code[frame.ip];
        let lo = frame.proto.code[frame.ip + 1];
        frame.ip += 2;
        ((hi.a as usize) << 16) | lo.a as usize
    }

    /// The dispatch loop. Executes until the frame stack returns to
    /// `barrier`, yielding the final return value.
    fn run_until(&mut self, env: &Env, barrier: usize) -> Result<Value, Value> {
        loop {
            // Safe point every N instructions; calls/returns poll via the
            // allocation path inside.
            self.poll_counter -= 1;
            if self.poll_counter == 0 {
                self.poll_counter = SAFEPOINT_INTERVAL;
                env.safe_point();
            } else if env.gc.poll_requested() {
                env.safe_point();
            }

            let (instr, proto) = {
                let frame = self.frames.last_mut().expect("no active frame");
                let instr = frame.proto.code[frame.ip];
                frame.ip += 1;
                (instr, frame.proto.clone())
            };

            let step = self.step(env, instr, &proto, barrier);
            match step {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => {}
                Err(exc) => self.unwind(env, exc, barrier)?,
            }
        }
    }

    /// Execute one instruction. `Ok(Some(v))` means the barrier frame
    /// returned with `v`.
    fn step(
        &mut self,
        env: &Env,
        instr: Instr,
        proto: &Arc<FnProto>,
        barrier: usize,
    ) -> Result<Option<Value>, Value> {
        let base = self.frames.last().expect("frame").base;
        match instr.op {
            Op::Const => {
                let idx = self.operand(instr);
                self.push(env, proto.consts[idx])?;
            }
            Op::Ext => {
                return Err(error::raise(env, ErrorKind::Internal, "stray extension word"));
            }
            Op::Nil => self.push(env, Value::NIL)?,
            Op::True => self.push(env, Value::TRUE)?,
            Op::False => self.push(env, Value::FALSE)?,
            Op::Int => self.push(env, Value::int(instr.a as i16 as i64))?,
            Op::LoadLocal => {
                let v = self.stack[base + instr.a as usize];
                self.push(env, v)?;
            }
            Op::StoreLocal => {
                let v = self.pop();
                self.stack[base + instr.a as usize] = v;
            }
            Op::LoadCaptured => {
                let frame = self.frames.last().expect("frame");
                let closure = ObjClosure::of(frame.closure);
                let v = closure.captures[instr.a as usize];
                self.push(env, v)?;
            }
            Op::Pop => {
                self.pop();
            }
            Op::Dup => {
                let v = self.peek(0);
                self.push(env, v)?;
            }

            // ----- arithmetic -----
            Op::Add => {
                let b = self.pop();
                let a = self.pop();
                // Integer+integer fast path inline.
                let r = if a.is_int() && b.is_int() {
                    match a.as_i64().checked_add(b.as_i64()) {
                        Some(n) => Value::from_i64(n),
                        None => Value::float(a.as_i64() as f64 + b.as_i64() as f64),
                    }
                } else {
                    crate::arith::add(env, a, b)?
                };
                self.push(env, r)?;
            }
            Op::Sub => self.binary_arith(env, crate::arith::sub)?,
            Op::Mul => self.binary_arith(env, crate::arith::mul)?,
            Op::Div => self.binary_arith(env, crate::arith::div)?,
            Op::Mod => self.binary_arith(env, crate::arith::modulo)?,
            Op::Rem => self.binary_arith(env, crate::arith::remainder)?,
            Op::Neg => {
                let a = self.pop();
                let r = crate::arith::negate(env, a)?;
                self.push(env, r)?;
            }

            // ----- comparison -----
            Op::Eq => {
                let b = self.pop();
                let a = self.pop();
                let r = crate::eq::equiv(env, a, b)?;
                self.push(env, Value::bool(r))?;
            }
            Op::Neq => {
                let b = self.pop();
                let a = self.pop();
                let r = crate::eq::equiv(env, a, b)?;
                self.push(env, Value::bool(!r))?;
            }
            Op::Lt => self.compare(env, |o| o == std::cmp::Ordering::Less)?,
            Op::Le => self.compare(env, |o| o != std::cmp::Ordering::Greater)?,
            Op::Gt => self.compare(env, |o| o == std::cmp::Ordering::Greater)?,
            Op::Ge => self.compare(env, |o| o != std::cmp::Ordering::Less)?,
            Op::Not => {
                let v = self.pop();
                self.push(env, Value::bool(!v.is_truthy()))?;
            }

            // ----- branches -----
            Op::Jump => {
                let target = self.operand(instr);
                self.frames.last_mut().expect("frame").ip = target;
            }
            Op::BranchIfFalse => {
                let target = self.operand(instr);
                if !self.pop().is_truthy() {
                    self.frames.last_mut().expect("frame").ip = target;
                }
            }
            Op::BranchIfTrue => {
                let target = self.operand(instr);
                if self.pop().is_truthy() {
                    self.frames.last_mut().expect("frame").ip = target;
                }
            }

            // ----- collections -----
            // Operands stay on the stack (rooted) until the allocation is
            // done; only then does sp drop.
            Op::VecNew => {
                let n = self.operand(instr);
                let items = self.stack[self.sp - n..self.sp].to_vec();
                let v = env.alloc(crate::heap::ObjVector::new(items))?;
                self.sp -= n;
                self.push(env, v)?;
            }
            Op::ListNew => {
                let n = self.operand(instr);
                let l = seq::list_from(env, &self.stack[self.sp - n..self.sp])?;
                self.sp -= n;
                self.push(env, l)?;
            }
            Op::MapNew => {
                let n = self.operand(instr); // pair count
                let mut pairs = Vec::with_capacity(n);
                let start = self.sp - n * 2;
                for i in 0..n {
                    pairs.push((self.stack[start + i * 2], self.stack[start + i * 2 + 1]));
                }
                let m = crate::collections::map_literal(env, &pairs)?;
                self.sp = start;
                self.push(env, m)?;
            }
            Op::SetNew => {
                let n = self.operand(instr);
                let items = self.stack[self.sp - n..self.sp].to_vec();
                let s = crate::collections::set_literal(env, &items)?;
                self.sp -= n;
                self.push(env, s)?;
            }

            // ----- calls -----
            Op::Call => {
                let argc = self.operand(instr);
                self.begin_call(env, argc)?;
            }
            Op::TailCall => {
                let argc = self.operand(instr);
                // Relocate callee+args over the current frame, pop it, then
                // dispatch as an ordinary call in the caller's slot.
                let frame = self.frames.pop().expect("frame");
                env.set_current_ns(&frame.saved_ns);
                let src = self.sp - argc - 1;
                let dst = frame.ret_slot;
                self.stack.copy_within(src..self.sp, dst);
                self.sp = dst + argc + 1;
                self.begin_call(env, argc)?;
                if self.frames.len() == barrier {
                    // Callee completed inline (builtin); its result sits in
                    // the slot the barrier caller reads.
                    return Ok(Some(self.stack[dst]));
                }
            }
            Op::Apply => {
                let argc = self.operand(instr); // fixed args + trailing seq
                let seq_arg = self.pop();
                let scope = env.roots();
                scope.keep(seq_arg);
                let spliced = seq::to_vec(env, &scope, seq_arg)?;
                let splice_len = spliced.len();
                for v in spliced {
                    self.push(env, v)?;
                }
                self.begin_call(env, argc - 1 + splice_len)?;
            }
            Op::Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("frame");
                env.set_current_ns(&frame.saved_ns);
                while self.handlers.last().map(|h| h.frame_count > self.frames.len()).unwrap_or(false)
                {
                    self.handlers.pop();
                }
                self.stack[frame.ret_slot] = result;
                self.sp = frame.ret_slot + 1;
                if self.frames.len() == barrier {
                    return Ok(Some(result));
                }
            }

            // ----- vars -----
            Op::VarLoad => {
                let site = &proto.var_sites[self.operand(instr)];
                let v = if site.var.is_dynamic() {
                    env.var_value(site.var)
                } else {
                    site.load()
                };
                match v {
                    Some(v) => self.push(env, v)?,
                    None => {
                        return Err(error::raise(
                            env,
                            ErrorKind::Name,
                            format!("unable to resolve var: {}", site.var.qualified()),
                        ));
                    }
                }
            }
            Op::VarResolve => {
                let sym = proto.consts[self.operand(instr)];
                let obj = crate::heap::ObjSymbol::of(sym);
                let var = env.resolve_var(obj.ns.as_deref(), &obj.name).ok_or_else(|| {
                    error::raise(
                        env,
                        ErrorKind::Name,
                        format!("unable to resolve symbol: {}", obj.qualified()),
                    )
                })?;
                match env.var_value(var) {
                    Some(v) => self.push(env, v)?,
                    None => {
                        return Err(error::raise(
                            env,
                            ErrorKind::Name,
                            format!("unbound var: {}", var.qualified()),
                        ));
                    }
                }
            }
            Op::Def | Op::DefDynamic => {
                let site = &proto.var_sites[self.operand(instr)];
                let v = self.pop();
                if instr.op == Op::DefDynamic {
                    site.var.dynamic.store(true, std::sync::atomic::Ordering::Release);
                }
                maybe_name_closure(v, &site.var.name);
                site.var.set_root(v);
                let var_ref = Value::heap(HeapTag::VarRef, site.var as *const _ as *const u8);
                self.push(env, var_ref)?;
            }

            // ----- closures -----
            Op::MakeClosure => {
                let nested = proto.protos[self.operand(instr)].clone();
                let frame_closure = self.frames.last().expect("frame").closure;
                let mut captures = Vec::with_capacity(nested.capture_sources.len());
                let mut self_slots = Vec::new();
                for (i, source) in nested.capture_sources.iter().enumerate() {
                    captures.push(match source {
                        crate::ast::CaptureSource::Local(slot) => self.stack[base + *slot as usize],
                        crate::ast::CaptureSource::Capture(idx) => {
                            ObjClosure::of(frame_closure).captures[*idx as usize]
                        }
                        crate::ast::CaptureSource::SelfRef => {
                            self_slots.push(i);
                            Value::NIL
                        }
                    });
                }
                let ns = env.symbol(&env.current_ns());
                let name = nested.name.clone();
                let closure = env.alloc(ObjClosure {
                    hdr: ObjHeader::new(HeapTag::Closure),
                    body: ClosureBody::Bytecode(nested),
                    captures: captures.into_boxed_slice(),
                    ns,
                    name,
                    meta: Value::NIL,
                })?;
                patch_self_captures(closure, &self_slots);
                self.push(env, closure)?;
            }

            // ----- recur -----
            Op::Recur => {
                let info = proto.loops[self.operand(instr)];
                self.do_recur(env, info)?;
            }

            // ----- exceptions -----
            Op::TryStart => {
                let desc = self.operand(instr);
                self.handlers.push(HandlerRec {
                    desc,
                    frame_count: self.frames.len(),
                    saved_sp: self.sp,
                });
            }
            Op::TryEnd => {
                self.handlers.pop();
            }
            Op::Throw => {
                let exc = self.pop();
                return Err(exc);
            }
            Op::CaseDispatch => {
                let table = &proto.cases[self.operand(instr)];
                let v = self.pop();
                let target = match &table.strategy {
                    CaseStrategy::Hash { shift, mask, slots } => {
                        let h = crate::hashing::hash_value(env, v)?;
                        let idx = ((h >> shift) & mask) as usize;
                        match slots.get(idx).and_then(|s| s.as_ref()) {
                            Some(slot) if crate::eq::equiv(env, v, slot.head)? => slot.target,
                            _ => table.default_target,
                        }
                    }
                    CaseStrategy::Seq { clauses } => {
                        let mut target = table.default_target;
                        for c in clauses {
                            if crate::eq::equiv(env, v, c.head)? {
                                target = c.target;
                                break;
                            }
                        }
                        target
                    }
                };
                self.frames.last_mut().expect("frame").ip = target as usize;
            }

            // ----- bindings -----
            Op::BindingPush => {
                let pairs = self.operand(instr);
                let mut bound = Vec::with_capacity(pairs);
                let start = self.sp - pairs * 2;
                for i in 0..pairs {
                    let var_ref = self.stack[start + i * 2];
                    let value = self.stack[start + i * 2 + 1];
                    if var_ref.heap_tag() != Some(HeapTag::VarRef) {
                        return Err(error::type_error(env, "var", var_ref));
                    }
                    let var = crate::heap::Var::of(var_ref);
                    if !var.is_dynamic() {
                        return Err(error::raise(
                            env,
                            ErrorKind::IllegalState,
                            format!("cannot bind non-dynamic var: {}", var.qualified()),
                        ));
                    }
                    bound.push((var, value));
                }
                self.sp = start;
                env.bindings.push(bound);
            }
            Op::BindingPop => {
                if env.bindings.pop().is_err() {
                    return Err(error::raise(
                        env,
                        ErrorKind::Internal,
                        "unbalanced binding frame pop",
                    ));
                }
            }
            Op::CatchMatch => {
                let kind = proto.consts[self.operand(instr)];
                let exc = self.peek(0);
                let matches = error::catch_matches(env, kind, exc);
                self.push(env, Value::bool(matches))?;
            }

            // ----- superinstructions -----
            Op::AddLocalConst => {
                let slot = (instr.a >> 8) as usize;
                let cidx = (instr.a & 0xFF) as usize;
                let a = self.stack[base + slot];
                let b = proto.consts[cidx];
                let r = if a.is_int() && b.is_int() {
                    match a.as_i64().checked_add(b.as_i64()) {
                        Some(n) => Value::from_i64(n),
                        None => Value::float(a.as_i64() as f64 + b.as_i64() as f64),
                    }
                } else {
                    crate::arith::add(env, a, b)?
                };
                self.push(env, r)?;
            }
            Op::BranchIfNeq => {
                let target = self.operand(instr);
                let b = self.pop();
                let a = self.pop();
                if !crate::eq::equiv(env, a, b)? {
                    self.frames.last_mut().expect("frame").ip = target;
                }
            }
            Op::BranchIfNotLt => {
                let target = self.operand(instr);
                let b = self.pop();
                let a = self.pop();
                let lt = if a.is_int() && b.is_int() {
                    a.as_i64() < b.as_i64()
                } else {
                    crate::arith::compare(env, a, b)? == std::cmp::Ordering::Less
                };
                if !lt {
                    self.frames.last_mut().expect("frame").ip = target;
                }
            }
            Op::RecurLocal1 => {
                let slot = (instr.a >> 8) as usize;
                let loop_idx = (instr.a & 0xFF) as usize;
                let v = self.stack[base + slot];
                self.push(env, v)?;
                let info = proto.loops[loop_idx];
                self.do_recur(env, info)?;
            }
        }
        Ok(None)
    }

    /// Store `info.count` stacked arguments into the loop slots and jump to
    /// the loop head.
    fn do_recur(&mut self, _env: &Env, info: crate::chunk::LoopInfo) -> Result<(), Value> {
        let frame_base = self.frames.last().expect("frame").base;
        let n = info.count as usize;
        let start = self.sp - n;
        for i in 0..n {
            self.stack[frame_base + info.base_slot as usize + i] = self.stack[start + i];
        }
        self.sp = start;
        let frame = self.frames.last_mut().expect("frame");
        frame.ip = info.start_pc as usize;
        Ok(())
    }

    fn binary_arith(
        &mut self,
        env: &Env,
        f: fn(&Env, Value, Value) -> Result<Value, Value>,
    ) -> Result<(), Value> {
        let b = self.pop();
        let a = self.pop();
        let r = f(env, a, b)?;
        self.push(env, r)
    }

    fn compare(
        &mut self,
        env: &Env,
        accept: fn(std::cmp::Ordering) -> bool,
    ) -> Result<(), Value> {
        let b = self.pop();
        let a = self.pop();
        let ord = if a.is_int() && b.is_int() {
            a.as_i64().cmp(&b.as_i64())
        } else {
            crate::arith::compare(env, a, b)?
        };
        self.push(env, Value::bool(accept(ord)))
    }
}

/// Fill self-reference capture slots with the closure itself. Runs before
/// the closure value escapes, so the write is unobserved.
pub fn patch_self_captures(closure: Value, slots: &[usize]) {
    if slots.is_empty() {
        return;
    }
    let obj = ObjClosure::of(closure);
    // Safety: freshly allocated, single-threaded access until published.
    unsafe {
        let captures =
            &mut (*(obj as *const ObjClosure as *mut ObjClosure)).captures;
        for &i in slots {
            captures[i] = closure;
        }
    }
}

/// `(def f (fn ...))` names the anonymous closure after its var.
fn maybe_name_closure(v: Value, name: &str) {
    if v.heap_tag() == Some(HeapTag::Closure) {
        let obj = ObjClosure::of(v);
        if obj.name.is_none() {
            // Safety: the closure was just created and not yet shared; the
            // name is only ever written once, before publication.
            unsafe {
                let ptr = obj as *const ObjClosure as *mut ObjClosure;
                (*ptr).name = Some(name.into());
            }
        }
    }
}
