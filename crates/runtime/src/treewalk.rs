//! Tree-Walk Evaluator
//!
//! The second execution engine: interprets analyzer nodes directly. Used for
//! bootstrap (before the compiler is loaded), for parity testing against the
//! VM, and as the execution vehicle for tree-kind closures.
//!
//! Locals live in per-invocation frames registered as GC roots. Function
//! invocation uses a fixed eight-slot argument buffer (heap fallback above
//! that), and `recur` unwinds to the enclosing loop or function body through
//! the `Flow` result.

use crate::ast::{CaptureSource, FnArity, FnNode, Node};
use crate::bridge;
use crate::env::{Env, RootProvider};
use crate::error::{self, ErrorKind};
use crate::heap::{ClosureBody, ObjClosure, ObjHeader, ObjSymbol};
use crate::value::{HeapTag, Value};

struct EvalFrame {
    locals: Vec<Value>,
    closure: Value,
    recur: Vec<Value>,
}

pub struct TreeWalk {
    frames: Vec<EvalFrame>,
    poll_counter: u32,
}

impl RootProvider for TreeWalk {
    fn push_roots(&self, work: &mut Vec<Value>) {
        for frame in &self.frames {
            work.extend_from_slice(&frame.locals);
            work.extend_from_slice(&frame.recur);
            work.push(frame.closure);
        }
    }
}

/// Result of evaluating a node: a value, or a `recur` unwinding to the
/// enclosing loop/function with its arguments parked in the current frame.
enum Flow {
    Val(Value),
    Recur,
}

/// Evaluate a top-level node with `local_count` slots.
pub fn eval_top(env: &Env, node: &Node, local_count: usize) -> Result<Value, Value> {
    let mut walker = TreeWalk { frames: Vec::new(), poll_counter: 64 };
    let ptr: *const dyn RootProvider = &walker;
    let _guard = env.register_provider(ptr);
    walker.frames.push(EvalFrame {
        locals: vec![Value::NIL; local_count],
        closure: Value::NIL,
        recur: Vec::new(),
    });
    walker.eval_value(env, node)
}

/// Bridge entry: invoke a tree-kind closure.
pub fn call_closure(env: &Env, closure: Value, args: &[Value]) -> Result<Value, Value> {
    let obj = ObjClosure::of(closure);
    let ClosureBody::Tree(fn_ptr) = obj.body else {
        return Err(error::raise(env, ErrorKind::Internal, "tree call on bytecode closure"));
    };
    // Safety: the AST arena outlives every closure that points into it.
    let fn_node: &FnNode = unsafe { &*fn_ptr };
    let Some(arity) = fn_node.arity_for(args.len()) else {
        return Err(error::arity_error(env, fn_node.describe_name(), args.len()));
    };

    let mut walker = TreeWalk { frames: Vec::new(), poll_counter: 64 };
    let ptr: *const dyn RootProvider = &walker;
    let _guard = env.register_provider(ptr);

    let mut locals = vec![Value::NIL; arity.local_count as usize];
    bind_args(env, arity, args, &mut locals)?;
    walker.frames.push(EvalFrame { locals, closure, recur: Vec::new() });

    // Namespace discipline: run in the closure's defining namespace.
    let saved_ns = env.current_ns();
    if obj.ns.heap_tag() == Some(HeapTag::Symbol) {
        env.set_current_ns(&ObjSymbol::of(obj.ns).name);
    }
    let result = walker.run_fn_body(env, arity);
    env.set_current_ns(&saved_ns);
    result
}

fn bind_args(
    env: &Env,
    arity: &FnArity,
    args: &[Value],
    locals: &mut [Value],
) -> Result<(), Value> {
    let fixed = arity.params as usize;
    if arity.is_variadic {
        locals[..fixed].copy_from_slice(&args[..fixed]);
        locals[fixed] = crate::seq::list_from(env, &args[fixed..])?;
    } else {
        locals[..fixed].copy_from_slice(args);
    }
    Ok(())
}

impl TreeWalk {
    /// Function body with `recur` looping back to the parameters.
    fn run_fn_body(&mut self, env: &Env, arity: &FnArity) -> Result<Value, Value> {
        loop {
            match self.eval_body(env, &arity.body)? {
                Flow::Val(v) => return Ok(v),
                Flow::Recur => {
                    let frame = self.frames.last_mut().expect("frame");
                    let recur_args = std::mem::take(&mut frame.recur);
                    if recur_args.len() != arity.params as usize {
                        return Err(error::raise(
                            env,
                            ErrorKind::Arity,
                            format!(
                                "recur with {} args, function takes {}",
                                recur_args.len(),
                                arity.params
                            ),
                        ));
                    }
                    frame.locals[..recur_args.len()].copy_from_slice(&recur_args);
                }
            }
        }
    }

    fn eval_body(&mut self, env: &Env, body: &[Node]) -> Result<Flow, Value> {
        let mut out = Value::NIL;
        for (i, node) in body.iter().enumerate() {
            match self.eval(env, node)? {
                Flow::Val(v) => out = v,
                Flow::Recur => {
                    if i + 1 != body.len() {
                        return Err(error::raise(
                            env,
                            ErrorKind::Internal,
                            "recur from non-tail position",
                        ));
                    }
                    return Ok(Flow::Recur);
                }
            }
        }
        Ok(Flow::Val(out))
    }

    /// Evaluate where `recur` would be ill-formed.
    fn eval_value(&mut self, env: &Env, node: &Node) -> Result<Value, Value> {
        match self.eval(env, node)? {
            Flow::Val(v) => Ok(v),
            Flow::Recur => {
                Err(error::raise(env, ErrorKind::Internal, "recur from non-tail position"))
            }
        }
    }

    fn eval(&mut self, env: &Env, node: &Node) -> Result<Flow, Value> {
        // Safe-point at node entry, cheap unless a collection is pending.
        self.poll_counter -= 1;
        if self.poll_counter == 0 {
            self.poll_counter = 64;
            env.safe_point();
        } else if env.gc.poll_requested() {
            env.safe_point();
        }

        match node {
            Node::Const { value, .. } => Ok(Flow::Val(*value)),
            Node::Local { slot, .. } => {
                let frame = self.frames.last().expect("frame");
                Ok(Flow::Val(frame.locals[*slot as usize]))
            }
            Node::Captured { idx, .. } => {
                let frame = self.frames.last().expect("frame");
                let closure = ObjClosure::of(frame.closure);
                Ok(Flow::Val(closure.captures[*idx as usize]))
            }
            Node::VarRef { var, loc } => match env.var_value(var) {
                Some(v) => Ok(Flow::Val(v)),
                None => Err(error::raise(
                    env,
                    ErrorKind::Name,
                    format!("unable to resolve var: {} at {loc}", var.qualified()),
                )),
            },
            Node::TheVar { var, .. } => {
                Ok(Flow::Val(Value::heap(HeapTag::VarRef, *var as *const _ as *const u8)))
            }
            Node::Do { body, .. } => self.eval_body(env, body),
            Node::If { test, then, els, .. } => {
                if self.eval_value(env, test)?.is_truthy() {
                    self.eval(env, then)
                } else {
                    match els {
                        Some(e) => self.eval(env, e),
                        None => Ok(Flow::Val(Value::NIL)),
                    }
                }
            }
            Node::Let { bindings, body, .. } => {
                for binding in bindings {
                    let v = self.eval_value(env, &binding.init)?;
                    let frame = self.frames.last_mut().expect("frame");
                    frame.locals[binding.slot as usize] = v;
                }
                self.eval_body(env, body)
            }
            Node::Loop { bindings, body, .. } => {
                for binding in bindings {
                    let v = self.eval_value(env, &binding.init)?;
                    let frame = self.frames.last_mut().expect("frame");
                    frame.locals[binding.slot as usize] = v;
                }
                loop {
                    match self.eval_body(env, body)? {
                        Flow::Val(v) => return Ok(Flow::Val(v)),
                        Flow::Recur => {
                            let frame = self.frames.last_mut().expect("frame");
                            let recur_args = std::mem::take(&mut frame.recur);
                            if recur_args.len() != bindings.len() {
                                return Err(error::raise(
                                    env,
                                    ErrorKind::Arity,
                                    format!(
                                        "recur with {} args, loop binds {}",
                                        recur_args.len(),
                                        bindings.len()
                                    ),
                                ));
                            }
                            let frame = self.frames.last_mut().expect("frame");
                            for (binding, v) in bindings.iter().zip(recur_args) {
                                frame.locals[binding.slot as usize] = v;
                            }
                        }
                    }
                }
            }
            Node::Recur { args, .. } => {
                self.frames.last_mut().expect("frame").recur.clear();
                for arg in args {
                    let v = self.eval_value(env, arg)?;
                    // Parked in the frame immediately so the next eval can't
                    // collect it.
                    self.frames.last_mut().expect("frame").recur.push(v);
                }
                Ok(Flow::Recur)
            }
            Node::Fn(fn_node) => Ok(Flow::Val(self.make_closure(env, fn_node)?)),
            Node::Def { var, init, dynamic, .. } => {
                if *dynamic {
                    var.dynamic.store(true, std::sync::atomic::Ordering::Release);
                }
                if let Some(init) = init {
                    let v = self.eval_value(env, init)?;
                    name_closure(v, &var.name);
                    var.set_root(v);
                }
                Ok(Flow::Val(Value::heap(HeapTag::VarRef, *var as *const _ as *const u8)))
            }
            Node::Binding { pairs, body, .. } => {
                let scope = env.roots();
                let mut bound = Vec::with_capacity(pairs.len());
                for (var, init) in pairs {
                    if !var.is_dynamic() {
                        return Err(error::raise(
                            env,
                            ErrorKind::IllegalState,
                            format!("cannot bind non-dynamic var: {}", var.qualified()),
                        ));
                    }
                    let v = scope.keep(self.eval_value(env, init)?);
                    bound.push((*var, v));
                }
                env.bindings.push(bound);
                let result = self.eval_body(env, body);
                if env.bindings.pop().is_err() {
                    return Err(error::raise(env, ErrorKind::Internal, "unbalanced binding pop"));
                }
                result
            }
            Node::Try { body, catches, finally, .. } => {
                let mut outcome = match self.eval_body(env, body) {
                    Ok(Flow::Val(v)) => Ok(v),
                    Ok(Flow::Recur) => {
                        return Err(error::raise(
                            env,
                            ErrorKind::Internal,
                            "recur across try boundary",
                        ));
                    }
                    Err(exc) => {
                        let scope = env.roots();
                        scope.keep(exc);
                        let mut handled = None;
                        for clause in catches {
                            if error::catch_matches(env, clause.kind, exc) {
                                let frame = self.frames.last_mut().expect("frame");
                                frame.locals[clause.slot as usize] = exc;
                                handled = Some(match self.eval_body(env, &clause.body)? {
                                    Flow::Val(v) => v,
                                    Flow::Recur => {
                                        return Err(error::raise(
                                            env,
                                            ErrorKind::Internal,
                                            "recur across catch boundary",
                                        ));
                                    }
                                });
                                break;
                            }
                        }
                        match handled {
                            Some(v) => Ok(v),
                            None => Err(exc),
                        }
                    }
                };
                if let Some(finally_body) = finally {
                    let scope = env.roots();
                    if let Ok(v) = &outcome {
                        scope.keep(*v);
                    }
                    // An exception in finally replaces the in-flight result.
                    match self.eval_body(env, finally_body) {
                        Ok(_) => {}
                        Err(exc) => outcome = Err(exc),
                    }
                }
                outcome.map(Flow::Val)
            }
            Node::Throw { exc, .. } => {
                let v = self.eval_value(env, exc)?;
                Err(v)
            }
            Node::Invoke { f, args, .. } => {
                let scope = env.roots();
                let callee = scope.keep(self.eval_value(env, f)?);
                // Fixed buffer for the common arities, heap above eight.
                let mut buf = [Value::NIL; 8];
                let result = if args.len() <= buf.len() {
                    for (i, arg) in args.iter().enumerate() {
                        buf[i] = scope.keep(self.eval_value(env, arg)?);
                    }
                    bridge::call_fn(env, callee, &buf[..args.len()])?
                } else {
                    let mut heap_args = Vec::with_capacity(args.len());
                    for arg in args {
                        heap_args.push(scope.keep(self.eval_value(env, arg)?));
                    }
                    bridge::call_fn(env, callee, &heap_args)?
                };
                Ok(Flow::Val(result))
            }
            Node::VectorLit { items, .. } => {
                let scope = env.roots();
                let mut vals = Vec::with_capacity(items.len());
                for item in items {
                    vals.push(scope.keep(self.eval_value(env, item)?));
                }
                Ok(Flow::Val(env.alloc(crate::heap::ObjVector::new(vals))?))
            }
            Node::MapLit { pairs, .. } => {
                let scope = env.roots();
                let mut vals = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let k = scope.keep(self.eval_value(env, k)?);
                    let v = scope.keep(self.eval_value(env, v)?);
                    vals.push((k, v));
                }
                Ok(Flow::Val(crate::collections::map_literal(env, &vals)?))
            }
            Node::SetLit { items, .. } => {
                let scope = env.roots();
                let mut vals = Vec::with_capacity(items.len());
                for item in items {
                    vals.push(scope.keep(self.eval_value(env, item)?));
                }
                Ok(Flow::Val(crate::collections::set_literal(env, &vals)?))
            }
            Node::Case { expr, clauses, default, .. } => {
                let v = self.eval_value(env, expr)?;
                for clause in clauses {
                    if crate::eq::equiv(env, v, clause.head)? {
                        return self.eval(env, &clause.body);
                    }
                }
                match default {
                    Some(d) => self.eval(env, d),
                    None => {
                        let repr = crate::printer::pr_str(env, v)?;
                        Err(error::raise(
                            env,
                            ErrorKind::Value,
                            format!("no matching clause: {repr}"),
                        ))
                    }
                }
            }
            Node::DefProtocol { var, name, methods, .. } => {
                let protocol = crate::protocols::install_protocol(env, var, *name, methods)?;
                Ok(Flow::Val(protocol))
            }
            Node::ExtendType { protocol, type_key, methods, .. } => {
                let scope = env.roots();
                let proto_v = scope.keep(self.eval_value(env, protocol)?);
                let mut impls = Vec::with_capacity(methods.len());
                for method in methods {
                    let f = scope.keep(self.make_closure(env, &method.fun)?);
                    impls.push((method.name.clone(), f));
                }
                crate::protocols::extend_protocol(env, proto_v, *type_key, impls)?;
                Ok(Flow::Val(Value::NIL))
            }
            Node::DefMulti { var, name, dispatch, .. } => {
                let dispatch_fn = self.eval_value(env, dispatch)?;
                let mm = crate::multimethods::install_multimethod(env, var, *name, dispatch_fn)?;
                Ok(Flow::Val(mm))
            }
            Node::DefMethod { multi, dispatch_val, fun, .. } => {
                let scope = env.roots();
                let mm = scope.keep(self.eval_value(env, multi)?);
                let dv = scope.keep(self.eval_value(env, dispatch_val)?);
                let f = scope.keep(self.make_closure(env, fun)?);
                crate::multimethods::add_method(env, mm, dv, f)?;
                Ok(Flow::Val(mm))
            }
        }
    }

    /// Build a tree-kind closure, copying captures out of the current frame.
    fn make_closure(&mut self, env: &Env, fn_node: &FnNode) -> Result<Value, Value> {
        let frame = self.frames.last().expect("frame");
        let mut captures = Vec::with_capacity(fn_node.captures.len());
        let mut self_slots = Vec::new();
        for (i, source) in fn_node.captures.iter().enumerate() {
            captures.push(match source {
                CaptureSource::Local(slot) => frame.locals[*slot as usize],
                CaptureSource::Capture(idx) => {
                    ObjClosure::of(frame.closure).captures[*idx as usize]
                }
                CaptureSource::SelfRef => {
                    self_slots.push(i);
                    Value::NIL
                }
            });
        }
        let ns = env.symbol(&env.current_ns());
        let closure = env.alloc(ObjClosure {
            hdr: ObjHeader::new(HeapTag::Closure),
            body: ClosureBody::Tree(fn_node as *const FnNode),
            captures: captures.into_boxed_slice(),
            ns,
            name: fn_node.name.clone(),
            meta: Value::NIL,
        })?;
        crate::vm::patch_self_captures(closure, &self_slots);
        Ok(closure)
    }
}

fn name_closure(v: Value, name: &str) {
    if v.heap_tag() == Some(HeapTag::Closure) {
        let obj = ObjClosure::of(v);
        if obj.name.is_none() {
            // Safety: freshly created, not yet shared.
            unsafe {
                let ptr = obj as *const ObjClosure as *mut ObjClosure;
                (*ptr).name = Some(name.into());
            }
        }
    }
}
