//! Analyzer: forms → nodes
//!
//! Resolves symbols (locals, then captures through enclosing functions, then
//! vars), assigns flat per-function local slots, records capture layouts,
//! validates `recur` arity and tail position, and lowers the sugar forms
//! (`defn`, `when`, `and`/`or`, `cond`, `dotimes`, single-binding `for`,
//! `lazy-seq`, `delay`, `future`, `with-out-str`) onto the core node set.
//! The full macro system lives outside this crate; these lowerings are the
//! fixed, built-in subset.

use crate::CompilerError;
use crate::form::Form;
use lyra_runtime::ast::{
    CaptureSource, CaseClause, CatchClause, ExtendMethod, FnArity, FnNode, LetBinding, Node,
};
use lyra_runtime::env::{CORE_NS, Env};
use lyra_runtime::error::Phase;
use lyra_runtime::heap::{ObjArrayMap, ObjCons, ObjHeader, ObjRegex, ObjStr, ObjVector, Var};
use lyra_runtime::protocols::TypeKey;
use lyra_runtime::{ErrorKind, HeapTag, Loc, Value};

fn err(kind: ErrorKind, loc: Loc, msg: impl Into<String>) -> CompilerError {
    CompilerError::new(kind, Phase::Analysis, loc, msg)
}

enum Resolved {
    Local(u16),
    Captured(u16),
}

struct FnScope {
    /// Lexical stack of visible locals; truncated when a `let` body ends.
    locals: Vec<(String, u16)>,
    next_slot: u16,
    /// High-water mark for the arity currently being analyzed.
    arity_max: u16,
    captures: Vec<(CaptureSource, Box<str>)>,
    /// Innermost-last stack of recur target arities.
    loop_args: Vec<usize>,
    /// Name a named `fn` binds to itself inside its own body.
    self_name: Option<String>,
}

impl FnScope {
    fn new(self_name: Option<String>) -> FnScope {
        FnScope {
            locals: Vec::new(),
            next_slot: 0,
            arity_max: 0,
            captures: Vec::new(),
            loop_args: Vec::new(),
            self_name,
        }
    }

    fn alloc_slot(&mut self, name: &str) -> u16 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.arity_max = self.arity_max.max(self.next_slot);
        self.locals.push((name.to_string(), slot));
        slot
    }
}

pub struct Analyzer<'e> {
    env: &'e Env,
    fns: Vec<FnScope>,
}

/// Analyze one top-level form. Returns the retained node and the top-level
/// local slot count.
pub fn analyze_top(env: &Env, form: &Form) -> Result<(&'static Node, u16), CompilerError> {
    let mut analyzer = Analyzer { env, fns: vec![FnScope::new(None)] };
    let node = analyzer.analyze(form, true)?;
    let local_count = analyzer.fns[0].arity_max;
    Ok((env.ast.keep(node), local_count))
}

impl<'e> Analyzer<'e> {
    // =========================================================================
    // Symbol resolution
    // =========================================================================

    fn resolve_in(&mut self, fn_idx: usize, name: &str) -> Option<Resolved> {
        if let Some((_, slot)) =
            self.fns[fn_idx].locals.iter().rev().find(|(n, _)| n == name)
        {
            return Some(Resolved::Local(*slot));
        }
        if let Some(idx) =
            self.fns[fn_idx].captures.iter().position(|(_, n)| n.as_ref() == name)
        {
            return Some(Resolved::Captured(idx as u16));
        }
        if self.fns[fn_idx].self_name.as_deref() == Some(name) {
            let idx = self.fns[fn_idx].captures.len() as u16;
            self.fns[fn_idx].captures.push((CaptureSource::SelfRef, name.into()));
            return Some(Resolved::Captured(idx));
        }
        if fn_idx == 0 {
            return None;
        }
        match self.resolve_in(fn_idx - 1, name)? {
            Resolved::Local(slot) => {
                let idx = self.fns[fn_idx].captures.len() as u16;
                self.fns[fn_idx].captures.push((CaptureSource::Local(slot), name.into()));
                Some(Resolved::Captured(idx))
            }
            Resolved::Captured(outer_idx) => {
                let idx = self.fns[fn_idx].captures.len() as u16;
                self.fns[fn_idx]
                    .captures
                    .push((CaptureSource::Capture(outer_idx), name.into()));
                Some(Resolved::Captured(idx))
            }
        }
    }

    fn resolve_symbol(&mut self, name: &str, loc: Loc) -> Result<Node, CompilerError> {
        let top = self.fns.len() - 1;
        if !name.contains('/') || name == "/" {
            match self.resolve_in(top, name) {
                Some(Resolved::Local(slot)) => {
                    return Ok(Node::Local { slot, name: name.into(), loc });
                }
                Some(Resolved::Captured(idx)) => {
                    return Ok(Node::Captured { idx, name: name.into(), loc });
                }
                None => {}
            }
        }
        let (ns, bare) = split_symbol(name);
        match self.env.resolve_var(ns, bare) {
            Some(var) => Ok(Node::VarRef { var, loc }),
            None => Err(err(
                ErrorKind::Name,
                loc,
                format!("unable to resolve symbol: {name} in this context"),
            )),
        }
    }

    fn core_var(&self, name: &str, loc: Loc) -> Result<Node, CompilerError> {
        match self.env.resolve_var(Some(CORE_NS), name) {
            Some(var) => Ok(Node::VarRef { var, loc }),
            None => Err(err(ErrorKind::Internal, loc, format!("core function {name} missing"))),
        }
    }

    fn core_invoke(&self, name: &str, args: Vec<Node>, loc: Loc) -> Result<Node, CompilerError> {
        Ok(Node::Invoke { f: Box::new(self.core_var(name, loc)?), args, loc })
    }

    // =========================================================================
    // Main dispatch
    // =========================================================================

    fn analyze(&mut self, form: &Form, tail: bool) -> Result<Node, CompilerError> {
        let loc = form.loc();
        match form {
            Form::Nil(_) => Ok(Node::Const { value: Value::NIL, loc }),
            Form::Bool(b, _) => Ok(Node::Const { value: Value::bool(*b), loc }),
            Form::Int(n, _) => Ok(Node::Const { value: Value::from_i64(*n), loc }),
            Form::Float(f, _) => Ok(Node::Const { value: Value::float(*f), loc }),
            Form::Char(c, _) => Ok(Node::Const { value: Value::char(*c), loc }),
            Form::Str(s, _) => {
                let v = self.env.interned.alloc_permanent(ObjStr::new(s.clone()));
                Ok(Node::Const { value: v, loc })
            }
            Form::Keyword(k, _) => {
                Ok(Node::Const { value: self.env.interned.keyword_from(k), loc })
            }
            Form::Regex(src, _) => {
                let compiled = regex::Regex::new(src)
                    .map_err(|e| err(ErrorKind::Syntax, loc, format!("bad regex literal: {e}")))?;
                let v = self.env.interned.alloc_permanent(ObjRegex {
                    hdr: ObjHeader::permanent(HeapTag::Regex),
                    source: src.clone().into(),
                    compiled,
                });
                Ok(Node::Const { value: v, loc })
            }
            Form::Sym(name, _) => self.resolve_symbol(name, loc),
            Form::Quote(inner, _) => {
                Ok(Node::Const { value: self.quote_value(inner)?, loc })
            }
            Form::Vector(items, _) => {
                let mut nodes = Vec::with_capacity(items.len());
                for item in items {
                    nodes.push(self.analyze(item, false)?);
                }
                Ok(Node::VectorLit { items: nodes, loc })
            }
            Form::Map(pairs, _) => {
                let mut nodes = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    nodes.push((self.analyze(k, false)?, self.analyze(v, false)?));
                }
                Ok(Node::MapLit { pairs: nodes, loc })
            }
            Form::Set(items, _) => {
                let mut nodes = Vec::with_capacity(items.len());
                for item in items {
                    nodes.push(self.analyze(item, false)?);
                }
                Ok(Node::SetLit { items: nodes, loc })
            }
            Form::List(items, _) => self.analyze_list(items, loc, tail),
        }
    }

    fn analyze_list(
        &mut self,
        items: &[Form],
        loc: Loc,
        tail: bool,
    ) -> Result<Node, CompilerError> {
        let Some(head) = items.first() else {
            // () evaluates to the empty list.
            return Ok(Node::Const { value: self.env.empty_list, loc });
        };
        if let Some(name) = head.as_sym() {
            // A local shadows a special form for everything except the
            // unforgeable core (if/def/fn/...), mirroring upstream.
            let shadowed = self.is_local(name);
            if !shadowed || UNSHADOWABLE.contains(&name) {
                if let Some(node) = self.analyze_special(name, items, loc, tail)? {
                    return Ok(node);
                }
            }
        }
        let f = self.analyze(head, false)?;
        let mut args = Vec::with_capacity(items.len() - 1);
        for arg in &items[1..] {
            args.push(self.analyze(arg, false)?);
        }
        Ok(Node::Invoke { f: Box::new(f), args, loc })
    }

    fn is_local(&mut self, name: &str) -> bool {
        let top = self.fns.len() - 1;
        self.fns[top].locals.iter().any(|(n, _)| n == name)
    }

    // =========================================================================
    // Special forms
    // =========================================================================

    #[allow(clippy::too_many_lines)]
    fn analyze_special(
        &mut self,
        name: &str,
        items: &[Form],
        loc: Loc,
        tail: bool,
    ) -> Result<Option<Node>, CompilerError> {
        let args = &items[1..];
        let node = match name {
            "quote" => {
                expect_args(name, args, 1, loc)?;
                Some(Node::Const { value: self.quote_value(&args[0])?, loc })
            }
            "if" | "if-not" => {
                if args.len() < 2 || args.len() > 3 {
                    return Err(err(ErrorKind::Value, loc, "if expects 2 or 3 forms"));
                }
                let mut test = self.analyze(&args[0], false)?;
                if name == "if-not" {
                    test = self.core_invoke("not", vec![test], loc)?;
                }
                let then = self.analyze(&args[1], tail)?;
                let els = match args.get(2) {
                    Some(e) => Some(Box::new(self.analyze(e, tail)?)),
                    None => None,
                };
                Some(Node::If { test: Box::new(test), then: Box::new(then), els, loc })
            }
            "do" => Some(Node::Do { body: self.analyze_body(args, tail)?, loc }),
            "when" | "when-not" => {
                expect_min(name, args, 1, loc)?;
                let mut test = self.analyze(&args[0], false)?;
                if name == "when-not" {
                    test = self.core_invoke("not", vec![test], loc)?;
                }
                let body = Node::Do { body: self.analyze_body(&args[1..], tail)?, loc };
                Some(Node::If { test: Box::new(test), then: Box::new(body), els: None, loc })
            }
            "and" => Some(self.analyze_and_or(args, loc, true)?),
            "or" => Some(self.analyze_and_or(args, loc, false)?),
            "cond" => {
                if args.len() % 2 != 0 {
                    return Err(err(ErrorKind::Value, loc, "cond expects test/result pairs"));
                }
                let mut node = Node::Const { value: Value::NIL, loc };
                for pair in args.chunks(2).rev() {
                    let test = self.analyze(&pair[0], false)?;
                    let result = self.analyze(&pair[1], tail)?;
                    node = Node::If {
                        test: Box::new(test),
                        then: Box::new(result),
                        els: Some(Box::new(node)),
                        loc,
                    };
                }
                Some(node)
            }
            "let" | "let*" => Some(self.analyze_let(args, loc, tail, false)?),
            "loop" | "loop*" => Some(self.analyze_let(args, loc, tail, true)?),
            "recur" => {
                let expected = {
                    let scope = self.fns.last().expect("fn scope");
                    *scope.loop_args.last().ok_or_else(|| {
                        err(ErrorKind::Value, loc, "recur outside loop or function body")
                    })?
                };
                if !tail {
                    return Err(err(ErrorKind::Value, loc, "can only recur from tail position"));
                }
                if args.len() != expected {
                    return Err(err(
                        ErrorKind::Arity,
                        loc,
                        format!("recur with {} args, target takes {expected}", args.len()),
                    ));
                }
                let mut arg_nodes = Vec::with_capacity(args.len());
                for a in args {
                    arg_nodes.push(self.analyze(a, false)?);
                }
                Some(Node::Recur { args: arg_nodes, loc })
            }
            "fn" | "fn*" => Some(Node::Fn(self.analyze_fn(args, loc, None)?)),
            "def" => Some(self.analyze_def(args, loc)?),
            "defn" => {
                expect_min(name, args, 2, loc)?;
                let fn_name = sym_name(&args[0], loc)?;
                let fun = self.analyze_fn(&args[1..], loc, Some(fn_name.to_string()))?;
                let var = self.intern_current(fn_name);
                Some(Node::Def {
                    var,
                    init: Some(Box::new(Node::Fn(fun))),
                    dynamic: is_earmuffed(fn_name),
                    loc,
                })
            }
            "declare" => {
                for a in args {
                    let n = sym_name(a, loc)?;
                    self.intern_current(n);
                }
                Some(Node::Const { value: Value::NIL, loc })
            }
            "var" => {
                expect_args(name, args, 1, loc)?;
                let n = sym_name(&args[0], loc)?;
                let (ns, bare) = split_symbol(n);
                let var = self.env.resolve_var(ns, bare).ok_or_else(|| {
                    err(ErrorKind::Name, loc, format!("unable to resolve var: {n}"))
                })?;
                Some(Node::TheVar { var, loc })
            }
            "binding" => {
                expect_min(name, args, 1, loc)?;
                let Form::Vector(bindings, _) = &args[0] else {
                    return Err(err(ErrorKind::Value, loc, "binding expects a vector"));
                };
                if bindings.len() % 2 != 0 {
                    return Err(err(ErrorKind::Value, loc, "binding expects var/value pairs"));
                }
                let mut pairs = Vec::with_capacity(bindings.len() / 2);
                for pair in bindings.chunks(2) {
                    let n = sym_name(&pair[0], loc)?;
                    let (ns, bare) = split_symbol(n);
                    let var = self.env.resolve_var(ns, bare).ok_or_else(|| {
                        err(ErrorKind::Name, loc, format!("unable to resolve var: {n}"))
                    })?;
                    pairs.push((var, self.analyze(&pair[1], false)?));
                }
                Some(Node::Binding { pairs, body: self.analyze_body(&args[1..], false)?, loc })
            }
            "try" => Some(self.analyze_try(args, loc)?),
            "throw" => {
                expect_args(name, args, 1, loc)?;
                Some(Node::Throw { exc: Box::new(self.analyze(&args[0], false)?), loc })
            }
            "case" | "case*" => Some(self.analyze_case(args, loc, tail)?),
            "defprotocol" => Some(self.analyze_defprotocol(args, loc)?),
            "extend-type" => Some(self.analyze_extend_type(args, loc)?),
            "extend-protocol" => Some(self.analyze_extend_protocol(args, loc)?),
            "defmulti" => {
                expect_args(name, args, 2, loc)?;
                let mname = sym_name(&args[0], loc)?;
                let var = self.intern_current(mname);
                let dispatch = self.analyze(&args[1], false)?;
                Some(Node::DefMulti {
                    var,
                    name: self.env.interned.symbol(None, mname),
                    dispatch: Box::new(dispatch),
                    loc,
                })
            }
            "defmethod" => {
                expect_min(name, args, 3, loc)?;
                let mname = sym_name(&args[0], loc)?;
                let multi = self.resolve_symbol(mname, loc)?;
                let dispatch_val = self.analyze(&args[1], false)?;
                let fun = self.analyze_fn(&args[2..], loc, Some(format!("{mname}-method")))?;
                Some(Node::DefMethod {
                    multi: Box::new(multi),
                    dispatch_val: Box::new(dispatch_val),
                    fun,
                    loc,
                })
            }
            "dotimes" => Some(self.analyze_dotimes(args, loc)?),
            "for" => Some(self.analyze_for(args, loc)?),
            "doseq" => {
                // (doseq [x coll] body) = (dorun (for [x coll] body))
                let mapped = self.analyze_for(args, loc)?;
                Some(self.core_invoke("dorun", vec![mapped], loc)?)
            }
            "lazy-seq" => Some(self.thunk_call("lazy-seq*", args, loc)?),
            "delay" => Some(self.thunk_call("delay*", args, loc)?),
            "future" => Some(self.thunk_call("future*", args, loc)?),
            "with-out-str" => Some(self.thunk_call("with-out-str*", args, loc)?),
            "dosync" => {
                // STM is out of scope: dosync is a sequential wrapper.
                Some(Node::Do { body: self.analyze_body(args, tail)?, loc })
            }
            "ns" => {
                expect_min(name, args, 1, loc)?;
                let n = sym_name(&args[0], loc)?;
                self.env.ensure_namespace(n);
                let sym = self.env.interned.symbol(None, n);
                Some(self.core_invoke(
                    "in-ns",
                    vec![Node::Const { value: sym, loc }],
                    loc,
                )?)
            }
            "comment" => Some(Node::Const { value: Value::NIL, loc }),
            _ => None,
        };
        Ok(node)
    }

    fn analyze_body(&mut self, forms: &[Form], tail: bool) -> Result<Vec<Node>, CompilerError> {
        let mut body = Vec::with_capacity(forms.len());
        for (i, form) in forms.iter().enumerate() {
            let is_last = i + 1 == forms.len();
            body.push(self.analyze(form, tail && is_last)?);
        }
        Ok(body)
    }

    fn analyze_and_or(
        &mut self,
        args: &[Form],
        loc: Loc,
        is_and: bool,
    ) -> Result<Node, CompilerError> {
        match args {
            [] => Ok(Node::Const { value: if is_and { Value::TRUE } else { Value::NIL }, loc }),
            [x] => self.analyze(x, false),
            [x, rest @ ..] => {
                let first = self.analyze(x, false)?;
                let scope = self.fns.last_mut().expect("fn scope");
                let slot = scope.alloc_slot("__and_or");
                let rest_node = self.analyze_and_or(rest, loc, is_and)?;
                // Binding stays allocated; the shadow entry is popped so the
                // synthetic name never resolves.
                let scope = self.fns.last_mut().expect("fn scope");
                scope.locals.pop();
                let test = Node::Local { slot, name: "__and_or".into(), loc };
                let result = Node::Local { slot, name: "__and_or".into(), loc };
                let (then, els) = if is_and {
                    (rest_node, result)
                } else {
                    (result, rest_node)
                };
                Ok(Node::Let {
                    bindings: vec![LetBinding { slot, name: "__and_or".into(), init: first }],
                    body: vec![Node::If {
                        test: Box::new(test),
                        then: Box::new(then),
                        els: Some(Box::new(els)),
                        loc,
                    }],
                    loc,
                })
            }
        }
    }

    fn analyze_let(
        &mut self,
        args: &[Form],
        loc: Loc,
        tail: bool,
        is_loop: bool,
    ) -> Result<Node, CompilerError> {
        let Some(Form::Vector(bindings, _)) = args.first() else {
            return Err(err(ErrorKind::Value, loc, "let expects a binding vector"));
        };
        if bindings.len() % 2 != 0 {
            return Err(err(ErrorKind::Value, loc, "invalid binding form: odd binding vector"));
        }
        let lexical_base = self.fns.last().expect("fn scope").locals.len();
        // Reserve a contiguous slot block up front: recur stores its
        // arguments as one run, and an init expression may allocate slots of
        // its own (nested let) that must land past the block.
        let n_bindings = bindings.len() / 2;
        let block_base = {
            let scope = self.fns.last_mut().expect("fn scope");
            let base = scope.next_slot;
            scope.next_slot += n_bindings as u16;
            scope.arity_max = scope.arity_max.max(scope.next_slot);
            base
        };
        let mut let_bindings = Vec::with_capacity(n_bindings);
        for (k, pair) in bindings.chunks(2).enumerate() {
            let n = sym_name(&pair[0], loc)?;
            let init = self.analyze(&pair[1], false)?;
            let slot = block_base + k as u16;
            // The name becomes visible only after its own init.
            self.fns.last_mut().expect("fn scope").locals.push((n.to_string(), slot));
            let_bindings.push(LetBinding { slot, name: n.into(), init });
        }
        if is_loop {
            let count = let_bindings.len();
            self.fns.last_mut().expect("fn scope").loop_args.push(count);
        }
        let body = self.analyze_body(&args[1..], tail || is_loop)?;
        let scope = self.fns.last_mut().expect("fn scope");
        if is_loop {
            scope.loop_args.pop();
        }
        scope.locals.truncate(lexical_base);
        Ok(if is_loop {
            Node::Loop { bindings: let_bindings, body, loc }
        } else {
            Node::Let { bindings: let_bindings, body, loc }
        })
    }

    fn analyze_try(&mut self, args: &[Form], loc: Loc) -> Result<Node, CompilerError> {
        let mut body = Vec::new();
        let mut catches = Vec::new();
        let mut finally = None;
        for form in args {
            if let Form::List(items, floc) = form {
                match items.first().and_then(Form::as_sym) {
                    Some("catch") => {
                        if items.len() < 3 {
                            return Err(err(
                                ErrorKind::Value,
                                *floc,
                                "catch expects a kind and a binding",
                            ));
                        }
                        let kind = match &items[1] {
                            Form::Keyword(k, _) => self.env.interned.keyword_from(k),
                            Form::Sym(s, _) => self.env.interned.keyword(None, s),
                            _ => {
                                return Err(err(
                                    ErrorKind::Value,
                                    *floc,
                                    "catch kind must be a keyword or symbol",
                                ));
                            }
                        };
                        let bind_name = sym_name(&items[2], *floc)?;
                        let lexical_base =
                            self.fns.last().expect("fn scope").locals.len();
                        let slot = self
                            .fns
                            .last_mut()
                            .expect("fn scope")
                            .alloc_slot(bind_name);
                        let cbody = self.analyze_body(&items[3..], false)?;
                        self.fns.last_mut().expect("fn scope").locals.truncate(lexical_base);
                        catches.push(CatchClause {
                            kind,
                            slot,
                            name: bind_name.into(),
                            body: cbody,
                        });
                        continue;
                    }
                    Some("finally") => {
                        finally = Some(self.analyze_body(&items[1..], false)?);
                        continue;
                    }
                    _ => {}
                }
            }
            if !catches.is_empty() || finally.is_some() {
                return Err(err(
                    ErrorKind::Value,
                    form.loc(),
                    "try body forms must precede catch/finally",
                ));
            }
            body.push(self.analyze(form, false)?);
        }
        Ok(Node::Try { body, catches, finally, loc })
    }

    fn analyze_case(
        &mut self,
        args: &[Form],
        loc: Loc,
        tail: bool,
    ) -> Result<Node, CompilerError> {
        expect_min("case", args, 1, loc)?;
        let expr = self.analyze(&args[0], false)?;
        let rest = &args[1..];
        let (pairs, default) = if rest.len() % 2 == 1 {
            (&rest[..rest.len() - 1], Some(&rest[rest.len() - 1]))
        } else {
            (rest, None)
        };
        let mut clauses = Vec::with_capacity(pairs.len() / 2);
        for pair in pairs.chunks(2) {
            let head = self.quote_value(&pair[0])?;
            let hash = lyra_runtime::hashing::hash_value(self.env, head)
                .map_err(|_| err(ErrorKind::Internal, loc, "unhashable case head"))?;
            let body = self.analyze(&pair[1], tail)?;
            clauses.push(CaseClause { head, hash, body });
        }
        let default = match default {
            Some(d) => Some(Box::new(self.analyze(d, tail)?)),
            None => None,
        };
        Ok(Node::Case { expr: Box::new(expr), clauses, default, loc })
    }

    fn analyze_def(&mut self, args: &[Form], loc: Loc) -> Result<Node, CompilerError> {
        expect_min("def", args, 1, loc)?;
        let n = sym_name(&args[0], loc)?;
        let var = self.intern_current(n);
        let init = match args.get(1) {
            Some(form) => Some(Box::new(self.analyze(form, false)?)),
            None => None,
        };
        Ok(Node::Def { var, init, dynamic: is_earmuffed(n), loc })
    }

    fn intern_current(&self, name: &str) -> &'static Var {
        let ns = self.env.current_ns();
        self.env.intern_var(&ns, name)
    }

    /// Parse `(params...) body` arities: either a single `[params] body...`
    /// or a series of `([params] body...)` lists.
    fn analyze_fn(
        &mut self,
        args: &[Form],
        loc: Loc,
        outer_name: Option<String>,
    ) -> Result<FnNode, CompilerError> {
        let (self_name, rest) = match args.first() {
            Some(Form::Sym(n, _)) => (Some(n.clone()), &args[1..]),
            _ => (outer_name.clone(), args),
        };
        if rest.is_empty() {
            return Err(err(ErrorKind::Value, loc, "fn requires a parameter vector"));
        }

        self.fns.push(FnScope::new(self_name.clone()));

        let arity_groups: Vec<(&Form, &[Form])> = match &rest[0] {
            Form::Vector(..) => vec![(&rest[0], &rest[1..])],
            Form::List(..) => {
                let mut groups = Vec::new();
                for arity_form in rest {
                    let Form::List(items, aloc) = arity_form else {
                        self.fns.pop();
                        return Err(err(ErrorKind::Value, loc, "malformed fn arity"));
                    };
                    let Some(params @ Form::Vector(..)) = items.first() else {
                        self.fns.pop();
                        return Err(err(
                            ErrorKind::Value,
                            *aloc,
                            "fn arity requires a parameter vector",
                        ));
                    };
                    groups.push((params, &items[1..]));
                }
                groups
            }
            _ => {
                self.fns.pop();
                return Err(err(ErrorKind::Value, loc, "fn requires a parameter vector"));
            }
        };

        let mut arities = Vec::with_capacity(arity_groups.len());
        for (params_form, body_forms) in arity_groups {
            let outcome = self.analyze_arity(params_form, body_forms, loc);
            match outcome {
                Ok(arity) => arities.push(arity),
                Err(e) => {
                    self.fns.pop();
                    return Err(e);
                }
            }
        }

        let scope = self.fns.pop().expect("fn scope");
        let (captures, capture_names): (Vec<_>, Vec<_>) = scope.captures.into_iter().unzip();
        Ok(FnNode {
            name: self_name.map(Into::into),
            arities,
            captures,
            capture_names,
            loc,
        })
    }

    fn analyze_arity(
        &mut self,
        params_form: &Form,
        body_forms: &[Form],
        loc: Loc,
    ) -> Result<FnArity, CompilerError> {
        let Form::Vector(params, _) = params_form else {
            return Err(err(ErrorKind::Value, loc, "fn requires a parameter vector"));
        };
        // Fresh slot numbering per arity; captures persist on the scope.
        {
            let scope = self.fns.last_mut().expect("fn scope");
            scope.locals.clear();
            scope.next_slot = 0;
            scope.arity_max = 0;
        }
        let mut fixed: u16 = 0;
        let mut variadic = false;
        let mut saw_amp = false;
        for p in params {
            let n = sym_name(p, loc)?;
            if n == "&" {
                if saw_amp {
                    return Err(err(ErrorKind::Value, loc, "invalid binding form: two &"));
                }
                saw_amp = true;
                continue;
            }
            let scope = self.fns.last_mut().expect("fn scope");
            scope.alloc_slot(n);
            if saw_amp {
                if variadic {
                    return Err(err(
                        ErrorKind::Value,
                        loc,
                        "invalid binding form: multiple rest params",
                    ));
                }
                variadic = true;
            } else {
                fixed += 1;
            }
        }
        if saw_amp && !variadic {
            return Err(err(ErrorKind::Value, loc, "invalid binding form: & without name"));
        }
        {
            let scope = self.fns.last_mut().expect("fn scope");
            scope.loop_args.push(fixed as usize + variadic as usize);
        }
        let body = self.analyze_body(body_forms, true)?;
        let scope = self.fns.last_mut().expect("fn scope");
        scope.loop_args.pop();
        Ok(FnArity { params: fixed, is_variadic: variadic, local_count: scope.arity_max, body })
    }

    fn analyze_defprotocol(&mut self, args: &[Form], loc: Loc) -> Result<Node, CompilerError> {
        expect_min("defprotocol", args, 1, loc)?;
        let pname = sym_name(&args[0], loc)?;
        let var = self.intern_current(pname);
        let mut methods = Vec::new();
        for sig in &args[1..] {
            let Form::List(items, sloc) = sig else {
                return Err(err(ErrorKind::Value, loc, "protocol method must be a signature"));
            };
            let mname = items.first().and_then(Form::as_sym).ok_or_else(|| {
                err(ErrorKind::Value, *sloc, "protocol method needs a name")
            })?;
            methods.push(self.env.interned.symbol(None, mname));
        }
        Ok(Node::DefProtocol {
            var,
            name: self.env.interned.symbol(None, pname),
            methods,
            loc,
        })
    }

    fn parse_extend_methods(
        &mut self,
        forms: &[Form],
        loc: Loc,
    ) -> Result<Vec<ExtendMethod>, CompilerError> {
        let mut methods = Vec::with_capacity(forms.len());
        for form in forms {
            let Form::List(items, mloc) = form else {
                return Err(err(ErrorKind::Value, loc, "method implementation must be a list"));
            };
            let mname = items.first().and_then(Form::as_sym).ok_or_else(|| {
                err(ErrorKind::Value, *mloc, "method implementation needs a name")
            })?;
            let fun = self.analyze_fn(&items[1..], *mloc, Some(mname.to_string()))?;
            methods.push(ExtendMethod { name: mname.into(), fun });
        }
        Ok(methods)
    }

    fn analyze_extend_type(&mut self, args: &[Form], loc: Loc) -> Result<Node, CompilerError> {
        expect_min("extend-type", args, 2, loc)?;
        let tname = sym_name(&args[0], loc)?;
        let type_key = TypeKey::from_name(tname)
            .ok_or_else(|| err(ErrorKind::Name, loc, format!("unknown type name: {tname}")))?;
        let protocol = self.analyze(&args[1], false)?;
        let methods = self.parse_extend_methods(&args[2..], loc)?;
        Ok(Node::ExtendType { protocol: Box::new(protocol), type_key, methods, loc })
    }

    /// `(extend-protocol P Type1 (m ...) Type2 (m ...))` → a `do` of
    /// per-type extends.
    fn analyze_extend_protocol(
        &mut self,
        args: &[Form],
        loc: Loc,
    ) -> Result<Node, CompilerError> {
        expect_min("extend-protocol", args, 2, loc)?;
        let mut body = Vec::new();
        let mut i = 1;
        while i < args.len() {
            let tname = sym_name(&args[i], loc)?;
            let type_key = TypeKey::from_name(tname).ok_or_else(|| {
                err(ErrorKind::Name, loc, format!("unknown type name: {tname}"))
            })?;
            let mut methods_end = i + 1;
            while methods_end < args.len() && matches!(args[methods_end], Form::List(..)) {
                methods_end += 1;
            }
            let protocol = self.analyze(&args[0], false)?;
            let methods = self.parse_extend_methods(&args[i + 1..methods_end], loc)?;
            body.push(Node::ExtendType { protocol: Box::new(protocol), type_key, methods, loc });
            i = methods_end;
        }
        Ok(Node::Do { body, loc })
    }

    fn analyze_dotimes(&mut self, args: &[Form], loc: Loc) -> Result<Node, CompilerError> {
        let Some(Form::Vector(binding, _)) = args.first() else {
            return Err(err(ErrorKind::Value, loc, "dotimes expects [i n]"));
        };
        let [var_form, limit_form] = binding.as_slice() else {
            return Err(err(ErrorKind::Value, loc, "dotimes expects [i n]"));
        };
        let var_name = sym_name(var_form, loc)?;
        let limit_init = self.analyze(limit_form, false)?;

        let lexical_base = self.fns.last().expect("fn scope").locals.len();
        let limit_slot = self.fns.last_mut().expect("fn scope").alloc_slot("__dotimes_limit");
        let i_slot = self.fns.last_mut().expect("fn scope").alloc_slot(var_name);
        self.fns.last_mut().expect("fn scope").loop_args.push(1);

        let mut body = self.analyze_body(&args[1..], false)?;
        let test = self.core_invoke(
            "<",
            vec![
                Node::Local { slot: i_slot, name: var_name.into(), loc },
                Node::Local { slot: limit_slot, name: "__dotimes_limit".into(), loc },
            ],
            loc,
        )?;
        let step = self.core_invoke(
            "inc",
            vec![Node::Local { slot: i_slot, name: var_name.into(), loc }],
            loc,
        )?;
        body.push(Node::Recur { args: vec![step], loc });

        let scope = self.fns.last_mut().expect("fn scope");
        scope.loop_args.pop();
        scope.locals.truncate(lexical_base);

        Ok(Node::Let {
            bindings: vec![LetBinding {
                slot: limit_slot,
                name: "__dotimes_limit".into(),
                init: limit_init,
            }],
            body: vec![Node::Loop {
                bindings: vec![LetBinding {
                    slot: i_slot,
                    name: var_name.into(),
                    init: Node::Const { value: Value::int(0), loc },
                }],
                body: vec![Node::If {
                    test: Box::new(test),
                    then: Box::new(Node::Do { body, loc }),
                    els: None,
                    loc,
                }],
                loc,
            }],
            loc,
        })
    }

    /// Single-binding `for`: `(for [x coll] body)` → `(map (fn [x] body) coll)`.
    fn analyze_for(&mut self, args: &[Form], loc: Loc) -> Result<Node, CompilerError> {
        let Some(Form::Vector(binding, _)) = args.first() else {
            return Err(err(ErrorKind::Value, loc, "for expects [x coll]"));
        };
        let [var_form, coll_form] = binding.as_slice() else {
            return Err(err(ErrorKind::Value, loc, "for supports a single binding pair"));
        };
        let var_name = sym_name(var_form, loc)?;
        let coll = self.analyze(coll_form, false)?;
        let fun = {
            let params = Form::Vector(vec![Form::Sym(var_name.to_string(), loc)], loc);
            let mut fn_args = vec![params];
            fn_args.extend_from_slice(&args[1..]);
            self.analyze_fn(&fn_args, loc, None)?
        };
        self.core_invoke("map", vec![Node::Fn(fun), coll], loc)
    }

    /// `(lazy-seq body...)` and friends: wrap the body in a zero-arg fn and
    /// hand it to the starred runtime kernel.
    fn thunk_call(
        &mut self,
        kernel: &str,
        args: &[Form],
        loc: Loc,
    ) -> Result<Node, CompilerError> {
        let params = Form::Vector(vec![], loc);
        let mut fn_args = vec![params];
        fn_args.extend_from_slice(args);
        let fun = self.analyze_fn(&fn_args, loc, None)?;
        self.core_invoke(kernel, vec![Node::Fn(fun)], loc)
    }

    // =========================================================================
    // Quoted data
    // =========================================================================

    /// Convert a quoted form into a permanent (infrastructure-tier) Value.
    /// AST constants must survive every collection without being traced.
    fn quote_value(&self, form: &Form) -> Result<Value, CompilerError> {
        let loc = form.loc();
        Ok(match form {
            Form::Nil(_) => Value::NIL,
            Form::Bool(b, _) => Value::bool(*b),
            Form::Int(n, _) => Value::from_i64(*n),
            Form::Float(f, _) => Value::float(*f),
            Form::Char(c, _) => Value::char(*c),
            Form::Str(s, _) => self.env.interned.alloc_permanent(ObjStr::new(s.clone())),
            Form::Sym(s, _) => self.env.interned.symbol_from(s),
            Form::Keyword(k, _) => self.env.interned.keyword_from(k),
            Form::Regex(src, _) => {
                let compiled = regex::Regex::new(src)
                    .map_err(|e| err(ErrorKind::Syntax, loc, format!("bad regex literal: {e}")))?;
                self.env.interned.alloc_permanent(ObjRegex {
                    hdr: ObjHeader::permanent(HeapTag::Regex),
                    source: src.clone().into(),
                    compiled,
                })
            }
            Form::Quote(inner, _) => {
                // 'x inside a quote: (quote x) as data
                let quote_sym = self.env.interned.symbol(None, "quote");
                let inner_v = self.quote_value(inner)?;
                let cell = self.env.interned.alloc_permanent(ObjCons::new(inner_v, self.env.empty_list));
                self.env.interned.alloc_permanent(ObjCons::new(quote_sym, cell))
            }
            Form::List(items, _) => {
                let mut acc = self.env.empty_list;
                for item in items.iter().rev() {
                    let v = self.quote_value(item)?;
                    acc = self.env.interned.alloc_permanent(ObjCons::new(v, acc));
                }
                acc
            }
            Form::Vector(items, _) => {
                let mut vals = Vec::with_capacity(items.len());
                for item in items {
                    vals.push(self.quote_value(item)?);
                }
                self.env.interned.alloc_permanent(ObjVector::new(vals))
            }
            Form::Map(pairs, _) => {
                let mut vals = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    vals.push((self.quote_value(k)?, self.quote_value(v)?));
                }
                for (i, (k, _)) in vals.iter().enumerate() {
                    for (k2, _) in &vals[..i] {
                        if lyra_runtime::eq::equiv(self.env, *k, *k2).unwrap_or(false) {
                            return Err(err(
                                ErrorKind::Value,
                                loc,
                                "duplicate key in map literal",
                            ));
                        }
                    }
                }
                self.env.interned.alloc_permanent(ObjArrayMap::new(vals))
            }
            Form::Set(items, _) => {
                let mut vals = Vec::with_capacity(items.len());
                for item in items {
                    vals.push(self.quote_value(item)?);
                }
                for (i, v) in vals.iter().enumerate() {
                    for v2 in &vals[..i] {
                        if lyra_runtime::eq::equiv(self.env, *v, *v2).unwrap_or(false) {
                            return Err(err(
                                ErrorKind::Value,
                                loc,
                                "duplicate element in set literal",
                            ));
                        }
                    }
                }
                // Quoted sets are small; entries keep literal order, index
                // built on demand through the collections layer is skipped.
                let mut index = std::collections::HashMap::new();
                for (i, v) in vals.iter().enumerate() {
                    let h = lyra_runtime::hashing::hash_value(self.env, *v)
                        .map_err(|_| err(ErrorKind::Internal, loc, "unhashable set literal"))?;
                    index.entry(h).or_insert_with(Vec::new).push(i as u32);
                }
                self.env.interned.alloc_permanent(lyra_runtime::heap::ObjHashSet {
                    hdr: ObjHeader::permanent(HeapTag::HashSet),
                    entries: vals,
                    index,
                    meta: Value::NIL,
                })
            }
        })
    }
}

const UNSHADOWABLE: &[&str] =
    &["if", "do", "def", "fn", "fn*", "let", "let*", "loop", "loop*", "recur", "quote", "var", "try", "throw"];

fn split_symbol(name: &str) -> (Option<&str>, &str) {
    if name == "/" {
        return (None, name);
    }
    match name.find('/') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => {
            (Some(&name[..idx]), &name[idx + 1..])
        }
        _ => (None, name),
    }
}

fn sym_name<'f>(form: &'f Form, loc: Loc) -> Result<&'f str, CompilerError> {
    form.as_sym()
        .ok_or_else(|| err(ErrorKind::Value, loc, "invalid binding form: expected a symbol"))
}

fn is_earmuffed(name: &str) -> bool {
    name.len() > 2 && name.starts_with('*') && name.ends_with('*')
}

fn expect_args(name: &str, args: &[Form], n: usize, loc: Loc) -> Result<(), CompilerError> {
    if args.len() != n {
        return Err(err(ErrorKind::Arity, loc, format!("{name} expects {n} forms")));
    }
    Ok(())
}

fn expect_min(name: &str, args: &[Form], n: usize, loc: Loc) -> Result<(), CompilerError> {
    if args.len() < n {
        return Err(err(ErrorKind::Arity, loc, format!("{name} expects at least {n} forms")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_all;

    fn analyze_one(env: &Env, src: &str) -> &'static Node {
        let forms = read_all(src).unwrap();
        analyze_top(env, &forms[0]).unwrap().0
    }

    fn env() -> std::sync::Arc<Env> {
        crate::bootstrap::new_env()
    }

    #[test]
    fn literals_become_consts() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert!(matches!(analyze_one(&env, "42"), Node::Const { .. }));
        assert!(matches!(analyze_one(&env, ":kw"), Node::Const { .. }));
        assert!(matches!(analyze_one(&env, "'(1 2)"), Node::Const { .. }));
    }

    #[test]
    fn let_assigns_slots_and_resolves() {
        let env = env();
        let _m = env.gc.register_mutator();
        let node = analyze_one(&env, "(let [a 1 b 2] b)");
        let Node::Let { bindings, body, .. } = node else { panic!("expected let") };
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].slot, 0);
        assert_eq!(bindings[1].slot, 1);
        assert!(matches!(body.last(), Some(Node::Local { slot: 1, .. })));
    }

    #[test]
    fn fn_captures_enclosing_locals() {
        let env = env();
        let _m = env.gc.register_mutator();
        let node = analyze_one(&env, "(let [x 1] (fn [y] x))");
        let Node::Let { body, .. } = node else { panic!("expected let") };
        let Some(Node::Fn(f)) = body.last() else { panic!("expected fn") };
        assert_eq!(f.captures.len(), 1);
        assert!(matches!(f.captures[0], CaptureSource::Local(0)));
        // Inside the fn, x must be a capture reference.
        let Node::Captured { idx: 0, .. } = f.arities[0].body[0] else {
            panic!("x should resolve to capture 0")
        };
    }

    #[test]
    fn named_fn_sees_itself() {
        let env = env();
        let _m = env.gc.register_mutator();
        let node = analyze_one(&env, "(fn f [n] (f n))");
        let Node::Fn(f) = node else { panic!("expected fn") };
        assert!(f.captures.iter().any(|c| matches!(c, CaptureSource::SelfRef)));
    }

    #[test]
    fn recur_arity_checked_against_loop() {
        let env = env();
        let _m = env.gc.register_mutator();
        let forms = read_all("(loop [i 0 acc 0] (recur i))").unwrap();
        let e = analyze_top(&env, &forms[0]).unwrap_err();
        assert_eq!(e.kind, ErrorKind::Arity);
    }

    #[test]
    fn recur_outside_tail_rejected() {
        let env = env();
        let _m = env.gc.register_mutator();
        let forms = read_all("(loop [i 0] (+ (recur 1) 2))").unwrap();
        assert!(analyze_top(&env, &forms[0]).is_err());
    }

    #[test]
    fn unresolved_symbol_is_name_error() {
        let env = env();
        let _m = env.gc.register_mutator();
        let forms = read_all("nope-not-defined").unwrap();
        let e = analyze_top(&env, &forms[0]).unwrap_err();
        assert_eq!(e.kind, ErrorKind::Name);
    }

    #[test]
    fn variadic_params_parsed() {
        let env = env();
        let _m = env.gc.register_mutator();
        let node = analyze_one(&env, "(fn [a & more] more)");
        let Node::Fn(f) = node else { panic!("expected fn") };
        assert_eq!(f.arities[0].params, 1);
        assert!(f.arities[0].is_variadic);
        assert_eq!(f.arities[0].local_count, 2);
    }

    #[test]
    fn earmuffed_def_is_dynamic() {
        let env = env();
        let _m = env.gc.register_mutator();
        let node = analyze_one(&env, "(def *flag* 1)");
        let Node::Def { dynamic, .. } = node else { panic!("expected def") };
        assert!(dynamic);
    }
}
