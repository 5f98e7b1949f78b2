//! Builtin Function Set
//!
//! Native functions registered into the core namespace at bootstrap. Each
//! has the uniform signature `fn(&Env, &[Value]) -> Result<Value, Value>`
//! with errors returned as thrown exception values, never as Rust panics.

mod arithmetic;
mod collection_ops;
mod io;
mod misc;
mod sequences;
mod state;
mod strings;

use crate::env::{CORE_NS, Env};
use crate::error::{self, ErrorKind};
use crate::value::{BuiltinDef, BuiltinFn, Value};

/// Registers builtins: leaks the definition record (infrastructure
/// lifetime) and binds a core var to the tagged pointer.
pub struct Registrar<'e> {
    env: &'e Env,
    count: usize,
}

impl Registrar<'_> {
    pub fn def(&mut self, name: &'static str, func: BuiltinFn) {
        let def: &'static BuiltinDef = Box::leak(Box::new(BuiltinDef { name, func }));
        let var = self.env.intern_var(CORE_NS, name);
        var.set_root(Value::builtin(def));
        self.count += 1;
    }
}

/// Install the full builtin set into `lyra.core`. Returns how many were
/// registered (bootstrap logs it).
pub fn install(env: &Env) -> usize {
    let mut reg = Registrar { env, count: 0 };
    arithmetic::register(&mut reg);
    collection_ops::register(&mut reg);
    sequences::register(&mut reg);
    strings::register(&mut reg);
    state::register(&mut reg);
    io::register(&mut reg);
    misc::register(&mut reg);
    tracing::debug!(count = reg.count, "builtins installed");
    reg.count
}

// Shared argument helpers.

pub(crate) fn exact_arity(env: &Env, name: &str, args: &[Value], n: usize) -> Result<(), Value> {
    if args.len() != n {
        return Err(error::arity_error(env, name, args.len()));
    }
    Ok(())
}

pub(crate) fn min_arity(env: &Env, name: &str, args: &[Value], n: usize) -> Result<(), Value> {
    if args.len() < n {
        return Err(error::arity_error(env, name, args.len()));
    }
    Ok(())
}

pub(crate) fn int_arg(env: &Env, name: &str, v: Value) -> Result<i64, Value> {
    if v.is_int() {
        Ok(v.as_i64())
    } else {
        Err(error::raise(
            env,
            ErrorKind::Type,
            format!("{name} expects an integer, got {}", crate::printer::type_name(v)),
        ))
    }
}

pub(crate) fn str_arg<'a>(env: &Env, name: &str, v: Value) -> Result<&'a str, Value> {
    match v.heap_tag() {
        Some(crate::value::HeapTag::Str) => Ok(&crate::heap::ObjStr::of(v).data),
        _ => Err(error::raise(
            env,
            ErrorKind::Type,
            format!("{name} expects a string, got {}", crate::printer::type_name(v)),
        )),
    }
}

#[cfg(test)]
pub(crate) fn test_env() -> std::sync::Arc<Env> {
    let env = Env::new();
    install(&env);
    env
}

/// Allocate a partial-application closure (`partial`, transducer arities).
pub(crate) fn partial(env: &Env, f: Value, pre: &[Value]) -> Result<Value, Value> {
    env.alloc(crate::heap::ObjClosure {
        hdr: crate::heap::ObjHeader::new(crate::value::HeapTag::Closure),
        body: crate::heap::ClosureBody::Partial { f, args: pre.to_vec().into_boxed_slice() },
        captures: Box::new([]),
        ns: Value::NIL,
        name: None,
        meta: Value::NIL,
    })
}
