//! The Call Bridge
//!
//! `call_fn` is the sole dispatch point for invoking any callable Value from
//! any context: builtins, the two closure kinds, keywords and collections
//! acting as functions, multimethods, protocol methods, and var-refs. Both
//! engines and every builtin route through here; ad-hoc callback wiring
//! anywhere else is forbidden by design.
//!
//! A bytecode closure reuses the innermost active VM on this thread (a
//! re-entrant call into the same operand stack); with no active VM, one is
//! created for the call and reclaimed on return. Tree closures get a small
//! evaluator context. The frame barrier recorded by the re-entrant call is
//! what keeps an outer `try` from intercepting an inner callee's exceptions.

use crate::collections;
use crate::env::Env;
use crate::error::{self, ErrorKind};
use crate::heap::{ClosureBody, ObjClosure, ObjVector, Var};
use crate::multimethods;
use crate::protocols;
use crate::seq;
use crate::value::{HeapTag, Tag, Value};

/// Invoke `callable` with `args`.
pub fn call_fn(env: &Env, callable: Value, args: &[Value]) -> Result<Value, Value> {
    match callable.tag() {
        Tag::Builtin => (callable.as_builtin().func)(env, args),
        Tag::Heap(HeapTag::Closure) => match &ObjClosure::of(callable).body {
            ClosureBody::Bytecode(_) => crate::vm::execute_closure(env, callable, args),
            ClosureBody::Tree(_) => crate::treewalk::call_closure(env, callable, args),
            ClosureBody::Partial { f, args: pre } => {
                let mut full = pre.to_vec();
                full.extend_from_slice(args);
                call_fn(env, *f, &full)
            }
        },
        Tag::Heap(HeapTag::Keyword) => match args {
            [coll] => collections::get(env, *coll, callable, Value::NIL),
            [coll, default] => collections::get(env, *coll, callable, *default),
            _ => Err(error::arity_error(env, "keyword", args.len())),
        },
        Tag::Heap(HeapTag::ArrayMap | HeapTag::HashMap) => match args {
            [k] => collections::get(env, callable, *k, Value::NIL),
            [k, default] => collections::get(env, callable, *k, *default),
            _ => Err(error::arity_error(env, "map", args.len())),
        },
        Tag::Heap(HeapTag::HashSet) => match args {
            [k] => collections::get(env, callable, *k, Value::NIL),
            [k, default] => collections::get(env, callable, *k, *default),
            _ => Err(error::arity_error(env, "set", args.len())),
        },
        Tag::Heap(HeapTag::Vector) => match args {
            [idx] => {
                if !idx.is_int() {
                    return Err(error::type_error(env, "integer index", *idx));
                }
                let items = &ObjVector::of(callable).items;
                let i = idx.as_i64();
                if i >= 0 && (i as usize) < items.len() {
                    Ok(items[i as usize])
                } else {
                    Err(error::raise(
                        env,
                        ErrorKind::Index,
                        format!("index {i} out of bounds for vector of {}", items.len()),
                    ))
                }
            }
            _ => Err(error::arity_error(env, "vector", args.len())),
        },
        Tag::Heap(HeapTag::Multimethod) => {
            let scope = env.roots();
            let method = scope.keep(multimethods::dispatch(env, callable, args)?);
            call_fn(env, method, args)
        }
        Tag::Heap(HeapTag::ProtocolMethod) => {
            let Some(receiver) = args.first() else {
                return Err(error::arity_error(env, "protocol method", 0));
            };
            let scope = env.roots();
            let method = scope.keep(protocols::resolve_method(env, callable, *receiver)?);
            call_fn(env, method, args)
        }
        Tag::Heap(HeapTag::VarRef) => {
            let var = Var::of(callable);
            match env.var_value(var) {
                Some(f) => call_fn(env, f, args),
                None => Err(error::raise(
                    env,
                    ErrorKind::Name,
                    format!("unbound var: {}", var.qualified()),
                )),
            }
        }
        _ => Err(error::type_error(env, "callable", callable)),
    }
}

/// `apply`: the final element of `args` is a sequence spliced into the call.
pub fn apply_fn(env: &Env, callable: Value, args: &[Value]) -> Result<Value, Value> {
    let Some((last, fixed)) = args.split_last() else {
        return call_fn(env, callable, &[]);
    };
    let scope = env.roots();
    let mut full = fixed.to_vec();
    let spliced = seq::to_vec(env, &scope, *last)?;
    full.extend(spliced);
    call_fn(env, callable, &full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::map_from_pairs;

    fn env() -> std::sync::Arc<Env> {
        Env::new()
    }

    #[test]
    fn keywords_are_getters() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let k = env.keyword("a");
        let m = scope.keep(map_from_pairs(&env, &[(k, Value::int(1))]).unwrap());
        assert_eq!(call_fn(&env, k, &[m]).unwrap().as_i64(), 1);
        let missing = env.keyword("b");
        assert!(call_fn(&env, missing, &[m]).unwrap().is_nil());
        assert_eq!(call_fn(&env, missing, &[m, Value::int(9)]).unwrap().as_i64(), 9);
    }

    #[test]
    fn vectors_index_and_bounds_check() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let v = scope
            .keep(env.alloc(crate::heap::ObjVector::new(vec![Value::int(7)])).unwrap());
        assert_eq!(call_fn(&env, v, &[Value::int(0)]).unwrap().as_i64(), 7);
        assert!(call_fn(&env, v, &[Value::int(3)]).is_err());
    }

    #[test]
    fn non_callable_is_a_type_error() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert!(call_fn(&env, Value::int(3), &[]).is_err());
    }

    #[test]
    fn var_refs_call_through() {
        let env = env();
        let _m = env.gc.register_mutator();
        let var = env.intern_var("user", "kw");
        var.set_root(env.keyword("x"));
        let var_ref = Value::heap(HeapTag::VarRef, var as *const _ as *const u8);
        let scope = env.roots();
        let m = scope
            .keep(map_from_pairs(&env, &[(env.keyword("x"), Value::int(5))]).unwrap());
        assert_eq!(call_fn(&env, var_ref, &[m]).unwrap().as_i64(), 5);
    }
}
