//! Predicates, exceptions, dispatch-table helpers, and odds and ends.
//!
//! The starred names (`defprotocol*`, `extend-type*`, `defmulti*`,
//! `defmethod*`, `lazy-seq*`, `delay*`, `future*`, `with-out-str*`) are the
//! runtime halves of special forms: the compiler lowers those forms to calls
//! of these builtins, and the analyzer never exposes them to user code under
//! the unstarred names.

use super::{Registrar, exact_arity, min_arity, partial};
use crate::env::Env;
use crate::eq::equiv;
use crate::error::{self, ErrorKind};
use crate::heap::{
    ObjArrayMap, ObjClosure, ObjHashMap, ObjHashSet, ObjKeyword, ObjStr, ObjSymbol, ObjVector,
    Var,
};
use crate::multimethods;
use crate::protocols::{self, TypeKey};
use crate::seq;
use crate::value::{HeapTag, Tag, Value};

pub(super) fn register(reg: &mut Registrar<'_>) {
    reg.def("identity", identity);
    reg.def("not", not);
    reg.def("boolean", boolean);
    reg.def("nil?", nil_p);
    reg.def("some?", some_p);
    reg.def("true?", true_p);
    reg.def("false?", false_p);
    reg.def("number?", number_p);
    reg.def("int?", int_p);
    reg.def("integer?", int_p);
    reg.def("float?", float_p);
    reg.def("string?", string_p);
    reg.def("keyword?", keyword_p);
    reg.def("symbol?", symbol_p);
    reg.def("char?", char_p);
    reg.def("boolean?", boolean_p);
    reg.def("fn?", fn_p);
    reg.def("coll?", coll_p);
    reg.def("list?", list_p);
    reg.def("vector?", vector_p);
    reg.def("map?", map_p);
    reg.def("set?", set_p);
    reg.def("seq?", seq_p);
    reg.def("type", type_fn);
    reg.def("hash", hash_fn);
    reg.def("meta", meta);
    reg.def("with-meta", with_meta);
    reg.def("ex-info", ex_info);
    reg.def("ex-data", ex_data);
    reg.def("ex-message", ex_message);
    reg.def("rand", rand_fn);
    reg.def("rand-int", rand_int);
    reg.def("time-ms", time_ms);
    reg.def("gc", gc_fn);
    reg.def("partial", partial_fn);
    reg.def("comp", comp);
    reg.def("constantly", constantly);
    reg.def("constantly*", constantly_star);
    reg.def("isa?", isa_p);
    reg.def("derive", derive_fn);
    reg.def("prefer-method", prefer_method);
    reg.def("add-shutdown-hook", add_shutdown_hook);
    reg.def("lazy-seq*", lazy_seq_star);
    reg.def("defprotocol*", defprotocol_star);
    reg.def("extend-type*", extend_type_star);
    reg.def("defmulti*", defmulti_star);
    reg.def("defmethod*", defmethod_star);
    reg.def("in-ns", in_ns);
    reg.def("comp-apply*", comp_apply_star);
}

fn identity(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "identity", args, 1)?;
    Ok(args[0])
}

fn not(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "not", args, 1)?;
    Ok(Value::bool(!args[0].is_truthy()))
}

fn boolean(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "boolean", args, 1)?;
    Ok(Value::bool(args[0].is_truthy()))
}

macro_rules! predicate {
    ($name:ident, $test:expr) => {
        fn $name(env: &Env, args: &[Value]) -> Result<Value, Value> {
            exact_arity(env, stringify!($name), args, 1)?;
            let v: Value = args[0];
            #[allow(clippy::redundant_closure_call)]
            Ok(Value::bool(($test)(v)))
        }
    };
}

predicate!(nil_p, |v: Value| v.is_nil());
predicate!(some_p, |v: Value| !v.is_nil());
predicate!(true_p, |v: Value| v.identical(Value::TRUE));
predicate!(false_p, |v: Value| v.identical(Value::FALSE));
predicate!(number_p, |v: Value| v.is_number());
predicate!(int_p, |v: Value| v.is_int());
predicate!(float_p, |v: Value| v.is_float());
predicate!(string_p, |v: Value| v.heap_tag() == Some(HeapTag::Str));
predicate!(keyword_p, |v: Value| v.heap_tag() == Some(HeapTag::Keyword));
predicate!(symbol_p, |v: Value| v.heap_tag() == Some(HeapTag::Symbol));
predicate!(char_p, |v: Value| matches!(v.tag(), Tag::Char));
predicate!(boolean_p, |v: Value| matches!(v.tag(), Tag::True | Tag::False));
predicate!(fn_p, |v: Value| matches!(
    v.tag(),
    Tag::Builtin
        | Tag::Heap(HeapTag::Closure)
        | Tag::Heap(HeapTag::Multimethod)
        | Tag::Heap(HeapTag::ProtocolMethod)
        | Tag::Heap(HeapTag::Keyword)
));
predicate!(coll_p, |v: Value| matches!(
    v.heap_tag(),
    Some(
        HeapTag::Cons
            | HeapTag::EmptyList
            | HeapTag::ChunkedCons
            | HeapTag::LazySeq
            | HeapTag::Vector
            | HeapTag::ArrayMap
            | HeapTag::HashMap
            | HeapTag::HashSet
    )
));
predicate!(list_p, |v: Value| matches!(
    v.heap_tag(),
    Some(HeapTag::Cons | HeapTag::EmptyList | HeapTag::ChunkedCons)
));
predicate!(vector_p, |v: Value| v.heap_tag() == Some(HeapTag::Vector));
predicate!(map_p, |v: Value| matches!(
    v.heap_tag(),
    Some(HeapTag::ArrayMap | HeapTag::HashMap)
));
predicate!(set_p, |v: Value| v.heap_tag() == Some(HeapTag::HashSet));
predicate!(seq_p, |v: Value| matches!(
    v.heap_tag(),
    Some(HeapTag::Cons | HeapTag::ChunkedCons | HeapTag::LazySeq | HeapTag::EmptyList)
));

fn type_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "type", args, 1)?;
    Ok(env.keyword(crate::printer::type_name(args[0])))
}

fn hash_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "hash", args, 1)?;
    Ok(Value::int(crate::hashing::hash_value(env, args[0])? as i64))
}

fn meta(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "meta", args, 1)?;
    Ok(match args[0].heap_tag() {
        Some(HeapTag::Vector) => ObjVector::of(args[0]).meta,
        Some(HeapTag::ArrayMap) => ObjArrayMap::of(args[0]).meta,
        Some(HeapTag::HashMap) => ObjHashMap::of(args[0]).meta,
        Some(HeapTag::HashSet) => ObjHashSet::of(args[0]).meta,
        Some(HeapTag::Closure) => ObjClosure::of(args[0]).meta,
        _ => Value::NIL,
    })
}

fn with_meta(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "with-meta", args, 2)?;
    match args[0].heap_tag() {
        Some(HeapTag::Vector) => {
            let obj = ObjVector::of(args[0]);
            let mut new = ObjVector::new(obj.items.to_vec());
            new.meta = args[1];
            env.alloc(new)
        }
        Some(HeapTag::ArrayMap) => {
            let obj = ObjArrayMap::of(args[0]);
            let mut new = ObjArrayMap::new(obj.entries.to_vec());
            new.meta = args[1];
            env.alloc(new)
        }
        _ => Err(error::type_error(env, "value supporting metadata", args[0])),
    }
}

/// `(ex-info msg data)` builds a throwable map carrying `:data`.
fn ex_info(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "ex-info", args, 2)?;
    let msg = super::str_arg(env, "ex-info", args[0])?;
    Ok(error::raise_with(env, ErrorKind::Value, msg.to_string(), args[1]))
}

fn ex_data(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "ex-data", args, 1)?;
    Ok(error::lookup_identity(args[0], env.keyword("data")).unwrap_or(Value::NIL))
}

fn ex_message(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "ex-message", args, 1)?;
    match error::lookup_identity(args[0], env.keyword("message")) {
        Some(m) => Ok(m),
        None => Ok(Value::NIL),
    }
}

fn rand_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [] => Ok(Value::float(env.rand_f64())),
        [n] => {
            if !n.is_number() {
                return Err(error::type_error(env, "number", *n));
            }
            let upper = if n.is_int() { n.as_i64() as f64 } else { n.as_f64() };
            Ok(Value::float(env.rand_f64() * upper))
        }
        _ => Err(error::arity_error(env, "rand", args.len())),
    }
}

fn rand_int(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "rand-int", args, 1)?;
    let bound = super::int_arg(env, "rand-int", args[0])?;
    if bound <= 0 {
        return Ok(Value::int(0));
    }
    Ok(Value::from_i64(env.rand_i64(bound)))
}

fn time_ms(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "time-ms", args, 0)?;
    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(Value::from_i64(ms))
}

fn gc_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "gc", args, 0)?;
    env.collect_now();
    Ok(Value::NIL)
}

fn partial_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "partial", args, 1)?;
    partial(env, args[0], &args[1..])
}

/// `(comp f g h)` composes right-to-left via the `comp-apply*` kernel.
fn comp(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [] => {
            let def = env
                .resolve_var(Some(crate::env::CORE_NS), "identity")
                .and_then(|v| env.var_value(v))
                .ok_or_else(|| error::raise(env, ErrorKind::Internal, "identity missing"))?;
            Ok(def)
        }
        [f] => Ok(*f),
        _ => {
            let scope = env.roots();
            let fns = scope.keep(env.alloc(ObjVector::new(args.to_vec()))?);
            let kernel = env
                .resolve_var(Some(crate::env::CORE_NS), "comp-apply*")
                .and_then(|v| env.var_value(v))
                .ok_or_else(|| error::raise(env, ErrorKind::Internal, "comp-apply* missing"))?;
            partial(env, kernel, &[fns])
        }
    }
}

/// Kernel behind `comp`: apply the vector of functions right-to-left.
fn comp_apply_star(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "comp-apply*", args, 1)?;
    let fns = &ObjVector::of(args[0]).items;
    let scope = env.roots();
    let Some((innermost, outer)) = fns.split_last() else {
        return Err(error::raise(env, ErrorKind::Internal, "comp of zero fns"));
    };
    let mut acc = scope.keep(crate::bridge::call_fn(env, *innermost, &args[1..])?);
    for f in outer.iter().rev() {
        acc = scope.keep(crate::bridge::call_fn(env, *f, &[acc])?);
    }
    Ok(acc)
}

fn constantly(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "constantly", args, 1)?;
    let kernel = env
        .resolve_var(Some(crate::env::CORE_NS), "constantly*")
        .and_then(|v| env.var_value(v))
        .ok_or_else(|| error::raise(env, ErrorKind::Internal, "constantly* missing"))?;
    partial(env, kernel, &[args[0]])
}

/// Kernel behind `constantly`: the partially applied value, ignoring the
/// call's own arguments.
fn constantly_star(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "constantly*", args, 1)?;
    Ok(args[0])
}

fn isa_p(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "isa?", args, 2)?;
    Ok(Value::bool(multimethods::isa(env, args[0], args[1])))
}

fn derive_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "derive", args, 2)?;
    multimethods::derive(env, args[0], args[1])?;
    Ok(Value::NIL)
}

fn prefer_method(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "prefer-method", args, 3)?;
    multimethods::prefer_method(env, args[0], args[1], args[2])?;
    Ok(args[0])
}

fn add_shutdown_hook(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "add-shutdown-hook", args, 1)?;
    env.add_shutdown_hook(args[0]);
    Ok(Value::NIL)
}

fn lazy_seq_star(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "lazy-seq*", args, 1)?;
    seq::lazy_from_thunk(env, args[0])
}

// =============================================================================
// Compiler support: dispatch-table special forms lower to these
// =============================================================================

fn var_arg(env: &Env, name: &str, v: Value) -> Result<&'static Var, Value> {
    if v.heap_tag() == Some(HeapTag::VarRef) {
        Ok(Var::of(v))
    } else {
        Err(error::raise(env, ErrorKind::Compile, format!("{name} expects a var")))
    }
}

/// `(defprotocol* var name [method-syms...])`
fn defprotocol_star(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "defprotocol*", args, 3)?;
    let var = var_arg(env, "defprotocol*", args[0])?;
    if args[2].heap_tag() != Some(HeapTag::Vector) {
        return Err(error::raise(env, ErrorKind::Compile, "defprotocol* expects a method vector"));
    }
    let methods = ObjVector::of(args[2]).items.to_vec();
    protocols::install_protocol(env, var, args[1], &methods)
}

/// `(extend-type* protocol type-key-int name1 fn1 name2 fn2 ...)`
fn extend_type_star(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "extend-type*", args, 2)?;
    let raw_key = super::int_arg(env, "extend-type*", args[1])? as u32;
    let key = type_key_from_u32(env, raw_key)?;
    if (args.len() - 2) % 2 != 0 {
        return Err(error::raise(env, ErrorKind::Compile, "extend-type* expects name/fn pairs"));
    }
    let mut methods = Vec::with_capacity((args.len() - 2) / 2);
    for pair in args[2..].chunks(2) {
        let name: Box<str> = match pair[0].heap_tag() {
            Some(HeapTag::Str) => ObjStr::of(pair[0]).data.clone(),
            Some(HeapTag::Symbol) => ObjSymbol::of(pair[0]).name.clone(),
            _ => return Err(error::raise(env, ErrorKind::Compile, "method name must be a symbol")),
        };
        methods.push((name, pair[1]));
    }
    protocols::extend_protocol(env, args[0], key, methods)?;
    Ok(Value::NIL)
}

fn type_key_from_u32(env: &Env, raw: u32) -> Result<TypeKey, Value> {
    // TypeKey is repr(u32) with contiguous discriminants.
    if raw <= TypeKey::Other as u32 {
        Ok(unsafe { std::mem::transmute::<u32, TypeKey>(raw) })
    } else {
        Err(error::raise(env, ErrorKind::Compile, format!("bad type key {raw}")))
    }
}

/// `(defmulti* var name dispatch-fn)`
fn defmulti_star(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "defmulti*", args, 3)?;
    let var = var_arg(env, "defmulti*", args[0])?;
    multimethods::install_multimethod(env, var, args[1], args[2])
}

/// `(defmethod* multimethod dispatch-val fn)`
fn defmethod_star(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "defmethod*", args, 3)?;
    multimethods::add_method(env, args[0], args[1], args[2])?;
    Ok(args[0])
}

fn in_ns(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "in-ns", args, 1)?;
    let name = match args[0].heap_tag() {
        Some(HeapTag::Symbol) => ObjSymbol::of(args[0]).name.clone(),
        Some(HeapTag::Str) => ObjStr::of(args[0]).data.clone(),
        _ => return Err(error::type_error(env, "symbol", args[0])),
    };
    env.set_current_ns(&name);
    Ok(Value::NIL)
}

/// Total ordering for `sort`/`compare`. Cross-type comparison (outside the
/// numeric bridge) is a type error.
pub(crate) fn compare_values(
    env: &Env,
    a: Value,
    b: Value,
) -> Result<std::cmp::Ordering, Value> {
    use std::cmp::Ordering;
    if a.is_number() && b.is_number() {
        return crate::arith::compare(env, a, b);
    }
    match (a.tag(), b.tag()) {
        (Tag::Nil, Tag::Nil) => Ok(Ordering::Equal),
        (Tag::Char, Tag::Char) => Ok(a.as_char().cmp(&b.as_char())),
        (Tag::True | Tag::False, Tag::True | Tag::False) => {
            Ok(a.is_truthy().cmp(&b.is_truthy()))
        }
        (Tag::Heap(HeapTag::Str), Tag::Heap(HeapTag::Str)) => {
            Ok(ObjStr::of(a).data.cmp(&ObjStr::of(b).data))
        }
        (Tag::Heap(HeapTag::Keyword), Tag::Heap(HeapTag::Keyword)) => {
            Ok(ObjKeyword::of(a).qualified().cmp(&ObjKeyword::of(b).qualified()))
        }
        (Tag::Heap(HeapTag::Symbol), Tag::Heap(HeapTag::Symbol)) => {
            Ok(ObjSymbol::of(a).qualified().cmp(&ObjSymbol::of(b).qualified()))
        }
        (Tag::Heap(HeapTag::Vector), Tag::Heap(HeapTag::Vector)) => {
            let xs = &ObjVector::of(a).items;
            let ys = &ObjVector::of(b).items;
            for (x, y) in xs.iter().zip(ys.iter()) {
                match compare_values(env, *x, *y)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(xs.len().cmp(&ys.len()))
        }
        _ => {
            if equiv(env, a, b)? {
                Ok(Ordering::Equal)
            } else {
                Err(error::raise(
                    env,
                    ErrorKind::Type,
                    format!(
                        "cannot compare {} with {}",
                        crate::printer::type_name(a),
                        crate::printer::type_name(b)
                    ),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        crate::builtins::test_env()
    }

    #[test]
    fn predicates_discriminate() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert!(nil_p(&env, &[Value::NIL]).unwrap().is_truthy());
        assert!(!nil_p(&env, &[Value::int(0)]).unwrap().is_truthy());
        assert!(int_p(&env, &[Value::int(1)]).unwrap().is_truthy());
        assert!(keyword_p(&env, &[env.keyword("k")]).unwrap().is_truthy());
    }

    #[test]
    fn ex_info_roundtrips_data() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let msg = scope.keep(env.alloc_str("boom").unwrap());
        let data = scope.keep(
            crate::collections::map_from_pairs(&env, &[(env.keyword("k"), Value::int(1))])
                .unwrap(),
        );
        let exc = scope.keep(ex_info(&env, &[msg, data]).unwrap());
        let d = ex_data(&env, &[exc]).unwrap();
        assert!(crate::eq::equiv(&env, d, data).unwrap());
        let m = ex_message(&env, &[exc]).unwrap();
        assert_eq!(&*ObjStr::of(m).data, "boom");
    }

    #[test]
    fn comp_composes_right_to_left() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let inc = env.var_value(env.resolve_var(Some("lyra.core"), "inc").unwrap()).unwrap();
        // (comp inc inc) applied to 1 => 3
        let composed = scope.keep(comp(&env, &[inc, inc]).unwrap());
        let out = crate::bridge::call_fn(&env, composed, &[Value::int(1)]).unwrap();
        assert_eq!(out.as_i64(), 3);
    }

    #[test]
    fn partial_prepends_arguments() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let plus = env.var_value(env.resolve_var(Some("lyra.core"), "+").unwrap()).unwrap();
        let add5 = scope.keep(partial_fn(&env, &[plus, Value::int(5)]).unwrap());
        let out = crate::bridge::call_fn(&env, add5, &[Value::int(2)]).unwrap();
        assert_eq!(out.as_i64(), 7);
    }

    #[test]
    fn map_transducer_arity_matches_two_arg_form() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let inc = env.var_value(env.resolve_var(Some("lyra.core"), "inc").unwrap()).unwrap();
        let map_fn = env.var_value(env.resolve_var(Some("lyra.core"), "map").unwrap()).unwrap();
        let into_fn =
            env.var_value(env.resolve_var(Some("lyra.core"), "into").unwrap()).unwrap();
        let xf = scope.keep(crate::bridge::call_fn(&env, map_fn, &[inc]).unwrap());
        let to = scope.keep(env.alloc(ObjVector::new(vec![])).unwrap());
        let from = scope.keep(
            seq::list_from(&env, &[Value::int(1), Value::int(2), Value::int(3)]).unwrap(),
        );
        // (into [] (map inc) from) = [2 3 4]
        let out = scope.keep(crate::bridge::call_fn(&env, into_fn, &[to, xf, from]).unwrap());
        assert_eq!(crate::printer::pr_str(&env, out).unwrap(), "[2 3 4]");
        // (map inc from) has equal elements
        let mapped = scope.keep(crate::bridge::call_fn(&env, map_fn, &[inc, from]).unwrap());
        assert!(crate::eq::equiv(&env, mapped, out).unwrap());
    }
}
