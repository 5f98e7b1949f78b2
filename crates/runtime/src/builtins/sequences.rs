//! Sequence builtins.
//!
//! `map`/`filter`/`remove`/`take`/`drop` attach chain-descriptor transforms
//! (flat-extending an existing chain), so a downstream `reduce` streams the
//! whole pipeline in one pass. Single-argument arities return curried
//! transformers for `(into to xf from)` composition.

use super::{Registrar, exact_arity, min_arity, partial};
use crate::bridge;
use crate::env::Env;
use crate::error::{self, ErrorKind};
use crate::heap::ObjVector;
use crate::seq::{self, ChainDesc, ChainOp, ChainSource, IterState};
use crate::value::{HeapTag, Value};

pub(super) fn register(reg: &mut Registrar<'_>) {
    reg.def("first", first);
    reg.def("second", second);
    reg.def("rest", rest);
    reg.def("next", next);
    reg.def("cons", cons);
    reg.def("seq", seq_fn);
    reg.def("range", range);
    reg.def("iterate", iterate);
    reg.def("repeat", repeat);
    reg.def("map", map);
    reg.def("mapv", mapv);
    reg.def("filter", filter);
    reg.def("remove", remove);
    reg.def("take", take);
    reg.def("drop", drop_fn);
    reg.def("reduce", reduce);
    reg.def("reduce-kv", reduce_kv);
    reg.def("reduced", reduced);
    reg.def("reduced?", reduced_p);
    reg.def("apply", apply);
    reg.def("concat", concat);
    reg.def("reverse", reverse);
    reg.def("sort", sort);
    reg.def("sort-by", sort_by);
    reg.def("distinct", distinct);
    reg.def("interpose", interpose);
    reg.def("partition", partition);
    reg.def("doall", doall);
    reg.def("dorun", dorun);
    reg.def("last", last);
    reg.def("realized?", realized_p);
}

fn first(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "first", args, 1)?;
    seq::first(env, args[0])
}

fn second(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "second", args, 1)?;
    let scope = env.roots();
    let r = scope.keep(seq::rest(env, args[0])?);
    seq::first(env, r)
}

fn rest(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "rest", args, 1)?;
    seq::rest(env, args[0])
}

fn next(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "next", args, 1)?;
    seq::next(env, args[0])
}

fn cons(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "cons", args, 2)?;
    seq::cons(env, args[0], args[1])
}

fn seq_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "seq", args, 1)?;
    seq::seq(env, args[0])
}

fn range(env: &Env, args: &[Value]) -> Result<Value, Value> {
    let (start, end, step) = match args {
        [] => (0, None, 1),
        [end] => (0, Some(super::int_arg(env, "range", *end)?), 1),
        [start, end] => (
            super::int_arg(env, "range", *start)?,
            Some(super::int_arg(env, "range", *end)?),
            1,
        ),
        [start, end, step] => (
            super::int_arg(env, "range", *start)?,
            Some(super::int_arg(env, "range", *end)?),
            super::int_arg(env, "range", *step)?,
        ),
        _ => return Err(error::arity_error(env, "range", args.len())),
    };
    seq::lazy_from_chain(env, ChainDesc::from_source(ChainSource::Range { next: start, end, step }))
}

fn iterate(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "iterate", args, 2)?;
    seq::lazy_from_chain(
        env,
        ChainDesc::from_source(ChainSource::Iterate { f: args[0], state: IterState::Seed(args[1]) }),
    )
}

fn repeat(env: &Env, args: &[Value]) -> Result<Value, Value> {
    let (item, remaining) = match args {
        [item] => (*item, None),
        [n, item] => (*item, Some(super::int_arg(env, "repeat", *n)?)),
        _ => return Err(error::arity_error(env, "repeat", args.len())),
    };
    seq::lazy_from_chain(env, ChainDesc::from_source(ChainSource::Repeat { item, remaining }))
}

fn map(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [f] => {
            let def = lookup_self(env, "map")?;
            partial(env, def, &[*f])
        }
        [f, coll] => seq::extend_chain(env, *coll, ChainOp::Map(*f)),
        _ => Err(error::arity_error(env, "map", args.len())),
    }
}

fn mapv(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "mapv", args, 2)?;
    let scope = env.roots();
    let mapped = scope.keep(map(env, args)?);
    let items = seq::to_vec(env, &scope, mapped)?;
    env.alloc(ObjVector::new(items))
}

fn filter(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [p] => {
            let def = lookup_self(env, "filter")?;
            partial(env, def, &[*p])
        }
        [p, coll] => seq::extend_chain(env, *coll, ChainOp::Filter(*p)),
        _ => Err(error::arity_error(env, "filter", args.len())),
    }
}

fn remove(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [p] => {
            let def = lookup_self(env, "remove")?;
            partial(env, def, &[*p])
        }
        [p, coll] => seq::extend_chain(env, *coll, ChainOp::Remove(*p)),
        _ => Err(error::arity_error(env, "remove", args.len())),
    }
}

fn take(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [n] => {
            let def = lookup_self(env, "take")?;
            partial(env, def, &[*n])
        }
        [n, coll] => {
            let n = super::int_arg(env, "take", *n)?;
            seq::extend_chain(env, *coll, ChainOp::Take(n.max(0)))
        }
        _ => Err(error::arity_error(env, "take", args.len())),
    }
}

fn drop_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [n] => {
            let def = lookup_self(env, "drop")?;
            partial(env, def, &[*n])
        }
        [n, coll] => {
            let n = super::int_arg(env, "drop", *n)?;
            seq::extend_chain(env, *coll, ChainOp::Drop(n.max(0)))
        }
        _ => Err(error::arity_error(env, "drop", args.len())),
    }
}

/// The curried arities need the builtin's own value; resolve it through the
/// core var rather than re-leaking a definition per call.
fn lookup_self(env: &Env, name: &str) -> Result<Value, Value> {
    env.resolve_var(Some(crate::env::CORE_NS), name)
        .and_then(|var| env.var_value(var))
        .ok_or_else(|| error::raise(env, ErrorKind::Internal, format!("builtin {name} missing")))
}

fn reduce(env: &Env, args: &[Value]) -> Result<Value, Value> {
    let (f, init, coll) = match args {
        [f, coll] => {
            // No init: first element seeds, empty coll calls (f).
            let scope = env.roots();
            let s = scope.keep(seq::seq(env, *coll)?);
            if s.is_nil() {
                return bridge::call_fn(env, *f, &[]);
            }
            let head = scope.keep(seq::seq_first(env, s)?);
            let tail = scope.keep(seq::seq_rest(env, s)?);
            return reduce(env, &[*f, head, tail]);
        }
        [f, init, coll] => (*f, *init, *coll),
        _ => return Err(error::arity_error(env, "reduce", args.len())),
    };
    seq::fold(env, coll, init, &mut |env, acc, item| bridge::call_fn(env, f, &[acc, item]))
}

/// `(reduce-kv f init m)`: fold map entries as `(f acc k v)`, vectors as
/// `(f acc index item)`.
fn reduce_kv(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "reduce-kv", args, 3)?;
    let (f, init, coll) = (args[0], args[1], args[2]);
    let scope = env.roots();
    let acc_slot = scope.slot(init);
    let mut acc = init;
    let entries: Vec<(Value, Value)> = match coll.heap_tag() {
        Some(HeapTag::ArrayMap | HeapTag::HashMap) => {
            crate::collections::map_entries_of(coll).to_vec()
        }
        Some(HeapTag::Vector) => ObjVector::of(coll)
            .items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::from_i64(i as i64), *v))
            .collect(),
        _ => return Err(error::type_error(env, "map or vector", coll)),
    };
    for (k, v) in entries {
        env.safe_point();
        acc = bridge::call_fn(env, f, &[acc, k, v])?;
        if seq::is_reduced(acc) {
            return Ok(crate::heap::ObjReduced::of(acc).value);
        }
        acc_slot.set(acc);
    }
    Ok(acc)
}

fn reduced(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "reduced", args, 1)?;
    seq::make_reduced(env, args[0])
}

fn reduced_p(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "reduced?", args, 1)?;
    Ok(Value::bool(seq::is_reduced(args[0])))
}

fn apply(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "apply", args, 2)?;
    bridge::apply_fn(env, args[0], &args[1..])
}

/// Eager concatenation. Infinite heads are the caller's lookout; the lazy
/// pipeline ops cover the streaming cases.
fn concat(env: &Env, args: &[Value]) -> Result<Value, Value> {
    let scope = env.roots();
    let mut all = Vec::new();
    for coll in args {
        all.extend(seq::to_vec(env, &scope, *coll)?);
    }
    seq::list_from(env, &all)
}

fn reverse(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "reverse", args, 1)?;
    let scope = env.roots();
    let mut items = seq::to_vec(env, &scope, args[0])?;
    items.reverse();
    seq::list_from(env, &items)
}

fn sorted(env: &Env, items: &mut [Value], key: Option<Value>) -> Result<(), Value> {
    let scope = env.roots();
    let mut err: Option<Value> = None;
    // Precompute sort keys when a key fn is given, so the comparator itself
    // stays pure.
    let keys: Option<Vec<Value>> = match key {
        Some(f) => {
            let mut ks = Vec::with_capacity(items.len());
            for item in items.iter() {
                ks.push(scope.keep(bridge::call_fn(env, f, &[*item])?));
            }
            Some(ks)
        }
        None => None,
    };
    let mut indexed: Vec<(usize, Value)> = items.iter().copied().enumerate().collect();
    indexed.sort_by(|(i, a), (j, b)| {
        if err.is_some() {
            return std::cmp::Ordering::Equal;
        }
        let (x, y) = match &keys {
            Some(ks) => (ks[*i], ks[*j]),
            None => (*a, *b),
        };
        match super::misc::compare_values(env, x, y) {
            Ok(ord) => ord,
            Err(e) => {
                err = Some(e);
                std::cmp::Ordering::Equal
            }
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    for (slot, (_, v)) in items.iter_mut().zip(indexed) {
        *slot = v;
    }
    Ok(())
}

fn sort(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "sort", args, 1)?;
    let scope = env.roots();
    let mut items = seq::to_vec(env, &scope, args[0])?;
    sorted(env, &mut items, None)?;
    seq::list_from(env, &items)
}

fn sort_by(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "sort-by", args, 2)?;
    let scope = env.roots();
    let mut items = seq::to_vec(env, &scope, args[1])?;
    sorted(env, &mut items, Some(args[0]))?;
    seq::list_from(env, &items)
}

fn distinct(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "distinct", args, 1)?;
    let scope = env.roots();
    let items = seq::to_vec(env, &scope, args[0])?;
    let mut out: Vec<Value> = Vec::new();
    'outer: for item in items {
        for seen in &out {
            if crate::eq::equiv(env, *seen, item)? {
                continue 'outer;
            }
        }
        out.push(item);
    }
    seq::list_from(env, &out)
}

fn interpose(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "interpose", args, 2)?;
    let scope = env.roots();
    let items = seq::to_vec(env, &scope, args[1])?;
    let mut out = Vec::with_capacity(items.len() * 2);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(args[0]);
        }
        out.push(*item);
    }
    seq::list_from(env, &out)
}

fn partition(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "partition", args, 2)?;
    let n = super::int_arg(env, "partition", args[0])?;
    if n <= 0 {
        return Err(error::raise(env, ErrorKind::Value, "partition size must be positive"));
    }
    let scope = env.roots();
    let items = seq::to_vec(env, &scope, args[1])?;
    let mut groups = Vec::new();
    for chunk in items.chunks(n as usize) {
        if chunk.len() == n as usize {
            groups.push(scope.keep(seq::list_from(env, chunk)?));
        }
    }
    seq::list_from(env, &groups)
}

fn doall(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "doall", args, 1)?;
    let scope = env.roots();
    let _ = seq::to_vec(env, &scope, args[0])?;
    Ok(args[0])
}

fn dorun(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "dorun", args, 1)?;
    let scope = env.roots();
    let _ = seq::to_vec(env, &scope, args[0])?;
    Ok(Value::NIL)
}

fn last(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "last", args, 1)?;
    seq::fold(env, args[0], Value::NIL, &mut |_, _, item| Ok(item))
}

fn realized_p(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "realized?", args, 1)?;
    Ok(Value::bool(match args[0].heap_tag() {
        Some(HeapTag::LazySeq) => crate::heap::ObjLazySeq::of(args[0])
            .state
            .lock()
            .expect("lazy poisoned")
            .realized
            .is_some(),
        Some(HeapTag::Delay) => crate::heap::ObjDelay::of(args[0])
            .state
            .lock()
            .expect("delay poisoned")
            .value
            .is_some(),
        Some(HeapTag::Future) => crate::concurrency::future_realized(args[0]),
        Some(HeapTag::Promise) => crate::concurrency::promise_realized(args[0]),
        _ => true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        crate::builtins::test_env()
    }

    #[test]
    fn range_take_filter_reduce_pipeline() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let r = scope.keep(range(&env, &[Value::int(100)]).unwrap());
        // (reduce + 0 (range 100)) => 4950
        let plus = env.var_value(env.resolve_var(Some("lyra.core"), "+").unwrap()).unwrap();
        let total = reduce(&env, &[plus, Value::int(0), r]).unwrap();
        assert_eq!(total.as_i64(), 4950);
    }

    #[test]
    fn sort_orders_numbers() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let l = scope.keep(
            seq::list_from(&env, &[Value::int(3), Value::int(1), Value::int(2)]).unwrap(),
        );
        let sorted = scope.keep(sort(&env, &[l]).unwrap());
        assert_eq!(crate::printer::pr_str(&env, sorted).unwrap(), "(1 2 3)");
    }

    #[test]
    fn reduce_without_init_seeds_from_head() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let plus = env.var_value(env.resolve_var(Some("lyra.core"), "+").unwrap()).unwrap();
        let l = scope.keep(
            seq::list_from(&env, &[Value::int(1), Value::int(2), Value::int(3)]).unwrap(),
        );
        assert_eq!(reduce(&env, &[plus, l]).unwrap().as_i64(), 6);
        let empty = scope.keep(seq::list_from(&env, &[]).unwrap());
        assert_eq!(reduce(&env, &[plus, empty]).unwrap().as_i64(), 0, "(+) identity");
    }

    #[test]
    fn partition_drops_incomplete_tail() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let r = scope.keep(range(&env, &[Value::int(5)]).unwrap());
        let parts = scope.keep(partition(&env, &[Value::int(2), r]).unwrap());
        assert_eq!(crate::printer::pr_str(&env, parts).unwrap(), "((0 1) (2 3))");
    }
}
