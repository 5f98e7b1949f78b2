//! Collection builtins: constructors, access, persistent updates,
//! transients, and `into`.

use super::{Registrar, exact_arity, min_arity};
use crate::collections;
use crate::env::Env;
use crate::error::{self, ErrorKind};
use crate::heap::{
    ObjHashSet, ObjHeader, ObjStr, ObjTransientMap, ObjTransientSet, ObjTransientVector,
    ObjVector, TransientMapInner, TransientSetInner,
};
use crate::seq;
use crate::value::{HeapTag, Tag, Value};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

pub(super) fn register(reg: &mut Registrar<'_>) {
    reg.def("vector", vector);
    reg.def("vec", vec_coerce);
    reg.def("list", list);
    reg.def("hash-map", hash_map);
    reg.def("hash-set", hash_set);
    reg.def("set", set_coerce);
    reg.def("count", count);
    reg.def("nth", nth);
    reg.def("get", get);
    reg.def("get-in", get_in);
    reg.def("assoc", assoc);
    reg.def("dissoc", dissoc);
    reg.def("conj", conj);
    reg.def("disj", disj);
    reg.def("contains?", contains_p);
    reg.def("empty?", empty_p);
    reg.def("keys", keys);
    reg.def("vals", vals);
    reg.def("peek", peek);
    reg.def("pop", pop);
    reg.def("subvec", subvec);
    reg.def("into", into);
    reg.def("transient", transient);
    reg.def("persistent!", persistent);
    reg.def("conj!", conj_bang);
    reg.def("assoc!", assoc_bang);
}

fn vector(env: &Env, args: &[Value]) -> Result<Value, Value> {
    env.alloc(ObjVector::new(args.to_vec()))
}

fn vec_coerce(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "vec", args, 1)?;
    if args[0].heap_tag() == Some(HeapTag::Vector) {
        return Ok(args[0]);
    }
    let scope = env.roots();
    let items = seq::to_vec(env, &scope, args[0])?;
    env.alloc(ObjVector::new(items))
}

fn list(env: &Env, args: &[Value]) -> Result<Value, Value> {
    seq::list_from(env, args)
}

fn hash_map(env: &Env, args: &[Value]) -> Result<Value, Value> {
    if args.len() % 2 != 0 {
        return Err(error::raise(env, ErrorKind::Value, "hash-map expects key-value pairs"));
    }
    let pairs: Vec<(Value, Value)> = args.chunks(2).map(|c| (c[0], c[1])).collect();
    collections::map_from_pairs(env, &pairs)
}

fn hash_set(env: &Env, args: &[Value]) -> Result<Value, Value> {
    collections::set_from(env, args)
}

fn set_coerce(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "set", args, 1)?;
    let scope = env.roots();
    let items = seq::to_vec(env, &scope, args[0])?;
    collections::set_from(env, &items)
}

fn count(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "count", args, 1)?;
    Ok(Value::from_i64(seq::count(env, args[0])?))
}

fn nth(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "nth", args, 2)?;
    let idx = super::int_arg(env, "nth", args[1])?;
    seq::nth(env, args[0], idx, args.get(2).copied())
}

fn get(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "get", args, 2)?;
    collections::get(env, args[0], args[1], args.get(2).copied().unwrap_or(Value::NIL))
}

fn get_in(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "get-in", args, 2)?;
    let default = args.get(2).copied().unwrap_or(Value::NIL);
    let scope = env.roots();
    let path = seq::to_vec(env, &scope, args[1])?;
    let mut cur = args[0];
    for k in path {
        cur = scope.keep(collections::get(env, cur, k, Value::NIL)?);
        if cur.is_nil() {
            return Ok(default);
        }
    }
    Ok(cur)
}

fn assoc(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "assoc", args, 3)?;
    if (args.len() - 1) % 2 != 0 {
        return Err(error::raise(env, ErrorKind::Value, "assoc expects key-value pairs"));
    }
    let scope = env.roots();
    let mut coll = args[0];
    for pair in args[1..].chunks(2) {
        coll = scope.keep(match coll.tag() {
            Tag::Nil => collections::map_from_pairs(env, &[(pair[0], pair[1])])?,
            Tag::Heap(HeapTag::Vector) => {
                let idx = super::int_arg(env, "assoc", pair[0])?;
                collections::vec_assoc(env, coll, idx, pair[1])?
            }
            Tag::Heap(HeapTag::ArrayMap | HeapTag::HashMap) => {
                collections::map_assoc(env, coll, pair[0], pair[1])?
            }
            _ => return Err(error::type_error(env, "associative collection", coll)),
        });
    }
    Ok(coll)
}

fn dissoc(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "dissoc", args, 1)?;
    if !collections::is_map(args[0]) {
        return Err(error::type_error(env, "map", args[0]));
    }
    let scope = env.roots();
    let mut m = args[0];
    for k in &args[1..] {
        m = scope.keep(collections::map_dissoc(env, m, *k)?);
    }
    Ok(m)
}

fn conj(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "conj", args, 1)?;
    let scope = env.roots();
    let mut coll = args[0];
    for item in &args[1..] {
        coll = scope.keep(collections::conj(env, coll, *item)?);
    }
    Ok(coll)
}

fn disj(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "disj", args, 1)?;
    if args[0].heap_tag() != Some(HeapTag::HashSet) {
        return Err(error::type_error(env, "set", args[0]));
    }
    let scope = env.roots();
    let mut s = args[0];
    for item in &args[1..] {
        s = scope.keep(collections::set_disj(env, s, *item)?);
    }
    Ok(s)
}

fn contains_p(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "contains?", args, 2)?;
    let coll = args[0];
    let k = args[1];
    Ok(Value::bool(match coll.tag() {
        Tag::Nil => false,
        Tag::Heap(HeapTag::ArrayMap | HeapTag::HashMap) => {
            collections::map_contains(env, coll, k)?
        }
        Tag::Heap(HeapTag::HashSet) => collections::set_contains(env, coll, k)?,
        Tag::Heap(HeapTag::Vector) => {
            k.is_int() && k.as_i64() >= 0 && (k.as_i64() as usize) < ObjVector::of(coll).items.len()
        }
        Tag::Heap(HeapTag::Str) => {
            k.is_int()
                && k.as_i64() >= 0
                && (k.as_i64() as usize) < ObjStr::of(coll).data.chars().count()
        }
        _ => return Err(error::type_error(env, "associative collection", coll)),
    }))
}

fn empty_p(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "empty?", args, 1)?;
    Ok(Value::bool(seq::seq(env, args[0])?.is_nil()))
}

fn keys(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "keys", args, 1)?;
    let entries = collections::map_entries_of(args[0]);
    let ks: Vec<Value> = entries.iter().map(|(k, _)| *k).collect();
    seq::list_from(env, &ks)
}

fn vals(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "vals", args, 1)?;
    let entries = collections::map_entries_of(args[0]);
    let vs: Vec<Value> = entries.iter().map(|(_, v)| *v).collect();
    seq::list_from(env, &vs)
}

fn peek(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "peek", args, 1)?;
    match args[0].tag() {
        Tag::Heap(HeapTag::Vector) => {
            Ok(ObjVector::of(args[0]).items.last().copied().unwrap_or(Value::NIL))
        }
        _ => seq::first(env, args[0]),
    }
}

fn pop(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "pop", args, 1)?;
    match args[0].tag() {
        Tag::Heap(HeapTag::Vector) => {
            let items = &ObjVector::of(args[0]).items;
            if items.is_empty() {
                return Err(error::raise(env, ErrorKind::IllegalState, "pop of empty vector"));
            }
            env.alloc(ObjVector::new(items[..items.len() - 1].to_vec()))
        }
        _ => seq::rest(env, args[0]),
    }
}

fn subvec(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "subvec", args, 2)?;
    if args[0].heap_tag() != Some(HeapTag::Vector) {
        return Err(error::type_error(env, "vector", args[0]));
    }
    let items = &ObjVector::of(args[0]).items;
    let start = super::int_arg(env, "subvec", args[1])? as usize;
    let end = match args.get(2) {
        Some(v) => super::int_arg(env, "subvec", *v)? as usize,
        None => items.len(),
    };
    if start > end || end > items.len() {
        return Err(error::raise(
            env,
            ErrorKind::Index,
            format!("subvec range {start}..{end} out of bounds"),
        ));
    }
    env.alloc(ObjVector::new(items[start..end].to_vec()))
}

/// `(into to from)` and the transducer-style `(into to xf from)` where `xf`
/// is a curried seq transformer. Vector/map/set targets fill through a
/// transient.
fn into(env: &Env, args: &[Value]) -> Result<Value, Value> {
    let (to, from) = match args {
        [to, from] => (*to, *from),
        [to, xf, from] => {
            let scope = env.roots();
            let transformed = scope.keep(crate::bridge::call_fn(env, *xf, &[*from])?);
            return into(env, &[*to, transformed]);
        }
        _ => return Err(error::arity_error(env, "into", args.len())),
    };
    let scope = env.roots();
    match to.tag() {
        Tag::Heap(HeapTag::Vector) => {
            let t = scope.keep(transient(env, &[to])?);
            seq::fold(env, from, Value::NIL, &mut |env, _, item| {
                conj_bang(env, &[t, item]).map(|_| Value::NIL)
            })?;
            persistent(env, &[t])
        }
        Tag::Heap(HeapTag::ArrayMap | HeapTag::HashMap) => {
            let t = scope.keep(transient(env, &[to])?);
            seq::fold(env, from, Value::NIL, &mut |env, _, item| {
                conj_bang(env, &[t, item]).map(|_| Value::NIL)
            })?;
            persistent(env, &[t])
        }
        Tag::Heap(HeapTag::HashSet) => {
            let t = scope.keep(transient(env, &[to])?);
            seq::fold(env, from, Value::NIL, &mut |env, _, item| {
                conj_bang(env, &[t, item]).map(|_| Value::NIL)
            })?;
            persistent(env, &[t])
        }
        _ => {
            let slot = scope.slot(to);
            seq::fold(env, from, to, &mut |env, acc, item| {
                let next = collections::conj(env, acc, item)?;
                slot.set(next);
                Ok(next)
            })
        }
    }
}

// =============================================================================
// Transients
// =============================================================================

fn owner_check(env: &Env, owner: std::thread::ThreadId, editable: &AtomicBool) -> Result<(), Value> {
    if owner != std::thread::current().id() {
        return Err(error::raise(
            env,
            ErrorKind::IllegalState,
            "transient used by non-owner thread",
        ));
    }
    if !editable.load(Ordering::Acquire) {
        return Err(error::raise(
            env,
            ErrorKind::IllegalState,
            "transient used after persistent!",
        ));
    }
    Ok(())
}

fn transient(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "transient", args, 1)?;
    let owner = std::thread::current().id();
    match args[0].tag() {
        Tag::Heap(HeapTag::Vector) => env.alloc(ObjTransientVector {
            hdr: ObjHeader::new(HeapTag::TransientVector),
            owner,
            items: Mutex::new(ObjVector::of(args[0]).items.to_vec()),
            editable: AtomicBool::new(true),
        }),
        Tag::Heap(HeapTag::ArrayMap | HeapTag::HashMap) => {
            let entries = collections::map_entries_of(args[0]).to_vec();
            let mut index = std::collections::HashMap::new();
            for (i, (k, _)) in entries.iter().enumerate() {
                index
                    .entry(crate::hashing::hash_value(env, *k)?)
                    .or_insert_with(Vec::new)
                    .push(i as u32);
            }
            env.alloc(ObjTransientMap {
                hdr: ObjHeader::new(HeapTag::TransientMap),
                owner,
                inner: Mutex::new(TransientMapInner { entries, index }),
                editable: AtomicBool::new(true),
            })
        }
        Tag::Heap(HeapTag::HashSet) => {
            let obj = ObjHashSet::of(args[0]);
            env.alloc(ObjTransientSet {
                hdr: ObjHeader::new(HeapTag::TransientSet),
                owner,
                inner: Mutex::new(TransientSetInner {
                    entries: obj.entries.clone(),
                    index: obj.index.clone(),
                }),
                editable: AtomicBool::new(true),
            })
        }
        _ => Err(error::type_error(env, "vector, map, or set", args[0])),
    }
}

fn persistent(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "persistent!", args, 1)?;
    match args[0].tag() {
        Tag::Heap(HeapTag::TransientVector) => {
            let t = ObjTransientVector::of(args[0]);
            owner_check(env, t.owner, &t.editable)?;
            t.editable.store(false, Ordering::Release);
            let items = t.items.lock().expect("transient poisoned").clone();
            env.alloc(ObjVector::new(items))
        }
        Tag::Heap(HeapTag::TransientMap) => {
            let t = ObjTransientMap::of(args[0]);
            owner_check(env, t.owner, &t.editable)?;
            t.editable.store(false, Ordering::Release);
            let entries = t.inner.lock().expect("transient poisoned").entries.clone();
            let pairs: Vec<(Value, Value)> = entries;
            collections::map_from_pairs(env, &pairs)
        }
        Tag::Heap(HeapTag::TransientSet) => {
            let t = ObjTransientSet::of(args[0]);
            owner_check(env, t.owner, &t.editable)?;
            t.editable.store(false, Ordering::Release);
            let entries = t.inner.lock().expect("transient poisoned").entries.clone();
            collections::set_from(env, &entries)
        }
        _ => Err(error::type_error(env, "transient", args[0])),
    }
}

fn conj_bang(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "conj!", args, 2)?;
    match args[0].tag() {
        Tag::Heap(HeapTag::TransientVector) => {
            let t = ObjTransientVector::of(args[0]);
            owner_check(env, t.owner, &t.editable)?;
            t.items.lock().expect("transient poisoned").push(args[1]);
            Ok(args[0])
        }
        Tag::Heap(HeapTag::TransientMap) => {
            // Entry must be a [k v] pair vector.
            if args[1].heap_tag() != Some(HeapTag::Vector)
                || ObjVector::of(args[1]).items.len() != 2
            {
                return Err(error::type_error(env, "[key value] pair", args[1]));
            }
            let pair = &ObjVector::of(args[1]).items;
            assoc_bang(env, &[args[0], pair[0], pair[1]])
        }
        Tag::Heap(HeapTag::TransientSet) => {
            let t = ObjTransientSet::of(args[0]);
            owner_check(env, t.owner, &t.editable)?;
            let h = crate::hashing::hash_value(env, args[1])?;
            // Equality may allocate, and a collection traces this transient
            // under its own lock: compare against a snapshot, mutate after.
            let candidates: Vec<Value> = {
                let inner = t.inner.lock().expect("transient poisoned");
                match inner.index.get(&h) {
                    Some(bucket) => {
                        bucket.iter().map(|&i| inner.entries[i as usize]).collect()
                    }
                    None => Vec::new(),
                }
            };
            for existing in candidates {
                if crate::eq::equiv(env, existing, args[1])? {
                    return Ok(args[0]);
                }
            }
            let mut inner = t.inner.lock().expect("transient poisoned");
            let i = inner.entries.len() as u32;
            inner.entries.push(args[1]);
            inner.index.entry(h).or_default().push(i);
            Ok(args[0])
        }
        _ => Err(error::type_error(env, "transient", args[0])),
    }
}

fn assoc_bang(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "assoc!", args, 3)?;
    match args[0].tag() {
        Tag::Heap(HeapTag::TransientMap) => {
            let t = ObjTransientMap::of(args[0]);
            owner_check(env, t.owner, &t.editable)?;
            let h = crate::hashing::hash_value(env, args[1])?;
            // Snapshot the candidate keys before comparing; equality may
            // allocate while a collection wants this lock for tracing.
            let candidates: Vec<(u32, Value)> = {
                let inner = t.inner.lock().expect("transient poisoned");
                match inner.index.get(&h) {
                    Some(bucket) => bucket
                        .iter()
                        .map(|&i| (i, inner.entries[i as usize].0))
                        .collect(),
                    None => Vec::new(),
                }
            };
            for (i, key) in candidates {
                if crate::eq::equiv(env, key, args[1])? {
                    let mut inner = t.inner.lock().expect("transient poisoned");
                    inner.entries[i as usize].1 = args[2];
                    return Ok(args[0]);
                }
            }
            let mut inner = t.inner.lock().expect("transient poisoned");
            let i = inner.entries.len() as u32;
            inner.entries.push((args[1], args[2]));
            inner.index.entry(h).or_default().push(i);
            Ok(args[0])
        }
        Tag::Heap(HeapTag::TransientVector) => {
            let t = ObjTransientVector::of(args[0]);
            owner_check(env, t.owner, &t.editable)?;
            let idx = super::int_arg(env, "assoc!", args[1])?;
            let mut items = t.items.lock().expect("transient poisoned");
            if idx < 0 || idx as usize > items.len() {
                return Err(error::raise(
                    env,
                    ErrorKind::Index,
                    format!("index {idx} out of bounds"),
                ));
            }
            if idx as usize == items.len() {
                items.push(args[2]);
            } else {
                items[idx as usize] = args[2];
            }
            Ok(args[0])
        }
        _ => Err(error::type_error(env, "transient", args[0])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        Env::new()
    }

    #[test]
    fn transient_roundtrip() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let v = scope.keep(vector(&env, &[Value::int(1)]).unwrap());
        let t = scope.keep(transient(&env, &[v]).unwrap());
        conj_bang(&env, &[t, Value::int(2)]).unwrap();
        conj_bang(&env, &[t, Value::int(3)]).unwrap();
        let out = scope.keep(persistent(&env, &[t]).unwrap());
        assert_eq!(crate::printer::pr_str(&env, out).unwrap(), "[1 2 3]");
        // Use-after-persistent! is illegal state.
        assert!(conj_bang(&env, &[t, Value::int(4)]).is_err());
    }

    #[test]
    fn transient_rejects_foreign_thread() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let v = scope.keep(vector(&env, &[]).unwrap());
        let t = scope.keep(transient(&env, &[v]).unwrap());
        let env2 = env.clone();
        let t_bits = t.to_bits();
        let failed = std::thread::scope(|s| {
            s.spawn(move || {
                let t = Value::from_bits(t_bits);
                conj_bang(&env2, &[t, Value::int(1)]).is_err()
            })
            .join()
            .unwrap()
        });
        assert!(failed, "cross-thread transient mutation must signal illegal-state");
    }

    #[test]
    fn into_vector_uses_transient_path() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let to = scope.keep(vector(&env, &[]).unwrap());
        let from = scope.keep(seq::list_from(&env, &[Value::int(1), Value::int(2)]).unwrap());
        let out = scope.keep(into(&env, &[to, from]).unwrap());
        assert_eq!(crate::printer::pr_str(&env, out).unwrap(), "[1 2]");
    }

    #[test]
    fn into_map_takes_pairs() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let to = scope.keep(hash_map(&env, &[]).unwrap());
        let pair = scope.keep(vector(&env, &[Value::int(0), Value::int(0)]).unwrap());
        let from = scope.keep(seq::list_from(&env, &[pair]).unwrap());
        let out = scope.keep(into(&env, &[to, from]).unwrap());
        assert_eq!(crate::printer::pr_str(&env, out).unwrap(), "{0 0}");
    }
}
