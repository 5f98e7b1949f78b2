//! Value Equality
//!
//! Structural equality with numeric bridging: `1` equals `1.0`, NaN equals
//! nothing (itself included). Pointer-interned kinds (symbols, keywords) and
//! all immediate tags compare by bits. Sequential collections of different
//! concrete kinds (list vs vector vs realized lazy seq) are equal when their
//! element sequences are; maps only equal maps, sets only equal sets.
//!
//! Inspecting a lazy sequence's structure forces it, so equality can throw
//! (a thunk may throw), hence the `Result`.

use crate::env::Env;
use crate::heap::{ObjArrayMap, ObjHashMap, ObjHashSet, ObjRegex, ObjStr};
use crate::seq;
use crate::value::{HeapTag, Tag, Value};

fn num_value(v: Value) -> Option<f64> {
    match v.tag() {
        Tag::Int => Some(v.as_i64() as f64),
        Tag::Float => Some(v.as_f64()),
        _ => None,
    }
}

fn is_sequential(v: Value) -> bool {
    matches!(
        v.heap_tag(),
        Some(
            HeapTag::Cons
                | HeapTag::EmptyList
                | HeapTag::Vector
                | HeapTag::LazySeq
                | HeapTag::ChunkedCons
        )
    )
}

fn is_map(v: Value) -> bool {
    matches!(v.heap_tag(), Some(HeapTag::ArrayMap | HeapTag::HashMap))
}

pub fn map_entries(v: Value) -> &'static [(Value, Value)] {
    match v.heap_tag() {
        Some(HeapTag::ArrayMap) => &ObjArrayMap::of(v).entries,
        Some(HeapTag::HashMap) => &ObjHashMap::of(v).entries,
        _ => &[],
    }
}

/// Structural equality.
pub fn equiv(env: &Env, a: Value, b: Value) -> Result<bool, Value> {
    // Numbers bridge int/float and exclude NaN before the bit check.
    if let (Some(x), Some(y)) = (num_value(a), num_value(b)) {
        return Ok(x == y);
    }
    if a.identical(b) {
        return Ok(true);
    }
    match (a.heap_tag(), b.heap_tag()) {
        (Some(HeapTag::Str), Some(HeapTag::Str)) => {
            Ok(ObjStr::of(a).data == ObjStr::of(b).data)
        }
        (Some(HeapTag::Regex), Some(HeapTag::Regex)) => {
            Ok(ObjRegex::of(a).source == ObjRegex::of(b).source)
        }
        _ if is_sequential(a) && is_sequential(b) => seq_equiv(env, a, b),
        _ if is_map(a) && is_map(b) => map_equiv(env, a, b),
        (Some(HeapTag::HashSet), Some(HeapTag::HashSet)) => set_equiv(env, a, b),
        _ => Ok(false),
    }
}

fn seq_equiv(env: &Env, a: Value, b: Value) -> Result<bool, Value> {
    let scope = env.roots();
    let sa = scope.slot(a);
    let sb = scope.slot(b);
    let mut x = seq::seq(env, a)?;
    sa.set(x);
    let mut y = seq::seq(env, b)?;
    sb.set(y);
    loop {
        env.safe_point();
        match (x.is_nil(), y.is_nil()) {
            (true, true) => return Ok(true),
            (true, false) | (false, true) => return Ok(false),
            (false, false) => {}
        }
        let ea = seq::seq_first(env, x)?;
        let eb = seq::seq_first(env, y)?;
        if !equiv(env, ea, eb)? {
            return Ok(false);
        }
        let rx = seq::seq_rest(env, x)?;
        sa.set(rx);
        let ry = seq::seq_rest(env, y)?;
        sb.set(ry);
        x = seq::seq(env, rx)?;
        sa.set(x);
        y = seq::seq(env, ry)?;
        sb.set(y);
    }
}

fn map_equiv(env: &Env, a: Value, b: Value) -> Result<bool, Value> {
    let ea = map_entries(a);
    let eb = map_entries(b);
    if ea.len() != eb.len() {
        return Ok(false);
    }
    'outer: for (k, v) in ea {
        for (k2, v2) in eb {
            if equiv(env, *k, *k2)? {
                if equiv(env, *v, *v2)? {
                    continue 'outer;
                }
                return Ok(false);
            }
        }
        return Ok(false);
    }
    Ok(true)
}

fn set_equiv(env: &Env, a: Value, b: Value) -> Result<bool, Value> {
    let ea = &ObjHashSet::of(a).entries;
    let eb = &ObjHashSet::of(b).entries;
    if ea.len() != eb.len() {
        return Ok(false);
    }
    'outer: for x in ea.iter() {
        for y in eb.iter() {
            if equiv(env, *x, *y)? {
                continue 'outer;
            }
        }
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjVector;
    use crate::seq::list_from;

    fn env() -> std::sync::Arc<Env> {
        Env::new()
    }

    #[test]
    fn numeric_bridging() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert!(equiv(&env, Value::int(1), Value::float(1.0)).unwrap());
        assert!(equiv(&env, Value::float(2.5), Value::float(2.5)).unwrap());
        assert!(!equiv(&env, Value::int(1), Value::int(2)).unwrap());
    }

    #[test]
    fn nan_never_equal() {
        let env = env();
        let _m = env.gc.register_mutator();
        let nan = Value::float(f64::NAN);
        assert!(!equiv(&env, nan, nan).unwrap());
    }

    #[test]
    fn strings_by_content() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let a = scope.keep(env.alloc_str("abc").unwrap());
        let b = scope.keep(env.alloc_str("abc").unwrap());
        let c = scope.keep(env.alloc_str("abd").unwrap());
        assert!(equiv(&env, a, b).unwrap());
        assert!(!equiv(&env, a, c).unwrap());
    }

    #[test]
    fn list_equals_vector_with_same_elements() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let l = scope.keep(list_from(&env, &[Value::int(1), Value::int(2)]).unwrap());
        let v = scope.keep(env.alloc(ObjVector::new(vec![Value::int(1), Value::int(2)])).unwrap());
        assert!(equiv(&env, l, v).unwrap());
        let w = scope.keep(env.alloc(ObjVector::new(vec![Value::int(1)])).unwrap());
        assert!(!equiv(&env, l, w).unwrap());
    }

    #[test]
    fn nil_not_equal_empty_list_elements() {
        let env = env();
        let _m = env.gc.register_mutator();
        // () = [] holds; nil = () does not.
        let scope = env.roots();
        let empty_vec = scope.keep(env.alloc(ObjVector::new(vec![])).unwrap());
        assert!(equiv(&env, env.empty_list, empty_vec).unwrap());
        assert!(!equiv(&env, Value::NIL, env.empty_list).unwrap());
    }

    #[test]
    fn symbols_by_identity() {
        let env = env();
        let _m = env.gc.register_mutator();
        let a = env.symbol("x");
        let b = env.symbol("x");
        let c = env.symbol("y");
        assert!(equiv(&env, a, b).unwrap());
        assert!(!equiv(&env, a, c).unwrap());
    }
}
