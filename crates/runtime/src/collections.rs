//! Persistent Collection Operations
//!
//! Behavioral layer over the map/set/vector heap objects. The structural-
//! sharing tree algorithms of the reference collections are out of scope;
//! these are copy-on-write implementations with the same observable
//! semantics: immutability, insertion-order iteration for maps and sets,
//! array-map promotion to hash-map past eight entries, and hash-index
//! lookups that go through the runtime's own hash/equality functions.

use std::collections::HashMap;

use crate::env::Env;
use crate::eq::equiv;
use crate::error::{self, ErrorKind};
use crate::hashing::hash_value;
use crate::heap::{
    ARRAY_MAP_MAX, ObjArrayMap, ObjHashMap, ObjHashSet, ObjHeader, ObjStr, ObjVector,
};
use crate::value::{HeapTag, Tag, Value};

// =============================================================================
// Maps
// =============================================================================

fn hash_index(env: &Env, entries: &[(Value, Value)]) -> Result<HashMap<u32, Vec<u32>>, Value> {
    let mut index: HashMap<u32, Vec<u32>> = HashMap::with_capacity(entries.len());
    for (i, (k, _)) in entries.iter().enumerate() {
        index.entry(hash_value(env, *k)?).or_default().push(i as u32);
    }
    Ok(index)
}

fn alloc_map(env: &Env, entries: Vec<(Value, Value)>) -> Result<Value, Value> {
    if entries.len() <= ARRAY_MAP_MAX {
        env.alloc(ObjArrayMap::new(entries))
    } else {
        let index = hash_index(env, &entries)?;
        env.alloc(ObjHashMap {
            hdr: ObjHeader::new(HeapTag::HashMap),
            entries,
            index,
            meta: Value::NIL,
        })
    }
}

/// Build a map from a flat pair list, later keys winning (`hash-map`).
pub fn map_from_pairs(env: &Env, pairs: &[(Value, Value)]) -> Result<Value, Value> {
    let mut entries: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
    'outer: for (k, v) in pairs {
        for slot in entries.iter_mut() {
            if equiv(env, slot.0, *k)? {
                slot.1 = *v;
                continue 'outer;
            }
        }
        entries.push((*k, *v));
    }
    alloc_map(env, entries)
}

/// Build a map from a literal, where a duplicate key is a value error.
pub fn map_literal(env: &Env, pairs: &[(Value, Value)]) -> Result<Value, Value> {
    for (i, (k, _)) in pairs.iter().enumerate() {
        for (k2, _) in &pairs[..i] {
            if equiv(env, *k, *k2)? {
                let repr = crate::printer::pr_str(env, *k)?;
                return Err(error::raise(
                    env,
                    ErrorKind::Value,
                    format!("duplicate key in map literal: {repr}"),
                ));
            }
        }
    }
    alloc_map(env, pairs.to_vec())
}

fn position(env: &Env, m: Value, k: Value) -> Result<Option<usize>, Value> {
    match m.heap_tag() {
        Some(HeapTag::ArrayMap) => {
            for (i, (key, _)) in ObjArrayMap::of(m).entries.iter().enumerate() {
                if equiv(env, *key, k)? {
                    return Ok(Some(i));
                }
            }
            Ok(None)
        }
        Some(HeapTag::HashMap) => {
            let obj = ObjHashMap::of(m);
            let h = hash_value(env, k)?;
            if let Some(bucket) = obj.index.get(&h) {
                for &i in bucket {
                    if equiv(env, obj.entries[i as usize].0, k)? {
                        return Ok(Some(i as usize));
                    }
                }
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

pub fn is_map(v: Value) -> bool {
    matches!(v.heap_tag(), Some(HeapTag::ArrayMap | HeapTag::HashMap))
}

pub fn map_entries_of(m: Value) -> &'static [(Value, Value)] {
    crate::eq::map_entries(m)
}

pub fn map_get(env: &Env, m: Value, k: Value) -> Result<Option<Value>, Value> {
    Ok(position(env, m, k)?.map(|i| map_entries_of(m)[i].1))
}

pub fn map_contains(env: &Env, m: Value, k: Value) -> Result<bool, Value> {
    Ok(position(env, m, k)?.is_some())
}

pub fn map_assoc(env: &Env, m: Value, k: Value, v: Value) -> Result<Value, Value> {
    let mut entries = map_entries_of(m).to_vec();
    match position(env, m, k)? {
        Some(i) => entries[i] = (k, v),
        None => entries.push((k, v)),
    }
    alloc_map(env, entries)
}

pub fn map_dissoc(env: &Env, m: Value, k: Value) -> Result<Value, Value> {
    let mut entries = map_entries_of(m).to_vec();
    match position(env, m, k)? {
        Some(i) => {
            entries.remove(i);
            alloc_map(env, entries)
        }
        None => Ok(m),
    }
}

// =============================================================================
// Sets
// =============================================================================

fn alloc_set(env: &Env, entries: Vec<Value>) -> Result<Value, Value> {
    let mut index: HashMap<u32, Vec<u32>> = HashMap::with_capacity(entries.len());
    for (i, e) in entries.iter().enumerate() {
        index.entry(hash_value(env, *e)?).or_default().push(i as u32);
    }
    env.alloc(ObjHashSet { hdr: ObjHeader::new(HeapTag::HashSet), entries, index, meta: Value::NIL })
}

/// Build a set, deduplicating (`hash-set`, `set`).
pub fn set_from(env: &Env, items: &[Value]) -> Result<Value, Value> {
    let mut entries: Vec<Value> = Vec::with_capacity(items.len());
    'outer: for item in items {
        for e in &entries {
            if equiv(env, *e, *item)? {
                continue 'outer;
            }
        }
        entries.push(*item);
    }
    alloc_set(env, entries)
}

/// Build a set from a literal, where a duplicate element is a value error.
pub fn set_literal(env: &Env, items: &[Value]) -> Result<Value, Value> {
    for (i, item) in items.iter().enumerate() {
        for other in &items[..i] {
            if equiv(env, *item, *other)? {
                let repr = crate::printer::pr_str(env, *item)?;
                return Err(error::raise(
                    env,
                    ErrorKind::Value,
                    format!("duplicate element in set literal: {repr}"),
                ));
            }
        }
    }
    alloc_set(env, items.to_vec())
}

pub fn set_contains(env: &Env, s: Value, v: Value) -> Result<bool, Value> {
    let obj = ObjHashSet::of(s);
    let h = hash_value(env, v)?;
    if let Some(bucket) = obj.index.get(&h) {
        for &i in bucket {
            if equiv(env, obj.entries[i as usize], v)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

pub fn set_conj(env: &Env, s: Value, v: Value) -> Result<Value, Value> {
    if set_contains(env, s, v)? {
        return Ok(s);
    }
    let mut entries = ObjHashSet::of(s).entries.clone();
    entries.push(v);
    alloc_set(env, entries)
}

pub fn set_disj(env: &Env, s: Value, v: Value) -> Result<Value, Value> {
    let obj = ObjHashSet::of(s);
    for (i, e) in obj.entries.iter().enumerate() {
        if equiv(env, *e, v)? {
            let mut entries = obj.entries.clone();
            entries.remove(i);
            return alloc_set(env, entries);
        }
    }
    Ok(s)
}

// =============================================================================
// Vectors
// =============================================================================

pub fn vec_conj(env: &Env, v: Value, item: Value) -> Result<Value, Value> {
    let mut items = ObjVector::of(v).items.to_vec();
    items.push(item);
    env.alloc(ObjVector::new(items))
}

pub fn vec_assoc(env: &Env, v: Value, idx: i64, item: Value) -> Result<Value, Value> {
    let obj = ObjVector::of(v);
    if idx < 0 || idx as usize > obj.items.len() {
        return Err(error::raise(
            env,
            ErrorKind::Index,
            format!("index {idx} out of bounds for vector of {}", obj.items.len()),
        ));
    }
    let mut items = obj.items.to_vec();
    if idx as usize == items.len() {
        items.push(item);
    } else {
        items[idx as usize] = item;
    }
    env.alloc(ObjVector::new(items))
}

// =============================================================================
// Generic operations
// =============================================================================

/// `get`: maps by key, vectors and strings by index, sets by membership.
pub fn get(env: &Env, coll: Value, k: Value, default: Value) -> Result<Value, Value> {
    match coll.tag() {
        Tag::Nil => Ok(default),
        Tag::Heap(HeapTag::ArrayMap | HeapTag::HashMap) => {
            Ok(map_get(env, coll, k)?.unwrap_or(default))
        }
        Tag::Heap(HeapTag::HashSet) => {
            if set_contains(env, coll, k)? { Ok(k) } else { Ok(default) }
        }
        Tag::Heap(HeapTag::Vector) => {
            if k.is_int() {
                let items = &ObjVector::of(coll).items;
                let i = k.as_i64();
                if i >= 0 && (i as usize) < items.len() {
                    return Ok(items[i as usize]);
                }
            }
            Ok(default)
        }
        Tag::Heap(HeapTag::Str) => {
            if k.is_int() {
                let i = k.as_i64();
                if i >= 0
                    && let Some(c) = ObjStr::of(coll).data.chars().nth(i as usize)
                {
                    return Ok(Value::char(c));
                }
            }
            Ok(default)
        }
        _ => Ok(default),
    }
}

/// `conj`: vectors append, lists prepend, maps take `[k v]` pairs, sets add.
pub fn conj(env: &Env, coll: Value, item: Value) -> Result<Value, Value> {
    match coll.tag() {
        Tag::Nil => crate::seq::list_from(env, &[item]),
        Tag::Heap(HeapTag::Vector) => vec_conj(env, coll, item),
        Tag::Heap(HeapTag::EmptyList | HeapTag::Cons | HeapTag::ChunkedCons | HeapTag::LazySeq) => {
            crate::seq::cons(env, item, coll)
        }
        Tag::Heap(HeapTag::HashSet) => set_conj(env, coll, item),
        Tag::Heap(HeapTag::ArrayMap | HeapTag::HashMap) => {
            if item.heap_tag() == Some(HeapTag::Vector) {
                let items = &ObjVector::of(item).items;
                if items.len() == 2 {
                    return map_assoc(env, coll, items[0], items[1]);
                }
            }
            Err(error::type_error(env, "[key value] pair", item))
        }
        _ => Err(error::type_error(env, "collection", coll)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        Env::new()
    }

    #[test]
    fn small_maps_are_array_maps_and_promote() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let mut m = scope.keep(map_from_pairs(&env, &[]).unwrap());
        assert_eq!(m.heap_tag(), Some(HeapTag::ArrayMap));
        for i in 0..=ARRAY_MAP_MAX as i64 {
            m = scope.keep(map_assoc(&env, m, Value::int(i), Value::int(i * 10)).unwrap());
        }
        assert_eq!(m.heap_tag(), Some(HeapTag::HashMap), "assoc past 8 entries promotes");
        assert_eq!(
            map_get(&env, m, Value::int(5)).unwrap().unwrap().as_i64(),
            50,
            "hash index lookup"
        );
    }

    #[test]
    fn map_insertion_order_preserved() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let m = scope.keep(
            map_from_pairs(
                &env,
                &[
                    (Value::int(0), Value::int(0)),
                    (Value::int(1), Value::int(1)),
                    (Value::int(2), Value::int(4)),
                ],
            )
            .unwrap(),
        );
        assert_eq!(crate::printer::pr_str(&env, m).unwrap(), "{0 0, 1 1, 2 4}");
    }

    #[test]
    fn map_literal_rejects_duplicates() {
        let env = env();
        let _m = env.gc.register_mutator();
        let dup = map_literal(&env, &[(Value::int(1), Value::int(2)), (Value::int(1), Value::int(3))]);
        assert!(dup.is_err());
        // float/int collapse counts as the same key
        let dup2 =
            map_literal(&env, &[(Value::int(1), Value::NIL), (Value::float(1.0), Value::NIL)]);
        assert!(dup2.is_err());
    }

    #[test]
    fn assoc_replaces_and_dissoc_removes() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let m = scope.keep(map_from_pairs(&env, &[(Value::int(1), Value::int(1))]).unwrap());
        let m2 = scope.keep(map_assoc(&env, m, Value::int(1), Value::int(9)).unwrap());
        assert_eq!(map_get(&env, m2, Value::int(1)).unwrap().unwrap().as_i64(), 9);
        // Original untouched (persistence)
        assert_eq!(map_get(&env, m, Value::int(1)).unwrap().unwrap().as_i64(), 1);
        let m3 = scope.keep(map_dissoc(&env, m2, Value::int(1)).unwrap());
        assert!(map_get(&env, m3, Value::int(1)).unwrap().is_none());
    }

    #[test]
    fn sets_deduplicate() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let s = scope.keep(set_from(&env, &[Value::int(1), Value::int(1), Value::int(2)]).unwrap());
        assert_eq!(ObjHashSet::of(s).entries.len(), 2);
        assert!(set_contains(&env, s, Value::int(1)).unwrap());
        assert!(!set_contains(&env, s, Value::int(3)).unwrap());
    }

    #[test]
    fn conj_respects_collection_kind() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let v =
            scope.keep(env.alloc(crate::heap::ObjVector::new(vec![Value::int(1)])).unwrap());
        let v2 = scope.keep(conj(&env, v, Value::int(2)).unwrap());
        assert_eq!(crate::printer::pr_str(&env, v2).unwrap(), "[1 2]");
        let l = scope.keep(crate::seq::list_from(&env, &[Value::int(1)]).unwrap());
        let l2 = scope.keep(conj(&env, l, Value::int(2)).unwrap());
        assert_eq!(crate::printer::pr_str(&env, l2).unwrap(), "(2 1)");
    }
}
