//! Value Hashing
//!
//! The contract: `(= a b)` implies `(hash a)` = `(hash b)`. Integer and
//! float hashes collapse numerically (1 and 1.0 hash alike). Collection
//! hashes come from three stable mixers (ordered for lists, vectors, and
//! seqs; unordered for sets; entry-wise xor for maps), so equal collections hash
//! identically regardless of concrete representation.
//!
//! Hashing a lazy sequence realizes it, so this can throw.

use crate::env::Env;
use crate::eq::map_entries;
use crate::heap::{ObjHashSet, ObjKeyword, ObjRegex, ObjStr, ObjSymbol};
use crate::seq;
use crate::value::{HeapTag, Tag, Value};

/// 64→32 bit finalizer (splitmix-style avalanche).
fn mix64(mut x: u64) -> u32 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    (x ^ (x >> 32)) as u32
}

fn hash_bytes(bytes: &[u8], seed: u64) -> u32 {
    let mut h = seed;
    for &b in bytes {
        h = h.wrapping_mul(31).wrapping_add(b as u64);
    }
    mix64(h)
}

fn hash_number(v: Value) -> u32 {
    // Numeric collapse: integral floats hash as their integer value.
    let f = match v.tag() {
        Tag::Int => return mix64(v.as_i64() as u64),
        Tag::Float => v.as_f64(),
        _ => unreachable!("hash_number on non-number"),
    };
    if f.is_nan() {
        return mix64(0x7ff8);
    }
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        return mix64(f as i64 as u64);
    }
    mix64(f.to_bits())
}

/// Ordered mixer shared by every sequential collection.
fn mix_ordered(hashes: impl IntoIterator<Item = u32>) -> u32 {
    let mut h: u64 = 1;
    let mut n: u64 = 0;
    for e in hashes {
        h = h.wrapping_mul(31).wrapping_add(e as u64);
        n += 1;
    }
    mix64(h ^ (n << 32))
}

pub fn hash_value(env: &Env, v: Value) -> Result<u32, Value> {
    Ok(match v.tag() {
        Tag::Nil => 0,
        Tag::True => mix64(1231),
        Tag::False => mix64(1237),
        Tag::Int | Tag::Float => hash_number(v),
        Tag::Char => mix64(v.as_char() as u64 ^ 0xC0FFEE),
        Tag::Builtin => mix64(v.to_bits()),
        Tag::Heap(tag) => match tag {
            HeapTag::Str => hash_bytes(ObjStr::of(v).data.as_bytes(), 0x5f),
            HeapTag::Symbol => {
                let s = ObjSymbol::of(v);
                hash_bytes(s.qualified().as_bytes(), 0x53)
            }
            HeapTag::Keyword => {
                let k = ObjKeyword::of(v);
                hash_bytes(k.qualified().as_bytes(), 0x4b)
            }
            HeapTag::Regex => hash_bytes(ObjRegex::of(v).source.as_bytes(), 0x52),
            HeapTag::Cons
            | HeapTag::EmptyList
            | HeapTag::Vector
            | HeapTag::LazySeq
            | HeapTag::ChunkedCons => hash_sequential(env, v)?,
            HeapTag::ArrayMap | HeapTag::HashMap => {
                let mut sum: u64 = 0;
                for (k, val) in map_entries(v) {
                    sum =
                        sum.wrapping_add((hash_value(env, *k)? ^ hash_value(env, *val)?) as u64);
                }
                mix64(sum ^ 0x4d41_5000)
            }
            HeapTag::HashSet => {
                let mut sum: u64 = 0;
                for e in ObjHashSet::of(v).entries.iter() {
                    sum = sum.wrapping_add(hash_value(env, *e)? as u64);
                }
                mix64(sum ^ 0x5345_5400)
            }
            // Identity hash for reference kinds.
            _ => mix64(v.to_bits()),
        },
    })
}

fn hash_sequential(env: &Env, v: Value) -> Result<u32, Value> {
    let scope = env.roots();
    let slot = scope.slot(v);
    let mut hashes = Vec::new();
    let mut cur = seq::seq(env, v)?;
    while !cur.is_nil() {
        // Pin before polling: `cur` may be a freshly built view.
        slot.set(cur);
        env.safe_point();
        hashes.push(hash_value(env, seq::seq_first(env, cur)?)?);
        let r = seq::seq_rest(env, cur)?;
        slot.set(r);
        cur = seq::seq(env, r)?;
    }
    Ok(mix_ordered(hashes))
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
    fn equal_numbers_hash_equal() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert_eq!(
            hash_value(&env, Value::int(7)).unwrap(),
            hash_value(&env, Value::float(7.0)).unwrap()
        );
        assert_ne!(
            hash_value(&env, Value::int(7)).unwrap(),
            hash_value(&env, Value::int(8)).unwrap()
        );
    }

    #[test]
    fn equal_collections_hash_equal_across_kinds() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let l = scope.keep(list_from(&env, &[Value::int(1), Value::int(2)]).unwrap());
        let v = scope.keep(env.alloc(ObjVector::new(vec![Value::int(1), Value::int(2)])).unwrap());
        assert_eq!(hash_value(&env, l).unwrap(), hash_value(&env, v).unwrap());
    }

    #[test]
    fn string_hash_stable_and_content_based() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let a = scope.keep(env.alloc_str("hello").unwrap());
        let b = scope.keep(env.alloc_str("hello").unwrap());
        assert_eq!(hash_value(&env, a).unwrap(), hash_value(&env, b).unwrap());
    }

    #[test]
    fn symbol_and_keyword_hashes_differ() {
        let env = env();
        let _m = env.gc.register_mutator();
        let s = env.symbol("name");
        let k = env.keyword("name");
        assert_ne!(hash_value(&env, s).unwrap(), hash_value(&env, k).unwrap());
    }
}
