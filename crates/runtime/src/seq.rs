//! Sequences, Laziness, and Fused Reduction
//!
//! The seq protocol views every collection as nil or a sequence with a first
//! element and a rest. Lazy sequences are boxed thunks with a memoized
//! realization slot; forcing is idempotent.
//!
//! A lazy cell may additionally carry a **chain descriptor**: the source it
//! draws from (range, iterate, repeat, or a concrete collection) plus the
//! transform pipeline (`map`/`filter`/`take`/`drop`) applied to it. Applying
//! `filter` to a chain that already ends in filters extends the flat
//! predicate list instead of nesting a new cell, so pipelines like a prime
//! sieve stay one cell deep. `reduce` over a chain streams elements through
//! the recorded transforms in a single pass with no intermediate cells.

use crate::bridge;
use crate::env::{Env, RootScope};
use crate::error::{self, ErrorKind};
use crate::heap::{
    LazyState, ObjArrayChunk, ObjArrayMap, ObjChunkedCons, ObjCons, ObjHashMap, ObjHashSet,
    ObjHeader, ObjLazySeq, ObjReduced, ObjStr, ObjVector,
};
use crate::value::{HeapTag, Tag, Value};
use std::sync::{Arc, Mutex};

// =============================================================================
// Chain descriptors
// =============================================================================

/// How an iterate source resumes: either the next value is already known, or
/// it must be computed from the previous one. Keeping the previous value
/// makes the pipeline lazy in the step function.
#[derive(Clone)]
pub enum IterState {
    Seed(Value),
    After(Value),
}

#[derive(Clone)]
pub enum ChainSource {
    Range { next: i64, end: Option<i64>, step: i64 },
    Iterate { f: Value, state: IterState },
    Repeat { item: Value, remaining: Option<i64> },
    Coll(Value),
}

#[derive(Clone)]
pub enum ChainOp {
    Map(Value),
    Filter(Value),
    Remove(Value),
    Take(i64),
    Drop(i64),
}

#[derive(Clone)]
pub struct ChainDesc {
    pub source: ChainSource,
    pub ops: Vec<ChainOp>,
}

impl ChainDesc {
    pub fn from_source(source: ChainSource) -> ChainDesc {
        ChainDesc { source, ops: Vec::new() }
    }

    pub fn trace(&self, work: &mut Vec<Value>) {
        match &self.source {
            ChainSource::Range { .. } => {}
            ChainSource::Iterate { f, state } => {
                work.push(*f);
                match state {
                    IterState::Seed(v) | IterState::After(v) => work.push(*v),
                }
            }
            ChainSource::Repeat { item, .. } => work.push(*item),
            ChainSource::Coll(v) => work.push(*v),
        }
        for op in &self.ops {
            match op {
                ChainOp::Map(f) | ChainOp::Filter(f) | ChainOp::Remove(f) => work.push(*f),
                ChainOp::Take(_) | ChainOp::Drop(_) => {}
            }
        }
    }
}

/// Pull the next element out of a source, advancing it in place.
fn source_next(env: &Env, src: &mut ChainSource) -> Result<Option<Value>, Value> {
    match src {
        ChainSource::Range { next, end, step } => {
            if let Some(end) = end {
                let done = if *step >= 0 { *next >= *end } else { *next <= *end };
                if done {
                    return Ok(None);
                }
            }
            let v = Value::from_i64(*next);
            *next += *step;
            Ok(Some(v))
        }
        ChainSource::Iterate { f, state } => {
            let cur = match state {
                IterState::Seed(v) => *v,
                IterState::After(prev) => bridge::call_fn(env, *f, &[*prev])?,
            };
            *state = IterState::After(cur);
            Ok(Some(cur))
        }
        ChainSource::Repeat { item, remaining } => {
            if let Some(n) = remaining {
                if *n <= 0 {
                    return Ok(None);
                }
                *n -= 1;
            }
            Ok(Some(*item))
        }
        ChainSource::Coll(v) => {
            let s = seq(env, *v)?;
            if s.is_nil() {
                return Ok(None);
            }
            let elem = seq_first(env, s)?;
            *v = seq_rest(env, s)?;
            Ok(Some(elem))
        }
    }
}

enum OpOutcome {
    Keep(Value),
    Skip,
    Exhausted,
}

/// Run one element through the transform pipeline, mutating take/drop
/// counters in place.
fn apply_ops(env: &Env, ops: &mut [ChainOp], mut elem: Value) -> Result<OpOutcome, Value> {
    let scope = env.roots();
    for op in ops.iter_mut() {
        match op {
            ChainOp::Map(f) => {
                elem = scope.keep(bridge::call_fn(env, *f, &[elem])?);
            }
            ChainOp::Filter(p) => {
                if !bridge::call_fn(env, *p, &[elem])?.is_truthy() {
                    return Ok(OpOutcome::Skip);
                }
            }
            ChainOp::Remove(p) => {
                if bridge::call_fn(env, *p, &[elem])?.is_truthy() {
                    return Ok(OpOutcome::Skip);
                }
            }
            ChainOp::Take(n) => {
                if *n <= 0 {
                    return Ok(OpOutcome::Exhausted);
                }
                *n -= 1;
            }
            ChainOp::Drop(n) => {
                if *n > 0 {
                    *n -= 1;
                    return Ok(OpOutcome::Skip);
                }
            }
        }
    }
    Ok(OpOutcome::Keep(elem))
}

/// Produce the first surviving element of a chain plus the descriptor for
/// everything after it.
fn chain_next(env: &Env, mut desc: ChainDesc) -> Result<Option<(Value, ChainDesc)>, Value> {
    let scope = env.roots();
    loop {
        env.safe_point();
        let Some(raw) = source_next(env, &mut desc.source)? else {
            return Ok(None);
        };
        scope.keep(raw);
        match apply_ops(env, &mut desc.ops, raw)? {
            OpOutcome::Keep(elem) => {
                scope.keep(elem);
                return Ok(Some((elem, desc)));
            }
            OpOutcome::Skip => continue,
            OpOutcome::Exhausted => return Ok(None),
        }
    }
}

// =============================================================================
// Constructors
// =============================================================================

pub fn cons(env: &Env, first: Value, rest: Value) -> Result<Value, Value> {
    env.alloc(ObjCons::new(first, rest))
}

/// Build a list (cons chain) from a slice, right to left.
pub fn list_from(env: &Env, items: &[Value]) -> Result<Value, Value> {
    let scope = env.roots();
    let slot = scope.slot(env.empty_list);
    let mut acc = env.empty_list;
    for item in items.iter().rev() {
        acc = cons(env, *item, acc)?;
        slot.set(acc);
    }
    Ok(acc)
}

pub fn lazy_from_chain(env: &Env, chain: ChainDesc) -> Result<Value, Value> {
    env.alloc(ObjLazySeq {
        hdr: ObjHeader::new(HeapTag::LazySeq),
        state: Mutex::new(LazyState { thunk: Value::NIL, realized: None }),
        chain: Some(Box::new(chain)),
    })
}

pub fn lazy_from_thunk(env: &Env, thunk: Value) -> Result<Value, Value> {
    env.alloc(ObjLazySeq {
        hdr: ObjHeader::new(HeapTag::LazySeq),
        state: Mutex::new(LazyState { thunk, realized: None }),
        chain: None,
    })
}

/// Attach one more transform to a collection's pipeline. Chains already on a
/// lazy cell are extended flat (the filter-chain collapse); anything else
/// becomes the source of a fresh chain.
pub fn extend_chain(env: &Env, coll: Value, op: ChainOp) -> Result<Value, Value> {
    let desc = match chain_of(coll) {
        Some(existing) => {
            let mut desc = existing.clone();
            desc.ops.push(op);
            desc
        }
        None => {
            let source = ChainSource::Coll(coll);
            ChainDesc { source, ops: vec![op] }
        }
    };
    lazy_from_chain(env, desc)
}

pub fn chain_of(v: Value) -> Option<&'static ChainDesc> {
    if v.heap_tag() == Some(HeapTag::LazySeq) {
        ObjLazySeq::of(v).chain.as_deref()
    } else {
        None
    }
}

pub fn make_reduced(env: &Env, v: Value) -> Result<Value, Value> {
    env.alloc(ObjReduced { hdr: ObjHeader::new(HeapTag::Reduced), value: v })
}

#[inline]
pub fn is_reduced(v: Value) -> bool {
    v.heap_tag() == Some(HeapTag::Reduced)
}

/// Chunked view over realized elements; nil for an empty vector.
fn chunked_from(env: &Env, items: Arc<[Value]>) -> Result<Value, Value> {
    if items.is_empty() {
        return Ok(Value::NIL);
    }
    let scope = env.roots();
    let chunk = scope.keep(env.alloc(ObjArrayChunk {
        hdr: ObjHeader::new(HeapTag::ArrayChunk),
        items,
        off: 0,
    })?);
    env.alloc(ObjChunkedCons { hdr: ObjHeader::new(HeapTag::ChunkedCons), chunk, rest: env.empty_list })
}

// =============================================================================
// The seq protocol
// =============================================================================

/// Coerce to nil or a sequence. Forces lazy cells one step.
pub fn seq(env: &Env, v: Value) -> Result<Value, Value> {
    match v.tag() {
        Tag::Nil => Ok(Value::NIL),
        Tag::Heap(HeapTag::EmptyList) => Ok(Value::NIL),
        Tag::Heap(HeapTag::Cons) | Tag::Heap(HeapTag::ChunkedCons) => Ok(v),
        Tag::Heap(HeapTag::LazySeq) => force_lazy(env, v),
        Tag::Heap(HeapTag::Vector) => {
            let items: Arc<[Value]> = ObjVector::of(v).items.to_vec().into();
            chunked_from(env, items)
        }
        Tag::Heap(HeapTag::Str) => {
            let chars: Arc<[Value]> =
                ObjStr::of(v).data.chars().map(Value::char).collect::<Vec<_>>().into();
            chunked_from(env, chars)
        }
        Tag::Heap(HeapTag::ArrayMap) => {
            let scope = env.roots();
            let mut pairs = Vec::new();
            for (k, val) in ObjArrayMap::of(v).entries.iter() {
                pairs.push(scope.keep(env.alloc(ObjVector::new(vec![*k, *val]))?));
            }
            chunked_from(env, pairs.into())
        }
        Tag::Heap(HeapTag::HashMap) => {
            let scope = env.roots();
            let mut pairs = Vec::new();
            for (k, val) in ObjHashMap::of(v).entries.iter() {
                pairs.push(scope.keep(env.alloc(ObjVector::new(vec![*k, *val]))?));
            }
            chunked_from(env, pairs.into())
        }
        Tag::Heap(HeapTag::HashSet) => {
            let items: Arc<[Value]> = ObjHashSet::of(v).entries.clone().into();
            chunked_from(env, items)
        }
        _ => Err(error::type_error(env, "seqable collection", v)),
    }
}

/// Force a lazy cell: realize its first cons (or nil) and memoize.
pub fn force_lazy(env: &Env, v: Value) -> Result<Value, Value> {
    let obj = ObjLazySeq::of(v);
    let thunk = {
        let state = obj.state.lock().expect("lazy state poisoned");
        if let Some(r) = state.realized {
            return Ok(r);
        }
        state.thunk
    };

    // Compute outside the lock: the thunk may force this same cell's
    // dependencies. A racing double-compute is benign (idempotent).
    let scope = env.roots();
    let realized = if let Some(chain) = &obj.chain {
        match chain_next(env, chain.as_ref().clone())? {
            None => Value::NIL,
            Some((elem, rest_desc)) => {
                scope.keep(elem);
                let rest = scope.keep(lazy_from_chain(env, rest_desc)?);
                scope.keep(cons(env, elem, rest)?)
            }
        }
    } else {
        let out = scope.keep(bridge::call_fn(env, thunk, &[])?);
        seq(env, out)?
    };

    let mut state = obj.state.lock().expect("lazy state poisoned");
    match state.realized {
        Some(r) => Ok(r),
        None => {
            state.realized = Some(realized);
            Ok(realized)
        }
    }
}

/// First element of a seq value produced by [`seq`].
pub fn seq_first(env: &Env, s: Value) -> Result<Value, Value> {
    match s.heap_tag() {
        Some(HeapTag::Cons) => Ok(ObjCons::of(s).first),
        Some(HeapTag::ChunkedCons) => {
            let cc = ObjChunkedCons::of(s);
            let chunk = ObjArrayChunk::of(cc.chunk);
            Ok(chunk.items[chunk.off as usize])
        }
        Some(HeapTag::LazySeq) => {
            let forced = force_lazy(env, s)?;
            if forced.is_nil() { Ok(Value::NIL) } else { seq_first(env, forced) }
        }
        _ => Err(error::type_error(env, "seq", s)),
    }
}

/// Rest of a seq value: another seqable (possibly lazy), or the empty list.
pub fn seq_rest(env: &Env, s: Value) -> Result<Value, Value> {
    match s.heap_tag() {
        Some(HeapTag::Cons) => Ok(ObjCons::of(s).rest),
        Some(HeapTag::ChunkedCons) => {
            let cc = ObjChunkedCons::of(s);
            let chunk = ObjArrayChunk::of(cc.chunk);
            if (chunk.off as usize + 1) < chunk.items.len() {
                let scope = env.roots();
                let advanced = scope.keep(env.alloc(ObjArrayChunk {
                    hdr: ObjHeader::new(HeapTag::ArrayChunk),
                    items: chunk.items.clone(),
                    off: chunk.off + 1,
                })?);
                env.alloc(ObjChunkedCons {
                    hdr: ObjHeader::new(HeapTag::ChunkedCons),
                    chunk: advanced,
                    rest: cc.rest,
                })
            } else {
                Ok(cc.rest)
            }
        }
        Some(HeapTag::LazySeq) => {
            let forced = force_lazy(env, s)?;
            if forced.is_nil() { Ok(env.empty_list) } else { seq_rest(env, forced) }
        }
        _ => Err(error::type_error(env, "seq", s)),
    }
}

pub fn first(env: &Env, coll: Value) -> Result<Value, Value> {
    let s = seq(env, coll)?;
    if s.is_nil() { Ok(Value::NIL) } else { seq_first(env, s) }
}

pub fn rest(env: &Env, coll: Value) -> Result<Value, Value> {
    let s = seq(env, coll)?;
    if s.is_nil() { Ok(env.empty_list) } else { seq_rest(env, s) }
}

/// `next` = `(seq (rest coll))`.
pub fn next(env: &Env, coll: Value) -> Result<Value, Value> {
    let r = rest(env, coll)?;
    seq(env, r)
}

// =============================================================================
// Folding
// =============================================================================

/// Internal fold driving every reduction. Handles the reduced sentinel and
/// polls the GC between iterations. Chain-descriptor lazy seqs stream
/// through [`chain_fold`] without allocating cells.
pub fn fold(
    env: &Env,
    coll: Value,
    init: Value,
    f: &mut dyn FnMut(&Env, Value, Value) -> Result<Value, Value>,
) -> Result<Value, Value> {
    if let Some(chain) = chain_of(coll) {
        return chain_fold(env, chain.clone(), init, f);
    }
    let scope = env.roots();
    let acc_slot = scope.slot(init);
    let cur_slot = scope.slot(coll);
    let mut acc = init;
    let mut cur = coll;
    loop {
        env.safe_point();
        let s = seq(env, cur)?;
        if s.is_nil() {
            return Ok(acc);
        }
        cur_slot.set(s);
        let elem = seq_first(env, s)?;
        acc = f(env, acc, elem)?;
        if is_reduced(acc) {
            return Ok(ObjReduced::of(acc).value);
        }
        acc_slot.set(acc);
        cur = seq_rest(env, s)?;
        cur_slot.set(cur);
    }
}

/// Fused reduction: walk the chain once, applying the recorded transforms
/// in order, no intermediate lazy cells.
fn chain_fold(
    env: &Env,
    desc: ChainDesc,
    init: Value,
    f: &mut dyn FnMut(&Env, Value, Value) -> Result<Value, Value>,
) -> Result<Value, Value> {
    let ChainDesc { mut source, mut ops } = desc;
    let scope = env.roots();
    let acc_slot = scope.slot(init);
    let elem_slot = scope.slot(Value::NIL);
    let mut acc = init;
    loop {
        env.safe_point();
        let Some(raw) = source_next(env, &mut source)? else {
            return Ok(acc);
        };
        elem_slot.set(raw);
        match apply_ops(env, &mut ops, raw)? {
            OpOutcome::Skip => continue,
            OpOutcome::Exhausted => return Ok(acc),
            OpOutcome::Keep(elem) => {
                elem_slot.set(elem);
                acc = f(env, acc, elem)?;
                if is_reduced(acc) {
                    return Ok(ObjReduced::of(acc).value);
                }
                acc_slot.set(acc);
            }
        }
    }
}

/// Element count. Counted collections answer directly; seqs are walked (and
/// fully realized).
pub fn count(env: &Env, coll: Value) -> Result<i64, Value> {
    match coll.tag() {
        Tag::Nil => Ok(0),
        Tag::Heap(HeapTag::EmptyList) => Ok(0),
        Tag::Heap(HeapTag::Str) => Ok(ObjStr::of(coll).data.chars().count() as i64),
        Tag::Heap(HeapTag::Vector) => Ok(ObjVector::of(coll).items.len() as i64),
        Tag::Heap(HeapTag::ArrayMap) => Ok(ObjArrayMap::of(coll).entries.len() as i64),
        Tag::Heap(HeapTag::HashMap) => Ok(ObjHashMap::of(coll).entries.len() as i64),
        Tag::Heap(HeapTag::HashSet) => Ok(ObjHashSet::of(coll).entries.len() as i64),
        _ => {
            let mut n = 0i64;
            fold(env, coll, Value::NIL, &mut |_, acc, _| {
                n += 1;
                Ok(acc)
            })?;
            Ok(n)
        }
    }
}

/// Indexed access. Vectors and strings answer in O(1)/O(n-chars); seqs walk.
/// Out of range without a default is an index error.
pub fn nth(env: &Env, coll: Value, idx: i64, default: Option<Value>) -> Result<Value, Value> {
    if idx >= 0 {
        match coll.tag() {
            Tag::Heap(HeapTag::Vector) => {
                let items = &ObjVector::of(coll).items;
                if let Some(v) = items.get(idx as usize) {
                    return Ok(*v);
                }
            }
            Tag::Heap(HeapTag::Str) => {
                if let Some(c) = ObjStr::of(coll).data.chars().nth(idx as usize) {
                    return Ok(Value::char(c));
                }
            }
            _ => {
                let scope = env.roots();
                let cur_slot = scope.slot(coll);
                let mut cur = coll;
                let mut remaining = idx;
                loop {
                    env.safe_point();
                    let s = seq(env, cur)?;
                    if s.is_nil() {
                        break;
                    }
                    cur_slot.set(s);
                    if remaining == 0 {
                        return seq_first(env, s);
                    }
                    remaining -= 1;
                    cur = seq_rest(env, s)?;
                    cur_slot.set(cur);
                }
            }
        }
    }
    match default {
        Some(d) => Ok(d),
        None => Err(error::raise(env, ErrorKind::Index, format!("index {idx} out of bounds"))),
    }
}

/// Materialize into a Rust vector, rooting every element in `scope`.
pub fn to_vec(env: &Env, scope: &RootScope<'_>, coll: Value) -> Result<Vec<Value>, Value> {
    let mut out = Vec::new();
    fold(env, coll, Value::NIL, &mut |_, acc, elem| {
        scope.keep(elem);
        out.push(elem);
        Ok(acc)
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        Env::new()
    }

    #[test]
    fn list_roundtrip() {
        let env = env();
        let _m = env.gc.register_mutator();
        let l = list_from(&env, &[Value::int(1), Value::int(2), Value::int(3)]).unwrap();
        assert_eq!(first(&env, l).unwrap().as_i64(), 1);
        let r = rest(&env, l).unwrap();
        assert_eq!(first(&env, r).unwrap().as_i64(), 2);
        assert_eq!(count(&env, l).unwrap(), 3);
    }

    #[test]
    fn empty_list_is_not_a_seq() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert!(seq(&env, env.empty_list).unwrap().is_nil());
        assert!(first(&env, env.empty_list).unwrap().is_nil());
    }

    #[test]
    fn vector_seq_is_chunked() {
        let env = env();
        let _m = env.gc.register_mutator();
        let v = env.alloc(ObjVector::new(vec![Value::int(10), Value::int(20)])).unwrap();
        let scope = env.roots();
        scope.keep(v);
        let s = scope.keep(seq(&env, v).unwrap());
        assert_eq!(s.heap_tag(), Some(HeapTag::ChunkedCons));
        assert_eq!(seq_first(&env, s).unwrap().as_i64(), 10);
        let r = scope.keep(seq_rest(&env, s).unwrap());
        assert_eq!(first(&env, r).unwrap().as_i64(), 20);
    }

    #[test]
    fn range_chain_folds_without_cells() {
        let env = env();
        let _m = env.gc.register_mutator();
        let chain =
            ChainDesc::from_source(ChainSource::Range { next: 0, end: Some(100), step: 1 });
        let lazy = lazy_from_chain(&env, chain).unwrap();
        let scope = env.roots();
        scope.keep(lazy);
        let mut sum = 0i64;
        fold(&env, lazy, Value::NIL, &mut |_, acc, v| {
            sum += v.as_i64();
            Ok(acc)
        })
        .unwrap();
        assert_eq!(sum, 4950);
    }

    #[test]
    fn take_limits_infinite_range() {
        let env = env();
        let _m = env.gc.register_mutator();
        let chain = ChainDesc {
            source: ChainSource::Range { next: 0, end: None, step: 1 },
            ops: vec![ChainOp::Take(5)],
        };
        let lazy = lazy_from_chain(&env, chain).unwrap();
        let scope = env.roots();
        scope.keep(lazy);
        assert_eq!(count(&env, lazy).unwrap(), 5);
    }

    #[test]
    fn filter_chain_extends_flat() {
        let env = env();
        let _m = env.gc.register_mutator();
        let base = lazy_from_chain(
            &env,
            ChainDesc {
                source: ChainSource::Range { next: 0, end: Some(10), step: 1 },
                ops: vec![ChainOp::Take(10)],
            },
        )
        .unwrap();
        let scope = env.roots();
        scope.keep(base);
        let extended = scope.keep(extend_chain(&env, base, ChainOp::Take(3)).unwrap());
        let chain = chain_of(extended).expect("chain must carry over");
        assert_eq!(chain.ops.len(), 2, "ops extend flat, no nesting");
    }

    #[test]
    fn forcing_is_memoized() {
        let env = env();
        let _m = env.gc.register_mutator();
        let chain = ChainDesc::from_source(ChainSource::Range { next: 7, end: Some(8), step: 1 });
        let lazy = lazy_from_chain(&env, chain).unwrap();
        let scope = env.roots();
        scope.keep(lazy);
        let a = force_lazy(&env, lazy).unwrap();
        let b = force_lazy(&env, lazy).unwrap();
        assert!(a.identical(b), "second force must return the memoized seq");
    }

    #[test]
    fn reduced_short_circuits_fold() {
        let env = env();
        let _m = env.gc.register_mutator();
        let l = list_from(&env, &[Value::int(1), Value::int(2), Value::int(3)]).unwrap();
        let scope = env.roots();
        scope.keep(l);
        let mut seen = 0;
        let out = fold(&env, l, Value::int(0), &mut |env, _, v| {
            seen += 1;
            if v.as_i64() == 2 { make_reduced(env, Value::int(99)) } else { Ok(v) }
        })
        .unwrap();
        assert_eq!(out.as_i64(), 99);
        assert_eq!(seen, 2, "fold must stop at the reduced sentinel");
    }

    #[test]
    fn nth_out_of_bounds() {
        let env = env();
        let _m = env.gc.register_mutator();
        let v = env.alloc(ObjVector::new(vec![Value::int(1)])).unwrap();
        let scope = env.roots();
        scope.keep(v);
        assert_eq!(nth(&env, v, 0, None).unwrap().as_i64(), 1);
        assert!(nth(&env, v, 5, None).is_err());
        assert_eq!(nth(&env, v, 5, Some(Value::int(-1))).unwrap().as_i64(), -1);
    }
}
