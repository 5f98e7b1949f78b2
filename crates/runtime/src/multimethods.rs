//! Multimethods and the isa? Hierarchy
//!
//! A multimethod pairs a dispatch function with a table from dispatch values
//! to methods, a preference graph for ambiguity resolution, and two caches:
//! an identity cache on the first argument (skips the dispatch function
//! entirely) and a dispatch-value cache (skips the hierarchy walk). Both are
//! invalidated by `defmethod`/`prefer-method`.
//!
//! The global hierarchy is an ordinary map value held in the core var
//! `global-hierarchy`: child → vector of parents. `derive` rebinds it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bridge;
use crate::env::{CORE_NS, Env};
use crate::eq::equiv;
use crate::error::{self, ErrorKind};
use crate::heap::{MultiState, ObjHeader, ObjMultimethod, ObjVector, Var};
use crate::value::{HeapTag, Value};

pub const HIERARCHY_VAR: &str = "global-hierarchy";

/// `(isa? child parent)`: equality, hierarchy ancestry, or element-wise
/// vector ancestry. Equality failures (a throwing lazy force) count as
/// not-related rather than propagating: dispatch values are data.
pub fn isa(env: &Env, child: Value, parent: Value) -> bool {
    if equiv(env, child, parent).unwrap_or(false) {
        return true;
    }
    // Element-wise: [::rect ::shape] isa [::shape ::shape]
    if child.heap_tag() == Some(HeapTag::Vector) && parent.heap_tag() == Some(HeapTag::Vector) {
        let c = &ObjVector::of(child).items;
        let p = &ObjVector::of(parent).items;
        return c.len() == p.len() && c.iter().zip(p.iter()).all(|(a, b)| isa(env, *a, *b));
    }
    ancestor_of(env, child, parent, 0)
}

fn hierarchy_map(env: &Env) -> Option<Value> {
    let var = env.resolve_var(Some(CORE_NS), HIERARCHY_VAR)?;
    env.var_value(var)
}

fn ancestor_of(env: &Env, child: Value, parent: Value, depth: u32) -> bool {
    if depth > 64 {
        return false; // cycle guard; derive rejects cycles but stay total
    }
    let Some(h) = hierarchy_map(env) else { return false };
    let Ok(Some(parents)) = crate::collections::map_get(env, h, child) else {
        return false;
    };
    if parents.heap_tag() != Some(HeapTag::Vector) {
        return false;
    }
    for p in ObjVector::of(parents).items.iter() {
        if equiv(env, *p, parent).unwrap_or(false) || ancestor_of(env, *p, parent, depth + 1) {
            return true;
        }
    }
    false
}

/// `(derive child parent)`: rebind the hierarchy var with the edge added.
pub fn derive(env: &Env, child: Value, parent: Value) -> Result<(), Value> {
    if isa(env, parent, child) {
        return Err(error::raise(env, ErrorKind::Value, "cyclic derivation"));
    }
    let var = env.intern_var(CORE_NS, HIERARCHY_VAR);
    let scope = env.roots();
    let current = match env.var_value(var) {
        Some(m) if crate::collections::is_map(m) => m,
        _ => scope.keep(crate::collections::map_from_pairs(env, &[])?),
    };
    scope.keep(current);
    let parents = match crate::collections::map_get(env, current, child)? {
        Some(existing) if existing.heap_tag() == Some(HeapTag::Vector) => {
            let mut items = ObjVector::of(existing).items.to_vec();
            if !items.iter().any(|p| p.identical(parent)) {
                items.push(parent);
            }
            scope.keep(env.alloc(ObjVector::new(items))?)
        }
        _ => scope.keep(env.alloc(ObjVector::new(vec![parent]))?),
    };
    let updated = scope.keep(crate::collections::map_assoc(env, current, child, parents)?);
    var.set_root(updated);
    Ok(())
}

/// Create the multimethod value for `defmulti` and bind it.
pub fn install_multimethod(
    env: &Env,
    var: &'static Var,
    name: Value,
    dispatch_fn: Value,
) -> Result<Value, Value> {
    let mm = env.alloc(ObjMultimethod {
        hdr: ObjHeader::new(HeapTag::Multimethod),
        name,
        dispatch_fn,
        state: Mutex::new(MultiState {
            methods: Vec::new(),
            prefers: Vec::new(),
            default_method: None,
            cache: Vec::new(),
        }),
        ident_arg: AtomicU64::new(0),
        ident_method: AtomicU64::new(0),
    })?;
    var.set_root(mm);
    Ok(mm)
}

/// `defmethod`: install (or replace) the entry for a dispatch value and drop
/// every cache, so methods added after the first call still participate.
pub fn add_method(env: &Env, mm_v: Value, dispatch_val: Value, f: Value) -> Result<(), Value> {
    if mm_v.heap_tag() != Some(HeapTag::Multimethod) {
        return Err(error::type_error(env, "multimethod", mm_v));
    }
    let mm = ObjMultimethod::of(mm_v);
    let default_kw = env.keyword("default");
    if dispatch_val.identical(default_kw) {
        let mut state = mm.state.lock().expect("multimethod poisoned");
        state.default_method = Some(f);
        state.cache.clear();
    } else {
        // Equality may allocate (lazy forcing) and a collection traces this
        // table under its own lock, so compare against a snapshot first.
        let snapshot: Vec<Value> = {
            let state = mm.state.lock().expect("multimethod poisoned");
            state.methods.iter().map(|(dv, _)| *dv).collect()
        };
        let mut replace_at = None;
        for (i, dv) in snapshot.iter().enumerate() {
            if equiv(env, *dv, dispatch_val)? {
                replace_at = Some(i);
                break;
            }
        }
        let mut state = mm.state.lock().expect("multimethod poisoned");
        match replace_at {
            Some(i) if i < state.methods.len() => state.methods[i].1 = f,
            _ => state.methods.push((dispatch_val, f)),
        }
        state.cache.clear();
    }
    mm.ident_arg.store(0, Ordering::Release);
    mm.ident_method.store(0, Ordering::Release);
    Ok(())
}

/// `prefer-method`: `a` wins over `b` when both match.
pub fn prefer_method(env: &Env, mm_v: Value, a: Value, b: Value) -> Result<(), Value> {
    if mm_v.heap_tag() != Some(HeapTag::Multimethod) {
        return Err(error::type_error(env, "multimethod", mm_v));
    }
    let mm = ObjMultimethod::of(mm_v);
    let mut state = mm.state.lock().expect("multimethod poisoned");
    state.prefers.push((a, b));
    state.cache.clear();
    drop(state);
    mm.ident_arg.store(0, Ordering::Release);
    mm.ident_method.store(0, Ordering::Release);
    Ok(())
}

fn preferred(env: &Env, mm: &ObjMultimethod, a: Value, b: Value) -> bool {
    let prefers: Vec<(Value, Value)> = {
        let state = mm.state.lock().expect("multimethod poisoned");
        state.prefers.clone()
    };
    prefers
        .iter()
        .any(|(x, y)| equiv(env, *x, a).unwrap_or(false) && equiv(env, *y, b).unwrap_or(false))
}

/// Resolve the method a call dispatches to. The caller invokes it through
/// the call bridge.
pub fn dispatch(env: &Env, mm_v: Value, args: &[Value]) -> Result<Value, Value> {
    let mm = ObjMultimethod::of(mm_v);

    // Identity cache: same first argument object → same method.
    if let Some(first) = args.first() {
        let bits = first.to_bits();
        if bits != 0 && mm.ident_arg.load(Ordering::Acquire) == bits {
            let m = mm.ident_method.load(Ordering::Acquire);
            if m != 0 {
                return Ok(Value::from_bits(m));
            }
        }
    }

    let scope = env.roots();
    let dv = scope.keep(bridge::call_fn(env, mm.dispatch_fn, args)?);

    // Dispatch-value cache, compared outside the lock.
    let cached: Vec<(Value, Value)> = {
        let state = mm.state.lock().expect("multimethod poisoned");
        state.cache.clone()
    };
    for (cached_dv, method) in cached {
        if equiv(env, cached_dv, dv)? {
            return Ok(method);
        }
    }

    // Hierarchy-aware best match.
    let candidates: Vec<(Value, Value)> = {
        let state = mm.state.lock().expect("multimethod poisoned");
        state.methods.iter().filter(|(k, _)| isa(env, dv, *k)).cloned().collect()
    };
    let chosen = match candidates.len() {
        0 => {
            let state = mm.state.lock().expect("multimethod poisoned");
            match state.default_method {
                Some(m) => m,
                None => {
                    drop(state);
                    let repr = crate::printer::pr_str(env, dv)?;
                    let name = crate::printer::pr_str(env, mm.name)?;
                    return Err(error::raise(
                        env,
                        ErrorKind::Name,
                        format!("no method in multimethod {name} for dispatch value: {repr}"),
                    ));
                }
            }
        }
        1 => candidates[0].1,
        _ => {
            // Most specific key wins; ties go through the preference graph.
            let mut best = candidates[0];
            for cand in &candidates[1..] {
                if isa(env, cand.0, best.0) || preferred(env, mm, cand.0, best.0) {
                    best = *cand;
                } else if !isa(env, best.0, cand.0) && !preferred(env, mm, best.0, cand.0) {
                    let repr = crate::printer::pr_str(env, dv)?;
                    return Err(error::raise(
                        env,
                        ErrorKind::Value,
                        format!("ambiguous multimethod dispatch for {repr}"),
                    ));
                }
            }
            best.1
        }
    };

    // Fill both caches.
    {
        let mut state = mm.state.lock().expect("multimethod poisoned");
        state.cache.push((dv, chosen));
    }
    if let Some(first) = args.first() {
        mm.ident_method.store(chosen.to_bits(), Ordering::Release);
        mm.ident_arg.store(first.to_bits(), Ordering::Release);
    }
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        Env::new()
    }

    #[test]
    fn isa_is_reflexive_and_follows_derive() {
        let env = env();
        let _m = env.gc.register_mutator();
        let rect = env.keyword("rect");
        let shape = env.keyword("shape");
        let thing = env.keyword("thing");
        assert!(isa(&env, rect, rect));
        assert!(!isa(&env, rect, shape));
        derive(&env, rect, shape).unwrap();
        assert!(isa(&env, rect, shape));
        // Transitivity
        derive(&env, shape, thing).unwrap();
        assert!(isa(&env, rect, thing));
        // Cycles rejected
        assert!(derive(&env, thing, rect).is_err());
    }

    #[test]
    fn add_method_clears_caches() {
        let env = env();
        let _m = env.gc.register_mutator();
        let var = env.intern_var("user", "area");
        let name = env.symbol("area");
        // Dispatch on identity for the test: the builtin `identity` is not
        // registered yet at this layer, so use a marker closure via keyword
        // dispatch instead; keywords are callable through the bridge, and
        // (:k m) is nil for non-maps, making every dispatch value nil.
        let dispatch_fn = env.keyword("k");
        let scope = env.roots();
        let mm = scope.keep(install_multimethod(&env, var, name, dispatch_fn).unwrap());
        add_method(&env, mm, Value::NIL, Value::int(111)).unwrap();
        let args = [Value::int(5)];
        let m1 = dispatch(&env, mm, &args).unwrap();
        assert_eq!(m1.as_i64(), 111);
        // Replace after a call: the caches must not pin the old method.
        add_method(&env, mm, Value::NIL, Value::int(222)).unwrap();
        let m2 = dispatch(&env, mm, &args).unwrap();
        assert_eq!(m2.as_i64(), 222);
    }
}
