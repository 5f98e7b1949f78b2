//! Mutable-state builtins: atoms, volatiles, vars, delays, and `deref`
//! across every derefable kind.
//!
//! `swap!` is compare-and-set retried: the update function may run more than
//! once; watches fire once, after the successful update. Refs alias atoms
//! and `dosync` is a sequential wrapper (STM is out of scope).

use super::{Registrar, exact_arity, min_arity};
use crate::bridge;
use crate::concurrency;
use crate::env::Env;
use crate::error::{self, ErrorKind};
use crate::heap::{DelayState, ObjAtom, ObjDelay, ObjHeader, ObjVolatile, Var};
use crate::value::{HeapTag, Value};
use std::sync::Mutex;
use std::time::Duration;

pub(super) fn register(reg: &mut Registrar<'_>) {
    reg.def("atom", atom);
    reg.def("ref", atom); // refs alias atoms; dosync is sequential
    reg.def("deref", deref);
    reg.def("reset!", reset_bang);
    reg.def("swap!", swap_bang);
    reg.def("compare-and-set!", compare_and_set_bang);
    reg.def("add-watch", add_watch);
    reg.def("remove-watch", remove_watch);
    reg.def("volatile!", volatile_bang);
    reg.def("vreset!", vreset_bang);
    reg.def("vswap!", vswap_bang);
    reg.def("var-get", var_get);
    reg.def("var-set", var_set);
    reg.def("alter-var-root", alter_var_root);
    reg.def("delay*", delay_star);
    reg.def("force", force);
    reg.def("future*", future_star);
    reg.def("future-cancel", future_cancel);
    reg.def("future-cancelled?", future_cancelled_p);
    reg.def("promise", promise);
    reg.def("deliver", deliver);
    reg.def("agent", agent);
    reg.def("send", send);
    reg.def("await", await_fn);
}

fn atom(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "atom", args, 1)?;
    env.alloc(ObjAtom::new(args[0]))
}

fn deref(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "deref", args, 1)?;
    let v = args[0];
    // Three-arg form: (deref ref timeout-ms default)
    let timeout = match args {
        [_] => None,
        [_, ms, default] => {
            let ms = super::int_arg(env, "deref", *ms)?;
            Some((Duration::from_millis(ms.max(0) as u64), *default))
        }
        _ => return Err(error::arity_error(env, "deref", args.len())),
    };
    match v.heap_tag() {
        Some(HeapTag::Atom) => Ok(ObjAtom::of(v).load()),
        Some(HeapTag::Volatile) => Ok(ObjVolatile::of(v).load()),
        Some(HeapTag::Future) => concurrency::future_deref(env, v, timeout),
        Some(HeapTag::Promise) => concurrency::promise_deref(env, v, timeout),
        Some(HeapTag::Agent) => Ok(concurrency::agent_deref(v)),
        Some(HeapTag::Delay) => force_delay(env, v),
        Some(HeapTag::VarRef) => env.var_value(Var::of(v)).ok_or_else(|| {
            error::raise(env, ErrorKind::Name, format!("unbound var: {}", Var::of(v).qualified()))
        }),
        _ => Err(error::type_error(env, "derefable", v)),
    }
}

fn reset_bang(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "reset!", args, 2)?;
    if args[0].heap_tag() != Some(HeapTag::Atom) {
        return Err(error::type_error(env, "atom", args[0]));
    }
    let obj = ObjAtom::of(args[0]);
    let old = obj.load();
    obj.cell.store(args[1].to_bits(), std::sync::atomic::Ordering::Release);
    fire_watches(env, args[0], old, args[1])?;
    Ok(args[1])
}

/// CAS-retry update. The function may be invoked multiple times under
/// contention.
fn swap_bang(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "swap!", args, 2)?;
    if args[0].heap_tag() != Some(HeapTag::Atom) {
        return Err(error::type_error(env, "atom", args[0]));
    }
    let obj = ObjAtom::of(args[0]);
    let scope = env.roots();
    loop {
        env.safe_point();
        let old = obj.load();
        let mut call_args = Vec::with_capacity(args.len() - 1);
        call_args.push(old);
        call_args.extend_from_slice(&args[2..]);
        let new = scope.keep(bridge::call_fn(env, args[1], &call_args)?);
        if obj.compare_and_set(old, new) {
            fire_watches(env, args[0], old, new)?;
            return Ok(new);
        }
    }
}

fn compare_and_set_bang(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "compare-and-set!", args, 3)?;
    if args[0].heap_tag() != Some(HeapTag::Atom) {
        return Err(error::type_error(env, "atom", args[0]));
    }
    let obj = ObjAtom::of(args[0]);
    let swapped = obj.compare_and_set(args[1], args[2]);
    if swapped {
        fire_watches(env, args[0], args[1], args[2])?;
    }
    Ok(Value::bool(swapped))
}

fn fire_watches(env: &Env, atom: Value, old: Value, new: Value) -> Result<(), Value> {
    let watches = ObjAtom::of(atom).watches.lock().expect("watches poisoned").clone();
    for (key, f) in watches {
        bridge::call_fn(env, f, &[key, atom, old, new])?;
    }
    Ok(())
}

fn add_watch(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "add-watch", args, 3)?;
    if args[0].heap_tag() != Some(HeapTag::Atom) {
        return Err(error::type_error(env, "atom", args[0]));
    }
    let obj = ObjAtom::of(args[0]);
    let mut watches = obj.watches.lock().expect("watches poisoned");
    watches.retain(|(k, _)| !k.identical(args[1]));
    watches.push((args[1], args[2]));
    Ok(args[0])
}

fn remove_watch(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "remove-watch", args, 2)?;
    if args[0].heap_tag() != Some(HeapTag::Atom) {
        return Err(error::type_error(env, "atom", args[0]));
    }
    let obj = ObjAtom::of(args[0]);
    obj.watches.lock().expect("watches poisoned").retain(|(k, _)| !k.identical(args[1]));
    Ok(args[0])
}

fn volatile_bang(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "volatile!", args, 1)?;
    env.alloc(ObjVolatile::new(args[0]))
}

fn vreset_bang(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "vreset!", args, 2)?;
    if args[0].heap_tag() != Some(HeapTag::Volatile) {
        return Err(error::type_error(env, "volatile", args[0]));
    }
    ObjVolatile::of(args[0]).store(args[1]);
    Ok(args[1])
}

fn vswap_bang(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "vswap!", args, 2)?;
    if args[0].heap_tag() != Some(HeapTag::Volatile) {
        return Err(error::type_error(env, "volatile", args[0]));
    }
    let obj = ObjVolatile::of(args[0]);
    let mut call_args = Vec::with_capacity(args.len() - 1);
    call_args.push(obj.load());
    call_args.extend_from_slice(&args[2..]);
    let new = bridge::call_fn(env, args[1], &call_args)?;
    obj.store(new);
    Ok(new)
}

fn var_arg(env: &Env, name: &str, v: Value) -> Result<&'static Var, Value> {
    if v.heap_tag() == Some(HeapTag::VarRef) {
        Ok(Var::of(v))
    } else {
        Err(error::raise(
            env,
            ErrorKind::Type,
            format!("{name} expects a var, got {}", crate::printer::type_name(v)),
        ))
    }
}

fn var_get(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "var-get", args, 1)?;
    let var = var_arg(env, "var-get", args[0])?;
    env.var_value(var)
        .ok_or_else(|| error::raise(env, ErrorKind::Name, format!("unbound var: {}", var.qualified())))
}

/// Writes the innermost thread binding; an unbound var is illegal state.
fn var_set(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "var-set", args, 2)?;
    let var = var_arg(env, "var-set", args[0])?;
    if !env.bindings.set(var, args[1]) {
        return Err(error::raise(
            env,
            ErrorKind::IllegalState,
            format!("var-set of {} outside binding", var.qualified()),
        ));
    }
    Ok(args[1])
}

fn alter_var_root(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "alter-var-root", args, 2)?;
    let var = var_arg(env, "alter-var-root", args[0])?;
    let old = var.root();
    let mut call_args = Vec::with_capacity(args.len() - 1);
    call_args.push(old);
    call_args.extend_from_slice(&args[2..]);
    let new = bridge::call_fn(env, args[1], &call_args)?;
    var.set_root(new);
    Ok(new)
}

fn delay_star(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "delay*", args, 1)?;
    env.alloc(ObjDelay {
        hdr: ObjHeader::new(HeapTag::Delay),
        state: Mutex::new(DelayState { thunk: args[0], value: None }),
    })
}

fn force_delay(env: &Env, v: Value) -> Result<Value, Value> {
    let obj = ObjDelay::of(v);
    let thunk = {
        let state = obj.state.lock().expect("delay poisoned");
        if let Some(done) = &state.value {
            return done.clone();
        }
        state.thunk
    };
    let outcome = bridge::call_fn(env, thunk, &[]);
    let mut state = obj.state.lock().expect("delay poisoned");
    match &state.value {
        Some(done) => done.clone(),
        None => {
            state.value = Some(outcome.clone());
            state.thunk = Value::NIL;
            outcome
        }
    }
}

fn force(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "force", args, 1)?;
    if args[0].heap_tag() == Some(HeapTag::Delay) {
        force_delay(env, args[0])
    } else {
        Ok(args[0])
    }
}

fn future_star(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "future*", args, 1)?;
    concurrency::make_future(env, args[0])
}

fn future_cancel(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "future-cancel", args, 1)?;
    if args[0].heap_tag() != Some(HeapTag::Future) {
        return Err(error::type_error(env, "future", args[0]));
    }
    Ok(concurrency::future_cancel(env, args[0]))
}

fn future_cancelled_p(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "future-cancelled?", args, 1)?;
    if args[0].heap_tag() != Some(HeapTag::Future) {
        return Err(error::type_error(env, "future", args[0]));
    }
    Ok(Value::bool(concurrency::future_cancelled(args[0])))
}

fn promise(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "promise", args, 0)?;
    concurrency::make_promise(env)
}

fn deliver(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "deliver", args, 2)?;
    concurrency::deliver(env, args[0], args[1])
}

fn agent(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "agent", args, 1)?;
    concurrency::make_agent(env, args[0])
}

fn send(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "send", args, 2)?;
    concurrency::send(env, args[0], args[1], &args[2..])
}

fn await_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "await", args, 1)?;
    for agent in args {
        concurrency::await_agent(env, *agent)?;
    }
    Ok(Value::NIL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        crate::builtins::test_env()
    }

    #[test]
    fn atom_reset_and_deref() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let a = scope.keep(atom(&env, &[Value::int(1)]).unwrap());
        assert_eq!(deref(&env, &[a]).unwrap().as_i64(), 1);
        reset_bang(&env, &[a, Value::int(2)]).unwrap();
        assert_eq!(deref(&env, &[a]).unwrap().as_i64(), 2);
    }

    #[test]
    fn swap_with_builtin_fn() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let a = scope.keep(atom(&env, &[Value::int(0)]).unwrap());
        let inc = env.var_value(env.resolve_var(Some("lyra.core"), "inc").unwrap()).unwrap();
        for _ in 0..1000 {
            swap_bang(&env, &[a, inc]).unwrap();
        }
        assert_eq!(deref(&env, &[a]).unwrap().as_i64(), 1000);
    }

    #[test]
    fn compare_and_set_checks_expected() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let a = scope.keep(atom(&env, &[Value::int(5)]).unwrap());
        let no = compare_and_set_bang(&env, &[a, Value::int(4), Value::int(9)]).unwrap();
        assert!(!no.is_truthy());
        let yes = compare_and_set_bang(&env, &[a, Value::int(5), Value::int(9)]).unwrap();
        assert!(yes.is_truthy());
        assert_eq!(deref(&env, &[a]).unwrap().as_i64(), 9);
    }

    #[test]
    fn volatile_has_no_watches_but_swaps() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let v = scope.keep(volatile_bang(&env, &[Value::int(10)]).unwrap());
        let inc = env.var_value(env.resolve_var(Some("lyra.core"), "inc").unwrap()).unwrap();
        vswap_bang(&env, &[v, inc]).unwrap();
        assert_eq!(deref(&env, &[v]).unwrap().as_i64(), 11);
    }
}
