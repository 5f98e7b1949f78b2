//! Futures, Promises, Agents
//!
//! Background tasks run on OS threads, each registered as a GC mutator.
//! The binding frame chain is conveyed by reference at spawn. Blocking
//! derefs sit inside a GC blocking region so a collection elsewhere never
//! waits on them.
//!
//! Cancellation is cooperative: `future-cancel` flags the future; a deref of
//! a cancelled future throws, in-progress native code is not interrupted.
//! Per-agent action order is submission order; there is no cross-agent or
//! cross-future ordering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::bridge;
use crate::env::Env;
use crate::error::{self, ErrorKind};
use crate::heap::{
    AgentShared, FutureShared, ObjAgent, ObjFuture, ObjHeader, ObjPromise, PromiseShared,
};
use crate::value::{HeapTag, Value};

// =============================================================================
// Futures
// =============================================================================

pub fn make_future(env: &Env, thunk: Value) -> Result<Value, Value> {
    let shared = Arc::new(FutureShared {
        task: Mutex::new(thunk),
        result: Mutex::new(None),
        done: Condvar::new(),
        cancelled: AtomicBool::new(false),
    });
    let task_id = env.task_started(shared.clone());
    let conveyed = env.bindings.snapshot();
    let env_arc = env.arc();
    let worker_shared = shared.clone();

    std::thread::spawn(move || {
        let env = env_arc;
        let _mutator = env.gc.register_mutator();
        env.bindings.adopt(conveyed);
        let thunk = *worker_shared.task.lock().expect("future task poisoned");
        let outcome = bridge::call_fn(&env, thunk, &[]);
        {
            let mut result = worker_shared.result.lock().expect("future result poisoned");
            *result = Some(outcome);
        }
        *worker_shared.task.lock().expect("future task poisoned") = Value::NIL;
        worker_shared.done.notify_all();
        env.bindings.clear_thread();
        env.task_done(task_id);
    });

    env.alloc(ObjFuture { hdr: ObjHeader::new(HeapTag::Future), shared })
}

/// Blocking deref with optional timeout. A cancelled future throws; a
/// timeout yields the caller-supplied default.
pub fn future_deref(
    env: &Env,
    fut: Value,
    timeout: Option<(Duration, Value)>,
) -> Result<Value, Value> {
    let shared = ObjFuture::of(fut).shared.clone();
    if shared.cancelled.load(Ordering::Acquire) {
        return Err(error::raise(env, ErrorKind::IllegalState, "future was cancelled"));
    }
    let outcome = env.gc.blocking_region(|| {
        let mut result = shared.result.lock().expect("future result poisoned");
        match timeout {
            None => {
                while result.is_none() {
                    result = shared.done.wait(result).expect("future result poisoned");
                }
                Some(result.clone().expect("checked above"))
            }
            Some((dur, _)) => {
                let deadline = std::time::Instant::now() + dur;
                while result.is_none() {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = shared
                        .done
                        .wait_timeout(result, deadline - now)
                        .expect("future result poisoned");
                    result = guard;
                }
                Some(result.clone().expect("checked above"))
            }
        }
    });
    if shared.cancelled.load(Ordering::Acquire) {
        return Err(error::raise(env, ErrorKind::IllegalState, "future was cancelled"));
    }
    match outcome {
        Some(done) => done,
        None => Ok(timeout.expect("timeout path").1),
    }
}

pub fn future_cancel(_env: &Env, fut: Value) -> Value {
    let shared = &ObjFuture::of(fut).shared;
    let was_done = shared.result.lock().expect("future result poisoned").is_some();
    if was_done {
        return Value::FALSE;
    }
    shared.cancelled.store(true, Ordering::Release);
    shared.done.notify_all();
    Value::TRUE
}

pub fn future_cancelled(fut: Value) -> bool {
    ObjFuture::of(fut).shared.cancelled.load(Ordering::Acquire)
}

pub fn future_realized(fut: Value) -> bool {
    ObjFuture::of(fut).shared.result.lock().expect("future result poisoned").is_some()
}

// =============================================================================
// Promises
// =============================================================================

pub fn make_promise(env: &Env) -> Result<Value, Value> {
    env.alloc(ObjPromise {
        hdr: ObjHeader::new(HeapTag::Promise),
        shared: Arc::new(PromiseShared { value: Mutex::new(None), delivered: Condvar::new() }),
    })
}

/// First delivery wins; later deliveries are no-ops returning nil.
pub fn deliver(env: &Env, promise: Value, v: Value) -> Result<Value, Value> {
    if promise.heap_tag() != Some(HeapTag::Promise) {
        return Err(error::type_error(env, "promise", promise));
    }
    let shared = &ObjPromise::of(promise).shared;
    let mut cell = shared.value.lock().expect("promise poisoned");
    if cell.is_none() {
        *cell = Some(v);
        drop(cell);
        shared.delivered.notify_all();
        Ok(promise)
    } else {
        Ok(Value::NIL)
    }
}

pub fn promise_deref(
    env: &Env,
    promise: Value,
    timeout: Option<(Duration, Value)>,
) -> Result<Value, Value> {
    let shared = ObjPromise::of(promise).shared.clone();
    let out = env.gc.blocking_region(|| {
        let mut cell = shared.value.lock().expect("promise poisoned");
        match timeout {
            None => {
                while cell.is_none() {
                    cell = shared.delivered.wait(cell).expect("promise poisoned");
                }
                *cell
            }
            Some((dur, default)) => {
                let deadline = std::time::Instant::now() + dur;
                while cell.is_none() {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Some(default);
                    }
                    let (guard, _) = shared
                        .delivered
                        .wait_timeout(cell, deadline - now)
                        .expect("promise poisoned");
                    cell = guard;
                }
                *cell
            }
        }
    });
    Ok(out.expect("promise wait yields a value"))
}

pub fn promise_realized(promise: Value) -> bool {
    ObjPromise::of(promise).shared.value.lock().expect("promise poisoned").is_some()
}

// =============================================================================
// Agents
// =============================================================================

pub fn make_agent(env: &Env, initial: Value) -> Result<Value, Value> {
    env.alloc(ObjAgent {
        hdr: ObjHeader::new(HeapTag::Agent),
        shared: Arc::new(AgentShared {
            value: Mutex::new(initial),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            idle: Condvar::new(),
        }),
    })
}

/// Enqueue `(f current-value args...)`. Actions on one agent apply in
/// submission order; a drainer thread is started when none is running.
pub fn send(env: &Env, agent: Value, f: Value, args: &[Value]) -> Result<Value, Value> {
    if agent.heap_tag() != Some(HeapTag::Agent) {
        return Err(error::type_error(env, "agent", agent));
    }
    let shared = ObjAgent::of(agent).shared.clone();
    shared.queue.lock().expect("agent queue poisoned").push_back((f, args.to_vec()));

    if !shared.draining.swap(true, Ordering::AcqRel) {
        let task_id = env.task_started(shared.clone());
        let conveyed = env.bindings.snapshot();
        let env_arc = env.arc();
        let worker = shared.clone();
        std::thread::spawn(move || {
            let env = env_arc;
            let _mutator = env.gc.register_mutator();
            env.bindings.adopt(conveyed);
            loop {
                let action = worker.queue.lock().expect("agent queue poisoned").pop_front();
                let Some((f, args)) = action else {
                    worker.draining.store(false, Ordering::Release);
                    // Re-check: a send may have raced the flag clear.
                    let empty = worker.queue.lock().expect("agent queue poisoned").is_empty();
                    if empty || worker.draining.swap(true, Ordering::AcqRel) {
                        break;
                    }
                    continue;
                };
                let current = *worker.value.lock().expect("agent value poisoned");
                let mut call_args = Vec::with_capacity(args.len() + 1);
                call_args.push(current);
                call_args.extend_from_slice(&args);
                // A throwing action leaves the agent value untouched.
                if let Ok(next) = bridge::call_fn(&env, f, &call_args) {
                    *worker.value.lock().expect("agent value poisoned") = next;
                }
                worker.idle.notify_all();
            }
            worker.idle.notify_all();
            env.bindings.clear_thread();
            env.task_done(task_id);
        });
    }
    Ok(agent)
}

pub fn agent_deref(agent: Value) -> Value {
    *ObjAgent::of(agent).shared.value.lock().expect("agent value poisoned")
}

/// Block until the agent's queue is drained.
pub fn await_agent(env: &Env, agent: Value) -> Result<Value, Value> {
    if agent.heap_tag() != Some(HeapTag::Agent) {
        return Err(error::type_error(env, "agent", agent));
    }
    let shared = ObjAgent::of(agent).shared.clone();
    env.gc.blocking_region(|| {
        let mut queue = shared.queue.lock().expect("agent queue poisoned");
        while !queue.is_empty() || shared.draining.load(Ordering::Acquire) {
            let (guard, _) = shared
                .idle
                .wait_timeout(queue, Duration::from_millis(10))
                .expect("agent queue poisoned");
            queue = guard;
        }
    });
    Ok(Value::NIL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        Env::new()
    }

    #[test]
    fn promise_deliver_then_deref() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let p = scope.keep(make_promise(&env).unwrap());
        assert!(!promise_realized(p));
        deliver(&env, p, Value::int(42)).unwrap();
        assert!(promise_realized(p));
        assert_eq!(promise_deref(&env, p, None).unwrap().as_i64(), 42);
        // Second delivery is a no-op.
        deliver(&env, p, Value::int(99)).unwrap();
        assert_eq!(promise_deref(&env, p, None).unwrap().as_i64(), 42);
    }

    #[test]
    fn promise_deref_timeout_returns_default() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let p = scope.keep(make_promise(&env).unwrap());
        let out = promise_deref(
            &env,
            p,
            Some((Duration::from_millis(10), Value::int(-1))),
        )
        .unwrap();
        assert_eq!(out.as_i64(), -1);
    }

    #[test]
    fn agent_applies_actions_in_order() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let a = scope.keep(make_agent(&env, Value::int(0)).unwrap());
        // Closures are not available at this layer; an uncallable action
        // exercises the queue machinery and the error policy (value stays).
        send(&env, a, Value::int(3), &[]).unwrap();
        await_agent(&env, a).unwrap();
        assert_eq!(agent_deref(a).as_i64(), 0, "failed action leaves the value");
    }
}
