//! Collector stress: allocation churn, pool recycling, root integrity, and
//! the cross-thread safe-point handshake.

use std::sync::atomic::Ordering;

use lyra_runtime::env::Env;
use lyra_runtime::heap::{ObjCons, ObjStr, ObjVector};
use lyra_runtime::seq;
use lyra_runtime::value::Value;

#[test]
fn churn_reclaims_garbage_and_reuses_pools() {
    let env = Env::new();
    let _m = env.gc.register_mutator();
    for round in 0..50 {
        {
            let scope = env.roots();
            let mut head = Value::NIL;
            for i in 0..200 {
                head = scope.keep(
                    env.alloc(ObjCons::new(Value::int(i), head)).expect("alloc"),
                );
            }
        }
        // Everything from this round is unreachable now.
        env.collect_now();
        assert_eq!(
            env.gc.stats.objects_live.load(Ordering::Relaxed),
            0,
            "round {round} leaked"
        );
    }
    let (pools, entries) = env.gc.pool_occupancy();
    assert!(pools >= 1);
    assert!(entries > 0, "cons cells must recycle through the free pools");
    assert!(
        env.gc.stats.pool_hits.load(Ordering::Relaxed) > 0,
        "later rounds must allocate out of the pools"
    );
}

#[test]
fn reachable_structures_survive_many_collections() {
    let env = Env::new();
    let _m = env.gc.register_mutator();
    let var = env.intern_var("user", "survivor");
    let scope = env.roots();
    let items: Vec<Value> = (0..64).map(Value::int).collect();
    let vec_v = scope.keep(env.alloc(ObjVector::new(items)).unwrap());
    let list_v = scope.keep(seq::list_from(&env, &[vec_v, Value::int(-1)]).unwrap());
    var.set_root(list_v);

    for _ in 0..10 {
        // Allocate garbage between collections.
        for i in 0..500 {
            let _ = env.alloc(ObjStr::new(format!("garbage-{i}"))).unwrap();
        }
        env.collect_now();
    }

    let survived = var.root();
    let first = seq::first(&env, survived).unwrap();
    assert_eq!(ObjVector::of(first).items.len(), 64);
    assert_eq!(ObjVector::of(first).items[63].as_i64(), 63);
}

#[test]
fn lazy_chain_survives_collection_mid_stream() {
    let env = Env::new();
    let _m = env.gc.register_mutator();
    let scope = env.roots();
    let chain = seq::ChainDesc::from_source(seq::ChainSource::Range {
        next: 0,
        end: Some(10_000),
        step: 1,
    });
    let lazy = scope.keep(seq::lazy_from_chain(&env, chain).unwrap());
    let mut sum = 0i64;
    seq::fold(&env, lazy, Value::NIL, &mut |env, acc, v| {
        sum += v.as_i64();
        if v.as_i64() % 1000 == 0 {
            env.collect_now();
        }
        Ok(acc)
    })
    .unwrap();
    assert_eq!(sum, (0..10_000).sum::<i64>());
}

#[test]
fn worker_threads_rendezvous_at_safe_points() {
    let env = Env::new();
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let env = env.clone();
            std::thread::spawn(move || {
                let _m = env.gc.register_mutator();
                let scope = env.roots();
                let mut head = Value::NIL;
                for i in 0..5_000 {
                    head = scope.keep(
                        env.alloc(ObjCons::new(Value::int(t * 10_000 + i), head)).unwrap(),
                    );
                    if i % 512 == 0 {
                        env.safe_point();
                    }
                }
                // Verify the chain is intact end to end.
                let mut n = 0;
                let mut cur = head;
                while !cur.is_nil() {
                    cur = ObjCons::of(cur).rest;
                    n += 1;
                }
                n
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().expect("worker"), 5_000);
    }
}
