//! Bootstrap
//!
//! Populates the core namespace with the builtin set, evaluates the embedded
//! core library through the tree-walk engine (the compiler is not assumed
//! yet), then recompiles the library's definitions through the bytecode
//! compiler so subsequent calls run on the VM. A pre-serialized snapshot
//! (see `snapshot`) can replace the source pass.

use std::sync::Arc;

use lyra_runtime::env::{CORE_NS, Env, USER_NS};
use lyra_runtime::heap::{ClosureBody, ObjClosure, ObjHeader, ObjSymbol};
use lyra_runtime::{HeapTag, Value};

/// The curated core library, evaluated at startup. Macro-free by design:
/// everything here must be expressible with the analyzer's fixed sugar.
const CORE_SOURCE: &str = include_str!("../core/core.clj");

/// Build a fully bootstrapped environment.
pub fn new_env() -> Arc<Env> {
    let env = Env::new();
    install(&env);
    env
}

/// Bootstrap an existing environment in place.
pub fn install(env: &Env) {
    let count = lyra_runtime::builtins::install(env);
    tracing::debug!(builtins = count, "core namespace populated");

    // Well-known dynamic vars default to nil (no limit).
    env.print_level_var().set_root(Value::NIL);
    env.print_length_var().set_root(Value::NIL);

    lyra_runtime::diagnostics::register_env(&env.arc());
    lyra_runtime::diagnostics::install_signal_handler();

    let started = std::time::Instant::now();
    match crate::eval_str_treewalk(env, CORE_SOURCE) {
        Ok(_) => {}
        Err(crate::EvalError::Compile(e)) => {
            // A broken embedded library is a build defect, not a user error.
            panic!("core library failed to analyze: {} at {}", e.message, e.loc);
        }
        Err(crate::EvalError::Thrown(exc)) => {
            let msg = lyra_runtime::error::ex_message_str(env, exc)
                .unwrap_or_else(|| "unprintable exception".to_string());
            panic!("core library failed to load: {msg}");
        }
    }
    let recompiled = recompile_hot(env);
    env.set_current_ns(USER_NS);
    tracing::debug!(
        elapsed_us = started.elapsed().as_micros() as u64,
        recompiled,
        "core library loaded"
    );
}

/// Recompile tree-walk core definitions into bytecode closures. Only
/// closures with no environment captures (self-reference aside) qualify;
/// anything else keeps its tree body.
pub fn recompile_hot(env: &Env) -> usize {
    let Some(ns) = env.namespace(CORE_NS) else { return 0 };
    let mut recompiled = 0;
    for name in ns.var_names() {
        let Some(var) = ns.var(&name) else { continue };
        let value = var.root();
        if value.heap_tag() != Some(HeapTag::Closure) {
            continue;
        }
        let obj = ObjClosure::of(value);
        let ClosureBody::Tree(fn_ptr) = obj.body else { continue };
        // Safety: AST arena outlives the environment's closures.
        let fn_node = unsafe { &*fn_ptr };
        let only_self = fn_node
            .captures
            .iter()
            .all(|c| matches!(c, lyra_runtime::ast::CaptureSource::SelfRef));
        if !only_self {
            continue;
        }
        let Ok(proto) = crate::emit::compile_fn_node(env, fn_node) else {
            tracing::warn!(name = &*name, "core fn kept on tree walker");
            continue;
        };
        let self_slots: Vec<usize> = fn_node
            .captures
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, lyra_runtime::ast::CaptureSource::SelfRef))
            .map(|(i, _)| i)
            .collect();
        let captures = vec![Value::NIL; fn_node.captures.len()];
        let Ok(closure) = env.alloc(ObjClosure {
            hdr: ObjHeader::new(HeapTag::Closure),
            body: ClosureBody::Bytecode(proto),
            captures: captures.into_boxed_slice(),
            ns: env.interned.symbol(None, CORE_NS),
            name: obj.name.clone(),
            meta: Value::NIL,
        }) else {
            continue;
        };
        lyra_runtime::vm::patch_self_captures(closure, &self_slots);
        var.set_root(closure);
        recompiled += 1;
    }
    recompiled
}

/// Sanity probe used by the CLI and tests: the symbol table and namespace
/// wiring a bootstrapped env must always have.
pub fn is_bootstrapped(env: &Env) -> bool {
    env.resolve_var(Some(CORE_NS), "map").is_some()
        && env.namespace(USER_NS).is_some()
        && {
            let sym = env.symbol("lyra.core");
            ObjSymbol::of(sym).name.as_ref() == "lyra.core"
        }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_installs_builtins_and_core_fns() {
        let env = new_env();
        let _m = env.gc.register_mutator();
        assert!(is_bootstrapped(&env));
        // Core-library (non-builtin) functions exist…
        assert!(env.resolve_var(Some(CORE_NS), "every?").is_some());
        assert!(env.resolve_var(Some(CORE_NS), "zipmap").is_some());
        // …and came back as bytecode closures after hot recompilation.
        let var = env.resolve_var(Some(CORE_NS), "every?").unwrap();
        let v = var.root();
        assert_eq!(v.heap_tag(), Some(HeapTag::Closure));
        let obj = ObjClosure::of(v);
        assert!(matches!(obj.body, ClosureBody::Bytecode(_)), "hot fn must be recompiled");
    }

    #[test]
    fn current_namespace_is_user_after_bootstrap() {
        let env = new_env();
        assert_eq!(&*env.current_ns(), USER_NS);
    }
}
