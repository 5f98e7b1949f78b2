//! Runtime diagnostics for production debugging
//!
//! Installs a SIGQUIT (kill -3) handler that dumps heap and collector
//! statistics to stderr, similar to JVM thread dumps: useful for inspecting
//! a live process without stopping it.
//!
//! ```bash
//! kill -3 <pid>
//! ```

use std::sync::{Mutex, Once, OnceLock, Weak};

use crate::env::Env;

static SIGNAL_HANDLER_INIT: Once = Once::new();

fn registry() -> &'static Mutex<Vec<Weak<Env>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Weak<Env>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Track an environment for diagnostics dumps.
pub fn register_env(env: &std::sync::Arc<Env>) {
    registry().lock().expect("diagnostics registry poisoned").push(std::sync::Arc::downgrade(env));
}

/// Install the SIGQUIT handler. Idempotent; called by bootstrap.
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(all(unix, feature = "diagnostics"))]
        {
            unsafe {
                let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, || {
                    dump_diagnostics();
                });
            }
        }
    });
}

/// Dump runtime statistics to stderr. Callable directly or via SIGQUIT.
pub fn dump_diagnostics() {
    use std::io::Write;
    use std::sync::atomic::Ordering;

    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "\n=== Lyra Runtime Diagnostics ===");

    let mut envs = registry().lock().expect("diagnostics registry poisoned");
    envs.retain(|w| w.strong_count() > 0);
    for (i, weak) in envs.iter().enumerate() {
        let Some(env) = weak.upgrade() else { continue };
        let stats = &env.gc.stats;
        let (pools, pooled) = env.gc.pool_occupancy();
        let _ = writeln!(out, "\n[Environment {i}]");
        let _ = writeln!(out, "  Heap bytes:      {}", stats.bytes_live.load(Ordering::Relaxed));
        let _ = writeln!(out, "  Heap objects:    {}", stats.objects_live.load(Ordering::Relaxed));
        let _ = writeln!(out, "  GC cycles:       {}", stats.collections.load(Ordering::Relaxed));
        let _ =
            writeln!(out, "  Objects swept:   {}", stats.objects_swept.load(Ordering::Relaxed));
        let _ = writeln!(out, "  Free pools:      {pools} ({pooled} blocks)");
        let _ = writeln!(out, "  Interned syms:   {}", env.interned.symbol_count());
        let _ = writeln!(out, "  Interned kws:    {}", env.interned.keyword_count());
        let _ = writeln!(out, "  Namespaces:      {}", env.namespace_names().len());
    }

    let _ = writeln!(out, "\n=== End Diagnostics ===\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_survives_with_and_without_envs() {
        // Smoke test: must not panic.
        dump_diagnostics();
        let env = Env::new();
        register_env(&env);
        dump_diagnostics();
    }
}
