//! Runtime Environment
//!
//! The single context value threaded through every builtin, both execution
//! engines, and the compiler. What the source language kept as module-level
//! mutable state (interned tables, PRNG, output-capture stack, shutdown
//! hooks, host registries) lives here as explicit fields. The only
//! process-global leftovers are the gensym counter and the diagnostics
//! registry, both behind their own locks.
//!
//! `Env` also owns the collected heap (via [`Gc`]) and enumerates the root
//! set: namespace vars, binding frames, retained chunk constant pools,
//! registered engines (VMs and tree-walk evaluators), per-thread temporary
//! roots, and embedder-registered root callbacks.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::ThreadId;

use rand::SeedableRng;

use crate::ast::AstArena;
use crate::bindings::BindingRegistry;
use crate::chunk::Chunk;
use crate::gc::Gc;
use crate::heap::{HeapObject, ObjArrayMap, ObjEmptyList, ObjHeader, ObjStr, Var};
use crate::intern::InternTable;
use crate::value::{HeapTag, Value};

/// A named map of Vars. Namespaces are infrastructure-tier: created during
/// bootstrap or by `ns` forms, never collected.
pub struct Namespace {
    pub name: Box<str>,
    vars: Mutex<HashMap<Box<str>, &'static Var>>,
}

impl Namespace {
    fn new(name: &str) -> Namespace {
        Namespace { name: name.into(), vars: Mutex::new(HashMap::new()) }
    }

    pub fn var(&self, name: &str) -> Option<&'static Var> {
        self.vars.lock().expect("namespace poisoned").get(name).copied()
    }

    pub fn var_names(&self) -> Vec<Box<str>> {
        self.vars.lock().expect("namespace poisoned").keys().cloned().collect()
    }

    fn insert(&self, name: &str, var: &'static Var) {
        self.vars.lock().expect("namespace poisoned").insert(name.into(), var);
    }

    fn push_roots(&self, work: &mut Vec<Value>) {
        for var in self.vars.lock().expect("namespace poisoned").values() {
            work.push(var.root());
        }
    }
}

/// Anything that can contribute to the root set while registered: the VM's
/// operand stack and frames, a tree-walk evaluator's scopes.
pub trait RootProvider {
    fn push_roots(&self, work: &mut Vec<Value>);
}

/// Scannable state of a background task (future body, agent queue) that must
/// stay rooted even when the handle value itself becomes unreachable while
/// the task is still running.
pub trait InFlightRoots: Send + Sync {
    fn push_roots(&self, work: &mut Vec<Value>);
}

struct RawProvider(*const dyn RootProvider);
// Safety: providers are only dereferenced under the GC rendezvous, while the
// owning engine is parked at a safe point.
unsafe impl Send for RawProvider {}

/// Where `print`-family output goes: the top of the capture stack, or stdout
/// when the stack is empty.
enum Sink {
    Buffer(String),
}

pub struct OutputStack {
    sinks: Mutex<Vec<Sink>>,
}

impl OutputStack {
    fn new() -> OutputStack {
        OutputStack { sinks: Mutex::new(Vec::new()) }
    }

    pub fn write(&self, s: &str) {
        let mut sinks = self.sinks.lock().expect("output stack poisoned");
        match sinks.last_mut() {
            Some(Sink::Buffer(buf)) => buf.push_str(s),
            None => {
                use std::io::Write;
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(s.as_bytes());
            }
        }
    }

    pub fn flush(&self) {
        use std::io::Write;
        let _ = std::io::stdout().lock().flush();
    }

    pub fn push_capture(&self) {
        self.sinks.lock().expect("output stack poisoned").push(Sink::Buffer(String::new()));
    }

    pub fn pop_capture(&self) -> Option<String> {
        match self.sinks.lock().expect("output stack poisoned").pop() {
            Some(Sink::Buffer(buf)) => Some(buf),
            None => None,
        }
    }

    pub fn depth(&self) -> usize {
        self.sinks.lock().expect("output stack poisoned").len()
    }
}

pub struct Env {
    // Field order is drop order: the collected heap must die before the
    // infrastructure arena that holds vars and interned symbols, and before
    // the AST arena that tree-walk closures point into.
    pub gc: Gc,
    pub interned: InternTable,
    pub bindings: BindingRegistry,
    pub output: OutputStack,
    pub ast: AstArena,

    namespaces: Mutex<HashMap<Box<str>, Arc<Namespace>>>,
    current_ns: Mutex<Box<str>>,

    /// The empty-list sentinel, one permanent instance.
    pub empty_list: Value,
    /// Preallocated out-of-memory exception: building one at failure time
    /// would itself allocate.
    oom_error: Value,

    chunks: Mutex<Vec<Arc<Chunk>>>,
    temp_roots: Mutex<HashMap<ThreadId, Vec<Value>>>,
    providers: Mutex<Vec<RawProvider>>,
    extra_roots: Mutex<Vec<Box<dyn Fn(&mut Vec<Value>) + Send + Sync>>>,
    in_flight: Mutex<Vec<(u64, Arc<dyn InFlightRoots>)>>,
    next_task_id: std::sync::atomic::AtomicU64,
    shutdown_hooks: Mutex<Vec<Value>>,

    /// Per-thread stack of active VMs; the call bridge re-enters the top one.
    active_vms: Mutex<HashMap<ThreadId, Vec<usize>>>,

    prng: Mutex<rand::rngs::StdRng>,

    print_level: OnceLock<&'static Var>,
    print_length: OnceLock<&'static Var>,

    self_ref: Mutex<Weak<Env>>,
}

pub const CORE_NS: &str = "lyra.core";
pub const USER_NS: &str = "user";

impl Env {
    pub fn new() -> Arc<Env> {
        let interned = InternTable::new();
        let empty_list = interned.alloc_permanent(ObjEmptyList {
            hdr: ObjHeader::permanent(HeapTag::EmptyList),
        });

        // :type :out-of-memory, :message "allocation failed", :phase :eval
        let k_type = interned.keyword(None, "type");
        let k_msg = interned.keyword(None, "message");
        let k_phase = interned.keyword(None, "phase");
        let oom_kind = interned.keyword(None, "out-of-memory");
        let phase = interned.keyword(None, "eval");
        let msg = interned.alloc_permanent(ObjStr::new("allocation failed"));
        let oom_error = interned.alloc_permanent(ObjArrayMap::new(vec![
            (k_type, oom_kind),
            (k_msg, msg),
            (k_phase, phase),
        ]));

        let env = Arc::new(Env {
            gc: Gc::new(),
            interned,
            bindings: BindingRegistry::new(),
            output: OutputStack::new(),
            ast: AstArena::new(),
            namespaces: Mutex::new(HashMap::new()),
            current_ns: Mutex::new(USER_NS.into()),
            empty_list,
            oom_error,
            chunks: Mutex::new(Vec::new()),
            temp_roots: Mutex::new(HashMap::new()),
            providers: Mutex::new(Vec::new()),
            extra_roots: Mutex::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            next_task_id: std::sync::atomic::AtomicU64::new(1),
            shutdown_hooks: Mutex::new(Vec::new()),
            active_vms: Mutex::new(HashMap::new()),
            prng: Mutex::new(rand::rngs::StdRng::from_entropy()),
            print_level: OnceLock::new(),
            print_length: OnceLock::new(),
            self_ref: Mutex::new(Weak::new()),
        });
        *env.self_ref.lock().expect("self ref poisoned") = Arc::downgrade(&env);
        env.ensure_namespace(CORE_NS);
        env.ensure_namespace(USER_NS);
        env
    }

    /// Strong handle to this environment, for spawning tasks.
    pub fn arc(&self) -> Arc<Env> {
        self.self_ref
            .lock()
            .expect("self ref poisoned")
            .upgrade()
            .expect("environment dropped while in use")
    }

    // =========================================================================
    // Namespaces and vars
    // =========================================================================

    pub fn ensure_namespace(&self, name: &str) -> Arc<Namespace> {
        let mut namespaces = self.namespaces.lock().expect("namespaces poisoned");
        if let Some(ns) = namespaces.get(name) {
            return ns.clone();
        }
        let ns = Arc::new(Namespace::new(name));
        namespaces.insert(name.into(), ns.clone());
        ns
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.lock().expect("namespaces poisoned").get(name).cloned()
    }

    pub fn namespace_names(&self) -> Vec<Box<str>> {
        self.namespaces.lock().expect("namespaces poisoned").keys().cloned().collect()
    }

    pub fn current_ns(&self) -> Box<str> {
        self.current_ns.lock().expect("current ns poisoned").clone()
    }

    pub fn set_current_ns(&self, name: &str) {
        self.ensure_namespace(name);
        *self.current_ns.lock().expect("current ns poisoned") = name.into();
    }

    /// Find-or-create the var `ns/name`. Vars are permanent; the returned
    /// reference is valid for the environment's lifetime.
    pub fn intern_var(&self, ns_name: &str, name: &str) -> &'static Var {
        let ns = self.ensure_namespace(ns_name);
        if let Some(var) = ns.var(name) {
            return var;
        }
        let value = self.interned.alloc_permanent(Var::new(ns_name, name));
        let var = Var::of(value);
        ns.insert(name, var);
        var
    }

    /// Resolve a possibly-qualified symbol to a var: explicit namespace, then
    /// the current namespace, then the core namespace.
    pub fn resolve_var(&self, ns_part: Option<&str>, name: &str) -> Option<&'static Var> {
        if let Some(ns_name) = ns_part {
            return self.namespace(ns_name)?.var(name);
        }
        let current = self.current_ns();
        if let Some(ns) = self.namespace(&current)
            && let Some(var) = ns.var(name)
        {
            return Some(var);
        }
        self.namespace(CORE_NS)?.var(name)
    }

    /// Deref a var: innermost thread binding, else root. `None` when the var
    /// has never been bound.
    pub fn var_value(&self, var: &'static Var) -> Option<Value> {
        if var.is_dynamic()
            && let Some(v) = self.bindings.lookup(var)
        {
            return Some(v);
        }
        if var.bound.load(Ordering::Acquire) { Some(var.root()) } else { None }
    }

    fn dyn_var(&self, cell: &OnceLock<&'static Var>, name: &'static str) -> &'static Var {
        cell.get_or_init(|| {
            let var = self.intern_var(CORE_NS, name);
            var.dynamic.store(true, Ordering::Release);
            var
        })
    }

    pub fn print_level_var(&self) -> &'static Var {
        self.dyn_var(&self.print_level, "*print-level*")
    }

    pub fn print_length_var(&self) -> &'static Var {
        self.dyn_var(&self.print_length, "*print-length*")
    }

    // =========================================================================
    // Interning shortcuts
    // =========================================================================

    pub fn keyword(&self, name: &str) -> Value {
        self.interned.keyword_from(name)
    }

    pub fn symbol(&self, name: &str) -> Value {
        self.interned.symbol_from(name)
    }

    // =========================================================================
    // Allocation and roots
    // =========================================================================

    /// Allocate on the collected heap. Out-of-memory comes back as the
    /// preallocated exception value, ready to propagate.
    pub fn alloc<T: HeapObject>(&self, obj: T) -> Result<Value, Value> {
        let roots = |work: &mut Vec<Value>| self.push_roots(work);
        self.gc.alloc(obj, &roots).map_err(|_| self.oom_error)
    }

    pub fn alloc_str(&self, s: impl Into<Box<str>>) -> Result<Value, Value> {
        self.alloc(ObjStr::new(s))
    }

    pub fn oom_error(&self) -> Value {
        self.oom_error
    }

    /// Safe point: collect here if the threshold is exceeded or another
    /// thread has requested a collection.
    pub fn safe_point(&self) {
        let roots = |work: &mut Vec<Value>| self.push_roots(work);
        self.gc.safe_point(&roots);
    }

    /// Force a collection now (gc builtin, tests).
    pub fn collect_now(&self) {
        let roots = |work: &mut Vec<Value>| self.push_roots(work);
        self.gc.collect(&roots);
    }

    /// Enumerate the full root set.
    pub fn push_roots(&self, work: &mut Vec<Value>) {
        for ns in self.namespaces.lock().expect("namespaces poisoned").values() {
            ns.push_roots(work);
        }
        self.bindings.push_roots(work);
        for chunk in self.chunks.lock().expect("chunks poisoned").iter() {
            chunk.push_roots(work);
        }
        for provider in self.providers.lock().expect("providers poisoned").iter() {
            // Safety: see RawProvider
            unsafe { (*provider.0).push_roots(work) };
        }
        for roots in self.temp_roots.lock().expect("temp roots poisoned").values() {
            work.extend_from_slice(roots);
        }
        for f in self.extra_roots.lock().expect("extra roots poisoned").iter() {
            f(work);
        }
        for (_, task) in self.in_flight.lock().expect("in-flight poisoned").iter() {
            task.push_roots(work);
        }
        work.extend_from_slice(&self.shutdown_hooks.lock().expect("hooks poisoned"));
    }

    /// Root a background task's scannable state until [`Env::task_done`].
    pub fn task_started(&self, task: Arc<dyn InFlightRoots>) -> u64 {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().expect("in-flight poisoned").push((id, task));
        id
    }

    pub fn task_done(&self, id: u64) {
        let mut tasks = self.in_flight.lock().expect("in-flight poisoned");
        if let Some(pos) = tasks.iter().position(|(tid, _)| *tid == id) {
            tasks.remove(pos);
        }
    }

    /// Register an engine as a root provider for the duration of the guard.
    pub fn register_provider(&self, provider: *const dyn RootProvider) -> ProviderGuard<'_> {
        self.providers.lock().expect("providers poisoned").push(RawProvider(provider));
        ProviderGuard { env: self, ptr: provider as *const () }
    }

    /// Embedder hook: a callback that contributes roots for externally owned
    /// scannable state.
    pub fn register_root(&self, f: Box<dyn Fn(&mut Vec<Value>) + Send + Sync>) {
        self.extra_roots.lock().expect("extra roots poisoned").push(f);
    }

    /// Open a temporary-root scope for the calling thread. Builtins use this
    /// to keep freshly built intermediates alive across further allocation.
    pub fn roots(&self) -> RootScope<'_> {
        let tid = std::thread::current().id();
        let mut map = self.temp_roots.lock().expect("temp roots poisoned");
        let stack = map.entry(tid).or_default();
        let base = stack.len();
        RootScope { env: self, tid, base }
    }

    fn temp_push(&self, tid: ThreadId, v: Value) {
        let mut map = self.temp_roots.lock().expect("temp roots poisoned");
        map.entry(tid).or_default().push(v);
    }

    fn temp_truncate(&self, tid: ThreadId, base: usize) {
        let mut map = self.temp_roots.lock().expect("temp roots poisoned");
        if let Some(stack) = map.get_mut(&tid) {
            stack.truncate(base);
        }
    }

    // =========================================================================
    // Retained chunks (their constant pools are roots)
    // =========================================================================

    pub fn retain_chunk(&self, chunk: Arc<Chunk>) {
        self.chunks.lock().expect("chunks poisoned").push(chunk);
    }

    // =========================================================================
    // Active-VM registry (call bridge)
    // =========================================================================

    pub fn push_active_vm(&self, vm: usize) {
        let tid = std::thread::current().id();
        self.active_vms.lock().expect("active vms poisoned").entry(tid).or_default().push(vm);
    }

    pub fn pop_active_vm(&self) {
        let tid = std::thread::current().id();
        let mut map = self.active_vms.lock().expect("active vms poisoned");
        if let Some(stack) = map.get_mut(&tid) {
            stack.pop();
            if stack.is_empty() {
                map.remove(&tid);
            }
        }
    }

    pub fn current_vm(&self) -> Option<usize> {
        let tid = std::thread::current().id();
        self.active_vms
            .lock()
            .expect("active vms poisoned")
            .get(&tid)
            .and_then(|stack| stack.last().copied())
    }

    // =========================================================================
    // Shutdown hooks and PRNG
    // =========================================================================

    pub fn add_shutdown_hook(&self, f: Value) {
        self.shutdown_hooks.lock().expect("hooks poisoned").push(f);
    }

    pub fn take_shutdown_hooks(&self) -> Vec<Value> {
        std::mem::take(&mut *self.shutdown_hooks.lock().expect("hooks poisoned"))
    }

    pub fn rand_f64(&self) -> f64 {
        use rand::Rng;
        // `gen` is a reserved word in edition 2024
        self.prng.lock().expect("prng poisoned").r#gen::<f64>()
    }

    pub fn rand_i64(&self, bound: i64) -> i64 {
        use rand::Rng;
        self.prng.lock().expect("prng poisoned").gen_range(0..bound)
    }
}

/// Removes the engine from the provider list on drop.
pub struct ProviderGuard<'e> {
    env: &'e Env,
    ptr: *const (),
}

impl Drop for ProviderGuard<'_> {
    fn drop(&mut self) {
        let mut providers = self.env.providers.lock().expect("providers poisoned");
        if let Some(pos) = providers.iter().rposition(|p| p.0 as *const () == self.ptr) {
            providers.remove(pos);
        }
    }
}

/// Scoped shadow stack of temporary roots; truncated on drop.
pub struct RootScope<'e> {
    env: &'e Env,
    tid: ThreadId,
    base: usize,
}

impl RootScope<'_> {
    /// Root `v` for the rest of this scope and hand it back.
    pub fn keep(&self, v: Value) -> Value {
        self.env.temp_push(self.tid, v);
        v
    }

    /// Reserve a single updatable root slot. Loops overwrite the slot on
    /// every iteration instead of growing the shadow stack unboundedly.
    pub fn slot(&self, v: Value) -> RootSlot<'_> {
        let mut map = self.env.temp_roots.lock().expect("temp roots poisoned");
        let stack = map.entry(self.tid).or_default();
        let index = stack.len();
        stack.push(v);
        RootSlot { env: self.env, tid: self.tid, index }
    }
}

/// One pinned, overwritable entry in the temporary-root shadow stack.
pub struct RootSlot<'e> {
    env: &'e Env,
    tid: ThreadId,
    index: usize,
}

impl RootSlot<'_> {
    pub fn set(&self, v: Value) {
        let mut map = self.env.temp_roots.lock().expect("temp roots poisoned");
        if let Some(stack) = map.get_mut(&self.tid)
            && let Some(cell) = stack.get_mut(self.index)
        {
            *cell = v;
        }
    }
}

impl Drop for RootScope<'_> {
    fn drop(&mut self) {
        self.env.temp_truncate(self.tid, self.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjCons;

    #[test]
    fn var_interning_and_resolution() {
        let env = Env::new();
        let var = env.intern_var(CORE_NS, "answer");
        var.set_root(Value::int(42));
        let resolved = env.resolve_var(None, "answer").expect("core fallback");
        assert!(std::ptr::eq(var, resolved));
        assert_eq!(env.var_value(resolved).unwrap().as_i64(), 42);
    }

    #[test]
    fn unbound_var_has_no_value() {
        let env = Env::new();
        let var = env.intern_var(USER_NS, "ghost");
        assert!(env.var_value(var).is_none());
    }

    #[test]
    fn temp_roots_survive_collection() {
        let env = Env::new();
        let _mutator = env.gc.register_mutator();
        let scope = env.roots();
        let v = scope.keep(env.alloc(ObjCons::new(Value::int(1), Value::NIL)).unwrap());
        env.collect_now();
        assert_eq!(ObjCons::of(v).first.as_i64(), 1);
        drop(scope);
        env.collect_now();
        assert_eq!(env.gc.stats.objects_live.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn var_roots_survive_collection() {
        let env = Env::new();
        let _mutator = env.gc.register_mutator();
        let var = env.intern_var(USER_NS, "kept");
        let v = env.alloc(ObjCons::new(Value::int(7), Value::NIL)).unwrap();
        var.set_root(v);
        env.collect_now();
        assert_eq!(ObjCons::of(var.root()).first.as_i64(), 7);
    }

    #[test]
    fn output_capture_stack() {
        let env = Env::new();
        env.output.push_capture();
        env.output.write("hello");
        env.output.write(" world");
        assert_eq!(env.output.pop_capture().as_deref(), Some("hello world"));
    }
}
