//! Heap Object Taxonomy
//!
//! One Rust struct per heap sub-tag, each beginning with an [`ObjHeader`] so
//! the collector can read the tag and mark word without knowing the concrete
//! type. Tracing and destruction dispatch on [`HeapTag`]; adding a sub-tag
//! without extending the dispatch tables is a compile error because every
//! match here is exhaustive.
//!
//! Invariants:
//! - strings, symbols, and keywords are immutable UTF-8
//! - symbols and keywords are interned; pointer equality is full equality
//! - the only mutation points are atoms, volatiles, transients, and the
//!   memoization slot of lazy sequences; each is traced through its lock
//! - a reduced sentinel never ends up inside a collection

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

use crate::ast::FnNode;
use crate::chunk::FnProto;
use crate::protocols::TypeKey;
use crate::seq::ChainDesc;
use crate::value::{HeapTag, Value};

/// Common prefix of every heap object. The collector flips the mark byte
/// during tracing; `permanent` marks infrastructure-tier objects that are
/// roots by construction and never swept.
#[repr(C, align(8))]
#[derive(Debug)]
pub struct ObjHeader {
    pub tag: HeapTag,
    mark: std::sync::atomic::AtomicU8,
    pub permanent: bool,
}

impl ObjHeader {
    pub fn new(tag: HeapTag) -> ObjHeader {
        ObjHeader {
            tag,
            mark: std::sync::atomic::AtomicU8::new(0),
            permanent: false,
        }
    }

    pub fn permanent(tag: HeapTag) -> ObjHeader {
        ObjHeader {
            tag,
            mark: std::sync::atomic::AtomicU8::new(0),
            permanent: true,
        }
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Relaxed) != 0
    }

    #[inline]
    pub fn set_mark(&self, on: bool) {
        self.mark.store(on as u8, Ordering::Relaxed);
    }
}

/// Implemented by every concrete heap object so the allocator can attach the
/// right tag and the collector can enumerate children.
pub trait HeapObject: Sized {
    const TAG: HeapTag;
    fn header(&self) -> &ObjHeader;
    /// Push every Value this object holds onto the mark worklist.
    fn trace(&self, work: &mut Vec<Value>);
}

macro_rules! heap_object {
    ($ty:ident, $tag:expr) => {
        impl HeapObject for $ty {
            const TAG: HeapTag = $tag;
            fn header(&self) -> &ObjHeader {
                &self.hdr
            }
            fn trace(&self, work: &mut Vec<Value>) {
                self.trace_children(work);
            }
        }

        impl $ty {
            /// Typed view of a tagged value. The tag/type correspondence is
            /// maintained by the allocator; the returned reference lives as
            /// long as the object stays reachable.
            #[inline]
            pub fn of(v: Value) -> &'static $ty {
                debug_assert_eq!(v.heap_tag(), Some($tag), "tag mismatch in {}::of", stringify!($ty));
                unsafe { &*(v.heap_ptr() as *const $ty) }
            }
        }
    };
}

// =============================================================================
// Immutable leaves
// =============================================================================

/// Immutable UTF-8 string.
#[repr(C)]
pub struct ObjStr {
    pub hdr: ObjHeader,
    pub data: Box<str>,
}

impl ObjStr {
    pub fn new(data: impl Into<Box<str>>) -> ObjStr {
        ObjStr { hdr: ObjHeader::new(HeapTag::Str), data: data.into() }
    }
    fn trace_children(&self, _work: &mut Vec<Value>) {}
}
heap_object!(ObjStr, HeapTag::Str);

/// Interned symbol. `eq` by pointer is valid; the interning table keeps every
/// entry alive as a permanent root.
#[repr(C)]
pub struct ObjSymbol {
    pub hdr: ObjHeader,
    pub ns: Option<Box<str>>,
    pub name: Box<str>,
}

impl ObjSymbol {
    fn trace_children(&self, _work: &mut Vec<Value>) {}
    pub fn qualified(&self) -> String {
        match &self.ns {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.to_string(),
        }
    }
}
heap_object!(ObjSymbol, HeapTag::Symbol);

/// Interned keyword, same identity discipline as symbols.
#[repr(C)]
pub struct ObjKeyword {
    pub hdr: ObjHeader,
    pub ns: Option<Box<str>>,
    pub name: Box<str>,
}

impl ObjKeyword {
    fn trace_children(&self, _work: &mut Vec<Value>) {}
    pub fn qualified(&self) -> String {
        match &self.ns {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.to_string(),
        }
    }
}
heap_object!(ObjKeyword, HeapTag::Keyword);

/// Compiled regex literal. Equality is by source pattern.
#[repr(C)]
pub struct ObjRegex {
    pub hdr: ObjHeader,
    pub source: Box<str>,
    pub compiled: regex::Regex,
}

impl ObjRegex {
    fn trace_children(&self, _work: &mut Vec<Value>) {}
}
heap_object!(ObjRegex, HeapTag::Regex);

// =============================================================================
// Persistent collections
// =============================================================================

/// Singly-linked list cell. Fields are immutable after construction.
#[repr(C)]
pub struct ObjCons {
    pub hdr: ObjHeader,
    pub first: Value,
    pub rest: Value,
}

impl ObjCons {
    pub fn new(first: Value, rest: Value) -> ObjCons {
        ObjCons { hdr: ObjHeader::new(HeapTag::Cons), first, rest }
    }
    fn trace_children(&self, work: &mut Vec<Value>) {
        work.push(self.first);
        work.push(self.rest);
    }
}
heap_object!(ObjCons, HeapTag::Cons);

/// The empty-list sentinel. One permanent instance per environment.
#[repr(C)]
pub struct ObjEmptyList {
    pub hdr: ObjHeader,
}

impl ObjEmptyList {
    fn trace_children(&self, _work: &mut Vec<Value>) {}
}
heap_object!(ObjEmptyList, HeapTag::EmptyList);

/// Persistent vector. Copy-on-write backing array; the structural-sharing
/// tree representation lives in the collections layer and is opaque here.
#[repr(C)]
pub struct ObjVector {
    pub hdr: ObjHeader,
    pub items: Box<[Value]>,
    pub meta: Value,
}

impl ObjVector {
    pub fn new(items: Vec<Value>) -> ObjVector {
        ObjVector { hdr: ObjHeader::new(HeapTag::Vector), items: items.into_boxed_slice(), meta: Value::NIL }
    }
    fn trace_children(&self, work: &mut Vec<Value>) {
        work.extend_from_slice(&self.items);
        work.push(self.meta);
    }
}
heap_object!(ObjVector, HeapTag::Vector);

/// Small map preserving insertion order; promoted to [`ObjHashMap`] past
/// [`ARRAY_MAP_MAX`] entries.
#[repr(C)]
pub struct ObjArrayMap {
    pub hdr: ObjHeader,
    pub entries: Box<[(Value, Value)]>,
    pub meta: Value,
}

/// Entry count at which assoc promotes an array-map to a hash-map.
pub const ARRAY_MAP_MAX: usize = 8;

impl ObjArrayMap {
    pub fn new(entries: Vec<(Value, Value)>) -> ObjArrayMap {
        ObjArrayMap {
            hdr: ObjHeader::new(HeapTag::ArrayMap),
            entries: entries.into_boxed_slice(),
            meta: Value::NIL,
        }
    }
    fn trace_children(&self, work: &mut Vec<Value>) {
        for (k, v) in self.entries.iter() {
            work.push(*k);
            work.push(*v);
        }
        work.push(self.meta);
    }
}
heap_object!(ObjArrayMap, HeapTag::ArrayMap);

/// Hash map: insertion-ordered entry vector plus a hash index mapping value
/// hashes to entry positions. Lookup and equality go through the runtime's
/// own hash/equiv functions, so the index never needs `Hash` on `Value`.
#[repr(C)]
pub struct ObjHashMap {
    pub hdr: ObjHeader,
    pub entries: Vec<(Value, Value)>,
    pub index: HashMap<u32, Vec<u32>>,
    pub meta: Value,
}

impl ObjHashMap {
    fn trace_children(&self, work: &mut Vec<Value>) {
        for (k, v) in self.entries.iter() {
            work.push(*k);
            work.push(*v);
        }
        work.push(self.meta);
    }
}
heap_object!(ObjHashMap, HeapTag::HashMap);

/// Hash set with the same entry-vector-plus-index layout as [`ObjHashMap`].
#[repr(C)]
pub struct ObjHashSet {
    pub hdr: ObjHeader,
    pub entries: Vec<Value>,
    pub index: HashMap<u32, Vec<u32>>,
    pub meta: Value,
}

impl ObjHashSet {
    fn trace_children(&self, work: &mut Vec<Value>) {
        work.extend_from_slice(&self.entries);
        work.push(self.meta);
    }
}
heap_object!(ObjHashSet, HeapTag::HashSet);

/// Contiguous slice of realized elements. The backing array is shared, so
/// advancing a chunked view is an offset bump, not a copy.
#[repr(C)]
pub struct ObjArrayChunk {
    pub hdr: ObjHeader,
    pub items: Arc<[Value]>,
    pub off: u32,
}

impl ObjArrayChunk {
    fn trace_children(&self, work: &mut Vec<Value>) {
        work.extend_from_slice(&self.items);
    }
}
heap_object!(ObjArrayChunk, HeapTag::ArrayChunk);

/// Chunked cons: a chunk of elements plus the remainder of the sequence.
#[repr(C)]
pub struct ObjChunkedCons {
    pub hdr: ObjHeader,
    pub chunk: Value,
    pub rest: Value,
}

impl ObjChunkedCons {
    fn trace_children(&self, work: &mut Vec<Value>) {
        work.push(self.chunk);
        work.push(self.rest);
    }
}
heap_object!(ObjChunkedCons, HeapTag::ChunkedCons);

// =============================================================================
// Functions
// =============================================================================

/// Which engine executes a closure's body.
pub enum ClosureBody {
    /// Compiled prototype; the VM pushes a frame and jumps to its entry.
    Bytecode(Arc<FnProto>),
    /// Analyzer node; the tree-walk evaluator interprets it. The AST arena
    /// outlives every closure that captures into it (environment teardown
    /// frees both heap and arena together).
    Tree(*const FnNode),
    /// Partial application: call `f` with `args` prepended. Backs `partial`,
    /// `comp`, and the single-argument (transducer-style) seq arities.
    Partial { f: Value, args: Box<[Value]> },
}

/// A closure: body + captured values + defining namespace + metadata.
#[repr(C)]
pub struct ObjClosure {
    pub hdr: ObjHeader,
    pub body: ClosureBody,
    pub captures: Box<[Value]>,
    /// Symbol naming the defining namespace, or nil before bootstrap.
    pub ns: Value,
    pub name: Option<Box<str>>,
    pub meta: Value,
}

impl ObjClosure {
    fn trace_children(&self, work: &mut Vec<Value>) {
        work.extend_from_slice(&self.captures);
        work.push(self.ns);
        work.push(self.meta);
        match &self.body {
            ClosureBody::Bytecode(proto) => work.extend_from_slice(&proto.consts),
            ClosureBody::Partial { f, args } => {
                work.push(*f);
                work.extend_from_slice(args);
            }
            ClosureBody::Tree(_) => {}
        }
    }
}
heap_object!(ObjClosure, HeapTag::Closure);

// =============================================================================
// Mutation points
// =============================================================================

/// Atom: CAS-updated cell plus watch functions.
#[repr(C)]
pub struct ObjAtom {
    pub hdr: ObjHeader,
    pub cell: AtomicU64,
    pub watches: Mutex<Vec<(Value, Value)>>,
    pub meta: Value,
}

impl ObjAtom {
    pub fn new(v: Value) -> ObjAtom {
        ObjAtom {
            hdr: ObjHeader::new(HeapTag::Atom),
            cell: AtomicU64::new(v.to_bits()),
            watches: Mutex::new(Vec::new()),
            meta: Value::NIL,
        }
    }

    #[inline]
    pub fn load(&self) -> Value {
        Value::from_bits(self.cell.load(Ordering::Acquire))
    }

    /// Compare-and-set on the raw bits; callers loop for swap! semantics.
    #[inline]
    pub fn compare_and_set(&self, old: Value, new: Value) -> bool {
        self.cell
            .compare_exchange(old.to_bits(), new.to_bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn trace_children(&self, work: &mut Vec<Value>) {
        work.push(self.load());
        work.push(self.meta);
        if let Ok(watches) = self.watches.lock() {
            for (k, f) in watches.iter() {
                work.push(*k);
                work.push(*f);
            }
        }
    }
}
heap_object!(ObjAtom, HeapTag::Atom);

/// Volatile: unsynchronized-by-contract single-thread cell, no watches.
#[repr(C)]
pub struct ObjVolatile {
    pub hdr: ObjHeader,
    pub cell: AtomicU64,
}

impl ObjVolatile {
    pub fn new(v: Value) -> ObjVolatile {
        ObjVolatile { hdr: ObjHeader::new(HeapTag::Volatile), cell: AtomicU64::new(v.to_bits()) }
    }
    #[inline]
    pub fn load(&self) -> Value {
        Value::from_bits(self.cell.load(Ordering::Relaxed))
    }
    #[inline]
    pub fn store(&self, v: Value) {
        self.cell.store(v.to_bits(), Ordering::Relaxed);
    }
    fn trace_children(&self, work: &mut Vec<Value>) {
        work.push(self.load());
    }
}
heap_object!(ObjVolatile, HeapTag::Volatile);

/// Transient collection innards share the owner-thread discipline: mutation
/// from any other thread signals illegal-state at the builtin layer.
#[repr(C)]
pub struct ObjTransientVector {
    pub hdr: ObjHeader,
    pub owner: ThreadId,
    pub items: Mutex<Vec<Value>>,
    pub editable: AtomicBool,
}

impl ObjTransientVector {
    fn trace_children(&self, work: &mut Vec<Value>) {
        if let Ok(items) = self.items.lock() {
            work.extend_from_slice(&items);
        }
    }
}
heap_object!(ObjTransientVector, HeapTag::TransientVector);

pub struct TransientMapInner {
    pub entries: Vec<(Value, Value)>,
    pub index: HashMap<u32, Vec<u32>>,
}

#[repr(C)]
pub struct ObjTransientMap {
    pub hdr: ObjHeader,
    pub owner: ThreadId,
    pub inner: Mutex<TransientMapInner>,
    pub editable: AtomicBool,
}

impl ObjTransientMap {
    fn trace_children(&self, work: &mut Vec<Value>) {
        if let Ok(inner) = self.inner.lock() {
            for (k, v) in inner.entries.iter() {
                work.push(*k);
                work.push(*v);
            }
        }
    }
}
heap_object!(ObjTransientMap, HeapTag::TransientMap);

pub struct TransientSetInner {
    pub entries: Vec<Value>,
    pub index: HashMap<u32, Vec<u32>>,
}

#[repr(C)]
pub struct ObjTransientSet {
    pub hdr: ObjHeader,
    pub owner: ThreadId,
    pub inner: Mutex<TransientSetInner>,
    pub editable: AtomicBool,
}

impl ObjTransientSet {
    fn trace_children(&self, work: &mut Vec<Value>) {
        if let Ok(inner) = self.inner.lock() {
            work.extend_from_slice(&inner.entries);
        }
    }
}
heap_object!(ObjTransientSet, HeapTag::TransientSet);

/// Mutable array for interop-style workloads (`to-array`, `aset`).
#[repr(C)]
pub struct ObjMutableArray {
    pub hdr: ObjHeader,
    pub items: Mutex<Vec<Value>>,
}

impl ObjMutableArray {
    fn trace_children(&self, work: &mut Vec<Value>) {
        if let Ok(items) = self.items.lock() {
            work.extend_from_slice(&items);
        }
    }
}
heap_object!(ObjMutableArray, HeapTag::MutableArray);

// =============================================================================
// Laziness and reduction
// =============================================================================

/// Memoization state of a lazy cell. `realized` holds the forced seq (a cons
/// chain, chunked cons, or nil) once the thunk has run; forcing is idempotent.
pub struct LazyState {
    pub thunk: Value,
    pub realized: Option<Value>,
}

/// Lazy sequence cell: a thunk plus an optional chain descriptor recording
/// fused transforms for single-pass reduction.
#[repr(C)]
pub struct ObjLazySeq {
    pub hdr: ObjHeader,
    pub state: Mutex<LazyState>,
    pub chain: Option<Box<ChainDesc>>,
}

impl ObjLazySeq {
    fn trace_children(&self, work: &mut Vec<Value>) {
        if let Ok(state) = self.state.lock() {
            work.push(state.thunk);
            if let Some(r) = state.realized {
                work.push(r);
            }
        }
        if let Some(chain) = &self.chain {
            chain.trace(work);
        }
    }
}
heap_object!(ObjLazySeq, HeapTag::LazySeq);

/// Delay: thunk run at most once under `force`/`deref`.
pub struct DelayState {
    pub thunk: Value,
    pub value: Option<Result<Value, Value>>,
}

#[repr(C)]
pub struct ObjDelay {
    pub hdr: ObjHeader,
    pub state: Mutex<DelayState>,
}

impl ObjDelay {
    fn trace_children(&self, work: &mut Vec<Value>) {
        if let Ok(state) = self.state.lock() {
            work.push(state.thunk);
            match state.value {
                Some(Ok(v)) | Some(Err(v)) => work.push(v),
                None => {}
            }
        }
    }
}
heap_object!(ObjDelay, HeapTag::Delay);

/// One-field box that short-circuits reduction. Must be unwrapped before
/// control returns to user code.
#[repr(C)]
pub struct ObjReduced {
    pub hdr: ObjHeader,
    pub value: Value,
}

impl ObjReduced {
    fn trace_children(&self, work: &mut Vec<Value>) {
        work.push(self.value);
    }
}
heap_object!(ObjReduced, HeapTag::Reduced);

// =============================================================================
// Dispatch machinery
// =============================================================================

/// Named interface: method names plus an implementation map from type key to
/// method functions. Every extension bumps `generation`, invalidating the
/// monomorphic caches on protocol-method values.
#[repr(C)]
pub struct ObjProtocol {
    pub hdr: ObjHeader,
    pub name: Value,
    pub method_names: Box<[Value]>,
    pub impls: Mutex<HashMap<TypeKey, HashMap<Box<str>, Value>>>,
    pub generation: AtomicU64,
}

impl ObjProtocol {
    fn trace_children(&self, work: &mut Vec<Value>) {
        work.push(self.name);
        work.extend_from_slice(&self.method_names);
        if let Ok(impls) = self.impls.lock() {
            for methods in impls.values() {
                for f in methods.values() {
                    work.push(*f);
                }
            }
        }
    }
}
heap_object!(ObjProtocol, HeapTag::Protocol);

/// First-class protocol method. Carries a monomorphic inline cache stamped
/// with the protocol generation it observed.
#[repr(C)]
pub struct ObjProtocolMethod {
    pub hdr: ObjHeader,
    pub protocol: Value,
    pub name: Box<str>,
    pub cache_gen: AtomicU64,
    pub cache_key: AtomicU32,
    pub cache_fn: AtomicU64,
}

impl ObjProtocolMethod {
    fn trace_children(&self, work: &mut Vec<Value>) {
        work.push(self.protocol);
        let cached = self.cache_fn.load(Ordering::Relaxed);
        if cached != 0 {
            work.push(Value::from_bits(cached));
        }
    }
}
heap_object!(ObjProtocolMethod, HeapTag::ProtocolMethod);

/// Mutable half of a multimethod, behind one lock: the method table, the
/// preference graph, and the dispatch-value cache.
pub struct MultiState {
    pub methods: Vec<(Value, Value)>,
    pub prefers: Vec<(Value, Value)>,
    pub default_method: Option<Value>,
    /// dispatch-value -> resolved method; cleared on every defmethod/prefer.
    pub cache: Vec<(Value, Value)>,
}

#[repr(C)]
pub struct ObjMultimethod {
    pub hdr: ObjHeader,
    pub name: Value,
    pub dispatch_fn: Value,
    pub state: Mutex<MultiState>,
    /// Identity cache: raw bits of the last first argument and the method it
    /// resolved to. Skips the dispatch function entirely on a hit.
    pub ident_arg: AtomicU64,
    pub ident_method: AtomicU64,
}

impl ObjMultimethod {
    fn trace_children(&self, work: &mut Vec<Value>) {
        work.push(self.name);
        work.push(self.dispatch_fn);
        if let Ok(state) = self.state.lock() {
            for (dv, m) in state.methods.iter().chain(state.cache.iter()) {
                work.push(*dv);
                work.push(*m);
            }
            for (a, b) in state.prefers.iter() {
                work.push(*a);
                work.push(*b);
            }
            if let Some(d) = state.default_method {
                work.push(d);
            }
        }
        let m = self.ident_method.load(Ordering::Relaxed);
        if m != 0 {
            work.push(Value::from_bits(m));
        }
    }
}
heap_object!(ObjMultimethod, HeapTag::Multimethod);

// =============================================================================
// Vars
// =============================================================================

/// A named, rebindable cell in a namespace. Vars live in the infrastructure
/// arena (never collected); their root values are GC roots via the namespace
/// registry. `generation` invalidates var-load inline caches on redefinition.
#[repr(C)]
#[derive(Debug)]
pub struct Var {
    pub hdr: ObjHeader,
    pub ns_name: Box<str>,
    pub name: Box<str>,
    root: AtomicU64,
    pub dynamic: AtomicBool,
    pub bound: AtomicBool,
    pub generation: AtomicU64,
}

impl Var {
    pub fn new(ns_name: impl Into<Box<str>>, name: impl Into<Box<str>>) -> Var {
        Var {
            hdr: ObjHeader::permanent(HeapTag::VarRef),
            ns_name: ns_name.into(),
            name: name.into(),
            root: AtomicU64::new(Value::NIL.to_bits()),
            dynamic: AtomicBool::new(false),
            bound: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn root(&self) -> Value {
        Value::from_bits(self.root.load(Ordering::Acquire))
    }

    pub fn set_root(&self, v: Value) {
        self.root.store(v.to_bits(), Ordering::Release);
        self.bound.store(true, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic.load(Ordering::Acquire)
    }

    pub fn qualified(&self) -> String {
        format!("{}/{}", self.ns_name, self.name)
    }

    fn trace_children(&self, work: &mut Vec<Value>) {
        work.push(self.root());
    }
}
heap_object!(Var, HeapTag::VarRef);

// =============================================================================
// Concurrency cells
// =============================================================================

pub struct FutureShared {
    /// The thunk, held here (and traced) until the worker finishes with it.
    pub task: Mutex<Value>,
    pub result: Mutex<Option<Result<Value, Value>>>,
    pub done: Condvar,
    pub cancelled: AtomicBool,
}

impl crate::env::InFlightRoots for FutureShared {
    fn push_roots(&self, work: &mut Vec<Value>) {
        if let Ok(task) = self.task.lock() {
            work.push(*task);
        }
        if let Ok(result) = self.result.lock() {
            match *result {
                Some(Ok(v)) | Some(Err(v)) => work.push(v),
                None => {}
            }
        }
    }
}

/// Future handle. The worker thread holds a clone of the Arc; the shared
/// result is traced from this object, and the worker roots its temporaries
/// through its own mutator registration.
#[repr(C)]
pub struct ObjFuture {
    pub hdr: ObjHeader,
    pub shared: Arc<FutureShared>,
}

impl ObjFuture {
    fn trace_children(&self, work: &mut Vec<Value>) {
        crate::env::InFlightRoots::push_roots(&*self.shared, work);
    }
}
heap_object!(ObjFuture, HeapTag::Future);

pub struct PromiseShared {
    pub value: Mutex<Option<Value>>,
    pub delivered: Condvar,
}

#[repr(C)]
pub struct ObjPromise {
    pub hdr: ObjHeader,
    pub shared: Arc<PromiseShared>,
}

impl ObjPromise {
    fn trace_children(&self, work: &mut Vec<Value>) {
        if let Ok(value) = self.shared.value.lock()
            && let Some(v) = *value
        {
            work.push(v);
        }
    }
}
heap_object!(ObjPromise, HeapTag::Promise);

pub struct AgentShared {
    pub value: Mutex<Value>,
    pub queue: Mutex<std::collections::VecDeque<(Value, Vec<Value>)>>,
    pub draining: AtomicBool,
    pub idle: Condvar,
}

impl crate::env::InFlightRoots for AgentShared {
    fn push_roots(&self, work: &mut Vec<Value>) {
        if let Ok(v) = self.value.lock() {
            work.push(*v);
        }
        if let Ok(queue) = self.queue.lock() {
            for (f, args) in queue.iter() {
                work.push(*f);
                work.extend_from_slice(args);
            }
        }
    }
}

/// Agent: actions applied in submission order by a drainer thread.
#[repr(C)]
pub struct ObjAgent {
    pub hdr: ObjHeader,
    pub shared: Arc<AgentShared>,
}

impl ObjAgent {
    fn trace_children(&self, work: &mut Vec<Value>) {
        crate::env::InFlightRoots::push_roots(&*self.shared, work);
    }
}
heap_object!(ObjAgent, HeapTag::Agent);

// =============================================================================
// Tag dispatch
// =============================================================================

/// Push the children of `v` onto the mark worklist. Non-heap values and the
/// reserved (never-constructed) slots contribute nothing.
pub fn trace_value(v: Value, work: &mut Vec<Value>) {
    let Some(tag) = v.heap_tag() else { return };
    match tag {
        HeapTag::Str => ObjStr::of(v).trace_children(work),
        HeapTag::Symbol => ObjSymbol::of(v).trace_children(work),
        HeapTag::Keyword => ObjKeyword::of(v).trace_children(work),
        HeapTag::Cons => ObjCons::of(v).trace_children(work),
        HeapTag::Vector => ObjVector::of(v).trace_children(work),
        HeapTag::ArrayMap => ObjArrayMap::of(v).trace_children(work),
        HeapTag::HashMap => ObjHashMap::of(v).trace_children(work),
        HeapTag::HashSet => ObjHashSet::of(v).trace_children(work),
        HeapTag::Closure => ObjClosure::of(v).trace_children(work),
        HeapTag::Atom => ObjAtom::of(v).trace_children(work),
        HeapTag::Volatile => ObjVolatile::of(v).trace_children(work),
        HeapTag::Regex => ObjRegex::of(v).trace_children(work),
        HeapTag::Protocol => ObjProtocol::of(v).trace_children(work),
        HeapTag::ProtocolMethod => ObjProtocolMethod::of(v).trace_children(work),
        HeapTag::Multimethod => ObjMultimethod::of(v).trace_children(work),
        HeapTag::LazySeq => ObjLazySeq::of(v).trace_children(work),
        HeapTag::VarRef => Var::of(v).trace_children(work),
        HeapTag::Delay => ObjDelay::of(v).trace_children(work),
        HeapTag::Reduced => ObjReduced::of(v).trace_children(work),
        HeapTag::TransientVector => ObjTransientVector::of(v).trace_children(work),
        HeapTag::TransientMap => ObjTransientMap::of(v).trace_children(work),
        HeapTag::TransientSet => ObjTransientSet::of(v).trace_children(work),
        HeapTag::ChunkedCons => ObjChunkedCons::of(v).trace_children(work),
        HeapTag::ArrayChunk => ObjArrayChunk::of(v).trace_children(work),
        HeapTag::MutableArray => ObjMutableArray::of(v).trace_children(work),
        HeapTag::Future => ObjFuture::of(v).trace_children(work),
        HeapTag::Promise => ObjPromise::of(v).trace_children(work),
        HeapTag::Agent => ObjAgent::of(v).trace_children(work),
        HeapTag::EmptyList => {}
        HeapTag::BigInt | HeapTag::Ratio | HeapTag::Foreign => {
            unreachable!("reserved heap tag {tag:?} has no constructor")
        }
    }
}

/// Run the type-specific destructor for an unmarked object. Strings and byte
/// buffers release their backing memory; protocol/method tables release
/// their entries. Called by the sweep phase only.
///
/// # Safety
/// `ptr` must point at a live allocation previously produced by the GC
/// allocator under `tag`, and must not be used afterwards.
pub unsafe fn drop_object(tag: HeapTag, ptr: *mut u8) {
    unsafe {
        match tag {
            HeapTag::Str => std::ptr::drop_in_place(ptr as *mut ObjStr),
            HeapTag::Symbol => std::ptr::drop_in_place(ptr as *mut ObjSymbol),
            HeapTag::Keyword => std::ptr::drop_in_place(ptr as *mut ObjKeyword),
            HeapTag::Cons => std::ptr::drop_in_place(ptr as *mut ObjCons),
            HeapTag::Vector => std::ptr::drop_in_place(ptr as *mut ObjVector),
            HeapTag::ArrayMap => std::ptr::drop_in_place(ptr as *mut ObjArrayMap),
            HeapTag::HashMap => std::ptr::drop_in_place(ptr as *mut ObjHashMap),
            HeapTag::HashSet => std::ptr::drop_in_place(ptr as *mut ObjHashSet),
            HeapTag::Closure => std::ptr::drop_in_place(ptr as *mut ObjClosure),
            HeapTag::Atom => std::ptr::drop_in_place(ptr as *mut ObjAtom),
            HeapTag::Volatile => std::ptr::drop_in_place(ptr as *mut ObjVolatile),
            HeapTag::Regex => std::ptr::drop_in_place(ptr as *mut ObjRegex),
            HeapTag::Protocol => std::ptr::drop_in_place(ptr as *mut ObjProtocol),
            HeapTag::ProtocolMethod => std::ptr::drop_in_place(ptr as *mut ObjProtocolMethod),
            HeapTag::Multimethod => std::ptr::drop_in_place(ptr as *mut ObjMultimethod),
            HeapTag::LazySeq => std::ptr::drop_in_place(ptr as *mut ObjLazySeq),
            HeapTag::VarRef => std::ptr::drop_in_place(ptr as *mut Var),
            HeapTag::Delay => std::ptr::drop_in_place(ptr as *mut ObjDelay),
            HeapTag::Reduced => std::ptr::drop_in_place(ptr as *mut ObjReduced),
            HeapTag::TransientVector => std::ptr::drop_in_place(ptr as *mut ObjTransientVector),
            HeapTag::TransientMap => std::ptr::drop_in_place(ptr as *mut ObjTransientMap),
            HeapTag::TransientSet => std::ptr::drop_in_place(ptr as *mut ObjTransientSet),
            HeapTag::ChunkedCons => std::ptr::drop_in_place(ptr as *mut ObjChunkedCons),
            HeapTag::ArrayChunk => std::ptr::drop_in_place(ptr as *mut ObjArrayChunk),
            HeapTag::MutableArray => std::ptr::drop_in_place(ptr as *mut ObjMutableArray),
            HeapTag::Future => std::ptr::drop_in_place(ptr as *mut ObjFuture),
            HeapTag::Promise => std::ptr::drop_in_place(ptr as *mut ObjPromise),
            HeapTag::Agent => std::ptr::drop_in_place(ptr as *mut ObjAgent),
            HeapTag::EmptyList => std::ptr::drop_in_place(ptr as *mut ObjEmptyList),
            HeapTag::BigInt | HeapTag::Ratio | HeapTag::Foreign => {
                unreachable!("reserved heap tag {tag:?} has no allocations")
            }
        }
    }
}

/// Shared header view of any heap value.
#[inline]
pub fn header_of(v: Value) -> &'static ObjHeader {
    debug_assert!(v.heap_tag().is_some());
    // Safety: every heap object begins with an ObjHeader (repr(C))
    unsafe { &*(v.heap_ptr() as *const ObjHeader) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_small_and_aligned() {
        assert!(std::mem::size_of::<ObjHeader>() <= 8);
        assert_eq!(std::mem::align_of::<ObjHeader>(), 8);
    }

    #[test]
    fn cons_traces_both_fields() {
        let cell = ObjCons::new(Value::int(1), Value::int(2));
        let mut work = Vec::new();
        cell.trace_children(&mut work);
        assert_eq!(work.len(), 2);
    }

    #[test]
    fn mark_bit_roundtrip() {
        let hdr = ObjHeader::new(HeapTag::Cons);
        assert!(!hdr.is_marked());
        hdr.set_mark(true);
        assert!(hdr.is_marked());
        hdr.set_mark(false);
        assert!(!hdr.is_marked());
    }
}
