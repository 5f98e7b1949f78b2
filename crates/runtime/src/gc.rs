//! Mark-Sweep Garbage Collector
//!
//! Stop-the-world tri-color mark-sweep over every collected-heap object.
//! Allocation and collection are serialized by one mutex; mutator threads
//! rendezvous at safe points through a park/notify handshake, so a collection
//! only proceeds while every other registered mutator is parked (or sitting
//! in a blocking region such as a promise deref).
//!
//! Freed blocks are recycled through intrusive free-list pools keyed by
//! `(size, align)` instead of returning to the system allocator; GC-heavy
//! workloads allocate and free the same few object shapes over and over.
//!
//! The collector never retries: if the threshold has already doubled past
//! live size and the system allocator still fails, the caller gets
//! out-of-memory and propagates it.

use std::alloc::Layout;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crate::heap::{self, HeapObject, ObjHeader};
use crate::value::Value;

/// Initial adaptive threshold: 1 MiB of live bytes.
const INITIAL_THRESHOLD: usize = 1024 * 1024;

/// At most this many distinct `(size, align)` pools are kept.
const MAX_POOLS: usize = 16;

/// Each pool holds at most this many recycled blocks.
const MAX_POOL_ENTRIES: usize = 4096;

/// Allocation failure. Collection has already been attempted when this is
/// returned; the caller propagates it as the out-of-memory error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// Callback that pushes the current root set onto the mark worklist.
pub type RootsFn<'a> = &'a dyn Fn(&mut Vec<Value>);

struct FreePool {
    head: *mut u8,
    len: usize,
}

struct GcInner {
    /// Every live collected allocation, as headers.
    objects: Vec<*mut ObjHeader>,
    /// Bytes held by `objects` (headers included).
    bytes_live: usize,
    threshold: usize,
    pools: HashMap<(usize, usize), FreePool>,
}

// Safety: raw pointers in the registry are only touched under the GC mutex.
unsafe impl Send for GcInner {}

#[derive(Default)]
pub struct GcStats {
    pub collections: AtomicU64,
    pub objects_swept: AtomicU64,
    pub pool_hits: AtomicU64,
    pub bytes_live: AtomicU64,
    pub objects_live: AtomicU64,
}

struct Handshake {
    mutators: usize,
    parked: usize,
}

thread_local! {
    /// Whether this thread currently counts as parked/detached for the
    /// collector handshake (blocking regions, safe-point waits).
    static THREAD_PARKED: Cell<bool> = const { Cell::new(false) };
}

pub struct Gc {
    inner: Mutex<GcInner>,
    collect_requested: AtomicBool,
    handshake: Mutex<Handshake>,
    cv: Condvar,
    pub stats: GcStats,
}

impl Gc {
    pub fn new() -> Gc {
        Gc {
            inner: Mutex::new(GcInner {
                objects: Vec::new(),
                bytes_live: 0,
                threshold: INITIAL_THRESHOLD,
                pools: HashMap::new(),
            }),
            collect_requested: AtomicBool::new(false),
            handshake: Mutex::new(Handshake { mutators: 0, parked: 0 }),
            cv: Condvar::new(),
            stats: GcStats::default(),
        }
    }

    // =========================================================================
    // Mutator registry
    // =========================================================================

    /// Register the calling thread as a mutator for the lifetime of the
    /// returned guard. Collections wait for every registered mutator other
    /// than the collector itself to reach a safe point.
    pub fn register_mutator(&self) -> MutatorGuard<'_> {
        let mut hs = self.handshake.lock().expect("gc handshake poisoned");
        hs.mutators += 1;
        MutatorGuard { gc: self }
    }

    /// Run `f` with this thread counted as parked, so a concurrent collection
    /// does not wait on it. Used around blocking operations (promise deref,
    /// future join, I/O).
    pub fn blocking_region<R>(&self, f: impl FnOnce() -> R) -> R {
        let was = THREAD_PARKED.with(|p| p.replace(true));
        if !was {
            let mut hs = self.handshake.lock().expect("gc handshake poisoned");
            hs.parked += 1;
            drop(hs);
            self.cv.notify_all();
        }
        let out = f();
        if !was {
            let mut hs = self.handshake.lock().expect("gc handshake poisoned");
            hs.parked -= 1;
            drop(hs);
            THREAD_PARKED.with(|p| p.set(false));
            // A collection may be in flight; wait for it before touching the heap.
            self.wait_if_collecting();
        }
        out
    }

    fn wait_if_collecting(&self) {
        if !self.collect_requested.load(Ordering::Acquire) {
            return;
        }
        let mut hs = self.handshake.lock().expect("gc handshake poisoned");
        hs.parked += 1;
        self.cv.notify_all();
        while self.collect_requested.load(Ordering::Acquire) {
            hs = self.cv.wait(hs).expect("gc handshake poisoned");
        }
        hs.parked -= 1;
    }

    // =========================================================================
    // Contract surface
    // =========================================================================

    /// True when live bytes exceed the adaptive threshold.
    #[inline]
    pub fn should_collect(&self) -> bool {
        self.collect_requested.load(Ordering::Acquire) || {
            let inner = self.inner.lock().expect("gc mutex poisoned");
            inner.bytes_live > inner.threshold
        }
    }

    /// Cheap pre-check for interpreter poll sites: no lock unless a
    /// collection has actually been requested elsewhere.
    #[inline]
    pub fn poll_requested(&self) -> bool {
        self.collect_requested.load(Ordering::Acquire)
    }

    /// Mutator's declaration that collecting here is safe. Collects iff the
    /// threshold is exceeded; parks if another thread is already collecting.
    pub fn safe_point(&self, roots: RootsFn<'_>) {
        if self.collect_requested.load(Ordering::Acquire) {
            self.wait_if_collecting();
            return;
        }
        if self.should_collect() {
            self.collect(roots);
        }
    }

    /// Allocate a heap object, collecting first when over threshold.
    pub fn alloc<T: HeapObject>(&self, obj: T, roots: RootsFn<'_>) -> Result<Value, OutOfMemory> {
        self.safe_point(roots);

        let layout = Layout::new::<T>();
        let mut inner = self.inner.lock().expect("gc mutex poisoned");
        let ptr = match Self::take_block(&mut inner, layout) {
            Some(recycled) => {
                self.stats.pool_hits.fetch_add(1, Ordering::Relaxed);
                recycled
            }
            // Safety: layout has non-zero size (every object has a header)
            None => unsafe { std::alloc::alloc(layout) },
        };
        if ptr.is_null() {
            drop(inner);
            // One collection, then give up: collection is never retried.
            self.collect(roots);
            let mut inner = self.inner.lock().expect("gc mutex poisoned");
            let ptr = Self::take_block(&mut inner, layout)
                .unwrap_or_else(|| unsafe { std::alloc::alloc(layout) });
            if ptr.is_null() {
                return Err(OutOfMemory);
            }
            return Ok(self.finish_alloc(&mut inner, ptr, obj, layout));
        }
        Ok(self.finish_alloc(&mut inner, ptr, obj, layout))
    }

    fn finish_alloc<T: HeapObject>(
        &self,
        inner: &mut GcInner,
        ptr: *mut u8,
        obj: T,
        layout: Layout,
    ) -> Value {
        // Safety: ptr is a fresh block of T's layout
        unsafe { std::ptr::write(ptr as *mut T, obj) };
        inner.objects.push(ptr as *mut ObjHeader);
        inner.bytes_live += layout.size();
        self.stats.bytes_live.store(inner.bytes_live as u64, Ordering::Relaxed);
        self.stats.objects_live.store(inner.objects.len() as u64, Ordering::Relaxed);
        Value::heap(T::TAG, ptr)
    }

    fn take_block(inner: &mut GcInner, layout: Layout) -> Option<*mut u8> {
        let pool = inner.pools.get_mut(&(layout.size(), layout.align()))?;
        if pool.head.is_null() {
            return None;
        }
        let block = pool.head;
        // Safety: blocks in a pool store the next link in their first word
        pool.head = unsafe { *(block as *mut *mut u8) };
        pool.len -= 1;
        Some(block)
    }

    /// Mark from the given roots and sweep everything unreachable. Blocks
    /// until every other registered mutator is parked.
    pub fn collect(&self, roots: RootsFn<'_>) {
        // Claim the collector role; lose the race and we just park instead.
        if self
            .collect_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.wait_if_collecting();
            return;
        }

        {
            // The collector itself counts toward the rendezvous.
            let mut hs = self.handshake.lock().expect("gc handshake poisoned");
            while hs.parked + 1 < hs.mutators {
                let (guard, _timeout) = self
                    .cv
                    .wait_timeout(hs, std::time::Duration::from_millis(50))
                    .expect("gc handshake poisoned");
                hs = guard;
            }
        }

        let mut inner = self.inner.lock().expect("gc mutex poisoned");
        tracing::debug!(
            live_bytes = inner.bytes_live,
            objects = inner.objects.len(),
            "gc cycle start"
        );

        // Mark.
        let mut work: Vec<Value> = Vec::with_capacity(256);
        roots(&mut work);
        while let Some(v) = work.pop() {
            if v.heap_tag().is_none() {
                continue;
            }
            let hdr = heap::header_of(v);
            if hdr.permanent || hdr.is_marked() {
                continue;
            }
            hdr.set_mark(true);
            heap::trace_value(v, &mut work);
        }

        // Sweep.
        let mut swept = 0u64;
        let mut live: Vec<*mut ObjHeader> = Vec::with_capacity(inner.objects.len());
        let objects = std::mem::take(&mut inner.objects);
        let mut freed_bytes = 0usize;
        let mut to_pool: Vec<(*mut u8, Layout)> = Vec::new();
        for ptr in objects {
            // Safety: registry pointers are valid headers until swept here
            let hdr = unsafe { &*ptr };
            if hdr.is_marked() {
                hdr.set_mark(false);
                live.push(ptr);
            } else {
                let tag = hdr.tag;
                let layout = object_layout(tag);
                unsafe { heap::drop_object(tag, ptr as *mut u8) };
                freed_bytes += layout.size();
                swept += 1;
                to_pool.push((ptr as *mut u8, layout));
            }
        }
        inner.objects = live;
        inner.bytes_live = inner.bytes_live.saturating_sub(freed_bytes);
        for (block, layout) in to_pool {
            Self::give_block(&mut inner, block, layout);
        }

        // Adapt: if live bytes still exceed the threshold, double it.
        if inner.bytes_live > inner.threshold {
            inner.threshold *= 2;
        }

        self.stats.collections.fetch_add(1, Ordering::Relaxed);
        self.stats.objects_swept.fetch_add(swept, Ordering::Relaxed);
        self.stats.bytes_live.store(inner.bytes_live as u64, Ordering::Relaxed);
        self.stats.objects_live.store(inner.objects.len() as u64, Ordering::Relaxed);
        tracing::debug!(swept, live_bytes = inner.bytes_live, "gc cycle end");
        drop(inner);

        self.collect_requested.store(false, Ordering::Release);
        self.cv.notify_all();
    }

    fn give_block(inner: &mut GcInner, block: *mut u8, layout: Layout) {
        let key = (layout.size(), layout.align());
        // A recycled block must hold the free-list link.
        if layout.size() >= std::mem::size_of::<*mut u8>() {
            if let Some(pool) = inner.pools.get_mut(&key) {
                if pool.len < MAX_POOL_ENTRIES {
                    unsafe { *(block as *mut *mut u8) = pool.head };
                    pool.head = block;
                    pool.len += 1;
                    return;
                }
            } else if inner.pools.len() < MAX_POOLS {
                unsafe { *(block as *mut *mut u8) = std::ptr::null_mut() };
                inner.pools.insert(key, FreePool { head: block, len: 1 });
                return;
            }
        }
        // No pool slot: return to the system allocator.
        unsafe { std::alloc::dealloc(block, layout) };
    }

    /// Live-byte count, for diagnostics.
    pub fn bytes_live(&self) -> usize {
        self.inner.lock().expect("gc mutex poisoned").bytes_live
    }

    /// Pool occupancy `(pools, total entries)`, for diagnostics.
    pub fn pool_occupancy(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("gc mutex poisoned");
        (inner.pools.len(), inner.pools.values().map(|p| p.len).sum())
    }
}

impl Default for Gc {
    fn default() -> Self {
        Gc::new()
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        // Tear down every remaining object and recycled block.
        let inner = self.inner.get_mut().expect("gc mutex poisoned");
        for ptr in inner.objects.drain(..) {
            let hdr = unsafe { &*ptr };
            let tag = hdr.tag;
            let layout = object_layout(tag);
            unsafe {
                heap::drop_object(tag, ptr as *mut u8);
                std::alloc::dealloc(ptr as *mut u8, layout);
            }
        }
        for ((size, align), pool) in inner.pools.drain() {
            let layout = Layout::from_size_align(size, align).expect("pool layout");
            let mut block = pool.head;
            while !block.is_null() {
                let next = unsafe { *(block as *mut *mut u8) };
                unsafe { std::alloc::dealloc(block, layout) };
                block = next;
            }
        }
    }
}

pub struct MutatorGuard<'gc> {
    gc: &'gc Gc,
}

impl Drop for MutatorGuard<'_> {
    fn drop(&mut self) {
        let mut hs = self.gc.handshake.lock().expect("gc handshake poisoned");
        hs.mutators -= 1;
        drop(hs);
        self.gc.cv.notify_all();
    }
}

/// Layout of the concrete object behind a tag. Exhaustive so a new sub-tag
/// cannot be added without the collector learning its size.
fn object_layout(tag: crate::value::HeapTag) -> Layout {
    use crate::heap::*;
    use crate::value::HeapTag as T;
    match tag {
        T::Str => Layout::new::<ObjStr>(),
        T::Symbol => Layout::new::<ObjSymbol>(),
        T::Keyword => Layout::new::<ObjKeyword>(),
        T::Cons => Layout::new::<ObjCons>(),
        T::Vector => Layout::new::<ObjVector>(),
        T::ArrayMap => Layout::new::<ObjArrayMap>(),
        T::HashMap => Layout::new::<ObjHashMap>(),
        T::HashSet => Layout::new::<ObjHashSet>(),
        T::Closure => Layout::new::<ObjClosure>(),
        T::Atom => Layout::new::<ObjAtom>(),
        T::Volatile => Layout::new::<ObjVolatile>(),
        T::Regex => Layout::new::<ObjRegex>(),
        T::Protocol => Layout::new::<ObjProtocol>(),
        T::ProtocolMethod => Layout::new::<ObjProtocolMethod>(),
        T::Multimethod => Layout::new::<ObjMultimethod>(),
        T::LazySeq => Layout::new::<ObjLazySeq>(),
        T::VarRef => Layout::new::<Var>(),
        T::Delay => Layout::new::<ObjDelay>(),
        T::Reduced => Layout::new::<ObjReduced>(),
        T::TransientVector => Layout::new::<ObjTransientVector>(),
        T::TransientMap => Layout::new::<ObjTransientMap>(),
        T::TransientSet => Layout::new::<ObjTransientSet>(),
        T::ChunkedCons => Layout::new::<ObjChunkedCons>(),
        T::ArrayChunk => Layout::new::<ObjArrayChunk>(),
        T::MutableArray => Layout::new::<ObjMutableArray>(),
        T::Future => Layout::new::<ObjFuture>(),
        T::Promise => Layout::new::<ObjPromise>(),
        T::Agent => Layout::new::<ObjAgent>(),
        T::EmptyList => Layout::new::<ObjEmptyList>(),
        T::BigInt | T::Ratio | T::Foreign => {
            unreachable!("reserved heap tag {tag:?} has no allocations")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ObjCons, ObjStr};

    fn no_roots(_: &mut Vec<Value>) {}

    #[test]
    fn alloc_and_collect_unreachable() {
        let gc = Gc::new();
        let _guard = gc.register_mutator();
        for i in 0..100 {
            gc.alloc(ObjCons::new(Value::int(i), Value::NIL), &no_roots).unwrap();
        }
        assert_eq!(gc.stats.objects_live.load(Ordering::Relaxed), 100);
        gc.collect(&no_roots);
        assert_eq!(gc.stats.objects_live.load(Ordering::Relaxed), 0);
        assert_eq!(gc.stats.objects_swept.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn roots_survive_collection() {
        let gc = Gc::new();
        let _guard = gc.register_mutator();
        let kept = gc.alloc(ObjStr::new("kept"), &no_roots).unwrap();
        let _lost = gc.alloc(ObjStr::new("lost"), &no_roots).unwrap();
        let roots = move |work: &mut Vec<Value>| work.push(kept);
        gc.collect(&roots);
        assert_eq!(gc.stats.objects_live.load(Ordering::Relaxed), 1);
        assert_eq!(ObjStr::of(kept).data.as_ref(), "kept");
    }

    #[test]
    fn chains_marked_transitively() {
        let gc = Gc::new();
        let _guard = gc.register_mutator();
        let mut head = Value::NIL;
        for i in 0..50 {
            head = gc.alloc(ObjCons::new(Value::int(i), head), &no_roots).unwrap();
        }
        let roots = move |work: &mut Vec<Value>| work.push(head);
        gc.collect(&roots);
        assert_eq!(gc.stats.objects_live.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn pools_recycle_blocks() {
        let gc = Gc::new();
        let _guard = gc.register_mutator();
        for _ in 0..10 {
            gc.alloc(ObjCons::new(Value::int(0), Value::NIL), &no_roots).unwrap();
        }
        gc.collect(&no_roots);
        let (pools, entries) = gc.pool_occupancy();
        assert_eq!(pools, 1);
        assert_eq!(entries, 10);
        // Next allocations come from the pool.
        for _ in 0..10 {
            gc.alloc(ObjCons::new(Value::int(1), Value::NIL), &no_roots).unwrap();
        }
        let (_, entries) = gc.pool_occupancy();
        assert_eq!(entries, 0);
    }

    #[test]
    fn threshold_doubles_when_live_exceeds() {
        let gc = Gc::new();
        {
            let inner = &mut *gc.inner.lock().unwrap();
            inner.threshold = 64; // force pressure
        }
        let _guard = gc.register_mutator();
        let mut keep = Vec::new();
        for i in 0..32 {
            keep.push(gc.alloc(ObjCons::new(Value::int(i), Value::NIL), &no_roots).unwrap());
        }
        let roots = {
            let keep = keep.clone();
            move |work: &mut Vec<Value>| work.extend_from_slice(&keep)
        };
        gc.collect(&roots);
        let threshold = gc.inner.lock().unwrap().threshold;
        assert!(threshold > 64, "threshold must double under live pressure");
    }
}
