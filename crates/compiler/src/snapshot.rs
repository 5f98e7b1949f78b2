//! Environment Snapshot
//!
//! Binary bootstrap image over bincode: header (magic, version, endianness
//! marker), interned symbol/keyword tables, a function-prototype table,
//! namespace records, and var records. Callable var values reference
//! prototypes by index; protocol methods reference their protocol by
//! (namespace, name) var reference and are re-linked after all vars are
//! restored, so the image contains no raw pointers.
//!
//! Runtime-state values (atoms, futures, channels of any kind, multimethod
//! tables, tree-walk closures) are not serializable; snapshotting an
//! environment that binds one fails rather than silently dropping it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use lyra_runtime::ast::CaptureSource;
use lyra_runtime::chunk::{
    ArityEntry, CaseSlot, CaseStrategy, CaseTable, FnProto, HandlerDesc, Instr, LoopInfo, Op,
    VarSite,
};
use lyra_runtime::env::{CORE_NS, Env};
use lyra_runtime::heap::{
    ClosureBody, ObjArrayMap, ObjClosure, ObjCons, ObjHashSet, ObjHeader, ObjKeyword,
    ObjProtocol, ObjProtocolMethod, ObjStr, ObjSymbol, ObjVector, Var,
};
use lyra_runtime::protocols::TypeKey;
use lyra_runtime::{HeapTag, Tag, Value};

const MAGIC: [u8; 4] = *b"LYRA";
const VERSION: u32 = 3;

#[derive(Debug)]
pub enum SnapshotError {
    /// Value kind that cannot cross a process boundary.
    NotSerializable(&'static str),
    /// Header mismatch or malformed image.
    InvalidImage(String),
    /// Bincode encoding/decoding failure.
    Codec(Box<bincode::Error>),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::NotSerializable(kind) => {
                write!(f, "{kind} values cannot be serialized - runtime state")
            }
            SnapshotError::InvalidImage(msg) => write!(f, "invalid snapshot image: {msg}"),
            SnapshotError::Codec(e) => write!(f, "snapshot codec error: {e}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<bincode::Error> for SnapshotError {
    fn from(e: bincode::Error) -> SnapshotError {
        SnapshotError::Codec(Box::new(e))
    }
}

type SymPair = (Option<String>, String);

#[derive(Serialize, Deserialize)]
enum SnapValue {
    Nil,
    True,
    False,
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Sym(SymPair),
    Kw(SymPair),
    List(Vec<SnapValue>),
    Vector(Vec<SnapValue>),
    Map(Vec<(SnapValue, SnapValue)>),
    Set(Vec<SnapValue>),
    Builtin(String),
    VarRef(String, String),
    Closure { proto: u32, captures: Vec<SnapCapture> },
    Protocol { name: Box<SnapValue>, methods: Vec<SnapValue>, impls: Vec<(u32, Vec<(String, SnapValue)>)> },
    ProtocolMethod { protocol_var: (String, String), name: String },
}

#[derive(Serialize, Deserialize)]
enum SnapCapture {
    /// The closure itself (a patched self-reference).
    SelfRef,
    Value(SnapValue),
}

#[derive(Serialize, Deserialize)]
struct CaseRec {
    hashed: Option<(u32, u32)>,
    slots: Vec<Option<(SnapValue, u32)>>,
    default_target: u32,
}

#[derive(Serialize, Deserialize)]
struct ProtoRec {
    name: Option<String>,
    arities: Vec<(u16, bool, u16, u32)>,
    code: Vec<(u8, u16)>,
    consts: Vec<SnapValue>,
    protos: Vec<u32>,
    var_refs: Vec<(String, String)>,
    loops: Vec<(u32, u16, u16)>,
    handlers: Vec<(u32, u32, u32)>,
    cases: Vec<CaseRec>,
    captures: Vec<SnapCaptureSource>,
    lines: Vec<(u32, u32)>,
}

#[derive(Serialize, Deserialize)]
enum SnapCaptureSource {
    Local(u16),
    Capture(u16),
    SelfRef,
}

#[derive(Serialize, Deserialize)]
struct VarRec {
    ns: String,
    name: String,
    dynamic: bool,
    value: Option<SnapValue>,
}

#[derive(Serialize, Deserialize)]
struct Image {
    magic: [u8; 4],
    version: u32,
    little_endian: bool,
    symbols: Vec<SymPair>,
    keywords: Vec<SymPair>,
    protos: Vec<ProtoRec>,
    namespaces: Vec<String>,
    vars: Vec<VarRec>,
}

// =============================================================================
// Save
// =============================================================================

struct Saver<'e> {
    env: &'e Env,
    protos: Vec<ProtoRec>,
    proto_index: HashMap<usize, u32>,
}

impl Saver<'_> {
    fn proto_idx(&mut self, proto: &Arc<FnProto>) -> Result<u32, SnapshotError> {
        let key = Arc::as_ptr(proto) as usize;
        if let Some(idx) = self.proto_index.get(&key) {
            return Ok(*idx);
        }
        // Reserve the slot before recursing so nested self-references work.
        let idx = self.protos.len() as u32;
        self.proto_index.insert(key, idx);
        self.protos.push(ProtoRec {
            name: None,
            arities: vec![],
            code: vec![],
            consts: vec![],
            protos: vec![],
            var_refs: vec![],
            loops: vec![],
            handlers: vec![],
            cases: vec![],
            captures: vec![],
            lines: vec![],
        });
        let rec = self.proto_rec(proto)?;
        self.protos[idx as usize] = rec;
        Ok(idx)
    }

    fn proto_rec(&mut self, proto: &FnProto) -> Result<ProtoRec, SnapshotError> {
        let mut nested = Vec::with_capacity(proto.protos.len());
        for p in &proto.protos {
            nested.push(self.proto_idx(p)?);
        }
        let mut consts = Vec::with_capacity(proto.consts.len());
        for c in &proto.consts {
            consts.push(self.value(*c)?);
        }
        let mut cases = Vec::with_capacity(proto.cases.len());
        for table in &proto.cases {
            cases.push(match &table.strategy {
                CaseStrategy::Hash { shift, mask, slots } => {
                    let mut recs = Vec::with_capacity(slots.len());
                    for slot in slots {
                        recs.push(match slot {
                            Some(s) => Some((self.value(s.head)?, s.target)),
                            None => None,
                        });
                    }
                    CaseRec {
                        hashed: Some((*shift, *mask)),
                        slots: recs,
                        default_target: table.default_target,
                    }
                }
                CaseStrategy::Seq { clauses } => {
                    let mut recs = Vec::with_capacity(clauses.len());
                    for c in clauses {
                        recs.push(Some((self.value(c.head)?, c.target)));
                    }
                    CaseRec { hashed: None, slots: recs, default_target: table.default_target }
                }
            });
        }
        Ok(ProtoRec {
            name: proto.name.as_ref().map(|n| n.to_string()),
            arities: proto
                .arities
                .iter()
                .map(|a| (a.params, a.is_variadic, a.local_count, a.entry_pc))
                .collect(),
            code: proto.code.iter().map(|i| (i.op as u8, i.a)).collect(),
            consts,
            protos: nested,
            var_refs: proto
                .var_sites
                .iter()
                .map(|s| (s.var.ns_name.to_string(), s.var.name.to_string()))
                .collect(),
            loops: proto.loops.iter().map(|l| (l.start_pc, l.base_slot, l.count)).collect(),
            handlers: proto
                .handlers
                .iter()
                .map(|h| (h.pc_begin, h.pc_end, h.pc_handler))
                .collect(),
            cases,
            captures: proto
                .capture_sources
                .iter()
                .map(|c| match c {
                    CaptureSource::Local(s) => SnapCaptureSource::Local(*s),
                    CaptureSource::Capture(i) => SnapCaptureSource::Capture(*i),
                    CaptureSource::SelfRef => SnapCaptureSource::SelfRef,
                })
                .collect(),
            lines: proto.lines.clone(),
        })
    }

    fn value(&mut self, v: Value) -> Result<SnapValue, SnapshotError> {
        Ok(match v.tag() {
            Tag::Nil => SnapValue::Nil,
            Tag::True => SnapValue::True,
            Tag::False => SnapValue::False,
            Tag::Int => SnapValue::Int(v.as_i64()),
            Tag::Float => SnapValue::Float(v.as_f64()),
            Tag::Char => SnapValue::Char(v.as_char()),
            Tag::Builtin => SnapValue::Builtin(v.as_builtin().name.to_string()),
            Tag::Heap(tag) => match tag {
                HeapTag::Str => SnapValue::Str(ObjStr::of(v).data.to_string()),
                HeapTag::Symbol => {
                    let s = ObjSymbol::of(v);
                    SnapValue::Sym((s.ns.as_deref().map(String::from), s.name.to_string()))
                }
                HeapTag::Keyword => {
                    let k = ObjKeyword::of(v);
                    SnapValue::Kw((k.ns.as_deref().map(String::from), k.name.to_string()))
                }
                HeapTag::EmptyList => SnapValue::List(vec![]),
                HeapTag::Cons => {
                    let mut items = Vec::new();
                    let mut cur = v;
                    loop {
                        if cur.is_nil() {
                            break;
                        }
                        match cur.heap_tag() {
                            Some(HeapTag::Cons) => {
                                let cell = ObjCons::of(cur);
                                items.push(self.value(cell.first)?);
                                cur = cell.rest;
                            }
                            Some(HeapTag::EmptyList) => break,
                            _ => return Err(SnapshotError::NotSerializable("improper list")),
                        }
                    }
                    SnapValue::List(items)
                }
                HeapTag::Vector => {
                    let mut items = Vec::new();
                    for item in ObjVector::of(v).items.iter() {
                        items.push(self.value(*item)?);
                    }
                    SnapValue::Vector(items)
                }
                HeapTag::ArrayMap | HeapTag::HashMap => {
                    let mut pairs = Vec::new();
                    for (k, val) in lyra_runtime::eq::map_entries(v) {
                        pairs.push((self.value(*k)?, self.value(*val)?));
                    }
                    SnapValue::Map(pairs)
                }
                HeapTag::HashSet => {
                    let mut items = Vec::new();
                    for item in ObjHashSet::of(v).entries.iter() {
                        items.push(self.value(*item)?);
                    }
                    SnapValue::Set(items)
                }
                HeapTag::VarRef => {
                    let var = Var::of(v);
                    SnapValue::VarRef(var.ns_name.to_string(), var.name.to_string())
                }
                HeapTag::Closure => {
                    let obj = ObjClosure::of(v);
                    let ClosureBody::Bytecode(proto) = &obj.body else {
                        return Err(SnapshotError::NotSerializable("tree-walk closure"));
                    };
                    let proto_idx = self.proto_idx(proto)?;
                    let mut captures = Vec::with_capacity(obj.captures.len());
                    for c in obj.captures.iter() {
                        if c.identical(v) {
                            captures.push(SnapCapture::SelfRef);
                        } else {
                            captures.push(SnapCapture::Value(self.value(*c)?));
                        }
                    }
                    SnapValue::Closure { proto: proto_idx, captures }
                }
                HeapTag::Protocol => {
                    let p = ObjProtocol::of(v);
                    let mut methods = Vec::new();
                    for m in p.method_names.iter() {
                        methods.push(self.value(*m)?);
                    }
                    let mut impls = Vec::new();
                    let table = p.impls.lock().expect("protocol impls poisoned");
                    for (key, fns) in table.iter() {
                        let mut entry = Vec::new();
                        for (name, f) in fns {
                            entry.push((name.to_string(), self.value(*f)?));
                        }
                        impls.push((key.as_u32(), entry));
                    }
                    SnapValue::Protocol {
                        name: Box::new(self.value(p.name)?),
                        methods,
                        impls,
                    }
                }
                HeapTag::ProtocolMethod => {
                    let m = ObjProtocolMethod::of(v);
                    // The method records a var reference back to its
                    // protocol, resolved after all vars are restored.
                    let (ns, name) = find_var_for(self.env, m.protocol).ok_or(
                        SnapshotError::NotSerializable("protocol method without a protocol var"),
                    )?;
                    SnapValue::ProtocolMethod {
                        protocol_var: (ns, name),
                        name: m.name.to_string(),
                    }
                }
                _ => return Err(SnapshotError::NotSerializable("runtime-state value")),
            },
        })
    }
}

/// Serialize an environment to a snapshot image.
/// Locate a var whose root is `value`, for by-reference records.
fn find_var_for(env: &Env, value: Value) -> Option<(String, String)> {
    for ns_name in env.namespace_names() {
        let ns = env.namespace(&ns_name)?;
        for var_name in ns.var_names() {
            if let Some(var) = ns.var(&var_name)
                && var.root().identical(value)
            {
                return Some((ns_name.to_string(), var_name.to_string()));
            }
        }
    }
    None
}

pub fn save(env: &Env) -> Result<Vec<u8>, SnapshotError> {
    let mut saver = Saver { env, protos: Vec::new(), proto_index: HashMap::new() };

    let mut vars = Vec::new();
    let namespaces = env.namespace_names();
    for ns_name in &namespaces {
        let Some(ns) = env.namespace(ns_name) else { continue };
        for var_name in ns.var_names() {
            let Some(var) = ns.var(&var_name) else { continue };
            let value = if var.bound.load(std::sync::atomic::Ordering::Acquire) {
                Some(saver.value(var.root())?)
            } else {
                None
            };
            vars.push(VarRec {
                ns: ns_name.to_string(),
                name: var_name.to_string(),
                dynamic: var.is_dynamic(),
                value,
            });
        }
    }

    let image = Image {
        magic: MAGIC,
        version: VERSION,
        little_endian: cfg!(target_endian = "little"),
        symbols: Vec::new(), // interned lazily on restore from the records
        keywords: Vec::new(),
        protos: saver.protos,
        namespaces: namespaces.iter().map(|n| n.to_string()).collect(),
        vars,
    };
    Ok(bincode::serialize(&image)?)
}

// =============================================================================
// Restore
// =============================================================================

struct Restorer<'e> {
    env: &'e Env,
    /// Indexed prototype table; parents reference children by higher index,
    /// so restoration walks the table from the back.
    protos: Vec<Option<Arc<FnProto>>>,
    /// Protocol methods to re-link once every var exists.
    pending_methods: Vec<(Value, (String, String))>,
}

impl Restorer<'_> {
    fn value(&mut self, rec: &SnapValue) -> Result<Value, SnapshotError> {
        let env = self.env;
        Ok(match rec {
            SnapValue::Nil => Value::NIL,
            SnapValue::True => Value::TRUE,
            SnapValue::False => Value::FALSE,
            SnapValue::Int(n) => Value::from_i64(*n),
            SnapValue::Float(f) => Value::float(*f),
            SnapValue::Char(c) => Value::char(*c),
            SnapValue::Str(s) => env.interned.alloc_permanent(ObjStr::new(s.clone())),
            SnapValue::Sym((ns, name)) => env.interned.symbol(ns.as_deref(), name),
            SnapValue::Kw((ns, name)) => env.interned.keyword(ns.as_deref(), name),
            SnapValue::Builtin(name) => env
                .resolve_var(Some(CORE_NS), name)
                .and_then(|v| env.var_value(v))
                .ok_or_else(|| {
                    SnapshotError::InvalidImage(format!("unknown builtin {name}"))
                })?,
            SnapValue::VarRef(ns, name) => {
                let var = env.intern_var(ns, name);
                Value::heap(HeapTag::VarRef, var as *const _ as *const u8)
            }
            SnapValue::List(items) => {
                let mut acc = env.empty_list;
                for item in items.iter().rev() {
                    let v = self.value(item)?;
                    acc = env.interned.alloc_permanent(ObjCons::new(v, acc));
                }
                acc
            }
            SnapValue::Vector(items) => {
                let mut vals = Vec::with_capacity(items.len());
                for item in items {
                    vals.push(self.value(item)?);
                }
                env.interned.alloc_permanent(ObjVector::new(vals))
            }
            SnapValue::Map(pairs) => {
                let mut vals = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    vals.push((self.value(k)?, self.value(v)?));
                }
                env.interned.alloc_permanent(ObjArrayMap::new(vals))
            }
            SnapValue::Set(items) => {
                let mut vals = Vec::with_capacity(items.len());
                let mut index: HashMap<u32, Vec<u32>> = HashMap::new();
                for (i, item) in items.iter().enumerate() {
                    let v = self.value(item)?;
                    let h = lyra_runtime::hashing::hash_value(env, v).map_err(|_| {
                        SnapshotError::InvalidImage("unhashable set entry".into())
                    })?;
                    index.entry(h).or_default().push(i as u32);
                    vals.push(v);
                }
                env.interned.alloc_permanent(ObjHashSet {
                    hdr: ObjHeader::permanent(HeapTag::HashSet),
                    entries: vals,
                    index,
                    meta: Value::NIL,
                })
            }
            SnapValue::Closure { proto, captures } => {
                let proto = self
                    .protos
                    .get(*proto as usize)
                    .and_then(Clone::clone)
                    .ok_or_else(|| SnapshotError::InvalidImage("proto index".into()))?;
                let mut self_slots = Vec::new();
                let mut vals = Vec::with_capacity(captures.len());
                for (i, c) in captures.iter().enumerate() {
                    match c {
                        SnapCapture::SelfRef => {
                            self_slots.push(i);
                            vals.push(Value::NIL);
                        }
                        SnapCapture::Value(v) => vals.push(self.value(v)?),
                    }
                }
                let name = proto.name.clone();
                let closure = env.interned.alloc_permanent(ObjClosure {
                    hdr: ObjHeader::permanent(HeapTag::Closure),
                    body: ClosureBody::Bytecode(proto),
                    captures: vals.into_boxed_slice(),
                    ns: env.interned.symbol(None, CORE_NS),
                    name,
                    meta: Value::NIL,
                });
                lyra_runtime::vm::patch_self_captures(closure, &self_slots);
                closure
            }
            SnapValue::Protocol { name, methods, impls } => {
                let name_v = self.value(name)?;
                let mut method_vals = Vec::with_capacity(methods.len());
                for m in methods {
                    method_vals.push(self.value(m)?);
                }
                let mut table = HashMap::new();
                for (raw_key, entries) in impls {
                    let key = type_key_from_u32(*raw_key)?;
                    let mut fns: HashMap<Box<str>, Value> = HashMap::new();
                    for (mname, f) in entries {
                        fns.insert(mname.clone().into(), self.value(f)?);
                    }
                    table.insert(key, fns);
                }
                env.interned.alloc_permanent(ObjProtocol {
                    hdr: ObjHeader::permanent(HeapTag::Protocol),
                    name: name_v,
                    method_names: method_vals.into_boxed_slice(),
                    impls: std::sync::Mutex::new(table),
                    generation: std::sync::atomic::AtomicU64::new(0),
                })
            }
            SnapValue::ProtocolMethod { protocol_var, name } => {
                let method = env.interned.alloc_permanent(ObjProtocolMethod {
                    hdr: ObjHeader::permanent(HeapTag::ProtocolMethod),
                    protocol: Value::NIL,
                    name: name.clone().into(),
                    cache_gen: std::sync::atomic::AtomicU64::new(0),
                    cache_key: std::sync::atomic::AtomicU32::new(u32::MAX),
                    cache_fn: std::sync::atomic::AtomicU64::new(0),
                });
                self.pending_methods.push((method, protocol_var.clone()));
                method
            }
        })
    }

    fn proto(&mut self, rec: &ProtoRec) -> Result<FnProto, SnapshotError> {
        let mut consts = Vec::with_capacity(rec.consts.len());
        for c in &rec.consts {
            consts.push(self.value(c)?);
        }
        let mut code = Vec::with_capacity(rec.code.len());
        for (op, a) in &rec.code {
            let op = op_from_u8(*op)?;
            code.push(Instr::new(op, *a));
        }
        let mut cases = Vec::with_capacity(rec.cases.len());
        for c in &rec.cases {
            let mut slots = Vec::with_capacity(c.slots.len());
            for s in &c.slots {
                slots.push(match s {
                    Some((head, target)) => {
                        Some(CaseSlot { head: self.value(head)?, target: *target })
                    }
                    None => None,
                });
            }
            cases.push(CaseTable {
                strategy: match c.hashed {
                    Some((shift, mask)) => CaseStrategy::Hash { shift, mask, slots },
                    None => CaseStrategy::Seq {
                        clauses: slots.into_iter().flatten().collect(),
                    },
                },
                default_target: c.default_target,
            });
        }
        Ok(FnProto {
            name: rec.name.clone().map(Into::into),
            arities: rec
                .arities
                .iter()
                .map(|(p, v, l, e)| ArityEntry {
                    params: *p,
                    is_variadic: *v,
                    local_count: *l,
                    entry_pc: *e,
                })
                .collect(),
            code,
            consts,
            protos: rec
                .protos
                .iter()
                .map(|i| {
                    self.protos
                        .get(*i as usize)
                        .and_then(Clone::clone)
                        .ok_or_else(|| SnapshotError::InvalidImage("proto order".into()))
                })
                .collect::<Result<_, _>>()?,
            var_sites: rec
                .var_refs
                .iter()
                .map(|(ns, name)| VarSite::new(self.env.intern_var(ns, name)))
                .collect(),
            loops: rec
                .loops
                .iter()
                .map(|(s, b, c)| LoopInfo { start_pc: *s, base_slot: *b, count: *c })
                .collect(),
            handlers: rec
                .handlers
                .iter()
                .map(|(b, e, h)| HandlerDesc { pc_begin: *b, pc_end: *e, pc_handler: *h })
                .collect(),
            cases,
            capture_sources: rec
                .captures
                .iter()
                .map(|c| match c {
                    SnapCaptureSource::Local(s) => CaptureSource::Local(*s),
                    SnapCaptureSource::Capture(i) => CaptureSource::Capture(*i),
                    SnapCaptureSource::SelfRef => CaptureSource::SelfRef,
                })
                .collect(),
            lines: rec.lines.clone(),
        })
    }
}

/// Restore a snapshot into an environment that already has its builtins.
pub fn restore(env: &Env, bytes: &[u8]) -> Result<(), SnapshotError> {
    let image: Image = bincode::deserialize(bytes)?;
    if image.magic != MAGIC {
        return Err(SnapshotError::InvalidImage("bad magic".into()));
    }
    if image.version != VERSION {
        return Err(SnapshotError::InvalidImage(format!(
            "version {} (expected {VERSION})",
            image.version
        )));
    }
    if image.little_endian != cfg!(target_endian = "little") {
        return Err(SnapshotError::InvalidImage("endianness mismatch".into()));
    }

    for (ns, name) in &image.symbols {
        env.interned.symbol(ns.as_deref(), name);
    }
    for (ns, name) in &image.keywords {
        env.interned.keyword(ns.as_deref(), name);
    }
    for ns in &image.namespaces {
        env.ensure_namespace(ns);
    }

    let mut restorer =
        Restorer { env, protos: vec![None; image.protos.len()], pending_methods: Vec::new() };
    // Parents were reserved before their nested prototypes at save time, so
    // children always sit at higher indices: restore back-to-front.
    for idx in (0..image.protos.len()).rev() {
        let proto = restorer.proto(&image.protos[idx])?;
        restorer.protos[idx] = Some(Arc::new(proto));
    }

    for rec in &image.vars {
        let var = env.intern_var(&rec.ns, &rec.name);
        if rec.dynamic {
            var.dynamic.store(true, std::sync::atomic::Ordering::Release);
        }
        if let Some(value) = &rec.value {
            let v = restorer.value(value)?;
            var.set_root(v);
        }
    }

    // Re-link protocol methods through their protocol vars.
    for (method, (ns, name)) in std::mem::take(&mut restorer.pending_methods) {
        let protocol = env
            .resolve_var(Some(&ns), &name)
            .and_then(|v| env.var_value(v))
            .ok_or_else(|| {
                SnapshotError::InvalidImage(format!("protocol var {ns}/{name} missing"))
            })?;
        let m = ObjProtocolMethod::of(method);
        // Safety: restored objects are unpublished until restore returns.
        unsafe {
            (*(m as *const ObjProtocolMethod as *mut ObjProtocolMethod)).protocol = protocol;
        }
    }
    Ok(())
}

fn type_key_from_u32(raw: u32) -> Result<TypeKey, SnapshotError> {
    if raw <= TypeKey::Other as u32 {
        // Safety: TypeKey is repr(u32) with contiguous discriminants
        Ok(unsafe { std::mem::transmute::<u32, TypeKey>(raw) })
    } else {
        Err(SnapshotError::InvalidImage(format!("type key {raw}")))
    }
}

fn op_from_u8(raw: u8) -> Result<Op, SnapshotError> {
    if raw <= Op::RecurLocal1 as u8 {
        // Safety: Op is repr(u8) with contiguous discriminants
        Ok(unsafe { std::mem::transmute::<u8, Op>(raw) })
    } else {
        Err(SnapshotError::InvalidImage(format!("opcode {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap;

    #[test]
    fn snapshot_roundtrips_data_vars() {
        let env = bootstrap::new_env();
        let _m = env.gc.register_mutator();
        crate::eval_str(&env, "(def answer 42)").unwrap();
        crate::eval_str(&env, "(def greeting \"hello\")").unwrap();
        crate::eval_str(&env, "(def config {:retries 3 :hosts [\"a\" \"b\"]})").unwrap();
        let bytes = save(&env).unwrap();

        let env2 = bootstrap::new_env();
        let _m2 = env2.gc.register_mutator();
        restore(&env2, &bytes).unwrap();
        let out = crate::eval_str(&env2, "(get config :retries)").unwrap();
        assert_eq!(out.as_i64(), 3);
        let out = crate::eval_str(&env2, "answer").unwrap();
        assert_eq!(out.as_i64(), 42);
    }

    #[test]
    fn snapshot_roundtrips_compiled_functions() {
        let env = bootstrap::new_env();
        let _m = env.gc.register_mutator();
        crate::eval_str(&env, "(defn triple [x] (* 3 x))").unwrap();
        let bytes = save(&env).unwrap();

        let env2 = bootstrap::new_env();
        let _m2 = env2.gc.register_mutator();
        restore(&env2, &bytes).unwrap();
        let out = crate::eval_str(&env2, "(triple 14)").unwrap();
        assert_eq!(out.as_i64(), 42);
    }

    #[test]
    fn bad_magic_rejected() {
        let env = bootstrap::new_env();
        let _m = env.gc.register_mutator();
        let mut bytes = save(&env).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(restore(&env, &bytes), Err(SnapshotError::InvalidImage(_))));
    }
}
