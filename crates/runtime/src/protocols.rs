//! Protocols
//!
//! A protocol is a named interface with an implementation map from type key
//! to method functions. A protocol-method value is a first-class function
//! dispatching on its first argument's type key. Every `extend` bumps the
//! protocol's generation counter; protocol-method caches are stamped with
//! the generation they observed, so a stale cache forces a fresh lookup.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::env::Env;
use crate::error::{self, ErrorKind};
use crate::heap::{ObjHeader, ObjProtocol, ObjProtocolMethod, ObjSymbol, Var};
use crate::value::{HeapTag, Tag, Value};

/// Dispatch key: the coarse runtime type of a value. `as_u32`/`from_u32`
/// exist for the atomic method caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TypeKey {
    Nil,
    Bool,
    Int,
    Float,
    Char,
    Str,
    Symbol,
    Keyword,
    List,
    Vector,
    Map,
    Set,
    Fn,
    Atom,
    Volatile,
    Regex,
    LazySeq,
    Var,
    Delay,
    Reduced,
    Future,
    Promise,
    Agent,
    Array,
    Other,
}

impl TypeKey {
    pub fn of_value(v: Value) -> TypeKey {
        match v.tag() {
            Tag::Nil => TypeKey::Nil,
            Tag::True | Tag::False => TypeKey::Bool,
            Tag::Int => TypeKey::Int,
            Tag::Float => TypeKey::Float,
            Tag::Char => TypeKey::Char,
            Tag::Builtin => TypeKey::Fn,
            Tag::Heap(tag) => match tag {
                HeapTag::Str => TypeKey::Str,
                HeapTag::Symbol => TypeKey::Symbol,
                HeapTag::Keyword => TypeKey::Keyword,
                HeapTag::Cons | HeapTag::EmptyList | HeapTag::ChunkedCons => TypeKey::List,
                HeapTag::Vector => TypeKey::Vector,
                HeapTag::ArrayMap | HeapTag::HashMap => TypeKey::Map,
                HeapTag::HashSet => TypeKey::Set,
                HeapTag::Closure | HeapTag::ProtocolMethod | HeapTag::Multimethod => TypeKey::Fn,
                HeapTag::Atom => TypeKey::Atom,
                HeapTag::Volatile => TypeKey::Volatile,
                HeapTag::Regex => TypeKey::Regex,
                HeapTag::LazySeq => TypeKey::LazySeq,
                HeapTag::VarRef => TypeKey::Var,
                HeapTag::Delay => TypeKey::Delay,
                HeapTag::Reduced => TypeKey::Reduced,
                HeapTag::Future => TypeKey::Future,
                HeapTag::Promise => TypeKey::Promise,
                HeapTag::Agent => TypeKey::Agent,
                HeapTag::MutableArray | HeapTag::ArrayChunk => TypeKey::Array,
                _ => TypeKey::Other,
            },
        }
    }

    /// Class-style names accepted by `extend-type`/`extend-protocol`.
    pub fn from_name(name: &str) -> Option<TypeKey> {
        Some(match name {
            "nil" | "Nil" => TypeKey::Nil,
            "Boolean" => TypeKey::Bool,
            "Integer" | "Long" => TypeKey::Int,
            "Float" | "Double" => TypeKey::Float,
            "Character" => TypeKey::Char,
            "String" => TypeKey::Str,
            "Symbol" => TypeKey::Symbol,
            "Keyword" => TypeKey::Keyword,
            "List" | "PersistentList" => TypeKey::List,
            "Vector" | "PersistentVector" => TypeKey::Vector,
            "Map" | "PersistentMap" => TypeKey::Map,
            "Set" | "PersistentSet" => TypeKey::Set,
            "Fn" | "IFn" => TypeKey::Fn,
            "Atom" => TypeKey::Atom,
            "Volatile" => TypeKey::Volatile,
            "Regex" | "Pattern" => TypeKey::Regex,
            "LazySeq" => TypeKey::LazySeq,
            "Var" => TypeKey::Var,
            "Delay" => TypeKey::Delay,
            "Future" => TypeKey::Future,
            "Promise" => TypeKey::Promise,
            "Agent" => TypeKey::Agent,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Sentinel for an empty protocol-method cache.
const CACHE_EMPTY: u32 = u32::MAX;

/// Create a protocol object and its first-class method values, binding them
/// to vars in `ns`. Returns the protocol value.
pub fn define_protocol(
    env: &Env,
    ns_name: &str,
    name: Value,
    method_names: &[Value],
) -> Result<Value, Value> {
    let scope = env.roots();
    let protocol = scope.keep(env.alloc(ObjProtocol {
        hdr: ObjHeader::new(HeapTag::Protocol),
        name,
        method_names: method_names.to_vec().into_boxed_slice(),
        impls: Mutex::new(HashMap::new()),
        generation: AtomicU64::new(0),
    })?);

    for mname in method_names {
        let method_str = ObjSymbol::of(*mname).name.clone();
        let method = scope.keep(env.alloc(ObjProtocolMethod {
            hdr: ObjHeader::new(HeapTag::ProtocolMethod),
            protocol,
            name: method_str.clone(),
            cache_gen: AtomicU64::new(0),
            cache_key: AtomicU32::new(CACHE_EMPTY),
            cache_fn: AtomicU64::new(0),
        })?);
        let var = env.intern_var(ns_name, &method_str);
        var.set_root(method);
    }
    Ok(protocol)
}

/// Extend a protocol for one type key. Bumps the generation so every method
/// cache recorded before this goes stale.
pub fn extend_protocol(
    env: &Env,
    protocol: Value,
    key: TypeKey,
    methods: Vec<(Box<str>, Value)>,
) -> Result<(), Value> {
    if protocol.heap_tag() != Some(HeapTag::Protocol) {
        return Err(error::type_error(env, "protocol", protocol));
    }
    let obj = ObjProtocol::of(protocol);
    {
        let mut impls = obj.impls.lock().expect("protocol impls poisoned");
        let slot = impls.entry(key).or_default();
        for (name, f) in methods {
            slot.insert(name, f);
        }
    }
    obj.generation.fetch_add(1, Ordering::AcqRel);
    Ok(())
}

/// Resolve the method function a protocol-method call dispatches to.
///
/// Monomorphic inline cache: a hit is a pair of atomic loads (type key and
/// generation) plus the cached function. Misses consult the implementation
/// table and refill the cache.
pub fn resolve_method(env: &Env, method_v: Value, receiver: Value) -> Result<Value, Value> {
    let method = ObjProtocolMethod::of(method_v);
    let protocol = ObjProtocol::of(method.protocol);
    let key = TypeKey::of_value(receiver);
    let generation = protocol.generation.load(Ordering::Acquire);

    if method.cache_key.load(Ordering::Acquire) == key.as_u32()
        && method.cache_gen.load(Ordering::Acquire) == generation
    {
        let cached = method.cache_fn.load(Ordering::Acquire);
        if cached != 0 {
            return Ok(Value::from_bits(cached));
        }
    }

    let resolved = {
        let impls = protocol.impls.lock().expect("protocol impls poisoned");
        impls.get(&key).and_then(|m| m.get(method.name.as_ref())).copied()
    };
    match resolved {
        Some(f) => {
            method.cache_fn.store(f.to_bits(), Ordering::Release);
            method.cache_gen.store(generation, Ordering::Release);
            method.cache_key.store(key.as_u32(), Ordering::Release);
            Ok(f)
        }
        None => Err(error::raise(
            env,
            ErrorKind::Name,
            format!(
                "no implementation of method {} for {}",
                method.name,
                crate::printer::type_name(receiver)
            ),
        )),
    }
}

/// `defprotocol` entry used by both engines: defines the protocol var and
/// one var per method.
pub fn install_protocol(
    env: &Env,
    var: &'static Var,
    name: Value,
    method_names: &[Value],
) -> Result<Value, Value> {
    let ns_name = var.ns_name.to_string();
    let protocol = define_protocol(env, &ns_name, name, method_names)?;
    var.set_root(protocol);
    Ok(protocol)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        Env::new()
    }

    #[test]
    fn type_keys_cover_core_tags() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert_eq!(TypeKey::of_value(Value::NIL), TypeKey::Nil);
        assert_eq!(TypeKey::of_value(Value::int(1)), TypeKey::Int);
        assert_eq!(TypeKey::of_value(Value::float(1.5)), TypeKey::Float);
        assert_eq!(TypeKey::of_value(env.keyword("k")), TypeKey::Keyword);
        assert_eq!(TypeKey::from_name("String"), Some(TypeKey::Str));
        assert_eq!(TypeKey::from_name("NoSuchClass"), None);
    }

    #[test]
    fn dispatch_hits_after_extend_and_invalidates() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let pname = env.symbol("P");
        let mname = env.symbol("m");
        let var = env.intern_var("user", "P");
        let protocol = scope.keep(install_protocol(&env, var, pname, &[mname]).unwrap());
        let method_v = env.var_value(env.resolve_var(Some("user"), "m").unwrap()).unwrap();
        scope.keep(method_v);

        // Unextended: name error.
        let s = scope.keep(env.alloc_str("hello").unwrap());
        assert!(resolve_method(&env, method_v, s).is_err());

        // Extend for strings with a marker function (any value works for
        // resolution; calling it is the bridge's business).
        let marker = Value::int(1234);
        extend_protocol(&env, protocol, TypeKey::Str, vec![("m".into(), marker)]).unwrap();
        assert!(resolve_method(&env, method_v, s).unwrap().identical(marker));
        // Cache hit path.
        assert!(resolve_method(&env, method_v, s).unwrap().identical(marker));

        // Re-extend with a different function: generation bump must defeat
        // the stale cache.
        let marker2 = Value::int(5678);
        extend_protocol(&env, protocol, TypeKey::Str, vec![("m".into(), marker2)]).unwrap();
        assert!(resolve_method(&env, method_v, s).unwrap().identical(marker2));
    }
}
