//! Infrastructure Allocator & Interning
//!
//! Tier-1 allocations (vars, interned symbols/keywords, the empty-list
//! sentinel, builtin records) come from a bump arena that lives as long as
//! the environment and is never collected. Objects allocated here carry the
//! `permanent` header flag, so the mark phase treats them as unconditional
//! roots and the sweep never touches them.
//!
//! Symbols and keywords are interned by structural identity (namespace +
//! name); after interning, pointer equality is full equality. The tables are
//! append-only: re-interning the same pair always returns the same Value.

use std::collections::HashMap;
use std::sync::Mutex;

use bumpalo::Bump;

use crate::heap::{HeapObject, ObjHeader, ObjKeyword, ObjSymbol};
use crate::value::Value;

type SymKey = (Option<Box<str>>, Box<str>);

pub struct InternTable {
    arena: Mutex<Bump>,
    symbols: Mutex<HashMap<SymKey, Value>>,
    keywords: Mutex<HashMap<SymKey, Value>>,
}

impl InternTable {
    pub fn new() -> InternTable {
        InternTable {
            arena: Mutex::new(Bump::new()),
            symbols: Mutex::new(HashMap::new()),
            keywords: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an object in the infrastructure arena, flagging it permanent.
    /// The address is stable for the arena's lifetime (bump chunks never
    /// move), which is what lets the Value carry a raw pointer out of the
    /// lock.
    pub fn alloc_permanent<T: HeapObject>(&self, obj: T) -> Value {
        let arena = self.arena.lock().expect("intern arena poisoned");
        let slot: &mut T = arena.alloc(obj);
        let ptr = slot as *mut T as *mut u8;
        // Safety: every heap object starts with its header (repr(C))
        unsafe { (*(ptr as *mut ObjHeader)).permanent = true };
        Value::heap(T::TAG, ptr)
    }

    /// Intern a symbol. Idempotent; the returned Value is pointer-stable.
    pub fn symbol(&self, ns: Option<&str>, name: &str) -> Value {
        let key: SymKey = (ns.map(Into::into), name.into());
        let mut table = self.symbols.lock().expect("symbol table poisoned");
        if let Some(v) = table.get(&key) {
            return *v;
        }
        let v = self.alloc_permanent(ObjSymbol {
            hdr: ObjHeader::permanent(crate::value::HeapTag::Symbol),
            ns: key.0.clone(),
            name: key.1.clone(),
        });
        table.insert(key, v);
        v
    }

    /// Intern a keyword. Same discipline as [`InternTable::symbol`].
    pub fn keyword(&self, ns: Option<&str>, name: &str) -> Value {
        let key: SymKey = (ns.map(Into::into), name.into());
        let mut table = self.keywords.lock().expect("keyword table poisoned");
        if let Some(v) = table.get(&key) {
            return *v;
        }
        let v = self.alloc_permanent(ObjKeyword {
            hdr: ObjHeader::permanent(crate::value::HeapTag::Keyword),
            ns: key.0.clone(),
            name: key.1.clone(),
        });
        table.insert(key, v);
        v
    }

    /// Parse `ns/name` notation and intern. A lone `/` is the division
    /// symbol, not a separator.
    pub fn symbol_from(&self, qualified: &str) -> Value {
        match split_qualified(qualified) {
            Some((ns, name)) => self.symbol(Some(ns), name),
            None => self.symbol(None, qualified),
        }
    }

    pub fn keyword_from(&self, qualified: &str) -> Value {
        match split_qualified(qualified) {
            Some((ns, name)) => self.keyword(Some(ns), name),
            None => self.keyword(None, qualified),
        }
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.lock().expect("symbol table poisoned").len()
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.lock().expect("keyword table poisoned").len()
    }
}

impl Default for InternTable {
    fn default() -> Self {
        InternTable::new()
    }
}

fn split_qualified(s: &str) -> Option<(&str, &str)> {
    if s == "/" {
        return None;
    }
    let idx = s.find('/')?;
    let (ns, name) = s.split_at(idx);
    let name = &name[1..];
    if ns.is_empty() || name.is_empty() {
        return None;
    }
    Some((ns, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjSymbol;

    #[test]
    fn interning_is_idempotent() {
        let table = InternTable::new();
        let a = table.symbol(None, "foo");
        let b = table.symbol(None, "foo");
        assert!(a.identical(b), "same name must intern to same pointer");
        let c = table.symbol(Some("bar"), "foo");
        assert!(!a.identical(c));
    }

    #[test]
    fn keywords_and_symbols_distinct() {
        let table = InternTable::new();
        let sym = table.symbol(None, "x");
        let kw = table.keyword(None, "x");
        assert!(!sym.identical(kw));
    }

    #[test]
    fn qualified_parsing() {
        let table = InternTable::new();
        let v = table.symbol_from("clojure.core/map");
        let obj = ObjSymbol::of(v);
        assert_eq!(obj.ns.as_deref(), Some("clojure.core"));
        assert_eq!(obj.name.as_ref(), "map");

        let div = table.symbol_from("/");
        let obj = ObjSymbol::of(div);
        assert!(obj.ns.is_none());
        assert_eq!(obj.name.as_ref(), "/");
    }

    #[test]
    fn interned_objects_are_permanent() {
        let table = InternTable::new();
        let v = table.symbol(None, "rooted");
        assert!(crate::heap::header_of(v).permanent);
    }
}
