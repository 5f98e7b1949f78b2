//! Compiled Code: Opcodes, Prototypes, Chunks
//!
//! Instructions are fixed-width records: a one-byte opcode and a two-byte
//! operand. Indices that overflow the operand are carried by `Ext` extension
//! words following the instruction. Jump targets are absolute instruction
//! indices.
//!
//! A function prototype owns its code, constant pool, arity table, nested
//! prototypes, and the side tables the VM indexes by operand: var-load sites
//! (with their inline caches), loop descriptors for `recur`, exception
//! handler descriptors, and `case` dispatch tables.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ast::CaptureSource;
use crate::heap::Var;
use crate::value::Value;

/// Operand value signalling that the real index follows in two `Ext` words.
pub const WIDE_OPERAND: u16 = u16::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // Constants & locals
    Const,
    /// Extension word: 16 more operand bits for the preceding instruction.
    Ext,
    Nil,
    True,
    False,
    /// Small integer immediate; operand is a sign-extended i16.
    Int,
    LoadLocal,
    StoreLocal,
    LoadCaptured,
    Pop,
    Dup,

    // Arithmetic: integer fast path inline, shared slow path on mixed tags
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Rem,
    Neg,

    // Comparison
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Not,

    // Branches (absolute targets)
    Jump,
    BranchIfFalse,
    BranchIfTrue,

    // Collection constructors: operand = element (or pair) count
    VecNew,
    ListNew,
    MapNew,
    SetNew,

    // Calls: operand = argument count
    Call,
    TailCall,
    Apply,
    Return,

    // Vars
    /// operand = var site index; cached root load
    VarLoad,
    /// operand = constant index of the symbol; slow path through resolution
    VarResolve,
    /// operand = var site index; pops the value, sets the root
    Def,
    DefDynamic,

    // Closures: operand = nested prototype index
    MakeClosure,

    // Recur: operand = loop descriptor index; arguments are on the stack
    Recur,

    // Exceptions
    /// operand = handler descriptor index
    TryStart,
    TryEnd,
    Throw,

    // Case: operand = case table index
    CaseDispatch,

    // Dynamic bindings: operand = pair count (BindingPush) or unused (BindingPop)
    BindingPush,
    BindingPop,
    /// operand = constant index of the error kind; peeks the exception
    CatchMatch,

    // Superinstructions (peephole-fused adjacent patterns)
    /// load-local; load-const; add. Operand = slot<<8 | const index
    AddLocalConst,
    /// eq; branch-if-false. Pops two, jumps on not-equal
    BranchIfNeq,
    /// lt; branch-if-false. Pops two, jumps on !(a < b)
    BranchIfNotLt,
    /// load-local; recur. Operand = slot<<8 | loop index, single-arg recur
    RecurLocal1,
}

/// One three-byte instruction record (padded to four in memory).
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub op: Op,
    pub a: u16,
}

impl Instr {
    pub fn new(op: Op, a: u16) -> Instr {
        Instr { op, a }
    }
}

/// Static half of an exception handler. The VM pushes a runtime record with
/// the saved stack/frame depths at `TryStart`.
#[derive(Debug, Clone, Copy)]
pub struct HandlerDesc {
    pub pc_begin: u32,
    pub pc_end: u32,
    pub pc_handler: u32,
}

/// Loop descriptor for `recur`: where to jump and which slots to rebind.
#[derive(Debug, Clone, Copy)]
pub struct LoopInfo {
    pub start_pc: u32,
    pub base_slot: u16,
    pub count: u16,
}

/// Hash-table slot in a compiled `case`.
#[derive(Debug, Clone, Copy)]
pub struct CaseSlot {
    pub head: Value,
    pub target: u32,
}

#[derive(Debug)]
pub enum CaseStrategy {
    /// Open-addressed-free perfect-ish table: index by (hash >> shift) & mask,
    /// verify the head, fall through to default on mismatch.
    Hash { shift: u32, mask: u32, slots: Vec<Option<CaseSlot>> },
    /// Sequential equality chain, used when clause hashes collide.
    Seq { clauses: Vec<CaseSlot> },
}

#[derive(Debug)]
pub struct CaseTable {
    pub strategy: CaseStrategy,
    pub default_target: u32,
}

/// A var-load site with its monomorphic cache: the root value stamped with
/// the var generation it was read at.
pub struct VarSite {
    pub var: &'static Var,
    cache_gen: AtomicU64,
    cache_val: AtomicU64,
}

impl VarSite {
    pub fn new(var: &'static Var) -> VarSite {
        VarSite { var, cache_gen: AtomicU64::new(u64::MAX), cache_val: AtomicU64::new(0) }
    }

    /// Cached root read; refreshes when the var has been redefined.
    #[inline]
    pub fn load(&self) -> Option<Value> {
        let gen_now = self.var.generation.load(Ordering::Acquire);
        if self.cache_gen.load(Ordering::Acquire) == gen_now {
            return Some(Value::from_bits(self.cache_val.load(Ordering::Acquire)));
        }
        if !self.var.bound.load(Ordering::Acquire) {
            return None;
        }
        let v = self.var.root();
        self.cache_val.store(v.to_bits(), Ordering::Release);
        self.cache_gen.store(gen_now, Ordering::Release);
        Some(v)
    }
}

impl std::fmt::Debug for VarSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VarSite({})", self.var.qualified())
    }
}

/// One arity entry of a prototype: its parameter shape and code entry point.
#[derive(Debug, Clone, Copy)]
pub struct ArityEntry {
    pub params: u16,
    pub is_variadic: bool,
    pub local_count: u16,
    pub entry_pc: u32,
}

/// The shared, immutable body-and-layout of a compiled function. Closures
/// pair one of these with captured values.
pub struct FnProto {
    pub name: Option<Box<str>>,
    pub arities: Vec<ArityEntry>,
    pub code: Vec<Instr>,
    pub consts: Vec<Value>,
    pub protos: Vec<Arc<FnProto>>,
    pub var_sites: Vec<VarSite>,
    pub loops: Vec<LoopInfo>,
    pub handlers: Vec<HandlerDesc>,
    pub cases: Vec<CaseTable>,
    /// How to fill this function's captures from the *enclosing* frame at
    /// `MakeClosure` time.
    pub capture_sources: Vec<CaptureSource>,
    /// Source map: (pc, line) pairs, ascending by pc.
    pub lines: Vec<(u32, u32)>,
}

impl FnProto {
    pub fn describe_name(&self) -> &str {
        self.name.as_deref().unwrap_or("fn")
    }

    /// Arity dispatch: exact fixed match, else the variadic fallback.
    pub fn arity_for(&self, argc: usize) -> Option<&ArityEntry> {
        self.arities
            .iter()
            .find(|a| !a.is_variadic && a.params as usize == argc)
            .or_else(|| self.arities.iter().find(|a| a.is_variadic && argc >= a.params as usize))
    }

    /// Largest local frame any arity of this prototype needs.
    pub fn max_locals(&self) -> u16 {
        self.arities.iter().map(|a| a.local_count).max().unwrap_or(0)
    }

    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        let mut line = None;
        for (at, l) in &self.lines {
            if *at > pc {
                break;
            }
            line = Some(*l);
        }
        line
    }

    /// GC contribution: constants here and in every nested prototype, plus
    /// case-table heads (which are constants but traced for completeness).
    pub fn push_roots(&self, work: &mut Vec<Value>) {
        work.extend_from_slice(&self.consts);
        for table in &self.cases {
            match &table.strategy {
                CaseStrategy::Hash { slots, .. } => {
                    for slot in slots.iter().flatten() {
                        work.push(slot.head);
                    }
                }
                CaseStrategy::Seq { clauses } => {
                    for c in clauses {
                        work.push(c.head);
                    }
                }
            }
        }
        for proto in &self.protos {
            proto.push_roots(work);
        }
    }
}

impl std::fmt::Debug for FnProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FnProto({}, {} instrs, {} consts, {} protos)",
            self.describe_name(),
            self.code.len(),
            self.consts.len(),
            self.protos.len()
        )
    }
}

/// A compiled top-level unit: the entry prototype plus source identity.
pub struct Chunk {
    pub top: Arc<FnProto>,
    pub file: Option<Box<str>>,
}

impl Chunk {
    pub fn push_roots(&self, work: &mut Vec<Value>) {
        self.top.push_roots(work);
    }
}

/// Render a prototype's code for debugging and golden tests.
pub fn disassemble(proto: &FnProto) -> String {
    let mut out = String::new();
    disassemble_into(proto, 0, &mut out);
    out
}

fn disassemble_into(proto: &FnProto, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    out.push_str(&format!("{indent}fn {}:\n", proto.describe_name()));
    for (pc, instr) in proto.code.iter().enumerate() {
        out.push_str(&format!("{indent}  {pc:04} {:?} {}\n", instr.op, instr.a));
    }
    for nested in &proto.protos {
        disassemble_into(nested, depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instr_is_compact() {
        assert!(std::mem::size_of::<Instr>() <= 4);
    }

    #[test]
    fn arity_dispatch_prefers_exact() {
        let proto = FnProto {
            name: Some("f".into()),
            arities: vec![
                ArityEntry { params: 2, is_variadic: false, local_count: 2, entry_pc: 0 },
                ArityEntry { params: 1, is_variadic: true, local_count: 2, entry_pc: 10 },
            ],
            code: vec![],
            consts: vec![],
            protos: vec![],
            var_sites: vec![],
            loops: vec![],
            handlers: vec![],
            cases: vec![],
            capture_sources: vec![],
            lines: vec![],
        };
        assert_eq!(proto.arity_for(2).unwrap().entry_pc, 0);
        assert_eq!(proto.arity_for(5).unwrap().entry_pc, 10);
        assert_eq!(proto.arity_for(1).unwrap().entry_pc, 10);
        assert!(proto.arity_for(0).is_none());
    }

    #[test]
    fn var_site_cache_invalidated_on_redef() {
        let var: &'static Var = Box::leak(Box::new(Var::new("t", "x")));
        var.set_root(Value::int(1));
        let site = VarSite::new(var);
        assert_eq!(site.load().unwrap().as_i64(), 1);
        var.set_root(Value::int(2));
        assert_eq!(site.load().unwrap().as_i64(), 2, "generation bump must refresh the cache");
    }

    #[test]
    fn line_lookup_uses_latest_entry() {
        let proto = FnProto {
            name: None,
            arities: vec![],
            code: vec![],
            consts: vec![],
            protos: vec![],
            var_sites: vec![],
            loops: vec![],
            handlers: vec![],
            cases: vec![],
            capture_sources: vec![],
            lines: vec![(0, 1), (5, 2), (9, 4)],
        };
        assert_eq!(proto.line_for_pc(0), Some(1));
        assert_eq!(proto.line_for_pc(7), Some(2));
        assert_eq!(proto.line_for_pc(20), Some(4));
    }
}
