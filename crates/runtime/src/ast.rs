//! Analyzer Output: the Node Tree
//!
//! The analyzer lowers reader forms into this tree; the bytecode compiler
//! and the tree-walk evaluator both consume it. Nodes are owned trees kept
//! alive by the environment's AST arena: tree-walk closures hold raw
//! pointers into them, and the arena is freed only on environment teardown,
//! after the collected heap.
//!
//! Locals are resolved at analysis time to flat per-function slots; free
//! variables of nested functions become capture records copied into the
//! closure object at creation.

use std::sync::Mutex;

use crate::heap::Var;
use crate::protocols::TypeKey;
use crate::value::Value;

/// Source position (1-indexed line/column) carried by every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Loc {
    pub line: u32,
    pub col: u32,
}

impl Loc {
    pub fn new(line: u32, col: u32) -> Loc {
        Loc { line, col }
    }
}

impl std::fmt::Display for Loc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Where a nested function's capture comes from in the enclosing frame.
#[derive(Debug, Clone, Copy)]
pub enum CaptureSource {
    /// A local slot of the enclosing function.
    Local(u16),
    /// A capture of the enclosing function, forwarded inward.
    Capture(u16),
    /// The closure itself: `(fn f [n] ... (f ...))` resolves `f` to this.
    /// Patched in after allocation, before the closure is published.
    SelfRef,
}

/// One arity body of a function.
#[derive(Debug)]
pub struct FnArity {
    /// Fixed parameter count; a variadic arity bundles the rest into the
    /// slot at index `params`.
    pub params: u16,
    pub is_variadic: bool,
    /// Total local slots for this arity, parameters included.
    pub local_count: u16,
    pub body: Vec<Node>,
}

/// A function expression: one or more arities plus its capture layout.
#[derive(Debug)]
pub struct FnNode {
    pub name: Option<Box<str>>,
    pub arities: Vec<FnArity>,
    pub captures: Vec<CaptureSource>,
    /// Names of captured locals, parallel to `captures` (diagnostics only).
    pub capture_names: Vec<Box<str>>,
    pub loc: Loc,
}

impl FnNode {
    /// Select the arity body for an `argc`-argument call: exact fixed match
    /// first, then the variadic fallback.
    pub fn arity_for(&self, argc: usize) -> Option<&FnArity> {
        self.arities
            .iter()
            .find(|a| !a.is_variadic && a.params as usize == argc)
            .or_else(|| self.arities.iter().find(|a| a.is_variadic && argc >= a.params as usize))
    }

    pub fn describe_name(&self) -> &str {
        self.name.as_deref().unwrap_or("fn")
    }
}

#[derive(Debug)]
pub struct LetBinding {
    pub slot: u16,
    pub name: Box<str>,
    pub init: Node,
}

#[derive(Debug)]
pub struct CatchClause {
    /// Keyword designator (`:default`, `:arity-error`, ...). Constant.
    pub kind: Value,
    /// Slot the exception value is bound to inside the handler body.
    pub slot: u16,
    pub name: Box<str>,
    pub body: Vec<Node>,
}

#[derive(Debug)]
pub struct CaseClause {
    /// Constant clause head; the analyzer precomputed `hash`.
    pub head: Value,
    pub hash: u32,
    pub body: Node,
}

/// A protocol method signature inside `extend-type`.
#[derive(Debug)]
pub struct ExtendMethod {
    pub name: Box<str>,
    pub fun: FnNode,
}

/// The node variants the compiler accepts. Each carries its source location
/// for error reporting.
#[derive(Debug)]
pub enum Node {
    Const {
        value: Value,
        loc: Loc,
    },
    Local {
        slot: u16,
        name: Box<str>,
        loc: Loc,
    },
    Captured {
        idx: u16,
        name: Box<str>,
        loc: Loc,
    },
    VarRef {
        var: &'static Var,
        loc: Loc,
    },
    /// `(var x)`: the var itself rather than its value.
    TheVar {
        var: &'static Var,
        loc: Loc,
    },
    Do {
        body: Vec<Node>,
        loc: Loc,
    },
    If {
        test: Box<Node>,
        then: Box<Node>,
        els: Option<Box<Node>>,
        loc: Loc,
    },
    Let {
        bindings: Vec<LetBinding>,
        body: Vec<Node>,
        loc: Loc,
    },
    Loop {
        bindings: Vec<LetBinding>,
        body: Vec<Node>,
        loc: Loc,
    },
    Recur {
        args: Vec<Node>,
        loc: Loc,
    },
    Fn(FnNode),
    Def {
        var: &'static Var,
        init: Option<Box<Node>>,
        dynamic: bool,
        loc: Loc,
    },
    /// `binding` special form: push a frame, run the body in try/finally,
    /// pop the frame.
    Binding {
        pairs: Vec<(&'static Var, Node)>,
        body: Vec<Node>,
        loc: Loc,
    },
    Try {
        body: Vec<Node>,
        catches: Vec<CatchClause>,
        finally: Option<Vec<Node>>,
        loc: Loc,
    },
    Throw {
        exc: Box<Node>,
        loc: Loc,
    },
    Invoke {
        f: Box<Node>,
        args: Vec<Node>,
        loc: Loc,
    },
    VectorLit {
        items: Vec<Node>,
        loc: Loc,
    },
    MapLit {
        pairs: Vec<(Node, Node)>,
        loc: Loc,
    },
    SetLit {
        items: Vec<Node>,
        loc: Loc,
    },
    Case {
        expr: Box<Node>,
        clauses: Vec<CaseClause>,
        default: Option<Box<Node>>,
        loc: Loc,
    },
    DefProtocol {
        var: &'static Var,
        name: Value,
        methods: Vec<Value>,
        loc: Loc,
    },
    ExtendType {
        protocol: Box<Node>,
        type_key: TypeKey,
        methods: Vec<ExtendMethod>,
        loc: Loc,
    },
    DefMulti {
        var: &'static Var,
        name: Value,
        dispatch: Box<Node>,
        loc: Loc,
    },
    DefMethod {
        multi: Box<Node>,
        dispatch_val: Box<Node>,
        fun: FnNode,
        loc: Loc,
    },
}

impl Node {
    pub fn loc(&self) -> Loc {
        match self {
            Node::Const { loc, .. }
            | Node::Local { loc, .. }
            | Node::Captured { loc, .. }
            | Node::VarRef { loc, .. }
            | Node::TheVar { loc, .. }
            | Node::Do { loc, .. }
            | Node::If { loc, .. }
            | Node::Let { loc, .. }
            | Node::Loop { loc, .. }
            | Node::Recur { loc, .. }
            | Node::Def { loc, .. }
            | Node::Binding { loc, .. }
            | Node::Try { loc, .. }
            | Node::Throw { loc, .. }
            | Node::Invoke { loc, .. }
            | Node::VectorLit { loc, .. }
            | Node::MapLit { loc, .. }
            | Node::SetLit { loc, .. }
            | Node::Case { loc, .. }
            | Node::DefProtocol { loc, .. }
            | Node::ExtendType { loc, .. }
            | Node::DefMulti { loc, .. }
            | Node::DefMethod { loc, .. } => *loc,
            Node::Fn(f) => f.loc,
        }
    }
}

/// Owns every analyzed top-level tree. Append-only; freed with the
/// environment. Returning `&'static` is sound for the same reason the
/// infrastructure arena's pointers are: nothing that can reach a node
/// outlives the environment.
pub struct AstArena {
    trees: Mutex<Vec<Box<Node>>>,
}

impl AstArena {
    pub fn new() -> AstArena {
        AstArena { trees: Mutex::new(Vec::new()) }
    }

    pub fn keep(&self, node: Node) -> &'static Node {
        let boxed = Box::new(node);
        let ptr: *const Node = &*boxed;
        self.trees.lock().expect("ast arena poisoned").push(boxed);
        // Safety: the box is retained until the arena drops with the Env
        unsafe { &*ptr }
    }

    pub fn tree_count(&self) -> usize {
        self.trees.lock().expect("ast arena poisoned").len()
    }
}

impl Default for AstArena {
    fn default() -> Self {
        AstArena::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_selection_prefers_exact_match() {
        let fixed = FnArity { params: 1, is_variadic: false, local_count: 1, body: vec![] };
        let variadic = FnArity { params: 1, is_variadic: true, local_count: 2, body: vec![] };
        let node = FnNode {
            name: None,
            arities: vec![fixed, variadic],
            captures: vec![],
            capture_names: vec![],
            loc: Loc::default(),
        };
        assert!(!node.arity_for(1).unwrap().is_variadic);
        assert!(node.arity_for(3).unwrap().is_variadic);
        assert!(node.arity_for(0).is_none());
    }

    #[test]
    fn arena_pointers_stay_valid() {
        let arena = AstArena::new();
        let a = arena.keep(Node::Const { value: Value::int(1), loc: Loc::new(1, 1) });
        let _b = arena.keep(Node::Const { value: Value::int(2), loc: Loc::new(1, 2) });
        match a {
            Node::Const { value, .. } => assert_eq!(value.as_i64(), 1),
            _ => panic!("expected const"),
        }
        assert_eq!(arena.tree_count(), 2);
    }
}
