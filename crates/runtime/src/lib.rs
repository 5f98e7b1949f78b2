//! Lyra Runtime: the execution engine of a Clojure-dialect language
//!
//! Key design principles:
//! - Value: one NaN-boxed 8-byte word for every runtime datum
//! - Heap: tagged objects owned by a stop-the-world mark-sweep collector
//! - Two engines, one AST: a bytecode VM and a tree-walk evaluator execute
//!   the same analyzer nodes and must agree on results
//! - One call bridge: every invocation of a callable value, from either
//!   engine or any builtin, goes through `bridge::call_fn`

pub mod arith;
pub mod ast;
pub mod bindings;
pub mod bridge;
pub mod builtins;
pub mod chunk;
pub mod collections;
pub mod concurrency;
pub mod diagnostics;
pub mod env;
pub mod eq;
pub mod error;
pub mod gc;
pub mod hashing;
pub mod heap;
pub mod intern;
pub mod multimethods;
pub mod printer;
pub mod protocols;
pub mod seq;
pub mod treewalk;
pub mod value;
pub mod vm;

// Re-export the types nearly every consumer touches.
pub use ast::{FnArity, FnNode, Loc, Node};
pub use chunk::{Chunk, FnProto, Instr, Op};
pub use env::{CORE_NS, Env, RootScope, USER_NS};
pub use error::{ErrorKind, Phase};
pub use value::{HeapTag, Tag, Value};
