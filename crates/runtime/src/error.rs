//! Error Taxonomy and Exception Values
//!
//! Every runtime failure is a thrown exception Value: an ex-info map with
//! `:type`, `:message`, `:phase`, and optional `:data`. Builtins return
//! `Result<Value, Value>` where the error side is such a map; `try`/`catch`
//! sees them like any user-thrown value.
//!
//! Internal errors and out-of-memory are excluded from `:default` catch
//! clauses; they abort the current evaluation unless a catch names them
//! explicitly.
//!
//! The thread-local last-error slot mirrors what the top level prints; it is
//! a formatted string, not a Value, so it needs no GC rooting.

use std::cell::RefCell;

use crate::env::Env;
use crate::heap::{ObjArrayMap, ObjHashMap, ObjStr};
use crate::value::{HeapTag, Value};

/// The kinds the core produces and consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Name,
    Arity,
    Value,
    Type,
    Arithmetic,
    Index,
    Io,
    Compile,
    Internal,
    OutOfMemory,
    IllegalState,
}

impl ErrorKind {
    pub fn keyword_name(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax-error",
            ErrorKind::Name => "name-error",
            ErrorKind::Arity => "arity-error",
            ErrorKind::Value => "value-error",
            ErrorKind::Type => "type-error",
            ErrorKind::Arithmetic => "arithmetic-error",
            ErrorKind::Index => "index-error",
            ErrorKind::Io => "io-error",
            ErrorKind::Compile => "compile-error",
            ErrorKind::Internal => "internal-error",
            ErrorKind::OutOfMemory => "out-of-memory",
            ErrorKind::IllegalState => "illegal-state",
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub fn set_last_error(msg: impl Into<String>) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg.into()));
}

pub fn take_last_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

pub fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Build a thrown exception value `{:type kind :message msg :phase :eval}`.
/// Allocation failure degrades to the preallocated out-of-memory exception.
pub fn raise(env: &Env, kind: ErrorKind, msg: impl Into<String>) -> Value {
    raise_with(env, kind, msg, Value::NIL)
}

/// Like [`raise`] but carries a `:data` payload.
pub fn raise_with(env: &Env, kind: ErrorKind, msg: impl Into<String>, data: Value) -> Value {
    let msg = msg.into();
    set_last_error(format!("{}: {msg}", kind.keyword_name()));
    let scope = env.roots();
    scope.keep(data);
    let Ok(msg_v) = env.alloc_str(msg) else {
        return env.oom_error();
    };
    scope.keep(msg_v);
    let mut entries = vec![
        (env.keyword("type"), env.keyword(kind.keyword_name())),
        (env.keyword("message"), msg_v),
        (env.keyword("phase"), env.keyword("eval")),
    ];
    if !data.is_nil() {
        entries.push((env.keyword("data"), data));
    }
    match env.alloc(ObjArrayMap::new(entries)) {
        Ok(v) => v,
        Err(oom) => oom,
    }
}

/// Identity-keyed lookup in an exception map. Keywords are interned, so
/// pointer comparison is exact.
pub fn lookup_identity(map: Value, key: Value) -> Option<Value> {
    match map.heap_tag() {
        Some(HeapTag::ArrayMap) => ObjArrayMap::of(map)
            .entries
            .iter()
            .find(|(k, _)| k.identical(key))
            .map(|(_, v)| *v),
        Some(HeapTag::HashMap) => ObjHashMap::of(map)
            .entries
            .iter()
            .find(|(k, _)| k.identical(key))
            .map(|(_, v)| *v),
        _ => None,
    }
}

/// `:type` of an exception value, when it is an ex-info map.
pub fn ex_type(env: &Env, exc: Value) -> Option<Value> {
    lookup_identity(exc, env.keyword("type"))
}

/// `:message` of an exception value as a Rust string.
pub fn ex_message_str(env: &Env, exc: Value) -> Option<String> {
    let msg = lookup_identity(exc, env.keyword("message"))?;
    match msg.heap_tag() {
        Some(HeapTag::Str) => Some(ObjStr::of(msg).data.to_string()),
        _ => None,
    }
}

/// Does a `catch` clause with designator `catch_kind` intercept `exc`?
///
/// `:default` matches everything except internal-error and out-of-memory;
/// those must be named explicitly. A keyword designator matches when it
/// equals the exception's `:type` or is an ancestor of it in the global
/// hierarchy.
pub fn catch_matches(env: &Env, catch_kind: Value, exc: Value) -> bool {
    let exc_type = ex_type(env, exc);
    let internal = env.keyword("internal-error");
    let oom = env.keyword("out-of-memory");

    if catch_kind.identical(env.keyword("default")) {
        return match exc_type {
            Some(t) => !t.identical(internal) && !t.identical(oom),
            // Arbitrary thrown values (not ex-info maps) are user errors.
            None => true,
        };
    }
    match exc_type {
        Some(t) => crate::multimethods::isa(env, t, catch_kind),
        None => false,
    }
}

/// Phase of the pipeline a diagnostic originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Parse,
    Analysis,
    Compile,
    Eval,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Parse => "parse",
            Phase::Analysis => "analysis",
            Phase::Compile => "compile",
            Phase::Eval => "eval",
        };
        f.write_str(s)
    }
}

/// Render the user-visible failure box:
///
/// ```text
/// ----- Error -----------------------------------------------
/// Type:     <kind>
/// Message:  <message>
/// Phase:    <parse|analysis|compile|eval>
/// Location: <file>:<line>:<col>
///
///    <line-1>
///    <line>
///        ^--- here
///    <line+1>
/// ```
pub fn format_diagnostic(
    kind: &str,
    message: &str,
    phase: Phase,
    location: Option<(&str, usize, usize)>,
    source: Option<&str>,
) -> String {
    let mut out = String::new();
    out.push_str("----- Error -----------------------------------------------\n");
    out.push_str(&format!("Type:     {kind}\n"));
    out.push_str(&format!("Message:  {message}\n"));
    out.push_str(&format!("Phase:    {phase}\n"));
    if let Some((file, line, col)) = location {
        out.push_str(&format!("Location: {file}:{line}:{col}\n"));
        if let Some(src) = source {
            out.push('\n');
            let lines: Vec<&str> = src.lines().collect();
            // line is 1-indexed
            if line >= 2 && let Some(prev) = lines.get(line - 2) {
                out.push_str(&format!("   {prev}\n"));
            }
            if let Some(cur) = lines.get(line - 1) {
                out.push_str(&format!("   {cur}\n"));
                out.push_str(&format!("   {}^--- here\n", " ".repeat(col.saturating_sub(1))));
            }
            if let Some(next) = lines.get(line) {
                out.push_str(&format!("   {next}\n"));
            }
        }
    }
    out
}

/// Convenience used by both engines when a callable gets the wrong argument
/// count.
pub fn arity_error(env: &Env, name: &str, got: usize) -> Value {
    raise(env, ErrorKind::Arity, format!("wrong number of args ({got}) passed to {name}"))
}

pub fn type_error(env: &Env, expected: &str, got: Value) -> Value {
    raise(
        env,
        ErrorKind::Type,
        format!("expected {expected}, got {}", crate::printer::type_name(got)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(env: &Env, s: &str) -> Value {
        env.keyword(s)
    }

    #[test]
    fn raise_builds_ex_info_map() {
        let env = Env::new();
        let _m = env.gc.register_mutator();
        let exc = raise(&env, ErrorKind::Arity, "wrong number of args (3)");
        assert_eq!(ex_type(&env, exc), Some(kw(&env, "arity-error")));
        assert_eq!(ex_message_str(&env, exc).as_deref(), Some("wrong number of args (3)"));
    }

    #[test]
    fn default_catch_skips_internal_errors() {
        let env = Env::new();
        let _m = env.gc.register_mutator();
        let user = raise(&env, ErrorKind::Value, "bad binding");
        let internal = raise(&env, ErrorKind::Internal, "bug");
        let oom = env.oom_error();
        let default = kw(&env, "default");
        assert!(catch_matches(&env, default, user));
        assert!(!catch_matches(&env, default, internal));
        assert!(!catch_matches(&env, default, oom));
        // Named explicitly, internal errors are catchable.
        assert!(catch_matches(&env, kw(&env, "internal-error"), internal));
    }

    #[test]
    fn keyword_catch_matches_exact_type() {
        let env = Env::new();
        let _m = env.gc.register_mutator();
        let exc = raise(&env, ErrorKind::Arithmetic, "Divide by zero");
        assert!(catch_matches(&env, kw(&env, "arithmetic-error"), exc));
        assert!(!catch_matches(&env, kw(&env, "io-error"), exc));
    }

    #[test]
    fn diagnostic_box_shape() {
        let text = format_diagnostic(
            "syntax-error",
            "unmatched delimiter",
            Phase::Parse,
            Some(("script.clj", 2, 5)),
            Some("(foo\n(bar]\n(baz)"),
        );
        assert!(text.starts_with("----- Error ---"));
        assert!(text.contains("Type:     syntax-error"));
        assert!(text.contains("Location: script.clj:2:5"));
        assert!(text.contains("^--- here"));
        assert!(text.contains("(bar]"));
    }

    #[test]
    fn last_error_roundtrip() {
        clear_last_error();
        let env = Env::new();
        let _m = env.gc.register_mutator();
        let _ = raise(&env, ErrorKind::Index, "out of bounds");
        let last = take_last_error().unwrap();
        assert!(last.contains("index-error"));
        assert!(take_last_error().is_none());
    }
}
