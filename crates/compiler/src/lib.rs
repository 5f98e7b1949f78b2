//! Lyra Compiler Library
//!
//! Source text flows `reader → analyzer → emitter`: the reader produces
//! located forms, the analyzer lowers them to the runtime's `Node` tree
//! (resolving locals, captures, and special forms), and the emitter turns
//! nodes into bytecode chunks. `eval_str` drives the whole pipeline through
//! the VM; `eval_str_treewalk` drives the same nodes through the tree-walk
//! engine for parity testing and bootstrap.

pub mod analyzer;
pub mod bootstrap;
pub mod emit;
pub mod form;
pub mod reader;
pub mod snapshot;

use std::sync::Arc;

use lyra_runtime::env::Env;
use lyra_runtime::error::Phase;
use lyra_runtime::{Loc, Value};

/// Error from the front half of the pipeline (reading, analysis, or
/// emission), carrying a phase and source location for the diagnostic box.
#[derive(Debug, Clone)]
pub struct CompilerError {
    pub kind: lyra_runtime::ErrorKind,
    pub message: String,
    pub phase: Phase,
    pub loc: Loc,
}

impl CompilerError {
    pub fn new(
        kind: lyra_runtime::ErrorKind,
        phase: Phase,
        loc: Loc,
        message: impl Into<String>,
    ) -> CompilerError {
        CompilerError { kind, message: message.into(), phase, loc }
    }

    /// Render the user-visible failure box for this error.
    pub fn diagnostic(&self, file: &str, source: &str) -> String {
        lyra_runtime::error::format_diagnostic(
            self.kind.keyword_name(),
            &self.message,
            self.phase,
            Some((file, self.loc.line as usize, self.loc.col as usize)),
            Some(source),
        )
    }
}

/// Either a front-end error or a thrown runtime exception.
#[derive(Debug)]
pub enum EvalError {
    Compile(CompilerError),
    Thrown(Value),
}

impl From<CompilerError> for EvalError {
    fn from(e: CompilerError) -> EvalError {
        EvalError::Compile(e)
    }
}

/// Read, analyze, compile, and run every top-level form of `src` on the VM.
/// Returns the value of the last form.
pub fn eval_str(env: &Env, src: &str) -> Result<Value, EvalError> {
    let forms = reader::read_all(src)?;
    let scope = env.roots();
    let mut last = Value::NIL;
    for form in &forms {
        let (node, local_count) = analyzer::analyze_top(env, form)?;
        let chunk = Arc::new(emit::compile_top(env, node, local_count)?);
        env.retain_chunk(chunk.clone());
        last = scope
            .keep(lyra_runtime::vm::execute_proto(env, chunk.top.clone()).map_err(EvalError::Thrown)?);
    }
    Ok(last)
}

/// Same pipeline, executed by the tree-walk engine. Both entries must agree
/// on every result (the compare-mode harness in `tests/parity.rs` holds them
/// to it).
pub fn eval_str_treewalk(env: &Env, src: &str) -> Result<Value, EvalError> {
    let forms = reader::read_all(src)?;
    let scope = env.roots();
    let mut last = Value::NIL;
    for form in &forms {
        let (node, local_count) = analyzer::analyze_top(env, form)?;
        last = scope.keep(
            lyra_runtime::treewalk::eval_top(env, node, local_count as usize)
                .map_err(EvalError::Thrown)?,
        );
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_str_runs_a_pipeline() {
        let env = bootstrap::new_env();
        let _m = env.gc.register_mutator();
        let out = eval_str(&env, "(+ 1 2)").unwrap();
        assert_eq!(out.as_i64(), 3);
    }
}
