//! Printing
//!
//! Two modes: *readable* (`pr-str`, re-parseable, strings quoted) and
//! *pretty* (`str`/`println`, strings raw). Depth and length are governed by
//! the dynamic vars `*print-level*` and `*print-length*`; when a limit is
//! hit the printer emits `...`.
//!
//! Printing inspects structure, so lazy sequences are realized as they are
//! walked, which is why printing can throw.

use crate::env::Env;
use crate::heap::{
    ObjAgent, ObjAtom, ObjClosure, ObjDelay, ObjFuture, ObjHashSet, ObjKeyword, ObjMultimethod,
    ObjPromise, ObjProtocol, ObjProtocolMethod, ObjReduced, ObjRegex, ObjStr, ObjSymbol,
    ObjVector, ObjVolatile, Var,
};
use crate::seq;
use crate::value::{HeapTag, Tag, Value};

/// Keyword-ish name of a value's type, used by `type` and error messages.
pub fn type_name(v: Value) -> &'static str {
    match v.tag() {
        Tag::Nil => "nil",
        Tag::True | Tag::False => "boolean",
        Tag::Int => "integer",
        Tag::Float => "float",
        Tag::Char => "char",
        Tag::Builtin => "function",
        Tag::Heap(tag) => match tag {
            HeapTag::Str => "string",
            HeapTag::Symbol => "symbol",
            HeapTag::Keyword => "keyword",
            HeapTag::Cons | HeapTag::EmptyList | HeapTag::ChunkedCons => "list",
            HeapTag::Vector => "vector",
            HeapTag::ArrayMap | HeapTag::HashMap => "map",
            HeapTag::HashSet => "set",
            HeapTag::Closure => "function",
            HeapTag::Atom => "atom",
            HeapTag::Volatile => "volatile",
            HeapTag::Regex => "regex",
            HeapTag::Protocol => "protocol",
            HeapTag::ProtocolMethod => "protocol-method",
            HeapTag::Multimethod => "multimethod",
            HeapTag::LazySeq => "lazy-seq",
            HeapTag::VarRef => "var",
            HeapTag::Delay => "delay",
            HeapTag::Reduced => "reduced",
            HeapTag::TransientVector => "transient-vector",
            HeapTag::TransientMap => "transient-map",
            HeapTag::TransientSet => "transient-set",
            HeapTag::ArrayChunk => "array-chunk",
            HeapTag::MutableArray => "array",
            HeapTag::Future => "future",
            HeapTag::Promise => "promise",
            HeapTag::Agent => "agent",
            HeapTag::BigInt => "bigint",
            HeapTag::Ratio => "ratio",
            HeapTag::Foreign => "foreign",
        },
    }
}

fn print_limits(env: &Env) -> (Option<i64>, Option<i64>) {
    let level = env
        .var_value(env.print_level_var())
        .filter(|v| v.is_int())
        .map(|v| v.as_i64());
    let length = env
        .var_value(env.print_length_var())
        .filter(|v| v.is_int())
        .map(|v| v.as_i64());
    (level, length)
}

/// Readable rendering (`pr-str`).
pub fn pr_str(env: &Env, v: Value) -> Result<String, Value> {
    let (level, length) = print_limits(env);
    let mut out = String::new();
    write_value(env, &mut out, v, true, 0, level, length)?;
    Ok(out)
}

/// Pretty rendering (`str`): strings raw, chars bare.
pub fn pretty_str(env: &Env, v: Value) -> Result<String, Value> {
    let (level, length) = print_limits(env);
    let mut out = String::new();
    write_value(env, &mut out, v, false, 0, level, length)?;
    Ok(out)
}

fn write_float(out: &mut String, f: f64) {
    if f.is_nan() {
        out.push_str("##NaN");
    } else if f.is_infinite() {
        out.push_str(if f > 0.0 { "##Inf" } else { "##-Inf" });
    } else if f.fract() == 0.0 && f.abs() < 1e17 {
        out.push_str(&format!("{f:.1}"));
    } else {
        out.push_str(&format!("{f}"));
    }
}

fn write_char_readable(out: &mut String, c: char) {
    match c {
        '\n' => out.push_str("\\newline"),
        '\t' => out.push_str("\\tab"),
        '\r' => out.push_str("\\return"),
        ' ' => out.push_str("\\space"),
        _ => {
            out.push('\\');
            out.push(c);
        }
    }
}

fn write_string_readable(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

fn write_seq_body(
    env: &Env,
    out: &mut String,
    coll: Value,
    readable: bool,
    depth: u32,
    level: Option<i64>,
    length: Option<i64>,
) -> Result<(), Value> {
    let scope = env.roots();
    let slot = scope.slot(coll);
    let mut cur = seq::seq(env, coll)?;
    let mut i: i64 = 0;
    while !cur.is_nil() {
        // Pin before polling: `cur` may be a freshly built view.
        slot.set(cur);
        env.safe_point();
        if i > 0 {
            out.push(' ');
        }
        if let Some(max) = length
            && i >= max
        {
            out.push_str("...");
            return Ok(());
        }
        let elem = seq::seq_first(env, cur)?;
        write_value(env, out, elem, readable, depth, level, length)?;
        let r = seq::seq_rest(env, cur)?;
        slot.set(r);
        cur = seq::seq(env, r)?;
        i += 1;
    }
    Ok(())
}

fn write_value(
    env: &Env,
    out: &mut String,
    v: Value,
    readable: bool,
    depth: u32,
    level: Option<i64>,
    length: Option<i64>,
) -> Result<(), Value> {
    // Depth limiting applies to collections; scalars print at any depth.
    let is_coll = matches!(
        v.heap_tag(),
        Some(
            HeapTag::Cons
                | HeapTag::EmptyList
                | HeapTag::ChunkedCons
                | HeapTag::LazySeq
                | HeapTag::Vector
                | HeapTag::ArrayMap
                | HeapTag::HashMap
                | HeapTag::HashSet
        )
    );
    if is_coll
        && let Some(max) = level
        && depth as i64 >= max
    {
        out.push_str("...");
        return Ok(());
    }
    match v.tag() {
        Tag::Nil => out.push_str("nil"),
        Tag::True => out.push_str("true"),
        Tag::False => out.push_str("false"),
        Tag::Int => out.push_str(&v.as_i64().to_string()),
        Tag::Float => write_float(out, v.as_f64()),
        Tag::Char => {
            if readable {
                write_char_readable(out, v.as_char());
            } else {
                out.push(v.as_char());
            }
        }
        Tag::Builtin => out.push_str(&format!("#function[{}]", v.as_builtin().name)),
        Tag::Heap(tag) => match tag {
            HeapTag::Str => {
                let s = &ObjStr::of(v).data;
                if readable {
                    write_string_readable(out, s);
                } else {
                    out.push_str(s);
                }
            }
            HeapTag::Symbol => out.push_str(&ObjSymbol::of(v).qualified()),
            HeapTag::Keyword => {
                out.push(':');
                out.push_str(&ObjKeyword::of(v).qualified());
            }
            HeapTag::Regex => {
                out.push_str("#\"");
                out.push_str(&ObjRegex::of(v).source);
                out.push('"');
            }
            HeapTag::EmptyList => out.push_str("()"),
            HeapTag::Cons | HeapTag::ChunkedCons | HeapTag::LazySeq => {
                out.push('(');
                write_seq_body(env, out, v, readable, depth + 1, level, length)?;
                out.push(')');
            }
            HeapTag::Vector => {
                out.push('[');
                let items = &ObjVector::of(v).items;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    if let Some(max) = length
                        && i as i64 >= max
                    {
                        out.push_str("...");
                        break;
                    }
                    write_value(env, out, *item, readable, depth + 1, level, length)?;
                }
                out.push(']');
            }
            HeapTag::ArrayMap | HeapTag::HashMap => {
                out.push('{');
                let entries = crate::eq::map_entries(v);
                for (i, (k, val)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if let Some(max) = length
                        && i as i64 >= max
                    {
                        out.push_str("...");
                        break;
                    }
                    write_value(env, out, *k, readable, depth + 1, level, length)?;
                    out.push(' ');
                    write_value(env, out, *val, readable, depth + 1, level, length)?;
                }
                out.push('}');
            }
            HeapTag::HashSet => {
                out.push_str("#{");
                let entries = &ObjHashSet::of(v).entries;
                for (i, item) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    if let Some(max) = length
                        && i as i64 >= max
                    {
                        out.push_str("...");
                        break;
                    }
                    write_value(env, out, *item, readable, depth + 1, level, length)?;
                }
                out.push('}');
            }
            HeapTag::Closure => {
                let c = ObjClosure::of(v);
                out.push_str(&format!(
                    "#function[{}]",
                    c.name.as_deref().unwrap_or("anonymous")
                ));
            }
            HeapTag::Atom => {
                out.push_str("#atom[");
                write_value(env, out, ObjAtom::of(v).load(), readable, depth + 1, level, length)?;
                out.push(']');
            }
            HeapTag::Volatile => {
                out.push_str("#volatile[");
                write_value(
                    env,
                    out,
                    ObjVolatile::of(v).load(),
                    readable,
                    depth + 1,
                    level,
                    length,
                )?;
                out.push(']');
            }
            HeapTag::VarRef => {
                out.push_str("#'");
                out.push_str(&Var::of(v).qualified());
            }
            HeapTag::Protocol => {
                out.push_str("#protocol[");
                write_value(env, out, ObjProtocol::of(v).name, readable, depth + 1, level, length)?;
                out.push(']');
            }
            HeapTag::ProtocolMethod => {
                out.push_str(&format!("#protocol-method[{}]", ObjProtocolMethod::of(v).name));
            }
            HeapTag::Multimethod => {
                out.push_str("#multimethod[");
                write_value(
                    env,
                    out,
                    ObjMultimethod::of(v).name,
                    readable,
                    depth + 1,
                    level,
                    length,
                )?;
                out.push(']');
            }
            HeapTag::Delay => {
                let forced = ObjDelay::of(v).state.lock().expect("delay poisoned").value.is_some();
                out.push_str(if forced { "#delay[realized]" } else { "#delay[pending]" });
            }
            HeapTag::Reduced => {
                out.push_str("#reduced[");
                write_value(env, out, ObjReduced::of(v).value, readable, depth + 1, level, length)?;
                out.push(']');
            }
            HeapTag::Future => {
                let done =
                    ObjFuture::of(v).shared.result.lock().expect("future poisoned").is_some();
                out.push_str(if done { "#future[done]" } else { "#future[pending]" });
            }
            HeapTag::Promise => {
                let delivered =
                    ObjPromise::of(v).shared.value.lock().expect("promise poisoned").is_some();
                out.push_str(if delivered { "#promise[delivered]" } else { "#promise[pending]" });
            }
            HeapTag::Agent => {
                out.push_str("#agent[");
                let val = *ObjAgent::of(v).shared.value.lock().expect("agent poisoned");
                write_value(env, out, val, readable, depth + 1, level, length)?;
                out.push(']');
            }
            HeapTag::TransientVector | HeapTag::TransientMap | HeapTag::TransientSet => {
                out.push_str("#transient[");
                out.push_str(type_name(v));
                out.push(']');
            }
            HeapTag::ArrayChunk | HeapTag::MutableArray => {
                out.push_str(&format!("#{}[]", type_name(v)));
            }
            HeapTag::BigInt | HeapTag::Ratio | HeapTag::Foreign => {
                out.push_str(&format!("#{}[]", type_name(v)));
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjVector;
    use crate::seq::list_from;

    fn env() -> std::sync::Arc<Env> {
        Env::new()
    }

    #[test]
    fn scalars_print_readably() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert_eq!(pr_str(&env, Value::NIL).unwrap(), "nil");
        assert_eq!(pr_str(&env, Value::int(42)).unwrap(), "42");
        assert_eq!(pr_str(&env, Value::float(3.0)).unwrap(), "3.0");
        assert_eq!(pr_str(&env, Value::float(2.5)).unwrap(), "2.5");
        assert_eq!(pr_str(&env, Value::char('a')).unwrap(), "\\a");
        assert_eq!(pr_str(&env, env.keyword("k")).unwrap(), ":k");
    }

    #[test]
    fn strings_quoted_only_in_readable_mode() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let s = scope.keep(env.alloc_str("a\"b").unwrap());
        assert_eq!(pr_str(&env, s).unwrap(), "\"a\\\"b\"");
        assert_eq!(pretty_str(&env, s).unwrap(), "a\"b");
    }

    #[test]
    fn collections_print_with_delimiters() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let l = scope.keep(list_from(&env, &[Value::int(1), Value::int(2)]).unwrap());
        assert_eq!(pr_str(&env, l).unwrap(), "(1 2)");
        let v = scope.keep(env.alloc(ObjVector::new(vec![Value::int(1), Value::int(2)])).unwrap());
        assert_eq!(pr_str(&env, v).unwrap(), "[1 2]");
        assert_eq!(pr_str(&env, env.empty_list).unwrap(), "()");
    }

    #[test]
    fn print_length_truncates() {
        let env = env();
        let _m = env.gc.register_mutator();
        let var = env.print_length_var();
        env.bindings.push(vec![(var, Value::int(2))]);
        let scope = env.roots();
        let l = scope
            .keep(list_from(&env, &[Value::int(1), Value::int(2), Value::int(3)]).unwrap());
        assert_eq!(pr_str(&env, l).unwrap(), "(1 2 ...)");
        env.bindings.pop().unwrap();
    }

    #[test]
    fn print_level_truncates_depth() {
        let env = env();
        let _m = env.gc.register_mutator();
        let var = env.print_level_var();
        let scope = env.roots();
        let inner = scope.keep(list_from(&env, &[Value::int(1)]).unwrap());
        let outer = scope.keep(list_from(&env, &[inner]).unwrap());
        env.bindings.push(vec![(var, Value::int(1))]);
        assert_eq!(pr_str(&env, outer).unwrap(), "(...)");
        env.bindings.pop().unwrap();
        assert_eq!(pr_str(&env, outer).unwrap(), "((1))");
    }
}
