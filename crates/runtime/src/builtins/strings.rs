//! String, symbol, and keyword builtins.

use super::{Registrar, exact_arity, min_arity, str_arg};
use crate::env::Env;
use crate::error::{self, ErrorKind};
use crate::heap::{ObjKeyword, ObjRegex, ObjStr, ObjSymbol, ObjVector};
use crate::printer;
use crate::seq;
use crate::value::{HeapTag, Value};

pub(super) fn register(reg: &mut Registrar<'_>) {
    reg.def("str", str_fn);
    reg.def("pr-str", pr_str_fn);
    reg.def("print-str", print_str_fn);
    reg.def("subs", subs);
    reg.def("upper-case", upper_case);
    reg.def("lower-case", lower_case);
    reg.def("trim", trim);
    reg.def("split", split);
    reg.def("join", join);
    reg.def("name", name);
    reg.def("namespace", namespace);
    reg.def("keyword", keyword);
    reg.def("symbol", symbol);
    reg.def("gensym", gensym);
    reg.def("re-pattern", re_pattern);
    reg.def("re-find", re_find);
    reg.def("re-matches", re_matches);
}

fn str_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    let mut out = String::new();
    for v in args {
        if !v.is_nil() {
            out.push_str(&printer::pretty_str(env, *v)?);
        }
    }
    env.alloc_str(out)
}

fn pr_str_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    let mut parts = Vec::with_capacity(args.len());
    for v in args {
        parts.push(printer::pr_str(env, *v)?);
    }
    env.alloc_str(parts.join(" "))
}

fn print_str_fn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    let mut parts = Vec::with_capacity(args.len());
    for v in args {
        parts.push(printer::pretty_str(env, *v)?);
    }
    env.alloc_str(parts.join(" "))
}

fn subs(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "subs", args, 2)?;
    let s = str_arg(env, "subs", args[0])?;
    let chars: Vec<char> = s.chars().collect();
    let start = super::int_arg(env, "subs", args[1])? as usize;
    let end = match args.get(2) {
        Some(v) => super::int_arg(env, "subs", *v)? as usize,
        None => chars.len(),
    };
    if start > end || end > chars.len() {
        return Err(error::raise(
            env,
            ErrorKind::Index,
            format!("subs range {start}..{end} out of bounds for string of {}", chars.len()),
        ));
    }
    env.alloc_str(chars[start..end].iter().collect::<String>())
}

fn upper_case(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "upper-case", args, 1)?;
    env.alloc_str(str_arg(env, "upper-case", args[0])?.to_uppercase())
}

fn lower_case(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "lower-case", args, 1)?;
    env.alloc_str(str_arg(env, "lower-case", args[0])?.to_lowercase())
}

fn trim(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "trim", args, 1)?;
    env.alloc_str(str_arg(env, "trim", args[0])?.trim().to_string())
}

fn split(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "split", args, 2)?;
    let s = str_arg(env, "split", args[0])?;
    let scope = env.roots();
    let parts: Vec<&str> = match args[1].heap_tag() {
        Some(HeapTag::Regex) => ObjRegex::of(args[1]).compiled.split(s).collect(),
        Some(HeapTag::Str) => s.split(&*ObjStr::of(args[1]).data).collect(),
        _ => return Err(error::type_error(env, "string or regex", args[1])),
    };
    let mut items = Vec::with_capacity(parts.len());
    for part in parts {
        items.push(scope.keep(env.alloc_str(part.to_string())?));
    }
    env.alloc(ObjVector::new(items))
}

fn join(env: &Env, args: &[Value]) -> Result<Value, Value> {
    let (sep, coll) = match args {
        [coll] => (String::new(), *coll),
        [sep, coll] => (str_arg(env, "join", *sep)?.to_string(), *coll),
        _ => return Err(error::arity_error(env, "join", args.len())),
    };
    let scope = env.roots();
    let items = seq::to_vec(env, &scope, coll)?;
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.push(printer::pretty_str(env, item)?);
    }
    env.alloc_str(parts.join(&sep))
}

fn name(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "name", args, 1)?;
    let n: &str = match args[0].heap_tag() {
        Some(HeapTag::Str) => &ObjStr::of(args[0]).data,
        Some(HeapTag::Symbol) => &ObjSymbol::of(args[0]).name,
        Some(HeapTag::Keyword) => &ObjKeyword::of(args[0]).name,
        _ => return Err(error::type_error(env, "string, symbol, or keyword", args[0])),
    };
    env.alloc_str(n.to_string())
}

fn namespace(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "namespace", args, 1)?;
    let ns = match args[0].heap_tag() {
        Some(HeapTag::Symbol) => ObjSymbol::of(args[0]).ns.as_deref(),
        Some(HeapTag::Keyword) => ObjKeyword::of(args[0]).ns.as_deref(),
        _ => return Err(error::type_error(env, "symbol or keyword", args[0])),
    };
    match ns {
        Some(ns) => env.alloc_str(ns.to_string()),
        None => Ok(Value::NIL),
    }
}

fn keyword(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [v] => match v.heap_tag() {
            Some(HeapTag::Keyword) => Ok(*v),
            Some(HeapTag::Str) => Ok(env.interned.keyword_from(&ObjStr::of(*v).data)),
            Some(HeapTag::Symbol) => {
                let s = ObjSymbol::of(*v);
                Ok(env.interned.keyword(s.ns.as_deref(), &s.name))
            }
            _ => Err(error::type_error(env, "string, symbol, or keyword", *v)),
        },
        [ns, n] => {
            let ns = str_arg(env, "keyword", *ns)?;
            let n = str_arg(env, "keyword", *n)?;
            Ok(env.interned.keyword(Some(ns), n))
        }
        _ => Err(error::arity_error(env, "keyword", args.len())),
    }
}

fn symbol(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [v] => match v.heap_tag() {
            Some(HeapTag::Symbol) => Ok(*v),
            Some(HeapTag::Str) => Ok(env.interned.symbol_from(&ObjStr::of(*v).data)),
            _ => Err(error::type_error(env, "string or symbol", *v)),
        },
        [ns, n] => {
            let ns = str_arg(env, "symbol", *ns)?;
            let n = str_arg(env, "symbol", *n)?;
            Ok(env.interned.symbol(Some(ns), n))
        }
        _ => Err(error::arity_error(env, "symbol", args.len())),
    }
}

fn gensym(env: &Env, args: &[Value]) -> Result<Value, Value> {
    use std::sync::atomic::{AtomicU64, Ordering};
    // Process-global counter; uniqueness only has to hold within a process.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let prefix = match args {
        [] => "G__",
        [p] => str_arg(env, "gensym", *p)?,
        _ => return Err(error::arity_error(env, "gensym", args.len())),
    };
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(env.interned.symbol(None, &format!("{prefix}{n}")))
}

fn re_pattern(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "re-pattern", args, 1)?;
    let src = str_arg(env, "re-pattern", args[0])?;
    let compiled = regex::Regex::new(src).map_err(|e| {
        error::raise(env, ErrorKind::Value, format!("invalid regex pattern: {e}"))
    })?;
    env.alloc(ObjRegex {
        hdr: crate::heap::ObjHeader::new(HeapTag::Regex),
        source: src.into(),
        compiled,
    })
}

fn regex_arg<'a>(env: &Env, name: &str, v: Value) -> Result<&'a regex::Regex, Value> {
    match v.heap_tag() {
        Some(HeapTag::Regex) => Ok(&ObjRegex::of(v).compiled),
        _ => Err(error::raise(
            env,
            ErrorKind::Type,
            format!("{name} expects a regex, got {}", printer::type_name(v)),
        )),
    }
}

/// Match result: the whole match for group-free patterns, otherwise a
/// vector of the match and each group (nil for unmatched groups).
fn match_value(env: &Env, caps: regex::Captures<'_>) -> Result<Value, Value> {
    if caps.len() == 1 {
        return env.alloc_str(caps[0].to_string());
    }
    let scope = env.roots();
    let mut items = Vec::with_capacity(caps.len());
    for group in caps.iter() {
        items.push(match group {
            Some(m) => scope.keep(env.alloc_str(m.as_str().to_string())?),
            None => Value::NIL,
        });
    }
    env.alloc(ObjVector::new(items))
}

fn re_find(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "re-find", args, 2)?;
    let re = regex_arg(env, "re-find", args[0])?;
    let s = str_arg(env, "re-find", args[1])?;
    match re.captures(s) {
        Some(caps) => match_value(env, caps),
        None => Ok(Value::NIL),
    }
}

fn re_matches(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "re-matches", args, 2)?;
    let re = regex_arg(env, "re-matches", args[0])?;
    let s = str_arg(env, "re-matches", args[1])?;
    match re.captures(s) {
        Some(caps)
            if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) =>
        {
            match_value(env, caps)
        }
        _ => Ok(Value::NIL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        crate::builtins::test_env()
    }

    #[test]
    fn str_concatenates_pretty() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let s = scope.keep(env.alloc_str("x=").unwrap());
        let out = str_fn(&env, &[s, Value::int(3), Value::NIL]).unwrap();
        assert_eq!(&*ObjStr::of(out).data, "x=3");
    }

    #[test]
    fn keyword_and_symbol_coercions() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let s = scope.keep(env.alloc_str("a/b").unwrap());
        let k = keyword(&env, &[s]).unwrap();
        assert_eq!(crate::printer::pr_str(&env, k).unwrap(), ":a/b");
        let sym = symbol(&env, &[s]).unwrap();
        assert_eq!(crate::printer::pr_str(&env, sym).unwrap(), "a/b");
    }

    #[test]
    fn regex_find_and_matches() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let pat = scope.keep(env.alloc_str(r"\d+").unwrap());
        let re = scope.keep(re_pattern(&env, &[pat]).unwrap());
        let hay = scope.keep(env.alloc_str("abc 123 def").unwrap());
        let found = re_find(&env, &[re, hay]).unwrap();
        assert_eq!(&*ObjStr::of(found).data, "123");
        assert!(re_matches(&env, &[re, hay]).unwrap().is_nil());
        let exact = scope.keep(env.alloc_str("123").unwrap());
        let matched = re_matches(&env, &[re, exact]).unwrap();
        assert_eq!(&*ObjStr::of(matched).data, "123");
    }

    #[test]
    fn gensym_is_unique() {
        let env = env();
        let _m = env.gc.register_mutator();
        let a = gensym(&env, &[]).unwrap();
        let b = gensym(&env, &[]).unwrap();
        assert!(!a.identical(b));
    }
}
