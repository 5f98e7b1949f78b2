//! I/O builtins. All printing goes through the environment's output-capture
//! stack; file errors surface as io-error exceptions.

use super::{Registrar, exact_arity, str_arg};
use crate::bridge;
use crate::env::Env;
use crate::error::{self, ErrorKind};
use crate::printer;
use crate::value::Value;

pub(super) fn register(reg: &mut Registrar<'_>) {
    reg.def("print", print);
    reg.def("println", println);
    reg.def("pr", pr);
    reg.def("prn", prn);
    reg.def("newline", newline);
    reg.def("flush", flush);
    reg.def("slurp", slurp);
    reg.def("spit", spit);
    reg.def("read-line", read_line);
    reg.def("with-out-str*", with_out_str_star);
}

fn write_all(env: &Env, args: &[Value], readable: bool) -> Result<(), Value> {
    for (i, v) in args.iter().enumerate() {
        if i > 0 {
            env.output.write(" ");
        }
        let text = if readable {
            printer::pr_str(env, *v)?
        } else {
            printer::pretty_str(env, *v)?
        };
        env.output.write(&text);
    }
    Ok(())
}

fn print(env: &Env, args: &[Value]) -> Result<Value, Value> {
    write_all(env, args, false)?;
    Ok(Value::NIL)
}

fn println(env: &Env, args: &[Value]) -> Result<Value, Value> {
    write_all(env, args, false)?;
    env.output.write("\n");
    Ok(Value::NIL)
}

fn pr(env: &Env, args: &[Value]) -> Result<Value, Value> {
    write_all(env, args, true)?;
    Ok(Value::NIL)
}

fn prn(env: &Env, args: &[Value]) -> Result<Value, Value> {
    write_all(env, args, true)?;
    env.output.write("\n");
    Ok(Value::NIL)
}

fn newline(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "newline", args, 0)?;
    env.output.write("\n");
    Ok(Value::NIL)
}

fn flush(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "flush", args, 0)?;
    env.output.flush();
    Ok(Value::NIL)
}

fn slurp(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "slurp", args, 1)?;
    let path = str_arg(env, "slurp", args[0])?;
    let contents = env.gc.blocking_region(|| std::fs::read_to_string(path));
    match contents {
        Ok(text) => env.alloc_str(text),
        Err(e) => Err(error::raise(env, ErrorKind::Io, format!("slurp {path}: {e}"))),
    }
}

fn spit(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "spit", args, 2)?;
    let path = str_arg(env, "spit", args[0])?;
    let text = printer::pretty_str(env, args[1])?;
    let outcome = env.gc.blocking_region(|| std::fs::write(path, text));
    match outcome {
        Ok(()) => Ok(Value::NIL),
        Err(e) => Err(error::raise(env, ErrorKind::Io, format!("spit {path}: {e}"))),
    }
}

fn read_line(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "read-line", args, 0)?;
    let mut line = String::new();
    let read = env.gc.blocking_region(|| std::io::BufRead::read_line(
        &mut std::io::stdin().lock(),
        &mut line,
    ));
    match read {
        Ok(0) => Ok(Value::NIL),
        Ok(_) => {
            if line.ends_with('\n') {
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
            }
            env.alloc_str(line)
        }
        Err(e) => Err(error::raise(env, ErrorKind::Io, format!("read-line: {e}"))),
    }
}

/// `(with-out-str* thunk)`: capture everything the thunk prints.
fn with_out_str_star(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "with-out-str*", args, 1)?;
    env.output.push_capture();
    let outcome = bridge::call_fn(env, args[0], &[]);
    let captured = env.output.pop_capture().unwrap_or_default();
    outcome?;
    env.alloc_str(captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjStr;

    fn env() -> std::sync::Arc<Env> {
        crate::builtins::test_env()
    }

    #[test]
    fn println_writes_to_capture_stack() {
        let env = env();
        let _m = env.gc.register_mutator();
        env.output.push_capture();
        println(&env, &[Value::int(1), Value::int(2)]).unwrap();
        assert_eq!(env.output.pop_capture().as_deref(), Some("1 2\n"));
    }

    #[test]
    fn print_vs_pr_string_quoting() {
        let env = env();
        let _m = env.gc.register_mutator();
        let scope = env.roots();
        let s = scope.keep(env.alloc_str("hi").unwrap());
        env.output.push_capture();
        print(&env, &[s]).unwrap();
        assert_eq!(env.output.pop_capture().as_deref(), Some("hi"));
        env.output.push_capture();
        pr(&env, &[s]).unwrap();
        assert_eq!(env.output.pop_capture().as_deref(), Some("\"hi\""));
    }

    #[test]
    fn slurp_spit_roundtrip() {
        let env = env();
        let _m = env.gc.register_mutator();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        let scope = env.roots();
        let path_v = scope.keep(env.alloc_str(path.to_string_lossy().to_string()).unwrap());
        let body = scope.keep(env.alloc_str("hello file").unwrap());
        spit(&env, &[path_v, body]).unwrap();
        let back = slurp(&env, &[path_v]).unwrap();
        assert_eq!(&*ObjStr::of(back).data, "hello file");
        // Missing file is an io-error.
        let missing = scope.keep(env.alloc_str("/no/such/lyra/file").unwrap());
        assert!(slurp(&env, &[missing]).is_err());
    }
}
