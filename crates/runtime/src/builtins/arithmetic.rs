//! Arithmetic, comparison, and bit-operation builtins.
//!
//! Variadic arithmetic folds left over the binary kernels in `arith`;
//! `(+)` is 0, `(*)` is 1, `(-)` and `(/)` with no arguments are arity
//! errors. The primed variants (`+'` etc.) share the promoting kernels:
//! overflow promotes rather than wraps either way.

use super::{Registrar, exact_arity, min_arity};
use crate::arith;
use crate::env::Env;
use crate::eq::equiv;
use crate::error;
use crate::value::{Tag, Value};

pub(super) fn register(reg: &mut Registrar<'_>) {
    reg.def("+", add);
    reg.def("+'", add);
    reg.def("-", sub);
    reg.def("-'", sub);
    reg.def("*", mul);
    reg.def("*'", mul);
    reg.def("/", div);
    reg.def("quot", quot);
    reg.def("rem", rem);
    reg.def("mod", modulo);
    reg.def("inc", inc);
    reg.def("dec", dec);
    reg.def("min", min);
    reg.def("max", max);
    reg.def("abs", abs);
    reg.def("=", eq);
    reg.def("not=", neq);
    reg.def("==", eq);
    reg.def("<", lt);
    reg.def("<=", le);
    reg.def(">", gt);
    reg.def(">=", ge);
    reg.def("zero?", zero_p);
    reg.def("pos?", pos_p);
    reg.def("neg?", neg_p);
    reg.def("even?", even_p);
    reg.def("odd?", odd_p);
    reg.def("bit-and", bit_and);
    reg.def("bit-or", bit_or);
    reg.def("bit-xor", bit_xor);
    reg.def("bit-not", bit_not);
    reg.def("bit-shift-left", bit_shift_left);
    reg.def("bit-shift-right", bit_shift_right);
    reg.def("compare", compare);
}

fn require_number(env: &Env, v: Value) -> Result<Value, Value> {
    if v.is_number() { Ok(v) } else { Err(error::type_error(env, "number", v)) }
}

fn add(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [] => Ok(Value::int(0)),
        [x] => require_number(env, *x),
        _ => {
            let mut acc = args[0];
            for v in &args[1..] {
                acc = arith::add(env, acc, *v)?;
            }
            Ok(acc)
        }
    }
}

fn sub(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [] => Err(error::arity_error(env, "-", 0)),
        [x] => arith::negate(env, *x),
        _ => {
            let mut acc = args[0];
            for v in &args[1..] {
                acc = arith::sub(env, acc, *v)?;
            }
            Ok(acc)
        }
    }
}

fn mul(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [] => Ok(Value::int(1)),
        [x] => require_number(env, *x),
        _ => {
            let mut acc = args[0];
            for v in &args[1..] {
                acc = arith::mul(env, acc, *v)?;
            }
            Ok(acc)
        }
    }
}

fn div(env: &Env, args: &[Value]) -> Result<Value, Value> {
    match args {
        [] => Err(error::arity_error(env, "/", 0)),
        [x] => arith::div(env, Value::int(1), *x),
        _ => {
            let mut acc = args[0];
            for v in &args[1..] {
                acc = arith::div(env, acc, *v)?;
            }
            Ok(acc)
        }
    }
}

fn quot(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "quot", args, 2)?;
    arith::quot(env, args[0], args[1])
}

fn rem(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "rem", args, 2)?;
    arith::remainder(env, args[0], args[1])
}

fn modulo(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "mod", args, 2)?;
    arith::modulo(env, args[0], args[1])
}

fn inc(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "inc", args, 1)?;
    arith::add(env, args[0], Value::int(1))
}

fn dec(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "dec", args, 1)?;
    arith::sub(env, args[0], Value::int(1))
}

fn min(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "min", args, 1)?;
    let mut acc = require_number(env, args[0])?;
    for v in &args[1..] {
        if arith::compare(env, *v, acc)? == std::cmp::Ordering::Less {
            acc = *v;
        }
    }
    Ok(acc)
}

fn max(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "max", args, 1)?;
    let mut acc = require_number(env, args[0])?;
    for v in &args[1..] {
        if arith::compare(env, *v, acc)? == std::cmp::Ordering::Greater {
            acc = *v;
        }
    }
    Ok(acc)
}

fn abs(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "abs", args, 1)?;
    match args[0].tag() {
        Tag::Int => Ok(Value::from_i64(args[0].as_i64().abs())),
        Tag::Float => Ok(Value::float(args[0].as_f64().abs())),
        _ => Err(error::type_error(env, "number", args[0])),
    }
}

fn eq(env: &Env, args: &[Value]) -> Result<Value, Value> {
    min_arity(env, "=", args, 1)?;
    for pair in args.windows(2) {
        if !equiv(env, pair[0], pair[1])? {
            return Ok(Value::FALSE);
        }
    }
    Ok(Value::TRUE)
}

fn neq(env: &Env, args: &[Value]) -> Result<Value, Value> {
    Ok(Value::bool(!eq(env, args)?.is_truthy()))
}

fn chain_compare(
    env: &Env,
    args: &[Value],
    accept: fn(std::cmp::Ordering) -> bool,
) -> Result<Value, Value> {
    min_arity(env, "comparison", args, 1)?;
    for pair in args.windows(2) {
        if !accept(arith::compare(env, pair[0], pair[1])?) {
            return Ok(Value::FALSE);
        }
    }
    Ok(Value::TRUE)
}

fn lt(env: &Env, args: &[Value]) -> Result<Value, Value> {
    chain_compare(env, args, |o| o == std::cmp::Ordering::Less)
}

fn le(env: &Env, args: &[Value]) -> Result<Value, Value> {
    chain_compare(env, args, |o| o != std::cmp::Ordering::Greater)
}

fn gt(env: &Env, args: &[Value]) -> Result<Value, Value> {
    chain_compare(env, args, |o| o == std::cmp::Ordering::Greater)
}

fn ge(env: &Env, args: &[Value]) -> Result<Value, Value> {
    chain_compare(env, args, |o| o != std::cmp::Ordering::Less)
}

fn zero_p(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "zero?", args, 1)?;
    Ok(Value::bool(equiv(env, args[0], Value::int(0))?))
}

fn pos_p(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "pos?", args, 1)?;
    Ok(Value::bool(arith::compare(env, args[0], Value::int(0))? == std::cmp::Ordering::Greater))
}

fn neg_p(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "neg?", args, 1)?;
    Ok(Value::bool(arith::compare(env, args[0], Value::int(0))? == std::cmp::Ordering::Less))
}

fn even_p(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "even?", args, 1)?;
    let n = super::int_arg(env, "even?", args[0])?;
    Ok(Value::bool(n % 2 == 0))
}

fn odd_p(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "odd?", args, 1)?;
    let n = super::int_arg(env, "odd?", args[0])?;
    Ok(Value::bool(n % 2 != 0))
}

fn bit_and(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "bit-and", args, 2)?;
    arith::bit_and(env, args[0], args[1])
}

fn bit_or(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "bit-or", args, 2)?;
    arith::bit_or(env, args[0], args[1])
}

fn bit_xor(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "bit-xor", args, 2)?;
    arith::bit_xor(env, args[0], args[1])
}

fn bit_not(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "bit-not", args, 1)?;
    arith::bit_not(env, args[0])
}

fn bit_shift_left(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "bit-shift-left", args, 2)?;
    arith::bit_shift_left(env, args[0], args[1])
}

fn bit_shift_right(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "bit-shift-right", args, 2)?;
    arith::bit_shift_right(env, args[0], args[1])
}

fn compare(env: &Env, args: &[Value]) -> Result<Value, Value> {
    exact_arity(env, "compare", args, 2)?;
    let ord = super::misc::compare_values(env, args[0], args[1])?;
    Ok(Value::int(match ord {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        Env::new()
    }

    #[test]
    fn variadic_identities() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert_eq!(add(&env, &[]).unwrap().as_i64(), 0);
        assert_eq!(mul(&env, &[]).unwrap().as_i64(), 1);
        assert!(sub(&env, &[]).is_err());
        assert_eq!(sub(&env, &[Value::int(5)]).unwrap().as_i64(), -5);
    }

    #[test]
    fn mixed_addition_produces_float() {
        let env = env();
        let _m = env.gc.register_mutator();
        let r = add(&env, &[Value::float(1.0), Value::int(2)]).unwrap();
        assert!(r.is_float());
        assert_eq!(r.as_f64(), 3.0);
    }

    #[test]
    fn comparison_chains() {
        let env = env();
        let _m = env.gc.register_mutator();
        let t = lt(&env, &[Value::int(1), Value::int(2), Value::int(3)]).unwrap();
        assert!(t.is_truthy());
        let f = lt(&env, &[Value::int(1), Value::int(3), Value::int(2)]).unwrap();
        assert!(!f.is_truthy());
    }

    #[test]
    fn single_arg_plus_type_checks() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert!(add(&env, &[Value::NIL]).is_err());
        assert_eq!(add(&env, &[Value::int(7)]).unwrap().as_i64(), 7);
    }
}
