//! Numeric Operations
//!
//! Shared slow path behind the VM's arithmetic opcodes and the arithmetic
//! builtins. Integer results that overflow the 48-bit payload promote to
//! float; `i64` overflow during the computation itself promotes the same
//! way. `/` keeps evenly divisible integers integral and produces a float
//! otherwise (ratios are out of scope), while `quot` is always truncating
//! integer division. Shift amounts are masked modulo 64.

use crate::env::Env;
use crate::error::{self, ErrorKind};
use crate::value::{Tag, Value};

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

fn num(env: &Env, v: Value) -> Result<Num, Value> {
    match v.tag() {
        Tag::Int => Ok(Num::Int(v.as_i64())),
        Tag::Float => Ok(Num::Float(v.as_f64())),
        _ => Err(error::type_error(env, "number", v)),
    }
}

pub fn add(env: &Env, a: Value, b: Value) -> Result<Value, Value> {
    Ok(match (num(env, a)?, num(env, b)?) {
        (Num::Int(x), Num::Int(y)) => match x.checked_add(y) {
            Some(n) => Value::from_i64(n),
            None => Value::float(x as f64 + y as f64),
        },
        (x, y) => Value::float(as_f64(x) + as_f64(y)),
    })
}

pub fn sub(env: &Env, a: Value, b: Value) -> Result<Value, Value> {
    Ok(match (num(env, a)?, num(env, b)?) {
        (Num::Int(x), Num::Int(y)) => match x.checked_sub(y) {
            Some(n) => Value::from_i64(n),
            None => Value::float(x as f64 - y as f64),
        },
        (x, y) => Value::float(as_f64(x) - as_f64(y)),
    })
}

pub fn mul(env: &Env, a: Value, b: Value) -> Result<Value, Value> {
    Ok(match (num(env, a)?, num(env, b)?) {
        (Num::Int(x), Num::Int(y)) => match x.checked_mul(y) {
            Some(n) => Value::from_i64(n),
            None => Value::float(x as f64 * y as f64),
        },
        (x, y) => Value::float(as_f64(x) * as_f64(y)),
    })
}

pub fn div(env: &Env, a: Value, b: Value) -> Result<Value, Value> {
    Ok(match (num(env, a)?, num(env, b)?) {
        (Num::Int(x), Num::Int(y)) => {
            if y == 0 {
                return Err(error::raise(env, ErrorKind::Arithmetic, "Divide by zero"));
            }
            if x % y == 0 { Value::from_i64(x / y) } else { Value::float(x as f64 / y as f64) }
        }
        (x, y) => Value::float(as_f64(x) / as_f64(y)),
    })
}

/// Truncating integer division (toward zero).
pub fn quot(env: &Env, a: Value, b: Value) -> Result<Value, Value> {
    Ok(match (num(env, a)?, num(env, b)?) {
        (Num::Int(x), Num::Int(y)) => {
            if y == 0 {
                return Err(error::raise(env, ErrorKind::Arithmetic, "Divide by zero"));
            }
            Value::from_i64(x.wrapping_div(y))
        }
        (x, y) => Value::float((as_f64(x) / as_f64(y)).trunc()),
    })
}

/// Floor-mod: result has the divisor's sign.
pub fn modulo(env: &Env, a: Value, b: Value) -> Result<Value, Value> {
    Ok(match (num(env, a)?, num(env, b)?) {
        (Num::Int(x), Num::Int(y)) => {
            if y == 0 {
                return Err(error::raise(env, ErrorKind::Arithmetic, "Divide by zero"));
            }
            let r = x % y;
            Value::from_i64(if r != 0 && (r < 0) != (y < 0) { r + y } else { r })
        }
        (x, y) => {
            let (x, y) = (as_f64(x), as_f64(y));
            let r = x % y;
            Value::float(if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r })
        }
    })
}

/// Truncating remainder: result has the dividend's sign.
pub fn remainder(env: &Env, a: Value, b: Value) -> Result<Value, Value> {
    Ok(match (num(env, a)?, num(env, b)?) {
        (Num::Int(x), Num::Int(y)) => {
            if y == 0 {
                return Err(error::raise(env, ErrorKind::Arithmetic, "Divide by zero"));
            }
            Value::from_i64(x % y)
        }
        (x, y) => Value::float(as_f64(x) % as_f64(y)),
    })
}

pub fn negate(env: &Env, a: Value) -> Result<Value, Value> {
    Ok(match num(env, a)? {
        Num::Int(x) => Value::from_i64(-x),
        Num::Float(x) => Value::float(-x),
    })
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::Int(x) => x as f64,
        Num::Float(x) => x,
    }
}

/// Numeric comparison for `< <= > >=`. Non-numbers are a type error.
pub fn compare(env: &Env, a: Value, b: Value) -> Result<std::cmp::Ordering, Value> {
    let (x, y) = (num(env, a)?, num(env, b)?);
    if let (Num::Int(x), Num::Int(y)) = (x, y) {
        return Ok(x.cmp(&y));
    }
    let (x, y) = (as_f64(x), as_f64(y));
    x.partial_cmp(&y)
        .ok_or_else(|| error::raise(env, ErrorKind::Arithmetic, "cannot order NaN"))
}

// =============================================================================
// Bit operations (integer-only)
// =============================================================================

fn int_arg(env: &Env, v: Value) -> Result<i64, Value> {
    if v.is_int() { Ok(v.as_i64()) } else { Err(error::type_error(env, "integer", v)) }
}

pub fn bit_and(env: &Env, a: Value, b: Value) -> Result<Value, Value> {
    Ok(Value::from_i64(int_arg(env, a)? & int_arg(env, b)?))
}

pub fn bit_or(env: &Env, a: Value, b: Value) -> Result<Value, Value> {
    Ok(Value::from_i64(int_arg(env, a)? | int_arg(env, b)?))
}

pub fn bit_xor(env: &Env, a: Value, b: Value) -> Result<Value, Value> {
    Ok(Value::from_i64(int_arg(env, a)? ^ int_arg(env, b)?))
}

pub fn bit_not(env: &Env, a: Value) -> Result<Value, Value> {
    Ok(Value::from_i64(!int_arg(env, a)?))
}

/// Shift amount is masked modulo 64, so `(bit-shift-left 1 64)` is 1.
pub fn bit_shift_left(env: &Env, a: Value, n: Value) -> Result<Value, Value> {
    let shift = (int_arg(env, n)? as u64 & 63) as u32;
    Ok(Value::from_i64(int_arg(env, a)?.wrapping_shl(shift)))
}

pub fn bit_shift_right(env: &Env, a: Value, n: Value) -> Result<Value, Value> {
    let shift = (int_arg(env, n)? as u64 & 63) as u32;
    Ok(Value::from_i64(int_arg(env, a)?.wrapping_shr(shift)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> std::sync::Arc<Env> {
        Env::new()
    }

    #[test]
    fn int_add_and_float_contagion() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert_eq!(add(&env, Value::int(1), Value::int(2)).unwrap().as_i64(), 3);
        let f = add(&env, Value::float(1.0), Value::int(2)).unwrap();
        assert!(f.is_float());
        assert_eq!(f.as_f64(), 3.0);
    }

    #[test]
    fn overflow_promotes_to_float() {
        let env = env();
        let _m = env.gc.register_mutator();
        let big = Value::int(1i64 << 40);
        let product = mul(&env, big, big).unwrap();
        assert!(product.is_float(), "2^80 cannot stay integral");
        assert_eq!(product.as_f64(), (1i64 << 40) as f64 * (1i64 << 40) as f64);
    }

    #[test]
    fn division_semantics() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert_eq!(div(&env, Value::int(6), Value::int(3)).unwrap().as_i64(), 2);
        let half = div(&env, Value::int(1), Value::int(2)).unwrap();
        assert!(half.is_float());
        assert_eq!(half.as_f64(), 0.5);
        assert!(div(&env, Value::int(1), Value::int(0)).is_err());
    }

    #[test]
    fn mod_and_rem_signs() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert_eq!(modulo(&env, Value::int(-7), Value::int(3)).unwrap().as_i64(), 2);
        assert_eq!(remainder(&env, Value::int(-7), Value::int(3)).unwrap().as_i64(), -1);
        assert_eq!(modulo(&env, Value::int(7), Value::int(3)).unwrap().as_i64(), 1);
    }

    #[test]
    fn shift_amount_masked() {
        let env = env();
        let _m = env.gc.register_mutator();
        assert_eq!(
            bit_shift_left(&env, Value::int(1), Value::int(64)).unwrap().as_i64(),
            1,
            "shift of 64 masks to 0"
        );
        assert_eq!(bit_shift_left(&env, Value::int(1), Value::int(4)).unwrap().as_i64(), 16);
    }

    #[test]
    fn comparison_bridges_numeric_kinds() {
        let env = env();
        let _m = env.gc.register_mutator();
        use std::cmp::Ordering;
        assert_eq!(compare(&env, Value::int(1), Value::float(1.5)).unwrap(), Ordering::Less);
        assert_eq!(compare(&env, Value::int(2), Value::int(2)).unwrap(), Ordering::Equal);
        assert!(compare(&env, Value::int(1), Value::NIL).is_err());
    }
}
