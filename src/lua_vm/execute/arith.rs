// Arithmetic, comparison and length with Lua 5.3 coercion rules.
//
// Binary arithmetic: exact-integer operands (including integer-parseable
// strings) take the wrapping integer path; otherwise number-coercible
// operands take the float path; otherwise the matching tag method; otherwise
// an arithmetic type error naming the offending operand. `/` and `^` are
// always float. Bitwise ops demand operands with an exact integer
// representation.

use crate::lua_value::{LuaValue, float_to_integer};
use crate::lua_vm::execute::TmKind;
use crate::lua_vm::{LuaResult, LuaVM};
use crate::strconv;

// ============ Coercions ============

/// Number coercion: numbers, or strings parseable as numbers.
pub fn to_number(vm: &LuaVM, v: &LuaValue) -> Option<f64> {
    match v {
        LuaValue::Integer(i) => Some(*i as f64),
        LuaValue::Float(f) => Some(*f),
        LuaValue::String(id) => {
            let s = vm.pool.string(*id).as_str()?;
            strconv::parse_integer(s)
                .map(|i| i as f64)
                .or_else(|| strconv::parse_number(s))
        }
        _ => None,
    }
}

/// Exact integer coercion: integers, exact floats, or strings parseable as
/// such.
pub fn to_integer(vm: &LuaVM, v: &LuaValue) -> Option<i64> {
    match v {
        LuaValue::Integer(i) => Some(*i),
        LuaValue::Float(f) => float_to_integer(*f),
        LuaValue::String(id) => {
            let s = vm.pool.string(*id).as_str()?;
            strconv::parse_integer(s)
                .or_else(|| strconv::parse_number(s).and_then(float_to_integer))
        }
        _ => None,
    }
}

/// The integer fast path of arithmetic: integers and strings that
/// parse as integers. Floats are excluded even when exact.
fn to_arith_integer(vm: &LuaVM, v: &LuaValue) -> Option<i64> {
    match v {
        LuaValue::Integer(i) => Some(*i),
        LuaValue::String(id) => strconv::parse_integer(vm.pool.string(*id).as_str()?),
        _ => None,
    }
}

// ============ Integer kernels ============

#[inline]
fn lua_idiv(a: i64, b: i64) -> i64 {
    // b == -1 would overflow MIN / -1; wraps to -a like the C implementation.
    if b == -1 {
        return a.wrapping_neg();
    }
    let q = a.wrapping_div(b);
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

#[inline]
fn lua_imod(a: i64, b: i64) -> i64 {
    if b == -1 {
        return 0;
    }
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

#[inline]
fn lua_fmod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

#[inline]
fn lua_shl(a: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((a as u64) << n) as i64
    } else {
        ((a as u64) >> -n) as i64
    }
}

// ============ Binary arithmetic ============

macro_rules! int_first_binop {
    ($name:ident, $tm:expr, $int:expr, $flt:expr) => {
        pub fn $name(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
            if let (Some(x), Some(y)) = (to_arith_integer(vm, &a), to_arith_integer(vm, &b)) {
                return ($int)(vm, x, y);
            }
            if let (Some(x), Some(y)) = (to_number(vm, &a), to_number(vm, &b)) {
                return Ok(LuaValue::float(($flt)(x, y)));
            }
            try_binary_tm(vm, a, b, $tm)
        }
    };
}

int_first_binop!(
    call_add,
    TmKind::Add,
    |_vm, x: i64, y: i64| Ok(LuaValue::integer(x.wrapping_add(y))),
    |x: f64, y: f64| x + y
);

int_first_binop!(
    call_sub,
    TmKind::Sub,
    |_vm, x: i64, y: i64| Ok(LuaValue::integer(x.wrapping_sub(y))),
    |x: f64, y: f64| x - y
);

int_first_binop!(
    call_mul,
    TmKind::Mul,
    |_vm, x: i64, y: i64| Ok(LuaValue::integer(x.wrapping_mul(y))),
    |x: f64, y: f64| x * y
);

int_first_binop!(
    call_idiv,
    TmKind::IDiv,
    |vm: &mut LuaVM, x: i64, y: i64| {
        if y == 0 {
            Err(vm.error_str("attempt to perform 'n//0'"))
        } else {
            Ok(LuaValue::integer(lua_idiv(x, y)))
        }
    },
    |x: f64, y: f64| (x / y).floor()
);

int_first_binop!(
    call_mod,
    TmKind::Mod,
    |vm: &mut LuaVM, x: i64, y: i64| {
        if y == 0 {
            Err(vm.error_str("attempt to perform 'n%0'"))
        } else {
            Ok(LuaValue::integer(lua_imod(x, y)))
        }
    },
    lua_fmod
);

/// `/` is always float.
pub fn call_div(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
    if let (Some(x), Some(y)) = (to_number(vm, &a), to_number(vm, &b)) {
        return Ok(LuaValue::float(x / y));
    }
    try_binary_tm(vm, a, b, TmKind::Div)
}

/// `^` is always float.
pub fn call_pow(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
    if let (Some(x), Some(y)) = (to_number(vm, &a), to_number(vm, &b)) {
        return Ok(LuaValue::float(x.powf(y)));
    }
    try_binary_tm(vm, a, b, TmKind::Pow)
}

pub fn call_unm(vm: &mut LuaVM, a: LuaValue) -> LuaResult<LuaValue> {
    match a {
        LuaValue::Integer(i) => return Ok(LuaValue::integer(i.wrapping_neg())),
        LuaValue::Float(f) => return Ok(LuaValue::float(-f)),
        _ => {}
    }
    if let Some(x) = to_number(vm, &a) {
        return Ok(LuaValue::float(-x));
    }
    try_unary_tm(vm, a, TmKind::Unm)
}

// ============ Bitwise ============

macro_rules! bitwise_binop {
    ($name:ident, $tm:expr, $op:expr) => {
        pub fn $name(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
            if let (Some(x), Some(y)) = (to_integer(vm, &a), to_integer(vm, &b)) {
                return Ok(LuaValue::integer(($op)(x, y)));
            }
            if vm.get_metamethod(&a, $tm).is_some() || vm.get_metamethod(&b, $tm).is_some() {
                return try_binary_tm(vm, a, b, $tm);
            }
            Err(bitwise_error(vm, &a, &b))
        }
    };
}

bitwise_binop!(call_band, TmKind::BAnd, |x: i64, y: i64| x & y);
bitwise_binop!(call_bor, TmKind::BOr, |x: i64, y: i64| x | y);
bitwise_binop!(call_bxor, TmKind::BXor, |x: i64, y: i64| x ^ y);
bitwise_binop!(call_shl, TmKind::Shl, |x: i64, y: i64| lua_shl(x, y));
bitwise_binop!(call_shr, TmKind::Shr, |x: i64, y: i64| lua_shl(
    x,
    y.wrapping_neg()
));

pub fn call_bnot(vm: &mut LuaVM, a: LuaValue) -> LuaResult<LuaValue> {
    if let Some(x) = to_integer(vm, &a) {
        return Ok(LuaValue::integer(!x));
    }
    if vm.get_metamethod(&a, TmKind::BNot).is_some() {
        return try_unary_tm(vm, a, TmKind::BNot);
    }
    Err(bitwise_error(vm, &a, &a))
}

// ============ Length ============

pub fn call_len(vm: &mut LuaVM, a: LuaValue) -> LuaResult<LuaValue> {
    match a {
        LuaValue::String(id) => Ok(LuaValue::integer(vm.pool.string(id).len() as i64)),
        LuaValue::Table(id) => {
            if let Some(tm) = vm.get_metamethod(&a, TmKind::Len) {
                let r = vm.call_binary_tm(tm, a, a)?;
                return Ok(r);
            }
            Ok(LuaValue::integer(vm.pool.table(id).length()))
        }
        _ => {
            if let Some(tm) = vm.get_metamethod(&a, TmKind::Len) {
                return vm.call_binary_tm(tm, a, a);
            }
            Err(vm.error_str(format!(
                "attempt to get length of a {} value",
                a.type_name()
            )))
        }
    }
}

// ============ Comparison ============

// Exact mixed integer/float ordering; no double rounding at the i64 edges.

fn int_lt_float(i: i64, f: f64) -> bool {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return true;
    }
    if f < -TWO_POW_63 {
        return false;
    }
    let fl = f.floor();
    let fi = fl as i64;
    i < fi || (i == fi && f > fl)
}

fn float_lt_int(f: f64, i: i64) -> bool {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return false;
    }
    if f < -TWO_POW_63 {
        return true;
    }
    let fl = f.floor();
    let fi = fl as i64;
    fi < i
}

fn num_lt(a: &LuaValue, b: &LuaValue) -> bool {
    match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => x < y,
        (LuaValue::Float(x), LuaValue::Float(y)) => x < y,
        (LuaValue::Integer(x), LuaValue::Float(y)) => int_lt_float(*x, *y),
        (LuaValue::Float(x), LuaValue::Integer(y)) => float_lt_int(*x, *y),
        _ => false,
    }
}

fn num_le(a: &LuaValue, b: &LuaValue) -> bool {
    match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => x <= y,
        (LuaValue::Float(x), LuaValue::Float(y)) => x <= y,
        (LuaValue::Integer(x), LuaValue::Float(y)) => {
            !y.is_nan() && !float_lt_int(*y, *x)
        }
        (LuaValue::Float(x), LuaValue::Integer(y)) => {
            !x.is_nan() && !int_lt_float(*y, *x)
        }
        _ => false,
    }
}

/// `a < b`: numbers, strings, or `__lt`.
pub fn call_less_than(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    if a.is_number() && b.is_number() {
        return Ok(num_lt(&a, &b));
    }
    if let (LuaValue::String(x), LuaValue::String(y)) = (&a, &b) {
        return Ok(vm.pool.string(*x).as_bytes() < vm.pool.string(*y).as_bytes());
    }
    if let Some(tm) = vm
        .get_metamethod(&a, TmKind::Lt)
        .or_else(|| vm.get_metamethod(&b, TmKind::Lt))
    {
        let r = vm.call_binary_tm(tm, a, b)?;
        return Ok(r.is_truthy());
    }
    Err(compare_error(vm, &a, &b))
}

/// `a <= b`: numbers, strings, `__le`, or the `not (b < a)` synthesis.
pub fn call_less_equal(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    if a.is_number() && b.is_number() {
        return Ok(num_le(&a, &b));
    }
    if let (LuaValue::String(x), LuaValue::String(y)) = (&a, &b) {
        return Ok(vm.pool.string(*x).as_bytes() <= vm.pool.string(*y).as_bytes());
    }
    if let Some(tm) = vm
        .get_metamethod(&a, TmKind::Le)
        .or_else(|| vm.get_metamethod(&b, TmKind::Le))
    {
        let r = vm.call_binary_tm(tm, a, b)?;
        return Ok(r.is_truthy());
    }
    if let Some(tm) = vm
        .get_metamethod(&a, TmKind::Lt)
        .or_else(|| vm.get_metamethod(&b, TmKind::Lt))
    {
        let r = vm.call_binary_tm(tm, b, a)?;
        return Ok(r.is_falsy());
    }
    Err(compare_error(vm, &a, &b))
}

/// `a == b`: raw equality, then `__eq` when both operands are tables or both
/// are full userdata.
pub fn call_equal(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    if a.raw_equal(&b) {
        return Ok(true);
    }
    let comparable = matches!(
        (&a, &b),
        (LuaValue::Table(_), LuaValue::Table(_)) | (LuaValue::Userdata(_), LuaValue::Userdata(_))
    );
    if comparable {
        if let Some(tm) = vm
            .get_metamethod(&a, TmKind::Eq)
            .or_else(|| vm.get_metamethod(&b, TmKind::Eq))
        {
            let r = vm.call_binary_tm(tm, a, b)?;
            return Ok(r.is_truthy());
        }
    }
    Ok(false)
}

// ============ Tag-method fallbacks and errors ============

fn try_binary_tm(vm: &mut LuaVM, a: LuaValue, b: LuaValue, tm: TmKind) -> LuaResult<LuaValue> {
    if let Some(handler) = vm
        .get_metamethod(&a, tm)
        .or_else(|| vm.get_metamethod(&b, tm))
    {
        return vm.call_binary_tm(handler, a, b);
    }
    Err(arith_error(vm, &a, &b))
}

fn try_unary_tm(vm: &mut LuaVM, a: LuaValue, tm: TmKind) -> LuaResult<LuaValue> {
    if let Some(handler) = vm.get_metamethod(&a, tm) {
        // Unary metamethods receive the operand twice, like 5.3.
        return vm.call_binary_tm(handler, a, a);
    }
    Err(arith_error(vm, &a, &a))
}

fn arith_error(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> crate::lua_vm::LuaError {
    let bad = if to_number(vm, a).is_none() { a } else { b };
    vm.error_str(format!(
        "attempt to perform arithmetic on a {} value",
        bad.type_name()
    ))
}

fn bitwise_error(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> crate::lua_vm::LuaError {
    let bad = if to_integer(vm, a).is_none() { a } else { b };
    if bad.is_number() || (bad.is_string() && to_number(vm, bad).is_some()) {
        vm.error_str("number has no integer representation")
    } else {
        vm.error_str(format!(
            "attempt to perform bitwise operation on a {} value",
            bad.type_name()
        ))
    }
}

fn compare_error(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> crate::lua_vm::LuaError {
    let (ta, tb) = (a.type_name(), b.type_name());
    if ta == tb {
        vm.error_str(format!("attempt to compare two {} values", ta))
    } else {
        vm.error_str(format!("attempt to compare {} with {}", ta, tb))
    }
}
