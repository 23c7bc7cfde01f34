// Arithmetic, comparison, concatenation and metamethod dispatch.

use crate::lua_value::LuaValue;
use crate::lua_vm::execute::arith;
use crate::lua_vm::execute::concat::call_concat;
use crate::lua_vm::{LuaError, LuaVM, OpCode, TmKind};
use crate::test::{ProtoBuilder, int, rk, run};

fn rt_message(e: LuaError) -> String {
    match e {
        LuaError::Runtime(e) => e.message,
        LuaError::Yield => panic!("unexpected yield"),
    }
}

#[test]
fn test_integer_arithmetic_wraps() {
    let mut vm = LuaVM::default();
    let r = arith::call_add(&mut vm, LuaValue::integer(i64::MAX), LuaValue::integer(1)).unwrap();
    assert_eq!(r.as_integer_strict(), Some(i64::MIN));

    let r = arith::call_mul(
        &mut vm,
        LuaValue::integer(i64::MAX),
        LuaValue::integer(2),
    )
    .unwrap();
    assert_eq!(r.as_integer_strict(), Some(-2));
}

#[test]
fn test_string_coercion_takes_integer_path() {
    let mut vm = LuaVM::default();
    let ten = vm.new_string("10");
    let r = arith::call_add(&mut vm, ten, LuaValue::integer(1)).unwrap();
    assert_eq!(r.as_integer_strict(), Some(11));

    let half = vm.new_string("0.5");
    let r = arith::call_add(&mut vm, half, LuaValue::integer(1)).unwrap();
    assert_eq!(r.as_number(), Some(1.5));
}

#[test]
fn test_div_and_pow_are_always_float() {
    let mut vm = LuaVM::default();
    let r = arith::call_div(&mut vm, LuaValue::integer(4), LuaValue::integer(2)).unwrap();
    assert!(r.is_float());
    assert_eq!(r.as_number(), Some(2.0));

    let r = arith::call_pow(&mut vm, LuaValue::integer(2), LuaValue::integer(3)).unwrap();
    assert!(r.is_float());
    assert_eq!(r.as_number(), Some(8.0));
}

#[test]
fn test_floor_division_identity() {
    let mut vm = LuaVM::default();
    let pairs = [
        (7i64, 3i64),
        (-7, 3),
        (7, -3),
        (-7, -3),
        (0, 5),
        (i64::MIN, -1),
        (i64::MAX, 7),
    ];
    for (a, b) in pairs {
        let q = arith::call_idiv(&mut vm, LuaValue::integer(a), LuaValue::integer(b))
            .unwrap()
            .as_integer_strict()
            .unwrap();
        let m = arith::call_mod(&mut vm, LuaValue::integer(a), LuaValue::integer(b))
            .unwrap()
            .as_integer_strict()
            .unwrap();
        assert_eq!(
            q.wrapping_mul(b).wrapping_add(m),
            a,
            "identity for {} and {}",
            a,
            b
        );
        if m != 0 {
            assert_eq!(m < 0, b < 0, "sign of {} % {} follows the divisor", a, b);
        }
    }
}

#[test]
fn test_integer_division_by_zero_errors() {
    let mut vm = LuaVM::default();
    let e = arith::call_idiv(&mut vm, LuaValue::integer(1), LuaValue::integer(0)).unwrap_err();
    assert!(rt_message(e).contains("n//0"));
    let e = arith::call_mod(&mut vm, LuaValue::integer(1), LuaValue::integer(0)).unwrap_err();
    assert!(rt_message(e).contains("n%0"));
    // float division by zero is IEEE
    let r = arith::call_div(&mut vm, LuaValue::integer(1), LuaValue::integer(0)).unwrap();
    assert_eq!(r.as_number(), Some(f64::INFINITY));
}

#[test]
fn test_bitwise_requires_exact_integers() {
    let mut vm = LuaVM::default();
    let r = arith::call_band(&mut vm, LuaValue::integer(0b1100), LuaValue::integer(0b1010))
        .unwrap();
    assert_eq!(r.as_integer_strict(), Some(0b1000));

    // exact float accepted
    let r = arith::call_bor(&mut vm, LuaValue::float(4.0), LuaValue::integer(1)).unwrap();
    assert_eq!(r.as_integer_strict(), Some(5));

    let e = arith::call_band(&mut vm, LuaValue::float(1.5), LuaValue::integer(1)).unwrap_err();
    assert!(rt_message(e).contains("no integer representation"));

    let e = arith::call_bxor(&mut vm, LuaValue::Nil, LuaValue::integer(1)).unwrap_err();
    assert!(rt_message(e).contains("bitwise operation on a nil value"));
}

#[test]
fn test_shift_semantics() {
    let mut vm = LuaVM::default();
    let shl = |vm: &mut LuaVM, a: i64, b: i64| {
        arith::call_shl(vm, LuaValue::integer(a), LuaValue::integer(b))
            .unwrap()
            .as_integer_strict()
            .unwrap()
    };
    let shr = |vm: &mut LuaVM, a: i64, b: i64| {
        arith::call_shr(vm, LuaValue::integer(a), LuaValue::integer(b))
            .unwrap()
            .as_integer_strict()
            .unwrap()
    };
    assert_eq!(shl(&mut vm, 1, 4), 16);
    assert_eq!(shl(&mut vm, 1, 64), 0);
    assert_eq!(shl(&mut vm, 16, -2), 4);
    // shifts are logical, not arithmetic
    assert_eq!(shr(&mut vm, -1, 63), 1);
    assert_eq!(shr(&mut vm, i64::MIN, 63), 1);
}

#[test]
fn test_equality_across_numeric_subtypes() {
    let mut vm = LuaVM::default();
    assert!(arith::call_equal(&mut vm, LuaValue::integer(3), LuaValue::float(3.0)).unwrap());
    assert!(!arith::call_equal(&mut vm, LuaValue::integer(3), LuaValue::float(3.5)).unwrap());
    // 2^63 rounds above i64::MAX
    assert!(!arith::call_equal(
        &mut vm,
        LuaValue::integer(i64::MAX),
        LuaValue::float(i64::MAX as f64)
    )
    .unwrap());
    assert!(
        !arith::call_equal(&mut vm, LuaValue::float(f64::NAN), LuaValue::float(f64::NAN)).unwrap()
    );
}

#[test]
fn test_float_sum_is_inexact() {
    // return (0.1 + 0.2 == 0.3) -> false
    let mut vm = LuaVM::default();
    let sum = arith::call_add(&mut vm, LuaValue::float(0.1), LuaValue::float(0.2)).unwrap();
    assert!(!arith::call_equal(&mut vm, sum, LuaValue::float(0.3)).unwrap());
}

#[test]
fn test_comparison_at_integer_float_boundary() {
    let mut vm = LuaVM::default();
    let lt = |vm: &mut LuaVM, a: LuaValue, b: LuaValue| arith::call_less_than(vm, a, b).unwrap();
    // i64::MAX < 2^63 even though (i64::MAX as f64) == 2^63
    assert!(lt(
        &mut vm,
        LuaValue::integer(i64::MAX),
        LuaValue::float(9_223_372_036_854_775_808.0)
    ));
    assert!(!lt(
        &mut vm,
        LuaValue::float(9_223_372_036_854_775_808.0),
        LuaValue::integer(i64::MAX)
    ));
    assert!(lt(&mut vm, LuaValue::integer(2), LuaValue::float(2.5)));
    assert!(!lt(&mut vm, LuaValue::float(2.5), LuaValue::integer(2)));
    assert!(
        arith::call_less_equal(&mut vm, LuaValue::integer(3), LuaValue::float(3.0)).unwrap()
    );
}

#[test]
fn test_string_ordering_is_bytewise() {
    let mut vm = LuaVM::default();
    let a = vm.new_string("abc");
    let b = vm.new_string("abd");
    assert!(arith::call_less_than(&mut vm, a, b).unwrap());
    assert!(arith::call_less_equal(&mut vm, a, a).unwrap());
}

#[test]
fn test_comparison_type_error() {
    let mut vm = LuaVM::default();
    let s = vm.new_string("x");
    let e = arith::call_less_than(&mut vm, s, LuaValue::integer(1)).unwrap_err();
    assert!(rt_message(e).contains("attempt to compare string with number"));
}

#[test]
fn test_concat_right_associates() {
    // "a" .. 1 .. 2 == "a12"
    let mut vm = LuaVM::default();
    let mut b = ProtoBuilder::new("concat.lua").max_stack(4);
    let ka = b.ks(&mut vm, "a");
    let k1 = b.ki(1);
    let k2 = b.ki(2);
    b.abx(OpCode::LoadK, 0, ka);
    b.abx(OpCode::LoadK, 1, k1);
    b.abx(OpCode::LoadK, 2, k2);
    b.abc(OpCode::Concat, 0, 0, 2);
    b.abc(OpCode::Return, 0, 2, 0);
    let r = run(&mut vm, b.build());
    assert_eq!(vm.string_str(&r[0]), Some("a12"));
}

#[test]
fn test_concat_float_formatting() {
    let mut vm = LuaVM::default();
    let prefix = vm.new_string("v=");
    let r = call_concat(&mut vm, prefix, LuaValue::float(1.0)).unwrap();
    assert_eq!(vm.string_str(&r), Some("v=1.0"));
    let r = call_concat(&mut vm, prefix, LuaValue::float(f64::INFINITY)).unwrap();
    assert_eq!(vm.string_str(&r), Some("v=inf"));
}

#[test]
fn test_concat_type_error_names_offender() {
    let mut vm = LuaVM::default();
    let s = vm.new_string("a");
    let e = call_concat(&mut vm, s, LuaValue::Nil).unwrap_err();
    assert!(rt_message(e).contains("attempt to concatenate a nil value"));
}

#[test]
fn test_add_metamethod_dispatch() {
    // mt = { __add = function() return "added" end }
    // x = setmetatable({}, mt); return x + 1
    fn n_added(vm: &mut LuaVM, _args: &[LuaValue]) -> crate::LuaResult<Vec<LuaValue>> {
        Ok(vec![vm.new_string("added")])
    }

    let mut vm = LuaVM::default();
    let x = vm.new_table();
    let mt = vm.new_table();
    let key = vm.new_string("__add");
    vm.raw_set(&mt, key, LuaValue::NativeFn(n_added)).unwrap();
    vm.set_metatable(&x, Some(mt)).unwrap();
    vm.set_global("x", x);

    let mut b = ProtoBuilder::new("mm.lua").max_stack(2);
    let kx = b.ks(&mut vm, "x");
    let k1 = b.ki(1);
    b.abc(OpCode::GetTabUp, 0, 0, rk(kx));
    b.abc(OpCode::Add, 0, 0, rk(k1));
    b.abc(OpCode::Return, 0, 2, 0);
    let b = b.upval_local("_ENV", 0);

    let r = run(&mut vm, b.build());
    assert_eq!(vm.string_str(&r[0]), Some("added"));
}

#[test]
fn test_eq_metamethod_on_tables() {
    fn n_true(_vm: &mut LuaVM, _args: &[LuaValue]) -> crate::LuaResult<Vec<LuaValue>> {
        Ok(vec![LuaValue::boolean(true)])
    }

    let mut vm = LuaVM::default();
    let a = vm.new_table();
    let b = vm.new_table();
    assert!(!arith::call_equal(&mut vm, a, b).unwrap());

    let mt = vm.new_table();
    let key = vm.new_string("__eq");
    vm.raw_set(&mt, key, LuaValue::NativeFn(n_true)).unwrap();
    vm.set_metatable(&a, Some(mt)).unwrap();
    assert!(arith::call_equal(&mut vm, a, b).unwrap());
    // raw equality still holds for identity
    assert!(arith::call_equal(&mut vm, a, a).unwrap());
}

#[test]
fn test_le_synthesized_from_lt() {
    // mt with __lt comparing a "v" field, no __le
    fn n_lt(vm: &mut LuaVM, args: &[LuaValue]) -> crate::LuaResult<Vec<LuaValue>> {
        let key = vm.new_string("v");
        let a = vm.raw_get(&args[0], &key).unwrap_or(LuaValue::Nil);
        let b = vm.raw_get(&args[1], &key).unwrap_or(LuaValue::Nil);
        let lt = crate::lua_vm::execute::arith::call_less_than(vm, a, b)?;
        Ok(vec![LuaValue::boolean(lt)])
    }

    let mut vm = LuaVM::default();
    let mt = vm.new_table();
    let key = vm.new_string("__lt");
    vm.raw_set(&mt, key, LuaValue::NativeFn(n_lt)).unwrap();

    let mk = |vm: &mut LuaVM, v: i64, mt: LuaValue| {
        let t = vm.new_table();
        let key = vm.new_string("v");
        vm.raw_set(&t, key, LuaValue::integer(v)).unwrap();
        vm.set_metatable(&t, Some(mt)).unwrap();
        t
    };
    let small = mk(&mut vm, 1, mt);
    let big = mk(&mut vm, 2, mt);

    assert!(arith::call_less_than(&mut vm, small, big).unwrap());
    // __le falls back to not (big < small)
    assert!(arith::call_less_equal(&mut vm, small, big).unwrap());
    assert!(arith::call_less_equal(&mut vm, small, small).unwrap());
    assert!(!arith::call_less_equal(&mut vm, big, small).unwrap());
}

#[test]
fn test_len_of_string_and_table() {
    let mut vm = LuaVM::default();
    let s = vm.new_string("héllo");
    let r = arith::call_len(&mut vm, s).unwrap();
    assert_eq!(r.as_integer_strict(), Some(6)); // bytes, not code points

    let t = vm.new_table();
    for i in 1..=4 {
        vm.raw_seti(&t, i, LuaValue::integer(i)).unwrap();
    }
    let r = arith::call_len(&mut vm, t).unwrap();
    assert_eq!(r.as_integer_strict(), Some(4));
}

#[test]
fn test_unary_minus_and_bnot() {
    let mut vm = LuaVM::default();
    let r = arith::call_unm(&mut vm, LuaValue::integer(5)).unwrap();
    assert_eq!(r.as_integer_strict(), Some(-5));
    let r = arith::call_unm(&mut vm, LuaValue::integer(i64::MIN)).unwrap();
    assert_eq!(r.as_integer_strict(), Some(i64::MIN)); // wraps
    let r = arith::call_bnot(&mut vm, LuaValue::integer(0)).unwrap();
    assert_eq!(r.as_integer_strict(), Some(-1));
    let e = arith::call_unm(&mut vm, LuaValue::Boolean(true)).unwrap_err();
    assert!(rt_message(e).contains("arithmetic on a boolean value"));
}

#[test]
fn test_index_metamethod_chain() {
    let mut vm = LuaVM::default();
    let bottom = vm.new_table();
    let key = vm.new_string("k");
    vm.raw_set(&bottom, key, LuaValue::integer(42)).unwrap();

    let middle = vm.new_table();
    let mt_mid = vm.new_table();
    let index_key = vm.new_string("__index");
    vm.raw_set(&mt_mid, index_key, bottom).unwrap();
    vm.set_metatable(&middle, Some(mt_mid)).unwrap();

    let top = vm.new_table();
    let mt_top = vm.new_table();
    vm.raw_set(&mt_top, index_key, middle).unwrap();
    vm.set_metatable(&top, Some(mt_top)).unwrap();

    let got = vm.table_get_with_meta(top, key).unwrap();
    assert_eq!(got.as_integer_strict(), Some(42));

    // missing key resolves to nil through the same chain
    let other = vm.new_string("missing");
    assert!(vm.table_get_with_meta(top, other).unwrap().is_nil());
}

#[test]
fn test_newindex_function_intercepts() {
    fn n_newindex(vm: &mut LuaVM, args: &[LuaValue]) -> crate::LuaResult<Vec<LuaValue>> {
        // log writes into the global "log" table instead of the target
        let log = vm.get_global("log");
        vm.raw_set(&log, args[1], args[2])?;
        Ok(Vec::new())
    }

    let mut vm = LuaVM::default();
    let log = vm.new_table();
    vm.set_global("log", log);

    let t = vm.new_table();
    let mt = vm.new_table();
    let key = vm.new_string("__newindex");
    vm.raw_set(&mt, key, LuaValue::NativeFn(n_newindex)).unwrap();
    vm.set_metatable(&t, Some(mt)).unwrap();

    let field = vm.new_string("f");
    vm.table_set_with_meta(t, field, LuaValue::integer(9)).unwrap();
    // the table itself stays empty, the log receives the write
    assert!(vm.raw_get(&t, &field).unwrap().is_nil());
    assert_eq!(
        vm.raw_get(&log, &field).unwrap().as_integer_strict(),
        Some(9)
    );
}

#[test]
fn test_call_metamethod() {
    fn n_invoke(_vm: &mut LuaVM, args: &[LuaValue]) -> crate::LuaResult<Vec<LuaValue>> {
        // receives the callable table itself first
        assert!(args[0].is_table());
        Ok(vec![args.get(1).copied().unwrap_or(LuaValue::Nil)])
    }

    let mut vm = LuaVM::default();
    let t = vm.new_table();
    let mt = vm.new_table();
    let key = vm.new_string("__call");
    vm.raw_set(&mt, key, LuaValue::NativeFn(n_invoke)).unwrap();
    vm.set_metatable(&t, Some(mt)).unwrap();

    let r = vm.call_value(t, vec![LuaValue::integer(5)]).unwrap();
    assert_eq!(r[0].as_integer_strict(), Some(5));
}

#[test]
fn test_tostring_metamethod() {
    fn n_tostring(vm: &mut LuaVM, _args: &[LuaValue]) -> crate::LuaResult<Vec<LuaValue>> {
        Ok(vec![vm.new_string("custom")])
    }

    let mut vm = LuaVM::default();
    let t = vm.new_table();
    let mt = vm.new_table();
    let key = vm.new_string("__tostring");
    vm.raw_set(&mt, key, LuaValue::NativeFn(n_tostring)).unwrap();
    vm.set_metatable(&t, Some(mt)).unwrap();

    let s = vm.tostring_value(t).unwrap();
    assert_eq!(vm.string_str(&s), Some("custom"));

    let tm = TmKind::ToString;
    assert_eq!(tm.name(), "__tostring");
}
