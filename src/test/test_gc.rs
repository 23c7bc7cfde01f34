// Collector behavior: reachability through the process roots, cycles, and
// FORPREP boundary handling (which lives here with the other
// whole-process tests).

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaVM, OpCode};
use crate::test::{ProtoBuilder, int, rk, run};

#[test]
fn test_unreachable_objects_are_collected() {
    let mut vm = LuaVM::default();
    let before = vm.live_objects();
    for _ in 0..100 {
        vm.new_table();
    }
    assert!(vm.live_objects() >= before + 100);
    let freed = vm.collect_garbage();
    assert!(freed >= 100);
    assert!(vm.live_objects() <= before + 1);
}

#[test]
fn test_reachable_objects_survive() {
    let mut vm = LuaVM::default();
    let keep = vm.new_table();
    let key = vm.new_string("life");
    vm.raw_set(&keep, key, LuaValue::integer(42)).unwrap();
    vm.set_global("keep", keep);

    vm.collect_garbage();

    let back = vm.get_global("keep");
    assert_eq!(
        vm.raw_get(&back, &key).unwrap().as_integer_strict(),
        Some(42)
    );
}

#[test]
fn test_cyclic_tables_are_collected() {
    let mut vm = LuaVM::default();
    let baseline = {
        vm.collect_garbage();
        vm.live_objects()
    };
    let a = vm.new_table();
    let b = vm.new_table();
    let key = vm.new_string("other");
    vm.raw_set(&a, key, b).unwrap();
    vm.raw_set(&b, key, a).unwrap();
    drop((a, b));

    let freed = vm.collect_garbage();
    assert!(freed >= 2);
    assert_eq!(vm.live_objects(), baseline);
}

#[test]
fn test_closed_upvalue_keeps_value_alive() {
    let mut vm = LuaVM::default();

    // main: local s = "kept"; return function() return s end
    let mut getter = ProtoBuilder::new("gc.lua")
        .max_stack(2)
        .line_defined(1)
        .upval_local("s", 0);
    getter.abc(OpCode::GetUpval, 0, 0, 0);
    getter.abc(OpCode::Return, 0, 2, 0);

    let mut main = ProtoBuilder::new("gc.lua").max_stack(4).proto(getter.build());
    let ks = main.ks(&mut vm, "kept");
    main.abx(OpCode::LoadK, 0, ks);
    main.abx(OpCode::Closure, 1, 0);
    main.abc(OpCode::Return, 1, 2, 0);

    let r = run(&mut vm, main.build());
    let f = r[0];
    vm.set_global("f", f);

    vm.collect_garbage();

    let f = vm.get_global("f");
    let got = vm.call_value(f, Vec::new()).unwrap();
    assert_eq!(vm.string_str(&got[0]), Some("kept"));
}

#[test]
fn test_suspended_coroutine_stack_is_rooted_while_referenced() {
    fn n_yield(vm: &mut LuaVM, args: &[LuaValue]) -> crate::LuaResult<Vec<LuaValue>> {
        Err(vm.coroutine_yield(args.to_vec()))
    }

    let mut vm = LuaVM::default();
    vm.set_global("yield", LuaValue::NativeFn(n_yield));

    // body: local t = {}; t[1] = 5; yield(); return t[1]
    let mut b = ProtoBuilder::new("cogc.lua").max_stack(6).line_defined(1);
    let kyield = b.ks(&mut vm, "yield");
    let k1 = b.ki(1);
    let k5 = b.ki(5);
    b.abc(OpCode::NewTable, 0, 0, 0);
    b.abc(OpCode::SetTable, 0, rk(k1), rk(k5));
    b.abc(OpCode::GetTabUp, 1, 0, rk(kyield));
    b.abc(OpCode::Call, 1, 1, 1);
    b.abc(OpCode::GetTable, 1, 0, rk(k1));
    b.abc(OpCode::Return, 1, 2, 0);
    let b = b.upval_local("_ENV", 0);

    let body = vm.load_proto(b.build());
    let co_v = vm.new_thread(body).unwrap();
    vm.set_global("co", co_v);
    let co = co_v.as_thread_id().unwrap();

    vm.resume(co, Vec::new()).unwrap();
    vm.collect_garbage();

    let (ok, vals) = vm.resume(co, Vec::new()).unwrap();
    assert!(ok);
    assert_eq!(int(&vals[0]), 5);
}

// ============ FORPREP boundary behavior ============

/// Assemble: n = 0; for i = <init>, <limit>, <step> do n = n + 1 end; return n
fn count_loop(
    vm: &mut LuaVM,
    init: LuaValue,
    limit: LuaValue,
    step: LuaValue,
) -> Vec<LuaValue> {
    let mut b = ProtoBuilder::new("forb.lua").max_stack(8);
    let k0 = b.ki(0);
    let kinit = b.kv(init);
    let klimit = b.kv(limit);
    let kstep = b.kv(step);
    let k1 = b.ki(1);
    b.abx(OpCode::LoadK, 0, k0);
    b.abx(OpCode::LoadK, 1, kinit);
    b.abx(OpCode::LoadK, 2, klimit);
    b.abx(OpCode::LoadK, 3, kstep);
    b.asbx(OpCode::ForPrep, 1, 1);
    b.abc(OpCode::Add, 0, 0, rk(k1));
    b.asbx(OpCode::ForLoop, 1, -2);
    b.abc(OpCode::Return, 0, 2, 0);
    run(vm, b.build())
}

#[test]
fn test_forprep_float_limit_floors_for_positive_step() {
    let mut vm = LuaVM::default();
    let r = count_loop(
        &mut vm,
        LuaValue::integer(1),
        LuaValue::float(3.5),
        LuaValue::integer(1),
    );
    assert_eq!(int(&r[0]), 3);
}

#[test]
fn test_forprep_float_limit_ceils_for_negative_step() {
    let mut vm = LuaVM::default();
    let r = count_loop(
        &mut vm,
        LuaValue::integer(3),
        LuaValue::float(0.5),
        LuaValue::integer(-1),
    );
    // 3, 2, 1 (limit ceils to 1)
    assert_eq!(int(&r[0]), 3);
}

#[test]
fn test_forprep_limit_below_all_integers_runs_zero_times() {
    let mut vm = LuaVM::default();
    let r = count_loop(
        &mut vm,
        LuaValue::integer(1),
        LuaValue::float(-1e300),
        LuaValue::integer(1),
    );
    assert_eq!(int(&r[0]), 0);
}

#[test]
fn test_forprep_limit_above_all_integers_clamps_to_max() {
    let mut vm = LuaVM::default();
    let r = count_loop(
        &mut vm,
        LuaValue::integer(i64::MAX - 2),
        LuaValue::float(1e300),
        LuaValue::integer(1),
    );
    // MAX-2, MAX-1, MAX and then the add would overflow: exactly 3 passes
    assert_eq!(int(&r[0]), 3);
}

#[test]
fn test_forloop_descending_to_min_terminates() {
    let mut vm = LuaVM::default();
    let r = count_loop(
        &mut vm,
        LuaValue::integer(i64::MIN + 2),
        LuaValue::integer(i64::MIN),
        LuaValue::integer(-1),
    );
    assert_eq!(int(&r[0]), 3);
}

#[test]
fn test_float_loop_iterates_in_float_space() {
    let mut vm = LuaVM::default();
    let r = count_loop(
        &mut vm,
        LuaValue::float(0.0),
        LuaValue::float(1.0),
        LuaValue::float(0.25),
    );
    assert_eq!(int(&r[0]), 5);
}
