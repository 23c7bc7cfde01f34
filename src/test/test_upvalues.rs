// Upvalue lifetime: sharing, closing on return and on JMP close-flags.

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaVM, OpCode};
use crate::test::{ProtoBuilder, int, rk, run};

#[test]
fn test_two_closures_share_one_local() {
    // local x = 0
    // local set = function(v) x = v end
    // local get = function() return x end
    // set(42); return get()
    let mut vm = LuaVM::default();

    // both closures capture main's local x directly
    let mut setter = ProtoBuilder::new("share.lua")
        .params(1)
        .max_stack(2)
        .line_defined(2)
        .upval_local("x", 0);
    setter.abc(OpCode::SetUpval, 0, 0, 0);
    setter.abc(OpCode::Return, 0, 1, 0);

    let mut getter = ProtoBuilder::new("share.lua")
        .max_stack(2)
        .line_defined(3)
        .upval_local("x", 0);
    getter.abc(OpCode::GetUpval, 0, 0, 0);
    getter.abc(OpCode::Return, 0, 2, 0);

    let mut main = ProtoBuilder::new("share.lua")
        .max_stack(6)
        .proto(setter.build())
        .proto(getter.build());
    let k0 = main.ki(0);
    let k42 = main.ki(42);
    main.abx(OpCode::LoadK, 0, k0);
    main.abx(OpCode::Closure, 1, 0);
    main.abx(OpCode::Closure, 2, 1);
    main.abc(OpCode::Move, 3, 1, 0);
    main.abx(OpCode::LoadK, 4, k42);
    main.abc(OpCode::Call, 3, 2, 1);
    main.abc(OpCode::Move, 3, 2, 0);
    main.abc(OpCode::Call, 3, 1, 2);
    main.abc(OpCode::Return, 3, 2, 0);

    let r = run(&mut vm, main.build());
    assert_eq!(int(&r[0]), 42);
}

#[test]
fn test_closure_survives_frame_exit() {
    // local x = 7; return function() return x end
    // calling the returned closure after main exits reads the closed cell
    let mut vm = LuaVM::default();

    let mut getter = ProtoBuilder::new("close.lua")
        .max_stack(2)
        .line_defined(1)
        .upval_local("x", 0);
    getter.abc(OpCode::GetUpval, 0, 0, 0);
    getter.abc(OpCode::Return, 0, 2, 0);

    let mut main = ProtoBuilder::new("close.lua").max_stack(4).proto(getter.build());
    let k7 = main.ki(7);
    main.abx(OpCode::LoadK, 0, k7);
    main.abx(OpCode::Closure, 1, 0);
    main.abc(OpCode::Return, 1, 2, 0);

    let r = run(&mut vm, main.build());
    let f = r[0];
    assert!(f.is_function());

    let main_th = vm.main_thread();
    assert_eq!(vm.open_upvalue_count(main_th), 0);

    let got = vm.call_value(f, Vec::new()).unwrap();
    assert_eq!(int(&got[0]), 7);
}

#[test]
fn test_jmp_close_flag_closes_loop_local() {
    // for each loop iteration a fresh closure captures the iteration local;
    // the backward JMP carries the close flag, so each closure keeps the
    // value it saw.
    //
    // local t = {}
    // local i = 1
    // while i <= 3 do
    //   local v = i * 10
    //   t[i] = function() return v end
    //   i = i + 1
    // end
    // return t[1](), t[2](), t[3]()
    let mut vm = LuaVM::default();

    let mut getter = ProtoBuilder::new("loopc.lua")
        .max_stack(2)
        .line_defined(4)
        .upval_local("v", 3);
    getter.abc(OpCode::GetUpval, 0, 0, 0);
    getter.abc(OpCode::Return, 0, 2, 0);

    let mut main = ProtoBuilder::new("loopc.lua")
        .max_stack(10)
        .proto(getter.build());
    let k1 = main.ki(1);
    let k3 = main.ki(3);
    let k10 = main.ki(10);
    let k2 = main.ki(2);
    main.abc(OpCode::NewTable, 0, 0, 0); // 0
    main.abx(OpCode::LoadK, 1, k1); // 1
    main.abc(OpCode::Le, 0, 1, rk(k3)); // 2
    main.asbx(OpCode::Jmp, 0, 5); // 3 -> 9
    main.abc(OpCode::Mul, 3, 1, rk(k10)); // 4
    main.abx(OpCode::Closure, 4, 0); // 5
    main.abc(OpCode::SetTable, 0, 1, 4); // 6
    main.abc(OpCode::Add, 1, 1, rk(k1)); // 7
    main.asbx(OpCode::Jmp, 4, -7); // 8: close >= R3, -> 2
    main.abc(OpCode::GetTable, 4, 0, rk(k1)); // 9
    main.abc(OpCode::Call, 4, 1, 2); // 10
    main.abc(OpCode::GetTable, 5, 0, rk(k2)); // 11
    main.abc(OpCode::Call, 5, 1, 2); // 12
    main.abc(OpCode::GetTable, 6, 0, rk(k3)); // 13
    main.abc(OpCode::Call, 6, 1, 2); // 14
    main.abc(OpCode::Return, 4, 4, 0); // 15: return R4, R5, R6

    let r = run(&mut vm, main.build());
    assert_eq!(r.iter().map(int).collect::<Vec<_>>(), vec![10, 20, 30]);
}

#[test]
fn test_nested_closure_shares_grandparent_local() {
    // local x = 5
    // local outer = function() return function() return x end end
    // return outer()()
    let mut vm = LuaVM::default();

    let mut inner = ProtoBuilder::new("nest.lua")
        .max_stack(2)
        .line_defined(2)
        .upval_parent("x", 0);
    inner.abc(OpCode::GetUpval, 0, 0, 0);
    inner.abc(OpCode::Return, 0, 2, 0);

    let mut outer = ProtoBuilder::new("nest.lua")
        .max_stack(2)
        .line_defined(1)
        .upval_local("x", 0)
        .proto(inner.build());
    outer.abx(OpCode::Closure, 0, 0);
    outer.abc(OpCode::Return, 0, 2, 0);

    let mut main = ProtoBuilder::new("nest.lua").max_stack(4).proto(outer.build());
    let k5 = main.ki(5);
    main.abx(OpCode::LoadK, 0, k5);
    main.abx(OpCode::Closure, 1, 0);
    main.abc(OpCode::Call, 1, 1, 2); // inner = outer()
    main.abc(OpCode::Call, 1, 1, 2); // inner()
    main.abc(OpCode::Return, 1, 2, 0);

    let r = run(&mut vm, main.build());
    assert_eq!(int(&r[0]), 5);
}

#[test]
fn test_pcall_restores_open_upvalue_set() {
    // the protected body creates an open upvalue and then errors; after
    // pcall catches, the caller's open-upvalue set is untouched
    let mut vm = LuaVM::default();

    let mut inner = ProtoBuilder::new("iso.lua")
        .max_stack(2)
        .line_defined(2)
        .upval_local("a", 0);
    inner.abc(OpCode::GetUpval, 0, 0, 0);
    inner.abc(OpCode::Return, 0, 2, 0);

    let mut body = ProtoBuilder::new("iso.lua")
        .max_stack(6)
        .line_defined(1)
        .proto(inner.build());
    let k5 = body.ki(5);
    let kx = body.ks(&mut vm, "x");
    body.abx(OpCode::LoadK, 0, k5);
    body.abx(OpCode::Closure, 1, 0); // opens an upvalue over R0
    body.abc(OpCode::LoadNil, 2, 0, 0);
    body.abc(OpCode::GetTable, 3, 2, rk(kx)); // errors here
    body.abc(OpCode::Return, 0, 1, 0);

    let f = vm.load_proto(body.build());
    let main_th = vm.main_thread();
    let before = vm.open_upvalue_count(main_th);
    let (ok, _) = vm.pcall(f, Vec::new()).unwrap();
    assert!(!ok);
    assert_eq!(vm.open_upvalue_count(main_th), before);
}

#[test]
fn test_setupval_writes_through_to_stack() {
    // local x = 1; (function() x = 9 end)(); return x
    let mut vm = LuaVM::default();

    let mut writer = ProtoBuilder::new("w.lua")
        .max_stack(2)
        .line_defined(1)
        .upval_local("x", 0);
    let k9 = writer.ki(9);
    writer.abx(OpCode::LoadK, 0, k9);
    writer.abc(OpCode::SetUpval, 0, 0, 0);
    writer.abc(OpCode::Return, 0, 1, 0);

    let mut main = ProtoBuilder::new("w.lua").max_stack(4).proto(writer.build());
    let k1 = main.ki(1);
    main.abx(OpCode::LoadK, 0, k1);
    main.abx(OpCode::Closure, 1, 0);
    main.abc(OpCode::Call, 1, 1, 1);
    main.abc(OpCode::Return, 0, 2, 0);

    let r = run(&mut vm, main.build());
    assert_eq!(int(&r[0]), 9);
}

#[test]
fn test_upvalue_inspection_api() {
    let mut vm = LuaVM::default();

    let mut getter = ProtoBuilder::new("insp.lua")
        .max_stack(2)
        .line_defined(1)
        .upval_local("x", 0);
    getter.abc(OpCode::GetUpval, 0, 0, 0);
    getter.abc(OpCode::Return, 0, 2, 0);

    let mut main = ProtoBuilder::new("insp.lua").max_stack(4).proto(getter.build());
    let k11 = main.ki(11);
    main.abx(OpCode::LoadK, 0, k11);
    main.abx(OpCode::Closure, 1, 0);
    main.abc(OpCode::Return, 1, 2, 0);

    let r = run(&mut vm, main.build());
    let f = r[0];

    let (name, v) = vm.get_upvalue(f, 0).unwrap();
    assert_eq!(name, "x");
    assert_eq!(int(&v), 11);

    vm.set_upvalue(f, 0, LuaValue::integer(12)).unwrap();
    let got = vm.call_value(f, Vec::new()).unwrap();
    assert_eq!(int(&got[0]), 12);
}
