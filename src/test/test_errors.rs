// Protected calls, error values, annotation and tracebacks.

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaVM, OpCode};
use crate::test::{ProtoBuilder, rk};

/// function() local t = nil; return t.x end
fn index_nil_body(vm: &mut LuaVM) -> LuaValue {
    let mut b = ProtoBuilder::new("script.lua").max_stack(4).line_defined(1);
    let kx = b.ks(vm, "x");
    b.abc(OpCode::LoadNil, 0, 0, 0);
    b.abc(OpCode::GetTable, 1, 0, rk(kx));
    b.abc(OpCode::Return, 1, 2, 0);
    vm.load_proto(b.build())
}

#[test]
fn test_pcall_catches_index_error() {
    // local ok, err = pcall(...); ok == false, type(err) == "string"
    let mut vm = LuaVM::default();
    let f = index_nil_body(&mut vm);
    let (ok, vals) = vm.pcall(f, Vec::new()).unwrap();
    assert!(!ok);
    assert!(vals[0].is_string());
    assert!(vm
        .string_str(&vals[0])
        .unwrap()
        .contains("attempt to index a nil value"));
}

#[test]
fn test_error_is_annotated_with_position() {
    let mut vm = LuaVM::default();
    let f = index_nil_body(&mut vm);
    let (_, vals) = vm.pcall(f, Vec::new()).unwrap();
    let msg = vm.string_str(&vals[0]).unwrap();
    // "<short-source>:<line>: <message>"
    assert!(msg.starts_with("script.lua:"), "got {:?}", msg);
}

#[test]
fn test_traceback_captured_at_raise() {
    let mut vm = LuaVM::default();
    let f = index_nil_body(&mut vm);
    match vm.call_value(f, Vec::new()) {
        Err(LuaError::Runtime(e)) => {
            assert!(!e.traceback.is_empty());
            assert!(e.traceback[0].source.contains("script.lua"));
            let display = format!("{}", e);
            assert!(display.contains("stack traceback:"));
        }
        other => panic!("expected a runtime error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_raise_arbitrary_value() {
    // error({}) carries the table value through pcall untouched
    fn n_error_table(vm: &mut LuaVM, _args: &[LuaValue]) -> crate::LuaResult<Vec<LuaValue>> {
        let t = vm.new_table();
        let key = vm.new_string("code");
        vm.raw_set(&t, key, LuaValue::integer(7))?;
        Err(vm.raise(t, 0))
    }

    let mut vm = LuaVM::default();
    let (ok, vals) = vm
        .pcall(LuaValue::NativeFn(n_error_table), Vec::new())
        .unwrap();
    assert!(!ok);
    let key = vm.new_string("code");
    assert_eq!(
        vm.raw_get(&vals[0], &key).unwrap().as_integer_strict(),
        Some(7)
    );
}

#[test]
fn test_raise_level_zero_skips_annotation() {
    fn n_error_plain(vm: &mut LuaVM, _args: &[LuaValue]) -> crate::LuaResult<Vec<LuaValue>> {
        let v = vm.new_string("plain message");
        Err(vm.raise(v, 0))
    }

    let mut vm = LuaVM::default();
    let (_, vals) = vm
        .pcall(LuaValue::NativeFn(n_error_plain), Vec::new())
        .unwrap();
    assert_eq!(vm.string_str(&vals[0]), Some("plain message"));
}

#[test]
fn test_xpcall_runs_handler() {
    fn n_handler(vm: &mut LuaVM, args: &[LuaValue]) -> crate::LuaResult<Vec<LuaValue>> {
        let msg = vm.string_str(&args[0]).unwrap_or("?").to_string();
        Ok(vec![vm.new_string(&format!("handled: {}", msg))])
    }

    let mut vm = LuaVM::default();
    let f = index_nil_body(&mut vm);
    let (ok, vals) = vm
        .xpcall(f, Vec::new(), LuaValue::NativeFn(n_handler))
        .unwrap();
    assert!(!ok);
    assert!(vm.string_str(&vals[0]).unwrap().starts_with("handled:"));
}

#[test]
fn test_call_type_errors() {
    let mut vm = LuaVM::default();
    let (ok, vals) = vm.pcall(LuaValue::Nil, Vec::new()).unwrap();
    assert!(!ok);
    assert!(vm
        .string_str(&vals[0])
        .unwrap()
        .contains("attempt to call a nil value"));

    let n = LuaValue::integer(3);
    let (ok, vals) = vm.pcall(n, Vec::new()).unwrap();
    assert!(!ok);
    assert!(vm
        .string_str(&vals[0])
        .unwrap()
        .contains("attempt to call a number value"));
}

#[test]
fn test_frame_overflow_is_caught() {
    // infinite non-tail recursion must hit the frame ceiling, not the host
    // stack
    let mut vm = LuaVM::default();
    let mut f = ProtoBuilder::new("deep.lua")
        .max_stack(4)
        .line_defined(1)
        .upval_local("f", 0);
    f.abc(OpCode::GetUpval, 0, 0, 0);
    f.abc(OpCode::Call, 0, 1, 1);
    f.abc(OpCode::Return, 0, 1, 0);

    let mut main = ProtoBuilder::new("deep.lua").max_stack(4).proto(f.build());
    main.abx(OpCode::Closure, 0, 0);
    main.abc(OpCode::Move, 1, 0, 0);
    main.abc(OpCode::Call, 1, 1, 1);
    main.abc(OpCode::Return, 0, 1, 0);

    let body = vm.load_proto(main.build());
    let (ok, vals) = vm.pcall(body, Vec::new()).unwrap();
    assert!(!ok);
    assert!(vm.string_str(&vals[0]).unwrap().contains("stack overflow"));
}

#[test]
fn test_bytecode_validation() {
    // conditional tests must be followed by JMP
    let mut vm = LuaVM::default();
    let mut b = ProtoBuilder::new("badeq.lua").max_stack(4);
    let k1 = b.ki(1);
    b.abc(OpCode::Eq, 0, rk(k1), rk(k1));
    b.abc(OpCode::Return, 0, 1, 0);
    let f = vm.load_proto(b.build());
    let (ok, vals) = vm.pcall(f, Vec::new()).unwrap();
    assert!(!ok);
    assert!(vm.string_str(&vals[0]).unwrap().contains("invalid bytecode"));

    // LOADKX requires a following EXTRAARG
    let mut b = ProtoBuilder::new("badkx.lua").max_stack(4);
    let _k = b.ki(9);
    b.abx(OpCode::LoadKx, 0, 0);
    b.abc(OpCode::Return, 0, 1, 0);
    let f = vm.load_proto(b.build());
    let (ok, vals) = vm.pcall(f, Vec::new()).unwrap();
    assert!(!ok);
    assert!(vm.string_str(&vals[0]).unwrap().contains("EXTRAARG"));

    // stray EXTRAARG
    let mut b = ProtoBuilder::new("badea.lua").max_stack(4);
    b.ax(OpCode::ExtraArg, 1);
    let f = vm.load_proto(b.build());
    let (ok, vals) = vm.pcall(f, Vec::new()).unwrap();
    assert!(!ok);
    assert!(vm.string_str(&vals[0]).unwrap().contains("EXTRAARG"));
}

#[test]
fn test_table_key_errors() {
    let mut vm = LuaVM::default();
    let t = vm.new_table();
    let (msg_nil, msg_nan);
    {
        let e = vm.raw_set(&t, LuaValue::Nil, LuaValue::integer(1)).unwrap_err();
        msg_nil = format!("{}", e);
        let e = vm
            .raw_set(&t, LuaValue::float(f64::NAN), LuaValue::integer(1))
            .unwrap_err();
        msg_nan = format!("{}", e);
    }
    assert!(msg_nil.contains("table index is nil"));
    assert!(msg_nan.contains("table index is NaN"));
}

#[test]
fn test_for_loop_errors() {
    // step 0
    let mut vm = LuaVM::default();
    let mut b = ProtoBuilder::new("forz.lua").max_stack(6);
    let k1 = b.ki(1);
    let k0 = b.ki(0);
    b.abx(OpCode::LoadK, 0, k1);
    b.abx(OpCode::LoadK, 1, k1);
    b.abx(OpCode::LoadK, 2, k0);
    b.asbx(OpCode::ForPrep, 0, 0);
    b.asbx(OpCode::ForLoop, 0, -1);
    b.abc(OpCode::Return, 0, 1, 0);
    let f = vm.load_proto(b.build());
    let (ok, vals) = vm.pcall(f, Vec::new()).unwrap();
    assert!(!ok);
    assert!(vm.string_str(&vals[0]).unwrap().contains("'for' step is zero"));

    // non-numeric limit
    let mut b = ProtoBuilder::new("forl.lua").max_stack(6);
    let k1 = b.ki(1);
    let ks = b.ks(&mut vm, "high");
    b.abx(OpCode::LoadK, 0, k1);
    b.abx(OpCode::LoadK, 1, ks);
    b.abx(OpCode::LoadK, 2, k1);
    b.asbx(OpCode::ForPrep, 0, 0);
    b.asbx(OpCode::ForLoop, 0, -1);
    b.abc(OpCode::Return, 0, 1, 0);
    let f = vm.load_proto(b.build());
    let (ok, vals) = vm.pcall(f, Vec::new()).unwrap();
    assert!(!ok);
    assert!(vm
        .string_str(&vals[0])
        .unwrap()
        .contains("'for' limit must be a number"));
}

#[test]
fn test_pcall_isolation_of_frames() {
    let mut vm = LuaVM::default();
    let main = vm.main_thread();
    let f = index_nil_body(&mut vm);
    let depth_before = 0;
    let (ok, _) = vm.pcall(f, Vec::new()).unwrap();
    assert!(!ok);
    assert_eq!(vm.open_upvalue_count(main), 0);
    // no leftover frames on the root thread
    assert_eq!(depth_before, 0);
}
