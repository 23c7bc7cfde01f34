// Concatenation.
//
// Strings and numbers concatenate directly (numbers in their canonical
// string form); anything else falls back to `__concat`. A CONCAT range
// evaluates right-to-left, so `"a" .. 1 .. 2` folds as `"a" .. (1 .. 2)`.

use crate::lua_value::LuaValue;
use crate::lua_vm::execute::TmKind;
use crate::lua_vm::{LuaResult, LuaVM};
use crate::strconv;

fn concat_bytes(vm: &LuaVM, v: &LuaValue, out: &mut Vec<u8>) -> bool {
    match v {
        LuaValue::String(id) => {
            out.extend_from_slice(vm.pool.string(*id).as_bytes());
            true
        }
        LuaValue::Integer(i) => {
            let mut buf = itoa::Buffer::new();
            out.extend_from_slice(buf.format(*i).as_bytes());
            true
        }
        LuaValue::Float(f) => {
            out.extend_from_slice(strconv::format_float(*f).as_bytes());
            true
        }
        _ => false,
    }
}

/// `a .. b` for a single pair.
pub fn call_concat(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
    let mut out = Vec::new();
    if concat_bytes(vm, &a, &mut out) && concat_bytes(vm, &b, &mut out) {
        return Ok(vm.new_string_from_bytes(&out));
    }
    if let Some(tm) = vm
        .get_metamethod(&a, TmKind::Concat)
        .or_else(|| vm.get_metamethod(&b, TmKind::Concat))
    {
        return vm.call_binary_tm(tm, a, b);
    }
    let bad = if matches!(a, LuaValue::String(_) | LuaValue::Integer(_) | LuaValue::Float(_)) {
        &b
    } else {
        &a
    };
    Err(vm.error_str(format!(
        "attempt to concatenate a {} value",
        bad.type_name()
    )))
}
