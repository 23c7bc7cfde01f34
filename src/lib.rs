// Lua 5.3 runtime core
// A register-based bytecode VM with coroutines, channels, metamethod
// dispatch and debug introspection. Prototypes are consumed as immutable
// input; the compiler and standard libraries are external collaborators.

#[cfg(test)]
mod test;

pub mod gc;
pub mod lua_value;
pub mod lua_vm;
pub mod strconv;

pub use gc::{ChannelId, FunctionId, ObjectPool, StringId, TableId, ThreadId, UserdataId};
pub use lua_value::{
    LocVar, LuaChannel, LuaClosure, LuaString, LuaTable, LuaThread, LuaUserdata, LuaValue,
    LuaValueKind, Prototype, ThreadStatus, UpvalDesc, UpvalKind,
};
pub use lua_vm::{
    ArgParser, DebugInfo, Hook, Instruction, LuaError, LuaResult, LuaVM, NativeFn, OpCode,
    Position, RuntimeError, TmKind, VmOptions, hook_mask,
};

use std::rc::Rc;

/// Load a compiled top-level prototype and run it on the root thread,
/// returning its results.
pub fn execute(vm: &mut LuaVM, proto: Rc<Prototype>) -> LuaResult<Vec<LuaValue>> {
    let main = vm.load_proto(proto);
    vm.call_value(main, Vec::new())
}
