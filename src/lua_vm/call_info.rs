// CallInfo - per-call activation record.

use crate::lua_value::LuaValue;

/// Call status flags.
pub mod call_status {
    /// Frame runs a Lua closure.
    pub const CIST_LUA: u32 = 1 << 0;
    /// Frame is a native function marker.
    pub const CIST_NATIVE: u32 = 1 << 1;
    /// Frame replaced a previous one by a tail call.
    pub const CIST_TAIL: u32 = 1 << 2;
    /// Frame belongs to a hook invocation.
    pub const CIST_HOOK: u32 = 1 << 3;
}

/// One frame on a thread's call stack: the called value, its register base
/// into the value stack, the frame top, the saved pc, captured varargs and
/// the expected result count.
#[derive(Clone)]
pub struct CallInfo {
    pub func: LuaValue,
    /// First register of the frame (func sits at base - 1).
    pub base: usize,
    /// Current frame top; tracks open (multi-result) call windows.
    pub top: usize,
    /// Next instruction to execute.
    pub pc: u32,
    /// Expected results at the call site (-1 = all).
    pub nresults: i32,
    pub call_status: u32,
    /// Surplus arguments of a vararg function.
    pub varargs: Vec<LuaValue>,
    /// Last line a line hook fired for, -1 before the first.
    pub hook_line: i32,
}

impl CallInfo {
    pub fn new_lua(func: LuaValue, base: usize, top: usize, nresults: i32) -> Self {
        Self {
            func,
            base,
            top,
            pc: 0,
            nresults,
            call_status: call_status::CIST_LUA,
            varargs: Vec::new(),
            hook_line: -1,
        }
    }

    pub fn new_native(func: LuaValue, base: usize, nresults: i32) -> Self {
        Self {
            func,
            base,
            top: base,
            pc: 0,
            nresults,
            call_status: call_status::CIST_NATIVE,
            varargs: Vec::new(),
            hook_line: -1,
        }
    }

    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        self.call_status & call_status::CIST_LUA != 0
    }

    #[inline(always)]
    pub fn is_native(&self) -> bool {
        self.call_status & call_status::CIST_NATIVE != 0
    }

    #[inline(always)]
    pub fn is_tail(&self) -> bool {
        self.call_status & call_status::CIST_TAIL != 0
    }

    #[inline(always)]
    pub fn set_tail(&mut self) {
        self.call_status |= call_status::CIST_TAIL;
    }

    /// Stack index of the called value.
    #[inline(always)]
    pub fn func_pos(&self) -> usize {
        self.base - 1
    }
}
