// Debug hooks: per-instruction (count), per-line, per-call and per-return
// callbacks, run synchronously in the coroutine under a reentry guard.

use crate::gc::ThreadId;
use crate::lua_value::{LuaValue, Prototype};
use crate::lua_vm::{LuaResult, LuaVM};

/// Hook event masks.
pub mod hook_mask {
    pub const CALL: u32 = 1 << 0;
    pub const RET: u32 = 1 << 1;
    pub const LINE: u32 = 1 << 2;
    pub const COUNT: u32 = 1 << 3;
}

/// Per-thread hook configuration.
pub struct Hook {
    pub func: LuaValue,
    pub mask: u32,
    /// Instruction period of the count hook.
    pub count: u32,
    pub(crate) counter: u32,
    pub(crate) in_hook: bool,
}

impl LuaVM {
    /// Install (or clear, with a nil function or empty mask) the hook of a
    /// thread.
    pub fn set_hook(&mut self, th: ThreadId, func: LuaValue, mask: u32, count: u32) {
        let thread = self.th_mut(th);
        if func.is_nil() || mask == 0 {
            thread.hook = None;
            return;
        }
        thread.hook = Some(Hook {
            func,
            mask,
            count,
            counter: count,
            in_hook: false,
        });
    }

    pub fn hook_mask(&self, th: ThreadId) -> u32 {
        self.th(th).hook.as_ref().map(|h| h.mask).unwrap_or(0)
    }

    /// Count and line hooks, checked before each instruction.
    pub(crate) fn fire_instruction_hooks(
        &mut self,
        th: ThreadId,
        proto: &Prototype,
        pc: usize,
    ) -> LuaResult<()> {
        let Some(hook) = self.th(th).hook.as_ref() else {
            return Ok(());
        };
        if hook.in_hook {
            return Ok(());
        }
        let mask = hook.mask;

        if mask & hook_mask::COUNT != 0 {
            let fire = {
                let hook = self.th_mut(th).hook.as_mut().expect("hook vanished");
                if hook.counter > 1 {
                    hook.counter -= 1;
                    false
                } else {
                    hook.counter = hook.count.max(1);
                    true
                }
            };
            if fire {
                self.call_hook(th, "count", -1)?;
            }
        }

        if mask & hook_mask::LINE != 0 {
            let line = proto.line_at(pc) as i32;
            let changed = {
                let ci = self.th_mut(th).frames.last_mut();
                match ci {
                    Some(ci) if ci.hook_line != line => {
                        ci.hook_line = line;
                        true
                    }
                    _ => false,
                }
            };
            if changed {
                self.call_hook(th, "line", line)?;
            }
        }
        Ok(())
    }

    pub(crate) fn fire_call_hook(&mut self, th: ThreadId, is_tail: bool) -> LuaResult<()> {
        if self.hook_wants(th, hook_mask::CALL) {
            let event = if is_tail { "tail call" } else { "call" };
            self.call_hook(th, event, -1)?;
        }
        Ok(())
    }

    pub(crate) fn fire_return_hook(&mut self, th: ThreadId) -> LuaResult<()> {
        if self.hook_wants(th, hook_mask::RET) {
            self.call_hook(th, "return", -1)?;
        }
        Ok(())
    }

    fn hook_wants(&self, th: ThreadId, mask: u32) -> bool {
        match self.th(th).hook.as_ref() {
            Some(h) => !h.in_hook && h.mask & mask != 0,
            None => false,
        }
    }

    /// Invoke the hook function with (event, line). Hook errors propagate
    /// like any runtime error, which lets a count hook abort runaway code.
    fn call_hook(&mut self, th: ThreadId, event: &str, line: i32) -> LuaResult<()> {
        let func = {
            let hook = self.th_mut(th).hook.as_mut().expect("hook vanished");
            hook.in_hook = true;
            hook.func
        };
        let event_v = self.new_string(event);
        let line_v = if line >= 0 {
            LuaValue::integer(line as i64)
        } else {
            LuaValue::Nil
        };
        let result = self.call_value(func, vec![event_v, line_v]);
        if let Some(hook) = self.th_mut(th).hook.as_mut() {
            hook.in_hook = false;
        }
        result.map(|_| ())
    }
}
