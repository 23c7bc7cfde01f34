// Pre-interned name strings, created once per process so hot paths never
// re-hash "__index" and friends.

use crate::gc::ObjectPool;
use crate::lua_value::LuaValue;
use crate::lua_vm::execute::{TM_N, TM_NAMES};

pub struct ConstStrings {
    /// Tag-method names, indexed by TmKind discriminant.
    pub tm: [LuaValue; TM_N],
    /// "_ENV", the conventional first upvalue of a main closure.
    pub env: LuaValue,
}

impl ConstStrings {
    pub fn new(pool: &mut ObjectPool) -> Self {
        let mut tm = [LuaValue::Nil; TM_N];
        for (i, name) in TM_NAMES.iter().enumerate() {
            tm[i] = LuaValue::String(pool.intern(name.as_bytes()));
        }
        let env = LuaValue::String(pool.intern(b"_ENV"));
        Self { tm, env }
    }

    /// Every pre-interned value, for GC rooting.
    pub(crate) fn trace(&self, mark: &mut dyn FnMut(LuaValue)) {
        for v in &self.tm {
            mark(*v);
        }
        mark(self.env);
    }
}
