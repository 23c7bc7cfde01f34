// Closure - runtime instantiation of a prototype.

use std::rc::Rc;

use crate::gc::UpvalueId;
use crate::lua_value::Prototype;

/// A Lua closure: a prototype bound to concrete upvalue cells. Two closures
/// sharing a prototype may differ in their upvalues.
///
/// Native functions are not pooled; they travel as light
/// `LuaValue::NativeFn` pointers.
pub struct LuaClosure {
    pub proto: Rc<Prototype>,
    pub upvalues: Vec<UpvalueId>,
}

impl LuaClosure {
    pub fn new(proto: Rc<Prototype>, upvalues: Vec<UpvalueId>) -> Self {
        Self { proto, upvalues }
    }

    #[inline(always)]
    pub fn num_upvalues(&self) -> usize {
        self.upvalues.len()
    }
}
