// Full userdata - opaque host payload with an optional metatable.

use std::any::Any;

use crate::gc::TableId;

pub struct LuaUserdata {
    data: Box<dyn Any>,
    /// Host kind name; selects the lazily built host-kind metatable.
    pub kind: String,
    pub(crate) metatable: Option<TableId>,
}

impl LuaUserdata {
    pub fn new(kind: impl Into<String>, data: Box<dyn Any>) -> Self {
        Self {
            data,
            kind: kind.into(),
            metatable: None,
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut::<T>()
    }

    pub fn metatable(&self) -> Option<TableId> {
        self.metatable
    }

    pub fn set_metatable(&mut self, mt: Option<TableId>) {
        self.metatable = mt;
    }
}
