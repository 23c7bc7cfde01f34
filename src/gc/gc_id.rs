// Typed ids into the object pool.
//
// Heap objects are referenced by index instead of pointer so that values stay
// Copy and the table/closure/upvalue cycle is owned in one place (the pool).

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);

        impl $name {
            #[inline(always)]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_id!(
    /// Interned immutable byte string.
    StringId
);
define_id!(
    /// Table instance.
    TableId
);
define_id!(
    /// Lua closure (prototype bound to upvalues).
    FunctionId
);
define_id!(
    /// Full userdata (host-owned payload plus optional metatable).
    UserdataId
);
define_id!(
    /// Thread (coroutine) state.
    ThreadId
);
define_id!(
    /// Channel (cooperative value queue).
    ChannelId
);
define_id!(
    /// Upvalue cell, open or closed.
    UpvalueId
);
