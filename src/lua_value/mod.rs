// The value universe: immediate values plus pooled heap objects.

mod lua_channel;
mod lua_function;
mod lua_proto;
mod lua_string;
mod lua_table;
mod lua_thread;
mod lua_userdata;
mod lua_value;

pub use lua_channel::LuaChannel;
pub use lua_function::LuaClosure;
pub use lua_proto::{LocVar, Prototype, UpvalDesc, UpvalKind};
pub use lua_string::LuaString;
pub use lua_table::{LuaTable, TableError};
pub use lua_thread::{ChanWait, LuaThread, PendingCall, ThreadStatus};
pub use lua_userdata::LuaUserdata;
pub use lua_value::{LuaValue, LuaValueKind, NUM_VALUE_KINDS, float_to_integer};
