// Positional argument parser for native functions.
//
// Wraps the argument slice a native receives and raises formatted
// "bad argument" errors on type mismatches, with the string/number
// coercions native code expects.

use crate::gc::{ChannelId, TableId, ThreadId};
use crate::lua_value::LuaValue;
use crate::lua_vm::execute::arith;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

pub struct ArgParser<'a> {
    fname: &'a str,
    args: &'a [LuaValue],
}

impl<'a> ArgParser<'a> {
    pub fn new(fname: &'a str, args: &'a [LuaValue]) -> Self {
        Self { fname, args }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Argument at 0-based position `n`, absent treated as nil.
    pub fn get(&self, n: usize) -> LuaValue {
        self.args.get(n).copied().unwrap_or(LuaValue::Nil)
    }

    /// "bad argument #N to 'f' (msg)".
    pub fn arg_error(&self, vm: &mut LuaVM, n: usize, msg: &str) -> LuaError {
        vm.error_str(format!(
            "bad argument #{} to '{}' ({})",
            n + 1,
            self.fname,
            msg
        ))
    }

    fn type_error(&self, vm: &mut LuaVM, n: usize, want: &str) -> LuaError {
        let got = if n < self.args.len() {
            self.get(n).type_name()
        } else {
            "no value"
        };
        self.arg_error(vm, n, &format!("{} expected, got {}", want, got))
    }

    pub fn check_value(&self, vm: &mut LuaVM, n: usize) -> LuaResult<LuaValue> {
        if n < self.args.len() {
            Ok(self.args[n])
        } else {
            Err(self.type_error(vm, n, "value"))
        }
    }

    pub fn check_integer(&self, vm: &mut LuaVM, n: usize) -> LuaResult<i64> {
        let v = self.get(n);
        match arith::to_integer(vm, &v) {
            Some(i) => Ok(i),
            None if v.is_number() => {
                Err(self.arg_error(vm, n, "number has no integer representation"))
            }
            None => Err(self.type_error(vm, n, "number")),
        }
    }

    pub fn opt_integer(&self, vm: &mut LuaVM, n: usize, default: i64) -> LuaResult<i64> {
        if self.get(n).is_nil() {
            Ok(default)
        } else {
            self.check_integer(vm, n)
        }
    }

    pub fn check_number(&self, vm: &mut LuaVM, n: usize) -> LuaResult<f64> {
        let v = self.get(n);
        arith::to_number(vm, &v).ok_or_else(|| self.type_error(vm, n, "number"))
    }

    pub fn opt_number(&self, vm: &mut LuaVM, n: usize, default: f64) -> LuaResult<f64> {
        if self.get(n).is_nil() {
            Ok(default)
        } else {
            self.check_number(vm, n)
        }
    }

    /// String coercion accepts numbers, like the stack-based API.
    pub fn check_string(&self, vm: &mut LuaVM, n: usize) -> LuaResult<String> {
        let v = self.get(n);
        match v {
            LuaValue::String(id) => Ok(vm.pool.string(id).display().into_owned()),
            LuaValue::Integer(_) | LuaValue::Float(_) => Ok(vm.display_value(&v)),
            _ => Err(self.type_error(vm, n, "string")),
        }
    }

    pub fn opt_string(&self, vm: &mut LuaVM, n: usize, default: &str) -> LuaResult<String> {
        if self.get(n).is_nil() {
            Ok(default.to_string())
        } else {
            self.check_string(vm, n)
        }
    }

    pub fn check_bool(&self, _vm: &mut LuaVM, n: usize) -> bool {
        self.get(n).is_truthy()
    }

    pub fn check_table(&self, vm: &mut LuaVM, n: usize) -> LuaResult<TableId> {
        self.get(n)
            .as_table_id()
            .ok_or_else(|| self.type_error(vm, n, "table"))
    }

    pub fn check_function(&self, vm: &mut LuaVM, n: usize) -> LuaResult<LuaValue> {
        let v = self.get(n);
        if v.is_function() {
            Ok(v)
        } else {
            Err(self.type_error(vm, n, "function"))
        }
    }

    pub fn check_thread(&self, vm: &mut LuaVM, n: usize) -> LuaResult<ThreadId> {
        self.get(n)
            .as_thread_id()
            .ok_or_else(|| self.type_error(vm, n, "thread"))
    }

    pub fn check_channel(&self, vm: &mut LuaVM, n: usize) -> LuaResult<ChannelId> {
        self.get(n)
            .as_channel_id()
            .ok_or_else(|| self.type_error(vm, n, "channel"))
    }

    pub fn check_userdata(&self, vm: &mut LuaVM, n: usize) -> LuaResult<LuaValue> {
        let v = self.get(n);
        match v {
            LuaValue::Userdata(_) | LuaValue::LightUserdata(_) => Ok(v),
            _ => Err(self.type_error(vm, n, "userdata")),
        }
    }
}
