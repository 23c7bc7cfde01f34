// Metamethod dispatch.
//
// Tables and full userdata carry per-instance metatables; every other kind
// shares a per-process metatable slot. Raw operations never consult these;
// the *_with_meta entry points implement the fallback cascades.

use crate::gc::TableId;
use crate::lua_value::{LuaValue, LuaValueKind};
use crate::lua_vm::{LuaResult, LuaVM};

/// Tag-method keys, in the order their names are pre-interned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmKind {
    Index = 0,
    NewIndex,
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Unm,
    BAnd,
    BOr,
    BXor,
    BNot,
    Shl,
    Shr,
    Len,
    Concat,
    Eq,
    Lt,
    Le,
    Call,
    ToString,
    Pairs,
    Gc,
    Mode,
}

pub const TM_N: usize = 26;

pub const TM_NAMES: [&str; TM_N] = [
    "__index",
    "__newindex",
    "__add",
    "__sub",
    "__mul",
    "__div",
    "__idiv",
    "__mod",
    "__pow",
    "__unm",
    "__band",
    "__bor",
    "__bxor",
    "__bnot",
    "__shl",
    "__shr",
    "__len",
    "__concat",
    "__eq",
    "__lt",
    "__le",
    "__call",
    "__tostring",
    "__pairs",
    "__gc",
    "__mode",
];

impl TmKind {
    pub fn name(self) -> &'static str {
        TM_NAMES[self as usize]
    }
}

/// Limit on `__index`/`__newindex`/`__call` chains; an unbounded chain is a
/// runtime error, not a hang.
pub const MAX_TAG_LOOP: usize = 100;

impl LuaVM {
    /// Metatable of any value: per-instance for tables and full userdata,
    /// per-kind otherwise.
    pub fn metatable_of(&self, v: &LuaValue) -> Option<TableId> {
        match v {
            LuaValue::Table(id) => self.pool.table(*id).metatable(),
            LuaValue::Userdata(id) => self.pool.userdata(*id).metatable(),
            _ => self.kind_metatable(v.kind()),
        }
    }

    pub(crate) fn kind_metatable(&self, kind: LuaValueKind) -> Option<TableId> {
        self.type_metatables[kind as usize]
    }

    /// Look up a tag method on a value's metatable; nil results count as
    /// absent.
    pub fn get_metamethod(&self, v: &LuaValue, tm: TmKind) -> Option<LuaValue> {
        let mt = self.metatable_of(v)?;
        let key = self.names.tm[tm as usize];
        let found = self.pool.table(mt).raw_get(&key);
        if found.is_nil() { None } else { Some(found) }
    }

    /// GET(t, k) with the `__index` cascade.
    pub fn table_get_with_meta(&mut self, t: LuaValue, key: LuaValue) -> LuaResult<LuaValue> {
        let mut cur = t;
        for _ in 0..MAX_TAG_LOOP {
            if let LuaValue::Table(id) = cur {
                let raw = self.pool.table(id).raw_get(&key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                let Some(handler) = self.get_metamethod(&cur, TmKind::Index) else {
                    return Ok(LuaValue::Nil);
                };
                if handler.is_function() {
                    let rets = self.call_value(handler, vec![cur, key])?;
                    return Ok(rets.first().copied().unwrap_or(LuaValue::Nil));
                }
                cur = handler;
            } else {
                let Some(handler) = self.get_metamethod(&cur, TmKind::Index) else {
                    return Err(self.error_str(format!(
                        "attempt to index a {} value",
                        cur.type_name()
                    )));
                };
                if handler.is_function() {
                    let rets = self.call_value(handler, vec![cur, key])?;
                    return Ok(rets.first().copied().unwrap_or(LuaValue::Nil));
                }
                cur = handler;
            }
        }
        Err(self.error_str("'__index' chain too long; possible loop"))
    }

    /// SET(t, k, v) with the `__newindex` cascade.
    pub fn table_set_with_meta(
        &mut self,
        t: LuaValue,
        key: LuaValue,
        value: LuaValue,
    ) -> LuaResult<()> {
        let mut cur = t;
        for _ in 0..MAX_TAG_LOOP {
            if let LuaValue::Table(id) = cur {
                let present = !self.pool.table(id).raw_get(&key).is_nil();
                if present {
                    return self.raw_set_checked(id, key, value);
                }
                let Some(handler) = self.get_metamethod(&cur, TmKind::NewIndex) else {
                    return self.raw_set_checked(id, key, value);
                };
                if handler.is_function() {
                    self.call_value(handler, vec![cur, key, value])?;
                    return Ok(());
                }
                cur = handler;
            } else {
                let Some(handler) = self.get_metamethod(&cur, TmKind::NewIndex) else {
                    return Err(self.error_str(format!(
                        "attempt to index a {} value",
                        cur.type_name()
                    )));
                };
                if handler.is_function() {
                    self.call_value(handler, vec![cur, key, value])?;
                    return Ok(());
                }
                cur = handler;
            }
        }
        Err(self.error_str("'__newindex' chain too long; possible loop"))
    }

    fn raw_set_checked(&mut self, id: TableId, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        match self.pool.table_mut(id).raw_set(key, value) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.error_str(e.message())),
        }
    }

    /// Call a binary tag method and return its first result.
    pub(crate) fn call_binary_tm(
        &mut self,
        tm: LuaValue,
        a: LuaValue,
        b: LuaValue,
    ) -> LuaResult<LuaValue> {
        let rets = self.call_value(tm, vec![a, b])?;
        Ok(rets.first().copied().unwrap_or(LuaValue::Nil))
    }
}
