// Process state and host API.
//
// A LuaVM owns the object pool, the globals and registry tables, the
// per-kind metatables for host-visible primitive types, the root thread and
// the native module registry. The host constructs a process, requires native
// modules, loads a compiled prototype into a main closure and calls it (or
// binds it to a thread and resumes).

mod args;
mod call_info;
mod channel;
mod const_string;
mod coroutine;
mod debug_info;
pub(crate) mod execute;
mod hooks;
mod lua_error;
pub mod opcode;
mod options;
mod upvalue;

pub use args::ArgParser;
pub use call_info::{CallInfo, call_status};
pub use debug_info::DebugInfo;
pub use execute::{MAX_TAG_LOOP, TM_N, TM_NAMES, TmKind};
pub use hooks::{Hook, hook_mask};
pub use lua_error::{LuaError, LuaResult, Position, RuntimeError};
pub use opcode::{Instruction, OpCode};
pub use options::VmOptions;
pub use upvalue::Upvalue;

pub(crate) use const_string::ConstStrings;

use std::collections::HashMap;
use std::rc::Rc;

use crate::gc::{ObjectPool, TableId, ThreadId, UpvalueId};
use crate::lua_value::{
    LuaThread, LuaUserdata, LuaValue, LuaValueKind, NUM_VALUE_KINDS, Prototype, TableError,
};
use crate::strconv;

/// Native function: receives the process and its argument vector, returns a
/// result vector or raises.
pub type NativeFn = fn(&mut LuaVM, &[LuaValue]) -> LuaResult<Vec<LuaValue>>;

pub struct LuaVM {
    pub(crate) pool: ObjectPool,
    pub(crate) globals: TableId,
    pub(crate) registry: TableId,
    /// Shared metatables for kinds without per-instance slots.
    pub(crate) type_metatables: [Option<TableId>; NUM_VALUE_KINDS],
    /// Lazily built metatables for host userdata kinds.
    host_kind_mts: HashMap<String, TableId, ahash::RandomState>,
    pub(crate) main: ThreadId,
    pub(crate) current: ThreadId,
    pub(crate) options: VmOptions,
    pub(crate) names: ConstStrings,
}

/// Registry key of the loaded-modules table.
const LOADED_KEY: &str = "_LOADED";

impl LuaVM {
    pub fn new(options: VmOptions) -> Self {
        let mut pool = ObjectPool::new();
        let names = ConstStrings::new(&mut pool);
        let globals = pool.create_table(0, 20);
        let registry = pool.create_table(0, 8);
        let main = pool.create_thread(LuaThread::new(true));

        let mut vm = Self {
            pool,
            globals,
            registry,
            type_metatables: [None; NUM_VALUE_KINDS],
            host_kind_mts: HashMap::with_hasher(ahash::RandomState::new()),
            main,
            current: main,
            options,
            names,
        };

        // _G points at the globals table itself.
        let g = LuaValue::Table(vm.globals);
        vm.set_global("_G", g);

        // Registry: the loaded-modules table.
        let loaded = vm.new_table_sized(0, 8);
        vm.registry_set(LOADED_KEY, loaded);

        vm
    }

    // ============ Thread access ============

    #[inline(always)]
    pub(crate) fn th(&self, th: ThreadId) -> &LuaThread {
        self.pool.thread(th)
    }

    #[inline(always)]
    pub(crate) fn th_mut(&mut self, th: ThreadId) -> &mut LuaThread {
        self.pool.thread_mut(th)
    }

    #[inline(always)]
    pub(crate) fn set_frame_pc(&mut self, th: ThreadId, pc: u32) {
        if let Some(ci) = self.th_mut(th).frames.last_mut() {
            ci.pc = pc;
        }
    }

    pub fn main_thread(&self) -> ThreadId {
        self.main
    }

    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    // ============ Value constructors ============

    pub fn new_string(&mut self, s: &str) -> LuaValue {
        LuaValue::String(self.pool.intern(s.as_bytes()))
    }

    pub fn new_string_from_bytes(&mut self, bytes: &[u8]) -> LuaValue {
        LuaValue::String(self.pool.intern(bytes))
    }

    pub fn new_table(&mut self) -> LuaValue {
        self.new_table_sized(0, 0)
    }

    pub fn new_table_sized(&mut self, narr: usize, nhash: usize) -> LuaValue {
        LuaValue::Table(self.pool.create_table(narr, nhash))
    }

    pub fn new_userdata(&mut self, ud: LuaUserdata) -> LuaValue {
        LuaValue::Userdata(self.pool.create_userdata(ud))
    }

    /// Bytes of a string value.
    pub fn string_bytes(&self, v: &LuaValue) -> Option<&[u8]> {
        v.as_string_id().map(|id| self.pool.string(id).as_bytes())
    }

    /// UTF-8 view of a string value.
    pub fn string_str(&self, v: &LuaValue) -> Option<&str> {
        v.as_string_id().and_then(|id| self.pool.string(id).as_str())
    }

    // ============ Globals and registry ============

    pub fn globals_table(&self) -> LuaValue {
        LuaValue::Table(self.globals)
    }

    pub fn registry_table(&self) -> LuaValue {
        LuaValue::Table(self.registry)
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) {
        let key = self.new_string(name);
        // Globals go through the raw path; no metamethods on the host side.
        let _ = self.pool.table_mut(self.globals).raw_set(key, value);
    }

    pub fn get_global(&mut self, name: &str) -> LuaValue {
        let key = self.new_string(name);
        self.pool.table(self.globals).raw_get(&key)
    }

    pub fn registry_set(&mut self, name: &str, value: LuaValue) {
        let key = self.new_string(name);
        let _ = self.pool.table_mut(self.registry).raw_set(key, value);
    }

    pub fn registry_get(&mut self, name: &str) -> LuaValue {
        let key = self.new_string(name);
        self.pool.table(self.registry).raw_get(&key)
    }

    // ============ Raw table access ============

    pub fn raw_get(&self, t: &LuaValue, key: &LuaValue) -> Option<LuaValue> {
        let id = t.as_table_id()?;
        Some(self.pool.table(id).raw_get(key))
    }

    pub fn raw_set(&mut self, t: &LuaValue, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        let Some(id) = t.as_table_id() else {
            return Err(self.error_str(format!(
                "attempt to index a {} value",
                t.type_name()
            )));
        };
        match self.pool.table_mut(id).raw_set(key, value) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.table_error(e)),
        }
    }

    pub fn raw_geti(&self, t: &LuaValue, i: i64) -> Option<LuaValue> {
        let id = t.as_table_id()?;
        Some(self.pool.table(id).raw_geti(i))
    }

    pub fn raw_seti(&mut self, t: &LuaValue, i: i64, value: LuaValue) -> LuaResult<()> {
        let Some(id) = t.as_table_id() else {
            return Err(self.error_str(format!(
                "attempt to index a {} value",
                t.type_name()
            )));
        };
        self.pool.table_mut(id).raw_seti(i, value);
        Ok(())
    }

    /// The `next` primitive over a table value.
    pub fn table_next(
        &mut self,
        t: &LuaValue,
        key: &LuaValue,
    ) -> LuaResult<Option<(LuaValue, LuaValue)>> {
        let Some(id) = t.as_table_id() else {
            return Err(self.error_str(format!(
                "attempt to iterate a {} value",
                t.type_name()
            )));
        };
        match self.pool.table(id).next(key) {
            Ok(r) => Ok(r),
            Err(e) => Err(self.table_error(e)),
        }
    }

    /// The length operator over a table value (no metamethod).
    pub fn table_length(&self, t: &LuaValue) -> Option<i64> {
        t.as_table_id().map(|id| self.pool.table(id).length())
    }

    fn table_error(&mut self, e: TableError) -> LuaError {
        self.error_str(e.message())
    }

    // ============ Metatables ============

    pub fn get_metatable(&self, v: &LuaValue) -> Option<LuaValue> {
        self.metatable_of(v).map(LuaValue::Table)
    }

    /// Set (or clear) the metatable of any value: per-instance for tables
    /// and full userdata, per-kind otherwise.
    pub fn set_metatable(&mut self, v: &LuaValue, mt: Option<LuaValue>) -> LuaResult<()> {
        let mt_id = match mt {
            None => None,
            Some(m) => match m.as_table_id() {
                Some(id) => Some(id),
                None => return Err(self.error_str("metatable must be a table or nil")),
            },
        };
        match v {
            LuaValue::Table(id) => self.pool.table_mut(*id).set_metatable(mt_id),
            LuaValue::Userdata(id) => self.pool.userdata_mut(*id).set_metatable(mt_id),
            _ => self.type_metatables[v.kind() as usize] = mt_id,
        }
        Ok(())
    }

    pub fn set_kind_metatable(&mut self, kind: LuaValueKind, mt: Option<LuaValue>) {
        self.type_metatables[kind as usize] = mt.and_then(|m| m.as_table_id());
    }

    /// Metatable for a named host kind, built on first use. Userdata created
    /// with this kind name pick it up through `bind_host_kind`.
    pub fn host_kind_metatable(
        &mut self,
        kind: &str,
        build: fn(&mut LuaVM) -> LuaResult<LuaValue>,
    ) -> LuaResult<LuaValue> {
        if let Some(id) = self.host_kind_mts.get(kind) {
            return Ok(LuaValue::Table(*id));
        }
        let mt = build(self)?;
        let Some(id) = mt.as_table_id() else {
            return Err(self.error_str("host kind metatable must be a table"));
        };
        self.host_kind_mts.insert(kind.to_string(), id);
        Ok(mt)
    }

    /// Attach the host-kind metatable matching the userdata's kind name.
    pub fn bind_host_kind(&mut self, ud: &LuaValue) -> LuaResult<()> {
        let Some(id) = ud.as_userdata_id() else {
            return Err(self.error_str("bind_host_kind expects full userdata"));
        };
        let kind = self.pool.userdata(id).kind.clone();
        if let Some(mt) = self.host_kind_mts.get(&kind).copied() {
            self.pool.userdata_mut(id).set_metatable(Some(mt));
        }
        Ok(())
    }

    // ============ Module registration ============

    /// Require(name, open): run the module opener once and cache its result
    /// in the loaded table and as a global.
    pub fn require(&mut self, name: &str, open: NativeFn) -> LuaResult<LuaValue> {
        let loaded = self.registry_get(LOADED_KEY);
        let key = self.new_string(name);
        if let Some(cached) = self.raw_get(&loaded, &key) {
            if !cached.is_nil() {
                return Ok(cached);
            }
        }
        let name_v = self.new_string(name);
        let results = open(self, &[name_v])?;
        let module = results.first().copied().unwrap_or(LuaValue::Nil);
        self.raw_set(&loaded, key, module)?;
        self.set_global(name, module);
        Ok(module)
    }

    // ============ Prototype loading ============

    /// Wrap a compiled top-level prototype in a main closure whose upvalues
    /// (conventionally just _ENV) are closed over the globals table.
    pub fn load_proto(&mut self, proto: Rc<Prototype>) -> LuaValue {
        use crate::lua_value::LuaClosure;
        let g = LuaValue::Table(self.globals);
        let upvalues: Vec<UpvalueId> = proto
            .upvalues
            .iter()
            .map(|_| self.pool.create_upvalue(Upvalue::Closed(g)))
            .collect();
        let id = self.pool.create_closure(LuaClosure::new(proto, upvalues));
        LuaValue::Function(id)
    }

    // ============ Upvalue manager ============

    /// Find the open upvalue of `th` at `index`, or create one. The open
    /// list is kept sorted by descending stack index.
    pub(crate) fn find_or_create_upvalue(&mut self, th: ThreadId, index: usize) -> UpvalueId {
        let mut insert_at = self.th(th).open_upvalues.len();
        for (pos, &id) in self.th(th).open_upvalues.iter().enumerate() {
            match self.pool.upvalue(id).open_index() {
                Some(i) if i == index => return id,
                Some(i) if i < index => {
                    insert_at = pos;
                    break;
                }
                _ => {}
            }
        }
        let id = self.pool.create_upvalue(Upvalue::Open { thread: th, index });
        self.th_mut(th).open_upvalues.insert(insert_at, id);
        id
    }

    /// Close every open upvalue of `th` at stack index >= `threshold`,
    /// copying the slot values into the heap cells.
    pub(crate) fn close_upvalues(&mut self, th: ThreadId, threshold: usize) {
        let mut split = 0;
        {
            let list = &self.th(th).open_upvalues;
            while split < list.len() {
                match self.pool.upvalue(list[split]).open_index() {
                    Some(i) if i >= threshold => split += 1,
                    _ => break,
                }
            }
        }
        if split == 0 {
            return;
        }
        let closing: Vec<UpvalueId> = self.th_mut(th).open_upvalues.drain(..split).collect();
        for id in closing {
            let value = match self.pool.upvalue(id).open_index() {
                Some(i) => self.th(th).stack.get(i).copied().unwrap_or(LuaValue::Nil),
                None => continue,
            };
            *self.pool.upvalue_mut(id) = Upvalue::Closed(value);
        }
    }

    pub(crate) fn read_upvalue(&self, id: UpvalueId) -> LuaValue {
        match self.pool.upvalue(id) {
            Upvalue::Open { thread, index } => self
                .pool
                .thread(*thread)
                .stack
                .get(*index)
                .copied()
                .unwrap_or(LuaValue::Nil),
            Upvalue::Closed(v) => *v,
        }
    }

    pub(crate) fn write_upvalue(&mut self, id: UpvalueId, value: LuaValue) {
        match self.pool.upvalue(id) {
            Upvalue::Open { thread, index } => {
                let (t, i) = (*thread, *index);
                let thread = self.th_mut(t);
                thread.ensure_stack(i + 1);
                thread.stack[i] = value;
            }
            Upvalue::Closed(_) => {
                *self.pool.upvalue_mut(id) = Upvalue::Closed(value);
            }
        }
    }

    /// Open upvalue count of a thread, for invariant checks.
    pub fn open_upvalue_count(&self, th: ThreadId) -> usize {
        self.th(th).open_upvalues.len()
    }

    // ============ Errors ============

    /// Raise an arbitrary value, annotating string values with the source
    /// position at `level` (0 = no annotation).
    pub fn raise(&mut self, value: LuaValue, level: u32) -> LuaError {
        let annotated = if level > 0 && value.is_string() {
            match self.position_at_level(level) {
                Some((src, line)) => {
                    let msg = self.display_value(&value);
                    self.new_string(&format!("{}:{}: {}", src, line, msg))
                }
                None => value,
            }
        } else {
            value
        };
        let mut err = RuntimeError::new(annotated, self.display_value(&annotated), level);
        err.traceback = self.capture_traceback();
        LuaError::Runtime(err)
    }

    /// A level-1 string error: the standard shape of VM runtime errors.
    pub(crate) fn error_str(&mut self, msg: impl Into<String>) -> LuaError {
        let v = self.new_string(&msg.into());
        self.raise(v, 1)
    }

    pub(crate) fn bytecode_error(&mut self, msg: &str) -> LuaError {
        self.error_str(format!("invalid bytecode: {}", msg))
    }

    /// A RuntimeError with no position annotation, for scheduler-level
    /// failures that have no frame context.
    pub(crate) fn plain_runtime_error(&mut self, msg: &str) -> RuntimeError {
        let v = self.new_string(msg);
        RuntimeError::new(v, msg.to_string(), 0)
    }

    /// Source position `level` frames up, counting only Lua frames
    /// (1 = innermost).
    fn position_at_level(&self, level: u32) -> Option<(String, i32)> {
        let mut remaining = level;
        let frames = &self.th(self.current).frames;
        for ci in frames.iter().rev() {
            if let Some(id) = ci.func.as_function_id() {
                remaining -= 1;
                if remaining == 0 {
                    let proto = self.pool.closure(id).proto.clone();
                    let line = if ci.pc == 0 {
                        proto.line_at(0) as i32
                    } else {
                        proto.line_at(ci.pc as usize - 1) as i32
                    };
                    return Some((proto.short_source().to_string(), line));
                }
            }
        }
        None
    }

    // ============ Display ============

    /// Repr used by error messages and host diagnostics; `__tostring` is not
    /// consulted here.
    pub fn display_value(&self, v: &LuaValue) -> String {
        match v {
            LuaValue::Nil => "nil".to_string(),
            LuaValue::Boolean(b) => b.to_string(),
            LuaValue::Integer(i) => strconv::format_integer(*i),
            LuaValue::Float(f) => strconv::format_float(*f),
            LuaValue::String(id) => self.pool.string(*id).display().into_owned(),
            LuaValue::Table(id) => format!("table: {:#010x}", id.0),
            LuaValue::Function(id) => format!("function: {:#010x}", id.0),
            LuaValue::NativeFn(f) => format!("function: builtin: {:#x}", *f as usize),
            LuaValue::LightUserdata(p) => format!("userdata: {:#x}", p),
            LuaValue::Userdata(id) => format!("userdata: {:#010x}", id.0),
            LuaValue::Thread(id) => format!("thread: {:#010x}", id.0),
            LuaValue::Channel(id) => format!("channel: {:#010x}", id.0),
        }
    }

    /// tostring with `__tostring` support.
    pub fn tostring_value(&mut self, v: LuaValue) -> LuaResult<LuaValue> {
        if let Some(tm) = self.get_metamethod(&v, TmKind::ToString) {
            let r = self.call_value(tm, vec![v])?;
            let first = r.first().copied().unwrap_or(LuaValue::Nil);
            if !first.is_string() {
                return Err(self.error_str("'__tostring' must return a string"));
            }
            return Ok(first);
        }
        let s = self.display_value(&v);
        Ok(self.new_string(&s))
    }

    // ============ GC roots ============

    pub(crate) fn gc_roots(&self) -> Vec<LuaValue> {
        let mut roots = vec![
            LuaValue::Table(self.globals),
            LuaValue::Table(self.registry),
            LuaValue::Thread(self.main),
            LuaValue::Thread(self.current),
        ];
        for mt in self.type_metatables.iter().flatten() {
            roots.push(LuaValue::Table(*mt));
        }
        for mt in self.host_kind_mts.values() {
            roots.push(LuaValue::Table(*mt));
        }
        self.names.trace(&mut |v| roots.push(v));
        roots
    }
}

impl Default for LuaVM {
    fn default() -> Self {
        Self::new(VmOptions::default())
    }
}
