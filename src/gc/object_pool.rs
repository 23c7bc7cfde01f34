// ObjectPool - unified storage for every heap object the VM owns.
//
// Slots are Option so the collector can free them in place; freed indexes go
// on per-type free lists for reuse. Strings are interned: creating the same
// byte sequence twice yields the same id.

use std::collections::HashMap;

use crate::gc::gc_id::{
    ChannelId, FunctionId, StringId, TableId, ThreadId, UpvalueId, UserdataId,
};
use crate::lua_value::{
    LuaChannel, LuaClosure, LuaString, LuaTable, LuaThread, LuaUserdata, LuaValue,
};
use crate::lua_vm::Upvalue;

pub struct ObjectPool {
    strings: Vec<Option<LuaString>>,
    interner: HashMap<Box<[u8]>, StringId, ahash::RandomState>,
    tables: Vec<Option<LuaTable>>,
    functions: Vec<Option<LuaClosure>>,
    userdata: Vec<Option<LuaUserdata>>,
    threads: Vec<Option<LuaThread>>,
    channels: Vec<Option<LuaChannel>>,
    upvalues: Vec<Option<Upvalue>>,
    free_strings: Vec<u32>,
    free_tables: Vec<u32>,
    free_functions: Vec<u32>,
    free_userdata: Vec<u32>,
    free_threads: Vec<u32>,
    free_channels: Vec<u32>,
    free_upvalues: Vec<u32>,
    /// Objects created since the last collection.
    pub(crate) allocated: usize,
}

fn insert_slot<T>(slots: &mut Vec<Option<T>>, free: &mut Vec<u32>, value: T) -> u32 {
    match free.pop() {
        Some(i) => {
            slots[i as usize] = Some(value);
            i
        }
        None => {
            slots.push(Some(value));
            (slots.len() - 1) as u32
        }
    }
}

impl ObjectPool {
    pub fn new() -> Self {
        Self {
            strings: Vec::new(),
            interner: HashMap::with_hasher(ahash::RandomState::new()),
            tables: Vec::new(),
            functions: Vec::new(),
            userdata: Vec::new(),
            threads: Vec::new(),
            channels: Vec::new(),
            upvalues: Vec::new(),
            free_strings: Vec::new(),
            free_tables: Vec::new(),
            free_functions: Vec::new(),
            free_userdata: Vec::new(),
            free_threads: Vec::new(),
            free_channels: Vec::new(),
            free_upvalues: Vec::new(),
            allocated: 0,
        }
    }

    // ============ Creation ============

    pub fn intern(&mut self, bytes: &[u8]) -> StringId {
        if let Some(&id) = self.interner.get(bytes) {
            return id;
        }
        self.allocated += 1;
        let boxed: Box<[u8]> = bytes.into();
        let id = StringId(insert_slot(
            &mut self.strings,
            &mut self.free_strings,
            LuaString::new(boxed.clone()),
        ));
        self.interner.insert(boxed, id);
        id
    }

    pub fn create_table(&mut self, narr: usize, nhash: usize) -> TableId {
        self.allocated += 1;
        TableId(insert_slot(
            &mut self.tables,
            &mut self.free_tables,
            LuaTable::new(narr, nhash),
        ))
    }

    pub fn create_closure(&mut self, closure: LuaClosure) -> FunctionId {
        self.allocated += 1;
        FunctionId(insert_slot(
            &mut self.functions,
            &mut self.free_functions,
            closure,
        ))
    }

    pub fn create_userdata(&mut self, ud: LuaUserdata) -> UserdataId {
        self.allocated += 1;
        UserdataId(insert_slot(&mut self.userdata, &mut self.free_userdata, ud))
    }

    pub fn create_thread(&mut self, th: LuaThread) -> ThreadId {
        self.allocated += 1;
        ThreadId(insert_slot(&mut self.threads, &mut self.free_threads, th))
    }

    pub fn create_channel(&mut self, ch: LuaChannel) -> ChannelId {
        self.allocated += 1;
        ChannelId(insert_slot(&mut self.channels, &mut self.free_channels, ch))
    }

    pub fn create_upvalue(&mut self, uv: Upvalue) -> UpvalueId {
        self.allocated += 1;
        UpvalueId(insert_slot(&mut self.upvalues, &mut self.free_upvalues, uv))
    }

    // ============ Access ============
    // Ids handed out by this pool stay valid until a collection proves the
    // object unreachable, so a live id never observes an empty slot.

    #[inline(always)]
    pub fn string(&self, id: StringId) -> &LuaString {
        self.strings[id.index()].as_ref().expect("dangling string id")
    }

    #[inline(always)]
    pub fn table(&self, id: TableId) -> &LuaTable {
        self.tables[id.index()].as_ref().expect("dangling table id")
    }

    #[inline(always)]
    pub fn table_mut(&mut self, id: TableId) -> &mut LuaTable {
        self.tables[id.index()].as_mut().expect("dangling table id")
    }

    #[inline(always)]
    pub fn closure(&self, id: FunctionId) -> &LuaClosure {
        self.functions[id.index()]
            .as_ref()
            .expect("dangling function id")
    }

    #[inline(always)]
    pub fn userdata(&self, id: UserdataId) -> &LuaUserdata {
        self.userdata[id.index()]
            .as_ref()
            .expect("dangling userdata id")
    }

    #[inline(always)]
    pub fn userdata_mut(&mut self, id: UserdataId) -> &mut LuaUserdata {
        self.userdata[id.index()]
            .as_mut()
            .expect("dangling userdata id")
    }

    #[inline(always)]
    pub fn thread(&self, id: ThreadId) -> &LuaThread {
        self.threads[id.index()].as_ref().expect("dangling thread id")
    }

    #[inline(always)]
    pub fn thread_mut(&mut self, id: ThreadId) -> &mut LuaThread {
        self.threads[id.index()].as_mut().expect("dangling thread id")
    }

    #[inline(always)]
    pub fn channel(&self, id: ChannelId) -> &LuaChannel {
        self.channels[id.index()]
            .as_ref()
            .expect("dangling channel id")
    }

    #[inline(always)]
    pub fn channel_mut(&mut self, id: ChannelId) -> &mut LuaChannel {
        self.channels[id.index()]
            .as_mut()
            .expect("dangling channel id")
    }

    #[inline(always)]
    pub fn upvalue(&self, id: UpvalueId) -> &Upvalue {
        self.upvalues[id.index()]
            .as_ref()
            .expect("dangling upvalue id")
    }

    #[inline(always)]
    pub fn upvalue_mut(&mut self, id: UpvalueId) -> &mut Upvalue {
        self.upvalues[id.index()]
            .as_mut()
            .expect("dangling upvalue id")
    }

    /// Ids of all live threads (used to find parked channel peers).
    pub fn live_threads(&self) -> Vec<ThreadId> {
        self.threads
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|_| ThreadId(i as u32)))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        let live = |n: usize, f: usize| n - f;
        live(self.strings.len(), self.free_strings.len())
            + live(self.tables.len(), self.free_tables.len())
            + live(self.functions.len(), self.free_functions.len())
            + live(self.userdata.len(), self.free_userdata.len())
            + live(self.threads.len(), self.free_threads.len())
            + live(self.channels.len(), self.free_channels.len())
            + live(self.upvalues.len(), self.free_upvalues.len())
    }

    // ============ Collection support ============

    pub(crate) fn capacities(&self) -> PoolSizes {
        PoolSizes {
            strings: self.strings.len(),
            tables: self.tables.len(),
            functions: self.functions.len(),
            userdata: self.userdata.len(),
            threads: self.threads.len(),
            channels: self.channels.len(),
            upvalues: self.upvalues.len(),
        }
    }

    pub(crate) fn sweep(&mut self, marks: &super::Marks) -> usize {
        let mut freed = 0;
        for i in 0..self.strings.len() {
            if self.strings[i].is_some() && !marks.strings[i] {
                self.strings[i] = None;
                self.free_strings.push(i as u32);
                freed += 1;
            }
        }
        self.interner
            .retain(|_, id| marks.strings[id.index()]);
        for i in 0..self.tables.len() {
            if self.tables[i].is_some() && !marks.tables[i] {
                self.tables[i] = None;
                self.free_tables.push(i as u32);
                freed += 1;
            }
        }
        for i in 0..self.functions.len() {
            if self.functions[i].is_some() && !marks.functions[i] {
                self.functions[i] = None;
                self.free_functions.push(i as u32);
                freed += 1;
            }
        }
        for i in 0..self.userdata.len() {
            if self.userdata[i].is_some() && !marks.userdata[i] {
                self.userdata[i] = None;
                self.free_userdata.push(i as u32);
                freed += 1;
            }
        }
        for i in 0..self.threads.len() {
            if self.threads[i].is_some() && !marks.threads[i] {
                self.threads[i] = None;
                self.free_threads.push(i as u32);
                freed += 1;
            }
        }
        for i in 0..self.channels.len() {
            if self.channels[i].is_some() && !marks.channels[i] {
                self.channels[i] = None;
                self.free_channels.push(i as u32);
                freed += 1;
            }
        }
        for i in 0..self.upvalues.len() {
            if self.upvalues[i].is_some() && !marks.upvalues[i] {
                self.upvalues[i] = None;
                self.free_upvalues.push(i as u32);
                freed += 1;
            }
        }
        self.allocated = 0;
        freed
    }
}

pub(crate) struct PoolSizes {
    pub strings: usize,
    pub tables: usize,
    pub functions: usize,
    pub userdata: usize,
    pub threads: usize,
    pub channels: usize,
    pub upvalues: usize,
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}
