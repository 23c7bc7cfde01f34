// Mark-and-sweep collection over the object pool.
//
// The table <-> closure <-> upvalue cycle is owned entirely by the pool, so a
// plain tracing pass reclaims cycles; the upvalue manager's explicit close
// step keeps stack aliases out of the picture. Collection runs from quiescent
// boundaries (host calls between executions); between collections the pool
// grows monotonically.

mod gc_id;
mod object_pool;

pub use gc_id::{ChannelId, FunctionId, StringId, TableId, ThreadId, UpvalueId, UserdataId};
pub use object_pool::ObjectPool;

use std::collections::HashSet;
use std::rc::Rc;

use crate::lua_value::{LuaValue, Prototype};
use crate::lua_vm::{LuaVM, Upvalue};

pub(crate) struct Marks {
    pub strings: Vec<bool>,
    pub tables: Vec<bool>,
    pub functions: Vec<bool>,
    pub userdata: Vec<bool>,
    pub threads: Vec<bool>,
    pub channels: Vec<bool>,
    pub upvalues: Vec<bool>,
}

struct Tracer<'a> {
    pool: &'a ObjectPool,
    marks: Marks,
    worklist: Vec<LuaValue>,
    seen_protos: HashSet<*const Prototype>,
}

impl<'a> Tracer<'a> {
    fn new(pool: &'a ObjectPool) -> Self {
        let sizes = pool.capacities();
        Tracer {
            pool,
            marks: Marks {
                strings: vec![false; sizes.strings],
                tables: vec![false; sizes.tables],
                functions: vec![false; sizes.functions],
                userdata: vec![false; sizes.userdata],
                threads: vec![false; sizes.threads],
                channels: vec![false; sizes.channels],
                upvalues: vec![false; sizes.upvalues],
            },
            worklist: Vec::new(),
            seen_protos: HashSet::new(),
        }
    }

    fn mark_value(&mut self, v: LuaValue) {
        match v {
            LuaValue::String(id) => {
                self.marks.strings[id.index()] = true;
            }
            LuaValue::Table(id) => {
                if !self.marks.tables[id.index()] {
                    self.marks.tables[id.index()] = true;
                    self.worklist.push(v);
                }
            }
            LuaValue::Function(id) => {
                if !self.marks.functions[id.index()] {
                    self.marks.functions[id.index()] = true;
                    self.worklist.push(v);
                }
            }
            LuaValue::Userdata(id) => {
                if !self.marks.userdata[id.index()] {
                    self.marks.userdata[id.index()] = true;
                    self.worklist.push(v);
                }
            }
            LuaValue::Thread(id) => {
                if !self.marks.threads[id.index()] {
                    self.marks.threads[id.index()] = true;
                    self.worklist.push(v);
                }
            }
            LuaValue::Channel(id) => {
                if !self.marks.channels[id.index()] {
                    self.marks.channels[id.index()] = true;
                    self.worklist.push(v);
                }
            }
            _ => {}
        }
    }

    fn mark_upvalue(&mut self, id: UpvalueId) {
        if self.marks.upvalues[id.index()] {
            return;
        }
        self.marks.upvalues[id.index()] = true;
        match self.pool.upvalue(id) {
            Upvalue::Open { thread, .. } => self.mark_value(LuaValue::Thread(*thread)),
            Upvalue::Closed(v) => self.mark_value(*v),
        }
    }

    fn mark_proto(&mut self, proto: &Rc<Prototype>) {
        if !self.seen_protos.insert(Rc::as_ptr(proto)) {
            return;
        }
        for c in &proto.constants {
            self.mark_value(*c);
        }
        for nested in &proto.protos {
            self.mark_proto(nested);
        }
    }

    fn run(&mut self) {
        while let Some(v) = self.worklist.pop() {
            let mut pending = Vec::new();
            match v {
                LuaValue::Table(id) => {
                    let t = self.pool.table(id);
                    t.trace(&mut |v| pending.push(v));
                    if let Some(mt) = t.metatable() {
                        pending.push(LuaValue::Table(mt));
                    }
                }
                LuaValue::Function(id) => {
                    let cl = self.pool.closure(id);
                    let proto = cl.proto.clone();
                    let upvals = cl.upvalues.clone();
                    self.mark_proto(&proto);
                    for uv in upvals {
                        self.mark_upvalue(uv);
                    }
                }
                LuaValue::Userdata(id) => {
                    if let Some(mt) = self.pool.userdata(id).metatable() {
                        pending.push(LuaValue::Table(mt));
                    }
                }
                LuaValue::Thread(id) => {
                    let th = self.pool.thread(id);
                    th.trace(&mut |v| pending.push(v));
                    let upvals = th.open_upvalues.clone();
                    if let Some(r) = th.resumer {
                        pending.push(LuaValue::Thread(r));
                    }
                    for uv in upvals {
                        self.mark_upvalue(uv);
                    }
                }
                LuaValue::Channel(id) => {
                    self.pool.channel(id).trace(&mut |v| pending.push(v));
                }
                _ => {}
            }
            for v in pending {
                self.mark_value(v);
            }
        }
    }
}

impl LuaVM {
    /// Run a full mark-and-sweep cycle and return the number of freed
    /// objects. Must be called from a quiescent boundary: no native frame of
    /// the host may hold unrooted values across this call.
    pub fn collect_garbage(&mut self) -> usize {
        let roots = self.gc_roots();
        let mut tracer = Tracer::new(&self.pool);
        for v in roots {
            tracer.mark_value(v);
        }
        tracer.run();
        let marks = tracer.marks;
        self.pool.sweep(&marks)
    }

    /// Total live heap objects, for diagnostics and tests.
    pub fn live_objects(&self) -> usize {
        self.pool.live_count()
    }
}
