// Debug introspection: getinfo-style queries, local/upvalue inspection and
// traceback synthesis.
//
// The name derivation for 'n' walks back from the caller's call site through
// the instructions that produced the called value (MOVE, GETTABUP, GETTABLE,
// GETUPVAL, LOADK/LOADKX, SELF), or recognizes the site itself as a
// metamethod dispatch.

use std::rc::Rc;

use crate::gc::ThreadId;
use crate::lua_value::{LuaValue, Prototype};
use crate::lua_vm::execute::TmKind;
use crate::lua_vm::opcode::Instruction;
use crate::lua_vm::{CallInfo, LuaVM, OpCode, Position};

/// Selected fields of a frame or function, per the `what` string of
/// `get_info`: 'S' source, 'l' current line, 'u' upvalue/param counts,
/// 't' tail-call flag, 'n' best-effort name, 'L' active lines.
#[derive(Debug, Clone)]
pub struct DebugInfo {
    pub func: LuaValue,
    pub source: String,
    pub short_source: String,
    pub line_defined: i32,
    pub last_line_defined: i32,
    /// "Lua", "main" or "native".
    pub what: &'static str,
    pub current_line: i32,
    pub num_upvalues: u32,
    pub num_params: u32,
    pub is_vararg: bool,
    pub is_tail_call: bool,
    pub name: String,
    /// local, global, field, method, upvalue, constant, metamethod,
    /// for iterator, hook, or "".
    pub name_what: &'static str,
    /// Table of line -> true, when 'L' was requested.
    pub active_lines: Option<LuaValue>,
}

impl DebugInfo {
    fn empty(func: LuaValue) -> Self {
        Self {
            func,
            source: String::new(),
            short_source: String::new(),
            line_defined: -1,
            last_line_defined: -1,
            what: "native",
            current_line: -1,
            num_upvalues: 0,
            num_params: 0,
            is_vararg: false,
            is_tail_call: false,
            name: String::new(),
            name_what: "",
            active_lines: None,
        }
    }
}

impl LuaVM {
    fn frame_proto(&self, ci: &CallInfo) -> Option<Rc<Prototype>> {
        let id = ci.func.as_function_id()?;
        Some(self.pool.closure(id).proto.clone())
    }

    /// Frame at `level` on the current thread (0 = running function).
    fn frame_at(&self, level: usize) -> Option<CallInfo> {
        let frames = &self.th(self.current).frames;
        if level >= frames.len() {
            return None;
        }
        Some(frames[frames.len() - 1 - level].clone())
    }

    /// getinfo(level, what) over the current thread's frames.
    pub fn get_info(&mut self, level: usize, what: &str) -> Option<DebugInfo> {
        let ci = self.frame_at(level)?;
        let proto = self.frame_proto(&ci);
        let mut d = DebugInfo::empty(ci.func);

        for r in what.chars() {
            match r {
                'S' => set_func_info(&mut d, proto.as_deref()),
                'l' => d.current_line = current_line(&ci, proto.as_deref()),
                'u' => set_upvalue_info(self, &mut d, &ci, proto.as_deref()),
                't' => d.is_tail_call = ci.is_tail(),
                'n' => {
                    let hook_active = self
                        .th(self.current)
                        .hook
                        .as_ref()
                        .map(|h| h.in_hook)
                        .unwrap_or(false);
                    if hook_active && level == 0 {
                        d.name = "?".to_string();
                        d.name_what = "hook";
                    } else if !ci.is_tail() {
                        if let Some(prev) = self.frame_at(level + 1) {
                            if let Some(prev_proto) = self.frame_proto(&prev) {
                                set_func_name(self, &mut d, &prev_proto, prev.pc);
                            }
                        }
                    }
                }
                'L' => {
                    if let Some(p) = proto.as_deref() {
                        d.active_lines = Some(self.active_lines_table(p));
                    }
                }
                _ => {}
            }
        }
        Some(d)
    }

    /// getinfo over a function value instead of a stack level.
    pub fn get_info_func(&mut self, func: LuaValue, what: &str) -> Option<DebugInfo> {
        if !func.is_function() {
            return None;
        }
        let proto = func
            .as_function_id()
            .map(|id| self.pool.closure(id).proto.clone());
        let mut d = DebugInfo::empty(func);
        for r in what.chars() {
            match r {
                'S' => set_func_info(&mut d, proto.as_deref()),
                'l' => d.current_line = -1,
                'u' => {
                    if let Some(p) = proto.as_deref() {
                        if let Some(id) = func.as_function_id() {
                            d.num_upvalues = self.pool.closure(id).num_upvalues() as u32;
                        }
                        d.num_params = p.num_params as u32;
                        d.is_vararg = p.is_vararg;
                    } else {
                        d.is_vararg = true;
                    }
                }
                'L' => {
                    if let Some(p) = proto.as_deref() {
                        d.active_lines = Some(self.active_lines_table(p));
                    }
                }
                _ => {}
            }
        }
        Some(d)
    }

    fn active_lines_table(&mut self, proto: &Prototype) -> LuaValue {
        let t = self.new_table_sized(0, proto.line_info.len());
        if let Some(id) = t.as_table_id() {
            let table = self.pool.table_mut(id);
            for &line in &proto.line_info {
                let _ = table.raw_set(LuaValue::integer(line as i64), LuaValue::boolean(true));
            }
        }
        t
    }

    /// getlocal: the `n`-th local live at the frame's pc; negative `n`
    /// addresses varargs.
    pub fn get_local(&self, level: usize, n: i32) -> Option<(String, LuaValue)> {
        if n == 0 {
            return None;
        }
        let ci = self.frame_at(level)?;
        if ci.is_native() {
            return None;
        }
        if n < 0 {
            let idx = (-n - 1) as usize;
            let v = ci.varargs.get(idx).copied()?;
            return Some(("(*vararg)".to_string(), v));
        }
        let proto = self.frame_proto(&ci)?;
        let slot = ci.base + (n - 1) as usize;
        if !self.local_slot_live(level, &ci, slot) {
            return None;
        }
        let name = proto
            .local_name(ci.pc, n)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "(*temporary)".to_string());
        let v = self.th(self.current).stack.get(slot).copied()?;
        Some((name, v))
    }

    /// setlocal: write a live register slot; returns the variable name on
    /// success.
    pub fn set_local(&mut self, level: usize, n: i32, value: LuaValue) -> Option<String> {
        if n == 0 {
            return None;
        }
        let ci = self.frame_at(level)?;
        if ci.is_native() {
            return None;
        }
        if n < 0 {
            let idx = (-n - 1) as usize;
            let frames = &mut self.th_mut(self.current).frames;
            let pos = frames.len() - 1 - level;
            let slot = frames[pos].varargs.get_mut(idx)?;
            *slot = value;
            return Some("(*vararg)".to_string());
        }
        let proto = self.frame_proto(&ci)?;
        let slot = ci.base + (n - 1) as usize;
        if !self.local_slot_live(level, &ci, slot) {
            return None;
        }
        let name = proto
            .local_name(ci.pc, n)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "(*temporary)".to_string());
        let th = self.current;
        let thread = self.th_mut(th);
        if slot < thread.stack.len() {
            thread.stack[slot] = value;
            Some(name)
        } else {
            None
        }
    }

    /// A register is addressable while it sits below the next frame's base
    /// (or the frame's own top for the innermost frame).
    fn local_slot_live(&self, level: usize, ci: &CallInfo, slot: usize) -> bool {
        match self.frame_at(level.wrapping_sub(1)) {
            Some(next) if level > 0 => slot < next.func_pos(),
            _ => slot < ci.top,
        }
    }

    /// Read an upvalue of a closure by index (0-based).
    pub fn get_upvalue(&self, func: LuaValue, n: usize) -> Option<(String, LuaValue)> {
        let id = func.as_function_id()?;
        let cl = self.pool.closure(id);
        let uv = *cl.upvalues.get(n)?;
        let name = cl.proto.upvalue_name(n).to_string();
        Some((name, self.read_upvalue(uv)))
    }

    /// Write an upvalue of a closure by index (0-based).
    pub fn set_upvalue(&mut self, func: LuaValue, n: usize, value: LuaValue) -> Option<String> {
        let id = func.as_function_id()?;
        let cl = self.pool.closure(id);
        let uv = *cl.upvalues.get(n)?;
        let name = cl.proto.upvalue_name(n).to_string();
        self.write_upvalue(uv, value);
        Some(name)
    }

    /// Traceback positions of the current thread, innermost first.
    pub(crate) fn capture_traceback(&self) -> Vec<Position> {
        let mut out = Vec::new();
        let frames = &self.th(self.current).frames;
        for ci in frames.iter().rev() {
            match self.frame_proto(ci) {
                Some(proto) => {
                    out.push(Position {
                        source: format!("@{}", proto.short_source()),
                        line: current_line(ci, Some(&proto)),
                    });
                }
                None => {
                    out.push(Position {
                        source: "@[native]".to_string(),
                        line: -1,
                    });
                }
            }
        }
        out
    }

    /// The innermost Lua source position, for error message annotation.
    pub(crate) fn current_position(&self) -> Option<(String, i32)> {
        let frames = &self.th(self.current).frames;
        for ci in frames.iter().rev() {
            if let Some(proto) = self.frame_proto(ci) {
                return Some((
                    proto.short_source().to_string(),
                    current_line(ci, Some(&proto)),
                ));
            }
        }
        None
    }
}

fn current_line(ci: &CallInfo, proto: Option<&Prototype>) -> i32 {
    let Some(p) = proto else {
        return -1;
    };
    if p.line_info.is_empty() {
        return -1;
    }
    if ci.pc == 0 {
        return p.line_info[0] as i32;
    }
    p.line_at(ci.pc as usize - 1) as i32
}

fn set_func_info(d: &mut DebugInfo, proto: Option<&Prototype>) {
    match proto {
        None => {
            d.source = "=[native]".to_string();
            d.short_source = "[native]".to_string();
            d.line_defined = -1;
            d.last_line_defined = -1;
            d.what = "native";
        }
        Some(p) => {
            if p.source.is_empty() {
                d.source = "=?".to_string();
                d.short_source = "?".to_string();
            } else {
                d.source = p.source.clone();
                d.short_source = p.short_source().to_string();
            }
            d.line_defined = p.line_defined as i32;
            d.last_line_defined = p.last_line_defined as i32;
            d.what = if p.is_main() { "main" } else { "Lua" };
        }
    }
}

fn set_upvalue_info(vm: &LuaVM, d: &mut DebugInfo, ci: &CallInfo, proto: Option<&Prototype>) {
    match proto {
        None => {
            d.num_upvalues = 0;
            d.is_vararg = true;
            d.num_params = 0;
        }
        Some(p) => {
            if let Some(id) = ci.func.as_function_id() {
                d.num_upvalues = vm.pool.closure(id).num_upvalues() as u32;
            }
            d.is_vararg = p.is_vararg;
            d.num_params = p.num_params as u32;
        }
    }
}

/// Derive the called function's name from the caller's call site.
fn set_func_name(vm: &LuaVM, d: &mut DebugInfo, proto: &Prototype, pc: u32) {
    if pc == 0 {
        return;
    }
    let last = pc as usize - 1;
    let Some(&inst) = proto.code.get(last) else {
        return;
    };
    let tm = match Instruction::get_opcode(inst) {
        Some(OpCode::Call) | Some(OpCode::TailCall) => {
            let (name, what) =
                get_object_name(vm, proto, last, Instruction::get_a(inst) as usize);
            d.name = name;
            d.name_what = what;
            return;
        }
        Some(OpCode::TForCall) => {
            d.name = "for iterator".to_string();
            d.name_what = "for iterator";
            return;
        }
        Some(OpCode::SelfOp) | Some(OpCode::GetTabUp) | Some(OpCode::GetTable) => TmKind::Index,
        Some(OpCode::SetTabUp) | Some(OpCode::SetTable) => TmKind::NewIndex,
        Some(OpCode::Add) => TmKind::Add,
        Some(OpCode::Sub) => TmKind::Sub,
        Some(OpCode::Mul) => TmKind::Mul,
        Some(OpCode::Mod) => TmKind::Mod,
        Some(OpCode::Pow) => TmKind::Pow,
        Some(OpCode::Div) => TmKind::Div,
        Some(OpCode::IDiv) => TmKind::IDiv,
        Some(OpCode::BAnd) => TmKind::BAnd,
        Some(OpCode::BOr) => TmKind::BOr,
        Some(OpCode::BXor) => TmKind::BXor,
        Some(OpCode::Shl) => TmKind::Shl,
        Some(OpCode::Shr) => TmKind::Shr,
        Some(OpCode::Unm) => TmKind::Unm,
        Some(OpCode::BNot) => TmKind::BNot,
        Some(OpCode::Len) => TmKind::Len,
        Some(OpCode::Concat) => TmKind::Concat,
        Some(OpCode::Eq) => TmKind::Eq,
        Some(OpCode::Lt) => TmKind::Lt,
        Some(OpCode::Le) => TmKind::Le,
        _ => return,
    };
    d.name = tm.name().to_string();
    d.name_what = "metamethod";
}

fn get_object_name(
    vm: &LuaVM,
    proto: &Prototype,
    pc: usize,
    reg: usize,
) -> (String, &'static str) {
    if let Some(name) = proto.local_name(pc as u32, reg as i32 + 1) {
        return (name.to_string(), "local");
    }
    let rel = get_relative_pc(proto, pc, reg);
    let Some(rel) = rel else {
        return (String::new(), "");
    };
    let inst = proto.code[rel];
    match Instruction::get_opcode(inst) {
        Some(OpCode::Move) => {
            let b = Instruction::get_b(inst) as usize;
            if b < Instruction::get_a(inst) as usize {
                return get_object_name(vm, proto, rel, b);
            }
            (String::new(), "")
        }
        Some(OpCode::GetTabUp) => {
            let t = Instruction::get_b(inst) as usize;
            let key = Instruction::get_c(inst);
            let name = get_rk_name(vm, proto, rel, key);
            if proto.upvalue_name(t) == "_ENV" {
                (name, "global")
            } else {
                (name, "field")
            }
        }
        Some(OpCode::GetTable) => {
            let t = Instruction::get_b(inst) as usize;
            let key = Instruction::get_c(inst);
            let name = get_rk_name(vm, proto, rel, key);
            if proto.local_name(rel as u32, t as i32 + 1) == Some("_ENV") {
                (name, "global")
            } else {
                (name, "field")
            }
        }
        Some(OpCode::GetUpval) => (
            proto
                .upvalue_name(Instruction::get_b(inst) as usize)
                .to_string(),
            "upvalue",
        ),
        Some(OpCode::LoadK) => {
            let bx = Instruction::get_bx(inst) as usize;
            (constant_string(vm, proto, bx), "constant")
        }
        Some(OpCode::LoadKx) => {
            let ax = proto
                .code
                .get(rel + 1)
                .map(|&i| Instruction::get_ax(i) as usize)
                .unwrap_or(usize::MAX);
            (constant_string(vm, proto, ax), "constant")
        }
        Some(OpCode::SelfOp) => {
            let key = Instruction::get_c(inst);
            (get_rk_name(vm, proto, rel, key), "method")
        }
        _ => (String::new(), ""),
    }
}

fn constant_string(vm: &LuaVM, proto: &Prototype, index: usize) -> String {
    match proto.constants.get(index) {
        Some(LuaValue::String(id)) => vm.pool.string(*id).display().into_owned(),
        _ => String::new(),
    }
}

fn get_rk_name(vm: &LuaVM, proto: &Prototype, pc: usize, rk: u32) -> String {
    if Instruction::is_k(rk) {
        let idx = Instruction::rk_index(rk) as usize;
        let s = constant_string(vm, proto, idx);
        if !s.is_empty() {
            return s;
        }
    } else {
        let (name, what) = get_object_name(vm, proto, pc, rk as usize);
        if what == "constant" {
            return name;
        }
    }
    "?".to_string()
}

/// Find the instruction that last set register `n` before `lastpc`,
/// invalidating candidates that a jump target could bypass.
fn get_relative_pc(proto: &Prototype, lastpc: usize, n: usize) -> Option<usize> {
    let mut rel: Option<usize> = None;
    let mut jmp_dest = 0usize;

    for pc in 0..lastpc {
        let inst = proto.code[pc];
        let Some(op) = Instruction::get_opcode(inst) else {
            continue;
        };
        let a = Instruction::get_a(inst) as usize;
        let hit = match op {
            OpCode::LoadNil => {
                let b = Instruction::get_b(inst) as usize;
                a <= n && n <= a + b
            }
            OpCode::TForCall => n >= a + 2,
            OpCode::Call | OpCode::TailCall => n >= a,
            OpCode::Jmp => {
                let sbx = Instruction::get_sbx(inst);
                let dest = (pc as i64 + 1 + sbx as i64) as usize;
                if pc < dest && dest <= lastpc && dest > jmp_dest {
                    jmp_dest = dest;
                }
                false
            }
            op => op.sets_register_a() && n == a,
        };
        if hit {
            rel = if pc < jmp_dest { None } else { Some(pc) };
        }
    }
    rel
}
