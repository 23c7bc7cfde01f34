// The execute loop: a single dispatch switch over the Lua 5.3 opcode set.
//
// Outer loop ('startfunc) reloads the frame context after every call or
// return; the inner loop fetches and dispatches instructions. Lua-to-Lua
// calls stay inside this one host frame. The loop runs until the thread's
// call depth drops to `target_depth`, which is how protected calls and
// coroutine bodies bound their execution.

pub(crate) mod arith;
pub(crate) mod call;
pub(crate) mod concat;
pub(crate) mod metamethod;

pub use metamethod::{MAX_TAG_LOOP, TM_N, TM_NAMES, TmKind};

pub(crate) use call::CallAction;

use std::rc::Rc;

use crate::gc::ThreadId;
use crate::lua_value::{LuaValue, Prototype};
use crate::lua_vm::opcode::Instruction;
use crate::lua_vm::{LuaResult, LuaVM, OpCode};

/// Run the thread's top frame until its call depth returns to
/// `target_depth`; the boundary frame's results are collected and returned.
pub(crate) fn lua_execute(
    vm: &mut LuaVM,
    th: ThreadId,
    target_depth: usize,
) -> LuaResult<Vec<LuaValue>> {
    'startfunc: loop {
        debug_assert!(vm.th(th).frames.len() > target_depth);

        // ===== Load frame context =====
        let (func, mut base) = {
            let ci = vm.th(th).frames.last().expect("execute without a frame");
            (ci.func, ci.base)
        };
        let closure_id = match func.as_function_id() {
            Some(id) => id,
            None => return Err(vm.bytecode_error("active frame is not a Lua closure")),
        };
        let proto: Rc<Prototype> = vm.pool.closure(closure_id).proto.clone();
        let upvalues: Vec<crate::gc::UpvalueId> = vm.pool.closure(closure_id).upvalues.clone();
        let mut pc = vm.th(th).frames.last().map(|ci| ci.pc as usize).unwrap_or(0);

        macro_rules! reg {
            ($i:expr) => {
                vm.th(th).stack[base + $i]
            };
        }
        macro_rules! set_reg {
            ($i:expr, $v:expr) => {{
                let v = $v;
                vm.th_mut(th).stack[base + $i] = v;
            }};
        }

        // ===== Dispatch =====
        loop {
            let inst = match proto.code.get(pc) {
                Some(&i) => i,
                None => return Err(vm.bytecode_error("program counter out of range")),
            };
            if vm.th(th).hook.is_some() {
                vm.set_frame_pc(th, pc as u32);
                vm.fire_instruction_hooks(th, &proto, pc)?;
                // A hook may legitimately grow the stack.
                base = vm.th(th).frames.last().map(|ci| ci.base).unwrap_or(base);
            }
            pc += 1;
            vm.set_frame_pc(th, pc as u32);

            let op = match Instruction::get_opcode(inst) {
                Some(op) => op,
                None => return Err(vm.bytecode_error("invalid opcode")),
            };
            let a = Instruction::get_a(inst) as usize;

            match op {
                OpCode::Move => {
                    let b = Instruction::get_b(inst) as usize;
                    set_reg!(a, reg!(b));
                }
                OpCode::LoadK => {
                    let bx = Instruction::get_bx(inst) as usize;
                    let k = vm.constant(&proto, bx)?;
                    set_reg!(a, k);
                }
                OpCode::LoadKx => {
                    let extra = match proto.code.get(pc) {
                        Some(&i) if Instruction::get_opcode(i) == Some(OpCode::ExtraArg) => i,
                        _ => return Err(vm.bytecode_error("LOADKX not followed by EXTRAARG")),
                    };
                    pc += 1;
                    let k = vm.constant(&proto, Instruction::get_ax(extra) as usize)?;
                    set_reg!(a, k);
                }
                OpCode::LoadBool => {
                    let b = Instruction::get_b(inst);
                    let c = Instruction::get_c(inst);
                    set_reg!(a, LuaValue::boolean(b != 0));
                    if c != 0 {
                        pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    let b = Instruction::get_b(inst) as usize;
                    for i in a..=a + b {
                        set_reg!(i, LuaValue::Nil);
                    }
                }
                OpCode::GetUpval => {
                    let b = Instruction::get_b(inst) as usize;
                    let v = vm.read_upvalue(upvalues[b]);
                    set_reg!(a, v);
                }
                OpCode::SetUpval => {
                    let b = Instruction::get_b(inst) as usize;
                    let v = reg!(a);
                    vm.write_upvalue(upvalues[b], v);
                }
                OpCode::GetTabUp => {
                    let b = Instruction::get_b(inst) as usize;
                    let t = vm.read_upvalue(upvalues[b]);
                    let key = vm.get_rk(th, base, &proto, Instruction::get_c(inst))?;
                    let v = vm.table_get_with_meta(t, key)?;
                    set_reg!(a, v);
                }
                OpCode::GetTable => {
                    let b = Instruction::get_b(inst) as usize;
                    let t = reg!(b);
                    let key = vm.get_rk(th, base, &proto, Instruction::get_c(inst))?;
                    let v = vm.table_get_with_meta(t, key)?;
                    set_reg!(a, v);
                }
                OpCode::SetTabUp => {
                    let t = vm.read_upvalue(upvalues[a]);
                    let key = vm.get_rk(th, base, &proto, Instruction::get_b(inst))?;
                    let val = vm.get_rk(th, base, &proto, Instruction::get_c(inst))?;
                    vm.table_set_with_meta(t, key, val)?;
                }
                OpCode::SetTable => {
                    let t = reg!(a);
                    let key = vm.get_rk(th, base, &proto, Instruction::get_b(inst))?;
                    let val = vm.get_rk(th, base, &proto, Instruction::get_c(inst))?;
                    vm.table_set_with_meta(t, key, val)?;
                }
                OpCode::NewTable => {
                    let narr = Instruction::fb2int(Instruction::get_b(inst)) as usize;
                    let nhash = Instruction::fb2int(Instruction::get_c(inst)) as usize;
                    let t = vm.new_table_sized(narr, nhash);
                    set_reg!(a, t);
                }
                OpCode::SelfOp => {
                    let b = Instruction::get_b(inst) as usize;
                    let t = reg!(b);
                    let key = vm.get_rk(th, base, &proto, Instruction::get_c(inst))?;
                    let v = vm.table_get_with_meta(t, key)?;
                    set_reg!(a + 1, t);
                    set_reg!(a, v);
                }
                OpCode::Add => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_add(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::Sub => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_sub(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::Mul => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_mul(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::Mod => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_mod(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::Pow => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_pow(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::Div => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_div(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::IDiv => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_idiv(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::BAnd => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_band(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::BOr => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_bor(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::BXor => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_bxor(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::Shl => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_shl(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::Shr => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let v = arith::call_shr(vm, rb, rc)?;
                    set_reg!(a, v);
                }
                OpCode::Unm => {
                    let b = Instruction::get_b(inst) as usize;
                    let rb = reg!(b);
                    let v = arith::call_unm(vm, rb)?;
                    set_reg!(a, v);
                }
                OpCode::BNot => {
                    let b = Instruction::get_b(inst) as usize;
                    let rb = reg!(b);
                    let v = arith::call_bnot(vm, rb)?;
                    set_reg!(a, v);
                }
                OpCode::Not => {
                    let b = Instruction::get_b(inst) as usize;
                    set_reg!(a, LuaValue::boolean(reg!(b).is_falsy()));
                }
                OpCode::Len => {
                    let b = Instruction::get_b(inst) as usize;
                    let rb = reg!(b);
                    let v = arith::call_len(vm, rb)?;
                    set_reg!(a, v);
                }
                OpCode::Concat => {
                    let b = Instruction::get_b(inst) as usize;
                    let c = Instruction::get_c(inst) as usize;
                    let mut acc = reg!(c);
                    for r in (b..c).rev() {
                        let rr = reg!(r);
                        acc = concat::call_concat(vm, rr, acc)?;
                    }
                    set_reg!(a, acc);
                }
                OpCode::Jmp => {
                    vm.do_jmp(th, base, inst, &mut pc);
                }
                OpCode::Eq => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let res = arith::call_equal(vm, rb, rc)?;
                    vm.cond_jump(th, base, &proto, res != (a != 0), &mut pc)?;
                }
                OpCode::Lt => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let res = arith::call_less_than(vm, rb, rc)?;
                    vm.cond_jump(th, base, &proto, res != (a != 0), &mut pc)?;
                }
                OpCode::Le => {
                    let (rb, rc) = vm.get_rk2(th, base, &proto, inst)?;
                    let res = arith::call_less_equal(vm, rb, rc)?;
                    vm.cond_jump(th, base, &proto, res != (a != 0), &mut pc)?;
                }
                OpCode::Test => {
                    let c = Instruction::get_c(inst);
                    let skip = reg!(a).is_truthy() != (c != 0);
                    vm.cond_jump(th, base, &proto, skip, &mut pc)?;
                }
                OpCode::TestSet => {
                    let b = Instruction::get_b(inst) as usize;
                    let c = Instruction::get_c(inst);
                    let rb = reg!(b);
                    if rb.is_truthy() != (c != 0) {
                        pc += 1;
                    } else {
                        set_reg!(a, rb);
                        vm.cond_jump(th, base, &proto, false, &mut pc)?;
                    }
                }
                OpCode::Call => {
                    let b = Instruction::get_b(inst) as usize;
                    let c = Instruction::get_c(inst) as usize;
                    let func_pos = base + a;
                    let nargs = if b == 0 {
                        let top = vm.th(th).frames.last().map(|ci| ci.top).unwrap_or(0);
                        top.saturating_sub(func_pos + 1)
                    } else {
                        b - 1
                    };
                    let nresults = c as i32 - 1;
                    match vm.do_call(th, func_pos, nargs, nresults)? {
                        CallAction::Pushed => continue 'startfunc,
                        CallAction::NativeDone => {}
                    }
                }
                OpCode::TailCall => {
                    let b = Instruction::get_b(inst) as usize;
                    let func_pos = base + a;
                    let nargs = if b == 0 {
                        let top = vm.th(th).frames.last().map(|ci| ci.top).unwrap_or(0);
                        top.saturating_sub(func_pos + 1)
                    } else {
                        b - 1
                    };
                    match vm.do_tailcall(th, func_pos, nargs, target_depth)? {
                        Some(results) => return Ok(results),
                        None => continue 'startfunc,
                    }
                }
                OpCode::Return => {
                    let b = Instruction::get_b(inst) as usize;
                    let nrets = if b == 0 { None } else { Some(b - 1) };
                    match vm.do_return(th, base + a, nrets, target_depth)? {
                        Some(results) => return Ok(results),
                        None => continue 'startfunc,
                    }
                }
                OpCode::ForLoop => {
                    let sbx = Instruction::get_sbx(inst);
                    if let LuaValue::Integer(idx) = reg!(a) {
                        let step = reg!(a + 2).as_integer_strict().unwrap_or(0);
                        let limit = reg!(a + 1).as_integer_strict().unwrap_or(0);
                        // checked add: stepping past the integer range ends
                        // the loop instead of wrapping into an endless one
                        if let Some(next) = idx.checked_add(step) {
                            let cont = if step > 0 { next <= limit } else { next >= limit };
                            if cont {
                                set_reg!(a, LuaValue::integer(next));
                                set_reg!(a + 3, LuaValue::integer(next));
                                pc = offset_pc(pc, sbx);
                            }
                        }
                    } else {
                        let idx = reg!(a).as_number().unwrap_or(f64::NAN);
                        let limit = reg!(a + 1).as_number().unwrap_or(f64::NAN);
                        let step = reg!(a + 2).as_number().unwrap_or(f64::NAN);
                        let next = idx + step;
                        let cont = if step > 0.0 { next <= limit } else { next >= limit };
                        if cont {
                            set_reg!(a, LuaValue::float(next));
                            set_reg!(a + 3, LuaValue::float(next));
                            pc = offset_pc(pc, sbx);
                        }
                    }
                }
                OpCode::ForPrep => {
                    let sbx = Instruction::get_sbx(inst);
                    vm.for_prep(th, base, a)?;
                    pc = offset_pc(pc, sbx);
                }
                OpCode::TForCall => {
                    let c = Instruction::get_c(inst) as usize;
                    match proto.code.get(pc) {
                        Some(&i) if Instruction::get_opcode(i) == Some(OpCode::TForLoop) => {}
                        _ => return Err(vm.bytecode_error("TFORCALL not followed by TFORLOOP")),
                    }
                    {
                        let thread = vm.th_mut(th);
                        thread.ensure_stack(base + a + 6);
                        let f = thread.stack[base + a];
                        let s = thread.stack[base + a + 1];
                        let ctrl = thread.stack[base + a + 2];
                        thread.stack[base + a + 3] = f;
                        thread.stack[base + a + 4] = s;
                        thread.stack[base + a + 5] = ctrl;
                    }
                    match vm.do_call(th, base + a + 3, 2, c as i32)? {
                        CallAction::Pushed => continue 'startfunc,
                        CallAction::NativeDone => {}
                    }
                }
                OpCode::TForLoop => {
                    let sbx = Instruction::get_sbx(inst);
                    let ctrl = reg!(a + 1);
                    if !ctrl.is_nil() {
                        set_reg!(a, ctrl);
                        pc = offset_pc(pc, sbx);
                    }
                }
                OpCode::SetList => {
                    let b = Instruction::get_b(inst) as usize;
                    let mut c = Instruction::get_c(inst) as usize;
                    if c == 0 {
                        let extra = match proto.code.get(pc) {
                            Some(&i) if Instruction::get_opcode(i) == Some(OpCode::ExtraArg) => i,
                            _ => return Err(vm.bytecode_error("SETLIST not followed by EXTRAARG")),
                        };
                        pc += 1;
                        vm.set_frame_pc(th, pc as u32);
                        c = Instruction::get_ax(extra) as usize;
                    }
                    let n = if b == 0 {
                        let top = vm.th(th).frames.last().map(|ci| ci.top).unwrap_or(0);
                        top.saturating_sub(base + a + 1)
                    } else {
                        b
                    };
                    let Some(tid) = reg!(a).as_table_id() else {
                        return Err(vm.bytecode_error("SETLIST target is not a table"));
                    };
                    let block = (c as i64 - 1) * Instruction::FIELDS_PER_FLUSH as i64;
                    let values = vm.th(th).stack[base + a + 1..base + a + 1 + n].to_vec();
                    vm.pool.table_mut(tid).set_list(block, &values);
                }
                OpCode::Closure => {
                    let bx = Instruction::get_bx(inst) as usize;
                    let Some(nested) = proto.protos.get(bx).cloned() else {
                        return Err(vm.bytecode_error("CLOSURE prototype index out of range"));
                    };
                    let v = vm.instantiate_closure(th, base, &nested, &upvalues)?;
                    set_reg!(a, v);
                }
                OpCode::Vararg => {
                    let b = Instruction::get_b(inst) as usize;
                    let varargs = vm
                        .th(th)
                        .frames
                        .last()
                        .map(|ci| ci.varargs.clone())
                        .unwrap_or_default();
                    let n = if b == 0 { varargs.len() } else { b - 1 };
                    let thread = vm.th_mut(th);
                    thread.ensure_stack(base + a + n);
                    for i in 0..n {
                        thread.stack[base + a + i] =
                            varargs.get(i).copied().unwrap_or(LuaValue::Nil);
                    }
                    if b == 0 {
                        if let Some(ci) = thread.frames.last_mut() {
                            ci.top = base + a + n;
                        }
                    }
                }
                OpCode::ExtraArg => {
                    return Err(vm.bytecode_error("stray EXTRAARG"));
                }
            }
        }
    }
}

#[inline(always)]
fn offset_pc(pc: usize, sbx: i32) -> usize {
    (pc as i64 + sbx as i64) as usize
}

impl LuaVM {
    fn constant(&mut self, proto: &Prototype, index: usize) -> LuaResult<LuaValue> {
        match proto.constants.get(index) {
            Some(&k) => Ok(k),
            None => Err(self.bytecode_error("constant index out of range")),
        }
    }

    /// Decode an RK operand: constant-bank bit selects the constants.
    fn get_rk(
        &mut self,
        th: ThreadId,
        base: usize,
        proto: &Prototype,
        x: u32,
    ) -> LuaResult<LuaValue> {
        if Instruction::is_k(x) {
            self.constant(proto, Instruction::rk_index(x) as usize)
        } else {
            Ok(self.th(th).stack[base + x as usize])
        }
    }

    fn get_rk2(
        &mut self,
        th: ThreadId,
        base: usize,
        proto: &Prototype,
        inst: u32,
    ) -> LuaResult<(LuaValue, LuaValue)> {
        let rb = self.get_rk(th, base, proto, Instruction::get_b(inst))?;
        let rc = self.get_rk(th, base, proto, Instruction::get_c(inst))?;
        Ok((rb, rc))
    }

    /// JMP: signed pc offset; a non-zero A closes upvalues at or above
    /// base + A - 1.
    fn do_jmp(&mut self, th: ThreadId, base: usize, inst: u32, pc: &mut usize) {
        let a = Instruction::get_a(inst) as usize;
        if a > 0 {
            self.close_upvalues(th, base + a - 1);
        }
        *pc = offset_pc(*pc, Instruction::get_sbx(inst));
        self.set_frame_pc(th, *pc as u32);
    }

    /// A conditional test either skips the following JMP or executes it.
    fn cond_jump(
        &mut self,
        th: ThreadId,
        base: usize,
        proto: &Prototype,
        skip: bool,
        pc: &mut usize,
    ) -> LuaResult<()> {
        if skip {
            *pc += 1;
            self.set_frame_pc(th, *pc as u32);
            return Ok(());
        }
        let jmp = match proto.code.get(*pc) {
            Some(&i) if Instruction::get_opcode(i) == Some(OpCode::Jmp) => i,
            _ => return Err(self.bytecode_error("conditional test not followed by JMP")),
        };
        *pc += 1;
        self.do_jmp(th, base, jmp, pc);
        Ok(())
    }

    /// FORPREP: normalize the control values, pre-subtract the step.
    ///
    /// When init and step are integers but the limit is a non-integer
    /// number, the limit is clamped with floor (positive step) or ceil
    /// (negative step) into the i64 range; a limit wholly outside the
    /// iteration direction forces an empty loop.
    fn for_prep(&mut self, th: ThreadId, base: usize, a: usize) -> LuaResult<()> {
        const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
        let init = self.th(th).stack[base + a];
        let limit = self.th(th).stack[base + a + 1];
        let step = self.th(th).stack[base + a + 2];

        if let (LuaValue::Integer(iinit), LuaValue::Integer(istep)) = (init, step) {
            if istep == 0 {
                return Err(self.error_str("'for' step is zero"));
            }
            let resolved: Option<(i64, i64)> = match limit {
                LuaValue::Integer(l) => Some((iinit, l)),
                _ => match arith::to_number(self, &limit) {
                    Some(nl) => {
                        let f = if istep > 0 { nl.floor() } else { nl.ceil() };
                        if f.is_nan() {
                            None
                        } else if istep > 0 && f < -TWO_POW_63 {
                            // limit below every integer: never runs
                            Some((0, i64::MIN))
                        } else if istep > 0 && f >= TWO_POW_63 {
                            Some((iinit, i64::MAX))
                        } else if istep < 0 && f >= TWO_POW_63 {
                            // limit above every integer: never runs
                            Some((0, i64::MAX))
                        } else if istep < 0 && f < -TWO_POW_63 {
                            Some((iinit, i64::MIN))
                        } else {
                            Some((iinit, f as i64))
                        }
                    }
                    None => None,
                },
            };
            match resolved {
                Some((start, ilimit)) => {
                    let thread = self.th_mut(th);
                    thread.stack[base + a] = LuaValue::integer(start.wrapping_sub(istep));
                    thread.stack[base + a + 1] = LuaValue::integer(ilimit);
                    return Ok(());
                }
                None => {
                    if arith::to_number(self, &limit).is_none() {
                        return Err(self.error_str("'for' limit must be a number"));
                    }
                    // NaN limit: loop never runs; fall through to float form.
                }
            }
        }

        let Some(ninit) = arith::to_number(self, &init) else {
            return Err(self.error_str("'for' initial value must be a number"));
        };
        let Some(nlimit) = arith::to_number(self, &limit) else {
            return Err(self.error_str("'for' limit must be a number"));
        };
        let Some(nstep) = arith::to_number(self, &step) else {
            return Err(self.error_str("'for' step must be a number"));
        };
        if nstep == 0.0 {
            return Err(self.error_str("'for' step is zero"));
        }
        let thread = self.th_mut(th);
        thread.stack[base + a] = LuaValue::float(ninit - nstep);
        thread.stack[base + a + 1] = LuaValue::float(nlimit);
        thread.stack[base + a + 2] = LuaValue::float(nstep);
        Ok(())
    }

    /// CLOSURE: instantiate a nested prototype, resolving each upvalue
    /// descriptor against the running frame.
    fn instantiate_closure(
        &mut self,
        th: ThreadId,
        base: usize,
        nested: &Rc<Prototype>,
        parent_upvalues: &[crate::gc::UpvalueId],
    ) -> LuaResult<LuaValue> {
        use crate::lua_value::{LuaClosure, UpvalKind};
        let mut upvals = Vec::with_capacity(nested.upvalues.len());
        for desc in &nested.upvalues {
            let uv = match desc.kind {
                UpvalKind::Local => self.find_or_create_upvalue(th, base + desc.index as usize),
                UpvalKind::Upvalue => match parent_upvalues.get(desc.index as usize) {
                    Some(&id) => id,
                    None => {
                        return Err(self.bytecode_error("upvalue descriptor out of range"));
                    }
                },
            };
            upvals.push(uv);
        }
        let id = self
            .pool
            .create_closure(LuaClosure::new(nested.clone(), upvals));
        Ok(LuaValue::Function(id))
    }
}
