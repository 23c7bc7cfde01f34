// Call protocol: frame setup, native invocation, tail calls and returns.
//
// Lua-to-Lua calls never recurse on the host stack: CALL pushes a frame and
// the dispatch loop re-enters it. Host re-entry happens only for native
// functions, metamethods, hooks and protected calls, bounded by the
// native-recursion ceiling.

use crate::gc::ThreadId;
use crate::lua_value::{LuaValue, PendingCall};
use crate::lua_vm::execute::{MAX_TAG_LOOP, TmKind, lua_execute};
use crate::lua_vm::{CallInfo, LuaError, LuaResult, LuaVM};

pub(crate) enum CallAction {
    /// A Lua frame was pushed; the dispatch loop must reload.
    Pushed,
    /// A native function ran to completion; results are in place.
    NativeDone,
}

impl LuaVM {
    /// Resolve the `__call` chain at `func_pos`, shifting arguments right for
    /// each prepended handler. Returns the updated argument count.
    fn resolve_callable_on_stack(
        &mut self,
        th: ThreadId,
        func_pos: usize,
        mut nargs: usize,
    ) -> LuaResult<usize> {
        for _ in 0..MAX_TAG_LOOP {
            let func = self.th(th).stack[func_pos];
            if func.is_function() {
                return Ok(nargs);
            }
            let Some(handler) = self.get_metamethod(&func, TmKind::Call) else {
                return Err(self.error_str(format!(
                    "attempt to call a {} value",
                    func.type_name()
                )));
            };
            let thread = self.th_mut(th);
            thread.ensure_stack(func_pos + nargs + 2);
            for i in (func_pos..=func_pos + nargs).rev() {
                thread.stack[i + 1] = thread.stack[i];
            }
            thread.stack[func_pos] = handler;
            nargs += 1;
        }
        Err(self.error_str("'__call' chain too long; possible loop"))
    }

    /// CALL: invoke the value at `func_pos` with `nargs` arguments, expecting
    /// `nresults` (-1 = all).
    pub(crate) fn do_call(
        &mut self,
        th: ThreadId,
        func_pos: usize,
        nargs: usize,
        nresults: i32,
    ) -> LuaResult<CallAction> {
        let nargs = self.resolve_callable_on_stack(th, func_pos, nargs)?;
        let func = self.th(th).stack[func_pos];
        match func {
            LuaValue::NativeFn(f) => {
                let args = {
                    let thread = self.th_mut(th);
                    thread.ensure_stack(func_pos + 1 + nargs);
                    thread.stack[func_pos + 1..func_pos + 1 + nargs].to_vec()
                };
                self.th_mut(th)
                    .frames
                    .push(CallInfo::new_native(func, func_pos + 1, nresults));
                self.fire_call_hook(th, false)?;
                match f(self, &args) {
                    Ok(results) => {
                        self.fire_return_hook(th)?;
                        self.th_mut(th).frames.pop();
                        self.place_results(th, func_pos, &results, nresults);
                        Ok(CallAction::NativeDone)
                    }
                    Err(LuaError::Yield) => {
                        let thread = self.th_mut(th);
                        thread.frames.pop();
                        thread.pending = Some(PendingCall {
                            dest: func_pos,
                            nresults,
                        });
                        Err(LuaError::Yield)
                    }
                    Err(e) => Err(e),
                }
            }
            LuaValue::Function(_) => {
                self.push_lua_frame(th, func_pos, nargs, nresults)?;
                self.fire_call_hook(th, false)?;
                Ok(CallAction::Pushed)
            }
            _ => Err(self.error_str(format!(
                "attempt to call a {} value",
                func.type_name()
            ))),
        }
    }

    /// Activate the Lua closure sitting at `func_pos`.
    pub(crate) fn push_lua_frame(
        &mut self,
        th: ThreadId,
        func_pos: usize,
        nargs: usize,
        nresults: i32,
    ) -> LuaResult<()> {
        if self.th(th).frames.len() >= self.options.max_call_depth {
            return Err(self.error_str("stack overflow"));
        }
        let func = self.th(th).stack[func_pos];
        let id = func
            .as_function_id()
            .expect("push_lua_frame on a non-closure");
        let proto = self.pool.closure(id).proto.clone();
        let nparams = proto.num_params as usize;
        let max_stack = proto.max_stack_size as usize;
        let base = func_pos + 1;

        if base + max_stack > self.options.max_stack_size {
            return Err(self.error_str("stack overflow"));
        }

        let thread = self.th_mut(th);
        thread.ensure_stack(base + nargs.max(nparams));
        let varargs = if proto.is_vararg && nargs > nparams {
            thread.stack[base + nparams..base + nargs].to_vec()
        } else {
            Vec::new()
        };
        thread.ensure_stack(base + max_stack);
        // Registers beyond the fixed parameters start out nil; this also
        // clears stale slots left by earlier frames.
        for slot in &mut thread.stack[base + nparams..base + max_stack] {
            *slot = LuaValue::Nil;
        }
        let mut ci = CallInfo::new_lua(func, base, base + max_stack, nresults);
        ci.varargs = varargs;
        thread.frames.push(ci);
        Ok(())
    }

    /// TAILCALL: replace the current frame with a call to the value at
    /// `func_pos`. Returns None when the callee is a Lua closure (the loop
    /// re-enters it) or the boundary results when a native callee finished
    /// the frame.
    pub(crate) fn do_tailcall(
        &mut self,
        th: ThreadId,
        func_pos: usize,
        nargs: usize,
        target_depth: usize,
    ) -> LuaResult<Option<Vec<LuaValue>>> {
        let nargs = self.resolve_callable_on_stack(th, func_pos, nargs)?;
        let func = self.th(th).stack[func_pos];
        let (cur_func_pos, cur_nresults) = {
            let ci = self.th(th).frames.last().expect("tailcall without a frame");
            (ci.func_pos(), ci.nresults)
        };
        // The frame being replaced is done with its locals.
        let base = self.th(th).frames.last().map(|ci| ci.base).unwrap_or(0);
        self.close_upvalues(th, base);

        match func {
            LuaValue::NativeFn(f) => {
                let args = {
                    let thread = self.th_mut(th);
                    thread.ensure_stack(func_pos + 1 + nargs);
                    thread.stack[func_pos + 1..func_pos + 1 + nargs].to_vec()
                };
                self.th_mut(th)
                    .frames
                    .push(CallInfo::new_native(func, func_pos + 1, cur_nresults));
                self.fire_call_hook(th, true)?;
                let r = f(self, &args);
                match r {
                    Ok(results) => {
                        self.fire_return_hook(th)?;
                        self.th_mut(th).frames.pop();
                        self.finish_return(th, results, target_depth)
                    }
                    Err(LuaError::Yield) => {
                        // A tail-called native that yields resumes into the
                        // caller's result window.
                        let thread = self.th_mut(th);
                        thread.frames.pop();
                        thread.pending = Some(PendingCall {
                            dest: cur_func_pos,
                            nresults: cur_nresults,
                        });
                        // The replaced frame is gone for good.
                        self.pop_frame_for_tail(th);
                        Err(LuaError::Yield)
                    }
                    Err(e) => Err(e),
                }
            }
            LuaValue::Function(_) => {
                // Shift func + args down over the current frame.
                {
                    let thread = self.th_mut(th);
                    thread.ensure_stack(func_pos + 1 + nargs);
                    for i in 0..=nargs {
                        thread.stack[cur_func_pos + i] = thread.stack[func_pos + i];
                    }
                    thread.frames.pop();
                }
                self.push_lua_frame(th, cur_func_pos, nargs, cur_nresults)?;
                if let Some(ci) = self.th_mut(th).frames.last_mut() {
                    ci.set_tail();
                }
                self.fire_call_hook(th, true)?;
                Ok(None)
            }
            _ => Err(self.error_str(format!(
                "attempt to call a {} value",
                func.type_name()
            ))),
        }
    }

    fn pop_frame_for_tail(&mut self, th: ThreadId) {
        self.th_mut(th).frames.pop();
    }

    /// RETURN: close upvalues, pop the frame and route results. Returns
    /// Some(results) when the popped frame was the protected boundary.
    pub(crate) fn do_return(
        &mut self,
        th: ThreadId,
        first_result: usize,
        nrets: Option<usize>,
        target_depth: usize,
    ) -> LuaResult<Option<Vec<LuaValue>>> {
        let base = self.th(th).frames.last().expect("return without a frame").base;
        self.close_upvalues(th, base);
        self.fire_return_hook(th)?;
        let n = match nrets {
            Some(n) => n,
            None => {
                let top = self.th(th).frames.last().map(|ci| ci.top).unwrap_or(first_result);
                top.saturating_sub(first_result)
            }
        };
        let results = {
            let thread = self.th_mut(th);
            thread.ensure_stack(first_result + n);
            thread.stack[first_result..first_result + n].to_vec()
        };
        self.finish_return(th, results, target_depth)
    }

    /// Pop the current frame and deliver `results` to the caller (or out of
    /// the loop when the boundary is reached).
    pub(crate) fn finish_return(
        &mut self,
        th: ThreadId,
        results: Vec<LuaValue>,
        target_depth: usize,
    ) -> LuaResult<Option<Vec<LuaValue>>> {
        let ci = self
            .th_mut(th)
            .frames
            .pop()
            .expect("finish_return without a frame");
        if self.th(th).frames.len() == target_depth {
            return Ok(Some(results));
        }
        self.place_results(th, ci.func_pos(), &results, ci.nresults);
        Ok(None)
    }

    /// Write a result vector into a call's destination window, truncating or
    /// nil-padding to `nresults` (-1 = all, adjusting the caller's top).
    pub(crate) fn place_results(
        &mut self,
        th: ThreadId,
        dest: usize,
        results: &[LuaValue],
        nresults: i32,
    ) {
        let want = if nresults < 0 {
            results.len()
        } else {
            nresults as usize
        };
        let thread = self.th_mut(th);
        thread.ensure_stack(dest + want);
        for i in 0..want {
            thread.stack[dest + i] = results.get(i).copied().unwrap_or(LuaValue::Nil);
        }
        if nresults < 0 {
            if let Some(ci) = thread.frames.last_mut() {
                ci.top = dest + want;
            }
        }
    }

    // ============ Host-level calls ============

    pub(crate) fn enter_native(&mut self) -> LuaResult<()> {
        let th = self.current;
        if self.th(th).native_depth >= self.options.max_native_recursion {
            return Err(self.error_str("stack overflow"));
        }
        self.th_mut(th).native_depth += 1;
        Ok(())
    }

    pub(crate) fn leave_native(&mut self) {
        let th = self.current;
        self.th_mut(th).native_depth -= 1;
    }

    /// Invoke any callable with a vector of arguments and collect all its
    /// results. Frames pushed under this call are unwound (closing upvalues)
    /// if an error escapes.
    pub fn call_value(&mut self, f: LuaValue, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
        self.enter_native()?;
        let r = self.call_value_inner(f, args);
        self.leave_native();
        r
    }

    fn call_value_inner(&mut self, mut f: LuaValue, mut args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
        let th = self.current;
        // Resolve __call chains at the vector level.
        let mut guard = 0;
        while !f.is_function() {
            let Some(handler) = self.get_metamethod(&f, TmKind::Call) else {
                return Err(self.error_str(format!(
                    "attempt to call a {} value",
                    f.type_name()
                )));
            };
            args.insert(0, f);
            f = handler;
            guard += 1;
            if guard >= MAX_TAG_LOOP {
                return Err(self.error_str("'__call' chain too long; possible loop"));
            }
        }
        if let LuaValue::NativeFn(nf) = f {
            let func_pos = self.th(th).stack.len();
            self.th_mut(th)
                .frames
                .push(CallInfo::new_native(f, func_pos + 1, -1));
            let r = nf(self, &args);
            self.th_mut(th).frames.pop();
            return r;
        }

        let base_depth = self.th(th).frames.len();
        let func_pos = self.th(th).stack.len();
        {
            let thread = self.th_mut(th);
            thread.stack.push(f);
            thread.stack.extend_from_slice(&args);
        }
        let nargs = args.len();
        match self.push_lua_frame(th, func_pos, nargs, -1) {
            Ok(()) => {}
            Err(e) => {
                self.th_mut(th).stack.truncate(func_pos);
                return Err(e);
            }
        }
        self.fire_call_hook(th, false)?;
        match lua_execute(self, th, base_depth) {
            Ok(results) => {
                self.th_mut(th).stack.truncate(func_pos);
                Ok(results)
            }
            Err(LuaError::Yield) => Err(LuaError::Yield),
            Err(e) => {
                self.unwind_frames(th, base_depth);
                self.th_mut(th).stack.truncate(func_pos);
                Err(e)
            }
        }
    }

    /// Protected call: catches runtime errors, restoring the caller's frame
    /// and open-upvalue state exactly.
    pub fn pcall(&mut self, f: LuaValue, args: Vec<LuaValue>) -> LuaResult<(bool, Vec<LuaValue>)> {
        match self.call_value(f, args) {
            Ok(results) => Ok((true, results)),
            Err(LuaError::Yield) => Err(LuaError::Yield),
            Err(LuaError::Runtime(e)) => Ok((false, vec![e.value])),
        }
    }

    /// Protected call with an error handler: on error the handler is applied
    /// to the error value and its results are returned with `false`.
    pub fn xpcall(
        &mut self,
        f: LuaValue,
        args: Vec<LuaValue>,
        handler: LuaValue,
    ) -> LuaResult<(bool, Vec<LuaValue>)> {
        match self.call_value(f, args) {
            Ok(results) => Ok((true, results)),
            Err(LuaError::Yield) => Err(LuaError::Yield),
            Err(LuaError::Runtime(e)) => {
                let handled = self.call_value(handler, vec![e.value])?;
                Ok((false, handled))
            }
        }
    }

    /// Pop frames down to `depth`, closing upvalues of every popped frame.
    /// Used on every error path so the invariant holds across non-local
    /// exits.
    pub(crate) fn unwind_frames(&mut self, th: ThreadId, depth: usize) {
        while self.th(th).frames.len() > depth {
            let base = self
                .th(th)
                .frames
                .last()
                .map(|ci| ci.base)
                .unwrap_or(0);
            self.close_upvalues(th, base);
            self.th_mut(th).frames.pop();
        }
    }
}
