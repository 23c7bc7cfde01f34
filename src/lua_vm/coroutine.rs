// Coroutine scheduler: create / resume / yield / close / status.
//
// Coroutines are stackful cooperative fibers over pooled thread states.
// Yield unwinds the host-side dispatch with the Yield signal; the thread's
// own frames stay intact, and the call site that yielded is recorded so the
// next resume can write the resume arguments into its result window and
// continue from the saved pc.

use crate::gc::ThreadId;
use crate::lua_value::{LuaThread, LuaValue, ThreadStatus};
use crate::lua_vm::execute::lua_execute;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

impl LuaVM {
    /// create(f): a new suspended thread with `f` bound at the bottom of a
    /// fresh stack. `f` may be a Lua closure or a native function; a
    /// native-bound thread runs to completion under resume and cannot yield.
    pub fn new_thread(&mut self, func: LuaValue) -> LuaResult<LuaValue> {
        if !func.is_function() {
            return Err(self.error_str(format!(
                "cannot create a coroutine over a {} value",
                func.type_name()
            )));
        }
        let mut thread = LuaThread::new(false);
        thread.stack.push(func);
        let id = self.pool.create_thread(thread);
        Ok(LuaValue::Thread(id))
    }

    /// Status as observed from the current thread: the running thread is
    /// "running", its resumer chain is "normal".
    pub fn thread_status(&self, co: ThreadId) -> ThreadStatus {
        self.pool.thread(co).status
    }

    /// resume(T, args): park the current thread, run T until it yields,
    /// returns or errors. (true, values) on yield or return; (false, error
    /// value) on error or when T is not resumable.
    pub fn resume(&mut self, co: ThreadId, args: Vec<LuaValue>) -> LuaResult<(bool, Vec<LuaValue>)> {
        let status = self.pool.thread(co).status;
        if co == self.current || status != ThreadStatus::Suspended {
            let what = match status {
                ThreadStatus::Dead => "dead",
                _ => "non-suspended",
            };
            let msg = self.new_string(&format!("cannot resume {} coroutine", what));
            return Ok((false, vec![msg]));
        }

        let prev = self.current;
        self.th_mut(prev).status = ThreadStatus::Normal;
        {
            let t = self.th_mut(co);
            t.status = ThreadStatus::Running;
            t.resumer = Some(prev);
        }
        self.current = co;

        let outcome = self.resume_body(co, args);

        // Hand control back to the resumer in every outcome.
        self.current = prev;
        self.th_mut(prev).status = ThreadStatus::Running;

        match outcome {
            ResumeOutcome::Returned(values) => {
                let t = self.th_mut(co);
                t.status = ThreadStatus::Dead;
                t.resumer = None;
                Ok((true, values))
            }
            ResumeOutcome::Yielded => {
                let t = self.th_mut(co);
                t.status = ThreadStatus::Suspended;
                t.resumer = None;
                let values = std::mem::take(&mut self.th_mut(co).transfer);
                Ok((true, values))
            }
            ResumeOutcome::StillParked => {
                let t = self.th_mut(co);
                t.status = ThreadStatus::Suspended;
                t.resumer = None;
                Ok((true, Vec::new()))
            }
            ResumeOutcome::Failed(e) => {
                self.unwind_frames(co, 0);
                let t = self.th_mut(co);
                t.status = ThreadStatus::Dead;
                t.resumer = None;
                t.error = Some(e.clone());
                Ok((false, vec![e.value]))
            }
        }
    }

    fn resume_body(&mut self, co: ThreadId, args: Vec<LuaValue>) -> ResumeOutcome {
        // A coroutine parked on a channel op retries it before anything else.
        if self.th(co).park.is_some() {
            match self.retry_parked_op(co) {
                Ok(true) => {}
                Ok(false) => return ResumeOutcome::StillParked,
                Err(LuaError::Runtime(e)) => return ResumeOutcome::Failed(e),
                Err(LuaError::Yield) => return ResumeOutcome::StillParked,
            }
        }

        if !self.th(co).started {
            self.th_mut(co).started = true;
            let func = self.th(co).bound_function();
            if let LuaValue::NativeFn(f) = func {
                // Native-bound thread: runs to completion, never yields.
                return match f(self, &args) {
                    Ok(values) => ResumeOutcome::Returned(values),
                    Err(LuaError::Yield) => ResumeOutcome::Failed(
                        self.plain_runtime_error("attempt to yield from outside a coroutine"),
                    ),
                    Err(LuaError::Runtime(e)) => ResumeOutcome::Failed(e),
                };
            }
            let nargs = args.len();
            {
                let t = self.th_mut(co);
                t.stack.truncate(1);
                t.stack.extend_from_slice(&args);
            }
            if let Err(e) = self.push_lua_frame(co, 0, nargs, -1) {
                return match e {
                    LuaError::Runtime(e) => ResumeOutcome::Failed(e),
                    LuaError::Yield => unreachable!("frame setup cannot yield"),
                };
            }
        } else {
            // Deliver resume arguments (or a satisfied channel op's result)
            // into the pending call site.
            let values = match self.th_mut(co).park_result.take() {
                Some(vs) => vs,
                None => args,
            };
            if let Some(pending) = self.th_mut(co).pending.take() {
                self.place_results(co, pending.dest, &values, pending.nresults);
            }
        }

        match lua_execute(self, co, 0) {
            Ok(values) => ResumeOutcome::Returned(values),
            Err(LuaError::Yield) => {
                if self.th(co).park.is_some() {
                    ResumeOutcome::StillParked
                } else {
                    ResumeOutcome::Yielded
                }
            }
            Err(LuaError::Runtime(e)) => ResumeOutcome::Failed(e),
        }
    }

    /// yield(values): park the current coroutine, delivering `values` to the
    /// matching resume. Returns the Yield signal for the caller to
    /// propagate; the pending call site is recorded by the dispatch loop.
    pub fn coroutine_yield(&mut self, values: Vec<LuaValue>) -> LuaError {
        let th = self.current;
        if self.th(th).is_main {
            return self.error_str("attempt to yield from outside a coroutine");
        }
        if self.th(th).native_depth > 0 {
            return self.error_str("attempt to yield across a native call boundary");
        }
        self.th_mut(th).transfer = values;
        LuaError::Yield
    }

    /// Whether a yield from the current position would be legal.
    pub fn is_yieldable(&self) -> bool {
        let t = self.th(self.current);
        !t.is_main && t.native_depth == 0
    }

    /// The currently running thread and whether it is the root.
    pub fn running(&self) -> (ThreadId, bool) {
        (self.current, self.current == self.main)
    }

    /// close(T): kill a suspended (or freshly created) coroutine, closing
    /// its upvalues and discarding its frames.
    pub fn close_thread(&mut self, co: ThreadId) -> LuaResult<()> {
        if co == self.current || self.th(co).status == ThreadStatus::Normal {
            return Err(self.error_str("cannot close a running coroutine"));
        }
        self.close_upvalues(co, 0);
        self.unwind_frames(co, 0);
        let t = self.th_mut(co);
        t.stack.clear();
        t.pending = None;
        t.park = None;
        t.park_result = None;
        t.status = ThreadStatus::Dead;
        Ok(())
    }
}

enum ResumeOutcome {
    Returned(Vec<LuaValue>),
    Yielded,
    /// A channel-parked coroutine that still cannot proceed.
    StillParked,
    Failed(crate::lua_vm::RuntimeError),
}
