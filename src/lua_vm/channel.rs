// Channel operations under cooperative scheduling.
//
// An operation that cannot complete immediately parks the calling coroutine:
// the thread records the pending op and suspends to its resumer; the op is
// retried on the next resume. An op completes immediately when the buffer
// has room / data, or against a coroutine already parked on the opposite
// side (which is how capacity-0 rendezvous hands values across). The root
// thread cannot park, so a blocking op there with no parked counterpart is a
// deadlock error.

use crate::gc::{ChannelId, ThreadId};
use crate::lua_value::{ChanWait, LuaChannel, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

impl LuaVM {
    pub fn new_channel(&mut self, capacity: usize) -> LuaValue {
        LuaValue::Channel(self.pool.create_channel(LuaChannel::new(capacity)))
    }

    /// send(v): enqueue, hand off to a parked receiver, or block.
    pub fn channel_send(&mut self, ch: ChannelId, v: LuaValue) -> LuaResult<()> {
        if self.pool.channel(ch).is_closed() {
            return Err(self.error_str("send on closed channel"));
        }
        if self.pool.channel_mut(ch).try_push(v) {
            return Ok(());
        }
        if let Some(receiver) = self.find_parked(ch, false) {
            let t = self.th_mut(receiver);
            t.park = None;
            t.park_result = Some(vec![v, LuaValue::boolean(true)]);
            return Ok(());
        }
        let th = self.current;
        if self.th(th).is_main {
            return Err(self.error_str("all coroutines are asleep - deadlock"));
        }
        if self.th(th).native_depth > 0 {
            return Err(self.error_str("attempt to block across a native call boundary"));
        }
        let t = self.th_mut(th);
        t.park = Some(ChanWait::Send(ch, v));
        t.transfer = Vec::new();
        Err(LuaError::Yield)
    }

    /// recv(): (v, true) while values are available, (nil, false) once a
    /// closed channel drains, otherwise block.
    pub fn channel_recv(&mut self, ch: ChannelId) -> LuaResult<(LuaValue, bool)> {
        if let Some(v) = self.pool.channel_mut(ch).try_pop() {
            // Freeing a slot may complete a parked sender.
            self.promote_parked_sender(ch);
            return Ok((v, true));
        }
        if let Some(sender) = self.find_parked(ch, true) {
            let t = self.th_mut(sender);
            let Some(ChanWait::Send(_, v)) = t.park.take() else {
                unreachable!("parked sender without a send op");
            };
            t.park_result = Some(Vec::new());
            return Ok((v, true));
        }
        if self.pool.channel(ch).is_closed() {
            return Ok((LuaValue::Nil, false));
        }
        let th = self.current;
        if self.th(th).is_main {
            return Err(self.error_str("all coroutines are asleep - deadlock"));
        }
        if self.th(th).native_depth > 0 {
            return Err(self.error_str("attempt to block across a native call boundary"));
        }
        let t = self.th_mut(th);
        t.park = Some(ChanWait::Recv(ch));
        t.transfer = Vec::new();
        Err(LuaError::Yield)
    }

    /// close(): further sends error; queued values remain receivable.
    pub fn channel_close(&mut self, ch: ChannelId) {
        self.pool.channel_mut(ch).close();
    }

    /// Move a parked sender's value into freed buffer space.
    fn promote_parked_sender(&mut self, ch: ChannelId) {
        if self.pool.channel(ch).capacity() == 0 {
            return;
        }
        if let Some(sender) = self.find_parked(ch, true) {
            let t = self.th_mut(sender);
            let Some(ChanWait::Send(_, v)) = t.park.take() else {
                return;
            };
            t.park_result = Some(Vec::new());
            self.pool.channel_mut(ch).try_push(v);
        }
    }

    /// Find a coroutine parked on `ch`, on the send side when `senders`.
    fn find_parked(&self, ch: ChannelId, senders: bool) -> Option<ThreadId> {
        for id in self.pool.live_threads() {
            let t = self.pool.thread(id);
            match t.park {
                Some(ChanWait::Send(c, _)) if senders && c == ch => return Some(id),
                Some(ChanWait::Recv(c)) if !senders && c == ch => return Some(id),
                _ => {}
            }
        }
        None
    }

    /// Retry the channel op a resumed coroutine is parked on. Ok(true) when
    /// it completed (park_result holds the op's results), Ok(false) when it
    /// must keep waiting.
    pub(crate) fn retry_parked_op(&mut self, co: ThreadId) -> LuaResult<bool> {
        let Some(wait) = self.th(co).park else {
            return Ok(true);
        };
        match wait {
            ChanWait::Send(ch, v) => {
                if self.pool.channel(ch).is_closed() {
                    self.th_mut(co).park = None;
                    return Err(self.error_str("send on closed channel"));
                }
                if self.pool.channel_mut(ch).try_push(v) {
                    let t = self.th_mut(co);
                    t.park = None;
                    t.park_result = Some(Vec::new());
                    return Ok(true);
                }
                if let Some(receiver) = self.find_parked(ch, false) {
                    if receiver != co {
                        let r = self.th_mut(receiver);
                        r.park = None;
                        r.park_result = Some(vec![v, LuaValue::boolean(true)]);
                        let t = self.th_mut(co);
                        t.park = None;
                        t.park_result = Some(Vec::new());
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ChanWait::Recv(ch) => {
                if let Some(v) = self.pool.channel_mut(ch).try_pop() {
                    self.promote_parked_sender(ch);
                    let t = self.th_mut(co);
                    t.park = None;
                    t.park_result = Some(vec![v, LuaValue::boolean(true)]);
                    return Ok(true);
                }
                if let Some(sender) = self.find_parked(ch, true) {
                    if sender != co {
                        let s = self.th_mut(sender);
                        let Some(ChanWait::Send(_, v)) = s.park.take() else {
                            return Ok(false);
                        };
                        s.park_result = Some(Vec::new());
                        let t = self.th_mut(co);
                        t.park = None;
                        t.park_result = Some(vec![v, LuaValue::boolean(true)]);
                        return Ok(true);
                    }
                }
                if self.pool.channel(ch).is_closed() {
                    let t = self.th_mut(co);
                    t.park = None;
                    t.park_result = Some(vec![LuaValue::Nil, LuaValue::boolean(false)]);
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }
}
