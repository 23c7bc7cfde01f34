// LuaTable - hybrid array + hash container.
//
// The array part stores keys 1..=n contiguously. The hash part is an
// insertion-ordered entry vector plus an index map, so the `next` primitive
// can resume from a key even after that key has been assigned nil (the entry
// slot stays behind as a tombstone until a compaction outside traversal).

use std::collections::HashMap;

use crate::gc::TableId;
use crate::lua_value::{LuaValue, float_to_integer};

/// Errors from raw table mutation; the VM maps these to runtime errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    NilKey,
    NanKey,
    /// Key passed to `next` is not present in the table.
    InvalidNext,
}

impl TableError {
    pub fn message(self) -> &'static str {
        match self {
            TableError::NilKey => "table index is nil",
            TableError::NanKey => "table index is NaN",
            TableError::InvalidNext => "invalid key to 'next'",
        }
    }
}

/// Hash-part key wrapper. Keys are pre-normalized (exact-integer floats become
/// integers and NaN is rejected), so a structural hash/eq is sound.
#[derive(Clone, Copy)]
struct LuaKey(LuaValue);

impl PartialEq for LuaKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.raw_equal(&other.0)
    }
}

impl Eq for LuaKey {}

impl std::hash::Hash for LuaKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.0).hash(state);
        match self.0 {
            LuaValue::Nil => {}
            LuaValue::Boolean(b) => b.hash(state),
            LuaValue::Integer(i) => i.hash(state),
            LuaValue::Float(f) => f.to_bits().hash(state),
            LuaValue::String(id) => id.hash(state),
            LuaValue::Table(id) => id.hash(state),
            LuaValue::Function(id) => id.hash(state),
            LuaValue::NativeFn(p) => (p as usize).hash(state),
            LuaValue::LightUserdata(p) => p.hash(state),
            LuaValue::Userdata(id) => id.hash(state),
            LuaValue::Thread(id) => id.hash(state),
            LuaValue::Channel(id) => id.hash(state),
        }
    }
}

/// Canonical key form: floats equal to an integer collapse onto that integer.
#[inline]
fn normalize_key(key: LuaValue) -> LuaValue {
    if let LuaValue::Float(f) = key {
        if let Some(i) = float_to_integer(f) {
            return LuaValue::Integer(i);
        }
    }
    key
}

pub struct LuaTable {
    array: Vec<LuaValue>,
    entries: Vec<(LuaValue, LuaValue)>,
    index: HashMap<LuaKey, usize, ahash::RandomState>,
    live: usize,
    pub(crate) metatable: Option<TableId>,
}

impl LuaTable {
    pub fn new(narr: usize, nhash: usize) -> Self {
        Self {
            array: Vec::with_capacity(narr),
            entries: Vec::with_capacity(nhash),
            index: HashMap::with_capacity_and_hasher(nhash, ahash::RandomState::new()),
            live: 0,
            metatable: None,
        }
    }

    pub fn metatable(&self) -> Option<TableId> {
        self.metatable
    }

    pub fn set_metatable(&mut self, mt: Option<TableId>) {
        self.metatable = mt;
    }

    // ============ Raw access ============

    pub fn raw_get(&self, key: &LuaValue) -> LuaValue {
        match normalize_key(*key) {
            LuaValue::Integer(i) => self.raw_geti(i),
            LuaValue::Nil => LuaValue::Nil,
            k => self.hash_get(&k),
        }
    }

    pub fn raw_geti(&self, i: i64) -> LuaValue {
        if i >= 1 && (i as u64) <= self.array.len() as u64 {
            self.array[(i - 1) as usize]
        } else {
            self.hash_get(&LuaValue::Integer(i))
        }
    }

    fn hash_get(&self, key: &LuaValue) -> LuaValue {
        match self.index.get(&LuaKey(*key)) {
            Some(&slot) => self.entries[slot].1,
            None => LuaValue::Nil,
        }
    }

    pub fn raw_set(&mut self, key: LuaValue, value: LuaValue) -> Result<(), TableError> {
        let key = normalize_key(key);
        match key {
            LuaValue::Nil => Err(TableError::NilKey),
            LuaValue::Float(f) if f.is_nan() => Err(TableError::NanKey),
            LuaValue::Integer(i) => {
                self.raw_seti(i, value);
                Ok(())
            }
            k => {
                self.hash_set(k, value);
                Ok(())
            }
        }
    }

    pub fn raw_seti(&mut self, i: i64, value: LuaValue) {
        let len = self.array.len() as i64;
        if i >= 1 && i <= len {
            self.array[(i - 1) as usize] = value;
        } else if i == len + 1 && !value.is_nil() {
            self.array.push(value);
            self.migrate_from_hash();
        } else {
            self.hash_set(LuaValue::Integer(i), value);
        }
    }

    /// After the array part grows, pull any now-adjacent integer keys out of
    /// the hash part so the border stays in the array.
    fn migrate_from_hash(&mut self) {
        loop {
            let next = self.array.len() as i64 + 1;
            let k = LuaKey(LuaValue::Integer(next));
            match self.index.remove(&k) {
                Some(slot) => {
                    let v = self.entries[slot].1;
                    self.entries[slot].1 = LuaValue::Nil;
                    if !v.is_nil() {
                        self.live -= 1;
                        self.array.push(v);
                    } else {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    fn hash_set(&mut self, key: LuaValue, value: LuaValue) {
        if let Some(&slot) = self.index.get(&LuaKey(key)) {
            let old = self.entries[slot].1;
            if old.is_nil() && !value.is_nil() {
                self.live += 1;
            } else if !old.is_nil() && value.is_nil() {
                self.live -= 1;
            }
            self.entries[slot].1 = value;
            return;
        }
        if value.is_nil() {
            return;
        }
        self.maybe_compact();
        let slot = self.entries.len();
        self.entries.push((key, value));
        self.index.insert(LuaKey(key), slot);
        self.live += 1;
    }

    /// Drop tombstones when they dominate. Runs only on insert of a fresh
    /// key; like a rehash in stock Lua, this invalidates an in-flight
    /// traversal that keeps inserting.
    fn maybe_compact(&mut self) {
        let dead = self.entries.len() - self.live;
        if self.entries.len() >= 16 && dead > self.live {
            let old = std::mem::take(&mut self.entries);
            self.index.clear();
            for (k, v) in old {
                if !v.is_nil() {
                    let slot = self.entries.len();
                    self.entries.push((k, v));
                    self.index.insert(LuaKey(k), slot);
                }
            }
        }
    }

    // ============ Length ============

    /// The length operator: some n with t[n] ~= nil and t[n+1] == nil.
    pub fn length(&self) -> i64 {
        let n = self.array.len();
        if n == 0 || self.array[n - 1].is_nil() {
            return self.bounded_search(n);
        }
        // Array is full to its end; the border may continue in the hash part.
        if self.hash_get(&LuaValue::Integer(n as i64 + 1)).is_nil() {
            return n as i64;
        }
        self.unbound_search(n as i64 + 1)
    }

    fn bounded_search(&self, n: usize) -> i64 {
        // Binary search for i with array[i-1] non-nil and array[i] nil.
        let (mut lo, mut hi) = (0usize, n);
        while hi - lo > 1 {
            let m = (lo + hi) / 2;
            if self.array[m - 1].is_nil() {
                hi = m;
            } else {
                lo = m;
            }
        }
        lo as i64
    }

    fn unbound_search(&self, start: i64) -> i64 {
        let mut i = start; // known non-nil
        let mut j = start.saturating_mul(2);
        while !self.hash_get(&LuaValue::Integer(j)).is_nil() {
            i = j;
            if j > i64::MAX / 2 {
                // pathological table; fall back to linear scan
                let mut k = i + 1;
                while !self.raw_geti(k).is_nil() {
                    k += 1;
                }
                return k - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = i + (j - i) / 2;
            if self.hash_get(&LuaValue::Integer(m)).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    // ============ Iteration ============

    /// The `next` primitive. `nil` starts a traversal; the key returned by a
    /// previous call continues it. Assigning nil to the current key during
    /// traversal is supported.
    pub fn next(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, TableError> {
        let start = match normalize_key(*key) {
            LuaValue::Nil => 0,
            LuaValue::Integer(i) if i >= 1 && (i as u64) <= self.array.len() as u64 => i as usize,
            k => {
                let slot = self
                    .index
                    .get(&LuaKey(k))
                    .copied()
                    .ok_or(TableError::InvalidNext)?;
                return Ok(self.next_hash(slot + 1));
            }
        };
        for i in start..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((LuaValue::Integer(i as i64 + 1), self.array[i])));
            }
        }
        Ok(self.next_hash(0))
    }

    fn next_hash(&self, from: usize) -> Option<(LuaValue, LuaValue)> {
        for slot in from..self.entries.len() {
            let (k, v) = self.entries[slot];
            if !v.is_nil() {
                return Some((k, v));
            }
        }
        None
    }

    // ============ Bulk store ============

    /// SETLIST support: store `values` at base+1, base+2, ...
    pub fn set_list(&mut self, base: i64, values: &[LuaValue]) {
        for (offset, v) in values.iter().enumerate() {
            self.raw_seti(base + offset as i64 + 1, *v);
        }
    }

    /// Number of live entries across both parts (host-facing; not the length
    /// operator).
    pub fn live_count(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count() + self.live
    }

    /// Values reachable from this table, for the collector.
    pub(crate) fn trace(&self, mark: &mut dyn FnMut(LuaValue)) {
        for v in &self.array {
            mark(*v);
        }
        for (k, v) in &self.entries {
            mark(*k);
            mark(*v);
        }
    }
}
