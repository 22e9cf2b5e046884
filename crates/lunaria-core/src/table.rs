//! Hybrid array + hash table.
//!
//! Numeric keys that are whole numbers are normalized into an integer
//! key so `t[1]` and `t[1.0]` are the same slot, as the Lua 5.2 manual
//! requires. A dense prefix of integer keys lives in the array part;
//! everything else goes in an insertion-ordered hash map, which gives
//! `next` a stable traversal order.

use crate::heap::GcIdx;
use crate::string::StringId;
use crate::value::Value;
use indexmap::IndexMap;

/// A key in the hash part of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    /// A number whose value is a whole number.
    Int(i64),
    String(StringId),
    /// A non-integral number, keyed by its bit pattern.
    Float(u64),
    Boolean(bool),
    /// Any heap object, keyed by handle identity.
    Handle(u64),
}

/// A Lua table.
pub struct Table {
    /// Dense prefix: array[0] holds key 1.
    array: Vec<Value>,
    hash: IndexMap<TableKey, Value>,
    pub metatable: Option<GcIdx<Table>>,
}

impl Table {
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            metatable: None,
        }
    }

    pub fn raw_get(&self, key: Value) -> Value {
        if let Some(f) = key.as_number() {
            if let Some(i) = whole_number(f) {
                return self.raw_get_int(i);
            }
        }
        match value_to_key(key) {
            Some(tk) => self.hash.get(&tk).copied().unwrap_or(Value::nil()),
            None => Value::nil(),
        }
    }

    /// Raw set. Errors on a nil or NaN key.
    pub fn raw_set(&mut self, key: Value, value: Value) -> Result<(), &'static str> {
        if key.is_nil() {
            return Err("table index is nil");
        }
        if let Some(f) = key.as_number() {
            if f.is_nan() {
                return Err("table index is NaN");
            }
            if let Some(i) = whole_number(f) {
                self.raw_set_int(i, value);
                return Ok(());
            }
        }
        let tk = value_to_key(key).expect("non-nil non-NaN key must convert");
        if value.is_nil() {
            // A nil store is a delete, but we keep a tombstone for keys
            // that existed so an in-progress next() still finds its spot.
            if self.hash.contains_key(&tk) {
                self.hash.insert(tk, value);
            }
        } else {
            self.hash.insert(tk, value);
        }
        Ok(())
    }

    /// Integer-key get, 1-indexed.
    pub fn raw_get_int(&self, key: i64) -> Value {
        if key >= 1 && (key as usize) <= self.array.len() {
            self.array[(key - 1) as usize]
        } else {
            self.hash
                .get(&TableKey::Int(key))
                .copied()
                .unwrap_or(Value::nil())
        }
    }

    /// Integer-key set, 1-indexed.
    pub fn raw_set_int(&mut self, key: i64, value: Value) {
        if key >= 1 {
            let idx = (key - 1) as usize;
            if idx < self.array.len() {
                self.array[idx] = value;
                return;
            }
            if idx == self.array.len() && !value.is_nil() {
                self.array.push(value);
                self.absorb_hash_tail();
                return;
            }
        }
        if value.is_nil() {
            if self.hash.contains_key(&TableKey::Int(key)) {
                self.hash.insert(TableKey::Int(key), value);
            }
        } else {
            self.hash.insert(TableKey::Int(key), value);
        }
    }

    pub fn raw_get_str(&self, key: StringId) -> Value {
        self.hash
            .get(&TableKey::String(key))
            .copied()
            .unwrap_or(Value::nil())
    }

    pub fn raw_set_str(&mut self, key: StringId, value: Value) {
        if value.is_nil() {
            if self.hash.contains_key(&TableKey::String(key)) {
                self.hash.insert(TableKey::String(key), value);
            }
        } else {
            self.hash.insert(TableKey::String(key), value);
        }
    }

    /// A border for `#t`: some n where t[n] is non-nil and t[n+1] is nil.
    pub fn length(&self) -> i64 {
        if self.array.is_empty() {
            return 0;
        }
        if !self.array.last().unwrap().is_nil() {
            return self.array.len() as i64;
        }
        // Trailing nil somewhere: binary search for a boundary.
        let mut lo = 0usize;
        let mut hi = self.array.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.array[mid].is_nil() {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo as i64
    }

    /// Successor of `key` in traversal order, nil starting from the
    /// beginning. `Err(())` means the key was never in the table.
    #[allow(clippy::result_unit_err)]
    pub fn next(&self, key: Value) -> Result<Option<(Value, Value)>, ()> {
        if key.is_nil() {
            return Ok(self.first_from_array(0));
        }
        if let Some(f) = key.as_number() {
            if let Some(i) = whole_number(f) {
                if i >= 1 && (i as usize) <= self.array.len() {
                    return Ok(self.first_from_array(i as usize));
                }
            }
        }
        let tk = match value_to_key(key) {
            Some(tk) => tk,
            None => return Err(()),
        };
        match self.hash.get_index_of(&tk) {
            Some(pos) => Ok(self.first_from_hash(pos + 1)),
            None => Err(()),
        }
    }

    /// First live entry at or after array slot `start`, falling through
    /// to the hash part.
    fn first_from_array(&self, start: usize) -> Option<(Value, Value)> {
        for (i, v) in self.array.iter().enumerate().skip(start) {
            if !v.is_nil() {
                return Some((Value::from_number((i + 1) as f64), *v));
            }
        }
        self.first_from_hash(0)
    }

    /// First non-tombstone hash entry at or after position `start`.
    fn first_from_hash(&self, start: usize) -> Option<(Value, Value)> {
        for (k, v) in self.hash.iter().skip(start) {
            if !v.is_nil() {
                return Some((key_to_value(*k), *v));
            }
        }
        None
    }

    /// Drop tombstones. Must not run while an iteration is in flight.
    pub fn compact(&mut self) {
        self.hash.retain(|_, v| !v.is_nil());
        while self.array.last().is_some_and(|v| v.is_nil()) {
            self.array.pop();
        }
    }

    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    pub fn hash_len(&self) -> usize {
        self.hash.len()
    }

    /// Pull hash entries that now extend the dense prefix into the array.
    fn absorb_hash_tail(&mut self) {
        loop {
            let next_key = self.array.len() as i64 + 1;
            match self.hash.shift_remove(&TableKey::Int(next_key)) {
                Some(v) if !v.is_nil() => self.array.push(v),
                _ => break,
            }
        }
    }
}

fn whole_number(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn value_to_key(v: Value) -> Option<TableKey> {
    if v.is_nil() {
        return None;
    }
    if let Some(f) = v.as_number() {
        if f.is_nan() {
            return None;
        }
        return Some(match whole_number(f) {
            Some(i) => TableKey::Int(i),
            None => TableKey::Float(f.to_bits()),
        });
    }
    if let Some(b) = v.as_bool() {
        return Some(TableKey::Boolean(b));
    }
    if let Some(sid) = v.as_string_id() {
        return Some(TableKey::String(sid));
    }
    // Remaining cases are all heap handles; identity is the bit pattern.
    Some(TableKey::Handle(v.raw_bits()))
}

fn key_to_value(k: TableKey) -> Value {
    match k {
        TableKey::Int(i) => Value::from_number(i as f64),
        TableKey::String(sid) => Value::from_string_id(sid),
        TableKey::Float(bits) => Value::from_number(f64::from_bits(bits)),
        TableKey::Boolean(b) => Value::from_bool(b),
        TableKey::Handle(bits) => Value::from_raw_bits(bits),
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.hash.len()
        )
    }
}
