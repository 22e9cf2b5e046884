//! Interned Lua strings.
//!
//! Lua 5.2 interns every string, so equality is identity: two equal byte
//! sequences always yield the same `StringId`. Short payloads are stored
//! inline to avoid a heap allocation per small literal.

use std::collections::HashMap;
use std::fmt;

/// Maximum bytes stored inline.
const INLINE_MAX: usize = 40;

/// Handle to a string in the interner. Equal content implies equal id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StringId(pub u32);

#[derive(Clone)]
enum StringData {
    Inline { buf: [u8; INLINE_MAX], len: u8 },
    Heap(Vec<u8>),
}

/// An interned string with its precomputed hash.
#[derive(Clone)]
pub struct LuaString {
    data: StringData,
    hash: u32,
}

impl LuaString {
    fn new(bytes: &[u8]) -> Self {
        let hash = lua_hash(bytes);
        if bytes.len() <= INLINE_MAX {
            let mut buf = [0u8; INLINE_MAX];
            buf[..bytes.len()].copy_from_slice(bytes);
            LuaString {
                data: StringData::Inline {
                    buf,
                    len: bytes.len() as u8,
                },
                hash,
            }
        } else {
            LuaString {
                data: StringData::Heap(bytes.to_vec()),
                hash,
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            StringData::Inline { buf, len } => &buf[..*len as usize],
            StringData::Heap(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        match &self.data {
            StringData::Inline { len, .. } => *len as usize,
            StringData::Heap(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = std::str::from_utf8(self.as_bytes()) {
            write!(f, "\"{}\"", s)
        } else {
            write!(f, "<binary string len={}>", self.len())
        }
    }
}

/// PUC Lua's luaS_hash: seeds with the length and samples at most 32
/// bytes so hashing a huge string stays cheap.
pub fn lua_hash(bytes: &[u8]) -> u32 {
    let len = bytes.len();
    let mut h = len as u32;
    let step = (len >> 5) + 1;
    let mut i = len;
    while i >= step {
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(bytes[i - 1] as u32);
        i -= step;
    }
    h
}

/// Owns all strings and deduplicates them by content.
#[derive(Clone, Debug, Default)]
pub struct StringInterner {
    strings: Vec<LuaString>,
    /// hash -> ids with that hash, resolved by byte comparison.
    lookup: HashMap<u32, Vec<u32>>,
}

impl StringInterner {
    pub fn new() -> Self {
        StringInterner::default()
    }

    /// Intern a byte string, returning the existing id when the content
    /// has been seen before.
    pub fn intern(&mut self, bytes: &[u8]) -> StringId {
        let hash = lua_hash(bytes);
        if let Some(ids) = self.lookup.get(&hash) {
            for &id in ids {
                if self.strings[id as usize].as_bytes() == bytes {
                    return StringId(id);
                }
            }
        }
        let id = self.strings.len() as u32;
        self.strings.push(LuaString::new(bytes));
        self.lookup.entry(hash).or_default().push(id);
        StringId(id)
    }

    pub fn intern_str(&mut self, s: &str) -> StringId {
        self.intern(s.as_bytes())
    }

    pub fn get(&self, id: StringId) -> &LuaString {
        &self.strings[id.0 as usize]
    }

    pub fn get_bytes(&self, id: StringId) -> &[u8] {
        self.strings[id.0 as usize].as_bytes()
    }

    /// Lossy UTF-8 view, for error messages and display.
    pub fn get_display(&self, id: StringId) -> String {
        String::from_utf8_lossy(self.get_bytes(id)).into_owned()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
