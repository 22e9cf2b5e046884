//! Binary chunk dump and undump in the Lua 5.2 `luac` format.
//!
//! The layout is bit-exact with PUC Lua 5.2 built with 4-byte ints, 8-byte
//! size_t, 4-byte instructions, and 8-byte doubles. Endianness is recorded
//! in the header; `undump` accepts chunks of either byte order and swaps on
//! the fly, while `dump` writes whichever order the caller asks for.

use lunaria_compiler::opcode::Instruction;
use lunaria_compiler::proto::{Constant, LocalVar, Proto, UpvalDesc};
use lunaria_core::string::{StringId, StringInterner};
use std::fmt;

/// The four-byte mark at the start of every binary chunk.
pub const SIGNATURE: &[u8; 4] = b"\x1bLua";

const VERSION: u8 = 0x52;
const FORMAT: u8 = 0;
/// Corruption catcher appended to the header: catches text-mode newline
/// translation and truncation.
const TAIL: &[u8; 6] = b"\x19\x93\r\n\x1a\n";

const SIZE_INT: u8 = 4;
const SIZE_SIZET: u8 = 8;
const SIZE_INSTRUCTION: u8 = 4;
const SIZE_NUMBER: u8 = 8;
const INTEGRAL_FLAG: u8 = 0;

const TAG_NIL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub fn host() -> Endianness {
        if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    fn header_byte(self) -> u8 {
        match self {
            Endianness::Little => 1,
            Endianness::Big => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkError {
    /// The signature bytes are wrong; this is not a binary chunk at all.
    NotAChunk,
    /// A binary chunk, but for a different Lua version.
    VersionMismatch,
    /// Header sizes or format disagree with what this VM can load.
    Incompatible,
    /// The chunk ends before its own structure says it should.
    Truncated,
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::NotAChunk => write!(f, "not a precompiled chunk"),
            ChunkError::VersionMismatch => write!(f, "version mismatch in precompiled chunk"),
            ChunkError::Incompatible => write!(f, "incompatible precompiled chunk"),
            ChunkError::Truncated => write!(f, "truncated precompiled chunk"),
        }
    }
}

impl std::error::Error for ChunkError {}

/// Serialize a prototype tree to a binary chunk.
pub fn dump(proto: &Proto, strings: &StringInterner, endian: Endianness) -> Vec<u8> {
    let mut w = Writer { out: Vec::new(), endian };
    w.out.extend_from_slice(SIGNATURE);
    w.byte(VERSION);
    w.byte(FORMAT);
    w.byte(endian.header_byte());
    w.byte(SIZE_INT);
    w.byte(SIZE_SIZET);
    w.byte(SIZE_INSTRUCTION);
    w.byte(SIZE_NUMBER);
    w.byte(INTEGRAL_FLAG);
    w.out.extend_from_slice(TAIL);
    w.function(proto, strings);
    w.out
}

/// Deserialize a binary chunk. Interned strings land in `strings`, so the
/// returned prototype must be executed against that same interner.
pub fn undump(bytes: &[u8], strings: &mut StringInterner) -> Result<Proto, ChunkError> {
    let mut r = Reader { bytes, pos: 0, endian: Endianness::Little };
    if r.take(4)? != SIGNATURE {
        return Err(ChunkError::NotAChunk);
    }
    if r.byte()? != VERSION {
        return Err(ChunkError::VersionMismatch);
    }
    if r.byte()? != FORMAT {
        return Err(ChunkError::Incompatible);
    }
    r.endian = match r.byte()? {
        0 => Endianness::Big,
        1 => Endianness::Little,
        _ => return Err(ChunkError::Incompatible),
    };
    let sizes = [SIZE_INT, SIZE_SIZET, SIZE_INSTRUCTION, SIZE_NUMBER, INTEGRAL_FLAG];
    for expected in sizes {
        if r.byte()? != expected {
            return Err(ChunkError::Incompatible);
        }
    }
    if r.take(6)? != TAIL {
        return Err(ChunkError::Incompatible);
    }
    r.function(strings)
}

struct Writer {
    out: Vec<u8>,
    endian: Endianness,
}

impl Writer {
    fn byte(&mut self, b: u8) {
        self.out.push(b);
    }

    fn u32(&mut self, v: u32) {
        let bytes = match self.endian {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        };
        self.out.extend_from_slice(&bytes);
    }

    fn int(&mut self, v: i32) {
        self.u32(v as u32);
    }

    fn u64(&mut self, v: u64) {
        let bytes = match self.endian {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        };
        self.out.extend_from_slice(&bytes);
    }

    fn number(&mut self, n: f64) {
        self.u64(n.to_bits());
    }

    /// Lua string: size_t length including the NUL terminator, or zero for
    /// an absent string.
    fn string(&mut self, s: Option<&[u8]>) {
        match s {
            None => self.u64(0),
            Some(bytes) => {
                self.u64(bytes.len() as u64 + 1);
                self.out.extend_from_slice(bytes);
                self.byte(0);
            }
        }
    }

    fn string_id(&mut self, sid: Option<StringId>, strings: &StringInterner) {
        self.string(sid.map(|id| strings.get_bytes(id)));
    }

    fn function(&mut self, p: &Proto, strings: &StringInterner) {
        self.int(p.line_defined as i32);
        self.int(p.last_line_defined as i32);
        self.byte(p.num_params);
        self.byte(p.is_vararg as u8);
        self.byte(p.max_stack_size);

        self.int(p.code.len() as i32);
        for inst in &p.code {
            self.u32(inst.0);
        }

        self.int(p.constants.len() as i32);
        for k in &p.constants {
            match k {
                Constant::Nil => self.byte(TAG_NIL),
                Constant::Boolean(b) => {
                    self.byte(TAG_BOOLEAN);
                    self.byte(*b as u8);
                }
                Constant::Number(n) => {
                    self.byte(TAG_NUMBER);
                    self.number(*n);
                }
                Constant::String(sid) => {
                    self.byte(TAG_STRING);
                    self.string_id(Some(*sid), strings);
                }
            }
        }

        self.int(p.protos.len() as i32);
        for child in &p.protos {
            self.function(child, strings);
        }

        self.int(p.upvalues.len() as i32);
        for uv in &p.upvalues {
            self.byte(uv.in_stack as u8);
            self.byte(uv.index);
        }

        // Debug section.
        self.string_id(p.source, strings);
        self.int(p.line_info.len() as i32);
        for line in &p.line_info {
            self.int(*line as i32);
        }
        self.int(p.local_vars.len() as i32);
        for lv in &p.local_vars {
            self.string_id(Some(lv.name), strings);
            self.int(lv.start_pc as i32);
            self.int(lv.end_pc as i32);
        }
        self.int(p.upvalues.len() as i32);
        for uv in &p.upvalues {
            self.string_id(uv.name, strings);
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    endian: Endianness,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ChunkError> {
        if self.pos + n > self.bytes.len() {
            return Err(ChunkError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, ChunkError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ChunkError> {
        let raw = self.take(4)?;
        let arr = [raw[0], raw[1], raw[2], raw[3]];
        Ok(match self.endian {
            Endianness::Little => u32::from_le_bytes(arr),
            Endianness::Big => u32::from_be_bytes(arr),
        })
    }

    fn int(&mut self) -> Result<i32, ChunkError> {
        Ok(self.u32()? as i32)
    }

    /// A count field: negative counts mean a corrupt chunk.
    fn count(&mut self) -> Result<usize, ChunkError> {
        let n = self.int()?;
        if n < 0 {
            return Err(ChunkError::Incompatible);
        }
        Ok(n as usize)
    }

    fn u64(&mut self) -> Result<u64, ChunkError> {
        let raw = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(raw);
        Ok(match self.endian {
            Endianness::Little => u64::from_le_bytes(arr),
            Endianness::Big => u64::from_be_bytes(arr),
        })
    }

    fn number(&mut self) -> Result<f64, ChunkError> {
        Ok(f64::from_bits(self.u64()?))
    }

    fn string(&mut self, strings: &mut StringInterner) -> Result<Option<StringId>, ChunkError> {
        let len = self.u64()?;
        if len == 0 {
            return Ok(None);
        }
        let len = usize::try_from(len).map_err(|_| ChunkError::Truncated)?;
        let raw = self.take(len)?;
        // The stored length includes the NUL terminator.
        Ok(Some(strings.intern(&raw[..len - 1])))
    }

    fn function(&mut self, strings: &mut StringInterner) -> Result<Proto, ChunkError> {
        let mut p = Proto::new();
        p.line_defined = self.int()? as u32;
        p.last_line_defined = self.int()? as u32;
        p.num_params = self.byte()?;
        p.is_vararg = self.byte()? != 0;
        p.max_stack_size = self.byte()?;

        let ncode = self.count()?;
        p.code = Vec::with_capacity(ncode);
        for _ in 0..ncode {
            p.code.push(Instruction(self.u32()?));
        }

        let nconst = self.count()?;
        p.constants = Vec::with_capacity(nconst);
        for _ in 0..nconst {
            let k = match self.byte()? {
                TAG_NIL => Constant::Nil,
                TAG_BOOLEAN => Constant::Boolean(self.byte()? != 0),
                TAG_NUMBER => Constant::Number(self.number()?),
                TAG_STRING => match self.string(strings)? {
                    Some(sid) => Constant::String(sid),
                    None => return Err(ChunkError::Incompatible),
                },
                _ => return Err(ChunkError::Incompatible),
            };
            p.constants.push(k);
        }

        let nprotos = self.count()?;
        p.protos = Vec::with_capacity(nprotos);
        for _ in 0..nprotos {
            p.protos.push(self.function(strings)?);
        }

        let nupvals = self.count()?;
        p.upvalues = Vec::with_capacity(nupvals);
        for _ in 0..nupvals {
            let in_stack = self.byte()? != 0;
            let index = self.byte()?;
            p.upvalues.push(UpvalDesc { name: None, in_stack, index });
        }

        // Debug section. All of it is optional in principle but our dumps
        // always carry it; counts of zero are fine either way.
        p.source = self.string(strings)?;
        let nlines = self.count()?;
        p.line_info = Vec::with_capacity(nlines);
        for _ in 0..nlines {
            p.line_info.push(self.int()? as u32);
        }
        let nlocals = self.count()?;
        p.local_vars = Vec::with_capacity(nlocals);
        for _ in 0..nlocals {
            let name = match self.string(strings)? {
                Some(sid) => sid,
                None => return Err(ChunkError::Incompatible),
            };
            let start_pc = self.int()? as u32;
            let end_pc = self.int()? as u32;
            p.local_vars.push(LocalVar { name, start_pc, end_pc });
        }
        let nupnames = self.count()?;
        if nupnames > p.upvalues.len() {
            return Err(ChunkError::Incompatible);
        }
        for i in 0..nupnames {
            p.upvalues[i].name = self.string(strings)?;
        }
        Ok(p)
    }
}
