/// Lua 5.2 opcodes and instruction encoding.
///
/// Instruction format (32 bits), matching the PUC 5.2 layout exactly so
/// dumped chunks are bit-compatible:
/// - Bits 0-5: OpCode (6 bits)
/// - Bits 6-13: A (8 bits)
/// - For iABC format:
///   - Bits 14-22: C (9 bits)
///   - Bits 23-31: B (9 bits)
/// - For iABx: Bx = bits 14-31 (unsigned 18 bits)
/// - For iAsBx: sBx = Bx - 131071 (excess-K signed)
/// - For iAx: Ax = bits 6-31 (26 bits, unsigned)
///
/// B and C operands of many instructions are RK values: below 256 they
/// name a register, at or above 256 a constant (index = value - 256).
use std::fmt;

/// Size constants for instruction fields.
const SIZE_OP: u32 = 6;
const SIZE_A: u32 = 8;
const SIZE_C: u32 = 9;
const SIZE_B: u32 = 9;
const SIZE_BX: u32 = SIZE_B + SIZE_C; // 18
const SIZE_AX: u32 = SIZE_A + SIZE_B + SIZE_C; // 26

/// Position constants.
const POS_OP: u32 = 0;
const POS_A: u32 = POS_OP + SIZE_OP; // 6
const POS_C: u32 = POS_A + SIZE_A; // 14
const POS_B: u32 = POS_C + SIZE_C; // 23
const POS_BX: u32 = POS_C; // 14
const POS_AX: u32 = POS_A; // 6

/// Mask helper.
const fn mask(n: u32) -> u32 {
    (1 << n) - 1
}

pub const MAX_A: u32 = mask(SIZE_A); // 255
pub const MAX_B: u32 = mask(SIZE_B); // 511
pub const MAX_C: u32 = mask(SIZE_C); // 511
pub const MAX_BX: u32 = mask(SIZE_BX); // 262143
pub const MAX_SBX: i32 = (MAX_BX >> 1) as i32; // 131071
pub const MIN_SBX: i32 = -MAX_SBX; // -131071
pub const MAX_AX: u32 = mask(SIZE_AX); // 67108863

const OFFSET_SBX: i32 = MAX_SBX;

/// RK encoding: this bit in a B/C operand marks a constant index.
pub const BITRK: u32 = 1 << (SIZE_B - 1); // 256
/// Largest constant index that fits in an RK operand.
pub const MAX_INDEX_RK: u32 = BITRK - 1; // 255

/// Encode a constant index as an RK operand.
pub const fn rk_const(index: u32) -> u32 {
    index | BITRK
}

/// True if an RK operand names a constant.
pub const fn is_rk_const(rk: u32) -> bool {
    rk & BITRK != 0
}

/// Constant index of an RK operand (only valid when `is_rk_const`).
pub const fn rk_index(rk: u32) -> u32 {
    rk & !BITRK
}

/// All 40 Lua 5.2 opcodes, in dump order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadK,
    LoadKX,
    LoadBool,
    LoadNil,
    GetUpval,
    GetTabUp,
    GetTable,
    SetTabUp,
    SetUpval,
    SetTable,
    NewTable,
    Self_,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForCall,
    TForLoop,
    SetList,
    Closure,
    VarArg,
    ExtraArg,
}

impl OpCode {
    /// Number of opcodes.
    pub const COUNT: usize = 40;

    /// Get the opcode from a u8 value.
    pub fn from_u8(val: u8) -> Option<OpCode> {
        if (val as usize) < Self::COUNT {
            // Safety: OpCode is repr(u8) and we've verified the range
            Some(unsafe { std::mem::transmute::<u8, OpCode>(val) })
        } else {
            None
        }
    }

    /// Get the instruction format for this opcode.
    pub fn format(&self) -> InstructionFormat {
        use InstructionFormat::*;
        use OpCode::*;
        match self {
            LoadK | LoadKX | Closure => IABx,
            Jmp | ForLoop | ForPrep | TForLoop => IAsBx,
            ExtraArg => IAx,
            _ => IABC,
        }
    }

    /// Get the name of this opcode.
    pub fn name(&self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadK => "LOADK",
            LoadKX => "LOADKX",
            LoadBool => "LOADBOOL",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            GetTabUp => "GETTABUP",
            GetTable => "GETTABLE",
            SetTabUp => "SETTABUP",
            SetUpval => "SETUPVAL",
            SetTable => "SETTABLE",
            NewTable => "NEWTABLE",
            Self_ => "SELF",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Pow => "POW",
            Unm => "UNM",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            Test => "TEST",
            TestSet => "TESTSET",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            ForLoop => "FORLOOP",
            ForPrep => "FORPREP",
            TForCall => "TFORCALL",
            TForLoop => "TFORLOOP",
            SetList => "SETLIST",
            Closure => "CLOSURE",
            VarArg => "VARARG",
            ExtraArg => "EXTRAARG",
        }
    }

    /// Returns true if this opcode conditionally skips the next
    /// instruction (which the compiler always makes a JMP).
    pub fn is_test(&self) -> bool {
        use OpCode::*;
        matches!(self, Eq | Lt | Le | Test | TestSet)
    }
}

/// Instruction format types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionFormat {
    IABC,
    IABx,
    IAsBx,
    IAx,
}

/// A 32-bit Lua bytecode instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    // ---- Constructors ----

    /// Create an iABC instruction. B and C take RK operands where the
    /// opcode allows them, so they are 9-bit fields.
    pub fn abc(op: OpCode, a: u32, b: u32, c: u32) -> Self {
        debug_assert!(a <= MAX_A, "A out of range: {a}");
        debug_assert!(b <= MAX_B, "B out of range: {b}");
        debug_assert!(c <= MAX_C, "C out of range: {c}");
        let mut i = (op as u32) << POS_OP;
        i |= a << POS_A;
        i |= b << POS_B;
        i |= c << POS_C;
        Instruction(i)
    }

    /// Create an iABx instruction.
    pub fn abx(op: OpCode, a: u32, bx: u32) -> Self {
        debug_assert!(a <= MAX_A, "A out of range: {a}");
        debug_assert!(bx <= MAX_BX, "Bx out of range: {bx}");
        let mut i = (op as u32) << POS_OP;
        i |= a << POS_A;
        i |= bx << POS_BX;
        Instruction(i)
    }

    /// Create an iAsBx instruction (signed Bx, excess-K).
    pub fn asbx(op: OpCode, a: u32, sbx: i32) -> Self {
        debug_assert!(sbx >= MIN_SBX && sbx <= MAX_SBX, "sBx out of range: {sbx}");
        Self::abx(op, a, (sbx + OFFSET_SBX) as u32)
    }

    /// Create an iAx instruction.
    pub fn ax(op: OpCode, ax: u32) -> Self {
        debug_assert!(ax <= MAX_AX, "Ax out of range: {ax}");
        let mut i = (op as u32) << POS_OP;
        i |= ax << POS_AX;
        Instruction(i)
    }

    // ---- Decoders ----

    /// Get the opcode.
    pub fn opcode(&self) -> OpCode {
        let val = (self.0 >> POS_OP) & mask(SIZE_OP);
        OpCode::from_u8(val as u8).unwrap_or(OpCode::Move)
    }

    /// Get field A.
    pub fn a(&self) -> u32 {
        (self.0 >> POS_A) & mask(SIZE_A)
    }

    /// Get field B (9 bits, possibly an RK operand).
    pub fn b(&self) -> u32 {
        (self.0 >> POS_B) & mask(SIZE_B)
    }

    /// Get field C (9 bits, possibly an RK operand).
    pub fn c(&self) -> u32 {
        (self.0 >> POS_C) & mask(SIZE_C)
    }

    /// Get field Bx (unsigned).
    pub fn bx(&self) -> u32 {
        (self.0 >> POS_BX) & mask(SIZE_BX)
    }

    /// Get field sBx (signed).
    pub fn sbx(&self) -> i32 {
        self.bx() as i32 - OFFSET_SBX
    }

    /// Get field Ax (unsigned).
    pub fn ax_field(&self) -> u32 {
        (self.0 >> POS_AX) & mask(SIZE_AX)
    }

    // ---- Mutators (for backpatching) ----

    /// Set field A.
    pub fn set_a(&mut self, a: u32) {
        debug_assert!(a <= MAX_A);
        self.0 = (self.0 & !(mask(SIZE_A) << POS_A)) | (a << POS_A);
    }

    /// Set field B.
    pub fn set_b(&mut self, b: u32) {
        debug_assert!(b <= MAX_B);
        self.0 = (self.0 & !(mask(SIZE_B) << POS_B)) | (b << POS_B);
    }

    /// Set field C.
    pub fn set_c(&mut self, c: u32) {
        debug_assert!(c <= MAX_C);
        self.0 = (self.0 & !(mask(SIZE_C) << POS_C)) | (c << POS_C);
    }

    /// Set field sBx.
    pub fn set_sbx(&mut self, sbx: i32) {
        debug_assert!(sbx >= MIN_SBX && sbx <= MAX_SBX);
        let bx = (sbx + OFFSET_SBX) as u32;
        self.0 = (self.0 & !(mask(SIZE_BX) << POS_BX)) | (bx << POS_BX);
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        write!(f, "{}", op.name())?;
        match op.format() {
            InstructionFormat::IABC => {
                write!(f, " A={} B={} C={}", self.a(), self.b(), self.c())?;
            }
            InstructionFormat::IABx => {
                write!(f, " A={} Bx={}", self.a(), self.bx())?;
            }
            InstructionFormat::IAsBx => {
                write!(f, " A={} sBx={}", self.a(), self.sbx())?;
            }
            InstructionFormat::IAx => {
                write!(f, " Ax={}", self.ax_field())?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
