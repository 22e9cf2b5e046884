/// Function prototype: compiled bytecode, constants, and debug info.
use crate::opcode::Instruction;
use lunaria_core::string::StringId;

/// A constant value in the constant pool.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Number(f64),
    String(StringId),
}

/// Description of an upvalue.
#[derive(Clone, Debug)]
pub struct UpvalDesc {
    /// Name of the upvalue (for debug info).
    pub name: Option<StringId>,
    /// True if the upvalue captures a register of the enclosing
    /// function; false if it re-captures one of the parent's upvalues.
    pub in_stack: bool,
    /// Register index if in_stack, upvalue index in parent otherwise.
    pub index: u8,
}

/// A local variable debug entry.
#[derive(Clone, Debug)]
pub struct LocalVar {
    pub name: StringId,
    /// First PC where the variable is active.
    pub start_pc: u32,
    /// First PC where the variable is dead.
    pub end_pc: u32,
}

/// A compiled function prototype.
#[derive(Clone, Debug)]
pub struct Proto {
    /// Bytecode instructions.
    pub code: Vec<Instruction>,
    /// Constant pool.
    pub constants: Vec<Constant>,
    /// Nested function prototypes.
    pub protos: Vec<Proto>,
    /// Upvalue descriptors.
    pub upvalues: Vec<UpvalDesc>,
    /// Number of fixed parameters.
    pub num_params: u8,
    /// Whether this function accepts varargs.
    pub is_vararg: bool,
    /// Maximum stack size needed.
    pub max_stack_size: u8,
    /// Source name (for error messages).
    pub source: Option<StringId>,
    /// Line where the function definition starts (0 for a main chunk).
    pub line_defined: u32,
    /// Line of the matching `end` (0 for a main chunk).
    pub last_line_defined: u32,

    // --- Debug info ---
    /// Source line per instruction, parallel to `code`.
    pub line_info: Vec<u32>,
    /// Local variable debug info.
    pub local_vars: Vec<LocalVar>,
}

impl Proto {
    /// Create a new empty prototype.
    pub fn new() -> Self {
        Proto {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2, // minimum
            source: None,
            line_defined: 0,
            last_line_defined: 0,
            line_info: Vec::new(),
            local_vars: Vec::new(),
        }
    }

    /// Emit an instruction at the given source line, returning its pc.
    pub fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        let pc = self.code.len();
        self.code.push(inst);
        self.line_info.push(line);
        pc
    }

    /// Add a constant to the pool, returning its index. Deduplicates;
    /// numbers compare by bit pattern so 0.0 and -0.0 stay distinct.
    pub fn add_constant(&mut self, k: Constant) -> usize {
        for (i, existing) in self.constants.iter().enumerate() {
            if constants_equal(existing, &k) {
                return i;
            }
        }
        let idx = self.constants.len();
        self.constants.push(k);
        idx
    }

    /// Get the line number for a given pc.
    pub fn get_line(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }

    /// Get the number of instructions.
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Get a mutable reference to an instruction (for backpatching).
    pub fn get_mut(&mut self, pc: usize) -> &mut Instruction {
        &mut self.code[pc]
    }
}

impl Default for Proto {
    fn default() -> Self {
        Self::new()
    }
}

fn constants_equal(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Nil, Constant::Nil) => true,
        (Constant::Boolean(a), Constant::Boolean(b)) => a == b,
        (Constant::Number(a), Constant::Number(b)) => a.to_bits() == b.to_bits(),
        (Constant::String(a), Constant::String(b)) => a == b,
        _ => false,
    }
}
