/// Expression description and operator metadata.
use lunaria_core::string::StringId;

/// Describes where an expression's value currently lives.
#[derive(Clone, Debug)]
pub enum ExprDesc {
    /// No value (statement result).
    Void,
    /// Nil literal.
    Nil,
    /// True literal.
    True,
    /// False literal.
    False,
    /// Number literal.
    Number(f64),
    /// String literal.
    Str(StringId),
    /// Value in a register.
    Register(u8),
    /// Upvalue at the given index.
    Upvalue(u8),
    /// Constant at the given index.
    Constant(u32),
    /// Indexed: table in register, key as an RK operand source.
    Indexed { table: u8, key: IndexKey },
    /// Relocatable: instruction at PC whose destination register is not yet set.
    Relocatable(usize),
    /// Jump: the expression is a comparison; the PC is its false-branch jump.
    Jump(usize),
    /// Function call result: instruction at PC.
    Call(usize),
    /// Vararg expression: instruction at PC.
    Vararg(usize),
    /// Global variable: _ENV[name_constant], upvalue index + constant index.
    Global { env_upval: u8, name_k: u32 },
}

/// Key source for table indexing. Both forms end up as an RK operand.
#[derive(Clone, Debug)]
pub enum IndexKey {
    /// Key is a constant at the given index.
    Constant(u32),
    /// Key is in a register.
    Register(u8),
}

impl ExprDesc {
    /// Returns true if this is a literal constant that doesn't need a register.
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            ExprDesc::Nil
                | ExprDesc::True
                | ExprDesc::False
                | ExprDesc::Number(_)
                | ExprDesc::Str(_)
        )
    }

    /// Returns true if this expression can produce multiple values.
    pub fn is_multi(&self) -> bool {
        matches!(self, ExprDesc::Call(_) | ExprDesc::Vararg(_))
    }
}

/// Binary operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

/// Unary operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
}

impl BinOp {
    /// Operator precedence (higher = binds tighter).
    /// Returns (left priority, right priority); right < left means
    /// right-associative.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Lt | BinOp::Gt | BinOp::LtEq | BinOp::GtEq | BinOp::NotEq | BinOp::Eq => (3, 3),
            BinOp::Concat => (5, 4), // right-associative
            BinOp::Add | BinOp::Sub => (6, 6),
            BinOp::Mul | BinOp::Div | BinOp::Mod => (7, 7),
            BinOp::Pow => (10, 9), // right-associative
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq
        )
    }

    pub fn is_arith(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow
        )
    }
}

/// Precedence for unary operators.
pub const UNARY_PRIORITY: u8 = 8;
