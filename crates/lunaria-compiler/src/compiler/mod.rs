//! Single-pass compiler: parses Lua 5.2 source and emits bytecode
//! directly, with no intermediate AST. Register allocation and jump
//! backpatching happen as parsing proceeds.

pub mod expr;
pub mod scope;

use crate::lexer::{LexError, Lexer};
use crate::opcode::{self, Instruction, OpCode, MAX_BX, MAX_C, MAX_INDEX_RK, MAX_SBX, MIN_SBX};
use crate::proto::{Constant, LocalVar, Proto, UpvalDesc};
use crate::token::Token;
use expr::{BinOp, ExprDesc, IndexKey, UnOp, UNARY_PRIORITY};
use lunaria_core::string::{StringId, StringInterner};
use scope::{LabelInfo, PendingGoto, ScopeManager};
use std::fmt;

/// Maximum nesting of syntactic constructs.
const MAX_SYNTAX_LEVELS: u32 = 200;
/// Maximum number of upvalues per function.
const MAX_UPVALUES: usize = 60;
/// Array items accumulated before a SetList flush.
const FIELDS_PER_FLUSH: u32 = 50;

/// A compile-time error with the source line it occurred on.
#[derive(Clone, Debug, PartialEq)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError {
            message: e.message,
            line: e.line,
        }
    }
}

/// An upvalue being collected for the function under compilation.
struct UpvalInfo {
    name: StringId,
    in_stack: bool,
    index: u8,
}

/// Per-function compilation state.
struct FuncState {
    proto: Proto,
    scope: ScopeManager,
    upvalues: Vec<UpvalInfo>,
    upval_overflow: bool,
}

impl FuncState {
    fn new() -> Self {
        FuncState {
            proto: Proto::new(),
            scope: ScopeManager::new(),
            upvalues: Vec::new(),
            upval_overflow: false,
        }
    }

    fn add_constant(&mut self, k: Constant) -> u32 {
        self.proto.add_constant(k) as u32
    }

    fn add_string_constant(&mut self, id: StringId) -> u32 {
        self.add_constant(Constant::String(id))
    }
}

/// The compiler proper. Functions under compilation form a stack, with
/// the innermost one on top.
struct Compiler<'a> {
    lexer: Lexer<'a>,
    func_stack: Vec<FuncState>,
    depth: u32,
}

/// Compile a source chunk into a prototype and its string pool.
pub fn compile(source: &[u8], chunk_name: &str) -> Result<(Proto, StringInterner), CompileError> {
    compile_with_interner(source, chunk_name, StringInterner::new())
}

/// Compile a source chunk, interning strings into an existing pool.
pub fn compile_with_interner(
    source: &[u8],
    chunk_name: &str,
    strings: StringInterner,
) -> Result<(Proto, StringInterner), CompileError> {
    let lexer = Lexer::with_strings(source, strings);
    let mut compiler = Compiler {
        lexer,
        func_stack: Vec::new(),
        depth: 0,
    };
    let source_id = compiler.lexer.strings.intern(chunk_name.as_bytes());
    let env_id = compiler.lexer.strings.intern(b"_ENV");

    let mut fs = FuncState::new();
    fs.proto.source = Some(source_id);
    fs.proto.is_vararg = true;
    fs.scope.enter_block(false);
    // The main chunk's first upvalue is _ENV, instantiated by the caller.
    fs.upvalues.push(UpvalInfo {
        name: env_id,
        in_stack: true,
        index: 0,
    });
    compiler.func_stack.push(fs);

    compiler.block()?;
    compiler.expect(Token::Eof, "'<eof>'")?;
    compiler.emit(Instruction::abc(OpCode::Return, 0, 1, 0));
    compiler.check_limits()?;
    let block = compiler.close_block_impl(false)?;
    compiler.check_unmatched_gotos(&block)?;

    let fs = compiler.func_stack.pop().unwrap();
    let proto = finish_proto(fs);
    Ok((proto, compiler.lexer.strings))
}

/// Turn a finished FuncState into its prototype, filling in debug info.
fn finish_proto(fs: FuncState) -> Proto {
    let mut proto = fs.proto;
    proto.max_stack_size = fs.scope.max_reg.saturating_add(2).max(2);
    proto.upvalues = fs
        .upvalues
        .iter()
        .map(|u| UpvalDesc {
            name: Some(u.name),
            in_stack: u.in_stack,
            index: u.index,
        })
        .collect();
    proto.local_vars = fs
        .scope
        .finished_locals
        .iter()
        .map(|l| LocalVar {
            name: l.name,
            start_pc: l.start_pc,
            end_pc: l.end_pc,
        })
        .collect();
    proto
}

fn binop_from_token(tok: &Token) -> Option<BinOp> {
    match tok {
        Token::Plus => Some(BinOp::Add),
        Token::Minus => Some(BinOp::Sub),
        Token::Star => Some(BinOp::Mul),
        Token::Slash => Some(BinOp::Div),
        Token::Percent => Some(BinOp::Mod),
        Token::Caret => Some(BinOp::Pow),
        Token::DotDot => Some(BinOp::Concat),
        Token::Equal => Some(BinOp::Eq),
        Token::NotEqual => Some(BinOp::NotEq),
        Token::Less => Some(BinOp::Lt),
        Token::LessEq => Some(BinOp::LtEq),
        Token::Greater => Some(BinOp::Gt),
        Token::GreaterEq => Some(BinOp::GtEq),
        Token::And => Some(BinOp::And),
        Token::Or => Some(BinOp::Or),
        _ => None,
    }
}

/// Fold an arithmetic operation over two number literals. Division and
/// modulo by zero are left to runtime, as is any NaN result.
fn fold_arith(op: BinOp, a: f64, b: f64) -> Option<f64> {
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return None;
            }
            a / b
        }
        BinOp::Mod => {
            if b == 0.0 {
                return None;
            }
            a - (a / b).floor() * b
        }
        BinOp::Pow => a.powf(b),
        _ => return None,
    };
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

/// Encode a size hint as a floating-point byte: (eeeeexxx) meaning
/// (1xxx) * 2^(eeeee-1) when eeeee > 0, else xxx.
fn int2fb(mut x: u32) -> u32 {
    if x < 8 {
        return x;
    }
    let mut e = 0;
    while x >= 0x10 {
        x = (x + 1) >> 1;
        e += 1;
    }
    ((e + 1) << 3) | (x - 8)
}

impl<'a> Compiler<'a> {
    fn fs(&self) -> &FuncState {
        self.func_stack.last().unwrap()
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.func_stack.last_mut().unwrap()
    }

    // ---- Token handling ----

    fn current_token(&self) -> Result<Token, CompileError> {
        match self.lexer.current() {
            Ok(t) => Ok(t.token.clone()),
            Err(e) => Err(CompileError {
                message: e.message.clone(),
                line: e.line,
            }),
        }
    }

    fn current_line(&self) -> u32 {
        match self.lexer.current() {
            Ok(t) => t.span.line,
            Err(e) => e.line,
        }
    }

    fn check(&self, tok: &Token) -> bool {
        matches!(self.lexer.current(), Ok(t) if t.token == *tok)
    }

    fn advance(&mut self) -> Result<Token, CompileError> {
        Ok(self.lexer.advance()?.token)
    }

    fn test_next(&mut self, tok: &Token) -> Result<bool, CompileError> {
        if self.check(tok) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, tok: Token, what: &str) -> Result<(), CompileError> {
        if self.check(&tok) {
            self.advance()?;
            Ok(())
        } else {
            // Surface lexer errors instead of a generic mismatch
            self.current_token()?;
            Err(self.error(format!("{} expected near '{}'", what, self.lexer.token_text)))
        }
    }

    fn expect_name(&mut self) -> Result<StringId, CompileError> {
        match self.current_token()? {
            Token::Name(id) => {
                self.advance()?;
                Ok(id)
            }
            _ => Err(self.error(format!("name expected near '{}'", self.lexer.token_text))),
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            message: message.into(),
            line: self.current_line(),
        }
    }

    fn error_at(&self, line: u32, message: impl Into<String>) -> CompileError {
        CompileError {
            message: message.into(),
            line,
        }
    }

    // ---- Limits ----

    fn enter_level(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_SYNTAX_LEVELS {
            return Err(self.error("chunk has too many syntax levels"));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.depth -= 1;
    }

    /// Surface overflow flags accumulated by the scope manager.
    fn check_limits(&self) -> Result<(), CompileError> {
        let fs = self.fs();
        if fs.scope.reg_overflow {
            return Err(self.error("function or expression too complex"));
        }
        if fs.scope.local_overflow {
            return Err(self.error("too many local variables"));
        }
        if fs.upval_overflow {
            return Err(self.error("too many upvalues"));
        }
        Ok(())
    }

    // ---- Emission ----

    fn emit(&mut self, inst: Instruction) -> usize {
        let line = self.lexer.lastline;
        self.fs_mut().proto.emit(inst, line)
    }

    fn emit_at(&mut self, inst: Instruction, line: u32) -> usize {
        self.fs_mut().proto.emit(inst, line)
    }

    fn current_pc(&self) -> usize {
        self.fs().proto.code_len()
    }

    fn emit_jump(&mut self) -> usize {
        self.emit(Instruction::asbx(OpCode::Jmp, 0, 0))
    }

    fn patch_jump(&mut self, pc: usize) -> Result<(), CompileError> {
        let target = self.current_pc();
        self.patch_jump_to(pc, target)
    }

    /// Point the jump at `pc` to `target`, preserving its A field.
    fn patch_jump_to(&mut self, pc: usize, target: usize) -> Result<(), CompileError> {
        let offset = target as i64 - pc as i64 - 1;
        if offset < MIN_SBX as i64 || offset > MAX_SBX as i64 {
            return Err(self.error("control structure too long"));
        }
        self.fs_mut().proto.get_mut(pc).set_sbx(offset as i32);
        Ok(())
    }

    fn emit_load_constant(&mut self, reg: u8, k: u32, line: u32) {
        if k <= MAX_BX {
            self.emit_at(Instruction::abx(OpCode::LoadK, reg as u32, k), line);
        } else {
            self.emit_at(Instruction::abx(OpCode::LoadKX, reg as u32, 0), line);
            self.emit_at(Instruction::ax(OpCode::ExtraArg, k), line);
        }
    }

    // ---- Register discipline ----

    /// Free a register if it is the top-of-stack temporary.
    fn free_temp_reg(&mut self, reg: u8) {
        let fs = self.fs_mut();
        if reg as u32 + 1 == fs.scope.free_reg as u32 && reg >= fs.scope.locals_top() {
            fs.scope.free_reg_to(reg);
        }
    }

    fn free_rk_temp(&mut self, rk: u32) {
        if !opcode::is_rk_const(rk) {
            self.free_temp_reg(rk as u8);
        }
    }

    /// Free any temporaries an undischarged expression is holding.
    fn free_expr_regs(&mut self, e: &ExprDesc) {
        match e {
            ExprDesc::Register(r) => self.free_temp_reg(*r),
            ExprDesc::Indexed { table, key } => {
                if let IndexKey::Register(k) = key {
                    self.free_temp_reg(*k);
                }
                self.free_temp_reg(*table);
            }
            _ => {}
        }
    }

    // ---- Discharging expressions into registers ----

    /// Materialize an expression's value in a specific register.
    fn discharge_to_reg(&mut self, e: ExprDesc, reg: u8) -> Result<(), CompileError> {
        let line = self.lexer.lastline;
        let r = reg as u32;
        match e {
            ExprDesc::Void => {}
            ExprDesc::Nil => {
                self.emit_at(Instruction::abc(OpCode::LoadNil, r, 0, 0), line);
            }
            ExprDesc::True => {
                self.emit_at(Instruction::abc(OpCode::LoadBool, r, 1, 0), line);
            }
            ExprDesc::False => {
                self.emit_at(Instruction::abc(OpCode::LoadBool, r, 0, 0), line);
            }
            ExprDesc::Number(n) => {
                let k = self.fs_mut().add_constant(Constant::Number(n));
                self.emit_load_constant(reg, k, line);
            }
            ExprDesc::Str(id) => {
                let k = self.fs_mut().add_string_constant(id);
                self.emit_load_constant(reg, k, line);
            }
            ExprDesc::Register(src) => {
                if src != reg {
                    self.emit_at(Instruction::abc(OpCode::Move, r, src as u32, 0), line);
                }
            }
            ExprDesc::Upvalue(idx) => {
                self.emit_at(Instruction::abc(OpCode::GetUpval, r, idx as u32, 0), line);
            }
            ExprDesc::Constant(k) => {
                self.emit_load_constant(reg, k, line);
            }
            ExprDesc::Global { env_upval, name_k } => {
                if name_k <= MAX_INDEX_RK {
                    self.emit_at(
                        Instruction::abc(
                            OpCode::GetTabUp,
                            r,
                            env_upval as u32,
                            opcode::rk_const(name_k),
                        ),
                        line,
                    );
                } else {
                    // Constant pool outgrew the RK range: go through registers.
                    self.emit_at(
                        Instruction::abc(OpCode::GetUpval, r, env_upval as u32, 0),
                        line,
                    );
                    let key = self.fs_mut().scope.alloc_reg();
                    self.emit_load_constant(key, name_k, line);
                    self.emit_at(Instruction::abc(OpCode::GetTable, r, r, key as u32), line);
                    self.free_temp_reg(key);
                }
            }
            ExprDesc::Indexed { table, key } => {
                let key_rk = match key {
                    IndexKey::Constant(k) => opcode::rk_const(k),
                    IndexKey::Register(kr) => kr as u32,
                };
                self.emit_at(
                    Instruction::abc(OpCode::GetTable, r, table as u32, key_rk),
                    line,
                );
            }
            ExprDesc::Relocatable(pc) => {
                self.fs_mut().proto.get_mut(pc).set_a(r);
            }
            ExprDesc::Jump(pc) => {
                // Materialize a comparison as a boolean: the true path
                // falls through to the first LoadBool, which skips the
                // second; the false jump lands on the second.
                self.emit_at(Instruction::abc(OpCode::LoadBool, r, 1, 1), line);
                let false_pc = self.current_pc();
                self.emit_at(Instruction::abc(OpCode::LoadBool, r, 0, 0), line);
                self.patch_jump_to(pc, false_pc)?;
            }
            ExprDesc::Call(pc) => {
                self.fs_mut().proto.get_mut(pc).set_c(2);
                let a = self.fs().proto.code[pc].a();
                if a != r {
                    self.emit_at(Instruction::abc(OpCode::Move, r, a, 0), line);
                }
            }
            ExprDesc::Vararg(pc) => {
                *self.fs_mut().proto.get_mut(pc) = Instruction::abc(OpCode::VarArg, r, 2, 0);
            }
        }
        Ok(())
    }

    /// Put the expression in some register and return it. Values already
    /// in a register (including a call's reserved base) stay put.
    fn discharge_to_any_reg(&mut self, e: ExprDesc) -> Result<u8, CompileError> {
        match e {
            ExprDesc::Register(r) => Ok(r),
            ExprDesc::Call(pc) => {
                self.fs_mut().proto.get_mut(pc).set_c(2);
                Ok(self.fs().proto.code[pc].a() as u8)
            }
            e => self.discharge_to_next_reg(e),
        }
    }

    /// Put the expression in the next free register.
    fn discharge_to_next_reg(&mut self, e: ExprDesc) -> Result<u8, CompileError> {
        if let ExprDesc::Call(pc) = e {
            let a = self.fs().proto.code[pc].a() as u8;
            if a as u32 + 1 == self.fs().scope.free_reg as u32 {
                // Single result lands in the call's reserved base.
                self.fs_mut().proto.get_mut(pc).set_c(2);
                return Ok(a);
            }
        }
        self.free_expr_regs(&e);
        let reg = self.fs_mut().scope.alloc_reg();
        self.discharge_to_reg(e, reg)?;
        Ok(reg)
    }

    /// Discharge into an exact slot and set the register frontier just
    /// above it.
    fn discharge_next(&mut self, e: ExprDesc, reg: u8) -> Result<(), CompileError> {
        self.discharge_to_reg(e, reg)?;
        let fs = self.fs_mut();
        fs.scope.free_reg_to(reg + 1);
        fs.scope.reserve_to(reg + 1);
        Ok(())
    }

    // ---- RK operands ----

    /// Add a literal to the constant pool, returning its index.
    fn literal_constant(&mut self, e: &ExprDesc) -> u32 {
        let k = match e {
            ExprDesc::Nil => Constant::Nil,
            ExprDesc::True => Constant::Boolean(true),
            ExprDesc::False => Constant::Boolean(false),
            ExprDesc::Number(n) => Constant::Number(*n),
            ExprDesc::Str(id) => Constant::String(*id),
            _ => unreachable!("not a literal"),
        };
        self.fs_mut().add_constant(k)
    }

    /// Turn an expression into an RK operand: a constant index when it
    /// fits, a register otherwise.
    fn exp_to_rk(&mut self, e: ExprDesc) -> Result<u32, CompileError> {
        if e.is_literal() {
            let k = self.literal_constant(&e);
            if k <= MAX_INDEX_RK {
                return Ok(opcode::rk_const(k));
            }
            let line = self.lexer.lastline;
            let reg = self.fs_mut().scope.alloc_reg();
            self.emit_load_constant(reg, k, line);
            return Ok(reg as u32);
        }
        if let ExprDesc::Constant(k) = e {
            if k <= MAX_INDEX_RK {
                return Ok(opcode::rk_const(k));
            }
        }
        let reg = self.discharge_to_any_reg(e)?;
        Ok(reg as u32)
    }

    /// Turn an expression into a table-index key.
    fn expr_to_index_key(&mut self, e: ExprDesc) -> Result<IndexKey, CompileError> {
        if e.is_literal() {
            let k = self.literal_constant(&e);
            if k <= MAX_INDEX_RK {
                return Ok(IndexKey::Constant(k));
            }
            let line = self.lexer.lastline;
            let reg = self.fs_mut().scope.alloc_reg();
            self.emit_load_constant(reg, k, line);
            return Ok(IndexKey::Register(reg));
        }
        let reg = self.discharge_to_any_reg(e)?;
        Ok(IndexKey::Register(reg))
    }

    /// Prepare a left operand before the right side is parsed. Literals
    /// stay symbolic so constant folding can still apply; anything with
    /// side effects is discharged now to preserve evaluation order.
    fn operand_for_rk(&mut self, e: ExprDesc) -> Result<ExprDesc, CompileError> {
        if e.is_literal() || matches!(e, ExprDesc::Constant(_)) {
            return Ok(e);
        }
        let reg = self.discharge_to_any_reg(e)?;
        Ok(ExprDesc::Register(reg))
    }

    // ---- Expressions ----

    fn expression(&mut self) -> Result<ExprDesc, CompileError> {
        self.sub_expression(0)
    }

    fn sub_expression(&mut self, limit: u8) -> Result<ExprDesc, CompileError> {
        self.enter_level()?;
        let result = self.sub_expression_inner(limit);
        self.leave_level();
        result
    }

    fn sub_expression_inner(&mut self, limit: u8) -> Result<ExprDesc, CompileError> {
        let e = match self.current_token()? {
            Token::Not => {
                self.advance()?;
                let operand = self.sub_expression(UNARY_PRIORITY)?;
                self.code_unary_op(UnOp::Not, operand)?
            }
            Token::Minus => {
                self.advance()?;
                let operand = self.sub_expression(UNARY_PRIORITY)?;
                self.code_unary_op(UnOp::Neg, operand)?
            }
            Token::Hash => {
                self.advance()?;
                let operand = self.sub_expression(UNARY_PRIORITY)?;
                self.code_unary_op(UnOp::Len, operand)?
            }
            _ => self.simple_expression()?,
        };
        self.sub_expression_tail(e, limit)
    }

    /// Precedence-climbing loop over binary operators.
    fn sub_expression_tail(
        &mut self,
        mut e: ExprDesc,
        limit: u8,
    ) -> Result<ExprDesc, CompileError> {
        loop {
            self.check_limits()?;
            let op = match binop_from_token(&self.current_token()?) {
                Some(op) => op,
                None => break,
            };
            let (left_prec, right_prec) = op.priority();
            if left_prec <= limit {
                break;
            }
            self.advance()?;
            e = match op {
                BinOp::And | BinOp::Or => self.code_short_circuit(op, e, right_prec)?,
                BinOp::Concat => self.code_concat(e)?,
                _ => {
                    let lhs = self.operand_for_rk(e)?;
                    let rhs = self.sub_expression(right_prec)?;
                    if op.is_comparison() {
                        self.code_comparison(op, lhs, rhs)?
                    } else {
                        self.code_arith(op, lhs, rhs)?
                    }
                }
            };
        }
        Ok(e)
    }

    fn simple_expression(&mut self) -> Result<ExprDesc, CompileError> {
        match self.current_token()? {
            Token::Number(n) => {
                self.advance()?;
                Ok(ExprDesc::Number(n))
            }
            Token::String(id) => {
                self.advance()?;
                Ok(ExprDesc::Str(id))
            }
            Token::Nil => {
                self.advance()?;
                Ok(ExprDesc::Nil)
            }
            Token::True => {
                self.advance()?;
                Ok(ExprDesc::True)
            }
            Token::False => {
                self.advance()?;
                Ok(ExprDesc::False)
            }
            Token::DotDotDot => {
                if !self.fs().proto.is_vararg {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
                self.advance()?;
                let pc = self.emit(Instruction::abc(OpCode::VarArg, 0, 2, 0));
                Ok(ExprDesc::Vararg(pc))
            }
            Token::LBrace => self.table_constructor(),
            Token::Function => {
                let line = self.current_line();
                self.advance()?;
                self.function_body(false, line)
            }
            _ => self.primary_expression(),
        }
    }

    fn primary_expression(&mut self) -> Result<ExprDesc, CompileError> {
        let e = match self.current_token()? {
            Token::Name(id) => {
                self.advance()?;
                self.resolve_name(id)?
            }
            Token::LParen => {
                self.advance()?;
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                // Parentheses truncate multiple values to one.
                match inner {
                    e @ (ExprDesc::Call(_) | ExprDesc::Vararg(_)) => {
                        ExprDesc::Register(self.discharge_to_any_reg(e)?)
                    }
                    other => other,
                }
            }
            _ => {
                return Err(
                    self.error(format!("unexpected symbol near '{}'", self.lexer.token_text))
                )
            }
        };
        self.finish_primary_expression(e)
    }

    /// Parse indexing, method-call, and call suffixes.
    fn finish_primary_expression(&mut self, mut e: ExprDesc) -> Result<ExprDesc, CompileError> {
        loop {
            match self.current_token()? {
                Token::Dot => {
                    self.advance()?;
                    let name = self.expect_name()?;
                    e = self.index_by_string(e, name)?;
                }
                Token::LBracket => {
                    self.advance()?;
                    let table_reg = self.discharge_to_any_reg(e)?;
                    let key_e = self.expression()?;
                    self.expect(Token::RBracket, "']'")?;
                    let key = self.expr_to_index_key(key_e)?;
                    e = ExprDesc::Indexed {
                        table: table_reg,
                        key,
                    };
                }
                Token::Colon => {
                    self.advance()?;
                    let name = self.expect_name()?;
                    let line = self.lexer.lastline;
                    let table_reg = self.discharge_to_any_reg(e)?;
                    let k = self.fs_mut().add_string_constant(name);
                    if k <= MAX_INDEX_RK {
                        self.free_temp_reg(table_reg);
                        let base = self.fs_mut().scope.alloc_reg();
                        self.fs_mut().scope.alloc_reg(); // slot for self
                        self.emit_at(
                            Instruction::abc(
                                OpCode::Self_,
                                base as u32,
                                table_reg as u32,
                                opcode::rk_const(k),
                            ),
                            line,
                        );
                        e = self.finish_call(base, 1)?;
                    } else {
                        let base = self.fs_mut().scope.alloc_reg();
                        self.fs_mut().scope.alloc_reg(); // slot for self
                        let key_reg = self.fs_mut().scope.alloc_reg();
                        self.emit_load_constant(key_reg, k, line);
                        self.emit_at(
                            Instruction::abc(
                                OpCode::Self_,
                                base as u32,
                                table_reg as u32,
                                key_reg as u32,
                            ),
                            line,
                        );
                        self.fs_mut().scope.free_reg_to(base + 2);
                        e = self.finish_call(base, 1)?;
                    }
                }
                Token::LParen | Token::LBrace | Token::String(_) => {
                    let func_reg = self.discharge_to_next_reg(e)?;
                    e = self.finish_call(func_reg, 0)?;
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn index_by_string(&mut self, e: ExprDesc, name: StringId) -> Result<ExprDesc, CompileError> {
        let table_reg = self.discharge_to_any_reg(e)?;
        let k = self.fs_mut().add_string_constant(name);
        let key = if k <= MAX_INDEX_RK {
            IndexKey::Constant(k)
        } else {
            let line = self.lexer.lastline;
            let reg = self.fs_mut().scope.alloc_reg();
            self.emit_load_constant(reg, k, line);
            IndexKey::Register(reg)
        };
        Ok(ExprDesc::Indexed {
            table: table_reg,
            key,
        })
    }

    /// Emit a call with the function at `base` and `implicit` extra
    /// arguments (the receiver of a method call) already in place.
    fn finish_call(&mut self, base: u8, implicit: u8) -> Result<ExprDesc, CompileError> {
        let line = self.lexer.lastline;
        let arg_base = base + 1 + implicit;
        let (nargs, open) = match self.current_token()? {
            Token::LParen => {
                self.advance()?;
                if self.test_next(&Token::RParen)? {
                    (0, None)
                } else {
                    let result = self.expression_list_multi(arg_base)?;
                    self.expect(Token::RParen, "')'")?;
                    result
                }
            }
            Token::LBrace => {
                let t = self.table_constructor()?;
                self.discharge_next(t, arg_base)?;
                (1, None)
            }
            Token::String(id) => {
                self.advance()?;
                self.discharge_next(ExprDesc::Str(id), arg_base)?;
                (1, None)
            }
            _ => return Err(self.error("function arguments expected")),
        };
        let b = match open {
            Some(_) => 0,
            None => implicit as u32 + nargs as u32 + 1,
        };
        let pc = self.emit_at(Instruction::abc(OpCode::Call, base as u32, b, 1), line);
        self.fs_mut().scope.free_reg_to(base + 1);
        Ok(ExprDesc::Call(pc))
    }

    /// Parse a comma-separated expression list into consecutive registers
    /// starting at `base`. Returns the number of fixed values discharged
    /// and the pc of a trailing open call/vararg, if any. An open tail is
    /// left producing all its values.
    fn expression_list_multi(
        &mut self,
        base: u8,
    ) -> Result<(u8, Option<usize>), CompileError> {
        let mut n: u8 = 0;
        loop {
            self.check_limits()?;
            if base as u32 + n as u32 >= 249 {
                return Err(self.error("function or expression too complex"));
            }
            let e = self.expression()?;
            if self.test_next(&Token::Comma)? {
                self.discharge_next(e, base + n)?;
                n += 1;
            } else {
                match e {
                    ExprDesc::Call(pc) => {
                        self.fs_mut().proto.get_mut(pc).set_c(0);
                        return Ok((n, Some(pc)));
                    }
                    ExprDesc::Vararg(pc) => {
                        *self.fs_mut().proto.get_mut(pc) =
                            Instruction::abc(OpCode::VarArg, (base + n) as u32, 0, 0);
                        return Ok((n, Some(pc)));
                    }
                    e => {
                        self.discharge_next(e, base + n)?;
                        return Ok((n + 1, None));
                    }
                }
            }
        }
    }

    /// Adjust a value list to exactly `wanted` values: widen or narrow an
    /// open tail, pad with nils, or drop extras.
    fn adjust_list(
        &mut self,
        base: u8,
        n: u8,
        open_pc: Option<usize>,
        wanted: u8,
    ) -> Result<(), CompileError> {
        let line = self.lexer.lastline;
        if base as u32 + wanted as u32 > 249 {
            return Err(self.error("function or expression too complex"));
        }
        match open_pc {
            Some(pc) => {
                let results = if wanted > n { (wanted - n) as u32 } else { 0 };
                let inst = self.fs().proto.code[pc];
                match inst.opcode() {
                    OpCode::Call => self.fs_mut().proto.get_mut(pc).set_c(results + 1),
                    OpCode::VarArg => self.fs_mut().proto.get_mut(pc).set_b(results + 1),
                    _ => {}
                }
            }
            None => {
                if wanted > n {
                    self.emit_at(
                        Instruction::abc(
                            OpCode::LoadNil,
                            (base + n) as u32,
                            (wanted - n) as u32 - 1,
                            0,
                        ),
                        line,
                    );
                }
            }
        }
        let fs = self.fs_mut();
        fs.scope.free_reg_to(base + wanted);
        fs.scope.reserve_to(base + wanted);
        Ok(())
    }

    // ---- Operators ----

    fn code_unary_op(&mut self, op: UnOp, e: ExprDesc) -> Result<ExprDesc, CompileError> {
        match (op, &e) {
            (UnOp::Neg, ExprDesc::Number(n)) => return Ok(ExprDesc::Number(-*n)),
            (UnOp::Not, ExprDesc::Nil) | (UnOp::Not, ExprDesc::False) => {
                return Ok(ExprDesc::True)
            }
            (UnOp::Not, ExprDesc::True)
            | (UnOp::Not, ExprDesc::Number(_))
            | (UnOp::Not, ExprDesc::Str(_)) => return Ok(ExprDesc::False),
            _ => {}
        }
        let line = self.lexer.lastline;
        let reg = self.discharge_to_any_reg(e)?;
        self.free_temp_reg(reg);
        let dest = self.fs_mut().scope.alloc_reg();
        let opcode = match op {
            UnOp::Neg => OpCode::Unm,
            UnOp::Not => OpCode::Not,
            UnOp::Len => OpCode::Len,
        };
        self.emit_at(
            Instruction::abc(opcode, dest as u32, reg as u32, 0),
            line,
        );
        Ok(ExprDesc::Register(dest))
    }

    fn code_arith(
        &mut self,
        op: BinOp,
        lhs: ExprDesc,
        rhs: ExprDesc,
    ) -> Result<ExprDesc, CompileError> {
        if let (ExprDesc::Number(a), ExprDesc::Number(b)) = (&lhs, &rhs) {
            if let Some(v) = fold_arith(op, *a, *b) {
                return Ok(ExprDesc::Number(v));
            }
        }
        let line = self.lexer.lastline;
        let rkb = self.exp_to_rk(lhs)?;
        let rkc = self.exp_to_rk(rhs)?;
        self.free_rk_temp(rkc);
        self.free_rk_temp(rkb);
        let dest = self.fs_mut().scope.alloc_reg();
        let opcode = match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Div => OpCode::Div,
            BinOp::Mod => OpCode::Mod,
            BinOp::Pow => OpCode::Pow,
            _ => unreachable!("not an arithmetic operator"),
        };
        self.emit_at(Instruction::abc(opcode, dest as u32, rkb, rkc), line);
        Ok(ExprDesc::Register(dest))
    }

    /// Emit a comparison followed by its false-branch jump. Greater-than
    /// forms compile as less-than with the operands swapped.
    fn code_comparison(
        &mut self,
        op: BinOp,
        lhs: ExprDesc,
        rhs: ExprDesc,
    ) -> Result<ExprDesc, CompileError> {
        let line = self.lexer.lastline;
        let rkb = self.exp_to_rk(lhs)?;
        let rkc = self.exp_to_rk(rhs)?;
        self.free_rk_temp(rkc);
        self.free_rk_temp(rkb);
        let (opcode, a, b, c) = match op {
            BinOp::Eq => (OpCode::Eq, 0, rkb, rkc),
            BinOp::NotEq => (OpCode::Eq, 1, rkb, rkc),
            BinOp::Lt => (OpCode::Lt, 0, rkb, rkc),
            BinOp::LtEq => (OpCode::Le, 0, rkb, rkc),
            BinOp::Gt => (OpCode::Lt, 0, rkc, rkb),
            BinOp::GtEq => (OpCode::Le, 0, rkc, rkb),
            _ => unreachable!("not a comparison"),
        };
        self.emit_at(Instruction::abc(opcode, a, b, c), line);
        let pc = self.emit_jump();
        Ok(ExprDesc::Jump(pc))
    }

    /// `and`/`or` with a TestSet over the left operand. The destination
    /// is a fresh temporary when the left value lives in a local, so the
    /// local is never clobbered.
    fn code_short_circuit(
        &mut self,
        op: BinOp,
        left: ExprDesc,
        right_prec: u8,
    ) -> Result<ExprDesc, CompileError> {
        let line = self.lexer.lastline;
        let left_reg = self.discharge_to_any_reg(left)?;
        let dest = if left_reg < self.fs().scope.locals_top() {
            self.fs_mut().scope.alloc_reg()
        } else {
            left_reg
        };
        let c = if op == BinOp::And { 0 } else { 1 };
        self.emit_at(
            Instruction::abc(OpCode::TestSet, dest as u32, left_reg as u32, c),
            line,
        );
        let jump_pc = self.emit_jump();
        let right = self.sub_expression(right_prec)?;
        self.discharge_next(right, dest)?;
        self.patch_jump(jump_pc)?;
        Ok(ExprDesc::Register(dest))
    }

    /// Concatenation chain: operands in consecutive registers, one
    /// Concat instruction spanning them.
    fn code_concat(&mut self, first: ExprDesc) -> Result<ExprDesc, CompileError> {
        let base = self.discharge_to_next_reg(first)?;
        let mut last;
        loop {
            let operand = self.sub_expression(5)?;
            last = self.discharge_to_next_reg(operand)?;
            if !self.test_next(&Token::DotDot)? {
                break;
            }
        }
        let line = self.lexer.lastline;
        self.emit_at(
            Instruction::abc(OpCode::Concat, base as u32, base as u32, last as u32),
            line,
        );
        self.fs_mut().scope.free_reg_to(base + 1);
        Ok(ExprDesc::Register(base))
    }

    /// Emit a Test/comparison jump taken when the condition is false.
    /// Returns the pc of the jump to patch.
    fn code_false_jump(&mut self, cond: ExprDesc) -> Result<usize, CompileError> {
        match cond {
            ExprDesc::Jump(pc) => Ok(pc),
            e => {
                let line = self.lexer.lastline;
                let reg = self.discharge_to_any_reg(e)?;
                self.free_temp_reg(reg);
                self.emit_at(Instruction::abc(OpCode::Test, reg as u32, 0, 0), line);
                Ok(self.emit_jump())
            }
        }
    }

    // ---- Table constructors ----

    fn table_constructor(&mut self) -> Result<ExprDesc, CompileError> {
        let line = self.current_line();
        self.expect(Token::LBrace, "'{'")?;
        let table_reg = self.fs_mut().scope.alloc_reg();
        let newtable_pc = self.emit_at(
            Instruction::abc(OpCode::NewTable, table_reg as u32, 0, 0),
            line,
        );
        let mut array_total: u32 = 0;
        let mut hash_count: u32 = 0;
        let mut pending: u8 = 0;
        let mut held: Option<ExprDesc> = None;

        loop {
            self.check_limits()?;
            if self.check(&Token::RBrace) {
                break;
            }
            if let Some(prev) = held.take() {
                self.flush_array_item(prev, table_reg, &mut pending, &mut array_total)?;
            }
            match self.current_token()? {
                Token::LBracket => {
                    self.advance()?;
                    let key_e = self.expression()?;
                    self.expect(Token::RBracket, "']'")?;
                    self.expect(Token::Assign, "'='")?;
                    let key_rk = self.exp_to_rk(key_e)?;
                    let val_e = self.expression()?;
                    let val_rk = self.exp_to_rk(val_e)?;
                    self.emit(Instruction::abc(
                        OpCode::SetTable,
                        table_reg as u32,
                        key_rk,
                        val_rk,
                    ));
                    self.free_rk_temp(val_rk);
                    self.free_rk_temp(key_rk);
                    hash_count += 1;
                }
                Token::Name(id) => {
                    self.advance()?;
                    if self.test_next(&Token::Assign)? {
                        let k = self.fs_mut().add_string_constant(id);
                        let key_rk = if k <= MAX_INDEX_RK {
                            opcode::rk_const(k)
                        } else {
                            let kline = self.lexer.lastline;
                            let reg = self.fs_mut().scope.alloc_reg();
                            self.emit_load_constant(reg, k, kline);
                            reg as u32
                        };
                        let val_e = self.expression()?;
                        let val_rk = self.exp_to_rk(val_e)?;
                        self.emit(Instruction::abc(
                            OpCode::SetTable,
                            table_reg as u32,
                            key_rk,
                            val_rk,
                        ));
                        self.free_rk_temp(val_rk);
                        self.free_rk_temp(key_rk);
                        hash_count += 1;
                    } else {
                        let e = self.resolve_name(id)?;
                        let e = self.finish_primary_expression(e)?;
                        let e = self.sub_expression_tail(e, 0)?;
                        held = Some(e);
                    }
                }
                _ => {
                    let e = self.expression()?;
                    held = Some(e);
                }
            }
            if !(self.test_next(&Token::Comma)? || self.test_next(&Token::Semi)?) {
                break;
            }
        }
        self.expect(Token::RBrace, "'}'")?;

        if let Some(last) = held.take() {
            if last.is_multi() {
                match last {
                    ExprDesc::Call(pc) => {
                        self.fs_mut().proto.get_mut(pc).set_c(0);
                    }
                    ExprDesc::Vararg(pc) => {
                        let a = table_reg as u32 + 1 + pending as u32;
                        *self.fs_mut().proto.get_mut(pc) =
                            Instruction::abc(OpCode::VarArg, a, 0, 0);
                    }
                    _ => {}
                }
                array_total += 1;
                self.emit_setlist(table_reg, 0, (array_total - 1) / FIELDS_PER_FLUSH + 1);
            } else {
                self.flush_array_item(last, table_reg, &mut pending, &mut array_total)?;
                if pending > 0 {
                    self.emit_setlist(
                        table_reg,
                        pending as u32,
                        (array_total - 1) / FIELDS_PER_FLUSH + 1,
                    );
                }
            }
        } else if pending > 0 {
            self.emit_setlist(
                table_reg,
                pending as u32,
                (array_total - 1) / FIELDS_PER_FLUSH + 1,
            );
        }

        let b = int2fb(array_total);
        let c = int2fb(hash_count);
        let inst = self.fs_mut().proto.get_mut(newtable_pc);
        inst.set_b(b);
        inst.set_c(c);
        self.fs_mut().scope.free_reg_to(table_reg + 1);
        Ok(ExprDesc::Register(table_reg))
    }

    fn flush_array_item(
        &mut self,
        e: ExprDesc,
        table_reg: u8,
        pending: &mut u8,
        array_total: &mut u32,
    ) -> Result<(), CompileError> {
        if table_reg as u32 + 1 + *pending as u32 >= 249 {
            return Err(self.error("function or expression too complex"));
        }
        self.discharge_next(e, table_reg + 1 + *pending)?;
        *pending += 1;
        *array_total += 1;
        if *pending as u32 == FIELDS_PER_FLUSH {
            self.emit_setlist(
                table_reg,
                FIELDS_PER_FLUSH,
                (*array_total - 1) / FIELDS_PER_FLUSH + 1,
            );
            *pending = 0;
        }
        Ok(())
    }

    fn emit_setlist(&mut self, table_reg: u8, b: u32, batch: u32) {
        if batch <= MAX_C {
            self.emit(Instruction::abc(OpCode::SetList, table_reg as u32, b, batch));
        } else {
            self.emit(Instruction::abc(OpCode::SetList, table_reg as u32, b, 0));
            self.emit(Instruction::ax(OpCode::ExtraArg, batch));
        }
        self.fs_mut().scope.free_reg_to(table_reg + 1);
    }

    // ---- Name resolution ----

    /// Resolve a name as a local, an upvalue, or a global access through
    /// the _ENV chain.
    fn resolve_name(&mut self, name: StringId) -> Result<ExprDesc, CompileError> {
        if let Some(local) = self.fs().scope.resolve_local(name) {
            return Ok(ExprDesc::Register(local.reg));
        }
        let top = self.func_stack.len() - 1;
        if let Some(idx) = self.resolve_upvalue(top, name) {
            return Ok(ExprDesc::Upvalue(idx));
        }
        // Global: sugar for _ENV[name]
        let env_id = self.lexer.strings.intern(b"_ENV");
        let k = self.fs_mut().add_string_constant(name);
        if let Some(local) = self.fs().scope.resolve_local(env_id) {
            let table = local.reg;
            let key = if k <= MAX_INDEX_RK {
                IndexKey::Constant(k)
            } else {
                let line = self.lexer.lastline;
                let reg = self.fs_mut().scope.alloc_reg();
                self.emit_load_constant(reg, k, line);
                IndexKey::Register(reg)
            };
            return Ok(ExprDesc::Indexed { table, key });
        }
        match self.resolve_upvalue(top, env_id) {
            Some(env_upval) => Ok(ExprDesc::Global { env_upval, name_k: k }),
            None => Err(self.error("variable resolution failed")),
        }
    }

    /// Resolve a name as an upvalue of the function at `fs_idx`, walking
    /// the function stack outward and threading captures back in.
    fn resolve_upvalue(&mut self, fs_idx: usize, name: StringId) -> Option<u8> {
        if let Some(pos) = self.func_stack[fs_idx]
            .upvalues
            .iter()
            .position(|u| u.name == name)
        {
            return Some(pos as u8);
        }
        if fs_idx == 0 {
            return None;
        }
        let parent = fs_idx - 1;
        if let Some(reg) = self.func_stack[parent]
            .scope
            .resolve_local(name)
            .map(|l| l.reg)
        {
            self.func_stack[parent].scope.mark_captured(reg);
            return Some(self.add_upvalue(fs_idx, name, true, reg));
        }
        if let Some(idx) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(fs_idx, name, false, idx));
        }
        None
    }

    fn add_upvalue(&mut self, fs_idx: usize, name: StringId, in_stack: bool, index: u8) -> u8 {
        let fs = &mut self.func_stack[fs_idx];
        if let Some(pos) = fs
            .upvalues
            .iter()
            .position(|u| u.name == name && u.in_stack == in_stack && u.index == index)
        {
            return pos as u8;
        }
        if fs.upvalues.len() >= MAX_UPVALUES {
            fs.upval_overflow = true;
            return 0;
        }
        fs.upvalues.push(UpvalInfo {
            name,
            in_stack,
            index,
        });
        (fs.upvalues.len() - 1) as u8
    }

    // ---- Functions ----

    /// Parse a function body (parameters through `end`) and emit a
    /// Closure instruction in the enclosing function.
    fn function_body(&mut self, is_method: bool, line: u32) -> Result<ExprDesc, CompileError> {
        let source = self.fs().proto.source;
        let mut fs = FuncState::new();
        fs.proto.source = source;
        fs.proto.line_defined = line;
        fs.scope.enter_block(false);
        self.func_stack.push(fs);

        if is_method {
            let self_id = self.lexer.strings.intern(b"self");
            self.fs_mut().scope.add_local(self_id, 0);
            self.fs_mut().proto.num_params = 1;
        }
        self.expect(Token::LParen, "'('")?;
        if !self.check(&Token::RParen) {
            loop {
                match self.current_token()? {
                    Token::Name(id) => {
                        self.advance()?;
                        if self.fs().proto.num_params >= 200 {
                            return Err(self.error("too many local variables"));
                        }
                        self.fs_mut().scope.add_local(id, 0);
                        self.fs_mut().proto.num_params += 1;
                    }
                    Token::DotDotDot => {
                        self.advance()?;
                        self.fs_mut().proto.is_vararg = true;
                        break;
                    }
                    _ => return Err(self.error("parameter name expected")),
                }
                if !self.test_next(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')'")?;

        self.block()?;
        let end_line = self.current_line();
        self.expect(Token::End, "'end'")?;
        self.emit_at(Instruction::abc(OpCode::Return, 0, 1, 0), end_line);
        self.check_limits()?;
        let block = self.close_block_impl(false)?;
        self.check_unmatched_gotos(&block)?;

        let mut finished = self.func_stack.pop().unwrap();
        finished.proto.last_line_defined = end_line;
        let proto = finish_proto(finished);

        let parent = self.fs_mut();
        let proto_idx = parent.proto.protos.len() as u32;
        parent.proto.protos.push(proto);
        if proto_idx > MAX_BX {
            return Err(self.error("too many nested functions"));
        }
        let dest = self.fs_mut().scope.alloc_reg();
        self.emit_at(
            Instruction::abx(OpCode::Closure, dest as u32, proto_idx),
            line,
        );
        Ok(ExprDesc::Register(dest))
    }

    // ---- Blocks and statements ----

    fn block(&mut self) -> Result<(), CompileError> {
        loop {
            match self.current_token()? {
                Token::End | Token::Else | Token::ElseIf | Token::Until | Token::Eof => break,
                Token::Return => {
                    // return must be the last statement in a block
                    self.statement()?;
                    break;
                }
                _ => self.statement()?,
            }
        }
        Ok(())
    }

    fn statement(&mut self) -> Result<(), CompileError> {
        self.enter_level()?;
        let result = self.statement_inner();
        self.leave_level();
        result?;
        self.check_limits()?;
        // Release statement temporaries
        let top = {
            let fs = self.fs();
            let entry = fs
                .scope
                .blocks
                .last()
                .map(|b| b.first_free_reg_on_entry)
                .unwrap_or(0);
            fs.scope.locals_top().max(entry)
        };
        let fs = self.fs_mut();
        fs.scope.free_reg_to(top);
        fs.scope.reserve_to(top);
        Ok(())
    }

    fn statement_inner(&mut self) -> Result<(), CompileError> {
        match self.current_token()? {
            Token::Semi => {
                self.advance()?;
                Ok(())
            }
            Token::If => self.stat_if(),
            Token::While => self.stat_while(),
            Token::Do => {
                self.advance()?;
                self.fs_mut().scope.enter_block(false);
                self.block()?;
                self.close_block()?;
                self.expect(Token::End, "'end'")?;
                Ok(())
            }
            Token::For => self.stat_for(),
            Token::Repeat => self.stat_repeat(),
            Token::Function => self.stat_function(),
            Token::Local => self.stat_local(),
            Token::Return => self.stat_return(),
            Token::Break => self.stat_break(),
            Token::Goto => self.stat_goto(),
            Token::DoubleColon => self.stat_label(),
            _ => self.stat_expr_or_assign(),
        }
    }

    /// Close the current block, emitting an upvalue-closing jump when a
    /// local declared in it was captured.
    fn close_block(&mut self) -> Result<scope::BlockScope, CompileError> {
        self.close_block_impl(true)
    }

    fn close_block_impl(&mut self, emit_close: bool) -> Result<scope::BlockScope, CompileError> {
        let pc = self.current_pc();
        let resolved = self.fs_mut().scope.adjust_end_labels(pc);
        for (goto_pc, target_pc) in resolved {
            self.patch_jump_to(goto_pc, target_pc)?;
        }
        // A goto still pending against a label in this block would jump
        // into the scope of a local declared between them.
        {
            let fs = self.fs();
            let block = fs.scope.blocks.last().unwrap();
            for g in &block.pending_gotos {
                if block.labels.iter().any(|l| l.name == g.name) {
                    let goto_name = self.lexer.strings.get_display(g.name);
                    let local_name = fs
                        .scope
                        .locals
                        .get(g.num_locals)
                        .map(|l| self.lexer.strings.get_display(l.name))
                        .unwrap_or_default();
                    return Err(self.error_at(
                        g.line,
                        format!(
                            "'goto {}' jumps into the scope of local '{}'",
                            goto_name, local_name
                        ),
                    ));
                }
            }
        }
        if emit_close {
            if let Some(reg) = self.fs().scope.block_needs_close() {
                self.emit(Instruction::asbx(OpCode::Jmp, reg as u32 + 1, 0));
            }
        }
        let end_pc = self.current_pc() as u32;
        Ok(self.fs_mut().scope.leave_block_at_pc(end_pc))
    }

    fn check_unmatched_gotos(&self, block: &scope::BlockScope) -> Result<(), CompileError> {
        if let Some(g) = block.pending_gotos.first() {
            let name = self.lexer.strings.get_display(g.name);
            return Err(self.error_at(g.line, format!("no visible label '{}' for goto", name)));
        }
        Ok(())
    }

    fn stat_if(&mut self) -> Result<(), CompileError> {
        let mut escapes = Vec::new();
        loop {
            self.advance()?; // 'if' or 'elseif'
            let cond = self.expression()?;
            self.expect(Token::Then, "'then'")?;
            let false_jump = self.code_false_jump(cond)?;
            self.fs_mut().scope.enter_block(false);
            self.block()?;
            self.close_block()?;
            match self.current_token()? {
                Token::ElseIf => {
                    escapes.push(self.emit_jump());
                    self.patch_jump(false_jump)?;
                }
                Token::Else => {
                    escapes.push(self.emit_jump());
                    self.patch_jump(false_jump)?;
                    self.advance()?;
                    self.fs_mut().scope.enter_block(false);
                    self.block()?;
                    self.close_block()?;
                    break;
                }
                _ => {
                    self.patch_jump(false_jump)?;
                    break;
                }
            }
        }
        self.expect(Token::End, "'end'")?;
        for pc in escapes {
            self.patch_jump(pc)?;
        }
        Ok(())
    }

    fn stat_while(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'while'
        let loop_start = self.current_pc();
        let cond = self.expression()?;
        self.expect(Token::Do, "'do'")?;
        let exit_jump = self.code_false_jump(cond)?;
        self.fs_mut().scope.enter_block(true);
        self.block()?;
        let block = self.close_block()?;
        let back = self.emit_jump();
        self.patch_jump_to(back, loop_start)?;
        self.expect(Token::End, "'end'")?;
        self.patch_jump(exit_jump)?;
        for pc in block.break_jumps {
            self.patch_jump(pc)?;
        }
        Ok(())
    }

    fn stat_repeat(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'repeat'
        let loop_start = self.current_pc();
        self.fs_mut().scope.enter_block(true);
        self.block()?;
        self.expect(Token::Until, "'until'")?;
        // The condition sees locals declared inside the loop body.
        let cond = self.expression()?;
        let back_jump = self.code_false_jump(cond)?;
        if let Some(reg) = self.fs().scope.block_needs_close() {
            self.fs_mut().proto.get_mut(back_jump).set_a(reg as u32 + 1);
        }
        self.patch_jump_to(back_jump, loop_start)?;
        let block = self.close_block()?;
        for pc in block.break_jumps {
            self.patch_jump(pc)?;
        }
        Ok(())
    }

    fn stat_for(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'for'
        let name1 = self.expect_name()?;
        match self.current_token()? {
            Token::Assign => self.numeric_for(name1),
            Token::Comma | Token::In => self.generic_for(name1),
            _ => Err(self.error(format!(
                "'=' or 'in' expected near '{}'",
                self.lexer.token_text
            ))),
        }
    }

    fn numeric_for(&mut self, var: StringId) -> Result<(), CompileError> {
        self.advance()?; // '='
        let base = self.fs().scope.free_reg;
        if base as u32 + 4 > 249 {
            return Err(self.error("function or expression too complex"));
        }
        let init = self.expression()?;
        self.discharge_next(init, base)?;
        self.expect(Token::Comma, "','")?;
        let limit = self.expression()?;
        self.discharge_next(limit, base + 1)?;
        let step = if self.test_next(&Token::Comma)? {
            self.expression()?
        } else {
            ExprDesc::Number(1.0)
        };
        self.discharge_next(step, base + 2)?;
        self.expect(Token::Do, "'do'")?;
        let prep_pc = self.emit(Instruction::asbx(OpCode::ForPrep, base as u32, 0));
        self.fs_mut().scope.enter_block(true);
        let start_pc = self.current_pc() as u32;
        self.fs_mut().scope.add_local(var, start_pc);
        self.block()?;
        let block = self.close_block()?;
        let loop_pc = self.emit(Instruction::asbx(OpCode::ForLoop, base as u32, 0));
        let prep_sbx = loop_pc as i64 - prep_pc as i64 - 1;
        let loop_sbx = prep_pc as i64 - loop_pc as i64;
        if prep_sbx > MAX_SBX as i64 || loop_sbx < MIN_SBX as i64 {
            return Err(self.error("control structure too long"));
        }
        self.fs_mut().proto.get_mut(prep_pc).set_sbx(prep_sbx as i32);
        self.fs_mut().proto.get_mut(loop_pc).set_sbx(loop_sbx as i32);
        self.expect(Token::End, "'end'")?;
        for pc in block.break_jumps {
            self.patch_jump(pc)?;
        }
        self.fs_mut().scope.free_reg_to(base);
        Ok(())
    }

    fn generic_for(&mut self, name1: StringId) -> Result<(), CompileError> {
        let mut names = vec![name1];
        while self.test_next(&Token::Comma)? {
            names.push(self.expect_name()?);
            if names.len() > 200 {
                return Err(self.error("too many local variables"));
            }
        }
        self.expect(Token::In, "'in'")?;
        let base = self.fs().scope.free_reg;
        if base as u32 + 3 + names.len() as u32 > 249 {
            return Err(self.error("function or expression too complex"));
        }
        let (n, open) = self.expression_list_multi(base)?;
        self.adjust_list(base, n, open, 3)?;
        self.expect(Token::Do, "'do'")?;
        let prep = self.emit_jump();
        self.fs_mut().scope.enter_block(true);
        let start_pc = self.current_pc() as u32;
        for name in &names {
            self.fs_mut().scope.add_local(*name, start_pc);
        }
        let body_start = self.current_pc();
        self.block()?;
        let block = self.close_block()?;
        self.patch_jump(prep)?;
        let nvars = names.len() as u32;
        self.emit(Instruction::abc(OpCode::TForCall, base as u32, 0, nvars));
        let loop_pc = self.emit(Instruction::asbx(OpCode::TForLoop, base as u32 + 2, 0));
        let loop_sbx = body_start as i64 - loop_pc as i64 - 1;
        if loop_sbx < MIN_SBX as i64 {
            return Err(self.error("control structure too long"));
        }
        self.fs_mut().proto.get_mut(loop_pc).set_sbx(loop_sbx as i32);
        self.expect(Token::End, "'end'")?;
        for pc in block.break_jumps {
            self.patch_jump(pc)?;
        }
        self.fs_mut().scope.free_reg_to(base);
        Ok(())
    }

    fn stat_local(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'local'
        if self.test_next(&Token::Function)? {
            let line = self.lexer.lastline;
            let name = self.expect_name()?;
            let start_pc = self.current_pc() as u32;
            // Declared before the body, so the function can recurse.
            let reg = self.fs_mut().scope.add_local(name, start_pc);
            let e = self.function_body(false, line)?;
            self.discharge_next(e, reg)?;
            return Ok(());
        }
        let mut names = Vec::new();
        loop {
            names.push(self.expect_name()?);
            if names.len() > 200 {
                return Err(self.error("too many local variables"));
            }
            if !self.test_next(&Token::Comma)? {
                break;
            }
        }
        let base = self.fs().scope.free_reg;
        let nvars = names.len() as u8;
        if base as u32 + nvars as u32 > 249 {
            return Err(self.error("function or expression too complex"));
        }
        if self.test_next(&Token::Assign)? {
            let (n, open) = self.expression_list_multi(base)?;
            self.adjust_list(base, n, open, nvars)?;
        } else {
            self.emit(Instruction::abc(
                OpCode::LoadNil,
                base as u32,
                nvars as u32 - 1,
                0,
            ));
            self.fs_mut().scope.reserve_to(base + nvars);
        }
        // Convert the value slots into named locals
        self.fs_mut().scope.free_reg_to(base);
        let start_pc = self.current_pc() as u32;
        for name in names {
            self.fs_mut().scope.add_local(name, start_pc);
        }
        Ok(())
    }

    fn stat_function(&mut self) -> Result<(), CompileError> {
        let line = self.current_line();
        self.advance()?; // 'function'
        let name = self.expect_name()?;
        let mut target = self.resolve_name(name)?;
        let mut is_method = false;
        loop {
            match self.current_token()? {
                Token::Dot => {
                    self.advance()?;
                    let field = self.expect_name()?;
                    target = self.index_by_string(target, field)?;
                }
                Token::Colon => {
                    self.advance()?;
                    let field = self.expect_name()?;
                    target = self.index_by_string(target, field)?;
                    is_method = true;
                    break;
                }
                _ => break,
            }
        }
        let e = self.function_body(is_method, line)?;
        let val_reg = self.discharge_to_any_reg(e)?;
        self.code_store(target, val_reg)
    }

    fn stat_return(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'return'
        let line = self.lexer.lastline;
        let tok = self.current_token()?;
        let no_values = matches!(
            tok,
            Token::End | Token::Else | Token::ElseIf | Token::Until | Token::Eof | Token::Semi
        );
        if no_values {
            self.test_next(&Token::Semi)?;
            self.emit_at(Instruction::abc(OpCode::Return, 0, 1, 0), line);
            return Ok(());
        }
        let base = self.fs().scope.free_reg;
        let (n, open) = self.expression_list_multi(base)?;
        self.test_next(&Token::Semi)?;
        match open {
            Some(pc) if n == 0 && self.fs().proto.code[pc].opcode() == OpCode::Call => {
                // A lone call in return position becomes a tail call.
                let inst = self.fs().proto.code[pc];
                *self.fs_mut().proto.get_mut(pc) =
                    Instruction::abc(OpCode::TailCall, inst.a(), inst.b(), 0);
                self.emit_at(Instruction::abc(OpCode::Return, inst.a(), 0, 0), line);
            }
            Some(_) => {
                self.emit_at(Instruction::abc(OpCode::Return, base as u32, 0, 0), line);
            }
            None => {
                self.emit_at(
                    Instruction::abc(OpCode::Return, base as u32, n as u32 + 1, 0),
                    line,
                );
            }
        }
        Ok(())
    }

    fn stat_break(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'break'
        let a = self
            .fs()
            .scope
            .break_needs_close()
            .map(|r| r as u32 + 1)
            .unwrap_or(0);
        let pc = self.emit(Instruction::asbx(OpCode::Jmp, a, 0));
        match self.fs_mut().scope.find_loop_block() {
            Some(block) => {
                block.break_jumps.push(pc);
                Ok(())
            }
            None => Err(self.error("break outside a loop")),
        }
    }

    fn stat_goto(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'goto'
        let name = self.expect_name()?;
        let line = self.lexer.lastline;
        let num_locals = self.fs().scope.num_locals();
        if let Some((target_pc, label_locals)) = self.find_label(name) {
            // Backward goto: close upvalues of any captured local whose
            // scope it leaves.
            let a = {
                let fs = self.fs();
                fs.scope.locals[label_locals..]
                    .iter()
                    .filter(|l| l.is_captured)
                    .map(|l| l.reg)
                    .min()
                    .map(|r| r as u32 + 1)
                    .unwrap_or(0)
            };
            let pc = self.emit(Instruction::asbx(OpCode::Jmp, a, 0));
            self.patch_jump_to(pc, target_pc)?;
        } else {
            let pc = self.emit_jump();
            self.fs_mut()
                .scope
                .current_block_mut()
                .unwrap()
                .pending_gotos
                .push(PendingGoto {
                    name,
                    pc,
                    line,
                    num_locals,
                });
        }
        Ok(())
    }

    fn stat_label(&mut self) -> Result<(), CompileError> {
        self.advance()?; // '::'
        let name = self.expect_name()?;
        let line = self.lexer.lastline;
        self.expect(Token::DoubleColon, "'::'")?;
        if self.find_label(name).is_some() {
            let display = self.lexer.strings.get_display(name);
            return Err(self.error_at(line, format!("label '{}' already defined", display)));
        }
        let pc = self.current_pc();
        let num_locals = self.fs().scope.num_locals();
        let label_idx = {
            let block = self.fs_mut().scope.current_block_mut().unwrap();
            block.labels.push(LabelInfo {
                name,
                pc,
                num_locals,
                line,
            });
            block.labels.len() - 1
        };
        // ';' and further labels emit nothing; parse them here so a label
        // that closes its block can be detected. A label with only no-op
        // statements between it and the block end treats the block's locals
        // as already out of scope, so a goto may jump over them to reach it.
        loop {
            if self.check(&Token::Semi) {
                self.advance()?;
            } else if self.check(&Token::DoubleColon) {
                self.stat_label()?;
            } else {
                break;
            }
        }
        if self.check(&Token::End)
            || self.check(&Token::Eof)
            || self.check(&Token::Else)
            || self.check(&Token::ElseIf)
        {
            let entry = self
                .fs()
                .scope
                .blocks
                .last()
                .map(|b| b.num_locals_on_entry)
                .unwrap_or(0);
            let block = self.fs_mut().scope.current_block_mut().unwrap();
            block.labels[label_idx].num_locals = entry;
        }
        let mut resolved = Vec::new();
        {
            let block = self.fs_mut().scope.current_block_mut().unwrap();
            let level = block.labels[label_idx].num_locals;
            let mut i = 0;
            while i < block.pending_gotos.len() {
                let g = &block.pending_gotos[i];
                if g.name == name && g.num_locals >= level {
                    resolved.push(block.pending_gotos.remove(i).pc);
                } else {
                    i += 1;
                }
            }
        }
        for goto_pc in resolved {
            self.patch_jump_to(goto_pc, pc)?;
        }
        Ok(())
    }

    /// Find a visible label by name, innermost block first.
    fn find_label(&self, name: StringId) -> Option<(usize, usize)> {
        self.fs()
            .scope
            .blocks
            .iter()
            .rev()
            .flat_map(|b| b.labels.iter())
            .find(|l| l.name == name)
            .map(|l| (l.pc, l.num_locals))
    }

    fn stat_expr_or_assign(&mut self) -> Result<(), CompileError> {
        let e = self.primary_expression()?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![e];
            while self.test_next(&Token::Comma)? {
                targets.push(self.primary_expression()?);
                if targets.len() > 200 {
                    return Err(self.error("too many targets in assignment"));
                }
            }
            self.expect(Token::Assign, "'='")?;
            self.check_assign_conflicts(&mut targets)?;
            let base = self.fs().scope.free_reg;
            let count = targets.len() as u8;
            let (n, open) = self.expression_list_multi(base)?;
            self.adjust_list(base, n, open, count)?;
            // Assign from the last target down, like the values were pushed
            for (i, target) in targets.into_iter().enumerate().rev() {
                self.code_store(target, base + i as u8)?;
            }
            self.fs_mut().scope.free_reg_to(base);
            Ok(())
        } else {
            match e {
                ExprDesc::Call(_) => Ok(()),
                _ => Err(self.error(format!("syntax error near '{}'", self.lexer.token_text))),
            }
        }
    }

    /// When a local being assigned also appears as the table or key of an
    /// indexed target, the index must see the value from before the
    /// assignment. Copy such locals to temporaries first.
    fn check_assign_conflicts(&mut self, targets: &mut [ExprDesc]) -> Result<(), CompileError> {
        let mut copied: Vec<(u8, u8)> = Vec::new();
        for i in 0..targets.len() {
            let assigned_reg = match targets[i] {
                ExprDesc::Register(r) => r,
                _ => continue,
            };
            if self.fs().scope.resolve_local_by_reg(assigned_reg).is_none() {
                continue;
            }
            let mut conflict = false;
            for t in targets.iter() {
                if let ExprDesc::Indexed { table, key } = t {
                    if *table == assigned_reg {
                        conflict = true;
                    }
                    if let IndexKey::Register(k) = key {
                        if *k == assigned_reg {
                            conflict = true;
                        }
                    }
                }
            }
            if conflict && !copied.iter().any(|&(orig, _)| orig == assigned_reg) {
                let temp = self.fs_mut().scope.alloc_reg();
                self.emit(Instruction::abc(
                    OpCode::Move,
                    temp as u32,
                    assigned_reg as u32,
                    0,
                ));
                copied.push((assigned_reg, temp));
            }
        }
        for t in targets.iter_mut() {
            if let ExprDesc::Indexed { table, key } = t {
                if let Some(&(_, temp)) = copied.iter().find(|&&(orig, _)| orig == *table) {
                    *table = temp;
                }
                if let IndexKey::Register(k) = *key {
                    if let Some(&(_, temp)) = copied.iter().find(|&&(orig, _)| orig == k) {
                        *key = IndexKey::Register(temp);
                    }
                }
            }
        }
        Ok(())
    }

    /// Store a value register into an assignment target.
    fn code_store(&mut self, target: ExprDesc, val_reg: u8) -> Result<(), CompileError> {
        let line = self.lexer.lastline;
        match target {
            ExprDesc::Register(r) => {
                if r != val_reg {
                    self.emit_at(
                        Instruction::abc(OpCode::Move, r as u32, val_reg as u32, 0),
                        line,
                    );
                }
                Ok(())
            }
            ExprDesc::Upvalue(idx) => {
                self.emit_at(
                    Instruction::abc(OpCode::SetUpval, val_reg as u32, idx as u32, 0),
                    line,
                );
                Ok(())
            }
            ExprDesc::Global { env_upval, name_k } => {
                if name_k <= MAX_INDEX_RK {
                    self.emit_at(
                        Instruction::abc(
                            OpCode::SetTabUp,
                            env_upval as u32,
                            opcode::rk_const(name_k),
                            val_reg as u32,
                        ),
                        line,
                    );
                } else {
                    let env_reg = self.fs_mut().scope.alloc_reg();
                    self.emit_at(
                        Instruction::abc(OpCode::GetUpval, env_reg as u32, env_upval as u32, 0),
                        line,
                    );
                    let key_reg = self.fs_mut().scope.alloc_reg();
                    self.emit_load_constant(key_reg, name_k, line);
                    self.emit_at(
                        Instruction::abc(
                            OpCode::SetTable,
                            env_reg as u32,
                            key_reg as u32,
                            val_reg as u32,
                        ),
                        line,
                    );
                    self.free_temp_reg(key_reg);
                    self.free_temp_reg(env_reg);
                }
                Ok(())
            }
            ExprDesc::Indexed { table, key } => {
                let key_rk = match key {
                    IndexKey::Constant(k) => opcode::rk_const(k),
                    IndexKey::Register(r) => r as u32,
                };
                self.emit_at(
                    Instruction::abc(OpCode::SetTable, table as u32, key_rk, val_reg as u32),
                    line,
                );
                Ok(())
            }
            _ => Err(self.error("cannot assign to this expression")),
        }
    }
}
