/// Scope and variable management for the compiler.
use lunaria_core::string::StringId;

/// A local variable in the current function scope.
#[derive(Clone, Debug)]
pub struct LocalVarInfo {
    pub name: StringId,
    /// Register index.
    pub reg: u8,
    /// Scope depth when declared.
    pub scope_depth: usize,
    /// Whether this local was captured as an upvalue by a nested closure.
    pub is_captured: bool,
    /// PC where the variable becomes active.
    pub start_pc: u32,
}

/// Block scope tracking.
#[derive(Clone, Debug)]
pub struct BlockScope {
    /// Number of local variables when this block started.
    pub num_locals_on_entry: usize,
    /// First register that can be freed when this block exits.
    pub first_free_reg_on_entry: u8,
    /// Whether this block is a loop (for break).
    pub is_loop: bool,
    /// Break target patch list: list of JMP PCs to backpatch.
    pub break_jumps: Vec<usize>,
    /// Pending gotos in this block.
    pub pending_gotos: Vec<PendingGoto>,
    /// Labels defined in this block.
    pub labels: Vec<LabelInfo>,
}

/// A forward goto that hasn't been resolved yet.
#[derive(Clone, Debug)]
pub struct PendingGoto {
    pub name: StringId,
    pub pc: usize,
    pub line: u32,
    pub num_locals: usize,
}

/// A label defined in the current block.
#[derive(Clone, Debug)]
pub struct LabelInfo {
    pub name: StringId,
    pub pc: usize,
    pub num_locals: usize,
    pub line: u32,
}

/// A finished local variable (gone out of scope) with end_pc recorded.
#[derive(Clone, Debug)]
pub struct FinishedLocal {
    pub name: StringId,
    pub reg: u8,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Manages scopes, local variables, and register allocation for a
/// single function.
pub struct ScopeManager {
    /// All active local variables in the current function.
    pub locals: Vec<LocalVarInfo>,
    /// Block scope stack.
    pub blocks: Vec<BlockScope>,
    /// Current scope depth.
    pub scope_depth: usize,
    /// Next available register.
    pub free_reg: u8,
    /// High-water mark for register usage.
    pub max_reg: u8,
    /// Locals that have gone out of scope, accumulated for proto.local_vars.
    pub finished_locals: Vec<FinishedLocal>,
    /// Flag set when register allocation would exceed the limit.
    pub reg_overflow: bool,
    /// Flag set when local variable count exceeds the limit.
    pub local_overflow: bool,
}

impl ScopeManager {
    pub fn new() -> Self {
        ScopeManager {
            locals: Vec::new(),
            blocks: Vec::new(),
            scope_depth: 0,
            free_reg: 0,
            max_reg: 0,
            finished_locals: Vec::new(),
            reg_overflow: false,
            local_overflow: false,
        }
    }

    /// Enter a new block scope.
    pub fn enter_block(&mut self, is_loop: bool) {
        self.scope_depth += 1;
        self.blocks.push(BlockScope {
            num_locals_on_entry: self.locals.len(),
            first_free_reg_on_entry: self.free_reg,
            is_loop,
            break_jumps: Vec::new(),
            pending_gotos: Vec::new(),
            labels: Vec::new(),
        });
    }

    /// Register of the lowest captured local declared in the current
    /// block, if any. A block exit must close upvalues from there up.
    pub fn block_needs_close(&self) -> Option<u8> {
        let block = self.blocks.last()?;
        self.locals[block.num_locals_on_entry..]
            .iter()
            .filter(|l| l.is_captured)
            .map(|l| l.reg)
            .min()
    }

    /// Mark the local variable at the given register as captured by a closure.
    pub fn mark_captured(&mut self, reg: u8) {
        for local in self.locals.iter_mut().rev() {
            if local.reg == reg {
                local.is_captured = true;
                return;
            }
        }
    }

    /// Adjust labels at the end of the current block.
    /// Labels whose PC equals `current_pc` (nothing emitted after them) have
    /// their num_locals reduced to the block entry level, so gotos can jump
    /// over locals to labels at the block end. Returns resolved
    /// (goto_pc, target_pc) pairs for patching.
    pub fn adjust_end_labels(&mut self, current_pc: usize) -> Vec<(usize, usize)> {
        let block = match self.blocks.last_mut() {
            Some(b) => b,
            None => return vec![],
        };
        let entry_locals = block.num_locals_on_entry;

        for label in &mut block.labels {
            if label.pc == current_pc {
                label.num_locals = entry_locals;
            }
        }

        // Re-resolve pending gotos against adjusted labels
        let mut resolved = Vec::new(); // (goto_pc, target_pc)
        let mut resolved_indices = Vec::new();
        for (goto_idx, goto_info) in block.pending_gotos.iter().enumerate() {
            for label in &block.labels {
                if label.name == goto_info.name && goto_info.num_locals >= label.num_locals {
                    resolved.push((goto_info.pc, label.pc));
                    resolved_indices.push(goto_idx);
                    break;
                }
            }
        }

        // Remove resolved gotos (in reverse order to maintain indices)
        for &idx in resolved_indices.iter().rev() {
            block.pending_gotos.remove(idx);
        }

        resolved
    }

    /// Leave the current block scope, recording end_pc for its locals.
    /// Unresolved pending gotos are propagated to the parent block with
    /// their num_locals capped at the block entry level.
    pub fn leave_block_at_pc(&mut self, end_pc: u32) -> BlockScope {
        self.scope_depth -= 1;
        let block = self.blocks.pop().expect("mismatched block");
        for local in &self.locals[block.num_locals_on_entry..] {
            self.finished_locals.push(FinishedLocal {
                name: local.name,
                reg: local.reg,
                start_pc: local.start_pc,
                end_pc,
            });
        }
        self.locals.truncate(block.num_locals_on_entry);
        self.free_reg = block.first_free_reg_on_entry;

        if !block.pending_gotos.is_empty() {
            if let Some(parent) = self.blocks.last_mut() {
                let adjusted_gotos = block.pending_gotos.iter().map(|g| {
                    let mut adjusted = g.clone();
                    if adjusted.num_locals > block.num_locals_on_entry {
                        adjusted.num_locals = block.num_locals_on_entry;
                    }
                    adjusted
                });
                parent.pending_gotos.extend(adjusted_gotos);
            }
        }

        block
    }

    /// Register a new local variable. Returns its register.
    pub fn add_local(&mut self, name: StringId, start_pc: u32) -> u8 {
        if self.locals.len() >= 200 {
            self.local_overflow = true;
        }
        if self.free_reg >= 249 {
            self.reg_overflow = true;
            return self.free_reg;
        }
        let reg = self.free_reg;
        self.locals.push(LocalVarInfo {
            name,
            reg,
            scope_depth: self.scope_depth,
            is_captured: false,
            start_pc,
        });
        self.free_reg += 1;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        reg
    }

    /// Allocate a temporary register.
    pub fn alloc_reg(&mut self) -> u8 {
        if self.free_reg >= 249 {
            self.reg_overflow = true;
            return self.free_reg;
        }
        let reg = self.free_reg;
        self.free_reg += 1;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        reg
    }

    /// Free registers down to the given free_reg level.
    pub fn free_reg_to(&mut self, level: u8) {
        if level <= self.free_reg {
            self.free_reg = level;
        }
    }

    /// Raise free_reg to at least the given level, reserving the registers
    /// below it.
    pub fn reserve_to(&mut self, level: u8) {
        if level > self.free_reg {
            if level > 249 {
                self.reg_overflow = true;
            }
            self.free_reg = level;
            if level > self.max_reg {
                self.max_reg = level;
            }
        }
    }

    /// Look up a local variable by name.
    pub fn resolve_local(&self, name: StringId) -> Option<&LocalVarInfo> {
        self.locals.iter().rev().find(|v| v.name == name)
    }

    /// Look up a local variable by register index.
    pub fn resolve_local_by_reg(&self, reg: u8) -> Option<&LocalVarInfo> {
        self.locals.iter().rev().find(|v| v.reg == reg)
    }

    /// Get number of active locals.
    pub fn num_locals(&self) -> usize {
        self.locals.len()
    }

    /// Register of the next local slot; everything at or above this is a
    /// temporary.
    pub fn locals_top(&self) -> u8 {
        self.locals.last().map(|l| l.reg + 1).unwrap_or(0)
    }

    /// Find the nearest enclosing loop block.
    pub fn find_loop_block(&mut self) -> Option<&mut BlockScope> {
        self.blocks.iter_mut().rev().find(|b| b.is_loop)
    }

    /// Register of the lowest captured local between the current position
    /// and the enclosing loop, if any. A break must close upvalues from
    /// there up.
    pub fn break_needs_close(&self) -> Option<u8> {
        let loop_block = self.blocks.iter().rev().find(|b| b.is_loop)?;
        self.locals[loop_block.num_locals_on_entry..]
            .iter()
            .filter(|l| l.is_captured)
            .map(|l| l.reg)
            .min()
    }

    /// Get the current innermost block.
    pub fn current_block_mut(&mut self) -> Option<&mut BlockScope> {
        self.blocks.last_mut()
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}
