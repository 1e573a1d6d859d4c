use std::collections::HashMap;
use std::mem;

use crate::ast::{Ast, NodeId, NodeKind};
use crate::compiler::{Arg, CompileError, ErrorKind, Instr, Program, Stage};
use crate::opcodes::{AddrMode, Op};
use crate::runtime::{Subroutine, DIV, MUL};

/// Zero-page scratch pair: MUL/DIV take their operands here, and pointer
/// copies (stack-resident pointers, array address arithmetic) go through the
/// same cell. Values located through it are pulled into A before anything
/// else may overwrite it.
pub const TMP_PTR: u8 = 0x00;
/// Software base pointer for locals (lo/hi). The high byte stays 0 so that
/// `(base_ptr),Y` indexing lands in the hardware stack page.
pub const BASE_PTR: u8 = 0x02;
/// Base pointer for arguments (lo/hi); the high byte stays 1.
pub const ARG_BASE_PTR: u8 = 0x04;
/// First zero-page slot available to global variables.
pub const GLOBALS_BASE: u8 = 0x06;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    A,
    X,
    Y,
}

/// Where an expression's value currently resides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    /// An immediate literal; the value lives in the AST node.
    None,
    Reg(Reg),
    /// Absolute zero-page address (global variable).
    ZeroPage(u8),
    /// Y displacement against `base_ptr` (local variable or spilled temp).
    Stack(u8),
    /// Y displacement against `arg_base_ptr` (formal parameter).
    Argument(u8),
    /// The value is reached by dereferencing the pointer cell at this
    /// zero-page address.
    Pointer(u8),
}

#[derive(Debug, Clone, Copy)]
struct NodeState {
    loc: Loc,
    size: u8,
}

#[derive(Debug, Clone)]
struct Variable {
    loc: Loc,
    size: u8,
    is_pointer: bool,
    is_array: bool,
}

#[derive(Debug, Clone)]
struct Param {
    size: u8,
    is_pointer: bool,
    name: String,
}

#[derive(Debug, Clone)]
struct Function {
    args: Vec<Param>,
}

/// Walks the AST depth-first and emits instruction tuples such that after a
/// node has been visited its value resides at a well-defined location.
pub struct CodeGenerator {
    ast: Ast,
    states: Vec<NodeState>,
    code: Vec<Instr>,
    asm: Vec<String>,
    scopes: Vec<HashMap<String, Variable>>,
    scope_offsets: Vec<i32>,
    scope_offset: i32,
    next_zp: u16,
    funcs: HashMap<String, Function>,
    pending_locals: HashMap<NodeId, Loc>,
    /// The node whose value A currently holds, if any.
    a: Option<NodeId>,
    /// Label of the epilogue of the function being generated.
    func_end: Option<String>,
    label_counter: usize,
    required: Vec<&'static Subroutine>,
}

impl CodeGenerator {
    pub fn new() -> CodeGenerator {
        CodeGenerator {
            ast: Ast::default(),
            states: Vec::new(),
            code: Vec::new(),
            asm: Vec::new(),
            scopes: vec![HashMap::new()],
            scope_offsets: Vec::new(),
            scope_offset: 0,
            next_zp: GLOBALS_BASE as u16,
            funcs: HashMap::new(),
            pending_locals: HashMap::new(),
            a: None,
            func_end: None,
            label_counter: 0,
            required: Vec::new(),
        }
    }

    // ----- instruction emission ---------------------------------------

    fn emit(&mut self, op: Op, mode: AddrMode, arg: Arg, label: Option<String>) {
        let line = match (mode, &arg) {
            (AddrMode::Implied | AddrMode::Accumulator, _) => op.mnemonic().to_string(),
            (AddrMode::Immediate, Arg::Value(value)) => format!("{} #{}", op.mnemonic(), value),
            (AddrMode::Zeropage, Arg::Value(value)) => format!("{} ${:x}", op.mnemonic(), value),
            (AddrMode::Absolute | AddrMode::Relative, Arg::Label(name)) => {
                format!("{} {}", op.mnemonic(), name)
            }
            (AddrMode::Absolute, Arg::Value(value)) => format!("{} ${:x}", op.mnemonic(), value),
            (AddrMode::IndirectY, Arg::Value(value)) => {
                format!("{} (${:x}),Y", op.mnemonic(), value)
            }
            (AddrMode::IndirectX, Arg::Value(value)) => {
                format!("{} (${:x},X)", op.mnemonic(), value)
            }
            (_, Arg::Value(value)) => format!("{} {}", op.mnemonic(), value),
            (_, _) => op.mnemonic().to_string(),
        };
        let prefix = match &label {
            Some(name) => format!("{}:", name),
            None => String::new(),
        };
        self.asm.push(format!("{}\t{}", prefix, line));
        self.code.push(Instr {
            op: Some(op),
            mode,
            arg,
            label,
        });
    }

    /// A pure label anchor: occupies no bytes, names the current offset.
    /// Anchors are join points, so nothing can be assumed live in A past one.
    fn anchor(&mut self, label: String) {
        self.asm.push(format!("{}:", label));
        self.code.push(Instr::anchor(label));
        self.a = None;
    }

    fn imp(&mut self, op: Op) {
        self.emit(op, AddrMode::Implied, Arg::None, None);
    }

    fn imm(&mut self, op: Op, value: u8) {
        self.emit(op, AddrMode::Immediate, Arg::Value(value as u16), None);
    }

    fn zp(&mut self, op: Op, addr: u8) {
        self.emit(op, AddrMode::Zeropage, Arg::Value(addr as u16), None);
    }

    fn izy(&mut self, op: Op, base: u8) {
        self.emit(op, AddrMode::IndirectY, Arg::Value(base as u16), None);
    }

    fn izx(&mut self, op: Op, slot: u8) {
        self.emit(op, AddrMode::IndirectX, Arg::Value(slot as u16), None);
    }

    fn rel(&mut self, op: Op, label: &str) {
        self.emit(op, AddrMode::Relative, Arg::Label(label.to_string()), None);
    }

    fn abs(&mut self, op: Op, label: &str) {
        self.emit(op, AddrMode::Absolute, Arg::Label(label.to_string()), None);
    }

    fn new_label(&mut self) -> String {
        let label = format!("L{}", self.label_counter);
        self.label_counter += 1;
        label
    }

    // ----- node state -------------------------------------------------

    fn loc(&self, id: NodeId) -> Loc {
        self.states[id].loc
    }

    fn size(&self, id: NodeId) -> u8 {
        self.states[id].size
    }

    fn set_loc(&mut self, id: NodeId, loc: Loc) {
        if loc == Loc::Reg(Reg::A) {
            self.a = Some(id);
        } else if self.a == Some(id) {
            self.a = None;
        }
        self.states[id].loc = loc;
    }

    fn set_state(&mut self, id: NodeId, loc: Loc, size: u8) {
        self.states[id].size = size;
        self.set_loc(id, loc);
    }

    /// The variable name a node stands for, when A holding this node means
    /// "A holds that variable's value".
    fn named_var(&self, id: NodeId) -> Option<&str> {
        match self.ast.kind(id) {
            NodeKind::Ref | NodeKind::Assign | NodeKind::Var => self.ast.nodes[id].name.as_deref(),
            _ => None,
        }
    }

    fn lookup(&self, name: &str) -> Option<Variable> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .cloned()
    }

    fn register(&mut self, name: &str, var: Variable, line: usize) -> Result<(), CompileError> {
        let scope = self.scopes.last_mut().unwrap();
        if scope.contains_key(name) {
            return Err(CompileError::at(
                ErrorKind::RedefinedVariable(name.to_string()),
                line,
            ));
        }
        scope.insert(name.to_string(), var);
        Ok(())
    }

    // ----- scopes and the software stack ------------------------------

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
        self.scope_offsets.push(self.scope_offset);
    }

    /// Pops a scope and restores the stack pointer past any temporaries the
    /// scope spilled. The INX run leaves A untouched, which matters: branch
    /// and loop conditions are live in A exactly here.
    fn pop_scope(&mut self) {
        self.scopes.pop();
        let saved = self.scope_offsets.pop().unwrap();
        let delta = saved - self.scope_offset;
        if delta > 0 {
            self.imp(Op::TSX);
            for _ in 0..delta {
                self.imp(Op::INX);
            }
            self.imp(Op::TXS);
        }
        self.scope_offset = saved;
    }

    /// Pops a scope without emitting a stack adjustment; the function
    /// epilogue restores SP from the saved base pointer wholesale.
    fn pop_scope_silent(&mut self) {
        self.scopes.pop();
        self.scope_offset = self.scope_offsets.pop().unwrap();
    }

    /// Reserves `size` bytes of stack and returns the Y displacement of the
    /// lowest byte.
    fn alloc_stack(&mut self, size: u8) -> u8 {
        self.scope_offset -= size as i32;
        ((0x100 + self.scope_offset) & 0xFF) as u8
    }

    // ----- the accumulator policy -------------------------------------

    /// Spills whatever A holds to a fresh stack slot. A bare reference to a
    /// variable needs no code: its location is rewritten back to the
    /// variable's storage.
    fn push_a(&mut self) {
        let id = match self.a {
            None => return,
            Some(id) => id,
        };

        let named = self.named_var(id).map(str::to_string);
        if let Some(name) = named {
            if let Some(var) = self.lookup(&name) {
                self.states[id].loc = var.loc;
                self.a = None;
                return;
            }
        }

        let size = self.size(id);
        if size == 2 {
            // Push the high byte first so lo/hi land at Y and Y+1.
            self.imp(Op::TAY);
            self.imp(Op::TXA);
            self.imp(Op::PHA);
            self.imp(Op::TYA);
            self.imp(Op::PHA);
        } else {
            self.imp(Op::PHA);
        }
        let offset = self.alloc_stack(size);
        self.states[id].loc = Loc::Stack(offset);
        self.a = None;
    }

    /// Moves a node's value into A (and X for the high byte of a 16-bit
    /// value), spilling the current occupant first.
    fn pull_a(&mut self, id: NodeId) -> Result<(), CompileError> {
        if self.a == Some(id) {
            return Ok(());
        }
        self.push_a();

        let size = self.size(id);
        match self.loc(id) {
            Loc::None => {
                let value = self.ast.nodes[id].value.unwrap_or(0);
                self.imm(Op::LDA, (value & 0xFF) as u8);
                if size == 2 {
                    self.imm(Op::LDX, ((value >> 8) & 0xFF) as u8);
                }
            }
            Loc::Reg(Reg::A) => {
                return Err(CompileError::new(ErrorKind::InternalError(
                    "accumulator tracking lost a value".to_string(),
                )));
            }
            Loc::Reg(Reg::X) => self.imp(Op::TXA),
            Loc::Reg(Reg::Y) => self.imp(Op::TYA),
            Loc::ZeroPage(addr) => {
                self.zp(Op::LDA, addr);
                if size == 2 {
                    self.zp(Op::LDX, addr.wrapping_add(1));
                }
            }
            Loc::Stack(offset) => self.pull_indirect(BASE_PTR, offset, size),
            Loc::Argument(offset) => self.pull_indirect(ARG_BASE_PTR, offset, size),
            Loc::Pointer(slot) => {
                self.imm(Op::LDX, 0);
                self.izx(Op::LDA, slot);
            }
        }
        self.set_loc(id, Loc::Reg(Reg::A));
        Ok(())
    }

    fn pull_indirect(&mut self, base: u8, offset: u8, size: u8) {
        if size == 2 {
            // High byte goes through A into X, then the low byte.
            self.imm(Op::LDY, offset.wrapping_add(1));
            self.izy(Op::LDA, base);
            self.imp(Op::TAX);
        }
        self.imm(Op::LDY, offset);
        self.izy(Op::LDA, base);
    }

    /// Applies `op` (ADC/SBC/CMP) against a memory or immediate operand.
    fn operate(&mut self, op: Op, id: NodeId) -> Result<(), CompileError> {
        match self.loc(id) {
            Loc::None => {
                let value = self.ast.nodes[id].value.unwrap_or(0);
                self.imm(op, (value & 0xFF) as u8);
            }
            Loc::ZeroPage(addr) => self.zp(op, addr),
            Loc::Stack(offset) => {
                self.imm(Op::LDY, offset);
                self.izy(op, BASE_PTR);
            }
            Loc::Argument(offset) => {
                self.imm(Op::LDY, offset);
                self.izy(op, ARG_BASE_PTR);
            }
            Loc::Pointer(slot) => {
                self.imm(Op::LDX, 0);
                self.izx(op, slot);
            }
            Loc::Reg(_) => {
                return Err(CompileError::new(ErrorKind::InternalError(
                    "operand unexpectedly lives in a register".to_string(),
                )));
            }
        }
        Ok(())
    }

    /// Makes a node survive the evaluation of a sibling operand: a value
    /// located through the shared scratch cell is pulled into A first (the
    /// sibling may overwrite the cell), and a value in A is spilled.
    fn protect(&mut self, id: NodeId) -> Result<(), CompileError> {
        if self.loc(id) == Loc::Pointer(TMP_PTR) {
            self.pull_a(id)?;
        }
        if self.a == Some(id) {
            self.push_a();
        }
        Ok(())
    }

    fn require_byte(&self, id: NodeId) -> Result<(), CompileError> {
        if self.size(id) != 1 {
            return Err(CompileError::at(
                ErrorKind::SizeError("16-bit operands are not supported in arithmetic".to_string()),
                self.ast.line(id),
            ));
        }
        Ok(())
    }

    // ----- visitors ---------------------------------------------------

    fn visit(&mut self, id: NodeId) -> Result<(), CompileError> {
        match self.ast.kind(id) {
            NodeKind::Imm => self.imm_node(id),
            NodeKind::Ref => self.ref_node(id),
            NodeKind::Add => self.add(id),
            NodeKind::Sub => self.sub(id),
            NodeKind::Mul => self.mul_div(id, &MUL),
            NodeKind::Div => self.mul_div(id, &DIV),
            NodeKind::Neg => self.neg(id),
            NodeKind::Eq
            | NodeKind::Neq
            | NodeKind::Gt
            | NodeKind::Geq
            | NodeKind::Lt
            | NodeKind::Leq => self.compare(id),
            NodeKind::Deref => self.deref(id),
            NodeKind::GetRef => self.getref(id),
            NodeKind::Index => self.index(id),
            NodeKind::Call => self.call(id),
            NodeKind::Var => self.var_decl(id),
            NodeKind::Array => self.array_decl(id),
            NodeKind::Assign => self.assign(id),
            NodeKind::MemAssign => self.mem_assign(id),
            NodeKind::IndexAssign => self.index_assign(id),
            NodeKind::Ret => self.ret(id),
            NodeKind::IfStmt => self.if_stmt(id),
            NodeKind::WhileStmt => self.while_stmt(id),
            NodeKind::Pass => Ok(()),
            NodeKind::Body => self.visit_body(id),
            kind => Err(CompileError::at(
                ErrorKind::InternalError(format!("unexpected node {:?}", kind)),
                self.ast.line(id),
            )),
        }
    }

    fn visit_body(&mut self, id: NodeId) -> Result<(), CompileError> {
        let children = self.ast.children(id).to_vec();
        for child in children {
            self.visit(child)?;
        }
        Ok(())
    }

    fn imm_node(&mut self, id: NodeId) -> Result<(), CompileError> {
        let value = self.ast.nodes[id].value.unwrap_or(0);
        let size = if value <= 0xFF {
            1
        } else if value <= 0xFFFF {
            2
        } else {
            return Err(CompileError::at(
                ErrorKind::SizeError(format!("literal {} exceeds 2 bytes", value)),
                self.ast.line(id),
            ));
        };
        self.set_state(id, Loc::None, size);
        Ok(())
    }

    fn ref_node(&mut self, id: NodeId) -> Result<(), CompileError> {
        let name = self.ast.name(id).to_string();
        let var = self.lookup(&name).ok_or_else(|| {
            CompileError::at(ErrorKind::UndefinedVariable(name.clone()), self.ast.line(id))
        })?;

        // If A already holds this variable's value, inherit it.
        if let Some(held) = self.a {
            if self.named_var(held) == Some(name.as_str()) {
                self.set_state(id, Loc::Reg(Reg::A), var.size);
                return Ok(());
            }
        }

        if var.is_array {
            // An array reference is a pointer to its first byte.
            self.push_a();
            self.materialize_address(&var, self.ast.line(id))?;
            self.set_state(id, Loc::Reg(Reg::A), 2);
            return Ok(());
        }

        self.set_state(id, var.loc, var.size);
        Ok(())
    }

    fn add(&mut self, id: NodeId) -> Result<(), CompileError> {
        let (left, right) = self.binary_children(id);
        self.visit(left)?;
        self.require_byte(left)?;
        self.protect(left)?;
        self.visit(right)?;
        self.require_byte(right)?;
        self.pull_a(right)?;
        self.imp(Op::CLC);
        self.operate(Op::ADC, left)?;
        self.set_state(id, Loc::Reg(Reg::A), 1);
        Ok(())
    }

    fn sub(&mut self, id: NodeId) -> Result<(), CompileError> {
        let (left, right) = self.binary_children(id);
        // Non-commutative: the right operand is evaluated first so the left
        // can end up in A for the SBC.
        self.visit(right)?;
        self.require_byte(right)?;
        self.protect(right)?;
        self.visit(left)?;
        self.require_byte(left)?;
        self.pull_a(left)?;
        self.imp(Op::SEC);
        self.operate(Op::SBC, right)?;
        self.set_state(id, Loc::Reg(Reg::A), 1);
        Ok(())
    }

    fn mul_div(&mut self, id: NodeId, subroutine: &'static Subroutine) -> Result<(), CompileError> {
        let (left, right) = self.binary_children(id);
        self.visit(left)?;
        self.require_byte(left)?;
        self.protect(left)?;
        self.visit(right)?;
        self.require_byte(right)?;

        // The right operand goes to $01 first: it may still be located
        // through the scratch cell, which storing the left would clobber.
        self.pull_a(right)?;
        self.zp(Op::STA, TMP_PTR + 1);
        self.a = None;
        self.pull_a(left)?;
        self.zp(Op::STA, TMP_PTR);
        self.a = None;

        let label = self.require(subroutine);
        self.abs(Op::JSR, &label);
        self.set_state(id, Loc::Reg(Reg::A), 1);
        Ok(())
    }

    fn neg(&mut self, id: NodeId) -> Result<(), CompileError> {
        let operand = self.ast.children(id)[0];
        self.visit(operand)?;
        self.require_byte(operand)?;
        self.pull_a(operand)?;
        // Two's complement: invert all bits and add one.
        self.imp(Op::CLC);
        self.imm(Op::EOR, 0xFF);
        self.imm(Op::ADC, 0x01);
        self.set_state(id, Loc::Reg(Reg::A), 1);
        Ok(())
    }

    fn compare(&mut self, id: NodeId) -> Result<(), CompileError> {
        let kind = self.ast.kind(id);
        let (first, second) = self.binary_children(id);
        // leq and lt swap their arguments and run as geq and gt.
        let (left, right) = match kind {
            NodeKind::Leq | NodeKind::Lt => (second, first),
            _ => (first, second),
        };

        self.visit(right)?;
        self.require_byte(right)?;
        self.protect(right)?;
        self.visit(left)?;
        self.require_byte(left)?;
        self.pull_a(left)?;
        self.operate(Op::CMP, right)?;

        match kind {
            NodeKind::Eq => self.flag_result(Op::BEQ),
            NodeKind::Neq => self.flag_result(Op::BNE),
            NodeKind::Geq | NodeKind::Leq => {
                // BCS covers the greater case; BEQ handles equality
                // explicitly.
                let true_label = self.new_label();
                let end_label = self.new_label();
                self.rel(Op::BEQ, &true_label);
                self.rel(Op::BCS, &true_label);
                self.imm(Op::LDA, 0);
                self.abs(Op::JMP, &end_label);
                self.anchor(true_label);
                self.imm(Op::LDA, 1);
                self.anchor(end_label);
            }
            NodeKind::Gt | NodeKind::Lt => {
                let false_label = self.new_label();
                let true_label = self.new_label();
                let end_label = self.new_label();
                self.rel(Op::BEQ, &false_label);
                self.rel(Op::BCS, &true_label);
                self.anchor(false_label);
                self.imm(Op::LDA, 0);
                self.abs(Op::JMP, &end_label);
                self.anchor(true_label);
                self.imm(Op::LDA, 1);
                self.anchor(end_label);
            }
            _ => unreachable!(),
        }

        self.set_state(id, Loc::Reg(Reg::A), 1);
        Ok(())
    }

    fn flag_result(&mut self, branch: Op) {
        let true_label = self.new_label();
        let end_label = self.new_label();
        self.rel(branch, &true_label);
        self.imm(Op::LDA, 0);
        self.abs(Op::JMP, &end_label);
        self.anchor(true_label);
        self.imm(Op::LDA, 1);
        self.anchor(end_label);
    }

    fn deref(&mut self, id: NodeId) -> Result<(), CompileError> {
        let name = self.ast.name(id).to_string();
        let line = self.ast.line(id);
        let var = self
            .lookup(&name)
            .ok_or_else(|| CompileError::at(ErrorKind::UndefinedVariable(name.clone()), line))?;
        if !var.is_pointer {
            return Err(CompileError::at(ErrorKind::InvalidDereference(name), line));
        }

        let slot = match var.loc {
            // A zero-page pointer is its own pointer cell.
            Loc::ZeroPage(addr) => addr,
            Loc::Stack(offset) => {
                self.push_a();
                self.copy_pointer_to_tmp(BASE_PTR, offset);
                TMP_PTR
            }
            Loc::Argument(offset) => {
                self.push_a();
                self.copy_pointer_to_tmp(ARG_BASE_PTR, offset);
                TMP_PTR
            }
            _ => {
                return Err(CompileError::at(
                    ErrorKind::InternalError(format!("pointer {} has no storage", name)),
                    line,
                ))
            }
        };
        self.set_state(id, Loc::Pointer(slot), 1);
        Ok(())
    }

    fn copy_pointer_to_tmp(&mut self, base: u8, offset: u8) {
        self.imm(Op::LDY, offset);
        self.izy(Op::LDA, base);
        self.zp(Op::STA, TMP_PTR);
        self.imm(Op::LDY, offset.wrapping_add(1));
        self.izy(Op::LDA, base);
        self.zp(Op::STA, TMP_PTR + 1);
    }

    fn getref(&mut self, id: NodeId) -> Result<(), CompileError> {
        let name = self.ast.name(id).to_string();
        let line = self.ast.line(id);
        let var = self
            .lookup(&name)
            .ok_or_else(|| CompileError::at(ErrorKind::UndefinedVariable(name), line))?;
        self.push_a();
        self.materialize_address(&var, line)?;
        self.set_state(id, Loc::Reg(Reg::A), 2);
        Ok(())
    }

    /// Leaves the address of a variable in A (lo) and X (hi).
    fn materialize_address(&mut self, var: &Variable, line: usize) -> Result<(), CompileError> {
        match var.loc {
            Loc::ZeroPage(addr) => {
                self.imm(Op::LDA, addr);
                self.imm(Op::LDX, 0);
            }
            Loc::Stack(offset) => self.materialize_base_offset(BASE_PTR, offset),
            Loc::Argument(offset) => self.materialize_base_offset(ARG_BASE_PTR, offset),
            _ => {
                return Err(CompileError::at(
                    ErrorKind::InternalError("variable has no addressable storage".to_string()),
                    line,
                ))
            }
        }
        Ok(())
    }

    fn materialize_base_offset(&mut self, base: u8, offset: u8) {
        self.zp(Op::LDA, base);
        self.imp(Op::CLC);
        self.imm(Op::ADC, offset);
        self.imp(Op::PHA);
        self.zp(Op::LDA, base + 1);
        self.imm(Op::ADC, 0);
        self.imp(Op::TAX);
        self.imp(Op::PLA);
    }

    fn index(&mut self, id: NodeId) -> Result<(), CompileError> {
        let name = self.ast.name(id).to_string();
        let line = self.ast.line(id);
        let index = self.ast.children(id)[0];
        let var = self
            .lookup(&name)
            .ok_or_else(|| CompileError::at(ErrorKind::UndefinedVariable(name.clone()), line))?;
        if !var.is_array {
            return Err(CompileError::at(ErrorKind::InvalidDereference(name), line));
        }

        self.visit(index)?;
        self.require_byte(index)?;
        self.form_element_address(&var, index, line)?;
        self.set_state(id, Loc::Pointer(TMP_PTR), 1);
        Ok(())
    }

    /// Computes `tmp_ptr <- &array + index`.
    fn form_element_address(
        &mut self,
        var: &Variable,
        index: NodeId,
        line: usize,
    ) -> Result<(), CompileError> {
        match var.loc {
            Loc::ZeroPage(addr) => {
                self.pull_a(index)?;
                self.imp(Op::CLC);
                self.imm(Op::ADC, addr);
                self.zp(Op::STA, TMP_PTR);
                self.imm(Op::LDA, 0);
                self.imm(Op::ADC, 0);
                self.zp(Op::STA, TMP_PTR + 1);
            }
            Loc::Stack(offset) => {
                // The base-pointer load below clobbers A and the scratch
                // cell, so the index must be out of both first.
                self.protect(index)?;
                self.push_a();
                self.zp(Op::LDA, BASE_PTR);
                self.imp(Op::CLC);
                self.imm(Op::ADC, offset);
                self.zp(Op::STA, TMP_PTR);
                self.zp(Op::LDA, BASE_PTR + 1);
                self.imm(Op::ADC, 0);
                self.zp(Op::STA, TMP_PTR + 1);
                self.pull_a(index)?;
                self.imp(Op::CLC);
                self.zp(Op::ADC, TMP_PTR);
                self.zp(Op::STA, TMP_PTR);
                self.zp(Op::LDA, TMP_PTR + 1);
                self.imm(Op::ADC, 0);
                self.zp(Op::STA, TMP_PTR + 1);
            }
            _ => {
                return Err(CompileError::at(
                    ErrorKind::InternalError("array has no addressable storage".to_string()),
                    line,
                ))
            }
        }
        self.a = None;
        Ok(())
    }

    fn call(&mut self, id: NodeId) -> Result<(), CompileError> {
        let name = self.ast.name(id).to_string();
        let line = self.ast.line(id);
        let func = self
            .funcs
            .get(&name)
            .cloned()
            .ok_or_else(|| CompileError::at(ErrorKind::UndefinedFunction(name.clone()), line))?;

        let args = self.ast.children(id).to_vec();
        if args.len() != func.args.len() {
            return Err(CompileError::at(ErrorKind::BadArgs(name), line));
        }

        // Whatever lives in A has to survive the call.
        self.push_a();

        // Evaluate left to right, parking every value where a later
        // argument's evaluation cannot disturb it. The pushes then run
        // back to back, keeping the arguments contiguous above the return
        // address.
        for (i, (&arg, param)) in args.iter().zip(&func.args).enumerate() {
            self.visit(arg)?;
            if self.size(arg) != param.size {
                return Err(CompileError::at(ErrorKind::BadArgs(name), line));
            }
            if i + 1 < args.len() {
                self.protect(arg)?;
            }
        }

        let mut pushed = 0u8;
        for (&arg, param) in args.iter().zip(&func.args) {
            self.pull_a(arg)?;
            if param.size == 2 {
                // High byte first.
                self.imp(Op::TAY);
                self.imp(Op::TXA);
                self.imp(Op::PHA);
                self.imp(Op::TYA);
                self.imp(Op::PHA);
            } else {
                self.imp(Op::PHA);
            }
            self.scope_offset -= param.size as i32;
            pushed += param.size;
            self.a = None;
        }

        self.abs(Op::JSR, &name);

        // Drop the arguments; the return value is live in A.
        if pushed > 0 {
            if pushed <= 5 {
                self.imp(Op::TSX);
                for _ in 0..pushed {
                    self.imp(Op::INX);
                }
                self.imp(Op::TXS);
            } else {
                self.imp(Op::TAY);
                self.imp(Op::TSX);
                self.imp(Op::TXA);
                self.imp(Op::CLC);
                self.imm(Op::ADC, pushed);
                self.imp(Op::TAX);
                self.imp(Op::TXS);
                self.imp(Op::TYA);
            }
            self.scope_offset += pushed as i32;
        }

        self.set_state(id, Loc::Reg(Reg::A), 1);
        Ok(())
    }

    fn var_decl(&mut self, id: NodeId) -> Result<(), CompileError> {
        let name = self.ast.name(id).to_string();
        let line = self.ast.line(id);
        let pointer = self.ast.nodes[id].pointer;
        let size: u8 = if pointer { 2 } else { 1 };

        let loc = self.storage_for(id, size as u16, line)?;
        let var = Variable {
            loc,
            size,
            is_pointer: pointer,
            is_array: false,
        };

        // The initializer is evaluated before the name is registered, so a
        // local's initializer still sees the binding it shadows.
        let init = self.ast.children(id).first().copied();
        if let Some(init) = init {
            self.visit(init)?;
            self.register(&name, var.clone(), line)?;
            self.store_into(&var, init, line)?;
            if var.size == 1 {
                self.set_state(id, Loc::Reg(Reg::A), 1);
            } else {
                self.set_state(id, var.loc, var.size);
            }
        } else {
            self.register(&name, var.clone(), line)?;
            self.set_state(id, var.loc, var.size);
        }
        Ok(())
    }

    fn array_decl(&mut self, id: NodeId) -> Result<(), CompileError> {
        let name = self.ast.name(id).to_string();
        let line = self.ast.line(id);
        let length = self.ast.nodes[id].value.unwrap_or(0);
        if length == 0 || length > 255 {
            return Err(CompileError::at(
                ErrorKind::SizeError(format!("array length {} is out of range", length)),
                line,
            ));
        }

        let loc = self.storage_for(id, length as u16, line)?;
        let var = Variable {
            loc,
            size: 1,
            is_pointer: false,
            is_array: true,
        };
        self.register(&name, var, line)?;
        self.set_state(id, loc, 1);
        Ok(())
    }

    /// Storage for a declaration: a zero-page block at the top level, the
    /// prologue-reserved stack slot inside a function.
    fn storage_for(&mut self, id: NodeId, bytes: u16, line: usize) -> Result<Loc, CompileError> {
        if self.scopes.len() == 1 {
            let addr = self.next_zp;
            self.next_zp += bytes;
            if self.next_zp > 0x100 {
                return Err(CompileError::at(
                    ErrorKind::InternalError("out of zero-page memory".to_string()),
                    line,
                ));
            }
            Ok(Loc::ZeroPage(addr as u8))
        } else {
            self.pending_locals.get(&id).copied().ok_or_else(|| {
                CompileError::at(
                    ErrorKind::InternalError("declaration missing from the prologue scan".to_string()),
                    line,
                )
            })
        }
    }

    fn assign(&mut self, id: NodeId) -> Result<(), CompileError> {
        let name = self.ast.name(id).to_string();
        let line = self.ast.line(id);
        let expr = self.ast.children(id)[0];
        let var = self
            .lookup(&name)
            .ok_or_else(|| CompileError::at(ErrorKind::UndefinedVariable(name.clone()), line))?;
        if var.is_array {
            return Err(CompileError::at(
                ErrorKind::SizeError(format!("cannot assign to array {}", name)),
                line,
            ));
        }

        self.visit(expr)?;
        self.store_into(&var, expr, line)?;
        if var.size == 1 {
            self.set_state(id, Loc::Reg(Reg::A), 1);
        } else {
            self.set_state(id, var.loc, var.size);
        }
        Ok(())
    }

    /// Pulls an expression into registers and stores it at a variable's
    /// location. A byte expression stored into a pointer is widened with a
    /// zero high byte.
    fn store_into(
        &mut self,
        var: &Variable,
        expr: NodeId,
        line: usize,
    ) -> Result<(), CompileError> {
        let expr_size = self.size(expr);
        if expr_size > var.size {
            return Err(CompileError::at(
                ErrorKind::SizeError("cannot assign a 16-bit value to a byte variable".to_string()),
                line,
            ));
        }

        self.pull_a(expr)?;
        match var.loc {
            Loc::ZeroPage(addr) => {
                self.zp(Op::STA, addr);
                if var.size == 2 {
                    if expr_size == 2 {
                        self.imp(Op::TXA);
                    } else {
                        self.imm(Op::LDA, 0);
                    }
                    self.zp(Op::STA, addr.wrapping_add(1));
                }
            }
            Loc::Stack(offset) => self.store_indirect(BASE_PTR, offset, var.size, expr_size),
            Loc::Argument(offset) => self.store_indirect(ARG_BASE_PTR, offset, var.size, expr_size),
            _ => {
                return Err(CompileError::at(
                    ErrorKind::InternalError("assignment target has no storage".to_string()),
                    line,
                ))
            }
        }
        if var.size == 2 {
            // A was cycled through the high byte; nothing useful is left.
            self.a = None;
        }
        Ok(())
    }

    fn store_indirect(&mut self, base: u8, offset: u8, size: u8, expr_size: u8) {
        self.imm(Op::LDY, offset);
        self.izy(Op::STA, base);
        if size == 2 {
            if expr_size == 2 {
                self.imp(Op::TXA);
            } else {
                self.imm(Op::LDA, 0);
            }
            self.imm(Op::LDY, offset.wrapping_add(1));
            self.izy(Op::STA, base);
        }
    }

    fn mem_assign(&mut self, id: NodeId) -> Result<(), CompileError> {
        let name = self.ast.name(id).to_string();
        let line = self.ast.line(id);
        let expr = self.ast.children(id)[0];
        let var = self
            .lookup(&name)
            .ok_or_else(|| CompileError::at(ErrorKind::UndefinedVariable(name.clone()), line))?;
        if !var.is_pointer {
            return Err(CompileError::at(ErrorKind::InvalidDereference(name), line));
        }

        self.visit(expr)?;
        self.require_byte(expr)?;

        let slot = match var.loc {
            Loc::ZeroPage(addr) => addr,
            Loc::Stack(offset) => {
                self.protect(expr)?;
                self.push_a();
                self.copy_pointer_to_tmp(BASE_PTR, offset);
                TMP_PTR
            }
            Loc::Argument(offset) => {
                self.protect(expr)?;
                self.push_a();
                self.copy_pointer_to_tmp(ARG_BASE_PTR, offset);
                TMP_PTR
            }
            _ => {
                return Err(CompileError::at(
                    ErrorKind::InternalError(format!("pointer {} has no storage", name)),
                    line,
                ))
            }
        };

        self.pull_a(expr)?;
        self.imm(Op::LDX, 0);
        self.izx(Op::STA, slot);
        self.set_state(id, Loc::Reg(Reg::A), 1);
        Ok(())
    }

    fn index_assign(&mut self, id: NodeId) -> Result<(), CompileError> {
        let name = self.ast.name(id).to_string();
        let line = self.ast.line(id);
        let index = self.ast.children(id)[0];
        let expr = self.ast.children(id)[1];
        let var = self
            .lookup(&name)
            .ok_or_else(|| CompileError::at(ErrorKind::UndefinedVariable(name.clone()), line))?;
        if !var.is_array {
            return Err(CompileError::at(ErrorKind::InvalidDereference(name), line));
        }

        self.visit(index)?;
        self.require_byte(index)?;
        self.protect(index)?;
        self.visit(expr)?;
        self.require_byte(expr)?;
        // The address formation needs A and the scratch cell for itself.
        self.protect(expr)?;
        self.push_a();

        self.form_element_address(&var, index, line)?;
        self.pull_a(expr)?;
        self.imm(Op::LDX, 0);
        self.izx(Op::STA, TMP_PTR);
        self.set_state(id, Loc::Reg(Reg::A), 1);
        Ok(())
    }

    fn ret(&mut self, id: NodeId) -> Result<(), CompileError> {
        if let Some(&expr) = self.ast.children(id).first() {
            self.visit(expr)?;
            if self.size(expr) == 2 {
                return Err(CompileError::at(
                    ErrorKind::SizeError("cannot return a 16-bit value".to_string()),
                    self.ast.line(id),
                ));
            }
            self.pull_a(expr)?;
        }
        // The epilogue restores SP from the base pointer, so nested scopes
        // need no unwinding here.
        let end = self.func_end.clone().ok_or_else(|| {
            CompileError::at(
                ErrorKind::InternalError("return outside of a function".to_string()),
                self.ast.line(id),
            )
        })?;
        self.abs(Op::JMP, &end);
        Ok(())
    }

    fn if_stmt(&mut self, id: NodeId) -> Result<(), CompileError> {
        let branches = self.ast.children(id).to_vec();
        let mut cond_branches = Vec::new();
        let mut else_branch = None;
        for &branch in &branches {
            match self.ast.kind(branch) {
                NodeKind::IfBranch | NodeKind::ElifBranch => cond_branches.push(branch),
                NodeKind::ElseBranch => else_branch = Some(branch),
                kind => {
                    return Err(CompileError::at(
                        ErrorKind::InternalError(format!("unexpected branch {:?}", kind)),
                        self.ast.line(branch),
                    ))
                }
            }
        }

        let end_label = self.new_label();
        let count = cond_branches.len();
        for (i, &branch) in cond_branches.iter().enumerate() {
            let cond = self.ast.children(branch)[0];
            let body = self.ast.children(branch)[1];
            let last = i + 1 == count && else_branch.is_none();

            let body_label = self.new_label();
            let next_label = if last {
                end_label.clone()
            } else {
                self.new_label()
            };

            self.push_scope();
            self.visit(cond)?;
            self.pull_a(cond)?;
            self.pop_scope();
            self.imm(Op::CMP, 0);
            self.rel(Op::BNE, &body_label);
            self.abs(Op::JMP, &next_label);
            self.anchor(body_label);

            self.push_scope();
            self.visit_body(body)?;
            self.pop_scope();

            if !last {
                self.abs(Op::JMP, &end_label);
                self.anchor(next_label);
            }
        }

        if let Some(branch) = else_branch {
            let body = self.ast.children(branch)[0];
            self.push_scope();
            self.visit_body(body)?;
            self.pop_scope();
        }

        self.anchor(end_label);
        Ok(())
    }

    fn while_stmt(&mut self, id: NodeId) -> Result<(), CompileError> {
        let cond = self.ast.children(id)[0];
        let body = self.ast.children(id)[1];

        let loop_label = self.new_label();
        let body_label = self.new_label();
        let end_label = self.new_label();

        self.anchor(loop_label.clone());
        self.push_scope();
        self.visit(cond)?;
        self.pull_a(cond)?;
        self.pop_scope();
        self.imm(Op::CMP, 0);
        self.rel(Op::BNE, &body_label);
        self.abs(Op::JMP, &end_label);
        self.anchor(body_label);

        self.push_scope();
        self.visit_body(body)?;
        self.pop_scope();
        self.abs(Op::JMP, &loop_label);
        self.anchor(end_label);
        Ok(())
    }

    fn func(&mut self, id: NodeId) -> Result<(), CompileError> {
        let name = self.ast.name(id).to_string();
        let line = self.ast.line(id);
        let body = self.ast.children(id)[1];
        let func = self
            .funcs
            .get(&name)
            .cloned()
            .unwrap_or(Function { args: Vec::new() });

        self.anchor(name.clone());
        self.push_scope();
        self.scope_offset = 0;
        let end_label = self.new_label();
        self.func_end = Some(end_label.clone());

        // Parameters live above the return address on the hardware stack;
        // the Y displacement of the last pushed byte is 3.
        let total: u8 = func.args.iter().map(|p| p.size).sum();
        let mut cumulative = 0u8;
        for param in &func.args {
            cumulative += param.size;
            let offset = 3 + total - cumulative;
            self.register(
                &param.name,
                Variable {
                    loc: Loc::Argument(offset),
                    size: param.size,
                    is_pointer: param.is_pointer,
                    is_array: false,
                },
                line,
            )?;
        }

        // Save the caller's base pointer, install our own.
        self.imp(Op::TSX);
        self.zp(Op::LDA, BASE_PTR);
        self.imp(Op::PHA);
        self.zp(Op::STX, BASE_PTR);
        if !func.args.is_empty() {
            self.zp(Op::STX, ARG_BASE_PTR);
        }

        // Assign every declared local its stack slot and reserve the space.
        self.pending_locals.clear();
        let mut declarations = Vec::new();
        self.ast.walk(body, &mut |node| {
            if matches!(self.ast.kind(node), NodeKind::Var | NodeKind::Array) {
                declarations.push(node);
            }
        });
        for &decl in &declarations {
            let bytes = match self.ast.kind(decl) {
                NodeKind::Array => {
                    let length = self.ast.nodes[decl].value.unwrap_or(0);
                    if length > 255 {
                        return Err(CompileError::at(
                            ErrorKind::SizeError(format!("array length {} is out of range", length)),
                            self.ast.line(decl),
                        ));
                    }
                    length as i32
                }
                _ => {
                    if self.ast.nodes[decl].pointer {
                        2
                    } else {
                        1
                    }
                }
            };
            if -self.scope_offset + bytes > 255 {
                return Err(CompileError::at(ErrorKind::StackOverflow, line));
            }
            let offset = self.alloc_stack(bytes as u8);
            self.pending_locals.insert(decl, Loc::Stack(offset));
        }
        let locals = -self.scope_offset;
        if locals > 0 {
            // One extra byte covers the saved base pointer already pushed.
            if locals <= 5 {
                for _ in 0..locals + 1 {
                    self.imp(Op::DEX);
                }
            } else {
                let reserve = locals + 1;
                self.imp(Op::TXA);
                self.imp(Op::SEC);
                self.imm(Op::SBC, reserve.min(255) as u8);
                self.imp(Op::TAX);
                // 255 bytes of locals plus the saved base pointer byte.
                if reserve > 255 {
                    self.imp(Op::DEX);
                }
            }
            self.imp(Op::TXS);
        }

        self.visit_body(body)?;
        self.anchor(end_label);

        // Move the return value through Y while the frame is torn down.
        self.imp(Op::TAY);
        self.zp(Op::LDX, BASE_PTR);
        self.imp(Op::DEX);
        self.imp(Op::TXS);
        self.imp(Op::PLA);
        self.zp(Op::STA, BASE_PTR);
        self.imp(Op::TYA);
        self.imp(Op::RTS);

        self.pop_scope_silent();
        self.func_end = None;
        self.a = None;
        Ok(())
    }

    fn start(&mut self, id: NodeId) -> Result<(), CompileError> {
        let var_list = self.ast.children(id)[0];
        let func_list = self.ast.children(id)[1];

        // Register every signature up front so calls may reference functions
        // defined later in the file.
        let funcs = self.ast.children(func_list).to_vec();
        for &func in &funcs {
            let name = self.ast.name(func).to_string();
            let arg_list = self.ast.children(func)[0];
            let args = self
                .ast
                .children(arg_list)
                .iter()
                .map(|&arg| {
                    let pointer = self.ast.nodes[arg].pointer;
                    Param {
                        size: if pointer { 2 } else { 1 },
                        is_pointer: pointer,
                        name: self.ast.name(arg).to_string(),
                    }
                })
                .collect();
            self.funcs.insert(name, Function { args });
        }
        if !self.funcs.contains_key("main") {
            return Err(CompileError::new(ErrorKind::UndefinedFunction(
                "main".to_string(),
            )));
        }

        // Fixed high halves of the software base pointers: page 0 for
        // locals, page 1 for arguments.
        self.imm(Op::LDA, 0);
        self.zp(Op::STA, BASE_PTR + 1);
        self.imm(Op::LDA, 1);
        self.zp(Op::STA, ARG_BASE_PTR + 1);
        // Install a top-level frame the same way a prologue does, so that
        // global initializers may spill temporaries.
        self.imp(Op::TSX);
        self.zp(Op::STX, BASE_PTR);
        self.imp(Op::PHA);
        self.a = None;

        let globals = self.ast.children(var_list).to_vec();
        for global in globals {
            self.visit(global)?;
        }

        self.abs(Op::JSR, "main");
        self.imp(Op::BRK);

        for func in funcs {
            self.func(func)?;
        }

        let required = mem::take(&mut self.required);
        for subroutine in required {
            self.append_subroutine(subroutine)?;
        }
        Ok(())
    }

    // ----- runtime subroutines ----------------------------------------

    fn require(&mut self, subroutine: &'static Subroutine) -> String {
        if !self.required.iter().any(|s| s.name == subroutine.name) {
            self.required.push(subroutine);
        }
        subroutine.name.to_string()
    }

    fn append_subroutine(&mut self, subroutine: &Subroutine) -> Result<(), CompileError> {
        let mut labels: HashMap<String, String> = HashMap::new();
        self.anchor(subroutine.name.to_string());

        for instr in subroutine.instructions()? {
            let label = match instr.label {
                Some(local) => Some(self.local_label(&mut labels, &local)),
                None => None,
            };
            let (mode, arg) = match instr.arg {
                None => {
                    // A bare shift operates on the accumulator.
                    if matches!(instr.op, Op::ASL | Op::LSR | Op::ROL) {
                        (AddrMode::Accumulator, Arg::None)
                    } else {
                        (AddrMode::Implied, Arg::None)
                    }
                }
                Some(text) => self.classify_arg(instr.op, &text, &mut labels)?,
            };
            self.emit(instr.op, mode, arg, label);
        }
        Ok(())
    }

    fn classify_arg(
        &mut self,
        op: Op,
        text: &str,
        labels: &mut HashMap<String, String>,
    ) -> Result<(AddrMode, Arg), CompileError> {
        fn parse_int(text: &str) -> Result<u16, CompileError> {
            let result = match text.strip_prefix('$') {
                Some(hex) => u16::from_str_radix(hex, 16),
                None => text.parse(),
            };
            result.map_err(|_| {
                CompileError::new(ErrorKind::InternalError(format!(
                    "malformed runtime operand {}",
                    text
                )))
            })
        }

        if let Some(imm) = text.strip_prefix('#') {
            return Ok((AddrMode::Immediate, Arg::Value(parse_int(imm)?)));
        }
        if text.starts_with('$') {
            let value = parse_int(text)?;
            let mode = if value <= 0xFF {
                AddrMode::Zeropage
            } else {
                AddrMode::Absolute
            };
            return Ok((mode, Arg::Value(value)));
        }
        if text.starts_with('@') {
            let label = self.local_label(labels, text);
            let mode = if op.is_branch() {
                AddrMode::Relative
            } else {
                AddrMode::Absolute
            };
            return Ok((mode, Arg::Label(label)));
        }
        Err(CompileError::new(ErrorKind::InternalError(format!(
            "malformed runtime operand {}",
            text
        ))))
    }

    fn local_label(&mut self, labels: &mut HashMap<String, String>, name: &str) -> String {
        if let Some(label) = labels.get(name) {
            return label.clone();
        }
        let label = self.new_label();
        labels.insert(name.to_string(), label.clone());
        label
    }

    fn binary_children(&self, id: NodeId) -> (NodeId, NodeId) {
        let children = self.ast.children(id);
        (children[0], children[1])
    }
}

impl Stage for CodeGenerator {
    fn exec(&mut self, prg: &mut Program) -> Result<(), CompileError> {
        self.ast = mem::take(&mut prg.ast);
        self.states = vec![
            NodeState {
                loc: Loc::None,
                size: 1,
            };
            self.ast.nodes.len()
        ];
        let root = self.ast.root;
        let result = self.start(root);
        prg.ast = mem::take(&mut self.ast);
        prg.code = mem::take(&mut self.code);
        prg.asm = mem::take(&mut self.asm);
        result
    }
}
