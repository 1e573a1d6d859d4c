use crate::assembler::Assembler;
use crate::ast::Ast;
use crate::codegen::CodeGenerator;
use crate::opcodes::{AddrMode, Op};
use crate::resolver::AddressResolver;

/// The argument of a generated instruction: nothing, a resolved integer, or
/// a symbolic label placeholder the resolver rewrites later.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    None,
    Value(u16),
    Label(String),
}

/// One generated instruction. `op == None` marks a pure label anchor that
/// contributes zero bytes to the image.
#[derive(Debug, Clone)]
pub struct Instr {
    pub op: Option<Op>,
    pub mode: AddrMode,
    pub arg: Arg,
    pub label: Option<String>,
}

impl Instr {
    pub fn anchor(label: String) -> Instr {
        Instr {
            op: None,
            mode: AddrMode::Implied,
            arg: Arg::None,
            label: Some(label),
        }
    }
}

/// A NESQuik program.
///
/// Initially just the parsed AST and the target load address; each compiler
/// stage populates it further.
#[derive(Debug)]
pub struct Program {
    /// Code segment offset in memory.
    pub org: u16,
    /// Parsed abstract syntax tree.
    pub ast: Ast,
    /// Generated instruction stream, including label anchors.
    pub code: Vec<Instr>,
    /// Assembly listing, one line per non-anchor instruction.
    pub asm: Vec<String>,
    /// Assembled object code.
    pub obj: Vec<u8>,
}

impl Program {
    pub fn new(ast: Ast, org: u16) -> Program {
        Program {
            org,
            ast,
            code: Vec::new(),
            asm: Vec::new(),
            obj: Vec::new(),
        }
    }
}

/// A compiler stage that performs some manipulation of the Program.
pub trait Stage {
    fn exec(&mut self, prg: &mut Program) -> Result<(), CompileError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    UndefinedVariable(String),
    RedefinedVariable(String),
    UndefinedFunction(String),
    UndefinedLabel(String),
    InvalidDereference(String),
    SizeError(String),
    StackOverflow,
    BadArgs(String),
    InternalError(String),
}

#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub line: Option<usize>,
}

impl CompileError {
    pub fn new(kind: ErrorKind) -> CompileError {
        CompileError { kind, line: None }
    }

    pub fn at(kind: ErrorKind, line: usize) -> CompileError {
        CompileError {
            kind,
            line: Some(line),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.kind {
            ErrorKind::UndefinedVariable(name) => write!(f, "undefined variable {}", name)?,
            ErrorKind::RedefinedVariable(name) => {
                write!(f, "variable {} is already defined", name)?
            }
            ErrorKind::UndefinedFunction(name) => write!(f, "undefined function {}", name)?,
            ErrorKind::UndefinedLabel(name) => write!(f, "undefined label {}", name)?,
            ErrorKind::InvalidDereference(name) => {
                write!(f, "{} is not a pointer", name)?
            }
            ErrorKind::SizeError(message) => write!(f, "{}", message)?,
            ErrorKind::StackOverflow => write!(f, "function locals exceed 255 bytes")?,
            ErrorKind::BadArgs(name) => write!(f, "bad arguments in call to {}", name)?,
            ErrorKind::InternalError(message) => write!(f, "internal error: {}", message)?,
        }
        if let Some(line) = self.line {
            write!(f, " (line {})", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Run the full pipeline over a parsed AST. The stages are strictly ordered:
/// the resolver needs the final instruction stream, and the assembler needs
/// every symbolic argument rewritten.
pub fn compile(ast: Ast, org: u16) -> Result<Program, CompileError> {
    let mut prg = Program::new(ast, org);
    CodeGenerator::new().exec(&mut prg)?;
    AddressResolver::new().exec(&mut prg)?;
    Assembler::new().exec(&mut prg)?;
    Ok(prg)
}
