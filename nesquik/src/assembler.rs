use crate::compiler::{Arg, CompileError, ErrorKind, Program, Stage};
use crate::opcodes::{opcode, AddrMode};

/// Emits the final byte image from the resolved instruction stream.
pub struct Assembler;

impl Assembler {
    pub fn new() -> Assembler {
        Assembler
    }
}

impl Stage for Assembler {
    fn exec(&mut self, prg: &mut Program) -> Result<(), CompileError> {
        for instr in &prg.code {
            let op = match instr.op {
                // Label anchors emit nothing.
                None => continue,
                Some(op) => op,
            };

            let (code, size) = opcode(op, instr.mode).ok_or_else(|| {
                CompileError::new(ErrorKind::InternalError(format!(
                    "no encoding for {:?} {:?}",
                    op, instr.mode
                )))
            })?;

            prg.obj.push(code);
            match (&instr.arg, size) {
                (Arg::None, 1) => {}
                (Arg::Value(value), 2) => {
                    if *value > 0xFF {
                        return Err(CompileError::new(ErrorKind::InternalError(format!(
                            "argument {:#x} does not fit a single byte",
                            value
                        ))));
                    }
                    prg.obj.push(*value as u8);
                }
                // Absolute addresses are stored low byte first.
                (Arg::Value(value), 3) if instr.mode == AddrMode::Absolute => {
                    let [lo, hi] = value.to_le_bytes();
                    prg.obj.push(lo);
                    prg.obj.push(hi);
                }
                _ => {
                    return Err(CompileError::new(ErrorKind::InternalError(
                        "mismatching address mode and argument size".to_string(),
                    )))
                }
            }
        }
        Ok(())
    }
}
