use std::collections::HashMap;

use crate::compiler::{Arg, CompileError, ErrorKind, Instr, Program, Stage};
use crate::opcodes::{opcode, AddrMode};

/// Resolves symbolic label arguments in two passes: the first records every
/// label's byte offset, the second rewrites symbolic args into relative
/// displacements or `org`-biased absolute addresses.
pub struct AddressResolver {
    labels: HashMap<String, usize>,
}

impl AddressResolver {
    pub fn new() -> AddressResolver {
        AddressResolver {
            labels: HashMap::new(),
        }
    }

    fn size_of(instr: &Instr) -> Result<usize, CompileError> {
        match instr.op {
            // Label anchors occupy no bytes.
            None => Ok(0),
            Some(op) => match opcode(op, instr.mode) {
                Some((_, size)) => Ok(size as usize),
                None => Err(CompileError::new(ErrorKind::InternalError(format!(
                    "no encoding for {:?} {:?}",
                    op, instr.mode
                )))),
            },
        }
    }

    fn compute_offsets(&mut self, code: &[Instr]) -> Result<(), CompileError> {
        let mut offset = 0;
        for instr in code {
            if let Some(label) = &instr.label {
                if self.labels.insert(label.clone(), offset).is_some() {
                    return Err(CompileError::new(ErrorKind::InternalError(format!(
                        "label {} defined twice",
                        label
                    ))));
                }
            }
            offset += Self::size_of(instr)?;
        }
        Ok(())
    }

    fn inject_offsets(&mut self, org: u16, code: &mut [Instr]) -> Result<(), CompileError> {
        let mut offset = 0;
        for instr in code.iter_mut() {
            let size = Self::size_of(instr)?;

            if let Arg::Label(name) = &instr.arg {
                let label_offset = *self
                    .labels
                    .get(name)
                    .ok_or_else(|| CompileError::new(ErrorKind::UndefinedLabel(name.clone())))?;

                if instr.mode == AddrMode::Relative {
                    // The displacement is relative to the next instruction;
                    // the -2 compensates for the branch instruction size.
                    let displacement = label_offset as i64 - offset as i64 - 2;
                    if !(-128..=127).contains(&displacement) {
                        return Err(CompileError::new(ErrorKind::InternalError(format!(
                            "branch to {} out of range ({})",
                            name, displacement
                        ))));
                    }
                    // Negative displacements are two's complement bytes.
                    let byte = if displacement < 0 {
                        (0x100 + displacement) as u16
                    } else {
                        displacement as u16
                    };
                    instr.arg = Arg::Value(byte);
                } else {
                    instr.arg = Arg::Value(org.wrapping_add(label_offset as u16));
                }
            }

            offset += size;
        }
        Ok(())
    }
}

impl Stage for AddressResolver {
    fn exec(&mut self, prg: &mut Program) -> Result<(), CompileError> {
        self.compute_offsets(&prg.code)?;
        self.inject_offsets(prg.org, &mut prg.code)
    }
}
