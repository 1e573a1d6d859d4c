use crate::compiler::{CompileError, ErrorKind};
use crate::opcodes::{match_op, Op};

/// A pre-assembled runtime subroutine, kept as assembly text and parsed into
/// instruction tuples when the generator appends it. Operands are taken from
/// zero page `$00`/`$01`; the result is returned in A. Local labels (`@n`)
/// are rewritten to fresh global labels on emission.
pub struct Subroutine {
    pub name: &'static str,
    code: &'static str,
}

/// One parsed subroutine line: mnemonic, optional argument text, optional
/// label defined on the line.
pub struct RuntimeInstr {
    pub op: Op,
    pub arg: Option<String>,
    pub label: Option<String>,
}

impl Subroutine {
    pub fn instructions(&self) -> Result<Vec<RuntimeInstr>, CompileError> {
        let mut instructions = Vec::new();
        for line in self.code.lines() {
            let mut line = line.trim();
            if line.is_empty() {
                continue;
            }

            let mut label = None;
            if let Some(rest) = line.strip_prefix('@') {
                match rest.split_once(':') {
                    Some((id, tail)) => {
                        label = Some(format!("@{}", id));
                        line = tail.trim();
                    }
                    None => {
                        return Err(CompileError::new(ErrorKind::InternalError(format!(
                            "malformed label in {} subroutine: {}",
                            self.name, line
                        ))))
                    }
                }
            }

            let mut parts = line.split_whitespace();
            let mnemonic = parts.next().unwrap_or("");
            let op = match_op(mnemonic).ok_or_else(|| {
                CompileError::new(ErrorKind::InternalError(format!(
                    "unknown mnemonic in {} subroutine: {}",
                    self.name, mnemonic
                )))
            })?;
            let arg = parts.next().map(str::to_string);

            instructions.push(RuntimeInstr { op, arg, label });
        }
        Ok(instructions)
    }
}

/// 8-bit shift-and-add multiplication.
/// $00 - first operand, $01 - second operand, A - result.
pub const MUL: Subroutine = Subroutine {
    name: "MUL",
    code: "
        ldx $00
        ldy $01
        lda #$00
        sta $00
    @0: tya
        and #$01
        beq @1
        txa
        clc
        adc $00
        sta $00
    @1: txa
        asl
        tax
        tya
        lsr
        tay
        bne @0
        lda $00
        rts
    ",
};

/// 8-bit restoring division.
/// $00 - dividend, $01 - divisor, A - result.
///
/// http://6502org.wikidot.com/software-math-intdiv
pub const DIV: Subroutine = Subroutine {
    name: "DIV",
    code: "
        lda #$00
        ldx #$08
        asl $00
    @0: rol
        cmp $01
        bcc @1
        sbc $01
    @1: rol $00
        dex
        bne @0
        lda $00
        rts
    ",
};
