use std::collections::HashMap;
use std::sync::OnceLock;

/// The 6502 mnemonics the code generator and the runtime library emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ADC,
    AND,
    ASL,
    BCC,
    BCS,
    BEQ,
    BNE,
    BRK,
    CLC,
    CMP,
    DEX,
    DEY,
    EOR,
    INC,
    INX,
    INY,
    JMP,
    JSR,
    LDA,
    LDX,
    LDY,
    LSR,
    NOP,
    PHA,
    PLA,
    ROL,
    RTS,
    SBC,
    SEC,
    STA,
    STX,
    STY,
    TAX,
    TAY,
    TSX,
    TXA,
    TXS,
    TYA,
}

impl Op {
    /// Lowercase mnemonic, the way the assembly listing prints it.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::ADC => "adc",
            Op::AND => "and",
            Op::ASL => "asl",
            Op::BCC => "bcc",
            Op::BCS => "bcs",
            Op::BEQ => "beq",
            Op::BNE => "bne",
            Op::BRK => "brk",
            Op::CLC => "clc",
            Op::CMP => "cmp",
            Op::DEX => "dex",
            Op::DEY => "dey",
            Op::EOR => "eor",
            Op::INC => "inc",
            Op::INX => "inx",
            Op::INY => "iny",
            Op::JMP => "jmp",
            Op::JSR => "jsr",
            Op::LDA => "lda",
            Op::LDX => "ldx",
            Op::LDY => "ldy",
            Op::LSR => "lsr",
            Op::NOP => "nop",
            Op::PHA => "pha",
            Op::PLA => "pla",
            Op::ROL => "rol",
            Op::RTS => "rts",
            Op::SBC => "sbc",
            Op::SEC => "sec",
            Op::STA => "sta",
            Op::STX => "stx",
            Op::STY => "sty",
            Op::TAX => "tax",
            Op::TAY => "tay",
            Op::TSX => "tsx",
            Op::TXA => "txa",
            Op::TXS => "txs",
            Op::TYA => "tya",
        }
    }

    /// Branch instructions take their symbolic targets as PC-relative
    /// displacements; everything else (JMP, JSR) addresses them absolutely.
    pub fn is_branch(self) -> bool {
        matches!(self, Op::BCC | Op::BCS | Op::BEQ | Op::BNE)
    }
}

pub fn match_op(string: &str) -> Option<Op> {
    let op = match string.to_lowercase().as_ref() {
        "adc" => Op::ADC,
        "and" => Op::AND,
        "asl" => Op::ASL,
        "bcc" => Op::BCC,
        "bcs" => Op::BCS,
        "beq" => Op::BEQ,
        "bne" => Op::BNE,
        "brk" => Op::BRK,
        "clc" => Op::CLC,
        "cmp" => Op::CMP,
        "dex" => Op::DEX,
        "dey" => Op::DEY,
        "eor" => Op::EOR,
        "inc" => Op::INC,
        "inx" => Op::INX,
        "iny" => Op::INY,
        "jmp" => Op::JMP,
        "jsr" => Op::JSR,
        "lda" => Op::LDA,
        "ldx" => Op::LDX,
        "ldy" => Op::LDY,
        "lsr" => Op::LSR,
        "nop" => Op::NOP,
        "pha" => Op::PHA,
        "pla" => Op::PLA,
        "rol" => Op::ROL,
        "rts" => Op::RTS,
        "sbc" => Op::SBC,
        "sec" => Op::SEC,
        "sta" => Op::STA,
        "stx" => Op::STX,
        "sty" => Op::STY,
        "tax" => Op::TAX,
        "tay" => Op::TAY,
        "tsx" => Op::TSX,
        "txa" => Op::TXA,
        "txs" => Op::TXS,
        "tya" => Op::TYA,
        _ => return None,
    };
    Some(op)
}

/// The addressing modes the generator distinguishes. `IndirectY` is
/// `($zp),Y` and `IndirectX` is `($zp,X)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrMode {
    Implied,
    Accumulator,
    Immediate,
    Zeropage,
    Absolute,
    Relative,
    IndirectY,
    IndirectX,
}

#[rustfmt::skip]
const TABLE: &[(Op, AddrMode, u8, u8)] = &[
    //  Op       Address mode           Code  Size
    (Op::ADC, AddrMode::Immediate,      0x69, 2),
    (Op::ADC, AddrMode::Zeropage,       0x65, 2),
    (Op::ADC, AddrMode::IndirectY,      0x71, 2),
    (Op::ADC, AddrMode::IndirectX,      0x61, 2),
    (Op::AND, AddrMode::Immediate,      0x29, 2),
    (Op::AND, AddrMode::Zeropage,       0x25, 2),
    (Op::ASL, AddrMode::Accumulator,    0x0A, 1),
    (Op::ASL, AddrMode::Zeropage,       0x06, 2),
    (Op::BCC, AddrMode::Relative,       0x90, 2),
    (Op::BCS, AddrMode::Relative,       0xB0, 2),
    (Op::BEQ, AddrMode::Relative,       0xF0, 2),
    (Op::BNE, AddrMode::Relative,       0xD0, 2),
    (Op::BRK, AddrMode::Implied,        0x00, 1),
    (Op::CLC, AddrMode::Implied,        0x18, 1),
    (Op::CMP, AddrMode::Immediate,      0xC9, 2),
    (Op::CMP, AddrMode::Zeropage,       0xC5, 2),
    (Op::CMP, AddrMode::IndirectY,      0xD1, 2),
    (Op::CMP, AddrMode::IndirectX,      0xC1, 2),
    (Op::DEX, AddrMode::Implied,        0xCA, 1),
    (Op::DEY, AddrMode::Implied,        0x88, 1),
    (Op::EOR, AddrMode::Immediate,      0x49, 2),
    (Op::EOR, AddrMode::Zeropage,       0x45, 2),
    (Op::INC, AddrMode::Zeropage,       0xE6, 2),
    (Op::INX, AddrMode::Implied,        0xE8, 1),
    (Op::INY, AddrMode::Implied,        0xC8, 1),
    (Op::JMP, AddrMode::Absolute,       0x4C, 3),
    (Op::JSR, AddrMode::Absolute,       0x20, 3),
    (Op::LDA, AddrMode::Immediate,      0xA9, 2),
    (Op::LDA, AddrMode::Zeropage,       0xA5, 2),
    (Op::LDA, AddrMode::Absolute,       0xAD, 3),
    (Op::LDA, AddrMode::IndirectY,      0xB1, 2),
    (Op::LDA, AddrMode::IndirectX,      0xA1, 2),
    (Op::LDX, AddrMode::Immediate,      0xA2, 2),
    (Op::LDX, AddrMode::Zeropage,       0xA6, 2),
    (Op::LDY, AddrMode::Immediate,      0xA0, 2),
    (Op::LDY, AddrMode::Zeropage,       0xA4, 2),
    (Op::LSR, AddrMode::Accumulator,    0x4A, 1),
    (Op::LSR, AddrMode::Zeropage,       0x46, 2),
    (Op::NOP, AddrMode::Implied,        0xEA, 1),
    (Op::PHA, AddrMode::Implied,        0x48, 1),
    (Op::PLA, AddrMode::Implied,        0x68, 1),
    (Op::ROL, AddrMode::Accumulator,    0x2A, 1),
    (Op::ROL, AddrMode::Zeropage,       0x26, 2),
    (Op::RTS, AddrMode::Implied,        0x60, 1),
    (Op::SBC, AddrMode::Immediate,      0xE9, 2),
    (Op::SBC, AddrMode::Zeropage,       0xE5, 2),
    (Op::SBC, AddrMode::IndirectY,      0xF1, 2),
    (Op::SBC, AddrMode::IndirectX,      0xE1, 2),
    (Op::SEC, AddrMode::Implied,        0x38, 1),
    (Op::STA, AddrMode::Zeropage,       0x85, 2),
    (Op::STA, AddrMode::Absolute,       0x8D, 3),
    (Op::STA, AddrMode::IndirectY,      0x91, 2),
    (Op::STA, AddrMode::IndirectX,      0x81, 2),
    (Op::STX, AddrMode::Zeropage,       0x86, 2),
    (Op::STY, AddrMode::Zeropage,       0x84, 2),
    (Op::TAX, AddrMode::Implied,        0xAA, 1),
    (Op::TAY, AddrMode::Implied,        0xA8, 1),
    (Op::TSX, AddrMode::Implied,        0xBA, 1),
    (Op::TXA, AddrMode::Implied,        0x8A, 1),
    (Op::TXS, AddrMode::Implied,        0x9A, 1),
    (Op::TYA, AddrMode::Implied,        0x98, 1),
];

fn table() -> &'static HashMap<(Op, AddrMode), (u8, u8)> {
    static OPCODES: OnceLock<HashMap<(Op, AddrMode), (u8, u8)>> = OnceLock::new();
    OPCODES.get_or_init(|| {
        let mut map = HashMap::new();
        let mut seen = [false; 256];
        for &(op, mode, code, size) in TABLE {
            // Lost a few hours once to a duplicate opcode, hence the check.
            assert!(!seen[code as usize], "duplicate opcode {:#04x}", code);
            seen[code as usize] = true;
            map.insert((op, mode), (code, size));
        }
        map
    })
}

/// Look up the `(opcode byte, encoded size)` pair for an instruction.
pub fn opcode(op: Op, mode: AddrMode) -> Option<(u8, u8)> {
    table().get(&(op, mode)).copied()
}

/// Decode an opcode byte back into its `(op, mode, size)` triple. The test
/// interpreter drives its instruction decoding through this.
pub fn decode(byte: u8) -> Option<(Op, AddrMode, u8)> {
    TABLE
        .iter()
        .find(|&&(_, _, code, _)| code == byte)
        .map(|&(op, mode, _, size)| (op, mode, size))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table_has_no_duplicate_opcodes() {
        // Forces the construction-time uniqueness assertion.
        assert_eq!(table().len(), TABLE.len());
    }

    #[test]
    fn sizes_match_addressing_modes() {
        for &(op, mode, _, size) in TABLE {
            match mode {
                AddrMode::Implied | AddrMode::Accumulator => assert_eq!(size, 1),
                AddrMode::Absolute => assert_eq!(size, 3),
                _ => assert_eq!(size, 2, "{:?} {:?}", op, mode),
            }
        }
    }

    #[test]
    fn decode_inverts_encode() {
        for &(op, mode, code, size) in TABLE {
            assert_eq!(decode(code), Some((op, mode, size)));
        }
    }

    #[test]
    fn branches_are_relative_only() {
        for &(op, mode, _, _) in TABLE {
            if op.is_branch() {
                assert_eq!(mode, AddrMode::Relative);
            }
        }
    }
}
