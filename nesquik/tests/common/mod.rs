// Not every suite uses every helper.
#![allow(dead_code)]

use nesquik::compiler::{compile, CompileError, Program};
use nesquik::opcodes::{decode, AddrMode, Op};
use nesquik::parser::parse;

pub const ORG: u16 = 0xC000;

/// Upper bound on executed instructions; a program that runs this long has
/// diverged.
const MAX_TICKS: u64 = 1_000_000;

/// A minimal 6502 interpreter covering exactly the instructions the
/// compiler emits. Decoding is driven by the compiler's own opcode table;
/// execution runs until the program counter lands on a BRK.
pub struct Cpu {
    pub memory: Vec<u8>,
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub s: u8,
    pub pc: u16,
    pub carry: bool,
    pub zero: bool,
    pub negative: bool,
    ticks: u64,
}

impl Cpu {
    pub fn new() -> Cpu {
        Cpu {
            memory: vec![0; 0x10000],
            a: 0,
            x: 0,
            y: 0,
            s: 0xFF,
            pc: ORG,
            carry: false,
            zero: false,
            negative: false,
            ticks: 0,
        }
    }

    /// Compile NQ source and load the image at ORG.
    pub fn compile(&mut self, source: &str) -> Program {
        let prg = try_compile(source).unwrap_or_else(|err| panic!("compile failed: {}", err));
        self.load(&prg.obj);
        prg
    }

    pub fn load(&mut self, obj: &[u8]) {
        let base = ORG as usize;
        self.memory[base..base + obj.len()].copy_from_slice(obj);
        self.pc = ORG;
    }

    pub fn compile_and_run(&mut self, source: &str) -> Program {
        let prg = self.compile(source);
        self.run();
        prg
    }

    /// Step until the next opcode is BRK.
    pub fn run(&mut self) {
        while self.memory[self.pc as usize] != 0x00 {
            self.step();
            self.ticks += 1;
            assert!(self.ticks < MAX_TICKS, "program did not terminate");
        }
    }

    fn next_u8(&mut self) -> u8 {
        let value = self.memory[self.pc as usize];
        self.pc = self.pc.wrapping_add(1);
        value
    }

    fn next_u16(&mut self) -> u16 {
        let lo = self.next_u8();
        let hi = self.next_u8();
        u16::from_le_bytes([lo, hi])
    }

    fn read_u16_zp(&self, addr: u8) -> u16 {
        let lo = self.memory[addr as usize];
        let hi = self.memory[addr.wrapping_add(1) as usize];
        u16::from_le_bytes([lo, hi])
    }

    fn operand_address(&mut self, mode: AddrMode) -> u16 {
        match mode {
            AddrMode::Immediate => {
                let address = self.pc;
                self.pc = self.pc.wrapping_add(1);
                address
            }
            AddrMode::Zeropage => self.next_u8() as u16,
            AddrMode::Absolute => self.next_u16(),
            AddrMode::IndirectY => {
                let zp = self.next_u8();
                self.read_u16_zp(zp).wrapping_add(self.y as u16)
            }
            AddrMode::IndirectX => {
                let zp = self.next_u8().wrapping_add(self.x);
                self.read_u16_zp(zp)
            }
            mode => panic!("mode {:?} has no operand address", mode),
        }
    }

    fn operand(&mut self, mode: AddrMode) -> u8 {
        let address = self.operand_address(mode);
        self.memory[address as usize]
    }

    fn set_zn(&mut self, value: u8) {
        self.zero = value == 0;
        self.negative = value & 0x80 != 0;
    }

    fn add_with_carry(&mut self, operand: u8) {
        let sum = self.a as u16 + operand as u16 + self.carry as u16;
        self.carry = sum > 0xFF;
        self.a = sum as u8;
        self.set_zn(self.a);
    }

    fn push(&mut self, value: u8) {
        self.memory[0x100 + self.s as usize] = value;
        self.s = self.s.wrapping_sub(1);
    }

    fn pull(&mut self) -> u8 {
        self.s = self.s.wrapping_add(1);
        self.memory[0x100 + self.s as usize]
    }

    fn branch(&mut self, taken: bool) {
        let displacement = self.next_u8() as i8;
        if taken {
            self.pc = self.pc.wrapping_add(displacement as u16);
        }
    }

    pub fn step(&mut self) {
        let byte = self.next_u8();
        let (op, mode, _) = decode(byte)
            .unwrap_or_else(|| panic!("unknown opcode {:#04x} at {:#06x}", byte, self.pc - 1));

        match op {
            Op::LDA => {
                self.a = self.operand(mode);
                self.set_zn(self.a);
            }
            Op::LDX => {
                self.x = self.operand(mode);
                self.set_zn(self.x);
            }
            Op::LDY => {
                self.y = self.operand(mode);
                self.set_zn(self.y);
            }
            Op::STA => {
                let address = self.operand_address(mode);
                self.memory[address as usize] = self.a;
            }
            Op::STX => {
                let address = self.operand_address(mode);
                self.memory[address as usize] = self.x;
            }
            Op::STY => {
                let address = self.operand_address(mode);
                self.memory[address as usize] = self.y;
            }
            Op::ADC => {
                let operand = self.operand(mode);
                self.add_with_carry(operand);
            }
            // SBC is ADC of the inverted operand; SEC beforehand makes the
            // carry the +1 of the two's complement.
            Op::SBC => {
                let operand = self.operand(mode);
                self.add_with_carry(!operand);
            }
            Op::CMP => {
                let operand = self.operand(mode);
                self.carry = self.a >= operand;
                let diff = self.a.wrapping_sub(operand);
                self.set_zn(diff);
            }
            Op::AND => {
                self.a &= self.operand(mode);
                self.set_zn(self.a);
            }
            Op::EOR => {
                self.a ^= self.operand(mode);
                self.set_zn(self.a);
            }
            Op::ASL => {
                if mode == AddrMode::Accumulator {
                    self.carry = self.a & 0x80 != 0;
                    self.a <<= 1;
                    self.set_zn(self.a);
                } else {
                    let address = self.operand_address(mode) as usize;
                    let value = self.memory[address];
                    self.carry = value & 0x80 != 0;
                    self.memory[address] = value << 1;
                    self.set_zn(self.memory[address]);
                }
            }
            Op::LSR => {
                if mode == AddrMode::Accumulator {
                    self.carry = self.a & 0x01 != 0;
                    self.a >>= 1;
                    self.set_zn(self.a);
                } else {
                    let address = self.operand_address(mode) as usize;
                    let value = self.memory[address];
                    self.carry = value & 0x01 != 0;
                    self.memory[address] = value >> 1;
                    self.set_zn(self.memory[address]);
                }
            }
            Op::ROL => {
                let carry_in = self.carry as u8;
                if mode == AddrMode::Accumulator {
                    self.carry = self.a & 0x80 != 0;
                    self.a = (self.a << 1) | carry_in;
                    self.set_zn(self.a);
                } else {
                    let address = self.operand_address(mode) as usize;
                    let value = self.memory[address];
                    self.carry = value & 0x80 != 0;
                    self.memory[address] = (value << 1) | carry_in;
                    self.set_zn(self.memory[address]);
                }
            }
            Op::INC => {
                let address = self.operand_address(mode) as usize;
                self.memory[address] = self.memory[address].wrapping_add(1);
                self.set_zn(self.memory[address]);
            }
            Op::INX => {
                self.x = self.x.wrapping_add(1);
                self.set_zn(self.x);
            }
            Op::INY => {
                self.y = self.y.wrapping_add(1);
                self.set_zn(self.y);
            }
            Op::DEX => {
                self.x = self.x.wrapping_sub(1);
                self.set_zn(self.x);
            }
            Op::DEY => {
                self.y = self.y.wrapping_sub(1);
                self.set_zn(self.y);
            }
            Op::CLC => self.carry = false,
            Op::SEC => self.carry = true,
            Op::JMP => self.pc = self.next_u16(),
            Op::JSR => {
                let target = self.next_u16();
                let return_address = self.pc.wrapping_sub(1);
                let [lo, hi] = return_address.to_le_bytes();
                self.push(hi);
                self.push(lo);
                self.pc = target;
            }
            Op::RTS => {
                let lo = self.pull();
                let hi = self.pull();
                self.pc = u16::from_le_bytes([lo, hi]).wrapping_add(1);
            }
            Op::PHA => self.push(self.a),
            Op::PLA => {
                self.a = self.pull();
                self.set_zn(self.a);
            }
            Op::TAX => {
                self.x = self.a;
                self.set_zn(self.x);
            }
            Op::TAY => {
                self.y = self.a;
                self.set_zn(self.y);
            }
            Op::TXA => {
                self.a = self.x;
                self.set_zn(self.a);
            }
            Op::TYA => {
                self.a = self.y;
                self.set_zn(self.a);
            }
            Op::TSX => {
                self.x = self.s;
                self.set_zn(self.x);
            }
            Op::TXS => self.s = self.x,
            Op::BCC => self.branch(!self.carry),
            Op::BCS => self.branch(self.carry),
            Op::BEQ => self.branch(self.zero),
            Op::BNE => self.branch(!self.zero),
            Op::NOP => {}
            Op::BRK => panic!("stepped into BRK"),
        }
    }
}

/// Parse and compile, surfacing compile errors for the error suites.
pub fn try_compile(source: &str) -> Result<Program, CompileError> {
    let ast = parse(source).unwrap_or_else(|err| panic!("parse failed: {}", err));
    compile(ast, ORG)
}

pub fn cpu() -> Cpu {
    Cpu::new()
}
