//! The Gameboy and the Gameboy Color share the same CPU: an 8-bit Z80-like core by Sharp (the SM83, often called the
//! LR35902 after the SoC it lives in). It has 8 8-bit registers (one of which holds the ALU flags), some of which can be
//! paired up for a handful of 16-bit operations, and a 16-bit memory bus.
//!
//! This module decodes and executes instructions. It doesn't clock anything itself: each step reports how many machine
//! cycles it consumed, and the console turns that into master clock time for the rest of the hardware.

use crate::error::Error;
use crate::interrupt::InterruptController;
use crate::Model;
use serde::{Deserialize, Serialize};

/// Machine cycles for each unprefixed opcode, assuming any condition is not met. Zero marks the illegal opcodes
/// (and the 0xCB prefix, which is costed from the second byte).
#[rustfmt::skip]
const OP_CYCLES: [u8; 256] = [
//  0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F
    1, 3, 2, 2, 1, 1, 2, 1, 5, 2, 2, 2, 1, 1, 2, 1, // 0x00
    1, 3, 2, 2, 1, 1, 2, 1, 3, 2, 2, 2, 1, 1, 2, 1, // 0x10
    2, 3, 2, 2, 1, 1, 2, 1, 2, 2, 2, 2, 1, 1, 2, 1, // 0x20
    2, 3, 2, 2, 3, 3, 3, 1, 2, 2, 2, 2, 1, 1, 2, 1, // 0x30
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 0x40
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 0x50
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 0x60
    2, 2, 2, 2, 2, 2, 1, 2, 1, 1, 1, 1, 1, 1, 2, 1, // 0x70
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 0x80
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 0x90
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 0xA0
    1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 2, 1, // 0xB0
    2, 3, 3, 4, 3, 4, 2, 4, 2, 4, 3, 0, 3, 6, 2, 4, // 0xC0
    2, 3, 3, 0, 3, 4, 2, 4, 2, 4, 3, 0, 3, 0, 2, 4, // 0xD0
    3, 3, 2, 0, 0, 4, 2, 4, 4, 1, 4, 0, 0, 0, 2, 4, // 0xE0
    3, 3, 2, 1, 0, 4, 2, 4, 3, 2, 4, 1, 0, 0, 2, 4, // 0xF0
];

/// Servicing an interrupt: 2 idle cycles, 2 for the push, 1 for the jump.
pub const INTERRUPT_CYCLES: u32 = 5;

/// Machine cycles for a 0xCB-prefixed opcode, including the prefix fetch.
pub fn cb_cycles(op: u8) -> u32 {
    if op & 0b111 != 6 {
        2
    } else if op >> 6 == 1 {
        3 // BIT n,(HL) only reads.
    } else {
        4
    }
}

/// The main Cpu struct, containing all the CPU registers and core CPU state. Many of the CPU instructions modify the
/// registers contained here. Anything else is modified by reading/writing from the external memory bus.
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct Cpu {
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub f: Flags,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,

    pub ime: bool,
    pub ime_defer: bool, // EI takes effect after the following instruction.
    pub halted: bool,
    halt_bug: bool,      // HALT with IME=0 and an interrupt pending: next opcode fetch doesn't advance PC.
}

/// Everything the CPU needs from the outside world. Reads and writes don't cost anything here, instruction timing is
/// accounted for as a whole when the step completes.
pub trait Bus {
    fn memory_read(&mut self, addr: u16) -> u8;
    fn memory_write(&mut self, addr: u16, v: u8);
    fn interrupt_controller(&mut self) -> &mut InterruptController;

    /// Called when the CPU executes STOP. On the CGB this is where an armed speed switch happens.
    fn stop(&mut self);

    fn memory_read16(&mut self, addr: u16) -> u16 {
        let lo = u16::from(self.memory_read(addr));
        lo | u16::from(self.memory_read(addr.wrapping_add(1))) << 8
    }

    fn memory_write16(&mut self, addr: u16, v: u16) {
        self.memory_write(addr.wrapping_add(1), (v >> 8) as u8);
        self.memory_write(addr, v as u8);
    }
}

/// CPU flags contained in the "F" register:
/// Z: Zero flag, N: subtract flag, H: half carry flag, C: carry flag
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Flags {
    pub z: bool, // Bit 7
    pub n: bool, // Bit 6
    pub h: bool, // Bit 5
    pub c: bool, // Bit 4
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[rustfmt::skip]
pub enum Register { A, B, C, D, E, H, L }
use Register::*;

#[derive(Clone, Copy, Debug, PartialEq)]
#[rustfmt::skip]
pub enum Register16 { AF, BC, DE, HL, SP }
use Register16::*;

/// The 4 conditions available to branching instructions (CALL/JP/JR/RET).
#[derive(Clone, Copy, Debug, PartialEq)]
#[rustfmt::skip]
pub enum FlagCondition { NZ, Z, NC, C }

/// The 8 accumulator operations that share an encoding pattern.
#[derive(Clone, Copy, Debug, PartialEq)]
#[rustfmt::skip]
pub enum AluOp { Add, Adc, Sub, Sbc, And, Xor, Or, Cp }

/// The 8 shift/rotate operations in the 0xCB table.
#[derive(Clone, Copy, Debug, PartialEq)]
#[rustfmt::skip]
pub enum ShiftOp { Rlc, Rrc, Rl, Rr, Sla, Sra, Swap, Srl }

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operand {
    Reg(Register),          // An 8-bit register.
    Imm(u8),                // An immediate 8-bit value embedded after the opcode.
    Indirect(Register16),   // Memory at the address held in a 16-bit register.
    IndirectInc(Register16), // As above, incrementing the register afterwards.
    IndirectDec(Register16), // As above, decrementing the register afterwards.
    Absolute(u16),          // Memory at an immediate 16-bit address.
    HighImm(u8),            // Memory at $FF00 + immediate.
    HighC,                  // Memory at $FF00 + C.
}

/// A decoded instruction. Instructions that only differ by operand share a variant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Instruction {
    Alu(AluOp, Operand),
    AddHl(Register16),
    AddSp(i8),
    Bit(u8, Operand),
    Call(Option<FlagCondition>, u16),
    Ccf,
    Cpl,
    Daa,
    Dec(Operand),
    Dec16(Register16),
    Di,
    Ei,
    Halt,
    Inc(Operand),
    Inc16(Register16),
    Jp(Option<FlagCondition>, u16),
    JpHl,
    Jr(Option<FlagCondition>, i8),
    Ld(Operand, Operand),
    Ld16(Register16, u16),
    LdHlSp(i8),
    LdSpHl,
    Nop,
    Pop(Register16),
    Push(Register16),
    Res(u8, Operand),
    Ret(Option<FlagCondition>),
    Reti,
    Rst(u8),
    Scf,
    Set(u8, Operand),
    Shift(ShiftOp, Operand),
    ShiftA(ShiftOp), // RLCA/RRCA/RLA/RRA. Same as the 0xCB versions but Z is always cleared.
    Stop,
    StoreSp(u16),
    Invalid(u8),
}
use Instruction::*;

const R8: [Operand; 8] = [
    Operand::Reg(B),
    Operand::Reg(C),
    Operand::Reg(D),
    Operand::Reg(E),
    Operand::Reg(H),
    Operand::Reg(L),
    Operand::Indirect(HL),
    Operand::Reg(A),
];
const RP: [Register16; 4] = [BC, DE, HL, SP];
const RP2: [Register16; 4] = [BC, DE, HL, AF];
const CC: [FlagCondition; 4] = [FlagCondition::NZ, FlagCondition::Z, FlagCondition::NC, FlagCondition::C];
const ALU: [AluOp; 8] = [AluOp::Add, AluOp::Adc, AluOp::Sub, AluOp::Sbc, AluOp::And, AluOp::Xor, AluOp::Or, AluOp::Cp];
const SHIFTS: [ShiftOp; 8] = [
    ShiftOp::Rlc,
    ShiftOp::Rrc,
    ShiftOp::Rl,
    ShiftOp::Rr,
    ShiftOp::Sla,
    ShiftOp::Sra,
    ShiftOp::Swap,
    ShiftOp::Srl,
];

/// Decodes the next instruction, pulling opcode and operand bytes from `fetch`.
/// The opcode space is laid out in octal: bits 7-6 pick a quadrant, bits 5-3 and 2-0 pick the operation/operands.
pub fn decode_instruction<T: FnMut() -> u8>(mut fetch: T) -> Instruction {
    macro_rules! fetch16 {
        () => {{
            let lo = u16::from(fetch());
            lo | u16::from(fetch()) << 8
        }};
    }

    let op = fetch();
    let (x, y, z) = (op >> 6, ((op >> 3) & 7) as usize, (op & 7) as usize);
    let (p, q) = (y >> 1, y & 1);

    match x {
        0 => match z {
            0 => match y {
                0 => Nop,
                1 => StoreSp(fetch16!()),
                2 => Stop,
                3 => Jr(None, fetch() as i8),
                _ => Jr(Some(CC[y - 4]), fetch() as i8),
            },
            1 if q == 0 => Ld16(RP[p], fetch16!()),
            1 => AddHl(RP[p]),
            2 => {
                let mem = match p {
                    0 => Operand::Indirect(BC),
                    1 => Operand::Indirect(DE),
                    2 => Operand::IndirectInc(HL),
                    _ => Operand::IndirectDec(HL),
                };
                if q == 0 {
                    Ld(mem, Operand::Reg(A))
                } else {
                    Ld(Operand::Reg(A), mem)
                }
            }
            3 if q == 0 => Inc16(RP[p]),
            3 => Dec16(RP[p]),
            4 => Inc(R8[y]),
            5 => Dec(R8[y]),
            6 => Ld(R8[y], Operand::Imm(fetch())),
            _ => match y {
                0..=3 => ShiftA(SHIFTS[y]),
                4 => Daa,
                5 => Cpl,
                6 => Scf,
                _ => Ccf,
            },
        },
        1 if op == 0x76 => Halt,
        1 => Ld(R8[y], R8[z]),
        2 => Alu(ALU[y], R8[z]),
        _ => match z {
            0 => match y {
                0..=3 => Ret(Some(CC[y])),
                4 => Ld(Operand::HighImm(fetch()), Operand::Reg(A)),
                5 => AddSp(fetch() as i8),
                6 => Ld(Operand::Reg(A), Operand::HighImm(fetch())),
                _ => LdHlSp(fetch() as i8),
            },
            1 if q == 0 => Pop(RP2[p]),
            1 => match p {
                0 => Ret(None),
                1 => Reti,
                2 => JpHl,
                _ => LdSpHl,
            },
            2 => match y {
                0..=3 => Jp(Some(CC[y]), fetch16!()),
                4 => Ld(Operand::HighC, Operand::Reg(A)),
                5 => Ld(Operand::Absolute(fetch16!()), Operand::Reg(A)),
                6 => Ld(Operand::Reg(A), Operand::HighC),
                _ => Ld(Operand::Reg(A), Operand::Absolute(fetch16!())),
            },
            3 => match y {
                0 => Jp(None, fetch16!()),
                1 => decode_cb(fetch()),
                6 => Di,
                7 => Ei,
                _ => Invalid(op),
            },
            4 if y < 4 => Call(Some(CC[y]), fetch16!()),
            5 if q == 0 => Push(RP2[p]),
            5 if p == 0 => Call(None, fetch16!()),
            6 => Alu(ALU[y], Operand::Imm(fetch())),
            7 => Rst((y as u8) * 8),
            _ => Invalid(op),
        },
    }
}

fn decode_cb(op: u8) -> Instruction {
    let (y, o) = ((op >> 3) & 7, R8[(op & 7) as usize]);
    match op >> 6 {
        0 => Shift(SHIFTS[y as usize], o),
        1 => Bit(y, o),
        2 => Res(y, o),
        _ => Set(y, o),
    }
}

/// Computes an accumulator operation. Returns the new accumulator value (unchanged for CP) and resulting flags.
pub fn alu(op: AluOp, a: u8, v: u8, carry_in: bool) -> (u8, Flags) {
    let carry = match op {
        AluOp::Adc | AluOp::Sbc if carry_in => 1,
        _ => 0,
    };

    let (result, n, h, c) = match op {
        AluOp::Add | AluOp::Adc => {
            let wide = u16::from(a) + u16::from(v) + u16::from(carry);
            (wide as u8, false, (a & 0xF) + (v & 0xF) + carry > 0xF, wide > 0xFF)
        }
        AluOp::Sub | AluOp::Sbc | AluOp::Cp => {
            let r = a.wrapping_sub(v).wrapping_sub(carry);
            let h = (a & 0xF) < (v & 0xF) + carry;
            let c = u16::from(a) < u16::from(v) + u16::from(carry);
            (r, true, h, c)
        }
        AluOp::And => (a & v, false, true, false),
        AluOp::Xor => (a ^ v, false, false, false),
        AluOp::Or => (a | v, false, false, false),
    };

    let flags = Flags { z: result == 0, n, h, c };
    if op == AluOp::Cp {
        (a, flags)
    } else {
        (result, flags)
    }
}

/// Computes a shift/rotate. Returns the shifted value and the new carry.
pub fn shift(op: ShiftOp, v: u8, carry_in: bool) -> (u8, bool) {
    let carry_in = carry_in as u8;
    match op {
        ShiftOp::Rlc => (v.rotate_left(1), v & 0x80 != 0),
        ShiftOp::Rrc => (v.rotate_right(1), v & 0x01 != 0),
        ShiftOp::Rl => (v << 1 | carry_in, v & 0x80 != 0),
        ShiftOp::Rr => (v >> 1 | carry_in << 7, v & 0x01 != 0),
        ShiftOp::Sla => (v << 1, v & 0x80 != 0),
        ShiftOp::Sra => (v >> 1 | (v & 0x80), v & 0x01 != 0),
        ShiftOp::Swap => (v.rotate_left(4), false),
        ShiftOp::Srl => (v >> 1, v & 0x01 != 0),
    }
}

impl Cpu {
    pub fn new() -> Cpu {
        Default::default()
    }

    /// Puts the registers into the state the boot ROM leaves them in when it hands over to the cartridge at $0100.
    pub fn skip_bootrom(&mut self, model: Model) {
        *self = Default::default();
        let (af, bc, de, hl) = match model {
            Model::Dmg => (0x01B0, 0x0013, 0x00D8, 0x014D),
            Model::Cgb => (0x1180, 0x0000, 0xFF56, 0x000D),
        };
        self.register16_set(AF, af);
        self.register16_set(BC, bc);
        self.register16_set(DE, de);
        self.register16_set(HL, hl);
        self.sp = 0xFFFE;
        self.pc = 0x0100;
    }

    /// Returns the current value of an 8-bit CPU register.
    fn register_get(&self, r: Register) -> u8 {
        match r {
            A => self.a,
            B => self.b,
            C => self.c,
            D => self.d,
            E => self.e,
            H => self.h,
            L => self.l,
        }
    }

    fn register_set(&mut self, r: Register, v: u8) {
        match r {
            A => self.a = v,
            B => self.b = v,
            C => self.c = v,
            D => self.d = v,
            E => self.e = v,
            H => self.h = v,
            L => self.l = v,
        }
    }

    /// Returns the current value of a 16-bit CPU register.
    pub fn register16_get(&self, reg: Register16) -> u16 {
        let (hi, lo) = match reg {
            AF => (self.a, self.f.pack()),
            BC => (self.b, self.c),
            DE => (self.d, self.e),
            HL => (self.h, self.l),
            SP => return self.sp,
        };
        u16::from(hi) << 8 | u16::from(lo)
    }

    pub fn register16_set(&mut self, reg: Register16, v: u16) {
        let (hi, lo) = ((v >> 8) as u8, v as u8);
        match reg {
            AF => {
                self.a = hi;
                self.f.unpack(lo);
            }
            BC => {
                self.b = hi;
                self.c = lo;
            }
            DE => {
                self.d = hi;
                self.e = lo;
            }
            HL => {
                self.h = hi;
                self.l = lo;
            }
            SP => self.sp = v,
        }
    }

    /// Resolves an operand to the memory address it refers to, applying any post increment/decrement.
    fn operand_addr(&mut self, o: Operand) -> Option<u16> {
        match o {
            Operand::Reg(_) | Operand::Imm(_) => None,
            Operand::Indirect(rr) => Some(self.register16_get(rr)),
            Operand::IndirectInc(rr) => {
                let addr = self.register16_get(rr);
                self.register16_set(rr, addr.wrapping_add(1));
                Some(addr)
            }
            Operand::IndirectDec(rr) => {
                let addr = self.register16_get(rr);
                self.register16_set(rr, addr.wrapping_sub(1));
                Some(addr)
            }
            Operand::Absolute(addr) => Some(addr),
            Operand::HighImm(n) => Some(0xFF00 | u16::from(n)),
            Operand::HighC => Some(0xFF00 | u16::from(self.c)),
        }
    }

    fn operand_get<T: Bus>(&mut self, bus: &mut T, o: Operand) -> u8 {
        match o {
            Operand::Reg(r) => self.register_get(r),
            Operand::Imm(d) => d,
            _ => match self.operand_addr(o) {
                Some(addr) => bus.memory_read(addr),
                None => 0xFF,
            },
        }
    }

    /// Saves a value into an operand destination. Immediates aren't valid destinations and never get decoded as one.
    fn operand_set<T: Bus>(&mut self, bus: &mut T, o: Operand, v: u8) {
        match o {
            Operand::Reg(r) => self.register_set(r, v),
            Operand::Imm(_) => {}
            _ => {
                if let Some(addr) = self.operand_addr(o) {
                    bus.memory_write(addr, v);
                }
            }
        }
    }

    /// Read-modify-write on an operand. (HL) is only resolved once, so it's read and written at the same address.
    fn operand_update<T: Bus, F: FnOnce(&mut Cpu, u8) -> u8>(&mut self, bus: &mut T, o: Operand, f: F) {
        if let Operand::Reg(r) = o {
            let v = self.register_get(r);
            let v = f(self, v);
            self.register_set(r, v);
        } else if let Some(addr) = self.operand_addr(o) {
            let v = bus.memory_read(addr);
            let v = f(self, v);
            bus.memory_write(addr, v);
        }
    }

    /// Runs the CPU for a single step: services an interrupt, or fetches/decodes/executes one instruction.
    /// Returns the number of machine cycles consumed. A halted CPU with nothing to wake it consumes nothing, the caller
    /// is expected to fast-forward time until the next hardware event.
    pub fn step<T: Bus>(&mut self, bus: &mut T) -> Result<u32, Error> {
        if let Some(cycles) = self.process_interrupts(bus) {
            return Ok(cycles);
        }

        // Apply deferred change to IME register.
        if self.ime_defer {
            self.ime = true;
            self.ime_defer = false;
        }

        if self.halted {
            return Ok(0);
        }

        let addr = self.pc;
        let mut opcode = [0u8; 2];
        let mut fetched = 0;
        let instruction = {
            let halt_bug = &mut self.halt_bug;
            let pc = &mut self.pc;
            decode_instruction(|| {
                let v = bus.memory_read(*pc);
                if *halt_bug {
                    *halt_bug = false;
                } else {
                    *pc = pc.wrapping_add(1);
                }
                if fetched < 2 {
                    opcode[fetched] = v;
                }
                fetched += 1;
                v
            })
        };

        if let Invalid(op) = instruction {
            return Err(Error::IllegalOpcode { opcode: op, addr });
        }

        let base = if opcode[0] == 0xCB {
            cb_cycles(opcode[1])
        } else {
            u32::from(OP_CYCLES[opcode[0] as usize])
        };

        let taken = self.execute(bus, instruction);
        Ok(base + if taken { branch_penalty(instruction) } else { 0 })
    }

    /// Services the highest priority pending interrupt, if IME allows it. Returns the cycles consumed if it did.
    fn process_interrupts<T: Bus>(&mut self, bus: &mut T) -> Option<u32> {
        bus.interrupt_controller().next_interrupt()?;

        // A pending interrupt always ends HALT, even if IME means we won't service it.
        self.halted = false;
        if !self.ime {
            return None;
        }
        self.ime = false;

        // Quirk: the vector isn't chosen until the high byte of PC has been pushed. If SP pointed at IE, that push
        // can disable the interrupt we were about to service. Then we jump to whatever's still pending, or to $0000.
        let pc = self.pc;
        self.sp = self.sp.wrapping_sub(1);
        bus.memory_write(self.sp, (pc >> 8) as u8);
        let interrupt = bus.interrupt_controller().next_interrupt();
        self.sp = self.sp.wrapping_sub(1);
        bus.memory_write(self.sp, pc as u8);

        self.pc = match interrupt {
            Some(intr) => {
                bus.interrupt_controller().clear(intr);
                intr.handler_addr()
            }
            None => 0,
        };
        Some(INTERRUPT_CYCLES)
    }

    /// Executes a decoded instruction. Returns true if a conditional branch was taken.
    fn execute<T: Bus>(&mut self, bus: &mut T, instruction: Instruction) -> bool {
        match instruction {
            Alu(op, o) => {
                let v = self.operand_get(bus, o);
                let (a, flags) = alu(op, self.a, v, self.f.c);
                self.a = a;
                self.f = flags;
            }
            AddHl(rr) => {
                let hl = self.register16_get(HL);
                let v = self.register16_get(rr);
                let (r, carry) = hl.overflowing_add(v);
                self.register16_set(HL, r);
                self.f.n = false;
                self.f.h = (hl & 0xFFF) + (v & 0xFFF) > 0xFFF;
                self.f.c = carry;
            }
            AddSp(d) => self.sp = self.sp_offset(d),
            LdHlSp(d) => {
                let v = self.sp_offset(d);
                self.register16_set(HL, v);
            }
            LdSpHl => self.sp = self.register16_get(HL),
            Bit(b, o) => {
                let v = self.operand_get(bus, o);
                self.f.z = v & (1 << b) == 0;
                self.f.n = false;
                self.f.h = true;
            }
            Res(b, o) => self.operand_update(bus, o, |_, v| v & !(1 << b)),
            Set(b, o) => self.operand_update(bus, o, |_, v| v | (1 << b)),
            Call(cc, addr) => {
                if !self.f.check_condition(cc) {
                    return false;
                }
                self.push_and_jump(bus, addr);
                return cc.is_some();
            }
            Ccf => {
                self.f.n = false;
                self.f.h = false;
                self.f.c = !self.f.c;
            }
            Scf => {
                self.f.n = false;
                self.f.h = false;
                self.f.c = true;
            }
            Cpl => {
                self.a = !self.a;
                self.f.n = true;
                self.f.h = true;
            }
            Daa => self.daa(),
            Inc(o) => self.operand_update(bus, o, |cpu, v| {
                cpu.f.z = v == 0xFF;
                cpu.f.n = false;
                cpu.f.h = v & 0xF == 0xF;
                v.wrapping_add(1)
            }),
            Dec(o) => self.operand_update(bus, o, |cpu, v| {
                cpu.f.z = v == 0x01;
                cpu.f.n = true;
                cpu.f.h = v & 0xF == 0;
                v.wrapping_sub(1)
            }),
            Inc16(rr) => {
                let v = self.register16_get(rr).wrapping_add(1);
                self.register16_set(rr, v);
            }
            Dec16(rr) => {
                let v = self.register16_get(rr).wrapping_sub(1);
                self.register16_set(rr, v);
            }
            Di => {
                self.ime = false;
                self.ime_defer = false;
            }
            Ei => self.ime_defer = true,
            Halt => {
                let pending = bus.interrupt_controller().next_interrupt().is_some();
                if self.ime || !pending {
                    self.halted = true;
                } else {
                    self.halt_bug = true;
                }
            }
            Jp(cc, addr) => {
                if !self.f.check_condition(cc) {
                    return false;
                }
                self.pc = addr;
                return cc.is_some();
            }
            JpHl => self.pc = self.register16_get(HL),
            Jr(cc, d) => {
                if !self.f.check_condition(cc) {
                    return false;
                }
                self.pc = self.pc.wrapping_add(d as i16 as u16);
                return cc.is_some();
            }
            Ld(lhs, rhs) => {
                let v = self.operand_get(bus, rhs);
                self.operand_set(bus, lhs, v);
            }
            Ld16(rr, v) => self.register16_set(rr, v),
            StoreSp(addr) => {
                let sp = self.sp;
                bus.memory_write(addr, sp as u8);
                bus.memory_write(addr.wrapping_add(1), (sp >> 8) as u8);
            }
            Nop => {}
            Pop(rr) => {
                let v = self.stack_pop(bus);
                self.register16_set(rr, v);
            }
            Push(rr) => {
                let v = self.register16_get(rr);
                self.stack_push(bus, v);
            }
            Ret(cc) => {
                if !self.f.check_condition(cc) {
                    return false;
                }
                self.pc = self.stack_pop(bus);
                return cc.is_some();
            }
            Reti => {
                // Unlike EI, RETI enables interrupts immediately.
                self.ime = true;
                self.pc = self.stack_pop(bus);
            }
            Rst(vec) => self.push_and_jump(bus, u16::from(vec)),
            Shift(op, o) => self.operand_update(bus, o, |cpu, v| {
                let (r, carry) = shift(op, v, cpu.f.c);
                cpu.f = Flags { z: r == 0, n: false, h: false, c: carry };
                r
            }),
            ShiftA(op) => {
                let (r, carry) = shift(op, self.a, self.f.c);
                self.a = r;
                self.f = Flags { z: false, n: false, h: false, c: carry };
            }
            Stop => {
                // STOP is 2 bytes long, the second is ignored.
                self.pc = self.pc.wrapping_add(1);
                bus.stop();
            }
            Invalid(_) => {}
        }
        false
    }

    /// SP plus a signed offset, as used by ADD SP,e8 and LD HL,SP+e8. Flags come from the unsigned low byte add.
    fn sp_offset(&mut self, d: i8) -> u16 {
        let sp = self.sp;
        let d = d as i16 as u16;
        self.f.z = false;
        self.f.n = false;
        self.f.h = (sp & 0xF) + (d & 0xF) > 0xF;
        self.f.c = (sp & 0xFF) + (d & 0xFF) > 0xFF;
        sp.wrapping_add(d)
    }

    fn daa(&mut self) {
        let mut adjust = 0;
        let mut carry = self.f.c;
        if self.f.h || (!self.f.n && self.a & 0xF > 9) {
            adjust |= 0x06;
        }
        if self.f.c || (!self.f.n && self.a > 0x99) {
            adjust |= 0x60;
            carry = true;
        }

        self.a = if self.f.n {
            self.a.wrapping_sub(adjust)
        } else {
            self.a.wrapping_add(adjust)
        };
        self.f.z = self.a == 0;
        self.f.h = false;
        self.f.c = carry;
    }

    fn stack_push<T: Bus>(&mut self, bus: &mut T, v: u16) {
        self.sp = self.sp.wrapping_sub(2);
        bus.memory_write16(self.sp, v);
    }

    fn stack_pop<T: Bus>(&mut self, bus: &mut T) -> u16 {
        let v = bus.memory_read16(self.sp);
        self.sp = self.sp.wrapping_add(2);
        v
    }

    fn push_and_jump<T: Bus>(&mut self, bus: &mut T, addr: u16) {
        let pc = self.pc;
        self.stack_push(bus, pc);
        self.pc = addr;
    }
}

/// Extra machine cycles a conditional instruction costs when its condition is met.
fn branch_penalty(instruction: Instruction) -> u32 {
    match instruction {
        Jr(Some(_), _) | Jp(Some(_), _) => 1,
        Call(Some(_), _) | Ret(Some(_)) => 3,
        _ => 0,
    }
}

impl Flags {
    /// Converts the CPU flags into an 8bit value. The bottom nibble of F always reads as zero.
    pub fn pack(self) -> u8 {
        (self.z as u8) << 7 | (self.n as u8) << 6 | (self.h as u8) << 5 | (self.c as u8) << 4
    }

    pub fn unpack(&mut self, v: u8) {
        self.z = v & 0b1000_0000 > 0;
        self.n = v & 0b0100_0000 > 0;
        self.h = v & 0b0010_0000 > 0;
        self.c = v & 0b0001_0000 > 0;
    }

    fn check_condition(self, cc: Option<FlagCondition>) -> bool {
        match cc {
            None => true,
            Some(FlagCondition::NZ) => !self.z,
            Some(FlagCondition::Z) => self.z,
            Some(FlagCondition::NC) => !self.c,
            Some(FlagCondition::C) => self.c,
        }
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

impl std::fmt::Display for Register16 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

impl std::fmt::Display for FlagCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{}", r),
            Operand::Imm(n8) => write!(f, "${:02x}", n8),
            Operand::Indirect(rr) => write!(f, "[{}]", rr),
            Operand::IndirectInc(rr) => write!(f, "[{}+]", rr),
            Operand::IndirectDec(rr) => write!(f, "[{}-]", rr),
            Operand::Absolute(n16) => write!(f, "[${:04x}]", n16),
            Operand::HighImm(n8) => write!(f, "[$ff00+${:02x}]", n8),
            Operand::HighC => write!(f, "[$ff00+c]"),
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        fn cond(cc: &Option<FlagCondition>) -> String {
            cc.map(|cc| format!("{}, ", cc)).unwrap_or_default()
        }

        match self {
            Alu(op, o) => match op {
                AluOp::Add | AluOp::Adc | AluOp::Sub | AluOp::Sbc => {
                    write!(f, "{} a, {}", format!("{:?}", op).to_lowercase(), o)
                }
                _ => write!(f, "{} {}", format!("{:?}", op).to_lowercase(), o),
            },
            AddHl(rr) => write!(f, "add hl, {}", rr),
            AddSp(d) => write!(f, "add sp, {}", d),
            Bit(b, o) => write!(f, "bit {}, {}", b, o),
            Call(cc, addr) => write!(f, "call {}${:04x}", cond(cc), addr),
            Ccf => write!(f, "ccf"),
            Cpl => write!(f, "cpl"),
            Daa => write!(f, "daa"),
            Dec(o) => write!(f, "dec {}", o),
            Dec16(rr) => write!(f, "dec {}", rr),
            Di => write!(f, "di"),
            Ei => write!(f, "ei"),
            Halt => write!(f, "halt"),
            Inc(o) => write!(f, "inc {}", o),
            Inc16(rr) => write!(f, "inc {}", rr),
            Jp(cc, addr) => write!(f, "jp {}${:04x}", cond(cc), addr),
            JpHl => write!(f, "jp hl"),
            Jr(cc, d) => write!(f, "jr {}{}", cond(cc), d),
            Ld(lhs, rhs) => write!(f, "ld {}, {}", lhs, rhs),
            Ld16(rr, v) => write!(f, "ld {}, ${:04x}", rr, v),
            LdHlSp(d) => write!(f, "ld hl, sp{:+}", d),
            LdSpHl => write!(f, "ld sp, hl"),
            Nop => write!(f, "nop"),
            Pop(rr) => write!(f, "pop {}", rr),
            Push(rr) => write!(f, "push {}", rr),
            Res(b, o) => write!(f, "res {}, {}", b, o),
            Ret(None) => write!(f, "ret"),
            Ret(Some(cc)) => write!(f, "ret {}", cc),
            Reti => write!(f, "reti"),
            Rst(vec) => write!(f, "rst ${:02x}", vec),
            Scf => write!(f, "scf"),
            Set(b, o) => write!(f, "set {}, {}", b, o),
            Shift(op, o) => write!(f, "{} {}", format!("{:?}", op).to_lowercase(), o),
            ShiftA(op) => write!(f, "{}a", format!("{:?}", op).to_lowercase()),
            Stop => write!(f, "stop"),
            StoreSp(addr) => write!(f, "ld [${:04x}], sp", addr),
            Invalid(op) => write!(f, "illegal ${:02x}", op),
        }
    }
}
