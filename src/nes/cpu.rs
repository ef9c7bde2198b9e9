use std::fmt;

use tracing::{error, trace};

use super::bus::CpuBus;
use super::{
    FLAG_BREAK, FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW,
    FLAG_UNUSED, FLAG_ZERO,
};
use crate::config::DmaStall;

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

const INTERRUPT_CYCLES: u32 = 7;
const OAM_DMA_CYCLES: u32 = 513;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuError {
    IllegalOpcode { opcode: u8, pc: u16 },
}

impl fmt::Display for CpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalOpcode { opcode, pc } => {
                write!(f, "illegal opcode ${opcode:02X} at ${pc:04X}")
            }
        }
    }
}

impl std::error::Error for CpuError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Accumulator,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Immediate,
    Implied,
    Indirect,
    IndirectX,
    IndirectY,
    Relative,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
}

impl AddressingMode {
    /// Instruction length in bytes, opcode included.
    pub fn len(self) -> u16 {
        match self {
            Self::Accumulator | Self::Implied => 1,
            Self::Absolute | Self::AbsoluteX | Self::AbsoluteY | Self::Indirect => 3,
            Self::Immediate
            | Self::IndirectX
            | Self::IndirectY
            | Self::Relative
            | Self::ZeroPage
            | Self::ZeroPageX
            | Self::ZeroPageY => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Adc,
    And,
    Asl,
    Bcc,
    Bcs,
    Beq,
    Bit,
    Bmi,
    Bne,
    Bpl,
    Brk,
    Bvc,
    Bvs,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
}

impl Instruction {
    /// Reads that pay one extra cycle when indexing crosses a page.
    fn has_page_cross_penalty(self) -> bool {
        matches!(
            self,
            Self::Adc
                | Self::And
                | Self::Cmp
                | Self::Eor
                | Self::Lda
                | Self::Ldx
                | Self::Ldy
                | Self::Ora
                | Self::Sbc
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub instruction: Instruction,
    pub mode: AddressingMode,
    pub cycles: u8,
}

const fn op(instruction: Instruction, mode: AddressingMode, cycles: u8) -> Option<Opcode> {
    Some(Opcode {
        instruction,
        mode,
        cycles,
    })
}

/// Official 6502 opcodes. Everything else is treated as illegal.
pub fn decode(opcode: u8) -> Option<Opcode> {
    use AddressingMode::*;
    use Instruction::*;

    match opcode {
        0x69 => op(Adc, Immediate, 2),
        0x65 => op(Adc, ZeroPage, 3),
        0x75 => op(Adc, ZeroPageX, 4),
        0x6D => op(Adc, Absolute, 4),
        0x7D => op(Adc, AbsoluteX, 4),
        0x79 => op(Adc, AbsoluteY, 4),
        0x61 => op(Adc, IndirectX, 6),
        0x71 => op(Adc, IndirectY, 5),

        0x29 => op(And, Immediate, 2),
        0x25 => op(And, ZeroPage, 3),
        0x35 => op(And, ZeroPageX, 4),
        0x2D => op(And, Absolute, 4),
        0x3D => op(And, AbsoluteX, 4),
        0x39 => op(And, AbsoluteY, 4),
        0x21 => op(And, IndirectX, 6),
        0x31 => op(And, IndirectY, 5),

        0x0A => op(Asl, Accumulator, 2),
        0x06 => op(Asl, ZeroPage, 5),
        0x16 => op(Asl, ZeroPageX, 6),
        0x0E => op(Asl, Absolute, 6),
        0x1E => op(Asl, AbsoluteX, 7),

        0x90 => op(Bcc, Relative, 2),
        0xB0 => op(Bcs, Relative, 2),
        0xF0 => op(Beq, Relative, 2),
        0x30 => op(Bmi, Relative, 2),
        0xD0 => op(Bne, Relative, 2),
        0x10 => op(Bpl, Relative, 2),
        0x50 => op(Bvc, Relative, 2),
        0x70 => op(Bvs, Relative, 2),

        0x24 => op(Bit, ZeroPage, 3),
        0x2C => op(Bit, Absolute, 4),

        0x00 => op(Brk, Implied, 7),

        0x18 => op(Clc, Implied, 2),
        0xD8 => op(Cld, Implied, 2),
        0x58 => op(Cli, Implied, 2),
        0xB8 => op(Clv, Implied, 2),

        0xC9 => op(Cmp, Immediate, 2),
        0xC5 => op(Cmp, ZeroPage, 3),
        0xD5 => op(Cmp, ZeroPageX, 4),
        0xCD => op(Cmp, Absolute, 4),
        0xDD => op(Cmp, AbsoluteX, 4),
        0xD9 => op(Cmp, AbsoluteY, 4),
        0xC1 => op(Cmp, IndirectX, 6),
        0xD1 => op(Cmp, IndirectY, 5),

        0xE0 => op(Cpx, Immediate, 2),
        0xE4 => op(Cpx, ZeroPage, 3),
        0xEC => op(Cpx, Absolute, 4),

        0xC0 => op(Cpy, Immediate, 2),
        0xC4 => op(Cpy, ZeroPage, 3),
        0xCC => op(Cpy, Absolute, 4),

        0xC6 => op(Dec, ZeroPage, 5),
        0xD6 => op(Dec, ZeroPageX, 6),
        0xCE => op(Dec, Absolute, 6),
        0xDE => op(Dec, AbsoluteX, 7),

        0xCA => op(Dex, Implied, 2),
        0x88 => op(Dey, Implied, 2),

        0x49 => op(Eor, Immediate, 2),
        0x45 => op(Eor, ZeroPage, 3),
        0x55 => op(Eor, ZeroPageX, 4),
        0x4D => op(Eor, Absolute, 4),
        0x5D => op(Eor, AbsoluteX, 4),
        0x59 => op(Eor, AbsoluteY, 4),
        0x41 => op(Eor, IndirectX, 6),
        0x51 => op(Eor, IndirectY, 5),

        0xE6 => op(Inc, ZeroPage, 5),
        0xF6 => op(Inc, ZeroPageX, 6),
        0xEE => op(Inc, Absolute, 6),
        0xFE => op(Inc, AbsoluteX, 7),

        0xE8 => op(Inx, Implied, 2),
        0xC8 => op(Iny, Implied, 2),

        0x4C => op(Jmp, Absolute, 3),
        0x6C => op(Jmp, Indirect, 5),
        0x20 => op(Jsr, Absolute, 6),

        0xA9 => op(Lda, Immediate, 2),
        0xA5 => op(Lda, ZeroPage, 3),
        0xB5 => op(Lda, ZeroPageX, 4),
        0xAD => op(Lda, Absolute, 4),
        0xBD => op(Lda, AbsoluteX, 4),
        0xB9 => op(Lda, AbsoluteY, 4),
        0xA1 => op(Lda, IndirectX, 6),
        0xB1 => op(Lda, IndirectY, 5),

        0xA2 => op(Ldx, Immediate, 2),
        0xA6 => op(Ldx, ZeroPage, 3),
        0xB6 => op(Ldx, ZeroPageY, 4),
        0xAE => op(Ldx, Absolute, 4),
        0xBE => op(Ldx, AbsoluteY, 4),

        0xA0 => op(Ldy, Immediate, 2),
        0xA4 => op(Ldy, ZeroPage, 3),
        0xB4 => op(Ldy, ZeroPageX, 4),
        0xAC => op(Ldy, Absolute, 4),
        0xBC => op(Ldy, AbsoluteX, 4),

        0x4A => op(Lsr, Accumulator, 2),
        0x46 => op(Lsr, ZeroPage, 5),
        0x56 => op(Lsr, ZeroPageX, 6),
        0x4E => op(Lsr, Absolute, 6),
        0x5E => op(Lsr, AbsoluteX, 7),

        0xEA => op(Nop, Implied, 2),

        0x09 => op(Ora, Immediate, 2),
        0x05 => op(Ora, ZeroPage, 3),
        0x15 => op(Ora, ZeroPageX, 4),
        0x0D => op(Ora, Absolute, 4),
        0x1D => op(Ora, AbsoluteX, 4),
        0x19 => op(Ora, AbsoluteY, 4),
        0x01 => op(Ora, IndirectX, 6),
        0x11 => op(Ora, IndirectY, 5),

        0x48 => op(Pha, Implied, 3),
        0x08 => op(Php, Implied, 3),
        0x68 => op(Pla, Implied, 4),
        0x28 => op(Plp, Implied, 4),

        0x2A => op(Rol, Accumulator, 2),
        0x26 => op(Rol, ZeroPage, 5),
        0x36 => op(Rol, ZeroPageX, 6),
        0x2E => op(Rol, Absolute, 6),
        0x3E => op(Rol, AbsoluteX, 7),

        0x6A => op(Ror, Accumulator, 2),
        0x66 => op(Ror, ZeroPage, 5),
        0x76 => op(Ror, ZeroPageX, 6),
        0x6E => op(Ror, Absolute, 6),
        0x7E => op(Ror, AbsoluteX, 7),

        0x40 => op(Rti, Implied, 6),
        0x60 => op(Rts, Implied, 6),

        0xE9 => op(Sbc, Immediate, 2),
        0xE5 => op(Sbc, ZeroPage, 3),
        0xF5 => op(Sbc, ZeroPageX, 4),
        0xED => op(Sbc, Absolute, 4),
        0xFD => op(Sbc, AbsoluteX, 4),
        0xF9 => op(Sbc, AbsoluteY, 4),
        0xE1 => op(Sbc, IndirectX, 6),
        0xF1 => op(Sbc, IndirectY, 5),

        0x38 => op(Sec, Implied, 2),
        0xF8 => op(Sed, Implied, 2),
        0x78 => op(Sei, Implied, 2),

        0x85 => op(Sta, ZeroPage, 3),
        0x95 => op(Sta, ZeroPageX, 4),
        0x8D => op(Sta, Absolute, 4),
        0x9D => op(Sta, AbsoluteX, 5),
        0x99 => op(Sta, AbsoluteY, 5),
        0x81 => op(Sta, IndirectX, 6),
        0x91 => op(Sta, IndirectY, 6),

        0x86 => op(Stx, ZeroPage, 3),
        0x96 => op(Stx, ZeroPageY, 4),
        0x8E => op(Stx, Absolute, 4),

        0x84 => op(Sty, ZeroPage, 3),
        0x94 => op(Sty, ZeroPageX, 4),
        0x8C => op(Sty, Absolute, 4),

        0xAA => op(Tax, Implied, 2),
        0xA8 => op(Tay, Implied, 2),
        0xBA => op(Tsx, Implied, 2),
        0x8A => op(Txa, Implied, 2),
        0x9A => op(Txs, Implied, 2),
        0x98 => op(Tya, Implied, 2),

        _ => None,
    }
}

/// 2A03 core without decimal arithmetic. Each `tick` is one CPU cycle: the
/// whole instruction runs on the cycle it is fetched and the remaining
/// cycles are counted down before the next fetch.
pub struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub pc: u16,
    pub sp: u8,
    pub p: u8,

    cycles: u32,
    total_cycles: u64,
    instructions: u64,

    pub(crate) nmi_pending: bool,
    irq_line: bool,
    dma_pending: bool,
    dma_stall: DmaStall,
    jammed: Option<CpuError>,

    addr: u16,
    mode: AddressingMode,
    page_crossed: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new(DmaStall::default())
    }
}

impl Cpu {
    pub fn new(dma_stall: DmaStall) -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            pc: 0,
            sp: 0,
            p: FLAG_UNUSED,
            cycles: 0,
            total_cycles: 0,
            instructions: 0,
            nmi_pending: false,
            irq_line: false,
            dma_pending: false,
            dma_stall,
            jammed: None,
            addr: 0,
            mode: AddressingMode::Implied,
            page_crossed: false,
        }
    }

    pub fn power_up<B: CpuBus>(&mut self, bus: &mut B) {
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.sp = 0;
        self.p = FLAG_UNUSED;
        self.total_cycles = 0;
        self.instructions = 0;
        self.reset(bus);
    }

    /// Registers A/X/Y survive; S drops by three as if an interrupt had
    /// pushed without writing.
    pub fn reset<B: CpuBus>(&mut self, bus: &mut B) {
        self.sp = self.sp.wrapping_sub(3);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = bus.read_u16(RESET_VECTOR);
        self.cycles = INTERRUPT_CYCLES;
        self.nmi_pending = false;
        self.irq_line = false;
        self.dma_pending = false;
        self.jammed = None;
        self.page_crossed = false;
    }

    pub fn request_dma(&mut self) {
        self.dma_pending = true;
    }

    pub fn set_irq_line(&mut self, asserted: bool) {
        self.irq_line = asserted;
    }

    pub fn cycles_remaining(&self) -> u32 {
        self.cycles
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instructions
    }

    pub fn jammed(&self) -> Option<CpuError> {
        self.jammed
    }

    pub fn tick<B: CpuBus>(&mut self, bus: &mut B) -> Result<(), CpuError> {
        if let Some(err) = self.jammed {
            return Err(err);
        }

        if self.cycles == 0 {
            if self.nmi_pending {
                self.nmi_pending = false;
                self.service_interrupt(bus, NMI_VECTOR);
                trace!(pc = self.pc, "NMI serviced");
            } else if self.dma_pending {
                self.dma_pending = false;
                let odd = (self.total_cycles & 1) == 1;
                self.cycles = match self.dma_stall {
                    DmaStall::CycleParity if odd => OAM_DMA_CYCLES + 1,
                    _ => OAM_DMA_CYCLES,
                };
            } else if self.irq_line && !self.get_flag(FLAG_INTERRUPT) {
                self.service_interrupt(bus, IRQ_VECTOR);
                trace!(pc = self.pc, "IRQ serviced");
            } else {
                self.execute(bus)?;
            }
        }

        self.cycles -= 1;
        self.total_cycles += 1;
        Ok(())
    }

    fn service_interrupt<B: CpuBus>(&mut self, bus: &mut B, vector: u16) {
        self.push_u16(bus, self.pc);
        self.push(bus, (self.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = bus.read_u16(vector);
        self.cycles = INTERRUPT_CYCLES;
    }

    fn execute<B: CpuBus>(&mut self, bus: &mut B) -> Result<(), CpuError> {
        let opcode = bus.read(self.pc);
        let Some(decoded) = decode(opcode) else {
            let err = CpuError::IllegalOpcode {
                opcode,
                pc: self.pc,
            };
            error!("CPU jammed: {err}");
            self.jammed = Some(err);
            return Err(err);
        };

        self.mode = decoded.mode;
        self.page_crossed = false;
        self.addr = self.effective_address(bus, decoded.mode);
        self.cycles = decoded.cycles as u32;
        if self.page_crossed && decoded.instruction.has_page_cross_penalty() {
            self.cycles += 1;
        }

        self.run(bus, decoded.instruction);
        self.pc = self.pc.wrapping_add(decoded.mode.len());
        self.instructions += 1;
        Ok(())
    }

    fn effective_address<B: CpuBus>(&mut self, bus: &mut B, mode: AddressingMode) -> u16 {
        let operand = self.pc.wrapping_add(1);
        match mode {
            AddressingMode::Accumulator | AddressingMode::Implied => 0,
            AddressingMode::Immediate => operand,
            AddressingMode::ZeroPage => bus.read(operand) as u16,
            AddressingMode::ZeroPageX => bus.read(operand).wrapping_add(self.x) as u16,
            AddressingMode::ZeroPageY => bus.read(operand).wrapping_add(self.y) as u16,
            AddressingMode::Absolute => bus.read_u16(operand),
            AddressingMode::AbsoluteX => {
                let base = bus.read_u16(operand);
                self.indexed(base, self.x)
            }
            AddressingMode::AbsoluteY => {
                let base = bus.read_u16(operand);
                self.indexed(base, self.y)
            }
            // JMP ($xxFF) fetches the high byte from $xx00.
            AddressingMode::Indirect => {
                let ptr = bus.read_u16(operand);
                bus.read_u16_wrapped(ptr)
            }
            AddressingMode::IndirectX => {
                let zp = bus.read(operand).wrapping_add(self.x);
                bus.read_u16_wrapped(zp as u16)
            }
            AddressingMode::IndirectY => {
                let zp = bus.read(operand);
                let base = bus.read_u16_wrapped(zp as u16);
                self.indexed(base, self.y)
            }
            AddressingMode::Relative => {
                let offset = bus.read(operand) as i8;
                self.pc
                    .wrapping_add(2)
                    .wrapping_add(offset as i16 as u16)
            }
        }
    }

    fn indexed(&mut self, base: u16, index: u8) -> u16 {
        let addr = base.wrapping_add(index as u16);
        self.page_crossed = (base & 0xFF00) != (addr & 0xFF00);
        addr
    }

    fn read_operand<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        match self.mode {
            AddressingMode::Accumulator => self.a,
            _ => bus.read(self.addr),
        }
    }

    fn write_result<B: CpuBus>(&mut self, bus: &mut B, value: u8) {
        match self.mode {
            AddressingMode::Accumulator => self.a = value,
            _ => bus.write(self.addr, value),
        }
    }

    fn run<B: CpuBus>(&mut self, bus: &mut B, instruction: Instruction) {
        use Instruction::*;

        match instruction {
            Adc => {
                let value = self.read_operand(bus);
                self.adc(value);
            }
            Sbc => {
                let value = self.read_operand(bus);
                self.adc(value ^ 0xFF);
            }
            And => {
                self.a &= self.read_operand(bus);
                self.update_zn(self.a);
            }
            Ora => {
                self.a |= self.read_operand(bus);
                self.update_zn(self.a);
            }
            Eor => {
                self.a ^= self.read_operand(bus);
                self.update_zn(self.a);
            }
            Bit => {
                let value = self.read_operand(bus);
                self.set_flag(FLAG_ZERO, (self.a & value) == 0);
                self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
                self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
            }
            Cmp => {
                let value = self.read_operand(bus);
                self.compare(self.a, value);
            }
            Cpx => {
                let value = self.read_operand(bus);
                self.compare(self.x, value);
            }
            Cpy => {
                let value = self.read_operand(bus);
                self.compare(self.y, value);
            }

            Asl | Lsr | Rol | Ror | Inc | Dec => {
                let value = self.read_operand(bus);
                let result = self.shift_or_step(instruction, value);
                self.write_result(bus, result);
            }

            Lda => {
                self.a = self.read_operand(bus);
                self.update_zn(self.a);
            }
            Ldx => {
                self.x = self.read_operand(bus);
                self.update_zn(self.x);
            }
            Ldy => {
                self.y = self.read_operand(bus);
                self.update_zn(self.y);
            }
            Sta => bus.write(self.addr, self.a),
            Stx => bus.write(self.addr, self.x),
            Sty => bus.write(self.addr, self.y),

            Tax => {
                self.x = self.a;
                self.update_zn(self.x);
            }
            Tay => {
                self.y = self.a;
                self.update_zn(self.y);
            }
            Tsx => {
                self.x = self.sp;
                self.update_zn(self.x);
            }
            Txa => {
                self.a = self.x;
                self.update_zn(self.a);
            }
            Txs => self.sp = self.x,
            Tya => {
                self.a = self.y;
                self.update_zn(self.a);
            }
            Inx => {
                self.x = self.x.wrapping_add(1);
                self.update_zn(self.x);
            }
            Iny => {
                self.y = self.y.wrapping_add(1);
                self.update_zn(self.y);
            }
            Dex => {
                self.x = self.x.wrapping_sub(1);
                self.update_zn(self.x);
            }
            Dey => {
                self.y = self.y.wrapping_sub(1);
                self.update_zn(self.y);
            }

            Clc => self.set_flag(FLAG_CARRY, false),
            Sec => self.set_flag(FLAG_CARRY, true),
            Cli => self.set_flag(FLAG_INTERRUPT, false),
            Sei => self.set_flag(FLAG_INTERRUPT, true),
            Cld => self.set_flag(FLAG_DECIMAL, false),
            Sed => self.set_flag(FLAG_DECIMAL, true),
            Clv => self.set_flag(FLAG_OVERFLOW, false),

            Pha => self.push(bus, self.a),
            Php => self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED),
            Pla => {
                self.a = self.pop(bus);
                self.update_zn(self.a);
            }
            Plp => {
                self.p = (self.pop(bus) & !FLAG_BREAK) | FLAG_UNUSED;
            }

            Bcc => self.branch(!self.get_flag(FLAG_CARRY)),
            Bcs => self.branch(self.get_flag(FLAG_CARRY)),
            Bne => self.branch(!self.get_flag(FLAG_ZERO)),
            Beq => self.branch(self.get_flag(FLAG_ZERO)),
            Bpl => self.branch(!self.get_flag(FLAG_NEGATIVE)),
            Bmi => self.branch(self.get_flag(FLAG_NEGATIVE)),
            Bvc => self.branch(!self.get_flag(FLAG_OVERFLOW)),
            Bvs => self.branch(self.get_flag(FLAG_OVERFLOW)),

            // Control flow lands on target - length; the epilogue adds it back.
            Jmp => self.pc = self.addr.wrapping_sub(3),
            Jsr => {
                self.push_u16(bus, self.pc.wrapping_add(2));
                self.pc = self.addr.wrapping_sub(3);
            }
            Rts => self.pc = self.pop_u16(bus),
            Brk => {
                self.push_u16(bus, self.pc.wrapping_add(2));
                self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED);
                self.set_flag(FLAG_INTERRUPT, true);
                self.pc = bus.read_u16(IRQ_VECTOR).wrapping_sub(1);
            }
            Rti => {
                self.p = (self.pop(bus) & !FLAG_BREAK) | FLAG_UNUSED;
                self.pc = self.pop_u16(bus).wrapping_sub(1);
            }

            Nop => {}
        }
    }

    fn branch(&mut self, condition: bool) {
        if !condition {
            return;
        }
        self.cycles += 1;
        let next = self.pc.wrapping_add(2);
        if (next & 0xFF00) != (self.addr & 0xFF00) {
            self.cycles += 1;
        }
        self.pc = self.addr.wrapping_sub(2);
    }

    fn shift_or_step(&mut self, instruction: Instruction, value: u8) -> u8 {
        let result = match instruction {
            Instruction::Asl => {
                self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
                value << 1
            }
            Instruction::Lsr => {
                self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
                value >> 1
            }
            Instruction::Rol => {
                let carry_in = u8::from(self.get_flag(FLAG_CARRY));
                self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
                (value << 1) | carry_in
            }
            Instruction::Ror => {
                let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
                self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
                (value >> 1) | carry_in
            }
            Instruction::Inc => value.wrapping_add(1),
            Instruction::Dec => value.wrapping_sub(1),
            _ => value,
        };
        self.update_zn(result);
        result
    }

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(result);
    }

    fn adc(&mut self, value: u8) {
        let carry_in = u16::from(self.get_flag(FLAG_CARRY));
        let result = self.a as u16 + value as u16 + carry_in;
        let out = result as u8;

        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.set_flag(FLAG_OVERFLOW, ((self.a ^ out) & (value ^ out) & 0x80) != 0);

        self.a = out;
        self.update_zn(self.a);
    }

    fn push<B: CpuBus>(&mut self, bus: &mut B, value: u8) {
        bus.write(0x0100 | self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pop<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(0x0100 | self.sp as u16)
    }

    fn push_u16<B: CpuBus>(&mut self, bus: &mut B, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    fn pop_u16<B: CpuBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.pop(bus) as u16;
        let hi = self.pop(bus) as u16;
        (hi << 8) | lo
    }

    pub(crate) fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p |= FLAG_UNUSED;
    }

    pub fn get_flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }
}
