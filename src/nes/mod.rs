pub mod apu;
pub mod bus;
pub mod cartridge;
pub mod controller;
pub mod cpu;
pub mod mapper;
pub mod palette;
pub mod ppu;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::config::EmulatorConfig;
use apu::Apu;
use bus::SystemBus;
use cartridge::Cartridge;
use cpu::{Cpu, CpuError};
use mapper::create_mapper;
use palette::{NES_PALETTE, Palette, load_palette};
use ppu::Ppu;

pub use controller::{
    BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP,
};

pub(crate) const FLAG_CARRY: u8 = 0x01;
pub(crate) const FLAG_ZERO: u8 = 0x02;
pub(crate) const FLAG_INTERRUPT: u8 = 0x04;
pub(crate) const FLAG_DECIMAL: u8 = 0x08;
pub(crate) const FLAG_BREAK: u8 = 0x10;
pub(crate) const FLAG_UNUSED: u8 = 0x20;
pub(crate) const FLAG_OVERFLOW: u8 = 0x40;
pub(crate) const FLAG_NEGATIVE: u8 = 0x80;

/// Upper bound on master ticks spent looking for one frame or instruction.
const MASTER_TICK_GUARD: u64 = 341 * 312 * 5 * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TvSystem {
    #[default]
    Ntsc,
    Pal,
}

impl TvSystem {
    pub fn master_clock_hz(self) -> u64 {
        match self {
            Self::Ntsc => 21_477_272,
            Self::Pal => 26_601_712,
        }
    }

    /// Master ticks per PPU dot.
    pub fn ppu_divider(self) -> u64 {
        match self {
            Self::Ntsc => 4,
            Self::Pal => 5,
        }
    }

    /// Master ticks per CPU cycle.
    pub fn cpu_divider(self) -> u64 {
        match self {
            Self::Ntsc => 12,
            Self::Pal => 16,
        }
    }

    pub fn cpu_clock_hz(self) -> f64 {
        self.master_clock_hz() as f64 / self.cpu_divider() as f64
    }

    pub fn scanlines(self) -> u16 {
        match self {
            Self::Ntsc => 262,
            Self::Pal => 312,
        }
    }

    pub fn frame_rate(self) -> f64 {
        let dots = ppu::DOTS_PER_LINE as f64 * self.scanlines() as f64;
        self.master_clock_hz() as f64 / (self.ppu_divider() as f64 * dots)
    }
}

/// A console with a cartridge inserted. There is no "empty" state: a value
/// of this type always has a mapper to run.
pub struct Nes {
    cpu: Cpu,
    bus: SystemBus,
    tv_system: TvSystem,
    master_clock: u64,
    mapper_id: u16,
    palette: Palette,
    config: EmulatorConfig,
}

impl Nes {
    pub fn new(cart: Cartridge, config: &EmulatorConfig) -> Result<Self> {
        let palette = match &config.palette {
            Some(path) => load_palette(path)?,
            None => NES_PALETTE,
        };
        Self::build(cart, config, palette)
    }

    pub fn from_path(path: &Path, config: &EmulatorConfig) -> Result<Self> {
        let cart = Cartridge::from_file(path, config.nes2_headers)?;
        Self::new(cart, config)
    }

    fn build(cart: Cartridge, config: &EmulatorConfig, palette: Palette) -> Result<Self> {
        let tv_system = config.tv_system.unwrap_or(cart.tv_system);
        let mapper_id = cart.mapper_id;
        let mapper = create_mapper(cart)?;

        let mut ppu = Ppu::new(tv_system);
        ppu.set_palette(palette);
        let mut apu = Apu::new(tv_system);
        apu.set_sample_rate(config.audio_sample_rate);

        let mut nes = Self {
            cpu: Cpu::new(config.oam_dma_stall),
            bus: SystemBus::new(ppu, apu, mapper),
            tv_system,
            master_clock: 0,
            mapper_id,
            palette,
            config: config.clone(),
        };
        nes.power_up();
        info!(
            mapper = %nes.mapper_name(),
            tv_system = ?tv_system,
            "cartridge loaded, entry point ${:04X}",
            nes.cpu.pc
        );
        Ok(nes)
    }

    /// Swaps in a new cartridge. On failure the running game is untouched.
    pub fn load_game(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path, self.config.nes2_headers)?;
        let sample_rate = self.bus.apu.sample_rate();
        let mut next = Self::build(cart, &self.config, self.palette)?;
        next.bus.apu.set_sample_rate(sample_rate);
        *self = next;
        Ok(())
    }

    pub fn power_up(&mut self) {
        self.master_clock = 0;
        self.bus.power_up();
        self.cpu.power_up(&mut self.bus);
        info!("power up, PC=${:04X}", self.cpu.pc);
    }

    pub fn reset(&mut self) {
        self.bus.reset();
        self.cpu.reset(&mut self.bus);
        info!("reset, PC=${:04X}", self.cpu.pc);
    }

    /// Advances one master clock tick. PPU first, then CPU, then APU.
    pub fn tick(&mut self) -> Result<(), CpuError> {
        if self.master_clock % self.tv_system.ppu_divider() == 0 {
            self.bus.tick_ppu();
            if self.bus.ppu.take_nmi() {
                self.cpu.nmi_pending = true;
            }
        }

        let result = if self.master_clock % self.tv_system.cpu_divider() == 0 {
            self.tick_cpu()
        } else {
            Ok(())
        };
        self.master_clock += 1;
        result
    }

    fn tick_cpu(&mut self) -> Result<(), CpuError> {
        self.cpu.tick(&mut self.bus)?;
        if self.bus.take_oam_dma() {
            self.cpu.request_dma();
        }
        self.bus.apu.tick();
        self.cpu.set_irq_line(self.bus.apu.irq_pending());
        Ok(())
    }

    /// Ticks until the PPU completes a frame.
    pub fn run_frame(&mut self) -> Result<(), CpuError> {
        self.bus.ppu.clear_frame_ready();
        let mut guard = 0u64;
        while !self.bus.ppu.frame_ready() && guard < MASTER_TICK_GUARD {
            self.tick()?;
            guard += 1;
        }
        Ok(())
    }

    /// Ticks until the current instruction (or interrupt/DMA) has finished
    /// and at least one new instruction has executed.
    pub fn step_instruction(&mut self) -> Result<(), CpuError> {
        let start = self.cpu.instructions_executed();
        let mut guard = 0u64;
        while guard < MASTER_TICK_GUARD {
            self.tick()?;
            guard += 1;
            if self.cpu.instructions_executed() > start && self.cpu.cycles_remaining() == 0 {
                break;
            }
        }
        Ok(())
    }

    pub fn frame_ready(&self) -> bool {
        self.bus.ppu.frame_ready()
    }

    pub fn clear_frame_ready(&mut self) {
        self.bus.ppu.clear_frame_ready();
    }

    /// RGBA8, 256x240.
    pub fn frame_buffer(&self) -> &[u8] {
        self.bus.ppu.frame_buffer()
    }

    /// Bits 0-7: A, B, Select, Start, Up, Down, Left, Right.
    pub fn set_controller_state(&mut self, state: u8) {
        self.bus.controller_mut(0).set_state(state);
    }

    pub fn set_controller2_state(&mut self, state: u8) {
        self.bus.controller_mut(1).set_state(state);
    }

    pub fn load_palette(&mut self, path: &Path) -> Result<()> {
        let palette = load_palette(path)?;
        self.palette = palette;
        self.bus.ppu.set_palette(palette);
        Ok(())
    }

    pub fn set_audio_sample_rate(&mut self, sample_rate: u32) {
        self.bus.apu.set_sample_rate(sample_rate);
    }

    pub fn audio_sample_rate(&self) -> u32 {
        self.bus.apu.sample_rate()
    }

    pub fn take_audio_samples(&mut self) -> Vec<f32> {
        self.bus.apu.take_samples()
    }

    pub fn tv_system(&self) -> TvSystem {
        self.tv_system
    }

    pub fn master_clock(&self) -> u64 {
        self.master_clock
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn ppu(&self) -> &Ppu {
        &self.bus.ppu
    }

    pub fn mapper_id(&self) -> u16 {
        self.mapper_id
    }

    pub fn mapper_name(&self) -> String {
        format!("{} (mapper {})", self.bus.mapper.name(), self.mapper_id)
    }

    pub fn mapper_state(&self) -> String {
        self.bus.mapper.debug_state()
    }

    /// CPU-space read without side effects; register space reads as open bus.
    pub fn debug_peek(&self, addr: u16) -> u8 {
        self.bus.peek(addr)
    }
}
