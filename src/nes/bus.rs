use tracing::debug;

use super::apu::Apu;
use super::controller::Controller;
use super::mapper::Mapper;
use super::ppu::Ppu;

/// What the CPU sees of the machine: one byte in, one byte out.
pub trait CpuBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);

    fn read_u16(&mut self, addr: u16) -> u16 {
        let lo = self.read(addr) as u16;
        let hi = self.read(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    /// Little-endian read whose high byte never leaves the page of `addr`.
    fn read_u16_wrapped(&mut self, addr: u16) -> u16 {
        let lo = self.read(addr) as u16;
        let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
        let hi = self.read(hi_addr) as u16;
        (hi << 8) | lo
    }
}

/// CPU address space: RAM, PPU and APU/IO registers, controllers and the
/// cartridge behind its mapper.
pub struct SystemBus {
    ram: [u8; 2048],
    pub(crate) ppu: Ppu,
    pub(crate) apu: Apu,
    pub(crate) mapper: Box<dyn Mapper>,
    controllers: [Controller; 2],
    open_bus: u8,
    oam_dma_pending: bool,
}

impl SystemBus {
    pub fn new(ppu: Ppu, apu: Apu, mapper: Box<dyn Mapper>) -> Self {
        Self {
            ram: [0; 2048],
            ppu,
            apu,
            mapper,
            controllers: [Controller::default(); 2],
            open_bus: 0,
            oam_dma_pending: false,
        }
    }

    pub fn power_up(&mut self) {
        self.ram = [0; 2048];
        self.open_bus = 0;
        self.oam_dma_pending = false;
        self.ppu.power_up();
        self.apu.reset();
        self.mapper.reset();
    }

    pub fn reset(&mut self) {
        self.oam_dma_pending = false;
        self.ppu.reset();
        self.apu.reset();
        self.mapper.reset();
    }

    pub fn tick_ppu(&mut self) {
        self.ppu.tick(self.mapper.as_mut());
    }

    /// True once after each `$4014` write; the CPU owes the DMA stall.
    pub fn take_oam_dma(&mut self) -> bool {
        std::mem::take(&mut self.oam_dma_pending)
    }

    pub fn controller_mut(&mut self, port: usize) -> &mut Controller {
        &mut self.controllers[port & 1]
    }

    /// Side-effect free read for debuggers. Register space reports open bus.
    pub fn peek(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x4020..=0xFFFF => self.mapper.read_prg(addr).unwrap_or(self.open_bus),
            _ => self.open_bus,
        }
    }

    fn oam_dma(&mut self, page: u8) {
        let base = (page as u16) << 8;
        let mut bytes = [0u8; 256];
        for (idx, slot) in bytes.iter_mut().enumerate() {
            *slot = self.read(base.wrapping_add(idx as u16));
        }
        self.ppu.write_oam_dma(&bytes);
        self.oam_dma_pending = true;
        debug!("OAM DMA from page ${page:02X}");
    }
}

impl CpuBus for SystemBus {
    fn read(&mut self, addr: u16) -> u8 {
        let value = match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x2000..=0x3FFF => {
                let reg = 0x2000 + (addr & 0x0007);
                self.ppu.cpu_read_register(reg, self.mapper.as_mut())
            }
            0x4015 => self.apu.read_status() | (self.open_bus & 0x20),
            0x4016 => self.controllers[0].read(),
            0x4017 => self.controllers[1].read(),
            0x4000..=0x401F => self.open_bus,
            _ => self.mapper.read_prg(addr).unwrap_or(self.open_bus),
        };
        self.open_bus = value;
        value
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.open_bus = value;
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF] = value,
            0x2000..=0x3FFF => {
                let reg = 0x2000 + (addr & 0x0007);
                self.ppu.cpu_write_register(reg, value, self.mapper.as_mut());
            }
            0x4014 => self.oam_dma(value),
            0x4016 => {
                for pad in &mut self.controllers {
                    pad.write_strobe(value);
                }
            }
            0x4000..=0x4013 | 0x4015 | 0x4017 => self.apu.write_register(addr, value),
            0x4018..=0x401F => {}
            _ => self.mapper.write_prg(addr, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Nes2Policy;
    use crate::nes::TvSystem;
    use crate::nes::cartridge::{Cartridge, tests::build_ines};
    use crate::nes::controller::{BUTTON_A, BUTTON_B};
    use crate::nes::mapper::create_mapper;

    fn nrom_bus() -> SystemBus {
        let rom = build_ines(1, 1, 0x00, 0x00, 0xC000);
        let cart = Cartridge::from_bytes(&rom, Nes2Policy::BestEffort).unwrap();
        let mapper = create_mapper(cart).unwrap();
        SystemBus::new(Ppu::new(TvSystem::Ntsc), Apu::new(TvSystem::Ntsc), mapper)
    }

    #[test]
    fn internal_ram_is_mirrored_every_2k() {
        let mut bus = nrom_bus();
        bus.write(0x0012, 0xAB);
        assert_eq!(bus.read(0x0812), 0xAB);
        assert_eq!(bus.read(0x1012), 0xAB);
        bus.write(0x1FFF, 0x5A);
        assert_eq!(bus.read(0x07FF), 0x5A);
    }

    #[test]
    fn prg_ram_round_trips_and_rom_ignores_writes() {
        let mut bus = nrom_bus();
        bus.write(0x6000, 0x77);
        assert_eq!(bus.read(0x6000), 0x77);
        let before = bus.read(0x8000);
        bus.write(0x8000, before.wrapping_add(1));
        assert_eq!(bus.read(0x8000), before);
    }

    #[test]
    fn ppu_registers_mirror_every_8_bytes() {
        let mut bus = nrom_bus();
        bus.write(0x2006, 0x3F);
        bus.write(0x3FFE, 0x01);
        bus.write(0x2007, 0x2A);
        assert_eq!(bus.ppu.debug_peek_palette(1), 0x2A);
    }

    #[test]
    fn unmapped_reads_return_last_bus_value() {
        let mut bus = nrom_bus();
        bus.write(0x0000, 0x99);
        let value = bus.read(0x0000);
        assert_eq!(bus.read(0x5000), value);
        assert_eq!(bus.read(0x4018), value);
    }

    #[test]
    fn controllers_share_strobe() {
        let mut bus = nrom_bus();
        bus.controller_mut(0).set_state(BUTTON_A);
        bus.controller_mut(1).set_state(BUTTON_B);
        bus.write(0x4016, 1);
        bus.write(0x4016, 0);
        assert_eq!(bus.read(0x4016), 0x41);
        assert_eq!(bus.read(0x4017), 0x40);
        assert_eq!(bus.read(0x4017), 0x41);
    }

    #[test]
    fn oam_dma_copies_page_and_flags_stall() {
        let mut bus = nrom_bus();
        for i in 0..256u16 {
            bus.write(0x0200 + i, i as u8);
        }
        bus.write(0x4014, 0x02);
        assert!(bus.take_oam_dma());
        assert!(!bus.take_oam_dma());
        assert_eq!(bus.ppu.debug_peek_oam(0), 0);
        assert_eq!(bus.ppu.debug_peek_oam(255), 255);
    }
}
