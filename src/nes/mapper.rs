use anyhow::Result;
use tracing::debug;

use super::cartridge::{Cartridge, CartridgeError, PRG_RAM_UNIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
    FourScreen,
}

/// Cartridge address decoding. CPU space `$4020-$FFFF` and PPU space
/// `$0000-$1FFF` are routed here.
pub trait Mapper {
    fn name(&self) -> &'static str;
    /// `None` means nothing drives the bus at `addr`.
    fn read_prg(&self, addr: u16) -> Option<u8>;
    fn write_prg(&mut self, addr: u16, value: u8);
    fn read_chr(&self, addr: u16) -> u8;
    fn write_chr(&mut self, addr: u16, value: u8);
    fn mirroring(&self) -> Mirroring;
    fn reset(&mut self) {}
    fn debug_state(&self) -> String {
        String::new()
    }
}

pub fn create_mapper(cart: Cartridge) -> Result<Box<dyn Mapper>> {
    let mapper: Box<dyn Mapper> = match cart.mapper_id {
        0 => Box::new(Nrom::new(cart)),
        1 => Box::new(Mmc1::new(cart)),
        2 => Box::new(Uxrom::new(cart)),
        7 => Box::new(Axrom::new(cart)),
        id => return Err(CartridgeError::UnsupportedMapper(id).into()),
    };
    Ok(mapper)
}

/// ROM and RAM shared by every board.
struct Board {
    prg_rom: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    prg_ram: Vec<u8>,
    mirroring: Mirroring,
}

impl Board {
    fn new(cart: Cartridge) -> Self {
        Self {
            prg_ram: vec![0; cart.prg_ram_size.max(PRG_RAM_UNIT)],
            prg_rom: cart.prg_rom,
            chr: cart.chr_data,
            chr_is_ram: cart.chr_is_ram,
            mirroring: cart.mirroring,
        }
    }

    fn prg_bank_count(&self, bank_size: usize) -> usize {
        (self.prg_rom.len() / bank_size).max(1)
    }

    fn read_prg_bank(&self, bank: usize, bank_size: usize, offset: usize) -> u8 {
        let bank = bank % self.prg_bank_count(bank_size);
        self.prg_rom[(bank * bank_size + offset) % self.prg_rom.len()]
    }

    fn ram_index(&self, bank: usize, addr: u16) -> usize {
        let banks = (self.prg_ram.len() / PRG_RAM_UNIT).max(1);
        ((bank % banks) * PRG_RAM_UNIT + (addr as usize - 0x6000)) % self.prg_ram.len()
    }

    fn chr_index(&self, addr: usize) -> usize {
        addr % self.chr.len()
    }

    fn read_chr_at(&self, idx: usize) -> u8 {
        self.chr[self.chr_index(idx)]
    }

    fn write_chr_at(&mut self, idx: usize, value: u8) {
        if self.chr_is_ram {
            let idx = self.chr_index(idx);
            self.chr[idx] = value;
        }
    }
}

/// Mapper 0: fixed 16 KB or 32 KB PRG, 8 KB CHR.
struct Nrom {
    board: Board,
}

impl Nrom {
    fn new(cart: Cartridge) -> Self {
        Self {
            board: Board::new(cart),
        }
    }
}

impl Mapper for Nrom {
    fn name(&self) -> &'static str {
        "NROM"
    }

    fn read_prg(&self, addr: u16) -> Option<u8> {
        match addr {
            0x6000..=0x7FFF => Some(self.board.prg_ram[self.board.ram_index(0, addr)]),
            0x8000..=0xFFFF => {
                let idx = (addr as usize - 0x8000) % self.board.prg_rom.len();
                Some(self.board.prg_rom[idx])
            }
            _ => None,
        }
    }

    fn write_prg(&mut self, addr: u16, value: u8) {
        if (0x6000..=0x7FFF).contains(&addr) {
            let idx = self.board.ram_index(0, addr);
            self.board.prg_ram[idx] = value;
        }
    }

    fn read_chr(&self, addr: u16) -> u8 {
        self.board.read_chr_at(addr as usize)
    }

    fn write_chr(&mut self, addr: u16, value: u8) {
        self.board.write_chr_at(addr as usize, value);
    }

    fn mirroring(&self) -> Mirroring {
        self.board.mirroring
    }

    fn debug_state(&self) -> String {
        format!(
            "NROM prg={}KB chr={}KB{} mirroring={:?}",
            self.board.prg_rom.len() / 1024,
            self.board.chr.len() / 1024,
            if self.board.chr_is_ram { " (RAM)" } else { "" },
            self.board.mirroring
        )
    }
}

/// Mapper 1: serial 5-bit register interface.
struct Mmc1 {
    board: Board,
    shift_register: u8,
    bits_shifted: u8,
    control: u8,
    chr_bank0: u8,
    chr_bank1: u8,
    prg_bank: u8,
}

impl Mmc1 {
    const INITIAL_CONTROL: u8 = 0x0C;

    fn new(cart: Cartridge) -> Self {
        Self {
            board: Board::new(cart),
            shift_register: 0,
            bits_shifted: 0,
            control: Self::INITIAL_CONTROL,
            chr_bank0: 0,
            chr_bank1: 0,
            prg_bank: 0,
        }
    }

    fn prg_mode(&self) -> u8 {
        (self.control >> 2) & 0x03
    }

    fn chr_4k_mode(&self) -> bool {
        (self.control & 0x10) != 0
    }

    fn prg_ram_bank(&self) -> usize {
        ((self.chr_bank0 >> 2) & 0x03) as usize
    }

    fn write_shift_register(&mut self, addr: u16, value: u8) {
        if (value & 0x80) != 0 {
            self.shift_register = 0;
            self.bits_shifted = 0;
            self.control |= 0x0C;
            return;
        }

        self.shift_register = (self.shift_register >> 1) | ((value & 0x01) << 4);
        self.bits_shifted += 1;
        if self.bits_shifted < 5 {
            return;
        }

        let data = self.shift_register;
        match addr {
            0x8000..=0x9FFF => self.control = data,
            0xA000..=0xBFFF => self.chr_bank0 = data,
            0xC000..=0xDFFF => self.chr_bank1 = data,
            _ => self.prg_bank = data & 0x0F,
        }
        debug!("MMC1 register ${addr:04X} latched {data:#07b}");
        self.shift_register = 0;
        self.bits_shifted = 0;
    }

    fn chr_offset(&self, addr: u16) -> usize {
        let addr = addr as usize & 0x1FFF;
        if !self.chr_4k_mode() {
            (self.chr_bank0 as usize & 0x1E) * 0x1000 + addr
        } else if addr < 0x1000 {
            self.chr_bank0 as usize * 0x1000 + addr
        } else {
            self.chr_bank1 as usize * 0x1000 + (addr - 0x1000)
        }
    }
}

impl Mapper for Mmc1 {
    fn name(&self) -> &'static str {
        "MMC1"
    }

    fn read_prg(&self, addr: u16) -> Option<u8> {
        match addr {
            0x6000..=0x7FFF => {
                Some(self.board.prg_ram[self.board.ram_index(self.prg_ram_bank(), addr)])
            }
            0x8000..=0xFFFF => {
                let bank = self.prg_bank as usize;
                let offset_16k = addr as usize & 0x3FFF;
                let value = match self.prg_mode() {
                    0 | 1 => self.board.read_prg_bank(
                        (bank & 0x0E) >> 1,
                        0x8000,
                        addr as usize - 0x8000,
                    ),
                    2 if addr < 0xC000 => self.board.read_prg_bank(0, 0x4000, offset_16k),
                    2 => self.board.read_prg_bank(bank, 0x4000, offset_16k),
                    _ if addr < 0xC000 => self.board.read_prg_bank(bank, 0x4000, offset_16k),
                    _ => {
                        let last = self.board.prg_bank_count(0x4000) - 1;
                        self.board.read_prg_bank(last, 0x4000, offset_16k)
                    }
                };
                Some(value)
            }
            _ => None,
        }
    }

    fn write_prg(&mut self, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF => {
                let idx = self.board.ram_index(self.prg_ram_bank(), addr);
                self.board.prg_ram[idx] = value;
            }
            0x8000..=0xFFFF => self.write_shift_register(addr, value),
            _ => {}
        }
    }

    fn read_chr(&self, addr: u16) -> u8 {
        self.board.read_chr_at(self.chr_offset(addr))
    }

    fn write_chr(&mut self, addr: u16, value: u8) {
        let idx = self.chr_offset(addr);
        self.board.write_chr_at(idx, value);
    }

    fn mirroring(&self) -> Mirroring {
        match self.control & 0x03 {
            0 => Mirroring::OneScreenLower,
            1 => Mirroring::OneScreenUpper,
            2 => Mirroring::Vertical,
            _ => Mirroring::Horizontal,
        }
    }

    fn reset(&mut self) {
        self.shift_register = 0;
        self.bits_shifted = 0;
        self.control = Self::INITIAL_CONTROL;
        self.chr_bank0 = 0;
        self.chr_bank1 = 0;
        self.prg_bank = 0;
    }

    fn debug_state(&self) -> String {
        format!(
            "MMC1 control=${:02X} chr0=${:02X} chr1=${:02X} prg=${:02X} shift=${:02X}/{} mirroring={:?}",
            self.control,
            self.chr_bank0,
            self.chr_bank1,
            self.prg_bank,
            self.shift_register,
            self.bits_shifted,
            self.mirroring()
        )
    }
}

/// Mapper 2: switchable 16 KB at `$8000`, last bank fixed at `$C000`.
struct Uxrom {
    board: Board,
    bank_select: u8,
}

impl Uxrom {
    fn new(cart: Cartridge) -> Self {
        Self {
            board: Board::new(cart),
            bank_select: 0,
        }
    }
}

impl Mapper for Uxrom {
    fn name(&self) -> &'static str {
        "UxROM"
    }

    fn read_prg(&self, addr: u16) -> Option<u8> {
        match addr {
            0x6000..=0x7FFF => Some(self.board.prg_ram[self.board.ram_index(0, addr)]),
            0x8000..=0xBFFF => Some(self.board.read_prg_bank(
                self.bank_select as usize,
                0x4000,
                addr as usize - 0x8000,
            )),
            0xC000..=0xFFFF => {
                let last = self.board.prg_bank_count(0x4000) - 1;
                Some(
                    self.board
                        .read_prg_bank(last, 0x4000, addr as usize - 0xC000),
                )
            }
            _ => None,
        }
    }

    fn write_prg(&mut self, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF => {
                let idx = self.board.ram_index(0, addr);
                self.board.prg_ram[idx] = value;
            }
            0x8000..=0xFFFF => self.bank_select = value & 0x0F,
            _ => {}
        }
    }

    fn read_chr(&self, addr: u16) -> u8 {
        self.board.read_chr_at(addr as usize)
    }

    fn write_chr(&mut self, addr: u16, value: u8) {
        self.board.write_chr_at(addr as usize, value);
    }

    fn mirroring(&self) -> Mirroring {
        self.board.mirroring
    }

    fn reset(&mut self) {
        self.bank_select = 0;
    }

    fn debug_state(&self) -> String {
        format!(
            "UxROM prg_bank=${:02X} prg_16k_banks={}",
            self.bank_select,
            self.board.prg_bank_count(0x4000)
        )
    }
}

/// Mapper 7: 32 KB PRG switching with one-screen mirroring select.
struct Axrom {
    board: Board,
    prg_bank_select: u8,
    mirroring: Mirroring,
}

impl Axrom {
    fn new(cart: Cartridge) -> Self {
        Self {
            board: Board::new(cart),
            prg_bank_select: 0,
            mirroring: Mirroring::OneScreenLower,
        }
    }
}

impl Mapper for Axrom {
    fn name(&self) -> &'static str {
        "AxROM"
    }

    fn read_prg(&self, addr: u16) -> Option<u8> {
        match addr {
            0x8000..=0xFFFF => Some(self.board.read_prg_bank(
                self.prg_bank_select as usize,
                0x8000,
                addr as usize & 0x7FFF,
            )),
            _ => None,
        }
    }

    fn write_prg(&mut self, addr: u16, value: u8) {
        if addr >= 0x8000 {
            self.prg_bank_select = value & 0x07;
            self.mirroring = if (value & 0x10) != 0 {
                Mirroring::OneScreenUpper
            } else {
                Mirroring::OneScreenLower
            };
        }
    }

    fn read_chr(&self, addr: u16) -> u8 {
        self.board.read_chr_at(addr as usize)
    }

    fn write_chr(&mut self, addr: u16, value: u8) {
        self.board.write_chr_at(addr as usize, value);
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn reset(&mut self) {
        self.prg_bank_select = 0;
        self.mirroring = Mirroring::OneScreenLower;
    }

    fn debug_state(&self) -> String {
        format!(
            "AxROM prg_bank=${:02X} prg_32k_banks={} mirroring={:?}",
            self.prg_bank_select,
            self.board.prg_bank_count(0x8000),
            self.mirroring
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::TvSystem;

    fn patterned_banks(total_size: usize, bank_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; total_size];
        for (bank, chunk) in data.chunks_mut(bank_size).enumerate() {
            chunk.fill((bank as u8).wrapping_add(1));
        }
        data
    }

    fn make_cart(mapper_id: u16, prg_rom: Vec<u8>, chr_data: Vec<u8>, chr_is_ram: bool) -> Cartridge {
        Cartridge {
            mapper_id,
            mirroring: Mirroring::Horizontal,
            has_battery_backed_ram: false,
            has_trainer: false,
            vs_unisystem: false,
            playchoice10: false,
            is_nes2: false,
            tv_system: TvSystem::Ntsc,
            prg_rom,
            chr_data,
            chr_is_ram,
            prg_ram_size: PRG_RAM_UNIT,
        }
    }

    fn write_serial(mapper: &mut dyn Mapper, addr: u16, value: u8) {
        for bit in 0..5 {
            mapper.write_prg(addr, (value >> bit) & 0x01);
        }
    }

    #[test]
    fn nrom_mirrors_16k_prg_and_ignores_rom_writes() {
        let mut prg = patterned_banks(0x4000, 0x4000);
        prg[0x0010] = 0x42;
        let mut mapper = Nrom::new(make_cart(0, prg, vec![0; 0x2000], false));

        assert_eq!(mapper.read_prg(0x8010), Some(0x42));
        assert_eq!(mapper.read_prg(0xC010), Some(0x42));
        mapper.write_prg(0x8010, 0x99);
        assert_eq!(mapper.read_prg(0x8010), Some(0x42));
        assert_eq!(mapper.read_prg(0x5000), None);
    }

    #[test]
    fn prg_ram_round_trips_on_every_board() {
        for id in [0u16, 1, 2] {
            let prg = patterned_banks(0x8000, 0x4000);
            let mut mapper = create_mapper(make_cart(id, prg, vec![0; 0x2000], true)).unwrap();
            for addr in [0x6000u16, 0x6ABC, 0x7FFF] {
                mapper.write_prg(addr, addr as u8 ^ 0x5A);
                assert_eq!(mapper.read_prg(addr), Some(addr as u8 ^ 0x5A), "{}", mapper.name());
            }
        }
    }

    #[test]
    fn chr_rom_ignores_writes_and_chr_ram_keeps_them() {
        let prg = patterned_banks(0x8000, 0x4000);
        let mut rom = Nrom::new(make_cart(0, prg.clone(), vec![0x11; 0x2000], false));
        rom.write_chr(0x0123, 0xAB);
        assert_eq!(rom.read_chr(0x0123), 0x11);

        let mut ram = Nrom::new(make_cart(0, prg, vec![0; 0x2000], true));
        ram.write_chr(0x0123, 0xAB);
        assert_eq!(ram.read_chr(0x0123), 0xAB);
    }

    #[test]
    fn chr_ram_round_trips_on_every_board() {
        for id in [0u16, 1, 2, 7] {
            let prg = patterned_banks(0x8000, 0x4000);
            let mut mapper = create_mapper(make_cart(id, prg, vec![0; 0x2000], true)).unwrap();
            for addr in [0x0000u16, 0x0FFF, 0x1000, 0x1ABC, 0x1FFF] {
                mapper.write_chr(addr, addr as u8 ^ 0xA5);
                assert_eq!(mapper.read_chr(addr), addr as u8 ^ 0xA5, "{}", mapper.name());
            }
        }
    }

    #[test]
    fn mmc1_chr_ram_follows_4k_banks() {
        let prg = patterned_banks(2 * 0x4000, 0x4000);
        let mut mapper = Mmc1::new(make_cart(1, prg, vec![0; 0x2000], true));
        write_serial(&mut mapper, 0x8000, 0b11100);
        write_serial(&mut mapper, 0xA000, 1);
        write_serial(&mut mapper, 0xC000, 0);

        mapper.write_chr(0x0010, 0xAA);
        assert_eq!(mapper.read_chr(0x0010), 0xAA);
        assert_eq!(mapper.read_chr(0x1010), 0x00);

        write_serial(&mut mapper, 0xC000, 1);
        assert_eq!(mapper.read_chr(0x1010), 0xAA);
        mapper.write_chr(0x1020, 0xBB);
        assert_eq!(mapper.read_chr(0x0020), 0xBB);
    }

    #[test]
    fn mmc1_latches_after_five_serial_writes() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let mut mapper = Mmc1::new(make_cart(1, prg, vec![0; 0x2000], true));

        for bit in [1u8, 0, 1, 1, 0] {
            mapper.write_prg(0x9FFF, bit);
        }
        assert_eq!(mapper.control, 0b01101);
        assert_eq!(mapper.bits_shifted, 0);
        assert_eq!(mapper.mirroring(), Mirroring::OneScreenUpper);

        write_serial(&mut mapper, 0x8000, 0b00010);
        assert_eq!(mapper.mirroring(), Mirroring::Vertical);
    }

    #[test]
    fn mmc1_reset_bit_clears_shift_register_and_forces_fix_last() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let mut mapper = Mmc1::new(make_cart(1, prg, vec![0; 0x2000], true));

        write_serial(&mut mapper, 0x8000, 0b00000);
        mapper.write_prg(0x8000, 1);
        mapper.write_prg(0x8000, 1);
        mapper.write_prg(0x8000, 0x80);
        assert_eq!(mapper.bits_shifted, 0);
        assert_eq!(mapper.shift_register, 0);
        assert_eq!(mapper.control & 0x0C, 0x0C);
        assert_eq!(mapper.read_prg(0xC000), Some(4));
    }

    #[test]
    fn mmc1_prg_modes() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let mut mapper = Mmc1::new(make_cart(1, prg, vec![0; 0x2000], true));

        write_serial(&mut mapper, 0xE000, 2);
        assert_eq!(mapper.read_prg(0x8000), Some(3));
        assert_eq!(mapper.read_prg(0xC000), Some(4));

        write_serial(&mut mapper, 0x8000, 0b01000);
        assert_eq!(mapper.read_prg(0x8000), Some(1));
        assert_eq!(mapper.read_prg(0xC000), Some(3));

        write_serial(&mut mapper, 0x8000, 0b00000);
        write_serial(&mut mapper, 0xE000, 3);
        assert_eq!(mapper.read_prg(0x8000), Some(3));
        assert_eq!(mapper.read_prg(0xC000), Some(4));
    }

    #[test]
    fn mmc1_chr_modes() {
        let prg = patterned_banks(2 * 0x4000, 0x4000);
        let chr = patterned_banks(4 * 0x1000, 0x1000);
        let mut mapper = Mmc1::new(make_cart(1, prg, chr, false));

        write_serial(&mut mapper, 0xA000, 3);
        assert_eq!(mapper.read_chr(0x0000), 3);
        assert_eq!(mapper.read_chr(0x1000), 4);

        write_serial(&mut mapper, 0x8000, 0b11100);
        write_serial(&mut mapper, 0xC000, 1);
        assert_eq!(mapper.read_chr(0x0000), 4);
        assert_eq!(mapper.read_chr(0x1000), 2);
    }

    #[test]
    fn mmc1_register_writes_never_reach_rom() {
        let prg = patterned_banks(2 * 0x4000, 0x4000);
        let mut mapper = Mmc1::new(make_cart(1, prg, vec![0; 0x2000], true));
        for addr in [0x8000u16, 0xA000, 0xC000, 0xE000] {
            mapper.write_prg(addr, 0x80);
        }
        assert_eq!(mapper.read_prg(0x8000), Some(1));
        assert_eq!(mapper.read_prg(0xFFFF), Some(2));
    }

    #[test]
    fn mmc1_prg_ram_bank_follows_chr_bank0() {
        let prg = patterned_banks(2 * 0x4000, 0x4000);
        let mut cart = make_cart(1, prg, vec![0; 0x2000], true);
        cart.prg_ram_size = 4 * PRG_RAM_UNIT;
        let mut mapper = Mmc1::new(cart);

        mapper.write_prg(0x6000, 0xAA);
        write_serial(&mut mapper, 0xA000, 0b00100);
        assert_eq!(mapper.read_prg(0x6000), Some(0));
        mapper.write_prg(0x6000, 0xBB);
        write_serial(&mut mapper, 0xA000, 0);
        assert_eq!(mapper.read_prg(0x6000), Some(0xAA));
    }

    #[test]
    fn uxrom_keeps_last_bank_fixed() {
        let prg = patterned_banks(3 * 0x4000, 0x4000);
        let mut mapper = Uxrom::new(make_cart(2, prg, vec![0; 0x2000], true));

        mapper.write_prg(0x8000, 1);
        assert_eq!(mapper.read_prg(0x8000), Some(2));
        assert_eq!(mapper.read_prg(0xC000), Some(3));
        mapper.write_prg(0xFFFF, 0xF4);
        assert_eq!(mapper.read_prg(0x8000), Some(2));
    }

    #[test]
    fn axrom_switches_32k_and_screen() {
        let prg = patterned_banks(4 * 0x8000, 0x8000);
        let mut mapper = Axrom::new(make_cart(7, prg, vec![0; 0x2000], true));
        assert_eq!(mapper.mirroring(), Mirroring::OneScreenLower);

        mapper.write_prg(0x8000, 0x12);
        assert_eq!(mapper.read_prg(0x8000), Some(3));
        assert_eq!(mapper.read_prg(0xFFFF), Some(3));
        assert_eq!(mapper.mirroring(), Mirroring::OneScreenUpper);
    }

    #[test]
    fn unsupported_mapper_is_rejected() {
        let cart = make_cart(4, vec![0; 0x8000], vec![0; 0x2000], false);
        let err = create_mapper(cart).err().unwrap();
        assert_eq!(
            err.downcast_ref::<CartridgeError>(),
            Some(&CartridgeError::UnsupportedMapper(4))
        );
    }
}
