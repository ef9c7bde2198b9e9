use super::TvSystem;
use super::mapper::{Mapper, Mirroring};
use super::palette::{NES_PALETTE, POWER_UP_PALETTE_RAM, Palette};

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;
pub const FRAME_BYTES: usize = FRAME_WIDTH * FRAME_HEIGHT * 4;

pub const DOTS_PER_LINE: u16 = 341;
pub const VBLANK_LINE: u16 = 241;

const CTRL_NMI_ENABLE: u8 = 0x80;
const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;

const MASK_GRAYSCALE: u8 = 0x01;
const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;
const MASK_EMPHASIS: u8 = 0xE0;
const MASK_EMPHASIZE_RED: u8 = 0x20;
const MASK_EMPHASIZE_GREEN: u8 = 0x40;
const MASK_EMPHASIZE_BLUE: u8 = 0x80;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

const EMPHASIS_ATTENUATION: f32 = 0.816_328;

/// Cycle-by-cycle sprite evaluation for the following scanline.
#[derive(Debug, Clone, Copy, Default)]
struct SpriteEval {
    n: u8,
    m: u8,
    found: u8,
    latch: u8,
    overflow_scan: bool,
    done: bool,
    sprite0_found: bool,
}

pub struct Ppu {
    ctrl: u8,
    mask: u8,
    status: u8,

    oam_addr: u8,
    oam: [u8; 256],
    secondary_oam: [u8; 32],

    vram: [u8; 4096],
    palette_ram: [u8; 32],
    palette: Palette,

    write_toggle: bool,
    v: u16,
    t: u16,
    fine_x: u8,
    read_buffer: u8,
    open_bus: u8,

    tv_system: TvSystem,
    scanline: u16,
    dot: u16,
    odd_frame: bool,
    frame_ready: bool,
    nmi_pending: bool,
    nmi_line: bool,
    vblank_suppress: bool,

    next_tile_id: u8,
    next_tile_attr: u8,
    next_tile_lsb: u8,
    next_tile_msb: u8,
    bg_shift_pattern_lo: u16,
    bg_shift_pattern_hi: u16,
    bg_shift_attr_lo: u16,
    bg_shift_attr_hi: u16,

    eval: SpriteEval,
    sprite_count: usize,
    sprite_patterns_lo: [u8; 8],
    sprite_patterns_hi: [u8; 8],
    sprite_x: [u8; 8],
    sprite_attributes: [u8; 8],
    sprite0_on_line: bool,

    frame_buffer: Vec<u8>,
    completed_frame: Vec<u8>,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new(TvSystem::Ntsc)
    }
}

impl Ppu {
    pub fn new(tv_system: TvSystem) -> Self {
        let mut ppu = Self {
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam: [0; 256],
            secondary_oam: [0xFF; 32],
            vram: [0; 4096],
            palette_ram: POWER_UP_PALETTE_RAM,
            palette: NES_PALETTE,
            write_toggle: false,
            v: 0,
            t: 0,
            fine_x: 0,
            read_buffer: 0,
            open_bus: 0,
            tv_system,
            scanline: 0,
            dot: 0,
            odd_frame: false,
            frame_ready: false,
            nmi_pending: false,
            nmi_line: false,
            vblank_suppress: false,
            next_tile_id: 0,
            next_tile_attr: 0,
            next_tile_lsb: 0,
            next_tile_msb: 0,
            bg_shift_pattern_lo: 0,
            bg_shift_pattern_hi: 0,
            bg_shift_attr_lo: 0,
            bg_shift_attr_hi: 0,
            eval: SpriteEval::default(),
            sprite_count: 0,
            sprite_patterns_lo: [0; 8],
            sprite_patterns_hi: [0; 8],
            sprite_x: [0; 8],
            sprite_attributes: [0; 8],
            sprite0_on_line: false,
            frame_buffer: vec![0; FRAME_BYTES],
            completed_frame: vec![0; FRAME_BYTES],
        };
        ppu.power_up();
        ppu
    }

    /// Power-on state: vblank and overflow read back set, palette RAM holds
    /// its power-up pattern, `v` and OAMADDR are cleared.
    pub fn power_up(&mut self) {
        self.status = STATUS_VBLANK | STATUS_SPRITE_OVERFLOW;
        self.oam_addr = 0;
        self.v = 0;
        self.palette_ram = POWER_UP_PALETTE_RAM;
        self.reset();
    }

    /// Reset leaves `v`, OAM, VRAM, palette RAM and the status flags alone.
    pub fn reset(&mut self) {
        self.ctrl = 0;
        self.mask = 0;
        self.t = 0;
        self.fine_x = 0;
        self.read_buffer = 0;
        self.write_toggle = false;
        self.odd_frame = false;
        self.scanline = 0;
        self.dot = 0;
        self.frame_ready = false;
        self.nmi_pending = false;
        self.nmi_line = false;
        self.vblank_suppress = false;

        self.next_tile_id = 0;
        self.next_tile_attr = 0;
        self.next_tile_lsb = 0;
        self.next_tile_msb = 0;
        self.bg_shift_pattern_lo = 0;
        self.bg_shift_pattern_hi = 0;
        self.bg_shift_attr_lo = 0;
        self.bg_shift_attr_hi = 0;

        self.eval = SpriteEval::default();
        self.sprite_count = 0;
        self.sprite0_on_line = false;
    }

    pub fn set_palette(&mut self, palette: Palette) {
        self.palette = palette;
    }

    /// The last completed frame, RGBA8, 256x240.
    pub fn frame_buffer(&self) -> &[u8] {
        &self.completed_frame
    }

    pub fn frame_ready(&self) -> bool {
        self.frame_ready
    }

    pub fn clear_frame_ready(&mut self) {
        self.frame_ready = false;
    }

    pub fn take_nmi(&mut self) -> bool {
        let pending = self.nmi_pending;
        self.nmi_pending = false;
        pending
    }

    /// (scanline, dot) of the next dot to be processed.
    pub fn position(&self) -> (u16, u16) {
        (self.scanline, self.dot)
    }

    pub fn odd_frame(&self) -> bool {
        self.odd_frame
    }

    pub fn debug_registers(&self) -> (u8, u8, u8, u8) {
        (self.ctrl, self.mask, self.status, self.oam_addr)
    }

    pub fn debug_scroll(&self) -> (u16, u16, u8, bool) {
        (self.v, self.t, self.fine_x, self.write_toggle)
    }

    pub fn debug_peek_oam(&self, index: usize) -> u8 {
        self.oam[index % self.oam.len()]
    }

    pub fn debug_peek_palette(&self, index: usize) -> u8 {
        self.palette_ram[index % self.palette_ram.len()]
    }

    fn last_line(&self) -> u16 {
        self.tv_system.scanlines() - 1
    }

    pub fn cpu_read_register(&mut self, addr: u16, mapper: &mut dyn Mapper) -> u8 {
        let value = match addr & 0x2007 {
            0x2002 => {
                // The dot that raises vblank is next: this read wins the race.
                if self.scanline == VBLANK_LINE && self.dot == 1 {
                    self.vblank_suppress = true;
                }

                let value = (self.status & 0xE0) | (self.open_bus & 0x1F);
                self.status &= !STATUS_VBLANK;
                self.write_toggle = false;
                self.update_nmi_line();
                value
            }
            0x2004 => self.oam[self.oam_addr as usize],
            0x2007 => {
                let ppu_addr = self.v & 0x3FFF;
                let value = self.ppu_read(ppu_addr, mapper);
                let result = if ppu_addr >= 0x3F00 {
                    self.read_buffer = self.ppu_read(ppu_addr - 0x1000, mapper);
                    value
                } else {
                    let buffered = self.read_buffer;
                    self.read_buffer = value;
                    buffered
                };
                self.increment_vram_addr();
                result
            }
            _ => self.open_bus,
        };
        self.open_bus = value;
        value
    }

    pub fn cpu_write_register(&mut self, addr: u16, value: u8, mapper: &mut dyn Mapper) {
        self.open_bus = value;
        match addr & 0x2007 {
            0x2000 => {
                self.ctrl = value;
                self.t = (self.t & !0x0C00) | (((value as u16) & 0x03) << 10);
                self.update_nmi_line();
            }
            0x2001 => self.mask = value,
            0x2003 => self.oam_addr = value,
            0x2004 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            0x2005 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.t = (self.t & !0x001F) | ((value as u16) >> 3);
                } else {
                    self.t = (self.t & !0x03E0) | (((value as u16) >> 3) << 5);
                    self.t = (self.t & !0x7000) | (((value as u16) & 0x07) << 12);
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2006 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value as u16) & 0x3F) << 8);
                } else {
                    self.t = (self.t & 0x7F00) | (value as u16);
                    self.v = self.t;
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2007 => {
                self.ppu_write(self.v & 0x3FFF, value, mapper);
                self.increment_vram_addr();
            }
            _ => {}
        }
    }

    pub fn write_oam_dma(&mut self, bytes: &[u8; 256]) {
        for byte in bytes {
            self.oam[self.oam_addr as usize] = *byte;
            self.oam_addr = self.oam_addr.wrapping_add(1);
        }
    }

    pub fn tick(&mut self, mapper: &mut dyn Mapper) {
        let last_line = self.last_line();
        let visible_line = self.scanline < FRAME_HEIGHT as u16;
        let pre_render = self.scanline == last_line;
        let render_line = visible_line || pre_render;
        let rendering_enabled = self.rendering_enabled();

        if pre_render && self.dot == 1 {
            self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
            self.update_nmi_line();
        }

        if self.scanline == VBLANK_LINE && self.dot == 1 {
            if !self.vblank_suppress {
                self.status |= STATUS_VBLANK;
            }
            self.vblank_suppress = false;
            self.update_nmi_line();
        }

        // Shifts trail the fetch phases by one dot so tile pixel 0 lands on dot 1.
        if render_line
            && rendering_enabled
            && ((2..=257).contains(&self.dot) || (322..=337).contains(&self.dot))
        {
            self.shift_background_registers();
        }

        if visible_line && (1..=256).contains(&self.dot) {
            self.render_pixel((self.dot - 1) as usize, self.scanline as usize);
        }

        if render_line && rendering_enabled {
            if (1..=64).contains(&self.dot) && self.dot % 2 == 0 {
                self.secondary_oam[(self.dot / 2 - 1) as usize] = 0xFF;
            }
            if visible_line && (65..=256).contains(&self.dot) {
                self.clock_sprite_evaluation();
            }

            if (1..=256).contains(&self.dot) || (321..=336).contains(&self.dot) {
                self.fetch_background(mapper);
            }

            if visible_line && (1..=256).contains(&self.dot) {
                self.shift_sprite_registers();
            }

            if self.dot == 256 {
                self.increment_y();
            }

            if self.dot == 257 {
                self.load_background_shifters();
                self.copy_horizontal_bits();
                if visible_line {
                    self.load_sprites_for_next_line(mapper);
                } else {
                    self.sprite_count = 0;
                    self.sprite0_on_line = false;
                }
            }

            if pre_render && (280..=304).contains(&self.dot) {
                self.copy_vertical_bits();
            }

            if self.dot == 338 || self.dot == 340 {
                self.next_tile_id = self.ppu_read(0x2000 | (self.v & 0x0FFF), mapper);
            }
        } else if render_line && self.dot == 257 {
            self.sprite_count = 0;
            self.sprite0_on_line = false;
        }

        if pre_render
            && self.dot == 339
            && self.odd_frame
            && self.tv_system == TvSystem::Ntsc
            && (self.mask & MASK_SHOW_BG) != 0
        {
            self.finish_frame();
            return;
        }

        self.dot += 1;
        if self.dot >= DOTS_PER_LINE {
            self.dot = 0;
            self.scanline += 1;
            if self.scanline > last_line {
                self.finish_frame();
            }
        }
    }

    fn finish_frame(&mut self) {
        self.scanline = 0;
        self.dot = 0;
        self.completed_frame.copy_from_slice(&self.frame_buffer);
        self.frame_ready = true;
        self.odd_frame = !self.odd_frame;
    }

    fn rendering_enabled(&self) -> bool {
        (self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    fn update_nmi_line(&mut self) {
        let line = (self.ctrl & CTRL_NMI_ENABLE) != 0 && (self.status & STATUS_VBLANK) != 0;
        if line && !self.nmi_line {
            self.nmi_pending = true;
        }
        self.nmi_line = line;
    }

    fn fetch_background(&mut self, mapper: &mut dyn Mapper) {
        match (self.dot - 1) & 0x07 {
            0 => {
                self.load_background_shifters();
                self.next_tile_id = self.ppu_read(0x2000 | (self.v & 0x0FFF), mapper);
            }
            2 => {
                let addr = 0x23C0
                    | (self.v & 0x0C00)
                    | ((self.v >> 4) & 0x0038)
                    | ((self.v >> 2) & 0x0007);
                let attr = self.ppu_read(addr, mapper);
                let shift = ((self.v >> 4) & 0x04) | (self.v & 0x02);
                self.next_tile_attr = (attr >> shift) & 0x03;
            }
            4 => {
                let addr = self.background_pattern_addr();
                self.next_tile_lsb = self.ppu_read(addr, mapper);
            }
            6 => {
                let addr = self.background_pattern_addr() + 8;
                self.next_tile_msb = self.ppu_read(addr, mapper);
            }
            7 => self.increment_coarse_x(),
            _ => {}
        }
    }

    fn background_pattern_addr(&self) -> u16 {
        let fine_y = (self.v >> 12) & 0x07;
        let table = if (self.ctrl & CTRL_BG_TABLE) != 0 {
            0x1000
        } else {
            0x0000
        };
        table + (self.next_tile_id as u16) * 16 + fine_y
    }

    fn render_pixel(&mut self, x: usize, y: usize) {
        let (bg_pixel, bg_palette, bg_opaque) = self.background_sample(x);
        let (spr_pixel, spr_palette, spr_behind_bg, is_sprite0) = self.sprite_sample(x);

        if is_sprite0 && bg_opaque && x != 255 {
            self.status |= STATUS_SPRITE_ZERO_HIT;
        }

        let color = if bg_opaque && (spr_pixel == 0 || spr_behind_bg) {
            self.palette_ram[palette_index(0x3F00 | ((bg_palette << 2) | bg_pixel) as u16)]
        } else if spr_pixel != 0 {
            self.palette_ram
                [palette_index(0x3F10 | ((spr_palette << 2) | spr_pixel) as u16)]
        } else if !self.rendering_enabled() && (self.v & 0x3FFF) >= 0x3F00 {
            self.palette_ram[palette_index(self.v)]
        } else {
            self.palette_ram[0]
        };

        let rgb = self.color_rgb(color);
        let pixel = (y * FRAME_WIDTH + x) * 4;
        self.frame_buffer[pixel..pixel + 3].copy_from_slice(&rgb);
        self.frame_buffer[pixel + 3] = 0xFF;
    }

    fn color_rgb(&self, color: u8) -> [u8; 3] {
        let mut color = color & 0x3F;
        if (self.mask & MASK_GRAYSCALE) != 0 {
            color &= 0x30;
        }
        let mut rgb = self.palette[color as usize];

        let emphasis = self.mask & MASK_EMPHASIS;
        if emphasis != 0 && (color & 0x0F) != 0x0F {
            let all = emphasis == MASK_EMPHASIS;
            let channels = [MASK_EMPHASIZE_RED, MASK_EMPHASIZE_GREEN, MASK_EMPHASIZE_BLUE];
            for (value, bit) in rgb.iter_mut().zip(channels) {
                if all || (emphasis & bit) == 0 {
                    *value = (*value as f32 * EMPHASIS_ATTENUATION) as u8;
                }
            }
        }
        rgb
    }

    fn background_sample(&self, x: usize) -> (u8, u8, bool) {
        if (self.mask & MASK_SHOW_BG) == 0 {
            return (0, 0, false);
        }
        if x < 8 && (self.mask & MASK_SHOW_BG_LEFT) == 0 {
            return (0, 0, false);
        }

        let bit = 0x8000u16 >> self.fine_x;

        let p0 = ((self.bg_shift_pattern_lo & bit) != 0) as u8;
        let p1 = ((self.bg_shift_pattern_hi & bit) != 0) as u8;
        let pixel = (p1 << 1) | p0;

        let a0 = ((self.bg_shift_attr_lo & bit) != 0) as u8;
        let a1 = ((self.bg_shift_attr_hi & bit) != 0) as u8;
        let palette = (a1 << 1) | a0;

        (pixel, palette, pixel != 0)
    }

    /// First opaque sprite pixel at `x`: (pixel, palette, behind_bg, is_sprite0).
    fn sprite_sample(&self, x: usize) -> (u8, u8, bool, bool) {
        if (self.mask & MASK_SHOW_SPRITES) == 0 {
            return (0, 0, false, false);
        }
        if x < 8 && (self.mask & MASK_SHOW_SPRITE_LEFT) == 0 {
            return (0, 0, false, false);
        }

        for i in 0..self.sprite_count {
            if self.sprite_x[i] != 0 {
                continue;
            }

            let p0 = (self.sprite_patterns_lo[i] & 0x80) >> 7;
            let p1 = (self.sprite_patterns_hi[i] & 0x80) >> 6;
            let pixel = p0 | p1;
            if pixel == 0 {
                continue;
            }

            let palette = self.sprite_attributes[i] & 0x03;
            let behind_bg = (self.sprite_attributes[i] & 0x20) != 0;
            return (pixel, palette, behind_bg, i == 0 && self.sprite0_on_line);
        }

        (0, 0, false, false)
    }

    fn shift_background_registers(&mut self) {
        self.bg_shift_pattern_lo <<= 1;
        self.bg_shift_pattern_hi <<= 1;
        self.bg_shift_attr_lo <<= 1;
        self.bg_shift_attr_hi <<= 1;
    }

    fn shift_sprite_registers(&mut self) {
        for i in 0..self.sprite_count {
            if self.sprite_x[i] > 0 {
                self.sprite_x[i] -= 1;
            } else {
                self.sprite_patterns_lo[i] <<= 1;
                self.sprite_patterns_hi[i] <<= 1;
            }
        }
    }

    fn load_background_shifters(&mut self) {
        self.bg_shift_pattern_lo = (self.bg_shift_pattern_lo & 0xFF00) | self.next_tile_lsb as u16;
        self.bg_shift_pattern_hi = (self.bg_shift_pattern_hi & 0xFF00) | self.next_tile_msb as u16;

        let attr_lo = if (self.next_tile_attr & 0x01) != 0 {
            0xFF
        } else {
            0x00
        };
        let attr_hi = if (self.next_tile_attr & 0x02) != 0 {
            0xFF
        } else {
            0x00
        };

        self.bg_shift_attr_lo = (self.bg_shift_attr_lo & 0xFF00) | attr_lo;
        self.bg_shift_attr_hi = (self.bg_shift_attr_hi & 0xFF00) | attr_hi;
    }

    fn increment_coarse_x(&mut self) {
        if (self.v & 0x001F) == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v = self.v.wrapping_add(1);
        }
    }

    fn increment_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v = self.v.wrapping_add(0x1000);
            return;
        }

        self.v &= !0x7000;
        let mut y = (self.v & 0x03E0) >> 5;
        if y == 29 {
            y = 0;
            self.v ^= 0x0800;
        } else if y == 31 {
            y = 0;
        } else {
            y += 1;
        }

        self.v = (self.v & !0x03E0) | (y << 5);
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & !0x041F) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & !0x7BE0) | (self.t & 0x7BE0);
    }

    fn sprite_height(&self) -> u16 {
        if (self.ctrl & CTRL_SPRITE_SIZE_16) != 0 {
            16
        } else {
            8
        }
    }

    fn sprite_in_range(&self, y: u8) -> bool {
        let row = self.scanline.wrapping_sub(y as u16);
        row < self.sprite_height()
    }

    fn clock_sprite_evaluation(&mut self) {
        if self.dot == 65 {
            self.eval = SpriteEval::default();
        }
        if self.eval.done {
            return;
        }

        let oam_index = self.eval.n as usize * 4 + self.eval.m as usize;
        if self.dot % 2 == 1 {
            self.eval.latch = self.oam[oam_index];
            return;
        }

        let byte = self.eval.latch;
        if self.eval.overflow_scan {
            // Hardware bug: m is incremented along with n, so tile, attribute
            // and X bytes get compared as Y coordinates.
            if self.sprite_in_range(byte) {
                self.status |= STATUS_SPRITE_OVERFLOW;
                self.eval.done = true;
                return;
            }
            self.eval.m = (self.eval.m + 1) & 0x03;
            self.advance_eval_sprite();
            return;
        }

        let slot = self.eval.found as usize * 4;
        if self.eval.m == 0 {
            if !self.sprite_in_range(byte) {
                self.advance_eval_sprite();
                return;
            }
            if self.eval.n == 0 {
                self.eval.sprite0_found = true;
            }
        }

        self.secondary_oam[slot + self.eval.m as usize] = byte;
        self.eval.m += 1;
        if self.eval.m == 4 {
            self.eval.m = 0;
            self.eval.found += 1;
            if self.eval.found == 8 {
                self.eval.overflow_scan = true;
            }
            self.advance_eval_sprite();
        }
    }

    fn advance_eval_sprite(&mut self) {
        self.eval.n += 1;
        if self.eval.n >= 64 {
            self.eval.done = true;
        }
    }

    fn load_sprites_for_next_line(&mut self, mapper: &mut dyn Mapper) {
        let sprite_height = self.sprite_height();
        self.sprite_count = self.eval.found as usize;
        self.sprite0_on_line = self.eval.sprite0_found;

        for i in 0..8 {
            if i >= self.sprite_count {
                self.sprite_patterns_lo[i] = 0;
                self.sprite_patterns_hi[i] = 0;
                self.sprite_x[i] = 0xFF;
                self.sprite_attributes[i] = 0;
                continue;
            }

            let base = i * 4;
            let y = self.secondary_oam[base];
            let tile_index = self.secondary_oam[base + 1];
            let attributes = self.secondary_oam[base + 2];
            let x = self.secondary_oam[base + 3];

            let mut row = self.scanline.wrapping_sub(y as u16) & (sprite_height - 1);
            if (attributes & 0x80) != 0 {
                row = (sprite_height - 1) - row;
            }

            let (table, tile) = if sprite_height == 16 {
                let table = ((tile_index & 0x01) as u16) * 0x1000;
                let tile = ((tile_index & 0xFE) as u16) + (row / 8);
                (table, tile)
            } else {
                let table = if (self.ctrl & CTRL_SPRITE_TABLE) != 0 {
                    0x1000
                } else {
                    0x0000
                };
                (table, tile_index as u16)
            };

            let addr = table + tile * 16 + (row & 0x07);
            let mut low = self.ppu_read(addr, mapper);
            let mut high = self.ppu_read(addr + 8, mapper);
            if (attributes & 0x40) != 0 {
                low = low.reverse_bits();
                high = high.reverse_bits();
            }

            self.sprite_patterns_lo[i] = low;
            self.sprite_patterns_hi[i] = high;
            self.sprite_x[i] = x;
            self.sprite_attributes[i] = attributes;
        }
    }

    fn increment_vram_addr(&mut self) {
        let step = if (self.ctrl & CTRL_VRAM_INC_32) != 0 {
            32
        } else {
            1
        };
        self.v = self.v.wrapping_add(step) & 0x7FFF;
    }

    fn ppu_read(&self, addr: u16, mapper: &dyn Mapper) -> u8 {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.read_chr(addr),
            0x2000..=0x3EFF => self.vram[mirrored_vram_index(addr, mapper.mirroring())],
            _ => self.palette_ram[palette_index(addr)],
        }
    }

    fn ppu_write(&mut self, addr: u16, value: u8, mapper: &mut dyn Mapper) {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.write_chr(addr, value),
            0x2000..=0x3EFF => {
                let index = mirrored_vram_index(addr, mapper.mirroring());
                self.vram[index] = value;
            }
            _ => self.palette_ram[palette_index(addr)] = value,
        }
    }
}

/// Palette RAM slot for `addr`; sprite backdrop entries alias the
/// background ones.
fn palette_index(addr: u16) -> usize {
    let mut index = (addr & 0x1F) as usize;
    if index >= 16 && (index & 0x03) == 0 {
        index -= 16;
    }
    index
}

fn mirrored_vram_index(addr: u16, mirroring: Mirroring) -> usize {
    let index = ((addr - 0x2000) & 0x0FFF) as usize;
    let table = index / 0x400;
    let offset = index % 0x400;

    let mapped_table = match mirroring {
        Mirroring::Horizontal => table >> 1,
        Mirroring::Vertical => table & 1,
        Mirroring::OneScreenLower => 0,
        Mirroring::OneScreenUpper => 1,
        Mirroring::FourScreen => table,
    };

    mapped_table * 0x400 + offset
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ChrRam {
        chr: [u8; 0x2000],
        mirroring: Mirroring,
    }

    impl ChrRam {
        fn new(mirroring: Mirroring) -> Self {
            Self {
                chr: [0; 0x2000],
                mirroring,
            }
        }
    }

    impl Mapper for ChrRam {
        fn name(&self) -> &'static str {
            "test"
        }
        fn read_prg(&self, _addr: u16) -> Option<u8> {
            None
        }
        fn write_prg(&mut self, _addr: u16, _value: u8) {}
        fn read_chr(&self, addr: u16) -> u8 {
            self.chr[addr as usize & 0x1FFF]
        }
        fn write_chr(&mut self, addr: u16, value: u8) {
            self.chr[addr as usize & 0x1FFF] = value;
        }
        fn mirroring(&self) -> Mirroring {
            self.mirroring
        }
    }

    fn set_addr(ppu: &mut Ppu, mapper: &mut ChrRam, addr: u16) {
        ppu.cpu_write_register(0x2006, (addr >> 8) as u8, mapper);
        ppu.cpu_write_register(0x2006, addr as u8, mapper);
    }

    fn dots_until_frame(ppu: &mut Ppu, mapper: &mut ChrRam) -> u32 {
        ppu.clear_frame_ready();
        let mut dots = 0;
        while !ppu.frame_ready() {
            ppu.tick(mapper);
            dots += 1;
        }
        dots
    }

    #[test]
    fn palette_backdrop_entries_alias() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Horizontal);
        for (mirror, base) in [(0x3F10u16, 0x3F00u16), (0x3F14, 0x3F04), (0x3F18, 0x3F08), (0x3F1C, 0x3F0C)] {
            set_addr(&mut ppu, &mut mapper, mirror);
            ppu.cpu_write_register(0x2007, (mirror & 0xFF) as u8, &mut mapper);
            set_addr(&mut ppu, &mut mapper, base);
            assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper) & 0x3F, (mirror & 0x3F) as u8);
        }
        set_addr(&mut ppu, &mut mapper, 0x3F11);
        ppu.cpu_write_register(0x2007, 0x21, &mut mapper);
        assert_eq!(ppu.palette_ram[0x01], POWER_UP_PALETTE_RAM[0x01]);
        assert_eq!(ppu.palette_ram[0x11], 0x21);
    }

    #[test]
    fn ppudata_reads_are_buffered_below_palette() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        set_addr(&mut ppu, &mut mapper, 0x2400);
        ppu.cpu_write_register(0x2007, 0xAB, &mut mapper);
        ppu.cpu_write_register(0x2007, 0xCD, &mut mapper);

        set_addr(&mut ppu, &mut mapper, 0x2C00);
        let _stale = ppu.cpu_read_register(0x2007, &mut mapper);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0xAB);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0xCD);
    }

    #[test]
    fn ppudata_increment_follows_ctrl_bit() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        set_addr(&mut ppu, &mut mapper, 0x2000);
        ppu.cpu_write_register(0x2007, 0, &mut mapper);
        assert_eq!(ppu.v, 0x2001);
        ppu.cpu_write_register(0x2000, CTRL_VRAM_INC_32, &mut mapper);
        ppu.cpu_write_register(0x2007, 0, &mut mapper);
        assert_eq!(ppu.v, 0x2021);
    }

    #[test]
    fn scroll_writes_fill_t_and_fine_x() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        ppu.cpu_write_register(0x2000, 0x03, &mut mapper);
        ppu.cpu_write_register(0x2005, 0x7D, &mut mapper);
        ppu.cpu_write_register(0x2005, 0x5E, &mut mapper);
        assert_eq!(ppu.fine_x, 0x05);
        assert_eq!(ppu.t, 0x0C00 | 0x000F | (0x0B << 5) | (0x06 << 12));

        ppu.cpu_read_register(0x2002, &mut mapper);
        assert!(!ppu.write_toggle);
    }

    #[test]
    fn coarse_y_wraps_at_29_and_31() {
        let mut ppu = Ppu::default();
        ppu.v = 0x7000 | (29 << 5);
        ppu.increment_y();
        assert_eq!(ppu.v, 0x0800);

        ppu.v = 0x7000 | (31 << 5);
        ppu.increment_y();
        assert_eq!(ppu.v, 0x0000);

        ppu.v = 31;
        ppu.increment_coarse_x();
        assert_eq!(ppu.v, 0x0400);
    }

    #[test]
    fn frame_is_341_by_262_with_rendering_off() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        assert_eq!(dots_until_frame(&mut ppu, &mut mapper), 341 * 262);
        assert_eq!(dots_until_frame(&mut ppu, &mut mapper), 341 * 262);
        assert_eq!(ppu.position(), (0, 0));
    }

    #[test]
    fn odd_frames_drop_a_dot_with_background_enabled() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        ppu.cpu_write_register(0x2001, MASK_SHOW_BG, &mut mapper);
        let first = dots_until_frame(&mut ppu, &mut mapper);
        let second = dots_until_frame(&mut ppu, &mut mapper);
        assert_eq!(first, 341 * 262);
        assert_eq!(second, 341 * 262 - 1);
    }

    #[test]
    fn sprites_alone_do_not_skip_a_dot() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        ppu.cpu_write_register(0x2001, MASK_SHOW_SPRITES, &mut mapper);
        dots_until_frame(&mut ppu, &mut mapper);
        assert_eq!(dots_until_frame(&mut ppu, &mut mapper), 341 * 262);
    }

    #[test]
    fn pal_frames_have_312_lines_and_no_skip() {
        let mut ppu = Ppu::new(TvSystem::Pal);
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        ppu.cpu_write_register(0x2001, MASK_SHOW_BG, &mut mapper);
        assert_eq!(dots_until_frame(&mut ppu, &mut mapper), 341 * 312);
        assert_eq!(dots_until_frame(&mut ppu, &mut mapper), 341 * 312);
    }

    #[test]
    fn nmi_raised_once_per_frame() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        ppu.cpu_read_register(0x2002, &mut mapper);
        ppu.cpu_write_register(0x2000, CTRL_NMI_ENABLE, &mut mapper);
        let mut nmis = 0;
        for _ in 0..3 {
            ppu.clear_frame_ready();
            while !ppu.frame_ready() {
                ppu.tick(&mut mapper);
                if ppu.take_nmi() {
                    nmis += 1;
                    assert_eq!(ppu.position(), (VBLANK_LINE, 2));
                }
            }
        }
        assert_eq!(nmis, 3);
    }

    #[test]
    fn status_read_on_vblank_dot_suppresses_flag_and_nmi() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        ppu.cpu_read_register(0x2002, &mut mapper);
        ppu.cpu_write_register(0x2000, CTRL_NMI_ENABLE, &mut mapper);
        assert!(!ppu.take_nmi());
        while ppu.position() != (VBLANK_LINE, 1) {
            ppu.tick(&mut mapper);
        }
        let status = ppu.cpu_read_register(0x2002, &mut mapper);
        assert_eq!(status & STATUS_VBLANK, 0);
        ppu.tick(&mut mapper);
        assert!(!ppu.take_nmi());
        assert_eq!(ppu.status & STATUS_VBLANK, 0);
    }

    #[test]
    fn enabling_nmi_during_vblank_raises_it() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        while ppu.position() != (VBLANK_LINE + 2, 0) {
            ppu.tick(&mut mapper);
        }
        assert!(!ppu.take_nmi());
        ppu.cpu_write_register(0x2000, CTRL_NMI_ENABLE, &mut mapper);
        assert!(ppu.take_nmi());
    }

    #[test]
    fn status_read_returns_open_bus_low_bits() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        ppu.cpu_write_register(0x2003, 0x1F, &mut mapper);
        let status = ppu.cpu_read_register(0x2002, &mut mapper);
        assert_eq!(status & 0x1F, 0x1F);
        assert_eq!(ppu.cpu_read_register(0x2000, &mut mapper), status);
    }

    #[test]
    fn backdrop_follows_v_when_rendering_is_off() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        set_addr(&mut ppu, &mut mapper, 0x3F05);
        ppu.cpu_write_register(0x2007, 0x16, &mut mapper);
        set_addr(&mut ppu, &mut mapper, 0x3F05);
        dots_until_frame(&mut ppu, &mut mapper);
        let expected = NES_PALETTE[0x16];
        assert_eq!(&ppu.frame_buffer()[0..3], &expected);
        assert_eq!(ppu.frame_buffer()[3], 0xFF);
    }

    #[test]
    fn grayscale_and_emphasis() {
        let mut ppu = Ppu::default();
        ppu.mask = MASK_GRAYSCALE;
        assert_eq!(ppu.color_rgb(0x16), NES_PALETTE[0x10]);

        ppu.mask = MASK_EMPHASIZE_RED;
        let base = NES_PALETTE[0x20];
        let rgb = ppu.color_rgb(0x20);
        assert_eq!(rgb[0], base[0]);
        assert_eq!(rgb[1], (base[1] as f32 * EMPHASIS_ATTENUATION) as u8);
        assert_eq!(rgb[2], (base[2] as f32 * EMPHASIS_ATTENUATION) as u8);

        assert_eq!(ppu.color_rgb(0x0F), NES_PALETTE[0x0F]);
    }

    #[test]
    fn nametable_mirroring_modes() {
        assert_eq!(mirrored_vram_index(0x2400, Mirroring::Horizontal), 0x000);
        assert_eq!(mirrored_vram_index(0x2800, Mirroring::Horizontal), 0x400);
        assert_eq!(mirrored_vram_index(0x2800, Mirroring::Vertical), 0x000);
        assert_eq!(mirrored_vram_index(0x2C01, Mirroring::Vertical), 0x401);
        assert_eq!(mirrored_vram_index(0x2C01, Mirroring::OneScreenLower), 0x001);
        assert_eq!(mirrored_vram_index(0x2001, Mirroring::OneScreenUpper), 0x401);
        assert_eq!(mirrored_vram_index(0x2C01, Mirroring::FourScreen), 0xC01);
        assert_eq!(mirrored_vram_index(0x3001, Mirroring::FourScreen), 0x001);
    }

    fn run_to(ppu: &mut Ppu, mapper: &mut ChrRam, scanline: u16, dot: u16) {
        while ppu.position() != (scanline, dot) {
            ppu.tick(mapper);
        }
    }

    #[test]
    fn evaluation_fills_secondary_oam_and_flags_overflow() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        for i in 0..9 {
            ppu.oam[i * 4] = 10;
            ppu.oam[i * 4 + 1] = i as u8;
            ppu.oam[i * 4 + 3] = 20 + i as u8;
        }
        for i in 9..64 {
            ppu.oam[i * 4] = 0xF0;
        }
        ppu.cpu_write_register(0x2001, MASK_SHOW_SPRITES, &mut mapper);
        ppu.status = 0;
        run_to(&mut ppu, &mut mapper, 10, 258);

        assert_eq!(ppu.sprite_count, 8);
        assert!(ppu.sprite0_on_line);
        assert_eq!(&ppu.secondary_oam[28..32], &[10, 7, 0, 27]);
        assert_ne!(ppu.status & STATUS_SPRITE_OVERFLOW, 0);
    }

    #[test]
    fn eight_sprites_do_not_overflow() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        ppu.oam = [0xF0; 256];
        for i in 1..9 {
            ppu.oam[i * 4] = 50;
        }
        ppu.cpu_write_register(0x2001, MASK_SHOW_SPRITES, &mut mapper);
        ppu.status = 0;
        run_to(&mut ppu, &mut mapper, 50, 258);
        assert_eq!(ppu.sprite_count, 8);
        assert!(!ppu.sprite0_on_line);
        assert_eq!(ppu.status & STATUS_SPRITE_OVERFLOW, 0);
    }

    #[test]
    fn sprite_zero_hit_needs_opaque_background() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        // Tile 1 is solid colour 1 in both tables.
        for row in 0..8 {
            mapper.chr[0x10 + row] = 0xFF;
            mapper.chr[0x1010 + row] = 0xFF;
        }
        set_addr(&mut ppu, &mut mapper, 0x2000);
        for _ in 0..32 * 30 {
            ppu.cpu_write_register(0x2007, 1, &mut mapper);
        }
        ppu.oam = [0xF0; 256];
        ppu.oam[0] = 30;
        ppu.oam[1] = 1;
        ppu.oam[3] = 40;
        set_addr(&mut ppu, &mut mapper, 0x0000);
        ppu.cpu_write_register(0x2001, MASK_SHOW_SPRITES, &mut mapper);
        run_to(&mut ppu, &mut mapper, 40, 0);
        assert_eq!(ppu.status & STATUS_SPRITE_ZERO_HIT, 0);

        ppu.cpu_write_register(0x2001, MASK_SHOW_SPRITES | MASK_SHOW_BG, &mut mapper);
        dots_until_frame(&mut ppu, &mut mapper);
        assert_eq!(ppu.status & STATUS_SPRITE_ZERO_HIT, 0);
        run_to(&mut ppu, &mut mapper, 40, 0);
        assert_ne!(ppu.status & STATUS_SPRITE_ZERO_HIT, 0);
    }

    #[test]
    fn background_tile_pixel_zero_lands_on_column_zero() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        // Tile 1: only the leftmost column is opaque.
        for row in 0..8 {
            mapper.chr[0x10 + row] = 0x80;
        }
        set_addr(&mut ppu, &mut mapper, 0x2000);
        for _ in 0..32 * 30 {
            ppu.cpu_write_register(0x2007, 1, &mut mapper);
        }
        set_addr(&mut ppu, &mut mapper, 0x3F00);
        ppu.cpu_write_register(0x2007, 0x0F, &mut mapper);
        ppu.cpu_write_register(0x2007, 0x30, &mut mapper);
        set_addr(&mut ppu, &mut mapper, 0x0000);
        ppu.cpu_write_register(0x2001, MASK_SHOW_BG | MASK_SHOW_BG_LEFT, &mut mapper);

        for _ in 0..3 {
            dots_until_frame(&mut ppu, &mut mapper);
        }

        let white = NES_PALETTE[0x30];
        let lit: Vec<usize> = (0..FRAME_WIDTH)
            .filter(|&x| {
                let i = (100 * FRAME_WIDTH + x) * 4;
                ppu.frame_buffer()[i..i + 3] == white[..]
            })
            .collect();
        assert_eq!(lit.len(), 32);
        assert_eq!(&lit[..3], &[0, 8, 16]);
        assert!(lit.iter().all(|x| x % 8 == 0));
    }

    #[test]
    fn palette_reads_return_the_stored_byte() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        set_addr(&mut ppu, &mut mapper, 0x3F01);
        ppu.cpu_write_register(0x2007, 0xC5, &mut mapper);
        set_addr(&mut ppu, &mut mapper, 0x3F01);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0xC5);
    }

    #[test]
    fn oamdata_writes_increment_but_reads_do_not() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        ppu.cpu_write_register(0x2003, 0x10, &mut mapper);
        ppu.cpu_write_register(0x2004, 0xA1, &mut mapper);
        ppu.cpu_write_register(0x2004, 0xB2, &mut mapper);
        assert_eq!(ppu.oam_addr, 0x12);
        assert_eq!(ppu.debug_peek_oam(0x10), 0xA1);
        assert_eq!(ppu.debug_peek_oam(0x11), 0xB2);

        ppu.cpu_write_register(0x2003, 0x10, &mut mapper);
        assert_eq!(ppu.cpu_read_register(0x2004, &mut mapper), 0xA1);
        assert_eq!(ppu.cpu_read_register(0x2004, &mut mapper), 0xA1);
        assert_eq!(ppu.oam_addr, 0x10);

        ppu.cpu_write_register(0x2003, 0xFF, &mut mapper);
        ppu.cpu_write_register(0x2004, 0x5A, &mut mapper);
        assert_eq!(ppu.oam_addr, 0x00);
        assert_eq!(ppu.debug_peek_oam(0xFF), 0x5A);
    }

    #[test]
    fn chr_ram_round_trips_through_ppudata() {
        let mut ppu = Ppu::default();
        let mut mapper = ChrRam::new(Mirroring::Vertical);
        set_addr(&mut ppu, &mut mapper, 0x1FFE);
        ppu.cpu_write_register(0x2007, 0x3C, &mut mapper);
        ppu.cpu_write_register(0x2007, 0x7E, &mut mapper);
        assert_eq!(mapper.chr[0x1FFE], 0x3C);
        assert_eq!(mapper.chr[0x1FFF], 0x7E);

        set_addr(&mut ppu, &mut mapper, 0x1FFE);
        let _stale = ppu.cpu_read_register(0x2007, &mut mapper);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0x3C);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0x7E);
    }

    #[test]
    fn oam_dma_writes_from_oam_addr() {
        let mut ppu = Ppu::default();
        let mut bytes = [0u8; 256];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        ppu.write_oam_dma(&bytes);
        assert_eq!(ppu.oam, bytes);
        assert_eq!(ppu.oam_addr, 0);
    }
}
