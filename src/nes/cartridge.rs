use anyhow::{Context, Result};
use std::{fmt, fs, path::Path};
use tracing::{info, warn};

use super::TvSystem;
use super::mapper::Mirroring;
use crate::config::Nes2Policy;

pub const HEADER_LEN: usize = 16;
pub const TRAINER_LEN: usize = 512;
pub const PRG_UNIT: usize = 16 * 1024;
pub const CHR_UNIT: usize = 8 * 1024;
pub const PRG_RAM_UNIT: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartridgeError {
    InvalidMagic,
    Truncated {
        section: &'static str,
        expected: usize,
        available: usize,
    },
    UnsupportedFormat,
    UnsupportedMapper(u16),
    EmptyPrgRom,
}

impl fmt::Display for CartridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid iNES header magic, expected NES<EOF>"),
            Self::Truncated {
                section,
                expected,
                available,
            } => write!(
                f,
                "ROM truncated: {section} needs {expected} bytes but only {available} remain"
            ),
            Self::UnsupportedFormat => write!(f, "NES 2.0 headers are rejected by configuration"),
            Self::UnsupportedMapper(id) => write!(f, "mapper {id} is not supported"),
            Self::EmptyPrgRom => write!(f, "invalid PRG ROM: empty payload"),
        }
    }
}

impl std::error::Error for CartridgeError {}

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u16,
    pub mirroring: Mirroring,
    pub has_battery_backed_ram: bool,
    pub has_trainer: bool,
    pub vs_unisystem: bool,
    pub playchoice10: bool,
    pub is_nes2: bool,
    pub tv_system: TvSystem,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
    pub prg_ram_size: usize,
}

impl Cartridge {
    pub fn from_file(path: &Path, policy: Nes2Policy) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes, policy)
            .with_context(|| format!("failed to load ROM: {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8], policy: Nes2Policy) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(CartridgeError::Truncated {
                section: "header",
                expected: HEADER_LEN,
                available: bytes.len(),
            }
            .into());
        }
        if &bytes[0..4] != b"NES\x1A" {
            return Err(CartridgeError::InvalidMagic.into());
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let is_nes2 = (flags7 & 0x0C) == 0x08;
        if is_nes2 {
            match policy {
                Nes2Policy::Reject => return Err(CartridgeError::UnsupportedFormat.into()),
                Nes2Policy::BestEffort => {
                    warn!("NES 2.0 header detected, extended fields are ignored");
                }
            }
        }

        let mut mapper_id = ((flags6 as u16) >> 4) | ((flags7 as u16) & 0xF0);
        // Camerica boards behave like UxROM for everything emulated here.
        if mapper_id == 71 {
            mapper_id = 2;
        }

        let mirroring = if (flags6 & 0x08) != 0 {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };
        let has_battery_backed_ram = (flags6 & 0x02) != 0;
        let has_trainer = (flags6 & 0x04) != 0;

        let prg_rom_size = bytes[4] as usize * PRG_UNIT;
        let chr_rom_size = bytes[5] as usize * CHR_UNIT;
        let prg_ram_size = bytes[8].max(1) as usize * PRG_RAM_UNIT;
        let tv_system = if (bytes[9] & 0x01) != 0 {
            TvSystem::Pal
        } else {
            TvSystem::Ntsc
        };

        if prg_rom_size == 0 {
            return Err(CartridgeError::EmptyPrgRom.into());
        }

        let mut cursor = HEADER_LEN;
        if has_trainer {
            warn!("skipping 512-byte trainer");
            cursor += TRAINER_LEN;
        }

        let prg_rom = take_section(bytes, cursor, prg_rom_size, "PRG ROM")?.to_vec();
        cursor += prg_rom_size;

        let (chr_data, chr_is_ram) = if chr_rom_size == 0 {
            (vec![0; CHR_UNIT], true)
        } else {
            (
                take_section(bytes, cursor, chr_rom_size, "CHR ROM")?.to_vec(),
                false,
            )
        };

        let cart = Self {
            mapper_id,
            mirroring,
            has_battery_backed_ram,
            has_trainer,
            vs_unisystem: (flags7 & 0x01) != 0,
            playchoice10: (flags7 & 0x02) != 0,
            is_nes2,
            tv_system,
            prg_rom,
            chr_data,
            chr_is_ram,
            prg_ram_size,
        };
        info!(
            mapper = cart.mapper_id,
            prg_kb = cart.prg_rom.len() / 1024,
            chr_kb = cart.chr_data.len() / 1024,
            chr_ram = cart.chr_is_ram,
            mirroring = ?cart.mirroring,
            tv_system = ?cart.tv_system,
            "parsed iNES header"
        );
        Ok(cart)
    }
}

fn take_section<'a>(
    bytes: &'a [u8],
    start: usize,
    len: usize,
    section: &'static str,
) -> Result<&'a [u8], CartridgeError> {
    bytes
        .get(start..start + len)
        .ok_or(CartridgeError::Truncated {
            section,
            expected: len,
            available: bytes.len().saturating_sub(start),
        })
}
