use anyhow::{Context, Result};
use std::{fmt, fs, path::Path};

pub const PALETTE_FILE_LEN: usize = 64 * 3;

pub type Palette = [[u8; 3]; 64];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaletteError {
    TooShort { len: usize },
}

impl fmt::Display for PaletteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(
                f,
                "palette file holds {len} bytes, expected at least {PALETTE_FILE_LEN}"
            ),
        }
    }
}

impl std::error::Error for PaletteError {}

/// 2C02 colours as RGB triples, indexed by the 6-bit palette RAM value.
pub const NES_PALETTE: Palette = [
    [84, 84, 84],
    [0, 30, 116],
    [8, 16, 144],
    [48, 0, 136],
    [68, 0, 100],
    [92, 0, 48],
    [84, 4, 0],
    [60, 24, 0],
    [32, 42, 0],
    [8, 58, 0],
    [0, 64, 0],
    [0, 60, 0],
    [0, 50, 60],
    [0, 0, 0],
    [0, 0, 0],
    [0, 0, 0],
    [152, 150, 152],
    [8, 76, 196],
    [48, 50, 236],
    [92, 30, 228],
    [136, 20, 176],
    [160, 20, 100],
    [152, 34, 32],
    [120, 60, 0],
    [84, 90, 0],
    [40, 114, 0],
    [8, 124, 0],
    [0, 118, 40],
    [0, 102, 120],
    [0, 0, 0],
    [0, 0, 0],
    [0, 0, 0],
    [236, 238, 236],
    [76, 154, 236],
    [120, 124, 236],
    [176, 98, 236],
    [228, 84, 236],
    [236, 88, 180],
    [236, 106, 100],
    [212, 136, 32],
    [160, 170, 0],
    [116, 196, 0],
    [76, 208, 32],
    [56, 204, 108],
    [56, 180, 204],
    [60, 60, 60],
    [0, 0, 0],
    [0, 0, 0],
    [236, 238, 236],
    [168, 204, 236],
    [188, 188, 236],
    [212, 178, 236],
    [236, 174, 236],
    [236, 174, 212],
    [236, 180, 176],
    [228, 196, 144],
    [204, 210, 120],
    [180, 222, 120],
    [168, 226, 144],
    [152, 226, 180],
    [160, 214, 228],
    [160, 162, 160],
    [0, 0, 0],
    [0, 0, 0],
];

/// Palette RAM contents observed on hardware right after power-up.
pub const POWER_UP_PALETTE_RAM: [u8; 32] = [
    0x09, 0x01, 0x00, 0x01, 0x00, 0x02, 0x02, 0x0D, 0x08, 0x10, 0x08, 0x24, 0x00, 0x00, 0x04, 0x2C,
    0x09, 0x01, 0x34, 0x03, 0x00, 0x04, 0x00, 0x14, 0x08, 0x3A, 0x00, 0x02, 0x00, 0x20, 0x2C, 0x08,
];

/// Reads the first 192 bytes of a `.pal` file. Longer files (emphasis
/// variants) are accepted and truncated.
pub fn parse_palette(bytes: &[u8]) -> Result<Palette, PaletteError> {
    if bytes.len() < PALETTE_FILE_LEN {
        return Err(PaletteError::TooShort { len: bytes.len() });
    }
    let mut palette = [[0u8; 3]; 64];
    for (entry, rgb) in palette.iter_mut().zip(bytes.chunks_exact(3)) {
        entry.copy_from_slice(rgb);
    }
    Ok(palette)
}

pub fn load_palette(path: &Path) -> Result<Palette> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read palette: {}", path.display()))?;
    parse_palette(&bytes).with_context(|| format!("invalid palette: {}", path.display()))
}
