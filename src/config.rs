use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::nes::TvSystem;

pub const DEFAULT_CONFIG_FILE: &str = "famicore.json";
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// How to treat cartridges carrying an NES 2.0 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nes2Policy {
    /// Load using only the iNES 1.0 fields and log a warning.
    #[default]
    BestEffort,
    Reject,
}

/// Length of the CPU stall after a write to `$4014`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmaStall {
    /// Always 513 cycles.
    #[default]
    Fixed,
    /// 513 cycles, plus one when the DMA starts on an odd CPU cycle.
    CycleParity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub tv_system: Option<TvSystem>,
    pub palette: Option<PathBuf>,
    pub nes2_headers: Nes2Policy,
    pub oam_dma_stall: DmaStall,
    pub audio_sample_rate: u32,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            tv_system: None,
            palette: None,
            nes2_headers: Nes2Policy::default(),
            oam_dma_stall: DmaStall::default(),
            audio_sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl EmulatorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config: {}", path.display()))
    }

    /// Loads `path` when it exists, otherwise falls back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
