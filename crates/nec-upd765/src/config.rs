//! Variant configuration.
//!
//! The uPD765 family differs mostly in wiring and register layout, so one
//! controller type covers all of them and a `Config` says which chip it is.
//!
//! | Preset | Registers | Ready line | Ready polling | DOR after reset | VERSION |
//! |---|---|---|---|---|---|
//! | `upd765a` | compact | drive | yes | `0x0C` | invalid |
//! | `i8272a` | compact | drive | yes | `0x0C` | invalid |
//! | `n82077aa` | full | external | yes | `0x00` | `0x90` |
//! | `smc37c78` | full | external | yes | `0x00` | `0x90` |
//! | `pc_fdc_superio` | full | external | no | `0x00` | `0x90` |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Data rates selected by DSR/CCR bits 0-1.
pub const RATES: [u32; 4] = [500_000, 300_000, 250_000, 1_000_000];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown controller preset '{0}'")]
    UnknownPreset(String),
    #[error("data rate {0} bit/s is not one the controller can select")]
    InvalidRate(u32),
}

/// Host interface mode, latched at reset on chips that support several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// PC/AT: DOR bit 3 gates the interrupt and DMA request.
    At,
    Ps2,
    /// Model 30: inverted status register A.
    M30,
}

/// Which host registers exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterMap {
    /// Offset 0 MSR, 1 data. The original uPD765 and 8272.
    Compact,
    /// 82077-style: SRA, SRB, DOR, TDR, MSR/DSR, data, (none), DIR/CCR.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Drive READY lines are wired. Otherwise [`crate::Upd765::set_ready`]
    /// supplies the level.
    pub ready_connected: bool,
    /// Ready changes are polled every 1024 µs and raise an interrupt.
    pub ready_polled: bool,
    /// Drive select lines are wired. Otherwise only drive 0 is reachable.
    pub select_connected: bool,
    pub mode: Mode,
    pub registers: RegisterMap,
    pub dor_reset: u8,
    /// Response byte for VERSION; `None` makes the opcode invalid.
    pub version: Option<u8>,
    /// Data rate before the host programs DSR or CCR.
    pub default_rate: u32,
}

impl Config {
    #[must_use]
    pub fn upd765a() -> Self {
        Self {
            ready_connected: true,
            ready_polled: true,
            select_connected: true,
            mode: Mode::At,
            registers: RegisterMap::Compact,
            dor_reset: 0x0C,
            version: None,
            default_rate: 250_000,
        }
    }

    #[must_use]
    pub fn i8272a() -> Self {
        Self::upd765a()
    }

    #[must_use]
    pub fn n82077aa() -> Self {
        Self {
            ready_connected: false,
            registers: RegisterMap::Full,
            dor_reset: 0x00,
            version: Some(0x90),
            ..Self::upd765a()
        }
    }

    #[must_use]
    pub fn smc37c78() -> Self {
        Self::n82077aa()
    }

    #[must_use]
    pub fn pc_fdc_superio() -> Self {
        Self {
            ready_polled: false,
            ..Self::n82077aa()
        }
    }

    /// Look a preset up by name.
    pub fn preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "upd765a" | "upd765b" => Ok(Self::upd765a()),
            "i8272a" => Ok(Self::i8272a()),
            "n82077aa" => Ok(Self::n82077aa()),
            "smc37c78" => Ok(Self::smc37c78()),
            "pc_fdc_superio" => Ok(Self::pc_fdc_superio()),
            _ => Err(ConfigError::UnknownPreset(name.to_string())),
        }
    }

    /// Parse a JSON configuration. Missing fields take the `upd765a` values.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if RATES.contains(&self.default_rate) {
            Ok(())
        } else {
            Err(ConfigError::InvalidRate(self.default_rate))
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::upd765a()
    }
}
