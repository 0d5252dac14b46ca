use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::{
    bus::{MAX_GRANULARITY, MIN_GRANULARITY},
    port::PortMode,
};

/// Shape of an emulated computer. Everything here is checked again when a
/// snapshot is restored, so changing a field makes old snapshots
/// incompatible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputerConfig {
    /// Architecture discriminator written into snapshots.
    pub id: String,
    pub address_bits: u32,
    pub block_granularity: u32,
    pub port_mode: PortMode,
    pub clock_speed_hz: u64,
    /// Base RAM in KB.
    pub base_ram: u32,
    pub turbo: bool,
}

impl Default for ComputerConfig {
    fn default() -> Self {
        Self {
            id: "generic".to_string(),
            address_bits: 16,
            block_granularity: 1024,
            port_mode: PortMode::ByteLow,
            clock_speed_hz: 4_000_000,
            base_ram: 64,
            turbo: false,
        }
    }
}

impl ComputerConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: ComputerConfig =
            serde_json::from_str(json).context("invalid computer configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let g = self.block_granularity;
        if !g.is_power_of_two() || !(MIN_GRANULARITY..=MAX_GRANULARITY).contains(&g) {
            bail!(
                "block granularity {:#X} must be a power of two between {:#X} and {:#X}",
                g,
                MIN_GRANULARITY,
                MAX_GRANULARITY
            );
        }
        if !(1..=32).contains(&self.address_bits) {
            bail!("address width {} out of range (1-32)", self.address_bits);
        }
        if self.clock_speed_hz == 0 {
            bail!("clock speed must be non-zero");
        }
        if self.base_ram == 0 {
            bail!("base RAM must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ComputerConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config =
            ComputerConfig::from_json(r#"{"id": "pc-xt", "address_bits": 20, "port_mode": "WORD"}"#)
                .unwrap();
        assert_eq!(config.id, "pc-xt");
        assert_eq!(config.address_bits, 20);
        assert_eq!(config.port_mode, PortMode::Word);
        assert_eq!(config.block_granularity, 1024);
    }

    #[test]
    fn rejects_bad_granularity() {
        for g in [0, 4, 1000, 0x20000] {
            let config = ComputerConfig {
                block_granularity: g,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "granularity {:#X}", g);
        }
        assert!(ComputerConfig::from_json(r#"{"clock_speed_hz": 0}"#).is_err());
    }
}
