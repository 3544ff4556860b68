//! ADS1115 16-bit ADC over I2C, one single-ended channel for the soil probe.
//!
//! Single-shot reads at PGA ±4.096 V, 128 SPS. The probe's raw floor/ceiling
//! in `node.toml` (`raw_floor ≈ 25000`, `raw_ceiling ≈ 14000`) assume this
//! gain.

use anyhow::{ensure, Context, Result};
use rppal::i2c::I2c;
use std::{thread, time::Duration};

use super::AnalogInput;

// ── Registers ───────────────────────────────────────────────────────────────

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;

// Config register layout (MSB first):
//   [15] OS  [14:12] MUX  [11:9] PGA  [8] MODE  [7:5] DR  [4:0] comparator

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot), DR=100 (128 SPS),
/// COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

const MUX_SHIFT: u8 = 12;
/// AINx vs GND for x = 0..=3.
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

pub const MAX_CHANNEL: u8 = 3;

/// ~7.8 ms conversion at 128 SPS.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Conversion-ready flag when reading the config register.
const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel as usize] << MUX_SHIFT)
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct Ads1115 {
    i2c: I2c,
    channel: u8,
}

impl Ads1115 {
    /// Open I2C bus 1 and address the ADS1115 at `addr`.
    pub fn new(addr: u16, channel: u8) -> Result<Self> {
        ensure!(
            channel <= MAX_CHANNEL,
            "ADS1115 channel {channel} out of range (0–{MAX_CHANNEL})"
        );

        let mut i2c = I2c::new().context("open i2c bus")?;
        i2c.set_slave_address(addr)
            .with_context(|| format!("ads1115 address 0x{addr:02x}"))?;

        tracing::info!(
            addr = format_args!("0x{addr:02x}"),
            channel,
            "ads1115 initialised"
        );

        Ok(Self { i2c, channel })
    }
}

impl AnalogInput for Ads1115 {
    fn read_raw(&mut self) -> Result<i32> {
        let config = config_for_channel(self.channel);
        self.i2c
            .block_write(REG_CONFIG, &config.to_be_bytes())
            .context("ads1115: start conversion")?;

        thread::sleep(CONVERSION_WAIT);

        // One wait is normally enough at 128 SPS; poll OS briefly in case.
        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c
            .block_read(REG_CONVERSION, &mut buf)
            .context("ads1115: read conversion")?;

        // Single-ended reads are non-negative; clamp against bus corruption.
        Ok((i16::from_be_bytes(buf) as i32).clamp(0, 32767))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_register_per_channel() {
        assert_eq!(config_for_channel(0), 0xC383);
        assert_eq!(config_for_channel(1), 0xD383);
        assert_eq!(config_for_channel(2), 0xE383);
        assert_eq!(config_for_channel(3), 0xF383);
    }

    #[test]
    fn config_base_fields() {
        assert_eq!((CONFIG_BASE >> 15) & 1, 1, "OS starts conversion");
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001, "PGA ±4.096 V");
        assert_eq!((CONFIG_BASE >> 8) & 1, 1, "single-shot");
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100, "128 SPS");
    }
}
