//! Bosch BME280 temperature / humidity / pressure sensor over I2C.
//!
//! Forced-mode reads with ×1 oversampling on every channel, compensated with
//! the floating-point formulas from the datasheet (section 8.1).

use anyhow::{ensure, Context, Result};
use rppal::i2c::I2c;
use std::{thread, time::Duration};

use super::{altitude_m, WeatherReading, WeatherSensor};

// ── Registers ───────────────────────────────────────────────────────────────

const REG_CHIP_ID: u8 = 0xD0;
const REG_CALIB_TP: u8 = 0x88; // 0x88..=0xA1
const REG_CALIB_H: u8 = 0xE1; // 0xE1..=0xE7
const REG_CTRL_HUM: u8 = 0xF2;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_DATA: u8 = 0xF7; // press[3] temp[3] hum[2]

const CHIP_ID: u8 = 0x60;

/// osrs_h = ×1
const CTRL_HUM: u8 = 0b001;
/// osrs_t = ×1, osrs_p = ×1, mode = forced
const CTRL_MEAS_FORCED: u8 = 0b001_001_01;

/// Max measurement time at ×1/×1/×1 is ~9.3 ms.
const MEASURE_WAIT: Duration = Duration::from_millis(10);

// ── Calibration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Calibration {
    t1: f64,
    t2: f64,
    t3: f64,
    p: [f64; 9],
    h1: f64,
    h2: f64,
    h3: f64,
    h4: f64,
    h5: f64,
    h6: f64,
}

fn u16_le(b: &[u8], i: usize) -> f64 {
    u16::from_le_bytes([b[i], b[i + 1]]) as f64
}

fn i16_le(b: &[u8], i: usize) -> f64 {
    i16::from_le_bytes([b[i], b[i + 1]]) as f64
}

impl Calibration {
    /// `tp` is the 26-byte block at 0x88, `h` the 7-byte block at 0xE1.
    fn parse(tp: &[u8; 26], h: &[u8; 7]) -> Self {
        let mut p = [0.0; 9];
        p[0] = u16_le(tp, 6);
        for (k, slot) in p.iter_mut().enumerate().skip(1) {
            *slot = i16_le(tp, 6 + 2 * k);
        }

        // H4 and H5 are 12-bit signed values sharing the nibbles of 0xE5.
        let h4 = ((h[3] as i8 as i16) << 4) | (h[4] & 0x0F) as i16;
        let h5 = ((h[5] as i8 as i16) << 4) | (h[4] >> 4) as i16;

        Self {
            t1: u16_le(tp, 0),
            t2: i16_le(tp, 2),
            t3: i16_le(tp, 4),
            p,
            h1: tp[25] as f64,
            h2: i16_le(h, 0),
            h3: h[2] as f64,
            h4: h4 as f64,
            h5: h5 as f64,
            h6: h[6] as i8 as f64,
        }
    }

    /// Returns (°C, t_fine).
    fn temperature(&self, adc_t: f64) -> (f64, f64) {
        let var1 = (adc_t / 16384.0 - self.t1 / 1024.0) * self.t2;
        let d = adc_t / 131072.0 - self.t1 / 8192.0;
        let var2 = d * d * self.t3;
        let t_fine = var1 + var2;
        (t_fine / 5120.0, t_fine)
    }

    /// Pascals.
    fn pressure(&self, adc_p: f64, t_fine: f64) -> f64 {
        let p = &self.p;
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * p[5] / 32768.0;
        var2 += var1 * p[4] * 2.0;
        var2 = var2 / 4.0 + p[3] * 65536.0;
        var1 = (p[2] * var1 * var1 / 524288.0 + p[1] * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * p[0];
        if var1 == 0.0 {
            return 0.0;
        }
        let mut pa = 1048576.0 - adc_p;
        pa = (pa - var2 / 4096.0) * 6250.0 / var1;
        let var1 = p[8] * pa * pa / 2147483648.0;
        let var2 = pa * p[7] / 32768.0;
        pa + (var1 + var2 + p[6]) / 16.0
    }

    /// Percent, clamped to 0..=100.
    fn humidity(&self, adc_h: f64, t_fine: f64) -> f64 {
        let mut h = t_fine - 76800.0;
        h = (adc_h - (self.h4 * 64.0 + self.h5 / 16384.0 * h))
            * (self.h2 / 65536.0
                * (1.0 + self.h6 / 67108864.0 * h * (1.0 + self.h3 / 67108864.0 * h)));
        h *= 1.0 - self.h1 * h / 524288.0;
        h.clamp(0.0, 100.0)
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct Bme280 {
    i2c: I2c,
    calib: Calibration,
    sea_level_hpa: f64,
}

impl Bme280 {
    pub fn new(addr: u16, sea_level_hpa: f64) -> Result<Self> {
        let mut i2c = I2c::new().context("open i2c bus")?;
        i2c.set_slave_address(addr)
            .with_context(|| format!("bme280 address 0x{addr:02x}"))?;

        let mut id = [0u8; 1];
        i2c.write_read(&[REG_CHIP_ID], &mut id)
            .context("bme280: read chip id")?;
        ensure!(id[0] == CHIP_ID, "bme280: unexpected chip id 0x{:02x}", id[0]);

        let mut tp = [0u8; 26];
        i2c.write_read(&[REG_CALIB_TP], &mut tp)
            .context("bme280: read calibration")?;
        let mut h = [0u8; 7];
        i2c.write_read(&[REG_CALIB_H], &mut h)
            .context("bme280: read humidity calibration")?;

        tracing::info!(
            addr = format_args!("0x{addr:02x}"),
            sea_level_hpa,
            "bme280 initialised"
        );

        Ok(Self {
            i2c,
            calib: Calibration::parse(&tp, &h),
            sea_level_hpa,
        })
    }
}

impl WeatherSensor for Bme280 {
    fn read(&mut self) -> Result<WeatherReading> {
        // ctrl_hum only takes effect after a write to ctrl_meas.
        self.i2c.write(&[REG_CTRL_HUM, CTRL_HUM])?;
        self.i2c
            .write(&[REG_CTRL_MEAS, CTRL_MEAS_FORCED])
            .context("bme280: trigger measurement")?;
        thread::sleep(MEASURE_WAIT);

        let mut d = [0u8; 8];
        self.i2c
            .write_read(&[REG_DATA], &mut d)
            .context("bme280: read data")?;

        let adc_p = ((d[0] as u32) << 12 | (d[1] as u32) << 4 | (d[2] as u32) >> 4) as f64;
        let adc_t = ((d[3] as u32) << 12 | (d[4] as u32) << 4 | (d[5] as u32) >> 4) as f64;
        let adc_h = ((d[6] as u32) << 8 | d[7] as u32) as f64;

        let (temperature, t_fine) = self.calib.temperature(adc_t);
        let pressure = self.calib.pressure(adc_p, t_fine) / 100.0;

        Ok(WeatherReading {
            temperature,
            humidity: self.calib.humidity(adc_h, t_fine),
            pressure,
            altitude: altitude_m(pressure, self.sea_level_hpa),
        })
    }
}
