//! Simulated sensors for running the node off-target.
//!
//! The soil probe models a capacitive sensor: random walk with mean
//! reversion, slow drying drift, per-read ADC noise, occasional spikes and a
//! closed-loop response to the (mock) water valve being open.

use anyhow::Result;
use std::fmt;

use super::mock::PinProbe;
use super::{altitude_m, AnalogInput, WeatherReading, WeatherSensor};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6 ≈ N(0,1).
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Soil profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mid-range start, slow drift toward dry, ~3% spikes.
    Drying,
    /// Hovers near the centre, low noise.
    Stable,
    /// High noise, ~10% spikes.
    Flaky,
    /// Starts near the wet end and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Soil probe
// ---------------------------------------------------------------------------

pub struct SimSoil {
    /// Current "true" moisture in ADC units.
    base: f64,
    raw_floor: f64,
    raw_ceiling: f64,
    center: f64,

    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,

    /// Watering pulls the reading toward the wet (low) end.
    valve: Option<PinProbe>,
    wet_rate: f64,
}

impl SimSoil {
    /// `raw_floor` is the dry (high) end, `raw_ceiling` the wet (low) end.
    pub fn new(scenario: Scenario, raw_floor: f64, raw_ceiling: f64) -> Self {
        let range = raw_floor - raw_ceiling;

        // start_frac: 0.0 = wettest, 1.0 = driest
        let (drift, walk_sigma, mean_reversion, noise_sigma, spike_prob, spike_sigma, start_frac) =
            match scenario {
                Scenario::Drying => (15.0, 150.0, 0.02, 80.0, 0.03_f32, 2000.0, 0.5),
                Scenario::Stable => (2.0, 60.0, 0.05, 40.0, 0.005, 1000.0, 0.5),
                Scenario::Flaky => (10.0, 250.0, 0.02, 200.0, 0.10, 3000.0, 0.5),
                Scenario::Wet => (3.0, 80.0, 0.02, 60.0, 0.02, 1500.0, 0.2),
            };

        let start = raw_ceiling + start_frac * range + gaussian(0.0, range * 0.03);

        tracing::info!(%scenario, "simulated soil probe");

        Self {
            base: start.clamp(raw_ceiling, raw_floor),
            raw_floor,
            raw_ceiling,
            center: (raw_floor + raw_ceiling) / 2.0,
            drift,
            walk_sigma,
            mean_reversion,
            noise_sigma,
            spike_prob,
            spike_sigma,
            valve: None,
            wet_rate: -300.0,
        }
    }

    /// Couple the probe to the valve so readings fall while it is open.
    pub fn with_valve(mut self, valve: PinProbe) -> Self {
        self.valve = Some(valve);
        self
    }

    fn next(&mut self) -> i32 {
        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = match &self.valve {
            Some(v) if v.is_on() => self.wet_rate,
            _ => 0.0,
        };

        self.base = (self.base + self.drift + pull + walk + wet)
            .clamp(self.raw_ceiling - 500.0, self.raw_floor + 500.0);

        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        (self.base + noise + spike).round().clamp(0.0, 32767.0) as i32
    }
}

impl AnalogInput for SimSoil {
    fn read_raw(&mut self) -> Result<i32> {
        Ok(self.next())
    }
}

// ---------------------------------------------------------------------------
// Weather
// ---------------------------------------------------------------------------

pub struct SimWeather {
    temperature: f64,
    humidity: f64,
    pressure: f64,
    sea_level_hpa: f64,
}

impl SimWeather {
    pub fn new(sea_level_hpa: f64) -> Self {
        Self {
            temperature: 18.0,
            humidity: 55.0,
            pressure: sea_level_hpa - 12.0,
            sea_level_hpa,
        }
    }
}

impl WeatherSensor for SimWeather {
    fn read(&mut self) -> Result<WeatherReading> {
        self.temperature = (self.temperature + gaussian(0.0, 0.2)).clamp(-10.0, 45.0);
        self.humidity = (self.humidity + gaussian(0.0, 0.5)).clamp(5.0, 100.0);
        self.pressure = (self.pressure + gaussian(0.0, 0.1)).clamp(950.0, 1050.0);

        Ok(WeatherReading {
            temperature: self.temperature,
            humidity: self.humidity,
            pressure: self.pressure,
            altitude: altitude_m(self.pressure, self.sea_level_hpa),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::MockPin;
    use crate::hw::DigitalOutput;

    fn mean(sim: &mut SimSoil, n: usize) -> f64 {
        (0..n).map(|_| sim.read_raw().unwrap() as f64).sum::<f64>() / n as f64
    }

    #[test]
    fn readings_within_adc_range() {
        let mut sim = SimSoil::new(Scenario::Flaky, 25000.0, 14000.0);
        for _ in 0..500 {
            let v = sim.read_raw().unwrap();
            assert!((0..=32767).contains(&v), "ADC out of range: {v}");
        }
    }

    #[test]
    fn stable_readings_are_coherent() {
        let mut sim = SimSoil::new(Scenario::Stable, 25000.0, 14000.0);
        let samples: Vec<i32> = (0..100).map(|_| sim.read_raw().unwrap()).collect();
        let max_jump = samples.windows(2).map(|w| (w[1] - w[0]).abs()).max().unwrap();
        assert!(max_jump < 5000, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn open_valve_makes_soil_wetter() {
        let mut valve = MockPin::new("valve", 20);
        let mut sim =
            SimSoil::new(Scenario::Drying, 25000.0, 14000.0).with_valve(valve.probe());

        for _ in 0..20 {
            sim.read_raw().unwrap();
        }
        let before = mean(&mut sim, 20);

        valve.set(true).unwrap();
        for _ in 0..50 {
            sim.read_raw().unwrap();
        }
        let after = mean(&mut sim, 20);

        assert!(
            after < before,
            "watering should lower readings: before={before:.0} after={after:.0}"
        );
    }

    #[test]
    fn wet_scenario_starts_low() {
        let mut sim = SimSoil::new(Scenario::Wet, 25000.0, 14000.0);
        let avg = mean(&mut sim, 10);
        assert!(avg < 19500.0, "wet scenario should start below midpoint: {avg:.0}");
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Drying);
        assert_eq!(Scenario::Wet.to_string(), "wet");
    }

    #[test]
    fn weather_stays_plausible() {
        let mut w = SimWeather::new(1016.7);
        for _ in 0..200 {
            let r = w.read().unwrap();
            assert!((-10.0..=45.0).contains(&r.temperature));
            assert!((5.0..=100.0).contains(&r.humidity));
            assert!((950.0..=1050.0).contains(&r.pressure));
            assert!(r.altitude.is_finite());
        }
    }
}
