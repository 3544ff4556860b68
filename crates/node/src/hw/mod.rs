//! Hardware seams. Controllers only see these traits; the `hw` feature wires
//! in rppal-backed drivers, the default `sim` feature wires in simulators and
//! logging mock pins.

use anyhow::Result;
use serde::Serialize;

#[cfg(feature = "hw")]
pub mod ads1115;
#[cfg(feature = "hw")]
pub mod bme280;
#[cfg(feature = "hw")]
pub mod gpio;
pub mod mock;
#[cfg(feature = "sim")]
pub mod sim;

/// A single on/off output (relay, LED, sensor power rail).
pub trait DigitalOutput: Send {
    fn set(&mut self, on: bool) -> Result<()>;
}

/// A single analog channel returning raw ADC counts.
pub trait AnalogInput: Send {
    fn read_raw(&mut self) -> Result<i32>;
}

/// Combined temperature / humidity / pressure sensor.
pub trait WeatherSensor: Send {
    fn read(&mut self) -> Result<WeatherReading>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeatherReading {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity, percent.
    pub humidity: f64,
    /// Hectopascals.
    pub pressure: f64,
    /// Metres above the configured sea-level pressure.
    pub altitude: f64,
}

/// Barometric altitude in metres for `pressure_hpa` against `sea_level_hpa`.
pub fn altitude_m(pressure_hpa: f64, sea_level_hpa: f64) -> f64 {
    44330.0 * (1.0 - (pressure_hpa / sea_level_hpa).powf(0.1903))
}

/// Everything the node drives, built once at startup.
pub struct Hardware {
    pub valve: Box<dyn DigitalOutput>,
    pub led: Box<dyn DigitalOutput>,
    pub soil_power: Box<dyn DigitalOutput>,
    pub soil_adc: Box<dyn AnalogInput>,
    pub weather: Box<dyn WeatherSensor>,
}
