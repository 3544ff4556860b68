//! Output pins via rppal GPIO (Raspberry Pi only).

use anyhow::{Context, Result};
use rppal::gpio::{Gpio, OutputPin};

use super::DigitalOutput;

pub struct GpioOutput {
    name: &'static str,
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
}

impl GpioOutput {
    pub fn new(gpio: &Gpio, name: &'static str, pin_num: u8, active_low: bool) -> Result<Self> {
        let pin = gpio
            .get(pin_num)
            .with_context(|| format!("{name}: gpio {pin_num} unavailable"))?
            .into_output();

        let mut out = Self {
            name,
            pin,
            active_low,
        };
        // Fail-safe: ensure "OFF" at startup
        out.drive(false);

        tracing::info!(name, gpio = pin_num, active_low, "gpio output initialised");
        Ok(out)
    }

    fn drive(&mut self, on: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }
}

impl DigitalOutput for GpioOutput {
    fn set(&mut self, on: bool) -> Result<()> {
        self.drive(on);
        tracing::debug!(name = self.name, "gpio set {}", if on { "ON" } else { "OFF" });
        Ok(())
    }
}

impl Drop for GpioOutput {
    fn drop(&mut self) {
        self.drive(false);
    }
}
