//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_id: String,
    pub mqtt: MqttConfig,
    pub water: WaterConfig,
    pub led: LedConfig,
    pub soil: SoilConfig,
    pub weather: WeatherConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaterConfig {
    pub gpio_pin: i64,
    pub active_low: bool,
    pub duration_secs: i64,
    /// Hard safety ceiling for a single cycle, inclusive.
    pub max_duration_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedConfig {
    pub gpio_pin: i64,
    pub blink_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SoilConfig {
    pub power_gpio_pin: i64,
    pub adc_addr: u16,
    pub adc_channel: i64,
    /// Driest calibrated reading (numerically highest).
    pub raw_floor: i64,
    /// Wettest calibrated reading (numerically lowest).
    pub raw_ceiling: i64,
    pub settle_ms: u64,
    pub sample_every_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub i2c_addr: u16,
    pub sea_level_hpa: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub telemetry_every_secs: u64,
    pub outbound_capacity: usize,
    pub shutdown_grace_secs: u64,
    /// Allow `reboot` / `halt` commands to actually power-cycle the host.
    pub power_actions: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-a".into(),
            mqtt: MqttConfig::default(),
            water: WaterConfig::default(),
            led: LedConfig::default(),
            soil: SoilConfig::default(),
            weather: WeatherConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            keep_alive_secs: 6,
        }
    }
}

impl Default for WaterConfig {
    fn default() -> Self {
        Self {
            gpio_pin: 20,
            active_low: false,
            duration_secs: 8,
            max_duration_secs: 120,
        }
    }
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            gpio_pin: 21,
            blink_ms: 700,
        }
    }
}

impl Default for SoilConfig {
    fn default() -> Self {
        Self {
            power_gpio_pin: 12,
            adc_addr: 0x48,
            adc_channel: 0,
            raw_floor: 25000,
            raw_ceiling: 14000,
            settle_ms: 2000,
            sample_every_secs: 300,
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            i2c_addr: 0x77,
            sea_level_hpa: 1016.7,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            telemetry_every_secs: 300,
            outbound_capacity: 32,
            shutdown_grace_secs: 10,
            power_actions: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// BCM GPIO pins on the 40-pin header available for general use. GPIO 0-1
/// are reserved for the ID EEPROM; 28+ are not exposed.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Maximum single-ended reading from the ADS1115 (15-bit unsigned).
const ADS1115_MAX: i64 = 32767;

const ADS1115_MAX_CHANNEL: i64 = 3;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Returns `Ok(())` or an error listing every violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_identity(&mut errors);
        self.validate_pins(&mut errors);
        self.validate_water(&mut errors);
        self.validate_soil(&mut errors);

        if self.led.blink_ms == 0 {
            errors.push("led.blink_ms must be positive".into());
        }
        if !(800.0..=1100.0).contains(&self.weather.sea_level_hpa) {
            errors.push(format!(
                "weather.sea_level_hpa {} out of range [800, 1100]",
                self.weather.sea_level_hpa
            ));
        }
        if self.runtime.outbound_capacity == 0 {
            errors.push("runtime.outbound_capacity must be positive".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_identity(&self, errors: &mut Vec<String>) {
        if self.node_id.trim().is_empty() {
            errors.push("node_id is empty".into());
        } else if self.node_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "node_id '{}' must not contain '/', '+' or '#'",
                self.node_id
            ));
        }
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let pins = [
            ("water.gpio_pin", self.water.gpio_pin),
            ("led.gpio_pin", self.led.gpio_pin),
            ("soil.power_gpio_pin", self.soil.power_gpio_pin),
        ];
        let mut seen: HashMap<i64, &str> = HashMap::new();

        for (name, pin) in pins {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if let Some(other) = seen.insert(pin, name) {
                errors.push(format!("{name} {pin} is already used by {other}"));
            }
        }
    }

    fn validate_water(&self, errors: &mut Vec<String>) {
        let w = &self.water;
        if w.max_duration_secs <= 0 {
            errors.push(format!(
                "water.max_duration_secs must be positive, got {}",
                w.max_duration_secs
            ));
        }
        if w.duration_secs <= 0 {
            errors.push(format!(
                "water.duration_secs must be positive, got {}",
                w.duration_secs
            ));
        } else if w.max_duration_secs > 0 && w.duration_secs > w.max_duration_secs {
            errors.push(format!(
                "water.duration_secs ({}) exceeds max_duration_secs ({})",
                w.duration_secs, w.max_duration_secs
            ));
        }
    }

    fn validate_soil(&self, errors: &mut Vec<String>) {
        let s = &self.soil;
        if !(0..=ADS1115_MAX_CHANNEL).contains(&s.adc_channel) {
            errors.push(format!(
                "soil.adc_channel {} out of range (0-{ADS1115_MAX_CHANNEL})",
                s.adc_channel
            ));
        }
        for (name, raw) in [("raw_floor", s.raw_floor), ("raw_ceiling", s.raw_ceiling)] {
            if !(0..=ADS1115_MAX).contains(&raw) {
                errors.push(format!(
                    "soil.{name} {raw} out of ADS1115 range [0, {ADS1115_MAX}]"
                ));
            }
        }
        if s.raw_floor <= s.raw_ceiling {
            errors.push(format!(
                "soil.raw_floor ({}) must be greater than raw_ceiling ({})",
                s.raw_floor, s.raw_ceiling
            ));
        }
        if s.settle_ms == 0 {
            errors.push("soil.settle_ms must be positive".into());
        }
    }

    // -- Typed views used at startup ------------------------------------------

    pub fn blink_period(&self) -> Duration {
        Duration::from_millis(self.led.blink_ms)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.soil.settle_ms)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse `path` (stock defaults when the file does not exist), apply
/// `MQTT_HOST` / `MQTT_PORT` / `NODE_ID` overrides from `env`, then validate.
pub fn load(path: &str, env: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut config: Config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };

    if let Some(host) = env("MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Some(port) = env("MQTT_PORT") {
        config.mqtt.port = port
            .parse()
            .with_context(|| format!("invalid MQTT_PORT {port:?}"))?;
    }
    if let Some(id) = env("NODE_ID") {
        config.node_id = id;
    }

    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
