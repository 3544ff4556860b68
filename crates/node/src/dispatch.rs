//! Command dispatcher: turns an inbound `(topic, json)` pair into at most one
//! response by routing each recognised verb to the matching controller.
//!
//! Anything it does not understand (foreign node, unknown device, unknown
//! verb, bad JSON, bad argument) is dropped without a reply. The node hears
//! its own responses on the same topics, so echoing errors would loop.

use serde_json::{Map, Value};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::{ControlError, InterruptOutcome};
use crate::hw::WeatherReading;
use crate::led::LedController;
use crate::mqtt;
use crate::soil::SoilController;
use crate::water::WaterController;
use crate::weather::WeatherStation;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeatherField {
    Temp,
    Humidity,
    Altitude,
    Pressure,
}

impl WeatherField {
    pub fn key(self) -> &'static str {
        match self {
            Self::Temp => "temp",
            Self::Humidity => "humidity",
            Self::Altitude => "altitude",
            Self::Pressure => "pressure",
        }
    }

    fn pick(self, r: &WeatherReading) -> f64 {
        match self {
            Self::Temp => r.temperature,
            Self::Humidity => r.humidity,
            Self::Altitude => r.altitude,
            Self::Pressure => r.pressure,
        }
    }
}

/// Second segment of `sensors/<device>/<nodeId>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Weather(WeatherField),
    Soil,
    Water,
    Led,
    Info,
    Cmd,
}

impl DeviceKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "temp" => Self::Weather(WeatherField::Temp),
            "humidity" => Self::Weather(WeatherField::Humidity),
            "altitude" => Self::Weather(WeatherField::Altitude),
            "pressure" => Self::Weather(WeatherField::Pressure),
            "soil" => Self::Soil,
            "water" => Self::Water,
            "led" => Self::Led,
            "info" => Self::Info,
            "cmd" => Self::Cmd,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Set,
    SetTime,
    Get,
    DeviceState,
}

impl Verb {
    /// Processing order when one payload carries several verbs.
    pub const ORDER: [Verb; 4] = [Verb::Set, Verb::SetTime, Verb::Get, Verb::DeviceState];

    pub fn key(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::SetTime => "setTime",
            Self::Get => "get",
            Self::DeviceState => "deviceState",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub device: DeviceKind,
    pub verb: Verb,
    pub argument: Value,
}

/// Raw message handed over by the transport.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Reply queued for the transport; published once on `topic`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub topic: String,
    pub payload: Map<String, Value>,
}

/// Requested end of the process, consumed by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Disconnect,
    Reboot,
    Halt,
}

impl Termination {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "disconnect" => Some(Self::Disconnect),
            "reboot" => Some(Self::Reboot),
            "halt" | "off" => Some(Self::Halt),
            _ => None,
        }
    }

    fn status(self) -> &'static str {
        match self {
            Self::Disconnect => "disconnecting",
            Self::Reboot => "rebooting",
            Self::Halt => "halting",
        }
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Recognised verbs in processing order; empty for anything that is not a
/// JSON object.
pub fn parse_commands(device: DeviceKind, payload: &[u8]) -> Vec<Command> {
    let Ok(map) = serde_json::from_slice::<Map<String, Value>>(payload) else {
        return Vec::new();
    };
    Verb::ORDER
        .iter()
        .filter_map(|&verb| {
            map.get(verb.key()).map(|argument| Command {
                device,
                verb,
                argument: argument.clone(),
            })
        })
        .collect()
}

/// String argument, trimmed and lower-cased.
fn word(v: &Value) -> Option<String> {
    v.as_str().map(|s| s.trim().to_ascii_lowercase())
}

/// `setTime` accepts a JSON integer or an integer string.
fn seconds(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_u64().map(|_| i64::MAX)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn one(key: &str, value: impl Into<Value>) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert(key.to_string(), value.into());
    m
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn water_word(on: bool) -> &'static str {
    if on {
        "water on"
    } else {
        "water off"
    }
}

/// `HH:MM:SS` under a day. Past it, `N day(s), H:MM:SS` with the hour
/// unpadded.
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (h, m, s) = (rem / 3600, rem % 3600 / 60, rem % 60);
    match days {
        0 => format!("{h:02}:{m:02}:{s:02}"),
        1 => format!("1 day, {h}:{m:02}:{s:02}"),
        n => format!("{n} days, {h}:{m:02}:{s:02}"),
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Which soil value a bulk snapshot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoilSource {
    /// Power the probe and take a new sample.
    Fresh,
    /// Last retained sample, no hardware access.
    Retained,
}

pub struct Dispatcher {
    node_id: String,
    water: Arc<WaterController>,
    soil: Arc<SoilController>,
    led: Arc<LedController>,
    weather: Arc<WeatherStation>,
    pending_termination: Option<Termination>,
}

impl Dispatcher {
    pub fn new(
        node_id: String,
        water: Arc<WaterController>,
        soil: Arc<SoilController>,
        led: Arc<LedController>,
        weather: Arc<WeatherStation>,
    ) -> Self {
        Self {
            node_id,
            water,
            soil,
            led,
            weather,
            pending_termination: None,
        }
    }

    /// Consume a termination requested by a `deviceState` command.
    pub fn take_termination(&mut self) -> Option<Termination> {
        self.pending_termination.take()
    }

    pub async fn dispatch(&mut self, msg: &Inbound) -> Option<Response> {
        let Some(device) =
            mqtt::extract_device(&msg.topic, &self.node_id).and_then(DeviceKind::parse)
        else {
            debug!(topic = %msg.topic, "ignored topic");
            return None;
        };

        let mut result = None;
        for cmd in parse_commands(device, &msg.payload) {
            if let Some(payload) = self.execute(&cmd).await {
                result = Some(payload);
            }
        }

        match result {
            Some(payload) => Some(Response {
                topic: msg.topic.clone(),
                payload,
            }),
            None => {
                debug!(topic = %msg.topic, "ignored request");
                None
            }
        }
    }

    pub async fn execute(&mut self, cmd: &Command) -> Option<Map<String, Value>> {
        match cmd.device {
            DeviceKind::Weather(field) => self.weather_cmd(field, cmd).await,
            DeviceKind::Soil => self.soil_cmd(cmd).await,
            DeviceKind::Water => self.water_cmd(cmd).await,
            DeviceKind::Led => self.led_cmd(cmd),
            DeviceKind::Info => match (cmd.verb, word(&cmd.argument)?.as_str()) {
                (Verb::Get, "bulk") => Some(self.bulk(SoilSource::Fresh).await),
                _ => None,
            },
            DeviceKind::Cmd => self.node_cmd(cmd),
        }
    }

    async fn weather_cmd(&self, field: WeatherField, cmd: &Command) -> Option<Map<String, Value>> {
        match (cmd.verb, word(&cmd.argument)?.as_str()) {
            (Verb::Get, "status") => Some(one("status", "on")),
            (Verb::Get, "value") => match self.weather.read().await {
                Ok(r) => Some(one(field.key(), field.pick(&r))),
                Err(e) => {
                    warn!(device = field.key(), "weather read failed: {e}");
                    None
                }
            },
            (Verb::Set, "on" | "off") => Some(one("status", "ActionDenied")),
            _ => None,
        }
    }

    async fn soil_cmd(&self, cmd: &Command) -> Option<Map<String, Value>> {
        match (cmd.verb, word(&cmd.argument)?.as_str()) {
            (Verb::Get, "value" | "status" | "reading") => match self.soil.sample().await {
                Ok(r) => Some(one("value", r.percent)),
                Err(e) => {
                    warn!("soil sample failed: {e}");
                    None
                }
            },
            (Verb::Set, arg @ ("on" | "off")) => match self.soil.set_power(arg == "on") {
                Err(ControlError::ActionDenied) => Some(one("status", "ActionDenied")),
                _ => None,
            },
            _ => None,
        }
    }

    async fn water_cmd(&self, cmd: &Command) -> Option<Map<String, Value>> {
        if cmd.verb == Verb::SetTime {
            let Some(secs) = seconds(&cmd.argument) else {
                debug!(argument = %cmd.argument, "non-numeric watering time ignored");
                return None;
            };
            return Some(match self.water.set_duration(secs).await {
                Ok(n) => one("watering time", n),
                Err(ControlError::Busy) => one("notifyWait", "watering currently in-progress"),
                Err(e) => {
                    warn!("watering time rejected: {e}");
                    one("watering time", self.water.duration_secs().await)
                }
            });
        }

        match (cmd.verb, word(&cmd.argument)?.as_str()) {
            (Verb::Set, "on") => {
                self.water.activate().await;
                Some(one("status", "on"))
            }
            (Verb::Set, "off") => Some(one(
                "status",
                match self.water.interrupt().await {
                    InterruptOutcome::Interrupted => "water interrupted",
                    InterruptOutcome::NotRunning => "water already off",
                },
            )),
            (Verb::Set, "clear") => Some(one("current total", self.water.clear_cycle_total().await)),
            (Verb::Get, "status" | "state" | "value") => {
                Some(one("status", water_word(self.water.is_active().await)))
            }
            (Verb::Get, "cumulative") => {
                Some(one("cumulative total", self.water.cumulative_total().await))
            }
            (Verb::Get, "total") => Some(one("current total", self.water.cycle_total().await)),
            (Verb::Get, "time") => Some(one("watering set for", self.water.duration_secs().await)),
            _ => None,
        }
    }

    fn led_cmd(&self, cmd: &Command) -> Option<Map<String, Value>> {
        match (cmd.verb, word(&cmd.argument)?.as_str()) {
            (Verb::Set, arg @ ("on" | "off")) => {
                self.led.set_active(arg == "on");
                Some(one("status", arg))
            }
            (Verb::Get, "status" | "value") => Some(one("status", on_off(self.led.is_active()))),
            _ => None,
        }
    }

    fn node_cmd(&mut self, cmd: &Command) -> Option<Map<String, Value>> {
        match (cmd.verb, word(&cmd.argument)?.as_str()) {
            (Verb::Get, "uptime") => Some(one(
                "uptime",
                format_uptime(sysinfo::System::uptime()),
            )),
            (Verb::Get, "timestamp") => match OffsetDateTime::now_utc().format(&Rfc3339) {
                Ok(ts) => Some(one("ts", ts)),
                Err(e) => {
                    warn!("timestamp format failed: {e}");
                    None
                }
            },
            (Verb::DeviceState, arg) => {
                let t = Termination::parse(arg)?;
                info!(?t, "termination requested");
                self.pending_termination = Some(t);
                Some(one("status", t.status()))
            }
            _ => None,
        }
    }

    /// Every reading plus device states in one payload. Weather fields are
    /// `null` if the sensor fails, soil is `null` without a value.
    pub async fn bulk(&self, soil: SoilSource) -> Map<String, Value> {
        let mut m = Map::new();

        let weather = self.weather.read().await;
        if let Err(e) = &weather {
            warn!("weather read failed: {e}");
        }
        for field in [
            WeatherField::Temp,
            WeatherField::Humidity,
            WeatherField::Altitude,
            WeatherField::Pressure,
        ] {
            let v = weather.as_ref().map(|r| field.pick(r)).ok();
            m.insert(field.key().to_string(), v.into());
        }

        m.insert("led".into(), on_off(self.led.is_active()).into());

        let soil_pct = match soil {
            SoilSource::Fresh => match self.soil.sample().await {
                Ok(r) => Some(r.percent),
                Err(e) => {
                    warn!("soil sample failed: {e}");
                    None
                }
            },
            SoilSource::Retained => self.soil.last_reading().await.map(|r| r.percent),
        };
        m.insert("soil".into(), soil_pct.into());

        m.insert("water".into(), water_word(self.water.is_active().await).into());
        m
    }
}

// ===========================================================================
// Tests
// ===========================================================================
