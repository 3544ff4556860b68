//! Soil moisture probe controller.
//!
//! The probe corrodes if left powered, so this controller owns its power
//! rail outright: every sample powers it on, waits for it to settle, reads
//! once and powers it off again, all under one lock. Concurrent callers queue
//! on that lock (FIFO) and are served in turn. There is no way to switch the
//! rail from outside.

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::ControlError;
use crate::hw::{AnalogInput, DigitalOutput};

/// Idle wake-up when autonomous sampling is disabled.
const IDLE_WAKE: Duration = Duration::from_secs(3);

/// Two-point linear mapping from raw ADC counts to percent moisture.
///
/// Higher raw means more resistance, i.e. drier: `floor` is the driest
/// calibrated reading, `ceiling` the wettest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub floor: i32,
    pub ceiling: i32,
}

impl Calibration {
    pub fn percent(&self, raw: i32) -> f64 {
        if raw >= self.floor {
            0.0
        } else if raw <= self.ceiling {
            100.0
        } else {
            100.0 * (self.floor - raw) as f64 / (self.floor - self.ceiling) as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SoilReading {
    pub raw: i32,
    /// 0–100, 100 = wettest.
    pub percent: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct SoilSettings {
    pub calibration: Calibration,
    pub settle: Duration,
    /// `None` disables autonomous sampling.
    pub sample_every: Option<Duration>,
}

struct Probe {
    power: Box<dyn DigitalOutput>,
    adc: Box<dyn AnalogInput>,
}

pub struct SoilController {
    probe: Mutex<Probe>,
    last: RwLock<Option<SoilReading>>,
    terminated: AtomicBool,
    wake: Notify,
    settings: SoilSettings,
}

impl SoilController {
    /// Drives the power rail OFF before returning.
    pub fn new(
        mut power: Box<dyn DigitalOutput>,
        adc: Box<dyn AnalogInput>,
        settings: SoilSettings,
    ) -> Result<Self> {
        power.set(false)?;
        Ok(Self {
            probe: Mutex::new(Probe { power, adc }),
            last: RwLock::new(None),
            terminated: AtomicBool::new(false),
            wake: Notify::new(),
            settings,
        })
    }

    /// Take one calibrated reading. Blocks for the settle time, plus however
    /// long any earlier callers hold the probe.
    pub async fn sample(&self) -> Result<SoilReading, ControlError> {
        let mut probe = self.probe.lock().await;
        if self.terminated.load(Ordering::SeqCst) {
            return Err(ControlError::Terminated);
        }

        let raw = match probe.power.set(true) {
            Ok(()) => {
                sleep(self.settings.settle).await;
                probe.adc.read_raw()
            }
            Err(e) => Err(e),
        };
        // power goes off before the lock is released, whatever happened above
        let off = probe.power.set(false);
        drop(probe);

        let raw = raw?;
        off?;

        let reading = SoilReading {
            raw,
            percent: self.settings.calibration.percent(raw),
            ts: OffsetDateTime::now_utc(),
        };
        *self.last.write().await = Some(reading);
        debug!(raw, percent = reading.percent, "soil sampled");
        Ok(reading)
    }

    /// Value retained from the most recent successful sample.
    pub async fn last_reading(&self) -> Option<SoilReading> {
        *self.last.read().await
    }

    /// Turning the probe on or off is never allowed from outside.
    pub fn set_power(&self, on: bool) -> Result<(), ControlError> {
        debug!(on, "denied external soil power request");
        Err(ControlError::ActionDenied)
    }

    /// Refuse new samples. An in-flight sample finishes first, since this
    /// waits for the probe lock. Idempotent.
    pub async fn terminate(&self) {
        let _probe = self.probe.lock().await;
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    /// Autonomous sampling loop; keeps [`last_reading`](Self::last_reading)
    /// fresh. Hardware errors are logged and retried on the next period.
    pub async fn run(&self) -> Result<()> {
        info!(
            every_secs = self.settings.sample_every.map(|d| d.as_secs()),
            settle_ms = self.settings.settle.as_millis() as u64,
            "soil worker started"
        );

        while !self.terminated.load(Ordering::SeqCst) {
            let Some(period) = self.settings.sample_every else {
                let _ = timeout(IDLE_WAKE, self.wake.notified()).await;
                continue;
            };
            if timeout(period, self.wake.notified()).await.is_ok() {
                // woken early: only shutdown notifies
                continue;
            }
            match self.sample().await {
                Ok(r) => info!(raw = r.raw, percent = %format_args!("{:.1}", r.percent), "soil reading"),
                Err(ControlError::Terminated) => break,
                Err(e) => error!("soil sample failed: {e}"),
            }
        }

        // belt and braces: the rail is already off outside sample()
        let mut probe = self.probe.lock().await;
        if let Err(e) = probe.power.set(false) {
            warn!("soil power off on shutdown failed: {e:#}");
        }
        info!("soil worker stopped");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
