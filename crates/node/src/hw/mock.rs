//! In-memory output pins. Used for every output when running without the
//! `hw` feature (state changes are logged, nothing is wired) and by the
//! controller tests, which watch the pin through a [`PinProbe`].

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::DigitalOutput;

#[derive(Default)]
struct PinLog {
    on: AtomicBool,
    rising_edges: AtomicU32,
    /// `set(true)` while already on. Each one is a second overlapping
    /// power window.
    double_on: AtomicU32,
    fail_on: AtomicBool,
}

/// Read-only handle onto a [`MockPin`]'s recorded state.
#[derive(Clone, Default)]
pub struct PinProbe(Arc<PinLog>);

impl PinProbe {
    pub fn is_on(&self) -> bool {
        self.0.on.load(Ordering::SeqCst)
    }

    pub fn rising_edges(&self) -> u32 {
        self.0.rising_edges.load(Ordering::SeqCst)
    }

    pub fn double_on(&self) -> u32 {
        self.0.double_on.load(Ordering::SeqCst)
    }

    /// Make every later `set(true)` fail, as a dead driver would.
    pub fn fail_on(&self, fail: bool) {
        self.0.fail_on.store(fail, Ordering::SeqCst);
    }
}

pub struct MockPin {
    name: &'static str,
    pin: u8,
    log: PinProbe,
}

impl MockPin {
    /// Pins start OFF, same as the real driver.
    pub fn new(name: &'static str, pin: u8) -> Self {
        tracing::info!(name, gpio = pin, "mock pin registered (not wired)");
        Self {
            name,
            pin,
            log: PinProbe::default(),
        }
    }

    pub fn probe(&self) -> PinProbe {
        self.log.clone()
    }
}

impl DigitalOutput for MockPin {
    fn set(&mut self, on: bool) -> Result<()> {
        let log = &self.log.0;
        if on && log.fail_on.load(Ordering::SeqCst) {
            bail!("mock pin {} (gpio {}) refused to switch on", self.name, self.pin);
        }
        let was_on = log.on.swap(on, Ordering::SeqCst);
        if on {
            if was_on {
                log.double_on.fetch_add(1, Ordering::SeqCst);
            } else {
                log.rising_edges.fetch_add(1, Ordering::SeqCst);
            }
        }
        if was_on != on {
            tracing::debug!(
                name = self.name,
                gpio = self.pin,
                "mock pin set {}",
                if on { "ON" } else { "OFF" }
            );
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
