//! Water valve controller.
//!
//! One long-lived worker owns the valve pin. Callers never touch the pin:
//! they request a cycle, an early stop or a new duration, and read back
//! counters. The worker drives the valve ON only inside [`WaterController::run_cycle`],
//! which counts ticks toward the configured duration and always ends by
//! driving it OFF, whether the cycle completed, was interrupted, or the
//! controller is shutting down.
//!
//! Two independent guards:
//! - `cycle` (mutex): configured duration, pending/active flags, counters.
//!   Only held for short updates, never across a tick.
//! - `interrupt` (atomic): early-stop request, cleared by the worker the
//!   moment it acts on it.

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info};

use crate::error::{ControlError, InterruptOutcome};
use crate::hw::DigitalOutput;

/// Idle wake-up so shutdown is observed even if a notification is missed.
const IDLE_WAKE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct WaterSettings {
    pub duration_secs: u64,
    pub max_duration_secs: u64,
    /// Counting granularity; an interrupt is honoured within one tick.
    pub tick: Duration,
}

impl Default for WaterSettings {
    fn default() -> Self {
        Self {
            duration_secs: 8,
            max_duration_secs: 120,
            tick: Duration::from_secs(1),
        }
    }
}

/// Snapshot handed to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActuatorState {
    pub active: bool,
    pub duration_secs: u64,
    /// Seconds elapsed in the running cycle (0 when idle).
    pub elapsed_secs: u64,
    /// Seconds watered since the last clear.
    pub total_secs: u64,
    /// Seconds watered since the process started.
    pub cumulative_secs: u64,
    pub interrupt_requested: bool,
}

#[derive(Debug)]
struct Cycle {
    duration_secs: u64,
    /// An activation is waiting for the worker.
    pending: bool,
    /// The valve is driven ON.
    active: bool,
    elapsed_secs: u64,
    total_secs: u64,
    cumulative_secs: u64,
}

pub struct WaterController {
    cycle: Mutex<Cycle>,
    interrupt: AtomicBool,
    terminated: AtomicBool,
    wake: Notify,
    max_duration_secs: u64,
    tick: Duration,
}

impl WaterController {
    /// A `duration_secs` outside `1..=max_duration_secs` falls back to the
    /// smaller of 8 s and the ceiling.
    pub fn new(settings: WaterSettings) -> Self {
        let max = settings.max_duration_secs.max(1);
        let duration_secs = if (1..=max).contains(&settings.duration_secs) {
            settings.duration_secs
        } else {
            error!(
                requested = settings.duration_secs,
                max, "watering duration out of range, using default"
            );
            WaterSettings::default().duration_secs.min(max)
        };

        Self {
            cycle: Mutex::new(Cycle {
                duration_secs,
                pending: false,
                active: false,
                elapsed_secs: 0,
                total_secs: 0,
                cumulative_secs: 0,
            }),
            interrupt: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            wake: Notify::new(),
            max_duration_secs: max,
            tick: settings.tick,
        }
    }

    // -- Commands -----------------------------------------------------------

    /// Request one cycle at the configured duration. Does nothing if a cycle
    /// is already running or pending, or after [`terminate`](Self::terminate).
    pub async fn activate(&self) -> ActuatorState {
        let mut c = self.cycle.lock().await;
        if !c.active && !c.pending && !self.terminated.load(Ordering::SeqCst) {
            c.pending = true;
            self.wake.notify_one();
            debug!(duration_secs = c.duration_secs, "watering requested");
        }
        self.snapshot(&c)
    }

    /// Cut the running cycle short. The worker turns the valve OFF within
    /// one tick and books the seconds actually elapsed.
    pub async fn interrupt(&self) -> InterruptOutcome {
        let c = self.cycle.lock().await;
        if !c.active {
            return InterruptOutcome::NotRunning;
        }
        self.interrupt.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        info!(elapsed_secs = c.elapsed_secs, "watering interrupt requested");
        InterruptOutcome::Interrupted
    }

    /// Change the cycle length. Rejected while a cycle is running.
    pub async fn set_duration(&self, secs: i64) -> Result<u64, ControlError> {
        if secs <= 0 || secs as u64 > self.max_duration_secs {
            return Err(ControlError::InvalidArgument {
                value: secs,
                max: self.max_duration_secs,
            });
        }
        let mut c = self.cycle.lock().await;
        if c.active {
            return Err(ControlError::Busy);
        }
        c.duration_secs = secs as u64;
        info!(duration_secs = c.duration_secs, "watering duration updated");
        Ok(c.duration_secs)
    }

    /// Zero the since-last-clear counter; the cumulative one is untouched.
    pub async fn clear_cycle_total(&self) -> u64 {
        let mut c = self.cycle.lock().await;
        c.total_secs = 0;
        c.total_secs
    }

    /// Stop the worker. Any running cycle is interrupted and its OFF path
    /// runs before the worker exits; a pending activation is discarded.
    /// Idempotent.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let c = self.cycle.lock().await;
        if c.active {
            self.interrupt.store(true, Ordering::SeqCst);
        }
        drop(c);
        self.wake.notify_one();
    }

    // -- Reads --------------------------------------------------------------

    pub async fn status(&self) -> ActuatorState {
        let c = self.cycle.lock().await;
        self.snapshot(&c)
    }

    pub async fn is_active(&self) -> bool {
        self.cycle.lock().await.active
    }

    pub async fn duration_secs(&self) -> u64 {
        self.cycle.lock().await.duration_secs
    }

    pub async fn cycle_total(&self) -> u64 {
        self.cycle.lock().await.total_secs
    }

    pub async fn cumulative_total(&self) -> u64 {
        self.cycle.lock().await.cumulative_secs
    }

    fn snapshot(&self, c: &Cycle) -> ActuatorState {
        ActuatorState {
            active: c.active,
            duration_secs: c.duration_secs,
            elapsed_secs: c.elapsed_secs,
            total_secs: c.total_secs,
            cumulative_secs: c.cumulative_secs,
            interrupt_requested: self.interrupt.load(Ordering::SeqCst),
        }
    }

    // -- Worker -------------------------------------------------------------

    /// Worker loop. Returns `Err` only if the valve cannot be driven, after
    /// making a last attempt to switch it OFF.
    pub async fn run(&self, mut valve: Box<dyn DigitalOutput>) -> Result<()> {
        valve.set(false)?;
        let duration_secs = self.duration_secs().await;
        info!(
            duration_secs,
            max_duration_secs = self.max_duration_secs,
            "watering worker started"
        );

        loop {
            let start = {
                let mut c = self.cycle.lock().await;
                if self.terminated.load(Ordering::SeqCst) {
                    if c.pending {
                        debug!("discarding pending watering request on shutdown");
                    }
                    c.pending = false;
                    break;
                }
                c.pending.then_some(c.duration_secs)
            };

            match start {
                Some(duration_secs) => self.run_cycle(valve.as_mut(), duration_secs).await?,
                None => {
                    let _ = timeout(IDLE_WAKE, self.wake.notified()).await;
                }
            }
        }

        valve.set(false)?;
        info!("watering worker stopped");
        Ok(())
    }

    async fn run_cycle(&self, valve: &mut dyn DigitalOutput, duration_secs: u64) -> Result<()> {
        {
            let mut c = self.cycle.lock().await;
            if self.terminated.load(Ordering::SeqCst) {
                // terminate() saw no active cycle, so nothing would stop this one
                c.pending = false;
                debug!("shutdown before watering started, valve stays off");
                return Ok(());
            }
            // a stale request from before this cycle must not cut it short
            self.interrupt.store(false, Ordering::SeqCst);
            if let Err(e) = valve.set(true) {
                c.pending = false;
                let _ = valve.set(false);
                error!("valve failed to open: {e:#}");
                return Err(e);
            }
            c.active = true;
            c.elapsed_secs = 0;
        }
        info!(duration_secs, "watering started");

        let mut elapsed: u64 = 0;
        let mut interrupted = false;
        let mut next_tick = Instant::now() + self.tick;

        while elapsed < duration_secs {
            if self.interrupt.swap(false, Ordering::SeqCst)
                || self.terminated.load(Ordering::SeqCst)
            {
                interrupted = true;
                break;
            }
            tokio::select! {
                _ = sleep_until(next_tick) => {
                    elapsed += 1;
                    next_tick += self.tick;
                    self.cycle.lock().await.elapsed_secs = elapsed;
                }
                _ = self.wake.notified() => {}
            }
        }

        // Unconditional OFF: this is the only exit from an active cycle.
        let off = valve.set(false);
        {
            let mut c = self.cycle.lock().await;
            c.active = false;
            c.pending = false;
            c.elapsed_secs = 0;
            c.total_secs += elapsed;
            c.cumulative_secs += elapsed;
            self.interrupt.store(false, Ordering::SeqCst);
        }

        if let Err(e) = off {
            error!("valve failed to close: {e:#}");
            return Err(e);
        }
        info!(elapsed_secs = elapsed, interrupted, "watering finished");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::{MockPin, PinProbe};
    use std::sync::Arc;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;

    fn settings(duration_secs: u64, max_duration_secs: u64) -> WaterSettings {
        WaterSettings {
            duration_secs,
            max_duration_secs,
            ..WaterSettings::default()
        }
    }

    fn start(settings: WaterSettings) -> (Arc<WaterController>, PinProbe, JoinHandle<Result<()>>) {
        let ctl = Arc::new(WaterController::new(settings));
        let pin = MockPin::new("valve", 20);
        let probe = pin.probe();
        let worker = Arc::clone(&ctl);
        let handle = tokio::spawn(async move { worker.run(Box::new(pin)).await });
        (ctl, probe, handle)
    }

    // -- Construction -------------------------------------------------------

    #[tokio::test]
    async fn out_of_range_initial_duration_falls_back() {
        let ctl = WaterController::new(settings(500, 120));
        assert_eq!(ctl.duration_secs().await, 8);
        let ctl = WaterController::new(settings(0, 5));
        assert_eq!(ctl.duration_secs().await, 5);
    }

    // -- set_duration -------------------------------------------------------

    #[tokio::test]
    async fn set_duration_accepts_whole_range_when_idle() {
        let ctl = WaterController::new(settings(8, 121));
        for secs in [1, 2, 60, 120, 121] {
            assert_eq!(ctl.set_duration(secs).await.unwrap(), secs as u64);
            assert_eq!(ctl.status().await.duration_secs, secs as u64);
        }
    }

    #[tokio::test]
    async fn set_duration_rejects_out_of_range_and_keeps_value() {
        let ctl = WaterController::new(settings(8, 121));
        for secs in [i64::MIN, -1, 0, 122, 200, i64::MAX] {
            let err = ctl.set_duration(secs).await.unwrap_err();
            assert!(
                matches!(err, ControlError::InvalidArgument { value, max: 121 } if value == secs),
                "{secs}: {err:?}"
            );
            assert_eq!(ctl.duration_secs().await, 8);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn set_duration_while_watering_is_busy() {
        let (ctl, probe, _h) = start(settings(8, 120));
        ctl.activate().await;
        sleep(Duration::from_millis(1500)).await;
        assert!(probe.is_on());

        assert!(matches!(ctl.set_duration(10).await, Err(ControlError::Busy)));
        assert_eq!(ctl.duration_secs().await, 8);

        // not queued: once the cycle ends the old value is still in place
        sleep(Duration::from_secs(8)).await;
        assert!(!probe.is_on());
        assert_eq!(ctl.duration_secs().await, 8);
    }

    // -- Cycles -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn full_cycle_runs_for_configured_duration() {
        let (ctl, probe, _h) = start(settings(5, 120));
        let state = ctl.activate().await;
        assert!(!state.active);

        sleep(Duration::from_millis(4500)).await;
        assert!(probe.is_on());
        assert!(ctl.is_active().await);

        sleep(Duration::from_secs(1)).await;
        assert!(!probe.is_on());
        assert!(!ctl.is_active().await);
        assert_eq!(ctl.cycle_total().await, 5);
        assert_eq!(ctl.cumulative_total().await, 5);
        assert_eq!(probe.rising_edges(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn one_activation_triggers_one_cycle() {
        let (ctl, probe, _h) = start(settings(2, 120));
        ctl.activate().await;
        sleep(Duration::from_millis(500)).await;
        // repeated requests while running do not queue another cycle
        let state = ctl.activate().await;
        assert!(state.active);
        ctl.activate().await;

        sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.rising_edges(), 1);
        assert_eq!(ctl.cumulative_total().await, 2);
        assert!(!probe.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_turns_valve_off_within_a_tick() {
        let (ctl, probe, _h) = start(settings(8, 121));
        ctl.activate().await;
        sleep(Duration::from_secs(3)).await;
        assert!(probe.is_on());

        assert_eq!(ctl.interrupt().await, InterruptOutcome::Interrupted);
        sleep(Duration::from_secs(1)).await;
        assert!(!probe.is_on());

        let total = ctl.cycle_total().await;
        assert!((2..=4).contains(&total), "cycle total {total}");
        assert_eq!(ctl.cumulative_total().await, total);
        assert!(!ctl.status().await.interrupt_requested);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_when_idle_is_a_no_op() {
        let (ctl, probe, _h) = start(settings(3, 120));
        assert_eq!(ctl.interrupt().await, InterruptOutcome::NotRunning);
        assert!(!ctl.status().await.interrupt_requested);

        // a later cycle is not cut short by the rejected request
        ctl.activate().await;
        sleep(Duration::from_secs(5)).await;
        assert_eq!(ctl.cycle_total().await, 3);
        assert!(!probe.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_resets_cycle_total_only() {
        let (ctl, _probe, _h) = start(settings(2, 120));
        ctl.activate().await;
        sleep(Duration::from_secs(3)).await;
        assert_eq!(ctl.cycle_total().await, 2);

        assert_eq!(ctl.clear_cycle_total().await, 0);
        assert_eq!(ctl.cycle_total().await, 0);
        assert_eq!(ctl.cumulative_total().await, 2);

        ctl.activate().await;
        sleep(Duration::from_secs(3)).await;
        assert_eq!(ctl.cycle_total().await, 2);
        assert_eq!(ctl.cumulative_total().await, 4);
    }

    // -- Shutdown -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn terminate_when_idle_returns_promptly() {
        let (ctl, probe, handle) = start(settings(8, 120));
        sleep(Duration::from_millis(100)).await;
        ctl.terminate().await;
        ctl.terminate().await;
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker exits")
            .unwrap()
            .unwrap();
        assert!(!probe.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_mid_cycle_closes_valve() {
        let (ctl, probe, handle) = start(settings(100, 120));
        ctl.activate().await;
        sleep(Duration::from_secs(4)).await;
        assert!(probe.is_on());

        ctl.terminate().await;
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker exits")
            .unwrap()
            .unwrap();
        assert!(!probe.is_on());
        assert!(ctl.cumulative_total().await >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_discards_pending_activation() {
        let ctl = Arc::new(WaterController::new(settings(8, 120)));
        let pin = MockPin::new("valve", 20);
        let probe = pin.probe();

        ctl.activate().await;
        ctl.terminate().await;
        ctl.run(Box::new(pin)).await.unwrap();

        assert_eq!(probe.rising_edges(), 0);
        // activation after shutdown is refused too
        assert!(!ctl.activate().await.active);
        assert_eq!(ctl.cumulative_total().await, 0);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn worker_future_is_send() {
        let ctl = WaterController::new(settings(8, 120));
        let run = ctl.run(Box::new(MockPin::new("valve", 20)));
        assert_send(&run);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_between_pickup_and_valve_on_keeps_valve_off() {
        let ctl = WaterController::new(settings(100, 120));
        let mut pin = MockPin::new("valve", 20);
        let probe = pin.probe();

        ctl.activate().await;
        // the worker has picked the request up but not yet opened the valve
        let picked = ctl.cycle.lock().await.pending.then_some(100);
        assert_eq!(picked, Some(100));
        ctl.terminate().await;

        timeout(Duration::from_secs(1), ctl.run_cycle(&mut pin, 100))
            .await
            .expect("cycle returns promptly")
            .unwrap();
        assert_eq!(probe.rising_edges(), 0);
        assert!(!probe.is_on());
        assert!(!ctl.is_active().await);
        assert_eq!(ctl.cumulative_total().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_flag_ends_running_cycle() {
        let (ctl, probe, handle) = start(settings(100, 120));
        ctl.activate().await;
        sleep(Duration::from_secs(2)).await;
        assert!(probe.is_on());

        // flag only, no interrupt: the tick loop still stops
        ctl.terminated.store(true, Ordering::SeqCst);
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker exits")
            .unwrap()
            .unwrap();
        assert!(!probe.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn valve_failure_is_fatal_and_leaves_valve_off() {
        let (ctl, probe, handle) = start(settings(8, 120));
        probe.fail_on(true);
        ctl.activate().await;

        let res = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(res.is_err());
        assert!(!probe.is_on());
        assert!(!ctl.is_active().await);
    }
}
