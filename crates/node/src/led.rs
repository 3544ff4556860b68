//! Indicator LED: blinks while active, dark otherwise.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info};

use crate::hw::DigitalOutput;

const IDLE_WAKE: Duration = Duration::from_secs(3);

pub struct LedController {
    active: AtomicBool,
    terminated: AtomicBool,
    wake: Notify,
    /// Length of each on and each off phase.
    blink: Duration,
}

impl LedController {
    pub fn new(blink: Duration) -> Self {
        Self {
            active: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            wake: Notify::new(),
            blink,
        }
    }

    pub fn set_active(&self, on: bool) {
        if self.active.swap(on, Ordering::SeqCst) != on {
            debug!(on, "led blink toggled");
            self.wake.notify_one();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Wakes the worker from either wait point. Idempotent.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    pub async fn run(&self, mut led: Box<dyn DigitalOutput>) -> Result<()> {
        led.set(false)?;
        let mut lit = false;
        info!(blink_ms = self.blink.as_millis() as u64, "led worker started");

        while !self.terminated.load(Ordering::SeqCst) {
            if !self.is_active() {
                if lit {
                    led.set(false)?;
                    lit = false;
                }
                let _ = timeout(IDLE_WAKE, self.wake.notified()).await;
                continue;
            }

            lit = !lit;
            led.set(lit)?;
            self.hold_phase().await;
        }

        led.set(false)?;
        info!("led worker stopped");
        Ok(())
    }

    /// Sleep out one blink phase. Only deactivation or shutdown ends it
    /// early; a wake-up that changed neither (a stored permit from an
    /// earlier toggle) keeps the phase running.
    async fn hold_phase(&self) {
        let deadline = Instant::now() + self.blink;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return,
                _ = self.wake.notified() => {
                    if !self.is_active() || self.terminated.load(Ordering::SeqCst) {
                        return;
                    }
                }
            }
        }
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

    fn start() -> (Arc<LedController>, PinProbe, JoinHandle<Result<()>>) {
        let ctl = Arc::new(LedController::new(Duration::from_millis(700)));
        let pin = MockPin::new("led", 21);
        let probe = pin.probe();
        let worker = Arc::clone(&ctl);
        let handle = tokio::spawn(async move { worker.run(Box::new(pin)).await });
        (ctl, probe, handle)
    }

    async fn joins(handle: JoinHandle<Result<()>>) {
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker exits")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn set_active_reports_status() {
        let ctl = LedController::new(Duration::from_millis(700));
        assert!(!ctl.is_active());
        ctl.set_active(true);
        assert!(ctl.is_active());
        ctl.set_active(true);
        assert!(ctl.is_active());
        ctl.set_active(false);
        assert!(!ctl.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn blinks_while_active() {
        let (ctl, probe, _h) = start();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(probe.rising_edges(), 0);

        ctl.set_active(true);
        sleep(Duration::from_millis(350)).await;
        assert!(probe.is_on());
        sleep(Duration::from_millis(700)).await;
        assert!(!probe.is_on());

        // on at 0, 1.4, 2.8, 4.2 s
        sleep(Duration::from_millis(3650)).await;
        assert_eq!(probe.rising_edges(), 4);
        assert_eq!(probe.double_on(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn activation_before_worker_starts_keeps_full_first_phase() {
        let ctl = Arc::new(LedController::new(Duration::from_millis(700)));
        let pin = MockPin::new("led", 21);
        let probe = pin.probe();
        ctl.set_active(true);

        let worker = Arc::clone(&ctl);
        tokio::spawn(async move { worker.run(Box::new(pin)).await });

        sleep(Duration::from_millis(650)).await;
        assert!(probe.is_on());
        assert_eq!(probe.rising_edges(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quick_off_on_toggle_does_not_cut_phase() {
        let (ctl, probe, _h) = start();
        ctl.set_active(true);
        sleep(Duration::from_millis(100)).await;
        assert!(probe.is_on());

        ctl.set_active(false);
        ctl.set_active(true);
        sleep(Duration::from_millis(300)).await;
        assert!(probe.is_on());
        assert_eq!(probe.rising_edges(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_goes_dark_immediately() {
        let (ctl, probe, _h) = start();
        ctl.set_active(true);
        sleep(Duration::from_millis(100)).await;
        assert!(probe.is_on());

        ctl.set_active(false);
        sleep(Duration::from_millis(10)).await;
        assert!(!probe.is_on());

        let edges = probe.rising_edges();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.rising_edges(), edges);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_while_idle() {
        let (ctl, probe, handle) = start();
        sleep(Duration::from_millis(100)).await;
        ctl.terminate();
        ctl.terminate();
        joins(handle).await;
        assert!(!probe.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_mid_blink() {
        let (ctl, probe, handle) = start();
        ctl.set_active(true);
        sleep(Duration::from_millis(200)).await;
        assert!(probe.is_on());

        ctl.terminate();
        // returns well inside one blink phase
        timeout(Duration::from_millis(50), handle)
            .await
            .expect("worker exits")
            .unwrap()
            .unwrap();
        assert!(!probe.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn pin_failure_stops_worker() {
        let (ctl, probe, handle) = start();
        probe.fail_on(true);
        ctl.set_active(true);
        let res = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(res.is_err());
        assert!(!probe.is_on());
    }
}
