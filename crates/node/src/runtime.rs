//! Scheduler: builds the controllers, runs one worker task per device and
//! feeds inbound commands through the dispatcher until something ends the
//! process.
//!
//! Shutdown order is fixed: stop every worker (each drives its output OFF on
//! the way out), wait up to the grace period for them, then drop the
//! outbound sender so the transport can flush and disconnect.

use anyhow::{anyhow, Result};
use std::future::{pending, Future};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatch::{Dispatcher, Inbound, Response, SoilSource, Termination};
use crate::hw::Hardware;
use crate::led::LedController;
use crate::mqtt;
use crate::soil::{Calibration, SoilController, SoilSettings};
use crate::water::{WaterController, WaterSettings};
use crate::weather::WeatherStation;

type Worker = (&'static str, Result<()>);

pub struct Runtime {
    node_id: String,
    water: Arc<WaterController>,
    soil: Arc<SoilController>,
    led: Arc<LedController>,
    dispatcher: Dispatcher,
    workers: JoinSet<Worker>,
    outbound: mpsc::Sender<Response>,
    telemetry_every: Option<Duration>,
    grace: Duration,
}

fn every(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

async fn next_tick(t: &mut Option<Interval>) {
    match t {
        Some(i) => {
            i.tick().await;
        }
        None => pending().await,
    }
}

impl Runtime {
    /// Build every controller from `config` and spawn its worker. Must be
    /// called inside a tokio runtime.
    pub fn start(config: &Config, hw: Hardware, outbound: mpsc::Sender<Response>) -> Result<Self> {
        let water = Arc::new(WaterController::new(WaterSettings {
            duration_secs: config.water.duration_secs.max(0) as u64,
            max_duration_secs: config.water.max_duration_secs.max(0) as u64,
            ..WaterSettings::default()
        }));
        let soil = Arc::new(SoilController::new(
            hw.soil_power,
            hw.soil_adc,
            SoilSettings {
                calibration: Calibration {
                    floor: config.soil.raw_floor as i32,
                    ceiling: config.soil.raw_ceiling as i32,
                },
                settle: config.settle_time(),
                sample_every: every(config.soil.sample_every_secs),
            },
        )?);
        let led = Arc::new(LedController::new(config.blink_period()));
        let weather = Arc::new(WeatherStation::new(hw.weather));

        let mut workers = JoinSet::new();
        {
            let water = Arc::clone(&water);
            let valve = hw.valve;
            workers.spawn(async move { ("water", water.run(valve).await) });
        }
        {
            let led = Arc::clone(&led);
            let pin = hw.led;
            workers.spawn(async move { ("led", led.run(pin).await) });
        }
        {
            let soil = Arc::clone(&soil);
            workers.spawn(async move { ("soil", soil.run().await) });
        }

        let dispatcher = Dispatcher::new(
            config.node_id.clone(),
            Arc::clone(&water),
            Arc::clone(&soil),
            Arc::clone(&led),
            weather,
        );

        info!(node_id = %config.node_id, "node started");
        Ok(Self {
            node_id: config.node_id.clone(),
            water,
            soil,
            led,
            dispatcher,
            workers,
            outbound,
            telemetry_every: every(config.runtime.telemetry_every_secs),
            grace: Duration::from_secs(config.runtime.shutdown_grace_secs),
        })
    }

    /// Run until a `deviceState` command, `shutdown` resolving, the inbound
    /// channel closing, or a worker dying. Workers are stopped before this
    /// returns; a dead worker is reported as `Err`.
    pub async fn run<F>(mut self, mut inbound: mpsc::Receiver<Inbound>, shutdown: F) -> Result<Termination>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut telemetry = self.telemetry_every.map(|p| {
            let mut i = interval_at(Instant::now() + p, p);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });

        let outcome = loop {
            tokio::select! {
                Some(joined) = self.workers.join_next() => {
                    break Err(match joined {
                        Ok((name, Ok(()))) => anyhow!("{name} worker exited unexpectedly"),
                        Ok((name, Err(e))) => e.context(format!("{name} worker failed")),
                        Err(e) => anyhow!("worker task panicked: {e}"),
                    });
                }
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(Termination::Disconnect);
                }
                msg = inbound.recv() => {
                    let Some(msg) = msg else {
                        warn!("inbound channel closed");
                        break Ok(Termination::Disconnect);
                    };
                    if let Some(resp) = self.dispatcher.dispatch(&msg).await {
                        self.publish(resp);
                    }
                    if let Some(t) = self.dispatcher.take_termination() {
                        break Ok(t);
                    }
                }
                _ = next_tick(&mut telemetry) => {
                    let payload = self.dispatcher.bulk(SoilSource::Retained).await;
                    self.publish(Response {
                        topic: mqtt::device_topic("info", &self.node_id),
                        payload,
                    });
                }
            }
        };

        if let Err(e) = &outcome {
            error!("{e:#}");
        }
        self.stop_workers().await;
        outcome
    }

    fn publish(&self, resp: Response) {
        match self.outbound.try_send(resp) {
            Ok(()) => {}
            Err(TrySendError::Full(r)) => {
                warn!(topic = %r.topic, "outbound queue full, dropping response");
            }
            Err(TrySendError::Closed(r)) => {
                warn!(topic = %r.topic, "transport gone, dropping response");
            }
        }
    }

    async fn stop_workers(&mut self) {
        info!("stopping workers");
        self.water.terminate().await;
        self.led.terminate();
        self.soil.terminate().await;

        let workers = &mut self.workers;
        let drain = async {
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => debug!(name, "worker joined"),
                    Ok((name, Err(e))) => error!(name, "worker failed during shutdown: {e:#}"),
                    Err(e) => error!("worker task panicked: {e}"),
                }
            }
        };
        if timeout(self.grace, drain).await.is_err() {
            error!(grace_secs = self.grace.as_secs(), "workers did not stop in time, aborting");
            self.workers.abort_all();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
