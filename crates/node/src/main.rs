mod config;
mod dispatch;
mod error;
mod hw;
mod led;
mod mqtt;
mod runtime;
mod soil;
mod water;
mod weather;

#[cfg(not(any(feature = "hw", feature = "sim")))]
compile_error!("enable the `hw` feature (Raspberry Pi) or the default `sim` feature");

use anyhow::{ensure, Context, Result};
use std::{env, future::pending, process::Command, time::Duration};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use dispatch::Termination;
use hw::Hardware;
use runtime::Runtime;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "node.toml".to_string());
    let cfg = config::load(&config_path, |key| env::var(key).ok())?;
    info!(node_id = %cfg.node_id, config = %config_path, "sensor node starting");

    // ── Hardware ────────────────────────────────────────────────────
    let hardware = build_hardware(&cfg)?;

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, eventloop) = mqtt::connect(&cfg.mqtt, &cfg.node_id);
    let (inbound_tx, inbound_rx) = mpsc::channel(cfg.runtime.outbound_capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(cfg.runtime.outbound_capacity);

    let events = tokio::spawn(mqtt::run_event_loop(
        eventloop,
        client.clone(),
        cfg.node_id.clone(),
        inbound_tx,
    ));
    let publisher = tokio::spawn(mqtt::run_publisher(client, outbound_rx));

    // ── Node ────────────────────────────────────────────────────────
    let node = Runtime::start(&cfg, hardware, outbound_tx)?;
    let outcome = node
        .run(inbound_rx, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("ctrl-c handler unavailable: {e}");
                pending::<()>().await;
            }
        })
        .await;

    // The runtime dropped its sender: the publisher flushes and disconnects.
    let grace = Duration::from_secs(cfg.runtime.shutdown_grace_secs);
    let flushed = timeout(grace, async {
        let _ = publisher.await;
        let _ = events.await;
    })
    .await;
    if flushed.is_err() {
        warn!("mqtt did not close within {}s", grace.as_secs());
    }

    let termination = outcome?;
    info!(?termination, "node stopped");
    power_action(termination, cfg.runtime.power_actions)
}

// ---------------------------------------------------------------------------
// Hardware
// ---------------------------------------------------------------------------

#[cfg(feature = "hw")]
fn build_hardware(cfg: &Config) -> Result<Hardware> {
    use hw::{ads1115::Ads1115, bme280::Bme280, gpio::GpioOutput};

    let gpio = rppal::gpio::Gpio::new().context("open gpio")?;
    Ok(Hardware {
        valve: Box::new(GpioOutput::new(
            &gpio,
            "valve",
            cfg.water.gpio_pin as u8,
            cfg.water.active_low,
        )?),
        led: Box::new(GpioOutput::new(&gpio, "led", cfg.led.gpio_pin as u8, false)?),
        soil_power: Box::new(GpioOutput::new(
            &gpio,
            "soil-power",
            cfg.soil.power_gpio_pin as u8,
            false,
        )?),
        soil_adc: Box::new(Ads1115::new(cfg.soil.adc_addr, cfg.soil.adc_channel as u8)?),
        weather: Box::new(Bme280::new(cfg.weather.i2c_addr, cfg.weather.sea_level_hpa)?),
    })
}

#[cfg(all(feature = "sim", not(feature = "hw")))]
fn build_hardware(cfg: &Config) -> Result<Hardware> {
    use hw::mock::MockPin;
    use hw::sim::{Scenario, SimSoil, SimWeather};

    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let valve = MockPin::new("valve", cfg.water.gpio_pin as u8);
    let soil = SimSoil::new(scenario, cfg.soil.raw_floor as f64, cfg.soil.raw_ceiling as f64)
        .with_valve(valve.probe());

    Ok(Hardware {
        valve: Box::new(valve),
        led: Box::new(MockPin::new("led", cfg.led.gpio_pin as u8)),
        soil_power: Box::new(MockPin::new("soil-power", cfg.soil.power_gpio_pin as u8)),
        soil_adc: Box::new(soil),
        weather: Box::new(SimWeather::new(cfg.weather.sea_level_hpa)),
    })
}

// ---------------------------------------------------------------------------
// Power actions
// ---------------------------------------------------------------------------

const REBOOT: &[&str] = &["halt", "--reboot"];
const HALT: &[&str] = &["halt", "-p"];

/// `sudo` arguments for a termination, `None` when the process just exits.
fn power_command(t: Termination) -> Option<&'static [&'static str]> {
    match t {
        Termination::Disconnect => None,
        Termination::Reboot => Some(REBOOT),
        Termination::Halt => Some(HALT),
    }
}

fn power_action(t: Termination, enabled: bool) -> Result<()> {
    let Some(args) = power_command(t) else {
        return Ok(());
    };
    if !enabled {
        info!(?t, "power actions disabled, not running sudo {}", args.join(" "));
        return Ok(());
    }

    info!("running sudo {}", args.join(" "));
    let status = Command::new("sudo")
        .args(args)
        .status()
        .context("failed to run sudo")?;
    ensure!(status.success(), "sudo {} exited with {status}", args.join(" "));
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
