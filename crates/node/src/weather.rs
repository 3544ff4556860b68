use tokio::sync::Mutex;

use crate::error::ControlError;
use crate::hw::{WeatherReading, WeatherSensor};

/// Serialized access to the weather sensor. Read-only from outside: there is
/// nothing to switch.
pub struct WeatherStation {
    sensor: Mutex<Box<dyn WeatherSensor>>,
}

impl WeatherStation {
    pub fn new(sensor: Box<dyn WeatherSensor>) -> Self {
        Self {
            sensor: Mutex::new(sensor),
        }
    }

    pub async fn read(&self) -> Result<WeatherReading, ControlError> {
        let mut sensor = self.sensor.lock().await;
        Ok(sensor.read()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};

    struct Broken;

    impl WeatherSensor for Broken {
        fn read(&mut self) -> Result<WeatherReading> {
            bail!("i2c nack")
        }
    }

    #[tokio::test]
    async fn sensor_failure_is_a_hardware_error() {
        let station = WeatherStation::new(Box::new(Broken));
        let err = station.read().await.unwrap_err();
        assert!(matches!(err, ControlError::Hardware(_)));
        assert!(err.to_string().contains("i2c nack"));
    }
}
