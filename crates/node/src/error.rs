//! Per-operation failures returned by the device controllers.
//!
//! None of these ever escape a worker loop: the dispatcher turns each one
//! into a response payload or a silent drop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Out-of-range or non-numeric input. State is unchanged.
    #[error("invalid argument {value} (allowed 1..={max})")]
    InvalidArgument { value: i64, max: u64 },
    /// Conflicts with an operation already in progress. Not queued.
    #[error("operation in progress")]
    Busy,
    /// The device manages this itself and refuses the request.
    #[error("action denied")]
    ActionDenied,
    /// The controller has been terminated.
    #[error("controller terminated")]
    Terminated,
    #[error("hardware: {0:#}")]
    Hardware(#[from] anyhow::Error),
}

/// Result of asking the watering controller to stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// A cycle was running and will be cut short within one tick.
    Interrupted,
    /// Nothing was running; no side effect.
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_message_names_limit() {
        let e = ControlError::InvalidArgument { value: 200, max: 120 };
        assert_eq!(e.to_string(), "invalid argument 200 (allowed 1..=120)");
    }

    #[test]
    fn hardware_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("i2c nack").context("ads1115 read");
        let e = ControlError::from(inner);
        assert_eq!(e.to_string(), "hardware: ads1115 read: i2c nack");
    }
}
