use super::{ConfigError, Deadline, DeadlineGuard, GuardConfig};
use snafu::prelude::*;

/// Errors that can occur when building deadlines from `chrono::TimeDelta`.
#[derive(Debug, Snafu)]
pub enum ChronoDeadlineError {
    /// The delta is negative or does not fit a `std::time::Duration`.
    #[snafu(display("chrono::TimeDelta is out of range for a deadline"))]
    ChronoOutOfRange,
    /// The converted duration is not a usable deadline.
    #[snafu(display("invalid deadline from chrono::TimeDelta: {source}"))]
    InvalidConfig { source: ConfigError },
}

/// Convert a `chrono` delta into a validated configuration.
pub fn config_from_time_delta(delta: chrono::TimeDelta) -> Result<GuardConfig, ChronoDeadlineError> {
    // Drop the chrono error type, it contains no more information anyway.
    let duration = delta.to_std().ok().context(ChronoOutOfRangeSnafu)?;
    let config = GuardConfig::new(duration);
    config.validate().context(InvalidConfigSnafu)?;
    Ok(config)
}

impl Deadline {
    /// A deadline raising [`TimedOut`](super::TimedOut) after `delta`.
    pub fn from_time_delta(delta: chrono::TimeDelta) -> Result<Self, ChronoDeadlineError> {
        Self::with_config(config_from_time_delta(delta)?).context(InvalidConfigSnafu)
    }
}

impl DeadlineGuard {
    /// A guard raising [`TimedOut`](super::TimedOut) after `delta`.
    pub fn from_time_delta(delta: chrono::TimeDelta) -> Result<Self, ChronoDeadlineError> {
        Self::with_config(config_from_time_delta(delta)?).context(InvalidConfigSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn time_delta_converts_to_duration() {
        let deadline =
            Deadline::from_time_delta(chrono::TimeDelta::milliseconds(1500)).expect("deadline");
        assert_eq!(deadline.config().duration(), Duration::from_millis(1500));
    }

    #[test]
    fn negative_time_delta_is_out_of_range() {
        let err = DeadlineGuard::from_time_delta(chrono::TimeDelta::seconds(-1))
            .expect_err("negative");
        assert!(matches!(err, ChronoDeadlineError::ChronoOutOfRange));
    }

    #[test]
    fn zero_time_delta_is_rejected() {
        let err = config_from_time_delta(chrono::TimeDelta::zero()).expect_err("zero");
        assert!(matches!(
            err,
            ChronoDeadlineError::InvalidConfig {
                source: ConfigError::ZeroDuration
            }
        ));
    }
}
