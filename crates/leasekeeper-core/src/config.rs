//! Driver timing and diagnostics options.
use serde::{Deserialize, Deserializer};

use crate::Error;

/// Timing agreed with the backing queue.
///
/// Deserializes from seconds, e.g. `{"polling_interval": 1, "visibility_interval": 30}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DriverConfig {
    /// Delay before each poll attempt.
    #[serde(deserialize_with = "seconds")]
    pub polling_interval: std::time::Duration,
    /// Lease duration granted by the queue. The driver renews at half of it.
    #[serde(deserialize_with = "seconds")]
    pub visibility_interval: std::time::Duration,
    /// Append error details to failure messages.
    #[serde(default)]
    pub debug: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            polling_interval: std::time::Duration::from_secs(1),
            visibility_interval: std::time::Duration::from_secs(30),
            debug: false,
        }
    }
}

impl DriverConfig {
    /// Both intervals set, `debug` off.
    pub fn new(
        polling_interval: std::time::Duration,
        visibility_interval: std::time::Duration,
    ) -> Self {
        Self {
            polling_interval,
            visibility_interval,
            debug: false,
        }
    }

    /// Set the delay before each poll attempt.
    pub fn polling_interval(self, polling_interval: std::time::Duration) -> Self {
        Self {
            polling_interval,
            ..self
        }
    }

    /// Set the lease duration the queue grants on dequeue.
    pub fn visibility_interval(self, visibility_interval: std::time::Duration) -> Self {
        Self {
            visibility_interval,
            ..self
        }
    }

    /// Append `Debug` output and error sources to failure messages.
    pub fn debug(self, debug: bool) -> Self {
        Self { debug, ..self }
    }

    /// Delay between lease renewals.
    pub fn lease_interval(&self) -> std::time::Duration {
        self.visibility_interval / 2
    }

    /// Reject a zero polling interval and a visibility interval too short
    /// to leave a non-zero renewal period.
    pub fn validate(&self) -> Result<(), Error> {
        if self.polling_interval.is_zero() {
            return Err(Error::InvalidConfig("polling_interval must be positive"));
        }
        if self.lease_interval().is_zero() {
            return Err(Error::InvalidConfig("visibility_interval is too short"));
        }
        Ok(())
    }
}

fn seconds<'de, D>(deserializer: D) -> Result<std::time::Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    std::time::Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn renews_at_half_visibility() {
        let config = DriverConfig::new(Duration::from_secs(2), Duration::from_secs(3));
        assert_eq!(config.lease_interval(), Duration::from_millis(1500));
    }

    #[test]
    fn rejects_zero_intervals() {
        let config = DriverConfig::default().polling_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = DriverConfig::default().visibility_interval(Duration::from_nanos(1));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        assert!(DriverConfig::default().validate().is_ok());
    }

    #[test]
    fn deserializes_seconds() {
        let config: DriverConfig =
            serde_json::from_str(r#"{"polling_interval": 0.5, "visibility_interval": 30}"#)
                .unwrap();
        assert_eq!(config.polling_interval, Duration::from_millis(500));
        assert_eq!(config.visibility_interval, Duration::from_secs(30));
        assert!(!config.debug);

        let err = serde_json::from_str::<DriverConfig>(
            r#"{"polling_interval": -1, "visibility_interval": 30}"#,
        );
        assert!(err.is_err());
    }
}
