use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LeaseError;

/// Default time a claimed lease stays valid without a refresh.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Settings shared by every participant of one lease table.
///
/// All participants should agree on `lease_duration`: a peer with a longer
/// duration refreshes less often than its neighbours expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub lease_duration: Duration,
    /// Deployments without a shared relational store turn this off; the
    /// manager then grants every lease locally.
    pub enabled: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            enabled: true,
        }
    }
}

impl LeaseConfig {
    pub fn with_lease_duration(lease_duration: Duration) -> Self {
        Self {
            lease_duration,
            ..Self::default()
        }
    }

    /// Maximum tolerated difference between the local and the store clock.
    pub fn grace(&self) -> Duration {
        self.lease_duration / 4
    }

    /// Delay between the end of one maintenance cycle and the start of the next.
    pub fn maintenance_interval(&self) -> Duration {
        self.lease_duration / 2
    }

    pub fn lease_duration_ms(&self) -> i64 {
        i64::try_from(self.lease_duration.as_millis()).unwrap_or(i64::MAX)
    }

    pub fn grace_ms(&self) -> i64 {
        i64::try_from(self.grace().as_millis()).unwrap_or(i64::MAX)
    }

    pub fn validate(&self) -> Result<(), LeaseError> {
        if self.lease_duration < Duration::from_millis(4) {
            return Err(LeaseError::InvalidConfig(format!(
                "lease duration must be at least 4ms, got {:?}",
                self.lease_duration
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_sixty_seconds() {
        let config = LeaseConfig::default();
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert!(config.enabled);
        assert_eq!(config.grace(), Duration::from_secs(15));
        assert_eq!(config.maintenance_interval(), Duration::from_secs(30));
        assert_eq!(config.grace_ms(), 15_000);
    }

    #[test]
    fn rejects_durations_without_a_grace_window() {
        assert!(LeaseConfig::with_lease_duration(Duration::ZERO)
            .validate()
            .is_err());
        assert!(LeaseConfig::with_lease_duration(Duration::from_millis(3))
            .validate()
            .is_err());
        assert!(LeaseConfig::with_lease_duration(Duration::from_millis(400))
            .validate()
            .is_ok());
    }
}
