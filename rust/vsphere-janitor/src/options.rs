//! Per-run policy knobs for the janitor.

use std::num::NonZeroU32;
use std::time::Duration;

use crate::error::{JanitorError, JanitorResult};

/// Policy and throughput settings, fixed for the lifetime of a [`crate::Janitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JanitorOptions {
    /// Max uptime tolerated for a powered-on VM.
    pub cutoff: Duration,

    /// Grace period for VMs stuck at zero uptime with no boot time.
    pub zero_uptime_cutoff: Duration,

    /// Only power off, never destroy.
    pub skip_destroy: bool,

    /// Max simultaneous power-off/destroy workers.
    pub concurrency: usize,

    /// Max VM evaluations admitted per second.
    pub rate_per_second: u32,

    /// Leave VMs with uptime but no boot time alone.
    pub skip_no_boot_time: bool,

    /// Upper bound for a single power-off or destroy call. `None` waits forever.
    pub action_timeout: Option<Duration>,
}

impl Default for JanitorOptions {
    fn default() -> Self {
        Self {
            cutoff: Duration::from_secs(2 * 60 * 60),
            zero_uptime_cutoff: Duration::from_secs(10 * 60),
            skip_destroy: false,
            concurrency: 1,
            rate_per_second: 5,
            skip_no_boot_time: true,
            action_timeout: None,
        }
    }
}

impl JanitorOptions {
    pub fn validate(&self) -> JanitorResult<()> {
        if self.concurrency == 0 {
            return Err(JanitorError::InvalidOptions(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.rate_per_second == 0 {
            return Err(JanitorError::InvalidOptions(
                "rate_per_second must be at least 1".to_string(),
            ));
        }
        if self.action_timeout.is_some_and(|t| t.is_zero()) {
            return Err(JanitorError::InvalidOptions(
                "action_timeout must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn rate(&self) -> JanitorResult<NonZeroU32> {
        NonZeroU32::new(self.rate_per_second).ok_or_else(|| {
            JanitorError::InvalidOptions("rate_per_second must be at least 1".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = JanitorOptions::default();

        assert_eq!(opts.cutoff, Duration::from_secs(7200));
        assert_eq!(opts.concurrency, 1);
        assert_eq!(opts.rate_per_second, 5);
        assert!(opts.skip_no_boot_time);
        assert!(!opts.skip_destroy);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_concurrency_and_rate() {
        let opts = JanitorOptions {
            concurrency: 0,
            ..JanitorOptions::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(JanitorError::InvalidOptions(_))
        ));

        let opts = JanitorOptions {
            rate_per_second: 0,
            ..JanitorOptions::default()
        };
        assert!(opts.validate().is_err());
        assert!(opts.rate().is_err());
    }

    #[test]
    fn test_rejects_zero_action_timeout() {
        let opts = JanitorOptions {
            action_timeout: Some(Duration::ZERO),
            ..JanitorOptions::default()
        };
        assert!(opts.validate().is_err());
    }
}
