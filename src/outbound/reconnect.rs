//! Reconnect delay policy

use crate::config::DataSection;
use std::time::Duration;

/// Delays between reconnect attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delays for the first attempts, in order
    pub backoff_pattern: Vec<Duration>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff_pattern: [1, 2, 5, 10, 30].map(Duration::from_secs).to_vec(),
            sustained_delay: Duration::from_secs(60),
        }
    }
}

impl From<&DataSection> for ReconnectPolicy {
    fn from(section: &DataSection) -> Self {
        Self {
            backoff_pattern: section
                .reconnect_backoff_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
            sustained_delay: Duration::from_secs(section.retry_interval_secs),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based)
    ///
    /// Follows the pattern, then stays at the sustained delay forever.
    pub fn delay(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_then_sustained_delay() {
        let policy = ReconnectPolicy::default();

        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(5), Duration::from_secs(30));

        assert_eq!(policy.delay(6), Duration::from_secs(60));
        assert_eq!(policy.delay(100), Duration::from_secs(60));
    }

    #[test]
    fn test_empty_pattern_uses_sustained_delay() {
        let policy = ReconnectPolicy {
            backoff_pattern: Vec::new(),
            sustained_delay: Duration::from_millis(250),
        };

        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(250));
    }

    #[test]
    fn test_built_from_data_section() {
        let mut section = crate::config::GatewayConfig::test_config().data;
        section.reconnect_backoff_secs = vec![3];
        section.retry_interval_secs = 7;

        let policy = ReconnectPolicy::from(&section);

        assert_eq!(policy.delay(1), Duration::from_secs(3));
        assert_eq!(policy.delay(2), Duration::from_secs(7));
    }
}
