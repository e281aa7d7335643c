//! Retry policy for broker reconnection
//!
//! Pure functions only: the orchestrator asks for a decision and schedules the
//! returned delay itself.

use serde::{Deserialize, Serialize};

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Per-attempt delays in milliseconds, used before falling back to `sustained_delay_ms`
    pub backoff_pattern_ms: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern_ms: Vec::new(),
            sustained_delay_ms: 1000,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for a 1-based attempt number
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern_ms
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay_ms)
    }

    /// Total time spent waiting across every attempt, or None when unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or unset for unlimited".to_string());
        }
        if self.sustained_delay_ms == 0 {
            return Err("sustained_delay_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Decide whether to schedule another connect after `current_attempts` consecutive failures
pub fn should_attempt_reconnection(
    current_attempts: u32,
    config: &ReconnectConfig,
    shutdown_requested: bool,
) -> ReconnectionDecision {
    if shutdown_requested {
        return ReconnectionDecision::AbortShutdownRequested;
    }

    if let Some(max_attempts) = config.max_attempts {
        if current_attempts >= max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }
    }

    let attempt = current_attempts + 1;
    ReconnectionDecision::Proceed {
        attempt,
        delay_ms: config.calculate_backoff_delay(attempt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fixed_one_second_forever() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.calculate_backoff_delay(1), 1000);
        assert_eq!(config.calculate_backoff_delay(50), 1000);
        assert_eq!(config.calculate_max_total_time(), None);
    }

    #[test]
    fn test_pattern_then_sustained_delay() {
        let config = ReconnectConfig {
            max_attempts: Some(5),
            backoff_pattern_ms: vec![25, 50, 100],
            sustained_delay_ms: 250,
        };

        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(3), 100);
        assert_eq!(config.calculate_backoff_delay(4), 250);
        assert_eq!(config.calculate_max_total_time(), Some(25 + 50 + 100 + 250 + 250));
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig {
            max_attempts: Some(2),
            backoff_pattern_ms: vec![10],
            sustained_delay_ms: 20,
        };

        assert_eq!(
            should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 10
            }
        );
        assert_eq!(
            should_attempt_reconnection(1, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 2,
                delay_ms: 20
            }
        );
        assert_eq!(
            should_attempt_reconnection(2, &config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(
            should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_validate() {
        assert!(ReconnectConfig::default().validate().is_ok());

        let zero_attempts = ReconnectConfig {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert!(zero_attempts.validate().is_err());

        let zero_delay = ReconnectConfig {
            sustained_delay_ms: 0,
            ..Default::default()
        };
        assert!(zero_delay.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_table() {
        let config: ReconnectConfig = toml::from_str("max_attempts = 3").unwrap();
        assert_eq!(config.max_attempts, Some(3));
        assert_eq!(config.sustained_delay_ms, 1000);
    }
}
