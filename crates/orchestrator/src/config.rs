use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure rate, in percent, at which the breaker opens.
    pub failure_threshold: f64,
    pub minimum_requests: usize,
    pub open_duration_ms: u64,
    pub half_open_max_calls: u32,
    pub sliding_window_size: usize,
    /// Idle time after which a closed breaker forgets its window.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 50.0,
            minimum_requests: 10,
            open_duration_ms: 60_000,
            half_open_max_calls: 3,
            sliding_window_size: 100,
            reset_timeout_ms: 300_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, percent: f64) -> Self {
        self.failure_threshold = percent;
        self
    }

    pub fn with_minimum_requests(mut self, minimum: usize) -> Self {
        self.minimum_requests = minimum;
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.failure_threshold > 0.0 && self.failure_threshold <= 100.0) {
            return Err(OrchestratorError::invalid_config(format!(
                "breaker failure_threshold must be in (0, 100], got {}",
                self.failure_threshold
            )));
        }
        if self.sliding_window_size == 0 {
            return Err(OrchestratorError::invalid_config(
                "breaker sliding_window_size must be positive",
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(OrchestratorError::invalid_config(
                "breaker half_open_max_calls must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_retries: u32,
    pub timeout_per_step_ms: u64,
    pub total_timeout_ms: u64,
    pub quality_threshold: f64,
    pub enable_auto_repair: bool,
    pub enable_caching: bool,
    /// Per-task ceiling on failed Act attempts.
    pub max_global_retries: u32,
    /// Act/Evaluate cycles allowed before the task settles.
    pub max_cycles: u32,
    pub max_tokens: u32,
    pub breaker: CircuitBreakerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_per_step_ms: 30_000,
            total_timeout_ms: 300_000,
            quality_threshold: 0.8,
            enable_auto_repair: true,
            enable_caching: true,
            max_global_retries: 10,
            max_cycles: 3,
            max_tokens: 4096,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_per_step_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    pub fn with_auto_repair(mut self, enabled: bool) -> Self {
        self.enable_auto_repair = enabled;
        self
    }

    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.enable_caching = enabled;
        self
    }

    pub fn with_max_global_retries(mut self, max: u32) -> Self {
        self.max_global_retries = max;
        self
    }

    pub fn with_max_cycles(mut self, max: u32) -> Self {
        self.max_cycles = max;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn timeout_per_step(&self) -> Duration {
        Duration::from_millis(self.timeout_per_step_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(OrchestratorError::invalid_config(format!(
                "quality_threshold must be within [0, 1], got {}",
                self.quality_threshold
            )));
        }
        if self.timeout_per_step_ms == 0 || self.total_timeout_ms == 0 {
            return Err(OrchestratorError::invalid_config(
                "timeouts must be positive",
            ));
        }
        if self.total_timeout_ms < self.timeout_per_step_ms {
            return Err(OrchestratorError::invalid_config(format!(
                "total_timeout_ms ({}) is shorter than timeout_per_step_ms ({})",
                self.total_timeout_ms, self.timeout_per_step_ms
            )));
        }
        if self.max_global_retries == 0 {
            return Err(OrchestratorError::invalid_config(
                "max_global_retries must be positive",
            ));
        }
        if self.max_cycles == 0 {
            return Err(OrchestratorError::invalid_config(
                "max_cycles must be positive",
            ));
        }
        self.breaker.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout_per_step(), Duration::from_secs(30));
        assert_eq!(config.total_timeout(), Duration::from_secs(300));
        assert_eq!(config.max_global_retries, 10);
        assert_eq!(config.breaker.minimum_requests, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = OrchestratorConfig::default()
            .with_max_retries(5)
            .with_step_timeout(Duration::from_millis(500))
            .with_caching(false);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.timeout_per_step_ms, 500);
        assert!(!config.enable_caching);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_threshold = OrchestratorConfig::default().with_quality_threshold(1.5);
        assert!(matches!(
            bad_threshold.validate(),
            Err(OrchestratorError::InvalidConfig(_))
        ));

        let inverted = OrchestratorConfig::default()
            .with_step_timeout(Duration::from_secs(10))
            .with_total_timeout(Duration::from_secs(5));
        assert!(inverted.validate().is_err());

        let no_ceiling = OrchestratorConfig::default().with_max_global_retries(0);
        assert!(no_ceiling.validate().is_err());

        let bad_breaker = OrchestratorConfig::default()
            .with_breaker(CircuitBreakerConfig::default().with_failure_threshold(0.0));
        assert!(bad_breaker.validate().is_err());
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"max_retries": 7, "breaker": {"minimum_requests": 2}}"#)
                .unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.breaker.minimum_requests, 2);
        assert_eq!(config.breaker.half_open_max_calls, 3);
        assert_eq!(config.quality_threshold, 0.8);
    }
}
