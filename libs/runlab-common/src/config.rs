// Resource limits shared by every run
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Per-run resource budget.
///
/// Every test case gets a fresh copy of these limits; nothing carries over
/// between cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    pub timeout_ms: u64,
    pub compile_timeout_ms: u64,
    /// Combined stdout + stderr cap
    pub output_limit_bytes: usize,
    /// Time between the graceful terminate signal and the forced kill
    pub grace_period_ms: u64,
    pub max_source_bytes: usize,
    pub max_input_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            compile_timeout_ms: 30_000,
            output_limit_bytes: 10 * 1024,
            grace_period_ms: 250,
            max_source_bytes: 1024 * 1024, // 1MB
            max_input_bytes: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl ExecutionLimits {
    /// Apply `RUNLAB_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        env_override("RUNLAB_TIMEOUT_MS", &mut self.timeout_ms);
        env_override("RUNLAB_COMPILE_TIMEOUT_MS", &mut self.compile_timeout_ms);
        env_override("RUNLAB_OUTPUT_LIMIT_BYTES", &mut self.output_limit_bytes);
        env_override("RUNLAB_GRACE_PERIOD_MS", &mut self.grace_period_ms);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    if let Some(value) = std::env::var(key).ok().and_then(|raw| raw.trim().parse().ok()) {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.timeout(), Duration::from_secs(5));
        assert_eq!(limits.output_limit_bytes, 10 * 1024);
        assert_eq!(limits.grace_period(), Duration::from_millis(250));
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let limits: ExecutionLimits = serde_json::from_str(r#"{"timeout_ms": 2000}"#).unwrap();
        assert_eq!(limits.timeout_ms, 2000);
        assert_eq!(limits.compile_timeout_ms, 30_000);
    }

    #[test]
    fn test_env_override_ignores_garbage() {
        let mut value = 10u64;
        env_override("RUNLAB_TEST_UNSET_KEY_FOR_CONFIG", &mut value);
        assert_eq!(value, 10);
    }
}
