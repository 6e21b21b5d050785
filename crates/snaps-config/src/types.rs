//! Configuration struct definitions.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snaps_telemetry::LogConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Execution service settings.
    pub execution: ExecutionConfig,
    /// Snap controller settings.
    pub controller: ControllerConfig,
    /// Logging settings.
    pub logging: LogConfig,
}

/// Execution service timeouts and retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Budget for a liveness ping round trip.
    pub ping_timeout_ms: u64,
    /// Budget for bringing up one runtime (spawn + handshake).
    pub runtime_start_timeout_ms: u64,
    /// Extra attempts after a failed runtime start.
    pub runtime_start_retries: u32,
    /// Default round-trip budget for handler invocations.
    pub max_request_time_ms: u64,
    /// Per-handler overrides keyed by handler wire name (`onInstall`, ...).
    pub handler_timeouts_ms: BTreeMap<String, u64>,
    /// Execution events buffered per subscriber before the oldest are
    /// dropped.
    pub event_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: 2_000,
            runtime_start_timeout_ms: 10_000,
            runtime_start_retries: 2,
            max_request_time_ms: 60_000,
            handler_timeouts_ms: BTreeMap::from([
                ("onInstall".to_string(), 120_000),
                ("onUpdate".to_string(), 120_000),
                ("onCronjob".to_string(), 60_000),
            ]),
            event_capacity: 256,
        }
    }
}

impl ExecutionConfig {
    /// Ping budget.
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Runtime start budget.
    #[must_use]
    pub fn runtime_start_timeout(&self) -> Duration {
        Duration::from_millis(self.runtime_start_timeout_ms)
    }

    /// Default round-trip budget, also used for loading a snap.
    #[must_use]
    pub fn max_request_time(&self) -> Duration {
        Duration::from_millis(self.max_request_time_ms)
    }

    /// Round-trip budget for `handler`, falling back to `max_request_time_ms`.
    #[must_use]
    pub fn handler_timeout(&self, handler: &str) -> Duration {
        Duration::from_millis(
            self.handler_timeouts_ms
                .get(handler)
                .copied()
                .unwrap_or(self.max_request_time_ms),
        )
    }
}

/// What to do with a runtime when a snap's active references drop to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlePolicy {
    /// Tear the runtime down immediately; the snap becomes `Stopped`.
    #[default]
    StopWhenUnreferenced,
    /// Leave the runtime running.
    KeepAlive,
}

/// Snap controller settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Idle teardown policy.
    pub idle_policy: IdlePolicy,
    /// Ping a runtime before routing to it if it has been idle this long.
    pub ping_after_idle_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            idle_policy: IdlePolicy::default(),
            ping_after_idle_ms: 30_000,
        }
    }
}

impl ControllerConfig {
    /// Idle threshold after which a ping precedes routing.
    #[must_use]
    pub fn ping_after_idle(&self) -> Duration {
        Duration::from_millis(self.ping_after_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_timeout_falls_back_to_default() {
        let config = ExecutionConfig::default();
        assert_eq!(
            config.handler_timeout("onInstall"),
            Duration::from_millis(120_000)
        );
        assert_eq!(
            config.handler_timeout("onRpcRequest"),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn idle_policy_serializes_snake_case() {
        let config: ControllerConfig =
            toml::from_str("idle_policy = \"keep_alive\"").unwrap();
        assert_eq!(config.idle_policy, IdlePolicy::KeepAlive);
        assert_eq!(config.ping_after_idle_ms, 30_000);
    }
}
