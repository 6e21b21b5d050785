//! Post-merge validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Upper bound on runtime start retries.
const MAX_START_RETRIES: u32 = 10;

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

/// Validate a fully merged configuration.
///
/// # Errors
///
/// Returns the first [`ConfigError::ValidationError`] found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    let exec = &config.execution;
    for (field, value) in [
        ("execution.ping_timeout_ms", exec.ping_timeout_ms),
        ("execution.runtime_start_timeout_ms", exec.runtime_start_timeout_ms),
        ("execution.max_request_time_ms", exec.max_request_time_ms),
        ("controller.ping_after_idle_ms", config.controller.ping_after_idle_ms),
    ] {
        if value == 0 {
            return Err(invalid(field, "must be greater than 0"));
        }
    }

    if exec.event_capacity == 0 {
        return Err(invalid("execution.event_capacity", "must be greater than 0"));
    }

    if exec.runtime_start_retries > MAX_START_RETRIES {
        return Err(invalid(
            "execution.runtime_start_retries",
            format!("must be at most {MAX_START_RETRIES}"),
        ));
    }

    for (handler, budget) in &exec.handler_timeouts_ms {
        if !handler.starts_with("on") {
            return Err(invalid(
                format!("execution.handler_timeouts_ms.{handler}"),
                "keys must be handler names such as 'onInstall'",
            ));
        }
        if *budget == 0 {
            return Err(invalid(
                format!("execution.handler_timeouts_ms.{handler}"),
                "must be greater than 0",
            ));
        }
    }

    if config.logging.level.trim().is_empty() {
        return Err(invalid("logging.level", "must not be empty"));
    }
    Ok(())
}
