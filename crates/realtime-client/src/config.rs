//! Environment-backed runtime configuration for the realtime client.

use std::{env, time::Duration};

use realtime_core::RetryPolicy;
use thiserror::Error;

use crate::{
    coalesce::{PRESENCE_DEBOUNCE, READ_RECEIPT_DEBOUNCE},
    diagnostics::{DEFAULT_OVERVIEW_PROCEDURE, DEFAULT_SCHEMA_HEALTH_PROCEDURE},
    safe_call::DEFAULT_CALL_TIMEOUT,
};

pub const DEFAULT_PRESENCE_PROCEDURE: &str = "update_conversation_presence";
pub const DEFAULT_MARK_READ_PROCEDURE: &str = "mark_conversation_read";

/// Runtime configuration of a [`crate::RealtimeClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Default timeout of a single remote call.
    pub rpc_timeout: Duration,
    /// Retry policy of calls made through the retrying path.
    pub rpc_retry: RetryPolicy,
    /// Reconnect policy of realtime channels.
    pub channel_retry: RetryPolicy,
    /// Quiet window of presence writes.
    pub presence_debounce: Duration,
    /// Quiet window of read-receipt writes.
    pub read_receipt_debounce: Duration,
    pub schema_health_procedure: String,
    pub overview_procedure: String,
    pub presence_procedure: String,
    pub mark_read_procedure: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_CALL_TIMEOUT,
            rpc_retry: RetryPolicy::for_calls(),
            channel_retry: RetryPolicy::for_channels(),
            presence_debounce: PRESENCE_DEBOUNCE,
            read_receipt_debounce: READ_RECEIPT_DEBOUNCE,
            schema_health_procedure: DEFAULT_SCHEMA_HEALTH_PROCEDURE.to_owned(),
            overview_procedure: DEFAULT_OVERVIEW_PROCEDURE.to_owned(),
            presence_procedure: DEFAULT_PRESENCE_PROCEDURE.to_owned(),
            mark_read_procedure: DEFAULT_MARK_READ_PROCEDURE.to_owned(),
        }
    }
}

impl ClientConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let rpc_timeout = positive_millis(
            "CARPOOL_RPC_TIMEOUT_MS",
            defaults.rpc_timeout,
            &mut lookup,
        )?;

        let rpc_retry = RetryPolicy::new(
            parse_optional_u32("CARPOOL_RPC_MAX_RETRIES", &mut lookup)?
                .unwrap_or(defaults.rpc_retry.max_retries()),
            parse_optional_u64("CARPOOL_RPC_RETRY_DELAY_MS", &mut lookup)?
                .unwrap_or(defaults.rpc_retry.delay_ms()),
        );
        let channel_retry = RetryPolicy::new(
            parse_optional_u32("CARPOOL_CHANNEL_RETRY_ATTEMPTS", &mut lookup)?
                .unwrap_or(defaults.channel_retry.max_retries()),
            parse_optional_u64("CARPOOL_CHANNEL_RETRY_DELAY_MS", &mut lookup)?
                .unwrap_or(defaults.channel_retry.delay_ms()),
        );

        let presence_debounce = positive_millis(
            "CARPOOL_PRESENCE_DEBOUNCE_MS",
            defaults.presence_debounce,
            &mut lookup,
        )?;
        let read_receipt_debounce = positive_millis(
            "CARPOOL_READ_RECEIPT_DEBOUNCE_MS",
            defaults.read_receipt_debounce,
            &mut lookup,
        )?;

        Ok(Self {
            rpc_timeout,
            rpc_retry,
            channel_retry,
            presence_debounce,
            read_receipt_debounce,
            schema_health_procedure: optional_trimmed_env(
                "CARPOOL_SCHEMA_HEALTH_PROCEDURE",
                &mut lookup,
            )
            .unwrap_or(defaults.schema_health_procedure),
            overview_procedure: optional_trimmed_env("CARPOOL_OVERVIEW_PROCEDURE", &mut lookup)
                .unwrap_or(defaults.overview_procedure),
            presence_procedure: optional_trimmed_env("CARPOOL_PRESENCE_PROCEDURE", &mut lookup)
                .unwrap_or(defaults.presence_procedure),
            mark_read_procedure: optional_trimmed_env("CARPOOL_MARK_READ_PROCEDURE", &mut lookup)
                .unwrap_or(defaults.mark_read_procedure),
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required variable is unset or blank.
    #[error("missing {key}")]
    Missing { key: &'static str },
    /// A variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Trimmed value of `key`, treating blank values as unset.
pub fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u32<F>(key: &'static str, lookup: &mut F) -> Result<Option<u32>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn positive_millis<F>(
    key: &'static str,
    default: Duration,
    lookup: &mut F,
) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    match parse_optional_u64(key, lookup)? {
        None => Ok(default),
        Some(0) => Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be greater than 0".to_owned(),
        }),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}
