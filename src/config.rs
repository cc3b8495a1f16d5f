use crate::error::EngineError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
pub const DEFAULT_WAGER_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_BALANCE_TIMEOUT_MS: u64 = 10_000;
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 120_000;
pub const MIN_POLL_INTERVAL_MS: u64 = 250;
pub const MAX_POLL_INTERVAL_MS: u64 = 30_000;
pub const MIN_CONSECUTIVE_FAILURES: u32 = 1;
pub const MAX_CONSECUTIVE_FAILURES: u32 = 50;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;

/// Caller-supplied arguments; every field optional, normalized into a
/// validated [`ClientConfig`] before any task is spawned.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientArgs {
    pub ws_url: Option<String>,
    pub rest_url: Option<String>,
    /// Authenticated wallet address from the external auth component;
    /// threaded through commands untouched, never validated here.
    pub player_address: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub max_consecutive_failures: Option<u32>,
    pub wager_timeout_ms: Option<u64>,
    pub balance_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ws_url: String,
    pub rest_url: String,
    pub player_address: String,
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub max_consecutive_failures: u32,
    pub wager_timeout_ms: u64,
    pub balance_timeout_ms: u64,
}

impl ClientArgs {
    pub fn normalize(self) -> Result<ClientConfig, EngineError> {
        let ws_url = required_url(self.ws_url, "wsUrl", &["ws://", "wss://"])?;
        let rest_url = required_url(self.rest_url, "restUrl", &["http://", "https://"])?;

        let player_address = self.player_address.unwrap_or_default().trim().to_string();
        if player_address.is_empty() {
            return Err(EngineError::InvalidArgument(
                "playerAddress must be a non-empty string".to_string(),
            ));
        }

        let heartbeat_interval_ms = self
            .heartbeat_interval_ms
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        if !(MIN_HEARTBEAT_INTERVAL_MS..=MAX_HEARTBEAT_INTERVAL_MS)
            .contains(&heartbeat_interval_ms)
        {
            return Err(EngineError::InvalidArgument(format!(
                "heartbeatIntervalMs must be between {MIN_HEARTBEAT_INTERVAL_MS} and {MAX_HEARTBEAT_INTERVAL_MS}"
            )));
        }

        let poll_interval_ms = self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&poll_interval_ms) {
            return Err(EngineError::InvalidArgument(format!(
                "pollIntervalMs must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS}"
            )));
        }

        let max_consecutive_failures = self
            .max_consecutive_failures
            .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES);
        if !(MIN_CONSECUTIVE_FAILURES..=MAX_CONSECUTIVE_FAILURES)
            .contains(&max_consecutive_failures)
        {
            return Err(EngineError::InvalidArgument(format!(
                "maxConsecutiveFailures must be between {MIN_CONSECUTIVE_FAILURES} and {MAX_CONSECUTIVE_FAILURES}"
            )));
        }

        let wager_timeout_ms = self.wager_timeout_ms.unwrap_or(DEFAULT_WAGER_TIMEOUT_MS);
        let balance_timeout_ms = self.balance_timeout_ms.unwrap_or(DEFAULT_BALANCE_TIMEOUT_MS);
        for (name, value) in [
            ("wagerTimeoutMs", wager_timeout_ms),
            ("balanceTimeoutMs", balance_timeout_ms),
        ] {
            if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&value) {
                return Err(EngineError::InvalidArgument(format!(
                    "{name} must be between {MIN_REQUEST_TIMEOUT_MS} and {MAX_REQUEST_TIMEOUT_MS}"
                )));
            }
        }

        Ok(ClientConfig {
            ws_url,
            rest_url,
            player_address,
            heartbeat_interval_ms,
            poll_interval_ms,
            max_consecutive_failures,
            wager_timeout_ms,
            balance_timeout_ms,
        })
    }
}

fn required_url(
    value: Option<String>,
    name: &str,
    schemes: &[&str],
) -> Result<String, EngineError> {
    let url = value.unwrap_or_default().trim().to_string();
    if url.is_empty() || !schemes.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(EngineError::InvalidArgument(format!(
            "{name} must start with one of {schemes:?}"
        )));
    }
    Ok(url)
}
