// src/config.rs

//! Typed, validated configuration for the replication engine.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// A raw representation of the config file before validation and defaulting.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_max_pending_operations")]
    max_pending_operations: usize,
    #[serde(default = "default_max_pending_bytes")]
    max_pending_bytes: u64,
    #[serde(default = "default_max_replication_message_size")]
    max_replication_message_size: usize,
    #[serde(default = "default_initial_send_window_size")]
    initial_send_window_size: usize,
    #[serde(default = "default_max_send_window_size")]
    max_send_window_size: usize,
    #[serde(default = "default_retransmit_timeout_ms")]
    retransmit_timeout_ms: u64,
    #[serde(default = "default_keep_alive_interval_ms")]
    keep_alive_interval_ms: u64,
    #[serde(default)]
    use_stream_faults_and_eos_ack: bool,
    #[serde(default = "default_max_pending_acknowledgements")]
    max_pending_acknowledgements: usize,
    #[serde(default = "default_ack_batching_period_ms")]
    ack_batching_period_ms: u64,
    #[serde(default = "default_close_drain_timeout_ms")]
    close_drain_timeout_ms: u64,
    #[serde(default = "default_min_write_quorum")]
    min_write_quorum: usize,
    #[serde(default)]
    require_service_ack: bool,
    #[serde(default = "default_secondary_clear_acknowledged_operations")]
    secondary_clear_acknowledged_operations: bool,
}

fn default_max_pending_operations() -> usize {
    100_000
}
fn default_max_pending_bytes() -> u64 {
    512 * 1024 * 1024
}
fn default_max_replication_message_size() -> usize {
    4 * 1024 * 1024
}
fn default_initial_send_window_size() -> usize {
    // original_source: DEFAULT_MAX_SWS_WHEN_0
    1024
}
fn default_max_send_window_size() -> usize {
    // original_source: initial window * DEFAULT_MAX_SWS_FACTOR_WHEN_0
    default_initial_send_window_size() * 4
}
fn default_retransmit_timeout_ms() -> u64 {
    3_000
}
fn default_keep_alive_interval_ms() -> u64 {
    30_000
}
fn default_max_pending_acknowledgements() -> usize {
    0
}
fn default_ack_batching_period_ms() -> u64 {
    15
}
fn default_close_drain_timeout_ms() -> u64 {
    30_000
}
fn default_min_write_quorum() -> usize {
    1
}
fn default_secondary_clear_acknowledged_operations() -> bool {
    true
}

/// Resolved, validated engine configuration. Constructed either via
/// [`ReplicatorConfig::from_file`] or [`ReplicatorConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Max operations an `OperationQueue` holds before rejecting enqueues.
    pub max_pending_operations: usize,
    /// Max total payload bytes an `OperationQueue` holds before rejecting enqueues.
    pub max_pending_bytes: u64,
    /// Messages larger than this are rejected rather than handed to the transport.
    pub max_replication_message_size: usize,
    /// `ReliableOperationSender`'s starting window size.
    pub initial_send_window_size: usize,
    /// `ReliableOperationSender`'s window ceiling.
    pub max_send_window_size: usize,
    pub retransmit_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// When set, a secondary reports stream faults and sends an end-of-stream ack.
    pub use_stream_faults_and_eos_ack: bool,
    /// Max operations awaiting acknowledgement before throttling; `0` disables the bound.
    pub max_pending_acknowledgements: usize,
    pub ack_batching_period: Duration,
    /// How long `Close` waits for in-flight committed operations to drain.
    pub close_drain_timeout: Duration,
    /// Minimum number of acks (including the primary) required to advance the commit watermark.
    pub min_write_quorum: usize,
    /// Whether the secondary waits for the state provider's explicit ack
    /// before considering an operation (or the end-of-stream sentinel)
    /// complete, rather than treating dispatch alone as sufficient.
    pub require_service_ack: bool,
    /// `OperationQueue::clean_on_complete` on the secondary's replication
    /// queue — whether acknowledged operations are evicted immediately or
    /// retained for re-serving (e.g. after a secondary-to-primary promotion).
    pub secondary_clear_acknowledged_operations: bool,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            max_pending_operations: default_max_pending_operations(),
            max_pending_bytes: default_max_pending_bytes(),
            max_replication_message_size: default_max_replication_message_size(),
            initial_send_window_size: default_initial_send_window_size(),
            max_send_window_size: default_max_send_window_size(),
            retransmit_timeout: Duration::from_millis(default_retransmit_timeout_ms()),
            keep_alive_interval: Duration::from_millis(default_keep_alive_interval_ms()),
            use_stream_faults_and_eos_ack: false,
            max_pending_acknowledgements: default_max_pending_acknowledgements(),
            ack_batching_period: Duration::from_millis(default_ack_batching_period_ms()),
            close_drain_timeout: Duration::from_millis(default_close_drain_timeout_ms()),
            min_write_quorum: default_min_write_quorum(),
            require_service_ack: false,
            secondary_clear_acknowledged_operations: default_secondary_clear_acknowledged_operations(),
        }
    }
}

impl ReplicatorConfig {
    /// Loads, resolves and validates a config from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;

        let config = Self {
            max_pending_operations: raw.max_pending_operations,
            max_pending_bytes: raw.max_pending_bytes,
            max_replication_message_size: raw.max_replication_message_size,
            initial_send_window_size: raw.initial_send_window_size,
            max_send_window_size: raw.max_send_window_size,
            retransmit_timeout: Duration::from_millis(raw.retransmit_timeout_ms),
            keep_alive_interval: Duration::from_millis(raw.keep_alive_interval_ms),
            use_stream_faults_and_eos_ack: raw.use_stream_faults_and_eos_ack,
            max_pending_acknowledgements: raw.max_pending_acknowledgements,
            ack_batching_period: Duration::from_millis(raw.ack_batching_period_ms),
            close_drain_timeout: Duration::from_millis(raw.close_drain_timeout_ms),
            min_write_quorum: raw.min_write_quorum,
            require_service_ack: raw.require_service_ack,
            secondary_clear_acknowledged_operations: raw.secondary_clear_acknowledged_operations,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_pending_operations == 0 {
            return Err(anyhow!("max_pending_operations cannot be 0"));
        }
        if self.max_replication_message_size == 0 {
            return Err(anyhow!("max_replication_message_size cannot be 0"));
        }
        if self.initial_send_window_size == 0 {
            return Err(anyhow!("initial_send_window_size cannot be 0"));
        }
        if self.max_send_window_size < self.initial_send_window_size {
            return Err(anyhow!(
                "max_send_window_size must be >= initial_send_window_size"
            ));
        }
        if self.min_write_quorum == 0 {
            return Err(anyhow!("min_write_quorum cannot be 0"));
        }
        if self.use_stream_faults_and_eos_ack && self.max_pending_acknowledgements == 0 {
            return Err(anyhow!(
                "max_pending_acknowledgements must be set when use_stream_faults_and_eos_ack is enabled"
            ));
        }
        if self.retransmit_timeout.is_zero() {
            return Err(anyhow!("retransmit_timeout cannot be 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ReplicatorConfig::default().validate().is_ok());
    }

    #[test]
    fn stream_faults_requires_pending_ack_bound() {
        let mut cfg = ReplicatorConfig::default();
        cfg.use_stream_faults_and_eos_ack = true;
        cfg.max_pending_acknowledgements = 0;
        assert!(cfg.validate().is_err());

        cfg.max_pending_acknowledgements = 1000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn window_ceiling_must_not_be_below_floor() {
        let mut cfg = ReplicatorConfig::default();
        cfg.initial_send_window_size = 100;
        cfg.max_send_window_size = 10;
        assert!(cfg.validate().is_err());
    }
}
