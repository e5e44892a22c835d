//! Tunables for pools, the replicated-state protocol and the world guard.
//!
//! Every field has a default so partial configuration files deserialize.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub pools: PoolConfig,
    pub protocol: ProtocolConfig,
    pub sync: SyncConfig,
}

/// Pool sizing. `None` ceilings let pools grow without bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle values kept per small pool (lists, maps, outbound buffers).
    pub retain_per_pool: usize,
    /// Idle values kept by the high-churn pools (payloads, component instances).
    pub payload_retain: usize,
    /// Hard ceiling on payload buffers on loan at once.
    pub payload_ceiling: Option<usize>,
    /// Hard ceiling on outbound buffers on loan at once.
    pub outbound_ceiling: Option<usize>,
    /// Initial capacity reserved by fresh message lists.
    pub message_list_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            retain_per_pool: 64,
            payload_retain: 4096,
            payload_ceiling: None,
            outbound_ceiling: None,
            message_list_capacity: 256,
        }
    }
}

/// Replicated-state protocol limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Appended values kept per (entity, component) before the set is cleared.
    pub max_append_components: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_append_components: 100,
        }
    }
}

/// World guard settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a scene waits for the world guard before giving up.
    pub acquire_timeout_ms: u64,
}

impl SyncConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 10_000,
        }
    }
}
