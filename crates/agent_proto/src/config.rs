//! `NetworkConfig`/`AgentConfig` (§6) — loaded from environment variables
//! with `serde` defaults, the way `guard-service::connected` builds its
//! `ConnectedConfig` from `std::env::var`. Held inside `AgentContext` and
//! passed down to every operation rather than read from globals.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Transport-level network settings, independent of the agent protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub socks_proxy: Option<String>,
    pub tcp_timeout: Duration,
    pub tcp_keep_alive: Option<Duration>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            socks_proxy: std::env::var("AGENT_SOCKS_PROXY").ok(),
            tcp_timeout: Duration::from_secs(env_or("AGENT_TCP_TIMEOUT_SECS", 10)),
            tcp_keep_alive: Some(Duration::from_secs(env_or("AGENT_TCP_KEEPALIVE_SECS", 30))),
        }
    }
}

/// A `(min, max)` inclusive version range, as carried in `VersionRange`
/// negotiation during connection establishment (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub min_version: u16,
    pub max_version: u16,
}

impl VersionRange {
    pub fn compatible(&self, other: &VersionRange) -> Option<u16> {
        let lo = self.min_version.max(other.min_version);
        let hi = self.max_version.min(other.max_version);
        (lo <= hi).then_some(hi)
    }
}

/// Protocol-level tuning (§6). `e2e_enc_conn_info_length`/
/// `e2e_enc_user_msg_length` are the two fixed padded lengths referenced by
/// [`crate::codec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub smp_client_v_range: VersionRange,
    pub smp_agent_v_range: VersionRange,
    pub message_retry_interval: Duration,
    pub hello_timeout: Duration,
    pub message_timeout: Duration,
    /// Cron-style schedule for periodic notification-token maintenance.
    pub ntf_cron: String,
    pub ntf_max_messages: u32,
    /// Signature algorithm used for per-queue command signing keys.
    pub cmd_sign_alg: String,
    pub e2e_enc_conn_info_length: usize,
    pub e2e_enc_user_msg_length: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            smp_client_v_range: VersionRange { min_version: 1, max_version: 6 },
            smp_agent_v_range: VersionRange { min_version: 1, max_version: 4 },
            message_retry_interval: Duration::from_secs(env_or("AGENT_MSG_RETRY_SECS", 60)),
            hello_timeout: Duration::from_secs(env_or("AGENT_HELLO_TIMEOUT_SECS", 2 * 24 * 3600)),
            message_timeout: Duration::from_secs(env_or("AGENT_MSG_TIMEOUT_SECS", 2 * 24 * 3600)),
            ntf_cron: std::env::var("AGENT_NTF_CRON").unwrap_or_else(|_| "0 */4 * * *".to_string()),
            ntf_max_messages: env_or("AGENT_NTF_MAX_MESSAGES", 6),
            cmd_sign_alg: std::env::var("AGENT_CMD_SIGN_ALG").unwrap_or_else(|_| "ed25519".to_string()),
            e2e_enc_conn_info_length: env_or("AGENT_E2E_CONN_INFO_LEN", 14848),
            e2e_enc_user_msg_length: env_or("AGENT_E2E_USER_MSG_LEN", 16384),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_range_intersection() {
        let a = VersionRange { min_version: 1, max_version: 4 };
        let b = VersionRange { min_version: 3, max_version: 6 };
        assert_eq!(a.compatible(&b), Some(4));
    }

    #[test]
    fn version_range_incompatible() {
        let a = VersionRange { min_version: 1, max_version: 2 };
        let b = VersionRange { min_version: 3, max_version: 6 };
        assert_eq!(a.compatible(&b), None);
    }
}
