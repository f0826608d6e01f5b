// ── Runtime session configuration ──
//
// These types describe how a session polls, times out, and negotiates
// LAN mode. They never touch disk; `devlink-config` (or any embedder)
// builds a `SessionConfig` and hands it in.

use std::num::NonZeroU32;
use std::time::Duration;

/// LAN negotiation policy.
///
/// Has no `Default`; every field comes from deployment config. Without
/// a policy, LAN mode is never entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanPolicy {
    /// Upper bound on LAN config fetch plus handshake.
    pub handshake_timeout: Duration,
    /// Upper bound on one LAN exchange or keep-alive. A request that hits
    /// it counts as a link failure.
    pub request_timeout: Duration,
    /// Consecutive LAN failures that drop a device from `LanActive` to `Cloud`.
    pub failure_threshold: NonZeroU32,
    /// Wait in `LanFailed` before the handshake is retried.
    pub retry_cooldown: Duration,
    /// Keep-alive cadence while `LanActive`.
    pub heartbeat_interval: Duration,
}

/// Tuning for one session's registry and transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for every operation, measured from dispatch.
    pub operation_timeout: Duration,
    /// Per-device property poll cadence while reached through the cloud.
    pub cloud_poll_interval: Duration,
    /// Reduced cloud poll cadence while `LanActive`. `None` disables
    /// cloud polling for LAN devices entirely.
    pub lan_cloud_poll_interval: Option<Duration>,
    /// Roster re-fetch cadence. `None` disables periodic roster refresh.
    pub roster_refresh_interval: Option<Duration>,
    /// Worker-pool width: operations executing concurrently.
    pub max_in_flight: usize,
    pub lan: Option<LanPolicy>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            cloud_poll_interval: Duration::from_secs(5),
            lan_cloud_poll_interval: Some(Duration::from_secs(60)),
            roster_refresh_interval: Some(Duration::from_secs(15)),
            max_in_flight: 8,
            lan: None,
        }
    }
}

impl SessionConfig {
    pub fn with_lan(mut self, policy: LanPolicy) -> Self {
        self.lan = Some(policy);
        self
    }
}
