// ── Device domain types ──

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::Display;

use super::dsn::Dsn;
use super::property::{DataSource, PropertyState};

/// Which transport a device is currently reached through.
///
/// `Cloud` is the initial mode. LAN is only used in `LanActive`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum LinkMode {
    #[default]
    Cloud,
    /// Handshake in progress.
    LanPending,
    /// Local session verified.
    LanActive,
    /// Handshake rejected or timed out; cooling down before a retry.
    LanFailed,
}

impl LinkMode {
    /// Whether the state machine allows `self -> to`.
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (_, Self::Cloud)
                | (Self::Cloud | Self::LanFailed, Self::LanPending)
                | (Self::LanPending, Self::LanActive | Self::LanFailed)
        )
    }
}

/// Cloud-reported connectivity of the device itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[non_exhaustive]
pub enum ConnectionStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl ConnectionStatus {
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Point-in-time view of one device.
///
/// Vended as `Arc<DeviceState>` snapshots; never torn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub dsn: Dsn,
    pub product_name: Option<String>,
    pub model: Option<String>,
    pub oem_model: Option<String>,
    pub mac: Option<String>,
    pub sw_version: Option<String>,
    /// The device advertises LAN support.
    pub lan_capable: bool,
    pub lan_ip: Option<IpAddr>,
    pub connection_status: ConnectionStatus,
    pub mode: LinkMode,
    pub properties: IndexMap<String, PropertyState>,
    /// Last successful exchange with the device over either transport.
    pub last_contact: Option<DateTime<Utc>>,
    /// Gone from the cloud roster but kept while writes are pending.
    pub removed: bool,
    pub source: DataSource,
}

impl DeviceState {
    pub fn property(&self, name: &str) -> Option<&PropertyState> {
        self.properties.get(name)
    }

    pub fn has_pending_writes(&self) -> bool {
        self.properties.values().any(|p| p.pending_write)
    }

    /// Whether every name is already known locally.
    pub fn knows_all<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().all(|n| self.properties.contains_key(n.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_mode_transitions_follow_state_machine() {
        use LinkMode::{Cloud, LanActive, LanFailed, LanPending};

        assert!(Cloud.can_transition_to(LanPending));
        assert!(LanPending.can_transition_to(LanActive));
        assert!(LanPending.can_transition_to(LanFailed));
        assert!(LanActive.can_transition_to(Cloud));
        assert!(LanFailed.can_transition_to(LanPending));
        assert!(LanFailed.can_transition_to(Cloud));

        assert!(!Cloud.can_transition_to(LanActive));
        assert!(!LanFailed.can_transition_to(LanActive));
        assert!(!LanActive.can_transition_to(LanPending));
        assert!(!Cloud.can_transition_to(LanFailed));
    }
}
