// LAN link contract.
//
// The wire-level local protocol (key exchange, encryption, the embedded
// HTTP endpoint on the device) lives outside this workspace. The core
// only needs the operations below; integrators plug in an implementation.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::Error;
use crate::models::{DatapointRecord, LanConfigRecord, NewDatapoint, PropertyRecord};

/// Everything needed to open a local session with one device.
#[derive(Debug, Clone)]
pub struct LanTarget {
    pub dsn: String,
    pub lan_ip: IpAddr,
    pub config: LanConfigRecord,
}

/// Local-network collaborator.
///
/// Implementations must serialize requests per device themselves only if
/// the device requires it; the core already serializes per-device LAN
/// traffic. Property readings returned here carry no timestamp; the core
/// stamps them on arrival.
#[async_trait]
pub trait LanLink: Send + Sync {
    /// Establish an authenticated local session.
    async fn handshake(&self, target: &LanTarget) -> Result<(), Error>;

    /// Keep an established session alive. An error means the session is gone.
    async fn keep_alive(&self, dsn: &str) -> Result<(), Error>;

    /// Read the named properties over the local session.
    async fn fetch_properties(
        &self,
        dsn: &str,
        names: &[String],
    ) -> Result<Vec<PropertyRecord>, Error>;

    /// Write one datapoint over the local session.
    async fn create_datapoint(
        &self,
        dsn: &str,
        property: &str,
        datapoint: &NewDatapoint,
    ) -> Result<DatapointRecord, Error>;

    /// Tear down the local session. Idempotent.
    async fn close(&self, dsn: &str);
}
