// Cloud device endpoints
//
// Device roster, single-device details, and the LAN session parameters
// the cloud publishes for LAN-capable devices.

use tracing::debug;

use crate::auth::SessionToken;
use crate::cloud::client::CloudClient;
use crate::error::Error;
use crate::models::{DeviceEnvelope, DeviceRecord, LanConfigEnvelope, LanConfigRecord};

impl CloudClient {
    /// List every device registered to the signed-in user.
    ///
    /// `GET devices.json` returns `[{"device": {...}}, ...]`.
    pub async fn list_devices(&self, token: &SessionToken) -> Result<Vec<DeviceRecord>, Error> {
        let url = self.api_url("devices.json")?;
        debug!("listing devices");
        let wrapped: Vec<DeviceEnvelope> = self.get(token, url).await?;
        Ok(wrapped.into_iter().map(|w| w.device).collect())
    }

    /// Fetch one device.
    ///
    /// `GET dsns/{dsn}.json`
    pub async fn get_device(&self, token: &SessionToken, dsn: &str) -> Result<DeviceRecord, Error> {
        let url = self.api_url(&format!("dsns/{dsn}.json"))?;
        debug!(dsn, "fetching device");
        let wrapped: DeviceEnvelope = self.get(token, url).await?;
        Ok(wrapped.device)
    }

    /// Fetch LAN session parameters.
    ///
    /// `GET dsns/{dsn}/lan.json` returns `{"lanip": {...}}`.
    pub async fn get_lan_config(
        &self,
        token: &SessionToken,
        dsn: &str,
    ) -> Result<LanConfigRecord, Error> {
        let url = self.dsn_url(dsn, "lan.json")?;
        debug!(dsn, "fetching lan config");
        let wrapped: LanConfigEnvelope = self.get(token, url).await?;
        Ok(wrapped.lanip)
    }
}
