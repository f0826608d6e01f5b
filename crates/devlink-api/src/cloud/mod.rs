// Cloud REST collaborator
//
// `CloudApi` is the seam the core talks to; `CloudClient` is the
// reqwest-backed implementation.

pub(crate) mod client;
mod devices;
mod properties;

use async_trait::async_trait;

pub use client::CloudClient;

use crate::auth::SessionToken;
use crate::error::Error;
use crate::models::{DatapointRecord, DeviceRecord, LanConfigRecord, NewDatapoint, PropertyRecord};

/// Remote device service, addressed by device serial number.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn list_devices(&self, token: &SessionToken) -> Result<Vec<DeviceRecord>, Error>;

    async fn fetch_device(&self, token: &SessionToken, dsn: &str) -> Result<DeviceRecord, Error>;

    /// `None` fetches all properties.
    async fn fetch_properties(
        &self,
        token: &SessionToken,
        dsn: &str,
        names: Option<&[String]>,
    ) -> Result<Vec<PropertyRecord>, Error>;

    async fn create_datapoint(
        &self,
        token: &SessionToken,
        dsn: &str,
        property: &str,
        datapoint: &NewDatapoint,
    ) -> Result<DatapointRecord, Error>;

    async fn fetch_lan_config(
        &self,
        token: &SessionToken,
        dsn: &str,
    ) -> Result<LanConfigRecord, Error>;
}

#[async_trait]
impl CloudApi for CloudClient {
    async fn list_devices(&self, token: &SessionToken) -> Result<Vec<DeviceRecord>, Error> {
        CloudClient::list_devices(self, token).await
    }

    async fn fetch_device(&self, token: &SessionToken, dsn: &str) -> Result<DeviceRecord, Error> {
        self.get_device(token, dsn).await
    }

    async fn fetch_properties(
        &self,
        token: &SessionToken,
        dsn: &str,
        names: Option<&[String]>,
    ) -> Result<Vec<PropertyRecord>, Error> {
        self.get_properties(token, dsn, names).await
    }

    async fn create_datapoint(
        &self,
        token: &SessionToken,
        dsn: &str,
        property: &str,
        datapoint: &NewDatapoint,
    ) -> Result<DatapointRecord, Error> {
        self.post_datapoint(token, dsn, property, datapoint).await
    }

    async fn fetch_lan_config(
        &self,
        token: &SessionToken,
        dsn: &str,
    ) -> Result<LanConfigRecord, Error> {
        self.get_lan_config(token, dsn).await
    }
}
