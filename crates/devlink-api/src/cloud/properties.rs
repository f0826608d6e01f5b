// Cloud property endpoints
//
// Property reads (all or a named subset) and datapoint writes.

use tracing::debug;

use crate::auth::SessionToken;
use crate::cloud::client::CloudClient;
use crate::error::Error;
use crate::models::{
    DatapointEnvelope, DatapointRecord, NewDatapoint, PropertyEnvelope, PropertyRecord,
};

impl CloudClient {
    /// Fetch properties for one device.
    ///
    /// `GET dsns/{dsn}/properties.json[?names[]=a&names[]=b]`
    ///
    /// `None` fetches every property the device exposes.
    pub async fn get_properties(
        &self,
        token: &SessionToken,
        dsn: &str,
        names: Option<&[String]>,
    ) -> Result<Vec<PropertyRecord>, Error> {
        let mut url = self.dsn_url(dsn, "properties.json")?;
        if let Some(names) = names {
            let mut pairs = url.query_pairs_mut();
            for name in names {
                pairs.append_pair("names[]", name);
            }
        }
        debug!(dsn, count = names.map(<[String]>::len), "fetching properties");
        let wrapped: Vec<PropertyEnvelope> = self.get(token, url).await?;
        Ok(wrapped.into_iter().map(|w| w.property).collect())
    }

    /// Write a datapoint.
    ///
    /// `POST dsns/{dsn}/properties/{name}/datapoints.json` with
    /// `{"datapoint": {"value": ..., "metadata": {...}}}`
    pub async fn post_datapoint(
        &self,
        token: &SessionToken,
        dsn: &str,
        property: &str,
        datapoint: &NewDatapoint,
    ) -> Result<DatapointRecord, Error> {
        let url = self.dsn_url(dsn, &format!("properties/{property}/datapoints.json"))?;
        debug!(dsn, property, "creating datapoint");
        let body = DatapointEnvelope {
            datapoint: datapoint,
        };
        let wrapped: DatapointEnvelope<DatapointRecord> = self.post(token, url, &body).await?;
        Ok(wrapped.datapoint)
    }
}
