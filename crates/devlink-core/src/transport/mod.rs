// ── Transport channels ──
//
// A channel executes one request against one device. Channels hold no
// device state; the registry hands them everything they need.

mod cloud;
mod lan;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devlink_api::{DatapointRecord, DeviceRecord, NewDatapoint, PropertyRecord};
use serde::{Deserialize, Serialize};
use strum::Display;

pub use cloud::CloudChannel;
pub use lan::LanChannel;

use crate::error::CoreError;
use crate::model::Dsn;
use crate::operation::Operation;

/// Which channel a request travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum Route {
    Cloud,
    Lan,
}

/// One unit of work for a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Device metadata. Cloud only.
    FetchDevice,
    /// `None` reads every property (cloud only); LAN needs explicit names.
    FetchProperties { names: Option<Vec<String>> },
    CreateDatapoint {
        property: String,
        datapoint: NewDatapoint,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FetchDevice => "fetch_device",
            Self::FetchProperties { .. } => "fetch_properties",
            Self::CreateDatapoint { .. } => "create_datapoint",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::CreateDatapoint { .. })
    }
}

/// Raw channel output, before conversion into the domain model.
#[derive(Debug, Clone)]
pub enum Response {
    Device(DeviceRecord),
    Properties(Vec<PropertyRecord>),
    Datapoint(DatapointRecord),
}

impl Response {
    pub(crate) fn into_device(self, route: Route) -> Result<DeviceRecord, CoreError> {
        match self {
            Self::Device(d) => Ok(d),
            other => Err(unexpected(route, "device", &other)),
        }
    }

    pub(crate) fn into_properties(self, route: Route) -> Result<Vec<PropertyRecord>, CoreError> {
        match self {
            Self::Properties(p) => Ok(p),
            other => Err(unexpected(route, "properties", &other)),
        }
    }

    pub(crate) fn into_datapoint(self, route: Route) -> Result<DatapointRecord, CoreError> {
        match self {
            Self::Datapoint(d) => Ok(d),
            other => Err(unexpected(route, "datapoint", &other)),
        }
    }
}

fn unexpected(route: Route, wanted: &str, got: &Response) -> CoreError {
    CoreError::transport(
        route,
        devlink_api::Error::Deserialization {
            message: format!("expected {wanted} response"),
            body: format!("{got:?}"),
        },
    )
}

/// A stateless executor for device requests.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn route(&self) -> Route;

    async fn execute(&self, dsn: &Dsn, request: Request) -> Result<Response, CoreError>;
}

/// Dispatch `request` on `channel` as an [`Operation`].
pub fn send(
    channel: Arc<dyn TransportChannel>,
    dsn: Dsn,
    request: Request,
    timeout: Duration,
) -> Operation<Response> {
    let op = Operation::new(format!("{}:{}:{dsn}", channel.route(), request.kind()), timeout);
    op.run(None, async move { channel.execute(&dsn, request).await });
    op
}
