use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use devlink_api::{CloudApi, DeviceRecord, LanConfigRecord, SessionToken};
use tracing::debug;

use super::{Request, Response, Route, TransportChannel};
use crate::error::CoreError;
use crate::model::Dsn;

/// Routes every request through the cloud REST collaborator.
///
/// Available for as long as the session holds a token; after sign-out
/// every call fails with `SessionClosed`.
pub struct CloudChannel {
    api: Arc<dyn CloudApi>,
    token: Arc<ArcSwapOption<SessionToken>>,
}

impl CloudChannel {
    pub fn new(api: Arc<dyn CloudApi>, token: Arc<ArcSwapOption<SessionToken>>) -> Self {
        Self { api, token }
    }

    fn token(&self) -> Result<Arc<SessionToken>, CoreError> {
        self.token.load_full().ok_or(CoreError::SessionClosed)
    }

    pub(crate) async fn list_devices(&self) -> Result<Vec<DeviceRecord>, CoreError> {
        let token = self.token()?;
        self.api
            .list_devices(&token)
            .await
            .map_err(|e| CoreError::transport(Route::Cloud, e))
    }

    pub(crate) async fn fetch_lan_config(&self, dsn: &Dsn) -> Result<LanConfigRecord, CoreError> {
        let token = self.token()?;
        self.api
            .fetch_lan_config(&token, dsn.as_str())
            .await
            .map_err(|e| CoreError::transport(Route::Cloud, e))
    }
}

#[async_trait]
impl TransportChannel for CloudChannel {
    fn route(&self) -> Route {
        Route::Cloud
    }

    async fn execute(&self, dsn: &Dsn, request: Request) -> Result<Response, CoreError> {
        let token = self.token()?;
        debug!(%dsn, request = request.kind(), route = %Route::Cloud, "dispatch");

        let result = match request {
            Request::FetchDevice => self
                .api
                .fetch_device(&token, dsn.as_str())
                .await
                .map(Response::Device),
            Request::FetchProperties { names } => self
                .api
                .fetch_properties(&token, dsn.as_str(), names.as_deref())
                .await
                .map(Response::Properties),
            Request::CreateDatapoint {
                property,
                datapoint,
            } => self
                .api
                .create_datapoint(&token, dsn.as_str(), &property, &datapoint)
                .await
                .map(Response::Datapoint),
        };
        result.map_err(|e| CoreError::transport(Route::Cloud, e))
    }
}
