use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use devlink_api::{LanLink, LanTarget};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Request, Response, Route, TransportChannel};
use crate::error::CoreError;
use crate::model::Dsn;

/// Routes requests over an established local session.
///
/// Requests to one device are serialized (one exchange at a time per
/// local connection); different devices proceed in parallel. Without a
/// session for the device, `execute` fails fast with
/// `TransportUnavailable`. Every exchange, keep-alives included, is cut
/// off after `request_timeout` with `Timeout`, so a silent device still
/// releases its lane and counts as a link failure.
pub struct LanChannel {
    link: Arc<dyn LanLink>,
    request_timeout: Duration,
    /// One lane per device with an open session.
    sessions: DashMap<Dsn, Arc<Mutex<()>>>,
}

impl LanChannel {
    pub fn new(link: Arc<dyn LanLink>, request_timeout: Duration) -> Self {
        Self {
            link,
            request_timeout,
            sessions: DashMap::new(),
        }
    }

    /// Run one exchange on the device's lane, bounded by `request_timeout`.
    async fn exchange<T, F>(&self, dsn: &Dsn, work: F) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, devlink_api::Error>>,
    {
        let lane = self.lane(dsn)?;
        let _turn = lane.lock().await;
        match tokio::time::timeout(self.request_timeout, work).await {
            Ok(result) => result.map_err(|e| CoreError::transport(Route::Lan, e)),
            Err(_) => {
                debug!(%dsn, timeout = ?self.request_timeout, "LAN exchange timed out");
                Err(CoreError::Timeout {
                    timeout_ms: u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    pub fn has_session(&self, dsn: &Dsn) -> bool {
        self.sessions.contains_key(dsn)
    }

    fn lane(&self, dsn: &Dsn) -> Result<Arc<Mutex<()>>, CoreError> {
        self.sessions
            .get(dsn)
            .map(|lane| Arc::clone(lane.value()))
            .ok_or_else(|| CoreError::TransportUnavailable {
                dsn: dsn.to_string(),
                reason: "no LAN session".into(),
            })
    }

    /// Handshake and register a session. Replaces any previous session.
    pub(crate) async fn open(&self, dsn: &Dsn, target: &LanTarget) -> Result<(), CoreError> {
        self.link
            .handshake(target)
            .await
            .map_err(|e| CoreError::transport(Route::Lan, e))?;
        self.sessions.insert(dsn.clone(), Arc::new(Mutex::new(())));
        debug!(%dsn, ip = %target.lan_ip, "LAN session open");
        Ok(())
    }

    pub(crate) async fn keep_alive(&self, dsn: &Dsn) -> Result<(), CoreError> {
        self.exchange(dsn, self.link.keep_alive(dsn.as_str())).await
    }

    /// Drop the session. New requests fail fast immediately; the returned
    /// future closes the link once any in-flight exchange finishes.
    pub(crate) fn detach(&self, dsn: &Dsn) -> Option<impl Future<Output = ()> + Send + 'static> {
        let (_, lane) = self.sessions.remove(dsn)?;
        let link = Arc::clone(&self.link);
        let dsn = dsn.clone();
        Some(async move {
            let _turn = lane.lock().await;
            link.close(dsn.as_str()).await;
            debug!(%dsn, "LAN session closed");
        })
    }

    pub(crate) async fn close(&self, dsn: &Dsn) {
        if let Some(closing) = self.detach(dsn) {
            closing.await;
        }
    }
}

#[async_trait]
impl TransportChannel for LanChannel {
    fn route(&self) -> Route {
        Route::Lan
    }

    async fn execute(&self, dsn: &Dsn, request: Request) -> Result<Response, CoreError> {
        debug!(%dsn, request = request.kind(), route = %Route::Lan, "dispatch");

        match request {
            Request::FetchProperties { names: Some(names) } => {
                let mut records = self
                    .exchange(dsn, self.link.fetch_properties(dsn.as_str(), &names))
                    .await?;
                // Local readings carry no device timestamp; stamp on receipt.
                let now = Utc::now();
                for record in &mut records {
                    record.data_updated_at.get_or_insert(now);
                }
                Ok(Response::Properties(records))
            }
            Request::CreateDatapoint {
                property,
                datapoint,
            } => {
                let mut echo = self
                    .exchange(
                        dsn,
                        self.link.create_datapoint(dsn.as_str(), &property, &datapoint),
                    )
                    .await?;
                echo.updated_at.get_or_insert_with(Utc::now);
                Ok(Response::Datapoint(echo))
            }
            other => Err(CoreError::TransportUnavailable {
                dsn: dsn.to_string(),
                reason: format!("{} is not available over LAN", other.kind()),
            }),
        }
    }
}
