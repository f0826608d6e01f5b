// ── Session ──
//
// One authenticated login. Owns the token the cloud channel signs
// requests with and exactly one device registry. Sessions share
// nothing; two logins are two independent `Session` values.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use devlink_api::{Authenticator, CloudApi, Credentials, LanLink, SessionToken};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::CoreError;
use crate::model::DeviceState;
use crate::registry::{DeviceRegistry, PushHint};
use crate::transport::{CloudChannel, LanChannel};

/// Collects collaborators for a new session.
pub struct SessionBuilder {
    auth: Arc<dyn Authenticator>,
    cloud: Arc<dyn CloudApi>,
    lan: Option<Arc<dyn LanLink>>,
    config: SessionConfig,
}

impl SessionBuilder {
    /// Enable LAN mode through `link`. Without it every device stays on
    /// the cloud.
    pub fn lan(mut self, link: Arc<dyn LanLink>) -> Self {
        self.lan = Some(link);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Authenticate and create the session. No network traffic beyond
    /// sign-in happens until [`Session::start`].
    pub async fn sign_in(self, credentials: &Credentials) -> Result<Session, CoreError> {
        validate_email(&credentials.email)?;
        let token = self.auth.sign_in(credentials).await?;
        let session = Session::with_token(self, token);
        info!(session = %session.id(), "signed in");
        Ok(session)
    }
}

fn validate_email(email: &str) -> Result<(), CoreError> {
    let well_formed = email
        .split_once('@')
        .is_some_and(|(user, host)| !user.is_empty() && host.contains('.') && !host.contains('@'));
    if well_formed {
        Ok(())
    } else {
        Err(CoreError::InvalidArgument {
            message: format!("malformed email address: {email:?}"),
        })
    }
}

/// An authenticated session.
///
/// Cheaply cloneable. Signing out through any clone ends the session
/// for all of them.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    auth: Arc<dyn Authenticator>,
    token: Arc<ArcSwapOption<SessionToken>>,
    registry: DeviceRegistry,
    cancel: CancellationToken,
}

impl Session {
    pub fn builder(auth: Arc<dyn Authenticator>, cloud: Arc<dyn CloudApi>) -> SessionBuilder {
        SessionBuilder {
            auth,
            cloud,
            lan: None,
            config: SessionConfig::default(),
        }
    }

    fn with_token(builder: SessionBuilder, token: SessionToken) -> Self {
        let token = Arc::new(ArcSwapOption::from_pointee(token));
        let cloud = Arc::new(CloudChannel::new(builder.cloud, Arc::clone(&token)));
        let request_timeout = builder
            .config
            .lan
            .as_ref()
            .map_or(builder.config.operation_timeout, |policy| policy.request_timeout);
        let lan = builder
            .lan
            .map(|link| Arc::new(LanChannel::new(link, request_timeout)));
        let registry = DeviceRegistry::new(builder.config, cloud, lan);

        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                auth: builder.auth,
                token,
                registry,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn token(&self) -> Option<Arc<SessionToken>> {
        self.inner.token.load_full()
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner.token.load().is_some()
    }

    /// Fetch the device list, then start roster refresh and polling.
    pub async fn start(&self) -> Result<Vec<Arc<DeviceState>>, CoreError> {
        if !self.is_signed_in() {
            return Err(CoreError::SessionClosed);
        }
        let devices = self.inner.registry.fetch_devices().await?;
        self.inner.registry.start();
        debug!(session = %self.id(), devices = devices.len(), "session started");
        Ok(devices)
    }

    /// Feed "device changed" hints from a push channel into poll-and-merge
    /// cycles. The task ends when the sender is dropped or on sign-out.
    pub fn attach_push_channel(&self, mut hints: mpsc::Receiver<PushHint>) -> JoinHandle<()> {
        let registry = self.inner.registry.clone();
        let cancel = self.inner.cancel.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    hint = hints.recv() => {
                        let Some(hint) = hint else { break };
                        let dsn = hint.dsn.clone();
                        if let Err(e) = registry.handle_push(hint).await {
                            warn!(%dsn, error = %e, "push refresh failed");
                        }
                    }
                }
            }
            debug!("push channel detached");
        })
    }

    /// End the session: every device drops to `Cloud`, LAN sessions close,
    /// background tasks stop, and the token is revoked.
    ///
    /// Local teardown always happens; an error only means revocation
    /// failed. Signing out twice is a no-op.
    pub async fn sign_out(&self) -> Result<(), CoreError> {
        let Some(token) = self.inner.token.swap(None) else {
            return Ok(());
        };
        self.inner.cancel.cancel();
        self.inner.registry.shutdown();
        info!(session = %self.id(), "signed out");

        self.inner.auth.sign_out(&token).await.map_err(CoreError::from)
    }
}
