use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::Error;

/// User credentials for signing in to the device cloud.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<SecretString>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Application identity registered with the cloud service.
///
/// Sent alongside every sign-in so the service can scope the issued
/// token to one application.
#[derive(Debug, Clone)]
pub struct AppCredentials {
    pub app_id: String,
    pub app_secret: SecretString,
}

/// Bearer material issued by the user service on a successful sign-in.
///
/// The access token is sent as `Authorization: auth_token <token>` on
/// every cloud request. Never logged.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionToken {
    pub fn new(access_token: impl Into<SecretString>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: SecretString::from(String::new()),
            expires_at: None,
        }
    }

    /// True once `expires_at` is in the past. Tokens without an
    /// expiry never report expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Authentication/session collaborator.
///
/// Issues the bearer used by the cloud channel and revokes it on sign-out.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn sign_in(&self, credentials: &Credentials) -> Result<SessionToken, Error>;

    async fn sign_out(&self, token: &SessionToken) -> Result<(), Error>;
}
