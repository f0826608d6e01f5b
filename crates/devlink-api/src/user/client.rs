// User service HTTP client
//
// Token-based sign-in/sign-out against the account service. Sign-in
// exchanges user + application credentials for an access/refresh token
// pair; sign-out revokes the access token server-side.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::auth::{AppCredentials, Authenticator, Credentials, SessionToken};
use crate::cloud::client::preview;
use crate::error::Error;
use crate::transport::TransportConfig;

#[derive(Deserialize)]
struct SignInResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Raw HTTP client for the user/account service.
#[derive(Debug, Clone)]
pub struct UserClient {
    http: reqwest::Client,
    base_url: Url,
    app: AppCredentials,
}

impl UserClient {
    /// `base_url` is the user service root, e.g. `https://user-dev.example.com/`.
    pub fn new(base_url: Url, app: AppCredentials, transport: &TransportConfig) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self::with_client(http, base_url, app))
    }

    pub fn with_client(http: reqwest::Client, mut base_url: Url, app: AppCredentials) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            http,
            base_url,
            app,
        }
    }

    /// Exchange credentials for a session token.
    ///
    /// `POST users/sign_in.json`
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<SessionToken, Error> {
        let url = self.base_url.join("users/sign_in.json")?;
        debug!(email = %credentials.email, "signing in at {}", url);

        let body = json!({
            "user": {
                "email": credentials.email,
                "password": credentials.password.expose_secret(),
                "application": {
                    "app_id": self.app.app_id,
                    "app_secret": self.app.app_secret.expose_secret(),
                },
            },
        });

        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Authentication {
                message: format!("sign-in failed (HTTP {status}): {}", preview(&body)),
            });
        }

        let body = resp.text().await.map_err(Error::Transport)?;
        let parsed: SignInResponse =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: format!("sign-in response: {e}"),
                body: String::new(),
            })?;

        debug!("sign-in successful");
        Ok(SessionToken {
            access_token: SecretString::from(parsed.access_token),
            refresh_token: SecretString::from(parsed.refresh_token.unwrap_or_default()),
            expires_at: parsed
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }

    /// Revoke the access token.
    ///
    /// `POST users/sign_out.json`. A 401 means the token was already dead,
    /// which counts as signed out.
    pub async fn sign_out(&self, token: &SessionToken) -> Result<(), Error> {
        let url = self.base_url.join("users/sign_out.json")?;
        debug!("signing out at {}", url);

        let body = json!({
            "user": { "access_token": token.access_token.expose_secret() },
        });

        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            warn!("sign-out with an already revoked token");
            return Ok(());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message: preview(&body).to_owned(),
            });
        }

        debug!("sign-out complete");
        Ok(())
    }
}

#[async_trait]
impl Authenticator for UserClient {
    async fn sign_in(&self, credentials: &Credentials) -> Result<SessionToken, Error> {
        UserClient::sign_in(self, credentials).await
    }

    async fn sign_out(&self, token: &SessionToken) -> Result<(), Error> {
        UserClient::sign_out(self, token).await
    }
}
