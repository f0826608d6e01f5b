// Cloud REST HTTP client
//
// Wraps `reqwest::Client` with device-service URL construction, the
// `auth_token` authorization header, and response mapping. Endpoint
// groups (devices, properties) are implemented as inherent methods in
// separate files to keep this module focused on transport mechanics.

use secrecy::ExposeSecret;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use url::Url;

use crate::auth::SessionToken;
use crate::error::Error;
use crate::transport::TransportConfig;

const BODY_PREVIEW: usize = 200;

/// Raw HTTP client for the device cloud's REST API.
///
/// Every request is authorized with the caller's [`SessionToken`]; the
/// client itself holds no session state and is safe to share.
#[derive(Debug, Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    base_url: Url,
}

impl CloudClient {
    /// Create a client from a `TransportConfig`.
    ///
    /// `base_url` is the device service root, e.g.
    /// `https://ads-dev.example.com/apiv1/`. A trailing slash is added
    /// if missing so relative joins keep the last path segment.
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self::with_client(http, base_url))
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self {
            http,
            base_url: normalize_base(base_url),
        }
    }

    /// The device service base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// Build `{base}{path}`.
    pub(crate) fn api_url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Build `{base}dsns/{dsn}/{path}`.
    pub(crate) fn dsn_url(&self, dsn: &str, path: &str) -> Result<Url, Error> {
        self.api_url(&format!("dsns/{dsn}/{path}"))
    }

    // ── Request helpers ──────────────────────────────────────────────

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        token: &SessionToken,
        url: Url,
    ) -> Result<T, Error> {
        debug!("GET {}", url);
        let resp = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, auth_header(token))
            .send()
            .await
            .map_err(Error::Transport)?;
        handle_response(resp).await
    }

    pub(crate) async fn post<T: DeserializeOwned>(
        &self,
        token: &SessionToken,
        url: Url,
        body: &(impl Serialize + Sync),
    ) -> Result<T, Error> {
        debug!("POST {}", url);
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, auth_header(token))
            .json(body)
            .send()
            .await
            .map_err(Error::Transport)?;
        handle_response(resp).await
    }
}

fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn auth_header(token: &SessionToken) -> String {
    format!("auth_token {}", token.access_token.expose_secret())
}

/// Truncate a body for error messages without splitting a UTF-8 sequence.
pub(crate) fn preview(body: &str) -> &str {
    if body.len() <= BODY_PREVIEW {
        return body;
    }
    let mut end = BODY_PREVIEW;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Map a raw response onto `T` or the matching [`Error`].
///
/// 401 means the bearer is no longer accepted; every other non-success
/// status is surfaced as [`Error::Api`] with a body preview.
pub(crate) async fn handle_response<T: DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, Error> {
    let status = resp.status();

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(Error::SessionExpired);
    }

    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::Api {
            status: status.as_u16(),
            message: preview(&body).to_owned(),
        });
    }

    let body = resp.text().await.map_err(Error::Transport)?;
    trace!(len = body.len(), "response body");

    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: format!("{e} (body preview: {:?})", preview(&body)),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gains_trailing_slash() {
        let url = Url::parse("https://cloud.example.com/apiv1").expect("url");
        let client = CloudClient::with_client(reqwest::Client::new(), url);
        let joined = client
            .dsn_url("AC000W000000001", "properties.json")
            .expect("join");
        assert_eq!(
            joined.as_str(),
            "https://cloud.example.com/apiv1/dsns/AC000W000000001/properties.json"
        );
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let body = "é".repeat(150);
        let cut = preview(&body);
        assert!(cut.len() <= BODY_PREVIEW);
        assert!(body.starts_with(cut));
    }
}
