//! Shared configuration for devlink sessions.
//!
//! TOML file + `DEVLINK_` environment overrides, app-secret resolution
//! (env + keyring + plaintext), translation to `devlink_core::SessionConfig`,
//! and the tracing subscriber embedders install at startup.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use devlink_api::{AppCredentials, TlsMode, TransportConfig};
use devlink_core::{LanPolicy, SessionConfig};
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no app secret configured for app '{app_id}'")]
    NoCredentials { app_id: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceSettings,

    #[serde(default)]
    pub app: AppSettings,

    #[serde(default)]
    pub session: SessionSettings,

    /// LAN negotiation. Absent means LAN mode is never entered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lan: Option<LanSettings>,

    #[serde(default)]
    pub log: LogSettings,
}

/// Cloud deployment the session talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    #[default]
    Usa,
    Europe,
    China,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Field,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServiceSettings {
    #[serde(default)]
    pub location: Location,

    #[serde(default)]
    pub environment: Environment,

    /// Override for the device service base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_url: Option<String>,

    /// Override for the user service base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_url: Option<String>,

    /// HTTP timeout, seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,

    /// Path to a custom CA certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            location: Location::default(),
            environment: Environment::default(),
            device_url: None,
            user_url: None,
            timeout: default_http_timeout(),
            ca_cert: None,
        }
    }
}

fn default_http_timeout() -> u64 {
    30
}

/// Application identity sent with every sign-in.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppSettings {
    pub app_id: Option<String>,

    /// Plaintext secret. Prefer the keyring or `app_secret_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,

    /// Environment variable holding the secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret_env: Option<String>,
}

/// Polling and timeout tuning. Durations in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionSettings {
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: u64,

    #[serde(default = "default_cloud_poll")]
    pub cloud_poll_interval: u64,

    /// Cloud poll cadence while `LanActive`; `0` disables it.
    #[serde(default = "default_lan_cloud_poll")]
    pub lan_cloud_poll_interval: u64,

    /// Roster re-fetch cadence; `0` disables it.
    #[serde(default = "default_roster_refresh")]
    pub roster_refresh_interval: u64,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            operation_timeout: default_operation_timeout(),
            cloud_poll_interval: default_cloud_poll(),
            lan_cloud_poll_interval: default_lan_cloud_poll(),
            roster_refresh_interval: default_roster_refresh(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_operation_timeout() -> u64 {
    30
}
fn default_cloud_poll() -> u64 {
    5
}
fn default_lan_cloud_poll() -> u64 {
    60
}
fn default_roster_refresh() -> u64 {
    15
}
fn default_max_in_flight() -> usize {
    8
}

/// LAN policy. Every field is required; there are no built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LanSettings {
    /// Seconds.
    pub handshake_timeout: u64,
    /// Seconds.
    pub request_timeout: u64,
    pub failure_threshold: u32,
    /// Seconds.
    pub retry_cooldown: u64,
    /// Seconds.
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

// ── Translation ─────────────────────────────────────────────────────

fn secs(field: &str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn optional_secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl LanSettings {
    pub fn policy(&self) -> Result<LanPolicy, ConfigError> {
        Ok(LanPolicy {
            handshake_timeout: secs("lan.handshake_timeout", self.handshake_timeout)?,
            request_timeout: secs("lan.request_timeout", self.request_timeout)?,
            failure_threshold: NonZeroU32::new(self.failure_threshold)
                .ok_or_else(|| invalid("lan.failure_threshold", "must be at least 1"))?,
            retry_cooldown: secs("lan.retry_cooldown", self.retry_cooldown)?,
            heartbeat_interval: secs("lan.heartbeat_interval", self.heartbeat_interval)?,
        })
    }
}

impl Config {
    /// Validate and convert into the core's runtime tuning.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let s = &self.session;
        if s.max_in_flight == 0 {
            return Err(invalid("session.max_in_flight", "must be at least 1"));
        }
        Ok(SessionConfig {
            operation_timeout: secs("session.operation_timeout", s.operation_timeout)?,
            cloud_poll_interval: secs("session.cloud_poll_interval", s.cloud_poll_interval)?,
            lan_cloud_poll_interval: optional_secs(s.lan_cloud_poll_interval),
            roster_refresh_interval: optional_secs(s.roster_refresh_interval),
            max_in_flight: s.max_in_flight,
            lan: self.lan.as_ref().map(LanSettings::policy).transpose()?,
        })
    }

    /// Resolve the app identity: `app_secret_env`, then the system
    /// keyring, then the plaintext `app_secret`.
    pub fn credentials(&self) -> Result<AppCredentials, ConfigError> {
        let app_id = self
            .app
            .app_id
            .clone()
            .ok_or_else(|| invalid("app.app_id", "missing"))?;

        if let Some(secret) = self
            .app
            .app_secret_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
        {
            return Ok(AppCredentials {
                app_id,
                app_secret: SecretString::from(secret),
            });
        }

        if let Some(secret) = keyring::Entry::new("devlink", &format!("{app_id}/app-secret"))
            .ok()
            .and_then(|entry| entry.get_password().ok())
        {
            return Ok(AppCredentials {
                app_id,
                app_secret: SecretString::from(secret),
            });
        }

        match &self.app.app_secret {
            Some(secret) => Ok(AppCredentials {
                app_secret: SecretString::from(secret.clone()),
                app_id,
            }),
            None => Err(ConfigError::NoCredentials { app_id }),
        }
    }

    /// Device service base URL for the configured deployment.
    pub fn device_url(&self) -> Result<Url, ConfigError> {
        let service = &self.service;
        let fallback = match (service.location, service.environment) {
            (Location::Usa | Location::Europe, Environment::Development) => {
                "https://ads-dev.aylanetworks.com/"
            }
            (Location::Usa, Environment::Field) => "https://ads-field.aylanetworks.com/",
            (Location::Europe, Environment::Field) => "https://ads-eu.aylanetworks.com/",
            (Location::China, Environment::Development) => "https://ads-dev.ayla.com.cn/",
            (Location::China, Environment::Field) => "https://ads-field.ayla.com.cn/",
        };
        parse_url("service.device_url", service.device_url.as_deref().unwrap_or(fallback))
    }

    /// User service base URL for the configured deployment.
    pub fn user_url(&self) -> Result<Url, ConfigError> {
        let service = &self.service;
        let fallback = match (service.location, service.environment) {
            (Location::Usa | Location::Europe, Environment::Development) => {
                "https://user-dev.aylanetworks.com/"
            }
            (Location::Usa, Environment::Field) => "https://user-field.aylanetworks.com/",
            (Location::Europe, Environment::Field) => "https://user-field-eu.aylanetworks.com/",
            (Location::China, Environment::Development) => "https://user-dev.ayla.com.cn/",
            (Location::China, Environment::Field) => "https://user-field.ayla.com.cn/",
        };
        parse_url("service.user_url", service.user_url.as_deref().unwrap_or(fallback))
    }

    /// HTTP settings shared by the cloud and user clients.
    pub fn transport(&self) -> Result<TransportConfig, ConfigError> {
        Ok(TransportConfig {
            tls: self
                .service
                .ca_cert
                .clone()
                .map_or(TlsMode::System, TlsMode::CustomCa),
            timeout: secs("service.timeout", self.service.timeout)?,
        })
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    raw.parse()
        .map_err(|_| invalid(field, format!("invalid URL: {raw}")))
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("rs", "devlink", "devlink").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("devlink");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load from the canonical path plus environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Defaults, then the TOML file at `path` (if present), then
/// `DEVLINK_` variables with `__` separating nested keys
/// (`DEVLINK_LAN__FAILURE_THRESHOLD=3`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("DEVLINK_").split("__"))
        .extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(&config_path(), cfg)
}

pub fn save_config_to(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    tracing::debug!(path = %path.display(), "config saved");
    Ok(())
}

// ── Tracing ─────────────────────────────────────────────────────────

/// Install the global tracing subscriber. `RUST_LOG` wins over
/// `settings.level`. Fails if a subscriber is already installed.
pub fn init_tracing(settings: &LogSettings) -> Result<(), ConfigError> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| invalid("log.level", e.to_string()))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ConfigError::Tracing(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use figment::Jail;
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    use super::*;

    const SAMPLE: &str = r#"
        [service]
        location = "europe"

        [app]
        app_id = "demo-id"
        app_secret = "plain-secret"

        [session]
        cloud_poll_interval = 10
        lan_cloud_poll_interval = 0

        [lan]
        handshake_timeout = 5
        request_timeout = 2
        failure_threshold = 3
        retry_cooldown = 60
        heartbeat_interval = 10
    "#;

    #[test]
    fn defaults_without_a_file() {
        Jail::expect_with(|_jail| {
            let cfg = load_config_from(Path::new("missing.toml")).map_err(|e| e.to_string())?;
            assert_eq!(cfg, Config::default());

            let session = cfg.session_config().map_err(|e| e.to_string())?;
            assert_eq!(session, SessionConfig::default());
            assert!(session.lan.is_none());
            Ok(())
        });
    }

    #[test]
    fn file_then_environment() {
        Jail::expect_with(|jail| {
            jail.create_file("devlink.toml", SAMPLE)?;
            jail.set_env("DEVLINK_LAN__FAILURE_THRESHOLD", "5");
            jail.set_env("DEVLINK_LOG__LEVEL", "devlink_core=debug");

            let cfg = load_config_from(Path::new("devlink.toml")).map_err(|e| e.to_string())?;
            assert_eq!(cfg.service.location, Location::Europe);
            assert_eq!(cfg.log.level, "devlink_core=debug");

            let session = cfg.session_config().map_err(|e| e.to_string())?;
            assert_eq!(session.cloud_poll_interval, Duration::from_secs(10));
            assert_eq!(session.lan_cloud_poll_interval, None);
            assert_eq!(session.roster_refresh_interval, Some(Duration::from_secs(15)));
            let lan = session.lan.unwrap();
            assert_eq!(lan.failure_threshold.get(), 5);
            assert_eq!(lan.retry_cooldown, Duration::from_secs(60));
            assert_eq!(lan.request_timeout, Duration::from_secs(2));

            assert_eq!(
                cfg.device_url().unwrap().as_str(),
                "https://ads-eu.aylanetworks.com/"
            );
            Ok(())
        });
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let cfg = Config {
            lan: Some(LanSettings {
                handshake_timeout: 5,
                request_timeout: 2,
                failure_threshold: 0,
                retry_cooldown: 60,
                heartbeat_interval: 10,
            }),
            ..Config::default()
        };
        let err = cfg.session_config().unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "lan.failure_threshold"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut cfg = Config::default();
        cfg.session.operation_timeout = 0;
        assert!(cfg.session_config().is_err());
        cfg.session.operation_timeout = 30;
        cfg.session.max_in_flight = 0;
        assert!(cfg.session_config().is_err());
    }

    #[test]
    fn app_secret_prefers_environment() {
        Jail::expect_with(|jail| {
            jail.set_env("DEVLINK_TEST_SECRET", "from-env");
            let cfg = Config {
                app: AppSettings {
                    app_id: Some("demo-id".into()),
                    app_secret: Some("plain".into()),
                    app_secret_env: Some("DEVLINK_TEST_SECRET".into()),
                },
                ..Config::default()
            };
            let creds = cfg.credentials().map_err(|e| e.to_string())?;
            assert_eq!(creds.app_id, "demo-id");
            assert_eq!(creds.app_secret.expose_secret(), "from-env");
            Ok(())
        });
    }

    #[test]
    fn missing_app_id_is_invalid() {
        let err = Config::default().credentials().unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn service_url_overrides() {
        let mut cfg = Config::default();
        assert_eq!(
            cfg.user_url().unwrap().as_str(),
            "https://user-field.aylanetworks.com/"
        );
        cfg.service.device_url = Some("http://127.0.0.1:8080/".into());
        assert_eq!(cfg.device_url().unwrap().port(), Some(8080));
        cfg.service.user_url = Some("not a url".into());
        assert!(cfg.user_url().is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config {
            app: AppSettings {
                app_id: Some("demo-id".into()),
                ..AppSettings::default()
            },
            lan: Some(LanSettings {
                handshake_timeout: 5,
                request_timeout: 2,
                failure_threshold: 3,
                retry_cooldown: 60,
                heartbeat_interval: 10,
            }),
            ..Config::default()
        };
        save_config_to(&path, &cfg).unwrap();

        let loaded: Config = Figment::new()
            .merge(Toml::file(&path))
            .extract()
            .unwrap();
        assert_eq!(loaded, cfg);
    }
}
