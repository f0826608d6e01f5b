// Shared fakes for the core integration tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devlink_api::{
    Authenticator, CloudApi, Credentials, DatapointRecord, DeviceRecord, Error, LanConfigRecord,
    LanLink, LanTarget, NewDatapoint, PropertyRecord, SessionToken,
};
use devlink_core::{Dsn, LanPolicy, Session, SessionConfig};
use serde_json::{Value, json};

pub const DSN: &str = "AC000W000000001";
pub const LAN_IP: &str = "192.168.1.20";

// ── Records ──────────────────────────────────────────────────────────

pub fn device(dsn: &str, lan: bool) -> DeviceRecord {
    DeviceRecord {
        dsn: dsn.into(),
        key: Some(1),
        product_name: Some("Smart Plug".into()),
        model: Some("AY001MRT1".into()),
        oem_model: None,
        mac: Some("aabbccddeeff".into()),
        lan_ip: lan.then(|| LAN_IP.into()),
        lan_enabled: lan,
        connection_status: Some("Online".into()),
        connected_at: None,
        sw_version: None,
    }
}

pub fn property(name: &str, base_type: &str, value: Value, at: Option<DateTime<Utc>>) -> PropertyRecord {
    PropertyRecord {
        name: name.into(),
        base_type: base_type.into(),
        value,
        data_updated_at: at,
        display_name: None,
        direction: Some("input".into()),
        read_only: false,
        ack_enabled: false,
        metadata: None,
    }
}

pub fn lan_config() -> LanConfigRecord {
    LanConfigRecord {
        lanip_key_id: Some(42),
        lanip_key: Some("c2VjcmV0".into()),
        keep_alive: Some(30),
        status: Some("enable".into()),
    }
}

// ── Cloud ────────────────────────────────────────────────────────────

/// In-memory cloud: a roster, per-device properties, LAN configs.
/// Writes update the stored property and echo it with a fresh timestamp.
#[derive(Default)]
pub struct FakeCloud {
    pub devices: Mutex<Vec<DeviceRecord>>,
    pub properties: Mutex<HashMap<String, Vec<PropertyRecord>>>,
    pub lan_configs: Mutex<HashMap<String, LanConfigRecord>>,
    pub calls: Mutex<Vec<String>>,
    pub write_delay: Mutex<Option<Duration>>,
    pub fail_list: AtomicBool,
}

impl FakeCloud {
    pub fn with_device(record: DeviceRecord, properties: Vec<PropertyRecord>) -> Arc<Self> {
        let cloud = Self::default();
        cloud
            .lan_configs
            .lock()
            .unwrap()
            .insert(record.dsn.clone(), lan_config());
        cloud
            .properties
            .lock()
            .unwrap()
            .insert(record.dsn.clone(), properties);
        cloud.devices.lock().unwrap().push(record);
        Arc::new(cloud)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn set_value(&self, dsn: &str, name: &str, value: Value, at: DateTime<Utc>) {
        let mut props = self.properties.lock().unwrap();
        if let Some(p) = props
            .get_mut(dsn)
            .and_then(|list| list.iter_mut().find(|p| p.name == name))
        {
            p.value = value;
            p.data_updated_at = Some(at);
        }
    }

    fn not_found(dsn: &str) -> Error {
        Error::Api {
            status: 404,
            message: format!("device {dsn} not found"),
        }
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn list_devices(&self, _token: &SessionToken) -> Result<Vec<DeviceRecord>, Error> {
        self.record("list_devices".into());
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Error::Api {
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn fetch_device(&self, _token: &SessionToken, dsn: &str) -> Result<DeviceRecord, Error> {
        self.record(format!("fetch_device:{dsn}"));
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.dsn == dsn)
            .cloned()
            .ok_or_else(|| Self::not_found(dsn))
    }

    async fn fetch_properties(
        &self,
        _token: &SessionToken,
        dsn: &str,
        names: Option<&[String]>,
    ) -> Result<Vec<PropertyRecord>, Error> {
        self.record(format!("fetch_properties:{dsn}"));
        let props = self.properties.lock().unwrap();
        let list = props.get(dsn).ok_or_else(|| Self::not_found(dsn))?;
        Ok(list
            .iter()
            .filter(|p| names.is_none_or(|n| n.contains(&p.name)))
            .cloned()
            .collect())
    }

    async fn create_datapoint(
        &self,
        _token: &SessionToken,
        dsn: &str,
        property: &str,
        datapoint: &NewDatapoint,
    ) -> Result<DatapointRecord, Error> {
        self.record(format!("create_datapoint:{dsn}/{property}"));
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let now = Utc::now();
        self.set_value(dsn, property, datapoint.value.clone(), now);
        Ok(DatapointRecord {
            value: datapoint.value.clone(),
            created_at: Some(now),
            updated_at: Some(now),
            metadata: datapoint.metadata.clone(),
            echo: false,
        })
    }

    async fn fetch_lan_config(
        &self,
        _token: &SessionToken,
        dsn: &str,
    ) -> Result<LanConfigRecord, Error> {
        self.record(format!("fetch_lan_config:{dsn}"));
        self.lan_configs
            .lock()
            .unwrap()
            .get(dsn)
            .cloned()
            .ok_or_else(|| Self::not_found(dsn))
    }
}

// ── LAN ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Handshake {
    #[default]
    Accept,
    Reject,
    /// Never completes; the selector's handshake timeout must fire.
    Hang,
}

/// In-memory LAN link. Readings carry no timestamp, like a real device.
#[derive(Default)]
pub struct FakeLan {
    pub handshake: Mutex<Handshake>,
    pub values: Mutex<HashMap<String, Value>>,
    pub failing: AtomicBool,
    /// Every exchange after the handshake hangs, like a device gone silent.
    pub stalled: AtomicBool,
    pub handshakes: AtomicUsize,
    pub requests: AtomicUsize,
    pub closed: AtomicUsize,
}

impl FakeLan {
    pub fn new(handshake: Handshake) -> Arc<Self> {
        Arc::new(Self {
            handshake: Mutex::new(handshake),
            ..Self::default()
        })
    }

    fn check(&self, dsn: &str) -> Result<(), Error> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::LanUnavailable {
                dsn: dsn.into(),
                reason: "no route to host".into(),
            });
        }
        Ok(())
    }

    async fn respond(&self, dsn: &str) -> Result<(), Error> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check(dsn)
    }
}

#[async_trait]
impl LanLink for FakeLan {
    async fn handshake(&self, target: &LanTarget) -> Result<(), Error> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        let mode = *self.handshake.lock().unwrap();
        match mode {
            Handshake::Accept => Ok(()),
            Handshake::Reject => Err(Error::LanRejected {
                dsn: target.dsn.clone(),
                reason: "bad key".into(),
            }),
            Handshake::Hang => std::future::pending().await,
        }
    }

    async fn keep_alive(&self, dsn: &str) -> Result<(), Error> {
        self.respond(dsn).await
    }

    async fn fetch_properties(&self, dsn: &str, names: &[String]) -> Result<Vec<PropertyRecord>, Error> {
        self.respond(dsn).await?;
        let values = self.values.lock().unwrap();
        Ok(names
            .iter()
            .filter_map(|n| values.get(n).map(|v| property(n, "integer", v.clone(), None)))
            .collect())
    }

    async fn create_datapoint(
        &self,
        dsn: &str,
        property: &str,
        datapoint: &NewDatapoint,
    ) -> Result<DatapointRecord, Error> {
        self.respond(dsn).await?;
        self.values
            .lock()
            .unwrap()
            .insert(property.into(), datapoint.value.clone());
        Ok(DatapointRecord {
            value: datapoint.value.clone(),
            created_at: None,
            updated_at: None,
            metadata: None,
            echo: true,
        })
    }

    async fn close(&self, _dsn: &str) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Auth ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeAuth {
    pub sign_outs: AtomicUsize,
}

#[async_trait]
impl Authenticator for FakeAuth {
    async fn sign_in(&self, credentials: &Credentials) -> Result<SessionToken, Error> {
        use secrecy::ExposeSecret;

        if credentials.password.expose_secret() == "secret" {
            Ok(SessionToken::new("access-token"))
        } else {
            Err(Error::Authentication {
                message: "invalid email or password".into(),
            })
        }
    }

    async fn sign_out(&self, _token: &SessionToken) -> Result<(), Error> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Session helpers ──────────────────────────────────────────────────

pub fn credentials() -> Credentials {
    Credentials::new("user@example.com", "secret")
}

pub fn lan_policy() -> LanPolicy {
    LanPolicy {
        handshake_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(2),
        failure_threshold: NonZeroU32::new(3).unwrap(),
        retry_cooldown: Duration::from_secs(60),
        heartbeat_interval: Duration::from_secs(10),
    }
}

/// Config with background polling effectively out of the way.
pub fn quiet_config() -> SessionConfig {
    SessionConfig {
        operation_timeout: Duration::from_secs(10),
        cloud_poll_interval: Duration::from_secs(3600),
        lan_cloud_poll_interval: None,
        roster_refresh_interval: None,
        max_in_flight: 4,
        lan: Some(lan_policy()),
    }
}

pub async fn session(
    cloud: &Arc<FakeCloud>,
    lan: Option<&Arc<FakeLan>>,
    config: SessionConfig,
) -> Session {
    let api: Arc<dyn CloudApi> = cloud.clone();
    let mut builder = Session::builder(Arc::new(FakeAuth::default()), api).config(config);
    if let Some(lan) = lan {
        let link: Arc<dyn LanLink> = lan.clone();
        builder = builder.lan(link);
    }
    builder.sign_in(&credentials()).await.unwrap()
}

/// A signed-in session over one LAN-capable device with a `Blue_LED`
/// boolean and a `level` integer, roster and properties already fetched.
pub async fn started(lan: Option<&Arc<FakeLan>>, config: SessionConfig) -> (Session, Arc<FakeCloud>) {
    let cloud = FakeCloud::with_device(
        device(DSN, true),
        vec![
            property("Blue_LED", "boolean", json!(0), Some(Utc::now())),
            property("level", "integer", json!(10), Some(Utc::now())),
        ],
    );
    let session = session(&cloud, lan, config).await;
    session.start().await.unwrap();
    session
        .registry()
        .fetch_properties(&Dsn::new(DSN), None)
        .await
        .unwrap();
    (session, cloud)
}
