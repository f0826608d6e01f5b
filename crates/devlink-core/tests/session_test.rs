#![allow(clippy::unwrap_used)]
// Session lifecycle: sign-in, first fetch, writes, push hints, sign-out.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use devlink_api::{Authenticator, CloudApi, Credentials, LanLink};
use devlink_core::{
    DataSource, DeviceEvent, Dsn, ErrorKind, Event, LinkMode, PropertyValue, PushHint,
    RegistryState, Session,
};
use serde_json::json;
use tokio::sync::mpsc;

use common::{DSN, FakeAuth, FakeCloud, FakeLan, Handshake, device, property, quiet_config};

#[tokio::test]
async fn sign_in_fetch_and_write_round_trip() {
    let (session, _cloud) = common::started(None, quiet_config()).await;
    let registry = session.registry();
    let dsn = Dsn::new(DSN);

    assert_eq!(registry.state(), RegistryState::Ready);
    assert!(!registry.devices().is_empty());

    let props = registry
        .fetch_properties(&dsn, Some(&["Blue_LED"]))
        .await
        .unwrap();
    assert_eq!(props.len(), 1);
    assert_eq!(props[0].value, Some(PropertyValue::Boolean(false)));
    assert!(props[0].updated_at.is_some());

    let written = registry
        .create_datapoint(&dsn, "Blue_LED", true, None)
        .await
        .unwrap();
    let created_at = written.created_at.unwrap();
    assert_eq!(written.value, Some(PropertyValue::Boolean(true)));
    assert_eq!(written.source, DataSource::Cloud);

    let props = registry
        .fetch_properties(&dsn, Some(&["Blue_LED"]))
        .await
        .unwrap();
    assert_eq!(props[0].value, Some(PropertyValue::Boolean(true)));
    assert!(props[0].updated_at.unwrap() >= created_at);
    assert!(!props[0].pending_write);
}

#[tokio::test]
async fn wrong_password_is_unauthorized() {
    let cloud: Arc<dyn CloudApi> = FakeCloud::with_device(device(DSN, false), vec![]);
    let err = Session::builder(Arc::new(FakeAuth::default()), cloud)
        .sign_in(&Credentials::new("user@example.com", "nope"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn malformed_email_is_rejected_before_any_request() {
    let cloud: Arc<dyn CloudApi> = FakeCloud::with_device(device(DSN, false), vec![]);
    let err = Session::builder(Arc::new(FakeAuth::default()), cloud)
        .sign_in(&Credentials::new("not-an-email", "secret"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn failed_first_fetch_puts_registry_in_error() {
    let cloud = FakeCloud::with_device(device(DSN, false), vec![]);
    cloud.fail_list.store(true, Ordering::SeqCst);
    let session = common::session(&cloud, None, quiet_config()).await;

    let err = session.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Remote);
    assert_eq!(session.registry().state(), RegistryState::Error);

    cloud.fail_list.store(false, Ordering::SeqCst);
    session.start().await.unwrap();
    assert_eq!(session.registry().state(), RegistryState::Ready);
}

#[tokio::test(start_paused = true)]
async fn push_hint_triggers_a_merge_tagged_as_push() {
    let (session, cloud) = common::started(None, quiet_config()).await;
    let mut events = session.registry().events();
    let (tx, rx) = mpsc::channel(4);
    let _push = session.attach_push_channel(rx);

    cloud.set_value(DSN, "level", json!(11), Utc::now());
    tx.send(PushHint {
        dsn: Dsn::new(DSN),
        properties: Some(vec!["level".into()]),
    })
    .await
    .unwrap();

    let event = events.recv().await.unwrap();
    match event {
        Event::Device(DeviceEvent::PropertiesChanged {
            properties, source, ..
        }) => {
            assert_eq!(source, DataSource::Push);
            assert_eq!(properties[0].value, Some(PropertyValue::Integer(11)));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn sign_out_tears_everything_down() {
    let cloud = FakeCloud::with_device(
        device(DSN, true),
        vec![property("level", "integer", json!(1), Some(Utc::now()))],
    );
    let lan = FakeLan::new(Handshake::Accept);
    let auth = Arc::new(FakeAuth::default());
    let authenticator: Arc<dyn Authenticator> = auth.clone();
    let api: Arc<dyn CloudApi> = cloud.clone();
    let link: Arc<dyn LanLink> = lan.clone();
    let session = Session::builder(authenticator, api)
        .lan(link)
        .config(quiet_config())
        .sign_in(&common::credentials())
        .await
        .unwrap();
    session.start().await.unwrap();

    let dsn = Dsn::new(DSN);
    let registry = session.registry().clone();
    assert_eq!(
        registry.set_lan_mode_permitted(&dsn, true).await.unwrap(),
        LinkMode::LanActive
    );

    session.sign_out().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(!session.is_signed_in());
    assert_eq!(registry.mode(&dsn), Some(LinkMode::Cloud));
    assert_eq!(lan.closed.load(Ordering::SeqCst), 1);
    assert_eq!(auth.sign_outs.load(Ordering::SeqCst), 1);
    assert_eq!(registry.state(), RegistryState::Uninitialized);

    let err = registry.fetch_properties(&dsn, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert_eq!(session.start().await.unwrap_err().kind(), ErrorKind::Unauthorized);

    // Second sign-out is a no-op.
    session.sign_out().await.unwrap();
    assert_eq!(auth.sign_outs.load(Ordering::SeqCst), 1);
}
