// ── Device registry ──
//
// Owns every device of one session: the roster, per-device polling, the
// property read/write protocol, and listener dispatch. All state changes
// go through the store's merge path; listeners fire after the merge and
// only when something actually changed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use devlink_api::NewDatapoint;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::convert;
use crate::error::{CoreError, ErrorKind};
use crate::model::{
    BaseType, DataSource, Datapoint, DeviceEvent, DeviceState, Dsn, Event, LinkMode, Metadata,
    PropertyState, PropertyValue, RegistryEvent,
};
use crate::notify::{Notifier, Subscription};
use crate::operation::Operation;
use crate::selector::{RoutePolicy, TransportSelector};
use crate::store::{DeviceStore, RosterDiff};
use crate::stream::DeviceStream;
use crate::transport::{CloudChannel, LanChannel, Request, Route};

/// Lifecycle of the registry as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum RegistryState {
    #[default]
    Uninitialized,
    FetchingDevices,
    Ready,
    /// The first roster fetch failed.
    Error,
    /// Polling, heartbeats and LAN sessions are stopped.
    Paused,
}

/// "Device changed" hint from a push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushHint {
    pub dsn: Dsn,
    /// Properties named by the hint. `None` refreshes all of them.
    pub properties: Option<Vec<String>>,
}

impl PushHint {
    pub fn device(dsn: impl Into<Dsn>) -> Self {
        Self {
            dsn: dsn.into(),
            properties: None,
        }
    }
}

fn source_of(route: Route) -> DataSource {
    match route {
        Route::Cloud => DataSource::Cloud,
        Route::Lan => DataSource::Lan,
    }
}

/// The devices of one session.
///
/// Cheaply cloneable; clones share the same devices, tasks and listeners.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: SessionConfig,
    store: Arc<DeviceStore>,
    selector: Arc<TransportSelector>,
    cloud: Arc<CloudChannel>,
    notifier: Arc<Notifier>,
    state: watch::Sender<RegistryState>,
    /// Worker pool: bounds concurrently executing operations.
    pool: Arc<Semaphore>,
    /// Parent of every background task; cancelled on shutdown.
    cancel: CancellationToken,
    /// Token of the current run (between start and pause/shutdown).
    run: Mutex<Option<CancellationToken>>,
    pollers: DashMap<Dsn, CancellationToken>,
}

impl DeviceRegistry {
    pub(crate) fn new(
        config: SessionConfig,
        cloud: Arc<CloudChannel>,
        lan: Option<Arc<LanChannel>>,
    ) -> Self {
        let store = Arc::new(DeviceStore::new());
        let notifier = Arc::new(Notifier::new());
        let selector = Arc::new(TransportSelector::new(
            Arc::clone(&store),
            Arc::clone(&cloud),
            lan,
            config.lan.clone(),
            Arc::clone(&notifier),
        ));
        let (state, _) = watch::channel(RegistryState::Uninitialized);
        let pool = Arc::new(Semaphore::new(config.max_in_flight.max(1)));

        Self {
            inner: Arc::new(RegistryInner {
                config,
                store,
                selector,
                cloud,
                notifier,
                state,
                pool,
                cancel: CancellationToken::new(),
                run: Mutex::new(None),
                pollers: DashMap::new(),
            }),
        }
    }

    fn timeout(&self) -> Duration {
        self.inner.config.operation_timeout
    }

    fn pool(&self) -> Option<Arc<Semaphore>> {
        Some(Arc::clone(&self.inner.pool))
    }

    // ── Roster ───────────────────────────────────────────────────────

    /// Refresh the roster from the cloud.
    ///
    /// New devices are added, vanished ones removed (or marked removed
    /// while they still have writes pending). Settles with the devices
    /// currently listed.
    pub fn fetch_devices(&self) -> Operation<Vec<Arc<DeviceState>>> {
        let op = Operation::new("fetch_devices", self.timeout());
        let inner = Arc::clone(&self.inner);
        op.run(self.pool(), async move { inner.refresh_roster().await });
        op
    }

    /// Re-read one device's metadata from the cloud, then its properties
    /// through the currently selected transport.
    pub fn fetch_device_details(&self, dsn: &Dsn) -> Operation<Arc<DeviceState>> {
        let label = format!("fetch_device_details:{dsn}");
        if !self.inner.store.contains(dsn) {
            return Operation::ready(label, Err(CoreError::device_not_found(dsn)));
        }
        let op = Operation::new(label, self.timeout());
        let inner = Arc::clone(&self.inner);
        let dsn = dsn.clone();
        op.run(self.pool(), async move {
            let route = inner.selector.route_for(&dsn, &Request::FetchDevice, RoutePolicy::Auto)?;
            let record = inner
                .selector
                .channel(route)?
                .execute(&dsn, Request::FetchDevice)
                .await?
                .into_device(route)?;
            if inner.store.apply_details(&dsn, &record)? {
                inner
                    .notifier
                    .device(DeviceEvent::DetailsChanged { dsn: dsn.clone() });
            }

            // Name the known properties while LanActive so the read can go local.
            let names = inner.store.snapshot(&dsn).and_then(|state| {
                (state.mode == LinkMode::LanActive && !state.properties.is_empty())
                    .then(|| state.properties.keys().cloned().collect())
            });
            inner
                .fetch_and_merge(&dsn, names, RoutePolicy::Auto, None)
                .await?;
            inner
                .store
                .snapshot(&dsn)
                .ok_or_else(|| CoreError::device_not_found(&dsn))
        });
        op
    }

    // ── LAN ──────────────────────────────────────────────────────────

    /// Allow or forbid LAN mode for one device. See
    /// [`TransportSelector::set_lan_mode_permitted`].
    pub fn set_lan_mode_permitted(&self, dsn: &Dsn, permitted: bool) -> Operation<LinkMode> {
        self.inner
            .selector
            .set_lan_mode_permitted(dsn, permitted, self.timeout())
    }

    pub fn mode(&self, dsn: &Dsn) -> Option<LinkMode> {
        self.inner.selector.mode(dsn)
    }

    pub fn selector(&self) -> &Arc<TransportSelector> {
        &self.inner.selector
    }

    // ── Properties ───────────────────────────────────────────────────

    /// Read properties through the selected transport.
    ///
    /// `None` reads every property. Names the device does not report are
    /// left out of the result rather than failing the read.
    pub fn fetch_properties(
        &self,
        dsn: &Dsn,
        names: Option<&[&str]>,
    ) -> Operation<Vec<PropertyState>> {
        self.fetch_properties_with(dsn, names, RoutePolicy::Auto)
    }

    pub fn fetch_properties_with(
        &self,
        dsn: &Dsn,
        names: Option<&[&str]>,
        policy: RoutePolicy,
    ) -> Operation<Vec<PropertyState>> {
        let label = format!("fetch_properties:{dsn}");
        if names.is_some_and(<[&str]>::is_empty) {
            return Operation::ready(
                label,
                Err(CoreError::InvalidArgument {
                    message: "empty property name list".into(),
                }),
            );
        }
        if !self.inner.store.contains(dsn) {
            return Operation::ready(label, Err(CoreError::device_not_found(dsn)));
        }

        let names: Option<Vec<String>> =
            names.map(|n| n.iter().map(|s| (*s).to_owned()).collect());
        let op = Operation::new(label, self.timeout());
        let inner = Arc::clone(&self.inner);
        let dsn = dsn.clone();
        op.run(self.pool(), async move {
            inner.fetch_and_merge(&dsn, names, policy, None).await
        });
        op
    }

    /// Write one datapoint.
    ///
    /// Fails immediately with `WriteInProgress` if a write to the same
    /// property is still outstanding. The stored value is taken from the
    /// transport's echo, never from `value`. Writes are never retried.
    pub fn create_datapoint(
        &self,
        dsn: &Dsn,
        name: &str,
        value: impl Into<PropertyValue>,
        metadata: Option<Metadata>,
    ) -> Operation<Datapoint> {
        self.create_datapoint_with(dsn, name, value, metadata, RoutePolicy::Auto)
    }

    pub fn create_datapoint_with(
        &self,
        dsn: &Dsn,
        name: &str,
        value: impl Into<PropertyValue>,
        metadata: Option<Metadata>,
        policy: RoutePolicy,
    ) -> Operation<Datapoint> {
        let label = format!("create_datapoint:{dsn}/{name}");
        let value = value.into();

        let claimed = self.inner.store.begin_write(dsn, name, |property| {
            if !property.is_writable() {
                return Err(CoreError::InvalidArgument {
                    message: format!("{name} is read-only"),
                });
            }
            validate(value, property)
        });
        let (property, value) = match claimed {
            Ok(claimed) => claimed,
            Err(e) => return Operation::ready(label, Err(e)),
        };

        let ticket = Arc::new(WriteTicket {
            store: Arc::clone(&self.inner.store),
            dsn: dsn.clone(),
            name: name.to_owned(),
            released: AtomicBool::new(false),
        });
        let op = Operation::new(label, self.timeout());
        {
            let ticket = Arc::clone(&ticket);
            op.on_settled(move |_| ticket.release());
        }

        let inner = Arc::clone(&self.inner);
        let dsn = dsn.clone();
        let guard = WriteGuard(ticket);
        op.run(self.pool(), async move {
            let request = Request::CreateDatapoint {
                property: property.name.clone(),
                datapoint: NewDatapoint {
                    value: value.to_json(),
                    metadata,
                },
            };
            let route = inner.selector.route_for(&dsn, &request, policy)?;
            let channel = inner.selector.channel(route)?;
            let result = match channel.execute(&dsn, request).await {
                Ok(response) => response.into_datapoint(route),
                Err(e) => Err(e),
            };
            inner.selector.observe(&dsn, route, &result);
            let record = result?;

            let datapoint = convert::datapoint_from_record(
                &property.name,
                property.base_type,
                &record,
                source_of(route),
            );
            let changed = inner.store.merge_echo(&dsn, &datapoint)?;
            drop(guard);

            if let Some(property) = changed {
                inner.notifier.device(DeviceEvent::PropertiesChanged {
                    dsn: dsn.clone(),
                    properties: vec![property],
                    source: datapoint.source,
                });
            }
            debug!(%dsn, property = %datapoint.property, %route, "datapoint written");
            Ok(datapoint)
        });
        op
    }

    // ── Listeners ────────────────────────────────────────────────────

    /// Called synchronously, in registration order, after each merge that
    /// changed something on a device.
    pub fn register_device_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.inner.notifier.on_device(Arc::new(listener))
    }

    pub fn register_registry_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.inner.notifier.on_registry(Arc::new(listener))
    }

    /// Every event, for async consumers.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.notifier.subscribe()
    }

    // ── Snapshots ────────────────────────────────────────────────────

    pub fn device(&self, dsn: &Dsn) -> Option<Arc<DeviceState>> {
        self.inner.store.snapshot(dsn)
    }

    /// All devices, sorted by serial number.
    pub fn devices(&self) -> Arc<Vec<Arc<DeviceState>>> {
        self.inner.store.roster()
    }

    pub fn devices_stream(&self) -> DeviceStream {
        DeviceStream::new(self.inner.store.subscribe())
    }

    pub fn state(&self) -> RegistryState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<RegistryState> {
        self.inner.state.subscribe()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Stop polling, heartbeats and LAN sessions. Every device drops to
    /// `Cloud`; LAN permissions are remembered for [`resume`](Self::resume).
    pub fn pause(&self) {
        let inner = &self.inner;
        inner.state.send_replace(RegistryState::Paused);
        inner.stop_tasks();
        inner.selector.suspend();
        info!("registry paused");
    }

    /// Restart what [`pause`](Self::pause) stopped. No-op unless paused.
    pub fn resume(&self) {
        let inner = &self.inner;
        if *inner.state.borrow() != RegistryState::Paused {
            return;
        }
        inner.selector.resume();
        inner.start();
        inner.state.send_replace(RegistryState::Ready);
        info!("registry resumed");
    }

    /// Spawn roster refresh and per-device polling.
    pub(crate) fn start(&self) {
        self.inner.start();
    }

    /// Stop everything for good. Pending operations fail with `SessionClosed`
    /// once they next need a worker.
    pub(crate) fn shutdown(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.stop_tasks();
        inner.selector.suspend();
        inner.pool.close();
        inner.state.send_replace(RegistryState::Uninitialized);
    }

    /// Run one poll-and-merge cycle for a push hint.
    pub(crate) async fn handle_push(&self, hint: PushHint) -> Result<(), CoreError> {
        let inner = &self.inner;
        if !inner.store.contains(&hint.dsn) {
            debug!(dsn = %hint.dsn, "push hint for unknown device");
            return Ok(());
        }
        let _permit = inner
            .pool
            .acquire()
            .await
            .map_err(|_| CoreError::SessionClosed)?;
        inner
            .fetch_and_merge(&hint.dsn, hint.properties, RoutePolicy::Auto, Some(DataSource::Push))
            .await
            .map(drop)
    }
}

/// Check a write value against the property's declared type.
///
/// Booleans travel as 0/1 on the wire, so `Integer(0 | 1)` is accepted
/// for a boolean property and normalized to `Boolean`.
fn validate(value: PropertyValue, property: &PropertyState) -> Result<PropertyValue, CoreError> {
    let value = match (value, property.base_type) {
        (PropertyValue::Integer(i @ (0 | 1)), BaseType::Boolean) => PropertyValue::Boolean(i == 1),
        (value, _) => value,
    };
    if value.base_type() != property.base_type {
        return Err(CoreError::InvalidArgument {
            message: format!(
                "{} expects a {} value, got {}",
                property.name,
                property.base_type,
                value.base_type()
            ),
        });
    }
    match value {
        PropertyValue::Decimal(d) if !d.is_finite() => Err(CoreError::InvalidArgument {
            message: format!("{} cannot be set to {d}", property.name),
        }),
        value => Ok(value),
    }
}

// ── Write marker release ──

/// Clears one write's pending marker exactly once, whichever of the
/// settle listener or the dropped work future gets there first.
struct WriteTicket {
    store: Arc<DeviceStore>,
    dsn: Dsn,
    name: String,
    released: AtomicBool,
}

impl WriteTicket {
    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.store.end_write(&self.dsn, &self.name);
        }
    }
}

struct WriteGuard(Arc<WriteTicket>);

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

// ── Internals ──

impl RegistryInner {
    fn run_token(&self) -> Option<CancellationToken> {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn start(self: &Arc<Self>) {
        let run = self.cancel.child_token();
        let previous = self
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(run.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        self.pollers.clear();

        if let Some(period) = self.config.roster_refresh_interval {
            tokio::spawn(roster_task(Arc::clone(self), period, run.clone()));
        }
        for device in self.store.roster().iter().filter(|d| !d.removed) {
            self.start_poller(&device.dsn);
        }
        debug!(devices = self.store.len(), "registry tasks started");
    }

    fn stop_tasks(&self) {
        let run = self
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(run) = run {
            run.cancel();
        }
        self.pollers.clear();
    }

    fn start_poller(self: &Arc<Self>, dsn: &Dsn) {
        let Some(run) = self.run_token() else {
            return;
        };
        let token = run.child_token();
        if let Some(previous) = self.pollers.insert(dsn.clone(), token.clone()) {
            previous.cancel();
        }
        tokio::spawn(device_poll_task(Arc::clone(self), dsn.clone(), token));
    }

    fn stop_poller(&self, dsn: &Dsn) {
        if let Some((_, token)) = self.pollers.remove(dsn) {
            token.cancel();
        }
    }

    async fn refresh_roster(self: &Arc<Self>) -> Result<Vec<Arc<DeviceState>>, CoreError> {
        self.state.send_if_modified(|state| {
            let fetching = matches!(state, RegistryState::Uninitialized | RegistryState::Error);
            if fetching {
                *state = RegistryState::FetchingDevices;
            }
            fetching
        });

        let records = match self.cloud.list_devices().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "device list fetch failed");
                self.state.send_if_modified(|state| {
                    let failed = *state == RegistryState::FetchingDevices;
                    if failed {
                        *state = RegistryState::Error;
                    }
                    failed
                });
                return Err(e);
            }
        };

        let diff = self.store.apply_roster(&records);
        self.apply_diff(diff);
        self.state.send_if_modified(|state| {
            let ready = matches!(state, RegistryState::FetchingDevices);
            if ready {
                *state = RegistryState::Ready;
            }
            ready
        });

        Ok(self
            .store
            .roster()
            .iter()
            .filter(|d| !d.removed)
            .cloned()
            .collect())
    }

    fn apply_diff(self: &Arc<Self>, diff: RosterDiff) {
        for (dsn, slot) in &diff.detached {
            self.stop_poller(dsn);
            self.selector.detach(dsn, slot);
        }
        for dsn in &diff.added {
            self.start_poller(dsn);
        }
        let list_changed = diff.is_list_change();
        for dsn in diff.details_changed {
            self.notifier.device(DeviceEvent::DetailsChanged { dsn });
        }
        if list_changed {
            info!(added = diff.added.len(), removed = diff.removed.len(), "device list changed");
            self.notifier.registry(RegistryEvent::ListChanged {
                added: diff.added,
                removed: diff.removed,
            });
        }
    }

    /// Read, merge, notify. Returns the post-merge state of the returned
    /// properties; names the device does not report are simply absent.
    async fn fetch_and_merge(
        &self,
        dsn: &Dsn,
        names: Option<Vec<String>>,
        policy: RoutePolicy,
        source: Option<DataSource>,
    ) -> Result<Vec<PropertyState>, CoreError> {
        let request = Request::FetchProperties {
            names: names.clone(),
        };
        let route = self.selector.route_for(dsn, &request, policy)?;
        let channel = self.selector.channel(route)?;
        let result = match channel.execute(dsn, request).await {
            Ok(response) => response.into_properties(route),
            Err(e) => Err(e),
        };
        self.selector.observe(dsn, route, &result);
        let records = result?;

        let source = source.unwrap_or_else(|| source_of(route));
        let incoming: Vec<PropertyState> = records
            .iter()
            .filter(|r| names.as_ref().is_none_or(|n| n.contains(&r.name)))
            .filter_map(|r| convert::property_from_record(r, source))
            .collect();

        let merged = self.store.merge_properties(dsn, incoming, source)?;
        if !merged.changed.is_empty() {
            self.notifier.device(DeviceEvent::PropertiesChanged {
                dsn: dsn.clone(),
                properties: merged.changed,
                source,
            });
        }
        Ok(merged.current)
    }

    /// Whether a cloud poll is due, given the device's mode.
    fn poll_due(&self, dsn: &Dsn, last: Instant) -> bool {
        let period = match self.selector.mode(dsn) {
            Some(LinkMode::LanActive) => self.config.lan_cloud_poll_interval,
            Some(_) => Some(self.config.cloud_poll_interval),
            None => None,
        };
        period.is_some_and(|p| last.elapsed() >= p)
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Periodic roster refresh.
async fn roster_task(inner: Arc<RegistryInner>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = inner.refresh_roster().await {
                    debug!(error = %e, "roster refresh failed; retrying next cycle");
                }
            }
        }
    }
}

/// Per-device cloud poll. Ticks at the cloud cadence; while `LanActive`
/// only every `lan_cloud_poll_interval` (or never) actually polls.
async fn device_poll_task(inner: Arc<RegistryInner>, dsn: Dsn, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.cloud_poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // consume the immediate first tick
    let mut last = Instant::now();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if !inner.poll_due(&dsn, last) {
                    continue;
                }
                let Ok(_permit) = inner.pool.acquire().await else {
                    break;
                };
                last = Instant::now();
                trace!(%dsn, "poll");
                match inner.fetch_and_merge(&dsn, None, RoutePolicy::CloudOnly, None).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        debug!(%dsn, "device gone; poller exiting");
                        break;
                    }
                    Err(e) => warn!(%dsn, error = %e, "poll failed"),
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Direction;

    fn property(base_type: BaseType) -> PropertyState {
        PropertyState {
            name: "level".into(),
            base_type,
            value: None,
            updated_at: None,
            direction: Direction::Input,
            read_only: false,
            display_name: None,
            metadata: None,
            pending_write: false,
            source: DataSource::Cloud,
        }
    }

    #[test]
    fn write_value_must_match_base_type() {
        let prop = property(BaseType::Integer);
        assert!(validate(PropertyValue::Integer(3), &prop).is_ok());
        let err = validate(PropertyValue::String("3".into()), &prop).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn boolean_accepts_zero_and_one() {
        let prop = property(BaseType::Boolean);
        assert_eq!(
            validate(PropertyValue::Integer(1), &prop).unwrap(),
            PropertyValue::Boolean(true)
        );
        assert_eq!(
            validate(PropertyValue::Integer(0), &prop).unwrap(),
            PropertyValue::Boolean(false)
        );
        let err = validate(PropertyValue::Integer(2), &prop).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        // Only booleans widen; an integer property keeps its type.
        let level = property(BaseType::Integer);
        assert_eq!(
            validate(PropertyValue::Integer(1), &level).unwrap(),
            PropertyValue::Integer(1)
        );
    }

    #[test]
    fn non_finite_decimal_is_rejected() {
        let prop = property(BaseType::Decimal);
        assert!(validate(PropertyValue::Decimal(f64::NAN), &prop).is_err());
        assert!(validate(PropertyValue::Decimal(1.5), &prop).is_ok());
    }
}
