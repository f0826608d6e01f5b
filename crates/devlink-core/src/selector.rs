// ── Transport selection and LAN negotiation ──
//
// Per-device link state machine:
//
//   Cloud ──permit──▶ LanPending ──handshake ok──▶ LanActive
//     ▲                   │                            │
//     │             timeout/reject               N failures
//     │                   ▼                            │
//     └─────────────── LanFailed ◀── cooldown retry    │
//     ◀────────────────────────────────────────────────┘
//
// Mode, failure counter and task handles change only under the owning
// device's slot lock. Nothing here is global across devices: a slow
// handshake for one device never holds a lock another device needs.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use devlink_api::LanTarget;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LanPolicy;
use crate::error::CoreError;
use crate::model::{DeviceEvent, DeviceState, Dsn, LinkMode};
use crate::notify::Notifier;
use crate::operation::Operation;
use crate::store::{DeviceSlot, DeviceStore, SlotGuard};
use crate::transport::{CloudChannel, LanChannel, Request, Route, TransportChannel};

/// Caller override for route selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum RoutePolicy {
    /// LAN when the device is `LanActive` and the request is LAN-eligible,
    /// cloud otherwise.
    #[default]
    Auto,
    /// LAN or fail with `TransportUnavailable`. Never falls back.
    LanOnly,
    CloudOnly,
}

/// Selector bookkeeping kept beside each device's state, under the same lock.
#[derive(Debug, Default)]
pub(crate) struct LinkState {
    /// The caller allowed LAN mode for this device.
    pub permitted: bool,
    /// Consecutive LAN failures while `LanActive`.
    pub failures: u32,
    /// When the last handshake failed.
    pub failed_at: Option<Instant>,
    /// Bumped whenever a negotiation starts or LAN is torn down, so a
    /// handshake that outlives its epoch is discarded.
    pub epoch: u64,
    /// Heartbeat or retry task for the current epoch.
    pub tasks: Option<CancellationToken>,
}

type ModeChange = Option<(LinkMode, LinkMode)>;

/// Decides which channel carries each request and drives LAN negotiation.
pub struct TransportSelector {
    store: Arc<DeviceStore>,
    cloud: Arc<CloudChannel>,
    lan: Option<Arc<LanChannel>>,
    policy: Option<LanPolicy>,
    notifier: Arc<Notifier>,
    /// Parent of every heartbeat and retry task. Replaced on suspend.
    run: Mutex<CancellationToken>,
    paused: AtomicBool,
}

impl TransportSelector {
    pub(crate) fn new(
        store: Arc<DeviceStore>,
        cloud: Arc<CloudChannel>,
        lan: Option<Arc<LanChannel>>,
        policy: Option<LanPolicy>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            cloud,
            lan,
            policy,
            notifier,
            run: Mutex::new(CancellationToken::new()),
            paused: AtomicBool::new(false),
        }
    }

    pub fn mode(&self, dsn: &Dsn) -> Option<LinkMode> {
        self.store.snapshot(dsn).map(|state| state.mode)
    }

    // ── Routing ──────────────────────────────────────────────────────

    /// Pick the route for `request` on `dsn`.
    ///
    /// LAN is chosen only while the device is `LanActive` with a live
    /// session, and only for LAN-eligible requests: writes, and reads of
    /// explicitly named properties that are all known locally.
    pub fn route_for(
        &self,
        dsn: &Dsn,
        request: &Request,
        policy: RoutePolicy,
    ) -> Result<Route, CoreError> {
        let state = self
            .store
            .snapshot(dsn)
            .ok_or_else(|| CoreError::device_not_found(dsn))?;

        let lan_ready = state.mode == LinkMode::LanActive
            && self.lan.as_ref().is_some_and(|lan| lan.has_session(dsn));
        let eligible = match request {
            Request::FetchDevice | Request::FetchProperties { names: None } => false,
            Request::FetchProperties { names: Some(names) } => {
                !names.is_empty() && state.knows_all(names)
            }
            Request::CreateDatapoint { .. } => true,
        };

        match policy {
            RoutePolicy::CloudOnly => Ok(Route::Cloud),
            RoutePolicy::Auto if lan_ready && eligible => Ok(Route::Lan),
            RoutePolicy::Auto => Ok(Route::Cloud),
            RoutePolicy::LanOnly if lan_ready && eligible => Ok(Route::Lan),
            RoutePolicy::LanOnly => Err(CoreError::TransportUnavailable {
                dsn: dsn.to_string(),
                reason: if lan_ready {
                    format!("{} is not eligible for LAN", request.kind())
                } else {
                    format!("device is in {} mode", state.mode)
                },
            }),
        }
    }

    pub(crate) fn channel(&self, route: Route) -> Result<Arc<dyn TransportChannel>, CoreError> {
        let channel: Arc<dyn TransportChannel> = match route {
            Route::Cloud => self.cloud.clone(),
            Route::Lan => self.lan.clone().ok_or_else(|| CoreError::TransportUnavailable {
                dsn: String::new(),
                reason: "no LAN link configured".into(),
            })?,
        };
        Ok(channel)
    }

    // ── Failure accounting ───────────────────────────────────────────

    /// Feed a request outcome back into the failure counter.
    pub(crate) fn observe<T>(&self, dsn: &Dsn, route: Route, result: &Result<T, CoreError>) {
        if route != Route::Lan {
            return;
        }
        match result {
            Ok(_) => self.record_lan_success(dsn),
            Err(e) => self.record_lan_failure(dsn, e),
        }
    }

    pub fn record_lan_success(&self, dsn: &Dsn) {
        if let Some(slot) = self.store.slot(dsn) {
            slot.lock().link.failures = 0;
        }
    }

    /// Count a LAN failure. Reaching the threshold drops the device to `Cloud`.
    ///
    /// Only link-level failures count; a request the device refused
    /// (bad value, unknown property) says nothing about the link.
    pub fn record_lan_failure(&self, dsn: &Dsn, err: &CoreError) {
        if !err.is_link_failure() {
            return;
        }
        let (Some(slot), Some(policy)) = (self.store.slot(dsn), self.policy.as_ref()) else {
            return;
        };
        let change = {
            let mut guard = slot.lock();
            if guard.state().mode != LinkMode::LanActive {
                return;
            }
            guard.link.failures += 1;
            let failures = guard.link.failures;
            if failures < policy.failure_threshold.get() {
                debug!(%dsn, failures, error = %err, "LAN failure");
                return;
            }
            warn!(%dsn, failures, error = %err, "LAN failure threshold reached, falling back to cloud");
            guard.link.epoch += 1;
            self.to_cloud(&mut guard, dsn)
        };
        self.announce(dsn, change);
    }

    // ── Transitions ──────────────────────────────────────────────────

    fn transition(guard: &mut SlotGuard<'_>, dsn: &Dsn, to: LinkMode) -> ModeChange {
        let from = guard.state().mode;
        if from == to {
            return None;
        }
        if !from.can_transition_to(to) {
            warn!(%dsn, %from, %to, "rejected link mode transition");
            return None;
        }
        guard.update(|state| state.mode = to);
        info!(%dsn, %from, %to, "link mode changed");
        Some((from, to))
    }

    /// Publish and notify after the slot lock is released.
    fn announce(&self, dsn: &Dsn, change: ModeChange) {
        let Some((from, to)) = change else {
            return;
        };
        self.store.publish();
        self.notifier.device(DeviceEvent::LinkModeChanged {
            dsn: dsn.clone(),
            from,
            to,
        });
    }

    fn to_cloud(&self, guard: &mut SlotGuard<'_>, dsn: &Dsn) -> ModeChange {
        self.teardown(dsn, guard);
        Self::transition(guard, dsn, LinkMode::Cloud)
    }

    /// Stop the device's LAN tasks and close its session.
    fn teardown(&self, dsn: &Dsn, guard: &mut SlotGuard<'_>) {
        guard.link.failures = 0;
        if let Some(tasks) = guard.link.tasks.take() {
            tasks.cancel();
        }
        let Some(closing) = self.lan.as_ref().and_then(|lan| lan.detach(dsn)) else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(closing);
            }
            Err(_) => debug!(%dsn, "no runtime; LAN link left to the collaborator"),
        }
    }

    /// Force the device to `Cloud` (explicit disable, sign-out, removal).
    pub fn force_cloud(&self, dsn: &Dsn) {
        if let Some(slot) = self.store.slot(dsn) {
            self.force_slot(dsn, &slot);
        }
    }

    /// Tear down a device that left the roster. `slot` may already be
    /// gone from the store.
    pub(crate) fn detach(&self, dsn: &Dsn, slot: &DeviceSlot) {
        slot.lock().link.permitted = false;
        self.force_slot(dsn, slot);
    }

    fn force_slot(&self, dsn: &Dsn, slot: &DeviceSlot) {
        let change = {
            let mut guard = slot.lock();
            guard.link.epoch += 1;
            self.to_cloud(&mut guard, dsn)
        };
        self.announce(dsn, change);
    }

    // ── LAN negotiation ──────────────────────────────────────────────

    fn lan_possible(&self, state: &DeviceState) -> bool {
        self.policy.is_some()
            && self.lan.is_some()
            && state.lan_capable
            && state.lan_ip.is_some()
            && !state.removed
            && !self.paused.load(Ordering::Acquire)
    }

    fn run_token(&self) -> CancellationToken {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token()
    }

    /// Allow or forbid LAN mode for one device.
    ///
    /// Forbidding settles at `Cloud` immediately. Permitting starts a
    /// negotiation when the device can do LAN and is in `Cloud` (or in
    /// `LanFailed` past its cooldown); the operation settles with the mode
    /// the negotiation ends in. Otherwise it settles with the current mode.
    /// Cancelling the operation abandons the handshake and returns the
    /// device to `Cloud`.
    pub fn set_lan_mode_permitted(
        self: &Arc<Self>,
        dsn: &Dsn,
        permitted: bool,
        timeout: Duration,
    ) -> Operation<LinkMode> {
        let label = format!("set_lan_mode:{dsn}");
        let Some(slot) = self.store.slot(dsn) else {
            return Operation::ready(label, Err(CoreError::device_not_found(dsn)));
        };

        if !permitted {
            let change = {
                let mut guard = slot.lock();
                guard.link.permitted = false;
                guard.link.epoch += 1;
                self.to_cloud(&mut guard, dsn)
            };
            self.announce(dsn, change);
            return Operation::ready(label, Ok(LinkMode::Cloud));
        }

        let (start, mode) = {
            let mut guard = slot.lock();
            guard.link.permitted = true;
            let state = guard.state();
            let cooled = self.policy.as_ref().is_some_and(|policy| {
                guard
                    .link
                    .failed_at
                    .is_none_or(|at| at.elapsed() >= policy.retry_cooldown)
            });
            let start = self.lan_possible(&state)
                && match state.mode {
                    LinkMode::Cloud => true,
                    LinkMode::LanFailed => cooled,
                    LinkMode::LanPending | LinkMode::LanActive => false,
                };
            (start, state.mode)
        };
        if !start {
            debug!(%dsn, %mode, "LAN negotiation not started");
            return Operation::ready(label, Ok(mode));
        }

        let negotiation = self.spawn_negotiation(dsn.clone());
        let op = Operation::new(label, timeout);
        {
            let selector = Arc::clone(self);
            let dsn = dsn.clone();
            op.on_cancel(move || selector.abandon_negotiation(&dsn));
        }
        op.run(None, async move {
            negotiation.await.map_err(|_| CoreError::Cancelled)
        });
        op
    }

    /// Stop a handshake still in `LanPending` and settle at `Cloud`. The
    /// permission is kept; a running negotiation sees the epoch move and
    /// discards its result.
    fn abandon_negotiation(&self, dsn: &Dsn) {
        let Some(slot) = self.store.slot(dsn) else {
            return;
        };
        let change = {
            let mut guard = slot.lock();
            if guard.state().mode != LinkMode::LanPending {
                return;
            }
            debug!(%dsn, "LAN negotiation abandoned by caller");
            guard.link.epoch += 1;
            self.to_cloud(&mut guard, dsn)
        };
        self.announce(dsn, change);
    }

    fn spawn_negotiation(self: &Arc<Self>, dsn: Dsn) -> JoinHandle<LinkMode> {
        tokio::spawn(Arc::clone(self).negotiate(dsn))
    }

    /// Run one handshake attempt: `LanPending`, then `LanActive` or `LanFailed`.
    async fn negotiate(self: Arc<Self>, dsn: Dsn) -> LinkMode {
        let (Some(policy), Some(lan)) = (self.policy.clone(), self.lan.clone()) else {
            return self.mode(&dsn).unwrap_or_default();
        };
        let Some(slot) = self.store.slot(&dsn) else {
            return LinkMode::Cloud;
        };

        let (epoch, tasks, lan_ip, change) = {
            let mut guard = slot.lock();
            let state = guard.state();
            let startable = matches!(state.mode, LinkMode::Cloud | LinkMode::LanFailed);
            let Some(lan_ip) = state.lan_ip else {
                return state.mode;
            };
            if !guard.link.permitted || !startable || !self.lan_possible(&state) {
                return state.mode;
            }
            guard.link.epoch += 1;
            if let Some(previous) = guard.link.tasks.take() {
                previous.cancel();
            }
            let tasks = self.run_token();
            guard.link.tasks = Some(tasks.clone());
            let change = Self::transition(&mut guard, &dsn, LinkMode::LanPending);
            (guard.link.epoch, tasks, lan_ip, change)
        };
        self.announce(&dsn, change);

        let result = tokio::select! {
            biased;
            () = tasks.cancelled() => Err(CoreError::Cancelled),
            res = tokio::time::timeout(policy.handshake_timeout, self.handshake(&lan, &dsn, lan_ip)) => {
                res.unwrap_or_else(|_| Err(CoreError::Timeout {
                    timeout_ms: u64::try_from(policy.handshake_timeout.as_millis()).unwrap_or(u64::MAX),
                }))
            }
        };

        let (mode, change, stale_session) = {
            let mut guard = slot.lock();
            let current = guard.state().mode;
            if guard.link.epoch != epoch || current != LinkMode::LanPending {
                debug!(%dsn, %current, "discarding superseded LAN negotiation");
                let stale = result.is_ok() && matches!(current, LinkMode::Cloud | LinkMode::LanFailed);
                (current, None, stale)
            } else {
                match result {
                    Ok(()) => {
                        guard.link.failures = 0;
                        guard.link.failed_at = None;
                        let change = Self::transition(&mut guard, &dsn, LinkMode::LanActive);
                        tokio::spawn(heartbeat_task(
                            Arc::clone(&self),
                            Arc::clone(&lan),
                            dsn.clone(),
                            policy.heartbeat_interval,
                            tasks.clone(),
                        ));
                        (LinkMode::LanActive, change, false)
                    }
                    Err(e) => {
                        warn!(%dsn, error = %e, "LAN handshake failed, staying on cloud");
                        guard.link.failed_at = Some(Instant::now());
                        let change = Self::transition(&mut guard, &dsn, LinkMode::LanFailed);
                        let closing = lan.detach(&dsn);
                        tokio::spawn(retry_task(
                            Arc::clone(&self),
                            dsn.clone(),
                            policy.retry_cooldown,
                            tasks.clone(),
                        ));
                        if let Some(closing) = closing {
                            tokio::spawn(closing);
                        }
                        (LinkMode::LanFailed, change, false)
                    }
                }
            }
        };
        self.announce(&dsn, change);

        if stale_session {
            lan.close(&dsn).await;
        }
        mode
    }

    /// Fetch the device's LAN key through the cloud, then handshake.
    async fn handshake(&self, lan: &LanChannel, dsn: &Dsn, lan_ip: IpAddr) -> Result<(), CoreError> {
        let config = self.cloud.fetch_lan_config(dsn).await?;
        if !config.is_usable() {
            return Err(CoreError::TransportUnavailable {
                dsn: dsn.to_string(),
                reason: "device has no usable LAN config".into(),
            });
        }
        let target = LanTarget {
            dsn: dsn.to_string(),
            lan_ip,
            config,
        };
        lan.open(dsn, &target).await
    }

    // ── Suspend / resume ─────────────────────────────────────────────

    /// Stop every LAN task and force every device to `Cloud`. LAN
    /// permissions are kept for [`resume`](Self::resume).
    pub(crate) fn suspend(&self) {
        self.paused.store(true, Ordering::Release);
        {
            let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
            run.cancel();
            *run = CancellationToken::new();
        }
        for dsn in self.store.dsns() {
            self.force_cloud(&dsn);
        }
    }

    /// Renegotiate LAN for every device that still has permission.
    pub(crate) fn resume(self: &Arc<Self>) {
        self.paused.store(false, Ordering::Release);
        for dsn in self.store.dsns() {
            let permitted = self
                .store
                .slot(&dsn)
                .is_some_and(|slot| slot.lock().link.permitted);
            if permitted {
                drop(self.spawn_negotiation(dsn));
            }
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Keep-alive loop for one `LanActive` device. Failures count toward the
/// failover threshold.
async fn heartbeat_task(
    selector: Arc<TransportSelector>,
    lan: Arc<LanChannel>,
    dsn: Dsn,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                match lan.keep_alive(&dsn).await {
                    Ok(()) => selector.record_lan_success(&dsn),
                    Err(e) => {
                        debug!(%dsn, error = %e, "heartbeat failed");
                        selector.record_lan_failure(&dsn, &e);
                    }
                }
            }
        }
    }
}

/// Retry the handshake once the cooldown has elapsed.
async fn retry_task(
    selector: Arc<TransportSelector>,
    dsn: Dsn,
    cooldown: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        () = tokio::time::sleep(cooldown) => {
            debug!(%dsn, "LAN cooldown elapsed, retrying handshake");
            drop(selector.spawn_negotiation(dsn));
        }
    }
}
