// ── Device store ──
//
// Lock-free snapshot reads with per-device serialized writes. Each
// device lives in a `DeviceSlot`: an `ArcSwap` holding the current
// immutable `DeviceState`, plus a mutex that every writer (property
// merge, write marker, link-mode transition) must hold. Readers never
// take the mutex and never see a torn state.

mod merge;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::watch;

pub(crate) use merge::RosterDiff;

use crate::model::{DeviceState, Dsn};
use crate::selector::LinkState;

pub(crate) type Roster = Arc<Vec<Arc<DeviceState>>>;

pub(crate) struct DeviceSlot {
    state: ArcSwap<DeviceState>,
    link: Mutex<LinkState>,
}

impl DeviceSlot {
    fn new(state: DeviceState) -> Self {
        Self {
            state: ArcSwap::from_pointee(state),
            link: Mutex::new(LinkState::default()),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<DeviceState> {
        self.state.load_full()
    }

    /// Take this device's write lock.
    pub(crate) fn lock(&self) -> SlotGuard<'_> {
        SlotGuard {
            state: &self.state,
            link: self.link.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Exclusive write access to one device.
pub(crate) struct SlotGuard<'a> {
    state: &'a ArcSwap<DeviceState>,
    pub(crate) link: MutexGuard<'a, LinkState>,
}

impl SlotGuard<'_> {
    pub(crate) fn state(&self) -> Arc<DeviceState> {
        self.state.load_full()
    }

    /// Copy-on-write update of the device state.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        let mut next = DeviceState::clone(&self.state.load());
        let out = f(&mut next);
        self.state.store(Arc::new(next));
        out
    }
}

/// All devices of one session.
pub(crate) struct DeviceStore {
    devices: DashMap<Dsn, Arc<DeviceSlot>>,
    /// Full snapshot, rebuilt on mutation for subscribers.
    roster: watch::Sender<Roster>,
}

impl DeviceStore {
    pub(crate) fn new() -> Self {
        let (roster, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            devices: DashMap::new(),
            roster,
        }
    }

    pub(crate) fn slot(&self, dsn: &Dsn) -> Option<Arc<DeviceSlot>> {
        self.devices.get(dsn).map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn snapshot(&self, dsn: &Dsn) -> Option<Arc<DeviceState>> {
        self.devices.get(dsn).map(|r| r.value().snapshot())
    }

    pub(crate) fn contains(&self, dsn: &Dsn) -> bool {
        self.devices.contains_key(dsn)
    }

    pub(crate) fn dsns(&self) -> Vec<Dsn> {
        self.devices.iter().map(|r| r.key().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.devices.len()
    }

    /// Current roster snapshot (cheap `Arc` clone).
    pub(crate) fn roster(&self) -> Roster {
        self.roster.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Roster> {
        self.roster.subscribe()
    }

    fn insert(&self, state: DeviceState) {
        self.devices
            .insert(state.dsn.clone(), Arc::new(DeviceSlot::new(state)));
    }

    /// Whether `slot` is still the live entry for `dsn`.
    fn holds(&self, dsn: &Dsn, slot: &Arc<DeviceSlot>) -> bool {
        self.devices
            .get(dsn)
            .is_some_and(|live| Arc::ptr_eq(live.value(), slot))
    }

    /// Drop `slot` from the map unless it was already replaced.
    fn remove_slot(&self, dsn: &Dsn, slot: &Arc<DeviceSlot>) -> bool {
        self.devices
            .remove_if(dsn, |_, live| Arc::ptr_eq(live, slot))
            .is_some()
    }

    /// Rebuild the roster snapshot and notify subscribers.
    pub(crate) fn publish(&self) {
        let mut values: Vec<Arc<DeviceState>> =
            self.devices.iter().map(|r| r.value().snapshot()).collect();
        values.sort_by(|a, b| a.dsn.cmp(&b.dsn));
        // `send_modify` updates unconditionally, even with zero receivers.
        self.roster.send_modify(|snap| *snap = Arc::new(values));
    }
}
