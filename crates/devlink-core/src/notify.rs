// ── Listener registry and event fan-out ──
//
// Synchronous listeners run on the thread that produced the change, in
// registration order, after the store lock is released. Every event is
// also sent on a broadcast channel for async consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;

use crate::model::{DeviceEvent, Event, RegistryEvent};

const EVENT_CHANNEL_SIZE: usize = 256;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

pub(crate) struct Listeners<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback<E>)>>,
}

impl<E: 'static> Listeners<E> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        })
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(u64, Callback<E>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(self: &Arc<Self>, callback: Callback<E>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries().push((id, callback));
        let owner: Weak<Self> = Arc::downgrade(self);
        let owner: Weak<dyn Detach> = owner;
        Subscription { id, owner }
    }

    fn emit(&self, event: &E) {
        // Snapshot so listeners may (un)register from inside a callback.
        let callbacks: Vec<Callback<E>> = self.entries().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in callbacks {
            callback(event);
        }
    }

    fn len(&self) -> usize {
        self.entries().len()
    }
}

impl<E: 'static> Detach for Listeners<E> {
    fn detach(&self, id: u64) {
        self.entries().retain(|(entry, _)| *entry != id);
    }
}

/// Handle for a registered listener.
///
/// The listener stays registered for as long as this handle lives;
/// dropping it (or calling [`cancel`](Self::cancel)) unregisters it.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    id: u64,
    owner: Weak<dyn Detach>,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.detach(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Fan-out point shared by the registry and the transport selector.
pub(crate) struct Notifier {
    device: Arc<Listeners<DeviceEvent>>,
    registry: Arc<Listeners<RegistryEvent>>,
    tx: broadcast::Sender<Event>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            device: Listeners::new(),
            registry: Listeners::new(),
            tx,
        }
    }

    pub(crate) fn on_device(&self, callback: Callback<DeviceEvent>) -> Subscription {
        self.device.add(callback)
    }

    pub(crate) fn on_registry(&self, callback: Callback<RegistryEvent>) -> Subscription {
        self.registry.add(callback)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub(crate) fn device(&self, event: DeviceEvent) {
        self.device.emit(&event);
        // No receivers is fine.
        let _ = self.tx.send(Event::Device(event));
    }

    pub(crate) fn registry(&self, event: RegistryEvent) {
        self.registry.emit(&event);
        let _ = self.tx.send(Event::Registry(event));
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.device.len() + self.registry.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Dsn;

    fn list_changed() -> RegistryEvent {
        RegistryEvent::ListChanged {
            added: vec![Dsn::new("A")],
            removed: vec![],
        }
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let notifier = Notifier::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&log), Arc::clone(&log));
        let _s1 = notifier.on_registry(Arc::new(move |_| a.lock().unwrap().push(1)));
        let _s2 = notifier.on_registry(Arc::new(move |_| b.lock().unwrap().push(2)));

        notifier.registry(list_changed());
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let notifier = Notifier::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let sub = notifier.on_registry(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        notifier.registry(list_changed());
        sub.cancel();
        notifier.registry(list_changed());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn events_reach_broadcast_receivers() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        notifier.registry(list_changed());
        assert_eq!(rx.try_recv().unwrap(), Event::Registry(list_changed()));
    }
}
