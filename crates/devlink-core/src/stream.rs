// ── Reactive device roster stream ──

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::model::{DeviceState, Dsn};
use crate::store::Roster;

/// A subscription to the device roster.
///
/// Holds the snapshot captured at creation and yields a fresh one
/// whenever any device state changes, sorted by serial number.
pub struct DeviceStream {
    current: Roster,
    receiver: watch::Receiver<Roster>,
}

impl DeviceStream {
    pub(crate) fn new(receiver: watch::Receiver<Roster>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// Snapshot captured at creation, or at the last `changed()`.
    pub fn current(&self) -> &Arc<Vec<Arc<DeviceState>>> {
        &self.current
    }

    pub fn latest(&self) -> Arc<Vec<Arc<DeviceState>>> {
        self.receiver.borrow().clone()
    }

    /// Look up one device in the current snapshot.
    pub fn find(&self, dsn: &Dsn) -> Option<&Arc<DeviceState>> {
        self.current
            .binary_search_by(|d| d.dsn.cmp(dsn))
            .ok()
            .and_then(|i| self.current.get(i))
    }

    /// Wait for the next change. Returns `None` once the registry is gone.
    pub async fn changed(&mut self) -> Option<Arc<Vec<Arc<DeviceState>>>> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = Arc::clone(&snap);
        Some(snap)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> DeviceWatchStream {
        DeviceWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter yielding a roster snapshot per change.
pub struct DeviceWatchStream {
    inner: WatchStream<Roster>,
}

impl Stream for DeviceWatchStream {
    type Item = Arc<Vec<Arc<DeviceState>>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
