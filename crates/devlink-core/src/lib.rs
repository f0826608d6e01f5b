//! Dual-transport device session and property-sync engine.
//!
//! This crate keeps a live view of every device on an account, reached
//! either through the cloud REST service or directly over the local
//! network, and reconciles readings from both into one model:
//!
//! - **[`Session`]**: One authenticated login.
//!   [`sign_in()`](SessionBuilder::sign_in) obtains a token,
//!   [`start()`](Session::start) fetches the roster and spawns polling,
//!   [`sign_out()`](Session::sign_out) tears everything down.
//!
//! - **[`DeviceRegistry`]**: Owns the devices of a session. Property
//!   reads and writes, roster refresh, polling and listener dispatch.
//!   Every call returns an [`Operation`].
//!
//! - **[`Operation<T>`]**: Cancellable handle with a single result slot,
//!   listeners, a deadline measured from dispatch, and an optional
//!   blocking wait for callers on plain threads.
//!
//! - **[`TransportSelector`]**: Per-device link state machine
//!   (`Cloud`, `LanPending`, `LanActive`, `LanFailed`) and route choice
//!   between [`CloudChannel`] and [`LanChannel`].
//!
//! - **Domain model** ([`model`]): [`DeviceState`] snapshots with typed
//!   [`PropertyValue`]s. Property values only move forward in source
//!   time: a reading older than the stored one is ignored.

pub mod config;
mod convert;
pub mod error;
pub mod model;
mod notify;
pub mod operation;
pub mod registry;
pub mod selector;
pub mod session;
mod store;
pub mod stream;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{LanPolicy, SessionConfig};
pub use error::{CoreError, ErrorKind};
pub use notify::Subscription;
pub use operation::{Operation, OperationState};
pub use registry::{DeviceRegistry, PushHint, RegistryState};
pub use selector::{RoutePolicy, TransportSelector};
pub use session::{Session, SessionBuilder};
pub use stream::{DeviceStream, DeviceWatchStream};
pub use transport::{CloudChannel, LanChannel, Request, Response, Route, TransportChannel};

// ── Model re-exports ────────────────────────────────────────────────
pub use model::{
    BaseType, ConnectionStatus, DataSource, Datapoint, DeviceEvent, DeviceState, Direction, Dsn,
    Event, LinkMode, Metadata, PropertyState, PropertyValue, RegistryEvent,
};
