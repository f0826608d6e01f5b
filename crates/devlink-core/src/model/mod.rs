// ── Domain model ──
//
// Canonical device and property types. Records from either transport
// are converted into these before they reach the store.

pub mod device;
pub mod dsn;
pub mod event;
pub mod property;

pub use device::{ConnectionStatus, DeviceState, LinkMode};
pub use dsn::Dsn;
pub use event::{DeviceEvent, Event, RegistryEvent};
pub use property::{
    BaseType, DataSource, Datapoint, Direction, Metadata, PropertyState, PropertyValue,
};
