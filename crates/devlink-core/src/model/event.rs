// ── Change notifications ──

use serde::{Deserialize, Serialize};

use super::device::LinkMode;
use super::dsn::Dsn;
use super::property::{DataSource, PropertyState};

/// Something observable changed on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DeviceEvent {
    /// One or more property values changed. Only the changed
    /// properties are listed, in their post-merge state.
    PropertiesChanged {
        dsn: Dsn,
        properties: Vec<PropertyState>,
        source: DataSource,
    },
    /// The transport selector moved the device to a new mode.
    LinkModeChanged { dsn: Dsn, from: LinkMode, to: LinkMode },
    /// Device metadata (name, address, connectivity) changed.
    DetailsChanged { dsn: Dsn },
}

impl DeviceEvent {
    pub fn dsn(&self) -> &Dsn {
        match self {
            Self::PropertiesChanged { dsn, .. }
            | Self::LinkModeChanged { dsn, .. }
            | Self::DetailsChanged { dsn } => dsn,
        }
    }
}

/// The device roster changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RegistryEvent {
    ListChanged { added: Vec<Dsn>, removed: Vec<Dsn> },
}

/// Union of both event families, as sent on the broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Device(DeviceEvent),
    Registry(RegistryEvent),
}
