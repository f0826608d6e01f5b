// ── Record → domain conversion ──
//
// Maps wire records from either transport into the canonical model.
// Records with an unknown base type or an undecodable value are
// dropped with a log line rather than failing the whole batch.

use devlink_api::{DatapointRecord, DeviceRecord, PropertyRecord};
use indexmap::IndexMap;
use tracing::{trace, warn};

use crate::model::{
    BaseType, ConnectionStatus, DataSource, Datapoint, DeviceState, Direction, Dsn, LinkMode,
    PropertyState, PropertyValue,
};

fn connection_status(raw: Option<&str>) -> ConnectionStatus {
    match raw {
        Some(s) if s.eq_ignore_ascii_case("online") => ConnectionStatus::Online,
        Some(s) if s.eq_ignore_ascii_case("offline") => ConnectionStatus::Offline,
        _ => ConnectionStatus::Unknown,
    }
}

/// A fresh device entry for a roster record. Starts in `Cloud` mode.
pub(crate) fn device_from_record(record: &DeviceRecord) -> DeviceState {
    let mut state = DeviceState {
        dsn: Dsn::new(&record.dsn),
        product_name: None,
        model: None,
        oem_model: None,
        mac: None,
        sw_version: None,
        lan_capable: false,
        lan_ip: None,
        connection_status: ConnectionStatus::Unknown,
        mode: LinkMode::Cloud,
        properties: IndexMap::new(),
        last_contact: None,
        removed: false,
        source: DataSource::Cloud,
    };
    apply_details(&mut state, record);
    state
}

/// Overwrite device metadata from a record. Returns `true` if anything changed.
pub(crate) fn apply_details(state: &mut DeviceState, record: &DeviceRecord) -> bool {
    let lan_ip = record.lan_ip.as_deref().and_then(|ip| ip.parse().ok());
    let status = connection_status(record.connection_status.as_deref());

    let changed = state.product_name != record.product_name
        || state.model != record.model
        || state.oem_model != record.oem_model
        || state.mac != record.mac
        || state.sw_version != record.sw_version
        || state.lan_capable != record.lan_enabled
        || state.lan_ip != lan_ip
        || state.connection_status != status;

    state.product_name.clone_from(&record.product_name);
    state.model.clone_from(&record.model);
    state.oem_model.clone_from(&record.oem_model);
    state.mac.clone_from(&record.mac);
    state.sw_version.clone_from(&record.sw_version);
    state.lan_capable = record.lan_enabled;
    state.lan_ip = lan_ip;
    state.connection_status = status;
    state.removed = false;
    changed
}

pub(crate) fn property_from_record(
    record: &PropertyRecord,
    source: DataSource,
) -> Option<PropertyState> {
    let Ok(base_type) = record.base_type.parse::<BaseType>() else {
        trace!(name = %record.name, base_type = %record.base_type, "skipping unsupported base type");
        return None;
    };
    let value = match PropertyValue::from_json(base_type, &record.value) {
        Ok(v) => v,
        Err(e) => {
            warn!(name = %record.name, error = %e, "dropping undecodable property value");
            return None;
        }
    };
    let direction = record
        .direction
        .as_deref()
        .and_then(|d| d.parse::<Direction>().ok())
        .unwrap_or_default();

    Some(PropertyState {
        name: record.name.clone(),
        base_type,
        value,
        updated_at: record.data_updated_at,
        direction,
        read_only: record.read_only || direction == Direction::Output,
        display_name: record.display_name.clone(),
        metadata: record.metadata.clone(),
        pending_write: false,
        source,
    })
}

/// Decode a write echo against the property's declared type.
pub(crate) fn datapoint_from_record(
    property: &str,
    base_type: BaseType,
    record: &DatapointRecord,
    source: DataSource,
) -> Datapoint {
    let value = PropertyValue::from_json(base_type, &record.value).unwrap_or_else(|e| {
        warn!(property, error = %e, "undecodable datapoint echo");
        None
    });
    Datapoint {
        property: property.to_owned(),
        value,
        created_at: record.created_at,
        updated_at: record.updated_at.or(record.created_at),
        metadata: record.metadata.clone(),
        echo: record.echo,
        source,
    }
}
