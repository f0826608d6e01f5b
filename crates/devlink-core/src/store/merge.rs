// ── Merge logic ──
//
// The single write path into device state. Roster refreshes use
// upsert-then-prune; property updates follow last-write-wins by source
// timestamp (never by arrival order). A property value is only replaced
// by one whose timestamp is at least the stored one.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use devlink_api::DeviceRecord;
use tracing::{debug, trace};

use super::{DeviceSlot, DeviceStore};
use crate::convert;
use crate::error::CoreError;
use crate::model::{DataSource, Datapoint, Dsn, PropertyState};

/// Outcome of applying a fresh roster.
#[derive(Default)]
pub(crate) struct RosterDiff {
    pub added: Vec<Dsn>,
    /// Newly vanished devices, whether pruned or retained for pending writes.
    pub removed: Vec<Dsn>,
    /// Slots whose transports must be torn down.
    pub detached: Vec<(Dsn, Arc<DeviceSlot>)>,
    pub details_changed: Vec<Dsn>,
}

impl RosterDiff {
    pub fn is_list_change(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Outcome of merging property readings into one device.
pub(crate) struct MergeResult {
    /// Properties whose value changed or that were new. Drives notifications.
    pub changed: Vec<PropertyState>,
    /// Post-merge state of every property in the incoming batch.
    pub current: Vec<PropertyState>,
}

/// An incoming reading is stale if it is older than what is stored, or
/// carries no timestamp while the stored value does.
fn is_stale(incoming: Option<DateTime<Utc>>, stored: Option<DateTime<Utc>>) -> bool {
    match (incoming, stored) {
        (Some(i), Some(s)) => i < s,
        (None, Some(_)) => true,
        _ => false,
    }
}

impl DeviceStore {
    /// Upsert every roster record, then prune devices the cloud no longer
    /// lists. Devices with pending writes are marked removed instead of
    /// being dropped; they are pruned on a later refresh.
    pub(crate) fn apply_roster(&self, records: &[DeviceRecord]) -> RosterDiff {
        let mut diff = RosterDiff::default();
        let incoming: HashSet<Dsn> = records.iter().map(|r| Dsn::new(&r.dsn)).collect();

        for record in records {
            let dsn = Dsn::new(&record.dsn);
            if let Some(slot) = self.slot(&dsn) {
                let guard = slot.lock();
                let was_removed = guard.state().removed;
                if guard.update(|state| convert::apply_details(state, record)) {
                    diff.details_changed.push(dsn.clone());
                }
                if was_removed {
                    diff.added.push(dsn);
                }
            } else {
                self.insert(convert::device_from_record(record));
                diff.added.push(dsn);
            }
        }

        for dsn in self.dsns() {
            if incoming.contains(&dsn) {
                continue;
            }
            let Some(slot) = self.slot(&dsn) else {
                continue;
            };
            // Checked and removed under the slot lock; `begin_write`
            // re-checks membership under the same lock.
            let guard = slot.lock();
            let state = guard.state();
            if state.has_pending_writes() {
                if !state.removed {
                    guard.update(|device| device.removed = true);
                    drop(guard);
                    debug!(%dsn, "device left roster with writes pending; retained");
                    diff.removed.push(dsn.clone());
                    diff.detached.push((dsn, slot));
                }
            } else if self.remove_slot(&dsn, &slot) {
                drop(guard);
                debug!(%dsn, "device left roster");
                if !state.removed {
                    diff.removed.push(dsn.clone());
                }
                diff.detached.push((dsn, slot));
            }
        }

        self.publish();
        diff
    }

    /// Overwrite device metadata. Returns `true` if anything changed.
    pub(crate) fn apply_details(&self, dsn: &Dsn, record: &DeviceRecord) -> Result<bool, CoreError> {
        let slot = self.slot(dsn).ok_or_else(|| CoreError::device_not_found(dsn))?;
        let changed = slot
            .lock()
            .update(|state| convert::apply_details(state, record));
        self.publish();
        Ok(changed)
    }

    /// Merge property readings under the last-write-wins rule.
    ///
    /// Stale readings are skipped. A reading that matches the stored
    /// value still advances the timestamp but is not reported as changed.
    pub(crate) fn merge_properties(
        &self,
        dsn: &Dsn,
        incoming: Vec<PropertyState>,
        source: DataSource,
    ) -> Result<MergeResult, CoreError> {
        let slot = self.slot(dsn).ok_or_else(|| CoreError::device_not_found(dsn))?;
        let mut changed = Vec::new();
        let mut current = Vec::with_capacity(incoming.len());

        slot.lock().update(|state| {
            for reading in incoming {
                match state.properties.get_mut(&reading.name) {
                    Some(stored) if is_stale(reading.updated_at, stored.updated_at) => {
                        trace!(%dsn, name = %reading.name, "skipping stale reading");
                        current.push(stored.clone());
                    }
                    Some(stored) => {
                        let value_changed =
                            stored.value != reading.value || stored.base_type != reading.base_type;
                        stored.base_type = reading.base_type;
                        stored.value = reading.value;
                        stored.updated_at = reading.updated_at;
                        stored.direction = reading.direction;
                        stored.read_only = reading.read_only;
                        stored.display_name = reading.display_name;
                        stored.metadata = reading.metadata;
                        stored.source = source;
                        if value_changed {
                            changed.push(stored.clone());
                        }
                        current.push(stored.clone());
                    }
                    None => {
                        let mut fresh = reading;
                        fresh.pending_write = false;
                        fresh.source = source;
                        changed.push(fresh.clone());
                        current.push(fresh.clone());
                        state.properties.insert(fresh.name.clone(), fresh);
                    }
                }
            }
            state.last_contact = Some(Utc::now());
            state.source = source;
        });

        trace!(%dsn, changed = changed.len(), total = current.len(), "merged properties");
        self.publish();
        Ok(MergeResult { changed, current })
    }

    /// Apply a write echo. Returns the property if its value changed.
    pub(crate) fn merge_echo(
        &self,
        dsn: &Dsn,
        datapoint: &Datapoint,
    ) -> Result<Option<PropertyState>, CoreError> {
        let slot = self.slot(dsn).ok_or_else(|| CoreError::device_not_found(dsn))?;
        let changed = slot.lock().update(|state| {
            let stored = state.properties.get_mut(&datapoint.property)?;
            if datapoint.value.is_none() || is_stale(datapoint.updated_at, stored.updated_at) {
                return None;
            }
            let value_changed = stored.value != datapoint.value;
            stored.value.clone_from(&datapoint.value);
            stored.updated_at = datapoint.updated_at;
            stored.source = datapoint.source;
            let out = value_changed.then(|| stored.clone());
            state.last_contact = Some(Utc::now());
            out
        });
        self.publish();
        Ok(changed)
    }

    /// Validate and set the pending-write marker on one property.
    ///
    /// Fails with `WriteInProgress` if the marker is already set. `check`
    /// runs under the device lock before the marker is set.
    pub(crate) fn begin_write<R>(
        &self,
        dsn: &Dsn,
        name: &str,
        check: impl FnOnce(&PropertyState) -> Result<R, CoreError>,
    ) -> Result<(PropertyState, R), CoreError> {
        let slot = self.slot(dsn).ok_or_else(|| CoreError::device_not_found(dsn))?;
        let guard = slot.lock();
        let snapshot = guard.state();
        // A prune may have dropped the slot between lookup and lock.
        if snapshot.removed || !self.holds(dsn, &slot) {
            return Err(CoreError::device_not_found(dsn));
        }
        let property = snapshot
            .property(name)
            .ok_or_else(|| CoreError::property_not_found(dsn, name))?;
        if property.pending_write {
            return Err(CoreError::WriteInProgress {
                dsn: dsn.to_string(),
                property: name.to_owned(),
            });
        }
        let checked = check(property)?;
        let property = property.clone();
        guard.update(|state| {
            if let Some(p) = state.properties.get_mut(name) {
                p.pending_write = true;
            }
        });
        drop(guard);
        self.publish();
        Ok((property, checked))
    }

    /// Clear the pending-write marker.
    pub(crate) fn end_write(&self, dsn: &Dsn, name: &str) {
        let Some(slot) = self.slot(dsn) else {
            return;
        };
        slot.lock().update(|state| {
            if let Some(p) = state.properties.get_mut(name) {
                p.pending_write = false;
            }
        });
        self.publish();
    }
}
