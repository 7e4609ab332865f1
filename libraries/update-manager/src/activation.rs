use crate::{config::DeviceIdentity, persist::PersistedRecord};
use wire_protocols::firmware_update::{ActivationSet, ActivationStatus, ActivationStatusReport};

/// Accepts an activation only for the image that is staged on this device
pub fn check_activation(
    set: &ActivationSet,
    staged: Option<&PersistedRecord>,
    identity: &DeviceIdentity,
) -> Result<(), ActivationStatus> {
    let staged = staged.ok_or(ActivationStatus::InvalidCombination)?;
    if set.checksum == staged.expected_checksum
        && set.target == staged.target
        && set.hardware_version == identity.hardware_version
        && identity.matches(set.manufacturer_id, set.firmware_id, set.target)
    {
        Ok(())
    } else {
        Err(ActivationStatus::InvalidCombination)
    }
}

/// Report for an activation command, echoing what was asked for
pub fn report_for_set(set: &ActivationSet, status: ActivationStatus) -> ActivationStatusReport {
    ActivationStatusReport {
        manufacturer_id: set.manufacturer_id,
        firmware_id: set.firmware_id,
        checksum: set.checksum,
        target: set.target,
        status,
        hardware_version: set.hardware_version,
    }
}

/// Report for a staged image after the install attempt
pub fn report_for_record(
    record: &PersistedRecord,
    identity: &DeviceIdentity,
    status: ActivationStatus,
) -> ActivationStatusReport {
    ActivationStatusReport {
        manufacturer_id: identity.manufacturer_id,
        firmware_id: identity
            .target(record.target)
            .map(|t| t.firmware_id)
            .unwrap_or_default(),
        checksum: record.expected_checksum,
        target: record.target,
        status,
        hardware_version: identity.hardware_version,
    }
}
