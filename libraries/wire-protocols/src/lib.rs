//! Message types exchanged with the update initiator.
//!
//! Framing, addressing and the radio transport live outside of this crate.

#![no_std]

pub mod firmware_update;

/// Manufacturer identifier, assigned per vendor
pub type ManufacturerId = u16;

/// Firmware identifier of a single firmware target
pub type FirmwareId = u16;

/// Hardware revision of the device
pub type HardwareVersion = u8;

/// Firmware target, 0 is always the primary application image
pub type FirmwareTarget = u8;
