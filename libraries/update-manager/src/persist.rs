//! The durable session record.
//!
//! One fixed slot on a NOR flash partition holds the metadata needed to send
//! the final report of a session after an uncontrolled reset.
//!
//! Layout of the current version, big endian:
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 4    | magic |
//! | 4      | 1    | version (2) |
//! | 5      | 1    | phase |
//! | 6      | 1    | firmware target |
//! | 7      | 1    | flags, bit 0 activation requested, bit 1 success reported |
//! | 8      | 2    | expected image checksum |
//! | 10     | 2    | origin node id |
//! | 12     | 1    | origin endpoint |
//! | 13     | 1    | origin security class |
//! | 14     | 2    | CRC-16 of bytes 0..14 |
//!
//! Version 1 records carry no target and a whole byte for the activation
//! flag. They are migrated to target 0 when read.

use crate::{
    cache::{round_up, ERASED},
    integrity,
    reset_reason::ResetReason,
    session::{Origin, SecurityClass},
};
use byteorder::{BigEndian, ByteOrder};
use core::fmt;
use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};
use static_assertions::const_assert;
use wire_protocols::FirmwareTarget;

pub const RECORD_MAGIC: u32 = 0x4657_5550;
pub const RECORD_VERSION: u8 = 2;
pub const RECORD_SIZE: usize = 16;

const RECORD_V1_SIZE: usize = 15;
const FLAG_ACTIVATION: u8 = 1 << 0;
const FLAG_SUCCESS_REPORTED: u8 = 1 << 1;

// Record padded to the slot write size
const SLOT_BUFFER_SIZE: usize = 32;

const_assert!(RECORD_V1_SIZE <= RECORD_SIZE);
const_assert!(RECORD_SIZE <= SLOT_BUFFER_SIZE);

/// How far the session got before the record was last written
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum Phase {
    /// Fragments were still being transferred
    Receiving,
    /// The image was verified and waits for an activation
    AwaitingActivation,
    /// The device rebooted into the installer
    Installing,
    /// The image was verified and reported, the install is still pending
    Verified,
}

impl TryFrom<u8> for Phase {
    type Error = RecordError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Phase::Receiving),
            2 => Ok(Phase::AwaitingActivation),
            3 => Ok(Phase::Installing),
            4 => Ok(Phase::Verified),
            _ => Err(RecordError::BadPhase(value)),
        }
    }
}

impl From<Phase> for u8 {
    fn from(value: Phase) -> Self {
        match value {
            Phase::Receiving => 1,
            Phase::AwaitingActivation => 2,
            Phase::Installing => 3,
            Phase::Verified => 4,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum RecordError {
    /// The slot holds no record
    Erased,
    BadMagic,
    BadChecksum,
    UnsupportedVersion(u8),
    BadPhase(u8),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::Erased => f.write_str("Record slot is erased"),
            RecordError::BadMagic => f.write_str("Record magic mismatch"),
            RecordError::BadChecksum => f.write_str("Record checksum mismatch"),
            RecordError::UnsupportedVersion(v) => write!(f, "Unsupported record version {}", v),
            RecordError::BadPhase(p) => write!(f, "Invalid record phase {}", p),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, defmt::Format)]
pub struct PersistedRecord {
    pub origin: Origin,
    pub target: FirmwareTarget,
    pub expected_checksum: u16,
    pub activation_requested: bool,
    /// A success status already went out, the install outcome is not reported again
    pub success_reported: bool,
    pub phase: Phase,
}

impl PersistedRecord {
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0_u8; RECORD_SIZE];
        BigEndian::write_u32(&mut buf[0..4], RECORD_MAGIC);
        buf[4] = RECORD_VERSION;
        buf[5] = self.phase.into();
        buf[6] = self.target;
        let mut flags = 0;
        if self.activation_requested {
            flags |= FLAG_ACTIVATION;
        }
        if self.success_reported {
            flags |= FLAG_SUCCESS_REPORTED;
        }
        buf[7] = flags;
        BigEndian::write_u16(&mut buf[8..10], self.expected_checksum);
        BigEndian::write_u16(&mut buf[10..12], self.origin.node_id);
        buf[12] = self.origin.endpoint;
        buf[13] = self.origin.security.into();
        let crc = integrity::checksum(&buf[..RECORD_SIZE - 2]);
        BigEndian::write_u16(&mut buf[RECORD_SIZE - 2..], crc);
        buf
    }

    pub fn from_bytes(value: &[u8]) -> Result<Self, RecordError> {
        if value.len() < RECORD_V1_SIZE {
            return Err(RecordError::BadMagic);
        }
        let magic = BigEndian::read_u32(&value[0..4]);
        if magic == u32::MAX {
            return Err(RecordError::Erased);
        } else if magic != RECORD_MAGIC {
            return Err(RecordError::BadMagic);
        }

        match value[4] {
            RECORD_VERSION if value.len() >= RECORD_SIZE => Self::from_v2(&value[..RECORD_SIZE]),
            1 => Self::from_v1(&value[..RECORD_V1_SIZE]),
            v => Err(RecordError::UnsupportedVersion(v)),
        }
    }

    fn from_v2(value: &[u8]) -> Result<Self, RecordError> {
        check_crc(value)?;
        Ok(Self {
            origin: Origin {
                node_id: BigEndian::read_u16(&value[10..12]),
                endpoint: value[12],
                security: SecurityClass::from(value[13]),
            },
            target: value[6],
            expected_checksum: BigEndian::read_u16(&value[8..10]),
            activation_requested: value[7] & FLAG_ACTIVATION != 0,
            success_reported: value[7] & FLAG_SUCCESS_REPORTED != 0,
            phase: Phase::try_from(value[5])?,
        })
    }

    // magic u32, version u8, phase u8, checksum u16, node u16, endpoint u8,
    // security u8, activation u8, crc u16
    fn from_v1(value: &[u8]) -> Result<Self, RecordError> {
        check_crc(value)?;
        Ok(Self {
            origin: Origin {
                node_id: BigEndian::read_u16(&value[8..10]),
                endpoint: value[10],
                security: SecurityClass::from(value[11]),
            },
            target: 0,
            expected_checksum: BigEndian::read_u16(&value[6..8]),
            activation_requested: value[12] != 0,
            success_reported: false,
            phase: Phase::try_from(value[5])?,
        })
    }
}

fn check_crc(value: &[u8]) -> Result<(), RecordError> {
    let (body, crc) = value.split_at(value.len() - 2);
    if integrity::checksum(body) == BigEndian::read_u16(crc) {
        Ok(())
    } else {
        Err(RecordError::BadChecksum)
    }
}

/// Owns the record slot
pub struct RecordStore<S> {
    slot: S,
}

impl<S: NorFlash> RecordStore<S> {
    pub fn new(slot: S) -> Self {
        Self { slot }
    }

    /// Erases the slot and writes `record`, then reads it back
    pub fn persist(&mut self, record: &PersistedRecord) -> Result<(), NorFlashErrorKind> {
        let bytes = record.to_bytes();
        let padded = round_up(RECORD_SIZE, S::WRITE_SIZE);
        if padded > SLOT_BUFFER_SIZE {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let mut buf = [ERASED; SLOT_BUFFER_SIZE];
        buf[..RECORD_SIZE].copy_from_slice(&bytes);

        self.slot
            .erase(0, S::ERASE_SIZE as u32)
            .map_err(|e| e.kind())?;
        self.slot.write(0, &buf[..padded]).map_err(|e| e.kind())?;

        let mut readback = [0_u8; RECORD_SIZE];
        self.slot.read(0, &mut readback).map_err(|e| e.kind())?;
        if readback != bytes {
            warn!("UM: record read-back mismatch");
            return Err(NorFlashErrorKind::Other);
        }

        debug!("UM: persisted record, phase {:?}", record.phase);
        Ok(())
    }

    /// Reads the slot. Anything that doesn't decode is treated as no record.
    pub fn load(&mut self) -> Option<PersistedRecord> {
        let mut buf = [0_u8; RECORD_SIZE];
        if let Err(e) = self.slot.read(0, &mut buf) {
            warn!("UM: failed to read the record slot. {:?}", e.kind());
            return None;
        }
        match PersistedRecord::from_bytes(&buf) {
            Ok(record) => Some(record),
            Err(RecordError::Erased) => None,
            Err(e) => {
                warn!("UM: ignoring record. {}", e);
                None
            }
        }
    }

    pub fn clear(&mut self) -> Result<(), NorFlashErrorKind> {
        self.slot
            .erase(0, S::ERASE_SIZE as u32)
            .map_err(|e| e.kind())
    }

    /// Only an uncontrolled reset can leave a session behind worth reporting on
    pub fn load_and_resume(&mut self, reset_reason: ResetReason) -> Option<PersistedRecord> {
        if !reset_reason.is_uncontrolled() {
            debug!("UM: not resuming after {}", reset_reason);
            return None;
        }
        let record = self.load()?;
        info!(
            "UM: found record from {} after {}, phase {:?}",
            record.origin, reset_reason, record.phase
        );
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{origin, MockFlash};

    fn record(phase: Phase) -> PersistedRecord {
        PersistedRecord {
            origin: origin(),
            target: 2,
            expected_checksum: 0xBEEF,
            activation_requested: true,
            success_reported: false,
            phase,
        }
    }

    fn v1_bytes(phase: u8, activation: u8) -> [u8; RECORD_V1_SIZE] {
        let mut buf = [0_u8; RECORD_V1_SIZE];
        BigEndian::write_u32(&mut buf[0..4], RECORD_MAGIC);
        buf[4] = 1;
        buf[5] = phase;
        BigEndian::write_u16(&mut buf[6..8], 0x1234);
        BigEndian::write_u16(&mut buf[8..10], 0x0021);
        buf[10] = 3;
        buf[11] = 0x01;
        buf[12] = activation;
        let crc = integrity::checksum(&buf[..RECORD_V1_SIZE - 2]);
        BigEndian::write_u16(&mut buf[RECORD_V1_SIZE - 2..], crc);
        buf
    }

    #[test]
    fn record_layout() {
        let bytes = record(Phase::AwaitingActivation).to_bytes();
        assert_eq!(&bytes[0..4], &RECORD_MAGIC.to_be_bytes());
        assert_eq!(bytes[4], RECORD_VERSION);
        assert_eq!(bytes[5], 2);
        assert_eq!(bytes[6], 2);
        assert_eq!(bytes[7], FLAG_ACTIVATION);
        assert_eq!(&bytes[8..10], &[0xBE, 0xEF]);
        assert_eq!(
            PersistedRecord::from_bytes(&bytes),
            Ok(record(Phase::AwaitingActivation))
        );

        let reported = PersistedRecord {
            activation_requested: false,
            success_reported: true,
            ..record(Phase::Verified)
        };
        let bytes = reported.to_bytes();
        assert_eq!(bytes[5], 4);
        assert_eq!(bytes[7], FLAG_SUCCESS_REPORTED);
        assert_eq!(PersistedRecord::from_bytes(&bytes), Ok(reported));
    }

    #[test]
    fn corrupted_records_are_rejected() {
        assert_eq!(
            PersistedRecord::from_bytes(&[ERASED; RECORD_SIZE]),
            Err(RecordError::Erased)
        );

        let mut bytes = record(Phase::Receiving).to_bytes();
        bytes[9] ^= 0x01;
        assert_eq!(
            PersistedRecord::from_bytes(&bytes),
            Err(RecordError::BadChecksum)
        );

        let mut bytes = record(Phase::Receiving).to_bytes();
        bytes[0] = 0;
        assert_eq!(
            PersistedRecord::from_bytes(&bytes),
            Err(RecordError::BadMagic)
        );

        let mut bytes = record(Phase::Receiving).to_bytes();
        bytes[4] = 9;
        assert_eq!(
            PersistedRecord::from_bytes(&bytes),
            Err(RecordError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn version_1_is_migrated() {
        let mut slot = [ERASED; RECORD_SIZE];
        slot[..RECORD_V1_SIZE].copy_from_slice(&v1_bytes(3, 1));
        let migrated = PersistedRecord::from_bytes(&slot).unwrap();
        assert_eq!(migrated.target, 0);
        assert_eq!(migrated.expected_checksum, 0x1234);
        assert_eq!(migrated.origin.node_id, 0x0021);
        assert_eq!(migrated.origin.endpoint, 3);
        assert_eq!(migrated.origin.security, SecurityClass::S0);
        assert!(migrated.activation_requested);
        assert!(!migrated.success_reported);
        assert_eq!(migrated.phase, Phase::Installing);

        assert_eq!(
            PersistedRecord::from_bytes(&v1_bytes(7, 0)),
            Err(RecordError::BadPhase(7))
        );
    }

    #[test]
    fn store_round_trip() {
        let flash = MockFlash::<8>::new(256);
        let mut store = RecordStore::new(flash.clone());
        assert_eq!(store.load(), None);

        store.persist(&record(Phase::Receiving)).unwrap();
        assert_eq!(store.load(), Some(record(Phase::Receiving)));

        // Overwrites the single slot
        store.persist(&record(Phase::Installing)).unwrap();
        assert_eq!(store.load(), Some(record(Phase::Installing)));

        // Survives a reboot
        let mut rebooted = RecordStore::new(flash);
        assert_eq!(
            rebooted.load_and_resume(ResetReason::BrownoutReset),
            Some(record(Phase::Installing))
        );

        rebooted.clear().unwrap();
        assert_eq!(rebooted.load(), None);
    }

    #[test]
    fn controlled_resets_do_not_resume() {
        let flash = MockFlash::<4>::new(256);
        let mut store = RecordStore::new(flash);
        store.persist(&record(Phase::Receiving)).unwrap();
        assert_eq!(store.load_and_resume(ResetReason::LowPowerReset), None);
        assert_eq!(store.load_and_resume(ResetReason::Unknown(0)), None);
        assert!(store.load_and_resume(ResetReason::PinReset).is_some());
    }

    #[test]
    fn persist_reports_flash_failures() {
        let flash = MockFlash::<4>::new(256);
        let mut store = RecordStore::new(flash.clone());
        flash.fail_writes(true);
        assert!(store.persist(&record(Phase::Receiving)).is_err());
        flash.fail_writes(false);
        assert_eq!(store.load(), None);
    }
}
