//! The firmware update protocol covers requesting, transferring and activating
//! a new firmware image, one fragment at a time, over a lossy low-bandwidth link.
//!
//! The device is the one pulling data: it accepts a `RequestGet`, answers with a
//! `RequestReport`, and then asks for fragments with `FragmentGet` until the
//! initiator sends the `FragmentReport` with the last flag set.
//! A `StatusReport` ends every accepted session.
//!
//! Everything is big endian.

use crate::{FirmwareId, FirmwareTarget, HardwareVersion, ManufacturerId};
use bitfield::bitfield;
use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use core::fmt;
use heapless::Vec;

/// Upper bound on the fragment payload size any transport may negotiate.
pub const MAX_FRAGMENT_SIZE: usize = 256;

/// Report numbers are 15 bits on the wire, the MSB carries the last-fragment flag.
pub const MAX_REPORT_NUMBER: u16 = 0x7FFF;

pub type FragmentData = Vec<u8, MAX_FRAGMENT_SIZE>;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum Error {
    /// The buffer is too short for the message
    Truncated,
    /// A fragment payload exceeds `MAX_FRAGMENT_SIZE`
    PayloadTooLong,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Truncated => f.write_str("Message truncated"),
            Error::PayloadTooLong => f.write_str("Fragment payload too long"),
        }
    }
}

bitfield! {
    /// The report number field of `FragmentGet` and `FragmentReport`
    #[derive(Copy, Clone, Eq, PartialEq, Hash)]
    pub struct ReportField(u16);
    impl Debug;
    pub last, set_last: 15;
    pub u16, number, set_number: 14, 0;
}

impl ReportField {
    pub fn new(number: u16, last: bool) -> Self {
        let mut f = ReportField(0);
        f.set_number(number);
        f.set_last(last);
        f
    }

    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

bitflags! {
    /// Capability flags carried by `RequestGet`
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct RequestFlags: u8 {
        /// The initiator will send an `ActivationSet` once it wants the
        /// new image to be installed
        const ACTIVATION = 1 << 0;
    }
}

/// Fragment size proposed by the initiator
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum FragmentSize {
    /// Let the device pick its maximum
    Maximum,
    /// Exact number of payload bytes per non-final fragment
    Bytes(u16),
}

impl From<u16> for FragmentSize {
    fn from(value: u16) -> Self {
        match value {
            0 => FragmentSize::Maximum,
            v => FragmentSize::Bytes(v),
        }
    }
}

impl From<FragmentSize> for u16 {
    fn from(value: FragmentSize) -> Self {
        match value {
            FragmentSize::Maximum => 0,
            FragmentSize::Bytes(v) => v,
        }
    }
}

/// Request to start a firmware update session.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, defmt::Format)]
pub struct RequestGet {
    pub manufacturer_id: ManufacturerId,
    pub firmware_id: FirmwareId,
    /// Checksum of the whole image
    pub checksum: u16,
    pub target: FirmwareTarget,
    pub fragment_size: FragmentSize,
    pub hardware_version: HardwareVersion,
    /// The initiator wants the two-phase activation handshake
    pub activation: bool,
}

impl RequestGet {
    pub const WIRE_SIZE: usize = 11;

    pub fn from_be_bytes(value: &[u8]) -> Result<Self, Error> {
        if value.len() < Self::WIRE_SIZE {
            return Err(Error::Truncated);
        }
        let flags = RequestFlags::from_bits_truncate(value[10]);
        Ok(Self {
            manufacturer_id: BigEndian::read_u16(&value[0..2]),
            firmware_id: BigEndian::read_u16(&value[2..4]),
            checksum: BigEndian::read_u16(&value[4..6]),
            target: value[6],
            fragment_size: FragmentSize::from(BigEndian::read_u16(&value[7..9])),
            hardware_version: value[9],
            activation: flags.contains(RequestFlags::ACTIVATION),
        })
    }

    pub fn to_be_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        BigEndian::write_u16(&mut buf[0..2], self.manufacturer_id);
        BigEndian::write_u16(&mut buf[2..4], self.firmware_id);
        BigEndian::write_u16(&mut buf[4..6], self.checksum);
        buf[6] = self.target;
        BigEndian::write_u16(&mut buf[7..9], self.fragment_size.into());
        buf[9] = self.hardware_version;
        let mut flags = RequestFlags::empty();
        flags.set(RequestFlags::ACTIVATION, self.activation);
        buf[10] = flags.bits();
        buf
    }
}

/// Answer to a `RequestGet`
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum RequestStatus {
    /// Manufacturer or firmware identifier don't match this device
    InvalidCombination,
    /// The application refused the request
    RequiresAuthentication,
    /// The requested fragment size is not supported
    InvalidFragmentSize,
    /// The firmware target is unknown or can't be updated
    NotUpgradable,
    InvalidHardwareVersion,
    /// The device accepted the request and will start asking for fragments
    Valid,
    Unknown(u8),
}

impl RequestStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, RequestStatus::Valid)
    }
}

impl From<u8> for RequestStatus {
    fn from(value: u8) -> Self {
        use RequestStatus::*;
        match value {
            0x00 => InvalidCombination,
            0x01 => RequiresAuthentication,
            0x02 => InvalidFragmentSize,
            0x03 => NotUpgradable,
            0x04 => InvalidHardwareVersion,
            0xFF => Valid,
            _ => Unknown(value),
        }
    }
}

impl From<RequestStatus> for u8 {
    fn from(value: RequestStatus) -> Self {
        use RequestStatus::*;
        match value {
            InvalidCombination => 0x00,
            RequiresAuthentication => 0x01,
            InvalidFragmentSize => 0x02,
            NotUpgradable => 0x03,
            InvalidHardwareVersion => 0x04,
            Valid => 0xFF,
            Unknown(v) => v,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, defmt::Format)]
pub struct RequestReport {
    pub status: RequestStatus,
}

impl RequestReport {
    pub const WIRE_SIZE: usize = 1;

    pub fn from_be_bytes(value: &[u8]) -> Result<Self, Error> {
        let status = value.first().ok_or(Error::Truncated)?;
        Ok(Self {
            status: RequestStatus::from(*status),
        })
    }

    pub fn to_be_bytes(self) -> [u8; Self::WIRE_SIZE] {
        [self.status.into()]
    }
}

/// Ask the initiator for `reports` consecutive fragments starting at `report_number`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, defmt::Format)]
pub struct FragmentGet {
    pub reports: u8,
    pub report_number: u16,
}

impl FragmentGet {
    pub const WIRE_SIZE: usize = 3;

    pub fn from_be_bytes(value: &[u8]) -> Result<Self, Error> {
        if value.len() < Self::WIRE_SIZE {
            return Err(Error::Truncated);
        }
        let field = ReportField(BigEndian::read_u16(&value[1..3]));
        Ok(Self {
            reports: value[0],
            report_number: field.number(),
        })
    }

    pub fn to_be_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let field = ReportField::new(self.report_number, false).to_be_bytes();
        [self.reports, field[0], field[1]]
    }
}

/// One fragment of the image.
///
/// The checksum covers the encoded report field followed by the payload.
#[derive(Clone, Eq, PartialEq, Hash, Debug, defmt::Format)]
pub struct FragmentReport {
    pub report_number: u16,
    pub last: bool,
    pub data: FragmentData,
    pub checksum: u16,
}

impl FragmentReport {
    /// Report field plus checksum
    pub const OVERHEAD: usize = 4;

    pub fn report_field(&self) -> ReportField {
        ReportField::new(self.report_number, self.last)
    }

    pub fn parse(value: &[u8]) -> Result<Self, Error> {
        if value.len() < Self::OVERHEAD {
            return Err(Error::Truncated);
        }
        let (body, crc) = value.split_at(value.len() - 2);
        let field = ReportField(BigEndian::read_u16(&body[0..2]));
        let data = Vec::from_slice(&body[2..]).map_err(|_| Error::PayloadTooLong)?;
        Ok(Self {
            report_number: field.number(),
            last: field.last(),
            data,
            checksum: BigEndian::read_u16(crc),
        })
    }

    /// Returns the number of bytes written
    pub fn emit(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let len = self.data.len() + Self::OVERHEAD;
        if buf.len() < len {
            return Err(Error::Truncated);
        }
        buf[0..2].copy_from_slice(&self.report_field().to_be_bytes());
        buf[2..2 + self.data.len()].copy_from_slice(&self.data);
        BigEndian::write_u16(&mut buf[len - 2..len], self.checksum);
        Ok(len)
    }
}

/// Outcome of an update session
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum UpdateStatus {
    /// The whole-image checksum didn't match
    ChecksumError,
    /// Retries exhausted or the transfer was interrupted
    UnableToReceive,
    InvalidManufacturerId,
    InvalidFirmwareId,
    InvalidTarget,
    /// The bootloader rejected the image
    InvalidImage,
    InvalidImageFormat,
    /// The image doesn't fit or couldn't be written
    InsufficientMemory,
    InvalidHardwareVersion,
    /// Image stored, waiting for an `ActivationSet`
    SuccessWaitingActivation,
    /// Image stored, the device won't restart on its own
    SuccessStored,
    /// Image stored, the device restarts after the wait time
    SuccessRestart,
    Unknown(u8),
}

impl UpdateStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            UpdateStatus::SuccessWaitingActivation
                | UpdateStatus::SuccessStored
                | UpdateStatus::SuccessRestart
        )
    }
}

impl From<u8> for UpdateStatus {
    fn from(value: u8) -> Self {
        use UpdateStatus::*;
        match value {
            0x00 => ChecksumError,
            0x01 => UnableToReceive,
            0x02 => InvalidManufacturerId,
            0x03 => InvalidFirmwareId,
            0x04 => InvalidTarget,
            0x05 => InvalidImage,
            0x06 => InvalidImageFormat,
            0x07 => InsufficientMemory,
            0x08 => InvalidHardwareVersion,
            0xFD => SuccessWaitingActivation,
            0xFE => SuccessStored,
            0xFF => SuccessRestart,
            _ => Unknown(value),
        }
    }
}

impl From<UpdateStatus> for u8 {
    fn from(value: UpdateStatus) -> Self {
        use UpdateStatus::*;
        match value {
            ChecksumError => 0x00,
            UnableToReceive => 0x01,
            InvalidManufacturerId => 0x02,
            InvalidFirmwareId => 0x03,
            InvalidTarget => 0x04,
            InvalidImage => 0x05,
            InvalidImageFormat => 0x06,
            InsufficientMemory => 0x07,
            InvalidHardwareVersion => 0x08,
            SuccessWaitingActivation => 0xFD,
            SuccessStored => 0xFE,
            SuccessRestart => 0xFF,
            Unknown(v) => v,
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, defmt::Format)]
pub struct StatusReport {
    pub status: UpdateStatus,
    /// Seconds until the device is reachable again, 0 if it stays up
    pub wait_time: u16,
}

impl StatusReport {
    pub const WIRE_SIZE: usize = 3;

    pub fn new(status: UpdateStatus) -> Self {
        Self {
            status,
            wait_time: 0,
        }
    }

    pub fn from_be_bytes(value: &[u8]) -> Result<Self, Error> {
        if value.len() < Self::WIRE_SIZE {
            return Err(Error::Truncated);
        }
        Ok(Self {
            status: UpdateStatus::from(value[0]),
            wait_time: BigEndian::read_u16(&value[1..3]),
        })
    }

    pub fn to_be_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let wait = self.wait_time.to_be_bytes();
        [self.status.into(), wait[0], wait[1]]
    }
}

/// Install a previously transferred image.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, defmt::Format)]
pub struct ActivationSet {
    pub manufacturer_id: ManufacturerId,
    pub firmware_id: FirmwareId,
    pub checksum: u16,
    pub target: FirmwareTarget,
    pub hardware_version: HardwareVersion,
}

impl ActivationSet {
    pub const WIRE_SIZE: usize = 8;

    pub fn from_be_bytes(value: &[u8]) -> Result<Self, Error> {
        if value.len() < Self::WIRE_SIZE {
            return Err(Error::Truncated);
        }
        Ok(Self {
            manufacturer_id: BigEndian::read_u16(&value[0..2]),
            firmware_id: BigEndian::read_u16(&value[2..4]),
            checksum: BigEndian::read_u16(&value[4..6]),
            target: value[6],
            hardware_version: value[7],
        })
    }

    pub fn to_be_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        BigEndian::write_u16(&mut buf[0..2], self.manufacturer_id);
        BigEndian::write_u16(&mut buf[2..4], self.firmware_id);
        BigEndian::write_u16(&mut buf[4..6], self.checksum);
        buf[6] = self.target;
        buf[7] = self.hardware_version;
        buf
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum ActivationStatus {
    /// The activation doesn't match the transferred image or this device
    InvalidCombination,
    /// The bootloader failed to install the image
    ErrorActivating,
    /// The new image is running
    Completed,
    Unknown(u8),
}

impl From<u8> for ActivationStatus {
    fn from(value: u8) -> Self {
        use ActivationStatus::*;
        match value {
            0x00 => InvalidCombination,
            0x01 => ErrorActivating,
            0xFF => Completed,
            _ => Unknown(value),
        }
    }
}

impl From<ActivationStatus> for u8 {
    fn from(value: ActivationStatus) -> Self {
        use ActivationStatus::*;
        match value {
            InvalidCombination => 0x00,
            ErrorActivating => 0x01,
            Completed => 0xFF,
            Unknown(v) => v,
        }
    }
}

impl fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, defmt::Format)]
pub struct ActivationStatusReport {
    pub manufacturer_id: ManufacturerId,
    pub firmware_id: FirmwareId,
    pub checksum: u16,
    pub target: FirmwareTarget,
    pub status: ActivationStatus,
    pub hardware_version: HardwareVersion,
}

impl ActivationStatusReport {
    pub const WIRE_SIZE: usize = 9;

    pub fn from_be_bytes(value: &[u8]) -> Result<Self, Error> {
        if value.len() < Self::WIRE_SIZE {
            return Err(Error::Truncated);
        }
        Ok(Self {
            manufacturer_id: BigEndian::read_u16(&value[0..2]),
            firmware_id: BigEndian::read_u16(&value[2..4]),
            checksum: BigEndian::read_u16(&value[4..6]),
            target: value[6],
            status: ActivationStatus::from(value[7]),
            hardware_version: value[8],
        })
    }

    pub fn to_be_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0_u8; Self::WIRE_SIZE];
        BigEndian::write_u16(&mut buf[0..2], self.manufacturer_id);
        BigEndian::write_u16(&mut buf[2..4], self.firmware_id);
        BigEndian::write_u16(&mut buf[4..6], self.checksum);
        buf[6] = self.target;
        buf[7] = self.status.into();
        buf[8] = self.hardware_version;
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_status_codes() {
        for in_c in 0..=0xFF_u8 {
            assert_eq!(in_c, u8::from(RequestStatus::from(in_c)));
            assert_eq!(in_c, u8::from(UpdateStatus::from(in_c)));
            assert_eq!(in_c, u8::from(ActivationStatus::from(in_c)));
        }
    }

    #[test]
    fn report_field_packs_last_flag_in_msb() {
        let f = ReportField::new(0x0102, true);
        assert_eq!(f.to_be_bytes(), [0x81, 0x02]);
        assert_eq!(f.number(), 0x0102);
        assert!(f.last());

        let f = ReportField(0x7FFF);
        assert_eq!(f.number(), MAX_REPORT_NUMBER);
        assert!(!f.last());
    }

    #[test]
    fn request_get() {
        let bytes = [
            0x00, 0x86, 0x12, 0x34, 0xAB, 0xCD, 0x00, 0x00, 0x40, 0x02, 0x01,
        ];
        let req = RequestGet::from_be_bytes(&bytes).unwrap();
        assert_eq!(req.manufacturer_id, 0x0086);
        assert_eq!(req.firmware_id, 0x1234);
        assert_eq!(req.checksum, 0xABCD);
        assert_eq!(req.target, 0);
        assert_eq!(req.fragment_size, FragmentSize::Bytes(64));
        assert_eq!(req.hardware_version, 2);
        assert!(req.activation);
        assert_eq!(req.to_be_bytes(), bytes);

        let mut no_size = bytes;
        no_size[7] = 0;
        no_size[8] = 0;
        let req = RequestGet::from_be_bytes(&no_size).unwrap();
        assert_eq!(req.fragment_size, FragmentSize::Maximum);

        assert_eq!(
            RequestGet::from_be_bytes(&bytes[..10]),
            Err(Error::Truncated)
        );
    }

    #[test]
    fn fragment_get_never_sets_last_flag() {
        let get = FragmentGet {
            reports: 4,
            report_number: 9,
        };
        assert_eq!(get.to_be_bytes(), [4, 0x00, 0x09]);
        assert_eq!(FragmentGet::from_be_bytes(&[4, 0x00, 0x09]).unwrap(), get);
    }

    #[test]
    fn fragment_report() {
        let wire = [0x80, 0x03, 0xDE, 0xAD, 0xBE, 0x12, 0x34];
        let report = FragmentReport::parse(&wire).unwrap();
        assert_eq!(report.report_number, 3);
        assert!(report.last);
        assert_eq!(&report.data[..], &[0xDE, 0xAD, 0xBE]);
        assert_eq!(report.checksum, 0x1234);

        let mut buf = [0_u8; 16];
        let len = report.emit(&mut buf).unwrap();
        assert_eq!(&buf[..len], &wire);
        assert_eq!(report.emit(&mut buf[..6]), Err(Error::Truncated));

        assert_eq!(FragmentReport::parse(&wire[..3]), Err(Error::Truncated));

        let mut oversized = [0_u8; MAX_FRAGMENT_SIZE + FragmentReport::OVERHEAD + 1];
        oversized[0] = 0x00;
        oversized[1] = 0x01;
        assert_eq!(
            FragmentReport::parse(&oversized),
            Err(Error::PayloadTooLong)
        );
    }

    #[test]
    fn status_report() {
        let report = StatusReport {
            status: UpdateStatus::SuccessRestart,
            wait_time: 30,
        };
        assert_eq!(report.to_be_bytes(), [0xFF, 0x00, 0x1E]);
        assert_eq!(
            StatusReport::from_be_bytes(&report.to_be_bytes()).unwrap(),
            report
        );
        assert!(report.status.is_success());
        assert!(!UpdateStatus::ChecksumError.is_success());
    }

    #[test]
    fn activation_messages() {
        let set = ActivationSet {
            manufacturer_id: 0x0086,
            firmware_id: 0x0001,
            checksum: 0xBEEF,
            target: 1,
            hardware_version: 3,
        };
        assert_eq!(
            set.to_be_bytes(),
            [0x00, 0x86, 0x00, 0x01, 0xBE, 0xEF, 0x01, 0x03]
        );
        assert_eq!(ActivationSet::from_be_bytes(&set.to_be_bytes()).unwrap(), set);

        let report = ActivationStatusReport {
            manufacturer_id: set.manufacturer_id,
            firmware_id: set.firmware_id,
            checksum: set.checksum,
            target: set.target,
            status: ActivationStatus::Completed,
            hardware_version: set.hardware_version,
        };
        let bytes = report.to_be_bytes();
        assert_eq!(bytes[7], 0xFF);
        assert_eq!(ActivationStatusReport::from_be_bytes(&bytes).unwrap(), report);
    }
}
