//! Per-session transfer bookkeeping.

use crate::{
    cache::{CacheVerdict, Flushed, Overflow, ReassemblyCache},
    config::{Config, DeviceIdentity, FRAGMENT_ALIGNMENT},
    integrity::{self, RunningChecksum},
    persist::{Phase, PersistedRecord},
    request::RequestController,
};
use core::fmt;
use embedded_storage::nor_flash::{NorFlash, NorFlashErrorKind};
use wire_protocols::firmware_update::{
    FragmentGet, FragmentReport, FragmentSize, RequestGet, RequestStatus,
};
use wire_protocols::FirmwareTarget;

pub type NodeId = u16;
pub type Endpoint = u8;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum State {
    Idle,
    /// Request accepted, waiting for the transport to confirm the answer went out
    Ready,
    /// Waiting for the fragments of the outstanding `FragmentGet`
    AwaitReport,
    /// Image verified and staged, waiting for an activation
    AwaitTimeout,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Security context the request arrived with, reports go back under the same one
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum SecurityClass {
    None,
    S0,
    S2Unauthenticated,
    S2Authenticated,
    S2AccessControl,
    Unknown(u8),
}

impl From<u8> for SecurityClass {
    fn from(value: u8) -> Self {
        use SecurityClass::*;
        match value {
            0x00 => None,
            0x01 => S0,
            0x02 => S2Unauthenticated,
            0x03 => S2Authenticated,
            0x04 => S2AccessControl,
            _ => Unknown(value),
        }
    }
}

impl From<SecurityClass> for u8 {
    fn from(value: SecurityClass) -> Self {
        use SecurityClass::*;
        match value {
            None => 0x00,
            S0 => 0x01,
            S2Unauthenticated => 0x02,
            S2Authenticated => 0x03,
            S2AccessControl => 0x04,
            Unknown(v) => v,
        }
    }
}

/// Who started the session
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, defmt::Format)]
pub struct Origin {
    pub node_id: NodeId,
    pub endpoint: Endpoint,
    pub security: SecurityClass,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} endpoint {} ({:?})",
            self.node_id, self.endpoint, self.security
        )
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum Defect {
    BadChecksum,
    /// Report numbers start at 1
    ZeroReportNumber,
    OutOfSequence,
    BadLength,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum FragmentCheck {
    /// The fragment is the successor of the last accepted one
    Accept,
    /// Already accepted, dropped without any effect
    Duplicate,
    Defect(Defect),
}

/// Checks a `RequestGet` against this device and resolves the fragment size.
///
/// The negotiated size is at most `config.max_fragment_size`, a multiple of 4
/// and a multiple of the image flash write size so every batch starts aligned.
pub fn negotiate(
    request: &RequestGet,
    identity: &DeviceIdentity,
    config: &Config,
    write_size: usize,
) -> Result<u16, RequestStatus> {
    let target = identity
        .target(request.target)
        .ok_or(RequestStatus::NotUpgradable)?;
    if !identity.matches(request.manufacturer_id, request.firmware_id, request.target) {
        return Err(RequestStatus::InvalidCombination);
    }
    if !target.upgradable {
        return Err(RequestStatus::NotUpgradable);
    }
    if request.hardware_version != identity.hardware_version {
        return Err(RequestStatus::InvalidHardwareVersion);
    }

    let size = match request.fragment_size {
        FragmentSize::Maximum => config.max_fragment_size,
        FragmentSize::Bytes(s) => s,
    };
    if size == 0
        || size > config.max_fragment_size
        || size % FRAGMENT_ALIGNMENT != 0
        || usize::from(size) % write_size.max(1) != 0
    {
        return Err(RequestStatus::InvalidFragmentSize);
    }
    Ok(size)
}

/// State of one accepted transfer, dropped when the session ends
#[derive(Clone, Debug)]
pub struct UpdateSession {
    origin: Origin,
    target: FirmwareTarget,
    expected_checksum: u16,
    activation_requested: bool,
    fragment_size: u16,
    last_report_number: u16,
    running: RunningChecksum,
    requests: RequestController,
    cache: ReassemblyCache,
    bytes_written: u32,
}

impl UpdateSession {
    pub fn new(origin: Origin, request: &RequestGet, fragment_size: u16, config: &Config) -> Self {
        Self {
            origin,
            target: request.target,
            expected_checksum: request.checksum,
            activation_requested: request.activation,
            fragment_size,
            last_report_number: 0,
            running: RunningChecksum::new(),
            requests: RequestController::new(config),
            cache: ReassemblyCache::new(config.cache_size, fragment_size),
            bytes_written: 0,
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn target(&self) -> FirmwareTarget {
        self.target
    }

    pub fn expected_checksum(&self) -> u16 {
        self.expected_checksum
    }

    pub fn activation_requested(&self) -> bool {
        self.activation_requested
    }

    pub fn fragment_size(&self) -> u16 {
        self.fragment_size
    }

    pub fn last_report_number(&self) -> u16 {
        self.last_report_number
    }

    pub fn running_checksum(&self) -> u16 {
        self.running.value()
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    pub fn requests(&self) -> &RequestController {
        &self.requests
    }

    pub fn requests_mut(&mut self) -> &mut RequestController {
        &mut self.requests
    }

    pub fn cache(&self) -> &ReassemblyCache {
        &self.cache
    }

    pub fn record(&self, phase: Phase) -> PersistedRecord {
        PersistedRecord {
            origin: self.origin,
            target: self.target,
            expected_checksum: self.expected_checksum,
            activation_requested: self.activation_requested,
            success_reported: false,
            phase,
        }
    }

    /// Classifies an incoming fragment, nothing is mutated
    pub fn check_fragment(&self, report: &FragmentReport) -> FragmentCheck {
        if !integrity::fragment_is_intact(report) {
            FragmentCheck::Defect(Defect::BadChecksum)
        } else if report.report_number == 0 {
            FragmentCheck::Defect(Defect::ZeroReportNumber)
        } else if report.report_number <= self.last_report_number {
            FragmentCheck::Duplicate
        } else if report.report_number != self.last_report_number + 1 {
            FragmentCheck::Defect(Defect::OutOfSequence)
        } else if !self.cache.length_is_valid(report.data.len(), report.last) {
            FragmentCheck::Defect(Defect::BadLength)
        } else {
            FragmentCheck::Accept
        }
    }

    /// Takes a fragment that passed `check_fragment`: folds it into the
    /// running checksum, advances the report number and caches the payload.
    pub fn accept_fragment(&mut self, report: &FragmentReport) -> Result<CacheVerdict, Overflow> {
        let verdict = self
            .cache
            .accept(report.report_number, &report.data, report.last)?;
        self.running = self.running.fold(&report.data);
        self.last_report_number = report.report_number;
        self.requests.on_valid_fragment();
        Ok(verdict)
    }

    pub fn image_is_intact(&self) -> bool {
        self.running.finalize_and_compare(self.expected_checksum)
    }

    pub fn flush<F: NorFlash>(&mut self, flash: &mut F) -> Result<Flushed, NorFlashErrorKind> {
        let flushed = self.cache.flush(flash)?;
        self.bytes_written += flushed.len as u32;
        Ok(flushed)
    }

    /// The request for the rest of the current batch
    pub fn next_get(&self) -> FragmentGet {
        FragmentGet {
            reports: self.cache.remaining_in_batch(),
            report_number: self.last_report_number + 1,
        }
    }
}
