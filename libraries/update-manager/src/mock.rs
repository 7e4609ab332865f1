//! In-memory collaborators for the unit tests.

use crate::{
    config::{DeviceIdentity, TargetInfo},
    integrity,
    platform::{BootOutcome, Outbound, Platform, RetryTimer, Transport},
    session::{Origin, SecurityClass},
};
use embassy_time::Duration;
use embedded_storage::nor_flash::{
    check_erase, check_read, check_write, ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash,
};
use std::{cell::RefCell, rc::Rc, vec::Vec};
use wire_protocols::{
    firmware_update::{FragmentReport, FragmentSize, RequestGet},
    FirmwareTarget,
};

pub const MANUFACTURER_ID: u16 = 0x0086;
pub const HARDWARE_VERSION: u8 = 1;

pub fn identity() -> DeviceIdentity {
    let mut targets = heapless::Vec::new();
    targets
        .push(TargetInfo {
            firmware_id: 0x0100,
            upgradable: true,
        })
        .unwrap();
    targets
        .push(TargetInfo {
            firmware_id: 0x0200,
            upgradable: false,
        })
        .unwrap();
    DeviceIdentity {
        manufacturer_id: MANUFACTURER_ID,
        hardware_version: HARDWARE_VERSION,
        targets,
    }
}

pub fn origin() -> Origin {
    Origin {
        node_id: 1,
        endpoint: 0,
        security: SecurityClass::S2Authenticated,
    }
}

/// A request for target 0 with 64 byte fragments
pub fn request(checksum: u16) -> RequestGet {
    RequestGet {
        manufacturer_id: MANUFACTURER_ID,
        firmware_id: 0x0100,
        checksum,
        target: 0,
        fragment_size: FragmentSize::Bytes(64),
        hardware_version: HARDWARE_VERSION,
        activation: false,
    }
}

/// A fragment with a valid checksum
pub fn fragment(report_number: u16, last: bool, data: &[u8]) -> FragmentReport {
    let mut report = FragmentReport {
        report_number,
        last,
        data: heapless::Vec::from_slice(data).unwrap(),
        checksum: 0,
    };
    report.checksum = integrity::fragment_checksum(&report);
    report
}

/// Deterministic image content
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

/// Splits `image` into fragments numbered from 1
pub fn fragments(image: &[u8], fragment_size: usize) -> Vec<FragmentReport> {
    let count = image.len().div_ceil(fragment_size).max(1);
    (0..count)
        .map(|i| {
            let start = i * fragment_size;
            let end = (start + fragment_size).min(image.len());
            fragment((i + 1) as u16, i + 1 == count, &image[start..end])
        })
        .collect()
}

#[derive(Debug)]
struct FlashInner {
    data: Vec<u8>,
    writes: Vec<(u32, usize)>,
    erases: Vec<(u32, u32)>,
    fail_writes: bool,
    fail_erases: bool,
}

/// NOR flash with `W` byte write units and 256 byte sectors.
///
/// Clones share the same storage, which lets a test keep a handle while the
/// code under test owns another, and simulates the content surviving a reboot.
#[derive(Clone, Debug)]
pub struct MockFlash<const W: usize> {
    inner: Rc<RefCell<FlashInner>>,
}

impl<const W: usize> MockFlash<W> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(FlashInner {
                data: vec![0xFF; capacity],
                writes: Vec::new(),
                erases: Vec::new(),
                fail_writes: false,
                fail_erases: false,
            })),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.borrow().data.clone()
    }

    /// (offset, length) of every successful write
    pub fn writes(&self) -> Vec<(u32, usize)> {
        self.inner.borrow().writes.clone()
    }

    pub fn erases(&self) -> Vec<(u32, u32)> {
        self.inner.borrow().erases.clone()
    }

    pub fn clear_log(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.writes.clear();
        inner.erases.clear();
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.borrow_mut().fail_writes = fail;
    }

    pub fn fail_erases(&self, fail: bool) {
        self.inner.borrow_mut().fail_erases = fail;
    }
}

impl<const W: usize> ErrorType for MockFlash<W> {
    type Error = NorFlashErrorKind;
}

impl<const W: usize> ReadNorFlash for MockFlash<W> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        let inner = self.inner.borrow();
        let start = offset as usize;
        bytes.copy_from_slice(&inner.data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.inner.borrow().data.len()
    }
}

impl<const W: usize> NorFlash for MockFlash<W> {
    const WRITE_SIZE: usize = W;
    const ERASE_SIZE: usize = 256;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to)?;
        let mut inner = self.inner.borrow_mut();
        if inner.fail_erases {
            return Err(NorFlashErrorKind::Other);
        }
        inner.data[from as usize..to as usize].fill(0xFF);
        inner.erases.push((from, to));
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        let mut inner = self.inner.borrow_mut();
        if inner.fail_writes {
            return Err(NorFlashErrorKind::Other);
        }
        let start = offset as usize;
        // Programming can only clear bits
        for (cell, b) in inner.data[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= *b;
        }
        inner.writes.push((offset, bytes.len()));
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    pub sent: Vec<(Origin, Outbound)>,
    pub fail: bool,
}

impl MockTransport {
    pub fn take(&mut self) -> Vec<(Origin, Outbound)> {
        core::mem::take(&mut self.sent)
    }
}

impl Transport for MockTransport {
    type Error = ();

    fn send(&mut self, to: &Origin, frame: Outbound) -> Result<(), Self::Error> {
        if self.fail {
            return Err(());
        }
        self.sent.push((*to, frame));
        Ok(())
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimerCall {
    Start(Duration),
    Stop,
}

#[derive(Clone, Debug, Default)]
pub struct MockTimer {
    pub calls: Vec<TimerCall>,
    pub armed: Option<Duration>,
}

impl RetryTimer for MockTimer {
    fn start(&mut self, timeout: Duration) {
        self.calls.push(TimerCall::Start(timeout));
        self.armed = Some(timeout);
    }

    fn stop(&mut self) {
        self.calls.push(TimerCall::Stop);
        self.armed = None;
    }
}

#[derive(Clone, Debug)]
pub struct MockPlatform {
    pub authorize: bool,
    pub image_valid: bool,
    pub reboot_fails: bool,
    pub outcome: BootOutcome,
    pub verified: Vec<(FirmwareTarget, u32)>,
    pub reboots: Vec<FirmwareTarget>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self {
            authorize: true,
            image_valid: true,
            reboot_fails: false,
            outcome: BootOutcome::NotApplied,
            verified: Vec::new(),
            reboots: Vec::new(),
        }
    }
}

impl Platform for MockPlatform {
    type Error = ();

    fn authorize_update(&mut self, _origin: &Origin, _request: &RequestGet) -> bool {
        self.authorize
    }

    fn verify_image(&mut self, target: FirmwareTarget, len: u32) -> Result<(), Self::Error> {
        self.verified.push((target, len));
        if self.image_valid {
            Ok(())
        } else {
            Err(())
        }
    }

    fn reboot_into_installer(&mut self, target: FirmwareTarget) -> Result<(), Self::Error> {
        self.reboots.push(target);
        if self.reboot_fails {
            Err(())
        } else {
            Ok(())
        }
    }

    fn boot_outcome(&mut self, _target: FirmwareTarget) -> BootOutcome {
        self.outcome
    }
}
