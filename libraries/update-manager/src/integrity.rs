//! Image and fragment checksums.
//!
//! Both use CRC-16/AUG-CCITT: polynomial 0x1021, seed 0x1D0F, no reflection
//! and no final xor. Since there is no final xor the running value of a
//! partially folded image is the checksum of the bytes folded so far.

use core::fmt;
use crc::{Crc, Digest, CRC_16_SPI_FUJITSU};
use wire_protocols::firmware_update::FragmentReport;

static CRC_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_SPI_FUJITSU);

/// Checksum of a complete buffer
pub fn checksum(bytes: &[u8]) -> u16 {
    CRC_CCITT.checksum(bytes)
}

/// Checksum carried by a `FragmentReport`, covering its report field and payload
pub fn fragment_checksum(report: &FragmentReport) -> u16 {
    let mut digest = CRC_CCITT.digest();
    digest.update(&report.report_field().to_be_bytes());
    digest.update(&report.data);
    digest.finalize()
}

pub fn fragment_is_intact(report: &FragmentReport) -> bool {
    fragment_checksum(report) == report.checksum
}

/// Whole-image checksum, folded one fragment at a time.
///
/// Folding is order dependent, fragments must be folded in ascending
/// report number order.
#[derive(Clone)]
pub struct RunningChecksum {
    digest: Digest<'static, u16>,
}

impl RunningChecksum {
    pub fn new() -> Self {
        Self {
            digest: CRC_CCITT.digest(),
        }
    }

    /// Returns the checksum with `bytes` folded in, `self` is left untouched
    pub fn fold(&self, bytes: &[u8]) -> Self {
        let mut next = self.clone();
        next.digest.update(bytes);
        next
    }

    pub fn value(&self) -> u16 {
        self.digest.clone().finalize()
    }

    pub fn finalize_and_compare(&self, expected: u16) -> bool {
        self.value() == expected
    }
}

impl Default for RunningChecksum {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RunningChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunningChecksum(0x{:04X})", self.value())
    }
}
