//! Reassembly of consecutive fragments into one flash write.

use crate::config::MAX_CACHE_SIZE;
use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};
use heapless::Vec;
use static_assertions::const_assert;
use wire_protocols::firmware_update::MAX_FRAGMENT_SIZE;

/// Value of erased NOR flash, used to pad writes to the flash write size
pub const ERASED: u8 = 0xFF;

// A single fragment always fits, even when the batch degrades to one fragment
const_assert!(MAX_FRAGMENT_SIZE <= MAX_CACHE_SIZE);

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum CacheVerdict {
    /// The batch isn't complete yet
    NeedMore,
    /// The batch is complete or the last fragment arrived
    FlushNow,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub struct Overflow;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub struct Flushed {
    /// Offset into the image area
    pub offset: u32,
    /// Image bytes written, not counting the padding
    pub len: usize,
}

/// Buffers up to `reports_in_batch` fragments before handing them to flash
/// in a single write.
///
/// The batch size is `cache_size / fragment_size`. When less than two
/// fragments fit the cache degrades to one write per fragment.
#[derive(Clone, Debug)]
pub struct ReassemblyCache {
    buffer: Vec<u8, MAX_CACHE_SIZE>,
    fragment_size: u16,
    reports_in_batch: u8,
    received: u8,
    last_report: u16,
}

impl ReassemblyCache {
    pub fn new(cache_size: usize, fragment_size: u16) -> Self {
        let fits = cache_size / usize::from(fragment_size.max(1));
        let reports_in_batch = fits.clamp(1, usize::from(u8::MAX)) as u8;
        Self {
            buffer: Vec::new(),
            fragment_size,
            reports_in_batch,
            received: 0,
            last_report: 0,
        }
    }

    pub fn reports_in_batch(&self) -> u8 {
        self.reports_in_batch
    }

    /// Fragments received since the last flush
    pub fn fragments_received(&self) -> u8 {
        self.received
    }

    /// Fragments still expected before the current batch is complete
    pub fn remaining_in_batch(&self) -> u8 {
        self.reports_in_batch - self.received
    }

    pub fn is_direct(&self) -> bool {
        self.reports_in_batch < 2
    }

    /// Non-final fragments must be exactly one fragment size, the final one
    /// may be shorter
    pub fn length_is_valid(&self, len: usize, is_last: bool) -> bool {
        let fragment_size = usize::from(self.fragment_size);
        if is_last {
            len <= fragment_size
        } else {
            len == fragment_size
        }
    }

    /// Stores a validated fragment. The caller guarantees `report_number` is
    /// the successor of the previously accepted one.
    pub fn accept(
        &mut self,
        report_number: u16,
        data: &[u8],
        is_last: bool,
    ) -> Result<CacheVerdict, Overflow> {
        self.buffer.extend_from_slice(data).map_err(|_| Overflow)?;
        self.received += 1;
        self.last_report = report_number;
        trace!(
            "UM: cached report {} ({} of {})",
            report_number,
            self.received,
            self.reports_in_batch
        );

        if is_last || self.received >= self.reports_in_batch {
            Ok(CacheVerdict::FlushNow)
        } else {
            Ok(CacheVerdict::NeedMore)
        }
    }

    /// Writes the cached fragments at
    /// `(last_report - fragments_received) * fragment_size` and empties the cache.
    pub fn flush<F: NorFlash>(&mut self, flash: &mut F) -> Result<Flushed, NorFlashErrorKind> {
        let offset = u32::from(self.last_report - u16::from(self.received))
            * u32::from(self.fragment_size);
        let len = self.buffer.len();
        let padded = round_up(len, F::WRITE_SIZE);

        let res = match self.buffer.resize(padded, ERASED) {
            Ok(()) => flash.write(offset, &self.buffer).map_err(|e| e.kind()),
            Err(()) => Err(NorFlashErrorKind::NotAligned),
        };
        self.buffer.clear();
        self.received = 0;
        res?;

        Ok(Flushed { offset, len })
    }
}

// Round `len` up to the next multiple of `unit`
pub(crate) fn round_up(len: usize, unit: usize) -> usize {
    (len + (unit - 1)) / unit * unit
}
