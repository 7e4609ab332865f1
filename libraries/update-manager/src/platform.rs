//! Collaborators the engine drives but doesn't own the implementation of.

use crate::session::Origin;
use core::fmt::Debug;
use embassy_time::Duration;
use wire_protocols::{
    firmware_update::{ActivationStatusReport, FragmentGet, RequestGet, RequestReport, StatusReport},
    FirmwareTarget,
};

/// Messages the device sends to the initiator
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, defmt::Format)]
pub enum Outbound {
    RequestReport(RequestReport),
    FragmentGet(FragmentGet),
    StatusReport(StatusReport),
    ActivationStatusReport(ActivationStatusReport),
}

/// Link towards the initiator.
///
/// `send` only queues the frame. Whether it was acknowledged comes back
/// through `Event::TxComplete`.
pub trait Transport {
    type Error: Debug + defmt::Format;

    fn send(&mut self, to: &Origin, frame: Outbound) -> Result<(), Self::Error>;
}

/// Single one-shot timer. Expiry comes back through `Event::TimerExpired`.
pub trait RetryTimer {
    /// (Re)starts the timer, an armed timer is stopped first
    fn start(&mut self, timeout: Duration);

    /// Idempotent
    fn stop(&mut self);
}

/// What the bootloader did with a staged image, read after the reboot
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum BootOutcome {
    /// The image wasn't swapped in yet
    NotApplied,
    /// The new image is running
    Applied,
    /// The bootloader refused the image or rolled it back
    Rejected,
}

/// Bootloader and application hooks
pub trait Platform {
    type Error: Debug;

    /// Lets the application refuse an otherwise valid request
    fn authorize_update(&mut self, _origin: &Origin, _request: &RequestGet) -> bool {
        true
    }

    /// Checks the `len` bytes staged for `target`, e.g. the image signature
    fn verify_image(&mut self, target: FirmwareTarget, len: u32) -> Result<(), Self::Error>;

    /// Marks the staged image for installation and resets. Returning means
    /// the reboot didn't happen.
    fn reboot_into_installer(&mut self, target: FirmwareTarget) -> Result<(), Self::Error>;

    fn boot_outcome(&mut self, target: FirmwareTarget) -> BootOutcome;
}
