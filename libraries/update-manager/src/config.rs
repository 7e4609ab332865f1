use core::fmt;
use embassy_time::Duration;
use heapless::Vec;
use static_assertions::const_assert;
use wire_protocols::{
    firmware_update::MAX_FRAGMENT_SIZE, FirmwareId, FirmwareTarget, HardwareVersion,
    ManufacturerId,
};

/// Largest reassembly cache the engine can be configured with
pub const MAX_CACHE_SIZE: usize = 2048;

/// Number of firmware targets a device can advertise
pub const MAX_TARGETS: usize = 4;

/// Fragments are written straight to flash, keep them word aligned
pub const FRAGMENT_ALIGNMENT: u16 = 4;

pub const DEFAULT_MAX_FRAGMENT_SIZE: u16 = 64;
pub const DEFAULT_CACHE_SIZE: usize = 512;
pub const DEFAULT_MAX_RETRIES: u8 = 10;
pub const DEFAULT_BASE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_RETRY_INCREMENT_MS: u64 = 1_000;
/// Gives the link layer time to ack the last frame before the reboot
pub const DEFAULT_INSTALL_DELAY_MS: u64 = 500;
pub const DEFAULT_RESTART_WAIT_TIME_SEC: u16 = 30;

const_assert!(MAX_FRAGMENT_SIZE % FRAGMENT_ALIGNMENT as usize == 0);
const_assert!(DEFAULT_MAX_FRAGMENT_SIZE as usize <= MAX_FRAGMENT_SIZE);
const_assert!(DEFAULT_MAX_FRAGMENT_SIZE % FRAGMENT_ALIGNMENT == 0);
const_assert!(DEFAULT_CACHE_SIZE <= MAX_CACHE_SIZE);

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum ConfigError {
    FragmentSizeZero,
    FragmentSizeNotMultiple4,
    FragmentSizeTooLong,
    CacheTooLarge,
    NoRetries,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FragmentSizeZero => f.write_str("Maximum fragment size is zero"),
            ConfigError::FragmentSizeNotMultiple4 => {
                f.write_str("Maximum fragment size is not a multiple of 4")
            }
            ConfigError::FragmentSizeTooLong => write!(
                f,
                "Maximum fragment size exceeds {} bytes",
                MAX_FRAGMENT_SIZE
            ),
            ConfigError::CacheTooLarge => {
                write!(f, "Cache size exceeds {} bytes", MAX_CACHE_SIZE)
            }
            ConfigError::NoRetries => f.write_str("Retry limit is zero"),
        }
    }
}

/// Runtime tunables of the transfer engine.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Config {
    /// Largest fragment payload this device accepts, also used when the
    /// initiator asks for the maximum
    pub max_fragment_size: u16,
    /// Reassembly cache capacity in bytes, the batch size is
    /// `cache_size / fragment_size`
    pub cache_size: usize,
    /// Consecutive retries before the session is given up
    pub max_retries: u8,
    /// Fragment request timeout before any retry
    pub base_timeout: Duration,
    /// Added to the request timeout for every retry
    pub retry_increment: Duration,
    /// Delay between scheduling an install and rebooting into the installer
    pub install_delay: Duration,
    /// Wait-time hint sent along with a successful status report
    pub restart_wait_time_sec: u16,
    /// Reboot into the installer on our own once an image is verified.
    /// When false the application raises `Event::InstallNow` itself.
    pub restart_after_update: bool,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            base_timeout: Duration::from_millis(DEFAULT_BASE_TIMEOUT_MS),
            retry_increment: Duration::from_millis(DEFAULT_RETRY_INCREMENT_MS),
            install_delay: Duration::from_millis(DEFAULT_INSTALL_DELAY_MS),
            restart_wait_time_sec: DEFAULT_RESTART_WAIT_TIME_SEC,
            restart_after_update: true,
        }
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        if self.max_fragment_size == 0 {
            Err(ConfigError::FragmentSizeZero)
        } else if self.max_fragment_size % FRAGMENT_ALIGNMENT != 0 {
            Err(ConfigError::FragmentSizeNotMultiple4)
        } else if self.max_fragment_size as usize > MAX_FRAGMENT_SIZE {
            Err(ConfigError::FragmentSizeTooLong)
        } else if self.cache_size > MAX_CACHE_SIZE {
            Err(ConfigError::CacheTooLarge)
        } else if self.max_retries == 0 {
            Err(ConfigError::NoRetries)
        } else {
            Ok(())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, defmt::Format)]
pub struct TargetInfo {
    pub firmware_id: FirmwareId,
    /// Whether the image of this target can be replaced over the air
    pub upgradable: bool,
}

/// What the device reports about itself, requests and activations are
/// matched against it.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DeviceIdentity {
    pub manufacturer_id: ManufacturerId,
    pub hardware_version: HardwareVersion,
    /// Index 0 is the primary application
    pub targets: Vec<TargetInfo, MAX_TARGETS>,
}

impl DeviceIdentity {
    pub fn target(&self, target: FirmwareTarget) -> Option<&TargetInfo> {
        self.targets.get(target as usize)
    }

    /// True when the manufacturer and the firmware id of `target` match
    pub fn matches(
        &self,
        manufacturer_id: ManufacturerId,
        firmware_id: FirmwareId,
        target: FirmwareTarget,
    ) -> bool {
        self.manufacturer_id == manufacturer_id
            && self
                .target(target)
                .map(|t| t.firmware_id == firmware_id)
                .unwrap_or(false)
    }
}
