use core::fmt;

/// Why the MCU came out of reset, as read by the platform at boot.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum ResetReason {
    /// Low-power management reset, a wake-up from deep sleep
    LowPowerReset,
    /// The window watchdog triggered
    WindowWatchdogReset,
    /// The independent watchdog triggered
    IndependentWatchdogReset,
    /// The software did a soft reset, this includes rebooting into the installer
    SoftwareReset,
    /// The mcu went from not having power to having power and resetting
    PowerOnReset,
    /// The reset pin was asserted
    PinReset,
    /// The brownout detector triggered
    BrownoutReset,
    /// The reason could not be determined, contains the raw reset flags
    Unknown(u32),
}

impl ResetReason {
    /// A persisted update session is only picked up again after one of these.
    /// A sleep wake-up keeps RAM state and an unknown cause isn't trusted.
    pub fn is_uncontrolled(&self) -> bool {
        matches!(
            self,
            ResetReason::WindowWatchdogReset
                | ResetReason::IndependentWatchdogReset
                | ResetReason::SoftwareReset
                | ResetReason::PowerOnReset
                | ResetReason::PinReset
                | ResetReason::BrownoutReset
        )
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetReason::LowPowerReset => f.write_str("Low-power management reset"),
            ResetReason::WindowWatchdogReset => f.write_str("WWDG reset"),
            ResetReason::IndependentWatchdogReset => f.write_str("IWDG reset"),
            ResetReason::SoftwareReset => f.write_str("Software reset"),
            ResetReason::PowerOnReset => f.write_str("Power-on reset"),
            ResetReason::PinReset => f.write_str("Pin reset (NRST)"),
            ResetReason::BrownoutReset => f.write_str("Brownout reset"),
            ResetReason::Unknown(flags) => write!(
                f,
                "Could not determine the cause. Reset flags were 0x{:X}",
                flags
            ),
        }
    }
}
